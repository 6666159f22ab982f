use std::collections::HashSet;
use std::fmt;

use common::id::{BlobHash, WorkerId};
use net::connection::ConnectionRef;

#[derive(Clone, Copy, Debug, PartialEq, Eq)]
pub enum WorkerState {
    Idle,
    Busy,
}

/// Coordinator-side record of one connected worker.
pub struct Worker {
    pub(super) id: WorkerId,

    /// The worker's session; owned by the fleet for the worker's lifetime.
    pub(super) connection: ConnectionRef,

    pub(super) state: WorkerState,

    /// Conservative record of blobs this worker has been offered. May
    /// underestimate what the worker holds, never overestimates.
    pub(super) objects: HashSet<BlobHash>,
}

impl Worker {
    pub fn new(id: WorkerId, connection: ConnectionRef) -> Self {
        Worker {
            id,
            connection,
            state: WorkerState::Idle,
            objects: HashSet::new(),
        }
    }

    pub fn id(&self) -> WorkerId {
        self.id
    }

    pub fn state(&self) -> WorkerState {
        self.state
    }

    pub fn objects(&self) -> &HashSet<BlobHash> {
        &self.objects
    }
}

impl fmt::Debug for Worker {
    fn fmt(&self, f: &mut fmt::Formatter) -> fmt::Result {
        f.debug_struct("Worker")
            .field("id", &self.id)
            .field("state", &self.state)
            .field("objects", &self.objects)
            .finish()
    }
}
