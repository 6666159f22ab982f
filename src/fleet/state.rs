//! The worker fleet and the dispatch policy: who is free, who holds what,
//! which worker runs which thunk.

use std::cell::{Ref, RefCell, RefMut};
use std::collections::{BTreeSet, HashMap, HashSet, VecDeque};
use std::net::SocketAddr;
use std::rc::Rc;

use base64;
use serde_cbor;

use common::id::{BlobHash, WorkerId};
use errors::{Result, ResultExt};
use exec::ExecutionLoop;
use net::connection::ConnectionRef;
use proto::messages::{self, ExecutedMsg, PutMsg};
use proto::{Message, MessageParser, OpCode};
use store::BlobStore;
use thunk::Thunk;
use MAX_PAYLOAD_SIZE;

use super::worker::{Worker, WorkerState};

/// How `pick_worker` chooses among the free workers.
#[derive(Clone, Copy, Debug, PartialEq, Eq)]
pub enum SelectionStrategy {
    /// Smallest-id free worker.
    First,
    /// Prefer a free worker that already holds the thunk's largest
    /// dependency; fall back to `First`.
    LargestObject,
}

/// Launches a fresh worker which will dial `coordinator` back once it is
/// up. Fire-and-forget: the accept path is the success signal.
pub trait WorkerLauncher {
    fn launch(&self, exec_loop: &ExecutionLoop, coordinator: &SocketAddr) -> Result<()>;
}

/// Fleet-wide completion callback: (thunk hash, primary output hash,
/// estimated cost). Installed once at construction; it may re-enter
/// `force_thunk`.
pub type SuccessCallback = Rc<dyn Fn(&str, &str, u64)>;

pub struct State {
    pub(super) listen_addr: Option<SocketAddr>,
    pub(super) workers: HashMap<WorkerId, Worker>,
    /// Ids of idle workers, ascending; "first" means smallest id.
    pub(super) free_workers: BTreeSet<WorkerId>,
    /// Thunks submitted while nothing was free, waiting for a fresh
    /// worker to dial in. FIFO.
    pub(super) thunk_queue: VecDeque<Thunk>,
    pub(super) next_worker_id: WorkerId,
    pub(super) running_jobs: usize,
    pub(super) store: Rc<dyn BlobStore>,
    pub(super) launcher: Rc<dyn WorkerLauncher>,
    pub(super) on_success: SuccessCallback,
}

/// Shared handle onto the fleet. The listener, every per-worker read
/// callback and the embedding application each hold one; they all mutate
/// the same dispatch state from the loop thread.
#[derive(Clone)]
pub struct StateRef {
    inner: Rc<RefCell<State>>,
}

impl State {
    /// Smallest-id free worker, or the best cache match under
    /// `LargestObject`. The free set must not be empty.
    pub fn pick_worker(&self, thunk: &Thunk, strategy: SelectionStrategy) -> Result<WorkerId> {
        let first = match self.free_workers.iter().next() {
            Some(&id) => id,
            None => bail!("no free workers to pick from"),
        };
        match strategy {
            SelectionStrategy::First => Ok(first),
            SelectionStrategy::LargestObject => {
                let mut largest_hash: Option<&BlobHash> = None;
                let mut largest_size = 0u32;
                for &(ref hash, _) in thunk.dependencies() {
                    let size = self.store.size(hash);
                    if size > largest_size {
                        largest_size = size;
                        largest_hash = Some(hash);
                    }
                }
                if let Some(hash) = largest_hash {
                    for &id in &self.free_workers {
                        if self.workers[&id].objects.contains(hash) {
                            return Ok(id);
                        }
                    }
                }
                Ok(first)
            }
        }
    }

    /// Admission rule: thunks at or above the payload ceiling can never
    /// be dispatched.
    pub fn can_execute(&self, thunk: &Thunk) -> bool {
        thunk.infiles_size < MAX_PAYLOAD_SIZE
    }

    pub fn job_count(&self) -> usize {
        self.running_jobs
    }

    /// Validate the free-set/worker-state bookkeeping.
    pub fn check_consistency(&self) -> Result<()> {
        for id in &self.free_workers {
            match self.workers.get(id) {
                Some(worker) if worker.state == WorkerState::Idle => {}
                Some(_) => bail!("free worker {} is not idle", id),
                None => bail!("free set contains unknown worker {}", id),
            }
        }
        let busy = self
            .workers
            .values()
            .filter(|w| w.state == WorkerState::Busy)
            .count();
        if busy + self.free_workers.len() != self.workers.len() {
            bail!(
                "worker accounting mismatch: {} busy, {} free, {} total",
                busy,
                self.free_workers.len(),
                self.workers.len()
            );
        }
        // Disconnects of busy workers may leave running_jobs elevated,
        // so the count is a lower bound only.
        if busy + self.thunk_queue.len() > self.running_jobs {
            bail!(
                "running job accounting mismatch: {} busy, {} queued, {} running",
                busy,
                self.thunk_queue.len(),
                self.running_jobs
            );
        }
        Ok(())
    }
}

impl StateRef {
    pub fn new(
        store: Rc<dyn BlobStore>,
        launcher: Rc<dyn WorkerLauncher>,
        on_success: SuccessCallback,
    ) -> StateRef {
        StateRef {
            inner: Rc::new(RefCell::new(State {
                listen_addr: None,
                workers: HashMap::new(),
                free_workers: BTreeSet::new(),
                thunk_queue: VecDeque::new(),
                next_worker_id: 0,
                running_jobs: 0,
                store,
                launcher,
                on_success,
            })),
        }
    }

    /// Borrow the fleet state. Panics if a mutable borrow is live;
    /// callbacks release their borrow before invoking user code.
    pub fn get(&self) -> Ref<State> {
        self.inner.borrow()
    }

    pub fn get_mut(&self) -> RefMut<State> {
        self.inner.borrow_mut()
    }

    /// Bind the worker listen endpoint and start accepting. Returns the
    /// bound address; it is the one published to launched workers.
    pub fn start(&self, exec_loop: &ExecutionLoop, listen_addr: &SocketAddr) -> Result<SocketAddr> {
        let fleet = self.clone();
        let accept_loop = exec_loop.clone();
        let (_, bound) = exec_loop.make_listener(
            listen_addr,
            Box::new(move |conn| fleet.on_worker_connected(&accept_loop, conn)),
        )?;
        self.get_mut().listen_addr = Some(bound);
        info!("listening for workers on {}", bound);
        Ok(bound)
    }

    /// Request execution of a thunk. Dispatches to a free worker when one
    /// exists; otherwise queues the thunk and launches a fresh worker.
    pub fn force_thunk(&self, exec_loop: &ExecutionLoop, thunk: Thunk) -> Result<()> {
        info!("force {}", thunk.hash);
        let picked = {
            let mut state = self.get_mut();
            state.running_jobs += 1;
            if state.free_workers.is_empty() {
                None
            } else {
                Some(state.pick_worker(&thunk, SelectionStrategy::LargestObject)?)
            }
        };
        match picked {
            Some(id) => self.prepare_worker(id, &thunk),
            None => {
                let (launcher, coordinator) = {
                    let mut state = self.get_mut();
                    state.thunk_queue.push_back(thunk);
                    let coordinator = match state.listen_addr {
                        Some(addr) => addr,
                        None => bail!("fleet is not listening yet"),
                    };
                    (state.launcher.clone(), coordinator)
                };
                launcher.launch(exec_loop, &coordinator)
            }
        }
    }

    pub fn can_execute(&self, thunk: &Thunk) -> bool {
        self.get().can_execute(thunk)
    }

    pub fn job_count(&self) -> usize {
        self.get().job_count()
    }

    fn on_worker_connected(&self, exec_loop: &ExecutionLoop, conn: ConnectionRef) -> Result<bool> {
        let id = {
            let mut state = self.get_mut();
            let id = state.next_worker_id;
            state.next_worker_id += 1;
            state.workers.insert(id, Worker::new(id, conn.clone()));
            state.free_workers.insert(id);
            id
        };
        match conn.get().peer_addr() {
            Some(peer) => info!("worker {} connected from {}", id, peer),
            None => info!("worker {} connected", id),
        }

        let parser = Rc::new(RefCell::new(MessageParser::new()));
        let fleet = self.clone();
        let fleet_close = self.clone();
        exec_loop.add_connection(
            &conn,
            Box::new(move |data| fleet.on_worker_data(id, &parser, data)),
            Box::new(move || warn!("worker {}: connection error", id)),
            Box::new(move || fleet_close.on_worker_closed(id)),
        );

        // The reader is registered; a queued thunk may now be handed to
        // this worker as the first thing it ever receives.
        let queued = self.get_mut().thunk_queue.pop_front();
        if let Some(thunk) = queued {
            self.prepare_worker(id, &thunk)?;
        }
        Ok(true)
    }

    fn on_worker_data(
        &self,
        id: WorkerId,
        parser: &Rc<RefCell<MessageParser>>,
        data: &[u8],
    ) -> Result<bool> {
        let mut parser = parser.borrow_mut();
        parser.parse(data)?;
        while let Some(message) = parser.pop() {
            self.handle_worker_message(id, &message)?;
        }
        Ok(true)
    }

    /// Dispatch one framed message from worker `id`.
    pub fn handle_worker_message(&self, id: WorkerId, message: &Message) -> Result<()> {
        match message.opcode {
            OpCode::Hey => {
                info!(
                    "worker {}: hey: {}",
                    id,
                    String::from_utf8_lossy(&message.payload)
                );
            }
            OpCode::Put => {
                let hash = self.handle_put(&message.payload)?;
                info!("worker {}: put {}", id, hash);
            }
            OpCode::Executed => self.apply_executed(id, &message.payload)?,
            opcode => bail!("unexpected opcode {:?} from worker {}", opcode, id),
        }
        Ok(())
    }

    /// A blob upload from a worker: materialize it in the store.
    fn handle_put(&self, payload: &[u8]) -> Result<BlobHash> {
        let msg: PutMsg = serde_cbor::from_slice(payload)?;
        let store = self.get().store.clone();
        store.atomic_create(&msg.data, &store.blob_path(&msg.hash))?;
        Ok(msg.hash)
    }

    /// A worker finished its thunk: record the outputs, return the worker
    /// to the free set and fire the fleet-wide success callback.
    fn apply_executed(&self, id: WorkerId, payload: &[u8]) -> Result<()> {
        let response: ExecutedMsg = serde_cbor::from_slice(payload)?;
        if response.outputs.is_empty() {
            bail!("executed report without outputs from worker {}", id);
        }
        info!("worker {}: executed {}", id, response.thunk_hash);

        let store = self.get().store.clone();
        for output in &response.outputs {
            store.insert(
                &store.output_key(&response.thunk_hash, &output.tag),
                &output.hash,
            );
            store.set_available(&output.hash);
            if let Some(ref data) = output.data {
                let bytes = base64::decode(data).chain_err(|| "malformed inline output data")?;
                store.atomic_create(&bytes, &store.blob_path(&output.hash))?;
            }
        }
        store.insert(&response.thunk_hash, &response.outputs[0].hash);

        let on_success = {
            let mut state = self.get_mut();
            match state.workers.get_mut(&id) {
                Some(worker) => worker.state = WorkerState::Idle,
                None => bail!("executed report from unknown worker {}", id),
            }
            state.free_workers.insert(id);
            state.running_jobs -= 1;
            state.on_success.clone()
        };
        // The fleet borrow is released; the callback may immediately
        // force another thunk.
        (*on_success)(&response.thunk_hash, &response.outputs[0].hash, 0);
        Ok(())
    }

    /// Push missing dependencies and the execute order to a worker,
    /// marking it busy.
    fn prepare_worker(&self, id: WorkerId, thunk: &Thunk) -> Result<()> {
        debug!("preparing worker {} for {}", id, thunk.hash);
        let (connection, frames) = {
            let mut state = self.get_mut();
            let store = state.store.clone();
            let worker = match state.workers.get_mut(&id) {
                Some(worker) => worker,
                None => bail!("prepare for unknown worker {}", id),
            };

            let mut frames: Vec<Vec<u8>> = Vec::new();
            let mut new_objects = HashSet::new();
            for &(ref hash, _) in thunk.dependencies() {
                if !worker.objects.contains(hash) && !store.is_available(hash) {
                    let data = store.read_blob(hash)?;
                    frames.push(messages::put_frame(hash, &data)?);
                    worker.objects.insert(hash.clone());
                }
                new_objects.insert(hash.clone());
            }
            // The record of what the worker holds is scoped to this
            // thunk's dependency set; earlier entries are dropped here.
            worker.objects = new_objects;

            frames.push(messages::execute_frame(thunk)?);
            worker.state = WorkerState::Busy;
            let connection = worker.connection.clone();
            state.free_workers.remove(&id);
            (connection, frames)
        };
        // Shared write buffer: every Put lands before the Execute.
        for frame in frames {
            connection.enqueue_write(&frame);
        }
        Ok(())
    }

    /// The worker's session ended. The record goes away; a thunk it was
    /// running is orphaned (running_jobs stays elevated, nothing is
    /// retried).
    fn on_worker_closed(&self, id: WorkerId) {
        let mut state = self.get_mut();
        if let Some(worker) = state.workers.remove(&id) {
            state.free_workers.remove(&id);
            match worker.state {
                WorkerState::Busy => {
                    warn!("worker {} disconnected while busy; its thunk is orphaned", id)
                }
                WorkerState::Idle => info!("worker {} disconnected", id),
            }
        }
    }
}
