//! The thunk data model, as far as the coordinator needs to see it.
//!
//! A thunk is a content-addressed, deterministic compute unit. The
//! coordinator never looks inside: it needs the hash, the admission size,
//! and the dependency listings for the push/locality machinery. On the
//! wire a thunk travels as the CBOR payload of an `Execute` frame.

use common::id::BlobHash;

#[derive(Clone, Debug, PartialEq, Serialize, Deserialize)]
#[serde(rename_all = "camelCase")]
#[serde(deny_unknown_fields)]
pub struct Thunk {
    /// Content hash of the thunk itself.
    pub hash: BlobHash,
    /// Total size of all input blobs, used for admission control.
    pub infiles_size: u64,
    /// Value dependencies: (blob hash, target filename).
    pub values: Vec<(BlobHash, String)>,
    /// Executable dependencies: (blob hash, target filename).
    pub executables: Vec<(BlobHash, String)>,
}

impl Thunk {
    /// All dependencies in push order: values first, then executables.
    pub fn dependencies(&self) -> impl Iterator<Item = &(BlobHash, String)> {
        self.values.iter().chain(self.executables.iter())
    }
}
