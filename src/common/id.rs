/// Type identifying a connected worker. Assigned from a monotonic
/// per-coordinator counter when the worker's connection is accepted.
pub type WorkerId = u64;

/// Content hash naming a blob in the store. Blobs are immutable and
/// addressed only by this hash.
pub type BlobHash = String;
