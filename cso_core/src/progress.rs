/// Receives `(done, total)` block counts while a file is encoded or decoded.
///
/// Parallel decoding calls `update` from worker threads, so counts can arrive
/// slightly out of order. Implementations must return quickly.
pub trait Progress: Sync {
    fn update(&self, done: u64, total: u64);
}

/// Discards every update.
pub struct NoProgress;

impl Progress for NoProgress {
    fn update(&self, _done: u64, _total: u64) {}
}

impl<F> Progress for F
where
    F: Fn(u64, u64) + Sync,
{
    fn update(&self, done: u64, total: u64) {
        self(done, total)
    }
}
