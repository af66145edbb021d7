//! Job cancellation: one fresh token plus generation number per job.
//! A job whose generation is no longer current must not record its result.

use std::sync::atomic::{AtomicU64, Ordering};
use std::sync::Arc;

use parking_lot::RwLock;
use tokio_util::sync::CancellationToken;

/// Issues per-job tokens. Starting a job or cancelling the current one
/// invalidates everything issued before.
pub struct JobCancellation {
    current_token: RwLock<CancellationToken>,
    generation: Arc<AtomicU64>,
}

impl Default for JobCancellation {
    fn default() -> Self {
        Self::new()
    }
}

impl JobCancellation {
    pub fn new() -> Self {
        Self {
            current_token: RwLock::new(CancellationToken::new()),
            generation: Arc::new(AtomicU64::new(0)),
        }
    }

    /// Cancel the previous job, advance the generation and hand out a guard
    /// for the next one.
    pub fn start_job(&self) -> JobGuard {
        let mut token_guard = self.current_token.write();
        token_guard.cancel();
        let new_root = CancellationToken::new();
        let child = new_root.child_token();
        *token_guard = new_root;
        let generation = self.generation.fetch_add(1, Ordering::SeqCst) + 1;
        JobGuard {
            generation: Arc::clone(&self.generation),
            my_generation: generation,
            token: child,
        }
    }

    /// Cancel the running job without starting another.
    pub fn cancel_current(&self) {
        self.current_token.read().cancel();
    }

    pub fn current_generation(&self) -> u64 {
        self.generation.load(Ordering::SeqCst)
    }
}

/// Checked by a job before it writes results back into the queue.
#[derive(Clone)]
pub struct JobGuard {
    generation: Arc<AtomicU64>,
    my_generation: u64,
    token: CancellationToken,
}

impl JobGuard {
    #[inline]
    pub fn is_current(&self) -> bool {
        self.generation.load(Ordering::SeqCst) == self.my_generation
    }

    #[inline]
    pub fn is_cancelled(&self) -> bool {
        self.token.is_cancelled()
    }

    pub fn token(&self) -> &CancellationToken {
        &self.token
    }

    pub fn my_generation(&self) -> u64 {
        self.my_generation
    }
}
