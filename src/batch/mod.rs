//! Concurrent per-key execution with generation safety, background retries and a
//! cross-generation cache.

pub mod cache;
pub mod retry;
pub mod runner;

use std::sync::{Mutex, MutexGuard, PoisonError};

pub use cache::{CachedBatch, WorkflowCache};
pub use retry::{
    DEFAULT_MAX_ATTEMPTS, DEFAULT_RETRY_DELAY, EffectiveResult, RetryCoordinator, RetryOrigin,
    RetryState, SuccessHook, Timer, TokioTimer,
};
pub use runner::{BatchRunner, BatchSnapshot, DEFAULT_CONCURRENCY, Task};

/// Lock shared batch state, recovering the guard from a poisoned lock.
///
/// Guards must never be held across an `.await`.
pub(crate) fn lock<T>(mutex: &Mutex<T>) -> MutexGuard<'_, T> {
    mutex.lock().unwrap_or_else(PoisonError::into_inner)
}
