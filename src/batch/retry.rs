use std::collections::HashMap;
use std::fmt;
use std::sync::{Arc, Mutex};
use std::time::Duration;

use futures::FutureExt;
use futures::future::BoxFuture;
use indexmap::IndexMap;
use log::{debug, info, warn};
use tokio::task::JoinHandle;
use tokio_util::sync::CancellationToken;

use super::lock;
use super::runner::{BatchRunner, BatchSnapshot};
use crate::domain::{OverallStatus, TaskResult};

/// Wait between two background attempts.
pub const DEFAULT_RETRY_DELAY: Duration = Duration::from_secs(1);

/// Background attempts per key before giving up.
pub const DEFAULT_MAX_ATTEMPTS: u32 = 10;

/// Source of the delay between attempts.
pub trait Timer: Send + Sync + 'static {
    fn sleep(&self, duration: Duration) -> BoxFuture<'static, ()>;
}

/// `Timer` backed by the tokio clock.
#[derive(Debug, Clone, Copy, Default)]
pub struct TokioTimer;

impl Timer for TokioTimer {
    fn sleep(&self, duration: Duration) -> BoxFuture<'static, ()> {
        tokio::time::sleep(duration).boxed()
    }
}

/// Where a key's retry loop stands.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Default)]
pub enum RetryState {
    #[default]
    Idle,
    /// Waiting for the next attempt
    RetryScheduled,
    /// An attempt is in flight
    Running,
    /// All attempts failed; the batch error stands
    Exhausted,
    Succeeded,
}

impl RetryState {
    /// True while a loop is active for the key.
    #[must_use]
    pub fn is_retrying(self) -> bool {
        matches!(self, RetryState::RetryScheduled | RetryState::Running)
    }
}

/// Which run produced a settled result.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum RetryOrigin {
    Batch,
    Background,
}

/// What a consumer should show for one key.
#[derive(Debug, Clone, PartialEq, Eq)]
pub enum EffectiveResult<T> {
    Retrying { attempts: u32 },
    Settled {
        result: TaskResult<T>,
        origin: RetryOrigin,
    },
}

impl<T> EffectiveResult<T> {
    #[must_use]
    pub fn is_success(&self) -> bool {
        matches!(self, EffectiveResult::Settled { result, .. } if result.is_success())
    }

    #[must_use]
    pub fn data(&self) -> Option<&T> {
        match self {
            EffectiveResult::Settled { result, .. } => result.data.as_ref(),
            EffectiveResult::Retrying { .. } => None,
        }
    }
}

#[derive(Debug, Clone, Copy, Default)]
struct KeyRetry {
    state: RetryState,
    attempts: u32,
    /// Loop that owns the key; other loops stop writing
    loop_id: u64,
}

struct Shared<T> {
    keys: HashMap<String, KeyRetry>,
    overrides: HashMap<String, T>,
    /// Bumped by `retry_all` so loops of the previous epoch stop writing
    epoch: u64,
    next_loop: u64,
    token: CancellationToken,
}

impl<T> Shared<T> {
    fn owns(&self, key: &str, loop_id: u64) -> bool {
        self.keys
            .get(key)
            .is_some_and(|entry| entry.loop_id == loop_id)
    }
}

/// Called with the key whenever a background attempt succeeds.
pub type SuccessHook = Arc<dyn Fn(&str) + Send + Sync>;

/// What the loop does after an attempt.
enum Next {
    Again,
    Stop,
}

/// Retries a runner's failed keys in the background.
///
/// A key's overlay (`Retrying`) wins over a background success, which wins over
/// the runner's own result.
pub struct RetryCoordinator<T, Tm = TokioTimer> {
    runner: BatchRunner<T>,
    timer: Arc<Tm>,
    delay: Duration,
    max_attempts: u32,
    on_success: Option<SuccessHook>,
    shared: Arc<Mutex<Shared<T>>>,
}

impl<T, Tm> Clone for RetryCoordinator<T, Tm> {
    fn clone(&self) -> Self {
        Self {
            runner: self.runner.clone(),
            timer: Arc::clone(&self.timer),
            delay: self.delay,
            max_attempts: self.max_attempts,
            on_success: self.on_success.clone(),
            shared: Arc::clone(&self.shared),
        }
    }
}

impl<T, Tm> fmt::Debug for RetryCoordinator<T, Tm> {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.debug_struct("RetryCoordinator")
            .field("runner", &self.runner)
            .field("delay", &self.delay)
            .field("max_attempts", &self.max_attempts)
            .finish_non_exhaustive()
    }
}

impl<T> RetryCoordinator<T, TokioTimer>
where
    T: Clone + Send + 'static,
{
    #[must_use]
    pub fn new(runner: BatchRunner<T>) -> Self {
        Self::with_timer(runner, TokioTimer)
    }
}

impl<T, Tm> RetryCoordinator<T, Tm>
where
    T: Clone + Send + 'static,
    Tm: Timer,
{
    #[must_use]
    pub fn with_timer(runner: BatchRunner<T>, timer: Tm) -> Self {
        Self {
            runner,
            timer: Arc::new(timer),
            delay: DEFAULT_RETRY_DELAY,
            max_attempts: DEFAULT_MAX_ATTEMPTS,
            on_success: None,
            shared: Arc::new(Mutex::new(Shared {
                keys: HashMap::new(),
                overrides: HashMap::new(),
                epoch: 0,
                next_loop: 0,
                token: CancellationToken::new(),
            })),
        }
    }

    #[must_use]
    pub fn with_delay(mut self, delay: Duration) -> Self {
        self.delay = delay;
        self
    }

    #[must_use]
    pub fn with_max_attempts(mut self, max_attempts: u32) -> Self {
        self.max_attempts = max_attempts.max(1);
        self
    }

    #[must_use]
    pub fn with_on_success(mut self, hook: SuccessHook) -> Self {
        self.on_success = Some(hook);
        self
    }

    #[must_use]
    pub fn runner(&self) -> &BatchRunner<T> {
        &self.runner
    }

    /// Start background retries for the failed keys of a partially successful
    /// batch.
    ///
    /// Keys that are already retrying, exhausted or recovered are left alone.
    /// Returns the handles of the loops that were started.
    pub fn observe(&self, snapshot: &BatchSnapshot<T>) -> Vec<JoinHandle<()>> {
        if snapshot.status != OverallStatus::SuccessWithErrors {
            return Vec::new();
        }

        let (started, epoch, token) = {
            let mut guard = lock(&self.shared);
            let shared = &mut *guard;
            let mut started = Vec::new();
            for key in snapshot.failed_keys() {
                let entry = shared.keys.entry(key.to_string()).or_default();
                if entry.state != RetryState::Idle {
                    continue;
                }
                shared.next_loop = shared.next_loop.saturating_add(1);
                entry.state = RetryState::RetryScheduled;
                entry.loop_id = shared.next_loop;
                started.push((key.to_string(), shared.next_loop));
            }
            (started, shared.epoch, shared.token.clone())
        };

        started
            .into_iter()
            .map(|(key, loop_id)| {
                debug!("{}: retrying {key} in the background", self.runner.purpose());
                let coordinator = self.clone();
                let token = token.clone();
                tokio::spawn(
                    async move { coordinator.retry_loop(key, epoch, loop_id, token).await },
                )
            })
            .collect()
    }

    /// Run the batch for `keys`, dropping their retry state and background results
    /// first.
    ///
    /// Loops still running for those keys stop writing, and a key that fails again
    /// can be retried by the next `observe`.
    pub async fn run(&self, keys: Vec<String>) -> BatchSnapshot<T> {
        {
            let mut shared = lock(&self.shared);
            for key in &keys {
                shared.keys.remove(key);
                shared.overrides.remove(key);
            }
        }
        self.runner.run(keys).await
    }

    /// Drop every retry state and run the whole batch again.
    pub async fn retry_all(&self) -> BatchSnapshot<T> {
        {
            let mut shared = lock(&self.shared);
            shared.token.cancel();
            shared.token = CancellationToken::new();
            shared.epoch = shared.epoch.saturating_add(1);
            shared.keys.clear();
            shared.overrides.clear();
        }
        self.runner.refetch(None).await
    }

    /// The result to show for a key.
    #[must_use]
    pub fn effective(&self, key: &str) -> Option<EffectiveResult<T>> {
        {
            let shared = lock(&self.shared);
            if let Some(entry) = shared.keys.get(key)
                && entry.state.is_retrying()
            {
                return Some(EffectiveResult::Retrying {
                    attempts: entry.attempts,
                });
            }
            if let Some(data) = shared.overrides.get(key) {
                return Some(EffectiveResult::Settled {
                    result: TaskResult::success(data.clone()),
                    origin: RetryOrigin::Background,
                });
            }
        }

        self.runner
            .result(key)
            .map(|result| EffectiveResult::Settled {
                result,
                origin: RetryOrigin::Batch,
            })
    }

    /// Effective results of every key of the runner, in key order.
    #[must_use]
    pub fn effective_results(&self) -> IndexMap<String, EffectiveResult<T>> {
        let snapshot = self.runner.snapshot();
        let shared = lock(&self.shared);
        snapshot
            .results
            .into_iter()
            .map(|(key, result)| {
                let effective = match (shared.keys.get(&key), shared.overrides.get(&key)) {
                    (Some(entry), _) if entry.state.is_retrying() => EffectiveResult::Retrying {
                        attempts: entry.attempts,
                    },
                    (_, Some(data)) => EffectiveResult::Settled {
                        result: TaskResult::success(data.clone()),
                        origin: RetryOrigin::Background,
                    },
                    _ => EffectiveResult::Settled {
                        result,
                        origin: RetryOrigin::Batch,
                    },
                };
                (key, effective)
            })
            .collect()
    }

    /// The runner's status, upgraded to `Success` once every key has succeeded.
    #[must_use]
    pub fn status(&self) -> OverallStatus {
        let results = self.effective_results();
        if !results.is_empty() && results.values().all(EffectiveResult::is_success) {
            OverallStatus::Success
        } else {
            self.runner.status()
        }
    }

    #[must_use]
    pub fn state(&self, key: &str) -> RetryState {
        lock(&self.shared)
            .keys
            .get(key)
            .map_or(RetryState::Idle, |entry| entry.state)
    }

    /// Failed background attempts so far for a key.
    #[must_use]
    pub fn attempts(&self, key: &str) -> u32 {
        lock(&self.shared)
            .keys
            .get(key)
            .map_or(0, |entry| entry.attempts)
    }

    /// True while any key is retrying.
    #[must_use]
    pub fn is_retrying(&self) -> bool {
        lock(&self.shared)
            .keys
            .values()
            .any(|entry| entry.state.is_retrying())
    }

    async fn retry_loop(self, key: String, epoch: u64, loop_id: u64, token: CancellationToken) {
        let purpose = self.runner.purpose().to_string();
        let task = self.runner.task();

        loop {
            self.timer.sleep(self.delay).await;
            if !self.set_state(&key, epoch, loop_id, RetryState::Running) {
                return;
            }

            let outcome = task(key.clone(), token.clone()).await;

            let next = {
                let mut shared = lock(&self.shared);
                if shared.epoch != epoch || token.is_cancelled() || !shared.owns(&key, loop_id) {
                    return;
                }

                match outcome {
                    Ok(data) => {
                        shared.overrides.insert(key.clone(), data);
                        let entry = shared.keys.entry(key.clone()).or_default();
                        entry.state = RetryState::Succeeded;
                        entry.attempts = 0;
                        Next::Stop
                    }
                    Err(e) => {
                        let entry = shared.keys.entry(key.clone()).or_default();
                        entry.attempts = entry.attempts.saturating_add(1);
                        if entry.attempts >= self.max_attempts {
                            entry.state = RetryState::Exhausted;
                            warn!(
                                "{purpose}: giving up on {key} after {} attempts: {e}",
                                entry.attempts
                            );
                            return;
                        }
                        entry.state = RetryState::RetryScheduled;
                        debug!("{purpose}: attempt {} for {key} failed: {e}", entry.attempts);
                        Next::Again
                    }
                }
            };

            if let Next::Stop = next {
                info!("{purpose}: {key} succeeded on retry");
                if let Some(hook) = &self.on_success {
                    hook(&key);
                }
                return;
            }
        }
    }

    /// Move a key to `state` if its loop still owns the key in the live epoch.
    fn set_state(&self, key: &str, epoch: u64, loop_id: u64, state: RetryState) -> bool {
        let mut shared = lock(&self.shared);
        if shared.epoch != epoch || shared.token.is_cancelled() {
            return false;
        }
        match shared.keys.get_mut(key) {
            Some(entry) if entry.loop_id == loop_id => {
                entry.state = state;
                true
            }
            Some(_) | None => false,
        }
    }
}
