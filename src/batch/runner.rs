use std::fmt;
use std::sync::{Arc, Mutex};

use futures::future::{BoxFuture, join_all};
use indexmap::IndexMap;
use log::debug;
use tokio::sync::Semaphore;
use tokio_util::sync::CancellationToken;

use super::lock;
use crate::domain::{OverallStatus, PlatformError, TaskResult};

/// Concurrent tasks per batch unless configured otherwise.
pub const DEFAULT_CONCURRENCY: usize = 10;

/// The work done for one key. It receives the key and the generation's token.
pub type Task<T> = Arc<
    dyn Fn(String, CancellationToken) -> BoxFuture<'static, Result<T, PlatformError>>
        + Send
        + Sync,
>;

/// A consistent copy of a runner's state.
#[derive(Debug, Clone)]
pub struct BatchSnapshot<T> {
    pub results: IndexMap<String, TaskResult<T>>,
    pub status: OverallStatus,
    pub generation: u64,
    /// Number of full refetches requested so far
    pub trigger: u64,
}

impl<T> BatchSnapshot<T> {
    /// Keys that settled with an error, in key order.
    pub fn failed_keys(&self) -> impl Iterator<Item = &str> {
        self.results
            .iter()
            .filter(|(_, result)| result.is_error())
            .map(|(key, _)| key.as_str())
    }

    /// Keys that settled successfully, in key order.
    pub fn succeeded_keys(&self) -> impl Iterator<Item = &str> {
        self.results
            .iter()
            .filter(|(_, result)| result.is_success())
            .map(|(key, _)| key.as_str())
    }
}

struct State<T> {
    results: IndexMap<String, TaskResult<T>>,
    status: OverallStatus,
    generation: u64,
    trigger: u64,
    token: CancellationToken,
    /// Keys of the last full run, used by `refetch(None)`
    keys: Vec<String>,
}

/// Which results a new generation starts from.
enum Scope<'a> {
    Full,
    Subset(&'a [String]),
}

/// Runs a task for each key with bounded concurrency.
///
/// Each `run` or `refetch` starts a new generation and cancels the previous one.
/// A cancelled generation never writes results, and only the live generation
/// writes the final aggregate status.
pub struct BatchRunner<T> {
    purpose: Arc<str>,
    concurrency: usize,
    task: Task<T>,
    state: Arc<Mutex<State<T>>>,
}

impl<T> Clone for BatchRunner<T> {
    fn clone(&self) -> Self {
        Self {
            purpose: Arc::clone(&self.purpose),
            concurrency: self.concurrency,
            task: Arc::clone(&self.task),
            state: Arc::clone(&self.state),
        }
    }
}

impl<T> fmt::Debug for BatchRunner<T> {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.debug_struct("BatchRunner")
            .field("purpose", &self.purpose)
            .field("concurrency", &self.concurrency)
            .finish_non_exhaustive()
    }
}

impl<T> BatchRunner<T>
where
    T: Clone + Send + 'static,
{
    /// Create a runner. A concurrency of zero is treated as one.
    #[must_use]
    pub fn new(purpose: &str, concurrency: usize, task: Task<T>) -> Self {
        Self {
            purpose: Arc::from(purpose),
            concurrency: concurrency.max(1),
            task,
            state: Arc::new(Mutex::new(State {
                results: IndexMap::new(),
                status: OverallStatus::Idle,
                generation: 0,
                trigger: 0,
                token: CancellationToken::new(),
                keys: Vec::new(),
            })),
        }
    }

    #[must_use]
    pub fn purpose(&self) -> &str {
        &self.purpose
    }

    /// The task this runner executes per key.
    #[must_use]
    pub fn task(&self) -> Task<T> {
        Arc::clone(&self.task)
    }

    /// Run the task for every key as a new generation, replacing all results.
    ///
    /// Resolves once every key of this generation has settled or the generation
    /// was superseded.
    pub async fn run(&self, keys: Vec<String>) -> BatchSnapshot<T> {
        let (generation, token) = self.begin(&keys, Scope::Full);
        self.execute(generation, token, keys).await;
        self.snapshot()
    }

    /// Run again.
    ///
    /// With a subset, only those keys are re-run and merged into the existing
    /// results. Without one, the last full key set is run again.
    pub async fn refetch(&self, subset: Option<Vec<String>>) -> BatchSnapshot<T> {
        match subset {
            Some(keys) => {
                let (generation, token) = self.begin(&keys, Scope::Subset(&keys));
                self.execute(generation, token, keys).await;
                self.snapshot()
            }
            None => {
                let keys = {
                    let mut state = lock(&self.state);
                    state.trigger = state.trigger.saturating_add(1);
                    state.keys.clone()
                };
                self.run(keys).await
            }
        }
    }

    /// Cancel the live generation.
    ///
    /// Keys that hadn't settled are dropped and the status is recomputed from what
    /// did settle.
    pub fn cancel(&self) {
        let mut state = lock(&self.state);
        state.token.cancel();
        state.results.retain(|_, result| !result.is_loading());
        state.status = OverallStatus::aggregate(state.results.values().map(|r| r.status));
        debug!(
            "{}: cancelled generation {}",
            self.purpose, state.generation
        );
    }

    #[must_use]
    pub fn snapshot(&self) -> BatchSnapshot<T> {
        let state = lock(&self.state);
        BatchSnapshot {
            results: state.results.clone(),
            status: state.status,
            generation: state.generation,
            trigger: state.trigger,
        }
    }

    #[must_use]
    pub fn status(&self) -> OverallStatus {
        lock(&self.state).status
    }

    #[must_use]
    pub fn result(&self, key: &str) -> Option<TaskResult<T>> {
        lock(&self.state).results.get(key).cloned()
    }

    fn begin(&self, keys: &[String], scope: Scope<'_>) -> (u64, CancellationToken) {
        let mut state = lock(&self.state);
        state.token.cancel();
        state.token = CancellationToken::new();
        state.generation = state.generation.saturating_add(1);

        match scope {
            Scope::Full => {
                state.keys = keys.to_vec();
                state.results = keys
                    .iter()
                    .map(|key| (key.clone(), TaskResult::loading()))
                    .collect();
            }
            Scope::Subset(subset) => {
                // Loading keys of the superseded generation can never settle now
                state
                    .results
                    .retain(|key, result| !result.is_loading() || subset.contains(key));
                for key in subset {
                    state.results.insert(key.clone(), TaskResult::loading());
                }
            }
        }

        state.status = if state.results.is_empty() {
            OverallStatus::Idle
        } else if keys.is_empty() {
            OverallStatus::aggregate(state.results.values().map(|r| r.status))
        } else {
            OverallStatus::Loading
        };

        debug!(
            "{}: generation {} started with {} keys",
            self.purpose,
            state.generation,
            keys.len()
        );
        (state.generation, state.token.clone())
    }

    async fn execute(&self, generation: u64, token: CancellationToken, keys: Vec<String>) {
        if keys.is_empty() {
            return;
        }

        let semaphore = Arc::new(Semaphore::new(self.concurrency));
        let tasks = keys.into_iter().map(|key| {
            let semaphore = Arc::clone(&semaphore);
            let token = token.clone();
            let task = Arc::clone(&self.task);
            let state = Arc::clone(&self.state);
            let purpose = Arc::clone(&self.purpose);

            async move {
                let Ok(_permit) = semaphore.acquire().await else {
                    return;
                };
                if token.is_cancelled() {
                    return;
                }

                let outcome = task(key.clone(), token.clone()).await;

                // `begin` cancels under the same lock, so the check and the write
                // can't be split by a newer generation
                let mut guard = lock(&state);
                if guard.generation != generation || token.is_cancelled() {
                    return;
                }
                let result = match outcome {
                    Ok(data) => TaskResult::success(data),
                    Err(e) => {
                        debug!("{purpose}: {key} failed: {e}");
                        TaskResult::error(e.to_string())
                    }
                };
                guard.results.insert(key, result);
            }
        });

        join_all(tasks).await;

        let mut state = lock(&self.state);
        if state.generation == generation && !token.is_cancelled() {
            state.status = OverallStatus::aggregate(state.results.values().map(|r| r.status));
            debug!(
                "{}: generation {} finished: {}",
                self.purpose, generation, state.status
            );
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use futures::FutureExt;
    use std::sync::atomic::{AtomicUsize, Ordering};
    use std::time::Duration;

    fn keys(names: &[&str]) -> Vec<String> {
        names.iter().map(|s| (*s).to_string()).collect()
    }

    /// Succeeds with the key uppercased, fails for keys starting with `bad`.
    fn echo_task(delay: Duration) -> Task<String> {
        Arc::new(move |key: String, _token: CancellationToken| {
            async move {
                tokio::time::sleep(delay).await;
                if key.starts_with("bad") {
                    Err(PlatformError::Other(format!("{key} is broken")))
                } else {
                    Ok(key.to_uppercase())
                }
            }
            .boxed()
        })
    }

    #[tokio::test(start_paused = true)]
    async fn test_run_mixed_results() {
        let runner = BatchRunner::new("test", 2, echo_task(Duration::from_millis(10)));

        let snapshot = runner.run(keys(&["a", "bad-b", "c"])).await;

        assert_eq!(snapshot.status, OverallStatus::SuccessWithErrors);
        assert_eq!(snapshot.generation, 1);
        assert_eq!(snapshot.results["a"].data.as_deref(), Some("A"));
        assert_eq!(
            snapshot.results["bad-b"].message.as_deref(),
            Some("bad-b is broken")
        );
        assert_eq!(snapshot.failed_keys().collect::<Vec<_>>(), vec!["bad-b"]);
    }

    #[tokio::test(start_paused = true)]
    async fn test_run_all_success_and_all_error() {
        let runner = BatchRunner::new("test", 10, echo_task(Duration::ZERO));
        assert_eq!(
            runner.run(keys(&["a", "b"])).await.status,
            OverallStatus::Success
        );
        assert_eq!(
            runner.run(keys(&["bad-a", "bad-b"])).await.status,
            OverallStatus::Error
        );
    }

    #[tokio::test]
    async fn test_empty_run_is_idle() {
        let runner = BatchRunner::new("test", 10, echo_task(Duration::ZERO));
        let snapshot = runner.run(Vec::new()).await;
        assert_eq!(snapshot.status, OverallStatus::Idle);
        assert!(snapshot.results.is_empty());
    }

    #[tokio::test(start_paused = true)]
    async fn test_concurrency_is_bounded() {
        let running = Arc::new(AtomicUsize::new(0));
        let peak = Arc::new(AtomicUsize::new(0));
        let task: Task<()> = {
            let running = Arc::clone(&running);
            let peak = Arc::clone(&peak);
            Arc::new(move |_key: String, _token: CancellationToken| {
                let running = Arc::clone(&running);
                let peak = Arc::clone(&peak);
                async move {
                    let now = running.fetch_add(1, Ordering::SeqCst) + 1;
                    peak.fetch_max(now, Ordering::SeqCst);
                    tokio::time::sleep(Duration::from_millis(5)).await;
                    running.fetch_sub(1, Ordering::SeqCst);
                    Ok::<_, PlatformError>(())
                }
                .boxed()
            })
        };

        let runner = BatchRunner::new("test", 3, task);
        let names: Vec<String> = (0..12).map(|i| format!("key-{i}")).collect();
        let snapshot = runner.run(names).await;

        assert_eq!(snapshot.status, OverallStatus::Success);
        assert_eq!(peak.load(Ordering::SeqCst), 3);
    }

    #[tokio::test(start_paused = true)]
    async fn test_superseded_generation_never_writes() {
        let runner = BatchRunner::new("test", 10, echo_task(Duration::from_millis(100)));

        let first = {
            let runner = runner.clone();
            tokio::spawn(async move { runner.run(keys(&["old"])).await })
        };
        tokio::time::sleep(Duration::from_millis(10)).await;

        let snapshot = runner.run(keys(&["new"])).await;
        first.await.unwrap();

        assert_eq!(snapshot.generation, 2);
        assert!(!snapshot.results.contains_key("old"));
        assert_eq!(runner.snapshot().status, OverallStatus::Success);
        assert!(runner.result("old").is_none());
    }

    #[tokio::test(start_paused = true)]
    async fn test_refetch_subset_merges() {
        let runner = BatchRunner::new("test", 10, echo_task(Duration::ZERO));
        runner.run(keys(&["a", "bad-b"])).await;

        let snapshot = runner.refetch(Some(keys(&["a"]))).await;

        assert_eq!(snapshot.generation, 2);
        assert_eq!(snapshot.results.len(), 2);
        assert!(snapshot.results["bad-b"].is_error());
        assert_eq!(snapshot.status, OverallStatus::SuccessWithErrors);
    }

    #[tokio::test(start_paused = true)]
    async fn test_refetch_subset_drops_stale_loading_keys() {
        let runner = BatchRunner::new("test", 10, echo_task(Duration::from_millis(100)));

        let first = {
            let runner = runner.clone();
            tokio::spawn(async move { runner.run(keys(&["a", "b"])).await })
        };
        tokio::time::sleep(Duration::from_millis(10)).await;

        let snapshot = runner.refetch(Some(keys(&["a"]))).await;
        first.await.unwrap();

        assert_eq!(snapshot.results.len(), 1);
        assert_eq!(snapshot.status, OverallStatus::Success);
    }

    #[tokio::test(start_paused = true)]
    async fn test_slow_task_of_superseded_generation_is_dropped() {
        // The slow key ignores its token and settles after the subset run
        let task: Task<String> = Arc::new(|key: String, _token: CancellationToken| {
            async move {
                if key == "slow" {
                    tokio::time::sleep(Duration::from_secs(5)).await;
                }
                Ok::<_, PlatformError>(key)
            }
            .boxed()
        });
        let runner = BatchRunner::new("test", 10, task);

        let first = {
            let runner = runner.clone();
            tokio::spawn(async move { runner.run(keys(&["slow", "fast"])).await })
        };
        tokio::time::sleep(Duration::from_millis(10)).await;

        let snapshot = runner.refetch(Some(keys(&["fast"]))).await;
        assert_eq!(snapshot.generation, 2);
        first.await.unwrap();
        tokio::time::sleep(Duration::from_secs(10)).await;

        assert!(runner.result("slow").is_none());
        let snapshot = runner.snapshot();
        assert_eq!(snapshot.results.keys().collect::<Vec<_>>(), vec!["fast"]);
        assert_eq!(snapshot.status, OverallStatus::Success);
    }

    #[tokio::test(start_paused = true)]
    async fn test_refetch_all_reruns_last_keys() {
        let calls = Arc::new(AtomicUsize::new(0));
        let task: Task<usize> = {
            let calls = Arc::clone(&calls);
            Arc::new(move |_key: String, _token: CancellationToken| {
                let calls = Arc::clone(&calls);
                async move { Ok::<_, PlatformError>(calls.fetch_add(1, Ordering::SeqCst)) }.boxed()
            })
        };
        let runner = BatchRunner::new("test", 10, task);
        runner.run(keys(&["a", "b"])).await;

        let snapshot = runner.refetch(None).await;

        assert_eq!(calls.load(Ordering::SeqCst), 4);
        assert_eq!(snapshot.trigger, 1);
        assert_eq!(snapshot.results.len(), 2);
    }

    #[tokio::test(start_paused = true)]
    async fn test_cancel_drops_loading_keys() {
        let task: Task<String> = Arc::new(|key: String, _token: CancellationToken| {
            async move {
                if key == "slow" {
                    tokio::time::sleep(Duration::from_secs(60)).await;
                }
                Ok::<_, PlatformError>(key)
            }
            .boxed()
        });
        let runner = BatchRunner::new("test", 10, task);

        let handle = {
            let runner = runner.clone();
            tokio::spawn(async move { runner.run(keys(&["fast", "slow"])).await })
        };
        tokio::time::sleep(Duration::from_millis(10)).await;
        runner.cancel();
        handle.await.unwrap();

        let snapshot = runner.snapshot();
        assert_eq!(snapshot.results.len(), 1);
        assert!(snapshot.results["fast"].is_success());
        assert_eq!(snapshot.status, OverallStatus::Success);
    }
}
