use std::collections::HashMap;
use std::sync::{Arc, Mutex};

use futures::FutureExt;
use indexmap::IndexMap;
use log::debug;
use tokio_util::sync::CancellationToken;

use super::lock;
use super::runner::{BatchRunner, Task};
use crate::domain::{OverallStatus, PlatformError, TaskResult};

/// Successful results that outlive the generation that produced them.
#[derive(Debug, Clone)]
pub struct WorkflowCache<T> {
    entries: HashMap<String, T>,
    version: u64,
}

impl<T> Default for WorkflowCache<T> {
    fn default() -> Self {
        Self {
            entries: HashMap::new(),
            version: 0,
        }
    }
}

impl<T> WorkflowCache<T> {
    #[must_use]
    pub fn new() -> Self {
        Self::default()
    }

    /// Drop every entry and start a new version.
    pub fn reset(&mut self) {
        self.entries.clear();
        self.version = self.version.saturating_add(1);
    }

    #[must_use]
    pub fn get(&self, key: &str) -> Option<&T> {
        self.entries.get(key)
    }

    pub fn put(&mut self, key: String, value: T) {
        self.entries.insert(key, value);
    }

    #[must_use]
    pub fn contains(&self, key: &str) -> bool {
        self.entries.contains_key(key)
    }

    #[must_use]
    pub fn version(&self) -> u64 {
        self.version
    }

    #[must_use]
    pub fn len(&self) -> usize {
        self.entries.len()
    }

    #[must_use]
    pub fn is_empty(&self) -> bool {
        self.entries.is_empty()
    }
}

struct Shared<T> {
    cache: WorkflowCache<T>,
    organisation: Option<String>,
    /// Cache version the latest load started with
    load_version: u64,
}

/// A `BatchRunner` that only fetches keys missing from its cache.
///
/// Successful results are cached as they settle, unless the cache was reset since
/// the load started. Changing the organisation resets the cache.
pub struct CachedBatch<T> {
    runner: BatchRunner<T>,
    shared: Arc<Mutex<Shared<T>>>,
}

impl<T> Clone for CachedBatch<T> {
    fn clone(&self) -> Self {
        Self {
            runner: self.runner.clone(),
            shared: Arc::clone(&self.shared),
        }
    }
}

impl<T> CachedBatch<T>
where
    T: Clone + Send + 'static,
{
    #[must_use]
    pub fn new(purpose: &str, concurrency: usize, task: Task<T>) -> Self {
        let shared = Arc::new(Mutex::new(Shared {
            cache: WorkflowCache::new(),
            organisation: None,
            load_version: 0,
        }));
        let runner = BatchRunner::new(purpose, concurrency, caching(task, Arc::clone(&shared)));
        Self { runner, shared }
    }

    #[must_use]
    pub fn runner(&self) -> &BatchRunner<T> {
        &self.runner
    }

    /// Switch to an organisation, dropping the cache and any in-flight fetch if it
    /// changed. Returns whether it changed.
    pub fn set_organisation(&self, organisation: &str) -> bool {
        let changed = {
            let mut shared = lock(&self.shared);
            if shared.organisation.as_deref() == Some(organisation) {
                false
            } else {
                shared.organisation = Some(organisation.to_string());
                shared.cache.reset();
                true
            }
        };

        if changed {
            debug!(
                "{}: organisation changed to {organisation}, cache cleared",
                self.runner.purpose()
            );
            self.runner.cancel();
        }
        changed
    }

    #[must_use]
    pub fn organisation(&self) -> Option<String> {
        lock(&self.shared).organisation.clone()
    }

    /// Fetch the requested keys that aren't cached yet and return the derived
    /// status of the whole request.
    pub async fn load(&self, requested: &[String]) -> OverallStatus {
        let delta: Vec<String> = {
            let mut shared = lock(&self.shared);
            shared.load_version = shared.cache.version();
            requested
                .iter()
                .filter(|key| !shared.cache.contains(key))
                .cloned()
                .collect()
        };

        if !delta.is_empty() {
            debug!(
                "{}: {} of {} keys not cached",
                self.runner.purpose(),
                delta.len(),
                requested.len()
            );
            self.runner.run(delta).await;
        }
        self.status(requested)
    }

    /// Fetch the given keys again, overwriting their cache entries.
    pub async fn refresh(&self, keys: Vec<String>) -> OverallStatus {
        {
            let mut shared = lock(&self.shared);
            shared.load_version = shared.cache.version();
        }
        self.runner.refetch(Some(keys)).await.status
    }

    /// Status of a request derived from the cache.
    ///
    /// `Success` when every requested key is cached, `SuccessWithErrors` when some
    /// are and `Error` when none are.
    ///
    /// While a fetch is running the whole request reports `Loading`, even when
    /// some of its keys already settled. The counts are only taken once the
    /// runner's generation has finished.
    #[must_use]
    pub fn status(&self, requested: &[String]) -> OverallStatus {
        if requested.is_empty() {
            return OverallStatus::Idle;
        }
        if self.runner.status() == OverallStatus::Loading {
            return OverallStatus::Loading;
        }

        let shared = lock(&self.shared);
        let cached = requested
            .iter()
            .filter(|key| shared.cache.contains(key))
            .count();
        OverallStatus::from_counts(cached, requested.len())
    }

    /// Results for the requested keys, preferring the live fetch over the cache.
    #[must_use]
    pub fn visible(&self, requested: &[String]) -> IndexMap<String, TaskResult<T>> {
        let in_flight = self.runner.snapshot().results;
        let shared = lock(&self.shared);

        requested
            .iter()
            .filter_map(|key| {
                let result = in_flight.get(key).cloned().or_else(|| {
                    shared
                        .cache
                        .get(key)
                        .map(|data| TaskResult::success(data.clone()))
                })?;
                Some((key.clone(), result))
            })
            .collect()
    }

    #[must_use]
    pub fn cached(&self, key: &str) -> Option<T> {
        lock(&self.shared).cache.get(key).cloned()
    }

    #[must_use]
    pub fn cache_version(&self) -> u64 {
        lock(&self.shared).cache.version()
    }
}

/// Wrap a task so its successes land in the cache.
fn caching<T>(task: Task<T>, shared: Arc<Mutex<Shared<T>>>) -> Task<T>
where
    T: Clone + Send + 'static,
{
    Arc::new(move |key: String, token: CancellationToken| {
        let task = Arc::clone(&task);
        let shared = Arc::clone(&shared);
        async move {
            let data = task(key.clone(), token.clone()).await?;
            let mut guard = lock(&shared);
            if !token.is_cancelled() && guard.cache.version() == guard.load_version {
                guard.cache.put(key, data.clone());
            }
            Ok::<T, PlatformError>(data)
        }
        .boxed()
    })
}
