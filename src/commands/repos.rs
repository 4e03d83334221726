use futures::FutureExt;
use indexmap::IndexSet;
use log::debug;
use std::fmt;
use std::sync::{Arc, Mutex};
use tokio::task::JoinHandle;
use tokio_util::sync::CancellationToken;

use crate::batch::{BatchRunner, EffectiveResult, RetryCoordinator, Timer, TokioTimer, lock};
use crate::domain::{Branch, OverallStatus, Platform, PlatformError, Repository};

use super::workflows::BranchMap;

/// Outcome of cloning the repositories of an organisation.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct CloneSummary {
    pub status: OverallStatus,
    pub total: usize,
    /// Repositories that still failed, with the last error
    pub failures: Vec<(String, String)>,
    pub retrying: Vec<String>,
}

impl CloneSummary {
    /// Short message for the user, or `None` when every repository was cloned.
    #[must_use]
    pub fn message(&self) -> Option<String> {
        if self.failures.is_empty() {
            return None;
        }
        let message = if self.failures.len() == self.total {
            "Fetching failed for all repositories.".to_string()
        } else {
            format!(
                "{} of {} repositories failed to fetch.",
                self.failures.len(),
                self.total
            )
        };
        Some(format!("{message} Run again with --retry to fetch them again."))
    }
}

impl fmt::Display for CloneSummary {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        match self.message() {
            Some(message) => {
                write!(f, "{message}")?;
                for (repository, error) in &self.failures {
                    write!(f, "\n  {repository}: {error}")?;
                }
                Ok(())
            }
            None => write!(f, "{} repositories fetched.", self.total),
        }
    }
}

/// Clones the repositories of one organisation and keeps the failed ones
/// retrying in the background.
///
/// Repositories are selected as soon as their clone succeeds, whether in the
/// batch or in a later retry.
pub struct RepoCloner<P, Tm = TokioTimer> {
    platform: Arc<P>,
    organisation: Arc<str>,
    coordinator: RetryCoordinator<Vec<Branch>, Tm>,
    selected: Arc<Mutex<IndexSet<String>>>,
    retries: Mutex<Vec<JoinHandle<()>>>,
}

impl<P: Platform> RepoCloner<P, TokioTimer> {
    #[must_use]
    pub fn new(platform: Arc<P>, organisation: &str, concurrency: usize) -> Self {
        Self::with_timer(platform, organisation, concurrency, TokioTimer)
    }
}

impl<P: Platform, Tm: Timer> RepoCloner<P, Tm> {
    #[must_use]
    pub fn with_timer(platform: Arc<P>, organisation: &str, concurrency: usize, timer: Tm) -> Self {
        let organisation: Arc<str> = Arc::from(organisation);
        let selected = Arc::new(Mutex::new(IndexSet::new()));

        let task_platform = Arc::clone(&platform);
        let task_organisation = Arc::clone(&organisation);
        let runner = BatchRunner::new(
            "clone-repos",
            concurrency,
            Arc::new(move |repository: String, token: CancellationToken| {
                let platform = Arc::clone(&task_platform);
                let organisation = Arc::clone(&task_organisation);
                async move {
                    platform
                        .clone_repository(&organisation, &repository, &token)
                        .await
                }
                .boxed()
            }),
        );

        let hook_selected = Arc::clone(&selected);
        let coordinator = RetryCoordinator::with_timer(runner, timer).with_on_success(Arc::new(
            move |repository: &str| {
                lock(&hook_selected).insert(repository.to_string());
            },
        ));

        Self {
            platform,
            organisation,
            coordinator,
            selected,
            retries: Mutex::new(Vec::new()),
        }
    }

    #[must_use]
    pub fn organisation(&self) -> &str {
        &self.organisation
    }

    #[must_use]
    pub fn coordinator(&self) -> &RetryCoordinator<Vec<Branch>, Tm> {
        &self.coordinator
    }

    /// List the repositories of the organisation.
    ///
    /// # Errors
    ///
    /// Returns an error if the platform request fails.
    pub async fn list_repositories(
        &self,
        cancel: &CancellationToken,
    ) -> Result<Vec<Repository>, PlatformError> {
        self.platform
            .list_repositories(&self.organisation, cancel)
            .await
    }

    /// Clone every repository and start retries for the ones that failed.
    pub async fn clone_all(&self, repositories: Vec<String>) -> CloneSummary {
        debug!(
            "Cloning {} repositories of {}",
            repositories.len(),
            self.organisation
        );
        let snapshot = self.coordinator.run(repositories).await;
        {
            let mut selected = lock(&self.selected);
            selected.clear();
            selected.extend(snapshot.succeeded_keys().map(ToString::to_string));
        }
        let handles = self.coordinator.observe(&snapshot);
        lock(&self.retries).extend(handles);
        self.summary()
    }

    /// Wait for every background retry to stop.
    pub async fn settle_retries(&self) -> CloneSummary {
        let handles: Vec<JoinHandle<()>> = lock(&self.retries).drain(..).collect();
        for handle in futures::future::join_all(handles).await {
            if let Err(e) = handle {
                debug!("Retry task ended abnormally: {e}");
            }
        }
        self.summary()
    }

    /// Drop retry state and clone every repository again.
    pub async fn retry_all(&self) -> CloneSummary {
        for handle in lock(&self.retries).drain(..) {
            handle.abort();
        }
        let snapshot = self.coordinator.retry_all().await;
        {
            let mut selected = lock(&self.selected);
            selected.clear();
            selected.extend(snapshot.succeeded_keys().map(ToString::to_string));
        }
        let handles = self.coordinator.observe(&snapshot);
        lock(&self.retries).extend(handles);
        self.summary()
    }

    /// Branch names per cloned repository, including repositories recovered by a
    /// retry.
    #[must_use]
    pub fn branches(&self) -> BranchMap {
        self.coordinator
            .effective_results()
            .into_iter()
            .filter_map(|(repository, effective)| {
                let branches = effective.data()?;
                let names = branches.iter().map(|branch| branch.name.clone()).collect();
                Some((repository, names))
            })
            .collect()
    }

    /// Repositories selected for the workflow scan, in clone order.
    #[must_use]
    pub fn selected_repositories(&self) -> Vec<String> {
        lock(&self.selected).iter().cloned().collect()
    }

    #[must_use]
    pub fn summary(&self) -> CloneSummary {
        let results = self.coordinator.effective_results();
        let total = results.len();
        let mut failures = Vec::new();
        let mut retrying = Vec::new();
        for (repository, effective) in results {
            match effective {
                EffectiveResult::Retrying { .. } => retrying.push(repository),
                EffectiveResult::Settled { result, .. } if result.is_error() => {
                    failures.push((repository, result.message.unwrap_or_default()));
                }
                EffectiveResult::Settled { .. } => {}
            }
        }
        CloneSummary {
            status: self.coordinator.status(),
            total,
            failures,
            retrying,
        }
    }
}
