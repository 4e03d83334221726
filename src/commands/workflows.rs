use futures::FutureExt;
use log::warn;
use std::collections::BTreeMap;
use std::sync::{Arc, Mutex};
use tokio_util::sync::CancellationToken;

use crate::batch::{CachedBatch, Task, lock};
use crate::domain::{OverallStatus, Platform, PlatformError, WorkflowFile};

/// Branch names per repository, as returned by the clone.
pub type BranchMap = BTreeMap<String, Vec<String>>;

#[derive(Debug, Default)]
struct Context {
    organisation: String,
    branches: BranchMap,
}

/// Loads the workflow files of cloned repositories through a cache.
pub struct WorkflowLoader {
    batch: CachedBatch<Vec<WorkflowFile>>,
    context: Arc<Mutex<Context>>,
}

impl WorkflowLoader {
    #[must_use]
    pub fn new<P: Platform>(platform: Arc<P>, concurrency: usize) -> Self {
        let context = Arc::new(Mutex::new(Context::default()));
        let task = fetch_task(platform, Arc::clone(&context));
        Self {
            batch: CachedBatch::new("workflows-fetch", concurrency, task),
            context,
        }
    }

    /// Switch organisation and branches. Cached workflows of another organisation
    /// are dropped.
    pub fn set_context(&self, organisation: &str, branches: BranchMap) {
        {
            let mut context = lock(&self.context);
            context.organisation = organisation.to_string();
            context.branches = branches;
        }
        self.batch.set_organisation(organisation);
    }

    /// Fetch the repositories that aren't cached yet.
    pub async fn load(&self, repositories: &[String]) -> OverallStatus {
        self.batch.load(repositories).await
    }

    /// Fetch repositories again after their files changed.
    pub async fn refresh(&self, repositories: Vec<String>) -> OverallStatus {
        self.batch.refresh(repositories).await
    }

    /// Files of every repository that loaded, in repository order.
    #[must_use]
    pub fn files(&self, repositories: &[String]) -> Vec<WorkflowFile> {
        self.batch
            .visible(repositories)
            .into_values()
            .filter_map(|result| result.data)
            .flatten()
            .collect()
    }

    /// Repositories whose workflows couldn't be loaded, with the reason.
    #[must_use]
    pub fn failures(&self, repositories: &[String]) -> Vec<(String, String)> {
        self.batch
            .visible(repositories)
            .into_iter()
            .filter(|(_, result)| result.is_error())
            .map(|(repository, result)| {
                let message = result.message.unwrap_or_default();
                (repository, message)
            })
            .collect()
    }
}

fn fetch_task<P: Platform>(platform: Arc<P>, context: Arc<Mutex<Context>>) -> Task<Vec<WorkflowFile>> {
    Arc::new(move |repository: String, token: CancellationToken| {
        let platform = Arc::clone(&platform);
        let context = Arc::clone(&context);
        async move {
            let organisation = lock(&context).organisation.clone();
            let raw = platform
                .fetch_workflows(&organisation, &repository, &token)
                .await?;

            let context = lock(&context);
            let files = raw
                .into_iter()
                .filter_map(|raw| {
                    let path = raw.path.clone();
                    WorkflowFile::from_raw(raw, &context.branches)
                        .map_err(|e| warn!("Skipping {path}: {e}"))
                        .ok()
                })
                .collect();
            Ok::<_, PlatformError>(files)
        }
        .boxed()
    })
}
