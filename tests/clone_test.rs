use relabel::batch::RetryState;
use relabel::commands::repos::RepoCloner;
use relabel::commands::workflows::WorkflowLoader;
use relabel::domain::{
    Branch, LabelOptions, OverallStatus, Platform, PlatformError, RawWorkflow, Repository,
    SubmitOutcome, WorkflowEdit, encode_content,
};
use std::collections::{BTreeMap, HashMap};
use std::sync::{Arc, Mutex};
use tokio_util::sync::CancellationToken;

/// Clone failures left per repository before it succeeds.
struct UnstablePlatform {
    failures_left: Mutex<HashMap<String, u32>>,
}

impl UnstablePlatform {
    fn new(failures: &[(&str, u32)]) -> Self {
        Self {
            failures_left: Mutex::new(
                failures
                    .iter()
                    .map(|(name, count)| ((*name).to_string(), *count))
                    .collect(),
            ),
        }
    }
}

impl Platform for UnstablePlatform {
    async fn list_organisations(
        &self,
        _cancel: &CancellationToken,
    ) -> Result<Vec<String>, PlatformError> {
        Ok(Vec::new())
    }

    async fn list_repositories(
        &self,
        _organisation: &str,
        _cancel: &CancellationToken,
    ) -> Result<Vec<Repository>, PlatformError> {
        Ok(Vec::new())
    }

    async fn clone_repository(
        &self,
        _organisation: &str,
        repository: &str,
        _cancel: &CancellationToken,
    ) -> Result<Vec<Branch>, PlatformError> {
        let mut failures_left = self.failures_left.lock().unwrap();
        if let Some(left) = failures_left.get_mut(repository)
            && *left > 0
        {
            *left -= 1;
            return Err(PlatformError::Other("clone failed".to_string()));
        }
        Ok(vec![
            Branch {
                repo: repository.to_string(),
                name: "main".to_string(),
            },
            Branch {
                repo: repository.to_string(),
                name: "release/2".to_string(),
            },
        ])
    }

    async fn fetch_workflows(
        &self,
        organisation: &str,
        repository: &str,
        _cancel: &CancellationToken,
    ) -> Result<Vec<RawWorkflow>, PlatformError> {
        Ok(vec![RawWorkflow {
            path: format!("{organisation}/{repository}/release/2/.github/workflows/ci.yml"),
            runs_on: Vec::new(),
            content: encode_content("jobs:\n  a:\n    runs-on: [self-hosted, linux]\n"),
        }])
    }

    async fn submit_edits(
        &self,
        _edits: Vec<WorkflowEdit>,
        _cancel: &CancellationToken,
    ) -> Result<BTreeMap<String, SubmitOutcome>, PlatformError> {
        Ok(BTreeMap::new())
    }

    async fn list_label_options(
        &self,
        _cancel: &CancellationToken,
    ) -> Result<LabelOptions, PlatformError> {
        Ok(LabelOptions::default())
    }
}

fn names(values: &[&str]) -> Vec<String> {
    values.iter().map(ToString::to_string).collect()
}

#[tokio::test(start_paused = true)]
async fn test_recovered_repository_feeds_workflow_loader() {
    let platform = Arc::new(UnstablePlatform::new(&[("api", 3)]));
    let cloner = RepoCloner::new(Arc::clone(&platform), "acme", 4);

    let summary = cloner.clone_all(names(&["svc", "api"])).await;
    assert_eq!(summary.status, OverallStatus::SuccessWithErrors);
    assert_eq!(cloner.coordinator().state("api"), RetryState::RetryScheduled);

    let summary = cloner.settle_retries().await;
    assert_eq!(summary.status, OverallStatus::Success);
    assert_eq!(cloner.selected_repositories(), names(&["svc", "api"]));

    let loader = WorkflowLoader::new(platform, 4);
    loader.set_context("acme", cloner.branches());
    let repositories = cloner.selected_repositories();
    assert_eq!(loader.load(&repositories).await, OverallStatus::Success);

    // The branch name contains a slash and still resolves
    let files = loader.files(&repositories);
    assert_eq!(files.len(), 2);
    assert_eq!(files[1].branch(), "release/2");
    assert_eq!(files[1].path.workflow_path, ".github/workflows/ci.yml");
    assert_eq!(files[1].labels, names(&["self-hosted", "linux"]));
}

#[tokio::test(start_paused = true)]
async fn test_retry_all_after_exhaustion() {
    let platform = Arc::new(UnstablePlatform::new(&[("api", 11)]));
    let cloner = RepoCloner::new(platform, "acme", 4);

    cloner.clone_all(names(&["svc", "api"])).await;
    let summary = cloner.settle_retries().await;
    assert_eq!(cloner.coordinator().state("api"), RetryState::Exhausted);
    assert_eq!(summary.failures.len(), 1);
    assert_eq!(cloner.selected_repositories(), names(&["svc"]));

    let summary = cloner.retry_all().await;
    assert_eq!(summary.status, OverallStatus::Success);
    assert_eq!(cloner.selected_repositories(), names(&["svc", "api"]));
}
