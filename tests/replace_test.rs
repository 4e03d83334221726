use console::Term;
use relabel::commands::commit::CommitError;
use relabel::commands::replace::{self, ReplaceOptions};
use relabel::commands::scan::ScanOptions;
use relabel::domain::{
    Branch, LabelOptions, Platform, PlatformError, RawWorkflow, Repository, SubmitOutcome,
    WorkflowEdit, decode_content, encode_content,
};
use relabel::error::NoRepositoriesFetched;
use relabel::infrastructure::{GithubPlatform, LabelStore, MemoryLabelStore};
use serde_json::json;
use std::collections::BTreeMap;
use std::sync::atomic::{AtomicUsize, Ordering};
use std::sync::{Arc, Mutex};
use tokio_util::sync::CancellationToken;
use wiremock::matchers::{method, path};
use wiremock::{Mock, MockServer, ResponseTemplate};

const CI_WORKFLOW: &str = "name: CI
on: push
jobs:
  build:
    runs-on: [ubuntu-latest]
    steps:
      - uses: actions/checkout@v4
";

/// One organisation `acme` with repositories that each have a `main` branch.
struct AcmePlatform {
    repositories: Vec<String>,
    unreachable: Vec<&'static str>,
    /// Index of a submit request that fails as a whole
    failing_submit: Option<usize>,
    fetches: AtomicUsize,
    submitted: Mutex<Vec<Vec<WorkflowEdit>>>,
}

impl AcmePlatform {
    fn new(repositories: &[&str]) -> Self {
        Self {
            repositories: repositories.iter().map(ToString::to_string).collect(),
            unreachable: Vec::new(),
            failing_submit: None,
            fetches: AtomicUsize::new(0),
            submitted: Mutex::new(Vec::new()),
        }
    }
}

impl Platform for AcmePlatform {
    async fn list_organisations(
        &self,
        _cancel: &CancellationToken,
    ) -> Result<Vec<String>, PlatformError> {
        Ok(vec!["acme".to_string()])
    }

    async fn list_repositories(
        &self,
        _organisation: &str,
        _cancel: &CancellationToken,
    ) -> Result<Vec<Repository>, PlatformError> {
        Ok(self
            .repositories
            .iter()
            .zip(1_u64..)
            .map(|(name, id)| Repository {
                id,
                name: name.clone(),
                owner: "acme".to_string(),
                private: false,
            })
            .collect())
    }

    async fn clone_repository(
        &self,
        _organisation: &str,
        repository: &str,
        _cancel: &CancellationToken,
    ) -> Result<Vec<Branch>, PlatformError> {
        if self.unreachable.contains(&repository) {
            return Err(PlatformError::Other(format!("{repository} unreachable")));
        }
        Ok(vec![Branch {
            repo: repository.to_string(),
            name: "main".to_string(),
        }])
    }

    async fn fetch_workflows(
        &self,
        organisation: &str,
        repository: &str,
        _cancel: &CancellationToken,
    ) -> Result<Vec<RawWorkflow>, PlatformError> {
        self.fetches.fetch_add(1, Ordering::SeqCst);
        Ok(vec![RawWorkflow {
            path: format!("{organisation}/{repository}/main/.github/workflows/ci.yml"),
            runs_on: vec!["ubuntu-latest".to_string()],
            content: encode_content(CI_WORKFLOW),
        }])
    }

    async fn submit_edits(
        &self,
        edits: Vec<WorkflowEdit>,
        _cancel: &CancellationToken,
    ) -> Result<BTreeMap<String, SubmitOutcome>, PlatformError> {
        let mut submitted = self.submitted.lock().unwrap();
        if self.failing_submit == Some(submitted.len()) {
            return Err(PlatformError::Other("service unavailable".to_string()));
        }
        let outcomes = edits
            .iter()
            .map(|edit| (edit.path.clone(), SubmitOutcome::Committed { success: true }))
            .collect();
        submitted.push(edits);
        Ok(outcomes)
    }

    async fn list_label_options(
        &self,
        _cancel: &CancellationToken,
    ) -> Result<LabelOptions, PlatformError> {
        Ok(LabelOptions {
            labels: vec!["ubuntu-latest".to_string(), "ubuntu-22.04".to_string()],
        })
    }
}

fn options(commit: bool) -> ReplaceOptions {
    ReplaceOptions {
        scan: ScanOptions {
            organisation: "acme".to_string(),
            concurrency: 4,
            ..Default::default()
        },
        labels_to_replace: vec!["ubuntu-latest".to_string()],
        replacement: "ubuntu-22.04".to_string(),
        commit,
    }
}

fn changed_lines(diff: &str, marker: char) -> Vec<&str> {
    diff.lines()
        .filter(|line| !line.starts_with("---") && !line.starts_with("+++"))
        .filter(|line| line.starts_with(marker))
        .collect()
}

#[tokio::test]
async fn test_replace_commits_single_file_and_refreshes_cache() {
    let platform = Arc::new(AcmePlatform::new(&["svc"]));
    let mut store = MemoryLabelStore::default();

    let report = replace::run(
        Arc::clone(&platform),
        &mut store,
        &options(true),
        &Term::buffered_stdout(),
        &CancellationToken::new(),
    )
    .await
    .unwrap();

    // The preview only touches the runs-on line
    assert_eq!(report.plan.changes.len(), 1);
    let diff = report.plan.changes[0].diff();
    assert_eq!(changed_lines(&diff, '-'), vec!["-    runs-on: [ubuntu-latest]"]);
    assert_eq!(
        changed_lines(&diff, '+'),
        vec!["+    runs-on:", "+      - ubuntu-22.04"]
    );

    // Exactly one file is submitted
    let submitted = platform.submitted.lock().unwrap();
    assert_eq!(submitted.len(), 1);
    assert_eq!(submitted[0].len(), 1);
    assert_eq!(
        submitted[0][0].path,
        "acme/svc/main/.github/workflows/ci.yml"
    );
    assert_eq!(
        decode_content(&submitted[0][0].content),
        CI_WORKFLOW.replace(
            "    runs-on: [ubuntu-latest]\n",
            "    runs-on:\n      - ubuntu-22.04\n"
        )
    );

    // The repository is fetched again after the commit
    assert_eq!(report.refreshed, vec!["svc".to_string()]);
    assert_eq!(platform.fetches.load(Ordering::SeqCst), 2);

    // Server labels are not stored as custom labels
    assert!(store.labels().is_empty());
}

#[tokio::test]
async fn test_replace_without_commit_only_previews() {
    let platform = Arc::new(AcmePlatform::new(&["svc", "api"]));
    let mut store = MemoryLabelStore::default();

    let report = replace::run(
        Arc::clone(&platform),
        &mut store,
        &options(false),
        &Term::buffered_stdout(),
        &CancellationToken::new(),
    )
    .await
    .unwrap();

    assert_eq!(report.scanned, 2);
    assert_eq!(report.plan.changes.len(), 2);
    assert!(report.commit.is_none());
    assert!(platform.submitted.lock().unwrap().is_empty());
}

#[tokio::test]
async fn test_replace_with_custom_label_stores_it() {
    let platform = Arc::new(AcmePlatform::new(&["svc"]));
    let mut store = MemoryLabelStore::default();
    let mut options = options(false);
    options.replacement = "Self-Hosted--GPU".to_string();

    let report = replace::run(
        platform,
        &mut store,
        &options,
        &Term::buffered_stdout(),
        &CancellationToken::new(),
    )
    .await
    .unwrap();

    assert_eq!(report.replacement, "self-hosted-gpu");
    assert_eq!(store.labels(), ["self-hosted-gpu".to_string()]);
    assert!(report.plan.changes[0].after.contains("- self-hosted-gpu"));
}

#[tokio::test]
async fn test_replace_fails_when_no_repository_is_fetched() {
    let mut platform = AcmePlatform::new(&["svc"]);
    platform.unreachable = vec!["svc"];
    let mut store = MemoryLabelStore::default();

    let error = replace::run(
        Arc::new(platform),
        &mut store,
        &options(true),
        &Term::buffered_stdout(),
        &CancellationToken::new(),
    )
    .await
    .unwrap_err();

    let fetched = error.downcast_ref::<NoRepositoriesFetched>().unwrap();
    assert!(fetched.0.starts_with("Fetching failed for all repositories."));
}

#[tokio::test]
async fn test_failed_second_batch_keeps_first_batch_commits() {
    let names: Vec<String> = (0..51).map(|i| format!("r{i}")).collect();
    let names: Vec<&str> = names.iter().map(String::as_str).collect();
    let mut platform = AcmePlatform::new(&names);
    platform.failing_submit = Some(1);
    let platform = Arc::new(platform);
    let mut store = MemoryLabelStore::default();

    let report = replace::run(
        Arc::clone(&platform),
        &mut store,
        &options(true),
        &Term::buffered_stdout(),
        &CancellationToken::new(),
    )
    .await
    .unwrap();

    let commit = report.commit.unwrap();
    assert!(matches!(
        commit.aborted,
        Some(CommitError::Submit {
            submitted: 50,
            total: 51,
            ..
        })
    ));
    assert_eq!(commit.committed.len(), 50);
    assert_eq!(commit.committed[0], "acme/r0/main/.github/workflows/ci.yml");
    assert_eq!(
        commit.unsent,
        vec!["acme/r50/main/.github/workflows/ci.yml".to_string()]
    );

    // Only the repositories of the first batch are fetched again
    assert_eq!(report.refreshed.len(), 50);
    assert!(!report.refreshed.contains(&"r50".to_string()));
    assert_eq!(platform.fetches.load(Ordering::SeqCst), 101);
}

#[tokio::test]
async fn test_replace_through_http_api() {
    let server = MockServer::start().await;
    let routes = [
        ("/api/runs-on-labels", json!({"labels": ["ubuntu-latest", "ubuntu-22.04"]})),
        ("/api/orgs/acme/repos", json!([{"id": 1, "name": "svc"}])),
        (
            "/api/orgs/acme/repos/svc/fetch-workflows",
            json!([{"repo": "svc", "name": "main"}]),
        ),
        (
            "/api/orgs/acme/repos/svc/workflows",
            json!([{
                "path": "acme/svc/main/.github/workflows/ci.yml",
                "runs-on": ["ubuntu-latest"],
                "content": encode_content(CI_WORKFLOW),
            }]),
        ),
    ];
    for (route, body) in routes {
        Mock::given(method("GET"))
            .and(path(route))
            .respond_with(ResponseTemplate::new(200).set_body_json(body))
            .mount(&server)
            .await;
    }
    Mock::given(method("PUT"))
        .and(path("/api/workflows"))
        .respond_with(ResponseTemplate::new(200).set_body_json(json!({
            "acme/svc/main/.github/workflows/ci.yml": {"success": true}
        })))
        .expect(1)
        .mount(&server)
        .await;

    let platform = Arc::new(GithubPlatform::new(&server.uri(), Some("token".to_string())).unwrap());
    let mut store = MemoryLabelStore::default();

    let report = replace::run(
        platform,
        &mut store,
        &options(true),
        &Term::buffered_stdout(),
        &CancellationToken::new(),
    )
    .await
    .unwrap();

    let commit = report.commit.unwrap();
    assert_eq!(
        commit.committed,
        vec!["acme/svc/main/.github/workflows/ci.yml".to_string()]
    );
    assert!(commit.failed.is_empty());
}
