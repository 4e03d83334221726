use std::collections::BTreeMap;
use std::future::Future;

use serde::{Deserialize, Serialize};
use thiserror::Error;
use tokio_util::sync::CancellationToken;

/// A repository of an organisation.
#[derive(Debug, Clone, PartialEq, Eq, Deserialize, Serialize)]
pub struct Repository {
    pub id: u64,
    pub name: String,
    #[serde(default)]
    pub owner: String,
    #[serde(default)]
    pub private: bool,
}

/// A branch checked out by a clone.
#[derive(Debug, Clone, PartialEq, Eq, Hash, Deserialize, Serialize)]
pub struct Branch {
    pub repo: String,
    pub name: String,
}

/// A workflow file as the platform returns it, before path resolution.
#[derive(Debug, Clone, PartialEq, Eq, Deserialize, Serialize)]
pub struct RawWorkflow {
    /// Full path, `organisation/repository/branch/workflow_path`
    pub path: String,
    #[serde(rename = "runs-on", default)]
    pub runs_on: Vec<String>,
    /// Base64-encoded file content
    pub content: String,
}

/// New content for one workflow file.
#[derive(Debug, Clone, PartialEq, Eq, Serialize)]
pub struct WorkflowEdit {
    pub path: String,
    /// Base64-encoded file content
    pub content: String,
}

/// Per-file result of a submit.
#[derive(Debug, Clone, PartialEq, Eq, Deserialize)]
#[serde(untagged)]
pub enum SubmitOutcome {
    Failed { error: String },
    Committed { success: bool },
}

impl SubmitOutcome {
    #[must_use]
    pub fn is_success(&self) -> bool {
        matches!(self, SubmitOutcome::Committed { success: true })
    }

    /// Error message for a failed file.
    #[must_use]
    pub fn error(&self) -> Option<&str> {
        match self {
            SubmitOutcome::Failed { error } => Some(error),
            SubmitOutcome::Committed { success: true } => None,
            SubmitOutcome::Committed { success: false } => Some("not committed"),
        }
    }
}

/// Replacement labels offered by the platform.
#[derive(Debug, Clone, Default, PartialEq, Eq, Deserialize)]
pub struct LabelOptions {
    #[serde(default)]
    pub labels: Vec<String>,
}

/// Errors that can occur when talking to the workflow platform
#[derive(Debug, Error)]
pub enum PlatformError {
    #[error("failed to create HTTP client")]
    ClientInit(#[source] reqwest::Error),

    #[error("failed to {operation} at {url}")]
    Request {
        operation: &'static str,
        url: String,
        #[source]
        source: reqwest::Error,
    },

    #[error("workflow API returned status {status} for {url}")]
    ApiStatus {
        status: reqwest::StatusCode,
        url: String,
    },

    #[error("failed to parse response from {url}")]
    ParseResponse {
        url: String,
        #[source]
        source: reqwest::Error,
    },

    #[error("operation was cancelled")]
    Cancelled,

    /// Failure reported by a platform that doesn't speak HTTP
    #[error("{0}")]
    Other(String),
}

impl PlatformError {
    #[must_use]
    pub fn is_cancelled(&self) -> bool {
        matches!(self, PlatformError::Cancelled)
    }
}

/// Operations of the workflow platform.
///
/// Every call takes a cancellation token. Implementations return
/// `PlatformError::Cancelled` once the token fires instead of finishing the call.
pub trait Platform: Send + Sync + 'static {
    /// Organisations the current token can see.
    fn list_organisations(
        &self,
        cancel: &CancellationToken,
    ) -> impl Future<Output = Result<Vec<String>, PlatformError>> + Send;

    /// Repositories of an organisation.
    fn list_repositories(
        &self,
        organisation: &str,
        cancel: &CancellationToken,
    ) -> impl Future<Output = Result<Vec<Repository>, PlatformError>> + Send;

    /// Clone a repository on the platform side and return its branches.
    fn clone_repository(
        &self,
        organisation: &str,
        repository: &str,
        cancel: &CancellationToken,
    ) -> impl Future<Output = Result<Vec<Branch>, PlatformError>> + Send;

    /// Workflow files across all cloned branches of a repository.
    fn fetch_workflows(
        &self,
        organisation: &str,
        repository: &str,
        cancel: &CancellationToken,
    ) -> impl Future<Output = Result<Vec<RawWorkflow>, PlatformError>> + Send;

    /// Commit new workflow contents, keyed by path in the result.
    fn submit_edits(
        &self,
        edits: Vec<WorkflowEdit>,
        cancel: &CancellationToken,
    ) -> impl Future<Output = Result<BTreeMap<String, SubmitOutcome>, PlatformError>> + Send;

    /// Predefined replacement labels.
    fn list_label_options(
        &self,
        cancel: &CancellationToken,
    ) -> impl Future<Output = Result<LabelOptions, PlatformError>> + Send;
}
