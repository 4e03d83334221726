use indicatif::{ProgressBar, ProgressStyle};
use log::{debug, warn};
use std::collections::{BTreeMap, BTreeSet};
use thiserror::Error;
use tokio_util::sync::CancellationToken;

use super::preview::FileChange;
use crate::domain::{Platform, PlatformError, WorkflowEdit, encode_content, repository_in_path};

/// Most files sent in one submit request.
pub const COMMIT_BATCH_SIZE: usize = 50;

/// Why a commit stopped before every batch was submitted
#[derive(Debug, Error)]
pub enum CommitError {
    #[error("commit cancelled after {submitted} of {total} files")]
    Cancelled { submitted: usize, total: usize },

    #[error("failed to submit workflow changes after {submitted} of {total} files: {source}")]
    Submit {
        submitted: usize,
        total: usize,
        source: PlatformError,
    },
}

/// Per-file results of a commit.
#[derive(Debug, Default)]
pub struct CommitReport {
    pub committed: Vec<String>,
    /// Failed paths with the platform's message
    pub failed: BTreeMap<String, String>,
    /// Paths never sent because the commit stopped early
    pub unsent: Vec<String>,
    /// Set when the commit stopped before the last batch
    pub aborted: Option<CommitError>,
}

impl CommitReport {
    /// Repositories with at least one file that wasn't committed.
    #[must_use]
    pub fn failed_repositories(&self, organisation: &str) -> BTreeSet<String> {
        self.failed
            .keys()
            .filter_map(|path| repository_in_path(path, organisation))
            .map(ToString::to_string)
            .collect()
    }

    /// Repositories among `repositories` with a committed file and no failed one.
    #[must_use]
    pub fn succeeded_repositories(&self, organisation: &str, repositories: &[String]) -> Vec<String> {
        let failed = self.failed_repositories(organisation);
        let committed: BTreeSet<&str> = self
            .committed
            .iter()
            .filter_map(|path| repository_in_path(path, organisation))
            .collect();
        repositories
            .iter()
            .filter(|repository| {
                committed.contains(repository.as_str()) && !failed.contains(*repository)
            })
            .cloned()
            .collect()
    }

    fn abort(&mut self, error: CommitError, remaining: &[FileChange], progress: &ProgressBar) {
        progress.abandon();
        warn!("{error}");
        self.unsent = remaining
            .iter()
            .map(|change| change.original_path.clone())
            .collect();
        self.aborted = Some(error);
    }
}

/// Submit the changed files in batches.
///
/// Cancellation is checked between batches, so a batch that was already sent
/// completes. When the commit stops early the report still holds the results of
/// the batches that were sent, with the reason in `aborted`.
pub async fn submit_changes<P: Platform>(
    platform: &P,
    changes: &[FileChange],
    cancel: &CancellationToken,
    progress: &ProgressBar,
) -> CommitReport {
    let total = changes.len();
    progress.set_length(u64::try_from(total).unwrap_or(u64::MAX));
    progress.set_style(
        ProgressStyle::with_template("{spinner} Committing [{bar:30}] {pos}/{len} files")
            .unwrap_or_else(|_| ProgressStyle::default_bar()),
    );

    let mut report = CommitReport::default();
    let mut submitted = 0_usize;

    for batch in changes.chunks(COMMIT_BATCH_SIZE) {
        let remaining = changes.get(submitted..).unwrap_or_default();
        if cancel.is_cancelled() {
            report.abort(
                CommitError::Cancelled { submitted, total },
                remaining,
                progress,
            );
            return report;
        }

        let edits: Vec<WorkflowEdit> = batch
            .iter()
            .map(|change| WorkflowEdit {
                path: change.original_path.clone(),
                content: encode_content(&change.after),
            })
            .collect();
        debug!("Submitting {} files", edits.len());

        let outcomes = match platform.submit_edits(edits, cancel).await {
            Ok(outcomes) => outcomes,
            Err(PlatformError::Cancelled) => {
                report.abort(
                    CommitError::Cancelled { submitted, total },
                    remaining,
                    progress,
                );
                return report;
            }
            Err(source) => {
                report.abort(
                    CommitError::Submit {
                        submitted,
                        total,
                        source,
                    },
                    remaining,
                    progress,
                );
                return report;
            }
        };

        for change in batch {
            match outcomes.get(&change.original_path) {
                Some(outcome) if outcome.is_success() => {
                    report.committed.push(change.original_path.clone());
                }
                Some(outcome) => {
                    let message = outcome.error().unwrap_or("not committed").to_string();
                    report.failed.insert(change.original_path.clone(), message);
                }
                None => {
                    report
                        .failed
                        .insert(change.original_path.clone(), "no result returned".to_string());
                }
            }
        }

        submitted = submitted.saturating_add(batch.len());
        progress.inc(u64::try_from(batch.len()).unwrap_or(u64::MAX));
    }

    progress.finish_and_clear();
    report
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::domain::{Branch, LabelOptions, RawWorkflow, Repository, SubmitOutcome};
    use std::sync::Mutex;

    /// Records submitted batches and fails paths containing `fail`.
    #[derive(Default)]
    struct RecordingPlatform {
        batches: Mutex<Vec<Vec<WorkflowEdit>>>,
        cancel_after_first: Option<CancellationToken>,
        /// Index of a request that fails as a whole
        failing_request: Option<usize>,
    }

    impl Platform for RecordingPlatform {
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
            _repository: &str,
            _cancel: &CancellationToken,
        ) -> Result<Vec<Branch>, PlatformError> {
            Ok(Vec::new())
        }

        async fn fetch_workflows(
            &self,
            _organisation: &str,
            _repository: &str,
            _cancel: &CancellationToken,
        ) -> Result<Vec<RawWorkflow>, PlatformError> {
            Ok(Vec::new())
        }

        async fn submit_edits(
            &self,
            edits: Vec<WorkflowEdit>,
            _cancel: &CancellationToken,
        ) -> Result<BTreeMap<String, SubmitOutcome>, PlatformError> {
            if self.failing_request == Some(self.batches.lock().unwrap().len()) {
                return Err(PlatformError::Other("server unavailable".to_string()));
            }
            let outcomes = edits
                .iter()
                .map(|edit| {
                    let outcome = if edit.path.contains("fail") {
                        SubmitOutcome::Failed {
                            error: "Could not commit workflow changes.".to_string(),
                        }
                    } else {
                        SubmitOutcome::Committed { success: true }
                    };
                    (edit.path.clone(), outcome)
                })
                .collect();
            self.batches.lock().unwrap().push(edits);
            if let Some(token) = &self.cancel_after_first {
                token.cancel();
            }
            Ok(outcomes)
        }

        async fn list_label_options(
            &self,
            _cancel: &CancellationToken,
        ) -> Result<LabelOptions, PlatformError> {
            Ok(LabelOptions::default())
        }
    }

    fn changes(count: usize, repository: &str) -> Vec<FileChange> {
        (0..count)
            .map(|i| FileChange {
                original_path: format!("acme/{repository}/main/.github/workflows/{i}.yml"),
                repository: repository.to_string(),
                before: String::new(),
                after: format!("runs-on: r{i}\n"),
            })
            .collect()
    }

    #[tokio::test]
    async fn test_submit_in_batches_of_fifty() {
        let platform = RecordingPlatform::default();
        let changes = changes(120, "svc");

        let report = submit_changes(
            &platform,
            &changes,
            &CancellationToken::new(),
            &ProgressBar::hidden(),
        )
        .await;

        let batches = platform.batches.lock().unwrap();
        let sizes: Vec<usize> = batches.iter().map(Vec::len).collect();
        assert_eq!(sizes, vec![50, 50, 20]);
        assert_eq!(report.committed.len(), 120);
        assert!(report.failed.is_empty());
        assert_eq!(batches[0][0].content, encode_content("runs-on: r0\n"));
    }

    #[tokio::test]
    async fn test_failed_paths_map_to_repositories() {
        let platform = RecordingPlatform::default();
        let mut all = changes(2, "svc");
        all.extend(changes(1, "fail-repo"));

        let report =
            submit_changes(&platform, &all, &CancellationToken::new(), &ProgressBar::hidden()).await;

        assert_eq!(report.failed.len(), 1);
        assert_eq!(
            report.failed_repositories("acme"),
            BTreeSet::from(["fail-repo".to_string()])
        );
        let repositories = vec!["svc".to_string(), "fail-repo".to_string()];
        assert_eq!(
            report.succeeded_repositories("acme", &repositories),
            vec!["svc".to_string()]
        );
    }

    #[tokio::test]
    async fn test_cancel_stops_between_batches() {
        let cancel = CancellationToken::new();
        let platform = RecordingPlatform {
            cancel_after_first: Some(cancel.clone()),
            ..Default::default()
        };

        let report =
            submit_changes(&platform, &changes(60, "svc"), &cancel, &ProgressBar::hidden()).await;

        assert!(matches!(
            report.aborted,
            Some(CommitError::Cancelled {
                submitted: 50,
                total: 60
            })
        ));
        assert_eq!(report.committed.len(), 50);
        assert_eq!(report.unsent.len(), 10);
        assert_eq!(platform.batches.lock().unwrap().len(), 1);
    }

    #[tokio::test]
    async fn test_failed_request_keeps_earlier_batches() {
        let platform = RecordingPlatform {
            failing_request: Some(1),
            ..Default::default()
        };
        let mut all = changes(50, "svc");
        all.extend(changes(20, "api"));

        let report =
            submit_changes(&platform, &all, &CancellationToken::new(), &ProgressBar::hidden()).await;

        assert!(matches!(
            report.aborted,
            Some(CommitError::Submit {
                submitted: 50,
                total: 70,
                ..
            })
        ));
        assert_eq!(report.committed.len(), 50);
        assert_eq!(
            report.committed[0],
            "acme/svc/main/.github/workflows/0.yml"
        );
        assert_eq!(report.unsent.len(), 20);
        assert!(report.failed.is_empty());

        let repositories = vec!["svc".to_string(), "api".to_string()];
        assert_eq!(
            report.succeeded_repositories("acme", &repositories),
            vec!["svc".to_string()]
        );
    }
}
