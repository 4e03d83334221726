use anyhow::Result;
use console::Term;
use indexmap::IndexSet;
use indicatif::ProgressBar;
use log::{info, warn};
use std::sync::Arc;
use tokio_util::sync::CancellationToken;

use crate::domain::{Platform, ReplacementRule, Selection};
use crate::infrastructure::LabelStore;

use super::commit::{CommitReport, submit_changes};
use super::labels::choose_replacement;
use super::preview::{Plan, plan_changes, print_diff};
use super::scan::{ScanOptions, scan};

/// What to replace and whether to commit it.
#[derive(Debug, Clone, Default)]
pub struct ReplaceOptions {
    pub scan: ScanOptions,
    pub labels_to_replace: Vec<String>,
    pub replacement: String,
    /// Submit the changes instead of only previewing them
    pub commit: bool,
}

/// Counts of a replace run.
#[derive(Debug, Default)]
pub struct ReplaceReport {
    pub replacement: String,
    pub scanned: usize,
    pub plan: Plan,
    pub commit: Option<CommitReport>,
    /// Repositories whose workflows were fetched again after the commit
    pub refreshed: Vec<String>,
}

/// Replace `runs-on` labels across the workflows of an organisation.
///
/// Prints a diff for every file the rule changes, then submits the changes when
/// `options.commit` is set.
///
/// # Errors
///
/// Returns an error if the replacement label is invalid, the organisation can't
/// be scanned or the terminal can't be written. A commit that stops early is
/// reported in `ReplaceReport::commit` with the files it did commit.
pub async fn run<P: Platform, S: LabelStore>(
    platform: Arc<P>,
    store: &mut S,
    options: &ReplaceOptions,
    term: &Term,
    cancel: &CancellationToken,
) -> Result<ReplaceReport> {
    let server_labels = platform.list_label_options(cancel).await?;
    let replacement = choose_replacement(&options.replacement, &server_labels, store)?;
    let rule = ReplacementRule::new(
        options.labels_to_replace.iter().map(String::as_str),
        Some(replacement.clone()),
    );
    if rule.is_empty() {
        warn!("No labels to replace");
        return Ok(ReplaceReport {
            replacement,
            ..Default::default()
        });
    }

    let found = scan(Arc::clone(&platform), &options.scan, cancel).await?;

    let mut selection = Selection::new();
    selection.select_matching(&found.files, &rule);
    let plan = plan_changes(&found.files, &selection, &rule);

    for change in &plan.changes {
        print_diff(term, &change.diff())?;
    }
    info!(
        "{} of {} workflow files would change",
        plan.changes.len(),
        found.files.len()
    );
    if !plan.failures.is_empty() {
        warn!("{} files could not be parsed", plan.failures.len());
    }

    let mut report = ReplaceReport {
        replacement,
        scanned: found.files.len(),
        ..Default::default()
    };
    if plan.changes.is_empty() || !options.commit {
        if !options.commit && !plan.changes.is_empty() {
            info!("Run again with --yes to commit the changes");
        }
        report.plan = plan;
        return Ok(report);
    }

    let commit = submit_changes(
        platform.as_ref(),
        &plan.changes,
        cancel,
        &ProgressBar::new(0),
    )
    .await;
    info!(
        "Committed {} of {} files",
        commit.committed.len(),
        plan.changes.len()
    );
    for (path, error) in &commit.failed {
        warn!("{path}: {error}");
    }
    if !commit.unsent.is_empty() {
        warn!("{} files were not sent", commit.unsent.len());
    }

    let changed: IndexSet<String> = plan
        .changes
        .iter()
        .map(|change| change.repository.clone())
        .collect();
    let changed: Vec<String> = changed.into_iter().collect();
    let mut refreshed = commit.succeeded_repositories(&options.scan.organisation, &changed);
    if cancel.is_cancelled() {
        refreshed.clear();
    } else if !refreshed.is_empty() {
        found.loader.refresh(refreshed.clone()).await;
    }

    report.plan = plan;
    report.commit = Some(commit);
    report.refreshed = refreshed;
    Ok(report)
}
