use anyhow::Result;
use glob::Pattern;
use log::{debug, info, warn};
use std::sync::Arc;
use tokio_util::sync::CancellationToken;

use crate::domain::{Platform, WorkflowFile, group_by_branch};
use crate::error::NoRepositoriesFetched;

use super::repos::{CloneSummary, RepoCloner};
use super::workflows::WorkflowLoader;

/// Which repositories and workflow files to look at.
#[derive(Debug, Clone, Default)]
pub struct ScanOptions {
    pub organisation: String,
    /// Only these repositories, or all of them when empty
    pub repositories: Vec<String>,
    /// Glob matched against the workflow path inside the branch
    pub path_filter: Option<Pattern>,
    /// Clone the failed repositories once more after the background retries
    pub retry: bool,
    pub concurrency: usize,
}

/// Workflow files of an organisation, with the loaders that produced them.
pub struct Scan<P: Platform> {
    pub cloner: RepoCloner<P>,
    pub loader: WorkflowLoader,
    pub clone_summary: CloneSummary,
    pub files: Vec<WorkflowFile>,
}

/// Clone the repositories of an organisation and load their workflow files.
///
/// # Errors
///
/// Returns an error if the repositories can't be listed or none of them could be
/// cloned.
pub async fn scan<P: Platform>(
    platform: Arc<P>,
    options: &ScanOptions,
    cancel: &CancellationToken,
) -> Result<Scan<P>> {
    let cloner = RepoCloner::new(
        Arc::clone(&platform),
        &options.organisation,
        options.concurrency,
    );

    let listed = cloner.list_repositories(cancel).await?;
    let names: Vec<String> = listed
        .into_iter()
        .map(|repository| repository.name)
        .filter(|name| options.repositories.is_empty() || options.repositories.contains(name))
        .collect();
    for wanted in &options.repositories {
        if !names.contains(wanted) {
            warn!("{} has no repository named {wanted}", options.organisation);
        }
    }
    if names.is_empty() {
        info!("No repositories found in {}", options.organisation);
    }

    info!(
        "Fetching {} repositories of {}...",
        names.len(),
        options.organisation
    );
    let mut clone_summary = cloner.clone_all(names).await;
    if !clone_summary.retrying.is_empty() {
        info!(
            "Retrying {} repositories in the background...",
            clone_summary.retrying.len()
        );
        clone_summary = cloner.settle_retries().await;
    }
    if options.retry && !clone_summary.failures.is_empty() {
        info!("Fetching failed repositories again...");
        cloner.retry_all().await;
        clone_summary = cloner.settle_retries().await;
    }
    if let Some(message) = clone_summary.message() {
        warn!("{clone_summary}");
        if clone_summary.total > 0 && clone_summary.failures.len() == clone_summary.total {
            return Err(NoRepositoriesFetched(message).into());
        }
    }

    let repositories = cloner.selected_repositories();
    let loader = WorkflowLoader::new(platform, options.concurrency);
    loader.set_context(&options.organisation, cloner.branches());
    loader.load(&repositories).await;
    for (repository, error) in loader.failures(&repositories) {
        warn!("Could not load workflows of {repository}: {error}");
    }

    let files = filter_files(loader.files(&repositories), options.path_filter.as_ref());
    debug!("Loaded {} workflow files", files.len());

    Ok(Scan {
        cloner,
        loader,
        clone_summary,
        files,
    })
}

/// Keep the files whose workflow path matches the pattern.
#[must_use]
pub fn filter_files(files: Vec<WorkflowFile>, pattern: Option<&Pattern>) -> Vec<WorkflowFile> {
    match pattern {
        Some(pattern) => files
            .into_iter()
            .filter(|file| pattern.matches(&file.path.workflow_path))
            .collect(),
        None => files,
    }
}

/// Log every workflow file with its `runs-on` labels, grouped by branch.
pub fn report(files: &[WorkflowFile]) {
    if files.is_empty() {
        info!("No workflow files found");
        return;
    }
    for (branch, branch_files) in group_by_branch(files) {
        info!("{branch}");
        for file in branch_files {
            if file.labels.is_empty() {
                info!("  {}", file.path.workflow_path);
            } else {
                info!("  {}: {}", file.path.workflow_path, file.labels.join(", "));
            }
        }
    }
}
