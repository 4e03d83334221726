use anyhow::Result;
use console::Term;
use log::info;
use std::sync::Arc;
use tokio_util::sync::CancellationToken;

use crate::config::Config;
use crate::domain::Platform;
use crate::infrastructure::{FileLabelStore, GithubPlatform, LabelStore, MemoryLabelStore};

use super::labels::{add_custom_label, merge_label_options, remove_custom_label};
use super::replace::{ReplaceOptions, ReplaceReport};
use super::scan::{ScanOptions, report, scan as scan_organisation};

/// List the organisations the token can see.
///
/// # Errors
///
/// Returns an error if the platform client cannot be created or the request fails.
pub async fn orgs(config: &Config, cancel: &CancellationToken) -> Result<()> {
    let platform = GithubPlatform::from_config(config)?;
    let organisations = platform.list_organisations(cancel).await?;
    if organisations.is_empty() {
        info!("No organisations found");
    }
    for organisation in organisations {
        info!("{organisation}");
    }
    Ok(())
}

/// List the repositories of an organisation.
///
/// # Errors
///
/// Returns an error if the platform client cannot be created or the request fails.
pub async fn repos(config: &Config, organisation: &str, cancel: &CancellationToken) -> Result<()> {
    let platform = GithubPlatform::from_config(config)?;
    let repositories = platform.list_repositories(organisation, cancel).await?;
    if repositories.is_empty() {
        info!("No repositories found in {organisation}");
    }
    for repository in repositories {
        if repository.private {
            info!("{} (private)", repository.name);
        } else {
            info!("{}", repository.name);
        }
    }
    Ok(())
}

/// List the replacement labels: the server's followed by the custom ones.
///
/// # Errors
///
/// Returns an error if the labels file cannot be read or the request fails.
pub async fn labels(config: &Config, cancel: &CancellationToken) -> Result<()> {
    let platform = GithubPlatform::from_config(config)?;
    let server = platform.list_label_options(cancel).await?;
    let store = FileLabelStore::load_or_default(&config.labels_file)?;
    for label in merge_label_options(&server, &store) {
        if store.has(&label) {
            info!("{label} (custom)");
        } else {
            info!("{label}");
        }
    }
    Ok(())
}

/// Store a custom replacement label in the labels file.
///
/// # Errors
///
/// Returns an error if the label is invalid or the labels file cannot be written.
pub fn add_label(config: &Config, input: &str) -> Result<()> {
    let mut store = FileLabelStore::load_or_default(&config.labels_file)?;
    let (label, added) = add_custom_label(input, &mut store)?;
    if added {
        info!("Added custom label {label}");
    } else {
        info!("{label} is already a custom label");
    }
    Ok(())
}

/// Remove a custom replacement label from the labels file.
///
/// # Errors
///
/// Returns an error if the labels file cannot be read or written.
pub fn remove_label(config: &Config, label: &str) -> Result<()> {
    let mut store = FileLabelStore::load_or_default(&config.labels_file)?;
    if remove_custom_label(label, &mut store)? {
        info!("Removed custom label {label}");
    } else {
        info!("{label} is not a custom label");
    }
    Ok(())
}

/// Scan an organisation and report the `runs-on` labels of every workflow.
///
/// # Errors
///
/// Returns an error if the platform client cannot be created or the scan fails.
pub async fn scan(config: &Config, options: &ScanOptions, cancel: &CancellationToken) -> Result<()> {
    let platform = Arc::new(GithubPlatform::from_config(config)?);
    let found = scan_organisation(platform, options, cancel).await?;
    report(&found.files);
    Ok(())
}

/// Run the replace command with automatic store selection based on labels file
/// existence.
///
/// # Errors
///
/// Returns an error if the platform client cannot be created, the labels file
/// cannot be loaded, or the replace command fails.
pub async fn replace(
    config: &Config,
    options: &ReplaceOptions,
    cancel: &CancellationToken,
) -> Result<ReplaceReport> {
    let platform = Arc::new(GithubPlatform::from_config(config)?);
    let term = Term::stdout();

    if config.labels_file.exists() {
        let mut store = FileLabelStore::load(&config.labels_file)?;
        super::replace::run(platform, &mut store, options, &term, cancel).await
    } else {
        let mut store = MemoryLabelStore::default();
        super::replace::run(platform, &mut store, options, &term, cancel).await
    }
}
