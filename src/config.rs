use std::env;
use std::path::PathBuf;

use crate::batch::DEFAULT_CONCURRENCY;
use crate::infrastructure::LABELS_FILE_NAME;

/// Address of a workflow assistant running locally
pub const DEFAULT_API_URL: &str = "http://localhost:8000";

/// Application configuration loaded from environment variables
#[derive(Debug, Clone)]
pub struct Config {
    /// Base URL of the workflow assistant API
    pub api_url: String,
    /// GitHub token forwarded to the API
    pub github_token: Option<String>,
    /// Concurrent requests per batch
    pub concurrency: usize,
    /// Where custom replacement labels are stored
    pub labels_file: PathBuf,
    /// Whether to show verbose output
    pub verbose: bool,
}

impl Config {
    /// Load configuration from environment variables
    ///
    /// Unset or invalid values fall back to the defaults.
    #[must_use]
    pub fn from_env() -> Self {
        Self {
            api_url: env::var("RELABEL_API_URL").unwrap_or_else(|_| DEFAULT_API_URL.to_string()),
            github_token: env::var("GITHUB_TOKEN").ok(),
            concurrency: env::var("RELABEL_CONCURRENCY")
                .ok()
                .and_then(|value| value.parse().ok())
                .filter(|&concurrency| concurrency > 0)
                .unwrap_or(DEFAULT_CONCURRENCY),
            labels_file: env::var_os("RELABEL_LABELS_FILE")
                .map_or_else(|| PathBuf::from(LABELS_FILE_NAME), PathBuf::from),
            verbose: false,
        }
    }

    /// Set verbose mode
    #[must_use]
    pub fn with_verbose(mut self, verbose: bool) -> Self {
        self.verbose = verbose;
        self
    }

    /// Override the API URL
    #[must_use]
    pub fn with_api_url(mut self, api_url: Option<String>) -> Self {
        if let Some(api_url) = api_url {
            self.api_url = api_url;
        }
        self
    }

    /// Override the batch concurrency
    #[must_use]
    pub fn with_concurrency(mut self, concurrency: Option<usize>) -> Self {
        if let Some(concurrency) = concurrency.filter(|&c| c > 0) {
            self.concurrency = concurrency;
        }
        self
    }
}

impl Default for Config {
    fn default() -> Self {
        Self::from_env()
    }
}
