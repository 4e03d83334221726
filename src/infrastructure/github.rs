use log::debug;
use reqwest::RequestBuilder;
use serde::de::DeserializeOwned;
use std::collections::BTreeMap;
use std::future::Future;
use std::time::Duration;
use tokio_util::sync::CancellationToken;

use crate::config::Config;
use crate::domain::{
    Branch, LabelOptions, Platform, PlatformError, RawWorkflow, Repository, SubmitOutcome,
    WorkflowEdit,
};

const USER_AGENT: &str = "relabel-cli";
const REQUEST_TIMEOUT_SECS: u64 = 30;

/// HTTP client for the workflow assistant API, which clones repositories and
/// commits workflow changes on GitHub.
#[derive(Debug, Clone)]
pub struct GithubPlatform {
    client: reqwest::Client,
    base_url: String,
    token: Option<String>,
}

impl GithubPlatform {
    /// Create a client for the API at `base_url`.
    ///
    /// # Errors
    ///
    /// Returns `PlatformError::ClientInit` if the HTTP client cannot be initialized.
    pub fn new(base_url: &str, token: Option<String>) -> Result<Self, PlatformError> {
        let client = reqwest::Client::builder()
            .user_agent(USER_AGENT)
            .timeout(Duration::from_secs(REQUEST_TIMEOUT_SECS))
            .build()
            .map_err(PlatformError::ClientInit)?;

        Ok(Self {
            client,
            base_url: base_url.trim_end_matches('/').to_string(),
            token,
        })
    }

    /// Create a client from the API URL and token in the configuration.
    ///
    /// # Errors
    ///
    /// Returns `PlatformError::ClientInit` if the HTTP client cannot be initialized.
    pub fn from_config(config: &Config) -> Result<Self, PlatformError> {
        Self::new(&config.api_url, config.github_token.clone())
    }

    fn url(&self, path: &str) -> String {
        format!("{}/api/{path}", self.base_url)
    }

    fn authorize(&self, request: RequestBuilder) -> RequestBuilder {
        match &self.token {
            Some(token) => request.header("Authorization", format!("Bearer {token}")),
            None => request,
        }
    }

    /// Send a request and decode its JSON body, giving up as soon as `cancel` fires.
    async fn exchange<R: DeserializeOwned>(
        &self,
        operation: &'static str,
        request: RequestBuilder,
        url: String,
        cancel: &CancellationToken,
    ) -> Result<R, PlatformError> {
        if cancel.is_cancelled() {
            return Err(PlatformError::Cancelled);
        }

        let request = self.authorize(request);
        let exchange = async {
            debug!("{operation}: {url}");
            let response = request
                .send()
                .await
                .map_err(|source| PlatformError::Request {
                    operation,
                    url: url.clone(),
                    source,
                })?;

            if !response.status().is_success() {
                return Err(PlatformError::ApiStatus {
                    status: response.status(),
                    url: url.clone(),
                });
            }

            response
                .json::<R>()
                .await
                .map_err(|source| PlatformError::ParseResponse {
                    url: url.clone(),
                    source,
                })
        };

        match cancel.run_until_cancelled(exchange).await {
            Some(result) => result,
            None => Err(PlatformError::Cancelled),
        }
    }

    async fn get<R: DeserializeOwned>(
        &self,
        operation: &'static str,
        path: &str,
        cancel: &CancellationToken,
    ) -> Result<R, PlatformError> {
        let url = self.url(path);
        let request = self.client.get(&url);
        self.exchange(operation, request, url, cancel).await
    }
}

impl Platform for GithubPlatform {
    fn list_organisations(
        &self,
        cancel: &CancellationToken,
    ) -> impl Future<Output = Result<Vec<String>, PlatformError>> + Send {
        self.get("list organisations", "orgs", cancel)
    }

    fn list_repositories(
        &self,
        organisation: &str,
        cancel: &CancellationToken,
    ) -> impl Future<Output = Result<Vec<Repository>, PlatformError>> + Send {
        let path = format!("orgs/{organisation}/repos");
        async move { self.get("list repositories", &path, cancel).await }
    }

    fn clone_repository(
        &self,
        organisation: &str,
        repository: &str,
        cancel: &CancellationToken,
    ) -> impl Future<Output = Result<Vec<Branch>, PlatformError>> + Send {
        let path = format!("orgs/{organisation}/repos/{repository}/fetch-workflows");
        async move { self.get("clone repository", &path, cancel).await }
    }

    fn fetch_workflows(
        &self,
        organisation: &str,
        repository: &str,
        cancel: &CancellationToken,
    ) -> impl Future<Output = Result<Vec<RawWorkflow>, PlatformError>> + Send {
        let path = format!("orgs/{organisation}/repos/{repository}/workflows");
        async move { self.get("fetch workflows", &path, cancel).await }
    }

    fn submit_edits(
        &self,
        edits: Vec<WorkflowEdit>,
        cancel: &CancellationToken,
    ) -> impl Future<Output = Result<BTreeMap<String, SubmitOutcome>, PlatformError>> + Send {
        let url = self.url("workflows");
        let request = self.client.put(&url).json(&edits);
        self.exchange("submit workflows", request, url, cancel)
    }

    fn list_label_options(
        &self,
        cancel: &CancellationToken,
    ) -> impl Future<Output = Result<LabelOptions, PlatformError>> + Send {
        self.get("list labels", "runs-on-labels", cancel)
    }
}
