//! Buildkite REST API binding
//!
//! Reads the jobs of a build and unblocks individual jobs through their
//! `unblock_url`. Only the listing treats a non-2xx answer as an error; the
//! raw unblock answer is handed back so the caller can classify it per job.

use crate::error::{BuildkiteError, Result};
use async_trait::async_trait;
use serde::Deserialize;
use serde_json::json;
use std::fmt;
use tracing::debug;
use unblock_core::{
    BuildContext, GateError, Job, ReleaseFields, ReleaseResponse, RemoteControlClient,
};

/// Public Buildkite REST endpoint.
pub const DEFAULT_BASE_URL: &str = "https://api.buildkite.com/v2";

const USER_AGENT: &str = concat!("multi-unblock/", env!("CARGO_PKG_VERSION"));

/// Connection settings for the REST API
#[derive(Clone)]
pub struct ApiConfig {
    /// Base URL without a trailing slash
    pub base_url: String,
    /// Organization slug
    pub org: String,
    /// Bearer token
    pub token: String,
}

impl fmt::Debug for ApiConfig {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.debug_struct("ApiConfig")
            .field("base_url", &self.base_url)
            .field("org", &self.org)
            .field("token", &"<redacted>")
            .finish()
    }
}

impl ApiConfig {
    pub fn new(org: &str, token: &str) -> Self {
        ApiConfig {
            base_url: DEFAULT_BASE_URL.to_string(),
            org: org.to_string(),
            token: token.to_string(),
        }
    }

    /// Config for the organization and token of a running build
    pub fn from_context(context: &BuildContext) -> Self {
        Self::new(&context.org, &context.api_token)
    }

    /// Talk to another server, e.g. a local mock
    pub fn with_base_url(mut self, base_url: &str) -> Self {
        self.base_url = base_url.trim_end_matches('/').to_string();
        self
    }
}

/// Build as returned by the REST API; only the fields the gate reads.
#[derive(Debug, Clone, Deserialize)]
pub struct Build {
    #[serde(default)]
    pub id: Option<String>,
    #[serde(default)]
    pub jobs: Vec<Job>,
}

/// Buildkite REST client
pub struct BuildkiteApi {
    config: ApiConfig,
    http: reqwest::Client,
}

impl BuildkiteApi {
    pub fn new(config: ApiConfig) -> Result<Self> {
        let http = reqwest::Client::builder().user_agent(USER_AGENT).build()?;
        Ok(BuildkiteApi { config, http })
    }

    pub fn config(&self) -> &ApiConfig {
        &self.config
    }

    fn build_url(&self, pipeline_slug: &str, build_number: u64) -> String {
        format!(
            "{}/organizations/{}/pipelines/{}/builds/{}",
            self.config.base_url, self.config.org, pipeline_slug, build_number
        )
    }

    /// Fetch a build with all of its jobs.
    pub async fn get_build(&self, pipeline_slug: &str, build_number: u64) -> Result<Build> {
        let operation = format!("get build {pipeline_slug}#{build_number}");
        let url = self.build_url(pipeline_slug, build_number);

        let response = self
            .http
            .get(&url)
            .bearer_auth(&self.config.token)
            .send()
            .await
            .map_err(|e| BuildkiteError::Transport {
                operation: operation.clone(),
                message: e.to_string(),
            })?;
        let status = response.status();
        let body = response.text().await.map_err(|e| BuildkiteError::Transport {
            operation: operation.clone(),
            message: e.to_string(),
        })?;
        debug!(operation = %operation, status = status.as_u16(), "Buildkite API response");

        if !status.is_success() {
            return Err(BuildkiteError::Status {
                operation,
                status: status.as_u16(),
                body,
            });
        }
        Ok(serde_json::from_str(&body)?)
    }

    /// PUT `{"fields": ...}` to an unblock URL and return the raw answer.
    pub async fn unblock(
        &self,
        unblock_url: &str,
        fields: &ReleaseFields,
    ) -> Result<ReleaseResponse> {
        let operation = format!("unblock {unblock_url}");

        let response = self
            .http
            .put(unblock_url)
            .bearer_auth(&self.config.token)
            .json(&json!({ "fields": fields }))
            .send()
            .await
            .map_err(|e| BuildkiteError::Transport {
                operation: operation.clone(),
                message: e.to_string(),
            })?;
        let status = response.status().as_u16();
        let text = response.text().await.map_err(|e| BuildkiteError::Transport {
            operation: operation.clone(),
            message: e.to_string(),
        })?;
        debug!(operation = %operation, status, "Buildkite API response");

        let body = serde_json::from_str(&text).unwrap_or(serde_json::Value::String(text));
        Ok(ReleaseResponse { status, body })
    }
}

#[async_trait]
impl RemoteControlClient for BuildkiteApi {
    async fn list_releasable_jobs(
        &self,
        pipeline_slug: &str,
        build_number: u64,
    ) -> unblock_core::Result<Vec<Job>> {
        let build = self.get_build(pipeline_slug, build_number).await?;
        let total = build.jobs.len();
        let jobs: Vec<Job> = build.jobs.into_iter().filter(|j| j.releasable).collect();
        debug!(total, releasable = jobs.len(), "Listed build jobs");
        Ok(jobs)
    }

    async fn release_job(
        &self,
        job: &Job,
        fields: &ReleaseFields,
    ) -> unblock_core::Result<ReleaseResponse> {
        let url = job
            .release_url
            .as_deref()
            .ok_or_else(|| GateError::InvalidTarget {
                job_id: job.id.clone(),
            })?;
        Ok(self.unblock(url, fields).await?)
    }
}
