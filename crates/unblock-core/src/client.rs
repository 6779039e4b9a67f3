//! Collaborator interfaces the gate drives.
//!
//! - `AgentClient`: the local control agent (own step label, other steps' state)
//! - `RemoteControlClient`: the remote build API (job snapshots, unblock calls)
//!
//! Both are async and backend-agnostic. In-memory fakes live in the `fakes`
//! module; the Buildkite bindings live in the `buildkite-client` crate.

use crate::error::Result;
use crate::job::{Job, StepState};
use async_trait::async_trait;
use serde::{Deserialize, Serialize};
use std::collections::BTreeMap;

/// Form fields submitted with an unblock call.
pub type ReleaseFields = BTreeMap<String, String>;

/// Raw answer of the remote API to an unblock call.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct ReleaseResponse {
    pub status: u16,
    pub body: serde_json::Value,
}

impl ReleaseResponse {
    pub fn is_success(&self) -> bool {
        (200..300).contains(&self.status)
    }

    /// Whether the remote refused because the job was already unblocked.
    pub fn is_already_released(&self) -> bool {
        matches!(self.status, 409 | 422)
            && self
                .message()
                .map(|m| m.to_ascii_lowercase().contains("already"))
                .unwrap_or(false)
    }

    /// Error message reported by the remote, if any.
    pub fn message(&self) -> Option<String> {
        match &self.body {
            serde_json::Value::String(s) if !s.is_empty() => Some(s.clone()),
            serde_json::Value::Object(map) => map
                .get("message")
                .and_then(|m| m.as_str())
                .map(str::to_string),
            _ => None,
        }
    }
}

/// The local control agent, scoped to the step running the gate.
#[async_trait]
pub trait AgentClient: Send + Sync {
    /// Current label of the gate's own step.
    async fn get_self_label(&self) -> Result<String>;

    /// Replace the label of the gate's own step.
    async fn update_self_label(&self, label: &str) -> Result<()>;

    /// State of another step in the same build.
    async fn get_step_state(&self, step_key: &str) -> Result<StepState>;
}

/// The remote build API.
#[async_trait]
pub trait RemoteControlClient: Send + Sync {
    /// Snapshot of the releasable jobs of a build.
    async fn list_releasable_jobs(&self, pipeline_slug: &str, build_number: u64)
        -> Result<Vec<Job>>;

    /// Unblock one job.
    ///
    /// Returns the remote's answer for any HTTP status; `Err` is reserved for
    /// jobs without an unblock URL (`GateError::InvalidTarget`) and transport
    /// failures.
    async fn release_job(&self, job: &Job, fields: &ReleaseFields) -> Result<ReleaseResponse>;
}
