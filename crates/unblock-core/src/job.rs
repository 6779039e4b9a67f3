//! Job snapshots as reported by the remote build API.

use serde::{Deserialize, Deserializer, Serialize};
use std::fmt;

/// State token of a step or job.
///
/// Only `blocked` holds a gate closed. Tokens the gate does not recognise are
/// kept verbatim and count as "not blocked".
#[derive(Debug, Clone, PartialEq, Eq, Hash, Serialize, Deserialize)]
#[serde(from = "String", into = "String")]
pub enum StepState {
    Blocked,
    Unblocked,
    Finished,
    Other(String),
}

impl StepState {
    /// Parse a state token, ignoring surrounding whitespace.
    pub fn parse(token: &str) -> Self {
        match token.trim() {
            "blocked" => StepState::Blocked,
            "unblocked" => StepState::Unblocked,
            "finished" => StepState::Finished,
            other => StepState::Other(other.to_string()),
        }
    }

    pub fn is_blocked(&self) -> bool {
        matches!(self, StepState::Blocked)
    }

    pub fn as_str(&self) -> &str {
        match self {
            StepState::Blocked => "blocked",
            StepState::Unblocked => "unblocked",
            StepState::Finished => "finished",
            StepState::Other(token) => token,
        }
    }
}

impl Default for StepState {
    /// The empty token: state unknown, not blocked.
    fn default() -> Self {
        StepState::Other(String::new())
    }
}

impl From<String> for StepState {
    fn from(token: String) -> Self {
        StepState::parse(&token)
    }
}

impl From<StepState> for String {
    fn from(state: StepState) -> Self {
        state.as_str().to_string()
    }
}

impl fmt::Display for StepState {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.write_str(self.as_str())
    }
}

/// One job of a build, captured at the time of the snapshot.
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct Job {
    /// Remote job identifier.
    pub id: String,

    /// Step key; jobs without one cannot be addressed individually.
    #[serde(default)]
    pub step_key: Option<String>,

    /// Whether the job can currently be unblocked.
    #[serde(default, rename = "unblockable", deserialize_with = "null_as_default")]
    pub releasable: bool,

    #[serde(default, deserialize_with = "null_as_default")]
    pub state: StepState,

    /// URL the unblock call is sent to.
    #[serde(default, rename = "unblock_url")]
    pub release_url: Option<String>,
}

/// The API sends `null` for fields a job type does not carry; read it as
/// an absent field.
fn null_as_default<'de, D, T>(deserializer: D) -> Result<T, D::Error>
where
    D: Deserializer<'de>,
    T: Deserialize<'de> + Default,
{
    Ok(Option::<T>::deserialize(deserializer)?.unwrap_or_default())
}

impl Job {
    /// A releasable, blocked job with an unblock URL derived from its id.
    pub fn blocked(id: impl Into<String>, step_key: impl Into<String>) -> Self {
        let id = id.into();
        Self {
            release_url: Some(format!("https://api.buildkite.com/v2/jobs/{id}/unblock")),
            id,
            step_key: Some(step_key.into()),
            releasable: true,
            state: StepState::Blocked,
        }
    }

    /// Mark this job as no longer releasable.
    pub fn not_releasable(mut self) -> Self {
        self.releasable = false;
        self
    }

    pub fn with_state(mut self, state: StepState) -> Self {
        self.state = state;
        self
    }

    pub fn without_release_url(mut self) -> Self {
        self.release_url = None;
        self
    }

    /// Step key for log lines, `-` when absent.
    pub fn display_key(&self) -> &str {
        self.step_key.as_deref().unwrap_or("-")
    }
}
