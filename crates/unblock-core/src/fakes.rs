//! In-memory fakes for the collaborator traits (testing only)
//!
//! `MemoryAgent` and `MemoryRemote` satisfy the trait contracts without a
//! `buildkite-agent` binary or network access. Both can be scripted: a
//! sequence of answers is consumed one call at a time and the last answer
//! repeats once the sequence is exhausted.

use std::collections::{BTreeMap, HashMap, VecDeque};
use std::sync::Mutex;
use std::time::Duration;

use async_trait::async_trait;
use serde_json::json;

use crate::client::{AgentClient, ReleaseFields, ReleaseResponse, RemoteControlClient};
use crate::error::{GateError, Result};
use crate::job::{Job, StepState};

fn next_scripted<T: Clone>(queue: &mut VecDeque<T>) -> Option<T> {
    if queue.len() > 1 {
        queue.pop_front()
    } else {
        queue.front().cloned()
    }
}

// ---------------------------------------------------------------------------
// MemoryAgent
// ---------------------------------------------------------------------------

#[derive(Debug, Default)]
struct AgentState {
    label: String,
    label_updates: Vec<String>,
    step_states: HashMap<String, VecDeque<StepState>>,
    state_reads: HashMap<String, usize>,
    fail_state_reads: bool,
    fail_label_updates: bool,
}

/// In-memory control agent.
#[derive(Debug, Default)]
pub struct MemoryAgent {
    state: Mutex<AgentState>,
}

impl MemoryAgent {
    pub fn new(label: &str) -> Self {
        let agent = Self::default();
        agent.state.lock().unwrap().label = label.to_string();
        agent
    }

    /// Answer successive state reads of `step_key` with `states`.
    pub fn script_step_states(&self, step_key: &str, states: Vec<StepState>) {
        self.state
            .lock()
            .unwrap()
            .step_states
            .insert(step_key.to_string(), states.into());
    }

    /// Make every state read fail as if the agent command exited non-zero.
    pub fn fail_state_reads(&self) {
        self.state.lock().unwrap().fail_state_reads = true;
    }

    /// Make every label update fail as if the agent command exited non-zero.
    pub fn fail_label_updates(&self) {
        self.state.lock().unwrap().fail_label_updates = true;
    }

    pub fn label(&self) -> String {
        self.state.lock().unwrap().label.clone()
    }

    pub fn label_updates(&self) -> Vec<String> {
        self.state.lock().unwrap().label_updates.clone()
    }

    /// Number of state reads issued for `step_key`.
    pub fn state_reads(&self, step_key: &str) -> usize {
        self.state
            .lock()
            .unwrap()
            .state_reads
            .get(step_key)
            .copied()
            .unwrap_or(0)
    }
}

#[async_trait]
impl AgentClient for MemoryAgent {
    async fn get_self_label(&self) -> Result<String> {
        Ok(self.state.lock().unwrap().label.clone())
    }

    async fn update_self_label(&self, label: &str) -> Result<()> {
        let mut state = self.state.lock().unwrap();
        if state.fail_label_updates {
            return Err(GateError::AgentCommand {
                command: "buildkite-agent step update label".to_string(),
                exit_code: Some(1),
                stderr: "fake agent failure".to_string(),
            });
        }
        state.label = label.to_string();
        state.label_updates.push(label.to_string());
        Ok(())
    }

    async fn get_step_state(&self, step_key: &str) -> Result<StepState> {
        let mut state = self.state.lock().unwrap();
        *state.state_reads.entry(step_key.to_string()).or_default() += 1;

        if state.fail_state_reads {
            return Err(GateError::AgentCommand {
                command: format!("buildkite-agent step get state --step {step_key}"),
                exit_code: Some(1),
                stderr: "fake agent failure".to_string(),
            });
        }

        let scripted = state
            .step_states
            .get_mut(step_key)
            .and_then(next_scripted);
        scripted.ok_or_else(|| GateError::AgentCommand {
            command: format!("buildkite-agent step get state --step {step_key}"),
            exit_code: Some(1),
            stderr: format!("fatal: step {step_key} not found"),
        })
    }
}

// ---------------------------------------------------------------------------
// MemoryRemote
// ---------------------------------------------------------------------------

#[derive(Debug, Default)]
struct RemoteState {
    snapshots: VecDeque<Vec<Job>>,
    list_calls: usize,
    list_failure: Option<u16>,
    release_failures: HashMap<String, ReleaseResponse>,
    release_delays: HashMap<String, Duration>,
    release_attempts: Vec<String>,
    release_completions: Vec<String>,
    last_fields: Option<ReleaseFields>,
}

/// In-memory remote build API.
#[derive(Debug, Default)]
pub struct MemoryRemote {
    state: Mutex<RemoteState>,
}

impl MemoryRemote {
    /// A remote whose build always reports `jobs`.
    pub fn new(jobs: Vec<Job>) -> Self {
        Self::with_snapshots(vec![jobs])
    }

    /// A remote answering successive listings with `snapshots`.
    pub fn with_snapshots(snapshots: Vec<Vec<Job>>) -> Self {
        let remote = Self::default();
        remote.state.lock().unwrap().snapshots = snapshots.into();
        remote
    }

    /// The snapshot the next listing will return.
    pub fn jobs(&self) -> Vec<Job> {
        self.state
            .lock()
            .unwrap()
            .snapshots
            .front()
            .cloned()
            .unwrap_or_default()
    }

    /// Answer unblock calls for `job_id` with this status and body.
    pub fn fail_release(&self, job_id: &str, status: u16, body: serde_json::Value) {
        self.state
            .lock()
            .unwrap()
            .release_failures
            .insert(job_id.to_string(), ReleaseResponse { status, body });
    }

    /// Hold the unblock answer for `job_id` back for `delay`.
    pub fn delay_release(&self, job_id: &str, delay: Duration) {
        self.state
            .lock()
            .unwrap()
            .release_delays
            .insert(job_id.to_string(), delay);
    }

    /// Make every listing fail with `status`.
    pub fn fail_listing(&self, status: u16) {
        self.state.lock().unwrap().list_failure = Some(status);
    }

    pub fn list_calls(&self) -> usize {
        self.state.lock().unwrap().list_calls
    }

    /// Ids of jobs an unblock call was issued for, sorted.
    pub fn release_attempts(&self) -> Vec<String> {
        let mut attempts = self.state.lock().unwrap().release_attempts.clone();
        attempts.sort();
        attempts
    }

    /// Ids of jobs that were unblocked successfully, sorted.
    pub fn released_ids(&self) -> Vec<String> {
        let state = self.state.lock().unwrap();
        let mut released: Vec<String> = state
            .release_attempts
            .iter()
            .filter(|id| !state.release_failures.contains_key(*id))
            .cloned()
            .collect();
        released.sort();
        released
    }

    /// Ids of jobs whose unblock call has answered, in answer order.
    pub fn release_completions(&self) -> Vec<String> {
        self.state.lock().unwrap().release_completions.clone()
    }

    pub fn last_fields(&self) -> Option<ReleaseFields> {
        self.state.lock().unwrap().last_fields.clone()
    }
}

#[async_trait]
impl RemoteControlClient for MemoryRemote {
    async fn list_releasable_jobs(
        &self,
        pipeline_slug: &str,
        build_number: u64,
    ) -> Result<Vec<Job>> {
        let mut state = self.state.lock().unwrap();
        state.list_calls += 1;

        if let Some(status) = state.list_failure {
            return Err(GateError::RemoteStatus {
                operation: format!("get build {pipeline_slug}#{build_number}"),
                status,
                body: "fake listing failure".to_string(),
            });
        }

        let jobs = next_scripted(&mut state.snapshots).unwrap_or_default();
        Ok(jobs.into_iter().filter(|j| j.releasable).collect())
    }

    async fn release_job(&self, job: &Job, fields: &ReleaseFields) -> Result<ReleaseResponse> {
        if job.release_url.is_none() {
            return Err(GateError::InvalidTarget {
                job_id: job.id.clone(),
            });
        }

        let delay = {
            let mut state = self.state.lock().unwrap();
            state.release_attempts.push(job.id.clone());
            state.last_fields = Some(fields.clone());
            state.release_delays.get(&job.id).copied()
        };
        if let Some(delay) = delay {
            tokio::time::sleep(delay).await;
        }

        let mut state = self.state.lock().unwrap();
        state.release_completions.push(job.id.clone());
        if let Some(response) = state.release_failures.get(&job.id) {
            return Ok(response.clone());
        }
        Ok(ReleaseResponse {
            status: 200,
            body: json!({ "id": job.id, "state": "unblocked" }),
        })
    }
}

/// Release fields from `key=value` pairs.
pub fn fields(pairs: &[(&str, &str)]) -> ReleaseFields {
    pairs
        .iter()
        .map(|(k, v)| (k.to_string(), v.to_string()))
        .collect::<BTreeMap<_, _>>()
}
