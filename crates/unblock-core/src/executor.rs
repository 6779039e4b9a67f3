//! Concurrent release of selected jobs.
//!
//! Every job gets its own task; one job failing never stops the others, and
//! the executor always waits for the whole batch before reporting.

use crate::client::{ReleaseFields, RemoteControlClient};
use crate::error::GateError;
use crate::job::Job;
use futures::future::join_all;
use serde::{Deserialize, Serialize};
use std::collections::{BTreeMap, HashSet};
use std::fmt;
use std::sync::Arc;
use tracing::{debug, info, instrument, warn};

/// Why a job could not be released.
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
#[serde(tag = "reason", rename_all = "snake_case")]
pub enum ReleaseFailure {
    /// The job has no unblock URL; no call was made.
    InvalidTarget,
    /// The remote answered with a non-success status.
    Rejected { status: u16, message: String },
    /// The call did not complete.
    Transport { message: String },
}

impl fmt::Display for ReleaseFailure {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        match self {
            ReleaseFailure::InvalidTarget => write!(f, "job has no unblock target"),
            ReleaseFailure::Rejected { status, message } => {
                write!(f, "rejected with status {status}: {message}")
            }
            ReleaseFailure::Transport { message } => write!(f, "call failed: {message}"),
        }
    }
}

/// Result of releasing one job.
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
#[serde(tag = "result", rename_all = "snake_case")]
pub enum ReleaseOutcome {
    Released { status: u16 },
    /// The remote reported the job as already unblocked.
    AlreadyReleased { status: u16 },
    Failed { failure: ReleaseFailure },
}

impl ReleaseOutcome {
    pub fn is_released(&self) -> bool {
        !matches!(self, ReleaseOutcome::Failed { .. })
    }
}

/// Outcome of one job, with the step it belongs to.
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct JobRelease {
    pub job_id: String,
    pub step_key: Option<String>,
    pub outcome: ReleaseOutcome,
}

/// Per-job outcomes of a batch, keyed by job id.
pub type ReleaseOutcomes = BTreeMap<String, JobRelease>;

/// Releases batches of jobs through a [`RemoteControlClient`].
#[derive(Clone)]
pub struct ReleaseExecutor {
    remote: Arc<dyn RemoteControlClient>,
    fields: ReleaseFields,
}

impl ReleaseExecutor {
    pub fn new(remote: Arc<dyn RemoteControlClient>) -> Self {
        Self {
            remote,
            fields: ReleaseFields::new(),
        }
    }

    /// Submit these form fields with every unblock call.
    pub fn with_fields(mut self, fields: ReleaseFields) -> Self {
        self.fields = fields;
        self
    }

    /// Release every job concurrently and wait for all of them.
    ///
    /// Jobs without an unblock URL are reported as
    /// [`ReleaseFailure::InvalidTarget`] without a call. A job id listed
    /// twice is released once.
    #[instrument(skip(self, jobs), fields(jobs = jobs.len()))]
    pub async fn release_all(&self, jobs: &[Job]) -> ReleaseOutcomes {
        let mut outcomes = ReleaseOutcomes::new();
        let mut seen = HashSet::new();
        let mut pending = Vec::new();

        for job in jobs {
            if !seen.insert(job.id.as_str()) {
                debug!(job_id = %job.id, "Skipping duplicate job in release batch");
                continue;
            }

            if job.release_url.is_none() {
                warn!(job_id = %job.id, step_key = %job.display_key(), "Job has no unblock URL");
                outcomes.insert(
                    job.id.clone(),
                    JobRelease {
                        job_id: job.id.clone(),
                        step_key: job.step_key.clone(),
                        outcome: ReleaseOutcome::Failed {
                            failure: ReleaseFailure::InvalidTarget,
                        },
                    },
                );
                continue;
            }

            let remote = Arc::clone(&self.remote);
            let fields = self.fields.clone();
            let task_job = job.clone();
            let handle =
                tokio::spawn(async move { release_one(remote, &task_job, &fields).await });
            pending.push((job.clone(), handle));
        }

        let (pending_jobs, handles): (Vec<Job>, Vec<_>) = pending.into_iter().unzip();
        let results = join_all(handles).await;

        for (job, joined) in pending_jobs.into_iter().zip(results) {
            let outcome = joined.unwrap_or_else(|e| ReleaseOutcome::Failed {
                failure: ReleaseFailure::Transport {
                    message: format!("release task aborted: {e}"),
                },
            });
            outcomes.insert(
                job.id.clone(),
                JobRelease {
                    job_id: job.id,
                    step_key: job.step_key,
                    outcome,
                },
            );
        }

        let released = outcomes.values().filter(|r| r.outcome.is_released()).count();
        info!(
            released,
            failed = outcomes.len() - released,
            "Release batch finished"
        );
        outcomes
    }
}

async fn release_one(
    remote: Arc<dyn RemoteControlClient>,
    job: &Job,
    fields: &ReleaseFields,
) -> ReleaseOutcome {
    debug!(job_id = %job.id, step_key = %job.display_key(), "Unblocking job");

    match remote.release_job(job, fields).await {
        Ok(response) if response.is_success() => {
            info!(job_id = %job.id, step_key = %job.display_key(), status = response.status, "Unblocked job");
            ReleaseOutcome::Released {
                status: response.status,
            }
        }
        Ok(response) if response.is_already_released() => {
            info!(job_id = %job.id, step_key = %job.display_key(), status = response.status, "Job was already unblocked");
            ReleaseOutcome::AlreadyReleased {
                status: response.status,
            }
        }
        Ok(response) => {
            let message = response
                .message()
                .unwrap_or_else(|| response.body.to_string());
            warn!(
                job_id = %job.id,
                step_key = %job.display_key(),
                status = response.status,
                message = %message,
                "Unblock rejected"
            );
            ReleaseOutcome::Failed {
                failure: ReleaseFailure::Rejected {
                    status: response.status,
                    message,
                },
            }
        }
        Err(GateError::InvalidTarget { .. }) => ReleaseOutcome::Failed {
            failure: ReleaseFailure::InvalidTarget,
        },
        Err(e) => {
            warn!(job_id = %job.id, step_key = %job.display_key(), error = %e, "Unblock call failed");
            ReleaseOutcome::Failed {
                failure: ReleaseFailure::Transport {
                    message: e.to_string(),
                },
            }
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::fakes::MemoryRemote;
    use serde_json::json;
    use std::time::Duration;
    use tokio::time::Instant;

    #[tokio::test]
    async fn test_releases_every_job() {
        let remote = Arc::new(MemoryRemote::new(vec![
            Job::blocked("1", "deploy-a"),
            Job::blocked("2", "deploy-b"),
        ]));
        let executor = ReleaseExecutor::new(remote.clone());

        let outcomes = executor.release_all(&remote.jobs()).await;

        assert_eq!(outcomes.len(), 2);
        assert!(outcomes.values().all(|r| r.outcome.is_released()));
        assert_eq!(remote.released_ids(), vec!["1", "2"]);
    }

    #[tokio::test]
    async fn test_partial_failure_is_isolated() {
        let remote = Arc::new(MemoryRemote::new(vec![
            Job::blocked("1", "deploy-a"),
            Job::blocked("2", "deploy-b"),
            Job::blocked("3", "deploy-c"),
        ]));
        remote.fail_release("2", 500, json!({ "message": "boom" }));
        let executor = ReleaseExecutor::new(remote.clone());

        let outcomes = executor.release_all(&remote.jobs()).await;

        assert_eq!(outcomes.len(), 3);
        assert!(outcomes["1"].outcome.is_released());
        assert!(outcomes["3"].outcome.is_released());
        assert_eq!(
            outcomes["2"].outcome,
            ReleaseOutcome::Failed {
                failure: ReleaseFailure::Rejected {
                    status: 500,
                    message: "boom".to_string()
                }
            }
        );
        assert_eq!(remote.release_attempts(), vec!["1", "2", "3"]);
    }

    #[tokio::test]
    async fn test_job_without_target_is_not_attempted() {
        let remote = Arc::new(MemoryRemote::new(vec![
            Job::blocked("1", "deploy-a").without_release_url(),
            Job::blocked("2", "deploy-b"),
        ]));
        let executor = ReleaseExecutor::new(remote.clone());

        let outcomes = executor.release_all(&remote.jobs()).await;

        assert_eq!(
            outcomes["1"].outcome,
            ReleaseOutcome::Failed {
                failure: ReleaseFailure::InvalidTarget
            }
        );
        assert!(outcomes["2"].outcome.is_released());
        assert_eq!(remote.release_attempts(), vec!["2"]);
    }

    #[tokio::test]
    async fn test_already_unblocked_counts_as_released() {
        let remote = Arc::new(MemoryRemote::new(vec![Job::blocked("1", "deploy-a")]));
        remote.fail_release(
            "1",
            422,
            json!({ "message": "This job has already been unblocked" }),
        );
        let executor = ReleaseExecutor::new(remote.clone());

        let outcomes = executor.release_all(&remote.jobs()).await;
        assert_eq!(
            outcomes["1"].outcome,
            ReleaseOutcome::AlreadyReleased { status: 422 }
        );
    }

    #[tokio::test]
    async fn test_duplicate_ids_released_once() {
        let job = Job::blocked("1", "deploy-a");
        let remote = Arc::new(MemoryRemote::new(vec![job.clone()]));
        let executor = ReleaseExecutor::new(remote.clone());

        let outcomes = executor.release_all(&[job.clone(), job]).await;
        assert_eq!(outcomes.len(), 1);
        assert_eq!(remote.release_attempts(), vec!["1"]);
    }

    #[tokio::test]
    async fn test_fields_are_forwarded() {
        let remote = Arc::new(MemoryRemote::new(vec![Job::blocked("1", "deploy-a")]));
        let mut fields = ReleaseFields::new();
        fields.insert("release-name".to_string(), "v1.2.3".to_string());
        let executor = ReleaseExecutor::new(remote.clone()).with_fields(fields.clone());

        executor.release_all(&remote.jobs()).await;
        assert_eq!(remote.last_fields(), Some(fields));
    }

    #[tokio::test(start_paused = true)]
    async fn test_slow_calls_overlap() {
        let remote = Arc::new(MemoryRemote::new(vec![
            Job::blocked("1", "deploy-a"),
            Job::blocked("2", "deploy-b"),
            Job::blocked("3", "deploy-c"),
        ]));
        for id in ["1", "2", "3"] {
            remote.delay_release(id, Duration::from_secs(5));
        }
        let executor = ReleaseExecutor::new(remote.clone());

        let start = Instant::now();
        let outcomes = executor.release_all(&remote.jobs()).await;
        let elapsed = start.elapsed();

        assert!(outcomes.values().all(|r| r.outcome.is_released()));
        assert!(elapsed >= Duration::from_secs(5));
        assert!(elapsed < Duration::from_secs(10), "calls ran one after another: {elapsed:?}");
    }

    #[tokio::test(start_paused = true)]
    async fn test_hanging_call_does_not_hold_back_others() {
        let remote = Arc::new(MemoryRemote::new(vec![
            Job::blocked("1", "deploy-a"),
            Job::blocked("2", "deploy-b"),
            Job::blocked("3", "deploy-c"),
        ]));
        remote.delay_release("1", Duration::from_secs(1));
        remote.delay_release("2", Duration::from_secs(3600));
        remote.delay_release("3", Duration::from_secs(1));
        let executor = ReleaseExecutor::new(remote.clone());
        let jobs = remote.jobs();

        let batch = tokio::spawn(async move { executor.release_all(&jobs).await });
        tokio::time::sleep(Duration::from_secs(2)).await;

        let mut answered = remote.release_completions();
        answered.sort();
        assert_eq!(answered, vec!["1", "3"]);
        assert!(!batch.is_finished());

        let outcomes = batch.await.unwrap();
        assert_eq!(outcomes.len(), 3);
        assert!(outcomes.values().all(|r| r.outcome.is_released()));
        assert_eq!(remote.release_completions().last().map(String::as_str), Some("2"));
    }

    #[tokio::test]
    async fn test_empty_batch() {
        let remote = Arc::new(MemoryRemote::new(vec![]));
        let outcomes = ReleaseExecutor::new(remote).release_all(&[]).await;
        assert!(outcomes.is_empty());
    }
}
