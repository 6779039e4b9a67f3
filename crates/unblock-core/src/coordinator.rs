//! Release coordination for one build gate.
//!
//! The coordinator walks `Init -> Deciding -> (ImmediateRelease | Waiting)
//! -> Releasing -> Done` exactly once. Waiting races the racers the policy
//! calls for; releasing always works on a freshly fetched snapshot.

use crate::client::{AgentClient, ReleaseFields, RemoteControlClient};
use crate::config::GatePlan;
use crate::error::{GateError, Result};
use crate::executor::{ReleaseExecutor, ReleaseOutcomes};
use crate::job::Job;
use crate::policy::{RaceEvent, WaitPolicy};
use crate::race::{Race, POLL_INTERVAL};
use crate::selector::select_jobs;
use chrono::{DateTime, Utc};
use serde::Serialize;
use std::fmt;
use std::sync::Arc;
use std::time::Duration;
use tracing::{debug, info, instrument, warn};
use uuid::Uuid;

/// Phases of a coordination cycle.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize)]
#[serde(rename_all = "snake_case")]
pub enum GatePhase {
    Init,
    Deciding,
    ImmediateRelease,
    Waiting,
    Releasing,
    Done,
}

impl fmt::Display for GatePhase {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        let name = match self {
            GatePhase::Init => "init",
            GatePhase::Deciding => "deciding",
            GatePhase::ImmediateRelease => "immediate_release",
            GatePhase::Waiting => "waiting",
            GatePhase::Releasing => "releasing",
            GatePhase::Done => "done",
        };
        f.write_str(name)
    }
}

/// Summary of one coordination cycle.
#[derive(Debug, Clone, Serialize)]
pub struct GateReport {
    pub cycle_id: Uuid,
    pub policy: WaitPolicy,
    /// The event that ended the wait; `None` for immediate release.
    pub race_event: Option<RaceEvent>,
    /// Phases the cycle went through, `init` to `done`.
    pub phases: Vec<GatePhase>,
    /// Step keys selected for release, sorted.
    pub selected: Vec<String>,
    pub outcomes: ReleaseOutcomes,
    pub started_at: DateTime<Utc>,
    pub finished_at: DateTime<Utc>,
}

impl GateReport {
    /// Jobs released, including jobs that were already unblocked.
    pub fn released_count(&self) -> usize {
        self.outcomes
            .values()
            .filter(|r| r.outcome.is_released())
            .count()
    }

    pub fn failed_count(&self) -> usize {
        self.outcomes.len() - self.released_count()
    }

    pub fn all_released(&self) -> bool {
        self.failed_count() == 0
    }
}

/// Drives one build gate from configuration to released steps.
pub struct ReleaseCoordinator {
    agent: Arc<dyn AgentClient>,
    remote: Arc<dyn RemoteControlClient>,
    executor: ReleaseExecutor,
    pipeline_slug: String,
    build_number: u64,
    plan: GatePlan,
    poll_interval: Duration,
}

impl ReleaseCoordinator {
    pub fn new(
        agent: Arc<dyn AgentClient>,
        remote: Arc<dyn RemoteControlClient>,
        pipeline_slug: impl Into<String>,
        build_number: u64,
        plan: GatePlan,
    ) -> Self {
        Self {
            executor: ReleaseExecutor::new(Arc::clone(&remote)),
            agent,
            remote,
            pipeline_slug: pipeline_slug.into(),
            build_number,
            plan,
            poll_interval: POLL_INTERVAL,
        }
    }

    /// Submit these form fields with every unblock call.
    pub fn with_fields(mut self, fields: ReleaseFields) -> Self {
        self.executor = self.executor.with_fields(fields);
        self
    }

    pub fn with_poll_interval(mut self, poll_interval: Duration) -> Self {
        self.poll_interval = poll_interval;
        self
    }

    pub fn policy(&self) -> &WaitPolicy {
        &self.plan.policy
    }

    /// Jobs that would be released if the gate opened now.
    pub async fn preview(&self) -> Result<Vec<Job>> {
        let jobs = self
            .remote
            .list_releasable_jobs(&self.pipeline_slug, self.build_number)
            .await?;
        Ok(select_jobs(
            &jobs,
            &self.plan.selection,
            self.plan.policy.override_step_key(),
        ))
    }

    /// Run the gate to completion. Consumes the coordinator: a gate opens
    /// once and is never reused.
    #[instrument(
        skip(self),
        fields(
            pipeline = %self.pipeline_slug,
            build = self.build_number,
            policy = %self.plan.policy,
        )
    )]
    pub async fn run(self) -> Result<GateReport> {
        let cycle_id = Uuid::new_v4();
        let started_at = Utc::now();
        let mut phases = vec![GatePhase::Init];
        info!(cycle_id = %cycle_id, "Starting gate");

        advance(&mut phases, GatePhase::Deciding);
        let race_event = if self.plan.policy.is_immediate() {
            advance(&mut phases, GatePhase::ImmediateRelease);
            None
        } else {
            self.prepare_wait().await?;
            advance(&mut phases, GatePhase::Waiting);
            Some(self.wait().await?)
        };

        advance(&mut phases, GatePhase::Releasing);
        let selected = self.preview().await?;
        if selected.is_empty() {
            info!("No releasable steps match the gate");
        } else {
            info!(
                steps = ?selected.iter().map(Job::display_key).collect::<Vec<_>>(),
                "Unblocking steps"
            );
        }
        let outcomes = self.executor.release_all(&selected).await;

        advance(&mut phases, GatePhase::Done);
        let report = GateReport {
            cycle_id,
            policy: self.plan.policy.clone(),
            race_event,
            phases,
            selected: selected
                .iter()
                .filter_map(|j| j.step_key.clone())
                .collect(),
            outcomes,
            started_at,
            finished_at: Utc::now(),
        };

        if report.all_released() {
            info!(released = report.released_count(), "Gate finished");
        } else {
            warn!(
                released = report.released_count(),
                failed = report.failed_count(),
                "Gate finished with failed unblocks"
            );
        }
        Ok(report)
    }

    /// Check the override step exists and advertise the wait on the gate's
    /// own label. The label is cosmetic: failing to update it only warns.
    ///
    /// Only a "not found" answer from the agent is a configuration error;
    /// any other agent failure keeps its collaborator error.
    async fn prepare_wait(&self) -> Result<()> {
        if let Some(key) = self.plan.policy.override_step_key() {
            match self.agent.get_step_state(key).await {
                Ok(state) => debug!(step_key = %key, state = %state, "Override step found"),
                Err(GateError::AgentCommand {
                    exit_code, stderr, ..
                }) if is_missing_step(exit_code, &stderr) => {
                    return Err(GateError::InvalidConfig(format!(
                        "override step `{key}` does not exist: {}",
                        stderr.trim()
                    )));
                }
                Err(e) => {
                    warn!(step_key = %key, error = %e, "Could not read override step");
                    return Err(e);
                }
            }
        }

        if let Some(suffix) = self.plan.policy.label_suffix() {
            if let Err(e) = self.update_label(&suffix).await {
                warn!(error = %e, "Could not update gate label");
            }
        }
        Ok(())
    }

    async fn update_label(&self, suffix: &str) -> Result<()> {
        let label = self.agent.get_self_label().await?;
        let label = label.trim();
        let new_label = if label.is_empty() {
            suffix.to_string()
        } else {
            format!("{label} {suffix}")
        };
        debug!(label = %new_label, "Updating gate label");
        self.agent.update_self_label(&new_label).await
    }

    async fn wait(&self) -> Result<RaceEvent> {
        let mut race = Race::new().with_poll_interval(self.poll_interval);

        match &self.plan.policy {
            WaitPolicy::Immediate => {}
            WaitPolicy::AfterDelay { delay } => race.spawn_timer(*delay),
            WaitPolicy::AfterDelayOrOverride {
                delay,
                override_step_key,
            } => {
                race.spawn_timer(*delay);
                race.spawn_override_poll(Arc::clone(&self.agent), override_step_key.clone());
            }
            WaitPolicy::UntilOverrideOrExhaustion { override_step_key } => {
                race.spawn_monitor(
                    Arc::clone(&self.remote),
                    self.pipeline_slug.clone(),
                    self.build_number,
                    override_step_key.clone(),
                );
                race.spawn_override_poll(Arc::clone(&self.agent), override_step_key.clone());
            }
        }

        debug!(racers = race.len(), "Waiting for the first race event");
        race.winner().await
    }
}

fn advance(phases: &mut Vec<GatePhase>, next: GatePhase) {
    if let Some(current) = phases.last() {
        debug!(from = %current, to = %next, "Gate phase transition");
    }
    phases.push(next);
}

/// Whether a failed agent read says the step does not exist.
fn is_missing_step(exit_code: Option<i32>, stderr: &str) -> bool {
    exit_code.is_some() && stderr.to_ascii_lowercase().contains("not found")
}
