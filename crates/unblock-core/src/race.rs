//! Racing completion signals.
//!
//! A [`Race`] owns the racers of one coordination cycle. Each racer runs in
//! its own task and watches a cancellation token shared by the cycle. The
//! first racer to finish decides the outcome; every other racer is cancelled,
//! aborted and drained before [`Race::winner`] returns, so nothing from this
//! cycle outlives it. A race is consumed by `winner` and cannot be reused.

use crate::client::{AgentClient, RemoteControlClient};
use crate::error::{GateError, Result};
use crate::policy::RaceEvent;
use futures::future::{join_all, select_all};
use std::fmt;
use std::future::Future;
use std::sync::Arc;
use std::time::Duration;
use tokio::task::JoinHandle;
use tokio_util::sync::CancellationToken;
use tracing::{debug, info, warn};

/// Interval between polls of the override step and of the job snapshot.
pub const POLL_INTERVAL: Duration = Duration::from_secs(10);

/// The tasks that can end a wait.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum Racer {
    Timer,
    OverridePoll,
    Monitor,
}

impl fmt::Display for Racer {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        match self {
            Racer::Timer => write!(f, "timer"),
            Racer::OverridePoll => write!(f, "override_poll"),
            Racer::Monitor => write!(f, "monitor"),
        }
    }
}

/// `None` when the racer observed cancellation before producing a result.
type RacerOutput = Option<Result<RaceEvent>>;

/// Racers of one coordination cycle.
pub struct Race {
    cancel: CancellationToken,
    racers: Vec<(Racer, JoinHandle<RacerOutput>)>,
    poll_interval: Duration,
}

impl Default for Race {
    fn default() -> Self {
        Self::new()
    }
}

impl Race {
    pub fn new() -> Self {
        Self {
            cancel: CancellationToken::new(),
            racers: Vec::new(),
            poll_interval: POLL_INTERVAL,
        }
    }

    /// Override the poll interval of racers spawned afterwards.
    pub fn with_poll_interval(mut self, poll_interval: Duration) -> Self {
        self.poll_interval = poll_interval;
        self
    }

    pub fn len(&self) -> usize {
        self.racers.len()
    }

    pub fn is_empty(&self) -> bool {
        self.racers.is_empty()
    }

    /// Fires [`RaceEvent::TimerExpired`] once `delay` has elapsed.
    pub fn spawn_timer(&mut self, delay: Duration) {
        self.spawn(Racer::Timer, async move {
            tokio::time::sleep(delay).await;
            info!(delay_secs = delay.as_secs(), "Timer expired");
            Ok(RaceEvent::TimerExpired)
        });
    }

    /// Fires [`RaceEvent::OverrideResolved`] once `step_key` is no longer
    /// blocked. Polls immediately, then every poll interval.
    pub fn spawn_override_poll(&mut self, agent: Arc<dyn AgentClient>, step_key: String) {
        let interval = self.poll_interval;
        self.spawn(Racer::OverridePoll, async move {
            let mut poll = 0u64;
            loop {
                poll += 1;
                let state = agent.get_step_state(&step_key).await?;
                debug!(step_key = %step_key, state = %state, poll, "Polled override step");
                if !state.is_blocked() {
                    info!(step_key = %step_key, state = %state, "Override step resolved");
                    return Ok(RaceEvent::OverrideResolved);
                }
                tokio::time::sleep(interval).await;
            }
        });
    }

    /// Fires [`RaceEvent::NoWorkRemaining`] once the build has no releasable
    /// job left apart from the override step. Polls immediately, then every
    /// poll interval, with no overall bound.
    pub fn spawn_monitor(
        &mut self,
        remote: Arc<dyn RemoteControlClient>,
        pipeline_slug: String,
        build_number: u64,
        override_step_key: String,
    ) {
        let interval = self.poll_interval;
        self.spawn(Racer::Monitor, async move {
            let mut poll = 0u64;
            loop {
                poll += 1;
                let jobs = remote
                    .list_releasable_jobs(&pipeline_slug, build_number)
                    .await?;
                let remaining = jobs
                    .iter()
                    .filter(|j| j.releasable)
                    .filter(|j| j.step_key.as_deref() != Some(override_step_key.as_str()))
                    .count();
                debug!(remaining, poll, "Polled releasable jobs");
                if remaining == 0 {
                    info!(poll, "No releasable work remains besides the override step");
                    return Ok(RaceEvent::NoWorkRemaining);
                }
                tokio::time::sleep(interval).await;
            }
        });
    }

    fn spawn<F>(&mut self, racer: Racer, fut: F)
    where
        F: Future<Output = Result<RaceEvent>> + Send + 'static,
    {
        let cancel = self.cancel.clone();
        let handle = tokio::spawn(async move {
            tokio::select! {
                biased;
                _ = cancel.cancelled() => None,
                result = fut => Some(result),
            }
        });
        debug!(racer = %racer, "Started racer");
        self.racers.push((racer, handle));
    }

    /// Wait for the first racer to finish and cancel the rest.
    ///
    /// A racer that fails, panics or is aborted before producing an event
    /// ends the race with an error. Results of the losing racers are
    /// discarded, even if they finished in the same instant.
    pub async fn winner(self) -> Result<RaceEvent> {
        if self.racers.is_empty() {
            return Err(GateError::RacerAborted {
                racer: "race".to_string(),
                reason: "no racers were started".to_string(),
            });
        }

        let (names, handles): (Vec<Racer>, Vec<_>) = self.racers.into_iter().unzip();
        let (first, index, losers) = select_all(handles).await;
        let racer = names[index];

        self.cancel.cancel();
        for loser in &losers {
            loser.abort();
        }
        for (late, loser) in join_all(losers).await.into_iter().zip(
            names
                .iter()
                .enumerate()
                .filter(|(i, _)| *i != index)
                .map(|(_, r)| r),
        ) {
            if let Ok(Some(Ok(event))) = late {
                debug!(racer = %loser, event = %event, "Discarding late race event");
            }
        }

        match first {
            Ok(Some(Ok(event))) => {
                info!(racer = %racer, event = %event, "Race resolved");
                Ok(event)
            }
            Ok(Some(Err(e))) => {
                warn!(racer = %racer, error = %e, "Racer failed");
                Err(e)
            }
            Ok(None) => Err(GateError::RacerAborted {
                racer: racer.to_string(),
                reason: "cancelled before producing an event".to_string(),
            }),
            Err(join_error) => Err(GateError::RacerAborted {
                racer: racer.to_string(),
                reason: join_error.to_string(),
            }),
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::error::ErrorKind;
    use crate::fakes::{MemoryAgent, MemoryRemote};
    use crate::job::{Job, StepState};
    use tokio::time::Instant;

    fn assert_elapsed(start: Instant, expected: Duration) {
        let elapsed = start.elapsed();
        assert!(
            elapsed >= expected && elapsed < expected + Duration::from_millis(5),
            "expected {expected:?}, elapsed {elapsed:?}"
        );
    }

    async fn crashing_monitor() -> Result<RaceEvent> {
        panic!("monitor crashed")
    }

    #[tokio::test(start_paused = true)]
    async fn test_timer_alone() {
        let start = Instant::now();
        let mut race = Race::new();
        race.spawn_timer(Duration::from_secs(30));

        assert_eq!(race.winner().await.unwrap(), RaceEvent::TimerExpired);
        assert_elapsed(start, Duration::from_secs(30));
    }

    #[tokio::test(start_paused = true)]
    async fn test_earlier_timer_beats_override() {
        let agent = Arc::new(MemoryAgent::new("Gate"));
        agent.script_step_states("approve", vec![StepState::Blocked]);

        let start = Instant::now();
        let mut race = Race::new();
        race.spawn_timer(Duration::from_secs(1));
        race.spawn_override_poll(agent.clone(), "approve".to_string());

        assert_eq!(race.winner().await.unwrap(), RaceEvent::TimerExpired);
        assert_elapsed(start, Duration::from_secs(1));

        // The poller is gone: time moving on issues no further reads.
        let reads = agent.state_reads("approve");
        tokio::time::sleep(Duration::from_secs(60)).await;
        assert_eq!(agent.state_reads("approve"), reads);
    }

    #[tokio::test(start_paused = true)]
    async fn test_override_beats_later_timer() {
        let agent = Arc::new(MemoryAgent::new("Gate"));
        agent.script_step_states(
            "approve",
            vec![StepState::Blocked, StepState::Blocked, StepState::Unblocked],
        );

        let start = Instant::now();
        let mut race = Race::new();
        race.spawn_timer(Duration::from_secs(300));
        race.spawn_override_poll(agent.clone(), "approve".to_string());

        assert_eq!(race.winner().await.unwrap(), RaceEvent::OverrideResolved);
        assert_elapsed(start, POLL_INTERVAL * 2);
        assert_eq!(agent.state_reads("approve"), 3);
    }

    #[tokio::test(start_paused = true)]
    async fn test_unknown_override_state_counts_as_resolved() {
        let agent = Arc::new(MemoryAgent::new("Gate"));
        agent.script_step_states(
            "approve",
            vec![StepState::Other("broken".to_string())],
        );

        let mut race = Race::new();
        race.spawn_override_poll(agent, "approve".to_string());
        assert_eq!(race.winner().await.unwrap(), RaceEvent::OverrideResolved);
    }

    #[tokio::test(start_paused = true)]
    async fn test_monitor_fires_on_exhaustion_poll() {
        let remote = Arc::new(MemoryRemote::with_snapshots(vec![
            vec![
                Job::blocked("o", "approve"),
                Job::blocked("1", "deploy-a"),
                Job::blocked("2", "deploy-b"),
            ],
            vec![Job::blocked("o", "approve"), Job::blocked("2", "deploy-b")],
            vec![Job::blocked("o", "approve")],
        ]));
        let agent = Arc::new(MemoryAgent::new("Gate"));
        agent.script_step_states("approve", vec![StepState::Blocked]);

        let start = Instant::now();
        let mut race = Race::new();
        race.spawn_monitor(remote.clone(), "deploy".to_string(), 7, "approve".to_string());
        race.spawn_override_poll(agent, "approve".to_string());

        assert_eq!(race.winner().await.unwrap(), RaceEvent::NoWorkRemaining);
        assert_eq!(remote.list_calls(), 3);
        assert_elapsed(start, POLL_INTERVAL * 2);
    }

    #[tokio::test(start_paused = true)]
    async fn test_failing_racer_ends_race_with_error() {
        let agent = Arc::new(MemoryAgent::new("Gate"));
        agent.fail_state_reads();

        let mut race = Race::new();
        race.spawn_timer(Duration::from_secs(600));
        race.spawn_override_poll(agent, "approve".to_string());

        let err = race.winner().await.unwrap_err();
        assert_eq!(err.kind(), ErrorKind::Collaborator);
    }

    #[tokio::test(start_paused = true)]
    async fn test_panicking_racer_is_reported() {
        let mut race = Race::new();
        race.spawn(Racer::Monitor, crashing_monitor());
        race.spawn_timer(Duration::from_secs(600));

        let err = race.winner().await.unwrap_err();
        assert_eq!(err.kind(), ErrorKind::Race);
        assert!(err.to_string().contains("monitor"));
    }

    #[tokio::test]
    async fn test_empty_race_is_an_error() {
        let err = Race::new().winner().await.unwrap_err();
        assert_eq!(err.kind(), ErrorKind::Race);
    }

    #[tokio::test(start_paused = true)]
    async fn test_custom_poll_interval() {
        let agent = Arc::new(MemoryAgent::new("Gate"));
        agent.script_step_states("approve", vec![StepState::Blocked, StepState::Finished]);

        let start = Instant::now();
        let mut race = Race::new().with_poll_interval(Duration::from_secs(2));
        race.spawn_override_poll(agent, "approve".to_string());

        assert_eq!(race.winner().await.unwrap(), RaceEvent::OverrideResolved);
        assert_elapsed(start, Duration::from_secs(2));
    }
}
