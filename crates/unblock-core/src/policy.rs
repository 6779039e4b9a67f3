//! Wait policies, release selections and race events.

use crate::error::{GateError, Result};
use serde::{Deserialize, Serialize};
use std::collections::BTreeSet;
use std::fmt;
use std::time::Duration;

/// Timeout value that selects unbounded monitoring instead of a timer.
pub const MONITOR_SENTINEL_SECS: i64 = -1;

/// How long the gate waits before releasing.
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
#[serde(tag = "mode", rename_all = "snake_case")]
pub enum WaitPolicy {
    /// Release straight away.
    Immediate,
    /// Release once the delay has elapsed.
    AfterDelay {
        #[serde(with = "duration_secs")]
        delay: Duration,
    },
    /// Release after the delay, or earlier once the override step is unblocked.
    AfterDelayOrOverride {
        #[serde(with = "duration_secs")]
        delay: Duration,
        override_step_key: String,
    },
    /// Release once the override step is unblocked or no other releasable
    /// work is left, whichever comes first.
    UntilOverrideOrExhaustion { override_step_key: String },
}

impl WaitPolicy {
    /// Derive the policy from the raw timeout setting and override key.
    pub fn from_timeout(
        timeout_seconds: Option<i64>,
        override_step_key: Option<&str>,
    ) -> Result<Self> {
        let override_step_key = override_step_key.map(str::to_string);
        match (timeout_seconds, override_step_key) {
            (None, _) => Ok(WaitPolicy::Immediate),
            (Some(MONITOR_SENTINEL_SECS), Some(override_step_key)) => {
                Ok(WaitPolicy::UntilOverrideOrExhaustion { override_step_key })
            }
            (Some(MONITOR_SENTINEL_SECS), None) => Err(GateError::invalid_config(
                "timeout-seconds of -1 requires override-step-key",
            )),
            (Some(secs), _) if secs < 0 => Err(GateError::invalid_config(format!(
                "timeout-seconds must be -1 or a non-negative number of seconds, got {secs}"
            ))),
            (Some(secs), None) => Ok(WaitPolicy::AfterDelay {
                delay: Duration::from_secs(secs as u64),
            }),
            (Some(secs), Some(override_step_key)) => Ok(WaitPolicy::AfterDelayOrOverride {
                delay: Duration::from_secs(secs as u64),
                override_step_key,
            }),
        }
    }

    /// The override step this policy races against, if any.
    pub fn override_step_key(&self) -> Option<&str> {
        match self {
            WaitPolicy::AfterDelayOrOverride {
                override_step_key, ..
            }
            | WaitPolicy::UntilOverrideOrExhaustion { override_step_key } => {
                Some(override_step_key)
            }
            WaitPolicy::Immediate | WaitPolicy::AfterDelay { .. } => None,
        }
    }

    pub fn is_immediate(&self) -> bool {
        matches!(self, WaitPolicy::Immediate)
    }

    /// Suffix appended to the gate step's label while it waits.
    pub fn label_suffix(&self) -> Option<String> {
        match self {
            WaitPolicy::Immediate => None,
            WaitPolicy::AfterDelay { delay } => {
                Some(format!("(unblocking in {}s)", delay.as_secs()))
            }
            WaitPolicy::AfterDelayOrOverride {
                delay,
                override_step_key,
            } => Some(format!(
                "(unblocking in {}s or when {override_step_key} is unblocked)",
                delay.as_secs()
            )),
            WaitPolicy::UntilOverrideOrExhaustion { override_step_key } => Some(format!(
                "(unblocking when {override_step_key} is unblocked or no blocked steps remain)"
            )),
        }
    }
}

impl fmt::Display for WaitPolicy {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        match self {
            WaitPolicy::Immediate => write!(f, "immediate"),
            WaitPolicy::AfterDelay { delay } => write!(f, "after {}s", delay.as_secs()),
            WaitPolicy::AfterDelayOrOverride {
                delay,
                override_step_key,
            } => write!(f, "after {}s or override {override_step_key}", delay.as_secs()),
            WaitPolicy::UntilOverrideOrExhaustion { override_step_key } => {
                write!(f, "until override {override_step_key} or exhaustion")
            }
        }
    }
}

mod duration_secs {
    use serde::{Deserialize, Deserializer, Serializer};
    use std::time::Duration;

    pub fn serialize<S: Serializer>(d: &Duration, s: S) -> Result<S::Ok, S::Error> {
        s.serialize_u64(d.as_secs())
    }

    pub fn deserialize<'de, D: Deserializer<'de>>(d: D) -> Result<Duration, D::Error> {
        u64::deserialize(d).map(Duration::from_secs)
    }
}

/// Step keys and pattern naming the blocked steps this gate releases.
#[derive(Debug, Clone, Default, PartialEq)]
pub struct ReleaseSelection {
    keys: BTreeSet<String>,
    pattern: Option<glob::Pattern>,
}

impl ReleaseSelection {
    /// Build a selection; fails when the pattern is not a valid glob.
    pub fn new<I, S>(keys: I, pattern: Option<&str>) -> Result<Self>
    where
        I: IntoIterator<Item = S>,
        S: Into<String>,
    {
        let pattern = pattern
            .map(|p| {
                glob::Pattern::new(p).map_err(|e| {
                    GateError::invalid_config(format!("invalid block-step-pattern `{p}`: {e}"))
                })
            })
            .transpose()?;

        Ok(Self {
            keys: keys.into_iter().map(Into::into).collect(),
            pattern,
        })
    }

    pub fn keys(&self) -> &BTreeSet<String> {
        &self.keys
    }

    pub fn pattern(&self) -> Option<&glob::Pattern> {
        self.pattern.as_ref()
    }

    pub fn is_empty(&self) -> bool {
        self.keys.is_empty() && self.pattern.is_none()
    }
}

/// The signal that ended the wait.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, Serialize, Deserialize)]
#[serde(rename_all = "snake_case")]
pub enum RaceEvent {
    TimerExpired,
    OverrideResolved,
    NoWorkRemaining,
}

impl fmt::Display for RaceEvent {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        match self {
            RaceEvent::TimerExpired => write!(f, "timer_expired"),
            RaceEvent::OverrideResolved => write!(f, "override_resolved"),
            RaceEvent::NoWorkRemaining => write!(f, "no_work_remaining"),
        }
    }
}
