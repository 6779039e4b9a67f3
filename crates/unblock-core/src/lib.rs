//! Gate controller for blocked pipeline steps.
//!
//! A gate decides when a set of blocked steps in a running build may
//! proceed, then unblocks them all at once. The building blocks:
//!
//! - [`select_jobs`] picks the steps to release from a job snapshot.
//! - [`ReleaseExecutor`] unblocks a batch concurrently with per-job outcomes.
//! - [`Race`] waits for the first of a timer, an override step or an empty
//!   build, cancelling the rest.
//! - [`ReleaseCoordinator`] runs one gate end to end.
//!
//! The collaborators behind [`AgentClient`] and [`RemoteControlClient`] are
//! implemented in the `buildkite-client` crate; [`fakes`] holds in-memory
//! versions for tests.

pub mod client;
pub mod config;
pub mod coordinator;
pub mod error;
pub mod executor;
pub mod fakes;
pub mod job;
pub mod policy;
pub mod race;
pub mod selector;
pub mod telemetry;

pub use client::{AgentClient, ReleaseFields, ReleaseResponse, RemoteControlClient};
pub use config::{BuildContext, GateConfig, GatePlan};
pub use coordinator::{GatePhase, GateReport, ReleaseCoordinator};
pub use error::{ErrorKind, GateError, Result};
pub use executor::{JobRelease, ReleaseExecutor, ReleaseFailure, ReleaseOutcome, ReleaseOutcomes};
pub use job::{Job, StepState};
pub use policy::{RaceEvent, ReleaseSelection, WaitPolicy, MONITOR_SENTINEL_SECS};
pub use race::{Race, Racer, POLL_INTERVAL};
pub use selector::select_jobs;
pub use telemetry::init_tracing;
