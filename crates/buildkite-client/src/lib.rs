//! Buildkite bindings for multi-unblock
//!
//! - [`BuildkiteAgent`]: the `buildkite-agent` CLI of the step running the gate
//! - [`BuildkiteApi`]: the Buildkite REST API of the organization
//!
//! Both implement the collaborator traits of `unblock-core`.

pub mod agent;
pub mod api;
pub mod error;

pub use agent::{BuildkiteAgent, AGENT_PROGRAM, AGENT_TIMEOUT};
pub use api::{ApiConfig, Build, BuildkiteApi, DEFAULT_BASE_URL};
pub use error::{BuildkiteError, Result};
