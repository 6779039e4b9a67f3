//! Plugin configuration read from the Buildkite job environment.
//!
//! Buildkite exposes plugin properties as `BUILDKITE_PLUGIN_<NAME>_<PROPERTY>`
//! variables, with list entries suffixed `_0`, `_1`, ... . Everything here
//! goes through a lookup function so tests never touch the process
//! environment.

use crate::error::{GateError, Result};
use crate::policy::{ReleaseSelection, WaitPolicy};
use serde::Serialize;
use std::fmt;

/// Prefix of every plugin property variable.
pub const PLUGIN_ENV_PREFIX: &str = "BUILDKITE_PLUGIN_MULTI_UNBLOCK";

/// Variable holding the API token when `api-token` does not name another one.
pub const DEFAULT_API_TOKEN_VAR: &str = "BUILDKITE_API_TOKEN";

/// Name of the variable backing a plugin property, e.g. `block-steps` ->
/// `BUILDKITE_PLUGIN_MULTI_UNBLOCK_BLOCK_STEPS`.
pub fn property_env_var(property: &str) -> String {
    format!(
        "{PLUGIN_ENV_PREFIX}_{}",
        property.to_ascii_uppercase().replace('-', "_")
    )
}

struct PluginEnv<F> {
    lookup: F,
}

impl<F> PluginEnv<F>
where
    F: Fn(&str) -> Option<String>,
{
    fn var(&self, name: &str) -> Option<String> {
        (self.lookup)(name).filter(|v| !v.is_empty())
    }

    fn string(&self, property: &str) -> Option<String> {
        self.var(&property_env_var(property))
    }

    fn int(&self, property: &str) -> Result<Option<i64>> {
        let name = property_env_var(property);
        self.var(&name)
            .map(|raw| {
                raw.trim().parse::<i64>().map_err(|_| {
                    GateError::invalid_config(format!("{name} must be an integer, got `{raw}`"))
                })
            })
            .transpose()
    }

    fn list(&self, property: &str) -> Vec<String> {
        let name = property_env_var(property);
        (0..)
            .map_while(|index| self.var(&format!("{name}_{index}")))
            .collect()
    }
}

/// Gate settings: what to release and how long to wait.
#[derive(Debug, Clone, Default, PartialEq, Eq, Serialize)]
pub struct GateConfig {
    /// Absent: release immediately. `-1`: monitor until override or exhaustion.
    pub timeout_seconds: Option<i64>,

    /// Step whose unblocking ends the wait early.
    pub override_step_key: Option<String>,

    /// Explicit step keys to release.
    pub block_steps: Vec<String>,

    /// Glob pattern selecting additional step keys.
    pub block_step_pattern: Option<String>,
}

impl GateConfig {
    pub fn from_env() -> Result<Self> {
        Self::from_lookup(|name| std::env::var(name).ok())
    }

    pub fn from_lookup<F>(lookup: F) -> Result<Self>
    where
        F: Fn(&str) -> Option<String>,
    {
        let env = PluginEnv { lookup };
        Ok(Self {
            timeout_seconds: env.int("timeout-seconds")?,
            override_step_key: env.string("override-step-key"),
            block_steps: env.list("block-steps"),
            block_step_pattern: env.string("block-step-pattern"),
        })
    }

    /// Validate the settings and resolve them into a plan.
    pub fn plan(&self) -> Result<GatePlan> {
        if self.block_steps.iter().any(|k| k.trim().is_empty()) {
            return Err(GateError::invalid_config("block-steps entries must not be empty"));
        }
        if let Some(key) = &self.override_step_key {
            if key.trim().is_empty() {
                return Err(GateError::invalid_config("override-step-key must not be blank"));
            }
        }

        let policy =
            WaitPolicy::from_timeout(self.timeout_seconds, self.override_step_key.as_deref())?;
        let selection =
            ReleaseSelection::new(self.block_steps.clone(), self.block_step_pattern.as_deref())?;

        Ok(GatePlan { policy, selection })
    }
}

/// Validated, immutable input of one coordination cycle.
#[derive(Debug, Clone, PartialEq)]
pub struct GatePlan {
    pub policy: WaitPolicy,
    pub selection: ReleaseSelection,
}

/// Build the gate runs in, plus the credentials to reach the remote API.
#[derive(Clone, PartialEq, Eq)]
pub struct BuildContext {
    pub org: String,
    pub pipeline_slug: String,
    pub build_number: u64,
    pub api_token: String,
}

impl fmt::Debug for BuildContext {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.debug_struct("BuildContext")
            .field("org", &self.org)
            .field("pipeline_slug", &self.pipeline_slug)
            .field("build_number", &self.build_number)
            .field("api_token", &"<redacted>")
            .finish()
    }
}

impl BuildContext {
    pub fn from_env() -> Result<Self> {
        Self::from_lookup(|name| std::env::var(name).ok())
    }

    /// Read the build context. The API token is looked up under the variable
    /// named by the `api-token` property, falling back to
    /// [`DEFAULT_API_TOKEN_VAR`].
    pub fn from_lookup<F>(lookup: F) -> Result<Self>
    where
        F: Fn(&str) -> Option<String>,
    {
        let env = PluginEnv { lookup };
        let required = |name: &str| {
            env.var(name)
                .ok_or_else(|| GateError::invalid_config(format!("{name} is not set")))
        };

        let org = required("BUILDKITE_ORGANIZATION_SLUG")?;
        let pipeline_slug = required("BUILDKITE_PIPELINE_SLUG")?;
        let raw_build = required("BUILDKITE_BUILD_NUMBER")?;
        let build_number = raw_build.trim().parse::<u64>().map_err(|_| {
            GateError::invalid_config(format!(
                "BUILDKITE_BUILD_NUMBER must be a positive integer, got `{raw_build}`"
            ))
        })?;

        let token_var = env
            .string("api-token")
            .unwrap_or_else(|| DEFAULT_API_TOKEN_VAR.to_string());
        let api_token = env.var(&token_var).ok_or_else(|| {
            GateError::invalid_config(format!(
                "Buildkite API token not set: expected it in {token_var}"
            ))
        })?;

        Ok(Self {
            org,
            pipeline_slug,
            build_number,
            api_token,
        })
    }
}
