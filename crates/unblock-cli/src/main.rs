//! multi-unblock - Buildkite build gate
//!
//! Runs as the command of a gate step. Reads the plugin configuration from
//! the environment, waits as configured, then unblocks the selected steps.
//!
//! ## Commands
//!
//! - `run`: run the gate end to end and print the gate report
//! - `select`: print the jobs that would be unblocked right now

use anyhow::{Context, Result};
use clap::{Parser, Subcommand};
use serde_json::json;
use std::path::PathBuf;
use std::process::ExitCode;
use std::sync::Arc;
use tracing::{info, warn, Level};

use buildkite_client::{ApiConfig, BuildkiteAgent, BuildkiteApi, DEFAULT_BASE_URL};
use unblock_core::{BuildContext, GateConfig, ReleaseCoordinator, ReleaseFields};

#[derive(Parser, Debug)]
#[command(name = "multi-unblock")]
#[command(author = "Stevedores Org")]
#[command(version = env!("CARGO_PKG_VERSION"))]
#[command(about = "Unblock a set of blocked Buildkite steps at once", long_about = None)]
struct Cli {
    /// Enable verbose output
    #[arg(short, long, global = true)]
    verbose: bool,

    /// Emit JSON-formatted log lines
    #[arg(long, global = true)]
    json: bool,

    /// Buildkite REST API base URL
    #[arg(long, global = true, env = "MULTI_UNBLOCK_API_URL", default_value = DEFAULT_BASE_URL)]
    api_url: String,

    /// Path to the buildkite-agent binary
    #[arg(long, global = true, env = "MULTI_UNBLOCK_AGENT_PATH")]
    agent_path: Option<PathBuf>,

    /// Override the configured timeout-seconds (-1 waits for the override step or an empty build)
    #[arg(long, global = true, allow_negative_numbers = true)]
    timeout_seconds: Option<i64>,

    #[command(subcommand)]
    command: Commands,
}

#[derive(Subcommand, Debug)]
enum Commands {
    /// Wait as configured, then unblock the selected steps
    Run {
        /// Form field submitted with every unblock, as key=value (repeatable)
        #[arg(long = "field", value_parser = parse_field)]
        fields: Vec<(String, String)>,
    },

    /// Print the jobs that would be unblocked now, without waiting or unblocking
    Select,
}

fn parse_field(raw: &str) -> std::result::Result<(String, String), String> {
    let (key, value) = raw
        .split_once('=')
        .ok_or_else(|| format!("expected key=value, got `{raw}`"))?;
    let key = key.trim();
    if key.is_empty() {
        return Err(format!("empty field key in `{raw}`"));
    }
    Ok((key.to_string(), value.to_string()))
}

#[tokio::main]
async fn main() -> Result<ExitCode> {
    let cli = Cli::parse();

    let level = if cli.verbose {
        Level::DEBUG
    } else {
        Level::INFO
    };
    unblock_core::init_tracing(cli.json, level);

    let coordinator = build_coordinator(&cli)?;

    match cli.command {
        Commands::Run { fields } => cmd_run(coordinator, fields).await,
        Commands::Select => cmd_select(&coordinator).await,
    }
}

fn build_coordinator(cli: &Cli) -> Result<ReleaseCoordinator> {
    let mut config = GateConfig::from_env().context("Invalid plugin configuration")?;
    if let Some(timeout) = cli.timeout_seconds {
        config.timeout_seconds = Some(timeout);
    }
    let plan = config.plan().context("Invalid plugin configuration")?;
    let context = BuildContext::from_env().context("Missing Buildkite build environment")?;
    info!(
        org = %context.org,
        pipeline = %context.pipeline_slug,
        build = context.build_number,
        policy = %plan.policy,
        "Loaded gate configuration"
    );

    let mut agent = BuildkiteAgent::new();
    if let Some(path) = &cli.agent_path {
        agent = agent.with_program(path);
    }
    let api = BuildkiteApi::new(ApiConfig::from_context(&context).with_base_url(&cli.api_url))
        .context("Failed to create Buildkite API client")?;

    Ok(ReleaseCoordinator::new(
        Arc::new(agent),
        Arc::new(api),
        context.pipeline_slug,
        context.build_number,
        plan,
    ))
}

async fn cmd_run(
    coordinator: ReleaseCoordinator,
    fields: Vec<(String, String)>,
) -> Result<ExitCode> {
    let fields: ReleaseFields = fields.into_iter().collect();
    let report = coordinator
        .with_fields(fields)
        .run()
        .await
        .context("Gate failed")?;

    println!("{}", serde_json::to_string_pretty(&report)?);

    if report.all_released() {
        Ok(ExitCode::SUCCESS)
    } else {
        warn!(failed = report.failed_count(), "Some steps could not be unblocked");
        Ok(ExitCode::FAILURE)
    }
}

async fn cmd_select(coordinator: &ReleaseCoordinator) -> Result<ExitCode> {
    let jobs = coordinator
        .preview()
        .await
        .context("Failed to list releasable jobs")?;

    let output = json!({
        "policy": coordinator.policy(),
        "jobs": jobs,
    });
    println!("{}", serde_json::to_string_pretty(&output)?);
    Ok(ExitCode::SUCCESS)
}
