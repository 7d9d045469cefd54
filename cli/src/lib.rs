//! `brand-audit` command line client.
//!
//! ## Commands
//!
//! - `brand-audit analyze <COMPANY> [--poll] [--json]`
//! - `brand-audit status <ID>`
//! - `brand-audit results <ID>`
//! - `brand-audit health`

mod analyze_cmd;

use std::path::PathBuf;
use std::time::Duration;

use anyhow::Context;
use brand_audit_client::ApiError;
use brand_audit_client::ClientConfig;
use brand_audit_client::ClientContext;
use brand_audit_client::ConfigLoader;
use clap::Parser;
use clap::Subcommand;
use serde_json::Value;

pub use analyze_cmd::AnalyzeArgs;

/// Exit code for any classified API failure.
pub const EXIT_API_ERROR: i32 = 1;
/// Exit code for configuration or other local failures.
pub const EXIT_LOCAL_ERROR: i32 = 2;

#[derive(Debug, Parser)]
#[command(name = "brand-audit", version, about = "Brand audit analysis client")]
pub struct Cli {
    /// Config file to load instead of the default search path.
    #[arg(long = "config", short = 'c', global = true, value_name = "PATH")]
    pub config: Option<PathBuf>,

    /// Bearer token for the analysis service. Overrides the config file.
    #[arg(long = "token", global = true, value_name = "TOKEN")]
    pub token: Option<String>,

    #[command(subcommand)]
    pub command: Command,
}

#[derive(Debug, Subcommand)]
pub enum Command {
    /// Start an analysis and follow it to completion.
    Analyze(AnalyzeArgs),
    /// Show the current status of a job.
    Status(JobArgs),
    /// Fetch the results of a finished job.
    Results(JobArgs),
    /// Check that the service is reachable.
    Health(OutputArgs),
}

#[derive(Debug, Parser)]
pub struct JobArgs {
    /// Analysis id returned by `analyze`.
    #[arg(value_name = "ID")]
    pub id: String,

    #[command(flatten)]
    pub output: OutputArgs,
}

#[derive(Debug, Clone, Copy, Default, Parser)]
pub struct OutputArgs {
    /// Emit compact JSON instead of pretty output.
    #[arg(long = "json", short = 'j')]
    pub json: bool,
}

impl OutputArgs {
    fn print(self, value: &Value) -> anyhow::Result<()> {
        let rendered = if self.json {
            serde_json::to_string(value)?
        } else {
            serde_json::to_string_pretty(value)?
        };
        println!("{rendered}");
        Ok(())
    }
}

/// Resolves configuration from `--config`, or the default search path.
pub fn load_config(cli: &Cli) -> anyhow::Result<ClientConfig> {
    let config = match &cli.config {
        Some(path) => ConfigLoader::new().with_file(path).load(),
        None => ConfigLoader::load_default(),
    };
    config.context("failed to load configuration")
}

pub async fn run(cli: Cli) -> anyhow::Result<()> {
    let config = load_config(&cli)?;
    let ctx = ClientContext::new(config).context("failed to build client")?;
    if let Some(token) = cli.token {
        ctx.client().set_auth_token(Some(token));
    }

    let result = match cli.command {
        Command::Analyze(args) => analyze_cmd::run(&ctx, &args).await,
        Command::Status(args) => {
            let status = ctx.api().status(&args.id).await?;
            args.output.print(&serde_json::to_value(status)?)
        }
        Command::Results(args) => {
            let results = ctx.api().results(&args.id).await?;
            args.output.print(&results)
        }
        Command::Health(output) => {
            let health = ctx.api().health().await?;
            if !health.is_healthy() {
                tracing::warn!(status = %health.status, "service reports degraded health");
            }
            output.print(&serde_json::to_value(health)?)
        }
    };

    ctx.connection().shutdown();
    result
}

/// Maps a failed run to an exit code, printing classified errors the way
/// the user is expected to act on them.
pub fn report_error(err: &anyhow::Error) -> i32 {
    match err.downcast_ref::<ApiError>() {
        Some(api_err) => {
            eprintln!("error: {}", api_err.message);
            if let Some(retry_after) = api_err.retry_after() {
                eprintln!("retry after: {}s", retry_after.as_secs().max(1));
            }
            for action in &api_err.suggested_actions {
                eprintln!("  - {action}");
            }
            eprintln!("error id: {}", api_err.error_id);
            EXIT_API_ERROR
        }
        None => {
            eprintln!("error: {err:#}");
            EXIT_LOCAL_ERROR
        }
    }
}

pub(crate) const DEFAULT_POLL_INTERVAL: Duration = Duration::from_secs(2);
