//! `marketlake` CLI binary: loads configuration and the schema registry,
//! wires the pipeline, runs one task group, and maps the result to the exit
//! codes of spec §6. The CLI surface itself is deliberately thin (spec §9
//! non-goal "no CLI framework beyond a thin clap entry point").

use std::process::ExitCode as ProcessExitCode;
use std::sync::Arc;

use clap::Parser;
use marketlake_core::config::Config;
use marketlake_core::error::ExitCode;
use marketlake_fetch::HttpFetcher;
use marketlake_orchestrator::Orchestrator;
use marketlake_schema::SchemaRegistry;

/// Run one named task group of the market data lake pipeline.
#[derive(Debug, Parser)]
#[command(name = "marketlake", version, about)]
struct Cli {
    /// Task group to run, as declared under `groups.<name>` in the config.
    group: String,

    /// Path to the pipeline config TOML.
    #[arg(long, env = "MARKETLAKE_CONFIG", default_value = "marketlake.toml")]
    config: std::path::PathBuf,

    /// Path to the schema registry TOML.
    #[arg(long, env = "MARKETLAKE_SCHEMA", default_value = "schema.toml")]
    schema: std::path::PathBuf,

    /// Base URL of the upstream data API.
    #[arg(long, env = "MARKETLAKE_UPSTREAM_URL")]
    upstream_url: String,

    /// Restrict this run to a fixed entity list instead of the planner's
    /// usual entity resolution. Marks the run as partial (spec §4.K):
    /// `lastRunTimestamp` is not advanced.
    #[arg(long, value_delimiter = ',')]
    override_entities: Option<Vec<String>>,
}

#[tokio::main]
async fn main() -> ProcessExitCode {
    tracing_subscriber::fmt::init();

    let cli = Cli::parse();

    let config = match Config::load(&cli.config) {
        Ok(config) => Arc::new(config),
        Err(err) => {
            tracing::error!(error = %err, path = %cli.config.display(), "failed to load config");
            return exit_code(ExitCode::PlanningAborted);
        }
    };

    let registry = match SchemaRegistry::load(&cli.schema) {
        Ok(registry) => Arc::new(registry),
        Err(err) => {
            tracing::error!(error = %err, path = %cli.schema.display(), "failed to load schema registry");
            return exit_code(ExitCode::PlanningAborted);
        }
    };

    let fetcher = match HttpFetcher::new(&cli.upstream_url) {
        Ok(fetcher) => Arc::new(fetcher),
        Err(err) => {
            tracing::error!(error = %err, "failed to build HTTP client");
            return exit_code(ExitCode::PlanningAborted);
        }
    };

    let orchestrator = match Orchestrator::new(config, registry, fetcher).await {
        Ok(orchestrator) => orchestrator,
        Err(err) => {
            tracing::error!(error = %err, "failed to initialize orchestrator");
            return exit_code(ExitCode::FatalIo);
        }
    };

    let code = orchestrator.run(&cli.group, cli.override_entities.as_deref()).await;
    exit_code(code)
}

fn exit_code(code: ExitCode) -> ProcessExitCode {
    ProcessExitCode::from(code.code() as u8)
}
