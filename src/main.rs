//! # Runner - QA Package Orchestrator entrypoint
//!
//! The CLI wraps the in-memory reference ports (A5) around the
//! `PackageOrchestrator` (C9) so a package can be driven end to end from a
//! spec file on disk, without any external database or AI provider
//! credentials required for `validate`/`config show`.

mod assertions;
mod config;
mod context;
mod coverage;
mod domain;
mod errors;
mod events;
mod executors;
mod generator;
mod orchestrator;
mod ports;
mod qa_summary;
mod resilience;
mod retry;
mod run_executor;
mod telemetry;
mod webhook;

use std::path::PathBuf;
use std::sync::Arc;

use clap::{Parser, Subcommand};
use tracing::{error, info, Level};

use config::RunnerConfig;
use domain::{Package, PackageConfig, SpecSource};
use events::EventBus;
use generator::ScenarioGenerator;
use orchestrator::PackageOrchestrator;
use ports::{HttpSpecFetcher, Repositories, SpecFetcher};
use qa_summary::QaSummaryEvaluator;
use resilience::ResilientAiClient;
use run_executor::RunExecutor;
use telemetry::{init_telemetry, shutdown_telemetry, TelemetryConfig};

#[derive(Parser)]
#[command(name = "runner")]
#[command(about = "QA Package Orchestrator - AI-driven API test orchestration engine", long_about = None)]
struct Cli {
    #[command(subcommand)]
    command: Commands,
}

#[derive(Subcommand)]
enum Commands {
    /// Builds a Package from a local spec file and drives it end to end
    /// through the Orchestrator against the in-memory ports.
    Run {
        #[arg(long)]
        spec: PathBuf,

        #[arg(long)]
        base_url: String,

        #[arg(long)]
        requirements: Option<String>,

        #[arg(long)]
        out: Option<PathBuf>,
    },

    /// Loads a scenarios JSON document and runs it through the same
    /// structural validation the generator applies to AI output, without
    /// calling an LLM or executing HTTP.
    Validate {
        #[arg(long)]
        plan: PathBuf,
    },

    /// Prints the resolved RunnerConfig (defaults + file + environment) as
    /// JSON, for operational debugging.
    Config {
        #[command(subcommand)]
        action: ConfigAction,
    },
}

#[derive(Subcommand)]
enum ConfigAction {
    Show,
}

#[tokio::main]
async fn main() {
    let cli = Cli::parse();

    let mut telemetry_config = TelemetryConfig::from_env();
    if matches!(cli.command, Commands::Validate { .. } | Commands::Config { .. }) {
        telemetry_config.log_level = Level::WARN;
    }
    if let Err(e) = init_telemetry(telemetry_config) {
        eprintln!("warning: failed to initialize telemetry: {}", e);
        let _ = tracing_subscriber::fmt()
            .with_env_filter(tracing_subscriber::EnvFilter::from_default_env())
            .try_init();
    }

    let exit_code = match cli.command {
        Commands::Run { spec, base_url, requirements, out } => {
            run_package(spec, base_url, requirements, out).await
        }
        Commands::Validate { plan } => validate_plan(plan),
        Commands::Config { action: ConfigAction::Show } => show_config(),
    };

    shutdown_telemetry();
    std::process::exit(exit_code);
}

async fn run_package(spec: PathBuf, base_url: String, requirements: Option<String>, out: Option<PathBuf>) -> i32 {
    let spec_content = match std::fs::read_to_string(&spec) {
        Ok(c) => c,
        Err(e) => {
            error!(path = ?spec, error = %e, "failed to read spec file");
            return 1;
        }
    };

    let runner_config = RunnerConfig::from_env();

    let package = match Package::new(
        spec.file_stem().map(|s| s.to_string_lossy().to_string()).unwrap_or_else(|| "package".to_string()),
        SpecSource::Inline(spec_content),
        base_url,
        requirements,
        PackageConfig {
            ai_model: runner_config.ai_provider.model.clone(),
            ..PackageConfig::default()
        },
        "cli".to_string(),
        chrono::Utc::now(),
    ) {
        Ok(p) => p,
        Err(e) => {
            error!(error = %e, "invalid package configuration");
            return 1;
        }
    };

    let ai_client = Arc::new(ResilientAiClient::new(
        Arc::new(NoopAiClient),
        runner_config.ai_provider.resilience.clone(),
    ));
    let orchestrator = PackageOrchestrator::new(
        Repositories::in_memory(),
        Arc::new(HttpSpecFetcher::new()) as Arc<dyn SpecFetcher>,
        ScenarioGenerator::new(ai_client.clone()),
        Arc::new(RunExecutor::new()),
        QaSummaryEvaluator::new(ai_client),
        Arc::new(EventBus::new()),
        runner_config.max_worker_pool_size,
    );

    info!(package_id = %package.id, "starting orchestration");
    let finished = orchestrator.run(package).await;

    let json = match serde_json::to_string_pretty(&finished) {
        Ok(j) => j,
        Err(e) => {
            error!(error = %e, "failed to serialize package");
            return 1;
        }
    };

    match out {
        Some(path) => {
            if let Err(e) = std::fs::write(&path, &json) {
                error!(path = ?path, error = %e, "failed to write report");
                return 1;
            }
            info!(path = ?path, "report written");
        }
        None => println!("{}", json),
    }

    if finished.status == domain::PackageStatus::Complete { 0 } else { 1 }
}

fn validate_plan(plan: PathBuf) -> i32 {
    let content = match std::fs::read_to_string(&plan) {
        Ok(c) => c,
        Err(e) => {
            error!(path = ?plan, error = %e, "failed to read plan file");
            return 1;
        }
    };

    match generator::validate_scenarios_document(&content, usize::MAX, usize::MAX) {
        Ok(scenarios) => {
            println!("{} scenario(s) valid", scenarios.len());
            0
        }
        Err(e) => {
            eprintln!("plan validation failed: {}", e);
            1
        }
    }
}

fn show_config() -> i32 {
    let config = RunnerConfig::from_env();
    match serde_json::to_string_pretty(&config) {
        Ok(json) => {
            println!("{}", json);
            0
        }
        Err(e) => {
            eprintln!("failed to serialize config: {}", e);
            1
        }
    }
}

/// Placeholder `AiClient` for `run` when no real provider credentials are
/// configured: every call degrades straight through `ResilientAiClient`'s
/// fallback path rather than reaching out to a network it has no key for.
struct NoopAiClient;

#[async_trait::async_trait]
impl resilience::AiClient for NoopAiClient {
    async fn complete(&self, _request: resilience::AiRequest) -> Result<resilience::AiResponse, errors::AiClientError> {
        Err(errors::AiClientError::Upstream("no AI provider configured for `run`".to_string()))
    }

    async fn healthy(&self) -> bool {
        false
    }
}
