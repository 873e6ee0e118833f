//! ---
//! tmd_section: "01-core-functionality"
//! tmd_subsection: "binary"
//! tmd_type: "source"
//! tmd_scope: "code"
//! tmd_description: "Binary entrypoint for the guard daemon."
//! tmd_version: "v0.1.0"
//! tmd_owner: "tbd"
//! ---
use std::path::PathBuf;
use std::process::ExitCode;
use std::sync::Arc;
use std::time::Instant;

use anyhow::{Context, Result};
use clap::{Parser, Subcommand};
use indexmap::IndexMap;
use serde::Serialize;
use tmd_api::{QueryApiBuilder, QueryApiHandle};
use tmd_common::config::{AppConfig, ProbeKind};
use tmd_common::logging::init_tracing;
use tmd_metrics::{new_registry, spawn_http_server, DaemonMetrics, SharedRegistry};
use tmd_probes::{build_client, monitored_probes, release_plan};
use tmd_resilience::{GuardService, ResilienceMetrics};
use tokio::signal;
use tracing::{info, warn};

const SERVICE_NAME: &str = "tmd-guardd";
const RELEASE_PLAN: &str = "release";
/// Exit status of `check` when the release must not ship.
const EXIT_NOT_SAFE: u8 = 2;

#[derive(Debug, Parser)]
#[command(author, version, about = "Ticket-metrics dashboard guard", long_about = None)]
struct Cli {
    #[arg(long, value_name = "FILE", help = "Path to configuration file")]
    config: Option<PathBuf>,

    #[command(subcommand)]
    command: Option<Commands>,
}

#[derive(Debug, Clone, Copy, Subcommand)]
enum Commands {
    #[command(about = "Poll probes continuously and serve the query API")]
    Run,
    #[command(about = "Run one complete check, print the report, exit non-zero if not safe to ship")]
    Check,
    #[command(about = "Load and validate the configuration, then print a summary")]
    ValidateConfig,
}

impl Commands {
    fn label(self) -> &'static str {
        match self {
            Commands::Run => "run",
            Commands::Check => "check",
            Commands::ValidateConfig => "validate-config",
        }
    }
}

#[tokio::main]
async fn main() -> Result<ExitCode> {
    let cli = Cli::parse();
    let mut candidates = Vec::new();
    if let Some(path) = &cli.config {
        candidates.push(path.clone());
    }
    candidates.push(PathBuf::from("configs/tmd-guardd.toml"));
    candidates.push(PathBuf::from("configs/example.toml"));

    let load_started = Instant::now();
    let loaded = AppConfig::load_with_source(&candidates)?;
    let load_duration = load_started.elapsed();
    let config = loaded.config;

    if let Some(Commands::ValidateConfig) = cli.command {
        let summary = ConfigSummary::new(&config, &loaded.source)?;
        println!("{}", serde_json::to_string_pretty(&summary)?);
        return Ok(ExitCode::SUCCESS);
    }

    let command = cli.command.unwrap_or(Commands::Run);
    let registry = new_registry();
    let daemon_metrics = DaemonMetrics::new(registry.clone())?;
    daemon_metrics.observe_config_load(load_duration.as_secs_f64());
    daemon_metrics.record_invocation(command.label());
    let workflow_only = config.probes.iter().filter(|p| p.workflow_only).count();
    daemon_metrics.set_probe_counts(config.probes.len() - workflow_only, workflow_only);
    daemon_metrics.set_build_info(
        env!("CARGO_PKG_VERSION"),
        if cfg!(debug_assertions) { "debug" } else { "release" },
    );

    init_tracing(SERVICE_NAME, &config.logging)?;
    info!(
        config_path = %loaded.source.display(),
        probes = config.probes.len(),
        "configuration loaded"
    );

    match command {
        Commands::Run => {
            run_daemon(config, registry, &daemon_metrics).await?;
            Ok(ExitCode::SUCCESS)
        }
        Commands::Check => run_check(&config, registry).await,
        Commands::ValidateConfig => Ok(ExitCode::SUCCESS),
    }
}

fn build_service(config: &AppConfig, registry: SharedRegistry) -> Result<Arc<GuardService>> {
    let guard = &config.guard;
    let client = build_client(guard.probe_timeout)?;
    let probes = monitored_probes(&config.probes, &client, guard.probe_timeout);
    let plan = release_plan(RELEASE_PLAN, &config.probes, &client, guard.step_timeout)
        .context("invalid release plan")?;
    let metrics = ResilienceMetrics::new(registry)?;
    let service = GuardService::builder(guard.clone())
        .probes(probes)
        .plan(plan)
        .metrics(metrics)
        .build()
        .context("invalid guard configuration")?;
    Ok(Arc::new(service))
}

async fn run_check(config: &AppConfig, registry: SharedRegistry) -> Result<ExitCode> {
    let service = build_service(config, registry)?;
    let report = service.run_complete_check().await;
    println!("{}", serde_json::to_string_pretty(&report)?);
    if report.safe_to_ship {
        Ok(ExitCode::SUCCESS)
    } else {
        warn!(
            execution = %report.execution.id,
            open_alerts = report.open_alerts.len(),
            "release is not safe to ship"
        );
        Ok(ExitCode::from(EXIT_NOT_SAFE))
    }
}

async fn run_daemon(
    config: AppConfig,
    registry: SharedRegistry,
    daemon_metrics: &DaemonMetrics,
) -> Result<()> {
    let metrics_settings = config.metrics.clone();
    let api_settings = config.api.clone();
    let service = build_service(&config, registry.clone())?;

    let metrics_server = if metrics_settings.enabled {
        info!(address = %metrics_settings.listen, "metrics exporter enabled");
        Some(spawn_http_server(registry.clone(), metrics_settings.listen)?)
    } else {
        info!("metrics exporter disabled by configuration");
        None
    };

    let mut api_server: Option<QueryApiHandle> = None;
    if api_settings.enabled {
        let builder = QueryApiBuilder::new(api_settings.listen, service.clone())
            .with_metrics_registry(registry);
        match builder.spawn().await {
            Ok(handle) => {
                info!(address = %handle.local_addr(), "query api listening");
                daemon_metrics.set_api_enabled(true);
                api_server = Some(handle);
            }
            Err(err) => warn!(error = %err, "failed to start query api"),
        }
    } else {
        info!("query api disabled by configuration");
    }

    service.start();
    info!("guard running; waiting for termination signal");
    signal::ctrl_c().await?;
    info!("ctrl-c received; shutting down");

    if let Some(outcome) = service.stop().await {
        info!(verdict = ?outcome.verdict, attempts = outcome.attempts, "recovery episode finished during shutdown");
    }
    if let Some(server) = api_server {
        server.shutdown().await?;
        daemon_metrics.set_api_enabled(false);
    }
    if let Some(server) = metrics_server {
        server.shutdown().await?;
    }
    Ok(())
}

#[derive(Debug, Serialize)]
struct ConfigSummary {
    source: String,
    poll_interval_ms: u64,
    failure_threshold: u32,
    auto_recovery: bool,
    probes: IndexMap<String, ProbeSummary>,
    release_order: Vec<String>,
}

#[derive(Debug, Serialize)]
struct ProbeSummary {
    kind: ProbeKind,
    url: String,
    required: bool,
    monitored: bool,
    depends_on: Vec<String>,
}

impl ConfigSummary {
    fn new(config: &AppConfig, source: &std::path::Path) -> Result<Self> {
        let client = build_client(config.guard.probe_timeout)?;
        let plan = release_plan(
            RELEASE_PLAN,
            &config.probes,
            &client,
            config.guard.step_timeout,
        )
        .context("invalid release plan")?;
        let probes = config
            .probes
            .iter()
            .map(|probe| {
                (
                    probe.name.clone(),
                    ProbeSummary {
                        kind: probe.kind,
                        url: probe.url.to_string(),
                        required: probe.required,
                        monitored: !probe.workflow_only,
                        depends_on: probe.depends_on.clone(),
                    },
                )
            })
            .collect();
        Ok(Self {
            source: source.display().to_string(),
            poll_interval_ms: config.guard.poll_interval.as_millis() as u64,
            failure_threshold: config.guard.failure_threshold,
            auto_recovery: config.guard.auto_recovery,
            probes,
            release_order: plan
                .topological_order()
                .into_iter()
                .map(str::to_owned)
                .collect(),
        })
    }
}
