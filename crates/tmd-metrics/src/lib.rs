//! ---
//! tmd_section: "03-observability"
//! tmd_subsection: "module"
//! tmd_type: "source"
//! tmd_scope: "code"
//! tmd_description: "Prometheus registry, scrape endpoint, and guard daemon process metrics."
//! tmd_version: "v0.1.0"
//! tmd_owner: "tbd"
//! ---
//! Every `/metrics` route in the guard goes through [`scrape_response`], so the
//! standalone exporter and the query API render the registry identically.
use std::net::{SocketAddr, TcpListener as StdTcpListener};
use std::sync::Arc;

use anyhow::{Context, Result};
use axum::http::{header, HeaderValue, StatusCode};
use axum::response::{IntoResponse, Response};
use axum::routing::get;
use axum::Router;
use prometheus::{
    Histogram, HistogramOpts, IntCounterVec, IntGauge, IntGaugeVec, Opts, Registry, TextEncoder,
};
use tokio::net::TcpListener;
use tokio::sync::oneshot;
use tokio::task::JoinHandle;
use tracing::{error, info};

/// Registry shared by the daemon, the resilience layer and the HTTP surfaces.
pub type SharedRegistry = Arc<Registry>;

pub fn new_registry() -> SharedRegistry {
    Arc::new(Registry::new())
}

/// Render every family in `registry` in the Prometheus text format.
pub fn render(registry: &Registry) -> Result<String> {
    TextEncoder::new()
        .encode_to_string(&registry.gather())
        .context("failed to encode metrics")
}

/// Scrape response for `registry`: the text exposition on success, a 500 otherwise.
pub fn scrape_response(registry: &Registry) -> Response {
    match render(registry) {
        Ok(body) => (
            StatusCode::OK,
            [(
                header::CONTENT_TYPE,
                HeaderValue::from_static(prometheus::TEXT_FORMAT),
            )],
            body,
        )
            .into_response(),
        Err(err) => {
            error!(target: "tmd::metrics", error = %err, "metrics scrape failed");
            (StatusCode::INTERNAL_SERVER_ERROR, "metrics encoding error").into_response()
        }
    }
}

/// Router exposing `registry` at `/metrics`.
pub fn metrics_router(registry: SharedRegistry) -> Router {
    Router::new().route(
        "/metrics",
        get(move || {
            let registry = registry.clone();
            async move { scrape_response(&registry) }
        }),
    )
}

/// Bind `addr` and serve [`metrics_router`] until [`MetricsServer::shutdown`].
pub fn spawn_http_server(registry: SharedRegistry, addr: SocketAddr) -> Result<MetricsServer> {
    let std_listener = StdTcpListener::bind(addr)
        .with_context(|| format!("failed to bind metrics listener {addr}"))?;
    std_listener
        .set_nonblocking(true)
        .context("failed to configure metrics listener as non-blocking")?;
    let bound = std_listener
        .local_addr()
        .context("failed to resolve metrics listener address")?;
    let listener =
        TcpListener::from_std(std_listener).context("failed to hand metrics listener to tokio")?;

    info!(target: "tmd::metrics", address = %bound, "metrics exporter listening");

    let app = metrics_router(registry);
    let (shutdown_tx, shutdown_rx) = oneshot::channel();
    let task: JoinHandle<Result<()>> = tokio::spawn(async move {
        axum::serve(listener, app.into_make_service())
            .with_graceful_shutdown(async move {
                let _ = shutdown_rx.await;
            })
            .await
            .context("metrics exporter stopped with an error")
    });

    Ok(MetricsServer {
        addr: bound,
        shutdown: Some(shutdown_tx),
        task,
    })
}

/// Handle to the running exporter.
#[derive(Debug)]
pub struct MetricsServer {
    addr: SocketAddr,
    shutdown: Option<oneshot::Sender<()>>,
    task: JoinHandle<Result<()>>,
}

impl MetricsServer {
    pub fn addr(&self) -> SocketAddr {
        self.addr
    }

    /// Stop accepting scrapes and wait for in-flight ones to finish.
    pub async fn shutdown(mut self) -> Result<()> {
        if let Some(tx) = self.shutdown.take() {
            let _ = tx.send(());
        }
        self.task.await.context("metrics exporter task panicked")?
    }
}

/// Process-level metrics of `tmd-guardd`.
#[derive(Clone)]
pub struct DaemonMetrics {
    invocations: IntCounterVec,
    config_load_seconds: Histogram,
    probes_configured: IntGaugeVec,
    api_enabled: IntGauge,
    build_info: IntGaugeVec,
}

impl DaemonMetrics {
    pub fn new(registry: SharedRegistry) -> Result<Self> {
        let invocations = IntCounterVec::new(
            Opts::new(
                "tmd_guardd_invocations_total",
                "Daemon invocations by subcommand",
            ),
            &["command"],
        )?;
        let config_load_seconds = Histogram::with_opts(
            HistogramOpts::new(
                "tmd_guardd_config_load_seconds",
                "Time spent loading and validating the guard configuration",
            )
            .buckets(prometheus::exponential_buckets(0.0005, 2.0, 12)?),
        )?;
        let probes_configured = IntGaugeVec::new(
            Opts::new(
                "tmd_guardd_probes_configured",
                "Configured probe targets by role",
            ),
            &["role"],
        )?;
        let api_enabled = IntGauge::new(
            "tmd_guardd_query_api_enabled",
            "1 when the query API is serving",
        )?;
        let build_info = IntGaugeVec::new(
            Opts::new("tmd_guardd_build_info", "Build metadata of the running binary"),
            &["version", "profile"],
        )?;

        registry.register(Box::new(invocations.clone()))?;
        registry.register(Box::new(config_load_seconds.clone()))?;
        registry.register(Box::new(probes_configured.clone()))?;
        registry.register(Box::new(api_enabled.clone()))?;
        registry.register(Box::new(build_info.clone()))?;

        Ok(Self {
            invocations,
            config_load_seconds,
            probes_configured,
            api_enabled,
            build_info,
        })
    }

    /// Count one invocation of `command` (`run` or `check`).
    pub fn record_invocation(&self, command: &str) {
        self.invocations.with_label_values(&[command]).inc();
    }

    pub fn observe_config_load(&self, seconds: f64) {
        self.config_load_seconds.observe(seconds);
    }

    /// Probe targets polled by the monitor versus those only run in the release workflow.
    pub fn set_probe_counts(&self, monitored: usize, workflow_only: usize) {
        self.probes_configured
            .with_label_values(&["monitored"])
            .set(monitored as i64);
        self.probes_configured
            .with_label_values(&["workflow_only"])
            .set(workflow_only as i64);
    }

    pub fn set_api_enabled(&self, enabled: bool) {
        self.api_enabled.set(i64::from(enabled));
    }

    pub fn set_build_info(&self, version: &str, profile: &str) {
        self.build_info.with_label_values(&[version, profile]).set(1);
    }
}

impl std::fmt::Debug for DaemonMetrics {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.debug_struct("DaemonMetrics").finish_non_exhaustive()
    }
}

pub use prometheus;
