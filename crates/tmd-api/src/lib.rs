//! ---
//! tmd_section: "05-networking-external-interfaces"
//! tmd_subsection: "module"
//! tmd_type: "source"
//! tmd_scope: "code"
//! tmd_description: "Read-mostly HTTP surface over the guard service."
//! tmd_version: "v0.1.0"
//! tmd_owner: "tbd"
//! ---
//! Query API for operators and dashboards.
//!
//! | Route | Purpose |
//! |-------|---------|
//! | `GET /api/health` | current [`SystemHealth`] |
//! | `GET /api/alerts` | alerts filtered by `severity`, `category`, `resolved`, `source`, `limit` |
//! | `POST /api/alerts/:id/resolve` | resolve one alert |
//! | `GET /api/executions` | execution history, oldest first, optional `limit` |
//! | `POST /api/check` | run a complete check and return the report |
//! | `GET /metrics` | Prometheus text exposition, when a registry is attached |

use std::net::SocketAddr;
use std::sync::Arc;

use async_trait::async_trait;
use axum::extract::{Path, Query, State};
use axum::http::StatusCode;
use axum::response::{IntoResponse, Response};
use axum::routing::{get, post};
use axum::{Json, Router};
use serde::{Deserialize, Serialize};
use tmd_metrics::{scrape_response, SharedRegistry};
use tmd_resilience::{
    Alert, AlertCategory, AlertFilter, AlertSeverity, CompleteCheckReport, GuardService,
    SystemHealth, WorkflowExecution,
};
use tokio::net::TcpListener;
use tokio::sync::watch;
use tokio::task::JoinHandle;
use tower_http::trace::TraceLayer;
use tracing::{info, warn};
use uuid::Uuid;

/// Operations exposed over HTTP.
#[async_trait]
pub trait GuardQueries: Send + Sync + 'static {
    /// Current system health.
    fn system_health(&self) -> SystemHealth;
    /// Alerts matching `filter`.
    fn alerts(&self, filter: &AlertFilter) -> Vec<Alert>;
    /// Resolve one alert; false when unknown or already resolved.
    fn resolve_alert(&self, id: Uuid) -> bool;
    /// Finished executions, oldest first.
    fn executions(&self) -> Vec<WorkflowExecution>;
    /// Health cycle plus release workflow.
    async fn complete_check(&self) -> CompleteCheckReport;
}

#[async_trait]
impl GuardQueries for GuardService {
    fn system_health(&self) -> SystemHealth {
        GuardService::system_health(self)
    }

    fn alerts(&self, filter: &AlertFilter) -> Vec<Alert> {
        GuardService::alerts(self, Some(filter))
    }

    fn resolve_alert(&self, id: Uuid) -> bool {
        GuardService::resolve_alert(self, id)
    }

    fn executions(&self) -> Vec<WorkflowExecution> {
        self.execution_history()
    }

    async fn complete_check(&self) -> CompleteCheckReport {
        self.run_complete_check().await
    }
}

/// Request errors, rendered as `{"error": ...}`.
#[derive(Debug, thiserror::Error)]
pub enum ApiError {
    /// A query parameter could not be interpreted.
    #[error("invalid query: {0}")]
    InvalidQuery(String),
    /// The addressed alert does not exist or is already resolved.
    #[error("alert {0} not found or already resolved")]
    AlertNotFound(Uuid),
}

impl IntoResponse for ApiError {
    fn into_response(self) -> Response {
        let status = match self {
            ApiError::InvalidQuery(_) => StatusCode::BAD_REQUEST,
            ApiError::AlertNotFound(_) => StatusCode::NOT_FOUND,
        };
        (
            status,
            Json(serde_json::json!({ "error": self.to_string() })),
        )
            .into_response()
    }
}

/// Query string accepted by `GET /api/alerts`.
#[derive(Debug, Clone, Default, Deserialize)]
pub struct AlertQuery {
    /// Minimum severity (`low`, `medium`, `high`, `critical`).
    pub severity: Option<String>,
    /// Category name.
    pub category: Option<String>,
    /// `true` for resolved alerts, `false` for open ones.
    pub resolved: Option<bool>,
    /// Raising component.
    pub source: Option<String>,
    /// Newest `limit` matches.
    pub limit: Option<usize>,
}

impl TryFrom<AlertQuery> for AlertFilter {
    type Error = ApiError;

    fn try_from(query: AlertQuery) -> Result<Self, Self::Error> {
        let min_severity = query
            .severity
            .map(|raw| raw.parse::<AlertSeverity>())
            .transpose()
            .map_err(ApiError::InvalidQuery)?;
        let category = query
            .category
            .map(|raw| raw.parse::<AlertCategory>())
            .transpose()
            .map_err(ApiError::InvalidQuery)?;
        Ok(AlertFilter {
            min_severity,
            category,
            resolved: query.resolved,
            source: query.source,
            limit: query.limit,
        })
    }
}

/// Query string accepted by `GET /api/executions`.
#[derive(Debug, Clone, Default, Deserialize)]
pub struct ExecutionQuery {
    /// Newest `limit` executions.
    pub limit: Option<usize>,
}

/// Body returned by `POST /api/alerts/:id/resolve`.
#[derive(Debug, Clone, Serialize, Deserialize, PartialEq)]
pub struct ResolveResponse {
    /// Alert id.
    pub id: Uuid,
    /// Always true on success.
    pub resolved: bool,
}

struct ApiState {
    guard: Arc<dyn GuardQueries>,
    metrics: Option<SharedRegistry>,
}

/// Configures and spawns the query API server.
#[derive(Clone)]
pub struct QueryApiBuilder {
    listen: SocketAddr,
    guard: Arc<dyn GuardQueries>,
    metrics: Option<SharedRegistry>,
}

impl QueryApiBuilder {
    /// Serve `guard` on `listen`.
    pub fn new(listen: SocketAddr, guard: Arc<dyn GuardQueries>) -> Self {
        Self {
            listen,
            guard,
            metrics: None,
        }
    }

    /// Also expose `registry` at `/metrics`.
    pub fn with_metrics_registry(mut self, registry: SharedRegistry) -> Self {
        self.metrics = Some(registry);
        self
    }

    /// Router without a listener; used by [`spawn`](Self::spawn).
    pub fn router(&self) -> Router {
        let state = ApiState {
            guard: self.guard.clone(),
            metrics: self.metrics.clone(),
        };
        Router::new()
            .route("/api/health", get(get_health))
            .route("/api/alerts", get(get_alerts))
            .route("/api/alerts/:id/resolve", post(post_resolve))
            .route("/api/executions", get(get_executions))
            .route("/api/check", post(post_check))
            .route("/metrics", get(get_metrics))
            .layer(TraceLayer::new_for_http())
            .with_state(Arc::new(state))
    }

    /// Bind and serve in the background.
    pub async fn spawn(self) -> anyhow::Result<QueryApiHandle> {
        let listener = TcpListener::bind(self.listen).await?;
        let local_addr = listener.local_addr()?;
        info!(target: "tmd::api", address = %local_addr, "query api listening");

        let router = self.router();
        let (shutdown_tx, mut shutdown_rx) = watch::channel(false);
        let server = axum::serve(listener, router).with_graceful_shutdown(async move {
            let _ = shutdown_rx.changed().await;
        });
        let task = tokio::spawn(async move {
            if let Err(err) = server.await {
                warn!(target: "tmd::api", error = %err, "query api exited with error");
            }
        });

        Ok(QueryApiHandle {
            address: local_addr,
            task,
            shutdown: shutdown_tx,
        })
    }
}

/// Running server returned by [`QueryApiBuilder::spawn`].
pub struct QueryApiHandle {
    address: SocketAddr,
    task: JoinHandle<()>,
    shutdown: watch::Sender<bool>,
}

impl QueryApiHandle {
    /// Bound address.
    pub fn local_addr(&self) -> SocketAddr {
        self.address
    }

    /// Request graceful shutdown and wait for the server task.
    pub async fn shutdown(self) -> anyhow::Result<()> {
        let _ = self.shutdown.send(true);
        self.task.await.map_err(|join| anyhow::anyhow!(join))
    }
}

async fn get_health(State(state): State<Arc<ApiState>>) -> Json<SystemHealth> {
    Json(state.guard.system_health())
}

async fn get_alerts(
    State(state): State<Arc<ApiState>>,
    Query(query): Query<AlertQuery>,
) -> Result<Json<Vec<Alert>>, ApiError> {
    let filter = AlertFilter::try_from(query)?;
    Ok(Json(state.guard.alerts(&filter)))
}

async fn post_resolve(
    State(state): State<Arc<ApiState>>,
    Path(id): Path<Uuid>,
) -> Result<Json<ResolveResponse>, ApiError> {
    if state.guard.resolve_alert(id) {
        info!(target: "tmd::api", alert = %id, "alert resolved via api");
        Ok(Json(ResolveResponse { id, resolved: true }))
    } else {
        Err(ApiError::AlertNotFound(id))
    }
}

async fn get_executions(
    State(state): State<Arc<ApiState>>,
    Query(query): Query<ExecutionQuery>,
) -> Json<Vec<WorkflowExecution>> {
    let mut executions = state.guard.executions();
    if let Some(limit) = query.limit {
        let skip = executions.len().saturating_sub(limit);
        executions.drain(..skip);
    }
    Json(executions)
}

async fn post_check(State(state): State<Arc<ApiState>>) -> Json<CompleteCheckReport> {
    Json(state.guard.complete_check().await)
}

async fn get_metrics(State(state): State<Arc<ApiState>>) -> Response {
    match &state.metrics {
        Some(registry) => scrape_response(registry),
        None => (StatusCode::SERVICE_UNAVAILABLE, "metrics registry unavailable").into_response(),
    }
}
