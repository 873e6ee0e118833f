//! ---
//! tmd_section: "05-integrations"
//! tmd_subsection: "tests"
//! tmd_type: "source"
//! tmd_scope: "code"
//! tmd_description: "HTTP probes against a local stand-in for the dashboard API."
//! tmd_version: "v0.1.0"
//! tmd_owner: "tbd"
//! ---
use std::net::SocketAddr;
use std::sync::Arc;
use std::time::Duration;

use axum::http::StatusCode;
use axum::routing::get;
use axum::{Json, Router};
use serde_json::json;
use tmd_common::config::{ProbeKind, ProbeTargetConfig};
use tmd_common::time::SystemClock;
use tmd_probes::{build_client, monitored_probes, release_plan, DataShapeProbe, LatencyProbe};
use tmd_resilience::{
    run_probe, AlertManager, EngineSettings, Probe, StepStatus, WorkflowEngine,
};
use tokio::net::TcpListener;
use url::Url;

async fn spawn_dashboard() -> SocketAddr {
    let app = Router::new()
        .route(
            "/api/metrics",
            get(|| async { Json(json!({ "totals": { "open": 12, "closed": 30 } })) }),
        )
        .route(
            "/api/stale",
            get(|| async { Json(json!({ "totals": { "open": 0 } })) }),
        )
        .route("/api/snapshot", get(|| async { Json(json!([])) }))
        .route(
            "/api/slow",
            get(|| async {
                tokio::time::sleep(Duration::from_millis(200)).await;
                "late"
            }),
        )
        .route(
            "/api/broken",
            get(|| async { (StatusCode::SERVICE_UNAVAILABLE, "maintenance") }),
        );
    let listener = TcpListener::bind("127.0.0.1:0").await.unwrap();
    let addr = listener.local_addr().unwrap();
    tokio::spawn(async move {
        axum::serve(listener, app).await.unwrap();
    });
    addr
}

fn url(addr: SocketAddr, path: &str) -> Url {
    Url::parse(&format!("http://{addr}{path}")).unwrap()
}

fn target(name: &str, kind: ProbeKind, url: Url) -> ProbeTargetConfig {
    ProbeTargetConfig {
        name: name.into(),
        kind,
        url,
        fields: Vec::new(),
        latency_budget: None,
        required: true,
        depends_on: Vec::new(),
        max_retries: Some(0),
        workflow_only: false,
    }
}

#[tokio::test]
async fn data_shape_probe_flags_missing_and_zero_fields() {
    let addr = spawn_dashboard().await;
    let client = build_client(Duration::from_secs(2)).unwrap();
    let fields = vec!["totals.open".to_string(), "totals.closed".to_string()];

    let healthy = DataShapeProbe::new("shape", client.clone(), url(addr, "/api/metrics"), fields.clone());
    let outcome = healthy.run(Duration::from_secs(1)).await.unwrap();
    assert!(outcome.passed, "{}", outcome.message);

    let stale = DataShapeProbe::new("shape", client, url(addr, "/api/stale"), fields);
    let outcome = stale.run(Duration::from_secs(1)).await.unwrap();
    assert!(!outcome.passed);
    assert_eq!(outcome.detail["zero"], json!(["totals.open"]));
    assert_eq!(outcome.detail["missing"], json!(["totals.closed"]));
}

#[tokio::test]
async fn latency_probe_enforces_budget() {
    let addr = spawn_dashboard().await;
    let client = build_client(Duration::from_secs(2)).unwrap();
    let probe = LatencyProbe::new(
        "latency",
        client,
        url(addr, "/api/slow"),
        Duration::from_millis(50),
    );
    let outcome = probe.run(Duration::from_secs(1)).await.unwrap();
    assert!(!outcome.passed);
    assert!(outcome.message.contains("budget 50ms"));
}

#[tokio::test]
async fn monitored_probes_skip_workflow_only_targets() {
    let addr = spawn_dashboard().await;
    let client = build_client(Duration::from_secs(2)).unwrap();
    let mut delivery = target("snapshot", ProbeKind::Payload, url(addr, "/api/snapshot"));
    delivery.workflow_only = true;
    let targets = vec![
        target("endpoint", ProbeKind::Reachability, url(addr, "/api/broken")),
        delivery,
    ];

    let probes = monitored_probes(&targets, &client, Duration::from_secs(1));
    assert_eq!(probes.len(), 1);
    let result = run_probe(probes[0].clone(), Duration::from_secs(1), &SystemClock).await;
    assert!(!result.passed);
    assert_eq!(result.detail["status"], 503);
}

#[tokio::test]
async fn release_plan_gates_on_empty_snapshot() {
    let addr = spawn_dashboard().await;
    let client = build_client(Duration::from_secs(2)).unwrap();
    let mut shape = target("shape", ProbeKind::DataShape, url(addr, "/api/metrics"));
    shape.fields = vec!["totals.open".into()];
    shape.depends_on = vec!["endpoint".into()];
    let mut snapshot = target("snapshot", ProbeKind::Payload, url(addr, "/api/snapshot"));
    snapshot.depends_on = vec!["shape".into()];
    let targets = vec![
        target("endpoint", ProbeKind::Reachability, url(addr, "/api/metrics")),
        shape,
        snapshot,
    ];

    let plan = release_plan("release", &targets, &client, Duration::from_secs(1)).unwrap();
    assert_eq!(plan.topological_order(), vec!["endpoint", "shape", "snapshot"]);

    let alerts = Arc::new(AlertManager::new(20, Duration::from_secs(60)));
    let engine = WorkflowEngine::new(EngineSettings::default(), alerts);
    let execution = engine.execute(&plan).await;
    assert_eq!(execution.step("endpoint").unwrap().status, StepStatus::Completed);
    assert_eq!(execution.step("shape").unwrap().status, StepStatus::Completed);
    let snapshot = execution.step("snapshot").unwrap();
    assert_eq!(snapshot.status, StepStatus::Failed);
    assert!(snapshot.error.as_deref().unwrap().contains("empty payload"));
    assert!(!execution.approved);
}
