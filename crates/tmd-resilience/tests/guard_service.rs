//! ---
//! tmd_section: "07-resilience-fault-tolerance"
//! tmd_subsection: "tests"
//! tmd_type: "source"
//! tmd_scope: "code"
//! tmd_description: "Health escalation, alert capacity, and auto-recovery end to end."
//! tmd_version: "v0.1.0"
//! tmd_owner: "tbd"
//! ---
use std::sync::atomic::{AtomicBool, AtomicU32, Ordering};
use std::sync::Arc;
use std::time::Duration;

use tmd_common::config::{GuardConfig, RetryConfig};
use tmd_common::time::ManualClock;
use tmd_metrics::{new_registry, render};
use tmd_resilience::health::DEGRADED_ALERT_TITLE;
use tmd_resilience::recovery::EXHAUSTED_ALERT_TITLE;
use tmd_resilience::{
    AlertCategory, AlertFilter, AlertManager, AlertSeverity, FnProbe, GuardService, HealthLevel,
    NewAlert, Probe, ProbeOutcome, RecoveryVerdict, ResilienceMetrics, StepCheck,
    StepDefinition, ValidationOutcome, WorkflowPlan,
};

fn switchable_probe(name: &str, healthy: Arc<AtomicBool>) -> Arc<dyn Probe> {
    FnProbe::shared(name, move |_| {
        let healthy = healthy.load(Ordering::SeqCst);
        async move {
            Ok(if healthy {
                ProbeOutcome::pass("reachable")
            } else {
                ProbeOutcome::fail("connection refused")
            })
        }
    })
}

fn counting_plan(calls: Arc<AtomicU32>, healthy: Arc<AtomicBool>) -> WorkflowPlan {
    WorkflowPlan::new(
        "release",
        vec![StepDefinition::new(
            "validate-snapshot",
            StepCheck::from_fn(move || {
                calls.fetch_add(1, Ordering::SeqCst);
                let healthy = healthy.load(Ordering::SeqCst);
                async move {
                    Ok(if healthy {
                        ValidationOutcome::ok("snapshot valid")
                    } else {
                        ValidationOutcome::failed("snapshot empty")
                    })
                }
            }),
        )
        .max_retries(0)],
    )
    .unwrap()
}

#[tokio::test]
async fn threshold_degrades_and_full_pass_recovers() {
    let healthy = Arc::new(AtomicBool::new(false));
    let service = GuardService::builder(GuardConfig {
        failure_threshold: 3,
        auto_recovery: false,
        ..GuardConfig::default()
    })
    .clock(Arc::new(ManualClock::default()))
    .probe(switchable_probe("metrics-endpoint", healthy.clone()))
    .probe(switchable_probe("ranking-endpoint", Arc::new(AtomicBool::new(true))))
    .build()
    .unwrap();

    for expected in 1..=3u32 {
        let report = service.force_check().await;
        assert_eq!(report.consecutive_failures, expected);
        assert_eq!(report.failed, 1);
        assert_eq!(report.passed, 1);
    }
    let degraded = service.system_health();
    assert_eq!(degraded.level, HealthLevel::Degraded);
    assert_eq!(degraded.consecutive_failures, 3);
    let high = service.alerts(Some(&AlertFilter {
        min_severity: Some(AlertSeverity::High),
        ..AlertFilter::default()
    }));
    assert_eq!(high.len(), 1);
    assert_eq!(high[0].title, DEGRADED_ALERT_TITLE);

    healthy.store(true, Ordering::SeqCst);
    let report = service.force_check().await;
    assert!(report.all_passed());
    let health = service.system_health();
    assert_eq!(health.level, HealthLevel::Healthy);
    assert_eq!(health.consecutive_failures, 0);

    let recovered = service.alerts(Some(&AlertFilter {
        category: Some(AlertCategory::Health),
        resolved: Some(false),
        ..AlertFilter::default()
    }));
    assert_eq!(recovered.len(), 1);
    assert_eq!(recovered[0].severity, AlertSeverity::Low);
}

#[test]
fn alert_capacity_evicts_oldest() {
    let alerts = AlertManager::new(2, Duration::from_secs(60));
    for title in ["X", "Y", "Z"] {
        alerts.raise(NewAlert::new(
            AlertCategory::System,
            AlertSeverity::Medium,
            title,
            "capacity check",
        ));
        assert!(alerts.len() <= 2);
    }
    let titles: Vec<_> = alerts.list(None).into_iter().map(|a| a.title).collect();
    assert_eq!(titles, vec!["Y", "Z"]);
}

#[tokio::test]
async fn recovery_exhaustion_marks_critical_once() {
    let clock = Arc::new(ManualClock::default());
    let calls = Arc::new(AtomicU32::new(0));
    let never = Arc::new(AtomicBool::new(false));
    let service = GuardService::builder(GuardConfig {
        failure_threshold: 1,
        recovery_retry: RetryConfig {
            max_attempts: 2,
            base_delay: Duration::from_secs(5),
            multiplier: 2.0,
            max_delay: Duration::from_secs(60),
            jitter: Duration::ZERO,
        },
        ..GuardConfig::default()
    })
    .clock(clock.clone())
    .probe(switchable_probe("metrics-endpoint", never.clone()))
    .plan(counting_plan(calls.clone(), never))
    .build()
    .unwrap();

    let report = service.force_check().await;
    assert!(report.recovery_triggered);
    assert_eq!(report.level, HealthLevel::Degraded);

    let outcome = service.await_recovery().await.expect("recovery spawned");
    assert_eq!(outcome.verdict, RecoveryVerdict::Exhausted);
    assert_eq!(outcome.attempts, 2);
    assert_eq!(calls.load(Ordering::SeqCst), 2);
    assert_eq!(clock.recorded_sleeps(), vec![Duration::from_secs(5)]);
    assert_eq!(service.system_health().level, HealthLevel::Critical);

    // Same episode: further failures neither re-trigger recovery nor add exhaustion alerts.
    let again = service.force_check().await;
    assert!(!again.recovery_triggered);
    assert_eq!(again.level, HealthLevel::Critical);
    assert!(service.await_recovery().await.is_none());
    assert_eq!(calls.load(Ordering::SeqCst), 2);

    let exhausted: Vec<_> = service
        .alerts(None)
        .into_iter()
        .filter(|alert| alert.title == EXHAUSTED_ALERT_TITLE)
        .collect();
    assert_eq!(exhausted.len(), 1);
    assert_eq!(exhausted[0].severity, AlertSeverity::Critical);
    assert_eq!(exhausted[0].category, AlertCategory::Recovery);
}

#[tokio::test]
async fn late_exhaustion_after_full_pass_keeps_system_healthy() {
    let probe_healthy = Arc::new(AtomicBool::new(false));
    let slow_failing = WorkflowPlan::new(
        "release",
        vec![StepDefinition::new(
            "validate-snapshot",
            StepCheck::from_fn(|| async {
                tokio::time::sleep(Duration::from_millis(100)).await;
                Ok(ValidationOutcome::failed("snapshot empty"))
            }),
        )
        .max_retries(0)],
    )
    .unwrap();
    let service = GuardService::builder(GuardConfig {
        failure_threshold: 1,
        recovery_retry: RetryConfig {
            max_attempts: 1,
            base_delay: Duration::from_secs(5),
            multiplier: 2.0,
            max_delay: Duration::from_secs(60),
            jitter: Duration::ZERO,
        },
        ..GuardConfig::default()
    })
    .clock(Arc::new(ManualClock::default()))
    .probe(switchable_probe("metrics-endpoint", probe_healthy.clone()))
    .plan(slow_failing)
    .build()
    .unwrap();

    assert!(service.force_check().await.recovery_triggered);

    // The dashboard comes back while the recovery run is still in flight.
    probe_healthy.store(true, Ordering::SeqCst);
    let report = service.force_check().await;
    assert_eq!(report.level, HealthLevel::Healthy);
    assert_eq!(report.consecutive_failures, 0);

    let outcome = service.await_recovery().await.expect("recovery spawned");
    assert_eq!(outcome.verdict, RecoveryVerdict::Exhausted);

    let health = service.system_health();
    assert_eq!(health.level, HealthLevel::Healthy);
    assert_eq!(health.consecutive_failures, 0);
    let open_exhausted = service.alerts(Some(&AlertFilter {
        category: Some(AlertCategory::Recovery),
        resolved: Some(false),
        ..AlertFilter::default()
    }));
    assert!(open_exhausted
        .iter()
        .all(|alert| alert.title != EXHAUSTED_ALERT_TITLE));
}

#[tokio::test]
async fn successful_recovery_restores_health() {
    let calls = Arc::new(AtomicU32::new(0));
    let probe_healthy = Arc::new(AtomicBool::new(false));
    let plan_healthy = Arc::new(AtomicBool::new(true));
    let service = GuardService::builder(GuardConfig {
        failure_threshold: 2,
        ..GuardConfig::default()
    })
    .clock(Arc::new(ManualClock::default()))
    .probe(switchable_probe("metrics-endpoint", probe_healthy))
    .plan(counting_plan(calls.clone(), plan_healthy))
    .build()
    .unwrap();

    assert!(!service.force_check().await.recovery_triggered);
    assert!(service.force_check().await.recovery_triggered);
    let outcome = service.await_recovery().await.unwrap();
    assert!(outcome.succeeded());
    assert_eq!(outcome.attempts, 1);

    let health = service.system_health();
    assert_eq!(health.level, HealthLevel::Healthy);
    assert_eq!(health.consecutive_failures, 0);
    let history = service.execution_history();
    assert_eq!(history.len(), 1);
    assert_eq!(history[0].trigger.as_str(), "recovery");
}

#[tokio::test]
async fn complete_check_reports_safe_to_ship_and_metrics() {
    let registry = new_registry();
    let metrics = ResilienceMetrics::new(registry.clone()).unwrap();
    let healthy = Arc::new(AtomicBool::new(true));
    let service = GuardService::builder(GuardConfig::default())
        .metrics(metrics)
        .probe(switchable_probe("metrics-endpoint", healthy.clone()))
        .plan(counting_plan(Arc::new(AtomicU32::new(0)), healthy.clone()))
        .build()
        .unwrap();

    let report = service.run_complete_check().await;
    assert!(report.safe_to_ship);
    assert!(report.health.all_passed());
    assert!(report.execution.approved);
    assert!(report.open_alerts.is_empty());

    healthy.store(false, Ordering::SeqCst);
    let report = service.run_complete_check().await;
    assert!(!report.safe_to_ship);
    assert!(!report.open_alerts.is_empty());

    let body = render(&registry).unwrap();
    assert!(body.contains("tmd_workflow_executions_total"));
    assert!(body.contains("tmd_probe_runs_total"));
    assert!(body.contains("tmd_alerts_raised_total"));
}

#[tokio::test]
async fn service_polls_until_stopped() {
    let service = GuardService::builder(GuardConfig {
        poll_interval: Duration::from_millis(10),
        ..GuardConfig::default()
    })
    .probe(switchable_probe("metrics-endpoint", Arc::new(AtomicBool::new(true))))
    .build()
    .unwrap();

    assert!(service.start());
    tokio::time::sleep(Duration::from_millis(60)).await;
    assert!(service.stop().await.is_none());
    assert!(service.system_health().last_check_at.is_some());
}
