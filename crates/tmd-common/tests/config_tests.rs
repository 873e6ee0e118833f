//! ---
//! tmd_section: "01-core-functionality"
//! tmd_subsection: "tests"
//! tmd_type: "source"
//! tmd_scope: "code"
//! tmd_description: "Configuration loading and validation tests."
//! tmd_version: "v0.1.0"
//! tmd_owner: "tbd"
//! ---
use std::io::Write;
use std::time::Duration;

use tmd_common::config::{AppConfig, ConfigError, ProbeKind};
use tmd_common::{LogConsole, LogFormat};

const SAMPLE: &str = r#"
    [guard]
    poll_interval_ms = 15000
    probe_timeout_ms = 2000
    failure_threshold = 2
    alert_capacity = 50

    [guard.step_retry]
    max_attempts = 4
    base_delay_ms = 100
    multiplier = 1.5
    max_delay_ms = 2000

    [guard.quality_gate]
    minimum_score = 70.0

    [logging]
    format = "pretty"
    level = "debug"
    file = false

    [[probes]]
    name = "metrics-endpoint"
    kind = "reachability"
    url = "http://127.0.0.1:5000/api/metrics"

    [[probes]]
    name = "metrics-shape"
    kind = "data_shape"
    url = "http://127.0.0.1:5000/api/metrics"
    fields = ["totals.open", "totals.closed"]
    depends_on = ["metrics-endpoint"]

    [[probes]]
    name = "metrics-latency"
    kind = "latency"
    url = "http://127.0.0.1:5000/api/metrics"
    latency_budget_ms = 750
    required = false
    depends_on = ["metrics-endpoint"]
"#;

#[test]
fn parses_full_configuration() {
    let config: AppConfig = SAMPLE.parse().expect("sample config parses");
    assert_eq!(config.guard.poll_interval, Duration::from_secs(15));
    assert_eq!(config.guard.probe_timeout, Duration::from_secs(2));
    assert_eq!(config.guard.failure_threshold, 2);
    assert_eq!(config.guard.step_retry.max_attempts, 4);
    assert_eq!(config.guard.step_retry.base_delay, Duration::from_millis(100));
    assert_eq!(config.guard.quality_gate.minimum_score, 70.0);
    // untouched sections keep their defaults
    assert_eq!(config.guard.recovery_retry.max_attempts, 3);
    assert_eq!(config.guard.quality_gate.required_failure_penalty, 25.0);

    assert_eq!(config.probes.len(), 3);
    let latency = config.probe("metrics-latency").expect("latency probe");
    assert_eq!(latency.kind, ProbeKind::Latency);
    assert_eq!(latency.latency_budget, Some(Duration::from_millis(750)));
    assert!(!latency.required);
    assert!(config.probe("metrics-shape").expect("shape probe").required);

    assert_eq!(config.logging.format, LogFormat::Pretty);
    assert_eq!(config.logging.level, "debug");
    assert!(!config.logging.file);
    assert_eq!(config.logging.console, LogConsole::Stderr);
}

#[test]
fn loads_from_disk() {
    let mut file = tempfile::NamedTempFile::new().expect("tempfile");
    file.write_all(SAMPLE.as_bytes()).expect("write sample");
    let config = AppConfig::from_path(file.path()).expect("load from disk");
    assert_eq!(config.probes.len(), 3);
}

#[test]
fn empty_document_uses_defaults() {
    let config: AppConfig = "".parse().expect("empty config is valid");
    assert!(config.probes.is_empty());
    assert_eq!(config.guard.alert_capacity, 100);
    assert!(config.guard.auto_recovery);
}

#[test]
fn unknown_dependency_is_rejected() {
    let raw = r#"
        [[probes]]
        name = "shape"
        kind = "reachability"
        url = "http://localhost/api"
        depends_on = ["missing"]
    "#;
    let config: AppConfig = toml::from_str(raw).expect("syntactically valid");
    assert_eq!(
        config.validate(),
        Err(ConfigError::UnknownDependency {
            probe: "shape".into(),
            dependency: "missing".into(),
        })
    );
}

#[test]
fn data_shape_without_fields_is_rejected() {
    let raw = r#"
        [[probes]]
        name = "shape"
        kind = "data_shape"
        url = "http://localhost/api"
    "#;
    let err = raw.parse::<AppConfig>().expect_err("fields are mandatory");
    assert!(err.to_string().contains("at least one field") || format!("{err:#}").contains("at least one field"));
}

#[test]
fn zero_threshold_is_rejected_not_clamped() {
    let raw = r#"
        [guard]
        failure_threshold = 0
    "#;
    let config: AppConfig = toml::from_str(raw).expect("syntactically valid");
    assert_eq!(
        config.validate(),
        Err(ConfigError::Zero {
            field: "failure_threshold"
        })
    );
}

#[test]
fn shipped_example_config_is_valid() {
    let path = std::path::Path::new(env!("CARGO_MANIFEST_DIR")).join("../../configs/example.toml");
    let config = AppConfig::from_path(&path).expect("example config loads");
    let payload = config.probe("snapshot-payload").expect("payload probe");
    assert_eq!(payload.kind, ProbeKind::Payload);
    assert!(payload.workflow_only);
    assert_eq!(payload.max_retries, Some(1));
    assert_eq!(config.guard.step_retry.jitter, Duration::from_millis(100));
}
