//! ---
//! tmd_section: "01-core-functionality"
//! tmd_subsection: "module"
//! tmd_type: "source"
//! tmd_scope: "code"
//! tmd_description: "Shared primitives and utilities for the guard runtime."
//! tmd_version: "v0.1.0"
//! tmd_owner: "tbd"
//! ---
use std::collections::HashSet;
use std::fs;
use std::net::SocketAddr;
use std::path::{Path, PathBuf};
use std::time::Duration;

use anyhow::{anyhow, Context, Result};
use serde::{Deserialize, Serialize};
use serde_with::{serde_as, DurationMilliSeconds};
use tracing::debug;
use url::Url;

use crate::logging::{LogConsole, LogFormat};

fn default_poll_interval() -> Duration {
    Duration::from_secs(30)
}

fn default_probe_timeout() -> Duration {
    Duration::from_secs(5)
}

fn default_step_timeout() -> Duration {
    Duration::from_secs(30)
}

fn default_failure_threshold() -> u32 {
    3
}

fn default_alert_capacity() -> usize {
    100
}

fn default_coalesce_window() -> Duration {
    Duration::from_secs(60)
}

fn default_history_capacity() -> usize {
    20
}

fn default_auto_recovery() -> bool {
    true
}

fn default_halt_on_required_failure() -> bool {
    true
}

fn default_step_retry() -> RetryConfig {
    RetryConfig {
        max_attempts: 3,
        base_delay: Duration::from_millis(500),
        multiplier: 2.0,
        max_delay: Duration::from_secs(10),
        jitter: Duration::ZERO,
    }
}

fn default_recovery_retry() -> RetryConfig {
    RetryConfig {
        max_attempts: 3,
        base_delay: Duration::from_secs(5),
        multiplier: 2.0,
        max_delay: Duration::from_secs(60),
        jitter: Duration::ZERO,
    }
}

fn default_logging_directory() -> PathBuf {
    PathBuf::from("target/logs")
}

fn default_log_format() -> LogFormat {
    LogFormat::StructuredJson
}

fn default_log_level() -> String {
    "info".to_owned()
}

fn default_log_file() -> bool {
    true
}

fn default_metrics_enabled() -> bool {
    true
}

fn default_metrics_listen() -> SocketAddr {
    SocketAddr::from(([0, 0, 0, 0], 9898))
}

fn default_api_enabled() -> bool {
    true
}

fn default_api_listen() -> SocketAddr {
    SocketAddr::from(([0, 0, 0, 0], 8080))
}

fn default_probe_required() -> bool {
    true
}

/// Rejections raised while validating guard settings.
#[derive(Debug, Clone, PartialEq, thiserror::Error)]
pub enum ConfigError {
    #[error("{field} must be greater than zero")]
    Zero { field: &'static str },
    #[error("{field} must be a finite value >= 1.0 (got {value})")]
    InvalidMultiplier { field: &'static str, value: f64 },
    #[error("{field} must lie within {min}..={max} (got {value})")]
    OutOfRange {
        field: &'static str,
        value: f64,
        min: f64,
        max: f64,
    },
    #[error("{field}: max_delay ({max_delay:?}) is shorter than base_delay ({base_delay:?})")]
    DelayBounds {
        field: &'static str,
        base_delay: Duration,
        max_delay: Duration,
    },
    #[error("probe '{0}' is declared more than once")]
    DuplicateProbe(String),
    #[error("probe '{probe}' depends on unknown probe '{dependency}'")]
    UnknownDependency { probe: String, dependency: String },
    #[error("probe '{0}' must declare at least one field for a data-shape check")]
    MissingFields(String),
}

/// Primary configuration object for the guard daemon.
#[derive(Debug, Clone, Default, Serialize, Deserialize)]
pub struct AppConfig {
    #[serde(default)]
    pub guard: GuardConfig,
    #[serde(default)]
    pub logging: LoggingConfig,
    #[serde(default)]
    pub metrics: MetricsConfig,
    #[serde(default)]
    pub api: ApiConfig,
    #[serde(default)]
    pub probes: Vec<ProbeTargetConfig>,
}

/// Metadata describing where an [`AppConfig`] was loaded from.
#[derive(Debug, Clone)]
pub struct LoadedAppConfig {
    pub config: AppConfig,
    pub source: PathBuf,
}

impl AppConfig {
    pub const ENV_CONFIG_PATH: &'static str = "TMD_CONFIG";

    /// Load configuration from disk, respecting the `TMD_CONFIG` override.
    pub fn load<P: AsRef<Path>>(candidates: &[P]) -> Result<Self> {
        Ok(Self::load_with_source(candidates)?.config)
    }

    /// Load configuration from disk together with the effective source path.
    pub fn load_with_source<P: AsRef<Path>>(candidates: &[P]) -> Result<LoadedAppConfig> {
        if let Ok(env_path) = std::env::var(Self::ENV_CONFIG_PATH) {
            if !env_path.trim().is_empty() {
                let path = PathBuf::from(env_path);
                let config = Self::from_path(&path)?;
                return Ok(LoadedAppConfig {
                    config,
                    source: path,
                });
            }
        }

        for candidate in candidates {
            if candidate.as_ref().exists() {
                let path = candidate.as_ref().to_path_buf();
                let config = Self::from_path(&path)?;
                return Ok(LoadedAppConfig {
                    config,
                    source: path,
                });
            }
        }

        Err(anyhow!(
            "no configuration files found. inspected: {}",
            candidates
                .iter()
                .map(|p| p.as_ref().display().to_string())
                .collect::<Vec<_>>()
                .join(", ")
        ))
    }

    /// Parse and validate a single configuration file.
    pub fn from_path(path: &Path) -> Result<Self> {
        debug!(config_path = %path.display(), "loading configuration");
        let contents = fs::read_to_string(path)
            .with_context(|| format!("unable to read config file {}", path.display()))?;
        let config = toml::from_str::<AppConfig>(&contents)
            .with_context(|| format!("failed to parse config file {}", path.display()))?;
        config
            .validate()
            .with_context(|| format!("invalid configuration in {}", path.display()))?;
        Ok(config)
    }

    /// Look up a probe target by name.
    pub fn probe(&self, name: &str) -> Option<&ProbeTargetConfig> {
        self.probes.iter().find(|probe| probe.name == name)
    }

    /// Validate structural invariants.
    pub fn validate(&self) -> std::result::Result<(), ConfigError> {
        self.guard.validate()?;
        let mut seen = HashSet::new();
        for probe in &self.probes {
            if !seen.insert(probe.name.as_str()) {
                return Err(ConfigError::DuplicateProbe(probe.name.clone()));
            }
            probe.validate()?;
        }
        for probe in &self.probes {
            if let Some(dependency) = probe
                .depends_on
                .iter()
                .find(|dep| !seen.contains(dep.as_str()))
            {
                return Err(ConfigError::UnknownDependency {
                    probe: probe.name.clone(),
                    dependency: dependency.clone(),
                });
            }
        }
        Ok(())
    }
}

impl std::str::FromStr for AppConfig {
    type Err = anyhow::Error;

    fn from_str(content: &str) -> std::result::Result<Self, Self::Err> {
        let config: AppConfig =
            toml::from_str(content).with_context(|| "failed to parse configuration")?;
        config.validate()?;
        Ok(config)
    }
}

/// Retry and backoff parameters shared by step retry and recovery retry.
///
/// `max_attempts` counts the first try, so a step with `max_attempts = 3`
/// retries at most twice.
#[serde_as]
#[derive(Debug, Clone, Copy, Serialize, Deserialize, PartialEq)]
pub struct RetryConfig {
    pub max_attempts: u32,
    #[serde(rename = "base_delay_ms")]
    #[serde_as(as = "DurationMilliSeconds<u64>")]
    pub base_delay: Duration,
    pub multiplier: f64,
    #[serde(rename = "max_delay_ms")]
    #[serde_as(as = "DurationMilliSeconds<u64>")]
    pub max_delay: Duration,
    #[serde(rename = "jitter_ms", default)]
    #[serde_as(as = "DurationMilliSeconds<u64>")]
    pub jitter: Duration,
}

impl RetryConfig {
    pub fn validate(&self, field: &'static str) -> std::result::Result<(), ConfigError> {
        if self.max_attempts == 0 {
            return Err(ConfigError::Zero { field });
        }
        if !self.multiplier.is_finite() || self.multiplier < 1.0 {
            return Err(ConfigError::InvalidMultiplier {
                field,
                value: self.multiplier,
            });
        }
        if self.max_delay < self.base_delay {
            return Err(ConfigError::DelayBounds {
                field,
                base_delay: self.base_delay,
                max_delay: self.max_delay,
            });
        }
        Ok(())
    }
}

/// Penalties and threshold applied by the release quality gate.
#[derive(Debug, Clone, Copy, Serialize, Deserialize, PartialEq)]
pub struct QualityGateConfig {
    #[serde(default = "QualityGateConfig::default_minimum_score")]
    pub minimum_score: f64,
    #[serde(default = "QualityGateConfig::default_required_penalty")]
    pub required_failure_penalty: f64,
    #[serde(default = "QualityGateConfig::default_optional_penalty")]
    pub optional_failure_penalty: f64,
    #[serde(default = "QualityGateConfig::default_ratio_penalty")]
    pub failure_ratio_penalty: f64,
}

impl QualityGateConfig {
    fn default_minimum_score() -> f64 {
        80.0
    }

    fn default_required_penalty() -> f64 {
        25.0
    }

    fn default_optional_penalty() -> f64 {
        10.0
    }

    fn default_ratio_penalty() -> f64 {
        20.0
    }

    pub fn validate(&self) -> std::result::Result<(), ConfigError> {
        check_range("quality_gate.minimum_score", self.minimum_score, 0.0, 100.0)?;
        check_range(
            "quality_gate.required_failure_penalty",
            self.required_failure_penalty,
            0.0,
            100.0,
        )?;
        check_range(
            "quality_gate.optional_failure_penalty",
            self.optional_failure_penalty,
            0.0,
            100.0,
        )?;
        check_range(
            "quality_gate.failure_ratio_penalty",
            self.failure_ratio_penalty,
            0.0,
            100.0,
        )
    }
}

impl Default for QualityGateConfig {
    fn default() -> Self {
        Self {
            minimum_score: Self::default_minimum_score(),
            required_failure_penalty: Self::default_required_penalty(),
            optional_failure_penalty: Self::default_optional_penalty(),
            failure_ratio_penalty: Self::default_ratio_penalty(),
        }
    }
}

fn check_range(
    field: &'static str,
    value: f64,
    min: f64,
    max: f64,
) -> std::result::Result<(), ConfigError> {
    if value.is_finite() && (min..=max).contains(&value) {
        Ok(())
    } else {
        Err(ConfigError::OutOfRange {
            field,
            value,
            min,
            max,
        })
    }
}

/// The single configuration surface of the health-monitoring and release-gating core.
#[serde_as]
#[derive(Debug, Clone, Serialize, Deserialize, PartialEq)]
pub struct GuardConfig {
    #[serde(rename = "poll_interval_ms", default = "default_poll_interval")]
    #[serde_as(as = "DurationMilliSeconds<u64>")]
    pub poll_interval: Duration,
    #[serde(rename = "probe_timeout_ms", default = "default_probe_timeout")]
    #[serde_as(as = "DurationMilliSeconds<u64>")]
    pub probe_timeout: Duration,
    #[serde(rename = "step_timeout_ms", default = "default_step_timeout")]
    #[serde_as(as = "DurationMilliSeconds<u64>")]
    pub step_timeout: Duration,
    #[serde(default = "default_failure_threshold")]
    pub failure_threshold: u32,
    #[serde(default = "default_step_retry")]
    pub step_retry: RetryConfig,
    #[serde(default = "default_recovery_retry")]
    pub recovery_retry: RetryConfig,
    #[serde(default = "default_auto_recovery")]
    pub auto_recovery: bool,
    #[serde(default = "default_alert_capacity")]
    pub alert_capacity: usize,
    #[serde(rename = "alert_coalesce_window_ms", default = "default_coalesce_window")]
    #[serde_as(as = "DurationMilliSeconds<u64>")]
    pub alert_coalesce_window: Duration,
    #[serde(default = "default_history_capacity")]
    pub execution_history_capacity: usize,
    #[serde(default = "default_halt_on_required_failure")]
    pub halt_on_required_failure: bool,
    #[serde(default)]
    pub quality_gate: QualityGateConfig,
}

impl GuardConfig {
    /// Reject invalid values outright; nothing is clamped.
    pub fn validate(&self) -> std::result::Result<(), ConfigError> {
        if self.poll_interval.is_zero() {
            return Err(ConfigError::Zero {
                field: "poll_interval_ms",
            });
        }
        if self.probe_timeout.is_zero() {
            return Err(ConfigError::Zero {
                field: "probe_timeout_ms",
            });
        }
        if self.step_timeout.is_zero() {
            return Err(ConfigError::Zero {
                field: "step_timeout_ms",
            });
        }
        if self.failure_threshold == 0 {
            return Err(ConfigError::Zero {
                field: "failure_threshold",
            });
        }
        if self.alert_capacity == 0 {
            return Err(ConfigError::Zero {
                field: "alert_capacity",
            });
        }
        if self.execution_history_capacity == 0 {
            return Err(ConfigError::Zero {
                field: "execution_history_capacity",
            });
        }
        self.step_retry.validate("step_retry")?;
        self.recovery_retry.validate("recovery_retry")?;
        self.quality_gate.validate()
    }
}

impl Default for GuardConfig {
    fn default() -> Self {
        Self {
            poll_interval: default_poll_interval(),
            probe_timeout: default_probe_timeout(),
            step_timeout: default_step_timeout(),
            failure_threshold: default_failure_threshold(),
            step_retry: default_step_retry(),
            recovery_retry: default_recovery_retry(),
            auto_recovery: default_auto_recovery(),
            alert_capacity: default_alert_capacity(),
            alert_coalesce_window: default_coalesce_window(),
            execution_history_capacity: default_history_capacity(),
            halt_on_required_failure: default_halt_on_required_failure(),
            quality_gate: QualityGateConfig::default(),
        }
    }
}

/// Kind of check performed against the dashboard read path.
#[derive(Debug, Clone, Copy, Serialize, Deserialize, PartialEq, Eq, Hash)]
#[serde(rename_all = "snake_case")]
pub enum ProbeKind {
    /// Endpoint answers with a 2xx status.
    Reachability,
    /// Endpoint answers within the latency budget.
    Latency,
    /// Endpoint returns JSON whose configured numeric fields are present and non-zero.
    DataShape,
    /// Endpoint returns a non-empty payload suitable for delivery.
    Payload,
}

/// One external check wired into both the health monitor and the release workflow.
#[serde_as]
#[derive(Debug, Clone, Serialize, Deserialize, PartialEq)]
pub struct ProbeTargetConfig {
    pub name: String,
    pub kind: ProbeKind,
    pub url: Url,
    #[serde(default)]
    pub fields: Vec<String>,
    #[serde(rename = "latency_budget_ms", default)]
    #[serde_as(as = "Option<DurationMilliSeconds<u64>>")]
    pub latency_budget: Option<Duration>,
    #[serde(default = "default_probe_required")]
    pub required: bool,
    #[serde(default)]
    pub depends_on: Vec<String>,
    #[serde(default)]
    pub max_retries: Option<u32>,
    /// Exclude from the polling loop; the check then only runs inside release workflows.
    #[serde(default)]
    pub workflow_only: bool,
}

impl ProbeTargetConfig {
    fn validate(&self) -> std::result::Result<(), ConfigError> {
        if self.kind == ProbeKind::DataShape && self.fields.is_empty() {
            return Err(ConfigError::MissingFields(self.name.clone()));
        }
        if let Some(budget) = self.latency_budget {
            if budget.is_zero() {
                return Err(ConfigError::Zero {
                    field: "latency_budget_ms",
                });
            }
        }
        Ok(())
    }
}

/// `[logging]`: console and rolling-file output. `TMD_LOG` overrides `level`.
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct LoggingConfig {
    /// Base filter level for the guard's own events.
    #[serde(default = "default_log_level")]
    pub level: String,
    #[serde(default = "default_log_format")]
    pub format: LogFormat,
    #[serde(default)]
    pub console: LogConsole,
    /// Also write a daily JSON log under `directory`.
    #[serde(default = "default_log_file")]
    pub file: bool,
    #[serde(default = "default_logging_directory")]
    pub directory: PathBuf,
    #[serde(default)]
    pub file_prefix: Option<String>,
}

impl Default for LoggingConfig {
    fn default() -> Self {
        Self {
            level: default_log_level(),
            format: default_log_format(),
            console: LogConsole::default(),
            file: default_log_file(),
            directory: default_logging_directory(),
            file_prefix: None,
        }
    }
}

#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct MetricsConfig {
    #[serde(default = "default_metrics_enabled")]
    pub enabled: bool,
    #[serde(default = "default_metrics_listen")]
    pub listen: SocketAddr,
}

impl Default for MetricsConfig {
    fn default() -> Self {
        Self {
            enabled: default_metrics_enabled(),
            listen: default_metrics_listen(),
        }
    }
}

#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct ApiConfig {
    #[serde(default = "default_api_enabled")]
    pub enabled: bool,
    #[serde(default = "default_api_listen")]
    pub listen: SocketAddr,
}

impl Default for ApiConfig {
    fn default() -> Self {
        Self {
            enabled: default_api_enabled(),
            listen: default_api_listen(),
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn defaults_validate() {
        let config = GuardConfig::default();
        assert!(config.validate().is_ok());
        assert_eq!(config.failure_threshold, 3);
        assert_eq!(config.step_retry.max_attempts, 3);
    }

    #[test]
    fn zero_poll_interval_is_rejected() {
        let config = GuardConfig {
            poll_interval: Duration::ZERO,
            ..GuardConfig::default()
        };
        assert_eq!(
            config.validate(),
            Err(ConfigError::Zero {
                field: "poll_interval_ms"
            })
        );
    }

    #[test]
    fn zero_recovery_attempts_are_rejected() {
        let mut config = GuardConfig::default();
        config.recovery_retry.max_attempts = 0;
        assert_eq!(
            config.validate(),
            Err(ConfigError::Zero {
                field: "recovery_retry"
            })
        );
    }

    #[test]
    fn shrinking_multiplier_is_rejected() {
        let mut config = GuardConfig::default();
        config.step_retry.multiplier = 0.5;
        assert!(matches!(
            config.validate(),
            Err(ConfigError::InvalidMultiplier { .. })
        ));
    }

    #[test]
    fn minimum_score_outside_range_is_rejected() {
        let mut config = GuardConfig::default();
        config.quality_gate.minimum_score = 120.0;
        assert!(matches!(
            config.validate(),
            Err(ConfigError::OutOfRange { .. })
        ));
    }
}
