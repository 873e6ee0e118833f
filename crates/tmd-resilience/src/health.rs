//! ---
//! tmd_section: "07-resilience-fault-tolerance"
//! tmd_subsection: "module"
//! tmd_type: "source"
//! tmd_scope: "code"
//! tmd_description: "Interval health monitoring with escalation and auto-recovery triggering."
//! tmd_version: "v0.1.0"
//! tmd_owner: "tbd"
//! ---
use std::fmt;
use std::sync::Arc;
use std::time::Duration;

use chrono::{DateTime, Utc};
use futures::future::join_all;
use parking_lot::Mutex;
use serde::{Deserialize, Serialize};
use serde_json::json;
use tmd_common::config::GuardConfig;
use tmd_common::time::{millis_between, SharedClock, SystemClock};
use tokio::sync::watch;
use tokio::task::JoinHandle;
use tracing::{debug, info, warn};

use crate::alerts::{AlertCategory, AlertManager, AlertSeverity, NewAlert};
use crate::metrics::ResilienceMetrics;
use crate::probe::{run_probe, Probe, ProbeResult};
use crate::recovery::{RecoveryController, RecoveryOutcome, RecoveryVerdict, EXHAUSTED_ALERT_TITLE};

/// Title of the alert raised once the failure threshold is reached.
pub const DEGRADED_ALERT_TITLE: &str = "System health degraded";
/// Title of the escalated alert raised at twice the failure threshold.
pub const CRITICAL_ALERT_TITLE: &str = "System health critical";
/// Title of the informational alert raised when a check passes after a failure episode.
pub const RECOVERED_ALERT_TITLE: &str = "System health recovered";

/// Enumerates the health levels exposed to operators.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, Serialize, Deserialize)]
#[serde(rename_all = "lowercase")]
pub enum HealthLevel {
    /// Every probe passed on the last check.
    Healthy,
    /// Failures reached the threshold; recovery may be running.
    Degraded,
    /// Auto-recovery exhausted its budget.
    Critical,
}

impl HealthLevel {
    /// Represent the level as a static label for metrics and status payloads.
    pub fn as_str(&self) -> &'static str {
        match self {
            HealthLevel::Healthy => "healthy",
            HealthLevel::Degraded => "degraded",
            HealthLevel::Critical => "critical",
        }
    }
}

impl fmt::Display for HealthLevel {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.write_str(self.as_str())
    }
}

/// Snapshot of the system health state.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct SystemHealth {
    /// Current level.
    pub level: HealthLevel,
    /// Consecutive checks with at least one failed probe.
    pub consecutive_failures: u32,
    /// Time of the last completed check.
    pub last_check_at: Option<DateTime<Utc>>,
    /// Time since the monitor was created.
    pub uptime_ms: u64,
}

/// Result of one check cycle.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct HealthReport {
    /// When the cycle started.
    pub checked_at: DateTime<Utc>,
    /// Level after applying the cycle.
    pub level: HealthLevel,
    /// Counter after applying the cycle.
    pub consecutive_failures: u32,
    /// Every probe result, in registration order.
    pub results: Vec<ProbeResult>,
    /// Probes that passed.
    pub passed: usize,
    /// Probes that failed.
    pub failed: usize,
    /// Duration of the cycle.
    pub duration_ms: u64,
    /// Whether this cycle started an auto-recovery episode.
    pub recovery_triggered: bool,
}

impl HealthReport {
    /// Whether every probe passed.
    pub fn all_passed(&self) -> bool {
        self.failed == 0
    }
}

/// Thresholds applied by [`HealthMonitor`].
#[derive(Debug, Clone, Copy, PartialEq)]
pub struct MonitorSettings {
    /// Bound on each probe invocation.
    pub probe_timeout: Duration,
    /// Consecutive failing checks before degrading.
    pub failure_threshold: u32,
    /// Trigger auto-recovery on degradation.
    pub auto_recovery: bool,
}

impl MonitorSettings {
    /// Derive settings from the guard configuration.
    pub fn from_config(config: &GuardConfig) -> Self {
        Self {
            probe_timeout: config.probe_timeout,
            failure_threshold: config.failure_threshold,
            auto_recovery: config.auto_recovery,
        }
    }
}

impl Default for MonitorSettings {
    fn default() -> Self {
        Self::from_config(&GuardConfig::default())
    }
}

#[derive(Debug)]
struct HealthState {
    level: HealthLevel,
    consecutive_failures: u32,
    last_check_at: Option<DateTime<Utc>>,
    recovery_requested: bool,
}

/// What a cycle changed, computed under the state lock and acted on after it.
struct CycleEffects {
    previous: HealthLevel,
    level: HealthLevel,
    consecutive_failures: u32,
    escalation: Option<AlertSeverity>,
    request_recovery: bool,
}

/// State shared with spawned recovery tasks.
struct HealthCore {
    state: Mutex<HealthState>,
    alerts: Arc<AlertManager>,
    metrics: Option<ResilienceMetrics>,
}

impl HealthCore {
    /// Apply a finished recovery episode. A passing check clears
    /// `recovery_requested`, so a verdict landing after it is stale and
    /// must not move the level.
    fn apply_recovery(&self, outcome: &RecoveryOutcome) {
        let previous = {
            let mut state = self.state.lock();
            if outcome.verdict == RecoveryVerdict::AlreadyInFlight {
                return;
            }
            if !state.recovery_requested {
                drop(state);
                self.discard_stale_recovery(outcome);
                return;
            }
            let previous = state.level;
            match outcome.verdict {
                RecoveryVerdict::Succeeded => {
                    state.level = HealthLevel::Healthy;
                    state.consecutive_failures = 0;
                    state.recovery_requested = false;
                }
                RecoveryVerdict::Exhausted => state.level = HealthLevel::Critical,
                RecoveryVerdict::AlreadyInFlight => {}
            }
            previous
        };
        let level = if outcome.succeeded() {
            self.alerts
                .resolve_matching(AlertCategory::Health, DEGRADED_ALERT_TITLE);
            self.alerts
                .resolve_matching(AlertCategory::Health, CRITICAL_ALERT_TITLE);
            HealthLevel::Healthy
        } else {
            HealthLevel::Critical
        };
        if previous != level {
            info!(target: "tmd::resilience::health", from = %previous, to = %level, "health level transition after recovery");
            if let Some(metrics) = &self.metrics {
                metrics.record_health_transition(level);
                if outcome.succeeded() {
                    metrics.set_consecutive_failures(0);
                }
            }
        }
    }

    fn discard_stale_recovery(&self, outcome: &RecoveryOutcome) {
        info!(
            target: "tmd::resilience::health",
            verdict = ?outcome.verdict,
            attempts = outcome.attempts,
            "recovery finished after the system recovered; verdict ignored",
        );
        if outcome.verdict == RecoveryVerdict::Exhausted {
            self.alerts
                .resolve_matching(AlertCategory::Recovery, EXHAUSTED_ALERT_TITLE);
            if let Some(metrics) = &self.metrics {
                metrics.set_open_alerts(self.alerts.open_count());
            }
        }
    }
}

struct MonitorRunner {
    shutdown: watch::Sender<bool>,
    task: JoinHandle<()>,
}

/// Runs every registered probe on an interval and owns the system health state.
pub struct HealthMonitor {
    settings: MonitorSettings,
    probes: Vec<Arc<dyn Probe>>,
    core: Arc<HealthCore>,
    recovery: Option<Arc<RecoveryController>>,
    clock: SharedClock,
    started_at: DateTime<Utc>,
    tick_gate: tokio::sync::Mutex<()>,
    recovery_task: Mutex<Option<JoinHandle<RecoveryOutcome>>>,
    runner: Mutex<Option<MonitorRunner>>,
}

impl HealthMonitor {
    /// Monitor `probes`, raising alerts on `alerts`.
    pub fn new(
        settings: MonitorSettings,
        probes: Vec<Arc<dyn Probe>>,
        alerts: Arc<AlertManager>,
    ) -> Self {
        let clock = SystemClock::shared();
        Self {
            settings,
            probes,
            core: Arc::new(HealthCore {
                state: Mutex::new(HealthState {
                    level: HealthLevel::Healthy,
                    consecutive_failures: 0,
                    last_check_at: None,
                    recovery_requested: false,
                }),
                alerts,
                metrics: None,
            }),
            recovery: None,
            started_at: clock.now(),
            clock,
            tick_gate: tokio::sync::Mutex::new(()),
            recovery_task: Mutex::new(None),
            runner: Mutex::new(None),
        }
    }

    /// Trigger `controller` when the failure threshold is crossed.
    pub fn with_recovery(mut self, controller: Arc<RecoveryController>) -> Self {
        self.recovery = Some(controller);
        self
    }

    /// Use `clock` for timestamps and the polling interval.
    pub fn with_clock(mut self, clock: SharedClock) -> Self {
        self.started_at = clock.now();
        self.clock = clock;
        self
    }

    /// Record probe results and transitions on `metrics`.
    pub fn with_metrics(mut self, metrics: ResilienceMetrics) -> Self {
        // Only reachable before the monitor is shared.
        if let Some(core) = Arc::get_mut(&mut self.core) {
            core.metrics = Some(metrics);
        }
        self
    }

    /// Number of registered probes.
    pub fn probe_count(&self) -> usize {
        self.probes.len()
    }

    /// Current health snapshot.
    pub fn system_health(&self) -> SystemHealth {
        let state = self.core.state.lock();
        SystemHealth {
            level: state.level,
            consecutive_failures: state.consecutive_failures,
            last_check_at: state.last_check_at,
            uptime_ms: millis_between(self.started_at, self.clock.now()),
        }
    }

    /// Whether the polling loop is running.
    pub fn is_running(&self) -> bool {
        self.runner
            .lock()
            .as_ref()
            .map_or(false, |runner| !runner.task.is_finished())
    }

    /// Start polling every `interval`, beginning immediately. Returns `false`
    /// when the loop is already running.
    pub fn start(self: &Arc<Self>, interval: Duration) -> bool {
        let mut runner = self.runner.lock();
        if runner.as_ref().map_or(false, |r| !r.task.is_finished()) {
            return false;
        }
        let (shutdown, mut stop) = watch::channel(false);
        let monitor = Arc::clone(self);
        let task = tokio::spawn(async move {
            info!(
                target: "tmd::resilience::health",
                interval_ms = interval.as_millis() as u64,
                probes = monitor.probes.len(),
                "health monitor started",
            );
            loop {
                if *stop.borrow() {
                    break;
                }
                monitor.force_check().await;
                tokio::select! {
                    _ = monitor.clock.sleep(interval) => {}
                    _ = stop.changed() => break,
                }
            }
            info!(target: "tmd::resilience::health", "health monitor stopped");
        });
        *runner = Some(MonitorRunner { shutdown, task });
        true
    }

    /// Stop polling. An in-flight check finishes before this returns.
    pub async fn stop(&self) {
        let runner = self.runner.lock().take();
        if let Some(runner) = runner {
            let _ = runner.shutdown.send(true);
            if let Err(err) = runner.task.await {
                warn!(target: "tmd::resilience::health", error = %err, "health monitor task ended abnormally");
            }
        }
    }

    /// Run one check cycle now.
    pub async fn force_check(&self) -> HealthReport {
        let _gate = self.tick_gate.lock().await;
        let checked_at = self.clock.now();
        let timeout = self.settings.probe_timeout;
        let results: Vec<ProbeResult> = join_all(
            self.probes
                .iter()
                .map(|probe| run_probe(Arc::clone(probe), timeout, self.clock.as_ref())),
        )
        .await;
        let failed = results.iter().filter(|result| !result.passed).count();
        let passed = results.len() - failed;

        if let Some(metrics) = &self.core.metrics {
            for result in &results {
                metrics.record_probe(result);
            }
        }
        self.update_probe_alerts(&results);

        let effects = self.apply_cycle(failed, self.clock.now());
        let recovery_triggered = effects.request_recovery && self.spawn_recovery();
        self.announce(&effects, failed, results.len());

        if let Some(metrics) = &self.core.metrics {
            metrics.set_consecutive_failures(effects.consecutive_failures);
            metrics.set_open_alerts(self.core.alerts.open_count());
        }

        HealthReport {
            checked_at,
            level: effects.level,
            consecutive_failures: effects.consecutive_failures,
            passed,
            failed,
            duration_ms: millis_between(checked_at, self.clock.now()),
            results,
            recovery_triggered,
        }
    }

    /// Wait for the current recovery episode, if one was spawned and not yet awaited.
    pub async fn await_recovery(&self) -> Option<RecoveryOutcome> {
        let task = self.recovery_task.lock().take()?;
        match task.await {
            Ok(outcome) => Some(outcome),
            Err(err) => {
                warn!(target: "tmd::resilience::health", error = %err, "recovery task ended abnormally");
                None
            }
        }
    }

    fn update_probe_alerts(&self, results: &[ProbeResult]) {
        let alerts = &self.core.alerts;
        for result in results {
            let title = probe_alert_title(&result.probe);
            if result.passed {
                alerts.resolve_matching(AlertCategory::Health, &title);
            } else {
                alerts.raise(
                    NewAlert::new(
                        AlertCategory::Health,
                        AlertSeverity::Medium,
                        title,
                        result.message.clone(),
                    )
                    .source(result.probe.clone())
                    .related(json!({
                        "probe": result.probe,
                        "failure": result.failure,
                        "duration_ms": result.duration_ms,
                        "detail": result.detail,
                    })),
                );
            }
        }
    }

    fn apply_cycle(&self, failed: usize, now: DateTime<Utc>) -> CycleEffects {
        let threshold = self.settings.failure_threshold;
        let mut state = self.core.state.lock();
        let previous = state.level;
        state.last_check_at = Some(now);

        if failed == 0 {
            state.consecutive_failures = 0;
            state.level = HealthLevel::Healthy;
            state.recovery_requested = false;
            return CycleEffects {
                previous,
                level: HealthLevel::Healthy,
                consecutive_failures: 0,
                escalation: None,
                request_recovery: false,
            };
        }

        state.consecutive_failures = state.consecutive_failures.saturating_add(1);
        let count = state.consecutive_failures;
        let mut escalation = None;
        let mut request_recovery = false;
        if count >= threshold {
            if state.level == HealthLevel::Healthy {
                state.level = HealthLevel::Degraded;
            }
            escalation = Some(if count >= threshold.saturating_mul(2) {
                AlertSeverity::Critical
            } else {
                AlertSeverity::High
            });
            if !state.recovery_requested && self.settings.auto_recovery && self.recovery.is_some() {
                state.recovery_requested = true;
                request_recovery = true;
            }
        }
        CycleEffects {
            previous,
            level: state.level,
            consecutive_failures: count,
            escalation,
            request_recovery,
        }
    }

    fn announce(&self, effects: &CycleEffects, failed: usize, total: usize) {
        let alerts = &self.core.alerts;
        if effects.previous != effects.level {
            info!(
                target: "tmd::resilience::health",
                from = %effects.previous,
                to = %effects.level,
                consecutive_failures = effects.consecutive_failures,
                "health level transition",
            );
            if let Some(metrics) = &self.core.metrics {
                metrics.record_health_transition(effects.level);
            }
        }

        match effects.escalation {
            Some(severity) => {
                let title = if severity == AlertSeverity::Critical {
                    CRITICAL_ALERT_TITLE
                } else {
                    DEGRADED_ALERT_TITLE
                };
                alerts.raise(
                    NewAlert::new(
                        AlertCategory::Health,
                        severity,
                        title,
                        format!(
                            "{failed} of {total} probe(s) failing; {} consecutive failing check(s)",
                            effects.consecutive_failures
                        ),
                    )
                    .source("health-monitor")
                    .related(json!({
                        "consecutive_failures": effects.consecutive_failures,
                        "threshold": self.settings.failure_threshold,
                    })),
                );
            }
            None if failed > 0 => debug!(
                target: "tmd::resilience::health",
                failed,
                consecutive_failures = effects.consecutive_failures,
                "check failed below threshold",
            ),
            None => {}
        }

        if failed == 0 && effects.previous != HealthLevel::Healthy {
            alerts.resolve_matching(AlertCategory::Health, DEGRADED_ALERT_TITLE);
            alerts.resolve_matching(AlertCategory::Health, CRITICAL_ALERT_TITLE);
            alerts.resolve_matching(AlertCategory::Recovery, EXHAUSTED_ALERT_TITLE);
            alerts.raise(
                NewAlert::new(
                    AlertCategory::Health,
                    AlertSeverity::Low,
                    RECOVERED_ALERT_TITLE,
                    format!("all {total} probe(s) passing; previously {}", effects.previous),
                )
                .source("health-monitor"),
            );
        }
    }

    /// Spawn the recovery controller unless an episode is still running.
    fn spawn_recovery(&self) -> bool {
        let Some(controller) = self.recovery.clone() else {
            return false;
        };
        let mut slot = self.recovery_task.lock();
        if slot.as_ref().map_or(false, |task| !task.is_finished()) {
            return false;
        }
        let core = Arc::clone(&self.core);
        warn!(target: "tmd::resilience::health", "failure threshold reached; starting auto-recovery");
        *slot = Some(tokio::spawn(async move {
            let outcome = controller.attempt_recovery().await;
            core.apply_recovery(&outcome);
            outcome
        }));
        true
    }
}

impl fmt::Debug for HealthMonitor {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.debug_struct("HealthMonitor")
            .field("settings", &self.settings)
            .field("probes", &self.probes.len())
            .field("state", &*self.core.state.lock())
            .finish_non_exhaustive()
    }
}

/// Coalescing title of the per-probe failure alert.
pub fn probe_alert_title(probe: &str) -> String {
    format!("Probe '{probe}' failing")
}
