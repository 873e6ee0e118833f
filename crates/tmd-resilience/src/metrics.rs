//! ---
//! tmd_section: "07-resilience-fault-tolerance"
//! tmd_subsection: "module"
//! tmd_type: "source"
//! tmd_scope: "code"
//! tmd_description: "Prometheus instrumentation for probes, alerts, recovery, and workflows."
//! tmd_version: "v0.1.0"
//! tmd_owner: "tbd"
//! ---
use anyhow::Result;
use prometheus::{self, Histogram, HistogramOpts, HistogramVec, IntCounterVec, IntGauge, Opts};
use tmd_metrics::SharedRegistry;

use crate::alerts::Alert;
use crate::health::HealthLevel;
use crate::probe::{ProbeFailure, ProbeResult};
use crate::workflow::WorkflowExecution;

/// Metrics published by the guard core.
#[derive(Clone)]
pub struct ResilienceMetrics {
    registry: SharedRegistry,
    probe_runs_total: IntCounterVec,
    probe_duration_seconds: HistogramVec,
    alerts_total: IntCounterVec,
    open_alerts: IntGauge,
    health_transitions_total: IntCounterVec,
    consecutive_failures: IntGauge,
    recovery_attempts_total: IntCounterVec,
    step_outcomes_total: IntCounterVec,
    executions_total: IntCounterVec,
    quality_score: Histogram,
}

impl ResilienceMetrics {
    /// Register the metric family against the provided registry.
    pub fn new(registry: SharedRegistry) -> Result<Self> {
        let probe_runs_total = IntCounterVec::new(
            Opts::new("tmd_probe_runs_total", "Probe invocations by outcome"),
            &["probe", "outcome"],
        )?;
        registry.register(Box::new(probe_runs_total.clone()))?;

        let probe_duration_seconds = HistogramVec::new(
            HistogramOpts::new(
                "tmd_probe_duration_seconds",
                "Wall-clock duration of individual probe invocations",
            )
            .buckets(prometheus::exponential_buckets(0.001, 2.0, 16)?),
            &["probe"],
        )?;
        registry.register(Box::new(probe_duration_seconds.clone()))?;

        let alerts_total = IntCounterVec::new(
            Opts::new(
                "tmd_alerts_raised_total",
                "Alerts raised, including coalesced repeats",
            ),
            &["category", "severity", "coalesced"],
        )?;
        registry.register(Box::new(alerts_total.clone()))?;

        let open_alerts = IntGauge::with_opts(Opts::new(
            "tmd_alerts_open",
            "Unresolved alerts at the end of the last health check",
        ))?;
        registry.register(Box::new(open_alerts.clone()))?;

        let health_transitions_total = IntCounterVec::new(
            Opts::new(
                "tmd_health_transitions_total",
                "Count of system health level transitions",
            ),
            &["level"],
        )?;
        registry.register(Box::new(health_transitions_total.clone()))?;

        let consecutive_failures = IntGauge::with_opts(Opts::new(
            "tmd_health_consecutive_failures",
            "Consecutive health checks with at least one failed probe",
        ))?;
        registry.register(Box::new(consecutive_failures.clone()))?;

        let recovery_attempts_total = IntCounterVec::new(
            Opts::new(
                "tmd_recovery_attempts_total",
                "Workflow runs performed by the auto-recovery controller",
            ),
            &["outcome"],
        )?;
        registry.register(Box::new(recovery_attempts_total.clone()))?;

        let step_outcomes_total = IntCounterVec::new(
            Opts::new(
                "tmd_workflow_step_outcomes_total",
                "Terminal status of workflow steps",
            ),
            &["step", "status"],
        )?;
        registry.register(Box::new(step_outcomes_total.clone()))?;

        let executions_total = IntCounterVec::new(
            Opts::new(
                "tmd_workflow_executions_total",
                "Workflow executions by trigger and approval",
            ),
            &["trigger", "approved"],
        )?;
        registry.register(Box::new(executions_total.clone()))?;

        let quality_score = Histogram::with_opts(
            HistogramOpts::new(
                "tmd_workflow_quality_score",
                "Quality score computed for each finished execution",
            )
            .buckets(prometheus::linear_buckets(0.0, 10.0, 11)?),
        )?;
        registry.register(Box::new(quality_score.clone()))?;

        Ok(Self {
            registry,
            probe_runs_total,
            probe_duration_seconds,
            alerts_total,
            open_alerts,
            health_transitions_total,
            consecutive_failures,
            recovery_attempts_total,
            step_outcomes_total,
            executions_total,
            quality_score,
        })
    }

    /// Expose the underlying shared registry for convenience.
    pub fn registry(&self) -> SharedRegistry {
        self.registry.clone()
    }

    /// Record a probe invocation.
    pub fn record_probe(&self, result: &ProbeResult) {
        let outcome = match result.failure {
            None => "pass",
            Some(ProbeFailure::Reported) => "fail",
            Some(ProbeFailure::Timeout) => "timeout",
            Some(ProbeFailure::Error) => "error",
        };
        self.probe_runs_total
            .with_label_values(&[result.probe.as_str(), outcome])
            .inc();
        self.probe_duration_seconds
            .with_label_values(&[result.probe.as_str()])
            .observe(result.duration_ms as f64 / 1_000.0);
    }

    /// Record a raised alert.
    pub fn record_alert(&self, alert: &Alert, coalesced: bool) {
        self.alerts_total
            .with_label_values(&[
                alert.category.as_str(),
                alert.severity.as_str(),
                if coalesced { "true" } else { "false" },
            ])
            .inc();
    }

    /// Publish the number of unresolved alerts.
    pub fn set_open_alerts(&self, open: usize) {
        self.open_alerts.set(open as i64);
    }

    /// Track a transition into a new health level.
    pub fn record_health_transition(&self, level: HealthLevel) {
        self.health_transitions_total
            .with_label_values(&[level.as_str()])
            .inc();
    }

    /// Publish the current consecutive failure counter.
    pub fn set_consecutive_failures(&self, count: u32) {
        self.consecutive_failures.set(i64::from(count));
    }

    /// Record one recovery workflow run.
    pub fn record_recovery_attempt(&self, approved: bool) {
        let outcome = if approved { "success" } else { "failure" };
        self.recovery_attempts_total
            .with_label_values(&[outcome])
            .inc();
    }

    /// Record the terminal state of every step plus the execution verdict.
    pub fn record_execution(&self, execution: &WorkflowExecution) {
        for step in &execution.steps {
            if step.status.is_terminal() {
                self.step_outcomes_total
                    .with_label_values(&[step.id.as_str(), step.status.as_str()])
                    .inc();
            }
        }
        self.executions_total
            .with_label_values(&[
                execution.trigger.as_str(),
                if execution.approved { "true" } else { "false" },
            ])
            .inc();
        if let Some(score) = execution.quality_score {
            self.quality_score.observe(score);
        }
    }
}

impl std::fmt::Debug for ResilienceMetrics {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.debug_struct("ResilienceMetrics").finish_non_exhaustive()
    }
}
