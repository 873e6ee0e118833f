//! ---
//! tmd_section: "07-resilience-fault-tolerance"
//! tmd_subsection: "module"
//! tmd_type: "source"
//! tmd_scope: "code"
//! tmd_description: "Facade wiring alerts, monitor, recovery, and workflows together."
//! tmd_version: "v0.1.0"
//! tmd_owner: "tbd"
//! ---
use std::sync::Arc;

use chrono::{DateTime, Utc};
use serde::{Deserialize, Serialize};
use tmd_common::config::{ConfigError, GuardConfig};
use tmd_common::time::{SharedClock, SystemClock};
use tracing::info;
use uuid::Uuid;

use crate::alerts::{Alert, AlertFilter, AlertManager, AlertSubscriber, LoggingSubscriber};
use crate::health::{HealthLevel, HealthMonitor, HealthReport, MonitorSettings, SystemHealth};
use crate::metrics::ResilienceMetrics;
use crate::probe::Probe;
use crate::recovery::{RecoveryController, RecoveryOutcome};
use crate::retry::RetryPolicy;
use crate::workflow::{
    EngineSettings, ExecutionTrigger, StepEvent, WorkflowEngine, WorkflowExecution, WorkflowPlan,
};

/// Outcome of [`GuardService::run_complete_check`].
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct CompleteCheckReport {
    /// When the check started.
    pub checked_at: DateTime<Utc>,
    /// Health cycle run as part of the check.
    pub health: HealthReport,
    /// Release workflow run as part of the check.
    pub execution: WorkflowExecution,
    /// Unresolved alerts after both ran.
    pub open_alerts: Vec<Alert>,
    /// Release approved and system not critical.
    pub safe_to_ship: bool,
}

/// Builder for [`GuardService`].
pub struct GuardServiceBuilder {
    config: GuardConfig,
    probes: Vec<Arc<dyn Probe>>,
    plan: Option<WorkflowPlan>,
    recovery_plan: Option<WorkflowPlan>,
    clock: SharedClock,
    metrics: Option<ResilienceMetrics>,
    subscribers: Vec<Arc<dyn AlertSubscriber>>,
}

impl GuardServiceBuilder {
    /// Probe polled by the health monitor.
    pub fn probe(mut self, probe: Arc<dyn Probe>) -> Self {
        self.probes.push(probe);
        self
    }

    /// Probes polled by the health monitor.
    pub fn probes<I>(mut self, probes: I) -> Self
    where
        I: IntoIterator<Item = Arc<dyn Probe>>,
    {
        self.probes.extend(probes);
        self
    }

    /// Release plan run by complete checks and, unless overridden, by recovery.
    pub fn plan(mut self, plan: WorkflowPlan) -> Self {
        self.plan = Some(plan);
        self
    }

    /// Dedicated plan for auto-recovery.
    pub fn recovery_plan(mut self, plan: WorkflowPlan) -> Self {
        self.recovery_plan = Some(plan);
        self
    }

    /// Inject a clock.
    pub fn clock(mut self, clock: SharedClock) -> Self {
        self.clock = clock;
        self
    }

    /// Record metrics.
    pub fn metrics(mut self, metrics: ResilienceMetrics) -> Self {
        self.metrics = Some(metrics);
        self
    }

    /// Additional alert subscriber.
    pub fn subscriber(mut self, subscriber: Arc<dyn AlertSubscriber>) -> Self {
        self.subscribers.push(subscriber);
        self
    }

    /// Validate the configuration and wire every component.
    pub fn build(self) -> Result<GuardService, ConfigError> {
        self.config.validate()?;
        let config = self.config;
        let clock = self.clock;

        let mut alerts = AlertManager::new(config.alert_capacity, config.alert_coalesce_window)
            .with_clock(clock.clone());
        if let Some(metrics) = &self.metrics {
            alerts = alerts.with_metrics(metrics.clone());
        }
        let alerts = Arc::new(alerts);
        alerts.subscribe(Arc::new(LoggingSubscriber));
        for subscriber in self.subscribers {
            alerts.subscribe(subscriber);
        }

        let mut engine = WorkflowEngine::new(EngineSettings::from_config(&config), alerts.clone())
            .with_clock(clock.clone());
        if let Some(metrics) = &self.metrics {
            engine = engine.with_metrics(metrics.clone());
        }
        let engine = Arc::new(engine);

        let plan = Arc::new(
            self.plan
                .unwrap_or_else(|| WorkflowPlan::empty("release")),
        );

        let recovery = config.auto_recovery.then(|| {
            let recovery_plan = self
                .recovery_plan
                .map(Arc::new)
                .unwrap_or_else(|| plan.clone());
            let mut controller = RecoveryController::new(
                engine.clone(),
                recovery_plan,
                RetryPolicy::from(config.recovery_retry),
                alerts.clone(),
            )
            .with_clock(clock.clone());
            if let Some(metrics) = &self.metrics {
                controller = controller.with_metrics(metrics.clone());
            }
            Arc::new(controller)
        });

        let mut monitor = HealthMonitor::new(
            MonitorSettings::from_config(&config),
            self.probes,
            alerts.clone(),
        )
        .with_clock(clock.clone());
        if let Some(controller) = &recovery {
            monitor = monitor.with_recovery(controller.clone());
        }
        if let Some(metrics) = self.metrics {
            monitor = monitor.with_metrics(metrics);
        }

        Ok(GuardService {
            config,
            alerts,
            engine,
            monitor: Arc::new(monitor),
            recovery,
            plan,
            clock,
        })
    }
}

/// Single entry point owning every guard component.
#[derive(Debug)]
pub struct GuardService {
    config: GuardConfig,
    alerts: Arc<AlertManager>,
    engine: Arc<WorkflowEngine>,
    monitor: Arc<HealthMonitor>,
    recovery: Option<Arc<RecoveryController>>,
    plan: Arc<WorkflowPlan>,
    clock: SharedClock,
}

impl GuardService {
    /// Start building a service from `config`.
    pub fn builder(config: GuardConfig) -> GuardServiceBuilder {
        GuardServiceBuilder {
            config,
            probes: Vec::new(),
            plan: None,
            recovery_plan: None,
            clock: SystemClock::shared(),
            metrics: None,
            subscribers: Vec::new(),
        }
    }

    /// Active configuration.
    pub fn config(&self) -> &GuardConfig {
        &self.config
    }

    /// Start the polling loop at the configured interval.
    pub fn start(&self) -> bool {
        info!(
            target: "tmd::resilience::service",
            poll_interval_ms = self.config.poll_interval.as_millis() as u64,
            probes = self.monitor.probe_count(),
            plan = self.plan.name(),
            "guard service starting",
        );
        self.monitor.start(self.config.poll_interval)
    }

    /// Stop polling and wait for any running recovery episode.
    pub async fn stop(&self) -> Option<RecoveryOutcome> {
        self.monitor.stop().await;
        let outcome = self.monitor.await_recovery().await;
        info!(target: "tmd::resilience::service", "guard service stopped");
        outcome
    }

    /// Alerts, optionally filtered.
    pub fn alerts(&self, filter: Option<&AlertFilter>) -> Vec<Alert> {
        self.alerts.list(filter)
    }

    /// Resolve an alert by id.
    pub fn resolve_alert(&self, id: Uuid) -> bool {
        self.alerts.resolve(id)
    }

    /// Current system health.
    pub fn system_health(&self) -> SystemHealth {
        self.monitor.system_health()
    }

    /// Finished executions, oldest first.
    pub fn execution_history(&self) -> Vec<WorkflowExecution> {
        self.engine.history()
    }

    /// Step events for executions started after this call.
    pub fn subscribe_events(&self) -> tokio::sync::broadcast::Receiver<StepEvent> {
        self.engine.subscribe_events()
    }

    /// Run one health cycle immediately.
    pub async fn force_check(&self) -> HealthReport {
        self.monitor.force_check().await
    }

    /// Run the release plan as a manual execution.
    pub async fn execute_release(&self) -> WorkflowExecution {
        self.engine
            .execute_with_trigger(&self.plan, ExecutionTrigger::Manual)
            .await
    }

    /// Run a health cycle followed by the release plan and report whether it is safe to ship.
    pub async fn run_complete_check(&self) -> CompleteCheckReport {
        let checked_at = self.clock.now();
        let health = self.monitor.force_check().await;
        let execution = self
            .engine
            .execute_with_trigger(&self.plan, ExecutionTrigger::CompleteCheck)
            .await;
        let level = self.monitor.system_health().level;
        let safe_to_ship = execution.approved && level != HealthLevel::Critical;
        info!(
            target: "tmd::resilience::service",
            execution = %execution.id,
            approved = execution.approved,
            health = %level,
            safe_to_ship,
            "complete check finished",
        );
        CompleteCheckReport {
            checked_at,
            health,
            execution,
            open_alerts: self.alerts.list(Some(&AlertFilter::open())),
            safe_to_ship,
        }
    }

    /// Wait for a recovery episode triggered by the monitor.
    pub async fn await_recovery(&self) -> Option<RecoveryOutcome> {
        self.monitor.await_recovery().await
    }

    /// Shared alert manager.
    pub fn alert_manager(&self) -> Arc<AlertManager> {
        self.alerts.clone()
    }

    /// Shared workflow engine.
    pub fn engine(&self) -> Arc<WorkflowEngine> {
        self.engine.clone()
    }

    /// Auto-recovery controller, when enabled.
    pub fn recovery(&self) -> Option<Arc<RecoveryController>> {
        self.recovery.clone()
    }
}
