//! ---
//! tmd_section: "07-resilience-fault-tolerance"
//! tmd_subsection: "module"
//! tmd_type: "source"
//! tmd_scope: "code"
//! tmd_description: "Health monitoring, alerting, auto-recovery, and gated release workflows."
//! tmd_version: "v0.1.0"
//! tmd_owner: "tbd"
//! ---
#![warn(missing_docs)]
//! Operational core of the ticket-metrics dashboard guard.
//!
//! [`HealthMonitor`] polls [`Probe`]s and feeds the [`AlertManager`]; once
//! failures cross the threshold it hands off to the [`RecoveryController`],
//! which re-runs a [`WorkflowPlan`] on the [`WorkflowEngine`] with backoff.
//! [`GuardService`] wires everything from a `GuardConfig`.

pub mod alerts;
pub mod health;
pub mod metrics;
pub mod probe;
pub mod recovery;
pub mod retry;
pub mod service;
pub mod workflow;

pub use alerts::{
    Alert, AlertCategory, AlertFilter, AlertManager, AlertSeverity, AlertSubscriber,
    LoggingSubscriber, NewAlert,
};
pub use health::{HealthLevel, HealthMonitor, HealthReport, MonitorSettings, SystemHealth};
pub use metrics::ResilienceMetrics;
pub use probe::{run_probe, FnProbe, Probe, ProbeFailure, ProbeOutcome, ProbeResult};
pub use recovery::{RecoveryController, RecoveryOutcome, RecoveryPhase, RecoveryVerdict};
pub use retry::{retry_with_backoff, RetryPolicy, RetryReport};
pub use service::{CompleteCheckReport, GuardService, GuardServiceBuilder};
pub use workflow::{
    EngineSettings, ExecutionStatus, ExecutionTrigger, FnValidator, QualityGate, QualityVerdict,
    StepCheck, StepDefinition, StepEvent, StepStatus, Validator, ValidationOutcome,
    WorkflowEngine, WorkflowError, WorkflowExecution, WorkflowPlan, WorkflowStep,
};

/// Crate prelude collecting the most commonly used types.
pub mod prelude {
    pub use super::alerts::{AlertCategory, AlertFilter, AlertManager, AlertSeverity, NewAlert};
    pub use super::health::{HealthLevel, HealthMonitor, MonitorSettings};
    pub use super::probe::{FnProbe, Probe, ProbeOutcome};
    pub use super::recovery::RecoveryController;
    pub use super::retry::RetryPolicy;
    pub use super::service::GuardService;
    pub use super::workflow::{
        StepCheck, StepDefinition, ValidationOutcome, WorkflowEngine, WorkflowPlan,
    };
}
