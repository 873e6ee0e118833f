//! ---
//! tmd_section: "07-resilience-fault-tolerance"
//! tmd_subsection: "module"
//! tmd_type: "source"
//! tmd_scope: "code"
//! tmd_description: "Bounded auto-recovery driven by the release workflow."
//! tmd_version: "v0.1.0"
//! tmd_owner: "tbd"
//! ---
use std::fmt;
use std::sync::atomic::{AtomicBool, Ordering};
use std::sync::Arc;
use std::time::Duration;

use parking_lot::Mutex;
use serde::{Deserialize, Serialize};
use serde_json::json;
use tmd_common::time::{SharedClock, SystemClock};
use tracing::{error, info, warn};
use uuid::Uuid;

use crate::alerts::{AlertCategory, AlertManager, AlertSeverity, NewAlert};
use crate::metrics::ResilienceMetrics;
use crate::retry::{retry_with_backoff, RetryPolicy};
use crate::workflow::{ExecutionTrigger, WorkflowEngine, WorkflowPlan};

/// Title of the single alert raised when the attempt budget is spent.
pub const EXHAUSTED_ALERT_TITLE: &str = "Auto-recovery exhausted";
/// Title of the informational alert raised after a successful recovery.
pub const SUCCEEDED_ALERT_TITLE: &str = "Auto-recovery succeeded";

/// Where the controller is in its lifecycle.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "lowercase")]
pub enum RecoveryPhase {
    /// No recovery has run yet.
    Idle,
    /// Workflow runs are in progress.
    Attempting,
    /// The last episode ended with an approved run.
    Succeeded,
    /// The last episode spent its budget.
    Exhausted,
}

/// How an [`RecoveryController::attempt_recovery`] call ended.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "snake_case")]
pub enum RecoveryVerdict {
    /// A recovery run was approved.
    Succeeded,
    /// Every attempt failed.
    Exhausted,
    /// Another attempt was already running; nothing was done.
    AlreadyInFlight,
}

/// Result of one recovery episode.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct RecoveryOutcome {
    /// Final verdict.
    pub verdict: RecoveryVerdict,
    /// Workflow runs performed.
    pub attempts: u32,
    /// Backoff delays slept between runs.
    pub delays: Vec<Duration>,
    /// Ids of the executions started, in order.
    pub executions: Vec<Uuid>,
}

impl RecoveryOutcome {
    /// Whether the system recovered.
    pub fn succeeded(&self) -> bool {
        self.verdict == RecoveryVerdict::Succeeded
    }

    fn already_in_flight() -> Self {
        Self {
            verdict: RecoveryVerdict::AlreadyInFlight,
            attempts: 0,
            delays: Vec::new(),
            executions: Vec::new(),
        }
    }
}

struct InFlight<'a>(&'a AtomicBool);

impl Drop for InFlight<'_> {
    fn drop(&mut self) {
        self.0.store(false, Ordering::Release);
    }
}

/// Re-runs the recovery plan with exponential backoff until it is approved.
pub struct RecoveryController {
    engine: Arc<WorkflowEngine>,
    plan: Arc<WorkflowPlan>,
    policy: RetryPolicy,
    alerts: Arc<AlertManager>,
    clock: SharedClock,
    metrics: Option<ResilienceMetrics>,
    phase: Mutex<RecoveryPhase>,
    in_flight: AtomicBool,
}

impl RecoveryController {
    /// Create a controller running `plan` on `engine`.
    pub fn new(
        engine: Arc<WorkflowEngine>,
        plan: Arc<WorkflowPlan>,
        policy: RetryPolicy,
        alerts: Arc<AlertManager>,
    ) -> Self {
        Self {
            engine,
            plan,
            policy,
            alerts,
            clock: SystemClock::shared(),
            metrics: None,
            phase: Mutex::new(RecoveryPhase::Idle),
            in_flight: AtomicBool::new(false),
        }
    }

    /// Use `clock` for backoff sleeps.
    pub fn with_clock(mut self, clock: SharedClock) -> Self {
        self.clock = clock;
        self
    }

    /// Record attempts on `metrics`.
    pub fn with_metrics(mut self, metrics: ResilienceMetrics) -> Self {
        self.metrics = Some(metrics);
        self
    }

    /// Current phase.
    pub fn phase(&self) -> RecoveryPhase {
        *self.phase.lock()
    }

    /// Whether an episode is running.
    pub fn is_in_flight(&self) -> bool {
        self.in_flight.load(Ordering::Acquire)
    }

    /// Run one recovery episode. Concurrent calls return
    /// [`RecoveryVerdict::AlreadyInFlight`] without doing anything.
    pub async fn attempt_recovery(&self) -> RecoveryOutcome {
        if self
            .in_flight
            .compare_exchange(false, true, Ordering::AcqRel, Ordering::Acquire)
            .is_err()
        {
            info!(target: "tmd::resilience::recovery", "recovery already in flight; ignoring signal");
            return RecoveryOutcome::already_in_flight();
        }
        let _in_flight = InFlight(&self.in_flight);
        *self.phase.lock() = RecoveryPhase::Attempting;

        let executions = Mutex::new(Vec::new());
        let report = retry_with_backoff(&self.policy, self.clock.as_ref(), |attempt| {
            let executions = &executions;
            async move {
                info!(
                    target: "tmd::resilience::recovery",
                    attempt,
                    max_attempts = self.policy.max_attempts,
                    plan = self.plan.name(),
                    "starting recovery attempt",
                );
                let execution = self
                    .engine
                    .execute_with_trigger(&self.plan, ExecutionTrigger::Recovery)
                    .await;
                executions.lock().push(execution.id);
                if let Some(metrics) = &self.metrics {
                    metrics.record_recovery_attempt(execution.approved);
                }
                if execution.approved {
                    Ok(execution.id)
                } else {
                    warn!(
                        target: "tmd::resilience::recovery",
                        attempt,
                        execution = %execution.id,
                        score = execution.quality_score.unwrap_or_default(),
                        "recovery attempt not approved",
                    );
                    Err(execution.id)
                }
            }
        })
        .await;

        let outcome = RecoveryOutcome {
            verdict: if report.result.is_ok() {
                RecoveryVerdict::Succeeded
            } else {
                RecoveryVerdict::Exhausted
            },
            attempts: report.attempts,
            delays: report.delays,
            executions: executions.into_inner(),
        };

        match report.result {
            Ok(execution) => {
                *self.phase.lock() = RecoveryPhase::Succeeded;
                info!(
                    target: "tmd::resilience::recovery",
                    attempts = outcome.attempts,
                    execution = %execution,
                    "auto-recovery succeeded",
                );
                self.alerts
                    .resolve_matching(AlertCategory::Recovery, EXHAUSTED_ALERT_TITLE);
                self.alerts.raise(
                    NewAlert::new(
                        AlertCategory::Recovery,
                        AlertSeverity::Low,
                        SUCCEEDED_ALERT_TITLE,
                        format!(
                            "recovery workflow '{}' approved after {} attempt(s)",
                            self.plan.name(),
                            outcome.attempts
                        ),
                    )
                    .source("auto-recovery")
                    .related(json!({ "execution_id": execution, "attempts": outcome.attempts })),
                );
            }
            Err(last) => {
                *self.phase.lock() = RecoveryPhase::Exhausted;
                error!(
                    target: "tmd::resilience::recovery",
                    attempts = outcome.attempts,
                    last_execution = %last,
                    "auto-recovery exhausted; manual intervention required",
                );
                self.alerts.raise(
                    NewAlert::new(
                        AlertCategory::Recovery,
                        AlertSeverity::Critical,
                        EXHAUSTED_ALERT_TITLE,
                        format!(
                            "recovery workflow '{}' was not approved after {} attempt(s); manual intervention required",
                            self.plan.name(),
                            outcome.attempts
                        ),
                    )
                    .source("auto-recovery")
                    .related(json!({
                        "attempts": outcome.attempts,
                        "executions": outcome.executions,
                    })),
                );
            }
        }
        outcome
    }
}

impl fmt::Debug for RecoveryController {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.debug_struct("RecoveryController")
            .field("plan", &self.plan.name())
            .field("policy", &self.policy)
            .field("phase", &self.phase())
            .finish_non_exhaustive()
    }
}
