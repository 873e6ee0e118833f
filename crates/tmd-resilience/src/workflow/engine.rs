//! ---
//! tmd_section: "07-resilience-fault-tolerance"
//! tmd_subsection: "module"
//! tmd_type: "source"
//! tmd_scope: "code"
//! tmd_description: "Dependency-ordered workflow execution with retry and quality gating."
//! tmd_version: "v0.1.0"
//! tmd_owner: "tbd"
//! ---
use std::collections::{HashMap, VecDeque};
use std::fmt;
use std::panic::AssertUnwindSafe;
use std::sync::Arc;
use std::time::Duration;

use chrono::{DateTime, Utc};
use futures::stream::{FuturesUnordered, StreamExt};
use futures::FutureExt;
use parking_lot::Mutex;
use serde::{Deserialize, Serialize};
use serde_json::{json, Value};
use tmd_common::config::GuardConfig;
use tmd_common::time::{millis_between, SharedClock, SystemClock};
use tokio::sync::broadcast;
use tracing::{debug, info, warn};
use uuid::Uuid;

use super::plan::WorkflowPlan;
use super::quality::QualityGate;
use super::step::{StepDefinition, StepStatus, WorkflowStep};
use crate::alerts::{AlertCategory, AlertManager, AlertSeverity, NewAlert};
use crate::metrics::ResilienceMetrics;
use crate::probe::panic_message;
use crate::retry::{retry_with_backoff, RetryPolicy};

const EVENT_CHANNEL_CAPACITY: usize = 256;

/// Status of a whole execution.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "lowercase")]
pub enum ExecutionStatus {
    /// Steps are still being scheduled.
    Running,
    /// Finished and approved.
    Completed,
    /// Finished without approval.
    Failed,
    /// Reserved for externally cancelled runs; the engine never produces it.
    Cancelled,
}

impl ExecutionStatus {
    /// Static label for payloads.
    pub fn as_str(&self) -> &'static str {
        match self {
            ExecutionStatus::Running => "running",
            ExecutionStatus::Completed => "completed",
            ExecutionStatus::Failed => "failed",
            ExecutionStatus::Cancelled => "cancelled",
        }
    }
}

/// Why an execution was started.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, Serialize, Deserialize)]
#[serde(rename_all = "camelCase")]
pub enum ExecutionTrigger {
    /// Invoked directly by a caller.
    Manual,
    /// Invoked by the auto-recovery controller.
    Recovery,
    /// Invoked as part of a complete system check.
    CompleteCheck,
}

impl ExecutionTrigger {
    /// Static label for metrics and payloads.
    pub fn as_str(&self) -> &'static str {
        match self {
            ExecutionTrigger::Manual => "manual",
            ExecutionTrigger::Recovery => "recovery",
            ExecutionTrigger::CompleteCheck => "completeCheck",
        }
    }
}

impl fmt::Display for ExecutionTrigger {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.write_str(self.as_str())
    }
}

/// Record of one run of a plan. Never mutated once terminal.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct WorkflowExecution {
    /// Unique id.
    pub id: Uuid,
    /// Name of the executed plan.
    pub plan: String,
    /// What started the run.
    pub trigger: ExecutionTrigger,
    /// Final state of every step, in plan order.
    pub steps: Vec<WorkflowStep>,
    /// Terminal status.
    pub status: ExecutionStatus,
    /// Start time.
    pub started_at: DateTime<Utc>,
    /// End time.
    pub ended_at: Option<DateTime<Utc>>,
    /// Score computed by the quality gate.
    pub quality_score: Option<f64>,
    /// Whether the release is safe to ship.
    pub approved: bool,
}

impl WorkflowExecution {
    /// Look up a step by id.
    pub fn step(&self, id: &str) -> Option<&WorkflowStep> {
        self.steps.iter().find(|step| step.id == id)
    }

    /// Ids of steps that ended in `status`.
    pub fn steps_with_status(&self, status: StepStatus) -> Vec<&str> {
        self.steps
            .iter()
            .filter(|step| step.status == status)
            .map(|step| step.id.as_str())
            .collect()
    }

    /// Wall-clock duration, once finished.
    pub fn duration_ms(&self) -> Option<u64> {
        self.ended_at
            .map(|ended| millis_between(self.started_at, ended))
    }
}

/// Step status change published while an execution runs.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct StepEvent {
    /// Execution the step belongs to.
    pub execution_id: Uuid,
    /// Step id.
    pub step_id: String,
    /// Status entered. Retries republish `running` with a higher attempt.
    pub status: StepStatus,
    /// Attempt number, 0 for steps that never ran.
    pub attempt: u32,
    /// Failure or skip reason.
    pub message: Option<String>,
    /// Event time.
    pub at: DateTime<Utc>,
}

/// Tunables for [`WorkflowEngine`].
#[derive(Debug, Clone)]
pub struct EngineSettings {
    /// Bound on a single check invocation.
    pub step_timeout: Duration,
    /// Backoff between step retries; `max_attempts - 1` is the default retry budget.
    pub step_retry: RetryPolicy,
    /// Stop scheduling new steps after a required failure.
    pub halt_on_required_failure: bool,
    /// Scoring and approval thresholds.
    pub quality_gate: QualityGate,
    /// Executions kept in history.
    pub history_capacity: usize,
}

impl EngineSettings {
    /// Derive settings from the guard configuration.
    pub fn from_config(config: &GuardConfig) -> Self {
        Self {
            step_timeout: config.step_timeout,
            step_retry: RetryPolicy::from(config.step_retry),
            halt_on_required_failure: config.halt_on_required_failure,
            quality_gate: QualityGate::new(config.quality_gate),
            history_capacity: config.execution_history_capacity,
        }
    }
}

impl Default for EngineSettings {
    fn default() -> Self {
        Self::from_config(&GuardConfig::default())
    }
}

struct StepRun {
    index: usize,
    attempts: u32,
    outcome: Result<Value, String>,
}

/// Executes [`WorkflowPlan`]s.
///
/// Independent steps run concurrently; every status write happens on the
/// driver loop inside [`WorkflowEngine::execute_with_trigger`], so a step is
/// only scheduled once the completion of its dependencies has been recorded.
pub struct WorkflowEngine {
    settings: EngineSettings,
    alerts: Arc<AlertManager>,
    clock: SharedClock,
    metrics: Option<ResilienceMetrics>,
    events: broadcast::Sender<StepEvent>,
    history: Mutex<VecDeque<WorkflowExecution>>,
}

impl WorkflowEngine {
    /// Engine raising step alerts on `alerts`.
    pub fn new(settings: EngineSettings, alerts: Arc<AlertManager>) -> Self {
        let (events, _) = broadcast::channel(EVENT_CHANNEL_CAPACITY);
        Self {
            history: Mutex::new(VecDeque::with_capacity(settings.history_capacity)),
            settings,
            alerts,
            clock: SystemClock::shared(),
            metrics: None,
            events,
        }
    }

    /// Engine configured from the guard section.
    pub fn from_config(config: &GuardConfig, alerts: Arc<AlertManager>) -> Self {
        Self::new(EngineSettings::from_config(config), alerts)
    }

    /// Use `clock` for timestamps and retry backoff.
    pub fn with_clock(mut self, clock: SharedClock) -> Self {
        self.clock = clock;
        self
    }

    /// Record executions on `metrics`.
    pub fn with_metrics(mut self, metrics: ResilienceMetrics) -> Self {
        self.metrics = Some(metrics);
        self
    }

    /// Active settings.
    pub fn settings(&self) -> &EngineSettings {
        &self.settings
    }

    /// Receive step events for executions started after this call.
    pub fn subscribe_events(&self) -> broadcast::Receiver<StepEvent> {
        self.events.subscribe()
    }

    /// Finished executions, oldest first.
    pub fn history(&self) -> Vec<WorkflowExecution> {
        self.history.lock().iter().cloned().collect()
    }

    /// Most recent finished execution.
    pub fn last_execution(&self) -> Option<WorkflowExecution> {
        self.history.lock().back().cloned()
    }

    /// Run `plan` as a manual execution.
    pub async fn execute(&self, plan: &WorkflowPlan) -> WorkflowExecution {
        self.execute_with_trigger(plan, ExecutionTrigger::Manual).await
    }

    /// Run `plan` to completion and record the result in history.
    pub async fn execute_with_trigger(
        &self,
        plan: &WorkflowPlan,
        trigger: ExecutionTrigger,
    ) -> WorkflowExecution {
        let execution_id = Uuid::new_v4();
        let started_at = self.clock.now();
        let default_retries = self.settings.step_retry.max_attempts.saturating_sub(1);
        let definitions = plan.steps();
        let index: HashMap<&str, usize> = definitions
            .iter()
            .enumerate()
            .map(|(position, definition)| (definition.id.as_str(), position))
            .collect();
        let mut steps: Vec<WorkflowStep> = definitions
            .iter()
            .map(|definition| {
                WorkflowStep::pending(
                    definition,
                    definition.max_retries.unwrap_or(default_retries),
                    started_at,
                )
            })
            .collect();

        info!(
            target: "tmd::resilience::workflow",
            execution = %execution_id,
            plan = plan.name(),
            trigger = %trigger,
            steps = steps.len(),
            "workflow execution started",
        );

        let mut in_flight = FuturesUnordered::new();
        let mut halted = false;
        loop {
            self.cascade_skips(execution_id, &mut steps, &index);

            if !halted {
                for position in 0..steps.len() {
                    if !is_ready(&steps, &index, position) {
                        continue;
                    }
                    let now = self.clock.now();
                    steps[position].transition(StepStatus::Running, now);
                    self.publish(execution_id, &steps[position], 1, None, now);
                    in_flight.push(self.run_step(
                        execution_id,
                        position,
                        &definitions[position],
                        steps[position].max_retries,
                    ));
                }
            }

            let Some(run) = in_flight.next().await else {
                break;
            };
            let failed_required = self.finish_step(execution_id, trigger, &mut steps[run.index], run);
            if failed_required && self.settings.halt_on_required_failure && !halted {
                halted = true;
                warn!(
                    target: "tmd::resilience::workflow",
                    execution = %execution_id,
                    "required step failed; no further steps will be scheduled",
                );
            }
        }

        let now = self.clock.now();
        for step in steps.iter_mut().filter(|step| step.status == StepStatus::Pending) {
            step.transition(StepStatus::Skipped, now);
            step.error = Some("execution halted after a required step failed".to_owned());
            self.publish(execution_id, step, 0, step.error.clone(), now);
        }

        let verdict = self.settings.quality_gate.evaluate(&steps);
        let execution = WorkflowExecution {
            id: execution_id,
            plan: plan.name().to_owned(),
            trigger,
            steps,
            status: if verdict.approved {
                ExecutionStatus::Completed
            } else {
                ExecutionStatus::Failed
            },
            started_at,
            ended_at: Some(now),
            quality_score: Some(verdict.score),
            approved: verdict.approved,
        };

        if execution.approved {
            info!(
                target: "tmd::resilience::workflow",
                execution = %execution.id,
                plan = plan.name(),
                score = verdict.score,
                "workflow execution approved",
            );
        } else {
            warn!(
                target: "tmd::resilience::workflow",
                execution = %execution.id,
                plan = plan.name(),
                score = verdict.score,
                failed_required = verdict.failed_required,
                failed_optional = verdict.failed_optional,
                "workflow execution not approved",
            );
            self.alerts.raise(
                NewAlert::new(
                    AlertCategory::Workflow,
                    AlertSeverity::High,
                    format!("Workflow '{}' not approved", plan.name()),
                    format!(
                        "quality score {:.1} (minimum {:.1}), {} required step(s) incomplete",
                        verdict.score,
                        self.settings.quality_gate.minimum_score(),
                        verdict.incomplete_required,
                    ),
                )
                .source("workflow-engine")
                .related(json!({
                    "execution_id": execution.id,
                    "trigger": trigger.as_str(),
                    "quality_score": verdict.score,
                    "failed_steps": execution.steps_with_status(StepStatus::Failed),
                })),
            );
        }

        if let Some(metrics) = &self.metrics {
            metrics.record_execution(&execution);
        }
        self.remember(execution.clone());
        execution
    }

    fn cascade_skips(
        &self,
        execution_id: Uuid,
        steps: &mut [WorkflowStep],
        index: &HashMap<&str, usize>,
    ) {
        loop {
            let blocked: Vec<usize> = (0..steps.len())
                .filter(|&position| {
                    steps[position].status == StepStatus::Pending
                        && steps[position].dependencies.iter().any(|dependency| {
                            matches!(
                                steps[index[dependency.as_str()]].status,
                                StepStatus::Failed | StepStatus::Skipped
                            )
                        })
                })
                .collect();
            if blocked.is_empty() {
                return;
            }
            let now = self.clock.now();
            for position in blocked {
                let step = &mut steps[position];
                step.transition(StepStatus::Skipped, now);
                step.error = Some("a dependency did not complete".to_owned());
                debug!(target: "tmd::resilience::workflow", execution = %execution_id, step = %step.id, "step skipped");
                self.publish(execution_id, step, 0, step.error.clone(), now);
            }
        }
    }

    async fn run_step(
        &self,
        execution_id: Uuid,
        index: usize,
        definition: &StepDefinition,
        max_retries: u32,
    ) -> StepRun {
        let policy = self
            .settings
            .step_retry
            .with_max_attempts(max_retries.saturating_add(1));
        let timeout = self.settings.step_timeout;
        let report = retry_with_backoff(&policy, self.clock.as_ref(), |attempt| {
            if attempt > 1 {
                debug!(
                    target: "tmd::resilience::workflow",
                    execution = %execution_id,
                    step = %definition.id,
                    attempt,
                    "retrying step",
                );
                let _ = self.events.send(StepEvent {
                    execution_id,
                    step_id: definition.id.clone(),
                    status: StepStatus::Running,
                    attempt,
                    message: None,
                    at: self.clock.now(),
                });
            }
            invoke_bounded(definition, timeout)
        })
        .await;
        StepRun {
            index,
            attempts: report.attempts,
            outcome: report.result,
        }
    }

    /// Record the terminal state of a step. Returns whether a required step failed.
    fn finish_step(
        &self,
        execution_id: Uuid,
        trigger: ExecutionTrigger,
        step: &mut WorkflowStep,
        run: StepRun,
    ) -> bool {
        let now = self.clock.now();
        step.retry_count = run.attempts.saturating_sub(1);
        match run.outcome {
            Ok(details) => {
                step.transition(StepStatus::Completed, now);
                step.result = Some(details);
                step.error = None;
                debug!(
                    target: "tmd::resilience::workflow",
                    execution = %execution_id,
                    step = %step.id,
                    attempts = run.attempts,
                    "step completed",
                );
                self.publish(execution_id, step, run.attempts, None, now);
                false
            }
            Err(message) => {
                step.transition(StepStatus::Failed, now);
                step.error = Some(message.clone());
                warn!(
                    target: "tmd::resilience::workflow",
                    execution = %execution_id,
                    step = %step.id,
                    attempts = run.attempts,
                    required = step.required,
                    error = %message,
                    "step failed",
                );
                self.publish(execution_id, step, run.attempts, Some(message.clone()), now);
                let severity = if step.required {
                    AlertSeverity::High
                } else {
                    AlertSeverity::Medium
                };
                self.alerts.raise(
                    NewAlert::new(
                        AlertCategory::Workflow,
                        severity,
                        format!("Workflow step '{}' failed", step.id),
                        message,
                    )
                    .source("workflow-engine")
                    .related(json!({
                        "execution_id": execution_id,
                        "trigger": trigger.as_str(),
                        "step": step.id,
                        "attempts": run.attempts,
                        "required": step.required,
                    })),
                );
                step.required
            }
        }
    }

    fn publish(
        &self,
        execution_id: Uuid,
        step: &WorkflowStep,
        attempt: u32,
        message: Option<String>,
        at: DateTime<Utc>,
    ) {
        // No receivers is the common case.
        let _ = self.events.send(StepEvent {
            execution_id,
            step_id: step.id.clone(),
            status: step.status,
            attempt,
            message,
            at,
        });
    }

    fn remember(&self, execution: WorkflowExecution) {
        let mut history = self.history.lock();
        while history.len() >= self.settings.history_capacity {
            history.pop_front();
        }
        history.push_back(execution);
    }
}

impl fmt::Debug for WorkflowEngine {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.debug_struct("WorkflowEngine")
            .field("settings", &self.settings)
            .finish_non_exhaustive()
    }
}

fn is_ready(steps: &[WorkflowStep], index: &HashMap<&str, usize>, position: usize) -> bool {
    let step = &steps[position];
    step.status == StepStatus::Pending
        && step
            .dependencies
            .iter()
            .all(|dependency| steps[index[dependency.as_str()]].status == StepStatus::Completed)
}

async fn invoke_bounded(definition: &StepDefinition, timeout: Duration) -> Result<Value, String> {
    let invocation = AssertUnwindSafe(definition.check.invoke(timeout)).catch_unwind();
    match tokio::time::timeout(timeout, invocation).await {
        Ok(Ok(outcome)) => outcome,
        Ok(Err(panic)) => Err(format!(
            "step '{}' panicked: {}",
            definition.id,
            panic_message(panic.as_ref())
        )),
        Err(_) => Err(format!(
            "step '{}' timed out after {}ms",
            definition.id,
            timeout.as_millis()
        )),
    }
}

#[cfg(test)]
mod tests {
    use std::sync::atomic::{AtomicU32, Ordering};

    use tmd_common::time::ManualClock;

    use super::*;
    use crate::workflow::step::{StepCheck, ValidationOutcome};

    fn engine(clock: Arc<ManualClock>) -> (WorkflowEngine, Arc<AlertManager>) {
        let alerts = Arc::new(
            AlertManager::new(50, Duration::from_secs(60)).with_clock(clock.clone()),
        );
        let settings = EngineSettings {
            step_timeout: Duration::from_secs(1),
            step_retry: RetryPolicy::new(3, Duration::from_millis(100), 2.0),
            ..EngineSettings::default()
        };
        (
            WorkflowEngine::new(settings, alerts.clone()).with_clock(clock),
            alerts,
        )
    }

    fn passing(id: &str) -> StepDefinition {
        StepDefinition::new(
            id,
            StepCheck::from_fn(|| async { Ok(ValidationOutcome::ok("ok")) }),
        )
    }

    #[test]
    fn settings_keep_configured_history_capacity() {
        let config = GuardConfig {
            execution_history_capacity: 3,
            ..GuardConfig::default()
        };
        assert_eq!(EngineSettings::from_config(&config).history_capacity, 3);
    }

    #[tokio::test]
    async fn default_retry_budget_comes_from_policy() {
        let clock = Arc::new(ManualClock::default());
        let (engine, alerts) = engine(clock.clone());
        let calls = Arc::new(AtomicU32::new(0));
        let counter = calls.clone();
        let plan = WorkflowPlan::new(
            "flaky",
            vec![StepDefinition::new(
                "always-fails",
                StepCheck::from_fn(move || {
                    counter.fetch_add(1, Ordering::SeqCst);
                    async { Ok(ValidationOutcome::failed("nope")) }
                }),
            )],
        )
        .unwrap();

        let execution = engine.execute(&plan).await;
        assert_eq!(calls.load(Ordering::SeqCst), 3);
        let step = execution.step("always-fails").unwrap();
        assert_eq!(step.retry_count, 2);
        assert_eq!(step.error.as_deref(), Some("nope"));
        assert_eq!(
            clock.recorded_sleeps(),
            vec![Duration::from_millis(100), Duration::from_millis(200)]
        );
        assert_eq!(execution.status, ExecutionStatus::Failed);
        assert!(alerts
            .list(None)
            .iter()
            .any(|alert| alert.title == "Workflow step 'always-fails' failed"));
    }

    #[tokio::test]
    async fn panicking_and_hanging_checks_fail_their_step() {
        let clock = Arc::new(ManualClock::default());
        let (engine, _) = engine(clock);
        let plan = WorkflowPlan::new(
            "hostile",
            vec![
                StepDefinition::new(
                    "panics",
                    StepCheck::from_fn(|| async {
                        if true {
                            panic!("validator bug");
                        }
                        Ok(ValidationOutcome::ok("unreachable"))
                    }),
                )
                .optional()
                .max_retries(0),
                StepDefinition::new(
                    "hangs",
                    StepCheck::from_fn(|| async {
                        tokio::time::sleep(Duration::from_secs(30)).await;
                        Ok(ValidationOutcome::ok("late"))
                    }),
                )
                .optional()
                .max_retries(0),
                passing("fine"),
            ],
        )
        .unwrap();

        let execution = engine.execute(&plan).await;
        let panics = execution.step("panics").unwrap();
        assert_eq!(panics.status, StepStatus::Failed);
        assert!(panics.error.as_deref().unwrap().contains("validator bug"));
        let hangs = execution.step("hangs").unwrap();
        assert!(hangs.error.as_deref().unwrap().contains("timed out"));
        assert_eq!(execution.step("fine").unwrap().status, StepStatus::Completed);
    }

    #[tokio::test]
    async fn events_and_history_are_recorded() {
        let clock = Arc::new(ManualClock::default());
        let (engine, _) = engine(clock);
        let mut events = engine.subscribe_events();
        let plan = WorkflowPlan::new(
            "linear",
            vec![passing("a"), passing("b").depends_on(["a"])],
        )
        .unwrap();

        let execution = engine.execute(&plan).await;
        assert!(execution.approved);
        assert_eq!(execution.quality_score, Some(100.0));
        assert_eq!(engine.history().len(), 1);
        assert_eq!(engine.last_execution().map(|e| e.id), Some(execution.id));

        let mut seen = Vec::new();
        while let Ok(event) = events.try_recv() {
            seen.push((event.step_id, event.status));
        }
        assert_eq!(
            seen,
            vec![
                ("a".to_string(), StepStatus::Running),
                ("a".to_string(), StepStatus::Completed),
                ("b".to_string(), StepStatus::Running),
                ("b".to_string(), StepStatus::Completed),
            ]
        );
    }

    #[tokio::test]
    async fn history_is_bounded() {
        let clock = Arc::new(ManualClock::default());
        let alerts = Arc::new(AlertManager::new(10, Duration::from_secs(60)));
        let engine = WorkflowEngine::new(
            EngineSettings {
                history_capacity: 2,
                ..EngineSettings::default()
            },
            alerts,
        )
        .with_clock(clock);
        let plan = WorkflowPlan::new("one", vec![passing("a")]).unwrap();
        for _ in 0..3 {
            engine.execute(&plan).await;
        }
        assert_eq!(engine.history().len(), 2);
    }
}
