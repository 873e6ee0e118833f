//! ---
//! tmd_section: "07-resilience-fault-tolerance"
//! tmd_subsection: "module"
//! tmd_type: "source"
//! tmd_scope: "code"
//! tmd_description: "Workflow step definitions, checks, and per-execution step state."
//! tmd_version: "v0.1.0"
//! tmd_owner: "tbd"
//! ---
use std::fmt;
use std::future::Future;
use std::pin::Pin;
use std::sync::Arc;
use std::time::Duration;

use async_trait::async_trait;
use chrono::{DateTime, Utc};
use serde::{Deserialize, Serialize};
use serde_json::Value;

use crate::probe::Probe;

/// Lifecycle of a step inside one execution.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, Serialize, Deserialize)]
#[serde(rename_all = "lowercase")]
pub enum StepStatus {
    /// Waiting for dependencies.
    Pending,
    /// Check in progress, including retries.
    Running,
    /// Check succeeded.
    Completed,
    /// Check failed after every retry.
    Failed,
    /// Never scheduled because a dependency did not complete or the run halted.
    Skipped,
}

impl StepStatus {
    /// Static label for metrics and payloads.
    pub fn as_str(&self) -> &'static str {
        match self {
            StepStatus::Pending => "pending",
            StepStatus::Running => "running",
            StepStatus::Completed => "completed",
            StepStatus::Failed => "failed",
            StepStatus::Skipped => "skipped",
        }
    }

    /// Whether no further transition is possible.
    pub fn is_terminal(&self) -> bool {
        matches!(
            self,
            StepStatus::Completed | StepStatus::Failed | StepStatus::Skipped
        )
    }

    /// Legal forward transitions: pending to running or skipped, running to completed or failed.
    pub fn can_transition_to(&self, next: StepStatus) -> bool {
        matches!(
            (self, next),
            (StepStatus::Pending, StepStatus::Running)
                | (StepStatus::Pending, StepStatus::Skipped)
                | (StepStatus::Running, StepStatus::Completed)
                | (StepStatus::Running, StepStatus::Failed)
        )
    }
}

impl fmt::Display for StepStatus {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.write_str(self.as_str())
    }
}

/// One recorded status change.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct StepTransition {
    /// Status entered.
    pub status: StepStatus,
    /// When it was entered.
    pub at: DateTime<Utc>,
}

/// Per-execution state of a step.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct WorkflowStep {
    /// Step identifier, unique within the plan.
    pub id: String,
    /// Display name.
    pub name: String,
    /// Ids of steps that must complete first.
    pub dependencies: Vec<String>,
    /// Whether a failure blocks approval.
    pub required: bool,
    /// Current status.
    pub status: StepStatus,
    /// Retries performed after the first attempt.
    pub retry_count: u32,
    /// Retry budget.
    pub max_retries: u32,
    /// When the step started running.
    pub started_at: Option<DateTime<Utc>>,
    /// When the step reached a terminal status.
    pub ended_at: Option<DateTime<Utc>>,
    /// Details reported by a successful check.
    pub result: Option<Value>,
    /// Last failure message.
    pub error: Option<String>,
    /// Every status entered, in order, starting with `pending`.
    pub history: Vec<StepTransition>,
}

impl WorkflowStep {
    pub(crate) fn pending(definition: &StepDefinition, max_retries: u32, at: DateTime<Utc>) -> Self {
        Self {
            id: definition.id.clone(),
            name: definition.name.clone(),
            dependencies: definition.dependencies.clone(),
            required: definition.required,
            status: StepStatus::Pending,
            retry_count: 0,
            max_retries,
            started_at: None,
            ended_at: None,
            result: None,
            error: None,
            history: vec![StepTransition {
                status: StepStatus::Pending,
                at,
            }],
        }
    }

    /// Move to `next`, refusing anything but a forward transition.
    pub(crate) fn transition(&mut self, next: StepStatus, at: DateTime<Utc>) -> bool {
        if !self.status.can_transition_to(next) {
            return false;
        }
        self.status = next;
        match next {
            StepStatus::Running => self.started_at = Some(at),
            status if status.is_terminal() => self.ended_at = Some(at),
            _ => {}
        }
        self.history.push(StepTransition { status: next, at });
        true
    }
}

/// Verdict returned by a [`Validator`].
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct ValidationOutcome {
    /// Whether validation succeeded.
    pub success: bool,
    /// Human readable summary.
    pub message: String,
    /// Opaque details.
    #[serde(default)]
    pub details: Value,
}

impl ValidationOutcome {
    /// Successful outcome.
    pub fn ok(message: impl Into<String>) -> Self {
        Self {
            success: true,
            message: message.into(),
            details: Value::Null,
        }
    }

    /// Failed outcome.
    pub fn failed(message: impl Into<String>) -> Self {
        Self {
            success: false,
            message: message.into(),
            details: Value::Null,
        }
    }

    /// Attach details.
    pub fn with_details(mut self, details: Value) -> Self {
        self.details = details;
        self
    }
}

/// Step-level check that is not a plain probe (e.g. a pre-delivery validation).
#[async_trait]
pub trait Validator: Send + Sync {
    /// Validate once.
    async fn validate(&self) -> anyhow::Result<ValidationOutcome>;
}

type ValidatorFuture = Pin<Box<dyn Future<Output = anyhow::Result<ValidationOutcome>> + Send>>;

/// Adapts an async closure into a [`Validator`].
pub struct FnValidator {
    check: Box<dyn Fn() -> ValidatorFuture + Send + Sync>,
}

impl FnValidator {
    /// Wrap `check`.
    pub fn new<F, Fut>(check: F) -> Self
    where
        F: Fn() -> Fut + Send + Sync + 'static,
        Fut: Future<Output = anyhow::Result<ValidationOutcome>> + Send + 'static,
    {
        Self {
            check: Box::new(move || Box::pin(check()) as ValidatorFuture),
        }
    }
}

impl fmt::Debug for FnValidator {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.debug_struct("FnValidator").finish_non_exhaustive()
    }
}

#[async_trait]
impl Validator for FnValidator {
    async fn validate(&self) -> anyhow::Result<ValidationOutcome> {
        (self.check)().await
    }
}

/// What a step invokes.
#[derive(Clone)]
pub enum StepCheck {
    /// Run a probe; `passed` maps to success.
    Probe(Arc<dyn Probe>),
    /// Run a validator.
    Validator(Arc<dyn Validator>),
}

impl StepCheck {
    /// Wrap a closure as a validator check.
    pub fn from_fn<F, Fut>(check: F) -> Self
    where
        F: Fn() -> Fut + Send + Sync + 'static,
        Fut: Future<Output = anyhow::Result<ValidationOutcome>> + Send + 'static,
    {
        StepCheck::Validator(Arc::new(FnValidator::new(check)))
    }

    /// Invoke once. `Ok` carries the success details, `Err` the failure message.
    pub(crate) async fn invoke(&self, timeout: Duration) -> Result<Value, String> {
        match self {
            StepCheck::Probe(probe) => match probe.run(timeout).await {
                Ok(outcome) if outcome.passed => Ok(outcome.detail),
                Ok(outcome) => Err(outcome.message),
                Err(err) => Err(format!("{err:#}")),
            },
            StepCheck::Validator(validator) => match validator.validate().await {
                Ok(outcome) if outcome.success => Ok(outcome.details),
                Ok(outcome) => Err(outcome.message),
                Err(err) => Err(format!("{err:#}")),
            },
        }
    }
}

impl fmt::Debug for StepCheck {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        match self {
            StepCheck::Probe(probe) => f.debug_tuple("Probe").field(&probe.name()).finish(),
            StepCheck::Validator(_) => f.write_str("Validator"),
        }
    }
}

/// Static description of a step, reused across executions.
#[derive(Debug, Clone)]
pub struct StepDefinition {
    /// Unique id.
    pub id: String,
    /// Display name; defaults to the id.
    pub name: String,
    /// Ids of prerequisite steps.
    pub dependencies: Vec<String>,
    /// Whether a failure blocks approval.
    pub required: bool,
    /// Retry budget; `None` uses the engine's step retry policy.
    pub max_retries: Option<u32>,
    /// Bound check.
    pub check: StepCheck,
}

impl StepDefinition {
    /// A required step with no dependencies.
    pub fn new(id: impl Into<String>, check: StepCheck) -> Self {
        let id = id.into();
        Self {
            name: id.clone(),
            id,
            dependencies: Vec::new(),
            required: true,
            max_retries: None,
            check,
        }
    }

    /// Set the display name.
    pub fn named(mut self, name: impl Into<String>) -> Self {
        self.name = name.into();
        self
    }

    /// Add prerequisite steps.
    pub fn depends_on<I, S>(mut self, dependencies: I) -> Self
    where
        I: IntoIterator<Item = S>,
        S: Into<String>,
    {
        self.dependencies
            .extend(dependencies.into_iter().map(Into::into));
        self
    }

    /// Mark as optional: failures lower the score but never block approval.
    pub fn optional(mut self) -> Self {
        self.required = false;
        self
    }

    /// Override the retry budget.
    pub fn max_retries(mut self, retries: u32) -> Self {
        self.max_retries = Some(retries);
        self
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn only_forward_transitions_are_legal() {
        use StepStatus::*;
        assert!(Pending.can_transition_to(Running));
        assert!(Pending.can_transition_to(Skipped));
        assert!(Running.can_transition_to(Failed));
        assert!(!Completed.can_transition_to(Running));
        assert!(!Failed.can_transition_to(Completed));
        assert!(!Skipped.can_transition_to(Running));
        assert!(!Pending.can_transition_to(Completed));
    }

    #[test]
    fn transition_records_history_and_timestamps() {
        let definition = StepDefinition::new(
            "fetch",
            StepCheck::from_fn(|| async { Ok(ValidationOutcome::ok("fine")) }),
        );
        let now = Utc::now();
        let mut step = WorkflowStep::pending(&definition, 2, now);
        assert!(step.transition(StepStatus::Running, now));
        assert!(step.transition(StepStatus::Completed, now));
        assert!(!step.transition(StepStatus::Failed, now));
        assert_eq!(step.status, StepStatus::Completed);
        assert_eq!(step.history.len(), 3);
        assert!(step.started_at.is_some() && step.ended_at.is_some());
    }

    #[tokio::test]
    async fn validator_failure_carries_message() {
        let check = StepCheck::from_fn(|| async {
            Ok(ValidationOutcome::failed("payload empty"))
        });
        assert_eq!(
            check.invoke(Duration::from_secs(1)).await,
            Err("payload empty".to_string())
        );
    }
}
