//! ---
//! tmd_section: "07-resilience-fault-tolerance"
//! tmd_subsection: "module"
//! tmd_type: "source"
//! tmd_scope: "code"
//! tmd_description: "Quality scoring and release approval."
//! tmd_version: "v0.1.0"
//! tmd_owner: "tbd"
//! ---
use serde::{Deserialize, Serialize};
use tmd_common::config::QualityGateConfig;

use super::step::{StepStatus, WorkflowStep};

/// Score and approval computed for one finished execution.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct QualityVerdict {
    /// Score in `0..=100`.
    pub score: f64,
    /// Whether the release may ship.
    pub approved: bool,
    /// Required steps that failed.
    pub failed_required: usize,
    /// Optional steps that failed.
    pub failed_optional: usize,
    /// Required steps that never completed (failed or skipped). Reported
    /// for operators; only failures block approval.
    pub incomplete_required: usize,
}

/// Applies the configured penalties to a set of finished steps.
#[derive(Debug, Clone, Copy, PartialEq)]
pub struct QualityGate {
    config: QualityGateConfig,
}

impl QualityGate {
    /// Gate with the given thresholds.
    pub fn new(config: QualityGateConfig) -> Self {
        Self { config }
    }

    /// Minimum score needed for approval.
    pub fn minimum_score(&self) -> f64 {
        self.config.minimum_score
    }

    /// Score `steps`. Only failed steps are penalised, and approval needs no
    /// failed required step plus a score at or above the minimum.
    pub fn evaluate(&self, steps: &[WorkflowStep]) -> QualityVerdict {
        let total = steps.len();
        let failed_required = steps
            .iter()
            .filter(|step| step.required && step.status == StepStatus::Failed)
            .count();
        let failed_optional = steps
            .iter()
            .filter(|step| !step.required && step.status == StepStatus::Failed)
            .count();
        let incomplete_required = steps
            .iter()
            .filter(|step| step.required && step.status != StepStatus::Completed)
            .count();

        let failed = failed_required + failed_optional;
        let ratio = if total == 0 {
            0.0
        } else {
            failed as f64 / total as f64
        };
        let score = (100.0
            - self.config.required_failure_penalty * failed_required as f64
            - self.config.optional_failure_penalty * failed_optional as f64
            - self.config.failure_ratio_penalty * ratio)
            .clamp(0.0, 100.0);

        QualityVerdict {
            score,
            approved: failed_required == 0 && score >= self.config.minimum_score,
            failed_required,
            failed_optional,
            incomplete_required,
        }
    }
}

impl Default for QualityGate {
    fn default() -> Self {
        Self::new(QualityGateConfig::default())
    }
}

#[cfg(test)]
mod tests {
    use chrono::Utc;

    use super::*;
    use crate::workflow::step::{StepCheck, StepDefinition, ValidationOutcome};

    fn step(id: &str, required: bool, status: StepStatus) -> WorkflowStep {
        let mut definition = StepDefinition::new(
            id,
            StepCheck::from_fn(|| async { Ok(ValidationOutcome::ok("ok")) }),
        );
        definition.required = required;
        let mut step = WorkflowStep::pending(&definition, 0, Utc::now());
        step.status = status;
        step
    }

    #[test]
    fn all_completed_scores_full_marks() {
        let verdict = QualityGate::default().evaluate(&[
            step("a", true, StepStatus::Completed),
            step("b", false, StepStatus::Completed),
        ]);
        assert_eq!(verdict.score, 100.0);
        assert!(verdict.approved);
    }

    #[test]
    fn optional_failure_lowers_score_without_blocking() {
        let verdict = QualityGate::default().evaluate(&[
            step("a", true, StepStatus::Completed),
            step("b", true, StepStatus::Completed),
            step("c", true, StepStatus::Completed),
            step("d", false, StepStatus::Failed),
        ]);
        // 100 - 10 - 20 * 0.25
        assert_eq!(verdict.score, 85.0);
        assert!(verdict.approved);
    }

    #[test]
    fn required_failure_blocks_even_with_high_score() {
        let gate = QualityGate::new(QualityGateConfig {
            minimum_score: 0.0,
            ..QualityGateConfig::default()
        });
        let verdict = gate.evaluate(&[
            step("a", true, StepStatus::Failed),
            step("b", true, StepStatus::Skipped),
        ]);
        assert_eq!(verdict.failed_required, 1);
        assert_eq!(verdict.incomplete_required, 2);
        assert!(!verdict.approved);
        // 100 - 25 - 20 * 0.5
        assert_eq!(verdict.score, 65.0);
    }

    #[test]
    fn skipped_required_step_does_not_block_approval() {
        let verdict = QualityGate::default().evaluate(&[
            step("a", false, StepStatus::Failed),
            step("b", true, StepStatus::Skipped),
        ]);
        // 100 - 10 - 20 * 0.5
        assert_eq!(verdict.score, 80.0);
        assert_eq!(verdict.failed_required, 0);
        assert_eq!(verdict.incomplete_required, 1);
        assert!(verdict.approved);
    }

    #[test]
    fn score_is_clamped_at_zero() {
        let steps: Vec<_> = (0..6)
            .map(|i| step(&format!("s{i}"), true, StepStatus::Failed))
            .collect();
        assert_eq!(QualityGate::default().evaluate(&steps).score, 0.0);
    }
}
