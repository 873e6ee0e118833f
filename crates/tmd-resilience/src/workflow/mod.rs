//! ---
//! tmd_section: "07-resilience-fault-tolerance"
//! tmd_subsection: "module"
//! tmd_type: "source"
//! tmd_scope: "code"
//! tmd_description: "Gated release workflows."
//! tmd_version: "v0.1.0"
//! tmd_owner: "tbd"
//! ---
//! Dependency-ordered validation and delivery steps whose outcome decides
//! whether a release of dashboard data is safe to ship.

pub mod engine;
pub mod plan;
pub mod quality;
pub mod step;

pub use engine::{
    EngineSettings, ExecutionStatus, ExecutionTrigger, StepEvent, WorkflowEngine,
    WorkflowExecution,
};
pub use plan::{WorkflowError, WorkflowPlan};
pub use quality::{QualityGate, QualityVerdict};
pub use step::{
    FnValidator, StepCheck, StepDefinition, StepStatus, StepTransition, ValidationOutcome,
    Validator, WorkflowStep,
};
