//! ---
//! tmd_section: "05-integrations"
//! tmd_subsection: "module"
//! tmd_type: "source"
//! tmd_scope: "code"
//! tmd_description: "Probe construction from configuration."
//! tmd_version: "v0.1.0"
//! tmd_owner: "tbd"
//! ---
//! Adapters between `[[probes]]` configuration and the guard core: concrete
//! HTTP probes for the health monitor and a release plan for the workflow engine.

pub mod http;

use std::sync::Arc;
use std::time::Duration;

use anyhow::{Context, Result};
use reqwest::Client;
use tmd_common::config::{ProbeKind, ProbeTargetConfig};
use tmd_resilience::{Probe, StepCheck, StepDefinition, WorkflowError, WorkflowPlan};

pub use http::{
    lookup, DataShapeProbe, HttpReachabilityProbe, LatencyProbe, ProbeError, SnapshotValidator,
};

/// Budget applied to latency probes that do not configure one.
pub const DEFAULT_LATENCY_BUDGET: Duration = Duration::from_secs(1);

/// HTTP client shared by every probe.
pub fn build_client(timeout: Duration) -> Result<Client> {
    Client::builder()
        .timeout(timeout)
        .user_agent(concat!("tmd-guardd/", env!("CARGO_PKG_VERSION")))
        .build()
        .context("failed to build HTTP client")
}

enum Check {
    Probe(Arc<dyn Probe>),
    Snapshot(Arc<SnapshotValidator>),
}

fn build_check(target: &ProbeTargetConfig, client: &Client, timeout: Duration) -> Check {
    let name = target.name.clone();
    let url = target.url.clone();
    match target.kind {
        ProbeKind::Reachability => {
            Check::Probe(Arc::new(HttpReachabilityProbe::new(name, client.clone(), url)))
        }
        ProbeKind::Latency => Check::Probe(Arc::new(LatencyProbe::new(
            name,
            client.clone(),
            url,
            target.latency_budget.unwrap_or(DEFAULT_LATENCY_BUDGET),
        ))),
        ProbeKind::DataShape => Check::Probe(Arc::new(DataShapeProbe::new(
            name,
            client.clone(),
            url,
            target.fields.clone(),
        ))),
        ProbeKind::Payload => Check::Snapshot(Arc::new(SnapshotValidator::new(
            name,
            client.clone(),
            url,
            timeout,
        ))),
    }
}

/// Build one probe for `target`.
pub fn build_probe(target: &ProbeTargetConfig, client: &Client, timeout: Duration) -> Arc<dyn Probe> {
    match build_check(target, client, timeout) {
        Check::Probe(probe) => probe,
        Check::Snapshot(validator) => validator as Arc<dyn Probe>,
    }
}

/// Probes polled by the health monitor; `workflow_only` targets are excluded.
pub fn monitored_probes(
    targets: &[ProbeTargetConfig],
    client: &Client,
    timeout: Duration,
) -> Vec<Arc<dyn Probe>> {
    targets
        .iter()
        .filter(|target| !target.workflow_only)
        .map(|target| build_probe(target, client, timeout))
        .collect()
}

/// Release plan with one step per target, honouring dependencies, optionality, and retry overrides.
/// Payload targets run as validators.
pub fn release_plan(
    name: &str,
    targets: &[ProbeTargetConfig],
    client: &Client,
    timeout: Duration,
) -> Result<WorkflowPlan, WorkflowError> {
    let steps = targets
        .iter()
        .map(|target| {
            let check = match build_check(target, client, timeout) {
                Check::Probe(probe) => StepCheck::Probe(probe),
                Check::Snapshot(validator) => StepCheck::Validator(validator),
            };
            let mut step = StepDefinition::new(target.name.clone(), check)
                .depends_on(target.depends_on.iter().cloned());
            step.required = target.required;
            step.max_retries = target.max_retries;
            step
        })
        .collect();
    WorkflowPlan::new(name, steps)
}
