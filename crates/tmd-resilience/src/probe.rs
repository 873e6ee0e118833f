//! ---
//! tmd_section: "07-resilience-fault-tolerance"
//! tmd_subsection: "module"
//! tmd_type: "source"
//! tmd_scope: "code"
//! tmd_description: "Probe contract and bounded probe invocation."
//! tmd_version: "v0.1.0"
//! tmd_owner: "tbd"
//! ---
use std::any::Any;
use std::fmt;
use std::future::Future;
use std::panic::AssertUnwindSafe;
use std::pin::Pin;
use std::sync::Arc;
use std::time::Duration;

use async_trait::async_trait;
use chrono::{DateTime, Utc};
use futures::FutureExt;
use serde::{Deserialize, Serialize};
use serde_json::Value;
use tmd_common::time::{millis_between, Clock};
use tracing::{debug, warn};
use uuid::Uuid;

/// Verdict reported by a probe implementation.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct ProbeOutcome {
    /// Whether the check passed.
    pub passed: bool,
    /// Human readable summary.
    pub message: String,
    /// Opaque diagnostic payload.
    #[serde(default)]
    pub detail: Value,
}

impl ProbeOutcome {
    /// Passing outcome.
    pub fn pass(message: impl Into<String>) -> Self {
        Self {
            passed: true,
            message: message.into(),
            detail: Value::Null,
        }
    }

    /// Failing outcome.
    pub fn fail(message: impl Into<String>) -> Self {
        Self {
            passed: false,
            message: message.into(),
            detail: Value::Null,
        }
    }

    /// Attach a diagnostic payload.
    pub fn with_detail(mut self, detail: Value) -> Self {
        self.detail = detail;
        self
    }
}

/// A named, side-effect-free health check.
///
/// Implementations should honour `timeout` where they can (e.g. as an HTTP
/// request timeout); the caller enforces it regardless.
#[async_trait]
pub trait Probe: Send + Sync {
    /// Stable probe name used in alerts and metrics.
    fn name(&self) -> &str;

    /// Perform one check. Errors are converted into failed results by the caller.
    async fn run(&self, timeout: Duration) -> anyhow::Result<ProbeOutcome>;
}

impl fmt::Debug for dyn Probe {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.debug_struct("Probe").field("name", &self.name()).finish()
    }
}

/// Immutable record of one probe invocation.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct ProbeResult {
    /// Unique id of this invocation.
    pub id: Uuid,
    /// Name of the probe that produced the result.
    pub probe: String,
    /// Whether the check passed.
    pub passed: bool,
    /// Human readable summary.
    pub message: String,
    /// Opaque diagnostic payload.
    pub detail: Value,
    /// Duration of the invocation as measured by the monitor's clock.
    pub duration_ms: u64,
    /// When the invocation started, per the monitor's clock.
    pub timestamp: DateTime<Utc>,
    /// Classification of the failure, if any.
    pub failure: Option<ProbeFailure>,
}

/// Why a probe result is a failure.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "snake_case")]
pub enum ProbeFailure {
    /// The probe reported `passed = false`.
    Reported,
    /// The probe did not finish within its timeout.
    Timeout,
    /// The probe returned an error or panicked.
    Error,
}

/// Run `probe` bounded by `timeout`, converting errors, panics, and timeouts
/// into failed results. Never panics and never propagates an error.
///
/// `clock` stamps the result; the timeout itself always runs on tokio time.
pub async fn run_probe(probe: Arc<dyn Probe>, timeout: Duration, clock: &dyn Clock) -> ProbeResult {
    let name = probe.name().to_owned();
    let timestamp = clock.now();
    let invocation = AssertUnwindSafe(probe.run(timeout)).catch_unwind();
    let outcome = tokio::time::timeout(timeout, invocation).await;
    let duration_ms = millis_between(timestamp, clock.now());

    let (outcome, failure) = match outcome {
        Ok(Ok(Ok(outcome))) => {
            let failure = (!outcome.passed).then_some(ProbeFailure::Reported);
            (outcome, failure)
        }
        Ok(Ok(Err(err))) => (
            ProbeOutcome::fail(format!("probe '{name}' failed: {err:#}")),
            Some(ProbeFailure::Error),
        ),
        Ok(Err(panic)) => (
            ProbeOutcome::fail(format!(
                "probe '{name}' panicked: {}",
                panic_message(panic.as_ref())
            )),
            Some(ProbeFailure::Error),
        ),
        Err(_) => (
            ProbeOutcome::fail(format!(
                "probe '{name}' timed out after {}ms",
                timeout.as_millis()
            ))
            .with_detail(serde_json::json!({ "timeout_ms": timeout.as_millis() as u64 })),
            Some(ProbeFailure::Timeout),
        ),
    };

    match failure {
        None => debug!(target: "tmd::resilience::probe", probe = %name, duration_ms, "probe passed"),
        Some(kind) => warn!(
            target: "tmd::resilience::probe",
            probe = %name,
            duration_ms,
            failure = ?kind,
            message = %outcome.message,
            "probe failed",
        ),
    }

    ProbeResult {
        id: Uuid::new_v4(),
        probe: name,
        passed: outcome.passed,
        message: outcome.message,
        detail: outcome.detail,
        duration_ms,
        timestamp,
        failure,
    }
}

pub(crate) fn panic_message(payload: &(dyn Any + Send)) -> String {
    if let Some(message) = payload.downcast_ref::<&str>() {
        (*message).to_owned()
    } else if let Some(message) = payload.downcast_ref::<String>() {
        message.clone()
    } else {
        "unknown panic payload".to_owned()
    }
}

type ProbeFuture = Pin<Box<dyn Future<Output = anyhow::Result<ProbeOutcome>> + Send>>;

/// Adapts an async closure into a [`Probe`].
pub struct FnProbe {
    name: String,
    check: Box<dyn Fn(Duration) -> ProbeFuture + Send + Sync>,
}

impl FnProbe {
    /// Wrap `check` under `name`.
    pub fn new<F, Fut>(name: impl Into<String>, check: F) -> Self
    where
        F: Fn(Duration) -> Fut + Send + Sync + 'static,
        Fut: Future<Output = anyhow::Result<ProbeOutcome>> + Send + 'static,
    {
        Self {
            name: name.into(),
            check: Box::new(move |timeout| Box::pin(check(timeout)) as ProbeFuture),
        }
    }

    /// Convenience constructor returning a shared handle.
    pub fn shared<F, Fut>(name: impl Into<String>, check: F) -> Arc<dyn Probe>
    where
        F: Fn(Duration) -> Fut + Send + Sync + 'static,
        Fut: Future<Output = anyhow::Result<ProbeOutcome>> + Send + 'static,
    {
        Arc::new(Self::new(name, check))
    }
}

impl fmt::Debug for FnProbe {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.debug_struct("FnProbe").field("name", &self.name).finish_non_exhaustive()
    }
}

#[async_trait]
impl Probe for FnProbe {
    fn name(&self) -> &str {
        &self.name
    }

    async fn run(&self, timeout: Duration) -> anyhow::Result<ProbeOutcome> {
        (self.check)(timeout).await
    }
}

#[cfg(test)]
mod tests {
    use chrono::TimeZone;
    use tmd_common::time::{ManualClock, SystemClock};

    use super::*;

    #[tokio::test]
    async fn passing_probe_is_recorded() {
        let probe = FnProbe::shared("endpoint", |_| async {
            Ok(ProbeOutcome::pass("reachable").with_detail(serde_json::json!({ "status": 200 })))
        });
        let result = run_probe(probe, Duration::from_secs(1), &SystemClock).await;
        assert!(result.passed);
        assert_eq!(result.probe, "endpoint");
        assert_eq!(result.detail["status"], 200);
        assert_eq!(result.failure, None);
    }

    #[tokio::test]
    async fn slow_probe_times_out() {
        let probe = FnProbe::shared("slow", |_| async {
            tokio::time::sleep(Duration::from_secs(30)).await;
            Ok(ProbeOutcome::pass("too late"))
        });
        let result = run_probe(probe, Duration::from_millis(20), &SystemClock).await;
        assert!(!result.passed);
        assert_eq!(result.failure, Some(ProbeFailure::Timeout));
        assert!(result.message.contains("timed out"));
    }

    #[tokio::test]
    async fn errors_and_panics_become_failures() {
        let erroring = FnProbe::shared("erroring", |_| async {
            Err(anyhow::anyhow!("connection refused"))
        });
        let result = run_probe(erroring, Duration::from_secs(1), &SystemClock).await;
        assert_eq!(result.failure, Some(ProbeFailure::Error));
        assert!(result.message.contains("connection refused"));

        let panicking = FnProbe::shared("panicking", |_| async {
            if true {
                panic!("render pipeline exploded");
            }
            Ok(ProbeOutcome::pass("unreachable"))
        });
        let result = run_probe(panicking, Duration::from_secs(1), &SystemClock).await;
        assert!(!result.passed);
        assert!(result.message.contains("render pipeline exploded"));
    }

    #[tokio::test]
    async fn result_is_stamped_by_injected_clock() {
        let start = Utc.with_ymd_and_hms(2024, 3, 1, 9, 30, 0).unwrap();
        let clock = ManualClock::new(start);
        let probe = FnProbe::shared("endpoint", |_| async { Ok(ProbeOutcome::pass("ok")) });
        let result = run_probe(probe, Duration::from_secs(1), &clock).await;
        assert_eq!(result.timestamp, start);
        assert_eq!(result.duration_ms, 0);
    }
}
