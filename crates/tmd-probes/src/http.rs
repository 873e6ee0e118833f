//! ---
//! tmd_section: "05-integrations"
//! tmd_subsection: "module"
//! tmd_type: "source"
//! tmd_scope: "code"
//! tmd_description: "reqwest-backed probes and validators."
//! tmd_version: "v0.1.0"
//! tmd_owner: "tbd"
//! ---
use std::time::{Duration, Instant};

use async_trait::async_trait;
use reqwest::{Client, StatusCode};
use serde_json::{json, Value};
use thiserror::Error;
use tmd_resilience::{Probe, ProbeOutcome, ValidationOutcome, Validator};
use tracing::debug;
use url::Url;

/// Failures talking to the dashboard read path.
#[derive(Debug, Error)]
pub enum ProbeError {
    /// Transport-level failure (connect, TLS, timeout, body read).
    #[error("request to {url} failed: {source}")]
    Http {
        /// Requested URL.
        url: Url,
        /// Underlying client error.
        #[source]
        source: reqwest::Error,
    },
    /// The endpoint answered with a non-success status.
    #[error("{url} answered {status}")]
    Status {
        /// Requested URL.
        url: Url,
        /// Status received.
        status: StatusCode,
    },
    /// The body was not valid JSON.
    #[error("{url} returned invalid JSON: {message}")]
    Decode {
        /// Requested URL.
        url: Url,
        /// Parser message.
        message: String,
    },
}

async fn get(client: &Client, url: &Url, timeout: Duration) -> Result<reqwest::Response, ProbeError> {
    client
        .get(url.clone())
        .timeout(timeout)
        .send()
        .await
        .map_err(|source| ProbeError::Http {
            url: url.clone(),
            source,
        })
}

async fn fetch_json(client: &Client, url: &Url, timeout: Duration) -> Result<Value, ProbeError> {
    let response = get(client, url, timeout).await?;
    let status = response.status();
    if !status.is_success() {
        return Err(ProbeError::Status {
            url: url.clone(),
            status,
        });
    }
    let body = response.bytes().await.map_err(|source| ProbeError::Http {
        url: url.clone(),
        source,
    })?;
    serde_json::from_slice(&body).map_err(|err| ProbeError::Decode {
        url: url.clone(),
        message: err.to_string(),
    })
}

/// Look up a dotted path such as `totals.open` in a JSON document.
pub fn lookup<'a>(document: &'a Value, path: &str) -> Option<&'a Value> {
    path.split('.')
        .try_fold(document, |node, segment| match node {
            Value::Object(map) => map.get(segment),
            Value::Array(items) => segment.parse::<usize>().ok().and_then(|i| items.get(i)),
            _ => None,
        })
}

/// Passes when the endpoint answers with a 2xx status.
#[derive(Debug, Clone)]
pub struct HttpReachabilityProbe {
    name: String,
    client: Client,
    url: Url,
}

impl HttpReachabilityProbe {
    /// Probe `url` under `name`.
    pub fn new(name: impl Into<String>, client: Client, url: Url) -> Self {
        Self {
            name: name.into(),
            client,
            url,
        }
    }
}

#[async_trait]
impl Probe for HttpReachabilityProbe {
    fn name(&self) -> &str {
        &self.name
    }

    async fn run(&self, timeout: Duration) -> anyhow::Result<ProbeOutcome> {
        let response = get(&self.client, &self.url, timeout).await?;
        let status = response.status();
        let detail = json!({ "url": self.url.as_str(), "status": status.as_u16() });
        Ok(if status.is_success() {
            ProbeOutcome::pass(format!("{} reachable ({status})", self.url)).with_detail(detail)
        } else {
            ProbeOutcome::fail(format!("{} answered {status}", self.url)).with_detail(detail)
        })
    }
}

/// Passes when a successful response arrives within the latency budget.
#[derive(Debug, Clone)]
pub struct LatencyProbe {
    name: String,
    client: Client,
    url: Url,
    budget: Duration,
}

impl LatencyProbe {
    /// Probe `url`, failing responses slower than `budget`.
    pub fn new(name: impl Into<String>, client: Client, url: Url, budget: Duration) -> Self {
        Self {
            name: name.into(),
            client,
            url,
            budget,
        }
    }
}

#[async_trait]
impl Probe for LatencyProbe {
    fn name(&self) -> &str {
        &self.name
    }

    async fn run(&self, timeout: Duration) -> anyhow::Result<ProbeOutcome> {
        let started = Instant::now();
        let response = get(&self.client, &self.url, timeout).await?;
        let status = response.status();
        // Latency covers the full body, as the dashboard experiences it.
        response.bytes().await.map_err(|source| ProbeError::Http {
            url: self.url.clone(),
            source,
        })?;
        let elapsed = started.elapsed();
        let elapsed_ms = elapsed.as_millis() as u64;
        let budget_ms = self.budget.as_millis() as u64;
        let detail = json!({ "elapsed_ms": elapsed_ms, "budget_ms": budget_ms, "status": status.as_u16() });
        debug!(target: "tmd::probes::latency", probe = %self.name, elapsed_ms, budget_ms, "latency measured");

        Ok(if !status.is_success() {
            ProbeOutcome::fail(format!("{} answered {status}", self.url)).with_detail(detail)
        } else if elapsed > self.budget {
            ProbeOutcome::fail(format!(
                "{} took {elapsed_ms}ms, budget {budget_ms}ms",
                self.url
            ))
            .with_detail(detail)
        } else {
            ProbeOutcome::pass(format!("{} answered in {elapsed_ms}ms", self.url)).with_detail(detail)
        })
    }
}

/// Passes when every configured field is a non-zero number.
#[derive(Debug, Clone)]
pub struct DataShapeProbe {
    name: String,
    client: Client,
    url: Url,
    fields: Vec<String>,
}

impl DataShapeProbe {
    /// Check `fields` (dotted paths) in the JSON served at `url`.
    pub fn new(name: impl Into<String>, client: Client, url: Url, fields: Vec<String>) -> Self {
        Self {
            name: name.into(),
            client,
            url,
            fields,
        }
    }
}

#[async_trait]
impl Probe for DataShapeProbe {
    fn name(&self) -> &str {
        &self.name
    }

    async fn run(&self, timeout: Duration) -> anyhow::Result<ProbeOutcome> {
        let document = fetch_json(&self.client, &self.url, timeout).await?;
        let mut missing = Vec::new();
        let mut zero = Vec::new();
        for field in &self.fields {
            match lookup(&document, field).and_then(Value::as_f64) {
                None => missing.push(field.as_str()),
                Some(value) if value == 0.0 => zero.push(field.as_str()),
                Some(_) => {}
            }
        }
        let detail = json!({ "fields": self.fields, "missing": missing, "zero": zero });
        Ok(if missing.is_empty() && zero.is_empty() {
            ProbeOutcome::pass(format!("{} field(s) populated", self.fields.len())).with_detail(detail)
        } else {
            let mut problems = Vec::new();
            if !missing.is_empty() {
                problems.push(format!("missing or non-numeric: {}", missing.join(", ")));
            }
            if !zero.is_empty() {
                problems.push(format!("zero: {}", zero.join(", ")));
            }
            ProbeOutcome::fail(problems.join("; ")).with_detail(detail)
        })
    }
}

/// Confirms a non-empty snapshot payload exists before delivery.
#[derive(Debug, Clone)]
pub struct SnapshotValidator {
    name: String,
    client: Client,
    url: Url,
    timeout: Duration,
}

impl SnapshotValidator {
    /// Validate the payload served at `url`, bounding requests by `timeout`.
    pub fn new(name: impl Into<String>, client: Client, url: Url, timeout: Duration) -> Self {
        Self {
            name: name.into(),
            client,
            url,
            timeout,
        }
    }

    async fn inspect(&self, timeout: Duration) -> Result<ValidationOutcome, ProbeError> {
        let document = fetch_json(&self.client, &self.url, timeout).await?;
        let entries = match &document {
            Value::Null => 0,
            Value::Object(map) => map.len(),
            Value::Array(items) => items.len(),
            Value::String(text) => usize::from(!text.is_empty()),
            _ => 1,
        };
        let details = json!({ "url": self.url.as_str(), "entries": entries });
        Ok(if entries == 0 {
            ValidationOutcome::failed(format!("{} returned an empty payload", self.url))
                .with_details(details)
        } else {
            ValidationOutcome::ok(format!("payload ready ({entries} entries)")).with_details(details)
        })
    }
}

#[async_trait]
impl Validator for SnapshotValidator {
    async fn validate(&self) -> anyhow::Result<ValidationOutcome> {
        Ok(self.inspect(self.timeout).await?)
    }
}

#[async_trait]
impl Probe for SnapshotValidator {
    fn name(&self) -> &str {
        &self.name
    }

    async fn run(&self, timeout: Duration) -> anyhow::Result<ProbeOutcome> {
        let outcome = self.inspect(timeout).await?;
        let probe_outcome = if outcome.success {
            ProbeOutcome::pass(outcome.message)
        } else {
            ProbeOutcome::fail(outcome.message)
        };
        Ok(probe_outcome.with_detail(outcome.details))
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn lookup_walks_objects_and_arrays() {
        let document = json!({ "totals": { "open": 4 }, "ranking": [{ "count": 2 }] });
        assert_eq!(lookup(&document, "totals.open"), Some(&json!(4)));
        assert_eq!(lookup(&document, "ranking.0.count"), Some(&json!(2)));
        assert_eq!(lookup(&document, "totals.closed"), None);
        assert_eq!(lookup(&document, "totals.open.deep"), None);
    }
}
