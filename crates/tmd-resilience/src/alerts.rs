//! ---
//! tmd_section: "07-resilience-fault-tolerance"
//! tmd_subsection: "module"
//! tmd_type: "source"
//! tmd_scope: "code"
//! tmd_description: "Bounded alert store with coalescing and subscriber fan-out."
//! tmd_version: "v0.1.0"
//! tmd_owner: "tbd"
//! ---
use std::collections::VecDeque;
use std::fmt;
use std::panic::{catch_unwind, AssertUnwindSafe};
use std::sync::Arc;
use std::time::Duration;

use chrono::{DateTime, Utc};
use parking_lot::{Mutex, RwLock};
use serde::{Deserialize, Serialize};
use serde_json::Value;
use tmd_common::time::{Clock, SharedClock, SystemClock};
use tracing::{debug, error, info, warn};
use uuid::Uuid;

use crate::metrics::ResilienceMetrics;
use crate::probe::panic_message;

/// Alert severity, ordered from least to most urgent.
#[derive(Debug, Clone, Copy, PartialEq, Eq, PartialOrd, Ord, Hash, Serialize, Deserialize)]
#[serde(rename_all = "lowercase")]
pub enum AlertSeverity {
    /// Informational (e.g. a recovery notice).
    Low,
    /// Something is failing but the system is within thresholds.
    Medium,
    /// Thresholds are crossed; release gating or degradation in effect.
    High,
    /// Human intervention required.
    Critical,
}

impl AlertSeverity {
    /// Static label for metrics and payloads.
    pub fn as_str(&self) -> &'static str {
        match self {
            AlertSeverity::Low => "low",
            AlertSeverity::Medium => "medium",
            AlertSeverity::High => "high",
            AlertSeverity::Critical => "critical",
        }
    }
}

impl fmt::Display for AlertSeverity {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.write_str(self.as_str())
    }
}

impl std::str::FromStr for AlertSeverity {
    type Err = String;

    fn from_str(s: &str) -> Result<Self, Self::Err> {
        match s.to_ascii_lowercase().as_str() {
            "low" => Ok(AlertSeverity::Low),
            "medium" => Ok(AlertSeverity::Medium),
            "high" => Ok(AlertSeverity::High),
            "critical" => Ok(AlertSeverity::Critical),
            other => Err(format!("unknown severity: {other}")),
        }
    }
}

/// Subsystem an alert originates from.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, Serialize, Deserialize)]
#[serde(rename_all = "lowercase")]
pub enum AlertCategory {
    /// Health monitor probe cycles.
    Health,
    /// Workflow steps and release gating.
    Workflow,
    /// Auto-recovery episodes.
    Recovery,
    /// Latency and rendering budgets.
    Performance,
    /// Shape or content of dashboard data.
    Data,
    /// Anything else raised by the process itself.
    System,
}

impl AlertCategory {
    /// Static label for metrics and payloads.
    pub fn as_str(&self) -> &'static str {
        match self {
            AlertCategory::Health => "health",
            AlertCategory::Workflow => "workflow",
            AlertCategory::Recovery => "recovery",
            AlertCategory::Performance => "performance",
            AlertCategory::Data => "data",
            AlertCategory::System => "system",
        }
    }
}

impl fmt::Display for AlertCategory {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.write_str(self.as_str())
    }
}

impl std::str::FromStr for AlertCategory {
    type Err = String;

    fn from_str(s: &str) -> Result<Self, Self::Err> {
        match s.to_ascii_lowercase().as_str() {
            "health" => Ok(AlertCategory::Health),
            "workflow" => Ok(AlertCategory::Workflow),
            "recovery" => Ok(AlertCategory::Recovery),
            "performance" => Ok(AlertCategory::Performance),
            "data" => Ok(AlertCategory::Data),
            "system" => Ok(AlertCategory::System),
            other => Err(format!("unknown category: {other}")),
        }
    }
}

/// A recorded, severity-tagged notification.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct Alert {
    /// Unique identifier.
    pub id: Uuid,
    /// Originating subsystem.
    pub category: AlertCategory,
    /// Urgency.
    pub severity: AlertSeverity,
    /// Short title; `(category, title)` is the coalescing key.
    pub title: String,
    /// Detailed message from the first occurrence.
    pub message: String,
    /// Component that raised the alert.
    pub source: String,
    /// Creation time.
    pub created_at: DateTime<Utc>,
    /// Time of the latest coalesced occurrence.
    pub last_seen_at: DateTime<Utc>,
    /// Number of raises folded into this alert.
    pub occurrences: u32,
    /// Whether the alert has been resolved.
    pub resolved: bool,
    /// Resolution time.
    pub resolved_at: Option<DateTime<Utc>>,
    /// Opaque context payload.
    pub related_data: Value,
}

/// Request to raise an alert.
#[derive(Debug, Clone, PartialEq)]
pub struct NewAlert {
    /// Originating subsystem.
    pub category: AlertCategory,
    /// Urgency.
    pub severity: AlertSeverity,
    /// Short title.
    pub title: String,
    /// Detailed message.
    pub message: String,
    /// Component raising the alert.
    pub source: String,
    /// Opaque context payload.
    pub related_data: Value,
}

impl NewAlert {
    /// Build a request with an empty source and payload.
    pub fn new(
        category: AlertCategory,
        severity: AlertSeverity,
        title: impl Into<String>,
        message: impl Into<String>,
    ) -> Self {
        Self {
            category,
            severity,
            title: title.into(),
            message: message.into(),
            source: String::new(),
            related_data: Value::Null,
        }
    }

    /// Set the raising component.
    pub fn source(mut self, source: impl Into<String>) -> Self {
        self.source = source.into();
        self
    }

    /// Attach a context payload.
    pub fn related(mut self, data: Value) -> Self {
        self.related_data = data;
        self
    }
}

/// Criteria applied by [`AlertManager::list`].
#[derive(Debug, Clone, Default, PartialEq, Serialize, Deserialize)]
pub struct AlertFilter {
    /// Only alerts at or above this severity.
    #[serde(default)]
    pub min_severity: Option<AlertSeverity>,
    /// Only alerts of this category.
    #[serde(default)]
    pub category: Option<AlertCategory>,
    /// Only resolved (`true`) or open (`false`) alerts.
    #[serde(default)]
    pub resolved: Option<bool>,
    /// Only alerts raised by this source.
    #[serde(default)]
    pub source: Option<String>,
    /// Keep only the newest `limit` matches.
    #[serde(default)]
    pub limit: Option<usize>,
}

impl AlertFilter {
    /// Filter matching open alerts only.
    pub fn open() -> Self {
        Self {
            resolved: Some(false),
            ..Self::default()
        }
    }

    /// Whether `alert` satisfies every populated criterion.
    pub fn matches(&self, alert: &Alert) -> bool {
        self.min_severity.map_or(true, |min| alert.severity >= min)
            && self.category.map_or(true, |c| alert.category == c)
            && self.resolved.map_or(true, |r| alert.resolved == r)
            && self.source.as_deref().map_or(true, |s| alert.source == s)
    }
}

/// Notification sink invoked synchronously after every raise and resolve.
pub trait AlertSubscriber: Send + Sync {
    /// Receive the alert as it stands after the mutation.
    fn notify(&self, alert: &Alert);
}

impl<F> AlertSubscriber for F
where
    F: Fn(&Alert) + Send + Sync,
{
    fn notify(&self, alert: &Alert) {
        self(alert)
    }
}

/// Subscriber that routes alerts into `tracing`.
#[derive(Debug, Clone, Copy, Default)]
pub struct LoggingSubscriber;

impl AlertSubscriber for LoggingSubscriber {
    fn notify(&self, alert: &Alert) {
        if alert.resolved {
            info!(target: "tmd::resilience::alerts", id = %alert.id, category = %alert.category, title = %alert.title, "alert resolved");
            return;
        }
        match alert.severity {
            AlertSeverity::Critical => error!(
                target: "tmd::resilience::alerts",
                id = %alert.id,
                category = %alert.category,
                source = %alert.source,
                occurrences = alert.occurrences,
                title = %alert.title,
                "{}",
                alert.message
            ),
            AlertSeverity::High | AlertSeverity::Medium => warn!(
                target: "tmd::resilience::alerts",
                id = %alert.id,
                category = %alert.category,
                severity = %alert.severity,
                source = %alert.source,
                occurrences = alert.occurrences,
                title = %alert.title,
                "{}",
                alert.message
            ),
            AlertSeverity::Low => info!(
                target: "tmd::resilience::alerts",
                id = %alert.id,
                category = %alert.category,
                source = %alert.source,
                title = %alert.title,
                "{}",
                alert.message
            ),
        }
    }
}

/// Owns every alert in a bounded, creation-ordered ring buffer.
pub struct AlertManager {
    capacity: usize,
    coalesce_window: Duration,
    clock: SharedClock,
    alerts: Mutex<VecDeque<Alert>>,
    subscribers: RwLock<Vec<Arc<dyn AlertSubscriber>>>,
    metrics: Option<ResilienceMetrics>,
}

impl AlertManager {
    /// Create a manager holding at most `capacity` alerts.
    pub fn new(capacity: usize, coalesce_window: Duration) -> Self {
        Self {
            capacity: capacity.max(1),
            coalesce_window,
            clock: SystemClock::shared(),
            alerts: Mutex::new(VecDeque::with_capacity(capacity.max(1))),
            subscribers: RwLock::new(Vec::new()),
            metrics: None,
        }
    }

    /// Use `clock` for timestamps and the coalescing window.
    pub fn with_clock(mut self, clock: SharedClock) -> Self {
        self.clock = clock;
        self
    }

    /// Record raises and resolutions on `metrics`.
    pub fn with_metrics(mut self, metrics: ResilienceMetrics) -> Self {
        self.metrics = Some(metrics);
        self
    }

    /// Configured capacity.
    pub fn capacity(&self) -> usize {
        self.capacity
    }

    /// Raise an alert, coalescing it into a matching open alert seen within the window.
    pub fn raise(&self, request: NewAlert) -> Alert {
        let now = self.clock.now();
        let window = chrono::Duration::from_std(self.coalesce_window)
            .unwrap_or_else(|_| chrono::Duration::zero());

        let (alert, coalesced) = {
            let mut alerts = self.alerts.lock();
            let existing = alerts.iter_mut().rev().find(|alert| {
                !alert.resolved
                    && alert.category == request.category
                    && alert.title == request.title
                    && now - alert.last_seen_at <= window
            });
            match existing {
                Some(alert) => {
                    alert.occurrences = alert.occurrences.saturating_add(1);
                    alert.last_seen_at = now;
                    (alert.clone(), true)
                }
                None => {
                    let alert = Alert {
                        id: Uuid::new_v4(),
                        category: request.category,
                        severity: request.severity,
                        title: request.title,
                        message: request.message,
                        source: request.source,
                        created_at: now,
                        last_seen_at: now,
                        occurrences: 1,
                        resolved: false,
                        resolved_at: None,
                        related_data: request.related_data,
                    };
                    while alerts.len() >= self.capacity {
                        if let Some(evicted) = alerts.pop_front() {
                            debug!(target: "tmd::resilience::alerts", id = %evicted.id, title = %evicted.title, "alert evicted at capacity");
                        }
                    }
                    alerts.push_back(alert.clone());
                    (alert, false)
                }
            }
        };

        if let Some(metrics) = &self.metrics {
            metrics.record_alert(&alert, coalesced);
        }
        self.notify(&alert);
        alert
    }

    /// Resolve the alert with `id`. Returns `false` when unknown or already resolved.
    pub fn resolve(&self, id: Uuid) -> bool {
        let now = self.clock.now();
        let resolved = {
            let mut alerts = self.alerts.lock();
            alerts
                .iter_mut()
                .find(|alert| alert.id == id && !alert.resolved)
                .map(|alert| {
                    alert.resolved = true;
                    alert.resolved_at = Some(now);
                    alert.clone()
                })
        };
        match resolved {
            Some(alert) => {
                self.notify(&alert);
                true
            }
            None => false,
        }
    }

    /// Resolve every open alert with the given coalescing key, returning how many were resolved.
    pub fn resolve_matching(&self, category: AlertCategory, title: &str) -> usize {
        let now = self.clock.now();
        let resolved: Vec<Alert> = {
            let mut alerts = self.alerts.lock();
            alerts
                .iter_mut()
                .filter(|alert| !alert.resolved && alert.category == category && alert.title == title)
                .map(|alert| {
                    alert.resolved = true;
                    alert.resolved_at = Some(now);
                    alert.clone()
                })
                .collect()
        };
        for alert in &resolved {
            self.notify(alert);
        }
        resolved.len()
    }

    /// Snapshot of alerts in creation order, optionally filtered.
    pub fn list(&self, filter: Option<&AlertFilter>) -> Vec<Alert> {
        let alerts = self.alerts.lock();
        let Some(filter) = filter else {
            return alerts.iter().cloned().collect();
        };
        let mut matched: Vec<Alert> = alerts
            .iter()
            .filter(|alert| filter.matches(alert))
            .cloned()
            .collect();
        if let Some(limit) = filter.limit {
            let skip = matched.len().saturating_sub(limit);
            matched.drain(..skip);
        }
        matched
    }

    /// Look up a single alert.
    pub fn get(&self, id: Uuid) -> Option<Alert> {
        self.alerts.lock().iter().find(|alert| alert.id == id).cloned()
    }

    /// Number of unresolved alerts.
    pub fn open_count(&self) -> usize {
        self.alerts.lock().iter().filter(|alert| !alert.resolved).count()
    }

    /// Number of stored alerts.
    pub fn len(&self) -> usize {
        self.alerts.lock().len()
    }

    /// Whether no alert is stored.
    pub fn is_empty(&self) -> bool {
        self.alerts.lock().is_empty()
    }

    /// Register a subscriber notified after every raise and resolve.
    pub fn subscribe(&self, subscriber: Arc<dyn AlertSubscriber>) {
        self.subscribers.write().push(subscriber);
    }

    fn notify(&self, alert: &Alert) {
        let subscribers = self.subscribers.read().clone();
        for subscriber in subscribers {
            if let Err(panic) = catch_unwind(AssertUnwindSafe(|| subscriber.notify(alert))) {
                warn!(
                    target: "tmd::resilience::alerts",
                    id = %alert.id,
                    error = %panic_message(panic.as_ref()),
                    "alert subscriber panicked",
                );
            }
        }
    }
}

impl fmt::Debug for AlertManager {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.debug_struct("AlertManager")
            .field("capacity", &self.capacity)
            .field("coalesce_window", &self.coalesce_window)
            .field("stored", &self.len())
            .finish_non_exhaustive()
    }
}

#[cfg(test)]
mod tests {
    use std::sync::atomic::{AtomicUsize, Ordering};

    use tmd_common::time::ManualClock;

    use super::*;

    fn manager(capacity: usize) -> (AlertManager, Arc<ManualClock>) {
        let clock = Arc::new(ManualClock::default());
        let manager =
            AlertManager::new(capacity, Duration::from_secs(60)).with_clock(clock.clone());
        (manager, clock)
    }

    fn alert(title: &str) -> NewAlert {
        NewAlert::new(AlertCategory::Health, AlertSeverity::Medium, title, "probe failing")
            .source("test")
    }

    #[test]
    fn capacity_evicts_oldest_first() {
        let (manager, _) = manager(2);
        manager.raise(alert("X"));
        manager.raise(alert("Y"));
        manager.raise(alert("Z"));
        let titles: Vec<_> = manager.list(None).into_iter().map(|a| a.title).collect();
        assert_eq!(titles, vec!["Y", "Z"]);
    }

    #[test]
    fn identical_alerts_coalesce_within_window() {
        let (manager, clock) = manager(10);
        let first = manager.raise(alert("endpoint down"));
        clock.advance(Duration::from_secs(10));
        let second = manager.raise(alert("endpoint down"));
        assert_eq!(first.id, second.id);
        assert_eq!(second.occurrences, 2);
        assert_eq!(manager.len(), 1);

        clock.advance(Duration::from_secs(61));
        let third = manager.raise(alert("endpoint down"));
        assert_ne!(third.id, first.id);
        assert_eq!(manager.len(), 2);
    }

    #[test]
    fn resolved_alerts_do_not_absorb_new_raises() {
        let (manager, _) = manager(10);
        let first = manager.raise(alert("endpoint down"));
        assert!(manager.resolve(first.id));
        assert!(!manager.resolve(first.id));
        let second = manager.raise(alert("endpoint down"));
        assert_ne!(first.id, second.id);
        assert_eq!(manager.open_count(), 1);
    }

    #[test]
    fn filter_by_severity_category_and_limit() {
        let (manager, _) = manager(10);
        manager.raise(alert("a"));
        manager.raise(NewAlert::new(
            AlertCategory::Workflow,
            AlertSeverity::Critical,
            "gate",
            "rejected",
        ));
        manager.raise(alert("b"));
        let filter = AlertFilter {
            min_severity: Some(AlertSeverity::High),
            ..AlertFilter::default()
        };
        let critical = manager.list(Some(&filter));
        assert_eq!(critical.len(), 1);
        assert_eq!(critical[0].title, "gate");

        let health_latest = manager.list(Some(&AlertFilter {
            category: Some(AlertCategory::Health),
            limit: Some(1),
            ..AlertFilter::default()
        }));
        assert_eq!(health_latest.len(), 1);
        assert_eq!(health_latest[0].title, "b");
    }

    #[test]
    fn panicking_subscriber_does_not_block_others() {
        let (manager, _) = manager(10);
        let seen = Arc::new(AtomicUsize::new(0));
        manager.subscribe(Arc::new(|_: &Alert| panic!("sink offline")));
        let counter = seen.clone();
        manager.subscribe(Arc::new(move |_: &Alert| {
            counter.fetch_add(1, Ordering::SeqCst);
        }));

        let raised = manager.raise(alert("x"));
        manager.resolve(raised.id);
        assert_eq!(seen.load(Ordering::SeqCst), 2);
        assert!(manager.get(raised.id).map(|a| a.resolved).unwrap_or(false));
    }

    #[test]
    fn resolve_matching_closes_open_alerts_only() {
        let (manager, _) = manager(10);
        manager.raise(alert("probe down"));
        manager.raise(alert("other"));
        assert_eq!(manager.resolve_matching(AlertCategory::Health, "probe down"), 1);
        assert_eq!(manager.resolve_matching(AlertCategory::Health, "probe down"), 0);
        assert_eq!(manager.open_count(), 1);
    }
}
