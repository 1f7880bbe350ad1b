//! Performance monitor.
//!
//! [`PerformanceMonitor`] keeps a [`PerformanceMetrics`] record per monitored
//! plugin. A background task per plugin samples the plugin's sandbox through a
//! [`UsageSource`] on a fixed interval, turns raw counters into usage figures,
//! and compares them against the plugin's [`ResourceLimits`]:
//!
//! - memory: guest linear memory size, MiB
//! - cpu: busy time inside guest code over wall time since the last sample
//! - network: bytes through the network primitive per second, KiB/s
//! - storage: size of the plugin-scoped data store, MiB
//!
//! Every exceeding sample increments that resource's violation counter and
//! emits one `resourceViolation` event. When a counter reaches the severe
//! threshold exactly, one `severeViolation` is emitted. Nothing is enforced
//! here: acting on a severe violation is host policy.

use std::collections::{BTreeMap, HashMap};
use std::fmt;
use std::sync::{Arc, Weak};
use std::time::Duration;

use agentos_sandbox::{ResourceLimits, SandboxManager, UsageSnapshot};
use chrono::{DateTime, Utc};
use dashmap::DashMap;
use serde::{Deserialize, Serialize};
use tokio::task::JoinHandle;
use tokio::time::MissedTickBehavior;

use crate::config::MonitorConfig;
use crate::error::PluginError;
use crate::events::{EventBus, EventKind};

const MIB: f64 = 1024.0 * 1024.0;

/// Provides raw usage counters for a plugin.
pub trait UsageSource: Send + Sync {
    /// Current counters, or `None` if the plugin has no live sandbox.
    fn snapshot(&self, plugin_id: &str) -> Option<UsageSnapshot>;
}

impl UsageSource for SandboxManager {
    fn snapshot(&self, plugin_id: &str) -> Option<UsageSnapshot> {
        self.usage(plugin_id)
    }
}

/// A monitored resource.
#[derive(Debug, Clone, Copy, PartialEq, Eq, PartialOrd, Ord, Hash, Serialize, Deserialize)]
#[serde(rename_all = "camelCase")]
pub enum ResourceKind {
    Memory,
    Cpu,
    Network,
    Storage,
    ExecutionTime,
}

impl ResourceKind {
    pub const ALL: [ResourceKind; 5] = [
        Self::Memory,
        Self::Cpu,
        Self::Network,
        Self::Storage,
        Self::ExecutionTime,
    ];

    pub fn as_str(self) -> &'static str {
        match self {
            Self::Memory => "memory",
            Self::Cpu => "cpu",
            Self::Network => "network",
            Self::Storage => "storage",
            Self::ExecutionTime => "executionTime",
        }
    }

    fn limit(self, limits: &ResourceLimits) -> f64 {
        match self {
            Self::Memory => limits.max_memory_mb as f64,
            Self::Cpu => limits.max_cpu_percent,
            Self::Network => limits.max_network_bandwidth_kbps as f64,
            Self::Storage => limits.max_storage_mb as f64,
            Self::ExecutionTime => limits.max_execution_time_ms as f64,
        }
    }

    fn usage(self, metrics: &PerformanceMetrics) -> f64 {
        match self {
            Self::Memory => metrics.memory_usage_mb,
            Self::Cpu => metrics.cpu_usage_percent,
            Self::Network => metrics.network_usage_kb,
            Self::Storage => metrics.storage_usage_mb,
            Self::ExecutionTime => metrics.intent_handling_time_ms,
        }
    }
}

impl fmt::Display for ResourceKind {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.write_str(self.as_str())
    }
}

/// Alerting thresholds for one plugin.
#[derive(Debug, Clone, Copy, PartialEq)]
pub struct AlertThresholds {
    /// Usage share of a limit, in percent, at which a warning alert is raised.
    pub warning_percent: f64,
    /// Usage share of a limit, in percent, at which a critical alert is raised.
    pub critical_percent: f64,
    /// Violation count of one resource at which `severeViolation` fires.
    pub severe_violation_count: u32,
}

impl Default for AlertThresholds {
    fn default() -> Self {
        Self {
            warning_percent: 80.0,
            critical_percent: 95.0,
            severe_violation_count: 5,
        }
    }
}

/// Latest usage figures of one plugin.
#[derive(Debug, Clone, PartialEq, Serialize)]
#[serde(rename_all = "camelCase")]
pub struct PerformanceMetrics {
    #[serde(rename = "memoryUsageMB")]
    pub memory_usage_mb: f64,
    pub cpu_usage_percent: f64,
    /// Network throughput over the last sample window, KiB/s.
    #[serde(rename = "networkUsageKB")]
    pub network_usage_kb: f64,
    #[serde(rename = "storageUsageMB")]
    pub storage_usage_mb: f64,
    /// Duration of the most recent intent call.
    pub intent_handling_time_ms: f64,
    pub average_intent_handling_time_ms: f64,
    pub intents_handled: u64,
    pub error_count: u64,
    pub last_error: Option<String>,
    pub last_updated: DateTime<Utc>,
}

impl PerformanceMetrics {
    fn new() -> Self {
        Self {
            memory_usage_mb: 0.0,
            cpu_usage_percent: 0.0,
            network_usage_kb: 0.0,
            storage_usage_mb: 0.0,
            intent_handling_time_ms: 0.0,
            average_intent_handling_time_ms: 0.0,
            intents_handled: 0,
            error_count: 0,
            last_error: None,
            last_updated: Utc::now(),
        }
    }
}

#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize)]
#[serde(rename_all = "lowercase")]
pub enum AlertLevel {
    Warning,
    Critical,
}

/// A plugin close to (or over) one of its limits.
#[derive(Debug, Clone, PartialEq, Serialize)]
#[serde(rename_all = "camelCase")]
pub struct Alert {
    pub plugin_id: String,
    pub resource: ResourceKind,
    pub level: AlertLevel,
    pub usage: f64,
    pub limit: f64,
    /// `usage / limit`, in percent.
    pub percent: f64,
}

/// Monitoring state of one plugin, for reporting.
#[derive(Debug, Clone, Serialize)]
#[serde(rename_all = "camelCase")]
pub struct PluginReport {
    pub plugin_id: String,
    pub limits: ResourceLimits,
    pub metrics: PerformanceMetrics,
    pub violations: BTreeMap<ResourceKind, u32>,
}

struct MonitoredPlugin {
    limits: ResourceLimits,
    thresholds: AlertThresholds,
    metrics: PerformanceMetrics,
    violations: HashMap<ResourceKind, u32>,
    /// Baseline for rate computations.
    last_sample: Option<UsageSnapshot>,
    total_handling_ms: f64,
    task: Option<JoinHandle<()>>,
}

impl MonitoredPlugin {
    /// Count one violation and return the events it produces.
    fn violate(&mut self, plugin_id: &str, resource: ResourceKind, value: f64) -> Vec<EventKind> {
        let limit = resource.limit(&self.limits);
        let count = self.violations.entry(resource).or_insert(0);
        *count += 1;
        let count = *count;

        tracing::warn!(
            plugin_id,
            resource = %resource,
            value,
            limit,
            count,
            "resource limit exceeded"
        );

        let mut events = vec![EventKind::ResourceViolation {
            resource,
            value,
            limit,
            count,
        }];
        if count == self.thresholds.severe_violation_count {
            tracing::warn!(plugin_id, resource = %resource, count, "severe resource violation");
            events.push(EventKind::SevereViolation { resource, count });
        }
        events
    }
}

struct MonitorInner {
    source: Arc<dyn UsageSource>,
    events: EventBus,
    interval: Duration,
    default_thresholds: AlertThresholds,
    plugins: DashMap<String, MonitoredPlugin>,
}

impl Drop for MonitorInner {
    fn drop(&mut self) {
        for entry in self.plugins.iter() {
            if let Some(task) = &entry.task {
                task.abort();
            }
        }
    }
}

/// Per-plugin resource sampler and violation escalator.
///
/// Cheaply cloneable; clones share state.
#[derive(Clone)]
pub struct PerformanceMonitor {
    inner: Arc<MonitorInner>,
}

impl PerformanceMonitor {
    pub fn new(
        source: Arc<dyn UsageSource>,
        events: EventBus,
        interval: Duration,
        thresholds: AlertThresholds,
    ) -> Self {
        Self {
            inner: Arc::new(MonitorInner {
                source,
                events,
                interval,
                default_thresholds: thresholds,
                plugins: DashMap::new(),
            }),
        }
    }

    pub fn from_config(source: Arc<dyn UsageSource>, events: EventBus, config: &MonitorConfig) -> Self {
        Self::new(source, events, config.sample_interval(), config.thresholds())
    }

    pub fn interval(&self) -> Duration {
        self.inner.interval
    }

    /// Start monitoring `plugin_id` against `limits`.
    ///
    /// Restarting an already monitored plugin resets its metrics and
    /// violation counters. Periodic sampling needs a tokio runtime; without
    /// one only explicit [`sample`](Self::sample) calls update metrics.
    pub fn start_monitoring(
        &self,
        plugin_id: &str,
        limits: ResourceLimits,
        thresholds: Option<AlertThresholds>,
    ) {
        let task = self.spawn_sampler(plugin_id);
        let entry = MonitoredPlugin {
            limits,
            thresholds: thresholds.unwrap_or(self.inner.default_thresholds),
            metrics: PerformanceMetrics::new(),
            violations: HashMap::new(),
            last_sample: self.inner.source.snapshot(plugin_id),
            total_handling_ms: 0.0,
            task,
        };

        if let Some(previous) = self.inner.plugins.insert(plugin_id.to_owned(), entry) {
            if let Some(task) = previous.task {
                task.abort();
            }
            tracing::debug!(plugin_id, "monitoring restarted with a clean slate");
        }

        tracing::info!(
            plugin_id,
            interval_ms = self.inner.interval.as_millis() as u64,
            "performance monitoring started"
        );
        self.inner.events.emit(plugin_id, EventKind::MonitoringStarted);
    }

    /// Stop monitoring and drop all state for `plugin_id`.
    ///
    /// Returns whether the plugin was monitored.
    pub fn stop_monitoring(&self, plugin_id: &str) -> bool {
        let Some((_, entry)) = self.inner.plugins.remove(plugin_id) else {
            tracing::trace!(plugin_id, "stop requested for unmonitored plugin, ignored");
            return false;
        };
        if let Some(task) = entry.task {
            task.abort();
        }
        tracing::info!(plugin_id, "performance monitoring stopped");
        self.inner.events.emit(plugin_id, EventKind::MonitoringStopped);
        true
    }

    pub fn is_monitoring(&self, plugin_id: &str) -> bool {
        self.inner.plugins.contains_key(plugin_id)
    }

    /// Ids of every monitored plugin, sorted.
    pub fn monitored_ids(&self) -> Vec<String> {
        let mut ids: Vec<String> = self.inner.plugins.iter().map(|e| e.key().clone()).collect();
        ids.sort();
        ids
    }

    /// Run one sampling pass for `plugin_id` and return the updated metrics.
    ///
    /// Returns `None` if the plugin is not monitored or has no live sandbox.
    pub fn sample(&self, plugin_id: &str) -> Option<PerformanceMetrics> {
        let Some(snapshot) = self.inner.source.snapshot(plugin_id) else {
            tracing::trace!(plugin_id, "no usage available, sample skipped");
            return None;
        };

        let (metrics, events) = {
            let mut entry = self.inner.plugins.get_mut(plugin_id)?;
            let entry = &mut *entry;

            let (cpu, network) = match entry.last_sample {
                Some(previous) => {
                    let wall = snapshot
                        .taken_at
                        .saturating_duration_since(previous.taken_at)
                        .as_secs_f64();
                    if wall > 0.0 {
                        let busy = snapshot
                            .busy_time
                            .saturating_sub(previous.busy_time)
                            .as_secs_f64();
                        let bytes = snapshot.network_bytes.saturating_sub(previous.network_bytes);
                        (busy / wall * 100.0, bytes as f64 / 1024.0 / wall)
                    } else {
                        (0.0, 0.0)
                    }
                }
                None => (0.0, 0.0),
            };
            entry.last_sample = Some(snapshot);

            let metrics = &mut entry.metrics;
            metrics.memory_usage_mb = snapshot.memory_bytes as f64 / MIB;
            metrics.cpu_usage_percent = cpu;
            metrics.network_usage_kb = network;
            metrics.storage_usage_mb = snapshot.storage_bytes as f64 / MIB;
            metrics.last_updated = Utc::now();

            tracing::debug!(
                plugin_id,
                memory_mb = metrics.memory_usage_mb,
                cpu_percent = metrics.cpu_usage_percent,
                network_kbps = metrics.network_usage_kb,
                storage_mb = metrics.storage_usage_mb,
                "plugin sampled"
            );

            let sampled = [
                ResourceKind::Memory,
                ResourceKind::Cpu,
                ResourceKind::Network,
                ResourceKind::Storage,
            ];
            let mut events = Vec::new();
            for resource in sampled {
                let value = resource.usage(&entry.metrics);
                if value > resource.limit(&entry.limits) {
                    events.extend(entry.violate(plugin_id, resource, value));
                }
            }
            (entry.metrics.clone(), events)
        };

        for event in events {
            self.inner.events.emit(plugin_id, event);
        }
        Some(metrics)
    }

    /// Record the duration of one intent call.
    ///
    /// A call longer than `maxExecutionTimeMs` counts as an execution-time
    /// violation.
    pub fn record_intent_handling(&self, plugin_id: &str, duration: Duration) {
        let events = {
            let Some(mut entry) = self.inner.plugins.get_mut(plugin_id) else {
                tracing::trace!(plugin_id, "intent timing for unmonitored plugin, ignored");
                return;
            };
            let entry = &mut *entry;
            let ms = duration.as_secs_f64() * 1000.0;
            entry.total_handling_ms += ms;
            let metrics = &mut entry.metrics;
            metrics.intent_handling_time_ms = ms;
            metrics.intents_handled += 1;
            metrics.average_intent_handling_time_ms =
                entry.total_handling_ms / metrics.intents_handled as f64;
            metrics.last_updated = Utc::now();

            if ms > entry.limits.max_execution_time_ms as f64 {
                entry.violate(plugin_id, ResourceKind::ExecutionTime, ms)
            } else {
                Vec::new()
            }
        };
        for event in events {
            self.inner.events.emit(plugin_id, event);
        }
    }

    /// Record a failed plugin call and emit `plugin:error`.
    pub fn record_error(&self, plugin_id: &str, error: &PluginError) {
        {
            let Some(mut entry) = self.inner.plugins.get_mut(plugin_id) else {
                tracing::trace!(plugin_id, "error for unmonitored plugin, ignored");
                return;
            };
            entry.metrics.error_count += 1;
            entry.metrics.last_error = Some(error.to_string());
            entry.metrics.last_updated = Utc::now();
        }
        tracing::debug!(plugin_id, code = error.code(), error = %error, "plugin error recorded");
        self.inner.events.emit(
            plugin_id,
            EventKind::Error {
                code: error.code().to_owned(),
                message: error.to_string(),
            },
        );
    }

    pub fn get_metrics(&self, plugin_id: &str) -> Option<PerformanceMetrics> {
        self.inner
            .plugins
            .get(plugin_id)
            .map(|entry| entry.metrics.clone())
    }

    /// Violations counted for one resource since monitoring started.
    pub fn violation_count(&self, plugin_id: &str, resource: ResourceKind) -> u32 {
        self.inner
            .plugins
            .get(plugin_id)
            .and_then(|entry| entry.violations.get(&resource).copied())
            .unwrap_or(0)
    }

    /// Whether the latest figures exceed any limit.
    pub fn is_exceeding_limits(&self, plugin_id: &str) -> bool {
        self.inner.plugins.get(plugin_id).is_some_and(|entry| {
            ResourceKind::ALL
                .iter()
                .any(|r| r.usage(&entry.metrics) > r.limit(&entry.limits))
        })
    }

    /// Every resource of every monitored plugin at or above its warning
    /// threshold, sorted by plugin id.
    pub fn get_plugins_approaching_limits(&self) -> Vec<Alert> {
        let mut alerts = Vec::new();
        for entry in self.inner.plugins.iter() {
            let plugin = entry.value();
            for resource in ResourceKind::ALL {
                let limit = resource.limit(&plugin.limits);
                if limit <= 0.0 {
                    continue;
                }
                let usage = resource.usage(&plugin.metrics);
                let percent = usage / limit * 100.0;
                let level = if percent >= plugin.thresholds.critical_percent {
                    AlertLevel::Critical
                } else if percent >= plugin.thresholds.warning_percent {
                    AlertLevel::Warning
                } else {
                    continue;
                };
                alerts.push(Alert {
                    plugin_id: entry.key().clone(),
                    resource,
                    level,
                    usage,
                    limit,
                    percent,
                });
            }
        }
        alerts.sort_by(|a, b| {
            a.plugin_id
                .cmp(&b.plugin_id)
                .then(a.resource.cmp(&b.resource))
        });
        alerts
    }

    /// Limits, metrics, and violation counts of every monitored plugin.
    pub fn report(&self) -> Vec<PluginReport> {
        let mut reports: Vec<PluginReport> = self
            .inner
            .plugins
            .iter()
            .map(|entry| PluginReport {
                plugin_id: entry.key().clone(),
                limits: entry.limits,
                metrics: entry.metrics.clone(),
                violations: entry.violations.iter().map(|(k, v)| (*k, *v)).collect(),
            })
            .collect();
        reports.sort_by(|a, b| a.plugin_id.cmp(&b.plugin_id));
        reports
    }

    fn spawn_sampler(&self, plugin_id: &str) -> Option<JoinHandle<()>> {
        let Ok(runtime) = tokio::runtime::Handle::try_current() else {
            tracing::warn!(plugin_id, "no tokio runtime, periodic sampling disabled");
            return None;
        };
        let weak: Weak<MonitorInner> = Arc::downgrade(&self.inner);
        let period = self.inner.interval;
        let plugin_id = plugin_id.to_owned();

        Some(runtime.spawn(async move {
            let mut ticker = tokio::time::interval(period);
            ticker.set_missed_tick_behavior(MissedTickBehavior::Delay);
            // The first tick completes immediately; the baseline was taken at start.
            ticker.tick().await;
            loop {
                ticker.tick().await;
                let Some(inner) = weak.upgrade() else {
                    break;
                };
                let monitor = PerformanceMonitor { inner };
                if !monitor.is_monitoring(&plugin_id) {
                    break;
                }
                monitor.sample(&plugin_id);
            }
        }))
    }
}

#[cfg(test)]
mod tests {
    use std::sync::Mutex;
    use std::time::Instant;

    use super::*;

    /// Usage source whose counters tests set by hand.
    #[derive(Default)]
    struct FakeSource {
        snapshots: Mutex<HashMap<String, UsageSnapshot>>,
    }

    impl FakeSource {
        fn set(&self, plugin_id: &str, snapshot: UsageSnapshot) {
            self.snapshots
                .lock()
                .unwrap()
                .insert(plugin_id.to_owned(), snapshot);
        }
    }

    impl UsageSource for FakeSource {
        fn snapshot(&self, plugin_id: &str) -> Option<UsageSnapshot> {
            self.snapshots.lock().unwrap().get(plugin_id).copied()
        }
    }

    fn snapshot(at: Instant) -> UsageSnapshot {
        UsageSnapshot {
            memory_bytes: 0,
            busy_time: Duration::ZERO,
            network_bytes: 0,
            storage_bytes: 0,
            calls: 0,
            traps: 0,
            taken_at: at,
        }
    }

    fn monitor(source: Arc<FakeSource>) -> (PerformanceMonitor, EventBus) {
        let bus = EventBus::new(256);
        let monitor = PerformanceMonitor::new(
            source,
            bus.clone(),
            Duration::from_secs(3600),
            AlertThresholds::default(),
        );
        (monitor, bus)
    }

    fn drain(rx: &mut tokio::sync::broadcast::Receiver<Arc<crate::events::PluginEvent>>) -> Vec<&'static str> {
        let mut names = Vec::new();
        while let Ok(event) = rx.try_recv() {
            names.push(event.name());
        }
        names
    }

    #[tokio::test]
    async fn start_and_stop_emit_events() {
        let source = Arc::new(FakeSource::default());
        let (monitor, bus) = monitor(Arc::clone(&source));
        let mut rx = bus.subscribe();

        monitor.start_monitoring("p", ResourceLimits::default(), None);
        assert!(monitor.is_monitoring("p"));
        assert!(monitor.get_metrics("p").is_some());

        assert!(monitor.stop_monitoring("p"));
        assert!(!monitor.stop_monitoring("p"));
        assert!(monitor.get_metrics("p").is_none());
        assert_eq!(drain(&mut rx), vec!["monitoringStarted", "monitoringStopped"]);
    }

    #[tokio::test]
    async fn violations_escalate_once_at_threshold() {
        let source = Arc::new(FakeSource::default());
        let (monitor, bus) = monitor(Arc::clone(&source));
        let mut rx = bus.subscribe();

        let limits = ResourceLimits::new().with_max_memory_mb(1);
        monitor.start_monitoring("hog", limits, None);

        let base = Instant::now();
        for i in 0..7u64 {
            let mut snap = snapshot(base + Duration::from_secs(i + 1));
            snap.memory_bytes = 2 * 1024 * 1024;
            source.set("hog", snap);
            monitor.sample("hog").expect("monitored plugin must sample");
        }

        let names = drain(&mut rx);
        assert_eq!(names.iter().filter(|n| **n == "resourceViolation").count(), 7);
        assert_eq!(names.iter().filter(|n| **n == "severeViolation").count(), 1);
        assert_eq!(monitor.violation_count("hog", ResourceKind::Memory), 7);
        assert_eq!(monitor.violation_count("hog", ResourceKind::Cpu), 0);
        assert!(monitor.is_exceeding_limits("hog"));
    }

    #[tokio::test]
    async fn restart_resets_counters() {
        let source = Arc::new(FakeSource::default());
        let (monitor, _bus) = monitor(Arc::clone(&source));
        let limits = ResourceLimits::new().with_max_storage_mb(1);
        monitor.start_monitoring("p", limits, None);

        let mut snap = snapshot(Instant::now());
        snap.storage_bytes = 5 * 1024 * 1024;
        source.set("p", snap);
        monitor.sample("p");
        monitor.sample("p");
        assert_eq!(monitor.violation_count("p", ResourceKind::Storage), 2);

        monitor.stop_monitoring("p");
        monitor.start_monitoring("p", limits, None);
        assert_eq!(monitor.violation_count("p", ResourceKind::Storage), 0);
        assert_eq!(monitor.get_metrics("p").unwrap().storage_usage_mb, 0.0);
    }

    #[tokio::test]
    async fn cpu_and_network_rates_come_from_deltas() {
        let source = Arc::new(FakeSource::default());
        let (monitor, _bus) = monitor(Arc::clone(&source));

        let base = Instant::now();
        source.set("p", snapshot(base));
        monitor.start_monitoring("p", ResourceLimits::default(), None);

        let mut next = snapshot(base + Duration::from_secs(2));
        next.busy_time = Duration::from_millis(500);
        next.network_bytes = 4096;
        source.set("p", next);

        let metrics = monitor.sample("p").unwrap();
        assert!((metrics.cpu_usage_percent - 25.0).abs() < 1e-9);
        assert!((metrics.network_usage_kb - 2.0).abs() < 1e-9);
        assert!(!monitor.is_exceeding_limits("p"));
    }

    #[tokio::test]
    async fn intent_timing_and_execution_violations() {
        let source = Arc::new(FakeSource::default());
        let (monitor, bus) = monitor(Arc::clone(&source));
        let mut rx = bus.subscribe();
        let limits = ResourceLimits::new().with_max_execution_time_ms(100);
        monitor.start_monitoring("p", limits, None);
        drain(&mut rx);

        monitor.record_intent_handling("p", Duration::from_millis(40));
        monitor.record_intent_handling("p", Duration::from_millis(160));

        let metrics = monitor.get_metrics("p").unwrap();
        assert_eq!(metrics.intents_handled, 2);
        assert!((metrics.average_intent_handling_time_ms - 100.0).abs() < 1e-6);
        assert_eq!(monitor.violation_count("p", ResourceKind::ExecutionTime), 1);
        assert_eq!(drain(&mut rx), vec!["resourceViolation"]);
    }

    #[tokio::test]
    async fn errors_are_counted_and_published() {
        let source = Arc::new(FakeSource::default());
        let (monitor, bus) = monitor(Arc::clone(&source));
        let mut rx = bus.subscribe();
        monitor.start_monitoring("p", ResourceLimits::default(), None);
        drain(&mut rx);

        let err = PluginError::Internal("boom".into());
        monitor.record_error("p", &err);

        let metrics = monitor.get_metrics("p").unwrap();
        assert_eq!(metrics.error_count, 1);
        assert!(metrics.last_error.unwrap().contains("boom"));

        let event = rx.try_recv().unwrap();
        match &event.kind {
            EventKind::Error { code, .. } => assert_eq!(code, "INTERNAL_ERROR"),
            other => panic!("unexpected event: {other:?}"),
        }
    }

    #[test]
    fn unmonitored_calls_are_ignored() {
        let source = Arc::new(FakeSource::default());
        let (monitor, _bus) = monitor(source);
        monitor.record_intent_handling("ghost", Duration::from_secs(10));
        monitor.record_error("ghost", &PluginError::Internal("x".into()));
        assert!(monitor.sample("ghost").is_none());
        assert!(monitor.get_metrics("ghost").is_none());
        assert!(!monitor.is_exceeding_limits("ghost"));
    }

    #[test]
    fn monitoring_without_runtime_still_samples_on_demand() {
        let source = Arc::new(FakeSource::default());
        let (monitor, _bus) = monitor(Arc::clone(&source));
        source.set("p", snapshot(Instant::now()));
        monitor.start_monitoring("p", ResourceLimits::default(), None);
        assert!(monitor.sample("p").is_some());
    }

    #[tokio::test]
    async fn approaching_limits_classifies_alerts() {
        let source = Arc::new(FakeSource::default());
        let (monitor, _bus) = monitor(Arc::clone(&source));
        let limits = ResourceLimits::new()
            .with_max_memory_mb(10)
            .with_max_storage_mb(10);
        monitor.start_monitoring("p", limits, None);

        let mut snap = snapshot(Instant::now());
        snap.memory_bytes = (8.5 * MIB) as u64;
        snap.storage_bytes = (9.8 * MIB) as u64;
        source.set("p", snap);
        monitor.sample("p");

        let alerts = monitor.get_plugins_approaching_limits();
        assert_eq!(alerts.len(), 2);
        assert_eq!(alerts[0].resource, ResourceKind::Memory);
        assert_eq!(alerts[0].level, AlertLevel::Warning);
        assert_eq!(alerts[1].resource, ResourceKind::Storage);
        assert_eq!(alerts[1].level, AlertLevel::Critical);
    }

    #[tokio::test]
    async fn background_task_samples_on_interval() {
        let source = Arc::new(FakeSource::default());
        let bus = EventBus::new(64);
        let mut rx = bus.subscribe();
        let monitor = PerformanceMonitor::new(
            Arc::clone(&source) as Arc<dyn UsageSource>,
            bus,
            Duration::from_millis(10),
            AlertThresholds::default(),
        );

        let mut snap = snapshot(Instant::now());
        snap.memory_bytes = 4 * 1024 * 1024;
        source.set("p", snap);
        monitor.start_monitoring("p", ResourceLimits::new().with_max_memory_mb(1), None);

        let violation = tokio::time::timeout(Duration::from_secs(2), async {
            loop {
                let event = rx.recv().await.expect("bus open");
                if event.name() == "resourceViolation" {
                    return event;
                }
            }
        })
        .await
        .expect("sampler must report a violation");
        assert_eq!(violation.plugin_id, "p");

        monitor.stop_monitoring("p");
    }

    #[test]
    fn report_lists_violations() {
        let source = Arc::new(FakeSource::default());
        let (monitor, _bus) = monitor(Arc::clone(&source));
        monitor.start_monitoring("b", ResourceLimits::default(), None);
        monitor.start_monitoring("a", ResourceLimits::new().with_max_memory_mb(1), None);
        let mut snap = snapshot(Instant::now());
        snap.memory_bytes = 2 * 1024 * 1024;
        source.set("a", snap);
        monitor.sample("a");

        let report = monitor.report();
        assert_eq!(report[0].plugin_id, "a");
        assert_eq!(report[0].violations.get(&ResourceKind::Memory), Some(&1));
        let json = serde_json::to_value(&report).unwrap();
        assert_eq!(json[0]["violations"]["memory"], 1);
        assert_eq!(monitor.monitored_ids(), vec!["a", "b"]);
    }
}
