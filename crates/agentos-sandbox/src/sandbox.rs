//! Per-plugin isolation context.
//!
//! A [`Sandbox`] is bound 1:1 to a loaded plugin. It records the capability
//! allow-list and resource ceilings, owns the plugin-scoped data store, and
//! keeps the usage counters the performance monitor samples. All counters are
//! atomics so sampling never waits on a running guest call.

use std::collections::{BTreeSet, HashMap};
use std::sync::atomic::{AtomicBool, AtomicU64, AtomicUsize, Ordering};
use std::sync::{Arc, Mutex};
use std::time::{Duration, Instant};

use chrono::{DateTime, Utc};
use serde::Serialize;

use crate::capability::{HostApi, SandboxOptions};
use crate::config::ResourceLimits;
use crate::error::{Result, SandboxError};

/// Raw resource counters of one sandbox at a point in time.
#[derive(Debug, Clone, Copy)]
pub struct UsageSnapshot {
    /// Current size of the guest linear memory.
    pub memory_bytes: u64,
    /// Cumulative time spent executing guest code.
    pub busy_time: Duration,
    /// Cumulative bytes moved through the network primitive.
    pub network_bytes: u64,
    /// Current size of the plugin-scoped data store.
    pub storage_bytes: u64,
    /// Number of guest calls made so far.
    pub calls: u64,
    /// Number of guest calls that trapped.
    pub traps: u64,
    /// When the snapshot was taken.
    pub taken_at: Instant,
}

#[derive(Default)]
struct UsageCounters {
    memory_bytes: AtomicU64,
    busy_nanos: AtomicU64,
    network_bytes: AtomicU64,
    storage_bytes: AtomicU64,
    calls: AtomicU64,
    traps: AtomicU64,
}

/// Isolation context of a single plugin.
pub struct Sandbox {
    plugin_id: String,
    allowed_apis: BTreeSet<HostApi>,
    resource_limits: ResourceLimits,
    network_access: bool,
    file_system_access: bool,
    created_at: DateTime<Utc>,
    closed: AtomicBool,
    in_flight: AtomicUsize,
    usage: UsageCounters,
    data: Mutex<HashMap<String, Vec<u8>>>,
}

impl std::fmt::Debug for Sandbox {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.debug_struct("Sandbox")
            .field("plugin_id", &self.plugin_id)
            .field("allowed_apis", &self.allowed_apis)
            .field("resource_limits", &self.resource_limits)
            .field("network_access", &self.network_access)
            .field("file_system_access", &self.file_system_access)
            .field("closed", &self.is_closed())
            .finish()
    }
}

/// Serializable description of a sandbox, for reporting.
#[derive(Debug, Clone, Serialize)]
#[serde(rename_all = "camelCase")]
pub struct SandboxSummary {
    pub plugin_id: String,
    #[serde(rename = "allowedAPIs")]
    pub allowed_apis: Vec<HostApi>,
    pub resource_limits: ResourceLimits,
    pub network_access: bool,
    pub file_system_access: bool,
    pub created_at: DateTime<Utc>,
}

impl Sandbox {
    pub(crate) fn new(plugin_id: &str, options: &SandboxOptions) -> Self {
        Self {
            plugin_id: plugin_id.to_owned(),
            allowed_apis: options.effective_apis(),
            resource_limits: options.resource_limits,
            network_access: options.network_access,
            file_system_access: options.file_system_access,
            created_at: Utc::now(),
            closed: AtomicBool::new(false),
            in_flight: AtomicUsize::new(0),
            usage: UsageCounters::default(),
            data: Mutex::new(HashMap::new()),
        }
    }

    /// The plugin this sandbox belongs to.
    pub fn plugin_id(&self) -> &str {
        &self.plugin_id
    }

    /// The effective capability allow-list.
    pub fn allowed_apis(&self) -> &BTreeSet<HostApi> {
        &self.allowed_apis
    }

    /// Whether the given capability is granted.
    pub fn allows(&self, api: HostApi) -> bool {
        self.allowed_apis.contains(&api)
    }

    /// The resource ceilings assigned at creation.
    pub fn resource_limits(&self) -> &ResourceLimits {
        &self.resource_limits
    }

    pub fn network_access(&self) -> bool {
        self.network_access
    }

    pub fn file_system_access(&self) -> bool {
        self.file_system_access
    }

    pub fn created_at(&self) -> DateTime<Utc> {
        self.created_at
    }

    /// Whether the sandbox stopped accepting new calls.
    pub fn is_closed(&self) -> bool {
        self.closed.load(Ordering::SeqCst)
    }

    /// Number of guest calls currently executing.
    pub fn in_flight(&self) -> usize {
        self.in_flight.load(Ordering::SeqCst)
    }

    /// Snapshot of the usage counters.
    pub fn usage(&self) -> UsageSnapshot {
        UsageSnapshot {
            memory_bytes: self.usage.memory_bytes.load(Ordering::Relaxed),
            busy_time: Duration::from_nanos(self.usage.busy_nanos.load(Ordering::Relaxed)),
            network_bytes: self.usage.network_bytes.load(Ordering::Relaxed),
            storage_bytes: self.usage.storage_bytes.load(Ordering::Relaxed),
            calls: self.usage.calls.load(Ordering::Relaxed),
            traps: self.usage.traps.load(Ordering::Relaxed),
            taken_at: Instant::now(),
        }
    }

    pub fn summary(&self) -> SandboxSummary {
        SandboxSummary {
            plugin_id: self.plugin_id.clone(),
            allowed_apis: self.allowed_apis.iter().copied().collect(),
            resource_limits: self.resource_limits,
            network_access: self.network_access,
            file_system_access: self.file_system_access,
            created_at: self.created_at,
        }
    }

    /// Register a new guest call. The returned guard keeps the in-flight
    /// count raised until it is dropped.
    pub fn enter(self: &Arc<Self>) -> Result<CallGuard> {
        self.in_flight.fetch_add(1, Ordering::SeqCst);
        // Re-check after incrementing so a concurrent close either sees this
        // call in flight or this call sees the close.
        if self.is_closed() {
            self.in_flight.fetch_sub(1, Ordering::SeqCst);
            return Err(SandboxError::Closed {
                plugin_id: self.plugin_id.clone(),
            });
        }
        Ok(CallGuard {
            sandbox: Arc::clone(self),
        })
    }

    /// Stop accepting new calls. Calls already in flight continue.
    pub fn close(&self) {
        if !self.closed.swap(true, Ordering::SeqCst) {
            tracing::debug!(plugin_id = %self.plugin_id, "sandbox closed to new calls");
        }
    }

    /// Wait until no call is in flight, up to `timeout`.
    ///
    /// Returns `true` if the sandbox drained in time.
    pub async fn wait_idle(&self, timeout: Duration) -> bool {
        let deadline = Instant::now() + timeout;
        loop {
            if self.in_flight() == 0 {
                return true;
            }
            if Instant::now() >= deadline {
                tracing::warn!(
                    plugin_id = %self.plugin_id,
                    in_flight = self.in_flight(),
                    "sandbox did not drain before timeout"
                );
                return false;
            }
            tokio::time::sleep(Duration::from_millis(5)).await;
        }
    }

    /// Close the sandbox and drop everything it holds.
    pub(crate) fn release(&self) {
        self.close();
        match self.data.lock() {
            Ok(mut data) => data.clear(),
            Err(poisoned) => poisoned.into_inner().clear(),
        }
        self.usage.storage_bytes.store(0, Ordering::Relaxed);
        self.usage.memory_bytes.store(0, Ordering::Relaxed);
    }

    pub(crate) fn record_call(&self, elapsed: Duration, memory_bytes: u64, trapped: bool) {
        let nanos = u64::try_from(elapsed.as_nanos()).unwrap_or(u64::MAX);
        self.usage.busy_nanos.fetch_add(nanos, Ordering::Relaxed);
        self.usage.memory_bytes.store(memory_bytes, Ordering::Relaxed);
        self.usage.calls.fetch_add(1, Ordering::Relaxed);
        if trapped {
            self.usage.traps.fetch_add(1, Ordering::Relaxed);
        }
    }

    pub(crate) fn record_memory(&self, memory_bytes: u64) {
        self.usage.memory_bytes.store(memory_bytes, Ordering::Relaxed);
    }

    pub(crate) fn record_network(&self, bytes: u64) {
        self.usage.network_bytes.fetch_add(bytes, Ordering::Relaxed);
    }

    pub(crate) fn data_get(&self, key: &str) -> Option<Vec<u8>> {
        let data = self.data.lock().unwrap_or_else(|p| p.into_inner());
        data.get(key).cloned()
    }

    pub(crate) fn data_set(&self, key: String, value: Vec<u8>) {
        let mut data = self.data.lock().unwrap_or_else(|p| p.into_inner());
        data.insert(key, value);
        let total: usize = data.iter().map(|(k, v)| k.len() + v.len()).sum();
        self.usage
            .storage_bytes
            .store(total as u64, Ordering::Relaxed);
    }
}

/// Keeps a sandbox's in-flight count raised for the duration of one call.
#[derive(Debug)]
pub struct CallGuard {
    sandbox: Arc<Sandbox>,
}

impl Drop for CallGuard {
    fn drop(&mut self) {
        self.sandbox.in_flight.fetch_sub(1, Ordering::SeqCst);
    }
}
