//! Sandbox configuration.
//!
//! [`ResourceLimits`] are the per-plugin ceilings assigned when a sandbox is
//! created. [`SandboxSettings`] controls engine-wide behaviour shared by every
//! sandbox. Both provide sensible defaults and builder-style setters.

use serde::{Deserialize, Serialize};

/// Resource ceilings assigned to one sandbox for its whole lifetime.
///
/// Ceilings are observed by the performance monitor and reported as
/// violations; they are not preemptively enforced by killing the plugin.
#[derive(Debug, Clone, Copy, PartialEq, Serialize, Deserialize)]
#[serde(default)]
pub struct ResourceLimits {
    /// Maximum guest linear memory, in MiB.
    ///
    /// Default: **128**.
    #[serde(rename = "maxMemoryMB")]
    pub max_memory_mb: u64,

    /// Maximum share of wall-clock time spent executing guest code, in percent.
    ///
    /// Default: **50**.
    #[serde(rename = "maxCPUPercent")]
    pub max_cpu_percent: f64,

    /// Maximum network throughput through the network primitive, in KiB/s.
    ///
    /// Default: **1 024**.
    #[serde(rename = "maxNetworkBandwidthKBps")]
    pub max_network_bandwidth_kbps: u64,

    /// Maximum size of the plugin-scoped data store, in MiB.
    ///
    /// Default: **50**.
    #[serde(rename = "maxStorageMB")]
    pub max_storage_mb: u64,

    /// Advisory ceiling for a single intent handler call, in milliseconds.
    ///
    /// Default: **5 000**.
    #[serde(rename = "maxExecutionTimeMs")]
    pub max_execution_time_ms: u64,
}

impl Default for ResourceLimits {
    fn default() -> Self {
        Self {
            max_memory_mb: 128,
            max_cpu_percent: 50.0,
            max_network_bandwidth_kbps: 1024,
            max_storage_mb: 50,
            max_execution_time_ms: 5000,
        }
    }
}

impl ResourceLimits {
    /// Create limits with default values.
    pub fn new() -> Self {
        Self::default()
    }

    /// Set the memory ceiling (MiB).
    pub fn with_max_memory_mb(mut self, mb: u64) -> Self {
        self.max_memory_mb = mb;
        self
    }

    /// Set the CPU ceiling (percent).
    pub fn with_max_cpu_percent(mut self, percent: f64) -> Self {
        self.max_cpu_percent = percent;
        self
    }

    /// Set the network ceiling (KiB/s).
    pub fn with_max_network_bandwidth_kbps(mut self, kbps: u64) -> Self {
        self.max_network_bandwidth_kbps = kbps;
        self
    }

    /// Set the storage ceiling (MiB).
    pub fn with_max_storage_mb(mut self, mb: u64) -> Self {
        self.max_storage_mb = mb;
        self
    }

    /// Set the advisory execution-time ceiling (ms).
    pub fn with_max_execution_time_ms(mut self, ms: u64) -> Self {
        self.max_execution_time_ms = ms;
        self
    }

    /// Return a copy where every ceiling is at most the matching `ceiling` value.
    pub fn clamped_to(&self, ceiling: &ResourceLimits) -> Self {
        Self {
            max_memory_mb: self.max_memory_mb.min(ceiling.max_memory_mb),
            max_cpu_percent: self.max_cpu_percent.min(ceiling.max_cpu_percent),
            max_network_bandwidth_kbps: self
                .max_network_bandwidth_kbps
                .min(ceiling.max_network_bandwidth_kbps),
            max_storage_mb: self.max_storage_mb.min(ceiling.max_storage_mb),
            max_execution_time_ms: self.max_execution_time_ms.min(ceiling.max_execution_time_ms),
        }
    }
}

/// Engine-wide settings shared by every sandbox.
#[derive(Debug, Clone, Serialize, Deserialize)]
#[serde(default)]
pub struct SandboxSettings {
    /// Fuel (abstract instruction count) granted to each guest call.
    ///
    /// Exhausting it traps the call. This bounds runaway loops independently
    /// of the advisory execution-time ceiling.
    ///
    /// Default: **50 000 000**.
    pub max_fuel_per_call: u64,

    /// Largest payload accepted from or handed to a guest in one transfer.
    ///
    /// Default: **1 MiB**.
    pub max_io_bytes: usize,
}

impl Default for SandboxSettings {
    fn default() -> Self {
        Self {
            max_fuel_per_call: 50_000_000,
            max_io_bytes: 1024 * 1024,
        }
    }
}

impl SandboxSettings {
    /// Create settings with default values.
    pub fn new() -> Self {
        Self::default()
    }

    /// Set the fuel budget per guest call.
    pub fn with_max_fuel_per_call(mut self, fuel: u64) -> Self {
        self.max_fuel_per_call = fuel;
        self
    }

    /// Set the maximum transfer size between host and guest.
    pub fn with_max_io_bytes(mut self, bytes: usize) -> Self {
        self.max_io_bytes = bytes;
        self
    }
}
