//! Host API capabilities.
//!
//! A sandbox is granted a set of [`HostApi`] capabilities. Each capability
//! corresponds to a group of host functions in the `env` import namespace;
//! only granted groups are linked into the guest, so anything else simply does
//! not exist from the plugin's point of view.

use std::collections::BTreeSet;
use std::fmt;

use serde::{Deserialize, Serialize};

use crate::config::ResourceLimits;

/// Import namespace for every host function.
pub const HOST_MODULE: &str = "env";

/// Host functions every guest may import: the call ABI used to move call
/// input and output across the boundary.
pub const CALL_ABI_IMPORTS: &[&str] = &["host_input_len", "host_read_input", "host_set_result"];

/// A host-provided API surface a plugin may be allowed to call.
#[derive(Debug, Clone, Copy, PartialEq, Eq, PartialOrd, Ord, Hash, Serialize, Deserialize)]
#[serde(rename_all = "snake_case")]
pub enum HostApi {
    /// Wall-clock time. Always granted.
    Timers,
    /// Plugin-scoped logging into the host's tracing pipeline. Always granted.
    Logging,
    /// Plugin-scoped key/value data store.
    DataAccess,
    /// Read-only host/system information.
    SystemInfo,
    /// Network requests through the host's network provider.
    Network,
    /// Device/hardware information.
    DeviceInfo,
    /// Read-only access to files inside the plugin directory.
    FileSystem,
}

impl HostApi {
    /// Capabilities every sandbox receives regardless of declared permissions.
    pub const BASELINE: [HostApi; 2] = [HostApi::Timers, HostApi::Logging];

    /// Host function names this capability links into the guest.
    pub fn imports(self) -> &'static [&'static str] {
        match self {
            Self::Timers => &["host_now_ms"],
            Self::Logging => &["host_log"],
            Self::DataAccess => &["host_data_get", "host_data_set"],
            Self::SystemInfo => &["host_system_info"],
            Self::Network => &["host_net_request"],
            Self::DeviceInfo => &["host_device_info"],
            Self::FileSystem => &["host_fs_read"],
        }
    }

    /// Find the capability that provides the named host function.
    pub fn for_import(name: &str) -> Option<HostApi> {
        ALL_APIS
            .iter()
            .copied()
            .find(|api| api.imports().contains(&name))
    }

    /// Short stable name used in logs and manifests.
    pub fn as_str(self) -> &'static str {
        match self {
            Self::Timers => "timers",
            Self::Logging => "logging",
            Self::DataAccess => "data",
            Self::SystemInfo => "system",
            Self::Network => "network",
            Self::DeviceInfo => "device",
            Self::FileSystem => "filesystem",
        }
    }
}

impl fmt::Display for HostApi {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.write_str(self.as_str())
    }
}

const ALL_APIS: [HostApi; 7] = [
    HostApi::Timers,
    HostApi::Logging,
    HostApi::DataAccess,
    HostApi::SystemInfo,
    HostApi::Network,
    HostApi::DeviceInfo,
    HostApi::FileSystem,
];

/// Everything needed to create a sandbox for one plugin.
#[derive(Debug, Clone, Default)]
pub struct SandboxOptions {
    /// Capabilities granted in addition to [`HostApi::BASELINE`].
    pub allowed_apis: BTreeSet<HostApi>,
    /// Ceilings observed by the performance monitor.
    pub resource_limits: ResourceLimits,
    /// Whether the network primitive may be linked.
    pub network_access: bool,
    /// Whether the filesystem API may be linked.
    pub file_system_access: bool,
}

impl SandboxOptions {
    /// Options with only the baseline capabilities and default limits.
    pub fn new() -> Self {
        Self::default()
    }

    /// Grant an additional capability.
    pub fn allow(mut self, api: HostApi) -> Self {
        self.allowed_apis.insert(api);
        self
    }

    /// Set the resource ceilings.
    pub fn with_limits(mut self, limits: ResourceLimits) -> Self {
        self.resource_limits = limits;
        self
    }

    /// Enable or disable the network primitive.
    pub fn with_network_access(mut self, allow: bool) -> Self {
        self.network_access = allow;
        self
    }

    /// Enable or disable the filesystem API.
    pub fn with_file_system_access(mut self, allow: bool) -> Self {
        self.file_system_access = allow;
        self
    }

    /// The effective allow-list: baseline plus granted capabilities, minus
    /// network/filesystem when their access flag is off.
    pub fn effective_apis(&self) -> BTreeSet<HostApi> {
        HostApi::BASELINE
            .iter()
            .chain(self.allowed_apis.iter())
            .copied()
            .filter(|api| match api {
                HostApi::Network => self.network_access,
                HostApi::FileSystem => self.file_system_access,
                _ => true,
            })
            .collect()
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn baseline_is_always_effective() {
        let apis = SandboxOptions::new().effective_apis();
        assert!(apis.contains(&HostApi::Timers));
        assert!(apis.contains(&HostApi::Logging));
        assert_eq!(apis.len(), 2);
    }

    #[test]
    fn network_requires_access_flag() {
        let without = SandboxOptions::new().allow(HostApi::Network);
        assert!(!without.effective_apis().contains(&HostApi::Network));

        let with = without.with_network_access(true);
        assert!(with.effective_apis().contains(&HostApi::Network));
    }

    #[test]
    fn filesystem_requires_access_flag() {
        let opts = SandboxOptions::new()
            .allow(HostApi::FileSystem)
            .with_file_system_access(false);
        assert!(!opts.effective_apis().contains(&HostApi::FileSystem));
    }

    #[test]
    fn import_lookup() {
        assert_eq!(HostApi::for_import("host_data_set"), Some(HostApi::DataAccess));
        assert_eq!(HostApi::for_import("host_net_request"), Some(HostApi::Network));
        assert_eq!(HostApi::for_import("host_read_input"), None);
        assert_eq!(HostApi::for_import("something_else"), None);
    }

    #[test]
    fn display_names() {
        assert_eq!(HostApi::DataAccess.to_string(), "data");
        assert_eq!(HostApi::DeviceInfo.as_str(), "device");
    }
}
