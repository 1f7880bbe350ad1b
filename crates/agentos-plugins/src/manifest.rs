//! Plugin manifest (`plugin.json`) types.
//!
//! The manifest is validated as raw JSON by the
//! [`validator`](crate::validator) first, so decoding into [`PluginManifest`]
//! only happens for manifests already known to be well formed.

use std::collections::BTreeMap;
use std::fmt;
use std::path::Path;

use agentos_sandbox::ResourceLimits;
use serde::{Deserialize, Serialize};

use crate::error::{PluginError, Result};

/// File name of the manifest inside a plugin directory.
pub const MANIFEST_FILE: &str = "plugin.json";

/// Descriptive metadata of a plugin.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
#[serde(rename_all = "camelCase")]
pub struct PluginManifest {
    /// Globally unique identifier, `[a-z0-9\-_.]+`.
    pub id: String,
    pub name: String,
    /// `MAJOR.MINOR.PATCH[-pre]`.
    pub version: String,
    pub description: String,
    pub author: String,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub license: Option<String>,
    /// Entry module, relative to the plugin directory.
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub main: Option<String>,
    /// Compatible host version range.
    #[serde(
        rename = "agentOSVersion",
        default,
        skip_serializing_if = "Option::is_none"
    )]
    pub agent_os_version: Option<String>,
    #[serde(default)]
    pub permissions: Vec<Permission>,
    #[serde(default)]
    pub intents: Vec<IntentDecl>,
    #[serde(default, skip_serializing_if = "BTreeMap::is_empty")]
    pub dependencies: BTreeMap<String, String>,
    /// Requested resource ceilings, clamped by the host.
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub resources: Option<ResourceOverrides>,
}

impl PluginManifest {
    /// Read and decode `plugin.json` from a plugin directory.
    pub fn from_dir(dir: &Path) -> Result<Self> {
        let path = dir.join(MANIFEST_FILE);
        let raw = std::fs::read_to_string(&path).map_err(|e| PluginError::Manifest {
            path: path.display().to_string(),
            reason: e.to_string(),
        })?;
        Self::from_json(&raw).map_err(|e| PluginError::Manifest {
            path: path.display().to_string(),
            reason: e.to_string(),
        })
    }

    /// Decode a manifest from JSON text.
    pub fn from_json(raw: &str) -> std::result::Result<Self, serde_json::Error> {
        serde_json::from_str(raw)
    }

    /// Whether the manifest declares the given intent.
    pub fn handles_intent(&self, intent_id: &str) -> bool {
        self.intents.iter().any(|intent| intent.intent_id == intent_id)
    }

    /// Declared intent ids, in declaration order.
    pub fn intent_ids(&self) -> Vec<&str> {
        self.intents.iter().map(|i| i.intent_id.as_str()).collect()
    }

    /// Whether any permission of the given type is declared.
    pub fn has_permission(&self, kind: PermissionType) -> bool {
        self.permissions.iter().any(|p| p.kind == kind)
    }
}

/// One declared permission.
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct Permission {
    #[serde(rename = "type")]
    pub kind: PermissionType,
    pub resource: String,
    pub access: PermissionAccess,
}

#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, Serialize, Deserialize)]
#[serde(rename_all = "lowercase")]
pub enum PermissionType {
    Data,
    System,
    Network,
    Hardware,
}

impl PermissionType {
    pub const ALL: [PermissionType; 4] = [Self::Data, Self::System, Self::Network, Self::Hardware];

    pub fn as_str(self) -> &'static str {
        match self {
            Self::Data => "data",
            Self::System => "system",
            Self::Network => "network",
            Self::Hardware => "hardware",
        }
    }

    pub fn parse(s: &str) -> Option<Self> {
        Self::ALL.into_iter().find(|kind| kind.as_str() == s)
    }
}

impl fmt::Display for PermissionType {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.write_str(self.as_str())
    }
}

#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, Serialize, Deserialize)]
#[serde(rename_all = "lowercase")]
pub enum PermissionAccess {
    Read,
    Write,
    Execute,
}

impl PermissionAccess {
    pub const ALL: [PermissionAccess; 3] = [Self::Read, Self::Write, Self::Execute];

    pub fn as_str(self) -> &'static str {
        match self {
            Self::Read => "read",
            Self::Write => "write",
            Self::Execute => "execute",
        }
    }

    pub fn parse(s: &str) -> Option<Self> {
        Self::ALL.into_iter().find(|access| access.as_str() == s)
    }
}

impl fmt::Display for PermissionAccess {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.write_str(self.as_str())
    }
}

/// One declared intent.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
#[serde(rename_all = "camelCase")]
pub struct IntentDecl {
    pub intent_id: String,
    /// Free-form parameter schema.
    #[serde(default)]
    pub parameters: serde_json::Value,
    /// Optional handler name, informational.
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub handler: Option<String>,
}

/// Manifest-requested resource ceilings. Unset fields keep the host default.
#[derive(Debug, Clone, Copy, Default, PartialEq, Serialize, Deserialize)]
pub struct ResourceOverrides {
    #[serde(rename = "maxMemoryMB", default, skip_serializing_if = "Option::is_none")]
    pub max_memory_mb: Option<u64>,
    #[serde(rename = "maxCPUPercent", default, skip_serializing_if = "Option::is_none")]
    pub max_cpu_percent: Option<f64>,
    #[serde(
        rename = "maxNetworkBandwidthKBps",
        default,
        skip_serializing_if = "Option::is_none"
    )]
    pub max_network_bandwidth_kbps: Option<u64>,
    #[serde(rename = "maxStorageMB", default, skip_serializing_if = "Option::is_none")]
    pub max_storage_mb: Option<u64>,
    #[serde(
        rename = "maxExecutionTimeMs",
        default,
        skip_serializing_if = "Option::is_none"
    )]
    pub max_execution_time_ms: Option<u64>,
}

impl ResourceOverrides {
    /// Apply the overrides on top of `defaults`, then clamp to `ceiling`.
    pub fn resolve(&self, defaults: ResourceLimits, ceiling: &ResourceLimits) -> ResourceLimits {
        ResourceLimits {
            max_memory_mb: self.max_memory_mb.unwrap_or(defaults.max_memory_mb),
            max_cpu_percent: self.max_cpu_percent.unwrap_or(defaults.max_cpu_percent),
            max_network_bandwidth_kbps: self
                .max_network_bandwidth_kbps
                .unwrap_or(defaults.max_network_bandwidth_kbps),
            max_storage_mb: self.max_storage_mb.unwrap_or(defaults.max_storage_mb),
            max_execution_time_ms: self
                .max_execution_time_ms
                .unwrap_or(defaults.max_execution_time_ms),
        }
        .clamped_to(ceiling)
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    const WEATHER: &str = r#"{
        "id": "weather",
        "name": "Weather",
        "version": "1.2.0",
        "description": "Forecasts",
        "author": "AgentOS",
        "agentOSVersion": "^1.0.0",
        "permissions": [
            { "type": "network", "resource": "api.weather", "access": "read" }
        ],
        "intents": [
            { "intentId": "weather.get", "parameters": { "city": "string" } }
        ],
        "resources": { "maxMemoryMB": 512, "maxCPUPercent": 10 }
    }"#;

    #[test]
    fn decodes_camel_case_manifest() {
        let manifest = PluginManifest::from_json(WEATHER).unwrap();
        assert_eq!(manifest.id, "weather");
        assert_eq!(manifest.agent_os_version.as_deref(), Some("^1.0.0"));
        assert_eq!(manifest.permissions[0].kind, PermissionType::Network);
        assert_eq!(manifest.permissions[0].access, PermissionAccess::Read);
        assert!(manifest.handles_intent("weather.get"));
        assert!(!manifest.handles_intent("weather.set"));
        assert!(manifest.has_permission(PermissionType::Network));
        assert!(manifest.dependencies.is_empty());
    }

    #[test]
    fn overrides_are_clamped_to_ceiling() {
        let manifest = PluginManifest::from_json(WEATHER).unwrap();
        let ceiling = ResourceLimits::new().with_max_memory_mb(256);
        let limits = manifest
            .resources
            .unwrap()
            .resolve(ResourceLimits::default(), &ceiling);
        assert_eq!(limits.max_memory_mb, 256);
        assert_eq!(limits.max_cpu_percent, 10.0);
        assert_eq!(limits.max_storage_mb, ResourceLimits::default().max_storage_mb);
    }

    #[test]
    fn permission_names_round_trip_through_parse() {
        for kind in PermissionType::ALL {
            assert_eq!(PermissionType::parse(kind.as_str()), Some(kind));
        }
        assert_eq!(PermissionAccess::parse("execute"), Some(PermissionAccess::Execute));
        assert_eq!(PermissionAccess::parse("delete"), None);
    }

    #[test]
    fn from_dir_reports_missing_manifest() {
        let tmp = tempfile::tempdir().unwrap();
        let err = PluginManifest::from_dir(tmp.path()).unwrap_err();
        assert_eq!(err.code(), "INVALID_MANIFEST");
    }
}
