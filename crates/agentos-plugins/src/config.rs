//! Host configuration.
//!
//! [`HostConfig`] gathers every tunable of the plugin host into one TOML
//! document with three sections:
//!
//! ```toml
//! [plugins]
//! directories = ["plugins"]
//! max_plugin_size_mb = 50
//! supported_versions = ["1.0.0"]
//!
//! [sandbox]
//! max_fuel_per_call = 50000000
//! [sandbox.default_limits]
//! maxMemoryMB = 128
//!
//! [monitor]
//! sample_interval_ms = 5000
//! ```
//!
//! Every field has a default, so an empty file is a valid configuration.

use std::path::{Path, PathBuf};
use std::time::Duration;

use agentos_sandbox::{ResourceLimits, SandboxSettings};
use serde::{Deserialize, Serialize};

use crate::error::{PluginError, Result};
use crate::monitor::AlertThresholds;

/// Environment variable overriding [`PluginsConfig::directories`]
/// (path-list separated, like `PATH`).
pub const ENV_PLUGIN_DIRS: &str = "AGENTOS_PLUGIN_DIRS";

/// Environment variable overriding [`MonitorConfig::sample_interval_ms`].
pub const ENV_MONITOR_INTERVAL_MS: &str = "AGENTOS_MONITOR_INTERVAL_MS";

/// Top-level host configuration.
#[derive(Debug, Clone, Default, Serialize, Deserialize)]
#[serde(default)]
pub struct HostConfig {
    pub plugins: PluginsConfig,
    pub sandbox: SandboxConfig,
    pub monitor: MonitorConfig,
}

impl HostConfig {
    /// Parse a TOML configuration file.
    pub fn load(path: &Path) -> Result<Self> {
        let content = std::fs::read_to_string(path).map_err(|e| {
            PluginError::Config(format!("failed to read {}: {e}", path.display()))
        })?;
        let config = Self::from_toml_str(&content)?;
        tracing::info!(path = %path.display(), "host configuration loaded");
        Ok(config)
    }

    /// Parse configuration from TOML text.
    pub fn from_toml_str(content: &str) -> Result<Self> {
        let config: Self = toml::from_str(content)
            .map_err(|e| PluginError::Config(format!("failed to parse TOML config: {e}")))?;
        config.check()?;
        Ok(config)
    }

    /// Apply `AGENTOS_*` environment overrides in place.
    pub fn apply_env_overrides(&mut self) -> Result<()> {
        if let Some(dirs) = std::env::var_os(ENV_PLUGIN_DIRS).filter(|v| !v.is_empty()) {
            self.plugins.directories = std::env::split_paths(&dirs).collect();
            tracing::debug!(dirs = ?self.plugins.directories, "plugin directories overridden from env");
        }
        if let Ok(raw) = std::env::var(ENV_MONITOR_INTERVAL_MS) {
            let ms: u64 = raw.trim().parse().map_err(|_| {
                PluginError::Config(format!("{ENV_MONITOR_INTERVAL_MS} must be an integer, got '{raw}'"))
            })?;
            self.monitor.sample_interval_ms = ms;
        }
        self.check()
    }

    fn check(&self) -> Result<()> {
        if self.monitor.sample_interval_ms == 0 {
            return Err(PluginError::Config(
                "monitor.sample_interval_ms must be greater than zero".into(),
            ));
        }
        if self.monitor.warning_percent > self.monitor.critical_percent {
            return Err(PluginError::Config(format!(
                "monitor.warning_percent ({}) exceeds monitor.critical_percent ({})",
                self.monitor.warning_percent, self.monitor.critical_percent
            )));
        }
        if self.monitor.severe_violation_threshold == 0 {
            return Err(PluginError::Config(
                "monitor.severe_violation_threshold must be at least 1".into(),
            ));
        }
        Ok(())
    }
}

/// `[plugins]`: discovery, validation, and unload settings.
#[derive(Debug, Clone, Serialize, Deserialize)]
#[serde(default)]
pub struct PluginsConfig {
    /// Directories scanned by discovery.
    pub directories: Vec<PathBuf>,
    /// Maximum on-disk size of one plugin directory, in MiB.
    pub max_plugin_size_mb: u64,
    /// Host versions plugins may declare compatibility with.
    pub supported_versions: Vec<String>,
    /// Dependency names that block a plugin from loading.
    pub forbidden_dependencies: Vec<String>,
    /// Additional regex patterns treated as forbidden source code.
    pub extra_forbidden_patterns: Vec<String>,
    /// Additional regex patterns treated as suspicious source code.
    pub extra_suspicious_patterns: Vec<String>,
    /// How long unload waits for in-flight calls to finish.
    pub unload_drain_timeout_ms: u64,
}

impl Default for PluginsConfig {
    fn default() -> Self {
        Self {
            directories: vec![PathBuf::from("plugins")],
            max_plugin_size_mb: 50,
            supported_versions: vec!["1.0.0".into()],
            forbidden_dependencies: ["child_process", "shelljs", "node-pty", "vm2", "execa"]
                .into_iter()
                .map(String::from)
                .collect(),
            extra_forbidden_patterns: Vec::new(),
            extra_suspicious_patterns: Vec::new(),
            unload_drain_timeout_ms: 5000,
        }
    }
}

impl PluginsConfig {
    pub fn max_plugin_size_bytes(&self) -> u64 {
        self.max_plugin_size_mb.saturating_mul(1024 * 1024)
    }

    pub fn unload_drain_timeout(&self) -> Duration {
        Duration::from_millis(self.unload_drain_timeout_ms)
    }
}

/// `[sandbox]`: engine settings and resource ceilings.
#[derive(Debug, Clone, Serialize, Deserialize)]
#[serde(default)]
pub struct SandboxConfig {
    pub max_fuel_per_call: u64,
    pub max_io_bytes: usize,
    /// Limits assigned when the manifest requests nothing.
    pub default_limits: ResourceLimits,
    /// Upper bound for manifest-requested limits.
    pub ceiling_limits: ResourceLimits,
}

impl Default for SandboxConfig {
    fn default() -> Self {
        let settings = SandboxSettings::default();
        Self {
            max_fuel_per_call: settings.max_fuel_per_call,
            max_io_bytes: settings.max_io_bytes,
            default_limits: ResourceLimits::default(),
            ceiling_limits: ResourceLimits::new()
                .with_max_memory_mb(1024)
                .with_max_cpu_percent(100.0)
                .with_max_network_bandwidth_kbps(10 * 1024)
                .with_max_storage_mb(1024)
                .with_max_execution_time_ms(60_000),
        }
    }
}

impl SandboxConfig {
    /// Engine settings for the sandbox manager.
    pub fn settings(&self) -> SandboxSettings {
        SandboxSettings::new()
            .with_max_fuel_per_call(self.max_fuel_per_call)
            .with_max_io_bytes(self.max_io_bytes)
    }
}

/// `[monitor]`: sampling cadence and alert thresholds.
#[derive(Debug, Clone, Serialize, Deserialize)]
#[serde(default)]
pub struct MonitorConfig {
    pub sample_interval_ms: u64,
    pub warning_percent: f64,
    pub critical_percent: f64,
    /// Violation count of one resource at which `severeViolation` fires.
    pub severe_violation_threshold: u32,
}

impl Default for MonitorConfig {
    fn default() -> Self {
        let thresholds = AlertThresholds::default();
        Self {
            sample_interval_ms: 5000,
            warning_percent: thresholds.warning_percent,
            critical_percent: thresholds.critical_percent,
            severe_violation_threshold: thresholds.severe_violation_count,
        }
    }
}

impl MonitorConfig {
    pub fn sample_interval(&self) -> Duration {
        Duration::from_millis(self.sample_interval_ms)
    }

    pub fn thresholds(&self) -> AlertThresholds {
        AlertThresholds {
            warning_percent: self.warning_percent,
            critical_percent: self.critical_percent,
            severe_violation_count: self.severe_violation_threshold,
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn empty_document_uses_defaults() {
        let config = HostConfig::from_toml_str("").unwrap();
        assert_eq!(config.plugins.directories, vec![PathBuf::from("plugins")]);
        assert_eq!(config.plugins.max_plugin_size_mb, 50);
        assert_eq!(config.monitor.sample_interval_ms, 5000);
        assert_eq!(config.monitor.severe_violation_threshold, 5);
        assert_eq!(config.sandbox.default_limits, ResourceLimits::default());
    }

    #[test]
    fn parses_every_section() {
        let config = HostConfig::from_toml_str(
            r#"
            [plugins]
            directories = ["/opt/agentos/plugins", "./local"]
            supported_versions = ["1.0.0", "1.1.0"]
            forbidden_dependencies = ["left-pad"]
            unload_drain_timeout_ms = 250

            [sandbox]
            max_fuel_per_call = 1000
            [sandbox.default_limits]
            maxMemoryMB = 64
            maxCPUPercent = 25.0

            [monitor]
            sample_interval_ms = 100
            warning_percent = 70.0
            severe_violation_threshold = 3
            "#,
        )
        .unwrap();
        assert_eq!(config.plugins.directories.len(), 2);
        assert_eq!(config.plugins.forbidden_dependencies, vec!["left-pad".to_owned()]);
        assert_eq!(config.plugins.unload_drain_timeout(), Duration::from_millis(250));
        assert_eq!(config.sandbox.settings().max_fuel_per_call, 1000);
        assert_eq!(config.sandbox.default_limits.max_memory_mb, 64);
        assert_eq!(config.sandbox.default_limits.max_storage_mb, 50);
        let thresholds = config.monitor.thresholds();
        assert_eq!(thresholds.warning_percent, 70.0);
        assert_eq!(thresholds.critical_percent, 95.0);
        assert_eq!(thresholds.severe_violation_count, 3);
    }

    #[test]
    fn rejects_inconsistent_thresholds() {
        let err = HostConfig::from_toml_str(
            "[monitor]\nwarning_percent = 99.0\ncritical_percent = 90.0\n",
        )
        .unwrap_err();
        assert_eq!(err.code(), "CONFIG_ERROR");

        assert!(HostConfig::from_toml_str("[monitor]\nsample_interval_ms = 0\n").is_err());
    }

    #[test]
    fn rejects_malformed_toml() {
        let err = HostConfig::from_toml_str("[plugins\n").unwrap_err();
        assert!(err.to_string().contains("TOML"));
    }

    #[test]
    fn load_reads_file() {
        let tmp = tempfile::tempdir().unwrap();
        let path = tmp.path().join("agentos.toml");
        std::fs::write(&path, "[plugins]\nmax_plugin_size_mb = 10\n").unwrap();
        let config = HostConfig::load(&path).unwrap();
        assert_eq!(config.plugins.max_plugin_size_bytes(), 10 * 1024 * 1024);

        assert!(HostConfig::load(&tmp.path().join("missing.toml")).is_err());
    }
}
