//! AgentOS plugin host.
//!
//! Third-party plugins are directories holding a `plugin.json` manifest and a
//! WebAssembly entry module. This crate validates them, loads them into
//! isolated sandboxes, drives them through their lifecycle, and watches their
//! resource usage.
//!
//! - **[`config`]** -- [`HostConfig`], loaded from TOML with environment
//!   overrides.
//! - **[`error`]** -- [`PluginError`] enumerates every failure mode.
//! - **[`manifest`]** -- [`PluginManifest`] and its permission, intent, and
//!   resource declarations.
//! - **[`version`]** -- version parsing and host compatibility ranges.
//! - **[`security`]** -- [`SecurityScanner`], the static source scan.
//! - **[`validator`]** -- [`ManifestValidator`] checks a plugin directory
//!   before anything is loaded.
//! - **[`events`]** -- [`EventBus`] and the [`PluginEvent`]s it carries.
//! - **[`registry`]** -- [`PluginRegistry`] seam and [`InMemoryRegistry`].
//! - **[`monitor`]** -- [`PerformanceMonitor`] samples sandboxes and escalates
//!   limit violations.
//! - **[`loader`]** -- [`PluginLoader`] turns a directory into a running
//!   instance.
//! - **[`lifecycle`]** -- [`LifecycleManager`] is the main entry point.
//!
//! # Quick start
//!
//! ```rust,no_run
//! # use std::path::Path;
//! # use agentos_plugins::{HostConfig, LifecycleManager};
//! # async fn example() -> agentos_plugins::Result<()> {
//! let host = LifecycleManager::from_config(&HostConfig::default())?;
//! let id = host.load_plugin(Path::new("plugins/weather")).await?;
//! host.initialize_plugin(&id).await?;
//! host.start_plugin(&id).await?;
//! let forecast = host
//!     .handle_intent(&id, "weather.get", serde_json::json!({ "city": "Oslo" }))
//!     .await?;
//! # let _ = forecast;
//! host.shutdown().await;
//! # Ok(())
//! # }
//! ```

pub mod config;
pub mod error;
pub mod events;
pub mod lifecycle;
pub mod loader;
pub mod manifest;
pub mod monitor;
pub mod registry;
pub mod security;
pub mod validator;
pub mod version;

pub use config::HostConfig;
pub use error::{PluginError, Result};
pub use events::{EventBus, EventKind, PluginEvent};
pub use lifecycle::{LifecycleManager, LifecycleState};
pub use loader::{LoadedPlugin, PluginLoader};
pub use manifest::{PluginManifest, MANIFEST_FILE};
pub use monitor::{AlertThresholds, PerformanceMetrics, PerformanceMonitor, ResourceKind, UsageSource};
pub use registry::{InMemoryRegistry, PluginRegistry, RegisteredPlugin};
pub use security::SecurityScanner;
pub use validator::{ManifestValidator, ValidationResult};
