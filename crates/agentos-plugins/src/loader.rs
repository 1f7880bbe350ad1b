//! Plugin loader.
//!
//! [`PluginLoader`] turns a plugin directory into a running plugin instance:
//!
//! 1. validate the directory (blocking, off the async executor)
//! 2. read the manifest
//! 3. reject an id that is already loaded
//! 4. derive the sandbox capabilities and resource limits
//! 5. create the sandbox
//! 6. compile the entry module inside the sandbox
//! 7. check for the `create_plugin` factory
//! 8. instantiate and call `initialize` with the host context
//! 9. record the plugin and emit `plugin:installed`
//!
//! A failure after step 5 destroys the sandbox before the error is returned,
//! so a failed load leaves nothing behind.

use std::path::{Path, PathBuf};
use std::sync::Arc;

use agentos_sandbox::{
    HostApi, PluginContext, PluginInstance, Sandbox, SandboxError, SandboxManager, SandboxOptions,
};
use chrono::{DateTime, Utc};
use dashmap::DashMap;
use dashmap::mapref::entry::Entry;

use crate::config::{HostConfig, PluginsConfig, SandboxConfig};
use crate::error::{PluginError, Result};
use crate::events::{EventBus, EventKind};
use crate::manifest::{MANIFEST_FILE, PermissionType, PluginManifest};
use crate::validator::{ManifestValidator, resolve_entry_path};

/// Permission resource that grants the filesystem API.
pub const FILESYSTEM_RESOURCE: &str = "filesystem";

/// A plugin recorded by the loader.
#[derive(Clone)]
pub struct LoadedPlugin {
    pub plugin: Arc<dyn PluginInstance>,
    pub metadata: PluginManifest,
    pub sandbox: Arc<Sandbox>,
    pub loaded_at: DateTime<Utc>,
    /// Directory the plugin was loaded from.
    pub source_path: PathBuf,
}

impl std::fmt::Debug for LoadedPlugin {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.debug_struct("LoadedPlugin")
            .field("id", &self.metadata.id)
            .field("version", &self.metadata.version)
            .field("sandbox", &self.sandbox)
            .field("loaded_at", &self.loaded_at)
            .field("source_path", &self.source_path)
            .finish()
    }
}

/// Derive sandbox options from a manifest's permissions and resources.
///
/// `data`, `system`, `network`, and `hardware` permissions map to the data
/// store, system info, network, and device info APIs. A permission on the
/// `filesystem` resource grants the read-only filesystem API.
pub fn sandbox_options(manifest: &PluginManifest, config: &SandboxConfig) -> SandboxOptions {
    let limits = match &manifest.resources {
        Some(overrides) => overrides.resolve(config.default_limits, &config.ceiling_limits),
        None => config.default_limits.clamped_to(&config.ceiling_limits),
    };

    let mut options = SandboxOptions::new().with_limits(limits);
    for permission in &manifest.permissions {
        options = options.allow(match permission.kind {
            PermissionType::Data => HostApi::DataAccess,
            PermissionType::System => HostApi::SystemInfo,
            PermissionType::Network => HostApi::Network,
            PermissionType::Hardware => HostApi::DeviceInfo,
        });
    }

    let file_system = manifest
        .permissions
        .iter()
        .any(|p| p.resource == FILESYSTEM_RESOURCE);
    if file_system {
        options = options.allow(HostApi::FileSystem);
    }

    options
        .with_network_access(manifest.has_permission(PermissionType::Network))
        .with_file_system_access(file_system)
}

/// Loads, unloads, reloads, and discovers plugins.
pub struct PluginLoader {
    validator: Arc<ManifestValidator>,
    sandboxes: Arc<SandboxManager>,
    events: EventBus,
    plugins: PluginsConfig,
    sandbox: SandboxConfig,
    loaded: DashMap<String, LoadedPlugin>,
}

impl PluginLoader {
    /// Create a loader. Fails if the configured security patterns are invalid.
    pub fn new(config: &HostConfig, sandboxes: Arc<SandboxManager>, events: EventBus) -> Result<Self> {
        let validator = ManifestValidator::new(&config.plugins)?;
        tracing::info!(
            dirs = ?config.plugins.directories,
            "plugin loader created"
        );
        Ok(Self {
            validator: Arc::new(validator),
            sandboxes,
            events,
            plugins: config.plugins.clone(),
            sandbox: config.sandbox.clone(),
            loaded: DashMap::new(),
        })
    }

    pub fn sandbox_manager(&self) -> &Arc<SandboxManager> {
        &self.sandboxes
    }

    pub fn validator(&self) -> &ManifestValidator {
        &self.validator
    }

    pub fn events(&self) -> &EventBus {
        &self.events
    }

    /// Load the plugin in directory `path`.
    pub async fn load_plugin(&self, path: &Path, context: &PluginContext) -> Result<Arc<dyn PluginInstance>> {
        let manifest = self.validate_and_read(path).await?;
        let plugin_id = manifest.id.clone();

        if self.loaded.contains_key(&plugin_id) {
            return Err(PluginError::AlreadyLoaded { plugin_id });
        }

        let options = sandbox_options(&manifest, &self.sandbox);
        let sandbox = self
            .sandboxes
            .create_sandbox(&plugin_id, options)
            .map_err(|e| match e {
                // A live sandbox means another load of this id is in progress
                // or finished.
                SandboxError::AlreadyExists { plugin_id } => PluginError::AlreadyLoaded { plugin_id },
                other => other.into(),
            })?;

        let plugin = match self.instantiate(path, &manifest, &sandbox, context).await {
            Ok(plugin) => plugin,
            Err(e) => {
                self.sandboxes.destroy_sandbox(&plugin_id);
                tracing::warn!(plugin_id = %plugin_id, error = %e, "plugin load failed, sandbox destroyed");
                return Err(e);
            }
        };

        let version = manifest.version.clone();
        match self.loaded.entry(plugin_id.clone()) {
            Entry::Occupied(_) => {
                self.sandboxes.destroy_sandbox(&plugin_id);
                return Err(PluginError::AlreadyLoaded { plugin_id });
            }
            Entry::Vacant(slot) => {
                slot.insert(LoadedPlugin {
                    plugin: Arc::clone(&plugin),
                    metadata: manifest,
                    sandbox,
                    loaded_at: Utc::now(),
                    source_path: path.to_path_buf(),
                });
            }
        }

        tracing::info!(plugin_id = %plugin_id, version = %version, path = %path.display(), "plugin loaded");
        self.events.emit(&plugin_id, EventKind::Installed { version });
        Ok(plugin)
    }

    /// Run validation on the blocking pool and decode the manifest.
    async fn validate_and_read(&self, path: &Path) -> Result<PluginManifest> {
        let validator = Arc::clone(&self.validator);
        let dir = path.to_path_buf();

        tokio::task::spawn_blocking(move || {
            let result = validator.validate(&dir);
            if !result.valid {
                return Err(PluginError::Validation {
                    path: dir.display().to_string(),
                    errors: result.error_messages(),
                });
            }
            for warning in &result.warnings {
                tracing::warn!(
                    path = %dir.display(),
                    code = warning.code,
                    "{}",
                    warning.message
                );
            }
            PluginManifest::from_dir(&dir)
        })
        .await
        .map_err(|e| PluginError::Internal(format!("validation task panicked: {e}")))?
    }

    /// Steps 6-8: compile, check the factory, instantiate, initialize.
    async fn instantiate(
        &self,
        path: &Path,
        manifest: &PluginManifest,
        sandbox: &Arc<Sandbox>,
        context: &PluginContext,
    ) -> Result<Arc<dyn PluginInstance>> {
        let entry = resolve_entry_path(path, manifest.main.as_deref()).ok_or_else(|| {
            PluginError::EntryNotFound {
                path: path.display().to_string(),
            }
        })?;

        let sandboxes = Arc::clone(&self.sandboxes);
        let sandbox_handle = Arc::clone(sandbox);
        let plugin = tokio::task::spawn_blocking(move || -> Result<Arc<dyn PluginInstance>> {
            let module = sandboxes.load_module(&entry, &sandbox_handle)?;
            if !module.exports_factory() {
                return Err(PluginError::MissingFactory {
                    path: entry.display().to_string(),
                });
            }
            Ok(module.create_plugin()?)
        })
        .await
        .map_err(|e| PluginError::Internal(format!("instantiation task panicked: {e}")))??;

        plugin.initialize(context).await?;
        tracing::debug!(plugin_id = %manifest.id, "plugin initialized with host context");
        Ok(plugin)
    }

    /// Unload a plugin: stop new calls, drain in-flight calls, run the
    /// plugin's cleanup, and destroy its sandbox.
    pub async fn unload_plugin(&self, plugin_id: &str) -> Result<()> {
        let Some((_, loaded)) = self.loaded.remove(plugin_id) else {
            return Err(PluginError::NotLoaded {
                plugin_id: plugin_id.to_owned(),
            });
        };

        loaded.sandbox.close();
        if !loaded
            .sandbox
            .wait_idle(self.plugins.unload_drain_timeout())
            .await
        {
            tracing::warn!(plugin_id, "unloading with calls still in flight");
        }

        if let Err(e) = loaded.plugin.cleanup().await {
            tracing::warn!(plugin_id, error = %e, "plugin cleanup failed, continuing unload");
        }

        self.sandboxes.destroy_sandbox(plugin_id);
        tracing::info!(plugin_id, "plugin unloaded");
        self.events.emit(plugin_id, EventKind::Uninstalled);
        Ok(())
    }

    /// Unload and load again from the original directory.
    ///
    /// Not atomic: if the new load fails the plugin stays unloaded and the
    /// load error is returned.
    pub async fn reload_plugin(&self, plugin_id: &str, context: &PluginContext) -> Result<Arc<dyn PluginInstance>> {
        let source = self
            .loaded
            .get(plugin_id)
            .map(|entry| entry.source_path.clone())
            .ok_or_else(|| PluginError::NotLoaded {
                plugin_id: plugin_id.to_owned(),
            })?;

        self.unload_plugin(plugin_id).await?;
        tracing::info!(plugin_id, path = %source.display(), "reloading plugin");
        self.load_plugin(&source, context).await
    }

    /// Plugin directories under every configured directory, sorted.
    ///
    /// A plugin directory is an immediate subdirectory containing
    /// `plugin.json`. Missing configured directories are skipped.
    pub fn discover_plugins(&self) -> Vec<PathBuf> {
        let mut found = Vec::new();
        for dir in &self.plugins.directories {
            let entries = match std::fs::read_dir(dir) {
                Ok(entries) => entries,
                Err(e) => {
                    tracing::debug!(dir = %dir.display(), error = %e, "plugin directory not readable, skipped");
                    continue;
                }
            };
            found.extend(
                entries
                    .filter_map(|entry| entry.ok())
                    .map(|entry| entry.path())
                    .filter(|path| path.is_dir() && path.join(MANIFEST_FILE).is_file()),
            );
        }
        found.sort();
        tracing::debug!(count = found.len(), "plugins discovered");
        found
    }

    /// Load every discovered plugin. Failures are logged and skipped.
    ///
    /// Returns the ids of the plugins that loaded.
    pub async fn load_all(&self, context: &PluginContext) -> Vec<String> {
        let mut ids = Vec::new();
        for path in self.discover_plugins() {
            match self.load_plugin(&path, context).await {
                Ok(plugin) => ids.push(plugin.plugin_id().to_owned()),
                Err(e) => tracing::warn!(
                    path = %path.display(),
                    code = e.code(),
                    error = %e,
                    "skipping plugin that failed to load"
                ),
            }
        }
        ids
    }

    pub fn get(&self, plugin_id: &str) -> Option<LoadedPlugin> {
        self.loaded.get(plugin_id).map(|entry| entry.value().clone())
    }

    pub fn instance(&self, plugin_id: &str) -> Option<Arc<dyn PluginInstance>> {
        self.loaded
            .get(plugin_id)
            .map(|entry| Arc::clone(&entry.value().plugin))
    }

    pub fn is_loaded(&self, plugin_id: &str) -> bool {
        self.loaded.contains_key(plugin_id)
    }

    /// Ids of every loaded plugin, sorted.
    pub fn loaded_ids(&self) -> Vec<String> {
        let mut ids: Vec<String> = self.loaded.iter().map(|e| e.key().clone()).collect();
        ids.sort();
        ids
    }

    pub fn len(&self) -> usize {
        self.loaded.len()
    }

    pub fn is_empty(&self) -> bool {
        self.loaded.is_empty()
    }
}
