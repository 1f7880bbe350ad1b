//! Sandbox manager.
//!
//! [`SandboxManager`] owns the wasmtime [`Engine`] and the table of live
//! sandboxes. It creates and destroys sandboxes and compiles entry modules
//! into them.

use std::path::Path;
use std::sync::Arc;

use dashmap::DashMap;
use dashmap::mapref::entry::Entry;
use wasmtime::{Engine, Module};

use crate::capability::SandboxOptions;
use crate::config::SandboxSettings;
use crate::error::{Result, SandboxError};
use crate::host::{self, NetworkProvider};
use crate::module::{PluginModule, WasmModule};
use crate::sandbox::{Sandbox, UsageSnapshot};

/// Creates, tracks, and destroys per-plugin sandboxes.
///
/// All methods take `&self`; the manager is meant to be shared behind an
/// [`Arc`] by the loader and the performance monitor.
pub struct SandboxManager {
    engine: Engine,
    settings: SandboxSettings,
    sandboxes: DashMap<String, Arc<Sandbox>>,
    network: Option<Arc<dyn NetworkProvider>>,
}

impl SandboxManager {
    /// Create a manager with the given engine-wide settings.
    pub fn new(settings: SandboxSettings) -> Result<Self> {
        let mut wasm_config = wasmtime::Config::new();
        wasm_config.consume_fuel(true);
        wasm_config.wasm_memory64(false);

        let engine = Engine::new(&wasm_config)
            .map_err(|e| SandboxError::Compilation(format!("failed to create wasm engine: {e}")))?;

        tracing::info!(
            max_fuel_per_call = settings.max_fuel_per_call,
            "sandbox manager initialized"
        );

        Ok(Self {
            engine,
            settings,
            sandboxes: DashMap::new(),
            network: None,
        })
    }

    /// Create a manager with default settings.
    pub fn with_defaults() -> Result<Self> {
        Self::new(SandboxSettings::default())
    }

    /// Route network requests of plugins granted the network API through
    /// `provider`.
    pub fn with_network_provider(mut self, provider: Arc<dyn NetworkProvider>) -> Self {
        self.network = Some(provider);
        self
    }

    pub fn settings(&self) -> &SandboxSettings {
        &self.settings
    }

    /// Create the sandbox for `plugin_id`.
    ///
    /// Fails with [`SandboxError::AlreadyExists`] if a live sandbox exists.
    pub fn create_sandbox(&self, plugin_id: &str, options: SandboxOptions) -> Result<Arc<Sandbox>> {
        match self.sandboxes.entry(plugin_id.to_owned()) {
            Entry::Occupied(_) => Err(SandboxError::AlreadyExists {
                plugin_id: plugin_id.to_owned(),
            }),
            Entry::Vacant(slot) => {
                let sandbox = Arc::new(Sandbox::new(plugin_id, &options));
                tracing::info!(
                    plugin_id,
                    apis = ?sandbox.allowed_apis(),
                    network = sandbox.network_access(),
                    filesystem = sandbox.file_system_access(),
                    "sandbox created"
                );
                slot.insert(Arc::clone(&sandbox));
                Ok(sandbox)
            }
        }
    }

    /// Destroy the sandbox for `plugin_id`, releasing everything it holds.
    ///
    /// Destroying an unknown or already destroyed sandbox is a no-op.
    /// Returns whether a sandbox was destroyed.
    pub fn destroy_sandbox(&self, plugin_id: &str) -> bool {
        match self.sandboxes.remove(plugin_id) {
            Some((_, sandbox)) => {
                sandbox.release();
                tracing::info!(plugin_id, "sandbox destroyed");
                true
            }
            None => {
                tracing::debug!(plugin_id, "destroy requested for absent sandbox, ignored");
                false
            }
        }
    }

    pub fn get_sandbox(&self, plugin_id: &str) -> Option<Arc<Sandbox>> {
        self.sandboxes.get(plugin_id).map(|entry| Arc::clone(entry.value()))
    }

    pub fn has_sandbox(&self, plugin_id: &str) -> bool {
        self.sandboxes.contains_key(plugin_id)
    }

    /// Ids of every live sandbox, sorted.
    pub fn sandbox_ids(&self) -> Vec<String> {
        let mut ids: Vec<String> = self.sandboxes.iter().map(|e| e.key().clone()).collect();
        ids.sort();
        ids
    }

    pub fn len(&self) -> usize {
        self.sandboxes.len()
    }

    pub fn is_empty(&self) -> bool {
        self.sandboxes.is_empty()
    }

    /// Current usage counters of a live sandbox.
    pub fn usage(&self, plugin_id: &str) -> Option<UsageSnapshot> {
        self.sandboxes.get(plugin_id).map(|entry| entry.value().usage())
    }

    /// Compile the module at `entry_path` into `sandbox`.
    ///
    /// Accepts binary wasm or WAT text. Imports outside the sandbox
    /// allow-list are rejected here, before anything is instantiated.
    pub fn load_module(&self, entry_path: &Path, sandbox: &Arc<Sandbox>) -> Result<Arc<dyn PluginModule>> {
        let live = self
            .get_sandbox(sandbox.plugin_id())
            .is_some_and(|current| Arc::ptr_eq(&current, sandbox));
        if !live || sandbox.is_closed() {
            return Err(SandboxError::Closed {
                plugin_id: sandbox.plugin_id().to_owned(),
            });
        }

        let bytes = std::fs::read(entry_path)?;
        tracing::debug!(
            plugin_id = %sandbox.plugin_id(),
            path = %entry_path.display(),
            size_bytes = bytes.len(),
            "read entry module from disk"
        );

        let module = Module::new(&self.engine, &bytes)
            .map_err(|e| SandboxError::Compilation(e.to_string()))?;
        host::check_imports(&module, sandbox)?;

        tracing::info!(plugin_id = %sandbox.plugin_id(), "compiled wasm module");

        Ok(Arc::new(WasmModule::new(
            self.engine.clone(),
            module,
            Arc::clone(sandbox),
            self.settings.clone(),
            self.network.clone(),
            entry_path,
        )))
    }
}
