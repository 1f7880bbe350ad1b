//! Plugin modules and instances.
//!
//! A [`PluginModule`] is a compiled unit of plugin code bound to a sandbox.
//! Its `create_plugin` factory yields a [`PluginInstance`], the object the
//! loader and lifecycle manager drive. The traits keep the isolation backend
//! replaceable; [`WasmModule`] and [`WasmPlugin`] are the wasmtime backend.
//!
//! # Guest exports
//!
//! | export          | signature    | required |
//! |-----------------|--------------|----------|
//! | `memory`        | memory       | yes      |
//! | `create_plugin` | `() -> i32`  | yes      |
//! | `initialize`    | `() -> i32`  | no       |
//! | `start`         | `() -> i32`  | no       |
//! | `stop`          | `() -> i32`  | no       |
//! | `cleanup`       | `() -> i32`  | no       |
//! | `handle_intent` | `() -> i32`  | for intents |
//!
//! A non-zero return value is a failure. Call input (the host context for
//! `initialize`, `{"intentId", "parameters"}` for `handle_intent`) is pulled by
//! the guest with `host_read_input`; results are pushed with `host_set_result`.

use std::path::{Path, PathBuf};
use std::sync::{Arc, Mutex};
use std::time::Instant;

use async_trait::async_trait;
use serde::{Deserialize, Serialize};
use serde_json::Value;
use wasmtime::{Engine, Instance, Linker, Module, Store, Trap};

use crate::config::SandboxSettings;
use crate::error::{Result, SandboxError};
use crate::host::{self, HostState, NetworkProvider};
use crate::sandbox::{CallGuard, Sandbox};

/// Name of the factory export every plugin module must provide.
pub const FACTORY_EXPORT: &str = "create_plugin";

/// Host context handed to a plugin's `initialize` hook.
///
/// Logging is not part of this struct: it is the sandbox's `host_log`
/// function, already scoped to the plugin id.
#[derive(Debug, Clone, Default, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "camelCase")]
pub struct PluginContext {
    #[serde(skip_serializing_if = "Option::is_none")]
    pub user_id: Option<String>,
    #[serde(skip_serializing_if = "Option::is_none")]
    pub session_id: Option<String>,
}

impl PluginContext {
    pub fn new() -> Self {
        Self::default()
    }

    pub fn with_user_id(mut self, user_id: impl Into<String>) -> Self {
        self.user_id = Some(user_id.into());
        self
    }

    pub fn with_session_id(mut self, session_id: impl Into<String>) -> Self {
        self.session_id = Some(session_id.into());
        self
    }
}

/// A live plugin object created by a module factory.
#[async_trait]
pub trait PluginInstance: Send + Sync {
    /// The plugin id this instance belongs to.
    fn plugin_id(&self) -> &str;

    /// Bind the instance to the host context.
    async fn initialize(&self, context: &PluginContext) -> Result<()>;

    async fn start(&self) -> Result<()>;

    async fn stop(&self) -> Result<()>;

    /// Release plugin-side resources. Runs even after the sandbox is closed.
    async fn cleanup(&self) -> Result<()>;

    /// Handle one intent call.
    async fn handle_intent(&self, intent_id: &str, parameters: Value) -> Result<Value>;
}

/// A compiled unit of plugin code bound to a sandbox.
pub trait PluginModule: Send + Sync {
    /// The file the module was loaded from.
    fn entry_path(&self) -> &Path;

    /// Whether the module exports the `create_plugin` factory.
    fn exports_factory(&self) -> bool;

    /// Instantiate the module and run its factory.
    fn create_plugin(&self) -> Result<Arc<dyn PluginInstance>>;
}

/// Wire shape of a `handle_intent` call input.
#[derive(Serialize)]
#[serde(rename_all = "camelCase")]
struct IntentCall<'a> {
    intent_id: &'a str,
    parameters: &'a Value,
}

/// A wasm module compiled for one sandbox.
pub struct WasmModule {
    engine: Engine,
    module: Module,
    sandbox: Arc<Sandbox>,
    settings: SandboxSettings,
    network: Option<Arc<dyn NetworkProvider>>,
    entry_path: PathBuf,
    root_dir: PathBuf,
}

impl WasmModule {
    pub(crate) fn new(
        engine: Engine,
        module: Module,
        sandbox: Arc<Sandbox>,
        settings: SandboxSettings,
        network: Option<Arc<dyn NetworkProvider>>,
        entry_path: &Path,
    ) -> Self {
        let root_dir = entry_path
            .parent()
            .map(Path::to_path_buf)
            .unwrap_or_else(|| PathBuf::from("."));
        Self {
            engine,
            module,
            sandbox,
            settings,
            network,
            entry_path: entry_path.to_path_buf(),
            root_dir,
        }
    }
}

impl PluginModule for WasmModule {
    fn entry_path(&self) -> &Path {
        &self.entry_path
    }

    fn exports_factory(&self) -> bool {
        self.module
            .get_export(FACTORY_EXPORT)
            .is_some_and(|export| export.func().is_some())
    }

    fn create_plugin(&self) -> Result<Arc<dyn PluginInstance>> {
        let _guard = self.sandbox.enter()?;
        let plugin_id = self.sandbox.plugin_id().to_owned();

        let state = HostState {
            plugin_id: plugin_id.clone(),
            sandbox: Arc::clone(&self.sandbox),
            root_dir: self.root_dir.clone(),
            network: self.network.clone(),
            max_io_bytes: self.settings.max_io_bytes,
            input: Vec::new(),
            output: Vec::new(),
        };
        let mut store = Store::new(&self.engine, state);
        store
            .set_fuel(self.settings.max_fuel_per_call)
            .map_err(|e| SandboxError::Execution(e.to_string()))?;

        let mut linker: Linker<HostState> = Linker::new(&self.engine);
        host::define_host_functions(&mut linker, self.sandbox.allowed_apis())?;

        let instance = linker
            .instantiate(&mut store, &self.module)
            .map_err(|e| SandboxError::Instantiation(e.to_string()))?;

        let mut wasm = WasmState { store, instance };
        wasm.record_memory();

        match wasm.invoke(FACTORY_EXPORT, Vec::new(), self.settings.max_fuel_per_call)? {
            Some((0, _)) => {}
            Some((status, _)) => {
                return Err(SandboxError::GuestFailure {
                    plugin_id,
                    export: FACTORY_EXPORT.to_owned(),
                    status,
                });
            }
            None => {
                return Err(SandboxError::MissingFactory {
                    path: self.entry_path.display().to_string(),
                });
            }
        }

        tracing::debug!(plugin_id = %plugin_id, "plugin instance created");

        Ok(Arc::new(WasmPlugin {
            plugin_id,
            sandbox: Arc::clone(&self.sandbox),
            state: Arc::new(Mutex::new(wasm)),
            max_fuel: self.settings.max_fuel_per_call,
        }))
    }
}

/// A wasm store and the instance living in it.
struct WasmState {
    store: Store<HostState>,
    instance: Instance,
}

impl WasmState {
    fn memory_bytes(&mut self) -> u64 {
        self.instance
            .get_memory(&mut self.store, "memory")
            .map(|memory| memory.data_size(&self.store) as u64)
            .unwrap_or(0)
    }

    fn record_memory(&mut self) {
        let bytes = self.memory_bytes();
        self.store.data().sandbox.record_memory(bytes);
    }

    /// Call a `() -> i32` export. Returns `None` if the export does not exist.
    fn invoke(&mut self, export: &str, input: Vec<u8>, fuel: u64) -> Result<Option<(i32, Vec<u8>)>> {
        if self.instance.get_func(&mut self.store, export).is_none() {
            return Ok(None);
        }
        let func = self
            .instance
            .get_typed_func::<(), i32>(&mut self.store, export)
            .map_err(|e| {
                SandboxError::Execution(format!("export `{export}` has an unexpected signature: {e}"))
            })?;

        self.store
            .set_fuel(fuel)
            .map_err(|e| SandboxError::Execution(e.to_string()))?;
        {
            let data = self.store.data_mut();
            data.input = input;
            data.output.clear();
        }

        let started = Instant::now();
        let outcome = func.call(&mut self.store, ());
        let elapsed = started.elapsed();
        let memory_bytes = self.memory_bytes();
        self.store
            .data()
            .sandbox
            .record_call(elapsed, memory_bytes, outcome.is_err());

        let status = outcome.map_err(|e| {
            let message = match e.downcast_ref::<Trap>() {
                Some(trap) => trap.to_string(),
                None => format!("{e:#}"),
            };
            SandboxError::Trap {
                plugin_id: self.store.data().plugin_id.clone(),
                message,
            }
        })?;

        let output = std::mem::take(&mut self.store.data_mut().output);
        Ok(Some((status, output)))
    }
}

/// A wasm plugin instance.
///
/// A wasm instance is single-threaded, so calls into one plugin serialize on
/// its store while calls into different plugins run in parallel on tokio's
/// blocking pool.
pub struct WasmPlugin {
    plugin_id: String,
    sandbox: Arc<Sandbox>,
    state: Arc<Mutex<WasmState>>,
    max_fuel: u64,
}

impl WasmPlugin {
    /// Run an export on the blocking pool.
    ///
    /// With `guard` present the call counts as in flight; teardown calls pass
    /// `None` so they can still reach a closed sandbox. A missing optional
    /// export is a successful no-op returning `None`.
    async fn run(
        &self,
        export: &'static str,
        input: Vec<u8>,
        guard: Option<CallGuard>,
    ) -> Result<Option<Vec<u8>>> {
        let state = Arc::clone(&self.state);
        let plugin_id = self.plugin_id.clone();
        let fuel = self.max_fuel;

        tokio::task::spawn_blocking(move || {
            let _guard = guard;
            let mut wasm = state.lock().map_err(|_| {
                SandboxError::Execution(format!("plugin '{plugin_id}' store lock poisoned"))
            })?;
            match wasm.invoke(export, input, fuel)? {
                None => Ok(None),
                Some((0, output)) => Ok(Some(output)),
                Some((status, _)) => Err(SandboxError::GuestFailure {
                    plugin_id,
                    export: export.to_owned(),
                    status,
                }),
            }
        })
        .await
        .map_err(|e| SandboxError::Execution(format!("blocking task panicked: {e}")))?
    }

    async fn run_hook(&self, export: &'static str, input: Vec<u8>) -> Result<()> {
        let guard = self.sandbox.enter()?;
        self.run(export, input, Some(guard)).await.map(|_| ())
    }
}

#[async_trait]
impl PluginInstance for WasmPlugin {
    fn plugin_id(&self) -> &str {
        &self.plugin_id
    }

    async fn initialize(&self, context: &PluginContext) -> Result<()> {
        let input = serde_json::to_vec(context)
            .map_err(|e| SandboxError::Execution(format!("cannot encode context: {e}")))?;
        self.run_hook("initialize", input).await
    }

    async fn start(&self) -> Result<()> {
        self.run_hook("start", Vec::new()).await
    }

    async fn stop(&self) -> Result<()> {
        self.run_hook("stop", Vec::new()).await
    }

    async fn cleanup(&self) -> Result<()> {
        self.run("cleanup", Vec::new(), None).await.map(|_| ())
    }

    async fn handle_intent(&self, intent_id: &str, parameters: Value) -> Result<Value> {
        let guard = self.sandbox.enter()?;
        let input = serde_json::to_vec(&IntentCall {
            intent_id,
            parameters: &parameters,
        })
        .map_err(|e| SandboxError::Execution(format!("cannot encode intent call: {e}")))?;

        tracing::debug!(plugin_id = %self.plugin_id, intent_id, "dispatching intent into sandbox");

        let output = self
            .run("handle_intent", input, Some(guard))
            .await?
            .ok_or_else(|| {
                SandboxError::Execution(format!(
                    "plugin '{}' does not export `handle_intent`",
                    self.plugin_id
                ))
            })?;

        if output.is_empty() {
            return Ok(Value::Null);
        }
        serde_json::from_slice(&output)
            .map_err(|e| SandboxError::Execution(format!("invalid result JSON: {e}")))
    }
}
