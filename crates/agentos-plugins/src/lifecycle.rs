//! Plugin lifecycle state machine.
//!
//! [`LifecycleManager`] is the host-facing orchestrator. It drives each plugin
//! through
//!
//! ```text
//! unloaded -> loaded -> initialized -> started <-> stopped -> destroyed -> unloaded
//! ```
//!
//! coordinating the [`PluginLoader`], the [`PerformanceMonitor`], and the
//! [`PluginRegistry`]. Transitions of one plugin are serialized on a per-id
//! `tokio::sync::Mutex`; different plugins transition independently. Intent
//! calls only check the state and never hold the lock while the plugin runs.

use std::fmt;
use std::path::Path;
use std::sync::Arc;
use std::time::Instant;

use agentos_sandbox::{PluginContext, SandboxManager};
use dashmap::DashMap;
use serde::{Deserialize, Serialize};
use serde_json::Value;
use tokio::sync::Mutex;

use crate::config::HostConfig;
use crate::error::{PluginError, Result};
use crate::events::{EventBus, EventKind};
use crate::loader::PluginLoader;
use crate::monitor::PerformanceMonitor;
use crate::registry::{InMemoryRegistry, PluginRegistry};

/// Lifecycle state of one plugin.
#[derive(Debug, Clone, Copy, Default, PartialEq, Eq, Hash, Serialize, Deserialize)]
#[serde(rename_all = "lowercase")]
pub enum LifecycleState {
    #[default]
    Unloaded,
    Loaded,
    Initialized,
    Started,
    Stopped,
    Destroyed,
}

impl LifecycleState {
    pub fn as_str(self) -> &'static str {
        match self {
            Self::Unloaded => "unloaded",
            Self::Loaded => "loaded",
            Self::Initialized => "initialized",
            Self::Started => "started",
            Self::Stopped => "stopped",
            Self::Destroyed => "destroyed",
        }
    }

    /// States reachable from this one in a single transition.
    pub fn valid_transitions(self) -> &'static [LifecycleState] {
        match self {
            Self::Unloaded => &[Self::Loaded],
            Self::Loaded => &[Self::Initialized, Self::Unloaded],
            Self::Initialized => &[Self::Started, Self::Destroyed],
            Self::Started => &[Self::Stopped],
            Self::Stopped => &[Self::Started, Self::Destroyed],
            Self::Destroyed => &[Self::Unloaded],
        }
    }

    pub fn can_transition_to(self, target: LifecycleState) -> bool {
        self.valid_transitions().contains(&target)
    }

    /// Whether the plugin accepts intent calls.
    pub fn is_active(self) -> bool {
        self == Self::Started
    }
}

impl fmt::Display for LifecycleState {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.write_str(self.as_str())
    }
}

type Slot = Arc<Mutex<LifecycleState>>;

/// Host-facing plugin lifecycle orchestrator.
pub struct LifecycleManager {
    loader: Arc<PluginLoader>,
    monitor: PerformanceMonitor,
    registry: Arc<dyn PluginRegistry>,
    events: EventBus,
    context: PluginContext,
    /// Slots are never removed so that a waiter never holds a detached slot.
    slots: DashMap<String, Slot>,
}

impl LifecycleManager {
    pub fn new(
        loader: Arc<PluginLoader>,
        monitor: PerformanceMonitor,
        registry: Arc<dyn PluginRegistry>,
    ) -> Self {
        let events = loader.events().clone();
        Self {
            loader,
            monitor,
            registry,
            events,
            context: PluginContext::default(),
            slots: DashMap::new(),
        }
    }

    /// Wire a complete host from configuration: sandbox manager, event bus,
    /// loader, monitor, and an in-memory registry.
    pub fn from_config(config: &HostConfig) -> Result<Self> {
        let sandboxes = Arc::new(SandboxManager::new(config.sandbox.settings())?);
        let events = EventBus::default();
        let loader = PluginLoader::new(config, Arc::clone(&sandboxes), events.clone())?;
        let monitor = PerformanceMonitor::from_config(sandboxes, events, &config.monitor);
        Ok(Self::new(
            Arc::new(loader),
            monitor,
            Arc::new(InMemoryRegistry::new()),
        ))
    }

    /// Host context handed to every plugin's `initialize` hook.
    pub fn with_context(mut self, context: PluginContext) -> Self {
        self.context = context;
        self
    }

    pub fn loader(&self) -> &Arc<PluginLoader> {
        &self.loader
    }

    pub fn monitor(&self) -> &PerformanceMonitor {
        &self.monitor
    }

    pub fn registry(&self) -> &Arc<dyn PluginRegistry> {
        &self.registry
    }

    pub fn events(&self) -> &EventBus {
        &self.events
    }

    fn slot(&self, plugin_id: &str) -> Slot {
        self.slots
            .entry(plugin_id.to_owned())
            .or_insert_with(|| Arc::new(Mutex::new(LifecycleState::Unloaded)))
            .clone()
    }

    fn require(
        plugin_id: &str,
        operation: &'static str,
        current: LifecycleState,
        allowed: &[LifecycleState],
    ) -> Result<()> {
        if allowed.contains(&current) {
            return Ok(());
        }
        let expected = allowed
            .iter()
            .map(|s| s.as_str())
            .collect::<Vec<_>>()
            .join(" or ");
        Err(PluginError::InvalidTransition {
            plugin_id: plugin_id.to_owned(),
            operation,
            current,
            expected,
        })
    }

    fn set_state(&self, plugin_id: &str, state: &mut LifecycleState, to: LifecycleState) {
        let from = *state;
        *state = to;
        tracing::info!(plugin_id, from = %from, to = %to, "plugin state changed");
        self.events.emit(plugin_id, EventKind::StateChanged { from, to });
    }

    /// `unloaded -> loaded`: load the plugin at `path` and register it.
    ///
    /// Returns the plugin id.
    pub async fn load_plugin(&self, path: &Path) -> Result<String> {
        let plugin = self.loader.load_plugin(path, &self.context).await?;
        let plugin_id = plugin.plugin_id().to_owned();

        let slot = self.slot(&plugin_id);
        let mut state = slot.lock().await;
        if let Err(e) = Self::require(&plugin_id, "load", *state, &[LifecycleState::Unloaded]) {
            // Only reachable if the slot went out of sync with the loader.
            let _ = self.loader.unload_plugin(&plugin_id).await;
            return Err(e);
        }

        if let Err(e) = self.register(&plugin_id).await {
            if let Err(unload) = self.loader.unload_plugin(&plugin_id).await {
                tracing::warn!(plugin_id = %plugin_id, error = %unload, "rollback unload failed");
            }
            return Err(e);
        }

        self.set_state(&plugin_id, &mut state, LifecycleState::Loaded);
        Ok(plugin_id)
    }

    async fn register(&self, plugin_id: &str) -> Result<()> {
        let loaded = self
            .loader
            .get(plugin_id)
            .ok_or_else(|| PluginError::NotLoaded {
                plugin_id: plugin_id.to_owned(),
            })?;
        self.registry.register(loaded.metadata).await
    }

    /// `loaded -> initialized`: start monitoring with the sandbox's limits.
    pub async fn initialize_plugin(&self, plugin_id: &str) -> Result<()> {
        let slot = self.slot(plugin_id);
        let mut state = slot.lock().await;
        Self::require(plugin_id, "initialize", *state, &[LifecycleState::Loaded])?;

        let loaded = self.loader.get(plugin_id).ok_or_else(|| PluginError::NotLoaded {
            plugin_id: plugin_id.to_owned(),
        })?;
        self.monitor
            .start_monitoring(plugin_id, *loaded.sandbox.resource_limits(), None);

        self.set_state(plugin_id, &mut state, LifecycleState::Initialized);
        Ok(())
    }

    /// `initialized | stopped -> started`: run the plugin's `start` hook.
    pub async fn start_plugin(&self, plugin_id: &str) -> Result<()> {
        let slot = self.slot(plugin_id);
        let mut state = slot.lock().await;
        Self::require(
            plugin_id,
            "start",
            *state,
            &[LifecycleState::Initialized, LifecycleState::Stopped],
        )?;

        let instance = self.instance(plugin_id)?;
        if let Err(e) = instance.start().await {
            let e = PluginError::from(e);
            self.monitor.record_error(plugin_id, &e);
            return Err(e);
        }

        self.set_state(plugin_id, &mut state, LifecycleState::Started);
        Ok(())
    }

    /// `started -> stopped`: run the plugin's `stop` hook.
    pub async fn stop_plugin(&self, plugin_id: &str) -> Result<()> {
        let slot = self.slot(plugin_id);
        let mut state = slot.lock().await;
        Self::require(plugin_id, "stop", *state, &[LifecycleState::Started])?;

        let instance = self.instance(plugin_id)?;
        if let Err(e) = instance.stop().await {
            let e = PluginError::from(e);
            self.monitor.record_error(plugin_id, &e);
            return Err(e);
        }

        self.set_state(plugin_id, &mut state, LifecycleState::Stopped);
        Ok(())
    }

    /// `initialized | stopped -> destroyed`: stop monitoring.
    pub async fn destroy_plugin(&self, plugin_id: &str) -> Result<()> {
        let slot = self.slot(plugin_id);
        let mut state = slot.lock().await;
        Self::require(
            plugin_id,
            "destroy",
            *state,
            &[LifecycleState::Initialized, LifecycleState::Stopped],
        )?;

        self.monitor.stop_monitoring(plugin_id);
        self.set_state(plugin_id, &mut state, LifecycleState::Destroyed);
        Ok(())
    }

    /// `loaded | destroyed -> unloaded`: unload, destroy the sandbox, and
    /// unregister.
    pub async fn unload_plugin(&self, plugin_id: &str) -> Result<()> {
        let slot = self.slot(plugin_id);
        let mut state = slot.lock().await;
        Self::require(
            plugin_id,
            "unload",
            *state,
            &[LifecycleState::Loaded, LifecycleState::Destroyed],
        )?;

        self.teardown(plugin_id).await?;
        self.set_state(plugin_id, &mut state, LifecycleState::Unloaded);
        Ok(())
    }

    async fn teardown(&self, plugin_id: &str) -> Result<()> {
        self.monitor.stop_monitoring(plugin_id);
        self.loader.unload_plugin(plugin_id).await?;
        self.registry.unregister(plugin_id).await?;
        Ok(())
    }

    /// `loaded | destroyed -> loaded`: unload and load again from the
    /// original directory.
    ///
    /// Not atomic: if the new load fails the plugin ends up unloaded and the
    /// load error is returned.
    pub async fn reload_plugin(&self, plugin_id: &str) -> Result<()> {
        let slot = self.slot(plugin_id);
        let mut state = slot.lock().await;
        Self::require(
            plugin_id,
            "reload",
            *state,
            &[LifecycleState::Loaded, LifecycleState::Destroyed],
        )?;

        let source = self
            .loader
            .get(plugin_id)
            .map(|loaded| loaded.source_path)
            .ok_or_else(|| PluginError::NotLoaded {
                plugin_id: plugin_id.to_owned(),
            })?;

        self.monitor.stop_monitoring(plugin_id);
        self.registry.unregister(plugin_id).await?;
        let reloaded = self.loader.reload_plugin(plugin_id, &self.context).await;
        self.set_state(plugin_id, &mut state, LifecycleState::Unloaded);

        let plugin = reloaded?;
        if plugin.plugin_id() != plugin_id {
            // The manifest id changed on disk; the new plugin gets its own slot.
            let new_id = plugin.plugin_id().to_owned();
            let _ = self.loader.unload_plugin(&new_id).await;
            return Err(PluginError::Manifest {
                path: source.display().to_string(),
                reason: format!("plugin id changed from '{plugin_id}' to '{new_id}' during reload"),
            });
        }

        if let Err(e) = self.register(plugin_id).await {
            let _ = self.loader.unload_plugin(plugin_id).await;
            return Err(e);
        }

        self.set_state(plugin_id, &mut state, LifecycleState::Loaded);
        Ok(())
    }

    fn instance(&self, plugin_id: &str) -> Result<Arc<dyn agentos_sandbox::PluginInstance>> {
        self.loader
            .instance(plugin_id)
            .ok_or_else(|| PluginError::NotLoaded {
                plugin_id: plugin_id.to_owned(),
            })
    }

    /// Send one intent to a started plugin.
    ///
    /// The call's duration is recorded with the monitor; a failure is
    /// recorded as an error and leaves the lifecycle state unchanged.
    pub async fn handle_intent(&self, plugin_id: &str, intent_id: &str, parameters: Value) -> Result<Value> {
        let state = self.state(plugin_id).await;
        if !state.is_active() {
            return Err(PluginError::NotStarted {
                plugin_id: plugin_id.to_owned(),
                state,
            });
        }

        let instance = self.instance(plugin_id)?;
        let started = Instant::now();
        let result = instance.handle_intent(intent_id, parameters).await;
        self.monitor
            .record_intent_handling(plugin_id, started.elapsed());

        result.map_err(|e| {
            let e = PluginError::from(e);
            tracing::debug!(plugin_id, intent_id, error = %e, "intent call failed");
            self.monitor.record_error(plugin_id, &e);
            e
        })
    }

    /// Send an intent to the first started plugin (by id) declaring it.
    pub async fn route_intent(&self, intent_id: &str, parameters: Value) -> Result<Value> {
        for plugin_id in self.registry.find_plugins_by_intent(intent_id).await? {
            if self.state(&plugin_id).await.is_active() {
                tracing::debug!(plugin_id = %plugin_id, intent_id, "intent routed");
                return self.handle_intent(&plugin_id, intent_id, parameters).await;
            }
        }
        Err(PluginError::NoHandler {
            intent_id: intent_id.to_owned(),
        })
    }

    /// Current state of a plugin; `unloaded` if it was never seen.
    pub async fn state(&self, plugin_id: &str) -> LifecycleState {
        let slot = self.slots.get(plugin_id).map(|entry| Arc::clone(entry.value()));
        match slot {
            Some(slot) => *slot.lock().await,
            None => LifecycleState::Unloaded,
        }
    }

    /// Every plugin that is not unloaded, sorted by id.
    pub async fn plugin_states(&self) -> Vec<(String, LifecycleState)> {
        let slots: Vec<(String, Slot)> = self
            .slots
            .iter()
            .map(|entry| (entry.key().clone(), Arc::clone(entry.value())))
            .collect();

        let mut states = Vec::with_capacity(slots.len());
        for (plugin_id, slot) in slots {
            let state = *slot.lock().await;
            if state != LifecycleState::Unloaded {
                states.push((plugin_id, state));
            }
        }
        states.sort_by(|a, b| a.0.cmp(&b.0));
        states
    }

    /// Drive every plugin to `unloaded`, best effort.
    ///
    /// A failing `stop` hook is logged and the plugin is torn down anyway.
    pub async fn shutdown(&self) {
        let ids: Vec<String> = self.plugin_states().await.into_iter().map(|(id, _)| id).collect();
        tracing::info!(count = ids.len(), "shutting down plugins");

        for plugin_id in ids {
            let slot = self.slot(&plugin_id);
            let mut state = slot.lock().await;

            if *state == LifecycleState::Started {
                if let Ok(instance) = self.instance(&plugin_id) {
                    if let Err(e) = instance.stop().await {
                        tracing::warn!(plugin_id = %plugin_id, error = %e, "stop hook failed during shutdown");
                    }
                }
                self.set_state(&plugin_id, &mut state, LifecycleState::Stopped);
            }
            if matches!(*state, LifecycleState::Initialized | LifecycleState::Stopped) {
                self.monitor.stop_monitoring(&plugin_id);
                self.set_state(&plugin_id, &mut state, LifecycleState::Destroyed);
            }
            if matches!(*state, LifecycleState::Loaded | LifecycleState::Destroyed) {
                if let Err(e) = self.teardown(&plugin_id).await {
                    tracing::warn!(plugin_id = %plugin_id, error = %e, "teardown failed during shutdown");
                }
                self.set_state(&plugin_id, &mut state, LifecycleState::Unloaded);
            }
        }
    }
}
