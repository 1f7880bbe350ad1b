//! Plugin event bus.
//!
//! Loader, monitor, and lifecycle manager report what happens to plugins by
//! publishing [`PluginEvent`]s on a shared [`EventBus`], a thin wrapper over
//! [`tokio::sync::broadcast`]. Events are wrapped in [`Arc`] so fan-out to
//! many subscribers does not clone payloads.
//!
//! # Usage
//!
//! ```rust,no_run
//! # use agentos_plugins::events::{EventBus, EventKind, PluginEvent};
//! # async fn example() {
//! let bus = EventBus::new(256);
//! let mut rx = bus.subscribe();
//!
//! bus.publish(PluginEvent::new("weather", EventKind::Installed { version: "1.0.0".into() }));
//!
//! let event = rx.recv().await.unwrap();
//! assert_eq!(event.name(), "plugin:installed");
//! # }
//! ```

use std::sync::Arc;

use chrono::{DateTime, Utc};
use serde::Serialize;
use tokio::sync::broadcast;

use crate::lifecycle::LifecycleState;
use crate::monitor::ResourceKind;

/// An event about one plugin.
#[derive(Debug, Clone, Serialize)]
#[serde(rename_all = "camelCase")]
pub struct PluginEvent {
    pub plugin_id: String,
    pub timestamp: DateTime<Utc>,
    #[serde(flatten)]
    pub kind: EventKind,
}

impl PluginEvent {
    pub fn new(plugin_id: impl Into<String>, kind: EventKind) -> Self {
        Self {
            plugin_id: plugin_id.into(),
            timestamp: Utc::now(),
            kind,
        }
    }

    /// Wire name of the event, e.g. `plugin:installed`.
    pub fn name(&self) -> &'static str {
        self.kind.name()
    }
}

/// Event payloads.
#[derive(Debug, Clone, PartialEq, Serialize)]
#[serde(tag = "event", rename_all_fields = "camelCase")]
pub enum EventKind {
    /// The plugin was loaded and recorded by the loader.
    #[serde(rename = "plugin:installed")]
    Installed { version: String },

    /// The plugin was unloaded and its sandbox destroyed.
    #[serde(rename = "plugin:uninstalled")]
    Uninstalled,

    /// A plugin call failed.
    #[serde(rename = "plugin:error")]
    Error { code: String, message: String },

    /// A resource ceiling was exceeded in one sample.
    #[serde(rename = "resourceViolation")]
    ResourceViolation {
        resource: ResourceKind,
        value: f64,
        limit: f64,
        count: u32,
    },

    /// A resource reached the severe violation count. Advisory; the host
    /// decides whether to stop or unload the plugin.
    #[serde(rename = "severeViolation")]
    SevereViolation { resource: ResourceKind, count: u32 },

    #[serde(rename = "monitoringStarted")]
    MonitoringStarted,

    #[serde(rename = "monitoringStopped")]
    MonitoringStopped,

    /// A lifecycle transition completed.
    #[serde(rename = "plugin:stateChanged")]
    StateChanged {
        from: LifecycleState,
        to: LifecycleState,
    },
}

impl EventKind {
    pub fn name(&self) -> &'static str {
        match self {
            Self::Installed { .. } => "plugin:installed",
            Self::Uninstalled => "plugin:uninstalled",
            Self::Error { .. } => "plugin:error",
            Self::ResourceViolation { .. } => "resourceViolation",
            Self::SevereViolation { .. } => "severeViolation",
            Self::MonitoringStarted => "monitoringStarted",
            Self::MonitoringStopped => "monitoringStopped",
            Self::StateChanged { .. } => "plugin:stateChanged",
        }
    }
}

/// Publish/subscribe event bus backed by [`tokio::sync::broadcast`].
///
/// Cheaply cloneable and `Send + Sync`.
#[derive(Clone)]
pub struct EventBus {
    sender: broadcast::Sender<Arc<PluginEvent>>,
}

impl EventBus {
    /// Create a bus with the given channel capacity.
    ///
    /// A subscriber falling more than `capacity` events behind receives
    /// [`broadcast::error::RecvError::Lagged`].
    #[must_use]
    pub fn new(capacity: usize) -> Self {
        let (sender, _) = broadcast::channel(capacity);
        Self { sender }
    }

    /// Publish an event to all current subscribers.
    ///
    /// Returns the number of receivers. With no subscribers the event is
    /// dropped, which is not an error.
    pub fn publish(&self, event: PluginEvent) -> usize {
        let name = event.name();
        let plugin_id = event.plugin_id.clone();
        match self.sender.send(Arc::new(event)) {
            Ok(n) => {
                tracing::trace!(plugin_id = %plugin_id, event = name, receivers = n, "event published");
                n
            }
            Err(_) => {
                tracing::trace!(plugin_id = %plugin_id, event = name, "event published but no active receivers");
                0
            }
        }
    }

    /// Shorthand for `publish(PluginEvent::new(plugin_id, kind))`.
    pub fn emit(&self, plugin_id: &str, kind: EventKind) -> usize {
        self.publish(PluginEvent::new(plugin_id, kind))
    }

    /// Subscribe to all future events. Past events are not replayed.
    pub fn subscribe(&self) -> broadcast::Receiver<Arc<PluginEvent>> {
        self.sender.subscribe()
    }

    pub fn subscriber_count(&self) -> usize {
        self.sender.receiver_count()
    }
}

impl Default for EventBus {
    fn default() -> Self {
        Self::new(1024)
    }
}
