//! Plugin registry.
//!
//! The registry is the host's lookup table of installed plugin manifests,
//! keyed by plugin id and searchable by declared intent. Persistence is the
//! host's concern: [`PluginRegistry`] is the seam, and [`InMemoryRegistry`]
//! is a [`DashMap`]-backed implementation for tests and the CLI.

use std::sync::Arc;

use async_trait::async_trait;
use chrono::{DateTime, Utc};
use dashmap::DashMap;
use serde::Serialize;

use crate::error::{PluginError, Result};
use crate::manifest::PluginManifest;

/// A manifest together with its registration time.
#[derive(Debug, Clone, Serialize)]
#[serde(rename_all = "camelCase")]
pub struct RegisteredPlugin {
    pub manifest: PluginManifest,
    pub registered_at: DateTime<Utc>,
}

/// Lookup table of installed plugins.
#[async_trait]
pub trait PluginRegistry: Send + Sync {
    /// Register a manifest. Fails if the id is already registered.
    async fn register(&self, manifest: PluginManifest) -> Result<()>;

    /// Remove a plugin. Returns whether it was registered.
    async fn unregister(&self, plugin_id: &str) -> Result<bool>;

    async fn get_plugin(&self, plugin_id: &str) -> Result<Option<RegisteredPlugin>>;

    /// Ids of plugins declaring `intent_id`, sorted.
    async fn find_plugins_by_intent(&self, intent_id: &str) -> Result<Vec<String>>;

    /// Every registered plugin, sorted by id.
    async fn list_plugins(&self) -> Result<Vec<RegisteredPlugin>>;
}

/// Concurrent in-memory registry. Cheaply cloneable.
#[derive(Clone, Default)]
pub struct InMemoryRegistry {
    inner: Arc<DashMap<String, RegisteredPlugin>>,
}

impl InMemoryRegistry {
    #[must_use]
    pub fn new() -> Self {
        Self::default()
    }

    pub fn len(&self) -> usize {
        self.inner.len()
    }

    pub fn is_empty(&self) -> bool {
        self.inner.is_empty()
    }

    pub fn contains(&self, plugin_id: &str) -> bool {
        self.inner.contains_key(plugin_id)
    }
}

#[async_trait]
impl PluginRegistry for InMemoryRegistry {
    async fn register(&self, manifest: PluginManifest) -> Result<()> {
        use dashmap::mapref::entry::Entry;

        match self.inner.entry(manifest.id.clone()) {
            Entry::Occupied(_) => Err(PluginError::Registry(format!(
                "plugin '{}' is already registered",
                manifest.id
            ))),
            Entry::Vacant(slot) => {
                tracing::info!(plugin_id = %manifest.id, version = %manifest.version, "plugin registered");
                slot.insert(RegisteredPlugin {
                    manifest,
                    registered_at: Utc::now(),
                });
                Ok(())
            }
        }
    }

    async fn unregister(&self, plugin_id: &str) -> Result<bool> {
        let removed = self.inner.remove(plugin_id).is_some();
        if removed {
            tracing::info!(plugin_id, "plugin unregistered");
        }
        Ok(removed)
    }

    async fn get_plugin(&self, plugin_id: &str) -> Result<Option<RegisteredPlugin>> {
        Ok(self.inner.get(plugin_id).map(|entry| entry.value().clone()))
    }

    async fn find_plugins_by_intent(&self, intent_id: &str) -> Result<Vec<String>> {
        let mut ids: Vec<String> = self
            .inner
            .iter()
            .filter(|entry| entry.value().manifest.handles_intent(intent_id))
            .map(|entry| entry.key().clone())
            .collect();
        ids.sort();
        Ok(ids)
    }

    async fn list_plugins(&self) -> Result<Vec<RegisteredPlugin>> {
        let mut all: Vec<RegisteredPlugin> = self.inner.iter().map(|e| e.value().clone()).collect();
        all.sort_by(|a, b| a.manifest.id.cmp(&b.manifest.id));
        Ok(all)
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    fn manifest(id: &str, intents: &[&str]) -> PluginManifest {
        let intents: Vec<serde_json::Value> = intents
            .iter()
            .map(|i| serde_json::json!({ "intentId": i }))
            .collect();
        serde_json::from_value(serde_json::json!({
            "id": id,
            "name": id,
            "version": "1.0.0",
            "description": "test",
            "author": "tests",
            "intents": intents,
        }))
        .expect("test manifest must decode")
    }

    #[tokio::test]
    async fn register_get_unregister() {
        let registry = InMemoryRegistry::new();
        registry.register(manifest("weather", &["weather.get"])).await.unwrap();
        assert!(registry.contains("weather"));

        let found = registry.get_plugin("weather").await.unwrap().unwrap();
        assert_eq!(found.manifest.name, "weather");

        assert!(registry.unregister("weather").await.unwrap());
        assert!(!registry.unregister("weather").await.unwrap());
        assert!(registry.get_plugin("weather").await.unwrap().is_none());
    }

    #[tokio::test]
    async fn duplicate_registration_fails() {
        let registry = InMemoryRegistry::new();
        registry.register(manifest("a", &[])).await.unwrap();
        let err = registry.register(manifest("a", &[])).await.unwrap_err();
        assert_eq!(err.code(), "REGISTRY_ERROR");
        assert_eq!(registry.len(), 1);
    }

    #[tokio::test]
    async fn find_by_intent_is_sorted() {
        let registry = InMemoryRegistry::new();
        registry.register(manifest("zeta", &["greet"])).await.unwrap();
        registry.register(manifest("alpha", &["greet", "bye"])).await.unwrap();
        registry.register(manifest("mid", &["bye"])).await.unwrap();

        assert_eq!(
            registry.find_plugins_by_intent("greet").await.unwrap(),
            vec!["alpha".to_owned(), "zeta".to_owned()]
        );
        assert!(registry.find_plugins_by_intent("none").await.unwrap().is_empty());

        let ids: Vec<String> = registry
            .list_plugins()
            .await
            .unwrap()
            .into_iter()
            .map(|p| p.manifest.id)
            .collect();
        assert_eq!(ids, vec!["alpha", "mid", "zeta"]);
    }
}
