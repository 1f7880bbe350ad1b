//! Shared fixtures for the plugin host integration tests.
//!
//! Plugins are written to temporary directories as a `plugin.json` manifest
//! plus a `plugin.wat` entry module, which wasmtime compiles from text.

#![allow(dead_code)]

use std::path::{Path, PathBuf};
use std::sync::Arc;

use agentos_plugins::{HostConfig, LifecycleManager, PluginEvent};
use serde_json::{Value, json};
use tokio::sync::broadcast;

/// Answers every intent with `{"ok":true}` unless the intent id starts with
/// `c`, which traps. Every hook succeeds.
pub const ECHO: &str = r#"
(module
  (import "env" "host_read_input" (func $read_input (param i32 i32) (result i32)))
  (import "env" "host_set_result" (func $set_result (param i32 i32)))
  (memory (export "memory") 1)
  (data (i32.const 16) "{\"ok\":true}")
  (func (export "create_plugin") (result i32) (i32.const 0))
  (func (export "initialize") (result i32) (i32.const 0))
  (func (export "start") (result i32) (i32.const 0))
  (func (export "stop") (result i32) (i32.const 0))
  (func (export "cleanup") (result i32) (i32.const 0))
  (func (export "handle_intent") (result i32)
    (drop (call $read_input (i32.const 1024) (i32.const 4096)))
    ;; byte 13 of {"intentId":"... is the first character of the id
    (if (i32.eq (i32.load8_u (i32.const 1037)) (i32.const 99))
      (then (unreachable)))
    (call $set_result (i32.const 16) (i32.const 11))
    (i32.const 0))
)
"#;

/// Reserves 40 pages (2.5 MiB) of linear memory up front.
pub const HOG: &str = r#"
(module
  (memory (export "memory") 40)
  (func (export "create_plugin") (result i32) (i32.const 0))
  (func (export "start") (result i32) (i32.const 0))
)
"#;

/// `start` fails with status 7.
pub const FAILING_START: &str = r#"
(module
  (memory (export "memory") 1)
  (func (export "create_plugin") (result i32) (i32.const 0))
  (func (export "start") (result i32) (i32.const 7))
)
"#;

/// Compiles but has no `create_plugin` factory.
pub const NO_FACTORY: &str = r#"
(module
  (memory (export "memory") 1)
  (func (export "start") (result i32) (i32.const 0))
)
"#;

/// A well-formed manifest declaring `intents`.
pub fn manifest(id: &str, intents: &[&str]) -> Value {
    let intents: Vec<Value> = intents.iter().map(|i| json!({ "intentId": i })).collect();
    json!({
        "id": id,
        "name": id,
        "version": "1.0.0",
        "description": "integration test plugin",
        "author": "AgentOS",
        "main": "plugin.wat",
        "agentOSVersion": "^1.0.0",
        "permissions": [],
        "intents": intents,
    })
}

/// Write a plugin directory named `dir_name` under `root`.
pub fn write_plugin(root: &Path, dir_name: &str, manifest: &Value, wat: &str) -> PathBuf {
    let dir = root.join(dir_name);
    std::fs::create_dir_all(&dir).expect("plugin dir must be created in tests");
    std::fs::write(dir.join("plugin.json"), manifest.to_string())
        .expect("manifest must be written in tests");
    std::fs::write(dir.join("plugin.wat"), wat).expect("module must be written in tests");
    dir
}

/// Host configuration rooted at `root`. The background sampler is pushed out
/// to an hour so tests drive sampling by hand.
pub fn config(root: &Path) -> HostConfig {
    let mut config = HostConfig::default();
    config.plugins.directories = vec![root.to_path_buf()];
    config.plugins.unload_drain_timeout_ms = 1_000;
    config.monitor.sample_interval_ms = 3_600_000;
    config
}

pub fn host(root: &Path) -> Arc<LifecycleManager> {
    Arc::new(LifecycleManager::from_config(&config(root)).expect("host must build in tests"))
}

/// Load, initialize, and start the plugin at `dir`. Returns its id.
pub async fn start(host: &LifecycleManager, dir: &Path) -> String {
    let id = host.load_plugin(dir).await.expect("load must succeed in tests");
    host.initialize_plugin(&id)
        .await
        .expect("initialize must succeed in tests");
    host.start_plugin(&id).await.expect("start must succeed in tests");
    id
}

/// Names of every event buffered on `rx`.
pub fn drain(rx: &mut broadcast::Receiver<Arc<PluginEvent>>) -> Vec<Arc<PluginEvent>> {
    let mut events = Vec::new();
    while let Ok(event) = rx.try_recv() {
        events.push(event);
    }
    events
}

pub fn names(events: &[Arc<PluginEvent>]) -> Vec<&'static str> {
    events.iter().map(|e| e.name()).collect()
}
