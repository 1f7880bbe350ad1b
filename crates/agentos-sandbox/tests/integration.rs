//! Integration tests for the agentos-sandbox crate.
//!
//! Guest modules are written as WAT text, which wasmtime compiles directly.

use std::path::PathBuf;
use std::sync::Arc;

use agentos_sandbox::{
    HostApi, NetworkProvider, PluginContext, SandboxError, SandboxManager, SandboxOptions,
};
use serde_json::json;

fn write_module(dir: &tempfile::TempDir, wat: &str) -> PathBuf {
    let path = dir.path().join("plugin.wat");
    std::fs::write(&path, wat).expect("write must succeed");
    path
}

/// Echoes `{"ok":true}` unless the intent id starts with `c`, in which case it
/// hits `unreachable`. `start` fails with status 7.
const CRASHY: &str = r#"
(module
  (import "env" "host_read_input" (func $read_input (param i32 i32) (result i32)))
  (import "env" "host_set_result" (func $set_result (param i32 i32)))
  (import "env" "host_log" (func $log (param i32 i32 i32)))
  (memory (export "memory") 1)
  (data (i32.const 16) "{\"ok\":true}")
  (data (i32.const 64) "ready")
  (func (export "create_plugin") (result i32) (i32.const 0))
  (func (export "initialize") (result i32)
    (call $log (i32.const 2) (i32.const 64) (i32.const 5))
    (i32.const 0))
  (func (export "start") (result i32) (i32.const 7))
  (func (export "handle_intent") (result i32)
    (drop (call $read_input (i32.const 1024) (i32.const 4096)))
    (if (i32.eq (i32.load8_u (i32.const 1037)) (i32.const 99))
      (then (unreachable)))
    (call $set_result (i32.const 16) (i32.const 11))
    (i32.const 0))
)
"#;

const DATA_STORE: &str = r#"
(module
  (import "env" "host_data_set" (func $set (param i32 i32 i32 i32) (result i32)))
  (import "env" "host_data_get" (func $get (param i32 i32 i32 i32) (result i32)))
  (import "env" "host_set_result" (func $set_result (param i32 i32)))
  (memory (export "memory") 1)
  (data (i32.const 0) "greeting")
  (data (i32.const 16) "\"hello\"")
  (func (export "create_plugin") (result i32) (i32.const 0))
  (func (export "handle_intent") (result i32)
    (local $n i32)
    (drop (call $set (i32.const 0) (i32.const 8) (i32.const 16) (i32.const 7)))
    (local.set $n (call $get (i32.const 0) (i32.const 8) (i32.const 256) (i32.const 64)))
    (call $set_result (i32.const 256) (local.get $n))
    (i32.const 0))
)
"#;

const NETWORK: &str = r#"
(module
  (import "env" "host_net_request" (func $net (param i32 i32 i32 i32) (result i32)))
  (import "env" "host_set_result" (func $set_result (param i32 i32)))
  (memory (export "memory") 1)
  (data (i32.const 0) "ping")
  (func (export "create_plugin") (result i32) (i32.const 0))
  (func (export "handle_intent") (result i32)
    (local $n i32)
    (local.set $n (call $net (i32.const 0) (i32.const 4) (i32.const 128) (i32.const 64)))
    (call $set_result (i32.const 128) (local.get $n))
    (i32.const 0))
)
"#;

struct EchoNetwork;

impl NetworkProvider for EchoNetwork {
    fn request(&self, _plugin_id: &str, request: &[u8]) -> Result<Vec<u8>, String> {
        assert_eq!(request, b"ping");
        Ok(b"\"pong\"".to_vec())
    }
}

#[tokio::test]
async fn lifecycle_hooks_and_intent_call() {
    let dir = tempfile::tempdir().unwrap();
    let path = write_module(&dir, CRASHY);
    let manager = SandboxManager::with_defaults().unwrap();
    let sandbox = manager.create_sandbox("crashy", SandboxOptions::new()).unwrap();

    let module = manager.load_module(&path, &sandbox).unwrap();
    assert!(module.exports_factory());
    let plugin = module.create_plugin().unwrap();
    assert_eq!(plugin.plugin_id(), "crashy");

    plugin
        .initialize(&PluginContext::new().with_user_id("u-1"))
        .await
        .expect("initialize must succeed");
    // `stop` is not exported: a missing optional hook is a no-op.
    plugin.stop().await.expect("missing hook is a no-op");

    let result = plugin.handle_intent("echo", json!({})).await.unwrap();
    assert_eq!(result, json!({ "ok": true }));
}

#[tokio::test]
async fn non_zero_hook_status_is_guest_failure() {
    let dir = tempfile::tempdir().unwrap();
    let path = write_module(&dir, CRASHY);
    let manager = SandboxManager::with_defaults().unwrap();
    let sandbox = manager.create_sandbox("crashy", SandboxOptions::new()).unwrap();
    let plugin = manager
        .load_module(&path, &sandbox)
        .unwrap()
        .create_plugin()
        .unwrap();

    match plugin.start().await {
        Err(SandboxError::GuestFailure { export, status, .. }) => {
            assert_eq!(export, "start");
            assert_eq!(status, 7);
        }
        other => panic!("expected GuestFailure, got {other:?}"),
    }
}

#[tokio::test]
async fn trap_does_not_poison_the_instance() {
    let dir = tempfile::tempdir().unwrap();
    let path = write_module(&dir, CRASHY);
    let manager = SandboxManager::with_defaults().unwrap();
    let sandbox = manager.create_sandbox("crashy", SandboxOptions::new()).unwrap();
    let plugin = manager
        .load_module(&path, &sandbox)
        .unwrap()
        .create_plugin()
        .unwrap();

    let err = plugin.handle_intent("crash", json!({})).await.unwrap_err();
    assert_eq!(err.code(), "PLUGIN_TRAPPED");

    let ok = plugin.handle_intent("echo", json!({})).await.unwrap();
    assert_eq!(ok, json!({ "ok": true }));

    let usage = sandbox.usage();
    assert_eq!(usage.traps, 1);
    assert!(usage.calls >= 3);
    assert_eq!(usage.memory_bytes, 65536);
}

#[tokio::test]
async fn data_store_round_trip() {
    let dir = tempfile::tempdir().unwrap();
    let path = write_module(&dir, DATA_STORE);
    let manager = SandboxManager::with_defaults().unwrap();
    let sandbox = manager
        .create_sandbox("store", SandboxOptions::new().allow(HostApi::DataAccess))
        .unwrap();
    let plugin = manager
        .load_module(&path, &sandbox)
        .unwrap()
        .create_plugin()
        .unwrap();

    let result = plugin.handle_intent("remember", json!({})).await.unwrap();
    assert_eq!(result, json!("hello"));
    assert_eq!(sandbox.usage().storage_bytes, 15);
}

#[test]
fn ungranted_import_is_capability_denied() {
    let dir = tempfile::tempdir().unwrap();
    let path = write_module(&dir, DATA_STORE);
    let manager = SandboxManager::with_defaults().unwrap();
    let sandbox = manager.create_sandbox("store", SandboxOptions::new()).unwrap();

    match manager.load_module(&path, &sandbox) {
        Err(SandboxError::CapabilityDenied { plugin_id, import }) => {
            assert_eq!(plugin_id, "store");
            assert!(import.starts_with("env::host_data_"));
        }
        Err(other) => panic!("expected CapabilityDenied, got {other}"),
        Ok(_) => panic!("module must not load without the data capability"),
    }
}

#[test]
fn unknown_import_is_rejected() {
    let dir = tempfile::tempdir().unwrap();
    let path = write_module(
        &dir,
        r#"(module
             (import "wasi_snapshot_preview1" "proc_exit" (func (param i32)))
             (memory (export "memory") 1)
             (func (export "create_plugin") (result i32) (i32.const 0)))"#,
    );
    let manager = SandboxManager::with_defaults().unwrap();
    let sandbox = manager.create_sandbox("escape", SandboxOptions::new()).unwrap();
    let result = manager.load_module(&path, &sandbox);
    assert!(matches!(result, Err(SandboxError::Instantiation(_))));
}

#[test]
fn module_without_factory_is_reported() {
    let dir = tempfile::tempdir().unwrap();
    let path = write_module(&dir, r#"(module (memory (export "memory") 1))"#);
    let manager = SandboxManager::with_defaults().unwrap();
    let sandbox = manager.create_sandbox("bare", SandboxOptions::new()).unwrap();
    let module = manager.load_module(&path, &sandbox).unwrap();

    assert!(!module.exports_factory());
    assert!(matches!(
        module.create_plugin(),
        Err(SandboxError::MissingFactory { .. })
    ));
}

#[tokio::test]
async fn network_requires_provider_and_counts_bytes() {
    let dir = tempfile::tempdir().unwrap();
    let path = write_module(&dir, NETWORK);
    let manager = SandboxManager::with_defaults()
        .unwrap()
        .with_network_provider(Arc::new(EchoNetwork));
    let sandbox = manager
        .create_sandbox(
            "net",
            SandboxOptions::new()
                .allow(HostApi::Network)
                .with_network_access(true),
        )
        .unwrap();
    let plugin = manager
        .load_module(&path, &sandbox)
        .unwrap()
        .create_plugin()
        .unwrap();

    let result = plugin.handle_intent("fetch", json!({})).await.unwrap();
    assert_eq!(result, json!("pong"));
    assert_eq!(sandbox.usage().network_bytes, 4 + 6);
}

#[tokio::test]
async fn destroyed_sandbox_rejects_new_calls() {
    let dir = tempfile::tempdir().unwrap();
    let path = write_module(&dir, CRASHY);
    let manager = SandboxManager::with_defaults().unwrap();
    let sandbox = manager.create_sandbox("crashy", SandboxOptions::new()).unwrap();
    let plugin = manager
        .load_module(&path, &sandbox)
        .unwrap()
        .create_plugin()
        .unwrap();

    manager.destroy_sandbox("crashy");
    let err = plugin.handle_intent("echo", json!({})).await.unwrap_err();
    assert!(matches!(err, SandboxError::Closed { .. }));

    // Teardown hooks still run against a closed sandbox.
    plugin.cleanup().await.expect("cleanup is a no-op here");
}
