//! Host functions linked into guest modules.
//!
//! Every function lives in the `env` namespace. The call ABI
//! (`host_input_len`, `host_read_input`, `host_set_result`) is always linked;
//! everything else is linked only when the sandbox grants the matching
//! [`HostApi`]. A module that imports an ungranted function is rejected before
//! instantiation.
//!
//! Functions that hand data to the guest take an output pointer and capacity
//! and return the number of bytes written, `-1` when the request failed or the
//! item does not exist, and `-2` when the buffer is too small.

use std::collections::BTreeSet;
use std::path::{Path, PathBuf};
use std::sync::Arc;

use wasmtime::{Caller, Extern, Linker, Memory, Module};

use crate::capability::{CALL_ABI_IMPORTS, HOST_MODULE, HostApi};
use crate::error::{Result, SandboxError};
use crate::sandbox::Sandbox;

const NOT_FOUND: i32 = -1;
const BUFFER_TOO_SMALL: i32 = -2;

/// Carries network requests on behalf of plugins granted the network API.
///
/// The request and response formats are opaque to the sandbox; the provider
/// decides what a request means. Bytes in both directions are counted towards
/// the plugin's network usage.
pub trait NetworkProvider: Send + Sync {
    fn request(&self, plugin_id: &str, request: &[u8]) -> std::result::Result<Vec<u8>, String>;
}

/// Per-instance state stored in the wasmtime [`wasmtime::Store`].
pub(crate) struct HostState {
    pub plugin_id: String,
    pub sandbox: Arc<Sandbox>,
    /// Directory the filesystem API is confined to.
    pub root_dir: PathBuf,
    pub network: Option<Arc<dyn NetworkProvider>>,
    pub max_io_bytes: usize,
    /// Input of the current call.
    pub input: Vec<u8>,
    /// Result written by the guest during the current call.
    pub output: Vec<u8>,
}

/// Reject modules that import anything outside the sandbox allow-list.
pub(crate) fn check_imports(module: &Module, sandbox: &Sandbox) -> Result<()> {
    for import in module.imports() {
        let name = import.name();
        if import.module() == HOST_MODULE {
            if CALL_ABI_IMPORTS.contains(&name) {
                continue;
            }
            if let Some(api) = HostApi::for_import(name) {
                if sandbox.allows(api) {
                    continue;
                }
                return Err(SandboxError::CapabilityDenied {
                    plugin_id: sandbox.plugin_id().to_owned(),
                    import: format!("{HOST_MODULE}::{name}"),
                });
            }
        }
        return Err(SandboxError::Instantiation(format!(
            "unknown import `{}::{}`",
            import.module(),
            name
        )));
    }
    Ok(())
}

/// Link the call ABI plus the host functions of every granted capability.
pub(crate) fn define_host_functions(
    linker: &mut Linker<HostState>,
    apis: &BTreeSet<HostApi>,
) -> Result<()> {
    define_call_abi(linker)?;
    for api in apis {
        match api {
            HostApi::Timers => define_timers(linker)?,
            HostApi::Logging => define_logging(linker)?,
            HostApi::DataAccess => define_data_access(linker)?,
            HostApi::SystemInfo => define_system_info(linker)?,
            HostApi::Network => define_network(linker)?,
            HostApi::DeviceInfo => define_device_info(linker)?,
            HostApi::FileSystem => define_file_system(linker)?,
        }
    }
    Ok(())
}

fn link_error(e: wasmtime::Error) -> SandboxError {
    SandboxError::Instantiation(e.to_string())
}

fn define_call_abi(linker: &mut Linker<HostState>) -> Result<()> {
    linker
        .func_wrap(HOST_MODULE, "host_input_len", |caller: Caller<'_, HostState>| -> i32 {
            i32::try_from(caller.data().input.len()).unwrap_or(i32::MAX)
        })
        .map_err(link_error)?;

    linker
        .func_wrap(
            HOST_MODULE,
            "host_read_input",
            |mut caller: Caller<'_, HostState>, ptr: i32, cap: i32| -> i32 {
                let input = caller.data().input.clone();
                write_bytes(&mut caller, ptr, cap, &input)
            },
        )
        .map_err(link_error)?;

    linker
        .func_wrap(
            HOST_MODULE,
            "host_set_result",
            |mut caller: Caller<'_, HostState>, ptr: i32, len: i32| {
                match read_bytes(&mut caller, ptr, len) {
                    Some(bytes) => caller.data_mut().output = bytes,
                    None => tracing::warn!(
                        plugin_id = %caller.data().plugin_id,
                        "plugin result out of bounds or too large, ignored"
                    ),
                }
            },
        )
        .map_err(link_error)?;

    Ok(())
}

fn define_timers(linker: &mut Linker<HostState>) -> Result<()> {
    linker
        .func_wrap(HOST_MODULE, "host_now_ms", || -> i64 {
            chrono::Utc::now().timestamp_millis()
        })
        .map_err(link_error)?;
    Ok(())
}

fn define_logging(linker: &mut Linker<HostState>) -> Result<()> {
    linker
        .func_wrap(
            HOST_MODULE,
            "host_log",
            |mut caller: Caller<'_, HostState>, level: i32, ptr: i32, len: i32| {
                let Some(bytes) = read_bytes(&mut caller, ptr, len) else {
                    return;
                };
                let msg = String::from_utf8_lossy(&bytes);
                let plugin_id = caller.data().plugin_id.as_str();
                match level {
                    0 => tracing::error!(plugin_id, plugin_msg = %msg),
                    1 => tracing::warn!(plugin_id, plugin_msg = %msg),
                    2 => tracing::info!(plugin_id, plugin_msg = %msg),
                    3 => tracing::debug!(plugin_id, plugin_msg = %msg),
                    _ => tracing::trace!(plugin_id, plugin_msg = %msg),
                }
            },
        )
        .map_err(link_error)?;
    Ok(())
}

fn define_data_access(linker: &mut Linker<HostState>) -> Result<()> {
    linker
        .func_wrap(
            HOST_MODULE,
            "host_data_get",
            |mut caller: Caller<'_, HostState>,
             key_ptr: i32,
             key_len: i32,
             out_ptr: i32,
             out_cap: i32|
             -> i32 {
                let Some(key) = read_string(&mut caller, key_ptr, key_len) else {
                    return NOT_FOUND;
                };
                let value = caller.data().sandbox.data_get(&key);
                match value {
                    Some(value) => write_bytes(&mut caller, out_ptr, out_cap, &value),
                    None => NOT_FOUND,
                }
            },
        )
        .map_err(link_error)?;

    linker
        .func_wrap(
            HOST_MODULE,
            "host_data_set",
            |mut caller: Caller<'_, HostState>,
             key_ptr: i32,
             key_len: i32,
             val_ptr: i32,
             val_len: i32|
             -> i32 {
                let Some(key) = read_string(&mut caller, key_ptr, key_len) else {
                    return NOT_FOUND;
                };
                let Some(value) = read_bytes(&mut caller, val_ptr, val_len) else {
                    return NOT_FOUND;
                };
                caller.data().sandbox.data_set(key, value);
                0
            },
        )
        .map_err(link_error)?;
    Ok(())
}

fn define_system_info(linker: &mut Linker<HostState>) -> Result<()> {
    linker
        .func_wrap(
            HOST_MODULE,
            "host_system_info",
            |mut caller: Caller<'_, HostState>, out_ptr: i32, out_cap: i32| -> i32 {
                let info = serde_json::json!({
                    "host": "agentos",
                    "hostVersion": env!("CARGO_PKG_VERSION"),
                    "pluginId": caller.data().plugin_id,
                    "sandboxCreatedAt": caller.data().sandbox.created_at().to_rfc3339(),
                });
                write_bytes(&mut caller, out_ptr, out_cap, info.to_string().as_bytes())
            },
        )
        .map_err(link_error)?;
    Ok(())
}

fn define_device_info(linker: &mut Linker<HostState>) -> Result<()> {
    linker
        .func_wrap(
            HOST_MODULE,
            "host_device_info",
            |mut caller: Caller<'_, HostState>, out_ptr: i32, out_cap: i32| -> i32 {
                let cpus = std::thread::available_parallelism()
                    .map(|n| n.get())
                    .unwrap_or(1);
                let info = serde_json::json!({
                    "os": std::env::consts::OS,
                    "arch": std::env::consts::ARCH,
                    "cpus": cpus,
                });
                write_bytes(&mut caller, out_ptr, out_cap, info.to_string().as_bytes())
            },
        )
        .map_err(link_error)?;
    Ok(())
}

fn define_network(linker: &mut Linker<HostState>) -> Result<()> {
    linker
        .func_wrap(
            HOST_MODULE,
            "host_net_request",
            |mut caller: Caller<'_, HostState>,
             req_ptr: i32,
             req_len: i32,
             out_ptr: i32,
             out_cap: i32|
             -> i32 {
                let Some(request) = read_bytes(&mut caller, req_ptr, req_len) else {
                    return NOT_FOUND;
                };
                let Some(provider) = caller.data().network.clone() else {
                    tracing::debug!(
                        plugin_id = %caller.data().plugin_id,
                        "network request with no network provider configured"
                    );
                    return NOT_FOUND;
                };
                let plugin_id = caller.data().plugin_id.clone();
                match provider.request(&plugin_id, &request) {
                    Ok(response) => {
                        let moved = (request.len() + response.len()) as u64;
                        caller.data().sandbox.record_network(moved);
                        write_bytes(&mut caller, out_ptr, out_cap, &response)
                    }
                    Err(reason) => {
                        caller.data().sandbox.record_network(request.len() as u64);
                        tracing::debug!(plugin_id = %plugin_id, reason = %reason, "network request failed");
                        NOT_FOUND
                    }
                }
            },
        )
        .map_err(link_error)?;
    Ok(())
}

fn define_file_system(linker: &mut Linker<HostState>) -> Result<()> {
    linker
        .func_wrap(
            HOST_MODULE,
            "host_fs_read",
            |mut caller: Caller<'_, HostState>,
             path_ptr: i32,
             path_len: i32,
             out_ptr: i32,
             out_cap: i32|
             -> i32 {
                let Some(requested) = read_string(&mut caller, path_ptr, path_len) else {
                    return NOT_FOUND;
                };
                let Some(path) = resolve_in_root(&caller.data().root_dir, &requested) else {
                    tracing::warn!(
                        plugin_id = %caller.data().plugin_id,
                        path = %requested,
                        "filesystem read outside plugin directory denied"
                    );
                    return NOT_FOUND;
                };
                match std::fs::read(&path) {
                    Ok(contents) => write_bytes(&mut caller, out_ptr, out_cap, &contents),
                    Err(_) => NOT_FOUND,
                }
            },
        )
        .map_err(link_error)?;
    Ok(())
}

/// Resolve `requested` against `root`, refusing anything that escapes it.
pub(crate) fn resolve_in_root(root: &Path, requested: &str) -> Option<PathBuf> {
    let root = root.canonicalize().ok()?;
    let candidate = root.join(requested).canonicalize().ok()?;
    candidate.starts_with(&root).then_some(candidate)
}

fn guest_memory(caller: &mut Caller<'_, HostState>) -> Option<Memory> {
    match caller.get_export("memory") {
        Some(Extern::Memory(memory)) => Some(memory),
        _ => None,
    }
}

fn read_bytes(caller: &mut Caller<'_, HostState>, ptr: i32, len: i32) -> Option<Vec<u8>> {
    let offset = usize::try_from(ptr).ok()?;
    let len = usize::try_from(len).ok()?;
    if len > caller.data().max_io_bytes {
        return None;
    }
    let memory = guest_memory(caller)?;
    let mut buf = vec![0u8; len];
    memory.read(&*caller, offset, &mut buf).ok()?;
    Some(buf)
}

fn read_string(caller: &mut Caller<'_, HostState>, ptr: i32, len: i32) -> Option<String> {
    read_bytes(caller, ptr, len).and_then(|bytes| String::from_utf8(bytes).ok())
}

fn write_bytes(caller: &mut Caller<'_, HostState>, ptr: i32, cap: i32, bytes: &[u8]) -> i32 {
    let (Ok(offset), Ok(cap)) = (usize::try_from(ptr), usize::try_from(cap)) else {
        return NOT_FOUND;
    };
    if bytes.len() > cap {
        return BUFFER_TOO_SMALL;
    }
    let Some(memory) = guest_memory(caller) else {
        return NOT_FOUND;
    };
    match memory.write(&mut *caller, offset, bytes) {
        Ok(()) => i32::try_from(bytes.len()).unwrap_or(i32::MAX),
        Err(_) => NOT_FOUND,
    }
}
