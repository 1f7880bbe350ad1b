//! AgentOS plugin sandbox.
//!
//! This crate isolates third-party plugins inside WebAssembly instances and
//! exposes exactly the host capabilities each plugin was granted.
//!
//! - **[`capability`]** -- [`HostApi`] capabilities and [`SandboxOptions`].
//! - **[`config`]** -- [`ResourceLimits`] per sandbox and engine-wide
//!   [`SandboxSettings`].
//! - **[`error`]** -- [`SandboxError`] enumerates every failure mode.
//! - **[`sandbox`]** -- [`Sandbox`], the per-plugin isolation context with its
//!   usage counters and data store.
//! - **[`module`]** -- [`PluginModule`] / [`PluginInstance`] and their wasm
//!   implementations.
//! - **[`manager`]** -- [`SandboxManager`] is the main entry point: create and
//!   destroy sandboxes, compile entry modules into them.
//!
//! All public types are `Send + Sync` and designed for use within a
//! multi-threaded tokio runtime.

pub mod capability;
pub mod config;
pub mod error;
mod host;
pub mod manager;
pub mod module;
pub mod sandbox;

// Re-export the most commonly used types at the crate root.
pub use capability::{HostApi, SandboxOptions};
pub use config::{ResourceLimits, SandboxSettings};
pub use error::{Result, SandboxError};
pub use host::NetworkProvider;
pub use manager::SandboxManager;
pub use module::{FACTORY_EXPORT, PluginContext, PluginInstance, PluginModule};
pub use sandbox::{Sandbox, SandboxSummary, UsageSnapshot};
