//! Sandbox error types.
//!
//! All sandbox subsystems surface errors through [`SandboxError`], which is the
//! single error type returned by every public API in this crate.

/// Unified error type for the plugin sandbox.
#[derive(Debug, thiserror::Error)]
pub enum SandboxError {
    /// A live sandbox already exists for this plugin id.
    #[error("sandbox already exists for plugin '{plugin_id}'")]
    AlreadyExists {
        /// The plugin whose sandbox is still live.
        plugin_id: String,
    },

    /// No live sandbox is registered for this plugin id.
    #[error("no sandbox for plugin '{plugin_id}'")]
    NotFound { plugin_id: String },

    /// The sandbox has been closed or destroyed and accepts no new calls.
    #[error("sandbox for plugin '{plugin_id}' is closed")]
    Closed { plugin_id: String },

    /// Wasm module failed to compile (e.g. invalid bytecode).
    #[error("wasm compilation error: {0}")]
    Compilation(String),

    /// Wasm module could not be instantiated.
    #[error("wasm instantiation error: {0}")]
    Instantiation(String),

    /// The module imports a host function outside the sandbox allow-list.
    #[error("plugin '{plugin_id}' imports `{import}` which its sandbox does not grant")]
    CapabilityDenied { plugin_id: String, import: String },

    /// The module does not export the `create_plugin` factory.
    #[error("module {path} does not export the `create_plugin` factory")]
    MissingFactory { path: String },

    /// A guest lifecycle hook or handler returned a non-zero status.
    #[error("plugin '{plugin_id}' {export} returned status {status}")]
    GuestFailure {
        plugin_id: String,
        export: String,
        status: i32,
    },

    /// A guest call could not be set up or its result could not be decoded.
    #[error("wasm execution error: {0}")]
    Execution(String),

    /// A Wasm trap was raised during execution.
    #[error("wasm trap in plugin '{plugin_id}': {message}")]
    Trap { plugin_id: String, message: String },

    /// An I/O error occurred (e.g. reading an entry module from disk).
    #[error("io error: {0}")]
    Io(#[from] std::io::Error),
}

impl SandboxError {
    /// Stable machine-readable code for this error.
    pub fn code(&self) -> &'static str {
        match self {
            Self::AlreadyExists { .. } => "SANDBOX_ALREADY_EXISTS",
            Self::NotFound { .. } => "SANDBOX_NOT_FOUND",
            Self::Closed { .. } => "SANDBOX_CLOSED",
            Self::Compilation(_) => "MODULE_COMPILATION_FAILED",
            Self::Instantiation(_) => "MODULE_INSTANTIATION_FAILED",
            Self::CapabilityDenied { .. } => "CAPABILITY_DENIED",
            Self::MissingFactory { .. } => "MISSING_FACTORY",
            Self::GuestFailure { .. } => "PLUGIN_CALL_FAILED",
            Self::Execution(_) => "EXECUTION_FAILED",
            Self::Trap { .. } => "PLUGIN_TRAPPED",
            Self::Io(_) => "IO_ERROR",
        }
    }
}

/// Convenience alias used throughout the sandbox crate.
pub type Result<T> = std::result::Result<T, SandboxError>;
