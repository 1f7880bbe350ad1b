//! Plugin host error types.
//!
//! Every public API in this crate returns [`PluginError`]. Each variant maps
//! to a stable machine-readable code via [`PluginError::code`], so hosts can
//! branch on failures without parsing messages.

use agentos_sandbox::SandboxError;

use crate::lifecycle::LifecycleState;

/// Unified error type for the plugin host.
#[derive(Debug, thiserror::Error)]
pub enum PluginError {
    // -- Validation / loading -----------------------------------------------
    /// The plugin failed static validation. Every blocking issue is listed.
    #[error("plugin at {path} failed validation: {}", errors.join("; "))]
    Validation { path: String, errors: Vec<String> },

    /// The manifest could not be read or decoded after validation passed.
    #[error("invalid manifest at {path}: {reason}")]
    Manifest { path: String, reason: String },

    /// A plugin with this id is already loaded.
    #[error("plugin '{plugin_id}' is already loaded")]
    AlreadyLoaded { plugin_id: String },

    /// No plugin with this id is loaded.
    #[error("plugin '{plugin_id}' is not loaded")]
    NotLoaded { plugin_id: String },

    /// The plugin directory has no resolvable entry module.
    #[error("no entry module found for plugin at {path}")]
    EntryNotFound { path: String },

    /// The entry module does not export the `create_plugin` factory.
    #[error("entry module {path} does not export `create_plugin`")]
    MissingFactory { path: String },

    // -- Lifecycle ----------------------------------------------------------
    /// The requested operation is not allowed in the plugin's current state.
    #[error("cannot {operation} plugin '{plugin_id}' in state {current}; expected {expected}")]
    InvalidTransition {
        plugin_id: String,
        operation: &'static str,
        current: LifecycleState,
        expected: String,
    },

    /// An intent was sent to a plugin that is not started.
    #[error("plugin '{plugin_id}' is not started (state: {state})")]
    NotStarted {
        plugin_id: String,
        state: LifecycleState,
    },

    /// No started plugin declares the requested intent.
    #[error("no started plugin handles intent '{intent_id}'")]
    NoHandler { intent_id: String },

    // -- Collaborators ------------------------------------------------------
    /// The plugin registry rejected an operation.
    #[error("registry error: {0}")]
    Registry(String),

    /// An error raised by the sandbox layer.
    #[error(transparent)]
    Sandbox(#[from] SandboxError),

    // -- Configuration ------------------------------------------------------
    /// Host configuration could not be loaded or is inconsistent.
    #[error("configuration error: {0}")]
    Config(String),

    /// A security pattern is not a valid regular expression.
    #[error("invalid pattern `{pattern}`: {reason}")]
    InvalidPattern { pattern: String, reason: String },

    // -- Generic ------------------------------------------------------------
    #[error("io error: {0}")]
    Io(#[from] std::io::Error),

    #[error("json error: {0}")]
    Json(#[from] serde_json::Error),

    /// Catch-all for unexpected internal failures.
    #[error("internal plugin host error: {0}")]
    Internal(String),
}

impl PluginError {
    /// Stable machine-readable code for this error.
    pub fn code(&self) -> &'static str {
        match self {
            Self::Validation { .. } => "VALIDATION_FAILED",
            Self::Manifest { .. } => "INVALID_MANIFEST",
            Self::AlreadyLoaded { .. } => "PLUGIN_ALREADY_LOADED",
            Self::NotLoaded { .. } => "PLUGIN_NOT_LOADED",
            Self::EntryNotFound { .. } => "MISSING_MAIN_FILE",
            Self::MissingFactory { .. } => "MISSING_FACTORY",
            Self::InvalidTransition { .. } => "INVALID_TRANSITION",
            Self::NotStarted { .. } => "PLUGIN_NOT_STARTED",
            Self::NoHandler { .. } => "NO_PLUGIN_FOR_INTENT",
            Self::Registry(_) => "REGISTRY_ERROR",
            Self::Sandbox(inner) => inner.code(),
            Self::Config(_) => "CONFIG_ERROR",
            Self::InvalidPattern { .. } => "INVALID_PATTERN",
            Self::Io(_) => "IO_ERROR",
            Self::Json(_) => "INVALID_JSON",
            Self::Internal(_) => "INTERNAL_ERROR",
        }
    }
}

/// Convenience alias used throughout the plugin host crate.
pub type Result<T> = std::result::Result<T, PluginError>;
