//! CLI argument definitions for the AgentOS plugin host.
//!
//! All `clap` structures live here so that `main.rs` stays focused on
//! dispatching subcommands.

use std::path::PathBuf;

use clap::{Parser, Subcommand};

/// AgentOS plugin host -- validate, inspect, and run sandboxed plugins.
#[derive(Parser)]
#[command(
    name = "agentos-plugins",
    version,
    about = "AgentOS plugin host -- validate, inspect, and run sandboxed plugins",
    long_about = "Validates plugin directories, loads plugins into WebAssembly sandboxes, \
                  and drives them through their lifecycle."
)]
pub struct Cli {
    /// Host configuration file (TOML). Defaults apply when omitted.
    #[arg(long, short, global = true)]
    pub config: Option<PathBuf>,

    /// Log at debug level instead of the command's default.
    #[arg(long, short, global = true)]
    pub verbose: bool,

    #[command(subcommand)]
    pub command: Commands,
}

#[derive(Subcommand)]
pub enum Commands {
    /// Validate a plugin directory without loading it.
    Validate {
        /// Plugin directory containing `plugin.json`.
        path: PathBuf,

        /// Print the full validation result as JSON.
        #[arg(long)]
        json: bool,
    },

    /// List plugin directories under the configured plugin directories.
    Discover,

    /// Print a plugin's manifest and the sandbox it would receive.
    Inspect {
        /// Plugin directory containing `plugin.json`.
        path: PathBuf,
    },

    /// Load a plugin, send it one intent, and unload it.
    Run {
        /// Plugin directory containing `plugin.json`.
        path: PathBuf,

        /// Intent id to send.
        #[arg(long, short)]
        intent: String,

        /// Intent parameters as a JSON document.
        #[arg(long, short, default_value = "{}")]
        params: String,

        /// User id passed to the plugin's `initialize` hook.
        #[arg(long)]
        user: Option<String>,
    },
}
