//! CLI entry point for the AgentOS plugin host.
//!
//! This binary provides the `agentos-plugins` command with subcommands for
//! validating, discovering, inspecting, and running plugins.

mod cli;

use std::path::Path;
use std::sync::Arc;

use agentos_plugins::loader::sandbox_options;
use agentos_plugins::{
    HostConfig, LifecycleManager, ManifestValidator, PluginLoader, PluginManifest,
};
use agentos_sandbox::{PluginContext, SandboxManager};
use anyhow::{Context, Result, bail};
use clap::Parser;
use tracing::{debug, info};
use tracing_subscriber::EnvFilter;

use crate::cli::{Cli, Commands};

// ---------------------------------------------------------------------------
// Main
// ---------------------------------------------------------------------------

#[tokio::main]
async fn main() -> Result<()> {
    // A missing .env file is fine.
    let _ = dotenvy::dotenv();

    let cli = Cli::parse();
    let default_level = match (&cli.command, cli.verbose) {
        (_, true) => "debug",
        (Commands::Run { .. }, false) => "info",
        _ => "warn",
    };
    init_tracing(default_level);

    let config = load_config(cli.config.as_deref())?;

    match cli.command {
        Commands::Validate { path, json } => cmd_validate(&config, &path, json),
        Commands::Discover => cmd_discover(&config),
        Commands::Inspect { path } => cmd_inspect(&config, &path),
        Commands::Run {
            path,
            intent,
            params,
            user,
        } => cmd_run(&config, &path, &intent, &params, user).await,
    }
}

fn init_tracing(default_level: &str) {
    let filter =
        EnvFilter::try_from_default_env().unwrap_or_else(|_| EnvFilter::new(default_level));

    tracing_subscriber::fmt()
        .with_env_filter(filter)
        .with_writer(std::io::stderr)
        .with_target(false)
        .compact()
        .init();
}

fn load_config(path: Option<&Path>) -> Result<HostConfig> {
    let mut config = match path {
        Some(path) => HostConfig::load(path)
            .with_context(|| format!("failed to load configuration from {}", path.display()))?,
        None => HostConfig::default(),
    };
    config
        .apply_env_overrides()
        .context("invalid environment override")?;
    Ok(config)
}

// ---------------------------------------------------------------------------
// Subcommand: validate
// ---------------------------------------------------------------------------

fn cmd_validate(config: &HostConfig, path: &Path, json: bool) -> Result<()> {
    let validator = ManifestValidator::new(&config.plugins).context("failed to build validator")?;
    let result = validator.validate(path);

    if json {
        println!("{}", serde_json::to_string_pretty(&result)?);
    } else {
        for issue in &result.errors {
            println!("  error   [{}] {}", issue.code, issue.message);
        }
        for issue in &result.warnings {
            println!("  warning [{}] {}", issue.code, issue.message);
        }
        if result.valid {
            println!("  {} is valid", path.display());
        }
    }

    if !result.valid {
        bail!(
            "{} failed validation with {} error(s)",
            path.display(),
            result.errors.len()
        );
    }
    Ok(())
}

// ---------------------------------------------------------------------------
// Subcommand: discover
// ---------------------------------------------------------------------------

fn cmd_discover(config: &HostConfig) -> Result<()> {
    let sandboxes = Arc::new(SandboxManager::new(config.sandbox.settings())?);
    let loader = PluginLoader::new(config, sandboxes, Default::default())?;

    let found = loader.discover_plugins();
    if found.is_empty() {
        println!("  no plugins found");
    }
    for dir in found {
        match PluginManifest::from_dir(&dir) {
            Ok(manifest) => println!(
                "  {:<24} {:<10} {}",
                manifest.id,
                manifest.version,
                dir.display()
            ),
            Err(e) => println!("  {:<24} {:<10} {}", "?", e.code(), dir.display()),
        }
    }
    Ok(())
}

// ---------------------------------------------------------------------------
// Subcommand: inspect
// ---------------------------------------------------------------------------

fn cmd_inspect(config: &HostConfig, path: &Path) -> Result<()> {
    let manifest = PluginManifest::from_dir(path)?;
    let options = sandbox_options(&manifest, &config.sandbox);

    let report = serde_json::json!({
        "manifest": manifest,
        "sandbox": {
            "allowedApis": options.effective_apis(),
            "resourceLimits": options.resource_limits,
            "networkAccess": options.network_access,
            "fileSystemAccess": options.file_system_access,
        },
    });
    println!("{}", serde_json::to_string_pretty(&report)?);
    Ok(())
}

// ---------------------------------------------------------------------------
// Subcommand: run
// ---------------------------------------------------------------------------

async fn cmd_run(
    config: &HostConfig,
    path: &Path,
    intent: &str,
    params: &str,
    user: Option<String>,
) -> Result<()> {
    let parameters: serde_json::Value =
        serde_json::from_str(params).context("--params is not valid JSON")?;

    let mut context = PluginContext::new();
    if let Some(user) = user {
        context = context.with_user_id(user);
    }
    let host = LifecycleManager::from_config(config)?.with_context(context);

    let outcome = run_once(&host, path, intent, parameters).await;
    host.shutdown().await;
    let result = outcome?;

    println!("{}", serde_json::to_string_pretty(&result)?);
    Ok(())
}

async fn run_once(
    host: &LifecycleManager,
    path: &Path,
    intent: &str,
    parameters: serde_json::Value,
) -> Result<serde_json::Value> {
    let id = host.load_plugin(path).await?;
    host.initialize_plugin(&id).await?;
    host.start_plugin(&id).await?;
    if let Some(loaded) = host.loader().get(&id) {
        debug!(sandbox = ?loaded.sandbox.summary(), "sandbox ready");
    }
    info!(plugin_id = %id, intent, "sending intent");

    let result = host.handle_intent(&id, intent, parameters).await;
    if let Some(metrics) = host.monitor().get_metrics(&id) {
        info!(
            plugin_id = %id,
            elapsed_ms = metrics.intent_handling_time_ms,
            errors = metrics.error_count,
            "intent finished"
        );
    }
    Ok(result?)
}
