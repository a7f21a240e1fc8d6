//! Langbridge CLI
//!
//! Runs the agent gateway on stdin/stdout. Logs go to stderr, since stdout
//! carries protocol frames.
//!
//! ```bash
//! langbridge --config langbridge.toml --workspace ~/src/project
//! RUST_LOG=langbridge_core=debug langbridge --log-json
//! ```

mod args;

use anyhow::{Context, Result};
use args::Cli;
use clap::Parser;
use langbridge_core::{
    BackendRegistry, BridgeConfig, CommandLauncher, ConfigClassifier, DiagnosticsAggregator,
    Gateway, GatewayOptions, Router,
};
use std::path::PathBuf;
use std::sync::Arc;
use tracing::info;
use tracing_subscriber::EnvFilter;

#[tokio::main]
async fn main() -> Result<()> {
    let cli = Cli::parse();
    init_tracing(&cli);

    let (mut config, source) = BridgeConfig::find_and_load(cli.config.as_deref())
        .context("Failed to load configuration")?;
    let root = workspace_root(&cli, &config)?;
    config.workspace_root = Some(root.clone());
    let config = Arc::new(config);

    info!(
        config = ?source,
        root = %root.display(),
        languages = config.languages.len(),
        "Starting langbridge"
    );

    let diagnostics = DiagnosticsAggregator::new(config.diagnostics_capacity);
    let registry = BackendRegistry::from_config(
        Arc::clone(&config),
        Arc::new(CommandLauncher::new()),
        diagnostics,
    );
    let classifier = Arc::new(ConfigClassifier::new(Arc::clone(&config), root));
    let router = Arc::new(
        Router::new(Arc::clone(&registry), classifier).with_config(Arc::clone(&config)),
    );
    let gateway = Gateway::with_options(
        router,
        GatewayOptions {
            push_diagnostics: cli.push_diagnostics,
            max_frame_len: config.max_frame_bytes,
        },
    );

    let served = tokio::select! {
        result = gateway.serve(tokio::io::stdin(), tokio::io::stdout()) => result,
        _ = tokio::signal::ctrl_c() => {
            info!("Interrupted");
            Ok(())
        }
    };

    registry.shutdown_all().await;
    info!("Langbridge stopped");
    served.context("Gateway failed")?;
    Ok(())
}

fn init_tracing(cli: &Cli) {
    let filter = EnvFilter::try_from_default_env()
        .unwrap_or_else(|_| EnvFilter::new(cli.log_level.as_str()));
    let builder = tracing_subscriber::fmt()
        .with_env_filter(filter)
        .with_writer(std::io::stderr);

    if cli.log_json {
        builder.json().init();
    } else {
        builder.init();
    }
}

/// `--workspace`, then the configured root, then the current directory
fn workspace_root(cli: &Cli, config: &BridgeConfig) -> Result<PathBuf> {
    let root = match cli.workspace.clone().or_else(|| config.workspace_root.clone()) {
        Some(root) => root,
        None => std::env::current_dir().context("Failed to read current directory")?,
    };
    std::path::absolute(&root)
        .with_context(|| format!("Invalid workspace root: {}", root.display()))
}
