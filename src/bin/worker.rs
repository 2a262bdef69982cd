//! plugin-runner worker
//!
//! Spawned by the orchestrator, one per runnable. Serves the frame
//! protocol on stdin/stdout and loads plugins from its private module
//! directory. Exits when asked to destroy or when the orchestrator
//! closes the channel.

use std::path::PathBuf;

use anyhow::{Context, Result};
use clap::Parser;
use tracing::info;
use tracing_subscriber::EnvFilter;

use plugin_runner::plugin::DylibLoader;
use plugin_runner::worker::Endpoint;

#[derive(Parser, Debug)]
#[command(name = "plugin-runner-worker")]
#[command(about = "Worker subprocess for the plugin-runner runtime")]
struct Args {
    /// Directory plugins are resolved from (symlinked installs).
    #[arg(long)]
    modules_dir: PathBuf,

    /// Log level (trace, debug, info, warn, error)
    #[arg(long, default_value = "info")]
    log_level: String,
}

#[tokio::main]
async fn main() -> Result<()> {
    let args = Args::parse();

    // Logging to stderr so stdout stays free for protocol frames
    tracing_subscriber::fmt()
        .with_env_filter(
            EnvFilter::try_from_default_env().unwrap_or_else(|_| EnvFilter::new(&args.log_level)),
        )
        .with_writer(std::io::stderr)
        .init();

    info!(modules_dir = %args.modules_dir.display(), "worker starting");

    let loader = DylibLoader::new(args.modules_dir);
    Endpoint::new(loader)
        .serve(tokio::io::stdin(), tokio::io::stdout())
        .await
        .context("worker endpoint failed")?;

    Ok(())
}
