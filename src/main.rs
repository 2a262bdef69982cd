//! plugin-runner orchestrator CLI
//!
//! Minimal driver for the runtime: bootstraps one runnable, invokes the
//! listed plugins in order threading each stage's result reference into
//! the next call, prints the final value, and tears the worker down.

use std::path::PathBuf;

use anyhow::{Context, Result};
use clap::Parser;
use serde_json::Value;
use tracing::info;
use tracing_subscriber::EnvFilter;

use plugin_runner::{PluginDescriptor, Runtime, RuntimeConfig};

#[derive(Parser, Debug)]
#[command(name = "plugin-runner")]
#[command(about = "Run a chain of pipeline plugins in a worker subprocess")]
struct Args {
    /// Shared plugin install directory.
    #[arg(long)]
    install_dir: PathBuf,

    /// Root for per-runnable working directories.
    #[arg(long)]
    data_dir: PathBuf,

    /// Worker executable (defaults to a sibling of this binary).
    #[arg(long)]
    worker: Option<PathBuf>,

    /// Log level (trace, debug, info, warn, error)
    #[arg(long, default_value = "info")]
    log_level: String,

    /// Plugins to run in order, as name@version.
    #[arg(required = true)]
    plugins: Vec<String>,
}

fn parse_stage(stage: &str) -> PluginDescriptor {
    match stage.split_once('@') {
        Some((name, version)) => PluginDescriptor::new(name, version),
        None => PluginDescriptor::new(stage, "latest"),
    }
}

#[tokio::main]
async fn main() -> Result<()> {
    let args = Args::parse();

    tracing_subscriber::fmt()
        .with_env_filter(
            EnvFilter::try_from_default_env().unwrap_or_else(|_| EnvFilter::new(&args.log_level)),
        )
        .with_writer(std::io::stderr)
        .init();

    let mut config = RuntimeConfig::new(args.install_dir, args.data_dir);
    config.worker_exec = args.worker;
    let runtime = Runtime::new(config);

    let runnable = runtime.create_runnable();
    runnable.bootstrap().await.context("failed to bootstrap worker")?;
    info!(runnable = %runnable.id(), "worker ready");

    let mut carried: Option<Value> = None;
    for stage in &args.plugins {
        let descriptor = parse_stage(stage);
        let stage_args = carried.take().into_iter().collect();
        info!(plugin = %descriptor.name, "running stage");

        let reference = runnable
            .start(&descriptor, stage_args)
            .await
            .with_context(|| format!("stage '{}' failed", descriptor.name))?;
        carried = reference.map(|r| r.to_value());

        if let Some(reference) = reference {
            let value = runnable.value_of(reference).await?;
            println!("{}: {value}", descriptor.name);
        } else {
            println!("{}: (no output)", descriptor.name);
        }
    }

    runnable.destroy().await.context("failed to destroy worker")?;
    Ok(())
}
