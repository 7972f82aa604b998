//! Axon daemon - main entry point
//!
//! Plays a configured display pipeline session against the simulated bench:
//! components arrive on schedule, deferred binds complete as their peers
//! register, and scripted host power requests exercise the sequencers.

mod config;
mod report;
mod run;

use anyhow::Result;
use clap::Parser;
use std::path::PathBuf;
use tracing::{info, Level};
use tracing_subscriber::FmtSubscriber;

#[derive(Parser, Debug)]
#[command(name = "axond")]
#[command(about = "Display pipeline binder daemon driving a simulated bench")]
#[command(version)]
struct Args {
    /// Path to configuration file
    #[arg(short, long, default_value = "axon.toml")]
    config: PathBuf,

    /// Log level (trace, debug, info, warn, error)
    #[arg(short, long, default_value = "info")]
    log_level: String,

    /// Validate the configured topology and exit
    #[arg(long)]
    check: bool,

    /// Play the session once and exit instead of waiting for Ctrl-C
    #[arg(long)]
    once: bool,

    /// Write a JSON run report to this path
    #[arg(long)]
    report: Option<PathBuf>,

    /// Write an example configuration file and exit
    #[arg(long)]
    init: bool,
}

#[tokio::main]
async fn main() -> Result<()> {
    let args = Args::parse();

    // Initialize logging
    let level = match args.log_level.to_lowercase().as_str() {
        "trace" => Level::TRACE,
        "debug" => Level::DEBUG,
        "info" => Level::INFO,
        "warn" => Level::WARN,
        "error" => Level::ERROR,
        _ => Level::INFO,
    };

    let subscriber = FmtSubscriber::builder()
        .with_max_level(level)
        .with_target(true)
        .finish();

    tracing::subscriber::set_global_default(subscriber)?;

    info!("Axon v{}", env!("CARGO_PKG_VERSION"));

    if args.init {
        config::save_default_config(&args.config)?;
        println!("Wrote example configuration to {}", args.config.display());
        return Ok(());
    }

    let config = config::load_config(&args.config)?;
    info!(
        nodes = config.nodes.len(),
        power_steps = config.power_steps.len(),
        "Configuration loaded"
    );

    if args.check {
        let topology = config.to_topology()?;
        let issues = topology.validate();
        if issues.is_empty() {
            println!("Topology OK: {} nodes", topology.len());
            return Ok(());
        }
        for issue in &issues {
            println!("  - {}", issue);
        }
        anyhow::bail!("{} topology issue(s) found", issues.len());
    }

    run::run(config, args.once, args.report.as_deref()).await
}
