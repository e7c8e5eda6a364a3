use anyhow::{bail, Context};
use clap::Parser;
use std::path::PathBuf;
use tokio::signal::unix::{signal, SignalKind};
use tokio::sync::mpsc;
use tracing::{error, info};
use tracing_subscriber::EnvFilter;
use vigil::config::{AppConfig, ManagedProcessConfig};
use vigil::events::{spawn_event_logger, EVENT_BUFFER};
use vigil::process::{Backend, SupervisorRegistry};

/// Keep a set of apps running: restart on crash, memory breach or schedule
#[derive(Debug, Parser)]
#[command(name = "vigil", version, about, long_about = None)]
struct Args {
    /// Ecosystem file (.toml or .json) listing the apps
    config: PathBuf,

    /// Only supervise the named app (repeatable)
    #[arg(long = "only", value_name = "NAME")]
    only: Vec<String>,
}

#[tokio::main]
async fn main() -> anyhow::Result<()> {
    let args = Args::parse();

    tracing_subscriber::fmt()
        .with_env_filter(EnvFilter::try_from_default_env().unwrap_or_else(|_| EnvFilter::new("info")))
        .init();

    let apps = load_apps(&args)?;

    let (events_tx, events_rx) = mpsc::channel(EVENT_BUFFER);
    let logger = spawn_event_logger(events_rx);

    let mut registry = SupervisorRegistry::new(Backend::os(), events_tx);
    for app in apps {
        registry
            .launch(app)
            .context("Failed to create supervisor")?;
    }

    let started = registry.start_all().await;
    info!("{} of {} app(s) started", started, registry.len());

    wait_for_shutdown().await?;

    info!("Shutting down, stopping all apps...");
    if let Err(e) = registry.stop_all().await {
        error!("Error during graceful shutdown: {}", e);
    }

    // Closing the last event sender lets the logger drain and finish
    drop(registry);
    logger.await.context("Event logger failed")?;

    info!("Shutdown complete");
    Ok(())
}

fn load_apps(args: &Args) -> anyhow::Result<Vec<ManagedProcessConfig>> {
    let mut apps = AppConfig::from_file(&args.config)
        .with_context(|| format!("Failed to load {}", args.config.display()))?;

    if !args.only.is_empty() {
        for name in &args.only {
            if !apps.iter().any(|app| &app.name == name) {
                bail!("App '{}' not found in {}", name, args.config.display());
            }
        }
        apps.retain(|app| args.only.contains(&app.name));
    }

    apps.iter()
        .map(|app| ManagedProcessConfig::try_from(app).map_err(anyhow::Error::from))
        .collect()
}

async fn wait_for_shutdown() -> anyhow::Result<()> {
    let mut sigterm =
        signal(SignalKind::terminate()).context("Failed to set up SIGTERM handler")?;
    let mut sigint =
        signal(SignalKind::interrupt()).context("Failed to set up SIGINT handler")?;

    tokio::select! {
        _ = sigterm.recv() => info!("Received SIGTERM"),
        _ = sigint.recv() => info!("Received SIGINT"),
    }

    Ok(())
}
