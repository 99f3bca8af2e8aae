//! Expiration sweep daemon
//!
//! Runs the daily sweep on the configured schedule until Ctrl-C. With
//! `--once` it sweeps immediately and exits, for use from cron.

use anyhow::Context;
use credit_engine::{Config, CreditEngine, Directory, SweepSchedule, SweepScheduler};
use std::sync::Arc;
use tokio::sync::watch;
use tracing::info;

fn load_config() -> anyhow::Result<Config> {
    match std::env::var("CREDIT_ENGINE_CONFIG") {
        Ok(path) => Config::from_file(&path)
            .with_context(|| format!("loading config from {}", path)),
        Err(_) => Config::from_env().context("loading config from environment"),
    }
}

#[tokio::main]
async fn main() -> anyhow::Result<()> {
    let config = load_config()?;

    // Initialize logging
    let filter = tracing_subscriber::EnvFilter::try_from_default_env()
        .unwrap_or_else(|_| tracing_subscriber::EnvFilter::new("info"));
    if config.log_json {
        tracing_subscriber::fmt().json().with_env_filter(filter).init();
    } else {
        tracing_subscriber::fmt().with_env_filter(filter).init();
    }

    info!(
        service = %config.service_name,
        data_dir = ?config.data_dir,
        "Credit sweeper starting"
    );

    let run_once = std::env::args().any(|arg| arg == "--once");
    if !run_once && !config.sweep.enabled {
        info!("Sweep disabled by configuration, exiting");
        return Ok(());
    }
    let schedule = SweepSchedule::from_config(&config.sweep)?;

    // The sweep never creates or joins, so no identities are needed
    let engine = Arc::new(CreditEngine::open(config, Arc::new(Directory::new()))?);
    let scheduler = SweepScheduler::new(engine, schedule);

    if run_once {
        let report = scheduler.run_once().await?;
        info!(
            contributions_expired = report.contributions_expired,
            credits_expired = report.credits_expired,
            "Sweep finished"
        );
        return Ok(());
    }

    let (shutdown_tx, shutdown_rx) = watch::channel(false);
    let task = tokio::spawn(scheduler.run(shutdown_rx));

    tokio::signal::ctrl_c().await?;
    info!("Shutting down credit sweeper");
    shutdown_tx.send(true)?;
    task.await??;

    Ok(())
}
