use std::sync::Arc;

use tokio::signal;
use tokio_util::sync::CancellationToken;
use tracing::{info, Level};
use tracing_subscriber::FmtSubscriber;

use stampede_shared::nats::DeployerBus;

use crate::config::DeployerConfig;
use crate::executor::CommandRunner;
use crate::registry::JobRegistry;
use crate::runner::{accept_loop, stop_loop, BusJobEvents, JobRunner};

mod config;
mod executor;
mod registry;
mod runner;

#[tokio::main]
async fn main() -> Result<(), Box<dyn std::error::Error>> {
    let subscriber = FmtSubscriber::builder()
        .with_max_level(Level::INFO)
        .finish();
    tracing::subscriber::set_global_default(subscriber)?;

    stampede_shared::config::load_env_file(".env");
    let config = DeployerConfig::from_env()?;

    info!(script_dir = %config.script_dir.display(), "starting deployer");

    let bus = DeployerBus::connect(&config.nats).await?;
    bus.ensure_streams().await?;
    let jobs = bus.jobs_consumer(&config.durable_name).await?;

    let runner = JobRunner::new(
        Arc::new(JobRegistry::new()),
        Arc::new(CommandRunner::new(
            config.script_dir.clone(),
            config.cancel_exit_code,
        )),
        Arc::new(BusJobEvents::new(bus.clone())),
    );

    let shutdown = CancellationToken::new();

    let signal_token = shutdown.clone();
    tokio::spawn(async move {
        if signal::ctrl_c().await.is_ok() {
            info!("shutdown signal received");
            signal_token.cancel();
        }
    });

    let accept = tokio::spawn(accept_loop(runner.clone(), jobs, shutdown.clone()));
    let stop = tokio::spawn(stop_loop(runner, bus, shutdown.clone()));

    let (accept_result, stop_result) = tokio::join!(accept, stop);
    accept_result?;
    stop_result??;

    info!("deployer stopped");
    Ok(())
}
