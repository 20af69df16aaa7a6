use std::sync::Arc;
use std::time::Duration;

use tokio::signal;
use tokio_util::sync::CancellationToken;
use tracing::{info, Level};
use tracing_subscriber::FmtSubscriber;

use stampede_shared::nats::DeployerBus;

use crate::config::ReaperConfig;
use crate::inventory::ScriptInventory;
use crate::sweeper::{effective_interval, BusStatusPublisher, SweepPolicy, Sweeper};
use crate::tracker::{observe_loop, GridStatusTracker};

mod config;
mod inventory;
mod sweeper;
mod tracker;

#[tokio::main]
async fn main() -> Result<(), Box<dyn std::error::Error>> {
    let subscriber = FmtSubscriber::builder()
        .with_max_level(Level::INFO)
        .finish();
    tracing::subscriber::set_global_default(subscriber)?;

    stampede_shared::config::load_env_file(".env");
    let config = ReaperConfig::from_env()?;

    info!(state_dir = %config.state_dir.display(), "starting ttl reaper");

    let bus = DeployerBus::connect(&config.nats).await?;
    bus.ensure_streams().await?;
    let events = bus.status_consumer(&config.durable_name).await?;

    let tracker = Arc::new(GridStatusTracker::new());
    let sweeper = Sweeper::new(
        Arc::new(ScriptInventory::new(
            config.state_dir.clone(),
            config.teardown_script.clone(),
        )),
        Arc::clone(&tracker),
        Arc::new(BusStatusPublisher::new(bus)),
        SweepPolicy {
            interval: effective_interval(config.sweep_interval_secs),
            retry_attempts: config.retry_attempts,
            repoll_delay: Duration::from_secs(config.repoll_delay_secs),
        },
    );

    let shutdown = CancellationToken::new();
    let signal_token = shutdown.clone();
    tokio::spawn(async move {
        if signal::ctrl_c().await.is_ok() {
            info!("shutdown signal received");
            signal_token.cancel();
        }
    });

    let tracking = tokio::spawn(observe_loop(tracker, events, shutdown.clone()));
    sweeper.run(shutdown).await;
    tracking.await?;

    info!("ttl reaper stopped");
    Ok(())
}
