use std::sync::Arc;

use tokio::signal;
use tokio_util::sync::CancellationToken;
use tracing::{info, Level};
use tracing_subscriber::FmtSubscriber;

use stampede_shared::nats::DeployerBus;

use crate::config::RouterConfig;
use crate::router::{status_loop, StatusRouter};
use crate::store::ControlPlaneClient;

mod config;
mod router;
mod store;

#[tokio::main]
async fn main() -> Result<(), Box<dyn std::error::Error>> {
    let subscriber = FmtSubscriber::builder()
        .with_max_level(Level::INFO)
        .finish();
    tracing::subscriber::set_global_default(subscriber)?;

    stampede_shared::config::load_env_file(".env");
    let config = RouterConfig::from_env()?;

    info!("starting status router");

    let bus = DeployerBus::connect(&config.nats).await?;
    bus.ensure_streams().await?;
    let events = bus.status_consumer(&config.durable_name).await?;

    let control = Arc::new(ControlPlaneClient::new(bus.client().clone()));
    let router = StatusRouter::new(control.clone(), control);

    let shutdown = CancellationToken::new();
    let signal_token = shutdown.clone();
    tokio::spawn(async move {
        if signal::ctrl_c().await.is_ok() {
            info!("shutdown signal received");
            signal_token.cancel();
        }
    });

    status_loop(router, events, shutdown).await;

    info!("status router stopped");
    Ok(())
}
