// src/main.rs

use std::path::Path;

use rabbit_drain::config::{self, DrainConfig};
use rabbit_drain::rabbitmq::{ConnectionManager, EventKind, LapinClient, LifecycleEvent};
use tracing::{info, warn};
use tracing_subscriber::EnvFilter;

#[tokio::main]
async fn main() -> anyhow::Result<()> {
    // Setup tracing for logging
    tracing_subscriber::fmt()
        .with_env_filter(EnvFilter::try_from_default_env().unwrap_or_else(|_| EnvFilter::new("info")))
        .init();

    if std::env::args().nth(1).as_deref() == Some("init-config") {
        config::create_default_config_file(Path::new("rabbit_drain.json"))?;
        return Ok(());
    }

    let drain_config = match config::find_config_file() {
        Ok(path) => config::load_config_from(&path)?,
        Err(_) => DrainConfig::from_env()?,
    };

    let mut manager = ConnectionManager::new(drain_config.connection, LapinClient::default())?;
    manager.events().subscribe_sync(EventKind::Message, |event| {
        if let LifecycleEvent::MessageReceived(value) = event {
            info!(payload = %value, "Message received");
        }
        Ok(())
    });

    manager.drain(drain_config.topology).await?;

    tokio::select! {
        _ = manager.run() => {
            warn!("AMQP connection closed and will not be reopened");
        }
        signal = tokio::signal::ctrl_c() => {
            signal?;
            info!("Service interrupted, shutting down");
        }
    }

    manager.close().await?;
    Ok(())
}
