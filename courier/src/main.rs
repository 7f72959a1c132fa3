mod server;
mod ws;

use std::sync::Arc;

use anyhow::Result;
use async_trait::async_trait;
use chrono::{DateTime, Utc};
use clap::Parser;
use tracing::{debug, info};

use courier_core::models::ClientToken;
use courier_core::{logging, Config};
use courier_stream::{Broker, BrokerOptions, LastUsedSink};

#[derive(Parser, Debug)]
#[command(name = "courier", about = "Self-hosted push-notification server")]
struct Args {
    /// Path to the configuration file
    #[arg(short, long, env = "COURIER_CONFIG")]
    config: Option<String>,
}

/// Stand-in persistence collaborator: deployments embedding the broker
/// wire in their database here; the standalone binary just logs.
struct LastUsedLogger;

#[async_trait]
impl LastUsedSink for LastUsedLogger {
    async fn update_last_used(&self, tokens: Vec<ClientToken>, timestamp: DateTime<Utc>) {
        debug!(
            clients = tokens.len(),
            %timestamp,
            "Connected client tokens reported"
        );
    }
}

#[tokio::main]
async fn main() -> Result<()> {
    let args = Args::parse();

    // Load configuration and fail fast on anything inconsistent; the
    // broker never starts half-configured.
    let config = Config::load(args.config.as_deref())?;
    config.stream.validate()?;

    logging::init_logging(&config.logging)?;
    info!("Courier server starting...");

    let options = BrokerOptions {
        ping_period: config.stream.ping_period(),
        write_wait: config.stream.write_wait(),
        reconcile_period: config.stream.reconcile_period(),
        allowed_origins: config.stream.allowed_origins.clone(),
        queue_capacity: config.stream.queue_capacity,
    };
    let broker = Arc::new(Broker::new(options, Arc::new(LastUsedLogger))?);

    server::serve(&config, broker).await?;

    info!("Courier server stopped");
    Ok(())
}
