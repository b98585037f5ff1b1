use std::path::Path;
use std::sync::Arc;

use anyhow::{Context, Result};
use clap::Parser;
use tokio::sync::broadcast::error::RecvError;
use tracing::{error, info, warn};

use rs_realtime::config::Config;
use rs_realtime::logging::{setup_logger, Logger};
use rs_realtime::options::Options;
use rs_realtime::tls::client_config;
use rs_realtime::transport::{PhoenixSettings, PhoenixTransport};
use rs_realtime::{InMemoryQueryCache, SubscriptionManager};

#[tokio::main]
async fn main() -> Result<()> {
    let options = Options::parse();
    let config = Config::load(&options.config).context("failed to load configuration")?;

    let level = options.log_level.as_deref().unwrap_or(&config.logging.level);
    setup_logger(level);
    Logger::with_span(|| info!("Starting with {}", config));

    let tls = client_config(config.realtime.ca_file.as_deref().map(Path::new))?;
    let transport = Arc::new(PhoenixTransport::new(PhoenixSettings::from_config(
        &config.realtime,
        Some(tls),
    ))?);
    if let Err(e) = transport.connect().await {
        // The health monitor keeps trying.
        warn!("Initial realtime connection failed: {}", e);
    }

    let cache = Arc::new(InMemoryQueryCache::new());
    let manager = SubscriptionManager::builder(transport.clone(), cache.clone())
        .config(&config)
        .build();

    if options.emergency {
        manager.enable_emergency_mode("started with --emergency");
    }

    let monitor = manager.health().spawn();
    let handles: Vec<_> = options
        .watches
        .iter()
        .map(|watch| manager.subscribe(watch.descriptor()))
        .collect();
    manager.sync().await;
    info!("Watching {} subscriptions on {} channels", handles.len(), manager.channels().len());

    let mut invalidations = cache.watch();
    loop {
        tokio::select! {
            _ = tokio::signal::ctrl_c() => {
                info!("Shutting down");
                break;
            }
            received = invalidations.recv() => match received {
                Ok(key) => info!("Invalidated {}", key),
                Err(RecvError::Lagged(skipped)) => warn!("Missed {} invalidation notices", skipped),
                Err(RecvError::Closed) => {
                    error!("Cache closed its invalidation feed");
                    break;
                }
            },
        }
    }

    monitor.abort();
    drop(handles);
    manager.sync().await;
    Ok(())
}
