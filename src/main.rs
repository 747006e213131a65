use anyhow::Result;
use clap::Parser;
use std::sync::Arc;
use tracing::{error, info};

mod config;
mod error;
mod health;
mod observability;
mod proxy;
mod server;

use config::Config;
use health::HttpProbe;
use observability::{AccessLogger, MetricsCollector};
use proxy::{ProxyCache, ProxyDispatcher};

#[derive(Parser, Debug)]
#[command(name = "stale-cache-proxy")]
#[command(about = "Caching reverse proxy that serves the last good response while its upstream is down")]
struct Args {
    #[arg(short, long, default_value = "config.json")]
    config: String,

    #[arg(short, long)]
    validate_config: bool,
}

#[tokio::main]
async fn main() -> Result<()> {
    let args = Args::parse();

    let config = Config::load(&args.config).await?;
    observability::init_tracing(&config.logging)?;

    if args.validate_config {
        info!("Configuration is valid");
        return Ok(());
    }

    info!("Starting stale-cache proxy for {}", config.source_endpoint);
    info!(
        "Bypass patterns: {:?}, bypass TTL: {:?}",
        config.cache_bypass,
        config.bypass_ttl()
    );

    let metrics = Arc::new(MetricsCollector::new(&config.metrics)?);
    let access_log = Arc::new(AccessLogger::new(&config.logging).await?);

    // Lives for the whole process; nothing is persisted on exit.
    let cache = Arc::new(ProxyCache::new());
    let sweeper_task = {
        let metrics = metrics.clone();
        cache.spawn_sweeper(config.cache.sweep_interval, move |stats| {
            metrics.set_cache_entries(stats.entries);
        })
    };

    let probe = Arc::new(HttpProbe::new(&config.source_endpoint, &config.probe)?);
    info!("Liveness probe target: {}", probe.url());

    let dispatcher = Arc::new(ProxyDispatcher::new(
        &config,
        cache.clone(),
        probe,
        metrics.clone(),
        access_log,
    )?);
    let app = proxy::router(dispatcher);

    let metrics_task = if metrics.is_enabled() {
        let metrics = metrics.clone();
        Some(tokio::spawn(async move {
            if let Err(e) = metrics.start_server().await {
                error!("Metrics server error: {}", e);
            }
        }))
    } else {
        None
    };

    let result = server::serve(app, &config.server, &config.tls, shutdown_signal()).await;

    sweeper_task.abort();
    if let Some(metrics_task) = metrics_task {
        metrics_task.abort();
    }

    let stats = cache.stats();
    info!(
        "Shutdown complete: {} cached entries, {} hits, {} misses, {} writes",
        stats.entries, stats.hits, stats.misses, stats.writes
    );

    result
}

async fn shutdown_signal() {
    if let Err(e) = tokio::signal::ctrl_c().await {
        error!("Failed to listen for shutdown signal: {}", e);
        std::future::pending::<()>().await;
    }
    info!("Received shutdown signal");
}
