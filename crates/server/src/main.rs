//! Liquidity Pool - cross-exchange best prices and arbitrage signals
//!
//! Main entry point: runs one query and prints the result as JSON

mod query;
mod settings;

use std::env;

use anyhow::Context;
use tokio::signal;
use tracing::{error, info};
use tracing_subscriber::EnvFilter;

use liquidity_exchanges::build_sources;
use liquidity_price_feed::{CancellationToken, LiquidityAggregator};

use crate::query::Query;

fn init_tracing() {
    let filter = EnvFilter::try_from_default_env().unwrap_or_else(|_| EnvFilter::new("info"));
    let builder = tracing_subscriber::fmt()
        .with_env_filter(filter)
        .with_target(true)
        .with_thread_ids(true)
        .with_file(true)
        .with_line_number(true)
        .with_writer(std::io::stderr);

    if env::var("LOG_FORMAT").map(|v| v.eq_ignore_ascii_case("json")).unwrap_or(false) {
        builder.json().init();
    } else {
        builder.init();
    }
}

/// Cancel `token` on Ctrl+C or SIGTERM
fn spawn_shutdown_handler(token: CancellationToken) {
    tokio::spawn(async move {
        let ctrl_c = async {
            if let Err(e) = signal::ctrl_c().await {
                error!("Failed to install Ctrl+C handler: {}", e);
                std::future::pending::<()>().await;
            }
        };

        #[cfg(unix)]
        let terminate = async {
            match signal::unix::signal(signal::unix::SignalKind::terminate()) {
                Ok(mut stream) => {
                    stream.recv().await;
                }
                Err(e) => {
                    error!("Failed to install signal handler: {}", e);
                    std::future::pending::<()>().await;
                }
            }
        };

        #[cfg(not(unix))]
        let terminate = std::future::pending::<()>();

        tokio::select! {
            _ = ctrl_c => {
                info!("Received Ctrl+C");
            }
            _ = terminate => {
                info!("Received termination signal");
            }
        }

        token.cancel();
    });
}

#[tokio::main]
async fn main() -> anyhow::Result<()> {
    // Load .env file
    dotenvy::dotenv().ok();

    init_tracing();

    let query = Query::parse(env::args().skip(1))?;

    info!("Starting Liquidity Pool v{}", env!("CARGO_PKG_VERSION"));

    let run_env = env::var("RUN_ENV").unwrap_or_else(|_| "development".to_string());
    let config = settings::load(&run_env).context("failed to load configuration")?;

    let sources = build_sources(&config.exchanges)?;
    let aggregator = LiquidityAggregator::new(sources, config.aggregator.clone(), config.cache.clone())?;
    info!("Querying {} sources: {}", aggregator.source_names().len(), aggregator.source_names().join(", "));

    let cancel = CancellationToken::new();
    spawn_shutdown_handler(cancel.clone());

    let result = query.run(&aggregator, &cancel).await;

    aggregator.shutdown().await;

    match result {
        Ok(output) => {
            println!("{}", output);
            info!("Shutdown complete");
            Ok(())
        }
        Err(e) => {
            error!("Query failed: {:#}", e);
            Err(e)
        }
    }
}
