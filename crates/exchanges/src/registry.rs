//! Builds price sources from configuration

use std::sync::Arc;
use tracing::{info, warn};

use liquidity_core::{AggregatorError, AggregatorResult, EndpointConfig, ExchangeConfig};
use liquidity_price_feed::PriceSource;

use crate::binance::{self, BinanceSource};
use crate::bybit::{self, BybitSource};

/// Fill blank endpoint paths from the exchange defaults
pub(crate) fn merge_endpoints(configured: &EndpointConfig, defaults: EndpointConfig) -> EndpointConfig {
    let pick = |value: &str, default: String| {
        if value.trim().is_empty() {
            default
        } else {
            value.to_string()
        }
    };

    EndpointConfig {
        symbols: pick(&configured.symbols, defaults.symbols),
        ticker: pick(&configured.ticker, defaults.ticker),
        all_tickers: pick(&configured.all_tickers, defaults.all_tickers),
    }
}

/// Exchanges used when none are configured
pub fn default_exchanges() -> Vec<ExchangeConfig> {
    vec![
        ExchangeConfig::new("Binance", binance::BINANCE_BASE_URL),
        ExchangeConfig::new("Bybit", bybit::BYBIT_BASE_URL),
    ]
}

/// Instantiate every enabled exchange, matched by name case-insensitively
pub fn build_sources(configs: &[ExchangeConfig]) -> AggregatorResult<Vec<Arc<dyn PriceSource>>> {
    let mut sources: Vec<Arc<dyn PriceSource>> = Vec::with_capacity(configs.len());

    for config in configs {
        if !config.enabled {
            warn!("Exchange {} is disabled, skipping", config.name);
            continue;
        }

        let source: Arc<dyn PriceSource> = match config.name.to_lowercase().as_str() {
            "binance" => Arc::new(
                BinanceSource::new(config).map_err(|e| AggregatorError::from_source(&config.name, e))?,
            ),
            "bybit" => Arc::new(
                BybitSource::new(config).map_err(|e| AggregatorError::from_source(&config.name, e))?,
            ),
            other => {
                return Err(AggregatorError::Configuration(format!(
                    "unsupported exchange: {}",
                    other
                )))
            }
        };

        info!("Registered {} price source at {}", config.name, config.base_url);
        sources.push(source);
    }

    Ok(sources)
}
