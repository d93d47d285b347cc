//! Binance spot market data

use async_trait::async_trait;
use chrono::Utc;
use serde::Deserialize;
use tokio_util::sync::CancellationToken;
use tracing::debug;

use liquidity_core::{
    normalize_symbol, CryptoSymbol, EndpointConfig, ExchangeConfig, ExchangePrice, SourceError,
    SourceResult,
};
use liquidity_price_feed::PriceSource;

use crate::http::{parse_decimal, RestClient};

pub const BINANCE_BASE_URL: &str = "https://api.binance.com";

pub fn default_endpoints() -> EndpointConfig {
    EndpointConfig {
        symbols: "/api/v3/exchangeInfo".to_string(),
        ticker: "/api/v3/ticker/24hr?symbol={symbol}".to_string(),
        all_tickers: "/api/v3/ticker/24hr".to_string(),
    }
}

#[derive(Debug, Deserialize)]
struct ExchangeInfo {
    #[serde(default)]
    symbols: Vec<SymbolInfo>,
}

#[derive(Debug, Deserialize)]
#[serde(rename_all = "camelCase")]
struct SymbolInfo {
    symbol: String,
    status: String,
    base_asset: String,
    quote_asset: String,
}

#[derive(Debug, Deserialize)]
#[serde(rename_all = "camelCase")]
struct Ticker {
    symbol: String,
    bid_price: String,
    ask_price: String,
    last_price: String,
    volume: String,
}

/// Binance REST adapter
#[derive(Debug)]
pub struct BinanceSource {
    name: String,
    client: RestClient,
    endpoints: EndpointConfig,
}

impl BinanceSource {
    pub fn new(config: &ExchangeConfig) -> SourceResult<Self> {
        Ok(Self {
            name: config.name.clone(),
            client: RestClient::new(&config.base_url, config.timeout())?,
            endpoints: crate::registry::merge_endpoints(&config.endpoints, default_endpoints()),
        })
    }

    fn to_price(&self, ticker: &Ticker) -> SourceResult<ExchangePrice> {
        ExchangePrice::new(
            self.name.as_str(),
            &ticker.symbol,
            parse_decimal("bidPrice", &ticker.bid_price)?,
            parse_decimal("askPrice", &ticker.ask_price)?,
            parse_decimal("lastPrice", &ticker.last_price)?,
            parse_decimal("volume", &ticker.volume)?,
            Utc::now(),
        )
        .map_err(|e| SourceError::InvalidResponse(e.to_string()))
    }
}

#[async_trait]
impl PriceSource for BinanceSource {
    fn name(&self) -> &str {
        &self.name
    }

    async fn list_symbols(&self, cancel: &CancellationToken) -> SourceResult<Vec<CryptoSymbol>> {
        let info: ExchangeInfo = self.client.get_json(&self.endpoints.symbols, cancel).await?;

        Ok(info
            .symbols
            .iter()
            .filter(|s| s.status == "TRADING")
            .filter_map(|s| CryptoSymbol::new(&s.symbol, &s.base_asset, &s.quote_asset).ok())
            .collect())
    }

    async fn get_price(
        &self,
        symbol: &str,
        cancel: &CancellationToken,
    ) -> SourceResult<Option<ExchangePrice>> {
        let path = self
            .endpoints
            .ticker
            .replace("{symbol}", &normalize_symbol(symbol));

        match self.client.get_json::<Ticker>(&path, cancel).await {
            Ok(ticker) => self.to_price(&ticker).map(Some),
            // Unknown symbols are answered with 400 "Invalid symbol."
            Err(SourceError::Http { status: 400, .. }) => Ok(None),
            Err(err) => Err(err),
        }
    }

    async fn get_all_prices(&self, cancel: &CancellationToken) -> SourceResult<Vec<ExchangePrice>> {
        let tickers: Vec<Ticker> = self
            .client
            .get_json(&self.endpoints.all_tickers, cancel)
            .await?;

        let total = tickers.len();
        let prices: Vec<ExchangePrice> = tickers
            .iter()
            .filter_map(|t| self.to_price(t).ok())
            .collect();

        if prices.len() < total {
            debug!(source = %self.name, skipped = total - prices.len(), "Skipped unparseable tickers");
        }
        Ok(prices)
    }
}
