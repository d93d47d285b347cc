//! Bybit v5 spot market data

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

pub const BYBIT_BASE_URL: &str = "https://api.bybit.com";

pub fn default_endpoints() -> EndpointConfig {
    EndpointConfig {
        symbols: "/v5/market/instruments-info?category=spot".to_string(),
        ticker: "/v5/market/tickers?category=spot&symbol={symbol}".to_string(),
        all_tickers: "/v5/market/tickers?category=spot".to_string(),
    }
}

/// Every v5 response is wrapped in this envelope
#[derive(Debug, Deserialize)]
#[serde(rename_all = "camelCase")]
struct Envelope<T> {
    ret_code: i64,
    #[serde(default)]
    ret_msg: String,
    result: Option<ListResult<T>>,
}

#[derive(Debug, Deserialize)]
struct ListResult<T> {
    #[serde(default = "Vec::new")]
    list: Vec<T>,
}

impl<T> Envelope<T> {
    fn into_list(self) -> SourceResult<Vec<T>> {
        if self.ret_code != 0 {
            return Err(SourceError::InvalidResponse(format!(
                "retCode {}: {}",
                self.ret_code, self.ret_msg
            )));
        }
        Ok(self.result.map(|r| r.list).unwrap_or_default())
    }
}

#[derive(Debug, Deserialize)]
#[serde(rename_all = "camelCase")]
struct Instrument {
    symbol: String,
    base_coin: String,
    quote_coin: String,
    status: String,
}

#[derive(Debug, Deserialize)]
#[serde(rename_all = "camelCase")]
struct Ticker {
    symbol: String,
    bid1_price: String,
    ask1_price: String,
    last_price: String,
    volume24h: String,
}

/// Bybit REST adapter
#[derive(Debug)]
pub struct BybitSource {
    name: String,
    client: RestClient,
    endpoints: EndpointConfig,
}

impl BybitSource {
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
            parse_decimal("bid1Price", &ticker.bid1_price)?,
            parse_decimal("ask1Price", &ticker.ask1_price)?,
            parse_decimal("lastPrice", &ticker.last_price)?,
            parse_decimal("volume24h", &ticker.volume24h)?,
            Utc::now(),
        )
        .map_err(|e| SourceError::InvalidResponse(e.to_string()))
    }
}

#[async_trait]
impl PriceSource for BybitSource {
    fn name(&self) -> &str {
        &self.name
    }

    async fn list_symbols(&self, cancel: &CancellationToken) -> SourceResult<Vec<CryptoSymbol>> {
        let envelope: Envelope<Instrument> =
            self.client.get_json(&self.endpoints.symbols, cancel).await?;

        Ok(envelope
            .into_list()?
            .iter()
            .filter(|i| i.status == "Trading")
            .filter_map(|i| CryptoSymbol::new(&i.symbol, &i.base_coin, &i.quote_coin).ok())
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
        let envelope: Envelope<Ticker> = self.client.get_json(&path, cancel).await?;

        match envelope.into_list()?.first() {
            Some(ticker) => self.to_price(ticker).map(Some),
            None => Ok(None),
        }
    }

    async fn get_all_prices(&self, cancel: &CancellationToken) -> SourceResult<Vec<ExchangePrice>> {
        let envelope: Envelope<Ticker> = self
            .client
            .get_json(&self.endpoints.all_tickers, cancel)
            .await?;
        let tickers = envelope.into_list()?;

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
