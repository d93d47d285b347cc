//! Price source capability

use async_trait::async_trait;
use tokio_util::sync::CancellationToken;

use liquidity_core::{CryptoSymbol, ExchangePrice, SourceResult};

/// An exchange or other provider of quotes.
///
/// Implementations should observe `cancel` and return
/// [`SourceError::Cancelled`](liquidity_core::SourceError::Cancelled) once it fires.
#[async_trait]
pub trait PriceSource: Send + Sync {
    /// Stable name used in diagnostics and results
    fn name(&self) -> &str;

    /// Symbols currently tradable on this source
    async fn list_symbols(&self, cancel: &CancellationToken) -> SourceResult<Vec<CryptoSymbol>>;

    /// Quote for one symbol, `None` when the source does not list it
    async fn get_price(
        &self,
        symbol: &str,
        cancel: &CancellationToken,
    ) -> SourceResult<Option<ExchangePrice>>;

    /// Bulk ticker dump
    async fn get_all_prices(&self, cancel: &CancellationToken) -> SourceResult<Vec<ExchangePrice>>;
}
