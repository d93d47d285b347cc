//! Liquidity aggregator - fans out to every registered source and merges the results

use futures::StreamExt;
use rayon::prelude::*;
use serde::Serialize;
use std::collections::{BTreeMap, HashMap, HashSet};
use std::sync::atomic::{AtomicBool, Ordering};
use std::sync::Arc;
use tokio::sync::{mpsc, Semaphore};
use tokio::task::JoinSet;
use tokio_stream::wrappers::UnboundedReceiverStream;
use tokio_util::sync::CancellationToken;
use tracing::{debug, info, warn};

use liquidity_core::{
    normalize_symbol, rank_opportunities, AggregatedPrice, AggregatorConfig, AggregatorError,
    AggregatorResult, ArbitrageFilter, CacheConfig, CryptoSymbol, ExchangePrice, PartialResult,
    SourceError, SourceErrorKind,
};

use crate::cache::{CacheError, CacheStats, TtlCache};
use crate::call::{execute_call, CallFailure, ExchangeCallResult};
use crate::sources::PriceSource;

const SYMBOLS_CACHE_KEY: &str = "all_symbols";

impl From<CacheError> for AggregatorError {
    fn from(err: CacheError) -> Self {
        match err {
            CacheError::Cancelled => AggregatorError::Cancelled,
            CacheError::Closed => AggregatorError::Closed,
        }
    }
}

/// Cache statistics for both hot paths
#[derive(Debug, Clone, Serialize)]
pub struct AggregatorCacheStats {
    pub prices: CacheStats,
    pub symbols: CacheStats,
}

type IndexedResult<T> = (usize, ExchangeCallResult<T>);

/// Cross-source price aggregator
pub struct LiquidityAggregator {
    sources: Vec<Arc<dyn PriceSource>>,
    config: AggregatorConfig,
    price_cache: TtlCache<AggregatedPrice>,
    symbol_cache: TtlCache<Vec<CryptoSymbol>>,
    admission: Arc<Semaphore>,
    closed: AtomicBool,
}

impl LiquidityAggregator {
    /// Must be called inside a Tokio runtime; the caches start background tasks.
    pub fn new(
        sources: Vec<Arc<dyn PriceSource>>,
        config: AggregatorConfig,
        cache_config: CacheConfig,
    ) -> AggregatorResult<Self> {
        if sources.is_empty() {
            return Err(AggregatorError::Configuration(
                "at least one price source is required".to_string(),
            ));
        }
        config.validate()?;
        cache_config.validate()?;

        let mut names = HashSet::new();
        for source in &sources {
            if !names.insert(source.name().to_lowercase()) {
                return Err(AggregatorError::Configuration(format!(
                    "duplicate price source: {}",
                    source.name()
                )));
            }
        }

        info!(
            sources = sources.len(),
            max_parallel_calls = config.max_parallel_calls,
            "Liquidity aggregator initialized"
        );

        Ok(Self {
            admission: Arc::new(Semaphore::new(config.max_parallel_calls)),
            price_cache: TtlCache::new("prices", &cache_config),
            symbol_cache: TtlCache::new("symbols", &cache_config),
            sources,
            config,
            closed: AtomicBool::new(false),
        })
    }

    pub fn source_names(&self) -> Vec<String> {
        self.sources.iter().map(|s| s.name().to_string()).collect()
    }

    pub fn config(&self) -> &AggregatorConfig {
        &self.config
    }

    /// Best bid and best ask for one symbol across all sources.
    ///
    /// Fails only when no source returns a quote. Results are cached for
    /// `price_cache_ttl` and concurrent requests for the same symbol share
    /// one fan-out.
    pub async fn get_best_price(
        &self,
        symbol: &str,
        cancel: &CancellationToken,
    ) -> AggregatorResult<AggregatedPrice> {
        self.ensure_open()?;
        let symbol = self.validate_symbol(symbol)?;
        let key = format!("price_{}", symbol);

        self.price_cache
            .get_or_compute(&key, self.config.price_cache_ttl(), cancel, || {
                self.fetch_best_price(&symbol, cancel)
            })
            .await
    }

    /// Aggregates for every symbol quoted by more than one source, sorted by symbol.
    ///
    /// Source failures degrade the result; if every source fails the result is empty.
    pub async fn get_all_best_prices(
        &self,
        cancel: &CancellationToken,
    ) -> AggregatorResult<Vec<AggregatedPrice>> {
        self.ensure_open()?;
        let timeout = self.config.call_timeout();
        let (tx, rx) = mpsc::unbounded_channel::<(usize, Vec<ExchangePrice>)>();

        let mut tasks = JoinSet::new();
        for (idx, source) in self.sources.iter().enumerate() {
            let source = Arc::clone(source);
            let admission = Arc::clone(&self.admission);
            let cancel = cancel.clone();
            let tx = tx.clone();

            tasks.spawn(async move {
                let name = source.name().to_string();

                let permit = tokio::select! {
                    biased;
                    _ = cancel.cancelled() => {
                        let failure = CallFailure::new(SourceErrorKind::Cancelled, "cancelled while waiting for admission");
                        return (idx, ExchangeCallResult::failed(name, failure));
                    }
                    permit = admission.acquire_owned() => permit,
                };
                let Ok(_permit) = permit else {
                    let failure = CallFailure::new(SourceErrorKind::Unknown, "admission gate closed");
                    return (idx, ExchangeCallResult::failed(name, failure));
                };

                let result = execute_call(&name, "get_all_prices", timeout, &cancel, move |token| async move {
                    source.get_all_prices(&token).await
                })
                .await;

                // Hand the batch to the collector as soon as it lands.
                let result = result.map(|prices| {
                    let count = prices.len();
                    let _ = tx.send((idx, prices));
                    count
                });
                (idx, result)
            });
        }
        drop(tx);

        let collector = UnboundedReceiverStream::new(rx).fold(
            HashMap::<String, Vec<(usize, ExchangePrice)>>::new(),
            |mut groups, (idx, batch)| async move {
                for price in batch {
                    groups
                        .entry(price.symbol().to_string())
                        .or_default()
                        .push((idx, price));
                }
                groups
            },
        );

        let (groups, results) = tokio::join!(collector, self.join_all(tasks));

        if cancel.is_cancelled() {
            return Err(AggregatorError::Cancelled);
        }

        let report = summarize(&results);
        if !report.failed.is_empty() {
            warn!("Bulk price fetch degraded: {}", report);
        }

        let mut prices: Vec<AggregatedPrice> = groups
            .into_par_iter()
            .filter_map(|(symbol, mut quotes)| {
                // Arrival order is arbitrary; registration order is not.
                quotes.sort_by_key(|(idx, _)| *idx);
                let distinct = quotes.iter().map(|(idx, _)| *idx).collect::<HashSet<_>>();
                if distinct.len() < 2 {
                    return None;
                }
                AggregatedPrice::from_quotes(&symbol, quotes.into_iter().map(|(_, p)| p)).ok()
            })
            .collect();
        prices.sort_by(|a, b| a.symbol().cmp(b.symbol()));

        debug!(
            symbols = prices.len(),
            succeeded = report.succeeded.len(),
            failed = report.failed.len(),
            "Aggregated all prices"
        );
        Ok(prices)
    }

    /// Symbols listed on at least two sources, sorted by symbol.
    ///
    /// Empty when no source answers; that outcome is not cached so the next
    /// call retries.
    pub async fn get_available_symbols(
        &self,
        cancel: &CancellationToken,
    ) -> AggregatorResult<Vec<CryptoSymbol>> {
        self.ensure_open()?;
        let listing = self
            .symbol_cache
            .get_or_compute(
                SYMBOLS_CACHE_KEY,
                self.config.symbol_cache_ttl(),
                cancel,
                || self.fetch_available_symbols(cancel),
            )
            .await;

        match listing {
            Err(AggregatorError::Aggregation {
                source_errors,
                success_count: 0,
                ..
            }) => {
                warn!(
                    failed = source_errors.len(),
                    "No source returned a symbol listing, returning empty set"
                );
                Ok(Vec::new())
            }
            other => other,
        }
    }

    /// Crossed books across all sources, best first
    pub async fn get_arbitrage_opportunities(
        &self,
        cancel: &CancellationToken,
    ) -> AggregatorResult<Vec<AggregatedPrice>> {
        let prices = self.get_all_best_prices(cancel).await?;
        Ok(rank_opportunities(prices))
    }

    pub async fn get_arbitrage_opportunities_matching(
        &self,
        filter: &ArbitrageFilter,
        cancel: &CancellationToken,
    ) -> AggregatorResult<Vec<AggregatedPrice>> {
        let ranked = self.get_arbitrage_opportunities(cancel).await?;
        Ok(ranked.into_iter().filter(|p| filter.matches(p)).collect())
    }

    pub fn invalidate_caches(&self) {
        self.price_cache.invalidate_all();
        self.symbol_cache.invalidate_all();
        debug!("Aggregator caches invalidated");
    }

    pub fn cache_stats(&self) -> AggregatorCacheStats {
        AggregatorCacheStats {
            prices: self.price_cache.stats(),
            symbols: self.symbol_cache.stats(),
        }
    }

    pub fn is_closed(&self) -> bool {
        self.closed.load(Ordering::Acquire)
    }

    /// Close the admission gate and shut down both caches
    pub async fn shutdown(&self) {
        if self.closed.swap(true, Ordering::AcqRel) {
            return;
        }
        info!("Shutting down liquidity aggregator");

        self.admission.close();
        tokio::join!(self.price_cache.shutdown(), self.symbol_cache.shutdown());

        info!("Liquidity aggregator stopped");
    }

    async fn fetch_best_price(
        &self,
        symbol: &str,
        cancel: &CancellationToken,
    ) -> AggregatorResult<AggregatedPrice> {
        let timeout = self.config.call_timeout();

        let mut tasks = JoinSet::new();
        for (idx, source) in self.sources.iter().enumerate() {
            let source = Arc::clone(source);
            let symbol = symbol.to_string();
            let cancel = cancel.clone();

            tasks.spawn(async move {
                let name = source.name().to_string();
                let result = execute_call(&name, "get_price", timeout, &cancel, move |token| async move {
                    source
                        .get_price(&symbol, &token)
                        .await
                        .and_then(|price| price.ok_or_else(|| SourceError::SymbolNotFound(symbol.clone())))
                })
                .await;
                (idx, result)
            });
        }

        let results = self.join_all(tasks).await;
        if cancel.is_cancelled() {
            return Err(AggregatorError::Cancelled);
        }

        let report = summarize(&results);
        let mut quotes: Vec<ExchangePrice> = Vec::with_capacity(results.len());
        for result in results {
            match result.into_result() {
                Ok(quote) => quotes.push(quote),
                Err(err) => debug!(symbol, error = %err, "Source excluded from merge"),
            }
        }

        if quotes.is_empty() {
            return Err(AggregatorError::NoPriceData {
                symbol: symbol.to_string(),
                attempted_sources: self.source_names(),
            });
        }
        if report.is_partial() {
            warn!(symbol, "{}", AggregatorError::PartialResult(report));
        }

        let aggregated = AggregatedPrice::from_quotes(symbol, quotes)?;
        debug!(
            symbol,
            sources = aggregated.source_count(),
            arbitrage = %aggregated.arbitrage_opportunity(),
            "Aggregated best price"
        );
        Ok(aggregated)
    }

    async fn fetch_available_symbols(
        &self,
        cancel: &CancellationToken,
    ) -> AggregatorResult<Vec<CryptoSymbol>> {
        let timeout = self.config.call_timeout();

        let mut tasks = JoinSet::new();
        for (idx, source) in self.sources.iter().enumerate() {
            let source = Arc::clone(source);
            let cancel = cancel.clone();

            tasks.spawn(async move {
                let name = source.name().to_string();
                let result = execute_call(&name, "list_symbols", timeout, &cancel, move |token| async move {
                    source.list_symbols(&token).await
                })
                .await;
                (idx, result)
            });
        }

        let results = self.join_all(tasks).await;
        if cancel.is_cancelled() {
            return Err(AggregatorError::Cancelled);
        }

        let report = summarize(&results);
        if report.succeeded.is_empty() {
            return Err(AggregatorError::Aggregation {
                message: "no source returned a symbol listing".to_string(),
                source_errors: report.failed,
                success_count: 0,
            });
        }
        if report.is_partial() {
            warn!("Symbol listing degraded: {}", report);
        }

        // First listing in registration order wins; the set tracks which sources carry it.
        let mut listings: BTreeMap<String, (CryptoSymbol, HashSet<usize>)> = BTreeMap::new();
        for (idx, result) in results.into_iter().enumerate() {
            let Ok(symbols) = result.outcome else { continue };
            for symbol in symbols {
                listings
                    .entry(symbol.symbol().to_string())
                    .or_insert_with(|| (symbol.clone(), HashSet::new()))
                    .1
                    .insert(idx);
            }
        }

        let available: Vec<CryptoSymbol> = listings
            .into_values()
            .filter(|(_, seen_on)| seen_on.len() >= 2)
            .map(|(symbol, _)| symbol)
            .collect();

        debug!(symbols = available.len(), "Resolved available symbols");
        Ok(available)
    }

    /// Wait for every task and return results in registration order
    async fn join_all<T: Send + 'static>(
        &self,
        mut tasks: JoinSet<IndexedResult<T>>,
    ) -> Vec<ExchangeCallResult<T>> {
        let mut slots: Vec<Option<ExchangeCallResult<T>>> =
            (0..self.sources.len()).map(|_| None).collect();

        while let Some(joined) = tasks.join_next().await {
            match joined {
                Ok((idx, result)) => {
                    if let Some(slot) = slots.get_mut(idx) {
                        *slot = Some(result);
                    }
                }
                Err(err) => warn!("Source task failed: {}", err),
            }
        }

        slots
            .into_iter()
            .zip(&self.sources)
            .map(|(slot, source)| {
                slot.unwrap_or_else(|| {
                    ExchangeCallResult::failed(
                        source.name(),
                        CallFailure::new(SourceErrorKind::Unknown, "source task aborted"),
                    )
                })
            })
            .collect()
    }

    fn validate_symbol(&self, symbol: &str) -> AggregatorResult<String> {
        let symbol = normalize_symbol(symbol);
        let len = symbol.chars().count();
        if symbol.is_empty() {
            return Err(AggregatorError::InvalidSymbol("symbol cannot be empty".to_string()));
        }
        if len < self.config.min_symbol_len || len > self.config.max_symbol_len {
            return Err(AggregatorError::InvalidSymbol(format!(
                "{} must be {}-{} characters",
                symbol, self.config.min_symbol_len, self.config.max_symbol_len
            )));
        }
        Ok(symbol)
    }

    fn ensure_open(&self) -> AggregatorResult<()> {
        if self.is_closed() {
            Err(AggregatorError::Closed)
        } else {
            Ok(())
        }
    }
}

fn summarize<T>(results: &[ExchangeCallResult<T>]) -> PartialResult {
    let mut report = PartialResult::default();
    for result in results {
        match &result.outcome {
            Ok(_) => report.succeeded.push(result.source_name.clone()),
            Err(failure) => {
                report
                    .failed
                    .insert(result.source_name.clone(), failure.to_string());
            }
        }
    }
    report
}

#[cfg(test)]
mod tests {
    use super::*;
    use async_trait::async_trait;
    use liquidity_core::{AggregatorErrorKind, SourceResult};

    struct EmptySource(&'static str);

    #[async_trait]
    impl PriceSource for EmptySource {
        fn name(&self) -> &str {
            self.0
        }

        async fn list_symbols(&self, _: &CancellationToken) -> SourceResult<Vec<CryptoSymbol>> {
            Ok(vec![])
        }

        async fn get_price(
            &self,
            _: &str,
            _: &CancellationToken,
        ) -> SourceResult<Option<ExchangePrice>> {
            Ok(None)
        }

        async fn get_all_prices(&self, _: &CancellationToken) -> SourceResult<Vec<ExchangePrice>> {
            Ok(vec![])
        }
    }

    fn aggregator(names: &[&'static str]) -> AggregatorResult<LiquidityAggregator> {
        let sources: Vec<Arc<dyn PriceSource>> = names
            .iter()
            .map(|n| Arc::new(EmptySource(*n)) as Arc<dyn PriceSource>)
            .collect();
        LiquidityAggregator::new(sources, AggregatorConfig::default(), CacheConfig::default())
    }

    #[tokio::test]
    async fn test_aggregator_creation() {
        let aggregator = aggregator(&["binance", "bybit"]).unwrap();
        assert_eq!(aggregator.source_names(), vec!["binance", "bybit"]);
        assert!(!aggregator.is_closed());
        assert_eq!(aggregator.cache_stats().prices.entries, 0);
    }

    #[tokio::test]
    async fn test_rejects_empty_and_duplicate_sources() {
        let empty = aggregator(&[]).err().map(|e| e.kind());
        assert_eq!(empty, Some(AggregatorErrorKind::Configuration));

        let duplicate = aggregator(&["binance", "Binance"]).err().map(|e| e.kind());
        assert_eq!(duplicate, Some(AggregatorErrorKind::Configuration));
    }

    #[tokio::test]
    async fn test_rejects_zero_lock_cleanup_interval() {
        let sources: Vec<Arc<dyn PriceSource>> = vec![Arc::new(EmptySource("binance"))];
        let cache_config = CacheConfig {
            lock_cleanup_interval_secs: 0,
            ..Default::default()
        };
        let err = LiquidityAggregator::new(sources, AggregatorConfig::default(), cache_config)
            .err()
            .map(|e| e.kind());
        assert_eq!(err, Some(AggregatorErrorKind::Core));
    }

    #[tokio::test]
    async fn test_symbol_validation() {
        let aggregator = aggregator(&["binance"]).unwrap();
        assert_eq!(aggregator.validate_symbol(" btcusdt ").unwrap(), "BTCUSDT");
        assert!(aggregator.validate_symbol("").is_err());
        assert!(aggregator.validate_symbol("B").is_err());
        assert!(aggregator.validate_symbol(&"X".repeat(21)).is_err());
        assert!(aggregator.validate_symbol(&"X".repeat(20)).is_ok());
    }

    #[tokio::test]
    async fn test_unlisted_symbol_is_no_price_data() {
        let aggregator = aggregator(&["binance", "bybit"]).unwrap();
        let token = CancellationToken::new();

        let err = aggregator.get_best_price("BTCUSDT", &token).await.unwrap_err();
        assert_eq!(err.kind(), AggregatorErrorKind::NoPriceData);
        assert_eq!(aggregator.cache_stats().prices.entries, 0);
    }

    #[tokio::test]
    async fn test_calls_after_shutdown_fail() {
        let aggregator = aggregator(&["binance"]).unwrap();
        aggregator.shutdown().await;
        let token = CancellationToken::new();

        assert!(matches!(
            aggregator.get_all_best_prices(&token).await,
            Err(AggregatorError::Closed)
        ));
        assert!(matches!(
            aggregator.get_best_price("BTCUSDT", &token).await,
            Err(AggregatorError::Closed)
        ));
    }
}
