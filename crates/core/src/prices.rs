//! Aggregated price views across sources

use chrono::{DateTime, Utc};
use rust_decimal::Decimal;
use serde::Serialize;

use crate::{normalize_symbol, percent_of, CoreError, CoreResult, ExchangePrice};

/// Merged best-bid/best-ask view for one symbol
#[derive(Debug, Clone, PartialEq, Serialize)]
pub struct AggregatedPrice {
    symbol: String,
    best_bid: ExchangePrice,
    best_ask: ExchangePrice,
    all_prices: Vec<ExchangePrice>,
    aggregated_at: DateTime<Utc>,
    arbitrage_opportunity: Decimal,
}

impl AggregatedPrice {
    /// Merge a non-empty set of quotes.
    ///
    /// The best bid is the first quote carrying the highest bid, the best ask
    /// the first quote carrying the lowest ask. Input order is preserved in
    /// `all_prices`.
    pub fn from_quotes(
        symbol: &str,
        quotes: impl IntoIterator<Item = ExchangePrice>,
    ) -> CoreResult<Self> {
        let symbol = normalize_symbol(symbol);
        let all_prices: Vec<ExchangePrice> = quotes.into_iter().collect();

        let (first, rest) = all_prices
            .split_first()
            .ok_or_else(|| CoreError::EmptyQuoteSet(symbol.clone()))?;

        let mut best_bid = first;
        let mut best_ask = first;
        for quote in rest {
            if quote.bid_price() > best_bid.bid_price() {
                best_bid = quote;
            }
            if quote.ask_price() < best_ask.ask_price() {
                best_ask = quote;
            }
        }

        let arbitrage_opportunity =
            percent_of(best_bid.bid_price() - best_ask.ask_price(), best_ask.ask_price());

        let best_bid = best_bid.clone();
        let best_ask = best_ask.clone();

        Ok(Self {
            symbol,
            best_bid,
            best_ask,
            all_prices,
            aggregated_at: Utc::now(),
            arbitrage_opportunity,
        })
    }

    pub fn symbol(&self) -> &str {
        &self.symbol
    }

    pub fn best_bid(&self) -> &ExchangePrice {
        &self.best_bid
    }

    pub fn best_ask(&self) -> &ExchangePrice {
        &self.best_ask
    }

    pub fn all_prices(&self) -> &[ExchangePrice] {
        &self.all_prices
    }

    pub fn aggregated_at(&self) -> DateTime<Utc> {
        self.aggregated_at
    }

    /// Percentage gain of selling at the best bid after buying at the best ask
    pub fn arbitrage_opportunity(&self) -> Decimal {
        self.arbitrage_opportunity
    }

    /// True when the book is crossed across venues
    pub fn has_arbitrage_opportunity(&self) -> bool {
        self.arbitrage_opportunity > Decimal::ZERO
    }

    /// Best ask minus best bid
    pub fn spread(&self) -> Decimal {
        self.best_ask.ask_price() - self.best_bid.bid_price()
    }

    /// Distinct contributing sources, in first-seen order
    pub fn sources(&self) -> Vec<&str> {
        let mut seen: Vec<&str> = Vec::with_capacity(self.all_prices.len());
        for price in &self.all_prices {
            if !seen.contains(&price.source()) {
                seen.push(price.source());
            }
        }
        seen
    }

    pub fn source_count(&self) -> usize {
        self.sources().len()
    }
}
