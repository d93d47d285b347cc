//! Arbitrage opportunity filtering and ranking

use rust_decimal::Decimal;
use serde::{Deserialize, Serialize};

use crate::{normalize_symbol, AggregatedPrice};

/// Selects aggregates worth acting on
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct ArbitrageFilter {
    /// Minimum arbitrage percentage (0.1 = 0.1%)
    pub min_profit_percent: Decimal,
    /// Optional symbol whitelist, matched case-insensitively
    pub symbols: Option<Vec<String>>,
}

impl Default for ArbitrageFilter {
    fn default() -> Self {
        Self {
            min_profit_percent: Decimal::new(1, 1),
            symbols: None,
        }
    }
}

impl ArbitrageFilter {
    pub fn with_min_profit(min_profit_percent: Decimal) -> Self {
        Self {
            min_profit_percent,
            symbols: None,
        }
    }

    pub fn with_symbols<I, S>(mut self, symbols: I) -> Self
    where
        I: IntoIterator<Item = S>,
        S: AsRef<str>,
    {
        self.symbols = Some(symbols.into_iter().map(|s| normalize_symbol(s.as_ref())).collect());
        self
    }

    pub fn matches(&self, price: &AggregatedPrice) -> bool {
        if !price.has_arbitrage_opportunity()
            || price.arbitrage_opportunity() < self.min_profit_percent
        {
            return false;
        }

        match &self.symbols {
            Some(symbols) => symbols
                .iter()
                .any(|s| s.eq_ignore_ascii_case(price.symbol())),
            None => true,
        }
    }
}

/// Keep crossed books, best first
pub fn rank_opportunities(prices: Vec<AggregatedPrice>) -> Vec<AggregatedPrice> {
    let mut opportunities: Vec<AggregatedPrice> = prices
        .into_iter()
        .filter(|p| p.has_arbitrage_opportunity())
        .collect();
    opportunities.sort_by(|a, b| b.arbitrage_opportunity().cmp(&a.arbitrage_opportunity()));
    opportunities
}
