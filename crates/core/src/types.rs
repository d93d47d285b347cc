//! Core type definitions

use chrono::{DateTime, Utc};
use rust_decimal::Decimal;
use serde::Serialize;
use std::fmt;

use crate::{CoreError, CoreResult};

/// Normalize a symbol for case-insensitive identity
pub fn normalize_symbol(symbol: &str) -> String {
    symbol.trim().to_uppercase()
}

/// `numerator / denominator * 100`, saturating at the `Decimal` bounds.
/// Zero when the denominator is not positive.
pub fn percent_of(numerator: Decimal, denominator: Decimal) -> Decimal {
    if denominator <= Decimal::ZERO {
        return Decimal::ZERO;
    }
    let saturated = if numerator.is_sign_negative() {
        Decimal::MIN
    } else {
        Decimal::MAX
    };
    numerator
        .checked_div(denominator)
        .and_then(|ratio| ratio.checked_mul(Decimal::ONE_HUNDRED))
        .unwrap_or(saturated)
}

/// A single source's quote for a symbol
///
/// Immutable once constructed. All monetary fields are non-negative.
#[derive(Debug, Clone, PartialEq, Serialize)]
pub struct ExchangePrice {
    source: String,
    symbol: String,
    bid_price: Decimal,
    ask_price: Decimal,
    last_price: Decimal,
    volume_24h: Decimal,
    timestamp: DateTime<Utc>,
}

impl ExchangePrice {
    pub fn new(
        source: impl Into<String>,
        symbol: &str,
        bid_price: Decimal,
        ask_price: Decimal,
        last_price: Decimal,
        volume_24h: Decimal,
        timestamp: DateTime<Utc>,
    ) -> CoreResult<Self> {
        let source = source.into();
        if source.trim().is_empty() {
            return Err(CoreError::InvalidPrice("source name cannot be empty".to_string()));
        }

        let symbol = normalize_symbol(symbol);
        if symbol.is_empty() {
            return Err(CoreError::InvalidPrice("symbol cannot be empty".to_string()));
        }

        for (field, value) in [
            ("bid price", bid_price),
            ("ask price", ask_price),
            ("last price", last_price),
            ("volume", volume_24h),
        ] {
            if value.is_sign_negative() && !value.is_zero() {
                return Err(CoreError::InvalidPrice(format!(
                    "{} cannot be negative: {} {} = {}",
                    field, source, symbol, value
                )));
            }
        }

        Ok(Self {
            source,
            symbol,
            bid_price,
            ask_price,
            last_price,
            volume_24h,
            timestamp,
        })
    }

    pub fn source(&self) -> &str {
        &self.source
    }

    pub fn symbol(&self) -> &str {
        &self.symbol
    }

    pub fn bid_price(&self) -> Decimal {
        self.bid_price
    }

    pub fn ask_price(&self) -> Decimal {
        self.ask_price
    }

    pub fn last_price(&self) -> Decimal {
        self.last_price
    }

    pub fn volume_24h(&self) -> Decimal {
        self.volume_24h
    }

    pub fn timestamp(&self) -> DateTime<Utc> {
        self.timestamp
    }

    /// Ask minus bid on this venue
    pub fn spread(&self) -> Decimal {
        self.ask_price - self.bid_price
    }

    /// Spread as a percentage of the bid (0 when the bid is 0)
    pub fn spread_percentage(&self) -> Decimal {
        percent_of(self.spread(), self.bid_price)
    }
}

impl fmt::Display for ExchangePrice {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        write!(
            f,
            "{}@{} bid={} ask={}",
            self.symbol, self.source, self.bid_price, self.ask_price
        )
    }
}

/// A tradable symbol as listed by a source
#[derive(Debug, Clone, PartialEq, Eq, Hash, Serialize)]
pub struct CryptoSymbol {
    symbol: String,
    base_asset: String,
    quote_asset: String,
}

impl CryptoSymbol {
    pub fn new(symbol: &str, base_asset: &str, quote_asset: &str) -> CoreResult<Self> {
        let symbol = normalize_symbol(symbol);
        if symbol.is_empty() {
            return Err(CoreError::InvalidSymbol("symbol cannot be empty".to_string()));
        }

        Ok(Self {
            symbol,
            base_asset: normalize_symbol(base_asset),
            quote_asset: normalize_symbol(quote_asset),
        })
    }

    pub fn symbol(&self) -> &str {
        &self.symbol
    }

    pub fn base_asset(&self) -> &str {
        &self.base_asset
    }

    pub fn quote_asset(&self) -> &str {
        &self.quote_asset
    }
}

impl fmt::Display for CryptoSymbol {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        write!(f, "{}", self.symbol)
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use rust_decimal_macros::dec;

    fn quote(bid: Decimal, ask: Decimal) -> CoreResult<ExchangePrice> {
        ExchangePrice::new("binance", "btcusdt", bid, ask, dec!(100), dec!(10), Utc::now())
    }

    #[test]
    fn test_symbol_is_uppercased() {
        let price = quote(dec!(100), dec!(101)).unwrap();
        assert_eq!(price.symbol(), "BTCUSDT");
        assert_eq!(price.source(), "binance");
    }

    #[test]
    fn test_negative_prices_rejected() {
        assert!(matches!(quote(dec!(-1), dec!(101)), Err(CoreError::InvalidPrice(_))));
        assert!(matches!(quote(dec!(100), dec!(-0.5)), Err(CoreError::InvalidPrice(_))));

        let negative_volume =
            ExchangePrice::new("kraken", "ETHUSD", dec!(1), dec!(2), dec!(1), dec!(-3), Utc::now());
        assert!(negative_volume.is_err());
    }

    #[test]
    fn test_zero_prices_allowed() {
        let price = quote(dec!(0), dec!(0)).unwrap();
        assert_eq!(price.spread_percentage(), Decimal::ZERO);
    }

    #[test]
    fn test_empty_symbol_and_source_rejected() {
        let blank_symbol =
            ExchangePrice::new("binance", "   ", dec!(1), dec!(2), dec!(1), dec!(1), Utc::now());
        assert!(blank_symbol.is_err());

        let blank_source =
            ExchangePrice::new("", "BTCUSDT", dec!(1), dec!(2), dec!(1), dec!(1), Utc::now());
        assert!(blank_source.is_err());
    }

    #[test]
    fn test_spread() {
        let price = quote(dec!(100), dec!(101)).unwrap();
        assert_eq!(price.spread(), dec!(1));
        assert_eq!(price.spread_percentage(), dec!(1));
    }

    #[test]
    fn test_spread_percentage_saturates() {
        let price = quote(Decimal::new(1, 8), dec!(100000000000000000000)).unwrap();
        assert_eq!(price.spread_percentage(), Decimal::MAX);
    }

    #[test]
    fn test_percent_of() {
        assert_eq!(percent_of(dec!(1), dec!(4)), dec!(25));
        assert_eq!(percent_of(dec!(1), dec!(0)), Decimal::ZERO);
        assert_eq!(percent_of(Decimal::MAX, Decimal::new(1, 8)), Decimal::MAX);
        assert_eq!(percent_of(Decimal::MIN, Decimal::new(1, 8)), Decimal::MIN);
    }

    #[test]
    fn test_crypto_symbol_normalization() {
        let symbol = CryptoSymbol::new(" ethusdt ", "eth", "usdt").unwrap();
        assert_eq!(symbol.symbol(), "ETHUSDT");
        assert_eq!(symbol.base_asset(), "ETH");
        assert_eq!(symbol.quote_asset(), "USDT");
        assert!(CryptoSymbol::new("", "ETH", "USDT").is_err());
    }
}
