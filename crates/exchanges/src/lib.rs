//! REST adapters for exchange price sources
//!
//! Each adapter is a thin [`PriceSource`](liquidity_price_feed::PriceSource)
//! over the exchange's public market-data endpoints.

pub mod binance;
pub mod bybit;
pub mod http;
pub mod registry;

pub use binance::BinanceSource;
pub use bybit::BybitSource;
pub use http::RestClient;
pub use registry::{build_sources, default_exchanges};
