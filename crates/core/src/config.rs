//! Configuration types

use serde::{Deserialize, Serialize};
use std::time::Duration;

use crate::{CoreError, CoreResult};

/// Aggregation engine configuration
#[derive(Debug, Clone, Serialize, Deserialize)]
#[serde(default)]
pub struct AggregatorConfig {
    pub price_cache_ttl_ms: u64,
    pub symbol_cache_ttl_secs: u64,
    pub call_timeout_ms: u64,
    pub max_parallel_calls: usize,
    pub min_symbol_len: usize,
    pub max_symbol_len: usize,
}

impl Default for AggregatorConfig {
    fn default() -> Self {
        Self {
            price_cache_ttl_ms: 5_000,    // quotes go stale fast
            symbol_cache_ttl_secs: 300,   // listings change rarely
            call_timeout_ms: 10_000,
            max_parallel_calls: 10,
            min_symbol_len: 2,
            max_symbol_len: 20,
        }
    }
}

impl AggregatorConfig {
    pub fn price_cache_ttl(&self) -> Duration {
        Duration::from_millis(self.price_cache_ttl_ms)
    }

    pub fn symbol_cache_ttl(&self) -> Duration {
        Duration::from_secs(self.symbol_cache_ttl_secs)
    }

    pub fn call_timeout(&self) -> Duration {
        Duration::from_millis(self.call_timeout_ms)
    }

    pub fn validate(&self) -> CoreResult<()> {
        if self.call_timeout_ms == 0 {
            return Err(CoreError::InvalidConfig("call_timeout_ms must be > 0".to_string()));
        }
        if self.max_parallel_calls == 0 {
            return Err(CoreError::InvalidConfig(
                "max_parallel_calls must be > 0".to_string(),
            ));
        }
        if self.min_symbol_len == 0 || self.min_symbol_len > self.max_symbol_len {
            return Err(CoreError::InvalidConfig(format!(
                "invalid symbol length range {}..={}",
                self.min_symbol_len, self.max_symbol_len
            )));
        }
        Ok(())
    }
}

/// Cache and keyed-lock housekeeping
#[derive(Debug, Clone, Serialize, Deserialize)]
#[serde(default)]
pub struct CacheConfig {
    pub lock_cleanup_interval_secs: u64,
    pub shutdown_grace_ms: u64,
}

impl Default for CacheConfig {
    fn default() -> Self {
        Self {
            lock_cleanup_interval_secs: 300,
            shutdown_grace_ms: 5_000,
        }
    }
}

impl CacheConfig {
    pub fn lock_cleanup_interval(&self) -> Duration {
        Duration::from_secs(self.lock_cleanup_interval_secs)
    }

    pub fn shutdown_grace(&self) -> Duration {
        Duration::from_millis(self.shutdown_grace_ms)
    }

    pub fn validate(&self) -> CoreResult<()> {
        if self.lock_cleanup_interval_secs == 0 {
            return Err(CoreError::InvalidConfig(
                "lock_cleanup_interval_secs must be > 0".to_string(),
            ));
        }
        Ok(())
    }
}

/// REST paths of an exchange. `ticker` carries a `{symbol}` placeholder.
#[derive(Debug, Clone, Default, Serialize, Deserialize)]
#[serde(default)]
pub struct EndpointConfig {
    pub symbols: String,
    pub ticker: String,
    pub all_tickers: String,
}

/// One exchange adapter
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct ExchangeConfig {
    pub name: String,
    pub base_url: String,
    #[serde(default = "default_exchange_timeout_secs")]
    pub timeout_secs: u64,
    #[serde(default = "default_enabled")]
    pub enabled: bool,
    #[serde(default)]
    pub endpoints: EndpointConfig,
}

fn default_exchange_timeout_secs() -> u64 {
    30
}

fn default_enabled() -> bool {
    true
}

impl ExchangeConfig {
    pub fn new(name: impl Into<String>, base_url: impl Into<String>) -> Self {
        Self {
            name: name.into(),
            base_url: base_url.into(),
            timeout_secs: default_exchange_timeout_secs(),
            enabled: true,
            endpoints: EndpointConfig::default(),
        }
    }

    pub fn timeout(&self) -> Duration {
        Duration::from_secs(self.timeout_secs)
    }
}

/// Top-level application configuration
#[derive(Debug, Clone, Default, Serialize, Deserialize)]
#[serde(default)]
pub struct AppConfig {
    pub aggregator: AggregatorConfig,
    pub cache: CacheConfig,
    pub exchanges: Vec<ExchangeConfig>,
}

impl AppConfig {
    pub fn validate(&self) -> CoreResult<()> {
        self.aggregator.validate()?;
        self.cache.validate()?;
        for exchange in &self.exchanges {
            if exchange.name.trim().is_empty() {
                return Err(CoreError::InvalidConfig("exchange name is empty".to_string()));
            }
            if exchange.base_url.trim().is_empty() {
                return Err(CoreError::InvalidConfig(format!(
                    "exchange {} has no base_url",
                    exchange.name
                )));
            }
        }
        Ok(())
    }
}
