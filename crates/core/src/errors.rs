//! Error types

use serde::Serialize;
use std::collections::BTreeMap;
use std::fmt;
use std::time::Duration;
use thiserror::Error;

/// Core error types
#[derive(Debug, Clone, PartialEq, Eq, Error)]
pub enum CoreError {
    #[error("Invalid price: {0}")]
    InvalidPrice(String),

    #[error("Invalid symbol: {0}")]
    InvalidSymbol(String),

    #[error("No quotes to aggregate for {0}")]
    EmptyQuoteSet(String),

    #[error("Invalid configuration: {0}")]
    InvalidConfig(String),
}

/// Classification of a single source call outcome
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, Serialize)]
pub enum SourceErrorKind {
    /// The caller gave up
    Cancelled,
    /// The per-call deadline fired
    Timeout,
    RateLimited,
    ServiceUnavailable,
    NetworkError,
    InvalidResponse,
    SymbolNotFound,
    Unknown,
}

impl SourceErrorKind {
    pub fn name(&self) -> &'static str {
        match self {
            SourceErrorKind::Cancelled => "cancelled",
            SourceErrorKind::Timeout => "timeout",
            SourceErrorKind::RateLimited => "rate_limited",
            SourceErrorKind::ServiceUnavailable => "service_unavailable",
            SourceErrorKind::NetworkError => "network_error",
            SourceErrorKind::InvalidResponse => "invalid_response",
            SourceErrorKind::SymbolNotFound => "symbol_not_found",
            SourceErrorKind::Unknown => "unknown",
        }
    }

    /// Expected outcomes that should not be logged loudly
    pub fn is_benign(&self) -> bool {
        matches!(self, SourceErrorKind::Cancelled | SourceErrorKind::SymbolNotFound)
    }
}

impl fmt::Display for SourceErrorKind {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.write_str(self.name())
    }
}

/// Errors returned by a price source adapter
#[derive(Debug, Clone, PartialEq, Eq, Error)]
pub enum SourceError {
    #[error("Request cancelled")]
    Cancelled,

    #[error("Rate limited (retry after {retry_after:?})")]
    RateLimited { retry_after: Option<Duration> },

    #[error("Service unavailable: {0}")]
    ServiceUnavailable(String),

    #[error("HTTP {status} from {endpoint}: {message}")]
    Http {
        status: u16,
        endpoint: String,
        message: String,
    },

    #[error("Network error: {0}")]
    Network(String),

    #[error("Invalid response: {0}")]
    InvalidResponse(String),

    #[error("Symbol not found: {0}")]
    SymbolNotFound(String),

    #[error("{0}")]
    Other(String),
}

impl SourceError {
    pub fn kind(&self) -> SourceErrorKind {
        match self {
            SourceError::Cancelled => SourceErrorKind::Cancelled,
            SourceError::RateLimited { .. } => SourceErrorKind::RateLimited,
            SourceError::ServiceUnavailable(_) => SourceErrorKind::ServiceUnavailable,
            SourceError::Http { status: 404, .. } => SourceErrorKind::SymbolNotFound,
            SourceError::Http { .. } => SourceErrorKind::Unknown,
            SourceError::Network(_) => SourceErrorKind::NetworkError,
            SourceError::InvalidResponse(_) => SourceErrorKind::InvalidResponse,
            SourceError::SymbolNotFound(_) => SourceErrorKind::SymbolNotFound,
            SourceError::Other(_) => SourceErrorKind::Unknown,
        }
    }
}

/// Which sources contributed to a result and why the others did not
#[derive(Debug, Clone, Default, PartialEq, Eq, Serialize)]
pub struct PartialResult {
    pub succeeded: Vec<String>,
    pub failed: BTreeMap<String, String>,
}

impl PartialResult {
    pub fn is_partial(&self) -> bool {
        !self.succeeded.is_empty() && !self.failed.is_empty()
    }
}

impl fmt::Display for PartialResult {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        write!(
            f,
            "{} succeeded [{}], {} failed",
            self.succeeded.len(),
            self.succeeded.join(", "),
            self.failed.len()
        )?;
        for (i, (name, reason)) in self.failed.iter().enumerate() {
            let sep = if i == 0 { ": " } else { "; " };
            write!(f, "{}{} ({})", sep, name, reason)?;
        }
        Ok(())
    }
}

/// Kind tag for `AggregatorError`
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize)]
pub enum AggregatorErrorKind {
    NoPriceData,
    ExchangeApi,
    Aggregation,
    PartialResult,
    RateLimited,
    InvalidSymbol,
    Cancelled,
    Closed,
    Configuration,
    Core,
}

/// Errors surfaced by the aggregator
#[derive(Debug, Clone, Error)]
pub enum AggregatorError {
    #[error("No price data for {symbol} from any source (attempted: {})", .attempted_sources.join(", "))]
    NoPriceData {
        symbol: String,
        attempted_sources: Vec<String>,
    },

    #[error("{source_name} API error: {message}")]
    ExchangeApi {
        source_name: String,
        message: String,
        endpoint: Option<String>,
        status: Option<u16>,
    },

    #[error("Aggregation failed: {message} ({success_count} succeeded, {} failed)", .source_errors.len())]
    Aggregation {
        message: String,
        source_errors: BTreeMap<String, String>,
        success_count: usize,
    },

    #[error("Partial result: {0}")]
    PartialResult(PartialResult),

    #[error("{source_name} rate limited (retry after {retry_after:?})")]
    RateLimited {
        source_name: String,
        retry_after: Option<Duration>,
    },

    #[error("Invalid symbol: {0}")]
    InvalidSymbol(String),

    #[error("Operation cancelled")]
    Cancelled,

    #[error("Aggregator is closed")]
    Closed,

    #[error("Configuration error: {0}")]
    Configuration(String),

    #[error(transparent)]
    Core(#[from] CoreError),
}

impl AggregatorError {
    pub fn kind(&self) -> AggregatorErrorKind {
        match self {
            AggregatorError::NoPriceData { .. } => AggregatorErrorKind::NoPriceData,
            AggregatorError::ExchangeApi { .. } => AggregatorErrorKind::ExchangeApi,
            AggregatorError::Aggregation { .. } => AggregatorErrorKind::Aggregation,
            AggregatorError::PartialResult(_) => AggregatorErrorKind::PartialResult,
            AggregatorError::RateLimited { .. } => AggregatorErrorKind::RateLimited,
            AggregatorError::InvalidSymbol(_) => AggregatorErrorKind::InvalidSymbol,
            AggregatorError::Cancelled => AggregatorErrorKind::Cancelled,
            AggregatorError::Closed => AggregatorErrorKind::Closed,
            AggregatorError::Configuration(_) => AggregatorErrorKind::Configuration,
            AggregatorError::Core(_) => AggregatorErrorKind::Core,
        }
    }

    /// Wrap a single source's failure
    pub fn from_source(source_name: impl Into<String>, err: SourceError) -> Self {
        let source_name = source_name.into();
        match err {
            SourceError::RateLimited { retry_after } => AggregatorError::RateLimited {
                source_name,
                retry_after,
            },
            SourceError::Cancelled => AggregatorError::Cancelled,
            SourceError::Http {
                status,
                endpoint,
                message,
            } => AggregatorError::ExchangeApi {
                source_name,
                message,
                endpoint: Some(endpoint),
                status: Some(status),
            },
            other => AggregatorError::ExchangeApi {
                source_name,
                message: other.to_string(),
                endpoint: None,
                status: None,
            },
        }
    }

    /// Number of failed sources carried by an aggregation error
    pub fn failure_count(&self) -> usize {
        match self {
            AggregatorError::Aggregation { source_errors, .. } => source_errors.len(),
            AggregatorError::PartialResult(partial) => partial.failed.len(),
            AggregatorError::NoPriceData {
                attempted_sources, ..
            } => attempted_sources.len(),
            _ => 0,
        }
    }

    /// True when the caller should map this to a not-found response
    pub fn is_not_found(&self) -> bool {
        matches!(self, AggregatorError::NoPriceData { .. })
    }
}

/// Result type alias
pub type CoreResult<T> = Result<T, CoreError>;
pub type SourceResult<T> = Result<T, SourceError>;
pub type AggregatorResult<T> = Result<T, AggregatorError>;
