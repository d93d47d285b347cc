//! Per-source call execution and outcome classification

use std::fmt;
use std::future::Future;
use std::time::{Duration, Instant};
use tokio_util::sync::CancellationToken;
use tracing::{debug, warn};

use liquidity_core::{AggregatorError, AggregatorResult, SourceError, SourceErrorKind};

/// Why a source call did not produce data
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct CallFailure {
    pub kind: SourceErrorKind,
    pub message: String,
    pub cause: Option<SourceError>,
}

impl CallFailure {
    pub fn new(kind: SourceErrorKind, message: impl Into<String>) -> Self {
        Self {
            kind,
            message: message.into(),
            cause: None,
        }
    }

    fn cancelled() -> Self {
        Self::new(SourceErrorKind::Cancelled, "cancelled by caller")
    }

    fn timed_out(after: Duration) -> Self {
        Self::new(
            SourceErrorKind::Timeout,
            format!("timed out after {}ms", after.as_millis()),
        )
    }
}

impl fmt::Display for CallFailure {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        write!(f, "{}: {}", self.kind, self.message)
    }
}

/// Outcome of one (source, operation) invocation
#[derive(Debug, Clone)]
pub struct ExchangeCallResult<T> {
    pub source_name: String,
    pub outcome: Result<T, CallFailure>,
    pub duration: Duration,
}

impl<T> ExchangeCallResult<T> {
    pub fn failed(source_name: impl Into<String>, failure: CallFailure) -> Self {
        Self {
            source_name: source_name.into(),
            outcome: Err(failure),
            duration: Duration::ZERO,
        }
    }

    pub fn is_success(&self) -> bool {
        self.outcome.is_ok()
    }

    pub fn data(&self) -> Option<&T> {
        self.outcome.as_ref().ok()
    }

    pub fn error_kind(&self) -> Option<SourceErrorKind> {
        self.outcome.as_ref().err().map(|f| f.kind)
    }

    pub fn error_message(&self) -> Option<&str> {
        self.outcome.as_ref().err().map(|f| f.message.as_str())
    }

    pub fn map<U>(self, f: impl FnOnce(T) -> U) -> ExchangeCallResult<U> {
        ExchangeCallResult {
            source_name: self.source_name,
            outcome: self.outcome.map(f),
            duration: self.duration,
        }
    }

    /// Surface a failure as an aggregator error for this source
    pub fn into_result(self) -> AggregatorResult<T> {
        match self.outcome {
            Ok(data) => Ok(data),
            Err(CallFailure {
                kind: SourceErrorKind::Cancelled,
                ..
            }) => Err(AggregatorError::Cancelled),
            Err(CallFailure {
                cause: Some(cause),
                kind,
                ..
            }) if kind != SourceErrorKind::Timeout => {
                Err(AggregatorError::from_source(self.source_name, cause))
            }
            Err(failure) => Err(AggregatorError::ExchangeApi {
                source_name: self.source_name,
                message: failure.to_string(),
                endpoint: None,
                status: None,
            }),
        }
    }
}

/// Run `op` against one source with a deadline layered under the caller's token.
///
/// `op` receives a child token that fires on caller cancellation or when the
/// deadline passes. The outcome is `Cancelled` when the caller gave up and
/// `Timeout` when only the deadline fired.
pub async fn execute_call<T, F, Fut>(
    source_name: &str,
    context: &str,
    timeout: Duration,
    caller: &CancellationToken,
    op: F,
) -> ExchangeCallResult<T>
where
    F: FnOnce(CancellationToken) -> Fut,
    Fut: Future<Output = Result<T, SourceError>>,
{
    let started = Instant::now();
    let call_token = caller.child_token();

    let outcome = tokio::select! {
        biased;
        _ = caller.cancelled() => Err(CallFailure::cancelled()),
        _ = tokio::time::sleep(timeout) => {
            call_token.cancel();
            Err(CallFailure::timed_out(timeout))
        }
        result = op(call_token.clone()) => result.map_err(|err| classify(err, caller, &call_token, timeout)),
    };

    let duration = started.elapsed();
    if let Err(failure) = &outcome {
        log_failure(source_name, context, failure, duration);
    }

    ExchangeCallResult {
        source_name: source_name.to_string(),
        outcome,
        duration,
    }
}

fn classify(
    err: SourceError,
    caller: &CancellationToken,
    call_token: &CancellationToken,
    timeout: Duration,
) -> CallFailure {
    let (kind, message) = if caller.is_cancelled() {
        (SourceErrorKind::Cancelled, "cancelled by caller".to_string())
    } else if call_token.is_cancelled() {
        (
            SourceErrorKind::Timeout,
            format!("timed out after {}ms", timeout.as_millis()),
        )
    } else {
        (err.kind(), err.to_string())
    };

    CallFailure {
        kind,
        message,
        cause: Some(err),
    }
}

fn log_failure(source_name: &str, context: &str, failure: &CallFailure, duration: Duration) {
    let duration_ms = duration.as_millis() as u64;
    if failure.kind.is_benign() {
        debug!(
            source = source_name,
            context,
            kind = %failure.kind,
            duration_ms,
            "Source call failed: {}",
            failure.message
        );
    } else {
        warn!(
            source = source_name,
            context,
            kind = %failure.kind,
            duration_ms,
            "Source call failed: {}",
            failure.message
        );
    }
}
