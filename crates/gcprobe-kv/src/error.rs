//! KV collaborator error types.

use thiserror::Error;

use crate::backoff::BackoffKind;

/// Result type for collaborator calls.
pub type Result<T> = std::result::Result<T, KvError>;

/// Errors surfaced by the KV client, the timestamp oracle and the status-port
/// endpoints.
#[derive(Debug, Error)]
pub enum KvError {
    /// Routing error reported by a region; retriable after a region-miss backoff.
    #[error("region error: {0}")]
    Region(String),

    /// A region could not serve the request at all.
    #[error("region is unavailable: {0}")]
    RegionUnavailable(String),

    /// A scan hit a lock it could not step over.
    #[error("unexpected scanlock error: error:<locked {0}>")]
    LockedDuringScan(String),

    /// The timestamp oracle did not answer (timeout, restart, closed stream).
    #[error("timestamp oracle unavailable: {0}")]
    OracleUnavailable(String),

    /// The caller's operation was cancelled.
    #[error("operation cancelled")]
    Cancelled,

    /// Generic RPC failure.
    #[error("rpc failed: {0}")]
    Rpc(String),

    /// HTTP transport failure.
    #[error("http request to {url} failed: {source}")]
    Http {
        url: String,
        #[source]
        source: reqwest::Error,
    },

    /// Non-success HTTP status; `message` is the response body.
    #[error("{url} returned status {status}: {message}")]
    HttpStatus {
        url: String,
        status: u16,
        message: String,
    },

    /// Malformed response body.
    #[error("failed to decode response from {url}: {source}")]
    Decode {
        url: String,
        #[source]
        source: serde_json::Error,
    },

    /// A response arrived without a body.
    #[error("response body missing")]
    MissingBody,

    /// Scan-lock returned an error other than a region error.
    #[error("unexpected scanlock error: {0}")]
    ScanLock(String),

    /// A backoffer ran out of sleep budget.
    #[error("backoff budget of {budget_ms}ms exhausted on {kind}: {last}")]
    BackoffExhausted {
        kind: BackoffKind,
        budget_ms: u64,
        last: String,
    },
}

impl KvError {
    /// Oracle failures the timestamp source waits out.
    pub fn is_oracle_transient(&self) -> bool {
        matches!(self, KvError::OracleUnavailable(_) | KvError::Cancelled)
    }

    /// GC-trigger failures worth another attempt: region unavailability and
    /// locks still present during the trigger's own scan. Remote endpoints
    /// report these as text, so their messages are matched as well.
    pub fn is_transient_gc(&self) -> bool {
        match self {
            KvError::RegionUnavailable(_) | KvError::LockedDuringScan(_) => true,
            KvError::HttpStatus { message, .. } => {
                message.contains("region unavailable")
                    || message.contains("Region is unavailable")
                    || message.contains("unexpected scanlock error: error:<locked")
            }
            _ => false,
        }
    }
}
