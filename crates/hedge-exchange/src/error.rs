//! Exchange error taxonomy.
//!
//! The variants map one-to-one onto the recovery policies the strategy core
//! applies: `Rejected` degrades a single grid level, `Transient` is retried
//! locally, `Timeout` forces a reconcile-before-retry, `StreamDisconnect`
//! triggers resync.

use thiserror::Error;

/// Errors surfaced by an [`crate::ExchangeSession`].
#[derive(Debug, Error)]
pub enum ExchangeError {
    /// The exchange refused the request (bad price, filter violation,
    /// insufficient margin). Not retryable.
    #[error("exchange rejected request (code {code}): {message}")]
    Rejected { code: i64, message: String },

    /// Network failure, rate limit, or 5xx. Retryable with backoff.
    #[error("transient exchange error: {0}")]
    Transient(String),

    /// The call did not complete within its deadline; the order status is
    /// unknown until reconciled against an open-orders snapshot.
    #[error("exchange call timed out: {0}")]
    Timeout(String),

    /// A WebSocket stream dropped; the reader reconnects on its own and
    /// emits `Resync` once re-established.
    #[error("stream disconnected: {0}")]
    StreamDisconnect(String),

    /// Authentication or signature failure. Not retryable.
    #[error("authentication failed: {0}")]
    Auth(String),

    /// The exchange response could not be decoded.
    #[error("malformed exchange response: {0}")]
    Parse(String),
}

impl ExchangeError {
    /// Whether a local retry with backoff is appropriate.
    pub fn is_transient(&self) -> bool {
        matches!(self, ExchangeError::Transient(_))
    }

    /// Whether the true order state must be reconciled before acting.
    pub fn needs_reconcile(&self) -> bool {
        matches!(self, ExchangeError::Timeout(_))
    }
}

impl From<reqwest::Error> for ExchangeError {
    fn from(e: reqwest::Error) -> Self {
        if e.is_timeout() {
            ExchangeError::Timeout(e.to_string())
        } else if e.is_decode() {
            ExchangeError::Parse(e.to_string())
        } else {
            ExchangeError::Transient(e.to_string())
        }
    }
}
