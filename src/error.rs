//! Typed errors for the boundaries where callers branch on the failure kind.
//!
//! Everything else uses `anyhow::Result`.

use thiserror::Error;

use crate::models::ErrorKind;

/// Failure talking to an external source (adapter or scraper).
#[derive(Debug, Error)]
pub enum SourceError {
    /// Timeout, connection failure, 408/425/429 or 5xx. Eligible for retry.
    #[error("transient error from {url}: {message}")]
    Transient { url: String, message: String },

    /// 4xx other than rate limiting. Never retried.
    #[error("{url} returned {status}")]
    Permanent { url: String, status: u16 },

    /// The response arrived but could not be decoded.
    #[error("malformed payload from {url}: {message}")]
    Malformed { url: String, message: String },

    /// Too many consecutive failures against this host; the request was
    /// not sent.
    #[error("circuit open for {host}, retry in {retry_in_secs}s ({url})")]
    CircuitOpen {
        host: String,
        url: String,
        retry_in_secs: u64,
    },
}

impl SourceError {
    pub fn is_transient(&self) -> bool {
        matches!(self, SourceError::Transient { .. })
    }

    pub fn kind(&self) -> ErrorKind {
        match self {
            SourceError::Transient { .. } | SourceError::CircuitOpen { .. } => ErrorKind::Transient,
            SourceError::Permanent { .. } => ErrorKind::Permanent,
            SourceError::Malformed { .. } => ErrorKind::Malformed,
        }
    }

    pub(crate) fn from_reqwest(url: &str, err: reqwest::Error) -> Self {
        if err.is_timeout() {
            return SourceError::Transient {
                url: url.to_string(),
                message: err.to_string(),
            };
        }
        if err.is_decode() {
            return SourceError::Malformed {
                url: url.to_string(),
                message: err.to_string(),
            };
        }
        if let Some(status) = err.status() {
            if is_retryable_status(status.as_u16()) {
                return SourceError::Transient {
                    url: url.to_string(),
                    message: format!("status {}", status),
                };
            }
            return SourceError::Permanent {
                url: url.to_string(),
                status: status.as_u16(),
            };
        }
        // Timeouts, connect and body errors are all worth another attempt.
        SourceError::Transient {
            url: url.to_string(),
            message: err.to_string(),
        }
    }
}

/// Statuses treated as transient.
pub fn is_retryable_status(status: u16) -> bool {
    matches!(status, 408 | 425 | 429) || (500..600).contains(&status)
}

/// Failure at the persistence boundary.
#[derive(Debug, Error)]
pub enum RepositoryError {
    /// The domain object is invalid; nothing was written.
    #[error("validation failed: {0}")]
    Validation(String),

    /// The store cannot be reached at all. Aborts the run.
    #[error("store unavailable: {0}")]
    Unavailable(String),

    /// A single write failed (constraint, encoding, ...).
    #[error("database error: {0}")]
    Database(String),
}

impl RepositoryError {
    pub fn kind(&self) -> ErrorKind {
        match self {
            RepositoryError::Validation(_) => ErrorKind::Validation,
            RepositoryError::Unavailable(_) => ErrorKind::Fatal,
            RepositoryError::Database(_) => ErrorKind::Persistence,
        }
    }
}

impl From<sqlx::Error> for RepositoryError {
    fn from(err: sqlx::Error) -> Self {
        match err {
            sqlx::Error::PoolClosed
            | sqlx::Error::PoolTimedOut
            | sqlx::Error::Io(_)
            | sqlx::Error::Tls(_)
            | sqlx::Error::Configuration(_) => RepositoryError::Unavailable(err.to_string()),
            other => RepositoryError::Database(other.to_string()),
        }
    }
}

impl From<serde_json::Error> for RepositoryError {
    fn from(err: serde_json::Error) -> Self {
        RepositoryError::Database(format!("json column: {}", err))
    }
}

/// The only errors the integration service propagates to its caller.
#[derive(Debug, Error)]
pub enum IntegrationError {
    /// The run was aborted; a `failure` fetch log was still written when
    /// `fetch_log_id` is set.
    #[error("run aborted: {message}")]
    Fatal {
        message: String,
        fetch_log_id: Option<i64>,
    },

    /// Even the fetch log could not be written.
    #[error("failed to write fetch log: {0}")]
    LogWrite(#[source] RepositoryError),
}
