//! Append-only record of integration runs.
//!
//! Every call to [`IntegrationService::run`](crate::service::IntegrationService::run)
//! writes exactly one [`FetchLog`], whatever the outcome. Logs are never
//! updated after they are written.

use async_trait::async_trait;
use chrono::{DateTime, Utc};
use serde::{Deserialize, Serialize};

use crate::error::RepositoryError;
use crate::models::{ErrorKind, ItemError, RunStatus};

/// Longest error message kept in a summary entry, in characters.
pub const MAX_ERROR_MESSAGE_CHARS: usize = 500;

#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct ErrorSummaryEntry {
    pub timestamp: DateTime<Utc>,
    pub kind: ErrorKind,
    pub subject: String,
    pub message: String,
}

impl From<&ItemError> for ErrorSummaryEntry {
    fn from(err: &ItemError) -> Self {
        Self {
            timestamp: err.occurred_at,
            kind: err.kind,
            subject: err.subject.clone(),
            message: truncate_chars(&err.message, MAX_ERROR_MESSAGE_CHARS),
        }
    }
}

fn truncate_chars(text: &str, max: usize) -> String {
    match text.char_indices().nth(max) {
        Some((cut, _)) => text[..cut].to_string(),
        None => text.to_string(),
    }
}

/// Keep the newest `limit` errors, oldest first.
pub fn summarize_errors(errors: &[ItemError], limit: usize) -> Vec<ErrorSummaryEntry> {
    let mut entries: Vec<ErrorSummaryEntry> = errors.iter().map(ErrorSummaryEntry::from).collect();
    entries.sort_by_key(|e| e.timestamp);
    let skip = entries.len().saturating_sub(limit);
    entries.split_off(skip)
}

/// A persisted run record.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct FetchLog {
    pub id: i64,
    pub source: String,
    pub status: RunStatus,
    pub records_attempted: i64,
    pub records_succeeded: i64,
    pub records_failed: i64,
    pub duration_seconds: f64,
    pub fetch_params: serde_json::Value,
    pub error_count: i64,
    pub error_summary: Vec<ErrorSummaryEntry>,
    pub created_at: DateTime<Utc>,
}

/// A run record before it has been written.
#[derive(Debug, Clone, PartialEq)]
pub struct NewFetchLog {
    pub source: String,
    pub status: RunStatus,
    pub records_attempted: i64,
    pub records_succeeded: i64,
    pub records_failed: i64,
    pub duration_seconds: f64,
    pub fetch_params: serde_json::Value,
    pub error_count: i64,
    pub error_summary: Vec<ErrorSummaryEntry>,
}

/// Record counts of a run.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Default)]
pub struct RecordCounts {
    pub attempted: usize,
    pub succeeded: usize,
    pub failed: usize,
}

impl NewFetchLog {
    /// Build a log entry, rejecting counts where
    /// `succeeded + failed > attempted`.
    pub fn new(
        source: impl Into<String>,
        status: RunStatus,
        counts: RecordCounts,
        duration_seconds: f64,
        fetch_params: serde_json::Value,
        errors: &[ItemError],
        summary_limit: usize,
    ) -> Result<Self, RepositoryError> {
        if counts.succeeded + counts.failed > counts.attempted {
            return Err(RepositoryError::Validation(format!(
                "succeeded ({}) + failed ({}) exceeds attempted ({})",
                counts.succeeded, counts.failed, counts.attempted
            )));
        }
        Ok(Self {
            source: source.into(),
            status,
            records_attempted: counts.attempted as i64,
            records_succeeded: counts.succeeded as i64,
            records_failed: counts.failed as i64,
            duration_seconds: duration_seconds.max(0.0),
            fetch_params,
            error_count: errors.len() as i64,
            error_summary: summarize_errors(errors, summary_limit),
        })
    }

    pub fn into_log(self, id: i64, created_at: DateTime<Utc>) -> FetchLog {
        FetchLog {
            id,
            source: self.source,
            status: self.status,
            records_attempted: self.records_attempted,
            records_succeeded: self.records_succeeded,
            records_failed: self.records_failed,
            duration_seconds: self.duration_seconds,
            fetch_params: self.fetch_params,
            error_count: self.error_count,
            error_summary: self.error_summary,
            created_at,
        }
    }
}

/// Whether a log's `fetch_params` were for the given parliament/session.
///
/// `None` matches only params where the field is absent or null.
pub fn params_match(params: &serde_json::Value, parliament: Option<i32>, session: Option<i32>) -> bool {
    fn field(params: &serde_json::Value, name: &str) -> Option<i64> {
        params.get(name).and_then(|v| v.as_i64())
    }
    field(params, "parliament") == parliament.map(i64::from)
        && field(params, "session") == session.map(i64::from)
}

/// Append-only persistence for [`FetchLog`]s.
#[async_trait]
pub trait FetchLogRepository: Send + Sync {
    /// Write one log in its own transaction.
    async fn record(&self, log: NewFetchLog) -> Result<FetchLog, RepositoryError>;

    /// Newest first.
    async fn recent(&self, limit: usize, source: Option<&str>) -> Result<Vec<FetchLog>, RepositoryError>;

    /// Logs created at or after `cutoff`, newest first.
    async fn since(
        &self,
        cutoff: DateTime<Utc>,
        source: Option<&str>,
    ) -> Result<Vec<FetchLog>, RepositoryError>;

    /// `fetch_params` of the newest `success` log for this parliament/session.
    async fn last_successful_params(
        &self,
        source: &str,
        parliament: Option<i32>,
        session: Option<i32>,
    ) -> Result<Option<serde_json::Value>, RepositoryError>;
}

#[cfg(test)]
mod tests {
    use super::*;
    use serde_json::json;

    fn errors(n: usize) -> Vec<ItemError> {
        (0..n)
            .map(|i| {
                let mut e = ItemError::for_subject(format!("bill {}", i), ErrorKind::Persistence, "boom");
                e.occurred_at = DateTime::from_timestamp(1_700_000_000 + i as i64, 0).unwrap();
                e
            })
            .collect()
    }

    #[test]
    fn test_summary_keeps_newest() {
        let summary = summarize_errors(&errors(15), 10);
        assert_eq!(summary.len(), 10);
        assert_eq!(summary[0].subject, "bill 5");
        assert_eq!(summary[9].subject, "bill 14");
    }

    #[test]
    fn test_long_messages_are_truncated() {
        let err = ItemError::for_subject("x", ErrorKind::Transient, "é".repeat(800));
        let entry = ErrorSummaryEntry::from(&err);
        assert_eq!(entry.message.chars().count(), MAX_ERROR_MESSAGE_CHARS);
    }

    #[test]
    fn test_counts_must_fit_attempted() {
        let counts = RecordCounts {
            attempted: 5,
            succeeded: 4,
            failed: 2,
        };
        let err = NewFetchLog::new("svc", RunStatus::Partial, counts, 1.0, json!({}), &[], 10);
        assert!(matches!(err, Err(RepositoryError::Validation(_))));

        let counts = RecordCounts {
            attempted: 5,
            succeeded: 3,
            failed: 2,
        };
        let log = NewFetchLog::new("svc", RunStatus::Partial, counts, 1.0, json!({}), &errors(12), 10).unwrap();
        assert_eq!(log.error_count, 12);
        assert_eq!(log.error_summary.len(), 10);
    }

    #[test]
    fn test_params_match() {
        let params = json!({"mode": "session", "parliament": 44, "session": 1});
        assert!(params_match(&params, Some(44), Some(1)));
        assert!(!params_match(&params, Some(44), Some(2)));
        assert!(!params_match(&params, None, None));

        let recent = json!({"mode": "recent", "parliament": null, "session": null});
        assert!(params_match(&recent, None, None));
    }
}
