//! Aggregate health of recent integration runs.

use chrono::NaiveDate;
use serde::Serialize;

use crate::fetch_log::FetchLog;
use crate::models::RunStatus;
use crate::window::max_introduced_date;

#[derive(Debug, Clone, Default, PartialEq, Serialize)]
pub struct MonitorStats {
    pub total_operations: usize,
    pub successful: usize,
    pub partial: usize,
    pub failed: usize,
    pub avg_duration_seconds: f64,
    /// Share of `success` runs, 0.0 to 1.0.
    pub success_rate: f64,
    pub records_persisted: i64,
    pub duplicates_skipped: i64,
    pub filtered_out: i64,
    /// HTTP retries across source and enrichment requests.
    pub http_retries: i64,
    pub latest_introduced: Option<NaiveDate>,
}

fn summary_count(log: &FetchLog, field: &str) -> i64 {
    log.fetch_params
        .get("result_summary")
        .and_then(|s| s.get(field))
        .and_then(|v| v.as_i64())
        .unwrap_or(0)
}

pub fn summarize(logs: &[FetchLog]) -> MonitorStats {
    let mut stats = MonitorStats {
        total_operations: logs.len(),
        ..Default::default()
    };
    if logs.is_empty() {
        return stats;
    }

    let mut total_duration = 0.0;
    for log in logs {
        match log.status {
            RunStatus::Success => stats.successful += 1,
            RunStatus::Partial => stats.partial += 1,
            RunStatus::Failure => stats.failed += 1,
        }
        total_duration += log.duration_seconds;
        stats.records_persisted += log.records_succeeded;
        stats.duplicates_skipped += summary_count(log, "duplicates_skipped");
        stats.filtered_out += summary_count(log, "filtered_out");
        stats.http_retries += summary_count(log, "http_retries");
        if let Some(date) = max_introduced_date(&log.fetch_params) {
            stats.latest_introduced = stats.latest_introduced.max(Some(date));
        }
    }

    stats.avg_duration_seconds = total_duration / logs.len() as f64;
    stats.success_rate = stats.successful as f64 / logs.len() as f64;
    stats
}

#[cfg(test)]
mod tests {
    use super::*;
    use chrono::Utc;
    use serde_json::json;

    fn log(status: RunStatus, succeeded: i64, duration: f64, params: serde_json::Value) -> FetchLog {
        FetchLog {
            id: 1,
            source: "svc".into(),
            status,
            records_attempted: succeeded + 1,
            records_succeeded: succeeded,
            records_failed: 1,
            duration_seconds: duration,
            fetch_params: params,
            error_count: 1,
            error_summary: vec![],
            created_at: Utc::now(),
        }
    }

    #[test]
    fn test_empty_window() {
        let stats = summarize(&[]);
        assert_eq!(stats.total_operations, 0);
        assert_eq!(stats.success_rate, 0.0);
    }

    #[test]
    fn test_aggregates() {
        let logs = vec![
            log(
                RunStatus::Success,
                10,
                2.0,
                json!({"result_summary": {"duplicates_skipped": 2, "filtered_out": 1, "max_introduced_date": "2024-02-01"}}),
            ),
            log(
                RunStatus::Partial,
                8,
                4.0,
                json!({"result_summary": {"duplicates_skipped": 1, "http_retries": 4, "max_introduced_date": "2024-03-05"}}),
            ),
            log(RunStatus::Failure, 0, 0.0, json!({})),
            log(RunStatus::Success, 1, 2.0, json!({})),
        ];
        let stats = summarize(&logs);
        assert_eq!(stats.total_operations, 4);
        assert_eq!((stats.successful, stats.partial, stats.failed), (2, 1, 1));
        assert_eq!(stats.avg_duration_seconds, 2.0);
        assert_eq!(stats.success_rate, 0.5);
        assert_eq!(stats.records_persisted, 19);
        assert_eq!(stats.duplicates_skipped, 3);
        assert_eq!(stats.filtered_out, 1);
        assert_eq!(stats.http_retries, 4);
        assert_eq!(stats.latest_introduced, NaiveDate::from_ymd_opt(2024, 3, 5));
    }
}
