//! Incremental fetch window for `recent` runs.

use chrono::{Days, NaiveDate};

/// Lower bound on `introduced_date` for the next run.
///
/// An explicit date wins. Otherwise the newest introduced date seen by the
/// last successful run for the same parliament/session is reused, falling
/// back to `today - window_days`. The result is never before `floor`; a
/// window reaching past the representable calendar also yields `floor`.
pub fn derive_introduced_after(
    explicit: Option<NaiveDate>,
    last_successful_params: Option<&serde_json::Value>,
    today: NaiveDate,
    window_days: i64,
    floor: NaiveDate,
) -> NaiveDate {
    let candidate = explicit
        .or_else(|| last_successful_params.and_then(max_introduced_date))
        .or_else(|| today.checked_sub_days(Days::new(window_days.max(1).unsigned_abs())));
    candidate.map_or(floor, |date| date.max(floor))
}

/// `result_summary.max_introduced_date` of a fetch log's params.
pub fn max_introduced_date(params: &serde_json::Value) -> Option<NaiveDate> {
    params
        .pointer("/result_summary/max_introduced_date")?
        .as_str()
        .and_then(|raw| NaiveDate::parse_from_str(raw, "%Y-%m-%d").ok())
}
