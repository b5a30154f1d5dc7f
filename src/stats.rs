//! Run history commands: `billsync logs` and `billsync monitor`.

use anyhow::Result;
use chrono::{Duration, Utc};

use crate::config::Config;
use crate::db;
use crate::fetch_log::{FetchLog, FetchLogRepository};
use crate::monitor;
use crate::store::SqliteStore;

/// Print the newest fetch logs.
pub async fn run_logs(config: &Config, limit: usize, source: Option<&str>) -> Result<()> {
    let pool = db::connect(config).await?;
    let store = SqliteStore::new(pool.clone());
    let logs = store.recent(limit, source).await;
    pool.close().await;
    let logs = logs?;

    if logs.is_empty() {
        println!("No fetch logs recorded.");
        return Ok(());
    }

    println!(
        "  {:<6} {:<20} {:<8} {:>9} {:>9} {:>7} {:>7} {:>9}",
        "ID", "CREATED", "STATUS", "ATTEMPTED", "SUCCEEDED", "FAILED", "ERRORS", "DURATION"
    );
    println!("  {}", "-".repeat(84));
    for log in &logs {
        print_log_row(log);
    }

    if let Some(last_error) = logs
        .iter()
        .find_map(|log| log.error_summary.last().map(|e| (log.id, e)))
    {
        let (id, entry) = last_error;
        println!();
        println!(
            "Latest error (log #{}): [{}] {}: {}",
            id,
            entry.kind.as_str(),
            entry.subject,
            entry.message
        );
    }
    Ok(())
}

fn print_log_row(log: &FetchLog) {
    println!(
        "  {:<6} {:<20} {:<8} {:>9} {:>9} {:>7} {:>7} {:>8.2}s",
        log.id,
        log.created_at.format("%Y-%m-%d %H:%M:%S"),
        log.status.as_str(),
        log.records_attempted,
        log.records_succeeded,
        log.records_failed,
        log.error_count,
        log.duration_seconds
    );
}

/// Print aggregate health for the last `hours` hours.
pub async fn run_monitor(config: &Config, hours: i64) -> Result<()> {
    let pool = db::connect(config).await?;
    let store = SqliteStore::new(pool.clone());
    let cutoff = Utc::now() - Duration::hours(hours.max(1));
    let logs = store
        .since(cutoff, Some(&config.integration.source_name))
        .await;
    pool.close().await;
    let stats = monitor::summarize(&logs?);

    println!("Bill ingestion, last {} hours", hours);
    println!("================================");
    println!();
    println!("  Runs:          {}", stats.total_operations);
    println!("  Successful:    {}", stats.successful);
    println!("  Partial:       {}", stats.partial);
    println!("  Failed:        {}", stats.failed);
    println!("  Success rate:  {:.1}%", stats.success_rate * 100.0);
    println!("  Avg duration:  {:.2}s", stats.avg_duration_seconds);
    println!();
    println!("  Persisted:     {}", stats.records_persisted);
    println!("  Duplicates:    {}", stats.duplicates_skipped);
    println!("  Filtered out:  {}", stats.filtered_out);
    println!("  HTTP retries:  {}", stats.http_retries);
    match stats.latest_introduced {
        Some(date) => println!("  Latest bill:   {}", date),
        None => println!("  Latest bill:   -"),
    }
    Ok(())
}
