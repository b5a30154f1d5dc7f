//! Idempotent schema setup.
//!
//! Safe to run on every start: tables and indexes use `IF NOT EXISTS`.

use anyhow::Result;
use sqlx::SqlitePool;

use crate::config::Config;
use crate::db;

pub async fn run_migrations(config: &Config) -> Result<()> {
    let pool = db::connect(config).await?;
    apply(&pool).await?;
    pool.close().await;
    Ok(())
}

/// Create the schema on an open pool.
pub async fn apply(pool: &SqlitePool) -> Result<()> {
    sqlx::query(
        r#"
        CREATE TABLE IF NOT EXISTS bills (
            id INTEGER PRIMARY KEY AUTOINCREMENT,
            jurisdiction TEXT NOT NULL,
            parliament INTEGER NOT NULL CHECK (parliament > 0),
            session INTEGER NOT NULL CHECK (session > 0),
            number TEXT NOT NULL,
            title_en TEXT NOT NULL,
            title_fr TEXT,
            short_title_en TEXT,
            short_title_fr TEXT,
            law_status TEXT,
            introduced_date TEXT,
            sponsor_politician_id INTEGER,
            sponsor_politician_name TEXT,
            legisinfo_id INTEGER,
            legisinfo_status TEXT,
            legisinfo_summary_en TEXT,
            legisinfo_summary_fr TEXT,
            royal_assent_date TEXT,
            royal_assent_chapter TEXT,
            related_bill_numbers TEXT,
            subject_tags TEXT,
            committee_studies TEXT,
            source_openparliament INTEGER NOT NULL DEFAULT 0,
            source_legisinfo INTEGER NOT NULL DEFAULT 0,
            last_fetched_at INTEGER NOT NULL,
            last_enriched_at INTEGER,
            content_hash TEXT NOT NULL,
            created_at INTEGER NOT NULL,
            updated_at INTEGER NOT NULL,
            CONSTRAINT uq_bill_natural_key UNIQUE (jurisdiction, parliament, session, number)
        )
        "#,
    )
    .execute(pool)
    .await?;

    sqlx::query(
        r#"
        CREATE TABLE IF NOT EXISTS fetch_logs (
            id INTEGER PRIMARY KEY AUTOINCREMENT,
            source TEXT NOT NULL,
            status TEXT NOT NULL CHECK (status IN ('success', 'partial', 'failure')),
            records_attempted INTEGER NOT NULL DEFAULT 0,
            records_succeeded INTEGER NOT NULL DEFAULT 0,
            records_failed INTEGER NOT NULL DEFAULT 0,
            duration_seconds REAL NOT NULL DEFAULT 0,
            fetch_params TEXT NOT NULL DEFAULT '{}',
            error_count INTEGER NOT NULL DEFAULT 0,
            error_summary TEXT NOT NULL DEFAULT '[]',
            created_at INTEGER NOT NULL,
            CHECK (records_succeeded + records_failed <= records_attempted)
        )
        "#,
    )
    .execute(pool)
    .await?;

    sqlx::query(
        "CREATE INDEX IF NOT EXISTS idx_bills_session_introduced \
         ON bills(parliament, session, introduced_date DESC)",
    )
    .execute(pool)
    .await?;
    sqlx::query("CREATE INDEX IF NOT EXISTS idx_bills_last_fetched ON bills(last_fetched_at)")
        .execute(pool)
        .await?;
    sqlx::query(
        "CREATE INDEX IF NOT EXISTS idx_fetch_logs_source_status_created \
         ON fetch_logs(source, status, created_at DESC)",
    )
    .execute(pool)
    .await?;

    Ok(())
}
