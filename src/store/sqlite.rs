//! SQLite-backed [`BillRepository`] and [`FetchLogRepository`].
//!
//! Every bill upsert runs in its own transaction: the current content hash
//! is read, then a single `INSERT .. ON CONFLICT .. DO UPDATE` writes the
//! row. `updated_at` only moves when the hash changed.

use async_trait::async_trait;
use chrono::{DateTime, Utc};
use sqlx::sqlite::SqliteRow;
use sqlx::{Row, SqlitePool};

use super::{
    ts_to_datetime, validate, BillRecord, BillRepository, StoredBill, UpsertOutcome, UpsertStatus,
};
use crate::error::RepositoryError;
use crate::fetch_log::{params_match, ErrorSummaryEntry, FetchLog, FetchLogRepository, NewFetchLog};
use crate::models::{Bill, NaturalKey, RunStatus};

const BILL_COLUMNS: &str = "id, jurisdiction, parliament, session, number, title_en, title_fr, \
    short_title_en, short_title_fr, law_status, introduced_date, sponsor_politician_id, \
    sponsor_politician_name, legisinfo_id, legisinfo_status, legisinfo_summary_en, \
    legisinfo_summary_fr, royal_assent_date, royal_assent_chapter, related_bill_numbers, \
    subject_tags, committee_studies, source_openparliament, source_legisinfo, last_fetched_at, \
    last_enriched_at, content_hash, created_at, updated_at";

const LOG_COLUMNS: &str = "id, source, status, records_attempted, records_succeeded, \
    records_failed, duration_seconds, fetch_params, error_count, error_summary, created_at";

/// SQLite implementation of both repositories over one pool.
pub struct SqliteStore {
    pool: SqlitePool,
}

impl SqliteStore {
    pub fn new(pool: SqlitePool) -> Self {
        Self { pool }
    }

    pub fn pool(&self) -> &SqlitePool {
        &self.pool
    }
}

fn row_to_stored(row: &SqliteRow) -> Result<StoredBill, RepositoryError> {
    let record = BillRecord {
        jurisdiction: row.try_get("jurisdiction")?,
        parliament: row.try_get("parliament")?,
        session: row.try_get("session")?,
        number: row.try_get("number")?,
        title_en: row.try_get("title_en")?,
        title_fr: row.try_get("title_fr")?,
        short_title_en: row.try_get("short_title_en")?,
        short_title_fr: row.try_get("short_title_fr")?,
        law_status: row.try_get("law_status")?,
        introduced_date: row.try_get("introduced_date")?,
        sponsor_politician_id: row.try_get("sponsor_politician_id")?,
        sponsor_politician_name: row.try_get("sponsor_politician_name")?,
        legisinfo_id: row.try_get("legisinfo_id")?,
        legisinfo_status: row.try_get("legisinfo_status")?,
        legisinfo_summary_en: row.try_get("legisinfo_summary_en")?,
        legisinfo_summary_fr: row.try_get("legisinfo_summary_fr")?,
        royal_assent_date: row.try_get("royal_assent_date")?,
        royal_assent_chapter: row.try_get("royal_assent_chapter")?,
        related_bill_numbers: row.try_get("related_bill_numbers")?,
        subject_tags: row.try_get("subject_tags")?,
        committee_studies: row.try_get("committee_studies")?,
        source_openparliament: row.try_get("source_openparliament")?,
        source_legisinfo: row.try_get("source_legisinfo")?,
        last_fetched_at: row.try_get("last_fetched_at")?,
        last_enriched_at: row.try_get("last_enriched_at")?,
        content_hash: row.try_get("content_hash")?,
    };
    Ok(StoredBill {
        id: row.try_get("id")?,
        created_at: ts_to_datetime(row.try_get("created_at")?)?,
        updated_at: ts_to_datetime(row.try_get("updated_at")?)?,
        bill: record.into_domain()?,
    })
}

fn row_to_log(row: &SqliteRow) -> Result<FetchLog, RepositoryError> {
    let status: String = row.try_get("status")?;
    let params: String = row.try_get("fetch_params")?;
    let summary: String = row.try_get("error_summary")?;
    let error_summary: Vec<ErrorSummaryEntry> = serde_json::from_str(&summary)?;
    Ok(FetchLog {
        id: row.try_get("id")?,
        source: row.try_get("source")?,
        status: RunStatus::parse(&status)
            .ok_or_else(|| RepositoryError::Database(format!("unknown status '{}'", status)))?,
        records_attempted: row.try_get("records_attempted")?,
        records_succeeded: row.try_get("records_succeeded")?,
        records_failed: row.try_get("records_failed")?,
        duration_seconds: row.try_get("duration_seconds")?,
        fetch_params: serde_json::from_str(&params)?,
        error_count: row.try_get("error_count")?,
        error_summary,
        created_at: ts_to_datetime(row.try_get("created_at")?)?,
    })
}

#[async_trait]
impl BillRepository for SqliteStore {
    async fn get_by_natural_key(&self, key: &NaturalKey) -> Result<Option<StoredBill>, RepositoryError> {
        let sql = format!(
            "SELECT {} FROM bills WHERE jurisdiction = ? AND parliament = ? AND session = ? AND number = ?",
            BILL_COLUMNS
        );
        let row = sqlx::query(&sql)
            .bind(&key.jurisdiction)
            .bind(key.parliament)
            .bind(key.session)
            .bind(&key.number)
            .fetch_optional(&self.pool)
            .await?;
        row.as_ref().map(row_to_stored).transpose()
    }

    async fn upsert(&self, bill: &Bill) -> Result<UpsertOutcome, RepositoryError> {
        validate(bill)?;
        let now = Utc::now().timestamp();

        let mut tx = self.pool.begin().await?;

        let sql = format!(
            "SELECT {} FROM bills WHERE jurisdiction = ? AND parliament = ? AND session = ? AND number = ?",
            BILL_COLUMNS
        );
        let existing = sqlx::query(&sql)
            .bind(&bill.jurisdiction)
            .bind(bill.parliament)
            .bind(bill.session)
            .bind(&bill.number)
            .fetch_optional(&mut *tx)
            .await?
            .as_ref()
            .map(row_to_stored)
            .transpose()?;

        let mut incoming = bill.clone();
        if let Some(stored) = &existing {
            incoming.retain_enrichment_from(&stored.bill);
        }
        let r = BillRecord::from_domain(&incoming)?;

        let status = match &existing {
            None => UpsertStatus::Created,
            Some(stored) if stored.bill.content_hash() == r.content_hash => UpsertStatus::Unchanged,
            Some(_) => UpsertStatus::Updated,
        };

        let id: i64 = sqlx::query_scalar(
            r#"
            INSERT INTO bills (jurisdiction, parliament, session, number, title_en, title_fr,
                               short_title_en, short_title_fr, law_status, introduced_date,
                               sponsor_politician_id, sponsor_politician_name, legisinfo_id,
                               legisinfo_status, legisinfo_summary_en, legisinfo_summary_fr,
                               royal_assent_date, royal_assent_chapter, related_bill_numbers,
                               subject_tags, committee_studies, source_openparliament,
                               source_legisinfo, last_fetched_at, last_enriched_at, content_hash,
                               created_at, updated_at)
            VALUES (?, ?, ?, ?, ?, ?, ?, ?, ?, ?, ?, ?, ?, ?, ?, ?, ?, ?, ?, ?, ?, ?, ?, ?, ?, ?, ?, ?)
            ON CONFLICT(jurisdiction, parliament, session, number) DO UPDATE SET
                title_en = excluded.title_en,
                title_fr = excluded.title_fr,
                short_title_en = excluded.short_title_en,
                short_title_fr = excluded.short_title_fr,
                law_status = excluded.law_status,
                introduced_date = excluded.introduced_date,
                sponsor_politician_id = excluded.sponsor_politician_id,
                sponsor_politician_name = excluded.sponsor_politician_name,
                legisinfo_id = excluded.legisinfo_id,
                legisinfo_status = excluded.legisinfo_status,
                legisinfo_summary_en = excluded.legisinfo_summary_en,
                legisinfo_summary_fr = excluded.legisinfo_summary_fr,
                royal_assent_date = excluded.royal_assent_date,
                royal_assent_chapter = excluded.royal_assent_chapter,
                related_bill_numbers = excluded.related_bill_numbers,
                subject_tags = excluded.subject_tags,
                committee_studies = excluded.committee_studies,
                source_openparliament = excluded.source_openparliament,
                source_legisinfo = excluded.source_legisinfo,
                last_fetched_at = excluded.last_fetched_at,
                last_enriched_at = excluded.last_enriched_at,
                updated_at = CASE WHEN bills.content_hash = excluded.content_hash
                                  THEN bills.updated_at ELSE excluded.updated_at END,
                content_hash = excluded.content_hash
            RETURNING id
            "#,
        )
        .bind(&r.jurisdiction)
        .bind(r.parliament)
        .bind(r.session)
        .bind(&r.number)
        .bind(&r.title_en)
        .bind(&r.title_fr)
        .bind(&r.short_title_en)
        .bind(&r.short_title_fr)
        .bind(&r.law_status)
        .bind(&r.introduced_date)
        .bind(r.sponsor_politician_id)
        .bind(&r.sponsor_politician_name)
        .bind(r.legisinfo_id)
        .bind(&r.legisinfo_status)
        .bind(&r.legisinfo_summary_en)
        .bind(&r.legisinfo_summary_fr)
        .bind(&r.royal_assent_date)
        .bind(&r.royal_assent_chapter)
        .bind(&r.related_bill_numbers)
        .bind(&r.subject_tags)
        .bind(&r.committee_studies)
        .bind(r.source_openparliament)
        .bind(r.source_legisinfo)
        .bind(r.last_fetched_at)
        .bind(r.last_enriched_at)
        .bind(&r.content_hash)
        .bind(now)
        .bind(now)
        .fetch_one(&mut *tx)
        .await?;

        tx.commit().await?;
        Ok(UpsertOutcome { id, status })
    }

    async fn list_by_session(
        &self,
        parliament: i32,
        session: Option<i32>,
        limit: usize,
        offset: usize,
    ) -> Result<Vec<StoredBill>, RepositoryError> {
        let sql = format!(
            "SELECT {} FROM bills WHERE parliament = ? AND (? IS NULL OR session = ?) \
             ORDER BY introduced_date DESC, id ASC LIMIT ? OFFSET ?",
            BILL_COLUMNS
        );
        let rows = sqlx::query(&sql)
            .bind(parliament)
            .bind(session)
            .bind(session)
            .bind(limit as i64)
            .bind(offset as i64)
            .fetch_all(&self.pool)
            .await?;
        rows.iter().map(row_to_stored).collect()
    }
}

#[async_trait]
impl FetchLogRepository for SqliteStore {
    async fn record(&self, log: NewFetchLog) -> Result<FetchLog, RepositoryError> {
        let params = serde_json::to_string(&log.fetch_params)?;
        let summary = serde_json::to_string(&log.error_summary)?;
        let created_at = Utc::now().timestamp();

        let mut tx = self.pool.begin().await?;
        let id: i64 = sqlx::query_scalar(
            r#"
            INSERT INTO fetch_logs (source, status, records_attempted, records_succeeded,
                                    records_failed, duration_seconds, fetch_params,
                                    error_count, error_summary, created_at)
            VALUES (?, ?, ?, ?, ?, ?, ?, ?, ?, ?)
            RETURNING id
            "#,
        )
        .bind(&log.source)
        .bind(log.status.as_str())
        .bind(log.records_attempted)
        .bind(log.records_succeeded)
        .bind(log.records_failed)
        .bind(log.duration_seconds)
        .bind(&params)
        .bind(log.error_count)
        .bind(&summary)
        .bind(created_at)
        .fetch_one(&mut *tx)
        .await?;
        tx.commit().await?;

        Ok(log.into_log(id, ts_to_datetime(created_at)?))
    }

    async fn recent(&self, limit: usize, source: Option<&str>) -> Result<Vec<FetchLog>, RepositoryError> {
        let sql = format!(
            "SELECT {} FROM fetch_logs WHERE (? IS NULL OR source = ?) \
             ORDER BY created_at DESC, id DESC LIMIT ?",
            LOG_COLUMNS
        );
        let rows = sqlx::query(&sql)
            .bind(source)
            .bind(source)
            .bind(limit as i64)
            .fetch_all(&self.pool)
            .await?;
        rows.iter().map(row_to_log).collect()
    }

    async fn since(
        &self,
        cutoff: DateTime<Utc>,
        source: Option<&str>,
    ) -> Result<Vec<FetchLog>, RepositoryError> {
        let sql = format!(
            "SELECT {} FROM fetch_logs WHERE created_at >= ? AND (? IS NULL OR source = ?) \
             ORDER BY created_at DESC, id DESC",
            LOG_COLUMNS
        );
        let rows = sqlx::query(&sql)
            .bind(cutoff.timestamp())
            .bind(source)
            .bind(source)
            .fetch_all(&self.pool)
            .await?;
        rows.iter().map(row_to_log).collect()
    }

    async fn last_successful_params(
        &self,
        source: &str,
        parliament: Option<i32>,
        session: Option<i32>,
    ) -> Result<Option<serde_json::Value>, RepositoryError> {
        let rows: Vec<String> = sqlx::query_scalar(
            "SELECT fetch_params FROM fetch_logs WHERE source = ? AND status = 'success' \
             ORDER BY created_at DESC, id DESC LIMIT 200",
        )
        .bind(source)
        .fetch_all(&self.pool)
        .await?;

        for raw in rows {
            let params: serde_json::Value = serde_json::from_str(&raw)?;
            if params_match(&params, parliament, session) {
                return Ok(Some(params));
            }
        }
        Ok(None)
    }
}
