//! Bill persistence.
//!
//! The [`BillRepository`] trait is the only way the service touches stored
//! bills. It reconciles incoming records against what is already stored by
//! natural key: a first sighting inserts, a later one updates the same row
//! in place, so surrogate ids and `created_at` never move.
//!
//! Two implementations exist:
//!
//! | Type | Backing |
//! |------|---------|
//! | [`SqliteStore`] | `sqlx` SQLite pool, one transaction per bill |
//! | [`InMemoryStore`] | `RwLock<HashMap>`, for tests and dry runs |
//!
//! Both also implement [`FetchLogRepository`](crate::fetch_log::FetchLogRepository).

pub mod memory;
pub mod sqlite;

pub use memory::InMemoryStore;
pub use sqlite::SqliteStore;

use async_trait::async_trait;
use chrono::{DateTime, NaiveDate, Utc};
use serde::Serialize;

use crate::error::RepositoryError;
use crate::models::{Bill, NaturalKey};

/// What an upsert did to the stored row.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize)]
#[serde(rename_all = "lowercase")]
pub enum UpsertStatus {
    Created,
    Updated,
    /// Matched an existing row whose content hash was identical. Only
    /// provenance columns were written.
    Unchanged,
}

#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize)]
pub struct UpsertOutcome {
    pub id: i64,
    pub status: UpsertStatus,
}

/// A bill as stored, with its surrogate identity.
#[derive(Debug, Clone, PartialEq, Serialize)]
pub struct StoredBill {
    pub id: i64,
    pub created_at: DateTime<Utc>,
    pub updated_at: DateTime<Utc>,
    pub bill: Bill,
}

/// Storage representation of a [`Bill`].
///
/// Timestamps are epoch seconds, dates ISO strings, list fields JSON
/// arrays. Every optional domain field is nullable here; empty lists are
/// stored as NULL.
#[derive(Debug, Clone, PartialEq)]
pub struct BillRecord {
    pub jurisdiction: String,
    pub parliament: i32,
    pub session: i32,
    pub number: String,
    pub title_en: String,
    pub title_fr: Option<String>,
    pub short_title_en: Option<String>,
    pub short_title_fr: Option<String>,
    pub law_status: Option<String>,
    pub introduced_date: Option<String>,
    pub sponsor_politician_id: Option<i64>,
    pub sponsor_politician_name: Option<String>,
    pub legisinfo_id: Option<i64>,
    pub legisinfo_status: Option<String>,
    pub legisinfo_summary_en: Option<String>,
    pub legisinfo_summary_fr: Option<String>,
    pub royal_assent_date: Option<String>,
    pub royal_assent_chapter: Option<String>,
    pub related_bill_numbers: Option<String>,
    pub subject_tags: Option<String>,
    pub committee_studies: Option<String>,
    pub source_openparliament: bool,
    pub source_legisinfo: bool,
    pub last_fetched_at: i64,
    pub last_enriched_at: Option<i64>,
    pub content_hash: String,
}

fn list_to_column(values: &[String]) -> Result<Option<String>, RepositoryError> {
    if values.is_empty() {
        return Ok(None);
    }
    Ok(Some(serde_json::to_string(values)?))
}

fn column_to_list(column: Option<String>) -> Result<Vec<String>, RepositoryError> {
    match column {
        Some(json) if !json.trim().is_empty() => Ok(serde_json::from_str(&json)?),
        _ => Ok(Vec::new()),
    }
}

fn date_to_column(date: Option<NaiveDate>) -> Option<String> {
    date.map(|d| d.format("%Y-%m-%d").to_string())
}

fn column_to_date(column: Option<String>, name: &str) -> Result<Option<NaiveDate>, RepositoryError> {
    column
        .map(|raw| {
            NaiveDate::parse_from_str(&raw, "%Y-%m-%d")
                .map_err(|e| RepositoryError::Database(format!("bad {} '{}': {}", name, raw, e)))
        })
        .transpose()
}

pub(crate) fn ts_to_datetime(ts: i64) -> Result<DateTime<Utc>, RepositoryError> {
    DateTime::from_timestamp(ts, 0)
        .ok_or_else(|| RepositoryError::Database(format!("timestamp out of range: {}", ts)))
}

impl BillRecord {
    pub fn from_domain(bill: &Bill) -> Result<Self, RepositoryError> {
        Ok(Self {
            jurisdiction: bill.jurisdiction.clone(),
            parliament: bill.parliament,
            session: bill.session,
            number: bill.number.clone(),
            title_en: bill.title_en.clone(),
            title_fr: bill.title_fr.clone(),
            short_title_en: bill.short_title_en.clone(),
            short_title_fr: bill.short_title_fr.clone(),
            law_status: bill.law_status.clone(),
            introduced_date: date_to_column(bill.introduced_date),
            sponsor_politician_id: bill.sponsor_politician_id,
            sponsor_politician_name: bill.sponsor_politician_name.clone(),
            legisinfo_id: bill.legisinfo_id,
            legisinfo_status: bill.legisinfo_status.clone(),
            legisinfo_summary_en: bill.legisinfo_summary_en.clone(),
            legisinfo_summary_fr: bill.legisinfo_summary_fr.clone(),
            royal_assent_date: date_to_column(bill.royal_assent_date),
            royal_assent_chapter: bill.royal_assent_chapter.clone(),
            related_bill_numbers: list_to_column(&bill.related_bill_numbers)?,
            subject_tags: list_to_column(&bill.subject_tags)?,
            committee_studies: list_to_column(&bill.committee_studies)?,
            source_openparliament: bill.source_openparliament,
            source_legisinfo: bill.source_legisinfo,
            last_fetched_at: bill.last_fetched_at.timestamp(),
            last_enriched_at: bill.last_enriched_at.map(|t| t.timestamp()),
            content_hash: bill.content_hash(),
        })
    }

    pub fn into_domain(self) -> Result<Bill, RepositoryError> {
        Ok(Bill {
            jurisdiction: self.jurisdiction,
            parliament: self.parliament,
            session: self.session,
            number: self.number,
            title_en: self.title_en,
            title_fr: self.title_fr,
            short_title_en: self.short_title_en,
            short_title_fr: self.short_title_fr,
            law_status: self.law_status,
            introduced_date: column_to_date(self.introduced_date, "introduced_date")?,
            sponsor_politician_id: self.sponsor_politician_id,
            sponsor_politician_name: self.sponsor_politician_name,
            legisinfo_id: self.legisinfo_id,
            legisinfo_status: self.legisinfo_status,
            legisinfo_summary_en: self.legisinfo_summary_en,
            legisinfo_summary_fr: self.legisinfo_summary_fr,
            royal_assent_date: column_to_date(self.royal_assent_date, "royal_assent_date")?,
            royal_assent_chapter: self.royal_assent_chapter,
            related_bill_numbers: column_to_list(self.related_bill_numbers)?,
            subject_tags: column_to_list(self.subject_tags)?,
            committee_studies: column_to_list(self.committee_studies)?,
            source_openparliament: self.source_openparliament,
            source_legisinfo: self.source_legisinfo,
            last_fetched_at: ts_to_datetime(self.last_fetched_at)?,
            last_enriched_at: self.last_enriched_at.map(ts_to_datetime).transpose()?,
        })
    }
}

/// Reject a bill that must never reach storage.
pub fn validate(bill: &Bill) -> Result<(), RepositoryError> {
    if bill.jurisdiction.trim().is_empty() {
        return Err(RepositoryError::Validation("jurisdiction is empty".into()));
    }
    if bill.number.trim().is_empty() {
        return Err(RepositoryError::Validation("bill number is empty".into()));
    }
    if bill.parliament <= 0 {
        return Err(RepositoryError::Validation(format!(
            "parliament must be positive, got {}",
            bill.parliament
        )));
    }
    if bill.session <= 0 {
        return Err(RepositoryError::Validation(format!(
            "session must be positive, got {}",
            bill.session
        )));
    }
    if bill.title_en.trim().is_empty() {
        return Err(RepositoryError::Validation("title_en is empty".into()));
    }
    Ok(())
}

/// Natural-key reconciliation of bills.
#[async_trait]
pub trait BillRepository: Send + Sync {
    async fn get_by_natural_key(&self, key: &NaturalKey) -> Result<Option<StoredBill>, RepositoryError>;

    /// Insert or update by natural key, atomically for this bill.
    ///
    /// Validation runs first; an invalid bill is rejected with
    /// [`RepositoryError::Validation`] before storage is touched.
    async fn upsert(&self, bill: &Bill) -> Result<UpsertOutcome, RepositoryError>;

    /// Bills of one parliament (optionally one session), newest
    /// introduced first.
    async fn list_by_session(
        &self,
        parliament: i32,
        session: Option<i32>,
        limit: usize,
        offset: usize,
    ) -> Result<Vec<StoredBill>, RepositoryError>;
}
