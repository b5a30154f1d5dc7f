//! Core data models used throughout the ingestion pipeline.
//!
//! These types represent bills, enrichment deltas, per-item errors and run
//! outcomes as they flow from the source adapter through the pipeline and
//! into the repository.

use std::fmt;

use chrono::{DateTime, NaiveDate, Utc};
use serde::{Deserialize, Serialize};
use sha2::{Digest, Sha256};

/// Jurisdiction code used for federal Canadian bills.
pub const DEFAULT_JURISDICTION: &str = "canada-federal";

/// Externally meaningful identity of a bill.
///
/// Unique and stable across enrichment passes; the repository upserts on it.
#[derive(Debug, Clone, PartialEq, Eq, Hash, PartialOrd, Ord, Serialize, Deserialize)]
pub struct NaturalKey {
    pub jurisdiction: String,
    pub parliament: i32,
    pub session: i32,
    pub number: String,
}

impl NaturalKey {
    pub fn new(
        jurisdiction: impl Into<String>,
        parliament: i32,
        session: i32,
        number: impl Into<String>,
    ) -> Self {
        Self {
            jurisdiction: jurisdiction.into(),
            parliament,
            session,
            number: number.into(),
        }
    }

    /// Session slug as used by OpenParliament and LEGISinfo, e.g. `44-1`.
    pub fn session_code(&self) -> String {
        format!("{}-{}", self.parliament, self.session)
    }

    /// Stable key consumed by the downstream knowledge indexer.
    pub fn document_key(&self) -> String {
        format!(
            "bill:{}:{}:{}",
            self.jurisdiction,
            self.session_code(),
            self.number
        )
    }
}

impl fmt::Display for NaturalKey {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        write!(
            f,
            "{}/{}-{}/{}",
            self.jurisdiction, self.parliament, self.session, self.number
        )
    }
}

/// Canonical in-memory representation of a bill.
///
/// Every enrichment field is optional (or an empty list) so a record
/// produced by the source adapter alone is a complete, valid `Bill`.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct Bill {
    pub jurisdiction: String,
    pub parliament: i32,
    pub session: i32,
    pub number: String,

    pub title_en: String,
    pub title_fr: Option<String>,
    pub short_title_en: Option<String>,
    pub short_title_fr: Option<String>,

    pub law_status: Option<String>,
    pub introduced_date: Option<NaiveDate>,
    pub sponsor_politician_id: Option<i64>,
    pub sponsor_politician_name: Option<String>,

    pub legisinfo_id: Option<i64>,
    pub legisinfo_status: Option<String>,
    pub legisinfo_summary_en: Option<String>,
    pub legisinfo_summary_fr: Option<String>,
    pub royal_assent_date: Option<NaiveDate>,
    pub royal_assent_chapter: Option<String>,
    pub related_bill_numbers: Vec<String>,
    pub subject_tags: Vec<String>,
    pub committee_studies: Vec<String>,

    pub source_openparliament: bool,
    pub source_legisinfo: bool,
    pub last_fetched_at: DateTime<Utc>,
    pub last_enriched_at: Option<DateTime<Utc>>,
}

impl Bill {
    /// Base record as returned by the primary source, enrichment fields empty.
    pub fn new(key: NaturalKey, title_en: impl Into<String>, fetched_at: DateTime<Utc>) -> Self {
        Self {
            jurisdiction: key.jurisdiction,
            parliament: key.parliament,
            session: key.session,
            number: key.number,
            title_en: title_en.into(),
            title_fr: None,
            short_title_en: None,
            short_title_fr: None,
            law_status: None,
            introduced_date: None,
            sponsor_politician_id: None,
            sponsor_politician_name: None,
            legisinfo_id: None,
            legisinfo_status: None,
            legisinfo_summary_en: None,
            legisinfo_summary_fr: None,
            royal_assent_date: None,
            royal_assent_chapter: None,
            related_bill_numbers: Vec::new(),
            subject_tags: Vec::new(),
            committee_studies: Vec::new(),
            source_openparliament: true,
            source_legisinfo: false,
            last_fetched_at: fetched_at,
            last_enriched_at: None,
        }
    }

    pub fn natural_key(&self) -> NaturalKey {
        NaturalKey::new(
            self.jurisdiction.clone(),
            self.parliament,
            self.session,
            self.number.clone(),
        )
    }

    pub fn document_key(&self) -> String {
        self.natural_key().document_key()
    }

    /// SHA-256 over the content fields, hex encoded.
    ///
    /// Provenance flags and timestamps are excluded so a refetch of an
    /// unchanged bill hashes identically.
    pub fn content_hash(&self) -> String {
        fn opt(hasher: &mut Sha256, value: Option<&str>) {
            match value {
                Some(v) => {
                    hasher.update([1u8]);
                    hasher.update((v.len() as u64).to_le_bytes());
                    hasher.update(v.as_bytes());
                }
                None => hasher.update([0u8]),
            }
        }
        fn list(hasher: &mut Sha256, values: &[String]) {
            hasher.update((values.len() as u64).to_le_bytes());
            for v in values {
                opt(hasher, Some(v));
            }
        }

        let introduced = self.introduced_date.map(|d| d.to_string());
        let assent = self.royal_assent_date.map(|d| d.to_string());
        let sponsor_id = self.sponsor_politician_id.map(|id| id.to_string());
        let legisinfo_id = self.legisinfo_id.map(|id| id.to_string());

        let mut hasher = Sha256::new();
        opt(&mut hasher, Some(&self.title_en));
        opt(&mut hasher, self.title_fr.as_deref());
        opt(&mut hasher, self.short_title_en.as_deref());
        opt(&mut hasher, self.short_title_fr.as_deref());
        opt(&mut hasher, self.law_status.as_deref());
        opt(&mut hasher, introduced.as_deref());
        opt(&mut hasher, sponsor_id.as_deref());
        opt(&mut hasher, self.sponsor_politician_name.as_deref());
        opt(&mut hasher, legisinfo_id.as_deref());
        opt(&mut hasher, self.legisinfo_status.as_deref());
        opt(&mut hasher, self.legisinfo_summary_en.as_deref());
        opt(&mut hasher, self.legisinfo_summary_fr.as_deref());
        opt(&mut hasher, assent.as_deref());
        opt(&mut hasher, self.royal_assent_chapter.as_deref());
        list(&mut hasher, &self.related_bill_numbers);
        list(&mut hasher, &self.subject_tags);
        list(&mut hasher, &self.committee_studies);
        format!("{:x}", hasher.finalize())
    }

    /// Merge a scraper delta into this bill.
    ///
    /// Fields the delta does not carry are left as they are.
    pub fn apply_enrichment(&mut self, delta: BillEnrichment, at: DateTime<Utc>) {
        if let Some(status) = delta.status {
            self.legisinfo_status = Some(status);
        }
        if let Some(summary) = delta.summary_en {
            self.legisinfo_summary_en = Some(summary);
        }
        if let Some(summary) = delta.summary_fr {
            self.legisinfo_summary_fr = Some(summary);
        }
        if let Some(name) = delta.sponsor_name {
            self.sponsor_politician_name = Some(name);
        }
        if let Some(id) = delta.legisinfo_id {
            self.legisinfo_id = Some(id);
        }
        if let Some(date) = delta.royal_assent_date {
            self.royal_assent_date = Some(date);
        }
        if let Some(chapter) = delta.royal_assent_chapter {
            self.royal_assent_chapter = Some(chapter);
        }
        if !delta.subject_tags.is_empty() {
            self.subject_tags = delta.subject_tags;
        }
        if !delta.committee_studies.is_empty() {
            self.committee_studies = delta.committee_studies;
        }
        if !delta.related_bill_numbers.is_empty() {
            self.related_bill_numbers = delta.related_bill_numbers;
        }
        self.source_legisinfo = true;
        self.last_enriched_at = Some(at);
    }

    /// Keep the LEGISinfo fields of a previously stored version when this
    /// record was not enriched on the current run.
    ///
    /// A run with enrichment disabled or failing must not erase what an
    /// earlier run scraped, nor clear `last_enriched_at`.
    pub fn retain_enrichment_from(&mut self, stored: &Bill) {
        if self.source_legisinfo || !stored.source_legisinfo {
            return;
        }
        self.legisinfo_id = self.legisinfo_id.or(stored.legisinfo_id);
        self.legisinfo_status = stored.legisinfo_status.clone();
        self.legisinfo_summary_en = stored.legisinfo_summary_en.clone();
        self.legisinfo_summary_fr = stored.legisinfo_summary_fr.clone();
        self.royal_assent_date = stored.royal_assent_date;
        self.royal_assent_chapter = stored.royal_assent_chapter.clone();
        self.related_bill_numbers = stored.related_bill_numbers.clone();
        self.subject_tags = stored.subject_tags.clone();
        self.committee_studies = stored.committee_studies.clone();
        self.source_legisinfo = true;
        self.last_enriched_at = stored.last_enriched_at;
    }
}

/// Partial bill produced by the enrichment scraper.
#[derive(Debug, Clone, Default, PartialEq, Serialize, Deserialize)]
pub struct BillEnrichment {
    pub status: Option<String>,
    pub summary_en: Option<String>,
    pub summary_fr: Option<String>,
    pub sponsor_name: Option<String>,
    pub legisinfo_id: Option<i64>,
    pub royal_assent_date: Option<NaiveDate>,
    pub royal_assent_chapter: Option<String>,
    pub subject_tags: Vec<String>,
    pub committee_studies: Vec<String>,
    pub related_bill_numbers: Vec<String>,
}

impl BillEnrichment {
    pub fn is_empty(&self) -> bool {
        self.status.is_none()
            && self.summary_en.is_none()
            && self.summary_fr.is_none()
            && self.sponsor_name.is_none()
            && self.legisinfo_id.is_none()
            && self.royal_assent_date.is_none()
            && self.royal_assent_chapter.is_none()
            && self.subject_tags.is_empty()
            && self.committee_studies.is_empty()
            && self.related_bill_numbers.is_empty()
    }
}

/// Outcome classification shared by the pipeline, the service and fetch logs.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "lowercase")]
pub enum RunStatus {
    Success,
    Partial,
    Failure,
}

impl RunStatus {
    /// `success` with no errors (including an empty batch), `partial` with
    /// at least one success and one error, `failure` otherwise.
    pub fn classify(succeeded: usize, error_count: usize) -> Self {
        if error_count == 0 {
            RunStatus::Success
        } else if succeeded > 0 {
            RunStatus::Partial
        } else {
            RunStatus::Failure
        }
    }

    pub fn as_str(&self) -> &'static str {
        match self {
            RunStatus::Success => "success",
            RunStatus::Partial => "partial",
            RunStatus::Failure => "failure",
        }
    }

    pub fn parse(value: &str) -> Option<Self> {
        match value {
            "success" => Some(RunStatus::Success),
            "partial" => Some(RunStatus::Partial),
            "failure" => Some(RunStatus::Failure),
            _ => None,
        }
    }
}

impl fmt::Display for RunStatus {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.write_str(self.as_str())
    }
}

/// Category of a per-item failure.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "snake_case")]
pub enum ErrorKind {
    /// Timeout, 5xx or rate limit that survived every retry.
    Transient,
    /// 4xx other than rate limiting.
    Permanent,
    /// Payload that could not be decoded into a bill.
    Malformed,
    /// Scraper failure; the base record is kept.
    Enrichment,
    /// Rejected by the repository before any write.
    Validation,
    /// Write failed at the storage layer.
    Persistence,
    /// Run-level abort.
    Fatal,
}

impl ErrorKind {
    pub fn as_str(&self) -> &'static str {
        match self {
            ErrorKind::Transient => "transient",
            ErrorKind::Permanent => "permanent",
            ErrorKind::Malformed => "malformed",
            ErrorKind::Enrichment => "enrichment",
            ErrorKind::Validation => "validation",
            ErrorKind::Persistence => "persistence",
            ErrorKind::Fatal => "fatal",
        }
    }
}

/// A failure attached to one item of a batch.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct ItemError {
    /// Natural key display form, or a label such as `page offset=40`.
    pub subject: String,
    pub key: Option<NaturalKey>,
    pub kind: ErrorKind,
    pub message: String,
    pub occurred_at: DateTime<Utc>,
}

impl ItemError {
    pub fn for_key(key: &NaturalKey, kind: ErrorKind, message: impl Into<String>) -> Self {
        Self {
            subject: key.to_string(),
            key: Some(key.clone()),
            kind,
            message: message.into(),
            occurred_at: Utc::now(),
        }
    }

    pub fn for_subject(subject: impl Into<String>, kind: ErrorKind, message: impl Into<String>) -> Self {
        Self {
            subject: subject.into(),
            key: None,
            kind,
            message: message.into(),
            occurred_at: Utc::now(),
        }
    }
}

impl fmt::Display for ItemError {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        write!(f, "[{}] {}: {}", self.kind.as_str(), self.subject, self.message)
    }
}

/// Which bills a run should fetch.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
#[serde(tag = "mode", rename_all = "lowercase")]
pub enum SelectionMode {
    /// The N most recently introduced bills.
    Recent { limit: usize },
    /// Every bill of one parliament session, optionally capped.
    Session {
        parliament: i32,
        session: i32,
        limit: Option<usize>,
    },
}

#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct Selection {
    #[serde(flatten)]
    pub mode: SelectionMode,
    pub introduced_after: Option<NaiveDate>,
}

impl Selection {
    pub fn recent(limit: usize) -> Self {
        Self {
            mode: SelectionMode::Recent { limit },
            introduced_after: None,
        }
    }

    pub fn session(parliament: i32, session: i32) -> Self {
        Self {
            mode: SelectionMode::Session {
                parliament,
                session,
                limit: None,
            },
            introduced_after: None,
        }
    }

    pub fn with_limit(mut self, cap: usize) -> Self {
        match &mut self.mode {
            SelectionMode::Recent { limit } => *limit = cap,
            SelectionMode::Session { limit, .. } => *limit = Some(cap),
        }
        self
    }

    pub fn introduced_after(mut self, date: NaiveDate) -> Self {
        self.introduced_after = Some(date);
        self
    }

    pub fn limit(&self) -> Option<usize> {
        match &self.mode {
            SelectionMode::Recent { limit } => Some(*limit),
            SelectionMode::Session { limit, .. } => *limit,
        }
    }

    pub fn parliament_session(&self) -> Option<(i32, i32)> {
        match &self.mode {
            SelectionMode::Recent { .. } => None,
            SelectionMode::Session {
                parliament, session, ..
            } => Some((*parliament, *session)),
        }
    }

    pub fn mode_name(&self) -> &'static str {
        match &self.mode {
            SelectionMode::Recent { .. } => "recent",
            SelectionMode::Session { .. } => "session",
        }
    }
}
