//! In-memory [`BillRepository`] and [`FetchLogRepository`].
//!
//! Uses `HashMap` and `Vec` behind `std::sync::RwLock`. Rows go through the
//! same [`BillRecord`] conversion as the SQLite store so mapping behavior
//! is identical.

use std::collections::HashMap;
use std::sync::atomic::{AtomicBool, AtomicI64, Ordering};
use std::sync::RwLock;

use async_trait::async_trait;
use chrono::{DateTime, Utc};

use super::{validate, BillRecord, BillRepository, StoredBill, UpsertOutcome, UpsertStatus};
use crate::error::RepositoryError;
use crate::fetch_log::{params_match, FetchLog, FetchLogRepository, NewFetchLog};
use crate::models::{Bill, NaturalKey, RunStatus};

struct Row {
    id: i64,
    created_at: DateTime<Utc>,
    updated_at: DateTime<Utc>,
    record: BillRecord,
}

impl Row {
    fn to_stored(&self) -> Result<StoredBill, RepositoryError> {
        Ok(StoredBill {
            id: self.id,
            created_at: self.created_at,
            updated_at: self.updated_at,
            bill: self.record.clone().into_domain()?,
        })
    }
}

/// Volatile store for tests and `--dry-run` style use.
pub struct InMemoryStore {
    bills: RwLock<HashMap<NaturalKey, Row>>,
    logs: RwLock<Vec<FetchLog>>,
    next_bill_id: AtomicI64,
    next_log_id: AtomicI64,
    closed: AtomicBool,
}

impl InMemoryStore {
    pub fn new() -> Self {
        Self {
            bills: RwLock::new(HashMap::new()),
            logs: RwLock::new(Vec::new()),
            next_bill_id: AtomicI64::new(1),
            next_log_id: AtomicI64::new(1),
            closed: AtomicBool::new(false),
        }
    }

    /// Make every later bill operation fail with
    /// [`RepositoryError::Unavailable`], like a closed pool. Fetch logs
    /// stay writable.
    pub fn close_bills(&self) {
        self.closed.store(true, Ordering::SeqCst);
    }

    pub fn bill_count(&self) -> usize {
        self.bills.read().map(|b| b.len()).unwrap_or(0)
    }

    fn ensure_open(&self) -> Result<(), RepositoryError> {
        if self.closed.load(Ordering::SeqCst) {
            return Err(RepositoryError::Unavailable("store closed".into()));
        }
        Ok(())
    }
}

impl Default for InMemoryStore {
    fn default() -> Self {
        Self::new()
    }
}

fn poisoned<T>(_: T) -> RepositoryError {
    RepositoryError::Unavailable("lock poisoned".into())
}

#[async_trait]
impl BillRepository for InMemoryStore {
    async fn get_by_natural_key(&self, key: &NaturalKey) -> Result<Option<StoredBill>, RepositoryError> {
        self.ensure_open()?;
        let bills = self.bills.read().map_err(poisoned)?;
        bills.get(key).map(Row::to_stored).transpose()
    }

    async fn upsert(&self, bill: &Bill) -> Result<UpsertOutcome, RepositoryError> {
        validate(bill)?;
        self.ensure_open()?;
        let now = Utc::now();

        let mut bills = self.bills.write().map_err(poisoned)?;
        let mut incoming = bill.clone();
        if let Some(row) = bills.get(&bill.natural_key()) {
            incoming.retain_enrichment_from(&row.record.clone().into_domain()?);
        }
        let record = BillRecord::from_domain(&incoming)?;

        match bills.get_mut(&bill.natural_key()) {
            Some(row) if row.record.content_hash == record.content_hash => {
                row.record.source_openparliament = record.source_openparliament;
                row.record.source_legisinfo = record.source_legisinfo;
                row.record.last_fetched_at = record.last_fetched_at;
                row.record.last_enriched_at = record.last_enriched_at;
                Ok(UpsertOutcome {
                    id: row.id,
                    status: UpsertStatus::Unchanged,
                })
            }
            Some(row) => {
                row.record = record;
                row.updated_at = now;
                Ok(UpsertOutcome {
                    id: row.id,
                    status: UpsertStatus::Updated,
                })
            }
            None => {
                let id = self.next_bill_id.fetch_add(1, Ordering::SeqCst);
                bills.insert(
                    bill.natural_key(),
                    Row {
                        id,
                        created_at: now,
                        updated_at: now,
                        record,
                    },
                );
                Ok(UpsertOutcome {
                    id,
                    status: UpsertStatus::Created,
                })
            }
        }
    }

    async fn list_by_session(
        &self,
        parliament: i32,
        session: Option<i32>,
        limit: usize,
        offset: usize,
    ) -> Result<Vec<StoredBill>, RepositoryError> {
        self.ensure_open()?;
        let bills = self.bills.read().map_err(poisoned)?;
        let mut rows: Vec<&Row> = bills
            .values()
            .filter(|row| row.record.parliament == parliament)
            .filter(|row| session.map_or(true, |s| row.record.session == s))
            .collect();
        // ISO dates sort lexically; None sorts last.
        rows.sort_by(|a, b| {
            b.record
                .introduced_date
                .cmp(&a.record.introduced_date)
                .then(a.id.cmp(&b.id))
        });
        rows.into_iter()
            .skip(offset)
            .take(limit)
            .map(Row::to_stored)
            .collect()
    }
}

#[async_trait]
impl FetchLogRepository for InMemoryStore {
    async fn record(&self, log: NewFetchLog) -> Result<FetchLog, RepositoryError> {
        let id = self.next_log_id.fetch_add(1, Ordering::SeqCst);
        let log = log.into_log(id, Utc::now());
        self.logs.write().map_err(poisoned)?.push(log.clone());
        Ok(log)
    }

    async fn recent(&self, limit: usize, source: Option<&str>) -> Result<Vec<FetchLog>, RepositoryError> {
        let logs = self.logs.read().map_err(poisoned)?;
        Ok(logs
            .iter()
            .rev()
            .filter(|log| source.map_or(true, |s| log.source == s))
            .take(limit)
            .cloned()
            .collect())
    }

    async fn since(
        &self,
        cutoff: DateTime<Utc>,
        source: Option<&str>,
    ) -> Result<Vec<FetchLog>, RepositoryError> {
        let logs = self.logs.read().map_err(poisoned)?;
        Ok(logs
            .iter()
            .rev()
            .filter(|log| log.created_at >= cutoff)
            .filter(|log| source.map_or(true, |s| log.source == s))
            .cloned()
            .collect())
    }

    async fn last_successful_params(
        &self,
        source: &str,
        parliament: Option<i32>,
        session: Option<i32>,
    ) -> Result<Option<serde_json::Value>, RepositoryError> {
        let logs = self.logs.read().map_err(poisoned)?;
        Ok(logs
            .iter()
            .rev()
            .filter(|log| log.source == source && log.status == RunStatus::Success)
            .find(|log| params_match(&log.fetch_params, parliament, session))
            .map(|log| log.fetch_params.clone()))
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::fetch_log::RecordCounts;
    use crate::models::DEFAULT_JURISDICTION;
    use chrono::NaiveDate;
    use serde_json::json;

    fn bill(number: &str, introduced: Option<(i32, u32, u32)>) -> Bill {
        let mut b = Bill::new(
            NaturalKey::new(DEFAULT_JURISDICTION, 44, 1, number),
            format!("Bill {}", number),
            DateTime::from_timestamp(1_700_000_000, 0).unwrap(),
        );
        b.introduced_date = introduced.and_then(|(y, m, d)| NaiveDate::from_ymd_opt(y, m, d));
        b
    }

    #[tokio::test]
    async fn test_upsert_created_updated_unchanged() {
        let store = InMemoryStore::new();
        let first = store.upsert(&bill("C-10", None)).await.unwrap();
        assert_eq!(first.status, UpsertStatus::Created);

        let mut refetched = bill("C-10", None);
        refetched.last_fetched_at = DateTime::from_timestamp(1_700_000_500, 0).unwrap();
        let again = store.upsert(&refetched).await.unwrap();
        assert_eq!(again, UpsertOutcome { id: first.id, status: UpsertStatus::Unchanged });

        let stored = store.get_by_natural_key(&refetched.natural_key()).await.unwrap().unwrap();
        assert_eq!(stored.bill.last_fetched_at, refetched.last_fetched_at);
        assert_eq!(stored.created_at, stored.updated_at);

        refetched.law_status = Some("RoyalAssentGiven".into());
        let changed = store.upsert(&refetched).await.unwrap();
        assert_eq!(changed.status, UpsertStatus::Updated);
        assert_eq!(changed.id, first.id);
        assert_eq!(store.bill_count(), 1);
    }

    #[tokio::test]
    async fn test_unenriched_upsert_keeps_stored_enrichment() {
        let store = InMemoryStore::new();
        let enriched_at = DateTime::from_timestamp(1_700_000_100, 0).unwrap();
        let mut enriched = bill("C-10", None);
        enriched.apply_enrichment(
            crate::models::BillEnrichment {
                summary_en: Some("Summary".into()),
                ..Default::default()
            },
            enriched_at,
        );
        store.upsert(&enriched).await.unwrap();

        let mut plain = bill("C-10", None);
        plain.last_fetched_at = DateTime::from_timestamp(1_700_000_900, 0).unwrap();
        let outcome = store.upsert(&plain).await.unwrap();
        assert_eq!(outcome.status, UpsertStatus::Unchanged);

        let stored = store.get_by_natural_key(&plain.natural_key()).await.unwrap().unwrap();
        assert_eq!(stored.bill.legisinfo_summary_en.as_deref(), Some("Summary"));
        assert_eq!(stored.bill.last_enriched_at, Some(enriched_at));
        assert_eq!(stored.bill.last_fetched_at, plain.last_fetched_at);
        assert!(stored.bill.source_legisinfo);
    }

    #[tokio::test]
    async fn test_closed_store_is_unavailable() {
        let store = InMemoryStore::new();
        store.close_bills();
        let err = store.upsert(&bill("C-1", None)).await.unwrap_err();
        assert!(matches!(err, RepositoryError::Unavailable(_)));
    }

    #[tokio::test]
    async fn test_invalid_bill_is_not_stored() {
        let store = InMemoryStore::new();
        let mut b = bill("C-1", None);
        b.parliament = 0;
        assert!(matches!(store.upsert(&b).await, Err(RepositoryError::Validation(_))));
        assert_eq!(store.bill_count(), 0);
    }

    #[tokio::test]
    async fn test_list_orders_by_introduced_desc() {
        let store = InMemoryStore::new();
        store.upsert(&bill("C-1", Some((2021, 11, 22)))).await.unwrap();
        store.upsert(&bill("C-2", None)).await.unwrap();
        store.upsert(&bill("C-3", Some((2022, 3, 1)))).await.unwrap();

        let listed = store.list_by_session(44, Some(1), 10, 0).await.unwrap();
        let numbers: Vec<_> = listed.iter().map(|s| s.bill.number.as_str()).collect();
        assert_eq!(numbers, vec!["C-3", "C-1", "C-2"]);

        let page = store.list_by_session(44, None, 1, 1).await.unwrap();
        assert_eq!(page[0].bill.number, "C-1");
        assert!(store.list_by_session(43, None, 10, 0).await.unwrap().is_empty());
    }

    #[tokio::test]
    async fn test_last_successful_params() {
        let store = InMemoryStore::new();
        let counts = RecordCounts::default();
        for (status, params) in [
            (RunStatus::Success, json!({"parliament": 44, "session": 1, "max_introduced_date": "2022-01-01"})),
            (RunStatus::Failure, json!({"parliament": 44, "session": 1, "max_introduced_date": "2023-01-01"})),
            (RunStatus::Success, json!({"parliament": 43, "session": 2})),
        ] {
            let log = NewFetchLog::new("svc", status, counts, 0.1, params, &[], 10).unwrap();
            store.record(log).await.unwrap();
        }

        let params = store.last_successful_params("svc", Some(44), Some(1)).await.unwrap().unwrap();
        assert_eq!(params["max_introduced_date"], "2022-01-01");
        assert!(store.last_successful_params("other", Some(44), Some(1)).await.unwrap().is_none());
        assert_eq!(store.recent(2, Some("svc")).await.unwrap().len(), 2);
        assert_eq!(store.recent(10, None).await.unwrap()[0].fetch_params["parliament"], 43);
    }
}
