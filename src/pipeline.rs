//! Fetch → dedup → filter → enrich.
//!
//! The pipeline turns a [`Selection`] into a batch of validated domain
//! bills plus the per-item errors collected along the way. It never
//! persists anything and never fails as a whole because of one item.
//!
//! The two halves are exposed separately ([`Pipeline::fetch`] and
//! [`Pipeline::enrich`]) so the integration service can trace them as
//! distinct phases; [`Pipeline::run`] composes them.

use std::collections::HashMap;
use std::sync::Arc;

use chrono::{NaiveDate, Utc};
use futures::stream::{self, StreamExt};
use serde::{Deserialize, Serialize};
use tracing::{debug, info, warn};

use crate::config::Config;
use crate::http::HttpStats;
use crate::models::{Bill, ErrorKind, ItemError, NaturalKey, RunStatus, Selection};
use crate::traits::{BillEnricher, BillSource, Enrichment};

/// One pipeline invocation.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct PipelineRequest {
    pub selection: Selection,
    #[serde(default = "default_enrich")]
    pub enrich: bool,
}

fn default_enrich() -> bool {
    true
}

impl PipelineRequest {
    pub fn new(selection: Selection) -> Self {
        Self {
            selection,
            enrich: true,
        }
    }

    pub fn without_enrichment(mut self) -> Self {
        self.enrich = false;
        self
    }
}

#[derive(Debug, Clone)]
pub struct PipelineSettings {
    pub min_introduced_date: NaiveDate,
    pub enrichment_concurrency: usize,
}

impl PipelineSettings {
    pub fn from_config(config: &Config) -> Self {
        Self {
            min_introduced_date: config.pipeline.min_introduced_date,
            enrichment_concurrency: config.enrichment.concurrency.max(1),
        }
    }
}

/// Output of the fetch half, before enrichment.
#[derive(Debug, Clone, Default)]
pub struct FetchedBatch {
    pub bills: Vec<Bill>,
    pub errors: Vec<ItemError>,
    pub fetched: usize,
    pub duplicates_skipped: usize,
    pub filtered_out: usize,
    pub fetch_failures: usize,
    /// Requests made by the source during this fetch.
    pub source_http: HttpStats,
}

/// Everything a run produced before persistence.
#[derive(Debug, Clone)]
pub struct PipelineResult {
    pub bills: Vec<Bill>,
    pub errors: Vec<ItemError>,
    pub status: RunStatus,
    /// Records yielded by the source, duplicates and filtered ones included.
    pub fetched: usize,
    pub duplicates_skipped: usize,
    pub filtered_out: usize,
    pub enriched: usize,
    /// Bills the scraper had nothing new for.
    pub enrichment_empty: usize,
    pub fetch_failures: usize,
    pub source_http: HttpStats,
    pub enrichment_http: HttpStats,
}

impl PipelineResult {
    /// Unique items that entered the batch, successful or not.
    pub fn attempted(&self) -> usize {
        self.bills.len() + self.fetch_failures
    }
}

pub struct Pipeline {
    source: Arc<dyn BillSource>,
    enricher: Option<Arc<dyn BillEnricher>>,
    settings: PipelineSettings,
}

impl Pipeline {
    pub fn new(
        source: Arc<dyn BillSource>,
        enricher: Option<Arc<dyn BillEnricher>>,
        settings: PipelineSettings,
    ) -> Self {
        Self {
            source,
            enricher,
            settings,
        }
    }

    pub fn source_name(&self) -> &str {
        self.source.name()
    }

    pub async fn run(&self, request: &PipelineRequest) -> PipelineResult {
        let batch = self.fetch(&request.selection).await;
        self.enrich(batch, request.enrich).await
    }

    /// Drain the source, collapse duplicate keys and apply the date floor.
    pub async fn fetch(&self, selection: &Selection) -> FetchedBatch {
        let mut batch = FetchedBatch::default();
        let mut positions: HashMap<NaturalKey, usize> = HashMap::new();

        let stats_before = self.source.http_stats();
        let mut stream = self.source.fetch(selection);
        while let Some(item) = stream.next().await {
            match item {
                Ok(bill) => {
                    batch.fetched += 1;
                    let key = bill.natural_key();
                    match positions.get(&key) {
                        Some(&index) => {
                            debug!(bill = %key, "duplicate in batch, later record wins");
                            batch.bills[index] = bill;
                            batch.duplicates_skipped += 1;
                        }
                        None => {
                            positions.insert(key, batch.bills.len());
                            batch.bills.push(bill);
                        }
                    }
                }
                Err(err) => {
                    batch.fetch_failures += 1;
                    batch.errors.push(err);
                }
            }
        }

        let floor = self.settings.min_introduced_date;
        let before = batch.bills.len();
        batch.bills.retain(|bill| match bill.introduced_date {
            Some(date) if date < floor => {
                debug!(bill = %bill.natural_key(), introduced = %date, "introduced before floor, dropped");
                false
            }
            _ => true,
        });
        batch.filtered_out = before - batch.bills.len();
        batch.source_http = stats_delta(stats_before, self.source.http_stats());

        info!(
            source = self.source.name(),
            fetched = batch.fetched,
            unique = batch.bills.len(),
            duplicates = batch.duplicates_skipped,
            filtered = batch.filtered_out,
            failures = batch.fetch_failures,
            retries = batch.source_http.retries(),
            "fetch complete"
        );
        batch
    }

    /// Merge enrichment deltas into the batch with bounded concurrency.
    ///
    /// Order is preserved. A scraper failure keeps the base bill and adds
    /// an [`ErrorKind::Enrichment`] error.
    pub async fn enrich(&self, batch: FetchedBatch, enabled: bool) -> PipelineResult {
        let FetchedBatch {
            bills,
            mut errors,
            fetched,
            duplicates_skipped,
            filtered_out,
            fetch_failures,
            source_http,
        } = batch;

        let mut enriched = 0;
        let mut enrichment_empty = 0;
        let mut enrichment_http = HttpStats::default();

        let bills = match (&self.enricher, enabled) {
            (Some(enricher), true) if !bills.is_empty() => {
                let stats_before = enricher.http_stats();
                let outcomes: Vec<_> = stream::iter(bills)
                    .map(|bill| {
                        let enricher = Arc::clone(enricher);
                        async move {
                            let key = bill.natural_key();
                            let outcome = enricher.enrich(&key).await;
                            (bill, outcome)
                        }
                    })
                    .buffered(self.settings.enrichment_concurrency)
                    .collect()
                    .await;

                let mut out = Vec::with_capacity(outcomes.len());
                for (mut bill, outcome) in outcomes {
                    match outcome {
                        Ok(Enrichment::Found(delta)) => {
                            bill.apply_enrichment(delta, Utc::now());
                            enriched += 1;
                        }
                        Ok(Enrichment::NoNewData) => enrichment_empty += 1,
                        Err(e) => {
                            let key = bill.natural_key();
                            warn!(bill = %key, error = %e, "enrichment failed, keeping base record");
                            errors.push(ItemError::for_key(
                                &key,
                                ErrorKind::Enrichment,
                                e.to_string(),
                            ));
                        }
                    }
                    out.push(bill);
                }
                enrichment_http = stats_delta(stats_before, enricher.http_stats());
                info!(
                    enricher = enricher.name(),
                    enriched,
                    empty = enrichment_empty,
                    retries = enrichment_http.retries(),
                    circuit_rejections = enrichment_http.circuit_rejections,
                    "enrichment complete"
                );
                out
            }
            _ => bills,
        };

        let status = RunStatus::classify(bills.len(), errors.len());
        PipelineResult {
            bills,
            errors,
            status,
            fetched,
            duplicates_skipped,
            filtered_out,
            enriched,
            enrichment_empty,
            fetch_failures,
            source_http,
            enrichment_http,
        }
    }
}

fn stats_delta(before: Option<HttpStats>, after: Option<HttpStats>) -> HttpStats {
    match (before, after) {
        (Some(before), Some(after)) => after.since(&before),
        _ => HttpStats::default(),
    }
}
