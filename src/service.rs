//! Integration service: pipeline → repository → fetch log.
//!
//! # Run Lifecycle
//!
//! ```text
//! NotStarted → Fetching → Enriching → Persisting → Logged
//! ```
//!
//! Every bill is upserted on its own, so one bad record never blocks the
//! others. Exactly one [`FetchLog`](crate::fetch_log::FetchLog) is written
//! per run, after processing, whatever happened before it.
//!
//! # Counting
//!
//! | Field | Meaning |
//! |-------|---------|
//! | `attempted` | unique bills that entered the batch + fetch failures |
//! | `succeeded` | created + updated (unchanged rows count as updated) |
//! | `failed` | fetch failures + rejected writes + bills skipped by an abort |
//!
//! `succeeded + failed == attempted` for every run. Enrichment failures
//! count towards `error_count` only, since the bill is still stored.
//!
//! # Cancellation
//!
//! Dropping the future returned by [`IntegrationService::run`] between
//! upserts is safe: each upsert commits on its own and nothing else has
//! been written yet. The fetch log of a cancelled run is never written.

use std::sync::{Arc, Mutex as StdMutex};
use std::time::{Duration, Instant};

use chrono::NaiveDate;
use serde::Serialize;
use serde_json::json;
use tokio::sync::Mutex;
use tracing::{error, info, info_span, warn, Instrument};

use crate::config::{Config, PipelineConfig};
use crate::error::{IntegrationError, RepositoryError};
use crate::fetch_log::{FetchLogRepository, NewFetchLog, RecordCounts};
use crate::http::HttpStats;
use crate::models::{ErrorKind, ItemError, RunStatus, Selection};
use crate::pipeline::{Pipeline, PipelineRequest, PipelineResult};
use crate::store::{BillRepository, UpsertStatus};
use crate::window::derive_introduced_after;

#[derive(Debug, Clone)]
pub struct ServiceSettings {
    /// `source` column of every fetch log this service writes.
    pub source_name: String,
    pub error_summary_limit: usize,
}

impl ServiceSettings {
    pub fn from_config(config: &Config) -> Self {
        Self {
            source_name: config.integration.source_name.clone(),
            error_summary_limit: config.integration.error_summary_limit,
        }
    }
}

#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize)]
#[serde(rename_all = "snake_case")]
pub enum RunPhase {
    NotStarted,
    Fetching,
    Enriching,
    Persisting,
    Logged,
}

impl RunPhase {
    pub fn as_str(&self) -> &'static str {
        match self {
            RunPhase::NotStarted => "not_started",
            RunPhase::Fetching => "fetching",
            RunPhase::Enriching => "enriching",
            RunPhase::Persisting => "persisting",
            RunPhase::Logged => "logged",
        }
    }
}

/// Outcome of one completed run.
#[derive(Debug, Clone, Serialize)]
pub struct IntegrationResult {
    pub run_id: String,
    pub attempted: usize,
    pub created: usize,
    pub updated: usize,
    /// Subset of `updated` whose stored content did not change.
    pub unchanged: usize,
    pub failed: usize,
    pub error_count: usize,
    pub status: RunStatus,
    pub duration: Duration,
    pub fetch_log_id: i64,
    pub errors: Vec<ItemError>,
}

impl IntegrationResult {
    pub fn succeeded(&self) -> usize {
        self.created + self.updated
    }
}

#[derive(Default)]
struct PersistTally {
    created: usize,
    updated: usize,
    unchanged: usize,
    failed: usize,
    fatal: Option<String>,
}

pub struct IntegrationService {
    pipeline: Pipeline,
    bills: Arc<dyn BillRepository>,
    logs: Arc<dyn FetchLogRepository>,
    settings: ServiceSettings,
    run_lock: Mutex<()>,
    phase: StdMutex<RunPhase>,
}

impl IntegrationService {
    pub fn new(
        pipeline: Pipeline,
        bills: Arc<dyn BillRepository>,
        logs: Arc<dyn FetchLogRepository>,
        settings: ServiceSettings,
    ) -> Self {
        Self {
            pipeline,
            bills,
            logs,
            settings,
            run_lock: Mutex::new(()),
            phase: StdMutex::new(RunPhase::NotStarted),
        }
    }

    /// Phase of the current (or last) run.
    pub fn phase(&self) -> RunPhase {
        self.phase
            .lock()
            .map(|p| *p)
            .unwrap_or(RunPhase::NotStarted)
    }

    fn enter(&self, phase: RunPhase) {
        if let Ok(mut current) = self.phase.lock() {
            *current = phase;
        }
        info!(phase = phase.as_str(), "run phase");
    }

    /// Fill in `introduced_after` for an incremental run.
    ///
    /// See [`derive_introduced_after`] for the precedence rules.
    pub async fn incremental_selection(
        &self,
        selection: Selection,
        explicit: Option<NaiveDate>,
        today: NaiveDate,
        pipeline: &PipelineConfig,
    ) -> Result<Selection, RepositoryError> {
        let (parliament, session) = match selection.parliament_session() {
            Some((p, s)) => (Some(p), Some(s)),
            None => (None, None),
        };
        let last = if explicit.is_none() {
            self.logs
                .last_successful_params(&self.settings.source_name, parliament, session)
                .await?
        } else {
            None
        };
        let after = derive_introduced_after(
            explicit,
            last.as_ref(),
            today,
            pipeline.fetch_window_days,
            pipeline.min_introduced_date,
        );
        Ok(selection.introduced_after(after))
    }

    /// Execute one run and write its fetch log.
    ///
    /// Runs on the same service are serialized. Only a run-level abort
    /// ([`IntegrationError::Fatal`]) or a failed log write is returned as
    /// an error; per-item failures are reported in the result.
    pub async fn run(&self, request: &PipelineRequest) -> Result<IntegrationResult, IntegrationError> {
        let _guard = self.run_lock.lock().await;
        let run_id = uuid::Uuid::new_v4().to_string();
        let span = info_span!(
            "integration_run",
            run_id = %run_id,
            mode = request.selection.mode_name(),
            source = self.pipeline.source_name()
        );
        self.run_inner(request, run_id).instrument(span).await
    }

    async fn run_inner(
        &self,
        request: &PipelineRequest,
        run_id: String,
    ) -> Result<IntegrationResult, IntegrationError> {
        let started = Instant::now();

        self.enter(RunPhase::Fetching);
        let batch = self.pipeline.fetch(&request.selection).await;

        self.enter(RunPhase::Enriching);
        let result = self.pipeline.enrich(batch, request.enrich).await;

        self.enter(RunPhase::Persisting);
        let mut errors = result.errors.clone();
        let tally = self.persist(&result, &mut errors).await;

        let attempted = result.attempted();
        let succeeded = tally.created + tally.updated;
        let failed = result.fetch_failures + tally.failed;
        let status = if tally.fatal.is_some() {
            RunStatus::Failure
        } else {
            RunStatus::classify(succeeded, errors.len())
        };
        let duration = started.elapsed();

        let params = fetch_params(request, &run_id, &result, tally.unchanged);
        let counts = RecordCounts {
            attempted,
            succeeded,
            failed,
        };
        let log = NewFetchLog::new(
            self.settings.source_name.clone(),
            status,
            counts,
            duration.as_secs_f64(),
            params,
            &errors,
            self.settings.error_summary_limit,
        )
        .map_err(IntegrationError::LogWrite)?;

        let log = match self.logs.record(log).await {
            Ok(log) => log,
            Err(e) => {
                error!(error = %e, "failed to write fetch log");
                return Err(IntegrationError::LogWrite(e));
            }
        };
        self.enter(RunPhase::Logged);

        info!(
            status = status.as_str(),
            attempted,
            created = tally.created,
            updated = tally.updated,
            unchanged = tally.unchanged,
            failed,
            errors = errors.len(),
            fetch_log_id = log.id,
            duration_ms = duration.as_millis() as u64,
            "run complete"
        );

        if let Some(message) = tally.fatal {
            return Err(IntegrationError::Fatal {
                message,
                fetch_log_id: Some(log.id),
            });
        }

        Ok(IntegrationResult {
            run_id,
            attempted,
            created: tally.created,
            updated: tally.updated,
            unchanged: tally.unchanged,
            failed,
            error_count: errors.len(),
            status,
            duration,
            fetch_log_id: log.id,
            errors,
        })
    }

    async fn persist(&self, result: &PipelineResult, errors: &mut Vec<ItemError>) -> PersistTally {
        let mut tally = PersistTally::default();

        for (index, bill) in result.bills.iter().enumerate() {
            let key = bill.natural_key();
            match self.bills.upsert(bill).await {
                Ok(outcome) => match outcome.status {
                    UpsertStatus::Created => tally.created += 1,
                    UpsertStatus::Updated => tally.updated += 1,
                    UpsertStatus::Unchanged => {
                        tally.updated += 1;
                        tally.unchanged += 1;
                    }
                },
                Err(RepositoryError::Unavailable(message)) => {
                    let skipped = result.bills.len() - index;
                    error!(bill = %key, error = %message, skipped, "store unavailable, aborting run");
                    errors.push(ItemError::for_subject(
                        "run",
                        ErrorKind::Fatal,
                        format!("store unavailable: {}; {} bills not persisted", message, skipped),
                    ));
                    tally.failed += skipped;
                    tally.fatal = Some(message);
                    break;
                }
                Err(e) => {
                    warn!(bill = %key, error = %e, "bill not persisted");
                    errors.push(ItemError::for_key(&key, e.kind(), e.to_string()));
                    tally.failed += 1;
                }
            }
        }
        tally
    }
}

fn fetch_params(
    request: &PipelineRequest,
    run_id: &str,
    result: &PipelineResult,
    unchanged: usize,
) -> serde_json::Value {
    let selection = &request.selection;
    let (parliament, session) = match selection.parliament_session() {
        Some((p, s)) => (Some(p), Some(s)),
        None => (None, None),
    };
    let dates = result.bills.iter().filter_map(|b| b.introduced_date);
    let min_introduced = dates.clone().min().map(|d| d.to_string());
    let max_introduced = dates.max().map(|d| d.to_string());

    json!({
        "run_id": run_id,
        "mode": selection.mode_name(),
        "parliament": parliament,
        "session": session,
        "limit": selection.limit(),
        "enrich": request.enrich,
        "introduced_after": selection.introduced_after.map(|d| d.to_string()),
        "result_summary": {
            "fetched": result.fetched,
            "duplicates_skipped": result.duplicates_skipped,
            "filtered_out": result.filtered_out,
            "enriched": result.enriched,
            "enrichment_empty": result.enrichment_empty,
            "unchanged": unchanged,
            "min_introduced_date": min_introduced,
            "max_introduced_date": max_introduced,
            "http_retries": result.source_http.retries() + result.enrichment_http.retries(),
            "http": {
                "source": http_summary(&result.source_http),
                "enrichment": http_summary(&result.enrichment_http),
            },
        }
    })
}

fn http_summary(stats: &HttpStats) -> serde_json::Value {
    json!({
        "requests": stats.requests,
        "retries_429": stats.retries_429,
        "retries_5xx": stats.retries_5xx,
        "retries_other": stats.retries_other,
        "circuit_rejections": stats.circuit_rejections,
        "avg_latency_ms": stats.avg_latency_ms(),
    })
}
