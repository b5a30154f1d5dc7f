//! `billsync sync`: wire the pipeline to the SQLite store and run it once.
//!
//! ```text
//! OpenParliamentAdapter ─┐
//!                        ├─▶ Pipeline ─▶ IntegrationService ─▶ SqliteStore
//! LegisInfoScraper ──────┘                                   (bills + fetch_logs)
//! ```

use std::sync::Arc;

use anyhow::{bail, Result};
use chrono::{NaiveDate, Utc};
use tracing::warn;

use crate::adapter::OpenParliamentAdapter;
use crate::config::Config;
use crate::db;
use crate::enrich::LegisInfoScraper;
use crate::error::IntegrationError;
use crate::migrate;
use crate::models::Selection;
use crate::pipeline::{Pipeline, PipelineRequest, PipelineSettings};
use crate::service::{IntegrationResult, IntegrationService, ServiceSettings};
use crate::store::SqliteStore;
use crate::traits::BillEnricher;

/// Arguments shared by both `sync` subcommands.
#[derive(Debug, Clone)]
pub struct SyncOptions {
    pub selection: Selection,
    pub enrich: bool,
    /// Explicit `--since`; `recent` runs derive a window when absent.
    pub since: Option<NaiveDate>,
}

/// Build a service over `store` with the HTTP source and scraper from `config`.
pub fn build_service(config: &Config, store: Arc<SqliteStore>) -> Result<IntegrationService> {
    let source = Arc::new(OpenParliamentAdapter::new(&config.source)?);
    let enricher: Option<Arc<dyn BillEnricher>> = if config.enrichment.enabled {
        Some(Arc::new(LegisInfoScraper::new(&config.enrichment)?))
    } else {
        None
    };
    let pipeline = Pipeline::new(source, enricher, PipelineSettings::from_config(config));
    Ok(IntegrationService::new(
        pipeline,
        store.clone(),
        store,
        ServiceSettings::from_config(config),
    ))
}

pub fn parse_date(raw: &str) -> Result<NaiveDate> {
    match NaiveDate::parse_from_str(raw, "%Y-%m-%d") {
        Ok(date) => Ok(date),
        Err(_) => bail!("invalid date '{}', expected YYYY-MM-DD", raw),
    }
}

pub async fn run_sync(config: &Config, options: SyncOptions) -> Result<()> {
    let pool = db::connect(config).await?;
    migrate::apply(&pool).await?;
    let store = Arc::new(SqliteStore::new(pool.clone()));
    let service = build_service(config, store)?;

    let mut selection = options.selection;
    if selection.parliament_session().is_none() || options.since.is_some() {
        selection = service
            .incremental_selection(selection, options.since, Utc::now().date_naive(), &config.pipeline)
            .await?;
    }
    if !config.enrichment.enabled && options.enrich {
        warn!("enrichment disabled in config, running without it");
    }
    let request = PipelineRequest {
        selection,
        enrich: options.enrich && config.enrichment.enabled,
    };

    let outcome = tokio::select! {
        outcome = service.run(&request) => outcome,
        _ = tokio::signal::ctrl_c() => {
            pool.close().await;
            bail!("sync interrupted; bills persisted so far are kept, no fetch log written");
        }
    };
    pool.close().await;

    match outcome {
        Ok(result) => {
            print_result(&request, &result);
            Ok(())
        }
        Err(IntegrationError::Fatal {
            message,
            fetch_log_id,
        }) => {
            println!("sync {}", request.selection.mode_name());
            println!("  status: failure");
            if let Some(id) = fetch_log_id {
                println!("  fetch log: #{}", id);
            }
            bail!("sync aborted: {}", message)
        }
        Err(e) => Err(e.into()),
    }
}

fn print_result(request: &PipelineRequest, result: &IntegrationResult) {
    let selection = &request.selection;
    match selection.parliament_session() {
        Some((p, s)) => println!("sync session {}-{}", p, s),
        None => println!("sync recent"),
    }
    if let Some(after) = selection.introduced_after {
        println!("  introduced after: {}", after);
    }
    println!("  run: {}", result.run_id);
    println!("  attempted: {}", result.attempted);
    println!("  created: {}", result.created);
    println!(
        "  updated: {} ({} unchanged)",
        result.updated, result.unchanged
    );
    println!("  failed: {}", result.failed);
    println!("  errors: {}", result.error_count);
    println!("  duration: {:.2}s", result.duration.as_secs_f64());
    println!("  fetch log: #{}", result.fetch_log_id);
    for err in result.errors.iter().take(10) {
        println!("    {}", err);
    }
    if result.errors.len() > 10 {
        println!("    ... {} more", result.errors.len() - 10);
    }
    println!("{}", result.status);
}
