//! TOML configuration parsing and validation.
//!
//! Every section except `[db]` is optional and falls back to the defaults
//! below, so a minimal file only names the database path.

use anyhow::{Context, Result};
use chrono::NaiveDate;
use serde::Deserialize;
use std::path::{Path, PathBuf};
use std::time::Duration;

use crate::models::DEFAULT_JURISDICTION;

/// Upper bound for `pipeline.fetch_window_days` (about a century).
pub const MAX_FETCH_WINDOW_DAYS: i64 = 36_500;

#[derive(Debug, Deserialize, Clone)]
pub struct Config {
    pub db: DbConfig,
    #[serde(default)]
    pub source: SourceConfig,
    #[serde(default)]
    pub enrichment: EnrichmentConfig,
    #[serde(default)]
    pub pipeline: PipelineConfig,
    #[serde(default)]
    pub integration: IntegrationConfig,
}

#[derive(Debug, Deserialize, Clone)]
pub struct DbConfig {
    pub path: PathBuf,
}

/// Primary source (OpenParliament API).
#[derive(Debug, Deserialize, Clone)]
pub struct SourceConfig {
    #[serde(default = "default_source_url")]
    pub base_url: String,
    #[serde(default = "default_jurisdiction")]
    pub jurisdiction: String,
    #[serde(default = "default_page_size")]
    pub page_size: usize,
    #[serde(default = "default_timeout_secs")]
    pub timeout_secs: u64,
    #[serde(default = "default_max_retries")]
    pub max_retries: u32,
    #[serde(default = "default_source_interval_ms")]
    pub min_request_interval_ms: u64,
    /// Consecutive failed requests that open the circuit breaker.
    #[serde(default = "default_breaker_threshold")]
    pub circuit_breaker_threshold: u32,
    #[serde(default = "default_breaker_cooldown_secs")]
    pub circuit_breaker_cooldown_secs: u64,
    #[serde(default = "default_user_agent")]
    pub user_agent: String,
}

impl Default for SourceConfig {
    fn default() -> Self {
        Self {
            base_url: default_source_url(),
            jurisdiction: default_jurisdiction(),
            page_size: default_page_size(),
            timeout_secs: default_timeout_secs(),
            max_retries: default_max_retries(),
            min_request_interval_ms: default_source_interval_ms(),
            circuit_breaker_threshold: default_breaker_threshold(),
            circuit_breaker_cooldown_secs: default_breaker_cooldown_secs(),
            user_agent: default_user_agent(),
        }
    }
}

/// Enrichment source (LEGISinfo bill pages).
#[derive(Debug, Deserialize, Clone)]
pub struct EnrichmentConfig {
    #[serde(default = "default_true")]
    pub enabled: bool,
    #[serde(default = "default_enrichment_url")]
    pub base_url: String,
    #[serde(default = "default_concurrency")]
    pub concurrency: usize,
    #[serde(default = "default_timeout_secs")]
    pub timeout_secs: u64,
    #[serde(default = "default_max_retries")]
    pub max_retries: u32,
    #[serde(default = "default_enrichment_interval_ms")]
    pub min_request_interval_ms: u64,
    #[serde(default = "default_true")]
    pub fetch_french: bool,
    #[serde(default = "default_breaker_threshold")]
    pub circuit_breaker_threshold: u32,
    #[serde(default = "default_breaker_cooldown_secs")]
    pub circuit_breaker_cooldown_secs: u64,
    #[serde(default = "default_user_agent")]
    pub user_agent: String,
    #[serde(default)]
    pub selectors: SelectorConfig,
}

impl Default for EnrichmentConfig {
    fn default() -> Self {
        Self {
            enabled: true,
            base_url: default_enrichment_url(),
            concurrency: default_concurrency(),
            timeout_secs: default_timeout_secs(),
            max_retries: default_max_retries(),
            min_request_interval_ms: default_enrichment_interval_ms(),
            fetch_french: true,
            circuit_breaker_threshold: default_breaker_threshold(),
            circuit_breaker_cooldown_secs: default_breaker_cooldown_secs(),
            user_agent: default_user_agent(),
            selectors: SelectorConfig::default(),
        }
    }
}

/// CSS selectors used to pull fields out of a LEGISinfo bill page.
///
/// Comma-separated alternatives are tried as one selector group; the
/// first matching element wins.
#[derive(Debug, Deserialize, Clone)]
pub struct SelectorConfig {
    #[serde(default = "default_status_selector")]
    pub status: String,
    #[serde(default = "default_summary_selector")]
    pub summary: String,
    #[serde(default = "default_sponsor_selector")]
    pub sponsor: String,
    #[serde(default = "default_royal_assent_selector")]
    pub royal_assent: String,
    #[serde(default = "default_subjects_selector")]
    pub subjects: String,
    #[serde(default = "default_committees_selector")]
    pub committees: String,
    #[serde(default = "default_related_selector")]
    pub related_bills: String,
    #[serde(default = "default_legisinfo_id_selector")]
    pub legisinfo_id: String,
}

impl Default for SelectorConfig {
    fn default() -> Self {
        Self {
            status: default_status_selector(),
            summary: default_summary_selector(),
            sponsor: default_sponsor_selector(),
            royal_assent: default_royal_assent_selector(),
            subjects: default_subjects_selector(),
            committees: default_committees_selector(),
            related_bills: default_related_selector(),
            legisinfo_id: default_legisinfo_id_selector(),
        }
    }
}

#[derive(Debug, Deserialize, Clone)]
pub struct PipelineConfig {
    /// Bills introduced before this date are dropped from every batch.
    #[serde(default = "default_min_introduced_date")]
    pub min_introduced_date: NaiveDate,
    /// Fallback look-back window for incremental `recent` runs.
    #[serde(default = "default_fetch_window_days")]
    pub fetch_window_days: i64,
}

impl Default for PipelineConfig {
    fn default() -> Self {
        Self {
            min_introduced_date: default_min_introduced_date(),
            fetch_window_days: default_fetch_window_days(),
        }
    }
}

#[derive(Debug, Deserialize, Clone)]
pub struct IntegrationConfig {
    #[serde(default = "default_source_name")]
    pub source_name: String,
    #[serde(default = "default_error_summary_limit")]
    pub error_summary_limit: usize,
}

impl Default for IntegrationConfig {
    fn default() -> Self {
        Self {
            source_name: default_source_name(),
            error_summary_limit: default_error_summary_limit(),
        }
    }
}

fn default_source_url() -> String {
    "https://api.openparliament.ca".to_string()
}
fn default_enrichment_url() -> String {
    "https://www.parl.ca/legisinfo".to_string()
}
fn default_jurisdiction() -> String {
    DEFAULT_JURISDICTION.to_string()
}
fn default_user_agent() -> String {
    concat!("billsync/", env!("CARGO_PKG_VERSION")).to_string()
}
fn default_page_size() -> usize {
    20
}
fn default_timeout_secs() -> u64 {
    30
}
fn default_max_retries() -> u32 {
    3
}
fn default_source_interval_ms() -> u64 {
    500
}
fn default_enrichment_interval_ms() -> u64 {
    250
}
fn default_breaker_threshold() -> u32 {
    5
}
fn default_breaker_cooldown_secs() -> u64 {
    120
}
fn default_concurrency() -> usize {
    4
}
fn default_true() -> bool {
    true
}
fn default_min_introduced_date() -> NaiveDate {
    NaiveDate::from_ymd_opt(2015, 1, 1).unwrap_or_default()
}
fn default_fetch_window_days() -> i64 {
    3650
}
fn default_source_name() -> String {
    "bill_integration_service".to_string()
}
fn default_error_summary_limit() -> usize {
    10
}
fn default_status_selector() -> String {
    ".bill-status, .bill-latest-activity .status, [data-field='status']".to_string()
}
fn default_summary_selector() -> String {
    ".bill-summary, #bill-summary, [data-field='summary']".to_string()
}
fn default_sponsor_selector() -> String {
    ".bill-sponsor a, .sponsor-name, [data-field='sponsor']".to_string()
}
fn default_royal_assent_selector() -> String {
    ".royal-assent, [data-field='royal-assent']".to_string()
}
fn default_subjects_selector() -> String {
    ".bill-subjects li, [data-field='subject']".to_string()
}
fn default_committees_selector() -> String {
    ".bill-committees li, [data-field='committee']".to_string()
}
fn default_related_selector() -> String {
    ".related-bills li, [data-field='related-bill']".to_string()
}
fn default_legisinfo_id_selector() -> String {
    "[data-bill-id]".to_string()
}

impl SourceConfig {
    pub fn timeout(&self) -> Duration {
        Duration::from_secs(self.timeout_secs)
    }

    pub fn min_request_interval(&self) -> Duration {
        Duration::from_millis(self.min_request_interval_ms)
    }

    pub fn circuit_breaker_cooldown(&self) -> Duration {
        Duration::from_secs(self.circuit_breaker_cooldown_secs)
    }
}

impl EnrichmentConfig {
    pub fn timeout(&self) -> Duration {
        Duration::from_secs(self.timeout_secs)
    }

    pub fn min_request_interval(&self) -> Duration {
        Duration::from_millis(self.min_request_interval_ms)
    }

    pub fn circuit_breaker_cooldown(&self) -> Duration {
        Duration::from_secs(self.circuit_breaker_cooldown_secs)
    }
}

impl Config {
    /// Defaults for every section, with the database under `./data`.
    pub fn minimal() -> Self {
        Self {
            db: DbConfig {
                path: PathBuf::from("./data/billsync.sqlite"),
            },
            source: SourceConfig::default(),
            enrichment: EnrichmentConfig::default(),
            pipeline: PipelineConfig::default(),
            integration: IntegrationConfig::default(),
        }
    }

    pub fn validate(&self) -> Result<()> {
        if self.source.page_size == 0 {
            anyhow::bail!("source.page_size must be > 0");
        }
        if self.source.timeout_secs == 0 {
            anyhow::bail!("source.timeout_secs must be > 0");
        }
        if self.source.jurisdiction.trim().is_empty() {
            anyhow::bail!("source.jurisdiction must not be empty");
        }
        if !self.source.base_url.starts_with("http") {
            anyhow::bail!(
                "source.base_url must be an http(s) URL, got '{}'",
                self.source.base_url
            );
        }
        if self.enrichment.enabled {
            if self.enrichment.concurrency == 0 {
                anyhow::bail!("enrichment.concurrency must be >= 1");
            }
            if self.enrichment.timeout_secs == 0 {
                anyhow::bail!("enrichment.timeout_secs must be > 0");
            }
            if !self.enrichment.base_url.starts_with("http") {
                anyhow::bail!(
                    "enrichment.base_url must be an http(s) URL, got '{}'",
                    self.enrichment.base_url
                );
            }
        }
        if !(1..=MAX_FETCH_WINDOW_DAYS).contains(&self.pipeline.fetch_window_days) {
            anyhow::bail!(
                "pipeline.fetch_window_days must be between 1 and {}, got {}",
                MAX_FETCH_WINDOW_DAYS,
                self.pipeline.fetch_window_days
            );
        }
        if self.integration.error_summary_limit == 0 {
            anyhow::bail!("integration.error_summary_limit must be >= 1");
        }
        if self.integration.source_name.trim().is_empty() {
            anyhow::bail!("integration.source_name must not be empty");
        }
        Ok(())
    }
}

pub fn load_config(path: &Path) -> Result<Config> {
    let content = std::fs::read_to_string(path)
        .with_context(|| format!("Failed to read config file: {}", path.display()))?;

    let config: Config = toml::from_str(&content).with_context(|| "Failed to parse config file")?;
    config.validate()?;

    Ok(config)
}
