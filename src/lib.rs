//! # parliament-ingest
//!
//! Ingestion pipeline for parliamentary bills.
//!
//! Bills are fetched from the OpenParliament API, optionally enriched from
//! LEGISinfo bill pages, reconciled into SQLite by natural key and every run
//! is recorded in an append-only fetch log.
//!
//! ## Architecture
//!
//! ```text
//! ┌────────────────┐   ┌──────────────┐   ┌────────────────────┐
//! │ Source adapter │──▶│   Pipeline   │──▶│ IntegrationService │
//! │ (OpenParl.)    │   │ dedup/filter │   │  upsert per bill   │
//! └────────────────┘   │   /enrich    │   └─────────┬──────────┘
//! ┌────────────────┐   └──────▲───────┘             │
//! │ Scraper        │──────────┘             ┌───────┴────────┐
//! │ (LEGISinfo)    │                        ▼                ▼
//! └────────────────┘                   ┌─────────┐     ┌────────────┐
//!                                      │  bills  │     │ fetch_logs │
//!                                      └─────────┘     └────────────┘
//! ```
//!
//! ## Modules
//!
//! | Module | Purpose |
//! |--------|---------|
//! | [`config`] | TOML configuration parsing |
//! | [`models`] | Bills, natural keys, selections, item errors |
//! | [`traits`] | `BillSource` and `BillEnricher` seams |
//! | [`adapter`] | OpenParliament source adapter |
//! | [`enrich`] | LEGISinfo enrichment scraper |
//! | [`http`] | Retry, backoff and request pacing |
//! | [`pipeline`] | Fetch, dedup, filter and enrich |
//! | [`store`] | Bill repository (SQLite and in-memory) |
//! | [`fetch_log`] | Run audit records |
//! | [`service`] | Integration service |
//! | [`window`] | Incremental fetch window |
//! | [`monitor`] | Run health aggregation |
//! | [`db`] | Database connection |
//! | [`migrate`] | Schema migrations |

pub mod adapter;
pub mod config;
pub mod db;
pub mod enrich;
pub mod error;
pub mod fetch_log;
pub mod get;
pub mod http;
pub mod ingest;
pub mod migrate;
pub mod models;
pub mod monitor;
pub mod pipeline;
pub mod service;
pub mod stats;
pub mod store;
pub mod traits;
pub mod window;
