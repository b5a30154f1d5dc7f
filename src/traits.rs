//! Seams between the pipeline and its external sources.
//!
//! The pipeline only talks to a [`BillSource`] and a [`BillEnricher`].
//! The built-in implementations are
//! [`OpenParliamentAdapter`](crate::adapter::OpenParliamentAdapter) and
//! [`LegisInfoScraper`](crate::enrich::LegisInfoScraper); tests and
//! alternative feeds plug in their own.
//!
//! ```text
//! ┌────────────────┐   ┌────────────────┐
//! │  BillSource    │   │  BillEnricher  │
//! │ (paged fetch)  │   │ (per-bill page)│
//! └───────┬────────┘   └───────┬────────┘
//!         └──────────┬─────────┘
//!                    ▼
//!             Pipeline::run()
//! ```

use async_trait::async_trait;
use futures::stream::BoxStream;

use crate::error::SourceError;
use crate::http::HttpStats;
use crate::models::{Bill, BillEnrichment, ItemError, NaturalKey, Selection};

/// A primary bill feed.
///
/// # Example
///
/// ```rust
/// use futures::stream::{self, BoxStream, StreamExt};
/// use parliament_ingest::models::{Bill, ItemError, Selection};
/// use parliament_ingest::traits::BillSource;
///
/// pub struct FixedSource(Vec<Bill>);
///
/// impl BillSource for FixedSource {
///     fn name(&self) -> &str { "fixed" }
///
///     fn fetch<'a>(&'a self, _selection: &'a Selection) -> BoxStream<'a, Result<Bill, ItemError>> {
///         stream::iter(self.0.clone().into_iter().map(Ok)).boxed()
///     }
/// }
/// ```
pub trait BillSource: Send + Sync {
    /// Source identifier used in logs.
    fn name(&self) -> &str;

    /// Lazily walk the source for `selection`.
    ///
    /// The stream is finite. Each element is either a complete base
    /// [`Bill`] or the failure of one item (or one page). A failure never
    /// ends the stream early unless the source cannot reach further pages.
    fn fetch<'a>(&'a self, selection: &'a Selection) -> BoxStream<'a, Result<Bill, ItemError>>;

    /// Cumulative request counters, for sources that talk HTTP.
    fn http_stats(&self) -> Option<HttpStats> {
        None
    }
}

/// Result of a successful enrichment lookup.
#[derive(Debug, Clone, PartialEq)]
pub enum Enrichment {
    Found(BillEnrichment),
    /// The page was reachable (or absent) but had nothing to add.
    NoNewData,
}

/// A secondary, per-bill metadata source.
#[async_trait]
pub trait BillEnricher: Send + Sync {
    fn name(&self) -> &str;

    /// Look up supplementary data for one bill.
    ///
    /// Errors are returned only after the implementation's own retries
    /// are exhausted.
    async fn enrich(&self, key: &NaturalKey) -> Result<Enrichment, SourceError>;

    fn http_stats(&self) -> Option<HttpStats> {
        None
    }
}
