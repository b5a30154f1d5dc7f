//! OpenParliament bill adapter.
//!
//! Walks `GET /bills/?format=json` page by page, following
//! `pagination.next_url`, and resolves every listed bill through its detail
//! endpoint to obtain bilingual titles, short titles, status and sponsor.
//!
//! # Failure Handling
//!
//! | Failure | Result |
//! |---------|--------|
//! | List page fails after retries | one page error, walk resumes at the next offset |
//! | Three list pages fail in a row | one error each, stream ends |
//! | List entry without number/session | `malformed` item error, skipped |
//! | Detail request fails after retries | item error for that bill |
//! | Detail returns 404 | `permanent` item error for that bill |

use std::collections::VecDeque;

use chrono::{NaiveDate, Utc};
use futures::stream::{self, BoxStream, StreamExt};
use serde::Deserialize;
use tracing::{debug, info, warn};

use crate::config::SourceConfig;
use crate::error::SourceError;
use crate::http::{self, CircuitBreaker, Fetched, HttpFetcher, HttpStats, RetryPolicy};
use crate::models::{Bill, ErrorKind, ItemError, NaturalKey, Selection, SelectionMode};
use crate::traits::BillSource;

#[derive(Debug, Deserialize)]
struct BillPage {
    #[serde(default)]
    objects: Vec<serde_json::Value>,
    #[serde(default)]
    pagination: Option<Pagination>,
}

#[derive(Debug, Deserialize)]
struct Pagination {
    next_url: Option<String>,
}

#[derive(Debug, Default, Deserialize)]
struct LangText {
    en: Option<String>,
    fr: Option<String>,
}

/// One row of the bill listing.
#[derive(Debug, Deserialize)]
struct ListEntry {
    number: Option<String>,
    session: Option<String>,
    url: Option<String>,
    #[serde(default)]
    name: Option<LangText>,
}

/// Full bill record from the detail endpoint. Every field is optional.
#[derive(Debug, Deserialize)]
struct BillDetail {
    #[serde(default)]
    name: Option<LangText>,
    #[serde(default)]
    short_title: Option<LangText>,
    introduced: Option<String>,
    legisinfo_id: Option<i64>,
    status_code: Option<String>,
    #[serde(default)]
    status: Option<LangText>,
    sponsor_politician_id: Option<i64>,
    sponsor_politician_name: Option<String>,
}

/// Parse an OpenParliament session slug such as `44-1`.
pub fn parse_session_code(code: &str) -> Option<(i32, i32)> {
    let (parliament, session) = code.trim().split_once('-')?;
    Some((parliament.parse().ok()?, session.parse().ok()?))
}

fn non_empty(value: Option<String>) -> Option<String> {
    value.map(|v| v.trim().to_string()).filter(|v| !v.is_empty())
}

fn parse_date(value: Option<&str>) -> Option<NaiveDate> {
    let value = value?.trim();
    NaiveDate::parse_from_str(value.get(..10).unwrap_or(value), "%Y-%m-%d").ok()
}

/// Bill source backed by the OpenParliament JSON API.
pub struct OpenParliamentAdapter {
    http: HttpFetcher,
    base_url: String,
    jurisdiction: String,
    page_size: usize,
}

impl OpenParliamentAdapter {
    pub fn new(config: &SourceConfig) -> anyhow::Result<Self> {
        let http = HttpFetcher::new(
            "openparliament",
            config.timeout(),
            &config.user_agent,
            config.min_request_interval(),
            RetryPolicy::new(config.max_retries),
            CircuitBreaker::new(
                config.circuit_breaker_threshold,
                config.circuit_breaker_cooldown(),
            ),
        )?;
        Ok(Self {
            http,
            base_url: config.base_url.trim_end_matches('/').to_string(),
            jurisdiction: config.jurisdiction.clone(),
            page_size: config.page_size,
        })
    }

    /// Replace the retry policy (tests use [`RetryPolicy::immediate`]).
    pub fn with_retry_policy(mut self, retry: RetryPolicy) -> Self {
        self.http = self.http.with_retry_policy(retry);
        self
    }

    pub fn with_circuit_breaker(mut self, breaker: CircuitBreaker) -> Self {
        self.http = self.http.with_circuit_breaker(breaker);
        self
    }

    fn page_size_for(&self, selection: &Selection) -> usize {
        match selection.limit() {
            Some(limit) if limit > 0 => self.page_size.min(limit),
            _ => self.page_size,
        }
    }

    fn first_page_url(&self, selection: &Selection) -> String {
        self.page_url(selection, 0)
    }

    /// Listing URL for the page starting at `offset`.
    fn page_url(&self, selection: &Selection, offset: usize) -> String {
        let mut url = format!(
            "{}/bills/?format=json&limit={}&offset={}",
            self.base_url,
            self.page_size_for(selection),
            offset
        );
        if let SelectionMode::Session {
            parliament, session, ..
        } = &selection.mode
        {
            url.push_str(&format!("&session={}-{}", parliament, session));
        }
        if let Some(after) = selection.introduced_after {
            url.push_str(&format!("&introduced__gte={}", after.format("%Y-%m-%d")));
        }
        url
    }

    async fn get_json<T: serde::de::DeserializeOwned>(
        &self,
        url: &str,
    ) -> Result<Option<T>, SourceError> {
        match self.http.get(url).await? {
            Fetched::NotFound => Ok(None),
            Fetched::Ok(body) => {
                serde_json::from_str(&body)
                    .map(Some)
                    .map_err(|e| SourceError::Malformed {
                        url: url.to_string(),
                        message: e.to_string(),
                    })
            }
        }
    }

    async fn load_page(&self, url: &str, state: &mut PageState) -> Result<(), SourceError> {
        let page: BillPage = self.get_json(url).await?.ok_or_else(|| SourceError::Permanent {
            url: url.to_string(),
            status: 404,
        })?;
        debug!(url, entries = page.objects.len(), "loaded bill page");
        state.pending.extend(page.objects);
        state.next_url = page
            .pagination
            .and_then(|p| p.next_url)
            .map(|next| http::join_url(&self.base_url, &next));
        state.offset += state.page_size;
        state.failed_pages = 0;
        Ok(())
    }

    fn entry_key(&self, entry: &ListEntry) -> Option<NaturalKey> {
        let number = non_empty(entry.number.clone())?;
        let (parliament, session) = parse_session_code(entry.session.as_deref()?)?;
        Some(NaturalKey::new(
            self.jurisdiction.clone(),
            parliament,
            session,
            number,
        ))
    }

    async fn resolve(&self, raw: serde_json::Value) -> Result<Bill, ItemError> {
        let entry: ListEntry = serde_json::from_value(raw.clone()).map_err(|e| {
            ItemError::for_subject(
                summarize_raw(&raw),
                ErrorKind::Malformed,
                format!("undecodable list entry: {}", e),
            )
        })?;
        let key = self.entry_key(&entry).ok_or_else(|| {
            ItemError::for_subject(
                summarize_raw(&raw),
                ErrorKind::Malformed,
                "list entry missing bill number or session",
            )
        })?;

        let detail_path = entry
            .url
            .clone()
            .unwrap_or_else(|| format!("/bills/{}/{}/", key.session_code(), key.number));
        let detail_url = format!(
            "{}?format=json",
            http::join_url(&self.base_url, &detail_path)
        );

        let detail: BillDetail = match self.get_json(&detail_url).await {
            Ok(Some(detail)) => detail,
            Ok(None) => {
                return Err(ItemError::for_key(
                    &key,
                    ErrorKind::Permanent,
                    format!("{} returned 404", detail_url),
                ))
            }
            Err(e) => return Err(ItemError::for_key(&key, e.kind(), e.to_string())),
        };

        build_bill(key, entry, detail)
    }
}

fn summarize_raw(raw: &serde_json::Value) -> String {
    let text = raw.to_string();
    let short: String = text.chars().take(80).collect();
    format!("entry {}", short)
}

fn build_bill(key: NaturalKey, entry: ListEntry, detail: BillDetail) -> Result<Bill, ItemError> {
    let name = detail.name.unwrap_or_default();
    let listed = entry.name.unwrap_or_default();
    let short = detail.short_title.unwrap_or_default();
    let status = detail.status.unwrap_or_default();

    let title_en = non_empty(name.en)
        .or_else(|| non_empty(listed.en))
        .or_else(|| non_empty(short.en.clone()))
        .ok_or_else(|| ItemError::for_key(&key, ErrorKind::Malformed, "bill has no English title"))?;

    let mut bill = Bill::new(key, title_en, Utc::now());
    bill.title_fr = non_empty(name.fr).or_else(|| non_empty(listed.fr));
    bill.short_title_en = non_empty(short.en);
    bill.short_title_fr = non_empty(short.fr);
    bill.introduced_date = parse_date(detail.introduced.as_deref());
    bill.law_status = non_empty(detail.status_code).or_else(|| non_empty(status.en));
    bill.legisinfo_id = detail.legisinfo_id;
    bill.sponsor_politician_id = detail.sponsor_politician_id;
    bill.sponsor_politician_name = non_empty(detail.sponsor_politician_name);
    Ok(bill)
}

/// Listing pages that may fail in a row before the walk gives up.
const MAX_CONSECUTIVE_PAGE_FAILURES: u32 = 3;

/// Cursor over the listing.
struct PageState {
    next_url: Option<String>,
    pending: VecDeque<serde_json::Value>,
    taken: usize,
    limit: Option<usize>,
    offset: usize,
    page_size: usize,
    /// Consecutive listing pages that failed.
    failed_pages: u32,
    done: bool,
}

impl PageState {
    /// Whether the listing should be walked past a failed page.
    ///
    /// Only transient failures are skipped, and only while the offset is
    /// still inside the selection limit. Repeated failures end the walk.
    fn can_skip_page(&self, err: &SourceError) -> bool {
        err.is_transient()
            && self.failed_pages < MAX_CONSECUTIVE_PAGE_FAILURES
            && self.limit.map_or(true, |limit| self.offset < limit)
    }
}

impl BillSource for OpenParliamentAdapter {
    fn name(&self) -> &str {
        "openparliament"
    }

    fn http_stats(&self) -> Option<HttpStats> {
        Some(self.http.stats())
    }

    fn fetch<'a>(&'a self, selection: &'a Selection) -> BoxStream<'a, Result<Bill, ItemError>> {
        let first = self.first_page_url(selection);
        info!(url = %first, mode = selection.mode_name(), "fetching bills");

        let state = PageState {
            next_url: Some(first),
            pending: VecDeque::new(),
            taken: 0,
            limit: selection.limit(),
            offset: 0,
            page_size: self.page_size_for(selection),
            failed_pages: 0,
            done: false,
        };

        stream::unfold(state, move |mut state| async move {
            loop {
                if state.done || state.limit.is_some_and(|limit| state.taken >= limit) {
                    return None;
                }
                if let Some(raw) = state.pending.pop_front() {
                    state.taken += 1;
                    let item = self.resolve(raw).await;
                    if let Err(e) = &item {
                        warn!(subject = %e.subject, error = %e.message, "bill fetch failed");
                    }
                    return Some((item, state));
                }
                if state.limit.is_some_and(|limit| state.offset >= limit) {
                    return None;
                }
                let url = state.next_url.take()?;
                if let Err(e) = self.load_page(&url, &mut state).await {
                    let err = ItemError::for_subject(
                        format!("page offset={}", state.offset),
                        e.kind(),
                        e.to_string(),
                    );
                    warn!(subject = %err.subject, error = %err.message, "bill page failed");

                    // The listing is offset-paged, so the walk resumes at the
                    // next page even without the failed page's cursor.
                    state.failed_pages += 1;
                    state.offset += state.page_size;
                    if state.can_skip_page(&e) {
                        state.next_url = Some(self.page_url(selection, state.offset));
                    } else {
                        state.done = true;
                    }
                    return Some((Err(err), state));
                }
            }
        })
        .boxed()
    }
}
