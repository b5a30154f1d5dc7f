//! Source adapter and scraper against an in-process fake of the
//! OpenParliament API and LEGISinfo bill pages.

use std::collections::HashMap;
use std::sync::{Arc, Mutex};
use std::time::Duration;

use axum::extract::{Path, Query, State};
use axum::body::{Body, Bytes};
use axum::http::{header, StatusCode};
use axum::response::{Html, IntoResponse, Response};
use axum::routing::get;
use axum::{Json, Router};
use chrono::NaiveDate;
use futures::{stream, StreamExt};
use serde_json::{json, Value};
use tempfile::TempDir;

use parliament_ingest::adapter::OpenParliamentAdapter;
use parliament_ingest::config::{Config, EnrichmentConfig, SourceConfig};
use parliament_ingest::db;
use parliament_ingest::enrich::LegisInfoScraper;
use parliament_ingest::error::SourceError;
use parliament_ingest::fetch_log::FetchLogRepository;
use parliament_ingest::http::{CircuitBreaker, Fetched, HttpFetcher, RetryPolicy};
use parliament_ingest::migrate;
use parliament_ingest::models::{ErrorKind, NaturalKey, RunStatus, Selection, DEFAULT_JURISDICTION};
use parliament_ingest::pipeline::{Pipeline, PipelineRequest, PipelineSettings};
use parliament_ingest::service::{IntegrationService, ServiceSettings};
use parliament_ingest::store::{BillRepository, InMemoryStore, SqliteStore};
use parliament_ingest::traits::{BillEnricher, BillSource, Enrichment};

// ─── Fake server ────────────────────────────────────────────────────

const BILLS: &[(&str, &str)] = &[
    ("C-2", "2021-11-30"),
    ("C-3", "2021-12-01"),
    ("C-10", "2022-02-03"),
];

#[derive(Clone, Default)]
struct Fake {
    hits: Arc<Mutex<HashMap<String, usize>>>,
    /// Bill number → remaining 503 responses on its detail endpoint.
    flaky: Arc<Mutex<HashMap<String, usize>>>,
    /// Bill numbers whose detail endpoint returns 404.
    missing: Arc<Vec<String>>,
    /// List offset that always returns 500.
    broken_offset: Option<usize>,
    /// Bill numbers (lowercase) whose LEGISinfo page always returns 500.
    legisinfo_down: Arc<Vec<String>>,
}

impl Fake {
    fn hit(&self, path: String) {
        *self.hits.lock().unwrap().entry(path).or_insert(0) += 1;
    }

    fn hits(&self, path: &str) -> usize {
        self.hits.lock().unwrap().get(path).copied().unwrap_or(0)
    }
}

async fn list_bills(State(fake): State<Fake>, Query(q): Query<HashMap<String, String>>) -> Response {
    fake.hit("/bills/".to_string());
    let offset: usize = q.get("offset").and_then(|v| v.parse().ok()).unwrap_or(0);
    let limit: usize = q.get("limit").and_then(|v| v.parse().ok()).unwrap_or(20);
    if fake.broken_offset == Some(offset) {
        return (StatusCode::INTERNAL_SERVER_ERROR, "boom").into_response();
    }

    let objects: Vec<Value> = BILLS
        .iter()
        .skip(offset)
        .take(limit)
        .map(|(number, _)| {
            json!({
                "session": "44-1",
                "number": number,
                "url": format!("/bills/44-1/{}/", number),
                "name": {"en": format!("Listed {}", number)}
            })
        })
        .collect();
    let next = offset + limit;
    let next_url = if next < BILLS.len() {
        Value::String(format!("/bills/?format=json&limit={}&offset={}", limit, next))
    } else {
        Value::Null
    };
    Json(json!({
        "objects": objects,
        "pagination": {"offset": offset, "limit": limit, "next_url": next_url}
    }))
    .into_response()
}

async fn bill_detail(
    State(fake): State<Fake>,
    Path((session, number)): Path<(String, String)>,
) -> Response {
    fake.hit(format!("/bills/{}/{}/", session, number));
    if fake.missing.contains(&number) {
        return StatusCode::NOT_FOUND.into_response();
    }
    {
        let mut flaky = fake.flaky.lock().unwrap();
        if let Some(remaining) = flaky.get_mut(&number) {
            if *remaining > 0 {
                *remaining -= 1;
                return StatusCode::SERVICE_UNAVAILABLE.into_response();
            }
        }
    }
    let introduced = BILLS
        .iter()
        .find(|(n, _)| *n == number)
        .map(|(_, d)| *d)
        .unwrap_or("2022-01-01");
    Json(json!({
        "session": session,
        "number": number,
        "name": {"en": format!("An Act respecting {}", number), "fr": format!("Loi concernant {}", number)},
        "short_title": {"en": "", "fr": ""},
        "introduced": introduced,
        "legisinfo_id": 11000000,
        "status_code": "HouseAt2ndReading",
        "sponsor_politician_name": "Sponsor Name"
    }))
    .into_response()
}

async fn legisinfo_page(
    State(fake): State<Fake>,
    Path((lang, session, number)): Path<(String, String, String)>,
) -> Response {
    fake.hit(format!("/legisinfo/{}/bill/{}/{}", lang, session, number));
    if fake.legisinfo_down.contains(&number) {
        return StatusCode::INTERNAL_SERVER_ERROR.into_response();
    }
    match (lang.as_str(), number.as_str()) {
        ("en", "c-10") => Html(
            r#"<html><body data-bill-id="11410000">
                <p class="bill-status">Royal assent received</p>
                <div class="bill-summary">This enactment amends the Broadcasting Act.</div>
                <ul class="bill-subjects"><li>Broadcasting</li></ul>
                <p class="royal-assent">Royal Assent: April 27, 2023, c. 8</p>
               </body></html>"#,
        )
        .into_response(),
        ("fr", "c-10") => Html(r#"<div class="bill-summary">Le texte modifie la Loi sur la radiodiffusion.</div>"#)
            .into_response(),
        ("en", "c-2") => Html("<html><body><p>Nothing structured here</p></body></html>").into_response(),
        _ => StatusCode::NOT_FOUND.into_response(),
    }
}

async fn throttled(State(fake): State<Fake>) -> Response {
    fake.hit("/throttled".to_string());
    (
        StatusCode::TOO_MANY_REQUESTS,
        [(header::RETRY_AFTER, "3600")],
        "slow down",
    )
        .into_response()
}

/// The first response sends its headers and part of the body, then stalls.
async fn stalled(State(fake): State<Fake>) -> Response {
    fake.hit("/stalled".to_string());
    if fake.hits("/stalled") == 1 {
        let chunks = stream::once(async { Ok::<_, std::io::Error>(Bytes::from_static(b"{\"objects\":")) })
            .chain(stream::pending());
        return Response::new(Body::from_stream(chunks));
    }
    Json(json!({"objects": []})).into_response()
}

async fn serve(fake: Fake) -> String {
    let app = Router::new()
        .route("/throttled", get(throttled))
        .route("/stalled", get(stalled))
        .route("/bills/", get(list_bills))
        .route("/bills/{session}/{number}/", get(bill_detail))
        .route("/legisinfo/{lang}/bill/{session}/{number}", get(legisinfo_page))
        .with_state(fake);
    let listener = tokio::net::TcpListener::bind("127.0.0.1:0").await.unwrap();
    let addr = listener.local_addr().unwrap();
    tokio::spawn(async move {
        axum::serve(listener, app).await.ok();
    });
    format!("http://{}", addr)
}

fn adapter(base: &str, page_size: usize) -> OpenParliamentAdapter {
    let config = SourceConfig {
        base_url: base.to_string(),
        page_size,
        min_request_interval_ms: 0,
        timeout_secs: 5,
        ..SourceConfig::default()
    };
    OpenParliamentAdapter::new(&config)
        .unwrap()
        .with_retry_policy(RetryPolicy::immediate(2))
}

fn scraper(base: &str) -> LegisInfoScraper {
    let config = EnrichmentConfig {
        base_url: format!("{}/legisinfo", base),
        min_request_interval_ms: 0,
        timeout_secs: 5,
        ..EnrichmentConfig::default()
    };
    LegisInfoScraper::new(&config)
        .unwrap()
        .with_retry_policy(RetryPolicy::immediate(2))
}

fn key(number: &str) -> NaturalKey {
    NaturalKey::new(DEFAULT_JURISDICTION, 44, 1, number)
}

// ─── Source adapter ─────────────────────────────────────────────────

#[tokio::test]
async fn test_adapter_walks_pages_and_resolves_details() {
    let fake = Fake::default();
    let base = serve(fake.clone()).await;
    let source = adapter(&base, 2);

    let selection = Selection::session(44, 1);
    let items: Vec<_> = source.fetch(&selection).collect().await;

    assert_eq!(items.len(), 3);
    let bills: Vec<_> = items.into_iter().map(|i| i.unwrap()).collect();
    assert_eq!(bills[2].number, "C-10");
    assert_eq!(bills[2].title_en, "An Act respecting C-10");
    assert_eq!(bills[2].title_fr.as_deref(), Some("Loi concernant C-10"));
    assert_eq!(bills[2].short_title_en, None, "empty strings become None");
    assert_eq!(bills[2].introduced_date, NaiveDate::from_ymd_opt(2022, 2, 3));
    assert_eq!(bills[2].law_status.as_deref(), Some("HouseAt2ndReading"));
    assert_eq!(fake.hits("/bills/"), 2);
}

#[tokio::test]
async fn test_adapter_respects_limit() {
    let fake = Fake::default();
    let base = serve(fake.clone()).await;
    let source = adapter(&base, 20);

    let items: Vec<_> = source.fetch(&Selection::recent(2)).collect().await;
    assert_eq!(items.len(), 2);
    assert_eq!(fake.hits("/bills/44-1/C-10/"), 0);
}

#[tokio::test]
async fn test_adapter_retries_server_errors() {
    let fake = Fake::default();
    fake.flaky.lock().unwrap().insert("C-3".to_string(), 2);
    let base = serve(fake.clone()).await;
    let source = adapter(&base, 20);

    let items: Vec<_> = source.fetch(&Selection::session(44, 1)).collect().await;
    assert!(items.iter().all(|i| i.is_ok()));
    assert_eq!(fake.hits("/bills/44-1/C-3/"), 3);
    let stats = source.http_stats().unwrap();
    assert_eq!(stats.retries_5xx, 2);
    assert_eq!(stats.requests, 1 + 3 + 2);
}

#[tokio::test]
async fn test_adapter_gives_up_after_max_retries() {
    let fake = Fake::default();
    fake.flaky.lock().unwrap().insert("C-3".to_string(), 10);
    let base = serve(fake.clone()).await;
    let source = adapter(&base, 20);

    let items: Vec<_> = source.fetch(&Selection::session(44, 1)).collect().await;
    assert_eq!(items.len(), 3, "the stream continues past a failed bill");
    let err = items[1].as_ref().unwrap_err();
    assert_eq!(err.kind, ErrorKind::Transient);
    assert_eq!(err.key, Some(key("C-3")));
    assert_eq!(fake.hits("/bills/44-1/C-3/"), 3);
}

#[tokio::test]
async fn test_adapter_does_not_retry_not_found() {
    let fake = Fake {
        missing: Arc::new(vec!["C-2".to_string()]),
        ..Fake::default()
    };
    let base = serve(fake.clone()).await;
    let source = adapter(&base, 20);

    let items: Vec<_> = source.fetch(&Selection::session(44, 1)).collect().await;
    let err = items[0].as_ref().unwrap_err();
    assert_eq!(err.kind, ErrorKind::Permanent);
    assert_eq!(fake.hits("/bills/44-1/C-2/"), 1);
    assert!(items[1].is_ok());
}

#[tokio::test]
async fn test_failed_page_is_skipped_and_walk_continues() {
    let fake = Fake {
        broken_offset: Some(1),
        ..Fake::default()
    };
    let base = serve(fake.clone()).await;
    let source = adapter(&base, 1);

    let items: Vec<_> = source.fetch(&Selection::session(44, 1)).collect().await;
    assert_eq!(items.len(), 3);
    assert_eq!(items[0].as_ref().unwrap().number, "C-2");
    let err = items[1].as_ref().unwrap_err();
    assert_eq!(err.subject, "page offset=1");
    assert_eq!(err.kind, ErrorKind::Transient);
    assert_eq!(items[2].as_ref().unwrap().number, "C-10", "page after the failure still arrives");
    assert_eq!(fake.hits("/bills/44-1/C-10/"), 1);
}

#[tokio::test]
async fn test_failed_page_within_limit_stops_at_limit() {
    let fake = Fake {
        broken_offset: Some(0),
        ..Fake::default()
    };
    let base = serve(fake.clone()).await;
    let source = adapter(&base, 2);

    let items: Vec<_> = source.fetch(&Selection::recent(2)).collect().await;
    assert_eq!(items.len(), 1);
    assert_eq!(items[0].as_ref().unwrap_err().subject, "page offset=0");
    assert_eq!(fake.hits("/bills/"), 3, "one page, retried twice, nothing past the limit");
}

// ─── HTTP fetcher ───────────────────────────────────────────────────

#[tokio::test]
async fn test_retry_after_is_capped_by_max_delay() {
    let fake = Fake::default();
    let base = serve(fake.clone()).await;
    let policy = RetryPolicy {
        max_retries: 2,
        base_delay: Duration::from_millis(10),
        max_delay: Duration::from_millis(100),
    };
    let fetcher = HttpFetcher::new(
        "fake",
        Duration::from_secs(5),
        "billsync-test",
        Duration::ZERO,
        policy,
        CircuitBreaker::disabled(),
    )
    .unwrap();

    let url = format!("{}/throttled", base);
    let result = tokio::time::timeout(Duration::from_secs(3), fetcher.get(&url))
        .await
        .expect("Retry-After of an hour must not stall the request");
    assert!(matches!(result, Err(SourceError::Transient { .. })));
    assert_eq!(fake.hits("/throttled"), 3);
    assert_eq!(fetcher.stats().retries_429, 2);
}

#[tokio::test]
async fn test_stalled_body_is_retried() {
    let fake = Fake::default();
    let base = serve(fake.clone()).await;
    let fetcher = HttpFetcher::new(
        "fake",
        Duration::from_millis(300),
        "billsync-test",
        Duration::ZERO,
        RetryPolicy::immediate(2),
        CircuitBreaker::disabled(),
    )
    .unwrap();

    let fetched = fetcher.get(&format!("{}/stalled", base)).await.unwrap();
    assert_eq!(fetched, Fetched::Ok(r#"{"objects":[]}"#.to_string()));
    assert_eq!(fake.hits("/stalled"), 2);
    let stats = fetcher.stats();
    assert_eq!(stats.requests, 2);
    assert_eq!(stats.retries_other, 1);
}

// ─── Enrichment scraper ─────────────────────────────────────────────

#[tokio::test]
async fn test_scraper_merges_english_and_french() {
    let fake = Fake::default();
    let base = serve(fake.clone()).await;

    match scraper(&base).enrich(&key("C-10")).await.unwrap() {
        Enrichment::Found(delta) => {
            assert_eq!(delta.status.as_deref(), Some("Royal assent received"));
            assert_eq!(delta.legisinfo_id, Some(11410000));
            assert_eq!(
                delta.summary_fr.as_deref(),
                Some("Le texte modifie la Loi sur la radiodiffusion.")
            );
            assert_eq!(delta.royal_assent_date, NaiveDate::from_ymd_opt(2023, 4, 27));
            assert_eq!(delta.royal_assent_chapter.as_deref(), Some("c. 8"));
        }
        other => panic!("expected enrichment, got {:?}", other),
    }
}

#[tokio::test]
async fn test_scraper_missing_or_empty_page_is_no_new_data() {
    let fake = Fake::default();
    let base = serve(fake.clone()).await;
    let scraper = scraper(&base);

    assert_eq!(scraper.enrich(&key("C-3")).await.unwrap(), Enrichment::NoNewData);
    assert_eq!(fake.hits("/legisinfo/en/bill/44-1/c-3"), 1);
    assert_eq!(scraper.enrich(&key("C-2")).await.unwrap(), Enrichment::NoNewData);
}

#[tokio::test]
async fn test_scraper_retries_then_fails() {
    let fake = Fake {
        legisinfo_down: Arc::new(vec!["c-10".to_string()]),
        ..Fake::default()
    };
    let base = serve(fake.clone()).await;

    let err = scraper(&base).enrich(&key("C-10")).await.unwrap_err();
    assert!(matches!(err, SourceError::Transient { .. }));
    assert_eq!(fake.hits("/legisinfo/en/bill/44-1/c-10"), 3);
}

// ─── End to end ─────────────────────────────────────────────────────

#[tokio::test]
async fn test_open_circuit_stops_enrichment_calls() {
    let fake = Fake {
        legisinfo_down: Arc::new(vec!["c-2".into(), "c-3".into(), "c-10".into()]),
        ..Fake::default()
    };
    let base = serve(fake.clone()).await;
    let store = Arc::new(InMemoryStore::new());

    let enricher: Arc<dyn BillEnricher> = Arc::new(
        scraper(&base).with_circuit_breaker(CircuitBreaker::new(1, Duration::from_secs(60))),
    );
    let pipeline = Pipeline::new(
        Arc::new(adapter(&base, 20)),
        Some(enricher),
        PipelineSettings {
            min_introduced_date: NaiveDate::from_ymd_opt(2015, 1, 1).unwrap(),
            enrichment_concurrency: 1,
        },
    );
    let svc = IntegrationService::new(
        pipeline,
        store.clone(),
        store.clone(),
        ServiceSettings::from_config(&Config::minimal()),
    );

    let result = svc
        .run(&PipelineRequest::new(Selection::session(44, 1)))
        .await
        .unwrap();
    assert_eq!(result.created, 3, "bills are stored without enrichment");
    assert_eq!(result.error_count, 3);
    assert_eq!(result.status, RunStatus::Partial);

    assert_eq!(fake.hits("/legisinfo/en/bill/44-1/c-2"), 3);
    assert_eq!(fake.hits("/legisinfo/en/bill/44-1/c-3"), 0);
    assert_eq!(fake.hits("/legisinfo/en/bill/44-1/c-10"), 0);

    let log = &store.recent(1, None).await.unwrap()[0];
    let http = &log.fetch_params["result_summary"]["http"];
    assert_eq!(http["enrichment"]["requests"], 3);
    assert_eq!(http["enrichment"]["retries_5xx"], 2);
    assert_eq!(http["enrichment"]["circuit_rejections"], 2);
    assert_eq!(http["source"]["retries_5xx"], 0);
    assert_eq!(log.fetch_params["result_summary"]["http_retries"], 2);
}

#[tokio::test]
async fn test_end_to_end_sync_into_sqlite() {
    let fake = Fake {
        legisinfo_down: Arc::new(vec!["c-3".to_string()]),
        ..Fake::default()
    };
    let base = serve(fake.clone()).await;

    let tmp = TempDir::new().unwrap();
    let mut cfg = Config::minimal();
    cfg.db.path = tmp.path().join("bills.sqlite");
    let pool = db::connect(&cfg).await.unwrap();
    migrate::apply(&pool).await.unwrap();
    let store = Arc::new(SqliteStore::new(pool));

    let enricher: Arc<dyn BillEnricher> = Arc::new(scraper(&base));
    let pipeline = Pipeline::new(
        Arc::new(adapter(&base, 2)),
        Some(enricher),
        PipelineSettings::from_config(&cfg),
    );
    let svc = IntegrationService::new(
        pipeline,
        store.clone(),
        store.clone(),
        ServiceSettings::from_config(&cfg),
    );
    let request = PipelineRequest::new(Selection::session(44, 1));

    let first = svc.run(&request).await.unwrap();
    assert_eq!(first.attempted, 3);
    assert_eq!(first.created, 3);
    assert_eq!(first.failed, 0);
    assert_eq!(first.error_count, 1, "C-3 enrichment failed but the bill is stored");
    assert_eq!(first.status, RunStatus::Partial);

    let c10 = store.get_by_natural_key(&key("C-10")).await.unwrap().unwrap();
    assert!(c10.bill.source_legisinfo);
    assert_eq!(c10.bill.subject_tags, vec!["Broadcasting"]);
    let c3 = store.get_by_natural_key(&key("C-3")).await.unwrap().unwrap();
    assert!(!c3.bill.source_legisinfo);

    let second = svc.run(&request).await.unwrap();
    assert_eq!(second.created, 0);
    assert_eq!(second.unchanged, 3);
}
