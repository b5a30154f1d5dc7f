//! Shared HTTP plumbing for the source adapter and the enrichment scraper.
//!
//! Both upstreams are reached through an [`HttpFetcher`], which owns the
//! client, a [`Pacer`], a [`RetryPolicy`], a [`CircuitBreaker`] and the
//! request counters reported in each run's fetch log.
//!
//! # Retry Strategy
//!
//! - HTTP 408, 425, 429 and 5xx → retry
//! - Other HTTP 4xx → fail immediately
//! - Timeouts and connection errors → retry, including those raised while
//!   the body is still being read
//! - Backoff: `base * 2^(attempt-1)` capped at `max_delay`, plus up to 50%
//!   jitter; a numeric `Retry-After` on 429 replaces the computed delay but
//!   is still capped at `max_delay`.
//!
//! # Circuit Breaker
//!
//! After `threshold` consecutive requests that failed for good (retries
//! exhausted), the breaker opens for `cooldown`. Requests issued while it
//! is open fail at once with [`SourceError::CircuitOpen`] and nothing is
//! sent. The first request after the cooldown closes it again. A
//! threshold of zero disables the breaker.
//!
//! Requests are paced so consecutive calls against the same host are at
//! least `min_interval` apart.

use std::sync::atomic::{AtomicU64, Ordering};
use std::sync::{Mutex as StdMutex, MutexGuard};
use std::time::Duration;

use reqwest::header::RETRY_AFTER;
use reqwest::{Client, Response, StatusCode};
use serde::Serialize;
use tokio::sync::Mutex;
use tokio::time::Instant;
use tracing::{debug, warn};

use crate::error::{is_retryable_status, SourceError};

/// Bounded exponential backoff.
#[derive(Debug, Clone)]
pub struct RetryPolicy {
    pub max_retries: u32,
    pub base_delay: Duration,
    pub max_delay: Duration,
}

impl RetryPolicy {
    pub fn new(max_retries: u32) -> Self {
        Self {
            max_retries,
            base_delay: Duration::from_millis(500),
            max_delay: Duration::from_secs(30),
        }
    }

    /// No sleeping between attempts. Used by tests.
    pub fn immediate(max_retries: u32) -> Self {
        Self {
            max_retries,
            base_delay: Duration::ZERO,
            max_delay: Duration::ZERO,
        }
    }

    /// Delay before retry number `attempt` (1-based).
    pub fn delay_for(&self, attempt: u32) -> Duration {
        if self.base_delay.is_zero() {
            return Duration::ZERO;
        }
        let exp = 1u32 << (attempt.saturating_sub(1)).min(10);
        let base = self.base_delay.saturating_mul(exp).min(self.max_delay);
        let jitter = base.mul_f64(fastrand::f64() * 0.5);
        base + jitter
    }

    /// A server-provided delay, never longer than `max_delay`.
    pub fn clamp_hint(&self, hint: Duration) -> Duration {
        hint.min(self.max_delay)
    }
}

/// Enforces a minimum interval between requests.
pub struct Pacer {
    min_interval: Duration,
    last: Mutex<Option<Instant>>,
}

impl Pacer {
    pub fn new(min_interval: Duration) -> Self {
        Self {
            min_interval,
            last: Mutex::new(None),
        }
    }

    /// Wait until a request may be issued, then claim the slot.
    pub async fn wait(&self) {
        if self.min_interval.is_zero() {
            return;
        }
        let mut last = self.last.lock().await;
        if let Some(prev) = *last {
            let ready_at = prev + self.min_interval;
            if ready_at > Instant::now() {
                tokio::time::sleep_until(ready_at).await;
            }
        }
        *last = Some(Instant::now());
    }
}

#[derive(Debug, Default)]
struct BreakerState {
    consecutive_failures: u32,
    open_until: Option<Instant>,
}

/// Consecutive-failure circuit breaker.
pub struct CircuitBreaker {
    threshold: u32,
    cooldown: Duration,
    state: StdMutex<BreakerState>,
}

impl CircuitBreaker {
    pub fn new(threshold: u32, cooldown: Duration) -> Self {
        Self {
            threshold,
            cooldown,
            state: StdMutex::new(BreakerState::default()),
        }
    }

    pub fn disabled() -> Self {
        Self::new(0, Duration::ZERO)
    }

    fn lock(&self) -> MutexGuard<'_, BreakerState> {
        self.state.lock().unwrap_or_else(|poisoned| poisoned.into_inner())
    }

    /// Time left before requests are allowed again, or `None` when closed.
    ///
    /// An expired cooldown closes the breaker and clears the failure count.
    pub fn remaining(&self) -> Option<Duration> {
        let mut state = self.lock();
        let until = state.open_until?;
        let now = Instant::now();
        if now >= until {
            *state = BreakerState::default();
            return None;
        }
        Some(until - now)
    }

    pub fn consecutive_failures(&self) -> u32 {
        self.lock().consecutive_failures
    }

    fn record_success(&self) {
        *self.lock() = BreakerState::default();
    }

    /// Returns true when this failure opened the breaker.
    fn record_failure(&self) -> bool {
        if self.threshold == 0 {
            return false;
        }
        let mut state = self.lock();
        state.consecutive_failures = state.consecutive_failures.saturating_add(1);
        if state.consecutive_failures >= self.threshold && state.open_until.is_none() {
            state.open_until = Some(Instant::now() + self.cooldown);
            return true;
        }
        false
    }
}

/// Request counters for one upstream.
///
/// Counters only grow; use [`HttpStats::since`] for the share of one run.
#[derive(Debug, Clone, Copy, Default, PartialEq, Eq, Serialize)]
pub struct HttpStats {
    pub requests: u64,
    pub retries_429: u64,
    pub retries_5xx: u64,
    pub retries_other: u64,
    pub circuit_rejections: u64,
    pub latency_ms_total: u64,
}

impl HttpStats {
    pub fn retries(&self) -> u64 {
        self.retries_429 + self.retries_5xx + self.retries_other
    }

    pub fn avg_latency_ms(&self) -> Option<f64> {
        if self.requests == 0 {
            return None;
        }
        Some(self.latency_ms_total as f64 / self.requests as f64)
    }

    /// Counters accumulated after `earlier` was taken.
    pub fn since(&self, earlier: &HttpStats) -> HttpStats {
        HttpStats {
            requests: self.requests.saturating_sub(earlier.requests),
            retries_429: self.retries_429.saturating_sub(earlier.retries_429),
            retries_5xx: self.retries_5xx.saturating_sub(earlier.retries_5xx),
            retries_other: self.retries_other.saturating_sub(earlier.retries_other),
            circuit_rejections: self
                .circuit_rejections
                .saturating_sub(earlier.circuit_rejections),
            latency_ms_total: self.latency_ms_total.saturating_sub(earlier.latency_ms_total),
        }
    }
}

#[derive(Debug, Default)]
struct Telemetry {
    requests: AtomicU64,
    retries_429: AtomicU64,
    retries_5xx: AtomicU64,
    retries_other: AtomicU64,
    circuit_rejections: AtomicU64,
    latency_ms_total: AtomicU64,
}

impl Telemetry {
    fn record_request(&self, elapsed: Duration) {
        self.requests.fetch_add(1, Ordering::Relaxed);
        let ms = u64::try_from(elapsed.as_millis()).unwrap_or(u64::MAX);
        self.latency_ms_total.fetch_add(ms, Ordering::Relaxed);
    }

    fn record_retry(&self, status: Option<StatusCode>) {
        let counter = match status {
            Some(s) if s == StatusCode::TOO_MANY_REQUESTS => &self.retries_429,
            Some(s) if s.is_server_error() => &self.retries_5xx,
            _ => &self.retries_other,
        };
        counter.fetch_add(1, Ordering::Relaxed);
    }

    fn snapshot(&self) -> HttpStats {
        HttpStats {
            requests: self.requests.load(Ordering::Relaxed),
            retries_429: self.retries_429.load(Ordering::Relaxed),
            retries_5xx: self.retries_5xx.load(Ordering::Relaxed),
            retries_other: self.retries_other.load(Ordering::Relaxed),
            circuit_rejections: self.circuit_rejections.load(Ordering::Relaxed),
            latency_ms_total: self.latency_ms_total.load(Ordering::Relaxed),
        }
    }
}

/// Result of a paced, retried GET.
#[derive(Debug, Clone, PartialEq, Eq)]
pub enum Fetched {
    /// Body of a 2xx response, read in full.
    Ok(String),
    NotFound,
}

/// Outcome of a single request attempt.
enum Attempt {
    Done(Fetched),
    /// The host answered; the failure is not worth repeating.
    Rejected(SourceError),
    Retry {
        err: SourceError,
        status: Option<StatusCode>,
        retry_after: Option<Duration>,
    },
}

impl Attempt {
    fn from_error(err: SourceError) -> Self {
        if err.is_transient() {
            Attempt::Retry {
                err,
                status: None,
                retry_after: None,
            }
        } else {
            Attempt::Rejected(err)
        }
    }
}

/// Paced, retried, circuit-protected GETs against one upstream.
pub struct HttpFetcher {
    name: String,
    client: Client,
    pacer: Pacer,
    retry: RetryPolicy,
    breaker: CircuitBreaker,
    telemetry: Telemetry,
}

impl HttpFetcher {
    /// `name` labels log lines and circuit errors (e.g. `openparliament`).
    pub fn new(
        name: &str,
        timeout: Duration,
        user_agent: &str,
        min_interval: Duration,
        retry: RetryPolicy,
        breaker: CircuitBreaker,
    ) -> anyhow::Result<Self> {
        let client = Client::builder()
            .timeout(timeout)
            .user_agent(user_agent)
            .build()?;
        Ok(Self {
            name: name.to_string(),
            client,
            pacer: Pacer::new(min_interval),
            retry,
            breaker,
            telemetry: Telemetry::default(),
        })
    }

    pub fn with_retry_policy(mut self, retry: RetryPolicy) -> Self {
        self.retry = retry;
        self
    }

    pub fn with_circuit_breaker(mut self, breaker: CircuitBreaker) -> Self {
        self.breaker = breaker;
        self
    }

    pub fn name(&self) -> &str {
        &self.name
    }

    pub fn stats(&self) -> HttpStats {
        self.telemetry.snapshot()
    }

    pub fn breaker(&self) -> &CircuitBreaker {
        &self.breaker
    }

    /// GET `url`, retrying transient failures per the retry policy.
    ///
    /// A 404 is returned as [`Fetched::NotFound`] so callers can decide
    /// whether absence is an error.
    pub async fn get(&self, url: &str) -> Result<Fetched, SourceError> {
        if let Some(remaining) = self.breaker.remaining() {
            self.telemetry
                .circuit_rejections
                .fetch_add(1, Ordering::Relaxed);
            debug!(host = %self.name, url, "circuit open, request skipped");
            return Err(SourceError::CircuitOpen {
                host: self.name.clone(),
                url: url.to_string(),
                retry_in_secs: remaining.as_secs().max(1),
            });
        }

        let mut last_err: Option<SourceError> = None;
        let mut retry_hint: Option<Duration> = None;

        for attempt in 0..=self.retry.max_retries {
            if attempt > 0 {
                let delay = match retry_hint.take() {
                    Some(hint) => self.retry.clamp_hint(hint),
                    None => self.retry.delay_for(attempt),
                };
                if !delay.is_zero() {
                    tokio::time::sleep(delay).await;
                }
            }

            self.pacer.wait().await;
            debug!(url, attempt, "GET");
            let started = Instant::now();
            let outcome = self.attempt(url).await;
            self.telemetry.record_request(started.elapsed());

            match outcome {
                Attempt::Done(fetched) => {
                    self.breaker.record_success();
                    return Ok(fetched);
                }
                Attempt::Rejected(err) => {
                    self.breaker.record_success();
                    return Err(err);
                }
                Attempt::Retry {
                    err,
                    status,
                    retry_after,
                } => {
                    warn!(
                        url,
                        attempt,
                        max = self.retry.max_retries,
                        error = %err,
                        "request failed"
                    );
                    if attempt < self.retry.max_retries {
                        self.telemetry.record_retry(status);
                    }
                    retry_hint = retry_after;
                    last_err = Some(err);
                }
            }
        }

        if self.breaker.record_failure() {
            warn!(
                host = %self.name,
                failures = self.breaker.consecutive_failures(),
                cooldown_secs = self.breaker.cooldown.as_secs(),
                "circuit breaker opened"
            );
        }
        Err(last_err.unwrap_or_else(|| SourceError::Transient {
            url: url.to_string(),
            message: "retries exhausted".to_string(),
        }))
    }

    async fn attempt(&self, url: &str) -> Attempt {
        let response = match self.client.get(url).send().await {
            Ok(response) => response,
            Err(e) => return Attempt::from_error(SourceError::from_reqwest(url, e)),
        };

        let status = response.status();
        if status == StatusCode::NOT_FOUND {
            return Attempt::Done(Fetched::NotFound);
        }
        if !status.is_success() {
            if !is_retryable_status(status.as_u16()) {
                return Attempt::Rejected(SourceError::Permanent {
                    url: url.to_string(),
                    status: status.as_u16(),
                });
            }
            let retry_after = if status == StatusCode::TOO_MANY_REQUESTS {
                retry_after(&response)
            } else {
                None
            };
            return Attempt::Retry {
                err: SourceError::Transient {
                    url: url.to_string(),
                    message: format!("status {}", status),
                },
                status: Some(status),
                retry_after,
            };
        }

        // The client timeout also covers the body. `text()` decodes
        // lossily, so any error here is a stalled or cut-off transfer.
        match response.text().await {
            Ok(body) => Attempt::Done(Fetched::Ok(body)),
            Err(e) => Attempt::Retry {
                err: SourceError::Transient {
                    url: url.to_string(),
                    message: format!("reading body: {}", e),
                },
                status: None,
                retry_after: None,
            },
        }
    }
}

fn retry_after(response: &Response) -> Option<Duration> {
    response
        .headers()
        .get(RETRY_AFTER)?
        .to_str()
        .ok()?
        .trim()
        .parse::<u64>()
        .ok()
        .map(Duration::from_secs)
}

/// Resolve a possibly relative link against `base`.
pub fn join_url(base: &str, path: &str) -> String {
    if path.starts_with("http://") || path.starts_with("https://") {
        return path.to_string();
    }
    format!(
        "{}/{}",
        base.trim_end_matches('/'),
        path.trim_start_matches('/')
    )
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_delay_grows_and_caps() {
        let policy = RetryPolicy {
            max_retries: 10,
            base_delay: Duration::from_millis(100),
            max_delay: Duration::from_millis(1000),
        };
        let first = policy.delay_for(1);
        assert!(first >= Duration::from_millis(100) && first <= Duration::from_millis(150));
        let third = policy.delay_for(3);
        assert!(third >= Duration::from_millis(400) && third <= Duration::from_millis(600));
        let capped = policy.delay_for(9);
        assert!(capped >= Duration::from_millis(1000) && capped <= Duration::from_millis(1500));
    }

    #[test]
    fn test_retry_after_hint_is_capped() {
        let policy = RetryPolicy {
            max_retries: 3,
            base_delay: Duration::from_millis(10),
            max_delay: Duration::from_millis(100),
        };
        assert_eq!(
            policy.clamp_hint(Duration::from_secs(3600)),
            Duration::from_millis(100)
        );
        assert_eq!(
            policy.clamp_hint(Duration::from_millis(20)),
            Duration::from_millis(20)
        );
    }

    #[test]
    fn test_immediate_policy_never_sleeps() {
        assert_eq!(RetryPolicy::immediate(3).delay_for(3), Duration::ZERO);
        assert_eq!(
            RetryPolicy::immediate(3).clamp_hint(Duration::from_secs(60)),
            Duration::ZERO
        );
    }

    #[test]
    fn test_join_url() {
        assert_eq!(
            join_url("https://api.openparliament.ca/", "/bills/44-1/C-2/"),
            "https://api.openparliament.ca/bills/44-1/C-2/"
        );
        assert_eq!(
            join_url("https://api.openparliament.ca", "bills/?offset=20"),
            "https://api.openparliament.ca/bills/?offset=20"
        );
        assert_eq!(join_url("http://a", "https://b/x"), "https://b/x");
    }

    #[tokio::test]
    async fn test_pacer_spaces_requests() {
        let pacer = Pacer::new(Duration::from_millis(50));
        let start = std::time::Instant::now();
        pacer.wait().await;
        pacer.wait().await;
        pacer.wait().await;
        assert!(start.elapsed() >= Duration::from_millis(100));
    }

    #[tokio::test]
    async fn test_breaker_opens_at_threshold_and_closes_after_cooldown() {
        let breaker = CircuitBreaker::new(2, Duration::from_millis(50));
        assert!(!breaker.record_failure());
        assert!(breaker.remaining().is_none());
        assert!(breaker.record_failure());
        assert!(breaker.remaining().is_some());
        assert!(!breaker.record_failure(), "already open");

        tokio::time::sleep(Duration::from_millis(60)).await;
        assert!(breaker.remaining().is_none());
        assert_eq!(breaker.consecutive_failures(), 0);
    }

    #[test]
    fn test_success_resets_failure_count() {
        let breaker = CircuitBreaker::new(3, Duration::from_secs(60));
        breaker.record_failure();
        breaker.record_failure();
        breaker.record_success();
        assert!(!breaker.record_failure());
        assert_eq!(breaker.consecutive_failures(), 1);
    }

    #[test]
    fn test_disabled_breaker_never_opens() {
        let breaker = CircuitBreaker::disabled();
        for _ in 0..100 {
            assert!(!breaker.record_failure());
        }
        assert!(breaker.remaining().is_none());
    }

    #[test]
    fn test_stats_delta() {
        let earlier = HttpStats {
            requests: 4,
            retries_5xx: 1,
            latency_ms_total: 40,
            ..HttpStats::default()
        };
        let later = HttpStats {
            requests: 10,
            retries_429: 2,
            retries_5xx: 1,
            latency_ms_total: 100,
            ..HttpStats::default()
        };
        let delta = later.since(&earlier);
        assert_eq!(delta.requests, 6);
        assert_eq!(delta.retries(), 2);
        assert_eq!(delta.avg_latency_ms(), Some(10.0));
        assert_eq!(HttpStats::default().avg_latency_ms(), None);
    }

    #[tokio::test]
    async fn test_open_breaker_skips_the_request() {
        let fetcher = HttpFetcher::new(
            "closed-port",
            Duration::from_secs(1),
            "test",
            Duration::ZERO,
            RetryPolicy::immediate(0),
            CircuitBreaker::new(1, Duration::from_secs(60)),
        )
        .unwrap();
        let port = {
            let listener = std::net::TcpListener::bind("127.0.0.1:0").unwrap();
            listener.local_addr().unwrap().port()
        };
        let url = format!("http://127.0.0.1:{}/bills/", port);
        let url = url.as_str();
        let first = fetcher.get(url).await.unwrap_err();
        assert!(first.is_transient());
        let second = fetcher.get(url).await.unwrap_err();
        assert!(matches!(second, SourceError::CircuitOpen { .. }));
        let stats = fetcher.stats();
        assert_eq!(stats.requests, 1);
        assert_eq!(stats.circuit_rejections, 1);
    }
}
