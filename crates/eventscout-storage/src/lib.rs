//! Outbound HTTP fetching, per-domain rate limiting and the TTL cache for eventscout.

use std::collections::HashMap;
use std::sync::Arc;
use std::time::{Duration, Instant};

use anyhow::Context;
use async_trait::async_trait;
use reqwest::{header, Method, StatusCode};
use thiserror::Error;
use tokio::sync::{Mutex, Semaphore};
use tracing::{debug, info_span, warn, Instrument};
use url::Url;

pub mod cache;

pub use cache::{CacheBackend, CacheEntry, CacheError, CacheStore, Cached, FileCache, MemoryCache};

pub const CRATE_NAME: &str = "eventscout-storage";

pub const DEFAULT_USER_AGENT: &str = "eventscout/0.1 (+community events aggregator)";

/// Lowercased host of `url`, if it has one.
pub fn domain_of(url: &str) -> Option<String> {
    Url::parse(url)
        .ok()
        .and_then(|u| u.host_str().map(|h| h.to_ascii_lowercase()))
}

/// Advisory per-domain gate: a call is allowed when at least `min_interval`
/// passed since the previous call for the same domain. Every call records its
/// own timestamp, allowed or not.
#[derive(Debug)]
pub struct DomainRateLimiter {
    min_interval: Duration,
    pause: Duration,
    last_seen: Mutex<HashMap<String, Instant>>,
    turns: Mutex<HashMap<String, Arc<Mutex<()>>>>,
}

impl Default for DomainRateLimiter {
    fn default() -> Self {
        Self::new(Duration::from_millis(1000), Duration::from_millis(1000))
    }
}

impl DomainRateLimiter {
    pub fn new(min_interval: Duration, pause: Duration) -> Self {
        Self {
            min_interval,
            pause,
            last_seen: Mutex::new(HashMap::new()),
            turns: Mutex::new(HashMap::new()),
        }
    }

    pub async fn allow(&self, domain: &str) -> bool {
        self.allow_at(domain, Instant::now()).await
    }

    pub async fn allow_at(&self, domain: &str, now: Instant) -> bool {
        let mut map = self.last_seen.lock().await;
        let allowed = match map.get(domain) {
            Some(prev) => now.saturating_duration_since(*prev) >= self.min_interval,
            None => true,
        };
        map.insert(domain.to_string(), now);
        allowed
    }

    /// Wait-then-proceed: a denied caller pauses and asks again until allowed.
    /// Callers for one domain queue behind each other, so granted turns are at
    /// least `min_interval` apart however many tasks share the host.
    pub async fn wait_turn(&self, domain: &str) {
        let turn = {
            let mut turns = self.turns.lock().await;
            turns.entry(domain.to_string()).or_default().clone()
        };
        let _turn = turn.lock().await;
        // a denied call restarts the window, so a shorter sleep never gets through
        let pause = self.pause.max(self.min_interval);
        while !self.allow(domain).await {
            debug!(domain, pause_ms = pause.as_millis() as u64, "rate limited; pausing");
            tokio::time::sleep(pause).await;
        }
    }
}

/// 429 and 5xx are worth another attempt; every other error status is final.
pub fn retryable_status(status: StatusCode) -> bool {
    status == StatusCode::TOO_MANY_REQUESTS || status.is_server_error()
}

/// Timeouts and connection-level failures; body decode errors are not retried.
pub fn retryable_transport(err: &reqwest::Error) -> bool {
    err.is_timeout() || err.is_connect() || err.is_request()
}

#[derive(Debug, Clone, Copy)]
pub struct BackoffPolicy {
    pub max_retries: usize,
    pub base_delay: Duration,
    pub max_delay: Duration,
}

impl Default for BackoffPolicy {
    fn default() -> Self {
        Self {
            max_retries: 3,
            base_delay: Duration::from_millis(500),
            max_delay: Duration::from_secs(8),
        }
    }
}

impl BackoffPolicy {
    /// Sleep before retry number `retry` (0-based): the base delay doubled per
    /// retry, never above `max_delay`.
    pub fn delay_before_retry(&self, retry: usize) -> Duration {
        let doublings = u32::try_from(retry).unwrap_or(u32::MAX);
        let factor = 2u32.checked_pow(doublings).unwrap_or(u32::MAX);
        self.base_delay.saturating_mul(factor).min(self.max_delay)
    }

    /// Total attempts including the first one.
    pub fn attempts(&self) -> usize {
        self.max_retries + 1
    }
}

#[derive(Debug, Clone)]
pub struct HttpClientConfig {
    pub timeout: Duration,
    pub user_agent: String,
    pub global_concurrency: usize,
    pub per_domain_concurrency: usize,
    pub backoff: BackoffPolicy,
}

impl Default for HttpClientConfig {
    fn default() -> Self {
        Self {
            timeout: Duration::from_secs(15),
            user_agent: DEFAULT_USER_AGENT.to_string(),
            global_concurrency: 8,
            per_domain_concurrency: 2,
            backoff: BackoffPolicy::default(),
        }
    }
}

#[derive(Debug, Clone, PartialEq, Eq)]
pub struct FetchedPage {
    pub url: String,
    pub final_url: String,
    pub status: u16,
    pub content_type: String,
    pub body: String,
}

impl FetchedPage {
    pub fn is_json(&self) -> bool {
        let ct = self.content_type.to_ascii_lowercase();
        ct.starts_with("application/json") || ct.contains("+json")
    }
}

#[derive(Debug, Error)]
pub enum FetchError {
    #[error("invalid url: {0}")]
    InvalidUrl(String),
    #[error("request to {url} failed after {attempts} attempt(s): {source}")]
    Request {
        url: String,
        attempts: usize,
        #[source]
        source: reqwest::Error,
    },
    #[error("http status {status} ({reason}) for {url}")]
    HttpStatus {
        status: u16,
        reason: String,
        url: String,
    },
}

impl FetchError {
    pub fn status(&self) -> Option<u16> {
        match self {
            FetchError::HttpStatus { status, .. } => Some(*status),
            _ => None,
        }
    }

    /// Whether the failure was transient, as opposed to a definitive refusal.
    pub fn is_retryable(&self) -> bool {
        match self {
            FetchError::InvalidUrl(_) => false,
            FetchError::Request { source, .. } => retryable_transport(source),
            FetchError::HttpStatus { status, .. } => {
                StatusCode::from_u16(*status).is_ok_and(retryable_status)
            }
        }
    }
}

/// Outbound page access used by the orchestrator and refresh tasks.
#[async_trait]
pub trait PageFetcher: Send + Sync {
    async fn fetch(&self, url: &str) -> Result<FetchedPage, FetchError>;

    /// Lightweight existence check; never retried.
    async fn probe(&self, url: &str) -> bool;
}

#[derive(Debug)]
pub struct HttpFetcher {
    client: reqwest::Client,
    global_limit: Arc<Semaphore>,
    per_domain_limit: usize,
    per_domain: Mutex<HashMap<String, Arc<Semaphore>>>,
    backoff: BackoffPolicy,
}

impl HttpFetcher {
    pub fn new(config: HttpClientConfig) -> anyhow::Result<Self> {
        let client = reqwest::Client::builder()
            .gzip(true)
            .brotli(true)
            .timeout(config.timeout)
            .user_agent(config.user_agent.clone())
            .redirect(reqwest::redirect::Policy::limited(5))
            .build()
            .context("building reqwest client")?;

        Ok(Self {
            client,
            global_limit: Arc::new(Semaphore::new(config.global_concurrency.max(1))),
            per_domain_limit: config.per_domain_concurrency.max(1),
            per_domain: Mutex::new(HashMap::new()),
            backoff: config.backoff,
        })
    }

    async fn per_domain_semaphore(&self, domain: &str) -> Arc<Semaphore> {
        let mut map = self.per_domain.lock().await;
        map.entry(domain.to_string())
            .or_insert_with(|| Arc::new(Semaphore::new(self.per_domain_limit)))
            .clone()
    }

    async fn fetch_with_retries(&self, url: &str) -> Result<FetchedPage, FetchError> {
        let mut retry = 0;
        loop {
            let attempts = retry + 1;
            let can_retry = retry < self.backoff.max_retries;
            let resp = match self.client.get(url).send().await {
                Ok(resp) => resp,
                Err(err) if can_retry && retryable_transport(&err) => {
                    let delay = self.backoff.delay_before_retry(retry);
                    warn!(attempts, error = %err, delay_ms = delay.as_millis() as u64, "request failed; retrying");
                    tokio::time::sleep(delay).await;
                    retry += 1;
                    continue;
                }
                Err(source) => {
                    return Err(FetchError::Request {
                        url: url.to_string(),
                        attempts,
                        source,
                    })
                }
            };

            let status = resp.status();
            let final_url = resp.url().to_string();
            if !status.is_success() {
                if can_retry && retryable_status(status) {
                    let delay = self.backoff.delay_before_retry(retry);
                    warn!(attempts, status = status.as_u16(), delay_ms = delay.as_millis() as u64, "upstream busy; retrying");
                    tokio::time::sleep(delay).await;
                    retry += 1;
                    continue;
                }
                return Err(FetchError::HttpStatus {
                    status: status.as_u16(),
                    reason: status.canonical_reason().unwrap_or("unknown").to_string(),
                    url: final_url,
                });
            }

            let content_type = resp
                .headers()
                .get(header::CONTENT_TYPE)
                .and_then(|v| v.to_str().ok())
                .unwrap_or_default()
                .to_string();
            let body = resp.text().await.map_err(|source| FetchError::Request {
                url: url.to_string(),
                attempts,
                source,
            })?;
            return Ok(FetchedPage {
                url: url.to_string(),
                final_url,
                status: status.as_u16(),
                content_type,
                body,
            });
        }
    }

    async fn head_or_get_ok(&self, url: &str) -> bool {
        match self.client.request(Method::HEAD, url).send().await {
            Ok(resp) if resp.status() == StatusCode::METHOD_NOT_ALLOWED => self
                .client
                .get(url)
                .send()
                .await
                .map(|r| r.status().is_success())
                .unwrap_or(false),
            Ok(resp) => resp.status().is_success(),
            Err(err) => {
                debug!(url, error = %err, "probe failed");
                false
            }
        }
    }
}

#[async_trait]
impl PageFetcher for HttpFetcher {
    async fn fetch(&self, url: &str) -> Result<FetchedPage, FetchError> {
        let domain = domain_of(url).ok_or_else(|| FetchError::InvalidUrl(url.to_string()))?;

        let _global = self.global_limit.acquire().await.expect("semaphore not closed");
        let per_domain = self.per_domain_semaphore(&domain).await;
        let _domain = per_domain.acquire().await.expect("semaphore not closed");

        self.fetch_with_retries(url)
            .instrument(info_span!("http_fetch", url, domain = domain.as_str()))
            .await
    }

    async fn probe(&self, url: &str) -> bool {
        let Some(domain) = domain_of(url) else {
            return false;
        };
        let _global = self.global_limit.acquire().await.expect("semaphore not closed");
        let per_domain = self.per_domain_semaphore(&domain).await;
        let _domain = per_domain.acquire().await.expect("semaphore not closed");
        self.head_or_get_ok(url).await
    }
}
