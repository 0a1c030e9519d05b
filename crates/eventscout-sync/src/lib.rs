//! Source configuration, scrape orchestration and ranking for eventscout.

use std::collections::HashSet;
use std::path::{Path, PathBuf};
use std::sync::Arc;
use std::time::Duration;

use anyhow::{bail, Context, Result};
use chrono::{DateTime, Utc};
use eventscout_core::{validate, CandidateEvent, Event};
use eventscout_extract::{
    discover_event_links, extract_document, parse_document, ExtractContext, ExtractError,
};
use eventscout_storage::{
    domain_of, CacheStore, DomainRateLimiter, FetchError, FetchedPage, HttpClientConfig,
    HttpFetcher, PageFetcher, DEFAULT_USER_AGENT,
};
use futures::stream::{self, StreamExt};
use serde::{Deserialize, Serialize};
use thiserror::Error;
use tracing::{debug, info, info_span, warn, Instrument};
use url::Url;
use uuid::Uuid;

mod refresh;
mod service;

pub use refresh::{
    parse_refugee_count_html, parse_refugee_count_json, EventsRefreshTask, RefreshRunner,
    RefreshScheduler, RefreshTask, RefugeeCount, RefugeeCountTask, TaskOutcome,
};
pub use service::{EventService, EventSubmission, EventsSnapshot};

pub const CRATE_NAME: &str = "eventscout-sync";

pub const EVENTS_CACHE_KEY: &str = "events";
pub const REFUGEE_COUNT_CACHE_KEY: &str = "refugee_count";

pub const MAX_DISCOVERED_PAGES: usize = 5;

/// Paths commonly used for listing pages, probed in this order.
pub const DISCOVERY_SUFFIXES: &[&str] = &[
    "/events",
    "/event",
    "/calendar",
    "/news",
    "/activities",
    "/programs",
    "/opportunities",
    "/ar/events",
    "/ar/news",
    "/فعاليات",
    "/أخبار",
];

const DEFAULT_REFUGEE_PRIMARY_URL: &str =
    "https://api.unhcr.org/population/v1/population/?coo=SYR&coa_all=true&limit=1";
const DEFAULT_REFUGEE_FALLBACK_URL: &str = "https://data.unhcr.org/en/situations/syria";

#[derive(Debug, Clone, Deserialize)]
pub struct SourceRegistry {
    pub sources: Vec<SourceEntry>,
}

#[derive(Debug, Clone, Deserialize)]
pub struct SourceEntry {
    pub url: String,
    #[serde(default)]
    pub name: Option<String>,
    #[serde(default = "enabled_by_default")]
    pub enabled: bool,
    #[serde(default = "enabled_by_default")]
    pub discover: bool,
}

fn enabled_by_default() -> bool {
    true
}

#[derive(Debug, Clone, PartialEq, Eq)]
pub struct ScrapeSource {
    pub url: String,
    /// Display label from the sources file, used in logs.
    pub name: Option<String>,
    pub discover: bool,
}

impl ScrapeSource {
    pub fn new(url: impl Into<String>) -> Self {
        Self {
            url: url.into(),
            name: None,
            discover: true,
        }
    }
}

#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum CacheBackendKind {
    Memory,
    File,
}

#[derive(Debug, Clone)]
pub struct ScoutConfig {
    pub sources: Vec<ScrapeSource>,
    pub discovery_enabled: bool,
    pub cache_backend: CacheBackendKind,
    pub cache_dir: PathBuf,
    pub events_ttl: Duration,
    pub http_timeout: Duration,
    pub user_agent: String,
    pub scrape_concurrency: usize,
    pub scheduler_enabled: bool,
    pub refresh_interval: Duration,
    pub refugee_primary_url: String,
    pub refugee_fallback_url: String,
    pub refugee_ttl: Duration,
    pub host: String,
    pub port: u16,
    pub cors_origins: Vec<String>,
}

impl Default for ScoutConfig {
    fn default() -> Self {
        Self {
            sources: Vec::new(),
            discovery_enabled: true,
            cache_backend: CacheBackendKind::Memory,
            cache_dir: PathBuf::from("./cache"),
            events_ttl: Duration::from_secs(3600),
            http_timeout: Duration::from_secs(15),
            user_agent: DEFAULT_USER_AGENT.to_string(),
            scrape_concurrency: 4,
            scheduler_enabled: true,
            refresh_interval: Duration::from_secs(6 * 60 * 60),
            refugee_primary_url: DEFAULT_REFUGEE_PRIMARY_URL.to_string(),
            refugee_fallback_url: DEFAULT_REFUGEE_FALLBACK_URL.to_string(),
            refugee_ttl: Duration::from_secs(24 * 60 * 60),
            host: "0.0.0.0".to_string(),
            port: 8080,
            cors_origins: Vec::new(),
        }
    }
}

fn parse_flag(value: &str) -> Option<bool> {
    match value.to_ascii_lowercase().as_str() {
        "1" | "true" | "yes" | "on" => Some(true),
        "0" | "false" | "no" | "off" => Some(false),
        _ => None,
    }
}

impl ScoutConfig {
    pub fn from_env() -> Result<Self> {
        Self::from_lookup(|key| std::env::var(key).ok())
    }

    /// Builds the config from any key lookup; blank values count as unset.
    pub fn from_lookup(lookup: impl Fn(&str) -> Option<String>) -> Result<Self> {
        let defaults = Self::default();
        let var = |key: &str| {
            lookup(key)
                .map(|v| v.trim().to_string())
                .filter(|v| !v.is_empty())
        };
        let flag = |key: &str, default: bool| var(key).and_then(|v| parse_flag(&v)).unwrap_or(default);
        let secs = |key: &str, default: Duration| {
            var(key)
                .and_then(|v| v.parse::<u64>().ok())
                .map(Duration::from_secs)
                .unwrap_or(default)
        };

        let mut raw_sources = Vec::new();
        if let Some(list) = var("SCRAPE_SOURCES") {
            raw_sources.extend(list.split(',').map(ScrapeSource::new));
        }
        if let Some(path) = var("SOURCES_FILE") {
            let registry = load_source_registry(Path::new(&path))?;
            raw_sources.extend(
                registry
                    .sources
                    .into_iter()
                    .filter(|s| s.enabled)
                    .map(|s| ScrapeSource {
                        url: s.url,
                        name: s.name,
                        discover: s.discover,
                    }),
            );
        }

        let cache_backend = match var("CACHE_BACKEND").map(|v| v.to_ascii_lowercase()).as_deref() {
            None | Some("memory") => CacheBackendKind::Memory,
            Some("file") => CacheBackendKind::File,
            Some(other) => bail!("unknown CACHE_BACKEND `{other}` (expected memory or file)"),
        };
        let port = var("PORT")
            .map(|p| p.parse::<u16>().with_context(|| format!("parsing PORT `{p}`")))
            .transpose()?
            .unwrap_or(defaults.port);

        Ok(Self {
            sources: normalize_sources(raw_sources),
            discovery_enabled: flag("DISCOVERY_ENABLED", defaults.discovery_enabled),
            cache_backend,
            cache_dir: var("CACHE_DIR").map(PathBuf::from).unwrap_or(defaults.cache_dir),
            events_ttl: secs("EVENTS_CACHE_TTL_SECS", defaults.events_ttl),
            http_timeout: secs("HTTP_TIMEOUT_SECS", defaults.http_timeout),
            user_agent: var("SCOUT_USER_AGENT").unwrap_or(defaults.user_agent),
            scrape_concurrency: var("SCRAPE_CONCURRENCY")
                .and_then(|v| v.parse::<usize>().ok())
                .filter(|n| *n > 0)
                .unwrap_or(defaults.scrape_concurrency),
            scheduler_enabled: flag("SCHEDULER_ENABLED", defaults.scheduler_enabled),
            refresh_interval: secs("REFRESH_INTERVAL_SECS", defaults.refresh_interval),
            refugee_primary_url: var("REFUGEE_PRIMARY_URL").unwrap_or(defaults.refugee_primary_url),
            refugee_fallback_url: var("REFUGEE_FALLBACK_URL")
                .unwrap_or(defaults.refugee_fallback_url),
            refugee_ttl: secs("REFUGEE_CACHE_TTL_SECS", defaults.refugee_ttl),
            host: var("HOST").unwrap_or(defaults.host),
            port,
            cors_origins: var("CORS_ORIGINS")
                .map(|v| {
                    v.split(',')
                        .map(str::trim)
                        .filter(|o| !o.is_empty())
                        .map(str::to_string)
                        .collect()
                })
                .unwrap_or_default(),
        })
    }

    pub fn http_client_config(&self) -> HttpClientConfig {
        HttpClientConfig {
            timeout: self.http_timeout,
            user_agent: self.user_agent.clone(),
            ..Default::default()
        }
    }

    pub fn cache_store(&self) -> CacheStore {
        match self.cache_backend {
            CacheBackendKind::Memory => CacheStore::in_memory(),
            CacheBackendKind::File => CacheStore::on_disk(self.cache_dir.clone()),
        }
    }

    pub fn bind_addr(&self) -> String {
        format!("{}:{}", self.host, self.port)
    }
}

pub fn load_source_registry(path: &Path) -> Result<SourceRegistry> {
    let text = std::fs::read_to_string(path)
        .with_context(|| format!("reading {}", path.display()))?;
    serde_yaml::from_str(&text).with_context(|| format!("parsing {}", path.display()))
}

/// Trims, drops invalid urls and keeps the first occurrence of each url.
pub fn normalize_sources(raw: Vec<ScrapeSource>) -> Vec<ScrapeSource> {
    let mut seen = HashSet::new();
    raw.into_iter()
        .filter_map(|mut source| {
            source.url = source.url.trim().to_string();
            if source.url.is_empty() {
                return None;
            }
            let valid = Url::parse(&source.url)
                .map(|u| matches!(u.scheme(), "http" | "https") && u.host_str().is_some())
                .unwrap_or(false);
            if !valid {
                warn!(url = %source.url, "skipping invalid source url");
                return None;
            }
            seen.insert(source.url.clone()).then_some(source)
        })
        .collect()
}

/// Keeps the first event per dedup key, then orders by priority descending.
/// The sort is stable, so equal priorities keep their input order.
pub fn dedupe_and_rank(events: Vec<Event>, limit: Option<usize>) -> Vec<Event> {
    let mut seen = HashSet::new();
    let mut kept: Vec<Event> = events
        .into_iter()
        .filter(|event| seen.insert(event.dedup_key()))
        .collect();
    kept.sort_by(|a, b| b.priority.cmp(&a.priority));
    if let Some(limit) = limit {
        kept.truncate(limit);
    }
    kept
}

#[derive(Debug, Error)]
pub enum ScrapeError {
    #[error("no scrape sources configured")]
    NoSources,
    #[error("all {attempted} source(s) failed")]
    AllSourcesFailed { attempted: usize },
}

#[derive(Debug, Clone, Serialize)]
pub struct ScrapeReport {
    pub run_id: Uuid,
    pub started_at: DateTime<Utc>,
    pub finished_at: DateTime<Utc>,
    pub sources_ok: usize,
    pub sources_failed: usize,
    pub pages_fetched: usize,
    pub pages_failed: usize,
    pub candidates: usize,
    pub rejected: usize,
    pub events: Vec<Event>,
}

#[derive(Debug, Default)]
struct SourceHarvest {
    candidates: Vec<CandidateEvent>,
    pages_fetched: usize,
    pages_failed: usize,
}

/// Parses and extracts in one synchronous step so the DOM never lives across
/// an await point.
fn harvest_page(
    body: &str,
    page_url: &str,
) -> Result<(Vec<CandidateEvent>, Vec<String>), ExtractError> {
    let ctx = ExtractContext::new(page_url)?;
    let document = parse_document(body)?;
    Ok((
        extract_document(&document, &ctx),
        discover_event_links(&document, &ctx),
    ))
}

pub struct ScrapeOrchestrator {
    fetcher: Arc<dyn PageFetcher>,
    limiter: Arc<DomainRateLimiter>,
    cache: CacheStore,
    sources: Vec<ScrapeSource>,
    discovery_enabled: bool,
    concurrency: usize,
    events_ttl: Duration,
}

impl std::fmt::Debug for ScrapeOrchestrator {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.debug_struct("ScrapeOrchestrator")
            .field("sources", &self.sources)
            .field("discovery_enabled", &self.discovery_enabled)
            .field("concurrency", &self.concurrency)
            .finish_non_exhaustive()
    }
}

impl ScrapeOrchestrator {
    pub fn new(
        fetcher: Arc<dyn PageFetcher>,
        limiter: Arc<DomainRateLimiter>,
        cache: CacheStore,
        sources: Vec<ScrapeSource>,
    ) -> Self {
        let defaults = ScoutConfig::default();
        Self {
            fetcher,
            limiter,
            cache,
            sources,
            discovery_enabled: defaults.discovery_enabled,
            concurrency: defaults.scrape_concurrency,
            events_ttl: defaults.events_ttl,
        }
    }

    pub fn from_config(config: &ScoutConfig, cache: CacheStore) -> Result<Self> {
        let fetcher = HttpFetcher::new(config.http_client_config())?;
        Ok(Self::new(
            Arc::new(fetcher),
            Arc::new(DomainRateLimiter::default()),
            cache,
            config.sources.clone(),
        )
        .with_discovery(config.discovery_enabled)
        .with_concurrency(config.scrape_concurrency)
        .with_events_ttl(config.events_ttl))
    }

    pub fn with_discovery(mut self, enabled: bool) -> Self {
        self.discovery_enabled = enabled;
        self
    }

    pub fn with_concurrency(mut self, concurrency: usize) -> Self {
        self.concurrency = concurrency.max(1);
        self
    }

    pub fn with_events_ttl(mut self, ttl: Duration) -> Self {
        self.events_ttl = ttl;
        self
    }

    pub fn fetcher(&self) -> Arc<dyn PageFetcher> {
        self.fetcher.clone()
    }

    pub fn cache(&self) -> &CacheStore {
        &self.cache
    }

    pub fn events_ttl(&self) -> Duration {
        self.events_ttl
    }

    pub fn sources(&self) -> &[ScrapeSource] {
        &self.sources
    }

    /// Scrapes every source and caches the ranked list under [`EVENTS_CACHE_KEY`].
    pub async fn run(&self) -> Result<Vec<Event>, ScrapeError> {
        Ok(self.run_report().await?.events)
    }

    pub async fn run_report(&self) -> Result<ScrapeReport, ScrapeError> {
        let report = self.scrape().await?;
        if !self
            .cache
            .set(EVENTS_CACHE_KEY, &report.events, self.events_ttl)
            .await
        {
            warn!(run_id = %report.run_id, "scraped events could not be cached");
        }
        Ok(report)
    }

    /// One full pass over the configured sources without touching the cache.
    /// Per-page and per-source failures are logged and skipped; only a run in
    /// which no source succeeded is an error.
    pub async fn scrape(&self) -> Result<ScrapeReport, ScrapeError> {
        if self.sources.is_empty() {
            return Err(ScrapeError::NoSources);
        }
        let run_id = Uuid::new_v4();
        let started_at = Utc::now();
        let span = info_span!("scrape_run", %run_id, sources = self.sources.len());

        async move {
            let results: Vec<_> = stream::iter(self.sources.clone().into_iter().map(|source| async move {
                let span = info_span!(
                    "scrape_source",
                    url = %source.url,
                    name = source.name.as_deref().unwrap_or("")
                );
                let result = self.scrape_source(&source).instrument(span).await;
                (source, result)
            }))
            .buffered(self.concurrency)
            .collect()
            .await;

            let mut harvest = SourceHarvest::default();
            let (mut sources_ok, mut sources_failed) = (0usize, 0usize);
            for (source, result) in results {
                match result {
                    Ok(found) => {
                        sources_ok += 1;
                        harvest.pages_fetched += found.pages_fetched;
                        harvest.pages_failed += found.pages_failed;
                        harvest.candidates.extend(found.candidates);
                    }
                    Err(err) => {
                        sources_failed += 1;
                        let error = format!("{err:#}");
                        warn!(source = %source.url, %error, "source scrape failed");
                    }
                }
            }
            if sources_ok == 0 {
                return Err(ScrapeError::AllSourcesFailed {
                    attempted: self.sources.len(),
                });
            }

            let candidates = harvest.candidates.len();
            let validated: Vec<Event> = harvest
                .candidates
                .into_iter()
                .filter_map(|candidate| {
                    let title = candidate.title.clone();
                    validate(candidate)
                        .map_err(|reason| debug!(%title, %reason, "discarding candidate"))
                        .ok()
                })
                .collect();
            let rejected = candidates - validated.len();
            let events = dedupe_and_rank(validated, None);

            info!(
                events = events.len(),
                candidates,
                rejected,
                sources_ok,
                sources_failed,
                pages_fetched = harvest.pages_fetched,
                "scrape finished"
            );
            Ok(ScrapeReport {
                run_id,
                started_at,
                finished_at: Utc::now(),
                sources_ok,
                sources_failed,
                pages_fetched: harvest.pages_fetched,
                pages_failed: harvest.pages_failed,
                candidates,
                rejected,
                events,
            })
        }
        .instrument(span)
        .await
    }

    async fn fetch_page(&self, url: &str) -> Result<FetchedPage, FetchError> {
        if let Some(domain) = domain_of(url) {
            self.limiter.wait_turn(&domain).await;
        }
        self.fetcher.fetch(url).await
    }

    async fn page_exists(&self, url: &str) -> bool {
        if let Some(domain) = domain_of(url) {
            self.limiter.wait_turn(&domain).await;
        }
        self.fetcher.probe(url).await
    }

    async fn scrape_source(&self, source: &ScrapeSource) -> Result<SourceHarvest> {
        let landing = self
            .fetch_page(&source.url)
            .await
            .with_context(|| format!("fetching {}", source.url))?;
        let (candidates, links) = harvest_page(&landing.body, &source.url)
            .with_context(|| format!("extracting {}", source.url))?;
        let mut harvest = SourceHarvest {
            candidates,
            pages_fetched: 1,
            pages_failed: 0,
        };

        if !(self.discovery_enabled && source.discover) {
            return Ok(harvest);
        }
        for page in self.discover_pages(&source.url, links).await {
            let outcome = match self.fetch_page(&page).await {
                Ok(fetched) => harvest_page(&fetched.body, &page).map_err(anyhow::Error::from),
                Err(err) => Err(err.into()),
            };
            match outcome {
                Ok((found, _)) => {
                    harvest.pages_fetched += 1;
                    harvest.candidates.extend(found);
                }
                Err(err) => {
                    harvest.pages_failed += 1;
                    let error = format!("{err:#}");
                    warn!(%page, %error, "page scrape failed");
                }
            }
        }
        Ok(harvest)
    }

    /// Up to [`MAX_DISCOVERED_PAGES`] sub-pages: probed suffixes first, then
    /// listing links found on the landing page.
    pub async fn discover_pages(&self, base_url: &str, links: Vec<String>) -> Vec<String> {
        let Ok(base) = Url::parse(base_url) else {
            return Vec::new();
        };
        let mut seen = HashSet::from([base.to_string()]);
        let mut pages = Vec::new();

        for suffix in DISCOVERY_SUFFIXES {
            if pages.len() >= MAX_DISCOVERED_PAGES {
                break;
            }
            let Ok(candidate) = base.join(suffix) else {
                continue;
            };
            let candidate = candidate.to_string();
            if seen.insert(candidate.clone()) && self.page_exists(&candidate).await {
                pages.push(candidate);
            }
        }
        for link in links {
            if pages.len() >= MAX_DISCOVERED_PAGES {
                break;
            }
            if seen.insert(link.clone()) {
                pages.push(link);
            }
        }
        debug!(base = %base, discovered = pages.len(), "discovered sub-pages");
        pages
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use std::collections::HashMap;

    fn event(title: &str, date: Option<&str>, priority: u8) -> Event {
        Event {
            id: format!("example-{title}"),
            title: title.to_string(),
            description: None,
            date: date.map(str::to_string),
            time: None,
            location: None,
            link: None,
            source: "https://example.org".into(),
            organizer: "example".into(),
            priority,
            category: "general".into(),
            deadline: false,
            tags: vec![],
        }
    }

    fn lookup(pairs: &[(&str, &str)]) -> impl Fn(&str) -> Option<String> {
        let map: HashMap<String, String> = pairs
            .iter()
            .map(|(k, v)| (k.to_string(), v.to_string()))
            .collect();
        move |key: &str| map.get(key).cloned()
    }

    #[test]
    fn dedupe_keeps_first_and_is_case_insensitive() {
        let ranked = dedupe_and_rank(
            vec![
                event("Community Meetup", Some("15/12/2024"), 2),
                event("community meetup", Some("15/12/2024"), 9),
                event("Community Meetup", None, 1),
            ],
            None,
        );
        assert_eq!(ranked.len(), 2);
        assert_eq!(ranked[0].priority, 2);
        assert_eq!(ranked[0].title, "Community Meetup");
    }

    #[test]
    fn ranking_is_stable_for_equal_priorities() {
        let ranked = dedupe_and_rank(
            vec![
                event("Alpha event", None, 3),
                event("Bravo event", None, 5),
                event("Charlie event", None, 3),
                event("Delta event", None, 5),
            ],
            None,
        );
        let titles: Vec<_> = ranked.iter().map(|e| e.title.as_str()).collect();
        assert_eq!(
            titles,
            vec!["Bravo event", "Delta event", "Alpha event", "Charlie event"]
        );
    }

    #[test]
    fn dedupe_is_idempotent_and_limit_truncates() {
        let input = vec![
            event("Alpha event", None, 1),
            event("Bravo event", None, 4),
            event("Alpha event", None, 7),
            event("Charlie event", None, 4),
        ];
        let once = dedupe_and_rank(input, None);
        let twice = dedupe_and_rank(once.clone(), None);
        assert_eq!(once, twice);
        assert_eq!(dedupe_and_rank(once, Some(2)).len(), 2);
    }

    #[test]
    fn config_defaults_without_environment() {
        let config = ScoutConfig::from_lookup(|_| None).unwrap();
        assert!(config.sources.is_empty());
        assert_eq!(config.events_ttl, Duration::from_secs(3600));
        assert_eq!(config.refresh_interval, Duration::from_secs(21600));
        assert_eq!(config.cache_backend, CacheBackendKind::Memory);
        assert_eq!(config.bind_addr(), "0.0.0.0:8080");
        assert!(config.scheduler_enabled);
    }

    #[test]
    fn config_reads_and_normalizes_sources() {
        let config = ScoutConfig::from_lookup(lookup(&[
            (
                "SCRAPE_SOURCES",
                " https://a.example.org , not-a-url,https://b.example.org,https://a.example.org",
            ),
            ("CACHE_BACKEND", "FILE"),
            ("CACHE_DIR", "/tmp/scout"),
            ("SCHEDULER_ENABLED", "false"),
            ("PORT", "9090"),
            ("CORS_ORIGINS", "https://site.example, https://admin.example"),
        ]))
        .unwrap();
        let urls: Vec<_> = config.sources.iter().map(|s| s.url.as_str()).collect();
        assert_eq!(urls, vec!["https://a.example.org", "https://b.example.org"]);
        assert_eq!(config.cache_backend, CacheBackendKind::File);
        assert_eq!(config.cache_dir, PathBuf::from("/tmp/scout"));
        assert!(!config.scheduler_enabled);
        assert_eq!(config.port, 9090);
        assert_eq!(config.cors_origins.len(), 2);
    }

    #[test]
    fn config_rejects_unknown_backend_and_bad_port() {
        assert!(ScoutConfig::from_lookup(lookup(&[("CACHE_BACKEND", "redis")])).is_err());
        assert!(ScoutConfig::from_lookup(lookup(&[("PORT", "eighty")])).is_err());
    }

    #[test]
    fn sources_file_is_merged_after_env_list() {
        let dir = tempfile::tempdir().unwrap();
        let path = dir.path().join("sources.yaml");
        std::fs::write(
            &path,
            r#"sources:
  - url: https://b.example.org
    name: Bravo
  - url: https://c.example.org
    name: Charlie
    discover: false
  - url: https://d.example.org
    enabled: false
"#,
        )
        .unwrap();
        let file = path.display().to_string();
        let config = ScoutConfig::from_lookup(lookup(&[
            ("SCRAPE_SOURCES", "https://a.example.org,https://b.example.org"),
            ("SOURCES_FILE", file.as_str()),
        ]))
        .unwrap();
        assert_eq!(
            config.sources,
            vec![
                ScrapeSource::new("https://a.example.org"),
                ScrapeSource::new("https://b.example.org"),
                ScrapeSource {
                    url: "https://c.example.org".into(),
                    name: Some("Charlie".into()),
                    discover: false
                },
            ]
        );
    }
}
