//! Periodic refresh: tasks, a runner with skip-if-fresh and retry, and the
//! cron-style scheduler that drives it.

use std::fmt;
use std::sync::{Arc, LazyLock};
use std::time::Duration;

use anyhow::{anyhow, bail, Context, Result};
use async_trait::async_trait;
use chrono::{DateTime, Utc};
use eventscout_extract::{parse_document, text_lines};
use eventscout_storage::{BackoffPolicy, CacheStore, PageFetcher};
use regex::Regex;
use serde::{Deserialize, Serialize};
use serde_json::Value as JsonValue;
use tokio_cron_scheduler::{Job, JobScheduler};
use tracing::{info, info_span, warn, Instrument};

use crate::{ScrapeOrchestrator, EVENTS_CACHE_KEY, REFUGEE_COUNT_CACHE_KEY};

/// Fraction of the TTL after which a cached value is worth refreshing.
const FRESH_FRACTION: f64 = 0.8;

const COUNT_FIELDS: &[&str] = &["refugees", "total", "value"];

static LARGE_NUMBER: LazyLock<Regex> = LazyLock::new(|| {
    Regex::new(r"[0-9]{1,3}(?:[,\x{066C}\x{00A0} ][0-9]{3})+|[0-9]{4,}").expect("valid number regex")
});

/// One fetch-and-cache unit driven by [`RefreshRunner`].
#[async_trait]
pub trait RefreshTask: Send + Sync {
    fn name(&self) -> &str;
    fn cache_key(&self) -> &str;
    fn ttl(&self) -> Duration;
    async fn fetch(&self) -> Result<JsonValue>;
}

#[derive(Debug, Clone, PartialEq, Eq, Serialize)]
#[serde(tag = "outcome", content = "reason", rename_all = "snake_case")]
pub enum TaskOutcome {
    Refreshed,
    Skipped,
    Failed(String),
}

impl fmt::Display for TaskOutcome {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        match self {
            TaskOutcome::Refreshed => write!(f, "refreshed"),
            TaskOutcome::Skipped => write!(f, "skipped (fresh)"),
            TaskOutcome::Failed(reason) => write!(f, "failed: {reason}"),
        }
    }
}

#[derive(Debug, Clone)]
pub struct RefreshRunner {
    cache: CacheStore,
    backoff: BackoffPolicy,
}

impl RefreshRunner {
    /// Three attempts, 1s doubling up to 10s between them.
    pub fn new(cache: CacheStore) -> Self {
        Self {
            cache,
            backoff: BackoffPolicy {
                max_retries: 2,
                base_delay: Duration::from_secs(1),
                max_delay: Duration::from_secs(10),
            },
        }
    }

    pub fn with_backoff(mut self, backoff: BackoffPolicy) -> Self {
        self.backoff = backoff;
        self
    }

    pub async fn is_fresh(&self, task: &dyn RefreshTask) -> bool {
        match self.cache.entry_age(task.cache_key()).await {
            Some(age) => age < task.ttl().mul_f64(FRESH_FRACTION),
            None => false,
        }
    }

    pub async fn run_task(&self, task: &dyn RefreshTask) -> TaskOutcome {
        if self.is_fresh(task).await {
            info!(task = task.name(), "cached value still fresh; skipping");
            return TaskOutcome::Skipped;
        }

        let attempts = self.backoff.attempts();
        let mut last_error = None;
        for attempt in 0..attempts {
            match task.fetch().await {
                Ok(value) => {
                    if !self.cache.set(task.cache_key(), &value, task.ttl()).await {
                        warn!(task = task.name(), "refreshed value could not be cached");
                    }
                    info!(task = task.name(), attempt = attempt + 1, "task refreshed");
                    return TaskOutcome::Refreshed;
                }
                Err(err) => {
                    let error = format!("{err:#}");
                    warn!(task = task.name(), attempt = attempt + 1, %error, "task attempt failed");
                    last_error = Some(error);
                    if attempt + 1 < attempts {
                        tokio::time::sleep(self.backoff.delay_before_retry(attempt)).await;
                    }
                }
            }
        }
        TaskOutcome::Failed(last_error.unwrap_or_else(|| "no attempts made".to_string()))
    }

    /// Runs every task in order; a failure never stops the ones after it.
    pub async fn run_cycle(&self, tasks: &[Arc<dyn RefreshTask>]) -> Vec<(String, TaskOutcome)> {
        let mut outcomes = Vec::with_capacity(tasks.len());
        for task in tasks {
            let outcome = self
                .run_task(task.as_ref())
                .instrument(info_span!("refresh_task", task = task.name()))
                .await;
            if let TaskOutcome::Failed(reason) = &outcome {
                warn!(task = task.name(), %reason, "task failed after retries");
            }
            outcomes.push((task.name().to_string(), outcome));
        }
        outcomes
    }
}

/// Re-scrapes every source. An empty result counts as a failure so a good
/// cached list is never replaced by nothing.
pub struct EventsRefreshTask {
    orchestrator: Arc<ScrapeOrchestrator>,
}

impl EventsRefreshTask {
    pub fn new(orchestrator: Arc<ScrapeOrchestrator>) -> Self {
        Self { orchestrator }
    }
}

#[async_trait]
impl RefreshTask for EventsRefreshTask {
    fn name(&self) -> &str {
        "events"
    }

    fn cache_key(&self) -> &str {
        EVENTS_CACHE_KEY
    }

    fn ttl(&self) -> Duration {
        self.orchestrator.events_ttl()
    }

    async fn fetch(&self) -> Result<JsonValue> {
        let report = self.orchestrator.scrape().await?;
        if report.events.is_empty() {
            bail!(
                "scrape of {} source(s) produced no events",
                self.orchestrator.sources().len()
            );
        }
        serde_json::to_value(&report.events).context("serializing events")
    }
}

#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "camelCase")]
pub struct RefugeeCount {
    pub count: u64,
    pub source: String,
    pub fetched_at: DateTime<Utc>,
}

/// Number of registered Syrian refugees, from a JSON API with an HTML page as
/// fallback.
pub struct RefugeeCountTask {
    fetcher: Arc<dyn PageFetcher>,
    primary_url: String,
    fallback_url: String,
    ttl: Duration,
}

impl RefugeeCountTask {
    pub fn new(
        fetcher: Arc<dyn PageFetcher>,
        primary_url: impl Into<String>,
        fallback_url: impl Into<String>,
        ttl: Duration,
    ) -> Self {
        Self {
            fetcher,
            primary_url: primary_url.into(),
            fallback_url: fallback_url.into(),
            ttl,
        }
    }

    async fn count_from(&self, url: &str) -> Result<u64> {
        let page = self.fetcher.fetch(url).await?;
        let body = page.body.trim_start();
        let count = if page.is_json() || body.starts_with('{') || body.starts_with('[') {
            let value: JsonValue =
                serde_json::from_str(body).with_context(|| format!("decoding json from {url}"))?;
            parse_refugee_count_json(&value)
        } else {
            parse_refugee_count_html(body)
        };
        count.ok_or_else(|| anyhow!("no refugee count found at {url}"))
    }
}

#[async_trait]
impl RefreshTask for RefugeeCountTask {
    fn name(&self) -> &str {
        "refugee_count"
    }

    fn cache_key(&self) -> &str {
        REFUGEE_COUNT_CACHE_KEY
    }

    fn ttl(&self) -> Duration {
        self.ttl
    }

    async fn fetch(&self) -> Result<JsonValue> {
        let (count, source) = match self.count_from(&self.primary_url).await {
            Ok(count) => (count, self.primary_url.clone()),
            Err(primary_err) => {
                let error = format!("{primary_err:#}");
                warn!(url = %self.primary_url, %error, "primary refugee source failed; trying fallback");
                let count = self
                    .count_from(&self.fallback_url)
                    .await
                    .context("fallback refugee source failed")?;
                (count, self.fallback_url.clone())
            }
        };
        let result = RefugeeCount {
            count,
            source,
            fetched_at: Utc::now(),
        };
        serde_json::to_value(&result).context("serializing refugee count")
    }
}

fn json_count(value: &JsonValue) -> Option<u64> {
    match value {
        JsonValue::Number(n) => n.as_u64().or_else(|| {
            n.as_f64()
                .filter(|f| f.is_finite() && *f >= 0.0)
                .map(|f| f as u64)
        }),
        JsonValue::String(s) => digits_to_count(s),
        _ => None,
    }
}

/// First numeric `refugees`, `total` or `value` field, depth first.
pub fn parse_refugee_count_json(value: &JsonValue) -> Option<u64> {
    match value {
        JsonValue::Object(map) => COUNT_FIELDS
            .iter()
            .find_map(|field| map.get(*field).and_then(json_count))
            .or_else(|| map.values().find_map(parse_refugee_count_json)),
        JsonValue::Array(items) => items.iter().find_map(parse_refugee_count_json),
        _ => None,
    }
}

fn digits_to_count(raw: &str) -> Option<u64> {
    let digits: String = raw.chars().filter(char::is_ascii_digit).collect();
    if digits.is_empty() {
        return None;
    }
    digits.parse().ok()
}

/// First number of four or more digits on a line that mentions refugees.
pub fn parse_refugee_count_html(html: &str) -> Option<u64> {
    let document = parse_document(html).ok()?;
    text_lines(document.root_element())
        .iter()
        .filter(|line| {
            let lower = line.to_lowercase();
            lower.contains("refugee") || lower.contains("لاجئ")
        })
        .find_map(|line| LARGE_NUMBER.find(line).and_then(|m| digits_to_count(m.as_str())))
}

/// Runs all tasks once at startup and then every `interval`.
pub struct RefreshScheduler {
    runner: Arc<RefreshRunner>,
    tasks: Arc<Vec<Arc<dyn RefreshTask>>>,
    interval: Duration,
}

impl RefreshScheduler {
    pub fn new(runner: RefreshRunner, tasks: Vec<Arc<dyn RefreshTask>>, interval: Duration) -> Self {
        Self {
            runner: Arc::new(runner),
            tasks: Arc::new(tasks),
            interval,
        }
    }

    pub async fn start(&self) -> Result<JobScheduler> {
        let sched = JobScheduler::new().await.context("creating scheduler")?;

        let runner = self.runner.clone();
        let tasks = self.tasks.clone();
        let job = Job::new_repeated_async(self.interval, move |_uuid, _l| {
            let runner = runner.clone();
            let tasks = tasks.clone();
            Box::pin(async move {
                info!("scheduled refresh cycle starting");
                runner.run_cycle(&tasks).await;
            })
        })
        .context("creating refresh job")?;
        sched.add(job).await.context("adding refresh job")?;
        sched.start().await.context("starting scheduler")?;

        let runner = self.runner.clone();
        let tasks = self.tasks.clone();
        tokio::spawn(async move {
            info!("startup refresh cycle starting");
            runner.run_cycle(&tasks).await;
        });

        info!(interval_secs = self.interval.as_secs(), tasks = self.tasks.len(), "refresh scheduler started");
        Ok(sched)
    }
}
