//! Cache-aside access to the ranked event list, shared by the API and CLI.

use std::sync::Arc;
use std::time::Duration;

use chrono::{DateTime, NaiveDate, Utc};
use eventscout_core::{canonical_category, validate, CandidateEvent, Event, ValidationError};
use eventscout_extract::patterns::parse_date;
use eventscout_extract::scoring::{detect_tags, is_deadline, score_priority};
use eventscout_extract::{make_id, organizer_from_url, slugify};
use eventscout_storage::CacheStore;
use serde::Deserialize;
use tokio::sync::Mutex;
use tracing::{debug, info, warn};
use url::Url;

use crate::{
    dedupe_and_rank, RefugeeCount, ScrapeError, ScrapeOrchestrator, EVENTS_CACHE_KEY,
    REFUGEE_COUNT_CACHE_KEY,
};

pub const FEATURED_MIN_PRIORITY: u8 = 3;
pub const FEATURED_LIMIT: usize = 10;
pub const DEADLINES_LIMIT: usize = 20;

#[derive(Debug, Clone, PartialEq)]
pub struct EventsSnapshot {
    pub events: Vec<Event>,
    pub last_updated: DateTime<Utc>,
    pub from_cache: bool,
}

/// Body of a manual submission. Every field is optional on the wire so that a
/// missing field surfaces as a validation error rather than a decode error.
#[derive(Debug, Clone, Default, Deserialize)]
pub struct EventSubmission {
    pub title: Option<String>,
    pub description: Option<String>,
    pub date: Option<String>,
    pub time: Option<String>,
    pub location: Option<String>,
    pub link: Option<String>,
    pub source: Option<String>,
    pub organizer: Option<String>,
    pub category: Option<String>,
    pub priority: Option<i64>,
    pub deadline: Option<bool>,
    pub tags: Option<Vec<String>>,
}

fn non_blank(value: Option<String>) -> Option<String> {
    value
        .map(|v| v.trim().to_string())
        .filter(|v| !v.is_empty())
}

impl EventSubmission {
    /// `source` falls back to `link`; priority, deadline and tags are computed
    /// the way the extractor computes them when the caller leaves them out.
    pub fn into_candidate(self, today: NaiveDate) -> CandidateEvent {
        let title = non_blank(self.title).unwrap_or_default();
        let description = non_blank(self.description);
        let date = non_blank(self.date);
        let link = non_blank(self.link);
        let source = non_blank(self.source)
            .or_else(|| link.clone())
            .unwrap_or_default();
        let organizer = non_blank(self.organizer).unwrap_or_default();

        let scored_text = match &description {
            Some(description) => format!("{title} {description}"),
            None => title.clone(),
        };
        let id_prefix = Url::parse(&source)
            .ok()
            .filter(|u| u.host_str().is_some())
            .map(|u| organizer_from_url(&u))
            .unwrap_or_else(|| slugify(&organizer));

        CandidateEvent {
            id: make_id(&id_prefix, &title),
            priority: self.priority.unwrap_or_else(|| {
                score_priority(&scored_text, date.as_deref().and_then(parse_date), today)
            }),
            deadline: self.deadline.unwrap_or_else(|| is_deadline(&scored_text)),
            tags: self.tags.unwrap_or_else(|| detect_tags(&scored_text)),
            category: non_blank(self.category)
                .map(|c| canonical_category(&c).map_or(c, str::to_string))
                .unwrap_or_default(),
            time: non_blank(self.time),
            location: non_blank(self.location),
            title,
            description,
            date,
            link,
            source,
            organizer,
        }
    }
}

#[derive(Clone)]
pub struct EventService {
    orchestrator: Arc<ScrapeOrchestrator>,
    cache: CacheStore,
    scrape_lock: Arc<Mutex<()>>,
}

impl std::fmt::Debug for EventService {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.debug_struct("EventService")
            .field("orchestrator", &self.orchestrator)
            .finish_non_exhaustive()
    }
}

impl EventService {
    pub fn new(orchestrator: Arc<ScrapeOrchestrator>) -> Self {
        let cache = orchestrator.cache().clone();
        Self {
            orchestrator,
            cache,
            scrape_lock: Arc::new(Mutex::new(())),
        }
    }

    pub fn orchestrator(&self) -> &Arc<ScrapeOrchestrator> {
        &self.orchestrator
    }

    pub fn cache(&self) -> &CacheStore {
        &self.cache
    }

    pub async fn cached_events(&self) -> Option<EventsSnapshot> {
        self.cache
            .get_entry::<Vec<Event>>(EVENTS_CACHE_KEY)
            .await
            .map(|cached| EventsSnapshot {
                events: cached.value,
                last_updated: cached.stored_at,
                from_cache: true,
            })
    }

    /// Cached list when live, otherwise one scrape that fills the cache.
    /// Concurrent misses wait for the scrape already in flight.
    pub async fn get_events(&self) -> Result<EventsSnapshot, ScrapeError> {
        if let Some(snapshot) = self.cached_events().await {
            return Ok(snapshot);
        }
        let _guard = self.scrape_lock.lock().await;
        if let Some(snapshot) = self.cached_events().await {
            return Ok(snapshot);
        }
        info!("events cache miss; scraping sources");
        self.scrape_and_cache().await
    }

    /// Re-scrapes regardless of cache state. The cached list is only replaced
    /// when the scrape succeeds.
    pub async fn refresh(&self) -> Result<EventsSnapshot, ScrapeError> {
        let _guard = self.scrape_lock.lock().await;
        info!("forced events refresh");
        self.scrape_and_cache().await
    }

    async fn scrape_and_cache(&self) -> Result<EventsSnapshot, ScrapeError> {
        let events = self.orchestrator.run().await?;
        Ok(EventsSnapshot {
            events,
            last_updated: Utc::now(),
            from_cache: false,
        })
    }

    /// High-priority slice of the ranked list.
    pub async fn featured(&self) -> Result<EventsSnapshot, ScrapeError> {
        let mut snapshot = self.get_events().await?;
        snapshot.events = snapshot
            .events
            .into_iter()
            .filter(|e| e.priority > FEATURED_MIN_PRIORITY)
            .take(FEATURED_LIMIT)
            .collect();
        Ok(snapshot)
    }

    pub async fn deadlines(&self) -> Result<EventsSnapshot, ScrapeError> {
        let mut snapshot = self.get_events().await?;
        snapshot.events = snapshot
            .events
            .into_iter()
            .filter(|e| e.deadline)
            .take(DEADLINES_LIMIT)
            .collect();
        Ok(snapshot)
    }

    /// Validates a manual submission and adds it to the cached list, keeping
    /// whatever lifetime the cached entry had left. A listed event with the same
    /// title and date is replaced by the submission.
    pub async fn add_event(&self, submission: EventSubmission) -> Result<Event, ValidationError> {
        let event = validate(submission.into_candidate(Utc::now().date_naive()))?;

        if let Err(err) = self.get_events().await {
            warn!(error = %err, "no scraped list to append to; starting a new one");
        }

        let _guard = self.scrape_lock.lock().await;
        let (mut events, ttl) = match self.cache.get_entry::<Vec<Event>>(EVENTS_CACHE_KEY).await {
            Some(cached) => {
                let remaining = (cached.expires_at - Utc::now())
                    .to_std()
                    .unwrap_or(Duration::ZERO);
                (cached.value, remaining)
            }
            None => (Vec::new(), self.orchestrator.events_ttl()),
        };
        // the submission goes first so it wins its dedup key over a listed copy
        let key = event.dedup_key();
        if let Some(listed) = events.iter().find(|e| e.dedup_key() == key) {
            debug!(%key, replaced = %listed.id, "submitted event replaces a listed one");
        }
        events.insert(0, event.clone());
        let events = dedupe_and_rank(events, None);
        self.cache.set(EVENTS_CACHE_KEY, &events, ttl).await;
        Ok(event)
    }

    pub async fn refugee_count(&self) -> Option<RefugeeCount> {
        self.cache.get(REFUGEE_COUNT_CACHE_KEY).await
    }
}
