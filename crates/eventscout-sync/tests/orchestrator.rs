use std::collections::{HashMap, HashSet};
use std::sync::atomic::{AtomicUsize, Ordering};
use std::sync::{Arc, Mutex};
use std::time::{Duration, Instant};

use async_trait::async_trait;
use eventscout_core::ValidationError;
use eventscout_storage::{BackoffPolicy, CacheStore, DomainRateLimiter, FetchError, FetchedPage, PageFetcher};
use eventscout_sync::{
    EventService, EventSubmission, EventsRefreshTask, RefreshRunner, RefreshTask, RefugeeCount,
    RefugeeCountTask, ScrapeError, ScrapeOrchestrator, ScrapeSource, TaskOutcome,
    EVENTS_CACHE_KEY, REFUGEE_COUNT_CACHE_KEY,
};

const WORKSHOP_CARD: &str = r#"<div class="event"><h2>Workshop on Digital Marketing</h2><p>Date: 15/12/2024</p><p>Location: Damascus, Syria</p></div>"#;

#[derive(Default)]
struct FakeFetcher {
    pages: HashMap<String, String>,
    failing: HashSet<String>,
    probe_ok: HashSet<String>,
    probe_all: bool,
    json: bool,
    fetches: AtomicUsize,
    fetched_at: Mutex<Vec<Instant>>,
    checked_at: Mutex<Vec<Instant>>,
}

impl FakeFetcher {
    fn with_page(mut self, url: &str, body: &str) -> Self {
        self.pages.insert(url.to_string(), body.to_string());
        self
    }

    fn with_failure(mut self, url: &str) -> Self {
        self.failing.insert(url.to_string());
        self
    }

    fn with_probe(mut self, url: &str) -> Self {
        self.probe_ok.insert(url.to_string());
        self
    }

    fn fetches(&self) -> usize {
        self.fetches.load(Ordering::SeqCst)
    }

    fn fetch_gaps(&self) -> Vec<Duration> {
        gaps(&self.fetched_at.lock().unwrap())
    }

    fn check_gaps(&self) -> Vec<Duration> {
        gaps(&self.checked_at.lock().unwrap())
    }
}

fn gaps(times: &[Instant]) -> Vec<Duration> {
    let mut times = times.to_vec();
    times.sort();
    times.windows(2).map(|w| w[1] - w[0]).collect()
}

#[async_trait]
impl PageFetcher for FakeFetcher {
    async fn fetch(&self, url: &str) -> Result<FetchedPage, FetchError> {
        self.fetches.fetch_add(1, Ordering::SeqCst);
        self.fetched_at.lock().unwrap().push(Instant::now());
        if self.failing.contains(url) {
            return Err(FetchError::HttpStatus {
                status: 504,
                reason: "Gateway Timeout".into(),
                url: url.to_string(),
            });
        }
        match self.pages.get(url) {
            Some(body) => Ok(FetchedPage {
                url: url.to_string(),
                final_url: url.to_string(),
                status: 200,
                content_type: if self.json {
                    "application/json".into()
                } else {
                    "text/html; charset=utf-8".into()
                },
                body: body.clone(),
            }),
            None => Err(FetchError::HttpStatus {
                status: 404,
                reason: "Not Found".into(),
                url: url.to_string(),
            }),
        }
    }

    async fn probe(&self, url: &str) -> bool {
        self.checked_at.lock().unwrap().push(Instant::now());
        self.probe_all || self.probe_ok.contains(url)
    }
}

fn orchestrator(fetcher: Arc<FakeFetcher>, sources: &[&str]) -> ScrapeOrchestrator {
    ScrapeOrchestrator::new(
        fetcher,
        Arc::new(DomainRateLimiter::new(Duration::ZERO, Duration::ZERO)),
        CacheStore::in_memory(),
        sources.iter().map(|url| ScrapeSource::new(*url)).collect(),
    )
    .with_discovery(false)
}

#[tokio::test]
async fn structured_card_is_scraped_and_cached() {
    let fetcher = Arc::new(FakeFetcher::default().with_page("https://example.org/", WORKSHOP_CARD));
    let orchestrator = orchestrator(fetcher.clone(), &["https://example.org/"]);

    let events = orchestrator.run().await.unwrap();
    assert_eq!(events.len(), 1);
    let event = &events[0];
    assert_eq!(event.title, "Workshop on Digital Marketing");
    assert_eq!(event.date.as_deref(), Some("15/12/2024"));
    assert_eq!(event.organizer, "example");
    assert_eq!(event.category, "workshop");

    let cached: Vec<eventscout_core::Event> =
        orchestrator.cache().get(EVENTS_CACHE_KEY).await.unwrap();
    assert_eq!(cached, events);
}

#[tokio::test]
async fn card_and_link_collapse_into_one_event() {
    let html = r#"
        <div class="event-item">
          <h3>Community Meetup</h3>
          <p>Join our networking evening.</p>
        </div>
        <a href="/events/community-meetup">Community Meetup</a>"#;
    let fetcher = Arc::new(FakeFetcher::default().with_page("https://example.org/", html));
    let events = orchestrator(fetcher, &["https://example.org/"])
        .run()
        .await
        .unwrap();

    let meetups = events
        .iter()
        .filter(|e| e.title.eq_ignore_ascii_case("community meetup"))
        .count();
    assert_eq!(meetups, 1);
}

#[tokio::test]
async fn second_read_is_served_from_cache() {
    let fetcher = Arc::new(FakeFetcher::default().with_page("https://example.org/", WORKSHOP_CARD));
    let service = EventService::new(Arc::new(orchestrator(fetcher.clone(), &["https://example.org/"])));

    let first = service.get_events().await.unwrap();
    assert!(!first.from_cache);
    assert_eq!(fetcher.fetches(), 1);

    let second = service.get_events().await.unwrap();
    assert!(second.from_cache);
    assert_eq!(second.events, first.events);
    assert_eq!(fetcher.fetches(), 1);
}

#[tokio::test]
async fn concurrent_misses_share_one_scrape() {
    let fetcher = Arc::new(FakeFetcher::default().with_page("https://example.org/", WORKSHOP_CARD));
    let service = EventService::new(Arc::new(orchestrator(fetcher.clone(), &["https://example.org/"])));

    let handles: Vec<_> = (0..2)
        .map(|_| {
            let service = service.clone();
            tokio::spawn(async move { service.get_events().await })
        })
        .collect();
    let mut lists = Vec::new();
    for handle in handles {
        lists.push(handle.await.unwrap().unwrap().events);
    }
    assert_eq!(lists[0], lists[1]);
    assert_eq!(fetcher.fetches(), 1);
}

#[tokio::test]
async fn same_domain_sources_wait_their_turn() {
    let fetcher = Arc::new(
        FakeFetcher::default()
            .with_page("https://example.org/a", WORKSHOP_CARD)
            .with_page("https://example.org/b", WORKSHOP_CARD)
            .with_page("https://example.org/c", WORKSHOP_CARD),
    );
    let orchestrator = Arc::new(
        ScrapeOrchestrator::new(
            fetcher.clone(),
            Arc::new(DomainRateLimiter::default()),
            CacheStore::in_memory(),
            ["a", "b", "c"]
                .iter()
                .map(|p| ScrapeSource::new(format!("https://example.org/{p}")))
                .collect(),
        )
        .with_discovery(false)
        .with_concurrency(3),
    );

    let report = tokio::spawn({
        let orchestrator = orchestrator.clone();
        async move { orchestrator.scrape().await }
    })
    .await
    .unwrap()
    .unwrap();

    assert_eq!(report.sources_ok, 3);
    let gaps = fetcher.fetch_gaps();
    assert_eq!(gaps.len(), 2);
    for gap in gaps {
        assert!(gap >= Duration::from_millis(990), "same-domain fetches {gap:?} apart");
    }
}

#[tokio::test]
async fn failing_source_does_not_sink_the_run() {
    let fetcher = Arc::new(
        FakeFetcher::default()
            .with_page("https://example.org/", WORKSHOP_CARD)
            .with_failure("https://down.example.net/"),
    );
    let report = orchestrator(fetcher, &["https://down.example.net/", "https://example.org/"])
        .scrape()
        .await
        .unwrap();

    assert_eq!(report.sources_ok, 1);
    assert_eq!(report.sources_failed, 1);
    assert_eq!(report.events.len(), 1);
    assert_eq!(report.events[0].title, "Workshop on Digital Marketing");
}

#[tokio::test]
async fn all_sources_failing_is_an_error_and_leaves_cache_empty() {
    let fetcher = Arc::new(
        FakeFetcher::default()
            .with_failure("https://a.example.net/")
            .with_failure("https://b.example.net/"),
    );
    let orchestrator = orchestrator(fetcher, &["https://a.example.net/", "https://b.example.net/"]);

    let err = orchestrator.run().await.unwrap_err();
    assert!(matches!(err, ScrapeError::AllSourcesFailed { attempted: 2 }));
    assert!(orchestrator
        .cache()
        .get::<serde_json::Value>(EVENTS_CACHE_KEY)
        .await
        .is_none());
}

#[tokio::test]
async fn no_sources_is_reported() {
    let fetcher = Arc::new(FakeFetcher::default());
    let err = orchestrator(fetcher, &[]).scrape().await.unwrap_err();
    assert!(matches!(err, ScrapeError::NoSources));
}

#[tokio::test]
async fn discovery_follows_probed_paths_and_listing_links() {
    let landing = r#"<nav><a href="/news-archive">News archive</a><a href="https://other.example.net/events">Partner events</a></nav>"#;
    let fetcher = Arc::new(
        FakeFetcher::default()
            .with_page("https://example.org/", landing)
            .with_page("https://example.org/calendar", WORKSHOP_CARD)
            .with_page(
                "https://example.org/news-archive",
                r#"<article class="post"><h2>Grant writing clinic</h2><p>Apply by 20/01/2025</p></article>"#,
            )
            .with_probe("https://example.org/calendar"),
    );
    let report = orchestrator(fetcher.clone(), &["https://example.org/"])
        .with_discovery(true)
        .scrape()
        .await
        .unwrap();

    assert_eq!(report.pages_fetched, 3);
    assert_eq!(report.pages_failed, 0);
    let titles: HashSet<_> = report.events.iter().map(|e| e.title.as_str()).collect();
    assert!(titles.contains("Workshop on Digital Marketing"));
    assert!(titles.contains("Grant writing clinic"));
    assert_eq!(fetcher.fetches(), 3);
}

#[tokio::test]
async fn discovery_is_capped_and_subpage_failures_are_tolerated() {
    let fetcher = Arc::new(FakeFetcher {
        probe_all: true,
        ..FakeFetcher::default().with_page("https://example.org/", WORKSHOP_CARD)
    });
    let report = orchestrator(fetcher.clone(), &["https://example.org/"])
        .with_discovery(true)
        .scrape()
        .await
        .unwrap();

    assert_eq!(report.sources_ok, 1);
    assert_eq!(report.pages_fetched, 1);
    assert_eq!(report.pages_failed, 5);
    assert_eq!(fetcher.fetches(), 6);
    assert_eq!(report.events.len(), 1);
}

#[tokio::test]
async fn discovery_checks_are_rate_limited() {
    let interval = Duration::from_millis(30);
    let fetcher = Arc::new(FakeFetcher::default().with_page("https://example.org/", WORKSHOP_CARD));
    let report = ScrapeOrchestrator::new(
        fetcher.clone(),
        Arc::new(DomainRateLimiter::new(interval, interval)),
        CacheStore::in_memory(),
        vec![ScrapeSource::new("https://example.org/")],
    )
    .with_discovery(true)
    .scrape()
    .await
    .unwrap();

    assert_eq!(report.pages_fetched, 1);
    let checks = fetcher.checked_at.lock().unwrap().len();
    assert!(checks > 1, "expected several existence checks, saw {checks}");
    let slack = Duration::from_millis(2);
    for gap in fetcher.check_gaps() {
        assert!(gap >= interval - slack, "existence checks {gap:?} apart");
    }
}

#[tokio::test]
async fn submitted_event_joins_the_cached_list() {
    let fetcher = Arc::new(FakeFetcher::default().with_page("https://example.org/", WORKSHOP_CARD));
    let service = EventService::new(Arc::new(orchestrator(fetcher.clone(), &["https://example.org/"])));

    let added = service
        .add_event(EventSubmission {
            title: Some("Urgent: scholarship applications".into()),
            link: Some("https://www.partner.org/scholarship".into()),
            organizer: Some("Partner".into()),
            category: Some("funding".into()),
            ..Default::default()
        })
        .await
        .unwrap();
    assert_eq!(added.id, "partner-urgent:-scholarship-applications");
    assert_eq!(added.source, "https://www.partner.org/scholarship");

    let snapshot = service.get_events().await.unwrap();
    assert!(snapshot.from_cache);
    assert_eq!(snapshot.events.len(), 2);
    assert_eq!(snapshot.events[0].id, added.id);
    assert_eq!(fetcher.fetches(), 1);
}

#[tokio::test]
async fn duplicate_submission_replaces_the_listed_event() {
    let card = r#"<div class="event"><h2>Community Meetup gathering</h2><p>Date: 15/12/2024</p></div>"#;
    let fetcher = Arc::new(FakeFetcher::default().with_page("https://example.org/", card));
    let service = EventService::new(Arc::new(orchestrator(fetcher.clone(), &["https://example.org/"])));
    let scraped = service.get_events().await.unwrap();
    assert_eq!(scraped.events.len(), 1);

    let added = service
        .add_event(EventSubmission {
            title: Some("Community Meetup gathering".into()),
            date: Some("15/12/2024".into()),
            link: Some("https://www.partner.org/meetup".into()),
            organizer: Some("Partner".into()),
            category: Some("networking".into()),
            ..Default::default()
        })
        .await
        .unwrap();
    assert_ne!(added.id, scraped.events[0].id);

    let listed = service.get_events().await.unwrap().events;
    assert_eq!(listed.len(), 1);
    assert_eq!(listed[0].id, added.id);
    assert_eq!(listed[0].dedup_key(), added.dedup_key());
}

#[tokio::test]
async fn invalid_submission_is_rejected_without_touching_cache() {
    let fetcher = Arc::new(FakeFetcher::default().with_page("https://example.org/", WORKSHOP_CARD));
    let service = EventService::new(Arc::new(orchestrator(fetcher.clone(), &["https://example.org/"])));

    let err = service
        .add_event(EventSubmission {
            link: Some("https://example.org/x".into()),
            organizer: Some("Example".into()),
            category: Some("general".into()),
            ..Default::default()
        })
        .await
        .unwrap_err();
    assert_eq!(err, ValidationError::Missing("title"));
    assert_eq!(fetcher.fetches(), 0);
}

#[tokio::test]
async fn featured_and_deadline_views_filter_the_list() {
    let html = r#"
        <div class="event"><h2>Scholarship deadline for engineers</h2><p>Applications close 01/02/2030</p></div>
        <div class="event"><h2>Neighbourhood clean-up day</h2><p>Saturday morning in the park.</p></div>"#;
    let fetcher = Arc::new(FakeFetcher::default().with_page("https://example.org/", html));
    let service = EventService::new(Arc::new(orchestrator(fetcher, &["https://example.org/"])));

    let featured = service.featured().await.unwrap();
    assert!(featured.events.iter().all(|e| e.priority > 3));
    assert!(featured
        .events
        .iter()
        .any(|e| e.title == "Scholarship deadline for engineers"));

    let deadlines = service.deadlines().await.unwrap();
    assert!(!deadlines.events.is_empty());
    assert!(deadlines.events.iter().all(|e| e.deadline));
}

#[tokio::test]
async fn events_task_caches_scrape_and_skips_when_fresh() {
    let fetcher = Arc::new(FakeFetcher::default().with_page("https://example.org/", WORKSHOP_CARD));
    let orchestrator = Arc::new(orchestrator(fetcher.clone(), &["https://example.org/"]));
    let runner = RefreshRunner::new(orchestrator.cache().clone());
    let task = EventsRefreshTask::new(orchestrator.clone());

    assert_eq!(runner.run_task(&task).await, TaskOutcome::Refreshed);
    let cached: Vec<eventscout_core::Event> =
        orchestrator.cache().get(EVENTS_CACHE_KEY).await.unwrap();
    assert_eq!(cached.len(), 1);

    assert_eq!(runner.run_task(&task).await, TaskOutcome::Skipped);
    assert_eq!(fetcher.fetches(), 1);
}

#[tokio::test]
async fn events_task_treats_empty_scrape_as_failure() {
    let fetcher = Arc::new(FakeFetcher::default().with_page("https://example.org/", "<p>Nothing here.</p>"));
    let orchestrator = Arc::new(orchestrator(fetcher, &["https://example.org/"]));
    let runner = RefreshRunner::new(orchestrator.cache().clone()).with_backoff(BackoffPolicy {
        max_retries: 0,
        base_delay: Duration::ZERO,
        max_delay: Duration::ZERO,
    });

    let outcome = runner.run_task(&EventsRefreshTask::new(orchestrator.clone())).await;
    assert!(matches!(outcome, TaskOutcome::Failed(ref reason) if reason.contains("no events")));
    assert!(orchestrator
        .cache()
        .get::<serde_json::Value>(EVENTS_CACHE_KEY)
        .await
        .is_none());
}

#[tokio::test]
async fn refugee_task_falls_back_to_html_page() {
    let fetcher = Arc::new(
        FakeFetcher::default()
            .with_failure("https://api.example.org/population")
            .with_page(
                "https://data.example.org/syria",
                "<main><h1>Syria situation</h1><p>Registered Syrian refugees 5,486,470</p></main>",
            ),
    );
    let cache = CacheStore::in_memory();
    let task = RefugeeCountTask::new(
        fetcher,
        "https://api.example.org/population",
        "https://data.example.org/syria",
        Duration::from_secs(3600),
    );
    assert_eq!(task.cache_key(), REFUGEE_COUNT_CACHE_KEY);

    let outcome = RefreshRunner::new(cache.clone()).run_task(&task).await;
    assert_eq!(outcome, TaskOutcome::Refreshed);
    let count: RefugeeCount = cache.get(REFUGEE_COUNT_CACHE_KEY).await.unwrap();
    assert_eq!(count.count, 5_486_470);
    assert_eq!(count.source, "https://data.example.org/syria");
}

#[tokio::test]
async fn refugee_task_reads_json_api() {
    let fetcher = Arc::new(FakeFetcher {
        json: true,
        ..FakeFetcher::default().with_page(
            "https://api.example.org/population",
            r#"{"items":[{"year":2024,"refugees":6123000}]}"#,
        )
    });
    let cache = CacheStore::in_memory();
    let task = RefugeeCountTask::new(
        fetcher.clone(),
        "https://api.example.org/population",
        "https://data.example.org/syria",
        Duration::from_secs(3600),
    );

    assert_eq!(RefreshRunner::new(cache.clone()).run_task(&task).await, TaskOutcome::Refreshed);
    let count: RefugeeCount = cache.get(REFUGEE_COUNT_CACHE_KEY).await.unwrap();
    assert_eq!(count.count, 6_123_000);
    assert_eq!(fetcher.fetches(), 1);
}
