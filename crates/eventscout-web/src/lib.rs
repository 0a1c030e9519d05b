//! Axum JSON API over the cached event list.

use std::collections::BTreeSet;
use std::sync::Arc;

use anyhow::Context;
use axum::{
    body::Bytes,
    extract::{Query, State},
    http::{HeaderValue, StatusCode},
    response::{IntoResponse, Response},
    routing::{get, post},
    Json, Router,
};
use chrono::{DateTime, Utc};
use eventscout_core::Event;
use eventscout_sync::{EventService, EventSubmission, EventsSnapshot, ScoutConfig, ScrapeError};
use serde::{Deserialize, Serialize};
use serde_json::json;
use tokio::net::TcpListener;
use tower_http::cors::{Any, CorsLayer};
use tower_http::trace::TraceLayer;
use tracing::{error, info, warn};

pub const CRATE_NAME: &str = "eventscout-web";

pub const DEFAULT_LIST_LIMIT: usize = 100;

#[derive(Clone)]
pub struct AppState {
    pub service: EventService,
}

impl AppState {
    pub fn new(service: EventService) -> Self {
        Self { service }
    }
}

#[derive(Debug, Clone, Serialize)]
#[serde(rename_all = "camelCase")]
pub struct EventsMetadata {
    pub total_events: usize,
    pub last_updated: DateTime<Utc>,
    pub categories: Vec<String>,
    pub sources: Vec<String>,
}

#[derive(Debug, Clone, Serialize)]
pub struct EventsEnvelope {
    pub events: Vec<Event>,
    pub metadata: EventsMetadata,
}

impl EventsEnvelope {
    pub fn new(events: Vec<Event>, last_updated: DateTime<Utc>) -> Self {
        let categories: BTreeSet<_> = events.iter().map(|e| e.category.clone()).collect();
        let sources: BTreeSet<_> = events.iter().map(|e| e.source.clone()).collect();
        Self {
            metadata: EventsMetadata {
                total_events: events.len(),
                last_updated,
                categories: categories.into_iter().collect(),
                sources: sources.into_iter().collect(),
            },
            events,
        }
    }
}

#[derive(Debug, Deserialize, Default)]
struct EventsQuery {
    category: Option<String>,
    limit: Option<usize>,
}

pub fn app(state: AppState, cors_origins: &[String]) -> Router {
    Router::new()
        .route("/api/health", get(health_handler))
        .route("/api/events", get(list_events_handler).post(create_event_handler))
        .route("/api/events/featured", get(featured_handler))
        .route("/api/events/deadlines", get(deadlines_handler))
        .route("/api/events/refresh", post(refresh_handler))
        .route("/api/refugee-count", get(refugee_count_handler))
        .layer(cors_layer(cors_origins))
        .layer(TraceLayer::new_for_http())
        .with_state(Arc::new(state))
}

/// Any origin when the list is empty or contains `*`; unparseable entries are
/// skipped.
pub fn cors_layer(origins: &[String]) -> CorsLayer {
    if origins.is_empty() || origins.iter().any(|o| o == "*") {
        return CorsLayer::new()
            .allow_origin(Any)
            .allow_methods(Any)
            .allow_headers(Any);
    }
    let parsed: Vec<HeaderValue> = origins
        .iter()
        .filter_map(|origin| match origin.parse() {
            Ok(value) => Some(value),
            Err(_) => {
                warn!(%origin, "ignoring unparseable CORS origin");
                None
            }
        })
        .collect();
    CorsLayer::new()
        .allow_origin(parsed)
        .allow_methods(Any)
        .allow_headers(Any)
}

pub async fn serve(config: &ScoutConfig, service: EventService) -> anyhow::Result<()> {
    let addr = config.bind_addr();
    let listener = TcpListener::bind(&addr)
        .await
        .with_context(|| format!("binding {addr}"))?;
    info!(%addr, "eventscout api listening");
    axum::serve(listener, app(AppState::new(service), &config.cors_origins)).await?;
    Ok(())
}

async fn health_handler() -> Response {
    Json(json!({ "status": "healthy", "timestamp": Utc::now() })).into_response()
}

async fn list_events_handler(
    State(state): State<Arc<AppState>>,
    Query(query): Query<EventsQuery>,
) -> Response {
    match state.service.get_events().await {
        Ok(snapshot) => {
            let limit = query.limit.unwrap_or(DEFAULT_LIST_LIMIT);
            let events = snapshot
                .events
                .into_iter()
                .filter(|e| {
                    query
                        .category
                        .as_deref()
                        .map_or(true, |category| e.category.eq_ignore_ascii_case(category))
                })
                .take(limit)
                .collect();
            Json(EventsEnvelope::new(events, snapshot.last_updated)).into_response()
        }
        Err(err) => scrape_failed(err),
    }
}

async fn featured_handler(State(state): State<Arc<AppState>>) -> Response {
    envelope_or_error(state.service.featured().await)
}

async fn deadlines_handler(State(state): State<Arc<AppState>>) -> Response {
    envelope_or_error(state.service.deadlines().await)
}

async fn refresh_handler(State(state): State<Arc<AppState>>) -> Response {
    envelope_or_error(state.service.refresh().await)
}

async fn create_event_handler(State(state): State<Arc<AppState>>, body: Bytes) -> Response {
    let submission: EventSubmission = match serde_json::from_slice(&body) {
        Ok(submission) => submission,
        Err(err) => return client_error("invalid JSON body", err.to_string()),
    };
    match state.service.add_event(submission).await {
        Ok(event) => {
            info!(id = %event.id, "event submitted");
            (StatusCode::CREATED, Json(event)).into_response()
        }
        Err(err) => client_error("validation failed", err.to_string()),
    }
}

async fn refugee_count_handler(State(state): State<Arc<AppState>>) -> Response {
    match state.service.refugee_count().await {
        Some(count) => Json(count).into_response(),
        None => (
            StatusCode::NOT_FOUND,
            Json(json!({ "error": "refugee count not available yet" })),
        )
            .into_response(),
    }
}

fn envelope_or_error(result: Result<EventsSnapshot, ScrapeError>) -> Response {
    match result {
        Ok(snapshot) => Json(EventsEnvelope::new(snapshot.events, snapshot.last_updated)).into_response(),
        Err(err) => scrape_failed(err),
    }
}

fn client_error(message: &str, details: String) -> Response {
    (
        StatusCode::BAD_REQUEST,
        Json(json!({ "error": message, "details": details })),
    )
        .into_response()
}

fn scrape_failed(err: ScrapeError) -> Response {
    error!(error = %err, "no events available");
    (
        StatusCode::INTERNAL_SERVER_ERROR,
        Json(json!({ "error": "failed to fetch events", "details": err.to_string() })),
    )
        .into_response()
}
