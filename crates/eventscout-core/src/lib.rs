//! Core event model, vocabularies and the validation gate for eventscout.

use serde::{Deserialize, Serialize};
use thiserror::Error;
use url::Url;

pub const CRATE_NAME: &str = "eventscout-core";

pub const TITLE_MIN_CHARS: usize = 5;
pub const TITLE_MAX_CHARS: usize = 200;
pub const DESCRIPTION_MAX_CHARS: usize = 500;
pub const LOCATION_MAX_CHARS: usize = 100;
pub const MAX_TAGS: usize = 5;
pub const MIN_PRIORITY: i64 = 0;
pub const MAX_PRIORITY: i64 = 10;

pub const CATEGORY_GENERAL: &str = "general";

/// Fixed category vocabulary assigned by the extractor. Manual submissions may
/// carry other values.
pub const CATEGORIES: [&str; 7] = [
    "funding",
    "workshop",
    "conference",
    "cultural",
    "educational",
    "networking",
    CATEGORY_GENERAL,
];

/// The vocabulary spelling of `raw`, matched case-insensitively.
pub fn canonical_category(raw: &str) -> Option<&'static str> {
    let raw = raw.trim();
    CATEGORIES.iter().copied().find(|c| c.eq_ignore_ascii_case(raw))
}

/// Canonical event as stored in the cache and served by the API.
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct Event {
    pub id: String,
    pub title: String,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub description: Option<String>,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub date: Option<String>,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub time: Option<String>,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub location: Option<String>,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub link: Option<String>,
    pub source: String,
    pub organizer: String,
    pub priority: u8,
    pub category: String,
    pub deadline: bool,
    #[serde(default)]
    pub tags: Vec<String>,
}

impl Event {
    /// Key used to collapse records describing the same event.
    pub fn dedup_key(&self) -> String {
        format!(
            "{}-{}",
            self.title.to_lowercase(),
            self.date.as_deref().unwrap_or_default().to_lowercase()
        )
    }
}

/// Unvalidated record produced by an extraction strategy or a manual submission.
#[derive(Debug, Clone, PartialEq, Eq, Default, Serialize, Deserialize)]
pub struct CandidateEvent {
    pub id: String,
    pub title: String,
    pub description: Option<String>,
    pub date: Option<String>,
    pub time: Option<String>,
    pub location: Option<String>,
    pub link: Option<String>,
    pub source: String,
    pub organizer: String,
    pub priority: i64,
    pub category: String,
    pub deadline: bool,
    pub tags: Vec<String>,
}

#[derive(Debug, Clone, PartialEq, Eq, Error)]
pub enum ValidationError {
    #[error("missing required field `{0}`")]
    Missing(&'static str),
    #[error("title must be 5-200 characters, got {0}")]
    TitleLength(usize),
    #[error("description exceeds 500 characters ({0})")]
    DescriptionLength(usize),
    #[error("location exceeds 100 characters ({0})")]
    LocationLength(usize),
    #[error("priority {0} outside 0..=10")]
    PriorityOutOfRange(i64),
    #[error("at most 5 tags allowed, got {0}")]
    TooManyTags(usize),
    #[error("empty tag")]
    EmptyTag,
    #[error("`{field}` is not a well-formed http(s) url: {value}")]
    InvalidUrl { field: &'static str, value: String },
}

/// Truncate to at most `max` characters without splitting a code point.
pub fn truncate_chars(value: &str, max: usize) -> String {
    match value.char_indices().nth(max) {
        Some((idx, _)) => value[..idx].to_string(),
        None => value.to_string(),
    }
}

pub fn is_http_url(value: &str) -> bool {
    Url::parse(value)
        .map(|u| matches!(u.scheme(), "http" | "https") && u.host_str().is_some())
        .unwrap_or(false)
}

fn require(value: &str, field: &'static str) -> Result<(), ValidationError> {
    if value.trim().is_empty() {
        Err(ValidationError::Missing(field))
    } else {
        Ok(())
    }
}

/// Schema gate: either the whole candidate becomes an [`Event`] or it is rejected.
/// Nothing is trimmed or truncated here.
pub fn validate(candidate: CandidateEvent) -> Result<Event, ValidationError> {
    require(&candidate.id, "id")?;
    require(&candidate.title, "title")?;
    require(&candidate.source, "source")?;
    require(&candidate.organizer, "organizer")?;
    require(&candidate.category, "category")?;

    let title_len = candidate.title.chars().count();
    if !(TITLE_MIN_CHARS..=TITLE_MAX_CHARS).contains(&title_len) {
        return Err(ValidationError::TitleLength(title_len));
    }
    if let Some(description) = &candidate.description {
        let len = description.chars().count();
        if len > DESCRIPTION_MAX_CHARS {
            return Err(ValidationError::DescriptionLength(len));
        }
    }
    if let Some(location) = &candidate.location {
        let len = location.chars().count();
        if len > LOCATION_MAX_CHARS {
            return Err(ValidationError::LocationLength(len));
        }
    }
    if !is_http_url(&candidate.source) {
        return Err(ValidationError::InvalidUrl {
            field: "source",
            value: candidate.source,
        });
    }
    if let Some(link) = &candidate.link {
        if !is_http_url(link) {
            return Err(ValidationError::InvalidUrl {
                field: "link",
                value: link.clone(),
            });
        }
    }
    if !(MIN_PRIORITY..=MAX_PRIORITY).contains(&candidate.priority) {
        return Err(ValidationError::PriorityOutOfRange(candidate.priority));
    }
    if candidate.tags.len() > MAX_TAGS {
        return Err(ValidationError::TooManyTags(candidate.tags.len()));
    }
    if candidate.tags.iter().any(|t| t.trim().is_empty()) {
        return Err(ValidationError::EmptyTag);
    }

    Ok(Event {
        id: candidate.id,
        title: candidate.title,
        description: candidate.description,
        date: candidate.date,
        time: candidate.time,
        location: candidate.location,
        link: candidate.link,
        source: candidate.source,
        organizer: candidate.organizer,
        priority: candidate.priority as u8,
        category: candidate.category,
        deadline: candidate.deadline,
        tags: candidate.tags,
    })
}
