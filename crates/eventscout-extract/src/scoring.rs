//! Keyword vocabularies and the shared priority/category/deadline/tag rules.

use chrono::NaiveDate;
use eventscout_core::{CATEGORY_GENERAL, MAX_PRIORITY, MAX_TAGS, MIN_PRIORITY};

pub const BASE_PRIORITY: i64 = 1;

pub const HIGH_URGENCY: &[&str] = &[
    "deadline",
    "urgent",
    "funding",
    "grant",
    "scholarship",
    "apply now",
    "موعد نهائي",
    "آخر موعد",
    "عاجل",
    "تمويل",
    "منحة",
    "منح",
];

pub const MEDIUM_URGENCY: &[&str] = &[
    "workshop",
    "training",
    "conference",
    "seminar",
    "webinar",
    "ورشة",
    "تدريب",
    "مؤتمر",
    "ندوة",
    "دورة",
];

pub const DEADLINE_KEYWORDS: &[&str] = &[
    "deadline",
    "due date",
    "last date",
    "apply by",
    "closing date",
    "applications close",
    "موعد نهائي",
    "الموعد النهائي",
    "آخر موعد",
    "تاريخ الإغلاق",
];

/// First matching category wins, in this order.
pub const CATEGORY_KEYWORDS: &[(&str, &[&str])] = &[
    (
        "funding",
        &["funding", "grant", "scholarship", "fellowship", "تمويل", "منحة", "منح"],
    ),
    (
        "workshop",
        &["workshop", "training", "course", "bootcamp", "ورشة", "تدريب", "دورة"],
    ),
    (
        "conference",
        &["conference", "summit", "forum", "seminar", "symposium", "مؤتمر", "ندوة", "منتدى", "قمة"],
    ),
    (
        "cultural",
        &["festival", "exhibition", "concert", "cultural", "theatre", "music", "مهرجان", "معرض", "ثقاف", "حفل"],
    ),
    (
        "educational",
        &["education", "school", "university", "lecture", "learning", "تعليم", "مدرسة", "جامعة", "محاضرة"],
    ),
    (
        "networking",
        &["networking", "meetup", "meeting", "gathering", "community", "تواصل", "لقاء", "ملتقى", "تجمع"],
    ),
];

/// Topical tags in emission order.
pub const TAG_VOCABULARY: &[&str] = &[
    "syria",
    "ngo",
    "humanitarian",
    "education",
    "youth",
    "women",
    "refugees",
    "health",
    "civil society",
    "development",
    "peace",
    "سوريا",
    "منظمة",
    "إنساني",
    "تعليم",
    "شباب",
    "نساء",
    "لاجئ",
    "صحة",
    "مجتمع مدني",
];

/// Vocabulary that marks a link or page as event-ish.
pub const EVENT_KEYWORDS: &[&str] = &[
    "event",
    "workshop",
    "training",
    "conference",
    "seminar",
    "webinar",
    "forum",
    "meetup",
    "deadline",
    "funding",
    "grant",
    "scholarship",
    "fellowship",
    "call for",
    "فعالية",
    "فعاليات",
    "ورشة",
    "تدريب",
    "مؤتمر",
    "ندوة",
    "منحة",
    "تمويل",
    "موعد نهائي",
    "دعوة",
];

pub fn contains_any(lowercase_text: &str, keywords: &[&str]) -> bool {
    keywords.iter().any(|k| lowercase_text.contains(k))
}

/// Base 1, +3 high urgency or else +2 medium, then +2 for a date 0-30 days out
/// or +1 for 31-90 days out. Clamped to the event priority range.
pub fn score_priority(text: &str, date: Option<NaiveDate>, today: NaiveDate) -> i64 {
    let lower = text.to_lowercase();
    let mut priority = BASE_PRIORITY;
    if contains_any(&lower, HIGH_URGENCY) {
        priority += 3;
    } else if contains_any(&lower, MEDIUM_URGENCY) {
        priority += 2;
    }

    if let Some(date) = date {
        let days_out = (date - today).num_days();
        if (0..=30).contains(&days_out) {
            priority += 2;
        } else if (31..=90).contains(&days_out) {
            priority += 1;
        }
    }

    priority.clamp(MIN_PRIORITY, MAX_PRIORITY)
}

pub fn categorize(text: &str) -> &'static str {
    let lower = text.to_lowercase();
    CATEGORY_KEYWORDS
        .iter()
        .find(|(_, keywords)| contains_any(&lower, keywords))
        .map(|(category, _)| *category)
        .unwrap_or(CATEGORY_GENERAL)
}

pub fn is_deadline(text: &str) -> bool {
    contains_any(&text.to_lowercase(), DEADLINE_KEYWORDS)
}

pub fn detect_tags(text: &str) -> Vec<String> {
    let lower = text.to_lowercase();
    TAG_VOCABULARY
        .iter()
        .filter(|tag| lower.contains(*tag))
        .take(MAX_TAGS)
        .map(|tag| tag.to_string())
        .collect()
}

pub fn is_event_like(text: &str) -> bool {
    contains_any(&text.to_lowercase(), EVENT_KEYWORDS)
}
