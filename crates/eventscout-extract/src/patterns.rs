//! Date, time and location matchers over block text (English and Arabic).

use std::sync::LazyLock;

use chrono::NaiveDate;
use eventscout_core::{truncate_chars, LOCATION_MAX_CHARS};
use regex::{Captures, Regex};

const ENGLISH_MONTHS: [(&str, u32); 24] = [
    ("january", 1),
    ("february", 2),
    ("march", 3),
    ("april", 4),
    ("may", 5),
    ("june", 6),
    ("july", 7),
    ("august", 8),
    ("september", 9),
    ("october", 10),
    ("november", 11),
    ("december", 12),
    ("jan", 1),
    ("feb", 2),
    ("mar", 3),
    ("apr", 4),
    ("jun", 6),
    ("jul", 7),
    ("aug", 8),
    ("sept", 9),
    ("sep", 9),
    ("oct", 10),
    ("nov", 11),
    ("dec", 12),
];

/// Levantine and Egyptian Gregorian month names, then the Hijri months, which
/// match as dates but are not converted to a calendar day.
const ARABIC_MONTHS: [(&str, Option<u32>); 36] = [
    ("كانون الثاني", Some(1)),
    ("شباط", Some(2)),
    ("آذار", Some(3)),
    ("نيسان", Some(4)),
    ("أيار", Some(5)),
    ("حزيران", Some(6)),
    ("تموز", Some(7)),
    ("آب", Some(8)),
    ("أيلول", Some(9)),
    ("تشرين الأول", Some(10)),
    ("تشرين الثاني", Some(11)),
    ("كانون الأول", Some(12)),
    ("يناير", Some(1)),
    ("فبراير", Some(2)),
    ("مارس", Some(3)),
    ("أبريل", Some(4)),
    ("مايو", Some(5)),
    ("يونيو", Some(6)),
    ("يوليو", Some(7)),
    ("أغسطس", Some(8)),
    ("سبتمبر", Some(9)),
    ("أكتوبر", Some(10)),
    ("نوفمبر", Some(11)),
    ("ديسمبر", Some(12)),
    ("محرم", None),
    ("صفر", None),
    ("ربيع الأول", None),
    ("ربيع الآخر", None),
    ("جمادى الأولى", None),
    ("جمادى الآخرة", None),
    ("رجب", None),
    ("شعبان", None),
    ("رمضان", None),
    ("شوال", None),
    ("ذو القعدة", None),
    ("ذو الحجة", None),
];

static NUMERIC_DATE: LazyLock<Regex> = LazyLock::new(|| {
    Regex::new(r"\b([0-9٠-٩]{1,2})[/\-.]([0-9٠-٩]{1,2})[/\-.]([0-9٠-٩]{4}|[0-9٠-٩]{2})\b")
        .expect("valid numeric date regex")
});

static ENGLISH_DATE: LazyLock<Regex> = LazyLock::new(|| {
    let names = ENGLISH_MONTHS
        .iter()
        .map(|(name, _)| *name)
        .collect::<Vec<_>>()
        .join("|");
    Regex::new(&format!(
        r"(?i)\b(\d{{1,2}})(?:st|nd|rd|th)?\s+({names})\.?,?\s+(\d{{4}})\b"
    ))
    .expect("valid english date regex")
});

static ARABIC_DATE: LazyLock<Regex> = LazyLock::new(|| {
    let names = ARABIC_MONTHS
        .iter()
        .map(|(name, _)| regex::escape(name))
        .collect::<Vec<_>>()
        .join("|");
    Regex::new(&format!(r"([0-9٠-٩]{{1,2}})\s+({names})\s+([0-9٠-٩]{{4}})"))
        .expect("valid arabic date regex")
});

static TIME: LazyLock<Regex> = LazyLock::new(|| {
    Regex::new(r"(?i)\b([0-9]{1,2}:[0-9]{2})(?:\s*([ap]\.?m\.?))?").expect("valid time regex")
});

static LOCATION_EN: LazyLock<Regex> = LazyLock::new(|| {
    Regex::new(r"(?i)\b(?:location|venue|place|where|address)\s*:\s*([^\n|]+)")
        .expect("valid location regex")
});

static LOCATION_AR: LazyLock<Regex> = LazyLock::new(|| {
    Regex::new(r"(?:المكان|الموقع|العنوان|مكان الانعقاد)\s*[:：]\s*([^\n|]+)")
        .expect("valid arabic location regex")
});

#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum DateFamily {
    Numeric,
    English,
    Arabic,
}

#[derive(Debug, Clone, PartialEq, Eq)]
pub struct DateMatch {
    pub text: String,
    pub family: DateFamily,
}

impl DateMatch {
    pub fn parsed(&self) -> Option<NaiveDate> {
        parse_date(&self.text)
    }
}

fn families() -> [(DateFamily, &'static Regex); 3] {
    [
        (DateFamily::Numeric, &*NUMERIC_DATE),
        (DateFamily::English, &*ENGLISH_DATE),
        (DateFamily::Arabic, &*ARABIC_DATE),
    ]
}

/// First date by family order: numeric, then English, then Arabic.
pub fn find_date(text: &str) -> Option<DateMatch> {
    families().into_iter().find_map(|(family, re)| {
        re.find(text).map(|m| DateMatch {
            text: m.as_str().to_string(),
            family,
        })
    })
}

/// Every date match of every family, families in order.
pub fn find_all_dates(text: &str) -> Vec<DateMatch> {
    families()
        .into_iter()
        .flat_map(|(family, re)| {
            re.find_iter(text).map(move |m| DateMatch {
                text: m.as_str().to_string(),
                family,
            })
        })
        .collect()
}

fn digit_value(c: char) -> Option<u32> {
    match c {
        '0'..='9' => c.to_digit(10),
        '٠'..='٩' => Some(c as u32 - '٠' as u32),
        '۰'..='۹' => Some(c as u32 - '۰' as u32),
        _ => None,
    }
}

/// Parses ASCII, Arabic-Indic and extended Arabic-Indic digits.
pub fn parse_number(digits: &str) -> Option<u32> {
    digits.chars().try_fold(0u32, |acc, c| {
        let d = digit_value(c)?;
        acc.checked_mul(10)?.checked_add(d)
    })
}

fn year_from(raw: &str) -> Option<i32> {
    let year = parse_number(raw)? as i32;
    if raw.chars().count() == 2 {
        Some(2000 + year)
    } else {
        Some(year)
    }
}

fn numeric_from(caps: &Captures<'_>) -> Option<NaiveDate> {
    // Day first, always: 05/03/2025 is 5 March.
    let day = parse_number(&caps[1])?;
    let month = parse_number(&caps[2])?;
    let year = year_from(&caps[3])?;
    NaiveDate::from_ymd_opt(year, month, day)
}

fn english_from(caps: &Captures<'_>) -> Option<NaiveDate> {
    let day = parse_number(&caps[1])?;
    let name = caps[2].to_ascii_lowercase();
    let month = ENGLISH_MONTHS
        .iter()
        .find(|(n, _)| *n == name)
        .map(|(_, m)| *m)?;
    let year = year_from(&caps[3])?;
    NaiveDate::from_ymd_opt(year, month, day)
}

fn arabic_from(caps: &Captures<'_>) -> Option<NaiveDate> {
    let day = parse_number(&caps[1])?;
    let month = ARABIC_MONTHS
        .iter()
        .find(|(n, _)| *n == &caps[2])
        .and_then(|(_, m)| *m)?;
    let year = year_from(&caps[3])?;
    NaiveDate::from_ymd_opt(year, month, day)
}

/// Calendar date for a matched date string, or `None` when it is a Hijri date
/// or an impossible day/month combination.
pub fn parse_date(raw: &str) -> Option<NaiveDate> {
    if let Some(caps) = NUMERIC_DATE.captures(raw) {
        return numeric_from(&caps);
    }
    if let Some(caps) = ENGLISH_DATE.captures(raw) {
        return english_from(&caps);
    }
    if let Some(caps) = ARABIC_DATE.captures(raw) {
        return arabic_from(&caps);
    }
    None
}

pub fn find_time(text: &str) -> Option<String> {
    TIME.find(text).map(|m| m.as_str().trim().to_string())
}

pub fn find_location(text: &str) -> Option<String> {
    [&*LOCATION_EN, &*LOCATION_AR].into_iter().find_map(|re| {
        re.captures(text)
            .map(|caps| caps[1].trim().to_string())
            .filter(|loc| !loc.is_empty())
            .map(|loc| truncate_chars(&loc, LOCATION_MAX_CHARS).trim_end().to_string())
    })
}
