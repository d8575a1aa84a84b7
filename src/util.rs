// Utility helpers for dates, labels and string ordering.
//
// Field values in the geoportal export are loosely typed, so everything that
// turns them into calendar values or display text lives here and fails
// soft with `None`.
use chrono::{DateTime, Datelike, NaiveDate, NaiveDateTime, Utc};
use num_format::{Locale, ToFormattedString};
use std::cmp::Ordering;
use unicode_normalization::char::is_combining_mark;
use unicode_normalization::UnicodeNormalization;

const DATE_FORMATS: &[&str] = &["%Y-%m-%d", "%Y/%m/%d", "%d/%m/%Y", "%d-%m-%Y"];

const DATETIME_FORMATS: &[&str] = &[
    "%Y-%m-%d %H:%M:%S",
    "%Y/%m/%d %H:%M:%S",
    "%d/%m/%Y %H:%M:%S",
    "%d-%m-%Y %H:%M:%S",
    "%Y-%m-%dT%H:%M:%S%.f",
];

const MONTH_NAMES: [&str; 12] = [
    "enero",
    "febrero",
    "marzo",
    "abril",
    "mayo",
    "junio",
    "julio",
    "agosto",
    "septiembre",
    "octubre",
    "noviembre",
    "diciembre",
];

/// Parse a report date into a calendar date.
///
/// - Trims whitespace and rejects empty strings.
/// - All-digit strings of 10+ characters are epoch milliseconds.
/// - Tries day-first and year-first layouts, with or without a time.
/// - Falls back to RFC 3339 (`2024-03-15T10:00:00Z`).
pub fn parse_report_date(s: &str) -> Option<NaiveDate> {
    let s = s.trim();
    if s.is_empty() {
        return None;
    }
    if s.len() >= 10 && s.chars().all(|c| c.is_ascii_digit()) {
        return date_from_epoch_millis(s.parse().ok()?);
    }
    for fmt in DATE_FORMATS {
        if let Ok(d) = NaiveDate::parse_from_str(s, fmt) {
            return Some(d);
        }
    }
    for fmt in DATETIME_FORMATS {
        if let Ok(dt) = NaiveDateTime::parse_from_str(s, fmt) {
            return Some(dt.date());
        }
    }
    DateTime::parse_from_rfc3339(s).ok().map(|dt| dt.date_naive())
}

pub fn date_from_epoch_millis(ms: i64) -> Option<NaiveDate> {
    DateTime::<Utc>::from_timestamp_millis(ms).map(|dt| dt.date_naive())
}

/// Capitalized Spanish month name for a 1-based month number.
pub fn spanish_month_label(month: u32) -> String {
    match spanish_month_name(month) {
        Some(name) => capitalize(name),
        None => month.to_string(),
    }
}

pub fn capitalize(s: &str) -> String {
    let mut chars = s.chars();
    match chars.next() {
        Some(first) => first.to_uppercase().chain(chars).collect(),
        None => String::new(),
    }
}

/// Lowercase Spanish month name for a 1-based month number.
pub fn spanish_month_name(month: u32) -> Option<&'static str> {
    month
        .checked_sub(1)
        .and_then(|i| MONTH_NAMES.get(i as usize))
        .copied()
}

// Canonical decomposition with the combining marks dropped.
fn strip_marks(s: &str) -> impl Iterator<Item = char> + '_ {
    s.nfd().filter(|c| !is_combining_mark(*c))
}

fn collation_key(s: &str) -> String {
    strip_marks(s).flat_map(char::to_lowercase).collect()
}

/// Locale-style string ordering for Spanish labels.
///
/// Base letters compare first (case and accents ignored), then accents,
/// then case with lowercase first. Precomposed and decomposed spellings of
/// the same text compare equal.
pub fn locale_cmp(a: &str, b: &str) -> Ordering {
    let a: String = a.nfc().collect();
    let b: String = b.nfc().collect();
    collation_key(&a)
        .cmp(&collation_key(&b))
        .then_with(|| a.to_lowercase().cmp(&b.to_lowercase()))
        .then_with(|| {
            let case = |s: &str| s.chars().map(|c| (c.is_uppercase(), c)).collect::<Vec<_>>();
            case(&a).cmp(&case(&b))
        })
}

/// Grouping key for free-text place names: uppercase, no accents, only
/// letters and digits, runs of whitespace collapsed to one space.
pub fn normalize_key(s: &str) -> String {
    let upper = s.trim().to_uppercase();
    let mut key = String::with_capacity(upper.len());
    let mut last_space = false;
    for c in strip_marks(&upper) {
        if c.is_alphanumeric() {
            key.push(c);
            last_space = false;
        } else if c.is_whitespace() && !last_space {
            key.push(' ');
            last_space = true;
        }
    }
    key.trim().to_string()
}

/// Electoral section key: its digits when it has any, else the text key.
pub fn normalize_seccion(s: &str) -> String {
    let digits: String = s.chars().filter(char::is_ascii_digit).collect();
    if digits.is_empty() {
        normalize_key(s)
    } else {
        digits
    }
}

/// Month name out of a free-form month value.
///
/// Accepts month names and abbreviations (`Mar`, `MARZO`), month numbers
/// (`3`, `03`) and full dates. Unknown words come back lowercased so they
/// still group together.
pub fn parse_month_name(s: &str) -> Option<String> {
    let s = s.trim();
    if s.is_empty() {
        return None;
    }
    if s.chars().any(char::is_alphabetic) {
        let key = normalize_key(s);
        let known = MONTH_NAMES.iter().find(|name| {
            let name = name.to_uppercase();
            key == name || key.starts_with(&name[..3])
        });
        return Some(match known {
            Some(name) => name.to_string(),
            None => s.to_lowercase(),
        });
    }
    let digits: String = s.chars().filter(char::is_ascii_digit).collect();
    if !digits.is_empty() && digits.len() <= 2 {
        if let Some(name) = digits.parse().ok().and_then(spanish_month_name) {
            return Some(name.to_string());
        }
    }
    parse_report_date(s)
        .and_then(|d| spanish_month_name(d.month()))
        .map(str::to_string)
}

pub fn format_int<T>(n: T) -> String
where
    T: ToFormattedString,
{
    // Counts in console messages (e.g., `12,408 records loaded`).
    n.to_formatted_string(&Locale::en)
}
