//! Core domain model and normalization rules for nbsync.

use std::collections::BTreeSet;
use std::sync::LazyLock;

use chrono::{DateTime, Datelike, NaiveDate, NaiveDateTime, NaiveTime, Utc};
use regex::Regex;
use serde::{Deserialize, Serialize};

pub const CRATE_NAME: &str = "nbsync-core";

/// Default cap applied to descriptions before they are written remotely.
pub const DEFAULT_DESCRIPTION_MAX_CHARS: usize = 2000;

/// One item scraped from a feed page, before it is shaped into a table row.
#[derive(Debug, Clone, PartialEq, Eq, Default, Serialize, Deserialize)]
pub struct PostRecord {
    pub title: String,
    pub link: String,
    pub nickname: String,
    pub published_raw: Option<String>,
    pub description: String,
    pub blog_id: String,
    pub post_id: String,
    pub category: Option<String>,
    pub groups: Vec<String>,
}

impl PostRecord {
    pub fn unique_id(&self) -> Option<String> {
        composite_id(&self.blog_id, &self.post_id)
    }

    /// Title, link and identifier inputs are all required before a record may be written.
    pub fn has_required_fields(&self) -> bool {
        !self.title.trim().is_empty() && !self.link.trim().is_empty() && self.unique_id().is_some()
    }
}

/// Neighbor metadata loaded from the CSV snapshot.
#[derive(Debug, Clone, PartialEq, Eq, Default, Serialize, Deserialize)]
pub struct NeighborMeta {
    pub blog_id: String,
    pub nickname: Option<String>,
    pub groups: Vec<String>,
    pub influencer: bool,
    pub influencer_handle: Option<String>,
}

/// Neighbor found by walking the admin pages.
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct DiscoveredNeighbor {
    pub blog_id: String,
    pub blog_url: String,
    pub neighbor_count: Option<u64>,
    pub scrap_count: Option<u64>,
    pub influencer: bool,
}

#[derive(Debug, Clone, PartialEq, Eq, Default, Serialize, Deserialize)]
pub struct CalendarBuckets {
    pub year: String,
    pub year_month: String,
    pub quarter: String,
}

/// Full field set written to the remote table for one post.
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct RowFields {
    pub unique_id: String,
    pub title: String,
    pub link: String,
    pub nickname: String,
    pub published: Option<DateTime<Utc>>,
    pub description: String,
    pub buckets: CalendarBuckets,
    pub category: Option<String>,
    pub groups: Vec<String>,
}

impl RowFields {
    /// Shapes a record into a row. Returns `None` when the record has no identifier.
    pub fn from_record(record: &PostRecord, description_max_chars: usize) -> Option<Self> {
        let unique_id = record.unique_id()?;
        let published = record
            .published_raw
            .as_deref()
            .and_then(normalize_timestamp);
        Some(Self {
            unique_id,
            title: record.title.trim().to_string(),
            link: record.link.trim().to_string(),
            nickname: record.nickname.trim().to_string(),
            published,
            description: truncate_chars(record.description.trim(), description_max_chars),
            buckets: derive_calendar_buckets(published),
            category: record
                .category
                .as_deref()
                .map(select_option_name)
                .filter(|c| !c.is_empty()),
            groups: select_option_names(&record.groups),
        })
    }
}

/// Row as read back from the remote table; only the compared fields are kept.
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct RemoteRow {
    pub row_id: String,
    pub unique_id: String,
    pub title: String,
    pub link: String,
    pub category: Option<String>,
    pub groups: Vec<String>,
}

/// Names of compared fields that differ between the stored row and the fresh one.
///
/// The description is never compared.
pub fn changed_fields(existing: &RemoteRow, fresh: &RowFields) -> Vec<&'static str> {
    let mut changed = Vec::new();
    if existing.title.trim() != fresh.title.trim() {
        changed.push("title");
    }
    if existing.link.trim() != fresh.link.trim() {
        changed.push("link");
    }
    let category = |value: &Option<String>| {
        value
            .as_deref()
            .map(select_option_name)
            .filter(|c| !c.is_empty())
    };
    if category(&existing.category) != category(&fresh.category) {
        changed.push("category");
    }
    if !same_tag_set(
        &select_option_names(&existing.groups),
        &select_option_names(&fresh.groups),
    ) {
        changed.push("groups");
    }
    changed
}

pub fn composite_id(blog_id: &str, post_id: &str) -> Option<String> {
    let blog_id = blog_id.trim();
    let post_id = post_id.trim();
    match (blog_id.is_empty(), post_id.is_empty()) {
        (false, false) => Some(format!("{blog_id}_{post_id}")),
        (_, false) => Some(post_id.to_string()),
        _ => None,
    }
}

static LOOSE_DATE: LazyLock<Regex> = LazyLock::new(|| {
    Regex::new(
        r"^(\d{4})\s*[-/.년]\s*(\d{1,2})\s*[-/.월]\s*(\d{1,2})\s*[.일]?\s*(?:[T\s]\s*(\d{1,2}):(\d{2})(?::(\d{2}))?)?\s*$",
    )
    .expect("loose date pattern compiles")
});

/// Parses the heterogeneous publish values the feed emits into a UTC instant.
///
/// Naive date strings are read as UTC.
pub fn normalize_timestamp(raw: &str) -> Option<DateTime<Utc>> {
    let raw = raw.trim();
    if raw.is_empty() {
        return None;
    }

    if raw.chars().all(|c| c.is_ascii_digit()) {
        let value: i64 = raw.parse().ok()?;
        return match raw.len() {
            13 => DateTime::from_timestamp_millis(value),
            10 => DateTime::from_timestamp(value, 0),
            _ => None,
        };
    }

    if let Ok(parsed) = DateTime::parse_from_rfc3339(raw) {
        return Some(parsed.with_timezone(&Utc));
    }

    for format in ["%Y-%m-%dT%H:%M:%S", "%Y-%m-%dT%H:%M:%S%.f", "%Y-%m-%d %H:%M:%S%.f"] {
        if let Ok(naive) = NaiveDateTime::parse_from_str(raw, format) {
            return Some(naive.and_utc());
        }
    }

    let caps = LOOSE_DATE.captures(raw)?;
    let number = |idx: usize| caps.get(idx).and_then(|m| m.as_str().parse::<u32>().ok());
    let year = caps.get(1)?.as_str().parse::<i32>().ok()?;
    let date = NaiveDate::from_ymd_opt(year, number(2)?, number(3)?)?;
    let time = match number(4) {
        Some(hour) => NaiveTime::from_hms_opt(hour, number(5)?, number(6).unwrap_or(0))?,
        None => NaiveTime::MIN,
    };
    Some(date.and_time(time).and_utc())
}

pub fn quarter_for_month(month: u32) -> Option<u32> {
    match month {
        1..=3 => Some(1),
        4..=6 => Some(2),
        7..=9 => Some(3),
        10..=12 => Some(4),
        _ => None,
    }
}

pub fn derive_calendar_buckets(instant: Option<DateTime<Utc>>) -> CalendarBuckets {
    let Some(instant) = instant else {
        return CalendarBuckets::default();
    };
    let year = instant.year();
    let month = instant.month();
    let Some(quarter) = quarter_for_month(month) else {
        return CalendarBuckets::default();
    };
    CalendarBuckets {
        year: format!("{year:04}"),
        year_month: format!("{year:04}-{month:02}"),
        quarter: format!("{year:04}-Q{quarter}"),
    }
}

/// Truncates to at most `max` characters without splitting a code point.
pub fn truncate_chars(text: &str, max: usize) -> String {
    match text.char_indices().nth(max) {
        Some((byte_idx, _)) => text[..byte_idx].to_string(),
        None => text.to_string(),
    }
}

/// Order- and duplicate-insensitive equality for multi-select values.
pub fn same_tag_set(a: &[String], b: &[String]) -> bool {
    tag_set(a) == tag_set(b)
}

fn tag_set(tags: &[String]) -> BTreeSet<&str> {
    tags.iter()
        .map(|t| t.trim())
        .filter(|t| !t.is_empty())
        .collect()
}

/// Splits a group cell on `,` or `|`, trimming and dropping empties.
pub fn split_group_names(cell: &str) -> Vec<String> {
    let mut out: Vec<String> = Vec::new();
    for part in cell.split([',', '|']) {
        let part = part.trim();
        if !part.is_empty() && !out.iter().any(|existing| existing == part) {
            out.push(part.to_string());
        }
    }
    out
}

/// Select option names may not contain commas; they become spaces and runs of
/// whitespace collapse, so a stored option reads back exactly as written.
pub fn select_option_name(value: &str) -> String {
    value
        .replace(',', " ")
        .split_whitespace()
        .collect::<Vec<_>>()
        .join(" ")
}

/// Cleans every name, dropping empties and repeats while keeping first-seen order.
pub fn select_option_names(values: &[String]) -> Vec<String> {
    let mut out: Vec<String> = Vec::new();
    for name in values.iter().map(|v| select_option_name(v)) {
        if !name.is_empty() && !out.contains(&name) {
            out.push(name);
        }
    }
    out
}
