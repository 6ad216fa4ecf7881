//! Feed page parsing: JSON feed API and the HTML neighbor home page.

use nbsync_core::{truncate_chars, PostRecord};
use scraper::{Html, Selector};
use serde_json::Value as JsonValue;
use tracing::warn;

use crate::{extract_post_ids, is_blog_link, FeedFormat};

/// Prefixes the platform prepends to JSON bodies to break naive `eval`.
const ANTI_SCRAPING_PREFIXES: &[&str] = &[")]}',", ")]}'", "while(1);"];

/// Candidate locations of the post list, tried in order; the first non-empty array wins.
const LIST_POINTERS: &[&str] = &[
    "/result/postList",
    "/result/items",
    "/result/list",
    "/postList",
    "/items",
    "/data/items",
    "/data/list",
    "/data",
    "/list",
];

const HTML_TITLE_MAX_CHARS: usize = 200;
const PREVIEW_CHARS: usize = 200;

#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum PostField {
    Title,
    Link,
    Nickname,
    Published,
    Description,
    BlogId,
    PostId,
    Category,
    Groups,
}

/// Ordered JSON pointers for one logical field; earlier pointers take precedence.
#[derive(Debug, Clone, Copy)]
pub struct ExtractionRule {
    pub field: PostField,
    pub pointers: &'static [&'static str],
}

pub const FEED_RULES: &[ExtractionRule] = &[
    ExtractionRule {
        field: PostField::Title,
        pointers: &["/title", "/postTitle", "/titleWithInspectMessage", "/subject"],
    },
    ExtractionRule {
        field: PostField::Link,
        pointers: &["/postUrl", "/url", "/link", "/postLink"],
    },
    ExtractionRule {
        field: PostField::Nickname,
        pointers: &["/nickName", "/nickname", "/blogName", "/author", "/writer"],
    },
    ExtractionRule {
        field: PostField::Published,
        pointers: &["/addDate", "/addTimestamp", "/publishDate", "/pubDate", "/createdAt", "/date"],
    },
    ExtractionRule {
        field: PostField::Description,
        pointers: &["/briefContents", "/contents", "/description", "/summary", "/content"],
    },
    ExtractionRule {
        field: PostField::BlogId,
        pointers: &["/blogId", "/domainIdOrBlogId", "/blogNo"],
    },
    ExtractionRule {
        field: PostField::PostId,
        pointers: &["/logNo", "/postId", "/postNo", "/id"],
    },
    ExtractionRule {
        field: PostField::Category,
        pointers: &["/categoryName", "/category", "/directoryName"],
    },
    ExtractionRule {
        field: PostField::Groups,
        pointers: &["/groupNames", "/groupName", "/groups"],
    },
];

/// Records from one page plus the number of items dropped for missing metadata.
#[derive(Debug, Clone, Default, PartialEq, Eq)]
pub struct ParsedPage {
    pub records: Vec<PostRecord>,
    pub skipped_missing: usize,
    pub parse_failed: bool,
}

impl ParsedPage {
    pub fn reverse(&mut self) {
        self.records.reverse();
    }
}

pub fn parse_feed_page(format: FeedFormat, body: &str) -> ParsedPage {
    match format {
        FeedFormat::Json => parse_json_feed_page(body),
        FeedFormat::Html => parse_html_link_page(body),
    }
}

pub fn strip_anti_scraping_prefix(body: &str) -> &str {
    let trimmed = body.trim_start_matches('\u{feff}').trim_start();
    for prefix in ANTI_SCRAPING_PREFIXES {
        if let Some(rest) = trimmed.strip_prefix(prefix) {
            return rest.trim_start();
        }
    }
    trimmed
}

fn preview(body: &str) -> String {
    truncate_chars(body.trim(), PREVIEW_CHARS)
}

/// The first non-empty list among the known response shapes.
pub fn extract_item_list(value: &JsonValue) -> Vec<JsonValue> {
    if let Some(items) = value.as_array() {
        return items.clone();
    }
    LIST_POINTERS
        .iter()
        .filter_map(|pointer| value.pointer(pointer).and_then(JsonValue::as_array))
        .find(|items| !items.is_empty())
        .cloned()
        .unwrap_or_default()
}

fn scalar_text(value: &JsonValue) -> Option<String> {
    let text = match value {
        JsonValue::String(s) => s.trim().to_string(),
        JsonValue::Number(n) => n.to_string(),
        _ => return None,
    };
    (!text.is_empty()).then_some(text)
}

fn rule_for(field: PostField) -> &'static [&'static str] {
    FEED_RULES
        .iter()
        .find(|rule| rule.field == field)
        .map(|rule| rule.pointers)
        .unwrap_or_default()
}

/// First non-empty scalar reachable through `pointers`.
pub fn extract_text(item: &JsonValue, pointers: &[&str]) -> Option<String> {
    pointers
        .iter()
        .filter_map(|pointer| item.pointer(pointer))
        .find_map(scalar_text)
}

fn extract_list(item: &JsonValue, pointers: &[&str]) -> Vec<String> {
    for pointer in pointers {
        let Some(value) = item.pointer(pointer) else {
            continue;
        };
        let values = match value {
            JsonValue::Array(entries) => entries.iter().filter_map(scalar_text).collect(),
            other => scalar_text(other)
                .map(|text| nbsync_core::split_group_names(&text))
                .unwrap_or_default(),
        };
        if !values.is_empty() {
            return values;
        }
    }
    Vec::new()
}

/// Maps one raw feed item to a record, recovering identifiers from the link when absent.
pub fn record_from_item(item: &JsonValue) -> PostRecord {
    let text = |field| extract_text(item, rule_for(field)).unwrap_or_default();
    let mut record = PostRecord {
        title: text(PostField::Title),
        link: text(PostField::Link),
        nickname: text(PostField::Nickname),
        published_raw: extract_text(item, rule_for(PostField::Published)),
        description: text(PostField::Description),
        blog_id: text(PostField::BlogId),
        post_id: text(PostField::PostId),
        category: extract_text(item, rule_for(PostField::Category)),
        groups: extract_list(item, rule_for(PostField::Groups)),
    };

    if record.blog_id.is_empty() || record.post_id.is_empty() {
        if let Some((blog_id, post_id)) = extract_post_ids(&record.link) {
            if record.blog_id.is_empty() {
                record.blog_id = blog_id;
            }
            if record.post_id.is_empty() {
                record.post_id = post_id;
            }
        }
    }
    if record.link.is_empty() && !record.blog_id.is_empty() && !record.post_id.is_empty() {
        record.link = format!("https://blog.naver.com/{}/{}", record.blog_id, record.post_id);
    }
    record
}

pub fn parse_json_feed_page(body: &str) -> ParsedPage {
    let payload = strip_anti_scraping_prefix(body);
    let value: JsonValue = match serde_json::from_str(payload) {
        Ok(value) => value,
        Err(err) => {
            warn!(error = %err, preview = %preview(payload), "feed page is not valid JSON");
            return ParsedPage {
                parse_failed: true,
                ..ParsedPage::default()
            };
        }
    };

    let mut page = ParsedPage::default();
    for item in extract_item_list(&value) {
        let record = record_from_item(&item);
        if record.has_required_fields() {
            page.records.push(record);
        } else {
            page.skipped_missing += 1;
        }
    }
    page
}

/// Treats every post link on the neighbor home page as a record, collapsing repeats by URL.
pub fn parse_html_link_page(body: &str) -> ParsedPage {
    let document = Html::parse_document(body);
    let anchors = Selector::parse("a[href]").expect("static selector parses");
    let mut page = ParsedPage::default();

    for anchor in document.select(&anchors) {
        let Some(href) = anchor.value().attr("href") else {
            continue;
        };
        if !is_blog_link(href) {
            continue;
        }
        let title = anchor.text().collect::<Vec<_>>().join(" ");
        let title = title.split_whitespace().collect::<Vec<_>>().join(" ");
        if title.is_empty() {
            continue;
        }

        let Some((blog_id, post_id)) = extract_post_ids(href) else {
            page.skipped_missing += 1;
            continue;
        };
        let link = format!("https://blog.naver.com/{blog_id}/{post_id}");
        if page.records.iter().any(|r| r.link == link) {
            continue;
        }
        page.records.push(PostRecord {
            title: truncate_chars(&title, HTML_TITLE_MAX_CHARS),
            nickname: blog_id.clone(),
            link,
            blog_id,
            post_id,
            ..PostRecord::default()
        });
    }
    page
}
