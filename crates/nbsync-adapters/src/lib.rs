//! Page sources and parsers that turn feed/admin pages into domain records.

use std::str::FromStr;
use std::sync::LazyLock;

use async_trait::async_trait;
use nbsync_storage::{FetchError, HttpFetcher};
use regex::Regex;
use serde::{Deserialize, Serialize};
use thiserror::Error;

pub mod feed;
pub mod neighbors;

pub use feed::{parse_feed_page, parse_html_link_page, parse_json_feed_page, ParsedPage};
pub use neighbors::{
    load_neighbor_csv, parse_neighbor_admin_page, write_discovered_csv, NeighborDirectory,
};

pub const CRATE_NAME: &str = "nbsync-adapters";

#[derive(Debug, Error)]
pub enum AdapterError {
    #[error("{0}")]
    Message(String),
    #[error(transparent)]
    Fetch(#[from] FetchError),
    #[error(transparent)]
    Csv(#[from] csv::Error),
    #[error(transparent)]
    Anyhow(#[from] anyhow::Error),
}

#[derive(Debug, Clone, Copy, PartialEq, Eq, Default, Serialize, Deserialize)]
#[serde(rename_all = "lowercase")]
pub enum FeedFormat {
    #[default]
    Json,
    Html,
}

impl FromStr for FeedFormat {
    type Err = AdapterError;

    fn from_str(s: &str) -> Result<Self, Self::Err> {
        match s.trim().to_ascii_lowercase().as_str() {
            "json" => Ok(FeedFormat::Json),
            "html" => Ok(FeedFormat::Html),
            other => Err(AdapterError::Message(format!(
                "unknown feed format {other:?} (expected json or html)"
            ))),
        }
    }
}

/// Anything that can hand back the raw body of page `n`.
#[async_trait]
pub trait PageSource: Send + Sync {
    async fn fetch_page(&self, page: u32) -> Result<String, AdapterError>;
}

/// Substitutes `{page}`, `{group}` and `{blog}` in an endpoint template.
pub fn render_page_url(template: &str, page: u32, group: &str, blog: &str) -> String {
    template
        .replace("{page}", &page.to_string())
        .replace("{group}", group)
        .replace("{blog}", blog)
}

pub struct HttpPageSource {
    fetcher: HttpFetcher,
    source: String,
    url_template: String,
    group: String,
    blog: String,
}

impl HttpPageSource {
    pub fn new(
        fetcher: HttpFetcher,
        source: impl Into<String>,
        url_template: impl Into<String>,
        group: impl Into<String>,
        blog: impl Into<String>,
    ) -> Self {
        Self {
            fetcher,
            source: source.into(),
            url_template: url_template.into(),
            group: group.into(),
            blog: blog.into(),
        }
    }
}

#[async_trait]
impl PageSource for HttpPageSource {
    async fn fetch_page(&self, page: u32) -> Result<String, AdapterError> {
        let url = render_page_url(&self.url_template, page, &self.group, &self.blog);
        let resp = self.fetcher.fetch_text(&self.source, &url).await?;
        Ok(resp.body)
    }
}

static POST_PATH: LazyLock<Regex> = LazyLock::new(|| {
    Regex::new(r"^https?://(?:m\.)?blog\.[A-Za-z0-9.-]+/([A-Za-z0-9_-]+)/(\d+)(?:[/?#]|$)")
        .expect("post path pattern compiles")
});

static BLOG_HOME: LazyLock<Regex> = LazyLock::new(|| {
    Regex::new(r"^https?://(?:m\.)?blog\.[A-Za-z0-9.-]+/([A-Za-z0-9_-]+)/?(?:[?#]|$)")
        .expect("blog home pattern compiles")
});

static BLOG_HOST: LazyLock<Regex> = LazyLock::new(|| {
    Regex::new(r"^https?://(?:m\.)?blog\.[A-Za-z0-9.-]+/").expect("blog host pattern compiles")
});

static QUERY_BLOG_ID: LazyLock<Regex> =
    LazyLock::new(|| Regex::new(r"[?&]blogId=([A-Za-z0-9_-]+)").expect("blogId pattern compiles"));

static QUERY_LOG_NO: LazyLock<Regex> =
    LazyLock::new(|| Regex::new(r"[?&]logNo=(\d+)").expect("logNo pattern compiles"));

pub fn is_blog_link(url: &str) -> bool {
    BLOG_HOST.is_match(url.trim())
}

/// Recovers `(blog_id, post_id)` from a post URL in path or query form.
pub fn extract_post_ids(url: &str) -> Option<(String, String)> {
    let url = url.trim();
    if let Some(caps) = POST_PATH.captures(url) {
        return Some((caps[1].to_string(), caps[2].to_string()));
    }
    let blog = QUERY_BLOG_ID.captures(url)?;
    let post = QUERY_LOG_NO.captures(url)?;
    Some((blog[1].to_string(), post[1].to_string()))
}

/// Blog id from a blog home link (`/<id>` or `?blogId=<id>`), ignoring post links.
pub fn extract_blog_id(url: &str) -> Option<String> {
    let url = url.trim();
    if let Some(caps) = BLOG_HOME.captures(url) {
        return Some(caps[1].to_string());
    }
    if is_blog_link(url) {
        return QUERY_BLOG_ID.captures(url).map(|c| c[1].to_string());
    }
    None
}
