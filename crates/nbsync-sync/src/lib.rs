//! Feed and discovery pipelines: configuration, reconciliation and run summaries.

use std::path::PathBuf;
use std::str::FromStr;
use std::sync::Arc;
use std::time::Duration;

use anyhow::{Context, Result};
use nbsync_adapters::{load_neighbor_csv, FeedFormat, HttpPageSource, NeighborDirectory};
use nbsync_core::DEFAULT_DESCRIPTION_MAX_CHARS;
use nbsync_storage::{HttpClientConfig, HttpFetcher, NotionConfig, NotionTable, RetryPolicy};
use thiserror::Error;
use tracing::info;

pub mod pipeline;
pub mod reconcile;

#[cfg(test)]
pub(crate) mod testing;

pub use pipeline::{
    DirectoryEnrichmentHook, DiscoveryPipeline, DiscoveryRunSummary, EnrichmentHook, FeedOptions,
    FeedPipeline, FeedRunSummary, NoopEnrichmentHook,
};
pub use reconcile::{LookupOutcome, Reconciler, UpsertAction};

pub const CRATE_NAME: &str = "nbsync-sync";

const DEFAULT_FEED_URL: &str =
    "https://section.blog.naver.com/ajax/SubscriptionPostList.naver?pageNo={page}&groupNo={group}";
const DEFAULT_HTML_FEED_URL: &str =
    "https://section.blog.naver.com/BlogHome.naver?directoryNo=0&currentPage={page}&groupId={group}";
const DEFAULT_ADMIN_URL: &str =
    "https://admin.blog.naver.com/BuddyListManage.naver?blogId={blog}&currentPage={page}";
const DEFAULT_REFERER: &str = "https://section.blog.naver.com/BlogHome.naver";

#[derive(Debug, Error)]
pub enum ConfigError {
    #[error("missing required environment variable {0}")]
    Missing(&'static str),
    #[error("invalid value for {name}: {value:?} ({reason})")]
    Invalid {
        name: &'static str,
        value: String,
        reason: String,
    },
}

#[derive(Debug, Clone, Copy, PartialEq, Eq, Default)]
pub enum PageOrder {
    #[default]
    Ascending,
    Descending,
}

impl PageOrder {
    pub fn pages(self, max_pages: u32) -> Vec<u32> {
        match self {
            PageOrder::Ascending => (1..=max_pages).collect(),
            PageOrder::Descending => (1..=max_pages).rev().collect(),
        }
    }
}

impl FromStr for PageOrder {
    type Err = String;

    fn from_str(s: &str) -> Result<Self, Self::Err> {
        match s.trim().to_ascii_lowercase().as_str() {
            "asc" | "ascending" => Ok(PageOrder::Ascending),
            "desc" | "descending" => Ok(PageOrder::Descending),
            other => Err(format!("expected asc or desc, got {other}")),
        }
    }
}

fn required<F>(lookup: &F, name: &'static str) -> Result<String, ConfigError>
where
    F: Fn(&str) -> Option<String>,
{
    lookup(name)
        .map(|v| v.trim().to_string())
        .filter(|v| !v.is_empty())
        .ok_or(ConfigError::Missing(name))
}

fn optional_string<F>(lookup: &F, name: &str) -> Option<String>
where
    F: Fn(&str) -> Option<String>,
{
    lookup(name)
        .map(|v| v.trim().to_string())
        .filter(|v| !v.is_empty())
}

fn parsed<F, T>(lookup: &F, name: &'static str) -> Result<Option<T>, ConfigError>
where
    F: Fn(&str) -> Option<String>,
    T: FromStr,
    T::Err: std::fmt::Display,
{
    match optional_string(lookup, name) {
        None => Ok(None),
        Some(value) => value.parse::<T>().map(Some).map_err(|err| ConfigError::Invalid {
            name,
            reason: err.to_string(),
            value,
        }),
    }
}

fn flag<F>(lookup: &F, name: &'static str) -> Result<Option<bool>, ConfigError>
where
    F: Fn(&str) -> Option<String>,
{
    match optional_string(lookup, name) {
        None => Ok(None),
        Some(value) => match value.to_ascii_lowercase().as_str() {
            "1" | "true" | "yes" | "on" => Ok(Some(true)),
            "0" | "false" | "no" | "off" => Ok(Some(false)),
            _ => Err(ConfigError::Invalid {
                name,
                value,
                reason: "expected true or false".to_string(),
            }),
        },
    }
}

fn millis<F>(lookup: &F, name: &'static str, default_ms: u64) -> Result<Duration, ConfigError>
where
    F: Fn(&str) -> Option<String>,
{
    Ok(Duration::from_millis(parsed(lookup, name)?.unwrap_or(default_ms)))
}

fn env_lookup(name: &str) -> Option<String> {
    std::env::var(name).ok()
}

/// Settings for the feed ingestion run.
#[derive(Debug, Clone)]
pub struct SyncConfig {
    pub naver_cookie: String,
    pub notion_token: String,
    pub notion_database_id: String,
    pub feed_url: String,
    pub feed_format: FeedFormat,
    pub group_id: String,
    pub max_pages: u32,
    pub max_records: Option<usize>,
    pub page_order: PageOrder,
    pub reverse_page_items: bool,
    pub page_delay: Duration,
    pub record_delay: Duration,
    pub retry_unit: Duration,
    pub description_max_chars: usize,
    pub neighbor_csv: Option<PathBuf>,
    pub user_agent: String,
    pub http_timeout_secs: u64,
}

impl SyncConfig {
    pub fn from_env() -> Result<Self, ConfigError> {
        Self::from_lookup(env_lookup)
    }

    pub fn from_lookup<F>(lookup: F) -> Result<Self, ConfigError>
    where
        F: Fn(&str) -> Option<String>,
    {
        let feed_format: FeedFormat = parsed(&lookup, "FEED_FORMAT")?.unwrap_or_default();
        let default_feed_url = match feed_format {
            FeedFormat::Json => DEFAULT_FEED_URL,
            FeedFormat::Html => DEFAULT_HTML_FEED_URL,
        };
        Ok(Self {
            naver_cookie: required(&lookup, "NAVER_COOKIE")?,
            notion_token: required(&lookup, "NOTION_TOKEN")?,
            notion_database_id: required(&lookup, "NOTION_DB_ID")?,
            feed_url: optional_string(&lookup, "FEED_URL")
                .unwrap_or_else(|| default_feed_url.to_string()),
            feed_format,
            group_id: optional_string(&lookup, "GROUP_ID").unwrap_or_else(|| "0".to_string()),
            max_pages: parsed(&lookup, "MAX_PAGES")?.unwrap_or(5),
            max_records: parsed(&lookup, "MAX_RECORDS")?,
            page_order: parsed(&lookup, "PAGE_ORDER")?.unwrap_or_default(),
            reverse_page_items: flag(&lookup, "REVERSE_PAGE_ITEMS")?.unwrap_or(false),
            page_delay: millis(&lookup, "PAGE_DELAY_MS", 1000)?,
            record_delay: millis(&lookup, "RECORD_DELAY_MS", 300)?,
            retry_unit: millis(&lookup, "RETRY_UNIT_MS", 1000)?,
            description_max_chars: parsed(&lookup, "DESCRIPTION_MAX_CHARS")?
                .unwrap_or(DEFAULT_DESCRIPTION_MAX_CHARS),
            neighbor_csv: optional_string(&lookup, "NEIGHBOR_CSV").map(PathBuf::from),
            user_agent: optional_string(&lookup, "NBSYNC_USER_AGENT")
                .unwrap_or_else(|| "Mozilla/5.0".to_string()),
            http_timeout_secs: parsed(&lookup, "NBSYNC_HTTP_TIMEOUT_SECS")?.unwrap_or(10),
        })
    }

    pub fn feed_options(&self) -> FeedOptions {
        FeedOptions {
            format: self.feed_format,
            max_pages: self.max_pages,
            max_records: self.max_records,
            page_order: self.page_order,
            reverse_page_items: self.reverse_page_items,
            page_delay: self.page_delay,
            record_delay: self.record_delay,
            description_max_chars: self.description_max_chars,
        }
    }
}

/// Settings for the neighbor discovery run.
#[derive(Debug, Clone)]
pub struct DiscoveryConfig {
    pub naver_cookie: String,
    pub blog_id: String,
    pub admin_url: String,
    pub max_pages: u32,
    pub page_delay: Duration,
    pub retry_unit: Duration,
    pub output: PathBuf,
    pub user_agent: String,
    pub http_timeout_secs: u64,
}

impl DiscoveryConfig {
    pub fn from_env() -> Result<Self, ConfigError> {
        Self::from_lookup(env_lookup)
    }

    pub fn from_lookup<F>(lookup: F) -> Result<Self, ConfigError>
    where
        F: Fn(&str) -> Option<String>,
    {
        Ok(Self {
            naver_cookie: required(&lookup, "NAVER_COOKIE")?,
            blog_id: required(&lookup, "BLOG_ID")?,
            admin_url: optional_string(&lookup, "ADMIN_URL")
                .unwrap_or_else(|| DEFAULT_ADMIN_URL.to_string()),
            max_pages: parsed(&lookup, "MAX_PAGES")?.unwrap_or(50),
            page_delay: millis(&lookup, "PAGE_DELAY_MS", 1000)?,
            retry_unit: millis(&lookup, "RETRY_UNIT_MS", 1000)?,
            output: optional_string(&lookup, "DISCOVERY_OUTPUT")
                .map(PathBuf::from)
                .unwrap_or_else(|| PathBuf::from("neighbors.csv")),
            user_agent: optional_string(&lookup, "NBSYNC_USER_AGENT")
                .unwrap_or_else(|| "Mozilla/5.0".to_string()),
            http_timeout_secs: parsed(&lookup, "NBSYNC_HTTP_TIMEOUT_SECS")?.unwrap_or(10),
        })
    }
}

fn build_fetcher(
    cookie: &str,
    user_agent: &str,
    timeout_secs: u64,
    retry_unit: Duration,
) -> Result<HttpFetcher> {
    HttpFetcher::new(HttpClientConfig {
        timeout: Duration::from_secs(timeout_secs),
        user_agent: Some(user_agent.to_string()),
        cookie: Some(cookie.to_string()),
        referer: Some(DEFAULT_REFERER.to_string()),
        retry: RetryPolicy::with_unit(retry_unit),
    })
}

pub async fn run_feed_once(config: SyncConfig) -> Result<FeedRunSummary> {
    let fetcher = build_fetcher(
        &config.naver_cookie,
        &config.user_agent,
        config.http_timeout_secs,
        config.retry_unit,
    )?;
    let source = HttpPageSource::new(
        fetcher,
        "feed",
        config.feed_url.clone(),
        config.group_id.clone(),
        "",
    );
    let table = NotionTable::new(NotionConfig {
        token: config.notion_token.clone(),
        database_id: config.notion_database_id.clone(),
        timeout: Duration::from_secs(config.http_timeout_secs),
    })?;

    let mut pipeline = FeedPipeline::new(
        config.feed_options(),
        Box::new(source),
        Reconciler::new(Arc::new(table), RetryPolicy::with_unit(config.retry_unit)),
    );

    if let Some(path) = &config.neighbor_csv {
        let directory: NeighborDirectory = load_neighbor_csv(path)
            .with_context(|| format!("loading neighbor CSV {}", path.display()))?;
        info!(neighbors = directory.len(), path = %path.display(), "loaded neighbor directory");
        pipeline = pipeline.with_enrichment(Box::new(DirectoryEnrichmentHook::new(directory)));
    }

    pipeline.run_once().await
}

pub async fn run_feed_once_from_env() -> Result<FeedRunSummary> {
    let config = SyncConfig::from_env()?;
    run_feed_once(config).await
}

pub async fn run_discovery(config: DiscoveryConfig) -> Result<DiscoveryRunSummary> {
    let fetcher = build_fetcher(
        &config.naver_cookie,
        &config.user_agent,
        config.http_timeout_secs,
        config.retry_unit,
    )?;
    let source = HttpPageSource::new(
        fetcher,
        "admin",
        config.admin_url.clone(),
        "",
        config.blog_id.clone(),
    );
    DiscoveryPipeline::new(
        Box::new(source),
        config.max_pages,
        config.page_delay,
        config.output.clone(),
    )
    .run()
    .await
}

pub async fn run_discovery_from_env() -> Result<DiscoveryRunSummary> {
    let config = DiscoveryConfig::from_env()?;
    run_discovery(config).await
}
