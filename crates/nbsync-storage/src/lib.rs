//! HTTP fetch, retry policy and remote table access for nbsync.

use std::future::Future;
use std::time::Duration;

use anyhow::Context;
use async_trait::async_trait;
use chrono::{DateTime, Utc};
use nbsync_core::{RemoteRow, RowFields};
use reqwest::header::{HeaderMap, HeaderValue, COOKIE, REFERER};
use reqwest::StatusCode;
use thiserror::Error;
use tracing::{info_span, warn, Instrument};

pub mod notion;

pub use notion::{NotionConfig, NotionTable};

pub const CRATE_NAME: &str = "nbsync-storage";

#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum RetryDisposition {
    Retryable,
    NonRetryable,
}

pub fn classify_status(status: StatusCode) -> RetryDisposition {
    if status.is_server_error() || status == StatusCode::TOO_MANY_REQUESTS {
        RetryDisposition::Retryable
    } else {
        RetryDisposition::NonRetryable
    }
}

pub fn classify_reqwest_error(err: &reqwest::Error) -> RetryDisposition {
    if err.is_timeout() || err.is_connect() || err.is_request() {
        RetryDisposition::Retryable
    } else {
        RetryDisposition::NonRetryable
    }
}

const TRANSIENT_SIGNATURES: &[&str] = &[
    "rate limit",
    "rate_limited",
    "too many requests",
    "econnreset",
    "connection reset",
    "socket hang up",
    "etimedout",
    "timed out",
    "timeout",
    "service unavailable",
    "service_unavailable",
];

pub fn is_transient_message(message: &str) -> bool {
    let lower = message.to_ascii_lowercase();
    TRANSIENT_SIGNATURES.iter().any(|sig| lower.contains(sig))
}

/// Failure talking to the remote table.
#[derive(Debug, Error)]
pub enum RemoteError {
    #[error("network error: {message}")]
    Network {
        message: String,
        timeout: bool,
        connect: bool,
    },
    #[error("api error (status {status}, code {code}): {message}")]
    Api {
        status: u16,
        code: String,
        message: String,
    },
    #[error("parse error: {0}")]
    Parse(String),
}

impl From<reqwest::Error> for RemoteError {
    fn from(err: reqwest::Error) -> Self {
        RemoteError::Network {
            message: err.to_string(),
            timeout: err.is_timeout(),
            connect: err.is_connect() || err.is_request(),
        }
    }
}

impl From<serde_json::Error> for RemoteError {
    fn from(err: serde_json::Error) -> Self {
        RemoteError::Parse(err.to_string())
    }
}

pub fn classify_remote_error(err: &RemoteError) -> RetryDisposition {
    match err {
        RemoteError::Network {
            message,
            timeout,
            connect,
        } => {
            if *timeout || *connect || is_transient_message(message) {
                RetryDisposition::Retryable
            } else {
                RetryDisposition::NonRetryable
            }
        }
        RemoteError::Api { status, code, .. } => {
            let by_status = StatusCode::from_u16(*status)
                .map(classify_status)
                .unwrap_or(RetryDisposition::NonRetryable);
            if by_status == RetryDisposition::Retryable || is_transient_message(code) {
                RetryDisposition::Retryable
            } else {
                RetryDisposition::NonRetryable
            }
        }
        RemoteError::Parse(_) => RetryDisposition::NonRetryable,
    }
}

/// Linear backoff: the wait after failed attempt `n` is `n * unit`.
#[derive(Debug, Clone, Copy)]
pub struct RetryPolicy {
    pub max_attempts: u32,
    pub unit: Duration,
}

impl Default for RetryPolicy {
    fn default() -> Self {
        Self {
            max_attempts: 3,
            unit: Duration::from_millis(1000),
        }
    }
}

impl RetryPolicy {
    pub fn with_unit(unit: Duration) -> Self {
        Self {
            unit,
            ..Self::default()
        }
    }

    pub fn delay_after_attempt(&self, attempt: u32) -> Duration {
        self.unit.saturating_mul(attempt)
    }
}

#[derive(Debug, Error)]
pub enum RetryError {
    #[error("gave up after {attempts} attempts: {last}")]
    Exhausted { attempts: u32, last: RemoteError },
    #[error(transparent)]
    Permanent(RemoteError),
}

impl RetryError {
    pub fn into_inner(self) -> RemoteError {
        match self {
            RetryError::Exhausted { last, .. } => last,
            RetryError::Permanent(err) => err,
        }
    }
}

/// Runs `call` until it succeeds, fails permanently, or the policy runs out of attempts.
pub async fn retry_remote<T, F, Fut>(
    policy: &RetryPolicy,
    operation: &str,
    mut call: F,
) -> Result<T, RetryError>
where
    F: FnMut() -> Fut,
    Fut: Future<Output = Result<T, RemoteError>>,
{
    let max_attempts = policy.max_attempts.max(1);
    let mut attempt = 1;
    loop {
        let err = match call().await {
            Ok(value) => return Ok(value),
            Err(err) => err,
        };

        if classify_remote_error(&err) == RetryDisposition::NonRetryable {
            return Err(RetryError::Permanent(err));
        }
        if attempt >= max_attempts {
            warn!(operation, attempts = attempt, error = %err, "retries exhausted");
            return Err(RetryError::Exhausted {
                attempts: attempt,
                last: err,
            });
        }

        let delay = policy.delay_after_attempt(attempt);
        warn!(
            operation,
            attempt,
            max_attempts,
            delay_ms = delay.as_millis() as u64,
            error = %err,
            "transient remote error, retrying"
        );
        tokio::time::sleep(delay).await;
        attempt += 1;
    }
}

/// Access to the table rows are upserted into.
#[async_trait]
pub trait RemoteTable: Send + Sync {
    /// Rows whose unique id equals `unique_id`, in the order the remote returns them.
    async fn query_by_unique_id(&self, unique_id: &str) -> Result<Vec<RemoteRow>, RemoteError>;

    /// Creates a row and returns its remote id.
    async fn create_row(
        &self,
        fields: &RowFields,
        created_at: DateTime<Utc>,
    ) -> Result<String, RemoteError>;

    /// Rewrites every field of an existing row except its creation time.
    async fn update_row(&self, row_id: &str, fields: &RowFields) -> Result<(), RemoteError>;
}

#[derive(Debug, Clone)]
pub struct HttpClientConfig {
    pub timeout: Duration,
    pub user_agent: Option<String>,
    pub cookie: Option<String>,
    pub referer: Option<String>,
    pub retry: RetryPolicy,
}

impl Default for HttpClientConfig {
    fn default() -> Self {
        Self {
            timeout: Duration::from_secs(10),
            user_agent: None,
            cookie: None,
            referer: None,
            retry: RetryPolicy::default(),
        }
    }
}

#[derive(Debug)]
pub struct HttpFetcher {
    client: reqwest::Client,
    retry: RetryPolicy,
}

#[derive(Debug, Clone)]
pub struct FetchedResponse {
    pub status: StatusCode,
    pub final_url: String,
    pub body: String,
}

#[derive(Debug, Error)]
pub enum FetchError {
    #[error("request failed after retries: {0}")]
    Request(#[from] reqwest::Error),
    #[error("http status {status} for {url}")]
    HttpStatus { status: u16, url: String },
}

impl HttpFetcher {
    pub fn new(config: HttpClientConfig) -> anyhow::Result<Self> {
        let mut headers = HeaderMap::new();
        if let Some(cookie) = &config.cookie {
            let mut value = HeaderValue::from_str(cookie)
                .context("session cookie is not a valid header value")?;
            value.set_sensitive(true);
            headers.insert(COOKIE, value);
        }
        if let Some(referer) = &config.referer {
            headers.insert(
                REFERER,
                HeaderValue::from_str(referer).context("referer is not a valid header value")?,
            );
        }

        let mut builder = reqwest::Client::builder()
            .gzip(true)
            .brotli(true)
            .timeout(config.timeout)
            .default_headers(headers);

        if let Some(user_agent) = &config.user_agent {
            builder = builder.user_agent(user_agent.clone());
        }

        let client = builder.build().context("building reqwest client")?;

        Ok(Self {
            client,
            retry: config.retry,
        })
    }

    pub async fn fetch_text(&self, source: &str, url: &str) -> Result<FetchedResponse, FetchError> {
        let span = info_span!("http_fetch", source, url);
        self.fetch_text_inner(url).instrument(span).await
    }

    async fn fetch_text_inner(&self, url: &str) -> Result<FetchedResponse, FetchError> {
        let max_attempts = self.retry.max_attempts.max(1);
        let mut attempt = 1;

        loop {
            match self.client.get(url).send().await {
                Ok(resp) => {
                    let status = resp.status();
                    let final_url = resp.url().to_string();

                    if status.is_success() {
                        let body = resp.text().await?;
                        return Ok(FetchedResponse {
                            status,
                            final_url,
                            body,
                        });
                    }

                    if classify_status(status) == RetryDisposition::Retryable
                        && attempt < max_attempts
                    {
                        warn!(attempt, status = status.as_u16(), "retryable http status");
                        tokio::time::sleep(self.retry.delay_after_attempt(attempt)).await;
                        attempt += 1;
                        continue;
                    }

                    return Err(FetchError::HttpStatus {
                        status: status.as_u16(),
                        url: final_url,
                    });
                }
                Err(err) => {
                    if classify_reqwest_error(&err) == RetryDisposition::Retryable
                        && attempt < max_attempts
                    {
                        warn!(attempt, error = %err, "retryable request error");
                        tokio::time::sleep(self.retry.delay_after_attempt(attempt)).await;
                        attempt += 1;
                        continue;
                    }
                    return Err(FetchError::Request(err));
                }
            }
        }
    }
}
