//! In-memory doubles for the remote table and page source.

use std::collections::{HashMap, HashSet};
use std::sync::atomic::{AtomicBool, AtomicUsize, Ordering};
use std::sync::{Arc, Mutex};
use std::time::Duration;

use async_trait::async_trait;
use chrono::{DateTime, Utc};
use nbsync_adapters::{AdapterError, PageSource};
use nbsync_core::{PostRecord, RemoteRow, RowFields, DEFAULT_DESCRIPTION_MAX_CHARS};
use nbsync_storage::{RemoteError, RemoteTable, RetryPolicy};

pub fn fast_policy() -> RetryPolicy {
    RetryPolicy::with_unit(Duration::ZERO)
}

pub fn record(title: &str, blog_id: &str, post_id: &str) -> PostRecord {
    PostRecord {
        title: title.to_string(),
        link: format!("https://blog.naver.com/{blog_id}/{post_id}"),
        nickname: blog_id.to_string(),
        published_raw: Some("2024-05-01".to_string()),
        description: format!("{title} body"),
        blog_id: blog_id.to_string(),
        post_id: post_id.to_string(),
        ..PostRecord::default()
    }
}

pub fn row_fields(record: &PostRecord) -> RowFields {
    RowFields::from_record(record, DEFAULT_DESCRIPTION_MAX_CHARS).expect("test record has an id")
}

/// JSON feed body holding one item per `(title, blog_id, post_id)`.
pub fn feed_body(items: &[(&str, &str, &str)]) -> String {
    let list: Vec<serde_json::Value> = items
        .iter()
        .map(|(title, blog, post)| {
            serde_json::json!({
                "title": title,
                "blogId": blog,
                "logNo": post,
                "nickName": blog,
                "postUrl": format!("https://blog.naver.com/{blog}/{post}"),
                "addDate": 1714521600000u64,
            })
        })
        .collect();
    format!(")]}}',\n{}", serde_json::json!({ "result": { "postList": list } }))
}

#[derive(Debug, Clone)]
pub struct StoredRow {
    pub row_id: String,
    pub fields: RowFields,
    pub created_at: DateTime<Utc>,
}

#[derive(Default)]
pub struct FakeTable {
    rows: Mutex<Vec<StoredRow>>,
    queries: AtomicUsize,
    creates: AtomicUsize,
    updates: AtomicUsize,
    transient_query_failures: AtomicUsize,
    reject_queries: AtomicBool,
    rejected_titles: Mutex<HashSet<String>>,
}

impl FakeTable {
    pub fn rows(&self) -> Vec<StoredRow> {
        self.rows.lock().unwrap().clone()
    }

    pub fn seed(&self, fields: RowFields) {
        let mut rows = self.rows.lock().unwrap();
        let row_id = format!("row-{}", rows.len() + 1);
        rows.push(StoredRow {
            row_id,
            fields,
            created_at: DateTime::<Utc>::UNIX_EPOCH,
        });
    }

    pub fn queries(&self) -> usize {
        self.queries.load(Ordering::SeqCst)
    }

    pub fn creates(&self) -> usize {
        self.creates.load(Ordering::SeqCst)
    }

    pub fn updates(&self) -> usize {
        self.updates.load(Ordering::SeqCst)
    }

    pub fn reset_counters(&self) {
        self.queries.store(0, Ordering::SeqCst);
        self.creates.store(0, Ordering::SeqCst);
        self.updates.store(0, Ordering::SeqCst);
    }

    /// The next `n` queries fail with a retryable 503.
    pub fn fail_next_queries(&self, n: usize) {
        self.transient_query_failures.store(n, Ordering::SeqCst);
    }

    /// Every query fails with a non-retryable 401.
    pub fn reject_queries(&self) {
        self.reject_queries.store(true, Ordering::SeqCst);
    }

    /// Creating or updating a row with this title fails with a non-retryable 400.
    pub fn reject_writes_titled(&self, title: &str) {
        self.rejected_titles.lock().unwrap().insert(title.to_string());
    }

    fn check_write(&self, fields: &RowFields) -> Result<(), RemoteError> {
        if self.rejected_titles.lock().unwrap().contains(&fields.title) {
            return Err(RemoteError::Api {
                status: 400,
                code: "validation_error".into(),
                message: "rejected by test".into(),
            });
        }
        Ok(())
    }
}

#[async_trait]
impl RemoteTable for FakeTable {
    async fn query_by_unique_id(&self, unique_id: &str) -> Result<Vec<RemoteRow>, RemoteError> {
        self.queries.fetch_add(1, Ordering::SeqCst);
        if self.reject_queries.load(Ordering::SeqCst) {
            return Err(RemoteError::Api {
                status: 401,
                code: "unauthorized".into(),
                message: "bad token".into(),
            });
        }
        let pending = self.transient_query_failures.load(Ordering::SeqCst);
        if pending > 0 {
            self.transient_query_failures.store(pending - 1, Ordering::SeqCst);
            return Err(RemoteError::Api {
                status: 503,
                code: "service_unavailable".into(),
                message: "try later".into(),
            });
        }
        Ok(self
            .rows
            .lock()
            .unwrap()
            .iter()
            .filter(|row| row.fields.unique_id == unique_id)
            .map(|row| RemoteRow {
                row_id: row.row_id.clone(),
                unique_id: row.fields.unique_id.clone(),
                title: row.fields.title.clone(),
                link: row.fields.link.clone(),
                category: row.fields.category.clone(),
                groups: row.fields.groups.clone(),
            })
            .collect())
    }

    async fn create_row(
        &self,
        fields: &RowFields,
        created_at: DateTime<Utc>,
    ) -> Result<String, RemoteError> {
        self.creates.fetch_add(1, Ordering::SeqCst);
        self.check_write(fields)?;
        let mut rows = self.rows.lock().unwrap();
        let row_id = format!("row-{}", rows.len() + 1);
        rows.push(StoredRow {
            row_id: row_id.clone(),
            fields: fields.clone(),
            created_at,
        });
        Ok(row_id)
    }

    async fn update_row(&self, row_id: &str, fields: &RowFields) -> Result<(), RemoteError> {
        self.updates.fetch_add(1, Ordering::SeqCst);
        self.check_write(fields)?;
        let mut rows = self.rows.lock().unwrap();
        let row = rows
            .iter_mut()
            .find(|row| row.row_id == row_id)
            .ok_or_else(|| RemoteError::Api {
                status: 404,
                code: "object_not_found".into(),
                message: format!("no row {row_id}"),
            })?;
        row.fields = fields.clone();
        Ok(())
    }
}

/// Serves canned bodies per page number and records the order pages were requested in.
#[derive(Default)]
pub struct FakePages {
    pages: HashMap<u32, Result<String, String>>,
    fetched: Arc<Mutex<Vec<u32>>>,
}

impl FakePages {
    pub fn with_page(mut self, page: u32, body: impl Into<String>) -> Self {
        self.pages.insert(page, Ok(body.into()));
        self
    }

    pub fn with_error(mut self, page: u32, message: &str) -> Self {
        self.pages.insert(page, Err(message.to_string()));
        self
    }

    /// Shared handle to the fetch log, still readable after the source is boxed.
    pub fn fetch_log(&self) -> Arc<Mutex<Vec<u32>>> {
        Arc::clone(&self.fetched)
    }
}

#[async_trait]
impl PageSource for FakePages {
    async fn fetch_page(&self, page: u32) -> Result<String, AdapterError> {
        self.fetched.lock().unwrap().push(page);
        match self.pages.get(&page) {
            Some(Ok(body)) => Ok(body.clone()),
            Some(Err(message)) => Err(AdapterError::Message(message.clone())),
            None => Ok(String::new()),
        }
    }
}
