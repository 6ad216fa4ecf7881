//! Lookup-then-write upsert keyed by the composite identifier.

use std::sync::Arc;

use chrono::{DateTime, Utc};
use nbsync_core::{changed_fields, RemoteRow, RowFields};
use nbsync_storage::{retry_remote, RemoteError, RemoteTable, RetryError, RetryPolicy};
use tracing::{info, warn};

/// Result of looking a record up before writing it.
#[derive(Debug)]
pub enum LookupOutcome {
    Found(RemoteRow),
    NotFound,
    /// Transient failures outlasted the retry policy; absence is not confirmed.
    Failed(RemoteError),
}

#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum UpsertAction {
    Created,
    /// Created without a confirmed lookup; the table may now hold a duplicate.
    CreatedAfterLookupFailure,
    Updated,
    Unchanged,
}

pub struct Reconciler {
    table: Arc<dyn RemoteTable>,
    retry: RetryPolicy,
}

impl Reconciler {
    pub fn new(table: Arc<dyn RemoteTable>, retry: RetryPolicy) -> Self {
        Self { table, retry }
    }

    /// Permanent query errors are returned as `Err`; exhausted transient ones become `Failed`.
    pub async fn lookup(&self, unique_id: &str) -> Result<LookupOutcome, RemoteError> {
        let result = retry_remote(&self.retry, "query", || {
            self.table.query_by_unique_id(unique_id)
        })
        .await;
        match result {
            Ok(rows) => {
                if rows.len() > 1 {
                    warn!(
                        unique_id,
                        matches = rows.len(),
                        "duplicate rows share this id; using the first"
                    );
                }
                Ok(rows.into_iter().next().map_or(LookupOutcome::NotFound, LookupOutcome::Found))
            }
            Err(RetryError::Exhausted { last, .. }) => Ok(LookupOutcome::Failed(last)),
            Err(RetryError::Permanent(err)) => Err(err),
        }
    }

    pub async fn upsert(
        &self,
        fields: &RowFields,
        now: DateTime<Utc>,
    ) -> Result<UpsertAction, RemoteError> {
        let title = fields.title.as_str();
        let unique_id = fields.unique_id.as_str();

        match self.lookup(unique_id).await? {
            LookupOutcome::Found(existing) => {
                let changed = changed_fields(&existing, fields);
                if changed.is_empty() {
                    info!(title, unique_id, "skipped (no change)");
                    return Ok(UpsertAction::Unchanged);
                }
                let row_id = existing.row_id.as_str();
                retry_remote(&self.retry, "update", || self.table.update_row(row_id, fields))
                    .await
                    .map_err(RetryError::into_inner)?;
                info!(title, unique_id, row_id, ?changed, "updated");
                Ok(UpsertAction::Updated)
            }
            LookupOutcome::NotFound => {
                let row_id = self.create(fields, now).await?;
                info!(title, unique_id, %row_id, "created");
                Ok(UpsertAction::Created)
            }
            LookupOutcome::Failed(err) => {
                warn!(
                    title,
                    unique_id,
                    error = %err,
                    "lookup failed after retries; creating anyway, a duplicate row is possible"
                );
                let row_id = self.create(fields, now).await?;
                info!(title, unique_id, %row_id, "created");
                Ok(UpsertAction::CreatedAfterLookupFailure)
            }
        }
    }

    async fn create(&self, fields: &RowFields, now: DateTime<Utc>) -> Result<String, RemoteError> {
        retry_remote(&self.retry, "create", || self.table.create_row(fields, now))
            .await
            .map_err(RetryError::into_inner)
    }
}
