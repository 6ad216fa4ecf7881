//! Feed and discovery runs: paging, enrichment, per-record upserts and run summaries.

use std::collections::HashSet;
use std::path::PathBuf;
use std::time::Duration;

use anyhow::{Context, Result};
use chrono::{DateTime, Utc};
use nbsync_adapters::{
    parse_feed_page, parse_neighbor_admin_page, write_discovered_csv, FeedFormat, NeighborDirectory,
    PageSource,
};
use nbsync_core::{DiscoveredNeighbor, PostRecord, RowFields, DEFAULT_DESCRIPTION_MAX_CHARS};
use serde::Serialize;
use tracing::{debug, info, info_span, warn, Instrument};
use uuid::Uuid;

use crate::reconcile::{Reconciler, UpsertAction};
use crate::PageOrder;

pub trait EnrichmentHook: Send + Sync {
    fn apply(&self, items: Vec<PostRecord>) -> Result<Vec<PostRecord>>;
}

#[derive(Default)]
pub struct NoopEnrichmentHook;

impl EnrichmentHook for NoopEnrichmentHook {
    fn apply(&self, items: Vec<PostRecord>) -> Result<Vec<PostRecord>> {
        Ok(items)
    }
}

/// Fills groups (and a missing nickname) from the neighbor CSV snapshot.
pub struct DirectoryEnrichmentHook {
    directory: NeighborDirectory,
}

impl DirectoryEnrichmentHook {
    pub fn new(directory: NeighborDirectory) -> Self {
        Self { directory }
    }
}

impl EnrichmentHook for DirectoryEnrichmentHook {
    fn apply(&self, mut items: Vec<PostRecord>) -> Result<Vec<PostRecord>> {
        for record in &mut items {
            let Some(meta) = self.directory.get(&record.blog_id) else {
                continue;
            };
            if !meta.groups.is_empty() {
                record.groups = meta.groups.clone();
            }
            if record.nickname.trim().is_empty() {
                if let Some(nickname) = &meta.nickname {
                    record.nickname = nickname.clone();
                }
            }
        }
        Ok(items)
    }
}

#[derive(Debug, Clone)]
pub struct FeedOptions {
    pub format: FeedFormat,
    pub max_pages: u32,
    pub max_records: Option<usize>,
    pub page_order: PageOrder,
    pub reverse_page_items: bool,
    pub page_delay: Duration,
    pub record_delay: Duration,
    pub description_max_chars: usize,
}

impl Default for FeedOptions {
    fn default() -> Self {
        Self {
            format: FeedFormat::Json,
            max_pages: 5,
            max_records: None,
            page_order: PageOrder::Ascending,
            reverse_page_items: false,
            page_delay: Duration::from_millis(1000),
            record_delay: Duration::from_millis(300),
            description_max_chars: DEFAULT_DESCRIPTION_MAX_CHARS,
        }
    }
}

#[derive(Debug, Clone, Serialize)]
pub struct FeedRunSummary {
    pub run_id: Uuid,
    pub started_at: DateTime<Utc>,
    pub finished_at: DateTime<Utc>,
    pub pages_fetched: usize,
    pub page_errors: usize,
    pub parse_failures: usize,
    pub items_seen: usize,
    pub skipped_missing: usize,
    pub duplicates_in_run: usize,
    pub processed: usize,
    pub created: usize,
    pub updated: usize,
    pub unchanged: usize,
    /// Rows created without a confirmed lookup; also counted in `created`.
    pub lookup_failures: usize,
    pub failed: usize,
}

impl FeedRunSummary {
    fn new(run_id: Uuid, started_at: DateTime<Utc>) -> Self {
        Self {
            run_id,
            started_at,
            finished_at: started_at,
            pages_fetched: 0,
            page_errors: 0,
            parse_failures: 0,
            items_seen: 0,
            skipped_missing: 0,
            duplicates_in_run: 0,
            processed: 0,
            created: 0,
            updated: 0,
            unchanged: 0,
            lookup_failures: 0,
            failed: 0,
        }
    }

    fn count(&mut self, action: UpsertAction) {
        match action {
            UpsertAction::Created => self.created += 1,
            UpsertAction::CreatedAfterLookupFailure => {
                self.created += 1;
                self.lookup_failures += 1;
            }
            UpsertAction::Updated => self.updated += 1,
            UpsertAction::Unchanged => self.unchanged += 1,
        }
    }
}

/// Pulls feed pages in order and upserts every complete record, one at a time.
pub struct FeedPipeline {
    options: FeedOptions,
    source: Box<dyn PageSource>,
    reconciler: Reconciler,
    enrichment: Box<dyn EnrichmentHook>,
}

impl FeedPipeline {
    pub fn new(options: FeedOptions, source: Box<dyn PageSource>, reconciler: Reconciler) -> Self {
        Self {
            options,
            source,
            reconciler,
            enrichment: Box::<NoopEnrichmentHook>::default(),
        }
    }

    pub fn with_enrichment(mut self, enrichment: Box<dyn EnrichmentHook>) -> Self {
        self.enrichment = enrichment;
        self
    }

    fn budget_spent(&self, processed: usize) -> bool {
        self.options.max_records.is_some_and(|max| processed >= max)
    }

    pub async fn run_once(&self) -> Result<FeedRunSummary> {
        let run_id = Uuid::new_v4();
        let span = info_span!("feed_run", %run_id);
        self.run_pages(run_id).instrument(span).await
    }

    async fn run_pages(&self, run_id: Uuid) -> Result<FeedRunSummary> {
        let mut summary = FeedRunSummary::new(run_id, Utc::now());
        let mut seen_ids: HashSet<String> = HashSet::new();
        let pages = self.options.page_order.pages(self.options.max_pages);
        info!(pages = pages.len(), order = ?self.options.page_order, "feed run started");

        'pages: for (index, page) in pages.into_iter().enumerate() {
            if self.budget_spent(summary.processed) {
                info!(processed = summary.processed, "record limit reached");
                break;
            }
            if index > 0 {
                tokio::time::sleep(self.options.page_delay).await;
            }

            let body = match self.source.fetch_page(page).await {
                Ok(body) => body,
                Err(err) => {
                    summary.page_errors += 1;
                    warn!(page, error = %err, "page fetch failed, skipping page");
                    continue;
                }
            };
            summary.pages_fetched += 1;

            let mut parsed = parse_feed_page(self.options.format, &body);
            if parsed.parse_failed {
                summary.parse_failures += 1;
            }
            if self.options.reverse_page_items {
                parsed.reverse();
            }
            let skipped = parsed.skipped_missing;
            summary.items_seen += parsed.records.len() + skipped;
            summary.skipped_missing += skipped;
            let records = self
                .enrichment
                .apply(parsed.records)
                .with_context(|| format!("enriching records of page {page}"))?;
            info!(page, records = records.len(), skipped, "page parsed");

            for record in records {
                if self.budget_spent(summary.processed) {
                    info!(processed = summary.processed, "record limit reached");
                    break 'pages;
                }
                let max_chars = self.options.description_max_chars;
                let Some(fields) = RowFields::from_record(&record, max_chars) else {
                    summary.skipped_missing += 1;
                    continue;
                };
                if !seen_ids.insert(fields.unique_id.clone()) {
                    summary.duplicates_in_run += 1;
                    debug!(page, unique_id = %fields.unique_id, "already handled in this run");
                    continue;
                }

                if summary.processed > 0 {
                    tokio::time::sleep(self.options.record_delay).await;
                }
                summary.processed += 1;
                match self.reconciler.upsert(&fields, Utc::now()).await {
                    Ok(action) => summary.count(action),
                    Err(err) => {
                        summary.failed += 1;
                        warn!(
                            page,
                            title = %fields.title,
                            unique_id = %fields.unique_id,
                            error = %err,
                            "record write failed, continuing"
                        );
                    }
                }
            }
        }

        summary.finished_at = Utc::now();
        info!(
            pages_fetched = summary.pages_fetched,
            page_errors = summary.page_errors,
            items_seen = summary.items_seen,
            skipped_missing = summary.skipped_missing,
            created = summary.created,
            updated = summary.updated,
            unchanged = summary.unchanged,
            failed = summary.failed,
            "feed run finished"
        );
        Ok(summary)
    }
}

#[derive(Debug, Clone, Serialize)]
pub struct DiscoveryRunSummary {
    pub run_id: Uuid,
    pub pages_fetched: usize,
    pub page_errors: usize,
    pub neighbors: usize,
    pub influencers: usize,
    pub output: String,
}

/// Walks the neighbor admin pages until one adds nothing new, then writes the CSV.
pub struct DiscoveryPipeline {
    source: Box<dyn PageSource>,
    max_pages: u32,
    page_delay: Duration,
    output: PathBuf,
}

impl DiscoveryPipeline {
    pub fn new(
        source: Box<dyn PageSource>,
        max_pages: u32,
        page_delay: Duration,
        output: PathBuf,
    ) -> Self {
        Self {
            source,
            max_pages,
            page_delay,
            output,
        }
    }

    pub async fn run(&self) -> Result<DiscoveryRunSummary> {
        let run_id = Uuid::new_v4();
        let span = info_span!("discovery_run", %run_id);
        self.collect(run_id).instrument(span).await
    }

    async fn collect(&self, run_id: Uuid) -> Result<DiscoveryRunSummary> {
        let mut found: Vec<DiscoveredNeighbor> = Vec::new();
        let mut seen: HashSet<String> = HashSet::new();
        let mut pages_fetched = 0;
        let mut page_errors = 0;

        for page in 1..=self.max_pages {
            if page > 1 {
                tokio::time::sleep(self.page_delay).await;
            }
            let body = match self.source.fetch_page(page).await {
                Ok(body) => body,
                Err(err) => {
                    page_errors += 1;
                    warn!(page, error = %err, "admin page fetch failed, skipping page");
                    continue;
                }
            };
            pages_fetched += 1;

            let mut fresh = 0;
            for neighbor in parse_neighbor_admin_page(&body) {
                if seen.insert(neighbor.blog_id.clone()) {
                    found.push(neighbor);
                    fresh += 1;
                }
            }
            info!(page, fresh, total = found.len(), "admin page parsed");
            if fresh == 0 {
                info!(page, "no new neighbors, stopping");
                break;
            }
        }

        write_discovered_csv(&self.output, &found)
            .with_context(|| format!("writing {}", self.output.display()))?;

        let summary = DiscoveryRunSummary {
            run_id,
            pages_fetched,
            page_errors,
            neighbors: found.len(),
            influencers: found.iter().filter(|n| n.influencer).count(),
            output: self.output.display().to_string(),
        };
        info!(
            pages_fetched = summary.pages_fetched,
            neighbors = summary.neighbors,
            influencers = summary.influencers,
            output = %summary.output,
            "discovery finished"
        );
        Ok(summary)
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::testing::{fast_policy, feed_body, FakePages, FakeTable};
    use nbsync_core::NeighborMeta;
    use std::sync::Arc;

    fn quick_options() -> FeedOptions {
        FeedOptions {
            max_pages: 3,
            page_delay: Duration::ZERO,
            record_delay: Duration::ZERO,
            ..FeedOptions::default()
        }
    }

    fn pipeline(options: FeedOptions, pages: FakePages, table: &Arc<FakeTable>) -> FeedPipeline {
        FeedPipeline::new(options, Box::new(pages), Reconciler::new(table.clone(), fast_policy()))
    }

    #[tokio::test]
    async fn descending_order_fetches_last_page_first() {
        let pages = FakePages::default()
            .with_page(1, feed_body(&[("A", "alice", "1")]))
            .with_page(2, feed_body(&[("B", "bob", "2")]))
            .with_page(3, feed_body(&[("C", "carol", "3")]));
        let log = pages.fetch_log();
        let table = Arc::new(FakeTable::default());
        let options = FeedOptions {
            page_order: PageOrder::Descending,
            ..quick_options()
        };

        let summary = pipeline(options, pages, &table).run_once().await.unwrap();

        assert_eq!(*log.lock().unwrap(), vec![3, 2, 1]);
        let titles: Vec<String> = table.rows().into_iter().map(|r| r.fields.title).collect();
        assert_eq!(titles, vec!["C", "B", "A"]);
        assert_eq!(summary.created, 3);
    }

    #[tokio::test]
    async fn one_failed_write_does_not_stop_the_batch() {
        let pages = FakePages::default().with_page(
            1,
            feed_body(&[("A", "alice", "1"), ("B", "bob", "2"), ("C", "carol", "3")]),
        );
        let table = Arc::new(FakeTable::default());
        table.reject_writes_titled("B");
        let options = FeedOptions {
            max_pages: 1,
            ..quick_options()
        };

        let summary = pipeline(options, pages, &table).run_once().await.unwrap();

        assert_eq!(summary.processed, 3);
        assert_eq!(summary.created, 2);
        assert_eq!(summary.failed, 1);
        assert_eq!(table.rows().len(), 2);
    }

    #[tokio::test]
    async fn record_limit_stops_before_the_next_page() {
        let table = Arc::new(FakeTable::default());
        let pages = FakePages::default()
            .with_page(1, feed_body(&[("A", "alice", "1"), ("B", "bob", "2")]))
            .with_page(2, feed_body(&[("C", "carol", "3"), ("D", "dave", "4")]));
        let log = pages.fetch_log();
        let options = FeedOptions {
            max_records: Some(2),
            ..quick_options()
        };

        let summary = pipeline(options, pages, &table).run_once().await.unwrap();
        assert_eq!(summary.processed, 2);
        assert_eq!(*log.lock().unwrap(), vec![1]);

        let pages = FakePages::default()
            .with_page(1, feed_body(&[("A", "alice", "1"), ("B", "bob", "2")]))
            .with_page(2, feed_body(&[("C", "carol", "3"), ("D", "dave", "4")]));
        let options = FeedOptions {
            max_records: Some(3),
            ..quick_options()
        };
        let summary = pipeline(options, pages, &Arc::new(FakeTable::default()))
            .run_once()
            .await
            .unwrap();
        assert_eq!(summary.processed, 3);
        assert_eq!(summary.pages_fetched, 2);
    }

    #[tokio::test]
    async fn second_identical_run_writes_nothing() {
        let table = Arc::new(FakeTable::default());
        let make_pages = || {
            FakePages::default()
                .with_page(1, feed_body(&[("A", "alice", "1"), ("B", "bob", "2")]))
                .with_page(2, feed_body(&[("C", "carol", "3")]))
        };

        let first = pipeline(quick_options(), make_pages(), &table).run_once().await.unwrap();
        assert_eq!(first.created, 3);
        table.reset_counters();

        let second = pipeline(quick_options(), make_pages(), &table).run_once().await.unwrap();
        assert_eq!(second.unchanged, 3);
        assert_eq!(second.created + second.updated, 0);
        assert_eq!(table.creates() + table.updates(), 0);
        assert_eq!(table.rows().len(), 3);
        assert_ne!(first.run_id, second.run_id);
    }

    #[tokio::test]
    async fn bad_pages_are_counted_and_skipped() {
        let pages = FakePages::default()
            .with_error(1, "connection reset")
            .with_page(2, "<html>maintenance</html>")
            .with_page(3, feed_body(&[("A", "alice", "1")]));
        let table = Arc::new(FakeTable::default());

        let summary = pipeline(quick_options(), pages, &table).run_once().await.unwrap();

        assert_eq!(summary.page_errors, 1);
        assert_eq!(summary.pages_fetched, 2);
        assert_eq!(summary.parse_failures, 1);
        assert_eq!(summary.created, 1);
    }

    #[tokio::test]
    async fn incomplete_and_repeated_items_are_not_written() {
        let partial = r#"{"result":{"postList":[
            {"title":"no link or ids"},
            {"title":"A","postUrl":"https://blog.naver.com/alice/1"}
        ]}}"#;
        let pages = FakePages::default()
            .with_page(1, partial)
            .with_page(2, feed_body(&[("A", "alice", "1"), ("B", "bob", "2")]));
        let table = Arc::new(FakeTable::default());
        let options = FeedOptions {
            max_pages: 2,
            ..quick_options()
        };

        let summary = pipeline(options, pages, &table).run_once().await.unwrap();

        assert_eq!(summary.items_seen, 4);
        assert_eq!(summary.skipped_missing, 1);
        assert_eq!(summary.duplicates_in_run, 1);
        assert_eq!(summary.created, 2);
        assert_eq!(table.queries(), 2);
    }

    #[tokio::test]
    async fn reversed_page_items_are_written_bottom_up() {
        let pages = FakePages::default()
            .with_page(1, feed_body(&[("A", "alice", "1"), ("B", "bob", "2")]));
        let table = Arc::new(FakeTable::default());
        let options = FeedOptions {
            max_pages: 1,
            reverse_page_items: true,
            ..quick_options()
        };

        pipeline(options, pages, &table).run_once().await.unwrap();

        let titles: Vec<String> = table.rows().into_iter().map(|r| r.fields.title).collect();
        assert_eq!(titles, vec!["B", "A"]);
    }

    #[tokio::test]
    async fn neighbor_directory_supplies_groups() {
        let directory = NeighborDirectory::from_entries([NeighborMeta {
            blog_id: "alice".into(),
            groups: vec!["Finance".into(), "Tech".into()],
            ..NeighborMeta::default()
        }]);
        let pages = FakePages::default()
            .with_page(1, feed_body(&[("A", "alice", "1"), ("B", "bob", "2")]));
        let table = Arc::new(FakeTable::default());
        let options = FeedOptions {
            max_pages: 1,
            ..quick_options()
        };

        pipeline(options, pages, &table)
            .with_enrichment(Box::new(DirectoryEnrichmentHook::new(directory)))
            .run_once()
            .await
            .unwrap();

        let rows = table.rows();
        assert_eq!(rows[0].fields.groups, vec!["Finance", "Tech"]);
        assert!(rows[1].fields.groups.is_empty());
    }

    #[test]
    fn directory_hook_fills_only_missing_nickname() {
        let directory = NeighborDirectory::from_entries([NeighborMeta {
            blog_id: "alice".into(),
            nickname: Some("Alice".into()),
            ..NeighborMeta::default()
        }]);
        let hook = DirectoryEnrichmentHook::new(directory);
        let mut unnamed = crate::testing::record("A", "alice", "1");
        unnamed.nickname.clear();
        let named = crate::testing::record("B", "alice", "2");

        let out = hook.apply(vec![unnamed, named]).unwrap();

        assert_eq!(out[0].nickname, "Alice");
        assert_eq!(out[1].nickname, "alice");
    }

    fn admin_page(ids: &[&str]) -> String {
        let rows: String = ids
            .iter()
            .map(|id| {
                format!(
                    r#"<tr><td><a href="https://blog.naver.com/{id}">{id}</a></td><td>이웃 1,200</td><td>스크랩 7</td></tr>"#
                )
            })
            .collect();
        format!("<html><body><table>{rows}</table></body></html>")
    }

    #[tokio::test]
    async fn discovery_stops_when_a_page_adds_nothing_new() {
        let dir = tempfile::tempdir().unwrap();
        let output = dir.path().join("neighbors.csv");
        let pages = FakePages::default()
            .with_page(1, admin_page(&["alice", "bob"]))
            .with_page(2, admin_page(&["bob", "carol"]))
            .with_page(3, admin_page(&["alice"]))
            .with_page(4, admin_page(&["dave"]));
        let log = pages.fetch_log();

        let summary = DiscoveryPipeline::new(Box::new(pages), 10, Duration::ZERO, output.clone())
            .run()
            .await
            .unwrap();

        assert_eq!(*log.lock().unwrap(), vec![1, 2, 3]);
        assert_eq!(summary.neighbors, 3);
        let written = std::fs::read_to_string(&output).unwrap();
        let lines: Vec<&str> = written.lines().collect();
        assert_eq!(lines[0], "blogId,blogUrl,neighborCount,scrapCount,influencer");
        assert_eq!(lines[1], "alice,https://blog.naver.com/alice,1200,7,false");
        assert_eq!(lines.len(), 4);
    }

    #[tokio::test]
    async fn discovery_skips_failed_pages() {
        let dir = tempfile::tempdir().unwrap();
        let output = dir.path().join("out.csv");
        let pages = FakePages::default()
            .with_error(1, "timeout")
            .with_page(2, admin_page(&["alice"]));

        let summary = DiscoveryPipeline::new(Box::new(pages), 3, Duration::ZERO, output)
            .run()
            .await
            .unwrap();

        assert_eq!(summary.page_errors, 1);
        assert_eq!(summary.pages_fetched, 2);
        assert_eq!(summary.neighbors, 1);
    }
}
