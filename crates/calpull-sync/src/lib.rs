//! Pull pipeline orchestration: fetch → normalize → match → reconcile.

use std::path::PathBuf;
use std::sync::Arc;
use std::time::Duration;

use anyhow::{Context, Result};
use calpull_adapters::{normalize_feed, FeedEntry, FeedShape};
use calpull_storage::{
    FeedFetcher, FeedSource, HttpClientConfig, MemoryRecordStore, PgRecordStore, RecordStore,
};
use chrono::{DateTime, Utc};
use serde::Serialize;
use tokio::sync::Mutex;
use tracing::{error, info, info_span, warn, Instrument};
use uuid::Uuid;

pub mod matcher;
pub mod reconcile;
pub mod scheduler;
pub mod settings;

pub use matcher::find_by_external_id;
pub use reconcile::{event_metadata, upsert_meta, MetaWrite, Outcome, Reconciler};
pub use scheduler::{SyncScheduler, PULL_TRIGGER};
pub use settings::{InMemorySettings, SettingsError, SettingsStore, YamlSettingsStore};

pub const CRATE_NAME: &str = "calpull-sync";

#[derive(Debug, Clone)]
pub struct SyncConfig {
    pub database_url: Option<String>,
    pub workspace_root: PathBuf,
    pub user_agent: String,
    pub http_timeout_secs: u64,
}

impl SyncConfig {
    pub fn from_env() -> Self {
        Self {
            database_url: std::env::var("DATABASE_URL").ok().filter(|v| !v.trim().is_empty()),
            workspace_root: std::env::var("CALPULL_WORKSPACE")
                .map(PathBuf::from)
                .unwrap_or_else(|_| PathBuf::from(".")),
            user_agent: std::env::var("CALPULL_USER_AGENT")
                .unwrap_or_else(|_| format!("calpull/{}", env!("CARGO_PKG_VERSION"))),
            http_timeout_secs: std::env::var("CALPULL_HTTP_TIMEOUT_SECS")
                .ok()
                .and_then(|v| v.parse().ok())
                .unwrap_or(20),
        }
    }
}

#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize)]
#[serde(rename_all = "snake_case")]
pub enum RunMode {
    /// Periodic trigger; outcomes only go to the log.
    Scheduled,
    /// Operator-triggered; confirmation lines are collected for the caller.
    Interactive,
}

impl RunMode {
    pub fn as_str(&self) -> &'static str {
        match self {
            Self::Scheduled => "scheduled",
            Self::Interactive => "interactive",
        }
    }
}

#[derive(Debug, Clone, Serialize)]
pub struct SyncRunSummary {
    pub run_id: Uuid,
    pub mode: RunMode,
    pub started_at: DateTime<Utc>,
    pub finished_at: DateTime<Utc>,
    pub feed_sha256: String,
    /// `None` when the body could not be parsed at all.
    pub shape: Option<FeedShape>,
    pub created: usize,
    pub updated: usize,
    pub skipped: usize,
    pub failed: usize,
    pub outcomes: Vec<Outcome>,
    pub confirmations: Vec<String>,
}

impl SyncRunSummary {
    pub fn summary_line(&self) -> String {
        format!(
            "{} inserted, {} updated, {} skipped, {} failed",
            self.created, self.updated, self.skipped, self.failed
        )
    }
}

pub struct SyncPipeline {
    feed: Arc<dyn FeedSource>,
    store: Arc<dyn RecordStore>,
    settings: Arc<dyn SettingsStore>,
    // Held for a whole run so overlapping triggers cannot both create the same record.
    run_lock: Mutex<()>,
}

impl SyncPipeline {
    pub fn new(
        feed: Arc<dyn FeedSource>,
        store: Arc<dyn RecordStore>,
        settings: Arc<dyn SettingsStore>,
    ) -> Self {
        Self {
            feed,
            store,
            settings,
            run_lock: Mutex::new(()),
        }
    }

    pub fn settings(&self) -> &Arc<dyn SettingsStore> {
        &self.settings
    }

    pub async fn run_once(&self, mode: RunMode) -> Result<SyncRunSummary> {
        let _guard = self.run_lock.lock().await;
        let run_id = Uuid::new_v4();
        let span = info_span!("sync_run", %run_id, mode = mode.as_str());
        self.run_leased(run_id, mode).instrument(span).await
    }

    /// Other processes sharing the store are excluded for the whole run.
    async fn run_leased(&self, run_id: Uuid, mode: RunMode) -> Result<SyncRunSummary> {
        let lease = self
            .store
            .acquire_run_lease()
            .await
            .context("acquiring store run lease")?;
        let result = self.run_locked(run_id, mode).await;
        if let Err(err) = lease.release().await {
            warn!("releasing store run lease: {err}");
        }
        result
    }

    async fn run_locked(&self, run_id: Uuid, mode: RunMode) -> Result<SyncRunSummary> {
        let started_at = Utc::now();

        let settings = self.settings.load().await.context("loading settings")?;
        let tz = settings.parse_timezone()?;

        let feed = match self.feed.fetch(&settings.feed_url).await {
            Ok(feed) => feed,
            Err(err) => {
                error!(url = %settings.feed_url, "feed fetch failed, run aborted: {err}");
                return Err(err).context("fetching feed");
            }
        };

        let (shape, entries) = match normalize_feed(&feed.body, tz) {
            Ok(batch) => (Some(batch.shape), batch.entries),
            Err(err) => {
                warn!(sha256 = %feed.sha256, "no events found: {err}");
                (None, Vec::new())
            }
        };

        let reconciler = Reconciler::new(self.store.as_ref(), settings.default_category);
        let mut outcomes = Vec::with_capacity(entries.len());
        for entry in entries {
            let outcome = match entry {
                FeedEntry::Event(event) => reconciler.reconcile(&event).await,
                FeedEntry::Skipped(skip) => Outcome::Skipped {
                    title: skip.title,
                    reason: skip.reason,
                },
            };
            outcomes.push(outcome);
        }

        let mut summary = SyncRunSummary {
            run_id,
            mode,
            started_at,
            finished_at: Utc::now(),
            feed_sha256: feed.sha256,
            shape,
            created: 0,
            updated: 0,
            skipped: 0,
            failed: 0,
            confirmations: Vec::new(),
            outcomes: Vec::new(),
        };
        for outcome in &outcomes {
            match outcome {
                Outcome::Created { .. } => summary.created += 1,
                Outcome::Updated { .. } => summary.updated += 1,
                Outcome::Skipped { .. } => summary.skipped += 1,
                Outcome::Failed { .. } => summary.failed += 1,
            }
        }
        if mode == RunMode::Interactive {
            summary.confirmations = outcomes.iter().filter_map(Outcome::confirmation).collect();
        }
        summary.outcomes = outcomes;

        info!(
            created = summary.created,
            updated = summary.updated,
            skipped = summary.skipped,
            failed = summary.failed,
            "pull finished"
        );
        Ok(summary)
    }
}

/// Wire the production pipeline: HTTP feed, Postgres when `DATABASE_URL` is set
/// (in-memory otherwise), settings from the workspace root.
pub async fn pipeline_from_config(config: &SyncConfig) -> Result<SyncPipeline> {
    let feed = FeedFetcher::new(HttpClientConfig {
        timeout: Duration::from_secs(config.http_timeout_secs),
        user_agent: Some(config.user_agent.clone()),
    })?;

    let store: Arc<dyn RecordStore> = match &config.database_url {
        Some(url) => Arc::new(
            PgRecordStore::connect(url)
                .await
                .context("connecting to record store")?,
        ),
        None => {
            warn!("DATABASE_URL not set; records are kept in memory for this process only");
            Arc::new(MemoryRecordStore::new())
        }
    };

    let settings = YamlSettingsStore::from_workspace_root(&config.workspace_root);
    Ok(SyncPipeline::new(Arc::new(feed), store, Arc::new(settings)))
}

pub async fn run_sync_once_from_env(mode: RunMode) -> Result<SyncRunSummary> {
    let config = SyncConfig::from_env();
    let pipeline = pipeline_from_config(&config).await?;
    pipeline.run_once(mode).await
}

#[cfg(test)]
mod tests {
    use super::*;
    use async_trait::async_trait;
    use calpull_adapters::SkipReason;
    use calpull_core::{meta, LocalEventRecord, RecordFields, Settings};
    use calpull_storage::{FetchError, FetchedFeed, RunLease, StoreError};
    use serde_json::json;
    use std::sync::atomic::{AtomicUsize, Ordering};

    /// Serves a swappable body, optionally pausing so runs can overlap.
    struct ScriptedFeed {
        body: std::sync::Mutex<Vec<u8>>,
        delay: Duration,
        fetches: AtomicUsize,
        fail: bool,
    }

    impl ScriptedFeed {
        fn new(body: serde_json::Value) -> Self {
            Self {
                body: std::sync::Mutex::new(body.to_string().into_bytes()),
                delay: Duration::ZERO,
                fetches: AtomicUsize::new(0),
                fail: false,
            }
        }

        fn set(&self, body: serde_json::Value) {
            *self.body.lock().unwrap() = body.to_string().into_bytes();
        }

        fn set_raw(&self, body: &[u8]) {
            *self.body.lock().unwrap() = body.to_vec();
        }
    }

    #[async_trait]
    impl FeedSource for ScriptedFeed {
        async fn fetch(&self, url: &str) -> Result<FetchedFeed, FetchError> {
            self.fetches.fetch_add(1, Ordering::SeqCst);
            if self.fail {
                return Err(FetchError::HttpStatus {
                    status: 500,
                    url: url.to_string(),
                });
            }
            if !self.delay.is_zero() {
                tokio::time::sleep(self.delay).await;
            }
            let body = self.body.lock().unwrap().clone();
            Ok(FetchedFeed::new(Default::default(), url, body))
        }
    }

    fn book_sale_feed(title: &str) -> serde_json::Value {
        json!({"events": [{"event": {
            "title": title,
            "description_text": "Used books.",
            "localist_url": "https://calendar.example.edu/event/book_sale",
            "event_instances": [{"event_instance": {"id": 9001, "start": "2024-03-01T10:00:00"}}]
        }}]})
    }

    fn settings() -> Settings {
        Settings {
            feed_url: "https://calendar.example.edu/api/2/events".into(),
            timezone: "America/New_York".into(),
            ..Settings::default()
        }
    }

    fn pipeline_with(feed: Arc<ScriptedFeed>, store: Arc<MemoryRecordStore>) -> SyncPipeline {
        SyncPipeline::new(feed, store, Arc::new(InMemorySettings::new(settings())))
    }

    #[tokio::test]
    async fn book_sale_scenario_creates_then_updates_in_place() {
        let feed = Arc::new(ScriptedFeed::new(book_sale_feed("Book Sale")));
        let store = Arc::new(MemoryRecordStore::new());
        let pipeline = pipeline_with(feed.clone(), store.clone());

        let first = pipeline.run_once(RunMode::Interactive).await.unwrap();
        assert_eq!(first.created, 1);
        assert_eq!(first.confirmations, vec!["Book Sale: Inserted".to_string()]);

        let records = store.records().await;
        assert_eq!(records.len(), 1);
        let record = &records[0];
        let record_id = record.id;
        assert_eq!(record.meta(meta::EVENT_DATE), Some("20240301"));
        assert_eq!(record.meta(meta::EVENT_START_TIME), Some("10:00 AM"));
        assert_eq!(record.meta(meta::IS_EVENT), Some("1"));
        assert_eq!(record.meta(meta::CALENDAR_ID), Some("9001"));
        assert_eq!(record.meta(meta::EVENT_END_TIME), None);
        assert_eq!(record.meta(meta::CALENDAR_IMAGE), None);
        let metadata_before = record.metadata.clone();

        feed.set(book_sale_feed("Book Sale (Extended)"));
        let second = pipeline.run_once(RunMode::Interactive).await.unwrap();
        assert_eq!((second.created, second.updated), (0, 1));
        assert_eq!(second.confirmations, vec!["Book Sale (Extended): Updated".to_string()]);

        let records = store.records().await;
        assert_eq!(records.len(), 1);
        assert_eq!(records[0].id, record_id);
        assert_eq!(records[0].title, "Book Sale (Extended)");
        assert_eq!(records[0].metadata, metadata_before);
    }

    #[tokio::test]
    async fn repeated_runs_on_an_unchanged_feed_are_idempotent() {
        let feed = Arc::new(ScriptedFeed::new(json!({"events": [
            {"event": {"title": "Story Time", "event_instances": [{"event_instance": {"id": 1, "start": "2024-04-02T09:30:00", "end": "2024-04-02T10:15:00"}}]}},
            {"event": {"title": "Story Time", "event_instances": [{"event_instance": {"id": 2, "start": "2024-04-09T09:30:00"}}]}}
        ]})));
        let store = Arc::new(MemoryRecordStore::new());
        let pipeline = pipeline_with(feed, store.clone());

        pipeline.run_once(RunMode::Scheduled).await.unwrap();
        let after_first = store.records().await;
        for _ in 0..3 {
            let summary = pipeline.run_once(RunMode::Scheduled).await.unwrap();
            assert_eq!((summary.created, summary.updated), (0, 2));
        }
        let after_many = store.records().await;

        assert_eq!(after_first.len(), 2);
        assert_eq!(after_many.len(), 2);
        for (a, b) in after_first.iter().zip(&after_many) {
            assert_eq!(a.id, b.id);
            assert_eq!(a.title, b.title);
            assert_eq!(a.metadata, b.metadata);
        }
    }

    #[tokio::test]
    async fn scheduled_runs_collect_no_confirmations() {
        let feed = Arc::new(ScriptedFeed::new(book_sale_feed("Book Sale")));
        let pipeline = pipeline_with(feed, Arc::new(MemoryRecordStore::new()));
        let summary = pipeline.run_once(RunMode::Scheduled).await.unwrap();
        assert_eq!(summary.created, 1);
        assert!(summary.confirmations.is_empty());
    }

    #[tokio::test]
    async fn fetch_failure_aborts_before_touching_the_store() {
        let mut scripted = ScriptedFeed::new(book_sale_feed("Book Sale"));
        scripted.fail = true;
        let store = Arc::new(MemoryRecordStore::new());
        let pipeline = pipeline_with(Arc::new(scripted), store.clone());

        let err = pipeline.run_once(RunMode::Interactive).await.unwrap_err();
        assert!(format!("{err:#}").contains("http status 500"));
        assert!(store.records().await.is_empty());
    }

    #[tokio::test]
    async fn unparseable_body_is_an_empty_run() {
        let feed = Arc::new(ScriptedFeed::new(json!({})));
        feed.set_raw(b"<html>maintenance</html>");
        let pipeline = pipeline_with(feed, Arc::new(MemoryRecordStore::new()));
        let summary = pipeline.run_once(RunMode::Interactive).await.unwrap();
        assert_eq!(summary.shape, None);
        assert!(summary.outcomes.is_empty());
    }

    #[tokio::test]
    async fn invalid_timezone_aborts_the_run() {
        let feed = Arc::new(ScriptedFeed::new(book_sale_feed("Book Sale")));
        let bad = Settings {
            timezone: "Nowhere/Special".into(),
            ..settings()
        };
        let pipeline = SyncPipeline::new(
            feed.clone(),
            Arc::new(MemoryRecordStore::new()),
            Arc::new(InMemorySettings::new(bad)),
        );
        assert!(pipeline.run_once(RunMode::Scheduled).await.is_err());
        assert_eq!(feed.fetches.load(Ordering::SeqCst), 0);
    }

    #[tokio::test]
    async fn skipped_and_failed_events_are_counted_and_confirmed() {
        let feed = Arc::new(ScriptedFeed::new(json!({"events": [
            {"event": {"title": "Pending Talk", "event_instances": []}},
            {"event": {"title": "Book Sale", "event_instances": [{"event_instance": {"id": 9001, "start": "2024-03-01T10:00:00"}}]}}
        ]})));
        let store = Arc::new(MemoryRecordStore::new());
        store.reject_writes(Some(vec!["store offline".into()])).await;
        let pipeline = pipeline_with(feed, store.clone());

        let summary = pipeline.run_once(RunMode::Interactive).await.unwrap();
        assert_eq!((summary.skipped, summary.failed), (1, 1));
        assert_eq!(
            summary.confirmations,
            vec![
                "Pending Talk: Skipped (missing event instance)".to_string(),
                "Book Sale: Failed".to_string(),
            ]
        );
        assert!(matches!(
            summary.outcomes[0],
            Outcome::Skipped {
                reason: SkipReason::MissingInstance,
                ..
            }
        ));
        assert!(store.records().await.is_empty());
    }

    #[tokio::test]
    async fn confirmations_follow_feed_order() {
        let feed = Arc::new(ScriptedFeed::new(json!({"events": [
            {"event": {"title": "Book Sale", "event_instances": [{"event_instance": {"id": 9001, "start": "2024-03-01T10:00:00"}}]}},
            {"event": {"title": "Pending Talk", "event_instances": []}},
            {"event": {"title": "Lecture", "event_instances": [{"event_instance": {"id": 9002, "start": "2024-03-02T18:00:00"}}]}}
        ]})));
        let pipeline = pipeline_with(feed, Arc::new(MemoryRecordStore::new()));

        let summary = pipeline.run_once(RunMode::Interactive).await.unwrap();
        assert_eq!(
            summary.confirmations,
            vec![
                "Book Sale: Inserted".to_string(),
                "Pending Talk: Skipped (missing event instance)".to_string(),
                "Lecture: Inserted".to_string(),
            ]
        );
    }

    /// Memory store that counts run leases and can refuse them.
    struct LeasedStore {
        inner: MemoryRecordStore,
        leases: AtomicUsize,
        refuse: bool,
    }

    #[async_trait]
    impl RecordStore for LeasedStore {
        async fn create_record(&self, fields: &RecordFields, external_id: &str) -> Result<i64, StoreError> {
            self.inner.create_record(fields, external_id).await
        }
        async fn update_record(&self, id: i64, fields: &RecordFields) -> Result<i64, StoreError> {
            self.inner.update_record(id, fields).await
        }
        async fn query_by_metadata(&self, key: &str, value: &str) -> Result<Vec<LocalEventRecord>, StoreError> {
            self.inner.query_by_metadata(key, value).await
        }
        async fn get_record(&self, id: i64) -> Result<Option<LocalEventRecord>, StoreError> {
            self.inner.get_record(id).await
        }
        async fn get_metadata(&self, id: i64, key: &str) -> Result<Option<String>, StoreError> {
            self.inner.get_metadata(id, key).await
        }
        async fn add_metadata(&self, id: i64, key: &str, value: &str) -> Result<(), StoreError> {
            self.inner.add_metadata(id, key, value).await
        }
        async fn update_metadata(&self, id: i64, key: &str, value: &str) -> Result<(), StoreError> {
            self.inner.update_metadata(id, key, value).await
        }
        async fn remove_metadata(&self, id: i64, key: &str) -> Result<(), StoreError> {
            self.inner.remove_metadata(id, key).await
        }
        async fn acquire_run_lease(&self) -> Result<RunLease, StoreError> {
            if self.refuse {
                return Err(StoreError::Database("lock timeout".into()));
            }
            self.leases.fetch_add(1, Ordering::SeqCst);
            Ok(RunLease::process_local())
        }
    }

    #[tokio::test]
    async fn every_run_holds_the_store_lease() {
        let feed = Arc::new(ScriptedFeed::new(book_sale_feed("Book Sale")));
        let store = Arc::new(LeasedStore {
            inner: MemoryRecordStore::new(),
            leases: AtomicUsize::new(0),
            refuse: false,
        });
        let pipeline = SyncPipeline::new(feed, store.clone(), Arc::new(InMemorySettings::new(settings())));
        pipeline.run_once(RunMode::Scheduled).await.unwrap();
        pipeline.run_once(RunMode::Scheduled).await.unwrap();
        assert_eq!(store.leases.load(Ordering::SeqCst), 2);
    }

    #[tokio::test]
    async fn unavailable_store_lease_aborts_before_fetching() {
        let feed = Arc::new(ScriptedFeed::new(book_sale_feed("Book Sale")));
        let store = Arc::new(LeasedStore {
            inner: MemoryRecordStore::new(),
            leases: AtomicUsize::new(0),
            refuse: true,
        });
        let pipeline = SyncPipeline::new(feed.clone(), store.clone(), Arc::new(InMemorySettings::new(settings())));

        let err = pipeline.run_once(RunMode::Interactive).await.unwrap_err();
        assert!(format!("{err:#}").contains("acquiring store run lease"));
        assert_eq!(feed.fetches.load(Ordering::SeqCst), 0);
        assert!(store.inner.records().await.is_empty());
    }

    #[tokio::test(flavor = "multi_thread", worker_threads = 2)]
    async fn overlapping_runs_never_duplicate_a_record() {
        let mut scripted = ScriptedFeed::new(book_sale_feed("Book Sale"));
        scripted.delay = Duration::from_millis(25);
        let store = Arc::new(MemoryRecordStore::new());
        let pipeline = Arc::new(pipeline_with(Arc::new(scripted), store.clone()));

        let a = tokio::spawn({
            let pipeline = pipeline.clone();
            async move { pipeline.run_once(RunMode::Scheduled).await }
        });
        let b = tokio::spawn({
            let pipeline = pipeline.clone();
            async move { pipeline.run_once(RunMode::Interactive).await }
        });
        let a = a.await.unwrap().unwrap();
        let b = b.await.unwrap().unwrap();

        assert_eq!(a.created + b.created, 1);
        assert_eq!(a.updated + b.updated, 1);
        assert_eq!(store.records().await.len(), 1);
    }
}
