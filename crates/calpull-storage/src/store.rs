use std::collections::BTreeMap;

use async_trait::async_trait;
use calpull_core::{meta, LocalEventRecord, RecordFields, RecordStatus};
use chrono::{Duration, Utc};
use sqlx::{Postgres, Transaction};
use thiserror::Error;
use tokio::sync::Mutex;

#[derive(Debug, Clone, PartialEq, Eq, Error)]
pub enum StoreError {
    /// The host refused the write; it may report several reasons at once.
    #[error("record rejected: {}", messages.join("; "))]
    Rejected { messages: Vec<String> },
    #[error("record {0} not found")]
    NotFound(i64),
    #[error("store backend error: {0}")]
    Database(String),
}

impl StoreError {
    pub fn messages(&self) -> Vec<String> {
        match self {
            Self::Rejected { messages } => messages.clone(),
            other => vec![other.to_string()],
        }
    }
}

/// Exclusive claim on the store for one pull run, shared by every process using it.
///
/// Dropping a held lease without [`RunLease::release`] still frees it: the backing
/// transaction rolls back when its connection is returned to the pool.
pub struct RunLease {
    tx: Option<Transaction<'static, Postgres>>,
}

impl RunLease {
    /// No cross-process claim; the pipeline's own lock is the only exclusion.
    pub fn process_local() -> Self {
        Self { tx: None }
    }

    pub(crate) fn held(tx: Transaction<'static, Postgres>) -> Self {
        Self { tx: Some(tx) }
    }

    pub fn is_shared(&self) -> bool {
        self.tx.is_some()
    }

    pub async fn release(self) -> Result<(), StoreError> {
        if let Some(tx) = self.tx {
            tx.commit().await?;
        }
        Ok(())
    }
}

/// Narrow view of the host content store used by the reconciler.
#[async_trait]
pub trait RecordStore: Send + Sync {
    /// Insert a record together with its `calendar_id`, so a record never exists
    /// without the key that later pulls match it by.
    async fn create_record(&self, fields: &RecordFields, external_id: &str) -> Result<i64, StoreError>;
    async fn update_record(&self, id: i64, fields: &RecordFields) -> Result<i64, StoreError>;

    /// Published records whose `key` metadata equals `value`, most recently modified first.
    async fn query_by_metadata(&self, key: &str, value: &str) -> Result<Vec<LocalEventRecord>, StoreError>;

    async fn get_record(&self, id: i64) -> Result<Option<LocalEventRecord>, StoreError>;
    async fn get_metadata(&self, id: i64, key: &str) -> Result<Option<String>, StoreError>;
    async fn add_metadata(&self, id: i64, key: &str, value: &str) -> Result<(), StoreError>;
    async fn update_metadata(&self, id: i64, key: &str, value: &str) -> Result<(), StoreError>;
    async fn remove_metadata(&self, id: i64, key: &str) -> Result<(), StoreError>;

    /// Blocks until no other run holds the store.
    async fn acquire_run_lease(&self) -> Result<RunLease, StoreError> {
        Ok(RunLease::process_local())
    }
}

pub(crate) fn validate_fields(fields: &RecordFields) -> Result<(), StoreError> {
    if fields.title.trim().is_empty() && fields.description.trim().is_empty() {
        return Err(StoreError::Rejected {
            messages: vec!["Content and title are empty.".to_string()],
        });
    }
    Ok(())
}

#[derive(Debug, Default)]
struct MemoryState {
    next_id: i64,
    tick: i64,
    records: BTreeMap<i64, LocalEventRecord>,
    reject_writes: Option<Vec<String>>,
}

/// In-process store. Used for dry runs and as the test double for the host store.
#[derive(Debug, Default)]
pub struct MemoryRecordStore {
    state: Mutex<MemoryState>,
}

impl MemoryRecordStore {
    pub fn new() -> Self {
        Self::default()
    }

    /// Make every subsequent create/update fail with `messages`; `None` restores normal behaviour.
    pub async fn reject_writes(&self, messages: Option<Vec<String>>) {
        self.state.lock().await.reject_writes = messages;
    }

    pub async fn records(&self) -> Vec<LocalEventRecord> {
        self.state.lock().await.records.values().cloned().collect()
    }
}

impl MemoryState {
    fn stamp(&mut self) -> chrono::DateTime<Utc> {
        // Monotonic even when two writes land within the same clock tick.
        self.tick += 1;
        Utc::now() + Duration::microseconds(self.tick)
    }

    fn check_writable(&self) -> Result<(), StoreError> {
        match &self.reject_writes {
            Some(messages) => Err(StoreError::Rejected {
                messages: messages.clone(),
            }),
            None => Ok(()),
        }
    }

    fn record_mut(&mut self, id: i64) -> Result<&mut LocalEventRecord, StoreError> {
        self.records.get_mut(&id).ok_or(StoreError::NotFound(id))
    }
}

#[async_trait]
impl RecordStore for MemoryRecordStore {
    async fn create_record(&self, fields: &RecordFields, external_id: &str) -> Result<i64, StoreError> {
        let mut state = self.state.lock().await;
        state.check_writable()?;
        validate_fields(fields)?;

        state.next_id += 1;
        let id = state.next_id;
        let modified_at = state.stamp();
        state.records.insert(
            id,
            LocalEventRecord {
                id,
                title: fields.title.clone(),
                description: fields.description.clone(),
                slug: fields.slug.clone().unwrap_or_default(),
                category: fields.category.unwrap_or(calpull_core::DEFAULT_CATEGORY),
                status: fields.status,
                comments_open: fields.comments_open,
                pings_open: fields.pings_open,
                modified_at,
                metadata: BTreeMap::from([(meta::CALENDAR_ID.to_string(), external_id.to_string())]),
            },
        );
        Ok(id)
    }

    async fn update_record(&self, id: i64, fields: &RecordFields) -> Result<i64, StoreError> {
        let mut state = self.state.lock().await;
        state.check_writable()?;
        validate_fields(fields)?;

        let modified_at = state.stamp();
        let record = state.record_mut(id)?;
        record.title = fields.title.clone();
        record.description = fields.description.clone();
        if let Some(slug) = &fields.slug {
            record.slug = slug.clone();
        }
        if let Some(category) = fields.category {
            record.category = category;
        }
        record.status = fields.status;
        record.comments_open = fields.comments_open;
        record.pings_open = fields.pings_open;
        record.modified_at = modified_at;
        Ok(id)
    }

    async fn query_by_metadata(&self, key: &str, value: &str) -> Result<Vec<LocalEventRecord>, StoreError> {
        let state = self.state.lock().await;
        let mut matches = state
            .records
            .values()
            .filter(|r| r.status == RecordStatus::Publish && r.meta(key) == Some(value))
            .cloned()
            .collect::<Vec<_>>();
        matches.sort_by(|a, b| b.modified_at.cmp(&a.modified_at).then(b.id.cmp(&a.id)));
        Ok(matches)
    }

    async fn get_record(&self, id: i64) -> Result<Option<LocalEventRecord>, StoreError> {
        Ok(self.state.lock().await.records.get(&id).cloned())
    }

    async fn get_metadata(&self, id: i64, key: &str) -> Result<Option<String>, StoreError> {
        let state = self.state.lock().await;
        let record = state.records.get(&id).ok_or(StoreError::NotFound(id))?;
        Ok(record.metadata.get(key).cloned())
    }

    async fn add_metadata(&self, id: i64, key: &str, value: &str) -> Result<(), StoreError> {
        let mut state = self.state.lock().await;
        let record = state.record_mut(id)?;
        if record.metadata.contains_key(key) {
            return Err(StoreError::Database(format!(
                "metadata {key} already present on record {id}"
            )));
        }
        record.metadata.insert(key.to_string(), value.to_string());
        Ok(())
    }

    async fn update_metadata(&self, id: i64, key: &str, value: &str) -> Result<(), StoreError> {
        let mut state = self.state.lock().await;
        let record = state.record_mut(id)?;
        record.metadata.insert(key.to_string(), value.to_string());
        Ok(())
    }

    async fn remove_metadata(&self, id: i64, key: &str) -> Result<(), StoreError> {
        let mut state = self.state.lock().await;
        let record = state.record_mut(id)?;
        record.metadata.remove(key);
        Ok(())
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    fn fields(title: &str) -> RecordFields {
        RecordFields {
            title: title.to_string(),
            description: String::new(),
            slug: Some(title.replace(' ', "-")),
            category: Some(43),
            status: RecordStatus::Publish,
            comments_open: false,
            pings_open: false,
        }
    }

    #[tokio::test]
    async fn query_returns_most_recently_modified_first() {
        let store = MemoryRecordStore::new();
        let a = store.create_record(&fields("First"), "7").await.unwrap();
        let b = store.create_record(&fields("Second"), "7").await.unwrap();
        store.update_record(a, &fields("First again")).await.unwrap();

        let hits = store.query_by_metadata("calendar_id", "7").await.unwrap();
        assert_eq!(hits.iter().map(|r| r.id).collect::<Vec<_>>(), vec![a, b]);
        assert!(store.query_by_metadata("calendar_id", "8").await.unwrap().is_empty());
    }

    #[tokio::test]
    async fn created_records_carry_their_external_id() {
        let store = MemoryRecordStore::new();
        let id = store.create_record(&fields("Talk"), "9001").await.unwrap();
        assert_eq!(store.get_metadata(id, meta::CALENDAR_ID).await.unwrap().as_deref(), Some("9001"));
        assert!(store.add_metadata(id, meta::CALENDAR_ID, "9001").await.is_err());

        let lease = store.acquire_run_lease().await.unwrap();
        assert!(!lease.is_shared());
        lease.release().await.unwrap();
    }

    #[tokio::test]
    async fn drafts_are_not_matched() {
        let store = MemoryRecordStore::new();
        let mut draft = fields("Hidden");
        draft.status = RecordStatus::Draft;
        store.create_record(&draft, "1").await.unwrap();
        assert!(store.query_by_metadata("calendar_id", "1").await.unwrap().is_empty());
    }

    #[tokio::test]
    async fn empty_title_and_description_is_rejected() {
        let store = MemoryRecordStore::new();
        let err = store.create_record(&fields(""), "1").await.unwrap_err();
        assert_eq!(err.messages(), vec!["Content and title are empty.".to_string()]);
        assert!(store.records().await.is_empty());
    }

    #[tokio::test]
    async fn rejected_writes_report_every_message() {
        let store = MemoryRecordStore::new();
        store
            .reject_writes(Some(vec!["db locked".into(), "try later".into()]))
            .await;
        let err = store.create_record(&fields("Talk"), "1").await.unwrap_err();
        assert_eq!(err.messages().len(), 2);
        store.reject_writes(None).await;
        assert!(store.create_record(&fields("Talk"), "1").await.is_ok());
    }

    #[tokio::test]
    async fn add_metadata_refuses_to_duplicate_a_key() {
        let store = MemoryRecordStore::new();
        let id = store.create_record(&fields("Talk"), "1").await.unwrap();
        store.add_metadata(id, "is_event", "1").await.unwrap();
        assert!(store.add_metadata(id, "is_event", "1").await.is_err());
        store.update_metadata(id, "is_event", "0").await.unwrap();
        assert_eq!(store.get_metadata(id, "is_event").await.unwrap().as_deref(), Some("0"));
        store.remove_metadata(id, "is_event").await.unwrap();
        assert_eq!(store.get_metadata(id, "is_event").await.unwrap(), None);
    }
}
