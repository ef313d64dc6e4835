use calpull_adapters::SkipReason;
use calpull_core::{meta, NormalizedEvent, RecordFields};
use calpull_storage::{RecordStore, StoreError};
use serde::Serialize;
use tracing::{error, info};

use crate::matcher::find_by_external_id;

/// Result of pushing one candidate event into the store.
#[derive(Debug, Clone, PartialEq, Eq, Serialize)]
#[serde(tag = "outcome", rename_all = "snake_case")]
pub enum Outcome {
    Created { record_id: i64, title: String },
    Updated { record_id: i64, title: String },
    Skipped { title: Option<String>, reason: SkipReason },
    Failed { title: String, messages: Vec<String> },
}

impl Outcome {
    /// Line shown to an operator who triggered the run by hand.
    pub fn confirmation(&self) -> Option<String> {
        match self {
            Self::Created { title, .. } => Some(format!("{title}: Inserted")),
            Self::Updated { title, .. } => Some(format!("{title}: Updated")),
            Self::Skipped {
                title: Some(title),
                reason,
            } => Some(format!("{title}: Skipped ({reason})")),
            Self::Skipped { title: None, .. } => None,
            Self::Failed { title, .. } => Some(format!("{title}: Failed")),
        }
    }
}

#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum MetaWrite {
    Removed,
    Added,
    Updated,
}

/// Write one metadata field: blank removes it, absent adds it, present overwrites it.
pub async fn upsert_meta(
    store: &dyn RecordStore,
    record_id: i64,
    key: &str,
    value: &str,
) -> Result<MetaWrite, StoreError> {
    if value.trim().is_empty() {
        store.remove_metadata(record_id, key).await?;
        return Ok(MetaWrite::Removed);
    }
    match store.get_metadata(record_id, key).await? {
        None => {
            store.add_metadata(record_id, key, value).await?;
            Ok(MetaWrite::Added)
        }
        Some(_) => {
            store.update_metadata(record_id, key, value).await?;
            Ok(MetaWrite::Updated)
        }
    }
}

/// Metadata derived from an event, in write order. `event_end_time` is only present
/// when the event has an end, so a missing end never touches a stored value.
pub fn event_metadata(event: &NormalizedEvent) -> Vec<(&'static str, String)> {
    let mut fields = vec![
        (meta::EVENT_DATE, event.event_date()),
        (meta::EVENT_START_TIME, event.event_start_time()),
    ];
    if let Some(end_time) = event.event_end_time() {
        fields.push((meta::EVENT_END_TIME, end_time));
    }
    fields.extend([
        (meta::IS_EVENT, "1".to_string()),
        (meta::CALENDAR_URL, event.detail_url.clone().unwrap_or_default()),
        (meta::CALENDAR_ID, event.external_id.clone()),
        (meta::CALENDAR_IMAGE, event.image_url.clone().unwrap_or_default()),
    ]);
    fields
}

pub struct Reconciler<'a> {
    store: &'a dyn RecordStore,
    default_category: i64,
}

impl<'a> Reconciler<'a> {
    pub fn new(store: &'a dyn RecordStore, default_category: i64) -> Self {
        Self {
            store,
            default_category,
        }
    }

    pub async fn reconcile(&self, event: &NormalizedEvent) -> Outcome {
        if event.external_id.trim().is_empty() {
            return Outcome::Skipped {
                title: Some(event.title.clone()),
                reason: SkipReason::MissingExternalId,
            };
        }

        let existing = match find_by_external_id(self.store, &event.external_id).await {
            Ok(existing) => existing,
            Err(err) => return self.failed(event, err),
        };

        let (record_id, created) = match existing {
            Some(record) => {
                match self
                    .store
                    .update_record(record.id, &RecordFields::for_update(event))
                    .await
                {
                    Ok(id) => (id, false),
                    Err(err) => return self.failed(event, err),
                }
            }
            None => {
                match self
                    .store
                    .create_record(
                        &RecordFields::for_create(event, self.default_category),
                        &event.external_id,
                    )
                    .await
                {
                    Ok(id) => (id, true),
                    Err(err) => return self.failed(event, err),
                }
            }
        };

        for (key, value) in event_metadata(event) {
            if let Err(err) = upsert_meta(self.store, record_id, key, &value).await {
                return self.failed(event, err);
            }
        }

        let outcome = if created {
            Outcome::Created {
                record_id,
                title: event.title.clone(),
            }
        } else {
            Outcome::Updated {
                record_id,
                title: event.title.clone(),
            }
        };
        if let Some(line) = outcome.confirmation() {
            info!(record_id, external_id = %event.external_id, "{line}");
        }
        outcome
    }

    fn failed(&self, event: &NormalizedEvent, err: StoreError) -> Outcome {
        let messages = err.messages();
        for message in &messages {
            error!(title = %event.title, external_id = %event.external_id, "{message}");
        }
        Outcome::Failed {
            title: event.title.clone(),
            messages,
        }
    }
}
