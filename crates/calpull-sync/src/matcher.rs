use calpull_core::{meta, LocalEventRecord};
use calpull_storage::{RecordStore, StoreError};
use tracing::warn;

/// The published record carrying `external_id` as its `calendar_id`, if any.
///
/// Several hits mean an earlier run raced or someone hand-edited metadata; the most
/// recently modified record wins and the collision is logged.
pub async fn find_by_external_id(
    store: &dyn RecordStore,
    external_id: &str,
) -> Result<Option<LocalEventRecord>, StoreError> {
    let matches = store.query_by_metadata(meta::CALENDAR_ID, external_id).await?;
    if matches.len() > 1 {
        warn!(
            external_id,
            count = matches.len(),
            kept_record_id = matches[0].id,
            "multiple records share one external id"
        );
    }
    Ok(matches.into_iter().next())
}
