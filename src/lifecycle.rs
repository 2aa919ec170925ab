//! Keeps records and the blobs they own consistent.
//!
//! Blob writes always happen before the record points at them and blob
//! deletes always happen after the record stopped pointing at them, so a
//! crash between steps can leave an orphaned blob but never a dangling
//! reference.

use std::{collections::BTreeMap, sync::Arc};

use blob_store::{BlobError, BlobStore};
use data_model::{
    blob_key,
    get_epoch_time_in_ms,
    AttachmentRecord,
    NewRecord,
    RecordId,
    Upload,
};
use futures::future::join_all;
use tracing::{debug, error, info, warn};

use crate::{error::LifecycleError, state_store::RecordStore};

pub struct AttachmentLifecycleManager {
    blob_store: Arc<dyn BlobStore>,
    records: Arc<dyn RecordStore>,
}

impl AttachmentLifecycleManager {
    pub fn new(blob_store: Arc<dyn BlobStore>, records: Arc<dyn RecordStore>) -> Self {
        Self {
            blob_store,
            records,
        }
    }

    /// Writes the content of every field, then inserts the record.
    ///
    /// On any failure the blobs written so far are deleted before
    /// `PartialWriteFailure` is returned.
    pub async fn on_create(
        &self,
        new_record: NewRecord,
    ) -> Result<AttachmentRecord, LifecycleError> {
        let kind = new_record.kind;
        if let Some(field) = new_record.files.keys().find(|f| !kind.has_field(f)) {
            return Err(LifecycleError::UnknownField {
                kind,
                field: field.clone(),
            });
        }

        let id = new_record.id.unwrap_or_else(RecordId::generate);
        let created_at = new_record.created_at.unwrap_or_else(get_epoch_time_in_ms);
        let mut record = AttachmentRecord::new(id, kind, created_at);

        let mut written = Vec::with_capacity(new_record.files.len());
        for (field, upload) in new_record.files {
            let key = blob_key(kind, &field, &record.id, &upload.filename);
            match self.blob_store.put(&key, upload.content).await {
                Ok(blob) => {
                    written.push(blob.key.clone());
                    record.fields.insert(field, Some(blob));
                }
                Err(err) => {
                    // An unavailable put may still have landed.
                    if err.is_retryable() {
                        written.push(key);
                    }
                    return Err(self
                        .roll_back(&record.id, Some(field), err.into(), written)
                        .await);
                }
            }
        }

        if let Err(err) = self.records.insert(record.clone()).await {
            return Err(self.roll_back(&record.id, None, err, written).await);
        }

        info!(
            record_id = %record.id,
            kind = %kind,
            blobs = written.len(),
            "created record"
        );
        Ok(record)
    }

    /// Replaces the content of one field, or clears it when `new_content` is
    /// `None`.
    ///
    /// Order is write new blob, swap the reference, delete the old blob. If
    /// the old blob can't be deleted it goes to the orphan ledger and the
    /// update still succeeds.
    pub async fn on_update(
        &self,
        id: &RecordId,
        field: &str,
        new_content: Option<Upload>,
    ) -> Result<AttachmentRecord, LifecycleError> {
        let record = self.get_record(id).await?;
        if record.tombstoned {
            return Err(LifecycleError::RecordTombstoned(id.clone()));
        }
        if !record.kind.has_field(field) {
            return Err(LifecycleError::UnknownField {
                kind: record.kind,
                field: field.to_string(),
            });
        }
        let old_blob = record.field(field).cloned();

        let new_blob = match new_content {
            Some(upload) => {
                let key = blob_key(record.kind, field, id, &upload.filename);
                match self.blob_store.put(&key, upload.content).await {
                    Ok(blob) => Some(blob),
                    Err(err) => {
                        if err.is_retryable() {
                            self.discard_uncertain_write(id, &key).await;
                        }
                        return Err(err.into());
                    }
                }
            }
            None => None,
        };

        let updated = match self.records.set_field(id, field, new_blob.clone()).await {
            Ok(updated) => updated,
            Err(err) => {
                let written = new_blob.into_iter().map(|b| b.key).collect();
                return Err(self
                    .roll_back(id, Some(field.to_string()), err, written)
                    .await);
            }
        };

        if let Some(old_blob) = old_blob {
            let replaced = new_blob.as_ref().is_none_or(|new| new.key != old_blob.key);
            if replaced {
                if let Err(err) = self.blob_store.delete(&old_blob.key).await {
                    warn!(
                        record_id = %id,
                        field,
                        key = %old_blob.key,
                        "failed to delete replaced blob, deferring: {:?}",
                        err
                    );
                    self.defer_cleanup(vec![old_blob.key]).await;
                }
            }
        }

        debug!(record_id = %id, field, "updated record field");
        Ok(updated)
    }

    /// Deletes every blob of the record, then the record.
    ///
    /// If any blob can't be deleted the record is kept with only the
    /// undeleted references, tombstoned, and `PartialDeleteFailure` is
    /// returned so the delete can be retried.
    pub async fn on_delete(&self, id: &RecordId) -> Result<(), LifecycleError> {
        let mut record = self.get_record(id).await?;
        let keys = record.keys();

        let results = join_all(keys.iter().map(|key| async move {
            (key.clone(), self.blob_store.delete(key).await)
        }))
        .await;
        let failed: BTreeMap<String, BlobError> = results
            .into_iter()
            .filter_map(|(key, result)| result.err().map(|err| (key, err)))
            .collect();

        if failed.is_empty() {
            self.records.remove(id).await?;
            info!(record_id = %id, blobs = keys.len(), "deleted record");
            return Ok(());
        }

        let undeleted = failed.keys().cloned().collect();
        record.retain_keys(&undeleted);
        record.tombstoned = true;
        self.records.replace(record).await?;
        warn!(
            record_id = %id,
            failed = failed.len(),
            "record delete incomplete, record tombstoned"
        );
        Err(LifecycleError::PartialDeleteFailure {
            record_id: id.clone(),
            failed,
        })
    }

    async fn get_record(&self, id: &RecordId) -> Result<AttachmentRecord, LifecycleError> {
        self.records
            .get(id)
            .await?
            .ok_or_else(|| LifecycleError::RecordNotFound(id.clone()))
    }

    async fn roll_back(
        &self,
        id: &RecordId,
        field: Option<String>,
        source: anyhow::Error,
        written: Vec<String>,
    ) -> LifecycleError {
        let mut rolled_back = Vec::with_capacity(written.len());
        let mut rollback_failures = BTreeMap::new();
        for key in written {
            match self.blob_store.delete(&key).await {
                Ok(()) => rolled_back.push(key),
                Err(err) => {
                    error!(record_id = %id, key = %key, "rollback failed: {:?}", err);
                    rollback_failures.insert(key, err);
                }
            }
        }
        self.defer_cleanup(rollback_failures.keys().cloned().collect())
            .await;
        warn!(
            record_id = %id,
            field = field.as_deref().unwrap_or_default(),
            rolled_back = rolled_back.len(),
            "write failed, rolled back: {:?}",
            source
        );
        LifecycleError::PartialWriteFailure {
            record_id: id.clone(),
            field,
            source,
            rolled_back,
            rollback_failures,
        }
    }

    /// Removes a blob whose put failed without a known outcome. The record
    /// never referenced it, so a failed delete leaves it to the reaper.
    async fn discard_uncertain_write(&self, id: &RecordId, key: &str) {
        if let Err(err) = self.blob_store.delete(key).await {
            warn!(record_id = %id, key, "can't discard failed write, deferring: {:?}", err);
            self.defer_cleanup(vec![key.to_string()]).await;
        }
    }

    async fn defer_cleanup(&self, keys: Vec<String>) {
        if keys.is_empty() {
            return;
        }
        if let Err(err) = self.records.add_orphans(keys.clone()).await {
            error!(?keys, "failed to record orphaned blobs: {:?}", err);
        }
    }
}
