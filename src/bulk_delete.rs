use std::{
    collections::{BTreeMap, BTreeSet},
    sync::Arc,
};

use anyhow::anyhow;
use blob_store::{BlobError, BlobStore};
use data_model::{AttachmentRecord, RecordId};
use tracing::{info, warn};

use crate::{error::LifecycleError, state_store::RecordStore};

#[derive(Debug)]
pub struct RecordDeleteFailure {
    pub record_id: RecordId,
    pub failed: BTreeMap<String, BlobError>,
}

#[derive(Debug, Default)]
pub struct BulkDeleteReport {
    pub deleted: Vec<RecordId>,
    /// Records that keep (only) the references whose blobs failed to delete.
    pub partial_failures: Vec<RecordDeleteFailure>,
    /// Ids that had no record, only set by `bulk_delete_ids`.
    pub missing: Vec<RecordId>,
}

impl BulkDeleteReport {
    pub fn is_complete(&self) -> bool {
        self.partial_failures.is_empty()
    }

    pub fn failed_keys(&self) -> BTreeSet<String> {
        self.partial_failures
            .iter()
            .flat_map(|f| f.failed.keys().cloned())
            .collect()
    }
}

/// Deletes many records with a single blob store round trip.
pub struct BulkDeleter {
    blob_store: Arc<dyn BlobStore>,
    records: Arc<dyn RecordStore>,
}

impl BulkDeleter {
    pub fn new(blob_store: Arc<dyn BlobStore>, records: Arc<dyn RecordStore>) -> Self {
        Self {
            blob_store,
            records,
        }
    }

    pub async fn bulk_delete(
        &self,
        records: &[AttachmentRecord],
    ) -> Result<BulkDeleteReport, LifecycleError> {
        let keys: BTreeSet<String> = records.iter().flat_map(|r| r.keys()).collect();
        let outcome = if keys.is_empty() {
            Default::default()
        } else {
            self.blob_store.bulk_delete(&keys).await
        };
        let failed_keys: BTreeSet<String> = outcome.failed.keys().cloned().collect();
        let mut failures = outcome.failed;

        let mut report = BulkDeleteReport::default();
        for record in records {
            let record_failures: BTreeMap<String, BlobError> = record
                .keys()
                .into_iter()
                .filter(|key| failed_keys.contains(key))
                .map(|key| {
                    // Errors aren't cloneable, a key shared by two records
                    // reports the original error once.
                    let err = failures.remove(&key).unwrap_or_else(|| {
                        BlobError::unavailable(&key, anyhow!("delete failed for shared key"))
                    });
                    (key, err)
                })
                .collect();

            if record_failures.is_empty() {
                self.records.remove(&record.id).await?;
                report.deleted.push(record.id.clone());
                continue;
            }

            let mut remaining = record.clone();
            remaining.retain_keys(&record_failures.keys().cloned().collect());
            remaining.tombstoned = true;
            self.records.replace(remaining).await?;
            report.partial_failures.push(RecordDeleteFailure {
                record_id: record.id.clone(),
                failed: record_failures,
            });
        }

        if report.is_complete() {
            info!(
                records = report.deleted.len(),
                keys = keys.len(),
                "bulk deleted records"
            );
        } else {
            warn!(
                deleted = report.deleted.len(),
                partial_failures = report.partial_failures.len(),
                failed_keys = failed_keys.len(),
                "bulk delete incomplete"
            );
        }
        Ok(report)
    }

    pub async fn bulk_delete_ids(
        &self,
        ids: &[RecordId],
    ) -> Result<BulkDeleteReport, LifecycleError> {
        let mut records = Vec::with_capacity(ids.len());
        let mut missing = Vec::new();
        for id in ids {
            match self.records.get(id).await? {
                Some(record) => records.push(record),
                None => missing.push(id.clone()),
            }
        }
        let mut report = self.bulk_delete(&records).await?;
        report.missing = missing;
        Ok(report)
    }
}
