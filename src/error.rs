use std::collections::BTreeMap;

use blob_store::BlobError;
use data_model::{RecordId, RecordKind};

#[derive(Debug, thiserror::Error)]
#[non_exhaustive]
pub enum LifecycleError {
    /// A storage failure surfaced as is, nothing needed rolling back.
    #[error(transparent)]
    Storage(#[from] BlobError),

    /// A write failed and the blobs already written for the call were
    /// deleted. `rollback_failures` lists the ones that could not be.
    #[error(
        "write of record {} failed at {}, rolled back {} blob(s), {} left behind: {}",
        record_id,
        field.as_deref().unwrap_or("record commit"),
        rolled_back.len(),
        rollback_failures.len(),
        source
    )]
    PartialWriteFailure {
        record_id: RecordId,
        field: Option<String>,
        source: anyhow::Error,
        rolled_back: Vec<String>,
        rollback_failures: BTreeMap<String, BlobError>,
    },

    /// Some blobs of the record could not be deleted. The record keeps
    /// exactly those references and is tombstoned.
    #[error("delete of record {} left {} blob(s) undeleted", record_id, failed.len())]
    PartialDeleteFailure {
        record_id: RecordId,
        failed: BTreeMap<String, BlobError>,
    },

    #[error("record not found: {0}")]
    RecordNotFound(RecordId),

    #[error("record {0} is being deleted")]
    RecordTombstoned(RecordId),

    #[error("{kind} records have no file field '{field}'")]
    UnknownField { kind: RecordKind, field: String },

    #[error("record store error: {0}")]
    RecordStore(#[from] anyhow::Error),
}

impl LifecycleError {
    /// Identifies failures where retrying the same call can succeed.
    pub fn is_retryable(&self) -> bool {
        match self {
            Self::Storage(err) => err.is_retryable(),
            Self::PartialWriteFailure { source, .. } => source
                .downcast_ref::<BlobError>()
                .is_none_or(|err| err.is_retryable()),
            Self::PartialDeleteFailure { .. } | Self::RecordStore(_) => true,
            Self::RecordNotFound(_) | Self::RecordTombstoned(_) | Self::UnknownField { .. } => {
                false
            }
        }
    }
}
