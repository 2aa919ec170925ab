//! Core blob store trait.

use std::collections::{BTreeMap, BTreeSet};

use async_trait::async_trait;
use bytes::Bytes;
use data_model::BlobRef;

use crate::{BlobError, BlobResult};

/// Per-key result of a bulk delete.
#[derive(Debug, Default)]
pub struct BulkDeleteOutcome {
    pub succeeded: BTreeSet<String>,
    pub failed: BTreeMap<String, BlobError>,
}

impl BulkDeleteOutcome {
    pub fn is_complete(&self) -> bool {
        self.failed.is_empty()
    }
}

/// Object storage capability, keyed purely by storage key.
///
/// Implementations must treat deleting a missing key as success.
#[async_trait]
pub trait BlobStore: Send + Sync {
    /// Write `data` under `key` and describe what was stored.
    ///
    /// Returns `BlobError::WriteConflict` if the key exists and the store
    /// does not allow overwrites.
    async fn put(&self, key: &str, data: Bytes) -> BlobResult<BlobRef>;

    /// Returns `BlobError::NotFound` if the blob doesn't exist.
    async fn get(&self, key: &str) -> BlobResult<Bytes>;

    /// Idempotent delete.
    async fn delete(&self, key: &str) -> BlobResult<()>;

    /// Best-effort delete of many keys. Never aborts on one key's failure.
    async fn bulk_delete(&self, keys: &BTreeSet<String>) -> BulkDeleteOutcome;

    /// Keys under `prefix`, sorted. Meant for verification, not hot paths.
    async fn list_keys(&self, prefix: &str) -> BlobResult<Vec<String>>;
}
