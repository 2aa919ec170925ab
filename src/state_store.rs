//! Record persistence used by the lifecycle manager.
//!
//! Every method is atomic with respect to the record it touches. The store
//! also keeps the orphan ledger: keys no live record references that still
//! have to be removed from blob storage.

use std::{
    collections::{BTreeMap, BTreeSet},
    ops::Bound,
};

use anyhow::{anyhow, Result};
use async_trait::async_trait;
use data_model::{AttachmentRecord, BlobRef, RecordId, RecordKind};
use tokio::sync::{watch, RwLock};

#[async_trait]
pub trait RecordStore: Send + Sync {
    /// Fails if a record with the same id exists.
    async fn insert(&self, record: AttachmentRecord) -> Result<()>;

    async fn get(&self, id: &RecordId) -> Result<Option<AttachmentRecord>>;

    /// Points `field` of the record at `blob` and returns the updated record.
    async fn set_field(
        &self,
        id: &RecordId,
        field: &str,
        blob: Option<BlobRef>,
    ) -> Result<AttachmentRecord>;

    /// Overwrites an existing record.
    async fn replace(&self, record: AttachmentRecord) -> Result<()>;

    async fn remove(&self, id: &RecordId) -> Result<Option<AttachmentRecord>>;

    async fn list(&self, kind: Option<RecordKind>) -> Result<Vec<AttachmentRecord>>;

    /// Tombstoned records in id order, starting after `after`.
    async fn list_tombstoned(
        &self,
        after: Option<&RecordId>,
        limit: Option<usize>,
    ) -> Result<Vec<AttachmentRecord>>;

    async fn add_orphans(&self, keys: Vec<String>) -> Result<()>;

    /// Returns up to `limit` orphan keys sorted after `after`, and whether
    /// more remain past them.
    async fn get_orphans(
        &self,
        after: Option<&str>,
        limit: Option<usize>,
    ) -> Result<(Vec<String>, bool)>;

    async fn remove_orphans(&self, keys: &[String]) -> Result<()>;

    /// Fires whenever cleanup work (orphans or tombstones) is added.
    fn cleanup_watcher(&self) -> watch::Receiver<()>;
}

#[derive(Default)]
struct State {
    records: BTreeMap<RecordId, AttachmentRecord>,
    orphans: BTreeSet<String>,
}

pub struct InMemoryRecordStore {
    state: RwLock<State>,
    cleanup_tx: watch::Sender<()>,
}

impl InMemoryRecordStore {
    pub fn new() -> Self {
        let (cleanup_tx, _) = watch::channel(());
        Self {
            state: RwLock::new(State::default()),
            cleanup_tx,
        }
    }

    fn notify_cleanup(&self) {
        self.cleanup_tx.send_replace(());
    }
}

impl Default for InMemoryRecordStore {
    fn default() -> Self {
        Self::new()
    }
}

#[async_trait]
impl RecordStore for InMemoryRecordStore {
    async fn insert(&self, record: AttachmentRecord) -> Result<()> {
        let mut state = self.state.write().await;
        if state.records.contains_key(&record.id) {
            return Err(anyhow!("record {} already exists", record.id));
        }
        state.records.insert(record.id.clone(), record);
        Ok(())
    }

    async fn get(&self, id: &RecordId) -> Result<Option<AttachmentRecord>> {
        Ok(self.state.read().await.records.get(id).cloned())
    }

    async fn set_field(
        &self,
        id: &RecordId,
        field: &str,
        blob: Option<BlobRef>,
    ) -> Result<AttachmentRecord> {
        let mut state = self.state.write().await;
        let record = state
            .records
            .get_mut(id)
            .ok_or_else(|| anyhow!("record {} not found", id))?;
        if !record.fields.contains_key(field) {
            return Err(anyhow!("record {} has no field {}", id, field));
        }
        record.fields.insert(field.to_string(), blob);
        Ok(record.clone())
    }

    async fn replace(&self, record: AttachmentRecord) -> Result<()> {
        let tombstoned = record.tombstoned;
        {
            let mut state = self.state.write().await;
            let existing = state
                .records
                .get_mut(&record.id)
                .ok_or_else(|| anyhow!("record {} not found", record.id))?;
            *existing = record;
        }
        if tombstoned {
            self.notify_cleanup();
        }
        Ok(())
    }

    async fn remove(&self, id: &RecordId) -> Result<Option<AttachmentRecord>> {
        Ok(self.state.write().await.records.remove(id))
    }

    async fn list(&self, kind: Option<RecordKind>) -> Result<Vec<AttachmentRecord>> {
        let state = self.state.read().await;
        Ok(state
            .records
            .values()
            .filter(|r| kind.is_none_or(|k| r.kind == k))
            .cloned()
            .collect())
    }

    async fn list_tombstoned(
        &self,
        after: Option<&RecordId>,
        limit: Option<usize>,
    ) -> Result<Vec<AttachmentRecord>> {
        let state = self.state.read().await;
        let start = after.map_or(Bound::Unbounded, Bound::Excluded);
        Ok(state
            .records
            .range::<RecordId, _>((start, Bound::Unbounded))
            .map(|(_, record)| record)
            .filter(|r| r.tombstoned)
            .take(limit.unwrap_or(usize::MAX))
            .cloned()
            .collect())
    }

    async fn add_orphans(&self, keys: Vec<String>) -> Result<()> {
        if keys.is_empty() {
            return Ok(());
        }
        self.state.write().await.orphans.extend(keys);
        self.notify_cleanup();
        Ok(())
    }

    async fn get_orphans(
        &self,
        after: Option<&str>,
        limit: Option<usize>,
    ) -> Result<(Vec<String>, bool)> {
        let state = self.state.read().await;
        let start = after.map_or(Bound::Unbounded, Bound::Excluded);
        let mut orphans = state.orphans.range::<str, _>((start, Bound::Unbounded));
        let keys: Vec<String> = orphans
            .by_ref()
            .take(limit.unwrap_or(usize::MAX))
            .cloned()
            .collect();
        let has_more = orphans.next().is_some();
        Ok((keys, has_more))
    }

    async fn remove_orphans(&self, keys: &[String]) -> Result<()> {
        let mut state = self.state.write().await;
        for key in keys {
            state.orphans.remove(key);
        }
        Ok(())
    }

    fn cleanup_watcher(&self) -> watch::Receiver<()> {
        self.cleanup_tx.subscribe()
    }
}
