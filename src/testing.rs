use std::{
    collections::BTreeSet,
    sync::{
        atomic::{AtomicBool, AtomicUsize, Ordering},
        Arc,
        Mutex,
    },
};

use anyhow::{anyhow, Result};
use async_trait::async_trait;
use blob_store::{
    BlobError,
    BlobResult,
    BlobStorageConfig,
    BlobStore,
    BulkDeleteOutcome,
    ObjectBlobStore,
};
use bytes::Bytes;
use data_model::{AttachmentRecord, BlobRef, NewRecord, RecordId, RecordKind};
use tokio::sync::watch;
use tracing::subscriber;
use tracing_subscriber::{layer::SubscriberExt, Layer};

use crate::{
    config::ServerConfig,
    service::Service,
    state_store::{InMemoryRecordStore, RecordStore},
};

fn init_test_tracing() {
    let env_filter = tracing_subscriber::EnvFilter::try_from_default_env()
        .unwrap_or_else(|_| tracing_subscriber::EnvFilter::new("debug"));
    let _ = subscriber::set_global_default(
        tracing_subscriber::registry()
            .with(tracing_subscriber::fmt::layer().with_filter(env_filter)),
    );
}

pub struct TestService {
    pub service: Service,
    faulty: Option<Arc<FaultyBlobStore>>,
    failing_records: Option<Arc<FailingRecordStore>>,
}

impl TestService {
    /// Service over an in-memory blob store, the stand-in for a mocked S3
    /// bucket.
    pub fn new() -> Result<Self> {
        init_test_tracing();
        let cfg = test_config(BlobStorageConfig::in_memory());
        Ok(Self {
            service: Service::new(cfg)?,
            faulty: None,
            failing_records: None,
        })
    }

    /// Service over the local filesystem backend in a temp dir.
    pub fn new_on_disk(temp_dir: &tempfile::TempDir) -> Result<Self> {
        init_test_tracing();
        let cfg = test_config(BlobStorageConfig::new(&format!(
            "file://{}",
            temp_dir.path().join("blob_store").display()
        )));
        Ok(Self {
            service: Service::new(cfg)?,
            faulty: None,
            failing_records: None,
        })
    }

    /// Service whose blob store failures can be injected.
    pub fn new_faulty() -> Result<Self> {
        init_test_tracing();
        let cfg = test_config(BlobStorageConfig::in_memory());
        let inner = Arc::new(ObjectBlobStore::new(cfg.blob_storage.clone())?);
        let faulty = Arc::new(FaultyBlobStore::new(inner));
        let service =
            Service::with_stores(cfg, faulty.clone(), Arc::new(InMemoryRecordStore::new()));
        Ok(Self {
            service,
            faulty: Some(faulty),
            failing_records: None,
        })
    }

    /// Service whose record store writes can be made to fail.
    pub fn new_with_failing_records() -> Result<Self> {
        init_test_tracing();
        let cfg = test_config(BlobStorageConfig::in_memory());
        let blob_store = Arc::new(ObjectBlobStore::new(cfg.blob_storage.clone())?);
        let records = Arc::new(FailingRecordStore::new());
        let service = Service::with_stores(cfg, blob_store, records.clone());
        Ok(Self {
            service,
            faulty: None,
            failing_records: Some(records),
        })
    }

    pub fn faulty(&self) -> &FaultyBlobStore {
        self.faulty
            .as_deref()
            .expect("test service was not built with new_faulty")
    }

    pub fn failing_records(&self) -> &FailingRecordStore {
        self.failing_records
            .as_deref()
            .expect("test service was not built with new_with_failing_records")
    }

    pub async fn blob_keys(&self) -> Result<Vec<String>> {
        Ok(self.service.blob_store.list_keys("").await?)
    }

    pub async fn create_records(&self, new_records: Vec<NewRecord>) -> Result<Vec<AttachmentRecord>> {
        let mut records = Vec::with_capacity(new_records.len());
        for new_record in new_records {
            records.push(self.service.lifecycle.on_create(new_record).await?);
        }
        Ok(records)
    }
}

fn test_config(blob_storage: BlobStorageConfig) -> ServerConfig {
    ServerConfig {
        blob_storage,
        ..Default::default()
    }
}

/// Blob store wrapper that fails on demand.
pub struct FaultyBlobStore {
    inner: Arc<dyn BlobStore>,
    /// `Some(n)`: n more puts succeed, then every put fails.
    puts_before_failure: Mutex<Option<usize>>,
    /// Puts reach the inner store but report unavailable, like a timeout
    /// that fires after the write landed.
    puts_fail_after_write: AtomicBool,
    failing_delete_patterns: Mutex<Vec<String>>,
    bulk_delete_calls: AtomicUsize,
    single_delete_calls: AtomicUsize,
}

impl FaultyBlobStore {
    pub fn new(inner: Arc<dyn BlobStore>) -> Self {
        Self {
            inner,
            puts_before_failure: Mutex::new(None),
            puts_fail_after_write: AtomicBool::new(false),
            failing_delete_patterns: Mutex::new(Vec::new()),
            bulk_delete_calls: AtomicUsize::new(0),
            single_delete_calls: AtomicUsize::new(0),
        }
    }

    pub fn fail_puts_after(&self, successful_puts: usize) {
        *self.puts_before_failure.lock().unwrap() = Some(successful_puts);
    }

    pub fn fail_puts_after_write(&self) {
        self.puts_fail_after_write.store(true, Ordering::SeqCst);
    }

    /// Deletes of keys containing `pattern` fail as unavailable.
    pub fn fail_deletes_matching(&self, pattern: &str) {
        self.failing_delete_patterns
            .lock()
            .unwrap()
            .push(pattern.to_string());
    }

    pub fn heal(&self) {
        *self.puts_before_failure.lock().unwrap() = None;
        self.puts_fail_after_write.store(false, Ordering::SeqCst);
        self.failing_delete_patterns.lock().unwrap().clear();
    }

    pub fn bulk_delete_calls(&self) -> usize {
        self.bulk_delete_calls.load(Ordering::SeqCst)
    }

    pub fn single_delete_calls(&self) -> usize {
        self.single_delete_calls.load(Ordering::SeqCst)
    }

    fn delete_fails(&self, key: &str) -> bool {
        self.failing_delete_patterns
            .lock()
            .unwrap()
            .iter()
            .any(|pattern| key.contains(pattern.as_str()))
    }

    fn injected(key: &str) -> BlobError {
        BlobError::unavailable(key, anyhow!("injected failure"))
    }
}

#[async_trait]
impl BlobStore for FaultyBlobStore {
    async fn put(&self, key: &str, data: Bytes) -> BlobResult<BlobRef> {
        {
            let mut remaining = self.puts_before_failure.lock().unwrap();
            match remaining.as_mut() {
                Some(0) => return Err(Self::injected(key)),
                Some(n) => *n -= 1,
                None => {}
            }
        }
        let blob = self.inner.put(key, data).await?;
        if self.puts_fail_after_write.load(Ordering::SeqCst) {
            return Err(Self::injected(key));
        }
        Ok(blob)
    }

    async fn get(&self, key: &str) -> BlobResult<Bytes> {
        self.inner.get(key).await
    }

    async fn delete(&self, key: &str) -> BlobResult<()> {
        self.single_delete_calls.fetch_add(1, Ordering::SeqCst);
        if self.delete_fails(key) {
            return Err(Self::injected(key));
        }
        self.inner.delete(key).await
    }

    async fn bulk_delete(&self, keys: &BTreeSet<String>) -> BulkDeleteOutcome {
        self.bulk_delete_calls.fetch_add(1, Ordering::SeqCst);
        let (failing, passing): (BTreeSet<String>, BTreeSet<String>) =
            keys.iter().cloned().partition(|key| self.delete_fails(key));
        let mut outcome = self.inner.bulk_delete(&passing).await;
        for key in failing {
            let err = Self::injected(&key);
            outcome.failed.insert(key, err);
        }
        outcome
    }

    async fn list_keys(&self, prefix: &str) -> BlobResult<Vec<String>> {
        self.inner.list_keys(prefix).await
    }
}

/// Record store whose writes fail on demand. Reads always work.
pub struct FailingRecordStore {
    inner: InMemoryRecordStore,
    fail_writes: AtomicBool,
}

impl FailingRecordStore {
    pub fn new() -> Self {
        Self {
            inner: InMemoryRecordStore::new(),
            fail_writes: AtomicBool::new(false),
        }
    }

    pub fn fail_writes(&self, fail: bool) {
        self.fail_writes.store(fail, Ordering::SeqCst);
    }

    fn check_write(&self) -> Result<()> {
        if self.fail_writes.load(Ordering::SeqCst) {
            return Err(anyhow!("injected record store failure"));
        }
        Ok(())
    }
}

#[async_trait]
impl RecordStore for FailingRecordStore {
    async fn insert(&self, record: AttachmentRecord) -> Result<()> {
        self.check_write()?;
        self.inner.insert(record).await
    }

    async fn get(&self, id: &RecordId) -> Result<Option<AttachmentRecord>> {
        self.inner.get(id).await
    }

    async fn set_field(
        &self,
        id: &RecordId,
        field: &str,
        blob: Option<BlobRef>,
    ) -> Result<AttachmentRecord> {
        self.check_write()?;
        self.inner.set_field(id, field, blob).await
    }

    async fn replace(&self, record: AttachmentRecord) -> Result<()> {
        self.check_write()?;
        self.inner.replace(record).await
    }

    async fn remove(&self, id: &RecordId) -> Result<Option<AttachmentRecord>> {
        self.check_write()?;
        self.inner.remove(id).await
    }

    async fn list(&self, kind: Option<RecordKind>) -> Result<Vec<AttachmentRecord>> {
        self.inner.list(kind).await
    }

    async fn list_tombstoned(
        &self,
        after: Option<&RecordId>,
        limit: Option<usize>,
    ) -> Result<Vec<AttachmentRecord>> {
        self.inner.list_tombstoned(after, limit).await
    }

    async fn add_orphans(&self, keys: Vec<String>) -> Result<()> {
        self.check_write()?;
        self.inner.add_orphans(keys).await
    }

    async fn get_orphans(
        &self,
        after: Option<&str>,
        limit: Option<usize>,
    ) -> Result<(Vec<String>, bool)> {
        self.inner.get_orphans(after, limit).await
    }

    async fn remove_orphans(&self, keys: &[String]) -> Result<()> {
        self.check_write()?;
        self.inner.remove_orphans(keys).await
    }

    fn cleanup_watcher(&self) -> watch::Receiver<()> {
        self.inner.cleanup_watcher()
    }
}
