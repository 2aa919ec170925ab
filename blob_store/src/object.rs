//! [`BlobStore`] over the `object_store` crate.

use std::{collections::BTreeSet, env, future::Future, sync::Arc, time::Duration};

use anyhow::anyhow;
use async_trait::async_trait;
use bytes::Bytes;
use data_model::BlobRef;
use futures::{stream, StreamExt};
use object_store::{
    aws::AmazonS3Builder,
    local::LocalFileSystem,
    memory::InMemory,
    path::Path,
    ObjectStore,
    PutMode,
    PutOptions,
    PutPayload,
};
use opentelemetry::metrics::Meter;
use sha2::{Digest, Sha256};
use tracing::{debug, info, warn};
use url::Url;

use crate::{
    BlobError,
    BlobMetrics,
    BlobResult,
    BlobStorageConfig,
    BlobStore,
    BulkDeleteOutcome,
    OpTimer,
};

/// Blob store backed by S3, the local filesystem or memory, depending on the
/// configured URL.
pub struct ObjectBlobStore {
    object_store: Arc<dyn ObjectStore>,

    /// Base path every key is relative to.
    prefix: Path,

    timeout: Duration,

    allow_overwrite: bool,

    metrics: Option<BlobMetrics>,
}

impl ObjectBlobStore {
    pub fn new(config: BlobStorageConfig) -> BlobResult<Self> {
        let (object_store, prefix) = Self::build_object_store(&config)?;
        info!(path = %config.path, "using blob store");
        Ok(Self {
            object_store,
            prefix,
            timeout: config.operation_timeout(),
            allow_overwrite: config.allow_overwrite,
            metrics: None,
        })
    }

    pub fn new_with_metrics(config: BlobStorageConfig, meter: &Meter) -> BlobResult<Self> {
        let mut store = Self::new(config)?;
        store.metrics = Some(BlobMetrics::new(meter));
        Ok(store)
    }

    /// Wraps an already built object store. Keys are relative to its root.
    pub fn with_object_store(
        object_store: Arc<dyn ObjectStore>,
        config: &BlobStorageConfig,
    ) -> Self {
        Self {
            object_store,
            prefix: Path::default(),
            timeout: config.operation_timeout(),
            allow_overwrite: config.allow_overwrite,
            metrics: None,
        }
    }

    pub fn get_object_store(&self) -> Arc<dyn ObjectStore> {
        self.object_store.clone()
    }

    fn build_object_store(config: &BlobStorageConfig) -> BlobResult<(Arc<dyn ObjectStore>, Path)> {
        let url = Url::parse(&config.path)?;
        match url.scheme() {
            "memory" => Ok((Arc::new(InMemory::new()), Path::default())),
            "file" => {
                let dir = url.to_file_path().map_err(|_| BlobError::InvalidConfig {
                    reason: format!("not a local path: {}", config.path),
                })?;
                std::fs::create_dir_all(&dir).map_err(|e| BlobError::InvalidConfig {
                    reason: format!("can't create {}: {}", dir.display(), e),
                })?;
                let local = LocalFileSystem::new_with_prefix(&dir).map_err(|e| {
                    BlobError::InvalidConfig {
                        reason: e.to_string(),
                    }
                })?;
                Ok((Arc::new(local), Path::default()))
            }
            "s3" | "s3a" => {
                let mut builder = AmazonS3Builder::from_env().with_url(config.path.as_str());
                if let Some(region) = &config.region {
                    builder = builder.with_region(region);
                }

                // For supporting localstack/minio for testing
                if let Ok(endpoint) = env::var("AWS_ENDPOINT_URL") {
                    if endpoint.starts_with("http://") {
                        builder = builder.with_allow_http(true);
                    }
                    builder = builder.with_endpoint(endpoint);
                }
                let s3 = builder.build().map_err(|e| BlobError::InvalidConfig {
                    reason: e.to_string(),
                })?;
                Ok((Arc::new(s3), Path::from(url.path())))
            }
            scheme => Err(BlobError::UnsupportedBackend {
                scheme: scheme.to_string(),
            }),
        }
    }

    fn location(&self, key: &str) -> BlobResult<Path> {
        let relative = Path::parse(key).map_err(|e| BlobError::InvalidKey {
            key: key.to_string(),
            reason: e.to_string(),
        })?;
        if relative.as_ref().is_empty() {
            return Err(BlobError::InvalidKey {
                key: key.to_string(),
                reason: "empty key".to_string(),
            });
        }
        Ok(self.prefix.parts().chain(relative.parts()).collect())
    }

    fn relative_key(&self, location: &Path) -> String {
        match location.prefix_match(&self.prefix) {
            Some(parts) => parts
                .map(|part| part.as_ref().to_string())
                .collect::<Vec<_>>()
                .join("/"),
            None => location.to_string(),
        }
    }

    fn timer(&self, op: &'static str) -> Option<OpTimer> {
        self.metrics.as_ref().map(|m| m.start(op))
    }

    /// Runs `fut` under the operation timeout. Expiry is reported as the
    /// store being unavailable.
    async fn bounded<T, F>(&self, key: &str, op: &'static str, fut: F) -> BlobResult<T>
    where
        F: Future<Output = BlobResult<T>>,
    {
        let _timer = self.timer(op);
        let result = match tokio::time::timeout(self.timeout, fut).await {
            Ok(result) => result,
            Err(_) => Err(BlobError::unavailable(
                key,
                anyhow!("{} timed out after {:?}", op, self.timeout),
            )),
        };
        if let (Err(err), Some(metrics)) = (&result, &self.metrics) {
            if !matches!(err, BlobError::NotFound { .. }) {
                metrics.record_errors(op, 1);
            }
        }
        result
    }
}

#[async_trait]
impl BlobStore for ObjectBlobStore {
    async fn put(&self, key: &str, data: Bytes) -> BlobResult<BlobRef> {
        let location = self.location(key)?;
        let size_bytes = data.len() as u64;
        let sha256_hash = format!("{:x}", Sha256::digest(&data));
        let mode = if self.allow_overwrite {
            PutMode::Overwrite
        } else {
            PutMode::Create
        };
        let opts = PutOptions {
            mode,
            ..Default::default()
        };

        self.bounded(key, "put", async {
            self.object_store
                .put_opts(&location, PutPayload::from(data), opts)
                .await
                .map_err(|e| BlobError::from_object_store(key, e))
        })
        .await?;

        debug!(key, size_bytes, "stored blob");
        Ok(BlobRef {
            key: key.to_string(),
            size_bytes,
            sha256_hash,
        })
    }

    async fn get(&self, key: &str) -> BlobResult<Bytes> {
        let location = self.location(key)?;
        self.bounded(key, "get", async {
            let result = self
                .object_store
                .get(&location)
                .await
                .map_err(|e| BlobError::from_object_store(key, e))?;
            result
                .bytes()
                .await
                .map_err(|e| BlobError::from_object_store(key, e))
        })
        .await
    }

    async fn delete(&self, key: &str) -> BlobResult<()> {
        let Ok(location) = self.location(key) else {
            warn!(key, "delete of an unaddressable key, nothing to remove");
            return Ok(());
        };
        self.bounded(key, "delete", async {
            match self.object_store.delete(&location).await {
                Ok(()) => Ok(()),
                // Some providers report a missing key, others don't.
                Err(object_store::Error::NotFound { .. }) => {
                    debug!(key, "blob already deleted");
                    Ok(())
                }
                Err(e) => Err(BlobError::from_object_store(key, e)),
            }
        })
        .await?;
        if let Some(metrics) = &self.metrics {
            metrics.record_deleted(1);
        }
        Ok(())
    }

    async fn bulk_delete(&self, keys: &BTreeSet<String>) -> BulkDeleteOutcome {
        let mut outcome = BulkDeleteOutcome::default();
        let mut locations = Vec::with_capacity(keys.len());
        for key in keys {
            match self.location(key) {
                Ok(location) => locations.push((key.clone(), location)),
                Err(_) => {
                    outcome.succeeded.insert(key.clone());
                }
            }
        }
        if locations.is_empty() {
            return outcome;
        }

        let _timer = self.timer("bulk_delete");
        let paths: Vec<Path> = locations
            .iter()
            .map(|(_, location)| location.clone())
            .collect();
        let mut results = self.object_store.delete_stream(
            stream::iter(paths.into_iter().map(Ok::<Path, object_store::Error>)).boxed(),
        );

        // delete_stream yields one result per input location, in input order.
        // The whole batch shares one deadline.
        let deadline = tokio::time::Instant::now() + self.timeout;
        let mut pending = locations.into_iter();
        while let Some((key, _)) = pending.next() {
            match tokio::time::timeout_at(deadline, results.next()).await {
                Ok(Some(Ok(_))) | Ok(Some(Err(object_store::Error::NotFound { .. }))) => {
                    outcome.succeeded.insert(key);
                }
                Ok(Some(Err(e))) => {
                    outcome
                        .failed
                        .insert(key.clone(), BlobError::from_object_store(&key, e));
                }
                Ok(None) => {
                    outcome.failed.insert(
                        key.clone(),
                        BlobError::unavailable(&key, anyhow!("delete stream ended early")),
                    );
                }
                Err(_) => {
                    let reason = format!("bulk delete timed out after {:?}", self.timeout);
                    let unconfirmed = std::iter::once(key).chain(pending.by_ref().map(|(k, _)| k));
                    for key in unconfirmed {
                        let err = BlobError::unavailable(&key, anyhow!(reason.clone()));
                        outcome.failed.insert(key, err);
                    }
                    break;
                }
            }
        }

        if let Some(metrics) = &self.metrics {
            metrics.record_deleted(outcome.succeeded.len() as u64);
            metrics.record_errors("bulk_delete", outcome.failed.len() as u64);
        }
        debug!(
            succeeded = outcome.succeeded.len(),
            failed = outcome.failed.len(),
            "bulk delete finished"
        );
        outcome
    }

    async fn list_keys(&self, prefix: &str) -> BlobResult<Vec<String>> {
        // Object stores list whole path segments, so list the enclosing
        // directory and filter on the raw prefix.
        let dir = prefix.rfind('/').map(|i| &prefix[..i]).unwrap_or("");
        let base = if dir.is_empty() {
            self.prefix.clone()
        } else {
            self.location(dir)?
        };
        let _timer = self.timer("list");

        let mut listing = if base.as_ref().is_empty() {
            self.object_store.list(None)
        } else {
            self.object_store.list(Some(&base))
        };
        let mut keys = Vec::new();
        loop {
            let next = tokio::time::timeout(self.timeout, listing.next())
                .await
                .map_err(|_| BlobError::unavailable(prefix, anyhow!("list timed out")))?;
            let Some(meta) = next else {
                break;
            };
            let meta = meta.map_err(|e| BlobError::from_object_store(prefix, e))?;
            let key = self.relative_key(&meta.location);
            if key.starts_with(prefix) {
                keys.push(key);
            }
        }
        keys.sort();
        Ok(keys)
    }
}
