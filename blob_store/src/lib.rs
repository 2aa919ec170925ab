//! Blob store abstraction for attachment files.
//!
//! The [`BlobStore`] trait is the only storage boundary the lifecycle manager
//! talks to. [`ObjectBlobStore`] binds it to an `object_store` backend chosen
//! by URL scheme:
//!
//! - `s3://bucket/prefix` for S3 and S3-compatible stores (MinIO, localstack)
//! - `file:///path` for the local filesystem
//! - `memory://` for an in-process store, used by tests
//!
//! Deleting a key that does not exist is always a success, whatever the
//! provider reports.
//!
//! ```rust,no_run
//! use blob_store::{BlobStorageConfig, BlobStore, ObjectBlobStore};
//!
//! # async fn example() -> Result<(), blob_store::BlobError> {
//! let store = ObjectBlobStore::new(BlobStorageConfig {
//!     path: "s3://crash-reports/blobs".to_string(),
//!     region: Some("us-east-1".to_string()),
//!     ..Default::default()
//! })?;
//! let blob = store.put("crash/archive/1/a.zip", "zip".into()).await?;
//! store.delete(&blob.key).await?;
//! store.delete(&blob.key).await?; // still fine
//! # Ok(())
//! # }
//! ```

mod config;
mod error;
mod metrics;
mod object;
mod traits;

pub use config::{default_blob_store_path, BlobStorageConfig};
pub use error::{BlobError, BlobResult};
pub use metrics::{BlobMetrics, OpTimer};
pub use object::ObjectBlobStore;
pub use traits::{BlobStore, BulkDeleteOutcome};
