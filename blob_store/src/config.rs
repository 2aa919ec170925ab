use std::{env, path::PathBuf, time::Duration};

use serde::{Deserialize, Serialize};

/// Where attachment blobs live and how calls against the store are bounded.
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct BlobStorageConfig {
    /// `s3://bucket/prefix`, `file:///dir` or `memory://`.
    #[serde(default = "default_blob_store_path")]
    pub path: String,

    #[serde(default)]
    pub region: Option<String>,

    #[serde(default = "default_operation_timeout_secs")]
    pub operation_timeout_secs: u64,

    /// When false, `put` on an existing key is a `WriteConflict`.
    #[serde(default)]
    pub allow_overwrite: bool,
}

impl BlobStorageConfig {
    pub fn new(path: &str) -> Self {
        Self {
            path: path.to_string(),
            ..Default::default()
        }
    }

    pub fn in_memory() -> Self {
        Self::new("memory://")
    }

    pub fn operation_timeout(&self) -> Duration {
        Duration::from_secs(self.operation_timeout_secs)
    }
}

impl Default for BlobStorageConfig {
    fn default() -> Self {
        Self {
            path: default_blob_store_path(),
            region: None,
            operation_timeout_secs: default_operation_timeout_secs(),
            allow_overwrite: false,
        }
    }
}

fn default_operation_timeout_secs() -> u64 {
    30
}

/// `file://` URL of `attachment_storage/blobs` under the working directory.
pub fn default_blob_store_path() -> String {
    let dir = env::current_dir()
        .unwrap_or_else(|_| PathBuf::from("."))
        .join("attachment_storage")
        .join("blobs");
    format!("file://{}", dir.display())
}
