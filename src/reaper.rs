use std::{collections::BTreeSet, sync::Arc, time::Duration};

use anyhow::Result;
use blob_store::BlobStore;
use data_model::RecordId;
use serde::{Deserialize, Serialize};
use tokio::{
    sync::{watch, Mutex},
    time,
};
use tracing::{debug, error, info, warn};

use crate::{bulk_delete::BulkDeleter, state_store::RecordStore};

#[derive(Debug, Clone, Serialize, Deserialize, PartialEq, Eq)]
pub struct ReaperConfig {
    #[serde(default = "default_reaper_interval_secs")]
    pub interval_secs: u64,
    #[serde(default = "default_reaper_batch_size")]
    pub batch_size: usize,
}

impl Default for ReaperConfig {
    fn default() -> Self {
        Self {
            interval_secs: default_reaper_interval_secs(),
            batch_size: default_reaper_batch_size(),
        }
    }
}

fn default_reaper_interval_secs() -> u64 {
    60
}

fn default_reaper_batch_size() -> usize {
    100
}

/// Where the next pass resumes, so entries that keep failing don't hold the
/// batch for everything sorted after them.
#[derive(Default)]
struct Cursors {
    orphan: Option<String>,
    tombstone: Option<RecordId>,
}

/// Finishes deferred cleanup: orphaned keys and tombstoned records.
pub struct Reaper {
    records: Arc<dyn RecordStore>,
    blob_store: Arc<dyn BlobStore>,
    bulk_deleter: Arc<BulkDeleter>,
    config: ReaperConfig,
    rx: watch::Receiver<()>,
    shutdown_rx: watch::Receiver<()>,
    cursors: Mutex<Cursors>,
}

impl Reaper {
    pub fn new(
        records: Arc<dyn RecordStore>,
        blob_store: Arc<dyn BlobStore>,
        bulk_deleter: Arc<BulkDeleter>,
        config: ReaperConfig,
        shutdown_rx: watch::Receiver<()>,
    ) -> Self {
        let rx = records.cleanup_watcher();
        Self {
            records,
            blob_store,
            bulk_deleter,
            config,
            rx,
            shutdown_rx,
            cursors: Mutex::new(Cursors::default()),
        }
    }

    pub async fn start(&self) {
        info!("starting reaper");

        let mut rx = self.rx.clone();
        let mut shutdown_rx = self.shutdown_rx.clone();
        loop {
            rx.borrow_and_update();
            match self.run().await {
                Ok(has_more) => {
                    if has_more {
                        rx.mark_changed();
                        // throttling to avoid tight loop
                        time::sleep(Duration::from_secs(1)).await;
                    }
                }
                Err(err) => {
                    error!("error processing reaper work: {:?}", err);
                    time::sleep(Duration::from_secs(30)).await;
                }
            }
            tokio::select! {
                _ = rx.changed() => {},
                _ = time::sleep(Duration::from_secs(self.config.interval_secs)) => {},
                _ = shutdown_rx.changed() => {
                    info!("reaper shutting down");
                    break;
                }
            }
        }
    }

    /// One pass over the next batch of each kind of work. Returns whether
    /// entries past this batch are pending; once both lists are exhausted the
    /// next pass starts over from the beginning.
    pub async fn run(&self) -> Result<bool> {
        let batch_size = self.config.batch_size;
        let mut cursors = self.cursors.lock().await;

        let (orphans, more_orphans) = self
            .records
            .get_orphans(cursors.orphan.as_deref(), Some(batch_size))
            .await?;
        cursors.orphan = if more_orphans {
            orphans.last().cloned()
        } else {
            None
        };
        if !orphans.is_empty() {
            let keys: BTreeSet<String> = orphans.into_iter().collect();
            let outcome = self.blob_store.bulk_delete(&keys).await;
            for (key, err) in &outcome.failed {
                warn!(key = %key, "orphaned blob still undeleted: {:?}", err);
            }
            let deleted: Vec<String> = outcome.succeeded.into_iter().collect();
            debug!(deleted = deleted.len(), "deleted orphaned blobs");
            self.records.remove_orphans(&deleted).await?;
        }

        let mut tombstoned = self
            .records
            .list_tombstoned(cursors.tombstone.as_ref(), Some(batch_size + 1))
            .await?;
        let more_tombstoned = tombstoned.len() > batch_size;
        tombstoned.truncate(batch_size);
        cursors.tombstone = if more_tombstoned {
            tombstoned.last().map(|record| record.id.clone())
        } else {
            None
        };
        if !tombstoned.is_empty() {
            let report = self.bulk_deleter.bulk_delete(&tombstoned).await?;
            info!(
                deleted = report.deleted.len(),
                remaining = report.partial_failures.len(),
                "reaped tombstoned records"
            );
        }

        Ok(more_orphans || more_tombstoned)
    }
}
