use std::sync::Arc;

use anyhow::{Context, Result};
use blob_store::{BlobStore, ObjectBlobStore};
use tokio::{signal, sync::watch};
use tracing::{error, info};

use crate::{
    bulk_delete::BulkDeleter,
    config::ServerConfig,
    lifecycle::AttachmentLifecycleManager,
    reaper::Reaper,
    retention::RetentionSweeper,
    state_store::{InMemoryRecordStore, RecordStore},
};

#[derive(Clone)]
#[allow(dead_code)]
pub struct Service {
    pub config: ServerConfig,
    pub shutdown_tx: watch::Sender<()>,
    pub shutdown_rx: watch::Receiver<()>,
    pub blob_store: Arc<dyn BlobStore>,
    pub record_store: Arc<dyn RecordStore>,
    pub lifecycle: Arc<AttachmentLifecycleManager>,
    pub bulk_deleter: Arc<BulkDeleter>,
    pub reaper: Arc<Reaper>,
    pub retention: Arc<RetentionSweeper>,
}

impl Service {
    pub fn new(config: ServerConfig) -> Result<Self> {
        let meter = opentelemetry::global::meter("attachment-server");
        let blob_store = Arc::new(
            ObjectBlobStore::new_with_metrics(config.blob_storage.clone(), &meter)
                .context("error initializing blob store")?,
        );
        let record_store = Arc::new(InMemoryRecordStore::new());
        Ok(Self::with_stores(config, blob_store, record_store))
    }

    pub fn with_stores(
        config: ServerConfig,
        blob_store: Arc<dyn BlobStore>,
        record_store: Arc<dyn RecordStore>,
    ) -> Self {
        let (shutdown_tx, shutdown_rx) = watch::channel(());
        let lifecycle = Arc::new(AttachmentLifecycleManager::new(
            blob_store.clone(),
            record_store.clone(),
        ));
        let bulk_deleter = Arc::new(BulkDeleter::new(blob_store.clone(), record_store.clone()));
        let reaper = Arc::new(Reaper::new(
            record_store.clone(),
            blob_store.clone(),
            bulk_deleter.clone(),
            config.reaper.clone(),
            shutdown_rx.clone(),
        ));
        let retention = Arc::new(RetentionSweeper::new(
            record_store.clone(),
            bulk_deleter.clone(),
            config.retention.clone(),
            shutdown_rx.clone(),
        ));

        Self {
            config,
            shutdown_tx,
            shutdown_rx,
            blob_store,
            record_store,
            lifecycle,
            bulk_deleter,
            reaper,
            retention,
        }
    }

    /// Runs the background cleanup tasks until a shutdown signal arrives.
    pub async fn start(&self) -> Result<()> {
        info!(
            blob_storage = %self.config.blob_storage.path,
            "starting attachment server"
        );
        let reaper = self.reaper.clone();
        let reaper_handle = tokio::spawn(async move { reaper.start().await });

        let retention = self.retention.clone();
        let retention_handle = tokio::spawn(async move { retention.start().await });

        shutdown_signal(self.shutdown_tx.clone()).await?;
        info!("graceful shutdown signal received, shutting down");

        for (name, handle) in [("reaper", reaper_handle), ("retention", retention_handle)] {
            if let Err(err) = handle.await {
                error!("{} task failed: {:?}", name, err);
            }
        }
        Ok(())
    }
}

async fn shutdown_signal(shutdown_tx: watch::Sender<()>) -> Result<()> {
    let ctrl_c = async {
        signal::ctrl_c()
            .await
            .context("failed to install Ctrl+C handler")
    };

    #[cfg(unix)]
    let terminate = async {
        signal::unix::signal(signal::unix::SignalKind::terminate())
            .context("failed to install signal handler")?
            .recv()
            .await;
        Ok::<(), anyhow::Error>(())
    };

    #[cfg(not(unix))]
    let terminate = std::future::pending::<Result<()>>();

    tokio::select! {
        res = ctrl_c => res?,
        res = terminate => res?,
    }
    shutdown_tx.send(()).context("error broadcasting shutdown")?;
    Ok(())
}
