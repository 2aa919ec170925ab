//! Age, count and size limits per record kind.
//!
//! A sweep selects the records past a limit and removes them through the
//! [`BulkDeleter`], oldest first.

use std::{collections::BTreeMap, sync::Arc, time::Duration};

use anyhow::{anyhow, Result};
use data_model::{get_epoch_time_in_ms, AttachmentRecord, RecordId, RecordKind};
use serde::{Deserialize, Serialize};
use tokio::{sync::watch, time};
use tracing::{error, info, warn};

use crate::{
    bulk_delete::{BulkDeleteReport, BulkDeleter},
    state_store::RecordStore,
};

const MS_PER_DAY: u64 = 24 * 60 * 60 * 1000;

#[derive(Debug, Clone, Default, Serialize, Deserialize, PartialEq, Eq)]
pub struct RetentionPolicy {
    #[serde(default)]
    pub max_age_days: Option<u64>,
    #[serde(default)]
    pub max_records: Option<usize>,
    #[serde(default)]
    pub max_total_size_bytes: Option<u64>,
}

impl RetentionPolicy {
    pub fn validate(&self) -> Result<()> {
        if self.max_age_days == Some(0) ||
            self.max_records == Some(0) ||
            self.max_total_size_bytes == Some(0)
        {
            return Err(anyhow!("retention limits must be greater than zero"));
        }
        Ok(())
    }
}

#[derive(Debug, Clone, Serialize, Deserialize, PartialEq, Eq)]
pub struct RetentionConfig {
    #[serde(default = "default_retention_interval_secs")]
    pub interval_secs: u64,
    #[serde(default)]
    pub policies: BTreeMap<RecordKind, RetentionPolicy>,
}

impl Default for RetentionConfig {
    fn default() -> Self {
        Self {
            interval_secs: default_retention_interval_secs(),
            policies: BTreeMap::new(),
        }
    }
}

fn default_retention_interval_secs() -> u64 {
    60 * 60
}

/// Records of one kind that exceed `policy` at `now_ms`.
///
/// Records are ranked newest first. A record expires when it is older than
/// `max_age_days`, or when it and every newer kept record would not fit in
/// `max_records` or `max_total_size_bytes`; once a count or size limit is hit,
/// every older record expires too. Tombstoned records are skipped.
pub fn select_expired(
    records: &[AttachmentRecord],
    policy: &RetentionPolicy,
    now_ms: u64,
) -> Vec<RecordId> {
    let mut ranked: Vec<&AttachmentRecord> = records.iter().filter(|r| !r.tombstoned).collect();
    ranked.sort_by(|a, b| {
        b.created_at
            .cmp(&a.created_at)
            .then_with(|| a.id.cmp(&b.id))
    });

    let max_age_ms = policy.max_age_days.map(|days| days.saturating_mul(MS_PER_DAY));
    let mut kept_records = 0usize;
    let mut kept_bytes = 0u64;
    let mut limit_reached = false;
    let mut expired = Vec::new();
    for record in ranked {
        let too_old = max_age_ms.is_some_and(|max| now_ms.saturating_sub(record.created_at) > max);
        if !limit_reached && !too_old {
            let size = record.total_size_bytes();
            let over_count = policy.max_records.is_some_and(|max| kept_records + 1 > max);
            let over_size = policy
                .max_total_size_bytes
                .is_some_and(|max| kept_bytes.saturating_add(size) > max);
            if over_count || over_size {
                limit_reached = true;
            } else {
                kept_records += 1;
                kept_bytes += size;
                continue;
            }
        }
        expired.push(record.id.clone());
    }
    expired
}

pub struct RetentionSweeper {
    records: Arc<dyn RecordStore>,
    bulk_deleter: Arc<BulkDeleter>,
    config: RetentionConfig,
    shutdown_rx: watch::Receiver<()>,
}

impl RetentionSweeper {
    pub fn new(
        records: Arc<dyn RecordStore>,
        bulk_deleter: Arc<BulkDeleter>,
        config: RetentionConfig,
        shutdown_rx: watch::Receiver<()>,
    ) -> Self {
        Self {
            records,
            bulk_deleter,
            config,
            shutdown_rx,
        }
    }

    pub async fn start(&self) {
        if self.config.policies.is_empty() {
            info!("no retention policies configured, retention sweeper idle");
            return;
        }
        info!("starting retention sweeper");

        let mut shutdown_rx = self.shutdown_rx.clone();
        let mut interval = time::interval(Duration::from_secs(self.config.interval_secs));
        interval.set_missed_tick_behavior(time::MissedTickBehavior::Delay);
        loop {
            tokio::select! {
                _ = interval.tick() => {
                    if let Err(err) = self.run(get_epoch_time_in_ms()).await {
                        error!("error running retention sweep: {:?}", err);
                    }
                }
                _ = shutdown_rx.changed() => {
                    info!("retention sweeper shutting down");
                    break;
                }
            }
        }
    }

    /// One sweep over every kind with a policy.
    pub async fn run(&self, now_ms: u64) -> Result<BTreeMap<RecordKind, BulkDeleteReport>> {
        let mut reports = BTreeMap::new();
        for (kind, policy) in &self.config.policies {
            let records = self.records.list(Some(*kind)).await?;
            let expired = select_expired(&records, policy, now_ms);
            if expired.is_empty() {
                continue;
            }
            let report = self.bulk_deleter.bulk_delete_ids(&expired).await?;
            if report.is_complete() {
                info!(kind = %kind, deleted = report.deleted.len(), "retention sweep");
            } else {
                warn!(
                    kind = %kind,
                    deleted = report.deleted.len(),
                    partial_failures = report.partial_failures.len(),
                    "retention sweep incomplete, leaving leftovers to the reaper"
                );
            }
            reports.insert(*kind, report);
        }
        Ok(reports)
    }
}
