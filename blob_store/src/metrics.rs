//! Blob store metrics.

use std::time::Instant;

use opentelemetry::{
    metrics::{Counter, Histogram, Meter},
    KeyValue,
};

/// Latency, error and deletion instruments, labelled by operation.
#[derive(Clone)]
pub struct BlobMetrics {
    latency: Histogram<f64>,
    errors: Counter<u64>,
    deleted_keys: Counter<u64>,
}

impl BlobMetrics {
    pub fn new(meter: &Meter) -> Self {
        Self {
            latency: meter
                .f64_histogram("attachment_blob_op_duration_seconds")
                .with_description("Latency of blob store calls, including timeouts")
                .build(),
            errors: meter
                .u64_counter("attachment_blob_op_errors_total")
                .with_description("Blob store calls or keys that failed")
                .build(),
            deleted_keys: meter
                .u64_counter("attachment_blob_deleted_keys_total")
                .with_description("Keys confirmed deleted, single and bulk")
                .build(),
        }
    }

    /// Starts timing `op`; the latency is recorded when the guard drops.
    pub fn start(&self, op: &'static str) -> OpTimer {
        OpTimer {
            started: Instant::now(),
            latency: self.latency.clone(),
            op,
        }
    }

    pub fn record_errors(&self, op: &'static str, count: u64) {
        if count > 0 {
            self.errors.add(count, &[KeyValue::new("op", op)]);
        }
    }

    pub fn record_deleted(&self, count: u64) {
        if count > 0 {
            self.deleted_keys.add(count, &[]);
        }
    }
}

pub struct OpTimer {
    started: Instant,
    latency: Histogram<f64>,
    op: &'static str,
}

impl Drop for OpTimer {
    fn drop(&mut self) {
        self.latency.record(
            self.started.elapsed().as_secs_f64(),
            &[KeyValue::new("op", self.op)],
        );
    }
}
