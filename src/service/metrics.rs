use serde::Serialize;
use std::sync::atomic::{AtomicU64, AtomicUsize, Ordering};

/// Counters shared between the service and its worker
#[derive(Debug, Default)]
pub struct EmbeddingMetrics {
    queue_depth: AtomicUsize,
    processed_total: AtomicU64,
    failed_total: AtomicU64,
    batches_total: AtomicU64,
    model_loads: AtomicU64,
    idle_unloads: AtomicU64,
}

impl EmbeddingMetrics {
    pub fn new() -> Self {
        Self::default()
    }

    pub fn inc_queue(&self) {
        self.queue_depth.fetch_add(1, Ordering::Relaxed);
    }

    pub fn dec_queue(&self) {
        let _ = self
            .queue_depth
            .fetch_update(Ordering::Relaxed, Ordering::Relaxed, |depth| depth.checked_sub(1));
    }

    pub fn inc_processed(&self, count: u64) {
        self.processed_total.fetch_add(count, Ordering::Relaxed);
    }

    pub fn inc_failed(&self, count: u64) {
        self.failed_total.fetch_add(count, Ordering::Relaxed);
    }

    pub fn inc_batches(&self) {
        self.batches_total.fetch_add(1, Ordering::Relaxed);
    }

    pub fn inc_model_loads(&self) {
        self.model_loads.fetch_add(1, Ordering::Relaxed);
    }

    pub fn inc_idle_unloads(&self) {
        self.idle_unloads.fetch_add(1, Ordering::Relaxed);
    }

    pub fn queue_depth(&self) -> usize {
        self.queue_depth.load(Ordering::Relaxed)
    }

    pub fn snapshot(&self) -> MetricsSnapshot {
        MetricsSnapshot {
            queue_depth: self.queue_depth(),
            processed_total: self.processed_total.load(Ordering::Relaxed),
            failed_total: self.failed_total.load(Ordering::Relaxed),
            batches_total: self.batches_total.load(Ordering::Relaxed),
            model_loads: self.model_loads.load(Ordering::Relaxed),
            idle_unloads: self.idle_unloads.load(Ordering::Relaxed),
        }
    }
}

#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize)]
pub struct MetricsSnapshot {
    pub queue_depth: usize,
    pub processed_total: u64,
    pub failed_total: u64,
    pub batches_total: u64,
    pub model_loads: u64,
    pub idle_unloads: u64,
}
