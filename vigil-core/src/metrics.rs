use std::sync::Arc;
use std::sync::atomic::{AtomicU64, Ordering};

/// Lock-free counters shared by every stage of one process.
///
/// Survives pipeline restarts so health snapshots keep cumulative totals.
#[derive(Debug, Default)]
pub struct PipelineMetrics {
    files_watched: AtomicU64,
    pending_paths: AtomicU64,
    queued_items: AtomicU64,
    inflight_validators: AtomicU64,
    peak_inflight_validators: AtomicU64,
    completed: AtomicU64,
    failed: AtomicU64,
    cache_hits: AtomicU64,
    cache_misses: AtomicU64,
    reports_delivered: AtomicU64,
}

/// Plain copy of the counters at one instant.
#[derive(Debug, Clone, Copy, Default, PartialEq, Eq, serde::Serialize, serde::Deserialize)]
pub struct MetricsSnapshot {
    pub files_watched: u64,
    pub queue_depth: u64,
    pub inflight_validators: u64,
    pub peak_inflight_validators: u64,
    pub completed: u64,
    pub failed: u64,
    pub cache_hits: u64,
    pub cache_misses: u64,
    pub reports_delivered: u64,
}

impl PipelineMetrics {
    pub fn new() -> Self {
        Self::default()
    }

    pub fn set_files_watched(&self, count: u64) {
        self.files_watched.store(count, Ordering::Relaxed);
    }

    /// Paths waiting out their quiescence window.
    pub fn set_pending_paths(&self, count: u64) {
        self.pending_paths.store(count, Ordering::Relaxed);
    }

    pub fn item_queued(&self) {
        self.queued_items.fetch_add(1, Ordering::Relaxed);
    }

    pub fn item_dequeued(&self) {
        let _ = self
            .queued_items
            .fetch_update(Ordering::Relaxed, Ordering::Relaxed, |v| {
                Some(v.saturating_sub(1))
            });
    }

    /// Reset per-generation gauges after a teardown.
    pub fn reset_gauges(&self) {
        self.pending_paths.store(0, Ordering::Relaxed);
        self.queued_items.store(0, Ordering::Relaxed);
    }

    /// Returns a guard that decrements the in-flight gauge when dropped.
    pub fn validator_started(self: &Arc<Self>) -> InflightGuard {
        let now = self.inflight_validators.fetch_add(1, Ordering::SeqCst) + 1;
        self.peak_inflight_validators
            .fetch_max(now, Ordering::SeqCst);
        InflightGuard {
            metrics: Arc::clone(self),
        }
    }

    pub fn record_completed(&self, passed: bool) {
        self.completed.fetch_add(1, Ordering::Relaxed);
        if !passed {
            self.failed.fetch_add(1, Ordering::Relaxed);
        }
    }

    pub fn record_cache_hit(&self) {
        self.cache_hits.fetch_add(1, Ordering::Relaxed);
    }

    pub fn record_cache_miss(&self) {
        self.cache_misses.fetch_add(1, Ordering::Relaxed);
    }

    pub fn record_report_delivered(&self) {
        self.reports_delivered.fetch_add(1, Ordering::Relaxed);
    }

    pub fn queue_depth(&self) -> u64 {
        self.pending_paths.load(Ordering::Relaxed) + self.queued_items.load(Ordering::Relaxed)
    }

    pub fn inflight_validators(&self) -> u64 {
        self.inflight_validators.load(Ordering::SeqCst)
    }

    pub fn peak_inflight_validators(&self) -> u64 {
        self.peak_inflight_validators.load(Ordering::SeqCst)
    }

    pub fn completed(&self) -> u64 {
        self.completed.load(Ordering::Relaxed)
    }

    pub fn snapshot(&self) -> MetricsSnapshot {
        MetricsSnapshot {
            files_watched: self.files_watched.load(Ordering::Relaxed),
            queue_depth: self.queue_depth(),
            inflight_validators: self.inflight_validators(),
            peak_inflight_validators: self.peak_inflight_validators(),
            completed: self.completed(),
            failed: self.failed.load(Ordering::Relaxed),
            cache_hits: self.cache_hits.load(Ordering::Relaxed),
            cache_misses: self.cache_misses.load(Ordering::Relaxed),
            reports_delivered: self.reports_delivered.load(Ordering::Relaxed),
        }
    }
}

#[derive(Debug)]
pub struct InflightGuard {
    metrics: Arc<PipelineMetrics>,
}

impl Drop for InflightGuard {
    fn drop(&mut self) {
        self.metrics
            .inflight_validators
            .fetch_sub(1, Ordering::SeqCst);
    }
}
