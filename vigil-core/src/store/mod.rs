//! Durable history of file fingerprints and validation outcomes.
//!
//! Writes are durable before the call returns; a crash between a write and
//! the downstream action at worst causes a re-validation. Callers already
//! rate-limit access through debouncing, so there is no in-process cache.

use std::path::{Path, PathBuf};

use async_trait::async_trait;
use chrono::{DateTime, Utc};
use serde::{Deserialize, Serialize};

use crate::error::Result;
use crate::types::{ContentHash, FileFingerprint, ValidationRecord};

pub mod sqlite;

pub use sqlite::SqliteFingerprintStore;

/// A path that was validated at least `min_count` times inside a window.
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct HotFile {
    pub path: PathBuf,
    pub count: u64,
}

/// Aggregate success-rate over a window of validation history.
#[derive(Debug, Clone, Copy, PartialEq, Serialize, Deserialize, Default)]
pub struct ValidationStats {
    pub runs: u64,
    pub passed: u64,
    pub failed: u64,
    pub mean_duration_ms: f64,
}

impl ValidationStats {
    /// `None` when nothing ran in the window.
    pub fn success_rate(&self) -> Option<f64> {
        (self.runs > 0).then(|| self.passed as f64 / self.runs as f64)
    }
}

#[async_trait]
pub trait FingerprintStore: Send + Sync {
    /// Record the current fingerprint for a path, superseding any prior one.
    async fn put(&self, fingerprint: &FileFingerprint) -> Result<()>;

    async fn last_fingerprint(&self, path: &Path) -> Result<Option<FileFingerprint>>;

    /// Append a completed validation run to the history.
    async fn record_validation(&self, record: &ValidationRecord) -> Result<()>;

    async fn last_validation(&self, path: &Path) -> Result<Option<ValidationRecord>>;

    /// Most recent validation of this exact content, from any path.
    async fn last_validation_for_hash(
        &self,
        hash: &ContentHash,
    ) -> Result<Option<ValidationRecord>>;

    /// Paths validated at least `min_count` times within `window`, busiest first.
    async fn hot_files(
        &self,
        window: chrono::Duration,
        min_count: u32,
    ) -> Result<Vec<HotFile>>;

    async fn validation_stats(&self, window: chrono::Duration) -> Result<ValidationStats>;

    /// Retention sweep: delete history rows older than `cutoff`.
    async fn prune_history(&self, cutoff: DateTime<Utc>) -> Result<u64>;

    async fn forget_fingerprint(&self, path: &Path) -> Result<()>;

    async fn count_fingerprints(&self) -> Result<u64>;
}
