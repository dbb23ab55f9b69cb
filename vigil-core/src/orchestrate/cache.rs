//! Content-addressed result cache.
//!
//! Keys are the content hash, so a hit can never be stale for the bytes it
//! describes. Entries live in a `cacache` directory; TTL is checked on read
//! against the index write time and a periodic sweep enforces TTL and the
//! size cap (oldest first).

use std::path::{Path, PathBuf};
use std::sync::atomic::{AtomicU64, Ordering};
use std::time::Instant;

use tokio::sync::Mutex;
use tracing::{debug, info, warn};

use crate::config::CacheConfig;
use crate::error::{PipelineError, Result};
use crate::types::{ContentHash, Finding};

const KEY_PREFIX: &str = "findings/v1/";

#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum EvictionReason {
    TtlExpired,
    OverSizeCap,
}

#[derive(Debug, Clone)]
pub struct CacheEntryInfo {
    pub key: String,
    pub size_bytes: u64,
    pub written_at_ms: u64,
}

#[derive(Debug, Clone)]
pub struct PlannedEviction {
    pub key: String,
    pub size_bytes: u64,
    pub reason: EvictionReason,
}

#[derive(Debug, Default)]
pub struct EvictionPlan {
    pub planned: Vec<PlannedEviction>,
    pub total_bytes_before: u64,
    pub total_bytes_after: u64,
}

/// Outcome of one [`ResultCache::cleanup_once`] pass.
#[derive(Debug, Default, Clone, Copy, PartialEq, Eq)]
pub struct CleanupSummary {
    pub entries_seen: usize,
    pub removed_ttl: usize,
    pub removed_size: usize,
    pub bytes_after: u64,
}

/// TTL first, then oldest-written until the total fits under `max_bytes`.
/// A zero `ttl_ms` or `max_bytes` disables that half of the plan.
pub fn plan_evictions(
    entries: Vec<CacheEntryInfo>,
    now_ms: u64,
    ttl_ms: u64,
    max_bytes: u64,
) -> EvictionPlan {
    let mut plan = EvictionPlan::default();
    let mut total_bytes: u64 = entries.iter().map(|e| e.size_bytes).sum();
    plan.total_bytes_before = total_bytes;

    let (expired, mut kept): (Vec<_>, Vec<_>) = entries
        .into_iter()
        .partition(|e| ttl_ms > 0 && now_ms.saturating_sub(e.written_at_ms) > ttl_ms);

    for e in expired {
        total_bytes = total_bytes.saturating_sub(e.size_bytes);
        plan.planned.push(PlannedEviction {
            key: e.key,
            size_bytes: e.size_bytes,
            reason: EvictionReason::TtlExpired,
        });
    }

    if max_bytes > 0 && total_bytes > max_bytes {
        kept.sort_by_key(|e| e.written_at_ms);
        for e in kept {
            if total_bytes <= max_bytes {
                break;
            }
            total_bytes = total_bytes.saturating_sub(e.size_bytes);
            plan.planned.push(PlannedEviction {
                key: e.key,
                size_bytes: e.size_bytes,
                reason: EvictionReason::OverSizeCap,
            });
        }
    }

    plan.total_bytes_after = total_bytes;
    plan
}

#[derive(Debug)]
pub struct ResultCache {
    root: PathBuf,
    ttl_ms: u64,
    max_bytes: u64,
    usage_bytes: AtomicU64,
    cleanup_lock: Mutex<()>,
}

impl ResultCache {
    pub fn open(root: impl Into<PathBuf>, config: &CacheConfig) -> Result<Self> {
        let root = root.into();
        std::fs::create_dir_all(&root)?;
        Ok(Self {
            root,
            ttl_ms: config.ttl().as_millis().min(u128::from(u64::MAX)) as u64,
            max_bytes: config.max_bytes,
            usage_bytes: AtomicU64::new(0),
            cleanup_lock: Mutex::new(()),
        })
    }

    pub fn root(&self) -> &Path {
        &self.root
    }

    pub fn key_for(hash: &ContentHash) -> String {
        format!("{KEY_PREFIX}{hash}")
    }

    /// Cached findings for `hash`, or `None` on miss or expiry.
    pub async fn get(&self, hash: &ContentHash) -> Result<Option<Vec<Finding>>> {
        let key = Self::key_for(hash);
        let meta = cacache::metadata(&self.root, &key)
            .await
            .map_err(|e| PipelineError::Cache(format!("cacache metadata failed: {e}")))?;
        let Some(meta) = meta else {
            return Ok(None);
        };

        let written_at_ms = u64::try_from(meta.time).unwrap_or(u64::MAX);
        if self.ttl_ms > 0 && unix_ms_now().saturating_sub(written_at_ms) > self.ttl_ms {
            debug!(target: "vigil::orchestrate", hash = %hash.short(), "cache entry expired");
            self.remove_key(&key, meta.size as u64).await;
            return Ok(None);
        }

        let bytes = match cacache::read(&self.root, &key).await {
            Ok(bytes) => bytes,
            Err(cacache::Error::EntryNotFound(_, _)) => return Ok(None),
            Err(e) => return Err(PipelineError::Cache(format!("cacache read failed: {e}"))),
        };

        match serde_json::from_slice::<Vec<Finding>>(&bytes) {
            Ok(findings) => Ok(Some(findings)),
            Err(err) => {
                warn!(target: "vigil::orchestrate", hash = %hash.short(), error = %err, "dropping undecodable cache entry");
                self.remove_key(&key, bytes.len() as u64).await;
                Ok(None)
            }
        }
    }

    pub async fn put(&self, hash: &ContentHash, findings: &[Finding]) -> Result<()> {
        let key = Self::key_for(hash);
        let bytes = serde_json::to_vec(findings)?;
        cacache::write(&self.root, &key, &bytes)
            .await
            .map_err(|e| PipelineError::Cache(format!("cacache write failed: {e}")))?;

        let usage = self
            .usage_bytes
            .fetch_add(bytes.len() as u64, Ordering::Relaxed)
            + bytes.len() as u64;
        if self.max_bytes > 0 && usage > self.max_bytes {
            self.cleanup_once().await;
        }
        Ok(())
    }

    /// Drop every entry and its content.
    pub async fn clear(&self) -> Result<()> {
        let _guard = self.cleanup_lock.lock().await;
        cacache::clear(&self.root)
            .await
            .map_err(|e| PipelineError::Cache(format!("cacache clear failed: {e}")))?;
        self.usage_bytes.store(0, Ordering::Relaxed);
        info!(target: "vigil::orchestrate", root = %self.root.display(), "result cache cleared");
        Ok(())
    }

    pub async fn entry_count(&self) -> Result<usize> {
        Ok(self.list_entries().await?.len())
    }

    /// Entry count and total bytes from the index. The in-process counter
    /// starts at zero on open.
    pub async fn disk_usage(&self) -> Result<(usize, u64)> {
        let entries = self.list_entries().await?;
        let bytes = entries.iter().map(|entry| entry.size_bytes).sum();
        Ok((entries.len(), bytes))
    }

    pub fn usage_bytes(&self) -> u64 {
        self.usage_bytes.load(Ordering::Relaxed)
    }

    /// Apply TTL and size-cap evictions. Failures are logged, never raised.
    pub async fn cleanup_once(&self) -> CleanupSummary {
        let _guard = self.cleanup_lock.lock().await;
        let start = Instant::now();

        let entries = match self.list_entries().await {
            Ok(entries) => entries,
            Err(err) => {
                warn!(target: "vigil::orchestrate", error = %err, "cache index listing failed");
                return CleanupSummary::default();
            }
        };

        let mut summary = CleanupSummary {
            entries_seen: entries.len(),
            ..CleanupSummary::default()
        };

        let plan = plan_evictions(entries, unix_ms_now(), self.ttl_ms, self.max_bytes);
        let mut total_bytes = plan.total_bytes_before;
        for eviction in plan.planned {
            let r_opts = cacache::index::RemoveOpts::new().remove_fully(true);
            if r_opts.remove(&self.root, &eviction.key).await.is_ok() {
                total_bytes = total_bytes.saturating_sub(eviction.size_bytes);
                match eviction.reason {
                    EvictionReason::TtlExpired => summary.removed_ttl += 1,
                    EvictionReason::OverSizeCap => summary.removed_size += 1,
                }
            }
        }

        self.usage_bytes.store(total_bytes, Ordering::Relaxed);
        summary.bytes_after = total_bytes;

        let removed = summary.removed_ttl + summary.removed_size;
        if removed > 0 {
            info!(
                target: "vigil::orchestrate",
                removed,
                ttl = summary.removed_ttl,
                size = summary.removed_size,
                elapsed_ms = start.elapsed().as_millis() as u64,
                "result cache cleanup"
            );
        }
        summary
    }

    async fn list_entries(&self) -> Result<Vec<CacheEntryInfo>> {
        let root = self.root.clone();
        tokio::task::spawn_blocking(move || {
            cacache::index::ls(&root)
                .filter_map(|entry| match entry {
                    Ok(meta) => Some(CacheEntryInfo {
                        size_bytes: meta.size as u64,
                        written_at_ms: u64::try_from(meta.time).unwrap_or(u64::MAX),
                        key: meta.key,
                    }),
                    Err(err) => {
                        warn!(target: "vigil::orchestrate", error = %err, "cache index entry unreadable");
                        None
                    }
                })
                .collect::<Vec<_>>()
        })
        .await
        .map_err(|e| PipelineError::Cache(format!("cache index listing panicked: {e}")))
    }

    async fn remove_key(&self, key: &str, size_bytes: u64) {
        let r_opts = cacache::index::RemoveOpts::new().remove_fully(true);
        match r_opts.remove(&self.root, key).await {
            Ok(()) => {
                let _ = self
                    .usage_bytes
                    .fetch_update(Ordering::Relaxed, Ordering::Relaxed, |v| {
                        Some(v.saturating_sub(size_bytes))
                    });
            }
            Err(e) => {
                warn!(target: "vigil::orchestrate", key, error = %e, "cache entry removal failed");
            }
        }
    }
}

fn unix_ms_now() -> u64 {
    chrono::Utc::now().timestamp_millis().max(0) as u64
}
