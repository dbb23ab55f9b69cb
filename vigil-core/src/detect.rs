//! Change detector: decides whether a filesystem event is worth validating.
//!
//! The verdict consults the fingerprint store (prior hash, prior validations)
//! and a pair of cheap edit-magnitude signals. The store is updated with the
//! freshly observed fingerprint whatever the verdict, so it always reflects
//! what is on disk. Read and lookup failures fail open toward re-validation.

use std::fmt;
use std::path::{Path, PathBuf};
use std::sync::Arc;

use chrono::{DateTime, Utc};
use regex::Regex;
use tracing::{debug, trace, warn};

use crate::config::DetectorConfig;
use crate::error::{PipelineError, Result, retry_once};
use crate::hash::{HashedContent, read_and_hash};
use crate::store::FingerprintStore;
use crate::types::{ChangeEvent, ChangeKind, ContentHash, FileFingerprint, WorkReason};
use crate::watch::file_extension;

/// Why an event was dropped.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum DropReason {
    /// Deletions never trigger validation.
    Deleted,
    /// The path no longer resolves.
    Vanished,
    /// Same hash as the stored fingerprint (metadata-only churn).
    Unchanged,
    /// This exact content was validated recently.
    RecentlyValidated,
    /// Edit magnitude below the sensitivity threshold.
    BelowThreshold,
}

/// A change judged worth validating.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct SignificantChange {
    pub path: PathBuf,
    pub content_hash: ContentHash,
    pub reason: WorkReason,
    pub observed_at: DateTime<Utc>,
}

#[derive(Debug, Clone, PartialEq, Eq)]
pub enum Verdict {
    Drop(DropReason),
    Significant(SignificantChange),
}

impl Verdict {
    pub fn is_significant(&self) -> bool {
        matches!(self, Verdict::Significant(_))
    }
}

/// Cheap signals describing how large an edit was.
#[derive(Debug, Clone, Copy, PartialEq)]
pub struct EditMagnitude {
    pub size_delta_ratio: f64,
    pub keyword_density: f64,
}

pub struct ChangeDetector {
    store: Arc<dyn FingerprintStore>,
    config: DetectorConfig,
    keywords: Option<Regex>,
}

impl fmt::Debug for ChangeDetector {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.debug_struct("ChangeDetector")
            .field("config", &self.config)
            .field("keyword_regex", &self.keywords.is_some())
            .finish()
    }
}

impl ChangeDetector {
    pub fn new(store: Arc<dyn FingerprintStore>, config: DetectorConfig) -> Result<Self> {
        let keywords = keyword_regex(&config.sensitive_keywords)?;
        Ok(Self {
            store,
            config,
            keywords,
        })
    }

    pub async fn assess(&self, event: &ChangeEvent) -> Verdict {
        if event.kind == ChangeKind::Deleted {
            if let Err(err) = self.store.forget_fingerprint(&event.path).await {
                warn!(target: "vigil::detect", path = %event.path.display(), error = %err, "failed to forget fingerprint for deleted path");
            }
            return Verdict::Drop(DropReason::Deleted);
        }

        let content = match retry_once(|| read_and_hash(&event.path)).await {
            Ok(Some(content)) => content,
            Ok(None) => {
                trace!(target: "vigil::detect", path = %event.path.display(), "path vanished before hashing");
                return Verdict::Drop(DropReason::Vanished);
            }
            Err(err) => {
                warn!(target: "vigil::detect", path = %event.path.display(), error = %err, "hashing failed; treating change as significant");
                return self.significant(event, ContentHash::empty(), WorkReason::ReadFailure);
            }
        };

        let verdict = self.classify(event, &content).await;
        self.persist(&event.path, &content).await;

        debug!(
            target: "vigil::detect",
            path = %event.path.display(),
            kind = %event.kind,
            hash = %content.hash.short(),
            significant = verdict.is_significant(),
            "change assessed"
        );
        verdict
    }

    /// Bypass the heuristics (operator-forced rescan). Still records the
    /// fingerprint.
    pub async fn assess_forced(&self, path: &Path) -> Verdict {
        let event = ChangeEvent::modified(path);
        match retry_once(|| read_and_hash(path)).await {
            Ok(Some(content)) => {
                self.persist(path, &content).await;
                self.significant(&event, content.hash, WorkReason::Rescan)
            }
            Ok(None) => Verdict::Drop(DropReason::Vanished),
            Err(err) => {
                warn!(target: "vigil::detect", path = %path.display(), error = %err, "hashing failed during rescan");
                self.significant(&event, ContentHash::empty(), WorkReason::ReadFailure)
            }
        }
    }

    async fn classify(&self, event: &ChangeEvent, content: &HashedContent) -> Verdict {
        let prior = match retry_once(|| self.store.last_fingerprint(&event.path)).await {
            Ok(Some(prior)) => prior,
            Ok(None) => {
                return self.significant(event, content.hash.clone(), WorkReason::NewFile);
            }
            Err(err) => {
                warn!(target: "vigil::detect", path = %event.path.display(), error = %err, "fingerprint lookup failed; treating change as significant");
                return self.significant(event, content.hash.clone(), WorkReason::ReadFailure);
            }
        };

        if prior.content_hash == content.hash {
            return Verdict::Drop(DropReason::Unchanged);
        }

        let now = Utc::now();
        match self.store.last_validation_for_hash(&content.hash).await {
            Ok(Some(record)) if now - record.timestamp < self.config.revalidate_after() => {
                return Verdict::Drop(DropReason::RecentlyValidated);
            }
            Ok(_) => {}
            Err(err) => {
                debug!(target: "vigil::detect", error = %err, "hash history lookup failed; continuing");
            }
        }

        let stale = match self.store.last_validation(&event.path).await {
            Ok(Some(record)) => now - record.timestamp > self.config.stale_after(),
            Ok(None) => true,
            Err(err) => {
                warn!(target: "vigil::detect", path = %event.path.display(), error = %err, "validation history lookup failed; treating change as significant");
                true
            }
        };
        if stale {
            return self.significant(event, content.hash.clone(), WorkReason::Stale);
        }

        if self.is_always_validate(&event.path) {
            return self.significant(event, content.hash.clone(), WorkReason::AlwaysValidate);
        }

        let magnitude = self.magnitude(prior.size_bytes, content);
        let sensitivity = self.config.sensitivity;
        if magnitude.size_delta_ratio >= sensitivity.min_size_delta_ratio
            || magnitude.keyword_density >= sensitivity.min_keyword_density
        {
            return self.significant(event, content.hash.clone(), WorkReason::EditMagnitude);
        }

        trace!(
            target: "vigil::detect",
            path = %event.path.display(),
            size_delta_ratio = magnitude.size_delta_ratio,
            keyword_density = magnitude.keyword_density,
            "edit below sensitivity threshold"
        );
        Verdict::Drop(DropReason::BelowThreshold)
    }

    pub fn magnitude(&self, prior_size: u64, content: &HashedContent) -> EditMagnitude {
        let new_size = content.size_bytes();
        let size_delta_ratio = new_size.abs_diff(prior_size) as f64 / prior_size.max(1) as f64;

        let keyword_density = match &self.keywords {
            Some(regex) => {
                let text = content.text();
                let lines = text.lines().filter(|line| !line.trim().is_empty()).count();
                let hits = regex.find_iter(&text).count();
                hits as f64 / lines.max(1) as f64
            }
            None => 0.0,
        };

        EditMagnitude {
            size_delta_ratio,
            keyword_density,
        }
    }

    fn is_always_validate(&self, path: &Path) -> bool {
        file_extension(path).is_some_and(|ext| {
            self.config
                .always_validate_extensions
                .iter()
                .any(|candidate| candidate.eq_ignore_ascii_case(&ext))
        })
    }

    async fn persist(&self, path: &Path, content: &HashedContent) {
        let fingerprint = FileFingerprint {
            path: path.to_path_buf(),
            content_hash: content.hash.clone(),
            size_bytes: content.size_bytes(),
            captured_at: Utc::now(),
        };
        if let Err(err) = retry_once(|| self.store.put(&fingerprint)).await {
            warn!(target: "vigil::detect", path = %path.display(), error = %err, "failed to persist fingerprint");
        }
    }

    fn significant(&self, event: &ChangeEvent, hash: ContentHash, reason: WorkReason) -> Verdict {
        Verdict::Significant(SignificantChange {
            path: event.path.clone(),
            content_hash: hash,
            reason,
            observed_at: event.observed_at,
        })
    }
}

fn keyword_regex(keywords: &[String]) -> Result<Option<Regex>> {
    let escaped: Vec<String> = keywords
        .iter()
        .map(|kw| kw.trim())
        .filter(|kw| !kw.is_empty())
        .map(regex::escape)
        .collect();
    if escaped.is_empty() {
        return Ok(None);
    }

    let pattern = format!(r"\b(?:{})\b", escaped.join("|"));
    Regex::new(&pattern)
        .map(Some)
        .map_err(|err| PipelineError::Config(format!("invalid sensitive keyword set: {err}")))
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::config::{SensitivityConfig, StoreConfig};
    use crate::store::SqliteFingerprintStore;
    use crate::types::ValidationRecord;

    struct Fixture {
        _tmp: tempfile::TempDir,
        root: PathBuf,
        store: Arc<SqliteFingerprintStore>,
        detector: ChangeDetector,
    }

    async fn fixture(config: DetectorConfig) -> Fixture {
        let tmp = tempfile::tempdir().expect("tempdir");
        let root = tmp.path().join("src");
        std::fs::create_dir_all(&root).expect("mkdir");
        let store = Arc::new(
            SqliteFingerprintStore::open(&tmp.path().join("vigil.db"), &StoreConfig::default())
                .await
                .expect("open store"),
        );
        let detector = ChangeDetector::new(store.clone(), config).expect("detector");
        Fixture {
            _tmp: tmp,
            root,
            store,
            detector,
        }
    }

    async fn mark_validated(store: &SqliteFingerprintStore, path: &Path, hash: &ContentHash) {
        store
            .record_validation(&ValidationRecord {
                path: path.to_path_buf(),
                content_hash: hash.clone(),
                timestamp: Utc::now(),
                finding_count: 0,
                passed: true,
                duration_ms: 1,
            })
            .await
            .expect("record validation");
    }

    #[tokio::test]
    async fn deleted_events_are_dropped() {
        let fx = fixture(DetectorConfig::default()).await;
        let verdict = fx
            .detector
            .assess(&ChangeEvent::deleted(fx.root.join("gone.py")))
            .await;
        assert_eq!(verdict, Verdict::Drop(DropReason::Deleted));
    }

    #[tokio::test]
    async fn new_files_are_significant_and_fingerprinted() {
        let fx = fixture(DetectorConfig::default()).await;
        let path = fx.root.join("a.py");
        std::fs::write(&path, "print('hi')\n").expect("write");

        let verdict = fx.detector.assess(&ChangeEvent::created(&path)).await;
        match verdict {
            Verdict::Significant(change) => assert_eq!(change.reason, WorkReason::NewFile),
            other => panic!("expected significant, got {other:?}"),
        }
        assert!(fx.store.last_fingerprint(&path).await.expect("query").is_some());
    }

    #[tokio::test]
    async fn touch_without_edit_is_dropped() {
        let fx = fixture(DetectorConfig::default()).await;
        let path = fx.root.join("a.py");
        std::fs::write(&path, "x = 1\n").expect("write");

        fx.detector.assess(&ChangeEvent::created(&path)).await;
        let verdict = fx.detector.assess(&ChangeEvent::modified(&path)).await;
        assert_eq!(verdict, Verdict::Drop(DropReason::Unchanged));
    }

    #[tokio::test]
    async fn vanished_paths_are_dropped() {
        let fx = fixture(DetectorConfig::default()).await;
        let verdict = fx
            .detector
            .assess(&ChangeEvent::modified(fx.root.join("never.py")))
            .await;
        assert_eq!(verdict, Verdict::Drop(DropReason::Vanished));
    }

    #[tokio::test]
    async fn recently_validated_content_is_dropped() {
        let fx = fixture(DetectorConfig::default()).await;
        let path = fx.root.join("a.py");
        std::fs::write(&path, "x = 1\n").expect("write");
        fx.detector.assess(&ChangeEvent::created(&path)).await;

        std::fs::write(&path, "x = 2\nreturn\n").expect("write");
        let hash = crate::hash::hash_bytes(b"x = 2\nreturn\n");
        mark_validated(&fx.store, &fx.root.join("b.py"), &hash).await;

        let verdict = fx.detector.assess(&ChangeEvent::modified(&path)).await;
        assert_eq!(verdict, Verdict::Drop(DropReason::RecentlyValidated));
    }

    #[tokio::test]
    async fn never_validated_paths_count_as_stale() {
        let fx = fixture(DetectorConfig::default()).await;
        let path = fx.root.join("a.py");
        std::fs::write(&path, "x = 1\n").expect("write");
        fx.detector.assess(&ChangeEvent::created(&path)).await;

        std::fs::write(&path, "x = 3\n").expect("write");
        match fx.detector.assess(&ChangeEvent::modified(&path)).await {
            Verdict::Significant(change) => assert_eq!(change.reason, WorkReason::Stale),
            other => panic!("expected stale significance, got {other:?}"),
        }
    }

    #[tokio::test]
    async fn small_edits_fall_below_threshold_after_recent_validation() {
        let config = DetectorConfig {
            sensitivity: SensitivityConfig {
                min_size_delta_ratio: 0.5,
                min_keyword_density: 10.0,
            },
            ..DetectorConfig::default()
        };
        let fx = fixture(config).await;
        let path = fx.root.join("a.py");
        std::fs::write(&path, "value = 1000\n").expect("write");
        fx.detector.assess(&ChangeEvent::created(&path)).await;
        let first = crate::hash::hash_bytes(b"value = 1000\n");
        mark_validated(&fx.store, &path, &first).await;

        std::fs::write(&path, "value = 1001\n").expect("write");
        let verdict = fx.detector.assess(&ChangeEvent::modified(&path)).await;
        assert_eq!(verdict, Verdict::Drop(DropReason::BelowThreshold));

        let stored = fx
            .store
            .last_fingerprint(&path)
            .await
            .expect("query")
            .expect("fingerprint");
        assert_eq!(stored.content_hash, crate::hash::hash_bytes(b"value = 1001\n"));
    }

    #[tokio::test]
    async fn structured_formats_always_validate() {
        let fx = fixture(DetectorConfig::default()).await;
        let path = fx.root.join("settings.json");
        std::fs::write(&path, r#"{"a": 1}"#).expect("write");
        fx.detector.assess(&ChangeEvent::created(&path)).await;
        mark_validated(&fx.store, &path, &crate::hash::hash_bytes(br#"{"a": 1}"#)).await;

        std::fs::write(&path, r#"{"a": 2}"#).expect("write");
        match fx.detector.assess(&ChangeEvent::modified(&path)).await {
            Verdict::Significant(change) => {
                assert_eq!(change.reason, WorkReason::AlwaysValidate)
            }
            other => panic!("expected always-validate, got {other:?}"),
        }
    }

    #[tokio::test]
    async fn large_size_delta_is_significant() {
        let fx = fixture(DetectorConfig::default()).await;
        let path = fx.root.join("a.py");
        std::fs::write(&path, "x = 1\n").expect("write");
        fx.detector.assess(&ChangeEvent::created(&path)).await;
        mark_validated(&fx.store, &path, &crate::hash::hash_bytes(b"x = 1\n")).await;

        std::fs::write(&path, "x = 1\ny = 2\nz = 3\n").expect("write");
        match fx.detector.assess(&ChangeEvent::modified(&path)).await {
            Verdict::Significant(change) => {
                assert_eq!(change.reason, WorkReason::EditMagnitude)
            }
            other => panic!("expected edit magnitude, got {other:?}"),
        }
    }

    #[tokio::test]
    async fn keyword_density_counts_whole_words() {
        let fx = fixture(DetectorConfig::default()).await;
        let content = HashedContent {
            hash: ContentHash::empty(),
            bytes: b"if x:\n    return eval(y)\n\nverify = 1\n".to_vec(),
        };
        let magnitude = fx.detector.magnitude(content.size_bytes(), &content);
        assert_eq!(magnitude.size_delta_ratio, 0.0);
        assert!((magnitude.keyword_density - 1.0).abs() < f64::EPSILON);
    }
}
