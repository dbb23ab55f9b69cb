//! Records that flow between pipeline stages.
//!
//! Everything here is plain data: events are ephemeral, fingerprints and
//! validation records are persisted by the store, work items live between
//! the dispatcher and the orchestrator, and findings are immutable once a
//! validator hands them back.

use std::fmt;
use std::path::PathBuf;
use std::time::Duration;

use chrono::{DateTime, Utc};
use serde::{Deserialize, Serialize};

/// Kind of raw filesystem change observed by the watcher.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, Serialize, Deserialize)]
#[serde(rename_all = "snake_case")]
pub enum ChangeKind {
    Created,
    Modified,
    Deleted,
}

impl fmt::Display for ChangeKind {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        let label = match self {
            ChangeKind::Created => "created",
            ChangeKind::Modified => "modified",
            ChangeKind::Deleted => "deleted",
        };
        f.write_str(label)
    }
}

/// One normalized filesystem notification.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct ChangeEvent {
    pub path: PathBuf,
    pub kind: ChangeKind,
    pub observed_at: DateTime<Utc>,
}

impl ChangeEvent {
    pub fn new(path: impl Into<PathBuf>, kind: ChangeKind) -> Self {
        Self {
            path: path.into(),
            kind,
            observed_at: Utc::now(),
        }
    }

    pub fn created(path: impl Into<PathBuf>) -> Self {
        Self::new(path, ChangeKind::Created)
    }

    pub fn modified(path: impl Into<PathBuf>) -> Self {
        Self::new(path, ChangeKind::Modified)
    }

    pub fn deleted(path: impl Into<PathBuf>) -> Self {
        Self::new(path, ChangeKind::Deleted)
    }
}

/// Hex-encoded SHA-256 of a file's bytes.
#[derive(Clone, PartialEq, Eq, Hash, PartialOrd, Ord, Serialize, Deserialize)]
#[serde(transparent)]
pub struct ContentHash(String);

impl ContentHash {
    const ZERO: &'static str =
        "0000000000000000000000000000000000000000000000000000000000000000";

    pub fn new(hex: impl Into<String>) -> Self {
        Self(hex.into())
    }

    /// Placeholder used when the content could not be read.
    pub fn empty() -> Self {
        Self(Self::ZERO.to_string())
    }

    pub fn is_empty(&self) -> bool {
        self.0 == Self::ZERO
    }

    pub fn as_str(&self) -> &str {
        &self.0
    }

    /// Short prefix for log lines.
    pub fn short(&self) -> &str {
        &self.0[..self.0.len().min(12)]
    }
}

impl fmt::Debug for ContentHash {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.debug_tuple("ContentHash").field(&self.short()).finish()
    }
}

impl fmt::Display for ContentHash {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.write_str(&self.0)
    }
}

/// Last known content hash/size/time for a path. Superseded, never mutated.
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct FileFingerprint {
    pub path: PathBuf,
    pub content_hash: ContentHash,
    pub size_bytes: u64,
    pub captured_at: DateTime<Utc>,
}

/// Append-only history row written after every completed validation run.
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct ValidationRecord {
    pub path: PathBuf,
    pub content_hash: ContentHash,
    pub timestamp: DateTime<Utc>,
    pub finding_count: u32,
    pub passed: bool,
    pub duration_ms: u64,
}

/// Why a work item was produced.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, Serialize, Deserialize)]
#[serde(rename_all = "snake_case")]
pub enum WorkReason {
    /// No fingerprint existed for the path.
    NewFile,
    /// Structured config formats are validated on every content change.
    AlwaysValidate,
    /// Edit magnitude crossed the sensitivity threshold.
    EditMagnitude,
    /// Last validation is older than the staleness threshold.
    Stale,
    /// Reading, hashing or a history lookup failed; re-validate rather than skip.
    ReadFailure,
    /// Operator-forced rescan.
    Rescan,
}

impl fmt::Display for WorkReason {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        let label = match self {
            WorkReason::NewFile => "new_file",
            WorkReason::AlwaysValidate => "always_validate",
            WorkReason::EditMagnitude => "edit_magnitude",
            WorkReason::Stale => "stale",
            WorkReason::ReadFailure => "read_failure",
            WorkReason::Rescan => "rescan",
        };
        f.write_str(label)
    }
}

/// One unit of validation work for one path at one content hash.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct WorkItem {
    pub path: PathBuf,
    pub content_hash: ContentHash,
    pub enqueued_at: DateTime<Utc>,
    pub reason: WorkReason,
    /// Monotonically increasing across the dispatcher's lifetime.
    pub sequence: u64,
}

/// Finding severity. Declaration order is the report order.
#[derive(
    Debug, Clone, Copy, PartialEq, Eq, Hash, PartialOrd, Ord, Serialize, Deserialize,
)]
#[serde(rename_all = "snake_case")]
pub enum Severity {
    Error,
    Warning,
    Info,
}

impl Severity {
    pub const ALL: [Severity; 3] = [Severity::Error, Severity::Warning, Severity::Info];
}

impl fmt::Display for Severity {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        let label = match self {
            Severity::Error => "error",
            Severity::Warning => "warning",
            Severity::Info => "info",
        };
        f.write_str(label)
    }
}

/// One reported issue from one validator.
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct Finding {
    /// Validator id that produced the finding.
    pub source: String,
    pub severity: Severity,
    pub message: String,
    pub path: PathBuf,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub line: Option<u32>,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub rule_id: Option<String>,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub fix_suggestion: Option<String>,
}

impl Finding {
    pub fn new(
        source: impl Into<String>,
        severity: Severity,
        message: impl Into<String>,
        path: impl Into<PathBuf>,
    ) -> Self {
        Self {
            source: source.into(),
            severity,
            message: message.into(),
            path: path.into(),
            line: None,
            rule_id: None,
            fix_suggestion: None,
        }
    }

    pub fn with_line(mut self, line: u32) -> Self {
        self.line = Some(line);
        self
    }

    pub fn with_rule(mut self, rule_id: impl Into<String>) -> Self {
        self.rule_id = Some(rule_id.into());
        self
    }

    pub fn with_fix(mut self, fix: impl Into<String>) -> Self {
        self.fix_suggestion = Some(fix.into());
        self
    }

    pub fn is_error(&self) -> bool {
        self.severity == Severity::Error
    }
}

/// Point-in-time health sample. Recomputed on an interval, never persisted
/// beyond the status file.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct HealthSnapshot {
    #[serde(with = "duration_secs")]
    pub uptime: Duration,
    pub queue_depth: u64,
    pub memory_pct: f32,
    pub cpu_pct: f32,
    pub files_watched: u64,
    pub completed: u64,
    pub failed: u64,
    pub crashes_recovered: u32,
    pub sampled_at: DateTime<Utc>,
}

impl Default for HealthSnapshot {
    fn default() -> Self {
        Self {
            uptime: Duration::ZERO,
            queue_depth: 0,
            memory_pct: 0.0,
            cpu_pct: 0.0,
            files_watched: 0,
            completed: 0,
            failed: 0,
            crashes_recovered: 0,
            sampled_at: Utc::now(),
        }
    }
}

mod duration_secs {
    use std::time::Duration;

    use serde::{Deserialize, Deserializer, Serializer};

    pub fn serialize<S: Serializer>(value: &Duration, serializer: S) -> Result<S::Ok, S::Error> {
        serializer.serialize_u64(value.as_secs())
    }

    pub fn deserialize<'de, D: Deserializer<'de>>(deserializer: D) -> Result<Duration, D::Error> {
        u64::deserialize(deserializer).map(Duration::from_secs)
    }
}
