use std::fmt;
use std::path::{Path, PathBuf};
use std::time::Duration;

use async_trait::async_trait;
use chrono::{DateTime, Utc};
use sqlx::SqlitePool;
use sqlx::sqlite::{
    SqliteConnectOptions, SqliteJournalMode, SqlitePoolOptions, SqliteSynchronous,
};
use tracing::{debug, info};

use crate::config::StoreConfig;
use crate::error::Result;
use crate::types::{ContentHash, FileFingerprint, ValidationRecord};

use super::{FingerprintStore, HotFile, ValidationStats};

/// Fingerprint store backed by an embedded SQLite database.
///
/// WAL journaling with `synchronous = FULL` makes each committed write
/// durable before the call returns.
#[derive(Clone)]
pub struct SqliteFingerprintStore {
    pool: SqlitePool,
}

impl fmt::Debug for SqliteFingerprintStore {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.debug_struct("SqliteFingerprintStore")
            .field("pool_size", &self.pool.size())
            .field("idle_connections", &self.pool.num_idle())
            .finish()
    }
}

#[derive(sqlx::FromRow)]
struct FingerprintRow {
    path: String,
    content_hash: String,
    size_bytes: i64,
    captured_at_ms: i64,
}

impl From<FingerprintRow> for FileFingerprint {
    fn from(row: FingerprintRow) -> Self {
        FileFingerprint {
            path: PathBuf::from(row.path),
            content_hash: ContentHash::new(row.content_hash),
            size_bytes: row.size_bytes.max(0) as u64,
            captured_at: from_millis(row.captured_at_ms),
        }
    }
}

#[derive(sqlx::FromRow)]
struct ValidationRow {
    path: String,
    content_hash: String,
    validated_at_ms: i64,
    finding_count: i64,
    passed: i64,
    duration_ms: i64,
}

impl From<ValidationRow> for ValidationRecord {
    fn from(row: ValidationRow) -> Self {
        ValidationRecord {
            path: PathBuf::from(row.path),
            content_hash: ContentHash::new(row.content_hash),
            timestamp: from_millis(row.validated_at_ms),
            finding_count: row.finding_count.clamp(0, i64::from(u32::MAX)) as u32,
            passed: row.passed != 0,
            duration_ms: row.duration_ms.max(0) as u64,
        }
    }
}

#[derive(sqlx::FromRow)]
struct HotFileRow {
    path: String,
    runs: i64,
}

#[derive(sqlx::FromRow)]
struct StatsRow {
    runs: i64,
    passed: Option<i64>,
    mean_duration_ms: Option<f64>,
}

impl SqliteFingerprintStore {
    /// Open (or create) the database file and apply migrations.
    pub async fn open(path: &Path, config: &StoreConfig) -> Result<Self> {
        if let Some(parent) = path.parent()
            && !parent.as_os_str().is_empty()
        {
            tokio::fs::create_dir_all(parent).await?;
        }

        let options = SqliteConnectOptions::new()
            .filename(path)
            .create_if_missing(true)
            .journal_mode(SqliteJournalMode::Wal)
            .synchronous(SqliteSynchronous::Full)
            .busy_timeout(Duration::from_millis(config.busy_timeout_ms));

        let pool = SqlitePoolOptions::new()
            .max_connections(4)
            .connect_with(options)
            .await?;

        crate::MIGRATOR.run(&pool).await?;
        info!(target: "vigil::store", path = %path.display(), "fingerprint store ready");

        Ok(Self { pool })
    }

    pub fn pool(&self) -> &SqlitePool {
        &self.pool
    }

    pub async fn close(&self) {
        self.pool.close().await;
    }
}

#[async_trait]
impl FingerprintStore for SqliteFingerprintStore {
    async fn put(&self, fingerprint: &FileFingerprint) -> Result<()> {
        sqlx::query(
            r#"
            INSERT INTO file_fingerprints (path, content_hash, size_bytes, captured_at_ms)
            VALUES (?1, ?2, ?3, ?4)
            ON CONFLICT(path) DO UPDATE SET
                content_hash = excluded.content_hash,
                size_bytes = excluded.size_bytes,
                captured_at_ms = excluded.captured_at_ms
            "#,
        )
        .bind(path_key(&fingerprint.path))
        .bind(fingerprint.content_hash.as_str())
        .bind(to_i64(fingerprint.size_bytes))
        .bind(fingerprint.captured_at.timestamp_millis())
        .execute(&self.pool)
        .await?;
        Ok(())
    }

    async fn last_fingerprint(&self, path: &Path) -> Result<Option<FileFingerprint>> {
        let row = sqlx::query_as::<_, FingerprintRow>(
            r#"
            SELECT path, content_hash, size_bytes, captured_at_ms
            FROM file_fingerprints
            WHERE path = ?1
            "#,
        )
        .bind(path_key(path))
        .fetch_optional(&self.pool)
        .await?;
        Ok(row.map(FileFingerprint::from))
    }

    async fn record_validation(&self, record: &ValidationRecord) -> Result<()> {
        sqlx::query(
            r#"
            INSERT INTO validation_history
                (path, content_hash, validated_at_ms, finding_count, passed, duration_ms)
            VALUES (?1, ?2, ?3, ?4, ?5, ?6)
            "#,
        )
        .bind(path_key(&record.path))
        .bind(record.content_hash.as_str())
        .bind(record.timestamp.timestamp_millis())
        .bind(i64::from(record.finding_count))
        .bind(i64::from(record.passed))
        .bind(to_i64(record.duration_ms))
        .execute(&self.pool)
        .await?;
        Ok(())
    }

    async fn last_validation(&self, path: &Path) -> Result<Option<ValidationRecord>> {
        let row = sqlx::query_as::<_, ValidationRow>(
            r#"
            SELECT path, content_hash, validated_at_ms, finding_count, passed, duration_ms
            FROM validation_history
            WHERE path = ?1
            ORDER BY validated_at_ms DESC, id DESC
            LIMIT 1
            "#,
        )
        .bind(path_key(path))
        .fetch_optional(&self.pool)
        .await?;
        Ok(row.map(ValidationRecord::from))
    }

    async fn last_validation_for_hash(
        &self,
        hash: &ContentHash,
    ) -> Result<Option<ValidationRecord>> {
        let row = sqlx::query_as::<_, ValidationRow>(
            r#"
            SELECT path, content_hash, validated_at_ms, finding_count, passed, duration_ms
            FROM validation_history
            WHERE content_hash = ?1
            ORDER BY validated_at_ms DESC, id DESC
            LIMIT 1
            "#,
        )
        .bind(hash.as_str())
        .fetch_optional(&self.pool)
        .await?;
        Ok(row.map(ValidationRecord::from))
    }

    async fn hot_files(
        &self,
        window: chrono::Duration,
        min_count: u32,
    ) -> Result<Vec<HotFile>> {
        let since = (Utc::now() - window).timestamp_millis();
        let rows = sqlx::query_as::<_, HotFileRow>(
            r#"
            SELECT path, COUNT(*) AS runs
            FROM validation_history
            WHERE validated_at_ms >= ?1
            GROUP BY path
            HAVING COUNT(*) >= ?2
            ORDER BY runs DESC, path ASC
            "#,
        )
        .bind(since)
        .bind(i64::from(min_count))
        .fetch_all(&self.pool)
        .await?;

        Ok(rows
            .into_iter()
            .map(|row| HotFile {
                path: PathBuf::from(row.path),
                count: row.runs.max(0) as u64,
            })
            .collect())
    }

    async fn validation_stats(&self, window: chrono::Duration) -> Result<ValidationStats> {
        let since = (Utc::now() - window).timestamp_millis();
        let row = sqlx::query_as::<_, StatsRow>(
            r#"
            SELECT COUNT(*) AS runs,
                   SUM(passed) AS passed,
                   AVG(duration_ms) AS mean_duration_ms
            FROM validation_history
            WHERE validated_at_ms >= ?1
            "#,
        )
        .bind(since)
        .fetch_one(&self.pool)
        .await?;

        let runs = row.runs.max(0) as u64;
        let passed = row.passed.unwrap_or(0).max(0) as u64;
        Ok(ValidationStats {
            runs,
            passed,
            failed: runs.saturating_sub(passed),
            mean_duration_ms: row.mean_duration_ms.unwrap_or(0.0),
        })
    }

    async fn prune_history(&self, cutoff: DateTime<Utc>) -> Result<u64> {
        let result = sqlx::query("DELETE FROM validation_history WHERE validated_at_ms < ?1")
            .bind(cutoff.timestamp_millis())
            .execute(&self.pool)
            .await?;
        let removed = result.rows_affected();
        debug!(target: "vigil::store", removed, cutoff = %cutoff, "validation history pruned");
        Ok(removed)
    }

    async fn forget_fingerprint(&self, path: &Path) -> Result<()> {
        sqlx::query("DELETE FROM file_fingerprints WHERE path = ?1")
            .bind(path_key(path))
            .execute(&self.pool)
            .await?;
        Ok(())
    }

    async fn count_fingerprints(&self) -> Result<u64> {
        let count: i64 = sqlx::query_scalar("SELECT COUNT(*) FROM file_fingerprints")
            .fetch_one(&self.pool)
            .await?;
        Ok(count.max(0) as u64)
    }
}

fn path_key(path: &Path) -> String {
    path.to_string_lossy().into_owned()
}

fn to_i64(value: u64) -> i64 {
    i64::try_from(value).unwrap_or(i64::MAX)
}

fn from_millis(ms: i64) -> DateTime<Utc> {
    DateTime::from_timestamp_millis(ms).unwrap_or_default()
}

#[cfg(test)]
mod tests {
    use super::*;
    use chrono::Duration as ChronoDuration;

    async fn open_store(dir: &Path) -> SqliteFingerprintStore {
        SqliteFingerprintStore::open(&dir.join("vigil.db"), &StoreConfig::default())
            .await
            .expect("open store")
    }

    fn record(path: &str, hash: &str, at: DateTime<Utc>, passed: bool) -> ValidationRecord {
        ValidationRecord {
            path: PathBuf::from(path),
            content_hash: ContentHash::new(hash),
            timestamp: at,
            finding_count: u32::from(!passed),
            passed,
            duration_ms: 10,
        }
    }

    #[tokio::test]
    async fn fingerprints_are_latest_wins() {
        let tmp = tempfile::tempdir().expect("tempdir");
        let store = open_store(tmp.path()).await;
        let path = PathBuf::from("/src/a.py");

        for (hash, size) in [("aaa", 3u64), ("bbb", 5u64)] {
            store
                .put(&FileFingerprint {
                    path: path.clone(),
                    content_hash: ContentHash::new(hash),
                    size_bytes: size,
                    captured_at: Utc::now(),
                })
                .await
                .expect("put");
        }

        let latest = store
            .last_fingerprint(&path)
            .await
            .expect("query")
            .expect("fingerprint present");
        assert_eq!(latest.content_hash.as_str(), "bbb");
        assert_eq!(latest.size_bytes, 5);
        assert_eq!(store.count_fingerprints().await.expect("count"), 1);
    }

    #[tokio::test]
    async fn fingerprints_survive_reopen() {
        let tmp = tempfile::tempdir().expect("tempdir");
        let path = PathBuf::from("/src/durable.py");
        {
            let store = open_store(tmp.path()).await;
            store
                .put(&FileFingerprint {
                    path: path.clone(),
                    content_hash: ContentHash::new("ccc"),
                    size_bytes: 1,
                    captured_at: Utc::now(),
                })
                .await
                .expect("put");
            store.close().await;
        }

        let reopened = open_store(tmp.path()).await;
        assert!(reopened.last_fingerprint(&path).await.expect("query").is_some());
    }

    #[tokio::test]
    async fn last_validation_prefers_newest_row() {
        let tmp = tempfile::tempdir().expect("tempdir");
        let store = open_store(tmp.path()).await;
        let now = Utc::now();

        store
            .record_validation(&record("a.py", "h1", now - ChronoDuration::minutes(5), false))
            .await
            .expect("record");
        store
            .record_validation(&record("a.py", "h2", now, true))
            .await
            .expect("record");

        let last = store
            .last_validation(Path::new("a.py"))
            .await
            .expect("query")
            .expect("present");
        assert_eq!(last.content_hash.as_str(), "h2");
        assert!(last.passed);

        let by_hash = store
            .last_validation_for_hash(&ContentHash::new("h1"))
            .await
            .expect("query")
            .expect("present");
        assert!(!by_hash.passed);
    }

    #[tokio::test]
    async fn hot_files_and_stats_respect_window() {
        let tmp = tempfile::tempdir().expect("tempdir");
        let store = open_store(tmp.path()).await;
        let now = Utc::now();

        for _ in 0..3 {
            store
                .record_validation(&record("hot.py", "h", now, true))
                .await
                .expect("record");
        }
        store
            .record_validation(&record("cold.py", "c", now, false))
            .await
            .expect("record");
        store
            .record_validation(&record("old.py", "o", now - ChronoDuration::days(3), true))
            .await
            .expect("record");

        let hot = store
            .hot_files(ChronoDuration::hours(1), 2)
            .await
            .expect("hot files");
        assert_eq!(
            hot,
            vec![HotFile {
                path: PathBuf::from("hot.py"),
                count: 3
            }]
        );

        let stats = store
            .validation_stats(ChronoDuration::hours(1))
            .await
            .expect("stats");
        assert_eq!(stats.runs, 4);
        assert_eq!(stats.passed, 3);
        assert_eq!(stats.failed, 1);
        assert_eq!(stats.success_rate(), Some(0.75));
    }

    #[tokio::test]
    async fn retention_sweep_removes_only_old_rows() {
        let tmp = tempfile::tempdir().expect("tempdir");
        let store = open_store(tmp.path()).await;
        let now = Utc::now();

        store
            .record_validation(&record("a.py", "old", now - ChronoDuration::days(40), true))
            .await
            .expect("record");
        store
            .record_validation(&record("a.py", "new", now, true))
            .await
            .expect("record");

        let removed = store
            .prune_history(now - ChronoDuration::days(30))
            .await
            .expect("prune");
        assert_eq!(removed, 1);
        assert!(
            store
                .last_validation_for_hash(&ContentHash::new("old"))
                .await
                .expect("query")
                .is_none()
        );
    }

    #[tokio::test]
    async fn empty_window_has_no_success_rate() {
        let tmp = tempfile::tempdir().expect("tempdir");
        let store = open_store(tmp.path()).await;
        let stats = store
            .validation_stats(ChronoDuration::hours(1))
            .await
            .expect("stats");
        assert_eq!(stats.runs, 0);
        assert_eq!(stats.success_rate(), None);
    }
}
