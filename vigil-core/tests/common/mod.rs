#![allow(dead_code)]

use std::path::{Path, PathBuf};
use std::sync::Arc;
use std::sync::atomic::{AtomicUsize, Ordering};
use std::time::Duration;

use async_trait::async_trait;
use chrono::Utc;
use tempfile::TempDir;
use vigil_core::config::{CacheConfig, OrchestratorConfig, PolicyRuleConfig, StoreConfig};
use vigil_core::feedback::CollectingNotifier;
use vigil_core::hash::hash_bytes;
use vigil_core::metrics::PipelineMetrics;
use vigil_core::orchestrate::{
    FileContent, Orchestrator, OrchestratorDeps, PolicyContext, ResultCache, ValidationPolicy,
    Validator, ValidatorError, ValidatorRegistry,
};
use vigil_core::store::SqliteFingerprintStore;
use vigil_core::types::{Finding, Severity, WorkItem, WorkReason};

/// Reports one finding per call after an optional delay and counts calls.
pub struct CountingValidator {
    pub id: &'static str,
    pub severity: Severity,
    pub delay: Duration,
    pub calls: AtomicUsize,
}

impl CountingValidator {
    pub fn new(id: &'static str, severity: Severity) -> Arc<Self> {
        Self::slow(id, severity, Duration::ZERO)
    }

    pub fn slow(id: &'static str, severity: Severity, delay: Duration) -> Arc<Self> {
        Arc::new(Self {
            id,
            severity,
            delay,
            calls: AtomicUsize::new(0),
        })
    }

    pub fn calls(&self) -> usize {
        self.calls.load(Ordering::SeqCst)
    }
}

#[async_trait]
impl Validator for CountingValidator {
    fn id(&self) -> &str {
        self.id
    }

    async fn validate(
        &self,
        file: &FileContent,
        _context: &PolicyContext,
    ) -> Result<Vec<Finding>, ValidatorError> {
        self.calls.fetch_add(1, Ordering::SeqCst);
        if !self.delay.is_zero() {
            tokio::time::sleep(self.delay).await;
        }
        Ok(vec![
            Finding::new(self.id, self.severity, format!("{} saw the file", self.id), &file.path)
                .with_line(1),
        ])
    }
}

pub struct ThrowingValidator;

#[async_trait]
impl Validator for ThrowingValidator {
    fn id(&self) -> &str {
        "throws"
    }

    async fn validate(
        &self,
        _file: &FileContent,
        _context: &PolicyContext,
    ) -> Result<Vec<Finding>, ValidatorError> {
        Err(ValidatorError::Failed("upstream model unavailable".into()))
    }
}

pub struct Harness {
    pub tmp: TempDir,
    pub root: PathBuf,
    pub store: Arc<SqliteFingerprintStore>,
    pub cache: Arc<ResultCache>,
    pub metrics: Arc<PipelineMetrics>,
    pub notifier: Arc<CollectingNotifier>,
}

impl Harness {
    pub async fn new() -> Self {
        let tmp = tempfile::tempdir().expect("tempdir");
        let root = tmp.path().join("src");
        std::fs::create_dir_all(&root).expect("create root");
        let store = Arc::new(
            SqliteFingerprintStore::open(&tmp.path().join("vigil.db"), &StoreConfig::default())
                .await
                .expect("open store"),
        );
        let cache = Arc::new(
            ResultCache::open(tmp.path().join("cache"), &CacheConfig::default())
                .expect("open cache"),
        );
        Self {
            tmp,
            root,
            store,
            cache,
            metrics: Arc::new(PipelineMetrics::new()),
            notifier: Arc::new(CollectingNotifier::default()),
        }
    }

    /// Orchestrator routing every file to `validators`, in order.
    pub fn orchestrator(
        &self,
        validators: Vec<Arc<dyn Validator>>,
        max_concurrency: usize,
    ) -> Orchestrator {
        let mut registry = ValidatorRegistry::new();
        let mut ids = Vec::new();
        for validator in validators {
            ids.push(validator.id().to_string());
            registry.register(validator);
        }
        let policy = ValidationPolicy::from_config(
            &[PolicyRuleConfig {
                name: "everything".into(),
                extensions: vec!["*".into()],
                path_contains: Vec::new(),
                validators: ids,
            }],
            &registry,
        )
        .expect("policy");

        let config = OrchestratorConfig {
            max_concurrency,
            validator_timeout_ms: 2_000,
            shutdown_grace_ms: 1_000,
            ..OrchestratorConfig::default()
        };
        Orchestrator::new(
            OrchestratorDeps {
                registry,
                policy,
                cache: Arc::clone(&self.cache),
                store: self.store.clone(),
                notifier: self.notifier.clone(),
                metrics: Arc::clone(&self.metrics),
            },
            &config,
        )
        .expect("orchestrator")
    }

    pub fn write(&self, name: &str, content: &str) -> PathBuf {
        let path = self.root.join(name);
        std::fs::write(&path, content).expect("write file");
        path
    }
}

pub fn work_item(path: &Path, content: &str, sequence: u64) -> WorkItem {
    WorkItem {
        path: path.to_path_buf(),
        content_hash: hash_bytes(content.as_bytes()),
        enqueued_at: Utc::now(),
        reason: WorkReason::EditMagnitude,
        sequence,
    }
}

/// Poll `check` until it holds or `limit` elapses.
pub async fn eventually(limit: Duration, mut check: impl FnMut() -> bool) -> bool {
    let deadline = tokio::time::Instant::now() + limit;
    while tokio::time::Instant::now() < deadline {
        if check() {
            return true;
        }
        tokio::time::sleep(Duration::from_millis(20)).await;
    }
    check()
}
