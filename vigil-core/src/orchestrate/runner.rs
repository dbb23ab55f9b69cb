use std::any::Any;
use std::fmt;
use std::panic::AssertUnwindSafe;
use std::path::Path;
use std::sync::Arc;
use std::time::{Duration, Instant};

use chrono::Utc;
use futures::FutureExt;
use tokio::sync::{Semaphore, mpsc};
use tokio::task::{JoinError, JoinSet};
use tokio_util::sync::CancellationToken;
use tracing::{debug, error, info, warn};

use crate::config::OrchestratorConfig;
use crate::debounce::Completion;
use crate::error::{PipelineError, Result, retry_once};
use crate::feedback::{Notifier, Report, aggregate};
use crate::hash::read_and_hash;
use crate::metrics::PipelineMetrics;
use crate::store::FingerprintStore;
use crate::types::{ContentHash, Finding, Severity, ValidationRecord, WorkItem};

use super::cache::ResultCache;
use super::policy::{Selection, ValidationPolicy};
use super::validator::{
    AGENT_FAILURE_RULE, FileContent, PolicyContext, ValidatorError, ValidatorRegistry,
};

/// Rule id for the finding produced when the file cannot be read at all.
pub const READ_FAILURE_RULE: &str = "read_failure";

/// Everything one orchestrator needs, constructed by the pipeline.
pub struct OrchestratorDeps {
    pub registry: ValidatorRegistry,
    pub policy: ValidationPolicy,
    pub cache: Arc<ResultCache>,
    pub store: Arc<dyn FingerprintStore>,
    pub notifier: Arc<dyn Notifier>,
    pub metrics: Arc<PipelineMetrics>,
}

pub struct Orchestrator {
    registry: ValidatorRegistry,
    policy: ValidationPolicy,
    cache: Arc<ResultCache>,
    store: Arc<dyn FingerprintStore>,
    notifier: Arc<dyn Notifier>,
    metrics: Arc<PipelineMetrics>,
    validator_permits: Arc<Semaphore>,
    max_concurrency: usize,
    max_inflight_items: usize,
    validator_timeout: Duration,
    shutdown_grace: Duration,
}

impl fmt::Debug for Orchestrator {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.debug_struct("Orchestrator")
            .field("registry", &self.registry)
            .field("policy_rules", &self.policy.len())
            .field("max_concurrency", &self.max_concurrency)
            .field("available_permits", &self.validator_permits.available_permits())
            .field("validator_timeout", &self.validator_timeout)
            .finish()
    }
}

impl Orchestrator {
    pub fn new(deps: OrchestratorDeps, config: &OrchestratorConfig) -> Result<Self> {
        if config.max_concurrency == 0 {
            return Err(PipelineError::Config(
                "orchestrator.max_concurrency must be at least 1".into(),
            ));
        }
        Ok(Self {
            registry: deps.registry,
            policy: deps.policy,
            cache: deps.cache,
            store: deps.store,
            notifier: deps.notifier,
            metrics: deps.metrics,
            validator_permits: Arc::new(Semaphore::new(config.max_concurrency)),
            max_concurrency: config.max_concurrency,
            max_inflight_items: config.effective_inflight_items(),
            validator_timeout: config.validator_timeout(),
            shutdown_grace: config.shutdown_grace(),
        })
    }

    pub fn cache(&self) -> &Arc<ResultCache> {
        &self.cache
    }

    /// Process one work item end to end. `None` when the path vanished
    /// before it could be read; nothing is recorded in that case.
    ///
    /// The bytes on disk at submit time are what get validated, even when
    /// they differ from the hash the item was queued with. Cached findings
    /// are keyed by content alone, so on a hit every finding's `path` is
    /// rewritten to this item's path. Resubmitting the same path with the
    /// same bytes therefore reproduces identical findings.
    pub async fn submit(&self, item: WorkItem) -> Option<Report> {
        let started = Instant::now();

        let content = match retry_once(|| read_and_hash(&item.path)).await {
            Ok(Some(content)) => content,
            Ok(None) => {
                debug!(target: "vigil::orchestrate", path = %item.path.display(), "path vanished before validation");
                return None;
            }
            Err(err) => {
                warn!(target: "vigil::orchestrate", path = %item.path.display(), error = %err, "unable to read file for validation");
                let finding = Finding::new(
                    "orchestrator",
                    Severity::Error,
                    format!("file could not be read: {err}"),
                    &item.path,
                )
                .with_rule(READ_FAILURE_RULE);
                return Some(
                    self.finish(&item.path, &item.content_hash, vec![finding], started, false)
                        .await,
                );
            }
        };

        if content.hash != item.content_hash {
            debug!(
                target: "vigil::orchestrate",
                path = %item.path.display(),
                queued = %item.content_hash.short(),
                current = %content.hash.short(),
                "content changed since dispatch; validating current bytes"
            );
        }
        let hash = content.hash.clone();

        match retry_once(|| self.cache.get(&hash)).await {
            Ok(Some(mut findings)) => {
                self.metrics.record_cache_hit();
                // The entry may have been written for another path with the
                // same bytes.
                for finding in &mut findings {
                    finding.path.clone_from(&item.path);
                }
                debug!(target: "vigil::orchestrate", path = %item.path.display(), hash = %hash.short(), "cache hit");
                return Some(self.finish(&item.path, &hash, findings, started, false).await);
            }
            Ok(None) => self.metrics.record_cache_miss(),
            Err(err) => {
                self.metrics.record_cache_miss();
                warn!(target: "vigil::orchestrate", hash = %hash.short(), error = %err, "cache lookup failed; treating as miss");
            }
        }

        let selection = self.policy.select(&item.path);
        let context = PolicyContext {
            matched_rules: selection.matched_rules.clone(),
            reason: Some(item.reason),
        };
        let file = Arc::new(FileContent {
            path: item.path.clone(),
            content_hash: hash.clone(),
            bytes: content.bytes,
        });
        let findings = self.run_validators(file, &selection, context).await;

        Some(self.finish(&item.path, &hash, findings, started, true).await)
    }

    /// Run every selected validator concurrently under the shared permit
    /// pool. Failures become `agent_failure` findings; results keep the
    /// selection order.
    pub async fn run_validators(
        &self,
        file: Arc<FileContent>,
        selection: &Selection,
        context: PolicyContext,
    ) -> Vec<Finding> {
        let context = Arc::new(context);
        let mut calls: JoinSet<(usize, std::result::Result<Vec<Finding>, ValidatorError>)> =
            JoinSet::new();
        let mut slots: Vec<Vec<Finding>> = vec![Vec::new(); selection.validators.len()];

        for (idx, id) in selection.validators.iter().enumerate() {
            let Some(validator) = self.registry.get(id) else {
                slots[idx].push(
                    ValidatorError::Failed(format!("validator `{id}` is not registered"))
                        .into_finding(id, &file.path),
                );
                continue;
            };

            let permits = Arc::clone(&self.validator_permits);
            let metrics = Arc::clone(&self.metrics);
            let file = Arc::clone(&file);
            let context = Arc::clone(&context);
            let timeout = self.validator_timeout;
            calls.spawn(async move {
                let Ok(_permit) = permits.acquire_owned().await else {
                    return (idx, Err(ValidatorError::Failed("validator pool closed".into())));
                };
                let _inflight = metrics.validator_started();
                let call = tokio::time::timeout(timeout, validator.validate(&file, &context));
                let outcome = match AssertUnwindSafe(call).catch_unwind().await {
                    Ok(Ok(result)) => result,
                    Ok(Err(_)) => Err(ValidatorError::Timeout(timeout)),
                    Err(payload) => Err(ValidatorError::Panicked(panic_message(payload.as_ref()))),
                };
                (idx, outcome)
            });
        }

        while let Some(joined) = calls.join_next().await {
            let (idx, outcome) = match joined {
                Ok(done) => done,
                Err(err) => {
                    warn!(target: "vigil::orchestrate", error = %err, "validator task lost");
                    continue;
                }
            };
            let id = &selection.validators[idx];
            slots[idx] = match outcome {
                Ok(findings) => match check_findings(findings, id, &file.path) {
                    Ok(findings) => findings,
                    Err(err) => {
                        warn!(target: "vigil::orchestrate", validator = %id, path = %file.path.display(), error = %err, "validator returned a malformed result");
                        vec![err.into_finding(id, &file.path)]
                    }
                },
                Err(err) => {
                    warn!(target: "vigil::orchestrate", validator = %id, path = %file.path.display(), error = %err, "validator failed");
                    vec![err.into_finding(id, &file.path)]
                }
            };
        }

        slots.into_iter().flatten().collect()
    }

    async fn finish(
        &self,
        path: &Path,
        hash: &ContentHash,
        findings: Vec<Finding>,
        started: Instant,
        write_cache: bool,
    ) -> Report {
        let cacheable = write_cache
            && !findings.iter().any(|f| {
                matches!(f.rule_id.as_deref(), Some(AGENT_FAILURE_RULE | READ_FAILURE_RULE))
            });
        if cacheable && let Err(err) = retry_once(|| self.cache.put(hash, &findings)).await {
            warn!(target: "vigil::orchestrate", hash = %hash.short(), error = %err, "cache write failed");
        }

        let passed = !findings.iter().any(Finding::is_error);
        let record = ValidationRecord {
            path: path.to_path_buf(),
            content_hash: hash.clone(),
            timestamp: Utc::now(),
            finding_count: findings.len() as u32,
            passed,
            duration_ms: started.elapsed().as_millis() as u64,
        };
        if let Err(err) = retry_once(|| self.store.record_validation(&record)).await {
            warn!(target: "vigil::orchestrate", path = %path.display(), error = %err, "failed to record validation");
        }

        let report = aggregate(path, hash, findings);
        self.metrics.record_completed(passed);
        match self.notifier.notify(&report).await {
            Ok(()) => self.metrics.record_report_delivered(),
            Err(err) => {
                warn!(target: "vigil::feedback", path = %path.display(), error = %err, "notifier failed")
            }
        }
        report
    }

    /// Pull work items until the queue closes or shutdown fires. Each item
    /// runs in its own tracked task; a panic in one is fatal to the
    /// generation. On shutdown in-flight items get the grace period, then
    /// are abandoned.
    pub async fn run(
        self: Arc<Self>,
        mut work_rx: mpsc::Receiver<WorkItem>,
        completions: mpsc::UnboundedSender<Completion>,
        shutdown: CancellationToken,
    ) -> Result<()> {
        let item_permits = Arc::new(Semaphore::new(self.max_inflight_items.max(1)));
        let mut tasks: JoinSet<()> = JoinSet::new();

        info!(
            target: "vigil::orchestrate",
            max_concurrency = self.max_concurrency,
            max_inflight_items = self.max_inflight_items,
            "orchestrator started"
        );

        loop {
            let permit = tokio::select! {
                biased;
                _ = shutdown.cancelled() => return self.drain_on_shutdown(tasks).await,
                Some(joined) = tasks.join_next() => {
                    reap(joined)?;
                    continue;
                }
                permit = Arc::clone(&item_permits).acquire_owned() => permit
                    .map_err(|_| PipelineError::Internal("work item permits closed".into()))?,
            };

            let item = tokio::select! {
                biased;
                _ = shutdown.cancelled() => return self.drain_on_shutdown(tasks).await,
                Some(joined) = tasks.join_next() => {
                    drop(permit);
                    reap(joined)?;
                    continue;
                }
                item = work_rx.recv() => item,
            };

            let Some(item) = item else {
                break;
            };
            self.metrics.item_dequeued();

            let this = Arc::clone(&self);
            let completions = completions.clone();
            tasks.spawn(async move {
                let _permit = permit;
                let completion = Completion {
                    path: item.path.clone(),
                    sequence: item.sequence,
                };
                this.submit(item).await;
                let _ = completions.send(completion);
            });
        }

        debug!(target: "vigil::orchestrate", "work queue closed; draining in-flight items");
        loop {
            tokio::select! {
                biased;
                _ = shutdown.cancelled() => return self.drain_on_shutdown(tasks).await,
                joined = tasks.join_next() => match joined {
                    Some(joined) => reap(joined)?,
                    None => return Ok(()),
                },
            }
        }
    }

    async fn drain_on_shutdown(&self, mut tasks: JoinSet<()>) -> Result<()> {
        if tasks.is_empty() {
            return Ok(());
        }
        info!(
            target: "vigil::orchestrate",
            in_flight = tasks.len(),
            grace_ms = self.shutdown_grace.as_millis() as u64,
            "waiting for in-flight work items"
        );

        let drained = tokio::time::timeout(self.shutdown_grace, async {
            while let Some(joined) = tasks.join_next().await {
                if let Err(err) = joined
                    && err.is_panic()
                {
                    error!(target: "vigil::orchestrate", "work item panicked during shutdown");
                }
            }
        })
        .await;

        if drained.is_err() {
            warn!(
                target: "vigil::orchestrate",
                abandoned = tasks.len(),
                "grace period elapsed; abandoning in-flight work items"
            );
            tasks.abort_all();
        }
        Ok(())
    }
}

fn reap(joined: std::result::Result<(), JoinError>) -> Result<()> {
    match joined {
        Ok(()) => Ok(()),
        Err(err) if err.is_panic() => {
            let message = join_error_message(err);
            error!(target: "vigil::orchestrate", panic = %message, "work item task panicked");
            Err(PipelineError::Internal(format!("work item task panicked: {message}")))
        }
        Err(_) => Ok(()),
    }
}

/// A result is malformed when any finding claims another source, carries
/// no message or points at a different file. The whole result is rejected.
fn check_findings(
    findings: Vec<Finding>,
    id: &str,
    path: &Path,
) -> std::result::Result<Vec<Finding>, ValidatorError> {
    for finding in &findings {
        if finding.source != id {
            return Err(ValidatorError::Malformed(format!(
                "finding attributed to `{}`",
                finding.source
            )));
        }
        if finding.message.trim().is_empty() {
            return Err(ValidatorError::Malformed("finding has an empty message".into()));
        }
        if finding.path != path {
            return Err(ValidatorError::Malformed(format!(
                "finding points at {}",
                finding.path.display()
            )));
        }
    }
    Ok(findings)
}

fn join_error_message(err: JoinError) -> String {
    if err.is_cancelled() {
        return "cancelled".to_string();
    }
    match err.try_into_panic() {
        Ok(payload) => panic_message(payload.as_ref()),
        Err(err) => err.to_string(),
    }
}

fn panic_message(payload: &(dyn Any + Send)) -> String {
    if let Some(message) = payload.downcast_ref::<&str>() {
        (*message).to_string()
    } else if let Some(message) = payload.downcast_ref::<String>() {
        message.clone()
    } else {
        "non-string panic payload".to_string()
    }
}
