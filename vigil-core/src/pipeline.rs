//! One pipeline generation.
//!
//! [`Pipeline::build`] constructs every component from scratch (store,
//! cache, validators, policy, notifier, detector, orchestrator) so a restart
//! never inherits state from a crashed generation beyond what the store and
//! cache persisted. [`Pipeline::run`] wires the stages with channels:
//!
//! ```text
//! notify/scan -> detector -> dispatcher -> orchestrator -> notifier
//!                               ^               |
//!                               +- completions -+
//! ```

use std::fmt;
use std::path::PathBuf;
use std::sync::Arc;
use std::time::Duration;

use tokio::sync::mpsc;
use tokio::task::JoinSet;
use tokio_util::sync::CancellationToken;
use tracing::{debug, error, info, trace, warn};

use crate::config::VigilConfig;
use crate::debounce::{DebounceState, run_dispatcher};
use crate::detect::{ChangeDetector, SignificantChange, Verdict};
use crate::error::{PipelineError, Result};
use crate::feedback::{Notifier, build_notifier};
use crate::metrics::PipelineMetrics;
use crate::orchestrate::cache::CleanupSummary;
use crate::orchestrate::{
    Orchestrator, OrchestratorDeps, ResultCache, ValidationPolicy, ValidatorRegistry,
};
use crate::store::{FingerprintStore, SqliteFingerprintStore};
use crate::types::ChangeEvent;
use crate::watch::{WatchFilter, WatchMessage, init_watchers, resolve_roots, scan_roots};

/// How a generation ends.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum RunMode {
    /// Watch until shutdown. Any stage exiting on its own is a failure.
    Watch,
    /// Scan every root once, drain the resulting work, then return.
    /// `force` skips the significance check.
    Rescan { force: bool },
}

/// Replacements for the config-derived collaborators, used by embedders
/// and tests.
#[derive(Clone, Default)]
pub struct PipelineOverrides {
    pub validators: Option<ValidatorRegistry>,
    pub notifier: Option<Arc<dyn Notifier>>,
}

impl fmt::Debug for PipelineOverrides {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.debug_struct("PipelineOverrides")
            .field("validators", &self.validators)
            .field("notifier", &self.notifier.is_some())
            .finish()
    }
}

/// Totals for one generation.
#[derive(Debug, Clone, Copy, Default, PartialEq, Eq)]
pub struct RunSummary {
    pub files_scanned: u64,
    pub reports: u64,
}

/// Housekeeping handles that outlive a single health tick.
#[derive(Clone)]
pub struct Maintenance {
    store: Arc<dyn FingerprintStore>,
    cache: Arc<ResultCache>,
    retention: chrono::Duration,
}

impl fmt::Debug for Maintenance {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.debug_struct("Maintenance")
            .field("cache_root", &self.cache.root())
            .field("retention", &self.retention)
            .finish()
    }
}

impl Maintenance {
    pub async fn sweep_cache(&self) -> CleanupSummary {
        self.cache.cleanup_once().await
    }

    /// Remove validation history older than the retention window.
    pub async fn prune_history(&self) -> Result<u64> {
        let cutoff = chrono::Utc::now() - self.retention;
        let removed = self.store.prune_history(cutoff).await?;
        if removed > 0 {
            info!(target: "vigil::store", removed, "retention sweep removed validation history");
        }
        Ok(removed)
    }
}

#[derive(Debug, Clone, Copy, PartialEq, Eq)]
enum Stage {
    Scanner,
    Detector,
    Dispatcher,
    Orchestrator,
}

impl fmt::Display for Stage {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        let name = match self {
            Stage::Scanner => "scanner",
            Stage::Detector => "detector",
            Stage::Dispatcher => "dispatcher",
            Stage::Orchestrator => "orchestrator",
        };
        f.write_str(name)
    }
}

pub struct Pipeline {
    config: VigilConfig,
    metrics: Arc<PipelineMetrics>,
    roots: Vec<PathBuf>,
    filter: WatchFilter,
    store: Arc<SqliteFingerprintStore>,
    cache: Arc<ResultCache>,
    detector: Arc<ChangeDetector>,
    orchestrator: Arc<Orchestrator>,
}

impl fmt::Debug for Pipeline {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.debug_struct("Pipeline")
            .field("roots", &self.roots)
            .field("state_dir", &self.config.state_dir)
            .field("orchestrator", &self.orchestrator)
            .finish()
    }
}

impl Pipeline {
    /// Construct every component. Configuration problems (missing roots,
    /// unknown validator ids, bad patterns) surface here as
    /// [`PipelineError::Config`].
    pub async fn build(
        config: VigilConfig,
        metrics: Arc<PipelineMetrics>,
        overrides: &PipelineOverrides,
    ) -> Result<Self> {
        if config.watch.roots.is_empty() {
            return Err(PipelineError::Config("no watch roots configured".into()));
        }
        let roots = resolve_roots(&config.watch.roots);
        for root in &roots {
            if !root.is_dir() {
                return Err(PipelineError::Config(format!(
                    "watch root {} does not exist or is not a directory",
                    root.display()
                )));
            }
        }

        tokio::fs::create_dir_all(&config.state_dir).await?;
        let state_dir = tokio::fs::canonicalize(&config.state_dir)
            .await
            .unwrap_or_else(|_| config.state_dir.clone());
        let filter = WatchFilter::from_config(&config.watch)
            .with_roots(&roots)
            .excluding(state_dir);
        let store =
            Arc::new(SqliteFingerprintStore::open(&config.database_path(), &config.store).await?);
        let cache = Arc::new(ResultCache::open(config.cache_dir(), &config.cache)?);

        let registry = match &overrides.validators {
            Some(registry) => registry.clone(),
            None => ValidatorRegistry::with_builtins(&config.orchestrator)?,
        };
        let policy = ValidationPolicy::from_config(&config.orchestrator.policy, &registry)?;
        let notifier = overrides
            .notifier
            .clone()
            .unwrap_or_else(|| build_notifier(&config.notifier, &config.state_dir));

        let dyn_store: Arc<dyn FingerprintStore> = store.clone();
        let detector = Arc::new(ChangeDetector::new(
            Arc::clone(&dyn_store),
            config.detector.clone(),
        )?);
        let orchestrator = Arc::new(Orchestrator::new(
            OrchestratorDeps {
                registry,
                policy,
                cache: Arc::clone(&cache),
                store: dyn_store,
                notifier,
                metrics: Arc::clone(&metrics),
            },
            &config.orchestrator,
        )?);

        Ok(Self {
            filter,
            config,
            metrics,
            roots,
            store,
            cache,
            detector,
            orchestrator,
        })
    }

    pub fn maintenance(&self) -> Maintenance {
        Maintenance {
            store: self.store.clone(),
            cache: Arc::clone(&self.cache),
            retention: chrono::Duration::days(i64::from(self.config.store.retention_days)),
        }
    }

    /// Run the generation until `shutdown` fires, a stage fails, or (in
    /// [`RunMode::Rescan`]) all scanned work has been reported.
    pub async fn run(self, mode: RunMode, shutdown: CancellationToken) -> Result<RunSummary> {
        let token = shutdown.child_token();
        let completed_before = self.metrics.completed();
        let queue_capacity = self.config.debounce.dispatch_queue_capacity.max(1);

        let (raw_tx, raw_rx) = mpsc::channel(self.config.watch.channel_capacity.max(1));
        let (change_tx, change_rx) = mpsc::channel(queue_capacity);
        let (work_tx, work_rx) = mpsc::channel(queue_capacity);
        let (done_tx, done_rx) = mpsc::unbounded_channel();

        let guard = match mode {
            RunMode::Watch => {
                let roots = self.roots.clone();
                let filter = self.filter.clone();
                let tx = raw_tx.clone();
                let guard = tokio::task::spawn_blocking(move || init_watchers(roots, filter, tx))
                    .await
                    .map_err(|err| {
                        PipelineError::Internal(format!("watcher setup task failed: {err}"))
                    })??;
                Some(guard)
            }
            RunMode::Rescan { .. } => None,
        };

        let mut stages: JoinSet<(Stage, Result<()>)> = JoinSet::new();

        let orchestrator = Arc::clone(&self.orchestrator);
        let orchestrator_token = token.clone();
        stages.spawn(async move {
            let result = orchestrator.run(work_rx, done_tx, orchestrator_token).await;
            (Stage::Orchestrator, result)
        });

        let debounce = DebounceState::new(self.config.debounce.quiet_window());
        let metrics = Arc::clone(&self.metrics);
        let dispatcher_token = token.clone();
        stages.spawn(async move {
            let result =
                run_dispatcher(debounce, change_rx, done_rx, work_tx, metrics, dispatcher_token)
                    .await;
            (Stage::Dispatcher, result)
        });

        let detector = DetectorStage {
            detector: Arc::clone(&self.detector),
            roots: self.roots.clone(),
            filter: self.filter.clone(),
            metrics: Arc::clone(&self.metrics),
            force: matches!(mode, RunMode::Rescan { force: true }),
        };
        let detector_token = token.clone();
        stages.spawn(async move {
            let result = detector.run(raw_rx, change_tx, detector_token).await;
            (Stage::Detector, result)
        });

        let scan = mode != RunMode::Watch || self.config.watch.initial_scan;
        if scan {
            let roots = self.roots.clone();
            let filter = self.filter.clone();
            let metrics = Arc::clone(&self.metrics);
            let scanner_token = token.clone();
            let tx = raw_tx.clone();
            stages.spawn(async move {
                let result = feed_scan(roots, filter, metrics, tx, scanner_token).await;
                (Stage::Scanner, result)
            });
        }
        // Watchers and the scanner hold their own senders; the raw stream
        // closes once all of them are gone.
        drop(raw_tx);

        info!(
            target: "vigil::pipeline",
            ?mode,
            roots = self.roots.len(),
            initial_scan = scan,
            "pipeline generation started"
        );

        let outcome = loop {
            tokio::select! {
                biased;
                _ = token.cancelled() => break Ok(()),
                joined = stages.join_next() => match joined {
                    None => break Ok(()),
                    Some(Ok((stage, Ok(())))) => {
                        debug!(target: "vigil::pipeline", %stage, "stage finished");
                        if mode == RunMode::Watch && stage != Stage::Scanner {
                            break Err(PipelineError::Internal(format!(
                                "{stage} stage exited unexpectedly"
                            )));
                        }
                    }
                    Some(Ok((stage, Err(err)))) => {
                        error!(target: "vigil::pipeline", %stage, error = %err, "stage failed");
                        break Err(err);
                    }
                    Some(Err(err)) => {
                        error!(target: "vigil::pipeline", error = %err, "stage task panicked");
                        break Err(PipelineError::Internal(format!("stage task failed: {err}")));
                    }
                },
            }
        };

        token.cancel();
        self.wind_down(stages).await;
        drop(guard);
        self.store.close().await;

        let summary = RunSummary {
            files_scanned: self.metrics.snapshot().files_watched,
            reports: self.metrics.completed().saturating_sub(completed_before),
        };
        match &outcome {
            Ok(()) => info!(
                target: "vigil::pipeline",
                reports = summary.reports,
                "pipeline generation stopped"
            ),
            Err(err) => warn!(target: "vigil::pipeline", error = %err, "pipeline generation failed"),
        }
        outcome.map(|()| summary)
    }

    async fn wind_down(&self, mut stages: JoinSet<(Stage, Result<()>)>) {
        // The orchestrator enforces its own grace period; the margin covers
        // the other stages noticing cancellation.
        let limit = self.config.orchestrator.shutdown_grace() + Duration::from_secs(1);
        let drained = tokio::time::timeout(limit, async {
            while let Some(joined) = stages.join_next().await {
                match joined {
                    Ok((stage, Err(err))) => {
                        debug!(target: "vigil::pipeline", %stage, error = %err, "stage error during shutdown");
                    }
                    Err(err) if err.is_panic() => {
                        error!(target: "vigil::pipeline", "stage panicked during shutdown");
                    }
                    _ => {}
                }
            }
        })
        .await;
        if drained.is_err() {
            warn!(target: "vigil::pipeline", remaining = stages.len(), "aborting stages after grace period");
            stages.abort_all();
        }
    }
}

struct DetectorStage {
    detector: Arc<ChangeDetector>,
    roots: Vec<PathBuf>,
    filter: WatchFilter,
    metrics: Arc<PipelineMetrics>,
    force: bool,
}

impl DetectorStage {
    async fn run(
        self,
        mut raw_rx: mpsc::Receiver<WatchMessage>,
        change_tx: mpsc::Sender<SignificantChange>,
        shutdown: CancellationToken,
    ) -> Result<()> {
        loop {
            let message = tokio::select! {
                biased;
                _ = shutdown.cancelled() => return Ok(()),
                message = raw_rx.recv() => message,
            };
            let Some(message) = message else {
                debug!(target: "vigil::detect", "raw event stream closed");
                return Ok(());
            };

            match message {
                WatchMessage::Change(event) => {
                    if !self.forward(&event, &change_tx, &shutdown).await? {
                        return Ok(());
                    }
                }
                WatchMessage::Error(message) => {
                    warn!(target: "vigil::watch", error = %message, "watcher error; rescanning roots");
                    let paths = scan(self.roots.clone(), self.filter.clone()).await?;
                    self.metrics.set_files_watched(paths.len() as u64);
                    for path in paths {
                        let event = ChangeEvent::modified(path);
                        if !self.forward(&event, &change_tx, &shutdown).await? {
                            return Ok(());
                        }
                    }
                }
            }
        }
    }

    /// `Ok(false)` once shutdown has fired.
    async fn forward(
        &self,
        event: &ChangeEvent,
        change_tx: &mpsc::Sender<SignificantChange>,
        shutdown: &CancellationToken,
    ) -> Result<bool> {
        let verdict = if self.force {
            self.detector.assess_forced(&event.path).await
        } else {
            self.detector.assess(event).await
        };

        let change = match verdict {
            Verdict::Significant(change) => change,
            Verdict::Drop(reason) => {
                trace!(target: "vigil::detect", path = %event.path.display(), ?reason, "change dropped");
                return Ok(true);
            }
        };

        tokio::select! {
            biased;
            _ = shutdown.cancelled() => Ok(false),
            sent = change_tx.send(change) => sent
                .map(|()| true)
                .map_err(|_| PipelineError::Internal("change stream closed".into())),
        }
    }
}

async fn scan(roots: Vec<PathBuf>, filter: WatchFilter) -> Result<Vec<PathBuf>> {
    tokio::task::spawn_blocking(move || scan_roots(&roots, &filter))
        .await
        .map_err(|err| PipelineError::Internal(format!("root scan task failed: {err}")))
}

async fn feed_scan(
    roots: Vec<PathBuf>,
    filter: WatchFilter,
    metrics: Arc<PipelineMetrics>,
    tx: mpsc::Sender<WatchMessage>,
    shutdown: CancellationToken,
) -> Result<()> {
    let paths = scan(roots, filter).await?;
    metrics.set_files_watched(paths.len() as u64);
    info!(target: "vigil::watch", files = paths.len(), "root scan complete");

    for path in paths {
        let message = WatchMessage::Change(ChangeEvent::modified(path));
        tokio::select! {
            biased;
            _ = shutdown.cancelled() => return Ok(()),
            sent = tx.send(message) => {
                if sent.is_err() {
                    return Ok(());
                }
            }
        }
    }
    Ok(())
}
