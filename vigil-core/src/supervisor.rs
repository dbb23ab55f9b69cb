//! Process lifetime.
//!
//! `Starting -> Running <-> Degraded -> Crashed -> Restarting -> Running`,
//! with `Stopped` reachable from anywhere on shutdown. Each generation of the
//! watched service runs in its own task so a panic surfaces as a crash
//! instead of tearing the process down. Restarts back off and are capped for
//! the lifetime of the process.

use std::path::{Path, PathBuf};
use std::sync::{Arc, Mutex};
use std::time::Duration;

use async_trait::async_trait;
use chrono::{DateTime, Utc};
use serde::{Deserialize, Serialize};
use sysinfo::{Pid, ProcessRefreshKind, ProcessesToUpdate, RefreshKind, System};
use tokio::sync::watch;
use tokio::task::JoinHandle;
use tokio::time::{Instant, MissedTickBehavior};
use tokio_util::sync::CancellationToken;
use tracing::{debug, error, info, warn};

use crate::config::{SupervisorConfig, VigilConfig};
use crate::error::{PipelineError, Result};
use crate::metrics::{MetricsSnapshot, PipelineMetrics};
use crate::pipeline::{Maintenance, Pipeline, PipelineOverrides, RunMode};
use crate::types::HealthSnapshot;

const RETENTION_SWEEP_INTERVAL: Duration = Duration::from_secs(60 * 60);

#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "snake_case")]
pub enum SupervisorState {
    Starting,
    Running,
    Degraded,
    Crashed,
    Restarting,
    Stopped,
}

impl SupervisorState {
    pub fn as_str(&self) -> &'static str {
        match self {
            SupervisorState::Starting => "starting",
            SupervisorState::Running => "running",
            SupervisorState::Degraded => "degraded",
            SupervisorState::Crashed => "crashed",
            SupervisorState::Restarting => "restarting",
            SupervisorState::Stopped => "stopped",
        }
    }
}

impl std::fmt::Display for SupervisorState {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.write_str(self.as_str())
    }
}

/// Something the supervisor keeps alive.
#[async_trait]
pub trait Service: Send + Sync + 'static {
    /// Run one generation until `shutdown` fires or it fails. Returning
    /// `Ok` before shutdown means the service finished on its own.
    async fn run(&self, metrics: Arc<PipelineMetrics>, shutdown: CancellationToken) -> Result<()>;

    /// Housekeeping on each health tick. `prune_history` is set at most
    /// once per retention interval.
    async fn maintain(&self, _prune_history: bool) {}
}

/// The watch-mode pipeline as a supervised service.
pub struct PipelineService {
    config: VigilConfig,
    overrides: PipelineOverrides,
    maintenance: Mutex<Option<Maintenance>>,
}

impl std::fmt::Debug for PipelineService {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.debug_struct("PipelineService")
            .field("roots", &self.config.watch.roots)
            .field("overrides", &self.overrides)
            .finish()
    }
}

impl PipelineService {
    pub fn new(config: VigilConfig) -> Self {
        Self {
            config,
            overrides: PipelineOverrides::default(),
            maintenance: Mutex::new(None),
        }
    }

    pub fn with_overrides(mut self, overrides: PipelineOverrides) -> Self {
        self.overrides = overrides;
        self
    }

    fn set_maintenance(&self, maintenance: Option<Maintenance>) {
        *self
            .maintenance
            .lock()
            .unwrap_or_else(|poisoned| poisoned.into_inner()) = maintenance;
    }

    fn current_maintenance(&self) -> Option<Maintenance> {
        self.maintenance
            .lock()
            .unwrap_or_else(|poisoned| poisoned.into_inner())
            .clone()
    }
}

#[async_trait]
impl Service for PipelineService {
    async fn run(&self, metrics: Arc<PipelineMetrics>, shutdown: CancellationToken) -> Result<()> {
        let pipeline = Pipeline::build(self.config.clone(), metrics, &self.overrides).await?;
        self.set_maintenance(Some(pipeline.maintenance()));
        let result = pipeline.run(RunMode::Watch, shutdown).await;
        self.set_maintenance(None);
        result.map(|_| ())
    }

    async fn maintain(&self, prune_history: bool) {
        let Some(maintenance) = self.current_maintenance() else {
            return;
        };
        maintenance.sweep_cache().await;
        if prune_history && let Err(err) = maintenance.prune_history().await {
            warn!(target: "vigil::supervisor", error = %err, "retention sweep failed");
        }
    }
}

#[derive(Debug, Clone, PartialEq, Eq)]
pub enum StopReason {
    /// Shutdown signal, Ctrl-C or a stop request file.
    Requested,
    /// The service returned on its own.
    Finished,
    RestartsExhausted { last_error: String },
    /// Configuration problems are never retried.
    Configuration(String),
}

#[derive(Debug, Clone)]
pub struct SupervisorOutcome {
    pub reason: StopReason,
    pub restarts: u32,
    /// Every state entered, in order.
    pub transitions: Vec<SupervisorState>,
}

impl SupervisorOutcome {
    pub fn exit_code(&self) -> i32 {
        match self.reason {
            StopReason::Requested | StopReason::Finished => 0,
            StopReason::RestartsExhausted { .. } => 1,
            StopReason::Configuration(_) => 2,
        }
    }
}

/// Contents of `health.json`, read back by `vigilctl status`.
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct StatusReport {
    pub state: SupervisorState,
    pub pid: u32,
    pub restarts: u32,
    pub health: HealthSnapshot,
    pub metrics: MetricsSnapshot,
    pub updated_at: DateTime<Utc>,
}

impl StatusReport {
    pub async fn read(path: &Path) -> Result<Self> {
        let bytes = match tokio::fs::read(path).await {
            Ok(bytes) => bytes,
            Err(err) if err.kind() == std::io::ErrorKind::NotFound => {
                return Err(PipelineError::NotFound(format!(
                    "no status file at {}",
                    path.display()
                )));
            }
            Err(err) => return Err(err.into()),
        };
        Ok(serde_json::from_slice(&bytes)?)
    }

    async fn write(&self, path: &Path) -> Result<()> {
        let bytes = serde_json::to_vec_pretty(self)?;
        let tmp = path.with_extension("json.tmp");
        tokio::fs::write(&tmp, bytes).await?;
        tokio::fs::rename(&tmp, path).await?;
        Ok(())
    }
}

/// Process memory and CPU sampler. CPU usage needs two refreshes, so the
/// same `System` is kept across ticks.
struct ResourceSampler {
    system: System,
    pid: Option<Pid>,
}

impl ResourceSampler {
    fn new() -> Self {
        Self {
            system: System::new_with_specifics(RefreshKind::nothing()),
            pid: sysinfo::get_current_pid().ok(),
        }
    }

    /// `(memory_pct, cpu_pct)`; zeros when the process cannot be observed.
    fn sample(&mut self) -> (f32, f32) {
        let Some(pid) = self.pid else {
            return (0.0, 0.0);
        };
        self.system.refresh_memory();
        self.system.refresh_processes_specifics(
            ProcessesToUpdate::Some(&[pid]),
            false,
            ProcessRefreshKind::nothing().with_memory().with_cpu(),
        );
        let total = self.system.total_memory();
        match self.system.process(pid) {
            Some(process) if total > 0 => (
                (process.memory() as f64 / total as f64 * 100.0) as f32,
                process.cpu_usage(),
            ),
            Some(process) => (0.0, process.cpu_usage()),
            None => (0.0, 0.0),
        }
    }
}

#[derive(Debug, PartialEq, Eq)]
enum Tick {
    Continue,
    StopRequested,
}

pub struct Supervisor<S: Service> {
    config: SupervisorConfig,
    shutdown_grace: Duration,
    status_path: PathBuf,
    stop_path: PathBuf,
    service: Arc<S>,
    metrics: Arc<PipelineMetrics>,
    state_tx: watch::Sender<SupervisorState>,
    health_tx: watch::Sender<HealthSnapshot>,
    transitions: Vec<SupervisorState>,
    started: Instant,
    restarts: u32,
    last_prune: Option<Instant>,
    sampler: Option<ResourceSampler>,
}

impl<S: Service> std::fmt::Debug for Supervisor<S> {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.debug_struct("Supervisor")
            .field("state", &*self.state_tx.borrow())
            .field("restarts", &self.restarts)
            .field("status_path", &self.status_path)
            .finish()
    }
}

impl<S: Service> Supervisor<S> {
    pub fn new(config: VigilConfig, service: S) -> Self {
        let (state_tx, _) = watch::channel(SupervisorState::Starting);
        let (health_tx, _) = watch::channel(HealthSnapshot::default());
        Self {
            shutdown_grace: config.orchestrator.shutdown_grace(),
            status_path: config.status_path(),
            stop_path: config.stop_request_path(),
            config: config.supervisor,
            service: Arc::new(service),
            metrics: Arc::new(PipelineMetrics::new()),
            state_tx,
            health_tx,
            transitions: Vec::new(),
            started: Instant::now(),
            restarts: 0,
            last_prune: None,
            sampler: Some(ResourceSampler::new()),
        }
    }

    /// Share counters with the caller (the CLI prints them on exit).
    pub fn with_metrics(mut self, metrics: Arc<PipelineMetrics>) -> Self {
        self.metrics = metrics;
        self
    }

    pub fn metrics(&self) -> Arc<PipelineMetrics> {
        Arc::clone(&self.metrics)
    }

    pub fn subscribe_state(&self) -> watch::Receiver<SupervisorState> {
        self.state_tx.subscribe()
    }

    /// Latest health sample, refreshed every health interval.
    pub fn subscribe_health(&self) -> watch::Receiver<HealthSnapshot> {
        self.health_tx.subscribe()
    }

    pub async fn run(mut self, shutdown: CancellationToken) -> SupervisorOutcome {
        self.started = Instant::now();
        self.clear_stale_stop_request().await;
        self.transition(SupervisorState::Starting).await;

        loop {
            let generation_token = shutdown.child_token();
            let mut generation = self.spawn_generation(generation_token.clone());
            self.transition(SupervisorState::Running).await;

            let interval = self.config.health_interval();
            let mut ticker = tokio::time::interval_at(Instant::now() + interval, interval);
            ticker.set_missed_tick_behavior(MissedTickBehavior::Delay);

            let joined = loop {
                tokio::select! {
                    biased;
                    _ = shutdown.cancelled() => {
                        return self.stop_generation(generation, generation_token).await;
                    }
                    joined = &mut generation => break joined,
                    _ = ticker.tick() => {
                        if self.health_tick().await == Tick::StopRequested {
                            info!(target: "vigil::supervisor", "stop requested");
                            return self.stop_generation(generation, generation_token).await;
                        }
                    }
                }
            };

            let failure = match joined {
                Ok(Ok(())) => {
                    info!(target: "vigil::supervisor", "service finished");
                    return self.stop(StopReason::Finished).await;
                }
                Ok(Err(err)) if !err.is_fatal_to_generation() => {
                    return match err {
                        PipelineError::Config(message) => {
                            error!(target: "vigil::supervisor", error = %message, "configuration error; not restarting");
                            self.stop(StopReason::Configuration(message)).await
                        }
                        _ => self.stop(StopReason::Requested).await,
                    };
                }
                Ok(Err(err)) => err.to_string(),
                Err(err) if err.is_panic() => format!("pipeline panicked: {err}"),
                Err(err) => format!("pipeline task failed: {err}"),
            };

            self.transition(SupervisorState::Crashed).await;
            error!(target: "vigil::supervisor", error = %failure, restarts = self.restarts, "pipeline crashed");
            self.metrics.reset_gauges();

            if self.restarts >= self.config.max_restarts {
                error!(
                    target: "vigil::supervisor",
                    max_restarts = self.config.max_restarts,
                    "restart limit reached"
                );
                return self
                    .stop(StopReason::RestartsExhausted {
                        last_error: failure,
                    })
                    .await;
            }

            self.restarts += 1;
            let delay = self.config.restart_delay(self.restarts);
            self.transition(SupervisorState::Restarting).await;
            info!(
                target: "vigil::supervisor",
                attempt = self.restarts,
                delay_ms = delay.as_millis() as u64,
                "restarting pipeline"
            );
            tokio::select! {
                biased;
                _ = shutdown.cancelled() => return self.stop(StopReason::Requested).await,
                _ = tokio::time::sleep(delay) => {}
            }
        }
    }

    fn spawn_generation(&self, token: CancellationToken) -> JoinHandle<Result<()>> {
        let service = Arc::clone(&self.service);
        let metrics = Arc::clone(&self.metrics);
        tokio::spawn(async move { service.run(metrics, token).await })
    }

    async fn stop_generation(
        self,
        mut generation: JoinHandle<Result<()>>,
        token: CancellationToken,
    ) -> SupervisorOutcome {
        token.cancel();
        // Pipeline stages get the orchestrator grace period plus a margin.
        let limit = self.shutdown_grace + Duration::from_secs(2);
        match tokio::time::timeout(limit, &mut generation).await {
            Ok(Ok(Err(err))) => {
                debug!(target: "vigil::supervisor", error = %err, "generation returned an error during shutdown")
            }
            Ok(Err(err)) if err.is_panic() => {
                error!(target: "vigil::supervisor", "generation panicked during shutdown")
            }
            Ok(_) => {}
            Err(_) => {
                warn!(target: "vigil::supervisor", "generation did not stop in time; aborting");
                generation.abort();
            }
        }
        self.stop(StopReason::Requested).await
    }

    async fn stop(mut self, reason: StopReason) -> SupervisorOutcome {
        self.transition(SupervisorState::Stopped).await;
        SupervisorOutcome {
            reason,
            restarts: self.restarts,
            transitions: std::mem::take(&mut self.transitions),
        }
    }

    async fn transition(&mut self, next: SupervisorState) {
        let previous = *self.state_tx.borrow();
        self.transitions.push(next);
        self.state_tx.send_replace(next);

        match next {
            SupervisorState::Degraded => {
                warn!(target: "vigil::supervisor", from = %previous, to = %next, "state transition")
            }
            SupervisorState::Crashed => {
                error!(target: "vigil::supervisor", from = %previous, to = %next, "state transition")
            }
            _ => info!(target: "vigil::supervisor", from = %previous, to = %next, "state transition"),
        }

        self.publish_status().await;
    }

    async fn health_tick(&mut self) -> Tick {
        let snapshot = self.sample().await;
        let degraded = snapshot.queue_depth > self.config.max_queue_depth
            || snapshot.memory_pct > self.config.max_memory_pct;
        self.health_tx.send_replace(snapshot.clone());

        let state = *self.state_tx.borrow();
        match (state, degraded) {
            (SupervisorState::Running, true) => {
                warn!(
                    target: "vigil::supervisor",
                    queue_depth = snapshot.queue_depth,
                    memory_pct = snapshot.memory_pct,
                    "pipeline degraded"
                );
                self.transition(SupervisorState::Degraded).await;
            }
            (SupervisorState::Degraded, false) => {
                info!(target: "vigil::supervisor", "pipeline recovered");
                self.transition(SupervisorState::Running).await;
            }
            _ => self.publish_status().await,
        }

        let prune_due = self
            .last_prune
            .is_none_or(|at| at.elapsed() >= RETENTION_SWEEP_INTERVAL);
        if prune_due {
            self.last_prune = Some(Instant::now());
        }
        self.service.maintain(prune_due).await;

        if self.take_stop_request().await {
            Tick::StopRequested
        } else {
            Tick::Continue
        }
    }

    async fn sample(&mut self) -> HealthSnapshot {
        let (memory_pct, cpu_pct) = match self.sampler.take() {
            Some(mut sampler) => {
                match tokio::task::spawn_blocking(move || {
                    let sample = sampler.sample();
                    (sampler, sample)
                })
                .await
                {
                    Ok((sampler, sample)) => {
                        self.sampler = Some(sampler);
                        sample
                    }
                    Err(err) => {
                        debug!(target: "vigil::supervisor", error = %err, "resource sampling failed");
                        self.sampler = Some(ResourceSampler::new());
                        (0.0, 0.0)
                    }
                }
            }
            None => (0.0, 0.0),
        };

        let metrics = self.metrics.snapshot();
        HealthSnapshot {
            uptime: self.started.elapsed(),
            queue_depth: metrics.queue_depth,
            memory_pct,
            cpu_pct,
            files_watched: metrics.files_watched,
            completed: metrics.completed,
            failed: metrics.failed,
            crashes_recovered: self.restarts,
            sampled_at: Utc::now(),
        }
    }

    async fn publish_status(&self) {
        let report = StatusReport {
            state: *self.state_tx.borrow(),
            pid: std::process::id(),
            restarts: self.restarts,
            health: self.health_tx.borrow().clone(),
            metrics: self.metrics.snapshot(),
            updated_at: Utc::now(),
        };
        if let Some(parent) = self.status_path.parent()
            && let Err(err) = tokio::fs::create_dir_all(parent).await
        {
            warn!(target: "vigil::supervisor", error = %err, "unable to create state directory");
            return;
        }
        if let Err(err) = report.write(&self.status_path).await {
            warn!(target: "vigil::supervisor", path = %self.status_path.display(), error = %err, "failed to write status file");
        }
    }

    async fn take_stop_request(&self) -> bool {
        if !tokio::fs::try_exists(&self.stop_path).await.unwrap_or(false) {
            return false;
        }
        if let Err(err) = tokio::fs::remove_file(&self.stop_path).await {
            warn!(target: "vigil::supervisor", error = %err, "failed to remove stop request");
        }
        true
    }

    async fn clear_stale_stop_request(&self) {
        if self.take_stop_request().await {
            debug!(target: "vigil::supervisor", "removed stale stop request");
        }
    }
}

/// Ask a running supervisor (possibly in another process) to stop at its
/// next health tick.
pub async fn request_stop(config: &VigilConfig) -> Result<PathBuf> {
    let path = config.stop_request_path();
    tokio::fs::create_dir_all(&config.state_dir).await?;
    tokio::fs::write(&path, Utc::now().to_rfc3339()).await?;
    Ok(path)
}

#[cfg(test)]
mod tests {
    use std::sync::atomic::{AtomicU32, Ordering};

    use super::*;

    struct Flaky {
        failures: u32,
        generations: AtomicU32,
        outer: CancellationToken,
    }

    #[async_trait]
    impl Service for Flaky {
        async fn run(&self, _metrics: Arc<PipelineMetrics>, shutdown: CancellationToken) -> Result<()> {
            let generation = self.generations.fetch_add(1, Ordering::SeqCst) + 1;
            if generation <= self.failures {
                return Err(PipelineError::Internal(format!("generation {generation} failed")));
            }
            self.outer.cancel();
            shutdown.cancelled().await;
            Ok(())
        }
    }

    struct Panics;

    #[async_trait]
    impl Service for Panics {
        async fn run(&self, _metrics: Arc<PipelineMetrics>, _shutdown: CancellationToken) -> Result<()> {
            panic!("scheduler invariant violated");
        }
    }

    struct Misconfigured;

    #[async_trait]
    impl Service for Misconfigured {
        async fn run(&self, _metrics: Arc<PipelineMetrics>, _shutdown: CancellationToken) -> Result<()> {
            Err(PipelineError::Config("no watch roots configured".into()))
        }
    }

    struct Interrupted;

    #[async_trait]
    impl Service for Interrupted {
        async fn run(&self, _metrics: Arc<PipelineMetrics>, _shutdown: CancellationToken) -> Result<()> {
            Err(PipelineError::Cancelled("watcher stream torn down".into()))
        }
    }

    struct Idle;

    #[async_trait]
    impl Service for Idle {
        async fn run(&self, _metrics: Arc<PipelineMetrics>, shutdown: CancellationToken) -> Result<()> {
            shutdown.cancelled().await;
            Ok(())
        }
    }

    fn config(state_dir: &Path, max_restarts: u32) -> VigilConfig {
        let mut config = VigilConfig {
            state_dir: state_dir.to_path_buf(),
            ..VigilConfig::default()
        };
        config.supervisor.restart_delay_ms = 1;
        config.supervisor.max_restart_delay_ms = 5;
        config.supervisor.max_restarts = max_restarts;
        config.supervisor.health_interval_ms = 20;
        config.orchestrator.shutdown_grace_ms = 50;
        config
    }

    #[tokio::test]
    async fn recovers_from_crashes_within_the_cap() {
        let tmp = tempfile::tempdir().expect("tempdir");
        let outer = CancellationToken::new();
        let service = Flaky {
            failures: 2,
            generations: AtomicU32::new(0),
            outer: outer.clone(),
        };

        let outcome = Supervisor::new(config(tmp.path(), 5), service)
            .run(outer)
            .await;

        use SupervisorState::*;
        assert_eq!(outcome.reason, StopReason::Requested);
        assert_eq!(outcome.exit_code(), 0);
        assert_eq!(outcome.restarts, 2);
        assert_eq!(
            outcome.transitions,
            vec![
                Starting, Running, Crashed, Restarting, Running, Crashed, Restarting, Running,
                Stopped
            ]
        );
    }

    #[tokio::test]
    async fn exhausting_restarts_stops_with_failure() {
        let tmp = tempfile::tempdir().expect("tempdir");
        let outcome = Supervisor::new(config(tmp.path(), 2), Panics)
            .run(CancellationToken::new())
            .await;

        assert!(matches!(outcome.reason, StopReason::RestartsExhausted { .. }));
        assert_eq!(outcome.exit_code(), 1);
        assert_eq!(outcome.restarts, 2);
        assert_eq!(outcome.transitions.last(), Some(&SupervisorState::Stopped));

        let status = StatusReport::read(&tmp.path().join("health.json"))
            .await
            .expect("status file");
        assert_eq!(status.state, SupervisorState::Stopped);
    }

    #[tokio::test]
    async fn configuration_errors_are_not_retried() {
        let tmp = tempfile::tempdir().expect("tempdir");
        let outcome = Supervisor::new(config(tmp.path(), 5), Misconfigured)
            .run(CancellationToken::new())
            .await;

        assert!(matches!(outcome.reason, StopReason::Configuration(_)));
        assert_eq!(outcome.exit_code(), 2);
        assert_eq!(outcome.restarts, 0);
        assert!(!outcome.transitions.contains(&SupervisorState::Restarting));
    }

    #[tokio::test]
    async fn cancelled_generation_stops_without_restarting() {
        let tmp = tempfile::tempdir().expect("tempdir");
        let outcome = Supervisor::new(config(tmp.path(), 5), Interrupted)
            .run(CancellationToken::new())
            .await;

        assert_eq!(outcome.reason, StopReason::Requested);
        assert_eq!(outcome.exit_code(), 0);
        assert_eq!(outcome.restarts, 0);
        assert!(!outcome.transitions.contains(&SupervisorState::Crashed));
    }

    #[tokio::test]
    async fn stop_request_file_stops_cleanly() {
        let tmp = tempfile::tempdir().expect("tempdir");
        let cfg = config(tmp.path(), 5);
        let supervisor = Supervisor::new(cfg.clone(), Idle);
        let mut state = supervisor.subscribe_state();
        let run = tokio::spawn(supervisor.run(CancellationToken::new()));

        state
            .wait_for(|s| *s == SupervisorState::Running)
            .await
            .expect("running");
        request_stop(&cfg).await.expect("request stop");

        let outcome = tokio::time::timeout(Duration::from_secs(5), run)
            .await
            .expect("stopped in time")
            .expect("join");
        assert_eq!(outcome.exit_code(), 0);
        assert!(!cfg.stop_request_path().exists());
    }

    #[tokio::test]
    async fn queue_depth_above_threshold_degrades_then_recovers() {
        let tmp = tempfile::tempdir().expect("tempdir");
        let mut cfg = config(tmp.path(), 5);
        cfg.supervisor.max_queue_depth = 1;
        cfg.supervisor.max_memory_pct = 100.0;

        let metrics = Arc::new(PipelineMetrics::new());
        let supervisor = Supervisor::new(cfg, Idle).with_metrics(Arc::clone(&metrics));
        let mut state = supervisor.subscribe_state();
        let mut health = supervisor.subscribe_health();
        let shutdown = CancellationToken::new();
        let run = tokio::spawn(supervisor.run(shutdown.clone()));

        metrics.item_queued();
        metrics.item_queued();
        state
            .wait_for(|s| *s == SupervisorState::Degraded)
            .await
            .expect("degraded");
        assert!(health.borrow_and_update().queue_depth >= 2);

        metrics.item_dequeued();
        metrics.item_dequeued();
        state
            .wait_for(|s| *s == SupervisorState::Running)
            .await
            .expect("recovered");

        shutdown.cancel();
        let outcome = run.await.expect("join");
        assert_eq!(outcome.reason, StopReason::Requested);
    }
}
