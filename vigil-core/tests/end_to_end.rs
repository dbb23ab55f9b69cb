//! Full pipeline with a real filesystem watcher.

mod common;

use std::path::Path;
use std::sync::Arc;
use std::sync::atomic::{AtomicBool, Ordering};
use std::time::Duration;

use async_trait::async_trait;
use common::{CountingValidator, eventually};
use tokio_util::sync::CancellationToken;
use vigil_core::config::{PolicyRuleConfig, VigilConfig};
use vigil_core::feedback::CollectingNotifier;
use vigil_core::hash::hash_bytes;
use vigil_core::metrics::PipelineMetrics;
use vigil_core::orchestrate::ValidatorRegistry;
use vigil_core::pipeline::{Pipeline, PipelineOverrides, RunMode};
use vigil_core::supervisor::{PipelineService, Service, StopReason, Supervisor, SupervisorState};
use vigil_core::types::Severity;
use vigil_core::{PipelineError, Result};

fn config(root: &Path, state_dir: &Path, quiet_window_ms: u64) -> VigilConfig {
    let mut config = VigilConfig {
        state_dir: state_dir.to_path_buf(),
        ..VigilConfig::default()
    };
    config.watch.roots = vec![root.to_path_buf()];
    config.debounce.quiet_window_ms = quiet_window_ms;
    config.orchestrator.max_concurrency = 2;
    config.orchestrator.shutdown_grace_ms = 500;
    config.orchestrator.policy = vec![PolicyRuleConfig {
        name: "python".into(),
        extensions: vec!["py".into()],
        path_contains: Vec::new(),
        validators: vec!["lint".into()],
    }];
    config.supervisor.restart_delay_ms = 10;
    config.supervisor.health_interval_ms = 100;
    config
}

fn overrides(notifier: Arc<CollectingNotifier>) -> (PipelineOverrides, Arc<CountingValidator>) {
    let lint = CountingValidator::new("lint", Severity::Info);
    let mut registry = ValidatorRegistry::new();
    registry.register(lint.clone());
    (
        PipelineOverrides {
            validators: Some(registry),
            notifier: Some(notifier),
        },
        lint,
    )
}

/// Three back-to-back writes to one file under a watching pipeline must
/// yield a single report for the final bytes.
async fn three_quick_writes_yield_one_report(quiet_window_ms: u64) {
    let tmp = tempfile::tempdir().expect("tempdir");
    let root = tmp.path().join("project");
    std::fs::create_dir_all(&root).expect("mkdir");
    let file = root.join("a.py");
    std::fs::write(&file, "print('initial')\n").expect("seed a.py");

    let mut cfg = config(&root, &tmp.path().join("state"), quiet_window_ms);
    cfg.watch.initial_scan = false;

    let notifier = Arc::new(CollectingNotifier::default());
    let (overrides, lint) = overrides(notifier.clone());
    let pipeline = Pipeline::build(cfg, Arc::new(PipelineMetrics::new()), &overrides)
        .await
        .expect("build pipeline");
    let shutdown = CancellationToken::new();
    let run = tokio::spawn(pipeline.run(RunMode::Watch, shutdown.clone()));

    // Let the watcher attach before editing.
    tokio::time::sleep(Duration::from_millis(200)).await;
    let third = "print('three')\nprint('lines')\nprint('now')\n";
    std::fs::write(&file, "print('one')\n").expect("write 1");
    std::fs::write(&file, "print('two')\nprint('lines')\n").expect("write 2");
    std::fs::write(&file, third).expect("write 3");

    assert!(
        eventually(Duration::from_secs(5), || !notifier.reports().is_empty()).await,
        "no report delivered"
    );
    // Anything still in flight would land well inside this window.
    tokio::time::sleep(Duration::from_millis(800)).await;

    let reports = notifier.reports();
    assert_eq!(reports.len(), 1, "expected exactly one report");
    assert_eq!(reports[0].content_hash, hash_bytes(third.as_bytes()));
    assert_eq!(lint.calls(), 1);

    shutdown.cancel();
    run.await.expect("join").expect("clean shutdown");
}

#[tokio::test(flavor = "multi_thread", worker_threads = 2)]
async fn three_quick_writes_produce_one_report_for_the_last_content() {
    three_quick_writes_yield_one_report(300).await;
}

#[tokio::test(flavor = "multi_thread", worker_threads = 2)]
async fn default_quiet_window_still_coalesces_quick_writes() {
    let window = VigilConfig::default().debounce.quiet_window_ms;
    assert_eq!(window, 50);
    three_quick_writes_yield_one_report(window).await;
}

/// Fails its first generation, then behaves like the real pipeline.
struct CrashOnce {
    inner: PipelineService,
    crashed: AtomicBool,
}

#[async_trait]
impl Service for CrashOnce {
    async fn run(&self, metrics: Arc<PipelineMetrics>, shutdown: CancellationToken) -> Result<()> {
        if !self.crashed.swap(true, Ordering::SeqCst) {
            return Err(PipelineError::Internal("simulated scheduler fault".into()));
        }
        self.inner.run(metrics, shutdown).await
    }

    async fn maintain(&self, prune_history: bool) {
        self.inner.maintain(prune_history).await;
    }
}

#[tokio::test(flavor = "multi_thread", worker_threads = 2)]
async fn supervisor_restarts_the_pipeline_and_it_keeps_processing() {
    let tmp = tempfile::tempdir().expect("tempdir");
    let root = tmp.path().join("project");
    std::fs::create_dir_all(&root).expect("mkdir");
    std::fs::write(root.join("before.py"), "x = 1\n").expect("seed");

    let cfg = config(&root, &tmp.path().join("state"), 50);
    let notifier = Arc::new(CollectingNotifier::default());
    let (overrides, _lint) = overrides(notifier.clone());
    let service = CrashOnce {
        inner: PipelineService::new(cfg.clone()).with_overrides(overrides),
        crashed: AtomicBool::new(false),
    };

    let shutdown = CancellationToken::new();
    let run = tokio::spawn(Supervisor::new(cfg, service).run(shutdown.clone()));

    // The first generation never gets that far, so any report comes from the
    // restarted generation's initial scan.
    assert!(
        eventually(Duration::from_secs(5), || {
            notifier
                .reports()
                .iter()
                .any(|r| r.path.ends_with("before.py"))
        })
        .await,
        "scan after restart produced no report"
    );

    std::fs::write(root.join("after.py"), "y = 2\n").expect("write new file");
    assert!(
        eventually(Duration::from_secs(5), || {
            notifier
                .reports()
                .iter()
                .any(|r| r.path.ends_with("after.py"))
        })
        .await,
        "new edit after restart was not processed"
    );

    shutdown.cancel();
    let outcome = run.await.expect("join");
    assert_eq!(outcome.reason, StopReason::Requested);
    assert_eq!(outcome.restarts, 1);
    assert_eq!(outcome.exit_code(), 0);
    assert_eq!(
        &outcome.transitions[..5],
        &[
            SupervisorState::Starting,
            SupervisorState::Running,
            SupervisorState::Crashed,
            SupervisorState::Restarting,
            SupervisorState::Running,
        ]
    );
}
