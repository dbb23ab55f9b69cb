use std::sync::Arc;
use std::time::Duration;

use anyhow::{Context, Result, bail};
use chrono::Utc;
use tokio_util::sync::CancellationToken;
use tracing::info;
use vigil_core::PipelineError;
use vigil_core::config::VigilConfig;
use vigil_core::metrics::PipelineMetrics;
use vigil_core::orchestrate::ResultCache;
use vigil_core::pipeline::{Pipeline, PipelineOverrides, RunMode};
use vigil_core::store::{FingerprintStore, SqliteFingerprintStore};
use vigil_core::supervisor::{
    PipelineService, StatusReport, StopReason, Supervisor, SupervisorState, request_stop,
};

/// Cancel `token` on the first Ctrl-C.
fn cancel_on_ctrl_c(token: CancellationToken) {
    tokio::spawn(async move {
        if tokio::signal::ctrl_c().await.is_ok() {
            info!("interrupt received; shutting down");
            token.cancel();
        }
    });
}

/// Returns the process exit code.
pub async fn run(config: VigilConfig) -> Result<i32> {
    let shutdown = CancellationToken::new();
    cancel_on_ctrl_c(shutdown.clone());

    info!(
        roots = ?config.watch.roots,
        state_dir = %config.state_dir.display(),
        "starting supervisor"
    );
    let service = PipelineService::new(config.clone());
    let outcome = Supervisor::new(config, service).run(shutdown).await;

    match &outcome.reason {
        StopReason::Requested | StopReason::Finished => {
            info!(restarts = outcome.restarts, "supervisor stopped")
        }
        StopReason::RestartsExhausted { last_error } => {
            eprintln!(
                "vigil stopped after {} restarts; last error: {last_error}",
                outcome.restarts
            )
        }
        StopReason::Configuration(message) => eprintln!("configuration error: {message}"),
    }
    Ok(outcome.exit_code())
}

pub async fn rescan(config: VigilConfig, force: bool) -> Result<()> {
    let shutdown = CancellationToken::new();
    cancel_on_ctrl_c(shutdown.clone());

    let pipeline = Pipeline::build(
        config,
        Arc::new(PipelineMetrics::new()),
        &PipelineOverrides::default(),
    )
    .await
    .context("failed to build pipeline")?;
    let summary = pipeline
        .run(RunMode::Rescan { force }, shutdown)
        .await
        .context("rescan failed")?;

    println!(
        "scanned {} files, {} reports delivered",
        summary.files_scanned, summary.reports
    );
    Ok(())
}

pub async fn status(config: &VigilConfig, json: bool) -> Result<()> {
    let path = config.status_path();
    let report = match StatusReport::read(&path).await {
        Ok(report) => report,
        Err(PipelineError::NotFound(_)) => {
            bail!(
                "no status at {}; is `vigilctl run` active for this state_dir?",
                path.display()
            )
        }
        Err(err) => return Err(err).context("failed to read status"),
    };

    if json {
        println!("{}", serde_json::to_string_pretty(&report)?);
        return Ok(());
    }

    let age = Utc::now().signed_duration_since(report.updated_at);
    let interval = config.supervisor.health_interval();
    let stale = report.state != SupervisorState::Stopped
        && age.to_std().is_ok_and(|age| age > interval * 3);

    println!("state:      {}{}", report.state, if stale { " (stale)" } else { "" });
    println!("pid:        {}", report.pid);
    println!("restarts:   {}", report.restarts);
    println!(
        "uptime:     {}",
        humantime::format_duration(Duration::from_secs(report.health.uptime.as_secs()))
    );
    println!("watched:    {}", report.health.files_watched);
    println!("queue:      {}", report.health.queue_depth);
    println!(
        "validated:  {} ({} failed)",
        report.health.completed, report.health.failed
    );
    println!(
        "cache:      {} hits / {} misses",
        report.metrics.cache_hits, report.metrics.cache_misses
    );
    println!(
        "resources:  {:.1}% memory, {:.1}% cpu",
        report.health.memory_pct, report.health.cpu_pct
    );
    println!("updated:    {}", report.updated_at.to_rfc3339());
    Ok(())
}

pub async fn stop(config: &VigilConfig) -> Result<()> {
    let path = request_stop(config)
        .await
        .context("failed to write stop request")?;
    println!(
        "stop requested ({}); the supervisor exits within {}",
        path.display(),
        humantime::format_duration(config.supervisor.health_interval())
    );
    Ok(())
}

fn open_cache(config: &VigilConfig) -> Result<ResultCache> {
    ResultCache::open(config.cache_dir(), &config.cache).context("failed to open result cache")
}

pub async fn cache_stats(config: &VigilConfig) -> Result<()> {
    let cache = open_cache(config)?;
    let (entries, bytes) = cache.disk_usage().await?;
    println!(
        "{entries} entries, {bytes} bytes in {}",
        cache.root().display()
    );
    Ok(())
}

pub async fn cache_clear(config: &VigilConfig) -> Result<()> {
    open_cache(config)?
        .clear()
        .await
        .context("failed to clear result cache")?;
    println!("result cache cleared");
    Ok(())
}

pub async fn cache_sweep(config: &VigilConfig) -> Result<()> {
    let summary = open_cache(config)?.cleanup_once().await;
    println!(
        "checked {} entries: {} expired, {} over size limit, {} bytes remain",
        summary.entries_seen, summary.removed_ttl, summary.removed_size, summary.bytes_after
    );
    Ok(())
}

async fn open_store(config: &VigilConfig) -> Result<SqliteFingerprintStore> {
    tokio::fs::create_dir_all(&config.state_dir)
        .await
        .with_context(|| format!("failed to create {}", config.state_dir.display()))?;
    SqliteFingerprintStore::open(&config.database_path(), &config.store)
        .await
        .context("failed to open fingerprint store")
}

pub async fn history(config: &VigilConfig, window: Duration, min_count: u32) -> Result<()> {
    let window_chrono =
        chrono::Duration::from_std(window).context("history window is too large")?;
    let store = open_store(config).await?;

    let stats = store.validation_stats(window_chrono).await?;
    let hot = store.hot_files(window_chrono, min_count).await?;
    store.close().await;

    println!("last {}:", humantime::format_duration(window));
    match stats.success_rate() {
        Some(rate) => println!(
            "  {} runs, {} passed, {} failed ({:.1}% pass, mean {:.0}ms)",
            stats.runs,
            stats.passed,
            stats.failed,
            rate * 100.0,
            stats.mean_duration_ms
        ),
        None => println!("  no validations recorded"),
    }
    if !hot.is_empty() {
        println!("hot files (>= {min_count} runs):");
        for file in hot {
            println!("  {:>5}  {}", file.count, file.path.display());
        }
    }
    Ok(())
}

pub async fn prune(config: &VigilConfig, days: Option<u32>) -> Result<()> {
    let days = days.unwrap_or(config.store.retention_days);
    let cutoff = Utc::now() - chrono::Duration::days(i64::from(days));
    let store = open_store(config).await?;
    let removed = store.prune_history(cutoff).await?;
    store.close().await;
    println!("removed {removed} validation records older than {days} days");
    Ok(())
}
