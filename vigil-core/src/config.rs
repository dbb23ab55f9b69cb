use std::path::{Path, PathBuf};
use std::time::Duration;

use serde::{Deserialize, Serialize};

use crate::types::Severity;

/// Top-level knobs for one vigil process.
///
/// Every section carries defaults so a config file only needs to name the
/// roots it watches.
#[derive(Clone, Debug, Serialize, Deserialize)]
#[serde(default)]
pub struct VigilConfig {
    /// Directory holding the fingerprint database, result cache, status
    /// file and stop request.
    pub state_dir: PathBuf,
    /// Filesystem watch boundary.
    pub watch: WatchConfig,
    /// Significance heuristics.
    pub detector: DetectorConfig,
    /// Quiescence window and dispatch queue sizing.
    pub debounce: DebounceConfig,
    /// Validator routing and concurrency.
    pub orchestrator: OrchestratorConfig,
    /// Result cache TTL and size cap.
    pub cache: CacheConfig,
    /// Fingerprint store retention.
    pub store: StoreConfig,
    /// Health thresholds and restart policy.
    pub supervisor: SupervisorConfig,
    /// Where reports go.
    pub notifier: NotifierConfig,
}

impl Default for VigilConfig {
    fn default() -> Self {
        Self {
            state_dir: PathBuf::from(".vigil"),
            watch: WatchConfig::default(),
            detector: DetectorConfig::default(),
            debounce: DebounceConfig::default(),
            orchestrator: OrchestratorConfig::default(),
            cache: CacheConfig::default(),
            store: StoreConfig::default(),
            supervisor: SupervisorConfig::default(),
            notifier: NotifierConfig::default(),
        }
    }
}

impl VigilConfig {
    pub fn database_path(&self) -> PathBuf {
        self.state_dir.join("vigil.db")
    }

    pub fn cache_dir(&self) -> PathBuf {
        self.state_dir.join("cache")
    }

    pub fn status_path(&self) -> PathBuf {
        self.state_dir.join("health.json")
    }

    pub fn stop_request_path(&self) -> PathBuf {
        self.state_dir.join("stop")
    }
}

/// Roots plus allow/deny filters. Static; never derived at runtime.
#[derive(Clone, Debug, Serialize, Deserialize)]
#[serde(default)]
pub struct WatchConfig {
    pub roots: Vec<PathBuf>,
    /// File extensions (without dot) eligible for validation. Empty allows all.
    pub allow_extensions: Vec<String>,
    /// Any path whose root-relative form contains one of these substrings is ignored.
    pub deny_substrings: Vec<String>,
    /// Capacity of the raw event channel between notify and the detector.
    pub channel_capacity: usize,
    /// Walk every root when a pipeline generation starts.
    pub initial_scan: bool,
}

impl Default for WatchConfig {
    fn default() -> Self {
        Self {
            roots: Vec::new(),
            allow_extensions: [
                "py", "rs", "js", "ts", "tsx", "jsx", "go", "java", "rb", "sh", "sql",
                "json", "toml", "yaml", "yml", "ini", "cfg",
            ]
            .iter()
            .map(|ext| ext.to_string())
            .collect(),
            deny_substrings: [
                "/.git/",
                "/target/",
                "/node_modules/",
                "/__pycache__/",
                "/.venv/",
                "/dist/",
                "/build/",
                "/.vigil/",
            ]
            .iter()
            .map(|s| s.to_string())
            .collect(),
            channel_capacity: 4096,
            initial_scan: true,
        }
    }
}

/// Thresholds for the change detector's significance verdict.
#[derive(Clone, Debug, Serialize, Deserialize)]
#[serde(default)]
pub struct DetectorConfig {
    /// A validation of the exact same hash younger than this suppresses
    /// re-validation.
    pub revalidate_after_secs: u64,
    /// Force re-validation when the last run for a path is older than this.
    pub stale_after_secs: u64,
    pub sensitivity: SensitivityConfig,
    /// Structured config formats validated on every content change.
    pub always_validate_extensions: Vec<String>,
    /// Control-flow and security-sensitive tokens counted by the keyword
    /// density signal.
    pub sensitive_keywords: Vec<String>,
}

impl DetectorConfig {
    pub fn revalidate_after(&self) -> chrono::Duration {
        chrono::Duration::seconds(self.revalidate_after_secs as i64)
    }

    pub fn stale_after(&self) -> chrono::Duration {
        chrono::Duration::seconds(self.stale_after_secs as i64)
    }
}

impl Default for DetectorConfig {
    fn default() -> Self {
        Self {
            revalidate_after_secs: 60 * 60,
            stale_after_secs: 24 * 60 * 60,
            sensitivity: SensitivityConfig::default(),
            always_validate_extensions: ["json", "toml", "yaml", "yml", "ini", "cfg"]
                .iter()
                .map(|ext| ext.to_string())
                .collect(),
            sensitive_keywords: [
                "if", "else", "elif", "for", "while", "match", "switch", "case", "return",
                "try", "except", "catch", "raise", "throw", "unsafe", "eval", "exec",
                "subprocess", "password", "secret", "token", "query", "execute", "sql",
                "tenant", "auth",
            ]
            .iter()
            .map(|kw| kw.to_string())
            .collect(),
        }
    }
}

/// Tunable cutoffs; neither value is a semantic contract.
#[derive(Clone, Copy, Debug, Serialize, Deserialize)]
#[serde(default)]
pub struct SensitivityConfig {
    /// `|new_size - old_size| / max(old_size, 1)` at or above this is significant.
    pub min_size_delta_ratio: f64,
    /// Sensitive keyword hits per non-empty line at or above this is significant.
    pub min_keyword_density: f64,
}

impl Default for SensitivityConfig {
    fn default() -> Self {
        Self {
            min_size_delta_ratio: 0.05,
            min_keyword_density: 0.15,
        }
    }
}

#[derive(Clone, Debug, Serialize, Deserialize)]
#[serde(default)]
pub struct DebounceConfig {
    /// Quiescence window in milliseconds.
    pub quiet_window_ms: u64,
    /// Bound on emitted-but-not-started work items (backpressure).
    pub dispatch_queue_capacity: usize,
}

impl DebounceConfig {
    pub fn quiet_window(&self) -> Duration {
        Duration::from_millis(self.quiet_window_ms)
    }
}

impl Default for DebounceConfig {
    fn default() -> Self {
        Self {
            quiet_window_ms: 50,
            dispatch_queue_capacity: 256,
        }
    }
}

#[derive(Clone, Debug, Serialize, Deserialize)]
#[serde(default)]
pub struct OrchestratorConfig {
    /// Global cap on concurrently executing validator calls.
    pub max_concurrency: usize,
    /// Work items allowed in flight at once; `0` means twice `max_concurrency`.
    pub max_inflight_items: usize,
    /// Per-call validator timeout.
    pub validator_timeout_ms: u64,
    /// How long in-flight work may run after shutdown before it is abandoned.
    pub shutdown_grace_ms: u64,
    /// Path/extension routing table. First-class ordered list; every matching
    /// rule contributes its validators.
    pub policy: Vec<PolicyRuleConfig>,
    /// Rules for the built-in `patterns` validator.
    pub patterns: Vec<PatternRuleConfig>,
}

impl OrchestratorConfig {
    pub fn validator_timeout(&self) -> Duration {
        Duration::from_millis(self.validator_timeout_ms)
    }

    pub fn shutdown_grace(&self) -> Duration {
        Duration::from_millis(self.shutdown_grace_ms)
    }

    pub fn effective_inflight_items(&self) -> usize {
        if self.max_inflight_items == 0 {
            self.max_concurrency.max(1) * 2
        } else {
            self.max_inflight_items
        }
    }
}

impl Default for OrchestratorConfig {
    fn default() -> Self {
        Self {
            max_concurrency: num_cpus::get().max(1),
            max_inflight_items: 0,
            validator_timeout_ms: 30_000,
            shutdown_grace_ms: 10_000,
            policy: vec![
                PolicyRuleConfig {
                    name: "structured-data".into(),
                    extensions: vec!["json".into(), "toml".into()],
                    path_contains: Vec::new(),
                    validators: vec!["structured".into()],
                },
                PolicyRuleConfig {
                    name: "all-files".into(),
                    extensions: vec!["*".into()],
                    path_contains: Vec::new(),
                    validators: vec!["patterns".into()],
                },
            ],
            patterns: Vec::new(),
        }
    }
}

/// One row of the routing table.
#[derive(Clone, Debug, Serialize, Deserialize, PartialEq, Eq)]
pub struct PolicyRuleConfig {
    pub name: String,
    /// Extensions without the dot; `"*"` matches every file.
    #[serde(default)]
    pub extensions: Vec<String>,
    /// Additionally match when the path contains any of these substrings.
    #[serde(default)]
    pub path_contains: Vec<String>,
    pub validators: Vec<String>,
}

/// Operator-supplied regex rule for the `patterns` validator.
#[derive(Clone, Debug, Serialize, Deserialize, PartialEq, Eq)]
pub struct PatternRuleConfig {
    pub id: String,
    pub pattern: String,
    pub severity: Severity,
    pub message: String,
    #[serde(default)]
    pub fix: Option<String>,
    /// Restrict the rule to these extensions. Empty applies everywhere.
    #[serde(default)]
    pub extensions: Vec<String>,
}

#[derive(Clone, Debug, Serialize, Deserialize)]
#[serde(default)]
pub struct CacheConfig {
    pub ttl_secs: u64,
    /// Size cap for the on-disk cache; `0` disables size eviction.
    pub max_bytes: u64,
}

impl CacheConfig {
    pub fn ttl(&self) -> Duration {
        Duration::from_secs(self.ttl_secs)
    }
}

impl Default for CacheConfig {
    fn default() -> Self {
        Self {
            ttl_secs: 7 * 24 * 60 * 60,
            max_bytes: 256 * 1024 * 1024,
        }
    }
}

#[derive(Clone, Debug, Serialize, Deserialize)]
#[serde(default)]
pub struct StoreConfig {
    /// Validation history older than this is removed by the retention sweep.
    pub retention_days: u32,
    pub busy_timeout_ms: u64,
}

impl Default for StoreConfig {
    fn default() -> Self {
        Self {
            retention_days: 30,
            busy_timeout_ms: 5_000,
        }
    }
}

#[derive(Clone, Debug, Serialize, Deserialize)]
#[serde(default)]
pub struct SupervisorConfig {
    pub health_interval_ms: u64,
    /// Queue depth above this marks the pipeline Degraded.
    pub max_queue_depth: u64,
    /// Process memory (percent of system total) above this marks it Degraded.
    pub max_memory_pct: f32,
    /// Delay before the first restart attempt.
    pub restart_delay_ms: u64,
    /// Multiplier applied to the delay for every further attempt.
    pub restart_backoff_factor: f32,
    pub max_restart_delay_ms: u64,
    /// Restart attempts allowed within the process lifetime.
    pub max_restarts: u32,
}

impl SupervisorConfig {
    pub fn health_interval(&self) -> Duration {
        Duration::from_millis(self.health_interval_ms.max(1))
    }

    /// Delay before restart attempt `attempt` (1-based).
    pub fn restart_delay(&self, attempt: u32) -> Duration {
        let base = self.restart_delay_ms as f64;
        let factor = f64::from(self.restart_backoff_factor.max(1.0));
        let exponent = attempt.saturating_sub(1).min(16) as i32;
        let delay = (base * factor.powi(exponent)).min(self.max_restart_delay_ms as f64);
        Duration::from_millis(delay.max(0.0) as u64)
    }
}

impl Default for SupervisorConfig {
    fn default() -> Self {
        Self {
            health_interval_ms: 30_000,
            max_queue_depth: 1_000,
            max_memory_pct: 80.0,
            restart_delay_ms: 1_000,
            restart_backoff_factor: 2.0,
            max_restart_delay_ms: 30_000,
            max_restarts: 5,
        }
    }
}

#[derive(Clone, Copy, Debug, Default, Serialize, Deserialize, PartialEq, Eq)]
#[serde(rename_all = "snake_case")]
pub enum NotifierKind {
    #[default]
    Log,
    Jsonl,
}

#[derive(Clone, Debug, Default, Serialize, Deserialize)]
#[serde(default)]
pub struct NotifierConfig {
    pub kind: NotifierKind,
    /// Output file for the `jsonl` notifier; defaults to `<state_dir>/reports.jsonl`.
    pub path: Option<PathBuf>,
}

impl NotifierConfig {
    pub fn resolved_path(&self, state_dir: &Path) -> PathBuf {
        self.path
            .clone()
            .unwrap_or_else(|| state_dir.join("reports.jsonl"))
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn restart_delay_backs_off_and_caps() {
        let cfg = SupervisorConfig {
            restart_delay_ms: 100,
            restart_backoff_factor: 2.0,
            max_restart_delay_ms: 500,
            ..SupervisorConfig::default()
        };
        assert_eq!(cfg.restart_delay(1), Duration::from_millis(100));
        assert_eq!(cfg.restart_delay(2), Duration::from_millis(200));
        assert_eq!(cfg.restart_delay(3), Duration::from_millis(400));
        assert_eq!(cfg.restart_delay(4), Duration::from_millis(500));
    }

    #[test]
    fn inflight_items_default_tracks_concurrency() {
        let cfg = OrchestratorConfig {
            max_concurrency: 3,
            ..OrchestratorConfig::default()
        };
        assert_eq!(cfg.effective_inflight_items(), 6);
    }

    #[test]
    fn partial_toml_fills_defaults() {
        let cfg: VigilConfig = toml::from_str(
            r#"
            [watch]
            roots = ["src"]

            [debounce]
            quiet_window_ms = 120
            "#,
        )
        .expect("parse config");
        assert_eq!(cfg.watch.roots, vec![PathBuf::from("src")]);
        assert_eq!(cfg.debounce.quiet_window_ms, 120);
        assert_eq!(cfg.supervisor.max_restarts, 5);
        assert!(!cfg.watch.allow_extensions.is_empty());
    }
}
