use std::path::PathBuf;

use crate::util::{parse_csv, path_var, raw_var};

pub const ENV_CONFIG_PATH: &str = "VIGIL_CONFIG_PATH";
pub const ENV_ROOTS: &str = "VIGIL_ROOTS";
pub const ENV_STATE_DIR: &str = "VIGIL_STATE_DIR";
pub const ENV_DEBOUNCE_MS: &str = "VIGIL_DEBOUNCE_MS";
pub const ENV_MAX_CONCURRENCY: &str = "VIGIL_MAX_CONCURRENCY";
pub const ENV_VALIDATOR_TIMEOUT_MS: &str = "VIGIL_VALIDATOR_TIMEOUT_MS";

/// Environment overrides, captured once so loading is deterministic.
/// Numeric values stay raw until the loader parses them.
#[derive(Debug, Default, Clone, PartialEq, Eq)]
pub struct EnvConfig {
    pub config_path: Option<PathBuf>,
    pub roots: Option<Vec<PathBuf>>,
    pub state_dir: Option<PathBuf>,
    pub debounce_ms: Option<String>,
    pub max_concurrency: Option<String>,
    pub validator_timeout_ms: Option<String>,
}

impl EnvConfig {
    pub fn gather() -> Self {
        Self {
            config_path: path_var(ENV_CONFIG_PATH),
            roots: raw_var(ENV_ROOTS)
                .map(|raw| parse_csv(&raw).into_iter().map(PathBuf::from).collect()),
            state_dir: path_var(ENV_STATE_DIR),
            debounce_ms: raw_var(ENV_DEBOUNCE_MS),
            max_concurrency: raw_var(ENV_MAX_CONCURRENCY),
            validator_timeout_ms: raw_var(ENV_VALIDATOR_TIMEOUT_MS),
        }
    }
}
