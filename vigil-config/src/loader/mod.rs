pub mod error;

use std::fs;
use std::path::{Path, PathBuf};
use std::str::FromStr;

use once_cell::sync::Lazy;
use tracing::{debug, info};
use vigil_core::config::VigilConfig;

use crate::sources::{
    ENV_DEBOUNCE_MS, ENV_MAX_CONCURRENCY, ENV_VALIDATOR_TIMEOUT_MS, EnvConfig,
};
use crate::validation::{self, BUILTIN_VALIDATORS, ConfigWarnings};

use self::error::ConfigLoadError;

static DEFAULT_CONFIG_LOCATIONS: Lazy<Vec<PathBuf>> = Lazy::new(|| {
    vec![
        PathBuf::from("vigil.toml"),
        PathBuf::from("config/vigil.toml"),
    ]
});

#[derive(Debug, Default, Clone)]
pub struct ConfigLoaderOptions {
    pub config_path: Option<PathBuf>,
    pub env_file: Option<PathBuf>,
    /// Skip the guard rails (used by commands that only read state, such as
    /// `status`, which must work even when a root has gone missing).
    pub skip_guard_rails: bool,
}

#[derive(Debug, Default)]
pub struct ConfigLoader {
    options: ConfigLoaderOptions,
}

#[derive(Debug)]
pub struct ConfigLoad {
    pub config: VigilConfig,
    pub warnings: ConfigWarnings,
    /// File the configuration came from, if any.
    pub source: Option<PathBuf>,
}

impl ConfigLoader {
    pub fn new() -> Self {
        Self::default()
    }

    pub fn with_options(options: ConfigLoaderOptions) -> Self {
        Self { options }
    }

    pub fn with_config_path<P: Into<PathBuf>>(mut self, path: P) -> Self {
        self.options.config_path = Some(path.into());
        self
    }

    pub fn with_env_file<P: Into<PathBuf>>(mut self, path: P) -> Self {
        self.options.env_file = Some(path.into());
        self
    }

    /// Load `.env`, capture the environment, then resolve.
    pub fn load(&self) -> Result<ConfigLoad, ConfigLoadError> {
        let env_file_loaded = match &self.options.env_file {
            Some(path) => dotenvy::from_path(path)
                .map(|_| true)
                .or_else(|err| match err {
                    dotenvy::Error::Io(_) => Ok(false),
                    _ => Err(err),
                })?,
            None => dotenvy::dotenv().map(|_| true).or_else(|err| match err {
                dotenvy::Error::Io(_) => Ok(false),
                _ => Err(err),
            })?,
        };
        debug!(target: "vigil::config", env_file_loaded, "environment captured");

        self.resolve(EnvConfig::gather())
    }

    /// Resolve against an already captured environment.
    pub fn resolve(&self, env: EnvConfig) -> Result<ConfigLoad, ConfigLoadError> {
        let mut warnings = ConfigWarnings::default();

        let (mut config, source) = match self.locate(&env)? {
            Some(path) => (read_config(&path)?, Some(path)),
            None => {
                warnings.push_with_hint(
                    "No vigil.toml detected; using defaults and environment variables",
                    "Create vigil.toml or pass --config to choose roots and validators",
                );
                (VigilConfig::default(), None)
            }
        };

        apply_env(&mut config, env)?;

        if !self.options.skip_guard_rails {
            warnings.extend(validation::apply_guard_rails(&config, BUILTIN_VALIDATORS)?);
        }

        if let Some(path) = &source {
            info!(target: "vigil::config", path = %path.display(), "configuration loaded");
        }
        Ok(ConfigLoad {
            config,
            warnings,
            source,
        })
    }

    /// Explicit path, then `$VIGIL_CONFIG_PATH`, then the first default
    /// location that exists. Explicit and env paths must exist.
    fn locate(&self, env: &EnvConfig) -> Result<Option<PathBuf>, ConfigLoadError> {
        let required = self
            .options
            .config_path
            .clone()
            .or_else(|| env.config_path.clone());
        if let Some(path) = required {
            if !path.exists() {
                return Err(ConfigLoadError::MissingConfig { path });
            }
            return Ok(Some(path));
        }

        Ok(DEFAULT_CONFIG_LOCATIONS
            .iter()
            .find(|candidate| candidate.exists())
            .cloned())
    }
}

fn read_config(path: &Path) -> Result<VigilConfig, ConfigLoadError> {
    let contents = fs::read_to_string(path).map_err(|err| ConfigLoadError::Io {
        path: path.to_path_buf(),
        source: err,
    })?;
    toml::from_str(&contents).map_err(|err| ConfigLoadError::Parse {
        path: path.to_path_buf(),
        source: err,
    })
}

fn apply_env(config: &mut VigilConfig, env: EnvConfig) -> Result<(), ConfigLoadError> {
    if let Some(roots) = env.roots {
        config.watch.roots = roots;
    }
    if let Some(state_dir) = env.state_dir {
        config.state_dir = state_dir;
    }
    if let Some(raw) = env.debounce_ms {
        config.debounce.quiet_window_ms = parse_env(ENV_DEBOUNCE_MS, raw)?;
    }
    if let Some(raw) = env.max_concurrency {
        config.orchestrator.max_concurrency = parse_env(ENV_MAX_CONCURRENCY, raw)?;
    }
    if let Some(raw) = env.validator_timeout_ms {
        config.orchestrator.validator_timeout_ms = parse_env(ENV_VALIDATOR_TIMEOUT_MS, raw)?;
    }
    Ok(())
}

fn parse_env<T: FromStr>(name: &'static str, raw: String) -> Result<T, ConfigLoadError> {
    raw.parse()
        .map_err(|_| ConfigLoadError::InvalidEnv { name, value: raw })
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::validation::ConfigGuardRailError;

    fn write_config(dir: &Path, body: &str) -> PathBuf {
        let path = dir.join("vigil.toml");
        fs::write(&path, body).expect("write config");
        path
    }

    #[test]
    fn file_values_are_overridden_by_environment() {
        let tmp = tempfile::tempdir().expect("tempdir");
        let src = tmp.path().join("src");
        let lib = tmp.path().join("lib");
        fs::create_dir_all(&src).expect("mkdir");
        fs::create_dir_all(&lib).expect("mkdir");
        let path = write_config(
            tmp.path(),
            &format!(
                "state_dir = \"{}\"\n[watch]\nroots = [\"{}\"]\n[debounce]\nquiet_window_ms = 80\n",
                tmp.path().join("state").display(),
                src.display()
            ),
        );

        let load = ConfigLoader::new()
            .with_config_path(&path)
            .resolve(EnvConfig {
                roots: Some(vec![lib.clone()]),
                max_concurrency: Some("3".into()),
                ..EnvConfig::default()
            })
            .expect("load");

        assert_eq!(load.source.as_deref(), Some(path.as_path()));
        assert_eq!(load.config.watch.roots, vec![lib]);
        assert_eq!(load.config.debounce.quiet_window_ms, 80);
        assert_eq!(load.config.orchestrator.max_concurrency, 3);
    }

    #[test]
    fn explicit_missing_path_is_an_error() {
        let err = ConfigLoader::new()
            .with_config_path("/definitely/not/here/vigil.toml")
            .resolve(EnvConfig::default())
            .expect_err("missing");
        assert!(matches!(err, ConfigLoadError::MissingConfig { .. }));
    }

    #[test]
    fn non_numeric_override_names_the_variable() {
        let tmp = tempfile::tempdir().expect("tempdir");
        let err = ConfigLoader::new()
            .resolve(EnvConfig {
                roots: Some(vec![tmp.path().to_path_buf()]),
                debounce_ms: Some("soon".into()),
                ..EnvConfig::default()
            })
            .expect_err("bad number");
        assert!(err.to_string().contains("VIGIL_DEBOUNCE_MS"));
    }

    #[test]
    fn malformed_toml_reports_the_path() {
        let tmp = tempfile::tempdir().expect("tempdir");
        let path = write_config(tmp.path(), "[watch\nroots = 1");
        let err = ConfigLoader::new()
            .with_config_path(&path)
            .resolve(EnvConfig::default())
            .expect_err("parse error");
        assert!(matches!(err, ConfigLoadError::Parse { .. }));
    }

    #[test]
    fn guard_rails_run_unless_skipped() {
        let tmp = tempfile::tempdir().expect("tempdir");
        let path = write_config(tmp.path(), "[watch]\nroots = []\n");

        let err = ConfigLoader::new()
            .with_config_path(&path)
            .resolve(EnvConfig::default())
            .expect_err("no roots");
        assert!(matches!(
            err,
            ConfigLoadError::GuardRail(ConfigGuardRailError::NoRoots)
        ));

        let load = ConfigLoader::with_options(ConfigLoaderOptions {
            config_path: Some(path),
            skip_guard_rails: true,
            ..ConfigLoaderOptions::default()
        })
        .resolve(EnvConfig::default())
        .expect("skip guard rails");
        assert!(load.config.watch.roots.is_empty());
    }
}
