use regex::Regex;
use thiserror::Error;
use vigil_core::config::VigilConfig;
use vigil_core::orchestrate::{PatternValidator, StructuredDataValidator};

/// Validator ids registered by `ValidatorRegistry::with_builtins`.
pub const BUILTIN_VALIDATORS: &[&str] = &[StructuredDataValidator::ID, PatternValidator::ID];

#[derive(Debug, Error)]
pub enum ConfigGuardRailError {
    #[error("no watch roots configured; set [watch] roots or VIGIL_ROOTS")]
    NoRoots,
    #[error("watch root {path} does not exist")]
    MissingRoot { path: String },
    #[error("watch root {path} is not a directory")]
    RootNotDirectory { path: String },
    #[error("orchestrator.max_concurrency must be at least 1")]
    ZeroConcurrency,
    #[error("policy rule `{rule}` names unknown validator `{validator}`")]
    UnknownValidator { rule: String, validator: String },
    #[error("pattern rule `{rule}` has an invalid regex: {reason}")]
    InvalidPattern { rule: String, reason: String },
    #[error("{field} {reason}")]
    InvalidValue { field: &'static str, reason: String },
}

#[derive(Debug, Clone)]
pub struct ConfigWarning {
    pub message: String,
    pub hint: Option<String>,
}

#[derive(Debug, Default, Clone)]
pub struct ConfigWarnings {
    pub items: Vec<ConfigWarning>,
}

impl ConfigWarnings {
    pub fn push<S: Into<String>>(&mut self, message: S) {
        self.items.push(ConfigWarning {
            message: message.into(),
            hint: None,
        });
    }

    pub fn push_with_hint<S: Into<String>, H: Into<String>>(&mut self, message: S, hint: H) {
        self.items.push(ConfigWarning {
            message: message.into(),
            hint: Some(hint.into()),
        });
    }

    pub fn is_empty(&self) -> bool {
        self.items.is_empty()
    }

    pub fn extend(&mut self, other: ConfigWarnings) {
        self.items.extend(other.items);
    }
}

/// Reject configurations the pipeline cannot start with; collect warnings
/// for the ones it can start with but probably should not.
pub fn apply_guard_rails(
    config: &VigilConfig,
    known_validators: &[&str],
) -> Result<ConfigWarnings, ConfigGuardRailError> {
    let mut warnings = ConfigWarnings::default();

    validate_roots(config)?;

    if config.orchestrator.max_concurrency == 0 {
        return Err(ConfigGuardRailError::ZeroConcurrency);
    }
    if config.debounce.dispatch_queue_capacity == 0 {
        return Err(ConfigGuardRailError::InvalidValue {
            field: "debounce.dispatch_queue_capacity",
            reason: "must be at least 1".into(),
        });
    }
    if config.watch.channel_capacity == 0 {
        return Err(ConfigGuardRailError::InvalidValue {
            field: "watch.channel_capacity",
            reason: "must be at least 1".into(),
        });
    }
    let memory = config.supervisor.max_memory_pct;
    if !(memory > 0.0 && memory <= 100.0) {
        return Err(ConfigGuardRailError::InvalidValue {
            field: "supervisor.max_memory_pct",
            reason: format!("must be within (0, 100], got {memory}"),
        });
    }

    for rule in &config.orchestrator.policy {
        if let Some(unknown) = rule
            .validators
            .iter()
            .find(|id| !known_validators.contains(&id.as_str()))
        {
            return Err(ConfigGuardRailError::UnknownValidator {
                rule: rule.name.clone(),
                validator: unknown.clone(),
            });
        }
        if rule.validators.is_empty() {
            warnings.push(format!("policy rule `{}` selects no validators", rule.name));
        }
        if rule.extensions.is_empty() && rule.path_contains.is_empty() {
            warnings.push_with_hint(
                format!("policy rule `{}` matches no files", rule.name),
                "Add extensions (\"*\" for every file) or path_contains entries",
            );
        }
    }

    for pattern in &config.orchestrator.patterns {
        Regex::new(&pattern.pattern).map_err(|err| ConfigGuardRailError::InvalidPattern {
            rule: pattern.id.clone(),
            reason: err.to_string(),
        })?;
    }

    let routes_patterns = config
        .orchestrator
        .policy
        .iter()
        .any(|rule| rule.validators.iter().any(|id| id == PatternValidator::ID));
    if routes_patterns && config.orchestrator.patterns.is_empty() {
        warnings.push_with_hint(
            "the `patterns` validator is routed but has no rules",
            "Add [[orchestrator.patterns]] entries or drop it from the policy table",
        );
    }

    if config.debounce.quiet_window_ms == 0 {
        warnings.push(
            "debounce.quiet_window_ms is 0; every filesystem event will dispatch immediately",
        );
    }
    if config.orchestrator.validator_timeout_ms < 100 {
        warnings.push(format!(
            "orchestrator.validator_timeout_ms is {}ms; most validators will time out",
            config.orchestrator.validator_timeout_ms
        ));
    }
    if config.supervisor.max_restarts == 0 {
        warnings.push("supervisor.max_restarts is 0; the first crash stops the process");
    }

    warn_roots_under_denied_names(config, &mut warnings);

    Ok(warnings)
}

fn validate_roots(config: &VigilConfig) -> Result<(), ConfigGuardRailError> {
    if config.watch.roots.is_empty() {
        return Err(ConfigGuardRailError::NoRoots);
    }
    for root in &config.watch.roots {
        if !root.exists() {
            return Err(ConfigGuardRailError::MissingRoot {
                path: root.display().to_string(),
            });
        }
        if !root.is_dir() {
            return Err(ConfigGuardRailError::RootNotDirectory {
                path: root.display().to_string(),
            });
        }
    }
    Ok(())
}

/// Deny matching starts at each root, so a root under `build/` is scanned.
/// Worth saying out loud when that is probably not what was meant.
fn warn_roots_under_denied_names(config: &VigilConfig, warnings: &mut ConfigWarnings) {
    for root in &config.watch.roots {
        let Ok(absolute) = std::path::absolute(root) else {
            continue;
        };
        let normalized = format!("{}/", absolute.to_string_lossy().replace('\\', "/"));
        if let Some(needle) = config
            .watch
            .deny_substrings
            .iter()
            .find(|needle| normalized.contains(needle.as_str()))
        {
            warnings.push_with_hint(
                format!("watch root {} contains denied segment {needle}", absolute.display()),
                "deny_substrings only apply below each root; files in this root are still scanned",
            );
        }
    }
}
