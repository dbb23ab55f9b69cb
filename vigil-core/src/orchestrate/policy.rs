use std::path::Path;

use crate::config::PolicyRuleConfig;
use crate::error::{PipelineError, Result};
use crate::watch::file_extension;

use super::validator::ValidatorRegistry;

#[derive(Debug, Clone)]
struct PolicyRule {
    name: String,
    match_all: bool,
    extensions: Vec<String>,
    path_contains: Vec<String>,
    validators: Vec<String>,
}

impl PolicyRule {
    fn matches(&self, path: &Path, ext: Option<&str>) -> bool {
        if self.match_all {
            return true;
        }
        if ext.is_some_and(|ext| self.extensions.iter().any(|e| e == ext)) {
            return true;
        }
        if self.path_contains.is_empty() {
            return false;
        }
        let display = path.to_string_lossy();
        self.path_contains
            .iter()
            .any(|needle| display.contains(needle.as_str()))
    }
}

/// Validators chosen for one path, in table order without duplicates.
#[derive(Debug, Clone, Default, PartialEq, Eq)]
pub struct Selection {
    pub validators: Vec<String>,
    pub matched_rules: Vec<String>,
}

impl Selection {
    pub fn is_empty(&self) -> bool {
        self.validators.is_empty()
    }
}

/// Ordered path/extension routing table. Every matching rule contributes.
#[derive(Debug, Clone, Default)]
pub struct ValidationPolicy {
    rules: Vec<PolicyRule>,
}

impl ValidationPolicy {
    /// Build the table, rejecting rules that name unregistered validators.
    pub fn from_config(rules: &[PolicyRuleConfig], registry: &ValidatorRegistry) -> Result<Self> {
        let mut compiled = Vec::with_capacity(rules.len());
        for rule in rules {
            if let Some(unknown) = rule.validators.iter().find(|id| !registry.contains(id)) {
                return Err(PipelineError::Config(format!(
                    "policy rule `{}` names unknown validator `{unknown}`",
                    rule.name
                )));
            }

            let extensions: Vec<String> = rule
                .extensions
                .iter()
                .map(|ext| ext.trim_start_matches('.').to_ascii_lowercase())
                .collect();
            compiled.push(PolicyRule {
                name: rule.name.clone(),
                match_all: extensions.iter().any(|ext| ext == "*"),
                extensions,
                path_contains: rule.path_contains.clone(),
                validators: rule.validators.clone(),
            });
        }
        Ok(Self { rules: compiled })
    }

    pub fn select(&self, path: &Path) -> Selection {
        let ext = file_extension(path);
        let mut selection = Selection::default();
        for rule in &self.rules {
            if !rule.matches(path, ext.as_deref()) {
                continue;
            }
            selection.matched_rules.push(rule.name.clone());
            for id in &rule.validators {
                if !selection.validators.contains(id) {
                    selection.validators.push(id.clone());
                }
            }
        }
        selection
    }

    pub fn len(&self) -> usize {
        self.rules.len()
    }

    pub fn is_empty(&self) -> bool {
        self.rules.is_empty()
    }
}
