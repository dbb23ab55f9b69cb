//! Validator capability and the built-in implementations.
//!
//! Rule content is pluggable: the built-ins only parse-check structured data
//! and run operator-supplied regex rules.

use std::borrow::Cow;
use std::collections::BTreeMap;
use std::fmt;
use std::path::PathBuf;
use std::sync::Arc;
use std::time::Duration;

use async_trait::async_trait;
use regex::Regex;
use thiserror::Error;

use crate::config::{OrchestratorConfig, PatternRuleConfig};
use crate::error::{PipelineError, Result};
use crate::types::{ContentHash, Finding, Severity, WorkReason};
use crate::watch::file_extension;

/// Rule id attached to the synthetic finding that replaces a failed call.
pub const AGENT_FAILURE_RULE: &str = "agent_failure";

#[derive(Debug, Error)]
pub enum ValidatorError {
    #[error("timed out after {0:?}")]
    Timeout(Duration),

    #[error("panicked: {0}")]
    Panicked(String),

    #[error("malformed result: {0}")]
    Malformed(String),

    #[error("{0}")]
    Failed(String),
}

impl ValidatorError {
    /// The single Error finding that stands in for a failed validator call.
    pub fn into_finding(self, validator_id: &str, path: impl Into<PathBuf>) -> Finding {
        Finding::new(
            validator_id,
            Severity::Error,
            format!("validator `{validator_id}` failed: {self}"),
            path,
        )
        .with_rule(AGENT_FAILURE_RULE)
    }
}

/// File bytes as seen by the orchestrator when the work item started.
pub struct FileContent {
    pub path: PathBuf,
    pub content_hash: ContentHash,
    pub bytes: Vec<u8>,
}

impl FileContent {
    pub fn text(&self) -> Cow<'_, str> {
        String::from_utf8_lossy(&self.bytes)
    }

    pub fn extension(&self) -> Option<String> {
        file_extension(&self.path)
    }
}

impl fmt::Debug for FileContent {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.debug_struct("FileContent")
            .field("path", &self.path)
            .field("content_hash", &self.content_hash)
            .field("byte_len", &self.bytes.len())
            .finish()
    }
}

/// Routing facts handed to every validator alongside the content.
#[derive(Debug, Clone, Default)]
pub struct PolicyContext {
    /// Names of the policy rules that matched the path.
    pub matched_rules: Vec<String>,
    pub reason: Option<WorkReason>,
}

#[async_trait]
pub trait Validator: Send + Sync {
    fn id(&self) -> &str;

    /// Must be re-entrant; the orchestrator calls it concurrently.
    async fn validate(
        &self,
        file: &FileContent,
        context: &PolicyContext,
    ) -> std::result::Result<Vec<Finding>, ValidatorError>;
}

/// Validators by id.
#[derive(Clone, Default)]
pub struct ValidatorRegistry {
    validators: BTreeMap<String, Arc<dyn Validator>>,
}

impl fmt::Debug for ValidatorRegistry {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.debug_struct("ValidatorRegistry")
            .field("ids", &self.validators.keys().collect::<Vec<_>>())
            .finish()
    }
}

impl ValidatorRegistry {
    pub fn new() -> Self {
        Self::default()
    }

    /// Registry holding `structured` and `patterns`.
    pub fn with_builtins(config: &OrchestratorConfig) -> Result<Self> {
        let mut registry = Self::new();
        registry.register(Arc::new(StructuredDataValidator));
        registry.register(Arc::new(PatternValidator::from_rules(&config.patterns)?));
        Ok(registry)
    }

    /// Later registrations replace earlier ones with the same id.
    pub fn register(&mut self, validator: Arc<dyn Validator>) {
        self.validators
            .insert(validator.id().to_string(), validator);
    }

    pub fn get(&self, id: &str) -> Option<Arc<dyn Validator>> {
        self.validators.get(id).cloned()
    }

    pub fn contains(&self, id: &str) -> bool {
        self.validators.contains_key(id)
    }

    pub fn ids(&self) -> impl Iterator<Item = &str> {
        self.validators.keys().map(String::as_str)
    }
}

/// Syntax check for JSON and TOML documents.
#[derive(Debug, Default, Clone, Copy)]
pub struct StructuredDataValidator;

impl StructuredDataValidator {
    pub const ID: &'static str = "structured";
}

#[async_trait]
impl Validator for StructuredDataValidator {
    fn id(&self) -> &str {
        Self::ID
    }

    async fn validate(
        &self,
        file: &FileContent,
        _context: &PolicyContext,
    ) -> std::result::Result<Vec<Finding>, ValidatorError> {
        let Some(ext) = file.extension() else {
            return Ok(Vec::new());
        };

        let finding = match ext.as_str() {
            "json" => serde_json::from_slice::<serde_json::Value>(&file.bytes)
                .err()
                .map(|err| {
                    Finding::new(Self::ID, Severity::Error, format!("invalid JSON: {err}"), &file.path)
                        .with_line(err.line() as u32)
                        .with_rule("invalid_json")
                }),
            "toml" => {
                let Ok(text) = std::str::from_utf8(&file.bytes) else {
                    return Ok(vec![
                        Finding::new(Self::ID, Severity::Error, "file is not valid UTF-8", &file.path)
                            .with_rule("invalid_toml"),
                    ]);
                };
                toml::from_str::<toml::Table>(text).err().map(|err| {
                    let mut finding = Finding::new(
                        Self::ID,
                        Severity::Error,
                        format!("invalid TOML: {}", err.message()),
                        &file.path,
                    )
                    .with_rule("invalid_toml");
                    if let Some(span) = err.span() {
                        finding = finding.with_line(line_of_offset(text, span.start));
                    }
                    finding
                })
            }
            _ => None,
        };

        Ok(finding.into_iter().collect())
    }
}

fn line_of_offset(text: &str, offset: usize) -> u32 {
    let end = offset.min(text.len());
    text.as_bytes()[..end].iter().filter(|b| **b == b'\n').count() as u32 + 1
}

struct CompiledRule {
    id: String,
    regex: Regex,
    severity: Severity,
    message: String,
    fix: Option<String>,
    extensions: Vec<String>,
}

impl CompiledRule {
    fn applies_to(&self, ext: Option<&str>) -> bool {
        self.extensions.is_empty()
            || ext.is_some_and(|ext| self.extensions.iter().any(|e| e.eq_ignore_ascii_case(ext)))
    }
}

/// One finding per matching line per operator-supplied regex rule.
pub struct PatternValidator {
    rules: Vec<CompiledRule>,
}

impl fmt::Debug for PatternValidator {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.debug_struct("PatternValidator")
            .field("rules", &self.rules.iter().map(|r| r.id.as_str()).collect::<Vec<_>>())
            .finish()
    }
}

impl PatternValidator {
    pub const ID: &'static str = "patterns";

    pub fn from_rules(rules: &[PatternRuleConfig]) -> Result<Self> {
        let rules = rules
            .iter()
            .map(|rule| {
                let regex = Regex::new(&rule.pattern).map_err(|err| {
                    PipelineError::Config(format!("pattern rule `{}`: {err}", rule.id))
                })?;
                Ok(CompiledRule {
                    id: rule.id.clone(),
                    regex,
                    severity: rule.severity,
                    message: rule.message.clone(),
                    fix: rule.fix.clone(),
                    extensions: rule.extensions.clone(),
                })
            })
            .collect::<Result<Vec<_>>>()?;
        Ok(Self { rules })
    }
}

#[async_trait]
impl Validator for PatternValidator {
    fn id(&self) -> &str {
        Self::ID
    }

    async fn validate(
        &self,
        file: &FileContent,
        _context: &PolicyContext,
    ) -> std::result::Result<Vec<Finding>, ValidatorError> {
        let ext = file.extension();
        let active: Vec<&CompiledRule> = self
            .rules
            .iter()
            .filter(|rule| rule.applies_to(ext.as_deref()))
            .collect();
        if active.is_empty() {
            return Ok(Vec::new());
        }

        let text = file.text();
        let mut findings = Vec::new();
        for (idx, line) in text.lines().enumerate() {
            for rule in &active {
                if !rule.regex.is_match(line) {
                    continue;
                }
                let mut finding =
                    Finding::new(Self::ID, rule.severity, rule.message.clone(), &file.path)
                        .with_line(idx as u32 + 1)
                        .with_rule(rule.id.clone());
                if let Some(fix) = &rule.fix {
                    finding = finding.with_fix(fix.clone());
                }
                findings.push(finding);
            }
        }
        Ok(findings)
    }
}
