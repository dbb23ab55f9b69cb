//! Feedback aggregation and delivery.
//!
//! [`aggregate`] is a pure function from a finding list to a [`Report`]:
//! duplicates removed, stable-sorted by severity, each finding scored for
//! external consumers and grouped into consolidated fix suggestions. Reports
//! go to a [`Notifier`]; delivery is at-least-once.

use std::collections::HashSet;
use std::fmt;
use std::path::{Path, PathBuf};
use std::sync::{Arc, Mutex};

use async_trait::async_trait;
use chrono::{DateTime, Utc};
use serde::{Deserialize, Serialize};
use tokio::io::AsyncWriteExt;
use tracing::{debug, info, warn};

use crate::config::{NotifierConfig, NotifierKind};
use crate::error::Result;
use crate::orchestrate::{AGENT_FAILURE_RULE, READ_FAILURE_RULE};
use crate::types::{ContentHash, Finding, Severity};

/// Known rule families used for scoring and consolidated suggestions.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, Serialize, Deserialize)]
#[serde(rename_all = "snake_case")]
pub enum FindingCategory {
    Isolation,
    Secrets,
    Injection,
    ValidatorFailure,
    ErrorHandling,
    Style,
    Generic,
}

impl FindingCategory {
    const KEYWORDS: &'static [(FindingCategory, &'static [&'static str])] = &[
        (
            FindingCategory::Isolation,
            &["tenant", "isolation", "authoriz", "access control", "permission"],
        ),
        (
            FindingCategory::Secrets,
            &["secret", "password", "credential", "api key", "api_key", "token"],
        ),
        (
            FindingCategory::Injection,
            &["injection", "sql", "eval", "exec", "shell", "subprocess", "xss"],
        ),
        (
            FindingCategory::ErrorHandling,
            &["exception", "except", "error handling", "unwrap", "panic", "swallow"],
        ),
        (
            FindingCategory::Style,
            &["style", "naming", "format", "whitespace", "line length", "docstring", "lint"],
        ),
    ];

    pub fn classify(finding: &Finding) -> Self {
        if matches!(
            finding.rule_id.as_deref(),
            Some(AGENT_FAILURE_RULE | READ_FAILURE_RULE)
        ) {
            return FindingCategory::ValidatorFailure;
        }

        let haystack = format!(
            "{} {}",
            finding.rule_id.as_deref().unwrap_or_default(),
            finding.message
        )
        .to_lowercase();
        Self::KEYWORDS
            .iter()
            .find(|(_, needles)| needles.iter().any(|needle| haystack.contains(needle)))
            .map(|(category, _)| *category)
            .unwrap_or(FindingCategory::Generic)
    }

    fn boost(self) -> u32 {
        match self {
            FindingCategory::Isolation => 50,
            FindingCategory::Secrets => 45,
            FindingCategory::Injection => 40,
            FindingCategory::ValidatorFailure => 30,
            FindingCategory::ErrorHandling => 20,
            FindingCategory::Generic => 5,
            FindingCategory::Style => 0,
        }
    }

    fn suggestion(self) -> &'static str {
        match self {
            FindingCategory::Isolation => {
                "Scope every data access to the caller's tenant and check authorization before use."
            }
            FindingCategory::Secrets => {
                "Move credentials out of source into the environment or a secret store and rotate exposed values."
            }
            FindingCategory::Injection => {
                "Pass untrusted input as parameters instead of building queries or commands from strings."
            }
            FindingCategory::ValidatorFailure => {
                "A validator could not complete; check its logs and re-run once it is healthy."
            }
            FindingCategory::ErrorHandling => {
                "Handle errors explicitly instead of swallowing or panicking on them."
            }
            FindingCategory::Style => "Apply the project formatter and naming conventions.",
            FindingCategory::Generic => "Review these findings individually.",
        }
    }
}

impl fmt::Display for FindingCategory {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        let label = match self {
            FindingCategory::Isolation => "isolation",
            FindingCategory::Secrets => "secrets",
            FindingCategory::Injection => "injection",
            FindingCategory::ValidatorFailure => "validator_failure",
            FindingCategory::ErrorHandling => "error_handling",
            FindingCategory::Style => "style",
            FindingCategory::Generic => "generic",
        };
        f.write_str(label)
    }
}

/// Priority for external consumers. Never changes severity ordering.
pub fn priority_score(finding: &Finding, category: FindingCategory) -> u32 {
    let base = match finding.severity {
        Severity::Error => 100,
        Severity::Warning => 50,
        Severity::Info => 10,
    };
    base + category.boost()
}

#[derive(Debug, Clone, Copy, Default, PartialEq, Eq, Serialize, Deserialize)]
pub struct SeverityCounts {
    pub error: usize,
    pub warning: usize,
    pub info: usize,
}

impl SeverityCounts {
    pub fn get(&self, severity: Severity) -> usize {
        match severity {
            Severity::Error => self.error,
            Severity::Warning => self.warning,
            Severity::Info => self.info,
        }
    }

    fn bump(&mut self, severity: Severity) {
        match severity {
            Severity::Error => self.error += 1,
            Severity::Warning => self.warning += 1,
            Severity::Info => self.info += 1,
        }
    }

    pub fn total(&self) -> usize {
        self.error + self.warning + self.info
    }
}

#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct PrioritizedFinding {
    #[serde(flatten)]
    pub finding: Finding,
    pub priority: u32,
    pub category: FindingCategory,
}

/// One consolidated suggestion per category.
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct FixSuggestion {
    pub category: FindingCategory,
    pub suggestion: String,
    pub affected_paths: Vec<PathBuf>,
    pub finding_count: usize,
    /// Distinct validator-supplied fixes for this category.
    #[serde(default, skip_serializing_if = "Vec::is_empty")]
    pub fixes: Vec<String>,
}

#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct Report {
    pub path: PathBuf,
    pub content_hash: ContentHash,
    pub generated_at: DateTime<Utc>,
    /// No Error-severity findings.
    pub success: bool,
    pub counts: SeverityCounts,
    pub findings: Vec<PrioritizedFinding>,
    pub fix_suggestions: Vec<FixSuggestion>,
}

impl Report {
    pub fn ordered_findings(&self) -> impl Iterator<Item = &Finding> {
        self.findings.iter().map(|f| &f.finding)
    }
}

type DedupeKey = (Severity, Option<String>, String, PathBuf, Option<u32>);

pub fn aggregate(path: &Path, content_hash: &ContentHash, findings: Vec<Finding>) -> Report {
    let mut seen: HashSet<DedupeKey> = HashSet::with_capacity(findings.len());
    let mut unique: Vec<Finding> = Vec::with_capacity(findings.len());
    for finding in findings {
        let key = (
            finding.severity,
            finding.rule_id.clone(),
            finding.message.clone(),
            finding.path.clone(),
            finding.line,
        );
        if seen.insert(key) {
            unique.push(finding);
        }
    }

    // `sort_by_key` is stable; validator order survives within a severity.
    unique.sort_by_key(|f| f.severity);

    let mut counts = SeverityCounts::default();
    let mut ordered = Vec::with_capacity(unique.len());
    let mut suggestions: Vec<FixSuggestion> = Vec::new();

    for finding in unique {
        counts.bump(finding.severity);
        let category = FindingCategory::classify(&finding);

        let idx = match suggestions.iter().position(|s| s.category == category) {
            Some(idx) => idx,
            None => {
                suggestions.push(FixSuggestion {
                    category,
                    suggestion: category.suggestion().to_string(),
                    affected_paths: Vec::new(),
                    finding_count: 0,
                    fixes: Vec::new(),
                });
                suggestions.len() - 1
            }
        };
        let suggestion = &mut suggestions[idx];
        suggestion.finding_count += 1;
        if !suggestion.affected_paths.contains(&finding.path) {
            suggestion.affected_paths.push(finding.path.clone());
        }
        if let Some(fix) = &finding.fix_suggestion
            && !suggestion.fixes.contains(fix)
        {
            suggestion.fixes.push(fix.clone());
        }

        ordered.push(PrioritizedFinding {
            priority: priority_score(&finding, category),
            category,
            finding,
        });
    }

    Report {
        path: path.to_path_buf(),
        content_hash: content_hash.clone(),
        generated_at: Utc::now(),
        success: counts.error == 0,
        counts,
        findings: ordered,
        fix_suggestions: suggestions,
    }
}

#[async_trait]
pub trait Notifier: Send + Sync {
    /// Called once per completed work item. Must tolerate duplicates.
    async fn notify(&self, report: &Report) -> Result<()>;
}

/// Logs a summary line per report via `tracing`.
#[derive(Debug, Default, Clone, Copy)]
pub struct LogNotifier;

#[async_trait]
impl Notifier for LogNotifier {
    async fn notify(&self, report: &Report) -> Result<()> {
        if report.success {
            info!(
                target: "vigil::feedback",
                path = %report.path.display(),
                warnings = report.counts.warning,
                info = report.counts.info,
                "validation passed"
            );
        } else {
            warn!(
                target: "vigil::feedback",
                path = %report.path.display(),
                errors = report.counts.error,
                warnings = report.counts.warning,
                info = report.counts.info,
                "validation failed"
            );
        }
        for entry in &report.findings {
            let finding = &entry.finding;
            debug!(
                target: "vigil::feedback",
                path = %finding.path.display(),
                line = finding.line,
                severity = %finding.severity,
                rule = finding.rule_id.as_deref().unwrap_or("-"),
                priority = entry.priority,
                "{}",
                finding.message
            );
        }
        Ok(())
    }
}

/// Appends one JSON document per report to a file.
#[derive(Debug)]
pub struct JsonlNotifier {
    path: PathBuf,
    write_lock: tokio::sync::Mutex<()>,
}

impl JsonlNotifier {
    pub fn new(path: impl Into<PathBuf>) -> Self {
        Self {
            path: path.into(),
            write_lock: tokio::sync::Mutex::new(()),
        }
    }

    pub fn path(&self) -> &Path {
        &self.path
    }
}

#[async_trait]
impl Notifier for JsonlNotifier {
    async fn notify(&self, report: &Report) -> Result<()> {
        let mut line = serde_json::to_vec(report)?;
        line.push(b'\n');

        let _guard = self.write_lock.lock().await;
        if let Some(parent) = self.path.parent() {
            tokio::fs::create_dir_all(parent).await?;
        }
        let mut file = tokio::fs::OpenOptions::new()
            .create(true)
            .append(true)
            .open(&self.path)
            .await?;
        file.write_all(&line).await?;
        file.flush().await?;
        Ok(())
    }
}

/// Keeps every report in memory. Used by embedders and tests.
#[derive(Debug, Default)]
pub struct CollectingNotifier {
    reports: Mutex<Vec<Report>>,
}

impl CollectingNotifier {
    pub fn reports(&self) -> Vec<Report> {
        self.reports
            .lock()
            .unwrap_or_else(|poisoned| poisoned.into_inner())
            .clone()
    }
}

#[async_trait]
impl Notifier for CollectingNotifier {
    async fn notify(&self, report: &Report) -> Result<()> {
        self.reports
            .lock()
            .unwrap_or_else(|poisoned| poisoned.into_inner())
            .push(report.clone());
        Ok(())
    }
}

pub fn build_notifier(config: &NotifierConfig, state_dir: &Path) -> Arc<dyn Notifier> {
    match config.kind {
        NotifierKind::Log => Arc::new(LogNotifier),
        NotifierKind::Jsonl => Arc::new(JsonlNotifier::new(config.resolved_path(state_dir))),
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    fn finding(source: &str, severity: Severity, message: &str) -> Finding {
        Finding::new(source, severity, message, "a.py")
    }

    #[test]
    fn errors_lead_then_warnings_then_info_stably() {
        let report = aggregate(
            Path::new("a.py"),
            &ContentHash::empty(),
            vec![
                finding("v1", Severity::Warning, "w"),
                finding("v1", Severity::Error, "e1"),
                finding("v2", Severity::Info, "i"),
                finding("v2", Severity::Error, "e2"),
            ],
        );

        let order: Vec<_> = report
            .ordered_findings()
            .map(|f| f.message.as_str())
            .collect();
        assert_eq!(order, vec!["e1", "e2", "w", "i"]);
        assert_eq!(
            report.counts,
            SeverityCounts {
                error: 2,
                warning: 1,
                info: 1
            }
        );
        assert!(!report.success);
    }

    #[test]
    fn duplicates_are_removed() {
        let dup = finding("v1", Severity::Warning, "same").with_line(3);
        let report = aggregate(
            Path::new("a.py"),
            &ContentHash::empty(),
            vec![dup.clone(), dup.clone(), dup.with_line(4)],
        );
        assert_eq!(report.findings.len(), 2);
    }

    #[test]
    fn isolation_outranks_style_within_a_severity() {
        let isolation = finding("p", Severity::Warning, "query is missing tenant filter")
            .with_rule("tenant-scope");
        let style = finding("p", Severity::Warning, "line too long").with_rule("style-line-length");
        let report = aggregate(
            Path::new("a.py"),
            &ContentHash::empty(),
            vec![style, isolation],
        );

        assert_eq!(report.findings[0].category, FindingCategory::Style);
        assert_eq!(report.findings[1].category, FindingCategory::Isolation);
        assert!(report.findings[1].priority > report.findings[0].priority);
    }

    #[test]
    fn suggestions_consolidate_by_category_with_generic_fallback() {
        let report = aggregate(
            Path::new("a.py"),
            &ContentHash::empty(),
            vec![
                Finding::new("p", Severity::Error, "eval on user input", "a.py")
                    .with_fix("use ast.literal_eval"),
                Finding::new("p", Severity::Error, "raw SQL string", "b.py"),
                finding("p", Severity::Info, "consider splitting this module"),
            ],
        );

        assert_eq!(report.fix_suggestions.len(), 2);
        let injection = &report.fix_suggestions[0];
        assert_eq!(injection.category, FindingCategory::Injection);
        assert_eq!(injection.finding_count, 2);
        assert_eq!(
            injection.affected_paths,
            vec![PathBuf::from("a.py"), PathBuf::from("b.py")]
        );
        assert_eq!(injection.fixes, vec!["use ast.literal_eval".to_string()]);
        assert_eq!(report.fix_suggestions[1].category, FindingCategory::Generic);
    }

    #[test]
    fn agent_failures_are_their_own_category() {
        let failure = Finding::new("slow", Severity::Error, "validator `slow` failed", "a.py")
            .with_rule(AGENT_FAILURE_RULE);
        assert_eq!(
            FindingCategory::classify(&failure),
            FindingCategory::ValidatorFailure
        );
    }

    #[tokio::test]
    async fn jsonl_notifier_appends_one_line_per_report() {
        let tmp = tempfile::tempdir().expect("tempdir");
        let notifier = JsonlNotifier::new(tmp.path().join("out/reports.jsonl"));
        let report = aggregate(Path::new("a.py"), &ContentHash::empty(), Vec::new());

        notifier.notify(&report).await.expect("notify");
        notifier.notify(&report).await.expect("notify");

        let text = std::fs::read_to_string(notifier.path()).expect("read");
        let lines: Vec<_> = text.lines().collect();
        assert_eq!(lines.len(), 2);
        let parsed: Report = serde_json::from_str(lines[0]).expect("parse");
        assert!(parsed.success);
    }
}
