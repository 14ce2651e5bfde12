//! Analyzer diagnostic classification.
//!
//! Deduplicates raw diagnostics on `(file, line, message)`, assigns each a
//! category, severity, fix suggestion and confidence from the rule tables in
//! [`rules`], clusters them into [`ErrorGroup`]s and computes statistics.
//! Classification is pure and deterministic: the same input always yields
//! the same output, apart from the measured elapsed time.

pub mod grouping;
pub mod rules;
pub mod stats;

use std::collections::HashSet;
use std::time::Instant;

use serde::{Deserialize, Serialize};
use tracing::debug;

use crate::config::DEFAULT_CONFIDENCE_THRESHOLD;
use crate::tools::Diagnostic;

pub use grouping::{group_diagnostics, normalize_message, ErrorGroup};
pub use rules::{has_reliable_keyword, rule_set, ErrorCategory, Severity};
pub use stats::ClassificationStats;

const TEMPLATE_BONUS: f64 = 0.1;
const KEYWORD_BONUS: f64 = 0.1;

/// A diagnostic with its classification.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct ClassifiedDiagnostic {
    pub diagnostic: Diagnostic,
    pub category: ErrorCategory,
    pub severity: Severity,
    pub fix_suggestion: Option<String>,
    /// In `[0, 1]`
    pub confidence: f64,
    /// SIMPLE with confidence at or above the threshold
    pub auto_fixable: bool,
    pub group_id: Option<String>,
}

/// Output of [`ErrorClassifier::classify`].
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct ClassificationResult {
    /// Deduplicated diagnostics, first occurrence order
    pub diagnostics: Vec<ClassifiedDiagnostic>,
    pub groups: Vec<ErrorGroup>,
    pub stats: ClassificationStats,
}

impl ClassificationResult {
    /// Largest groups first; ties keep group order.
    pub fn top_groups(&self, limit: usize) -> Vec<&ErrorGroup> {
        let mut groups: Vec<&ErrorGroup> = self.groups.iter().collect();
        groups.sort_by(|a, b| b.size().cmp(&a.size()));
        groups.truncate(limit);
        groups
    }

    /// Diagnostics classified at `severity`.
    pub fn with_severity(&self, severity: Severity) -> impl Iterator<Item = &ClassifiedDiagnostic> {
        self.diagnostics.iter().filter(move |d| d.severity == severity)
    }
}

/// Classifies analyzer diagnostics.
#[derive(Debug, Clone, Copy)]
pub struct ErrorClassifier {
    confidence_threshold: f64,
}

impl Default for ErrorClassifier {
    fn default() -> Self {
        Self::new(DEFAULT_CONFIDENCE_THRESHOLD)
    }
}

impl ErrorClassifier {
    /// `confidence_threshold` is the minimum confidence for a SIMPLE
    /// diagnostic to count as auto-fixable.
    pub fn new(confidence_threshold: f64) -> Self {
        Self {
            confidence_threshold: confidence_threshold.clamp(0.0, 1.0),
        }
    }

    pub fn confidence_threshold(&self) -> f64 {
        self.confidence_threshold
    }

    /// Classify one diagnostic, without a group.
    pub fn classify_one(&self, diagnostic: &Diagnostic) -> ClassifiedDiagnostic {
        let rules = rule_set();
        let message = diagnostic.message.as_str();
        let category = rules.categorize(message);
        let severity = rules.severity(message);
        let fix_suggestion = rules.suggest_fix(message);

        let mut confidence = category.base_confidence();
        if fix_suggestion.is_some() {
            confidence += TEMPLATE_BONUS;
        }
        if has_reliable_keyword(message) {
            confidence += KEYWORD_BONUS;
        }
        // Two decimals keeps sums like 0.7 + 0.1 comparable.
        let confidence = (confidence.min(1.0) * 100.0).round() / 100.0;

        ClassifiedDiagnostic {
            diagnostic: diagnostic.clone(),
            category,
            severity,
            fix_suggestion,
            confidence,
            auto_fixable: category == ErrorCategory::Simple
                && confidence >= self.confidence_threshold,
            group_id: None,
        }
    }

    /// Deduplicate, classify, group and summarize `diagnostics`.
    pub fn classify(&self, diagnostics: &[Diagnostic]) -> ClassificationResult {
        let started = Instant::now();

        let unique = dedup(diagnostics);
        let mut classified: Vec<ClassifiedDiagnostic> =
            unique.iter().map(|d| self.classify_one(d)).collect();
        let groups = group_diagnostics(&mut classified);
        let stats = ClassificationStats::collect(
            diagnostics.len(),
            &classified,
            &groups,
            started.elapsed(),
        );

        debug!(
            raw = stats.total_raw,
            unique = stats.total,
            groups = stats.group_count,
            auto_fixable = stats.auto_fixable_count,
            "diagnostics classified"
        );
        ClassificationResult {
            diagnostics: classified,
            groups,
            stats,
        }
    }
}

/// Drop repeats of `(file, line, message)`; the first occurrence wins.
pub fn dedup(diagnostics: &[Diagnostic]) -> Vec<&Diagnostic> {
    let mut seen: HashSet<(&str, u32, &str)> = HashSet::new();
    diagnostics
        .iter()
        .filter(|d| seen.insert((d.file.as_str(), d.line, d.message.as_str())))
        .collect()
}
