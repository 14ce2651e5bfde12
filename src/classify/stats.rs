//! Classification statistics.

use std::collections::{BTreeMap, HashMap};
use std::time::Duration;

use serde::{Deserialize, Serialize};

use super::grouping::ErrorGroup;
use super::rules::{ErrorCategory, Severity};
use super::ClassifiedDiagnostic;

/// Number of files listed in [`ClassificationStats::top_files`].
pub const TOP_FILES: usize = 10;

#[derive(Debug, Clone, Default, PartialEq, Serialize, Deserialize)]
pub struct ClassificationStats {
    /// Diagnostics received
    pub total_raw: usize,
    /// Diagnostics left after deduplication
    pub total: usize,
    pub duplicates_removed: usize,
    pub by_category: BTreeMap<ErrorCategory, usize>,
    pub by_severity: BTreeMap<Severity, usize>,
    /// Files with the most diagnostics, most first
    pub top_files: Vec<(String, usize)>,
    pub group_count: usize,
    pub auto_fixable_count: usize,
    pub elapsed: Duration,
}

impl ClassificationStats {
    pub fn collect(
        total_raw: usize,
        diagnostics: &[ClassifiedDiagnostic],
        groups: &[ErrorGroup],
        elapsed: Duration,
    ) -> Self {
        let mut by_category = BTreeMap::new();
        let mut by_severity = BTreeMap::new();
        let mut per_file: HashMap<&str, usize> = HashMap::new();
        for classified in diagnostics {
            *by_category.entry(classified.category).or_insert(0) += 1;
            *by_severity.entry(classified.severity).or_insert(0) += 1;
            *per_file.entry(classified.diagnostic.file.as_str()).or_insert(0) += 1;
        }

        let mut top_files: Vec<(String, usize)> = per_file
            .into_iter()
            .map(|(file, count)| (file.to_string(), count))
            .collect();
        top_files.sort_by(|a, b| b.1.cmp(&a.1).then_with(|| a.0.cmp(&b.0)));
        top_files.truncate(TOP_FILES);

        Self {
            total_raw,
            total: diagnostics.len(),
            duplicates_removed: total_raw.saturating_sub(diagnostics.len()),
            by_category,
            by_severity,
            top_files,
            group_count: groups.len(),
            auto_fixable_count: diagnostics.iter().filter(|d| d.auto_fixable).count(),
            elapsed,
        }
    }

    pub fn category_count(&self, category: ErrorCategory) -> usize {
        self.by_category.get(&category).copied().unwrap_or(0)
    }

    pub fn severity_count(&self, severity: Severity) -> usize {
        self.by_severity.get(&severity).copied().unwrap_or(0)
    }
}

#[cfg(test)]
mod tests {
    use crate::classify::rules::{ErrorCategory, Severity};
    use crate::classify::ErrorClassifier;
    use crate::tools::Diagnostic;

    #[test]
    fn test_stats_counts() {
        let mut diagnostics = vec![
            Diagnostic::new("/a.py", 1, "\"foo\" is not defined"),
            Diagnostic::new("/a.py", 1, "\"foo\" is not defined"),
            Diagnostic::new("/a.py", 2, "Code is unreachable"),
            Diagnostic::new("/b.py", 3, "invalid syntax"),
        ];
        for line in 0..12 {
            diagnostics.push(Diagnostic::new(format!("/many/f{line}.py"), 1, "mystery"));
        }
        let stats = ErrorClassifier::default().classify(&diagnostics).stats;

        assert_eq!(stats.total_raw, 16);
        assert_eq!(stats.total, 15);
        assert_eq!(stats.duplicates_removed, 1);
        assert_eq!(stats.category_count(ErrorCategory::Simple), 1);
        assert_eq!(stats.category_count(ErrorCategory::Manual), 14);
        assert_eq!(stats.severity_count(Severity::Critical), 1);
        assert_eq!(stats.severity_count(Severity::High), 1);
        assert_eq!(stats.auto_fixable_count, 1);
        assert_eq!(stats.top_files.len(), 10);
        assert_eq!(stats.top_files[0], ("/a.py".to_string(), 2));
    }
}
