//! Normalized analyzer findings.

use std::collections::BTreeMap;
use std::path::{Component, Path, PathBuf};

use serde::{Deserialize, Serialize};

/// Severity as reported by the tool.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, Serialize, Deserialize)]
#[serde(rename_all = "lowercase")]
pub enum DiagnosticLevel {
    Error,
    Warning,
    Information,
}

impl DiagnosticLevel {
    /// Map a tool severity string; unknown values count as errors.
    pub fn from_tool(severity: &str) -> Self {
        match severity.to_ascii_lowercase().as_str() {
            "warning" | "warn" => DiagnosticLevel::Warning,
            "information" | "info" | "hint" => DiagnosticLevel::Information,
            _ => DiagnosticLevel::Error,
        }
    }
}

/// Tool that produced a diagnostic.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, Serialize, Deserialize)]
#[serde(rename_all = "snake_case")]
pub enum DiagnosticSource {
    TypeCheck,
    Lint,
}

/// One finding, with an absolute file path and 1-based line/column.
#[derive(Debug, Clone, PartialEq, Eq, Hash, Serialize, Deserialize)]
pub struct Diagnostic {
    pub file: String,
    pub line: u32,
    pub column: u32,
    pub level: DiagnosticLevel,
    pub message: String,
    /// Tool rule code (e.g. `reportMissingImports`, `F401`)
    pub rule: Option<String>,
    pub source: DiagnosticSource,
    /// The tool itself offers a fix
    #[serde(default)]
    pub fix_available: bool,
}

impl Diagnostic {
    pub fn new(file: impl Into<String>, line: u32, message: impl Into<String>) -> Self {
        Self {
            file: file.into(),
            line,
            column: 1,
            level: DiagnosticLevel::Error,
            message: message.into(),
            rule: None,
            source: DiagnosticSource::TypeCheck,
            fix_available: false,
        }
    }

    pub fn with_column(mut self, column: u32) -> Self {
        self.column = column;
        self
    }

    pub fn with_level(mut self, level: DiagnosticLevel) -> Self {
        self.level = level;
        self
    }

    pub fn with_rule(mut self, rule: impl Into<String>) -> Self {
        self.rule = Some(rule.into());
        self
    }

    pub fn with_source(mut self, source: DiagnosticSource) -> Self {
        self.source = source;
        self
    }

    pub fn with_fix_available(mut self, available: bool) -> Self {
        self.fix_available = available;
        self
    }

    pub fn is_error(&self) -> bool {
        self.level == DiagnosticLevel::Error
    }

    /// Rule code, or an empty string.
    pub fn rule_code(&self) -> &str {
        self.rule.as_deref().unwrap_or("")
    }
}

/// Resolve `path` against `base` and remove `.`/`..` components lexically.
///
/// Symlinks are not followed; the files may not exist (tool output can name
/// deleted files).
pub fn absolute_path(path: &Path, base: &Path) -> PathBuf {
    let joined = if path.is_absolute() {
        path.to_path_buf()
    } else {
        base.join(path)
    };

    let mut normalized = PathBuf::new();
    for component in joined.components() {
        match component {
            Component::CurDir => {}
            Component::ParentDir => {
                normalized.pop();
            }
            other => normalized.push(other.as_os_str()),
        }
    }
    normalized
}

/// [`absolute_path`] rendered as a string.
pub fn absolute_path_string(path: &str, base: &Path) -> String {
    absolute_path(Path::new(path), base).display().to_string()
}

/// Group error-level diagnostics by file.
pub fn errors_by_file(diagnostics: &[Diagnostic]) -> BTreeMap<String, Vec<Diagnostic>> {
    let mut by_file: BTreeMap<String, Vec<Diagnostic>> = BTreeMap::new();
    for diagnostic in diagnostics.iter().filter(|d| d.is_error()) {
        by_file
            .entry(diagnostic.file.clone())
            .or_default()
            .push(diagnostic.clone());
    }
    by_file
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_absolute_path_joins_and_normalizes() {
        let base = Path::new("/repo/src");
        assert_eq!(
            absolute_path(Path::new("pkg/../app.py"), base),
            PathBuf::from("/repo/src/app.py")
        );
        assert_eq!(
            absolute_path(Path::new("./tests/test_a.py"), Path::new("/repo")),
            PathBuf::from("/repo/tests/test_a.py")
        );
        assert_eq!(
            absolute_path(Path::new("/abs/./x.py"), base),
            PathBuf::from("/abs/x.py")
        );
    }

    #[test]
    fn test_level_from_tool() {
        assert_eq!(DiagnosticLevel::from_tool("error"), DiagnosticLevel::Error);
        assert_eq!(DiagnosticLevel::from_tool("Warning"), DiagnosticLevel::Warning);
        assert_eq!(
            DiagnosticLevel::from_tool("information"),
            DiagnosticLevel::Information
        );
        assert_eq!(DiagnosticLevel::from_tool("fatal"), DiagnosticLevel::Error);
    }

    #[test]
    fn test_errors_by_file_skips_warnings() {
        let diagnostics = vec![
            Diagnostic::new("/a.py", 1, "x"),
            Diagnostic::new("/a.py", 2, "y").with_level(DiagnosticLevel::Warning),
            Diagnostic::new("/b.py", 3, "z"),
        ];
        let grouped = errors_by_file(&diagnostics);
        assert_eq!(grouped.len(), 2);
        assert_eq!(grouped["/a.py"].len(), 1);
    }
}
