//! Classification rule tables.
//!
//! Rules are data: ordered `(label, pattern)` pairs compiled once. The first
//! matching rule wins, so more specific patterns come first.

use std::fmt;
use std::sync::OnceLock;

use regex::Regex;
use serde::{Deserialize, Serialize};

/// How a diagnostic is likely to be resolved.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, PartialOrd, Ord, Serialize, Deserialize)]
#[serde(rename_all = "SCREAMING_SNAKE_CASE")]
pub enum ErrorCategory {
    /// Mechanical fix, candidate for automation
    Simple,
    /// Needs a type-level change
    Complex,
    /// Needs a human decision
    Manual,
}

impl ErrorCategory {
    pub fn as_str(&self) -> &'static str {
        match self {
            ErrorCategory::Simple => "SIMPLE",
            ErrorCategory::Complex => "COMPLEX",
            ErrorCategory::Manual => "MANUAL",
        }
    }

    /// Confidence before bonuses.
    pub fn base_confidence(&self) -> f64 {
        match self {
            ErrorCategory::Simple => 0.9,
            ErrorCategory::Complex => 0.7,
            ErrorCategory::Manual => 0.5,
        }
    }
}

impl fmt::Display for ErrorCategory {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.write_str(self.as_str())
    }
}

/// Impact of a diagnostic. Ordered from least to most severe.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, PartialOrd, Ord, Serialize, Deserialize)]
#[serde(rename_all = "SCREAMING_SNAKE_CASE")]
pub enum Severity {
    Low,
    Medium,
    High,
    Critical,
}

impl Severity {
    pub fn as_str(&self) -> &'static str {
        match self {
            Severity::Low => "LOW",
            Severity::Medium => "MEDIUM",
            Severity::High => "HIGH",
            Severity::Critical => "CRITICAL",
        }
    }
}

impl fmt::Display for Severity {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.write_str(self.as_str())
    }
}

pub const CATEGORY_RULES: &[(ErrorCategory, &str)] = &[
    // missing import
    (ErrorCategory::Simple, r#"(?i)import "?[\w.]+"? could not be resolved"#),
    (ErrorCategory::Simple, r"(?i)no module named"),
    (ErrorCategory::Simple, r#"(?i)"\w+" is unknown import symbol"#),
    (ErrorCategory::Simple, r#"(?i)[`'"]?[\w.]+[`'"]? imported but unused"#),
    // undefined name
    (ErrorCategory::Simple, r#"(?i)"\w+" is not defined"#),
    (ErrorCategory::Simple, r"(?i)undefined name"),
    // missing argument
    (ErrorCategory::Simple, r"(?i)arguments? missing for parameters?"),
    // unknown keyword argument
    (ErrorCategory::Simple, r#"(?i)no parameter named "?\w+"?"#),
    // missing type arguments
    (ErrorCategory::Simple, r"(?i)expected type arguments for generic class"),
    // direct attribute error
    (ErrorCategory::Simple, r#"(?i)cannot access (?:attribute|member) "\w+" for class"#),
    (ErrorCategory::Simple, r#"(?i)"\w+" is not a known (?:attribute|member) of"#),
    // return type mismatch
    (ErrorCategory::Complex, r"(?i)is not assignable to return type"),
    (ErrorCategory::Complex, r"(?i)incompatible return value type"),
    // incompatible assignment
    (ErrorCategory::Complex, r"(?i)is not assignable to declared type"),
    (ErrorCategory::Complex, r"(?i)incompatible types in assignment"),
    // generic inference failure
    (ErrorCategory::Complex, r"(?i)could not be inferred"),
    (ErrorCategory::Complex, r"(?i)cannot infer type argument"),
    (ErrorCategory::Complex, r"(?i)is partially unknown"),
    // unreachable code
    (ErrorCategory::Manual, r"(?i)code is unreachable|unreachable code"),
    // always-true/false conditions
    (ErrorCategory::Manual, r"(?i)will always evaluate to (?:true|false)"),
    (ErrorCategory::Manual, r"(?i)condition is always (?:true|false)"),
    // inaccessible definitions
    (ErrorCategory::Manual, r"(?i)is (?:private|protected) and used outside"),
    (ErrorCategory::Manual, r"(?i)is not accessible"),
    // cross-type assignability
    (ErrorCategory::Manual, r"(?i)is not assignable to"),
    (ErrorCategory::Manual, r"(?i)is incompatible with"),
];

/// Checked in order: CRITICAL, HIGH, MEDIUM, LOW.
pub const SEVERITY_RULES: &[(Severity, &str)] = &[
    (Severity::Critical, r"(?i)syntax error|invalid syntax|expected expression|unexpected indent"),
    (Severity::Critical, r"(?i)could not be resolved|no module named|circular import"),
    (Severity::High, r"(?i)is not defined|undefined name"),
    (Severity::High, r"(?i)cannot access (?:attribute|member)|is not a known (?:attribute|member)"),
    (Severity::High, r"(?i)argument missing|arguments missing|no parameter named|is not callable"),
    (Severity::High, r"(?i)is not assignable to return type"),
    (Severity::Medium, r"(?i)not assignable|incompatible|could not be inferred"),
    (Severity::Medium, r"(?i)partially unknown|type arguments"),
    (Severity::Low, r"(?i)unused|not accessed|unreachable|always evaluate|always (?:true|false)"),
    (Severity::Low, r"(?i)line too long|whitespace|deprecated|redefinition"),
];

/// Fix suggestions; `${name}` is replaced with the named capture.
pub const FIX_TEMPLATES: &[(&str, &str)] = &[
    (
        r#"(?i)import "(?P<module>[\w.]+)" could not be resolved"#,
        "Install '${module}' in the environment or correct the import path",
    ),
    (
        r"(?i)no module named '(?P<module>[\w.]+)'",
        "Install the package providing '${module}' or correct the import",
    ),
    (
        r#"(?i)[`'"](?P<name>[\w.]+)[`'"] imported but unused"#,
        "Remove unused import '${name}'",
    ),
    (
        r#"(?i)"(?P<name>\w+)" is not defined"#,
        "Import or define '${name}' before use",
    ),
    (
        r#"(?i)undefined name [`'"](?P<name>\w+)[`'"]"#,
        "Import or define '${name}' before use",
    ),
    (
        r#"(?i)argument missing for parameter "(?P<param>\w+)""#,
        "Pass a value for parameter '${param}'",
    ),
    (
        r#"(?i)no parameter named "(?P<param>\w+)""#,
        "Remove or rename keyword argument '${param}'",
    ),
    (
        r#"(?i)expected type arguments for generic class "(?P<class>\w+)""#,
        "Add type arguments, e.g. ${class}[Any]",
    ),
    (
        r#"(?i)cannot access (?:attribute|member) "(?P<attr>\w+)" for class "(?P<class>\w+)""#,
        "Check that '${class}' defines '${attr}' or fix the attribute name",
    ),
    (
        r#"(?i)type "(?P<actual>[^"]+)" is not assignable to return type "(?P<expected>[^"]+)""#,
        "Return '${expected}' instead of '${actual}' or update the return annotation",
    ),
];

/// Message keywords for which fixes have proven reliable.
pub const RELIABLE_KEYWORDS: &[&str] = &[
    "import",
    "not defined",
    "undefined name",
    "unused",
    "missing",
    "no parameter named",
    "type arguments",
];

/// Compiled form of the tables above.
#[derive(Debug)]
pub struct RuleSet {
    categories: Vec<(ErrorCategory, Regex)>,
    severities: Vec<(Severity, Regex)>,
    templates: Vec<(Regex, &'static str)>,
}

/// The shared compiled rule set.
pub fn rule_set() -> &'static RuleSet {
    static RULES: OnceLock<RuleSet> = OnceLock::new();
    RULES.get_or_init(RuleSet::compile)
}

impl RuleSet {
    fn compile() -> Self {
        Self {
            categories: CATEGORY_RULES
                .iter()
                .filter_map(|(category, pattern)| Regex::new(pattern).ok().map(|re| (*category, re)))
                .collect(),
            severities: SEVERITY_RULES
                .iter()
                .filter_map(|(severity, pattern)| Regex::new(pattern).ok().map(|re| (*severity, re)))
                .collect(),
            templates: FIX_TEMPLATES
                .iter()
                .filter_map(|(pattern, template)| Regex::new(pattern).ok().map(|re| (re, *template)))
                .collect(),
        }
    }

    /// First matching category; MANUAL when nothing matches.
    pub fn categorize(&self, message: &str) -> ErrorCategory {
        self.categories
            .iter()
            .find(|(_, re)| re.is_match(message))
            .map(|(category, _)| *category)
            .unwrap_or(ErrorCategory::Manual)
    }

    /// First matching severity; MEDIUM when nothing matches.
    pub fn severity(&self, message: &str) -> Severity {
        self.severities
            .iter()
            .find(|(_, re)| re.is_match(message))
            .map(|(severity, _)| *severity)
            .unwrap_or(Severity::Medium)
    }

    /// Instantiate the first matching fix template.
    pub fn suggest_fix(&self, message: &str) -> Option<String> {
        self.templates.iter().find_map(|(re, template)| {
            re.captures(message).map(|caps| {
                let mut fix = String::new();
                caps.expand(template, &mut fix);
                fix
            })
        })
    }
}

/// Whether `message` mentions a keyword from [`RELIABLE_KEYWORDS`].
pub fn has_reliable_keyword(message: &str) -> bool {
    let lower = message.to_lowercase();
    RELIABLE_KEYWORDS.iter().any(|keyword| lower.contains(keyword))
}
