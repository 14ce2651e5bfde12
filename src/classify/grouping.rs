//! Clustering of classified diagnostics by rule and normalized message.

use std::collections::HashMap;
use std::sync::OnceLock;

use regex::Regex;
use serde::{Deserialize, Serialize};

use super::rules::ErrorCategory;
use super::ClassifiedDiagnostic;

/// Length of the normalized message prefix used as part of the group key.
pub const GROUP_PREFIX_LEN: usize = 50;

/// Diagnostics that share a rule and a normalized message prefix.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct ErrorGroup {
    /// `grp-001`, `grp-002`, ... in order of first appearance
    pub id: String,
    pub rule: String,
    /// Normalized message prefix
    pub pattern: String,
    /// Indices into the classified diagnostic list, in input order
    pub members: Vec<usize>,
    pub files: Vec<String>,
    /// Shared fix, only for groups of two or more
    pub common_fix: Option<String>,
    /// Every member is SIMPLE
    pub auto_fixable: bool,
}

impl ErrorGroup {
    pub fn size(&self) -> usize {
        self.members.len()
    }
}

fn literal_re() -> Option<&'static Regex> {
    static RE: OnceLock<Option<Regex>> = OnceLock::new();
    RE.get_or_init(|| Regex::new(r#""[^"]*"|'[^']*'|`[^`]*`"#).ok()).as_ref()
}

fn dotted_re() -> Option<&'static Regex> {
    static RE: OnceLock<Option<Regex>> = OnceLock::new();
    RE.get_or_init(|| Regex::new(r"\b[A-Za-z_]\w*(?:\.[A-Za-z_]\w*)+\b").ok())
        .as_ref()
}

fn digits_re() -> Option<&'static Regex> {
    static RE: OnceLock<Option<Regex>> = OnceLock::new();
    RE.get_or_init(|| Regex::new(r"\d+").ok()).as_ref()
}

/// Replace the variable parts of a message with placeholders.
///
/// Literals go first so quoted names and numbers collapse to one
/// `"<value>"`; dotted names are replaced before digit runs so `np.float64`
/// becomes `<obj.attr>` rather than `np.float<num>`.
pub fn normalize_message(message: &str) -> String {
    let mut normalized = message.to_string();
    if let Some(re) = literal_re() {
        normalized = re.replace_all(&normalized, "\"<value>\"").into_owned();
    }
    if let Some(re) = dotted_re() {
        normalized = re.replace_all(&normalized, "<obj.attr>").into_owned();
    }
    if let Some(re) = digits_re() {
        normalized = re.replace_all(&normalized, "<num>").into_owned();
    }
    normalized
}

fn group_key(diagnostic: &ClassifiedDiagnostic) -> (String, String) {
    let prefix: String = normalize_message(&diagnostic.diagnostic.message)
        .chars()
        .take(GROUP_PREFIX_LEN)
        .collect();
    (diagnostic.diagnostic.rule_code().to_string(), prefix)
}

/// Fix shared by every member: the suggestion itself when all agree,
/// otherwise their normalized form when that agrees.
fn common_fix(members: &[&ClassifiedDiagnostic]) -> Option<String> {
    let suggestions: Vec<&str> = members
        .iter()
        .map(|member| member.fix_suggestion.as_deref())
        .collect::<Option<Vec<_>>>()?;
    let (first, rest) = suggestions.split_first()?;
    if rest.iter().all(|s| s == first) {
        return Some(first.to_string());
    }
    let normalized = normalize_message(first);
    rest.iter()
        .all(|s| normalize_message(s) == normalized)
        .then_some(normalized)
}

/// Group `diagnostics` and stamp each with its group id.
pub fn group_diagnostics(diagnostics: &mut [ClassifiedDiagnostic]) -> Vec<ErrorGroup> {
    let mut index: HashMap<(String, String), usize> = HashMap::new();
    let mut groups: Vec<ErrorGroup> = Vec::new();

    for (position, diagnostic) in diagnostics.iter_mut().enumerate() {
        let key = group_key(diagnostic);
        let slot = match index.get(&key) {
            Some(slot) => *slot,
            None => {
                let slot = groups.len();
                groups.push(ErrorGroup {
                    id: format!("grp-{:03}", slot + 1),
                    rule: key.0.clone(),
                    pattern: key.1.clone(),
                    members: Vec::new(),
                    files: Vec::new(),
                    common_fix: None,
                    auto_fixable: true,
                });
                index.insert(key, slot);
                slot
            }
        };

        let group = &mut groups[slot];
        group.members.push(position);
        if !group.files.contains(&diagnostic.diagnostic.file) {
            group.files.push(diagnostic.diagnostic.file.clone());
        }
        group.auto_fixable &= diagnostic.category == ErrorCategory::Simple;
        diagnostic.group_id = Some(group.id.clone());
    }

    for group in groups.iter_mut().filter(|g| g.size() >= 2) {
        let members: Vec<&ClassifiedDiagnostic> =
            group.members.iter().map(|&i| &diagnostics[i]).collect();
        group.common_fix = common_fix(&members);
    }
    groups
}
