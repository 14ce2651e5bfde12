//! Test batch discovery.

use std::fs;
use std::io;
use std::path::{Path, PathBuf};

use tracing::debug;

use super::batch::TestBatch;

/// Subdirectories of the test root that never hold tests.
pub const EXCLUDED_DIRS: &[&str] = &[
    "__pycache__",
    ".pytest_cache",
    ".mypy_cache",
    ".ruff_cache",
    ".git",
    ".hg",
    ".svn",
    "CVS",
    "htmlcov",
    "coverage",
];

/// Test module naming: `test_*.py` or `*_test.py`.
pub fn is_test_file(name: &str) -> bool {
    name.ends_with(".py") && (name.starts_with("test_") || name.ends_with("_test.py"))
}

fn is_excluded(name: &str) -> bool {
    name.starts_with('.') || EXCLUDED_DIRS.contains(&name)
}

/// Enumerate the batches under `test_root`.
///
/// Every immediate subdirectory (except hidden and excluded ones) becomes a
/// batch; test files directly under the root form the loose batch. The result
/// is sorted by priority, then by name.
pub fn discover_batches(test_root: &Path) -> io::Result<Vec<TestBatch>> {
    let mut dirs: Vec<(String, PathBuf)> = Vec::new();
    let mut loose: Vec<PathBuf> = Vec::new();

    for entry in fs::read_dir(test_root)? {
        let entry = entry?;
        let name = entry.file_name().to_string_lossy().into_owned();
        let file_type = entry.file_type()?;
        if file_type.is_dir() {
            if is_excluded(&name) {
                debug!(dir = %name, "skipping excluded test directory");
                continue;
            }
            dirs.push((name, entry.path()));
        } else if file_type.is_file() && is_test_file(&name) {
            loose.push(entry.path());
        }
    }

    let mut batches: Vec<TestBatch> = dirs
        .into_iter()
        .map(|(name, path)| TestBatch::for_directory(name, path))
        .collect();
    if !loose.is_empty() {
        loose.sort();
        batches.push(TestBatch::loose(loose));
    }

    batches.sort_by(|a, b| a.name.cmp(&b.name));
    batches.sort_by_key(|batch| batch.priority);
    Ok(batches)
}
