//! Epic document parser.
//!
//! An epic is a Markdown document:
//!
//! ```text
//! # Epic 3: Sorting service
//!
//! ## Stories
//!
//! ### Story 3.1: Bubble sort core
//! - File: stories/3.1.bubble-sort.md
//! - Priority: high
//!
//! ### Story 3.2: CLI wrapper
//! - File: stories/3.2.cli.md
//! ```
//!
//! Story headings are taken from the `## Stories` section in document
//! order. Each story needs a `File` (or `Path`) bullet, resolved relative to
//! the epic's directory; the other bullets are kept as metadata.

use std::collections::{BTreeMap, HashSet};
use std::fs;
use std::io;
use std::path::{Path, PathBuf};
use std::sync::OnceLock;

use regex::Regex;
use thiserror::Error;

/// Section heading that lists the stories.
pub const STORIES_SECTION: &str = "Stories";

/// Errors raised while reading or parsing an epic.
#[derive(Error, Debug)]
pub enum EpicParseError {
    /// A required section is absent.
    #[error("missing section: {section}")]
    MissingSection { section: String },

    /// The stories section exists but lists no stories.
    #[error("section 'Stories' lists no stories")]
    NoStories,

    /// A heading in the stories section is not a story heading.
    #[error("line {line}: malformed story heading '{heading}'")]
    MalformedHeading { line: usize, heading: String },

    /// Two stories share an id.
    #[error("duplicate story id '{story_id}' (lines {first_line} and {line})")]
    DuplicateStoryId {
        story_id: String,
        first_line: usize,
        line: usize,
    },

    /// Two stories reference the same story file.
    #[error("story file {path} is listed more than once")]
    DuplicateStoryPath { path: PathBuf },

    /// A story has no file reference.
    #[error("story '{story_id}' has no File entry")]
    MissingStoryFile { story_id: String },

    /// The epic document could not be read.
    #[error("cannot read epic {path}: {source}")]
    Io {
        path: PathBuf,
        #[source]
        source: io::Error,
    },
}

/// One story listed by an epic.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct EpicStory {
    pub story_id: String,
    pub title: String,
    /// Story file, resolved against the epic's directory
    pub story_path: PathBuf,
    /// Remaining `- Key: value` bullets, keys lower-cased
    pub metadata: BTreeMap<String, String>,
    /// 1-based line of the story heading
    pub line: usize,
}

/// A parsed epic.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct Epic {
    pub title: String,
    pub path: PathBuf,
    pub stories: Vec<EpicStory>,
}

impl Epic {
    /// Identifier used as `epic_id` on phase records.
    pub fn epic_id(&self) -> String {
        self.path.display().to_string()
    }
}

fn story_heading_re() -> Option<&'static Regex> {
    static RE: OnceLock<Option<Regex>> = OnceLock::new();
    RE.get_or_init(|| {
        Regex::new(r"(?i)^story\s+([A-Za-z0-9][A-Za-z0-9._-]*)\s*(?::\s*(.*))?$").ok()
    })
    .as_ref()
}

fn metadata_re() -> Option<&'static Regex> {
    static RE: OnceLock<Option<Regex>> = OnceLock::new();
    RE.get_or_init(|| {
        Regex::new(r"^\s*[-*]\s+\**([A-Za-z][A-Za-z0-9 _-]*?)\**\s*:\s*(.+?)\s*$").ok()
    })
    .as_ref()
}

/// Read and parse the epic at `path`.
pub fn load_epic(path: &Path) -> Result<Epic, EpicParseError> {
    let content = fs::read_to_string(path).map_err(|source| EpicParseError::Io {
        path: path.to_path_buf(),
        source,
    })?;
    let base_dir = path.parent().unwrap_or_else(|| Path::new(""));
    let mut epic = parse_epic(&content, base_dir)?;
    epic.path = path.to_path_buf();
    Ok(epic)
}

/// Parse epic text; story file references resolve against `base_dir`.
pub fn parse_epic(content: &str, base_dir: &Path) -> Result<Epic, EpicParseError> {
    let mut title: Option<String> = None;
    let mut in_stories = false;
    let mut saw_stories = false;
    let mut in_fence = false;
    let mut drafts: Vec<StoryDraft> = Vec::new();

    for (index, raw) in content.lines().enumerate() {
        let line_no = index + 1;
        let line = raw.trim_end();

        if line.trim_start().starts_with("```") {
            in_fence = !in_fence;
            continue;
        }
        if in_fence {
            continue;
        }

        if let Some(text) = heading(line, 1) {
            if title.is_none() {
                title = Some(text.to_string());
            }
            in_stories = false;
            continue;
        }
        if let Some(text) = heading(line, 2) {
            in_stories = text.eq_ignore_ascii_case(STORIES_SECTION);
            saw_stories |= in_stories;
            continue;
        }
        if !in_stories {
            continue;
        }

        if let Some(text) = heading(line, 3) {
            let caps = story_heading_re()
                .and_then(|re| re.captures(text))
                .ok_or_else(|| EpicParseError::MalformedHeading {
                    line: line_no,
                    heading: text.to_string(),
                })?;
            drafts.push(StoryDraft {
                story_id: caps[1].to_string(),
                title: caps
                    .get(2)
                    .map(|m| m.as_str().trim().to_string())
                    .unwrap_or_default(),
                file: None,
                metadata: BTreeMap::new(),
                line: line_no,
            });
            continue;
        }

        let caps = metadata_re().and_then(|re| re.captures(line));
        if let (Some(draft), Some(caps)) = (drafts.last_mut(), caps) {
            let key = caps[1].trim().to_lowercase();
            let value = caps[2].trim().trim_matches('`').to_string();
            if matches!(key.as_str(), "file" | "path" | "story file") && draft.file.is_none() {
                draft.file = Some(value);
            } else {
                draft.metadata.insert(key, value);
            }
        }
    }

    let title = title.ok_or_else(|| EpicParseError::MissingSection {
        section: "title".to_string(),
    })?;
    if !saw_stories {
        return Err(EpicParseError::MissingSection {
            section: STORIES_SECTION.to_string(),
        });
    }
    if drafts.is_empty() {
        return Err(EpicParseError::NoStories);
    }

    let mut seen: BTreeMap<String, usize> = BTreeMap::new();
    let mut seen_paths: HashSet<PathBuf> = HashSet::new();
    let mut stories = Vec::with_capacity(drafts.len());
    for draft in drafts {
        if let Some(first_line) = seen.get(&draft.story_id) {
            return Err(EpicParseError::DuplicateStoryId {
                story_id: draft.story_id,
                first_line: *first_line,
                line: draft.line,
            });
        }
        seen.insert(draft.story_id.clone(), draft.line);

        let file = draft.file.ok_or_else(|| EpicParseError::MissingStoryFile {
            story_id: draft.story_id.clone(),
        })?;
        let story_path = base_dir.join(file);
        if !seen_paths.insert(story_path.clone()) {
            return Err(EpicParseError::DuplicateStoryPath { path: story_path });
        }
        stories.push(EpicStory {
            story_id: draft.story_id,
            title: draft.title,
            story_path,
            metadata: draft.metadata,
            line: draft.line,
        });
    }

    Ok(Epic {
        title,
        path: PathBuf::new(),
        stories,
    })
}

struct StoryDraft {
    story_id: String,
    title: String,
    file: Option<String>,
    metadata: BTreeMap<String, String>,
    line: usize,
}

/// Text of an ATX heading of exactly `level`, if `line` is one.
fn heading(line: &str, level: usize) -> Option<&str> {
    let trimmed = line.trim_start();
    let hashes = trimmed.chars().take_while(|c| *c == '#').count();
    if hashes != level {
        return None;
    }
    let rest = &trimmed[hashes..];
    if !rest.is_empty() && !rest.starts_with(char::is_whitespace) {
        return None;
    }
    Some(rest.trim().trim_end_matches('#').trim())
}
