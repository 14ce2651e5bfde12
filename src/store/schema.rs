//! Table definitions and the ordered migration steps that produce them.
//!
//! Every step is idempotent: tables and indexes use `IF NOT EXISTS` and
//! column additions are skipped when the column is already present, so the
//! full list can be replayed against any earlier version of the store.

use super::migrate::MigrationStep;

pub const CREATE_STORIES: &str = "
CREATE TABLE IF NOT EXISTS stories (
    story_path TEXT PRIMARY KEY,
    story_id TEXT NOT NULL DEFAULT '',
    epic_path TEXT NOT NULL DEFAULT '',
    phase TEXT NOT NULL DEFAULT 'PREP',
    status TEXT NOT NULL DEFAULT 'PENDING',
    iteration INTEGER NOT NULL DEFAULT 0,
    last_error TEXT,
    qa_result TEXT,
    created_at TEXT NOT NULL DEFAULT '',
    updated_at TEXT NOT NULL DEFAULT ''
);";

pub const CREATE_CODE_QUALITY_PHASE: &str = "
CREATE TABLE IF NOT EXISTS code_quality_phase (
    id TEXT PRIMARY KEY,
    epic_id TEXT NOT NULL,
    story_path TEXT NOT NULL REFERENCES stories(story_path),
    file_path TEXT NOT NULL,
    error_count INTEGER NOT NULL DEFAULT 0,
    fix_status TEXT NOT NULL DEFAULT 'PENDING',
    type_check_errors TEXT NOT NULL DEFAULT '[]',
    lint_errors TEXT NOT NULL DEFAULT '[]',
    recorded_at TEXT NOT NULL
);";

pub const CREATE_TEST_AUTOMATION_PHASE: &str = "
CREATE TABLE IF NOT EXISTS test_automation_phase (
    id TEXT PRIMARY KEY,
    epic_id TEXT NOT NULL,
    story_path TEXT NOT NULL REFERENCES stories(story_path),
    test_file_path TEXT NOT NULL,
    failure_count INTEGER NOT NULL DEFAULT 0,
    fix_status TEXT NOT NULL DEFAULT 'PENDING',
    debug_notes TEXT NOT NULL DEFAULT '',
    recorded_at TEXT NOT NULL
);";

pub const CREATE_PHASE_HISTORY: &str = "
CREATE TABLE IF NOT EXISTS phase_history (
    id INTEGER PRIMARY KEY AUTOINCREMENT,
    story_path TEXT NOT NULL REFERENCES stories(story_path),
    iteration INTEGER NOT NULL,
    phase TEXT NOT NULL,
    status TEXT NOT NULL,
    recorded_at TEXT NOT NULL
);";

pub const CREATE_QA_REVIEWS: &str = "
CREATE TABLE IF NOT EXISTS qa_reviews (
    id INTEGER PRIMARY KEY AUTOINCREMENT,
    story_path TEXT NOT NULL REFERENCES stories(story_path),
    iteration INTEGER NOT NULL,
    gate TEXT NOT NULL,
    verdict TEXT NOT NULL,
    recorded_at TEXT NOT NULL
);";

pub const CREATE_INDEXES: &str = "
CREATE INDEX IF NOT EXISTS idx_stories_epic ON stories(epic_path);
CREATE INDEX IF NOT EXISTS idx_quality_story ON code_quality_phase(story_path);
CREATE INDEX IF NOT EXISTS idx_quality_epic ON code_quality_phase(epic_id);
CREATE INDEX IF NOT EXISTS idx_test_story ON test_automation_phase(story_path);
CREATE INDEX IF NOT EXISTS idx_test_epic ON test_automation_phase(epic_id);
CREATE INDEX IF NOT EXISTS idx_history_story ON phase_history(story_path);
CREATE INDEX IF NOT EXISTS idx_qa_reviews_story ON qa_reviews(story_path);";

/// The full migration list, applied in order at startup.
pub fn migration_steps() -> Vec<MigrationStep> {
    vec![
        MigrationStep::sql("create_stories", CREATE_STORIES),
        // Columns added after the first release of the stories table.
        MigrationStep::add_column("stories", "story_id", "TEXT NOT NULL DEFAULT ''"),
        MigrationStep::add_column("stories", "iteration", "INTEGER NOT NULL DEFAULT 0"),
        MigrationStep::add_column("stories", "last_error", "TEXT"),
        MigrationStep::add_column("stories", "qa_result", "TEXT"),
        MigrationStep::add_column("stories", "created_at", "TEXT NOT NULL DEFAULT ''"),
        MigrationStep::add_column("stories", "updated_at", "TEXT NOT NULL DEFAULT ''"),
        MigrationStep::sql("create_code_quality_phase", CREATE_CODE_QUALITY_PHASE),
        MigrationStep::sql("create_test_automation_phase", CREATE_TEST_AUTOMATION_PHASE),
        MigrationStep::sql("create_phase_history", CREATE_PHASE_HISTORY),
        MigrationStep::sql("create_qa_reviews", CREATE_QA_REVIEWS),
        MigrationStep::sql("create_indexes", CREATE_INDEXES),
    ]
}

/// Tables a fully migrated store contains.
pub const TABLES: &[&str] = &[
    "stories",
    "code_quality_phase",
    "test_automation_phase",
    "phase_history",
    "qa_reviews",
];
