//! Durable state store.
//!
//! A single SQLite file holds story rows, per-file quality and test records,
//! the phase history and QA reviews. All writes go through a process-local
//! single-writer lock obtained with [`StateStore::managed_operation`]; reads
//! take no lock because the driver is the only writer.
//!
//! SQLite calls are blocking, so every operation runs on tokio's blocking
//! pool via `spawn_blocking`.

pub mod migrate;
pub mod records;
pub mod schema;

use std::io;
use std::path::{Path, PathBuf};
use std::sync::{Arc, Mutex};
use std::time::Duration;

use chrono::{DateTime, SecondsFormat, Utc};
use rusqlite::{params, Connection, OptionalExtension, Row};
use thiserror::Error;
use tokio::sync::OwnedMutexGuard;
use tracing::debug;

use crate::story::{Story, StoryUpdate};
use crate::verdict::QaVerdict;

pub use migrate::{MigrationStep, Migrator};
pub use records::{
    record_id, FixStatus, PhaseHistoryEntry, QaReview, QualityRecord, TestPhaseRecord,
};

/// Default time to wait for the single-writer lock.
pub const DEFAULT_LOCK_TIMEOUT: Duration = Duration::from_secs(30);

/// Errors raised by the state store.
#[derive(Error, Debug)]
pub enum StoreError {
    /// File system failure (backup, restore, directory creation).
    #[error("IO error: {0}")]
    Io(#[from] io::Error),

    /// Backing-store failure.
    #[error("SQLite error: {0}")]
    Sqlite(#[from] rusqlite::Error),

    /// JSON column could not be encoded or decoded.
    #[error("JSON error: {0}")]
    Json(#[from] serde_json::Error),

    /// The single-writer lock was not acquired in time.
    #[error("timed out waiting for the store write lock")]
    LockTimeout,

    /// A thread panicked while holding the connection.
    #[error("store connection poisoned")]
    Poisoned,

    /// A schema migration step failed; the store was rolled back.
    #[error("migration step '{step}' failed: {source}")]
    Migration {
        step: String,
        #[source]
        source: rusqlite::Error,
    },

    /// The pre-migration backup could not be verified.
    #[error("backup verification failed for {path}: {reason}")]
    BackupVerification { path: PathBuf, reason: String },

    /// A stored value could not be decoded.
    #[error("invalid stored value: {0}")]
    InvalidRow(String),

    /// The blocking task running the operation did not complete.
    #[error("store task failed: {0}")]
    Task(String),
}

/// Result type for state store operations.
pub type StoreResult<T> = Result<T, StoreError>;

/// Snapshot of store availability.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub struct StoreHealth {
    pub store_exists: bool,
    pub lock_held: bool,
}

type SharedConnection = Arc<Mutex<Connection>>;

async fn with_connection<F, R>(conn: &SharedConnection, f: F) -> StoreResult<R>
where
    F: FnOnce(&mut Connection) -> StoreResult<R> + Send + 'static,
    R: Send + 'static,
{
    let conn = Arc::clone(conn);
    tokio::task::spawn_blocking(move || {
        let mut guard = conn.lock().map_err(|_| StoreError::Poisoned)?;
        f(&mut guard)
    })
    .await
    .map_err(|err| StoreError::Task(err.to_string()))?
}

/// Handle to the state store. Cloning shares the connection and the lock.
#[derive(Debug, Clone)]
pub struct StateStore {
    path: PathBuf,
    conn: SharedConnection,
    writer: Arc<tokio::sync::Mutex<()>>,
    lock_timeout: Duration,
}

impl StateStore {
    /// Open the store at `path`, running the standard migration first.
    ///
    /// Blocking; call from `spawn_blocking` when inside the runtime.
    pub fn open(path: impl Into<PathBuf>, backup_dir: impl Into<PathBuf>) -> StoreResult<Self> {
        Self::open_with(path, &Migrator::new(backup_dir))
    }

    /// Open the store with a custom migrator.
    pub fn open_with(path: impl Into<PathBuf>, migrator: &Migrator) -> StoreResult<Self> {
        let path = path.into();
        let conn = migrator.run(&path)?;
        debug!(path = %path.display(), "state store opened");
        Ok(Self {
            path,
            conn: Arc::new(Mutex::new(conn)),
            writer: Arc::new(tokio::sync::Mutex::new(())),
            lock_timeout: DEFAULT_LOCK_TIMEOUT,
        })
    }

    pub fn with_lock_timeout(mut self, timeout: Duration) -> Self {
        self.lock_timeout = timeout;
        self
    }

    pub fn path(&self) -> &Path {
        &self.path
    }

    /// Whether the store file exists and whether a write is in flight.
    pub fn get_health(&self) -> StoreHealth {
        StoreHealth {
            store_exists: self.path.exists(),
            lock_held: self.writer.try_lock().is_err(),
        }
    }

    /// Acquire the single-writer lock.
    ///
    /// The returned lease releases the lock when dropped, which covers early
    /// returns, errors and cancellation of the owning future.
    pub async fn managed_operation(&self) -> StoreResult<WriteLease> {
        let guard = tokio::time::timeout(self.lock_timeout, Arc::clone(&self.writer).lock_owned())
            .await
            .map_err(|_| StoreError::LockTimeout)?;
        Ok(WriteLease {
            _guard: guard,
            conn: Arc::clone(&self.conn),
        })
    }

    /// Upsert a story row under the write lock and return the stored row.
    pub async fn update_story(&self, story_path: &str, update: StoryUpdate) -> StoreResult<Story> {
        self.managed_operation()
            .await?
            .update_story(story_path, update)
            .await
    }

    /// Batch upsert of quality records under the write lock.
    pub async fn upsert_quality_records(&self, records: Vec<QualityRecord>) -> StoreResult<usize> {
        self.managed_operation()
            .await?
            .upsert_quality_records(records)
            .await
    }

    /// Batch upsert of test records under the write lock.
    pub async fn upsert_test_records(&self, records: Vec<TestPhaseRecord>) -> StoreResult<usize> {
        self.managed_operation()
            .await?
            .upsert_test_records(records)
            .await
    }

    /// Append a QA review and mirror its verdict into the story row.
    pub async fn record_qa_review(
        &self,
        story_path: &str,
        iteration: u32,
        verdict: QaVerdict,
    ) -> StoreResult<()> {
        self.managed_operation()
            .await?
            .record_qa_review(story_path, iteration, verdict)
            .await
    }

    pub async fn get_story(&self, story_path: &str) -> StoreResult<Option<Story>> {
        let story_path = story_path.to_string();
        with_connection(&self.conn, move |conn| load_story(conn, &story_path)).await
    }

    /// All story rows, oldest first.
    pub async fn list_stories(&self) -> StoreResult<Vec<Story>> {
        with_connection(&self.conn, |conn| {
            let mut stmt = conn.prepare(&format!(
                "SELECT {STORY_COLUMNS} FROM stories ORDER BY created_at ASC, story_path ASC"
            ))?;
            let rows = stmt.query_map([], read_story_row)?;
            let mut stories = Vec::new();
            for row in rows {
                stories.push(decode_story(row?)?);
            }
            Ok(stories)
        })
        .await
    }

    pub async fn quality_records(&self, story_path: &str) -> StoreResult<Vec<QualityRecord>> {
        let story_path = story_path.to_string();
        with_connection(&self.conn, move |conn| {
            let mut stmt = conn.prepare(
                "SELECT id, epic_id, story_path, file_path, error_count, fix_status,
                        type_check_errors, lint_errors, recorded_at
                 FROM code_quality_phase WHERE story_path = ?1 ORDER BY file_path ASC",
            )?;
            let rows = stmt.query_map(params![story_path], |row| {
                Ok((
                    row.get::<_, String>(0)?,
                    row.get::<_, String>(1)?,
                    row.get::<_, String>(2)?,
                    row.get::<_, String>(3)?,
                    row.get::<_, u32>(4)?,
                    row.get::<_, String>(5)?,
                    row.get::<_, String>(6)?,
                    row.get::<_, String>(7)?,
                    row.get::<_, String>(8)?,
                ))
            })?;

            let mut records = Vec::new();
            for row in rows {
                let (id, epic_id, story_path, file_path, error_count, fix, tc, lint, at) = row?;
                records.push(QualityRecord {
                    id,
                    epic_id,
                    story_path,
                    file_path,
                    error_count,
                    fix_status: fix.parse().map_err(StoreError::InvalidRow)?,
                    type_check_errors: serde_json::from_str(&tc)?,
                    lint_errors: serde_json::from_str(&lint)?,
                    recorded_at: parse_timestamp(&at)?,
                });
            }
            Ok(records)
        })
        .await
    }

    pub async fn test_records(&self, story_path: &str) -> StoreResult<Vec<TestPhaseRecord>> {
        let story_path = story_path.to_string();
        with_connection(&self.conn, move |conn| {
            let mut stmt = conn.prepare(
                "SELECT id, epic_id, story_path, test_file_path, failure_count, fix_status,
                        debug_notes, recorded_at
                 FROM test_automation_phase WHERE story_path = ?1 ORDER BY test_file_path ASC",
            )?;
            let rows = stmt.query_map(params![story_path], |row| {
                Ok((
                    row.get::<_, String>(0)?,
                    row.get::<_, String>(1)?,
                    row.get::<_, String>(2)?,
                    row.get::<_, String>(3)?,
                    row.get::<_, u32>(4)?,
                    row.get::<_, String>(5)?,
                    row.get::<_, String>(6)?,
                    row.get::<_, String>(7)?,
                ))
            })?;

            let mut records = Vec::new();
            for row in rows {
                let (id, epic_id, story_path, test_file_path, failure_count, fix, notes, at) =
                    row?;
                records.push(TestPhaseRecord {
                    id,
                    epic_id,
                    story_path,
                    test_file_path,
                    failure_count,
                    fix_status: fix.parse().map_err(StoreError::InvalidRow)?,
                    debug_notes: notes,
                    recorded_at: parse_timestamp(&at)?,
                });
            }
            Ok(records)
        })
        .await
    }

    /// States entered by a story, in order.
    pub async fn phase_history(&self, story_path: &str) -> StoreResult<Vec<PhaseHistoryEntry>> {
        let story_path = story_path.to_string();
        with_connection(&self.conn, move |conn| {
            let mut stmt = conn.prepare(
                "SELECT story_path, iteration, phase, status, recorded_at
                 FROM phase_history WHERE story_path = ?1 ORDER BY id ASC",
            )?;
            let rows = stmt.query_map(params![story_path], |row| {
                Ok((
                    row.get::<_, String>(0)?,
                    row.get::<_, u32>(1)?,
                    row.get::<_, String>(2)?,
                    row.get::<_, String>(3)?,
                    row.get::<_, String>(4)?,
                ))
            })?;

            let mut entries = Vec::new();
            for row in rows {
                let (story_path, iteration, phase, status, at) = row?;
                entries.push(PhaseHistoryEntry {
                    story_path,
                    iteration,
                    phase: phase.parse().map_err(StoreError::InvalidRow)?,
                    status: status.parse().map_err(StoreError::InvalidRow)?,
                    recorded_at: parse_timestamp(&at)?,
                });
            }
            Ok(entries)
        })
        .await
    }

    /// QA reviews of a story, oldest first.
    pub async fn qa_reviews(&self, story_path: &str) -> StoreResult<Vec<QaReview>> {
        let story_path = story_path.to_string();
        with_connection(&self.conn, move |conn| {
            let mut stmt = conn.prepare(
                "SELECT story_path, iteration, verdict, recorded_at
                 FROM qa_reviews WHERE story_path = ?1 ORDER BY id ASC",
            )?;
            let rows = stmt.query_map(params![story_path], |row| {
                Ok((
                    row.get::<_, String>(0)?,
                    row.get::<_, u32>(1)?,
                    row.get::<_, String>(2)?,
                    row.get::<_, String>(3)?,
                ))
            })?;

            let mut reviews = Vec::new();
            for row in rows {
                let (story_path, iteration, verdict, at) = row?;
                let verdict: QaVerdict = serde_json::from_str(&verdict)?;
                reviews.push(QaReview {
                    story_path,
                    iteration,
                    gate: verdict.gate,
                    verdict,
                    recorded_at: parse_timestamp(&at)?,
                });
            }
            Ok(reviews)
        })
        .await
    }
}

/// Exclusive write access to the store, released on drop.
#[derive(Debug)]
pub struct WriteLease {
    _guard: OwnedMutexGuard<()>,
    conn: SharedConnection,
}

impl WriteLease {
    /// Upsert a story row.
    ///
    /// Unset fields of `update` keep their stored values; a new row starts
    /// from `Story::new`. When the update sets a phase, the resulting
    /// (phase, status, iteration) is appended to `phase_history` in the same
    /// transaction.
    pub async fn update_story(&self, story_path: &str, update: StoryUpdate) -> StoreResult<Story> {
        let story_path = story_path.to_string();
        with_connection(&self.conn, move |conn| {
            let tx = conn.transaction()?;
            let mut story = match load_story(&tx, &story_path)? {
                Some(story) => story,
                None => Story::new(
                    story_path.clone(),
                    update.story_id.clone().unwrap_or_default(),
                    update.epic_path.clone().unwrap_or_default(),
                ),
            };
            story.apply(&update);

            let qa_result = story
                .qa_result
                .as_ref()
                .map(serde_json::to_string)
                .transpose()?;
            tx.execute(
                "INSERT INTO stories (story_path, story_id, epic_path, phase, status, iteration,
                                      last_error, qa_result, created_at, updated_at)
                 VALUES (?1, ?2, ?3, ?4, ?5, ?6, ?7, ?8, ?9, ?10)
                 ON CONFLICT(story_path) DO UPDATE SET
                    story_id = excluded.story_id,
                    epic_path = excluded.epic_path,
                    phase = excluded.phase,
                    status = excluded.status,
                    iteration = excluded.iteration,
                    last_error = excluded.last_error,
                    qa_result = excluded.qa_result,
                    updated_at = excluded.updated_at",
                params![
                    story.story_path,
                    story.story_id,
                    story.epic_path,
                    story.phase.as_str(),
                    story.status.as_str(),
                    story.iteration,
                    story.last_error,
                    qa_result,
                    format_timestamp(&story.created_at),
                    format_timestamp(&story.updated_at),
                ],
            )?;

            if update.phase.is_some() {
                tx.execute(
                    "INSERT INTO phase_history (story_path, iteration, phase, status, recorded_at)
                     VALUES (?1, ?2, ?3, ?4, ?5)",
                    params![
                        story.story_path,
                        story.iteration,
                        story.phase.as_str(),
                        story.status.as_str(),
                        format_timestamp(&story.updated_at),
                    ],
                )?;
            }

            tx.commit()?;
            Ok(story)
        })
        .await
    }

    /// Insert or replace quality records by id; returns the number written.
    pub async fn upsert_quality_records(&self, records: Vec<QualityRecord>) -> StoreResult<usize> {
        with_connection(&self.conn, move |conn| {
            let tx = conn.transaction()?;
            {
                let mut stmt = tx.prepare(
                    "INSERT INTO code_quality_phase (id, epic_id, story_path, file_path, error_count,
                                                     fix_status, type_check_errors, lint_errors,
                                                     recorded_at)
                     VALUES (?1, ?2, ?3, ?4, ?5, ?6, ?7, ?8, ?9)
                     ON CONFLICT(id) DO UPDATE SET
                        error_count = excluded.error_count,
                        fix_status = excluded.fix_status,
                        type_check_errors = excluded.type_check_errors,
                        lint_errors = excluded.lint_errors,
                        recorded_at = excluded.recorded_at",
                )?;
                for record in &records {
                    stmt.execute(params![
                        record.id,
                        record.epic_id,
                        record.story_path,
                        record.file_path,
                        record.error_count,
                        record.fix_status.as_str(),
                        serde_json::to_string(&record.type_check_errors)?,
                        serde_json::to_string(&record.lint_errors)?,
                        format_timestamp(&record.recorded_at),
                    ])?;
                }
            }
            tx.commit()?;
            Ok(records.len())
        })
        .await
    }

    /// Insert or replace test records by id; returns the number written.
    pub async fn upsert_test_records(&self, records: Vec<TestPhaseRecord>) -> StoreResult<usize> {
        with_connection(&self.conn, move |conn| {
            let tx = conn.transaction()?;
            {
                let mut stmt = tx.prepare(
                    "INSERT INTO test_automation_phase (id, epic_id, story_path, test_file_path,
                                                        failure_count, fix_status, debug_notes,
                                                        recorded_at)
                     VALUES (?1, ?2, ?3, ?4, ?5, ?6, ?7, ?8)
                     ON CONFLICT(id) DO UPDATE SET
                        failure_count = excluded.failure_count,
                        fix_status = excluded.fix_status,
                        debug_notes = excluded.debug_notes,
                        recorded_at = excluded.recorded_at",
                )?;
                for record in &records {
                    stmt.execute(params![
                        record.id,
                        record.epic_id,
                        record.story_path,
                        record.test_file_path,
                        record.failure_count,
                        record.fix_status.as_str(),
                        record.debug_notes,
                        format_timestamp(&record.recorded_at),
                    ])?;
                }
            }
            tx.commit()?;
            Ok(records.len())
        })
        .await
    }

    /// Append a QA review and set `stories.qa_result` to its verdict.
    pub async fn record_qa_review(
        &self,
        story_path: &str,
        iteration: u32,
        verdict: QaVerdict,
    ) -> StoreResult<()> {
        let story_path = story_path.to_string();
        with_connection(&self.conn, move |conn| {
            let json = serde_json::to_string(&verdict)?;
            let now = format_timestamp(&Utc::now());
            let tx = conn.transaction()?;
            tx.execute(
                "INSERT INTO qa_reviews (story_path, iteration, gate, verdict, recorded_at)
                 VALUES (?1, ?2, ?3, ?4, ?5)",
                params![story_path, iteration, verdict.gate.as_str(), json, now],
            )?;
            tx.execute(
                "UPDATE stories SET qa_result = ?2, updated_at = ?3 WHERE story_path = ?1",
                params![story_path, json, now],
            )?;
            tx.commit()?;
            Ok(())
        })
        .await
    }
}

const STORY_COLUMNS: &str = "story_path, story_id, epic_path, phase, status, iteration, \
                             last_error, qa_result, created_at, updated_at";

struct StoryRow {
    story_path: String,
    story_id: String,
    epic_path: String,
    phase: String,
    status: String,
    iteration: u32,
    last_error: Option<String>,
    qa_result: Option<String>,
    created_at: String,
    updated_at: String,
}

fn read_story_row(row: &Row<'_>) -> rusqlite::Result<StoryRow> {
    Ok(StoryRow {
        story_path: row.get(0)?,
        story_id: row.get(1)?,
        epic_path: row.get(2)?,
        phase: row.get(3)?,
        status: row.get(4)?,
        iteration: row.get(5)?,
        last_error: row.get(6)?,
        qa_result: row.get(7)?,
        created_at: row.get(8)?,
        updated_at: row.get(9)?,
    })
}

fn decode_story(row: StoryRow) -> StoreResult<Story> {
    Ok(Story {
        story_path: row.story_path,
        story_id: row.story_id,
        epic_path: row.epic_path,
        phase: row.phase.parse().map_err(StoreError::InvalidRow)?,
        status: row.status.parse().map_err(StoreError::InvalidRow)?,
        iteration: row.iteration,
        last_error: row.last_error,
        qa_result: row
            .qa_result
            .as_deref()
            .map(serde_json::from_str)
            .transpose()?,
        created_at: parse_timestamp(&row.created_at)?,
        updated_at: parse_timestamp(&row.updated_at)?,
    })
}

fn load_story(conn: &Connection, story_path: &str) -> StoreResult<Option<Story>> {
    let row = conn
        .query_row(
            &format!("SELECT {STORY_COLUMNS} FROM stories WHERE story_path = ?1"),
            params![story_path],
            read_story_row,
        )
        .optional()?;
    row.map(decode_story).transpose()
}

fn format_timestamp(at: &DateTime<Utc>) -> String {
    at.to_rfc3339_opts(SecondsFormat::Nanos, true)
}

/// Parse a stored timestamp; rows migrated from older schemas carry an
/// empty string, which decodes to the epoch.
fn parse_timestamp(value: &str) -> StoreResult<DateTime<Utc>> {
    if value.is_empty() {
        return Ok(DateTime::<Utc>::default());
    }
    DateTime::parse_from_rfc3339(value)
        .map(|at| at.with_timezone(&Utc))
        .map_err(|err| StoreError::InvalidRow(format!("timestamp '{value}': {err}")))
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::story::{Phase, StoryStatus};
    use crate::tools::{Diagnostic, DiagnosticLevel};
    use crate::verdict::QaGate;
    use std::collections::BTreeMap;
    use tempfile::TempDir;

    fn open_store(temp_dir: &TempDir) -> StateStore {
        StateStore::open(
            temp_dir.path().join("progress.db"),
            temp_dir.path().join("backups"),
        )
        .unwrap()
    }

    fn verdict(gate: QaGate) -> QaVerdict {
        QaVerdict {
            gate,
            status_reason: "reason".into(),
            quality_score: 80,
            reviewer: "qa".into(),
            top_issues: Vec::new(),
            nfr_validation: BTreeMap::new(),
            recommendations: vec!["add tests".into()],
        }
    }

    #[tokio::test]
    async fn test_update_story_creates_and_merges() {
        let temp_dir = TempDir::new().unwrap();
        let store = open_store(&temp_dir);

        store
            .update_story(
                "s1.md",
                StoryUpdate::enter(Phase::Prep).with_identity("1", "epic.md"),
            )
            .await
            .unwrap();
        let story = store
            .update_story("s1.md", StoryUpdate::new().with_status(StoryStatus::Ok))
            .await
            .unwrap();

        assert_eq!(story.story_id, "1");
        assert_eq!(story.epic_path, "epic.md");
        assert_eq!(story.phase, Phase::Prep);
        assert_eq!(story.status, StoryStatus::Ok);

        let history = store.phase_history("s1.md").await.unwrap();
        assert_eq!(history.len(), 1);
        assert_eq!(history[0].phase, Phase::Prep);
        assert_eq!(history[0].status, StoryStatus::Running);
    }

    #[tokio::test]
    async fn test_story_round_trips_exactly() {
        let temp_dir = TempDir::new().unwrap();
        let store = open_store(&temp_dir);

        let written = store
            .update_story(
                "s1.md",
                StoryUpdate::enter(Phase::Qa)
                    .with_identity("1", "epic.md")
                    .with_iteration(2)
                    .with_error("tests failed")
                    .with_qa_result(verdict(QaGate::Concerns)),
            )
            .await
            .unwrap();
        drop(store);

        let reopened = open_store(&temp_dir);
        let loaded = reopened.get_story("s1.md").await.unwrap().unwrap();
        assert_eq!(loaded, written);
    }

    #[tokio::test]
    async fn test_records_require_existing_story() {
        let temp_dir = TempDir::new().unwrap();
        let store = open_store(&temp_dir);

        let orphan = QualityRecord::new("epic.md", "missing.md", "/src/a.py");
        assert!(store.upsert_quality_records(vec![orphan]).await.is_err());
    }

    #[tokio::test]
    async fn test_quality_records_upsert_by_id() {
        let temp_dir = TempDir::new().unwrap();
        let store = open_store(&temp_dir);
        store
            .update_story("s1.md", StoryUpdate::enter(Phase::Quality).with_identity("1", "epic.md"))
            .await
            .unwrap();

        let diagnostic = Diagnostic::new("/src/a.py", 3, "Import \"os\" could not be resolved")
            .with_level(DiagnosticLevel::Error)
            .with_rule("reportMissingImports");
        let first = QualityRecord::new("epic.md", "s1.md", "/src/a.py")
            .with_error_count(1)
            .with_fix_status(FixStatus::Pending)
            .with_type_check_errors(vec![diagnostic]);
        store.upsert_quality_records(vec![first]).await.unwrap();

        let second = QualityRecord::new("epic.md", "s1.md", "/src/a.py");
        store.upsert_quality_records(vec![second.clone()]).await.unwrap();

        let records = store.quality_records("s1.md").await.unwrap();
        assert_eq!(records, vec![second]);
    }

    #[tokio::test]
    async fn test_test_records_round_trip() {
        let temp_dir = TempDir::new().unwrap();
        let store = open_store(&temp_dir);
        store
            .update_story("s1.md", StoryUpdate::enter(Phase::TestAuto).with_identity("1", "e.md"))
            .await
            .unwrap();

        let record = TestPhaseRecord::new("e.md", "s1.md", "/tests/unit/test_a.py")
            .with_failure_count(2)
            .with_debug_notes("test_a::test_x - AssertionError");
        store.upsert_test_records(vec![record.clone()]).await.unwrap();

        assert_eq!(store.test_records("s1.md").await.unwrap(), vec![record]);
    }

    #[tokio::test]
    async fn test_qa_reviews_append_and_mirror() {
        let temp_dir = TempDir::new().unwrap();
        let store = open_store(&temp_dir);
        store
            .update_story("s1.md", StoryUpdate::enter(Phase::Qa).with_identity("1", "e.md"))
            .await
            .unwrap();

        store
            .record_qa_review("s1.md", 0, verdict(QaGate::Fail))
            .await
            .unwrap();
        store
            .record_qa_review("s1.md", 1, verdict(QaGate::Pass))
            .await
            .unwrap();

        let reviews = store.qa_reviews("s1.md").await.unwrap();
        assert_eq!(reviews.len(), 2);
        assert_eq!(reviews[0].gate, QaGate::Fail);
        assert_eq!(reviews[1].iteration, 1);

        let story = store.get_story("s1.md").await.unwrap().unwrap();
        assert_eq!(story.qa_result.unwrap().gate, QaGate::Pass);
    }

    #[tokio::test]
    async fn test_health_reports_lock_state() {
        let temp_dir = TempDir::new().unwrap();
        let store = open_store(&temp_dir);

        let health = store.get_health();
        assert!(health.store_exists);
        assert!(!health.lock_held);

        let lease = store.managed_operation().await.unwrap();
        assert!(store.get_health().lock_held);
        drop(lease);
        assert!(!store.get_health().lock_held);
    }

    #[tokio::test]
    async fn test_lock_timeout_when_lease_held() {
        let temp_dir = TempDir::new().unwrap();
        let store = open_store(&temp_dir).with_lock_timeout(Duration::from_millis(50));

        let _lease = store.managed_operation().await.unwrap();
        let err = store
            .update_story("s1.md", StoryUpdate::enter(Phase::Prep))
            .await
            .unwrap_err();
        assert!(matches!(err, StoreError::LockTimeout));
    }

    #[tokio::test]
    async fn test_lock_released_when_operation_cancelled() {
        let temp_dir = TempDir::new().unwrap();
        let store = open_store(&temp_dir);

        let lease = store.managed_operation().await.unwrap();
        let waiting = {
            let store = store.clone();
            tokio::spawn(async move { store.managed_operation().await.map(|_| ()) })
        };
        waiting.abort();
        let _ = waiting.await;
        drop(lease);

        assert!(!store.get_health().lock_held);
        assert!(store.managed_operation().await.is_ok());
    }
}
