//! Startup schema migration with backup and rollback.
//!
//! The procedure is:
//! 1. copy an existing store to `backups/<file>.<timestamp>`,
//! 2. verify the copy opens read-only and lists at least one table,
//! 3. apply every [`MigrationStep`] inside one transaction,
//! 4. on failure, restore the store from the most recent backup (or remove
//!    the file if it did not exist before),
//! 5. on success, prune all but the newest backups.
//!
//! The store is kept in rollback-journal mode so that a restored file is
//! byte-identical to its backup.

use std::ffi::OsString;
use std::fs;
use std::io;
use std::path::{Path, PathBuf};

use chrono::Utc;
use rusqlite::{Connection, OpenFlags};
use tracing::{debug, info, warn};

use super::schema;
use super::{StoreError, StoreResult};

/// One idempotent schema change.
#[derive(Debug, Clone, PartialEq, Eq)]
pub enum MigrationStep {
    /// Statements executed as a batch; must use `IF NOT EXISTS` semantics.
    Sql {
        name: &'static str,
        sql: &'static str,
    },
    /// `ALTER TABLE .. ADD COLUMN`, skipped when the column already exists.
    AddColumn {
        table: &'static str,
        column: &'static str,
        definition: &'static str,
    },
}

impl MigrationStep {
    pub fn sql(name: &'static str, sql: &'static str) -> Self {
        MigrationStep::Sql { name, sql }
    }

    pub fn add_column(table: &'static str, column: &'static str, definition: &'static str) -> Self {
        MigrationStep::AddColumn {
            table,
            column,
            definition,
        }
    }

    pub fn name(&self) -> String {
        match self {
            MigrationStep::Sql { name, .. } => (*name).to_string(),
            MigrationStep::AddColumn { table, column, .. } => format!("add_{table}_{column}"),
        }
    }

    fn apply(&self, conn: &Connection) -> rusqlite::Result<()> {
        match self {
            MigrationStep::Sql { sql, .. } => conn.execute_batch(sql),
            MigrationStep::AddColumn {
                table,
                column,
                definition,
            } => {
                if column_exists(conn, table, column)? {
                    return Ok(());
                }
                conn.execute_batch(&format!(
                    "ALTER TABLE {table} ADD COLUMN {column} {definition};"
                ))
            }
        }
    }
}

fn column_exists(conn: &Connection, table: &str, column: &str) -> rusqlite::Result<bool> {
    let mut stmt = conn.prepare(&format!("PRAGMA table_info({table})"))?;
    let names = stmt.query_map([], |row| row.get::<_, String>(1))?;
    for name in names {
        if name? == column {
            return Ok(true);
        }
    }
    Ok(false)
}

/// Backups kept per store after a successful migration.
pub const DEFAULT_BACKUP_RETENTION: usize = 5;

/// Runs the migration procedure for one store file.
#[derive(Debug, Clone)]
pub struct Migrator {
    backup_dir: PathBuf,
    steps: Vec<MigrationStep>,
}

impl Migrator {
    /// Migrator applying the standard schema, backing up into `backup_dir`.
    pub fn new(backup_dir: impl Into<PathBuf>) -> Self {
        Self {
            backup_dir: backup_dir.into(),
            steps: schema::migration_steps(),
        }
    }

    /// Replace the step list.
    pub fn with_steps(mut self, steps: Vec<MigrationStep>) -> Self {
        self.steps = steps;
        self
    }

    pub fn backup_dir(&self) -> &Path {
        &self.backup_dir
    }

    /// Migrate the store at `store_path` and return an open connection.
    pub fn run(&self, store_path: &Path) -> StoreResult<Connection> {
        let pre_existing = fs::metadata(store_path)
            .map(|meta| meta.len() > 0)
            .unwrap_or(false);

        if pre_existing {
            let backup = create_backup(store_path, &self.backup_dir)?;
            verify_backup(&backup)?;
            info!(backup = %backup.display(), "store backed up before migration");
        }

        match self.apply(store_path) {
            Ok(conn) => {
                debug!(steps = self.steps.len(), "store migration complete");
                if pre_existing {
                    match prune_backups(store_path, &self.backup_dir, DEFAULT_BACKUP_RETENTION) {
                        Ok(0) => {}
                        Ok(removed) => debug!(removed, "old store backups pruned"),
                        Err(err) => warn!(error = %err, "failed to prune old store backups"),
                    }
                }
                Ok(conn)
            }
            Err(err) => {
                warn!(error = %err, "store migration failed, rolling back");
                if pre_existing {
                    let restored = restore_latest_backup(store_path, &self.backup_dir)?;
                    warn!(backup = %restored.display(), "store restored from backup");
                } else {
                    remove_store_files(store_path)?;
                }
                Err(err)
            }
        }
    }

    fn apply(&self, store_path: &Path) -> StoreResult<Connection> {
        if let Some(parent) = store_path.parent() {
            if !parent.as_os_str().is_empty() {
                fs::create_dir_all(parent)?;
            }
        }

        let mut conn = Connection::open(store_path)?;
        conn.execute_batch("PRAGMA foreign_keys = ON;")?;

        let tx = conn.transaction()?;
        for step in &self.steps {
            step.apply(&tx).map_err(|source| StoreError::Migration {
                step: step.name(),
                source,
            })?;
        }
        tx.commit()?;
        Ok(conn)
    }
}

/// Copy the store into `backup_dir` with a timestamp suffix.
pub fn create_backup(store_path: &Path, backup_dir: &Path) -> StoreResult<PathBuf> {
    fs::create_dir_all(backup_dir)?;
    let stamp = Utc::now().format("%Y%m%dT%H%M%S%.6fZ");
    let backup = backup_dir.join(format!("{}.{}", store_file_name(store_path), stamp));
    fs::copy(store_path, &backup)?;
    Ok(backup)
}

/// Check that a backup opens read-only and enumerates at least one table.
pub fn verify_backup(backup: &Path) -> StoreResult<()> {
    let verification_error = |reason: String| StoreError::BackupVerification {
        path: backup.to_path_buf(),
        reason,
    };

    let conn = Connection::open_with_flags(backup, OpenFlags::SQLITE_OPEN_READ_ONLY)
        .map_err(|err| verification_error(err.to_string()))?;
    let tables: i64 = conn
        .query_row(
            "SELECT count(*) FROM sqlite_master WHERE type = 'table'",
            [],
            |row| row.get(0),
        )
        .map_err(|err| verification_error(err.to_string()))?;

    if tables < 1 {
        return Err(verification_error("backup contains no tables".to_string()));
    }
    Ok(())
}

/// Backups of `store_path` in `backup_dir`, oldest first.
pub fn list_backups(store_path: &Path, backup_dir: &Path) -> StoreResult<Vec<PathBuf>> {
    let prefix = format!("{}.", store_file_name(store_path));
    let entries = match fs::read_dir(backup_dir) {
        Ok(entries) => entries,
        Err(err) if err.kind() == io::ErrorKind::NotFound => return Ok(Vec::new()),
        Err(err) => return Err(err.into()),
    };

    let mut backups = Vec::new();
    for entry in entries {
        let entry = entry?;
        let name = entry.file_name().to_string_lossy().into_owned();
        if name.starts_with(&prefix) {
            backups.push((name, entry.path()));
        }
    }
    // Timestamp suffixes sort lexicographically.
    backups.sort();
    Ok(backups.into_iter().map(|(_, path)| path).collect())
}

/// Most recent backup of `store_path` in `backup_dir`, if any.
pub fn latest_backup(store_path: &Path, backup_dir: &Path) -> StoreResult<Option<PathBuf>> {
    Ok(list_backups(store_path, backup_dir)?.pop())
}

/// Delete all but the newest `keep` backups; returns how many were removed.
pub fn prune_backups(store_path: &Path, backup_dir: &Path, keep: usize) -> StoreResult<usize> {
    let backups = list_backups(store_path, backup_dir)?;
    let excess = backups.len().saturating_sub(keep);
    for backup in &backups[..excess] {
        remove_if_exists(backup)?;
    }
    Ok(excess)
}

fn restore_latest_backup(store_path: &Path, backup_dir: &Path) -> StoreResult<PathBuf> {
    let backup = latest_backup(store_path, backup_dir)?.ok_or_else(|| {
        StoreError::BackupVerification {
            path: backup_dir.to_path_buf(),
            reason: "no backup available to restore".to_string(),
        }
    })?;
    fs::copy(&backup, store_path)?;
    remove_if_exists(&journal_path(store_path))?;
    Ok(backup)
}

fn remove_store_files(store_path: &Path) -> StoreResult<()> {
    remove_if_exists(store_path)?;
    remove_if_exists(&journal_path(store_path))?;
    Ok(())
}

fn remove_if_exists(path: &Path) -> io::Result<()> {
    match fs::remove_file(path) {
        Err(err) if err.kind() != io::ErrorKind::NotFound => Err(err),
        _ => Ok(()),
    }
}

fn journal_path(store_path: &Path) -> PathBuf {
    let mut name = OsString::from(store_path.as_os_str());
    name.push("-journal");
    PathBuf::from(name)
}

fn store_file_name(store_path: &Path) -> String {
    store_path
        .file_name()
        .map(|name| name.to_string_lossy().into_owned())
        .unwrap_or_else(|| "store".to_string())
}

#[cfg(test)]
mod tests {
    use super::*;
    use tempfile::TempDir;

    fn table_names(conn: &Connection) -> Vec<String> {
        let mut stmt = conn
            .prepare("SELECT name FROM sqlite_master WHERE type = 'table' ORDER BY name")
            .unwrap();
        let rows = stmt.query_map([], |row| row.get::<_, String>(0)).unwrap();
        rows.map(|row| row.unwrap()).collect()
    }

    fn write_old_schema(path: &Path) {
        let conn = Connection::open(path).unwrap();
        conn.execute_batch(
            "CREATE TABLE stories (
                story_path TEXT PRIMARY KEY,
                epic_path TEXT NOT NULL,
                phase TEXT NOT NULL,
                status TEXT NOT NULL
            );
            INSERT INTO stories VALUES ('s1.md', 'epic.md', 'IMPL', 'RUNNING');",
        )
        .unwrap();
    }

    #[test]
    fn test_fresh_store_gets_all_tables() {
        let temp_dir = TempDir::new().unwrap();
        let store = temp_dir.path().join("progress.db");
        let migrator = Migrator::new(temp_dir.path().join("backups"));

        let conn = migrator.run(&store).unwrap();
        let tables = table_names(&conn);
        for table in schema::TABLES {
            assert!(tables.contains(&table.to_string()), "missing {table}");
        }
        // No backup for a store that did not exist.
        assert!(latest_backup(&store, migrator.backup_dir()).unwrap().is_none());
    }

    #[test]
    fn test_migration_is_rerunnable() {
        let temp_dir = TempDir::new().unwrap();
        let store = temp_dir.path().join("progress.db");
        let migrator = Migrator::new(temp_dir.path().join("backups"));

        let first = table_names(&migrator.run(&store).unwrap());
        let second = table_names(&migrator.run(&store).unwrap());
        assert_eq!(first, second);
        assert!(latest_backup(&store, migrator.backup_dir()).unwrap().is_some());
    }

    #[test]
    fn test_old_schema_gains_columns_and_keeps_rows() {
        let temp_dir = TempDir::new().unwrap();
        let store = temp_dir.path().join("progress.db");
        write_old_schema(&store);

        let conn = Migrator::new(temp_dir.path().join("backups"))
            .run(&store)
            .unwrap();
        assert!(column_exists(&conn, "stories", "iteration").unwrap());
        assert!(column_exists(&conn, "stories", "qa_result").unwrap());
        let (phase, iteration): (String, i64) = conn
            .query_row(
                "SELECT phase, iteration FROM stories WHERE story_path = 's1.md'",
                [],
                |row| Ok((row.get(0)?, row.get(1)?)),
            )
            .unwrap();
        assert_eq!(phase, "IMPL");
        assert_eq!(iteration, 0);
    }

    #[test]
    fn test_failed_step_restores_store_byte_for_byte() {
        let temp_dir = TempDir::new().unwrap();
        let store = temp_dir.path().join("progress.db");
        write_old_schema(&store);
        let before = fs::read(&store).unwrap();

        let mut steps = schema::migration_steps();
        steps.push(MigrationStep::sql(
            "broken_table",
            "CREATE TABLE IF NOT EXISTS broken (id INTEGER PRIMARY KEY,, oops);",
        ));
        let migrator = Migrator::new(temp_dir.path().join("backups")).with_steps(steps);

        let err = migrator.run(&store).unwrap_err();
        assert!(matches!(err, StoreError::Migration { ref step, .. } if step == "broken_table"));

        let after = fs::read(&store).unwrap();
        assert_eq!(before, after);
        let backup = latest_backup(&store, migrator.backup_dir())
            .unwrap()
            .expect("backup");
        assert_eq!(fs::read(backup).unwrap(), before);
        assert!(!journal_path(&store).exists());
    }

    #[test]
    fn test_failed_step_on_fresh_store_removes_file() {
        let temp_dir = TempDir::new().unwrap();
        let store = temp_dir.path().join("progress.db");
        let migrator = Migrator::new(temp_dir.path().join("backups"))
            .with_steps(vec![MigrationStep::sql("bad", "NOT SQL AT ALL")]);

        assert!(migrator.run(&store).is_err());
        assert!(!store.exists());
    }

    #[test]
    fn test_corrupt_store_fails_verification_and_is_untouched() {
        let temp_dir = TempDir::new().unwrap();
        let store = temp_dir.path().join("progress.db");
        fs::write(&store, b"this is not a database file at all").unwrap();

        let err = Migrator::new(temp_dir.path().join("backups"))
            .run(&store)
            .unwrap_err();
        assert!(matches!(err, StoreError::BackupVerification { .. }));
        assert_eq!(
            fs::read(&store).unwrap(),
            b"this is not a database file at all".to_vec()
        );
    }

    #[test]
    fn test_latest_backup_picks_newest_suffix() {
        let temp_dir = TempDir::new().unwrap();
        let backups = temp_dir.path().join("backups");
        fs::create_dir_all(&backups).unwrap();
        fs::write(backups.join("progress.db.20240101T000000.000000Z"), b"a").unwrap();
        fs::write(backups.join("progress.db.20250101T000000.000000Z"), b"b").unwrap();
        fs::write(backups.join("other.db.20990101T000000.000000Z"), b"c").unwrap();

        let latest = latest_backup(Path::new("progress.db"), &backups)
            .unwrap()
            .unwrap();
        assert!(latest.ends_with("progress.db.20250101T000000.000000Z"));
    }

    #[test]
    fn test_successful_migration_keeps_newest_backups() {
        let temp_dir = TempDir::new().unwrap();
        let store = temp_dir.path().join("progress.db");
        let backups = temp_dir.path().join("backups");
        fs::create_dir_all(&backups).unwrap();
        for year in 2018..2025 {
            fs::write(backups.join(format!("progress.db.{year}0101T000000.000000Z")), b"old").unwrap();
        }
        fs::write(backups.join("other.db.20180101T000000.000000Z"), b"other").unwrap();
        write_old_schema(&store);

        Migrator::new(&backups).run(&store).unwrap();

        let kept = list_backups(&store, &backups).unwrap();
        assert_eq!(kept.len(), DEFAULT_BACKUP_RETENTION);
        assert!(!backups.join("progress.db.20180101T000000.000000Z").exists());
        assert!(!backups.join("progress.db.20200101T000000.000000Z").exists());
        assert!(backups.join("progress.db.20210101T000000.000000Z").exists());
        assert!(backups.join("other.db.20180101T000000.000000Z").exists());
        // The backup taken by this run is the newest and survives.
        verify_backup(kept.last().unwrap()).unwrap();
    }

    #[test]
    fn test_prune_backups_respects_keep() {
        let temp_dir = TempDir::new().unwrap();
        let backups = temp_dir.path().join("backups");
        fs::create_dir_all(&backups).unwrap();
        for day in 1..=3 {
            fs::write(backups.join(format!("progress.db.202401{day:02}T000000.000000Z")), b"x").unwrap();
        }

        let store = Path::new("progress.db");
        assert_eq!(prune_backups(store, &backups, 5).unwrap(), 0);
        assert_eq!(prune_backups(store, &backups, 1).unwrap(), 2);
        let left = list_backups(store, &backups).unwrap();
        assert_eq!(left.len(), 1);
        assert!(left[0].ends_with("progress.db.20240103T000000.000000Z"));
    }
}
