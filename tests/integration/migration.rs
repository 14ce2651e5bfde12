//! Startup migration rollback.

use std::fs;
use std::path::Path;

use epic_driver::store::migrate::latest_backup;
use epic_driver::store::schema::CREATE_PHASE_HISTORY;
use epic_driver::store::{MigrationStep, Migrator, StateStore};
use epic_driver::DriverError;
use rusqlite::Connection;
use tempfile::TempDir;

/// A store written by an older release: only a narrow `stories` table.
pub fn write_old_store(path: &Path) {
    let conn = Connection::open(path).expect("Failed to create old store");
    conn.execute_batch(
        "CREATE TABLE stories (
            story_path TEXT PRIMARY KEY,
            epic_path TEXT NOT NULL,
            phase TEXT NOT NULL,
            status TEXT NOT NULL
        );
        INSERT INTO stories VALUES ('stories/001.md', 'epic.md', 'QA', 'RUNNING');",
    )
    .expect("Failed to write old schema");
}

#[test]
fn test_failed_migration_restores_pre_migration_bytes() {
    let temp_dir = TempDir::new().unwrap();
    let store_path = temp_dir.path().join("progress.db");
    let backup_dir = temp_dir.path().join("backups");
    write_old_store(&store_path);
    let original = fs::read(&store_path).unwrap();

    let migrator = Migrator::new(&backup_dir).with_steps(vec![
        MigrationStep::sql("create_phase_history", CREATE_PHASE_HISTORY),
        MigrationStep::sql("create_broken_table", "CREATE TABLE broken (id INTEGER,"),
    ]);
    let err = StateStore::open_with(&store_path, &migrator).unwrap_err();
    assert!(err.to_string().contains("create_broken_table"));
    assert_eq!(DriverError::Startup(err).exit_code(), 2);

    let backup = latest_backup(&store_path, &backup_dir)
        .unwrap()
        .expect("backup exists");
    assert_eq!(fs::read(&store_path).unwrap(), original);
    assert_eq!(fs::read(&backup).unwrap(), original);

    // The restored store still has only the old table.
    let conn = Connection::open(&store_path).unwrap();
    let tables: i64 = conn
        .query_row(
            "SELECT count(*) FROM sqlite_master WHERE type = 'table'",
            [],
            |row| row.get(0),
        )
        .unwrap();
    assert_eq!(tables, 1);
}

#[tokio::test]
async fn test_standard_migration_upgrades_old_store() {
    let temp_dir = TempDir::new().unwrap();
    let store_path = temp_dir.path().join("progress.db");
    write_old_store(&store_path);

    let store = StateStore::open(&store_path, temp_dir.path().join("backups")).unwrap();
    let story = store
        .get_story("stories/001.md")
        .await
        .unwrap()
        .expect("old row survives");
    assert_eq!(story.iteration, 0);
    assert!(story.qa_result.is_none());
    assert!(store.phase_history("stories/001.md").await.unwrap().is_empty());
}
