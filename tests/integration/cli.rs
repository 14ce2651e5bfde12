//! End-to-end runs of the `epic-driver` binary.

use std::fs;

use assert_cmd::Command;
use predicates::prelude::*;
use rusqlite::Connection;
use tempfile::TempDir;

use crate::common::Project;
use crate::migration::write_old_store;

#[allow(deprecated)]
fn driver_cmd() -> Command {
    Command::cargo_bin("epic-driver").expect("Failed to find epic-driver binary")
}

fn driver_in(project: &Project) -> Command {
    let mut cmd = driver_cmd();
    cmd.current_dir(project.path())
        .env("EPIC_DRIVER_DB", project.store_path())
        .env_remove("RUST_LOG");
    cmd
}

#[test]
fn test_help_lists_phase_flags() {
    driver_cmd()
        .arg("--help")
        .assert()
        .success()
        .stdout(predicate::str::contains("--skip-quality"))
        .stdout(predicate::str::contains("--max-iterations"))
        .stdout(predicate::str::contains("--no-retry"));
}

#[test]
fn test_skip_both_completes_epic() {
    let project = Project::new(&["001", "002"]);

    driver_in(&project)
        .arg(&project.epic)
        .args(["--skip-quality", "--skip-tests"])
        .assert()
        .success()
        .stdout(predicate::str::contains("001"))
        .stdout(predicate::str::contains("DONE"))
        .stdout(predicate::str::contains("2 stories: 2 done, 0 failed"));

    let conn = Connection::open(project.store_path()).expect("Failed to open store");
    let done: i64 = conn
        .query_row(
            "SELECT count(*) FROM stories WHERE phase = 'DONE' AND status = 'OK'",
            [],
            |row| row.get(0),
        )
        .expect("Failed to count stories");
    assert_eq!(done, 2);
}

#[test]
fn test_second_run_skips_done_stories() {
    let project = Project::new(&["001"]);
    let run = || {
        driver_in(&project)
            .arg(&project.epic)
            .args(["--skip-quality", "--skip-tests"])
            .assert()
            .success()
    };

    run();
    run().stdout(predicate::str::contains("already done"));
}

#[test]
fn test_missing_epic_exits_with_config_error() {
    let project = Project::new(&["001"]);

    driver_in(&project)
        .arg("no-such-epic.md")
        .assert()
        .code(2)
        .stderr(predicate::str::contains("epic document not found"));
    assert!(!project.store_path().exists());
}

#[test]
fn test_epic_without_stories_section_exits_with_config_error() {
    let project = Project::new(&["001"]);
    fs::write(&project.epic, "# Epic 1: Nothing here\n\nJust prose.\n").unwrap();

    driver_in(&project)
        .arg(&project.epic)
        .args(["--skip-quality", "--skip-tests"])
        .assert()
        .code(2)
        .stderr(predicate::str::contains("Stories"));
}

#[test]
fn test_missing_source_dir_exits_with_config_error() {
    let project = Project::new(&["001"]);

    driver_in(&project)
        .arg(&project.epic)
        .args(["--source-dir", "lib"])
        .assert()
        .code(2)
        .stderr(predicate::str::contains("source directory not found"));
}

#[test]
fn test_corrupt_store_exits_with_config_error() {
    let project = Project::new(&["001"]);
    let garbage = b"this is not a sqlite database, not even close".repeat(4);
    fs::write(project.store_path(), &garbage).unwrap();

    driver_in(&project)
        .arg(&project.epic)
        .args(["--skip-quality", "--skip-tests"])
        .assert()
        .code(2);
    assert_eq!(fs::read(project.store_path()).unwrap(), garbage);
}

#[test]
fn test_failed_migration_leaves_store_untouched() {
    let project = Project::new(&["001"]);
    write_old_store(&project.store_path());
    // An old qa_reviews table without story_path breaks the index step.
    let conn = Connection::open(project.store_path()).unwrap();
    conn.execute_batch("CREATE TABLE qa_reviews (id INTEGER PRIMARY KEY, gate TEXT);")
        .unwrap();
    drop(conn);
    let original = fs::read(project.store_path()).unwrap();

    driver_in(&project)
        .arg(&project.epic)
        .args(["--skip-quality", "--skip-tests"])
        .assert()
        .code(2)
        .stderr(predicate::str::contains("create_indexes"));

    assert_eq!(fs::read(project.store_path()).unwrap(), original);
    assert!(project.path().join("backups").is_dir());
}

#[test]
fn test_store_env_var_selects_store_location() {
    let project = Project::new(&["001"]);
    let elsewhere = TempDir::new().unwrap();
    let store = elsewhere.path().join("nested/state.db");

    driver_cmd()
        .current_dir(project.path())
        .env("EPIC_DRIVER_DB", &store)
        .arg(&project.epic)
        .args(["--skip-quality", "--skip-tests"])
        .assert()
        .success();

    assert!(store.is_file());
    assert!(!project.store_path().exists());
}
