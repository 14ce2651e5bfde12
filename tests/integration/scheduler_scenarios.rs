//! Test batch discovery and scheduling over real directory trees.

use std::fs;
use std::sync::Arc;

use epic_driver::scheduler::{discover_batches, BatchStatus, SchedulerStatus, TestBatchScheduler};
use epic_driver::tools::{TestRunIntegrator, WorkerCount};
use tempfile::TempDir;

use crate::common::{output, ScriptedRunner};

fn tree(dirs: &[&str]) -> TempDir {
    let temp_dir = TempDir::new().expect("Failed to create temp dir");
    for dir in dirs {
        fs::create_dir_all(temp_dir.path().join(dir)).expect("Failed to create dir");
    }
    temp_dir
}

#[tokio::test]
async fn test_blocking_smoke_failure_halts_before_unit() {
    let root = tree(&["smoke_tests", "unit_tests"]);
    let runner = Arc::new(ScriptedRunner::new(|spec| {
        if spec.args[0].ends_with("smoke_tests") {
            Ok(output(1, "1 failed, 2 passed in 0.30s"))
        } else {
            Ok(output(0, "10 passed in 0.50s"))
        }
    }));
    let scheduler = TestBatchScheduler::new(TestRunIntegrator::new(runner.clone(), "pytest"), root.path());

    let result = scheduler.run().await.expect("discovery succeeds");
    assert_eq!(result.status, SchedulerStatus::Failed);
    assert_eq!(result.failed_batches, vec!["smoke_tests".to_string()]);
    assert_eq!(result.halted_by.as_deref(), Some("smoke_tests"));
    assert_eq!(result.executed().count(), 1);
    assert_eq!(result.skipped_batches, vec!["unit_tests".to_string()]);
    assert_eq!(runner.calls().len(), 1);
}

#[test]
fn test_unknown_directory_gets_default_rule() {
    let root = tree(&["my_custom"]);
    let batches = discover_batches(root.path()).expect("discovery succeeds");
    assert_eq!(batches.len(), 1);
    let batch = &batches[0];
    assert_eq!(batch.name, "my_custom");
    assert_eq!(batch.timeout_secs, 120);
    assert!(batch.is_parallel());
    assert_eq!(batch.workers, Some(WorkerCount::Auto));
    assert!(batch.blocking);
    assert_eq!(batch.priority, 3);
}

#[tokio::test]
async fn test_batches_execute_in_priority_order() {
    let root = tree(&["e2e", "integration", "unit", "smoke"]);
    fs::write(root.path().join("test_loose.py"), "def test_x():\n    pass\n").unwrap();
    let runner = Arc::new(ScriptedRunner::new(|_| Ok(output(0, "1 passed in 0.01s"))));
    let scheduler = TestBatchScheduler::new(TestRunIntegrator::new(runner, "pytest"), root.path());

    let result = scheduler.run().await.unwrap();
    assert!(result.is_completed());
    let priorities: Vec<u8> = result.executed().map(|b| b.priority).collect();
    assert!(priorities.windows(2).all(|w| w[0] <= w[1]), "{priorities:?}");
    assert_eq!(result.batches[0].name, "smoke");
    assert!(result.batches.iter().any(|b| b.name == "loose_tests"));
    assert!(result.batches.iter().all(|b| b.status == BatchStatus::Passed));
}

#[tokio::test]
async fn test_non_blocking_failure_keeps_going() {
    let root = tree(&["unit", "e2e"]);
    let runner = Arc::new(ScriptedRunner::new(|spec| {
        if spec.args[0].ends_with("e2e") {
            Ok(output(1, "2 failed in 9.00s"))
        } else {
            Ok(output(0, "4 passed in 0.20s"))
        }
    }));
    let scheduler = TestBatchScheduler::new(TestRunIntegrator::new(runner.clone(), "pytest"), root.path());

    let result = scheduler.run().await.unwrap();
    assert_eq!(result.status, SchedulerStatus::Failed);
    assert!(result.halted_by.is_none());
    assert_eq!(result.failed_batches, vec!["e2e".to_string()]);
    assert_eq!(runner.calls().len(), 2);
    assert_eq!(result.failing_tests(), 2);
}
