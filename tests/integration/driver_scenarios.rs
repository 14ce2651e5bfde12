//! Whole-epic runs through the library API.

use std::fs;
use std::sync::Arc;

use epic_driver::agents::{AgentSet, READY_STATUS};
use epic_driver::epic::load_epic;
use epic_driver::story::{Phase, StoryStatus};
use epic_driver::verdict::QaGate;
use epic_driver::{Driver, DriverConfig};

use crate::common::{Project, ScriptedQa, ScriptedRunner};

fn config(project: &Project) -> DriverConfig {
    DriverConfig::new(&project.epic)
        .with_source_dir(project.source_dir())
        .with_test_dir(project.test_dir())
        .with_store_path(project.store_path())
}

fn phases(history: &[epic_driver::store::PhaseHistoryEntry]) -> Vec<Phase> {
    history.iter().map(|entry| entry.phase).collect()
}

#[tokio::test]
async fn test_happy_path_all_stories_done() {
    let project = Project::new(&["001", "002"]);
    let config = config(&project);
    config.validate().expect("valid config");
    let epic = load_epic(&project.epic).expect("epic parses");
    let store = project.open_store();
    let runner = Arc::new(ScriptedRunner::healthy());
    let agents = AgentSet::standard(&config, runner.clone());

    let report = Driver::new(config, store.clone(), agents).run(&epic).await;
    assert_eq!(report.exit_code(), 0, "{}", report.render(false));

    for id in ["001", "002"] {
        let key = project.story_key(id);
        let story = store.get_story(&key).await.unwrap().expect("story row");
        assert_eq!(story.phase, Phase::Done);
        assert_eq!(story.status, StoryStatus::Ok);
        assert_eq!(story.iteration, 0);
        assert_eq!(story.story_id, id);
        assert_eq!(story.qa_result.expect("verdict").gate, QaGate::Pass);

        let history = store.phase_history(&key).await.unwrap();
        assert_eq!(
            phases(&history),
            vec![Phase::Prep, Phase::Impl, Phase::Quality, Phase::TestAuto, Phase::Qa, Phase::Done]
        );
        let content = fs::read_to_string(project.path().join(format!("stories/{id}.md"))).unwrap();
        assert!(content.contains(READY_STATUS));
    }

    let calls = runner.calls();
    assert!(calls.iter().any(|c| c.program == "pyright"));
    assert!(calls.iter().any(|c| c.program == "ruff"));
    assert!(calls.iter().any(|c| c.program == "pytest"));
}

#[tokio::test]
async fn test_skip_both_runs_prep_impl_qa_only() {
    let project = Project::new(&["001", "002"]);
    let config = config(&project).with_skip_quality(true).with_skip_tests(true);
    let epic = load_epic(&project.epic).unwrap();
    let store = project.open_store();
    let runner = Arc::new(ScriptedRunner::healthy());
    let agents = AgentSet::standard(&config, runner.clone());

    let report = Driver::new(config, store.clone(), agents).run(&epic).await;
    assert_eq!(report.exit_code(), 0);
    assert!(runner.calls().is_empty());

    for id in ["001", "002"] {
        let key = project.story_key(id);
        let history = store.phase_history(&key).await.unwrap();
        assert_eq!(phases(&history), vec![Phase::Prep, Phase::Impl, Phase::Qa, Phase::Done]);
        assert!(store.quality_records(&key).await.unwrap().is_empty());
        assert!(store.test_records(&key).await.unwrap().is_empty());
    }
}

#[tokio::test]
async fn test_qa_fail_without_retry() {
    let project = Project::new(&["001"]);
    let config = config(&project)
        .with_skip_quality(true)
        .with_skip_tests(true)
        .with_retry(false);
    let epic = load_epic(&project.epic).unwrap();
    let store = project.open_store();
    let agents = AgentSet::standard(&config, Arc::new(ScriptedRunner::healthy()))
        .with_agent(Arc::new(ScriptedQa::new(&[QaGate::Fail])));

    let report = Driver::new(config, store.clone(), agents).run(&epic).await;
    assert_eq!(report.exit_code(), 1);

    let key = project.story_key("001");
    let story = store.get_story(&key).await.unwrap().unwrap();
    assert_eq!(story.phase, Phase::Failed);
    assert_eq!(story.status, StoryStatus::Failed);
    assert_eq!(story.iteration, 0);
    assert_eq!(story.qa_result.unwrap().gate, QaGate::Fail);
    assert_eq!(store.qa_reviews(&key).await.unwrap().len(), 1);
}

#[tokio::test]
async fn test_qa_fail_then_pass_with_retry() {
    let project = Project::new(&["001"]);
    let config = config(&project)
        .with_skip_quality(true)
        .with_skip_tests(true)
        .with_retry(true)
        .with_max_iterations(3);
    let epic = load_epic(&project.epic).unwrap();
    let store = project.open_store();
    let agents = AgentSet::standard(&config, Arc::new(ScriptedRunner::healthy()))
        .with_agent(Arc::new(ScriptedQa::new(&[QaGate::Fail, QaGate::Pass])));

    let report = Driver::new(config, store.clone(), agents).run(&epic).await;
    assert_eq!(report.exit_code(), 0);

    let key = project.story_key("001");
    let story = store.get_story(&key).await.unwrap().unwrap();
    assert_eq!(story.phase, Phase::Done);
    assert_eq!(story.status, StoryStatus::Ok);
    assert_eq!(story.iteration, 1);

    let reviews = store.qa_reviews(&key).await.unwrap();
    assert_eq!(reviews.len(), 2);
    assert_eq!(
        reviews.iter().map(|r| (r.iteration, r.gate)).collect::<Vec<_>>(),
        vec![(0, QaGate::Fail), (1, QaGate::Pass)]
    );
}

#[tokio::test]
async fn test_blocking_test_failure_retries_then_fails() {
    let project = Project::new(&["001"]);
    fs::create_dir_all(project.path().join("tests/smoke_tests")).unwrap();
    let config = config(&project).with_max_iterations(2);
    let epic = load_epic(&project.epic).unwrap();
    let store = project.open_store();
    let runner = Arc::new(ScriptedRunner::new(|spec| {
        let stdout = match spec.program.as_str() {
            "pyright" => r#"{"generalDiagnostics": []}"#,
            "ruff" => "[]",
            _ if spec.args[0].ends_with("smoke_tests") => "1 failed in 0.20s",
            _ => "3 passed in 0.10s",
        };
        let code = if stdout.contains("failed") { 1 } else { 0 };
        Ok(crate::common::output(code, stdout))
    }));
    let agents = AgentSet::standard(&config, runner.clone());

    let report = Driver::new(config, store.clone(), agents).run(&epic).await;
    assert_eq!(report.exit_code(), 1);

    let key = project.story_key("001");
    let story = store.get_story(&key).await.unwrap().unwrap();
    assert_eq!(story.phase, Phase::Failed);
    assert_eq!(story.iteration, 1);
    assert!(story.last_error.unwrap().contains("smoke_tests"));

    // The unit batch never ran: smoke tests block it.
    let pytest_targets: Vec<String> = runner
        .calls()
        .into_iter()
        .filter(|c| c.program == "pytest")
        .map(|c| c.args[0].clone())
        .collect();
    assert_eq!(pytest_targets.len(), 2);
    assert!(pytest_targets.iter().all(|t| t.ends_with("smoke_tests")));
}

#[tokio::test]
async fn test_stories_processed_in_epic_order() {
    let project = Project::new(&["003", "001", "002"]);
    let config = config(&project).with_skip_quality(true).with_skip_tests(true);
    let epic = load_epic(&project.epic).unwrap();
    let agents = AgentSet::standard(&config, Arc::new(ScriptedRunner::healthy()));

    let report = Driver::new(config, project.open_store(), agents).run(&epic).await;
    let order: Vec<&str> = report.stories.iter().map(|s| s.story_id.as_str()).collect();
    assert_eq!(order, vec!["003", "001", "002"]);
}
