//! Watch coordinator tests: file changes trigger exactly the bound tasks.

use std::sync::{Arc, Mutex};
use std::time::Duration;
use tokio_util::sync::CancellationToken;

use kiln::core::RunScope;
use kiln::orchestration::WatchCoordinator;

use crate::fixtures::{config, record, SchedulerHarness, TestProject};

fn style_project() -> SchedulerHarness {
    let tasks = vec![record("style"), record("script"), record("markup")];
    let config = config(
        tasks,
        &[("*.style", &["style"]), ("src/**/*.js", &["script"])],
    );
    SchedulerHarness::with_project(TestProject::new(), config, 4)
}

/// Given a binding `*.style -> [style]`
/// When foo.style changes
/// Then exactly one run of style happens and no other task runs
#[tokio::test]
async fn test_change_runs_only_bound_task() {
    let harness = style_project();
    let coordinator =
        WatchCoordinator::from_config(&harness.pipeline.config, &harness.pipeline.graph).unwrap();

    let changed = harness.project.write("foo.style", "a { }");
    let request = coordinator.on_file_event(&changed).unwrap();
    assert_eq!(request.scope, RunScope::Exact(vec!["style".into()]));

    let result = harness.scheduler.run(&request).await.unwrap();

    assert!(result.success());
    assert_eq!(result.reports.len(), 1);
    assert_eq!(harness.recorder.count("style"), 1);
    assert_eq!(harness.recorder.count("script"), 0);
    assert_eq!(harness.recorder.count("markup"), 0);
}

/// Given bindings for two tasks
/// When a batch touches files of both plus an unbound file
/// Then one run covers the union of the bound tasks
#[tokio::test]
async fn test_batch_coalesces_into_one_run() {
    let harness = style_project();
    let coordinator =
        WatchCoordinator::from_config(&harness.pipeline.config, &harness.pipeline.graph).unwrap();

    let request = coordinator
        .request_for([
            harness.root().join("a.style"),
            harness.root().join("b.style"),
            harness.root().join("src/app/main.js"),
            harness.root().join("notes.txt"),
        ])
        .unwrap();
    assert_eq!(
        request.scope,
        RunScope::Exact(vec!["script".into(), "style".into()])
    );

    harness.scheduler.run(&request).await.unwrap();
    assert_eq!(harness.recorder.count("style"), 1);
    assert_eq!(harness.recorder.count("script"), 1);
    assert_eq!(harness.recorder.count("markup"), 0);
}

/// Given a running watcher
/// When a bound file is written
/// Then the bound task re-runs and the watcher stops on cancellation
#[tokio::test(flavor = "multi_thread", worker_threads = 2)]
async fn test_watcher_reacts_to_file_changes() {
    let harness = style_project();
    let coordinator =
        WatchCoordinator::from_config(&harness.pipeline.config, &harness.pipeline.graph).unwrap();
    let cancel = CancellationToken::new();
    let runs: Arc<Mutex<Vec<Vec<String>>>> = Arc::new(Mutex::new(Vec::new()));

    let seen = runs.clone();
    let watcher = tokio::spawn(coordinator.run(
        harness.scheduler.clone(),
        cancel.clone(),
        move |result| {
            let names = result.reports.iter().map(|r| r.name.to_string()).collect();
            seen.lock().unwrap().push(names);
        },
    ));

    // Give the backend a moment to register the watch.
    tokio::time::sleep(Duration::from_millis(300)).await;
    harness.project.write("foo.style", "a { }");

    let deadline = tokio::time::Instant::now() + Duration::from_secs(10);
    while runs.lock().unwrap().is_empty() && tokio::time::Instant::now() < deadline {
        tokio::time::sleep(Duration::from_millis(50)).await;
    }

    cancel.cancel();
    tokio::time::timeout(Duration::from_secs(5), watcher)
        .await
        .expect("watcher should stop after cancellation")
        .unwrap()
        .unwrap();

    let runs = runs.lock().unwrap();
    assert!(!runs.is_empty(), "a change should trigger a run");
    assert!(runs.iter().all(|run| run == &vec!["style".to_string()]));
    assert_eq!(harness.recorder.count("script"), 0);
}

/// Given bindings whose roots do not exist
/// When the watcher starts
/// Then it fails with a watch error
#[tokio::test]
async fn test_watcher_fails_when_no_root_is_watchable() {
    let tasks = vec![record("style")];
    let config = config(tasks, &[("missing/*.style", &["style"])]);
    let harness = SchedulerHarness::with_project(TestProject::new(), config, 1);
    let coordinator =
        WatchCoordinator::from_config(&harness.pipeline.config, &harness.pipeline.graph).unwrap();

    let err = coordinator
        .run(harness.scheduler.clone(), CancellationToken::new(), |_| {})
        .await
        .unwrap_err();
    assert!(matches!(err, kiln::Error::Watch(_)));
}
