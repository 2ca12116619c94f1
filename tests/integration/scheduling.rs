//! Scheduling correctness: ordering, failure propagation and parallelism.

use kiln::core::{RunRequest, TaskOutcome};
use kiln::orchestration::SchedulerEvent;

use crate::fixtures::{chain_specs, independent_specs, record, SchedulerHarness};

/// Given compile -> bundle -> minifyBundle
/// When the whole graph runs
/// Then each task starts only after its predecessor finished
#[tokio::test]
async fn test_chain_runs_in_dependency_order() {
    let harness = SchedulerHarness::new(chain_specs(), 4);

    let result = harness.scheduler.run(&RunRequest::all()).await.unwrap();

    assert!(result.success());
    assert_eq!(harness.recorder.started(), vec!["compile", "bundle", "minifyBundle"]);
    let compile = harness.recorder.get("compile");
    let bundle = harness.recorder.get("bundle");
    let minify = harness.recorder.get("minifyBundle");
    assert!(compile.finished <= bundle.started);
    assert!(bundle.finished <= minify.started);
}

/// Given compile -> bundle -> minifyBundle where compile fails
/// When the whole graph runs
/// Then bundle and minifyBundle are skipped with zero invocations
#[tokio::test]
async fn test_failure_skips_transitive_dependents() {
    let mut specs = chain_specs();
    specs[0] = record("compile").option("fail", true);
    let mut harness = SchedulerHarness::new(specs, 4);

    let result = harness.scheduler.run(&RunRequest::all()).await.unwrap();

    assert!(!result.success());
    assert!(result.report("compile").unwrap().failed());
    for name in ["bundle", "minifyBundle"] {
        assert_eq!(
            result.report(name).unwrap().outcome,
            TaskOutcome::Skipped {
                cause: "compile".into()
            },
            "{} should be skipped",
            name
        );
        assert_eq!(harness.recorder.count(name), 0);
    }

    let events = harness.drain_events();
    assert!(events.iter().any(|e| matches!(e,
        SchedulerEvent::TaskFailed { task, .. } if task.as_str() == "compile")));
    assert!(!events.iter().any(|e| matches!(e,
        SchedulerEvent::TaskStarted { task } if task.as_str() == "bundle")));
    assert!(matches!(
        events.last(),
        Some(SchedulerEvent::RunFinished { success: false, .. })
    ));
}

/// Given a failing task and an unrelated slow task
/// When both run
/// Then the unrelated task still completes
#[tokio::test]
async fn test_independent_tasks_finish_after_failure() {
    let harness = SchedulerHarness::new(
        vec![
            record("broken").option("fail", true),
            record("slow").option("sleep_ms", 100),
            record("after-slow").after(["slow"]),
        ],
        4,
    );

    let result = harness.scheduler.run(&RunRequest::all()).await.unwrap();

    assert!(!result.success());
    assert!(result.report("slow").unwrap().succeeded());
    assert!(result.report("after-slow").unwrap().succeeded());
    assert_eq!(result.failed().len(), 1);
    assert!(result.skipped().is_empty());
}

/// Given two independent tasks and jobs = 2
/// When the graph runs
/// Then their executions overlap in time
#[tokio::test]
async fn test_independent_tasks_overlap() {
    let harness = SchedulerHarness::new(independent_specs(2, 300), 2);

    let result = harness.scheduler.run(&RunRequest::all()).await.unwrap();

    assert!(result.success());
    let a = harness.recorder.get("task-0");
    let b = harness.recorder.get("task-1");
    assert!(a.started < b.finished && b.started < a.finished, "tasks should overlap");
}

/// Given a diamond a -> (b, c) -> d
/// When the graph runs
/// Then d waits for both branches
#[tokio::test]
async fn test_diamond_waits_for_all_predecessors() {
    let harness = SchedulerHarness::new(
        vec![
            record("a"),
            record("b").after(["a"]).option("sleep_ms", 50),
            record("c").after(["a"]).option("sleep_ms", 150),
            record("d").after(["b", "c"]),
        ],
        4,
    );

    let result = harness.scheduler.run(&RunRequest::all()).await.unwrap();

    assert!(result.success());
    let d = harness.recorder.get("d");
    assert!(harness.recorder.get("b").finished <= d.started);
    assert!(harness.recorder.get("c").finished <= d.started);
}

/// Given release-only minified variants
/// When a development run and a release run execute
/// Then only the release run includes them
#[tokio::test]
async fn test_release_tasks_only_in_release_runs() {
    let harness = SchedulerHarness::new(
        vec![record("js"), record("js-min").reads_output_of("js").release()],
        2,
    );

    let dev = harness.scheduler.run(&RunRequest::all()).await.unwrap();
    assert!(dev.report("js-min").is_none());
    assert_eq!(harness.recorder.count("js-min"), 0);

    let release = harness.scheduler.run(&RunRequest::release()).await.unwrap();
    assert!(release.report("js-min").unwrap().succeeded());
    assert_eq!(harness.recorder.count("js"), 2);
}

/// Given a closure request for the last task of a chain
/// When it runs
/// Then its predecessors run too, and nothing else
#[tokio::test]
async fn test_closure_includes_predecessors_only() {
    let mut specs = chain_specs();
    specs.push(record("unrelated"));
    let harness = SchedulerHarness::new(specs, 4);

    let result = harness
        .scheduler
        .run(&RunRequest::closure(["bundle"]))
        .await
        .unwrap();

    assert!(result.success());
    assert_eq!(harness.recorder.started(), vec!["compile", "bundle"]);
    assert_eq!(harness.recorder.count("unrelated"), 0);
}

/// Given a copy/concat pipeline
/// When the whole graph runs twice over an unchanged tree
/// Then the output file set is identical
#[tokio::test]
async fn test_repeated_runs_produce_same_outputs() {
    use kiln::core::TaskSpec;

    let harness = SchedulerHarness::new(
        vec![
            TaskSpec::new("html", "copy")
                .inputs(["src/*.html"])
                .output("", Some("*.html")),
            TaskSpec::new("libs", "copy")
                .inputs(["src/libs/**/*"])
                .output("libs", None),
            TaskSpec::new("bundle", "concat")
                .inputs(["src/js/*.js"])
                .output("js", Some("bundle.js"))
                .option("file", "bundle.js"),
        ],
        4,
    );
    let project = &harness.project;
    project.write("src/index.html", "<body>home</body>");
    project.write("src/about.html", "<body>about</body>");
    project.write("src/libs/vendor/lib.js", "lib");
    project.write("src/js/a.js", "a();");
    project.write("src/js/b.js", "b();");

    let first = harness.scheduler.run(&RunRequest::all()).await.unwrap();
    assert!(first.success());
    let files = project.files_under("dist");

    let second = harness.scheduler.run(&RunRequest::all()).await.unwrap();
    assert!(second.success());
    assert_eq!(project.files_under("dist"), files);
    assert!(files.contains(std::path::Path::new("libs/vendor/lib.js")));
    assert_eq!(project.read("dist/js/bundle.js"), "a();\nb();");
}
