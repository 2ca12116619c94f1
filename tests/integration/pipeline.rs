//! Whole-pipeline tests: configuration, clean, font group and the CLI.

use std::process::Command;

use kiln::config::DEFAULT_CONFIG_FILE;
use kiln::core::{OutputRoot, RunRequest, TaskSpec};
use kiln::{ConfigError, Error, Pipeline};

use crate::fixtures::{config, SchedulerHarness, TestProject};

const SITE_CONFIG: &str = r#"
[[task]]
name = "html"
kind = "copy"
inputs = ["src/*.html"]
owns = "*.html"

[[task]]
name = "bundle"
kind = "concat"
inputs = ["src/js/*.js"]
output = "js"
owns = "app.js"
options = { file = "app.js" }
"#;

/// Given a populated output directory
/// When clean runs twice
/// Then both succeed and the directory is gone
#[test]
fn test_clean_is_idempotent() {
    let project = TestProject::new();
    project.write("dist/css/style.css", "body{}");
    project.write("dist/index.html", "<body></body>");
    let pipeline = Pipeline::load(&project.path, None).unwrap();

    assert!(pipeline.clean().unwrap());
    assert!(!project.exists("dist"));
    assert!(!pipeline.clean().unwrap());
    assert!(project.exists(""), "the project itself must survive");
}

/// Given tasks declaring each other as predecessors
/// When the pipeline loads
/// Then a configuration error names the cycle
#[test]
fn test_cycle_is_config_error() {
    let project = TestProject::new();
    project.write(
        DEFAULT_CONFIG_FILE,
        r#"
        [[task]]
        name = "compile"
        kind = "copy"
        output = "a"
        after = ["minify"]

        [[task]]
        name = "bundle"
        kind = "copy"
        output = "b"
        after = ["compile"]

        [[task]]
        name = "minify"
        kind = "copy"
        output = "c"
        after = ["bundle"]
        "#,
    );

    match Pipeline::load(&project.path, None).unwrap_err() {
        Error::Config(ConfigError::Cycle { path }) => {
            assert_eq!(path.first(), path.last());
            assert!(path.contains(&"bundle".to_string()));
        }
        other => panic!("Expected cycle error, got {}", other),
    }
}

/// Given converted fonts and a font-manifest task after the converters
/// When the fonts group runs
/// Then the stylesheet fragment lists every face, and is kept once edited
#[tokio::test]
async fn test_fonts_group_writes_manifest() {
    let project = TestProject::new();
    project.write("src/fonts/Roboto-Regular.woff2", "r");
    project.write("src/fonts/Roboto-Bold.woff2", "b");
    project.write("src/fonts/Roboto-Bold.woff", "b");
    let tasks = vec![
        TaskSpec::new("fonts-woff2", "copy")
            .inputs(["src/fonts/*.woff2"])
            .output("fonts", Some("*.woff2"))
            .group("fonts"),
        TaskSpec::new("fonts-woff", "copy")
            .inputs(["src/fonts/*.woff"])
            .output("fonts", Some("*.woff"))
            .group("fonts"),
        TaskSpec::new("font-manifest", "font-manifest")
            .inputs(["*.woff2", "*.woff"])
            .reads_output_of("fonts-woff2")
            .after(["fonts-woff"])
            .output("src/scss", Some("_fonts.scss"))
            .output_root(OutputRoot::Project)
            .group("fonts"),
        TaskSpec::new("html", "copy")
            .inputs(["src/*.html"])
            .output("", Some("*.html"))
            .allow_empty(),
    ];
    let harness = SchedulerHarness::with_project(project, config(tasks, &[]), 4);

    let result = harness
        .scheduler
        .run(&RunRequest::group("fonts"))
        .await
        .unwrap();

    assert!(result.success());
    assert!(result.report("html").is_none());
    let manifest = harness.project.read("src/scss/_fonts.scss");
    assert_eq!(manifest.matches("@font-face").count(), 2);
    assert!(manifest.contains("url(\"../fonts/Roboto-Bold.woff2\") format(\"woff2\")"));
    assert!(manifest.contains("url(\"../fonts/Roboto-Bold.woff\") format(\"woff\")"));

    harness.project.write("src/scss/_fonts.scss", "/* tuned by hand */");
    harness.scheduler.run(&RunRequest::group("fonts")).await.unwrap();
    assert_eq!(harness.project.read("src/scss/_fonts.scss"), "/* tuned by hand */");
}

/// Given a release variant produced by an external program from its
/// predecessor's output
/// When a release run executes
/// Then the suffixed file lands next to the original
#[cfg(unix)]
#[tokio::test]
async fn test_release_variant_reads_predecessor_output() {
    let project = TestProject::new();
    project.write("src/js/main.js", "console.log(1);");
    let tasks = vec![
        TaskSpec::new("js", "copy")
            .inputs(["src/js/main.js"])
            .output("js", Some("main.js")),
        TaskSpec::new("js-min", "command")
            .inputs(["main.js"])
            .reads_output_of("js")
            .output("js", Some("*.min.js"))
            .release()
            .option("program", "cp")
            .option(
                "args",
                toml::Value::Array(vec!["{input}".into(), "{output}".into()]),
            )
            .option("suffix", ".min"),
    ];
    let harness = SchedulerHarness::with_project(project, config(tasks, &[]), 2);

    let result = harness.scheduler.run(&RunRequest::release()).await.unwrap();

    assert!(result.success(), "{:?}", result.failed());
    assert_eq!(harness.project.read("dist/js/main.min.js"), "console.log(1);");
    assert!(harness.project.exists("dist/js/main.js"));
}

fn kiln(project: &TestProject, args: &[&str]) -> std::process::Output {
    Command::new(env!("CARGO_BIN_EXE_kiln"))
        .arg("--project")
        .arg(&project.path)
        .args(args)
        .output()
        .expect("Failed to run kiln")
}

#[test]
fn test_cli_build_json_and_exit_codes() {
    let project = TestProject::new();
    project.write(DEFAULT_CONFIG_FILE, SITE_CONFIG);
    project.write("src/index.html", "<body>home</body>");
    project.write("src/js/a.js", "a();");
    project.write("dist/stale.txt", "old");

    let output = kiln(&project, &["build", "--json"]);
    assert_eq!(output.status.code(), Some(0), "{}", String::from_utf8_lossy(&output.stderr));
    let json: serde_json::Value = serde_json::from_slice(&output.stdout).unwrap();
    assert_eq!(json["reports"].as_array().unwrap().len(), 2);
    assert!(project.exists("dist/index.html"));
    assert!(project.exists("dist/js/app.js"));
    assert!(!project.exists("dist/stale.txt"), "build starts from a clean output");

    // No JavaScript left: the concat task fails on an empty input set.
    std::fs::remove_file(project.path.join("src/js/a.js")).unwrap();
    let output = kiln(&project, &["build"]);
    assert_eq!(output.status.code(), Some(1));
    assert!(String::from_utf8_lossy(&output.stdout).contains("FAILED"));

    let output = kiln(&project, &["run", "nope"]);
    assert_eq!(output.status.code(), Some(2));

    let output = kiln(&project, &["clean"]);
    assert_eq!(output.status.code(), Some(0));
    assert!(!project.exists("dist"));
    let output = kiln(&project, &["clean"]);
    assert_eq!(output.status.code(), Some(0));
}

#[test]
fn test_cli_tasks_lists_topological_order() {
    let project = TestProject::new();
    let output = kiln(&project, &["tasks"]);
    assert_eq!(output.status.code(), Some(0));

    let stdout = String::from_utf8_lossy(&output.stdout);
    let position = |name: &str| {
        stdout
            .lines()
            .position(|l| l.starts_with(&format!("{} ", name)))
            .unwrap_or_else(|| panic!("{} not listed", name))
    };
    assert!(position("fonts-woff2") < position("font-manifest"));
    assert!(position("font-manifest") < position("style"));
    assert!(position("js") < position("js-min"));
}
