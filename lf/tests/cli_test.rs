//! CLI smoke tests

use assert_cmd::Command;
use predicates::prelude::*;

#[test]
fn test_help_lists_subcommands() {
    Command::cargo_bin("lf")
        .unwrap()
        .arg("--help")
        .assert()
        .success()
        .stdout(predicate::str::contains("master"))
        .stdout(predicate::str::contains("slave"))
        .stdout(predicate::str::contains("run"));
}

#[test]
fn test_run_executes_workflow_file() {
    let dir = tempfile::tempdir().unwrap();
    let workflow = dir.path().join("smoke.yml");
    std::fs::write(
        &workflow,
        r#"
id: smoke
options:
  vus: 1
  iterations: 2
steps:
  - id: s1
    type: wait
    config:
      duration-ms: 1
"#,
    )
    .unwrap();

    Command::cargo_bin("lf")
        .unwrap()
        .args(["run", "-f"])
        .arg(&workflow)
        .assert()
        .success()
        .stdout(predicate::str::contains("passed"))
        .stdout(predicate::str::contains("iterations: 2"));
}

#[test]
fn test_run_missing_file_fails() {
    Command::cargo_bin("lf")
        .unwrap()
        .args(["run", "-f", "/nonexistent/wf.yml"])
        .assert()
        .failure();
}
