//! Integration tests for the `hutch` command line.

use assert_cmd::Command;
use predicates::prelude::*;

fn hutch(root: &std::path::Path) -> Command {
    let mut cmd = Command::cargo_bin("hutch").unwrap();
    cmd.arg("--root").arg(root);
    cmd
}

#[test]
fn list_of_empty_root_is_empty() {
    let dir = tempfile::tempdir().unwrap();

    hutch(dir.path())
        .args(["list", "--quiet"])
        .assert()
        .success()
        .stdout(predicate::str::is_empty());

    hutch(dir.path())
        .args(["list", "--format", "json"])
        .assert()
        .success()
        .stdout(predicate::str::contains("[]"));
}

#[test]
fn state_of_unknown_container_fails() {
    let dir = tempfile::tempdir().unwrap();

    hutch(dir.path())
        .args(["state", "nope"])
        .assert()
        .failure()
        .stderr(predicate::str::contains("Container not found: nope"));
}

#[test]
fn create_rejects_missing_config() {
    let dir = tempfile::tempdir().unwrap();

    hutch(dir.path())
        .args(["create", "c1", "--config"])
        .arg(dir.path().join("missing.json"))
        .assert()
        .failure()
        .stderr(predicate::str::contains("missing.json"));
}

#[test]
fn unknown_signal_is_reported() {
    let dir = tempfile::tempdir().unwrap();

    hutch(dir.path())
        .args(["kill", "c1", "SIGNOPE"])
        .assert()
        .failure()
        .stderr(predicate::str::contains("unknown signal"));
}

#[test]
fn init_outside_the_engine_fails() {
    let dir = tempfile::tempdir().unwrap();

    hutch(dir.path())
        .arg("init")
        .env_remove("_HUTCH_INITPIPE")
        .assert()
        .code(1);
}
