//! Behavioural smoke tests for the CLI entrypoint.

use assert_cmd::cargo::cargo_bin_cmd;
use predicates::prelude::*;
use tempfile::TempDir;

#[test]
fn cli_without_arguments_prints_help() {
    let mut cmd = cargo_bin_cmd!("covey");
    cmd.assert()
        .failure()
        .stderr(predicate::str::contains("allocate"));
}

#[test]
fn allocate_help_lists_destruction_policies() {
    let mut cmd = cargo_bin_cmd!("covey");
    cmd.args(["allocate", "--help"])
        .assert()
        .success()
        .stdout(predicate::str::contains("on-error"))
        .stdout(predicate::str::contains("--cluster-out"));
}

#[test]
fn allocate_reports_a_missing_nodes_file() {
    let tmp = TempDir::new().expect("tempdir");
    let mut cmd = cargo_bin_cmd!("covey");
    cmd.current_dir(tmp.path())
        .args(["allocate", "--nodes", "missing.json"])
        .assert()
        .code(1)
        .stderr(predicate::str::contains("failed to read node specs from missing.json"));
}

#[test]
fn allocate_rejects_unknown_backends() {
    let tmp = TempDir::new().expect("tempdir");
    std::fs::write(tmp.path().join("nodes.json"), r#"{"web": {"ssh_key_name": "id_web"}}"#)
        .expect("write nodes");
    let mut cmd = cargo_bin_cmd!("covey");
    cmd.current_dir(tmp.path())
        .env("HOME", tmp.path())
        .env_remove("COVEY_CONFIG_PATH")
        .args(["allocate", "--nodes", "nodes.json", "--backend", "nimbus"])
        .assert()
        .code(1)
        .stderr(predicate::str::contains("unknown backend nimbus"));
}

#[test]
fn destroy_without_a_record_explains_how_to_name_one() {
    let tmp = TempDir::new().expect("tempdir");
    let mut cmd = cargo_bin_cmd!("covey");
    cmd.current_dir(tmp.path())
        .env_remove("COVEY_CLUSTER")
        .arg("destroy")
        .assert()
        .code(1)
        .stderr(predicate::str::contains("no cluster found"));
}
