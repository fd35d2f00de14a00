#![allow(deprecated)] // cargo_bin! macro doesn't exist yet in assert_cmd 2.1

use assert_cmd::Command;
use predicates::prelude::*;
use tempfile::TempDir;

fn kfsbench() -> Command {
    let mut cmd = Command::cargo_bin("kfsbench").unwrap();
    cmd.env_remove("KFSBENCH_ROOT").env_remove("RUST_LOG");
    cmd
}

#[test]
fn test_help_lists_families() {
    kfsbench()
        .arg("--help")
        .assert()
        .success()
        .stdout(predicate::str::contains("mtcc"))
        .stdout(predicate::str::contains("fragtest"))
        .stdout(predicate::str::contains("filebench"))
        .stdout(predicate::str::contains("leveldb"))
        .stdout(predicate::str::contains("ycsb"));
}

#[test]
fn test_subcommand_required() {
    kfsbench().assert().failure();
}

#[test]
fn test_unknown_structure_rejected() {
    kfsbench()
        .args(["leveldb", "100", "-d", "b_tree"])
        .assert()
        .failure()
        .stderr(predicate::str::contains("not a valid data structure"));
}

#[test]
fn test_layout_out_of_range_rejected() {
    kfsbench()
        .args(["ycsb", "-P", "workloada", "-l", "150"])
        .assert()
        .failure()
        .stderr(predicate::str::contains("outside 0..=100"));
}

#[test]
fn test_missing_daemon_scripts() {
    let root = TempDir::new().unwrap();
    kfsbench()
        .args(["leveldb", "100", "--root"])
        .arg(root.path())
        .assert()
        .failure()
        .stderr(predicate::str::contains("mkfs.sh not found"));
}

#[test]
fn test_root_from_environment() {
    let root = TempDir::new().unwrap();
    kfsbench()
        .env("KFSBENCH_ROOT", root.path())
        .args(["ycsb", "-P", "workloada"])
        .assert()
        .failure()
        .stderr(predicate::str::contains(root.path().to_string_lossy().into_owned()));
}
