//! Tests for the `simulate` command.

use std::fs;
use std::path::PathBuf;

use assert_cmd::Command;
use predicates::prelude::*;
use tempfile::TempDir;

fn config(dir: &TempDir) -> PathBuf {
    let path = dir.path().join("covers.toml");
    fs::write(
        &path,
        r#"
[[entry]]
id = "den"
covers = ["cover.den"]
min_position = 20
max_position = 80
"#,
    )
    .unwrap();
    path
}

#[test]
fn test_simulate_set_position() {
    let dir = TempDir::new().unwrap();
    let mut cmd = Command::cargo_bin("mappedcover").unwrap();
    cmd.arg("simulate")
        .arg("--config")
        .arg(config(&dir))
        .args(["--position", "50", "--fast", "set_cover_position=40"]);

    cmd.assert()
        .success()
        .stdout(predicate::str::contains("\"unique_id\": \"den_cover.den\""))
        .stdout(predicate::str::contains("\"set_position\""))
        .stdout(predicate::str::contains("\"value\": 44"))
        .stdout(predicate::str::contains("\"position\": 41"));
}

#[test]
fn test_simulate_unknown_service() {
    let dir = TempDir::new().unwrap();
    let mut cmd = Command::cargo_bin("mappedcover").unwrap();
    cmd.arg("simulate")
        .arg("--config")
        .arg(config(&dir))
        .args(["--fast", "toggle_cover"]);

    cmd.assert()
        .failure()
        .stderr(predicate::str::contains("not allowed"));
}

#[test]
fn test_simulate_tilt_needs_tilt_support() {
    let dir = TempDir::new().unwrap();
    let mut cmd = Command::cargo_bin("mappedcover").unwrap();
    cmd.arg("simulate")
        .arg("--config")
        .arg(config(&dir))
        .args(["--fast", "set_cover_tilt_position=30"]);

    cmd.assert()
        .failure()
        .stderr(predicate::str::contains("not supported"));
}

#[test]
fn test_simulate_requires_script() {
    let dir = TempDir::new().unwrap();
    let mut cmd = Command::cargo_bin("mappedcover").unwrap();
    cmd.arg("simulate").arg("--config").arg(config(&dir));
    cmd.assert().failure().code(2);
}
