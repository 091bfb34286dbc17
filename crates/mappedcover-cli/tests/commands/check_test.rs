//! Tests for the `check` command.

use std::fs;

use assert_cmd::Command;
use predicates::prelude::*;
use tempfile::TempDir;

#[test]
fn test_check_valid_config() {
    let dir = TempDir::new().unwrap();
    let path = dir.path().join("covers.toml");
    fs::write(
        &path,
        r#"
[[entry]]
id = "bedroom"
covers = ["cover.left", "cover.right"]
min_position = 10
max_position = 90
"#,
    )
    .unwrap();

    let mut cmd = Command::cargo_bin("mappedcover").unwrap();
    cmd.arg("check").arg("--config").arg(&path);
    cmd.assert()
        .success()
        .stdout(predicate::str::contains("bedroom: 2 cover(s)"))
        .stdout(predicate::str::contains("position [10, 90]"));
}

#[test]
fn test_check_invalid_config() {
    let dir = TempDir::new().unwrap();
    let path = dir.path().join("covers.toml");
    fs::write(
        &path,
        r#"
[[entry]]
covers = []
"#,
    )
    .unwrap();

    let mut cmd = Command::cargo_bin("mappedcover").unwrap();
    cmd.arg("check").arg("--config").arg(&path);
    cmd.assert().failure();
}

#[test]
fn test_check_missing_config() {
    let mut cmd = Command::cargo_bin("mappedcover").unwrap();
    cmd.env_remove("MAPPEDCOVER_CONFIG").arg("check");
    cmd.assert()
        .failure()
        .stderr(predicate::str::contains("no configuration file"));
}
