//! Tests for the `remap` command.

use assert_cmd::Command;
use predicates::prelude::*;

fn remap(args: &[&str]) -> assert_cmd::assert::Assert {
    let mut cmd = Command::cargo_bin("mappedcover").unwrap();
    cmd.arg("remap").args(args);
    cmd.assert()
}

#[test]
fn test_remap_to_source() {
    remap(&["50", "--range", "20:80"])
        .success()
        .stdout(predicate::eq("50\n"));
    remap(&["100", "--range", "20:80"])
        .success()
        .stdout(predicate::eq("80\n"));
}

#[test]
fn test_remap_zero_stays_zero() {
    remap(&["0", "--range", "20:80"])
        .success()
        .stdout(predicate::eq("0\n"));
    remap(&["0", "--range", "20:80", "--direction", "from-source"])
        .success()
        .stdout(predicate::eq("0\n"));
}

#[test]
fn test_remap_from_source() {
    remap(&["80", "--range", "20:80", "--direction", "from-source"])
        .success()
        .stdout(predicate::eq("100\n"));
    // Below the range but not closed
    remap(&["10", "--range", "20:80", "--direction", "from-source"])
        .success()
        .stdout(predicate::eq("1\n"));
}

#[test]
fn test_remap_rejects_bad_input() {
    remap(&["150"]).failure();
    remap(&["50", "--range", "20-80"]).failure();
    remap(&["50", "--direction", "sideways"]).failure().code(2);
}
