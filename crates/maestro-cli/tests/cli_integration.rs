//! CLI integration tests for the validate surface (no device required).

use assert_cmd::Command;
use predicates::prelude::*;

fn maestro() -> Command {
    Command::cargo_bin("maestro").unwrap()
}

#[test]
fn validate_accepts_a_clean_workspace() {
    let dir = tempfile::tempdir().unwrap();
    std::fs::write(dir.path().join("smoke.yaml"), "- tapOn: Login\n- back\n").unwrap();

    maestro()
        .arg("validate")
        .arg(dir.path())
        .assert()
        .success()
        .stdout(predicate::str::contains("1 test case(s), 0 error(s)"));
}

#[test]
fn validate_reports_circular_dependencies() {
    let dir = tempfile::tempdir().unwrap();
    std::fs::write(dir.path().join("a.yaml"), "- runFlow: b.yaml\n").unwrap();
    std::fs::write(dir.path().join("b.yaml"), "- runFlow: a.yaml\n").unwrap();

    maestro()
        .arg("validate")
        .arg(dir.path())
        .assert()
        .code(2)
        .stderr(predicate::str::contains("circular dependency"))
        .stderr(predicate::str::contains("a.yaml -> b.yaml -> a.yaml"));
}

#[test]
fn validate_reports_parse_errors() {
    let dir = tempfile::tempdir().unwrap();
    std::fs::write(dir.path().join("bad.yaml"), "- tapOn: [unclosed\n").unwrap();

    maestro()
        .arg("validate")
        .arg(dir.path())
        .assert()
        .code(2)
        .stderr(predicate::str::contains("bad.yaml"));
}

#[test]
fn validate_honours_tag_filters() {
    let dir = tempfile::tempdir().unwrap();
    std::fs::write(
        dir.path().join("smoke.yaml"),
        "tags:\n  - smoke\n---\n- back\n",
    )
    .unwrap();
    std::fs::write(
        dir.path().join("slow.yaml"),
        "tags:\n  - slow\n---\n- back\n",
    )
    .unwrap();

    maestro()
        .arg("validate")
        .arg(dir.path())
        .arg("--include-tags")
        .arg("smoke")
        .assert()
        .success()
        .stdout(predicate::str::contains("1 test case(s)"));
}

#[test]
fn test_command_fails_without_a_device() {
    let dir = tempfile::tempdir().unwrap();
    std::fs::write(dir.path().join("smoke.yaml"), "- back\n").unwrap();

    // Point at a serial that certainly is not connected; connecting to the
    // automation server must fail with the device exit code.
    maestro()
        .arg("--device")
        .arg("emulator-9998")
        .arg("test")
        .arg(dir.path())
        .assert()
        .code(3);
}
