use assert_cmd::Command;
use predicates::prelude::*;

#[test]
fn list_servers_includes_default_registry() {
    let mut cmd = Command::cargo_bin("muxctl").unwrap();
    cmd.arg("--json").arg("list-servers");
    cmd.assert()
        .success()
        .stdout(predicate::str::contains("filesystem"))
        .stdout(predicate::str::contains("nodit"));
}

#[test]
fn list_tools_for_unknown_server_fails() {
    let mut cmd = Command::cargo_bin("muxctl").unwrap();
    cmd.arg("list-tools").arg("ghost");
    cmd.assert()
        .failure()
        .stderr(predicate::str::contains("unknown server: ghost"));
}

#[test]
fn call_rejects_malformed_env_override() {
    let mut cmd = Command::cargo_bin("muxctl").unwrap();
    cmd.arg("call")
        .arg("filesystem")
        .arg("read_file")
        .arg("--env")
        .arg("NOT_A_PAIR");
    cmd.assert()
        .failure()
        .stderr(predicate::str::contains("--env must be KEY=VALUE"));
}

#[test]
fn health_reports_zero_connected_servers() {
    let mut cmd = Command::cargo_bin("muxctl").unwrap();
    cmd.arg("--json").arg("health");
    cmd.assert()
        .success()
        .stdout(predicate::str::contains("\"connected\":0"))
        .stdout(predicate::str::contains("\"status\":\"healthy\""));
}
