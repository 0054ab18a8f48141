//! Integration tests for the Souk CLI binary.

use std::time::Duration;

use assert_cmd::cargo::cargo_bin_cmd;
use predicates::prelude::PredicateBooleanExt;
use tempfile::TempDir;

#[test]
fn test_help_lists_subcommands() {
    let mut cmd = cargo_bin_cmd!("cli");
    cmd.arg("--help");

    cmd.assert()
        .success()
        .stdout(predicates::str::contains("watch"))
        .stdout(predicates::str::contains("inbox"))
        .stdout(predicates::str::contains("mark-read"))
        .stdout(predicates::str::contains("send"))
        .stdout(predicates::str::contains("demo"));
}

#[test]
fn test_watch_requires_scope() {
    let mut cmd = cargo_bin_cmd!("cli");
    cmd.arg("watch").timeout(Duration::from_secs(5));

    cmd.assert()
        .failure()
        .stderr(predicates::str::contains(
            "the following required arguments were not provided",
        ))
        .stderr(predicates::str::contains("<SCOPE>"));
}

#[test]
fn test_watch_rejects_unknown_scope_kind() {
    let mut cmd = cargo_bin_cmd!("cli");
    cmd.arg("watch")
        .arg("thread:abc")
        .timeout(Duration::from_secs(5));

    cmd.assert()
        .failure()
        .stderr(predicates::str::contains("invalid value"))
        .stderr(predicates::str::contains("unknown scope kind `thread`"));
}

#[test]
fn test_mark_read_invalid_conversation_uuid() {
    let mut cmd = cargo_bin_cmd!("cli");
    cmd.arg("mark-read")
        .arg("--conversation")
        .arg("not-a-uuid")
        .arg("--user")
        .arg("00000000-0000-0000-0000-000000000001")
        .timeout(Duration::from_secs(5));

    cmd.assert()
        .failure()
        .stderr(predicates::str::contains("invalid value"))
        .stderr(predicates::str::contains("--conversation <CONVERSATION>"));
}

#[test]
fn test_mark_read_connection_failure() {
    let mut cmd = cargo_bin_cmd!("cli");
    cmd.env_remove("RUST_LOG")
        .arg("mark-read")
        .arg("--conversation")
        .arg("00000000-0000-0000-0000-000000000001")
        .arg("--user")
        .arg("00000000-0000-0000-0000-000000000002")
        .arg("--backend")
        .arg("http://127.0.0.1:9/")
        .timeout(Duration::from_secs(10));

    cmd.assert()
        .failure()
        .stderr(predicates::str::contains("failed to write read receipt"));
}

#[test]
fn test_invalid_backend_url_is_rejected() {
    let mut cmd = cargo_bin_cmd!("cli");
    cmd.arg("inbox")
        .arg("--user")
        .arg("00000000-0000-0000-0000-000000000001")
        .arg("--backend")
        .arg("not a url")
        .timeout(Duration::from_secs(5));

    cmd.assert()
        .failure()
        .stderr(predicates::str::contains("--backend <BACKEND>"));
}

#[test]
fn test_config_generates_json_file() {
    let dir = TempDir::new().unwrap();
    let mut cmd = cargo_bin_cmd!("cli");
    cmd.current_dir(dir.path())
        .arg("config")
        .arg("--format")
        .arg("json");

    cmd.assert().success().stdout(predicates::str::contains(
        "Configuration file 'config.json' generated successfully.",
    ));

    let written = std::fs::read_to_string(dir.path().join("config.json")).unwrap();
    let value: serde_json::Value = serde_json::from_str(&written).unwrap();
    assert_eq!(value["realtime"]["conversation_poll_ms"], 3000);
    assert_eq!(value["log_format"], "text");
}

#[test]
fn test_config_rejects_unknown_format() {
    let dir = TempDir::new().unwrap();
    let mut cmd = cargo_bin_cmd!("cli");
    cmd.current_dir(dir.path())
        .arg("config")
        .arg("--format")
        .arg("toml");

    cmd.assert()
        .failure()
        .stderr(predicates::str::contains("Unsupported format `toml`"));
    assert!(!dir.path().join("config.toml").exists());
}

#[test]
fn test_completion_generates_script() {
    let mut cmd = cargo_bin_cmd!("cli");
    cmd.arg("completion").arg("--shell").arg("bash");

    cmd.assert()
        .success()
        .stdout(predicates::str::contains("souk"));
}

#[test]
fn test_demo_shows_failover_cycle() {
    let mut cmd = cargo_bin_cmd!("cli");
    cmd.env("RUST_LOG", "off")
        .arg("demo")
        .timeout(Duration::from_secs(60));

    cmd.assert()
        .success()
        .stdout(predicates::str::contains("link: live"))
        .stdout(predicates::str::contains("link: degraded"))
        .stdout(predicates::str::contains("link: polling"))
        .stdout(
            predicates::str::contains("counters consistent: true")
                .and(predicates::str::contains("demo complete")),
        );
}
