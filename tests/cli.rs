use assert_cmd::cargo::cargo_bin_cmd;
use predicates::prelude::*;
use std::io::Write;

fn config_file(contents: &str) -> tempfile::NamedTempFile {
    let mut file = tempfile::NamedTempFile::new().unwrap();
    file.write_all(contents.as_bytes()).unwrap();
    file
}

#[test]
fn config_schema_prints_title() {
    let mut cmd = cargo_bin_cmd!("agent-governor");
    cmd.args(["config", "schema"]);
    cmd.assert()
        .success()
        .stdout(predicate::str::contains("Agent Governor Configuration"));
}

#[test]
fn config_check_fills_defaults() {
    let file = config_file(r#"{"rate_limit": {"enabled": true}}"#);
    let mut cmd = cargo_bin_cmd!("agent-governor");
    cmd.arg("--config").arg(file.path()).args(["config", "check"]);
    let out = cmd.assert().success().get_output().stdout.clone();
    let v: serde_json::Value = serde_json::from_slice(&out).unwrap();
    assert_eq!(v["rate_limit"]["enabled"], true);
    assert_eq!(v["rate_limit"]["burst_size"], 20);
    assert_eq!(v["tools"]["max_workers"], 10);
}

#[test]
fn config_check_rejects_invalid_rate() {
    let file = config_file(r#"{"rate_limit": {"requests_per_second": 0}}"#);
    let mut cmd = cargo_bin_cmd!("agent-governor");
    cmd.arg("--config").arg(file.path()).args(["config", "check"]);
    cmd.assert()
        .failure()
        .stderr(predicate::str::contains("requests_per_second"));
}

#[test]
fn simulate_admits_only_the_burst() {
    let file = config_file(
        r#"{"rate_limit": {"enabled": true, "requests_per_second": 0.1, "burst_size": 5}}"#,
    );
    let mut cmd = cargo_bin_cmd!("agent-governor");
    cmd.arg("--config")
        .arg(file.path())
        .args(["simulate", "-n", "8"])
        .env_remove("RUST_LOG");
    let out = cmd.assert().success().get_output().stdout.clone();
    let v: serde_json::Value = serde_json::from_slice(&out).unwrap();
    assert_eq!(v["requests"], 8);
    assert_eq!(v["admitted"], 5);
    assert_eq!(v["stats"]["key-0"]["denied"], 3);
}

#[test]
fn dispatch_prints_tool_messages_in_order() {
    let mut cmd = cargo_bin_cmd!("agent-governor");
    cmd.args(["dispatch", "-n", "3", "--sleep-ms", "1"]);
    let out = cmd.assert().success().get_output().stdout.clone();
    let v: serde_json::Value = serde_json::from_slice(&out).unwrap();
    let ids: Vec<&str> = v
        .as_array()
        .unwrap()
        .iter()
        .map(|m| m["tool_call_id"].as_str().unwrap())
        .collect();
    assert_eq!(ids, vec!["call_0", "call_1", "call_2"]);
    assert_eq!(v[0]["role"], "tool");
}

#[test]
fn dispatch_failure_exits_nonzero() {
    let mut cmd = cargo_bin_cmd!("agent-governor");
    cmd.args(["dispatch", "-n", "3", "--sleep-ms", "1", "--fail-at", "1"]);
    cmd.assert()
        .failure()
        .stderr(predicate::str::contains("tool call #1 (call_1) failed"));
}
