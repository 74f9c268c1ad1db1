//! End-to-end tests driving the sandals binary with JSON requests.
//!
//! Request validation happens before any privileged state is touched, so
//! those scenarios run anywhere. The full sandbox scenarios need
//! unprivileged user namespaces and a delegated cgroup v2 subtree, which CI
//! containers often lack; they are ignored by default and run with
//! `cargo test -- --ignored` on a suitable host.

use std::{
    io::Write,
    process::{Command, Output, Stdio},
};

fn run_sandals(input: &str) -> Output {
    let mut child = Command::new(env!("CARGO_BIN_EXE_sandals"))
        .stdin(Stdio::piped())
        .stdout(Stdio::piped())
        .stderr(Stdio::piped())
        .spawn()
        .expect("failed to spawn sandals");
    child
        .stdin
        .take()
        .expect("stdin is piped")
        .write_all(input.as_bytes())
        .expect("failed to write request");
    child.wait_with_output().expect("failed to wait for sandals")
}

fn response(output: &Output) -> serde_json::Value {
    let stdout = String::from_utf8(output.stdout.clone()).expect("stdout is UTF-8");
    assert!(
        stdout.ends_with('\n') && stdout.matches('\n').count() == 1,
        "expected exactly one response line, got {:?}",
        stdout
    );
    assert!(stdout.len() <= 4096, "response exceeds PIPE_BUF");
    serde_json::from_str(&stdout).expect("response is valid JSON")
}

fn status_of(output: &Output) -> String {
    response(output)["status"]
        .as_str()
        .expect("status field present")
        .to_string()
}

#[test]
fn malformed_json_is_request_invalid() {
    let output = run_sandals("this is not json");
    assert_eq!(status_of(&output), "requestInvalid");
    assert!(output.status.success(), "response was delivered");
}

#[test]
fn empty_input_is_request_invalid() {
    let output = run_sandals("");
    assert_eq!(status_of(&output), "requestInvalid");
    assert!(output.status.success());
}

#[test]
fn trailing_garbage_is_request_invalid() {
    let output = run_sandals("{\"cmd\":[\"/bin/true\"]} trailing");
    assert_eq!(status_of(&output), "requestInvalid");
}

#[test]
fn unknown_key_is_reported_with_path() {
    let output = run_sandals(r#"{"cmd":["/bin/true"],"bogus":1}"#);
    let resp = response(&output);
    assert_eq!(resp["status"], "requestInvalid");
    let description = resp["description"].as_str().unwrap();
    assert!(
        description.contains("$.bogus"),
        "description should name the JSON path: {}",
        description
    );
}

#[test]
fn missing_cmd_is_request_invalid() {
    let output = run_sandals(r#"{"hostName":"x"}"#);
    let resp = response(&output);
    assert_eq!(resp["status"], "requestInvalid");
    assert!(resp["description"]
        .as_str()
        .unwrap()
        .contains("'cmd' missing or empty"));
}

#[test]
fn nested_validation_error_is_qualified() {
    let output =
        run_sandals(r#"{"cmd":["/bin/true"],"pipes":[{"dest":"o","stdout":true,"limit":-1}]}"#);
    let resp = response(&output);
    assert_eq!(resp["status"], "requestInvalid");
    assert!(resp["description"]
        .as_str()
        .unwrap()
        .contains("$.pipes[0].limit"));
}

#[test]
fn arguments_are_rejected() {
    let output = Command::new(env!("CARGO_BIN_EXE_sandals"))
        .arg("--help")
        .stdin(Stdio::null())
        .stdout(Stdio::piped())
        .stderr(Stdio::piped())
        .output()
        .expect("failed to run sandals");
    assert!(!output.status.success());
    assert!(output.stdout.is_empty(), "no response without a request");
}

#[test]
#[ignore = "needs unprivileged user namespaces and a delegated cgroup v2 subtree"]
fn true_exits_zero() {
    let output = run_sandals(r#"{"cmd":["/bin/true"]}"#);
    let resp = response(&output);
    assert_eq!(resp["status"], "exited");
    assert_eq!(resp["code"], 0);
    assert!(output.status.success());
}

#[test]
#[ignore = "needs unprivileged user namespaces and a delegated cgroup v2 subtree"]
fn exit_code_propagates() {
    let output = run_sandals(r#"{"cmd":["/bin/sh","-c","exit 7"]}"#);
    let resp = response(&output);
    assert_eq!(resp["status"], "exited");
    assert_eq!(resp["code"], 7);
}

#[test]
#[ignore = "needs unprivileged user namespaces and a delegated cgroup v2 subtree"]
fn fatal_signal_is_named() {
    let output = run_sandals(r#"{"cmd":["/bin/sh","-c","kill -SEGV $$"]}"#);
    let resp = response(&output);
    assert_eq!(resp["status"], "killed");
    assert_eq!(resp["signal"], "SIGSEGV");
}

#[test]
#[ignore = "needs unprivileged user namespaces and a delegated cgroup v2 subtree"]
fn wall_clock_deadline_fires() {
    let output = run_sandals(r#"{"cmd":["/bin/sleep","10"],"timeLimit":0.05}"#);
    assert_eq!(status_of(&output), "timeLimit");
}

#[test]
#[ignore = "needs unprivileged user namespaces and a delegated cgroup v2 subtree"]
fn zero_time_limit_fires_immediately() {
    let output = run_sandals(r#"{"cmd":["/bin/sleep","10"],"timeLimit":0}"#);
    assert_eq!(status_of(&output), "timeLimit");
}

#[test]
#[ignore = "needs unprivileged user namespaces and a delegated cgroup v2 subtree"]
fn exec_failure_is_internal_error() {
    let output = run_sandals(r#"{"cmd":["/nonexistent"]}"#);
    let resp = response(&output);
    assert_eq!(resp["status"], "internalError");
    assert!(resp["description"]
        .as_str()
        .unwrap()
        .starts_with("exec '/nonexistent'"));
    assert!(output.status.success(), "a delivered response exits zero");
}

#[test]
#[ignore = "needs unprivileged user namespaces and a delegated cgroup v2 subtree"]
fn captured_stdout_lands_in_destination() {
    let dir = tempfile::tempdir().unwrap();
    let dest = dir.path().join("out");
    let request = format!(
        r#"{{"cmd":["/bin/sh","-c","echo hello"],"pipes":[{{"dest":"{}","stdout":true}}]}}"#,
        dest.display()
    );
    let output = run_sandals(&request);
    let resp = response(&output);
    assert_eq!(resp["status"], "exited");
    assert_eq!(std::fs::read_to_string(&dest).unwrap(), "hello\n");
}

#[test]
#[ignore = "needs unprivileged user namespaces and a delegated cgroup v2 subtree"]
fn overrunning_sink_reports_output_limit() {
    let dir = tempfile::tempdir().unwrap();
    let fifo = dir.path().join("p");
    let dest = dir.path().join("out");
    let request = format!(
        r#"{{"cmd":["/bin/sh","-c","yes | head -c 1000 > {fifo}"],
            "pipes":[{{"src":"{fifo}","dest":"{dest}","limit":100}}]}}"#,
        fifo = fifo.display(),
        dest = dest.display()
    );
    let output = run_sandals(&request);
    assert_eq!(status_of(&output), "outputLimit");
    let written = std::fs::metadata(&dest).unwrap().len();
    assert!(written <= 100, "sink wrote {} bytes past its limit", written);
}

#[test]
#[ignore = "needs unprivileged user namespaces and a delegated cgroup v2 subtree"]
fn sink_filled_to_exactly_its_limit_is_fine() {
    let dir = tempfile::tempdir().unwrap();
    let dest = dir.path().join("out");
    let request = format!(
        r#"{{"cmd":["/bin/sh","-c","printf abcde"],"pipes":[{{"dest":"{}","stdout":true,"limit":5}}]}}"#,
        dest.display()
    );
    let output = run_sandals(&request);
    let resp = response(&output);
    assert_eq!(resp["status"], "exited");
    assert_eq!(std::fs::read_to_string(&dest).unwrap(), "abcde");
}

#[test]
#[ignore = "needs unprivileged user namespaces and a delegated cgroup v2 subtree"]
fn fork_bomb_hits_pids_limit() {
    let output = run_sandals(
        r#"{"cmd":["/bin/sh","-c",":(){ :|:& };:"],"cgroupConfig":{"pids.max":"32"}}"#,
    );
    assert_eq!(status_of(&output), "pidsLimit");
}

#[test]
#[ignore = "needs unprivileged user namespaces and a delegated cgroup v2 subtree"]
fn deterministic_payload_is_repeatable() {
    let request = r#"{"cmd":["/bin/sh","-c","exit 3"]}"#;
    let first = response(&run_sandals(request));
    let second = response(&run_sandals(request));
    assert_eq!(first, second);
}
