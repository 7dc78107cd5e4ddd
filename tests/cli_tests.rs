// Exit-code behaviour of the `vsock-sample` binary.

use std::process::{Command, Output};

fn run(args: &[&str]) -> Output {
    Command::new(env!("CARGO_BIN_EXE_vsock-sample"))
        .args(args)
        .env("RUST_LOG", "info")
        .output()
        .expect("binary runs")
}

#[test]
fn no_mode_prints_usage_and_fails() {
    let output = run(&[]);
    assert_eq!(output.status.code(), Some(1));
    let stderr = String::from_utf8_lossy(&output.stderr);
    assert!(stderr.contains("Usage"), "stderr: {stderr}");
    assert!(output.stdout.is_empty());
}

#[test]
fn version_flag_reports_package_version() {
    let output = run(&["--version"]);
    assert!(output.status.success());
    let stdout = String::from_utf8_lossy(&output.stdout);
    assert_eq!(stdout.trim(), format!("vsock-sample {}", env!("CARGO_PKG_VERSION")));
}

#[test]
fn server_with_missing_model_exits_before_listening() {
    let dir = tempfile::tempdir().unwrap();
    let missing = dir.path().join("no-such-model");

    let output = run(&["server", "5005", "--model-path", missing.to_str().unwrap()]);

    assert_eq!(output.status.code(), Some(1));
    let stderr = String::from_utf8_lossy(&output.stderr);
    assert!(stderr.contains("does not exist"), "stderr: {stderr}");
    assert!(!stderr.contains("listening"), "stderr: {stderr}");
}

#[test]
fn server_with_unreadable_manifest_exits_before_listening() {
    let dir = tempfile::tempdir().unwrap();
    std::fs::write(dir.path().join("generator.json"), "not json").unwrap();

    let output = run(&["server", "5005", "--model-path", dir.path().to_str().unwrap()]);

    assert_eq!(output.status.code(), Some(1));
    let stderr = String::from_utf8_lossy(&output.stderr);
    assert!(!stderr.contains("listening"), "stderr: {stderr}");
}

#[test]
fn client_rejects_out_of_range_port() {
    let output = run(&["client", "3", "0"]);
    assert!(!output.status.success());

    let output = run(&["client", "3", "70000"]);
    assert!(!output.status.success());
}

#[test]
fn client_rejects_non_numeric_cid() {
    let output = run(&["client", "host", "5005"]);
    assert!(!output.status.success());
    assert!(output.stdout.is_empty());
}
