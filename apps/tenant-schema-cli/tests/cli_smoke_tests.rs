#![allow(clippy::unwrap_used, clippy::expect_used)]

//! Runs the compiled `tenant-schema` binary against the in-memory backend.

use std::io::Write;
use std::process::{Command, Output};

fn tenant_schema(args: &[&str]) -> Output {
    Command::new(env!("CARGO_BIN_EXE_tenant-schema"))
        .args(args)
        .env_remove("RUST_LOG")
        .output()
        .expect("failed to run tenant-schema")
}

fn stdout(output: &Output) -> String {
    String::from_utf8_lossy(&output.stdout).into_owned()
}

#[test]
fn help_lists_every_command() {
    let out = tenant_schema(&["--help"]);
    assert!(out.status.success());
    let help = stdout(&out);
    for command in ["migrate", "validate", "heal", "advise", "pending", "check"] {
        assert!(help.contains(command), "missing {command} in:\n{help}");
    }
}

#[test]
fn version_is_printed() {
    let out = tenant_schema(&["--version"]);
    assert!(out.status.success());
    assert!(stdout(&out).contains(env!("CARGO_PKG_VERSION")));
}

#[test]
fn check_against_the_mock_backend() {
    let out = tenant_schema(&["--mock", "check"]);
    assert_eq!(out.status.code(), Some(0), "{}", String::from_utf8_lossy(&out.stderr));
    assert!(stdout(&out).contains("memory"));
}

#[test]
fn setup_bootstraps_the_shared_namespace() {
    let out = tenant_schema(&["--mock", "migrate", "setup"]);
    assert_eq!(out.status.code(), Some(0), "{}", String::from_utf8_lossy(&out.stderr));
}

#[test]
fn tenant_migration_reports_json() {
    let out = tenant_schema(&["--mock", "--json", "migrate", "tenant", "acme"]);
    assert_eq!(out.status.code(), Some(0), "{}", String::from_utf8_lossy(&out.stderr));

    let report: serde_json::Value = serde_json::from_slice(&out.stdout).unwrap();
    assert_eq!(report["namespace"], "tenant_acme");
    assert_eq!(report["created"], true);
    assert_eq!(report["migration"]["applied"], 6);
}

#[test]
fn pending_lists_every_version_for_a_new_tenant() {
    let out = tenant_schema(&["--mock", "--json", "pending", "acme"]);
    assert_eq!(out.status.code(), Some(0));
    let pending: Vec<u32> = serde_json::from_slice(&out.stdout).unwrap();
    assert_eq!(pending, [1, 2, 3, 4, 5, 6]);
}

#[test]
fn unknown_tenant_fails_validation() {
    let out = tenant_schema(&["--mock", "--json", "validate", "ghost"]);
    assert_eq!(out.status.code(), Some(1));
    let body: serde_json::Value = serde_json::from_slice(&out.stdout).unwrap();
    assert_eq!(body["ok"], false);
}

#[test]
fn missing_config_file_is_a_usage_error() {
    let out = tenant_schema(&["--config", "/definitely/not/here.yaml", "--mock", "check"]);
    assert_eq!(out.status.code(), Some(2));
}

#[test]
fn unknown_config_key_is_a_usage_error() {
    let mut file = tempfile::NamedTempFile::new().unwrap();
    writeln!(file, "lock_timeout: 5s\nnot_a_setting: true").unwrap();

    let path = file.path().to_str().unwrap();
    let out = tenant_schema(&["--config", path, "--mock", "check"]);
    assert_eq!(out.status.code(), Some(2));
    assert!(String::from_utf8_lossy(&out.stderr).contains("not_a_setting"));
}

#[test]
fn unknown_subcommand_is_a_usage_error() {
    let out = tenant_schema(&["frobnicate"]);
    assert_eq!(out.status.code(), Some(2));
}
