#![allow(missing_docs)]

use std::path::Path;

use assert_cmd::cargo::cargo_bin_cmd;
use serde_json::Value;
use tempfile::TempDir;

fn run_json(dir: &Path, args: &[&str]) -> Value {
    let output = cargo_bin_cmd!("arclog")
        .env_remove("RUST_LOG")
        .arg("--dir")
        .arg(dir)
        .args(["--page-size", "1024", "--format", "json"])
        .args(args)
        .assert()
        .success()
        .get_output()
        .stdout
        .clone();
    serde_json::from_slice(&output).expect("valid json")
}

#[test]
fn create_then_info_reports_geometry() {
    let dir = TempDir::new().expect("tempdir");
    run_json(dir.path(), &["--active-pages", "32", "create"]);
    assert!(dir.path().join("arclog_lgat").exists());

    let info = run_json(dir.path(), &["info"]);
    assert_eq!(info["page_size"], 1024);
    assert_eq!(info["active_pages"], 32);
    assert_eq!(info["prefix"], "arclog");
    assert!(info["stats"]["records_appended"].is_number());
}

#[test]
fn append_then_scan_lists_every_record() {
    let dir = TempDir::new().expect("tempdir");
    let report = run_json(
        dir.path(),
        &["append", "--threads", "2", "--records", "50", "--size", "64"],
    );
    assert_eq!(report["records"], 100);
    assert_eq!(report["bytes"], 6400);

    let scan = run_json(dir.path(), &["scan"]);
    let records = scan.as_array().expect("scan array");
    assert_eq!(records.len(), 102);
    let commits = records
        .iter()
        .filter(|r| r["rectype"] == "Commit")
        .count();
    assert_eq!(commits, 2);

    let limited = run_json(dir.path(), &["scan", "--from", "0:0", "--limit", "5"]);
    assert_eq!(limited.as_array().map(Vec::len), Some(5));
}

#[test]
fn commit_payload_is_visible_in_page_dump() {
    let dir = TempDir::new().expect("tempdir");
    let commit = run_json(dir.path(), &["commit", "hello"]);
    assert!(commit["commit_lsa"]["page_id"].is_number());

    let page = run_json(dir.path(), &["dump-page", "0"]);
    assert_eq!(page["page_id"], 0);
    assert_eq!(page["checksum_ok"], true);
    let body = page["body_hex"].as_str().expect("hex body");
    assert!(body.contains(&hex::encode(b"hello")));
}

#[test]
fn archive_checkpoint_and_pull_round_trip() {
    let dir = TempDir::new().expect("tempdir");
    run_json(
        dir.path(),
        &["append", "--threads", "1", "--records", "120", "--size", "100"],
    );

    let entry = run_json(dir.path(), &["archive"]);
    assert_eq!(entry["first_page_id"], 0);
    assert!(entry["last_page_id"].as_i64().unwrap_or(-1) >= 1);
    let archives = run_json(dir.path(), &["archives"]);
    assert_eq!(archives.as_array().map(Vec::len), Some(1));

    let checkpoint = run_json(dir.path(), &["checkpoint"]);
    assert_eq!(checkpoint["active_transactions"], 0);

    let pull = run_json(dir.path(), &["pull", "--first", "0", "--compressed"]);
    assert!(matches!(pull["status"].as_str(), Some("Done") | Some("Delayed")));
    assert!(pull["page_count"].as_i64().unwrap_or(0) >= 1);
}

#[test]
fn invalid_geometry_fails_with_message() {
    let dir = TempDir::new().expect("tempdir");
    let assert = cargo_bin_cmd!("arclog")
        .arg("--dir")
        .arg(dir.path())
        .args(["--page-size", "3000", "info"])
        .assert()
        .failure();
    let stderr = String::from_utf8_lossy(&assert.get_output().stderr).to_string();
    assert!(stderr.contains("error:"), "stderr was {stderr}");
    assert!(stderr.contains("page_size"));
}
