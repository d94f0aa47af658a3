#![allow(missing_docs)]
use std::fs;
use std::path::Path;
use std::process::Command;

use assert_cmd::prelude::*;
use otpbox_core::crypto::to_hex;
use predicates::prelude::*;
use sha2::{Digest, Sha256};
use tempfile::tempdir;

fn otpbox(config: &Path) -> Command {
    let mut cmd = Command::cargo_bin("otpbox").expect("binary exists");
    cmd.arg("--config").arg(config);
    cmd
}

#[test]
fn test_config_init_and_show() {
    let temp_dir = tempdir().expect("tempdir");
    let config = temp_dir.path().join("otpbox.json");

    otpbox(&config).args(["config", "init"]).assert().success();
    assert!(config.exists());

    otpbox(&config)
        .args(["config", "init"])
        .assert()
        .failure()
        .stderr(predicate::str::contains("already exists"));
    otpbox(&config)
        .args(["config", "init", "--force"])
        .assert()
        .success();

    otpbox(&config)
        .args(["config", "show"])
        .assert()
        .success()
        .stdout(predicate::str::contains("\"page_delivery_timelimit_ms\": 80"))
        .stdout(predicate::str::contains("CryptoBox.v1.0.0"));
}

#[test]
fn test_image_create_and_info() {
    let temp_dir = tempdir().expect("tempdir");
    let config = temp_dir.path().join("otpbox.json");
    let image = temp_dir.path().join("image.otp");

    otpbox(&config)
        .args(["image", "create", "--size", "1", "--path"])
        .arg(&image)
        .assert()
        .success()
        .stdout(predicate::str::contains("256"));
    assert_eq!(fs::metadata(&image).expect("metadata").len(), 1024 * 1024);

    let expected = to_hex(&Sha256::digest(fs::read(&image).expect("read image")));
    otpbox(&config)
        .args(["image", "info", "--path"])
        .arg(&image)
        .assert()
        .success()
        .stdout(predicate::str::contains("Clusters:     256"))
        .stdout(predicate::str::contains(expected))
        .stdout(predicate::str::contains("No saved position"));
}

#[test]
fn test_image_info_on_missing_file_fails() {
    let temp_dir = tempdir().expect("tempdir");
    otpbox(&temp_dir.path().join("otpbox.json"))
        .args(["image", "info", "--path"])
        .arg(temp_dir.path().join("nothing.otp"))
        .assert()
        .failure()
        .stderr(predicate::str::contains("Error"));
}

#[test]
fn test_bench_loops_packages_back() {
    let temp_dir = tempdir().expect("tempdir");
    let dir = temp_dir.path();
    let config = dir.join("otpbox.json");
    let settings = serde_json::json!({
        "otp_image_path": dir.join("image.otp"),
        "otp_position_path": dir.join("position.json"),
        "backlog_dir": dir.join("backlog"),
        "aes_presend_keys_num": 8,
    });
    fs::write(&config, settings.to_string()).expect("write config");

    otpbox(&config)
        .args(["image", "create", "--size", "1"])
        .assert()
        .success();
    otpbox(&config)
        .args(["bench", "--packages", "50", "--size", "200", "--key-every", "16"])
        .assert()
        .success()
        .stdout(predicate::str::contains("Packages received: 50"))
        .stdout(predicate::str::contains("With key:          4"));
    assert!(dir.join("position.bench-a.json").exists());
}
