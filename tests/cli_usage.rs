//! CLI argument handling tests.
//!
//! These spawn the built `bspcheck` binary and verify the usage
//! contract: both positional arguments are mandatory, and a bad job
//! file is a fatal error.

use std::fs;
use std::path::PathBuf;
use std::process::Command;

fn get_bspcheck_binary() -> PathBuf {
    let target_dir = std::env::var_os("CARGO_TARGET_DIR")
        .map(PathBuf::from)
        .unwrap_or_else(|| PathBuf::from(env!("CARGO_MANIFEST_DIR")).join("target"));

    let bin_name = if cfg!(windows) {
        "bspcheck.exe"
    } else {
        "bspcheck"
    };
    target_dir.join("debug").join(bin_name)
}

#[test]
fn test_missing_arguments_are_a_usage_error() {
    let bin = get_bspcheck_binary();
    if !bin.exists() {
        eprintln!("Skipping test: bspcheck binary not found at {:?}", bin);
        return;
    }

    let output = Command::new(&bin).output().expect("Failed to run bspcheck");
    assert!(!output.status.success());
    let stderr = String::from_utf8_lossy(&output.stderr);
    assert!(
        stderr.contains("Usage") || stderr.contains("usage"),
        "stderr: {}",
        stderr
    );

    // One positional argument is still not enough.
    let output = Command::new(&bin)
        .arg("job.toml")
        .output()
        .expect("Failed to run bspcheck");
    assert!(!output.status.success());
}

#[test]
fn test_unparsable_job_file_is_fatal() {
    let bin = get_bspcheck_binary();
    if !bin.exists() {
        eprintln!("Skipping test: bspcheck binary not found at {:?}", bin);
        return;
    }

    let dir = std::env::temp_dir().join("bspcheck_cli_badjob");
    fs::create_dir_all(&dir).ok();
    fs::write(dir.join("job.toml"), "this is [not valid toml").unwrap();

    let output = Command::new(&bin)
        .arg(dir.join("job.toml"))
        .arg(dir.join("out"))
        .output()
        .expect("Failed to run bspcheck");

    assert!(!output.status.success());
    fs::remove_dir_all(&dir).ok();
}
