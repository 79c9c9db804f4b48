//! CLI smoke tests that run without a nix installation.

use std::process::Command;

/// Get the path to the lode binary.
fn lode_bin() -> String {
    std::env::var("CARGO_BIN_EXE_lode").unwrap_or_else(|_| "target/debug/lode".to_string())
}

fn run_lode(args: &[&str]) -> (bool, String, String) {
    let output = Command::new(lode_bin())
        .args(args)
        .output()
        .expect("failed to run lode");
    (
        output.status.success(),
        String::from_utf8_lossy(&output.stdout).to_string(),
        String::from_utf8_lossy(&output.stderr).to_string(),
    )
}

#[test]
fn cli_help() {
    let (ok, stdout, _) = run_lode(&["--help"]);
    assert!(ok);
    assert!(stdout.contains("lode"));
    assert!(stdout.contains("build"));
}

#[test]
fn build_help_lists_lock_file_flags() {
    let (ok, stdout, _) = run_lode(&["build", "--help"]);
    assert!(ok);
    assert!(stdout.contains("--recreate-lock-file"));
    assert!(stdout.contains("--no-save-lock-file"));
    assert!(stdout.contains("--no-registries"));
    assert!(stdout.contains("--dry-run"));
    assert!(stdout.contains("--file"));
}

#[test]
fn dry_run_and_no_build_conflict() {
    let (ok, _, stderr) = run_lode(&["build", "--dry-run", "--no-build", "."]);
    assert!(!ok);
    assert!(stderr.contains("cannot be used with"), "{}", stderr);
}

#[test]
fn completion_generates_script() {
    let (ok, stdout, _) = run_lode(&["completion", "bash"]);
    assert!(ok);
    assert!(stdout.contains("lode"));
}
