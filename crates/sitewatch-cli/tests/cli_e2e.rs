//! End-to-end checks of the binary's startup validation and exit codes.

use std::process::Command;

fn sitewatch() -> Command {
    Command::new(env!("CARGO_BIN_EXE_sitewatch"))
}

#[test]
fn missing_token_is_a_fatal_startup_error() {
    let output = sitewatch()
        .env_remove("TELEGRAM_TOKEN")
        .arg("--db")
        .arg(tempfile::tempdir().expect("tempdir").path().join("watch.json"))
        .output()
        .expect("run binary");

    assert!(!output.status.success());
    let stderr = String::from_utf8_lossy(&output.stderr);
    assert!(stderr.contains("TELEGRAM_TOKEN"), "stderr was: {stderr}");
}

#[test]
fn empty_token_is_a_fatal_startup_error() {
    let output = sitewatch()
        .env("TELEGRAM_TOKEN", "   ")
        .output()
        .expect("run binary");
    assert!(!output.status.success());
}

#[test]
fn malformed_admin_id_is_a_fatal_startup_error() {
    let output = sitewatch()
        .env("TELEGRAM_TOKEN", "123:abc")
        .env("ADMIN_ID", "not-a-number")
        .output()
        .expect("run binary");

    assert!(!output.status.success());
    let stderr = String::from_utf8_lossy(&output.stderr);
    assert!(stderr.contains("ADMIN_ID"), "stderr was: {stderr}");
}

#[test]
fn help_exits_cleanly() {
    let output = sitewatch().arg("--help").output().expect("run binary");
    assert!(output.status.success());
    let stdout = String::from_utf8_lossy(&output.stdout);
    assert!(stdout.contains("--db"));
    assert!(stdout.contains("--patrol-interval"));
}
