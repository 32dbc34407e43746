//! The `sum` binary end to end.

#![cfg(all(target_arch = "x86_64", unix))]

use std::path::Path;
use std::process::{Command, Output};

fn sum(dir: &Path, args: &[&str]) -> Output {
    Command::new(env!("CARGO_BIN_EXE_sum"))
        .args(args)
        .current_dir(dir)
        .env_remove("RUST_LOG")
        .output()
        .unwrap()
}

fn stdout(output: &Output) -> String {
    String::from_utf8_lossy(&output.stdout).into_owned()
}

#[test]
fn test_prints_sum_and_writes_bitcode() {
    let dir = tempfile::tempdir().unwrap();
    let output = sum(dir.path(), &["3", "4"]);
    assert_eq!(output.status.code(), Some(0));
    assert_eq!(stdout(&output), "7\n");

    let module = minijit::bitcode::read(&dir.path().join("sum.bc")).unwrap();
    assert!(module.get_function("wrap").is_some());
}

#[test]
fn test_wraps_at_32_bits() {
    let dir = tempfile::tempdir().unwrap();
    let output = sum(dir.path(), &["2147483647", "1"]);
    assert_eq!(output.status.code(), Some(0));
    assert_eq!(stdout(&output), "-2147483648\n");
}

#[test]
fn test_negative_arguments() {
    let dir = tempfile::tempdir().unwrap();
    let output = sum(dir.path(), &["-5", "5"]);
    assert_eq!(output.status.code(), Some(0));
    assert_eq!(stdout(&output), "0\n");
}

#[test]
fn test_usage_errors_exit_1() {
    let dir = tempfile::tempdir().unwrap();
    for args in [&["1"][..], &["a", "b"], &["1", "2", "3"]] {
        let output = sum(dir.path(), args);
        assert_eq!(output.status.code(), Some(1), "{args:?}");
        assert!(output.stdout.is_empty(), "{args:?}");
        assert!(!output.stderr.is_empty(), "{args:?}");
    }
    assert!(!dir.path().join("sum.bc").exists());
}

#[test]
fn test_unwritable_output_is_not_fatal() {
    let dir = tempfile::tempdir().unwrap();
    let output = sum(dir.path(), &["3", "4", "-o", "/nonexistent/x.bc"]);
    assert_eq!(output.status.code(), Some(0));
    assert_eq!(stdout(&output), "7\n");
    let stderr = String::from_utf8_lossy(&output.stderr);
    assert!(stderr.contains("error writing bitcode"), "{stderr}");
}
