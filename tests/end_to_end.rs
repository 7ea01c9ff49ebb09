//! End-to-end fault scenarios from §8, run out-of-process since the fault
//! path calls `std::process::exit` (§2d).

use std::process::Command;

const FAULT_EXIT_CODE: i32 = 66;

fn run(scenario: &str) -> std::process::Output {
    Command::new(env!("CARGO_BIN_EXE_asan-demo"))
        .arg("--scenario")
        .arg(scenario)
        .output()
        .expect("failed to spawn asan-demo")
}

#[test]
fn heap_overrun_exits_66_with_diagnostic() {
    let output = run("heap-overrun");
    assert_eq!(output.status.code(), Some(FAULT_EXIT_CODE));
    let stderr = String::from_utf8_lossy(&output.stderr);
    assert!(stderr.contains("heap overrun"), "stderr was: {stderr}");
    assert!(stderr.contains("1-byte store"), "stderr was: {stderr}");
}

#[test]
fn double_free_exits_66_with_diagnostic() {
    let output = run("double-free");
    assert_eq!(output.status.code(), Some(FAULT_EXIT_CODE));
    let stderr = String::from_utf8_lossy(&output.stderr);
    assert!(stderr.contains("heap double free"), "stderr was: {stderr}");
}

#[test]
fn use_after_free_exits_66_with_diagnostic() {
    let output = run("use-after-free");
    assert_eq!(output.status.code(), Some(FAULT_EXIT_CODE));
    let stderr = String::from_utf8_lossy(&output.stderr);
    assert!(stderr.contains("heap use after free"), "stderr was: {stderr}");
    assert!(stderr.contains("1-byte load"), "stderr was: {stderr}");
}

#[test]
fn use_after_relocate_exits_66_with_diagnostic() {
    let output = run("use-after-relocate");
    assert_eq!(output.status.code(), Some(FAULT_EXIT_CODE));
    let stderr = String::from_utf8_lossy(&output.stderr);
    assert!(stderr.contains("heap use after relocate"), "stderr was: {stderr}");
}

#[test]
fn calloc_overflow_succeeds_with_no_fault() {
    let output = run("calloc-overflow");
    assert_eq!(output.status.code(), Some(0));
    let stdout = String::from_utf8_lossy(&output.stdout);
    assert!(stdout.contains("calloc overflow returned null"), "stdout was: {stdout}");
}

#[test]
fn off_by_one_overrun_exits_66_with_diagnostic() {
    let output = run("off-by-one-overrun");
    assert_eq!(output.status.code(), Some(FAULT_EXIT_CODE));
    let stderr = String::from_utf8_lossy(&output.stderr);
    assert!(stderr.contains("heap overrun"), "stderr was: {stderr}");
}
