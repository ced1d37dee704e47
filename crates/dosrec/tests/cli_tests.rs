//! CLI integration tests for dosrec.
//!
//! Each test writes its program image (and manifest or library, if any) to a
//! temporary directory and runs the built binary on it.

use std::fs;
use std::path::{Path, PathBuf};
use std::process::{Command, Output};

use tempfile::TempDir;

/// `call 0004 ; ret ; ret`
const TWO_FUNCTIONS: &[u8] = &[0xE8, 0x01, 0x00, 0xC3, 0xC3];

fn dosrec_bin() -> &'static str {
    env!("CARGO_BIN_EXE_dosrec")
}

fn run_dosrec(args: &[&str]) -> Output {
    Command::new(dosrec_bin())
        .args(args)
        .output()
        .expect("Failed to execute dosrec")
}

fn write_file(dir: &TempDir, name: &str, contents: &[u8]) -> PathBuf {
    let path = dir.path().join(name);
    fs::write(&path, contents).expect("Failed to write fixture");
    path
}

fn path_arg(path: &Path) -> &str {
    path.to_str().expect("temp path is not UTF-8")
}

// =============================================================================
// Basic Command Tests
// =============================================================================

#[test]
fn test_help() {
    let output = run_dosrec(&["--help"]);
    assert!(output.status.success(), "dosrec --help should succeed");
    let stdout = String::from_utf8_lossy(&output.stdout);
    assert!(stdout.contains("real-mode"), "Help should describe the tool");
    assert!(stdout.contains("--manifest"), "Help should show --manifest");
    assert!(stdout.contains("--skip-pass"), "Help should show --skip-pass");
}

#[test]
fn test_missing_image() {
    let output = run_dosrec(&["/nonexistent/prog.bin"]);
    assert!(!output.status.success());
    let stderr = String::from_utf8_lossy(&output.stderr);
    assert!(stderr.contains("Failed to read image"), "stderr: {}", stderr);
}

#[test]
fn test_unknown_pass_is_rejected() {
    let dir = TempDir::new().unwrap();
    let image = write_file(&dir, "prog.bin", TWO_FUNCTIONS);
    let output = run_dosrec(&[path_arg(&image), "--skip-pass", "bogus"]);
    assert!(!output.status.success());
    let stderr = String::from_utf8_lossy(&output.stderr);
    assert!(stderr.contains("unknown pass"), "stderr: {}", stderr);
}

// =============================================================================
// Output Formats
// =============================================================================

#[test]
fn test_listing() {
    let dir = TempDir::new().unwrap();
    let image = write_file(&dir, "prog.bin", TWO_FUNCTIONS);
    let output = run_dosrec(&[path_arg(&image)]);
    assert!(output.status.success());

    let stdout = String::from_utf8_lossy(&output.stdout);
    assert!(stdout.contains("sub_0 proc"));
    assert!(stdout.contains("sub_1 proc"));
    assert!(stdout.contains("; 2 functions (0 library), 1 call edges"));
}

#[test]
fn test_json_output() {
    let dir = TempDir::new().unwrap();
    let image = write_file(&dir, "prog.bin", TWO_FUNCTIONS);
    let output = run_dosrec(&[path_arg(&image), "--json"]);
    assert!(output.status.success());

    let report: serde_json::Value =
        serde_json::from_slice(&output.stdout).expect("stdout is not JSON");
    assert_eq!(report["functions"].as_array().map(Vec::len), Some(2));
    assert_eq!(report["calls"].as_array().map(Vec::len), Some(1));
    assert_eq!(report["stats"]["functions_built"], 2);
}

#[test]
fn test_dot_output() {
    let dir = TempDir::new().unwrap();
    let image = write_file(&dir, "prog.bin", TWO_FUNCTIONS);
    let output = run_dosrec(&[path_arg(&image), "--dot"]);
    assert!(output.status.success());

    let stdout = String::from_utf8_lossy(&output.stdout);
    assert!(stdout.starts_with("digraph"));
    assert!(stdout.contains("subgraph \"cluster_0_0000\""));
    assert!(stdout.contains("\"f0\" -> \"f1\";"));
}

#[test]
fn test_flow_output() {
    let dir = TempDir::new().unwrap();
    let image = write_file(&dir, "prog.bin", TWO_FUNCTIONS);
    let output = run_dosrec(&[path_arg(&image), "--flow", "sub_0"]);
    assert!(output.status.success());

    let stdout = String::from_utf8_lossy(&output.stdout);
    assert!(stdout.starts_with("digraph \"sub_0\""));
    assert!(stdout.contains("\"b0000\""));

    let missing = run_dosrec(&[path_arg(&image), "--flow", "nope"]);
    assert!(!missing.status.success());
    assert!(String::from_utf8_lossy(&missing.stderr).contains("no function named nope"));
}

#[test]
fn test_entry_override() {
    let dir = TempDir::new().unwrap();
    let image = write_file(&dir, "prog.bin", TWO_FUNCTIONS);
    let output = run_dosrec(&[path_arg(&image), "--entry", "1000:0004"]);
    assert!(output.status.success());

    let stdout = String::from_utf8_lossy(&output.stdout);
    assert!(stdout.contains("1000:0004"));
    assert!(stdout.contains("; 1 functions"));
}

// =============================================================================
// Manifests and Libraries
// =============================================================================

#[test]
fn test_manifest_with_overlay() {
    let dir = TempDir::new().unwrap();
    // resident: int 3Fh -> overlay 1:0000 ; ret    overlay: retf
    write_file(&dir, "prog.bin", &[0xCD, 0x3F, 0x01, 0x00, 0x00, 0xC3, 0xCB]);
    let manifest = write_file(
        &dir,
        "prog.json",
        br#"{
            "images": ["prog.bin"],
            "segments": [
                { "segment": "1000", "start": 0, "length": 6 },
                { "overlay": 1, "segment": "0000", "start": 6, "length": 1 }
            ],
            "entry_points": [{ "address": "1000:0000" }]
        }"#,
    );
    let output = run_dosrec(&[path_arg(&manifest), "--manifest", "--json"]);
    assert!(
        output.status.success(),
        "stderr: {}",
        String::from_utf8_lossy(&output.stderr)
    );

    let report: serde_json::Value = serde_json::from_slice(&output.stdout).unwrap();
    assert_eq!(report["functions"].as_array().map(Vec::len), Some(2));
    assert_eq!(report["calls"][0]["kind"], "Overlay");
}

#[test]
fn test_library_binding() {
    let dir = TempDir::new().unwrap();
    // call 0004 ; ret ; push bp ; mov bp,sp ; pop bp ; ret
    let image = write_file(
        &dir,
        "prog.bin",
        &[0xE8, 0x01, 0x00, 0xC3, 0x55, 0x8B, 0xEC, 0x5D, 0xC3],
    );
    let library = write_file(
        &dir,
        "clib.json",
        br#"{
            "name": "clib",
            "modules": [{
                "name": "STRLEN",
                "segments": [{
                    "name": "_TEXT", "class": "CODE",
                    "data": "55 8B EC 5D C3",
                    "publics": [{ "name": "_strlen", "offset": 0 }]
                }]
            }]
        }"#,
    );
    let output = run_dosrec(&[path_arg(&image), "--library", path_arg(&library)]);
    assert!(
        output.status.success(),
        "stderr: {}",
        String::from_utf8_lossy(&output.stderr)
    );

    let stdout = String::from_utf8_lossy(&output.stdout);
    assert!(stdout.contains("_strlen proc"));
    assert!(stdout.contains("; library module STRLEN"));
    assert!(stdout.contains("(1 library)"));
}
