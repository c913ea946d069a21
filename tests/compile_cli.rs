use std::fs;
use std::path::Path;
use std::process::Command;

fn quillc() -> Command {
    Command::new(env!("CARGO_BIN_EXE_quillc"))
}

fn write_source(dir: &Path, name: &str, source: &str) -> std::path::PathBuf {
    let path = dir.join(name);
    fs::write(&path, source).expect("failed to write source file");
    path
}

// --- Compiling a single source file ---

#[test]
fn compiles_extended_binary_by_default() {
    let dir = tempfile::tempdir().unwrap();
    let src = write_source(dir.path(), "t.q", "script 1 () { print(\"hi\"); }");
    let out = quillc().arg(&src).output().expect("failed to run quillc");
    assert!(out.status.success(), "stderr: {}", String::from_utf8_lossy(&out.stderr));
    let bytes = fs::read(dir.path().join("t.qvm")).expect("expected t.qvm next to the source");
    assert_eq!(&bytes[0..4], b"QVME");
}

#[test]
fn plain_target_is_word_aligned() {
    let dir = tempfile::tempdir().unwrap();
    let src = write_source(dir.path(), "t.q", "script 1 () { suspend; }");
    let out = quillc()
        .args([src.to_str().unwrap(), "--target", "plain"])
        .output()
        .expect("failed to run quillc");
    assert!(out.status.success(), "stderr: {}", String::from_utf8_lossy(&out.stderr));
    let bytes = fs::read(dir.path().join("t.qvm")).unwrap();
    assert_eq!(&bytes[0..4], b"QVM0");
    assert_eq!(bytes.len() % 4, 0, "plain output must be a whole number of words");
}

#[test]
fn output_flag_overrides_the_default_path() {
    let dir = tempfile::tempdir().unwrap();
    let src = write_source(dir.path(), "t.q", "script 1 () { terminate; }");
    let dest = dir.path().join("custom.bin");
    let out = quillc()
        .args([src.to_str().unwrap(), "-o", dest.to_str().unwrap()])
        .output()
        .expect("failed to run quillc");
    assert!(out.status.success(), "stderr: {}", String::from_utf8_lossy(&out.stderr));
    assert!(dest.exists());
    assert!(!dir.path().join("t.qvm").exists());
}

#[test]
fn no_opt_keeps_dead_pushes() {
    let dir = tempfile::tempdir().unwrap();
    let src = write_source(dir.path(), "t.q", "script 1 () { 5; suspend; }");
    let optimized = dir.path().join("opt.qvm");
    let plain = dir.path().join("raw.qvm");
    let out = quillc()
        .args([src.to_str().unwrap(), "-o", optimized.to_str().unwrap()])
        .output()
        .expect("failed to run quillc");
    assert!(out.status.success(), "stderr: {}", String::from_utf8_lossy(&out.stderr));
    let out = quillc()
        .args([src.to_str().unwrap(), "--no-opt", "-o", plain.to_str().unwrap()])
        .output()
        .expect("failed to run quillc");
    assert!(out.status.success(), "stderr: {}", String::from_utf8_lossy(&out.stderr));
    let optimized = fs::read(optimized).unwrap();
    let plain = fs::read(plain).unwrap();
    assert!(plain.len() > optimized.len());
}

// --- AST dump ---

#[test]
fn emit_ast_prints_json() {
    let dir = tempfile::tempdir().unwrap();
    let src = write_source(dir.path(), "t.q", "static int x = 7;");
    let out = quillc()
        .args([src.to_str().unwrap(), "--emit-ast"])
        .output()
        .expect("failed to run quillc");
    assert!(out.status.success(), "stderr: {}", String::from_utf8_lossy(&out.stderr));
    let v: serde_json::Value = serde_json::from_slice(&out.stdout)
        .unwrap_or_else(|_| panic!("expected JSON, got: {}", String::from_utf8_lossy(&out.stdout)));
    assert!(v["declarations"].as_array().is_some_and(|d| !d.is_empty()));
}

// --- Objects and linking ---

#[test]
fn object_files_carry_their_own_magic() {
    let dir = tempfile::tempdir().unwrap();
    let src = write_source(dir.path(), "t.q", "script 1 () { terminate; }");
    let out = quillc()
        .args([src.to_str().unwrap(), "-c"])
        .output()
        .expect("failed to run quillc");
    assert!(out.status.success(), "stderr: {}", String::from_utf8_lossy(&out.stderr));
    let bytes = fs::read(dir.path().join("t.qo")).unwrap();
    assert_eq!(&bytes[0..4], b"QOBJ");
}

#[test]
fn links_two_objects_into_one_binary() {
    let dir = tempfile::tempdir().unwrap();
    let lib = write_source(dir.path(), "lib.q", "function int answer() { return 41; }");
    let app = write_source(dir.path(), "app.q", "script 1 () { suspend; }");
    for src in [&lib, &app] {
        let out = quillc()
            .args([src.to_str().unwrap(), "-c"])
            .output()
            .expect("failed to run quillc");
        assert!(out.status.success(), "stderr: {}", String::from_utf8_lossy(&out.stderr));
    }
    let merged = dir.path().join("game.qvm");
    let out = quillc()
        .args([
            dir.path().join("lib.qo").to_str().unwrap(),
            dir.path().join("app.qo").to_str().unwrap(),
            "-o",
            merged.to_str().unwrap(),
        ])
        .output()
        .expect("failed to run quillc");
    assert!(out.status.success(), "stderr: {}", String::from_utf8_lossy(&out.stderr));
    let bytes = fs::read(merged).unwrap();
    assert_eq!(&bytes[0..4], b"QVME");
}

#[test]
fn refuses_to_link_plain_sources() {
    let dir = tempfile::tempdir().unwrap();
    let a = write_source(dir.path(), "a.q", "script 1 () { terminate; }");
    let b = write_source(dir.path(), "b.q", "script 2 () { terminate; }");
    let out = quillc()
        .args([a.to_str().unwrap(), b.to_str().unwrap()])
        .output()
        .expect("failed to run quillc");
    assert!(!out.status.success());
    let stderr = String::from_utf8_lossy(&out.stderr);
    assert!(stderr.contains("object"), "expected link-input error, got: {stderr}");
}

// --- Diagnostics ---

#[test]
fn parse_error_names_the_file_and_line() {
    let dir = tempfile::tempdir().unwrap();
    let src = write_source(dir.path(), "broken.q", "script 1 () {\n    print(;\n}");
    let out = quillc().arg(&src).output().expect("failed to run quillc");
    assert!(!out.status.success());
    let stderr = String::from_utf8_lossy(&out.stderr);
    assert!(stderr.contains("broken.q:2:"), "expected location prefix, got: {stderr}");
    assert!(stderr.contains("error:"), "expected error severity, got: {stderr}");
}

#[test]
fn undeclared_variable_error_names_it() {
    let dir = tempfile::tempdir().unwrap();
    let src = write_source(dir.path(), "t.q", "script 1 () { print(ghost); }");
    let out = quillc().arg(&src).output().expect("failed to run quillc");
    assert!(!out.status.success());
    let stderr = String::from_utf8_lossy(&out.stderr);
    assert!(stderr.contains("ghost"), "expected the name in the message, got: {stderr}");
}

#[test]
fn json_flag_emits_machine_readable_errors() {
    let dir = tempfile::tempdir().unwrap();
    let src = write_source(dir.path(), "t.q", "script 1 () { print(ghost); }");
    let out = quillc()
        .args([src.to_str().unwrap(), "--json"])
        .output()
        .expect("failed to run quillc");
    assert!(!out.status.success());
    let stderr = String::from_utf8_lossy(&out.stderr);
    let v: serde_json::Value = serde_json::from_str(stderr.trim())
        .unwrap_or_else(|_| panic!("expected JSON on stderr, got: {stderr}"));
    assert_eq!(v["severity"], "error");
    assert!(v["labels"].as_array().is_some_and(|l| !l.is_empty()));
    assert_eq!(v["labels"][0]["line"], 1);
}

// --- Flags ---

#[test]
fn version_flag() {
    let out = quillc().arg("--version").output().expect("failed to run quillc");
    assert!(out.status.success());
    let stdout = String::from_utf8_lossy(&out.stdout);
    assert!(stdout.contains("quillc"), "expected version string, got: {stdout}");
}

#[test]
fn no_inputs_shows_usage() {
    let out = quillc().output().expect("failed to run quillc");
    assert!(!out.status.success());
    let stderr = String::from_utf8_lossy(&out.stderr);
    assert!(stderr.contains("Usage"), "expected usage message, got: {stderr}");
}
