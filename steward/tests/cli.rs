//! CLI tests: spawn the steward binary and check exit codes.

use std::process::Command;

use steward::exit_codes;
use steward::io::audit::{LedgerEvent, read_jsonl};
use steward::io::init::StewardPaths;
use steward::test_support::TestProject;
use walkdir::WalkDir;

fn steward(root: &std::path::Path, args: &[&str]) -> std::process::Output {
    Command::new(env!("CARGO_BIN_EXE_steward"))
        .current_dir(root)
        .args(args)
        .output()
        .expect("run steward")
}

#[test]
fn init_then_empty_instruction_is_cancelled() {
    let temp = tempfile::tempdir().expect("tempdir");
    assert_eq!(steward(temp.path(), &["init"]).status.code(), Some(exit_codes::OK));

    let out = steward(temp.path(), &["implement", "-m", "   "]);

    assert_eq!(out.status.code(), Some(exit_codes::CANCELLED));
    let paths = StewardPaths::new(temp.path());
    let (events, _) = read_jsonl::<LedgerEvent>(&paths.events_path).expect("events");
    assert_eq!(events.len(), 1);
}

#[test]
fn second_init_without_force_fails() {
    let temp = tempfile::tempdir().expect("tempdir");
    assert_eq!(steward(temp.path(), &["init"]).status.code(), Some(exit_codes::OK));

    assert_eq!(
        steward(temp.path(), &["init"]).status.code(),
        Some(exit_codes::INVALID)
    );
    assert_eq!(
        steward(temp.path(), &["init", "--force"]).status.code(),
        Some(exit_codes::OK)
    );
}

#[test]
fn exec_outside_sandbox_is_blocked() {
    let temp = tempfile::tempdir().expect("tempdir");
    steward(temp.path(), &["init"]);

    let out = steward(temp.path(), &["exec", "../../etc/passwd"]);

    assert_eq!(out.status.code(), Some(exit_codes::EXECUTION_BLOCKED));
    assert!(String::from_utf8_lossy(&out.stderr).contains("outside_sandbox"));
}

#[test]
fn uninitialized_root_is_invalid() {
    let temp = tempfile::tempdir().expect("tempdir");

    let out = steward(temp.path(), &["report"]);

    assert_eq!(out.status.code(), Some(exit_codes::INVALID));
    assert!(String::from_utf8_lossy(&out.stderr).contains("steward init"));
}

#[test]
fn report_and_manifest_work_on_a_fresh_project() {
    let temp = tempfile::tempdir().expect("tempdir");
    steward(temp.path(), &["init"]);

    let report = steward(temp.path(), &["report", "--today"]);
    assert_eq!(report.status.code(), Some(exit_codes::OK));
    assert!(String::from_utf8_lossy(&report.stdout).contains("transactions"));

    let manifest = steward(temp.path(), &["--root", ".", "manifest"]);
    assert_eq!(manifest.status.code(), Some(exit_codes::OK));
    let printed = String::from_utf8_lossy(&manifest.stdout);
    assert!(printed.trim_end().ends_with("_manifest.json"));
}

#[test]
fn exec_output_is_mirrored_in_the_transcript() {
    let project = TestProject::new();
    let script = project.write_script("hello.sh", "echo hello-from-script\n");

    let out = steward(project.root(), &["exec", &script]);

    assert_eq!(out.status.code(), Some(exit_codes::OK));
    assert!(String::from_utf8_lossy(&out.stdout).contains("hello-from-script"));
    let transcript = WalkDir::new(&project.paths.sessions_dir)
        .into_iter()
        .filter_map(|entry| entry.ok())
        .find(|entry| entry.file_name() == "transcript.log")
        .expect("transcript file");
    let logged = std::fs::read_to_string(transcript.path()).expect("read transcript");
    assert!(logged.contains("--- stdout ---\nhello-from-script"));
}

#[test]
fn status_outside_git_reports_it() {
    let temp = tempfile::tempdir().expect("tempdir");
    steward(temp.path(), &["init"]);

    let out = steward(temp.path(), &["status"]);

    assert_eq!(out.status.code(), Some(exit_codes::OK));
    assert!(String::from_utf8_lossy(&out.stdout).contains("not a git repository"));
}
