mod common;

use std::io::Write;
use std::path::PathBuf;
use std::process::{Command, Stdio};

use tmplcov::exec::Locals;
use tmplcov::isolate::{IsolatedReply, IsolatedRequest, Isolation};
use tmplcov::model::{CoverageResult, CoverageSummary, Permutation};
use tmplcov::runner::CoverageRunner;

fn bin() -> Command {
    Command::new(env!("CARGO_BIN_EXE_tmplcov"))
}

#[test]
fn subprocess_matches_in_process() {
    let source = common::read_fixture("products.html.erb");
    let (isolated, _a) = common::subprocess_runner();
    let (direct, _b) = common::in_process_runner();

    let via_child = isolated.run(&source, None, &Locals::new()).unwrap();
    let in_process = direct.run(&source, None, &Locals::new()).unwrap();

    assert!(!via_child.degraded);
    assert_eq!(via_child.outputs, in_process.outputs);
    assert_eq!(via_child.summary, in_process.summary);
    assert_eq!(via_child.line_hits, in_process.line_hits);
    assert_eq!(via_child.arm_hits, in_process.arm_hits);
}

#[test]
fn child_failure_degrades_to_zero_coverage() {
    let (mut config, _dir) = common::scratch_config();
    config.permutation_timeout_ms = 5_000;
    // `false` exits non-zero without reading its input.
    let runner = CoverageRunner::new(
        config,
        Isolation::Subprocess {
            program: PathBuf::from("false"),
        },
    );
    let result = runner
        .run("<% if a %>x<% else %>y<% end %>", None, &Locals::new())
        .unwrap();
    assert!(result.degraded);
    assert_eq!(result.outputs.len(), 1);
    assert!(!result.outputs[0].is_success());
    assert_eq!(result.summary, CoverageSummary::default());
    assert_eq!(result.branches.len(), 1);
}

#[test]
fn timeout_degrades_the_run() {
    let (mut config, _dir) = common::scratch_config();
    config.permutation_timeout_ms = 1;
    let runner = CoverageRunner::new(
        config,
        Isolation::Subprocess {
            program: PathBuf::from(env!("CARGO_BIN_EXE_tmplcov")),
        },
    );
    let result = runner
        .run("<% (1..900000).each { |i| i * 2 } %>done", None, &Locals::new())
        .unwrap();
    assert!(result.degraded);
    let tmplcov::model::RenderOutcome::Failed { error } = &result.outputs[0].outcome else {
        panic!("expected a failed entry");
    };
    assert!(error.message.contains("timed out"));
}

#[test]
fn exec_isolated_round_trip() {
    let (runner, _dir) = common::in_process_runner();
    let unit = runner.compiler().compile("<%= 6 * 7 %>", None).unwrap();
    let request = IsolatedRequest {
        artifact_path: unit.artifact_path,
        locals: Locals::new(),
        permutations: vec![Permutation::new()],
    };

    let mut child = bin()
        .arg("exec-isolated")
        .env("RUST_LOG", "debug")
        .stdin(Stdio::piped())
        .stdout(Stdio::piped())
        .stderr(Stdio::piped())
        .spawn()
        .unwrap();
    child
        .stdin
        .take()
        .unwrap()
        .write_all(&serde_json::to_vec(&request).unwrap())
        .unwrap();
    let output = child.wait_with_output().unwrap();

    assert!(output.status.success());
    // The child never logs, whatever RUST_LOG says.
    assert!(output.stderr.is_empty());
    let reply: IsolatedReply = serde_json::from_slice(&output.stdout).unwrap();
    assert_eq!(reply.outputs.len(), 1);
    assert!(reply.outputs[0].is_success());
    assert_eq!(reply.hits.lines.get(&1), Some(&1));
}

#[test]
fn exec_isolated_rejects_garbage() {
    let mut child = bin()
        .arg("exec-isolated")
        .stdin(Stdio::piped())
        .stdout(Stdio::piped())
        .stderr(Stdio::piped())
        .spawn()
        .unwrap();
    child.stdin.take().unwrap().write_all(b"not json").unwrap();
    let output = child.wait_with_output().unwrap();
    assert!(!output.status.success());
    assert!(!output.stderr.is_empty());
}

#[test]
fn cli_run_text_report() {
    let dir = tempfile::tempdir().unwrap();
    let output = bin()
        .arg("--artifact-dir")
        .arg(dir.path())
        .arg("run")
        .arg(common::fixture("products.html.erb"))
        .output()
        .unwrap();
    assert!(output.status.success(), "{}", String::from_utf8_lossy(&output.stderr));
    let stdout = String::from_utf8(output.stdout).unwrap();
    assert!(stdout.contains("Template Coverage Report"));
    assert!(stdout.contains("Branches found: 3"));
    assert!(stdout.contains("✅ All branches covered!"));
}

#[test]
fn cli_run_json_in_process() {
    let dir = tempfile::tempdir().unwrap();
    let output = bin()
        .args(["--in-process", "--artifact-dir"])
        .arg(dir.path())
        .args(["run", "--format", "json"])
        .arg(common::fixture("broken.html.erb"))
        .output()
        .unwrap();
    assert!(output.status.success());
    let result: CoverageResult = serde_json::from_slice(&output.stdout).unwrap();
    assert_eq!(result.failed_outputs(), 1);
    assert!(!result.degraded);
}

#[test]
fn cli_bad_config_fails() {
    let dir = tempfile::tempdir().unwrap();
    let config = dir.path().join("tmplcov.toml");
    std::fs::write(&config, "permutation_timeout_ms = 0\n").unwrap();
    let output = bin()
        .arg("--config")
        .arg(&config)
        .arg("branches")
        .arg(common::fixture("dashboard.html.erb"))
        .output()
        .unwrap();
    assert!(!output.status.success());
    assert!(String::from_utf8_lossy(&output.stderr).contains("permutation_timeout_ms"));
}
