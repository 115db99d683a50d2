//! The isolation boundary between a coverage run and template execution.
//!
//! With [`Isolation::Subprocess`] every permutation runs in a fresh child
//! process (`<program> exec-isolated`) that reads an [`IsolatedRequest`] as
//! JSON on stdin and writes an [`IsolatedReply`] as JSON on stdout. The
//! message shapes are internal and unversioned.

use std::io::{Read, Write};
use std::path::{Path, PathBuf};
use std::process::{Command, Stdio};
use std::thread;
use std::time::Duration;

use serde::{Deserialize, Serialize};
use tracing::debug;
use wait_timeout::ChildExt;

use crate::compiler::load_artifact;
use crate::coverage::{CoverageMap, Hits};
use crate::error::{Error, Result};
use crate::exec::{execute_permutation, Locals};
use crate::lang::parse_program;
use crate::model::{Permutation, PermutationOutput};

/// Hidden subcommand the child process is started with.
pub const ISOLATED_COMMAND: &str = "exec-isolated";

#[derive(Debug, Clone, PartialEq, Eq)]
pub enum Isolation {
    /// Run each permutation in a fresh `<program> exec-isolated` process.
    Subprocess { program: PathBuf },
    /// Run in the calling process.
    InProcess,
}

impl Isolation {
    /// Subprocess isolation through the currently running executable.
    pub fn current_exe() -> Result<Self> {
        Ok(Isolation::Subprocess {
            program: std::env::current_exe()?,
        })
    }
}

#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct IsolatedRequest {
    pub artifact_path: PathBuf,
    pub locals: Locals,
    pub permutations: Vec<Permutation>,
}

#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct IsolatedReply {
    pub outputs: Vec<PermutationOutput>,
    pub hits: Hits,
}

/// Child side: load the artifact named in `request`, render every
/// permutation and sum the hits.
pub fn serve(request: &IsolatedRequest) -> Result<IsolatedReply> {
    let code = load_artifact(&request.artifact_path)?;
    let program = parse_program(&code)?;
    let map = CoverageMap::from_program(&program);

    let mut outputs = Vec::with_capacity(request.permutations.len());
    let mut hits = Hits::default();
    for permutation in &request.permutations {
        let (output, permutation_hits) = execute_permutation(&program, &map, &request.locals, permutation);
        outputs.push(output);
        hits.merge(&permutation_hits);
    }
    Ok(IsolatedReply { outputs, hits })
}

/// Child side over stdio.
pub fn serve_stdio(input: impl Read, mut output: impl Write) -> Result<()> {
    let request: IsolatedRequest = serde_json::from_reader(input)?;
    let reply = serve(&request)?;
    serde_json::to_writer(&mut output, &reply)?;
    output.flush()?;
    Ok(())
}

/// Parent side: spawn `program exec-isolated`, send `request`, and wait at
/// most `timeout` for the reply. Any abnormal exit, stderr output, timeout or
/// malformed reply is an [`Error::Isolation`].
pub fn run_subprocess(program: &Path, request: &IsolatedRequest, timeout: Duration) -> Result<IsolatedReply> {
    let payload = serde_json::to_vec(request)?;
    let mut child = Command::new(program)
        .arg(ISOLATED_COMMAND)
        .env_remove("RUST_LOG")
        .stdin(Stdio::piped())
        .stdout(Stdio::piped())
        .stderr(Stdio::piped())
        .spawn()
        .map_err(|e| Error::Isolation(format!("failed to spawn {}: {e}", program.display())))?;

    let stdout = child.stdout.take();
    let stderr = child.stderr.take();
    let stdout_reader = thread::spawn(move || read_all(stdout));
    let stderr_reader = thread::spawn(move || read_all(stderr));

    if let Some(mut stdin) = child.stdin.take() {
        // A child that exits early closes the pipe; its status explains why.
        if let Err(e) = stdin.write_all(&payload) {
            debug!(error = %e, "isolated child stopped reading its request");
        }
    }

    let status = match child.wait_timeout(timeout)? {
        Some(status) => status,
        None => {
            child.kill()?;
            let _ = child.wait();
            return Err(Error::Isolation(format!(
                "permutation timed out after {} ms",
                timeout.as_millis()
            )));
        }
    };

    let stdout = stdout_reader
        .join()
        .map_err(|_| Error::Isolation("stdout reader panicked".to_string()))?;
    let stderr = stderr_reader
        .join()
        .map_err(|_| Error::Isolation("stderr reader panicked".to_string()))?;

    let stderr = String::from_utf8_lossy(&stderr);
    if !status.success() {
        return Err(Error::Isolation(format!(
            "child exited with {status}: {}",
            stderr.trim()
        )));
    }
    if !stderr.trim().is_empty() {
        return Err(Error::Isolation(format!("unexpected stderr: {}", stderr.trim())));
    }
    serde_json::from_slice(&stdout).map_err(|e| Error::Isolation(format!("malformed reply: {e}")))
}

fn read_all(source: Option<impl Read>) -> Vec<u8> {
    let mut buf = Vec::new();
    if let Some(mut source) = source {
        let _ = source.read_to_end(&mut buf);
    }
    buf
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::compiler::Compiler;
    use crate::model::ForcedValue;

    fn request(dir: &Path, source: &str, permutations: Vec<Permutation>) -> IsolatedRequest {
        let unit = Compiler::new(dir).compile(source, None).unwrap();
        IsolatedRequest {
            artifact_path: unit.artifact_path,
            locals: Locals::new(),
            permutations,
        }
    }

    #[test]
    fn test_serve_sums_hits() {
        let dir = tempfile::tempdir().unwrap();
        let on: Permutation = [("show".to_string(), ForcedValue::Bool(true))].into_iter().collect();
        let off = on.with("show", ForcedValue::Bool(false));
        let req = request(dir.path(), "<% if show %>\nyes\n<% end %>\n", vec![on, off]);
        let reply = serve(&req).unwrap();
        assert_eq!(reply.outputs.len(), 2);
        assert_eq!(reply.hits.lines.get(&1), Some(&2));
        assert_eq!(reply.hits.lines.get(&2), Some(&1));
        assert_eq!(reply.hits.arms.len(), 2);
    }

    #[test]
    fn test_serve_stdio_round_trip() {
        let dir = tempfile::tempdir().unwrap();
        let req = request(dir.path(), "<%= 1 + 1 %>", vec![Permutation::new()]);
        let input = serde_json::to_vec(&req).unwrap();
        let mut output = Vec::new();
        serve_stdio(input.as_slice(), &mut output).unwrap();
        let reply: IsolatedReply = serde_json::from_slice(&output).unwrap();
        assert!(reply.outputs[0].is_success());
    }

    #[test]
    fn test_serve_missing_artifact() {
        let req = IsolatedRequest {
            artifact_path: PathBuf::from("/nonexistent/tmplcov/x.rbt"),
            locals: Locals::new(),
            permutations: vec![],
        };
        assert!(matches!(serve(&req), Err(Error::Io(_))));
    }

    #[test]
    fn test_spawn_failure_is_isolation_error() {
        let dir = tempfile::tempdir().unwrap();
        let req = request(dir.path(), "x", vec![Permutation::new()]);
        let err = run_subprocess(Path::new("/nonexistent/tmplcov-bin"), &req, Duration::from_secs(1)).unwrap_err();
        assert!(matches!(err, Error::Isolation(_)));
    }
}
