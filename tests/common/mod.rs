#![allow(dead_code)]

use std::path::{Path, PathBuf};

use tempfile::TempDir;
use tmplcov::config::Config;
use tmplcov::isolate::Isolation;
use tmplcov::runner::CoverageRunner;

/// Path of a template under `tests/fixtures`.
pub fn fixture(name: &str) -> PathBuf {
    Path::new(env!("CARGO_MANIFEST_DIR"))
        .join("tests/fixtures")
        .join(name)
}

pub fn read_fixture(name: &str) -> String {
    std::fs::read_to_string(fixture(name)).unwrap()
}

/// A config whose artifact directory lives in a fresh temporary directory.
/// The caller must hold onto `TempDir` to keep the directory alive.
pub fn scratch_config() -> (Config, TempDir) {
    let dir = tempfile::tempdir().unwrap();
    let config = Config {
        artifact_dir: dir.path().join("compiled"),
        ..Config::default()
    };
    (config, dir)
}

pub fn in_process_runner() -> (CoverageRunner, TempDir) {
    let (config, dir) = scratch_config();
    (CoverageRunner::new(config, Isolation::InProcess), dir)
}

/// Runner that isolates every permutation in the built `tmplcov` binary.
pub fn subprocess_runner() -> (CoverageRunner, TempDir) {
    let (config, dir) = scratch_config();
    let isolation = Isolation::Subprocess {
        program: PathBuf::from(env!("CARGO_BIN_EXE_tmplcov")),
    };
    (CoverageRunner::new(config, isolation), dir)
}
