//! Translates a template into executable code and writes it to the scratch
//! artifact directory.
//!
//! The translation is line-preserving: compiled line N holds exactly the code
//! of template line N, so hits recorded against the compiled unit are
//! reported against template lines without any mapping.

use std::fmt::Write;
use std::fs;
use std::path::{Path, PathBuf};

use sha2::{Digest, Sha256};
use tracing::debug;

use crate::error::Result;
use crate::template::{scan, SegmentKind};

/// Name of the output-buffer append call emitted for text and output tags.
pub const OUT_CALL: &str = "__out";

/// Prefix of the header lines the loader strips from an artifact.
const HEADER_PREFIX: &str = "#~ ";

/// Artifact file extension.
const ARTIFACT_EXT: &str = "rbt";

/// A template translated into executable code.
#[derive(Debug, Clone)]
pub struct CompiledUnit {
    /// Stable identifier derived from the source path or content hash.
    pub id: String,
    pub source_path: Option<PathBuf>,
    /// The original template text.
    pub template: String,
    /// The translated code, line-aligned with `template`.
    pub code: String,
    pub artifact_path: PathBuf,
}

/// Compiles templates into a scratch directory that may be cleared at any
/// time between runs.
#[derive(Debug, Clone)]
pub struct Compiler {
    artifact_dir: PathBuf,
}

impl Compiler {
    pub fn new(artifact_dir: impl Into<PathBuf>) -> Self {
        Self {
            artifact_dir: artifact_dir.into(),
        }
    }

    pub fn artifact_dir(&self) -> &Path {
        &self.artifact_dir
    }

    /// Translate `source` and write the artifact, creating the directory
    /// when needed.
    pub fn compile(&self, source: &str, path: Option<&Path>) -> Result<CompiledUnit> {
        let code = translate(source)?;
        let id = unit_id(source, path);
        fs::create_dir_all(&self.artifact_dir)?;
        let artifact_path = self.artifact_dir.join(format!("{id}.{ARTIFACT_EXT}"));

        let mut contents = String::new();
        let origin = path.map_or_else(|| "<string>".to_string(), |p| p.display().to_string());
        writeln!(contents, "{HEADER_PREFIX}Compiled from: {origin}").unwrap();
        writeln!(
            contents,
            "{HEADER_PREFIX}Generated at: {}",
            chrono::Utc::now().to_rfc3339()
        )
        .unwrap();
        contents.push_str(&code);
        fs::write(&artifact_path, contents)?;
        debug!(id = %id, path = %artifact_path.display(), "wrote compiled artifact");

        Ok(CompiledUnit {
            id,
            source_path: path.map(Path::to_path_buf),
            template: source.to_string(),
            code,
            artifact_path,
        })
    }

    /// Remove the artifact directory and everything in it.
    pub fn clean(&self) -> Result<()> {
        match fs::remove_dir_all(&self.artifact_dir) {
            Ok(()) => Ok(()),
            Err(e) if e.kind() == std::io::ErrorKind::NotFound => Ok(()),
            Err(e) => Err(e.into()),
        }
    }
}

/// Read an artifact back, dropping its header so line numbers match the
/// template again.
pub fn load_artifact(path: &Path) -> Result<String> {
    let contents = fs::read_to_string(path)?;
    let mut rest = contents.as_str();
    while rest.starts_with(HEADER_PREFIX) {
        rest = rest.split_once('\n').map_or("", |(_, tail)| tail);
    }
    Ok(rest.to_string())
}

/// `<stem>_<hash>` for templates with a path, `string_<hash>` otherwise.
#[must_use]
pub fn unit_id(source: &str, path: Option<&Path>) -> String {
    let digest = Sha256::digest(source.as_bytes());
    let hex: String = digest.iter().map(|b| format!("{b:02x}")).collect();
    match path.and_then(Path::file_stem) {
        Some(stem) => {
            let stem: String = stem
                .to_string_lossy()
                .chars()
                .map(|c| if c.is_ascii_alphanumeric() { c } else { '_' })
                .collect();
            format!("{stem}_{}", &hex[..12])
        }
        None => format!("string_{}", &hex[..16]),
    }
}

/// Translate template source into code.
pub fn translate(source: &str) -> Result<String> {
    let mut code = String::with_capacity(source.len() * 2);

    for segment in scan(source)? {
        match segment.kind {
            SegmentKind::Text => {
                for piece in segment.text.split_inclusive('\n') {
                    write!(code, "{OUT_CALL}({});", quote(piece)).unwrap();
                    if piece.ends_with('\n') {
                        code.push('\n');
                    }
                }
            }
            SegmentKind::Code => {
                code.push_str(&segment.text);
                code.push(';');
            }
            SegmentKind::Output if opens_block(&segment.text) => {
                code.push_str(&segment.text);
                code.push(';');
            }
            SegmentKind::Output => {
                write!(code, "{OUT_CALL}(({}));", segment.text).unwrap();
            }
            SegmentKind::Comment | SegmentKind::Skipped => {
                code.extend(std::iter::repeat('\n').take(segment.newlines));
            }
        }
    }

    Ok(code)
}

fn opens_block(expr: &str) -> bool {
    let expr = expr.trim_end();
    expr.ends_with(" do")
        || expr.ends_with('{')
        || (expr.ends_with('|') && (expr.contains(" do ") || expr.contains('{')))
}

/// Quote `text` as a double-quoted literal without interpolation.
fn quote(text: &str) -> String {
    let mut out = String::with_capacity(text.len() + 2);
    out.push('"');
    for c in text.chars() {
        match c {
            '\\' => out.push_str("\\\\"),
            '"' => out.push_str("\\\""),
            '#' => out.push_str("\\#"),
            '\n' => out.push_str("\\n"),
            '\t' => out.push_str("\\t"),
            '\r' => out.push_str("\\r"),
            other => out.push(other),
        }
    }
    out.push('"');
    out
}
