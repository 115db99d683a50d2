use thiserror::Error;

#[derive(Error, Debug)]
pub enum Error {
    #[error("I/O error: {0}")]
    Io(#[from] std::io::Error),

    #[error("Lex error at line {line}: {message}")]
    Lex { line: u32, message: String },

    #[error("Parse error at line {line}: {message}")]
    Parse { line: u32, message: String },

    #[error("JSON error: {0}")]
    Json(#[from] serde_json::Error),

    #[error("Config error: {0}")]
    Config(String),

    #[error("Too many conditional variables for exhaustive permutations: {count} (limit {limit})")]
    TooManyVariables { count: usize, limit: usize },

    #[error("Isolated execution failed: {0}")]
    Isolation(String),
}

impl Error {
    pub(crate) fn parse(line: u32, message: impl Into<String>) -> Self {
        Error::Parse {
            line,
            message: message.into(),
        }
    }
}

pub type Result<T> = std::result::Result<T, Error>;

/// A failure raised while rendering one permutation. Captured into the
/// permutation's output entry; never propagated out of a coverage run.
#[derive(Error, Debug, Clone, PartialEq, serde::Serialize, serde::Deserialize)]
#[error("{message}")]
pub struct RenderError {
    pub message: String,
    pub backtrace: Vec<String>,
}

/// Frames kept in a captured render backtrace.
pub const BACKTRACE_DEPTH: usize = 5;

impl RenderError {
    pub fn new(message: impl Into<String>) -> Self {
        Self {
            message: message.into(),
            backtrace: Vec::new(),
        }
    }

    /// Push a `compiled:<line>` frame, keeping at most [`BACKTRACE_DEPTH`].
    pub fn at_line(mut self, line: u32) -> Self {
        if self.backtrace.len() < BACKTRACE_DEPTH {
            let frame = format!("compiled:{line}");
            if self.backtrace.last() != Some(&frame) {
                self.backtrace.push(frame);
            }
        }
        self
    }
}
