//! Error types observable at the CLI boundary.

use std::fmt;
use std::path::PathBuf;

/// The location of a parse error.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Default)]
pub struct Location {
    /// 1-based line number; 0 for errors with no position.
    pub line_number: usize,
}

/// A parse error with the offending line.
#[derive(Debug, Clone)]
pub struct ParseError {
    pub location: Location,
    pub message: String,
}

impl fmt::Display for ParseError {
    fn fmt(&self, f: &mut fmt::Formatter) -> fmt::Result {
        if self.location.line_number == 0 {
            write!(f, "{}", self.message)
        } else {
            write!(f, "line {}: {}", self.location.line_number, self.message)
        }
    }
}

impl std::error::Error for ParseError {}

/// Result of a parser operation.
pub type ParseResult<T> = std::result::Result<T, ParseError>;

/// Everything that can abort the pipeline.
#[derive(Debug, thiserror::Error)]
pub enum Error {
    /// Malformed input or runtime IR.
    #[error("could not parse {}: {err}", path.display())]
    Parse { path: PathBuf, err: ParseError },

    /// Runtime path empty or file not found.
    #[error("could not load the runtime module: {0}")]
    MissingRuntime(String),

    /// A requested target function is absent or only a declaration.
    #[error("function '{0}' not found or has no definition")]
    MissingFunction(String),

    /// The instance struct type is absent; the module name is wrong.
    #[error("struct type '{0}' not found; check -module-name")]
    MissingStructType(String),

    /// Neither the environment struct type nor its size constant exist.
    #[error("neither the environment struct type nor its size constant are present")]
    MissingEnvSize,

    /// An extraction regex did not compile.
    #[error("invalid extraction pattern '{pattern}': {message}")]
    BadPattern { pattern: String, message: String },

    /// A name passed to the extractor does not exist.
    #[error("module doesn't contain a global named '{0}'")]
    MissingName(String),

    /// Reserved: the permissive wasm2c shape check rejected the function.
    #[error("function '{0}' was not generated by wasm2c")]
    NotWasm2C(String),

    #[error("{context}: {err}")]
    Io {
        context: String,
        #[source]
        err: std::io::Error,
    },
}

impl Error {
    pub fn io(context: impl Into<String>, err: std::io::Error) -> Self {
        Self::Io {
            context: context.into(),
            err,
        }
    }
}

/// Crate-wide result type.
pub type Result<T> = std::result::Result<T, Error>;
