//! Error kinds for every stage of the pipeline.
//!
//! Compilation either completes or fails with one of these; errors tied to a
//! source construct carry a [`Location`] so the CLI can render a context
//! window around the offending line.

use std::fmt;

use thiserror::Error;

/// A position in a source file (1-based line, 0-based column).
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct Location {
    pub file: String,
    pub line: usize,
    pub column: usize,
}

impl Location {
    pub fn new(file: impl Into<String>, line: usize, column: usize) -> Self {
        Self {
            file: file.into(),
            line,
            column,
        }
    }
}

impl fmt::Display for Location {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        write!(f, "{}:{}:{}", self.file, self.line, self.column)
    }
}

#[derive(Debug, Error)]
pub enum Error {
    /// The parser reported an unexpected token, or the source uses a
    /// construct outside the supported subset.
    #[error("{location}: syntax error: {message}")]
    Syntax { message: String, location: Location },

    /// Reference to a name that is bound in no enclosing scope.
    #[error("{location}: name '{name}' is not defined")]
    Name { name: String, location: Location },

    /// An imported class or function was not found in any library.
    #[error("{location}: cannot import '{name}'")]
    Import { name: String, location: Location },

    /// An identifier used as a base class does not denote a class.
    #[error("{location}: '{name}' is not a class")]
    NotAClass { name: String, location: Location },

    /// The stack-balance check failed inside a generated method body.
    #[error("stack verification failed in {method}: {message}")]
    Stack { method: String, message: String },

    /// A round-trip invariant was violated (e.g. an unresolved forward jump).
    #[error("assertion failed: {0}")]
    Assertion(String),

    /// Malformed binary input (truncated or inconsistent ABC/SWF data).
    #[error("malformed {what}: {message}")]
    Malformed { what: &'static str, message: String },

    #[error(transparent)]
    Io(#[from] std::io::Error),
}

impl Error {
    /// Construct a `Malformed` error for the given input kind.
    pub fn malformed(what: &'static str, message: impl Into<String>) -> Self {
        Self::Malformed {
            what,
            message: message.into(),
        }
    }

    /// The source location this error points at, if it has one.
    pub fn location(&self) -> Option<&Location> {
        match self {
            Self::Syntax { location, .. }
            | Self::Name { location, .. }
            | Self::Import { location, .. }
            | Self::NotAClass { location, .. } => Some(location),
            _ => None,
        }
    }
}

pub type Result<T> = std::result::Result<T, Error>;
