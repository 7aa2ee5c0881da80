use std::path::{Path, PathBuf};

use thiserror::Error;

use crate::decompiler::DecompileError;
use crate::ncs::{CorruptBinaryError, EncodeError};
use crate::nss::{CompileError, ErrorKind};

/// Every way a tool invocation can fail. Each variant maps to one process
/// exit code so scripts driving the CLI can tell failure classes apart.
#[derive(Debug, Error)]
pub enum ToolError {
    #[error("{0}")]
    Usage(String),
    #[error("invalid configuration {path}: {message}")]
    Config { path: PathBuf, message: String },
    #[error("invalid declaration file {path}: {message}")]
    Declarations { path: PathBuf, message: String },
    /// `rendered` carries the file name, line and column.
    #[error("{rendered}")]
    Compile { kind: ErrorKind, rendered: String },
    #[error(transparent)]
    Corrupt(#[from] CorruptBinaryError),
    #[error(transparent)]
    Encode(#[from] EncodeError),
    #[error(transparent)]
    Decompile(#[from] DecompileError),
    #[error("{path}: {source}")]
    Io {
        path: PathBuf,
        #[source]
        source: std::io::Error,
    },
    /// Two batch inputs map to the same output file; the later one fails.
    #[error("{output} is already the output of {first}")]
    OutputCollision { output: PathBuf, first: PathBuf },
    #[error("batch cancelled after {completed} of {total} files")]
    Cancelled { completed: usize, total: usize },
    #[error("batch deadline passed after {completed} of {total} files")]
    DeadlineExceeded { completed: usize, total: usize },
    #[error("recompiled program differs from the input at instruction {index}")]
    RoundTripMismatch { index: usize },
}

impl ToolError {
    pub fn io(path: &Path, source: std::io::Error) -> Self {
        Self::Io {
            path: path.to_path_buf(),
            source,
        }
    }

    /// Locate a source error. `name` labels the unit being compiled; errors
    /// inside an include are labelled with the include's name instead.
    pub fn compile(error: &CompileError, name: &str, source: &str) -> Self {
        let file = error.file.as_deref().unwrap_or(name);
        Self::Compile {
            kind: error.kind,
            rendered: format!("{file}: {}", error.format_with_source(source)),
        }
    }

    pub fn exit_code(&self) -> i32 {
        match self {
            ToolError::Usage(_) | ToolError::Config { .. } | ToolError::Declarations { .. } => 1,
            ToolError::Compile { kind, .. } => match kind {
                ErrorKind::Lexer | ErrorKind::Parser => 10,
                ErrorKind::Semantic => 20,
                ErrorKind::EntryPoint => 21,
            },
            ToolError::Corrupt(_) | ToolError::Encode(_) => 30,
            ToolError::Decompile(e) => match e {
                DecompileError::Unstructurable { .. } => 41,
                DecompileError::Signature { .. } => 42,
                DecompileError::Stack { .. } | DecompileError::Unsupported { .. } => 40,
            },
            ToolError::Io { .. } | ToolError::OutputCollision { .. } => 50,
            ToolError::Cancelled { .. } | ToolError::DeadlineExceeded { .. } => 60,
            ToolError::RoundTripMismatch { .. } => 70,
        }
    }
}
