use std::fmt;

use super::ast::Span;

/// A source-level error with the byte span it points at.
#[derive(Debug, Clone, PartialEq)]
pub struct CompileError {
    pub message: String,
    pub span: Span,
    pub kind: ErrorKind,
    /// Include name of the library the span points into; `None` for the
    /// unit being compiled.
    pub file: Option<String>,
}

#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum ErrorKind {
    Lexer,
    Parser,
    Semantic,
    /// Missing or duplicate `main`/`StartingConditional`.
    EntryPoint,
}

impl ErrorKind {
    pub fn label(self) -> &'static str {
        match self {
            ErrorKind::Lexer => "lexer",
            ErrorKind::Parser => "parse",
            ErrorKind::Semantic => "semantic",
            ErrorKind::EntryPoint => "entry point",
        }
    }
}

impl CompileError {
    pub fn lexer(message: impl Into<String>, span: Span) -> Self {
        Self {
            message: message.into(),
            span,
            file: None,
            kind: ErrorKind::Lexer,
        }
    }

    pub fn parser(message: impl Into<String>, span: Span) -> Self {
        Self {
            message: message.into(),
            span,
            file: None,
            kind: ErrorKind::Parser,
        }
    }

    pub fn semantic(message: impl Into<String>, span: Span) -> Self {
        Self {
            message: message.into(),
            span,
            file: None,
            kind: ErrorKind::Semantic,
        }
    }

    pub fn entry_point(message: impl Into<String>, span: Span) -> Self {
        Self {
            message: message.into(),
            span,
            file: None,
            kind: ErrorKind::EntryPoint,
        }
    }

    pub fn in_file(mut self, name: &str) -> Self {
        self.file.get_or_insert_with(|| name.to_string());
        self
    }

    /// Format the error with its line and column in `source`.
    pub fn format_with_source(&self, source: &str) -> String {
        let (line, col) = offset_to_line_col(source, self.span.start);
        format!("[{}] line {}:{}: {}", self.kind.label(), line, col, self.message)
    }
}

impl fmt::Display for CompileError {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        write!(f, "{} error: {}", self.kind.label(), self.message)
    }
}

impl std::error::Error for CompileError {}

/// 1-based line and column of a byte offset.
pub fn offset_to_line_col(source: &str, offset: usize) -> (usize, usize) {
    let mut line = 1;
    let mut col = 1;
    for (i, ch) in source.char_indices() {
        if i >= offset {
            break;
        }
        if ch == '\n' {
            line += 1;
            col = 1;
        } else {
            col += 1;
        }
    }
    (line, col)
}
