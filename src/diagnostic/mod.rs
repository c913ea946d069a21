//! User-facing error reporting. Every phase has its own error type; this
//! module flattens them into one `Diagnostic` shape that renders as plain
//! text or JSON.

pub mod json;

use crate::ast::{SourceMap, Span};
use crate::compile::CompileError;

#[derive(Debug, Clone, PartialEq, Eq)]
pub enum Severity {
    Error,
    #[allow(dead_code)] // forward infrastructure for future warning diagnostics
    Warning,
}

#[derive(Debug, Clone)]
pub struct Label {
    pub span: Span,
    pub message: String,
}

#[derive(Debug, Clone)]
pub struct Diagnostic {
    pub severity: Severity,
    pub message: String,
    pub labels: Vec<Label>,
    pub notes: Vec<String>,
}

impl Diagnostic {
    pub fn error(message: impl Into<String>) -> Self {
        Diagnostic {
            severity: Severity::Error,
            message: message.into(),
            labels: Vec::new(),
            notes: Vec::new(),
        }
    }

    pub fn with_span(mut self, span: Span, label: impl Into<String>) -> Self {
        self.labels.push(Label { span, message: label.into() });
        self
    }

    pub fn with_note(mut self, note: impl Into<String>) -> Self {
        self.notes.push(note.into());
        self
    }

    /// `file:line:col: error: message` rendering, one line per label and
    /// note. Spanless diagnostics render without the location prefix.
    pub fn render(&self, map: &SourceMap) -> String {
        let severity = match self.severity {
            Severity::Error => "error",
            Severity::Warning => "warning",
        };
        let mut out = match self.labels.first() {
            Some(label) if label.span != Span::UNKNOWN => {
                format!("{}: {severity}: {}", map.describe(label.span.start), self.message)
            }
            _ => format!("{severity}: {}", self.message),
        };
        for note in &self.notes {
            out.push_str("\n  note: ");
            out.push_str(note);
        }
        out
    }
}

// ---- From impls for phase error types ----

impl From<&crate::lexer::LexError> for Diagnostic {
    fn from(e: &crate::lexer::LexError) -> Self {
        Diagnostic::error(e.to_string()).with_span(e.span, "here")
    }
}

impl From<&crate::parser::ParseError> for Diagnostic {
    fn from(e: &crate::parser::ParseError) -> Self {
        Diagnostic::error(&e.message).with_span(e.span, "here")
    }
}

impl From<&crate::lower::LowerError> for Diagnostic {
    fn from(e: &crate::lower::LowerError) -> Self {
        Diagnostic::error(&e.message).with_span(e.span, "here")
    }
}

impl From<&CompileError> for Diagnostic {
    fn from(e: &CompileError) -> Self {
        match e {
            CompileError::Lex(e) => Diagnostic::from(e),
            CompileError::Parse(e) => Diagnostic::from(e),
            CompileError::Lower(e) => Diagnostic::from(e),
            CompileError::Storage(e) => Diagnostic::error(e.to_string())
                .with_note("reduce the number of declared variables or pick a larger target"),
            CompileError::Resolve(e) => {
                Diagnostic::error(e.to_string()).with_note("in a constant expression")
            }
            CompileError::Emit(e) => Diagnostic::error(e.to_string()),
            CompileError::Object(e) => Diagnostic::error(e.to_string()),
            CompileError::Symbol(e) => Diagnostic::error(e.to_string()),
        }
    }
}
