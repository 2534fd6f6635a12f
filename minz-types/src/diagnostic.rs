//! The shared diagnostic sink.
//!
//! Every phase reports user-facing problems here and continues where it
//! safely can, so one run surfaces as many errors as possible. A phase is
//! only entered when the previous one recorded no errors.

use std::fmt;

use crate::span::SourceSpan;

/// User-visible diagnostic categories.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, derive_more::Display)]
#[cfg_attr(feature = "serde", derive(serde::Serialize, serde::Deserialize))]
pub enum DiagnosticKind {
    /// Raised by the external parser, surfaced unchanged.
    #[display(fmt = "parse error")]
    Parse,
    /// Undefined identifier, ambiguous overload, visibility violation.
    #[display(fmt = "name error")]
    Name,
    /// Mismatch, narrowing without cast, pointer/integer confusion.
    #[display(fmt = "type error")]
    Type,
    /// Duplicate definition, recursive constant, unimplemented method.
    #[display(fmt = "semantic error")]
    Semantic,
    /// Target does not support a feature, address out of range.
    #[display(fmt = "codegen error")]
    Codegen,
    /// Compiler invariant violation.
    #[display(fmt = "internal error")]
    Internal,
}

/// A single reported problem with optional hints.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct Diagnostic {
    /// Category.
    pub kind: DiagnosticKind,
    /// Source position, when one is known.
    pub span: Option<SourceSpan>,
    /// Primary message.
    pub message: String,
    /// Follow-up hints, rendered one per line with a `help:` marker.
    pub hints: Vec<String>,
}

impl Diagnostic {
    /// Create a diagnostic with a source position.
    pub fn new(kind: DiagnosticKind, span: SourceSpan, message: impl Into<String>) -> Self {
        Self {
            kind,
            span: Some(span),
            message: message.into(),
            hints: Vec::new(),
        }
    }

    /// Create a diagnostic with no source position.
    pub fn unspanned(kind: DiagnosticKind, message: impl Into<String>) -> Self {
        Self {
            kind,
            span: None,
            message: message.into(),
            hints: Vec::new(),
        }
    }

    /// Attach a hint line.
    pub fn with_hint(mut self, hint: impl Into<String>) -> Self {
        self.hints.push(hint.into());
        self
    }
}

impl fmt::Display for Diagnostic {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        match &self.span {
            Some(span) => write!(f, "{span}: {}: {}", self.kind, self.message)?,
            None => write!(f, "{}: {}", self.kind, self.message)?,
        }
        for hint in &self.hints {
            write!(f, "\n  help: {hint}")?;
        }
        Ok(())
    }
}

/// Accumulates diagnostics across phases.
#[derive(Debug, Default)]
pub struct DiagnosticSink {
    diagnostics: Vec<Diagnostic>,
}

impl DiagnosticSink {
    /// Create an empty sink.
    pub fn new() -> Self {
        Self::default()
    }

    /// Record a diagnostic.
    pub fn report(&mut self, diagnostic: Diagnostic) {
        self.diagnostics.push(diagnostic);
    }

    /// Whether any errors were recorded so far.
    pub fn has_errors(&self) -> bool {
        !self.diagnostics.is_empty()
    }

    /// Number of recorded diagnostics.
    pub fn len(&self) -> usize {
        self.diagnostics.len()
    }

    /// Whether the sink is empty.
    pub fn is_empty(&self) -> bool {
        self.diagnostics.is_empty()
    }

    /// Iterate recorded diagnostics in report order.
    pub fn iter(&self) -> impl Iterator<Item = &Diagnostic> {
        self.diagnostics.iter()
    }
}

/// A fatal compiler invariant violation.
///
/// Unlike user diagnostics these abort the run immediately, naming the phase
/// and the function under compilation.
#[derive(Debug, Clone, PartialEq, Eq, thiserror::Error)]
#[error("internal error in {phase}: {detail} (function `{function}`)")]
pub struct InvariantViolation {
    /// Phase that detected the violation.
    pub phase: &'static str,
    /// Function under compilation.
    pub function: String,
    /// What was violated.
    pub detail: String,
}

impl InvariantViolation {
    /// Create a violation report.
    pub fn new(phase: &'static str, function: impl Into<String>, detail: impl Into<String>) -> Self {
        Self {
            phase,
            function: function.into(),
            detail: detail.into(),
        }
    }
}
