//! Source positions preserved from the parser through MIR.

use std::{fmt, sync::Arc};

/// A position in a source file: file, line and column.
///
/// The file name is shared; cloning a span is two machine words.
#[derive(Debug, Clone, PartialEq, Eq, Hash)]
#[cfg_attr(feature = "serde", derive(serde::Serialize, serde::Deserialize))]
pub struct SourceSpan {
    /// Originating file.
    pub file: Arc<str>,
    /// 1-based line.
    pub line: u32,
    /// 1-based column.
    pub col: u32,
}

impl SourceSpan {
    /// Create a span from its parts.
    pub fn new(file: impl Into<Arc<str>>, line: u32, col: u32) -> Self {
        Self {
            file: file.into(),
            line,
            col,
        }
    }

    /// Span used for compiler-synthesized nodes (lifted lambdas,
    /// monomorphized interface methods).
    pub fn synthesized() -> Self {
        Self::new("<synthesized>", 0, 0)
    }
}

impl fmt::Display for SourceSpan {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        write!(f, "{}:{}:{}", self.file, self.line, self.col)
    }
}
