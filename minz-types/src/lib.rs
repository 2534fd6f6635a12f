//! Atomic types shared by every phase of the MinZ compiler.

#![warn(missing_docs)]

mod diagnostic;
mod interner;
mod span;
mod types;

pub use diagnostic::{Diagnostic, DiagnosticKind, DiagnosticSink, InvariantViolation};
pub use interner::{Interner, StrId};
pub use span::SourceSpan;
pub use types::{EnumDef, Field, FixedFormat, StringKind, StructDef, Type, Variant};

/// Value carried by a MIR virtual register or immediate operand.
///
/// All MinZ arithmetic is at most 16 bits wide; a host-side `i32` holds any
/// intermediate without loss.
pub type Word = i32;

/// Mask for the widest machine value the targets support.
pub const WORD_MASK: Word = 0xFFFF;
