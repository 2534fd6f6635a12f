//! Code generation for the Z80 target.
//!
//! Lowers a frozen MIR module to textual assembly: calling-convention
//! selection per function (TSMC anchors, registers or an IX stack frame),
//! tail-call loops that never grow the stack, per-layout string literal
//! emission, lazy runtime helpers with tree shaking, and a final
//! liveness-guarded peephole over the emitted instruction stream.

#![warn(missing_docs)]

mod asm;
mod helpers;
pub mod peephole;
mod target;
mod z80;

pub use asm::Line;
pub use target::Target;
pub use z80::{generate, Convention};

use minz_types::InvariantViolation;

/// Code generation failures.
#[derive(Debug, thiserror::Error)]
pub enum CodegenError {
    /// The selected backend is not part of the core compiler.
    #[error("target `{0}` does not support feature: only the z80 backend is built in")]
    UnsupportedTarget(Target),
    /// A malformed `@abi` attribute.
    #[error("malformed @abi attribute on `{function}`: {detail}")]
    BadAbi {
        /// Function carrying the attribute.
        function: String,
        /// What was wrong.
        detail: String,
    },
    /// An emitted address fell outside the 16-bit space.
    #[error("address out of range: {0:#x} does not fit in 16 bits")]
    AddressOutOfRange(u32),
    /// A structural invariant did not hold; fatal.
    #[error(transparent)]
    Invariant(#[from] InvariantViolation),
}

/// Code generator options.
#[derive(Debug, Clone)]
pub struct Options {
    /// Selected backend.
    pub target: Target,
    /// Whether TSMC parameter passing may be used.
    pub enable_smc: bool,
    /// Whether to run the assembly peephole.
    pub optimize: bool,
    /// Whether to include explanatory comments in the output.
    pub debug_comments: bool,
    /// Load address for the `ORG` directive.
    pub org: u16,
}

impl Default for Options {
    fn default() -> Self {
        Self {
            target: Target::Z80,
            enable_smc: true,
            optimize: false,
            debug_comments: false,
            org: 0x8000,
        }
    }
}
