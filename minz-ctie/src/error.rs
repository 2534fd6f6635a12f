//! Interpreter runtime errors.
//!
//! Every variant is recoverable from the compiler's point of view: a
//! runtime error rejects the fold candidate and leaves the original call
//! in place. None of these ever surface as user diagnostics.

use minz_mir::VReg;

/// Why a compile-time evaluation attempt was abandoned.
#[derive(Debug, Clone, PartialEq, Eq, derive_more::Display)]
#[must_use]
pub enum RuntimeError {
    /// The step budget ran out.
    #[display(fmt = "step budget of {_0} exhausted")]
    StepLimitExceeded(u64),
    /// The frame stack grew past the configured depth.
    #[display(fmt = "recursion deeper than {_0} frames")]
    DepthExceeded(usize),
    /// Division or remainder by zero.
    #[display(fmt = "division by zero")]
    DivisionByZero,
    /// The callee is not part of the module (runtime helper or builtin).
    #[display(fmt = "unknown function `{_0}`")]
    UnknownFunction(String),
    /// The opcode has no compile-time semantics (inline asm, I/O,
    /// indirect calls, anchor patching).
    #[display(fmt = "`{_0}` has no compile-time semantics")]
    UnsupportedInstruction(&'static str),
    /// A read of state that is not constant at compile time.
    #[display(fmt = "read of non-constant `{_0}`")]
    NonConstRead(String),
    /// A register was read before being written.
    #[display(fmt = "register {_0} read before definition")]
    UninitializedRegister(VReg),
    /// The callee returned without a value where one was required.
    #[display(fmt = "missing return value")]
    MissingReturnValue,
}

impl RuntimeError {
    /// Whether this rejection came from a configured bound rather than
    /// from the shape of the code.
    pub const fn is_budget(&self) -> bool {
        matches!(self, Self::StepLimitExceeded(_) | Self::DepthExceeded(_))
    }
}
