//! MIR instructions and their operands.

use minz_types::{StrId, StringKind, Type, Word};

/// A virtual register.
///
/// Virtual registers are function-local and assigned by the semantic
/// analyzer; the register allocator later maps them onto physical, shadow
/// or spilled storage.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, PartialOrd, Ord)]
#[cfg_attr(feature = "serde", derive(serde::Serialize, serde::Deserialize))]
pub struct VReg(pub u32);

impl std::fmt::Display for VReg {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        write!(f, "r{}", self.0)
    }
}

/// Two-operand arithmetic and logical operations.
///
/// Division, remainder and right shift come in unsigned and signed forms;
/// the analyzer picks the form from the operand types.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, strum::Display, strum::EnumString)]
#[cfg_attr(feature = "serde", derive(serde::Serialize, serde::Deserialize))]
#[strum(serialize_all = "lowercase")]
pub enum BinOp {
    /// Wrapping addition.
    Add,
    /// Wrapping subtraction.
    Sub,
    /// Wrapping multiplication.
    Mul,
    /// Unsigned division.
    Div,
    /// Signed division.
    Sdiv,
    /// Unsigned remainder.
    Rem,
    /// Signed remainder.
    Srem,
    /// Bitwise AND.
    And,
    /// Bitwise OR.
    Or,
    /// Bitwise XOR.
    Xor,
    /// Shift left.
    Shl,
    /// Logical shift right.
    Shr,
    /// Arithmetic shift right.
    Sar,
}

/// Single-operand operations.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, strum::Display)]
#[cfg_attr(feature = "serde", derive(serde::Serialize, serde::Deserialize))]
#[strum(serialize_all = "lowercase")]
pub enum UnOp {
    /// Two's complement negation.
    Neg,
    /// Bitwise complement.
    Not,
}

/// Comparison operations producing a boolean (0 or 1).
///
/// The `S`-prefixed forms compare as signed values.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, strum::Display)]
#[cfg_attr(feature = "serde", derive(serde::Serialize, serde::Deserialize))]
#[strum(serialize_all = "lowercase")]
pub enum CmpOp {
    /// Equal.
    Eq,
    /// Not equal.
    Ne,
    /// Unsigned less-than.
    Lt,
    /// Unsigned less-or-equal.
    Le,
    /// Unsigned greater-than.
    Gt,
    /// Unsigned greater-or-equal.
    Ge,
    /// Signed less-than.
    Slt,
    /// Signed less-or-equal.
    Sle,
    /// Signed greater-than.
    Sgt,
    /// Signed greater-or-equal.
    Sge,
}

/// A non-terminator MIR instruction.
#[derive(Debug, Clone, PartialEq)]
#[cfg_attr(feature = "serde", derive(serde::Serialize, serde::Deserialize))]
pub enum Instruction {
    /// Load an immediate constant of a known type.
    LoadConst {
        /// Destination register.
        dst: VReg,
        /// Constant value.
        value: Word,
        /// Value type, which fixes the emitted width.
        ty: Type,
    },
    /// Load a named variable (global or local slot).
    LoadVar {
        /// Destination register.
        dst: VReg,
        /// Variable name.
        name: String,
    },
    /// Store into a named variable.
    StoreVar {
        /// Variable name.
        name: String,
        /// Source register.
        src: VReg,
    },
    /// Read a parameter. For TSMC functions this reads the value patched
    /// into the parameter's anchor immediate.
    LoadParam {
        /// Destination register.
        dst: VReg,
        /// Zero-based parameter index.
        index: u8,
    },
    /// Load the address of an interned string literal laid out with the
    /// given kind.
    LoadString {
        /// Destination register.
        dst: VReg,
        /// Interned literal.
        id: StrId,
        /// Layout the use site requires.
        kind: StringKind,
    },
    /// Load the address of a function, for indirect calls.
    LoadFunc {
        /// Destination register.
        dst: VReg,
        /// Mangled function name.
        function: String,
    },
    /// Register-to-register copy.
    Move {
        /// Destination register.
        dst: VReg,
        /// Source register.
        src: VReg,
    },
    /// Two-operand arithmetic or logic.
    Binary {
        /// Operation.
        op: BinOp,
        /// Destination register.
        dst: VReg,
        /// Left operand.
        lhs: VReg,
        /// Right operand.
        rhs: VReg,
    },
    /// Single-operand arithmetic.
    Unary {
        /// Operation.
        op: UnOp,
        /// Destination register.
        dst: VReg,
        /// Operand.
        src: VReg,
    },
    /// Comparison producing 0 or 1.
    Cmp {
        /// Predicate.
        op: CmpOp,
        /// Destination register.
        dst: VReg,
        /// Left operand.
        lhs: VReg,
        /// Right operand.
        rhs: VReg,
    },
    /// Direct call to a mangled function name.
    Call {
        /// Destination of the return value, absent for void callees.
        dst: Option<VReg>,
        /// Mangled callee name.
        callee: String,
        /// Argument registers, one per parameter.
        args: Vec<VReg>,
    },
    /// Call through a function pointer.
    CallIndirect {
        /// Destination of the return value, absent for void callees.
        dst: Option<VReg>,
        /// Register holding the target address.
        target: VReg,
        /// Argument registers.
        args: Vec<VReg>,
    },
    /// Read the current value of a TSMC anchor.
    AnchorLoad {
        /// Destination register.
        dst: VReg,
        /// Function owning the anchor.
        function: String,
        /// Parameter index of the anchor.
        param: u8,
    },
    /// Patch a TSMC anchor with a new value.
    AnchorPatch {
        /// Function owning the anchor.
        function: String,
        /// Parameter index of the anchor.
        param: u8,
        /// New value.
        src: VReg,
    },
    /// Verbatim target assembly. Poisons purity and CTIE.
    InlineAsm {
        /// Assembly text, one instruction per line.
        body: String,
    },
    /// Read a byte from an I/O port.
    PortIn {
        /// Destination register.
        dst: VReg,
        /// Port number register.
        port: VReg,
    },
    /// Write a byte to an I/O port.
    PortOut {
        /// Port number register.
        port: VReg,
        /// Value register.
        src: VReg,
    },
}

impl Instruction {
    /// The register this instruction defines, if any.
    pub fn dst(&self) -> Option<VReg> {
        match self {
            Self::LoadConst { dst, .. }
            | Self::LoadVar { dst, .. }
            | Self::LoadParam { dst, .. }
            | Self::LoadString { dst, .. }
            | Self::LoadFunc { dst, .. }
            | Self::Move { dst, .. }
            | Self::Binary { dst, .. }
            | Self::Unary { dst, .. }
            | Self::Cmp { dst, .. }
            | Self::AnchorLoad { dst, .. }
            | Self::PortIn { dst, .. } => Some(*dst),
            Self::Call { dst, .. } | Self::CallIndirect { dst, .. } => *dst,
            Self::StoreVar { .. }
            | Self::AnchorPatch { .. }
            | Self::InlineAsm { .. }
            | Self::PortOut { .. } => None,
        }
    }

    /// The registers this instruction reads.
    pub fn uses(&self) -> Vec<VReg> {
        match self {
            Self::LoadConst { .. }
            | Self::LoadVar { .. }
            | Self::LoadParam { .. }
            | Self::LoadString { .. }
            | Self::LoadFunc { .. }
            | Self::AnchorLoad { .. }
            | Self::InlineAsm { .. } => Vec::new(),
            Self::StoreVar { src, .. }
            | Self::Move { src, .. }
            | Self::Unary { src, .. }
            | Self::AnchorPatch { src, .. } => vec![*src],
            Self::Binary { lhs, rhs, .. } | Self::Cmp { lhs, rhs, .. } => vec![*lhs, *rhs],
            Self::Call { args, .. } => args.clone(),
            Self::CallIndirect { target, args, .. } => {
                let mut uses = vec![*target];
                uses.extend_from_slice(args);
                uses
            }
            Self::PortIn { port, .. } => vec![*port],
            Self::PortOut { port, src } => vec![*port, *src],
        }
    }

    /// Whether removing this instruction could change observable behavior
    /// even when its result is unused.
    pub fn has_side_effects(&self) -> bool {
        matches!(
            self,
            Self::StoreVar { .. }
                | Self::Call { .. }
                | Self::CallIndirect { .. }
                | Self::AnchorPatch { .. }
                | Self::InlineAsm { .. }
                | Self::PortIn { .. }
                | Self::PortOut { .. }
        )
    }

    /// Rewrite every read of `from` into a read of `to`.
    pub fn replace_use(&mut self, from: VReg, to: VReg) {
        let patch = |reg: &mut VReg| {
            if *reg == from {
                *reg = to;
            }
        };
        match self {
            Self::StoreVar { src, .. }
            | Self::Move { src, .. }
            | Self::Unary { src, .. }
            | Self::AnchorPatch { src, .. } => patch(src),
            Self::Binary { lhs, rhs, .. } | Self::Cmp { lhs, rhs, .. } => {
                patch(lhs);
                patch(rhs);
            }
            Self::Call { args, .. } => args.iter_mut().for_each(patch),
            Self::CallIndirect { target, args, .. } => {
                patch(target);
                args.iter_mut().for_each(patch);
            }
            Self::PortIn { port, .. } => patch(port),
            Self::PortOut { port, src } => {
                patch(port);
                patch(src);
            }
            Self::LoadConst { .. }
            | Self::LoadVar { .. }
            | Self::LoadParam { .. }
            | Self::LoadString { .. }
            | Self::LoadFunc { .. }
            | Self::AnchorLoad { .. }
            | Self::InlineAsm { .. } => {}
        }
    }

    /// Mnemonic used by the textual MIR format.
    pub fn opcode(&self) -> &'static str {
        match self {
            Self::LoadConst { .. } => "const",
            Self::LoadVar { .. } => "load",
            Self::StoreVar { .. } => "store",
            Self::LoadParam { .. } => "param",
            Self::LoadString { .. } => "string",
            Self::LoadFunc { .. } => "funcaddr",
            Self::Move { .. } => "mov",
            Self::Binary { .. } => "binary",
            Self::Unary { .. } => "unary",
            Self::Cmp { .. } => "cmp",
            Self::Call { .. } => "call",
            Self::CallIndirect { .. } => "call.ind",
            Self::AnchorLoad { .. } => "anchor.load",
            Self::AnchorPatch { .. } => "anchor.patch",
            Self::InlineAsm { .. } => "asm",
            Self::PortIn { .. } => "in",
            Self::PortOut { .. } => "out",
        }
    }
}
