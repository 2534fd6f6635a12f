//! MIR functions, basic blocks and terminators.

use bitflags::bitflags;
use minz_types::{InvariantViolation, SourceSpan, Type};

use crate::instruction::{Instruction, VReg};

bitflags! {
    /// Per-function attribute flags.
    #[derive(Debug, Clone, Copy, PartialEq, Eq, Default)]
    pub struct FunctionFlags: u8 {
        /// No observable side effects; eligible for compile-time execution.
        const PURE = 0x01;
        /// Parameters are passed by patching anchor immediates.
        const SMC = 0x02;
        /// All call sites were folded away; codegen skips the body.
        const DEAD = 0x04;
        /// Body contains verbatim assembly.
        const INLINE_ASM = 0x08;
        /// Body performs port I/O.
        const IO = 0x10;
        /// May be re-entered from an interrupt handler; disables SMC.
        const INTERRUPT = 0x20;
    }
}

/// Recursion classification from the call graph.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Default)]
#[cfg_attr(feature = "serde", derive(serde::Serialize, serde::Deserialize))]
pub enum Recursion {
    /// Not recursive.
    #[default]
    None,
    /// Calls itself directly.
    Direct,
    /// Part of a call cycle of two or more functions.
    Mutual,
    /// Reaches itself through a function pointer.
    Indirect,
}

/// A function parameter.
#[derive(Debug, Clone, PartialEq)]
#[cfg_attr(feature = "serde", derive(serde::Serialize, serde::Deserialize))]
pub struct Param {
    /// Parameter name.
    pub name: String,
    /// Parameter type.
    pub ty: Type,
    /// Register holding the incoming value.
    pub vreg: VReg,
    /// Whether this parameter may be passed through a patched immediate.
    pub tsmc: bool,
}

/// Identifier of a basic block within its function.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, PartialOrd, Ord)]
#[cfg_attr(feature = "serde", derive(serde::Serialize, serde::Deserialize))]
pub struct BlockId(pub u32);

impl std::fmt::Display for BlockId {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        write!(f, "bb{}", self.0)
    }
}

/// The single exit of a basic block.
#[derive(Debug, Clone, PartialEq)]
#[cfg_attr(feature = "serde", derive(serde::Serialize, serde::Deserialize))]
pub enum Terminator {
    /// Unconditional jump.
    Jump(BlockId),
    /// Two-way conditional branch on a boolean register.
    Branch {
        /// Condition register; nonzero takes `then_block`.
        cond: VReg,
        /// Taken successor.
        then_block: BlockId,
        /// Fall-through successor.
        else_block: BlockId,
    },
    /// Dense jump table over a byte discriminant.
    Switch {
        /// Discriminant register.
        on: VReg,
        /// Lowest discriminant covered by the table.
        base: u8,
        /// One target per contiguous discriminant value.
        targets: Vec<BlockId>,
        /// Out-of-range successor.
        default: BlockId,
    },
    /// Return, with an optional value.
    Return(Option<VReg>),
    /// Tail call; replaces the frame instead of growing the stack.
    TailCall {
        /// Mangled callee name.
        callee: String,
        /// Argument registers.
        args: Vec<VReg>,
    },
}

impl Terminator {
    /// Successor blocks, in branch order.
    pub fn successors(&self) -> Vec<BlockId> {
        match self {
            Self::Jump(target) => vec![*target],
            Self::Branch {
                then_block,
                else_block,
                ..
            } => vec![*then_block, *else_block],
            Self::Switch {
                targets, default, ..
            } => {
                let mut out = targets.clone();
                out.push(*default);
                out
            }
            Self::Return(_) | Self::TailCall { .. } => Vec::new(),
        }
    }

    /// Rewrite every read of `from` into a read of `to`.
    pub fn replace_use(&mut self, from: VReg, to: VReg) {
        let patch = |reg: &mut VReg| {
            if *reg == from {
                *reg = to;
            }
        };
        match self {
            Self::Jump(_) => {}
            Self::Branch { cond, .. } => patch(cond),
            Self::Switch { on, .. } => patch(on),
            Self::Return(Some(value)) => patch(value),
            Self::Return(None) => {}
            Self::TailCall { args, .. } => args.iter_mut().for_each(patch),
        }
    }

    /// Registers this terminator reads.
    pub fn uses(&self) -> Vec<VReg> {
        match self {
            Self::Jump(_) => Vec::new(),
            Self::Branch { cond, .. } => vec![*cond],
            Self::Switch { on, .. } => vec![*on],
            Self::Return(value) => value.iter().copied().collect(),
            Self::TailCall { args, .. } => args.clone(),
        }
    }
}

/// A basic block: straight-line instructions plus one terminator.
#[derive(Debug, Clone, PartialEq)]
#[cfg_attr(feature = "serde", derive(serde::Serialize, serde::Deserialize))]
pub struct BasicBlock {
    /// Block identifier.
    pub id: BlockId,
    /// Label used in the textual format and by `goto`.
    pub label: String,
    /// Straight-line instructions.
    pub instructions: Vec<Instruction>,
    /// Block exit; `None` only while the block is under construction.
    pub terminator: Option<Terminator>,
}

impl BasicBlock {
    /// The terminator, or an invariant violation naming `function`.
    pub fn terminator_checked(
        &self,
        phase: &'static str,
        function: &str,
    ) -> Result<&Terminator, InvariantViolation> {
        self.terminator.as_ref().ok_or_else(|| {
            InvariantViolation::new(
                phase,
                function,
                format!("basic block {} without terminator", self.label),
            )
        })
    }
}

/// A MIR function.
#[derive(Debug, Clone)]
pub struct Function {
    /// Mangled name; also the emitted label.
    pub name: String,
    /// Parameters in declaration order.
    pub params: Vec<Param>,
    /// Return type.
    pub ret: Type,
    /// Basic blocks; index 0 is the entry block.
    pub blocks: Vec<BasicBlock>,
    /// Attribute flags.
    pub flags: FunctionFlags,
    /// Recursion classification, filled by the call graph.
    pub recursion: Recursion,
    /// Raw `@abi` attribute payload, when present.
    pub abi: Option<String>,
    /// Declaration site.
    pub span: SourceSpan,
    next_vreg: u32,
}

impl Function {
    /// Create an empty function with an entry block.
    pub fn new(name: impl Into<String>, ret: Type, span: SourceSpan) -> Self {
        let mut f = Self {
            name: name.into(),
            params: Vec::new(),
            ret,
            blocks: Vec::new(),
            flags: FunctionFlags::default(),
            recursion: Recursion::None,
            abi: None,
            span,
            next_vreg: 0,
        };
        f.add_block("entry");
        f
    }

    /// Allocate a fresh virtual register.
    pub fn alloc_vreg(&mut self) -> VReg {
        let reg = VReg(self.next_vreg);
        self.next_vreg += 1;
        reg
    }

    /// Number of virtual registers allocated so far.
    pub fn vreg_count(&self) -> u32 {
        self.next_vreg
    }

    /// Append a parameter, allocating its register.
    pub fn add_param(&mut self, name: impl Into<String>, ty: Type) -> VReg {
        let vreg = self.alloc_vreg();
        let tsmc = ty.is_tsmc_eligible();
        self.params.push(Param {
            name: name.into(),
            ty,
            vreg,
            tsmc,
        });
        vreg
    }

    /// Append an empty block and return its id.
    pub fn add_block(&mut self, label: impl Into<String>) -> BlockId {
        let id = BlockId(self.blocks.len() as u32);
        self.blocks.push(BasicBlock {
            id,
            label: label.into(),
            instructions: Vec::new(),
            terminator: None,
        });
        id
    }

    /// The entry block id.
    pub fn entry(&self) -> BlockId {
        BlockId(0)
    }

    /// Immutable block access.
    pub fn block(&self, id: BlockId) -> &BasicBlock {
        &self.blocks[id.0 as usize]
    }

    /// Mutable block access.
    pub fn block_mut(&mut self, id: BlockId) -> &mut BasicBlock {
        &mut self.blocks[id.0 as usize]
    }

    /// Append an instruction to a block.
    pub fn push(&mut self, block: BlockId, instruction: Instruction) {
        self.block_mut(block).instructions.push(instruction);
    }

    /// Set a block's terminator. Later phases assume exactly one.
    pub fn terminate(&mut self, block: BlockId, terminator: Terminator) {
        self.block_mut(block).terminator = Some(terminator);
    }

    /// Whether a block already has a terminator.
    pub fn is_terminated(&self, block: BlockId) -> bool {
        self.block(block).terminator.is_some()
    }

    /// Whether the function is compiled with TSMC parameter passing.
    pub fn is_smc(&self) -> bool {
        self.flags.contains(FunctionFlags::SMC)
    }

    /// Whether the function was marked pure.
    pub fn is_pure(&self) -> bool {
        self.flags.contains(FunctionFlags::PURE)
    }

    /// Iterate instructions of all blocks in block order.
    pub fn instructions(&self) -> impl Iterator<Item = &Instruction> {
        self.blocks.iter().flat_map(|b| b.instructions.iter())
    }

    /// Find the defining instruction of a register.
    ///
    /// Registers have a single definition per block; across blocks the
    /// first definition in block order is returned.
    pub fn def_of(&self, reg: VReg) -> Option<&Instruction> {
        self.instructions().find(|i| i.dst() == Some(reg))
    }

    /// Check the structural invariants, naming `phase` in any report.
    ///
    /// Checked: every block carries exactly one terminator, no register is
    /// defined twice within one block, all successor ids are in range, and
    /// an SMC function has only TSMC-eligible parameters and is not
    /// interrupt re-entrant.
    pub fn verify(&self, phase: &'static str) -> Result<(), InvariantViolation> {
        for block in &self.blocks {
            let terminator = block.terminator_checked(phase, &self.name)?;
            for successor in terminator.successors() {
                if successor.0 as usize >= self.blocks.len() {
                    return Err(InvariantViolation::new(
                        phase,
                        &self.name,
                        format!("block {} jumps to unknown {successor}", block.label),
                    ));
                }
            }
            let mut defined = std::collections::HashSet::new();
            for instruction in &block.instructions {
                if let Some(dst) = instruction.dst() {
                    if !defined.insert(dst) {
                        return Err(InvariantViolation::new(
                            phase,
                            &self.name,
                            format!("register {dst} defined twice in block {}", block.label),
                        ));
                    }
                }
            }
        }
        if self.is_smc() {
            if self.flags.contains(FunctionFlags::INTERRUPT) {
                return Err(InvariantViolation::new(
                    phase,
                    &self.name,
                    "SMC function marked interrupt re-entrant",
                ));
            }
            if let Some(param) = self.params.iter().find(|p| !p.ty.is_tsmc_eligible()) {
                return Err(InvariantViolation::new(
                    phase,
                    &self.name,
                    format!("SMC function has non-scalar parameter `{}`", param.name),
                ));
            }
        }
        Ok(())
    }
}
