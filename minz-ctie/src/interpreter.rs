//! The bounded MIR interpreter.
//!
//! Executes one function against a virtual register file and a private
//! scratch memory for its named local slots. Widths are tracked per value
//! so 8-bit arithmetic wraps exactly as the generated code would. Reads of
//! anything outside the frame reject the candidate, as do opcodes with no
//! compile-time semantics.

use std::collections::HashMap;

use minz_mir::{
    BinOp, CmpOp, Function, Instruction, Module, Terminator, UnOp, VReg,
};
use minz_types::{Type, Word};
use tracing::trace;

use crate::{error::RuntimeError, params::CtieParams, state::ExecuteState};

/// Width of a machine value, in target bits.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
enum Width {
    B8,
    B16,
}

impl Width {
    fn of(ty: &Type) -> Self {
        if ty.size_of() <= 1 {
            Self::B8
        } else {
            Self::B16
        }
    }

    fn mask(self) -> Word {
        match self {
            Self::B8 => 0xFF,
            Self::B16 => 0xFFFF,
        }
    }

    fn max(self, other: Self) -> Self {
        if self == Self::B16 || other == Self::B16 {
            Self::B16
        } else {
            Self::B8
        }
    }
}

/// A typed machine value.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
struct Value {
    raw: Word,
    width: Width,
}

impl Value {
    fn new(raw: Word, width: Width) -> Self {
        Self {
            raw: raw & width.mask(),
            width,
        }
    }

    /// Interpret the raw bits as a signed value of this width.
    fn signed(self) -> Word {
        match self.width {
            Width::B8 => self.raw as u8 as i8 as Word,
            Width::B16 => self.raw as u16 as i16 as Word,
        }
    }
}

/// One call frame: the register file plus the instruction cursor.
struct Frame {
    regs: Vec<Option<Value>>,
}

impl Frame {
    fn new(function: &Function) -> Self {
        Self {
            regs: vec![None; function.vreg_count() as usize],
        }
    }

    fn read(&self, reg: VReg) -> Result<Value, RuntimeError> {
        self.regs
            .get(reg.0 as usize)
            .copied()
            .flatten()
            .ok_or(RuntimeError::UninitializedRegister(reg))
    }

    fn write(&mut self, reg: VReg, value: Value) {
        if let Some(slot) = self.regs.get_mut(reg.0 as usize) {
            *slot = Some(value);
        }
    }
}

/// Bounded evaluator over the functions of one module.
pub struct Interpreter<'m> {
    module: &'m Module,
    params: CtieParams,
    steps: u64,
    depth: usize,
    // Private scratch for named local slots, keyed by the slot's full
    // `function.variable` name. Reset between candidates.
    scratch: HashMap<String, Value>,
    // Arguments of a tail self-call waiting to restart the frame.
    pending_tail: Option<Vec<Word>>,
}

impl<'m> Interpreter<'m> {
    /// Create an interpreter over a module.
    pub fn new(module: &'m Module, params: CtieParams) -> Self {
        Self {
            module,
            params,
            steps: 0,
            depth: 0,
            scratch: HashMap::new(),
            pending_tail: None,
        }
    }

    /// Execute `function` with the given argument values.
    ///
    /// Counters and scratch are reset first, so an interpreter may be
    /// reused across candidates.
    pub fn run(&mut self, function: &str, args: &[Word]) -> Result<Option<Word>, RuntimeError> {
        self.steps = 0;
        self.depth = 0;
        self.scratch.clear();
        self.call(function, args)
    }

    fn call(&mut self, name: &str, args: &[Word]) -> Result<Option<Word>, RuntimeError> {
        let function = self
            .module
            .function(name)
            .ok_or_else(|| RuntimeError::UnknownFunction(name.to_owned()))?;

        if self.depth >= self.params.max_depth {
            return Err(RuntimeError::DepthExceeded(self.params.max_depth));
        }
        self.depth += 1;
        let result = self.run_frame(function, args);
        self.depth -= 1;
        result
    }

    fn run_frame(
        &mut self,
        function: &Function,
        args: &[Word],
    ) -> Result<Option<Word>, RuntimeError> {
        let mut frame = Frame::new(function);
        let mut args = args.to_vec();

        'restart: loop {
            for (param, value) in function.params.iter().zip(&args) {
                frame.write(param.vreg, Value::new(*value, Width::of(&param.ty)));
            }

            let mut block = function.entry();
            loop {
                match self.run_block(function, &mut frame, block)? {
                    ExecuteState::Jump(next) => block = next,
                    ExecuteState::Return(value) => return Ok(value),
                }

                // A tail self-call rebinds the parameters and restarts
                // without consuming a frame, mirroring the generated
                // `JP` loop.
                if let Some(new_args) = self.pending_tail.take() {
                    args = new_args;
                    frame = Frame::new(function);
                    continue 'restart;
                }
            }
        }
    }

    fn run_block(
        &mut self,
        function: &Function,
        frame: &mut Frame,
        block: minz_mir::BlockId,
    ) -> Result<ExecuteState, RuntimeError> {
        let block = function.block(block);
        for instruction in &block.instructions {
            self.charge()?;
            trace!(function = %function.name, %instruction, "ctie step");
            self.execute(function, frame, instruction)?;
        }

        self.charge()?;
        let terminator = block
            .terminator
            .as_ref()
            .ok_or(RuntimeError::UnsupportedInstruction("unterminated block"))?;
        match terminator {
            Terminator::Jump(target) => Ok(ExecuteState::Jump(*target)),
            Terminator::Branch {
                cond,
                then_block,
                else_block,
            } => {
                let taken = frame.read(*cond)?.raw != 0;
                Ok(ExecuteState::Jump(if taken { *then_block } else { *else_block }))
            }
            Terminator::Switch {
                on,
                base,
                targets,
                default,
            } => {
                let value = frame.read(*on)?.raw;
                let index = value - *base as Word;
                let target = if (0..targets.len() as Word).contains(&index) {
                    targets[index as usize]
                } else {
                    *default
                };
                Ok(ExecuteState::Jump(target))
            }
            Terminator::Return(value) => {
                let value = value.map(|reg| frame.read(reg)).transpose()?;
                Ok(ExecuteState::Return(value.map(|v| v.raw)))
            }
            Terminator::TailCall { callee, args } => {
                let values: Vec<Word> = args
                    .iter()
                    .map(|reg| frame.read(*reg).map(|v| v.raw))
                    .collect::<Result<_, _>>()?;
                if callee == &function.name {
                    self.pending_tail = Some(values);
                    // Dummy jump; run_frame restarts before using it.
                    Ok(ExecuteState::Jump(function.entry()))
                } else {
                    let result = self.call(callee, &values)?;
                    Ok(ExecuteState::Return(result))
                }
            }
        }
    }

    fn execute(
        &mut self,
        function: &Function,
        frame: &mut Frame,
        instruction: &Instruction,
    ) -> Result<(), RuntimeError> {
        match instruction {
            Instruction::LoadConst { dst, value, ty } => {
                frame.write(*dst, Value::new(*value, Width::of(ty)));
            }
            Instruction::LoadVar { dst, name } => {
                // Only this frame's own slots are readable; anything else
                // is not constant at compile time.
                if !name.starts_with(&format!("{}.", function.name)) {
                    return Err(RuntimeError::NonConstRead(name.clone()));
                }
                let value = self
                    .scratch
                    .get(name)
                    .copied()
                    .ok_or_else(|| RuntimeError::NonConstRead(name.clone()))?;
                frame.write(*dst, value);
            }
            Instruction::StoreVar { name, src } => {
                if !name.starts_with(&format!("{}.", function.name)) {
                    return Err(RuntimeError::UnsupportedInstruction("store outside frame"));
                }
                let value = frame.read(*src)?;
                self.scratch.insert(name.clone(), value);
            }
            Instruction::LoadParam { dst, index } => {
                let param = function
                    .params
                    .get(*index as usize)
                    .ok_or(RuntimeError::UnsupportedInstruction(
                        "parameter index out of range",
                    ))?;
                let value = frame.read(param.vreg)?;
                frame.write(*dst, value);
            }
            Instruction::Move { dst, src } => {
                let value = frame.read(*src)?;
                frame.write(*dst, value);
            }
            Instruction::Binary { op, dst, lhs, rhs } => {
                let lhs = frame.read(*lhs)?;
                let rhs = frame.read(*rhs)?;
                let width = lhs.width.max(rhs.width);
                let raw = self.binary(*op, lhs, rhs)?;
                frame.write(*dst, Value::new(raw, width));
            }
            Instruction::Unary { op, dst, src } => {
                let value = frame.read(*src)?;
                let raw = match op {
                    UnOp::Neg => -value.signed(),
                    UnOp::Not => !value.raw,
                };
                frame.write(*dst, Value::new(raw, value.width));
            }
            Instruction::Cmp { op, dst, lhs, rhs } => {
                let lhs = frame.read(*lhs)?;
                let rhs = frame.read(*rhs)?;
                let result = match op {
                    CmpOp::Eq => lhs.raw == rhs.raw,
                    CmpOp::Ne => lhs.raw != rhs.raw,
                    CmpOp::Lt => lhs.raw < rhs.raw,
                    CmpOp::Le => lhs.raw <= rhs.raw,
                    CmpOp::Gt => lhs.raw > rhs.raw,
                    CmpOp::Ge => lhs.raw >= rhs.raw,
                    CmpOp::Slt => lhs.signed() < rhs.signed(),
                    CmpOp::Sle => lhs.signed() <= rhs.signed(),
                    CmpOp::Sgt => lhs.signed() > rhs.signed(),
                    CmpOp::Sge => lhs.signed() >= rhs.signed(),
                };
                frame.write(*dst, Value::new(result as Word, Width::B8));
            }
            Instruction::Call { dst, callee, args } => {
                let values: Vec<Word> = args
                    .iter()
                    .map(|reg| frame.read(*reg).map(|v| v.raw))
                    .collect::<Result<_, _>>()?;
                let result = self.call(callee, &values)?;
                if let Some(dst) = dst {
                    let value = result.ok_or(RuntimeError::MissingReturnValue)?;
                    let width = self
                        .module
                        .function(callee)
                        .map(|f| Width::of(&f.ret))
                        .unwrap_or(Width::B16);
                    frame.write(*dst, Value::new(value, width));
                }
            }
            Instruction::LoadString { .. } => {
                return Err(RuntimeError::UnsupportedInstruction("string"))
            }
            Instruction::LoadFunc { .. } => {
                return Err(RuntimeError::UnsupportedInstruction("funcaddr"))
            }
            Instruction::CallIndirect { .. } => {
                return Err(RuntimeError::UnsupportedInstruction("call.ind"))
            }
            Instruction::AnchorLoad { .. } => {
                return Err(RuntimeError::UnsupportedInstruction("anchor.load"))
            }
            Instruction::AnchorPatch { .. } => {
                return Err(RuntimeError::UnsupportedInstruction("anchor.patch"))
            }
            Instruction::InlineAsm { .. } => {
                return Err(RuntimeError::UnsupportedInstruction("asm"))
            }
            Instruction::PortIn { .. } => return Err(RuntimeError::UnsupportedInstruction("in")),
            Instruction::PortOut { .. } => {
                return Err(RuntimeError::UnsupportedInstruction("out"))
            }
        }
        Ok(())
    }

    fn binary(&self, op: BinOp, lhs: Value, rhs: Value) -> Result<Word, RuntimeError> {
        Ok(match op {
            BinOp::Add => lhs.raw.wrapping_add(rhs.raw),
            BinOp::Sub => lhs.raw.wrapping_sub(rhs.raw),
            BinOp::Mul => lhs.raw.wrapping_mul(rhs.raw),
            BinOp::Div => lhs
                .raw
                .checked_div(rhs.raw)
                .ok_or(RuntimeError::DivisionByZero)?,
            BinOp::Sdiv => lhs
                .signed()
                .checked_div(rhs.signed())
                .ok_or(RuntimeError::DivisionByZero)?,
            BinOp::Rem => lhs
                .raw
                .checked_rem(rhs.raw)
                .ok_or(RuntimeError::DivisionByZero)?,
            BinOp::Srem => lhs
                .signed()
                .checked_rem(rhs.signed())
                .ok_or(RuntimeError::DivisionByZero)?,
            BinOp::And => lhs.raw & rhs.raw,
            BinOp::Or => lhs.raw | rhs.raw,
            BinOp::Xor => lhs.raw ^ rhs.raw,
            BinOp::Shl => lhs.raw.wrapping_shl(rhs.raw as u32),
            BinOp::Shr => (lhs.raw as u32).wrapping_shr(rhs.raw as u32) as Word,
            BinOp::Sar => lhs.signed().wrapping_shr(rhs.raw as u32),
        })
    }

    fn charge(&mut self) -> Result<(), RuntimeError> {
        self.steps += 1;
        if self.steps > self.params.step_budget {
            return Err(RuntimeError::StepLimitExceeded(self.params.step_budget));
        }
        Ok(())
    }
}
