//! Textual MIR rendering, the `--emit-ir` contract.
//!
//! One function per block of text:
//!
//! ```text
//! Function fact$u8$u16(n: u8 r0, acc: u16 r1) -> u16 [pure] [smc]
//! entry:
//!   r2 = const.u8 0
//!   r3 = cmp.eq r0, r2
//!   br r3, base, step
//! ```

use std::fmt;

use crate::{
    function::{Function, FunctionFlags, Terminator},
    instruction::Instruction,
    module::Module,
};

impl fmt::Display for Instruction {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        match self {
            Self::LoadConst { dst, value, ty } => {
                write!(f, "{dst} = const.{} {value}", ty.mangle())
            }
            Self::LoadVar { dst, name } => write!(f, "{dst} = load {name}"),
            Self::StoreVar { name, src } => write!(f, "store {name}, {src}"),
            Self::LoadParam { dst, index } => write!(f, "{dst} = param {index}"),
            Self::LoadString { dst, id, .. } => write!(f, "{dst} = string {id}"),
            Self::LoadFunc { dst, function } => write!(f, "{dst} = funcaddr {function}"),
            Self::Move { dst, src } => write!(f, "{dst} = mov {src}"),
            Self::Binary { op, dst, lhs, rhs } => write!(f, "{dst} = {op} {lhs}, {rhs}"),
            Self::Unary { op, dst, src } => write!(f, "{dst} = {op} {src}"),
            Self::Cmp { op, dst, lhs, rhs } => write!(f, "{dst} = cmp.{op} {lhs}, {rhs}"),
            Self::Call { dst, callee, args } => {
                if let Some(dst) = dst {
                    write!(f, "{dst} = call {callee}{}", fmt_args(args))
                } else {
                    write!(f, "call {callee}{}", fmt_args(args))
                }
            }
            Self::CallIndirect { dst, target, args } => {
                if let Some(dst) = dst {
                    write!(f, "{dst} = call.ind {target}{}", fmt_args(args))
                } else {
                    write!(f, "call.ind {target}{}", fmt_args(args))
                }
            }
            Self::AnchorLoad {
                dst,
                function,
                param,
            } => write!(f, "{dst} = anchor.load {function}[{param}]"),
            Self::AnchorPatch {
                function,
                param,
                src,
            } => write!(f, "anchor.patch {function}[{param}], {src}"),
            Self::InlineAsm { body } => write!(f, "asm {body:?}"),
            Self::PortIn { dst, port } => write!(f, "{dst} = in {port}"),
            Self::PortOut { port, src } => write!(f, "out {port}, {src}"),
        }
    }
}

fn fmt_args(args: &[crate::instruction::VReg]) -> String {
    if args.is_empty() {
        return String::new();
    }
    let rendered: Vec<_> = args.iter().map(ToString::to_string).collect();
    format!(" {}", rendered.join(", "))
}

impl fmt::Display for Terminator {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        match self {
            Self::Jump(target) => write!(f, "jump {target}"),
            Self::Branch {
                cond,
                then_block,
                else_block,
            } => write!(f, "br {cond}, {then_block}, {else_block}"),
            Self::Switch {
                on,
                base,
                targets,
                default,
            } => {
                let rendered: Vec<_> = targets.iter().map(ToString::to_string).collect();
                write!(
                    f,
                    "switch {on}, base {base}, [{}], default {default}",
                    rendered.join(", ")
                )
            }
            Self::Return(Some(value)) => write!(f, "ret {value}"),
            Self::Return(None) => write!(f, "ret"),
            Self::TailCall { callee, args } => write!(f, "tailcall {callee}{}", fmt_args(args)),
        }
    }
}

impl fmt::Display for Function {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        let params: Vec<_> = self
            .params
            .iter()
            .map(|p| format!("{}: {} {}", p.name, p.ty, p.vreg))
            .collect();
        write!(f, "Function {}({}) -> {}", self.name, params.join(", "), self.ret)?;
        if self.flags.contains(FunctionFlags::PURE) {
            write!(f, " [pure]")?;
        }
        if self.flags.contains(FunctionFlags::SMC) {
            write!(f, " [smc]")?;
        }
        writeln!(f)?;

        for block in &self.blocks {
            writeln!(f, "{}:", block.label)?;
            for instruction in &block.instructions {
                writeln!(f, "  {instruction}")?;
            }
            match &block.terminator {
                Some(terminator) => writeln!(f, "  {terminator}")?,
                None => writeln!(f, "  <unterminated>")?,
            }
        }
        Ok(())
    }
}

impl fmt::Display for Module {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        writeln!(f, "; module {}", self.name)?;
        for (id, value) in self.strings() {
            writeln!(f, "; {id} = {value:?}")?;
        }
        for function in self.functions() {
            writeln!(f, "{function}")?;
        }
        Ok(())
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::instruction::{BinOp, VReg};
    use minz_types::{SourceSpan, Type};

    #[test]
    fn function_renders_header_blocks_and_flags() {
        let mut f = Function::new("add$u8$u8", Type::U8, SourceSpan::synthesized());
        let a = f.add_param("a", Type::U8);
        let b = f.add_param("b", Type::U8);
        let sum = f.alloc_vreg();
        let entry = f.entry();
        f.push(
            entry,
            Instruction::Binary {
                op: BinOp::Add,
                dst: sum,
                lhs: a,
                rhs: b,
            },
        );
        f.terminate(entry, Terminator::Return(Some(sum)));
        f.flags |= FunctionFlags::PURE;

        let text = f.to_string();
        assert!(text.starts_with("Function add$u8$u8(a: u8 r0, b: u8 r1) -> u8 [pure]\n"));
        assert!(text.contains("entry:\n"));
        assert!(text.contains("  r2 = add r0, r1\n"));
        assert!(text.contains("  ret r2\n"));
    }

    #[test]
    fn instruction_rendering() {
        let inst = Instruction::LoadConst {
            dst: VReg(1),
            value: 8,
            ty: Type::U8,
        };
        assert_eq!(inst.to_string(), "r1 = const.u8 8");

        let call = Instruction::Call {
            dst: Some(VReg(3)),
            callee: "add$u8$u8".into(),
            args: vec![VReg(1), VReg(2)],
        };
        assert_eq!(call.to_string(), "r3 = call add$u8$u8 r1, r2");
    }
}
