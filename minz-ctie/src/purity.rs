//! Purity analysis.
//!
//! A function is pure when it stores only into its own frame, contains no
//! inline assembly or port I/O, and every callee is itself pure. The
//! analysis starts optimistic and strips purity by fixed-point iteration
//! over the call graph, so self- and mutual recursion do not block a mark.

use std::collections::{HashMap, HashSet};

use minz_mir::{FunctionFlags, Instruction, Module, Terminator};
use tracing::debug;

/// Outcome of the purity pass.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub struct PurityReport {
    /// Functions examined.
    pub total: usize,
    /// Functions marked pure.
    pub pure: usize,
}

impl PurityReport {
    /// Pure functions as a fraction of all functions.
    pub fn ratio(&self) -> f64 {
        if self.total == 0 {
            return 0.0;
        }
        self.pure as f64 / self.total as f64
    }
}

/// Whether a single function is free of local impurities.
fn locally_pure(function: &minz_mir::Function) -> bool {
    if function
        .flags
        .intersects(FunctionFlags::INLINE_ASM | FunctionFlags::IO)
    {
        return false;
    }
    let own_prefix = format!("{}.", function.name);
    for instruction in function.instructions() {
        match instruction {
            Instruction::InlineAsm { .. }
            | Instruction::PortIn { .. }
            | Instruction::PortOut { .. }
            | Instruction::AnchorPatch { .. }
            | Instruction::CallIndirect { .. } => return false,
            // Reads and writes outside the frame are observable.
            Instruction::StoreVar { name, .. } | Instruction::LoadVar { name, .. } => {
                if !name.starts_with(&own_prefix) {
                    return false;
                }
            }
            _ => {}
        }
    }
    true
}

fn callees(function: &minz_mir::Function) -> HashSet<String> {
    let mut out = HashSet::new();
    for block in &function.blocks {
        for instruction in &block.instructions {
            if let Instruction::Call { callee, .. } = instruction {
                out.insert(callee.clone());
            }
        }
        if let Some(Terminator::TailCall { callee, .. }) = &block.terminator {
            out.insert(callee.clone());
        }
    }
    out
}

/// Run the analysis, setting [`FunctionFlags::PURE`] on every function
/// that qualifies, and report the pure ratio.
pub fn analyze_purity(module: &mut Module) -> PurityReport {
    let mut pure: HashMap<String, bool> = module
        .functions()
        .map(|f| (f.name.clone(), locally_pure(f)))
        .collect();
    let call_map: HashMap<String, HashSet<String>> = module
        .functions()
        .map(|f| (f.name.clone(), callees(f)))
        .collect();

    loop {
        let mut changed = false;
        for (name, callees) in &call_map {
            if !pure[name] {
                continue;
            }
            // A callee outside the module is a runtime helper or builtin,
            // assumed impure.
            let tainted = callees
                .iter()
                .any(|callee| !pure.get(callee).copied().unwrap_or(false));
            if tainted {
                pure.insert(name.clone(), false);
                changed = true;
            }
        }
        if !changed {
            break;
        }
    }

    let mut report = PurityReport { total: 0, pure: 0 };
    for function in module.functions_mut() {
        report.total += 1;
        if pure.get(&function.name).copied().unwrap_or(false) {
            function.flags |= FunctionFlags::PURE;
            report.pure += 1;
        } else {
            function.flags -= FunctionFlags::PURE;
        }
    }
    debug!(
        pure = report.pure,
        total = report.total,
        ratio = report.ratio(),
        "purity analysis complete"
    );
    report
}

#[cfg(test)]
mod tests {
    use super::*;
    use minz_mir::{BinOp, Function, Instruction, Terminator, VReg};
    use minz_types::{SourceSpan, Type};

    fn pure_add() -> Function {
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
        f
    }

    fn caller_of(name: &str, callee: &str) -> Function {
        let mut f = Function::new(name, Type::U8, SourceSpan::synthesized());
        let dst = f.alloc_vreg();
        let entry = f.entry();
        f.push(
            entry,
            Instruction::Call {
                dst: Some(dst),
                callee: callee.into(),
                args: vec![],
            },
        );
        f.terminate(entry, Terminator::Return(Some(dst)));
        f
    }

    #[test]
    fn arithmetic_is_pure() {
        let mut module = Module::new("m");
        module.add_function(pure_add());
        let report = analyze_purity(&mut module);
        assert_eq!(report.pure, 1);
        assert!(module.function("add$u8$u8").unwrap().is_pure());
    }

    #[test]
    fn io_poisons_transitively() {
        let mut module = Module::new("m");

        let mut printer = Function::new("emit", Type::Void, SourceSpan::synthesized());
        let port = printer.alloc_vreg();
        let value = printer.alloc_vreg();
        let entry = printer.entry();
        printer.push(
            entry,
            Instruction::LoadConst {
                dst: port,
                value: 0xFE,
                ty: Type::U8,
            },
        );
        printer.push(
            entry,
            Instruction::LoadConst {
                dst: value,
                value: 7,
                ty: Type::U8,
            },
        );
        printer.push(entry, Instruction::PortOut { port, src: value });
        printer.terminate(entry, Terminator::Return(None));
        module.add_function(printer);

        module.add_function(caller_of("wrapper", "emit"));
        module.add_function(caller_of("outer", "wrapper"));
        module.add_function(pure_add());

        let report = analyze_purity(&mut module);
        assert_eq!(report.pure, 1);
        assert!(!module.function("emit").unwrap().is_pure());
        assert!(!module.function("wrapper").unwrap().is_pure());
        assert!(!module.function("outer").unwrap().is_pure());
        assert!((report.ratio() - 0.25).abs() < f64::EPSILON);
    }

    #[test]
    fn self_recursion_stays_pure() {
        let mut module = Module::new("m");
        module.add_function(caller_of("spin", "spin"));
        let report = analyze_purity(&mut module);
        assert_eq!(report.pure, 1);
    }

    #[test]
    fn unknown_callee_is_impure() {
        let mut module = Module::new("m");
        module.add_function(caller_of("user", "print_u8"));
        let report = analyze_purity(&mut module);
        assert_eq!(report.pure, 0);
    }

    #[test]
    fn global_stores_are_impure() {
        let mut module = Module::new("m");
        let mut f = Function::new("bump", Type::Void, SourceSpan::synthesized());
        let v = f.alloc_vreg();
        let entry = f.entry();
        f.push(
            entry,
            Instruction::LoadConst {
                dst: v,
                value: 1,
                ty: Type::U8,
            },
        );
        f.push(
            entry,
            Instruction::StoreVar {
                name: "score".into(),
                src: v,
            },
        );
        f.terminate(entry, Terminator::Return(None));
        module.add_function(f);

        let report = analyze_purity(&mut module);
        assert_eq!(report.pure, 0);
    }
}
