//! The const tracker: finds calls with constant arguments to pure
//! functions, executes them at compile time and rewrites the call site.

use std::collections::HashSet;

use minz_mir::{BlockId, CallGraph, FunctionFlags, Instruction, Module, VReg};
use minz_types::{Type, Word};
use tracing::debug;

use crate::{interpreter::Interpreter, params::CtieParams};

/// Counters reported after a CTIE run.
#[derive(Debug, Clone, Copy, Default, PartialEq, Eq)]
pub struct CtieStats {
    /// Call sites whose arguments were all constant and whose callee was
    /// pure.
    pub candidates: usize,
    /// Call sites rewritten to a constant load.
    pub folded: usize,
    /// Candidates rejected by the step budget or recursion depth.
    pub rejected_budget: usize,
    /// Candidates rejected because execution hit an unsupported opcode or
    /// a runtime fault.
    pub rejected_other: usize,
    /// Callees left without any remaining call site and skipped by
    /// codegen.
    pub dead_functions: usize,
}

/// The compile-time execution engine.
#[derive(Debug, Default)]
pub struct CtieEngine {
    params: CtieParams,
    /// Counters of the last run.
    pub stats: CtieStats,
}

/// A planned call-site rewrite.
struct Rewrite {
    function: String,
    block: BlockId,
    index: usize,
    replacement: Option<Instruction>,
    callee: String,
}

impl CtieEngine {
    /// Create an engine with the given bounds.
    pub fn new(params: CtieParams) -> Self {
        Self {
            params,
            stats: CtieStats::default(),
        }
    }

    /// Fold every foldable call site in the module.
    ///
    /// Purity must already be annotated. Entry points are never marked
    /// dead; a callee whose every call site folded away is flagged
    /// [`FunctionFlags::DEAD`] and skipped by codegen while remaining
    /// available in MIR.
    pub fn run(&mut self, module: &mut Module) -> CtieStats {
        self.stats = CtieStats::default();
        let rewrites = self.plan(module);
        let mut touched_callees: HashSet<String> = HashSet::new();

        // Apply in reverse so removals keep later indices valid.
        for rewrite in rewrites.into_iter().rev() {
            touched_callees.insert(rewrite.callee.clone());
            if let Some(function) = module.function_mut(&rewrite.function) {
                let block = function.block_mut(rewrite.block);
                match rewrite.replacement {
                    Some(replacement) => block.instructions[rewrite.index] = replacement,
                    // A folded void call has no observable effect left.
                    None => {
                        block.instructions.remove(rewrite.index);
                    }
                }
            }
            self.stats.folded += 1;
        }

        let graph = CallGraph::build(module);
        let address_taken: HashSet<String> = module
            .functions()
            .flat_map(|f| {
                f.instructions().filter_map(|i| match i {
                    Instruction::LoadFunc { function, .. } => Some(function.clone()),
                    _ => None,
                })
            })
            .collect();
        for function in module.functions_mut() {
            if touched_callees.contains(&function.name)
                && graph.call_site_count(&function.name) == 0
                && !address_taken.contains(&function.name)
                && function.name != "main"
            {
                function.flags |= FunctionFlags::DEAD;
                self.stats.dead_functions += 1;
                debug!(function = %function.name, "all call sites folded; body is dead");
            }
        }
        self.stats
    }

    /// Scan for candidates and evaluate them, without mutating the module.
    fn plan(&mut self, module: &Module) -> Vec<Rewrite> {
        let mut rewrites = Vec::new();
        let mut interpreter = Interpreter::new(module, self.params);

        for function in module.functions() {
            for block in &function.blocks {
                for (index, instruction) in block.instructions.iter().enumerate() {
                    let Instruction::Call { dst, callee, args } = instruction else {
                        continue;
                    };
                    let Some(target) = module.function(callee) else {
                        continue;
                    };
                    if !target.is_pure() {
                        continue;
                    }
                    let Some(values) = resolve_const_args(function, args) else {
                        continue;
                    };
                    self.stats.candidates += 1;

                    match interpreter.run(callee, &values) {
                        Ok(result) => {
                            debug!(
                                caller = %function.name,
                                callee = %callee,
                                ?values,
                                ?result,
                                "call folded to constant"
                            );
                            let replacement = match (dst, result) {
                                (Some(dst), Some(value)) => Some(Instruction::LoadConst {
                                    dst: *dst,
                                    value,
                                    ty: target.ret.clone(),
                                }),
                                (None, _) => None,
                                (Some(dst), None) => Some(Instruction::LoadConst {
                                    dst: *dst,
                                    value: 0,
                                    ty: Type::Void,
                                }),
                            };
                            rewrites.push(Rewrite {
                                function: function.name.clone(),
                                block: block.id,
                                index,
                                replacement,
                                callee: callee.clone(),
                            });
                        }
                        Err(error) if error.is_budget() => {
                            self.stats.rejected_budget += 1;
                            debug!(
                                caller = %function.name,
                                callee = %callee,
                                %error,
                                "candidate rejected, keeping original call"
                            );
                        }
                        Err(error) => {
                            self.stats.rejected_other += 1;
                            debug!(
                                caller = %function.name,
                                callee = %callee,
                                %error,
                                "candidate rejected, keeping original call"
                            );
                        }
                    }
                }
            }
        }
        rewrites
    }
}

/// Trace each argument back through moves to a constant definition.
fn resolve_const_args(function: &minz_mir::Function, args: &[VReg]) -> Option<Vec<Word>> {
    args.iter()
        .map(|&reg| resolve_const(function, reg, 0))
        .collect()
}

fn resolve_const(function: &minz_mir::Function, reg: VReg, fuel: u32) -> Option<Word> {
    if fuel > 32 {
        return None;
    }
    match function.def_of(reg)? {
        Instruction::LoadConst { value, .. } => Some(*value),
        Instruction::Move { src, .. } => resolve_const(function, *src, fuel + 1),
        _ => None,
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::purity::analyze_purity;
    use minz_mir::{BinOp, Function, Terminator};
    use minz_types::SourceSpan;

    fn add_function() -> Function {
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

    fn main_calling_add(a: Word, b: Word) -> Function {
        let mut f = Function::new("main", Type::U8, SourceSpan::synthesized());
        let ra = f.alloc_vreg();
        let rb = f.alloc_vreg();
        let result = f.alloc_vreg();
        let entry = f.entry();
        f.push(
            entry,
            Instruction::LoadConst {
                dst: ra,
                value: a,
                ty: Type::U8,
            },
        );
        f.push(
            entry,
            Instruction::LoadConst {
                dst: rb,
                value: b,
                ty: Type::U8,
            },
        );
        f.push(
            entry,
            Instruction::Call {
                dst: Some(result),
                callee: "add$u8$u8".into(),
                args: vec![ra, rb],
            },
        );
        f.terminate(entry, Terminator::Return(Some(result)));
        f
    }

    #[test]
    fn folds_constant_call_and_marks_callee_dead() {
        let mut module = Module::new("m");
        module.add_function(add_function());
        module.add_function(main_calling_add(5, 3));
        analyze_purity(&mut module);

        let mut engine = CtieEngine::new(CtieParams::default());
        let stats = engine.run(&mut module);
        assert_eq!(stats.candidates, 1);
        assert_eq!(stats.folded, 1);
        assert_eq!(stats.dead_functions, 1);

        let main = module.function("main").unwrap();
        assert!(main.instructions().any(|i| matches!(
            i,
            Instruction::LoadConst { value: 8, .. }
        )));
        assert!(!main
            .instructions()
            .any(|i| matches!(i, Instruction::Call { .. })));
        assert!(module
            .function("add$u8$u8")
            .unwrap()
            .flags
            .contains(FunctionFlags::DEAD));
    }

    #[test]
    fn eight_bit_arithmetic_wraps_like_the_target() {
        let mut module = Module::new("m");
        module.add_function(add_function());
        module.add_function(main_calling_add(200, 100));
        analyze_purity(&mut module);

        CtieEngine::new(CtieParams::default()).run(&mut module);
        let main = module.function("main").unwrap();
        // 200 + 100 wraps to 44 in u8, exactly as the emitted ADD would.
        assert!(main.instructions().any(|i| matches!(
            i,
            Instruction::LoadConst { value: 44, .. }
        )));
    }

    #[test]
    fn impure_callee_is_not_a_candidate() {
        let mut module = Module::new("m");
        let mut emit = Function::new("emit$u8", Type::Void, SourceSpan::synthesized());
        let x = emit.add_param("x", Type::U8);
        let port = emit.alloc_vreg();
        let entry = emit.entry();
        emit.push(
            entry,
            Instruction::LoadConst {
                dst: port,
                value: 0xFE,
                ty: Type::U8,
            },
        );
        emit.push(entry, Instruction::PortOut { port, src: x });
        emit.terminate(entry, Terminator::Return(None));
        module.add_function(emit);

        let mut main = Function::new("main", Type::Void, SourceSpan::synthesized());
        let arg = main.alloc_vreg();
        let entry = main.entry();
        main.push(
            entry,
            Instruction::LoadConst {
                dst: arg,
                value: 1,
                ty: Type::U8,
            },
        );
        main.push(
            entry,
            Instruction::Call {
                dst: None,
                callee: "emit$u8".into(),
                args: vec![arg],
            },
        );
        main.terminate(entry, Terminator::Return(None));
        module.add_function(main);

        analyze_purity(&mut module);
        let stats = CtieEngine::new(CtieParams::default()).run(&mut module);
        assert_eq!(stats.candidates, 0);
        assert_eq!(stats.folded, 0);
    }

    #[test]
    fn non_constant_argument_is_not_a_candidate() {
        let mut module = Module::new("m");
        module.add_function(add_function());

        let mut main = Function::new("main", Type::U8, SourceSpan::synthesized());
        let dynamic = main.add_param("d", Type::U8);
        let c = main.alloc_vreg();
        let result = main.alloc_vreg();
        let entry = main.entry();
        main.push(
            entry,
            Instruction::LoadConst {
                dst: c,
                value: 3,
                ty: Type::U8,
            },
        );
        main.push(
            entry,
            Instruction::Call {
                dst: Some(result),
                callee: "add$u8$u8".into(),
                args: vec![dynamic, c],
            },
        );
        main.terminate(entry, Terminator::Return(Some(result)));
        module.add_function(main);

        analyze_purity(&mut module);
        let stats = CtieEngine::new(CtieParams::default()).run(&mut module);
        assert_eq!(stats.candidates, 0);
    }

    #[test]
    fn runaway_recursion_is_rejected_softly() {
        let mut module = Module::new("m");

        // spin(n) { return spin(n); } -- never terminates.
        let mut spin = Function::new("spin$u8", Type::U8, SourceSpan::synthesized());
        let n = spin.add_param("n", Type::U8);
        let out = spin.alloc_vreg();
        let entry = spin.entry();
        spin.push(
            entry,
            Instruction::Call {
                dst: Some(out),
                callee: "spin$u8".into(),
                args: vec![n],
            },
        );
        spin.terminate(entry, Terminator::Return(Some(out)));
        module.add_function(spin);

        let mut main = Function::new("main", Type::U8, SourceSpan::synthesized());
        let arg = main.alloc_vreg();
        let result = main.alloc_vreg();
        let entry = main.entry();
        main.push(
            entry,
            Instruction::LoadConst {
                dst: arg,
                value: 1,
                ty: Type::U8,
            },
        );
        main.push(
            entry,
            Instruction::Call {
                dst: Some(result),
                callee: "spin$u8".into(),
                args: vec![arg],
            },
        );
        main.terminate(entry, Terminator::Return(Some(result)));
        module.add_function(main);

        analyze_purity(&mut module);
        let mut engine = CtieEngine::new(CtieParams::default());
        let stats = engine.run(&mut module);

        assert_eq!(stats.folded, 0);
        assert_eq!(
            stats.rejected_budget, 1,
            "the constant-argument call site hits the depth bound"
        );
        // The original calls stay.
        let main = module.function("main").unwrap();
        assert!(main
            .instructions()
            .any(|i| matches!(i, Instruction::Call { .. })));
    }

    #[test]
    fn ctie_matches_reference_interpretation() {
        // The folded value must equal what a fresh interpretation of the
        // original callee computes.
        let mut module = Module::new("m");
        module.add_function(add_function());
        module.add_function(main_calling_add(41, 1));
        analyze_purity(&mut module);

        let expected = Interpreter::new(&module, CtieParams::default())
            .run("add$u8$u8", &[41, 1])
            .unwrap();

        CtieEngine::new(CtieParams::default()).run(&mut module);
        let main = module.function("main").unwrap();
        let folded = main.instructions().find_map(|i| match i {
            Instruction::LoadConst { value, ty, .. } if *ty == Type::U8 && *value == 42 => {
                Some(*value)
            }
            _ => None,
        });
        assert_eq!(folded, expected);
    }
}
