//! The individual MIR passes. Each returns the number of changes it made
//! so the driver can iterate to fixed point.

use std::collections::{HashMap, HashSet};

use minz_mir::{BinOp, Function, Instruction, Terminator, UnOp, VReg};
use minz_types::{Type, Word};

fn const_defs(function: &Function) -> HashMap<VReg, (Word, Type)> {
    let mut out = HashMap::new();
    for instruction in function.instructions() {
        if let Instruction::LoadConst { dst, value, ty } = instruction {
            out.insert(*dst, (*value, ty.clone()));
        }
    }
    out
}

fn width_mask(ty: &Type) -> Word {
    if ty.size_of() <= 1 {
        0xFF
    } else {
        0xFFFF
    }
}

/// Fold operations whose operands are all constant.
///
/// This is the MIR peephole of the pipeline: `{const K; const K'; add}`
/// collapses into a single `const K+K'` in the operation's width.
pub fn constant_fold(function: &mut Function) -> usize {
    let consts = const_defs(function);
    let mut changes = 0;

    for block in &mut function.blocks {
        for instruction in &mut block.instructions {
            let folded = match instruction {
                Instruction::Binary { op, dst, lhs, rhs } => {
                    match (consts.get(lhs), consts.get(rhs)) {
                        (Some((l, lt)), Some((r, rt))) => {
                            fold_binary(*op, *l, *r).map(|value| {
                                let ty = if width_mask(lt) >= width_mask(rt) {
                                    lt.clone()
                                } else {
                                    rt.clone()
                                };
                                Instruction::LoadConst {
                                    dst: *dst,
                                    value: value & width_mask(&ty),
                                    ty,
                                }
                            })
                        }
                        _ => None,
                    }
                }
                Instruction::Unary { op, dst, src } => consts.get(src).map(|(v, ty)| {
                    let value = match op {
                        UnOp::Neg => -*v,
                        UnOp::Not => !*v,
                    };
                    Instruction::LoadConst {
                        dst: *dst,
                        value: value & width_mask(ty),
                        ty: ty.clone(),
                    }
                }),
                _ => None,
            };
            if let Some(replacement) = folded {
                *instruction = replacement;
                changes += 1;
            }
        }
    }
    changes
}

fn fold_binary(op: BinOp, l: Word, r: Word) -> Option<Word> {
    Some(match op {
        BinOp::Add => l.wrapping_add(r),
        BinOp::Sub => l.wrapping_sub(r),
        BinOp::Mul => l.wrapping_mul(r),
        BinOp::Div | BinOp::Sdiv => l.checked_div(r)?,
        BinOp::Rem | BinOp::Srem => l.checked_rem(r)?,
        BinOp::And => l & r,
        BinOp::Or => l | r,
        BinOp::Xor => l ^ r,
        BinOp::Shl => l.wrapping_shl(r as u32),
        BinOp::Shr => (l as u32).wrapping_shr(r as u32) as Word,
        BinOp::Sar => l.wrapping_shr(r as u32),
    })
}

/// Forward copies: a use of `mov`'s destination reads its source instead.
pub fn copy_propagation(function: &mut Function) -> usize {
    let mut copies: HashMap<VReg, VReg> = HashMap::new();
    for instruction in function.instructions() {
        if let Instruction::Move { dst, src } = instruction {
            copies.insert(*dst, *src);
        }
    }
    if copies.is_empty() {
        return 0;
    }
    // Resolve chains (a <- b <- c) before substituting.
    let resolve = |mut reg: VReg| {
        let mut fuel = copies.len();
        while let Some(&next) = copies.get(&reg) {
            reg = next;
            if fuel == 0 {
                break;
            }
            fuel -= 1;
        }
        reg
    };

    let mut changes = 0;
    for block in &mut function.blocks {
        for instruction in &mut block.instructions {
            if matches!(instruction, Instruction::Move { .. }) {
                continue;
            }
            for used in instruction.uses() {
                let target = resolve(used);
                if target != used {
                    instruction.replace_use(used, target);
                    changes += 1;
                }
            }
        }
        if let Some(terminator) = &mut block.terminator {
            for used in terminator.uses() {
                let target = resolve(used);
                if target != used {
                    terminator.replace_use(used, target);
                    changes += 1;
                }
            }
        }
    }
    changes
}

/// Strength reduction and identity removal: `x+0`, `x*1`, `x*2^k`.
pub fn algebraic_simplify(function: &mut Function) -> usize {
    let consts = const_defs(function);
    let mut changes = 0;

    for block_index in 0..function.blocks.len() {
        for index in 0..function.blocks[block_index].instructions.len() {
            let instruction = function.blocks[block_index].instructions[index].clone();
            let Instruction::Binary { op, dst, lhs, rhs } = instruction else {
                continue;
            };
            let rhs_const = consts.get(&rhs).map(|(v, _)| *v);

            let replacement = match (op, rhs_const) {
                (BinOp::Add | BinOp::Sub | BinOp::Or | BinOp::Xor, Some(0))
                | (BinOp::Mul | BinOp::Div, Some(1))
                | (BinOp::Shl | BinOp::Shr, Some(0)) => {
                    Some(vec![Instruction::Move { dst, src: lhs }])
                }
                (BinOp::Mul, Some(0)) => Some(vec![Instruction::LoadConst {
                    dst,
                    value: 0,
                    ty: Type::U8,
                }]),
                (BinOp::Mul, Some(k)) if k > 2 && (k & (k - 1)) == 0 => {
                    // Multiplication by a power of two becomes a shift.
                    let shift = function.alloc_vreg();
                    Some(vec![
                        Instruction::LoadConst {
                            dst: shift,
                            value: k.trailing_zeros() as Word,
                            ty: Type::U8,
                        },
                        Instruction::Binary {
                            op: BinOp::Shl,
                            dst,
                            lhs,
                            rhs: shift,
                        },
                    ])
                }
                (BinOp::Mul, Some(2)) => Some(vec![Instruction::Binary {
                    op: BinOp::Add,
                    dst,
                    lhs,
                    rhs: lhs,
                }]),
                _ => None,
            };

            if let Some(replacement) = replacement {
                let block = &mut function.blocks[block_index];
                block.instructions.splice(index..=index, replacement);
                changes += 1;
            }
        }
    }
    changes
}

/// Remove side-effect-free instructions whose results are never read, and
/// stores overwritten before any load of the same slot in the same block.
pub fn dead_code(function: &mut Function) -> usize {
    let mut used: HashSet<VReg> = HashSet::new();
    for block in &function.blocks {
        for instruction in &block.instructions {
            used.extend(instruction.uses());
        }
        if let Some(terminator) = &block.terminator {
            used.extend(terminator.uses());
        }
    }

    let mut changes = 0;
    for block in &mut function.blocks {
        // Dead stores: a store with a second store to the same slot before
        // any intervening load.
        let mut dead_stores: Vec<usize> = Vec::new();
        for (index, instruction) in block.instructions.iter().enumerate() {
            let Instruction::StoreVar { name, .. } = instruction else {
                continue;
            };
            for later in &block.instructions[index + 1..] {
                match later {
                    Instruction::LoadVar { name: read, .. } if read == name => break,
                    // A call may read any slot through the callee.
                    Instruction::Call { .. } | Instruction::CallIndirect { .. } => break,
                    Instruction::StoreVar { name: written, .. } if written == name => {
                        dead_stores.push(index);
                        break;
                    }
                    _ => {}
                }
            }
        }
        for index in dead_stores.into_iter().rev() {
            block.instructions.remove(index);
            changes += 1;
        }

        let before = block.instructions.len();
        block.instructions.retain(|instruction| {
            if instruction.has_side_effects() {
                return true;
            }
            match instruction.dst() {
                Some(dst) => used.contains(&dst),
                None => true,
            }
        });
        changes += before - block.instructions.len();
    }
    changes
}

/// Recognize `call` immediately followed by `ret` of the same value and
/// rewrite it into a tail call, provided the callee's parameter types
/// match the caller's so the frame can be reused. `signatures` maps every
/// module function to its parameter type list.
pub fn mark_tail_calls(
    function: &mut Function,
    signatures: &HashMap<String, Vec<Type>>,
) -> usize {
    let own_params: Vec<Type> = function.params.iter().map(|p| p.ty.clone()).collect();
    let own_name = function.name.clone();
    let mut changes = 0;

    for block in &mut function.blocks {
        let Some(Terminator::Return(returned)) = &block.terminator else {
            continue;
        };
        let Some(Instruction::Call { dst, callee, args }) = block.instructions.last() else {
            continue;
        };
        let is_tail = match (returned, dst) {
            (Some(r), Some(d)) => r == d,
            (None, None) => true,
            _ => false,
        };
        if !is_tail {
            continue;
        }
        // Frame reuse needs matching parameter layouts.
        let compatible = callee == &own_name
            || signatures
                .get(callee)
                .is_some_and(|params| *params == own_params);
        if !compatible {
            continue;
        }
        let callee = callee.clone();
        let args = args.clone();
        block.instructions.pop();
        block.terminator = Some(Terminator::TailCall { callee, args });
        changes += 1;
    }
    changes
}

#[cfg(test)]
mod tests {
    use super::*;
    use minz_mir::CmpOp;
    use minz_types::SourceSpan;

    fn empty_fn(name: &str, ret: Type) -> Function {
        Function::new(name, ret, SourceSpan::synthesized())
    }

    fn load(f: &mut Function, value: Word) -> VReg {
        let dst = f.alloc_vreg();
        let entry = f.entry();
        f.push(
            entry,
            Instruction::LoadConst {
                dst,
                value,
                ty: Type::U8,
            },
        );
        dst
    }

    #[test]
    fn folds_constant_addition() {
        let mut f = empty_fn("t", Type::U8);
        let a = load(&mut f, 5);
        let b = load(&mut f, 3);
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

        assert_eq!(constant_fold(&mut f), 1);
        assert!(f.instructions().any(|i| matches!(
            i,
            Instruction::LoadConst { value: 8, .. }
        )));
    }

    #[test]
    fn folding_respects_byte_width() {
        let mut f = empty_fn("t", Type::U8);
        let a = load(&mut f, 200);
        let b = load(&mut f, 100);
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

        constant_fold(&mut f);
        assert!(f.instructions().any(|i| matches!(
            i,
            Instruction::LoadConst { value: 44, .. }
        )));
    }

    #[test]
    fn copy_chains_collapse() {
        let mut f = empty_fn("t", Type::U8);
        let a = load(&mut f, 7);
        let b = f.alloc_vreg();
        let c = f.alloc_vreg();
        let entry = f.entry();
        f.push(entry, Instruction::Move { dst: b, src: a });
        f.push(entry, Instruction::Move { dst: c, src: b });
        f.terminate(entry, Terminator::Return(Some(c)));

        assert!(copy_propagation(&mut f) > 0);
        assert_eq!(
            f.block(f.entry()).terminator,
            Some(Terminator::Return(Some(a)))
        );

        // The moves are now dead; removal cascades over rounds.
        while dead_code(&mut f) > 0 {}
        assert_eq!(f.block(f.entry()).instructions.len(), 1);
    }

    #[test]
    fn multiplication_by_power_of_two_becomes_shift() {
        let mut f = empty_fn("t", Type::U8);
        let x = f.add_param("x", Type::U8);
        let k = load(&mut f, 8);
        let product = f.alloc_vreg();
        let entry = f.entry();
        f.push(
            entry,
            Instruction::Binary {
                op: BinOp::Mul,
                dst: product,
                lhs: x,
                rhs: k,
            },
        );
        f.terminate(entry, Terminator::Return(Some(product)));

        assert_eq!(algebraic_simplify(&mut f), 1);
        let shift = f.instructions().find_map(|i| match i {
            Instruction::Binary {
                op: BinOp::Shl,
                rhs,
                ..
            } => Some(*rhs),
            _ => None,
        });
        let shift = shift.expect("mul became shl");
        assert!(matches!(
            f.def_of(shift),
            Some(Instruction::LoadConst { value: 3, .. })
        ));
    }

    #[test]
    fn add_zero_is_removed() {
        let mut f = empty_fn("t", Type::U8);
        let x = f.add_param("x", Type::U8);
        let zero = load(&mut f, 0);
        let sum = f.alloc_vreg();
        let entry = f.entry();
        f.push(
            entry,
            Instruction::Binary {
                op: BinOp::Add,
                dst: sum,
                lhs: x,
                rhs: zero,
            },
        );
        f.terminate(entry, Terminator::Return(Some(sum)));

        assert_eq!(algebraic_simplify(&mut f), 1);
        assert!(f
            .instructions()
            .any(|i| matches!(i, Instruction::Move { .. })));
    }

    #[test]
    fn dead_store_in_block_is_removed() {
        let mut f = empty_fn("t", Type::U8);
        let a = load(&mut f, 1);
        let b = load(&mut f, 2);
        let entry = f.entry();
        f.push(
            entry,
            Instruction::StoreVar {
                name: "t.x".into(),
                src: a,
            },
        );
        f.push(
            entry,
            Instruction::StoreVar {
                name: "t.x".into(),
                src: b,
            },
        );
        let out = f.alloc_vreg();
        f.push(
            entry,
            Instruction::LoadVar {
                dst: out,
                name: "t.x".into(),
            },
        );
        f.terminate(entry, Terminator::Return(Some(out)));

        assert_eq!(dead_code(&mut f), 1);
        let stores = f
            .instructions()
            .filter(|i| matches!(i, Instruction::StoreVar { .. }))
            .count();
        assert_eq!(stores, 1);
    }

    #[test]
    fn store_read_by_call_is_kept() {
        let mut f = empty_fn("t", Type::U8);
        let a = load(&mut f, 1);
        let b = load(&mut f, 2);
        let entry = f.entry();
        f.push(
            entry,
            Instruction::StoreVar {
                name: "score".into(),
                src: a,
            },
        );
        f.push(
            entry,
            Instruction::Call {
                dst: None,
                callee: "observe".into(),
                args: vec![],
            },
        );
        f.push(
            entry,
            Instruction::StoreVar {
                name: "score".into(),
                src: b,
            },
        );
        f.terminate(entry, Terminator::Return(Some(b)));

        assert_eq!(dead_code(&mut f), 0);
    }

    #[test]
    fn self_call_before_return_becomes_tail_call() {
        let mut f = empty_fn("fact$u8$u16", Type::U16);
        let n = f.add_param("n", Type::U8);
        let acc = f.add_param("acc", Type::U16);
        let result = f.alloc_vreg();
        let entry = f.entry();
        f.push(
            entry,
            Instruction::Call {
                dst: Some(result),
                callee: "fact$u8$u16".into(),
                args: vec![n, acc],
            },
        );
        f.terminate(entry, Terminator::Return(Some(result)));

        assert_eq!(mark_tail_calls(&mut f, &HashMap::new()), 1);
        assert!(matches!(
            f.block(f.entry()).terminator,
            Some(Terminator::TailCall { .. })
        ));
        assert!(f.block(f.entry()).instructions.is_empty());
    }

    #[test]
    fn call_with_differing_result_is_not_a_tail_call() {
        let mut f = empty_fn("t", Type::U8);
        let other = load(&mut f, 3);
        let result = f.alloc_vreg();
        let entry = f.entry();
        f.push(
            entry,
            Instruction::Call {
                dst: Some(result),
                callee: "t".into(),
                args: vec![],
            },
        );
        f.terminate(entry, Terminator::Return(Some(other)));

        assert_eq!(mark_tail_calls(&mut f, &HashMap::new()), 0);
    }

    #[test]
    fn comparisons_are_not_folded_blindly() {
        // Cmp is only handled by the interpreter; the folder leaves it to
        // branch simplification in codegen.
        let mut f = empty_fn("t", Type::Bool);
        let a = load(&mut f, 1);
        let b = load(&mut f, 2);
        let c = f.alloc_vreg();
        let entry = f.entry();
        f.push(
            entry,
            Instruction::Cmp {
                op: CmpOp::Lt,
                dst: c,
                lhs: a,
                rhs: b,
            },
        );
        f.terminate(entry, Terminator::Return(Some(c)));
        assert_eq!(constant_fold(&mut f), 0);
    }
}
