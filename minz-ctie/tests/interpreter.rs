//! Interpreter behavior over whole functions: recursion, tail loops,
//! bounds.

use minz_ctie::{CtieParams, Interpreter, RuntimeError};
use minz_mir::{BinOp, CmpOp, Function, Instruction, Module, Terminator};
use minz_types::{SourceSpan, Type, Word};

/// fact(n, acc) -> if n == 0 { acc } else { tailcall fact(n - 1, acc * n) }
fn tail_factorial() -> Function {
    let mut f = Function::new("fact$u8$u16", Type::U16, SourceSpan::synthesized());
    let n = f.add_param("n", Type::U8);
    let acc = f.add_param("acc", Type::U16);

    let entry = f.entry();
    let base = f.add_block("base");
    let step = f.add_block("step");

    let zero = f.alloc_vreg();
    f.push(
        entry,
        Instruction::LoadConst {
            dst: zero,
            value: 0,
            ty: Type::U8,
        },
    );
    let done = f.alloc_vreg();
    f.push(
        entry,
        Instruction::Cmp {
            op: CmpOp::Eq,
            dst: done,
            lhs: n,
            rhs: zero,
        },
    );
    f.terminate(
        entry,
        Terminator::Branch {
            cond: done,
            then_block: base,
            else_block: step,
        },
    );

    f.terminate(base, Terminator::Return(Some(acc)));

    let one = f.alloc_vreg();
    f.push(
        step,
        Instruction::LoadConst {
            dst: one,
            value: 1,
            ty: Type::U8,
        },
    );
    let n1 = f.alloc_vreg();
    f.push(
        step,
        Instruction::Binary {
            op: BinOp::Sub,
            dst: n1,
            lhs: n,
            rhs: one,
        },
    );
    let acc1 = f.alloc_vreg();
    f.push(
        step,
        Instruction::Binary {
            op: BinOp::Mul,
            dst: acc1,
            lhs: acc,
            rhs: n,
        },
    );
    f.terminate(
        step,
        Terminator::TailCall {
            callee: "fact$u8$u16".into(),
            args: vec![n1, acc1],
        },
    );
    f
}

/// down(n) -> if n == 0 { 0 } else { down(n - 1) }, via a real call.
fn recursive_countdown() -> Function {
    let mut f = Function::new("down$u16", Type::U16, SourceSpan::synthesized());
    let n = f.add_param("n", Type::U16);

    let entry = f.entry();
    let base = f.add_block("base");
    let step = f.add_block("step");

    let zero = f.alloc_vreg();
    f.push(
        entry,
        Instruction::LoadConst {
            dst: zero,
            value: 0,
            ty: Type::U16,
        },
    );
    let done = f.alloc_vreg();
    f.push(
        entry,
        Instruction::Cmp {
            op: CmpOp::Eq,
            dst: done,
            lhs: n,
            rhs: zero,
        },
    );
    f.terminate(
        entry,
        Terminator::Branch {
            cond: done,
            then_block: base,
            else_block: step,
        },
    );

    f.terminate(base, Terminator::Return(Some(zero)));

    let one = f.alloc_vreg();
    f.push(
        step,
        Instruction::LoadConst {
            dst: one,
            value: 1,
            ty: Type::U16,
        },
    );
    let n1 = f.alloc_vreg();
    f.push(
        step,
        Instruction::Binary {
            op: BinOp::Sub,
            dst: n1,
            lhs: n,
            rhs: one,
        },
    );
    let out = f.alloc_vreg();
    f.push(
        step,
        Instruction::Call {
            dst: Some(out),
            callee: "down$u16".into(),
            args: vec![n1],
        },
    );
    f.terminate(step, Terminator::Return(Some(out)));
    f
}

fn run(module: &Module, name: &str, args: &[Word]) -> Result<Option<Word>, RuntimeError> {
    Interpreter::new(module, CtieParams::default()).run(name, args)
}

#[test]
fn tail_recursive_factorial_evaluates() {
    let mut module = Module::new("m");
    module.add_function(tail_factorial());
    assert_eq!(run(&module, "fact$u8$u16", &[5, 1]).unwrap(), Some(120));
    assert_eq!(run(&module, "fact$u8$u16", &[0, 1]).unwrap(), Some(1));
}

#[test]
fn tail_loops_do_not_consume_frames() {
    // 200 iterations with a depth cap of 4: only tail restarts, so the
    // cap is never hit.
    let mut module = Module::new("m");
    module.add_function(tail_factorial());
    let params = CtieParams {
        max_depth: 4,
        ..CtieParams::default()
    };
    let result = Interpreter::new(&module, params).run("fact$u8$u16", &[200, 1]);
    assert!(result.is_ok());
}

#[test]
fn deep_recursion_hits_the_depth_bound() {
    let mut module = Module::new("m");
    module.add_function(recursive_countdown());
    let err = run(&module, "down$u16", &[1000]).unwrap_err();
    assert_eq!(err, RuntimeError::DepthExceeded(64));
}

#[test]
fn shallow_recursion_completes() {
    let mut module = Module::new("m");
    module.add_function(recursive_countdown());
    assert_eq!(run(&module, "down$u16", &[20]).unwrap(), Some(0));
}

#[test]
fn step_budget_rejects_long_loops() {
    let mut module = Module::new("m");
    module.add_function(tail_factorial());
    let params = CtieParams {
        step_budget: 50,
        ..CtieParams::default()
    };
    let err = Interpreter::new(&module, params)
        .run("fact$u8$u16", &[200, 1])
        .unwrap_err();
    assert_eq!(err, RuntimeError::StepLimitExceeded(50));
}

#[test]
fn division_by_zero_is_recoverable() {
    let mut module = Module::new("m");
    let mut f = Function::new("halve$u8$u8", Type::U8, SourceSpan::synthesized());
    let a = f.add_param("a", Type::U8);
    let b = f.add_param("b", Type::U8);
    let q = f.alloc_vreg();
    let entry = f.entry();
    f.push(
        entry,
        Instruction::Binary {
            op: BinOp::Div,
            dst: q,
            lhs: a,
            rhs: b,
        },
    );
    f.terminate(entry, Terminator::Return(Some(q)));
    module.add_function(f);

    assert_eq!(run(&module, "halve$u8$u8", &[8, 2]).unwrap(), Some(4));
    assert_eq!(
        run(&module, "halve$u8$u8", &[8, 0]).unwrap_err(),
        RuntimeError::DivisionByZero
    );
}

#[test]
fn io_opcodes_reject_the_candidate() {
    let mut module = Module::new("m");
    let mut f = Function::new("probe", Type::U8, SourceSpan::synthesized());
    let port = f.alloc_vreg();
    let value = f.alloc_vreg();
    let entry = f.entry();
    f.push(
        entry,
        Instruction::LoadConst {
            dst: port,
            value: 0xFE,
            ty: Type::U8,
        },
    );
    f.push(entry, Instruction::PortIn { dst: value, port });
    f.terminate(entry, Terminator::Return(Some(value)));
    module.add_function(f);

    assert_eq!(
        run(&module, "probe", &[]).unwrap_err(),
        RuntimeError::UnsupportedInstruction("in")
    );
}

#[test]
fn mutual_recursion_evaluates_within_depth() {
    // even(n) / odd(n) alternating through direct calls.
    fn parity(name: &str, other: &str, base: Word) -> Function {
        let mut f = Function::new(name, Type::Bool, SourceSpan::synthesized());
        let n = f.add_param("n", Type::U8);
        let entry = f.entry();
        let done = f.add_block("base");
        let step = f.add_block("step");

        let zero = f.alloc_vreg();
        f.push(
            entry,
            Instruction::LoadConst {
                dst: zero,
                value: 0,
                ty: Type::U8,
            },
        );
        let is_zero = f.alloc_vreg();
        f.push(
            entry,
            Instruction::Cmp {
                op: CmpOp::Eq,
                dst: is_zero,
                lhs: n,
                rhs: zero,
            },
        );
        f.terminate(
            entry,
            Terminator::Branch {
                cond: is_zero,
                then_block: done,
                else_block: step,
            },
        );

        let result = f.alloc_vreg();
        f.push(
            done,
            Instruction::LoadConst {
                dst: result,
                value: base,
                ty: Type::Bool,
            },
        );
        f.terminate(done, Terminator::Return(Some(result)));

        let one = f.alloc_vreg();
        f.push(
            step,
            Instruction::LoadConst {
                dst: one,
                value: 1,
                ty: Type::U8,
            },
        );
        let n1 = f.alloc_vreg();
        f.push(
            step,
            Instruction::Binary {
                op: BinOp::Sub,
                dst: n1,
                lhs: n,
                rhs: one,
            },
        );
        let out = f.alloc_vreg();
        f.push(
            step,
            Instruction::Call {
                dst: Some(out),
                callee: other.into(),
                args: vec![n1],
            },
        );
        f.terminate(step, Terminator::Return(Some(out)));
        f
    }

    let mut module = Module::new("m");
    module.add_function(parity("even$u8", "odd$u8", 1));
    module.add_function(parity("odd$u8", "even$u8", 0));

    assert_eq!(run(&module, "even$u8", &[10]).unwrap(), Some(1));
    assert_eq!(run(&module, "even$u8", &[7]).unwrap(), Some(0));
    assert_eq!(run(&module, "odd$u8", &[7]).unwrap(), Some(1));
}
