//! End-to-end checks of the analyzer: AST in, MIR out.

use minz_mir::{FunctionFlags, Instruction, Terminator};
use minz_sema::ast::*;
use minz_sema::analyze;
use minz_types::{DiagnosticSink, EnumDef, SourceSpan, Type, Variant, Word};

fn span() -> SourceSpan {
    SourceSpan::new("test.minz", 1, 1)
}

fn expr(kind: ExprKind) -> Expr {
    Expr::new(kind, span())
}

fn int(value: Word) -> Expr {
    expr(ExprKind::Int(value))
}

fn ident(name: &str) -> Expr {
    expr(ExprKind::Ident(name.into()))
}

fn call(callee: &str, args: Vec<Expr>) -> Expr {
    expr(ExprKind::Call {
        callee: callee.into(),
        args,
    })
}

fn stmt(kind: StmtKind) -> Stmt {
    Stmt { kind, span: span() }
}

fn ret(value: Expr) -> Stmt {
    stmt(StmtKind::Return(Some(value)))
}

fn param(name: &str, ty: Type) -> ParamDecl {
    ParamDecl {
        name: name.into(),
        ty,
        span: span(),
    }
}

fn fun(name: &str, params: Vec<ParamDecl>, ret: Type, stmts: Vec<Stmt>) -> FunDecl {
    FunDecl {
        name: name.into(),
        params,
        ret,
        body: Block { stmts },
        attrs: vec![],
        visibility: AstVisibility::Public,
        span: span(),
    }
}

fn program(decls: Vec<Decl>) -> Program {
    Program::single(Module {
        name: "main".into(),
        imports: vec![],
        decls,
        span: span(),
    })
}

#[test]
fn lowers_add_and_call() {
    let add = fun(
        "add",
        vec![param("a", Type::U8), param("b", Type::U8)],
        Type::U8,
        vec![ret(expr(ExprKind::Binary {
            op: BinaryOp::Add,
            lhs: Box::new(ident("a")),
            rhs: Box::new(ident("b")),
        }))],
    );
    let main = fun(
        "main",
        vec![],
        Type::U8,
        vec![ret(call("add", vec![int(5), int(3)]))],
    );

    let mut sink = DiagnosticSink::new();
    let module = analyze(&program(vec![Decl::Function(add), Decl::Function(main)]), &mut sink);
    assert!(!sink.has_errors(), "{:?}", sink.iter().collect::<Vec<_>>());

    let add = module.function("add$u8$u8").expect("mangled add");
    assert_eq!(add.params.len(), 2);
    assert!(add.params.iter().all(|p| p.tsmc));

    let main = module.function("main").expect("main keeps base name");
    let calls: Vec<_> = main
        .instructions()
        .filter_map(|i| match i {
            Instruction::Call { callee, .. } => Some(callee.clone()),
            _ => None,
        })
        .collect();
    assert_eq!(calls, ["add$u8$u8"]);
}

#[test]
fn overloads_resolve_by_argument_width() {
    let p8 = fun("print", vec![param("x", Type::U8)], Type::Void, vec![]);
    let p16 = fun("print", vec![param("x", Type::U16)], Type::Void, vec![]);
    let main = fun(
        "main",
        vec![],
        Type::Void,
        vec![
            stmt(StmtKind::Expr(call("print", vec![int(42)]))),
            stmt(StmtKind::Expr(call("print", vec![int(1000)]))),
        ],
    );

    let mut sink = DiagnosticSink::new();
    let module = analyze(
        &program(vec![
            Decl::Function(p8),
            Decl::Function(p16),
            Decl::Function(main),
        ]),
        &mut sink,
    );
    assert!(!sink.has_errors());

    let main = module.function("main").unwrap();
    let calls: Vec<_> = main
        .instructions()
        .filter_map(|i| match i {
            Instruction::Call { callee, .. } => Some(callee.clone()),
            _ => None,
        })
        .collect();
    assert_eq!(calls, ["print$u8", "print$u16"]);
}

#[test]
fn ambiguous_overload_lists_candidates() {
    let f8 = fun("f", vec![param("x", Type::U16)], Type::Void, vec![]);
    let fi16 = fun("f", vec![param("x", Type::I16)], Type::Void, vec![]);
    // An i8 argument widens to i16 only; a u8 argument widens to u16 only;
    // a call with a bool matches neither.
    let main = fun(
        "main",
        vec![],
        Type::Void,
        vec![stmt(StmtKind::Expr(call(
            "f",
            vec![expr(ExprKind::Bool(true))],
        )))],
    );

    let mut sink = DiagnosticSink::new();
    analyze(
        &program(vec![
            Decl::Function(f8),
            Decl::Function(fi16),
            Decl::Function(main),
        ]),
        &mut sink,
    );
    let diagnostic = sink.iter().next().expect("diagnostic expected");
    assert!(diagnostic.message.contains("no overload"));
    assert_eq!(diagnostic.hints.len(), 2, "all candidates listed");
}

#[test]
fn while_loop_lowers_to_branch_structure() {
    // let mut i = 0; while i < 10 { i = i + 1; }
    let main = fun(
        "main",
        vec![],
        Type::Void,
        vec![
            stmt(StmtKind::Let {
                name: "i".into(),
                ty: Some(Type::U8),
                value: int(0),
            }),
            stmt(StmtKind::While {
                cond: expr(ExprKind::Binary {
                    op: BinaryOp::Lt,
                    lhs: Box::new(ident("i")),
                    rhs: Box::new(int(10)),
                }),
                body: Block {
                    stmts: vec![stmt(StmtKind::Assign {
                        target: "i".into(),
                        value: expr(ExprKind::Binary {
                            op: BinaryOp::Add,
                            lhs: Box::new(ident("i")),
                            rhs: Box::new(int(1)),
                        }),
                    })],
                },
            }),
        ],
    );

    let mut sink = DiagnosticSink::new();
    let module = analyze(&program(vec![Decl::Function(main)]), &mut sink);
    assert!(!sink.has_errors());

    let main = module.function("main").unwrap();
    assert!(main.verify("test").is_ok());
    let has_branch = main
        .blocks
        .iter()
        .any(|b| matches!(b.terminator, Some(Terminator::Branch { .. })));
    assert!(has_branch, "loop head must branch");
    // The mutable counter lives in a named slot.
    assert!(main
        .instructions()
        .any(|i| matches!(i, Instruction::StoreVar { .. })));
}

fn direction_enum() -> EnumDef {
    EnumDef {
        name: "Dir".into(),
        variants: ["N", "E", "S", "W"]
            .iter()
            .enumerate()
            .map(|(i, n)| Variant {
                name: (*n).into(),
                value: i as u8,
            })
            .collect(),
    }
}

#[test]
fn dense_enum_match_uses_jump_table() {
    let case = stmt(StmtKind::Case {
        scrutinee: expr(ExprKind::EnumLit {
            enum_name: "Dir".into(),
            variant: "E".into(),
        }),
        arms: vec![
            CaseArm {
                variant: "N".into(),
                body: Block::default(),
                span: span(),
            },
            CaseArm {
                variant: "S".into(),
                body: Block::default(),
                span: span(),
            },
        ],
        default: Some(Block::default()),
    });
    let main = fun("main", vec![], Type::Void, vec![case]);

    let mut sink = DiagnosticSink::new();
    let module = analyze(
        &program(vec![Decl::Enum(direction_enum()), Decl::Function(main)]),
        &mut sink,
    );
    assert!(!sink.has_errors());

    let main = module.function("main").unwrap();
    let switch = main
        .blocks
        .iter()
        .find_map(|b| match &b.terminator {
            Some(Terminator::Switch { base, targets, .. }) => Some((*base, targets.len())),
            _ => None,
        })
        .expect("dense enum lowers to a switch");
    assert_eq!(switch, (0, 4));
}

#[test]
fn sparse_enum_match_uses_decision_tree() {
    let sparse = EnumDef {
        name: "Key".into(),
        variants: [(0u8, "A"), (9, "B"), (40, "C")]
            .iter()
            .map(|(value, name)| Variant {
                name: (*name).into(),
                value: *value,
            })
            .collect(),
    };
    let case = stmt(StmtKind::Case {
        scrutinee: expr(ExprKind::EnumLit {
            enum_name: "Key".into(),
            variant: "B".into(),
        }),
        arms: vec![
            CaseArm {
                variant: "A".into(),
                body: Block::default(),
                span: span(),
            },
            CaseArm {
                variant: "C".into(),
                body: Block::default(),
                span: span(),
            },
        ],
        default: None,
    });
    let main = fun("main", vec![], Type::Void, vec![case]);

    let mut sink = DiagnosticSink::new();
    let module = analyze(
        &program(vec![Decl::Enum(sparse), Decl::Function(main)]),
        &mut sink,
    );
    assert!(!sink.has_errors());

    let main = module.function("main").unwrap();
    assert!(
        !main
            .blocks
            .iter()
            .any(|b| matches!(b.terminator, Some(Terminator::Switch { .. }))),
        "sparse enums must not use a jump table"
    );
    let compares = main
        .instructions()
        .filter(|i| matches!(i, Instruction::Cmp { .. }))
        .count();
    assert!(compares >= 2, "decision tree compares the discriminant");
}

#[test]
fn single_call_lambda_captures_through_anchors() {
    // let base = 10; let add_base = |x: u8| -> u8 { return x + base; };
    // return add_base(5);
    let lambda = expr(ExprKind::Lambda {
        params: vec![param("x", Type::U8)],
        ret: Type::U8,
        body: Block {
            stmts: vec![ret(expr(ExprKind::Binary {
                op: BinaryOp::Add,
                lhs: Box::new(ident("x")),
                rhs: Box::new(ident("base")),
            }))],
        },
    });
    let main = fun(
        "main",
        vec![],
        Type::U8,
        vec![
            stmt(StmtKind::Let {
                name: "base".into(),
                ty: Some(Type::U8),
                value: int(10),
            }),
            stmt(StmtKind::Let {
                name: "add_base".into(),
                ty: None,
                value: lambda,
            }),
            ret(call("add_base", vec![int(5)])),
        ],
    );

    let mut sink = DiagnosticSink::new();
    let module = analyze(&program(vec![Decl::Function(main)]), &mut sink);
    assert!(!sink.has_errors(), "{:?}", sink.iter().collect::<Vec<_>>());

    let main_fn = module.function("main").unwrap();
    let patch = main_fn
        .instructions()
        .find_map(|i| match i {
            Instruction::AnchorPatch { function, param, .. } => Some((function.clone(), *param)),
            _ => None,
        })
        .expect("capture patched through an anchor");
    assert_eq!(patch.1, 1, "capture sits after the explicit parameter");

    let lifted = module.function(&patch.0).expect("lifted lambda exists");
    assert!(lifted.name.contains("$lambda_"));
    assert!(lifted.flags.contains(FunctionFlags::SMC));
    assert!(lifted.params[1].tsmc);
}

#[test]
fn multi_call_lambda_passes_captures_by_value() {
    let lambda = expr(ExprKind::Lambda {
        params: vec![param("x", Type::U8)],
        ret: Type::U8,
        body: Block {
            stmts: vec![ret(expr(ExprKind::Binary {
                op: BinaryOp::Add,
                lhs: Box::new(ident("x")),
                rhs: Box::new(ident("base")),
            }))],
        },
    });
    let main = fun(
        "main",
        vec![],
        Type::U8,
        vec![
            stmt(StmtKind::Let {
                name: "base".into(),
                ty: Some(Type::U8),
                value: int(10),
            }),
            stmt(StmtKind::Let {
                name: "f".into(),
                ty: None,
                value: lambda,
            }),
            stmt(StmtKind::Expr(call("f", vec![int(1)]))),
            ret(call("f", vec![int(2)])),
        ],
    );

    let mut sink = DiagnosticSink::new();
    let module = analyze(&program(vec![Decl::Function(main)]), &mut sink);
    assert!(!sink.has_errors());

    let main_fn = module.function("main").unwrap();
    assert!(
        !main_fn
            .instructions()
            .any(|i| matches!(i, Instruction::AnchorPatch { .. })),
        "multiply-called lambda must not use anchors"
    );
    let arg_counts: Vec<_> = main_fn
        .instructions()
        .filter_map(|i| match i {
            Instruction::Call { callee, args, .. } if callee.contains("$lambda_") => {
                Some(args.len())
            }
            _ => None,
        })
        .collect();
    assert_eq!(arg_counts, [2, 2], "explicit argument plus capture");
}

#[test]
fn try_lowers_to_tag_branch() {
    let may_fail = fun("may_fail", vec![], Type::U8, vec![ret(int(1))]);
    let main = fun(
        "main",
        vec![],
        Type::U8,
        vec![ret(expr(ExprKind::Try(Box::new(call("may_fail", vec![])))))],
    );

    let mut sink = DiagnosticSink::new();
    let module = analyze(
        &program(vec![Decl::Function(may_fail), Decl::Function(main)]),
        &mut sink,
    );
    assert!(!sink.has_errors());

    let main_fn = module.function("main").unwrap();
    assert!(
        main_fn.instructions().any(
            |i| matches!(i, Instruction::LoadVar { name, .. } if name == minz_sema::ERR_TAG)
        ),
        "the error tag byte is consulted"
    );
    let returns = main_fn
        .blocks
        .iter()
        .filter(|b| matches!(b.terminator, Some(Terminator::Return(_))))
        .count();
    assert!(returns >= 2, "error path early-returns");
}

#[test]
fn private_functions_are_module_local() {
    let mut secret = fun("secret", vec![], Type::Void, vec![]);
    secret.visibility = AstVisibility::Private;
    let math = Module {
        name: "math".into(),
        imports: vec![],
        decls: vec![Decl::Function(secret)],
        span: span(),
    };
    let main = Module {
        name: "main".into(),
        imports: vec![Import {
            path: "math".into(),
            alias: None,
            span: span(),
        }],
        decls: vec![Decl::Function(fun(
            "main",
            vec![],
            Type::Void,
            vec![stmt(StmtKind::Expr(call("math.secret", vec![])))],
        ))],
        span: span(),
    };

    let mut sink = DiagnosticSink::new();
    analyze(
        &Program {
            root: "main".into(),
            modules: vec![main, math],
        },
        &mut sink,
    );
    assert!(sink.iter().any(|d| d.message.contains("private")));
}

#[test]
fn duplicate_definition_is_reported() {
    let a = fun("twice", vec![param("x", Type::U8)], Type::Void, vec![]);
    let b = fun("twice", vec![param("y", Type::U8)], Type::Void, vec![]);

    let mut sink = DiagnosticSink::new();
    analyze(&program(vec![Decl::Function(a), Decl::Function(b)]), &mut sink);
    assert!(sink
        .iter()
        .any(|d| d.message.contains("duplicate definition of `twice$u8`")));
}

#[test]
fn narrowing_without_cast_is_reported() {
    let main = fun(
        "main",
        vec![param("wide", Type::U16)],
        Type::Void,
        vec![stmt(StmtKind::Let {
            name: "n".into(),
            ty: Some(Type::U8),
            value: ident("wide"),
        })],
    );

    let mut sink = DiagnosticSink::new();
    analyze(&program(vec![Decl::Function(main)]), &mut sink);
    assert!(sink.iter().any(|d| d.message.contains("narrowing")));
}

#[test]
fn interface_methods_monomorphize() {
    let point = minz_types::StructDef {
        name: "Point".into(),
        fields: vec![],
    };
    let interface = InterfaceDecl {
        name: "Printable".into(),
        methods: vec![MethodSig {
            name: "print".into(),
            params: vec![],
            ret: Type::Void,
            span: span(),
        }],
        span: span(),
    };
    let impl_block = ImplDecl {
        interface: "Printable".into(),
        ty: Type::Struct(point.clone()),
        methods: vec![fun(
            "print",
            vec![param("self", Type::Struct(point.clone()))],
            Type::Void,
            vec![],
        )],
        span: span(),
    };
    let main = fun(
        "main",
        vec![param("p", Type::Struct(point.clone()))],
        Type::Void,
        vec![stmt(StmtKind::Expr(expr(ExprKind::MethodCall {
            recv: Box::new(ident("p")),
            method: "print".into(),
            args: vec![],
        })))],
    );

    let mut sink = DiagnosticSink::new();
    let module = analyze(
        &program(vec![
            Decl::Struct(point),
            Decl::Interface(interface),
            Decl::Impl(impl_block),
            Decl::Function(main),
        ]),
        &mut sink,
    );
    assert!(!sink.has_errors(), "{:?}", sink.iter().collect::<Vec<_>>());

    let concrete = module
        .function("Printable.print$Point")
        .expect("one concrete function per (interface, type)");
    assert_eq!(concrete.params.len(), 1);

    let main_fn = module.function("main").unwrap();
    assert!(main_fn.instructions().any(|i| matches!(
        i,
        Instruction::Call { callee, .. } if callee == "Printable.print$Point"
    )));
}

#[test]
fn missing_interface_method_is_reported() {
    let interface = InterfaceDecl {
        name: "Drawable".into(),
        methods: vec![MethodSig {
            name: "draw".into(),
            params: vec![],
            ret: Type::Void,
            span: span(),
        }],
        span: span(),
    };
    let impl_block = ImplDecl {
        interface: "Drawable".into(),
        ty: Type::U8,
        methods: vec![],
        span: span(),
    };

    let mut sink = DiagnosticSink::new();
    analyze(
        &program(vec![Decl::Interface(interface), Decl::Impl(impl_block)]),
        &mut sink,
    );
    assert!(sink.iter().any(|d| d.message.contains("missing method `draw`")));
}
