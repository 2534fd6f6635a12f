//! Lowering from the typed AST to MIR.
//!
//! Declaration is two-phase: all top-level names across the module graph
//! are declared with their signatures first, then bodies are lowered, so
//! mutual recursion needs no forward declarations. Structured control flow
//! becomes conditional branches; enum matches become jump tables or
//! decision trees; lambdas are lifted to named functions; `?`/`??` become
//! branches on the error tag byte.

use std::collections::HashMap;

use minz_mir as mir;
use minz_mir::{BinOp, BlockId, CmpOp, FunctionFlags, Instruction, Terminator, UnOp, VReg};
use minz_types::{
    Diagnostic, DiagnosticKind, DiagnosticSink, EnumDef, SourceSpan, StringKind, Type, Word,
};
use tracing::debug;

use crate::{
    ast,
    overload::{mangle, resolve_overload},
    resolve::ModuleGraph,
    symbol::{Symbol, SymbolKind, SymbolTable, Visibility},
};

/// Name of the error-tag global used by `?` and `??` lowering.
pub const ERR_TAG: &str = "__err";

/// Analyze a program, producing a MIR module.
///
/// Diagnostics accumulate in `sink`; the returned module is only meaningful
/// when the sink stayed clean.
pub fn analyze(program: &ast::Program, sink: &mut DiagnosticSink) -> mir::Module {
    Analyzer::new(program, sink).run()
}

/// How a lifted lambda receives its captured variables.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
enum CaptureMode {
    /// Captures are patched into TSMC anchors before the single call.
    Anchor,
    /// Captures are appended as ordinary by-value parameters.
    Value,
}

#[derive(Debug, Clone)]
enum Binding {
    /// Single-assignment local held in a register.
    Reg { vreg: VReg, ty: Type },
    /// Mutable local spilled to a named slot.
    Slot { name: String, ty: Type },
    /// A local bound to a lifted lambda.
    Lambda {
        mangled: String,
        explicit: Vec<Type>,
        ret: Type,
        captures: Vec<String>,
        mode: CaptureMode,
    },
}

/// The semantic analyzer.
pub struct Analyzer<'p, 'd> {
    program: &'p ast::Program,
    sink: &'d mut DiagnosticSink,
    graph: ModuleGraph,
    table: SymbolTable,
    module: mir::Module,
    enums: HashMap<String, EnumDef>,
    // (receiver type mangle, method name) -> mangled concrete function
    impls: HashMap<(String, String), String>,
    const_values: HashMap<String, Word>,
    consts_in_progress: Vec<String>,
    lambda_counter: u32,
    pending_lambdas: Vec<(String, ast::FunDecl, Vec<(String, Type)>, CaptureMode)>,
}

impl<'p, 'd> Analyzer<'p, 'd> {
    /// Prepare an analyzer for a program.
    pub fn new(program: &'p ast::Program, sink: &'d mut DiagnosticSink) -> Self {
        let graph = ModuleGraph::build(program, sink);
        Self {
            program,
            sink,
            graph,
            table: SymbolTable::new(),
            module: mir::Module::new(program.root.clone()),
            enums: HashMap::new(),
            impls: HashMap::new(),
            const_values: HashMap::new(),
            consts_in_progress: Vec::new(),
            lambda_counter: 0,
            pending_lambdas: Vec::new(),
        }
    }

    /// Run both phases and return the MIR module.
    pub fn run(mut self) -> mir::Module {
        let program = self.program;
        self.declare_builtins();
        for module in &program.modules {
            self.declare_module(module);
        }
        if self.sink.has_errors() {
            return self.module;
        }
        for module in &program.modules {
            self.define_module(module);
        }
        while let Some((module_name, decl, captures, mode)) = self.pending_lambdas.pop() {
            self.lower_lifted_lambda(&module_name, &decl, &captures, mode);
        }

        let graph = mir::CallGraph::build(&self.module);
        graph.annotate(&mut self.module);
        debug!(
            functions = self.module.functions().count(),
            "semantic analysis complete"
        );
        self.module
    }

    // ---- declaration phase ---------------------------------------------

    fn declare_builtins(&mut self) {
        let builtins: [(&str, Vec<Type>); 6] = [
            ("print_string", vec![Type::String(StringKind::PascalShort)]),
            ("print_u8", vec![Type::U8]),
            ("print_u16", vec![Type::U16]),
            ("print_hex_u8", vec![Type::U8]),
            ("print_newline", vec![]),
            ("cls", vec![]),
        ];
        for (name, params) in builtins {
            let symbol = Symbol {
                name: format!("std.{name}"),
                mangled: name.to_owned(),
                ty: Type::Function(params, Box::new(Type::Void)),
                kind: SymbolKind::Function,
                visibility: Visibility::Public,
                span: SourceSpan::synthesized(),
            };
            self.table.declare_global(symbol);
        }
    }

    fn declare_module(&mut self, module: &ast::Module) {
        for decl in &module.decls {
            match decl {
                ast::Decl::Function(f) => self.declare_function(&module.name, f, None),
                ast::Decl::Const(c) => {
                    self.declare_value(&module.name, &c.name, &c.ty, SymbolKind::Constant, &c.span)
                }
                ast::Decl::Global(g) => {
                    self.declare_value(&module.name, &g.name, &g.ty, SymbolKind::Variable, &g.span)
                }
                ast::Decl::Enum(e) => {
                    self.enums.insert(e.name.clone(), e.clone());
                    self.declare_value(
                        &module.name,
                        &e.name,
                        &Type::Enum(e.clone()),
                        SymbolKind::Type,
                        &module.span,
                    );
                }
                ast::Decl::Struct(s) => self.declare_value(
                    &module.name,
                    &s.name,
                    &Type::Struct(s.clone()),
                    SymbolKind::Type,
                    &module.span,
                ),
                ast::Decl::Interface(_) => {}
                ast::Decl::Impl(block) => self.declare_impl(&module.name, block),
            }
        }
        for decl in &module.decls {
            if let ast::Decl::Impl(block) = decl {
                self.check_impl_completeness(module, block);
            }
        }
    }

    fn declare_function(&mut self, module: &str, decl: &ast::FunDecl, rename: Option<String>) {
        let params: Vec<Type> = decl.params.iter().map(|p| p.ty.clone()).collect();
        let base = rename.unwrap_or_else(|| decl.name.clone());
        let mangled = mangle(&base, &params);
        let symbol = Symbol {
            name: format!("{module}.{base}"),
            mangled: mangled.clone(),
            ty: Type::Function(params, Box::new(decl.ret.clone())),
            kind: SymbolKind::Function,
            visibility: match decl.visibility {
                ast::AstVisibility::Public => Visibility::Public,
                ast::AstVisibility::Private => Visibility::Private,
            },
            span: decl.span.clone(),
        };
        if !self.table.declare_global(symbol) {
            self.sink.report(Diagnostic::new(
                DiagnosticKind::Semantic,
                decl.span.clone(),
                format!("duplicate definition of `{mangled}`"),
            ));
        }
    }

    fn declare_value(
        &mut self,
        module: &str,
        name: &str,
        ty: &Type,
        kind: SymbolKind,
        span: &SourceSpan,
    ) {
        let symbol = Symbol {
            name: format!("{module}.{name}"),
            mangled: name.to_owned(),
            ty: ty.clone(),
            kind,
            visibility: Visibility::Public,
            span: span.clone(),
        };
        if !self.table.declare_global(symbol) {
            self.sink.report(Diagnostic::new(
                DiagnosticKind::Semantic,
                span.clone(),
                format!("duplicate definition of `{name}`"),
            ));
        }
    }

    fn declare_impl(&mut self, module: &str, block: &ast::ImplDecl) {
        for method in &block.methods {
            // One concrete function per (interface, type, method):
            // `I.method$T`.
            let base = format!("{}.{}", block.interface, method.name);
            self.declare_function(module, method, Some(base.clone()));

            let params: Vec<Type> = method.params.iter().map(|p| p.ty.clone()).collect();
            let mangled = mangle(&base, &params);
            self.impls
                .insert((block.ty.mangle(), method.name.clone()), mangled);
        }
    }

    fn check_impl_completeness(&mut self, module: &ast::Module, block: &ast::ImplDecl) {
        let interface = module.decls.iter().find_map(|d| match d {
            ast::Decl::Interface(i) if i.name == block.interface => Some(i),
            _ => None,
        });
        let Some(interface) = interface else {
            self.sink.report(Diagnostic::new(
                DiagnosticKind::Name,
                block.span.clone(),
                format!("unknown interface `{}`", block.interface),
            ));
            return;
        };
        for sig in &interface.methods {
            if !block.methods.iter().any(|m| m.name == sig.name) {
                self.sink.report(Diagnostic::new(
                    DiagnosticKind::Semantic,
                    block.span.clone(),
                    format!(
                        "missing method `{}` in impl of `{}` for `{}`",
                        sig.name, block.interface, block.ty
                    ),
                ));
            }
        }
    }

    // ---- definition phase ----------------------------------------------

    fn define_module(&mut self, module: &ast::Module) {
        for decl in &module.decls {
            match decl {
                ast::Decl::Function(f) => self.lower_function(&module.name, f, None),
                ast::Decl::Impl(block) => {
                    for method in &block.methods {
                        let base = format!("{}.{}", block.interface, method.name);
                        self.lower_function(&module.name, method, Some(base));
                    }
                }
                ast::Decl::Const(c) => self.define_const(&module.name, c),
                ast::Decl::Global(g) => self.define_global(&module.name, g),
                ast::Decl::Enum(_) | ast::Decl::Struct(_) | ast::Decl::Interface(_) => {}
            }
        }
    }

    fn define_const(&mut self, module: &str, decl: &ast::ConstDecl) {
        if let Some(value) = self.const_eval(module, &decl.value) {
            self.const_values
                .insert(format!("{module}.{}", decl.name), value);
        }
    }

    fn define_global(&mut self, module: &str, decl: &ast::GlobalDecl) {
        let mut init = None;
        let mut string_init = None;
        match &decl.value {
            None => {}
            Some(expr) => match (&expr.kind, &decl.ty) {
                (ast::ExprKind::Str(text), Type::String(_)) => {
                    string_init = Some(self.module.intern_string(text));
                }
                _ => match self.const_eval(module, expr) {
                    Some(value) => init = Some(value),
                    None => {
                        self.sink.report(Diagnostic::new(
                            DiagnosticKind::Semantic,
                            decl.span.clone(),
                            format!("initializer of `{}` is not a constant", decl.name),
                        ));
                    }
                },
            },
        }
        self.module.add_global(mir::Global {
            name: decl.name.clone(),
            ty: decl.ty.clone(),
            init,
            string_init,
        });
    }

    fn const_eval(&mut self, module: &str, expr: &ast::Expr) -> Option<Word> {
        match &expr.kind {
            ast::ExprKind::Int(v) => Some(*v),
            ast::ExprKind::Bool(b) => Some(*b as Word),
            ast::ExprKind::EnumLit { enum_name, variant } => {
                self.enum_variant_value(enum_name, variant, &expr.span)
            }
            ast::ExprKind::Ident(name) => {
                let key = if name.contains('.') {
                    name.clone()
                } else {
                    format!("{module}.{name}")
                };
                if self.consts_in_progress.contains(&key) {
                    self.sink.report(Diagnostic::new(
                        DiagnosticKind::Semantic,
                        expr.span.clone(),
                        format!("recursive constant `{name}`"),
                    ));
                    return None;
                }
                if let Some(value) = self.const_values.get(&key) {
                    return Some(*value);
                }
                // Constant defined later in the module: evaluate on demand.
                let (owner, const_name) = key.split_once('.').unwrap_or(("", key.as_str()));
                let init = self
                    .program
                    .modules
                    .iter()
                    .find(|m| m.name == owner)
                    .and_then(|m| {
                        m.decls.iter().find_map(|d| match d {
                            ast::Decl::Const(c) if c.name == const_name => Some(&c.value),
                            _ => None,
                        })
                    });
                let owner = owner.to_owned();
                self.consts_in_progress.push(key.clone());
                let value = init.and_then(|init| self.const_eval(&owner, init));
                self.consts_in_progress.pop();
                if let Some(value) = value {
                    self.const_values.insert(key, value);
                }
                value
            }
            ast::ExprKind::Unary { op, operand } => {
                let v = self.const_eval(module, operand)?;
                Some(match op {
                    ast::UnaryOp::Neg => -v,
                    ast::UnaryOp::Not => !v,
                })
            }
            ast::ExprKind::Binary { op, lhs, rhs } => {
                let l = self.const_eval(module, lhs)?;
                let r = self.const_eval(module, rhs)?;
                Some(match op {
                    ast::BinaryOp::Add => l.wrapping_add(r),
                    ast::BinaryOp::Sub => l.wrapping_sub(r),
                    ast::BinaryOp::Mul => l.wrapping_mul(r),
                    ast::BinaryOp::Div => l.checked_div(r).unwrap_or(0),
                    ast::BinaryOp::Mod => l.checked_rem(r).unwrap_or(0),
                    ast::BinaryOp::BitAnd => l & r,
                    ast::BinaryOp::BitOr => l | r,
                    ast::BinaryOp::BitXor => l ^ r,
                    ast::BinaryOp::Shl => l.wrapping_shl(r as u32),
                    ast::BinaryOp::Shr => (l as u32).wrapping_shr(r as u32) as Word,
                    ast::BinaryOp::Eq => (l == r) as Word,
                    ast::BinaryOp::Ne => (l != r) as Word,
                    ast::BinaryOp::Lt => (l < r) as Word,
                    ast::BinaryOp::Le => (l <= r) as Word,
                    ast::BinaryOp::Gt => (l > r) as Word,
                    ast::BinaryOp::Ge => (l >= r) as Word,
                })
            }
            _ => None,
        }
    }

    fn enum_variant_value(
        &mut self,
        enum_name: &str,
        variant: &str,
        span: &SourceSpan,
    ) -> Option<Word> {
        let Some(def) = self.enums.get(enum_name) else {
            self.sink.report(Diagnostic::new(
                DiagnosticKind::Name,
                span.clone(),
                format!("unknown enum `{enum_name}`"),
            ));
            return None;
        };
        match def.variants.iter().find(|v| v.name == variant) {
            Some(v) => Some(v.value as Word),
            None => {
                self.sink.report(Diagnostic::new(
                    DiagnosticKind::Name,
                    span.clone(),
                    format!("enum `{enum_name}` has no variant `{variant}`"),
                ));
                None
            }
        }
    }

    // ---- function lowering ---------------------------------------------

    fn lower_function(&mut self, module: &str, decl: &ast::FunDecl, rename: Option<String>) {
        let params: Vec<Type> = decl.params.iter().map(|p| p.ty.clone()).collect();
        let base = rename.unwrap_or_else(|| decl.name.clone());
        let mangled = mangle(&base, &params);

        let mut f = mir::Function::new(&mangled, decl.ret.clone(), decl.span.clone());
        for param in &decl.params {
            f.add_param(&param.name, param.ty.clone());
        }
        for attr in &decl.attrs {
            match attr.name.as_str() {
                "abi" => f.abi = attr.value.clone(),
                "interrupt" => f.flags |= FunctionFlags::INTERRUPT,
                other => self.sink.report(
                    Diagnostic::new(
                        DiagnosticKind::Semantic,
                        attr.span.clone(),
                        format!("unknown attribute `@{other}`"),
                    )
                    .with_hint("supported attributes are @abi and @interrupt"),
                ),
            }
        }

        let mut ctx = FnCtx::new(f, module.to_owned(), decl.ret.clone(), &mangled);
        ctx.scan_mutated(&decl.body);
        ctx.scan_labels(&decl.body, self);

        // Parameters assigned in the body are copied into slots up front.
        for param in ctx.f.params.clone() {
            if ctx.mutated.contains(&param.name) {
                let slot = format!("{mangled}.{}", param.name);
                ctx.f.push(
                    ctx.block,
                    Instruction::StoreVar {
                        name: slot.clone(),
                        src: param.vreg,
                    },
                );
                ctx.bind(
                    param.name.clone(),
                    Binding::Slot {
                        name: slot,
                        ty: param.ty.clone(),
                    },
                );
            } else {
                ctx.bind(
                    param.name.clone(),
                    Binding::Reg {
                        vreg: param.vreg,
                        ty: param.ty.clone(),
                    },
                );
            }
        }

        self.lower_block(&mut ctx, &decl.body);

        // Fall off the end: implicit void return.
        if !ctx.terminated {
            if decl.ret == Type::Void {
                ctx.f.terminate(ctx.block, Terminator::Return(None));
            } else {
                self.sink.report(Diagnostic::new(
                    DiagnosticKind::Type,
                    decl.span.clone(),
                    format!("function `{base}` may finish without returning a value"),
                ));
                ctx.f.terminate(ctx.block, Terminator::Return(None));
            }
        }

        // Unreachable blocks created after a return and label blocks no
        // path reaches still need their terminator.
        for block in &mut ctx.f.blocks {
            if block.terminator.is_none() {
                block.terminator = Some(Terminator::Return(None));
            }
        }

        if let Err(violation) = ctx.f.verify("sema") {
            self.sink.report(Diagnostic::unspanned(
                DiagnosticKind::Internal,
                violation.to_string(),
            ));
        }
        self.module.add_function(ctx.f);
    }

    fn lower_lifted_lambda(
        &mut self,
        module: &str,
        decl: &ast::FunDecl,
        captures: &[(String, Type)],
        mode: CaptureMode,
    ) {
        let mut with_captures = decl.clone();
        for (name, ty) in captures {
            with_captures.params.push(ast::ParamDecl {
                name: name.clone(),
                ty: ty.clone(),
                span: decl.span.clone(),
            });
        }
        self.lower_function(module, &with_captures, None);
        // The mangled name includes the capture parameter types.
        let params: Vec<Type> = with_captures.params.iter().map(|p| p.ty.clone()).collect();
        let mangled = mangle(&decl.name, &params);
        if mode == CaptureMode::Anchor {
            if let Some(f) = self.module.function_mut(&mangled) {
                // Captured parameters become patchable anchors.
                let explicit = decl.params.len();
                for param in f.params.iter_mut().skip(explicit) {
                    param.tsmc = true;
                }
                f.flags |= FunctionFlags::SMC;
            }
        }
    }

    fn lower_block(&mut self, ctx: &mut FnCtx, block: &ast::Block) {
        ctx.push_scope();
        for (i, stmt) in block.stmts.iter().enumerate() {
            self.lower_stmt(ctx, stmt, &block.stmts[i + 1..]);
        }
        ctx.pop_scope();
    }

    fn lower_stmt(&mut self, ctx: &mut FnCtx, stmt: &ast::Stmt, rest: &[ast::Stmt]) {
        if ctx.terminated {
            // Unreachable code after return/goto still lowers, into a
            // fresh block the optimizer can drop.
            let label = ctx.fresh_label();
            let dead = ctx.f.add_block(format!("dead_{}", label));
            ctx.enter(dead);
        }
        match &stmt.kind {
            ast::StmtKind::Let { name, ty, value } => {
                // A lambda initializer is lifted, not evaluated; the
                // call-site count picks the capture mode.
                if let ast::ExprKind::Lambda { params, ret, body } = &value.kind {
                    let calls = count_calls(name, rest);
                    let (mangled, captures, mode) =
                        self.lift_lambda(ctx, params, ret, body, &stmt.span, calls);
                    ctx.bind(
                        name.clone(),
                        Binding::Lambda {
                            mangled,
                            explicit: params.iter().map(|p| p.ty.clone()).collect(),
                            ret: ret.clone(),
                            captures: captures.into_iter().map(|(n, _)| n).collect(),
                            mode,
                        },
                    );
                    return;
                }
                let (vreg, value_ty) = self.lower_expr(ctx, value, ty.as_ref());
                let ty = match ty {
                    Some(declared) => {
                        self.check_assignable(&value_ty, declared, &stmt.span);
                        declared.clone()
                    }
                    None => value_ty,
                };
                if ctx.mutated.contains(name) {
                    let slot = format!("{}.{name}", ctx.fn_name);
                    ctx.f.push(
                        ctx.block,
                        Instruction::StoreVar {
                            name: slot.clone(),
                            src: vreg,
                        },
                    );
                    ctx.bind(name.clone(), Binding::Slot { name: slot, ty });
                } else {
                    ctx.bind(name.clone(), Binding::Reg { vreg, ty });
                }
            }
            ast::StmtKind::Assign { target, value } => {
                let (vreg, value_ty) = self.lower_expr(ctx, value, None);
                match ctx.lookup(target).cloned() {
                    Some(Binding::Slot { name, ty }) => {
                        self.check_assignable(&value_ty, &ty, &stmt.span);
                        ctx.f.push(ctx.block, Instruction::StoreVar { name, src: vreg });
                    }
                    Some(_) => self.sink.report(Diagnostic::new(
                        DiagnosticKind::Semantic,
                        stmt.span.clone(),
                        format!("cannot assign to `{target}`"),
                    )),
                    None => {
                        // Module-level variable.
                        let key = format!("{}.{target}", ctx.module_name);
                        match self.table.overloads(&key).first().cloned() {
                            Some(symbol) if symbol.kind == SymbolKind::Variable => {
                                let name = symbol.mangled.clone();
                                let ty = symbol.ty.clone();
                                self.check_assignable(&value_ty, &ty, &stmt.span);
                                ctx.f.push(ctx.block, Instruction::StoreVar { name, src: vreg });
                            }
                            _ => self.sink.report(Diagnostic::new(
                                DiagnosticKind::Name,
                                stmt.span.clone(),
                                format!("undefined variable `{target}`"),
                            )),
                        }
                    }
                }
            }
            ast::StmtKind::Expr(expr) => {
                self.lower_expr(ctx, expr, None);
            }
            ast::StmtKind::Return(value) => {
                let vreg = value.as_ref().map(|v| {
                    let expected = ctx.ret_ty.clone();
                    let (vreg, ty) = self.lower_expr(ctx, v, Some(&expected));
                    self.check_assignable(&ty, &expected, &stmt.span);
                    vreg
                });
                ctx.f.terminate(ctx.block, Terminator::Return(vreg));
                ctx.terminated = true;
            }
            ast::StmtKind::If {
                cond,
                then_block,
                else_block,
            } => {
                let (cond_reg, _) = self.lower_expr(ctx, cond, Some(&Type::Bool));
                let n = ctx.fresh_label();
                let then_id = ctx.f.add_block(format!("then_{n}"));
                let else_id = else_block
                    .as_ref()
                    .map(|_| ctx.f.add_block(format!("else_{n}")));
                let join_id = ctx.f.add_block(format!("endif_{n}"));

                ctx.f.terminate(
                    ctx.block,
                    Terminator::Branch {
                        cond: cond_reg,
                        then_block: then_id,
                        else_block: else_id.unwrap_or(join_id),
                    },
                );

                ctx.enter(then_id);
                self.lower_block(ctx, then_block);
                if !ctx.terminated {
                    ctx.f.terminate(ctx.block, Terminator::Jump(join_id));
                }
                if let (Some(else_id), Some(else_block)) = (else_id, else_block.as_ref()) {
                    ctx.enter(else_id);
                    self.lower_block(ctx, else_block);
                    if !ctx.terminated {
                        ctx.f.terminate(ctx.block, Terminator::Jump(join_id));
                    }
                }
                ctx.enter(join_id);
            }
            ast::StmtKind::While { cond, body } => {
                let n = ctx.fresh_label();
                let head_id = ctx.f.add_block(format!("while_{n}"));
                let body_id = ctx.f.add_block(format!("loop_{n}"));
                let exit_id = ctx.f.add_block(format!("endwhile_{n}"));

                ctx.f.terminate(ctx.block, Terminator::Jump(head_id));
                ctx.enter(head_id);
                let (cond_reg, _) = self.lower_expr(ctx, cond, Some(&Type::Bool));
                ctx.f.terminate(
                    ctx.block,
                    Terminator::Branch {
                        cond: cond_reg,
                        then_block: body_id,
                        else_block: exit_id,
                    },
                );
                ctx.enter(body_id);
                self.lower_block(ctx, body);
                if !ctx.terminated {
                    ctx.f.terminate(ctx.block, Terminator::Jump(head_id));
                }
                ctx.enter(exit_id);
            }
            ast::StmtKind::Goto { label } => match ctx.labels.get(label) {
                Some(&target) => {
                    ctx.f.terminate(ctx.block, Terminator::Jump(target));
                    ctx.terminated = true;
                }
                None => self.sink.report(Diagnostic::new(
                    DiagnosticKind::Name,
                    stmt.span.clone(),
                    format!("undefined label `{label}`"),
                )),
            },
            ast::StmtKind::Label { name } => {
                let target = ctx.labels[name];
                if !ctx.terminated {
                    ctx.f.terminate(ctx.block, Terminator::Jump(target));
                }
                ctx.enter(target);
            }
            ast::StmtKind::Case {
                scrutinee,
                arms,
                default,
            } => self.lower_case(ctx, stmt, scrutinee, arms, default.as_ref()),
        }
    }

    /// Pattern matching: dense jump table for small contiguous enums,
    /// otherwise a decision tree over the discriminant.
    fn lower_case(
        &mut self,
        ctx: &mut FnCtx,
        stmt: &ast::Stmt,
        scrutinee: &ast::Expr,
        arms: &[ast::CaseArm],
        default: Option<&ast::Block>,
    ) {
        let (on, scrutinee_ty) = self.lower_expr(ctx, scrutinee, None);
        let Type::Enum(def) = scrutinee_ty else {
            self.sink.report(Diagnostic::new(
                DiagnosticKind::Type,
                stmt.span.clone(),
                "case scrutinee must have enum type",
            ));
            return;
        };

        let n = ctx.fresh_label();
        let join_id = ctx.f.add_block(format!("endcase_{n}"));
        let default_id = default.map(|_| ctx.f.add_block(format!("case_{n}_default")));
        let fallback = default_id.unwrap_or(join_id);

        let mut arm_targets: Vec<(u8, BlockId)> = Vec::new();
        let mut arm_bodies: Vec<(BlockId, &ast::Block)> = Vec::new();
        for arm in arms {
            match def.variants.iter().find(|v| v.name == arm.variant) {
                Some(variant) => {
                    let id = ctx.f.add_block(format!("case_{n}_{}", arm.variant));
                    arm_targets.push((variant.value, id));
                    arm_bodies.push((id, &arm.body));
                }
                None => self.sink.report(Diagnostic::new(
                    DiagnosticKind::Name,
                    arm.span.clone(),
                    format!("enum `{}` has no variant `{}`", def.name, arm.variant),
                )),
            }
        }

        if def.variants.len() <= 16 && def.is_contiguous() {
            let base = def.variants.iter().map(|v| v.value).min().unwrap_or(0);
            let max = def.variants.iter().map(|v| v.value).max().unwrap_or(0);
            let targets: Vec<BlockId> = (base..=max)
                .map(|value| {
                    arm_targets
                        .iter()
                        .find(|(v, _)| *v == value)
                        .map(|(_, id)| *id)
                        .unwrap_or(fallback)
                })
                .collect();
            ctx.f.terminate(
                ctx.block,
                Terminator::Switch {
                    on,
                    base,
                    targets,
                    default: fallback,
                },
            );
        } else {
            arm_targets.sort_by_key(|(value, _)| *value);
            self.lower_decision_tree(ctx, on, &arm_targets, fallback);
        }
        ctx.terminated = true;

        for (id, body) in arm_bodies {
            ctx.enter(id);
            self.lower_block(ctx, body);
            if !ctx.terminated {
                ctx.f.terminate(ctx.block, Terminator::Jump(join_id));
            }
        }
        if let (Some(id), Some(body)) = (default_id, default) {
            ctx.enter(id);
            self.lower_block(ctx, body);
            if !ctx.terminated {
                ctx.f.terminate(ctx.block, Terminator::Jump(join_id));
            }
        }
        ctx.enter(join_id);
    }

    /// Binary-search decision tree over sorted (value, target) pairs.
    fn lower_decision_tree(
        &mut self,
        ctx: &mut FnCtx,
        on: VReg,
        sorted: &[(u8, BlockId)],
        fallback: BlockId,
    ) {
        match sorted {
            [] => {
                ctx.f.terminate(ctx.block, Terminator::Jump(fallback));
            }
            [(value, target)] => {
                let imm = ctx.f.alloc_vreg();
                ctx.f.push(
                    ctx.block,
                    Instruction::LoadConst {
                        dst: imm,
                        value: *value as Word,
                        ty: Type::U8,
                    },
                );
                let cond = ctx.f.alloc_vreg();
                ctx.f.push(
                    ctx.block,
                    Instruction::Cmp {
                        op: CmpOp::Eq,
                        dst: cond,
                        lhs: on,
                        rhs: imm,
                    },
                );
                ctx.f.terminate(
                    ctx.block,
                    Terminator::Branch {
                        cond,
                        then_block: *target,
                        else_block: fallback,
                    },
                );
            }
            _ => {
                let mid = sorted.len() / 2;
                let pivot = sorted[mid].0;
                let n = ctx.fresh_label();
                let lo_id = ctx.f.add_block(format!("tree_{n}_lo"));
                let hi_id = ctx.f.add_block(format!("tree_{n}_hi"));

                let imm = ctx.f.alloc_vreg();
                ctx.f.push(
                    ctx.block,
                    Instruction::LoadConst {
                        dst: imm,
                        value: pivot as Word,
                        ty: Type::U8,
                    },
                );
                let cond = ctx.f.alloc_vreg();
                ctx.f.push(
                    ctx.block,
                    Instruction::Cmp {
                        op: CmpOp::Lt,
                        dst: cond,
                        lhs: on,
                        rhs: imm,
                    },
                );
                ctx.f.terminate(
                    ctx.block,
                    Terminator::Branch {
                        cond,
                        then_block: lo_id,
                        else_block: hi_id,
                    },
                );
                ctx.enter(lo_id);
                self.lower_decision_tree(ctx, on, &sorted[..mid], fallback);
                ctx.enter(hi_id);
                self.lower_decision_tree(ctx, on, &sorted[mid..], fallback);
            }
        }
    }

    fn check_assignable(&mut self, value: &Type, target: &Type, span: &SourceSpan) {
        if value.coerces_to(target) {
            return;
        }
        let kind = DiagnosticKind::Type;
        let diagnostic = if target.size_of() < value.size_of() {
            Diagnostic::new(
                kind,
                span.clone(),
                format!("narrowing from `{value}` to `{target}` requires a cast"),
            )
            .with_hint(format!("use `as {target}` to narrow explicitly"))
        } else {
            Diagnostic::new(
                kind,
                span.clone(),
                format!("type mismatch: expected `{target}`, found `{value}`"),
            )
        };
        self.sink.report(diagnostic);
    }

    // ---- expression lowering -------------------------------------------

    fn lower_expr(
        &mut self,
        ctx: &mut FnCtx,
        expr: &ast::Expr,
        expected: Option<&Type>,
    ) -> (VReg, Type) {
        match &expr.kind {
            ast::ExprKind::Int(value) => {
                let ty = expr
                    .ty
                    .clone()
                    .or_else(|| expected.cloned().filter(|t| t.is_scalar()))
                    .unwrap_or(if (0..=255).contains(value) {
                        Type::U8
                    } else {
                        Type::U16
                    });
                let dst = ctx.f.alloc_vreg();
                ctx.f.push(
                    ctx.block,
                    Instruction::LoadConst {
                        dst,
                        value: *value,
                        ty: ty.clone(),
                    },
                );
                (dst, ty)
            }
            ast::ExprKind::Bool(b) => {
                let dst = ctx.f.alloc_vreg();
                ctx.f.push(
                    ctx.block,
                    Instruction::LoadConst {
                        dst,
                        value: *b as Word,
                        ty: Type::Bool,
                    },
                );
                (dst, Type::Bool)
            }
            ast::ExprKind::Str(text) => {
                let kind = match expected {
                    Some(Type::String(kind)) => *kind,
                    _ => StringKind::PascalShort,
                };
                let id = self.module.intern_string(text);
                let dst = ctx.f.alloc_vreg();
                ctx.f.push(ctx.block, Instruction::LoadString { dst, id, kind });
                (dst, Type::String(kind))
            }
            ast::ExprKind::EnumLit { enum_name, variant } => {
                let value = self
                    .enum_variant_value(enum_name, variant, &expr.span)
                    .unwrap_or(0);
                let ty = self
                    .enums
                    .get(enum_name)
                    .map(|def| Type::Enum(def.clone()))
                    .unwrap_or(Type::U8);
                let dst = ctx.f.alloc_vreg();
                ctx.f.push(
                    ctx.block,
                    Instruction::LoadConst {
                        dst,
                        value,
                        ty: ty.clone(),
                    },
                );
                (dst, ty)
            }
            ast::ExprKind::Ident(name) => self.lower_ident(ctx, name, &expr.span),
            ast::ExprKind::Binary { op, lhs, rhs } => self.lower_binary(ctx, *op, lhs, rhs),
            ast::ExprKind::Unary { op, operand } => {
                let (src, ty) = self.lower_expr(ctx, operand, expected);
                let dst = ctx.f.alloc_vreg();
                let op = match op {
                    ast::UnaryOp::Neg => UnOp::Neg,
                    ast::UnaryOp::Not => UnOp::Not,
                };
                ctx.f.push(ctx.block, Instruction::Unary { op, dst, src });
                (dst, ty)
            }
            ast::ExprKind::Call { callee, args } => self.lower_call(ctx, callee, args, &expr.span),
            ast::ExprKind::MethodCall { recv, method, args } => {
                self.lower_method_call(ctx, recv, method, args, &expr.span)
            }
            ast::ExprKind::Lambda { params, ret, body } => {
                self.lower_lambda_value(ctx, params, ret, body, &expr.span)
            }
            ast::ExprKind::Try(inner) => self.lower_try(ctx, inner),
            ast::ExprKind::Coalesce { value, default } => {
                self.lower_coalesce(ctx, value, default, &expr.span)
            }
            ast::ExprKind::Cast { value, ty } => {
                let (src, src_ty) = self.lower_expr(ctx, value, None);
                if ty.size_of() < src_ty.size_of() {
                    // Explicit narrowing masks to the target width.
                    let mask = ctx.f.alloc_vreg();
                    ctx.f.push(
                        ctx.block,
                        Instruction::LoadConst {
                            dst: mask,
                            value: if ty.size_of() == 1 { 0xFF } else { 0xFFFF },
                            ty: ty.clone(),
                        },
                    );
                    let dst = ctx.f.alloc_vreg();
                    ctx.f.push(
                        ctx.block,
                        Instruction::Binary {
                            op: BinOp::And,
                            dst,
                            lhs: src,
                            rhs: mask,
                        },
                    );
                    (dst, ty.clone())
                } else {
                    let dst = ctx.f.alloc_vreg();
                    ctx.f.push(ctx.block, Instruction::Move { dst, src });
                    (dst, ty.clone())
                }
            }
            ast::ExprKind::InlineAsm(body) => {
                ctx.f.flags |= FunctionFlags::INLINE_ASM;
                ctx.f
                    .push(ctx.block, Instruction::InlineAsm { body: body.clone() });
                let dst = ctx.f.alloc_vreg();
                ctx.f.push(
                    ctx.block,
                    Instruction::LoadConst {
                        dst,
                        value: 0,
                        ty: Type::Void,
                    },
                );
                (dst, Type::Void)
            }
        }
    }

    fn lower_ident(&mut self, ctx: &mut FnCtx, name: &str, span: &SourceSpan) -> (VReg, Type) {
        if let Some(binding) = ctx.lookup(name).cloned() {
            return match binding {
                Binding::Reg { vreg, ty } => (vreg, ty),
                Binding::Slot { name, ty } => {
                    let dst = ctx.f.alloc_vreg();
                    ctx.f.push(ctx.block, Instruction::LoadVar { dst, name });
                    (dst, ty)
                }
                Binding::Lambda { mangled, captures, explicit, ret, .. } => {
                    if !captures.is_empty() {
                        self.sink.report(Diagnostic::new(
                            DiagnosticKind::Semantic,
                            span.clone(),
                            format!("lambda `{name}` captures variables and cannot escape"),
                        ));
                    }
                    let dst = ctx.f.alloc_vreg();
                    ctx.f.push(
                        ctx.block,
                        Instruction::LoadFunc {
                            dst,
                            function: mangled,
                        },
                    );
                    (dst, Type::Function(explicit, Box::new(ret)))
                }
            };
        }

        let key = self.qualify(ctx, name, span);
        match self.table.overloads(&key).first().cloned() {
            Some(symbol) => match symbol.kind {
                SymbolKind::Constant => {
                    let value = self.const_values.get(&key).copied().unwrap_or(0);
                    let dst = ctx.f.alloc_vreg();
                    ctx.f.push(
                        ctx.block,
                        Instruction::LoadConst {
                            dst,
                            value,
                            ty: symbol.ty.clone(),
                        },
                    );
                    (dst, symbol.ty)
                }
                SymbolKind::Function => {
                    let dst = ctx.f.alloc_vreg();
                    ctx.f.push(
                        ctx.block,
                        Instruction::LoadFunc {
                            dst,
                            function: symbol.mangled.clone(),
                        },
                    );
                    (dst, symbol.ty)
                }
                _ => {
                    let dst = ctx.f.alloc_vreg();
                    ctx.f.push(
                        ctx.block,
                        Instruction::LoadVar {
                            dst,
                            name: symbol.mangled.clone(),
                        },
                    );
                    (dst, symbol.ty)
                }
            },
            None => {
                self.sink.report(Diagnostic::new(
                    DiagnosticKind::Name,
                    span.clone(),
                    format!("undefined identifier `{name}`"),
                ));
                let dst = ctx.f.alloc_vreg();
                ctx.f.push(
                    ctx.block,
                    Instruction::LoadConst {
                        dst,
                        value: 0,
                        ty: Type::U8,
                    },
                );
                (dst, Type::U8)
            }
        }
    }

    /// A private symbol is only reachable from its own module.
    fn check_visible(&mut self, ctx: &FnCtx, symbol: &Symbol, name: &str, span: &SourceSpan) {
        if symbol.visibility == Visibility::Public {
            return;
        }
        let local = symbol
            .name
            .strip_prefix(&ctx.module_name)
            .is_some_and(|rest| rest.starts_with('.'));
        if !local {
            self.sink.report(Diagnostic::new(
                DiagnosticKind::Name,
                span.clone(),
                format!("`{name}` is private to its module"),
            ));
        }
    }

    /// Resolve a possibly dotted name to a global symbol key.
    fn qualify(&mut self, ctx: &FnCtx, name: &str, span: &SourceSpan) -> String {
        if let Some((prefix, rest)) = name.split_once('.') {
            match self.graph.resolve_prefix(&ctx.module_name, prefix) {
                Some(module) => return format!("{}.{rest}", module.name),
                None => {
                    self.sink.report(Diagnostic::new(
                        DiagnosticKind::Name,
                        span.clone(),
                        format!("unknown module prefix `{prefix}`"),
                    ));
                    return name.to_owned();
                }
            }
        }
        let local_key = format!("{}.{name}", ctx.module_name);
        if !self.table.overloads(&local_key).is_empty() {
            local_key
        } else {
            format!("std.{name}")
        }
    }

    fn lower_binary(
        &mut self,
        ctx: &mut FnCtx,
        op: ast::BinaryOp,
        lhs: &ast::Expr,
        rhs: &ast::Expr,
    ) -> (VReg, Type) {
        let (lhs_reg, lhs_ty) = self.lower_expr(ctx, lhs, None);
        let (rhs_reg, rhs_ty) = self.lower_expr(ctx, rhs, Some(&lhs_ty));
        let operand_ty = if lhs_ty.widens_to(&rhs_ty) {
            rhs_ty
        } else {
            lhs_ty
        };
        let signed = operand_ty.is_signed();
        let dst = ctx.f.alloc_vreg();

        if op.is_comparison() {
            let op = match (op, signed) {
                (ast::BinaryOp::Eq, _) => CmpOp::Eq,
                (ast::BinaryOp::Ne, _) => CmpOp::Ne,
                (ast::BinaryOp::Lt, false) => CmpOp::Lt,
                (ast::BinaryOp::Le, false) => CmpOp::Le,
                (ast::BinaryOp::Gt, false) => CmpOp::Gt,
                (ast::BinaryOp::Ge, false) => CmpOp::Ge,
                (ast::BinaryOp::Lt, true) => CmpOp::Slt,
                (ast::BinaryOp::Le, true) => CmpOp::Sle,
                (ast::BinaryOp::Gt, true) => CmpOp::Sgt,
                (ast::BinaryOp::Ge, true) => CmpOp::Sge,
                _ => unreachable!("non-comparison operator"),
            };
            ctx.f.push(
                ctx.block,
                Instruction::Cmp {
                    op,
                    dst,
                    lhs: lhs_reg,
                    rhs: rhs_reg,
                },
            );
            (dst, Type::Bool)
        } else {
            let op = match (op, signed) {
                (ast::BinaryOp::Add, _) => BinOp::Add,
                (ast::BinaryOp::Sub, _) => BinOp::Sub,
                (ast::BinaryOp::Mul, _) => BinOp::Mul,
                (ast::BinaryOp::Div, false) => BinOp::Div,
                (ast::BinaryOp::Div, true) => BinOp::Sdiv,
                (ast::BinaryOp::Mod, false) => BinOp::Rem,
                (ast::BinaryOp::Mod, true) => BinOp::Srem,
                (ast::BinaryOp::BitAnd, _) => BinOp::And,
                (ast::BinaryOp::BitOr, _) => BinOp::Or,
                (ast::BinaryOp::BitXor, _) => BinOp::Xor,
                (ast::BinaryOp::Shl, _) => BinOp::Shl,
                (ast::BinaryOp::Shr, false) => BinOp::Shr,
                (ast::BinaryOp::Shr, true) => BinOp::Sar,
                _ => unreachable!("comparison handled above"),
            };
            ctx.f.push(
                ctx.block,
                Instruction::Binary {
                    op,
                    dst,
                    lhs: lhs_reg,
                    rhs: rhs_reg,
                },
            );
            (dst, operand_ty)
        }
    }

    fn lower_call(
        &mut self,
        ctx: &mut FnCtx,
        callee: &str,
        args: &[ast::Expr],
        span: &SourceSpan,
    ) -> (VReg, Type) {
        // Calls through a local binding: lambda or function pointer.
        if let Some(binding) = ctx.lookup(callee).cloned() {
            return match binding {
                Binding::Lambda {
                    mangled,
                    explicit,
                    ret,
                    captures,
                    mode,
                } => {
                    let mut call_args = Vec::new();
                    for (arg, ty) in args.iter().zip(&explicit) {
                        let (vreg, arg_ty) = self.lower_expr(ctx, arg, Some(ty));
                        self.check_assignable(&arg_ty, ty, &arg.span);
                        call_args.push(vreg);
                    }
                    match mode {
                        CaptureMode::Anchor => {
                            // The single call site patches each capture
                            // into its anchor, then calls with the
                            // explicit arguments only.
                            for (i, capture) in captures.iter().enumerate() {
                                let (vreg, _) = self.lower_ident(ctx, capture, span);
                                ctx.f.push(
                                    ctx.block,
                                    Instruction::AnchorPatch {
                                        function: mangled.clone(),
                                        param: (explicit.len() + i) as u8,
                                        src: vreg,
                                    },
                                );
                            }
                        }
                        CaptureMode::Value => {
                            for capture in &captures {
                                let (vreg, _) = self.lower_ident(ctx, capture, span);
                                call_args.push(vreg);
                            }
                        }
                    }
                    let dst = (ret != Type::Void).then(|| ctx.f.alloc_vreg());
                    ctx.f.push(
                        ctx.block,
                        Instruction::Call {
                            dst,
                            callee: mangled,
                            args: call_args,
                        },
                    );
                    (dst.unwrap_or_else(|| ctx.void_reg()), ret)
                }
                Binding::Reg { vreg, ty: Type::Function(params, ret) } => {
                    let mut call_args = Vec::new();
                    for (arg, ty) in args.iter().zip(&params) {
                        let (a, arg_ty) = self.lower_expr(ctx, arg, Some(ty));
                        self.check_assignable(&arg_ty, ty, &arg.span);
                        call_args.push(a);
                    }
                    let dst = (*ret != Type::Void).then(|| ctx.f.alloc_vreg());
                    ctx.f.push(
                        ctx.block,
                        Instruction::CallIndirect {
                            dst,
                            target: vreg,
                            args: call_args,
                        },
                    );
                    (dst.unwrap_or_else(|| ctx.void_reg()), *ret)
                }
                _ => {
                    self.sink.report(Diagnostic::new(
                        DiagnosticKind::Type,
                        span.clone(),
                        format!("`{callee}` is not callable"),
                    ));
                    (ctx.void_reg(), Type::Void)
                }
            };
        }

        // Evaluate arguments, then resolve the overload set.
        let mut arg_regs = Vec::new();
        let mut arg_tys = Vec::new();
        for arg in args {
            let (vreg, ty) = self.lower_expr(ctx, arg, None);
            arg_regs.push(vreg);
            arg_tys.push(ty);
        }

        let key = self.qualify(ctx, callee, span);
        let candidates = self.table.overloads(&key).to_vec();
        if candidates.is_empty() {
            self.sink.report(Diagnostic::new(
                DiagnosticKind::Name,
                span.clone(),
                format!("undefined function `{callee}`"),
            ));
            return (ctx.void_reg(), Type::Void);
        }

        match resolve_overload(callee, &candidates, &arg_tys) {
            Ok(symbol) => {
                self.check_visible(ctx, symbol, callee, span);
                let Type::Function(_, ret) = symbol.ty.clone() else {
                    self.sink.report(Diagnostic::new(
                        DiagnosticKind::Type,
                        span.clone(),
                        format!("`{callee}` is not a function"),
                    ));
                    return (ctx.void_reg(), Type::Void);
                };
                let dst = (*ret != Type::Void).then(|| ctx.f.alloc_vreg());
                ctx.f.push(
                    ctx.block,
                    Instruction::Call {
                        dst,
                        callee: symbol.mangled.clone(),
                        args: arg_regs,
                    },
                );
                (dst.unwrap_or_else(|| ctx.void_reg()), *ret)
            }
            Err(err) => {
                let mut diagnostic =
                    Diagnostic::new(DiagnosticKind::Name, span.clone(), err.to_string());
                for candidate in err.candidates() {
                    diagnostic = diagnostic.with_hint(format!("candidate: {candidate}"));
                }
                self.sink.report(diagnostic);
                (ctx.void_reg(), Type::Void)
            }
        }
    }

    fn lower_method_call(
        &mut self,
        ctx: &mut FnCtx,
        recv: &ast::Expr,
        method: &str,
        args: &[ast::Expr],
        span: &SourceSpan,
    ) -> (VReg, Type) {
        let (recv_reg, recv_ty) = self.lower_expr(ctx, recv, None);
        let Some(mangled) = self.impls.get(&(recv_ty.mangle(), method.to_owned())).cloned()
        else {
            self.sink.report(Diagnostic::new(
                DiagnosticKind::Semantic,
                span.clone(),
                format!("no implementation of `{method}` for `{recv_ty}`"),
            ));
            return (ctx.void_reg(), Type::Void);
        };

        let mut call_args = vec![recv_reg];
        for arg in args {
            let (vreg, _) = self.lower_expr(ctx, arg, None);
            call_args.push(vreg);
        }
        let ret = self
            .table
            .global_by_mangled(&mangled)
            .and_then(|s| match &s.ty {
                Type::Function(_, ret) => Some((**ret).clone()),
                _ => None,
            })
            .unwrap_or(Type::Void);
        let dst = (ret != Type::Void).then(|| ctx.f.alloc_vreg());
        ctx.f.push(
            ctx.block,
            Instruction::Call {
                dst,
                callee: mangled,
                args: call_args,
            },
        );
        (dst.unwrap_or_else(|| ctx.void_reg()), ret)
    }

    fn lower_lambda_value(
        &mut self,
        ctx: &mut FnCtx,
        params: &[ast::ParamDecl],
        ret: &Type,
        body: &ast::Block,
        span: &SourceSpan,
    ) -> (VReg, Type) {
        let (mangled, captures, _) = self.lift_lambda(ctx, params, ret, body, span, 2);
        if !captures.is_empty() {
            self.sink.report(Diagnostic::new(
                DiagnosticKind::Semantic,
                span.clone(),
                "a lambda that escapes cannot capture variables",
            ));
        }
        let dst = ctx.f.alloc_vreg();
        ctx.f.push(
            ctx.block,
            Instruction::LoadFunc {
                dst,
                function: mangled,
            },
        );
        (
            dst,
            Type::Function(
                params.iter().map(|p| p.ty.clone()).collect(),
                Box::new(ret.clone()),
            ),
        )
    }

    /// Lift a lambda into a pending named function `outer$lambda_N`.
    ///
    /// `call_count` decides the capture mode: at most one call per
    /// activation lowers captures as TSMC anchors, anything else passes
    /// them by value.
    fn lift_lambda(
        &mut self,
        ctx: &mut FnCtx,
        params: &[ast::ParamDecl],
        ret: &Type,
        body: &ast::Block,
        span: &SourceSpan,
        call_count: usize,
    ) -> (String, Vec<(String, Type)>, CaptureMode) {
        let bound: Vec<String> = params.iter().map(|p| p.name.clone()).collect();
        let mut captures = Vec::new();
        collect_free_vars(body, &bound, &mut |name| {
            if captures.iter().any(|(n, _)| n == name) {
                return;
            }
            if let Some(binding) = ctx.lookup(name) {
                let ty = match binding {
                    Binding::Reg { ty, .. } | Binding::Slot { ty, .. } => ty.clone(),
                    Binding::Lambda { .. } => return,
                };
                captures.push((name.to_owned(), ty));
            }
        });

        let mode = if call_count <= 1 {
            CaptureMode::Anchor
        } else {
            CaptureMode::Value
        };

        let name = format!("{}$lambda_{}", ctx.fn_name, self.lambda_counter);
        self.lambda_counter += 1;
        let decl = ast::FunDecl {
            name: name.clone(),
            params: params.to_vec(),
            ret: ret.clone(),
            body: body.clone(),
            attrs: vec![],
            visibility: ast::AstVisibility::Private,
            span: span.clone(),
        };

        let mut all_params: Vec<Type> = params.iter().map(|p| p.ty.clone()).collect();
        all_params.extend(captures.iter().map(|(_, ty)| ty.clone()));
        let mangled = mangle(&name, &all_params);

        self.pending_lambdas
            .push((ctx.module_name.clone(), decl, captures.clone(), mode));
        (mangled, captures, mode)
    }

    /// `expr?`: on error tag set, early-return the error variant.
    fn lower_try(&mut self, ctx: &mut FnCtx, inner: &ast::Expr) -> (VReg, Type) {
        let (value, ty) = self.lower_expr(ctx, inner, None);

        let tag = ctx.f.alloc_vreg();
        ctx.f.push(
            ctx.block,
            Instruction::LoadVar {
                dst: tag,
                name: ERR_TAG.to_owned(),
            },
        );
        let zero = ctx.f.alloc_vreg();
        ctx.f.push(
            ctx.block,
            Instruction::LoadConst {
                dst: zero,
                value: 0,
                ty: Type::U8,
            },
        );
        let is_err = ctx.f.alloc_vreg();
        ctx.f.push(
            ctx.block,
            Instruction::Cmp {
                op: CmpOp::Ne,
                dst: is_err,
                lhs: tag,
                rhs: zero,
            },
        );

        let n = ctx.fresh_label();
        let bail_id = ctx.f.add_block(format!("try_bail_{n}"));
        let ok_id = ctx.f.add_block(format!("try_ok_{n}"));
        ctx.f.terminate(
            ctx.block,
            Terminator::Branch {
                cond: is_err,
                then_block: bail_id,
                else_block: ok_id,
            },
        );

        // Error path: propagate by returning with the tag still set.
        ctx.enter(bail_id);
        let bail_value = (ctx.ret_ty != Type::Void).then_some(value);
        ctx.f.terminate(ctx.block, Terminator::Return(bail_value));

        ctx.enter(ok_id);
        (value, ty)
    }

    /// `expr ?? default`: on error tag set, clear it and use the default.
    fn lower_coalesce(
        &mut self,
        ctx: &mut FnCtx,
        value: &ast::Expr,
        default: &ast::Expr,
        _span: &SourceSpan,
    ) -> (VReg, Type) {
        let (value_reg, ty) = self.lower_expr(ctx, value, None);
        let label = ctx.fresh_label();
        let slot = format!("{}.$coalesce_{}", ctx.fn_name, label);
        ctx.f.push(
            ctx.block,
            Instruction::StoreVar {
                name: slot.clone(),
                src: value_reg,
            },
        );

        let tag = ctx.f.alloc_vreg();
        ctx.f.push(
            ctx.block,
            Instruction::LoadVar {
                dst: tag,
                name: ERR_TAG.to_owned(),
            },
        );
        let zero = ctx.f.alloc_vreg();
        ctx.f.push(
            ctx.block,
            Instruction::LoadConst {
                dst: zero,
                value: 0,
                ty: Type::U8,
            },
        );
        let is_err = ctx.f.alloc_vreg();
        ctx.f.push(
            ctx.block,
            Instruction::Cmp {
                op: CmpOp::Ne,
                dst: is_err,
                lhs: tag,
                rhs: zero,
            },
        );

        let n = ctx.fresh_label();
        let default_id = ctx.f.add_block(format!("coalesce_default_{n}"));
        let join_id = ctx.f.add_block(format!("coalesce_join_{n}"));
        ctx.f.terminate(
            ctx.block,
            Terminator::Branch {
                cond: is_err,
                then_block: default_id,
                else_block: join_id,
            },
        );

        ctx.enter(default_id);
        let reset = ctx.f.alloc_vreg();
        ctx.f.push(
            ctx.block,
            Instruction::LoadConst {
                dst: reset,
                value: 0,
                ty: Type::U8,
            },
        );
        ctx.f.push(
            ctx.block,
            Instruction::StoreVar {
                name: ERR_TAG.to_owned(),
                src: reset,
            },
        );
        let (default_reg, _) = self.lower_expr(ctx, default, Some(&ty));
        ctx.f.push(
            ctx.block,
            Instruction::StoreVar {
                name: slot.clone(),
                src: default_reg,
            },
        );
        ctx.f.terminate(ctx.block, Terminator::Jump(join_id));

        ctx.enter(join_id);
        let dst = ctx.f.alloc_vreg();
        ctx.f.push(ctx.block, Instruction::LoadVar { dst, name: slot });
        (dst, ty)
    }
}

/// Per-function lowering state.
struct FnCtx {
    f: mir::Function,
    block: BlockId,
    terminated: bool,
    scopes: Vec<HashMap<String, Binding>>,
    labels: HashMap<String, BlockId>,
    mutated: std::collections::HashSet<String>,
    module_name: String,
    ret_ty: Type,
    fn_name: String,
    label_counter: u32,
}

impl FnCtx {
    fn new(f: mir::Function, module_name: String, ret_ty: Type, fn_name: &str) -> Self {
        let block = f.entry();
        Self {
            f,
            block,
            terminated: false,
            scopes: vec![HashMap::new()],
            labels: HashMap::new(),
            mutated: std::collections::HashSet::new(),
            module_name,
            ret_ty,
            fn_name: fn_name.to_owned(),
            label_counter: 0,
        }
    }

    fn fresh_label(&mut self) -> u32 {
        let n = self.label_counter;
        self.label_counter += 1;
        n
    }

    fn enter(&mut self, block: BlockId) {
        self.block = block;
        self.terminated = false;
    }

    fn push_scope(&mut self) {
        self.scopes.push(HashMap::new());
    }

    fn pop_scope(&mut self) {
        self.scopes.pop();
    }

    fn bind(&mut self, name: String, binding: Binding) {
        self.scopes
            .last_mut()
            .expect("no open scope")
            .insert(name, binding);
    }

    fn lookup(&self, name: &str) -> Option<&Binding> {
        self.scopes.iter().rev().find_map(|s| s.get(name))
    }

    /// Placeholder register for void-valued expressions.
    fn void_reg(&mut self) -> VReg {
        let dst = self.f.alloc_vreg();
        self.f.push(
            self.block,
            Instruction::LoadConst {
                dst,
                value: 0,
                ty: Type::Void,
            },
        );
        dst
    }

    /// Record every assignment target so `let` can pick slot bindings.
    fn scan_mutated(&mut self, block: &ast::Block) {
        for stmt in &block.stmts {
            match &stmt.kind {
                ast::StmtKind::Assign { target, .. } => {
                    self.mutated.insert(target.clone());
                }
                ast::StmtKind::If {
                    then_block,
                    else_block,
                    ..
                } => {
                    self.scan_mutated(then_block);
                    if let Some(e) = else_block {
                        self.scan_mutated(e);
                    }
                }
                ast::StmtKind::While { body, .. } => self.scan_mutated(body),
                ast::StmtKind::Case { arms, default, .. } => {
                    for arm in arms {
                        self.scan_mutated(&arm.body);
                    }
                    if let Some(d) = default {
                        self.scan_mutated(d);
                    }
                }
                _ => {}
            }
        }
    }

    /// Pre-create a block for every user label so forward `goto` works.
    fn scan_labels(&mut self, block: &ast::Block, analyzer: &mut Analyzer<'_, '_>) {
        for stmt in &block.stmts {
            match &stmt.kind {
                ast::StmtKind::Label { name } => {
                    if self.labels.contains_key(name) {
                        analyzer.sink.report(Diagnostic::new(
                            DiagnosticKind::Semantic,
                            stmt.span.clone(),
                            format!("duplicate label `{name}`"),
                        ));
                        continue;
                    }
                    let id = self.f.add_block(name.clone());
                    self.labels.insert(name.clone(), id);
                }
                ast::StmtKind::If {
                    then_block,
                    else_block,
                    ..
                } => {
                    self.scan_labels(then_block, analyzer);
                    if let Some(e) = else_block {
                        self.scan_labels(e, analyzer);
                    }
                }
                ast::StmtKind::While { body, .. } => self.scan_labels(body, analyzer),
                ast::StmtKind::Case { arms, default, .. } => {
                    for arm in arms {
                        self.scan_labels(&arm.body, analyzer);
                    }
                    if let Some(d) = default {
                        self.scan_labels(d, analyzer);
                    }
                }
                _ => {}
            }
        }
    }
}

/// Count call sites of `name` in `stmts`. A call inside a loop may run
/// once per iteration, so it counts double; anything above one forces
/// by-value captures.
fn count_calls(name: &str, stmts: &[ast::Stmt]) -> usize {
    let mut count = 0;
    for stmt in stmts {
        match &stmt.kind {
            ast::StmtKind::Let { value, .. } | ast::StmtKind::Assign { value, .. } => {
                count += count_calls_in_expr(name, value);
            }
            ast::StmtKind::Expr(e) | ast::StmtKind::Return(Some(e)) => {
                count += count_calls_in_expr(name, e);
            }
            ast::StmtKind::Return(None)
            | ast::StmtKind::Goto { .. }
            | ast::StmtKind::Label { .. } => {}
            ast::StmtKind::If {
                cond,
                then_block,
                else_block,
            } => {
                count += count_calls_in_expr(name, cond);
                count += count_calls(name, &then_block.stmts);
                if let Some(e) = else_block {
                    count += count_calls(name, &e.stmts);
                }
            }
            ast::StmtKind::While { cond, body } => {
                count += 2 * (count_calls_in_expr(name, cond) + count_calls(name, &body.stmts));
            }
            ast::StmtKind::Case {
                scrutinee,
                arms,
                default,
            } => {
                count += count_calls_in_expr(name, scrutinee);
                for arm in arms {
                    count += count_calls(name, &arm.body.stmts);
                }
                if let Some(d) = default {
                    count += count_calls(name, &d.stmts);
                }
            }
        }
    }
    count
}

fn count_calls_in_expr(name: &str, expr: &ast::Expr) -> usize {
    match &expr.kind {
        ast::ExprKind::Call { callee, args } => {
            let own = usize::from(callee == name);
            own + args.iter().map(|a| count_calls_in_expr(name, a)).sum::<usize>()
        }
        ast::ExprKind::Binary { lhs, rhs, .. } => {
            count_calls_in_expr(name, lhs) + count_calls_in_expr(name, rhs)
        }
        ast::ExprKind::Unary { operand, .. } => count_calls_in_expr(name, operand),
        ast::ExprKind::MethodCall { recv, args, .. } => {
            count_calls_in_expr(name, recv)
                + args.iter().map(|a| count_calls_in_expr(name, a)).sum::<usize>()
        }
        ast::ExprKind::Try(inner) => count_calls_in_expr(name, inner),
        ast::ExprKind::Coalesce { value, default } => {
            count_calls_in_expr(name, value) + count_calls_in_expr(name, default)
        }
        ast::ExprKind::Cast { value, .. } => count_calls_in_expr(name, value),
        ast::ExprKind::Lambda { body, .. } => count_calls(name, &body.stmts),
        ast::ExprKind::Int(_)
        | ast::ExprKind::Bool(_)
        | ast::ExprKind::Str(_)
        | ast::ExprKind::EnumLit { .. }
        | ast::ExprKind::Ident(_)
        | ast::ExprKind::InlineAsm(_) => 0,
    }
}

/// Walk a block, invoking `found` for every identifier not bound locally.
fn collect_free_vars(block: &ast::Block, bound: &[String], found: &mut impl FnMut(&str)) {
    let mut bound = bound.to_vec();
    for stmt in &block.stmts {
        match &stmt.kind {
            ast::StmtKind::Let { name, value, .. } => {
                collect_free_in_expr(value, &bound, found);
                bound.push(name.clone());
            }
            ast::StmtKind::Assign { target, value } => {
                if !bound.contains(target) {
                    found(target);
                }
                collect_free_in_expr(value, &bound, found);
            }
            ast::StmtKind::Expr(e) => collect_free_in_expr(e, &bound, found),
            ast::StmtKind::Return(Some(e)) => collect_free_in_expr(e, &bound, found),
            ast::StmtKind::Return(None) | ast::StmtKind::Goto { .. } | ast::StmtKind::Label { .. } => {}
            ast::StmtKind::If {
                cond,
                then_block,
                else_block,
            } => {
                collect_free_in_expr(cond, &bound, found);
                collect_free_vars(then_block, &bound, found);
                if let Some(e) = else_block {
                    collect_free_vars(e, &bound, found);
                }
            }
            ast::StmtKind::While { cond, body } => {
                collect_free_in_expr(cond, &bound, found);
                collect_free_vars(body, &bound, found);
            }
            ast::StmtKind::Case {
                scrutinee,
                arms,
                default,
            } => {
                collect_free_in_expr(scrutinee, &bound, found);
                for arm in arms {
                    collect_free_vars(&arm.body, &bound, found);
                }
                if let Some(d) = default {
                    collect_free_vars(d, &bound, found);
                }
            }
        }
    }
}

fn collect_free_in_expr(expr: &ast::Expr, bound: &[String], found: &mut impl FnMut(&str)) {
    match &expr.kind {
        ast::ExprKind::Ident(name) => {
            if !name.contains('.') && !bound.iter().any(|b| b == name) {
                found(name);
            }
        }
        ast::ExprKind::Binary { lhs, rhs, .. } => {
            collect_free_in_expr(lhs, bound, found);
            collect_free_in_expr(rhs, bound, found);
        }
        ast::ExprKind::Unary { operand, .. } => collect_free_in_expr(operand, bound, found),
        ast::ExprKind::Call { args, .. } => {
            for arg in args {
                collect_free_in_expr(arg, bound, found);
            }
        }
        ast::ExprKind::MethodCall { recv, args, .. } => {
            collect_free_in_expr(recv, bound, found);
            for arg in args {
                collect_free_in_expr(arg, bound, found);
            }
        }
        ast::ExprKind::Lambda { params, body, .. } => {
            let mut inner: Vec<String> = bound.to_vec();
            inner.extend(params.iter().map(|p| p.name.clone()));
            collect_free_vars(body, &inner, found);
        }
        ast::ExprKind::Try(inner) => collect_free_in_expr(inner, bound, found),
        ast::ExprKind::Coalesce { value, default } => {
            collect_free_in_expr(value, bound, found);
            collect_free_in_expr(default, bound, found);
        }
        ast::ExprKind::Cast { value, .. } => collect_free_in_expr(value, bound, found),
        ast::ExprKind::Int(_)
        | ast::ExprKind::Bool(_)
        | ast::ExprKind::Str(_)
        | ast::ExprKind::EnumLit { .. }
        | ast::ExprKind::InlineAsm(_) => {}
    }
}
