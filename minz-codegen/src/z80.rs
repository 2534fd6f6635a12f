//! The Z80 emitter.
//!
//! Values are staged through `A` (8-bit) and `HL` (16-bit), with `E`/`DE`
//! carrying second operands; allocated homes live in `B`, `C`, `BC`, the
//! shadow bank or memory. Function entry materializes parameters from
//! their arrival location (patched anchors, registers or the IX frame)
//! into their homes; `<fn>_loop` marks the post-prologue entry that tail
//! calls jump to.

use std::collections::{BTreeSet, HashMap, HashSet};

use minz_mir::{
    BinOp, BlockId, CmpOp, Function, FunctionFlags, Instruction, Module, Recursion, Terminator,
    UnOp, VReg,
};
use minz_opt::{allocate, Allocation, Loc};
use minz_types::{StrId, StringKind, Word};
use tracing::debug;

use crate::{
    asm::{render, Line},
    helpers,
    peephole,
    target::Target,
    CodegenError, Options,
};

/// How a function receives its parameters.
#[derive(Debug, Clone, PartialEq, Eq)]
pub enum Convention {
    /// Parameters are patched into anchor immediates at the call site.
    Smc,
    /// Parameters arrive in the listed registers, one per parameter.
    Register(Vec<String>),
    /// Parameters arrive on the stack, addressed through IX.
    Stack,
}

impl Convention {
    fn describe(&self) -> &'static str {
        match self {
            Self::Smc => "smc",
            Self::Register(_) => "register",
            Self::Stack => "stack",
        }
    }
}

/// Generate assembly for a frozen module.
pub fn generate(module: &Module, options: &Options) -> Result<String, CodegenError> {
    if options.target != Target::Z80 {
        return Err(CodegenError::UnsupportedTarget(options.target));
    }
    CodeGen::new(module, options).run()
}

struct CodeGen<'m> {
    module: &'m Module,
    options: &'m Options,
    lines: Vec<Line>,
    conventions: HashMap<String, Convention>,
    allocations: HashMap<String, Allocation>,
    strings_used: Vec<(StrId, StringKind)>,
    slots_used: BTreeSet<String>,
    label_counter: u32,
}

impl<'m> CodeGen<'m> {
    fn new(module: &'m Module, options: &'m Options) -> Self {
        Self {
            module,
            options,
            lines: Vec::new(),
            conventions: HashMap::new(),
            allocations: HashMap::new(),
            strings_used: Vec::new(),
            slots_used: BTreeSet::new(),
            label_counter: 0,
        }
    }

    fn run(mut self) -> Result<String, CodegenError> {
        let address_taken: HashSet<String> = self
            .module
            .functions()
            .flat_map(|f| {
                f.instructions().filter_map(|i| match i {
                    Instruction::LoadFunc { function, .. } => Some(function.clone()),
                    _ => None,
                })
            })
            .collect();

        for function in self.module.functions() {
            function.verify("codegen")?;
            let convention = select_convention(function, self.options, &address_taken)?;
            self.conventions.insert(function.name.clone(), convention);
            if !function.flags.contains(FunctionFlags::DEAD) {
                self.allocations
                    .insert(function.name.clone(), allocate(function, self.module));
            }
        }

        self.lines.push(Line::Comment(format!(
            "module {} (z80)",
            self.module.name
        )));
        self.lines.push(Line::Directive {
            name: "ORG".into(),
            args: vec![format!("${:04X}", self.options.org)],
        });

        let functions: Vec<&Function> = self
            .module
            .functions()
            .filter(|f| !f.flags.contains(FunctionFlags::DEAD))
            .collect();
        for function in &functions {
            self.emit_function(function)?;
            debug!(function = %function.name, "emitted");
        }

        self.emit_data();
        helpers::emit_used(&mut self.lines);
        self.lines.push(Line::Blank);
        self.lines.push(Line::Directive {
            name: "END".into(),
            args: vec![],
        });

        if self.options.optimize {
            let rewrites = peephole::run(&mut self.lines);
            debug!(rewrites, "assembly peephole complete");
        }
        Ok(render(&self.lines))
    }

    // ---- function emission ---------------------------------------------

    fn emit_function(&mut self, f: &Function) -> Result<(), CodegenError> {
        let convention = self.conventions[&f.name].clone();
        let needs_save = convention == Convention::Smc && needs_anchor_save(f);

        self.lines.push(Line::Blank);
        self.lines.push(Line::Comment(format!(
            "{} ({} convention)",
            f.name,
            convention.describe()
        )));
        self.lines.push(Line::Label(f.name.clone()));

        match &convention {
            Convention::Smc => {
                if needs_save {
                    self.emit_anchor_saves(f);
                }
                self.lines.push(Line::Label(format!("{}_loop", f.name)));
                self.emit_smc_anchors(f);
            }
            Convention::Register(regs) => {
                self.lines.push(Line::Label(format!("{}_loop", f.name)));
                self.emit_register_entry(f, regs);
            }
            Convention::Stack => {
                self.push(Line::inst("PUSH", &["IX"]));
                self.push(Line::inst("LD", &["IX", "0"]));
                self.push(Line::inst("ADD", &["IX", "SP"]));
                self.lines.push(Line::Label(format!("{}_loop", f.name)));
                self.emit_stack_entry(f);
            }
        }

        for block in &f.blocks {
            self.lines
                .push(Line::Label(format!("{}.{}", f.name, block.label)));
            for instruction in &block.instructions {
                self.emit_inst(f, instruction);
            }
            let terminator = block.terminator_checked("codegen", &f.name)?;
            self.emit_term(f, &convention, needs_save, terminator);
        }
        Ok(())
    }

    fn emit_anchor_saves(&mut self, f: &Function) {
        for param in &f.params {
            let imm = anchor_imm(f, &param.name);
            if param.ty.size_of() > 1 {
                self.push(Line::inst_owned("LD", vec!["HL".into(), format!("({imm})")]));
                self.push(Line::inst("PUSH", &["HL"]));
            } else {
                self.push(Line::inst_owned("LD", vec!["A".into(), format!("({imm})")]));
                self.push(Line::inst("PUSH", &["AF"]));
            }
        }
    }

    fn emit_anchor_restores(&mut self, f: &Function) {
        let ret_is_byte = f.ret.size_of() == 1;
        for param in f.params.iter().rev() {
            let imm = anchor_imm(f, &param.name);
            if param.ty.size_of() > 1 {
                self.push(Line::inst("POP", &["DE"]));
                self.push(Line::inst_owned("LD", vec![format!("({imm})"), "DE".into()]));
            } else if ret_is_byte {
                // A holds the return value; restore through HL.
                self.push(Line::inst("POP", &["DE"]));
                self.push(Line::inst_owned("LD", vec!["HL".into(), imm.clone()]));
                self.push(Line::inst("LD", &["(HL)", "D"]));
            } else {
                self.push(Line::inst("POP", &["AF"]));
                self.push(Line::inst_owned("LD", vec![format!("({imm})"), "A".into()]));
            }
        }
    }

    /// Anchors: the first read of each TSMC parameter is a load of a
    /// patchable immediate, with `p$imm0` naming the immediate byte.
    fn emit_smc_anchors(&mut self, f: &Function) {
        for param in f.params.clone() {
            let op_label = anchor_op(f, &param.name);
            let imm_label = anchor_imm(f, &param.name);
            self.lines.push(Line::Label(op_label.clone()));
            if param.ty.size_of() > 1 {
                self.push(Line::inst("LD", &["HL", "0"]));
                self.lines.push(Line::Equ {
                    name: imm_label,
                    expr: format!("{op_label}+1"),
                });
                self.store16(f, param.vreg);
            } else {
                self.push(Line::inst("LD", &["A", "0"]));
                self.lines.push(Line::Equ {
                    name: imm_label,
                    expr: format!("{op_label}+1"),
                });
                self.store8(f, param.vreg);
            }
        }
    }

    /// Register arrivals are staged through the stack so home assignment
    /// cannot clobber a carrier that has not been read yet.
    fn emit_register_entry(&mut self, f: &Function, regs: &[String]) {
        for reg in regs {
            match reg.as_str() {
                "A" => self.push(Line::inst("PUSH", &["AF"])),
                "B" | "C" => self.push(Line::inst("PUSH", &["BC"])),
                "HL" => self.push(Line::inst("PUSH", &["HL"])),
                "DE" => self.push(Line::inst("PUSH", &["DE"])),
                other => self.push(Line::inst_owned("PUSH", vec![other.to_owned()])),
            }
        }
        let params: Vec<_> = f.params.clone();
        for (param, reg) in params.iter().zip(regs).rev() {
            match reg.as_str() {
                // PUSH BC stored B in the high byte, exactly where POP AF
                // places A, so both carriers read back the same way.
                "A" | "B" => {
                    self.push(Line::inst("POP", &["AF"]));
                    self.store8(f, param.vreg);
                }
                "C" => {
                    self.push(Line::inst("POP", &["HL"]));
                    self.push(Line::inst("LD", &["A", "L"]));
                    self.store8(f, param.vreg);
                }
                "HL" | "DE" => {
                    self.push(Line::inst("POP", &["HL"]));
                    self.store16(f, param.vreg);
                }
                _ => {
                    self.push(Line::inst("POP", &["HL"]));
                    self.store16(f, param.vreg);
                }
            }
        }
    }

    fn emit_stack_entry(&mut self, f: &Function) {
        for (index, param) in f.params.clone().iter().enumerate() {
            let offset = 4 + 2 * index;
            if param.ty.size_of() > 1 {
                self.push(Line::inst_owned("LD", vec!["L".into(), format!("(IX+{offset})")]));
                self.push(Line::inst_owned(
                    "LD",
                    vec!["H".into(), format!("(IX+{})", offset + 1)],
                ));
                self.store16(f, param.vreg);
            } else {
                self.push(Line::inst_owned("LD", vec!["A".into(), format!("(IX+{offset})")]));
                self.store8(f, param.vreg);
            }
        }
    }

    // ---- instruction emission ------------------------------------------

    fn emit_inst(&mut self, f: &Function, instruction: &Instruction) {
        if self.options.debug_comments {
            self.lines.push(Line::Comment(instruction.to_string()));
        }
        match instruction {
            Instruction::LoadConst { dst, value, ty } => {
                if ty.size_of() == 0 {
                    return;
                }
                if ty.size_of() > 1 {
                    self.push(Line::inst_owned(
                        "LD",
                        vec!["HL".into(), (value & 0xFFFF).to_string()],
                    ));
                    self.store16(f, *dst);
                } else {
                    self.push(Line::inst_owned(
                        "LD",
                        vec!["A".into(), (value & 0xFF).to_string()],
                    ));
                    self.store8(f, *dst);
                }
            }
            Instruction::LoadVar { dst, name } => {
                let label = self.var_label(name);
                if self.is_wide(f, *dst) {
                    self.push(Line::inst_owned("LD", vec!["HL".into(), format!("({label})")]));
                    self.store16(f, *dst);
                } else {
                    self.push(Line::inst_owned("LD", vec!["A".into(), format!("({label})")]));
                    self.store8(f, *dst);
                }
            }
            Instruction::StoreVar { name, src } => {
                let label = self.var_label(name);
                if self.is_wide(f, *src) {
                    self.load16(f, *src);
                    self.push(Line::inst_owned("LD", vec![format!("({label})"), "HL".into()]));
                } else {
                    self.load8(f, *src);
                    self.push(Line::inst_owned("LD", vec![format!("({label})"), "A".into()]));
                }
            }
            Instruction::LoadParam { dst, index } => {
                let Some(param) = f.params.get(*index as usize) else {
                    return;
                };
                if param.ty.size_of() > 1 {
                    self.load16(f, param.vreg);
                    self.store16(f, *dst);
                } else {
                    self.load8(f, param.vreg);
                    self.store8(f, *dst);
                }
            }
            Instruction::LoadString { dst, id, kind } => {
                let label = self.string_label(*id, *kind);
                self.push(Line::inst_owned("LD", vec!["HL".into(), label]));
                self.store16(f, *dst);
            }
            Instruction::LoadFunc { dst, function } => {
                self.push(Line::inst_owned("LD", vec!["HL".into(), function.clone()]));
                self.store16(f, *dst);
            }
            Instruction::Move { dst, src } => {
                if self.is_wide(f, *src) || self.is_wide(f, *dst) {
                    self.load16(f, *src);
                    self.store16(f, *dst);
                } else {
                    self.load8(f, *src);
                    self.store8(f, *dst);
                }
            }
            Instruction::Binary { op, dst, lhs, rhs } => {
                if self.is_wide(f, *dst) || self.is_wide(f, *lhs) || self.is_wide(f, *rhs) {
                    self.emit_binary16(f, *op, *dst, *lhs, *rhs);
                } else {
                    self.emit_binary8(f, *op, *dst, *lhs, *rhs);
                }
            }
            Instruction::Unary { op, dst, src } => {
                if self.is_wide(f, *src) {
                    self.load16(f, *src);
                    match op {
                        UnOp::Neg => self.push(Line::inst("CALL", &["__neg16"])),
                        UnOp::Not => {
                            self.push(Line::inst("LD", &["A", "H"]));
                            self.push(Line::inst("CPL", &[]));
                            self.push(Line::inst("LD", &["H", "A"]));
                            self.push(Line::inst("LD", &["A", "L"]));
                            self.push(Line::inst("CPL", &[]));
                            self.push(Line::inst("LD", &["L", "A"]));
                        }
                    }
                    self.store16(f, *dst);
                } else {
                    self.load8(f, *src);
                    match op {
                        UnOp::Neg => self.push(Line::inst("NEG", &[])),
                        UnOp::Not => self.push(Line::inst("CPL", &[])),
                    }
                    self.store8(f, *dst);
                }
            }
            Instruction::Cmp { op, dst, lhs, rhs } => self.emit_cmp(f, *op, *dst, *lhs, *rhs),
            Instruction::Call { dst, callee, args } => {
                self.emit_call(f, *dst, callee, args);
            }
            Instruction::CallIndirect { dst, target, args } => {
                self.emit_call_indirect(f, *dst, *target, args);
            }
            Instruction::AnchorLoad {
                dst,
                function,
                param,
            } => {
                let Some((imm, wide)) = self.anchor_of(function, *param) else {
                    return;
                };
                if wide {
                    self.push(Line::inst_owned("LD", vec!["HL".into(), format!("({imm})")]));
                    self.store16(f, *dst);
                } else {
                    self.push(Line::inst_owned("LD", vec!["A".into(), format!("({imm})")]));
                    self.store8(f, *dst);
                }
            }
            Instruction::AnchorPatch {
                function,
                param,
                src,
            } => {
                let Some((imm, wide)) = self.anchor_of(function, *param) else {
                    return;
                };
                if wide {
                    self.load16(f, *src);
                    self.push(Line::inst_owned("LD", vec![format!("({imm})"), "HL".into()]));
                } else {
                    self.load8(f, *src);
                    self.push(Line::inst_owned("LD", vec![format!("({imm})"), "A".into()]));
                }
            }
            Instruction::InlineAsm { body } => {
                for raw in body.lines() {
                    let trimmed = raw.trim();
                    if trimmed.is_empty() {
                        continue;
                    }
                    self.push(Line::inst_owned(trimmed, Vec::new()));
                }
            }
            Instruction::PortIn { dst, port } => {
                self.load8(f, *port);
                self.push(Line::inst("LD", &["C", "A"]));
                self.push(Line::inst("IN", &["A", "(C)"]));
                self.store8(f, *dst);
            }
            Instruction::PortOut { port, src } => {
                self.load8(f, *port);
                self.push(Line::inst("LD", &["C", "A"]));
                self.load8(f, *src);
                self.push(Line::inst("OUT", &["(C)", "A"]));
            }
        }
    }

    fn emit_binary8(&mut self, f: &Function, op: BinOp, dst: VReg, lhs: VReg, rhs: VReg) {
        // Constant shift counts unroll instead of looping.
        if matches!(op, BinOp::Shl | BinOp::Shr | BinOp::Sar) {
            if let Some(count) = self.const_of(f, rhs) {
                self.load8(f, lhs);
                let mnemonic = match op {
                    BinOp::Shl => ("ADD", vec!["A", "A"]),
                    BinOp::Shr => ("SRL", vec!["A"]),
                    _ => ("SRA", vec!["A"]),
                };
                for _ in 0..count.clamp(0, 8) {
                    self.push(Line::inst(mnemonic.0, &mnemonic.1));
                }
                self.store8(f, dst);
                return;
            }
        }

        let operand = self.stage_rhs8(f, rhs);
        self.load8(f, lhs);
        match op {
            BinOp::Add => self.push(Line::inst_owned("ADD", vec!["A".into(), operand])),
            BinOp::Sub => self.push(Line::inst_owned("SUB", vec![operand])),
            BinOp::And => self.push(Line::inst_owned("AND", vec![operand])),
            BinOp::Or => self.push(Line::inst_owned("OR", vec![operand])),
            BinOp::Xor => self.push(Line::inst_owned("XOR", vec![operand])),
            BinOp::Mul | BinOp::Div | BinOp::Sdiv | BinOp::Rem | BinOp::Srem => {
                // Helpers take the second operand in E.
                if operand != "E" {
                    self.push(Line::inst_owned("LD", vec!["E".into(), operand]));
                }
                let helper = match op {
                    BinOp::Mul => "__mul8",
                    BinOp::Div => "__div8",
                    BinOp::Sdiv => "__sdiv8",
                    BinOp::Rem => "__mod8",
                    _ => "__srem8",
                };
                self.push(Line::inst("CALL", &[helper]));
            }
            BinOp::Shl | BinOp::Shr | BinOp::Sar => {
                if operand != "E" {
                    self.push(Line::inst_owned("LD", vec!["E".into(), operand]));
                }
                let helper = match op {
                    BinOp::Shl => "__shl8",
                    BinOp::Shr => "__shr8",
                    _ => "__sar8",
                };
                self.push(Line::inst("CALL", &[helper]));
            }
        }
        self.store8(f, dst);
    }

    fn emit_binary16(&mut self, f: &Function, op: BinOp, dst: VReg, lhs: VReg, rhs: VReg) {
        self.load16(f, lhs);
        match op {
            BinOp::Shl | BinOp::Shr | BinOp::Sar => {
                // Shift count in A.
                if self.is_wide(f, rhs) {
                    self.load16_to_de(f, rhs);
                    self.push(Line::inst("LD", &["A", "E"]));
                } else {
                    self.load8(f, rhs);
                }
                let helper = match op {
                    BinOp::Shl => "__shl16",
                    BinOp::Shr => "__shr16",
                    _ => "__sar16",
                };
                self.push(Line::inst("CALL", &[helper]));
            }
            _ => {
                self.load16_to_de(f, rhs);
                match op {
                    BinOp::Add => self.push(Line::inst("ADD", &["HL", "DE"])),
                    BinOp::Sub => {
                        self.push(Line::inst("OR", &["A"]));
                        self.push(Line::inst("SBC", &["HL", "DE"]));
                    }
                    BinOp::And | BinOp::Or | BinOp::Xor => {
                        let mnemonic = match op {
                            BinOp::And => "AND",
                            BinOp::Or => "OR",
                            _ => "XOR",
                        };
                        self.push(Line::inst("LD", &["A", "H"]));
                        self.push(Line::inst(mnemonic, &["D"]));
                        self.push(Line::inst("LD", &["H", "A"]));
                        self.push(Line::inst("LD", &["A", "L"]));
                        self.push(Line::inst(mnemonic, &["E"]));
                        self.push(Line::inst("LD", &["L", "A"]));
                    }
                    BinOp::Mul => self.push(Line::inst("CALL", &["__mul16"])),
                    BinOp::Div => self.push(Line::inst("CALL", &["__div16"])),
                    BinOp::Sdiv => self.push(Line::inst("CALL", &["__sdiv16"])),
                    BinOp::Rem => self.push(Line::inst("CALL", &["__mod16"])),
                    BinOp::Srem => self.push(Line::inst("CALL", &["__srem16"])),
                    BinOp::Shl | BinOp::Shr | BinOp::Sar => unreachable!("handled above"),
                }
            }
        }
        self.store16(f, dst);
    }

    fn emit_cmp(&mut self, f: &Function, op: CmpOp, dst: VReg, lhs: VReg, rhs: VReg) {
        let wide = self.is_wide(f, lhs) || self.is_wide(f, rhs);
        let signed = matches!(op, CmpOp::Slt | CmpOp::Sle | CmpOp::Sgt | CmpOp::Sge);

        if wide {
            self.load16(f, lhs);
            self.load16_to_de(f, rhs);
            if signed {
                self.push(Line::inst("CALL", &["__cmp16s"]));
            } else {
                self.push(Line::inst("OR", &["A"]));
                self.push(Line::inst("SBC", &["HL", "DE"]));
            }
        } else {
            let operand = self.stage_rhs8(f, rhs);
            self.load8(f, lhs);
            if signed {
                if operand != "E" {
                    self.push(Line::inst_owned("LD", vec!["E".into(), operand]));
                }
                self.push(Line::inst("CALL", &["__cmp8s"]));
            } else {
                self.push(Line::inst_owned("CP", vec![operand]));
            }
        }

        // Materialize the flag as 0/1 in A.
        let label = self.fresh_label(f, "cc");
        match op {
            CmpOp::Eq => {
                self.push(Line::inst("LD", &["A", "1"]));
                self.push(Line::inst_owned("JP", vec!["Z".into(), label.clone()]));
                self.push(Line::inst("XOR", &["A"]));
            }
            CmpOp::Ne => {
                self.push(Line::inst("LD", &["A", "1"]));
                self.push(Line::inst_owned("JP", vec!["NZ".into(), label.clone()]));
                self.push(Line::inst("XOR", &["A"]));
            }
            CmpOp::Lt | CmpOp::Slt => {
                self.push(Line::inst("LD", &["A", "1"]));
                self.push(Line::inst_owned("JP", vec!["C".into(), label.clone()]));
                self.push(Line::inst("XOR", &["A"]));
            }
            CmpOp::Ge | CmpOp::Sge => {
                self.push(Line::inst("LD", &["A", "1"]));
                self.push(Line::inst_owned("JP", vec!["NC".into(), label.clone()]));
                self.push(Line::inst("XOR", &["A"]));
            }
            CmpOp::Le | CmpOp::Sle => {
                self.push(Line::inst("LD", &["A", "1"]));
                self.push(Line::inst_owned("JP", vec!["C".into(), label.clone()]));
                self.push(Line::inst_owned("JP", vec!["Z".into(), label.clone()]));
                self.push(Line::inst("XOR", &["A"]));
            }
            CmpOp::Gt | CmpOp::Sgt => {
                // LD preserves the compare flags; XOR A would not.
                self.push(Line::inst("LD", &["A", "0"]));
                self.push(Line::inst_owned("JP", vec!["C".into(), label.clone()]));
                self.push(Line::inst_owned("JP", vec!["Z".into(), label.clone()]));
                self.push(Line::inst("INC", &["A"]));
            }
        }
        self.lines.push(Line::Label(label));
        self.store8(f, dst);
    }

    // ---- calls ----------------------------------------------------------

    /// Argument registers of the built-in runtime routines.
    fn helper_arg(callee: &str) -> Option<&'static str> {
        match callee {
            "print_string" | "print_u16" => Some("HL"),
            "print_u8" | "print_hex_u8" => Some("A"),
            "print_newline" | "cls" => None,
            _ => None,
        }
    }

    fn emit_call(&mut self, f: &Function, dst: Option<VReg>, callee: &str, args: &[VReg]) {
        if self.module.function(callee).is_none() && helpers::is_helper(callee) {
            // Runtime helper: single register argument, BC preserved by
            // the helper itself.
            match Self::helper_arg(callee) {
                Some("HL") => {
                    if let Some(&arg) = args.first() {
                        self.load16(f, arg);
                    }
                }
                Some("A") => {
                    if let Some(&arg) = args.first() {
                        self.load8(f, arg);
                    }
                }
                _ => {}
            }
            self.push(Line::inst_owned("CALL", vec![callee.to_owned()]));
            self.store_result(f, dst, None);
            return;
        }

        let convention = self
            .conventions
            .get(callee)
            .cloned()
            .unwrap_or(Convention::Stack);
        let callee_fn = self.module.function(callee);

        self.push(Line::inst("PUSH", &["BC"]));
        match &convention {
            Convention::Smc => {
                if let Some(callee_fn) = callee_fn {
                    let params: Vec<_> = callee_fn.params.clone();
                    for (param, &arg) in params.iter().zip(args) {
                        let imm = anchor_imm(callee_fn, &param.name);
                        if param.ty.size_of() > 1 {
                            self.load16(f, arg);
                            self.push(Line::inst_owned(
                                "LD",
                                vec![format!("({imm})"), "HL".into()],
                            ));
                        } else {
                            self.load8(f, arg);
                            self.push(Line::inst_owned(
                                "LD",
                                vec![format!("({imm})"), "A".into()],
                            ));
                        }
                    }
                }
                self.push(Line::inst_owned("CALL", vec![callee.to_owned()]));
            }
            Convention::Register(regs) => {
                self.stage_args_to_carriers(f, args, regs);
                self.push(Line::inst_owned("CALL", vec![callee.to_owned()]));
            }
            Convention::Stack => {
                for &arg in args.iter().rev() {
                    if self.is_wide(f, arg) {
                        self.load16(f, arg);
                    } else {
                        self.load8(f, arg);
                        self.push(Line::inst("LD", &["L", "A"]));
                        self.push(Line::inst("LD", &["H", "0"]));
                    }
                    self.push(Line::inst("PUSH", &["HL"]));
                }
                self.push(Line::inst_owned("CALL", vec![callee.to_owned()]));
                for _ in 0..args.len() * 2 {
                    self.push(Line::inst("INC", &["SP"]));
                }
            }
        }
        self.push(Line::inst("POP", &["BC"]));
        self.store_result(f, dst, callee_fn.map(|c| c.ret.size_of()));
    }

    fn emit_call_indirect(&mut self, f: &Function, dst: Option<VReg>, target: VReg, args: &[VReg]) {
        self.push(Line::inst("PUSH", &["BC"]));
        self.load16(f, target);
        self.push(Line::inst("PUSH", &["HL"]));
        let widths: Vec<bool> = args.iter().map(|&a| self.is_wide(f, a)).collect();
        let regs = default_registers(&widths).unwrap_or_default();
        // The argument pops leave the target on top; it rides in IY so
        // every carrier register stays free.
        self.stage_args_to_carriers(f, args, &regs);
        self.push(Line::inst("POP", &["IY"]));
        self.push(Line::inst("CALL", &["call_iy"]));
        self.push(Line::inst("POP", &["BC"]));
        let wide = dst.map(|d| self.is_wide(f, d));
        self.store_result(f, dst, wide.map(|w| if w { 2 } else { 1 }));
    }

    /// Stage arguments through the stack, then pop them into the carrier
    /// registers in reverse so no carrier is clobbered before it is read.
    /// Each argument is staged in its carrier's width, so an implicitly
    /// widened byte rides as a full word.
    fn stage_args_to_carriers(&mut self, f: &Function, args: &[VReg], regs: &[String]) {
        for (&arg, reg) in args.iter().zip(regs) {
            if matches!(reg.as_str(), "HL" | "DE" | "BC") {
                self.load16(f, arg);
                self.push(Line::inst("PUSH", &["HL"]));
            } else {
                self.load8(f, arg);
                self.push(Line::inst("PUSH", &["AF"]));
            }
        }
        for (reg, _) in regs.iter().zip(args).rev() {
            match reg.as_str() {
                "A" | "B" => {
                    self.push(Line::inst("POP", &["AF"]));
                    if reg == "B" {
                        self.push(Line::inst("LD", &["B", "A"]));
                    }
                }
                "C" => {
                    self.push(Line::inst("POP", &["AF"]));
                    self.push(Line::inst("LD", &["C", "A"]));
                }
                "HL" => self.push(Line::inst("POP", &["HL"])),
                "DE" => self.push(Line::inst("POP", &["DE"])),
                other => self.push(Line::inst_owned("POP", vec![other.to_owned()])),
            }
        }
    }

    fn store_result(&mut self, f: &Function, dst: Option<VReg>, ret_size: Option<u16>) {
        let Some(dst) = dst else {
            return;
        };
        let wide = match ret_size {
            Some(size) => size > 1,
            None => self.is_wide(f, dst),
        };
        if wide {
            self.store16(f, dst);
        } else {
            self.store8(f, dst);
        }
    }

    // ---- terminators ----------------------------------------------------

    fn emit_term(
        &mut self,
        f: &Function,
        convention: &Convention,
        needs_save: bool,
        terminator: &Terminator,
    ) {
        match terminator {
            Terminator::Jump(target) => {
                let label = self.block_label(f, *target);
                self.push(Line::inst_owned("JP", vec![label]));
            }
            Terminator::Branch {
                cond,
                then_block,
                else_block,
            } => {
                self.load8(f, *cond);
                self.push(Line::inst("OR", &["A"]));
                let then_label = self.block_label(f, *then_block);
                let else_label = self.block_label(f, *else_block);
                // Forward targets need the absolute form for single-pass
                // assemblers.
                self.push(Line::inst_owned("JP", vec!["NZ".into(), then_label]));
                self.push(Line::inst_owned("JP", vec![else_label]));
            }
            Terminator::Switch {
                on,
                base,
                targets,
                default,
            } => self.emit_switch(f, *on, *base, targets, *default),
            Terminator::Return(value) => {
                if let Some(value) = value {
                    if f.ret.size_of() > 1 {
                        self.load16(f, *value);
                    } else {
                        self.load8(f, *value);
                    }
                }
                if needs_save {
                    self.emit_anchor_restores(f);
                }
                if *convention == Convention::Stack {
                    self.push(Line::inst("POP", &["IX"]));
                }
                self.push(Line::inst("RET", &[]));
            }
            Terminator::TailCall { callee, args } => {
                self.emit_tail_call(f, convention, callee, args);
            }
        }
    }

    /// A tail call re-patches the parameter carriers and jumps to the
    /// post-prologue loop entry. The stack pointer never moves.
    fn emit_tail_call(&mut self, f: &Function, convention: &Convention, callee: &str, args: &[VReg]) {
        let (target_fn, target_convention) = if callee == f.name {
            (Some(f), convention.clone())
        } else {
            (
                self.module.function(callee),
                self.conventions
                    .get(callee)
                    .cloned()
                    .unwrap_or(Convention::Stack),
            )
        };

        match target_convention {
            Convention::Smc => {
                if let Some(target) = target_fn {
                    let params: Vec<_> = target.params.clone();
                    for (param, &arg) in params.iter().zip(args) {
                        let imm = anchor_imm(target, &param.name);
                        if param.ty.size_of() > 1 {
                            self.load16(f, arg);
                            self.push(Line::inst_owned(
                                "LD",
                                vec![format!("({imm})"), "HL".into()],
                            ));
                        } else {
                            self.load8(f, arg);
                            self.push(Line::inst_owned(
                                "LD",
                                vec![format!("({imm})"), "A".into()],
                            ));
                        }
                    }
                }
                self.push(Line::inst_owned("JP", vec![format!("{callee}_loop")]));
            }
            Convention::Register(regs) => {
                self.stage_args_to_carriers(f, args, &regs);
                self.push(Line::inst_owned("JP", vec![format!("{callee}_loop")]));
            }
            Convention::Stack if callee == f.name => {
                for (index, &arg) in args.iter().enumerate() {
                    let offset = 4 + 2 * index;
                    if self.is_wide(f, arg) {
                        self.load16(f, arg);
                        self.push(Line::inst_owned(
                            "LD",
                            vec![format!("(IX+{offset})"), "L".into()],
                        ));
                        self.push(Line::inst_owned(
                            "LD",
                            vec![format!("(IX+{})", offset + 1), "H".into()],
                        ));
                    } else {
                        self.load8(f, arg);
                        self.push(Line::inst_owned(
                            "LD",
                            vec![format!("(IX+{offset})"), "A".into()],
                        ));
                    }
                }
                self.push(Line::inst_owned("JP", vec![format!("{callee}_loop")]));
            }
            Convention::Stack => {
                // A cross-function tail call into a stack frame cannot
                // reuse this frame; degrade to call-and-return.
                let dst = None;
                self.emit_call(f, dst, callee, args);
                if *convention == Convention::Stack {
                    self.push(Line::inst("POP", &["IX"]));
                }
                self.push(Line::inst("RET", &[]));
            }
        }
    }

    fn emit_switch(
        &mut self,
        f: &Function,
        on: VReg,
        base: u8,
        targets: &[BlockId],
        default: BlockId,
    ) {
        let table = self.fresh_label(f, "jt");
        let default_label = self.block_label(f, default);

        self.load8(f, on);
        if base > 0 {
            self.push(Line::inst_owned("SUB", vec![base.to_string()]));
        }
        self.push(Line::inst_owned("CP", vec![targets.len().to_string()]));
        self.push(Line::inst_owned("JP", vec!["NC".into(), default_label]));
        self.push(Line::inst("LD", &["L", "A"]));
        self.push(Line::inst("LD", &["H", "0"]));
        self.push(Line::inst("ADD", &["HL", "HL"]));
        self.push(Line::inst_owned("LD", vec!["DE".into(), table.clone()]));
        self.push(Line::inst("ADD", &["HL", "DE"]));
        self.push(Line::inst("LD", &["E", "(HL)"]));
        self.push(Line::inst("INC", &["HL"]));
        self.push(Line::inst("LD", &["D", "(HL)"]));
        self.push(Line::inst("EX", &["DE", "HL"]));
        self.push(Line::inst("JP", &["(HL)"]));

        self.lines.push(Line::Label(table));
        for target in targets {
            let label = self.block_label(f, *target);
            self.lines.push(Line::Directive {
                name: "DW".into(),
                args: vec![label],
            });
        }
    }

    // ---- data -----------------------------------------------------------

    fn emit_data(&mut self) {
        self.lines.push(Line::Blank);
        self.lines.push(Line::Comment("data".into()));

        let globals: Vec<_> = self.module.globals().cloned().collect();
        for global in globals {
            self.lines.push(Line::Label(global.name.clone()));
            if let Some(id) = global.string_init {
                let kind = match &global.ty {
                    minz_types::Type::String(kind) => *kind,
                    _ => StringKind::PascalShort,
                };
                let label = self.string_label(id, kind);
                self.lines.push(Line::Directive {
                    name: "DW".into(),
                    args: vec![label],
                });
            } else if let Some(value) = global.init {
                let (name, rendered) = if global.ty.size_of() > 1 {
                    ("DW", value.to_string())
                } else {
                    ("DB", (value & 0xFF).to_string())
                };
                self.lines.push(Line::Directive {
                    name: name.into(),
                    args: vec![rendered],
                });
            } else {
                self.lines.push(Line::Directive {
                    name: "DS".into(),
                    args: vec![global.ty.size_of().max(1).to_string()],
                });
            }
        }

        let mut emitted: HashSet<String> = HashSet::new();
        let used = self.strings_used.clone();
        for (id, kind) in used {
            let label = self.string_label(id, kind);
            if !emitted.insert(label.clone()) {
                continue;
            }
            let text = self.module.string(id).to_owned();
            self.lines.push(Line::Label(label));
            match kind {
                StringKind::PascalShort => {
                    let mut args = vec![text.len().to_string()];
                    args.extend(text.bytes().map(render_byte));
                    self.lines.push(Line::Directive {
                        name: "DB".into(),
                        args,
                    });
                }
                StringKind::PascalLong => {
                    self.lines.push(Line::Directive {
                        name: "DW".into(),
                        args: vec![text.len().to_string()],
                    });
                    self.lines.push(Line::Directive {
                        name: "DB".into(),
                        args: text.bytes().map(render_byte).collect(),
                    });
                }
                StringKind::CStyle => {
                    let mut args: Vec<String> = text.bytes().map(render_byte).collect();
                    args.push("0".into());
                    self.lines.push(Line::Directive {
                        name: "DB".into(),
                        args,
                    });
                }
            }
        }

        let slots: Vec<String> = self.slots_used.iter().cloned().collect();
        for slot in slots {
            if self.module.globals().any(|g| g.name == slot) {
                continue;
            }
            self.lines.push(Line::Label(slot));
            self.lines.push(Line::Directive {
                name: "DS".into(),
                args: vec!["2".into()],
            });
        }

        let mut spills: Vec<(String, u16)> = self
            .allocations
            .iter()
            .filter(|(_, a)| a.spill_slots > 0)
            .map(|(name, a)| (name.clone(), a.spill_slots))
            .collect();
        spills.sort();
        for (name, slots) in spills {
            self.lines.push(Line::Label(format!("{name}.spill")));
            self.lines.push(Line::Directive {
                name: "DS".into(),
                args: vec![slots.to_string()],
            });
        }
    }

    // ---- value movement --------------------------------------------------

    fn allocation(&self, f: &Function) -> &Allocation {
        &self.allocations[&f.name]
    }

    fn is_wide(&self, f: &Function, reg: VReg) -> bool {
        self.allocation(f).wide.get(&reg).copied().unwrap_or(true)
    }

    fn const_of(&self, f: &Function, reg: VReg) -> Option<Word> {
        match f.def_of(reg)? {
            Instruction::LoadConst { value, .. } => Some(*value),
            _ => None,
        }
    }

    fn spill_ref(&self, f: &Function, offset: u16) -> String {
        if offset == 0 {
            format!("{}.spill", f.name)
        } else {
            format!("{}.spill+{offset}", f.name)
        }
    }

    /// Load an 8-bit value into A.
    fn load8(&mut self, f: &Function, reg: VReg) {
        match self.allocation(f).loc(reg) {
            Some(Loc::R8(r)) => self.push(Line::inst_owned("LD", vec!["A".into(), r.to_string()])),
            Some(Loc::R16(p)) => {
                let (_, lo) = p.halves();
                self.push(Line::inst_owned("LD", vec!["A".into(), lo.to_string()]));
            }
            Some(Loc::Shadow8(r)) => {
                self.push(Line::inst("EXX", &[]));
                self.push(Line::inst_owned("LD", vec!["A".into(), r.to_string()]));
                self.push(Line::inst("EXX", &[]));
            }
            Some(Loc::Shadow16(p)) => {
                self.push(Line::inst("EXX", &[]));
                self.push(Line::inst_owned("LD", vec!["A".into(), p.halves().1.to_string()]));
                self.push(Line::inst("EXX", &[]));
            }
            Some(Loc::Spill(offset)) => {
                let slot = self.spill_ref(f, offset);
                self.push(Line::inst_owned("LD", vec!["A".into(), format!("({slot})")]));
            }
            None => self.push(Line::inst("LD", &["A", "0"])),
        }
    }

    /// Store A into an 8-bit home.
    fn store8(&mut self, f: &Function, reg: VReg) {
        match self.allocation(f).loc(reg) {
            Some(Loc::R8(r)) => self.push(Line::inst_owned("LD", vec![r.to_string(), "A".into()])),
            Some(Loc::R16(p)) => {
                let (_, lo) = p.halves();
                self.push(Line::inst_owned("LD", vec![lo.to_string(), "A".into()]));
            }
            Some(Loc::Shadow8(r)) => {
                self.push(Line::inst("EXX", &[]));
                self.push(Line::inst_owned("LD", vec![r.to_string(), "A".into()]));
                self.push(Line::inst("EXX", &[]));
            }
            Some(Loc::Shadow16(p)) => {
                self.push(Line::inst("EXX", &[]));
                self.push(Line::inst_owned("LD", vec![p.halves().1.to_string(), "A".into()]));
                self.push(Line::inst("EXX", &[]));
            }
            Some(Loc::Spill(offset)) => {
                let slot = self.spill_ref(f, offset);
                self.push(Line::inst_owned("LD", vec![format!("({slot})"), "A".into()]));
            }
            None => {}
        }
    }

    /// Load a 16-bit value into HL. An 8-bit home zero-extends.
    fn load16(&mut self, f: &Function, reg: VReg) {
        if !self.is_wide(f, reg) {
            self.load8(f, reg);
            self.push(Line::inst("LD", &["L", "A"]));
            self.push(Line::inst("LD", &["H", "0"]));
            return;
        }
        match self.allocation(f).loc(reg) {
            Some(Loc::R16(p)) => {
                let (hi, lo) = p.halves();
                self.push(Line::inst_owned("LD", vec!["L".into(), lo.to_string()]));
                self.push(Line::inst_owned("LD", vec!["H".into(), hi.to_string()]));
            }
            Some(Loc::R8(r)) => {
                self.push(Line::inst_owned("LD", vec!["L".into(), r.to_string()]));
                self.push(Line::inst("LD", &["H", "0"]));
            }
            Some(Loc::Shadow16(p)) => {
                self.push(Line::inst("EXX", &[]));
                self.push(Line::inst_owned("PUSH", vec![p.to_string()]));
                self.push(Line::inst("EXX", &[]));
                self.push(Line::inst("POP", &["HL"]));
            }
            Some(Loc::Shadow8(r)) => {
                self.push(Line::inst("EXX", &[]));
                self.push(Line::inst_owned("LD", vec!["A".into(), r.to_string()]));
                self.push(Line::inst("EXX", &[]));
                self.push(Line::inst("LD", &["L", "A"]));
                self.push(Line::inst("LD", &["H", "0"]));
            }
            Some(Loc::Spill(offset)) => {
                let slot = self.spill_ref(f, offset);
                self.push(Line::inst_owned("LD", vec!["HL".into(), format!("({slot})")]));
            }
            None => self.push(Line::inst("LD", &["HL", "0"])),
        }
    }

    /// Load a 16-bit value into DE without touching HL.
    fn load16_to_de(&mut self, f: &Function, reg: VReg) {
        if !self.is_wide(f, reg) {
            // Zero-extend through E; A is free between operand loads.
            self.push(Line::inst("PUSH", &["HL"]));
            self.load8(f, reg);
            self.push(Line::inst("POP", &["HL"]));
            self.push(Line::inst("LD", &["E", "A"]));
            self.push(Line::inst("LD", &["D", "0"]));
            return;
        }
        match self.allocation(f).loc(reg) {
            Some(Loc::R16(p)) => {
                let (hi, lo) = p.halves();
                self.push(Line::inst_owned("LD", vec!["E".into(), lo.to_string()]));
                self.push(Line::inst_owned("LD", vec!["D".into(), hi.to_string()]));
            }
            Some(Loc::R8(r)) => {
                self.push(Line::inst_owned("LD", vec!["E".into(), r.to_string()]));
                self.push(Line::inst("LD", &["D", "0"]));
            }
            Some(Loc::Shadow16(p)) => {
                self.push(Line::inst("EXX", &[]));
                self.push(Line::inst_owned("PUSH", vec![p.to_string()]));
                self.push(Line::inst("EXX", &[]));
                self.push(Line::inst("POP", &["DE"]));
            }
            Some(Loc::Shadow8(r)) => {
                self.push(Line::inst("EXX", &[]));
                self.push(Line::inst_owned("LD", vec!["A".into(), r.to_string()]));
                self.push(Line::inst("EXX", &[]));
                self.push(Line::inst("LD", &["E", "A"]));
                self.push(Line::inst("LD", &["D", "0"]));
            }
            Some(Loc::Spill(offset)) => {
                let slot = self.spill_ref(f, offset);
                self.push(Line::inst_owned("LD", vec!["DE".into(), format!("({slot})")]));
            }
            None => self.push(Line::inst("LD", &["DE", "0"])),
        }
    }

    /// Store HL into a 16-bit home.
    fn store16(&mut self, f: &Function, reg: VReg) {
        match self.allocation(f).loc(reg) {
            Some(Loc::R16(p)) => {
                let (hi, lo) = p.halves();
                self.push(Line::inst_owned("LD", vec![hi.to_string(), "H".into()]));
                self.push(Line::inst_owned("LD", vec![lo.to_string(), "L".into()]));
            }
            Some(Loc::R8(r)) => {
                self.push(Line::inst("LD", &["A", "L"]));
                self.push(Line::inst_owned("LD", vec![r.to_string(), "A".into()]));
            }
            Some(Loc::Shadow16(p)) => {
                self.push(Line::inst("PUSH", &["HL"]));
                self.push(Line::inst("EXX", &[]));
                self.push(Line::inst_owned("POP", vec![p.to_string()]));
                self.push(Line::inst("EXX", &[]));
            }
            Some(Loc::Shadow8(r)) => {
                self.push(Line::inst("LD", &["A", "L"]));
                self.push(Line::inst("EXX", &[]));
                self.push(Line::inst_owned("LD", vec![r.to_string(), "A".into()]));
                self.push(Line::inst("EXX", &[]));
            }
            Some(Loc::Spill(offset)) => {
                let slot = self.spill_ref(f, offset);
                self.push(Line::inst_owned("LD", vec![format!("({slot})"), "HL".into()]));
            }
            None => {}
        }
    }

    /// An 8-bit second operand: directly usable register name, or staged
    /// into E.
    fn stage_rhs8(&mut self, f: &Function, reg: VReg) -> String {
        match self.allocation(f).loc(reg) {
            Some(Loc::R8(r)) => r.to_string(),
            Some(Loc::R16(p)) => p.halves().1.to_string(),
            _ => {
                self.load8(f, reg);
                self.push(Line::inst("LD", &["E", "A"]));
                "E".into()
            }
        }
    }

    // ---- small utilities -------------------------------------------------

    fn push(&mut self, line: Line) {
        self.lines.push(line);
    }

    fn block_label(&self, f: &Function, block: BlockId) -> String {
        format!("{}.{}", f.name, f.block(block).label)
    }

    fn fresh_label(&mut self, f: &Function, prefix: &str) -> String {
        let n = self.label_counter;
        self.label_counter += 1;
        format!("{}.{prefix}{n}", f.name)
    }

    fn var_label(&mut self, name: &str) -> String {
        if self.module.globals().all(|g| g.name != name) {
            self.slots_used.insert(name.to_owned());
        }
        name.to_owned()
    }

    fn string_label(&mut self, id: StrId, kind: StringKind) -> String {
        if !self.strings_used.contains(&(id, kind)) {
            self.strings_used.push((id, kind));
        }
        match kind {
            StringKind::PascalShort => format!("{id}"),
            StringKind::PascalLong => format!("{id}_w"),
            StringKind::CStyle => format!("{id}_z"),
        }
    }

    fn anchor_of(&self, function: &str, param: u8) -> Option<(String, bool)> {
        let target = self.module.function(function)?;
        let param = target.params.get(param as usize)?;
        Some((anchor_imm(target, &param.name), param.ty.size_of() > 1))
    }
}

fn render_byte(byte: u8) -> String {
    if byte.is_ascii_graphic() && byte != b'\'' {
        format!("'{}'", byte as char)
    } else if byte == b' ' {
        "' '".into()
    } else {
        byte.to_string()
    }
}

fn anchor_op(f: &Function, param: &str) -> String {
    format!("{}.{param}$immOP", f.name)
}

fn anchor_imm(f: &Function, param: &str) -> String {
    format!("{}.{param}$imm0", f.name)
}

fn needs_anchor_save(f: &Function) -> bool {
    if f.recursion != Recursion::Direct {
        return false;
    }
    // Tail self-calls skip the save; only a true nested self-call needs
    // the anchors preserved across it.
    f.instructions().any(|i| matches!(
        i,
        Instruction::Call { callee, .. } if callee == &f.name
    ))
}

/// Default carrier registers for a parameter list, by width.
fn default_registers(widths: &[bool]) -> Option<Vec<String>> {
    let mut eight = vec!["B", "C", "A"];
    let mut sixteen = vec!["HL", "DE"];
    let mut out = Vec::new();
    for &wide in widths {
        let reg = if wide { sixteen.pop()? } else { eight.pop()? };
        out.push(reg.to_owned());
    }
    Some(out)
}

fn select_convention(
    f: &Function,
    options: &Options,
    address_taken: &HashSet<String>,
) -> Result<Convention, CodegenError> {
    if let Some(abi) = &f.abi {
        return parse_abi(f, abi);
    }

    // The analyzer marks functions whose parameters are already promised
    // as anchors (lambda captures); their callers patch immediates.
    if f.flags.contains(FunctionFlags::SMC) {
        return Ok(Convention::Smc);
    }

    let widths: Vec<bool> = f.params.iter().map(|p| p.ty.size_of() > 1).collect();
    if address_taken.contains(&f.name) {
        // Indirect callers cannot patch anchors or build a frame for us.
        if let Some(regs) = default_registers(&widths) {
            return Ok(Convention::Register(regs));
        }
        return Ok(Convention::Stack);
    }

    let scalar = f.params.iter().all(|p| p.tsmc);
    if f.flags.contains(FunctionFlags::INTERRUPT)
        || matches!(f.recursion, Recursion::Mutual | Recursion::Indirect)
        || f.params.len() > 3
        || !scalar
    {
        return Ok(Convention::Stack);
    }

    if options.enable_smc
        && options.target.supports_smc()
        && (f.is_pure() || f.recursion == Recursion::Direct)
    {
        return Ok(Convention::Smc);
    }

    match default_registers(&widths) {
        Some(regs) => Ok(Convention::Register(regs)),
        None => Ok(Convention::Stack),
    }
}

/// Parse `@abi("register: A=x, HL=y")` into an explicit carrier list.
fn parse_abi(f: &Function, abi: &str) -> Result<Convention, CodegenError> {
    let bad = |detail: &str| CodegenError::BadAbi {
        function: f.name.clone(),
        detail: detail.to_owned(),
    };

    let (kind, spec) = abi.split_once(':').ok_or_else(|| bad("missing `kind:`"))?;
    match kind.trim() {
        "register" => {
            let mut regs: Vec<Option<String>> = vec![None; f.params.len()];
            for binding in spec.split(',') {
                let (reg, param) = binding
                    .split_once('=')
                    .ok_or_else(|| bad("expected REG=param"))?;
                let reg = reg.trim().to_uppercase();
                let param = param.trim();
                let index = f
                    .params
                    .iter()
                    .position(|p| p.name == param)
                    .ok_or_else(|| bad(&format!("unknown parameter `{param}`")))?;
                regs[index] = Some(reg);
            }
            let regs: Option<Vec<String>> = regs.into_iter().collect();
            regs.map(Convention::Register)
                .ok_or_else(|| bad("not every parameter is bound to a register"))
        }
        "stack" => Ok(Convention::Stack),
        "smc" => Ok(Convention::Smc),
        other => Err(bad(&format!("unknown convention `{other}`"))),
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use minz_types::{SourceSpan, Type};

    fn options() -> Options {
        Options::default()
    }

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
        f.flags |= FunctionFlags::PURE;
        f
    }

    #[test]
    fn pure_scalar_functions_select_smc() {
        let f = add_function();
        let convention =
            select_convention(&f, &options(), &HashSet::new()).unwrap();
        assert_eq!(convention, Convention::Smc);
    }

    #[test]
    fn smc_is_off_for_rom_targets() {
        let f = add_function();
        let opts = Options {
            target: Target::Gb,
            ..options()
        };
        let convention = select_convention(&f, &opts, &HashSet::new()).unwrap();
        assert_ne!(convention, Convention::Smc);
    }

    #[test]
    fn interrupt_functions_use_the_stack() {
        let mut f = add_function();
        f.flags |= FunctionFlags::INTERRUPT;
        let convention = select_convention(&f, &options(), &HashSet::new()).unwrap();
        assert_eq!(convention, Convention::Stack);
    }

    #[test]
    fn address_taken_functions_use_registers() {
        let f = add_function();
        let mut taken = HashSet::new();
        taken.insert("add$u8$u8".to_owned());
        let convention = select_convention(&f, &options(), &taken).unwrap();
        assert!(matches!(convention, Convention::Register(_)));
    }

    #[test]
    fn abi_attribute_overrides_selection() {
        let mut f = add_function();
        f.abi = Some("register: A=a, E=b".into());
        let convention = select_convention(&f, &options(), &HashSet::new()).unwrap();
        assert_eq!(
            convention,
            Convention::Register(vec!["A".into(), "E".into()])
        );
    }

    #[test]
    fn malformed_abi_is_an_error() {
        let mut f = add_function();
        f.abi = Some("register: A=nope".into());
        let err = select_convention(&f, &options(), &HashSet::new()).unwrap_err();
        assert!(matches!(err, CodegenError::BadAbi { .. }));
    }

    #[test]
    fn non_z80_targets_are_rejected() {
        let module = Module::new("m");
        let opts = Options {
            target: Target::Wasm,
            ..options()
        };
        let err = generate(&module, &opts).unwrap_err();
        assert!(matches!(err, CodegenError::UnsupportedTarget(Target::Wasm)));
    }

    #[test]
    fn smc_function_emits_anchors_and_equs() {
        let mut module = Module::new("m");
        module.add_function(add_function());
        let text = generate(&module, &options()).unwrap();

        assert!(text.contains("add$u8$u8.a$immOP:"));
        assert!(text.contains("add$u8$u8.a$imm0 EQU add$u8$u8.a$immOP+1"));
        assert!(text.contains("add$u8$u8.b$imm0 EQU add$u8$u8.b$immOP+1"));
        assert!(text.contains("add$u8$u8_loop:"));
        assert!(text.contains("END"));
    }

    #[test]
    fn dead_functions_are_skipped() {
        let mut module = Module::new("m");
        let mut dead = add_function();
        dead.flags |= FunctionFlags::DEAD;
        module.add_function(dead);
        let text = generate(&module, &options()).unwrap();
        assert!(!text.contains("add$u8$u8:"));
    }

    #[test]
    fn unterminated_block_is_fatal() {
        let mut module = Module::new("m");
        let mut f = Function::new("broken", Type::Void, SourceSpan::synthesized());
        f.add_block("dangling");
        f.terminate(f.entry(), Terminator::Return(None));
        module.add_function(f);
        let err = generate(&module, &options()).unwrap_err();
        assert!(matches!(err, CodegenError::Invariant(_)));
    }
}
