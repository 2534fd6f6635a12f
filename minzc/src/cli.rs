//! CLI definitions and argument types.

use std::path::PathBuf;

use clap::Parser;
use minz_codegen::Target;
use minz_ctie::CtieParams;

use crate::CompileOptions;

/// The MinZ compiler.
#[derive(Debug, Parser)]
#[command(name = "minzc")]
#[command(about = "MinZ compiler - modern syntax, Z80 machine code")]
#[command(version)]
pub struct Cli {
    /// Input program: a typed AST produced by the parser (`.ast.json`).
    #[arg(value_name = "SOURCE")]
    pub input: PathBuf,

    /// Output assembly file.
    #[arg(short, long, value_name = "OUTPUT", default_value = "out.a80")]
    pub output: PathBuf,

    /// Enable the optimizer (MIR passes and the assembly peephole).
    #[arg(short = 'O')]
    pub optimize: bool,

    /// Permit true self-modifying code for parameter passing.
    #[arg(long, default_value = "true", action = clap::ArgAction::Set)]
    pub enable_smc: bool,

    /// Permit compile-time execution of pure calls.
    #[arg(long)]
    pub enable_ctie: bool,

    /// Log CTIE decisions (sets the ctie log filter to debug).
    #[arg(long)]
    pub ctie_debug: bool,

    /// CTIE step budget per candidate.
    #[arg(long, value_name = "STEPS", default_value_t = 1_000_000)]
    pub ctie_steps: u64,

    /// CTIE recursion depth per candidate.
    #[arg(long, value_name = "FRAMES", default_value_t = 64)]
    pub ctie_depth: usize,

    /// Code generation backend.
    #[arg(long, value_enum, default_value = "z80")]
    pub target: TargetArg,

    /// Write the textual MIR dump alongside the output.
    #[arg(long)]
    pub emit_ir: bool,

    /// Include comments in the generated assembly.
    #[arg(long)]
    pub debug: bool,
}

impl Cli {
    /// Fold the argument surface into pipeline options.
    pub fn compile_options(&self) -> CompileOptions {
        let target: Target = self.target.into();
        CompileOptions {
            optimize: self.optimize,
            enable_smc: self.enable_smc && target.supports_smc(),
            enable_ctie: self.enable_ctie,
            ctie: CtieParams {
                step_budget: self.ctie_steps,
                max_depth: self.ctie_depth,
            },
            target,
            emit_ir: self.emit_ir,
            debug: self.debug,
        }
    }
}

/// Backend argument.
#[derive(Debug, Clone, Copy, PartialEq, Eq, clap::ValueEnum)]
pub enum TargetArg {
    /// Zilog Z80 (primary).
    Z80,
    /// Intel 8080.
    I8080,
    /// Game Boy.
    Gb,
    /// MOS 6502.
    M6502,
    /// Motorola 68000.
    M68k,
    /// WebAssembly.
    Wasm,
    /// Portable C.
    C,
}

impl From<TargetArg> for Target {
    fn from(arg: TargetArg) -> Self {
        match arg {
            TargetArg::Z80 => Target::Z80,
            TargetArg::I8080 => Target::I8080,
            TargetArg::Gb => Target::Gb,
            TargetArg::M6502 => Target::M6502,
            TargetArg::M68k => Target::M68k,
            TargetArg::Wasm => Target::Wasm,
            TargetArg::C => Target::C,
        }
    }
}
