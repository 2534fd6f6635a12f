//! Phase sequencing.

use minz_codegen::{CodegenError, Target};
use minz_ctie::{analyze_purity, CtieEngine, CtieParams, CtieStats, PurityReport};
use minz_sema::ast;
use minz_types::{Diagnostic, DiagnosticKind, DiagnosticSink, InvariantViolation};
use tracing::{debug, info_span};

/// Pipeline configuration, assembled from the CLI surface.
#[derive(Debug, Clone)]
pub struct CompileOptions {
    /// Run the MIR optimizer and the assembly peephole.
    pub optimize: bool,
    /// Permit TSMC parameter passing.
    pub enable_smc: bool,
    /// Permit compile-time execution of pure calls.
    pub enable_ctie: bool,
    /// Interpreter bounds for CTIE.
    pub ctie: CtieParams,
    /// Selected backend.
    pub target: Target,
    /// Produce the textual MIR dump alongside the assembly.
    pub emit_ir: bool,
    /// Include explanatory comments in the assembly.
    pub debug: bool,
}

impl Default for CompileOptions {
    fn default() -> Self {
        Self {
            optimize: false,
            enable_smc: true,
            enable_ctie: false,
            ctie: CtieParams::default(),
            target: Target::Z80,
            emit_ir: false,
            debug: false,
        }
    }
}

/// Everything a successful run produces.
#[derive(Debug)]
pub struct CompileOutput {
    /// The generated assembly text.
    pub assembly: String,
    /// The MIR dump, when `--emit-ir` was requested.
    pub ir: Option<String>,
    /// Purity statistics.
    pub purity: PurityReport,
    /// CTIE statistics; zeroes when CTIE was off.
    pub ctie: CtieStats,
}

/// Why a run produced no output.
#[derive(Debug, thiserror::Error)]
pub enum CompileError {
    /// User-facing diagnostics were recorded; they live in the sink.
    #[error("compilation failed with {0} error(s)")]
    Diagnostics(usize),
    /// A compiler invariant did not hold.
    #[error(transparent)]
    Internal(#[from] InvariantViolation),
}

/// Run the whole pipeline over a typed AST.
pub fn compile(
    program: &ast::Program,
    options: &CompileOptions,
    sink: &mut DiagnosticSink,
) -> Result<CompileOutput, CompileError> {
    let span = info_span!("compile", module = %program.root);
    let _guard = span.enter();

    let mut module = minz_sema::analyze(program, sink);
    if sink.has_errors() {
        return Err(CompileError::Diagnostics(sink.len()));
    }
    debug!("semantic analysis done");

    let purity = analyze_purity(&mut module);

    let ctie = if options.enable_ctie {
        let mut engine = CtieEngine::new(options.ctie);
        let stats = engine.run(&mut module);
        debug!(
            candidates = stats.candidates,
            folded = stats.folded,
            "ctie done"
        );
        stats
    } else {
        CtieStats::default()
    };

    if options.optimize {
        minz_opt::optimize(&mut module);
        debug!("optimizer done");
    }

    let ir = options.emit_ir.then(|| module.to_string());

    // Codegen and every later observer see an immutable module.
    module.freeze();

    let codegen = minz_codegen::Options {
        target: options.target,
        enable_smc: options.enable_smc && options.target.supports_smc(),
        optimize: options.optimize,
        debug_comments: options.debug,
        org: 0x8000,
    };
    let assembly = match minz_codegen::generate(&module, &codegen) {
        Ok(assembly) => assembly,
        Err(CodegenError::Invariant(violation)) => return Err(CompileError::Internal(violation)),
        Err(error) => {
            sink.report(Diagnostic::unspanned(
                DiagnosticKind::Codegen,
                error.to_string(),
            ));
            return Err(CompileError::Diagnostics(sink.len()));
        }
    };

    Ok(CompileOutput {
        assembly,
        ir,
        purity,
        ctie,
    })
}
