use std::{fs, path::Path, process::ExitCode};

use clap::Parser;
use minz_sema::ast;
use minz_types::DiagnosticSink;
use minzc::{
    cli::Cli, compile, CompileError, EXIT_COMPILE_ERROR, EXIT_INTERNAL_ERROR, EXIT_IO_ERROR,
    EXIT_SUCCESS,
};
use tracing_subscriber::EnvFilter;

fn main() -> ExitCode {
    let cli = Cli::parse();
    init_tracing(&cli);

    let program = match load_program(&cli.input) {
        Ok(program) => program,
        Err(message) => {
            eprintln!("minzc: {message}");
            return ExitCode::from(EXIT_IO_ERROR as u8);
        }
    };

    let options = cli.compile_options();
    let mut sink = DiagnosticSink::new();
    let code = match compile(&program, &options, &mut sink) {
        Ok(output) => {
            if let Err(error) = fs::write(&cli.output, &output.assembly) {
                eprintln!("minzc: cannot write {}: {error}", cli.output.display());
                return ExitCode::from(EXIT_IO_ERROR as u8);
            }
            if let Some(ir) = &output.ir {
                let path = cli.output.with_extension("mir");
                if let Err(error) = fs::write(&path, ir) {
                    eprintln!("minzc: cannot write {}: {error}", path.display());
                    return ExitCode::from(EXIT_IO_ERROR as u8);
                }
            }
            EXIT_SUCCESS
        }
        Err(CompileError::Diagnostics(_)) => EXIT_COMPILE_ERROR,
        Err(CompileError::Internal(violation)) => {
            eprintln!("minzc: {violation}");
            EXIT_INTERNAL_ERROR
        }
    };

    for diagnostic in sink.iter() {
        eprintln!("{diagnostic}");
    }
    ExitCode::from(code as u8)
}

fn init_tracing(cli: &Cli) {
    let default = if cli.ctie_debug {
        "warn,minz_ctie=debug"
    } else {
        "warn"
    };
    let filter = EnvFilter::try_from_default_env().unwrap_or_else(|_| EnvFilter::new(default));
    tracing_subscriber::fmt()
        .with_env_filter(filter)
        .with_writer(std::io::stderr)
        .init();
}

/// The parser is an external collaborator; its output contract is the
/// serialized typed AST. Raw `.minz` source needs that frontend first.
fn load_program(path: &Path) -> Result<ast::Program, String> {
    let extension = path.extension().and_then(|e| e.to_str()).unwrap_or("");
    if extension == "minz" {
        return Err(format!(
            "{}: raw MinZ source needs the external parser; pass its .ast.json output",
            path.display()
        ));
    }
    let text =
        fs::read_to_string(path).map_err(|error| format!("{}: {error}", path.display()))?;
    serde_json::from_str(&text)
        .map_err(|error| format!("{}: malformed typed AST: {error}", path.display()))
}
