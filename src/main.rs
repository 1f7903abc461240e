use std::{path::PathBuf, process::ExitCode};

use clap::Parser as ClapParser;
use colored::Colorize;
use tracing_subscriber::EnvFilter;

use crate::error::CodegenError;

mod backend;
mod error;
mod index;
mod mir;

#[derive(Debug, ClapParser)]
#[command(version, about, long_about = None)]
pub struct Args {
    /// Dump an intermediate stage instead of assembling
    #[arg(short = 'e', value_enum)]
    emit: Option<EmitFormat>,

    /// Output path; assembly goes to standard output when omitted
    #[arg(short = 'o')]
    output_path: Option<PathBuf>,

    source_file: PathBuf,
}

#[derive(Debug, Clone, Copy, PartialEq, Eq, clap::ValueEnum)]
pub enum EmitFormat {
    #[value(name = "mir")]
    Mir,
    #[value(name = "llir")]
    Llir,
    #[value(name = "asm")]
    Asm,
}

fn main() -> ExitCode {
    tracing_subscriber::fmt()
        .with_env_filter(EnvFilter::from_default_env())
        .with_writer(std::io::stderr)
        .init();

    let args = Args::parse();

    match run(&args) {
        Ok(()) => ExitCode::SUCCESS,
        Err(error) => {
            eprintln!("{} {error}", "error:".red().bold());
            ExitCode::FAILURE
        }
    }
}

fn run(args: &Args) -> Result<(), CodegenError> {
    let path = args.source_file.display().to_string();
    let source = std::fs::read_to_string(&args.source_file).map_err(|source| {
        CodegenError::Io {
            path: path.clone(),
            source,
        }
    })?;

    let module = mir::parser::parse_module(&path, &source)?;

    match args.emit {
        Some(EmitFormat::Mir) => {
            mir::pretty_print::pretty_print_mir(&module);
            return Ok(());
        }
        Some(EmitFormat::Llir) => {
            let lowered = backend::lower_only(&module)?;
            backend::pretty_print::pretty_print_llir(&lowered, backend::target::aarch64::target());
            return Ok(());
        }
        Some(EmitFormat::Asm) | None => {}
    }

    let assembly = backend::compile_to_assembly(&module)?;

    match &args.output_path {
        Some(output) => std::fs::write(output, assembly).map_err(|source| CodegenError::Io {
            path: output.display().to_string(),
            source,
        })?,
        None => print!("{assembly}"),
    }

    Ok(())
}
