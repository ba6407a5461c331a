use std::io::Read;
use std::path::PathBuf;
use std::process::ExitCode;

use clap::Parser;
use corvid::{Vm, render_error};

/// corvid - run a script written in the corvid language
#[derive(Parser, Debug)]
#[command(name = "corvid")]
#[command(about = "Run a corvid script", long_about = None)]
struct Args {
    /// Script to run. Reads from stdin if omitted.
    file: Option<PathBuf>,
}

fn read_source(file: Option<&PathBuf>) -> std::io::Result<String> {
    match file {
        Some(path) => std::fs::read_to_string(path),
        None => {
            let mut buf = String::new();
            std::io::stdin().read_to_string(&mut buf)?;
            Ok(buf)
        }
    }
}

fn main() -> ExitCode {
    tracing_subscriber::fmt()
        .with_env_filter(tracing_subscriber::EnvFilter::from_default_env())
        .init();

    let args = Args::parse();

    let source = match read_source(args.file.as_ref()) {
        Ok(source) => source,
        Err(err) => {
            eprintln!("corvid: couldn't read script: {err}");
            return ExitCode::from(66); // EX_NOINPUT
        }
    };

    let mut vm = Vm::new();
    match vm.interpret(&source) {
        Ok(()) => ExitCode::SUCCESS,
        Err(err) => {
            let code = corvid::exit_code_for(&err);
            render_error(&source, &err);
            ExitCode::from(code as u8)
        }
    }
}
