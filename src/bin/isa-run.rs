//! Thin CLI launcher: read a source file, run it, exit with its code.
//!
//! Mirrors `main.py`'s surface (a single required source-file argument,
//! the default `flag.txt` vfile) without pulling in an argument-parsing
//! crate — one positional argument doesn't justify the dependency.

use std::process::ExitCode;

use sandbox_vm::consts::{DEFAULT_FLAG_CONTENT, DEFAULT_FLAG_NAME};
use sandbox_vm::engine::Engine;

#[tokio::main]
async fn main() -> ExitCode {
    tracing_subscriber::fmt::init();

    let mut args = std::env::args().skip(1);
    let source = match args.next() {
        Some(path) => path,
        None => {
            eprintln!("usage: isa-run <source-file>");
            return ExitCode::FAILURE;
        }
    };

    let program = match std::fs::read(&source) {
        Ok(bytes) => bytes,
        Err(err) => {
            eprintln!("bad config: could not open/read file {source}: {err}");
            return ExitCode::FAILURE;
        }
    };

    let vfiles = [(DEFAULT_FLAG_NAME.as_bytes().to_vec(), DEFAULT_FLAG_CONTENT.to_vec())];
    let stdin = Box::new(tokio::io::stdin());
    let stdout = Box::new(tokio::io::stdout());

    let mut engine = match Engine::new(&program, stdin, stdout, vfiles) {
        Ok(engine) => engine,
        Err(err) => {
            eprintln!("{err}");
            return ExitCode::FAILURE;
        }
    };

    match engine.run().await {
        Ok(()) => ExitCode::from((engine.exit_code() & 0xFF) as u8),
        Err(err) => {
            eprintln!("{err}");
            ExitCode::FAILURE
        }
    }
}
