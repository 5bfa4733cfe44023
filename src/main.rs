//! Command-line driver: REPL (via `rustyline`) with zero arguments, file
//! execution with one argument, usage error otherwise. Owns the process's
//! only logger and terminal-coloring policy; the library crate stays
//! silent and uncolored on both counts.

use colored::Colorize;
use loxido::{InterpretResult, Phase, Report, Reporter};
use rustyline::error::ReadlineError;
use rustyline::DefaultEditor;
use std::{env, fs, process};

const HISTORY_FILE: &str = ".loxido_history";

struct CliReporter;

impl Reporter for CliReporter {
    fn report(&mut self, report: Report) {
        let tag = match report.phase {
            Phase::Compile => "compile error".red().bold(),
            Phase::Runtime => "runtime error".red().bold(),
        };
        eprintln!("{tag}: {}", report.message);
    }
}

fn main() {
    env_logger::init();

    let mut args = env::args().skip(1);
    match (args.next(), args.next()) {
        (None, _) => repl(),
        (Some(path), None) => run_file(&path),
        _ => {
            eprintln!("Usage: loxido [script]");
            process::exit(exitcode::USAGE);
        }
    }
}

fn run_file(path: &str) {
    let source = fs::read_to_string(path).unwrap_or_else(|err| {
        eprintln!("Can't read '{path}': {err}");
        process::exit(exitcode::IOERR);
    });
    let mut vm = loxido::Vm::new();
    let mut reporter = CliReporter;
    match vm.interpret(&source, false, &mut reporter) {
        InterpretResult::Ok => process::exit(exitcode::OK),
        InterpretResult::CompileError => process::exit(exitcode::DATAERR),
        InterpretResult::RuntimeError => process::exit(exitcode::SOFTWARE),
    }
}

fn repl() {
    let mut vm = loxido::Vm::new();
    let mut reporter = CliReporter;
    let mut editor = DefaultEditor::new().expect("failed to initialize line editor");
    let _ = editor.load_history(HISTORY_FILE);

    loop {
        match editor.readline(&"loxido> ".cyan().to_string()) {
            Ok(line) => {
                let _ = editor.add_history_entry(line.as_str());
                vm.interpret(&line, true, &mut reporter);
            }
            Err(ReadlineError::Interrupted) => continue,
            Err(ReadlineError::Eof) => break,
            Err(err) => {
                eprintln!("readline error: {err}");
                break;
            }
        }
    }
    let _ = editor.save_history(HISTORY_FILE);
}
