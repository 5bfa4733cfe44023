//! Single-pass bytecode compiler and stack-based VM for a Lox-family
//! scripting language. `interpret_str` is the library's only public entry
//! point beyond the `Vm` type itself: compile to a top-level closure, then
//! run it. The library never installs a logger or writes to stderr on its
//! own — callers supply a [`Reporter`] and the CLI binary owns `env_logger`.

mod chunk;
mod compiler;
mod error;
mod gc;
mod natives;
mod object;
mod scanner;
mod table;
mod token;
mod value;
mod vm;

pub use error::{
    CompileError, InterpretResult, Phase, Report, Reporter, RuntimeError, ScanError, StderrReporter,
};
pub use vm::Vm;

/// Compiles and runs `source` against a fresh VM with no retained state.
/// Each REPL line instead goes through a single long-lived [`Vm`] so
/// globals and function definitions persist across lines; see `main.rs`.
pub fn interpret_str(source: &str, is_repl: bool, reporter: &mut dyn Reporter) -> InterpretResult {
    let mut vm = Vm::new();
    vm.interpret(source, is_repl, reporter)
}

#[cfg(test)]
mod tests {
    use super::*;

    struct NullReporter;
    impl Reporter for NullReporter {
        fn report(&mut self, _report: Report) {}
    }

    #[test]
    fn interpret_str_compiles_and_runs_a_program() {
        let mut reporter = NullReporter;
        let result = interpret_str("print 1 + 2 * 3;", false, &mut reporter);
        assert!(matches!(result, InterpretResult::Ok));
    }
}
