//! zcc compiler library
//!
//! Compiles a subset of C to x86-64 assembly in Intel syntax, suitable
//! for a GNU-style assembler. The pipeline is strictly linear:
//!
//! ```text
//! bytes -> tokens -> preprocessed tokens -> keyword-converted tokens
//!       -> typed AST -> assembly text
//! ```
//!
//! Each stage consumes the previous stage's output in full; there are no
//! back-edges. All entry points return [`Result`]; the driver prints the
//! error (a caret-underlined source snippet when a location is known)
//! and exits with status 1.

pub mod ast;
pub mod codegen;
pub mod error;
pub mod lexer;
pub mod parser;
pub mod preprocess;
pub mod token;
pub mod types;

pub use codegen::CodeGen;
pub use error::{CompileError, Result};
pub use parser::Parser;
pub use preprocess::Preprocessor;

use std::path::PathBuf;

use tracing::debug;

use token::Token;

/// Compile one source file (or stdin for `-`) to assembly text.
pub fn compile_file(path: &str, include_paths: Vec<PathBuf>) -> Result<String> {
    let toks = lexer::tokenize_file(path, 1)?;
    compile_tokens(toks, include_paths)
}

/// Compile in-memory source text under a display name. Used by tests and
/// tooling; behaves exactly like [`compile_file`].
pub fn compile_source(name: &str, source: &str, include_paths: Vec<PathBuf>) -> Result<String> {
    let toks = lexer::tokenize_source(name, source, 1)?;
    compile_tokens(toks, include_paths)
}

fn compile_tokens(toks: Vec<Token>, include_paths: Vec<PathBuf>) -> Result<String> {
    let mut pp = Preprocessor::new(include_paths);
    let mut toks = pp.preprocess(toks)?;
    lexer::convert_pp_tokens(&mut toks)?;
    debug!(tokens = toks.len(), "tokens ready");

    let mut parser = Parser::new(toks);
    let mut prog = parser.parse()?;

    // Frame offsets are assigned exactly once, after parsing.
    prog.assign_offsets();

    CodeGen::new().generate(&prog, pp.files())
}

/// Preprocess only (`-E`): macro-expanded, directive-free token stream
/// rendered back to text.
pub fn preprocess_file(path: &str, include_paths: Vec<PathBuf>) -> Result<String> {
    let toks = lexer::tokenize_file(path, 1)?;
    let mut pp = Preprocessor::new(include_paths);
    let toks = pp.preprocess(toks)?;
    Ok(preprocess::stringify(&toks))
}

#[cfg(test)]
mod tests {
    use super::*;

    fn compile(src: &str) -> String {
        compile_source("test.c", src, Vec::new())
            .unwrap_or_else(|e| panic!("compile failed: {}", e))
    }

    #[test]
    fn test_minimal_program_shape() {
        let asm = compile("int main() { return 0; }");
        assert!(asm.starts_with(".intel_syntax noprefix\n"));
        assert!(asm.contains(".file 1 \"test.c\""));
        assert!(asm.contains(".globl main"));
        assert!(asm.contains("main:"));
        // Prologue and epilogue bracket the body.
        assert!(asm.contains("  push rbp"));
        assert!(asm.contains(".L.return.main:"));
        assert!(asm.contains("  ret"));
    }

    #[test]
    fn test_sections_in_order() {
        let asm = compile("int zeroed; int filled = 1; int main() { return 0; }");
        let bss = asm.find(".bss").unwrap();
        let data = asm.find(".data").unwrap();
        let text = asm.find(".text").unwrap();
        assert!(bss < data && data < text);
    }

    #[test]
    fn test_static_function_not_exported() {
        let asm = compile("static int helper() { return 1; } int main() { return helper(); }");
        assert!(!asm.contains(".globl helper"));
        assert!(asm.contains("helper:"));
    }

    #[test]
    fn test_loc_directives_present() {
        let asm = compile("int main() {\n  return 0;\n}");
        assert!(asm.contains(".loc 1 2"));
    }

    #[test]
    fn test_preprocessor_feeds_parser() {
        let asm = compile("#define ANSWER 42\nint main() { return ANSWER; }");
        assert!(asm.contains("  mov r10, 42"));
    }

    #[test]
    fn test_error_reports_path_and_line() {
        let err = compile_source("bad.c", "int main() { return x; }", Vec::new()).unwrap_err();
        let msg = err.to_string();
        assert!(msg.contains("bad.c:1:"));
        assert!(msg.contains("undefined variable"));
    }
}
