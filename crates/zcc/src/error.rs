//! Compile-error type with caret diagnostics.
//!
//! Every pipeline stage reports failure through [`CompileError`], which
//! carries an optional source anchor and renders as
//!
//! ```text
//! foo.c:10: x = y + 1;
//!               ^ expected ';'
//! ```

use std::fmt;

use crate::token::{SourceFile, Token};

pub type Result<T> = std::result::Result<T, CompileError>;

/// A fatal compilation error.
///
/// Allows proper error propagation with `?` for both diagnostics anchored
/// to a token and plain messages (I/O failures, driver errors).
#[derive(Debug)]
pub struct CompileError {
    message: String,
    location: Option<Location>,
}

#[derive(Debug)]
struct Location {
    /// Display name of the file (may have been overridden by `#line`)
    file: String,
    /// 1-based line number as reported to the user
    line_no: usize,
    /// Text of the source line the error points into
    line: String,
    /// Byte offset of the offending lexeme within `line`
    column: usize,
}

impl CompileError {
    /// An error with no source anchor.
    pub fn plain(message: impl Into<String>) -> Self {
        CompileError {
            message: message.into(),
            location: None,
        }
    }

    /// An error pointing at a byte offset within a source file.
    ///
    /// The line number is recomputed by scanning the file contents, so this
    /// is the right constructor for lexer errors where no token exists yet.
    pub fn at(file: &SourceFile, loc: usize, message: impl Into<String>) -> Self {
        let line_no = file.contents[..loc.min(file.contents.len())]
            .bytes()
            .filter(|&b| b == b'\n')
            .count()
            + 1;
        Self::at_line(file, loc, line_no, message)
    }

    /// An error pointing at a token. Uses the token's recorded line number,
    /// which respects `#line` adjustments.
    pub fn at_token(tok: &Token, message: impl Into<String>) -> Self {
        Self::at_line(&tok.file, tok.loc, tok.line_no, message)
    }

    fn at_line(
        file: &SourceFile,
        loc: usize,
        line_no: usize,
        message: impl Into<String>,
    ) -> Self {
        let bytes = file.contents.as_bytes();
        let loc = loc.min(bytes.len());

        // Find the line containing `loc`.
        let start = bytes[..loc]
            .iter()
            .rposition(|&b| b == b'\n')
            .map(|i| i + 1)
            .unwrap_or(0);
        let end = bytes[loc..]
            .iter()
            .position(|&b| b == b'\n')
            .map(|i| loc + i)
            .unwrap_or(bytes.len());

        CompileError {
            message: message.into(),
            location: Some(Location {
                file: file.name.clone(),
                line_no,
                line: String::from_utf8_lossy(&bytes[start..end]).into_owned(),
                column: loc - start,
            }),
        }
    }
}

impl fmt::Display for CompileError {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        match &self.location {
            Some(loc) => {
                let prefix = format!("{}:{}: ", loc.file, loc.line_no);
                writeln!(f, "{}{}", prefix, loc.line)?;
                let indent = prefix.len() + loc.column;
                write!(f, "{:indent$}^ {}", "", self.message, indent = indent)
            }
            None => write!(f, "{}", self.message),
        }
    }
}

impl std::error::Error for CompileError {}

impl From<fmt::Error> for CompileError {
    fn from(e: fmt::Error) -> Self {
        CompileError::plain(format!("assembly output error: {}", e))
    }
}

impl From<std::io::Error> for CompileError {
    fn from(e: std::io::Error) -> Self {
        CompileError::plain(e.to_string())
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::token::SourceFile;

    #[test]
    fn test_plain_error_renders_message_only() {
        let err = CompileError::plain("no input files");
        assert_eq!(err.to_string(), "no input files");
    }

    #[test]
    fn test_located_error_renders_caret_line() {
        let file = SourceFile::new("foo.c", 1, "int main() { return x; }\n");
        // Offset of `x`.
        let loc = file.contents.find('x').unwrap();
        let err = CompileError::at(&file, loc, "undefined variable");

        let rendered = err.to_string();
        let mut lines = rendered.lines();
        assert_eq!(lines.next().unwrap(), "foo.c:1: int main() { return x; }");
        let caret_line = lines.next().unwrap();
        assert!(caret_line.ends_with("^ undefined variable"));
        // Caret sits under `x`: the printed prefix "foo.c:1: " is 9 chars
        // wide, and `x` is `loc` bytes into the (single-line) file.
        assert_eq!(caret_line.find('^').unwrap(), 9 + loc);
    }

    #[test]
    fn test_error_on_second_line() {
        let file = SourceFile::new("a.c", 1, "int x;\nint y@;\n");
        let loc = file.contents.find('@').unwrap();
        let err = CompileError::at(&file, loc, "invalid token");
        let rendered = err.to_string();
        assert!(rendered.starts_with("a.c:2: int y@;"));
    }
}
