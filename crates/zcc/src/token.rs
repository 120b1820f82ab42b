//! Tokens and source files shared by every pipeline stage.
//!
//! A token stream is a `Vec<Token>` terminated by an [`TokenKind::Eof`]
//! token. Tokens keep a reference to the file they were cut from so that
//! diagnostics and `.loc` directives can be produced at any stage.

use std::collections::HashSet;
use std::rc::Rc;

use crate::types::Type;

/// One input file. Shared (via `Rc`) by all tokens cut from it.
#[derive(Debug)]
pub struct SourceFile {
    /// Display name. `#line` directives may substitute a new name.
    pub name: String,
    /// Number used in `.file`/`.loc` assembler directives (1-based).
    pub file_no: usize,
    /// Entire contents, line endings canonicalised to `\n`, final newline
    /// guaranteed, backslash-newlines spliced and universal character
    /// names replaced before tokenisation.
    pub contents: String,
}

impl SourceFile {
    pub fn new(name: impl Into<String>, file_no: usize, contents: impl Into<String>) -> Self {
        SourceFile {
            name: name.into(),
            file_no,
            contents: contents.into(),
        }
    }
}

/// A converted numeric literal: the decoded value plus its inferred type.
#[derive(Debug, Clone, PartialEq)]
pub struct NumLit {
    /// Value if the type is integral (also holds char-literal values).
    pub ival: i64,
    /// Value if the type is floating.
    pub fval: f64,
    pub ty: Rc<Type>,
}

impl NumLit {
    pub fn int(ival: i64, ty: Rc<Type>) -> Self {
        NumLit {
            ival,
            fval: 0.0,
            ty,
        }
    }

    pub fn float(fval: f64, ty: Rc<Type>) -> Self {
        NumLit {
            ival: 0,
            fval,
            ty,
        }
    }
}

#[derive(Debug, Clone, PartialEq)]
pub enum TokenKind {
    /// Punctuator
    Punct,
    /// Identifier. Keywords keep this kind until the post-preprocess
    /// conversion pass runs.
    Ident,
    /// Reserved word
    Keyword,
    /// Numeric literal as lexed, not yet decoded
    PpNum,
    /// Decoded numeric literal
    Num(NumLit),
    /// String literal: decoded bytes including the terminating NUL
    Str(Vec<u8>),
    /// End-of-file marker
    Eof,
}

#[derive(Debug, Clone)]
pub struct Token {
    pub kind: TokenKind,
    pub file: Rc<SourceFile>,
    /// Byte offset of the lexeme within `file.contents`.
    pub loc: usize,
    /// The lexeme itself.
    pub text: String,
    /// 1-based line number; `#line` shifts it for subsequent tokens.
    pub line_no: usize,
    /// True if this token is the first on its line.
    pub at_bol: bool,
    /// True if a space (or comment) immediately precedes this token.
    pub has_space: bool,
    /// Macros already expanded at this position; prevents recursion.
    pub hideset: HashSet<String>,
}

impl Token {
    pub fn new(kind: TokenKind, file: Rc<SourceFile>, loc: usize, text: impl Into<String>) -> Self {
        Token {
            kind,
            file,
            loc,
            text: text.into(),
            line_no: 0,
            at_bol: false,
            has_space: false,
            hideset: HashSet::new(),
        }
    }

    /// Lexeme comparison, the universal "is this token `op`?" test.
    pub fn is(&self, op: &str) -> bool {
        !matches!(self.kind, TokenKind::Str(_)) && self.text == op
    }

    pub fn is_ident(&self) -> bool {
        matches!(self.kind, TokenKind::Ident)
    }

    pub fn is_eof(&self) -> bool {
        matches!(self.kind, TokenKind::Eof)
    }

    /// True for a `#` that starts a preprocessor directive.
    pub fn is_hash(&self) -> bool {
        self.at_bol && self.is("#")
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    fn dummy_token(text: &str, kind: TokenKind) -> Token {
        let file = Rc::new(SourceFile::new("t.c", 1, String::new()));
        Token::new(kind, file, 0, text)
    }

    #[test]
    fn test_is_matches_lexeme() {
        let tok = dummy_token("+=", TokenKind::Punct);
        assert!(tok.is("+="));
        assert!(!tok.is("+"));
    }

    #[test]
    fn test_string_token_never_matches_lexeme() {
        // A string literal's text includes its quotes, but `is` must not
        // treat it as a punctuator or keyword under any circumstances.
        let tok = dummy_token("\"if\"", TokenKind::Str(b"if\0".to_vec()));
        assert!(!tok.is("\"if\""));
    }
}
