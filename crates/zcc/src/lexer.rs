//! Lexer: byte stream to token stream.
//!
//! A file is read, canonicalised (line endings, final newline), spliced
//! (backslash-newline), has its universal character names replaced, and is
//! then cut into tokens. Numeric literals stay as loosely-lexed
//! "pp-numbers" until after preprocessing, when [`convert_pp_tokens`]
//! decodes them and turns identifiers into keywords.

use std::io::Read;
use std::rc::Rc;

use crate::error::{CompileError, Result};
use crate::token::{NumLit, SourceFile, Token, TokenKind};
use crate::types::Type;

const KEYWORDS: &[&str] = &[
    "return", "if", "else", "for", "while", "do", "switch", "case", "default", "break",
    "continue", "goto", "int", "char", "short", "long", "void", "_Bool", "float", "double",
    "struct", "union", "enum", "typedef", "static", "extern", "const", "volatile", "signed",
    "unsigned", "sizeof", "_Alignof",
];

// Longest-match order matters: three-byte first, then two-byte.
const PUNCT3: &[&str] = &["<<=", ">>=", "..."];
const PUNCT2: &[&str] = &[
    "==", "!=", "<=", ">=", "->", "+=", "-=", "*=", "/=", "++", "--", "%=", "&=", "|=", "^=",
    "&&", "||", "<<", ">>", "##",
];

/// Read a file (or stdin for `-`) and tokenize it. `file_no` feeds the
/// assembler's `.file`/`.loc` directives.
pub fn tokenize_file(path: &str, file_no: usize) -> Result<Vec<Token>> {
    let raw = read_file(path)?;
    tokenize_source(path, &raw, file_no)
}

/// Tokenize in-memory source text under a display name, applying the
/// same canonicalisation passes as file input.
pub fn tokenize_source(name: &str, source: &str, file_no: usize) -> Result<Vec<Token>> {
    let contents = convert_universal_chars(&splice_lines(&canonicalize(source)))?;
    tokenize(Rc::new(SourceFile::new(name, file_no, contents)))
}

fn read_file(path: &str) -> Result<String> {
    let mut buf = Vec::new();
    if path == "-" {
        // By convention, read from stdin if a given filename is "-".
        std::io::stdin().read_to_end(&mut buf)?;
    } else {
        buf = std::fs::read(path)
            .map_err(|e| CompileError::plain(format!("cannot open {}: {}", path, e)))?;
    }
    Ok(String::from_utf8_lossy(&buf).into_owned())
}

/// Reduce any line ending to `\n` and guarantee a final newline.
fn canonicalize(s: &str) -> String {
    let mut out = String::with_capacity(s.len() + 1);
    let mut chars = s.chars().peekable();
    while let Some(c) = chars.next() {
        if c == '\r' {
            if chars.peek() == Some(&'\n') {
                chars.next();
            }
            out.push('\n');
        } else {
            out.push(c);
        }
    }
    if !out.ends_with('\n') {
        out.push('\n');
    }
    out
}

/// Splice backslash-newline pairs. Removed newlines are re-emitted after
/// the logical line so that line numbers stay in sync with the original.
fn splice_lines(s: &str) -> String {
    let bytes = s.as_bytes();
    let mut out: Vec<u8> = Vec::with_capacity(bytes.len());
    let mut pending = 0usize;
    let mut i = 0;
    while i < bytes.len() {
        if bytes[i] == b'\\' && i + 1 < bytes.len() && bytes[i + 1] == b'\n' {
            pending += 1;
            i += 2;
        } else if bytes[i] == b'\n' {
            out.push(b'\n');
            for _ in 0..pending {
                out.push(b'\n');
            }
            pending = 0;
            i += 1;
        } else {
            out.push(bytes[i]);
            i += 1;
        }
    }
    for _ in 0..pending {
        out.push(b'\n');
    }
    String::from_utf8_lossy(&out).into_owned()
}

/// Replace `\uXXXX` and `\UXXXXXXXX` with the UTF-8 encoding of the code
/// point. Other escape sequences pass through untouched.
fn convert_universal_chars(s: &str) -> Result<String> {
    let bytes = s.as_bytes();
    let mut out: Vec<u8> = Vec::with_capacity(bytes.len());
    let mut i = 0;
    while i < bytes.len() {
        if bytes[i] == b'\\' && i + 1 < bytes.len() && (bytes[i + 1] == b'u' || bytes[i + 1] == b'U')
        {
            let ndigits = if bytes[i + 1] == b'u' { 4 } else { 8 };
            let mut cp: u32 = 0;
            let mut ok = i + 2 + ndigits <= bytes.len();
            if ok {
                for k in 0..ndigits {
                    match (bytes[i + 2 + k] as char).to_digit(16) {
                        Some(d) => cp = cp * 16 + d,
                        None => {
                            ok = false;
                            break;
                        }
                    }
                }
            }
            let c = if ok { char::from_u32(cp) } else { None };
            match c {
                Some(c) => {
                    let mut buf = [0u8; 4];
                    out.extend_from_slice(c.encode_utf8(&mut buf).as_bytes());
                }
                None => return Err(CompileError::plain("invalid universal character")),
            }
            i += 2 + ndigits;
        } else if bytes[i] == b'\\' && i + 1 < bytes.len() {
            // Keep ordinary escapes (including \\) opaque so a "\\u" pair
            // is not misread as a universal character name.
            out.push(b'\\');
            out.push(bytes[i + 1]);
            i += 2;
        } else {
            out.push(bytes[i]);
            i += 1;
        }
    }
    Ok(String::from_utf8_lossy(&out).into_owned())
}

fn is_ident_start(b: u8) -> bool {
    b.is_ascii_alphabetic() || b == b'_' || b >= 0x80
}

fn is_ident_cont(b: u8) -> bool {
    is_ident_start(b) || b.is_ascii_digit()
}

/// Cut one file into a token vector terminated by an EOF token.
pub fn tokenize(file: Rc<SourceFile>) -> Result<Vec<Token>> {
    let src = file.contents.clone();
    let bytes = src.as_bytes();
    let mut toks: Vec<Token> = Vec::new();
    let mut pos = 0usize;
    let mut at_bol = true;
    let mut has_space = false;

    macro_rules! push {
        ($kind:expr, $start:expr, $end:expr) => {{
            let mut t = Token::new($kind, file.clone(), $start, &src[$start..$end]);
            t.at_bol = at_bol;
            t.has_space = has_space;
            toks.push(t);
            at_bol = false;
            has_space = false;
        }};
    }

    while pos < bytes.len() {
        let b = bytes[pos];

        // Line comments.
        if bytes[pos..].starts_with(b"//") {
            pos += 2;
            while pos < bytes.len() && bytes[pos] != b'\n' {
                pos += 1;
            }
            has_space = true;
            continue;
        }

        // Block comments.
        if bytes[pos..].starts_with(b"/*") {
            match src[pos + 2..].find("*/") {
                Some(n) => pos += 2 + n + 2,
                None => {
                    return Err(CompileError::at(&file, pos, "unclosed block comment"));
                }
            }
            has_space = true;
            continue;
        }

        if b == b'\n' {
            at_bol = true;
            has_space = false;
            pos += 1;
            continue;
        }

        if b.is_ascii_whitespace() {
            has_space = true;
            pos += 1;
            continue;
        }

        // Numeric literals are lexed loosely as pp-numbers and decoded
        // after preprocessing.
        if b.is_ascii_digit() || (b == b'.' && pos + 1 < bytes.len() && bytes[pos + 1].is_ascii_digit())
        {
            let start = pos;
            pos += 1;
            while pos < bytes.len() {
                let c = bytes[pos];
                if (c == b'e' || c == b'E' || c == b'p' || c == b'P')
                    && pos + 1 < bytes.len()
                    && (bytes[pos + 1] == b'+' || bytes[pos + 1] == b'-')
                {
                    pos += 2;
                } else if c.is_ascii_alphanumeric() || c == b'.' {
                    pos += 1;
                } else {
                    break;
                }
            }
            push!(TokenKind::PpNum, start, pos);
            continue;
        }

        // String literals.
        if b == b'"' {
            let (contents, end) = read_string_literal(&file, bytes, pos)?;
            push!(TokenKind::Str(contents), pos, end);
            pos = end;
            continue;
        }

        // Character literals become int-typed numbers straight away.
        if b == b'\'' {
            let (val, end) = read_char_literal(&file, bytes, pos)?;
            push!(
                TokenKind::Num(NumLit::int(val as i64, Type::int())),
                pos,
                end
            );
            pos = end;
            continue;
        }

        // Identifiers; bytes with the high bit set allow UTF-8 names.
        if is_ident_start(b) {
            let start = pos;
            pos += 1;
            while pos < bytes.len() && is_ident_cont(bytes[pos]) {
                pos += 1;
            }
            push!(TokenKind::Ident, start, pos);
            continue;
        }

        // Punctuators, longest match first.
        if let Some(p) = PUNCT3
            .iter()
            .chain(PUNCT2.iter())
            .find(|p| src[pos..].starts_with(**p))
        {
            push!(TokenKind::Punct, pos, pos + p.len());
            pos += p.len();
            continue;
        }

        if b.is_ascii_punctuation() {
            push!(TokenKind::Punct, pos, pos + 1);
            pos += 1;
            continue;
        }

        return Err(CompileError::at(&file, pos, "invalid token"));
    }

    let mut eof = Token::new(TokenKind::Eof, file.clone(), bytes.len(), "");
    eof.at_bol = true;
    toks.push(eof);

    add_line_info(&file, &mut toks);
    Ok(toks)
}

/// Assign 1-based line numbers by a single sweep over the file.
fn add_line_info(file: &SourceFile, toks: &mut [Token]) {
    let mut line_no = 1;
    let mut it = toks.iter_mut().peekable();
    for (pos, b) in file.contents.bytes().enumerate() {
        while let Some(t) = it.peek_mut() {
            if t.loc == pos {
                t.line_no = line_no;
                it.next();
            } else {
                break;
            }
        }
        if b == b'\n' {
            line_no += 1;
        }
    }
    for t in it {
        t.line_no = line_no;
    }
}

fn read_escaped_char(file: &SourceFile, bytes: &[u8], mut p: usize) -> Result<(u8, usize)> {
    // Octal: up to three digits.
    if (b'0'..=b'7').contains(&bytes[p]) {
        let mut c = (bytes[p] - b'0') as u32;
        p += 1;
        for _ in 0..2 {
            if p < bytes.len() && (b'0'..=b'7').contains(&bytes[p]) {
                c = (c << 3) | (bytes[p] - b'0') as u32;
                p += 1;
            }
        }
        return Ok((c as u8, p));
    }

    // Hex: any number of digits, but the value must fit a byte.
    if bytes[p] == b'x' {
        p += 1;
        if p >= bytes.len() || !(bytes[p] as char).is_ascii_hexdigit() {
            return Err(CompileError::at(file, p, "invalid hex escape sequence"));
        }
        let mut c: u32 = 0;
        while p < bytes.len() && (bytes[p] as char).is_ascii_hexdigit() {
            c = (c << 4) | (bytes[p] as char).to_digit(16).unwrap();
            if c > 255 {
                return Err(CompileError::at(file, p, "hex escape sequence out of range"));
            }
            p += 1;
        }
        return Ok((c as u8, p));
    }

    let c = match bytes[p] {
        b'a' => 0x07,
        b'b' => 0x08,
        b't' => b'\t',
        b'n' => b'\n',
        b'v' => 0x0b,
        b'f' => 0x0c,
        b'r' => b'\r',
        b'e' => 27,
        other => other,
    };
    Ok((c, p + 1))
}

/// Decode a string literal starting at the opening quote. Returns the
/// decoded bytes (with a terminating NUL) and the position one past the
/// closing quote.
fn read_string_literal(file: &SourceFile, bytes: &[u8], start: usize) -> Result<(Vec<u8>, usize)> {
    let mut p = start + 1;
    let mut buf = Vec::new();
    loop {
        if p >= bytes.len() || bytes[p] == b'\n' {
            return Err(CompileError::at(file, start, "unclosed string literal"));
        }
        match bytes[p] {
            b'"' => break,
            b'\\' => {
                let (c, next) = read_escaped_char(file, bytes, p + 1)?;
                buf.push(c);
                p = next;
            }
            c => {
                buf.push(c);
                p += 1;
            }
        }
    }
    buf.push(0);
    Ok((buf, p + 1))
}

/// Decode a character literal; its value is an int.
fn read_char_literal(file: &SourceFile, bytes: &[u8], start: usize) -> Result<(u8, usize)> {
    let mut p = start + 1;
    if p >= bytes.len() || bytes[p] == b'\n' {
        return Err(CompileError::at(file, start, "unclosed char literal"));
    }
    let c = if bytes[p] == b'\\' {
        let (c, next) = read_escaped_char(file, bytes, p + 1)?;
        p = next;
        c
    } else {
        let c = bytes[p];
        p += 1;
        c
    };
    if p >= bytes.len() || bytes[p] != b'\'' {
        return Err(CompileError::at(file, p.min(bytes.len() - 1), "char literal too long"));
    }
    Ok((c, p + 1))
}

/// Post-preprocess conversion: identifiers that are reserved words become
/// keywords, and pp-numbers are decoded into typed numeric literals.
pub fn convert_pp_tokens(toks: &mut [Token]) -> Result<()> {
    for tok in toks.iter_mut() {
        if tok.is_ident() && KEYWORDS.contains(&tok.text.as_str()) {
            tok.kind = TokenKind::Keyword;
        } else if matches!(tok.kind, TokenKind::PpNum) {
            tok.kind = TokenKind::Num(convert_number(tok)?);
        }
    }
    Ok(())
}

fn convert_number(tok: &Token) -> Result<NumLit> {
    if let Some(lit) = convert_int(&tok.text) {
        return Ok(lit);
    }

    // Floating literal: an optional f/F (float) or l/L (long double,
    // treated as double) suffix around a host float parse.
    let s = &tok.text;
    let (body, ty) = match s.as_bytes().last() {
        Some(b'f') | Some(b'F') => (&s[..s.len() - 1], Type::float()),
        Some(b'l') | Some(b'L') => (&s[..s.len() - 1], Type::double()),
        _ => (s.as_str(), Type::double()),
    };
    match body.parse::<f64>() {
        Ok(v) => Ok(NumLit::float(v, ty)),
        Err(_) => Err(CompileError::at_token(tok, "invalid numeric constant")),
    }
}

/// Try to read an integer literal: base prefix, digits, and any
/// combination of u/U and l/L/ll/LL suffixes. Returns None when the
/// lexeme is not a valid integer (a floating literal, perhaps).
fn convert_int(s: &str) -> Option<NumLit> {
    let lower = s.to_ascii_lowercase();
    let (digits, base) = if lower.starts_with("0x") && s.len() > 2 {
        (&s[2..], 16)
    } else if lower.starts_with("0b") && s.len() > 2 {
        (&s[2..], 2)
    } else if s.starts_with('0') {
        (s, 8)
    } else {
        (s, 10)
    };

    let end = digits
        .bytes()
        .position(|b| !(b as char).is_digit(base))
        .unwrap_or(digits.len());
    if end == 0 {
        return None;
    }
    let val = u64::from_str_radix(&digits[..end], base).ok()?;

    // Suffix.
    let suffix = digits[end..].to_ascii_lowercase();
    let (has_l, has_u) = match suffix.as_str() {
        "" => (false, false),
        "u" => (false, true),
        "l" => (true, false),
        "ll" => (true, false),
        "ul" | "lu" | "ull" | "llu" => (true, true),
        _ => return None,
    };

    let fits_i32 = val <= i32::MAX as u64;
    let fits_u32 = val <= u32::MAX as u64;
    let fits_i64 = val <= i64::MAX as u64;

    let ty = if base == 10 {
        match (has_l, has_u) {
            (true, true) => Type::ulong(),
            (true, false) => Type::long(),
            (false, true) => {
                if fits_u32 {
                    Type::uint()
                } else {
                    Type::ulong()
                }
            }
            (false, false) => {
                if fits_i32 {
                    Type::int()
                } else {
                    Type::long()
                }
            }
        }
    } else {
        match (has_l, has_u) {
            (true, true) => Type::ulong(),
            (true, false) => {
                if fits_i64 {
                    Type::long()
                } else {
                    Type::ulong()
                }
            }
            (false, true) => {
                if fits_u32 {
                    Type::uint()
                } else {
                    Type::ulong()
                }
            }
            (false, false) => {
                if fits_i32 {
                    Type::int()
                } else if fits_u32 {
                    Type::uint()
                } else if fits_i64 {
                    Type::long()
                } else {
                    Type::ulong()
                }
            }
        }
    };

    Some(NumLit::int(val as i64, ty))
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::types::TypeKind;

    fn lex(src: &str) -> Vec<Token> {
        let file = Rc::new(SourceFile::new("t.c", 1, canonicalize(src)));
        let mut toks = tokenize(file).unwrap();
        convert_pp_tokens(&mut toks).unwrap();
        toks
    }

    fn texts(toks: &[Token]) -> Vec<&str> {
        toks.iter()
            .filter(|t| !t.is_eof())
            .map(|t| t.text.as_str())
            .collect()
    }

    #[test]
    fn test_basic_tokens() {
        let toks = lex("int main() { return 42; }");
        assert_eq!(
            texts(&toks),
            vec!["int", "main", "(", ")", "{", "return", "42", ";", "}"]
        );
        assert!(matches!(toks[0].kind, TokenKind::Keyword));
        assert!(matches!(toks[1].kind, TokenKind::Ident));
    }

    #[test]
    fn test_punctuator_longest_match() {
        let toks = lex("a <<= b >> c ... ## ->");
        assert_eq!(texts(&toks), vec!["a", "<<=", "b", ">>", "c", "...", "##", "->"]);
    }

    #[test]
    fn test_comments_are_skipped() {
        let toks = lex("a // line\nb /* block\nstill */ c");
        assert_eq!(texts(&toks), vec!["a", "b", "c"]);
        assert!(toks[1].at_bol);
        assert!(toks[2].has_space);
    }

    #[test]
    fn test_unclosed_block_comment_is_fatal() {
        let file = Rc::new(SourceFile::new("t.c", 1, "/* no end\n".to_string()));
        let err = tokenize(file).unwrap_err();
        assert!(err.to_string().contains("unclosed block comment"));
    }

    #[test]
    fn test_line_numbers() {
        let toks = lex("a\nb\n\nc\n");
        assert_eq!(toks[0].line_no, 1);
        assert_eq!(toks[1].line_no, 2);
        assert_eq!(toks[2].line_no, 4);
    }

    #[test]
    fn test_string_escapes() {
        let toks = lex(r#""h\ti\n\x41\101\e""#);
        match &toks[0].kind {
            TokenKind::Str(bytes) => {
                assert_eq!(bytes, &[b'h', b'\t', b'i', b'\n', b'A', b'A', 27, 0]);
            }
            k => panic!("expected string, got {:?}", k),
        }
    }

    #[test]
    fn test_unclosed_string_is_fatal() {
        let file = Rc::new(SourceFile::new("t.c", 1, "\"abc\n".to_string()));
        let err = tokenize(file).unwrap_err();
        assert!(err.to_string().contains("unclosed string literal"));
    }

    #[test]
    fn test_char_literal_is_int() {
        let toks = lex("'a' '\\n'");
        match &toks[0].kind {
            TokenKind::Num(lit) => {
                assert_eq!(lit.ival, 'a' as i64);
                assert_eq!(lit.ty.kind, TypeKind::Int);
            }
            k => panic!("expected num, got {:?}", k),
        }
        match &toks[1].kind {
            TokenKind::Num(lit) => assert_eq!(lit.ival, '\n' as i64),
            k => panic!("expected num, got {:?}", k),
        }
    }

    #[test]
    fn test_utf8_identifiers() {
        let toks = lex("int 変数 = 1;");
        assert_eq!(toks[1].text, "変数");
        assert!(toks[1].is_ident());
    }

    #[test]
    fn test_backslash_newline_splice_preserves_line_count() {
        let spliced = splice_lines("ab\\\ncd\nxy\n");
        assert_eq!(spliced, "abcd\n\nxy\n");
    }

    #[test]
    fn test_universal_char_names() {
        let out = convert_universal_chars("\\u0041\\U0001F600").unwrap();
        assert_eq!(out, "A😀");
    }

    #[test]
    fn test_int_literal_type_inference() {
        let cases: &[(&str, TypeKind, bool)] = &[
            ("1", TypeKind::Int, false),
            ("0x80000000", TypeKind::Int, true), // unsigned int
            ("2147483648", TypeKind::Long, false),
            ("0xFFFFFFFFFFFFFFFF", TypeKind::Long, true), // unsigned long
            ("10u", TypeKind::Int, true),
            ("10L", TypeKind::Long, false),
            ("10UL", TypeKind::Long, true),
        ];
        for (src, kind, unsigned) in cases {
            let lit = convert_int(src).unwrap_or_else(|| panic!("{} did not parse", src));
            assert_eq!(&lit.ty.kind, kind, "{}", src);
            assert_eq!(lit.ty.is_unsigned, *unsigned, "{}", src);
        }
    }

    #[test]
    fn test_int_literal_bases() {
        assert_eq!(convert_int("0x10").unwrap().ival, 16);
        assert_eq!(convert_int("0b101").unwrap().ival, 5);
        assert_eq!(convert_int("017").unwrap().ival, 15);
        assert_eq!(convert_int("0").unwrap().ival, 0);
    }

    #[test]
    fn test_float_literals() {
        let toks = lex("1.5 2e3 3.0f");
        for (i, (want, kind)) in [(1.5, TypeKind::Double), (2000.0, TypeKind::Double), (3.0, TypeKind::Float)]
            .iter()
            .enumerate()
        {
            match &toks[i].kind {
                TokenKind::Num(lit) => {
                    assert_eq!(lit.fval, *want);
                    assert_eq!(&lit.ty.kind, kind);
                }
                k => panic!("expected num, got {:?}", k),
            }
        }
    }

    #[test]
    fn test_invalid_token_is_fatal() {
        let file = Rc::new(SourceFile::new("t.c", 1, "int a = 1; \u{1}\n".to_string()));
        let err = tokenize(file).unwrap_err();
        let msg = err.to_string();
        assert!(msg.contains("invalid token"));
        assert!(msg.contains("t.c:1:"));
    }

    #[test]
    fn test_at_bol_and_has_space_flags() {
        let toks = lex("# define x\ny");
        assert!(toks[0].at_bol);
        assert!(!toks[1].at_bol);
        assert!(toks[1].has_space);
        assert!(toks[3].at_bol);
    }
}
