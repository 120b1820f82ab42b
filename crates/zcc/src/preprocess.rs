//! Preprocessor: token stream to token stream.
//!
//! Handles `#include`, `#define`/`#undef` (object-like and function-like
//! macros with `#` stringising and `##` pasting), the conditional family
//! (`#if`, `#ifdef`, `#ifndef`, `#elif`, `#else`, `#endif`), `#line`, and
//! `#error`. Macro recursion is prevented with per-token hidesets: a
//! macro name already present in a token's hideset is not expanded again
//! at that position.

use std::collections::{HashMap, VecDeque};
use std::path::{Path, PathBuf};
use std::rc::Rc;

use tracing::debug;

use crate::error::{CompileError, Result};
use crate::lexer;
use crate::token::{NumLit, SourceFile, Token, TokenKind};
use crate::types::Type;

const MAX_INCLUDE_DEPTH: usize = 200;

#[derive(Debug, Clone)]
enum Macro {
    Obj(Vec<Token>),
    Func {
        params: Vec<String>,
        body: Vec<Token>,
        is_variadic: bool,
    },
}

/// One entry per open `#if`/`#ifdef`/`#ifndef`.
struct CondIncl {
    /// Some branch of this conditional has been taken.
    included: bool,
    seen_else: bool,
}

/// `#line` adjustment for one file: a line delta plus an optional
/// substitute display name.
struct LineOverride {
    delta: i64,
    file: Option<Rc<SourceFile>>,
}

pub struct Preprocessor {
    macros: HashMap<String, Macro>,
    include_paths: Vec<PathBuf>,
    /// Every file opened, in `.file`-directive order.
    files: Vec<Rc<SourceFile>>,
    cond_stack: Vec<CondIncl>,
    include_depth: usize,
    line_overrides: HashMap<usize, LineOverride>,
}

impl Preprocessor {
    pub fn new(include_paths: Vec<PathBuf>) -> Self {
        let mut pp = Preprocessor {
            macros: HashMap::new(),
            include_paths,
            files: Vec::new(),
            cond_stack: Vec::new(),
            include_depth: 0,
            line_overrides: HashMap::new(),
        };
        pp.define_builtins();
        pp
    }

    /// All files opened during preprocessing, the main file first.
    pub fn files(&self) -> &[Rc<SourceFile>] {
        &self.files
    }

    fn define_builtins(&mut self) {
        self.define_obj_macro("__STDC__", "1");
        self.define_obj_macro("__x86_64__", "1");
        self.define_obj_macro("__LP64__", "1");
    }

    /// Define an object-like macro from source text.
    pub fn define_obj_macro(&mut self, name: &str, body: &str) {
        let file = Rc::new(SourceFile::new("<built-in>", 0, format!("{}\n", body)));
        let mut toks = lexer::tokenize(file).unwrap_or_default();
        toks.retain(|t| !t.is_eof());
        self.macros.insert(name.to_string(), Macro::Obj(toks));
    }

    /// Run the preprocessor over a whole translation unit.
    pub fn preprocess(&mut self, toks: Vec<Token>) -> Result<Vec<Token>> {
        if let Some(first) = toks.first() {
            self.files.push(first.file.clone());
        }

        let mut rest: VecDeque<Token> = toks.into();
        let mut out = Vec::new();

        while let Some(tok) = rest.pop_front() {
            if tok.is_eof() {
                if self.include_depth > 0 {
                    // End of an included file.
                    self.include_depth -= 1;
                    continue;
                }
                if !self.cond_stack.is_empty() {
                    return Err(CompileError::at_token(&tok, "unterminated conditional directive"));
                }
                out.push(self.finish(tok));
                break;
            }

            if tok.is_hash() {
                self.directive(&mut rest, &tok)?;
                continue;
            }

            if self.try_expand(&mut rest, &tok)? {
                continue;
            }

            out.push(self.finish(tok));
        }

        debug!(tokens = out.len(), files = self.files.len(), "preprocessed");
        Ok(out)
    }

    /// Apply any `#line` adjustment before a token leaves the stage.
    fn finish(&self, mut tok: Token) -> Token {
        if let Some(ov) = self.line_overrides.get(&tok.file.file_no) {
            tok.line_no = (tok.line_no as i64 + ov.delta).max(1) as usize;
            if let Some(file) = &ov.file {
                tok.file = file.clone();
            }
        }
        tok
    }

    fn adjusted_line(&self, tok: &Token) -> usize {
        self.finish(tok.clone()).line_no
    }

    fn display_name(&self, tok: &Token) -> String {
        self.finish(tok.clone()).file.name.clone()
    }

    // ------------------------------------------------------------------
    // Directives
    // ------------------------------------------------------------------

    /// Pop the remainder of the current logical line.
    fn read_line(rest: &mut VecDeque<Token>) -> Vec<Token> {
        let mut line = Vec::new();
        while let Some(front) = rest.front() {
            if front.at_bol || front.is_eof() {
                break;
            }
            line.push(rest.pop_front().unwrap());
        }
        line
    }

    fn directive(&mut self, rest: &mut VecDeque<Token>, hash: &Token) -> Result<()> {
        // The null directive: a lone `#`.
        let same_line = rest
            .front()
            .map(|t| !t.at_bol && !t.is_eof())
            .unwrap_or(false);
        if !same_line {
            return Ok(());
        }

        let name_tok = rest.pop_front().unwrap();
        let name = name_tok.text.clone();
        match name.as_str() {
            "include" => {
                let line = Self::read_line(rest);
                self.include(rest, hash, &line)
            }
            "define" => {
                let line = Self::read_line(rest);
                self.define(&name_tok, line)
            }
            "undef" => {
                let line = Self::read_line(rest);
                match line.first() {
                    Some(t) if t.is_ident() => {
                        self.macros.remove(&t.text);
                        Ok(())
                    }
                    _ => Err(CompileError::at_token(&name_tok, "macro name must be an identifier")),
                }
            }
            "if" => {
                let line = Self::read_line(rest);
                let val = self.eval_const_expr(&name_tok, line)?;
                self.cond_stack.push(CondIncl {
                    included: val != 0,
                    seen_else: false,
                });
                if val == 0 {
                    Self::skip_branch(rest, hash)?;
                }
                Ok(())
            }
            "ifdef" | "ifndef" => {
                let line = Self::read_line(rest);
                let defined = match line.first() {
                    Some(t) if t.is_ident() => self.macros.contains_key(&t.text),
                    _ => {
                        return Err(CompileError::at_token(
                            &name_tok,
                            "macro name must be an identifier",
                        ));
                    }
                };
                let included = if name == "ifdef" { defined } else { !defined };
                self.cond_stack.push(CondIncl {
                    included,
                    seen_else: false,
                });
                if !included {
                    Self::skip_branch(rest, hash)?;
                }
                Ok(())
            }
            "elif" => {
                let line = Self::read_line(rest);
                let (included, seen_else) = match self.cond_stack.last() {
                    Some(c) => (c.included, c.seen_else),
                    None => return Err(CompileError::at_token(&name_tok, "stray #elif")),
                };
                if seen_else {
                    return Err(CompileError::at_token(&name_tok, "#elif after #else"));
                }
                if included {
                    Self::skip_branch(rest, hash)?;
                } else {
                    let val = self.eval_const_expr(&name_tok, line)?;
                    if val != 0 {
                        self.cond_stack.last_mut().unwrap().included = true;
                    } else {
                        Self::skip_branch(rest, hash)?;
                    }
                }
                Ok(())
            }
            "else" => {
                let Some(top) = self.cond_stack.last_mut() else {
                    return Err(CompileError::at_token(&name_tok, "stray #else"));
                };
                if top.seen_else {
                    return Err(CompileError::at_token(&name_tok, "duplicate #else"));
                }
                top.seen_else = true;
                if top.included {
                    Self::skip_branch(rest, hash)?;
                } else {
                    top.included = true;
                }
                Ok(())
            }
            "endif" => {
                if self.cond_stack.pop().is_none() {
                    return Err(CompileError::at_token(&name_tok, "stray #endif"));
                }
                Ok(())
            }
            "line" => {
                let line = Self::read_line(rest);
                self.line_directive(&name_tok, &line)
            }
            "error" => {
                let line = Self::read_line(rest);
                let msg: Vec<&str> = line.iter().map(|t| t.text.as_str()).collect();
                Err(CompileError::at_token(
                    hash,
                    format!("#error: {}", msg.join(" ")),
                ))
            }
            _ => Err(CompileError::at_token(&name_tok, "invalid preprocessor directive")),
        }
    }

    /// Skip tokens of an inactive branch until the matching `#elif`,
    /// `#else`, or `#endif`, which is left in the stream for the main loop.
    fn skip_branch(rest: &mut VecDeque<Token>, hash: &Token) -> Result<()> {
        let mut depth = 0usize;
        loop {
            let Some(front) = rest.front() else {
                return Err(CompileError::at_token(hash, "unterminated conditional directive"));
            };
            if front.is_eof() {
                return Err(CompileError::at_token(hash, "unterminated conditional directive"));
            }
            if front.is_hash() {
                let name = rest.get(1).filter(|t| !t.at_bol && !t.is_eof());
                match name.map(|t| t.text.as_str()) {
                    Some("if") | Some("ifdef") | Some("ifndef") => depth += 1,
                    Some("elif") | Some("else") if depth == 0 => return Ok(()),
                    Some("endif") => {
                        if depth == 0 {
                            return Ok(());
                        }
                        depth -= 1;
                    }
                    _ => {}
                }
            }
            rest.pop_front();
        }
    }

    fn include(&mut self, rest: &mut VecDeque<Token>, hash: &Token, line: &[Token]) -> Result<()> {
        let Some(first) = line.first() else {
            return Err(CompileError::at_token(hash, "expected a filename"));
        };

        let (filename, is_quote) = match &first.kind {
            TokenKind::Str(_) => {
                let text = &first.text;
                (text[1..text.len() - 1].to_string(), true)
            }
            _ if first.is("<") => {
                let mut name = String::new();
                let mut closed = false;
                for t in &line[1..] {
                    if t.is(">") {
                        closed = true;
                        break;
                    }
                    name.push_str(&t.text);
                }
                if !closed {
                    return Err(CompileError::at_token(first, "expected '>'"));
                }
                (name, false)
            }
            _ => return Err(CompileError::at_token(first, "expected a filename")),
        };

        let path = self
            .search_include(&filename, is_quote, &first.file.name)
            .ok_or_else(|| {
                CompileError::at_token(first, format!("{}: file not found", filename))
            })?;

        self.include_depth += 1;
        if self.include_depth > MAX_INCLUDE_DEPTH {
            return Err(CompileError::at_token(hash, "#include nested too deeply"));
        }

        let file_no = self.files.len() + 1;
        let toks = lexer::tokenize_file(&path.to_string_lossy(), file_no)?;
        if let Some(t) = toks.first() {
            self.files.push(t.file.clone());
        }
        debug!(file = %path.display(), "included");

        // Keep the included file's EOF token as an include-depth marker.
        for t in toks.into_iter().rev() {
            rest.push_front(t);
        }
        Ok(())
    }

    fn search_include(&self, filename: &str, is_quote: bool, includer: &str) -> Option<PathBuf> {
        let want = Path::new(filename);
        if want.is_absolute() {
            return want.exists().then(|| want.to_path_buf());
        }
        if is_quote {
            let dir = Path::new(includer).parent().unwrap_or(Path::new("."));
            let candidate = dir.join(want);
            if candidate.exists() {
                return Some(candidate);
            }
        }
        for dir in &self.include_paths {
            let candidate = dir.join(want);
            if candidate.exists() {
                return Some(candidate);
            }
        }
        None
    }

    fn line_directive(&mut self, name_tok: &Token, line: &[Token]) -> Result<()> {
        let Some(num) = line.first() else {
            return Err(CompileError::at_token(name_tok, "invalid line marker"));
        };
        let new_line: i64 = num
            .text
            .parse()
            .map_err(|_| CompileError::at_token(num, "invalid line marker"))?;

        let file_no = name_tok.file.file_no;
        // The next physical line must report as `new_line`.
        let delta = new_line - (name_tok.line_no as i64 + 1);

        let file = match line.get(1) {
            Some(t) => match &t.kind {
                TokenKind::Str(_) => {
                    let name = t.text[1..t.text.len() - 1].to_string();
                    Some(Rc::new(SourceFile::new(
                        name,
                        file_no,
                        name_tok.file.contents.clone(),
                    )))
                }
                _ => return Err(CompileError::at_token(t, "filename expected")),
            },
            None => self
                .line_overrides
                .get(&file_no)
                .and_then(|ov| ov.file.clone()),
        };

        self.line_overrides.insert(file_no, LineOverride { delta, file });
        Ok(())
    }

    fn define(&mut self, name_tok: &Token, line: Vec<Token>) -> Result<()> {
        let Some(name) = line.first().filter(|t| t.is_ident()) else {
            return Err(CompileError::at_token(name_tok, "macro name must be an identifier"));
        };
        let name = name.text.clone();

        // A '(' immediately after the name (no whitespace) makes the macro
        // function-like.
        let is_func = line.get(1).map(|t| t.is("(") && !t.has_space).unwrap_or(false);
        if !is_func {
            self.macros.insert(name, Macro::Obj(line[1..].to_vec()));
            return Ok(());
        }

        let mut params = Vec::new();
        let mut is_variadic = false;
        let mut i = 2;
        if line.get(i).map(|t| t.is(")")).unwrap_or(false) {
            i += 1;
        } else {
            loop {
                let Some(t) = line.get(i) else {
                    return Err(CompileError::at_token(name_tok, "expected ')'"));
                };
                if t.is("...") {
                    is_variadic = true;
                    i += 1;
                } else if t.is_ident() {
                    params.push(t.text.clone());
                    i += 1;
                } else {
                    return Err(CompileError::at_token(t, "expected an identifier"));
                }
                let Some(t) = line.get(i) else {
                    return Err(CompileError::at_token(name_tok, "expected ')'"));
                };
                if t.is(")") {
                    i += 1;
                    break;
                }
                if !t.is(",") {
                    return Err(CompileError::at_token(t, "expected ',' or ')'"));
                }
                i += 1;
            }
        }

        self.macros.insert(
            name,
            Macro::Func {
                params,
                body: line[i..].to_vec(),
                is_variadic,
            },
        );
        Ok(())
    }

    // ------------------------------------------------------------------
    // Macro expansion
    // ------------------------------------------------------------------

    /// Expand `tok` if it names a macro, pushing the expansion back onto
    /// the stream. Returns false if the token is not an active macro use.
    fn try_expand(&mut self, rest: &mut VecDeque<Token>, tok: &Token) -> Result<bool> {
        if !tok.is_ident() || tok.hideset.contains(&tok.text) {
            return Ok(false);
        }

        // Dynamic built-ins.
        if tok.text == "__FILE__" {
            let name = self.display_name(tok);
            rest.push_front(make_str_token(tok, &name));
            return Ok(true);
        }
        if tok.text == "__LINE__" {
            let line = self.adjusted_line(tok);
            rest.push_front(make_num_token(tok, line as i64));
            return Ok(true);
        }

        let Some(mac) = self.macros.get(&tok.text).cloned() else {
            return Ok(false);
        };

        let mut expansion = match mac {
            Macro::Obj(body) => body,
            Macro::Func {
                params,
                body,
                is_variadic,
            } => {
                // A function-like macro name without '(' is an ordinary
                // identifier.
                if !rest.front().map(|t| t.is("(")).unwrap_or(false) {
                    return Ok(false);
                }
                rest.pop_front();
                let args = self.read_macro_args(rest, tok, params.len(), is_variadic)?;
                self.substitute(tok, &body, &params, &args, is_variadic)?
            }
        };

        for t in expansion.iter_mut() {
            t.hideset.insert(tok.text.clone());
            t.hideset.extend(tok.hideset.iter().cloned());
        }
        if let Some(first) = expansion.first_mut() {
            first.at_bol = tok.at_bol;
            first.has_space = tok.has_space;
        }
        for t in expansion.into_iter().rev() {
            rest.push_front(t);
        }
        Ok(true)
    }

    /// Read macro arguments after the opening paren. For a variadic macro
    /// everything past the named parameters (commas included) becomes one
    /// extra argument bound to `__VA_ARGS__`.
    fn read_macro_args(
        &mut self,
        rest: &mut VecDeque<Token>,
        name: &Token,
        nparams: usize,
        is_variadic: bool,
    ) -> Result<Vec<Vec<Token>>> {
        let mut args: Vec<Vec<Token>> = vec![Vec::new()];
        let mut depth = 0usize;
        loop {
            let Some(tok) = rest.pop_front() else {
                return Err(CompileError::at_token(name, "unterminated macro argument list"));
            };
            if tok.is_eof() {
                return Err(CompileError::at_token(name, "unterminated macro argument list"));
            }
            if tok.is("(") {
                depth += 1;
            } else if tok.is(")") {
                if depth == 0 {
                    break;
                }
                depth -= 1;
            } else if tok.is(",") && depth == 0 {
                // Commas past the named parameters belong to __VA_ARGS__.
                if !(is_variadic && args.len() > nparams) {
                    args.push(Vec::new());
                    continue;
                }
            }
            args.last_mut().unwrap().push(tok);
        }

        // `M()` on a zero-parameter macro reads as zero arguments.
        if nparams == 0 && !is_variadic && args.len() == 1 && args[0].is_empty() {
            args.clear();
        }
        if is_variadic && args.len() == nparams {
            args.push(Vec::new()); // empty __VA_ARGS__
        }

        let want = nparams + usize::from(is_variadic);
        if args.len() != want {
            return Err(CompileError::at_token(
                name,
                format!("macro expects {} argument(s), got {}", want, args.len()),
            ));
        }
        Ok(args)
    }

    /// Substitute parameters into a function-like macro body, evaluating
    /// `#` and `##` first.
    fn substitute(
        &mut self,
        call: &Token,
        body: &[Token],
        params: &[String],
        args: &[Vec<Token>],
        is_variadic: bool,
    ) -> Result<Vec<Token>> {
        let param_index = |t: &Token| -> Option<usize> {
            if !t.is_ident() {
                return None;
            }
            if is_variadic && t.text == "__VA_ARGS__" {
                return Some(params.len());
            }
            params.iter().position(|p| *p == t.text)
        };

        let mut out: Vec<Token> = Vec::new();
        let mut i = 0;
        while i < body.len() {
            let t = &body[i];

            // Stringise: `#param`.
            if t.is("#") {
                let Some(idx) = body.get(i + 1).and_then(param_index) else {
                    return Err(CompileError::at_token(
                        t,
                        "'#' is not followed by a macro parameter",
                    ));
                };
                out.push(stringize(t, &args[idx]));
                i += 2;
                continue;
            }

            // Paste: `lhs ## rhs`.
            if t.is("##") {
                if out.is_empty() || i + 1 >= body.len() {
                    return Err(CompileError::at_token(
                        t,
                        "'##' cannot appear at either end of a macro body",
                    ));
                }
                let rhs = &body[i + 1];
                let rhs_toks: Vec<Token> = match param_index(rhs) {
                    Some(idx) => args[idx].clone(),
                    None => vec![rhs.clone()],
                };
                if !rhs_toks.is_empty() {
                    let lhs = out.pop().unwrap();
                    out.push(paste(&lhs, &rhs_toks[0])?);
                    out.extend(rhs_toks[1..].iter().cloned());
                }
                i += 2;
                continue;
            }

            match param_index(t) {
                Some(idx) => {
                    // An argument adjacent to ## is substituted unexpanded.
                    let next_is_paste = body.get(i + 1).map(|n| n.is("##")).unwrap_or(false);
                    if next_is_paste {
                        out.extend(args[idx].iter().cloned());
                    } else {
                        out.extend(self.expand_all(args[idx].clone())?);
                    }
                }
                None => out.push(t.clone()),
            }
            i += 1;
        }

        // Give substituted tokens the call site's location for diagnostics.
        for t in out.iter_mut() {
            t.line_no = call.line_no;
        }
        Ok(out)
    }

    /// Fully expand a token sequence that contains no directives (macro
    /// arguments, `#if` expressions).
    fn expand_all(&mut self, toks: Vec<Token>) -> Result<Vec<Token>> {
        let mut rest: VecDeque<Token> = toks.into();
        let mut out = Vec::new();
        while let Some(tok) = rest.pop_front() {
            if self.try_expand(&mut rest, &tok)? {
                continue;
            }
            out.push(tok);
        }
        Ok(out)
    }

    // ------------------------------------------------------------------
    // #if expression evaluation
    // ------------------------------------------------------------------

    fn eval_const_expr(&mut self, directive: &Token, line: Vec<Token>) -> Result<i64> {
        if line.is_empty() {
            return Err(CompileError::at_token(directive, "expected an expression"));
        }

        // Resolve `defined(X)` / `defined X` before macro expansion.
        let mut resolved = Vec::new();
        let mut i = 0;
        while i < line.len() {
            let t = &line[i];
            if t.is_ident() && t.text == "defined" {
                let (name_tok, consumed) =
                    if line.get(i + 1).map(|t| t.is("(")).unwrap_or(false) {
                        let name = line.get(i + 2);
                        if !line.get(i + 3).map(|t| t.is(")")).unwrap_or(false) {
                            return Err(CompileError::at_token(t, "expected ')'"));
                        }
                        (name, 4)
                    } else {
                        (line.get(i + 1), 2)
                    };
                let Some(name_tok) = name_tok.filter(|t| t.is_ident()) else {
                    return Err(CompileError::at_token(t, "macro name must be an identifier"));
                };
                let val = i64::from(self.macros.contains_key(&name_tok.text));
                resolved.push(make_num_token(t, val));
                i += consumed;
            } else {
                resolved.push(t.clone());
                i += 1;
            }
        }

        // Expand macros; any identifier left over evaluates to 0.
        let mut toks = self.expand_all(resolved)?;
        for t in toks.iter_mut() {
            if t.is_ident() {
                *t = make_num_token(t, 0);
            } else if matches!(t.kind, TokenKind::PpNum) {
                // Decode numbers in place; the shared converter also turns
                // keywords, but these tokens are still pre-conversion.
                let mut one = [t.clone()];
                lexer::convert_pp_tokens(&mut one)?;
                *t = one[0].clone();
            }
        }

        let mut pos = 0;
        let val = cond_expr(directive, &toks, &mut pos)?;
        if pos != toks.len() {
            return Err(CompileError::at_token(&toks[pos], "extra token"));
        }
        Ok(val)
    }
}

// ----------------------------------------------------------------------
// Helper token constructors
// ----------------------------------------------------------------------

fn make_num_token(tmpl: &Token, val: i64) -> Token {
    let mut t = Token::new(
        TokenKind::Num(NumLit::int(val, Type::long())),
        tmpl.file.clone(),
        tmpl.loc,
        val.to_string(),
    );
    t.line_no = tmpl.line_no;
    t.has_space = tmpl.has_space;
    t.at_bol = tmpl.at_bol;
    t
}

fn make_str_token(tmpl: &Token, s: &str) -> Token {
    let mut bytes = s.as_bytes().to_vec();
    bytes.push(0);
    let text = format!("\"{}\"", s.replace('\\', "\\\\").replace('"', "\\\""));
    let mut t = Token::new(TokenKind::Str(bytes), tmpl.file.clone(), tmpl.loc, text);
    t.line_no = tmpl.line_no;
    t.has_space = tmpl.has_space;
    t.at_bol = tmpl.at_bol;
    t
}

/// The `#` operator: quote an argument's spelling.
fn stringize(tmpl: &Token, arg: &[Token]) -> Token {
    let mut s = String::new();
    for (i, t) in arg.iter().enumerate() {
        if i > 0 && t.has_space {
            s.push(' ');
        }
        s.push_str(&t.text);
    }
    make_str_token(tmpl, &s)
}

/// The `##` operator: concatenate two lexemes and re-lex the result,
/// which must form exactly one token.
fn paste(lhs: &Token, rhs: &Token) -> Result<Token> {
    let text = format!("{}{}", lhs.text, rhs.text);
    let file = Rc::new(SourceFile::new("<paste>", 0, format!("{}\n", text)));
    let mut toks = lexer::tokenize(file)
        .map_err(|_| CompileError::at_token(lhs, format!("pasting forms '{}', an invalid token", text)))?;
    toks.retain(|t| !t.is_eof());
    if toks.len() != 1 {
        return Err(CompileError::at_token(
            lhs,
            format!("pasting forms '{}', an invalid token", text),
        ));
    }
    let mut t = toks.remove(0);
    t.file = lhs.file.clone();
    t.loc = lhs.loc;
    t.line_no = lhs.line_no;
    t.has_space = lhs.has_space;
    Ok(t)
}

// ----------------------------------------------------------------------
// Constant-expression evaluator for #if / #elif
// ----------------------------------------------------------------------

fn eval_num(tok: &Token) -> Result<i64> {
    match &tok.kind {
        TokenKind::Num(lit) if lit.ty.is_integer() => Ok(lit.ival),
        TokenKind::Num(_) => Err(CompileError::at_token(
            tok,
            "floating constant in preprocessor expression",
        )),
        _ => Err(CompileError::at_token(tok, "expected an expression")),
    }
}

fn peek<'a>(toks: &'a [Token], pos: usize) -> Option<&'a Token> {
    toks.get(pos)
}

fn eat(toks: &[Token], pos: &mut usize, op: &str) -> bool {
    if peek(toks, *pos).map(|t| t.is(op)).unwrap_or(false) {
        *pos += 1;
        true
    } else {
        false
    }
}

fn cond_expr(d: &Token, toks: &[Token], pos: &mut usize) -> Result<i64> {
    let cond = logor_expr(d, toks, pos)?;
    if eat(toks, pos, "?") {
        let then = cond_expr(d, toks, pos)?;
        if !eat(toks, pos, ":") {
            return Err(CompileError::at_token(d, "expected ':'"));
        }
        let els = cond_expr(d, toks, pos)?;
        return Ok(if cond != 0 { then } else { els });
    }
    Ok(cond)
}

fn logor_expr(d: &Token, toks: &[Token], pos: &mut usize) -> Result<i64> {
    let mut val = logand_expr(d, toks, pos)?;
    while eat(toks, pos, "||") {
        let rhs = logand_expr(d, toks, pos)?;
        val = i64::from(val != 0 || rhs != 0);
    }
    Ok(val)
}

fn logand_expr(d: &Token, toks: &[Token], pos: &mut usize) -> Result<i64> {
    let mut val = bitor_expr(d, toks, pos)?;
    while eat(toks, pos, "&&") {
        let rhs = bitor_expr(d, toks, pos)?;
        val = i64::from(val != 0 && rhs != 0);
    }
    Ok(val)
}

fn bitor_expr(d: &Token, toks: &[Token], pos: &mut usize) -> Result<i64> {
    let mut val = bitxor_expr(d, toks, pos)?;
    while eat(toks, pos, "|") {
        val |= bitxor_expr(d, toks, pos)?;
    }
    Ok(val)
}

fn bitxor_expr(d: &Token, toks: &[Token], pos: &mut usize) -> Result<i64> {
    let mut val = bitand_expr(d, toks, pos)?;
    while eat(toks, pos, "^") {
        val ^= bitand_expr(d, toks, pos)?;
    }
    Ok(val)
}

fn bitand_expr(d: &Token, toks: &[Token], pos: &mut usize) -> Result<i64> {
    let mut val = equality_expr(d, toks, pos)?;
    while eat(toks, pos, "&") {
        val &= equality_expr(d, toks, pos)?;
    }
    Ok(val)
}

fn equality_expr(d: &Token, toks: &[Token], pos: &mut usize) -> Result<i64> {
    let mut val = relational_expr(d, toks, pos)?;
    loop {
        if eat(toks, pos, "==") {
            val = i64::from(val == relational_expr(d, toks, pos)?);
        } else if eat(toks, pos, "!=") {
            val = i64::from(val != relational_expr(d, toks, pos)?);
        } else {
            return Ok(val);
        }
    }
}

fn relational_expr(d: &Token, toks: &[Token], pos: &mut usize) -> Result<i64> {
    let mut val = shift_expr(d, toks, pos)?;
    loop {
        if eat(toks, pos, "<") {
            val = i64::from(val < shift_expr(d, toks, pos)?);
        } else if eat(toks, pos, "<=") {
            val = i64::from(val <= shift_expr(d, toks, pos)?);
        } else if eat(toks, pos, ">") {
            val = i64::from(val > shift_expr(d, toks, pos)?);
        } else if eat(toks, pos, ">=") {
            val = i64::from(val >= shift_expr(d, toks, pos)?);
        } else {
            return Ok(val);
        }
    }
}

fn shift_expr(d: &Token, toks: &[Token], pos: &mut usize) -> Result<i64> {
    let mut val = add_expr(d, toks, pos)?;
    loop {
        if eat(toks, pos, "<<") {
            val = val.wrapping_shl(add_expr(d, toks, pos)? as u32);
        } else if eat(toks, pos, ">>") {
            val = val.wrapping_shr(add_expr(d, toks, pos)? as u32);
        } else {
            return Ok(val);
        }
    }
}

fn add_expr(d: &Token, toks: &[Token], pos: &mut usize) -> Result<i64> {
    let mut val = mul_expr(d, toks, pos)?;
    loop {
        if eat(toks, pos, "+") {
            val = val.wrapping_add(mul_expr(d, toks, pos)?);
        } else if eat(toks, pos, "-") {
            val = val.wrapping_sub(mul_expr(d, toks, pos)?);
        } else {
            return Ok(val);
        }
    }
}

fn mul_expr(d: &Token, toks: &[Token], pos: &mut usize) -> Result<i64> {
    let mut val = unary_expr(d, toks, pos)?;
    loop {
        let op = if eat(toks, pos, "*") {
            '*'
        } else if eat(toks, pos, "/") {
            '/'
        } else if eat(toks, pos, "%") {
            '%'
        } else {
            return Ok(val);
        };
        let rhs = unary_expr(d, toks, pos)?;
        if op != '*' && rhs == 0 {
            return Err(CompileError::at_token(d, "division by zero in preprocessor expression"));
        }
        val = match op {
            '*' => val.wrapping_mul(rhs),
            '/' => val.wrapping_div(rhs),
            _ => val.wrapping_rem(rhs),
        };
    }
}

fn unary_expr(d: &Token, toks: &[Token], pos: &mut usize) -> Result<i64> {
    if eat(toks, pos, "+") {
        return unary_expr(d, toks, pos);
    }
    if eat(toks, pos, "-") {
        return Ok(unary_expr(d, toks, pos)?.wrapping_neg());
    }
    if eat(toks, pos, "!") {
        return Ok(i64::from(unary_expr(d, toks, pos)? == 0));
    }
    if eat(toks, pos, "~") {
        return Ok(!unary_expr(d, toks, pos)?);
    }
    primary_expr(d, toks, pos)
}

fn primary_expr(d: &Token, toks: &[Token], pos: &mut usize) -> Result<i64> {
    if eat(toks, pos, "(") {
        let val = cond_expr(d, toks, pos)?;
        if !eat(toks, pos, ")") {
            return Err(CompileError::at_token(d, "expected ')'"));
        }
        return Ok(val);
    }
    let Some(tok) = peek(toks, *pos) else {
        return Err(CompileError::at_token(d, "expected an expression"));
    };
    let val = eval_num(tok)?;
    *pos += 1;
    Ok(val)
}

// ----------------------------------------------------------------------
// -E output
// ----------------------------------------------------------------------

/// Render a preprocessed token stream back to text, preserving line
/// structure via the `at_bol`/`has_space` flags.
pub fn stringify(toks: &[Token]) -> String {
    let mut out = String::new();
    for tok in toks {
        if tok.is_eof() {
            break;
        }
        if tok.at_bol && !out.is_empty() {
            out.push('\n');
        } else if tok.has_space && !out.is_empty() {
            out.push(' ');
        }
        out.push_str(&tok.text);
    }
    out.push('\n');
    out
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::lexer::tokenize;

    fn pp(src: &str) -> Vec<Token> {
        pp_with(src, Vec::new())
    }

    fn pp_with(src: &str, include_paths: Vec<PathBuf>) -> Vec<Token> {
        try_pp(src, include_paths).unwrap()
    }

    fn try_pp(src: &str, include_paths: Vec<PathBuf>) -> Result<Vec<Token>> {
        let mut text = src.to_string();
        if !text.ends_with('\n') {
            text.push('\n');
        }
        let file = Rc::new(SourceFile::new("t.c", 1, text));
        let toks = tokenize(file)?;
        Preprocessor::new(include_paths).preprocess(toks)
    }

    fn texts(toks: &[Token]) -> Vec<&str> {
        toks.iter()
            .filter(|t| !t.is_eof())
            .map(|t| t.text.as_str())
            .collect()
    }

    #[test]
    fn test_object_macro() {
        let toks = pp("#define N 8\nint a = N;");
        assert_eq!(texts(&toks), vec!["int", "a", "=", "8", ";"]);
    }

    #[test]
    fn test_object_macro_multi_token_body() {
        let toks = pp("#define EXPR (1 + 2)\nEXPR");
        assert_eq!(texts(&toks), vec!["(", "1", "+", "2", ")"]);
    }

    #[test]
    fn test_function_macro() {
        let toks = pp("#define ADD(a, b) a + b\nADD(1, 2)");
        assert_eq!(texts(&toks), vec!["1", "+", "2"]);
    }

    #[test]
    fn test_function_macro_name_without_parens_is_plain() {
        let toks = pp("#define F(x) x\nint F;");
        assert_eq!(texts(&toks), vec!["int", "F", ";"]);
    }

    #[test]
    fn test_nested_macro_arguments_expand() {
        let toks = pp("#define TWICE(x) x x\n#define ONE 1\nTWICE(ONE)");
        assert_eq!(texts(&toks), vec!["1", "1"]);
    }

    #[test]
    fn test_hideset_stops_recursion() {
        let toks = pp("#define A A B\nA");
        assert_eq!(texts(&toks), vec!["A", "B"]);

        let toks = pp("#define X Y\n#define Y X\nX");
        assert_eq!(texts(&toks), vec!["X"]);
    }

    #[test]
    fn test_stringize() {
        let toks = pp("#define S(x) #x\nS(a + b)");
        assert_eq!(toks[0].text, "\"a + b\"");
        assert!(matches!(&toks[0].kind, TokenKind::Str(b) if b == b"a + b\0"));
    }

    #[test]
    fn test_paste() {
        let toks = pp("#define CAT(a, b) a ## b\nCAT(foo, bar)");
        assert_eq!(texts(&toks), vec!["foobar"]);
        assert!(toks[0].is_ident());
    }

    #[test]
    fn test_paste_numbers() {
        let toks = pp("#define CAT(a, b) a ## b\nCAT(1, 2)");
        assert_eq!(texts(&toks), vec!["12"]);
    }

    #[test]
    fn test_variadic_macro() {
        let toks = pp("#define CALL(f, ...) f(__VA_ARGS__)\nCALL(g, 1, 2)");
        assert_eq!(texts(&toks), vec!["g", "(", "1", ",", "2", ")"]);
    }

    #[test]
    fn test_undef() {
        let toks = pp("#define N 1\n#undef N\nN");
        assert_eq!(texts(&toks), vec!["N"]);
    }

    #[test]
    fn test_if_else() {
        let toks = pp("#if 0\nno\n#else\nyes\n#endif");
        assert_eq!(texts(&toks), vec!["yes"]);
    }

    #[test]
    fn test_if_arithmetic() {
        let toks = pp("#if 1 + 2 * 3 == 7\nok\n#endif");
        assert_eq!(texts(&toks), vec!["ok"]);
    }

    #[test]
    fn test_elif_chain() {
        let toks = pp("#if 0\na\n#elif 1\nb\n#elif 1\nc\n#else\nd\n#endif");
        assert_eq!(texts(&toks), vec!["b"]);
    }

    #[test]
    fn test_nested_conditionals_skip() {
        let toks = pp("#if 0\n#if 1\nx\n#endif\ny\n#else\nz\n#endif");
        assert_eq!(texts(&toks), vec!["z"]);
    }

    #[test]
    fn test_ifdef_ifndef() {
        let toks = pp("#define X\n#ifdef X\na\n#endif\n#ifndef X\nb\n#endif");
        assert_eq!(texts(&toks), vec!["a"]);
    }

    #[test]
    fn test_defined_operator() {
        let toks = pp("#define X 1\n#if defined(X) && defined X\nok\n#endif");
        assert_eq!(texts(&toks), vec!["ok"]);
    }

    #[test]
    fn test_unknown_identifier_is_zero() {
        let toks = pp("#if UNDEFINED_THING\nno\n#else\nyes\n#endif");
        assert_eq!(texts(&toks), vec!["yes"]);
    }

    #[test]
    fn test_error_directive() {
        let err = try_pp("#error bad things\n", Vec::new()).unwrap_err();
        assert!(err.to_string().contains("bad things"));
    }

    #[test]
    fn test_stray_endif() {
        let err = try_pp("#endif\n", Vec::new()).unwrap_err();
        assert!(err.to_string().contains("stray #endif"));
    }

    #[test]
    fn test_unterminated_conditional() {
        let err = try_pp("#if 1\nx\n", Vec::new()).unwrap_err();
        assert!(err.to_string().contains("unterminated conditional"));
    }

    #[test]
    fn test_line_directive() {
        let toks = pp("#line 100\nx");
        assert_eq!(toks[0].text, "x");
        assert_eq!(toks[0].line_no, 100);

        let toks = pp("#line 5 \"other.c\"\nx");
        assert_eq!(toks[0].line_no, 5);
        assert_eq!(toks[0].file.name, "other.c");
    }

    #[test]
    fn test_file_and_line_builtins() {
        let toks = pp("__FILE__\n__LINE__");
        assert_eq!(toks[0].text, "\"t.c\"");
        match &toks[1].kind {
            TokenKind::Num(lit) => assert_eq!(lit.ival, 2),
            k => panic!("expected num, got {:?}", k),
        }
    }

    #[test]
    fn test_include_search_path() {
        let dir = tempfile::tempdir().unwrap();
        std::fs::write(dir.path().join("defs.h"), "#define FROM_HEADER 42\n").unwrap();

        let toks = pp_with(
            "#include <defs.h>\nint x = FROM_HEADER;",
            vec![dir.path().to_path_buf()],
        );
        assert_eq!(texts(&toks), vec!["int", "x", "=", "42", ";"]);
    }

    #[test]
    fn test_include_quote_relative_and_missing() {
        let err = try_pp("#include \"missing.h\"\n", Vec::new()).unwrap_err();
        assert!(err.to_string().contains("file not found"));
    }

    #[test]
    fn test_null_directive() {
        let toks = pp("#\nint x;");
        assert_eq!(texts(&toks), vec!["int", "x", ";"]);
    }

    #[test]
    fn test_stringify_preserves_lines() {
        let toks = pp("#define N 3\nint a = N;\nint b;");
        assert_eq!(stringify(&toks), "int a = 3;\nint b;\n");
    }
}
