//! Recursive-descent parser producing a typed AST.
//!
//! The grammar is the classic C precedence ladder plus declarations with
//! `typedef`/`static`/`extern`, struct/union/enum, variadic functions,
//! and the GNU statement-expression extension. Types are resolved as
//! nodes are built (see [`crate::ast::add_type`]); pointer arithmetic is
//! scaled here so the code generator sees plain integer math.

use std::collections::HashMap;
use std::rc::Rc;

use tracing::debug;

use crate::ast::{
    BinaryOp, Function, Node, NodeKind, Program, Relocation, Var, VarRef, add_type, new_cast,
};
use crate::error::{CompileError, Result};
use crate::token::{Token, TokenKind};
use crate::types::{self, FuncParam, Member, StructDef, Type, TypeKind};

// Type-specifier counters. Each specifier keyword gets two bits so that
// illegal repetitions ("int int", "long long long") overflow into an
// unmatched combination.
const K_VOID: u32 = 1 << 0;
const K_BOOL: u32 = 1 << 2;
const K_CHAR: u32 = 1 << 4;
const K_SHORT: u32 = 1 << 6;
const K_INT: u32 = 1 << 8;
const K_LONG: u32 = 1 << 10;
const K_FLOAT: u32 = 1 << 12;
const K_DOUBLE: u32 = 1 << 14;
const K_OTHER: u32 = 1 << 16;
const K_SIGNED: u32 = 1 << 17;
const K_UNSIGNED: u32 = 1 << 18;

const TYPE_KEYWORDS: &[&str] = &[
    "void", "_Bool", "char", "short", "int", "long", "float", "double", "struct", "union",
    "enum", "typedef", "static", "extern", "const", "volatile", "signed", "unsigned",
];

#[derive(Debug, Default, Clone)]
struct VarAttr {
    is_typedef: bool,
    is_static: bool,
    is_extern: bool,
}

#[derive(Clone)]
enum ScopeEntry {
    Var(VarRef),
    Typedef(Rc<Type>),
    EnumConst(i64),
    Func(Rc<Type>),
}

#[derive(Default)]
struct Scope {
    vars: HashMap<String, ScopeEntry>,
    tags: HashMap<String, Rc<Type>>,
}

#[derive(Default)]
struct SwitchFrame {
    cases: Vec<(i64, usize)>,
    default_id: Option<usize>,
}

/// Result of folding a global initialiser: either a plain constant or an
/// address of a symbol plus an addend.
enum InitVal {
    Const(i64),
    Sym(String, i64),
}

pub struct Parser {
    toks: Vec<Token>,
    pos: usize,
    scopes: Vec<Scope>,
    globals: Vec<VarRef>,
    funcs: Vec<Function>,
    /// Locals (including temporaries) of the function being parsed.
    locals: Vec<VarRef>,
    current_return_ty: Option<Rc<Type>>,
    switch_stack: Vec<SwitchFrame>,
    label_seq: usize,
    anon_seq: usize,
}

impl Parser {
    /// Expects a keyword-converted token stream (see
    /// [`crate::lexer::convert_pp_tokens`]).
    pub fn new(toks: Vec<Token>) -> Self {
        Parser {
            toks,
            pos: 0,
            scopes: Vec::new(),
            globals: Vec::new(),
            funcs: Vec::new(),
            locals: Vec::new(),
            current_return_ty: None,
            switch_stack: Vec::new(),
            label_seq: 0,
            anon_seq: 0,
        }
    }

    // ------------------------------------------------------------------
    // Cursor helpers
    // ------------------------------------------------------------------

    fn peek(&self) -> &Token {
        &self.toks[self.pos.min(self.toks.len() - 1)]
    }

    fn peek_at(&self, idx: usize) -> &Token {
        &self.toks[idx.min(self.toks.len() - 1)]
    }

    fn advance(&mut self) -> Token {
        let tok = self.peek().clone();
        if !tok.is_eof() {
            self.pos += 1;
        }
        tok
    }

    fn is(&self, op: &str) -> bool {
        self.peek().is(op)
    }

    fn consume(&mut self, op: &str) -> bool {
        if self.is(op) {
            self.pos += 1;
            true
        } else {
            false
        }
    }

    /// Ensure the current token is `op` and step past it.
    fn skip(&mut self, op: &str) -> Result<Token> {
        if !self.is(op) {
            return Err(CompileError::at_token(
                self.peek(),
                format!("expected '{}'", op),
            ));
        }
        Ok(self.advance())
    }

    fn expect_ident(&mut self) -> Result<Token> {
        if !self.peek().is_ident() {
            return Err(CompileError::at_token(self.peek(), "expected an identifier"));
        }
        Ok(self.advance())
    }

    // ------------------------------------------------------------------
    // Scopes
    // ------------------------------------------------------------------

    fn enter_scope(&mut self) {
        self.scopes.push(Scope::default());
    }

    fn leave_scope(&mut self) {
        self.scopes.pop();
    }

    fn scope_insert(&mut self, name: String, entry: ScopeEntry) {
        self.scopes.last_mut().unwrap().vars.insert(name, entry);
    }

    fn find_entry(&self, name: &str) -> Option<ScopeEntry> {
        for scope in self.scopes.iter().rev() {
            if let Some(e) = scope.vars.get(name) {
                return Some(e.clone());
            }
        }
        None
    }

    fn find_tag(&self, name: &str) -> Option<Rc<Type>> {
        for scope in self.scopes.iter().rev() {
            if let Some(t) = scope.tags.get(name) {
                return Some(t.clone());
            }
        }
        None
    }

    fn find_tag_in_current(&self, name: &str) -> Option<Rc<Type>> {
        self.scopes.last().unwrap().tags.get(name).cloned()
    }

    fn register_tag(&mut self, name: String, ty: Rc<Type>) {
        self.scopes.last_mut().unwrap().tags.insert(name, ty);
    }

    fn find_typedef(&self, tok: &Token) -> Option<Rc<Type>> {
        if !tok.is_ident() {
            return None;
        }
        match self.find_entry(&tok.text) {
            Some(ScopeEntry::Typedef(ty)) => Some(ty),
            _ => None,
        }
    }

    fn find_func_type(&self, name: &str) -> Option<Rc<Type>> {
        match self.find_entry(name) {
            Some(ScopeEntry::Func(ty)) => Some(ty),
            _ => None,
        }
    }

    fn is_typename_at(&self, idx: usize) -> bool {
        let tok = self.peek_at(idx);
        TYPE_KEYWORDS.contains(&tok.text.as_str()) && matches!(tok.kind, TokenKind::Keyword)
            || self.find_typedef(tok).is_some()
    }

    fn next_label_id(&mut self) -> usize {
        self.label_seq += 1;
        self.label_seq
    }

    fn next_anon(&mut self) -> usize {
        self.anon_seq += 1;
        self.anon_seq
    }

    // ------------------------------------------------------------------
    // Variables
    // ------------------------------------------------------------------

    fn new_lvar(&mut self, name: String, ty: Rc<Type>, tok: &Token) -> Result<VarRef> {
        if self
            .scopes
            .last()
            .unwrap()
            .vars
            .contains_key(&name)
        {
            return Err(CompileError::at_token(
                tok,
                format!("redefinition of '{}'", name),
            ));
        }
        let var = Var::new_local(name.clone(), ty);
        self.locals.push(var.clone());
        self.scope_insert(name, ScopeEntry::Var(var.clone()));
        Ok(var)
    }

    /// A compiler temporary: lives in the frame, invisible to the program.
    fn new_anon_lvar(&mut self, ty: Rc<Type>) -> VarRef {
        let var = Var::new_local("", ty);
        self.locals.push(var.clone());
        var
    }

    fn new_string_literal(&mut self, bytes: Vec<u8>) -> VarRef {
        let name = format!(".L.str.{}", self.next_anon());
        let var = Var::new_global(name, types::array_of(Type::char_(), bytes.len()));
        {
            let mut v = var.borrow_mut();
            v.is_static = true;
            v.init_data = Some(bytes);
        }
        self.globals.push(var.clone());
        var
    }

    // ------------------------------------------------------------------
    // Program
    // ------------------------------------------------------------------

    pub fn parse(&mut self) -> Result<Program> {
        self.enter_scope();

        while !self.peek().is_eof() {
            let mut attr = VarAttr::default();
            let basety = self.declspec(Some(&mut attr))?;

            if attr.is_typedef {
                self.typedef_decl(basety)?;
                continue;
            }

            // A bare "struct S { ... };" or "enum E { ... };".
            if self.consume(";") {
                continue;
            }

            let save = self.pos;
            let (ty, _) = self.declarator(basety.clone())?;
            self.pos = save;

            if ty.is_func() {
                self.function(basety, &attr)?;
            } else {
                self.global_declaration(basety, &attr)?;
            }
        }

        self.leave_scope();
        debug!(
            globals = self.globals.len(),
            functions = self.funcs.len(),
            "parsed translation unit"
        );
        Ok(Program {
            globals: std::mem::take(&mut self.globals),
            funcs: std::mem::take(&mut self.funcs),
        })
    }

    fn typedef_decl(&mut self, basety: Rc<Type>) -> Result<()> {
        let mut first = true;
        while !self.consume(";") {
            if !first {
                self.skip(",")?;
            }
            first = false;
            let tok = self.peek().clone();
            let (ty, name) = self.declarator(basety.clone())?;
            let Some(name) = name else {
                return Err(CompileError::at_token(&tok, "typedef name omitted"));
            };
            self.scope_insert(name.text, ScopeEntry::Typedef(ty));
        }
        Ok(())
    }

    fn function(&mut self, basety: Rc<Type>, attr: &VarAttr) -> Result<()> {
        let (ty, name_tok) = self.declarator(basety)?;
        let Some(name_tok) = name_tok else {
            return Err(CompileError::at_token(self.peek(), "function name omitted"));
        };
        let name = name_tok.text.clone();

        let TypeKind::Func {
            return_ty,
            params,
            is_variadic,
        } = ty.kind.clone()
        else {
            unreachable!("function() called on a non-function declarator");
        };

        // Visible to subsequent code and to its own body (recursion).
        self.scopes[0]
            .vars
            .insert(name.clone(), ScopeEntry::Func(ty.clone()));

        if !self.is("{") {
            // Declaration only.
            self.skip(";")?;
            return Ok(());
        }

        if self.funcs.iter().any(|f| f.name == name) {
            return Err(CompileError::at_token(
                &name_tok,
                format!("redefinition of '{}'", name),
            ));
        }

        self.locals = Vec::new();
        self.current_return_ty = Some(return_ty);
        self.enter_scope();

        let mut param_vars = Vec::new();
        for p in &params {
            let Some(pname) = p.name.clone() else {
                return Err(CompileError::at_token(&name_tok, "parameter name omitted"));
            };
            param_vars.push(self.new_lvar(pname, p.ty.clone(), &name_tok)?);
        }

        let body = self.compound_stmt()?;
        self.leave_scope();

        let body = match body.kind {
            NodeKind::Block(items) => items,
            _ => unreachable!(),
        };
        self.funcs.push(Function {
            name,
            params: param_vars,
            body,
            locals: std::mem::take(&mut self.locals),
            stack_size: 0,
            is_static: attr.is_static,
            is_variadic,
        });
        Ok(())
    }

    fn global_declaration(&mut self, basety: Rc<Type>, attr: &VarAttr) -> Result<()> {
        let mut first = true;
        while !self.consume(";") {
            if !first {
                self.skip(",")?;
            }
            first = false;

            let tok = self.peek().clone();
            let (ty, name) = self.declarator(basety.clone())?;
            let Some(name_tok) = name else {
                return Err(CompileError::at_token(&tok, "expected a variable name"));
            };
            if ty.is_void() {
                return Err(CompileError::at_token(&name_tok, "variable declared void"));
            }

            let var = Var::new_global(name_tok.text.clone(), ty);
            {
                let mut v = var.borrow_mut();
                v.is_static = attr.is_static;
                v.is_extern = attr.is_extern;
            }
            self.globals.push(var.clone());
            self.scope_insert(name_tok.text.clone(), ScopeEntry::Var(var.clone()));

            if self.consume("=") {
                var.borrow_mut().is_extern = false;
                self.global_initializer(&var)?;
            }

            let v = var.borrow();
            if !v.is_extern && v.ty.size() == 0 {
                return Err(CompileError::at_token(
                    &name_tok,
                    "variable has incomplete type",
                ));
            }
        }
        Ok(())
    }

    // ------------------------------------------------------------------
    // Declaration specifiers and declarators
    // ------------------------------------------------------------------

    fn declspec(&mut self, mut attr: Option<&mut VarAttr>) -> Result<Rc<Type>> {
        let mut ty = Type::int();
        let mut counter: u32 = 0;
        let mut is_const = false;

        while self.is_typename_at(self.pos) {
            let tok = self.peek().clone();

            // Storage class specifiers.
            if tok.is("typedef") || tok.is("static") || tok.is("extern") {
                let Some(a) = attr.as_deref_mut() else {
                    return Err(CompileError::at_token(
                        &tok,
                        "storage class specifier is not allowed in this context",
                    ));
                };
                if tok.is("typedef") {
                    a.is_typedef = true;
                } else if tok.is("static") {
                    a.is_static = true;
                } else {
                    a.is_extern = true;
                }
                if a.is_typedef && (a.is_static || a.is_extern) {
                    return Err(CompileError::at_token(
                        &tok,
                        "typedef may not be used together with static or extern",
                    ));
                }
                self.advance();
                continue;
            }

            if self.consume("const") {
                is_const = true;
                continue;
            }
            // Accepted and ignored.
            if self.consume("volatile") {
                continue;
            }

            // User-defined types.
            if tok.is("struct") || tok.is("union") || tok.is("enum") || self.find_typedef(&tok).is_some()
            {
                if counter != 0 {
                    break;
                }
                if tok.is("struct") {
                    self.advance();
                    ty = self.struct_union_decl(false)?;
                } else if tok.is("union") {
                    self.advance();
                    ty = self.struct_union_decl(true)?;
                } else if tok.is("enum") {
                    self.advance();
                    ty = self.enum_specifier()?;
                } else {
                    ty = self.find_typedef(&tok).unwrap();
                    self.advance();
                }
                counter += K_OTHER;
                continue;
            }

            counter += match tok.text.as_str() {
                "void" => K_VOID,
                "_Bool" => K_BOOL,
                "char" => K_CHAR,
                "short" => K_SHORT,
                "int" => K_INT,
                "long" => K_LONG,
                "float" => K_FLOAT,
                "double" => K_DOUBLE,
                "signed" => K_SIGNED,
                "unsigned" => K_UNSIGNED,
                _ => unreachable!("unhandled type keyword {}", tok.text),
            };
            self.advance();

            let unsigned = counter & K_UNSIGNED != 0;
            ty = match counter & !(K_SIGNED | K_UNSIGNED) {
                0 => {
                    // Bare "signed" / "unsigned".
                    if unsigned { Type::uint() } else { Type::int() }
                }
                K_VOID => Type::void(),
                K_BOOL => Type::bool_(),
                K_CHAR => {
                    if unsigned { Type::uchar() } else { Type::char_() }
                }
                x if x == K_SHORT || x == K_SHORT + K_INT => {
                    if unsigned { Type::ushort() } else { Type::short() }
                }
                K_INT => {
                    if unsigned { Type::uint() } else { Type::int() }
                }
                x if x == K_LONG
                    || x == K_LONG + K_INT
                    || x == K_LONG + K_LONG
                    || x == K_LONG + K_LONG + K_INT =>
                {
                    if unsigned { Type::ulong() } else { Type::long() }
                }
                K_FLOAT => Type::float(),
                x if x == K_DOUBLE || x == K_LONG + K_DOUBLE => Type::double(),
                _ => return Err(CompileError::at_token(&tok, "invalid type")),
            };
        }

        if is_const {
            ty = types::const_of(&ty);
        }
        Ok(ty)
    }

    /// declarator = "*"* ("(" declarator ")" | ident?) type-suffix
    ///
    /// The name is optional so the same routine serves prototypes and
    /// abstract declarators (casts, sizeof).
    fn declarator(&mut self, mut ty: Rc<Type>) -> Result<(Rc<Type>, Option<Token>)> {
        while self.consume("*") {
            ty = types::pointer_to(ty);
            loop {
                if self.consume("const") {
                    ty = types::const_of(&ty);
                } else if self.consume("volatile") {
                    // ignored
                } else {
                    break;
                }
            }
        }

        // A parenthesised declarator, unless the parens open a parameter
        // list (next token is a typename or ")").
        if self.is("(")
            && !self.is_typename_at(self.pos + 1)
            && !self.peek_at(self.pos + 1).is(")")
        {
            let start = self.pos;
            self.advance();
            // First pass just finds the matching ")" and the suffix.
            self.declarator(Type::int())?;
            self.skip(")")?;
            let ty = self.type_suffix(ty)?;
            let end = self.pos;
            // Second pass parses the nested declarator against the
            // now-complete inner type.
            self.pos = start + 1;
            let result = self.declarator(ty)?;
            self.pos = end;
            return Ok(result);
        }

        let name = if self.peek().is_ident() {
            Some(self.advance())
        } else {
            None
        };
        let ty = self.type_suffix(ty)?;
        Ok((ty, name))
    }

    /// type-suffix = "(" func-params | "[" array-dims | ε
    fn type_suffix(&mut self, ty: Rc<Type>) -> Result<Rc<Type>> {
        if self.consume("(") {
            return self.func_params(ty);
        }

        if self.consume("[") {
            let len = if self.is("]") {
                0 // incomplete; completed by an initialiser or rejected
            } else {
                let tok = self.peek().clone();
                let n = self.const_expr()?;
                if n < 0 {
                    return Err(CompileError::at_token(&tok, "array size must be non-negative"));
                }
                n as usize
            };
            self.skip("]")?;
            let inner = self.type_suffix(ty)?;
            return Ok(types::array_of(inner, len));
        }

        Ok(ty)
    }

    fn func_params(&mut self, return_ty: Rc<Type>) -> Result<Rc<Type>> {
        if self.consume(")") {
            // Unspecified parameters; calls go unchecked.
            return Ok(types::func_type(return_ty, Vec::new(), false));
        }
        if self.is("void") && self.peek_at(self.pos + 1).is(")") {
            self.advance();
            self.advance();
            return Ok(types::func_type(return_ty, Vec::new(), false));
        }

        let mut params = Vec::new();
        let mut is_variadic = false;
        loop {
            if self.consume("...") {
                is_variadic = true;
                break;
            }
            let basety = self.declspec(None)?;
            let (pty, name) = self.declarator(basety)?;
            // Arrays and functions decay in parameter position.
            let pty = match &pty.kind {
                TypeKind::Array { base, .. } => types::pointer_to(base.clone()),
                TypeKind::Func { .. } => types::pointer_to(pty.clone()),
                _ => pty,
            };
            params.push(FuncParam {
                name: name.map(|t| t.text),
                ty: pty,
            });
            if !self.consume(",") {
                break;
            }
        }
        self.skip(")")?;
        Ok(types::func_type(return_ty, params, is_variadic))
    }

    /// An abstract type name, as in casts and sizeof.
    fn typename(&mut self) -> Result<Rc<Type>> {
        let basety = self.declspec(None)?;
        let tok = self.peek().clone();
        let (ty, name) = self.declarator(basety)?;
        if name.is_some() {
            return Err(CompileError::at_token(&tok, "expected a type"));
        }
        Ok(ty)
    }

    fn struct_union_decl(&mut self, is_union: bool) -> Result<Rc<Type>> {
        let tag = if self.peek().is_ident() {
            Some(self.advance())
        } else {
            None
        };

        if let Some(tag_tok) = &tag {
            if !self.is("{") {
                if let Some(ty) = self.find_tag(&tag_tok.text) {
                    return Ok(ty);
                }
                // Forward reference; completed if a body appears later.
                let ty = types::struct_type(StructDef::new(is_union));
                self.register_tag(tag_tok.text.clone(), ty.clone());
                return Ok(ty);
            }
        }

        self.skip("{")?;

        // Reuse an incomplete definition from this scope so that
        // pointers built against the forward declaration are completed.
        let def = tag
            .as_ref()
            .and_then(|t| self.find_tag_in_current(&t.text))
            .and_then(|ty| ty.struct_def().cloned())
            .filter(|d| !d.is_complete() && d.is_union == is_union)
            .unwrap_or_else(|| StructDef::new(is_union));
        let ty = types::struct_type(def.clone());
        if let Some(tag_tok) = &tag {
            self.register_tag(tag_tok.text.clone(), ty.clone());
        }

        let mut members = Vec::new();
        while !self.consume("}") {
            if self.peek().is_eof() {
                return Err(CompileError::at_token(self.peek(), "expected '}'"));
            }
            let basety = self.declspec(None)?;
            let mut first = true;
            while !self.consume(";") {
                if !first {
                    self.skip(",")?;
                }
                first = false;
                let tok = self.peek().clone();
                let (mty, name) = self.declarator(basety.clone())?;
                let Some(name) = name else {
                    return Err(CompileError::at_token(&tok, "expected a member name"));
                };
                if mty.is_struct() && mty.size() == 0 {
                    return Err(CompileError::at_token(&name, "member has incomplete type"));
                }
                members.push(Member {
                    name: name.text,
                    ty: mty,
                    offset: 0,
                });
            }
        }
        def.complete(members);
        Ok(ty)
    }

    fn enum_specifier(&mut self) -> Result<Rc<Type>> {
        let tag = if self.peek().is_ident() {
            Some(self.advance())
        } else {
            None
        };

        if let Some(tag_tok) = &tag {
            if !self.is("{") {
                let Some(ty) = self.find_tag(&tag_tok.text) else {
                    return Err(CompileError::at_token(tag_tok, "unknown enum type"));
                };
                if !matches!(ty.kind, TypeKind::Enum) {
                    return Err(CompileError::at_token(tag_tok, "not an enum tag"));
                }
                return Ok(ty);
            }
        }

        self.skip("{")?;
        let ty = Type::enum_();
        let mut val: i64 = 0;
        let mut first = true;
        while !self.consume("}") {
            if !first {
                self.skip(",")?;
                if self.consume("}") {
                    break;
                }
            }
            first = false;
            let name = self.expect_ident()?;
            if self.consume("=") {
                val = self.const_expr()?;
            }
            self.scope_insert(name.text, ScopeEntry::EnumConst(val));
            val += 1;
        }

        if let Some(tag_tok) = &tag {
            self.register_tag(tag_tok.text.clone(), ty.clone());
        }
        Ok(ty)
    }

    // ------------------------------------------------------------------
    // Local declarations and initialisers
    // ------------------------------------------------------------------

    fn declaration(&mut self, basety: Rc<Type>, attr: &VarAttr) -> Result<Node> {
        let start = self.peek().clone();
        let mut stmts = Vec::new();
        let mut first = true;

        while !self.is(";") {
            if !first {
                self.skip(",")?;
            }
            first = false;

            let tok = self.peek().clone();
            let (ty, name) = self.declarator(basety.clone())?;
            let Some(name_tok) = name else {
                return Err(CompileError::at_token(&tok, "expected a variable name"));
            };
            if ty.is_void() {
                return Err(CompileError::at_token(&name_tok, "variable declared void"));
            }

            if attr.is_extern {
                // Declaration of an object defined elsewhere.
                let var = Var::new_global(name_tok.text.clone(), ty.clone());
                var.borrow_mut().is_extern = true;
                self.globals.push(var.clone());
                self.scope_insert(name_tok.text.clone(), ScopeEntry::Var(var));
                continue;
            }

            if attr.is_static {
                // A function-local static lives in static storage under a
                // uniquified symbol.
                let unique = format!("{}.{}", name_tok.text, self.next_anon());
                let var = Var::new_global(unique, ty.clone());
                var.borrow_mut().is_static = true;
                self.globals.push(var.clone());
                self.scope_insert(name_tok.text.clone(), ScopeEntry::Var(var.clone()));
                if self.consume("=") {
                    self.global_initializer(&var)?;
                }
                continue;
            }

            let var = self.new_lvar(name_tok.text.clone(), ty.clone(), &name_tok)?;

            if self.consume("=") {
                let lhs = Node::with_ty(NodeKind::Var(var.clone()), ty.clone(), name_tok.clone());
                let rhs = self.assign()?;
                let mut node = Node::new(
                    NodeKind::Assign {
                        lhs: Box::new(lhs),
                        rhs: Box::new(rhs),
                    },
                    name_tok.clone(),
                );
                add_type(&mut node)?;
                stmts.push(Node::new(NodeKind::ExprStmt(Box::new(node)), name_tok.clone()));
            }

            if var.borrow().ty.size() == 0 {
                return Err(CompileError::at_token(
                    &name_tok,
                    "variable has incomplete type",
                ));
            }
        }
        self.advance(); // ";"
        Ok(Node::new(NodeKind::Block(stmts), start))
    }

    fn global_initializer(&mut self, var: &VarRef) -> Result<()> {
        let ty = var.borrow().ty.clone();

        // "char s[] = "...";" and friends.
        let is_char_array = ty.is_array() && ty.base().is_some_and(|b| b.size() == 1);
        if is_char_array && matches!(self.peek().kind, TokenKind::Str(_)) {
            let TokenKind::Str(data) = self.advance().kind else {
                unreachable!();
            };
            let base = ty.base().unwrap().clone();
            let declared = match ty.kind {
                TypeKind::Array { len, .. } => len,
                _ => unreachable!(),
            };
            let len = if declared == 0 { data.len() } else { declared };
            let mut buf = vec![0u8; len];
            let n = len.min(data.len());
            buf[..n].copy_from_slice(&data[..n]);
            let mut v = var.borrow_mut();
            v.ty = types::array_of(base, len);
            v.init_data = Some(buf);
            return Ok(());
        }

        // Brace initialiser for an array of scalars or pointers.
        if self.is("{") {
            return self.global_array_initializer(var);
        }

        // Scalar.
        let tok = self.peek().clone();
        let mut expr = self.assign()?;
        add_type(&mut expr)?;

        let size = ty.size();
        let mut v = var.borrow_mut();
        if ty.is_flonum() {
            let val = eval_double(&expr)?;
            v.init_data = Some(if size == 4 {
                (val as f32).to_le_bytes().to_vec()
            } else {
                val.to_le_bytes().to_vec()
            });
            return Ok(());
        }

        match eval_init(&expr)? {
            InitVal::Const(val) => {
                v.init_data = Some(val.to_le_bytes()[..size].to_vec());
            }
            InitVal::Sym(symbol, addend) => {
                if size != 8 {
                    return Err(CompileError::at_token(&tok, "invalid initializer"));
                }
                v.init_data = Some(vec![0; 8]);
                v.rels.push(Relocation {
                    offset: 0,
                    symbol,
                    addend,
                });
            }
        }
        Ok(())
    }

    fn global_array_initializer(&mut self, var: &VarRef) -> Result<()> {
        let ty = var.borrow().ty.clone();
        let brace = self.skip("{")?;
        let TypeKind::Array { base, len } = &ty.kind else {
            return Err(CompileError::at_token(&brace, "unsupported initializer"));
        };
        let elem_size = base.size();
        let mut data = Vec::new();
        let mut rels = Vec::new();
        let mut count = 0usize;

        while !self.consume("}") {
            if count > 0 {
                self.skip(",")?;
                if self.consume("}") {
                    break;
                }
            }
            let offset = count * elem_size;
            data.resize(offset + elem_size, 0);

            // A string literal initialising a char pointer element.
            if base.is_ptr() && matches!(self.peek().kind, TokenKind::Str(_)) {
                let TokenKind::Str(bytes) = self.advance().kind else {
                    unreachable!();
                };
                let svar = self.new_string_literal(bytes);
                let symbol = svar.borrow().name.clone();
                rels.push(Relocation {
                    offset,
                    symbol,
                    addend: 0,
                });
                count += 1;
                continue;
            }

            let tok = self.peek().clone();
            let mut expr = self.assign()?;
            add_type(&mut expr)?;
            if base.is_flonum() {
                let val = eval_double(&expr)?;
                let bytes = if elem_size == 4 {
                    (val as f32).to_le_bytes().to_vec()
                } else {
                    val.to_le_bytes().to_vec()
                };
                data[offset..offset + elem_size].copy_from_slice(&bytes);
            } else {
                match eval_init(&expr)? {
                    InitVal::Const(v) => {
                        data[offset..offset + elem_size]
                            .copy_from_slice(&v.to_le_bytes()[..elem_size]);
                    }
                    InitVal::Sym(symbol, addend) => {
                        if elem_size != 8 {
                            return Err(CompileError::at_token(&tok, "invalid initializer"));
                        }
                        rels.push(Relocation {
                            offset,
                            symbol,
                            addend,
                        });
                    }
                }
            }
            count += 1;
        }

        let final_len = if *len == 0 { count } else { *len };
        if count > final_len {
            return Err(CompileError::at_token(&brace, "too many initializers"));
        }
        data.resize(final_len * elem_size, 0);

        let mut v = var.borrow_mut();
        v.ty = types::array_of(base.clone(), final_len);
        v.init_data = Some(data);
        v.rels = rels;
        Ok(())
    }

    // ------------------------------------------------------------------
    // Statements
    // ------------------------------------------------------------------

    fn compound_stmt(&mut self) -> Result<Node> {
        let start = self.skip("{")?;
        self.enter_scope();

        let mut items = Vec::new();
        while !self.consume("}") {
            if self.peek().is_eof() {
                return Err(CompileError::at_token(self.peek(), "expected '}'"));
            }

            let is_label = self.peek().is_ident() && self.peek_at(self.pos + 1).is(":");
            let mut node = if self.is_typename_at(self.pos) && !is_label {
                let mut attr = VarAttr::default();
                let basety = self.declspec(Some(&mut attr))?;
                if attr.is_typedef {
                    self.typedef_decl(basety)?;
                    continue;
                }
                if self.consume(";") {
                    continue;
                }
                self.declaration(basety, &attr)?
            } else {
                self.stmt()?
            };
            add_type(&mut node)?;
            items.push(node);
        }

        self.leave_scope();
        Ok(Node::new(NodeKind::Block(items), start))
    }

    fn stmt(&mut self) -> Result<Node> {
        let tok = self.peek().clone();

        if tok.is("return") {
            self.advance();
            if self.consume(";") {
                return Ok(Node::new(NodeKind::Return(None), tok));
            }
            let mut expr = self.expr()?;
            add_type(&mut expr)?;
            let ret_ty = self
                .current_return_ty
                .clone()
                .unwrap_or_else(Type::int);
            if !ret_ty.is_void() && !ret_ty.is_struct() {
                expr = new_cast(expr, ret_ty);
            }
            self.skip(";")?;
            return Ok(Node::new(NodeKind::Return(Some(Box::new(expr))), tok));
        }

        if tok.is("if") {
            self.advance();
            self.skip("(")?;
            let cond = self.expr()?;
            self.skip(")")?;
            let then = self.stmt()?;
            let els = if self.consume("else") {
                Some(Box::new(self.stmt()?))
            } else {
                None
            };
            return Ok(Node::new(
                NodeKind::If {
                    cond: Box::new(cond),
                    then: Box::new(then),
                    els,
                },
                tok,
            ));
        }

        if tok.is("switch") {
            self.advance();
            self.skip("(")?;
            let mut cond = self.expr()?;
            add_type(&mut cond)?;
            if !cond.ty().is_integer() {
                return Err(CompileError::at_token(
                    &cond.tok,
                    "switch quantity is not an integer",
                ));
            }
            self.skip(")")?;

            self.switch_stack.push(SwitchFrame::default());
            let body = self.stmt()?;
            let frame = self.switch_stack.pop().unwrap();
            return Ok(Node::new(
                NodeKind::Switch {
                    cond: Box::new(cond),
                    body: Box::new(body),
                    cases: frame.cases,
                    default_id: frame.default_id,
                },
                tok,
            ));
        }

        if tok.is("case") {
            self.advance();
            let val = self.const_expr()?;
            self.skip(":")?;
            let id = self.next_label_id();
            match self.switch_stack.last_mut() {
                Some(frame) => frame.cases.push((val, id)),
                None => return Err(CompileError::at_token(&tok, "stray case")),
            }
            let body = self.stmt()?;
            return Ok(Node::new(
                NodeKind::Case {
                    id,
                    body: Box::new(body),
                },
                tok,
            ));
        }

        if tok.is("default") {
            self.advance();
            self.skip(":")?;
            let id = self.next_label_id();
            match self.switch_stack.last_mut() {
                Some(frame) => {
                    if frame.default_id.is_some() {
                        return Err(CompileError::at_token(&tok, "duplicate default label"));
                    }
                    frame.default_id = Some(id);
                }
                None => return Err(CompileError::at_token(&tok, "stray default")),
            }
            let body = self.stmt()?;
            return Ok(Node::new(
                NodeKind::Case {
                    id,
                    body: Box::new(body),
                },
                tok,
            ));
        }

        if tok.is("for") {
            self.advance();
            self.skip("(")?;
            self.enter_scope();

            let init = if self.consume(";") {
                None
            } else if self.is_typename_at(self.pos) {
                let mut attr = VarAttr::default();
                let basety = self.declspec(Some(&mut attr))?;
                Some(Box::new(self.declaration(basety, &attr)?))
            } else {
                Some(Box::new(self.expr_stmt()?))
            };

            let cond = if self.is(";") {
                None
            } else {
                let mut c = self.expr()?;
                add_type(&mut c)?;
                Some(Box::new(c))
            };
            self.skip(";")?;

            let inc = if self.is(")") {
                None
            } else {
                let inc_tok = self.peek().clone();
                let mut e = self.expr()?;
                add_type(&mut e)?;
                Some(Box::new(Node::new(NodeKind::ExprStmt(Box::new(e)), inc_tok)))
            };
            self.skip(")")?;

            let body = self.stmt()?;
            self.leave_scope();
            return Ok(Node::new(
                NodeKind::For {
                    init,
                    cond,
                    inc,
                    body: Box::new(body),
                },
                tok,
            ));
        }

        if tok.is("while") {
            self.advance();
            self.skip("(")?;
            let mut cond = self.expr()?;
            add_type(&mut cond)?;
            self.skip(")")?;
            let body = self.stmt()?;
            return Ok(Node::new(
                NodeKind::For {
                    init: None,
                    cond: Some(Box::new(cond)),
                    inc: None,
                    body: Box::new(body),
                },
                tok,
            ));
        }

        if tok.is("do") {
            self.advance();
            let body = self.stmt()?;
            self.skip("while")?;
            self.skip("(")?;
            let mut cond = self.expr()?;
            add_type(&mut cond)?;
            self.skip(")")?;
            self.skip(";")?;
            return Ok(Node::new(
                NodeKind::Do {
                    body: Box::new(body),
                    cond: Box::new(cond),
                },
                tok,
            ));
        }

        if tok.is("goto") {
            self.advance();
            let label = self.expect_ident()?;
            self.skip(";")?;
            return Ok(Node::new(NodeKind::Goto(label.text), tok));
        }

        if tok.is("break") {
            self.advance();
            self.skip(";")?;
            return Ok(Node::new(NodeKind::Break, tok));
        }

        if tok.is("continue") {
            self.advance();
            self.skip(";")?;
            return Ok(Node::new(NodeKind::Continue, tok));
        }

        if tok.is("{") {
            return self.compound_stmt();
        }

        // Labelled statement.
        if tok.is_ident() && self.peek_at(self.pos + 1).is(":") {
            self.advance();
            self.advance();
            let body = self.stmt()?;
            return Ok(Node::new(
                NodeKind::Label {
                    name: tok.text.clone(),
                    body: Box::new(body),
                },
                tok,
            ));
        }

        self.expr_stmt()
    }

    fn expr_stmt(&mut self) -> Result<Node> {
        let tok = self.peek().clone();
        if self.consume(";") {
            // Null statement.
            return Ok(Node::new(NodeKind::Block(Vec::new()), tok));
        }
        let mut expr = self.expr()?;
        add_type(&mut expr)?;
        self.skip(";")?;
        Ok(Node::new(NodeKind::ExprStmt(Box::new(expr)), tok))
    }

    // ------------------------------------------------------------------
    // Expressions
    // ------------------------------------------------------------------

    fn expr(&mut self) -> Result<Node> {
        let mut node = self.assign()?;
        while self.is(",") {
            let tok = self.advance();
            let rhs = self.assign()?;
            let mut comma = Node::new(
                NodeKind::Comma {
                    lhs: Box::new(node),
                    rhs: Box::new(rhs),
                },
                tok,
            );
            add_type(&mut comma)?;
            node = comma;
        }
        Ok(node)
    }

    fn assign(&mut self) -> Result<Node> {
        let mut node = self.conditional()?;
        let tok = self.peek().clone();

        if self.consume("=") {
            let rhs = self.assign()?;
            let mut asn = Node::new(
                NodeKind::Assign {
                    lhs: Box::new(node),
                    rhs: Box::new(rhs),
                },
                tok,
            );
            add_type(&mut asn)?;
            return Ok(asn);
        }

        let compound: Option<BinaryOp> = match tok.text.as_str() {
            "+=" => Some(BinaryOp::Add),
            "-=" => Some(BinaryOp::Sub),
            "*=" => Some(BinaryOp::Mul),
            "/=" => Some(BinaryOp::Div),
            "%=" => Some(BinaryOp::Mod),
            "&=" => Some(BinaryOp::BitAnd),
            "|=" => Some(BinaryOp::BitOr),
            "^=" => Some(BinaryOp::BitXor),
            "<<=" => Some(BinaryOp::Shl),
            ">>=" => Some(BinaryOp::Shr),
            _ => None,
        };
        if let Some(op) = compound {
            self.advance();
            let rhs = self.assign()?;
            let binary = match op {
                BinaryOp::Add => self.new_add(node, rhs, tok.clone())?,
                BinaryOp::Sub => self.new_sub(node, rhs, tok.clone())?,
                _ => {
                    let mut b = Node::new(
                        NodeKind::Binary {
                            op,
                            lhs: Box::new(node),
                            rhs: Box::new(rhs),
                        },
                        tok.clone(),
                    );
                    add_type(&mut b)?;
                    b
                }
            };
            return self.to_assign(binary);
        }

        Ok(node)
    }

    /// Desugar `A op= B` into `tmp = &A, *tmp = *tmp op B` so that A is
    /// evaluated exactly once.
    fn to_assign(&mut self, binary: Node) -> Result<Node> {
        let tok = binary.tok.clone();
        let NodeKind::Binary { op, lhs, rhs } = binary.kind else {
            unreachable!("to_assign on a non-binary node");
        };

        // The type pass may have wrapped A in a promotion cast; the
        // address is taken of the bare lvalue, and the conversion is
        // re-applied to the loaded value instead.
        let (lhs, conv_ty) = match lhs.kind {
            NodeKind::Cast(inner) => {
                let ty = lhs.ty.clone();
                (inner, ty)
            }
            _ => (lhs, None),
        };

        let ptr_ty = types::pointer_to(lhs.ty().clone());
        let tmp = self.new_anon_lvar(ptr_ty.clone());

        // tmp = &A
        let mut expr1 = Node::new(
            NodeKind::Assign {
                lhs: Box::new(Node::with_ty(
                    NodeKind::Var(tmp.clone()),
                    ptr_ty.clone(),
                    tok.clone(),
                )),
                rhs: Box::new(Node::new(NodeKind::Addr(lhs), tok.clone())),
            },
            tok.clone(),
        );
        add_type(&mut expr1)?;

        // *tmp = *tmp op B
        let mut lhs_deref = Node::new(
            NodeKind::Deref(Box::new(Node::with_ty(
                NodeKind::Var(tmp.clone()),
                ptr_ty.clone(),
                tok.clone(),
            ))),
            tok.clone(),
        );
        add_type(&mut lhs_deref)?;
        let mut rhs_deref = Node::new(
            NodeKind::Deref(Box::new(Node::with_ty(
                NodeKind::Var(tmp.clone()),
                ptr_ty.clone(),
                tok.clone(),
            ))),
            tok.clone(),
        );
        add_type(&mut rhs_deref)?;
        if let Some(ty) = conv_ty {
            rhs_deref = new_cast(rhs_deref, ty);
        }

        let mut op_node = Node::new(
            NodeKind::Binary {
                op,
                lhs: Box::new(rhs_deref),
                rhs,
            },
            tok.clone(),
        );
        add_type(&mut op_node)?;

        let mut expr2 = Node::new(
            NodeKind::Assign {
                lhs: Box::new(lhs_deref),
                rhs: Box::new(op_node),
            },
            tok.clone(),
        );
        add_type(&mut expr2)?;

        let mut node = Node::new(
            NodeKind::Comma {
                lhs: Box::new(expr1),
                rhs: Box::new(expr2),
            },
            tok,
        );
        add_type(&mut node)?;
        Ok(node)
    }

    fn conditional(&mut self) -> Result<Node> {
        let cond = self.logor()?;
        if !self.is("?") {
            return Ok(cond);
        }
        let tok = self.advance();
        let then = self.expr()?;
        self.skip(":")?;
        let els = self.conditional()?;
        let mut node = Node::new(
            NodeKind::Cond {
                cond: Box::new(cond),
                then: Box::new(then),
                els: Box::new(els),
            },
            tok,
        );
        add_type(&mut node)?;
        Ok(node)
    }

    fn logor(&mut self) -> Result<Node> {
        let mut node = self.logand()?;
        while self.is("||") {
            let tok = self.advance();
            let rhs = self.logand()?;
            let mut n = Node::new(
                NodeKind::LogOr {
                    lhs: Box::new(node),
                    rhs: Box::new(rhs),
                },
                tok,
            );
            add_type(&mut n)?;
            node = n;
        }
        Ok(node)
    }

    fn logand(&mut self) -> Result<Node> {
        let mut node = self.bitor()?;
        while self.is("&&") {
            let tok = self.advance();
            let rhs = self.bitor()?;
            let mut n = Node::new(
                NodeKind::LogAnd {
                    lhs: Box::new(node),
                    rhs: Box::new(rhs),
                },
                tok,
            );
            add_type(&mut n)?;
            node = n;
        }
        Ok(node)
    }

    fn new_binary(&mut self, op: BinaryOp, lhs: Node, rhs: Node, tok: Token) -> Result<Node> {
        let mut node = Node::new(
            NodeKind::Binary {
                op,
                lhs: Box::new(lhs),
                rhs: Box::new(rhs),
            },
            tok,
        );
        add_type(&mut node)?;
        Ok(node)
    }

    fn bitor(&mut self) -> Result<Node> {
        let mut node = self.bitxor()?;
        while self.is("|") {
            let tok = self.advance();
            let rhs = self.bitxor()?;
            node = self.new_binary(BinaryOp::BitOr, node, rhs, tok)?;
        }
        Ok(node)
    }

    fn bitxor(&mut self) -> Result<Node> {
        let mut node = self.bitand()?;
        while self.is("^") {
            let tok = self.advance();
            let rhs = self.bitand()?;
            node = self.new_binary(BinaryOp::BitXor, node, rhs, tok)?;
        }
        Ok(node)
    }

    fn bitand(&mut self) -> Result<Node> {
        let mut node = self.equality()?;
        while self.is("&") {
            let tok = self.advance();
            let rhs = self.equality()?;
            node = self.new_binary(BinaryOp::BitAnd, node, rhs, tok)?;
        }
        Ok(node)
    }

    fn equality(&mut self) -> Result<Node> {
        let mut node = self.relational()?;
        loop {
            let tok = self.peek().clone();
            if self.consume("==") {
                let rhs = self.relational()?;
                node = self.new_binary(BinaryOp::Eq, node, rhs, tok)?;
            } else if self.consume("!=") {
                let rhs = self.relational()?;
                node = self.new_binary(BinaryOp::Ne, node, rhs, tok)?;
            } else {
                return Ok(node);
            }
        }
    }

    fn relational(&mut self) -> Result<Node> {
        let mut node = self.shift()?;
        loop {
            let tok = self.peek().clone();
            if self.consume("<") {
                let rhs = self.shift()?;
                node = self.new_binary(BinaryOp::Lt, node, rhs, tok)?;
            } else if self.consume("<=") {
                let rhs = self.shift()?;
                node = self.new_binary(BinaryOp::Le, node, rhs, tok)?;
            } else if self.consume(">") {
                let rhs = self.shift()?;
                node = self.new_binary(BinaryOp::Lt, rhs, node, tok)?;
            } else if self.consume(">=") {
                let rhs = self.shift()?;
                node = self.new_binary(BinaryOp::Le, rhs, node, tok)?;
            } else {
                return Ok(node);
            }
        }
    }

    fn shift(&mut self) -> Result<Node> {
        let mut node = self.add()?;
        loop {
            let tok = self.peek().clone();
            if self.consume("<<") {
                let rhs = self.add()?;
                node = self.new_binary(BinaryOp::Shl, node, rhs, tok)?;
            } else if self.consume(">>") {
                let rhs = self.add()?;
                node = self.new_binary(BinaryOp::Shr, node, rhs, tok)?;
            } else {
                return Ok(node);
            }
        }
    }

    /// `+` with pointer scaling: ptr + n becomes ptr + n*sizeof(elem).
    fn new_add(&mut self, mut lhs: Node, mut rhs: Node, tok: Token) -> Result<Node> {
        add_type(&mut lhs)?;
        add_type(&mut rhs)?;

        if lhs.ty().is_numeric() && rhs.ty().is_numeric() {
            return self.new_binary(BinaryOp::Add, lhs, rhs, tok);
        }
        if lhs.ty().base().is_some() && rhs.ty().base().is_some() {
            return Err(CompileError::at_token(&tok, "invalid operands"));
        }
        // Canonicalise to pointer + integer.
        if lhs.ty().base().is_none() {
            std::mem::swap(&mut lhs, &mut rhs);
        }

        let size = lhs.ty().base().unwrap().size() as i64;
        let size_node = Node::with_ty(NodeKind::Num(size), Type::long(), tok.clone());
        let scaled = self.new_binary(BinaryOp::Mul, rhs, size_node, tok.clone())?;
        self.new_binary(BinaryOp::Add, lhs, scaled, tok)
    }

    /// `-` with pointer scaling; ptr - ptr yields the element count as a
    /// signed long.
    fn new_sub(&mut self, mut lhs: Node, mut rhs: Node, tok: Token) -> Result<Node> {
        add_type(&mut lhs)?;
        add_type(&mut rhs)?;

        if lhs.ty().is_numeric() && rhs.ty().is_numeric() {
            return self.new_binary(BinaryOp::Sub, lhs, rhs, tok);
        }

        // ptr - int
        if lhs.ty().base().is_some() && rhs.ty().is_integer() {
            let size = lhs.ty().base().unwrap().size() as i64;
            let size_node = Node::with_ty(NodeKind::Num(size), Type::long(), tok.clone());
            let scaled = self.new_binary(BinaryOp::Mul, rhs, size_node, tok.clone())?;
            return self.new_binary(BinaryOp::Sub, lhs, scaled, tok);
        }

        // ptr - ptr: number of elements between the two.
        if lhs.ty().base().is_some() && rhs.ty().base().is_some() {
            let size = lhs.ty().base().unwrap().size() as i64;
            let mut diff = self.new_binary(BinaryOp::Sub, lhs, rhs, tok.clone())?;
            diff.ty = Some(Type::long());
            let size_node = Node::with_ty(NodeKind::Num(size), Type::long(), tok.clone());
            return self.new_binary(BinaryOp::Div, diff, size_node, tok);
        }

        Err(CompileError::at_token(&tok, "invalid operands"))
    }

    fn add(&mut self) -> Result<Node> {
        let mut node = self.mul()?;
        loop {
            let tok = self.peek().clone();
            if self.consume("+") {
                let rhs = self.mul()?;
                node = self.new_add(node, rhs, tok)?;
            } else if self.consume("-") {
                let rhs = self.mul()?;
                node = self.new_sub(node, rhs, tok)?;
            } else {
                return Ok(node);
            }
        }
    }

    fn mul(&mut self) -> Result<Node> {
        let mut node = self.cast_expr()?;
        loop {
            let tok = self.peek().clone();
            if self.consume("*") {
                let rhs = self.cast_expr()?;
                node = self.new_binary(BinaryOp::Mul, node, rhs, tok)?;
            } else if self.consume("/") {
                let rhs = self.cast_expr()?;
                node = self.new_binary(BinaryOp::Div, node, rhs, tok)?;
            } else if self.consume("%") {
                let rhs = self.cast_expr()?;
                node = self.new_binary(BinaryOp::Mod, node, rhs, tok)?;
            } else {
                return Ok(node);
            }
        }
    }

    fn cast_expr(&mut self) -> Result<Node> {
        if self.is("(") && self.is_typename_at(self.pos + 1) {
            self.advance();
            let ty = self.typename()?;
            self.skip(")")?;
            let mut inner = self.cast_expr()?;
            add_type(&mut inner)?;
            return Ok(new_cast(inner, ty));
        }
        self.unary()
    }

    fn unary(&mut self) -> Result<Node> {
        let tok = self.peek().clone();

        if self.consume("+") {
            return self.cast_expr();
        }
        if self.consume("-") {
            let rhs = self.cast_expr()?;
            let zero = Node::with_ty(NodeKind::Num(0), Type::int(), tok.clone());
            return self.new_binary(BinaryOp::Sub, zero, rhs, tok);
        }
        if self.consume("&") {
            let mut operand = self.cast_expr()?;
            add_type(&mut operand)?;
            let mut node = Node::new(NodeKind::Addr(Box::new(operand)), tok);
            add_type(&mut node)?;
            return Ok(node);
        }
        if self.consume("*") {
            let mut operand = self.cast_expr()?;
            add_type(&mut operand)?;
            let mut node = Node::new(NodeKind::Deref(Box::new(operand)), tok);
            add_type(&mut node)?;
            return Ok(node);
        }
        if self.consume("!") {
            let mut operand = self.cast_expr()?;
            add_type(&mut operand)?;
            let mut node = Node::new(NodeKind::Not(Box::new(operand)), tok);
            add_type(&mut node)?;
            return Ok(node);
        }
        if self.consume("~") {
            let mut operand = self.cast_expr()?;
            add_type(&mut operand)?;
            let mut node = Node::new(NodeKind::BitNot(Box::new(operand)), tok);
            add_type(&mut node)?;
            return Ok(node);
        }
        if self.consume("++") {
            // ++i is i += 1
            let operand = self.unary()?;
            let one = Node::with_ty(NodeKind::Num(1), Type::int(), tok.clone());
            let sum = self.new_add(operand, one, tok)?;
            return self.to_assign(sum);
        }
        if self.consume("--") {
            let operand = self.unary()?;
            let one = Node::with_ty(NodeKind::Num(1), Type::int(), tok.clone());
            let diff = self.new_sub(operand, one, tok)?;
            return self.to_assign(diff);
        }

        if tok.is("sizeof") {
            self.advance();
            if self.is("(") && self.is_typename_at(self.pos + 1) {
                self.advance();
                let ty = self.typename()?;
                self.skip(")")?;
                return Ok(Node::with_ty(
                    NodeKind::Num(ty.size() as i64),
                    Type::ulong(),
                    tok,
                ));
            }
            let mut operand = self.unary()?;
            add_type(&mut operand)?;
            // No decay: sizeof an array expression is the whole array.
            return Ok(Node::with_ty(
                NodeKind::Num(operand.ty().size() as i64),
                Type::ulong(),
                tok,
            ));
        }

        if tok.is("_Alignof") {
            self.advance();
            self.skip("(")?;
            let ty = self.typename()?;
            self.skip(")")?;
            return Ok(Node::with_ty(
                NodeKind::Num(ty.align() as i64),
                Type::ulong(),
                tok,
            ));
        }

        self.postfix()
    }

    fn postfix(&mut self) -> Result<Node> {
        let mut node = self.primary()?;
        loop {
            let tok = self.peek().clone();
            if self.consume("[") {
                // a[i] is *(a + i)
                let idx = self.expr()?;
                self.skip("]")?;
                let sum = self.new_add(node, idx, tok.clone())?;
                let mut deref = Node::new(NodeKind::Deref(Box::new(sum)), tok);
                add_type(&mut deref)?;
                node = deref;
            } else if self.consume(".") {
                let name = self.expect_ident()?;
                node = self.struct_member(node, &name)?;
            } else if self.consume("->") {
                let name = self.expect_ident()?;
                let mut deref = Node::new(NodeKind::Deref(Box::new(node)), tok);
                add_type(&mut deref)?;
                node = self.struct_member(deref, &name)?;
            } else if self.consume("++") {
                node = self.new_inc_dec(node, tok, 1)?;
            } else if self.consume("--") {
                node = self.new_inc_dec(node, tok, -1)?;
            } else {
                return Ok(node);
            }
        }
    }

    /// Post-increment: `i++` is `(typeof i)((i += 1) - 1)`.
    fn new_inc_dec(&mut self, mut node: Node, tok: Token, addend: i64) -> Result<Node> {
        add_type(&mut node)?;
        let ty = node.ty().clone();
        let one = Node::with_ty(NodeKind::Num(addend), Type::int(), tok.clone());
        let sum = self.new_add(node, one, tok.clone())?;
        let assigned = self.to_assign(sum)?;
        let neg = Node::with_ty(NodeKind::Num(-addend), Type::int(), tok.clone());
        let adjusted = self.new_add(assigned, neg, tok)?;
        Ok(new_cast(adjusted, ty))
    }

    fn struct_member(&mut self, mut base: Node, name: &Token) -> Result<Node> {
        add_type(&mut base)?;
        let Some(def) = base.ty().struct_def().cloned() else {
            return Err(CompileError::at_token(name, "not a struct nor a union"));
        };
        let Some(member) = def.member(&name.text) else {
            return Err(CompileError::at_token(
                name,
                format!("no member named '{}'", name.text),
            ));
        };
        let mut node = Node::new(
            NodeKind::Member {
                base: Box::new(base),
                member,
            },
            name.clone(),
        );
        add_type(&mut node)?;
        Ok(node)
    }

    fn primary(&mut self) -> Result<Node> {
        let tok = self.peek().clone();

        // GNU statement expression: ({ stmt; ...; expr; })
        if tok.is("(") && self.peek_at(self.pos + 1).is("{") {
            self.advance();
            let body = self.compound_stmt()?;
            self.skip(")")?;
            let items = match body.kind {
                NodeKind::Block(items) => items,
                _ => unreachable!(),
            };
            let mut node = Node::new(NodeKind::StmtExpr(items), tok);
            add_type(&mut node)?;
            return Ok(node);
        }

        if self.consume("(") {
            let node = self.expr()?;
            self.skip(")")?;
            return Ok(node);
        }

        match &tok.kind {
            TokenKind::Num(lit) => {
                self.advance();
                if lit.ty.is_flonum() {
                    Ok(Node::with_ty(
                        NodeKind::FloatNum(lit.fval),
                        lit.ty.clone(),
                        tok,
                    ))
                } else {
                    Ok(Node::with_ty(NodeKind::Num(lit.ival), lit.ty.clone(), tok))
                }
            }
            TokenKind::Str(bytes) => {
                let bytes = bytes.clone();
                self.advance();
                let var = self.new_string_literal(bytes);
                let ty = var.borrow().ty.clone();
                Ok(Node::with_ty(NodeKind::Var(var), ty, tok))
            }
            TokenKind::Ident => {
                if self.peek_at(self.pos + 1).is("(") {
                    self.advance();
                    return self.funcall(tok);
                }
                self.advance();
                match self.find_entry(&tok.text) {
                    Some(ScopeEntry::Var(var)) => {
                        let ty = var.borrow().ty.clone();
                        Ok(Node::with_ty(NodeKind::Var(var), ty, tok))
                    }
                    Some(ScopeEntry::EnumConst(val)) => {
                        Ok(Node::with_ty(NodeKind::Num(val), Type::int(), tok))
                    }
                    Some(ScopeEntry::Func(_)) => Err(CompileError::at_token(
                        &tok,
                        "function name used as a value",
                    )),
                    Some(ScopeEntry::Typedef(_)) | None => Err(CompileError::at_token(
                        &tok,
                        format!("undefined variable '{}'", tok.text),
                    )),
                }
            }
            _ => Err(CompileError::at_token(&tok, "expected an expression")),
        }
    }

    fn funcall(&mut self, name_tok: Token) -> Result<Node> {
        self.skip("(")?;

        // The va_start builtin is an intrinsic, not a real call.
        if name_tok.text == "__builtin_va_start" {
            let mut ap = self.assign()?;
            add_type(&mut ap)?;
            if self.consume(",") {
                // The named-parameter argument is unused; the codegen
                // derives the save-area layout from the function itself.
                let mut last = self.assign()?;
                add_type(&mut last)?;
            }
            self.skip(")")?;
            return Ok(Node::with_ty(
                NodeKind::VaStart { ap: Box::new(ap) },
                Type::void(),
                name_tok,
            ));
        }

        let fty = self.find_func_type(&name_tok.text);
        let (ret_ty, param_tys) = match fty.as_ref().map(|t| &t.kind) {
            Some(TypeKind::Func {
                return_ty, params, ..
            }) => (return_ty.clone(), params.clone()),
            // Implicit declaration: assume int(...).
            _ => (Type::int(), Vec::new()),
        };

        let mut arg_exprs: Vec<Node> = Vec::new();
        while !self.consume(")") {
            if !arg_exprs.is_empty() {
                self.skip(",")?;
            }
            let mut arg = self.assign()?;
            add_type(&mut arg)?;
            if let Some(p) = param_tys.get(arg_exprs.len()) {
                if !p.ty.is_struct() {
                    arg = new_cast(arg, p.ty.clone());
                }
            } else if matches!(arg.ty().kind, TypeKind::Float) {
                // Default argument promotion for unprototyped arguments.
                arg = new_cast(arg, Type::double());
            }
            arg_exprs.push(arg);
        }
        if arg_exprs.len() > 6 {
            return Err(CompileError::at_token(
                &name_tok,
                "too many arguments (up to 6 are supported)",
            ));
        }

        // Evaluate arguments into temporaries up front; the call then
        // loads them straight from their frame slots.
        let mut node = Node::with_ty(NodeKind::NullExpr, Type::int(), name_tok.clone());
        let mut arg_vars = Vec::new();
        for arg in arg_exprs {
            let aty = arg.ty().clone();
            if aty.is_struct() {
                return Err(CompileError::at_token(
                    &arg.tok,
                    "passing a struct by value is not supported",
                ));
            }
            let vty = match aty.base() {
                Some(base) => types::pointer_to(base.clone()),
                None => aty,
            };
            let var = self.new_anon_lvar(vty.clone());
            arg_vars.push(var.clone());

            let lhs = Node::with_ty(NodeKind::Var(var), vty, arg.tok.clone());
            let mut asn = Node::new(
                NodeKind::Assign {
                    lhs: Box::new(lhs),
                    rhs: Box::new(arg),
                },
                name_tok.clone(),
            );
            add_type(&mut asn)?;

            let mut comma = Node::new(
                NodeKind::Comma {
                    lhs: Box::new(node),
                    rhs: Box::new(asn),
                },
                name_tok.clone(),
            );
            add_type(&mut comma)?;
            node = comma;
        }

        let call = Node::with_ty(
            NodeKind::FunCall {
                name: name_tok.text.clone(),
                args: arg_vars,
            },
            ret_ty,
            name_tok.clone(),
        );
        let mut full = Node::new(
            NodeKind::Comma {
                lhs: Box::new(node),
                rhs: Box::new(call),
            },
            name_tok,
        );
        add_type(&mut full)?;
        Ok(full)
    }

    // ------------------------------------------------------------------
    // Constant expressions
    // ------------------------------------------------------------------

    pub(crate) fn const_expr(&mut self) -> Result<i64> {
        let mut node = self.conditional()?;
        add_type(&mut node)?;
        eval(&node)
    }
}

/// Fold an integer constant expression.
fn eval(node: &Node) -> Result<i64> {
    let err = || CompileError::at_token(&node.tok, "not a compile-time constant");
    match &node.kind {
        NodeKind::Num(v) => Ok(*v),
        NodeKind::Binary { op, lhs, rhs } => {
            let unsigned = node.ty.as_ref().is_some_and(|t| t.is_unsigned);
            let l = eval(lhs)?;
            let r = eval(rhs)?;
            match op {
                BinaryOp::Add => Ok(l.wrapping_add(r)),
                BinaryOp::Sub => Ok(l.wrapping_sub(r)),
                BinaryOp::Mul => Ok(l.wrapping_mul(r)),
                BinaryOp::Div => {
                    if r == 0 {
                        return Err(CompileError::at_token(&node.tok, "division by zero"));
                    }
                    if unsigned {
                        Ok(((l as u64) / (r as u64)) as i64)
                    } else {
                        Ok(l.wrapping_div(r))
                    }
                }
                BinaryOp::Mod => {
                    if r == 0 {
                        return Err(CompileError::at_token(&node.tok, "division by zero"));
                    }
                    if unsigned {
                        Ok(((l as u64) % (r as u64)) as i64)
                    } else {
                        Ok(l.wrapping_rem(r))
                    }
                }
                BinaryOp::BitAnd => Ok(l & r),
                BinaryOp::BitOr => Ok(l | r),
                BinaryOp::BitXor => Ok(l ^ r),
                BinaryOp::Shl => Ok(l.wrapping_shl(r as u32)),
                BinaryOp::Shr => {
                    if unsigned {
                        Ok(((l as u64).wrapping_shr(r as u32)) as i64)
                    } else {
                        Ok(l.wrapping_shr(r as u32))
                    }
                }
                BinaryOp::Eq => Ok(i64::from(l == r)),
                BinaryOp::Ne => Ok(i64::from(l != r)),
                BinaryOp::Lt => {
                    let lu = lhs.ty().is_unsigned;
                    Ok(i64::from(if lu { (l as u64) < (r as u64) } else { l < r }))
                }
                BinaryOp::Le => {
                    let lu = lhs.ty().is_unsigned;
                    Ok(i64::from(if lu { (l as u64) <= (r as u64) } else { l <= r }))
                }
            }
        }
        NodeKind::Not(inner) => Ok(i64::from(eval(inner)? == 0)),
        NodeKind::BitNot(inner) => Ok(!eval(inner)?),
        NodeKind::LogAnd { lhs, rhs } => Ok(i64::from(eval(lhs)? != 0 && eval(rhs)? != 0)),
        NodeKind::LogOr { lhs, rhs } => Ok(i64::from(eval(lhs)? != 0 || eval(rhs)? != 0)),
        NodeKind::Cond { cond, then, els } => {
            if eval(cond)? != 0 {
                eval(then)
            } else {
                eval(els)
            }
        }
        NodeKind::Cast(inner) => {
            let v = eval(inner)?;
            let ty = node.ty();
            if !ty.is_integer() {
                return Ok(v);
            }
            Ok(match (ty.size(), ty.is_unsigned) {
                (1, false) => v as i8 as i64,
                (1, true) => v as u8 as i64,
                (2, false) => v as i16 as i64,
                (2, true) => v as u16 as i64,
                (4, false) => v as i32 as i64,
                (4, true) => v as u32 as i64,
                _ => v,
            })
        }
        _ => Err(err()),
    }
}

/// Fold a floating constant expression (global initialisers).
fn eval_double(node: &Node) -> Result<f64> {
    match &node.kind {
        NodeKind::FloatNum(v) => Ok(*v),
        NodeKind::Num(v) => Ok(*v as f64),
        NodeKind::Cast(inner) => eval_double(inner),
        NodeKind::Binary { op, lhs, rhs } => {
            let l = eval_double(lhs)?;
            let r = eval_double(rhs)?;
            match op {
                BinaryOp::Add => Ok(l + r),
                BinaryOp::Sub => Ok(l - r),
                BinaryOp::Mul => Ok(l * r),
                BinaryOp::Div => Ok(l / r),
                _ => Err(CompileError::at_token(
                    &node.tok,
                    "not a compile-time constant",
                )),
            }
        }
        _ => Err(CompileError::at_token(
            &node.tok,
            "not a compile-time constant",
        )),
    }
}

/// Fold a global initialiser that may reference addresses of other
/// globals (producing relocations).
fn eval_init(node: &Node) -> Result<InitVal> {
    match &node.kind {
        NodeKind::Addr(inner) => eval_ref(inner),
        NodeKind::Var(var) => {
            let v = var.borrow();
            if !v.is_local && (v.ty.is_array() || v.ty.is_func()) {
                return Ok(InitVal::Sym(v.name.clone(), 0));
            }
            Err(CompileError::at_token(
                &node.tok,
                "not a compile-time constant",
            ))
        }
        NodeKind::Cast(inner) => {
            match eval_init(inner)? {
                InitVal::Sym(s, a) => Ok(InitVal::Sym(s, a)),
                InitVal::Const(_) => Ok(InitVal::Const(eval(node)?)),
            }
        }
        NodeKind::Binary {
            op: op @ (BinaryOp::Add | BinaryOp::Sub),
            lhs,
            rhs,
        } => {
            let l = eval_init(lhs)?;
            let r = eval_init(rhs)?;
            match (l, r, op) {
                (InitVal::Sym(s, a), InitVal::Const(c), BinaryOp::Add) => {
                    Ok(InitVal::Sym(s, a + c))
                }
                (InitVal::Sym(s, a), InitVal::Const(c), BinaryOp::Sub) => {
                    Ok(InitVal::Sym(s, a - c))
                }
                (InitVal::Const(c), InitVal::Sym(s, a), BinaryOp::Add) => {
                    Ok(InitVal::Sym(s, a + c))
                }
                (InitVal::Const(_), InitVal::Const(_), _) => Ok(InitVal::Const(eval(node)?)),
                _ => Err(CompileError::at_token(
                    &node.tok,
                    "not a compile-time constant",
                )),
            }
        }
        _ => Ok(InitVal::Const(eval(node)?)),
    }
}

/// The address of an lvalue, for `&x` in global initialisers.
fn eval_ref(node: &Node) -> Result<InitVal> {
    match &node.kind {
        NodeKind::Var(var) => {
            let v = var.borrow();
            if v.is_local {
                return Err(CompileError::at_token(
                    &node.tok,
                    "not a compile-time constant",
                ));
            }
            Ok(InitVal::Sym(v.name.clone(), 0))
        }
        NodeKind::Deref(inner) => eval_init(inner),
        NodeKind::Member { base, member } => match eval_ref(base)? {
            InitVal::Sym(s, a) => Ok(InitVal::Sym(s, a + member.offset as i64)),
            InitVal::Const(_) => Err(CompileError::at_token(
                &node.tok,
                "not a compile-time constant",
            )),
        },
        _ => Err(CompileError::at_token(
            &node.tok,
            "not a compile-time constant",
        )),
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::lexer;
    use crate::token::SourceFile;
    use crate::types::TypeKind;

    fn parse_src(src: &str) -> Result<Program> {
        let mut text = src.to_string();
        if !text.ends_with('\n') {
            text.push('\n');
        }
        let file = Rc::new(SourceFile::new("test.c", 1, text));
        let mut toks = lexer::tokenize(file)?;
        lexer::convert_pp_tokens(&mut toks)?;
        Parser::new(toks).parse()
    }

    fn parse_ok(src: &str) -> Program {
        parse_src(src).unwrap_or_else(|e| panic!("parse failed: {}", e))
    }

    fn unwrap_casts(mut node: &Node) -> &Node {
        while let NodeKind::Cast(inner) = &node.kind {
            node = inner;
        }
        node
    }

    fn ret_expr(prog: &Program, fn_idx: usize, stmt_idx: usize) -> &Node {
        match &prog.funcs[fn_idx].body[stmt_idx].kind {
            NodeKind::Return(Some(e)) => unwrap_casts(e),
            k => panic!("expected return, got {:?}", k),
        }
    }

    #[test]
    fn test_simple_function() {
        let prog = parse_ok("int main() { return 0; }");
        assert_eq!(prog.funcs.len(), 1);
        assert_eq!(prog.funcs[0].name, "main");
        assert!(!prog.funcs[0].is_static);
        assert!(matches!(ret_expr(&prog, 0, 0).kind, NodeKind::Num(0)));
    }

    #[test]
    fn test_precedence() {
        let prog = parse_ok("int main() { return 2 + 3 * 4; }");
        let expr = ret_expr(&prog, 0, 0);
        let NodeKind::Binary { op, rhs, .. } = &expr.kind else {
            panic!("expected binary add");
        };
        assert_eq!(*op, BinaryOp::Add);
        assert!(matches!(
            unwrap_casts(rhs).kind,
            NodeKind::Binary {
                op: BinaryOp::Mul,
                ..
            }
        ));
    }

    #[test]
    fn test_index_scales_by_element_size() {
        let prog = parse_ok("int main() { int a[3]; return a[1]; }");
        let expr = ret_expr(&prog, 0, 1);
        let NodeKind::Deref(sum) = &expr.kind else {
            panic!("expected deref");
        };
        let NodeKind::Binary {
            op: BinaryOp::Add,
            rhs,
            ..
        } = &sum.kind
        else {
            panic!("expected add");
        };
        // The index was multiplied by sizeof(int).
        let NodeKind::Binary {
            op: BinaryOp::Mul,
            rhs: size,
            ..
        } = &unwrap_casts(rhs).kind
        else {
            panic!("expected scaled index");
        };
        assert!(matches!(unwrap_casts(size).kind, NodeKind::Num(4)));
    }

    #[test]
    fn test_sizeof_folds_at_parse_time() {
        let prog = parse_ok("int x[sizeof(int)]; int main() { return 0; }");
        assert_eq!(prog.globals[0].borrow().ty.size(), 16);

        // sizeof on an array expression does not decay.
        let prog = parse_ok("int main() { int a[3]; return sizeof(a); }");
        assert!(matches!(ret_expr(&prog, 0, 1).kind, NodeKind::Num(12)));

        let prog = parse_ok("int main() { int a[3]; return sizeof(a[0]); }");
        assert!(matches!(ret_expr(&prog, 0, 1).kind, NodeKind::Num(4)));
    }

    #[test]
    fn test_alignof_folds() {
        let prog = parse_ok("int main() { return _Alignof(long); }");
        assert!(matches!(ret_expr(&prog, 0, 0).kind, NodeKind::Num(8)));
    }

    #[test]
    fn test_struct_member_layout() {
        let prog = parse_ok(
            "struct P { char a; int b; };
             int main() { struct P p; p.b = 1; return sizeof(struct P); }",
        );
        assert_eq!(prog.funcs[0].locals[0].borrow().ty.size(), 8);
        assert!(matches!(ret_expr(&prog, 0, 2).kind, NodeKind::Num(8)));
    }

    #[test]
    fn test_self_referential_struct() {
        let prog = parse_ok(
            "struct L { struct L *next; int v; };
             int main() { struct L l; l.next = &l; return l.next->v; }",
        );
        // 8-byte pointer + int, padded to pointer alignment.
        assert_eq!(prog.funcs[0].locals[0].borrow().ty.size(), 16);
    }

    #[test]
    fn test_union_members_share_offset() {
        let prog = parse_ok(
            "union U { char c; long l; };
             int main() { union U u; u.l = 1; return sizeof(union U); }",
        );
        assert!(matches!(ret_expr(&prog, 0, 2).kind, NodeKind::Num(8)));
    }

    #[test]
    fn test_enum_constants() {
        let prog = parse_ok("enum E { A, B = 5, C }; int main() { return C; }");
        assert!(matches!(ret_expr(&prog, 0, 0).kind, NodeKind::Num(6)));
    }

    #[test]
    fn test_typedef() {
        let prog = parse_ok("typedef int MyInt; MyInt x; int main() { return x; }");
        assert_eq!(prog.globals[0].borrow().name, "x");
        assert_eq!(prog.globals[0].borrow().ty.kind, TypeKind::Int);
    }

    #[test]
    fn test_switch_collects_cases() {
        let prog = parse_ok(
            "int main(int argc) {
               switch (argc) {
                 case 1: return 10;
                 case 2: return 20;
                 default: return 0;
               }
             }",
        );
        let NodeKind::Switch {
            cases, default_id, ..
        } = &prog.funcs[0].body[0].kind
        else {
            panic!("expected switch");
        };
        assert_eq!(cases.iter().map(|(v, _)| *v).collect::<Vec<_>>(), vec![1, 2]);
        assert!(default_id.is_some());
    }

    #[test]
    fn test_compound_assign_desugars_without_double_eval() {
        let prog = parse_ok("int main() { int a; a = 1; a += 2; return a; }");
        let NodeKind::ExprStmt(e) = &prog.funcs[0].body[2].kind else {
            panic!("expected expr stmt");
        };
        // tmp = &a, *tmp = *tmp + 2
        let NodeKind::Comma { lhs, rhs } = &e.kind else {
            panic!("expected comma, got {:?}", e.kind);
        };
        assert!(matches!(lhs.kind, NodeKind::Assign { .. }));
        let NodeKind::Assign { lhs: store, .. } = &rhs.kind else {
            panic!("expected assign");
        };
        assert!(matches!(store.kind, NodeKind::Deref(_)));
        // The temporary pointer lives among the locals.
        assert!(prog.funcs[0].locals.iter().any(|v| v.borrow().name.is_empty()));
    }

    #[test]
    fn test_funcall_spills_args_to_temporaries() {
        let prog = parse_ok("int add(int a, int b) { return a + b; } int main() { return add(1, 2); }");
        let expr = ret_expr(&prog, 1, 0);
        let NodeKind::Comma { rhs, .. } = &expr.kind else {
            panic!("expected comma-wrapped call, got {:?}", expr.kind);
        };
        let NodeKind::FunCall { name, args } = &rhs.kind else {
            panic!("expected funcall");
        };
        assert_eq!(name, "add");
        assert_eq!(args.len(), 2);
    }

    #[test]
    fn test_array_argument_decays_to_pointer() {
        let prog = parse_ok(
            "int f(int *p) { return p[0]; }
             int main() { int a[4]; a[0] = 7; return f(a); }",
        );
        let expr = ret_expr(&prog, 1, 2);
        let NodeKind::Comma { rhs, .. } = &expr.kind else {
            panic!("expected comma");
        };
        let NodeKind::FunCall { args, .. } = &rhs.kind else {
            panic!("expected funcall");
        };
        assert!(args[0].borrow().ty.is_ptr());
    }

    #[test]
    fn test_variadic_function() {
        let prog = parse_ok("int f(int a, ...) { return a; } int main() { return f(1, 2, 3); }");
        assert!(prog.funcs[0].is_variadic);
    }

    #[test]
    fn test_statement_expression() {
        let prog = parse_ok("int main() { return ({ int x; x = 3; x; }); }");
        assert!(matches!(
            ret_expr(&prog, 0, 0).kind,
            NodeKind::StmtExpr(_)
        ));
    }

    #[test]
    fn test_pointer_difference_is_element_count() {
        let prog = parse_ok("long f(int *a, int *b) { return a - b; }");
        let expr = ret_expr(&prog, 0, 0);
        let NodeKind::Binary {
            op: BinaryOp::Div,
            rhs,
            ..
        } = &expr.kind
        else {
            panic!("expected division by element size, got {:?}", expr.kind);
        };
        assert!(matches!(unwrap_casts(rhs).kind, NodeKind::Num(4)));
    }

    #[test]
    fn test_string_literal_becomes_anonymous_global() {
        let prog = parse_ok("char *s = \"hi\"; int main() { return 0; }");
        let lit = prog
            .globals
            .iter()
            .find(|g| g.borrow().name.starts_with(".L.str."))
            .expect("string literal global");
        assert_eq!(lit.borrow().init_data.as_deref(), Some(&b"hi\0"[..]));

        let s = prog.globals.iter().find(|g| g.borrow().name == "s").unwrap();
        let s = s.borrow();
        assert_eq!(s.rels.len(), 1);
        assert!(s.rels[0].symbol.starts_with(".L.str."));
    }

    #[test]
    fn test_global_initializers() {
        let prog = parse_ok("int g = 40 + 2; int main() { return 0; }");
        assert_eq!(
            prog.globals[0].borrow().init_data.as_deref(),
            Some(&[42u8, 0, 0, 0][..])
        );

        let prog = parse_ok("int g; int *p = &g; int main() { return 0; }");
        let p = prog.globals.iter().find(|v| v.borrow().name == "p").unwrap();
        assert_eq!(p.borrow().rels[0].symbol, "g");

        let prog = parse_ok("double d = 1.5; int main() { return 0; }");
        assert_eq!(
            prog.globals[0].borrow().init_data.as_deref(),
            Some(&1.5f64.to_le_bytes()[..])
        );
    }

    #[test]
    fn test_global_array_initializer() {
        let prog = parse_ok("int a[] = {1, 2, 3}; int main() { return 0; }");
        let a = prog.globals[0].borrow();
        assert_eq!(a.ty.size(), 12);
        let mut want = Vec::new();
        for v in [1i32, 2, 3] {
            want.extend_from_slice(&v.to_le_bytes());
        }
        assert_eq!(a.init_data.as_deref(), Some(&want[..]));
    }

    #[test]
    fn test_global_string_pointer_array() {
        let prog = parse_ok("static char *face[] = {\"a\", \"b\"}; int main() { return 0; }");
        let face = prog.globals.iter().find(|v| v.borrow().name == "face").unwrap();
        let face = face.borrow();
        assert!(face.is_static);
        assert_eq!(face.ty.size(), 16);
        assert_eq!(face.rels.len(), 2);
        assert_eq!(face.rels[1].offset, 8);
    }

    #[test]
    fn test_char_array_string_initializer() {
        let prog = parse_ok("char msg[] = \"abc\"; int main() { return 0; }");
        let msg = prog.globals[0].borrow();
        assert_eq!(msg.ty.size(), 4);
        assert_eq!(msg.init_data.as_deref(), Some(&b"abc\0"[..]));
    }

    #[test]
    fn test_local_static_gets_unique_global() {
        let prog = parse_ok("int counter() { static int n; n = n + 1; return n; }");
        assert!(
            prog.globals
                .iter()
                .any(|v| v.borrow().name.starts_with("n.") && v.borrow().is_static)
        );
    }

    #[test]
    fn test_implicit_function_declaration() {
        // Calling an undeclared function assumes int, as the original
        // sources (nqueen.c) rely on.
        let prog = parse_ok("int main() { printf(\"x\"); return 0; }");
        assert_eq!(prog.funcs.len(), 1);
    }

    #[test]
    fn test_undefined_variable_is_error() {
        let err = parse_src("int main() { return y; }").unwrap_err();
        assert!(err.to_string().contains("undefined variable"));
    }

    #[test]
    fn test_stray_case_is_error() {
        let err = parse_src("int main() { case 1: return 0; }").unwrap_err();
        assert!(err.to_string().contains("stray case"));
    }

    #[test]
    fn test_redefinition_is_error() {
        let err = parse_src("int main() { int a; int a; return 0; }").unwrap_err();
        assert!(err.to_string().contains("redefinition"));
    }

    #[test]
    fn test_parse_error_has_caret() {
        let err = parse_src("int main() { return 1 }").unwrap_err();
        let msg = err.to_string();
        assert!(msg.contains("expected ';'"));
        assert!(msg.contains("test.c:1:"));
        assert!(msg.contains('^'));
    }

    #[test]
    fn test_goto_and_label() {
        let prog = parse_ok("int main() { goto end; end: return 1; }");
        assert!(matches!(prog.funcs[0].body[0].kind, NodeKind::Goto(_)));
        assert!(matches!(prog.funcs[0].body[1].kind, NodeKind::Label { .. }));
    }

    #[test]
    fn test_do_while() {
        let prog = parse_ok("int main() { int i; i = 0; do i = i + 1; while (i < 3); return i; }");
        assert!(matches!(prog.funcs[0].body[2].kind, NodeKind::Do { .. }));
    }

    #[test]
    fn test_function_pointer_declarator_parses() {
        let prog = parse_ok("int (*handler)(int); int main() { return 0; }");
        let h = prog.globals[0].borrow();
        assert!(h.ty.is_ptr());
        assert!(h.ty.base().unwrap().is_func());
    }

    #[test]
    fn test_mod_on_float_is_error() {
        let err = parse_src("int main() { return 1.5 % 2; }").unwrap_err();
        assert!(err.to_string().contains("invalid operands"));
    }
}
