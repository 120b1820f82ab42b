//! x86-64 code generation with a register-stack discipline.
//!
//! Expression values live in a bounded stack of registers indexed by
//! `top`: general-purpose values in `r10..r15`, floating values in
//! `xmm8..xmm13`. Evaluating an expression pushes one slot; a binary
//! operator pops one. Every statement starts and ends with `top == 0`.
//! Exceeding six live values is a fatal error, which bounds the
//! expression depth the generator accepts.

mod expr;
mod stmt;

use std::fmt::Write;
use std::rc::Rc;

use tracing::debug;

use crate::ast::{Function, Program};
use crate::error::{CompileError, Result};
use crate::token::SourceFile;
use crate::types::{Type, TypeKind};

pub(crate) const GP64: [&str; 6] = ["r10", "r11", "r12", "r13", "r14", "r15"];
pub(crate) const GP32: [&str; 6] = ["r10d", "r11d", "r12d", "r13d", "r14d", "r15d"];
pub(crate) const GP16: [&str; 6] = ["r10w", "r11w", "r12w", "r13w", "r14w", "r15w"];
pub(crate) const GP8: [&str; 6] = ["r10b", "r11b", "r12b", "r13b", "r14b", "r15b"];
pub(crate) const FP: [&str; 6] = ["xmm8", "xmm9", "xmm10", "xmm11", "xmm12", "xmm13"];

pub(crate) const ARG64: [&str; 6] = ["rdi", "rsi", "rdx", "rcx", "r8", "r9"];
pub(crate) const ARG32: [&str; 6] = ["edi", "esi", "edx", "ecx", "r8d", "r9d"];
pub(crate) const ARG16: [&str; 6] = ["di", "si", "dx", "cx", "r8w", "r9w"];
pub(crate) const ARG8: [&str; 6] = ["dil", "sil", "dl", "cl", "r8b", "r9b"];

struct CurrentFn {
    name: String,
    /// Number of named general-purpose (non-floating) parameters; feeds
    /// the gp_offset field written by va_start.
    gp_params: usize,
}

pub struct CodeGen {
    out: String,
    /// Register-stack depth: index of the next free slot.
    top: usize,
    label_seq: usize,
    /// Innermost enclosing loop/switch break label (0 = none).
    brk_seq: usize,
    /// Innermost enclosing loop continue label (0 = none).
    cont_seq: usize,
    current_fn: Option<CurrentFn>,
}

impl Default for CodeGen {
    fn default() -> Self {
        Self::new()
    }
}

impl CodeGen {
    pub fn new() -> Self {
        CodeGen {
            out: String::new(),
            top: 0,
            label_seq: 1,
            brk_seq: 0,
            cont_seq: 0,
            current_fn: None,
        }
    }

    /// Emit one translation unit of GNU-assembler Intel-syntax text.
    /// `files` drives the `.file` directives that `.loc` lines refer to.
    pub fn generate(&mut self, prog: &Program, files: &[Rc<SourceFile>]) -> Result<String> {
        writeln!(self.out, ".intel_syntax noprefix")?;
        for file in files {
            writeln!(self.out, ".file {} \"{}\"", file.file_no, file.name)?;
        }

        self.emit_bss(prog)?;
        self.emit_data(prog)?;
        self.emit_text(prog)?;

        debug!(bytes = self.out.len(), "assembly generated");
        Ok(std::mem::take(&mut self.out))
    }

    // ------------------------------------------------------------------
    // Registers
    // ------------------------------------------------------------------

    fn check_reg(&self, idx: usize) -> Result<usize> {
        if idx >= GP64.len() {
            return Err(CompileError::plain(format!("register out of range: {}", idx)));
        }
        Ok(idx)
    }

    /// 64-bit general register for a stack slot.
    pub(crate) fn reg(&self, idx: usize) -> Result<&'static str> {
        Ok(GP64[self.check_reg(idx)?])
    }

    /// General register for a slot, sized for the given type: pointers
    /// and 8-byte scalars use the full register, the rest the 32-bit
    /// alias.
    pub(crate) fn xreg(&self, ty: &Type, idx: usize) -> Result<&'static str> {
        let idx = self.check_reg(idx)?;
        if ty.base().is_some() || ty.size() == 8 {
            Ok(GP64[idx])
        } else {
            Ok(GP32[idx])
        }
    }

    /// XMM register for a stack slot.
    pub(crate) fn freg(&self, idx: usize) -> Result<&'static str> {
        Ok(FP[self.check_reg(idx)?])
    }

    pub(crate) fn next_label(&mut self) -> usize {
        let seq = self.label_seq;
        self.label_seq += 1;
        seq
    }

    /// Compare the value in slot `idx` against zero, setting flags.
    pub(crate) fn cmp_zero(&mut self, ty: &Type, idx: usize) -> Result<()> {
        if ty.is_flonum() {
            if ty.size() == 4 {
                writeln!(self.out, "  xorps xmm0, xmm0")?;
                writeln!(self.out, "  ucomiss {}, xmm0", self.freg(idx)?)?;
            } else {
                writeln!(self.out, "  xorpd xmm0, xmm0")?;
                writeln!(self.out, "  ucomisd {}, xmm0", self.freg(idx)?)?;
            }
        } else {
            writeln!(self.out, "  cmp {}, 0", self.reg(idx)?)?;
        }
        Ok(())
    }

    fn fn_name(&self) -> &str {
        self.current_fn
            .as_ref()
            .map(|f| f.name.as_str())
            .unwrap_or("")
    }

    // ------------------------------------------------------------------
    // Data sections
    // ------------------------------------------------------------------

    fn emit_bss(&mut self, prog: &Program) -> Result<()> {
        writeln!(self.out, ".bss")?;
        for var in &prog.globals {
            let v = var.borrow();
            if v.is_extern || v.init_data.is_some() {
                continue;
            }
            if !v.is_static {
                writeln!(self.out, ".globl {}", v.name)?;
            }
            writeln!(self.out, ".align {}", v.align)?;
            writeln!(self.out, "{}:", v.name)?;
            writeln!(self.out, "  .zero {}", v.ty.size())?;
        }
        Ok(())
    }

    fn emit_data(&mut self, prog: &Program) -> Result<()> {
        writeln!(self.out, ".data")?;
        for var in &prog.globals {
            let v = var.borrow();
            let Some(data) = &v.init_data else {
                continue;
            };
            if v.is_extern {
                continue;
            }
            if !v.is_static {
                writeln!(self.out, ".globl {}", v.name)?;
            }
            writeln!(self.out, ".align {}", v.align)?;
            writeln!(self.out, "{}:", v.name)?;

            let mut pos = 0usize;
            let mut rel = v.rels.iter().peekable();
            while pos < data.len() {
                if let Some(r) = rel.peek() {
                    if r.offset == pos {
                        if r.addend == 0 {
                            writeln!(self.out, "  .quad {}", r.symbol)?;
                        } else {
                            writeln!(self.out, "  .quad {}{:+}", r.symbol, r.addend)?;
                        }
                        rel.next();
                        pos += 8;
                        continue;
                    }
                }
                writeln!(self.out, "  .byte {}", data[pos])?;
                pos += 1;
            }
        }
        Ok(())
    }

    // ------------------------------------------------------------------
    // Text section
    // ------------------------------------------------------------------

    fn emit_text(&mut self, prog: &Program) -> Result<()> {
        writeln!(self.out, ".text")?;
        for f in &prog.funcs {
            self.emit_function(f)?;
        }
        Ok(())
    }

    fn emit_function(&mut self, f: &Function) -> Result<()> {
        if !f.is_static {
            writeln!(self.out, ".globl {}", f.name)?;
        }
        writeln!(self.out, "{}:", f.name)?;

        let gp_params = f
            .params
            .iter()
            .filter(|p| !p.borrow().ty.is_flonum())
            .count();
        self.current_fn = Some(CurrentFn {
            name: f.name.clone(),
            gp_params,
        });

        // Prologue. r12-r15 double as expression registers, so they are
        // saved in the 32-byte area right below the frame pointer.
        writeln!(self.out, "  push rbp")?;
        writeln!(self.out, "  mov rbp, rsp")?;
        writeln!(self.out, "  sub rsp, {}", f.stack_size)?;
        writeln!(self.out, "  mov [rbp-8], r12")?;
        writeln!(self.out, "  mov [rbp-16], r13")?;
        writeln!(self.out, "  mov [rbp-24], r14")?;
        writeln!(self.out, "  mov [rbp-32], r15")?;

        // Variadic functions save the six integer argument registers so
        // that va_start can expose them as the register save area.
        if f.is_variadic {
            for (i, r) in ARG64.iter().enumerate() {
                writeln!(self.out, "  mov [rbp-{}], {}", 80 - i * 8, r)?;
            }
        }

        // Spill named parameters from their argument registers.
        let mut gp = 0usize;
        let mut fp = 0usize;
        for param in &f.params {
            let p = param.borrow();
            if p.ty.is_flonum() {
                let op = if p.ty.size() == 4 { "movss" } else { "movsd" };
                writeln!(self.out, "  {} [rbp-{}], xmm{}", op, p.offset, fp)?;
                fp += 1;
            } else {
                let r = match p.ty.size() {
                    1 => ARG8[gp],
                    2 => ARG16[gp],
                    4 => ARG32[gp],
                    _ => ARG64[gp],
                };
                writeln!(self.out, "  mov [rbp-{}], {}", p.offset, r)?;
                gp += 1;
            }
        }

        for node in &f.body {
            self.gen_stmt(node)?;
            assert_eq!(self.top, 0, "register stack unbalanced after statement");
        }

        // Epilogue: the single exit point every `return` jumps to.
        writeln!(self.out, ".L.return.{}:", f.name)?;
        writeln!(self.out, "  mov r12, [rbp-8]")?;
        writeln!(self.out, "  mov r13, [rbp-16]")?;
        writeln!(self.out, "  mov r14, [rbp-24]")?;
        writeln!(self.out, "  mov r15, [rbp-32]")?;
        writeln!(self.out, "  mov rsp, rbp")?;
        writeln!(self.out, "  pop rbp")?;
        writeln!(self.out, "  ret")?;

        self.current_fn = None;
        Ok(())
    }

    /// `.loc` line directive for debuggers; skipped for synthesised
    /// tokens that have no real file behind them.
    pub(crate) fn emit_loc(&mut self, tok: &crate::token::Token) -> Result<()> {
        if tok.file.file_no >= 1 && tok.line_no >= 1 {
            writeln!(self.out, ".loc {} {}", tok.file.file_no, tok.line_no)?;
        }
        Ok(())
    }
}

/// True when a value of this type lives in an XMM slot.
pub(crate) fn is_fp(ty: &Type) -> bool {
    ty.is_flonum()
}

/// Width suffix helper for float move instructions.
pub(crate) fn fmov(ty: &Type) -> &'static str {
    if matches!(ty.kind, TypeKind::Float) {
        "movss"
    } else {
        "movsd"
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::ast::Var;
    use crate::types;

    #[test]
    fn test_register_names_by_width() {
        let cg = CodeGen::new();
        assert_eq!(cg.reg(0).unwrap(), "r10");
        assert_eq!(cg.reg(5).unwrap(), "r15");
        assert_eq!(cg.xreg(&Type::int(), 0).unwrap(), "r10d");
        assert_eq!(cg.xreg(&Type::long(), 0).unwrap(), "r10");
        assert_eq!(
            cg.xreg(&types::pointer_to(Type::char_()), 1).unwrap(),
            "r11"
        );
        assert_eq!(cg.freg(2).unwrap(), "xmm10");
    }

    #[test]
    fn test_register_overflow_is_fatal() {
        let cg = CodeGen::new();
        let err = cg.reg(6).unwrap_err();
        assert!(err.to_string().contains("register out of range"));
    }

    #[test]
    fn test_bss_and_data_split() {
        let zeroed = Var::new_global("blank", types::array_of(Type::int(), 4));
        let inited = Var::new_global("filled", Type::int());
        inited.borrow_mut().init_data = Some(vec![42, 0, 0, 0]);

        let prog = Program {
            globals: vec![zeroed, inited],
            funcs: Vec::new(),
        };
        let asm = CodeGen::new().generate(&prog, &[]).unwrap();

        let bss_at = asm.find(".bss").unwrap();
        let data_at = asm.find(".data").unwrap();
        let text_at = asm.find(".text").unwrap();
        assert!(bss_at < data_at && data_at < text_at);

        assert!(asm.contains("blank:\n  .zero 16"));
        assert!(asm.contains("filled:\n  .byte 42"));
        assert!(asm.contains(".globl blank"));
    }

    #[test]
    fn test_static_global_is_not_exported() {
        let var = Var::new_global("hidden", Type::int());
        var.borrow_mut().is_static = true;
        let prog = Program {
            globals: vec![var],
            funcs: Vec::new(),
        };
        let asm = CodeGen::new().generate(&prog, &[]).unwrap();
        assert!(!asm.contains(".globl hidden"));
        assert!(asm.contains("hidden:"));
    }

    #[test]
    fn test_relocated_initialiser_emits_quad() {
        let var = Var::new_global("p", types::pointer_to(Type::char_()));
        {
            let mut v = var.borrow_mut();
            v.init_data = Some(vec![0; 8]);
            v.rels.push(crate::ast::Relocation {
                offset: 0,
                symbol: ".L.str.1".into(),
                addend: 3,
            });
        }
        let prog = Program {
            globals: vec![var],
            funcs: Vec::new(),
        };
        let asm = CodeGen::new().generate(&prog, &[]).unwrap();
        assert!(asm.contains("  .quad .L.str.1+3"));
    }
}
