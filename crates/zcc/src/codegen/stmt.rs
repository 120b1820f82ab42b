//! Statement code generation.
//!
//! Control flow is label-based: each construct draws a sequence number
//! and emits `.L.<kind>.<seq>` labels. `break` and `continue` jump to
//! the labels of the innermost enclosing loop or switch, tracked by the
//! `brk_seq`/`cont_seq` fields.

use std::fmt::Write;

use crate::ast::{Node, NodeKind};
use crate::error::{CompileError, Result};

use super::{CodeGen, fmov, is_fp};

impl CodeGen {
    pub(crate) fn gen_stmt(&mut self, node: &Node) -> Result<()> {
        self.emit_loc(&node.tok)?;

        match &node.kind {
            NodeKind::If { cond, then, els } => {
                let seq = self.next_label();
                self.gen_expr(cond)?;
                self.cmp_zero(cond.ty(), self.top - 1)?;
                self.top -= 1;
                if let Some(els) = els {
                    writeln!(self.out, "  je  .L.else.{}", seq)?;
                    self.gen_stmt(then)?;
                    writeln!(self.out, "  jmp .L.end.{}", seq)?;
                    writeln!(self.out, ".L.else.{}:", seq)?;
                    self.gen_stmt(els)?;
                    writeln!(self.out, ".L.end.{}:", seq)?;
                } else {
                    writeln!(self.out, "  je  .L.end.{}", seq)?;
                    self.gen_stmt(then)?;
                    writeln!(self.out, ".L.end.{}:", seq)?;
                }
            }

            NodeKind::For {
                init,
                cond,
                inc,
                body,
            } => {
                let seq = self.next_label();
                let brk = self.brk_seq;
                let cont = self.cont_seq;
                self.brk_seq = seq;
                self.cont_seq = seq;

                if let Some(init) = init {
                    self.gen_stmt(init)?;
                }
                writeln!(self.out, ".L.begin.{}:", seq)?;
                if let Some(cond) = cond {
                    self.gen_expr(cond)?;
                    self.cmp_zero(cond.ty(), self.top - 1)?;
                    self.top -= 1;
                    writeln!(self.out, "  je  .L.break.{}", seq)?;
                }
                self.gen_stmt(body)?;
                writeln!(self.out, ".L.continue.{}:", seq)?;
                if let Some(inc) = inc {
                    self.gen_stmt(inc)?;
                }
                writeln!(self.out, "  jmp .L.begin.{}", seq)?;
                writeln!(self.out, ".L.break.{}:", seq)?;

                self.brk_seq = brk;
                self.cont_seq = cont;
            }

            NodeKind::Do { body, cond } => {
                let seq = self.next_label();
                let brk = self.brk_seq;
                let cont = self.cont_seq;
                self.brk_seq = seq;
                self.cont_seq = seq;

                writeln!(self.out, ".L.begin.{}:", seq)?;
                self.gen_stmt(body)?;
                writeln!(self.out, ".L.continue.{}:", seq)?;
                self.gen_expr(cond)?;
                self.cmp_zero(cond.ty(), self.top - 1)?;
                self.top -= 1;
                writeln!(self.out, "  jne .L.begin.{}", seq)?;
                writeln!(self.out, ".L.break.{}:", seq)?;

                self.brk_seq = brk;
                self.cont_seq = cont;
            }

            NodeKind::Switch {
                cond,
                body,
                cases,
                default_id,
            } => {
                let seq = self.next_label();
                let brk = self.brk_seq;
                self.brk_seq = seq;

                self.gen_expr(cond)?;
                let r = self.xreg(cond.ty(), self.top - 1)?;
                self.top -= 1;

                // Linear compare chain in source order, then the default.
                for (val, id) in cases {
                    if i32::try_from(*val).is_ok() {
                        writeln!(self.out, "  cmp {}, {}", r, val)?;
                    } else {
                        writeln!(self.out, "  mov rax, {}", val)?;
                        writeln!(self.out, "  cmp {}, rax", r)?;
                    }
                    writeln!(self.out, "  je .L.case.{}", id)?;
                }
                match default_id {
                    Some(id) => writeln!(self.out, "  jmp .L.case.{}", id)?,
                    None => writeln!(self.out, "  jmp .L.break.{}", seq)?,
                }

                self.gen_stmt(body)?;
                writeln!(self.out, ".L.break.{}:", seq)?;
                self.brk_seq = brk;
            }

            NodeKind::Case { id, body } => {
                writeln!(self.out, ".L.case.{}:", id)?;
                self.gen_stmt(body)?;
            }

            NodeKind::Block(items) => {
                for item in items {
                    self.gen_stmt(item)?;
                }
            }

            NodeKind::Break => {
                if self.brk_seq == 0 {
                    return Err(CompileError::at_token(&node.tok, "stray break"));
                }
                writeln!(self.out, "  jmp .L.break.{}", self.brk_seq)?;
            }

            NodeKind::Continue => {
                if self.cont_seq == 0 {
                    return Err(CompileError::at_token(&node.tok, "stray continue"));
                }
                writeln!(self.out, "  jmp .L.continue.{}", self.cont_seq)?;
            }

            NodeKind::Goto(label) => {
                let fname = self.fn_name().to_string();
                writeln!(self.out, "  jmp .L.label.{}.{}", fname, label)?;
            }

            NodeKind::Label { name, body } => {
                let fname = self.fn_name().to_string();
                writeln!(self.out, ".L.label.{}.{}:", fname, name)?;
                self.gen_stmt(body)?;
            }

            NodeKind::Return(expr) => {
                if let Some(expr) = expr {
                    self.gen_expr(expr)?;
                    if is_fp(expr.ty()) {
                        writeln!(
                            self.out,
                            "  {} xmm0, {}",
                            fmov(expr.ty()),
                            self.freg(self.top - 1)?
                        )?;
                    } else {
                        writeln!(self.out, "  mov rax, {}", self.reg(self.top - 1)?)?;
                    }
                    self.top -= 1;
                }
                let fname = self.fn_name().to_string();
                writeln!(self.out, "  jmp .L.return.{}", fname)?;
            }

            NodeKind::ExprStmt(expr) => {
                self.gen_expr(expr)?;
                self.top -= 1;
            }

            _ => {
                return Err(CompileError::at_token(&node.tok, "invalid statement"));
            }
        }
        Ok(())
    }
}
