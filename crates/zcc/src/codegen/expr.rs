//! Expression code generation: one switch per node kind.

use std::fmt::Write;
use std::rc::Rc;

use crate::ast::{BinaryOp, Node, NodeKind, VarRef};
use crate::error::{CompileError, Result};
use crate::types::{Type, TypeKind};

use super::{ARG32, ARG64, CodeGen, GP16, GP32, GP64, GP8, fmov, is_fp};

impl CodeGen {
    pub(crate) fn gen_expr(&mut self, node: &Node) -> Result<()> {
        self.emit_loc(&node.tok)?;

        match &node.kind {
            NodeKind::Num(val) => {
                writeln!(self.out, "  mov {}, {}", self.reg(self.top)?, val)?;
                self.top += 1;
            }

            NodeKind::FloatNum(val) => {
                // Materialise the bit pattern through a scratch register;
                // no constant pool needed.
                let ty = node.ty();
                if ty.size() == 4 {
                    writeln!(self.out, "  mov eax, {}", (*val as f32).to_bits())?;
                    writeln!(self.out, "  movd {}, eax", self.freg(self.top)?)?;
                } else {
                    writeln!(self.out, "  mov rax, {}", val.to_bits())?;
                    writeln!(self.out, "  movq {}, rax", self.freg(self.top)?)?;
                }
                self.top += 1;
            }

            NodeKind::Var(_) | NodeKind::Member { .. } => {
                self.gen_addr(node)?;
                self.load(node.ty())?;
            }

            NodeKind::Deref(inner) => {
                self.gen_expr(inner)?;
                self.load(node.ty())?;
            }

            NodeKind::Addr(inner) => {
                self.gen_addr(inner)?;
            }

            NodeKind::Assign { lhs, rhs } => {
                self.gen_expr(rhs)?;
                self.gen_addr(lhs)?;
                self.store(node.ty())?;
            }

            NodeKind::Cast(inner) => {
                self.gen_expr(inner)?;
                self.cast(inner.ty(), node.ty())?;
            }

            NodeKind::NullExpr => {
                self.top += 1;
            }

            NodeKind::StmtExpr(body) => {
                for stmt in body {
                    self.gen_stmt(stmt)?;
                }
                // The last expression statement left its value in the slot
                // it vacated; reclaim it.
                self.top += 1;
            }

            NodeKind::Comma { lhs, rhs } => {
                self.gen_expr(lhs)?;
                self.top -= 1;
                self.gen_expr(rhs)?;
            }

            NodeKind::Not(inner) => {
                self.gen_expr(inner)?;
                let i = self.top - 1;
                self.cmp_zero(inner.ty(), i)?;
                writeln!(self.out, "  sete {}", GP8[i])?;
                writeln!(self.out, "  movzx {}, {}", GP64[i], GP8[i])?;
            }

            NodeKind::BitNot(inner) => {
                self.gen_expr(inner)?;
                writeln!(self.out, "  not {}", self.reg(self.top - 1)?)?;
            }

            NodeKind::LogAnd { lhs, rhs } => {
                let seq = self.next_label();
                self.gen_expr(lhs)?;
                self.cmp_zero(lhs.ty(), self.top - 1)?;
                self.top -= 1;
                writeln!(self.out, "  je .L.false.{}", seq)?;
                self.gen_expr(rhs)?;
                self.cmp_zero(rhs.ty(), self.top - 1)?;
                self.top -= 1;
                writeln!(self.out, "  je .L.false.{}", seq)?;
                writeln!(self.out, "  mov {}, 1", self.reg(self.top)?)?;
                writeln!(self.out, "  jmp .L.end.{}", seq)?;
                writeln!(self.out, ".L.false.{}:", seq)?;
                writeln!(self.out, "  mov {}, 0", self.reg(self.top)?)?;
                writeln!(self.out, ".L.end.{}:", seq)?;
                self.top += 1;
            }

            NodeKind::LogOr { lhs, rhs } => {
                let seq = self.next_label();
                self.gen_expr(lhs)?;
                self.cmp_zero(lhs.ty(), self.top - 1)?;
                self.top -= 1;
                writeln!(self.out, "  jne .L.true.{}", seq)?;
                self.gen_expr(rhs)?;
                self.cmp_zero(rhs.ty(), self.top - 1)?;
                self.top -= 1;
                writeln!(self.out, "  jne .L.true.{}", seq)?;
                writeln!(self.out, "  mov {}, 0", self.reg(self.top)?)?;
                writeln!(self.out, "  jmp .L.end.{}", seq)?;
                writeln!(self.out, ".L.true.{}:", seq)?;
                writeln!(self.out, "  mov {}, 1", self.reg(self.top)?)?;
                writeln!(self.out, ".L.end.{}:", seq)?;
                self.top += 1;
            }

            NodeKind::Cond { cond, then, els } => {
                let seq = self.next_label();
                self.gen_expr(cond)?;
                self.cmp_zero(cond.ty(), self.top - 1)?;
                self.top -= 1;
                writeln!(self.out, "  je .L.else.{}", seq)?;
                // Both arms evaluate into the same slot.
                self.gen_expr(then)?;
                self.top -= 1;
                writeln!(self.out, "  jmp .L.end.{}", seq)?;
                writeln!(self.out, ".L.else.{}:", seq)?;
                self.gen_expr(els)?;
                self.top -= 1;
                writeln!(self.out, ".L.end.{}:", seq)?;
                self.top += 1;
            }

            NodeKind::FunCall { name, args } => {
                self.gen_funcall(node, name, args)?;
            }

            NodeKind::VaStart { ap } => {
                self.gen_va_start(ap)?;
            }

            NodeKind::Binary { op, lhs, rhs } => {
                self.gen_expr(lhs)?;
                self.gen_expr(rhs)?;
                self.gen_binary(*op, lhs, rhs)?;
            }

            _ => {
                return Err(CompileError::at_token(&node.tok, "invalid expression"));
            }
        }
        Ok(())
    }

    /// Push the address of an lvalue onto the register stack.
    pub(crate) fn gen_addr(&mut self, node: &Node) -> Result<()> {
        match &node.kind {
            NodeKind::Var(var) => {
                let v = var.borrow();
                if v.is_local {
                    writeln!(self.out, "  lea {}, [rbp-{}]", self.reg(self.top)?, v.offset)?;
                } else {
                    writeln!(self.out, "  mov {}, offset {}", self.reg(self.top)?, v.name)?;
                }
                self.top += 1;
            }
            NodeKind::Deref(inner) => {
                self.gen_expr(inner)?;
            }
            NodeKind::Comma { lhs, rhs } => {
                self.gen_expr(lhs)?;
                self.top -= 1;
                self.gen_addr(rhs)?;
            }
            NodeKind::Member { base, member } => {
                self.gen_addr(base)?;
                writeln!(
                    self.out,
                    "  add {}, {}",
                    self.reg(self.top - 1)?,
                    member.offset
                )?;
            }
            _ => {
                return Err(CompileError::at_token(&node.tok, "not an lvalue"));
            }
        }
        Ok(())
    }

    /// Replace the address in the top slot with the value it points to.
    /// Arrays, structs, and functions stay as addresses; evaluating them
    /// is where array-to-pointer decay happens.
    fn load(&mut self, ty: &Rc<Type>) -> Result<()> {
        if matches!(
            ty.kind,
            TypeKind::Array { .. } | TypeKind::Struct(_) | TypeKind::Func { .. }
        ) {
            return Ok(());
        }

        let i = self.top - 1;
        self.check(i)?;
        if is_fp(ty) {
            writeln!(self.out, "  {} {}, [{}]", fmov(ty), super::FP[i], GP64[i])?;
            return Ok(());
        }

        // Sub-int values are widened to 32 bits on load, so the lower half
        // of a register always holds a valid value.
        match (ty.size(), ty.is_unsigned) {
            (1, false) => writeln!(self.out, "  movsx {}, byte ptr [{}]", GP32[i], GP64[i])?,
            (1, true) => writeln!(self.out, "  movzx {}, byte ptr [{}]", GP32[i], GP64[i])?,
            (2, false) => writeln!(self.out, "  movsx {}, word ptr [{}]", GP32[i], GP64[i])?,
            (2, true) => writeln!(self.out, "  movzx {}, word ptr [{}]", GP32[i], GP64[i])?,
            (4, _) => writeln!(self.out, "  mov {}, dword ptr [{}]", GP32[i], GP64[i])?,
            _ => writeln!(self.out, "  mov {}, [{}]", GP64[i], GP64[i])?,
        }
        Ok(())
    }

    /// Store the value in slot top-2 through the address in slot top-1,
    /// leaving the value as the expression result.
    fn store(&mut self, ty: &Rc<Type>) -> Result<()> {
        let dst = self.reg(self.top - 1)?;
        let src = self.top - 2;
        self.check(src)?;

        if let TypeKind::Struct(_) = ty.kind {
            // Byte-by-byte copy through al.
            for i in 0..ty.size() {
                writeln!(self.out, "  mov al, [{}+{}]", GP64[src], i)?;
                writeln!(self.out, "  mov [{}+{}], al", dst, i)?;
            }
        } else if is_fp(ty) {
            writeln!(self.out, "  {} [{}], {}", fmov(ty), dst, super::FP[src])?;
        } else {
            match ty.size() {
                1 => writeln!(self.out, "  mov [{}], {}", dst, GP8[src])?,
                2 => writeln!(self.out, "  mov [{}], {}", dst, GP16[src])?,
                4 => writeln!(self.out, "  mov [{}], {}", dst, GP32[src])?,
                _ => writeln!(self.out, "  mov [{}], {}", dst, GP64[src])?,
            }
        }

        self.top -= 1;
        Ok(())
    }

    fn check(&self, idx: usize) -> Result<()> {
        if idx >= GP64.len() {
            return Err(CompileError::plain(format!("register out of range: {}", idx)));
        }
        Ok(())
    }

    /// Convert the top-of-stack value between two scalar types.
    fn cast(&mut self, from: &Rc<Type>, to: &Rc<Type>) -> Result<()> {
        if to.is_void() {
            return Ok(());
        }
        let i = self.top - 1;
        self.check(i)?;

        if matches!(to.kind, TypeKind::Bool) {
            self.cmp_zero(from, i)?;
            writeln!(self.out, "  setne {}", GP8[i])?;
            writeln!(self.out, "  movzx {}, {}", GP64[i], GP8[i])?;
            return Ok(());
        }

        match (is_fp(from), is_fp(to)) {
            (true, true) => {
                if from.size() == 4 && to.size() == 8 {
                    writeln!(self.out, "  cvtss2sd {}, {}", super::FP[i], super::FP[i])?;
                } else if from.size() == 8 && to.size() == 4 {
                    writeln!(self.out, "  cvtsd2ss {}, {}", super::FP[i], super::FP[i])?;
                }
            }
            (true, false) => {
                let op = if from.size() == 4 {
                    "cvttss2si"
                } else {
                    "cvttsd2si"
                };
                let dst = if to.size() == 8 { GP64[i] } else { GP32[i] };
                writeln!(self.out, "  {} {}, {}", op, dst, super::FP[i])?;
            }
            (false, true) => {
                let op = if to.size() == 4 { "cvtsi2ss" } else { "cvtsi2sd" };
                let src = if from.is_integer() && from.size() < 8 && !from.is_unsigned {
                    GP32[i]
                } else {
                    GP64[i]
                };
                writeln!(self.out, "  {} {}, {}", op, super::FP[i], src)?;
            }
            (false, false) => {
                let from_sz = if from.is_integer() { from.size() } else { 8 };
                match to.size() {
                    1 => {
                        let op = if to.is_unsigned { "movzx" } else { "movsx" };
                        writeln!(self.out, "  {} {}, {}", op, GP32[i], GP8[i])?;
                    }
                    2 => {
                        let op = if to.is_unsigned { "movzx" } else { "movsx" };
                        writeln!(self.out, "  {} {}, {}", op, GP32[i], GP16[i])?;
                    }
                    4 => writeln!(self.out, "  mov {}, {}", GP32[i], GP32[i])?,
                    _ => {
                        if from_sz < 8 {
                            if from.is_unsigned {
                                writeln!(self.out, "  mov {}, {}", GP32[i], GP32[i])?;
                            } else {
                                writeln!(self.out, "  movsx {}, {}", GP64[i], GP32[i])?;
                            }
                        }
                    }
                }
            }
        }
        Ok(())
    }

    fn gen_binary(&mut self, op: BinaryOp, lhs: &Node, rhs: &Node) -> Result<()> {
        let ty = lhs.ty().clone();
        if is_fp(&ty) {
            return self.gen_float_binary(op, &ty, &lhs.tok);
        }

        let rd = self.xreg(&ty, self.top - 2)?;
        let rs = self.xreg(&ty, self.top - 1)?;
        let i = self.top - 2;
        self.top -= 1;

        match op {
            BinaryOp::Add => writeln!(self.out, "  add {}, {}", rd, rs)?,
            BinaryOp::Sub => writeln!(self.out, "  sub {}, {}", rd, rs)?,
            BinaryOp::Mul => writeln!(self.out, "  imul {}, {}", rd, rs)?,
            BinaryOp::Div | BinaryOp::Mod => {
                self.gen_divmod(op, &ty, rd, rs)?;
            }
            BinaryOp::BitAnd => writeln!(self.out, "  and {}, {}", rd, rs)?,
            BinaryOp::BitOr => writeln!(self.out, "  or {}, {}", rd, rs)?,
            BinaryOp::BitXor => writeln!(self.out, "  xor {}, {}", rd, rs)?,
            BinaryOp::Shl => {
                writeln!(self.out, "  mov rcx, {}", GP64[self.top])?;
                writeln!(self.out, "  shl {}, cl", rd)?;
            }
            BinaryOp::Shr => {
                writeln!(self.out, "  mov rcx, {}", GP64[self.top])?;
                if ty.is_unsigned {
                    writeln!(self.out, "  shr {}, cl", rd)?;
                } else {
                    writeln!(self.out, "  sar {}, cl", rd)?;
                }
            }
            BinaryOp::Eq | BinaryOp::Ne | BinaryOp::Lt | BinaryOp::Le => {
                writeln!(self.out, "  cmp {}, {}", rd, rs)?;
                let cc = match (op, ty.is_unsigned) {
                    (BinaryOp::Eq, _) => "sete",
                    (BinaryOp::Ne, _) => "setne",
                    (BinaryOp::Lt, false) => "setl",
                    (BinaryOp::Lt, true) => "setb",
                    (BinaryOp::Le, false) => "setle",
                    (BinaryOp::Le, true) => "setbe",
                    _ => unreachable!(),
                };
                writeln!(self.out, "  {} al", cc)?;
                writeln!(self.out, "  movzx {}, al", GP64[i])?;
            }
        }
        Ok(())
    }

    fn gen_divmod(&mut self, op: BinaryOp, ty: &Rc<Type>, rd: &str, rs: &str) -> Result<()> {
        let wide = ty.size() == 8;
        let (ax, dx) = if wide { ("rax", "rdx") } else { ("eax", "edx") };
        writeln!(self.out, "  mov {}, {}", ax, rd)?;
        if ty.is_unsigned {
            writeln!(self.out, "  mov {}, 0", dx)?;
            writeln!(self.out, "  div {}", rs)?;
        } else {
            writeln!(self.out, "  {}", if wide { "cqo" } else { "cdq" })?;
            writeln!(self.out, "  idiv {}", rs)?;
        }
        let result = if matches!(op, BinaryOp::Div) { ax } else { dx };
        writeln!(self.out, "  mov {}, {}", rd, result)?;
        Ok(())
    }

    fn gen_float_binary(
        &mut self,
        op: BinaryOp,
        ty: &Rc<Type>,
        tok: &crate::token::Token,
    ) -> Result<()> {
        let single = ty.size() == 4;
        let fd = self.freg(self.top - 2)?;
        let fs = self.freg(self.top - 1)?;
        let i = self.top - 2;
        self.top -= 1;

        let suffixed = |base: &str| -> String {
            format!("{}{}", base, if single { "ss" } else { "sd" })
        };

        match op {
            BinaryOp::Add => writeln!(self.out, "  {} {}, {}", suffixed("add"), fd, fs)?,
            BinaryOp::Sub => writeln!(self.out, "  {} {}, {}", suffixed("sub"), fd, fs)?,
            BinaryOp::Mul => writeln!(self.out, "  {} {}, {}", suffixed("mul"), fd, fs)?,
            BinaryOp::Div => writeln!(self.out, "  {} {}, {}", suffixed("div"), fd, fs)?,
            BinaryOp::Eq | BinaryOp::Ne | BinaryOp::Lt | BinaryOp::Le => {
                // Unordered compare; NaN operands take the unordered paths.
                let cmp = if single { "ucomiss" } else { "ucomisd" };
                writeln!(self.out, "  {} {}, {}", cmp, fd, fs)?;
                let cc = match op {
                    BinaryOp::Eq => "sete",
                    BinaryOp::Ne => "setne",
                    BinaryOp::Lt => "setb",
                    BinaryOp::Le => "setbe",
                    _ => unreachable!(),
                };
                writeln!(self.out, "  {} al", cc)?;
                writeln!(self.out, "  movzx {}, al", GP64[i])?;
            }
            _ => {
                return Err(CompileError::at_token(tok, "invalid operands"));
            }
        }
        Ok(())
    }

    fn gen_funcall(&mut self, node: &Node, name: &str, args: &[VarRef]) -> Result<()> {
        // r10 and r11 are caller-saved halves of the register stack.
        writeln!(self.out, "  push r10")?;
        writeln!(self.out, "  push r11")?;

        let mut gp = 0usize;
        let mut fp = 0usize;
        for var in args {
            let v = var.borrow();
            if is_fp(&v.ty) {
                writeln!(
                    self.out,
                    "  {} xmm{}, [rbp-{}]",
                    fmov(&v.ty),
                    fp,
                    v.offset
                )?;
                fp += 1;
                continue;
            }
            match (v.ty.size(), v.ty.is_unsigned) {
                (1, false) => writeln!(
                    self.out,
                    "  movsx {}, byte ptr [rbp-{}]",
                    ARG32[gp], v.offset
                )?,
                (1, true) => writeln!(
                    self.out,
                    "  movzx {}, byte ptr [rbp-{}]",
                    ARG32[gp], v.offset
                )?,
                (2, false) => writeln!(
                    self.out,
                    "  movsx {}, word ptr [rbp-{}]",
                    ARG32[gp], v.offset
                )?,
                (2, true) => writeln!(
                    self.out,
                    "  movzx {}, word ptr [rbp-{}]",
                    ARG32[gp], v.offset
                )?,
                (4, _) => writeln!(
                    self.out,
                    "  mov {}, dword ptr [rbp-{}]",
                    ARG32[gp], v.offset
                )?,
                _ => writeln!(self.out, "  mov {}, [rbp-{}]", ARG64[gp], v.offset)?,
            }
            gp += 1;
        }

        // rax holds the number of vector arguments for variadic callees.
        writeln!(self.out, "  mov rax, {}", fp)?;
        writeln!(self.out, "  call {}", name)?;
        writeln!(self.out, "  pop r11")?;
        writeln!(self.out, "  pop r10")?;

        let ret = node.ty();
        if matches!(ret.kind, TypeKind::Bool) {
            // Callees only guarantee the low byte of a _Bool.
            writeln!(self.out, "  movzx eax, al")?;
        }
        if is_fp(ret) {
            writeln!(self.out, "  {} {}, xmm0", fmov(ret), self.freg(self.top)?)?;
        } else {
            writeln!(self.out, "  mov {}, rax", self.reg(self.top)?)?;
        }
        self.top += 1;
        Ok(())
    }

    /// `__builtin_va_start(ap)`: fill in the va_list fields from the
    /// current frame. The register save area sits at rbp-80; the first
    /// stack-passed argument at rbp+16.
    fn gen_va_start(&mut self, ap: &Node) -> Result<()> {
        self.gen_expr(ap)?;
        let r = self.reg(self.top - 1)?;
        let gp = self
            .current_fn
            .as_ref()
            .map(|f| f.gp_params)
            .unwrap_or(0);

        writeln!(self.out, "  mov dword ptr [{}], {}", r, gp * 8)?;
        // Floating arguments are not register-saved; mark them exhausted.
        writeln!(self.out, "  mov dword ptr [{}+4], 176", r)?;
        writeln!(self.out, "  lea rax, [rbp+16]")?;
        writeln!(self.out, "  mov [{}+8], rax", r)?;
        writeln!(self.out, "  lea rax, [rbp-80]")?;
        writeln!(self.out, "  mov [{}+16], rax", r)?;
        Ok(())
    }
}
