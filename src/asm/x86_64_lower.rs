//! IR lowering for x86-64.
//!
//! Maps one method's fragment tree onto encoded instructions. Register
//! allocation is local and simple: variables take callee-saved registers
//! (RBX, R12-R15) on first appearance and spill to frame slots beyond
//! that; `%`-pinned variables bypass allocation entirely. R11 and RAX are
//! the lowering scratch pair and are never allocated.
//!
//! # Frame shape
//!
//! ```text
//! [rbp]       saved rbp
//! [rbp-8]     saved rbx        ─┐ every method preserves the whole
//! [rbp-16..40] saved r12-r15   ─┘ allocation pool
//! [rbp-48-8i] spill slot i       (frame reserve patched after the body)
//! [rsp...]    active WithStackSlot regions, innermost at rsp
//! ```
//!
//! Stack slots are addressed relative to RSP, so the lowerer tracks the
//! stack of active slots and converts slot offsets as it goes. `Return`
//! jumps to a single epilogue that rewinds RSP through RBP, which keeps
//! the stack balanced no matter how deep in a slot nest it fires.
//!
//! # Syscall convention
//!
//! `syscall` number in RAX, arguments in RDI, RSI, RDX, R10, R8, R9,
//! return in RAX. Argument setup is a parallel move with cycle breaking
//! through R11, so pinned sources already sitting in argument registers
//! sequence correctly.

use super::x86_64::{self as enc, Alu, Cc, Gpr};
use super::{AsmError, Assembler, Section};
use crate::ir::{
    CmpKind, Fragment, MemBase, MemRef, OpKind, Reg, SyscallNum, Test, Value, Var, Width,
};

/// Allocation pool: callee-saved, so syscalls, helper calls, and method
/// calls never disturb allocated variables.
const POOL: [Gpr; 5] = [Gpr::Rbx, Gpr::R12, Gpr::R13, Gpr::R14, Gpr::R15];

/// Syscall argument registers in positional order.
const SYSCALL_ARGS: [Gpr; 6] = [Gpr::Rdi, Gpr::Rsi, Gpr::Rdx, Gpr::R10, Gpr::R8, Gpr::R9];

/// Primary and secondary lowering scratch.
const SCRATCH: Gpr = Gpr::R11;
const SCRATCH2: Gpr = Gpr::Rax;

#[derive(Debug, Clone, Copy, PartialEq, Eq)]
enum Loc {
    Reg(Gpr),
    /// Index into the frame spill area at `[rbp - 48 - 8*i]`.
    Spill(usize),
}

struct MethodCtx<'a> {
    method: &'a str,
    vars: Vec<(String, Loc)>,
    next_pool: usize,
    spill_count: usize,
    /// Active stack slots, outermost first, with 16-byte-rounded sizes.
    slots: Vec<(String, u64)>,
    epilogue: String,
}

impl<'a> MethodCtx<'a> {
    fn err(&self, detail: impl Into<String>) -> AsmError {
        AsmError::Lowering {
            method: self.method.to_string(),
            detail: detail.into(),
        }
    }

    /// Location of a variable, allocating on first appearance.
    fn loc_of(&mut self, var: &Var) -> Result<Loc, AsmError> {
        if let Some(reg) = var.pinned_reg() {
            return Ok(Loc::Reg(gpr(reg).map_err(|d| self.err(d))?));
        }
        if let Some((_, loc)) = self.vars.iter().find(|(n, _)| *n == var.name) {
            return Ok(*loc);
        }
        let loc = if self.next_pool < POOL.len() {
            let r = POOL[self.next_pool];
            self.next_pool += 1;
            Loc::Reg(r)
        } else {
            let i = self.spill_count;
            self.spill_count += 1;
            Loc::Spill(i)
        };
        self.vars.push((var.name.clone(), loc));
        Ok(loc)
    }

    fn spill_disp(i: usize) -> i32 {
        -48 - 8 * i as i32
    }

    /// RSP-relative offset of a named active slot.
    fn slot_sp_offset(&self, name: &str) -> Result<i64, AsmError> {
        let pos = self
            .slots
            .iter()
            .rposition(|(n, _)| n == name)
            .ok_or_else(|| self.err(format!("stack slot {name} is not active here")))?;
        Ok(self.slots[pos + 1..].iter().map(|(_, s)| *s as i64).sum())
    }
}

fn gpr(r: Reg) -> Result<Gpr, String> {
    Ok(match r {
        Reg::Rax => Gpr::Rax,
        Reg::Rbx => Gpr::Rbx,
        Reg::Rcx => Gpr::Rcx,
        Reg::Rdx => Gpr::Rdx,
        Reg::Rsi => Gpr::Rsi,
        Reg::Rdi => Gpr::Rdi,
        Reg::Rsp => Gpr::Rsp,
        Reg::Rbp => Gpr::Rbp,
        Reg::R8 => Gpr::R8,
        Reg::R9 => Gpr::R9,
        Reg::R10 => Gpr::R10,
        Reg::R11 => Gpr::R11,
        Reg::R12 => Gpr::R12,
        Reg::R13 => Gpr::R13,
        Reg::R14 => Gpr::R14,
        Reg::R15 => Gpr::R15,
        other => return Err(format!("register {} is not an x86-64 GPR", other.name())),
    })
}

/// Lower one method into the assembler. The method entry label is its
/// bare name, which is what `CallMethod` branches to.
pub(super) fn lower_method(
    asm: &mut Assembler,
    method: &str,
    body: &[Fragment],
) -> Result<(), AsmError> {
    asm.bind_label(method)?;

    let mut ctx = MethodCtx {
        method,
        vars: Vec::new(),
        next_pool: 0,
        spill_count: 0,
        slots: Vec::new(),
        epilogue: asm.fresh_label(method, "epilogue"),
    };

    // Prologue: frame pointer, pool saves, frame reserve (patched below).
    asm.emit(&enc::push(Gpr::Rbp));
    asm.emit(&enc::mov_rr(Gpr::Rbp, Gpr::Rsp));
    for r in POOL {
        asm.emit(&enc::push(r));
    }
    let reserve = enc::alu_ri(Alu::Sub, Gpr::Rsp, 0x7fff_ffff);
    let reserve_at = asm.offset() + reserve.len() - 4;
    asm.emit(&reserve);

    lower_body(asm, &mut ctx, body)?;

    // Epilogue: rewind RSP through RBP so slot nests and spills unwind
    // together, restore the pool, return.
    asm.bind_label(&ctx.epilogue)?;
    asm.emit(&enc::lea(Gpr::Rsp, Gpr::Rbp, -40));
    for r in POOL.iter().rev() {
        asm.emit(&enc::pop(*r));
    }
    asm.emit(&enc::pop(Gpr::Rbp));
    asm.emit(&enc::ret());

    let frame = (ctx.spill_count as u32 * 8 + 15) & !15;
    asm.patch_text_u32(reserve_at, frame);
    Ok(())
}

fn lower_body(asm: &mut Assembler, ctx: &mut MethodCtx, body: &[Fragment]) -> Result<(), AsmError> {
    for frag in body {
        lower_fragment(asm, ctx, frag)?;
    }
    Ok(())
}

fn lower_fragment(
    asm: &mut Assembler,
    ctx: &mut MethodCtx,
    frag: &Fragment,
) -> Result<(), AsmError> {
    match frag {
        Fragment::Assign { dst, src } => lower_assign(asm, ctx, dst, src),
        Fragment::Op {
            kind,
            dst,
            left,
            right,
        } => lower_op(asm, ctx, *kind, dst, left, right),
        Fragment::If {
            test,
            then_body,
            else_body,
        } => lower_if(asm, ctx, test, then_body, else_body),
        Fragment::Syscall { num, args, ret } => lower_syscall(asm, ctx, num, args, ret.as_ref()),
        Fragment::Return { value } => {
            read_into(asm, ctx, value, Gpr::Rax)?;
            emit_jmp(asm, &ctx.epilogue.clone());
            Ok(())
        }
        Fragment::Call { target } => {
            let t = read_value(asm, ctx, target, SCRATCH)?;
            asm.emit(&enc::call_r(t));
            Ok(())
        }
        Fragment::CallMethod { name } => {
            let insn = enc::call_rel32();
            let at = asm.offset() + 1;
            let end = asm.offset() + insn.len();
            asm.emit(&insn);
            asm.fixup_rel32(at, end, name);
            Ok(())
        }
        Fragment::Goto(label) => {
            emit_jmp(asm, &qualify(ctx.method, &label.0));
            Ok(())
        }
        Fragment::DeclareLabel { label, body } => {
            asm.bind_label(&qualify(ctx.method, &label.0))?;
            lower_body(asm, ctx, body)
        }
        Fragment::LoadConstantBytes {
            data,
            zero_terminate,
            pointer,
            length,
        } => {
            let off = asm.intern_constant(data, *zero_terminate);
            emit_const_pointer(asm, ctx, off, pointer)?;
            if let Some(len_var) = length {
                let len = data.len() as i64 + *zero_terminate as i64;
                let loc = ctx.loc_of(len_var)?;
                match loc {
                    Loc::Reg(r) => asm.emit(&enc::mov_ri(r, len)),
                    Loc::Spill(i) => {
                        asm.emit(&enc::mov_ri(SCRATCH, len));
                        asm.emit(&enc::store(
                            Width::W64,
                            Gpr::Rbp,
                            MethodCtx::spill_disp(i),
                            SCRATCH,
                        ));
                    }
                }
            }
            Ok(())
        }
        Fragment::WithStackSlot { name, size, body } => {
            let rounded = (*size + 15) & !15;
            asm.emit(&enc::alu_ri(Alu::Sub, Gpr::Rsp, rounded as i32));
            ctx.slots.push((name.clone(), rounded));
            lower_body(asm, ctx, body)?;
            ctx.slots.pop();
            asm.emit(&enc::alu_ri(Alu::Add, Gpr::Rsp, rounded as i32));
            Ok(())
        }
        // Coherent I/D caches: stores from this thread are visible to
        // its own instruction fetch after the indirect call's implicit
        // serialization.
        Fragment::FlushICache { .. } => Ok(()),
        Fragment::Halt => {
            asm.emit(&enc::hlt());
            Ok(())
        }
        Fragment::Hvc { .. } => Err(ctx.err("hvc is an AArch64 instruction")),
        Fragment::Printf { .. } => Err(ctx.err("printf must be expanded before lowering")),
    }
}

/// Branch to a label, short form when the (backward) target is in range.
fn emit_jmp(asm: &mut Assembler, target: &str) {
    if let Some(bound) = asm.label_offset(target) {
        let disp = bound as i64 - (asm.offset() as i64 + 2);
        if i8::try_from(disp).is_ok() {
            let at = asm.offset() + 1;
            asm.emit(&enc::jmp_rel8());
            asm.fixup_rel8(at, at + 1, target);
            return;
        }
    }
    let insn = enc::jmp_rel32();
    let at = asm.offset() + 1;
    let end = asm.offset() + insn.len();
    asm.emit(&insn);
    asm.fixup_rel32(at, end, target);
}

/// Forward conditional branch (synthetic targets are always ahead).
fn emit_jcc(asm: &mut Assembler, cc: Cc, target: &str) {
    let insn = enc::jcc_rel32(cc);
    let at = asm.offset() + 2;
    let end = asm.offset() + insn.len();
    asm.emit(&insn);
    asm.fixup_rel32(at, end, target);
}

fn qualify(method: &str, label: &str) -> String {
    format!("{method}.{label}")
}

/// Read a value into some register, using `scratch` when the value is not
/// already register-resident. Returns the register holding the value.
fn read_value(
    asm: &mut Assembler,
    ctx: &mut MethodCtx,
    value: &Value,
    scratch: Gpr,
) -> Result<Gpr, AsmError> {
    match value {
        Value::Var(v) => match ctx.loc_of(v)? {
            Loc::Reg(r) => Ok(r),
            Loc::Spill(i) => {
                asm.emit(&enc::load(
                    Width::W64,
                    scratch,
                    Gpr::Rbp,
                    MethodCtx::spill_disp(i),
                ));
                Ok(scratch)
            }
        },
        Value::Reg(r) => gpr(*r).map_err(|d| ctx.err(d)),
        Value::Int(v) => {
            asm.emit(&enc::mov_ri(scratch, *v));
            Ok(scratch)
        }
        Value::Mem(m) => {
            let (base, disp) = resolve_mem(asm, ctx, m, scratch)?;
            asm.emit(&enc::load(m.width, scratch, base, disp));
            Ok(scratch)
        }
        Value::SlotAddr { slot, disp } => {
            let off = ctx.slot_sp_offset(slot)? + *disp as i64;
            let off = i32::try_from(off).map_err(|_| ctx.err("slot offset out of range"))?;
            asm.emit(&enc::lea(scratch, Gpr::Rsp, off));
            Ok(scratch)
        }
        Value::Str(_) => Err(ctx.err("string literals are only syscall or printf arguments")),
    }
}

/// Read a value into a specific register.
fn read_into(
    asm: &mut Assembler,
    ctx: &mut MethodCtx,
    value: &Value,
    dst: Gpr,
) -> Result<(), AsmError> {
    let r = read_value(asm, ctx, value, dst)?;
    if r != dst {
        asm.emit(&enc::mov_rr(dst, r));
    }
    Ok(())
}

/// Resolve a memory operand to `(base register, displacement)`.
fn resolve_mem(
    asm: &mut Assembler,
    ctx: &mut MethodCtx,
    m: &MemRef,
    scratch: Gpr,
) -> Result<(Gpr, i32), AsmError> {
    match &m.base {
        MemBase::Var(v) => {
            let base = read_value(asm, ctx, &Value::Var(v.clone()), scratch)?;
            Ok((base, m.disp))
        }
        MemBase::Reg(r) => Ok((gpr(*r).map_err(|d| ctx.err(d))?, m.disp)),
        MemBase::Slot(name) => {
            let off = ctx.slot_sp_offset(name)? + m.disp as i64;
            let off = i32::try_from(off).map_err(|_| ctx.err("slot offset out of range"))?;
            Ok((Gpr::Rsp, off))
        }
    }
}

/// Store a register into a variable's location.
fn write_var(
    asm: &mut Assembler,
    ctx: &mut MethodCtx,
    var: &Var,
    src: Gpr,
) -> Result<(), AsmError> {
    match ctx.loc_of(var)? {
        Loc::Reg(r) => {
            if r != src {
                asm.emit(&enc::mov_rr(r, src));
            }
        }
        Loc::Spill(i) => {
            asm.emit(&enc::store(
                Width::W64,
                Gpr::Rbp,
                MethodCtx::spill_disp(i),
                src,
            ));
        }
    }
    Ok(())
}

fn lower_assign(
    asm: &mut Assembler,
    ctx: &mut MethodCtx,
    dst: &Value,
    src: &Value,
) -> Result<(), AsmError> {
    match dst {
        Value::Var(v) => {
            // Immediates straight into register destinations.
            if let (Value::Int(imm), Loc::Reg(r)) = (src, ctx.loc_of(v)?) {
                asm.emit(&enc::mov_ri(r, *imm));
                return Ok(());
            }
            let s = read_value(asm, ctx, src, SCRATCH)?;
            write_var(asm, ctx, v, s)
        }
        Value::Reg(r) => {
            let d = gpr(*r).map_err(|e| ctx.err(e))?;
            read_into(asm, ctx, src, d)
        }
        Value::Mem(m) => {
            let s = read_value(asm, ctx, src, SCRATCH2)?;
            let (base, disp) = resolve_mem(asm, ctx, m, SCRATCH)?;
            asm.emit(&enc::store(m.width, base, disp, s));
            Ok(())
        }
        Value::Int(_) | Value::Str(_) | Value::SlotAddr { .. } => {
            Err(ctx.err("assignment destination must be a variable, register, or memory operand"))
        }
    }
}

fn lower_op(
    asm: &mut Assembler,
    ctx: &mut MethodCtx,
    kind: OpKind,
    dst: &Var,
    left: &Value,
    right: &Value,
) -> Result<(), AsmError> {
    // Trivial folding only: both sides literal.
    if let (Value::Int(l), Value::Int(r)) = (left, right) {
        if let Some(folded) = fold(kind, *l, *r) {
            return lower_assign(asm, ctx, &Value::Var(dst.clone()), &Value::Int(folded));
        }
    }

    // Work in a register; spilled destinations go through SCRATCH2.
    let dloc = ctx.loc_of(dst)?;
    let d = match dloc {
        Loc::Reg(r) => r,
        Loc::Spill(_) => SCRATCH2,
    };

    match kind {
        OpKind::Add | OpKind::Sub | OpKind::And | OpKind::Or | OpKind::Xor => {
            let alu = match kind {
                OpKind::Add => Alu::Add,
                OpKind::Sub => Alu::Sub,
                OpKind::And => Alu::And,
                OpKind::Or => Alu::Or,
                _ => Alu::Xor,
            };
            match right {
                Value::Int(imm) if i32::try_from(*imm).is_ok() => {
                    read_into(asm, ctx, left, d)?;
                    asm.emit(&enc::alu_ri(alu, d, *imm as i32));
                }
                _ => {
                    // Right first, so a right-hand read of dst still sees
                    // the old value.
                    let r = read_value(asm, ctx, right, SCRATCH)?;
                    read_into(asm, ctx, left, d)?;
                    asm.emit(&enc::alu_rr(alu, d, r));
                }
            }
        }
        OpKind::Mul => {
            let r = read_value(asm, ctx, right, SCRATCH)?;
            read_into(asm, ctx, left, d)?;
            asm.emit(&enc::imul_rr(d, r));
        }
        OpKind::Div => {
            // IDIV wants the dividend in RDX:RAX and clobbers both.
            let divisor = read_value(asm, ctx, right, SCRATCH)?;
            let divisor = if divisor == Gpr::Rax || divisor == Gpr::Rdx {
                asm.emit(&enc::mov_rr(SCRATCH, divisor));
                SCRATCH
            } else {
                divisor
            };
            read_into(asm, ctx, left, Gpr::Rax)?;
            asm.emit(&enc::cqo());
            asm.emit(&enc::idiv(divisor));
            if d != Gpr::Rax {
                asm.emit(&enc::mov_rr(d, Gpr::Rax));
            }
        }
        OpKind::Shl | OpKind::Shr => match right {
            Value::Int(imm) => {
                let imm = u8::try_from(*imm).map_err(|_| ctx.err("shift count out of range"))?;
                read_into(asm, ctx, left, d)?;
                let bytes = if kind == OpKind::Shl {
                    enc::shl_ri(d, imm)?
                } else {
                    enc::shr_ri(d, imm)?
                };
                asm.emit(&bytes);
            }
            _ => {
                if d == Gpr::Rcx {
                    return Err(ctx.err("variable shift cannot target rcx"));
                }
                read_into(asm, ctx, right, Gpr::Rcx)?;
                read_into(asm, ctx, left, d)?;
                asm.emit(&if kind == OpKind::Shl {
                    enc::shl_cl(d)
                } else {
                    enc::shr_cl(d)
                });
            }
        },
    }

    if let Loc::Spill(i) = dloc {
        asm.emit(&enc::store(
            Width::W64,
            Gpr::Rbp,
            MethodCtx::spill_disp(i),
            d,
        ));
    }
    Ok(())
}

fn fold(kind: OpKind, l: i64, r: i64) -> Option<i64> {
    Some(match kind {
        OpKind::Add => l.wrapping_add(r),
        OpKind::Sub => l.wrapping_sub(r),
        OpKind::Mul => l.wrapping_mul(r),
        OpKind::Div => {
            if r == 0 {
                return None;
            }
            l.wrapping_div(r)
        }
        OpKind::Shl => l.wrapping_shl(r as u32),
        OpKind::Shr => ((l as u64).wrapping_shr(r as u32)) as i64,
        OpKind::And => l & r,
        OpKind::Or => l | r,
        OpKind::Xor => l ^ r,
    })
}

fn lower_if(
    asm: &mut Assembler,
    ctx: &mut MethodCtx,
    test: &Test,
    then_body: &[Fragment],
    else_body: &[Fragment],
) -> Result<(), AsmError> {
    let else_label = asm.fresh_label(ctx.method, "else");
    let end_label = asm.fresh_label(ctx.method, "end");
    let skip_target = if else_body.is_empty() {
        &end_label
    } else {
        &else_label
    };

    // Branch to the skip target when the test FAILS.
    let cc = match test {
        Test::Cmp { kind, left, right } => {
            let l = read_value(asm, ctx, left, SCRATCH)?;
            match right {
                Value::Int(imm) if i32::try_from(*imm).is_ok() => {
                    asm.emit(&enc::alu_ri(Alu::Cmp, l, *imm as i32));
                }
                _ => {
                    let r = read_value(asm, ctx, right, SCRATCH2)?;
                    asm.emit(&enc::alu_rr(Alu::Cmp, l, r));
                }
            }
            match kind {
                CmpKind::Equal => Cc::Ne,
                CmpKind::NotEqual => Cc::E,
                CmpKind::Less => Cc::Ge,
                CmpKind::LessOrEqual => Cc::G,
                CmpKind::Greater => Cc::Le,
                CmpKind::GreaterOrEqual => Cc::L,
            }
        }
        Test::IsZero(v) => {
            let r = read_value(asm, ctx, v, SCRATCH)?;
            asm.emit(&enc::test_rr(r, r));
            Cc::Ne
        }
        Test::IsNegative(v) => {
            let r = read_value(asm, ctx, v, SCRATCH)?;
            asm.emit(&enc::test_rr(r, r));
            Cc::Ns
        }
    };
    emit_jcc(asm, cc, skip_target);

    lower_body(asm, ctx, then_body)?;
    if !else_body.is_empty() {
        emit_jmp(asm, &end_label);
        asm.bind_label(&else_label)?;
        lower_body(asm, ctx, else_body)?;
    }
    asm.bind_label(&end_label)?;
    Ok(())
}

/// Source classes for the syscall-argument parallel move.
enum MoveSrc {
    Imm(i64),
    Reg(Gpr),
    Mem { base: Gpr, disp: i32, width: Width },
    SlotAddr(i32),
    ConstPtr(usize),
}

impl MoveSrc {
    fn reads(&self) -> Option<Gpr> {
        match self {
            MoveSrc::Reg(r) => Some(*r),
            MoveSrc::Mem { base, .. } => Some(*base),
            _ => None,
        }
    }
}

fn lower_syscall(
    asm: &mut Assembler,
    ctx: &mut MethodCtx,
    num: &SyscallNum,
    args: &[Value],
    ret: Option<&Var>,
) -> Result<(), AsmError> {
    if args.len() > SYSCALL_ARGS.len() {
        return Err(ctx.err(format!("syscall takes at most 6 arguments, got {}", args.len())));
    }

    // Classify sources without emitting (spills load at move time through
    // their target register, which is free by then).
    let mut moves: Vec<(Gpr, MoveSrc)> = Vec::with_capacity(args.len());
    for (i, arg) in args.iter().enumerate() {
        let target = SYSCALL_ARGS[i];
        let src = match arg {
            Value::Int(v) => MoveSrc::Imm(*v),
            Value::Str(s) => MoveSrc::ConstPtr(asm.intern_constant(s.as_bytes(), true)),
            Value::Reg(r) => MoveSrc::Reg(gpr(*r).map_err(|d| ctx.err(d))?),
            Value::Var(v) => match ctx.loc_of(v)? {
                Loc::Reg(r) => MoveSrc::Reg(r),
                Loc::Spill(i) => MoveSrc::Mem {
                    base: Gpr::Rbp,
                    disp: MethodCtx::spill_disp(i),
                    width: Width::W64,
                },
            },
            Value::Mem(m) => {
                let (base, disp) = resolve_mem_for_move(ctx, m)?;
                MoveSrc::Mem {
                    base,
                    disp,
                    width: m.width,
                }
            }
            Value::SlotAddr { slot, disp } => {
                let off = ctx.slot_sp_offset(slot)? + *disp as i64;
                MoveSrc::SlotAddr(
                    i32::try_from(off).map_err(|_| ctx.err("slot offset out of range"))?,
                )
            }
        };
        moves.push((target, src));
    }

    // Parallel move: emit any move whose target no pending source still
    // reads; break cycles by parking the blocked target in R11.
    while !moves.is_empty() {
        let ready = moves.iter().position(|(dst, _)| {
            !moves
                .iter()
                .any(|(_, src)| src.reads() == Some(*dst))
        });
        match ready {
            Some(i) => {
                let (dst, src) = moves.remove(i);
                emit_move(asm, dst, &src);
            }
            None => {
                let parked = moves[0].0;
                asm.emit(&enc::mov_rr(SCRATCH, parked));
                for (_, src) in moves.iter_mut() {
                    match src {
                        MoveSrc::Reg(r) if *r == parked => *r = SCRATCH,
                        MoveSrc::Mem { base, .. } if *base == parked => *base = SCRATCH,
                        _ => {}
                    }
                }
            }
        }
    }

    let n = match num {
        SyscallNum::Sym(sys) => sys.number(crate::ir::Arch::X86_64),
        SyscallNum::Raw(n) => *n,
    };
    asm.emit(&enc::mov_ri(Gpr::Rax, n as i64));
    asm.emit(&enc::syscall());

    if let Some(ret_var) = ret {
        write_var(asm, ctx, ret_var, Gpr::Rax)?;
    }
    Ok(())
}

fn emit_move(asm: &mut Assembler, dst: Gpr, src: &MoveSrc) {
    match src {
        MoveSrc::Imm(v) => asm.emit(&enc::mov_ri(dst, *v)),
        MoveSrc::Reg(r) => {
            if *r != dst {
                asm.emit(&enc::mov_rr(dst, *r));
            }
        }
        MoveSrc::Mem { base, disp, width } => asm.emit(&enc::load(*width, dst, *base, *disp)),
        MoveSrc::SlotAddr(off) => asm.emit(&enc::lea(dst, Gpr::Rsp, *off)),
        MoveSrc::ConstPtr(off) => {
            let insn = enc::mov_ri64(dst);
            let imm_at = asm.offset() + (insn.len() - 8);
            asm.emit(&insn);
            asm.patch_pointer(Section::Text, imm_at, Section::ConstData, *off);
        }
    }
}

/// Memory operands in syscall position may not read variables that spill
/// (the base must already be a register); this keeps the move sequencer
/// free of nested emissions.
fn resolve_mem_for_move(ctx: &mut MethodCtx, m: &MemRef) -> Result<(Gpr, i32), AsmError> {
    match &m.base {
        MemBase::Var(v) => match ctx.loc_of(v)? {
            Loc::Reg(r) => Ok((r, m.disp)),
            Loc::Spill(_) => Err(ctx.err(
                "memory syscall argument with a spilled base; copy it to a variable first",
            )),
        },
        MemBase::Reg(r) => Ok((gpr(*r).map_err(|d| ctx.err(d))?, m.disp)),
        MemBase::Slot(name) => {
            let off = ctx.slot_sp_offset(name)? + m.disp as i64;
            Ok((
                Gpr::Rsp,
                i32::try_from(off).map_err(|_| ctx.err("slot offset out of range"))?,
            ))
        }
    }
}

fn emit_const_pointer(
    asm: &mut Assembler,
    ctx: &mut MethodCtx,
    data_off: usize,
    pointer: &Var,
) -> Result<(), AsmError> {
    let loc = ctx.loc_of(pointer)?;
    let target = match loc {
        Loc::Reg(r) => r,
        Loc::Spill(_) => SCRATCH,
    };
    let insn = enc::mov_ri64(target);
    let imm_at = asm.offset() + (insn.len() - 8);
    asm.emit(&insn);
    asm.patch_pointer(Section::Text, imm_at, Section::ConstData, data_off);
    if let Loc::Spill(i) = loc {
        asm.emit(&enc::store(
            Width::W64,
            Gpr::Rbp,
            MethodCtx::spill_disp(i),
            SCRATCH,
        ));
    }
    Ok(())
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::ir::{self, Arch};

    fn build(p: &ir::Program) -> super::super::Assembled {
        super::super::build_standalone_program_for_arch(Arch::X86_64, p).unwrap()
    }

    #[test]
    fn test_addition_program_assembles() {
        let mut p = ir::Program::new("main");
        p.method(
            "main",
            vec![
                ir::assign(ir::reg(Reg::Rax), ir::int(40)),
                ir::op(OpKind::Add, "%rax", ir::reg(Reg::Rax), ir::int(2)),
                Fragment::Halt,
            ],
        );
        let out = build(&p);
        assert!(out.code.windows(1).any(|w| w == [0xf4])); // hlt present
        assert!(out.relocations.is_empty());
    }

    #[test]
    fn test_deterministic_build() {
        let mut p = ir::Program::new("main");
        p.method(
            "main",
            vec![
                ir::load_constant_bytes(b"Hello, World!".to_vec(), true, "msg", Some("len")),
                ir::syscall(ir::Sys::Write, vec![ir::int(1), ir::var("msg"), ir::var("len")]),
                ir::ret(ir::int(0)),
            ],
        );
        assert_eq!(build(&p), build(&p));
    }

    #[test]
    fn test_constant_pointer_relocation() {
        let mut p = ir::Program::new("main");
        p.method(
            "main",
            vec![
                ir::load_constant_bytes(b"hi".to_vec(), true, "msg", None),
                ir::ret(ir::var("msg")),
            ],
        );
        let out = build(&p);
        assert_eq!(out.relocations.len(), 1);
        let at = out.relocations[0] as usize;
        let slot = u64::from_le_bytes(out.code[at..at + 8].try_into().unwrap());
        assert_eq!(&out.code[slot as usize..slot as usize + 3], b"hi\0");
    }

    #[test]
    fn test_string_syscall_arg_embeds_blob() {
        let mut p = ir::Program::new("main");
        p.method(
            "main",
            vec![
                ir::syscall(
                    ir::Sys::Write,
                    vec![ir::int(1), ir::str_lit("hi"), ir::int(2)],
                ),
                ir::ret(ir::int(7)),
            ],
        );
        let out = build(&p);
        assert_eq!(out.relocations.len(), 1);
        let tail = &out.code[out.code.len() - 3..];
        assert_eq!(tail, b"hi\0");
    }

    #[test]
    fn test_six_syscall_args() {
        let mut p = ir::Program::new("main");
        p.method(
            "main",
            vec![
                ir::syscall(
                    ir::Sys::Mmap,
                    vec![
                        ir::int(0),
                        ir::int(4096),
                        ir::int(7),
                        ir::int(0x22),
                        ir::int(-1),
                        ir::int(0),
                    ],
                ),
                ir::ret(ir::int(0)),
            ],
        );
        build(&p);
    }

    #[test]
    fn test_zero_arg_syscall() {
        let mut p = ir::Program::new("main");
        p.method("main", vec![ir::syscall(ir::Sys::Getpid, vec![]), ir::ret(ir::int(0))]);
        build(&p);
    }

    #[test]
    fn test_syscall_arg_cycle_sequences() {
        // rsi -> rdi and rdi -> rsi is a swap cycle; the parallel move
        // must pass through scratch rather than clobber.
        let mut p = ir::Program::new("main");
        p.method(
            "main",
            vec![
                ir::syscall(
                    ir::Sys::Write,
                    vec![ir::reg(Reg::Rsi), ir::reg(Reg::Rdi), ir::int(1)],
                ),
                ir::ret(ir::int(0)),
            ],
        );
        let out = build(&p);
        // mov r11, rdi must appear before the rdi<-rsi move: 49 89 fb.
        assert!(out
            .code
            .windows(3)
            .any(|w| w == [0x49, 0x89, 0xfb]));
    }

    #[test]
    fn test_spill_beyond_pool() {
        let mut p = ir::Program::new("main");
        let mut body = Vec::new();
        for i in 0..12 {
            body.push(ir::assign(ir::var(&format!("v{i}")), ir::int(i)));
        }
        // Sum them all so every variable is read back.
        body.push(ir::assign(ir::var("acc"), ir::int(0)));
        for i in 0..12 {
            body.push(ir::op(
                OpKind::Add,
                "acc",
                ir::var("acc"),
                ir::var(&format!("v{i}")),
            ));
        }
        body.push(ir::ret(ir::var("acc")));
        p.method("main", body);
        build(&p);
    }

    #[test]
    fn test_stack_slot_balance() {
        // The SUB and ADD around a slot body must use the same rounded
        // size, and nesting must stack.
        let mut p = ir::Program::new("main");
        p.method(
            "main",
            vec![ir::with_stack_slot(
                "outer",
                24,
                vec![ir::with_stack_slot(
                    "inner",
                    8,
                    vec![
                        ir::assign(ir::slot_at("inner", 0, Width::W64), ir::int(1)),
                        ir::assign(ir::slot_at("outer", 0, Width::W64), ir::int(2)),
                    ],
                )],
            ), ir::ret(ir::int(0))],
        );
        let out = build(&p);
        // 24 rounds to 32, 8 rounds to 16.
        let sub32 = [0x48, 0x83, 0xec, 32];
        let add32 = [0x48, 0x83, 0xc4, 32];
        let sub16 = [0x48, 0x83, 0xec, 16];
        let add16 = [0x48, 0x83, 0xc4, 16];
        for pat in [sub32, add32, sub16, add16] {
            assert!(
                out.code.windows(4).any(|w| w == pat),
                "missing {:02x?}",
                pat
            );
        }
    }

    #[test]
    fn test_undefined_goto_fails() {
        let mut p = ir::Program::new("main");
        p.method("main", vec![ir::goto("nowhere")]);
        assert!(matches!(
            super::super::build_standalone_program_for_arch(Arch::X86_64, &p),
            Err(AsmError::UndefinedLabel(_))
        ));
    }

    #[test]
    fn test_if_reunifies() {
        let mut p = ir::Program::new("main");
        p.method(
            "main",
            vec![
                ir::assign(ir::var("a"), ir::int(1)),
                ir::if_else(
                    ir::cmp(CmpKind::Equal, ir::var("a"), ir::int(1)),
                    vec![ir::assign(ir::var("b"), ir::int(10))],
                    vec![ir::assign(ir::var("b"), ir::int(20))],
                ),
                ir::ret(ir::var("b")),
            ],
        );
        build(&p);
    }

    #[test]
    fn test_printf_lowers_via_expansion() {
        let mut p = ir::Program::new("main");
        p.method(
            "main",
            vec![ir::printf("value=%d\n", vec![ir::int(42)]), ir::ret(ir::int(0))],
        );
        let out = build(&p);
        // The decimal helper got linked in: there is more than one method
        // worth of code and at least one CALL rel32.
        assert!(out.code.len() > 64);
        assert!(out.code.contains(&0xe8));
    }
}
