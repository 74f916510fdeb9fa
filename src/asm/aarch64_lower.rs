//! IR lowering for AArch64.
//!
//! Counterpart of the x86-64 pass with the same allocation policy:
//! variables take callee-saved registers (X19-X28) on first appearance and
//! spill to frame slots beyond that. X16/X17 (the intra-procedure-call
//! scratch pair) plus X15 are the lowering scratch registers.
//!
//! # Frame shape
//!
//! ```text
//! [x29]        saved x29/x30 pair (x29 points here)
//! [x29-16..80] saved x19-x28 pairs
//! [x29-88-8i]  spill slot i (computed-address access, reserve patched)
//! [sp...]      active WithStackSlot regions, innermost at sp
//! ```
//!
//! SP stays 16-byte aligned at every point a call or syscall can occur:
//! the prologue moves it in pair-sized steps and slot sizes round to 16.
//!
//! # Syscall convention
//!
//! `svc #0` with the number in X8 and arguments in X0-X5, return in X0.

use super::aarch64::{self as enc, regs::*, Cond, XReg};
use super::{AsmError, Assembler, Section};
use crate::ir::{
    CmpKind, Fragment, MemBase, MemRef, OpKind, Reg, SyscallNum, Test, Value, Var, Width,
};

/// Allocation pool: callee-saved.
const POOL: [XReg; 10] = [X19, X20, X21, X22, X23, X24, X25, X26, X27, X28];

/// Syscall argument registers in positional order.
const SYSCALL_ARGS: [XReg; 6] = [X0, X1, X2, X3, X4, X5];

const SCRATCH: XReg = X16;
const SCRATCH2: XReg = X17;
/// Third scratch for the rare large-displacement address computation.
const SCRATCH3: XReg = X15;

#[derive(Debug, Clone, Copy, PartialEq, Eq)]
enum Loc {
    Reg(XReg),
    Spill(usize),
}

struct MethodCtx<'a> {
    method: &'a str,
    vars: Vec<(String, Loc)>,
    next_pool: usize,
    spill_count: usize,
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

    fn loc_of(&mut self, var: &Var) -> Result<Loc, AsmError> {
        if let Some(reg) = var.pinned_reg() {
            return Ok(Loc::Reg(xreg(reg).map_err(|d| self.err(d))?));
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

    fn spill_disp(i: usize) -> i64 {
        -88 - 8 * i as i64
    }

    fn slot_sp_offset(&self, name: &str) -> Result<i64, AsmError> {
        let pos = self
            .slots
            .iter()
            .rposition(|(n, _)| n == name)
            .ok_or_else(|| self.err(format!("stack slot {name} is not active here")))?;
        Ok(self.slots[pos + 1..].iter().map(|(_, s)| *s as i64).sum())
    }
}

fn xreg(r: Reg) -> Result<XReg, String> {
    match r {
        Reg::Sp | Reg::Pc | Reg::Rflags => {
            Err(format!("register {} cannot back a variable", r.name()))
        }
        other if other.arch() == crate::ir::Arch::Aarch64 => {
            // ir::Reg numbers its AArch64 block X0..X30 contiguously.
            Ok(XReg(other as u8 - Reg::X0 as u8))
        }
        other => Err(format!("register {} is not an AArch64 GPR", other.name())),
    }
}

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

    // Prologue: frame record, pool saves, frame reserve (patched below).
    asm.emit(&enc::stp_pre(X29, X30, SP, -16)?);
    asm.emit(&enc::mov_sp(X29, SP));
    for pair in POOL.chunks(2) {
        asm.emit(&enc::stp_pre(pair[0], pair[1], SP, -16)?);
    }
    let reserve_at = asm.offset();
    asm.emit(&enc::sub_ri(SP, SP, 0)?);

    lower_body(asm, &mut ctx, body)?;

    // Epilogue: rewind SP to the save area through X29, restore, return.
    asm.bind_label(&ctx.epilogue)?;
    asm.emit(&enc::sub_ri(SP, X29, 80)?);
    for pair in POOL.chunks(2).rev() {
        asm.emit(&enc::ldp_post(pair[0], pair[1], SP, 16)?);
    }
    asm.emit(&enc::ldp_post(X29, X30, SP, 16)?);
    asm.emit(&enc::ret());

    let frame = (ctx.spill_count as u64 * 8 + 15) & !15;
    asm.patch_text_word(reserve_at, &enc::sub_ri(SP, SP, frame as i64)?);
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
            read_into(asm, ctx, value, X0)?;
            emit_b(asm, &ctx.epilogue.clone());
            Ok(())
        }
        Fragment::Call { target } => {
            let t = read_value(asm, ctx, target, SCRATCH)?;
            asm.emit(&enc::blr(t));
            Ok(())
        }
        Fragment::CallMethod { name } => {
            let at = asm.offset();
            asm.emit(&enc::bl());
            asm.fixup_imm26(at, name);
            Ok(())
        }
        Fragment::Goto(label) => {
            emit_b(asm, &qualify(ctx.method, &label.0));
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
                        emit_spill_store(asm, i, SCRATCH)?;
                    }
                }
            }
            Ok(())
        }
        Fragment::WithStackSlot { name, size, body } => {
            let rounded = (*size + 15) & !15;
            emit_sp_adjust(asm, ctx, rounded as i64, true)?;
            ctx.slots.push((name.clone(), rounded));
            lower_body(asm, ctx, body)?;
            ctx.slots.pop();
            emit_sp_adjust(asm, ctx, rounded as i64, false)?;
            Ok(())
        }
        Fragment::FlushICache { ptr, len } => emit_icache_flush(asm, ctx, ptr, len),
        Fragment::Halt => {
            // PSCI SYSTEM_OFF through the conduit; the hypervisor reports
            // a halted VM.
            asm.emit(&enc::mov_ri(X0, 0x8400_0008));
            asm.emit(&enc::hvc(0));
            Ok(())
        }
        Fragment::Hvc { imm } => {
            asm.emit(&enc::hvc(*imm));
            Ok(())
        }
        Fragment::Printf { .. } => Err(ctx.err("printf must be expanded before lowering")),
    }
}

/// Cache maintenance over a freshly written code range: clean each data
/// cache line to the point of unification, invalidate the corresponding
/// instruction cache lines, synchronize. 64-byte lines cover every
/// supported core.
fn emit_icache_flush(
    asm: &mut Assembler,
    ctx: &mut MethodCtx,
    ptr: &Value,
    len: &Value,
) -> Result<(), AsmError> {
    read_into(asm, ctx, len, SCRATCH2)?;
    read_into(asm, ctx, ptr, SCRATCH)?;
    // SCRATCH2 = end, SCRATCH3 = line-aligned cursor saved for reuse.
    asm.emit(&enc::add_rr(SCRATCH2, SCRATCH, SCRATCH2));
    asm.emit(&enc::mov_ri(SCRATCH3, !63));
    asm.emit(&enc::and_rr(SCRATCH, SCRATCH, SCRATCH3));
    asm.emit(&enc::mov_rr(SCRATCH3, SCRATCH));

    let dc_loop = asm.fresh_label(ctx.method, "dc");
    asm.bind_label(&dc_loop)?;
    asm.emit(&enc::dc_cvau(SCRATCH));
    asm.emit(&enc::add_ri(SCRATCH, SCRATCH, 64)?);
    asm.emit(&enc::cmp_rr(SCRATCH, SCRATCH2));
    emit_b_cond(asm, Cond::Lt, &dc_loop);
    asm.emit(&enc::dsb_ish());

    asm.emit(&enc::mov_rr(SCRATCH, SCRATCH3));
    let ic_loop = asm.fresh_label(ctx.method, "ic");
    asm.bind_label(&ic_loop)?;
    asm.emit(&enc::ic_ivau(SCRATCH));
    asm.emit(&enc::add_ri(SCRATCH, SCRATCH, 64)?);
    asm.emit(&enc::cmp_rr(SCRATCH, SCRATCH2));
    emit_b_cond(asm, Cond::Lt, &ic_loop);
    asm.emit(&enc::dsb_ish());
    asm.emit(&enc::isb());
    Ok(())
}

/// SP adjustment for slot entry/exit, chunked through the imm12 field for
/// oversized slots.
fn emit_sp_adjust(
    asm: &mut Assembler,
    _ctx: &MethodCtx,
    mut amount: i64,
    down: bool,
) -> Result<(), AsmError> {
    while amount > 0 {
        let step = amount.min(0xff0);
        asm.emit(&if down {
            enc::sub_ri(SP, SP, step)?
        } else {
            enc::add_ri(SP, SP, step)?
        });
        amount -= step;
    }
    Ok(())
}

fn emit_b(asm: &mut Assembler, target: &str) {
    let at = asm.offset();
    asm.emit(&enc::b());
    asm.fixup_imm26(at, target);
}

fn emit_b_cond(asm: &mut Assembler, cond: Cond, target: &str) {
    let at = asm.offset();
    asm.emit(&enc::b_cond(cond));
    asm.fixup_imm19(at, target);
}

fn qualify(method: &str, label: &str) -> String {
    format!("{method}.{label}")
}

/// Load from `[base + disp]` handling unscaled or out-of-range
/// displacements by materializing the address.
fn emit_load(
    asm: &mut Assembler,
    width: Width,
    dst: XReg,
    base: XReg,
    disp: i64,
) -> Result<(), AsmError> {
    match enc::ldr(width, dst, base, disp) {
        Ok(bytes) => {
            asm.emit(&bytes);
            Ok(())
        }
        Err(_) => {
            emit_addr(asm, dst, base, disp)?;
            asm.emit(&enc::ldr(width, dst, dst, 0)?);
            Ok(())
        }
    }
}

/// Store handling the same displacement cases; `addr_scratch` must differ
/// from `src`.
fn emit_store(
    asm: &mut Assembler,
    width: Width,
    base: XReg,
    disp: i64,
    src: XReg,
    addr_scratch: XReg,
) -> Result<(), AsmError> {
    match enc::str(width, src, base, disp) {
        Ok(bytes) => {
            asm.emit(&bytes);
            Ok(())
        }
        Err(_) => {
            emit_addr(asm, addr_scratch, base, disp)?;
            asm.emit(&enc::str(width, src, addr_scratch, 0)?);
            Ok(())
        }
    }
}

/// `into = base + disp` for arbitrary displacements. `into` may equal
/// `base`; SCRATCH3 carries oversized immediates.
fn emit_addr(asm: &mut Assembler, into: XReg, base: XReg, disp: i64) -> Result<(), AsmError> {
    if disp == 0 {
        if into != base {
            asm.emit(&enc::mov_sp(into, base));
        }
        return Ok(());
    }
    if (0..=0xfff).contains(&disp) {
        asm.emit(&enc::add_ri(into, base, disp)?);
    } else if (-0xfff..0).contains(&disp) {
        asm.emit(&enc::sub_ri(into, base, -disp)?);
    } else {
        asm.emit(&enc::mov_ri(SCRATCH3, disp));
        asm.emit(&enc::add_rr(into, base, SCRATCH3));
    }
    Ok(())
}

/// Load spill slot `i` into `dst`. Frame offsets are negative, so this
/// always goes through the computed-address path.
fn emit_spill_load(asm: &mut Assembler, i: usize, dst: XReg) -> Result<(), AsmError> {
    emit_load(asm, Width::W64, dst, X29, MethodCtx::spill_disp(i))
}

/// Store `src` into spill slot `i`; SCRATCH3 carries the address so any
/// source register is safe.
fn emit_spill_store(asm: &mut Assembler, i: usize, src: XReg) -> Result<(), AsmError> {
    emit_store(asm, Width::W64, X29, MethodCtx::spill_disp(i), src, SCRATCH3)
}

fn read_value(
    asm: &mut Assembler,
    ctx: &mut MethodCtx,
    value: &Value,
    scratch: XReg,
) -> Result<XReg, AsmError> {
    match value {
        Value::Var(v) => match ctx.loc_of(v)? {
            Loc::Reg(r) => Ok(r),
            Loc::Spill(i) => {
                emit_spill_load(asm, i, scratch)?;
                Ok(scratch)
            }
        },
        Value::Reg(r) => xreg(*r).map_err(|d| ctx.err(d)),
        Value::Int(v) => {
            asm.emit(&enc::mov_ri(scratch, *v));
            Ok(scratch)
        }
        Value::Mem(m) => {
            let (base, disp) = resolve_mem(asm, ctx, m, scratch)?;
            emit_load(asm, m.width, scratch, base, disp)?;
            Ok(scratch)
        }
        Value::SlotAddr { slot, disp } => {
            let off = ctx.slot_sp_offset(slot)? + *disp as i64;
            emit_addr(asm, scratch, SP, off)?;
            Ok(scratch)
        }
        Value::Str(_) => Err(ctx.err("string literals are only syscall or printf arguments")),
    }
}

fn read_into(
    asm: &mut Assembler,
    ctx: &mut MethodCtx,
    value: &Value,
    dst: XReg,
) -> Result<(), AsmError> {
    let r = read_value(asm, ctx, value, dst)?;
    if r != dst {
        asm.emit(&enc::mov_rr(dst, r));
    }
    Ok(())
}

/// Resolve a memory operand to a base register and displacement. Slot
/// bases resolve to SP, which `emit_load`/`emit_store` accept directly.
fn resolve_mem(
    asm: &mut Assembler,
    ctx: &mut MethodCtx,
    m: &MemRef,
    scratch: XReg,
) -> Result<(XReg, i64), AsmError> {
    match &m.base {
        MemBase::Var(v) => {
            let base = read_value(asm, ctx, &Value::Var(v.clone()), scratch)?;
            Ok((base, m.disp as i64))
        }
        MemBase::Reg(r) => Ok((xreg(*r).map_err(|d| ctx.err(d))?, m.disp as i64)),
        MemBase::Slot(name) => Ok((SP, ctx.slot_sp_offset(name)? + m.disp as i64)),
    }
}

fn write_var(
    asm: &mut Assembler,
    ctx: &mut MethodCtx,
    var: &Var,
    src: XReg,
) -> Result<(), AsmError> {
    match ctx.loc_of(var)? {
        Loc::Reg(r) => {
            if r != src {
                asm.emit(&enc::mov_rr(r, src));
            }
        }
        Loc::Spill(i) => {
            emit_spill_store(asm, i, src)?;
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
            if let (Value::Int(imm), Loc::Reg(r)) = (src, ctx.loc_of(v)?) {
                asm.emit(&enc::mov_ri(r, *imm));
                return Ok(());
            }
            let s = read_value(asm, ctx, src, SCRATCH)?;
            write_var(asm, ctx, v, s)
        }
        Value::Reg(r) => {
            let d = xreg(*r).map_err(|e| ctx.err(e))?;
            read_into(asm, ctx, src, d)
        }
        Value::Mem(m) => {
            let s = read_value(asm, ctx, src, SCRATCH2)?;
            let (base, disp) = resolve_mem(asm, ctx, m, SCRATCH)?;
            emit_store(asm, m.width, base, disp, s, SCRATCH)
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
    if let (Value::Int(l), Value::Int(r)) = (left, right) {
        if let Some(folded) = fold(kind, *l, *r) {
            return lower_assign(asm, ctx, &Value::Var(dst.clone()), &Value::Int(folded));
        }
    }

    let dloc = ctx.loc_of(dst)?;
    let d = match dloc {
        Loc::Reg(r) => r,
        Loc::Spill(_) => SCRATCH2,
    };

    match kind {
        OpKind::Add | OpKind::Sub => {
            match right {
                Value::Int(imm) if (0..=0xfff).contains(imm) => {
                    read_into(asm, ctx, left, d)?;
                    asm.emit(&if kind == OpKind::Add {
                        enc::add_ri(d, d, *imm)?
                    } else {
                        enc::sub_ri(d, d, *imm)?
                    });
                }
                _ => {
                    let r = read_value(asm, ctx, right, SCRATCH)?;
                    read_into(asm, ctx, left, d)?;
                    asm.emit(&if kind == OpKind::Add {
                        enc::add_rr(d, d, r)
                    } else {
                        enc::sub_rr(d, d, r)
                    });
                }
            }
        }
        OpKind::And | OpKind::Or | OpKind::Xor => {
            let r = read_value(asm, ctx, right, SCRATCH)?;
            read_into(asm, ctx, left, d)?;
            asm.emit(&match kind {
                OpKind::And => enc::and_rr(d, d, r),
                OpKind::Or => enc::orr_rr(d, d, r),
                _ => enc::eor_rr(d, d, r),
            });
        }
        OpKind::Mul => {
            let r = read_value(asm, ctx, right, SCRATCH)?;
            read_into(asm, ctx, left, d)?;
            asm.emit(&enc::mul_rr(d, d, r));
        }
        OpKind::Div => {
            let r = read_value(asm, ctx, right, SCRATCH)?;
            read_into(asm, ctx, left, d)?;
            asm.emit(&enc::sdiv_rr(d, d, r));
        }
        OpKind::Shl | OpKind::Shr => match right {
            Value::Int(imm) => {
                let imm = u8::try_from(*imm).map_err(|_| ctx.err("shift count out of range"))?;
                read_into(asm, ctx, left, d)?;
                asm.emit(&if kind == OpKind::Shl {
                    enc::lsl_ri(d, d, imm)?
                } else {
                    enc::lsr_ri(d, d, imm)?
                });
            }
            _ => {
                let r = read_value(asm, ctx, right, SCRATCH)?;
                read_into(asm, ctx, left, d)?;
                asm.emit(&if kind == OpKind::Shl {
                    enc::lslv(d, d, r)
                } else {
                    enc::lsrv(d, d, r)
                });
            }
        },
    }

    if let Loc::Spill(i) = dloc {
        emit_spill_store(asm, i, d)?;
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

    let cond = match test {
        Test::Cmp { kind, left, right } => {
            let l = read_value(asm, ctx, left, SCRATCH)?;
            match right {
                Value::Int(imm) if (0..=0xfff).contains(imm) => {
                    asm.emit(&enc::cmp_ri(l, *imm)?);
                }
                _ => {
                    let r = read_value(asm, ctx, right, SCRATCH2)?;
                    asm.emit(&enc::cmp_rr(l, r));
                }
            }
            match kind {
                CmpKind::Equal => Cond::Ne,
                CmpKind::NotEqual => Cond::Eq,
                CmpKind::Less => Cond::Ge,
                CmpKind::LessOrEqual => Cond::Gt,
                CmpKind::Greater => Cond::Le,
                CmpKind::GreaterOrEqual => Cond::Lt,
            }
        }
        Test::IsZero(v) => {
            let r = read_value(asm, ctx, v, SCRATCH)?;
            asm.emit(&enc::tst_rr(r, r));
            Cond::Ne
        }
        Test::IsNegative(v) => {
            let r = read_value(asm, ctx, v, SCRATCH)?;
            asm.emit(&enc::tst_rr(r, r));
            Cond::Pl
        }
    };
    emit_b_cond(asm, cond, skip_target);

    lower_body(asm, ctx, then_body)?;
    if !else_body.is_empty() {
        emit_b(asm, &end_label);
        asm.bind_label(&else_label)?;
        lower_body(asm, ctx, else_body)?;
    }
    asm.bind_label(&end_label)?;
    Ok(())
}

enum MoveSrc {
    Imm(i64),
    Reg(XReg),
    Mem { base: XReg, disp: i64, width: Width },
    SlotAddr(i64),
    ConstPtr(usize),
}

impl MoveSrc {
    fn reads(&self) -> Option<XReg> {
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

    let mut moves: Vec<(XReg, MoveSrc)> = Vec::with_capacity(args.len());
    for (i, arg) in args.iter().enumerate() {
        let target = SYSCALL_ARGS[i];
        let src = match arg {
            Value::Int(v) => MoveSrc::Imm(*v),
            Value::Str(s) => MoveSrc::ConstPtr(asm.intern_constant(s.as_bytes(), true)),
            Value::Reg(r) => MoveSrc::Reg(xreg(*r).map_err(|d| ctx.err(d))?),
            Value::Var(v) => match ctx.loc_of(v)? {
                Loc::Reg(r) => MoveSrc::Reg(r),
                Loc::Spill(i) => MoveSrc::Mem {
                    base: X29,
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
                MoveSrc::SlotAddr(ctx.slot_sp_offset(slot)? + *disp as i64)
            }
        };
        moves.push((target, src));
    }

    while !moves.is_empty() {
        let ready = moves
            .iter()
            .position(|(dst, _)| !moves.iter().any(|(_, src)| src.reads() == Some(*dst)));
        match ready {
            Some(i) => {
                let (dst, src) = moves.remove(i);
                emit_move(asm, dst, &src)?;
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
        SyscallNum::Sym(sys) => sys.number(crate::ir::Arch::Aarch64),
        SyscallNum::Raw(n) => *n,
    };
    asm.emit(&enc::mov_ri(X8, n as i64));
    asm.emit(&enc::svc(0));

    if let Some(ret_var) = ret {
        write_var(asm, ctx, ret_var, X0)?;
    }
    Ok(())
}

fn emit_move(asm: &mut Assembler, dst: XReg, src: &MoveSrc) -> Result<(), AsmError> {
    match src {
        MoveSrc::Imm(v) => asm.emit(&enc::mov_ri(dst, *v)),
        MoveSrc::Reg(r) => {
            if *r != dst {
                asm.emit(&enc::mov_rr(dst, *r));
            }
        }
        MoveSrc::Mem { base, disp, width } => emit_load(asm, *width, dst, *base, *disp)?,
        MoveSrc::SlotAddr(off) => emit_addr(asm, dst, SP, *off)?,
        MoveSrc::ConstPtr(off) => {
            let insn_at = asm.offset();
            asm.emit(&enc::ldr_literal(dst));
            let pool_off = asm.alloc_literal(0);
            asm.fixup_ldr_literal(insn_at, Section::LiteralPool, pool_off);
            asm.patch_pointer(Section::LiteralPool, pool_off, Section::ConstData, *off);
        }
    }
    Ok(())
}

fn resolve_mem_for_move(ctx: &mut MethodCtx, m: &MemRef) -> Result<(XReg, i64), AsmError> {
    match &m.base {
        MemBase::Var(v) => match ctx.loc_of(v)? {
            Loc::Reg(r) => Ok((r, m.disp as i64)),
            Loc::Spill(_) => Err(ctx.err(
                "memory syscall argument with a spilled base; copy it to a variable first",
            )),
        },
        MemBase::Reg(r) => Ok((xreg(*r).map_err(|d| ctx.err(d))?, m.disp as i64)),
        MemBase::Slot(name) => Ok((SP, ctx.slot_sp_offset(name)? + m.disp as i64)),
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
    let insn_at = asm.offset();
    asm.emit(&enc::ldr_literal(target));
    let pool_off = asm.alloc_literal(0);
    asm.fixup_ldr_literal(insn_at, Section::LiteralPool, pool_off);
    asm.patch_pointer(Section::LiteralPool, pool_off, Section::ConstData, data_off);
    if let Loc::Spill(i) = loc {
        emit_spill_store(asm, i, SCRATCH)?;
    }
    Ok(())
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::ir::{self, Arch};

    fn build(p: &ir::Program) -> super::super::Assembled {
        super::super::build_standalone_program_for_arch(Arch::Aarch64, p).unwrap()
    }

    #[test]
    fn test_text_is_word_aligned_instructions() {
        let mut p = ir::Program::new("main");
        p.method(
            "main",
            vec![
                ir::assign(ir::var("a"), ir::int(40)),
                ir::op(OpKind::Add, "a", ir::var("a"), ir::int(2)),
                ir::ret(ir::var("a")),
            ],
        );
        let out = build(&p);
        // All pure-text programs are whole words on this target.
        assert_eq!(out.code.len() % 4, 0);
    }

    #[test]
    fn test_psci_halt_sequence() {
        let mut p = ir::Program::new("main");
        p.method("main", vec![Fragment::Halt]);
        let out = build(&p);
        // movz x0, #8 ; movk x0, #0x8400, lsl #16 ; hvc #0
        let expect = [
            enc::movz(X0, 0x0008, 0),
            enc::movk(X0, 0x8400, 1),
            enc::hvc(0),
        ]
        .concat();
        assert!(out
            .code
            .windows(expect.len())
            .any(|w| w == expect.as_slice()));
    }

    #[test]
    fn test_deterministic_build() {
        let mut p = ir::Program::new("main");
        p.method(
            "main",
            vec![
                ir::load_constant_bytes(b"hello".to_vec(), true, "msg", Some("len")),
                ir::syscall(ir::Sys::Write, vec![ir::int(1), ir::var("msg"), ir::var("len")]),
                ir::ret(ir::int(0)),
            ],
        );
        assert_eq!(build(&p), build(&p));
    }

    #[test]
    fn test_constant_pointer_via_literal_pool() {
        let mut p = ir::Program::new("main");
        p.method(
            "main",
            vec![
                ir::load_constant_bytes(b"hi".to_vec(), true, "msg", None),
                ir::ret(ir::var("msg")),
            ],
        );
        let out = build(&p);
        // One relocation, pointing at the 8-byte pool slot, which holds
        // the const-data offset of the blob.
        assert_eq!(out.relocations.len(), 1);
        let at = out.relocations[0] as usize;
        let slot = u64::from_le_bytes(out.code[at..at + 8].try_into().unwrap());
        assert_eq!(&out.code[slot as usize..slot as usize + 3], b"hi\0");
    }

    #[test]
    fn test_syscall_number_differs_from_x86() {
        let mut p = ir::Program::new("main");
        p.method(
            "main",
            vec![
                ir::syscall(ir::Sys::Write, vec![ir::int(1), ir::str_lit("x"), ir::int(1)]),
                ir::ret(ir::int(0)),
            ],
        );
        let out = build(&p);
        // movz x8, #64 must appear (aarch64 write).
        let movz_x8_64 = enc::movz(X8, 64, 0);
        assert!(out
            .code
            .windows(4)
            .any(|w| w == movz_x8_64.as_slice()));
    }

    #[test]
    fn test_branch_forward_and_back() {
        let mut p = ir::Program::new("main");
        p.method(
            "main",
            vec![
                ir::assign(ir::var("n"), ir::int(3)),
                ir::declare_label(
                    "loop",
                    vec![
                        ir::op(OpKind::Sub, "n", ir::var("n"), ir::int(1)),
                        ir::if_then(
                            ir::cmp(CmpKind::Greater, ir::var("n"), ir::int(0)),
                            vec![ir::goto("loop")],
                        ),
                    ],
                ),
                ir::ret(ir::var("n")),
            ],
        );
        build(&p);
    }

    #[test]
    fn test_nested_slots_round_to_sixteen() {
        let mut p = ir::Program::new("main");
        p.method(
            "main",
            vec![ir::with_stack_slot(
                "buf",
                24,
                vec![ir::assign(ir::slot_at("buf", 0, Width::W64), ir::int(1))],
            ), ir::ret(ir::int(0))],
        );
        let out = build(&p);
        let sub32 = enc::sub_ri(SP, SP, 32).unwrap();
        let add32 = enc::add_ri(SP, SP, 32).unwrap();
        assert!(out.code.windows(4).any(|w| w == sub32.as_slice()));
        assert!(out.code.windows(4).any(|w| w == add32.as_slice()));
    }

    #[test]
    fn test_spill_beyond_pool() {
        let mut p = ir::Program::new("main");
        let mut body = Vec::new();
        for i in 0..14 {
            body.push(ir::assign(ir::var(&format!("v{i}")), ir::int(i)));
        }
        body.push(ir::assign(ir::var("acc"), ir::int(0)));
        for i in 0..14 {
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
}
