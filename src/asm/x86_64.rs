//! x86-64 instruction encoders.
//!
//! Pure functions from operands to instruction bytes. Encoders know the
//! ISA's structural rules (REX computation, ModR/M + SIB addressing forms,
//! displacement and immediate widths) and nothing else — syscall and
//! calling conventions live in the lowering pass.
//!
//! # Encoding crib
//!
//! ```text
//! REX    = 0100WRXB   W: 64-bit operand  R/X/B: extend reg/index/rm to r8-r15
//! ModR/M = mm rrr bbb mm: 00 [base], 01 [base+disp8], 10 [base+disp32], 11 reg
//! SIB    = ss iii bbb required when rm=100 (RSP/R12 base)
//! ```
//!
//! Two addressing irregularities matter here: a base of RSP/R12 (rm=100)
//! always needs a SIB byte, and a base of RBP/R13 cannot use the
//! displacement-free form (mod=00 means absolute disp32 there), so those
//! bases get an explicit zero disp8.

use super::AsmError;
use crate::ir::Width;

/// An x86-64 general-purpose register, numbered as the ISA encodes it.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
#[repr(u8)]
#[allow(missing_docs)]
pub enum Gpr {
    Rax = 0,
    Rcx = 1,
    Rdx = 2,
    Rbx = 3,
    Rsp = 4,
    Rbp = 5,
    Rsi = 6,
    Rdi = 7,
    R8 = 8,
    R9 = 9,
    R10 = 10,
    R11 = 11,
    R12 = 12,
    R13 = 13,
    R14 = 14,
    R15 = 15,
}

impl Gpr {
    fn low3(self) -> u8 {
        self as u8 & 0x7
    }

    fn ext(self) -> bool {
        self as u8 >= 8
    }
}

/// Condition codes for Jcc. Values are the ISA's `cc` nibble.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
#[repr(u8)]
pub enum Cc {
    /// ZF=1.
    E = 0x4,
    /// ZF=0.
    Ne = 0x5,
    /// Signed less.
    L = 0xc,
    /// Signed less-or-equal.
    Le = 0xe,
    /// Signed greater.
    G = 0xf,
    /// Signed greater-or-equal.
    Ge = 0xd,
    /// SF=1 (negative).
    S = 0x8,
    /// SF=0.
    Ns = 0x9,
}

/// Two-operand ALU operations sharing the standard opcode pattern.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum Alu {
    Add,
    Sub,
    And,
    Or,
    Xor,
    Cmp,
}

impl Alu {
    /// Opcode for the `op r/m64, r64` form.
    fn rm_r_opcode(self) -> u8 {
        match self {
            Alu::Add => 0x01,
            Alu::Or => 0x09,
            Alu::And => 0x21,
            Alu::Sub => 0x29,
            Alu::Xor => 0x31,
            Alu::Cmp => 0x39,
        }
    }

    /// ModR/M reg field for the `op r/m64, imm` group (0x81/0x83).
    fn imm_ext(self) -> u8 {
        match self {
            Alu::Add => 0,
            Alu::Or => 1,
            Alu::And => 4,
            Alu::Sub => 5,
            Alu::Xor => 6,
            Alu::Cmp => 7,
        }
    }
}

fn rex(w: bool, r: bool, x: bool, b: bool) -> u8 {
    0x40 | (w as u8) << 3 | (r as u8) << 2 | (x as u8) << 1 | b as u8
}

/// Emit ModR/M (+ SIB + displacement) for `[base + disp]` with `reg_field`
/// in the reg slot. Returns the bytes after the opcode.
fn modrm_mem(reg_field: Gpr, base: Gpr, disp: i32) -> Vec<u8> {
    let mut out = Vec::with_capacity(6);
    let needs_sib = base.low3() == 4; // RSP / R12
    let force_disp = base.low3() == 5; // RBP / R13 have no disp-free form

    let (mode, disp_bytes): (u8, &[u8]) = if disp == 0 && !force_disp {
        (0b00, &[])
    } else if (-128..=127).contains(&disp) {
        (0b01, &disp.to_le_bytes()[..1])
    } else {
        (0b10, &disp.to_le_bytes()[..4])
    };

    out.push(mode << 6 | reg_field.low3() << 3 | if needs_sib { 4 } else { base.low3() });
    if needs_sib {
        // scale=1, no index, base in the SIB base field.
        out.push(0 << 6 | 4 << 3 | base.low3());
    }
    out.extend_from_slice(disp_bytes);
    out
}

/// `MOV r64, imm` choosing the shortest sufficient form: sign-extended
/// imm32 when the value fits, full imm64 otherwise.
pub fn mov_ri(dst: Gpr, imm: i64) -> Vec<u8> {
    if i32::try_from(imm).is_ok() {
        let mut out = vec![rex(true, false, false, dst.ext()), 0xc7, 0xc0 | dst.low3()];
        out.extend_from_slice(&(imm as i32).to_le_bytes());
        out
    } else {
        let mut out = vec![rex(true, false, false, dst.ext()), 0xb8 + dst.low3()];
        out.extend_from_slice(&imm.to_le_bytes());
        out
    }
}

/// `MOV r64, imm64` in the fixed 10-byte form. The immediate field starts
/// at byte 2, which is where pointer patches land.
pub fn mov_ri64(dst: Gpr) -> Vec<u8> {
    let mut out = vec![rex(true, false, false, dst.ext()), 0xb8 + dst.low3()];
    out.extend_from_slice(&[0u8; 8]);
    out
}

/// `MOV r64, r64`.
pub fn mov_rr(dst: Gpr, src: Gpr) -> Vec<u8> {
    vec![
        rex(true, src.ext(), false, dst.ext()),
        0x89,
        0xc0 | src.low3() << 3 | dst.low3(),
    ]
}

/// Load from `[base + disp]` into `dst`, zero-extending widths below 64
/// bits (MOVZX for 8/16, the architectural zero-extension for 32).
pub fn load(width: Width, dst: Gpr, base: Gpr, disp: i32) -> Vec<u8> {
    let mut out = Vec::with_capacity(8);
    match width {
        Width::W8 => {
            out.push(rex(true, dst.ext(), false, base.ext()));
            out.extend_from_slice(&[0x0f, 0xb6]);
        }
        Width::W16 => {
            out.push(rex(true, dst.ext(), false, base.ext()));
            out.extend_from_slice(&[0x0f, 0xb7]);
        }
        Width::W32 => {
            if dst.ext() || base.ext() {
                out.push(rex(false, dst.ext(), false, base.ext()));
            }
            out.push(0x8b);
        }
        Width::W64 => {
            out.push(rex(true, dst.ext(), false, base.ext()));
            out.push(0x8b);
        }
    }
    out.extend_from_slice(&modrm_mem(dst, base, disp));
    out
}

/// Store `src` to `[base + disp]` at the given width.
pub fn store(width: Width, base: Gpr, disp: i32, src: Gpr) -> Vec<u8> {
    let mut out = Vec::with_capacity(8);
    match width {
        Width::W8 => {
            // REX (even with all bits clear) selects SPL/BPL/SIL/DIL over
            // AH/CH/DH/BH for encodings 4-7.
            if src.ext() || base.ext() || src.low3() >= 4 {
                out.push(rex(false, src.ext(), false, base.ext()));
            }
            out.push(0x88);
        }
        Width::W16 => {
            out.push(0x66);
            if src.ext() || base.ext() {
                out.push(rex(false, src.ext(), false, base.ext()));
            }
            out.push(0x89);
        }
        Width::W32 => {
            if src.ext() || base.ext() {
                out.push(rex(false, src.ext(), false, base.ext()));
            }
            out.push(0x89);
        }
        Width::W64 => {
            out.push(rex(true, src.ext(), false, base.ext()));
            out.push(0x89);
        }
    }
    out.extend_from_slice(&modrm_mem(src, base, disp));
    out
}

/// ALU `dst op= src` (64-bit).
pub fn alu_rr(op: Alu, dst: Gpr, src: Gpr) -> Vec<u8> {
    vec![
        rex(true, src.ext(), false, dst.ext()),
        op.rm_r_opcode(),
        0xc0 | src.low3() << 3 | dst.low3(),
    ]
}

/// ALU `dst op= imm` (64-bit, sign-extended immediate). Uses the imm8 form
/// when the value fits.
pub fn alu_ri(op: Alu, dst: Gpr, imm: i32) -> Vec<u8> {
    let mut out = vec![rex(true, false, false, dst.ext())];
    if (-128..=127).contains(&imm) {
        out.push(0x83);
        out.push(0xc0 | op.imm_ext() << 3 | dst.low3());
        out.push(imm as i8 as u8);
    } else {
        out.push(0x81);
        out.push(0xc0 | op.imm_ext() << 3 | dst.low3());
        out.extend_from_slice(&imm.to_le_bytes());
    }
    out
}

/// `IMUL dst, src` (64-bit two-operand form).
pub fn imul_rr(dst: Gpr, src: Gpr) -> Vec<u8> {
    vec![
        rex(true, dst.ext(), false, src.ext()),
        0x0f,
        0xaf,
        0xc0 | dst.low3() << 3 | src.low3(),
    ]
}

/// `IDIV src` (signed divide of RDX:RAX, quotient in RAX, remainder RDX).
pub fn idiv(src: Gpr) -> Vec<u8> {
    vec![rex(true, false, false, src.ext()), 0xf7, 0xf8 | src.low3()]
}

/// `CQO` — sign-extend RAX into RDX:RAX ahead of IDIV.
pub fn cqo() -> Vec<u8> {
    vec![0x48, 0x99]
}

/// `SHL dst, imm`.
pub fn shl_ri(dst: Gpr, imm: u8) -> Result<Vec<u8>, AsmError> {
    shift_ri("shl", 4, dst, imm)
}

/// `SHR dst, imm` (logical).
pub fn shr_ri(dst: Gpr, imm: u8) -> Result<Vec<u8>, AsmError> {
    shift_ri("shr", 5, dst, imm)
}

fn shift_ri(insn: &'static str, ext: u8, dst: Gpr, imm: u8) -> Result<Vec<u8>, AsmError> {
    if imm > 63 {
        return Err(AsmError::ImmediateRange {
            insn,
            value: imm as i64,
            bits: 6,
        });
    }
    Ok(vec![
        rex(true, false, false, dst.ext()),
        0xc1,
        0xc0 | ext << 3 | dst.low3(),
        imm,
    ])
}

/// `SHL dst, CL`.
pub fn shl_cl(dst: Gpr) -> Vec<u8> {
    vec![rex(true, false, false, dst.ext()), 0xd3, 0xe0 | dst.low3()]
}

/// `SHR dst, CL`.
pub fn shr_cl(dst: Gpr) -> Vec<u8> {
    vec![rex(true, false, false, dst.ext()), 0xd3, 0xe8 | dst.low3()]
}

/// `LEA dst, [base + disp]`.
pub fn lea(dst: Gpr, base: Gpr, disp: i32) -> Vec<u8> {
    let mut out = vec![rex(true, dst.ext(), false, base.ext()), 0x8d];
    out.extend_from_slice(&modrm_mem(dst, base, disp));
    out
}

/// `LEA dst, [rip + disp32]` with a zero placeholder displacement at the
/// last four bytes (relative to the end of the instruction).
pub fn lea_rip(dst: Gpr) -> Vec<u8> {
    let mut out = vec![
        rex(true, dst.ext(), false, false),
        0x8d,
        dst.low3() << 3 | 0b101, // mod=00 rm=101: RIP-relative
    ];
    out.extend_from_slice(&[0; 4]);
    out
}

/// `TEST dst, src` (64-bit).
pub fn test_rr(dst: Gpr, src: Gpr) -> Vec<u8> {
    vec![
        rex(true, src.ext(), false, dst.ext()),
        0x85,
        0xc0 | src.low3() << 3 | dst.low3(),
    ]
}

/// `Jcc rel8` with a zero placeholder displacement at byte 1.
pub fn jcc_rel8(cc: Cc) -> Vec<u8> {
    vec![0x70 | cc as u8, 0]
}

/// `Jcc rel32` with a zero placeholder displacement at bytes 2..6.
pub fn jcc_rel32(cc: Cc) -> Vec<u8> {
    vec![0x0f, 0x80 | cc as u8, 0, 0, 0, 0]
}

/// `JMP rel8` with a placeholder at byte 1.
pub fn jmp_rel8() -> Vec<u8> {
    vec![0xeb, 0]
}

/// `JMP rel32` with a placeholder at bytes 1..5.
pub fn jmp_rel32() -> Vec<u8> {
    vec![0xe9, 0, 0, 0, 0]
}

/// `CALL rel32` with a placeholder at bytes 1..5.
pub fn call_rel32() -> Vec<u8> {
    vec![0xe8, 0, 0, 0, 0]
}

/// `CALL r64` (indirect).
pub fn call_r(target: Gpr) -> Vec<u8> {
    let mut out = Vec::with_capacity(3);
    if target.ext() {
        out.push(rex(false, false, false, true));
    }
    out.push(0xff);
    out.push(0xd0 | target.low3());
    out
}

/// `PUSH r64`.
pub fn push(r: Gpr) -> Vec<u8> {
    if r.ext() {
        vec![rex(false, false, false, true), 0x50 + r.low3()]
    } else {
        vec![0x50 + r.low3()]
    }
}

/// `POP r64`.
pub fn pop(r: Gpr) -> Vec<u8> {
    if r.ext() {
        vec![rex(false, false, false, true), 0x58 + r.low3()]
    } else {
        vec![0x58 + r.low3()]
    }
}

/// `RET`.
pub fn ret() -> Vec<u8> {
    vec![0xc3]
}

/// `HLT`.
pub fn hlt() -> Vec<u8> {
    vec![0xf4]
}

/// `SYSCALL`.
pub fn syscall() -> Vec<u8> {
    vec![0x0f, 0x05]
}

/// `NOP`.
pub fn nop() -> Vec<u8> {
    vec![0x90]
}

/// `OUT DX, AL` / `OUT DX, EAX`.
pub fn out_dx(width: Width) -> Result<Vec<u8>, AsmError> {
    match width {
        Width::W8 => Ok(vec![0xee]),
        Width::W16 => Ok(vec![0x66, 0xef]),
        Width::W32 => Ok(vec![0xef]),
        Width::W64 => Err(AsmError::OperandClass {
            insn: "out",
            expected: "an 8/16/32-bit operand",
        }),
    }
}

/// `IN AL, DX` / `IN EAX, DX`.
pub fn in_dx(width: Width) -> Result<Vec<u8>, AsmError> {
    match width {
        Width::W8 => Ok(vec![0xec]),
        Width::W16 => Ok(vec![0x66, 0xed]),
        Width::W32 => Ok(vec![0xed]),
        Width::W64 => Err(AsmError::OperandClass {
            insn: "in",
            expected: "an 8/16/32-bit operand",
        }),
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_mov_ri_small() {
        // mov rax, 42 (imm32 form)
        assert_eq!(mov_ri(Gpr::Rax, 42), vec![0x48, 0xc7, 0xc0, 42, 0, 0, 0]);
    }

    #[test]
    fn test_mov_ri_large() {
        // mov rax, 0x1122334455667788 (imm64 form)
        assert_eq!(
            mov_ri(Gpr::Rax, 0x1122334455667788),
            vec![0x48, 0xb8, 0x88, 0x77, 0x66, 0x55, 0x44, 0x33, 0x22, 0x11]
        );
    }

    #[test]
    fn test_mov_rr() {
        // mov rdi, rax
        assert_eq!(mov_rr(Gpr::Rdi, Gpr::Rax), vec![0x48, 0x89, 0xc7]);
        // mov r8, r9
        assert_eq!(mov_rr(Gpr::R8, Gpr::R9), vec![0x4d, 0x89, 0xc8]);
    }

    #[test]
    fn test_alu() {
        // add rax, rbx
        assert_eq!(alu_rr(Alu::Add, Gpr::Rax, Gpr::Rbx), vec![0x48, 0x01, 0xd8]);
        // add rax, 2 (imm8 form)
        assert_eq!(alu_ri(Alu::Add, Gpr::Rax, 2), vec![0x48, 0x83, 0xc0, 0x02]);
        // sub rsp, 0x1000 (imm32 form)
        assert_eq!(
            alu_ri(Alu::Sub, Gpr::Rsp, 0x1000),
            vec![0x48, 0x81, 0xec, 0x00, 0x10, 0x00, 0x00]
        );
        // cmp rax, 0
        assert_eq!(alu_ri(Alu::Cmp, Gpr::Rax, 0), vec![0x48, 0x83, 0xf8, 0x00]);
        // add r10, 1
        assert_eq!(alu_ri(Alu::Add, Gpr::R10, 1), vec![0x49, 0x83, 0xc2, 0x01]);
    }

    #[test]
    fn test_memory_forms() {
        // mov [rsp], rax — RSP base forces a SIB byte
        assert_eq!(
            store(Width::W64, Gpr::Rsp, 0, Gpr::Rax),
            vec![0x48, 0x89, 0x04, 0x24]
        );
        // mov rax, [rbp-8] — RBP base forces disp8
        assert_eq!(
            load(Width::W64, Gpr::Rax, Gpr::Rbp, -8),
            vec![0x48, 0x8b, 0x45, 0xf8]
        );
        // mov rax, [rbp] — still disp8 with zero
        assert_eq!(
            load(Width::W64, Gpr::Rax, Gpr::Rbp, 0),
            vec![0x48, 0x8b, 0x45, 0x00]
        );
        // movzx rax, byte [rsi]
        assert_eq!(
            load(Width::W8, Gpr::Rax, Gpr::Rsi, 0),
            vec![0x48, 0x0f, 0xb6, 0x06]
        );
        // lea rax, [rsp+8]
        assert_eq!(
            lea(Gpr::Rax, Gpr::Rsp, 8),
            vec![0x48, 0x8d, 0x44, 0x24, 0x08]
        );
        // lea rsi, [rip+0] placeholder
        assert_eq!(lea_rip(Gpr::Rsi), vec![0x48, 0x8d, 0x35, 0, 0, 0, 0]);
    }

    #[test]
    fn test_store_byte_sil() {
        // mov [rax], sil needs a bare REX to reach SIL
        assert_eq!(
            store(Width::W8, Gpr::Rax, 0, Gpr::Rsi),
            vec![0x40, 0x88, 0x30]
        );
        // mov [rax], cl needs none
        assert_eq!(store(Width::W8, Gpr::Rax, 0, Gpr::Rcx), vec![0x88, 0x08]);
    }

    #[test]
    fn test_mul_div() {
        // imul rax, rbx
        assert_eq!(imul_rr(Gpr::Rax, Gpr::Rbx), vec![0x48, 0x0f, 0xaf, 0xc3]);
        // idiv rbx
        assert_eq!(idiv(Gpr::Rbx), vec![0x48, 0xf7, 0xfb]);
        assert_eq!(cqo(), vec![0x48, 0x99]);
    }

    #[test]
    fn test_shifts() {
        // shl rax, 4
        assert_eq!(shl_ri(Gpr::Rax, 4).unwrap(), vec![0x48, 0xc1, 0xe0, 0x04]);
        // shr rax, cl
        assert_eq!(shr_cl(Gpr::Rax), vec![0x48, 0xd3, 0xe8]);
        // shift count must fit 6 bits
        assert!(shl_ri(Gpr::Rax, 64).is_err());
    }

    #[test]
    fn test_control_flow() {
        assert_eq!(jcc_rel32(Cc::E), vec![0x0f, 0x84, 0, 0, 0, 0]);
        assert_eq!(jcc_rel8(Cc::Ne), vec![0x75, 0]);
        assert_eq!(jmp_rel32(), vec![0xe9, 0, 0, 0, 0]);
        assert_eq!(call_rel32(), vec![0xe8, 0, 0, 0, 0]);
        assert_eq!(call_r(Gpr::Rax), vec![0xff, 0xd0]);
        assert_eq!(call_r(Gpr::R11), vec![0x41, 0xff, 0xd3]);
        assert_eq!(ret(), vec![0xc3]);
    }

    #[test]
    fn test_misc() {
        assert_eq!(hlt(), vec![0xf4]);
        assert_eq!(syscall(), vec![0x0f, 0x05]);
        assert_eq!(push(Gpr::Rbx), vec![0x53]);
        assert_eq!(push(Gpr::R12), vec![0x41, 0x54]);
        assert_eq!(pop(Gpr::R15), vec![0x41, 0x5f]);
        assert_eq!(test_rr(Gpr::Rax, Gpr::Rax), vec![0x48, 0x85, 0xc0]);
        assert_eq!(out_dx(Width::W8).unwrap(), vec![0xee]);
        assert_eq!(in_dx(Width::W32).unwrap(), vec![0xed]);
        assert!(out_dx(Width::W64).is_err());
    }
}
