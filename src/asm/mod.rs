//! Assembler context and link step.
//!
//! The per-architecture lowering passes emit encoded instruction bytes into
//! an [`Assembler`], together with the bookkeeping that cannot be resolved
//! while emitting: label positions, unresolved branches, constant-pool
//! entries, and pointer slots that need the final load address. A single
//! [`Assembler::finalize`] call lays the sections out, patches every branch,
//! resolves every pointer, and returns the relocatable blob.
//!
//! # Image layout
//!
//! ```text
//! ┌───────────────┐ 0
//! │     text      │   method bodies, entrypoint first
//! ├───────────────┤ align 8
//! │ literal pool  │   64-bit slots for AArch64 LDR-literal loads
//! ├───────────────┤ align 8
//! │  const data   │   deduplicated embedded blobs
//! └───────────────┘
//!     (BSS is reported in `bss_size`, never emitted)
//! ```
//!
//! Every pointer slot holds the image-relative offset of its target; the
//! relocation list records where those slots are. A loader makes the image
//! runnable by adding its chosen base address to each listed slot, which is
//! exactly what the guest init payload does after copying a payload into
//! its execution arena.
//!
//! Labels arrive already method-qualified (`method.label`) so one table
//! serves the whole program; method entry labels are the bare method names,
//! which is how `CallMethod` links.

mod aarch64_lower;
mod x86_64_lower;

pub mod aarch64;
pub mod elf;
pub mod x86_64;

use crate::ir::{self, Arch, Program};
use std::collections::BTreeMap;
use thiserror::Error;

/// Errors from encoding, lowering, and linking. All of these are fatal at
/// build time; nothing is handed to a VM until assembly fully succeeds.
#[derive(Debug, Error)]
pub enum AsmError {
    #[error("immediate {value:#x} does not fit in {bits}-bit field of {insn}")]
    ImmediateRange {
        insn: &'static str,
        value: i64,
        bits: u8,
    },

    #[error("{insn}: operand must be {expected}")]
    OperandClass {
        insn: &'static str,
        expected: &'static str,
    },

    #[error("{insn}: offset {offset:#x} must be a multiple of {align}")]
    Misaligned {
        insn: &'static str,
        offset: i64,
        align: u8,
    },

    #[error("label {0} declared twice")]
    DuplicateLabel(String),

    #[error("branch to undefined label {0}")]
    UndefinedLabel(String),

    #[error("branch to {label} out of range: displacement {disp:#x} exceeds {kind}")]
    BranchRange {
        label: String,
        disp: i64,
        kind: &'static str,
    },

    #[error("method {method}: {detail}")]
    Lowering { method: String, detail: String },

    #[error("program has no method named {0}")]
    MissingMethod(String),

    #[error(transparent)]
    Expand(#[from] ir::expand::ExpandError),
}

/// A section of the assembled image.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum Section {
    Text,
    LiteralPool,
    ConstData,
}

/// A fully linked, relocatable program image.
///
/// `code` holds text, literal pool, and constant data back to back; the
/// entrypoint is always at offset 0. `relocations` are offsets of 64-bit
/// little-endian slots whose stored value must have the load base address
/// added before execution.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct Assembled {
    pub arch: Arch,
    pub code: Vec<u8>,
    pub relocations: Vec<u32>,
    pub bss_size: u64,
}

/// The flavor of an unresolved label branch.
#[derive(Debug, Clone, Copy)]
enum BranchKind {
    /// x86 8-bit displacement, relative to the end of the instruction.
    X86Rel8 { at: usize, insn_end: usize },
    /// x86 32-bit displacement, relative to the end of the instruction.
    X86Rel32 { at: usize, insn_end: usize },
    /// AArch64 B/BL 26-bit word displacement.
    A64Imm26 { insn_at: usize },
    /// AArch64 B.cond / CBZ-style 19-bit word displacement.
    A64Imm19 { insn_at: usize },
}

#[derive(Debug)]
struct BranchFixup {
    kind: BranchKind,
    target: String,
}

/// An AArch64 LDR-literal referencing a pool or data offset directly
/// (no label indirection).
#[derive(Debug)]
struct LiteralFixup {
    insn_at: usize,
    target_section: Section,
    target_off: usize,
}

/// A 64-bit slot that must receive the image-relative address of its
/// target at link time, and be listed as a relocation.
#[derive(Debug)]
struct PointerPatch {
    at_section: Section,
    at: usize,
    target_section: Section,
    target_off: usize,
}

/// Accumulates one program's worth of emitted code and patch requests.
pub struct Assembler {
    arch: Arch,
    text: Vec<u8>,
    literal_pool: Vec<u8>,
    const_data: Vec<u8>,
    /// Structural dedup of embedded blobs: (bytes, zero_terminated) → offset.
    const_index: BTreeMap<(Vec<u8>, bool), usize>,
    labels: BTreeMap<String, usize>,
    branch_fixups: Vec<BranchFixup>,
    literal_fixups: Vec<LiteralFixup>,
    pointer_patches: Vec<PointerPatch>,
    bss_size: u64,
    /// Counter for synthesized control-flow labels. Owned here so repeated
    /// assemblies of the same program produce identical bytes.
    fresh_counter: u64,
}

impl Assembler {
    pub fn new(arch: Arch) -> Self {
        Assembler {
            arch,
            text: Vec::new(),
            literal_pool: Vec::new(),
            const_data: Vec::new(),
            const_index: BTreeMap::new(),
            labels: BTreeMap::new(),
            branch_fixups: Vec::new(),
            literal_fixups: Vec::new(),
            pointer_patches: Vec::new(),
            bss_size: 0,
            fresh_counter: 0,
        }
    }

    pub fn arch(&self) -> Arch {
        self.arch
    }

    /// Current end of the text section.
    pub fn offset(&self) -> usize {
        self.text.len()
    }

    /// Append encoded instruction bytes.
    pub fn emit(&mut self, bytes: &[u8]) {
        self.text.extend_from_slice(bytes);
    }

    /// Fix a label at the current text offset.
    pub fn bind_label(&mut self, name: &str) -> Result<(), AsmError> {
        if self
            .labels
            .insert(name.to_string(), self.text.len())
            .is_some()
        {
            return Err(AsmError::DuplicateLabel(name.to_string()));
        }
        Ok(())
    }

    /// The bound offset of a label, if it has been bound yet. Lowering uses
    /// this to pick the short branch form for backward targets.
    pub fn label_offset(&self, name: &str) -> Option<usize> {
        self.labels.get(name).copied()
    }

    /// A program-unique synthesized label.
    pub fn fresh_label(&mut self, method: &str, hint: &str) -> String {
        let n = self.fresh_counter;
        self.fresh_counter += 1;
        format!("{method}.__{hint}{n}")
    }

    /// Record an x86 rel8 displacement to patch.
    pub fn fixup_rel8(&mut self, at: usize, insn_end: usize, target: &str) {
        self.branch_fixups.push(BranchFixup {
            kind: BranchKind::X86Rel8 { at, insn_end },
            target: target.to_string(),
        });
    }

    /// Record an x86 rel32 displacement to patch.
    pub fn fixup_rel32(&mut self, at: usize, insn_end: usize, target: &str) {
        self.branch_fixups.push(BranchFixup {
            kind: BranchKind::X86Rel32 { at, insn_end },
            target: target.to_string(),
        });
    }

    /// Record an AArch64 26-bit branch displacement to patch.
    pub fn fixup_imm26(&mut self, insn_at: usize, target: &str) {
        self.branch_fixups.push(BranchFixup {
            kind: BranchKind::A64Imm26 { insn_at },
            target: target.to_string(),
        });
    }

    /// Record an AArch64 19-bit branch displacement to patch.
    pub fn fixup_imm19(&mut self, insn_at: usize, target: &str) {
        self.branch_fixups.push(BranchFixup {
            kind: BranchKind::A64Imm19 { insn_at },
            target: target.to_string(),
        });
    }

    /// Record an AArch64 LDR-literal whose 19-bit displacement must reach
    /// `(section, offset)` in the final layout.
    pub fn fixup_ldr_literal(&mut self, insn_at: usize, section: Section, offset: usize) {
        self.literal_fixups.push(LiteralFixup {
            insn_at,
            target_section: section,
            target_off: offset,
        });
    }

    /// Overwrite a 32-bit little-endian field already emitted into text.
    /// Used to patch the frame-reserve immediate once a method's spill
    /// count is known.
    pub fn patch_text_u32(&mut self, at: usize, value: u32) {
        self.text[at..at + 4].copy_from_slice(&value.to_le_bytes());
    }

    /// Overwrite a whole 32-bit instruction word already emitted into text.
    pub fn patch_text_word(&mut self, at: usize, word: &[u8]) {
        self.text[at..at + 4].copy_from_slice(&word[..4]);
    }

    /// Intern an embedded constant blob; identical blobs share one copy.
    /// Returns the blob's offset within the const-data section.
    pub fn intern_constant(&mut self, data: &[u8], zero_terminate: bool) -> usize {
        let key = (data.to_vec(), zero_terminate);
        if let Some(&off) = self.const_index.get(&key) {
            return off;
        }
        let off = self.const_data.len();
        self.const_data.extend_from_slice(data);
        if zero_terminate {
            self.const_data.push(0);
        }
        self.const_index.insert(key, off);
        off
    }

    /// Reserve an 8-byte literal-pool slot holding `value`, returning its
    /// pool offset.
    pub fn alloc_literal(&mut self, value: u64) -> usize {
        let off = self.literal_pool.len();
        self.literal_pool.extend_from_slice(&value.to_le_bytes());
        off
    }

    /// Mark a 64-bit slot at `(at_section, at)` as holding the address of
    /// `(target_section, target_off)`; the link step writes the
    /// image-relative value and records the slot as a relocation.
    pub fn patch_pointer(
        &mut self,
        at_section: Section,
        at: usize,
        target_section: Section,
        target_off: usize,
    ) {
        self.pointer_patches.push(PointerPatch {
            at_section,
            at,
            target_section,
            target_off,
        });
    }

    /// Reserve `size` bytes of zeroed space after the image; returns the
    /// offset of the reservation within the BSS.
    pub fn reserve_bss(&mut self, size: u64) -> u64 {
        let off = self.bss_size;
        self.bss_size += size;
        off
    }

    /// Lay out sections, resolve every branch and pointer, and return the
    /// linked image.
    pub fn finalize(mut self) -> Result<Assembled, AsmError> {
        let pool_base = align_up(self.text.len(), 8);
        let data_base = align_up(pool_base + self.literal_pool.len(), 8);
        let total = data_base + self.const_data.len();

        let section_base = |s: Section| match s {
            Section::Text => 0usize,
            Section::LiteralPool => pool_base,
            Section::ConstData => data_base,
        };

        // Branches first: they only ever target text labels.
        for fixup in std::mem::take(&mut self.branch_fixups) {
            let target = *self
                .labels
                .get(&fixup.target)
                .ok_or_else(|| AsmError::UndefinedLabel(fixup.target.clone()))?;
            match fixup.kind {
                BranchKind::X86Rel8 { at, insn_end } => {
                    let disp = target as i64 - insn_end as i64;
                    let rel: i8 = disp.try_into().map_err(|_| AsmError::BranchRange {
                        label: fixup.target.clone(),
                        disp,
                        kind: "rel8",
                    })?;
                    self.text[at] = rel as u8;
                }
                BranchKind::X86Rel32 { at, insn_end } => {
                    let disp = target as i64 - insn_end as i64;
                    let rel: i32 = disp.try_into().map_err(|_| AsmError::BranchRange {
                        label: fixup.target.clone(),
                        disp,
                        kind: "rel32",
                    })?;
                    self.text[at..at + 4].copy_from_slice(&rel.to_le_bytes());
                }
                BranchKind::A64Imm26 { insn_at } => {
                    let disp = target as i64 - insn_at as i64;
                    let words = branch_words(&fixup.target, disp, 26)?;
                    patch_word(&mut self.text, insn_at, words as u32 & 0x03ff_ffff, 0);
                }
                BranchKind::A64Imm19 { insn_at } => {
                    let disp = target as i64 - insn_at as i64;
                    let words = branch_words(&fixup.target, disp, 19)?;
                    patch_word(&mut self.text, insn_at, words as u32 & 0x7ffff, 5);
                }
            }
        }

        // LDR-literal displacements now that pool/data bases are fixed.
        for fixup in std::mem::take(&mut self.literal_fixups) {
            let target = section_base(fixup.target_section) + fixup.target_off;
            let disp = target as i64 - fixup.insn_at as i64;
            let words = branch_words("<literal>", disp, 19)?;
            patch_word(&mut self.text, fixup.insn_at, words as u32 & 0x7ffff, 5);
        }

        // Assemble the final image.
        let mut code = Vec::with_capacity(total);
        code.extend_from_slice(&self.text);
        code.resize(pool_base, 0);
        code.extend_from_slice(&self.literal_pool);
        code.resize(data_base, 0);
        code.extend_from_slice(&self.const_data);

        // Pointer slots: write image-relative addresses, record relocations.
        let mut relocations = Vec::with_capacity(self.pointer_patches.len());
        for patch in &self.pointer_patches {
            let slot = section_base(patch.at_section) + patch.at;
            let value = (section_base(patch.target_section) + patch.target_off) as u64;
            code[slot..slot + 8].copy_from_slice(&value.to_le_bytes());
            relocations.push(slot as u32);
        }
        relocations.sort_unstable();

        Ok(Assembled {
            arch: self.arch,
            code,
            relocations,
            bss_size: self.bss_size,
        })
    }
}

/// Check an AArch64 word-granular displacement and convert to words.
fn branch_words(label: &str, disp: i64, bits: u8) -> Result<i64, AsmError> {
    if disp % 4 != 0 {
        return Err(AsmError::Misaligned {
            insn: "branch",
            offset: disp,
            align: 4,
        });
    }
    let words = disp / 4;
    let limit = 1i64 << (bits - 1);
    if words < -limit || words >= limit {
        return Err(AsmError::BranchRange {
            label: label.to_string(),
            disp,
            kind: if bits == 26 { "imm26" } else { "imm19" },
        });
    }
    Ok(words)
}

/// OR a field into a 32-bit little-endian instruction word in place.
fn patch_word(text: &mut [u8], at: usize, field: u32, shift: u8) {
    let mut word = u32::from_le_bytes([text[at], text[at + 1], text[at + 2], text[at + 3]]);
    word |= field << shift;
    text[at..at + 4].copy_from_slice(&word.to_le_bytes());
}

fn align_up(v: usize, align: usize) -> usize {
    (v + align - 1) & !(align - 1)
}

/// Lower and link a whole IR program for the given architecture.
///
/// Printf fragments are desugared first; the entrypoint method is emitted
/// at offset 0, remaining methods follow in name order. The result is
/// deterministic for identical inputs.
pub fn build_standalone_program_for_arch(
    arch: Arch,
    program: &Program,
) -> Result<Assembled, AsmError> {
    let program = ir::expand::expand_program(arch, program)?;

    if !program.methods.contains_key(&program.entrypoint) {
        return Err(AsmError::MissingMethod(program.entrypoint.clone()));
    }

    let mut asm = Assembler::new(arch);

    let mut order: Vec<&String> = Vec::with_capacity(program.methods.len());
    order.push(&program.entrypoint);
    order.extend(program.methods.keys().filter(|n| **n != program.entrypoint));

    for name in order {
        let body = &program.methods[name];
        match arch {
            Arch::X86_64 => x86_64_lower::lower_method(&mut asm, name, body)?,
            Arch::Aarch64 => aarch64_lower::lower_method(&mut asm, name, body)?,
        }
    }

    asm.finalize()
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_label_rebinding_rejected() {
        let mut asm = Assembler::new(Arch::X86_64);
        asm.bind_label("main.loop").unwrap();
        assert!(matches!(
            asm.bind_label("main.loop"),
            Err(AsmError::DuplicateLabel(_))
        ));
    }

    #[test]
    fn test_undefined_label_rejected() {
        let mut asm = Assembler::new(Arch::X86_64);
        asm.emit(&[0xe9, 0, 0, 0, 0]);
        asm.fixup_rel32(1, 5, "main.nowhere");
        assert!(matches!(
            asm.finalize(),
            Err(AsmError::UndefinedLabel(_))
        ));
    }

    #[test]
    fn test_constant_dedup() {
        let mut asm = Assembler::new(Arch::X86_64);
        let a = asm.intern_constant(b"hello", true);
        let b = asm.intern_constant(b"hello", true);
        let c = asm.intern_constant(b"hello", false);
        assert_eq!(a, b);
        assert_ne!(a, c);
    }

    #[test]
    fn test_rel8_patching() {
        let mut asm = Assembler::new(Arch::X86_64);
        asm.bind_label("m.top").unwrap();
        // jmp rel8 back to offset 0: opcode EB, displacement at offset 1,
        // instruction ends at 2, so the displacement is -2.
        asm.emit(&[0xeb, 0x00]);
        asm.fixup_rel8(1, 2, "m.top");
        let out = asm.finalize().unwrap();
        assert_eq!(out.code, vec![0xeb, 0xfe]);
    }

    #[test]
    fn test_rel8_range_enforced() {
        let mut asm = Assembler::new(Arch::X86_64);
        asm.bind_label("m.top").unwrap();
        // Pad so the displacement back to 0 is exactly one byte too far.
        asm.emit(&vec![0x90; 127]);
        asm.emit(&[0xeb, 0x00]);
        asm.fixup_rel8(128, 129, "m.top");
        assert!(matches!(
            asm.finalize(),
            Err(AsmError::BranchRange { kind: "rel8", .. })
        ));
    }

    #[test]
    fn test_rel8_at_limit() {
        let mut asm = Assembler::new(Arch::X86_64);
        asm.bind_label("m.top").unwrap();
        // displacement = 0 - 128 = -128, the rel8 minimum: still fine.
        asm.emit(&vec![0x90; 126]);
        asm.emit(&[0xeb, 0x00]);
        asm.fixup_rel8(127, 128, "m.top");
        let out = asm.finalize().unwrap();
        assert_eq!(out.code[127], 0x80);
    }

    #[test]
    fn test_pointer_patch_and_relocation() {
        let mut asm = Assembler::new(Arch::X86_64);
        // mov rax, imm64 with a placeholder immediate.
        asm.emit(&[0x48, 0xb8]);
        let imm_at = asm.offset();
        asm.emit(&[0; 8]);
        let blob = asm.intern_constant(b"hi", true);
        asm.patch_pointer(Section::Text, imm_at, Section::ConstData, blob);
        let out = asm.finalize().unwrap();

        assert_eq!(out.relocations, vec![2]);
        let slot = u64::from_le_bytes(out.code[2..10].try_into().unwrap());
        // Text is 10 bytes, data base aligns to 16.
        assert_eq!(slot, 16);
        assert_eq!(&out.code[16..19], b"hi\0");
    }

    #[test]
    fn test_a64_backward_branch() {
        let mut asm = Assembler::new(Arch::Aarch64);
        asm.bind_label("m.top").unwrap();
        asm.emit(&0xd503201fu32.to_le_bytes()); // nop
        let at = asm.offset();
        asm.emit(&0x14000000u32.to_le_bytes()); // b
        asm.fixup_imm26(at, "m.top");
        let out = asm.finalize().unwrap();
        let word = u32::from_le_bytes(out.code[4..8].try_into().unwrap());
        // B with imm26 = -1 word.
        assert_eq!(word, 0x14000000 | 0x03ff_ffff);
    }

    #[test]
    fn test_a64_branch_range_limits() {
        // The 26-bit word field spans [-2^25, 2^25) words = ±128 MiB.
        assert!(branch_words("l", (1 << 27) - 4, 26).is_ok());
        assert!(branch_words("l", 1 << 27, 26).is_err());
        assert!(branch_words("l", -(1 << 27), 26).is_ok());
        assert!(branch_words("l", -(1 << 27) - 4, 26).is_err());
        // Byte displacements must be whole words.
        assert!(branch_words("l", 2, 26).is_err());
    }

    #[test]
    fn test_deterministic() {
        let build = || {
            let mut asm = Assembler::new(Arch::X86_64);
            asm.bind_label("m").unwrap();
            asm.emit(&[0x48, 0xb8]);
            let at = asm.offset();
            asm.emit(&[0; 8]);
            let blob = asm.intern_constant(b"abc", false);
            asm.patch_pointer(Section::Text, at, Section::ConstData, blob);
            asm.finalize().unwrap()
        };
        assert_eq!(build(), build());
    }
}
