//! Minimal static ELF64 wrapper for assembled programs.
//!
//! Produces a standalone executable from a linked [`Assembled`] image: one
//! RWX `PT_LOAD` segment containing the headers and the image, entry at
//! the image's entrypoint (offset 0). Because the load address is fixed at
//! wrap time, every relocation is applied here and the emitted binary
//! needs no dynamic linking. Test harnesses exec these directly.

use super::Assembled;
use crate::ir::Arch;

/// Virtual address the segment loads at.
const LOAD_BASE: u64 = 0x40_0000;

/// ELF header (64) + one program header (56).
const HEADER_SIZE: u64 = 64 + 56;

/// `e_machine` values.
const EM_X86_64: u16 = 62;
const EM_AARCH64: u16 = 183;

/// Wrap an assembled program into a minimal statically linked ELF64
/// executable image.
pub fn standalone_elf(program: &Assembled) -> Vec<u8> {
    let code_vaddr = LOAD_BASE + HEADER_SIZE;

    // The load address is known, so apply relocations now.
    let mut code = program.code.clone();
    for &off in &program.relocations {
        let at = off as usize;
        let mut slot = u64::from_le_bytes(code[at..at + 8].try_into().unwrap());
        slot = slot.wrapping_add(code_vaddr);
        code[at..at + 8].copy_from_slice(&slot.to_le_bytes());
    }

    let machine = match program.arch {
        Arch::X86_64 => EM_X86_64,
        Arch::Aarch64 => EM_AARCH64,
    };
    let file_size = HEADER_SIZE + code.len() as u64;

    let mut out = Vec::with_capacity(file_size as usize);

    // ELF header.
    out.extend_from_slice(&[0x7f, b'E', b'L', b'F']);
    out.push(2); // ELFCLASS64
    out.push(1); // ELFDATA2LSB
    out.push(1); // EV_CURRENT
    out.push(0); // ELFOSABI_NONE
    out.extend_from_slice(&[0; 8]); // padding
    out.extend_from_slice(&2u16.to_le_bytes()); // ET_EXEC
    out.extend_from_slice(&machine.to_le_bytes());
    out.extend_from_slice(&1u32.to_le_bytes()); // EV_CURRENT
    out.extend_from_slice(&code_vaddr.to_le_bytes()); // e_entry
    out.extend_from_slice(&64u64.to_le_bytes()); // e_phoff
    out.extend_from_slice(&0u64.to_le_bytes()); // e_shoff
    out.extend_from_slice(&0u32.to_le_bytes()); // e_flags
    out.extend_from_slice(&64u16.to_le_bytes()); // e_ehsize
    out.extend_from_slice(&56u16.to_le_bytes()); // e_phentsize
    out.extend_from_slice(&1u16.to_le_bytes()); // e_phnum
    out.extend_from_slice(&0u16.to_le_bytes()); // e_shentsize
    out.extend_from_slice(&0u16.to_le_bytes()); // e_shnum
    out.extend_from_slice(&0u16.to_le_bytes()); // e_shstrndx

    // Program header: one RWX PT_LOAD from file offset 0, BSS as the
    // memsz overhang.
    out.extend_from_slice(&1u32.to_le_bytes()); // PT_LOAD
    out.extend_from_slice(&7u32.to_le_bytes()); // RWX
    out.extend_from_slice(&0u64.to_le_bytes()); // p_offset
    out.extend_from_slice(&LOAD_BASE.to_le_bytes()); // p_vaddr
    out.extend_from_slice(&LOAD_BASE.to_le_bytes()); // p_paddr
    out.extend_from_slice(&file_size.to_le_bytes()); // p_filesz
    out.extend_from_slice(&(file_size + program.bss_size).to_le_bytes()); // p_memsz
    out.extend_from_slice(&0x1000u64.to_le_bytes()); // p_align

    debug_assert_eq!(out.len() as u64, HEADER_SIZE);
    out.extend_from_slice(&code);
    out
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::ir::{self, OpKind, Sys};

    fn sample(arch: Arch) -> Assembled {
        let mut p = ir::Program::new("main");
        p.method(
            "main",
            vec![
                ir::load_constant_bytes(b"hi\n".to_vec(), false, "msg", Some("len")),
                ir::syscall(Sys::Write, vec![ir::int(1), ir::var("msg"), ir::var("len")]),
                ir::assign(ir::var("code"), ir::int(0)),
                ir::op(OpKind::Add, "code", ir::var("code"), ir::int(0)),
                ir::syscall(Sys::ExitGroup, vec![ir::var("code")]),
                ir::ret(ir::int(0)),
            ],
        );
        super::super::build_standalone_program_for_arch(arch, &p).unwrap()
    }

    #[test]
    fn test_header_fields() {
        let elf = standalone_elf(&sample(Arch::X86_64));
        assert_eq!(&elf[0..4], &[0x7f, b'E', b'L', b'F']);
        assert_eq!(elf[4], 2); // 64-bit
        assert_eq!(elf[5], 1); // little endian
        assert_eq!(u16::from_le_bytes([elf[18], elf[19]]), EM_X86_64);
        let entry = u64::from_le_bytes(elf[24..32].try_into().unwrap());
        assert_eq!(entry, LOAD_BASE + HEADER_SIZE);
    }

    #[test]
    fn test_machine_tracks_arch() {
        let elf = standalone_elf(&sample(Arch::Aarch64));
        assert_eq!(u16::from_le_bytes([elf[18], elf[19]]), EM_AARCH64);
    }

    #[test]
    fn test_relocations_are_applied() {
        let program = sample(Arch::X86_64);
        assert!(!program.relocations.is_empty());
        let elf = standalone_elf(&program);
        for &off in &program.relocations {
            let file_at = HEADER_SIZE as usize + off as usize;
            let patched = u64::from_le_bytes(elf[file_at..file_at + 8].try_into().unwrap());
            let original =
                u64::from_le_bytes(program.code[off as usize..off as usize + 8].try_into().unwrap());
            assert_eq!(patched, original + LOAD_BASE + HEADER_SIZE);
            // Patched pointers land inside the loaded image.
            assert!(patched >= LOAD_BASE + HEADER_SIZE);
            assert!(patched < LOAD_BASE + HEADER_SIZE + program.code.len() as u64);
        }
    }

    #[test]
    fn test_segment_covers_file() {
        let program = sample(Arch::X86_64);
        let elf = standalone_elf(&program);
        let filesz = u64::from_le_bytes(elf[96..104].try_into().unwrap());
        assert_eq!(filesz, elf.len() as u64);
    }
}
