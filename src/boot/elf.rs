//! ELF (vmlinux) kernel loading.
//!
//! The uncompressed vmlinux is a plain ELF64: copy each `PT_LOAD` segment
//! to its physical address and enter at `e_entry`. Kernel virtual
//! addresses in the direct-map region are translated down to physical by
//! subtracting the fixed `__START_KERNEL_map` offset.

use super::bzimage::LoadedKernel;
use super::{BootError, GuestMemory};

const PT_LOAD: u32 = 1;

/// x86-64 kernel text mapping base; vaddrs above it are `paddr + base`.
const START_KERNEL_MAP: u64 = 0xffff_ffff_8000_0000;

fn field_u16(data: &[u8], at: usize) -> u16 {
    u16::from_le_bytes([data[at], data[at + 1]])
}

fn field_u32(data: &[u8], at: usize) -> u32 {
    u32::from_le_bytes([data[at], data[at + 1], data[at + 2], data[at + 3]])
}

fn field_u64(data: &[u8], at: usize) -> u64 {
    u64::from_le_bytes(data[at..at + 8].try_into().unwrap())
}

/// Copy a vmlinux's loadable segments into guest memory.
pub(super) fn load(memory: &GuestMemory, data: &[u8]) -> Result<LoadedKernel, BootError> {
    if data.len() < 64 || data[..4] != [0x7f, b'E', b'L', b'F'] {
        return Err(BootError::InvalidKernel("not an ELF image".into()));
    }
    if data[4] != 2 || data[5] != 1 {
        return Err(BootError::InvalidKernel(
            "ELF kernel must be 64-bit little-endian".into(),
        ));
    }

    let e_entry = field_u64(data, 24);
    let e_phoff = field_u64(data, 32) as usize;
    let e_phentsize = field_u16(data, 54) as usize;
    let e_phnum = field_u16(data, 56) as usize;

    if e_phnum == 0 || e_phoff + e_phnum * e_phentsize > data.len() {
        return Err(BootError::InvalidKernel(
            "ELF program headers out of range".into(),
        ));
    }

    let mut load_gpa = u64::MAX;
    for i in 0..e_phnum {
        let ph = e_phoff + i * e_phentsize;
        if field_u32(data, ph) != PT_LOAD {
            continue;
        }
        let p_offset = field_u64(data, ph + 8) as usize;
        let p_paddr = field_u64(data, ph + 24);
        let p_filesz = field_u64(data, ph + 32) as usize;
        let p_memsz = field_u64(data, ph + 40) as usize;

        if p_offset + p_filesz > data.len() {
            return Err(BootError::InvalidKernel(format!(
                "segment {i} file range out of bounds"
            )));
        }

        memory.write(p_paddr, &data[p_offset..p_offset + p_filesz])?;
        if p_memsz > p_filesz {
            // BSS overhang; guest RAM starts zeroed, but be explicit for
            // restored snapshots and reruns.
            let zeros = vec![0u8; p_memsz - p_filesz];
            memory.write(p_paddr + p_filesz as u64, &zeros)?;
        }
        load_gpa = load_gpa.min(p_paddr);
    }

    if load_gpa == u64::MAX {
        return Err(BootError::InvalidKernel("no PT_LOAD segments".into()));
    }

    let entry_gpa = if e_entry >= START_KERNEL_MAP {
        e_entry - START_KERNEL_MAP
    } else {
        e_entry
    };

    eprintln!("[Boot] ELF kernel: {e_phnum} segments, entry {entry_gpa:#x}");

    Ok(LoadedKernel {
        load_gpa,
        entry_gpa,
        setup_header: Vec::new(),
    })
}

#[cfg(test)]
mod tests {
    use super::*;

    fn minimal_vmlinux(entry: u64, paddr: u64) -> Vec<u8> {
        let mut image = vec![0u8; 0x200];
        image[..4].copy_from_slice(&[0x7f, b'E', b'L', b'F']);
        image[4] = 2;
        image[5] = 1;
        image[24..32].copy_from_slice(&entry.to_le_bytes());
        image[32..40].copy_from_slice(&64u64.to_le_bytes()); // e_phoff
        image[54..56].copy_from_slice(&56u16.to_le_bytes()); // e_phentsize
        image[56..58].copy_from_slice(&1u16.to_le_bytes()); // e_phnum
        // One PT_LOAD at file offset 0x120, 8 bytes, paddr as given.
        let ph = 64;
        image[ph..ph + 4].copy_from_slice(&PT_LOAD.to_le_bytes());
        image[ph + 8..ph + 16].copy_from_slice(&0x120u64.to_le_bytes());
        image[ph + 24..ph + 32].copy_from_slice(&paddr.to_le_bytes());
        image[ph + 32..ph + 40].copy_from_slice(&8u64.to_le_bytes());
        image[ph + 40..ph + 48].copy_from_slice(&16u64.to_le_bytes());
        image[0x120..0x128].copy_from_slice(b"VMLINUX!");
        image
    }

    #[test]
    fn test_load_segment_at_paddr() {
        let memory = GuestMemory::new(4 << 20).unwrap();
        let image = minimal_vmlinux(0x10_0000, 0x10_0000);
        let loaded = load(&memory, &image).unwrap();
        assert_eq!(loaded.load_gpa, 0x10_0000);
        assert_eq!(loaded.entry_gpa, 0x10_0000);

        let mut buf = [0u8; 8];
        memory.read(0x10_0000, &mut buf).unwrap();
        assert_eq!(&buf, b"VMLINUX!");
    }

    #[test]
    fn test_high_vaddr_entry_translated() {
        let memory = GuestMemory::new(4 << 20).unwrap();
        let image = minimal_vmlinux(START_KERNEL_MAP + 0x100_0000, 0x10_0000);
        let loaded = load(&memory, &image).unwrap();
        assert_eq!(loaded.entry_gpa, 0x100_0000);
    }

    #[test]
    fn test_no_load_segments_rejected() {
        let memory = GuestMemory::new(4 << 20).unwrap();
        let mut image = minimal_vmlinux(0x10_0000, 0x10_0000);
        image[64..68].copy_from_slice(&2u32.to_le_bytes()); // PT_DYNAMIC
        assert!(matches!(
            load(&memory, &image),
            Err(BootError::InvalidKernel(_))
        ));
    }
}
