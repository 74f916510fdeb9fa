//! Linux boot helper for x86-64.
//!
//! Implements the 64-bit Linux boot protocol: load a bzImage or ELF
//! kernel into a VM's RAM window, populate the zero page (boot_params)
//! with the setup header, command line, optional initramfs descriptor and
//! an E820 memory map, then program vCPU 0 for long-mode entry.
//!
//! Reference: <https://www.kernel.org/doc/html/latest/x86/boot.html>
//!
//! # Guest physical layout
//!
//! ```text
//! 0x0000_7000 - 0x0000_8000  boot_params (zero page)
//! 0x0000_8000 - 0x0000_9000  early boot stack (top at 0x8ff0)
//! 0x0000_9000 - ...          identity paging structures + GDT
//! 0x0002_0000 - 0x0002_0800  kernel command line
//! 0x0010_0000 - kernel_end   kernel code (bzImage protected-mode part)
//! high RAM                   initramfs (page-aligned, below 1GiB)
//! ```
//!
//! The identity map covers `address_space_gib` GiB via 2 MiB pages; the
//! kernel replaces it with its own tables early in boot, so large guests
//! only need the window their entry path touches.

mod bzimage;
mod elf;
mod memory;
mod params;

pub use memory::GuestMemory;

use crate::hv::{HvError, VcpuOps};
use crate::ir::Reg;
use std::collections::BTreeMap;
use thiserror::Error;

/// Guest physical memory layout constants.
pub mod layout {
    /// boot_params (zero page) location.
    pub const ZERO_PAGE_START: u64 = 0x7000;

    /// Top of the early boot stack.
    pub const BOOT_STACK_TOP: u64 = 0x8ff0;

    /// Identity-paging structures (PML4 first) and GDT.
    pub const PAGING_BASE: u64 = 0x9000;

    /// Kernel command line location; must stay below 4GiB for the 32-bit
    /// `cmd_line_ptr` field.
    pub const CMDLINE_START: u64 = 0x2_0000;

    /// Maximum command line size accepted by modern kernels.
    pub const CMDLINE_MAX_SIZE: usize = 2048;

    /// The 1MiB mark where the protected-mode kernel loads.
    pub const HIMEM_START: u64 = 0x10_0000;

    /// 64-bit boot protocol selectors (__BOOT_CS / __BOOT_DS).
    pub const BOOT_CODE_SELECTOR: u16 = 0x10;
    pub const BOOT_DATA_SELECTOR: u16 = 0x18;
}

/// Errors from kernel loading and boot setup.
#[derive(Error, Debug)]
pub enum BootError {
    #[error("failed to allocate guest memory: {0}")]
    MemoryAllocation(#[source] std::io::Error),

    #[error("guest memory access at {addr:#x} failed: {detail}")]
    MemoryAccess { addr: u64, detail: String },

    #[error("invalid kernel image: {0}")]
    InvalidKernel(String),

    #[error("command line too long: {len} bytes (max {max})")]
    CmdlineTooLong { len: usize, max: usize },

    #[error("guest memory too small: {size:#x} bytes (minimum {min:#x})")]
    MemoryTooSmall { size: u64, min: u64 },

    #[error("initramfs of {len:#x} bytes does not fit guest memory")]
    InitramfsTooLarge { len: usize },
}

/// An E820 memory map entry supplied by the caller, or synthesized.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub struct E820Entry {
    pub addr: u64,
    pub size: u64,
    pub kind: E820Type,
}

/// E820 region types.
#[repr(u32)]
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum E820Type {
    /// Usable RAM.
    Ram = 1,
    /// Reserved by firmware or hardware.
    Reserved = 2,
}

/// Boot configuration.
pub struct BootConfig {
    /// Kernel command line (null terminator added on write).
    pub cmdline: String,
    /// Optional initramfs image, copied high into RAM with its address
    /// and size written into the setup header. This is how the compiled
    /// init payload rides into the guest.
    pub initramfs: Option<Vec<u8>>,
    /// Caller-supplied E820 map; `None` synthesizes the standard
    /// three-entry map (kernels fall back to legacy probing with fewer
    /// than two entries).
    pub e820: Option<Vec<E820Entry>>,
}

impl Default for BootConfig {
    fn default() -> Self {
        BootConfig {
            cmdline: "console=ttyS0".to_string(),
            initramfs: None,
            e820: None,
        }
    }
}

/// Everything later stages need to know about where the kernel landed.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub struct KernelLayout {
    pub load_gpa: u64,
    pub entry_gpa: u64,
    pub zero_page_gpa: u64,
    pub cmdline_gpa: u64,
    pub stack_top_gpa: u64,
    pub paging_base: u64,
    pub address_space_gib: u64,
}

/// A kernel image in either supported container format. The caller opens
/// and reads the file; the boot helper only sees bytes.
pub enum KernelImage<'a> {
    BzImage(&'a [u8]),
    Elf(&'a [u8]),
}

impl<'a> KernelImage<'a> {
    /// Sniff the container format from the image bytes.
    pub fn detect(data: &'a [u8]) -> Result<Self, BootError> {
        if data.len() >= 4 && data[..4] == [0x7f, b'E', b'L', b'F'] {
            return Ok(KernelImage::Elf(data));
        }
        if data.len() > 0x206 && bzimage::has_boot_magic(data) {
            return Ok(KernelImage::BzImage(data));
        }
        Err(BootError::InvalidKernel(
            "neither an ELF vmlinux nor a bzImage".to_string(),
        ))
    }
}

/// Load a kernel and prepare the zero page; returns the layout used.
pub fn setup_boot(
    memory: &GuestMemory,
    kernel: KernelImage<'_>,
    config: &BootConfig,
) -> Result<KernelLayout, BootError> {
    if memory.size() <= layout::HIMEM_START {
        return Err(BootError::MemoryTooSmall {
            size: memory.size(),
            min: layout::HIMEM_START + 1,
        });
    }

    let loaded = match kernel {
        KernelImage::BzImage(data) => bzimage::load(memory, data)?,
        KernelImage::Elf(data) => elf::load(memory, data)?,
    };

    let initramfs = match &config.initramfs {
        Some(image) => Some(params::place_initramfs(memory, image)?),
        None => None,
    };

    params::setup_zero_page(memory, config, &loaded, initramfs)?;

    // Identity-map enough address space to cover RAM, bounded so the
    // page tables stay below the command line at 0x20000.
    let gib = memory.size().div_ceil(1 << 30).clamp(1, 16);

    eprintln!(
        "[Boot] entry {:#x}, zero page {:#x}, {} GiB identity mapped",
        loaded.entry_gpa,
        layout::ZERO_PAGE_START,
        gib
    );

    Ok(KernelLayout {
        load_gpa: loaded.load_gpa,
        entry_gpa: loaded.entry_gpa,
        zero_page_gpa: layout::ZERO_PAGE_START,
        cmdline_gpa: layout::CMDLINE_START,
        stack_top_gpa: layout::BOOT_STACK_TOP,
        paging_base: layout::PAGING_BASE,
        address_space_gib: gib,
    })
}

/// Program a vCPU for 64-bit kernel entry per the boot protocol: long
/// mode with the boot selectors, RIP at the entry point, RSI pointing at
/// the zero page, general registers otherwise clear.
pub fn configure_vcpu(vcpu: &mut dyn VcpuOps, layout: &KernelLayout) -> Result<(), HvError> {
    vcpu.set_long_mode_with_selectors(
        layout.paging_base,
        layout.address_space_gib,
        layout::BOOT_CODE_SELECTOR,
        layout::BOOT_DATA_SELECTOR,
    )?;

    let mut regs: BTreeMap<Reg, u64> = BTreeMap::new();
    for reg in [
        Reg::Rax,
        Reg::Rbx,
        Reg::Rcx,
        Reg::Rdx,
        Reg::Rdi,
        Reg::R8,
        Reg::R9,
        Reg::R10,
        Reg::R11,
        Reg::R12,
        Reg::R13,
        Reg::R14,
        Reg::R15,
    ] {
        regs.insert(reg, 0);
    }
    regs.insert(Reg::Rip, layout.entry_gpa);
    regs.insert(Reg::Rsi, layout.zero_page_gpa);
    regs.insert(Reg::Rsp, layout.stack_top_gpa);
    regs.insert(Reg::Rbp, layout.stack_top_gpa);
    // Reserved bit 1 only; interrupts stay off until the kernel is ready.
    regs.insert(Reg::Rflags, 0x2);
    vcpu.set_registers(&regs)
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_detect_rejects_garbage() {
        assert!(KernelImage::detect(b"not a kernel").is_err());
    }

    #[test]
    fn test_detect_elf() {
        let mut image = vec![0u8; 64];
        image[..4].copy_from_slice(&[0x7f, b'E', b'L', b'F']);
        assert!(matches!(
            KernelImage::detect(&image),
            Ok(KernelImage::Elf(_))
        ));
    }

    #[test]
    fn test_memory_too_small() {
        let memory = GuestMemory::new(0x8000).unwrap();
        let image = crate::boot::bzimage::tests::minimal_bzimage();
        let err = setup_boot(
            &memory,
            KernelImage::detect(&image).unwrap(),
            &BootConfig::default(),
        );
        assert!(matches!(err, Err(BootError::MemoryTooSmall { .. })));
    }
}
