//! Zero page (boot_params) population.
//!
//! The 4KiB boot_params structure carries everything the kernel needs to
//! understand its environment: the setup header copied from the bzImage
//! (with loader fields overridden), the command-line pointer, the
//! initramfs descriptor, and the E820 memory map.
//!
//! Reference: <https://www.kernel.org/doc/html/latest/x86/zero-page.html>

use super::bzimage::LoadedKernel;
use super::{layout, BootConfig, BootError, E820Entry, E820Type, GuestMemory};

const ZERO_PAGE_SIZE: usize = 4096;

/// Byte offsets within boot_params / the setup header.
mod offsets {
    /// Number of E820 entries (1 byte).
    pub const E820_ENTRIES: usize = 0x1e8;
    /// Setup header start.
    pub const SETUP_HEADER: usize = 0x1f1;
    /// type_of_loader (1 byte).
    pub const TYPE_OF_LOADER: usize = 0x210;
    /// loadflags (1 byte).
    pub const LOADFLAGS: usize = 0x211;
    /// ramdisk_image (4 bytes): initramfs physical address.
    pub const RAMDISK_IMAGE: usize = 0x218;
    /// ramdisk_size (4 bytes).
    pub const RAMDISK_SIZE: usize = 0x21c;
    /// cmd_line_ptr (4 bytes).
    pub const CMD_LINE_PTR: usize = 0x228;
    /// E820 map array (128 entries × 20 bytes).
    pub const E820_MAP: usize = 0x2d0;
}

/// Highest address the initramfs is placed at; conservative so old
/// kernels with a low `initrd_addr_max` still find it.
const INITRAMFS_CEILING: u64 = 0x3800_0000;

/// Copy the initramfs high into RAM, page-aligned. Returns `(gpa, len)`.
pub(super) fn place_initramfs(
    memory: &GuestMemory,
    image: &[u8],
) -> Result<(u64, u32), BootError> {
    let ceiling = memory.size().min(INITRAMFS_CEILING);
    let len = image.len() as u64;
    // Leave headroom above the kernel image at 1MiB.
    let floor = layout::HIMEM_START + (64 << 20);
    let addr = ceiling
        .checked_sub(len)
        .map(|a| a & !0xfff)
        .filter(|&a| a >= floor)
        .ok_or(BootError::InitramfsTooLarge { len: image.len() })?;

    memory.write(addr, image)?;
    eprintln!("[Boot] initramfs: {len} bytes at {addr:#x}");
    Ok((addr, len as u32))
}

/// Build and write boot_params.
pub(super) fn setup_zero_page(
    memory: &GuestMemory,
    config: &BootConfig,
    loaded: &LoadedKernel,
    initramfs: Option<(u64, u32)>,
) -> Result<(), BootError> {
    let mut params = [0u8; ZERO_PAGE_SIZE];

    // Setup header from the image (bzImage), then overrides.
    let header_len = loaded
        .setup_header
        .len()
        .min(ZERO_PAGE_SIZE - offsets::SETUP_HEADER);
    params[offsets::SETUP_HEADER..offsets::SETUP_HEADER + header_len]
        .copy_from_slice(&loaded.setup_header[..header_len]);

    // 0xff: undefined loader type, extended fields in use.
    params[offsets::TYPE_OF_LOADER] = 0xff;
    // LOADED_HIGH (kernel at 1MiB) + CAN_USE_HEAP.
    params[offsets::LOADFLAGS] |= 0x01 | 0x80;

    params[offsets::CMD_LINE_PTR..offsets::CMD_LINE_PTR + 4]
        .copy_from_slice(&(layout::CMDLINE_START as u32).to_le_bytes());

    if let Some((addr, size)) = initramfs {
        params[offsets::RAMDISK_IMAGE..offsets::RAMDISK_IMAGE + 4]
            .copy_from_slice(&(addr as u32).to_le_bytes());
        params[offsets::RAMDISK_SIZE..offsets::RAMDISK_SIZE + 4]
            .copy_from_slice(&size.to_le_bytes());
    }

    let e820 = match &config.e820 {
        Some(entries) => entries.clone(),
        None => default_e820(memory.size()),
    };
    let count = e820.len().min(128);
    for (i, entry) in e820.iter().take(count).enumerate() {
        let at = offsets::E820_MAP + i * 20;
        params[at..at + 8].copy_from_slice(&entry.addr.to_le_bytes());
        params[at + 8..at + 16].copy_from_slice(&entry.size.to_le_bytes());
        params[at + 16..at + 20].copy_from_slice(&(entry.kind as u32).to_le_bytes());
    }
    params[offsets::E820_ENTRIES] = count as u8;

    memory.write(layout::ZERO_PAGE_START, &params)?;
    setup_cmdline(memory, &config.cmdline)?;

    eprintln!(
        "[Boot] zero page at {:#x}, {} E820 entries, cmdline at {:#x}",
        layout::ZERO_PAGE_START,
        count,
        layout::CMDLINE_START
    );
    Ok(())
}

/// The synthesized three-entry map: low RAM, the legacy BIOS hole, and
/// everything above 1MiB. Kernels want at least two entries or they fall
/// back to legacy probing.
fn default_e820(mem_size: u64) -> Vec<E820Entry> {
    vec![
        E820Entry {
            addr: 0,
            size: 0x9_f000,
            kind: E820Type::Ram,
        },
        E820Entry {
            addr: 0xf_0000,
            size: 0x1_0000,
            kind: E820Type::Reserved,
        },
        E820Entry {
            addr: layout::HIMEM_START,
            size: mem_size - layout::HIMEM_START,
            kind: E820Type::Ram,
        },
    ]
}

fn setup_cmdline(memory: &GuestMemory, cmdline: &str) -> Result<(), BootError> {
    if cmdline.len() >= layout::CMDLINE_MAX_SIZE {
        return Err(BootError::CmdlineTooLong {
            len: cmdline.len(),
            max: layout::CMDLINE_MAX_SIZE - 1,
        });
    }
    memory.write(layout::CMDLINE_START, cmdline.as_bytes())?;
    memory.write_u8(layout::CMDLINE_START + cmdline.len() as u64, 0)
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::boot::bzimage::tests::minimal_bzimage;
    use crate::boot::KernelImage;

    fn boot(memory: &GuestMemory, config: &BootConfig) {
        let image = minimal_bzimage();
        crate::boot::setup_boot(memory, KernelImage::detect(&image).unwrap(), config).unwrap();
    }

    #[test]
    fn test_e820_synthesized() {
        let memory = GuestMemory::new(64 << 20).unwrap();
        boot(&memory, &BootConfig::default());

        let zp = layout::ZERO_PAGE_START;
        let entries = {
            let mut b = [0u8; 1];
            memory.read(zp + offsets::E820_ENTRIES as u64, &mut b).unwrap();
            b[0]
        };
        assert_eq!(entries, 3);

        // Entry 2: usable RAM from 1MiB to the end.
        let at = zp + offsets::E820_MAP as u64 + 2 * 20;
        assert_eq!(memory.read_u64(at).unwrap(), 0x10_0000);
        assert_eq!(memory.read_u64(at + 8).unwrap(), (64 << 20) - 0x10_0000);
        assert_eq!(memory.read_u32(at + 16).unwrap(), 1);
    }

    #[test]
    fn test_caller_supplied_e820() {
        let memory = GuestMemory::new(64 << 20).unwrap();
        let config = BootConfig {
            e820: Some(vec![
                E820Entry {
                    addr: 0,
                    size: 0x1000,
                    kind: E820Type::Ram,
                },
                E820Entry {
                    addr: 0x1000,
                    size: 0x1000,
                    kind: E820Type::Reserved,
                },
            ]),
            ..Default::default()
        };
        boot(&memory, &config);
        let zp = layout::ZERO_PAGE_START;
        let mut b = [0u8; 1];
        memory.read(zp + offsets::E820_ENTRIES as u64, &mut b).unwrap();
        assert_eq!(b[0], 2);
    }

    #[test]
    fn test_cmdline_written_with_terminator() {
        let memory = GuestMemory::new(64 << 20).unwrap();
        let config = BootConfig {
            cmdline: "console=ttyS0 reboot=t".to_string(),
            ..Default::default()
        };
        boot(&memory, &config);

        let mut buf = vec![0u8; 23];
        memory.read(layout::CMDLINE_START, &mut buf).unwrap();
        assert_eq!(&buf[..22], b"console=ttyS0 reboot=t");
        assert_eq!(buf[22], 0);

        // And the pointer field references it.
        let ptr = memory
            .read_u32(layout::ZERO_PAGE_START + offsets::CMD_LINE_PTR as u64)
            .unwrap();
        assert_eq!(ptr as u64, layout::CMDLINE_START);
    }

    #[test]
    fn test_cmdline_length_limit() {
        let memory = GuestMemory::new(64 << 20).unwrap();
        let config = BootConfig {
            cmdline: "x".repeat(layout::CMDLINE_MAX_SIZE),
            ..Default::default()
        };
        let image = minimal_bzimage();
        let err =
            crate::boot::setup_boot(&memory, KernelImage::detect(&image).unwrap(), &config);
        assert!(matches!(err, Err(BootError::CmdlineTooLong { .. })));
    }

    #[test]
    fn test_initramfs_descriptor() {
        let memory = GuestMemory::new(256 << 20).unwrap();
        let config = BootConfig {
            initramfs: Some(vec![0xabu8; 8192]),
            ..Default::default()
        };
        boot(&memory, &config);

        let zp = layout::ZERO_PAGE_START;
        let addr = memory.read_u32(zp + offsets::RAMDISK_IMAGE as u64).unwrap() as u64;
        let size = memory.read_u32(zp + offsets::RAMDISK_SIZE as u64).unwrap();
        assert_eq!(size, 8192);
        assert_eq!(addr & 0xfff, 0);

        let mut probe = [0u8; 4];
        memory.read(addr, &mut probe).unwrap();
        assert_eq!(probe, [0xab; 4]);
    }

    #[test]
    fn test_initramfs_too_large() {
        let memory = GuestMemory::new(96 << 20).unwrap();
        let image = vec![0u8; 95 << 20];
        assert!(matches!(
            place_initramfs(&memory, &image),
            Err(BootError::InitramfsTooLarge { .. })
        ));
    }
}
