//! bzImage parsing and loading.
//!
//! A bzImage is `[boot sector | setup code | protected-mode kernel]`; the
//! setup header at offset 0x1f1 carries the boot-protocol fields. For
//! direct 64-bit boot only two things matter: the protected-mode kernel
//! goes to the 1MiB mark, and the 64-bit entry point is 0x200 past it.
//!
//! ```text
//! +------------------+ 0x0000
//! |   boot sector    | 512 bytes (legacy, unused here)
//! +------------------+ 0x0200
//! |   setup header   | magic "HdrS", version, setup_sects, loadflags
//! |   + setup code   | (setup_sects × 512 bytes)
//! +------------------+
//! | protected-mode   | loaded at 0x100000
//! |     kernel       |
//! +------------------+
//! ```

use super::{layout, BootError, GuestMemory};

/// "HdrS" boot-protocol magic at offset 0x202.
const BOOT_MAGIC: u32 = 0x5372_6448;

/// Minimum protocol version for direct 64-bit boot (2.06, Linux 2.6.20).
const MIN_BOOT_VERSION: u16 = 0x0206;

/// Setup header offset within the image.
const SETUP_HEADER_OFFSET: usize = 0x1f1;

/// A kernel staged into guest memory.
pub(super) struct LoadedKernel {
    pub load_gpa: u64,
    pub entry_gpa: u64,
    /// Raw setup header bytes to copy into the zero page (empty for ELF
    /// kernels, which have none).
    pub setup_header: Vec<u8>,
}

/// Whether `data` carries the bzImage boot magic.
pub(super) fn has_boot_magic(data: &[u8]) -> bool {
    data.len() > 0x206
        && u32::from_le_bytes([data[0x202], data[0x203], data[0x204], data[0x205]]) == BOOT_MAGIC
}

/// Parse a bzImage and copy its protected-mode kernel to the 1MiB mark.
pub(super) fn load(memory: &GuestMemory, data: &[u8]) -> Result<LoadedKernel, BootError> {
    if data.len() < 0x250 {
        return Err(BootError::InvalidKernel(
            "image too small to contain a setup header".into(),
        ));
    }

    if !has_boot_magic(data) {
        return Err(BootError::InvalidKernel("missing HdrS boot magic".into()));
    }

    let version = u16::from_le_bytes([data[0x206], data[0x207]]);
    if version < MIN_BOOT_VERSION {
        return Err(BootError::InvalidKernel(format!(
            "boot protocol {version:#x} too old (need {MIN_BOOT_VERSION:#x} for 64-bit boot)"
        )));
    }

    // setup_sects of 0 means 4 on ancient kernels.
    let setup_sects = match data[SETUP_HEADER_OFFSET] {
        0 => 4,
        n => n,
    };
    let setup_size = (setup_sects as usize + 1) * 512;
    if setup_size >= data.len() {
        return Err(BootError::InvalidKernel(
            "setup size exceeds image size".into(),
        ));
    }

    let kernel_code = &data[setup_size..];
    memory.write(layout::HIMEM_START, kernel_code)?;

    let header_end = (SETUP_HEADER_OFFSET + 0x80).min(data.len());
    let setup_header = data[SETUP_HEADER_OFFSET..header_end].to_vec();

    eprintln!(
        "[Boot] bzImage: protocol {:#x}, {} setup sectors, {} bytes of kernel at {:#x}",
        version,
        setup_sects,
        kernel_code.len(),
        layout::HIMEM_START
    );

    Ok(LoadedKernel {
        load_gpa: layout::HIMEM_START,
        // Real-mode entry at +0, the 64-bit entry at +0x200.
        entry_gpa: layout::HIMEM_START + 0x200,
        setup_header,
    })
}

#[cfg(test)]
pub(crate) mod tests {
    use super::*;

    /// A syntactically valid bzImage: one setup sector's worth of header
    /// plus a recognizable payload.
    pub(crate) fn minimal_bzimage() -> Vec<u8> {
        let mut image = vec![0u8; 0x800];
        image[SETUP_HEADER_OFFSET] = 1; // setup_sects
        image[0x202..0x206].copy_from_slice(&BOOT_MAGIC.to_le_bytes());
        image[0x206..0x208].copy_from_slice(&0x020f_u16.to_le_bytes());
        image[0x400..0x408].copy_from_slice(b"KERNEL64");
        image
    }

    #[test]
    fn test_load_minimal_image() {
        let memory = GuestMemory::new(4 << 20).unwrap();
        let image = minimal_bzimage();
        let loaded = load(&memory, &image).unwrap();
        assert_eq!(loaded.load_gpa, 0x10_0000);
        assert_eq!(loaded.entry_gpa, 0x10_0200);

        // Payload after (setup_sects + 1) * 512 = 0x400 lands at 1MiB.
        let mut buf = [0u8; 8];
        memory.read(0x10_0000, &mut buf).unwrap();
        assert_eq!(&buf, b"KERNEL64");
    }

    #[test]
    fn test_bad_magic_rejected() {
        let memory = GuestMemory::new(4 << 20).unwrap();
        let mut image = minimal_bzimage();
        image[0x202] = 0;
        assert!(matches!(
            load(&memory, &image),
            Err(BootError::InvalidKernel(_))
        ));
    }

    #[test]
    fn test_old_protocol_rejected() {
        let memory = GuestMemory::new(4 << 20).unwrap();
        let mut image = minimal_bzimage();
        image[0x206..0x208].copy_from_slice(&0x0205u16.to_le_bytes());
        assert!(matches!(
            load(&memory, &image),
            Err(BootError::InvalidKernel(_))
        ));
    }

    #[test]
    fn test_setup_header_extracted() {
        let memory = GuestMemory::new(4 << 20).unwrap();
        let image = minimal_bzimage();
        let loaded = load(&memory, &image).unwrap();
        // Header starts at the setup_sects byte.
        assert_eq!(loaded.setup_header[0], 1);
        assert_eq!(loaded.setup_header.len(), 0x80);
    }
}
