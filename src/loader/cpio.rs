//! Minimal cpio (newc) archive writer.
//!
//! The kernel unpacks its initramfs from a newc-format cpio archive; the
//! only member this system ever ships is `init` — the guest init payload
//! wrapped as a static ELF. Each record is a 110-byte ASCII-hex header,
//! the NUL-terminated name padded to 4 bytes, then the data padded to 4
//! bytes; the archive ends with the `TRAILER!!!` record.

/// One archive member.
pub struct CpioEntry<'a> {
    pub name: &'a str,
    pub mode: u32,
    pub data: &'a [u8],
}

/// Regular file, rwxr-xr-x.
pub const MODE_EXEC: u32 = 0o100_755;

/// Build a newc archive from entries plus the trailer.
pub fn build(entries: &[CpioEntry<'_>]) -> Vec<u8> {
    let mut out = Vec::new();
    for (i, entry) in entries.iter().enumerate() {
        write_record(
            &mut out,
            i as u32 + 1,
            entry.name,
            entry.mode,
            entry.data,
        );
    }
    write_record(&mut out, 0, "TRAILER!!!", 0, &[]);
    out
}

fn write_record(out: &mut Vec<u8>, ino: u32, name: &str, mode: u32, data: &[u8]) {
    let name_z = name.len() + 1; // includes NUL
    out.extend_from_slice(b"070701");
    for field in [
        ino,              // c_ino
        mode,             // c_mode
        0,                // c_uid
        0,                // c_gid
        1,                // c_nlink
        0,                // c_mtime
        data.len() as u32, // c_filesize
        0,                // c_devmajor
        0,                // c_devminor
        0,                // c_rdevmajor
        0,                // c_rdevminor
        name_z as u32,    // c_namesize
        0,                // c_check
    ] {
        out.extend_from_slice(format!("{field:08X}").as_bytes());
    }
    out.extend_from_slice(name.as_bytes());
    out.push(0);
    pad4(out);
    out.extend_from_slice(data);
    pad4(out);
}

fn pad4(out: &mut Vec<u8>) {
    while out.len() % 4 != 0 {
        out.push(0);
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_archive_structure() {
        let archive = build(&[CpioEntry {
            name: "init",
            mode: MODE_EXEC,
            data: b"\x7fELF....",
        }]);

        assert_eq!(&archive[..6], b"070701");
        // Name follows the 110-byte header.
        assert_eq!(&archive[110..114], b"init");
        assert_eq!(archive[114], 0);
        // Archive is 4-byte aligned and carries the trailer.
        assert_eq!(archive.len() % 4, 0);
        assert!(archive
            .windows(10)
            .any(|w| w == b"TRAILER!!!".as_slice()));
    }

    #[test]
    fn test_filesize_field() {
        let archive = build(&[CpioEntry {
            name: "init",
            mode: MODE_EXEC,
            data: &[0u8; 1000],
        }]);
        // c_filesize is the 7th 8-hex field after the magic.
        let at = 6 + 6 * 8;
        assert_eq!(&archive[at..at + 8], b"000003E8");
    }

    #[test]
    fn test_data_alignment() {
        // 5-byte name "hello" + NUL: header(110) + 6 = 116, already
        // aligned; 3 data bytes pad to the next multiple of 4.
        let archive = build(&[CpioEntry {
            name: "hello",
            mode: MODE_EXEC,
            data: b"abc",
        }]);
        assert_eq!(&archive[116..119], b"abc");
        assert_eq!(archive[119], 0);
        assert_eq!(&archive[120..126], b"070701"); // trailer record
    }
}
