//! Guest init payload.
//!
//! The first (and only) program the guest kernel runs, generated from IR
//! at VM construction time and shipped as the initramfs `/init`. Its job:
//! bring up a console, map the payload arena, connect vsock back to the
//! host, and then loop forever executing the payloads the host streams
//! over — applying relocations, wiring up capture pipes, and reporting
//! exit codes and output back on the same connection.
//!
//! Boot pipeline (spec'd order, each step before the next):
//!
//! 1. `/dev` + devtmpfs, `/proc`, `/dev/shm`, std fd symlinks
//! 2. console open, `setsid`, controlling TTY, fds 0/1/2
//! 3. `/dev/mem` + optional timeslice trace page
//! 4. 4 MiB executable anonymous arena + capture scratch mapping
//! 5. `AF_VSOCK` connect to CID 2
//! 6. command loop
//!
//! Everything is written against the arch-portable syscall subset
//! (`openat`/`mkdirat`/`pipe2`/`clone`/`dup3`), so one builder serves
//! both targets; only the reboot command and the i-cache flush differ.
//!
//! # Why capture forks children
//!
//! Linux pipe buffers are ~64 KiB. A payload writing more than that would
//! deadlock a drainer that only reads after the payload returns, so a
//! dedicated reader child drains stdout/stderr concurrently and hands the
//! accumulated bytes back over a return pipe once both streams hit EOF.
//! The same bound applies to stdin, hence the writer child.

mod init;

pub use init::build_init;

use crate::ir::Arch;

/// Configuration for the generated init payload.
#[derive(Debug, Clone)]
pub struct InitConfig {
    /// Target architecture; must match the VM the payload boots in.
    pub arch: Arch,
    /// Vsock port the init connects to on CID 2.
    pub vsock_port: u32,
    /// Guest-physical address of the timeslice trace page to map from
    /// `/dev/mem`, or `None` to skip the mapping.
    pub timeslice_mmio: Option<u64>,
}

impl InitConfig {
    pub fn new(arch: Arch) -> Self {
        InitConfig {
            arch,
            vsock_port: crate::loader::protocol::VSOCK_PORT,
            timeslice_mmio: Some(crate::devices::TIMESLICE_MMIO_PHYS_ADDR),
        }
    }
}

/// Size of the executable payload arena.
pub const ARENA_SIZE: i64 = crate::loader::protocol::ARENA_SIZE as i64;

/// Per-stream capture cap; output beyond this is silently dropped.
pub const CAPTURE_LIMIT: i64 = crate::loader::protocol::CAPTURE_LIMIT as i64;

#[cfg(test)]
mod tests {
    use super::*;
    use crate::asm::build_standalone_program_for_arch;

    #[test]
    fn test_builds_for_both_architectures() {
        for arch in [Arch::X86_64, Arch::Aarch64] {
            let program = build_init(&InitConfig::new(arch));
            let assembled = build_standalone_program_for_arch(arch, &program)
                .unwrap_or_else(|e| panic!("init build failed for {arch}: {e}"));
            assert!(!assembled.code.is_empty());
            // The init embeds its device paths as constants.
            let needle = b"/dev/console";
            assert!(assembled
                .code
                .windows(needle.len())
                .any(|w| w == needle.as_slice()));
        }
    }

    #[test]
    fn test_deterministic() {
        let cfg = InitConfig::new(Arch::X86_64);
        let a = build_standalone_program_for_arch(Arch::X86_64, &build_init(&cfg)).unwrap();
        let b = build_standalone_program_for_arch(Arch::X86_64, &build_init(&cfg)).unwrap();
        assert_eq!(a, b);
    }

    #[test]
    fn test_timeslice_mapping_is_optional() {
        let with = InitConfig::new(Arch::X86_64);
        let without = InitConfig {
            timeslice_mmio: None,
            ..with.clone()
        };
        let a = build_standalone_program_for_arch(Arch::X86_64, &build_init(&with)).unwrap();
        let b = build_standalone_program_for_arch(Arch::X86_64, &build_init(&without)).unwrap();
        assert_ne!(a.code, b.code);
    }

    #[test]
    fn test_port_is_configurable() {
        let mut cfg = InitConfig::new(Arch::X86_64);
        cfg.vsock_port = 4321;
        let program = build_init(&cfg);
        // The port ends up as an immediate somewhere in the program;
        // build must still succeed.
        build_standalone_program_for_arch(Arch::X86_64, &program).unwrap();
    }
}
