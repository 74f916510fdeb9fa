//! Symbolic syscall numbers.
//!
//! The x86-64 and AArch64 Linux syscall tables differ substantially: AArch64
//! is a "generic" table that dropped the legacy non-`at` calls (no `open`,
//! `mkdir`, `pipe`, or `fork` — only `openat`, `mkdirat`, `pipe2`, `clone`).
//! IR programs therefore name syscalls symbolically and the lowering pass
//! resolves the number for its target; the symbols below are the portable
//! subset the guest init payload is written against.
//!
//! Numbers are from the kernel's `unistd` tables (x86-64:
//! `arch/x86/entry/syscalls/syscall_64.tbl`, AArch64:
//! `include/uapi/asm-generic/unistd.h`).

use super::Arch;

/// Symbolic syscall names resolvable on both supported architectures.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash)]
#[allow(missing_docs)]
pub enum Sys {
    Read,
    Write,
    Openat,
    Close,
    Ioctl,
    Fcntl,
    Mkdirat,
    Mknodat,
    Symlinkat,
    Dup3,
    Pipe2,
    Getpid,
    Socket,
    Connect,
    Clone,
    Execve,
    Wait4,
    Exit,
    ExitGroup,
    Setsid,
    ClockSettime,
    Mmap,
    Munmap,
    Mount,
    Reboot,
    Nanosleep,
}

impl Sys {
    /// The syscall number on the given architecture.
    pub fn number(self, arch: Arch) -> u32 {
        use Sys::*;
        match arch {
            Arch::X86_64 => match self {
                Read => 0,
                Write => 1,
                Close => 3,
                Mmap => 9,
                Munmap => 11,
                Ioctl => 16,
                Nanosleep => 35,
                Getpid => 39,
                Socket => 41,
                Connect => 42,
                Clone => 56,
                Execve => 59,
                Exit => 60,
                Wait4 => 61,
                Fcntl => 72,
                Setsid => 112,
                Mount => 165,
                Reboot => 169,
                ClockSettime => 227,
                ExitGroup => 231,
                Openat => 257,
                Mkdirat => 258,
                Mknodat => 259,
                Symlinkat => 266,
                Dup3 => 292,
                Pipe2 => 293,
            },
            Arch::Aarch64 => match self {
                Dup3 => 24,
                Fcntl => 25,
                Ioctl => 29,
                Mknodat => 33,
                Mkdirat => 34,
                Symlinkat => 36,
                Mount => 40,
                Openat => 56,
                Close => 57,
                Pipe2 => 59,
                Read => 63,
                Write => 64,
                Exit => 93,
                ExitGroup => 94,
                Nanosleep => 101,
                ClockSettime => 112,
                Reboot => 142,
                Setsid => 157,
                Getpid => 172,
                Socket => 198,
                Connect => 203,
                Munmap => 215,
                Clone => 220,
                Execve => 221,
                Mmap => 222,
                Wait4 => 260,
            },
        }
    }
}

/// `reboot(2)` magic numbers and commands.
///
/// The init payload's terminal error path issues a reboot syscall; the
/// command differs per architecture (RESTART cycles an x86 guest cleanly,
/// while AArch64 guests power off).
pub mod reboot {
    /// LINUX_REBOOT_MAGIC1.
    pub const MAGIC1: u64 = 0xfee1_dead;
    /// LINUX_REBOOT_MAGIC2.
    pub const MAGIC2: u64 = 0x2812_1969;
    /// LINUX_REBOOT_CMD_RESTART.
    pub const CMD_RESTART: u64 = 0x0123_4567;
    /// LINUX_REBOOT_CMD_POWER_OFF.
    pub const CMD_POWER_OFF: u64 = 0x4321_fedc;

    /// The command the init payload uses for its terminal error path on the
    /// given architecture.
    pub fn terminal_cmd(arch: crate::ir::Arch) -> u64 {
        match arch {
            crate::ir::Arch::X86_64 => CMD_RESTART,
            crate::ir::Arch::Aarch64 => CMD_POWER_OFF,
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_tables_differ() {
        // The classic trap: write is 1 on x86-64 but 64 on aarch64.
        assert_eq!(Sys::Write.number(Arch::X86_64), 1);
        assert_eq!(Sys::Write.number(Arch::Aarch64), 64);
        assert_eq!(Sys::Openat.number(Arch::X86_64), 257);
        assert_eq!(Sys::Openat.number(Arch::Aarch64), 56);
    }

    #[test]
    fn test_reboot_commands() {
        assert_eq!(reboot::terminal_cmd(Arch::X86_64), reboot::CMD_RESTART);
        assert_eq!(reboot::terminal_cmd(Arch::Aarch64), reboot::CMD_POWER_OFF);
    }
}
