//! Program loader: host side of the payload execution channel.
//!
//! The host frames compiled payloads over the vsock connection the guest
//! init opened at boot, and reads back exit codes and captured output.
//! [`protocol`] is the wire codec (binding format, shared with the guest
//! init's hand-rolled parser); [`cpio`] packs the init payload into the
//! initramfs the kernel unpacks; [`session`] owns a booted VM and drives
//! request/response cycles against it.

pub mod cpio;
pub mod protocol;

#[cfg(target_os = "linux")]
pub mod session;

pub use protocol::{ProtocolError, RunOptions, RunResult};
