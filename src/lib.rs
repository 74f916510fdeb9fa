//! Krypton — a programmable microVM runtime.
//!
//! Compiles a tiny fragment IR down to native x86-64 or AArch64 machine
//! code, boots a hardware-virtualized guest (KVM on Linux, HVF on Apple
//! silicon, WHP on Windows), and executes the compiled payloads inside
//! the guest over a vsock control channel — many short computations per
//! boot, each with a precise syscall surface.
//!
//! ```text
//! ir::Program ──asm──► Assembled ──loader──► vsock ──guest init──► run
//!                         │                                         │
//!                         └──── elf::standalone_elf (host exec) ◄───┘
//!                                          exit code + stdout/stderr
//! ```
//!
//! # Layer map
//!
//! - [`ir`] — the fragment language and program model
//! - [`asm`] — per-target encoders, lowering, linking, ELF wrapping
//! - [`hv`] — the hypervisor abstraction and platform backends
//! - [`boot`] — the x86-64 Linux boot protocol helper
//! - [`devices`] — serial console, virtio-mmio, vsock
//! - [`guest`] — the IR-generated init payload
//! - [`loader`] — the host side of the payload channel
//!
//! # Embedding
//!
//! ```ignore
//! let mut p = ir::Program::new("main");
//! p.method("main", vec![
//!     ir::syscall(ir::Sys::Write, vec![ir::int(1), ir::str_lit("hi"), ir::int(2)]),
//!     ir::ret(ir::int(7)),
//! ]);
//! let compiled = asm::build_standalone_program_for_arch(ir::Arch::host(), &p)?;
//!
//! let mut session = loader::session::VmSession::boot(&kernel_bytes, &Default::default())?;
//! let result = session.run_program(&compiled, &loader::RunOptions::captured())?;
//! assert_eq!(result.exit_code, 7);
//! ```

pub mod asm;
pub mod hv;
pub mod ir;
pub mod loader;

#[cfg(target_os = "linux")]
pub mod boot;

pub mod devices;
pub mod guest;
