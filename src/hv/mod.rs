//! Hypervisor abstraction.
//!
//! One uniform surface over the platform virtualization backends: KVM on
//! Linux, the Hypervisor framework (HVF) on Apple silicon, and the Windows
//! Hypervisor Platform (WHP). A backend hands out [`Vm`]s; a VM owns guest
//! RAM, devices, and vCPUs, and runs until the guest halts, asks for a
//! reboot, a device yields, or the caller cancels.
//!
//! The guest architecture always equals the host architecture — payloads
//! are compiled per-target by [`crate::asm`], and cross-ISA execution is a
//! guest-userspace concern.
//!
//! # Exit classification
//!
//! Halting, reboot requests, device yields, and cancellation are ordinary
//! [`RunOutcome`]s, not errors; [`HvError`] is reserved for failures
//! (backend syscalls, memory faults, unhandled exits). Callers dispatch on
//! the outcome the way VMM run loops dispatch on exit reasons.

#[cfg(target_os = "linux")]
pub mod kvm;

#[cfg(all(target_os = "macos", target_arch = "aarch64"))]
pub mod hvf;

#[cfg(target_os = "windows")]
pub mod whp;

use crate::ir::{Arch, Reg};
use std::collections::BTreeMap;
use std::sync::atomic::{AtomicBool, Ordering};
use std::sync::{Arc, Mutex};
use std::time::Duration;
use thiserror::Error;

/// Errors from the hypervisor layer.
#[derive(Debug, Error)]
pub enum HvError {
    /// No backend could be opened; the message names what was probed.
    #[error("no usable hypervisor backend: {0}")]
    NotAvailable(String),

    /// A backend-level operation failed.
    #[error("{backend}: {op} failed: {detail}")]
    Backend {
        backend: &'static str,
        op: &'static str,
        detail: String,
    },

    /// Guest-physical access outside the RAM window.
    #[error("guest memory access out of range: offset {offset:#x} len {len:#x}")]
    MemoryRange { offset: u64, len: usize },

    /// The guest touched an address no device claims.
    #[error("unhandled {kind} at {addr:#x}")]
    UnhandledIo { kind: &'static str, addr: u64 },

    /// A vCPU exit the backend cannot classify.
    #[error("unhandled vcpu exit: {0}")]
    UnhandledExit(String),

    /// Snapshot produced by a different backend.
    #[error("snapshot was captured by backend {got}, not {expected}")]
    SnapshotBackendMismatch { expected: String, got: String },

    /// Register or vCPU addressing errors.
    #[error("no vcpu with id {0}")]
    NoSuchVcpu(u32),

    /// The register is not part of this architecture's set.
    #[error("register {0} is not available on this backend")]
    BadRegister(&'static str),
}

/// How a VM run ended. All of these leave the VM in a resumable state
/// except `RebootRequested`, whose handling is the caller's policy.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum RunOutcome {
    /// The guest executed HLT (x86-64) or PSCI SYSTEM_OFF (AArch64).
    Halted,
    /// The guest requested a reset (triple fault path or PSCI
    /// SYSTEM_RESET).
    RebootRequested,
    /// A device write handler asked to return control to the caller
    /// without stopping the guest.
    Yielded,
    /// The cancel token fired while the guest was running.
    Canceled,
}

/// Outcome of a device write: continue running or yield control.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Default)]
pub enum WriteOutcome {
    #[default]
    Continue,
    /// Cooperatively exit `Vm::run` with [`RunOutcome::Yielded`].
    Yield,
}

/// Handler for an x86 port-I/O range.
pub trait PortIoHandler: Send {
    /// Guest IN: fill `data` for the port at `offset` within the range.
    fn read(&mut self, offset: u16, data: &mut [u8]);
    /// Guest OUT.
    fn write(&mut self, offset: u16, data: &[u8]) -> WriteOutcome;
    /// Opaque device state for snapshots. Stateless devices return empty.
    fn snapshot(&self) -> Vec<u8> {
        Vec::new()
    }
    /// Restore state captured by `snapshot`.
    fn restore(&mut self, _state: &[u8]) {}
}

/// Handler for a guest-physical MMIO range.
pub trait MmioHandler: Send {
    /// Guest read: fill `data` for `offset` within the region.
    fn read(&mut self, offset: u64, data: &mut [u8]);
    /// Guest write.
    fn write(&mut self, offset: u64, data: &[u8]) -> WriteOutcome;
    /// Opaque device state for snapshots.
    fn snapshot(&self) -> Vec<u8> {
        Vec::new()
    }
    /// Restore state captured by `snapshot`.
    fn restore(&mut self, _state: &[u8]) {}
}

/// A device registered with a VM: a tagged capability rather than a
/// class hierarchy. Interrupt-sourcing devices additionally hold an
/// [`IrqLine`] obtained from the VM.
pub enum Device {
    /// x86 port-I/O range `[base, base+size)`.
    PortIo {
        base: u16,
        size: u16,
        handler: Box<dyn PortIoHandler>,
    },
    /// Guest-physical MMIO range `[base, base+size)`.
    Mmio {
        base: u64,
        size: u64,
        handler: Box<dyn MmioHandler>,
    },
}

/// Backend-side interrupt injection.
pub trait IrqSink: Send + Sync {
    fn set_irq(&self, gsi: u32, high: bool);
}

/// A GSI line handle a device keeps for interrupt injection. This is the
/// only reference a device holds back toward its VM.
#[derive(Clone)]
pub struct IrqLine {
    sink: Arc<dyn IrqSink>,
    gsi: u32,
}

impl IrqLine {
    pub fn new(sink: Arc<dyn IrqSink>, gsi: u32) -> Self {
        IrqLine { sink, gsi }
    }

    /// Pulse the line: assert then deassert, the edge-triggered pattern
    /// virtio-mmio interrupts use.
    pub fn pulse(&self) {
        self.sink.set_irq(self.gsi, true);
        self.sink.set_irq(self.gsi, false);
    }

    pub fn gsi(&self) -> u32 {
        self.gsi
    }
}

/// Cooperative cancellation for [`Vm::run`].
///
/// `cancel` sets the flag and runs registered kick hooks, which backends
/// use to interrupt a blocking vCPU-enter call; the vCPU loop observes
/// the flag and returns [`RunOutcome::Canceled`]. The VM stays resumable.
#[derive(Clone, Default)]
pub struct CancelToken {
    inner: Arc<CancelInner>,
}

#[derive(Default)]
struct CancelInner {
    canceled: AtomicBool,
    kicks: Mutex<Vec<Box<dyn Fn() + Send + Sync>>>,
}

impl CancelToken {
    pub fn new() -> Self {
        Self::default()
    }

    pub fn is_canceled(&self) -> bool {
        self.inner.canceled.load(Ordering::SeqCst)
    }

    /// Set the flag and kick any blocked vCPU.
    pub fn cancel(&self) {
        self.inner.canceled.store(true, Ordering::SeqCst);
        if let Ok(kicks) = self.inner.kicks.lock() {
            for kick in kicks.iter() {
                kick();
            }
        }
    }

    /// Cancel from a watchdog thread after `timeout`.
    pub fn cancel_after(&self, timeout: Duration) {
        let token = self.clone();
        std::thread::spawn(move || {
            std::thread::sleep(timeout);
            token.cancel();
        });
    }

    /// Register a hook run on cancellation (backend-internal).
    pub fn add_kick(&self, kick: Box<dyn Fn() + Send + Sync>) {
        if let Ok(mut kicks) = self.inner.kicks.lock() {
            kicks.push(kick);
        }
    }
}

/// Per-vCPU state in a snapshot: the architecture-neutral register map
/// plus an opaque backend blob for state the map does not model.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct VcpuSnapshot {
    pub regs: BTreeMap<Reg, u64>,
    pub backend_state: Vec<u8>,
}

/// A captured VM: vCPU state, the full RAM image, and per-device blobs.
/// Round-trippable only through the backend that produced it.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct Snapshot {
    pub backend: String,
    pub vcpus: Vec<VcpuSnapshot>,
    pub memory: Vec<u8>,
    pub devices: BTreeMap<u32, Vec<u8>>,
}

/// vCPU operations exposed through [`Vm::with_vcpu`].
pub trait VcpuOps {
    /// Fill `map` values for every key present in it.
    fn get_registers(&mut self, map: &mut BTreeMap<Reg, u64>) -> Result<(), HvError>;

    /// Write every entry of `map` into the vCPU.
    fn set_registers(&mut self, map: &BTreeMap<Reg, u64>) -> Result<(), HvError>;

    /// Build identity-mapped page tables at `paging_base` covering `gib`
    /// GiB and enter 64-bit long mode with the given code/data selectors.
    /// x86-64 backends only.
    fn set_long_mode_with_selectors(
        &mut self,
        paging_base: u64,
        gib: u64,
        code_sel: u16,
        data_sel: u16,
    ) -> Result<(), HvError>;
}

/// VM configuration.
#[derive(Debug, Clone)]
pub struct VmConfig {
    pub num_cpus: u32,
    /// Guest-physical base of the RAM window (0 for Linux boot).
    pub mem_base: u64,
    pub mem_size: u64,
    /// Create the backend's in-kernel interrupt controller (and PIT on
    /// x86). Required for booting Linux; bare programs can skip it.
    pub irqchip: bool,
}

impl Default for VmConfig {
    fn default() -> Self {
        VmConfig {
            num_cpus: 1,
            mem_base: 0,
            mem_size: 512 << 20,
            irqchip: false,
        }
    }
}

/// A virtual machine. Created once, runs many payloads, closed by drop.
pub trait Vm: Send {
    /// Register a device. Allowed before or between runs.
    fn add_device(&mut self, device: Device);

    /// An interrupt line handle for a device that raises GSIs.
    fn irq_line(&self, gsi: u32) -> Result<IrqLine, HvError>;

    /// Run vCPU 0 until an outcome or failure. Re-entrant across calls:
    /// a halted or canceled VM may be run again.
    fn run(&mut self, cancel: &CancelToken) -> Result<RunOutcome, HvError>;

    /// Copy into guest RAM at `offset` from the RAM base.
    fn write_at(&self, data: &[u8], offset: u64) -> Result<(), HvError>;

    /// Copy out of guest RAM at `offset` from the RAM base.
    fn read_at(&self, data: &mut [u8], offset: u64) -> Result<(), HvError>;

    /// Synchronize with a vCPU and call `f` on it (register access after
    /// halt, boot-time setup).
    fn with_vcpu(
        &mut self,
        id: u32,
        f: &mut dyn FnMut(&mut dyn VcpuOps) -> Result<(), HvError>,
    ) -> Result<(), HvError>;

    /// Capture the full VM state.
    fn capture_snapshot(&mut self) -> Result<Snapshot, HvError>;

    /// Restore state captured by the same backend.
    fn restore_snapshot(&mut self, snapshot: &Snapshot) -> Result<(), HvError>;
}

/// A hypervisor backend.
pub trait Hypervisor {
    /// Backend name for diagnostics ("kvm", "hvf", "whp").
    fn name(&self) -> &'static str;

    /// Host (and therefore guest) architecture.
    fn architecture(&self) -> Arch;

    /// Create a VM with guest RAM mapped and vCPUs created but not
    /// configured.
    fn create_vm(&self, config: VmConfig) -> Result<Box<dyn Vm>, HvError>;
}

/// Probe the platform backends and open the first viable one.
///
/// The error names everything that was probed so "virtualization not
/// available" failures are actionable.
pub fn probe() -> Result<Box<dyn Hypervisor>, HvError> {
    #[cfg(target_os = "linux")]
    {
        return match kvm::open() {
            Ok(hv) => Ok(Box::new(hv)),
            Err(e) => Err(HvError::NotAvailable(format!("probed kvm: {e}"))),
        };
    }
    #[cfg(all(target_os = "macos", target_arch = "aarch64"))]
    {
        return match hvf::open() {
            Ok(hv) => Ok(Box::new(hv)),
            Err(e) => Err(HvError::NotAvailable(format!("probed hvf: {e}"))),
        };
    }
    #[cfg(target_os = "windows")]
    {
        return match whp::open() {
            Ok(hv) => Ok(Box::new(hv)),
            Err(e) => Err(HvError::NotAvailable(format!("probed whp: {e}"))),
        };
    }
    #[allow(unreachable_code)]
    Err(HvError::NotAvailable(
        "no backend for this platform (supported: kvm on Linux, hvf on macOS/arm64, whp on Windows)"
            .to_string(),
    ))
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_cancel_token_flag_and_kick() {
        let token = CancelToken::new();
        assert!(!token.is_canceled());

        let fired = Arc::new(AtomicBool::new(false));
        let observed = fired.clone();
        token.add_kick(Box::new(move || {
            observed.store(true, Ordering::SeqCst);
        }));

        token.cancel();
        assert!(token.is_canceled());
        assert!(fired.load(Ordering::SeqCst));
    }

    #[test]
    fn test_cancel_after_fires() {
        let token = CancelToken::new();
        token.cancel_after(Duration::from_millis(10));
        let deadline = std::time::Instant::now() + Duration::from_secs(2);
        while !token.is_canceled() {
            assert!(std::time::Instant::now() < deadline, "cancel never fired");
            std::thread::sleep(Duration::from_millis(1));
        }
    }

    struct NullSink;
    impl IrqSink for NullSink {
        fn set_irq(&self, _gsi: u32, _high: bool) {}
    }

    #[test]
    fn test_irq_line_carries_gsi() {
        let line = IrqLine::new(Arc::new(NullSink), 5);
        assert_eq!(line.gsi(), 5);
        line.pulse();
    }

    #[test]
    fn test_default_config() {
        let cfg = VmConfig::default();
        assert_eq!(cfg.num_cpus, 1);
        assert_eq!(cfg.mem_size, 512 << 20);
        assert!(!cfg.irqchip);
    }
}
