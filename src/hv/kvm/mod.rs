//! KVM (Kernel-based Virtual Machine) backend.
//!
//! Safe wrapper over Linux KVM through the rust-vmm `kvm-ioctls` and
//! `kvm-bindings` crates. KVM exposes three ioctl surfaces and this module
//! follows that split:
//!
//! - `/dev/kvm` — capability checks, VM creation (here)
//! - VM fd — memory slots, irqchip, devices, vCPU creation ([`vm`])
//! - vCPU fd — register state, long-mode setup, the run loop ([`vcpu`])
//!
//! ```text
//! User Space (VMM)                    Kernel Space (KVM)
//! ┌──────────────┐                   ┌──────────────────┐
//! │   krypton    │    ioctl()        │  ┌────────────┐  │
//! │  KvmVm ──────┼──────────────────►│  │ VM State   │  │
//! │              │                   │  └────────────┘  │
//! │  KvmVcpu ────┼──────────────────►│  ┌────────────┐  │
//! │              │                   │  │ vCPU State │  │
//! └──────────────┘                   └──┴────────────┴──┘
//! ```
//!
//! On x86-64 hosts the VM gets the trio of legacy components early boot
//! expects (TSS address, in-kernel PIC+IOAPIC, PIT) when an irqchip is
//! requested;
//! on AArch64 hosts vCPUs are initialized through `KVM_ARM_VCPU_INIT` with
//! in-kernel PSCI, which turns guest `SYSTEM_OFF`/`SYSTEM_RESET` calls
//! into system-event exits.

mod vcpu;
mod vm;

pub use vcpu::KvmVcpu;
pub use vm::KvmVm;

use super::{Hypervisor, HvError, Vm, VmConfig};
use crate::ir::Arch;
use kvm_ioctls::Kvm;
use thiserror::Error;

/// Errors from KVM ioctls, each tagged with the operation that failed.
#[derive(Error, Debug)]
pub enum KvmError {
    /// Failed to open /dev/kvm. Usually: module not loaded, no
    /// permissions, or no nested virtualization inside a VM.
    #[error("failed to open /dev/kvm: {0}")]
    OpenKvm(#[source] kvm_ioctls::Error),

    #[error("failed to create VM: {0}")]
    CreateVm(#[source] kvm_ioctls::Error),

    #[error("failed to create vCPU: {0}")]
    CreateVcpu(#[source] kvm_ioctls::Error),

    #[error("failed to set user memory region: {0}")]
    SetMemoryRegion(#[source] kvm_ioctls::Error),

    #[error("failed to set registers: {0}")]
    SetRegisters(#[source] kvm_ioctls::Error),

    #[error("failed to get registers: {0}")]
    GetRegisters(#[source] kvm_ioctls::Error),

    #[error("failed to run vCPU: {0}")]
    Run(#[source] kvm_ioctls::Error),

    #[error("failed to set TSS address: {0}")]
    SetTssAddress(#[source] kvm_ioctls::Error),

    #[error("failed to create IRQ chip: {0}")]
    CreateIrqChip(#[source] kvm_ioctls::Error),

    #[error("failed to create PIT2: {0}")]
    CreatePit2(#[source] kvm_ioctls::Error),

    #[error("failed to get supported CPUID: {0}")]
    GetSupportedCpuid(#[source] kvm_ioctls::Error),

    #[error("failed to set CPUID: {0}")]
    SetCpuid(#[source] kvm_ioctls::Error),

    #[error("failed to set MSRs: {0}")]
    SetMsrs(#[source] kvm_ioctls::Error),

    #[error("failed to init vCPU: {0}")]
    VcpuInit(#[source] kvm_ioctls::Error),

    #[error("failed to set IRQ line: {0}")]
    IrqLine(#[source] kvm_ioctls::Error),

    #[error("failed to allocate guest memory: {0}")]
    Memory(#[from] crate::boot::BootError),

    #[error("an in-kernel irqchip is not supported on this host architecture")]
    NoIrqchip,
}

impl From<KvmError> for HvError {
    fn from(e: KvmError) -> Self {
        HvError::Backend {
            backend: "kvm",
            op: "ioctl",
            detail: e.to_string(),
        }
    }
}

/// The opened KVM backend.
pub struct KvmHypervisor {
    kvm: Kvm,
}

/// Open /dev/kvm and verify it is usable.
pub fn open() -> Result<KvmHypervisor, KvmError> {
    let kvm = Kvm::new().map_err(KvmError::OpenKvm)?;
    Ok(KvmHypervisor { kvm })
}

impl KvmHypervisor {
    /// Create a VM with the concrete KVM type, for callers that need
    /// KVM-specific surface (guest memory handle, boot MSRs).
    pub fn create_kvm_vm(&self, config: VmConfig) -> Result<KvmVm, KvmError> {
        KvmVm::new(&self.kvm, config)
    }
}

impl Hypervisor for KvmHypervisor {
    fn name(&self) -> &'static str {
        "kvm"
    }

    fn architecture(&self) -> Arch {
        Arch::host()
    }

    fn create_vm(&self, config: VmConfig) -> Result<Box<dyn Vm>, HvError> {
        let vm = KvmVm::new(&self.kvm, config)?;
        Ok(Box::new(vm))
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    /// KVM-dependent tests skip on machines without /dev/kvm so the suite
    /// passes in plain CI containers.
    pub(crate) fn kvm_available() -> bool {
        std::path::Path::new("/dev/kvm").exists()
    }

    #[test]
    fn test_open_reports_or_succeeds() {
        match open() {
            Ok(hv) => {
                assert_eq!(hv.name(), "kvm");
            }
            Err(e) => {
                // Must be the open error, with a readable message.
                assert!(e.to_string().contains("/dev/kvm"));
            }
        }
    }

    #[test]
    fn test_create_vm_smoke() {
        if !kvm_available() {
            return;
        }
        let hv = match open() {
            Ok(hv) => hv,
            Err(_) => return,
        };
        let vm = hv.create_vm(VmConfig {
            num_cpus: 1,
            mem_base: 0,
            mem_size: 2 << 20,
            irqchip: false,
        });
        assert!(vm.is_ok(), "create_vm failed: {:?}", vm.err());
    }
}
