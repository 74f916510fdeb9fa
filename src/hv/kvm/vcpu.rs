//! KVM vCPU: register access, long-mode setup, and the run step.
//!
//! # Cancellation
//!
//! `KVM_RUN` blocks until the guest exits, so cancellation has to
//! interrupt the ioctl. The pattern (borrowed from the rust-vmm VMMs):
//! the run loop parks a pointer to the active vCPU in thread-local
//! storage, the cancel path signals the vCPU thread with SIGUSR1, and the
//! signal handler sets KVM's `immediate_exit` flag through the parked
//! pointer. Whichever side wins the race, `KVM_RUN` returns `EINTR`
//! promptly and the loop observes the cancel flag.
//!
//! # Register model
//!
//! Bulk register access is keyed by the architecture-neutral
//! [`crate::ir::Reg`] enum. On x86-64 it maps onto one `kvm_regs`
//! read-modify-write; on AArch64 each register is a `KVM_{GET,SET}_ONE_REG`
//! on the core-register file.

use super::KvmError;
use crate::hv::HvError;
use crate::ir::Reg;
use std::cell::Cell;
use std::collections::BTreeMap;
use std::sync::Once;

#[cfg(target_arch = "x86_64")]
use kvm_bindings::{kvm_fpu, kvm_msr_entry, kvm_regs, kvm_segment, kvm_sregs, Msrs};

/// Per-thread pointer to the vCPU currently inside `KVM_RUN`, for the
/// SIGUSR1 handler.
thread_local! {
    static ACTIVE_VCPU: Cell<*mut kvm_ioctls::VcpuFd> = const { Cell::new(std::ptr::null_mut()) };
}

extern "C" fn kick_handler(_sig: libc::c_int) {
    ACTIVE_VCPU.with(|cell| {
        let ptr = cell.get();
        if !ptr.is_null() {
            // Writes a flag in the mmapped kvm_run page; async-signal-safe.
            unsafe { (*ptr).set_kvm_immediate_exit(1) };
        }
    });
}

/// Install the SIGUSR1 kick handler once per process.
pub(super) fn install_kick_handler() {
    use nix::sys::signal::{sigaction, SaFlags, SigAction, SigHandler, SigSet, Signal};

    static ONCE: Once = Once::new();
    ONCE.call_once(|| {
        // No SA_RESTART: KVM_RUN must come back with EINTR.
        let action = SigAction::new(
            SigHandler::Handler(kick_handler),
            SaFlags::empty(),
            SigSet::empty(),
        );
        unsafe {
            let _ = sigaction(Signal::SIGUSR1, &action);
        }
    });
}

/// Model-specific registers required for 64-bit Linux boot.
#[cfg(target_arch = "x86_64")]
mod msr {
    pub const IA32_SYSENTER_CS: u32 = 0x174;
    pub const IA32_SYSENTER_ESP: u32 = 0x175;
    pub const IA32_SYSENTER_EIP: u32 = 0x176;
    pub const STAR: u32 = 0xc000_0081;
    pub const LSTAR: u32 = 0xc000_0082;
    pub const CSTAR: u32 = 0xc000_0083;
    pub const SYSCALL_MASK: u32 = 0xc000_0084;
    pub const KERNEL_GS_BASE: u32 = 0xc000_0102;
    pub const IA32_TSC: u32 = 0x10;
    pub const IA32_MISC_ENABLE: u32 = 0x1a0;
    pub const MTRR_DEF_TYPE: u32 = 0x2ff;
    pub const MISC_ENABLE_FAST_STRING: u64 = 1;
}

// Control-register flags for long mode (x86-64).
#[cfg(target_arch = "x86_64")]
mod lm {
    /// CR0.PE - protected mode.
    pub const X86_CR0_PE: u64 = 0x1;
    /// CR0.PG - paging.
    pub const X86_CR0_PG: u64 = 0x8000_0000;
    /// CR4.PAE - 64-bit page table entries.
    pub const X86_CR4_PAE: u64 = 0x20;
    /// EFER.LME - long mode enable.
    pub const EFER_LME: u64 = 0x100;
    /// EFER.LMA - long mode active.
    pub const EFER_LMA: u64 = 0x400;
}

/// AArch64 core-register ids for `KVM_{GET,SET}_ONE_REG`: the index is
/// the 32-bit-word offset of the field within `struct kvm_regs`.
#[cfg(target_arch = "aarch64")]
mod core_reg {
    const KVM_REG_ARM64: u64 = 0x6000_0000_0000_0000;
    const KVM_REG_SIZE_U64: u64 = 0x0030_0000_0000_0000;
    const KVM_REG_ARM_CORE: u64 = 0x0010 << 16;

    pub const fn id(offset_words: u64) -> u64 {
        KVM_REG_ARM64 | KVM_REG_SIZE_U64 | KVM_REG_ARM_CORE | offset_words
    }

    /// `user_pt_regs.regs[i]`.
    pub const fn x(i: u64) -> u64 {
        id(2 * i)
    }
    /// `user_pt_regs.sp`.
    pub const SP: u64 = id(62);
    /// `user_pt_regs.pc`.
    pub const PC: u64 = id(64);
}

/// What happened in one trip through `KVM_RUN`, after device dispatch.
#[derive(Debug)]
pub enum VcpuEvent {
    /// I/O or MMIO was handled by a device; keep running.
    Handled,
    /// A device write handler asked to yield to the caller.
    Yielded,
    /// The guest halted (HLT or PSCI SYSTEM_OFF).
    Halted,
    /// The guest requested a reset.
    Reboot,
    /// `KVM_RUN` was interrupted (cancellation kick).
    Interrupted,
}

/// A single KVM vCPU.
pub struct KvmVcpu {
    vcpu: kvm_ioctls::VcpuFd,
    id: u32,
}

impl KvmVcpu {
    pub(super) fn new(vcpu: kvm_ioctls::VcpuFd, id: u32) -> Self {
        KvmVcpu { vcpu, id }
    }

    pub(super) fn id(&self) -> u32 {
        self.id
    }

    /// Run the guest until the next exit and dispatch it against the
    /// device set.
    pub(super) fn run_step(
        &mut self,
        devices: &mut crate::devices::DeviceSet,
    ) -> Result<VcpuEvent, HvError> {
        // Reset the immediate-exit flag before entering KVM_RUN so a
        // previous kick can't cause a spurious immediate exit.
        self.vcpu.set_kvm_immediate_exit(0);

        // Park the vCPU pointer for the kick handler while inside KVM_RUN.
        let raw: *mut kvm_ioctls::VcpuFd = &mut self.vcpu;
        ACTIVE_VCPU.with(|cell| cell.set(raw));
        let result = self.vcpu.run();
        ACTIVE_VCPU.with(|cell| cell.set(std::ptr::null_mut()));

        use kvm_ioctls::VcpuExit;
        let exit = match result {
            Ok(exit) => exit,
            Err(e) if e.errno() == libc::EINTR => return Ok(VcpuEvent::Interrupted),
            Err(e) => return Err(KvmError::Run(e).into()),
        };

        match exit {
            #[cfg(target_arch = "x86_64")]
            VcpuExit::IoIn(port, data) => {
                devices.port_read(port, data);
                Ok(VcpuEvent::Handled)
            }
            #[cfg(target_arch = "x86_64")]
            VcpuExit::IoOut(port, data) => Ok(match devices.port_write(port, data) {
                crate::hv::WriteOutcome::Continue => VcpuEvent::Handled,
                crate::hv::WriteOutcome::Yield => VcpuEvent::Yielded,
            }),
            VcpuExit::MmioRead(addr, data) => {
                devices.mmio_read(addr, data)?;
                Ok(VcpuEvent::Handled)
            }
            VcpuExit::MmioWrite(addr, data) => Ok(match devices.mmio_write(addr, data)? {
                crate::hv::WriteOutcome::Continue => VcpuEvent::Handled,
                crate::hv::WriteOutcome::Yield => VcpuEvent::Yielded,
            }),
            VcpuExit::Hlt => Ok(VcpuEvent::Halted),
            VcpuExit::Shutdown => Ok(VcpuEvent::Reboot),
            VcpuExit::SystemEvent(kind, _data) => match kind {
                kvm_bindings::KVM_SYSTEM_EVENT_SHUTDOWN => Ok(VcpuEvent::Halted),
                kvm_bindings::KVM_SYSTEM_EVENT_RESET => Ok(VcpuEvent::Reboot),
                other => Err(HvError::UnhandledExit(format!("system event {other}"))),
            },
            VcpuExit::InternalError => Err(HvError::UnhandledExit("internal error".into())),
            VcpuExit::FailEntry(reason, cpu) => Err(HvError::UnhandledExit(format!(
                "failed to enter guest: reason={reason:#x} cpu={cpu}"
            ))),
            other => Err(HvError::UnhandledExit(format!("{other:?}"))),
        }
    }

    // ------------------------------------------------------------------
    // x86-64 register access
    // ------------------------------------------------------------------

    #[cfg(target_arch = "x86_64")]
    pub(super) fn get_registers(&self, map: &mut BTreeMap<Reg, u64>) -> Result<(), HvError> {
        let regs = self.vcpu.get_regs().map_err(KvmError::GetRegisters)?;
        for (reg, value) in map.iter_mut() {
            *value = *x86_field(&regs, *reg).ok_or(HvError::BadRegister(reg.name()))?;
        }
        Ok(())
    }

    #[cfg(target_arch = "x86_64")]
    pub(super) fn set_registers(&self, map: &BTreeMap<Reg, u64>) -> Result<(), HvError> {
        let mut regs = self.vcpu.get_regs().map_err(KvmError::GetRegisters)?;
        for (reg, value) in map {
            *x86_field_mut(&mut regs, *reg).ok_or(HvError::BadRegister(reg.name()))? = *value;
        }
        self.vcpu.set_regs(&regs).map_err(KvmError::SetRegisters)?;
        Ok(())
    }

    /// Configure the MSRs 64-bit Linux expects at entry.
    #[cfg(target_arch = "x86_64")]
    pub(super) fn set_boot_msrs(&self) -> Result<(), KvmError> {
        let msr_entry = |index: u32, data: u64| kvm_msr_entry {
            index,
            data,
            ..Default::default()
        };

        let entries = vec![
            msr_entry(msr::IA32_SYSENTER_CS, 0),
            msr_entry(msr::IA32_SYSENTER_ESP, 0),
            msr_entry(msr::IA32_SYSENTER_EIP, 0),
            msr_entry(msr::STAR, 0),
            msr_entry(msr::CSTAR, 0),
            msr_entry(msr::KERNEL_GS_BASE, 0),
            msr_entry(msr::SYSCALL_MASK, 0),
            msr_entry(msr::LSTAR, 0),
            msr_entry(msr::IA32_TSC, 0),
            msr_entry(msr::IA32_MISC_ENABLE, msr::MISC_ENABLE_FAST_STRING),
            // Default memory type write-back, MTRRs enabled.
            msr_entry(msr::MTRR_DEF_TYPE, (1 << 11) | 6),
        ];

        let msrs =
            Msrs::from_entries(&entries).map_err(|_| KvmError::SetMsrs(kvm_ioctls::Error::new(22)))?;
        self.vcpu.set_msrs(&msrs).map_err(KvmError::SetMsrs)?;
        Ok(())
    }

    /// Build identity-mapped page tables at `paging_base` covering `gib`
    /// GiB (2 MiB pages), install a GDT after them, and enter long mode
    /// with the given selectors.
    ///
    /// Layout written into guest RAM:
    ///
    /// ```text
    /// paging_base + 0x0000           PML4
    /// paging_base + 0x1000           PDPT
    /// paging_base + 0x2000 + i*4K    PD for GiB i (512 × 2MiB entries)
    /// paging_base + 0x2000 + gib*4K  GDT
    /// ```
    #[cfg(target_arch = "x86_64")]
    pub(super) fn set_long_mode_with_selectors(
        &self,
        memory: &crate::boot::GuestMemory,
        paging_base: u64,
        gib: u64,
        code_sel: u16,
        data_sel: u16,
    ) -> Result<(), KvmError> {
        let pml4 = paging_base;
        let pdpt = paging_base + 0x1000;
        let pd_base = paging_base + 0x2000;
        let gdt_base = pd_base + gib * 0x1000;

        // PML4[0] -> PDPT, present + writable.
        memory.write_u64(pml4, pdpt | 0x03)?;
        for i in 0..gib {
            // PDPT[i] -> PD for the i-th GiB.
            memory.write_u64(pdpt + i * 8, (pd_base + i * 0x1000) | 0x03)?;
            // 512 × 2MiB pages: present + writable + page-size.
            let mut pd = [0u8; 4096];
            for j in 0..512u64 {
                let entry = (i << 30 | j << 21) | 0x83;
                pd[j as usize * 8..j as usize * 8 + 8].copy_from_slice(&entry.to_le_bytes());
            }
            memory.write(pd_base + i * 0x1000, &pd)?;
        }

        // GDT: null + code + data + TSS, placed by selector index.
        let code_idx = (code_sel / 8) as usize;
        let data_idx = (data_sel / 8) as usize;
        let tss_idx = code_idx.max(data_idx) + 1;
        let mut gdt = vec![0u64; tss_idx + 1];
        gdt[code_idx] = gdt_entry(0xa09b, 0, 0xfffff); // 64-bit code, execute/read
        gdt[data_idx] = gdt_entry(0xc093, 0, 0xfffff); // data, read/write
        gdt[tss_idx] = gdt_entry(0x808b, 0, 0xfffff); // TSS (KVM needs TR loadable)
        for (i, entry) in gdt.iter().enumerate() {
            memory.write_u64(gdt_base + i as u64 * 8, *entry)?;
        }

        let code_seg = kvm_segment_from_gdt(gdt[code_idx], code_idx as u8);
        let data_seg = kvm_segment_from_gdt(gdt[data_idx], data_idx as u8);
        let tss_seg = kvm_segment_from_gdt(gdt[tss_idx], tss_idx as u8);

        let mut sregs: kvm_sregs = self.vcpu.get_sregs().map_err(KvmError::GetRegisters)?;
        sregs.gdt.base = gdt_base;
        sregs.gdt.limit = (gdt.len() * 8 - 1) as u16;
        sregs.idt.base = 0;
        sregs.idt.limit = 0;
        sregs.cs = code_seg;
        sregs.ds = data_seg;
        sregs.es = data_seg;
        sregs.fs = data_seg;
        sregs.gs = data_seg;
        sregs.ss = data_seg;
        sregs.tr = tss_seg;
        sregs.cr3 = pml4;
        sregs.cr4 |= lm::X86_CR4_PAE;
        sregs.cr0 |= lm::X86_CR0_PE | lm::X86_CR0_PG;
        sregs.efer |= lm::EFER_LME | lm::EFER_LMA;
        self.vcpu.set_sregs(&sregs).map_err(KvmError::SetRegisters)?;

        // FPU defaults: x87 exceptions masked, SSE round-to-nearest.
        let fpu = kvm_fpu {
            fcw: 0x37f,
            mxcsr: 0x1f80,
            ..Default::default()
        };
        self.vcpu.set_fpu(&fpu).map_err(KvmError::SetRegisters)?;
        Ok(())
    }

    /// Apply the supported-CPUID set, with the hypervisor bit raised.
    #[cfg(target_arch = "x86_64")]
    pub(super) fn setup_cpuid(&self, kvm: &kvm_ioctls::Kvm) -> Result<(), KvmError> {
        let mut cpuid = kvm
            .get_supported_cpuid(kvm_bindings::KVM_MAX_CPUID_ENTRIES)
            .map_err(KvmError::GetSupportedCpuid)?;
        for entry in cpuid.as_mut_slice() {
            if entry.function == 1 {
                entry.ecx |= 1 << 31; // X86_FEATURE_HYPERVISOR
            }
        }
        self.vcpu.set_cpuid2(&cpuid).map_err(KvmError::SetCpuid)?;
        Ok(())
    }

    // ------------------------------------------------------------------
    // AArch64 register access
    // ------------------------------------------------------------------

    /// Initialize the vCPU with the host's preferred target and in-kernel
    /// PSCI, so guest SYSTEM_OFF/SYSTEM_RESET surface as system events.
    #[cfg(target_arch = "aarch64")]
    pub(super) fn init(&self, vm: &kvm_ioctls::VmFd) -> Result<(), KvmError> {
        let mut kvi = kvm_bindings::kvm_vcpu_init::default();
        vm.get_preferred_target(&mut kvi)
            .map_err(KvmError::VcpuInit)?;
        kvi.features[0] |= 1 << kvm_bindings::KVM_ARM_VCPU_PSCI_0_2;
        self.vcpu.vcpu_init(&kvi).map_err(KvmError::VcpuInit)?;
        Ok(())
    }

    #[cfg(target_arch = "aarch64")]
    pub(super) fn get_registers(&self, map: &mut BTreeMap<Reg, u64>) -> Result<(), HvError> {
        for (reg, value) in map.iter_mut() {
            let id = arm64_reg_id(*reg).ok_or(HvError::BadRegister(reg.name()))?;
            let mut bytes = [0u8; 8];
            self.vcpu
                .get_one_reg(id, &mut bytes)
                .map_err(KvmError::GetRegisters)?;
            *value = u64::from_le_bytes(bytes);
        }
        Ok(())
    }

    #[cfg(target_arch = "aarch64")]
    pub(super) fn set_registers(&self, map: &BTreeMap<Reg, u64>) -> Result<(), HvError> {
        for (reg, value) in map {
            let id = arm64_reg_id(*reg).ok_or(HvError::BadRegister(reg.name()))?;
            self.vcpu
                .set_one_reg(id, &value.to_le_bytes())
                .map_err(KvmError::SetRegisters)?;
        }
        Ok(())
    }

    /// Raw state blob for snapshots: every core register in enum order.
    pub(super) fn snapshot_regs(&self) -> Result<BTreeMap<Reg, u64>, HvError> {
        let mut map = BTreeMap::new();
        for reg in snapshot_reg_set() {
            map.insert(reg, 0u64);
        }
        self.get_registers(&mut map)?;
        Ok(map)
    }

    /// System state the register map does not model. On x86-64 this is
    /// the raw `kvm_sregs` (segments, control registers, EFER); AArch64
    /// core state is fully covered by the map.
    pub(super) fn snapshot_system_state(&self) -> Result<Vec<u8>, HvError> {
        #[cfg(target_arch = "x86_64")]
        {
            let sregs = self.vcpu.get_sregs().map_err(KvmError::GetRegisters)?;
            let bytes = unsafe {
                std::slice::from_raw_parts(
                    (&sregs as *const kvm_sregs).cast::<u8>(),
                    std::mem::size_of::<kvm_sregs>(),
                )
            };
            Ok(bytes.to_vec())
        }
        #[cfg(not(target_arch = "x86_64"))]
        {
            Ok(Vec::new())
        }
    }

    /// Restore state captured by [`Self::snapshot_system_state`].
    pub(super) fn restore_system_state(&self, state: &[u8]) -> Result<(), HvError> {
        #[cfg(target_arch = "x86_64")]
        {
            if state.len() != std::mem::size_of::<kvm_sregs>() {
                if state.is_empty() {
                    return Ok(());
                }
                return Err(HvError::Backend {
                    backend: "kvm",
                    op: "restore sregs",
                    detail: format!("unexpected sregs blob size {}", state.len()),
                });
            }
            let mut sregs = kvm_sregs::default();
            unsafe {
                std::ptr::copy_nonoverlapping(
                    state.as_ptr(),
                    (&mut sregs as *mut kvm_sregs).cast::<u8>(),
                    state.len(),
                );
            }
            self.vcpu.set_sregs(&sregs).map_err(KvmError::SetRegisters)?;
            Ok(())
        }
        #[cfg(not(target_arch = "x86_64"))]
        {
            let _ = state;
            Ok(())
        }
    }
}

/// The register set a snapshot captures on this architecture.
pub(super) fn snapshot_reg_set() -> Vec<Reg> {
    #[cfg(target_arch = "x86_64")]
    {
        use Reg::*;
        vec![
            Rax, Rbx, Rcx, Rdx, Rsi, Rdi, Rsp, Rbp, R8, R9, R10, R11, R12, R13, R14, R15, Rip,
            Rflags,
        ]
    }
    #[cfg(target_arch = "aarch64")]
    {
        let mut set: Vec<Reg> = (0..31).map(|i| arm64_x(i).unwrap()).collect();
        set.push(Reg::Sp);
        set.push(Reg::Pc);
        set
    }
    #[cfg(not(any(target_arch = "x86_64", target_arch = "aarch64")))]
    {
        Vec::new()
    }
}

#[cfg(target_arch = "x86_64")]
fn x86_field(regs: &kvm_regs, reg: Reg) -> Option<&u64> {
    Some(match reg {
        Reg::Rax => &regs.rax,
        Reg::Rbx => &regs.rbx,
        Reg::Rcx => &regs.rcx,
        Reg::Rdx => &regs.rdx,
        Reg::Rsi => &regs.rsi,
        Reg::Rdi => &regs.rdi,
        Reg::Rsp => &regs.rsp,
        Reg::Rbp => &regs.rbp,
        Reg::R8 => &regs.r8,
        Reg::R9 => &regs.r9,
        Reg::R10 => &regs.r10,
        Reg::R11 => &regs.r11,
        Reg::R12 => &regs.r12,
        Reg::R13 => &regs.r13,
        Reg::R14 => &regs.r14,
        Reg::R15 => &regs.r15,
        Reg::Rip => &regs.rip,
        Reg::Rflags => &regs.rflags,
        _ => return None,
    })
}

#[cfg(target_arch = "x86_64")]
fn x86_field_mut(regs: &mut kvm_regs, reg: Reg) -> Option<&mut u64> {
    Some(match reg {
        Reg::Rax => &mut regs.rax,
        Reg::Rbx => &mut regs.rbx,
        Reg::Rcx => &mut regs.rcx,
        Reg::Rdx => &mut regs.rdx,
        Reg::Rsi => &mut regs.rsi,
        Reg::Rdi => &mut regs.rdi,
        Reg::Rsp => &mut regs.rsp,
        Reg::Rbp => &mut regs.rbp,
        Reg::R8 => &mut regs.r8,
        Reg::R9 => &mut regs.r9,
        Reg::R10 => &mut regs.r10,
        Reg::R11 => &mut regs.r11,
        Reg::R12 => &mut regs.r12,
        Reg::R13 => &mut regs.r13,
        Reg::R14 => &mut regs.r14,
        Reg::R15 => &mut regs.r15,
        Reg::Rip => &mut regs.rip,
        Reg::Rflags => &mut regs.rflags,
        _ => return None,
    })
}

#[cfg(target_arch = "aarch64")]
fn arm64_x(i: u8) -> Option<Reg> {
    if i > 30 {
        return None;
    }
    // ir::Reg numbers X0..X30 contiguously after the x86 block.
    let base = Reg::X0 as u8;
    // Safety by construction: the discriminant exists for 0..=30.
    Some(unsafe { std::mem::transmute::<u8, Reg>(base + i) })
}

#[cfg(target_arch = "aarch64")]
fn arm64_reg_id(reg: Reg) -> Option<u64> {
    match reg {
        Reg::Sp => Some(core_reg::SP),
        Reg::Pc => Some(core_reg::PC),
        r if r.arch() == crate::ir::Arch::Aarch64 && r != Reg::Sp && r != Reg::Pc => {
            Some(core_reg::x((r as u8 - Reg::X0 as u8) as u64))
        }
        _ => None,
    }
}

/// Construct a GDT entry from flags/base/limit (the historical packed
/// layout).
#[cfg(target_arch = "x86_64")]
const fn gdt_entry(flags: u16, base: u32, limit: u32) -> u64 {
    ((base as u64 & 0xff00_0000) << 32)
        | ((base as u64 & 0x00ff_ffff) << 16)
        | (limit as u64 & 0x0000_ffff)
        | (((limit as u64 & 0x000f_0000) >> 16) << 48)
        | ((flags as u64) << 40)
}

/// Unpack a GDT entry into the kvm_segment KVM wants.
#[cfg(target_arch = "x86_64")]
fn kvm_segment_from_gdt(entry: u64, table_index: u8) -> kvm_segment {
    kvm_segment {
        base: ((entry >> 16) & 0xff_ffff) | (((entry >> 56) & 0xff) << 24),
        limit: ((entry & 0xffff) | (((entry >> 48) & 0xf) << 16)) as u32,
        selector: u16::from(table_index) * 8,
        type_: ((entry >> 40) & 0xf) as u8,
        present: ((entry >> 47) & 0x1) as u8,
        dpl: ((entry >> 45) & 0x3) as u8,
        db: ((entry >> 54) & 0x1) as u8,
        s: ((entry >> 44) & 0x1) as u8,
        l: ((entry >> 53) & 0x1) as u8,
        g: ((entry >> 55) & 0x1) as u8,
        ..Default::default()
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_snapshot_reg_set_covers_gprs() {
        let set = snapshot_reg_set();
        #[cfg(target_arch = "x86_64")]
        {
            assert!(set.contains(&Reg::Rax));
            assert!(set.contains(&Reg::Rip));
            assert_eq!(set.len(), 18);
        }
        #[cfg(target_arch = "aarch64")]
        {
            assert!(set.contains(&Reg::X0));
            assert!(set.contains(&Reg::Pc));
            assert_eq!(set.len(), 33);
        }
    }

    #[cfg(target_arch = "x86_64")]
    #[test]
    fn test_gdt_entry_matches_boot_layout() {
        // The 64-bit code descriptor used by the Linux boot protocol.
        let code = gdt_entry(0xa09b, 0, 0xfffff);
        let seg = kvm_segment_from_gdt(code, 2);
        assert_eq!(seg.selector, 0x10);
        assert_eq!(seg.l, 1);
        assert_eq!(seg.present, 1);
        assert_eq!(seg.type_, 0xb);
    }
}
