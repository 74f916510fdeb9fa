//! Apple Hypervisor framework (HVF) backend, AArch64 hosts.
//!
//! Direct FFI onto `Hypervisor.framework` — the framework is part of
//! macOS and links like any system library; entitlement
//! `com.apple.security.hypervisor` is required at runtime.
//!
//! Shape mirrors the KVM backend: guest RAM is one host allocation
//! mapped RWX into the guest physical window, vCPU 0 runs EL1 with a
//! synthesized exception vector table, and exits are classified into the
//! common run outcomes. PSCI arrives as HVC exceptions rather than
//! kernel-handled system events, so `SYSTEM_OFF` / `SYSTEM_RESET` are
//! decoded here.

#![allow(non_camel_case_types)]

use super::{
    CancelToken, Device, Hypervisor, HvError, IrqLine, IrqSink, RunOutcome, Snapshot, VcpuOps,
    VcpuSnapshot, Vm, VmConfig,
};
use crate::devices::DeviceSet;
use crate::ir::{Arch, Reg};
use std::collections::BTreeMap;
use std::sync::Arc;

type hv_return_t = i32;
type hv_vcpu_t = u64;

const HV_SUCCESS: hv_return_t = 0;

// hv_memory_flags_t
const HV_MEMORY_READ: u64 = 1 << 0;
const HV_MEMORY_WRITE: u64 = 1 << 1;
const HV_MEMORY_EXEC: u64 = 1 << 2;

// hv_exit_reason_t
const HV_EXIT_REASON_CANCELED: u32 = 0;
const HV_EXIT_REASON_EXCEPTION: u32 = 1;
const HV_EXIT_REASON_VTIMER_ACTIVATED: u32 = 2;

// hv_reg_t
const HV_REG_X0: u32 = 0;
const HV_REG_PC: u32 = 31;
const HV_REG_CPSR: u32 = 34;

// hv_sys_reg_t (ARM system-register encodings as the framework names them)
const HV_SYS_REG_SP_EL1: u16 = 0xe208;
const HV_SYS_REG_SCTLR_EL1: u16 = 0xc080;
const HV_SYS_REG_CPACR_EL1: u16 = 0xc082;
const HV_SYS_REG_VBAR_EL1: u16 = 0xc600;

// Exception classes from ESR_EL2.EC.
const EC_HVC64: u64 = 0x16;
const EC_DATA_ABORT_LOWER: u64 = 0x24;

// PSCI function ids.
const PSCI_SYSTEM_OFF: u64 = 0x8400_0008;
const PSCI_SYSTEM_RESET: u64 = 0x8400_0009;

/// Exit information the framework fills per vCPU.
#[repr(C)]
struct hv_vcpu_exit_exception_t {
    syndrome: u64,
    virtual_address: u64,
    physical_address: u64,
}

#[repr(C)]
struct hv_vcpu_exit_t {
    reason: u32,
    exception: hv_vcpu_exit_exception_t,
}

#[link(name = "Hypervisor", kind = "framework")]
extern "C" {
    fn hv_vm_create(config: *mut std::ffi::c_void) -> hv_return_t;
    fn hv_vm_map(addr: *mut std::ffi::c_void, gpa: u64, size: usize, flags: u64) -> hv_return_t;
    fn hv_vcpu_create(
        vcpu: *mut hv_vcpu_t,
        exit: *mut *const hv_vcpu_exit_t,
        config: *mut std::ffi::c_void,
    ) -> hv_return_t;
    fn hv_vcpu_run(vcpu: hv_vcpu_t) -> hv_return_t;
    fn hv_vcpus_exit(vcpus: *const hv_vcpu_t, count: u32) -> hv_return_t;
    fn hv_vcpu_get_reg(vcpu: hv_vcpu_t, reg: u32, value: *mut u64) -> hv_return_t;
    fn hv_vcpu_set_reg(vcpu: hv_vcpu_t, reg: u32, value: u64) -> hv_return_t;
    fn hv_vcpu_get_sys_reg(vcpu: hv_vcpu_t, reg: u16, value: *mut u64) -> hv_return_t;
    fn hv_vcpu_set_sys_reg(vcpu: hv_vcpu_t, reg: u16, value: u64) -> hv_return_t;
}

fn check(op: &'static str, ret: hv_return_t) -> Result<(), HvError> {
    if ret == HV_SUCCESS {
        Ok(())
    } else {
        Err(HvError::Backend {
            backend: "hvf",
            op,
            detail: format!("hv_return {ret:#x}"),
        })
    }
}

/// The opened HVF backend.
pub struct HvfHypervisor;

/// Probe the framework by creating the (process-wide) VM.
pub fn open() -> Result<HvfHypervisor, HvError> {
    check("hv_vm_create", unsafe {
        hv_vm_create(std::ptr::null_mut())
    })?;
    Ok(HvfHypervisor)
}

impl Hypervisor for HvfHypervisor {
    fn name(&self) -> &'static str {
        "hvf"
    }

    fn architecture(&self) -> Arch {
        Arch::Aarch64
    }

    fn create_vm(&self, config: VmConfig) -> Result<Box<dyn Vm>, HvError> {
        Ok(Box::new(HvfVm::new(config)?))
    }
}

/// Guest RAM: page-aligned host allocation mapped into the guest.
struct HostRam {
    ptr: *mut u8,
    size: usize,
}

unsafe impl Send for HostRam {}

impl Drop for HostRam {
    fn drop(&mut self) {
        unsafe {
            libc::munmap(self.ptr.cast(), self.size);
        }
    }
}

pub struct HvfVm {
    ram: HostRam,
    mem_base: u64,
    mem_size: u64,
    vcpu: hv_vcpu_t,
    exit: *const hv_vcpu_exit_t,
    devices: DeviceSet,
}

// The vcpu handle is only ever used from the thread driving `run`; the
// struct moves between threads as a whole.
unsafe impl Send for HvfVm {}

/// Guest-physical address of the synthesized EL1 vector table, placed in
/// the top 4 KiB page below the RAM end.
fn vector_table_gpa(config: &VmConfig) -> u64 {
    config.mem_base + config.mem_size - 0x1000
}

impl HvfVm {
    fn new(config: VmConfig) -> Result<Self, HvError> {
        if config.irqchip {
            return Err(HvError::Backend {
                backend: "hvf",
                op: "create_vm",
                detail: "in-kernel irqchip emulation is not available".to_string(),
            });
        }

        let size = config.mem_size as usize;
        let ptr = unsafe {
            libc::mmap(
                std::ptr::null_mut(),
                size,
                libc::PROT_READ | libc::PROT_WRITE,
                libc::MAP_PRIVATE | libc::MAP_ANONYMOUS,
                -1,
                0,
            )
        };
        if ptr == libc::MAP_FAILED {
            return Err(HvError::Backend {
                backend: "hvf",
                op: "allocate guest ram",
                detail: std::io::Error::last_os_error().to_string(),
            });
        }
        let ram = HostRam {
            ptr: ptr.cast(),
            size,
        };

        check("hv_vm_map", unsafe {
            hv_vm_map(
                ram.ptr.cast(),
                config.mem_base,
                size,
                HV_MEMORY_READ | HV_MEMORY_WRITE | HV_MEMORY_EXEC,
            )
        })?;

        let mut vcpu: hv_vcpu_t = 0;
        let mut exit: *const hv_vcpu_exit_t = std::ptr::null();
        check("hv_vcpu_create", unsafe {
            hv_vcpu_create(&mut vcpu, &mut exit, std::ptr::null_mut())
        })?;

        let mut vm = HvfVm {
            ram,
            mem_base: config.mem_base,
            mem_size: config.mem_size,
            vcpu,
            exit,
            devices: DeviceSet::new(),
        };
        vm.configure_el1(&config)?;
        eprintln!(
            "[HVF] VM created: {} MB RAM at {:#x}",
            config.mem_size >> 20,
            config.mem_base
        );
        Ok(vm)
    }

    /// EL1 setup: floating point on, MMU off, exception vectors pointing
    /// at a table whose every entry requests SYSTEM_OFF — an unexpected
    /// exception halts the VM instead of spinning silently.
    fn configure_el1(&mut self, config: &VmConfig) -> Result<(), HvError> {
        let vbar = vector_table_gpa(config);
        let table = build_vector_table();
        self.write_ram(&table, vbar - self.mem_base)?;

        unsafe {
            // EL1h, DAIF masked.
            check("set cpsr", hv_vcpu_set_reg(self.vcpu, HV_REG_CPSR, 0x3c5))?;
            // SCTLR: RES1 bits, MMU and caches off.
            check(
                "set sctlr_el1",
                hv_vcpu_set_sys_reg(self.vcpu, HV_SYS_REG_SCTLR_EL1, 0x30d0_0800),
            )?;
            // CPACR: no FP traps.
            check(
                "set cpacr_el1",
                hv_vcpu_set_sys_reg(self.vcpu, HV_SYS_REG_CPACR_EL1, 0x30_0000),
            )?;
            check(
                "set vbar_el1",
                hv_vcpu_set_sys_reg(self.vcpu, HV_SYS_REG_VBAR_EL1, vbar),
            )?;
        }
        Ok(())
    }

    fn write_ram(&self, data: &[u8], offset: u64) -> Result<(), HvError> {
        if offset
            .checked_add(data.len() as u64)
            .map_or(true, |end| end > self.mem_size)
        {
            return Err(HvError::MemoryRange {
                offset,
                len: data.len(),
            });
        }
        unsafe {
            std::ptr::copy_nonoverlapping(
                data.as_ptr(),
                self.ram.ptr.add(offset as usize),
                data.len(),
            );
        }
        Ok(())
    }

    fn read_ram(&self, data: &mut [u8], offset: u64) -> Result<(), HvError> {
        if offset
            .checked_add(data.len() as u64)
            .map_or(true, |end| end > self.mem_size)
        {
            return Err(HvError::MemoryRange {
                offset,
                len: data.len(),
            });
        }
        unsafe {
            std::ptr::copy_nonoverlapping(
                self.ram.ptr.add(offset as usize),
                data.as_mut_ptr(),
                data.len(),
            );
        }
        Ok(())
    }

    fn get_reg(&self, reg: u32) -> Result<u64, HvError> {
        let mut value = 0u64;
        check("hv_vcpu_get_reg", unsafe {
            hv_vcpu_get_reg(self.vcpu, reg, &mut value)
        })?;
        Ok(value)
    }

    fn set_reg(&self, reg: u32, value: u64) -> Result<(), HvError> {
        check("hv_vcpu_set_reg", unsafe {
            hv_vcpu_set_reg(self.vcpu, reg, value)
        })
    }

    /// Handle a data abort as MMIO against the device set, advancing PC
    /// past the faulting instruction. `Some` when a device yielded.
    fn handle_mmio(&mut self, syndrome: u64, pa: u64) -> Result<Option<RunOutcome>, HvError> {
        // ISS decode for data aborts: ISV must be set for the syndrome
        // to carry the access description.
        let isv = syndrome & (1 << 24) != 0;
        if !isv {
            return Err(HvError::UnhandledExit(format!(
                "data abort without syndrome info at {pa:#x}"
            )));
        }
        let len = 1usize << ((syndrome >> 22) & 0x3);
        let is_write = syndrome & (1 << 6) != 0;
        let srt = ((syndrome >> 16) & 0x1f) as u32;

        let mut yielded = false;
        if is_write {
            let value = if srt == 31 {
                0
            } else {
                self.get_reg(HV_REG_X0 + srt)?
            };
            let bytes = value.to_le_bytes();
            if self.devices.mmio_write(pa, &bytes[..len])? == super::WriteOutcome::Yield {
                yielded = true;
            }
        } else {
            let mut bytes = [0u8; 8];
            self.devices.mmio_read(pa, &mut bytes[..len])?;
            if srt != 31 {
                self.set_reg(HV_REG_X0 + srt, u64::from_le_bytes(bytes))?;
            }
        }

        let pc = self.get_reg(HV_REG_PC)?;
        self.set_reg(HV_REG_PC, pc + 4)?;
        Ok(yielded.then_some(RunOutcome::Yielded))
    }
}

/// 16 entries of 128 bytes, each `mov x0, SYSTEM_OFF; hvc #0; b .`.
fn build_vector_table() -> Vec<u8> {
    use crate::asm::aarch64 as enc;
    let mut table = Vec::with_capacity(16 * 128);
    for _ in 0..16 {
        let mut entry = Vec::with_capacity(128);
        entry.extend_from_slice(&enc::mov_ri(enc::regs::X0, PSCI_SYSTEM_OFF as i64));
        entry.extend_from_slice(&enc::hvc(0));
        // b . (spin if the HVC somehow returns)
        entry.extend_from_slice(&0x1400_0000u32.to_le_bytes());
        entry.resize(128, 0);
        table.extend_from_slice(&entry);
    }
    table
}

struct HvfIrqSink;

impl IrqSink for HvfIrqSink {
    fn set_irq(&self, gsi: u32, _high: bool) {
        // No interrupt controller is emulated on this backend; devices
        // that pulse lines simply make no progress visible to the guest.
        eprintln!("[HVF] dropped interrupt on gsi {gsi}");
    }
}

struct HvfVcpuRef<'a> {
    vm: &'a mut HvfVm,
}

impl VcpuOps for HvfVcpuRef<'_> {
    fn get_registers(&mut self, map: &mut BTreeMap<Reg, u64>) -> Result<(), HvError> {
        for (reg, value) in map.iter_mut() {
            *value = match hv_reg_for(*reg) {
                Some(HvRegRef::Core(r)) => self.vm.get_reg(r)?,
                Some(HvRegRef::Sys(r)) => {
                    let mut v = 0u64;
                    check("hv_vcpu_get_sys_reg", unsafe {
                        hv_vcpu_get_sys_reg(self.vm.vcpu, r, &mut v)
                    })?;
                    v
                }
                None => return Err(HvError::BadRegister(reg.name())),
            };
        }
        Ok(())
    }

    fn set_registers(&mut self, map: &BTreeMap<Reg, u64>) -> Result<(), HvError> {
        for (reg, value) in map {
            match hv_reg_for(*reg) {
                Some(HvRegRef::Core(r)) => self.vm.set_reg(r, *value)?,
                Some(HvRegRef::Sys(r)) => check("hv_vcpu_set_sys_reg", unsafe {
                    hv_vcpu_set_sys_reg(self.vm.vcpu, r, *value)
                })?,
                None => return Err(HvError::BadRegister(reg.name())),
            }
        }
        Ok(())
    }

    fn set_long_mode_with_selectors(
        &mut self,
        _paging_base: u64,
        _gib: u64,
        _code_sel: u16,
        _data_sel: u16,
    ) -> Result<(), HvError> {
        Err(HvError::Backend {
            backend: "hvf",
            op: "set_long_mode_with_selectors",
            detail: "long mode is an x86-64 concept".to_string(),
        })
    }
}

enum HvRegRef {
    Core(u32),
    Sys(u16),
}

fn hv_reg_for(reg: Reg) -> Option<HvRegRef> {
    match reg {
        Reg::Sp => Some(HvRegRef::Sys(HV_SYS_REG_SP_EL1)),
        Reg::Pc => Some(HvRegRef::Core(HV_REG_PC)),
        r if r.arch() == Arch::Aarch64 => {
            Some(HvRegRef::Core(HV_REG_X0 + (r as u8 - Reg::X0 as u8) as u32))
        }
        _ => None,
    }
}

impl Vm for HvfVm {
    fn add_device(&mut self, device: Device) {
        self.devices.add(device);
    }

    fn irq_line(&self, gsi: u32) -> Result<IrqLine, HvError> {
        Ok(IrqLine::new(Arc::new(HvfIrqSink), gsi))
    }

    fn run(&mut self, cancel: &CancelToken) -> Result<RunOutcome, HvError> {
        // Cancellation: hv_vcpus_exit interrupts a running vCPU.
        let vcpu = self.vcpu;
        cancel.add_kick(Box::new(move || unsafe {
            let list = [vcpu];
            hv_vcpus_exit(list.as_ptr(), 1);
        }));

        loop {
            if cancel.is_canceled() {
                return Ok(RunOutcome::Canceled);
            }
            check("hv_vcpu_run", unsafe { hv_vcpu_run(self.vcpu) })?;

            let exit = unsafe { &*self.exit };
            match exit.reason {
                HV_EXIT_REASON_CANCELED => {
                    if cancel.is_canceled() {
                        return Ok(RunOutcome::Canceled);
                    }
                }
                HV_EXIT_REASON_VTIMER_ACTIVATED => continue,
                HV_EXIT_REASON_EXCEPTION => {
                    let ec = (exit.exception.syndrome >> 26) & 0x3f;
                    match ec {
                        EC_HVC64 => {
                            let x0 = self.get_reg(HV_REG_X0)?;
                            match x0 {
                                PSCI_SYSTEM_OFF => return Ok(RunOutcome::Halted),
                                PSCI_SYSTEM_RESET => return Ok(RunOutcome::RebootRequested),
                                other => {
                                    return Err(HvError::UnhandledExit(format!(
                                        "hvc with x0={other:#x}"
                                    )))
                                }
                            }
                        }
                        EC_DATA_ABORT_LOWER => {
                            if let Some(outcome) = self.handle_mmio(
                                exit.exception.syndrome,
                                exit.exception.physical_address,
                            )? {
                                return Ok(outcome);
                            }
                        }
                        other => {
                            return Err(HvError::UnhandledExit(format!(
                                "exception class {other:#x}"
                            )))
                        }
                    }
                }
                other => {
                    return Err(HvError::UnhandledExit(format!("hvf exit reason {other}")))
                }
            }
        }
    }

    fn write_at(&self, data: &[u8], offset: u64) -> Result<(), HvError> {
        self.write_ram(data, offset)
    }

    fn read_at(&self, data: &mut [u8], offset: u64) -> Result<(), HvError> {
        self.read_ram(data, offset)
    }

    fn with_vcpu(
        &mut self,
        id: u32,
        f: &mut dyn FnMut(&mut dyn VcpuOps) -> Result<(), HvError>,
    ) -> Result<(), HvError> {
        if id != 0 {
            return Err(HvError::NoSuchVcpu(id));
        }
        let mut vref = HvfVcpuRef { vm: self };
        f(&mut vref)
    }

    fn capture_snapshot(&mut self) -> Result<Snapshot, HvError> {
        let mut regs = BTreeMap::new();
        for i in 0..31u8 {
            let reg = unsafe { std::mem::transmute::<u8, Reg>(Reg::X0 as u8 + i) };
            regs.insert(reg, self.get_reg(HV_REG_X0 + i as u32)?);
        }
        regs.insert(Reg::Pc, self.get_reg(HV_REG_PC)?);
        let mut sp = 0u64;
        check("hv_vcpu_get_sys_reg", unsafe {
            hv_vcpu_get_sys_reg(self.vcpu, HV_SYS_REG_SP_EL1, &mut sp)
        })?;
        regs.insert(Reg::Sp, sp);

        let mut memory = vec![0u8; self.mem_size as usize];
        self.read_ram(&mut memory, 0)?;

        Ok(Snapshot {
            backend: "hvf".to_string(),
            vcpus: vec![VcpuSnapshot {
                regs,
                backend_state: Vec::new(),
            }],
            memory,
            devices: self.devices.snapshot_all(),
        })
    }

    fn restore_snapshot(&mut self, snapshot: &Snapshot) -> Result<(), HvError> {
        if snapshot.backend != "hvf" {
            return Err(HvError::SnapshotBackendMismatch {
                expected: "hvf".to_string(),
                got: snapshot.backend.clone(),
            });
        }
        self.write_ram(&snapshot.memory, 0)?;
        if let Some(state) = snapshot.vcpus.first() {
            let mut vref = HvfVcpuRef { vm: self };
            vref.set_registers(&state.regs)?;
        }
        self.devices.restore_all(&snapshot.devices);
        Ok(())
    }
}
