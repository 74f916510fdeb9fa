//! KVM virtual machine: memory slots, devices, vCPUs, run loop,
//! snapshots.

use super::vcpu::{install_kick_handler, snapshot_reg_set, KvmVcpu, VcpuEvent};
use super::KvmError;
use crate::boot::GuestMemory;
use crate::devices::DeviceSet;
use crate::hv::{
    CancelToken, Device, HvError, IrqLine, IrqSink, RunOutcome, Snapshot, VcpuOps, VcpuSnapshot,
    Vm, VmConfig,
};
use crate::ir::Reg;
use std::collections::BTreeMap;
use std::sync::Arc;

/// TSS address required by Intel VT-x, parked in the unused hole below
/// 4GB (does not need backing memory).
#[cfg(target_arch = "x86_64")]
const TSS_ADDRESS: usize = 0xfffb_d000;

/// A KVM-backed virtual machine.
pub struct KvmVm {
    vm: Arc<kvm_ioctls::VmFd>,
    memory: GuestMemory,
    mem_base: u64,
    mem_size: u64,
    vcpus: Vec<KvmVcpu>,
    devices: DeviceSet,
    has_irqchip: bool,
}

impl KvmVm {
    /// Create the VM: guest RAM mapped at `config.mem_base`, vCPUs
    /// created and given their architectural init, optionally the
    /// in-kernel interrupt plumbing.
    pub fn new(kvm: &kvm_ioctls::Kvm, config: VmConfig) -> Result<Self, KvmError> {
        let vm = kvm.create_vm().map_err(KvmError::CreateVm)?;

        #[cfg(target_arch = "x86_64")]
        if config.irqchip {
            // VT-x requires a TSS address before vCPU creation; the PIC +
            // IOAPIC and PIT are what early Linux boot expects to find.
            vm.set_tss_address(TSS_ADDRESS)
                .map_err(KvmError::SetTssAddress)?;
            vm.create_irq_chip().map_err(KvmError::CreateIrqChip)?;
            let pit_config = kvm_bindings::kvm_pit_config {
                flags: kvm_bindings::KVM_PIT_SPEAKER_DUMMY,
                ..Default::default()
            };
            vm.create_pit2(pit_config).map_err(KvmError::CreatePit2)?;
        }

        #[cfg(not(target_arch = "x86_64"))]
        if config.irqchip {
            return Err(KvmError::NoIrqchip);
        }

        let memory = GuestMemory::new(config.mem_size)?;
        let (host_addr, size) = memory.as_raw_parts();
        unsafe {
            let region = kvm_bindings::kvm_userspace_memory_region {
                slot: 0,
                guest_phys_addr: config.mem_base,
                memory_size: size,
                userspace_addr: host_addr,
                flags: 0,
            };
            vm.set_user_memory_region(region)
                .map_err(KvmError::SetMemoryRegion)?;
        }

        let mut vcpus = Vec::with_capacity(config.num_cpus as usize);
        for id in 0..config.num_cpus {
            let fd = vm.create_vcpu(id as u64).map_err(KvmError::CreateVcpu)?;
            let vcpu = KvmVcpu::new(fd, id);
            #[cfg(target_arch = "x86_64")]
            vcpu.setup_cpuid(kvm)?;
            #[cfg(target_arch = "aarch64")]
            vcpu.init(&vm)?;
            eprintln!("[KVM] vCPU {} ready", vcpu.id());
            vcpus.push(vcpu);
        }

        eprintln!(
            "[KVM] VM created: {} MB RAM at {:#x}, {} vCPU(s)",
            config.mem_size >> 20,
            config.mem_base,
            config.num_cpus
        );

        Ok(KvmVm {
            vm: Arc::new(vm),
            memory,
            mem_base: config.mem_base,
            mem_size: config.mem_size,
            vcpus,
            devices: DeviceSet::new(),
            has_irqchip: config.irqchip,
        })
    }

    /// Direct access to guest RAM, for the boot helper and for devices
    /// that walk virtqueues.
    pub fn guest_memory(&self) -> &GuestMemory {
        &self.memory
    }

    /// Configure the Linux-boot MSR set on a vCPU (x86-64).
    #[cfg(target_arch = "x86_64")]
    pub fn set_boot_msrs(&self, vcpu: u32) -> Result<(), KvmError> {
        self.vcpus
            .get(vcpu as usize)
            .ok_or_else(|| KvmError::SetMsrs(kvm_ioctls::Error::new(libc::EINVAL)))?
            .set_boot_msrs()
    }

    fn check_range(&self, offset: u64, len: usize) -> Result<(), HvError> {
        if offset
            .checked_add(len as u64)
            .map_or(true, |end| end > self.mem_size)
        {
            return Err(HvError::MemoryRange { offset, len });
        }
        Ok(())
    }
}

struct KvmIrqSink {
    vm: Arc<kvm_ioctls::VmFd>,
}

impl IrqSink for KvmIrqSink {
    fn set_irq(&self, gsi: u32, high: bool) {
        if let Err(e) = self.vm.set_irq_line(gsi, high) {
            eprintln!("[KVM] set_irq_line gsi={gsi} failed: {e}");
        }
    }
}

struct VcpuRef<'a> {
    vcpu: &'a mut KvmVcpu,
    #[cfg_attr(not(target_arch = "x86_64"), allow(dead_code))]
    memory: &'a GuestMemory,
}

impl VcpuOps for VcpuRef<'_> {
    fn get_registers(&mut self, map: &mut BTreeMap<Reg, u64>) -> Result<(), HvError> {
        self.vcpu.get_registers(map)
    }

    fn set_registers(&mut self, map: &BTreeMap<Reg, u64>) -> Result<(), HvError> {
        self.vcpu.set_registers(map)
    }

    fn set_long_mode_with_selectors(
        &mut self,
        paging_base: u64,
        gib: u64,
        code_sel: u16,
        data_sel: u16,
    ) -> Result<(), HvError> {
        #[cfg(target_arch = "x86_64")]
        {
            self.vcpu
                .set_long_mode_with_selectors(self.memory, paging_base, gib, code_sel, data_sel)
                .map_err(HvError::from)
        }
        #[cfg(not(target_arch = "x86_64"))]
        {
            let _ = (paging_base, gib, code_sel, data_sel);
            Err(HvError::Backend {
                backend: "kvm",
                op: "set_long_mode_with_selectors",
                detail: "long mode is an x86-64 concept".to_string(),
            })
        }
    }
}

impl Vm for KvmVm {
    fn add_device(&mut self, device: Device) {
        self.devices.add(device);
    }

    fn irq_line(&self, gsi: u32) -> Result<IrqLine, HvError> {
        if !self.has_irqchip {
            return Err(HvError::Backend {
                backend: "kvm",
                op: "irq_line",
                detail: "VM was created without an irqchip".to_string(),
            });
        }
        Ok(IrqLine::new(
            Arc::new(KvmIrqSink {
                vm: self.vm.clone(),
            }),
            gsi,
        ))
    }

    fn run(&mut self, cancel: &CancelToken) -> Result<RunOutcome, HvError> {
        install_kick_handler();

        // Let the cancel path interrupt this thread's KVM_RUN.
        let thread = nix::sys::pthread::pthread_self();
        cancel.add_kick(Box::new(move || {
            let _ = nix::sys::pthread::pthread_kill(thread, nix::sys::signal::Signal::SIGUSR1);
        }));

        let vcpu = self
            .vcpus
            .first_mut()
            .ok_or(HvError::NoSuchVcpu(0))?;

        loop {
            if cancel.is_canceled() {
                return Ok(RunOutcome::Canceled);
            }
            match vcpu.run_step(&mut self.devices)? {
                VcpuEvent::Handled => continue,
                VcpuEvent::Yielded => return Ok(RunOutcome::Yielded),
                VcpuEvent::Halted => return Ok(RunOutcome::Halted),
                VcpuEvent::Reboot => return Ok(RunOutcome::RebootRequested),
                VcpuEvent::Interrupted => {
                    if cancel.is_canceled() {
                        return Ok(RunOutcome::Canceled);
                    }
                    // Spurious signal; keep running.
                }
            }
        }
    }

    fn write_at(&self, data: &[u8], offset: u64) -> Result<(), HvError> {
        self.check_range(offset, data.len())?;
        self.memory
            .write(offset, data)
            .map_err(|_| HvError::MemoryRange {
                offset,
                len: data.len(),
            })
    }

    fn read_at(&self, data: &mut [u8], offset: u64) -> Result<(), HvError> {
        self.check_range(offset, data.len())?;
        self.memory
            .read(offset, data)
            .map_err(|_| HvError::MemoryRange {
                offset,
                len: data.len(),
            })
    }

    fn with_vcpu(
        &mut self,
        id: u32,
        f: &mut dyn FnMut(&mut dyn VcpuOps) -> Result<(), HvError>,
    ) -> Result<(), HvError> {
        let vcpu = self
            .vcpus
            .get_mut(id as usize)
            .ok_or(HvError::NoSuchVcpu(id))?;
        let mut vref = VcpuRef {
            vcpu,
            memory: &self.memory,
        };
        f(&mut vref)
    }

    fn capture_snapshot(&mut self) -> Result<Snapshot, HvError> {
        let mut vcpus = Vec::with_capacity(self.vcpus.len());
        for vcpu in &self.vcpus {
            vcpus.push(VcpuSnapshot {
                regs: vcpu.snapshot_regs()?,
                backend_state: vcpu.snapshot_system_state()?,
            });
        }

        let mut memory = vec![0u8; self.mem_size as usize];
        self.memory
            .read(0, &mut memory)
            .map_err(|_| HvError::MemoryRange {
                offset: 0,
                len: self.mem_size as usize,
            })?;

        Ok(Snapshot {
            backend: "kvm".to_string(),
            vcpus,
            memory,
            devices: self.devices.snapshot_all(),
        })
    }

    fn restore_snapshot(&mut self, snapshot: &Snapshot) -> Result<(), HvError> {
        if snapshot.backend != "kvm" {
            return Err(HvError::SnapshotBackendMismatch {
                expected: "kvm".to_string(),
                got: snapshot.backend.clone(),
            });
        }

        self.memory
            .write(0, &snapshot.memory)
            .map_err(|_| HvError::MemoryRange {
                offset: 0,
                len: snapshot.memory.len(),
            })?;

        for (vcpu, state) in self.vcpus.iter_mut().zip(&snapshot.vcpus) {
            // Only restore the keys the capture produced, in full.
            let mut regs = state.regs.clone();
            for reg in snapshot_reg_set() {
                regs.entry(reg).or_insert(0);
            }
            vcpu.set_registers(&regs)?;
            vcpu.restore_system_state(&state.backend_state)?;
        }

        self.devices.restore_all(&snapshot.devices);
        Ok(())
    }
}

impl std::fmt::Debug for KvmVm {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.debug_struct("KvmVm")
            .field("mem_base", &format_args!("{:#x}", self.mem_base))
            .field("mem_size", &format_args!("{:#x}", self.mem_size))
            .field("vcpus", &self.vcpus.len())
            .finish()
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    fn vm_or_skip(mem: u64, irqchip: bool) -> Option<KvmVm> {
        if !std::path::Path::new("/dev/kvm").exists() {
            return None;
        }
        let kvm = kvm_ioctls::Kvm::new().ok()?;
        KvmVm::new(
            &kvm,
            VmConfig {
                num_cpus: 1,
                mem_base: 0,
                mem_size: mem,
                irqchip,
            },
        )
        .ok()
    }

    #[test]
    fn test_guest_ram_roundtrip() {
        let Some(vm) = vm_or_skip(2 << 20, false) else {
            return;
        };
        vm.write_at(b"krypton", 0x1000).unwrap();
        let mut buf = [0u8; 7];
        vm.read_at(&mut buf, 0x1000).unwrap();
        assert_eq!(&buf, b"krypton");
    }

    #[test]
    fn test_out_of_range_access_rejected() {
        let Some(vm) = vm_or_skip(2 << 20, false) else {
            return;
        };
        assert!(matches!(
            vm.write_at(&[0u8; 16], (2 << 20) - 8),
            Err(HvError::MemoryRange { .. })
        ));
    }

    /// Load an assembled payload at `base`, applying its relocations.
    fn load_payload(vm: &KvmVm, program: &crate::asm::Assembled, base: u64) {
        let mut code = program.code.clone();
        for &off in &program.relocations {
            let at = off as usize;
            let mut slot = u64::from_le_bytes(code[at..at + 8].try_into().unwrap());
            slot = slot.wrapping_add(base);
            code[at..at + 8].copy_from_slice(&slot.to_le_bytes());
        }
        vm.write_at(&code, base).unwrap();
    }

    #[cfg(target_arch = "x86_64")]
    fn enter_bare_64bit(vm: &mut KvmVm, entry: u64, stack: u64) {
        use crate::ir::Reg;
        vm.with_vcpu(0, &mut |vcpu| {
            vcpu.set_long_mode_with_selectors(0x1000, 1, 0x10, 0x18)?;
            let mut regs = BTreeMap::new();
            regs.insert(Reg::Rip, entry);
            regs.insert(Reg::Rsp, stack);
            regs.insert(Reg::Rbp, stack);
            regs.insert(Reg::Rflags, 0x2);
            vcpu.set_registers(&regs)
        })
        .unwrap();
    }

    #[cfg(target_arch = "x86_64")]
    #[test]
    fn test_addition_program_halts_with_42() {
        use crate::ir::{self, OpKind, Reg};

        let Some(mut vm) = vm_or_skip(2 << 20, false) else {
            return;
        };

        let mut p = ir::Program::new("main");
        p.method(
            "main",
            vec![
                ir::assign(ir::reg(Reg::Rax), ir::int(40)),
                ir::op(OpKind::Add, "%rax", ir::reg(Reg::Rax), ir::int(2)),
                crate::ir::Fragment::Halt,
            ],
        );
        let compiled =
            crate::asm::build_standalone_program_for_arch(crate::ir::Arch::X86_64, &p).unwrap();

        load_payload(&vm, &compiled, 0x10000);
        enter_bare_64bit(&mut vm, 0x10000, 0x8000);

        let outcome = vm.run(&CancelToken::new()).unwrap();
        assert_eq!(outcome, RunOutcome::Halted);

        let mut regs = BTreeMap::new();
        regs.insert(Reg::Rax, 0u64);
        vm.with_vcpu(0, &mut |vcpu| vcpu.get_registers(&mut regs))
            .unwrap();
        assert_eq!(regs[&Reg::Rax], 42);
    }

    #[cfg(target_arch = "x86_64")]
    #[test]
    fn test_mmio_write_ring_hello_world() {
        use crate::hv::{MmioHandler, WriteOutcome};
        use crate::ir::{self, CmpKind, OpKind, Width};
        use std::sync::Mutex;

        let Some(mut vm) = vm_or_skip(2 << 20, false) else {
            return;
        };

        struct Collector(Arc<Mutex<Vec<u8>>>);
        impl MmioHandler for Collector {
            fn read(&mut self, _offset: u64, data: &mut [u8]) {
                data.fill(0);
            }
            fn write(&mut self, _offset: u64, data: &[u8]) -> WriteOutcome {
                if let Ok(mut bytes) = self.0.lock() {
                    bytes.extend_from_slice(data);
                }
                WriteOutcome::Continue
            }
        }
        let collected = Arc::new(Mutex::new(Vec::new()));
        vm.add_device(Device::Mmio {
            base: 0xdead_0000,
            size: 0x1000,
            handler: Box::new(Collector(collected.clone())),
        });

        let mut p = ir::Program::new("main");
        p.method(
            "main",
            vec![
                ir::load_constant_bytes(b"Hello, World!".to_vec(), true, "p", None),
                ir::assign(ir::var("mmio"), ir::int(0xdead_0000)),
                ir::declare_label(
                    "next",
                    vec![
                        ir::assign(ir::var("b"), ir::mem("p", 0, Width::W8)),
                        ir::if_then(
                            ir::cmp(CmpKind::Equal, ir::var("b"), ir::int(0)),
                            vec![ir::goto("done")],
                        ),
                        ir::assign(ir::mem("mmio", 0, Width::W8), ir::var("b")),
                        ir::op(OpKind::Add, "p", ir::var("p"), ir::int(1)),
                        ir::goto("next"),
                    ],
                ),
                ir::declare_label("done", vec![crate::ir::Fragment::Halt]),
            ],
        );
        let compiled =
            crate::asm::build_standalone_program_for_arch(crate::ir::Arch::X86_64, &p).unwrap();
        assert!(!compiled.relocations.is_empty());

        load_payload(&vm, &compiled, 0x10000);
        enter_bare_64bit(&mut vm, 0x10000, 0x8000);

        let outcome = vm.run(&CancelToken::new()).unwrap();
        assert_eq!(outcome, RunOutcome::Halted);
        assert_eq!(collected.lock().unwrap().as_slice(), b"Hello, World!");
    }

    #[cfg(target_arch = "x86_64")]
    #[test]
    fn test_infinite_loop_canceled_within_deadline() {
        use crate::ir;
        use std::time::{Duration, Instant};

        let Some(mut vm) = vm_or_skip(2 << 20, false) else {
            return;
        };

        let mut p = ir::Program::new("main");
        p.method(
            "main",
            vec![ir::declare_label("spin", vec![ir::goto("spin")])],
        );
        let compiled =
            crate::asm::build_standalone_program_for_arch(crate::ir::Arch::X86_64, &p).unwrap();

        load_payload(&vm, &compiled, 0x10000);
        enter_bare_64bit(&mut vm, 0x10000, 0x8000);

        let cancel = CancelToken::new();
        cancel.cancel_after(Duration::from_millis(100));
        let started = Instant::now();
        let outcome = vm.run(&cancel).unwrap();
        assert_eq!(outcome, RunOutcome::Canceled);
        // The kick must unblock well before a scheduler-quantum pileup.
        assert!(started.elapsed() < Duration::from_secs(5));
    }

    #[cfg(target_arch = "aarch64")]
    #[test]
    fn test_psci_system_off_halts() {
        use crate::ir::{self, Reg};

        let Some(mut vm) = vm_or_skip(2 << 20, false) else {
            return;
        };

        let mut p = ir::Program::new("main");
        p.method("main", vec![crate::ir::Fragment::Halt]);
        let compiled =
            crate::asm::build_standalone_program_for_arch(crate::ir::Arch::Aarch64, &p).unwrap();

        load_payload(&vm, &compiled, 0x10000);
        vm.with_vcpu(0, &mut |vcpu| {
            let mut regs = BTreeMap::new();
            regs.insert(Reg::Pc, 0x10000u64);
            regs.insert(Reg::Sp, 0x8000u64);
            vcpu.set_registers(&regs)
        })
        .unwrap();

        let outcome = vm.run(&CancelToken::new()).unwrap();
        assert_eq!(outcome, RunOutcome::Halted);
    }

    #[test]
    fn test_snapshot_roundtrip_memory() {
        let Some(mut vm) = vm_or_skip(2 << 20, false) else {
            return;
        };
        vm.write_at(b"state", 0x2000).unwrap();
        let snap = vm.capture_snapshot().unwrap();
        vm.write_at(b"xxxxx", 0x2000).unwrap();
        vm.restore_snapshot(&snap).unwrap();
        let mut buf = [0u8; 5];
        vm.read_at(&mut buf, 0x2000).unwrap();
        assert_eq!(&buf, b"state");
        // Same-backend check is enforced.
        let mut foreign = snap.clone();
        foreign.backend = "hvf".to_string();
        assert!(matches!(
            vm.restore_snapshot(&foreign),
            Err(HvError::SnapshotBackendMismatch { .. })
        ));
    }
}
