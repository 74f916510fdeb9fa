//! Booted-VM session: spawn, connect, execute payloads.
//!
//! A [`VmSession`] owns one KVM virtual machine booted with a Linux
//! kernel whose initramfs carries the generated init payload. The vCPU
//! loop runs on its own thread; the session thread drives the vsock
//! connection the init opened at boot and executes payloads
//! request/response style. One boot serves many payloads.
//!
//! ```text
//! boot():  kernel + init(initramfs) → vCPU thread → accept() ── session
//! run_program():  frame → vsock → guest loads/executes → response
//! close(): cancel vCPU, shut the vsock core, join
//! ```

use crate::asm::{self, Assembled};
use crate::boot::{self, BootConfig, KernelImage};
use crate::devices::virtio::vsock::{self, VsockHost, VsockStream};
use crate::devices::{Serial, TracePage, SERIAL_COM1_BASE, SERIAL_COM1_SIZE, TIMESLICE_MMIO_PHYS_ADDR};
use crate::guest::{build_init, InitConfig};
use crate::hv::{kvm, CancelToken, Device, HvError, RunOutcome, Vm, VmConfig};
use crate::ir::Arch;
use crate::loader::cpio::{self, CpioEntry};
use crate::loader::protocol::{self, ProtocolError, RunOptions, RunResult};
use std::thread::JoinHandle;
use std::time::{Duration, SystemTime, UNIX_EPOCH};
use thiserror::Error;

/// Guest-physical address of the vsock virtio-mmio window.
pub const VSOCK_MMIO_BASE: u64 = 0xd000_0000;
pub const VSOCK_MMIO_SIZE: u64 = 0x1000;

/// GSI routed through the IOAPIC for the vsock device.
pub const VSOCK_IRQ: u32 = 5;

/// How long to wait for the guest init to connect after boot.
const CONNECT_TIMEOUT: Duration = Duration::from_secs(60);

/// Errors from session setup and teardown.
#[derive(Debug, Error)]
pub enum SessionError {
    #[error(transparent)]
    Hv(#[from] HvError),

    #[error("kvm: {0}")]
    Kvm(#[from] kvm::KvmError),

    #[error(transparent)]
    Boot(#[from] boot::BootError),

    #[error(transparent)]
    Asm(#[from] asm::AsmError),

    #[error(transparent)]
    Protocol(#[from] ProtocolError),

    #[error("guest init never connected: {0}")]
    Connect(#[source] std::io::Error),

    #[error("Linux boot sessions require an x86-64 host")]
    UnsupportedArch,
}

/// A booted VM with a live payload-execution channel.
pub struct VmSession {
    stream: VsockStream,
    host: VsockHost,
    cancel: CancelToken,
    vcpu_thread: Option<JoinHandle<Result<RunOutcome, HvError>>>,
}

/// Session configuration beyond the kernel image itself.
pub struct SessionConfig {
    pub mem_size: u64,
    pub extra_cmdline: String,
    /// Route guest console bytes to host stdout.
    pub console_stdout: bool,
}

impl Default for SessionConfig {
    fn default() -> Self {
        SessionConfig {
            mem_size: 512 << 20,
            extra_cmdline: String::new(),
            console_stdout: true,
        }
    }
}

impl VmSession {
    /// Boot `kernel` with the generated init payload and wait for its
    /// vsock connection.
    pub fn boot(kernel: &[u8], config: &SessionConfig) -> Result<VmSession, SessionError> {
        if Arch::host() != Arch::X86_64 {
            // The boot helper implements the x86 boot protocol; bare
            // programs still run on other hosts through `hv` directly.
            return Err(SessionError::UnsupportedArch);
        }
        let arch = Arch::host();

        let hv = kvm::open()?;
        let mut vm = hv.create_kvm_vm(VmConfig {
            num_cpus: 1,
            mem_base: 0,
            mem_size: config.mem_size,
            irqchip: true,
        })?;

        // Compile the init payload and pack it as the initramfs /init.
        let init_program = build_init(&InitConfig::new(arch));
        let assembled = asm::build_standalone_program_for_arch(arch, &init_program)?;
        let init_elf = asm::elf::standalone_elf(&assembled);
        let initramfs = cpio::build(&[CpioEntry {
            name: "init",
            mode: cpio::MODE_EXEC,
            data: &init_elf,
        }]);
        eprintln!(
            "[VMM] init payload: {} bytes of code, {} byte initramfs",
            assembled.code.len(),
            initramfs.len()
        );

        let cmdline = format!(
            "console=ttyS0 reboot=t panic=-1 rdinit=/init \
             virtio_mmio.device=4K@{VSOCK_MMIO_BASE:#x}:{VSOCK_IRQ} {}",
            config.extra_cmdline
        );
        let layout = boot::setup_boot(
            vm.guest_memory(),
            KernelImage::detect(kernel)?,
            &BootConfig {
                cmdline: cmdline.trim_end().to_string(),
                initramfs: Some(initramfs),
                e820: None,
            },
        )?;

        #[cfg(target_arch = "x86_64")]
        vm.set_boot_msrs(0)?;
        vm.with_vcpu(0, &mut |vcpu| boot::configure_vcpu(vcpu, &layout))?;

        // Devices: console, trace page, vsock.
        let serial = if config.console_stdout {
            Serial::new()
        } else {
            Serial::buffered()
        };
        vm.add_device(Device::PortIo {
            base: SERIAL_COM1_BASE,
            size: SERIAL_COM1_SIZE,
            handler: Box::new(serial),
        });
        vm.add_device(Device::Mmio {
            base: TIMESLICE_MMIO_PHYS_ADDR,
            size: 0x1000,
            handler: Box::new(TracePage::new()),
        });

        let irq = vm.irq_line(VSOCK_IRQ)?;
        let (vsock_dev, host) =
            vsock::vsock_pair(vm.guest_memory().clone(), irq, vsock::GUEST_CID);
        vm.add_device(Device::Mmio {
            base: VSOCK_MMIO_BASE,
            size: VSOCK_MMIO_SIZE,
            handler: Box::new(vsock_dev),
        });

        host.listen(protocol::VSOCK_PORT);

        let cancel = CancelToken::new();
        let run_cancel = cancel.clone();
        let run_host = host.clone();
        let vcpu_thread = std::thread::spawn(move || {
            let outcome = vm.run(&run_cancel);
            eprintln!("[VMM] vCPU loop ended: {outcome:?}");
            // Whatever ended the guest, unblock anyone on the channel.
            run_host.shutdown();
            outcome
        });

        let stream = host
            .accept_timeout(protocol::VSOCK_PORT, CONNECT_TIMEOUT)
            .map_err(SessionError::Connect)?;
        eprintln!("[VMM] guest init connected");

        Ok(VmSession {
            stream,
            host,
            cancel,
            vcpu_thread: Some(vcpu_thread),
        })
    }

    /// Execute one compiled payload in the guest.
    pub fn run_program(
        &mut self,
        program: &Assembled,
        opts: &RunOptions,
    ) -> Result<RunResult, ProtocolError> {
        let now = SystemTime::now()
            .duration_since(UNIX_EPOCH)
            .unwrap_or_default();
        let clock = (now.as_secs() as i64, now.subsec_nanos() as i64);
        protocol::write_request(&mut self.stream, program, clock, opts)?;
        protocol::read_response(&mut self.stream, opts)
    }

    /// Tear the VM down: cancel the vCPU loop, close the channel, join.
    pub fn close(mut self) -> Result<RunOutcome, HvError> {
        self.shutdown_threads()
    }

    fn shutdown_threads(&mut self) -> Result<RunOutcome, HvError> {
        self.cancel.cancel();
        self.host.shutdown();
        match self.vcpu_thread.take() {
            Some(handle) => match handle.join() {
                Ok(outcome) => outcome,
                Err(_) => Err(HvError::Backend {
                    backend: "kvm",
                    op: "join vcpu thread",
                    detail: "vCPU thread panicked".to_string(),
                }),
            },
            None => Ok(RunOutcome::Canceled),
        }
    }
}

impl Drop for VmSession {
    fn drop(&mut self) {
        if self.vcpu_thread.is_some() {
            let _ = self.shutdown_threads();
        }
    }
}
