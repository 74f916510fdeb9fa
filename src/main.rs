//! Krypton - a programmable microVM runtime.
//!
//! The CLI is a thin demonstration of the embedding API: boot a kernel
//! with the generated init payload, compile a small IR program on the
//! host, execute it inside the guest over vsock, and print what came
//! back. Repeated `--runs` exercise the one-boot-many-payloads design.
//!
//! This runtime requires hardware virtualization (KVM on Linux).

use clap::Parser;
use std::process::ExitCode;

#[derive(Parser, Debug)]
#[command(name = "krypton")]
#[command(about = "Run compiled IR payloads inside a hardware-virtualized guest")]
struct Args {
    /// Path to the Linux kernel (bzImage or ELF vmlinux)
    #[arg(short, long)]
    kernel: String,

    /// Extra kernel command line arguments
    #[arg(short, long, default_value = "")]
    cmdline: String,

    /// Memory size in megabytes
    #[arg(short, long, default_value = "512")]
    memory: u64,

    /// How many times to execute the demo payload
    #[arg(short, long, default_value = "1")]
    runs: u32,
}

fn main() -> ExitCode {
    let args = Args::parse();

    if let Err(e) = run(args) {
        eprintln!("Error: {e}");
        return ExitCode::FAILURE;
    }

    ExitCode::SUCCESS
}

#[cfg(target_os = "linux")]
fn run(args: Args) -> Result<(), Box<dyn std::error::Error>> {
    use krypton::asm;
    use krypton::hv::Hypervisor as _;
    use krypton::ir::{self, OpKind, Sys};
    use krypton::loader::session::{SessionConfig, VmSession};
    use krypton::loader::RunOptions;

    eprintln!("[VMM] krypton starting...");
    eprintln!("[VMM] kernel: {}", args.kernel);
    eprintln!("[VMM] memory: {} MB", args.memory);

    let hv = krypton::hv::probe()?;
    eprintln!(
        "[VMM] hypervisor: {} ({})",
        hv.name(),
        hv.architecture()
    );

    let kernel = std::fs::read(&args.kernel)?;

    // The demo payload: prove arithmetic, embedded constants, and the
    // capture path in one go.
    let mut program = ir::Program::new("main");
    program.method(
        "main",
        vec![
            ir::load_constant_bytes(b"Hello from the guest\n".to_vec(), false, "msg", Some("len")),
            ir::syscall(Sys::Write, vec![ir::int(1), ir::var("msg"), ir::var("len")]),
            ir::assign(ir::var("a"), ir::int(40)),
            ir::op(OpKind::Add, "a", ir::var("a"), ir::int(2)),
            ir::ret(ir::var("a")),
        ],
    );
    let compiled = asm::build_standalone_program_for_arch(ir::Arch::host(), &program)?;
    eprintln!(
        "[VMM] payload compiled: {} bytes, {} relocation(s)",
        compiled.code.len(),
        compiled.relocations.len()
    );

    let mut session = VmSession::boot(
        &kernel,
        &SessionConfig {
            mem_size: args.memory << 20,
            extra_cmdline: args.cmdline.clone(),
            console_stdout: true,
        },
    )?;

    for n in 0..args.runs {
        let result = session.run_program(&compiled, &RunOptions::captured())?;
        eprintln!(
            "[VMM] run {}: exit={} stdout={} bytes stderr={} bytes",
            n + 1,
            result.exit_code,
            result.stdout.len(),
            result.stderr.len()
        );
        print!("{}", String::from_utf8_lossy(&result.stdout));
    }

    let outcome = session.close()?;
    eprintln!("[VMM] session closed: {outcome:?}");
    Ok(())
}

#[cfg(not(target_os = "linux"))]
fn run(_args: Args) -> Result<(), Box<dyn std::error::Error>> {
    Err("the krypton CLI currently drives the KVM backend and requires Linux".into())
}
