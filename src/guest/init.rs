//! The init program, fragment by fragment.
//!
//! Built entirely from the IR surface this crate compiles, which makes
//! the init both the first production payload and the heaviest test of
//! the lowering passes: stack slots for syscall structs, forked children
//! sharing the code image, indirect calls into the arena, and the full
//! portable-syscall table.
//!
//! Method map:
//!
//! - `main`        — boot pipeline + command loop, never returns
//! - `recv_exact`  — read exactly N bytes from a fd
//! - `send_exact`  — write exactly N bytes to a fd
//! - `die`         — console diagnostic, then the per-arch reboot syscall
//!
//! Helper calling convention: arguments in the target's first three
//! syscall-argument registers, result in the return register. Helpers
//! copy their arguments into ordinary variables before the first syscall
//! clobbers anything.

use super::InitConfig;
use crate::ir::syscall::reboot;
use crate::ir::{
    self, assign, cmp, declare_label, goto, if_else, if_then, int, op, reg, slot_at, slot_ptr_at,
    str_lit, syscall, syscall_ret, var, with_stack_slot, Arch, CmpKind, Fragment, OpKind, Program,
    Reg, Sys, Test, Value, Width,
};

// Linux ABI constants shared by both architectures (asm-generic values).
const AT_FDCWD: i64 = -100;
const O_RDWR: i64 = 2;
const SIGCHLD: i64 = 17;
const F_SETFL: i64 = 4;
const F_DUPFD_CLOEXEC: i64 = 1030;
const O_NONBLOCK: i64 = 0x800;
const PROT_RW: i64 = 3;
const PROT_RWX: i64 = 7;
const MAP_SHARED: i64 = 0x01;
const MAP_PRIVATE_ANON: i64 = 0x22;
const AF_VSOCK: i64 = 40;
const SOCK_STREAM: i64 = 1;
const VMADDR_CID_HOST: i64 = 2;
const TIOCSCTTY: i64 = 0x540e;
const S_IFCHR: i64 = 0o020000;
const CLOCK_REALTIME: i64 = 0;

/// Character device numbers in the kernel's old encoding.
const DEV_MEM: i64 = 0x101; // (1,1)
const DEV_CONSOLE: i64 = 0x501; // (5,1)

// Capture scratch mapping layout: one anonymous RW mapping partitioned
// into capture buffers, the relocation table, the stdin staging area,
// and an overflow sink for truncated output.
const SCRATCH_SIZE: i64 = 48 << 20;
const STDOUT_CAP: i64 = 0;
const STDERR_CAP: i64 = 16 << 20;
const RELOC_TAB: i64 = 32 << 20;
const RELOC_TAB_SIZE: i64 = 4 << 20;
const STDIN_BUF: i64 = 36 << 20;
const STDIN_MAX: i64 = 4 << 20;
const DISCARD: i64 = 40 << 20;

/// Keep one read() of headroom below the cap so a final chunk cannot
/// overrun the capture region.
const CAP_SAFE: i64 = super::CAPTURE_LIMIT - READ_CHUNK;
const READ_CHUNK: i64 = 65536;

// Request flag bits, mirroring the host protocol.
const FLAG_STDOUT: i64 = 1;
const FLAG_STDERR: i64 = 2;
const FLAG_COMBINE: i64 = 4;
const FLAG_STDIN: i64 = 8;

// Offsets into the one 160-byte stack slot `b` the main loop works from.
const B_ADDR: i32 = 0; // sockaddr_vm, 16 bytes
const B_TS: i32 = 16; // timespec, 16 bytes
const B_HDR: i32 = 32; // request header staging, 40 bytes
const B_FDS: i32 = 72; // pipe fd pairs, 32 bytes
const B_RESP: i32 = 120; // response header staging, 12 bytes

/// Build the init payload program for `config`.
pub fn build_init(config: &InitConfig) -> Program {
    let arch = config.arch;
    let mut program = Program::new("main");
    program.method("main", build_main(config));
    program.method("recv_exact", build_pump(arch, Sys::Read));
    program.method("send_exact", build_pump(arch, Sys::Write));
    program.method("die", build_die(arch));
    program
}

fn arg_regs(arch: Arch) -> [Reg; 3] {
    match arch {
        Arch::X86_64 => [Reg::Rdi, Reg::Rsi, Reg::Rdx],
        Arch::Aarch64 => [Reg::X0, Reg::X1, Reg::X2],
    }
}

fn ret_reg(arch: Arch) -> Reg {
    match arch {
        Arch::X86_64 => Reg::Rax,
        Arch::Aarch64 => Reg::X0,
    }
}

/// `recv_exact` / `send_exact`: pump exactly `len` bytes through a fd.
/// Returns 0 on success, -1 on error or EOF.
fn build_pump(arch: Arch, direction: Sys) -> Vec<Fragment> {
    let [a0, a1, a2] = arg_regs(arch);
    vec![
        assign(var("fd"), reg(a0)),
        assign(var("p"), reg(a1)),
        assign(var("n"), reg(a2)),
        declare_label(
            "pump",
            vec![
                if_then(Test::IsZero(var("n")), vec![ir::ret(int(0))]),
                syscall_ret(direction, vec![var("fd"), var("p"), var("n")], "step"),
                if_then(
                    cmp(CmpKind::LessOrEqual, var("step"), int(0)),
                    vec![ir::ret(int(-1))],
                ),
                op(OpKind::Add, "p", var("p"), var("step")),
                op(OpKind::Sub, "n", var("n"), var("step")),
                goto("pump"),
            ],
        ),
    ]
}

/// Terminal error path: console diagnostic, then the reboot syscall the
/// host observes as a VM halt (RESTART on x86-64, POWER_OFF on AArch64).
fn build_die(arch: Arch) -> Vec<Fragment> {
    vec![
        ir::printf("init: fatal error, rebooting\n", vec![]),
        syscall(
            Sys::Reboot,
            vec![
                int(reboot::MAGIC1 as i64),
                int(reboot::MAGIC2 as i64),
                int(reboot::terminal_cmd(arch) as i64),
                int(0),
            ],
        ),
        // Reboot does not return; if it somehow fails, spin rather than
        // fall off the end of init.
        declare_label("halted", vec![goto("halted")]),
    ]
}

fn build_main(config: &InitConfig) -> Vec<Fragment> {
    let arch = config.arch;
    let [a0, a1, a2] = arg_regs(arch);
    let rr = ret_reg(arch);

    // Call a 3-argument helper method.
    let call3 = move |name: &str, f: Value, p: Value, l: Value| -> Vec<Fragment> {
        vec![
            assign(reg(a0), f),
            assign(reg(a1), p),
            assign(reg(a2), l),
            Fragment::CallMethod {
                name: name.to_string(),
            },
            assign(var("rc"), reg(rr)),
        ]
    };
    let die = || Fragment::CallMethod {
        name: "die".to_string(),
    };
    // Helper call that reboots on failure.
    let pump_or_die = move |name: &str, f: Value, p: Value, l: Value| -> Vec<Fragment> {
        let mut v = call3(name, f, p, l);
        v.push(if_then(Test::IsNegative(var("rc")), vec![die()]));
        v
    };

    let mut body: Vec<Fragment> = Vec::new();

    // ------------------------------------------------------------------
    // Filesystem bring-up. All best effort: devtmpfs usually exists and
    // already carries console/mem nodes, the mknodat calls only matter
    // when it does not.
    // ------------------------------------------------------------------
    body.push(syscall(
        Sys::Mkdirat,
        vec![int(AT_FDCWD), str_lit("/dev"), int(0o755)],
    ));
    body.push(syscall(
        Sys::Mount,
        vec![
            str_lit("devtmpfs"),
            str_lit("/dev"),
            str_lit("devtmpfs"),
            int(0),
            int(0),
        ],
    ));
    body.push(syscall(
        Sys::Mkdirat,
        vec![int(AT_FDCWD), str_lit("/proc"), int(0o555)],
    ));
    body.push(syscall(
        Sys::Mount,
        vec![
            str_lit("proc"),
            str_lit("/proc"),
            str_lit("proc"),
            int(0),
            int(0),
        ],
    ));
    body.push(syscall(
        Sys::Mkdirat,
        vec![int(AT_FDCWD), str_lit("/dev/shm"), int(0o1777)],
    ));
    body.push(syscall(
        Sys::Mount,
        vec![
            str_lit("tmpfs"),
            str_lit("/dev/shm"),
            str_lit("tmpfs"),
            int(0),
            int(0),
        ],
    ));
    for (target, link) in [
        ("/proc/self/fd/0", "/dev/stdin"),
        ("/proc/self/fd/1", "/dev/stdout"),
        ("/proc/self/fd/2", "/dev/stderr"),
    ] {
        body.push(syscall(
            Sys::Symlinkat,
            vec![str_lit(target), int(AT_FDCWD), str_lit(link)],
        ));
    }
    body.push(syscall(
        Sys::Mknodat,
        vec![
            int(AT_FDCWD),
            str_lit("/dev/console"),
            int(S_IFCHR | 0o600),
            int(DEV_CONSOLE),
        ],
    ));
    body.push(syscall(
        Sys::Mknodat,
        vec![
            int(AT_FDCWD),
            str_lit("/dev/mem"),
            int(S_IFCHR | 0o600),
            int(DEV_MEM),
        ],
    ));

    // ------------------------------------------------------------------
    // Console: open, become session leader, take the controlling TTY,
    // wire fds 0/1/2.
    // ------------------------------------------------------------------
    body.push(syscall_ret(
        Sys::Openat,
        vec![int(AT_FDCWD), str_lit("/dev/console"), int(O_RDWR), int(0)],
        "console",
    ));
    body.push(if_then(Test::IsNegative(var("console")), vec![die()]));
    body.push(syscall(Sys::Setsid, vec![]));
    body.push(syscall(
        Sys::Ioctl,
        vec![var("console"), int(TIOCSCTTY), int(0)],
    ));
    for fd in 0..3 {
        // dup3 refuses oldfd == newfd; when the kernel already handed us
        // the console on this fd the refusal is exactly right.
        body.push(syscall(Sys::Dup3, vec![var("console"), int(fd), int(0)]));
    }
    body.push(if_then(
        cmp(CmpKind::Greater, var("console"), int(2)),
        vec![syscall(Sys::Close, vec![var("console")])],
    ));
    body.push(ir::printf("init: console up\n", vec![]));

    // ------------------------------------------------------------------
    // Mappings: optional timeslice trace page from /dev/mem, the
    // executable payload arena, and the capture scratch area.
    // ------------------------------------------------------------------
    body.push(assign(var("tspage"), int(0)));
    if let Some(ts_phys) = config.timeslice_mmio {
        body.push(syscall_ret(
            Sys::Openat,
            vec![int(AT_FDCWD), str_lit("/dev/mem"), int(O_RDWR), int(0)],
            "memfd",
        ));
        body.push(if_then(
            cmp(CmpKind::GreaterOrEqual, var("memfd"), int(0)),
            vec![
                syscall_ret(
                    Sys::Mmap,
                    vec![
                        int(0),
                        int(4096),
                        int(PROT_RW),
                        int(MAP_SHARED),
                        var("memfd"),
                        int(ts_phys as i64),
                    ],
                    "tspage",
                ),
                if_then(
                    Test::IsNegative(var("tspage")),
                    vec![assign(var("tspage"), int(0))],
                ),
                syscall(Sys::Close, vec![var("memfd")]),
            ],
        ));
    }

    body.push(syscall_ret(
        Sys::Mmap,
        vec![
            int(0),
            int(super::ARENA_SIZE),
            int(PROT_RWX),
            int(MAP_PRIVATE_ANON),
            int(-1),
            int(0),
        ],
        "arena",
    ));
    body.push(if_then(Test::IsNegative(var("arena")), vec![die()]));

    body.push(syscall_ret(
        Sys::Mmap,
        vec![
            int(0),
            int(SCRATCH_SIZE),
            int(PROT_RW),
            int(MAP_PRIVATE_ANON),
            int(-1),
            int(0),
        ],
        "scratch",
    ));
    body.push(if_then(Test::IsNegative(var("scratch")), vec![die()]));

    // ------------------------------------------------------------------
    // Vsock: connect to the host, retrying while the driver settles.
    // ------------------------------------------------------------------
    body.push(syscall_ret(
        Sys::Socket,
        vec![int(AF_VSOCK), int(SOCK_STREAM), int(0)],
        "sock",
    ));
    body.push(if_then(Test::IsNegative(var("sock")), vec![die()]));

    let mut in_slot: Vec<Fragment> = Vec::new();

    // struct sockaddr_vm { u16 family; u16 reserved; u32 port; u32 cid; u8 zero[4]; }
    in_slot.push(assign(slot_at("b", B_ADDR, Width::W16), int(AF_VSOCK)));
    in_slot.push(assign(slot_at("b", B_ADDR + 2, Width::W16), int(0)));
    in_slot.push(assign(
        slot_at("b", B_ADDR + 4, Width::W32),
        int(config.vsock_port as i64),
    ));
    in_slot.push(assign(
        slot_at("b", B_ADDR + 8, Width::W32),
        int(VMADDR_CID_HOST),
    ));
    in_slot.push(assign(slot_at("b", B_ADDR + 12, Width::W32), int(0)));
    in_slot.push(declare_label(
        "connect_retry",
        vec![
            syscall_ret(
                Sys::Connect,
                vec![var("sock"), slot_ptr_at("b", B_ADDR), int(16)],
                "rc",
            ),
            if_then(
                Test::IsNegative(var("rc")),
                vec![
                    // 50ms, then try again; the host waits on accept().
                    assign(slot_at("b", B_TS, Width::W64), int(0)),
                    assign(slot_at("b", B_TS + 8, Width::W64), int(50_000_000)),
                    syscall(Sys::Nanosleep, vec![slot_ptr_at("b", B_TS), int(0)]),
                    goto("connect_retry"),
                ],
            ),
        ],
    ));
    in_slot.push(ir::printf("init: vsock connected\n", vec![]));
    in_slot.extend(mark_timeslice(1));

    in_slot.push(declare_label(
        "cmd_loop",
        build_command_loop(config, &call3, &pump_or_die, &die),
    ));

    body.push(with_stack_slot("b", 160, in_slot));
    // Unreachable: the command loop never exits.
    body.push(ir::ret(int(0)));
    body
}

/// Progress marker into the timeslice page, when mapped.
fn mark_timeslice(stage: i64) -> Vec<Fragment> {
    vec![if_then(
        cmp(CmpKind::NotEqual, var("tspage"), int(0)),
        vec![assign(ir::mem("tspage", 0, Width::W8), int(stage))],
    )]
}

fn build_command_loop(
    config: &InitConfig,
    call3: &dyn Fn(&str, Value, Value, Value) -> Vec<Fragment>,
    pump_or_die: &dyn Fn(&str, Value, Value, Value) -> Vec<Fragment>,
    die: &dyn Fn() -> Fragment,
) -> Vec<Fragment> {
    let arch = config.arch;
    let rr = ret_reg(arch);
    let mut l: Vec<Fragment> = Vec::new();

    // Header: payload_len (ignored; the field counts are authoritative),
    // then the 32-byte fixed part.
    l.extend(pump_or_die(
        "recv_exact",
        var("sock"),
        slot_ptr_at("b", B_HDR),
        int(4),
    ));
    l.extend(pump_or_die(
        "recv_exact",
        var("sock"),
        slot_ptr_at("b", B_HDR + 8),
        int(32),
    ));

    // Best-effort clock sync from the header's time fields.
    l.push(assign(
        slot_at("b", B_TS, Width::W64),
        slot_at("b", B_HDR + 8, Width::W64),
    ));
    l.push(assign(
        slot_at("b", B_TS + 8, Width::W64),
        slot_at("b", B_HDR + 16, Width::W64),
    ));
    l.push(syscall(
        Sys::ClockSettime,
        vec![int(CLOCK_REALTIME), slot_ptr_at("b", B_TS)],
    ));

    l.push(assign(var("flags"), slot_at("b", B_HDR + 24, Width::W32)));
    l.push(assign(var("stdin_n"), slot_at("b", B_HDR + 28, Width::W32)));
    l.push(assign(var("code_n"), slot_at("b", B_HDR + 32, Width::W32)));
    l.push(assign(var("reloc_n"), slot_at("b", B_HDR + 36, Width::W32)));

    // Size sanity; violations are protocol corruption and reboot.
    l.push(if_then(
        cmp(CmpKind::Greater, var("code_n"), int(super::ARENA_SIZE)),
        vec![die()],
    ));
    l.push(op(OpKind::Mul, "reloc_bytes", var("reloc_n"), int(4)));
    l.push(if_then(
        cmp(CmpKind::Greater, var("reloc_bytes"), int(RELOC_TAB_SIZE)),
        vec![die()],
    ));
    l.push(if_then(
        cmp(CmpKind::Greater, var("stdin_n"), int(STDIN_MAX)),
        vec![die()],
    ));

    // Relocation table, code, stdin.
    l.push(op(OpKind::Add, "relocs", var("scratch"), int(RELOC_TAB)));
    l.extend(pump_or_die(
        "recv_exact",
        var("sock"),
        var("relocs"),
        var("reloc_bytes"),
    ));
    l.extend(pump_or_die(
        "recv_exact",
        var("sock"),
        var("arena"),
        var("code_n"),
    ));
    l.push(op(OpKind::Add, "stdin_buf", var("scratch"), int(STDIN_BUF)));
    l.extend(if_flag(
        FLAG_STDIN,
        pump_or_die("recv_exact", var("sock"), var("stdin_buf"), var("stdin_n")),
    ));

    // Apply relocations: each listed offset holds an image-relative
    // value; add the arena base.
    l.push(assign(var("i"), int(0)));
    l.push(declare_label(
        "reloc_loop",
        vec![if_then(
            cmp(CmpKind::Less, var("i"), var("reloc_n")),
            vec![
                op(OpKind::Mul, "tmp", var("i"), int(4)),
                op(OpKind::Add, "tmp", var("relocs"), var("tmp")),
                assign(var("slot_off"), ir::mem("tmp", 0, Width::W32)),
                op(OpKind::Add, "slot_addr", var("arena"), var("slot_off")),
                assign(var("tmp"), ir::mem("slot_addr", 0, Width::W64)),
                op(OpKind::Add, "tmp", var("tmp"), var("arena")),
                assign(ir::mem("slot_addr", 0, Width::W64), var("tmp")),
                op(OpKind::Add, "i", var("i"), int(1)),
                goto("reloc_loop"),
            ],
        )],
    ));

    l.push(Fragment::FlushICache {
        ptr: var("arena"),
        len: var("code_n"),
    });
    l.extend(mark_timeslice(2));

    // ------------------------------------------------------------------
    // Stdin writer child.
    // ------------------------------------------------------------------
    l.push(assign(var("saved0"), int(-1)));
    l.push(assign(var("stdin_pid"), int(-1)));
    l.extend(if_flag(FLAG_STDIN, {
        let mut f = vec![
            syscall_ret(
                Sys::Pipe2,
                vec![slot_ptr_at("b", B_FDS), int(0)],
                "rc",
            ),
            if_then(Test::IsNegative(var("rc")), vec![die()]),
            assign(var("in_r"), slot_at("b", B_FDS, Width::W32)),
            assign(var("in_w"), slot_at("b", B_FDS + 4, Width::W32)),
            syscall_ret(
                Sys::Fcntl,
                vec![int(0), int(F_DUPFD_CLOEXEC), int(100)],
                "saved0",
            ),
            syscall_ret(
                Sys::Clone,
                vec![int(SIGCHLD), int(0), int(0), int(0), int(0)],
                "stdin_pid",
            ),
        ];
        // Child: drain the staged stdin bytes into the pipe and exit.
        // If the payload never reads them, the parent's later fd-0
        // restore drops the read end and the write fails the child out.
        let mut child = vec![syscall(Sys::Close, vec![var("in_r")])];
        child.extend(call3("send_exact", var("in_w"), var("stdin_buf"), var("stdin_n")));
        child.push(syscall(Sys::Close, vec![var("in_w")]));
        child.push(syscall(Sys::Exit, vec![int(0)]));
        f.push(if_then(cmp(CmpKind::Equal, var("stdin_pid"), int(0)), child));
        // Parent: payload reads fd 0 from the pipe.
        f.push(syscall(Sys::Dup3, vec![var("in_r"), int(0), int(0)]));
        f.push(syscall(Sys::Close, vec![var("in_r")]));
        f.push(syscall(Sys::Close, vec![var("in_w")]));
        f
    }));

    // ------------------------------------------------------------------
    // Capture reader child.
    // ------------------------------------------------------------------
    l.push(op(
        OpKind::And,
        "captures",
        var("flags"),
        int(FLAG_STDOUT | FLAG_STDERR | FLAG_COMBINE),
    ));
    l.push(assign(var("saved1"), int(-1)));
    l.push(assign(var("saved2"), int(-1)));
    l.push(assign(var("reader_pid"), int(-1)));

    // Separate-stderr mode: stderr requested and not combined.
    l.push(assign(var("sep"), int(0)));
    l.extend(if_flag(
        FLAG_STDERR,
        if_not_flag(FLAG_COMBINE, vec![assign(var("sep"), int(1))]),
    ));

    l.push(if_then(
        cmp(CmpKind::NotEqual, var("captures"), int(0)),
        build_capture_setup(config, call3, die),
    ));

    // ------------------------------------------------------------------
    // Run the payload and restore the world.
    // ------------------------------------------------------------------
    l.extend(mark_timeslice(3));
    l.push(Fragment::Call {
        target: var("arena"),
    });
    l.push(assign(var("exit_code"), reg(rr)));
    l.extend(mark_timeslice(4));

    l.push(if_then(
        cmp(CmpKind::GreaterOrEqual, var("saved0"), int(0)),
        vec![
            syscall(Sys::Dup3, vec![var("saved0"), int(0), int(0)]),
            syscall(Sys::Close, vec![var("saved0")]),
            syscall(
                Sys::Wait4,
                vec![var("stdin_pid"), int(0), int(0), int(0)],
            ),
        ],
    ));

    l.push(if_then(cmp(CmpKind::NotEqual, var("captures"), int(0)), {
        let mut f = vec![
            // Restoring fds 1/2 closes the pipe write ends, which is
            // what moves the reader child toward EOF.
            syscall(Sys::Dup3, vec![var("saved1"), int(1), int(0)]),
            syscall(Sys::Close, vec![var("saved1")]),
            syscall(Sys::Dup3, vec![var("saved2"), int(2), int(0)]),
            syscall(Sys::Close, vec![var("saved2")]),
        ];
        // Collect the captured streams over the return pipe.
        f.extend(call3(
            "recv_exact",
            var("ret_r"),
            slot_ptr_at("b", B_RESP),
            int(4),
        ));
        f.push(if_then(Test::IsNegative(var("rc")), vec![die()]));
        f.push(assign(var("out_n"), slot_at("b", B_RESP, Width::W32)));
        f.push(op(OpKind::Add, "tmp", var("scratch"), int(STDOUT_CAP)));
        f.extend(call3("recv_exact", var("ret_r"), var("tmp"), var("out_n")));
        f.push(if_then(Test::IsNegative(var("rc")), vec![die()]));

        f.extend(call3(
            "recv_exact",
            var("ret_r"),
            slot_ptr_at("b", B_RESP),
            int(4),
        ));
        f.push(if_then(Test::IsNegative(var("rc")), vec![die()]));
        f.push(assign(var("err_n"), slot_at("b", B_RESP, Width::W32)));
        f.push(op(OpKind::Add, "tmp", var("scratch"), int(STDERR_CAP)));
        f.extend(call3("recv_exact", var("ret_r"), var("tmp"), var("err_n")));
        f.push(if_then(Test::IsNegative(var("rc")), vec![die()]));

        f.push(syscall(
            Sys::Wait4,
            vec![var("reader_pid"), int(0), int(0), int(0)],
        ));
        f.push(syscall(Sys::Close, vec![var("ret_r")]));
        f
    }));

    // ------------------------------------------------------------------
    // Response.
    // ------------------------------------------------------------------
    l.push(if_else(
        cmp(CmpKind::Equal, var("captures"), int(0)),
        {
            // Legacy: [4][exit_code].
            let mut f = vec![
                assign(slot_at("b", B_RESP, Width::W32), int(4)),
                assign(slot_at("b", B_RESP + 4, Width::W32), var("exit_code")),
            ];
            f.extend(pump_or_die(
                "send_exact",
                var("sock"),
                slot_ptr_at("b", B_RESP),
                int(8),
            ));
            f
        },
        {
            // [len][exit][out_n][out][err_n][err].
            let mut f = vec![
                op(OpKind::Add, "tmp", var("out_n"), var("err_n")),
                op(OpKind::Add, "tmp", var("tmp"), int(12)),
                assign(slot_at("b", B_RESP, Width::W32), var("tmp")),
                assign(slot_at("b", B_RESP + 4, Width::W32), var("exit_code")),
                assign(slot_at("b", B_RESP + 8, Width::W32), var("out_n")),
            ];
            f.extend(pump_or_die(
                "send_exact",
                var("sock"),
                slot_ptr_at("b", B_RESP),
                int(12),
            ));
            f.push(op(OpKind::Add, "tmp", var("scratch"), int(STDOUT_CAP)));
            f.extend(pump_or_die("send_exact", var("sock"), var("tmp"), var("out_n")));
            f.push(assign(slot_at("b", B_RESP, Width::W32), var("err_n")));
            f.extend(pump_or_die(
                "send_exact",
                var("sock"),
                slot_ptr_at("b", B_RESP),
                int(4),
            ));
            f.push(op(OpKind::Add, "tmp", var("scratch"), int(STDERR_CAP)));
            f.extend(pump_or_die("send_exact", var("sock"), var("tmp"), var("err_n")));
            f
        },
    ));

    l.extend(mark_timeslice(5));
    l.push(goto("cmd_loop"));
    l
}

/// Pipes, fd redirection, and the forked reader for a captured run.
fn build_capture_setup(
    config: &InitConfig,
    call3: &dyn Fn(&str, Value, Value, Value) -> Vec<Fragment>,
    die: &dyn Fn() -> Fragment,
) -> Vec<Fragment> {
    let mut f: Vec<Fragment> = Vec::new();

    // out pipe at b[80], return pipe at b[88], err pipe at b[96].
    f.push(syscall_ret(
        Sys::Pipe2,
        vec![slot_ptr_at("b", B_FDS + 8), int(0)],
        "rc",
    ));
    f.push(if_then(Test::IsNegative(var("rc")), vec![die()]));
    f.push(assign(var("out_r"), slot_at("b", B_FDS + 8, Width::W32)));
    f.push(assign(var("out_w"), slot_at("b", B_FDS + 12, Width::W32)));

    f.push(syscall_ret(
        Sys::Pipe2,
        vec![slot_ptr_at("b", B_FDS + 16), int(0)],
        "rc",
    ));
    f.push(if_then(Test::IsNegative(var("rc")), vec![die()]));
    f.push(assign(var("ret_r"), slot_at("b", B_FDS + 16, Width::W32)));
    f.push(assign(var("ret_w"), slot_at("b", B_FDS + 20, Width::W32)));

    f.push(assign(var("err_r"), int(-1)));
    f.push(assign(var("err_w"), int(-1)));
    f.push(if_then(
        cmp(CmpKind::Equal, var("sep"), int(1)),
        vec![
            syscall_ret(
                Sys::Pipe2,
                vec![slot_ptr_at("b", B_FDS + 24), int(0)],
                "rc",
            ),
            if_then(Test::IsNegative(var("rc")), vec![die()]),
            assign(var("err_r"), slot_at("b", B_FDS + 24, Width::W32)),
            assign(var("err_w"), slot_at("b", B_FDS + 28, Width::W32)),
        ],
    ));

    f.push(syscall_ret(
        Sys::Clone,
        vec![int(SIGCHLD), int(0), int(0), int(0), int(0)],
        "reader_pid",
    ));
    f.push(if_then(
        cmp(CmpKind::Equal, var("reader_pid"), int(0)),
        build_reader_child(config, call3),
    ));

    // Parent: park originals above the fd range payloads use, point 1/2
    // at the pipes, drop every pipe end the reader owns now.
    f.push(syscall_ret(
        Sys::Fcntl,
        vec![int(1), int(F_DUPFD_CLOEXEC), int(100)],
        "saved1",
    ));
    f.push(syscall_ret(
        Sys::Fcntl,
        vec![int(2), int(F_DUPFD_CLOEXEC), int(100)],
        "saved2",
    ));
    f.extend(if_flag(
        FLAG_STDOUT | FLAG_COMBINE,
        vec![syscall(Sys::Dup3, vec![var("out_w"), int(1), int(0)])],
    ));
    f.extend(if_flag_else(
        FLAG_COMBINE,
        vec![syscall(Sys::Dup3, vec![var("out_w"), int(2), int(0)])],
        vec![if_then(
            cmp(CmpKind::Equal, var("sep"), int(1)),
            vec![syscall(Sys::Dup3, vec![var("err_w"), int(2), int(0)])],
        )],
    ));
    f.push(syscall(Sys::Close, vec![var("out_r")]));
    f.push(syscall(Sys::Close, vec![var("out_w")]));
    f.push(syscall(Sys::Close, vec![var("ret_w")]));
    f.push(if_then(
        cmp(CmpKind::Equal, var("sep"), int(1)),
        vec![
            syscall(Sys::Close, vec![var("err_r")]),
            syscall(Sys::Close, vec![var("err_w")]),
        ],
    ));
    f
}

/// The reader child: drain stdout/stderr pipes without blocking the
/// payload, then ship both buffers back over the return pipe.
fn build_reader_child(
    config: &InitConfig,
    call3: &dyn Fn(&str, Value, Value, Value) -> Vec<Fragment>,
) -> Vec<Fragment> {
    let _ = config;
    let mut c: Vec<Fragment> = Vec::new();

    c.push(syscall(Sys::Close, vec![var("out_w")]));
    c.push(syscall(Sys::Close, vec![var("ret_r")]));
    c.push(if_then(
        cmp(CmpKind::Equal, var("sep"), int(1)),
        vec![syscall(Sys::Close, vec![var("err_w")])],
    ));

    c.push(syscall(
        Sys::Fcntl,
        vec![var("out_r"), int(F_SETFL), int(O_NONBLOCK)],
    ));
    c.push(if_then(
        cmp(CmpKind::Equal, var("sep"), int(1)),
        vec![syscall(
            Sys::Fcntl,
            vec![var("err_r"), int(F_SETFL), int(O_NONBLOCK)],
        )],
    ));

    c.push(assign(var("out_n"), int(0)));
    c.push(assign(var("err_n"), int(0)));
    c.push(assign(var("out_done"), int(0)));
    c.push(assign(var("err_done"), int(1)));
    c.push(if_then(
        cmp(CmpKind::Equal, var("sep"), int(1)),
        vec![assign(var("err_done"), int(0))],
    ));

    let drain_one = |fd: &str, cap_base: i64, len_var: &str, done_var: &str| -> Fragment {
        if_then(
            cmp(CmpKind::Equal, var(done_var), int(0)),
            vec![
                // Past the cap, reads land in the discard page: output
                // beyond the limit is truncated.
                op(OpKind::Add, "dest", var("scratch"), int(cap_base)),
                op(OpKind::Add, "dest", var("dest"), var(len_var)),
                if_then(
                    cmp(CmpKind::Greater, var(len_var), int(CAP_SAFE)),
                    vec![
                        op(OpKind::Add, "dest", var("scratch"), int(DISCARD)),
                    ],
                ),
                syscall_ret(
                    Sys::Read,
                    vec![var(fd), var("dest"), int(READ_CHUNK)],
                    "r",
                ),
                if_then(
                    Test::IsZero(var("r")),
                    vec![
                        assign(var(done_var), int(1)),
                        assign(var("progress"), int(1)),
                    ],
                ),
                if_then(
                    cmp(CmpKind::Greater, var("r"), int(0)),
                    vec![
                        assign(var("progress"), int(1)),
                        if_then(
                            cmp(CmpKind::LessOrEqual, var(len_var), int(CAP_SAFE)),
                            vec![op(OpKind::Add, len_var, var(len_var), var("r"))],
                        ),
                    ],
                ),
            ],
        )
    };

    c.push(declare_label(
        "drain",
        vec![
            assign(var("progress"), int(0)),
            drain_one("out_r", STDOUT_CAP, "out_n", "out_done"),
            drain_one("err_r", STDERR_CAP, "err_n", "err_done"),
            if_then(
                cmp(CmpKind::Equal, var("out_done"), int(1)),
                vec![if_then(
                    cmp(CmpKind::Equal, var("err_done"), int(1)),
                    vec![goto("drained")],
                )],
            ),
            // Nothing moved: yield the timeslice the cheap way.
            if_then(
                Test::IsZero(var("progress")),
                vec![syscall(Sys::Getpid, vec![])],
            ),
            goto("drain"),
        ],
    ));

    c.push(declare_label("drained", {
        let mut d = vec![assign(slot_at("b", B_RESP, Width::W32), var("out_n"))];
        d.extend(call3(
            "send_exact",
            var("ret_w"),
            slot_ptr_at("b", B_RESP),
            int(4),
        ));
        d.push(op(OpKind::Add, "tmp", var("scratch"), int(STDOUT_CAP)));
        d.extend(call3("send_exact", var("ret_w"), var("tmp"), var("out_n")));
        d.push(assign(slot_at("b", B_RESP, Width::W32), var("err_n")));
        d.extend(call3(
            "send_exact",
            var("ret_w"),
            slot_ptr_at("b", B_RESP),
            int(4),
        ));
        d.push(op(OpKind::Add, "tmp", var("scratch"), int(STDERR_CAP)));
        d.extend(call3("send_exact", var("ret_w"), var("tmp"), var("err_n")));
        d.push(syscall(Sys::Exit, vec![int(0)]));
        d
    }));
    c
}

/// `if (flags & mask) != 0 { then_body }`.
fn if_flag(mask: i64, then_body: Vec<Fragment>) -> Vec<Fragment> {
    vec![
        op(OpKind::And, "flag_test", var("flags"), int(mask)),
        if_then(
            cmp(CmpKind::NotEqual, var("flag_test"), int(0)),
            then_body,
        ),
    ]
}

/// `if (flags & mask) != 0 { then_body } else { else_body }`.
fn if_flag_else(mask: i64, then_body: Vec<Fragment>, else_body: Vec<Fragment>) -> Vec<Fragment> {
    vec![
        op(OpKind::And, "flag_test", var("flags"), int(mask)),
        if_else(
            cmp(CmpKind::NotEqual, var("flag_test"), int(0)),
            then_body,
            else_body,
        ),
    ]
}

/// `if (flags & mask) == 0 { then_body }`.
fn if_not_flag(mask: i64, then_body: Vec<Fragment>) -> Vec<Fragment> {
    vec![
        op(OpKind::And, "flag_test", var("flags"), int(mask)),
        if_then(cmp(CmpKind::Equal, var("flag_test"), int(0)), then_body),
    ]
}
