//! Fragment-based intermediate representation.
//!
//! Programs are built as trees of [`Fragment`]s grouped into named methods.
//! The IR is deliberately tiny: assignments, three-address arithmetic,
//! structured conditionals, labels and gotos, raw syscalls, embedded
//! constants, and scoped stack slots. It carries no types beyond operand
//! width and no register assignments; the per-architecture lowering passes
//! in [`crate::asm`] map variables onto physical registers and flatten the
//! control flow.
//!
//! # Model
//!
//! ```text
//! Program ─ entrypoint
//!    └─ methods: name → [Fragment]
//!          Fragment ─ Assign / Op / If / Syscall / Goto / DeclareLabel /
//!                     Call / CallMethod / Return / Printf /
//!                     LoadConstantBytes / WithStackSlot
//! ```
//!
//! Variables and stack slots are plain names; a variable name starting with
//! `%` pins a specific physical register (e.g. `%rax`, `%x0`). Labels are
//! method-scoped and may be targeted before or after their declaration.
//!
//! The tree is immutable after construction: lowering consumes it by
//! reference and never writes back.

pub mod expand;
pub mod syscall;

pub use syscall::Sys;

use std::collections::BTreeMap;
use std::fmt;

/// Target instruction-set architecture.
///
/// The guest architecture always matches the host in this system; the enum
/// exists so programs can be assembled for either target and so tests can
/// exercise both encoders on any machine.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash)]
pub enum Arch {
    /// 64-bit x86 (long mode).
    X86_64,
    /// 64-bit Arm (AArch64, EL0/EL1).
    Aarch64,
}

impl Arch {
    /// The architecture of the machine this binary runs on.
    pub fn host() -> Self {
        #[cfg(target_arch = "x86_64")]
        {
            Arch::X86_64
        }
        #[cfg(target_arch = "aarch64")]
        {
            Arch::Aarch64
        }
        #[cfg(not(any(target_arch = "x86_64", target_arch = "aarch64")))]
        {
            // Unsupported hosts are rejected by the hypervisor probe before
            // any assembly happens; default to x86-64 for pure build tests.
            Arch::X86_64
        }
    }

    /// Short name used in errors and logs.
    pub fn name(self) -> &'static str {
        match self {
            Arch::X86_64 => "x86_64",
            Arch::Aarch64 => "aarch64",
        }
    }
}

impl fmt::Display for Arch {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.write_str(self.name())
    }
}

/// Architecture-neutral register enumeration.
///
/// Covers the general-purpose registers of both targets plus the
/// architectural program counter. The hypervisor layer keys bulk register
/// reads/writes by this enum; lowering uses it for pinned variables and
/// ABI sequencing.
#[derive(Debug, Clone, Copy, PartialEq, Eq, PartialOrd, Ord, Hash)]
#[repr(u8)]
#[allow(missing_docs)]
pub enum Reg {
    // x86-64
    Rax,
    Rbx,
    Rcx,
    Rdx,
    Rsi,
    Rdi,
    Rsp,
    Rbp,
    R8,
    R9,
    R10,
    R11,
    R12,
    R13,
    R14,
    R15,
    Rip,
    Rflags,
    // AArch64. X0..X28 are general purpose, X29 is the frame pointer,
    // X30 the link register.
    X0,
    X1,
    X2,
    X3,
    X4,
    X5,
    X6,
    X7,
    X8,
    X9,
    X10,
    X11,
    X12,
    X13,
    X14,
    X15,
    X16,
    X17,
    X18,
    X19,
    X20,
    X21,
    X22,
    X23,
    X24,
    X25,
    X26,
    X27,
    X28,
    X29,
    X30,
    Sp,
    Pc,
}

impl Reg {
    /// Which architecture this register belongs to.
    pub fn arch(self) -> Arch {
        use Reg::*;
        match self {
            Rax | Rbx | Rcx | Rdx | Rsi | Rdi | Rsp | Rbp | R8 | R9 | R10 | R11 | R12 | R13
            | R14 | R15 | Rip | Rflags => Arch::X86_64,
            _ => Arch::Aarch64,
        }
    }

    /// Lowercase assembly name (`rax`, `x0`, ...).
    pub fn name(self) -> &'static str {
        use Reg::*;
        match self {
            Rax => "rax",
            Rbx => "rbx",
            Rcx => "rcx",
            Rdx => "rdx",
            Rsi => "rsi",
            Rdi => "rdi",
            Rsp => "rsp",
            Rbp => "rbp",
            R8 => "r8",
            R9 => "r9",
            R10 => "r10",
            R11 => "r11",
            R12 => "r12",
            R13 => "r13",
            R14 => "r14",
            R15 => "r15",
            Rip => "rip",
            Rflags => "rflags",
            X0 => "x0",
            X1 => "x1",
            X2 => "x2",
            X3 => "x3",
            X4 => "x4",
            X5 => "x5",
            X6 => "x6",
            X7 => "x7",
            X8 => "x8",
            X9 => "x9",
            X10 => "x10",
            X11 => "x11",
            X12 => "x12",
            X13 => "x13",
            X14 => "x14",
            X15 => "x15",
            X16 => "x16",
            X17 => "x17",
            X18 => "x18",
            X19 => "x19",
            X20 => "x20",
            X21 => "x21",
            X22 => "x22",
            X23 => "x23",
            X24 => "x24",
            X25 => "x25",
            X26 => "x26",
            X27 => "x27",
            X28 => "x28",
            X29 => "x29",
            X30 => "x30",
            Sp => "sp",
            Pc => "pc",
        }
    }

    /// Resolve a pinned-variable name (without the `%` sentinel) back to a
    /// register.
    pub fn from_name(name: &str) -> Option<Reg> {
        use Reg::*;
        const ALL: &[Reg] = &[
            Rax, Rbx, Rcx, Rdx, Rsi, Rdi, Rsp, Rbp, R8, R9, R10, R11, R12, R13, R14, R15, Rip,
            Rflags, X0, X1, X2, X3, X4, X5, X6, X7, X8, X9, X10, X11, X12, X13, X14, X15, X16,
            X17, X18, X19, X20, X21, X22, X23, X24, X25, X26, X27, X28, X29, X30, Sp, Pc,
        ];
        ALL.iter().copied().find(|r| r.name() == name)
    }
}

/// Operand width in bits.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash)]
pub enum Width {
    W8,
    W16,
    W32,
    W64,
}

impl Width {
    /// Width in bytes.
    pub fn bytes(self) -> u64 {
        match self {
            Width::W8 => 1,
            Width::W16 => 2,
            Width::W32 => 4,
            Width::W64 => 8,
        }
    }
}

/// A named IR variable carrying an operand width.
///
/// Names starting with `%` pin the variable to the physical register of
/// that name (`%rax`, `%x8`, ...); everything else is allocated by the
/// lowering pass on first write.
#[derive(Debug, Clone, PartialEq, Eq, Hash)]
pub struct Var {
    pub name: String,
    pub width: Width,
}

impl Var {
    /// A 64-bit variable.
    pub fn new(name: impl Into<String>) -> Self {
        Var {
            name: name.into(),
            width: Width::W64,
        }
    }

    /// A variable with an explicit operand width.
    pub fn sized(name: impl Into<String>, width: Width) -> Self {
        Var {
            name: name.into(),
            width,
        }
    }

    /// A variable pinned to a physical register.
    pub fn pinned(reg: Reg) -> Self {
        Var {
            name: format!("%{}", reg.name()),
            width: Width::W64,
        }
    }

    /// The pinned register, if this variable uses the `%` sentinel.
    pub fn pinned_reg(&self) -> Option<Reg> {
        self.name.strip_prefix('%').and_then(Reg::from_name)
    }
}

/// A method-scoped branch target.
#[derive(Debug, Clone, PartialEq, Eq, Hash)]
pub struct Label(pub String);

impl Label {
    pub fn new(name: impl Into<String>) -> Self {
        Label(name.into())
    }
}

/// Base of a memory operand.
#[derive(Debug, Clone, PartialEq, Eq)]
pub enum MemBase {
    /// Address held in an IR variable.
    Var(Var),
    /// Address held in a physical register.
    Reg(Reg),
    /// A named stack slot declared by an enclosing [`Fragment::WithStackSlot`].
    Slot(String),
}

/// A memory operand: `width [base + disp]`.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct MemRef {
    pub base: MemBase,
    pub disp: i32,
    pub width: Width,
}

/// An operand: the right-hand side of assignments, arithmetic inputs,
/// syscall arguments.
#[derive(Debug, Clone, PartialEq, Eq)]
pub enum Value {
    /// An IR variable (possibly pinned).
    Var(Var),
    /// A physical register, unsized shorthand for a pinned variable.
    Reg(Reg),
    /// A 64-bit immediate.
    Int(i64),
    /// A memory operand.
    Mem(MemRef),
    /// Runtime address of a stack slot (`slot base + disp`), materialized
    /// with LEA / ADD-from-SP.
    SlotAddr { slot: String, disp: i32 },
    /// A string literal. Valid only as a syscall or printf argument, where
    /// it expands to an implicit zero-terminated [`Fragment::LoadConstantBytes`].
    Str(String),
}

/// Arithmetic and bitwise operation kinds for [`Fragment::Op`].
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum OpKind {
    Add,
    Sub,
    Mul,
    Div,
    Shl,
    Shr,
    And,
    Or,
    Xor,
}

/// Comparison kinds for two-operand tests. All comparisons are signed.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum CmpKind {
    Equal,
    NotEqual,
    Less,
    LessOrEqual,
    Greater,
    GreaterOrEqual,
}

/// The condition of an [`Fragment::If`].
#[derive(Debug, Clone, PartialEq, Eq)]
pub enum Test {
    /// Compare two operands.
    Cmp {
        kind: CmpKind,
        left: Value,
        right: Value,
    },
    /// True when the operand is zero.
    IsZero(Value),
    /// True when the operand is negative (sign bit set).
    IsNegative(Value),
}

/// How a syscall number is named: symbolically (resolved per architecture
/// at lowering time) or as a raw number the caller already resolved.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum SyscallNum {
    Sym(Sys),
    Raw(u32),
}

/// The atomic IR building block.
#[derive(Debug, Clone, PartialEq)]
pub enum Fragment {
    /// `dst = src`. Either side (or both) may be a memory operand;
    /// memory-to-memory copies stage through a scratch register.
    Assign { dst: Value, src: Value },

    /// `dst = left kind right` (three-address form).
    Op {
        kind: OpKind,
        dst: Var,
        left: Value,
        right: Value,
    },

    /// Structured conditional; exactly one branch executes and control
    /// reunifies after it. An empty `else_body` means no else branch.
    If {
        test: Test,
        then_body: Vec<Fragment>,
        else_body: Vec<Fragment>,
    },

    /// Raw system call. Arguments follow the target's syscall ABI; the
    /// return value, if requested, is copied from the ABI return register.
    Syscall {
        num: SyscallNum,
        args: Vec<Value>,
        ret: Option<Var>,
    },

    /// Return from the current method with a value in the ABI return
    /// register.
    Return { value: Value },

    /// Indirect call through a computed address.
    Call { target: Value },

    /// Direct call to a named method of the same program, resolved at link
    /// time.
    CallMethod { name: String },

    /// Unconditional branch to a method-scoped label.
    Goto(Label),

    /// Fix a label's position here, then execute `body`.
    DeclareLabel { label: Label, body: Vec<Fragment> },

    /// Format-string write to stdout. Supports `%x`, `%d`, `%s` (and `%%`).
    Printf { format: String, args: Vec<Value> },

    /// Declare a constant blob in the program image and bind its runtime
    /// address (and optionally its length) to variables. Identical blobs
    /// are emitted once per program.
    LoadConstantBytes {
        data: Vec<u8>,
        zero_terminate: bool,
        pointer: Var,
        length: Option<Var>,
    },

    /// Reserve `size` bytes of stack for the duration of `body`. The slot
    /// is addressed by name via [`Value::SlotAddr`] and [`MemBase::Slot`];
    /// the stack pointer is restored on every exit from the body.
    WithStackSlot {
        name: String,
        size: u64,
        body: Vec<Fragment>,
    },

    /// Make `len` bytes at `ptr` safe to execute after being written:
    /// the DC CVAU / IC IVAU / DSB / ISB dance on AArch64, nothing on
    /// x86-64 (where the loader thread wrote the bytes itself).
    FlushICache { ptr: Value, len: Value },

    /// Halt the virtual CPU: `HLT` on x86-64, a PSCI SYSTEM_OFF hypervisor
    /// call on AArch64. Only meaningful in bare (no-OS) programs.
    Halt,

    /// Raw `HVC #imm` hypervisor call. AArch64 only.
    Hvc { imm: u16 },
}

/// A complete IR program: an entrypoint plus a set of named methods.
///
/// Methods are stored in a sorted map so assembly is deterministic
/// regardless of insertion order.
#[derive(Debug, Clone, Default)]
pub struct Program {
    pub entrypoint: String,
    pub methods: BTreeMap<String, Vec<Fragment>>,
}

impl Program {
    /// Create an empty program with the given entrypoint name.
    pub fn new(entrypoint: impl Into<String>) -> Self {
        Program {
            entrypoint: entrypoint.into(),
            methods: BTreeMap::new(),
        }
    }

    /// Add (or replace) a method.
    pub fn method(&mut self, name: impl Into<String>, body: Vec<Fragment>) -> &mut Self {
        self.methods.insert(name.into(), body);
        self
    }
}

// Constructor helpers. Fragment-producing code reads much better through
// these than through struct literals; see `guest::init` for the heaviest
// user.

/// A 64-bit variable operand.
pub fn var(name: &str) -> Value {
    Value::Var(Var::new(name))
}

/// An immediate operand.
pub fn int(v: i64) -> Value {
    Value::Int(v)
}

/// A physical-register operand.
pub fn reg(r: Reg) -> Value {
    Value::Reg(r)
}

/// A string-literal operand (syscall/printf arguments only).
pub fn str_lit(s: &str) -> Value {
    Value::Str(s.to_string())
}

/// `width [var + disp]` memory operand.
pub fn mem(base: &str, disp: i32, width: Width) -> Value {
    Value::Mem(MemRef {
        base: MemBase::Var(Var::new(base)),
        disp,
        width,
    })
}

/// `width [slot + disp]` memory operand for a named stack slot.
pub fn slot_at(slot: &str, disp: i32, width: Width) -> Value {
    Value::Mem(MemRef {
        base: MemBase::Slot(slot.to_string()),
        disp,
        width,
    })
}

/// Runtime address of a stack slot.
pub fn slot_ptr(slot: &str) -> Value {
    Value::SlotAddr {
        slot: slot.to_string(),
        disp: 0,
    }
}

/// Runtime address of a stack slot plus a displacement.
pub fn slot_ptr_at(slot: &str, disp: i32) -> Value {
    Value::SlotAddr {
        slot: slot.to_string(),
        disp,
    }
}

/// `dst = src`.
pub fn assign(dst: Value, src: Value) -> Fragment {
    Fragment::Assign { dst, src }
}

/// `dst = left kind right`.
pub fn op(kind: OpKind, dst: &str, left: Value, right: Value) -> Fragment {
    Fragment::Op {
        kind,
        dst: Var::new(dst),
        left,
        right,
    }
}

/// Two-operand comparison test.
pub fn cmp(kind: CmpKind, left: Value, right: Value) -> Test {
    Test::Cmp { kind, left, right }
}

/// Conditional with no else branch.
pub fn if_then(test: Test, then_body: Vec<Fragment>) -> Fragment {
    Fragment::If {
        test,
        then_body,
        else_body: Vec::new(),
    }
}

/// Conditional with both branches.
pub fn if_else(test: Test, then_body: Vec<Fragment>, else_body: Vec<Fragment>) -> Fragment {
    Fragment::If {
        test,
        then_body,
        else_body,
    }
}

/// Symbolic syscall discarding the return value.
pub fn syscall(num: Sys, args: Vec<Value>) -> Fragment {
    Fragment::Syscall {
        num: SyscallNum::Sym(num),
        args,
        ret: None,
    }
}

/// Symbolic syscall capturing the return value into a variable.
pub fn syscall_ret(num: Sys, args: Vec<Value>, ret: &str) -> Fragment {
    Fragment::Syscall {
        num: SyscallNum::Sym(num),
        args,
        ret: Some(Var::new(ret)),
    }
}

/// Return from the current method.
pub fn ret(value: Value) -> Fragment {
    Fragment::Return { value }
}

/// Unconditional branch.
pub fn goto(label: &str) -> Fragment {
    Fragment::Goto(Label::new(label))
}

/// Fix a label here and continue with `body`.
pub fn declare_label(label: &str, body: Vec<Fragment>) -> Fragment {
    Fragment::DeclareLabel {
        label: Label::new(label),
        body,
    }
}

/// Format-string write to stdout.
pub fn printf(format: &str, args: Vec<Value>) -> Fragment {
    Fragment::Printf {
        format: format.to_string(),
        args,
    }
}

/// Bind a constant blob's runtime address to `pointer`.
pub fn load_constant_bytes(
    data: impl Into<Vec<u8>>,
    zero_terminate: bool,
    pointer: &str,
    length: Option<&str>,
) -> Fragment {
    Fragment::LoadConstantBytes {
        data: data.into(),
        zero_terminate,
        pointer: Var::new(pointer),
        length: length.map(Var::new),
    }
}

/// Reserve a named stack slot around `body`.
pub fn with_stack_slot(name: &str, size: u64, body: Vec<Fragment>) -> Fragment {
    Fragment::WithStackSlot {
        name: name.to_string(),
        size,
        body,
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_pinned_var_roundtrip() {
        let v = Var::pinned(Reg::Rax);
        assert_eq!(v.name, "%rax");
        assert_eq!(v.pinned_reg(), Some(Reg::Rax));

        let v = Var::pinned(Reg::X8);
        assert_eq!(v.pinned_reg(), Some(Reg::X8));

        assert_eq!(Var::new("count").pinned_reg(), None);
    }

    #[test]
    fn test_reg_arch() {
        assert_eq!(Reg::Rax.arch(), Arch::X86_64);
        assert_eq!(Reg::R10.arch(), Arch::X86_64);
        assert_eq!(Reg::X0.arch(), Arch::Aarch64);
        assert_eq!(Reg::Sp.arch(), Arch::Aarch64);
    }

    #[test]
    fn test_methods_are_sorted() {
        let mut p = Program::new("main");
        p.method("zeta", vec![]);
        p.method("alpha", vec![]);
        p.method("main", vec![]);
        let names: Vec<_> = p.methods.keys().cloned().collect();
        assert_eq!(names, vec!["alpha", "main", "zeta"]);
    }

    #[test]
    fn test_width_bytes() {
        assert_eq!(Width::W8.bytes(), 1);
        assert_eq!(Width::W64.bytes(), 8);
    }
}
