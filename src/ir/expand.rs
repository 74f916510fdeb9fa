//! Printf desugaring.
//!
//! `Fragment::Printf` is convenience surface, not a primitive: before
//! lowering, every printf is rewritten into constant-blob writes and calls
//! to small formatting helper methods that are themselves written in IR and
//! appended to the program. The expansion is per-architecture because the
//! helpers are written against pinned caller-saved registers (the helper
//! argument travels in the ABI's first argument register) so they never
//! disturb variables the lowering pass placed in callee-saved registers.
//!
//! Supported directives: `%x` (lowercase hex, leading zeros suppressed),
//! `%d` (signed decimal), `%s` (zero-terminated string), `%%`.

use super::*;

/// Name of the hex-printing helper method.
const PUTX: &str = "__fmt_putx";
/// Name of the decimal-printing helper method.
const PUTD: &str = "__fmt_putd";
/// Name of the string-printing helper method.
const PUTS: &str = "__fmt_puts";

/// Errors from printf expansion.
#[derive(Debug, thiserror::Error)]
pub enum ExpandError {
    #[error("method {method}: unknown printf directive %{directive}")]
    UnknownDirective { method: String, directive: char },

    #[error("method {method}: printf format has {directives} directives but {args} arguments")]
    ArgumentCount {
        method: String,
        directives: usize,
        args: usize,
    },

    #[error("method {method}: printf format ends with a bare %")]
    TrailingPercent { method: String },
}

/// Rewrite all `Printf` fragments in `program`, appending the formatting
/// helper methods when at least one printf needed them. Returns a new
/// program; the input is untouched.
pub fn expand_program(arch: Arch, program: &Program) -> Result<Program, ExpandError> {
    let mut out = Program::new(program.entrypoint.clone());
    let mut ctx = ExpandCtx {
        arch,
        used_helpers: false,
        blob_counter: 0,
    };

    for (name, body) in &program.methods {
        let new_body = ctx.expand_body(name, body)?;
        out.method(name.clone(), new_body);
    }

    if ctx.used_helpers {
        out.method(PUTX, build_putx(arch));
        out.method(PUTD, build_putd(arch));
        out.method(PUTS, build_puts(arch));
    }

    Ok(out)
}

struct ExpandCtx {
    arch: Arch,
    used_helpers: bool,
    /// Counter for generated constant-pointer variable names. Lives here so
    /// expansion is deterministic per program, never process-global.
    blob_counter: u64,
}

impl ExpandCtx {
    fn expand_body(
        &mut self,
        method: &str,
        body: &[Fragment],
    ) -> Result<Vec<Fragment>, ExpandError> {
        let mut out = Vec::with_capacity(body.len());
        for frag in body {
            match frag {
                Fragment::Printf { format, args } => {
                    self.expand_printf(method, format, args, &mut out)?;
                }
                Fragment::If {
                    test,
                    then_body,
                    else_body,
                } => out.push(Fragment::If {
                    test: test.clone(),
                    then_body: self.expand_body(method, then_body)?,
                    else_body: self.expand_body(method, else_body)?,
                }),
                Fragment::DeclareLabel { label, body } => out.push(Fragment::DeclareLabel {
                    label: label.clone(),
                    body: self.expand_body(method, body)?,
                }),
                Fragment::WithStackSlot { name, size, body } => out.push(Fragment::WithStackSlot {
                    name: name.clone(),
                    size: *size,
                    body: self.expand_body(method, body)?,
                }),
                other => out.push(other.clone()),
            }
        }
        Ok(out)
    }

    /// First argument register of the helper calling convention.
    fn arg_reg(&self) -> Reg {
        match self.arch {
            Arch::X86_64 => Reg::Rdi,
            Arch::Aarch64 => Reg::X0,
        }
    }

    fn emit_literal(&mut self, text: &str, out: &mut Vec<Fragment>) {
        if text.is_empty() {
            return;
        }
        let ptr = format!("__fmt_lit_ptr{}", self.blob_counter);
        let len = format!("__fmt_lit_len{}", self.blob_counter);
        self.blob_counter += 1;
        out.push(load_constant_bytes(
            text.as_bytes().to_vec(),
            false,
            &ptr,
            Some(&len),
        ));
        out.push(syscall(
            Sys::Write,
            vec![int(1), var(&ptr), var(&len)],
        ));
    }

    fn expand_printf(
        &mut self,
        method: &str,
        format: &str,
        args: &[Value],
        out: &mut Vec<Fragment>,
    ) -> Result<(), ExpandError> {
        let mut literal = String::new();
        let mut next_arg = 0usize;
        let mut chars = format.chars();

        while let Some(c) = chars.next() {
            if c != '%' {
                literal.push(c);
                continue;
            }
            let directive = chars.next().ok_or_else(|| ExpandError::TrailingPercent {
                method: method.to_string(),
            })?;
            if directive == '%' {
                literal.push('%');
                continue;
            }

            let helper = match directive {
                'x' => PUTX,
                'd' => PUTD,
                's' => PUTS,
                other => {
                    return Err(ExpandError::UnknownDirective {
                        method: method.to_string(),
                        directive: other,
                    })
                }
            };

            let arg = args.get(next_arg).cloned().ok_or(ExpandError::ArgumentCount {
                method: method.to_string(),
                directives: next_arg + 1,
                args: args.len(),
            })?;
            next_arg += 1;

            self.emit_literal(&literal, out);
            literal.clear();
            self.used_helpers = true;

            // A string-literal %s argument becomes an embedded blob whose
            // pointer feeds the helper directly.
            let arg = match arg {
                Value::Str(s) => {
                    let ptr = format!("__fmt_lit_ptr{}", self.blob_counter);
                    self.blob_counter += 1;
                    out.push(load_constant_bytes(s.into_bytes(), true, &ptr, None));
                    var(&ptr)
                }
                v => v,
            };

            out.push(assign(reg(self.arg_reg()), arg));
            out.push(Fragment::CallMethod {
                name: helper.to_string(),
            });
        }

        if next_arg != args.len() {
            return Err(ExpandError::ArgumentCount {
                method: method.to_string(),
                directives: next_arg,
                args: args.len(),
            });
        }

        self.emit_literal(&literal, out);
        Ok(())
    }
}

// The helpers below are written entirely against pinned caller-saved
// registers that Linux syscalls preserve (x86-64 keeps everything except
// RAX/RCX/R11 across `syscall`; AArch64 keeps everything except X0 across
// `svc`), so they are safe to call from any lowered method.

/// `%x`: print the helper argument as lowercase hex, leading zeros
/// suppressed, at least one digit.
fn build_putx(arch: Arch) -> Vec<Fragment> {
    let (value, shift, started) = match arch {
        Arch::X86_64 => ("%r8", "%r9", "%r10"),
        Arch::Aarch64 => ("%x9", "%x10", "%x11"),
    };
    let arg = match arch {
        Arch::X86_64 => Reg::Rdi,
        Arch::Aarch64 => Reg::X0,
    };

    vec![
        assign(var(value), reg(arg)),
        assign(var(shift), int(60)),
        assign(var(started), int(0)),
        with_stack_slot("digit", 16, vec![declare_label(
            "next_digit",
            vec![
                // d = (value >> shift) & 0xf
                op(OpKind::Shr, "__d", var(value), var(shift)),
                op(OpKind::And, "__d", var("__d"), int(0xf)),
                // Emit unless it is a leading zero (last digit always emits).
                if_then(
                    cmp(CmpKind::NotEqual, var("__d"), int(0)),
                    vec![assign(var(started), int(1))],
                ),
                if_then(
                    cmp(CmpKind::Equal, var(shift), int(0)),
                    vec![assign(var(started), int(1))],
                ),
                if_then(cmp(CmpKind::Equal, var(started), int(1)), vec![
                    if_else(
                        cmp(CmpKind::Less, var("__d"), int(10)),
                        vec![op(OpKind::Add, "__c", var("__d"), int(b'0' as i64))],
                        vec![op(OpKind::Add, "__c", var("__d"), int(b'a' as i64 - 10))],
                    ),
                    assign(slot_at("digit", 0, Width::W8), var("__c")),
                    syscall(Sys::Write, vec![int(1), slot_ptr("digit"), int(1)]),
                ]),
                if_then(cmp(CmpKind::NotEqual, var(shift), int(0)), vec![
                    op(OpKind::Sub, shift, var(shift), int(4)),
                    goto("next_digit"),
                ]),
            ],
        )]),
        ret(int(0)),
    ]
}

/// `%d`: print the helper argument as signed decimal.
fn build_putd(arch: Arch) -> Vec<Fragment> {
    let (value, cursor) = match arch {
        Arch::X86_64 => ("%r8", "%r9"),
        Arch::Aarch64 => ("%x9", "%x10"),
    };
    let arg = match arch {
        Arch::X86_64 => Reg::Rdi,
        Arch::Aarch64 => Reg::X0,
    };

    vec![
        assign(var(value), reg(arg)),
        // 32 bytes: up to 20 digits plus sign, filled from the end.
        with_stack_slot("buf", 32, vec![
            if_then(Test::IsNegative(var(value)), vec![
                assign(slot_at("buf", 0, Width::W8), int(b'-' as i64)),
                syscall(Sys::Write, vec![int(1), slot_ptr("buf"), int(1)]),
                op(OpKind::Sub, "__neg", int(0), var(value)),
                assign(var(value), var("__neg")),
            ]),
            assign(var(cursor), int(31)),
            declare_label("next", vec![
                op(OpKind::Div, "__q", var(value), int(10)),
                op(OpKind::Mul, "__q10", var("__q"), int(10)),
                op(OpKind::Sub, "__r", var(value), var("__q10")),
                op(OpKind::Add, "__c", var("__r"), int(b'0' as i64)),
                assign(var("__at"), slot_ptr("buf")),
                op(OpKind::Add, "__at", var("__at"), var(cursor)),
                assign(
                    Value::Mem(MemRef {
                        base: MemBase::Var(Var::new("__at")),
                        disp: 0,
                        width: Width::W8,
                    }),
                    var("__c"),
                ),
                assign(var(value), var("__q")),
                if_then(cmp(CmpKind::NotEqual, var(value), int(0)), vec![
                    op(OpKind::Sub, cursor, var(cursor), int(1)),
                    goto("next"),
                ]),
            ]),
            // write(1, buf + cursor, 32 - cursor)
            assign(var("__p"), slot_ptr("buf")),
            op(OpKind::Add, "__p", var("__p"), var(cursor)),
            op(OpKind::Sub, "__n", int(32), var(cursor)),
            syscall(Sys::Write, vec![int(1), var("__p"), var("__n")]),
        ]),
        ret(int(0)),
    ]
}

/// `%s`: print the zero-terminated string the helper argument points at.
fn build_puts(arch: Arch) -> Vec<Fragment> {
    let (start, cursor) = match arch {
        Arch::X86_64 => ("%r8", "%r9"),
        Arch::Aarch64 => ("%x9", "%x10"),
    };
    let arg = match arch {
        Arch::X86_64 => Reg::Rdi,
        Arch::Aarch64 => Reg::X0,
    };

    vec![
        assign(var(start), reg(arg)),
        assign(var(cursor), reg(arg)),
        declare_label("scan", vec![
            assign(
                Var8("__b"),
                Value::Mem(MemRef {
                    base: MemBase::Var(Var::new(cursor)),
                    disp: 0,
                    width: Width::W8,
                }),
            ),
            if_then(cmp(CmpKind::NotEqual, var("__b"), int(0)), vec![
                op(OpKind::Add, cursor, var(cursor), int(1)),
                goto("scan"),
            ]),
        ]),
        op(OpKind::Sub, "__len", var(cursor), var(start)),
        syscall(Sys::Write, vec![int(1), var(start), var("__len")]),
        ret(int(0)),
    ]
}

/// Shorthand for an 8-bit variable assignment destination.
#[allow(non_snake_case)]
fn Var8(name: &str) -> Value {
    Value::Var(Var::sized(name, Width::W8))
}

#[cfg(test)]
mod tests {
    use super::*;

    fn count_fragments(body: &[Fragment]) -> usize {
        body.iter()
            .map(|f| match f {
                Fragment::If {
                    then_body,
                    else_body,
                    ..
                } => 1 + count_fragments(then_body) + count_fragments(else_body),
                Fragment::DeclareLabel { body, .. } | Fragment::WithStackSlot { body, .. } => {
                    1 + count_fragments(body)
                }
                _ => 1,
            })
            .sum()
    }

    #[test]
    fn test_plain_text_becomes_one_write() {
        let mut p = Program::new("main");
        p.method("main", vec![printf("hello\n", vec![]), ret(int(0))]);
        let out = expand_program(Arch::X86_64, &p).unwrap();
        let body = &out.methods["main"];
        // LoadConstantBytes + Syscall + Return.
        assert_eq!(body.len(), 3);
        assert!(matches!(body[0], Fragment::LoadConstantBytes { .. }));
        assert!(matches!(body[1], Fragment::Syscall { .. }));
        // No helpers appended.
        assert!(!out.methods.contains_key(PUTX));
    }

    #[test]
    fn test_directives_pull_in_helpers() {
        let mut p = Program::new("main");
        p.method(
            "main",
            vec![printf("v=%x d=%d s=%s\n", vec![int(255), int(-2), str_lit("ok")])],
        );
        let out = expand_program(Arch::Aarch64, &p).unwrap();
        assert!(out.methods.contains_key(PUTX));
        assert!(out.methods.contains_key(PUTD));
        assert!(out.methods.contains_key(PUTS));
        assert!(count_fragments(&out.methods["main"]) > 6);
    }

    #[test]
    fn test_argument_count_mismatch() {
        let mut p = Program::new("main");
        p.method("main", vec![printf("%d %d", vec![int(1)])]);
        assert!(matches!(
            expand_program(Arch::X86_64, &p),
            Err(ExpandError::ArgumentCount { .. })
        ));
    }

    #[test]
    fn test_unknown_directive() {
        let mut p = Program::new("main");
        p.method("main", vec![printf("%q", vec![int(1)])]);
        assert!(matches!(
            expand_program(Arch::X86_64, &p),
            Err(ExpandError::UnknownDirective { directive: 'q', .. })
        ));
    }

    #[test]
    fn test_percent_escape() {
        let mut p = Program::new("main");
        p.method("main", vec![printf("100%%\n", vec![])]);
        let out = expand_program(Arch::X86_64, &p).unwrap();
        match &out.methods["main"][0] {
            Fragment::LoadConstantBytes { data, .. } => assert_eq!(data, b"100%\n"),
            other => panic!("expected blob, got {other:?}"),
        }
    }
}
