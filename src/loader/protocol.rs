//! Vsock wire protocol for payload execution.
//!
//! Host → guest request, all fields little-endian:
//!
//! ```text
//! [ payload_len : u32 ]  // byte count of everything after this field
//! [ time_sec    : i64 ]  // host clock, applied via clock_settime
//! [ time_nsec   : i64 ]
//! [ flags       : u32 ]  // bit0 stdout, bit1 stderr, bit2 combine,
//!                        // bit3 stdin present
//! [ stdin_len   : u32 ]
//! [ code_len    : u32 ]
//! [ reloc_count : u32 ]
//! [ relocations : u32 × reloc_count ]
//! [ code bytes  : code_len ]
//! [ stdin data  : stdin_len ]
//! ```
//!
//! Guest → host response:
//!
//! ```text
//! [ response_len : u32 ][ exit_code : i32 ]                  // flags == 0
//! [ response_len : u32 ][ exit_code : i32 ]
//! [ stdout_len : u32 ][ stdout ][ stderr_len : u32 ][ stderr ] // capture
//! ```
//!
//! `response_len` always equals the byte count of everything after it;
//! the decoder enforces this.

use crate::asm::Assembled;
use std::io::{Read, Write};
use thiserror::Error;

/// Size of the guest's executable payload arena.
pub const ARENA_SIZE: usize = 4 << 20;

/// Per-stream capture cap; the guest truncates beyond this.
pub const CAPTURE_LIMIT: usize = 16 << 20;

/// Default vsock port the guest init connects to.
pub const VSOCK_PORT: u32 = 9998;

/// Default guest-physical address of the timeslice trace page.
pub const TIMESLICE_MMIO_PHYS_ADDR: u64 = 0xf000_1000;

mod flags {
    pub const CAPTURE_STDOUT: u32 = 1 << 0;
    pub const CAPTURE_STDERR: u32 = 1 << 1;
    pub const COMBINE: u32 = 1 << 2;
    pub const STDIN: u32 = 1 << 3;
}

/// Errors on the host side of the channel.
#[derive(Debug, Error)]
pub enum ProtocolError {
    #[error("payload of {len} bytes exceeds the {ARENA_SIZE}-byte guest arena")]
    PayloadTooLarge { len: usize },

    #[error("relocation offset {offset:#x} outside payload of {len:#x} bytes")]
    RelocationOutOfRange { offset: u32, len: usize },

    #[error("vsock channel terminated (guest rebooted or VM shut down)")]
    VmTerminated,

    #[error("response framing violated: declared {declared} bytes, got {actual}")]
    Framing { declared: u32, actual: usize },

    #[error("capture length {len} exceeds the {CAPTURE_LIMIT}-byte limit")]
    CaptureTooLarge { len: u32 },

    #[error("channel I/O failed: {0}")]
    Io(#[from] std::io::Error),
}

/// Per-request execution options.
#[derive(Debug, Clone, Default)]
pub struct RunOptions {
    pub capture_stdout: bool,
    pub capture_stderr: bool,
    /// Fold stderr into the stdout stream (fd 2 dup'd from fd 1).
    pub combine: bool,
    /// Bytes presented to the payload on fd 0.
    pub stdin: Option<Vec<u8>>,
}

impl RunOptions {
    /// Capture both streams separately.
    pub fn captured() -> Self {
        RunOptions {
            capture_stdout: true,
            capture_stderr: true,
            ..Default::default()
        }
    }

    fn flags(&self) -> u32 {
        let mut f = 0;
        if self.capture_stdout {
            f |= flags::CAPTURE_STDOUT;
        }
        if self.capture_stderr {
            f |= flags::CAPTURE_STDERR;
        }
        if self.combine {
            f |= flags::COMBINE;
        }
        if self.stdin.is_some() {
            f |= flags::STDIN;
        }
        f
    }

    fn captures(&self) -> bool {
        self.flags() & (flags::CAPTURE_STDOUT | flags::CAPTURE_STDERR | flags::COMBINE) != 0
    }
}

/// Result of one payload execution.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct RunResult {
    pub exit_code: i32,
    pub stdout: Vec<u8>,
    pub stderr: Vec<u8>,
}

impl RunResult {
    /// Treat a nonzero exit code as an error.
    pub fn into_result(self) -> Result<RunResult, ExitError> {
        if self.exit_code == 0 {
            Ok(self)
        } else {
            Err(ExitError {
                code: self.exit_code,
            })
        }
    }
}

/// A payload that ran and reported failure.
#[derive(Debug, Error, PartialEq, Eq)]
#[error("payload exited with code {code}")]
pub struct ExitError {
    pub code: i32,
}

/// Frame one execution request.
pub fn write_request(
    w: &mut dyn Write,
    program: &Assembled,
    clock: (i64, i64),
    opts: &RunOptions,
) -> Result<(), ProtocolError> {
    if program.code.len() > ARENA_SIZE {
        return Err(ProtocolError::PayloadTooLarge {
            len: program.code.len(),
        });
    }
    for &off in &program.relocations {
        if off as usize + 8 > program.code.len() {
            return Err(ProtocolError::RelocationOutOfRange {
                offset: off,
                len: program.code.len(),
            });
        }
    }

    let stdin = opts.stdin.as_deref().unwrap_or(&[]);
    let payload_len = 8 + 8 + 4 + 4 + 4 + 4
        + program.relocations.len() * 4
        + program.code.len()
        + stdin.len();

    let mut frame = Vec::with_capacity(4 + payload_len);
    frame.extend_from_slice(&(payload_len as u32).to_le_bytes());
    frame.extend_from_slice(&clock.0.to_le_bytes());
    frame.extend_from_slice(&clock.1.to_le_bytes());
    frame.extend_from_slice(&opts.flags().to_le_bytes());
    frame.extend_from_slice(&(stdin.len() as u32).to_le_bytes());
    frame.extend_from_slice(&(program.code.len() as u32).to_le_bytes());
    frame.extend_from_slice(&(program.relocations.len() as u32).to_le_bytes());
    for &off in &program.relocations {
        frame.extend_from_slice(&off.to_le_bytes());
    }
    frame.extend_from_slice(&program.code);
    frame.extend_from_slice(stdin);

    w.write_all(&frame).map_err(map_eof)?;
    Ok(())
}

/// Read one execution response matching `opts`.
pub fn read_response(r: &mut dyn Read, opts: &RunOptions) -> Result<RunResult, ProtocolError> {
    let response_len = read_u32(r)?;
    let mut consumed = 0usize;

    let exit_code = read_u32(r)? as i32;
    consumed += 4;

    let (stdout, stderr) = if opts.captures() {
        let stdout = read_stream(r, &mut consumed)?;
        let stderr = read_stream(r, &mut consumed)?;
        (stdout, stderr)
    } else {
        (Vec::new(), Vec::new())
    };

    if consumed != response_len as usize {
        return Err(ProtocolError::Framing {
            declared: response_len,
            actual: consumed,
        });
    }

    Ok(RunResult {
        exit_code,
        stdout,
        stderr,
    })
}

fn read_stream(r: &mut dyn Read, consumed: &mut usize) -> Result<Vec<u8>, ProtocolError> {
    let len = read_u32(r)?;
    *consumed += 4;
    if len as usize > CAPTURE_LIMIT {
        return Err(ProtocolError::CaptureTooLarge { len });
    }
    let mut data = vec![0u8; len as usize];
    r.read_exact(&mut data).map_err(map_eof)?;
    *consumed += data.len();
    Ok(data)
}

fn read_u32(r: &mut dyn Read) -> Result<u32, ProtocolError> {
    let mut buf = [0u8; 4];
    r.read_exact(&mut buf).map_err(map_eof)?;
    Ok(u32::from_le_bytes(buf))
}

fn map_eof(e: std::io::Error) -> ProtocolError {
    if e.kind() == std::io::ErrorKind::UnexpectedEof
        || e.kind() == std::io::ErrorKind::BrokenPipe
        || e.kind() == std::io::ErrorKind::ConnectionReset
    {
        ProtocolError::VmTerminated
    } else {
        ProtocolError::Io(e)
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::ir::Arch;

    fn program(code: Vec<u8>, relocations: Vec<u32>) -> Assembled {
        Assembled {
            arch: Arch::X86_64,
            code,
            relocations,
            bss_size: 0,
        }
    }

    #[test]
    fn test_request_layout() {
        let p = program(vec![0x90, 0xf4], vec![]);
        let mut frame = Vec::new();
        write_request(
            &mut frame,
            &p,
            (100, 250),
            &RunOptions {
                capture_stdout: true,
                stdin: Some(b"in".to_vec()),
                ..Default::default()
            },
        )
        .unwrap();

        // payload_len covers time(16) + flags(4) + stdin_len(4) +
        // code_len(4) + reloc_count(4) + code(2) + stdin(2).
        assert_eq!(u32::from_le_bytes(frame[0..4].try_into().unwrap()), 36);
        assert_eq!(i64::from_le_bytes(frame[4..12].try_into().unwrap()), 100);
        assert_eq!(i64::from_le_bytes(frame[12..20].try_into().unwrap()), 250);
        // stdout capture + stdin present.
        assert_eq!(u32::from_le_bytes(frame[20..24].try_into().unwrap()), 0b1001);
        assert_eq!(u32::from_le_bytes(frame[24..28].try_into().unwrap()), 2);
        assert_eq!(u32::from_le_bytes(frame[28..32].try_into().unwrap()), 2);
        assert_eq!(u32::from_le_bytes(frame[32..36].try_into().unwrap()), 0);
        assert_eq!(&frame[36..38], &[0x90, 0xf4]);
        assert_eq!(&frame[38..40], b"in");
        assert_eq!(frame.len(), 40);
    }

    #[test]
    fn test_payload_exactly_arena_size_accepted() {
        let p = program(vec![0; ARENA_SIZE], vec![]);
        let mut out = Vec::new();
        assert!(write_request(&mut out, &p, (0, 0), &RunOptions::default()).is_ok());

        let p = program(vec![0; ARENA_SIZE + 1], vec![]);
        assert!(matches!(
            write_request(&mut Vec::new(), &p, (0, 0), &RunOptions::default()),
            Err(ProtocolError::PayloadTooLarge { .. })
        ));
    }

    #[test]
    fn test_relocation_bounds_checked() {
        let p = program(vec![0; 16], vec![9]);
        assert!(matches!(
            write_request(&mut Vec::new(), &p, (0, 0), &RunOptions::default()),
            Err(ProtocolError::RelocationOutOfRange { offset: 9, .. })
        ));
        let p = program(vec![0; 16], vec![8]);
        assert!(write_request(&mut Vec::new(), &p, (0, 0), &RunOptions::default()).is_ok());
    }

    #[test]
    fn test_legacy_response() {
        let mut frame = Vec::new();
        frame.extend_from_slice(&4u32.to_le_bytes());
        frame.extend_from_slice(&7i32.to_le_bytes());
        let result = read_response(&mut frame.as_slice(), &RunOptions::default()).unwrap();
        assert_eq!(result.exit_code, 7);
        assert!(result.stdout.is_empty());
    }

    #[test]
    fn test_captured_response() {
        let mut frame = Vec::new();
        frame.extend_from_slice(&(4u32 + 4 + 2 + 4 + 0).to_le_bytes());
        frame.extend_from_slice(&7i32.to_le_bytes());
        frame.extend_from_slice(&2u32.to_le_bytes());
        frame.extend_from_slice(b"hi");
        frame.extend_from_slice(&0u32.to_le_bytes());

        let result = read_response(&mut frame.as_slice(), &RunOptions::captured()).unwrap();
        assert_eq!(result.exit_code, 7);
        assert_eq!(result.stdout, b"hi");
        assert!(result.stderr.is_empty());
    }

    #[test]
    fn test_response_len_must_match() {
        let mut frame = Vec::new();
        frame.extend_from_slice(&5u32.to_le_bytes()); // wrong: actual is 4
        frame.extend_from_slice(&0i32.to_le_bytes());
        assert!(matches!(
            read_response(&mut frame.as_slice(), &RunOptions::default()),
            Err(ProtocolError::Framing {
                declared: 5,
                actual: 4
            })
        ));
    }

    #[test]
    fn test_short_read_is_termination() {
        let frame = [1u8, 0]; // truncated length field
        assert!(matches!(
            read_response(&mut frame.as_ref(), &RunOptions::default()),
            Err(ProtocolError::VmTerminated)
        ));
    }

    #[test]
    fn test_exit_error() {
        let result = RunResult {
            exit_code: 3,
            stdout: Vec::new(),
            stderr: Vec::new(),
        };
        assert_eq!(result.into_result(), Err(ExitError { code: 3 }));
    }

    #[test]
    fn test_oversized_capture_rejected() {
        let mut frame = Vec::new();
        frame.extend_from_slice(&100u32.to_le_bytes());
        frame.extend_from_slice(&0i32.to_le_bytes());
        frame.extend_from_slice(&(CAPTURE_LIMIT as u32 + 1).to_le_bytes());
        assert!(matches!(
            read_response(&mut frame.as_slice(), &RunOptions::captured()),
            Err(ProtocolError::CaptureTooLarge { .. })
        ));
    }
}
