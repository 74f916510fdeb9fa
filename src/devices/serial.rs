//! 8250 UART serial port emulation.
//!
//! Minimal output-only UART for the guest console: transmitted bytes go
//! to a sink (host stdout by default, a buffer in tests). The guest init
//! opens `/dev/console` over this port, which is how `printf` output from
//! payloads survives even when vsock capture is off.

use crate::hv::{PortIoHandler, WriteOutcome};
use std::io::{self, Write};

/// Base port of COM1.
pub const SERIAL_COM1_BASE: u16 = 0x3f8;

/// Register window size.
pub const SERIAL_COM1_SIZE: u16 = 8;

/// 8250 register offsets.
mod regs {
    /// Transmit Holding (write) / Receive Buffer (read).
    pub const THR_RBR: u16 = 0;
    /// Interrupt Enable.
    pub const IER: u16 = 1;
    /// Interrupt Identification (read) / FIFO Control (write).
    pub const IIR_FCR: u16 = 2;
    /// Line Control.
    pub const LCR: u16 = 3;
    /// Modem Control.
    pub const MCR: u16 = 4;
    /// Line Status.
    pub const LSR: u16 = 5;
    /// Modem Status.
    pub const MSR: u16 = 6;
    /// Scratch.
    pub const SCR: u16 = 7;
}

mod lsr {
    /// Transmitter Holding Register Empty.
    pub const THRE: u8 = 0x20;
    /// Transmitter Empty.
    pub const TEMT: u8 = 0x40;
}

mod iir {
    /// No interrupt pending.
    pub const NO_INT: u8 = 0x01;
}

/// Where transmitted bytes go.
pub enum SerialSink {
    Stdout,
    Buffer(Vec<u8>),
}

/// 8250 UART.
pub struct Serial {
    ier: u8,
    lcr: u8,
    mcr: u8,
    scr: u8,
    fcr: u8,
    dll: u8,
    dlh: u8,
    sink: SerialSink,
}

impl Serial {
    /// A console writing through to host stdout.
    pub fn new() -> Self {
        Self::with_sink(SerialSink::Stdout)
    }

    /// A console capturing into a buffer (tests, quiet runs).
    pub fn buffered() -> Self {
        Self::with_sink(SerialSink::Buffer(Vec::new()))
    }

    fn with_sink(sink: SerialSink) -> Self {
        Serial {
            ier: 0,
            lcr: 0,
            mcr: 0,
            scr: 0,
            fcr: 0,
            dll: 0,
            dlh: 0,
            sink,
        }
    }

    /// Captured output, when the sink is a buffer.
    pub fn buffered_output(&self) -> Option<&[u8]> {
        match &self.sink {
            SerialSink::Buffer(buf) => Some(buf),
            SerialSink::Stdout => None,
        }
    }

    fn transmit(&mut self, value: u8) {
        match &mut self.sink {
            SerialSink::Stdout => {
                let _ = io::stdout().write_all(&[value]);
                let _ = io::stdout().flush();
            }
            SerialSink::Buffer(buf) => buf.push(value),
        }
    }

    fn reg_read(&self, offset: u16) -> u8 {
        let dlab = self.lcr & 0x80 != 0;
        match offset {
            regs::THR_RBR if dlab => self.dll,
            // No input support: receive buffer always empty.
            regs::THR_RBR => 0,
            regs::IER if dlab => self.dlh,
            regs::IER => self.ier,
            regs::IIR_FCR => iir::NO_INT,
            regs::LCR => self.lcr,
            regs::MCR => self.mcr,
            // Always ready to transmit.
            regs::LSR => lsr::THRE | lsr::TEMT,
            // Carrier Detect + Data Set Ready + Clear To Send.
            regs::MSR => 0xb0,
            regs::SCR => self.scr,
            _ => 0,
        }
    }

    fn reg_write(&mut self, offset: u16, value: u8) {
        let dlab = self.lcr & 0x80 != 0;
        match offset {
            regs::THR_RBR if dlab => self.dll = value,
            regs::THR_RBR => self.transmit(value),
            regs::IER if dlab => self.dlh = value,
            regs::IER => self.ier = value,
            regs::IIR_FCR => self.fcr = value,
            regs::LCR => self.lcr = value,
            regs::MCR => self.mcr = value,
            regs::SCR => self.scr = value,
            _ => {}
        }
    }
}

impl Default for Serial {
    fn default() -> Self {
        Self::new()
    }
}

impl PortIoHandler for Serial {
    fn read(&mut self, offset: u16, data: &mut [u8]) {
        let value = self.reg_read(offset);
        data.fill(value);
    }

    fn write(&mut self, offset: u16, data: &[u8]) -> WriteOutcome {
        for &byte in data {
            self.reg_write(offset, byte);
        }
        WriteOutcome::Continue
    }

    fn snapshot(&self) -> Vec<u8> {
        vec![
            self.ier, self.lcr, self.mcr, self.scr, self.fcr, self.dll, self.dlh,
        ]
    }

    fn restore(&mut self, state: &[u8]) {
        if let [ier, lcr, mcr, scr, fcr, dll, dlh] = *state {
            self.ier = ier;
            self.lcr = lcr;
            self.mcr = mcr;
            self.scr = scr;
            self.fcr = fcr;
            self.dll = dll;
            self.dlh = dlh;
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_lsr_always_ready() {
        let serial = Serial::buffered();
        let lsr_val = serial.reg_read(regs::LSR);
        assert_eq!(lsr_val & lsr::THRE, lsr::THRE);
        assert_eq!(lsr_val & lsr::TEMT, lsr::TEMT);
    }

    #[test]
    fn test_transmit_captured() {
        let mut serial = Serial::buffered();
        for b in b"hello" {
            serial.reg_write(regs::THR_RBR, *b);
        }
        assert_eq!(serial.buffered_output(), Some(b"hello".as_slice()));
    }

    #[test]
    fn test_scratch_register() {
        let mut serial = Serial::buffered();
        serial.reg_write(regs::SCR, 0x42);
        assert_eq!(serial.reg_read(regs::SCR), 0x42);
    }

    #[test]
    fn test_dlab_mode() {
        let mut serial = Serial::buffered();
        serial.reg_write(regs::LCR, 0x80);
        serial.reg_write(regs::THR_RBR, 0x01); // DLL, not a transmit
        serial.reg_write(regs::IER, 0x00); // DLH
        assert_eq!(serial.reg_read(regs::THR_RBR), 0x01);
        serial.reg_write(regs::LCR, 0x00);
        assert_eq!(serial.reg_read(regs::IER), 0x00);
        assert_eq!(serial.buffered_output(), Some([].as_slice()));
    }

    #[test]
    fn test_snapshot_roundtrip() {
        let mut serial = Serial::buffered();
        serial.reg_write(regs::LCR, 0x03);
        serial.reg_write(regs::SCR, 0x99);
        let state = serial.snapshot();

        let mut restored = Serial::buffered();
        restored.restore(&state);
        assert_eq!(restored.reg_read(regs::LCR), 0x03);
        assert_eq!(restored.reg_read(regs::SCR), 0x99);
    }
}
