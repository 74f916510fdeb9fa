//! Device emulation for the VMM.
//!
//! Devices are tagged [`Device`] entries owned by the VM; [`DeviceSet`]
//! routes vCPU exits to them by address range. Port-I/O reads with no
//! matching device return 0xff and writes are dropped (the legacy-PC
//! probing the Linux kernel does during boot touches dozens of ports
//! nobody emulates); MMIO has no such legacy traffic, so an unclaimed
//! MMIO address is a fault.

mod serial;

#[cfg(target_os = "linux")]
pub mod virtio;

pub use serial::{Serial, SERIAL_COM1_BASE, SERIAL_COM1_SIZE};

pub use crate::loader::protocol::TIMESLICE_MMIO_PHYS_ADDR;

use crate::hv::{Device, HvError, MmioHandler, WriteOutcome};

/// The registered devices of one VM, dispatched by address.
#[derive(Default)]
pub struct DeviceSet {
    devices: Vec<Device>,
}

impl DeviceSet {
    pub fn new() -> Self {
        Self::default()
    }

    pub fn add(&mut self, device: Device) {
        self.devices.push(device);
    }

    /// Guest IN. Unclaimed ports read as 0xff.
    pub fn port_read(&mut self, port: u16, data: &mut [u8]) {
        for dev in &mut self.devices {
            if let Device::PortIo { base, size, handler } = dev {
                if port >= *base && (port - *base) < *size {
                    handler.read(port - *base, data);
                    return;
                }
            }
        }
        data.fill(0xff);
    }

    /// Guest OUT. Unclaimed ports swallow the write.
    pub fn port_write(&mut self, port: u16, data: &[u8]) -> WriteOutcome {
        for dev in &mut self.devices {
            if let Device::PortIo { base, size, handler } = dev {
                if port >= *base && (port - *base) < *size {
                    return handler.write(port - *base, data);
                }
            }
        }
        WriteOutcome::Continue
    }

    /// Guest MMIO read; unclaimed addresses fault.
    pub fn mmio_read(&mut self, addr: u64, data: &mut [u8]) -> Result<(), HvError> {
        match self.find_mmio(addr) {
            Some((handler, offset)) => {
                handler.read(offset, data);
                Ok(())
            }
            None => Err(HvError::UnhandledIo {
                kind: "mmio read",
                addr,
            }),
        }
    }

    /// Guest MMIO write; unclaimed addresses fault.
    pub fn mmio_write(&mut self, addr: u64, data: &[u8]) -> Result<WriteOutcome, HvError> {
        match self.find_mmio(addr) {
            Some((handler, offset)) => Ok(handler.write(offset, data)),
            None => Err(HvError::UnhandledIo {
                kind: "mmio write",
                addr,
            }),
        }
    }

    fn find_mmio(&mut self, addr: u64) -> Option<(&mut Box<dyn MmioHandler>, u64)> {
        for dev in &mut self.devices {
            if let Device::Mmio { base, size, handler } = dev {
                if addr >= *base && addr - *base < *size {
                    let offset = addr - *base;
                    return Some((handler, offset));
                }
            }
        }
        None
    }

    /// Capture every device's opaque state, keyed by registration index.
    pub fn snapshot_all(&self) -> std::collections::BTreeMap<u32, Vec<u8>> {
        self.devices
            .iter()
            .enumerate()
            .map(|(i, dev)| {
                let state = match dev {
                    Device::PortIo { handler, .. } => handler.snapshot(),
                    Device::Mmio { handler, .. } => handler.snapshot(),
                };
                (i as u32, state)
            })
            .collect()
    }

    /// Restore state captured by `snapshot_all`.
    pub fn restore_all(&mut self, states: &std::collections::BTreeMap<u32, Vec<u8>>) {
        for (i, dev) in self.devices.iter_mut().enumerate() {
            if let Some(state) = states.get(&(i as u32)) {
                match dev {
                    Device::PortIo { handler, .. } => handler.restore(state),
                    Device::Mmio { handler, .. } => handler.restore(state),
                }
            }
        }
    }
}

/// A one-page MMIO region that records guest progress markers: every
/// write appends the low byte of the value, which a host-side trace
/// reader can inspect after the run. Backs the optional timeslice page
/// the guest init maps through `/dev/mem`.
pub struct TracePage {
    markers: Vec<u8>,
}

impl TracePage {
    pub fn new() -> Self {
        TracePage {
            markers: Vec::new(),
        }
    }

    pub fn markers(&self) -> &[u8] {
        &self.markers
    }
}

impl Default for TracePage {
    fn default() -> Self {
        Self::new()
    }
}

impl MmioHandler for TracePage {
    fn read(&mut self, _offset: u64, data: &mut [u8]) {
        data.fill(0);
    }

    fn write(&mut self, _offset: u64, data: &[u8]) -> WriteOutcome {
        if let Some(&b) = data.first() {
            self.markers.push(b);
        }
        WriteOutcome::Continue
    }

    fn snapshot(&self) -> Vec<u8> {
        self.markers.clone()
    }

    fn restore(&mut self, state: &[u8]) {
        self.markers = state.to_vec();
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    struct ByteSink {
        bytes: Vec<u8>,
    }

    impl MmioHandler for ByteSink {
        fn read(&mut self, offset: u64, data: &mut [u8]) {
            let b = self.bytes.get(offset as usize).copied().unwrap_or(0);
            data.fill(b);
        }

        fn write(&mut self, _offset: u64, data: &[u8]) -> WriteOutcome {
            self.bytes.extend_from_slice(data);
            WriteOutcome::Continue
        }
    }

    #[test]
    fn test_mmio_dispatch_and_fault() {
        let mut set = DeviceSet::new();
        set.add(Device::Mmio {
            base: 0xdead_0000,
            size: 0x1000,
            handler: Box::new(ByteSink { bytes: Vec::new() }),
        });

        assert!(matches!(
            set.mmio_write(0xdead_0000, b"H"),
            Ok(WriteOutcome::Continue)
        ));
        assert!(matches!(
            set.mmio_write(0xdead_0fff, b"i"),
            Ok(WriteOutcome::Continue)
        ));
        // One past the region faults.
        assert!(matches!(
            set.mmio_write(0xdead_1000, b"x"),
            Err(HvError::UnhandledIo { .. })
        ));

        let mut data = [0u8; 1];
        set.mmio_read(0xdead_0000, &mut data).unwrap();
        assert_eq!(&data, b"H");
    }

    #[test]
    fn test_unclaimed_port_reads_ff() {
        let mut set = DeviceSet::new();
        let mut data = [0u8; 4];
        set.port_read(0x80, &mut data);
        assert_eq!(data, [0xff; 4]);
        assert_eq!(set.port_write(0x80, &[1]), WriteOutcome::Continue);
    }

    #[test]
    fn test_trace_page_accumulates_markers() {
        let mut set = DeviceSet::new();
        set.add(Device::Mmio {
            base: TIMESLICE_MMIO_PHYS_ADDR,
            size: 0x1000,
            handler: Box::new(TracePage::new()),
        });
        set.mmio_write(TIMESLICE_MMIO_PHYS_ADDR, &[1]).unwrap();
        set.mmio_write(TIMESLICE_MMIO_PHYS_ADDR, &[2]).unwrap();
        let snap = set.snapshot_all();
        assert_eq!(snap[&0], vec![1, 2]);
    }
}
