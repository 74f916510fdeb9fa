//! Virtio device infrastructure (virtio-mmio transport, v2).
//!
//! The guest discovers devices from the kernel command line
//! (`virtio_mmio.device=4K@0xd0000000:5`), negotiates features and queue
//! addresses through the MMIO register window, and exchanges buffers
//! through virtqueues in guest RAM:
//!
//! ```text
//! Guest driver                         VMM device
//!   write descriptors ──────────────►  read chain
//!   update avail ring                  process buffers
//!   write QUEUE_NOTIFY ─────────────►  write used ring, raise IRQ
//! ```
//!
//! Reference: <https://docs.oasis-open.org/virtio/virtio/v1.1/virtio-v1.1.html>

pub mod vsock;

use crate::boot::GuestMemory;

// MMIO register offsets (virtio-mmio v2).
pub const MMIO_MAGIC_VALUE: u64 = 0x000;
pub const MMIO_VERSION: u64 = 0x004;
pub const MMIO_DEVICE_ID: u64 = 0x008;
pub const MMIO_VENDOR_ID: u64 = 0x00c;
pub const MMIO_DEVICE_FEATURES: u64 = 0x010;
pub const MMIO_DEVICE_FEATURES_SEL: u64 = 0x014;
pub const MMIO_DRIVER_FEATURES: u64 = 0x020;
pub const MMIO_DRIVER_FEATURES_SEL: u64 = 0x024;
pub const MMIO_QUEUE_SEL: u64 = 0x030;
pub const MMIO_QUEUE_NUM_MAX: u64 = 0x034;
pub const MMIO_QUEUE_NUM: u64 = 0x038;
pub const MMIO_QUEUE_READY: u64 = 0x044;
pub const MMIO_QUEUE_NOTIFY: u64 = 0x050;
pub const MMIO_INTERRUPT_STATUS: u64 = 0x060;
pub const MMIO_INTERRUPT_ACK: u64 = 0x064;
pub const MMIO_STATUS: u64 = 0x070;
pub const MMIO_QUEUE_DESC_LOW: u64 = 0x080;
pub const MMIO_QUEUE_DESC_HIGH: u64 = 0x084;
pub const MMIO_QUEUE_DRIVER_LOW: u64 = 0x090;
pub const MMIO_QUEUE_DRIVER_HIGH: u64 = 0x094;
pub const MMIO_QUEUE_DEVICE_LOW: u64 = 0x0a0;
pub const MMIO_QUEUE_DEVICE_HIGH: u64 = 0x0a4;
/// Device-specific configuration space starts here.
pub const MMIO_CONFIG: u64 = 0x100;

/// Magic value "virt".
pub const VIRTIO_MMIO_MAGIC: u32 = 0x7472_6976;
/// Transport version 2 (modern).
pub const VIRTIO_MMIO_VERSION: u32 = 2;
pub const VIRTIO_VENDOR_ID: u32 = 0;

// Device status bits.
pub const STATUS_ACKNOWLEDGE: u32 = 1;
pub const STATUS_DRIVER: u32 = 2;
pub const STATUS_DRIVER_OK: u32 = 4;
pub const STATUS_FEATURES_OK: u32 = 8;

/// VIRTIO_F_VERSION_1, bit 32: bit 0 of the high feature word.
pub const VIRTIO_F_VERSION_1_HI: u32 = 1;

/// Interrupt-status bit: used ring was updated.
pub const INT_USED_RING: u32 = 1;

/// Largest queue size offered to drivers.
pub const MAX_QUEUE_SIZE: u16 = 256;

pub const VIRTQ_DESC_F_NEXT: u16 = 1;
pub const VIRTQ_DESC_F_WRITE: u16 = 2;

/// A virtqueue descriptor: one guest buffer, optionally chained.
#[derive(Debug, Clone, Copy, Default)]
pub struct VirtqDesc {
    pub addr: u64,
    pub len: u32,
    pub flags: u16,
    pub next: u16,
}

impl VirtqDesc {
    pub const SIZE: usize = 16;

    pub fn read_from(memory: &GuestMemory, addr: u64) -> Option<Self> {
        let mut buf = [0u8; Self::SIZE];
        memory.read(addr, &mut buf).ok()?;
        Some(Self {
            addr: u64::from_le_bytes(buf[0..8].try_into().unwrap()),
            len: u32::from_le_bytes(buf[8..12].try_into().unwrap()),
            flags: u16::from_le_bytes(buf[12..14].try_into().unwrap()),
            next: u16::from_le_bytes(buf[14..16].try_into().unwrap()),
        })
    }

    pub fn is_write_only(&self) -> bool {
        self.flags & VIRTQ_DESC_F_WRITE != 0
    }

    pub fn has_next(&self) -> bool {
        self.flags & VIRTQ_DESC_F_NEXT != 0
    }
}

/// One virtqueue: descriptor table + avail ring + used ring, all in
/// guest memory; the device tracks only its progress cursor.
#[derive(Debug, Default, Clone)]
pub struct Virtqueue {
    pub size: u16,
    pub ready: bool,
    pub desc_table: u64,
    pub avail_ring: u64,
    pub used_ring: u64,
    pub last_avail_idx: u16,
}

impl Virtqueue {
    pub fn new() -> Self {
        Self::default()
    }

    /// Pop the next available descriptor-chain head, if any.
    pub fn pop_avail(&mut self, memory: &GuestMemory) -> Option<u16> {
        if !self.ready || self.size == 0 {
            return None;
        }

        // avail layout: flags u16, idx u16, ring[size] u16.
        let avail_idx_addr = self.avail_ring + 2;
        let mut idx_buf = [0u8; 2];
        memory.read(avail_idx_addr, &mut idx_buf).ok()?;
        let avail_idx = u16::from_le_bytes(idx_buf);
        if avail_idx == self.last_avail_idx {
            return None;
        }

        let ring_addr = self.avail_ring + 4 + (self.last_avail_idx % self.size) as u64 * 2;
        let mut desc_buf = [0u8; 2];
        memory.read(ring_addr, &mut desc_buf).ok()?;
        self.last_avail_idx = self.last_avail_idx.wrapping_add(1);
        Some(u16::from_le_bytes(desc_buf))
    }

    /// Return a completed chain to the used ring.
    pub fn push_used(&self, memory: &GuestMemory, desc_idx: u16, len: u32) -> Option<()> {
        // used layout: flags u16, idx u16, ring[size] × {id u32, len u32}.
        let used_idx_addr = self.used_ring + 2;
        let mut idx_buf = [0u8; 2];
        memory.read(used_idx_addr, &mut idx_buf).ok()?;
        let used_idx = u16::from_le_bytes(idx_buf);

        let elem_addr = self.used_ring + 4 + (used_idx % self.size) as u64 * 8;
        memory
            .write(elem_addr, &(desc_idx as u32).to_le_bytes())
            .ok()?;
        memory.write(elem_addr + 4, &len.to_le_bytes()).ok()?;
        memory
            .write(used_idx_addr, &used_idx.wrapping_add(1).to_le_bytes())
            .ok()?;
        Some(())
    }

    pub fn read_desc(&self, memory: &GuestMemory, idx: u16) -> Option<VirtqDesc> {
        if idx >= self.size {
            return None;
        }
        VirtqDesc::read_from(memory, self.desc_table + idx as u64 * VirtqDesc::SIZE as u64)
    }
}

/// The register-file state every virtio-mmio device shares; devices embed
/// this and add their queues on top.
#[derive(Debug, Default)]
pub struct MmioTransport {
    pub device_id: u32,
    pub device_features_lo: u32,
    pub device_features_hi: u32,
    pub driver_features_lo: u32,
    pub driver_features_hi: u32,
    pub features_sel: u32,
    pub driver_features_sel: u32,
    pub queue_sel: u32,
    pub status: u32,
    pub interrupt_status: u32,
}

impl MmioTransport {
    pub fn new(device_id: u32, features_lo: u32) -> Self {
        MmioTransport {
            device_id,
            device_features_lo: features_lo,
            device_features_hi: VIRTIO_F_VERSION_1_HI,
            ..Default::default()
        }
    }

    pub fn driver_ok(&self) -> bool {
        self.status & STATUS_DRIVER_OK != 0
    }

    /// Handle a transport-register read; device-specific registers and
    /// config space are the caller's problem.
    pub fn read(&self, offset: u64, queues: &[Virtqueue]) -> Option<u32> {
        Some(match offset {
            MMIO_MAGIC_VALUE => VIRTIO_MMIO_MAGIC,
            MMIO_VERSION => VIRTIO_MMIO_VERSION,
            MMIO_DEVICE_ID => self.device_id,
            MMIO_VENDOR_ID => VIRTIO_VENDOR_ID,
            MMIO_DEVICE_FEATURES => match self.features_sel {
                0 => self.device_features_lo,
                1 => self.device_features_hi,
                _ => 0,
            },
            MMIO_QUEUE_NUM_MAX => MAX_QUEUE_SIZE as u32,
            MMIO_QUEUE_READY => queues
                .get(self.queue_sel as usize)
                .map_or(0, |q| q.ready as u32),
            MMIO_INTERRUPT_STATUS => self.interrupt_status,
            MMIO_STATUS => self.status,
            _ => return None,
        })
    }

    /// Handle a transport-register write. Returns the notified queue
    /// index when the driver rang a doorbell.
    pub fn write(&mut self, offset: u64, value: u32, queues: &mut [Virtqueue]) -> Option<u32> {
        match offset {
            MMIO_DEVICE_FEATURES_SEL => self.features_sel = value,
            MMIO_DRIVER_FEATURES_SEL => self.driver_features_sel = value,
            MMIO_DRIVER_FEATURES => match self.driver_features_sel {
                0 => self.driver_features_lo = value,
                1 => self.driver_features_hi = value,
                _ => {}
            },
            MMIO_QUEUE_SEL => self.queue_sel = value,
            MMIO_QUEUE_NUM => {
                if let Some(q) = queues.get_mut(self.queue_sel as usize) {
                    q.size = (value as u16).min(MAX_QUEUE_SIZE);
                }
            }
            MMIO_QUEUE_READY => {
                if let Some(q) = queues.get_mut(self.queue_sel as usize) {
                    q.ready = value == 1;
                }
            }
            MMIO_QUEUE_NOTIFY => return Some(value),
            MMIO_INTERRUPT_ACK => self.interrupt_status &= !value,
            MMIO_STATUS => {
                if value == 0 {
                    // Device reset.
                    self.interrupt_status = 0;
                    for q in queues.iter_mut() {
                        *q = Virtqueue::new();
                    }
                }
                self.status = value;
            }
            MMIO_QUEUE_DESC_LOW => set_lo(&mut queues[self.queue_sel as usize].desc_table, value),
            MMIO_QUEUE_DESC_HIGH => set_hi(&mut queues[self.queue_sel as usize].desc_table, value),
            MMIO_QUEUE_DRIVER_LOW => set_lo(&mut queues[self.queue_sel as usize].avail_ring, value),
            MMIO_QUEUE_DRIVER_HIGH => set_hi(&mut queues[self.queue_sel as usize].avail_ring, value),
            MMIO_QUEUE_DEVICE_LOW => set_lo(&mut queues[self.queue_sel as usize].used_ring, value),
            MMIO_QUEUE_DEVICE_HIGH => set_hi(&mut queues[self.queue_sel as usize].used_ring, value),
            _ => {}
        }
        None
    }
}

fn set_lo(field: &mut u64, value: u32) {
    *field = (*field & 0xffff_ffff_0000_0000) | value as u64;
}

fn set_hi(field: &mut u64, value: u32) {
    *field = (*field & 0x0000_0000_ffff_ffff) | (value as u64) << 32;
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_transport_identity_registers() {
        let t = MmioTransport::new(19, 0);
        let queues = [Virtqueue::new()];
        assert_eq!(t.read(MMIO_MAGIC_VALUE, &queues), Some(VIRTIO_MMIO_MAGIC));
        assert_eq!(t.read(MMIO_VERSION, &queues), Some(2));
        assert_eq!(t.read(MMIO_DEVICE_ID, &queues), Some(19));
    }

    #[test]
    fn test_feature_words_select() {
        let t = MmioTransport::new(19, 0xabcd);
        let mut t = t;
        let mut queues = [Virtqueue::new()];
        assert_eq!(t.read(MMIO_DEVICE_FEATURES, &queues), Some(0xabcd));
        t.write(MMIO_DEVICE_FEATURES_SEL, 1, &mut queues);
        assert_eq!(
            t.read(MMIO_DEVICE_FEATURES, &queues),
            Some(VIRTIO_F_VERSION_1_HI)
        );
    }

    #[test]
    fn test_queue_address_split_writes() {
        let mut t = MmioTransport::new(19, 0);
        let mut queues = [Virtqueue::new()];
        t.write(MMIO_QUEUE_DESC_LOW, 0x1000, &mut queues);
        t.write(MMIO_QUEUE_DESC_HIGH, 0x1, &mut queues);
        assert_eq!(queues[0].desc_table, 0x1_0000_1000);
    }

    #[test]
    fn test_notify_returns_queue_index() {
        let mut t = MmioTransport::new(19, 0);
        let mut queues = [Virtqueue::new(), Virtqueue::new()];
        assert_eq!(t.write(MMIO_QUEUE_NOTIFY, 1, &mut queues), Some(1));
        assert_eq!(t.write(MMIO_QUEUE_SEL, 0, &mut queues), None);
    }

    #[test]
    fn test_reset_clears_queues() {
        let mut t = MmioTransport::new(19, 0);
        let mut queues = [Virtqueue::new()];
        t.write(MMIO_QUEUE_NUM, 64, &mut queues);
        t.write(MMIO_QUEUE_READY, 1, &mut queues);
        assert!(queues[0].ready);
        t.write(MMIO_STATUS, 0, &mut queues);
        assert!(!queues[0].ready);
        assert_eq!(queues[0].size, 0);
    }

    #[test]
    fn test_virtqueue_pop_and_push() {
        let memory = GuestMemory::new(64 << 10).unwrap();
        let mut q = Virtqueue {
            size: 4,
            ready: true,
            desc_table: 0x100,
            avail_ring: 0x200,
            used_ring: 0x300,
            last_avail_idx: 0,
        };

        // Guest: descriptor 2 available.
        memory.write(0x200 + 4, &2u16.to_le_bytes()).unwrap(); // ring[0]
        memory.write(0x200 + 2, &1u16.to_le_bytes()).unwrap(); // idx = 1
        assert_eq!(q.pop_avail(&memory), Some(2));
        assert_eq!(q.pop_avail(&memory), None);

        // Device: complete it with 8 bytes written.
        q.push_used(&memory, 2, 8).unwrap();
        assert_eq!(memory.read_u32(0x300 + 4).unwrap(), 2);
        assert_eq!(memory.read_u32(0x300 + 8).unwrap(), 8);
        let mut idx = [0u8; 2];
        memory.read(0x300 + 2, &mut idx).unwrap();
        assert_eq!(u16::from_le_bytes(idx), 1);
    }
}
