//! Guest physical memory backed by the vm-memory crate.
//!
//! A thin wrapper around `vm_memory::GuestMemoryMmap`: one contiguous
//! anonymous mapping that KVM registers as the guest's RAM window. The
//! wrapper is cheap to clone (the regions are reference-counted), which is
//! how virtio devices get their own handle for walking virtqueues while
//! the VM keeps the original.
//!
//! ```text
//! Guest Virtual → Guest Physical → Host Virtual → Host Physical
//!     (kernel)       (GPA)         (vm-memory)      (hardware)
//! ```

use super::BootError;
use vm_memory::{Bytes, GuestAddress, GuestMemory as GuestMemoryTrait, GuestMemoryMmap};

/// Guest physical memory region.
#[derive(Clone)]
pub struct GuestMemory {
    inner: GuestMemoryMmap,
    size: u64,
}

impl GuestMemory {
    /// Allocate a contiguous region of `size` bytes starting at guest
    /// physical address 0.
    pub fn new(size: u64) -> Result<Self, BootError> {
        let regions = vec![(GuestAddress(0), size as usize)];
        let inner = GuestMemoryMmap::from_ranges(&regions).map_err(|e| {
            BootError::MemoryAllocation(std::io::Error::other(format!(
                "failed to create guest memory: {e}"
            )))
        })?;
        Ok(Self { inner, size })
    }

    /// `(host_virtual_address, size)` for KVM memory-slot registration.
    ///
    /// The pointer is valid while this memory (or any clone) exists.
    pub fn as_raw_parts(&self) -> (u64, u64) {
        let region = self.inner.iter().next().expect("memory has no regions");
        (region.as_ptr() as u64, self.size)
    }

    /// Total size in bytes.
    pub fn size(&self) -> u64 {
        self.size
    }

    /// Write bytes at a guest physical address.
    pub fn write(&self, addr: u64, data: &[u8]) -> Result<(), BootError> {
        self.inner
            .write_slice(data, GuestAddress(addr))
            .map_err(|e| BootError::MemoryAccess {
                addr,
                detail: e.to_string(),
            })
    }

    /// Read bytes from a guest physical address.
    pub fn read(&self, addr: u64, data: &mut [u8]) -> Result<(), BootError> {
        self.inner
            .read_slice(data, GuestAddress(addr))
            .map_err(|e| BootError::MemoryAccess {
                addr,
                detail: e.to_string(),
            })
    }

    pub fn write_u8(&self, addr: u64, value: u8) -> Result<(), BootError> {
        self.write(addr, &[value])
    }

    pub fn write_u32(&self, addr: u64, value: u32) -> Result<(), BootError> {
        self.write(addr, &value.to_le_bytes())
    }

    pub fn write_u64(&self, addr: u64, value: u64) -> Result<(), BootError> {
        self.write(addr, &value.to_le_bytes())
    }

    pub fn read_u32(&self, addr: u64) -> Result<u32, BootError> {
        let mut buf = [0u8; 4];
        self.read(addr, &mut buf)?;
        Ok(u32::from_le_bytes(buf))
    }

    pub fn read_u64(&self, addr: u64) -> Result<u64, BootError> {
        let mut buf = [0u8; 8];
        self.read(addr, &mut buf)?;
        Ok(u64::from_le_bytes(buf))
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    fn read_vec(mem: &GuestMemory, addr: u64, len: usize) -> Vec<u8> {
        let mut data = vec![0u8; len];
        mem.read(addr, &mut data).unwrap();
        data
    }

    #[test]
    fn test_write_read() {
        let mem = GuestMemory::new(4096).unwrap();
        mem.write(0, &[1, 2, 3, 4]).unwrap();
        assert_eq!(read_vec(&mem, 0, 4), vec![1, 2, 3, 4]);
    }

    #[test]
    fn test_scalar_helpers_little_endian() {
        let mem = GuestMemory::new(4096).unwrap();
        mem.write_u32(100, 0x12345678).unwrap();
        assert_eq!(read_vec(&mem, 100, 4), vec![0x78, 0x56, 0x34, 0x12]);
        assert_eq!(mem.read_u32(100).unwrap(), 0x12345678);

        mem.write_u64(200, 0x123456789abcdef0).unwrap();
        assert_eq!(mem.read_u64(200).unwrap(), 0x123456789abcdef0);
    }

    #[test]
    fn test_out_of_bounds() {
        let mem = GuestMemory::new(100).unwrap();
        assert!(mem.write(99, &[1, 2]).is_err());
        let mut buf = [0u8; 2];
        assert!(mem.read(99, &mut buf).is_err());
    }

    #[test]
    fn test_clone_shares_backing() {
        let mem = GuestMemory::new(4096).unwrap();
        let clone = mem.clone();
        mem.write(0, b"shared").unwrap();
        assert_eq!(read_vec(&clone, 0, 6), b"shared".to_vec());
        assert_eq!(mem.as_raw_parts(), clone.as_raw_parts());
    }
}
