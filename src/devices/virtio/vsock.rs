//! Virtio-vsock device and in-process host endpoint.
//!
//! Gives the guest an `AF_VSOCK` view of the host: the guest init
//! connects to CID 2 on the control port, and the host side of that
//! stream is handed out here as a blocking [`VsockStream`] — no vhost,
//! no host sockets, the stream terminates inside the VMM process.
//!
//! ```text
//!  guest init                 VsockDevice               host session
//!  connect(CID 2) ──REQUEST──► listener match ──────────► accept()
//!  write(fd)      ──RW───────► g2h buffer     ──────────► read()
//!  read(fd)       ◄──RW─────── h2g buffer     ◄────────── write()
//! ```
//!
//! The device side implements the virtio-vsock stream protocol over the
//! three standard queues (rx 0, tx 1, event 2) with credit accounting;
//! the host side shares the same mutex-guarded core, so host writes can
//! fill the guest's RX ring and pulse the interrupt line directly from
//! the session thread while a vCPU is blocked in `read(2)`.

use super::{MmioTransport, Virtqueue, MMIO_CONFIG};
use crate::boot::GuestMemory;
use crate::hv::{IrqLine, MmioHandler, WriteOutcome};
use std::collections::{BTreeMap, VecDeque};
use std::io;
use std::sync::{Arc, Condvar, Mutex};

/// Virtio device id for vsock.
pub const VSOCK_DEVICE_ID: u32 = 19;

/// The well-known CID of the host.
pub const HOST_CID: u64 = 2;

/// Default CID assigned to the guest.
pub const GUEST_CID: u64 = 3;

/// Receive-buffer space we advertise to the guest per connection.
const BUF_ALLOC: u32 = 256 * 1024;

/// vsock packet header, 44 bytes little-endian on the wire.
const HDR_SIZE: usize = 44;

/// Stream socket type.
const TYPE_STREAM: u16 = 1;

mod op {
    pub const REQUEST: u16 = 1;
    pub const RESPONSE: u16 = 2;
    pub const RST: u16 = 3;
    pub const SHUTDOWN: u16 = 4;
    pub const RW: u16 = 5;
    pub const CREDIT_UPDATE: u16 = 6;
    pub const CREDIT_REQUEST: u16 = 7;
}

#[derive(Debug, Clone, Copy, Default)]
struct PacketHeader {
    src_cid: u64,
    dst_cid: u64,
    src_port: u32,
    dst_port: u32,
    len: u32,
    type_: u16,
    op: u16,
    flags: u32,
    buf_alloc: u32,
    fwd_cnt: u32,
}

impl PacketHeader {
    fn parse(buf: &[u8]) -> Option<Self> {
        if buf.len() < HDR_SIZE {
            return None;
        }
        Some(PacketHeader {
            src_cid: u64::from_le_bytes(buf[0..8].try_into().unwrap()),
            dst_cid: u64::from_le_bytes(buf[8..16].try_into().unwrap()),
            src_port: u32::from_le_bytes(buf[16..20].try_into().unwrap()),
            dst_port: u32::from_le_bytes(buf[20..24].try_into().unwrap()),
            len: u32::from_le_bytes(buf[24..28].try_into().unwrap()),
            type_: u16::from_le_bytes(buf[28..30].try_into().unwrap()),
            op: u16::from_le_bytes(buf[30..32].try_into().unwrap()),
            flags: u32::from_le_bytes(buf[32..36].try_into().unwrap()),
            buf_alloc: u32::from_le_bytes(buf[36..40].try_into().unwrap()),
            fwd_cnt: u32::from_le_bytes(buf[40..44].try_into().unwrap()),
        })
    }

    fn to_bytes(self) -> [u8; HDR_SIZE] {
        let mut buf = [0u8; HDR_SIZE];
        buf[0..8].copy_from_slice(&self.src_cid.to_le_bytes());
        buf[8..16].copy_from_slice(&self.dst_cid.to_le_bytes());
        buf[16..20].copy_from_slice(&self.src_port.to_le_bytes());
        buf[20..24].copy_from_slice(&self.dst_port.to_le_bytes());
        buf[24..28].copy_from_slice(&self.len.to_le_bytes());
        buf[28..30].copy_from_slice(&self.type_.to_le_bytes());
        buf[30..32].copy_from_slice(&self.op.to_le_bytes());
        buf[32..36].copy_from_slice(&self.flags.to_le_bytes());
        buf[36..40].copy_from_slice(&self.buf_alloc.to_le_bytes());
        buf[40..44].copy_from_slice(&self.fwd_cnt.to_le_bytes());
        buf
    }
}

/// Connection key: (guest port, host port).
type ConnKey = (u32, u32);

#[derive(Debug, PartialEq, Eq, Clone, Copy)]
enum ConnState {
    Established,
    Closed,
}

#[derive(Debug)]
struct Connection {
    state: ConnState,
    /// Guest-to-host payload waiting for the host to read.
    g2h: VecDeque<u8>,
    /// Host-to-guest payload waiting for RX ring space and credit.
    h2g: VecDeque<u8>,
    /// Bytes we have received from the guest (our fwd_cnt).
    fwd_cnt: u32,
    /// Bytes we have transmitted to the guest.
    tx_cnt: u32,
    /// Last credit advertisement from the guest.
    peer_buf_alloc: u32,
    peer_fwd_cnt: u32,
}

impl Connection {
    fn new(hdr: &PacketHeader) -> Self {
        Connection {
            state: ConnState::Established,
            g2h: VecDeque::new(),
            h2g: VecDeque::new(),
            fwd_cnt: 0,
            tx_cnt: 0,
            peer_buf_alloc: hdr.buf_alloc,
            peer_fwd_cnt: hdr.fwd_cnt,
        }
    }

    /// How many bytes the guest can still accept.
    fn peer_credit(&self) -> u32 {
        self.peer_buf_alloc
            .saturating_sub(self.tx_cnt.wrapping_sub(self.peer_fwd_cnt))
    }
}

struct VsockCore {
    transport: MmioTransport,
    queues: [Virtqueue; 3],
    memory: GuestMemory,
    irq: IrqLine,
    guest_cid: u64,
    /// Ports the host listens on, with connections not yet accepted.
    listeners: BTreeMap<u32, VecDeque<ConnKey>>,
    conns: BTreeMap<ConnKey, Connection>,
}

impl VsockCore {
    /// Queue a control/data packet for delivery to the guest. Returns
    /// false when no RX descriptor was available.
    fn send_to_guest(&mut self, hdr: PacketHeader, payload: &[u8]) -> bool {
        let queue = &mut self.queues[0];
        let Some(head) = queue.pop_avail(&self.memory) else {
            return false;
        };

        let mut bytes = Vec::with_capacity(HDR_SIZE + payload.len());
        bytes.extend_from_slice(&hdr.to_bytes());
        bytes.extend_from_slice(payload);

        // Scatter across the writable chain.
        let mut written = 0usize;
        let mut idx = head;
        loop {
            let Some(desc) = queue.read_desc(&self.memory, idx) else {
                break;
            };
            if desc.is_write_only() && written < bytes.len() {
                let take = (bytes.len() - written).min(desc.len as usize);
                if self
                    .memory
                    .write(desc.addr, &bytes[written..written + take])
                    .is_err()
                {
                    break;
                }
                written += take;
            }
            if !desc.has_next() {
                break;
            }
            idx = desc.next;
        }

        queue.push_used(&self.memory, head, written as u32);
        self.transport.interrupt_status |= super::INT_USED_RING;
        true
    }

    fn credit_header(&self, key: ConnKey, conn: &Connection, op_code: u16, len: u32) -> PacketHeader {
        PacketHeader {
            src_cid: HOST_CID,
            dst_cid: self.guest_cid,
            src_port: key.1,
            dst_port: key.0,
            len,
            type_: TYPE_STREAM,
            op: op_code,
            flags: 0,
            buf_alloc: BUF_ALLOC,
            fwd_cnt: conn.fwd_cnt,
        }
    }

    /// Move pending host-to-guest bytes into the RX ring, respecting the
    /// guest's credit.
    fn drain_h2g(&mut self) {
        let keys: Vec<ConnKey> = self.conns.keys().copied().collect();
        for key in keys {
            loop {
                let Some(conn) = self.conns.get_mut(&key) else {
                    break;
                };
                if conn.state != ConnState::Established || conn.h2g.is_empty() {
                    break;
                }
                let credit = conn.peer_credit() as usize;
                if credit == 0 {
                    break;
                }
                // One RX buffer per packet; 4 KiB keeps chunks within any
                // ring the guest posts.
                let take = conn.h2g.len().min(credit).min(4096);
                let chunk: Vec<u8> = conn.h2g.iter().take(take).copied().collect();
                let hdr = {
                    let conn = &self.conns[&key];
                    self.credit_header(key, conn, op::RW, take as u32)
                };
                if !self.send_to_guest(hdr, &chunk) {
                    break;
                }
                let conn = self.conns.get_mut(&key).expect("conn vanished");
                conn.h2g.drain(..take);
                conn.tx_cnt = conn.tx_cnt.wrapping_add(take as u32);
            }
        }
    }

    /// Handle one guest-to-device packet from the TX queue.
    fn handle_tx_packet(&mut self, hdr: PacketHeader, payload: &[u8]) {
        if hdr.type_ != TYPE_STREAM || hdr.dst_cid != HOST_CID {
            return;
        }
        let key: ConnKey = (hdr.src_port, hdr.dst_port);

        match hdr.op {
            op::REQUEST => {
                if self.listeners.contains_key(&hdr.dst_port) {
                    let conn = Connection::new(&hdr);
                    let resp = self.credit_header(key, &conn, op::RESPONSE, 0);
                    self.conns.insert(key, conn);
                    self.listeners
                        .get_mut(&hdr.dst_port)
                        .expect("checked above")
                        .push_back(key);
                    self.send_to_guest(resp, &[]);
                } else {
                    let conn = Connection::new(&hdr);
                    let rst = self.credit_header(key, &conn, op::RST, 0);
                    self.send_to_guest(rst, &[]);
                }
            }
            op::RW => {
                if let Some(conn) = self.conns.get_mut(&key) {
                    conn.peer_buf_alloc = hdr.buf_alloc;
                    conn.peer_fwd_cnt = hdr.fwd_cnt;
                    conn.g2h.extend(payload.iter().copied());
                    conn.fwd_cnt = conn.fwd_cnt.wrapping_add(payload.len() as u32);
                    // Keep the guest's view of our receive window fresh.
                    let update = {
                        let conn = &self.conns[&key];
                        self.credit_header(key, conn, op::CREDIT_UPDATE, 0)
                    };
                    self.send_to_guest(update, &[]);
                }
            }
            op::CREDIT_UPDATE => {
                if let Some(conn) = self.conns.get_mut(&key) {
                    conn.peer_buf_alloc = hdr.buf_alloc;
                    conn.peer_fwd_cnt = hdr.fwd_cnt;
                }
            }
            op::CREDIT_REQUEST => {
                if self.conns.contains_key(&key) {
                    let update = {
                        let conn = &self.conns[&key];
                        self.credit_header(key, conn, op::CREDIT_UPDATE, 0)
                    };
                    self.send_to_guest(update, &[]);
                }
            }
            op::SHUTDOWN | op::RST => {
                if let Some(conn) = self.conns.get_mut(&key) {
                    conn.state = ConnState::Closed;
                }
                if hdr.op == op::SHUTDOWN {
                    let rst = PacketHeader {
                        src_cid: HOST_CID,
                        dst_cid: self.guest_cid,
                        src_port: hdr.dst_port,
                        dst_port: hdr.src_port,
                        type_: TYPE_STREAM,
                        op: op::RST,
                        buf_alloc: BUF_ALLOC,
                        ..Default::default()
                    };
                    self.send_to_guest(rst, &[]);
                }
            }
            _ => {}
        }
    }

    /// Drain the TX queue after a doorbell.
    fn process_tx(&mut self) {
        loop {
            let memory = self.memory.clone();
            let Some(head) = self.queues[1].pop_avail(&memory) else {
                break;
            };

            // Gather the readable chain.
            let mut bytes = Vec::new();
            let mut idx = head;
            loop {
                let Some(desc) = self.queues[1].read_desc(&memory, idx) else {
                    break;
                };
                if !desc.is_write_only() {
                    let mut buf = vec![0u8; desc.len as usize];
                    if memory.read(desc.addr, &mut buf).is_ok() {
                        bytes.extend_from_slice(&buf);
                    }
                }
                if !desc.has_next() {
                    break;
                }
                idx = desc.next;
            }

            self.queues[1].push_used(&memory, head, 0);
            self.transport.interrupt_status |= super::INT_USED_RING;

            if let Some(hdr) = PacketHeader::parse(&bytes) {
                let payload_end = HDR_SIZE + hdr.len as usize;
                let payload = &bytes[HDR_SIZE..payload_end.min(bytes.len())];
                self.handle_tx_packet(hdr, payload);
            }
        }
    }

    /// Mark every connection closed (VM shutdown path).
    fn close_all(&mut self) {
        for conn in self.conns.values_mut() {
            conn.state = ConnState::Closed;
        }
    }
}

type SharedCore = Arc<(Mutex<VsockCore>, Condvar)>;

/// The MMIO face of the vsock device, registered with the VM.
pub struct VsockDevice {
    core: SharedCore,
}

/// The host side: listeners and streams sharing the same core.
#[derive(Clone)]
pub struct VsockHost {
    core: SharedCore,
}

/// Create the paired device and host endpoint.
pub fn vsock_pair(memory: GuestMemory, irq: IrqLine, guest_cid: u64) -> (VsockDevice, VsockHost) {
    let core = Arc::new((
        Mutex::new(VsockCore {
            transport: MmioTransport::new(VSOCK_DEVICE_ID, 0),
            queues: [Virtqueue::new(), Virtqueue::new(), Virtqueue::new()],
            memory,
            irq,
            guest_cid,
            listeners: BTreeMap::new(),
            conns: BTreeMap::new(),
        }),
        Condvar::new(),
    ));
    (
        VsockDevice { core: core.clone() },
        VsockHost { core },
    )
}

impl MmioHandler for VsockDevice {
    fn read(&mut self, offset: u64, data: &mut [u8]) {
        let (lock, _) = &*self.core;
        let core = match lock.lock() {
            Ok(core) => core,
            Err(_) => return,
        };

        let value: u64 = if offset >= MMIO_CONFIG {
            // Config space: guest_cid at offset 0. A 4-byte access takes
            // the low half by truncation, offset 4 reads the high half.
            match offset - MMIO_CONFIG {
                0 => core.guest_cid,
                4 => core.guest_cid >> 32,
                _ => 0,
            }
        } else {
            core.transport.read(offset, &core.queues).unwrap_or(0) as u64
        };

        let bytes = value.to_le_bytes();
        let n = data.len().min(8);
        data[..n].copy_from_slice(&bytes[..n]);
    }

    fn write(&mut self, offset: u64, data: &[u8]) -> WriteOutcome {
        let mut buf = [0u8; 4];
        let n = data.len().min(4);
        buf[..n].copy_from_slice(&data[..n]);
        let value = u32::from_le_bytes(buf);

        let (lock, cvar) = &*self.core;
        let Ok(mut core) = lock.lock() else {
            return WriteOutcome::Continue;
        };

        let notified = {
            let core = &mut *core;
            core.transport.write(offset, value, &mut core.queues)
        };
        if let Some(queue) = notified {
            match queue {
                0 => core.drain_h2g(),  // fresh RX buffers
                1 => {
                    core.process_tx();
                    core.drain_h2g();
                }
                _ => {}
            }
            if core.transport.interrupt_status != 0 {
                core.irq.pulse();
            }
            cvar.notify_all();
        }
        WriteOutcome::Continue
    }
}

impl VsockHost {
    /// Start listening on a port. Guest connection requests to it will
    /// queue for [`VsockHost::accept`].
    pub fn listen(&self, port: u32) {
        let (lock, _) = &*self.core;
        if let Ok(mut core) = lock.lock() {
            core.listeners.entry(port).or_default();
        }
    }

    /// Block until a guest connection to `port` is established.
    pub fn accept(&self, port: u32) -> io::Result<VsockStream> {
        let (lock, cvar) = &*self.core;
        let mut core = lock
            .lock()
            .map_err(|_| io::Error::other("vsock core poisoned"))?;
        loop {
            if let Some(key) = core
                .listeners
                .get_mut(&port)
                .and_then(|pending| pending.pop_front())
            {
                return Ok(VsockStream {
                    core: self.core.clone(),
                    key,
                });
            }
            core = cvar
                .wait(core)
                .map_err(|_| io::Error::other("vsock core poisoned"))?;
        }
    }

    /// [`VsockHost::accept`] with a deadline, for callers that cannot
    /// block forever on a guest that may fail to boot.
    pub fn accept_timeout(
        &self,
        port: u32,
        timeout: std::time::Duration,
    ) -> io::Result<VsockStream> {
        let deadline = std::time::Instant::now() + timeout;
        let (lock, cvar) = &*self.core;
        let mut core = lock
            .lock()
            .map_err(|_| io::Error::other("vsock core poisoned"))?;
        loop {
            if let Some(key) = core
                .listeners
                .get_mut(&port)
                .and_then(|pending| pending.pop_front())
            {
                return Ok(VsockStream {
                    core: self.core.clone(),
                    key,
                });
            }
            let now = std::time::Instant::now();
            if now >= deadline {
                return Err(io::Error::new(
                    io::ErrorKind::TimedOut,
                    "guest never connected",
                ));
            }
            let (guard, _) = cvar
                .wait_timeout(core, deadline - now)
                .map_err(|_| io::Error::other("vsock core poisoned"))?;
            core = guard;
        }
    }

    /// Close every connection and wake all blocked readers; used at VM
    /// teardown so session threads unblock.
    pub fn shutdown(&self) {
        let (lock, cvar) = &*self.core;
        if let Ok(mut core) = lock.lock() {
            core.close_all();
        }
        cvar.notify_all();
    }
}

/// One established guest connection, stream semantics. `read` blocks on
/// guest data; `write` feeds the guest's RX ring directly and raises the
/// device interrupt.
pub struct VsockStream {
    core: SharedCore,
    key: ConnKey,
}

impl io::Read for VsockStream {
    fn read(&mut self, buf: &mut [u8]) -> io::Result<usize> {
        let (lock, cvar) = &*self.core;
        let mut core = lock
            .lock()
            .map_err(|_| io::Error::other("vsock core poisoned"))?;
        loop {
            let Some(conn) = core.conns.get_mut(&self.key) else {
                return Ok(0);
            };
            if !conn.g2h.is_empty() {
                let n = buf.len().min(conn.g2h.len());
                for (i, b) in conn.g2h.drain(..n).enumerate() {
                    buf[i] = b;
                }
                return Ok(n);
            }
            if conn.state == ConnState::Closed {
                return Ok(0);
            }
            core = cvar
                .wait(core)
                .map_err(|_| io::Error::other("vsock core poisoned"))?;
        }
    }
}

impl io::Write for VsockStream {
    fn write(&mut self, buf: &[u8]) -> io::Result<usize> {
        let (lock, cvar) = &*self.core;
        let mut core = lock
            .lock()
            .map_err(|_| io::Error::other("vsock core poisoned"))?;
        {
            let Some(conn) = core.conns.get_mut(&self.key) else {
                return Err(io::Error::new(
                    io::ErrorKind::NotConnected,
                    "vsock connection is gone",
                ));
            };
            if conn.state == ConnState::Closed {
                return Err(io::Error::new(
                    io::ErrorKind::BrokenPipe,
                    "vsock connection closed by guest",
                ));
            }
            conn.h2g.extend(buf.iter().copied());
        }
        core.drain_h2g();
        if core.transport.interrupt_status != 0 {
            core.irq.pulse();
        }
        cvar.notify_all();
        Ok(buf.len())
    }

    fn flush(&mut self) -> io::Result<()> {
        Ok(())
    }
}

#[cfg(test)]
mod tests {
    use super::super::*;
    use super::*;
    use crate::hv::IrqSink;
    use std::io::{Read, Write};
    use std::sync::atomic::{AtomicUsize, Ordering};

    struct CountingSink(AtomicUsize);
    impl IrqSink for CountingSink {
        fn set_irq(&self, _gsi: u32, high: bool) {
            if high {
                self.0.fetch_add(1, Ordering::SeqCst);
            }
        }
    }

    /// Drives the device the way the guest's virtio-vsock driver would,
    /// with rings placed by hand in guest memory.
    struct GuestDriverSim {
        memory: GuestMemory,
        rx_avail_idx: u16,
        rx_used_seen: u16,
        tx_avail_idx: u16,
        src_port: u32,
    }

    const RX_DESC: u64 = 0x1000;
    const RX_AVAIL: u64 = 0x2000;
    const RX_USED: u64 = 0x3000;
    const TX_DESC: u64 = 0x4000;
    const TX_AVAIL: u64 = 0x5000;
    const TX_USED: u64 = 0x6000;
    const RX_BUFS: u64 = 0x10000;
    const TX_BUFS: u64 = 0x20000;
    const QSIZE: u16 = 8;

    impl GuestDriverSim {
        fn new(memory: GuestMemory, dev: &mut VsockDevice) -> Self {
            // Configure both queues through the transport registers.
            for (q, desc, avail, used) in [
                (0u32, RX_DESC, RX_AVAIL, RX_USED),
                (1u32, TX_DESC, TX_AVAIL, TX_USED),
            ] {
                dev.write(MMIO_QUEUE_SEL, &q.to_le_bytes());
                dev.write(MMIO_QUEUE_NUM, &(QSIZE as u32).to_le_bytes());
                dev.write(MMIO_QUEUE_DESC_LOW, &(desc as u32).to_le_bytes());
                dev.write(MMIO_QUEUE_DESC_HIGH, &0u32.to_le_bytes());
                dev.write(MMIO_QUEUE_DRIVER_LOW, &(avail as u32).to_le_bytes());
                dev.write(MMIO_QUEUE_DRIVER_HIGH, &0u32.to_le_bytes());
                dev.write(MMIO_QUEUE_DEVICE_LOW, &(used as u32).to_le_bytes());
                dev.write(MMIO_QUEUE_DEVICE_HIGH, &0u32.to_le_bytes());
                dev.write(MMIO_QUEUE_READY, &1u32.to_le_bytes());
            }
            dev.write(MMIO_STATUS, &STATUS_DRIVER_OK.to_le_bytes());

            GuestDriverSim {
                memory,
                rx_avail_idx: 0,
                rx_used_seen: 0,
                tx_avail_idx: 0,
                src_port: 0x4000_0001,
            }
        }

        /// Post `n` writable 4KiB+44 RX buffers.
        fn refill_rx(&mut self, dev: &mut VsockDevice, n: u16) {
            for _ in 0..n {
                let slot = self.rx_avail_idx % QSIZE;
                let addr = RX_BUFS + slot as u64 * 0x2000;
                let desc = [
                    addr.to_le_bytes().to_vec(),
                    (4096u32 + HDR_SIZE as u32).to_le_bytes().to_vec(),
                    super::super::VIRTQ_DESC_F_WRITE.to_le_bytes().to_vec(),
                    0u16.to_le_bytes().to_vec(),
                ]
                .concat();
                self.memory
                    .write(RX_DESC + slot as u64 * 16, &desc)
                    .unwrap();
                self.memory
                    .write(RX_AVAIL + 4 + (self.rx_avail_idx % QSIZE) as u64 * 2, &slot.to_le_bytes())
                    .unwrap();
                self.rx_avail_idx = self.rx_avail_idx.wrapping_add(1);
                self.memory
                    .write(RX_AVAIL + 2, &self.rx_avail_idx.to_le_bytes())
                    .unwrap();
            }
            dev.write(MMIO_QUEUE_NOTIFY, &0u32.to_le_bytes());
        }

        /// Send one packet through the TX queue.
        fn send(&mut self, dev: &mut VsockDevice, hdr: PacketHeader, payload: &[u8]) {
            let slot = self.tx_avail_idx % QSIZE;
            let addr = TX_BUFS + slot as u64 * 0x2000;
            let mut bytes = hdr.to_bytes().to_vec();
            bytes.extend_from_slice(payload);
            self.memory.write(addr, &bytes).unwrap();

            let desc = [
                addr.to_le_bytes().to_vec(),
                (bytes.len() as u32).to_le_bytes().to_vec(),
                0u16.to_le_bytes().to_vec(),
                0u16.to_le_bytes().to_vec(),
            ]
            .concat();
            self.memory
                .write(TX_DESC + slot as u64 * 16, &desc)
                .unwrap();
            self.memory
                .write(TX_AVAIL + 4 + slot as u64 * 2, &slot.to_le_bytes())
                .unwrap();
            self.tx_avail_idx = self.tx_avail_idx.wrapping_add(1);
            self.memory
                .write(TX_AVAIL + 2, &self.tx_avail_idx.to_le_bytes())
                .unwrap();
            dev.write(MMIO_QUEUE_NOTIFY, &1u32.to_le_bytes());
        }

        fn connect(&mut self, dev: &mut VsockDevice, port: u32) {
            let hdr = PacketHeader {
                src_cid: GUEST_CID,
                dst_cid: HOST_CID,
                src_port: self.src_port,
                dst_port: port,
                type_: TYPE_STREAM,
                op: op::REQUEST,
                buf_alloc: BUF_ALLOC,
                ..Default::default()
            };
            self.send(dev, hdr, &[]);
        }

        fn send_rw(&mut self, dev: &mut VsockDevice, port: u32, payload: &[u8]) {
            let hdr = PacketHeader {
                src_cid: GUEST_CID,
                dst_cid: HOST_CID,
                src_port: self.src_port,
                dst_port: port,
                len: payload.len() as u32,
                type_: TYPE_STREAM,
                op: op::RW,
                buf_alloc: BUF_ALLOC,
                ..Default::default()
            };
            self.send(dev, hdr, payload);
        }

        /// Collect delivered RX packets (header + payload).
        fn recv_all(&mut self) -> Vec<(PacketHeader, Vec<u8>)> {
            let mut out = Vec::new();
            let mut idx_buf = [0u8; 2];
            self.memory.read(RX_USED + 2, &mut idx_buf).unwrap();
            let used_idx = u16::from_le_bytes(idx_buf);
            while self.rx_used_seen != used_idx {
                let at = RX_USED + 4 + (self.rx_used_seen % QSIZE) as u64 * 8;
                let id = self.memory.read_u32(at).unwrap();
                let len = self.memory.read_u32(at + 4).unwrap() as usize;
                let addr = RX_BUFS + id as u64 * 0x2000;
                let mut bytes = vec![0u8; len.max(HDR_SIZE)];
                self.memory.read(addr, &mut bytes).unwrap();
                let hdr = PacketHeader::parse(&bytes).unwrap();
                let payload = bytes[HDR_SIZE..len].to_vec();
                out.push((hdr, payload));
                self.rx_used_seen = self.rx_used_seen.wrapping_add(1);
            }
            out
        }
    }

    fn setup() -> (GuestDriverSim, VsockDevice, VsockHost) {
        let memory = GuestMemory::new(1 << 20).unwrap();
        let irq = IrqLine::new(Arc::new(CountingSink(AtomicUsize::new(0))), 5);
        let (mut dev, host) = vsock_pair(memory.clone(), irq, GUEST_CID);
        let sim = GuestDriverSim::new(memory, &mut dev);
        (sim, dev, host)
    }

    #[test]
    fn test_connect_gets_response_and_accept() {
        let (mut sim, mut dev, host) = setup();
        host.listen(9998);
        sim.refill_rx(&mut dev, 4);
        sim.connect(&mut dev, 9998);

        let packets = sim.recv_all();
        assert_eq!(packets.len(), 1);
        assert_eq!(packets[0].0.op, op::RESPONSE);
        assert_eq!(packets[0].0.src_cid, HOST_CID);
        assert_eq!(packets[0].0.dst_port, sim.src_port);

        // The connection is immediately acceptable.
        let stream = host.accept(9998).unwrap();
        assert_eq!(stream.key, (sim.src_port, 9998));
    }

    #[test]
    fn test_connect_without_listener_rst() {
        let (mut sim, mut dev, _host) = setup();
        sim.refill_rx(&mut dev, 4);
        sim.connect(&mut dev, 1234);
        let packets = sim.recv_all();
        assert_eq!(packets.len(), 1);
        assert_eq!(packets[0].0.op, op::RST);
    }

    #[test]
    fn test_guest_to_host_data() {
        let (mut sim, mut dev, host) = setup();
        host.listen(9998);
        sim.refill_rx(&mut dev, 8);
        sim.connect(&mut dev, 9998);
        let mut stream = host.accept(9998).unwrap();

        sim.send_rw(&mut dev, 9998, b"hello vsock");
        let mut buf = [0u8; 32];
        let n = stream.read(&mut buf).unwrap();
        assert_eq!(&buf[..n], b"hello vsock");

        // The guest got a credit update acknowledging consumption.
        let credit_updates: Vec<_> = sim
            .recv_all()
            .into_iter()
            .filter(|(h, _)| h.op == op::CREDIT_UPDATE)
            .collect();
        assert_eq!(credit_updates.len(), 1);
        assert_eq!(credit_updates[0].0.fwd_cnt, 11);
    }

    #[test]
    fn test_host_to_guest_data() {
        let (mut sim, mut dev, host) = setup();
        host.listen(9998);
        sim.refill_rx(&mut dev, 8);
        sim.connect(&mut dev, 9998);
        let mut stream = host.accept(9998).unwrap();
        sim.recv_all(); // drop the RESPONSE

        stream.write_all(b"from the host").unwrap();
        let packets = sim.recv_all();
        assert_eq!(packets.len(), 1);
        assert_eq!(packets[0].0.op, op::RW);
        assert_eq!(packets[0].1, b"from the host");
    }

    #[test]
    fn test_host_write_waits_for_rx_buffers() {
        let (mut sim, mut dev, host) = setup();
        host.listen(9998);
        sim.refill_rx(&mut dev, 2);
        sim.connect(&mut dev, 9998);
        let mut stream = host.accept(9998).unwrap();
        sim.recv_all();

        // Both RX buffers are consumed (response used one); one write
        // fits, further data waits in h2g until the guest refills.
        stream.write_all(&vec![b'a'; 5000]).unwrap();
        let first: usize = sim.recv_all().iter().map(|(h, _)| h.len as usize).sum();
        assert!(first < 5000);

        sim.refill_rx(&mut dev, 8);
        let second: usize = sim.recv_all().iter().map(|(h, _)| h.len as usize).sum();
        assert_eq!(first + second, 5000);
    }

    #[test]
    fn test_shutdown_gives_reader_eof() {
        let (mut sim, mut dev, host) = setup();
        host.listen(9998);
        sim.refill_rx(&mut dev, 8);
        sim.connect(&mut dev, 9998);
        let mut stream = host.accept(9998).unwrap();

        let hdr = PacketHeader {
            src_cid: GUEST_CID,
            dst_cid: HOST_CID,
            src_port: sim.src_port,
            dst_port: 9998,
            type_: TYPE_STREAM,
            op: op::SHUTDOWN,
            buf_alloc: BUF_ALLOC,
            ..Default::default()
        };
        sim.send(&mut dev, hdr, &[]);

        let mut buf = [0u8; 8];
        assert_eq!(stream.read(&mut buf).unwrap(), 0);
        assert!(stream.write_all(b"x").is_err());
    }

    #[test]
    fn test_config_space_reports_cid() {
        let (_sim, mut dev, _host) = setup();
        let mut lo = [0u8; 4];
        dev.read(MMIO_CONFIG, &mut lo);
        assert_eq!(u32::from_le_bytes(lo), GUEST_CID as u32);
    }
}
