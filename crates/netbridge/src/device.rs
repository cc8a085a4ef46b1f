//! Virtual interface adapter.
//!
//! The engine's link output lands in the rx ring and caller reads drain it; caller writes land in
//! the tx ring and a deferred flush task injects them into the engine. Each ring has its own lock
//! so a writer never waits on a reader.

use std::sync::atomic::{AtomicBool, AtomicU64, Ordering};
use std::sync::{Arc, Condvar, Mutex};

use netbridge_ring::PacketRing;
use tracing::{debug, trace};

use crate::config::DEFAULT_MTU;
use crate::iface::LinkToken;
use crate::sync::{lock, wait};
use crate::{
    BridgeConfig, BridgeError, Deferrer, EngineHandle, LinkOutput, NetStack, PacketBuf, Result,
};

/// Maximum number of packets one flush task injects before yielding the engine thread.
pub const MAX_TX_FLUSH_BATCH: usize = 64;

/// Per-packet result of a device read.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum RxStatus {
    /// The whole packet was copied into the buffer.
    Packet(usize),
    /// The packet (of `len` bytes) did not fit and was consumed without being copied.
    Truncated { len: usize },
}

impl RxStatus {
    /// Bytes copied into the caller's buffer.
    pub fn copied(self) -> usize {
        match self {
            RxStatus::Packet(len) => len,
            RxStatus::Truncated { .. } => 0,
        }
    }
}

#[derive(Debug, Default, Clone, Copy, PartialEq, Eq)]
pub struct DeviceStats {
    pub rx_packets: u64,
    /// Engine output overwritten in the rx ring before anyone read it.
    pub rx_overwritten: u64,
    pub rx_truncated: u64,
    pub tx_packets: u64,
    /// Caller writes overwritten in the tx ring before the flush task ran.
    pub tx_overwritten: u64,
    /// Packets the engine refused on input.
    pub tx_rejected: u64,
}

#[derive(Default)]
struct Counters {
    rx_packets: AtomicU64,
    rx_overwritten: AtomicU64,
    rx_truncated: AtomicU64,
    tx_packets: AtomicU64,
    tx_overwritten: AtomicU64,
    tx_rejected: AtomicU64,
}

struct TxQueue {
    ring: PacketRing<PacketBuf>,
    /// A flush task is queued or running. At most one exists at a time.
    polling: bool,
}

struct DeviceShared {
    rx: Mutex<PacketRing<PacketBuf>>,
    rx_ready: Condvar,
    tx: Mutex<TxQueue>,
    /// Only flipped while holding the rx lock, so waiters cannot miss it.
    closed: AtomicBool,
    counters: Counters,
}

impl DeviceShared {
    fn is_closed(&self) -> bool {
        self.closed.load(Ordering::Acquire)
    }

    fn deliver(&self, packet: PacketBuf, buf: &mut [u8]) -> RxStatus {
        let len = packet.len();
        if len > buf.len() {
            self.counters.rx_truncated.fetch_add(1, Ordering::Relaxed);
            trace!(len, buf = buf.len(), "rx packet truncated");
            return RxStatus::Truncated { len };
        }
        buf[..len].copy_from_slice(packet.as_slice());
        self.counters.rx_packets.fetch_add(1, Ordering::Relaxed);
        RxStatus::Packet(len)
    }
}

/// Link output hook installed in the engine while the device is attached.
struct DeviceOutput {
    shared: Arc<DeviceShared>,
}

impl LinkOutput for DeviceOutput {
    fn output(&self, packet: PacketBuf) {
        let mut rx = lock(&self.shared.rx);
        if self.shared.is_closed() {
            return;
        }
        if rx.push(packet).is_some() {
            self.shared
                .counters
                .rx_overwritten
                .fetch_add(1, Ordering::Relaxed);
            trace!("rx ring full, dropped oldest packet");
        }
        drop(rx);
        self.shared.rx_ready.notify_one();
    }
}

/// Emulated network link between the engine and caller threads.
pub struct Device<S: NetStack> {
    engine: EngineHandle<S>,
    shared: Arc<DeviceShared>,
    token: Mutex<Option<LinkToken>>,
    mtu: usize,
}

impl<S: NetStack> Device<S> {
    /// Claim the virtual interface and redirect its output into this device.
    ///
    /// `mtu == 0` selects the default MTU. The hook is installed by a task on the engine thread;
    /// this returns once it is in place.
    pub fn attach(engine: &EngineHandle<S>, mtu: usize, config: &BridgeConfig) -> Result<Self> {
        let mtu = if mtu == 0 { DEFAULT_MTU } else { mtu };
        let token = engine.interface().claim(mtu)?;

        let shared = Arc::new(DeviceShared {
            rx: Mutex::new(PacketRing::with_capacity(config.ring_capacity)),
            rx_ready: Condvar::new(),
            tx: Mutex::new(TxQueue {
                ring: PacketRing::with_capacity(config.ring_capacity),
                polling: false,
            }),
            closed: AtomicBool::new(false),
            counters: Counters::default(),
        });

        let hook: Arc<dyn LinkOutput> = Arc::new(DeviceOutput {
            shared: Arc::clone(&shared),
        });
        if let Err(err) = engine.call(move |stack| stack.set_link_output(Some(hook), mtu)) {
            engine.interface().release(token);
            return Err(err);
        }

        debug!(mtu, "device attached");
        Ok(Self {
            engine: engine.clone(),
            shared,
            token: Mutex::new(Some(token)),
            mtu,
        })
    }

    pub fn mtu(&self) -> usize {
        self.mtu
    }

    pub fn is_closed(&self) -> bool {
        self.shared.is_closed()
    }

    /// Detach from the engine and wake every blocked reader. Idempotent.
    ///
    /// Packets still queued in either direction are discarded.
    pub fn close(&self) {
        {
            let mut rx = lock(&self.shared.rx);
            if self.shared.closed.swap(true, Ordering::AcqRel) {
                return;
            }
            rx.clear();
        }
        self.shared.rx_ready.notify_all();
        lock(&self.shared.tx).ring.clear();

        self.engine
            .with_core(|stack| stack.set_link_output(None, DEFAULT_MTU));
        if let Some(token) = lock(&self.token).take() {
            self.engine.interface().release(token);
        }
        debug!("device closed");
    }

    /// Block until a packet is available and copy it into `buf`.
    pub fn read(&self, buf: &mut [u8]) -> Result<RxStatus> {
        let mut rx = lock(&self.shared.rx);
        loop {
            if self.shared.is_closed() {
                return Err(BridgeError::Closed);
            }
            if let Some(packet) = rx.pop() {
                drop(rx);
                return Ok(self.shared.deliver(packet, buf));
            }
            rx = wait(&self.shared.rx_ready, rx);
        }
    }

    /// Non-blocking [`Device::read`]. `Ok(None)` means no packet is queued yet.
    pub fn try_read(&self, buf: &mut [u8]) -> Result<Option<RxStatus>> {
        let mut rx = lock(&self.shared.rx);
        if self.shared.is_closed() {
            return Err(BridgeError::Closed);
        }
        let Some(packet) = rx.pop() else {
            return Ok(None);
        };
        drop(rx);
        Ok(Some(self.shared.deliver(packet, buf)))
    }

    /// Block until at least one packet is available, then fill up to `bufs.len()` buffers.
    ///
    /// Returns one status per filled buffer, in order; never waits to fill them all.
    pub fn read_batch<B: AsMut<[u8]>>(&self, bufs: &mut [B]) -> Result<Vec<RxStatus>> {
        let mut packets = Vec::with_capacity(bufs.len());
        let mut rx = lock(&self.shared.rx);
        loop {
            if self.shared.is_closed() {
                return Err(BridgeError::Closed);
            }
            if bufs.is_empty() {
                return Ok(Vec::new());
            }
            if rx.pop_into(&mut packets, bufs.len()) > 0 {
                break;
            }
            rx = wait(&self.shared.rx_ready, rx);
        }
        drop(rx);

        Ok(packets
            .into_iter()
            .zip(bufs.iter_mut())
            .map(|(packet, buf)| self.shared.deliver(packet, buf.as_mut()))
            .collect())
    }

    /// Queue one packet for injection into the engine. Returns the number of bytes accepted.
    pub fn write(&self, packet: &[u8]) -> Result<usize> {
        if self.is_closed() {
            return Err(BridgeError::Closed);
        }
        let buf = PacketBuf::try_copy_from(packet)?;
        self.enqueue_tx(std::iter::once(buf))?;
        Ok(packet.len())
    }

    /// Queue several packets under one lock acquisition. Returns the number of packets accepted.
    ///
    /// All packets are copied before any is queued, so an allocation failure queues nothing.
    pub fn write_batch<P: AsRef<[u8]>>(&self, packets: &[P]) -> Result<usize> {
        if self.is_closed() {
            return Err(BridgeError::Closed);
        }
        let bufs = packets
            .iter()
            .map(|p| PacketBuf::try_copy_from(p.as_ref()))
            .collect::<Result<Vec<_>>>()?;
        let count = bufs.len();
        if count > 0 {
            self.enqueue_tx(bufs)?;
        }
        Ok(count)
    }

    fn enqueue_tx(&self, bufs: impl IntoIterator<Item = PacketBuf>) -> Result<()> {
        let schedule = {
            let mut tx = lock(&self.shared.tx);
            for buf in bufs {
                if tx.ring.push(buf).is_some() {
                    self.shared
                        .counters
                        .tx_overwritten
                        .fetch_add(1, Ordering::Relaxed);
                    trace!("tx ring full, dropped oldest packet");
                }
            }
            !std::mem::replace(&mut tx.polling, true)
        };
        if !schedule {
            return Ok(());
        }

        let deferrer = self.engine.deferrer();
        let result = match self
            .engine
            .try_submit(flush_task(Arc::clone(&self.shared), deferrer.clone()))
        {
            Err(BridgeError::EngineBusy) => self
                .engine
                .submit(flush_task(Arc::clone(&self.shared), deferrer)),
            other => other,
        };
        if result.is_err() {
            lock(&self.shared.tx).polling = false;
        }
        result
    }

    pub fn stats(&self) -> DeviceStats {
        let c = &self.shared.counters;
        DeviceStats {
            rx_packets: c.rx_packets.load(Ordering::Relaxed),
            rx_overwritten: c.rx_overwritten.load(Ordering::Relaxed),
            rx_truncated: c.rx_truncated.load(Ordering::Relaxed),
            tx_packets: c.tx_packets.load(Ordering::Relaxed),
            tx_overwritten: c.tx_overwritten.load(Ordering::Relaxed),
            tx_rejected: c.tx_rejected.load(Ordering::Relaxed),
        }
    }
}

impl<S: NetStack> Drop for Device<S> {
    fn drop(&mut self) {
        self.close();
    }
}

impl<S: NetStack> std::fmt::Debug for Device<S> {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.debug_struct("Device")
            .field("mtu", &self.mtu)
            .field("closed", &self.is_closed())
            .field("stats", &self.stats())
            .finish()
    }
}

fn flush_task<S: NetStack>(
    shared: Arc<DeviceShared>,
    deferrer: Deferrer<S>,
) -> impl FnOnce(&mut S) + Send + 'static {
    move |stack| flush_tx(shared, deferrer, stack)
}

/// Inject one batch from the tx ring. If packets remain, the task re-queues itself and keeps the
/// polling flag; otherwise the flag is cleared so the next writer schedules a fresh flush.
fn flush_tx<S: NetStack>(shared: Arc<DeviceShared>, deferrer: Deferrer<S>, stack: &mut S) {
    let mut batch = Vec::with_capacity(MAX_TX_FLUSH_BATCH);
    lock(&shared.tx).ring.pop_into(&mut batch, MAX_TX_FLUSH_BATCH);

    for packet in batch {
        match stack.input(packet) {
            Ok(()) => {
                shared.counters.tx_packets.fetch_add(1, Ordering::Relaxed);
            }
            Err(err) => {
                shared.counters.tx_rejected.fetch_add(1, Ordering::Relaxed);
                trace!(%err, "engine rejected injected packet");
            }
        }
    }

    let more = {
        let mut tx = lock(&shared.tx);
        let more = !tx.ring.is_empty() && !shared.is_closed();
        tx.polling = more;
        more
    };
    if more {
        let next = flush_task(Arc::clone(&shared), deferrer.clone());
        if deferrer.defer(next).is_err() {
            lock(&shared.tx).polling = false;
        }
    }
}
