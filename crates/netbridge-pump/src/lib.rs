//! Host-link pump: moves packets between a [`Device`] and a host packet device.
//!
//! A host packet device is anything that yields and accepts whole packets, typically a TUN file
//! descriptor. Two worker threads run the directions independently:
//! 1. to-host: block in [`Device::read_batch`], forward every complete packet to [`HostTx`].
//! 2. from-host: block in [`HostRx::recv`], drain whatever else is ready without blocking, and
//!    hand the batch to [`Device::write_batch`].
//!
//! When the host side reaches EOF the from-host loop closes the device, which in turn ends the
//! to-host loop.
#![forbid(unsafe_code)]

use std::io;
use std::sync::Arc;
use std::thread::{self, JoinHandle};

use netbridge::{BridgeError, Device, NetStack, RxStatus};
use tracing::{debug, trace, warn};

/// Default number of packets moved per batch in each direction.
pub const DEFAULT_BATCH: usize = 64;

/// Default size of each packet buffer; large enough for any IPv4 packet.
pub const DEFAULT_BUF_SIZE: usize = 65536;

#[derive(Debug, thiserror::Error)]
pub enum PumpError {
    #[error("invalid pump config: {0} must be non-zero")]
    InvalidConfig(&'static str),

    #[error("host link closed")]
    HostClosed,

    #[error("host link I/O failed: {0}")]
    Host(#[from] io::Error),

    #[error("failed to spawn pump thread: {0}")]
    Spawn(#[source] io::Error),

    #[error(transparent)]
    Bridge(#[from] BridgeError),
}

/// Receiving half of a host packet device.
pub trait HostRx: Send {
    /// Block until the next packet arrives and copy it into `buf`.
    ///
    /// Returns the packet length; `Ok(0)` means the host side is gone.
    fn recv(&mut self, buf: &mut [u8]) -> io::Result<usize>;

    /// Copy the next packet into `buf` if one is ready without blocking.
    fn try_recv(&mut self, _buf: &mut [u8]) -> io::Result<Option<usize>> {
        Ok(None)
    }
}

/// Sending half of a host packet device.
pub trait HostTx: Send {
    fn send(&mut self, packet: &[u8]) -> io::Result<()>;
}

/// [`HostRx`] over a packet-oriented reader, where each `read` yields exactly one packet.
#[derive(Debug)]
pub struct StreamRx<R>(pub R);

impl<R: io::Read + Send> HostRx for StreamRx<R> {
    fn recv(&mut self, buf: &mut [u8]) -> io::Result<usize> {
        loop {
            match self.0.read(buf) {
                Err(err) if err.kind() == io::ErrorKind::Interrupted => continue,
                other => return other,
            }
        }
    }
}

/// [`HostTx`] over a packet-oriented writer.
#[derive(Debug)]
pub struct StreamTx<W>(pub W);

impl<W: io::Write + Send> HostTx for StreamTx<W> {
    fn send(&mut self, packet: &[u8]) -> io::Result<()> {
        self.0.write_all(packet)
    }
}

#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub struct PumpConfig {
    /// Packets moved per batch in each direction.
    pub batch: usize,
    /// Size of each packet buffer. Longer device packets are dropped and counted as truncated.
    pub buf_size: usize,
}

impl Default for PumpConfig {
    fn default() -> Self {
        Self {
            batch: DEFAULT_BATCH,
            buf_size: DEFAULT_BUF_SIZE,
        }
    }
}

impl PumpConfig {
    pub fn validate(&self) -> Result<(), PumpError> {
        if self.batch == 0 {
            return Err(PumpError::InvalidConfig("batch"));
        }
        if self.buf_size == 0 {
            return Err(PumpError::InvalidConfig("buf_size"));
        }
        Ok(())
    }

    /// One zeroed buffer per batch slot.
    pub fn buffers(&self) -> Vec<Vec<u8>> {
        vec![vec![0u8; self.buf_size]; self.batch]
    }
}

/// Packets moved by a pump, per direction.
#[must_use]
#[derive(Debug, Clone, Copy, PartialEq, Eq, Default)]
pub struct PumpCounts {
    /// Device packets delivered to the host.
    pub to_host: usize,
    /// Host packets handed to the device.
    pub from_host: usize,
    /// Device packets dropped because they exceeded the pump buffer.
    pub truncated: usize,
    /// Device packets dropped because the host write failed.
    pub host_errors: usize,
}

impl PumpCounts {
    pub fn merge(&mut self, other: PumpCounts) {
        self.to_host += other.to_host;
        self.from_host += other.from_host;
        self.truncated += other.truncated;
        self.host_errors += other.host_errors;
    }
}

/// Move one batch from the device to the host. Blocks until the device has at least one packet.
///
/// Host write failures drop the packet and are counted, not returned. Returns
/// [`BridgeError::Closed`] (wrapped) once the device is closed.
pub fn pump_to_host<S: NetStack, T: HostTx + ?Sized>(
    device: &Device<S>,
    tx: &mut T,
    bufs: &mut [Vec<u8>],
) -> Result<PumpCounts, PumpError> {
    let statuses = device.read_batch(bufs)?;

    let mut counts = PumpCounts::default();
    for (status, buf) in statuses.iter().zip(bufs.iter()) {
        match *status {
            RxStatus::Packet(len) => match tx.send(&buf[..len]) {
                Ok(()) => counts.to_host += 1,
                Err(err) => {
                    counts.host_errors += 1;
                    debug!(len, %err, "host write failed, packet dropped");
                }
            },
            RxStatus::Truncated { len } => {
                counts.truncated += 1;
                trace!(len, buf = buf.len(), "packet larger than pump buffer, dropped");
            }
        }
    }
    Ok(counts)
}

/// Move one batch from the host to the device.
///
/// Blocks for the first packet, then takes up to `bufs.len()` packets in total without blocking
/// again. Returns the number of packets written, or [`PumpError::HostClosed`] at host EOF.
pub fn pump_from_host<S: NetStack, R: HostRx + ?Sized>(
    rx: &mut R,
    device: &Device<S>,
    bufs: &mut [Vec<u8>],
) -> Result<usize, PumpError> {
    let mut lens = Vec::with_capacity(bufs.len());
    {
        let Some((first, rest)) = bufs.split_first_mut() else {
            return Ok(0);
        };
        let len = rx.recv(first)?;
        if len == 0 {
            return Err(PumpError::HostClosed);
        }
        lens.push(len);

        for buf in rest.iter_mut() {
            match rx.try_recv(buf)? {
                Some(len) if len > 0 => lens.push(len),
                _ => break,
            }
        }
    }

    let packets: Vec<&[u8]> = bufs
        .iter()
        .zip(&lens)
        .map(|(buf, &len)| &buf[..len])
        .collect();
    Ok(device.write_batch(&packets)?)
}

fn to_host_loop<S: NetStack, T: HostTx>(
    device: &Device<S>,
    mut tx: T,
    config: PumpConfig,
) -> PumpCounts {
    let mut bufs = config.buffers();
    let mut counts = PumpCounts::default();
    loop {
        match pump_to_host(device, &mut tx, &mut bufs) {
            Ok(batch) => counts.merge(batch),
            Err(PumpError::Bridge(BridgeError::Closed)) => break,
            Err(err) => {
                warn!(%err, "to-host pump stopped");
                break;
            }
        }
    }
    debug!(?counts, "to-host pump finished");
    counts
}

fn from_host_loop<S: NetStack, R: HostRx>(
    device: &Device<S>,
    mut rx: R,
    config: PumpConfig,
) -> PumpCounts {
    let mut bufs = config.buffers();
    let mut counts = PumpCounts::default();
    loop {
        match pump_from_host(&mut rx, device, &mut bufs) {
            Ok(written) => counts.from_host += written,
            Err(PumpError::HostClosed) => {
                debug!("host link reached EOF");
                break;
            }
            Err(PumpError::Bridge(BridgeError::Closed)) => break,
            Err(err) => {
                warn!(%err, "from-host pump stopped");
                break;
            }
        }
    }
    device.close();
    debug!(?counts, "from-host pump finished");
    counts
}

/// Both pump directions running on their own threads.
#[derive(Debug)]
pub struct LinkPump {
    to_host: Option<JoinHandle<PumpCounts>>,
    from_host: Option<JoinHandle<PumpCounts>>,
}

impl LinkPump {
    pub fn spawn<S, R, T>(
        device: Arc<Device<S>>,
        rx: R,
        tx: T,
        config: PumpConfig,
    ) -> Result<Self, PumpError>
    where
        S: NetStack,
        R: HostRx + 'static,
        T: HostTx + 'static,
    {
        config.validate()?;

        let to_host = thread::Builder::new()
            .name("netbridge-pump-tx".into())
            .spawn({
                let device = Arc::clone(&device);
                move || to_host_loop(&device, tx, config)
            })
            .map_err(PumpError::Spawn)?;

        let from_host = thread::Builder::new()
            .name("netbridge-pump-rx".into())
            .spawn({
                let device = Arc::clone(&device);
                move || from_host_loop(&device, rx, config)
            });
        let from_host = match from_host {
            Ok(handle) => handle,
            Err(err) => {
                device.close();
                let _ = to_host.join();
                return Err(PumpError::Spawn(err));
            }
        };

        debug!(batch = config.batch, buf_size = config.buf_size, "link pump started");
        Ok(Self {
            to_host: Some(to_host),
            from_host: Some(from_host),
        })
    }

    /// Wait for both directions to finish and return their combined counts.
    ///
    /// Returns once the host side reached EOF (or failed) and the device closed.
    pub fn join(mut self) -> PumpCounts {
        let mut counts = PumpCounts::default();
        for (name, handle) in [
            ("from-host", self.from_host.take()),
            ("to-host", self.to_host.take()),
        ] {
            let Some(handle) = handle else {
                continue;
            };
            match handle.join() {
                Ok(part) => counts.merge(part),
                Err(_) => warn!(direction = name, "pump thread panicked"),
            }
        }
        counts
    }
}
