//! UDP datagram multiplexer.
//!
//! Unlike the TCP byte stream, datagrams keep their boundaries: a datagram that does not fit the
//! caller's buffer is dropped whole, never delivered as a prefix.

use std::sync::atomic::{AtomicBool, AtomicU64, Ordering};
use std::sync::Arc;

use tracing::{debug, trace};

use crate::sync::{Mailbox, TryPostError};
use crate::{
    BridgeConfig, BridgeError, DatagramSink, Endpoint, EngineHandle, NetStack, PacketBuf, Result,
    UdpId,
};

/// One received datagram: where it came from and went to, plus its payload.
#[derive(Debug, PartialEq, Eq)]
pub struct Datagram {
    pub endpoint: Endpoint,
    pub payload: PacketBuf,
}

#[derive(Debug, Default, Clone, Copy, PartialEq, Eq)]
pub struct UdpStats {
    pub received: u64,
    /// Dropped because the mailbox was full.
    pub dropped_full: u64,
    /// Dropped because they did not fit the caller's buffer.
    pub dropped_oversized: u64,
    /// Still queued when the socket closed.
    pub dropped_on_close: u64,
    pub sent: u64,
    pub send_failed: u64,
}

#[derive(Default)]
struct Counters {
    received: AtomicU64,
    dropped_full: AtomicU64,
    dropped_oversized: AtomicU64,
    dropped_on_close: AtomicU64,
    sent: AtomicU64,
    send_failed: AtomicU64,
}

struct UdpShared {
    mailbox: Mailbox<Datagram>,
    counters: Counters,
}

struct DatagramHook {
    shared: Arc<UdpShared>,
}

impl DatagramSink for DatagramHook {
    fn on_datagram(&self, endpoint: Endpoint, payload: PacketBuf) {
        match self.shared.mailbox.try_post(Datagram { endpoint, payload }) {
            Ok(()) => {}
            Err(TryPostError::Full(dropped)) => {
                self.shared
                    .counters
                    .dropped_full
                    .fetch_add(1, Ordering::Relaxed);
                trace!(endpoint = %dropped.endpoint, len = dropped.payload.len(), "udp mailbox full, dropped datagram");
            }
            Err(TryPostError::Closed(_)) => {}
        }
    }
}

/// Wildcard-port UDP socket on the virtual interface.
pub struct UdpConn<S: NetStack> {
    engine: EngineHandle<S>,
    shared: Arc<UdpShared>,
    socket: UdpId,
    closed: AtomicBool,
}

impl<S: NetStack> UdpConn<S> {
    pub fn listen(engine: &EngineHandle<S>, config: &BridgeConfig) -> Result<Self> {
        config.validate()?;
        let shared = Arc::new(UdpShared {
            mailbox: Mailbox::new(config.udp_mailbox_capacity),
            counters: Counters::default(),
        });

        let hook: Arc<dyn DatagramSink> = Arc::new(DatagramHook {
            shared: Arc::clone(&shared),
        });
        let socket = engine.call(move |stack| stack.udp_bind(hook))??;

        debug!(mailbox = config.udp_mailbox_capacity, "udp socket bound");
        Ok(Self {
            engine: engine.clone(),
            shared,
            socket,
            closed: AtomicBool::new(false),
        })
    }

    pub fn is_closed(&self) -> bool {
        self.closed.load(Ordering::Acquire)
    }

    /// Block until a datagram that fits `buf` arrives. Returns its endpoint and length.
    pub fn recv(&self, buf: &mut [u8]) -> Result<(Endpoint, usize)> {
        loop {
            let Some(datagram) = self.shared.mailbox.recv() else {
                return Err(BridgeError::Closed);
            };
            let len = datagram.payload.len();
            if len > buf.len() {
                self.shared
                    .counters
                    .dropped_oversized
                    .fetch_add(1, Ordering::Relaxed);
                trace!(len, buf = buf.len(), "datagram larger than receive buffer, dropped");
                continue;
            }
            buf[..len].copy_from_slice(datagram.payload.as_slice());
            self.shared.counters.received.fetch_add(1, Ordering::Relaxed);
            return Ok((datagram.endpoint, len));
        }
    }

    /// Send `payload` from `endpoint.src` to `endpoint.dst`.
    ///
    /// The transmit runs later on the engine thread; a full task queue drops the datagram and
    /// reports [`BridgeError::EngineBusy`].
    pub fn sendto(&self, endpoint: Endpoint, payload: &[u8]) -> Result<usize> {
        if self.is_closed() {
            return Err(BridgeError::Closed);
        }
        let counters = &self.shared.counters;
        let buf = PacketBuf::try_copy_from(payload).map_err(|err| {
            counters.send_failed.fetch_add(1, Ordering::Relaxed);
            err
        })?;

        let socket = self.socket;
        let shared = Arc::clone(&self.shared);
        let scheduled = self.engine.try_submit(move |stack| {
            match stack.udp_sendto(socket, endpoint, buf) {
                Ok(()) => {
                    shared.counters.sent.fetch_add(1, Ordering::Relaxed);
                }
                Err(err) => {
                    shared.counters.send_failed.fetch_add(1, Ordering::Relaxed);
                    trace!(%endpoint, %err, "engine rejected datagram");
                }
            }
        });
        if let Err(err) = scheduled {
            counters.send_failed.fetch_add(1, Ordering::Relaxed);
            trace!(%endpoint, %err, "could not schedule datagram send");
            return Err(err);
        }
        Ok(payload.len())
    }

    /// Remove the socket from the engine, drop queued datagrams and wake blocked receivers.
    /// Idempotent.
    pub fn close(&self) {
        if self.closed.swap(true, Ordering::AcqRel) {
            return;
        }
        let socket = self.socket;
        self.engine.with_core(|stack| stack.udp_remove(socket));

        let drained = self.shared.mailbox.close();
        self.shared
            .counters
            .dropped_on_close
            .fetch_add(drained.len() as u64, Ordering::Relaxed);
        debug!(drained = drained.len(), "udp socket closed");
    }

    pub fn stats(&self) -> UdpStats {
        let c = &self.shared.counters;
        UdpStats {
            received: c.received.load(Ordering::Relaxed),
            dropped_full: c.dropped_full.load(Ordering::Relaxed),
            dropped_oversized: c.dropped_oversized.load(Ordering::Relaxed),
            dropped_on_close: c.dropped_on_close.load(Ordering::Relaxed),
            sent: c.sent.load(Ordering::Relaxed),
            send_failed: c.send_failed.load(Ordering::Relaxed),
        }
    }
}

impl<S: NetStack> Drop for UdpConn<S> {
    fn drop(&mut self) {
        self.close();
    }
}

impl<S: NetStack> std::fmt::Debug for UdpConn<S> {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.debug_struct("UdpConn")
            .field("socket", &self.socket)
            .field("closed", &self.is_closed())
            .field("stats", &self.stats())
            .finish()
    }
}
