//! The protocol-engine collaborator surface.
//!
//! [`NetStack`] is the black-box TCP/IP engine. The bridge only ever touches it from the engine
//! thread or while holding the core lock, so implementations can be plain `&mut self` state
//! machines without interior locking.
//!
//! Engine-originated notifications are delivered through the sink traits below. A sink runs with
//! the core lock held: it must not block and must not call back into the engine (the stack is
//! already mutably borrowed). Follow-up work that needs the engine is posted through
//! [`crate::Deferrer`].

use std::sync::Arc;

use crate::{Endpoint, EngineError, PacketBuf};

/// Engine handle for a TCP connection that has not necessarily been assigned a bridge index.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, PartialOrd, Ord)]
pub struct RawConnId(pub u64);

#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash)]
pub struct ListenerId(pub u64);

#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash)]
pub struct UdpId(pub u64);

/// Inbound TCP connection offered to a listener.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub struct RawConn {
    pub id: RawConnId,
    pub endpoint: Endpoint,
}

#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum AcceptVerdict {
    /// The listener took ownership of the connection.
    Keep,
    /// The engine must abort the connection; no hook will ever fire for it.
    Reject,
}

/// Per-connection notification.
#[derive(Debug, PartialEq, Eq)]
pub enum TcpEvent {
    Received(PacketBuf),
    /// The peer finished sending. No further `Received` events follow.
    Eof,
    /// The peer acknowledged this many previously written bytes.
    Sent(usize),
    /// Periodic tick from [`NetStack::poll_timers`] while the connection is alive.
    Poll,
    /// Fatal error. The engine has already discarded the connection; nothing follows.
    Error(EngineError),
    /// Teardown requested by `tcp_close` completed. Nothing follows.
    Released,
}

/// Output hook of the virtual interface.
pub trait LinkOutput: Send + Sync {
    fn output(&self, packet: PacketBuf);
}

pub trait ListenerSink: Send + Sync {
    fn on_accept(&self, conn: RawConn) -> AcceptVerdict;

    /// The listening socket went away (engine-side teardown).
    fn on_listener_closed(&self);
}

pub trait ConnSink: Send + Sync {
    fn on_event(&self, event: TcpEvent);
}

pub trait DatagramSink: Send + Sync {
    /// `endpoint.src` is the sender, `endpoint.dst` the local address the datagram arrived on.
    fn on_datagram(&self, endpoint: Endpoint, payload: PacketBuf);
}

pub trait NetStack: Send + 'static {
    /// Runs once on the engine thread before any task.
    fn init(&mut self) {}

    /// Runs on the engine thread once per timer interval, between tasks.
    fn poll_timers(&mut self) {}

    /// Register (`Some`) or unregister (`None`) the virtual interface's output hook.
    ///
    /// Unregistering when nothing is registered is a no-op.
    fn set_link_output(&mut self, output: Option<Arc<dyn LinkOutput>>, mtu: usize);

    /// Inject one packet into the engine's input path.
    fn input(&mut self, packet: PacketBuf) -> Result<(), EngineError>;

    fn tcp_listen(
        &mut self,
        sink: Arc<dyn ListenerSink>,
        backlog: usize,
    ) -> Result<ListenerId, EngineError>;

    /// Stop listening. Does not invoke [`ListenerSink::on_listener_closed`].
    fn tcp_unlisten(&mut self, listener: ListenerId);

    /// Install the event hook of an accepted connection.
    ///
    /// Events that happened between acceptance and binding are delivered to the new sink before
    /// this returns.
    fn tcp_bind_sink(&mut self, conn: RawConnId, sink: Arc<dyn ConnSink>)
        -> Result<(), EngineError>;

    /// Copy up to `data.len()` bytes into the connection's send buffer. Returns the number of bytes
    /// taken, which may be less than offered (or zero) when the send buffer is full.
    fn tcp_write(&mut self, conn: RawConnId, data: &[u8]) -> Result<usize, EngineError>;

    /// Acknowledge `len` consumed bytes, reopening the receive window by that amount.
    fn tcp_recved(&mut self, conn: RawConnId, len: usize);

    /// Begin a graceful close. Completion is reported later through [`TcpEvent::Released`].
    fn tcp_close(&mut self, conn: RawConnId) -> Result<(), EngineError>;

    /// Reset the connection. No further events fire for it.
    fn tcp_abort(&mut self, conn: RawConnId);

    /// Bind a wildcard-port datagram socket on the virtual interface.
    fn udp_bind(&mut self, sink: Arc<dyn DatagramSink>) -> Result<UdpId, EngineError>;

    fn udp_sendto(
        &mut self,
        socket: UdpId,
        endpoint: Endpoint,
        payload: PacketBuf,
    ) -> Result<(), EngineError>;

    fn udp_remove(&mut self, socket: UdpId);
}
