//! Deterministic in-memory [`NetStack`].
//!
//! `SimStack` does no real protocol processing. It records what the bridge asks of it and lets the
//! caller play the network side: offer connections, deliver bytes, acknowledge sends, reset or
//! confirm teardown, and deliver datagrams. Every network-side method fires the corresponding
//! hook synchronously, so drive it through [`crate::EngineHandle::with_core`] or
//! [`crate::EngineHandle::call`] like any other engine access.

use std::collections::{BTreeMap, VecDeque};
use std::sync::Arc;

use crate::{
    AcceptVerdict, ConnSink, DatagramSink, Endpoint, EngineError, LinkOutput, ListenerId,
    ListenerSink, NetStack, PacketBuf, RawConn, RawConnId, TcpEvent, UdpId,
};

/// Default per-connection send buffer.
pub const SIM_SEND_BUFFER: usize = 64 * 1024;

/// Engine-side view of a simulated TCP connection.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum SimConnState {
    Open,
    /// `tcp_close` was called; waiting for [`SimStack::confirm_closed`].
    Closing,
    /// Teardown confirmed.
    Closed,
    /// Aborted by the bridge (or rejected on accept).
    Aborted,
    /// Reset by the network side.
    Reset,
}

struct SimConn {
    endpoint: Endpoint,
    state: SimConnState,
    sink: Option<Arc<dyn ConnSink>>,
    /// Events raised before a sink was bound.
    early: VecDeque<TcpEvent>,
    written: Vec<u8>,
    in_flight: usize,
    recved: usize,
}

impl SimConn {
    fn new(endpoint: Endpoint, state: SimConnState) -> Self {
        Self {
            endpoint,
            state,
            sink: None,
            early: VecDeque::new(),
            written: Vec::new(),
            in_flight: 0,
            recved: 0,
        }
    }
}

pub struct SimStack {
    initialized: bool,
    timer_ticks: u64,
    link: Option<Arc<dyn LinkOutput>>,
    mtu: usize,
    loopback: bool,
    injected: Vec<Vec<u8>>,
    send_buffer: usize,
    write_error: Option<EngineError>,
    next_id: u64,
    listeners: BTreeMap<u64, Arc<dyn ListenerSink>>,
    conns: BTreeMap<u64, SimConn>,
    udp: BTreeMap<u64, Arc<dyn DatagramSink>>,
    sent_datagrams: Vec<(Endpoint, Vec<u8>)>,
}

impl SimStack {
    pub fn new() -> Self {
        Self {
            initialized: false,
            timer_ticks: 0,
            link: None,
            mtu: 0,
            loopback: false,
            injected: Vec::new(),
            send_buffer: SIM_SEND_BUFFER,
            write_error: None,
            next_id: 1,
            listeners: BTreeMap::new(),
            conns: BTreeMap::new(),
            udp: BTreeMap::new(),
            sent_datagrams: Vec::new(),
        }
    }

    /// Echo every injected packet straight back out of the link.
    pub fn with_loopback(mut self) -> Self {
        self.loopback = true;
        self
    }

    /// Limit how many unacknowledged bytes each connection's send buffer holds.
    pub fn with_send_buffer(mut self, bytes: usize) -> Self {
        self.send_buffer = bytes;
        self
    }

    /// Resize every connection's send buffer. Bytes already in flight stay in flight.
    pub fn set_send_buffer(&mut self, bytes: usize) {
        self.send_buffer = bytes;
    }

    /// Make every `tcp_write` fail with `err` until called again with `None`.
    pub fn fail_writes(&mut self, err: Option<EngineError>) {
        self.write_error = err;
    }

    pub fn is_initialized(&self) -> bool {
        self.initialized
    }

    pub fn timer_ticks(&self) -> u64 {
        self.timer_ticks
    }

    pub fn is_link_attached(&self) -> bool {
        self.link.is_some()
    }

    pub fn link_mtu(&self) -> usize {
        self.mtu
    }

    fn next_id(&mut self) -> u64 {
        let id = self.next_id;
        self.next_id += 1;
        id
    }

    // --- link ---

    /// Emit `packet` through the link output hook. Returns `false` if no device is attached.
    pub fn emit(&mut self, packet: &[u8]) -> bool {
        match &self.link {
            Some(link) => {
                link.output(PacketBuf::from_vec(packet.to_vec()));
                true
            }
            None => false,
        }
    }

    /// Packets injected through [`NetStack::input`] since the last call.
    pub fn take_injected(&mut self) -> Vec<Vec<u8>> {
        std::mem::take(&mut self.injected)
    }

    // --- tcp ---

    /// Offer an inbound connection to the first listener.
    ///
    /// Returns `None` if nobody listens. A rejected connection is still returned; it is in the
    /// [`SimConnState::Aborted`] state.
    pub fn connect(&mut self, endpoint: Endpoint) -> Option<RawConnId> {
        let listener = self.listeners.values().next().cloned()?;
        let id = RawConnId(self.next_id());
        self.conns
            .insert(id.0, SimConn::new(endpoint, SimConnState::Open));
        if listener.on_accept(RawConn { id, endpoint }) == AcceptVerdict::Reject {
            self.abort_conn(id);
        }
        Some(id)
    }

    /// Tear the listeners down from the engine side.
    pub fn close_listener(&mut self) {
        let listeners = std::mem::take(&mut self.listeners);
        for listener in listeners.values() {
            listener.on_listener_closed();
        }
    }

    pub fn deliver(&mut self, conn: RawConnId, data: &[u8]) {
        if self.conn_state(conn) == Some(SimConnState::Open) {
            self.dispatch(conn, TcpEvent::Received(PacketBuf::from_vec(data.to_vec())));
        }
    }

    pub fn deliver_eof(&mut self, conn: RawConnId) {
        if self.conn_state(conn) == Some(SimConnState::Open) {
            self.dispatch(conn, TcpEvent::Eof);
        }
    }

    /// The peer acknowledged `len` bytes; frees send-buffer space and fires `Sent`.
    pub fn acknowledge(&mut self, conn: RawConnId, len: usize) {
        let Some(c) = self.conns.get_mut(&conn.0) else {
            return;
        };
        if !matches!(c.state, SimConnState::Open | SimConnState::Closing) {
            return;
        }
        let len = len.min(c.in_flight);
        c.in_flight -= len;
        if len > 0 {
            self.dispatch(conn, TcpEvent::Sent(len));
        }
    }

    /// Reset by the peer: fires `Error(Reset)` and forgets the sink.
    pub fn reset(&mut self, conn: RawConnId) {
        if !matches!(
            self.conn_state(conn),
            Some(SimConnState::Open | SimConnState::Closing)
        ) {
            return;
        }
        self.dispatch(conn, TcpEvent::Error(EngineError::Reset));
        if let Some(c) = self.conns.get_mut(&conn.0) {
            c.state = SimConnState::Reset;
            c.sink = None;
        }
    }

    /// Finish a teardown started by `tcp_close`: fires `Released`.
    pub fn confirm_closed(&mut self, conn: RawConnId) -> bool {
        if self.conn_state(conn) != Some(SimConnState::Closing) {
            return false;
        }
        self.dispatch(conn, TcpEvent::Released);
        if let Some(c) = self.conns.get_mut(&conn.0) {
            c.state = SimConnState::Closed;
            c.sink = None;
        }
        true
    }

    pub fn conn_state(&self, conn: RawConnId) -> Option<SimConnState> {
        self.conns.get(&conn.0).map(|c| c.state)
    }

    pub fn is_aborted(&self, conn: RawConnId) -> bool {
        self.conn_state(conn) == Some(SimConnState::Aborted)
    }

    pub fn conn_endpoint(&self, conn: RawConnId) -> Option<Endpoint> {
        self.conns.get(&conn.0).map(|c| c.endpoint)
    }

    /// Bytes the bridge wrote on `conn`.
    pub fn written(&self, conn: RawConnId) -> &[u8] {
        self.conns
            .get(&conn.0)
            .map(|c| c.written.as_slice())
            .unwrap_or_default()
    }

    pub fn take_written(&mut self, conn: RawConnId) -> Vec<u8> {
        self.conns
            .get_mut(&conn.0)
            .map(|c| std::mem::take(&mut c.written))
            .unwrap_or_default()
    }

    /// Bytes the bridge acknowledged through `tcp_recved`.
    pub fn recved(&self, conn: RawConnId) -> usize {
        self.conns.get(&conn.0).map_or(0, |c| c.recved)
    }

    fn dispatch(&mut self, conn: RawConnId, event: TcpEvent) {
        let Some(c) = self.conns.get_mut(&conn.0) else {
            return;
        };
        match &c.sink {
            Some(sink) => {
                let sink = Arc::clone(sink);
                sink.on_event(event);
            }
            None => c.early.push_back(event),
        }
    }

    fn abort_conn(&mut self, conn: RawConnId) {
        if let Some(c) = self.conns.get_mut(&conn.0) {
            c.state = SimConnState::Aborted;
            c.sink = None;
            c.early.clear();
        }
    }

    // --- udp ---

    /// Deliver a datagram to the first bound socket. Returns `false` if none is bound.
    pub fn deliver_datagram(&mut self, endpoint: Endpoint, payload: &[u8]) -> bool {
        match self.udp.values().next() {
            Some(sink) => {
                sink.on_datagram(endpoint, PacketBuf::from_vec(payload.to_vec()));
                true
            }
            None => false,
        }
    }

    /// Datagrams sent through [`NetStack::udp_sendto`] since the last call.
    pub fn take_datagrams(&mut self) -> Vec<(Endpoint, Vec<u8>)> {
        std::mem::take(&mut self.sent_datagrams)
    }

    pub fn udp_socket_count(&self) -> usize {
        self.udp.len()
    }
}

impl Default for SimStack {
    fn default() -> Self {
        Self::new()
    }
}

impl NetStack for SimStack {
    fn init(&mut self) {
        self.initialized = true;
    }

    fn poll_timers(&mut self) {
        self.timer_ticks += 1;
        let live: Vec<RawConnId> = self
            .conns
            .iter()
            .filter(|(_, c)| c.state == SimConnState::Open && c.sink.is_some())
            .map(|(&id, _)| RawConnId(id))
            .collect();
        for conn in live {
            self.dispatch(conn, TcpEvent::Poll);
        }
    }

    fn set_link_output(&mut self, output: Option<Arc<dyn LinkOutput>>, mtu: usize) {
        self.link = output;
        self.mtu = mtu;
    }

    fn input(&mut self, packet: PacketBuf) -> Result<(), EngineError> {
        if self.loopback {
            if let Some(link) = &self.link {
                link.output(packet);
                return Ok(());
            }
        }
        self.injected.push(packet.into_vec());
        Ok(())
    }

    fn tcp_listen(
        &mut self,
        sink: Arc<dyn ListenerSink>,
        _backlog: usize,
    ) -> Result<ListenerId, EngineError> {
        let id = self.next_id();
        self.listeners.insert(id, sink);
        Ok(ListenerId(id))
    }

    fn tcp_unlisten(&mut self, listener: ListenerId) {
        self.listeners.remove(&listener.0);
    }

    fn tcp_bind_sink(
        &mut self,
        conn: RawConnId,
        sink: Arc<dyn ConnSink>,
    ) -> Result<(), EngineError> {
        let c = self
            .conns
            .get_mut(&conn.0)
            .ok_or(EngineError::NotConnected)?;
        if c.state == SimConnState::Aborted {
            return Err(EngineError::Aborted);
        }
        let early: Vec<TcpEvent> = c.early.drain(..).collect();
        if matches!(c.state, SimConnState::Open | SimConnState::Closing) {
            c.sink = Some(Arc::clone(&sink));
        }
        for event in early {
            sink.on_event(event);
        }
        Ok(())
    }

    fn tcp_write(&mut self, conn: RawConnId, data: &[u8]) -> Result<usize, EngineError> {
        let c = self
            .conns
            .get_mut(&conn.0)
            .ok_or(EngineError::NotConnected)?;
        match c.state {
            SimConnState::Open => {}
            SimConnState::Reset => return Err(EngineError::Reset),
            SimConnState::Aborted => return Err(EngineError::Aborted),
            SimConnState::Closing | SimConnState::Closed => return Err(EngineError::Closed),
        }
        if let Some(err) = self.write_error {
            return Err(err);
        }
        let space = self.send_buffer.saturating_sub(c.in_flight);
        let taken = data.len().min(space);
        c.written.extend_from_slice(&data[..taken]);
        c.in_flight += taken;
        Ok(taken)
    }

    fn tcp_recved(&mut self, conn: RawConnId, len: usize) {
        if let Some(c) = self.conns.get_mut(&conn.0) {
            c.recved += len;
        }
    }

    fn tcp_close(&mut self, conn: RawConnId) -> Result<(), EngineError> {
        let c = self
            .conns
            .get_mut(&conn.0)
            .ok_or(EngineError::NotConnected)?;
        match c.state {
            SimConnState::Open => {
                c.state = SimConnState::Closing;
                Ok(())
            }
            SimConnState::Reset => Err(EngineError::Reset),
            SimConnState::Aborted => Err(EngineError::Aborted),
            SimConnState::Closing | SimConnState::Closed => Err(EngineError::Closed),
        }
    }

    fn tcp_abort(&mut self, conn: RawConnId) {
        self.abort_conn(conn);
    }

    fn udp_bind(&mut self, sink: Arc<dyn DatagramSink>) -> Result<UdpId, EngineError> {
        let id = self.next_id();
        self.udp.insert(id, sink);
        Ok(UdpId(id))
    }

    fn udp_sendto(
        &mut self,
        socket: UdpId,
        endpoint: Endpoint,
        payload: PacketBuf,
    ) -> Result<(), EngineError> {
        if !self.udp.contains_key(&socket.0) {
            return Err(EngineError::NotConnected);
        }
        self.sent_datagrams.push((endpoint, payload.into_vec()));
        Ok(())
    }

    fn udp_remove(&mut self, socket: UdpId) {
        self.udp.remove(&socket.0);
    }
}

impl std::fmt::Debug for SimStack {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.debug_struct("SimStack")
            .field("link_attached", &self.link.is_some())
            .field("mtu", &self.mtu)
            .field("listeners", &self.listeners.len())
            .field("conns", &self.conns.len())
            .field("udp", &self.udp.len())
            .finish()
    }
}
