//! Index-based TCP connection poller.
//!
//! Accepted connections live in a fixed table of slots addressed by a `u16` index. Each slot moves
//! `Free -> Active -> Closing -> Free`; the last step happens only once the caller closed the index
//! *and* the engine confirmed teardown, so an index is never recycled while the engine may still
//! report events for the old connection.
//!
//! Readiness is edge-triggered. A slot posts `READABLE`/`WRITABLE` once when its one-shot notify
//! flag is armed; `read` returning [`ReadOutcome::NotReady`] and `write` returning
//! [`WriteOutcome::WouldBlock`] re-arm the corresponding flag.

use std::mem;
use std::sync::atomic::{AtomicBool, AtomicU64, Ordering};
use std::sync::{Arc, Mutex};

use bitflags::bitflags;
use tracing::{debug, trace, warn};

use crate::buffer::BufChain;
use crate::sync::{lock, Mailbox, TryPostError};
use crate::{
    AcceptVerdict, BridgeConfig, BridgeError, ConnSink, Deferrer, Endpoint, EngineError,
    EngineHandle, ListenerId, ListenerSink, NetStack, PacketBuf, RawConn, RawConnId, Result,
    TcpEvent,
};

bitflags! {
    #[derive(Debug, Copy, Clone, PartialEq, Eq, Hash)]
    pub struct Readiness: u16 {
        const READABLE = 1 << 0;
        const WRITABLE = 1 << 1;
    }
}

/// Readiness change for one connection index.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub struct PollEvent {
    pub index: u16,
    pub readiness: Readiness,
}

#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum ReadOutcome {
    /// Bytes copied into the caller's buffer (and acknowledged to the engine).
    Data(usize),
    /// Nothing buffered right now; a `READABLE` event follows when data arrives.
    NotReady,
    /// The peer finished sending and every received byte was consumed.
    Eof,
}

#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum WriteOutcome {
    /// The whole payload was taken; the engine may still be sending part of it.
    Accepted(usize),
    /// A previous payload is still pending; a `WRITABLE` event follows once it drained.
    WouldBlock,
}

#[derive(Debug, Default, Clone, Copy, PartialEq, Eq)]
pub struct PollerStats {
    pub accepted: u64,
    /// Connections aborted because every index was in use.
    pub rejected_capacity: u64,
    /// Connections aborted because the accept mailbox was full.
    pub rejected_backlog: u64,
    pub events_dropped: u64,
    pub would_block: u64,
    /// Indices returned to the free pool.
    pub released: u64,
}

#[derive(Default)]
struct Counters {
    accepted: AtomicU64,
    rejected_capacity: AtomicU64,
    rejected_backlog: AtomicU64,
    events_dropped: AtomicU64,
    would_block: AtomicU64,
    released: AtomicU64,
}

/// Entry of the accept mailbox.
#[derive(Debug)]
enum AcceptMsg {
    Conn(RawConn),
    /// The engine tore the listener down.
    Shutdown,
}

/// Zeroed event record, skipped by [`TcpPoller::events`].
const TOMBSTONE: u32 = 0;

fn pack_event(index: u16, readiness: Readiness) -> u32 {
    (u32::from(index) << 16) | u32::from(readiness.bits())
}

fn unpack_event(record: u32) -> (u16, Readiness) {
    (
        (record >> 16) as u16,
        Readiness::from_bits_truncate(record as u16),
    )
}

#[derive(Debug, Clone, Copy, PartialEq, Eq)]
enum SlotState {
    Free,
    Active,
    Closing,
}

struct Slot {
    state: SlotState,
    /// Bumped on every release; hooks carry the generation they were created for.
    generation: u64,
    conn: Option<RawConnId>,
    endpoint: Endpoint,
    rx: BufChain,
    /// Handed to the engine, not yet acknowledged by the peer.
    unacked: BufChain,
    /// Accepted from the caller, not yet (fully) handed to the engine.
    pending: Option<PacketBuf>,
    eof: bool,
    readable: bool,
    writable: bool,
    notify_readable: bool,
    notify_writable: bool,
    closed_by_caller: bool,
    /// The engine will not report anything more for `conn`.
    released: bool,
}

impl Slot {
    fn new() -> Self {
        Self {
            state: SlotState::Free,
            generation: 0,
            conn: None,
            endpoint: Endpoint::unspecified(),
            rx: BufChain::new(),
            unacked: BufChain::new(),
            pending: None,
            eof: false,
            readable: false,
            writable: false,
            notify_readable: false,
            notify_writable: false,
            closed_by_caller: false,
            released: false,
        }
    }

    fn activate(&mut self, conn: RawConn) {
        self.state = SlotState::Active;
        self.conn = Some(conn.id);
        self.endpoint = conn.endpoint;
        self.writable = true;
        self.notify_readable = true;
    }

    fn reset(&mut self) {
        let generation = self.generation.wrapping_add(1);
        *self = Slot::new();
        self.generation = generation;
    }

    fn discard_buffers(&mut self) {
        self.rx.clear();
        self.unacked.clear();
        self.pending = None;
        self.readable = false;
        self.writable = false;
    }

    fn check_open(&self, index: u16) -> Result<()> {
        match self.state {
            SlotState::Active => Ok(()),
            SlotState::Closing => Err(BridgeError::Closed),
            SlotState::Free => Err(BridgeError::NotActive(index)),
        }
    }
}

struct PollerShared {
    slots: Box<[Mutex<Slot>]>,
    free: Mutex<Vec<u16>>,
    accepts: Mailbox<AcceptMsg>,
    events: Mailbox<u32>,
    closed: AtomicBool,
    counters: Counters,
}

impl PollerShared {
    fn new(capacity: usize, backlog: usize) -> Self {
        let slots = (0..capacity).map(|_| Mutex::new(Slot::new())).collect();
        // Reversed so the lowest index is handed out first.
        let free = (0..capacity).rev().map(|i| i as u16).collect();
        Self {
            slots,
            free: Mutex::new(free),
            accepts: Mailbox::new(backlog),
            events: Mailbox::new(capacity.saturating_mul(4)),
            closed: AtomicBool::new(false),
            counters: Counters::default(),
        }
    }

    fn post_event(&self, index: u16, readiness: Readiness) {
        if let Err(TryPostError::Full(_)) = self.events.try_post(pack_event(index, readiness)) {
            self.counters.events_dropped.fetch_add(1, Ordering::Relaxed);
            trace!(index, ?readiness, "event mailbox full, dropped readiness event");
        }
    }

    /// Return `index` to the free pool. The caller holds the slot lock.
    fn release_slot(&self, index: u16, slot: &mut Slot) {
        slot.reset();
        self.events.for_each_queued(|record| {
            if *record != TOMBSTONE && unpack_event(*record).0 == index {
                *record = TOMBSTONE;
            }
        });
        lock(&self.free).push(index);
        self.counters.released.fetch_add(1, Ordering::Relaxed);
        debug!(index, "connection index released");
    }

    /// The engine is done with the connection: free the index if the caller is too, otherwise park
    /// it in `Closing` and wake whoever waits on it.
    fn retire(&self, index: u16, slot: &mut Slot) {
        slot.released = true;
        if slot.closed_by_caller {
            self.release_slot(index, slot);
            return;
        }
        slot.state = SlotState::Closing;
        slot.discard_buffers();
        self.post_event(index, Readiness::READABLE | Readiness::WRITABLE);
    }
}

struct ListenHook {
    shared: Arc<PollerShared>,
}

impl ListenerSink for ListenHook {
    fn on_accept(&self, conn: RawConn) -> AcceptVerdict {
        match self.shared.accepts.try_post(AcceptMsg::Conn(conn)) {
            Ok(()) => AcceptVerdict::Keep,
            Err(err) => {
                if !err.is_closed() {
                    self.shared
                        .counters
                        .rejected_backlog
                        .fetch_add(1, Ordering::Relaxed);
                    trace!(endpoint = %conn.endpoint, "accept mailbox full, rejecting connection");
                }
                AcceptVerdict::Reject
            }
        }
    }

    fn on_listener_closed(&self) {
        debug!("listener closed by engine");
        let _ = self.shared.accepts.force_post(AcceptMsg::Shutdown);
    }
}

struct ConnHook<S: NetStack> {
    shared: Arc<PollerShared>,
    index: u16,
    generation: u64,
    deferrer: Deferrer<S>,
}

impl<S: NetStack> ConnHook<S> {
    fn schedule_flush(&self) {
        let shared = Arc::clone(&self.shared);
        let index = self.index;
        let generation = self.generation;
        let deferred = self.deferrer.defer(move |stack| {
            flush_pending(stack, &shared, index, generation);
        });
        if deferred.is_err() {
            trace!(index, "engine stopped, pending write not flushed");
        }
    }
}

impl<S: NetStack> ConnSink for ConnHook<S> {
    fn on_event(&self, event: TcpEvent) {
        let index = self.index;
        let mut slot = lock(&self.shared.slots[usize::from(index)]);
        if slot.generation != self.generation || slot.state == SlotState::Free {
            trace!(index, "event for a recycled index ignored");
            return;
        }

        match event {
            TcpEvent::Received(buf) => {
                if slot.state != SlotState::Active {
                    return;
                }
                slot.rx.push(buf);
                slot.readable = true;
                if mem::take(&mut slot.notify_readable) {
                    self.shared.post_event(index, Readiness::READABLE);
                }
            }
            TcpEvent::Eof => {
                slot.eof = true;
                if slot.state == SlotState::Active {
                    slot.readable = true;
                    if mem::take(&mut slot.notify_readable) {
                        self.shared.post_event(index, Readiness::READABLE);
                    }
                }
            }
            TcpEvent::Sent(len) => {
                slot.unacked.consume(len);
                if slot.state == SlotState::Active && slot.pending.is_some() {
                    drop(slot);
                    self.schedule_flush();
                }
            }
            // Covers a pending payload that no `Sent` will retry: the engine refused it for
            // memory, or took nothing while no bytes were in flight.
            TcpEvent::Poll => {
                if slot.state == SlotState::Active && slot.pending.is_some() {
                    drop(slot);
                    self.schedule_flush();
                }
            }
            TcpEvent::Error(err) => {
                debug!(index, %err, "connection failed");
                self.shared.retire(index, &mut slot);
            }
            TcpEvent::Released => {
                self.shared.retire(index, &mut slot);
            }
        }
    }
}

/// Hand the slot's pending payload to the engine.
///
/// Whatever the engine does not take stays pending. The slot lock is not held across the engine
/// call, since the engine may invoke the connection's hook synchronously.
fn push_pending<S: NetStack>(
    stack: &mut S,
    cell: &Mutex<Slot>,
    generation: u64,
) -> std::result::Result<(), EngineError> {
    let (conn, mut pending) = {
        let mut slot = lock(cell);
        if slot.generation != generation || slot.state != SlotState::Active {
            return Ok(());
        }
        match (slot.conn, slot.pending.take()) {
            (Some(conn), Some(pending)) => (conn, pending),
            (_, pending) => {
                slot.pending = pending;
                return Ok(());
            }
        }
    };

    let result = stack.tcp_write(conn, pending.as_slice());

    let mut slot = lock(cell);
    if slot.generation != generation || slot.state != SlotState::Active {
        return Ok(());
    }
    match result {
        Ok(taken) => {
            if taken < pending.len() {
                slot.pending = Some(pending.split_off(taken));
            }
            slot.unacked.push(pending);
            Ok(())
        }
        Err(EngineError::Mem) => {
            slot.pending = Some(pending);
            Ok(())
        }
        Err(err) => Err(err),
    }
}

/// Deferred after a `Sent` or `Poll` event: retry the pending payload and signal `WRITABLE` once
/// it drained.
fn flush_pending<S: NetStack>(stack: &mut S, shared: &PollerShared, index: u16, generation: u64) {
    let cell = &shared.slots[usize::from(index)];
    if let Err(err) = push_pending(stack, cell, generation) {
        trace!(index, %err, "pending write rejected by engine");
    }

    let mut slot = lock(cell);
    if slot.generation != generation || slot.state != SlotState::Active {
        return;
    }
    if slot.pending.is_none() {
        slot.writable = true;
        if mem::take(&mut slot.notify_writable) {
            shared.post_event(index, Readiness::WRITABLE);
        }
    }
}

/// Listener plus fixed-capacity connection table.
pub struct TcpPoller<S: NetStack> {
    engine: EngineHandle<S>,
    shared: Arc<PollerShared>,
    listener: ListenerId,
}

impl<S: NetStack> TcpPoller<S> {
    /// Start listening on the virtual interface with `config.tcp_capacity` indices.
    pub fn open(engine: &EngineHandle<S>, config: &BridgeConfig) -> Result<Self> {
        config.validate()?;
        let capacity = config.tcp_capacity;
        let backlog = config.accept_backlog;
        let shared = Arc::new(PollerShared::new(capacity, backlog));

        let hook: Arc<dyn ListenerSink> = Arc::new(ListenHook {
            shared: Arc::clone(&shared),
        });
        let listener = engine.call(move |stack| stack.tcp_listen(hook, backlog))??;

        debug!(capacity, backlog, "tcp poller listening");
        Ok(Self {
            engine: engine.clone(),
            shared,
            listener,
        })
    }

    pub fn capacity(&self) -> usize {
        self.shared.slots.len()
    }

    pub fn is_closed(&self) -> bool {
        self.shared.closed.load(Ordering::Acquire)
    }

    fn slot(&self, index: u16) -> Result<&Mutex<Slot>> {
        if self.is_closed() {
            return Err(BridgeError::Closed);
        }
        self.shared
            .slots
            .get(usize::from(index))
            .ok_or(BridgeError::InvalidIndex {
                index,
                capacity: self.capacity(),
            })
    }

    /// Block until a connection is assigned an index.
    ///
    /// Connections arriving while every index is in use are aborted and never surface here.
    /// Returns [`BridgeError::Closed`] once the poller or the engine-side listener is closed.
    pub fn accept(&self) -> Result<(u16, Endpoint)> {
        loop {
            let raw = match self.shared.accepts.recv() {
                Some(AcceptMsg::Conn(raw)) => raw,
                Some(AcceptMsg::Shutdown) => {
                    self.drain_accepts();
                    return Err(BridgeError::Closed);
                }
                None => return Err(BridgeError::Closed),
            };

            let Some(index) = lock(&self.shared.free).pop() else {
                self.shared
                    .counters
                    .rejected_capacity
                    .fetch_add(1, Ordering::Relaxed);
                debug!(endpoint = %raw.endpoint, "no free connection index, rejecting");
                self.engine.with_core(|stack| stack.tcp_abort(raw.id));
                continue;
            };

            match self.activate(index, raw) {
                Ok(()) => {
                    self.shared.counters.accepted.fetch_add(1, Ordering::Relaxed);
                    debug!(index, endpoint = %raw.endpoint, "accepted connection");
                    return Ok((index, raw.endpoint));
                }
                Err(BridgeError::Closed) => return Err(BridgeError::Closed),
                Err(err) => {
                    warn!(index, %err, "failed to install connection hooks");
                }
            }
        }
    }

    /// Install the connection's hooks and mark `index` Active.
    ///
    /// Runs under the core lock, as does the slot sweep in [`TcpPoller::close`], so a connection
    /// is either swept by `close` or aborted here. It never outlives the poller.
    fn activate(&self, index: u16, raw: RawConn) -> Result<()> {
        let cell = &self.shared.slots[usize::from(index)];
        let deferrer = self.engine.deferrer();
        self.engine.with_core(|stack| {
            if self.is_closed() {
                stack.tcp_abort(raw.id);
                lock(&self.shared.free).push(index);
                debug!(index, endpoint = %raw.endpoint, "poller closed during accept, aborting");
                return Err(BridgeError::Closed);
            }
            let generation = {
                let mut slot = lock(cell);
                slot.activate(raw);
                slot.generation
            };
            let hook: Arc<dyn ConnSink> = Arc::new(ConnHook {
                shared: Arc::clone(&self.shared),
                index,
                generation,
                deferrer,
            });
            if let Err(err) = stack.tcp_bind_sink(raw.id, hook) {
                stack.tcp_abort(raw.id);
                let mut slot = lock(cell);
                if slot.generation == generation {
                    self.shared.release_slot(index, &mut slot);
                }
                return Err(err.into());
            }
            Ok(())
        })
    }

    /// After the listener went away: refuse further connections and abort the queued ones.
    fn drain_accepts(&self) {
        let queued = self.shared.accepts.close();
        if queued.is_empty() {
            return;
        }
        debug!(count = queued.len(), "aborting connections queued for accept");
        self.engine.with_core(|stack| {
            for msg in queued {
                if let AcceptMsg::Conn(raw) = msg {
                    stack.tcp_abort(raw.id);
                }
            }
        });
    }

    /// Block until at least one readiness event is available; return up to `max` of them.
    ///
    /// Events for the same index within one batch are merged.
    pub fn events(&self, max: usize) -> Result<Vec<PollEvent>> {
        loop {
            let Some(batch) = self.shared.events.recv_batch(max) else {
                return Err(BridgeError::Closed);
            };

            let mut out: Vec<PollEvent> = Vec::with_capacity(batch.len());
            for record in batch {
                if record == TOMBSTONE {
                    continue;
                }
                let (index, readiness) = unpack_event(record);
                match out.iter_mut().find(|ev| ev.index == index) {
                    Some(ev) => ev.readiness |= readiness,
                    None => out.push(PollEvent { index, readiness }),
                }
            }
            if !out.is_empty() {
                return Ok(out);
            }
        }
    }

    /// Copy buffered bytes for `index` into `buf` without blocking.
    ///
    /// Bytes not fitting in `buf` stay buffered for the next call. Only the bytes actually copied
    /// are acknowledged to the engine.
    pub fn read(&self, index: u16, buf: &mut [u8]) -> Result<ReadOutcome> {
        let cell = self.slot(index)?;
        self.engine.with_core(|stack: &mut S| -> Result<ReadOutcome> {
            let (conn, copied) = {
                let mut slot = lock(cell);
                slot.check_open(index)?;
                if !slot.readable {
                    slot.notify_readable = true;
                    return Ok(ReadOutcome::NotReady);
                }
                if buf.is_empty() {
                    return Ok(ReadOutcome::Data(0));
                }

                let copied = slot.rx.copy_out(buf);
                if slot.rx.is_empty() {
                    if slot.eof {
                        if copied == 0 {
                            return Ok(ReadOutcome::Eof);
                        }
                    } else {
                        slot.readable = false;
                        slot.notify_readable = true;
                    }
                }
                if copied == 0 {
                    return Ok(ReadOutcome::NotReady);
                }
                (slot.conn, copied)
            };

            if let Some(conn) = conn {
                stack.tcp_recved(conn, copied);
            }
            Ok(ReadOutcome::Data(copied))
        })
    }

    /// Queue `data` for sending on `index` without blocking.
    ///
    /// At most one payload is pending per connection; while it is, further writes return
    /// [`WriteOutcome::WouldBlock`] and take nothing.
    pub fn write(&self, index: u16, data: &[u8]) -> Result<WriteOutcome> {
        let cell = self.slot(index)?;
        self.engine.with_core(|stack: &mut S| -> Result<WriteOutcome> {
            let generation = {
                let mut slot = lock(cell);
                slot.check_open(index)?;
                if slot.pending.is_some() {
                    slot.writable = false;
                    slot.notify_writable = true;
                    self.shared
                        .counters
                        .would_block
                        .fetch_add(1, Ordering::Relaxed);
                    return Ok(WriteOutcome::WouldBlock);
                }
                if data.is_empty() {
                    return Ok(WriteOutcome::Accepted(0));
                }
                slot.pending = Some(PacketBuf::try_copy_from(data)?);
                slot.generation
            };

            push_pending(stack, cell, generation)?;

            let mut slot = lock(cell);
            if slot.generation == generation && slot.state == SlotState::Active {
                slot.writable = slot.pending.is_none();
            }
            Ok(WriteOutcome::Accepted(data.len()))
        })
    }

    /// Close the connection at `index`. Idempotent.
    ///
    /// Reads and writes fail from now on. The index only becomes reusable once the engine
    /// confirmed teardown.
    pub fn close_index(&self, index: u16) -> Result<()> {
        let cell = self.slot(index)?;
        self.engine.with_core(|stack| {
            let (conn, generation) = {
                let mut slot = lock(cell);
                match slot.state {
                    SlotState::Free => return,
                    SlotState::Closing => {
                        slot.closed_by_caller = true;
                        if slot.released {
                            self.shared.release_slot(index, &mut slot);
                        }
                        return;
                    }
                    SlotState::Active => {}
                }
                slot.state = SlotState::Closing;
                slot.closed_by_caller = true;
                slot.discard_buffers();
                let Some(conn) = slot.conn else {
                    self.shared.release_slot(index, &mut slot);
                    return;
                };
                (conn, slot.generation)
            };

            let aborted = match stack.tcp_close(conn) {
                Ok(()) => false,
                Err(err) => {
                    warn!(index, %err, "graceful close failed, aborting connection");
                    stack.tcp_abort(conn);
                    true
                }
            };

            let mut slot = lock(cell);
            if slot.generation != generation {
                return;
            }
            if aborted {
                slot.released = true;
            }
            if slot.released {
                self.shared.release_slot(index, &mut slot);
            }
        });
        Ok(())
    }

    /// Endpoint of the connection at `index`, while it is active or closing.
    pub fn endpoint(&self, index: u16) -> Result<Endpoint> {
        let slot = lock(self.slot(index)?);
        match slot.state {
            SlotState::Free => Err(BridgeError::NotActive(index)),
            SlotState::Active | SlotState::Closing => Ok(slot.endpoint),
        }
    }

    /// Bytes written on `index` that the peer has not acknowledged yet, including the pending
    /// payload.
    pub fn outstanding(&self, index: u16) -> Result<usize> {
        let slot = lock(self.slot(index)?);
        slot.check_open(index)?;
        Ok(slot.unacked.len() + slot.pending.as_ref().map_or(0, PacketBuf::len))
    }

    /// Stop listening, abort every connection and wake all waiters. Idempotent.
    pub fn close(&self) {
        if self.shared.closed.swap(true, Ordering::AcqRel) {
            return;
        }
        let queued = self.shared.accepts.close();

        self.engine.with_core(|stack| {
            stack.tcp_unlisten(self.listener);
            for msg in queued {
                if let AcceptMsg::Conn(raw) = msg {
                    stack.tcp_abort(raw.id);
                }
            }
            for (index, cell) in self.shared.slots.iter().enumerate() {
                let conn = {
                    let mut slot = lock(cell);
                    if slot.state == SlotState::Free {
                        continue;
                    }
                    let conn = if slot.released { None } else { slot.conn };
                    self.shared.release_slot(index as u16, &mut slot);
                    conn
                };
                if let Some(conn) = conn {
                    stack.tcp_abort(conn);
                }
            }
        });

        self.shared.events.close();
        debug!("tcp poller closed");
    }

    pub fn stats(&self) -> PollerStats {
        let c = &self.shared.counters;
        PollerStats {
            accepted: c.accepted.load(Ordering::Relaxed),
            rejected_capacity: c.rejected_capacity.load(Ordering::Relaxed),
            rejected_backlog: c.rejected_backlog.load(Ordering::Relaxed),
            events_dropped: c.events_dropped.load(Ordering::Relaxed),
            would_block: c.would_block.load(Ordering::Relaxed),
            released: c.released.load(Ordering::Relaxed),
        }
    }
}

impl<S: NetStack> Drop for TcpPoller<S> {
    fn drop(&mut self) {
        self.close();
    }
}

impl<S: NetStack> std::fmt::Debug for TcpPoller<S> {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.debug_struct("TcpPoller")
            .field("capacity", &self.capacity())
            .field("closed", &self.is_closed())
            .field("stats", &self.stats())
            .finish()
    }
}
