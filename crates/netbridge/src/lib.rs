//! Thread bridge between a single-threaded, callback-driven TCP/IP engine and blocking caller
//! threads.
//!
//! The engine runs on its own thread behind a core lock ([`Engine`]). On top of it this crate
//! provides:
//! - [`Device`]: an emulated link. Engine output queues in a bounded rx ring for callers to read;
//!   caller writes queue in a tx ring drained into the engine by one deferred flush task at a time.
//! - [`TcpPoller`]: accepted connections in a fixed table addressed by `u16` index, with
//!   non-blocking read/write and a blocking, edge-triggered readiness feed.
//! - [`UdpConn`]: a datagram socket that preserves message boundaries.
//!
//! Every queue is bounded. Overflow drops data (counted in the component stats) rather than
//! blocking the engine; reliability is the engine's job.
#![forbid(unsafe_code)]

mod bridge;
mod buffer;
mod config;
mod device;
mod endpoint;
mod engine;
mod error;
mod iface;
// Test engine; only built for this crate's own tests or with the `sim` feature.
#[cfg(any(test, feature = "sim"))]
mod sim;
mod stack;
mod sync;
mod tcp;
mod udp;

pub use bridge::NetBridge;
pub use buffer::{BufChain, PacketBuf};
pub use config::{
    BridgeConfig, ConfigError, DEFAULT_ACCEPT_BACKLOG, DEFAULT_MTU, DEFAULT_TASK_QUEUE_CAPACITY,
    DEFAULT_TCP_CAPACITY, DEFAULT_TIMER_INTERVAL, DEFAULT_UDP_MAILBOX_CAPACITY, MAX_TCP_CAPACITY,
};
pub use device::{Device, DeviceStats, RxStatus, MAX_TX_FLUSH_BATCH};
pub use endpoint::{Endpoint, EndpointError, ENDPOINT_LEN};
pub use engine::{Deferrer, Engine, EngineHandle};
pub use error::{BridgeError, EngineError, Result};
pub use iface::{InterfaceRegistry, LinkToken};
#[cfg(any(test, feature = "sim"))]
pub use sim::{SimConnState, SimStack, SIM_SEND_BUFFER};
pub use stack::{
    AcceptVerdict, ConnSink, DatagramSink, LinkOutput, ListenerId, ListenerSink, NetStack, RawConn,
    RawConnId, TcpEvent, UdpId,
};
pub use sync::{Mailbox, Recv, TryPostError};
pub use tcp::{PollEvent, PollerStats, Readiness, ReadOutcome, TcpPoller, WriteOutcome};
pub use udp::{Datagram, UdpConn, UdpStats};
