use thiserror::Error;

use crate::config::ConfigError;

pub type Result<T> = std::result::Result<T, BridgeError>;

/// Failure reported by the protocol engine itself.
#[derive(Debug, Error, Clone, Copy, PartialEq, Eq)]
pub enum EngineError {
    #[error("out of memory")]
    Mem,

    #[error("connection reset")]
    Reset,

    #[error("connection aborted")]
    Aborted,

    #[error("connection closed")]
    Closed,

    #[error("not connected")]
    NotConnected,

    #[error("address in use")]
    InUse,

    #[error("illegal argument")]
    InvalidArgument,
}

/// Unified result type for every caller-facing bridge operation.
///
/// Expected conditions (closed objects, full queues, exhausted capacity on a send path) are
/// variants here rather than panics. Bounded-loss drops (ring overwrite, full mailboxes on the
/// engine side) are not errors at all and only show up in the component stats.
#[derive(Debug, Error, Clone, PartialEq, Eq)]
pub enum BridgeError {
    /// Terminal: the object was closed. Every later call returns this immediately.
    #[error("closed")]
    Closed,

    #[error("connection index {index} out of range (capacity {capacity})")]
    InvalidIndex { index: u16, capacity: usize },

    #[error("connection index {0} is not active")]
    NotActive(u16),

    #[error("failed to allocate a {0}-byte packet buffer")]
    Alloc(usize),

    #[error("engine task queue is full")]
    EngineBusy,

    #[error("engine is not running")]
    EngineStopped,

    #[error("virtual interface already has an attached device")]
    AlreadyAttached,

    #[error("failed to spawn engine thread: {0}")]
    Spawn(String),

    #[error("engine error: {0}")]
    Engine(#[from] EngineError),

    #[error("invalid configuration: {0}")]
    Config(#[from] ConfigError),
}
