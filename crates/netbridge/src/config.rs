use std::time::Duration;

use thiserror::Error;

use netbridge_ring::DEFAULT_RING_CAPACITY;

pub const DEFAULT_MTU: usize = 1500;
pub const DEFAULT_TCP_CAPACITY: usize = 512;
pub const DEFAULT_ACCEPT_BACKLOG: usize = 128;
pub const DEFAULT_UDP_MAILBOX_CAPACITY: usize = 256;
pub const DEFAULT_TASK_QUEUE_CAPACITY: usize = 1024;
pub const DEFAULT_TIMER_INTERVAL: Duration = Duration::from_millis(250);

/// Connection indices are `u16`, so the table can never be larger than this.
pub const MAX_TCP_CAPACITY: usize = 1 << 16;

#[derive(Debug, Error, Clone, PartialEq, Eq)]
pub enum ConfigError {
    #[error("invalid value for env var {0}")]
    InvalidEnv(&'static str),

    #[error("{0} must be non-zero")]
    Zero(&'static str),

    #[error("tcp_capacity {0} exceeds the maximum of 65536")]
    TcpCapacityTooLarge(usize),
}

/// Sizing knobs for one bridge instance.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct BridgeConfig {
    pub mtu: usize,
    /// Slots in each device ring (rx and tx).
    pub ring_capacity: usize,
    /// Number of TCP connection indices.
    pub tcp_capacity: usize,
    /// Raw connections waiting for `accept()` before the engine starts rejecting them.
    pub accept_backlog: usize,
    pub udp_mailbox_capacity: usize,
    /// Deferred tasks that may be queued for the engine thread before `try_submit` reports busy.
    pub task_queue_capacity: usize,
    /// Period of `NetStack::poll_timers` calls on the engine thread, independent of task traffic.
    pub timer_interval: Duration,
}

impl Default for BridgeConfig {
    fn default() -> Self {
        Self {
            mtu: DEFAULT_MTU,
            ring_capacity: DEFAULT_RING_CAPACITY,
            tcp_capacity: DEFAULT_TCP_CAPACITY,
            accept_backlog: DEFAULT_ACCEPT_BACKLOG,
            udp_mailbox_capacity: DEFAULT_UDP_MAILBOX_CAPACITY,
            task_queue_capacity: DEFAULT_TASK_QUEUE_CAPACITY,
            timer_interval: DEFAULT_TIMER_INTERVAL,
        }
    }
}

impl BridgeConfig {
    /// Defaults overridden by `NETBRIDGE_*` environment variables.
    pub fn from_env() -> Result<Self, ConfigError> {
        Self::from_lookup(|key| std::env::var(key).ok())
    }

    /// Like [`BridgeConfig::from_env`], reading variables through `lookup`.
    pub fn from_lookup(lookup: impl Fn(&str) -> Option<String>) -> Result<Self, ConfigError> {
        let parse = |key: &'static str| -> Result<Option<u64>, ConfigError> {
            match lookup(key) {
                None => Ok(None),
                Some(raw) => raw
                    .trim()
                    .parse::<u64>()
                    .map(Some)
                    .map_err(|_| ConfigError::InvalidEnv(key)),
            }
        };
        let parse_usize = |key: &'static str| -> Result<Option<usize>, ConfigError> {
            parse(key)?
                .map(|v| usize::try_from(v).map_err(|_| ConfigError::InvalidEnv(key)))
                .transpose()
        };

        let mut cfg = Self::default();
        if let Some(v) = parse_usize("NETBRIDGE_MTU")? {
            cfg.mtu = v;
        }
        if let Some(v) = parse_usize("NETBRIDGE_RING_CAPACITY")? {
            cfg.ring_capacity = v;
        }
        if let Some(v) = parse_usize("NETBRIDGE_TCP_CAPACITY")? {
            cfg.tcp_capacity = v;
        }
        if let Some(v) = parse_usize("NETBRIDGE_ACCEPT_BACKLOG")? {
            cfg.accept_backlog = v;
        }
        if let Some(v) = parse_usize("NETBRIDGE_UDP_MAILBOX")? {
            cfg.udp_mailbox_capacity = v;
        }
        if let Some(v) = parse_usize("NETBRIDGE_TASK_QUEUE")? {
            cfg.task_queue_capacity = v;
        }
        if let Some(v) = parse("NETBRIDGE_TIMER_INTERVAL_MS")? {
            cfg.timer_interval = Duration::from_millis(v);
        }

        cfg.validate()?;
        Ok(cfg)
    }

    pub fn validate(&self) -> Result<(), ConfigError> {
        let non_zero = [
            ("mtu", self.mtu),
            ("ring_capacity", self.ring_capacity),
            ("tcp_capacity", self.tcp_capacity),
            ("accept_backlog", self.accept_backlog),
            ("udp_mailbox_capacity", self.udp_mailbox_capacity),
            ("task_queue_capacity", self.task_queue_capacity),
        ];
        for (name, value) in non_zero {
            if value == 0 {
                return Err(ConfigError::Zero(name));
            }
        }
        if self.timer_interval.is_zero() {
            return Err(ConfigError::Zero("timer_interval"));
        }
        if self.tcp_capacity > MAX_TCP_CAPACITY {
            return Err(ConfigError::TcpCapacityTooLarge(self.tcp_capacity));
        }
        Ok(())
    }
}
