//! Fixed 12-byte IPv4 endpoint record.
//!
//! Wire layout (multi-byte fields in network byte order):
//!
//! ```text
//! 0      4      6      10     12
//! +------+------+------+------+
//! | src  | src  | dst  | dst  |
//! | addr | port | addr | port |
//! +------+------+------+------+
//! ```

use std::fmt;
use std::net::{Ipv4Addr, SocketAddrV4};

use thiserror::Error;

/// Encoded endpoint length in bytes.
pub const ENDPOINT_LEN: usize = 12;

#[derive(Debug, Error, Clone, Copy, PartialEq, Eq)]
pub enum EndpointError {
    #[error("endpoint record too short: {len} bytes, need 12")]
    TooShort { len: usize },
}

/// Source and destination of a connection or datagram, as seen from the engine.
///
/// For an accepted TCP connection `src` is the remote peer and `dst` the local address it
/// connected to. For a received datagram `src` is the sender and `dst` the address it was sent
/// to. When sending a datagram, `src` is the source the engine stamps on the packet and `dst` is
/// where it goes.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash)]
pub struct Endpoint {
    pub src: SocketAddrV4,
    pub dst: SocketAddrV4,
}

impl Endpoint {
    pub const fn new(src: SocketAddrV4, dst: SocketAddrV4) -> Self {
        Self { src, dst }
    }

    pub const fn unspecified() -> Self {
        Self {
            src: SocketAddrV4::new(Ipv4Addr::UNSPECIFIED, 0),
            dst: SocketAddrV4::new(Ipv4Addr::UNSPECIFIED, 0),
        }
    }

    /// Swap source and destination, e.g. to address a reply.
    pub const fn reversed(self) -> Self {
        Self {
            src: self.dst,
            dst: self.src,
        }
    }

    pub fn encode(&self) -> [u8; ENDPOINT_LEN] {
        let mut out = [0u8; ENDPOINT_LEN];
        out[0..4].copy_from_slice(&self.src.ip().octets());
        out[4..6].copy_from_slice(&self.src.port().to_be_bytes());
        out[6..10].copy_from_slice(&self.dst.ip().octets());
        out[10..12].copy_from_slice(&self.dst.port().to_be_bytes());
        out
    }

    /// Decode the first [`ENDPOINT_LEN`] bytes of `buf`. Trailing bytes are ignored.
    pub fn decode(buf: &[u8]) -> Result<Self, EndpointError> {
        if buf.len() < ENDPOINT_LEN {
            return Err(EndpointError::TooShort { len: buf.len() });
        }

        let src_ip = Ipv4Addr::new(buf[0], buf[1], buf[2], buf[3]);
        let src_port = u16::from_be_bytes([buf[4], buf[5]]);
        let dst_ip = Ipv4Addr::new(buf[6], buf[7], buf[8], buf[9]);
        let dst_port = u16::from_be_bytes([buf[10], buf[11]]);

        Ok(Self {
            src: SocketAddrV4::new(src_ip, src_port),
            dst: SocketAddrV4::new(dst_ip, dst_port),
        })
    }
}

impl Default for Endpoint {
    fn default() -> Self {
        Self::unspecified()
    }
}

impl fmt::Display for Endpoint {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        write!(f, "{} -> {}", self.src, self.dst)
    }
}
