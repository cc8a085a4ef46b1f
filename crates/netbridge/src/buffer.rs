//! Owned packet buffers.
//!
//! A [`PacketBuf`] has exactly one owner at a time; it moves across every queue boundary (rings,
//! mailboxes, engine hooks) and is released when that owner drops it. There is no manual free.

use std::collections::VecDeque;

use crate::{BridgeError, Result};

#[derive(Debug, Default, PartialEq, Eq)]
pub struct PacketBuf {
    data: Vec<u8>,
}

impl PacketBuf {
    /// Copy `src` into a freshly allocated buffer.
    ///
    /// Allocation failure is reported as [`BridgeError::Alloc`] instead of aborting the process so
    /// that only the pending operation fails.
    pub fn try_copy_from(src: &[u8]) -> Result<Self> {
        let mut data = Vec::new();
        data.try_reserve_exact(src.len())
            .map_err(|_| BridgeError::Alloc(src.len()))?;
        data.extend_from_slice(src);
        Ok(Self { data })
    }

    pub fn from_vec(data: Vec<u8>) -> Self {
        Self { data }
    }

    pub fn len(&self) -> usize {
        self.data.len()
    }

    pub fn is_empty(&self) -> bool {
        self.data.is_empty()
    }

    pub fn as_slice(&self) -> &[u8] {
        &self.data
    }

    pub fn into_vec(self) -> Vec<u8> {
        self.data
    }

    /// Split the buffer at `at`, keeping `[0, at)` in `self` and returning `[at, len)`.
    pub fn split_off(&mut self, at: usize) -> PacketBuf {
        let at = at.min(self.data.len());
        PacketBuf {
            data: self.data.split_off(at),
        }
    }

    /// Copy bytes starting at `offset` into `dst`. Returns the number of bytes copied.
    pub fn copy_to(&self, offset: usize, dst: &mut [u8]) -> usize {
        let Some(src) = self.data.get(offset..) else {
            return 0;
        };
        let n = src.len().min(dst.len());
        dst[..n].copy_from_slice(&src[..n]);
        n
    }
}

impl AsRef<[u8]> for PacketBuf {
    fn as_ref(&self) -> &[u8] {
        &self.data
    }
}

impl From<Vec<u8>> for PacketBuf {
    fn from(data: Vec<u8>) -> Self {
        Self::from_vec(data)
    }
}

/// FIFO chain of packet buffers consumed as one byte stream.
///
/// Used for a connection's accumulated receive data and for its outstanding (handed to the engine
/// but not yet confirmed) send data.
#[derive(Debug, Default)]
pub struct BufChain {
    bufs: VecDeque<PacketBuf>,
    /// Bytes of `bufs[0]` already consumed.
    offset: usize,
    len: usize,
}

impl BufChain {
    pub fn new() -> Self {
        Self::default()
    }

    /// Unconsumed bytes in the chain.
    pub fn len(&self) -> usize {
        self.len
    }

    pub fn is_empty(&self) -> bool {
        self.len == 0
    }

    pub fn push(&mut self, buf: PacketBuf) {
        if buf.is_empty() {
            return;
        }
        self.len += buf.len();
        self.bufs.push_back(buf);
    }

    /// Copy as many bytes as fit into `dst`, consuming them. The remainder stays queued for the next
    /// call.
    pub fn copy_out(&mut self, dst: &mut [u8]) -> usize {
        let mut copied = 0;
        while copied < dst.len() {
            let Some(front) = self.bufs.front() else {
                break;
            };
            let n = front.copy_to(self.offset, &mut dst[copied..]);
            copied += n;
            self.advance_front(n);
        }
        copied
    }

    /// Discard up to `n` bytes from the front. Returns the number of bytes discarded.
    pub fn consume(&mut self, n: usize) -> usize {
        let mut remaining = n;
        while remaining > 0 {
            let Some(front) = self.bufs.front() else {
                break;
            };
            let step = (front.len() - self.offset).min(remaining);
            self.advance_front(step);
            remaining -= step;
        }
        n - remaining
    }

    pub fn clear(&mut self) {
        self.bufs.clear();
        self.offset = 0;
        self.len = 0;
    }

    fn advance_front(&mut self, n: usize) {
        self.offset += n;
        self.len -= n;
        if let Some(front) = self.bufs.front() {
            if self.offset >= front.len() {
                self.bufs.pop_front();
                self.offset = 0;
            }
        }
    }
}
