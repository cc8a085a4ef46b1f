use std::sync::atomic::{AtomicU64, Ordering};
use std::sync::Mutex;

use crate::config::DEFAULT_MTU;
use crate::sync::lock;
use crate::{BridgeError, Result};

/// Proof of ownership of the virtual interface.
///
/// Deliberately neither `Clone` nor `Copy`: exactly one device holds the interface at a time and
/// gives it back through [`InterfaceRegistry::release`].
#[derive(Debug, PartialEq, Eq)]
pub struct LinkToken {
    id: u64,
    mtu: usize,
}

impl LinkToken {
    pub fn mtu(&self) -> usize {
        self.mtu
    }
}

#[derive(Debug)]
struct IfaceState {
    owner: Option<u64>,
    mtu: usize,
}

/// The engine's single virtual interface and who currently drives its link layer.
#[derive(Debug)]
pub struct InterfaceRegistry {
    state: Mutex<IfaceState>,
    next_token: AtomicU64,
}

impl InterfaceRegistry {
    pub fn new() -> Self {
        Self {
            state: Mutex::new(IfaceState {
                owner: None,
                mtu: DEFAULT_MTU,
            }),
            next_token: AtomicU64::new(1),
        }
    }

    pub fn claim(&self, mtu: usize) -> Result<LinkToken> {
        let mut state = lock(&self.state);
        if state.owner.is_some() {
            return Err(BridgeError::AlreadyAttached);
        }
        let id = self.next_token.fetch_add(1, Ordering::Relaxed);
        state.owner = Some(id);
        state.mtu = mtu;
        Ok(LinkToken { id, mtu })
    }

    /// Give the interface back. Returns `false` (and changes nothing) if `token` is not the
    /// current owner's.
    pub fn release(&self, token: LinkToken) -> bool {
        let mut state = lock(&self.state);
        if state.owner != Some(token.id) {
            return false;
        }
        state.owner = None;
        state.mtu = DEFAULT_MTU;
        true
    }

    pub fn is_attached(&self) -> bool {
        lock(&self.state).owner.is_some()
    }

    pub fn mtu(&self) -> usize {
        lock(&self.state).mtu
    }
}

impl Default for InterfaceRegistry {
    fn default() -> Self {
        Self::new()
    }
}
