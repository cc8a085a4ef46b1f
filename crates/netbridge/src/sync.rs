//! Lock helpers and the bounded [`Mailbox`] used for every blocking hand-off in the bridge.

use std::collections::VecDeque;
use std::sync::{Condvar, Mutex, MutexGuard};
use std::time::{Duration, Instant};

/// Lock `mutex`, recovering the guard if a previous holder panicked.
///
/// Bridge state stays structurally valid across a panic (every mutation is a single push/pop or
/// flag flip), so continuing with the inner value is preferable to cascading the panic into every
/// caller thread.
pub(crate) fn lock<T>(mutex: &Mutex<T>) -> MutexGuard<'_, T> {
    mutex
        .lock()
        .unwrap_or_else(|poisoned| poisoned.into_inner())
}

pub(crate) fn wait<'a, T>(cv: &Condvar, guard: MutexGuard<'a, T>) -> MutexGuard<'a, T> {
    cv.wait(guard)
        .unwrap_or_else(|poisoned| poisoned.into_inner())
}

/// Rejected [`Mailbox::try_post`]; hands the item back to the caller.
#[derive(Debug, PartialEq, Eq)]
pub enum TryPostError<T> {
    Full(T),
    Closed(T),
}

impl<T> TryPostError<T> {
    pub fn into_inner(self) -> T {
        match self {
            TryPostError::Full(item) | TryPostError::Closed(item) => item,
        }
    }

    pub fn is_closed(&self) -> bool {
        matches!(self, TryPostError::Closed(_))
    }
}

/// Outcome of a non-blocking or timed receive.
#[derive(Debug, PartialEq, Eq)]
pub enum Recv<T> {
    Item(T),
    Empty,
    Closed,
}

struct State<T> {
    queue: VecDeque<T>,
    closed: bool,
}

/// Bounded FIFO channel with blocking and non-blocking ends.
///
/// Closing is terminal and idempotent: it wakes every waiter, hands back whatever was still queued
/// (so the caller releases it exactly once) and makes every later receive return immediately.
pub struct Mailbox<T> {
    state: Mutex<State<T>>,
    not_empty: Condvar,
    not_full: Condvar,
    capacity: usize,
}

impl<T> Mailbox<T> {
    pub fn new(capacity: usize) -> Self {
        assert!(capacity > 0, "mailbox capacity must be non-zero");
        Self {
            state: Mutex::new(State {
                queue: VecDeque::with_capacity(capacity.min(1024)),
                closed: false,
            }),
            not_empty: Condvar::new(),
            not_full: Condvar::new(),
            capacity,
        }
    }

    pub fn capacity(&self) -> usize {
        self.capacity
    }

    pub fn len(&self) -> usize {
        lock(&self.state).queue.len()
    }

    pub fn is_empty(&self) -> bool {
        self.len() == 0
    }

    pub fn is_closed(&self) -> bool {
        lock(&self.state).closed
    }

    /// Enqueue without blocking.
    pub fn try_post(&self, item: T) -> Result<(), TryPostError<T>> {
        let mut state = lock(&self.state);
        if state.closed {
            return Err(TryPostError::Closed(item));
        }
        if state.queue.len() >= self.capacity {
            return Err(TryPostError::Full(item));
        }
        state.queue.push_back(item);
        drop(state);
        self.not_empty.notify_one();
        Ok(())
    }

    /// Enqueue, waiting for space. Fails only if the mailbox is (or becomes) closed.
    pub fn post(&self, item: T) -> Result<(), T> {
        let mut state = lock(&self.state);
        loop {
            if state.closed {
                return Err(item);
            }
            if state.queue.len() < self.capacity {
                break;
            }
            state = wait(&self.not_full, state);
        }
        state.queue.push_back(item);
        drop(state);
        self.not_empty.notify_one();
        Ok(())
    }

    /// Enqueue ignoring the capacity bound.
    ///
    /// Reserved for sentinels and follow-up work posted from engine hooks, which must neither block
    /// nor be lost.
    pub fn force_post(&self, item: T) -> Result<(), T> {
        let mut state = lock(&self.state);
        if state.closed {
            return Err(item);
        }
        state.queue.push_back(item);
        drop(state);
        self.not_empty.notify_one();
        Ok(())
    }

    /// Block until an item is available. `None` once the mailbox is closed.
    pub fn recv(&self) -> Option<T> {
        let mut state = lock(&self.state);
        loop {
            if state.closed {
                return None;
            }
            if let Some(item) = state.queue.pop_front() {
                drop(state);
                self.not_full.notify_one();
                return Some(item);
            }
            state = wait(&self.not_empty, state);
        }
    }

    /// Block until at least one item is available, then take up to `max` items.
    ///
    /// Never waits to fill `max`. `None` once the mailbox is closed.
    pub fn recv_batch(&self, max: usize) -> Option<Vec<T>> {
        let max = max.max(1);
        let mut state = lock(&self.state);
        loop {
            if state.closed {
                return None;
            }
            if !state.queue.is_empty() {
                let n = state.queue.len().min(max);
                let batch: Vec<T> = state.queue.drain(..n).collect();
                drop(state);
                self.not_full.notify_all();
                return Some(batch);
            }
            state = wait(&self.not_empty, state);
        }
    }

    pub fn recv_timeout(&self, timeout: Duration) -> Recv<T> {
        let deadline = Instant::now() + timeout;
        let mut state = lock(&self.state);
        loop {
            if state.closed {
                return Recv::Closed;
            }
            if let Some(item) = state.queue.pop_front() {
                drop(state);
                self.not_full.notify_one();
                return Recv::Item(item);
            }
            let now = Instant::now();
            if now >= deadline {
                return Recv::Empty;
            }
            state = match self.not_empty.wait_timeout(state, deadline - now) {
                Ok((guard, _)) => guard,
                Err(poisoned) => poisoned.into_inner().0,
            };
        }
    }

    pub fn try_recv(&self) -> Recv<T> {
        let mut state = lock(&self.state);
        if state.closed {
            return Recv::Closed;
        }
        match state.queue.pop_front() {
            Some(item) => {
                drop(state);
                self.not_full.notify_one();
                Recv::Item(item)
            }
            None => Recv::Empty,
        }
    }

    /// Edit queued items in place, oldest first.
    pub fn for_each_queued(&self, mut f: impl FnMut(&mut T)) {
        let mut state = lock(&self.state);
        for item in state.queue.iter_mut() {
            f(item);
        }
    }

    /// Close the mailbox and return the items that were still queued.
    ///
    /// A second call returns an empty vector.
    pub fn close(&self) -> Vec<T> {
        let mut state = lock(&self.state);
        if state.closed {
            return Vec::new();
        }
        state.closed = true;
        let drained = state.queue.drain(..).collect();
        drop(state);
        self.not_empty.notify_all();
        self.not_full.notify_all();
        drained
    }
}

impl<T> std::fmt::Debug for Mailbox<T> {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        let state = lock(&self.state);
        f.debug_struct("Mailbox")
            .field("capacity", &self.capacity)
            .field("len", &state.queue.len())
            .field("closed", &state.closed)
            .finish()
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use std::sync::Arc;
    use std::thread;

    #[test]
    fn try_post_reports_full_and_closed() {
        let mb = Mailbox::new(2);
        mb.try_post(1).unwrap();
        mb.try_post(2).unwrap();
        assert_eq!(mb.try_post(3), Err(TryPostError::Full(3)));

        // Sentinels bypass the bound.
        mb.force_post(4).unwrap();
        assert_eq!(mb.len(), 3);

        assert_eq!(mb.close(), vec![1, 2, 4]);
        assert!(mb.close().is_empty());
        assert_eq!(mb.try_post(5), Err(TryPostError::Closed(5)));
        assert_eq!(mb.force_post(6), Err(6));
    }

    #[test]
    fn recv_batch_takes_what_is_available() {
        let mb = Mailbox::new(8);
        for i in 0..5 {
            mb.try_post(i).unwrap();
        }
        assert_eq!(mb.recv_batch(3), Some(vec![0, 1, 2]));
        assert_eq!(mb.recv_batch(10), Some(vec![3, 4]));
        assert_eq!(mb.try_recv(), Recv::Empty);
    }

    #[test]
    fn close_wakes_blocked_receiver() {
        let mb = Arc::new(Mailbox::<u32>::new(1));
        let rx = {
            let mb = Arc::clone(&mb);
            thread::spawn(move || mb.recv())
        };
        thread::sleep(Duration::from_millis(20));
        mb.close();
        assert_eq!(rx.join().unwrap(), None);
        assert_eq!(mb.recv_timeout(Duration::from_secs(5)), Recv::Closed);
    }

    #[test]
    fn post_waits_for_space() {
        let mb = Arc::new(Mailbox::new(1));
        mb.try_post(0u32).unwrap();
        let tx = {
            let mb = Arc::clone(&mb);
            thread::spawn(move || mb.post(1))
        };
        thread::sleep(Duration::from_millis(20));
        assert_eq!(mb.recv(), Some(0));
        tx.join().unwrap().unwrap();
        assert_eq!(mb.recv(), Some(1));
    }

    #[test]
    fn recv_timeout_expires_when_idle() {
        let mb = Mailbox::<u8>::new(1);
        assert_eq!(mb.recv_timeout(Duration::from_millis(10)), Recv::Empty);
    }

    #[test]
    fn for_each_queued_edits_in_place() {
        let mb = Mailbox::new(4);
        for i in 1..=3u32 {
            mb.try_post(i).unwrap();
        }
        mb.for_each_queued(|v| {
            if *v == 2 {
                *v = 0;
            }
        });
        assert_eq!(mb.close(), vec![1, 0, 3]);
    }
}
