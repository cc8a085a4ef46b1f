//! Engine runtime: a dedicated thread that owns the protocol stack.
//!
//! The stack lives behind the core lock (`Mutex<S>`). The engine thread pops deferred tasks off a
//! bounded [`Mailbox`] and runs each one with the core lock held. Between tasks it calls
//! [`NetStack::poll_timers`] once per timer interval, however busy the queue is. Caller threads
//! either take the core lock for a short critical section ([`EngineHandle::with_core`]) or enqueue
//! work.
//!
//! Lock order is core, then per-object state, then mailbox internals. Nothing acquires the core
//! lock while holding one of the others.

use std::fmt;
use std::sync::atomic::{AtomicBool, Ordering};
use std::sync::{mpsc, Arc, Mutex};
use std::thread::{self, JoinHandle};
use std::time::{Duration, Instant};

use tracing::{debug, warn};

use crate::sync::{lock, Mailbox, Recv, TryPostError};
use crate::{BridgeConfig, BridgeError, InterfaceRegistry, NetStack, Result};

type Task<S> = Box<dyn FnOnce(&mut S) + Send + 'static>;

struct Shared<S> {
    core: Mutex<S>,
    tasks: Arc<Mailbox<Task<S>>>,
    running: AtomicBool,
    iface: InterfaceRegistry,
}

/// Owner of the engine thread. Dropping it shuts the thread down.
pub struct Engine<S: NetStack> {
    handle: EngineHandle<S>,
    thread: Option<JoinHandle<()>>,
}

impl<S: NetStack> Engine<S> {
    /// Spawn the engine thread and wait until [`NetStack::init`] has run on it.
    pub fn start(stack: S, config: &BridgeConfig) -> Result<Self> {
        config.validate()?;

        let shared = Arc::new(Shared {
            core: Mutex::new(stack),
            tasks: Arc::new(Mailbox::new(config.task_queue_capacity)),
            running: AtomicBool::new(true),
            iface: InterfaceRegistry::new(),
        });

        let (ready_tx, ready_rx) = mpsc::channel();
        let interval = config.timer_interval;
        let thread = thread::Builder::new()
            .name("netbridge-engine".into())
            .spawn({
                let shared = Arc::clone(&shared);
                move || {
                    lock(&shared.core).init();
                    let _ = ready_tx.send(());
                    run(&shared, interval);
                }
            })
            .map_err(|err| BridgeError::Spawn(err.to_string()))?;

        if ready_rx.recv().is_err() {
            shared.running.store(false, Ordering::Release);
            drop(shared.tasks.close());
            let _ = thread.join();
            return Err(BridgeError::Spawn(
                "engine thread exited during initialization".into(),
            ));
        }

        debug!(
            task_queue = config.task_queue_capacity,
            timer_ms = interval.as_millis() as u64,
            "engine started"
        );

        Ok(Self {
            handle: EngineHandle { shared },
            thread: Some(thread),
        })
    }

    pub fn handle(&self) -> EngineHandle<S> {
        self.handle.clone()
    }

    /// Stop accepting tasks, drop whatever is still queued and join the engine thread.
    ///
    /// Idempotent. Callers blocked in [`EngineHandle::call`] on a dropped task get
    /// [`BridgeError::EngineStopped`].
    pub fn shutdown(&mut self) {
        let shared = &self.handle.shared;
        shared.running.store(false, Ordering::Release);
        let dropped = shared.tasks.close();
        if !dropped.is_empty() {
            debug!(count = dropped.len(), "dropping queued engine tasks");
        }
        drop(dropped);

        if let Some(thread) = self.thread.take() {
            if thread.thread().id() == thread::current().id() {
                warn!("engine shut down from its own thread; not joining");
                return;
            }
            if thread.join().is_err() {
                warn!("engine thread panicked");
            }
            debug!("engine stopped");
        }
    }
}

impl<S: NetStack> std::ops::Deref for Engine<S> {
    type Target = EngineHandle<S>;

    fn deref(&self) -> &EngineHandle<S> {
        &self.handle
    }
}

impl<S: NetStack> Drop for Engine<S> {
    fn drop(&mut self) {
        self.shutdown();
    }
}

impl<S: NetStack> fmt::Debug for Engine<S> {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.debug_struct("Engine")
            .field("running", &self.handle.is_running())
            .finish_non_exhaustive()
    }
}

fn run<S: NetStack>(shared: &Shared<S>, interval: Duration) {
    let mut next_timer = Instant::now() + interval;
    loop {
        let wait = next_timer.saturating_duration_since(Instant::now());
        match shared.tasks.recv_timeout(wait) {
            Recv::Item(task) => {
                let mut core = lock(&shared.core);
                task(&mut *core);
            }
            Recv::Empty => {}
            Recv::Closed => break,
        }

        let now = Instant::now();
        if now >= next_timer {
            lock(&shared.core).poll_timers();
            next_timer = now + interval;
        }
    }
}

/// Cloneable access to a running engine.
pub struct EngineHandle<S: NetStack> {
    shared: Arc<Shared<S>>,
}

impl<S: NetStack> Clone for EngineHandle<S> {
    fn clone(&self) -> Self {
        Self {
            shared: Arc::clone(&self.shared),
        }
    }
}

impl<S: NetStack> EngineHandle<S> {
    pub fn is_running(&self) -> bool {
        self.shared.running.load(Ordering::Acquire)
    }

    pub fn interface(&self) -> &InterfaceRegistry {
        &self.shared.iface
    }

    /// Run `f` on the calling thread with the core lock held.
    ///
    /// Keep `f` short: the engine thread is stalled for its duration. Must not be called from a
    /// task or a sink, which already run under the core lock.
    pub fn with_core<R>(&self, f: impl FnOnce(&mut S) -> R) -> R {
        let mut core = lock(&self.shared.core);
        f(&mut *core)
    }

    /// Queue `f` for the engine thread without blocking.
    pub fn try_submit(&self, f: impl FnOnce(&mut S) + Send + 'static) -> Result<()> {
        self.shared
            .tasks
            .try_post(Box::new(f))
            .map_err(|err| match err {
                TryPostError::Full(_) => BridgeError::EngineBusy,
                TryPostError::Closed(_) => BridgeError::EngineStopped,
            })
    }

    /// Queue `f` for the engine thread, waiting for room in the task queue.
    pub fn submit(&self, f: impl FnOnce(&mut S) + Send + 'static) -> Result<()> {
        self.shared
            .tasks
            .post(Box::new(f))
            .map_err(|_| BridgeError::EngineStopped)
    }

    /// Run `f` on the engine thread and wait for its result.
    ///
    /// Tasks run in submission order, so `call(|_| ())` also works as a barrier for everything
    /// queued before it.
    pub fn call<R: Send + 'static>(
        &self,
        f: impl FnOnce(&mut S) -> R + Send + 'static,
    ) -> Result<R> {
        let (tx, rx) = mpsc::sync_channel(1);
        self.submit(move |stack| {
            let _ = tx.send(f(stack));
        })?;
        rx.recv().map_err(|_| BridgeError::EngineStopped)
    }

    pub fn deferrer(&self) -> Deferrer<S> {
        Deferrer {
            tasks: Arc::clone(&self.shared.tasks),
        }
    }
}

impl<S: NetStack> fmt::Debug for EngineHandle<S> {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.debug_struct("EngineHandle")
            .field("running", &self.is_running())
            .field("queued", &self.shared.tasks.len())
            .finish()
    }
}

/// Posts follow-up work from engine-side hooks.
///
/// Holds only the task queue, so sinks stored inside the stack do not keep the core alive.
pub struct Deferrer<S: NetStack> {
    tasks: Arc<Mailbox<Task<S>>>,
}

impl<S: NetStack> Clone for Deferrer<S> {
    fn clone(&self) -> Self {
        Self {
            tasks: Arc::clone(&self.tasks),
        }
    }
}

impl<S: NetStack> Deferrer<S> {
    /// Queue `f` ignoring the task queue bound. Fails only once the engine stopped.
    pub fn defer(&self, f: impl FnOnce(&mut S) + Send + 'static) -> Result<()> {
        self.tasks
            .force_post(Box::new(f))
            .map_err(|_| BridgeError::EngineStopped)
    }
}
