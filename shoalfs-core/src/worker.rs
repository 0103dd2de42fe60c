// Copyright 2021-Present Datadog, Inc. https://www.datadoghq.com/
// SPDX-License-Identifier: Apache-2.0

//! The worker-thread pool.
//!
//! A worker is an OS thread with an inbound mailbox: callers `send` it
//! messages, the worker's handler consumes them in FIFO order. Slots come
//! from a fixed pool (the daemons size their concurrency at configuration
//! time, not under load) and return to a freelist on `join`, so worker
//! churn allocates nothing but the thread itself.
//!
//! Locking: each slot has its own mutex+condvar for the mailbox and state;
//! the freelist has one pool-level mutex. Nothing holds both at once.

use std::any::Any;
use std::collections::VecDeque;
use std::fmt;
use std::sync::{Condvar, Mutex, MutexGuard, OnceLock, PoisonError};
use std::thread::JoinHandle;

/// Worker names are debugging labels; longer names are truncated.
pub const WORKER_NAME_MAX: usize = 16;

const MAX_WORKERS: usize = 8192;

/// A mailbox message. The handler downcasts to whatever concrete type its
/// senders use.
pub type WorkerMsg = Box<dyn Any + Send>;

enum Envelope {
    /// Reserved: asks the worker to exit cleanly. Never seen by handlers.
    Shutdown,
    Msg(WorkerMsg),
}

#[derive(Clone, Copy, Debug, Eq, PartialEq)]
enum SlotState {
    Uninitialized,
    Running,
    Stopped,
    StoppedError,
}

#[derive(Debug, thiserror::Error)]
pub enum WorkerError {
    #[error("worker pool already initialized")]
    AlreadyInitialized,
    #[error("worker pool not initialized")]
    Uninitialized,
    #[error("no free worker slots")]
    PoolExhausted,
    #[error("worker is not running")]
    NotRunning,
    #[error("worker was never started")]
    NotStarted,
    #[error("worker terminated with an error")]
    Failed,
    #[error("failed to spawn worker thread: {0}")]
    Spawn(#[from] std::io::Error),
}

/// Returned by [`Worker::send`] when the worker is not running; carries the
/// message back so the caller keeps ownership instead of leaking intent.
pub struct SendError(pub WorkerMsg);

impl fmt::Debug for SendError {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.write_str("SendError(..)")
    }
}

impl fmt::Display for SendError {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.write_str("worker is not running")
    }
}

impl std::error::Error for SendError {}

struct SlotInner {
    name: String,
    state: SlotState,
    queue: VecDeque<Envelope>,
    thread: Option<JoinHandle<bool>>,
}

struct Slot {
    inner: Mutex<SlotInner>,
    cond: Condvar,
}

impl Slot {
    fn new() -> Self {
        Self {
            inner: Mutex::new(SlotInner {
                name: String::new(),
                state: SlotState::Uninitialized,
                queue: VecDeque::new(),
                thread: None,
            }),
            cond: Condvar::new(),
        }
    }

    fn lock(&self) -> MutexGuard<'_, SlotInner> {
        self.inner.lock().unwrap_or_else(PoisonError::into_inner)
    }
}

/// Intrusive freelist over slot indices: `next[i]` is only meaningful while
/// slot `i` is idle.
struct FreeList {
    head: Option<usize>,
    next: Vec<Option<usize>>,
}

impl FreeList {
    fn pop(&mut self) -> Option<usize> {
        let idx = self.head?;
        self.head = self.next[idx].take();
        Some(idx)
    }

    fn push(&mut self, idx: usize) {
        self.next[idx] = self.head;
        self.head = Some(idx);
    }
}

struct Pool {
    slots: Box<[Slot]>,
    free: Mutex<FreeList>,
}

impl Pool {
    fn new() -> Self {
        let slots: Vec<Slot> = (0..MAX_WORKERS).map(|_| Slot::new()).collect();
        let mut next = vec![None; MAX_WORKERS];
        for i in 0..MAX_WORKERS - 1 {
            next[i] = Some(i + 1);
        }
        Self {
            slots: slots.into_boxed_slice(),
            free: Mutex::new(FreeList {
                head: Some(0),
                next,
            }),
        }
    }

    fn free_lock(&self) -> MutexGuard<'_, FreeList> {
        self.free.lock().unwrap_or_else(PoisonError::into_inner)
    }
}

static POOL: OnceLock<Pool> = OnceLock::new();

/// Builds the slot array and freelist. Call once before any
/// [`Worker::start`].
pub fn init() -> Result<(), WorkerError> {
    POOL.set(Pool::new())
        .map_err(|_| WorkerError::AlreadyInitialized)
}

fn pool() -> Result<&'static Pool, WorkerError> {
    POOL.get().ok_or(WorkerError::Uninitialized)
}

/// Handle to a running (or stopped, pre-join) worker.
pub struct Worker {
    pool: &'static Pool,
    slot: usize,
}

impl Worker {
    /// Claims a free slot and spawns the worker thread.
    ///
    /// `handler` is invoked once per message, in send order; returning an
    /// error stops the worker and marks it failed. `shutdown` (if any) runs
    /// exactly once when the worker exits, cleanly or not.
    pub fn start<H>(
        name: &str,
        handler: H,
        shutdown: Option<Box<dyn FnOnce() + Send>>,
    ) -> Result<Worker, WorkerError>
    where
        H: FnMut(WorkerMsg) -> anyhow::Result<()> + Send + 'static,
    {
        let pool = pool()?;
        let idx = pool.free_lock().pop().ok_or(WorkerError::PoolExhausted)?;

        let mut short_name = name.to_string();
        short_name.truncate(WORKER_NAME_MAX);
        {
            let mut inner = pool.slots[idx].lock();
            inner.name = short_name.clone();
            inner.state = SlotState::Running;
            inner.queue.clear();
        }

        let spawned = std::thread::Builder::new()
            .name(short_name)
            .spawn(move || worker_main(idx, handler, shutdown));
        match spawned {
            Ok(handle) => {
                pool.slots[idx].lock().thread = Some(handle);
                Ok(Worker { pool, slot: idx })
            }
            Err(e) => {
                {
                    let mut inner = pool.slots[idx].lock();
                    inner.state = SlotState::Uninitialized;
                    inner.name.clear();
                }
                pool.free_lock().push(idx);
                Err(WorkerError::Spawn(e))
            }
        }
    }

    /// Appends a message to the mailbox. Fails (returning the message)
    /// unless the worker is running.
    pub fn send(&self, msg: WorkerMsg) -> Result<(), SendError> {
        let slot = &self.pool.slots[self.slot];
        let mut inner = slot.lock();
        if inner.state != SlotState::Running {
            return Err(SendError(msg));
        }
        inner.queue.push_back(Envelope::Msg(msg));
        slot.cond.notify_one();
        Ok(())
    }

    /// [`send`](Self::send), but a refused message is simply dropped, so
    /// call sites that don't care cannot leak one.
    pub fn send_or_drop(&self, msg: WorkerMsg) -> Result<(), WorkerError> {
        self.send(msg).map_err(|_| WorkerError::NotRunning)
    }

    /// Asks the worker to exit after the mail already queued.
    pub fn stop(&self) -> Result<(), WorkerError> {
        let slot = &self.pool.slots[self.slot];
        let mut inner = slot.lock();
        if inner.state != SlotState::Running {
            return Err(WorkerError::NotRunning);
        }
        inner.queue.push_back(Envelope::Shutdown);
        slot.cond.notify_one();
        Ok(())
    }

    /// Waits for the worker thread and returns its slot to the freelist.
    /// Usually preceded by [`stop`](Self::stop). `Err(Failed)` reports a
    /// handler error (or panic) on the worker.
    pub fn join(self) -> Result<(), WorkerError> {
        let slot = &self.pool.slots[self.slot];
        let handle = slot.lock().thread.take().ok_or(WorkerError::NotStarted)?;
        let clean = handle.join().unwrap_or(false);
        slot.lock().name.clear();
        self.pool.free_lock().push(self.slot);
        if clean {
            Ok(())
        } else {
            Err(WorkerError::Failed)
        }
    }
}

fn worker_main<H>(idx: usize, mut handler: H, shutdown: Option<Box<dyn FnOnce() + Send>>) -> bool
where
    H: FnMut(WorkerMsg) -> anyhow::Result<()>,
{
    let Some(pool) = POOL.get() else {
        return false;
    };
    let slot = &pool.slots[idx];

    let clean = loop {
        let envelope = {
            let mut inner = slot.lock();
            loop {
                if let Some(envelope) = inner.queue.pop_front() {
                    break envelope;
                }
                inner = slot
                    .cond
                    .wait(inner)
                    .unwrap_or_else(PoisonError::into_inner);
            }
        };
        match envelope {
            Envelope::Shutdown => break true,
            Envelope::Msg(msg) => {
                if handler(msg).is_err() {
                    break false;
                }
            }
        }
    };

    {
        let mut inner = slot.lock();
        inner.state = if clean {
            SlotState::Stopped
        } else {
            SlotState::StoppedError
        };
        // Mail behind the stop point is discarded: once the worker is not
        // running, its mailbox is empty.
        inner.queue.clear();
    }
    if let Some(sfn) = shutdown {
        sfn();
    }
    clean
}
