//! Per-context dispatch queue: a bounded ring of buffer references awaiting
//! hardware submission.
//!
//! The ring keeps one slot permanently empty to disambiguate full from empty
//! (`count + 1` storage slots for `count` usable entries). Enqueue under a
//! full ring blocks interruptibly, mirroring the lock-acquisition
//! retry-with-cancellation pattern; dequeue is only ever called by the
//! scheduler and never blocks.

use std::sync::atomic::{AtomicBool, Ordering};
use std::sync::{Condvar, Mutex};

use arbor_bufs::BufRef;
use arbor_types::{CancelToken, ContextId, WAIT_SLICE};
use thiserror::Error;

#[derive(Debug, Error, Clone, Copy, PartialEq, Eq)]
pub enum EnqueueError {
    /// Non-blocking enqueue found the ring full.
    #[error("dispatch queue full")]
    Full,
    /// A pending signal cancelled the blocking wait for space.
    #[error("enqueue wait interrupted by signal")]
    Interrupted,
    /// The context (or device) is being destroyed.
    #[error("dispatch queue torn down")]
    TornDown,
}

#[derive(Debug)]
struct Ring {
    slots: Vec<Option<BufRef>>,
    rd: usize,
    wr: usize,
    torn_down: bool,
}

impl Ring {
    fn is_full(&self) -> bool {
        (self.wr + 1) % self.slots.len() == self.rd
    }

    fn is_empty(&self) -> bool {
        self.wr == self.rd
    }

    fn occupancy(&self) -> usize {
        (self.wr + self.slots.len() - self.rd) % self.slots.len()
    }

    fn push(&mut self, buf: BufRef) {
        debug_assert!(!self.is_full());
        debug_assert!(self.slots[self.wr].is_none(), "overwrote an unread slot");
        self.slots[self.wr] = Some(buf);
        self.wr = (self.wr + 1) % self.slots.len();
    }

    fn pop(&mut self) -> Option<BufRef> {
        if self.is_empty() {
            return None;
        }
        let buf = self.slots[self.rd].take();
        debug_assert!(buf.is_some(), "read an unwritten slot");
        self.rd = (self.rd + 1) % self.slots.len();
        buf
    }
}

/// Bounded ring of queued buffers for one rendering context.
#[derive(Debug)]
pub struct DispatchQueue {
    context: ContextId,
    inner: Mutex<Ring>,
    space: Condvar,
    /// Context state survives hardware switches; the scheduler can skip the
    /// reload when dispatching for this context.
    preserved: AtomicBool,
}

impl DispatchQueue {
    /// `depth` is the number of usable slots; storage is `depth + 1`.
    pub fn new(context: ContextId, depth: usize) -> Self {
        assert!(depth > 0, "dispatch queue needs at least one slot");
        Self {
            context,
            inner: Mutex::new(Ring {
                slots: vec![None; depth + 1],
                rd: 0,
                wr: 0,
                torn_down: false,
            }),
            space: Condvar::new(),
            preserved: AtomicBool::new(false),
        }
    }

    pub fn context(&self) -> ContextId {
        self.context
    }

    pub fn capacity(&self) -> usize {
        self.inner.lock().unwrap().slots.len() - 1
    }

    pub fn occupancy(&self) -> usize {
        self.inner.lock().unwrap().occupancy()
    }

    pub fn is_empty(&self) -> bool {
        self.inner.lock().unwrap().is_empty()
    }

    pub fn preserved(&self) -> bool {
        self.preserved.load(Ordering::Acquire)
    }

    pub fn set_preserved(&self, preserved: bool) {
        self.preserved.store(preserved, Ordering::Release)
    }

    pub fn try_enqueue(&self, buf: BufRef) -> Result<(), EnqueueError> {
        let mut ring = self.inner.lock().unwrap();
        if ring.torn_down {
            return Err(EnqueueError::TornDown);
        }
        if ring.is_full() {
            return Err(EnqueueError::Full);
        }
        ring.push(buf);
        Ok(())
    }

    /// Writes at the ring's write pointer, blocking interruptibly while the
    /// ring is full.
    pub fn enqueue(&self, buf: BufRef, cancel: &CancelToken) -> Result<(), EnqueueError> {
        let mut ring = self.inner.lock().unwrap();
        loop {
            if ring.torn_down {
                return Err(EnqueueError::TornDown);
            }
            if !ring.is_full() {
                ring.push(buf);
                return Ok(());
            }
            if cancel.is_cancelled() {
                return Err(EnqueueError::Interrupted);
            }
            let (guard, _timeout) = self.space.wait_timeout(ring, WAIT_SLICE).unwrap();
            ring = guard;
        }
    }

    /// Scheduler-side removal; frees a slot and wakes one blocked enqueuer.
    pub fn dequeue(&self) -> Option<BufRef> {
        let mut ring = self.inner.lock().unwrap();
        let buf = ring.pop();
        if buf.is_some() {
            self.space.notify_one();
        }
        buf
    }

    /// Empties the ring (context destruction); returns the orphaned buffers
    /// so the caller can recycle them.
    pub fn drain(&self) -> Vec<BufRef> {
        let mut ring = self.inner.lock().unwrap();
        let mut out = Vec::with_capacity(ring.occupancy());
        while let Some(buf) = ring.pop() {
            out.push(buf);
        }
        self.space.notify_all();
        out
    }

    /// Refuses further enqueues and wakes blocked writers.
    pub fn tear_down(&self) {
        self.inner.lock().unwrap().torn_down = true;
        self.space.notify_all();
    }
}
