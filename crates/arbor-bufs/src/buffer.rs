//! DMA buffer descriptors.
//!
//! Buffers are created once at pool-init time and never destroyed, only
//! recycled. The central invariant is exclusive ownership: at any instant a
//! buffer is on exactly one freelist, in exactly one dispatch-queue slot, or
//! held by exactly one client. Ownership transfer is a compare-and-swap on a
//! single state word, never a mutex.

use std::sync::atomic::{AtomicU32, Ordering};
use std::sync::Arc;

use arbor_types::{ClientId, ContextId};

/// Lifecycle state of a buffer.
///
/// `None -> Wait (enqueued) -> Pend (on hardware) -> None (completed)`, with
/// two side branches: `Prio` for the privileged direct-dispatch path and
/// `Reclaim` when the owning client closed while the buffer was still
/// queued. A `Reclaim` buffer is discarded by the scheduler without touching
/// hardware.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
#[repr(u32)]
pub enum BufState {
    /// Held by a client, not queued anywhere.
    None = 0,
    /// On the order pool's freelist.
    Free = 1,
    /// Sitting in a dispatch-queue slot awaiting hardware submission.
    Wait = 2,
    /// Dispatched; the hardware owns it until completion.
    Pend = 3,
    /// Queued on the privileged priority path.
    Prio = 4,
    /// Owner closed while queued; discard instead of dispatching.
    Reclaim = 5,
}

impl BufState {
    fn from_raw(raw: u32) -> BufState {
        match raw {
            0 => BufState::None,
            1 => BufState::Free,
            2 => BufState::Wait,
            3 => BufState::Pend,
            4 => BufState::Prio,
            5 => BufState::Reclaim,
            _ => unreachable!("corrupt buffer state word {raw}"),
        }
    }
}

/// A single-word, lock-free state cell.
#[derive(Debug)]
pub(crate) struct AtomicBufState(AtomicU32);

impl AtomicBufState {
    pub(crate) fn new(state: BufState) -> Self {
        Self(AtomicU32::new(state as u32))
    }

    pub(crate) fn load(&self) -> BufState {
        BufState::from_raw(self.0.load(Ordering::Acquire))
    }

    /// Atomically moves `from -> to`; fails (returning the observed state)
    /// if another party transitioned the buffer first.
    pub(crate) fn transition(&self, from: BufState, to: BufState) -> Result<(), BufState> {
        self.0
            .compare_exchange(from as u32, to as u32, Ordering::AcqRel, Ordering::Acquire)
            .map(|_| ())
            .map_err(BufState::from_raw)
    }

    pub(crate) fn swap(&self, to: BufState) -> BufState {
        BufState::from_raw(self.0.swap(to as u32, Ordering::AcqRel))
    }
}

/// A fixed-size DMA buffer descriptor.
#[derive(Debug)]
pub struct Buffer {
    /// Global index across all order pools of the owning device.
    index: usize,
    /// log2 of the byte size.
    order: u32,
    /// Total capacity in bytes (`1 << order`).
    size: usize,
    /// Bytes of the buffer actually filled by the client for this
    /// submission.
    used: AtomicU32,
    /// Client that currently holds the buffer (`NO_CLIENT` when free).
    owner: AtomicU32,
    /// Context the buffer was queued under.
    context: AtomicU32,
    pub(crate) state: AtomicBufState,
}

/// Shared handle to a buffer descriptor.
pub type BufRef = Arc<Buffer>;

impl Buffer {
    pub(crate) fn new(index: usize, order: u32) -> Self {
        Self {
            index,
            order,
            size: 1usize << order,
            used: AtomicU32::new(0),
            owner: AtomicU32::new(0),
            context: AtomicU32::new(0),
            state: AtomicBufState::new(BufState::Free),
        }
    }

    pub fn index(&self) -> usize {
        self.index
    }

    pub fn order(&self) -> u32 {
        self.order
    }

    pub fn size(&self) -> usize {
        self.size
    }

    pub fn state(&self) -> BufState {
        self.state.load()
    }

    /// Single-word CAS state transition; the public seam the scheduler and
    /// pool use to transfer ownership.
    pub fn transition(&self, from: BufState, to: BufState) -> Result<(), BufState> {
        self.state.transition(from, to)
    }

    pub fn used(&self) -> u32 {
        self.used.load(Ordering::Acquire)
    }

    pub fn set_used(&self, used: u32) {
        self.used.store(used, Ordering::Release)
    }

    pub fn owner(&self) -> ClientId {
        ClientId(self.owner.load(Ordering::Acquire))
    }

    pub(crate) fn set_owner(&self, owner: ClientId) {
        self.owner.store(owner.0, Ordering::Release)
    }

    pub fn context(&self) -> ContextId {
        ContextId(self.context.load(Ordering::Acquire))
    }

    pub fn set_context(&self, context: ContextId) {
        self.context.store(context.0, Ordering::Release)
    }
}
