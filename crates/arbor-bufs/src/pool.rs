//! Per-order freelists with watermarks and blocking allocation.
//!
//! Buffers are grouped by power-of-two size order. Each order owns a
//! recycling freelist plus a wait queue of blocked allocators; the pool as a
//! whole also keeps a flat global index so the command surface can resolve a
//! buffer number from a submission request.

use std::collections::{BTreeMap, VecDeque};
use std::sync::{Arc, Condvar, Mutex};

use arbor_types::{CancelToken, ClientId, NO_CLIENT, WAIT_SLICE};
use thiserror::Error;

use crate::buffer::{BufRef, BufState, Buffer};

/// Smallest supported buffer order (32 bytes).
pub const MIN_ORDER: u32 = 5;
/// Largest supported buffer order (4 MiB).
pub const MAX_ORDER: u32 = 22;

/// Configuration-time pool errors.
#[derive(Debug, Error, Clone, Copy, PartialEq, Eq)]
pub enum PoolError {
    #[error("buffer order {0} outside {MIN_ORDER}..={MAX_ORDER}")]
    InvalidOrder(u32),
    #[error("zero buffers requested for order {0}")]
    ZeroCount(u32),
    #[error("no buffers configured for order {0}")]
    NoSuchOrder(u32),
    #[error("watermarks low={low} high={high} invalid for {count} buffers")]
    BadMarks { low: usize, high: usize, count: usize },
}

/// Why a blocking allocation returned without a buffer.
#[derive(Debug, Error, Clone, Copy, PartialEq, Eq)]
pub enum AllocError {
    #[error("no buffers configured for order {0}")]
    NoSuchOrder(u32),
    #[error("allocation wait interrupted by signal")]
    Interrupted,
    #[error("pool torn down while waiting")]
    TornDown,
}

#[derive(Debug)]
struct FreeList {
    /// Every buffer of this order, freelist membership or not.
    bufs: Vec<BufRef>,
    /// Recycling queue; pop from the head, release to the tail.
    free: VecDeque<BufRef>,
    /// Below this many free buffers the pool wants background reclamation.
    low_mark: usize,
    /// At or above this many free buffers every blocked allocator is woken.
    high_mark: usize,
    torn_down: bool,
}

/// One power-of-two buffer order: freelist, watermarks, wait queue.
#[derive(Debug)]
pub struct OrderPool {
    order: u32,
    shared: Mutex<FreeList>,
    wake: Condvar,
}

/// Point-in-time view of one order, for the buffer-info query surface.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub struct OrderInfo {
    pub order: u32,
    pub size: usize,
    pub count: usize,
    pub free: usize,
    pub low_mark: usize,
    pub high_mark: usize,
}

impl OrderPool {
    fn new(order: u32) -> Self {
        Self {
            order,
            shared: Mutex::new(FreeList {
                bufs: Vec::new(),
                free: VecDeque::new(),
                low_mark: 0,
                high_mark: 0,
                torn_down: false,
            }),
            wake: Condvar::new(),
        }
    }

    pub fn order(&self) -> u32 {
        self.order
    }

    fn claim(&self, buf: BufRef, client: ClientId) -> BufRef {
        // Freelist membership implies Free; a failure here is a conservation
        // bug, not a runtime condition.
        buf.transition(BufState::Free, BufState::None)
            .expect("buffer on freelist was not Free");
        buf.set_owner(client);
        buf
    }

    pub fn try_allocate(&self, client: ClientId) -> Option<BufRef> {
        let mut shared = self.shared.lock().unwrap();
        shared.free.pop_front().map(|buf| {
            drop(shared);
            self.claim(buf, client)
        })
    }

    /// Pops the freelist head, blocking interruptibly while the order is
    /// exhausted.
    pub fn allocate(&self, client: ClientId, cancel: &CancelToken) -> Result<BufRef, AllocError> {
        let mut shared = self.shared.lock().unwrap();
        loop {
            if shared.torn_down {
                return Err(AllocError::TornDown);
            }
            if let Some(buf) = shared.free.pop_front() {
                drop(shared);
                return Ok(self.claim(buf, client));
            }
            if cancel.is_cancelled() {
                return Err(AllocError::Interrupted);
            }
            let (guard, _timeout) = self.wake.wait_timeout(shared, WAIT_SLICE).unwrap();
            shared = guard;
        }
    }

    /// Returns a buffer to the freelist tail and wakes allocators.
    pub fn release(&self, buf: &BufRef) {
        let prev = buf.state.swap(BufState::Free);
        if prev == BufState::Free {
            tracing::warn!(index = buf.index(), "double release of buffer ignored");
            return;
        }
        buf.set_owner(NO_CLIENT);
        buf.set_used(0);
        let mut shared = self.shared.lock().unwrap();
        shared.free.push_back(buf.clone());
        // Past the high watermark every sleeper gets a chance; below it a
        // single handoff is enough.
        if shared.free.len() >= shared.high_mark {
            self.wake.notify_all();
        } else {
            self.wake.notify_one();
        }
    }

    /// Whether the freelist has drained below the low watermark.
    pub fn needs_reclaim(&self) -> bool {
        let shared = self.shared.lock().unwrap();
        shared.free.len() < shared.low_mark
    }

    pub fn set_marks(&self, low: usize, high: usize) -> Result<(), PoolError> {
        let mut shared = self.shared.lock().unwrap();
        let count = shared.bufs.len();
        if low > count || high > count || low > high {
            return Err(PoolError::BadMarks { low, high, count });
        }
        shared.low_mark = low;
        shared.high_mark = high;
        Ok(())
    }

    pub fn info(&self) -> OrderInfo {
        let shared = self.shared.lock().unwrap();
        OrderInfo {
            order: self.order,
            size: 1usize << self.order,
            count: shared.bufs.len(),
            free: shared.free.len(),
            low_mark: shared.low_mark,
            high_mark: shared.high_mark,
        }
    }

    pub fn free_count(&self) -> usize {
        self.shared.lock().unwrap().free.len()
    }

    fn tear_down(&self) {
        self.shared.lock().unwrap().torn_down = true;
        self.wake.notify_all();
    }
}

/// What `reclaim_for_owner` did with a closing client's buffers.
#[derive(Debug, Default, Clone, Copy, PartialEq, Eq)]
pub struct ReclaimSummary {
    /// Idle buffers returned straight to their freelists.
    pub released: usize,
    /// Queued buffers marked `Reclaim` for the scheduler to discard.
    pub marked: usize,
    /// Buffers on hardware, left for completion to return.
    pub left_pending: usize,
}

/// Per-state buffer counts, used by the conservation checks and the stats
/// surface.
#[derive(Debug, Default, Clone, Copy, PartialEq, Eq)]
pub struct Census {
    pub total: usize,
    pub free: usize,
    pub held: usize,
    pub queued: usize,
    pub pending: usize,
    pub reclaim: usize,
}

/// The device-wide DMA buffer pool: one [`OrderPool`] per configured order
/// plus a flat index for lookup by buffer number.
#[derive(Debug, Default)]
pub struct BufferPool {
    inner: Mutex<PoolInner>,
}

#[derive(Debug, Default)]
struct PoolInner {
    orders: BTreeMap<u32, Arc<OrderPool>>,
    buflist: Vec<BufRef>,
}

impl BufferPool {
    pub fn new() -> Self {
        Self::default()
    }

    /// Creates `count` buffers of the given order, appending to the order's
    /// existing population if one exists. Returns the first global index
    /// assigned.
    ///
    /// Watermarks for a new order default to `low = 0`,
    /// `high = count` (wake everyone whenever the order is fully idle).
    pub fn add_bufs(&self, order: u32, count: usize) -> Result<usize, PoolError> {
        if !(MIN_ORDER..=MAX_ORDER).contains(&order) {
            return Err(PoolError::InvalidOrder(order));
        }
        if count == 0 {
            return Err(PoolError::ZeroCount(order));
        }
        let mut inner = self.inner.lock().unwrap();
        let first = inner.buflist.len();
        let pool = inner
            .orders
            .entry(order)
            .or_insert_with(|| Arc::new(OrderPool::new(order)))
            .clone();
        let mut shared = pool.shared.lock().unwrap();
        for i in 0..count {
            let buf: BufRef = Arc::new(Buffer::new(first + i, order));
            inner.buflist.push(buf.clone());
            shared.bufs.push(buf.clone());
            shared.free.push_back(buf);
        }
        if shared.high_mark == 0 {
            shared.high_mark = shared.bufs.len();
        }
        Ok(first)
    }

    pub fn order_pool(&self, order: u32) -> Option<Arc<OrderPool>> {
        self.inner.lock().unwrap().orders.get(&order).cloned()
    }

    /// Resolves a global buffer index from the command surface.
    pub fn buffer(&self, index: usize) -> Option<BufRef> {
        self.inner.lock().unwrap().buflist.get(index).cloned()
    }

    pub fn allocate(
        &self,
        order: u32,
        client: ClientId,
        cancel: &CancelToken,
    ) -> Result<BufRef, AllocError> {
        let pool = self
            .order_pool(order)
            .ok_or(AllocError::NoSuchOrder(order))?;
        pool.allocate(client, cancel)
    }

    pub fn try_allocate(&self, order: u32, client: ClientId) -> Result<Option<BufRef>, AllocError> {
        let pool = self
            .order_pool(order)
            .ok_or(AllocError::NoSuchOrder(order))?;
        Ok(pool.try_allocate(client))
    }

    /// Returns a buffer to its order's freelist.
    pub fn release(&self, buf: &BufRef) {
        match self.order_pool(buf.order()) {
            Some(pool) => pool.release(buf),
            None => tracing::warn!(
                index = buf.index(),
                order = buf.order(),
                "release for unknown order ignored"
            ),
        }
    }

    /// Recovers buffers owned by a terminating client.
    ///
    /// Idle buffers go straight back to the freelist; queued ones are marked
    /// `Reclaim` so the scheduler discards them on dequeue; buffers already
    /// on hardware are left untouched until their completion interrupt.
    pub fn reclaim_for_owner(&self, client: ClientId) -> ReclaimSummary {
        let buflist: Vec<BufRef> = self.inner.lock().unwrap().buflist.clone();
        let mut summary = ReclaimSummary::default();
        for buf in &buflist {
            if buf.owner() != client {
                continue;
            }
            match buf.state() {
                BufState::None => {
                    if buf.transition(BufState::None, BufState::Reclaim).is_ok() {
                        // Reroute through release so owner/used are scrubbed
                        // and sleepers are woken.
                        self.release(buf);
                        summary.released += 1;
                    }
                }
                BufState::Wait => {
                    if buf.transition(BufState::Wait, BufState::Reclaim).is_ok() {
                        summary.marked += 1;
                    }
                }
                BufState::Prio => {
                    if buf.transition(BufState::Prio, BufState::Reclaim).is_ok() {
                        summary.marked += 1;
                    }
                }
                BufState::Pend => summary.left_pending += 1,
                BufState::Free | BufState::Reclaim => {}
            }
        }
        if summary.marked > 0 || summary.released > 0 {
            tracing::debug!(
                client = client.0,
                released = summary.released,
                marked = summary.marked,
                "reclaimed buffers for closed handle"
            );
        }
        summary
    }

    pub fn set_marks(&self, order: u32, low: usize, high: usize) -> Result<(), PoolError> {
        let pool = self.order_pool(order).ok_or(PoolError::NoSuchOrder(order))?;
        pool.set_marks(low, high)
    }

    pub fn info(&self) -> Vec<OrderInfo> {
        let inner = self.inner.lock().unwrap();
        inner.orders.values().map(|p| p.info()).collect()
    }

    pub fn total(&self) -> usize {
        self.inner.lock().unwrap().buflist.len()
    }

    /// Orders whose freelists have drained below their low watermark: the
    /// pressure signal reported through the stats surface so a driver can
    /// react (kick completions, grow the pool) before allocators start
    /// blocking.
    pub fn starved_orders(&self) -> Vec<u32> {
        let pools: Vec<Arc<OrderPool>> = {
            let inner = self.inner.lock().unwrap();
            inner.orders.values().cloned().collect()
        };
        pools
            .iter()
            .filter(|p| p.needs_reclaim())
            .map(|p| p.order())
            .collect()
    }

    /// Counts buffers by state. The sum always equals [`Self::total`]; a
    /// mismatch means a buffer was created or destroyed after init.
    pub fn census(&self) -> Census {
        let inner = self.inner.lock().unwrap();
        let mut census = Census {
            total: inner.buflist.len(),
            ..Census::default()
        };
        for buf in &inner.buflist {
            match buf.state() {
                BufState::Free => census.free += 1,
                BufState::None => census.held += 1,
                BufState::Wait | BufState::Prio => census.queued += 1,
                BufState::Pend => census.pending += 1,
                BufState::Reclaim => census.reclaim += 1,
            }
        }
        census
    }

    /// Wakes all blocked allocators with a teardown error and refuses
    /// further blocking waits.
    pub fn tear_down(&self) {
        let pools: Vec<Arc<OrderPool>> = {
            let inner = self.inner.lock().unwrap();
            inner.orders.values().cloned().collect()
        };
        for pool in pools {
            pool.tear_down();
        }
    }
}
