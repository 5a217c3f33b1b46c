//! The dispatch scheduler: round-robin queue selection plus the two-phase
//! asynchronous context-switch state machine.
//!
//! Hardware context switches are not synchronous: the scheduler issues the
//! switch through the vendor back-end, parks the buffer it intended to
//! dispatch in [`SwitchState::Pending`], and resumes exactly once when the
//! back-end reports completion. The explicit state machine replaces the
//! original driver's re-entrant control flow and sentinel flags; it makes
//! "never drop, never duplicate" a structural property instead of a
//! convention.

use std::collections::{BTreeMap, VecDeque};
use std::mem;
use std::sync::Arc;

use arbor_bufs::{BufRef, BufState, BufferPool};
use arbor_types::ContextId;
use thiserror::Error;

use crate::queue::DispatchQueue;

/// Vendor back-end collaborator. Both operations are fire-and-forget from
/// the scheduler's point of view; completions arrive later through
/// [`Scheduler::switch_complete`] and [`Scheduler::buffer_complete`].
pub trait HardwareBackend: Send + Sync {
    /// Begin an asynchronous hardware context switch.
    fn context_switch(&self, from: ContextId, to: ContextId);
    /// Submit a buffer to the hardware for the (already current) context.
    fn submit(&self, context: ContextId, buf: &BufRef);
}

#[derive(Debug, Error, Clone, Copy, PartialEq, Eq)]
pub enum SchedError {
    #[error("context {0} already has a dispatch queue")]
    ContextExists(ContextId),
    #[error("unknown context {0}")]
    UnknownContext(ContextId),
    #[error("the kernel context has no dispatch queue")]
    KernelContext,
    #[error("dispatch queue depth must be nonzero")]
    ZeroDepth,
}

/// The scheduler's position in the two-phase switch protocol.
#[derive(Debug)]
enum SwitchState {
    Idle,
    /// A switch to `to` is in flight; `buf` is the buffer that motivated it
    /// and must be dispatched (exactly once) when the switch completes.
    Pending { to: ContextId, buf: BufRef },
}

/// What one call to [`Scheduler::service`] accomplished.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum Serviced {
    /// A buffer was handed to the hardware.
    Dispatched(ContextId),
    /// A context switch was issued; the motivating buffer is parked until
    /// [`Scheduler::switch_complete`].
    SwitchIssued(ContextId),
    /// A previously issued switch is still outstanding; nothing can be
    /// dispatched until it completes.
    AwaitingSwitch,
    /// Every queue is empty.
    Idle,
}

/// Dispatch statistics, exposed through the device stats surface.
#[derive(Debug, Default, Clone, Copy, PartialEq, Eq)]
pub struct SchedStats {
    pub dispatched: u64,
    pub discarded: u64,
    pub context_switches: u64,
}

/// Selects the next queue/buffer to submit and performs context switches.
///
/// The owner wraps the scheduler in a mutex; `&mut self` methods assume that
/// exclusivity. Queue handles are `Arc`-shared so clients enqueue without
/// holding the scheduler lock.
pub struct Scheduler {
    backend: Arc<dyn HardwareBackend>,
    pool: Arc<BufferPool>,
    queues: BTreeMap<u32, Arc<DispatchQueue>>,
    /// Privileged direct-dispatch path; drained ahead of the round-robin.
    prio: VecDeque<BufRef>,
    switch: SwitchState,
    last_context: ContextId,
    /// Round-robin cursor: the context serviced last.
    last_serviced: u32,
    stats: SchedStats,
}

impl Scheduler {
    pub fn new(backend: Arc<dyn HardwareBackend>, pool: Arc<BufferPool>) -> Self {
        Self {
            backend,
            pool,
            queues: BTreeMap::new(),
            prio: VecDeque::new(),
            switch: SwitchState::Idle,
            last_context: arbor_types::KERNEL_CONTEXT,
            last_serviced: 0,
            stats: SchedStats::default(),
        }
    }

    pub fn create_context(
        &mut self,
        context: ContextId,
        depth: usize,
        preserved: bool,
    ) -> Result<Arc<DispatchQueue>, SchedError> {
        if context.is_kernel() {
            return Err(SchedError::KernelContext);
        }
        if depth == 0 {
            return Err(SchedError::ZeroDepth);
        }
        if self.queues.contains_key(&context.0) {
            return Err(SchedError::ContextExists(context));
        }
        let queue = Arc::new(DispatchQueue::new(context, depth));
        queue.set_preserved(preserved);
        self.queues.insert(context.0, queue.clone());
        Ok(queue)
    }

    /// Destroys a context's queue, recycling any buffers still waiting in
    /// it.
    pub fn destroy_context(&mut self, context: ContextId) -> Result<(), SchedError> {
        let queue = self
            .queues
            .remove(&context.0)
            .ok_or(SchedError::UnknownContext(context))?;
        queue.tear_down();
        for buf in queue.drain() {
            self.pool.release(&buf);
            self.stats.discarded += 1;
        }
        Ok(())
    }

    pub fn queue(&self, context: ContextId) -> Option<Arc<DispatchQueue>> {
        self.queues.get(&context.0).cloned()
    }

    pub fn stats(&self) -> SchedStats {
        self.stats
    }

    pub fn last_context(&self) -> ContextId {
        self.last_context
    }

    /// Queues a buffer on the privileged path that bypasses the per-context
    /// rings. The buffer must already be in state [`BufState::Prio`].
    pub fn submit_priority(&mut self, buf: BufRef) {
        debug_assert_eq!(buf.state(), BufState::Prio);
        self.prio.push_back(buf);
    }

    /// Round-robin across contexts with nonempty queues, starting after the
    /// context serviced last.
    fn next_ready(&mut self) -> Option<(ContextId, BufRef)> {
        if let Some(buf) = self.prio.pop_front() {
            return Some((buf.context(), buf));
        }
        let after = self.last_serviced;
        let ordered: Vec<u32> = self
            .queues
            .range((after + 1)..)
            .map(|(id, _)| *id)
            .chain(self.queues.range(..=after).map(|(id, _)| *id))
            .collect();
        for id in ordered {
            if let Some(buf) = self.queues[&id].dequeue() {
                self.last_serviced = id;
                return Some((ContextId(id), buf));
            }
        }
        None
    }

    /// Final ownership handoff to the hardware: `Wait`/`Prio` -> `Pend` and
    /// submit. Returns `false` when the buffer turned out to be reclaimed
    /// (owner closed) and was discarded instead.
    fn commit_dispatch(&mut self, context: ContextId, buf: BufRef) -> bool {
        let committed = buf
            .transition(BufState::Wait, BufState::Pend)
            .or_else(|_| buf.transition(BufState::Prio, BufState::Pend));
        match committed {
            Ok(()) => {
                self.backend.submit(context, &buf);
                self.stats.dispatched += 1;
                true
            }
            Err(BufState::Reclaim) => {
                self.discard(buf);
                false
            }
            Err(other) => {
                tracing::warn!(
                    index = buf.index(),
                    state = ?other,
                    "buffer in unexpected state at dispatch; discarding"
                );
                self.discard(buf);
                false
            }
        }
    }

    fn discard(&mut self, buf: BufRef) {
        self.pool.release(&buf);
        self.stats.discarded += 1;
    }

    /// One scheduling step: pick the next ready buffer and either dispatch
    /// it or begin the context switch it requires.
    pub fn service(&mut self) -> Serviced {
        if let SwitchState::Pending { .. } = self.switch {
            return Serviced::AwaitingSwitch;
        }
        loop {
            let (context, buf) = match self.next_ready() {
                Some(next) => next,
                None => return Serviced::Idle,
            };
            // A buffer whose owner closed while it sat in the ring is
            // discarded without touching hardware.
            if buf.state() == BufState::Reclaim {
                self.discard(buf);
                continue;
            }
            let preserved = self
                .queues
                .get(&context.0)
                .map(|q| q.preserved())
                .unwrap_or(false);
            if context != self.last_context && !preserved {
                self.backend.context_switch(self.last_context, context);
                self.stats.context_switches += 1;
                self.switch = SwitchState::Pending { to: context, buf };
                return Serviced::SwitchIssued(context);
            }
            self.last_context = context;
            if self.commit_dispatch(context, buf) {
                return Serviced::Dispatched(context);
            }
        }
    }

    /// Services until the hardware has work or every queue is drained.
    pub fn service_all(&mut self) -> Serviced {
        loop {
            match self.service() {
                Serviced::Dispatched(_) => continue,
                other => return other,
            }
        }
    }

    /// Back-end notification that the in-flight context switch finished.
    ///
    /// Resumes the parked buffer exactly once; a completion with no switch
    /// outstanding is logged and ignored.
    pub fn switch_complete(&mut self) {
        match mem::replace(&mut self.switch, SwitchState::Idle) {
            SwitchState::Pending { to, buf } => {
                self.last_context = to;
                self.commit_dispatch(to, buf);
            }
            SwitchState::Idle => {
                tracing::warn!("spurious context-switch completion ignored");
            }
        }
    }

    /// Back-end notification that a dispatched buffer completed; returns it
    /// to the pool.
    pub fn buffer_complete(&mut self, buf: &BufRef) {
        if buf.state() == BufState::Pend {
            self.pool.release(buf);
        } else {
            tracing::warn!(
                index = buf.index(),
                state = ?buf.state(),
                "completion for buffer not pending on hardware"
            );
        }
    }

    /// Device teardown: tears down every queue and recycles everything the
    /// hardware had not yet been given.
    pub fn tear_down(&mut self) {
        if let SwitchState::Pending { buf, .. } = mem::replace(&mut self.switch, SwitchState::Idle)
        {
            self.discard(buf);
        }
        while let Some(buf) = self.prio.pop_front() {
            self.discard(buf);
        }
        let contexts: Vec<u32> = self.queues.keys().copied().collect();
        for id in contexts {
            let _ = self.destroy_context(ContextId(id));
        }
    }
}

impl std::fmt::Debug for Scheduler {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.debug_struct("Scheduler")
            .field("contexts", &self.queues.len())
            .field("switch", &self.switch)
            .field("last_context", &self.last_context)
            .field("stats", &self.stats)
            .finish()
    }
}
