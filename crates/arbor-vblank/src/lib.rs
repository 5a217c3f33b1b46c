//! VBlank / IRQ signal dispatcher.
//!
//! A monotonically increasing interrupt counter drives two delivery
//! mechanisms: synchronous bounded waits ([`VblankDispatcher::wait_for`])
//! and asynchronous signal registrations delivered from interrupt context
//! ([`VblankDispatcher::register_signal`]). Sequence comparison is
//! wraparound-safe over a 24-bit window: a target is "due" once the counter
//! has passed it by less than 2^23, and "not yet" otherwise.

#![forbid(unsafe_code)]

use std::sync::atomic::{AtomicU32, Ordering};
use std::sync::{Arc, Condvar, Mutex};
use std::time::{Duration, Instant, SystemTime};

use arbor_types::{CancelToken, ClientId, WAIT_SLICE};
use thiserror::Error;

/// The counter window within which a sequence is considered reached.
const SEQ_MASK: u32 = 0x00FF_FFFF;
const SEQ_HALF_WINDOW: u32 = 1 << 23;

/// Wraparound-safe "has the counter reached `target`" comparison.
///
/// The difference is interpreted as a 24-bit signed quantity: due when the
/// counter is past `target` by less than 2^23, not yet due when the masked
/// difference is 2^23 or more.
pub fn seq_due(current: u32, target: u32) -> bool {
    current.wrapping_sub(target) & SEQ_MASK < SEQ_HALF_WINDOW
}

/// Tunables the original driver hard-coded; kept configurable because the
/// historical values (100 pending registrations, 3 s wait bound) have no
/// documented rationale.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub struct VblankConfig {
    /// Upper bound on simultaneously pending signal registrations.
    pub max_pending: usize,
    /// How long a synchronous wait may block before giving up.
    pub wait_timeout: Duration,
}

impl Default for VblankConfig {
    fn default() -> Self {
        Self {
            max_pending: 100,
            wait_timeout: Duration::from_secs(3),
        }
    }
}

/// Collaborator that actually posts a signal to a task.
pub trait SignalSink: Send + Sync {
    fn deliver(&self, task: ClientId, signal: u32);
}

/// Sink for devices without signal plumbing.
#[derive(Debug, Default)]
pub struct NullSignalSink;

impl SignalSink for NullSignalSink {
    fn deliver(&self, _task: ClientId, _signal: u32) {}
}

#[derive(Debug, Error, Clone, Copy, PartialEq, Eq)]
pub enum VblankError {
    #[error("vblank wait interrupted by signal")]
    Interrupted,
    #[error("vblank wait timed out")]
    TimedOut,
    #[error("too many pending vblank signal registrations")]
    TooManyPending,
    #[error("vblank dispatcher torn down")]
    TornDown,
}

#[derive(Debug, Clone, Copy, PartialEq, Eq)]
struct SignalReg {
    task: ClientId,
    signal: u32,
    target: u32,
}

#[derive(Debug, Default)]
struct Pending {
    regs: Vec<SignalReg>,
    torn_down: bool,
}

/// Result of a completed synchronous wait: the counter value observed and
/// when it was observed.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub struct VblankReply {
    pub sequence: u32,
    pub when: SystemTime,
}

/// Per-device vblank state: the interrupt counter plus pending signal
/// registrations.
pub struct VblankDispatcher {
    counter: AtomicU32,
    config: VblankConfig,
    sink: Arc<dyn SignalSink>,
    shared: Mutex<Pending>,
    wake: Condvar,
}

impl std::fmt::Debug for VblankDispatcher {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.debug_struct("VblankDispatcher")
            .field("counter", &self.counter())
            .field("config", &self.config)
            .field("pending", &self.pending_count())
            .finish()
    }
}

impl VblankDispatcher {
    pub fn new(config: VblankConfig, sink: Arc<dyn SignalSink>) -> Self {
        Self {
            counter: AtomicU32::new(0),
            config,
            sink,
            shared: Mutex::new(Pending::default()),
            wake: Condvar::new(),
        }
    }

    pub fn counter(&self) -> u32 {
        self.counter.load(Ordering::Acquire)
    }

    pub fn config(&self) -> VblankConfig {
        self.config
    }

    pub fn pending_count(&self) -> usize {
        self.shared.lock().unwrap().regs.len()
    }

    /// Called from interrupt context on each vblank: advances the counter,
    /// delivers every registration now due, wakes synchronous waiters.
    /// Returns the new counter value.
    pub fn irq_tick(&self) -> u32 {
        let current = self.counter.fetch_add(1, Ordering::AcqRel).wrapping_add(1);
        let mut shared = self.shared.lock().unwrap();
        let mut due = Vec::new();
        shared.regs.retain(|reg| {
            if seq_due(current, reg.target) {
                due.push(*reg);
                false
            } else {
                true
            }
        });
        drop(shared);
        for reg in due {
            tracing::trace!(task = reg.task.0, signal = reg.signal, sequence = reg.target,
                "delivering vblank signal");
            self.sink.deliver(reg.task, reg.signal);
        }
        self.wake.notify_all();
        current
    }

    /// Blocks until the counter reaches `target`, bounded by the configured
    /// timeout. Returns the counter and a timestamp taken at wake-up.
    pub fn wait_for(&self, target: u32, cancel: &CancelToken) -> Result<VblankReply, VblankError> {
        let deadline = Instant::now() + self.config.wait_timeout;
        let mut shared = self.shared.lock().unwrap();
        loop {
            let current = self.counter();
            if seq_due(current, target) {
                return Ok(VblankReply {
                    sequence: current,
                    when: SystemTime::now(),
                });
            }
            if shared.torn_down {
                return Err(VblankError::TornDown);
            }
            if cancel.is_cancelled() {
                return Err(VblankError::Interrupted);
            }
            if Instant::now() >= deadline {
                return Err(VblankError::TimedOut);
            }
            let (guard, _timeout) = self.wake.wait_timeout(shared, WAIT_SLICE).unwrap();
            shared = guard;
        }
    }

    /// Registers an asynchronous signal to be delivered once the counter
    /// reaches `target`.
    ///
    /// A registration identical in `(task, signal, target)` to one already
    /// pending is a de-duplicated no-op. Registrations beyond the configured
    /// bound are refused so a misbehaving client cannot grow kernel memory
    /// without limit.
    pub fn register_signal(
        &self,
        target: u32,
        signal: u32,
        task: ClientId,
    ) -> Result<(), VblankError> {
        let reg = SignalReg {
            task,
            signal,
            target,
        };
        let mut shared = self.shared.lock().unwrap();
        if shared.torn_down {
            return Err(VblankError::TornDown);
        }
        if shared.regs.contains(&reg) {
            return Ok(());
        }
        if shared.regs.len() >= self.config.max_pending {
            return Err(VblankError::TooManyPending);
        }
        shared.regs.push(reg);
        Ok(())
    }

    /// Drops every registration belonging to a closing task.
    pub fn forget_task(&self, task: ClientId) -> usize {
        let mut shared = self.shared.lock().unwrap();
        let before = shared.regs.len();
        shared.regs.retain(|reg| reg.task != task);
        before - shared.regs.len()
    }

    /// Wakes all synchronous waiters with a teardown error and drops all
    /// pending registrations.
    pub fn tear_down(&self) {
        let mut shared = self.shared.lock().unwrap();
        shared.torn_down = true;
        shared.regs.clear();
        drop(shared);
        self.wake.notify_all();
    }
}
