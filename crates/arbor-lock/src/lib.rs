//! Hardware lock manager: the single mutual-exclusion token gating direct
//! device access.
//!
//! The lock is one shared 32-bit word mutated only through compare-and-swap:
//!
//! - bit 31: `HELD`
//! - bit 30: `CONTENDED` (set by a loser so the owner knows to wake sleepers)
//! - bits 0..=29: owning context id (context 0 is the kernel)
//!
//! [`HardwareLock::try_take`] / [`HardwareLock::free`] are the lock-free
//! primitives; [`HardwareLock::acquire`] is the composite interruptible
//! blocking wait used by ioctl-shaped entry points. There is no FIFO
//! ticketing: whoever wins the CAS after a wakeup proceeds, so starvation is
//! possible under sustained contention. That matches the device's historical
//! behaviour and is accepted here.

#![forbid(unsafe_code)]

pub mod shield;

pub use shield::{MaskToken, NullSignalMask, SignalMask, SignalShield};

use std::sync::atomic::{AtomicU32, Ordering};
use std::sync::{Condvar, Mutex};
use std::time::Instant;

use arbor_types::{CancelToken, ContextId, WAIT_SLICE};
use thiserror::Error;

const LOCK_HELD: u32 = 0x8000_0000;
const LOCK_CONTENDED: u32 = 0x4000_0000;
const LOCK_CONTEXT_MASK: u32 = 0x3FFF_FFFF;

/// Why a blocking [`HardwareLock::acquire`] returned without the lock.
#[derive(Debug, Error, Clone, Copy, PartialEq, Eq)]
pub enum AcquireError {
    /// A pending signal cancelled the wait. The caller's retry boundary may
    /// restart the operation (ERESTARTSYS semantics).
    #[error("lock wait interrupted by signal")]
    Interrupted,
    /// The device is being torn down; the wait can never complete (EINTR
    /// semantics, not restartable).
    #[error("lock torn down while waiting")]
    TornDown,
}

#[derive(Debug)]
struct SleepState {
    torn_down: bool,
}

/// The per-device hardware lock.
///
/// At most one context holds the lock at any instant; the holder is either a
/// real rendering context or the reserved kernel context 0.
#[derive(Debug)]
pub struct HardwareLock {
    word: AtomicU32,
    sleep: Mutex<SleepState>,
    wake: Condvar,
}

impl Default for HardwareLock {
    fn default() -> Self {
        Self::new()
    }
}

impl HardwareLock {
    pub fn new() -> Self {
        Self {
            word: AtomicU32::new(0),
            sleep: Mutex::new(SleepState { torn_down: false }),
            wake: Condvar::new(),
        }
    }

    /// Attempts to take the lock for `context` without blocking.
    ///
    /// On contention the `CONTENDED` bit is set (so the eventual release
    /// wakes sleepers) and `false` is returned; the caller must retry.
    pub fn try_take(&self, context: ContextId) -> bool {
        debug_assert_eq!(context.0 & !LOCK_CONTEXT_MASK, 0);
        loop {
            let old = self.word.load(Ordering::Acquire);
            let new = if old & LOCK_HELD != 0 {
                old | LOCK_CONTENDED
            } else {
                LOCK_HELD | (context.0 & LOCK_CONTEXT_MASK)
            };
            if self
                .word
                .compare_exchange_weak(old, new, Ordering::AcqRel, Ordering::Acquire)
                .is_ok()
            {
                return old & LOCK_HELD == 0;
            }
        }
    }

    /// Rewrites the owner without releasing `HELD`.
    ///
    /// Only valid while the caller holds the lock; used when the kernel
    /// confiscates the lock from a dying client before freeing it.
    pub fn transfer(&self, new_owner: ContextId) {
        debug_assert!(self.is_held());
        loop {
            let old = self.word.load(Ordering::Acquire);
            let new = LOCK_HELD | (old & LOCK_CONTENDED) | (new_owner.0 & LOCK_CONTEXT_MASK);
            if self
                .word
                .compare_exchange_weak(old, new, Ordering::AcqRel, Ordering::Acquire)
                .is_ok()
            {
                return;
            }
        }
    }

    /// Releases the lock held by `context`.
    ///
    /// Returns `false` (after logging) if the caller does not own the lock;
    /// this is a defensive check, never fatal. A release observed by any
    /// sleeper wakes it so the CAS race can be re-run.
    pub fn free(&self, context: ContextId) -> bool {
        let old = self.word.load(Ordering::Acquire);
        if old & LOCK_HELD == 0 || old & LOCK_CONTEXT_MASK != context.0 {
            tracing::warn!(
                holder = old & LOCK_CONTEXT_MASK,
                caller = context.0,
                "free of hardware lock by non-owner ignored"
            );
            return false;
        }
        loop {
            let cur = self.word.load(Ordering::Acquire);
            if self
                .word
                .compare_exchange_weak(cur, 0, Ordering::AcqRel, Ordering::Acquire)
                .is_ok()
            {
                break;
            }
        }
        // Sleepers also poll in slices, but waking on every release keeps
        // handoff latency down to the CAS race itself.
        self.wake.notify_all();
        true
    }

    /// Blocking, interruptible acquisition: retry [`Self::try_take`] until it
    /// succeeds, sleeping between attempts.
    ///
    /// Cancellation via `cancel` surfaces as [`AcquireError::Interrupted`];
    /// device teardown as [`AcquireError::TornDown`].
    pub fn acquire(&self, context: ContextId, cancel: &CancelToken) -> Result<(), AcquireError> {
        loop {
            if self.try_take(context) {
                return Ok(());
            }
            let guard = self.sleep.lock().unwrap();
            if guard.torn_down {
                return Err(AcquireError::TornDown);
            }
            if cancel.is_cancelled() {
                return Err(AcquireError::Interrupted);
            }
            // Re-check under the sleep mutex: a release between our failed
            // CAS and this point must not be missed for a full slice.
            if !self.is_held() {
                continue;
            }
            let (_guard, _timeout) = self.wake.wait_timeout(guard, WAIT_SLICE).unwrap();
        }
    }

    /// Marks the lock dead and wakes every sleeper so blocked acquirers can
    /// observe teardown.
    pub fn tear_down(&self) {
        self.sleep.lock().unwrap().torn_down = true;
        self.wake.notify_all();
    }

    pub fn is_held(&self) -> bool {
        self.word.load(Ordering::Acquire) & LOCK_HELD != 0
    }

    /// The context currently holding the lock, if any.
    pub fn holder(&self) -> Option<ContextId> {
        let w = self.word.load(Ordering::Acquire);
        if w & LOCK_HELD != 0 {
            Some(ContextId(w & LOCK_CONTEXT_MASK))
        } else {
            None
        }
    }

    pub fn held_by(&self, context: ContextId) -> bool {
        self.holder() == Some(context)
    }

    /// Whether a failed taker has flagged contention since the last release.
    pub fn is_contended(&self) -> bool {
        self.word.load(Ordering::Acquire) & LOCK_CONTENDED != 0
    }
}

/// Per-device bookkeeping mutated only while the hardware lock is held.
#[derive(Debug)]
pub struct DeviceLockState {
    /// Context the hardware was last programmed for.
    pub last_context: ContextId,
    /// When the last hardware context switch was issued.
    pub last_switch: Option<Instant>,
    /// Client holding the lock via the ioctl surface, if any.
    pub holder: Option<arbor_types::ClientId>,
}

impl Default for DeviceLockState {
    fn default() -> Self {
        Self {
            last_context: arbor_types::KERNEL_CONTEXT,
            last_switch: None,
            holder: None,
        }
    }
}
