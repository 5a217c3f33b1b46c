//! Shared identifier and cancellation types for the arbor device-arbitration
//! engine.
//!
//! Everything here is deliberately tiny: newtype ids so the subsystem crates
//! cannot mix up a rendering context with a client, plus the [`CancelToken`]
//! that every interruptible blocking wait observes.

#![forbid(unsafe_code)]

use std::sync::atomic::{AtomicBool, Ordering};
use std::sync::Arc;
use std::time::Duration;

/// Identifier of a rendering context (a client-visible session used for
/// queueing and context-switch accounting).
///
/// Context `0` is reserved for the kernel itself and is never handed to a
/// client.
#[derive(Debug, Clone, Copy, PartialEq, Eq, PartialOrd, Ord, Hash)]
pub struct ContextId(pub u32);

/// The reserved in-kernel context.
pub const KERNEL_CONTEXT: ContextId = ContextId(0);

impl ContextId {
    pub fn is_kernel(self) -> bool {
        self == KERNEL_CONTEXT
    }
}

impl std::fmt::Display for ContextId {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        write!(f, "ctx{}", self.0)
    }
}

/// Identifier of a client process holding an open device handle (the `pid`
/// analogue). `ClientId(0)` means "unowned".
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash)]
pub struct ClientId(pub u32);

pub const NO_CLIENT: ClientId = ClientId(0);

impl std::fmt::Display for ClientId {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        write!(f, "client{}", self.0)
    }
}

/// Identifier of a registered device (the minor-number analogue).
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash)]
pub struct DeviceId(pub u32);

/// How long a blocking wait sleeps between re-checks of its wake condition
/// and its [`CancelToken`].
///
/// All interruptible waits in the engine (lock acquisition, buffer
/// allocation under exhaustion, enqueue on a full ring, vblank waits) sleep
/// on a condvar in slices of this length so that cancellation is observed
/// promptly even if a wakeup is lost.
pub const WAIT_SLICE: Duration = Duration::from_millis(2);

/// Cooperative cancellation flag standing in for POSIX signal delivery.
///
/// An ioctl-shaped entry point creates (or is handed) a token; delivering a
/// signal to the blocked task is modeled as [`CancelToken::cancel`]. Blocking
/// waits poll the token each wait slice and return an `Interrupted` error
/// instead of sleeping forever.
#[derive(Debug, Clone, Default)]
pub struct CancelToken {
    inner: Arc<AtomicBool>,
}

impl CancelToken {
    pub fn new() -> Self {
        Self::default()
    }

    /// Marks the token cancelled. Idempotent.
    pub fn cancel(&self) {
        self.inner.store(true, Ordering::Release);
    }

    pub fn is_cancelled(&self) -> bool {
        self.inner.load(Ordering::Acquire)
    }
}
