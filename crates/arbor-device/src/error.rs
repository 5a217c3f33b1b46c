//! The unified error taxonomy of the command surface.
//!
//! Subsystem errors collapse into five user-visible classes, each with a
//! fixed negative errno so the ioctl-shaped boundary can report failures the
//! way existing consumers expect. No partial state change is ever committed
//! on the failure paths that produce these.

use thiserror::Error;

use arbor_agp::AgpError;
use arbor_bufs::{AllocError, PoolError};
use arbor_lock::AcquireError;
use arbor_sched::{EnqueueError, SchedError};
use arbor_vblank::VblankError;

pub type Result<T> = std::result::Result<T, ArbError>;

#[derive(Debug, Error, Clone, PartialEq, Eq)]
pub enum ArbError {
    /// Bad index, bad context, zero-length buffer, kernel-context misuse.
    #[error("invalid argument: {0}")]
    InvalidArgument(&'static str),

    /// Resource held or exhausted under no-wait semantics.
    #[error("busy: {0}")]
    Busy(&'static str),

    /// A blocking wait was cancelled. `restartable` distinguishes
    /// signal-interrupted waits the caller may retry (ERESTARTSYS) from
    /// teardown (EINTR).
    #[error("interrupted (restartable: {restartable})")]
    Interrupted { restartable: bool },

    /// Bad user-supplied pointer or malformed copied-in structure.
    #[error("bad user address")]
    Fault,

    /// Allocation failure in the pool or a back-end.
    #[error("out of memory")]
    NoMemory,
}

const EINTR: i32 = 4;
const ENOMEM: i32 = 12;
const EFAULT: i32 = 14;
const EBUSY: i32 = 16;
const EINVAL: i32 = 22;
const ERESTARTSYS: i32 = 512;

impl ArbError {
    /// The negative errno this error reports at the ioctl boundary.
    pub fn errno(&self) -> i32 {
        match self {
            ArbError::InvalidArgument(_) => -EINVAL,
            ArbError::Busy(_) => -EBUSY,
            ArbError::Interrupted { restartable: true } => -ERESTARTSYS,
            ArbError::Interrupted { restartable: false } => -EINTR,
            ArbError::Fault => -EFAULT,
            ArbError::NoMemory => -ENOMEM,
        }
    }
}

impl From<AcquireError> for ArbError {
    fn from(err: AcquireError) -> Self {
        match err {
            AcquireError::Interrupted => ArbError::Interrupted { restartable: true },
            AcquireError::TornDown => ArbError::Interrupted { restartable: false },
        }
    }
}

impl From<AllocError> for ArbError {
    fn from(err: AllocError) -> Self {
        match err {
            AllocError::NoSuchOrder(_) => ArbError::InvalidArgument("no buffers of that order"),
            AllocError::Interrupted => ArbError::Interrupted { restartable: true },
            AllocError::TornDown => ArbError::Interrupted { restartable: false },
        }
    }
}

impl From<PoolError> for ArbError {
    fn from(err: PoolError) -> Self {
        match err {
            PoolError::InvalidOrder(_) => ArbError::InvalidArgument("buffer order out of range"),
            PoolError::ZeroCount(_) => ArbError::InvalidArgument("zero buffers requested"),
            PoolError::NoSuchOrder(_) => ArbError::InvalidArgument("no buffers of that order"),
            PoolError::BadMarks { .. } => ArbError::InvalidArgument("bad freelist watermarks"),
        }
    }
}

impl From<EnqueueError> for ArbError {
    fn from(err: EnqueueError) -> Self {
        match err {
            EnqueueError::Full => ArbError::Busy("dispatch queue full"),
            EnqueueError::Interrupted => ArbError::Interrupted { restartable: true },
            EnqueueError::TornDown => ArbError::Interrupted { restartable: false },
        }
    }
}

impl From<SchedError> for ArbError {
    fn from(err: SchedError) -> Self {
        match err {
            SchedError::ContextExists(_) => ArbError::Busy("context already exists"),
            SchedError::UnknownContext(_) => ArbError::InvalidArgument("unknown context"),
            SchedError::KernelContext => ArbError::InvalidArgument("kernel context misuse"),
            SchedError::ZeroDepth => ArbError::InvalidArgument("zero-depth dispatch queue"),
        }
    }
}

impl From<AgpError> for ArbError {
    fn from(err: AgpError) -> Self {
        match err {
            AgpError::AlreadyAcquired => ArbError::Busy("AGP already acquired"),
            AgpError::AlreadyBound => ArbError::Busy("AGP region already bound"),
            AgpError::NotAcquired => ArbError::InvalidArgument("AGP not acquired"),
            AgpError::ZeroPages => ArbError::InvalidArgument("zero-page AGP allocation"),
            AgpError::UnknownHandle(_) => ArbError::InvalidArgument("unknown AGP handle"),
            AgpError::NoMemory | AgpError::Backend(_) => ArbError::NoMemory,
        }
    }
}

impl From<VblankError> for ArbError {
    fn from(err: VblankError) -> Self {
        match err {
            VblankError::Interrupted => ArbError::Interrupted { restartable: true },
            // The bounded wait gave up; EBUSY, matching the historical
            // behaviour of the 3-second IRQ wait.
            VblankError::TimedOut => ArbError::Busy("vblank wait timed out"),
            VblankError::TooManyPending => ArbError::Busy("too many pending vblank signals"),
            VblankError::TornDown => ArbError::Interrupted { restartable: false },
        }
    }
}
