//! Per-context dispatch queues and the hardware scheduler for the arbor
//! device-arbitration engine.

#![forbid(unsafe_code)]

pub mod queue;
pub mod sched;

pub use queue::{DispatchQueue, EnqueueError};
pub use sched::{HardwareBackend, SchedError, SchedStats, Scheduler, Serviced};
