//! Device assembly and the ioctl-shaped command surface of the arbor
//! device-arbitration engine.
//!
//! [`Device`] wires the subsystem crates (lock, buffer pool, scheduler, AGP
//! ledger, vblank dispatcher) together behind [`Device::command`];
//! [`FileHandle`] models one client's open handle, with the close-time
//! reclaim protocol on drop; [`DeviceRegistry`] is the minor-number lookup
//! table.

#![forbid(unsafe_code)]

pub mod device;
pub mod error;
pub mod registry;

pub use device::{Command, Device, DeviceConfig, FileHandle, Reply, StatsSnapshot};
pub use error::{ArbError, Result};
pub use registry::DeviceRegistry;
