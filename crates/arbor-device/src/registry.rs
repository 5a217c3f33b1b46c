//! The device registry: minor-number-style lookup of registered devices.

use std::collections::HashMap;
use std::sync::{Arc, Mutex};

use arbor_agp::AgpBackend;
use arbor_lock::SignalMask;
use arbor_sched::HardwareBackend;
use arbor_types::DeviceId;
use arbor_vblank::SignalSink;

use crate::device::{Device, DeviceConfig};
use crate::error::{ArbError, Result};

/// Process-wide table of registered devices.
#[derive(Default)]
pub struct DeviceRegistry {
    devices: Mutex<HashMap<u32, Arc<Device>>>,
}

impl DeviceRegistry {
    pub fn new() -> Self {
        Self::default()
    }

    /// Registers a new device under `id`.
    pub fn register(
        &self,
        id: DeviceId,
        config: DeviceConfig,
        hardware: Arc<dyn HardwareBackend>,
        agp: Arc<dyn AgpBackend>,
        sink: Arc<dyn SignalSink>,
        mask: Arc<dyn SignalMask>,
    ) -> Result<Arc<Device>> {
        let mut devices = self.devices.lock().unwrap();
        if devices.contains_key(&id.0) {
            return Err(ArbError::Busy("device id already registered"));
        }
        let device = Device::new(id, config, hardware, agp, sink, mask);
        tracing::info!(device = id.0, name = device.name(), "device registered");
        devices.insert(id.0, device.clone());
        Ok(device)
    }

    pub fn get(&self, id: DeviceId) -> Option<Arc<Device>> {
        self.devices.lock().unwrap().get(&id.0).cloned()
    }

    pub fn ids(&self) -> Vec<DeviceId> {
        let mut ids: Vec<u32> = self.devices.lock().unwrap().keys().copied().collect();
        ids.sort_unstable();
        ids.into_iter().map(DeviceId).collect()
    }

    /// Unregisters a device and tears it down, unblocking every waiter.
    /// Outstanding `Arc` handles keep the torn-down device alive but all
    /// blocking operations on it fail from this point on.
    pub fn unregister(&self, id: DeviceId) -> Result<()> {
        let device = self
            .devices
            .lock()
            .unwrap()
            .remove(&id.0)
            .ok_or(ArbError::InvalidArgument("unknown device id"))?;
        device.tear_down();
        Ok(())
    }
}

impl std::fmt::Debug for DeviceRegistry {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.debug_struct("DeviceRegistry")
            .field("devices", &self.devices.lock().unwrap().len())
            .finish()
    }
}
