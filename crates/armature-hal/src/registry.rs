//! [`DeviceRegistry`] – the table of every device the server provides.
//!
//! Maps a [`DeviceId`] (interface, index, port) to the [`DriverHost`] that
//! serves it and the access mode it was registered with.  Entries are only
//! ever added; a device stays registered for the lifetime of the registry.
//!
//! The registry lock is never held while calling into a driver, so drivers
//! may look up other devices from any hook.

use std::collections::BTreeMap;
use std::sync::Arc;

use armature_middleware::MessageQueue;
use armature_types::{AccessMode, DeviceId, HalError};
use parking_lot::RwLock;
use tracing::info;

use crate::host::DriverHost;

/// One registered device.
#[derive(Debug, Clone)]
pub struct DeviceEntry {
    pub id: DeviceId,
    pub access: AccessMode,
    pub driver: Arc<DriverHost>,
}

/// Central device table.
///
/// Construct with [`DeviceRegistry::new`], share as `Arc<DeviceRegistry>`
/// and register drivers through [`DriverHost::new`].
#[derive(Debug, Default)]
pub struct DeviceRegistry {
    devices: RwLock<BTreeMap<DeviceId, DeviceEntry>>,
}

impl DeviceRegistry {
    /// Create an empty registry.
    pub fn new() -> Self {
        Self::default()
    }

    /// Register `driver` as the provider of `id`.
    ///
    /// # Errors
    ///
    /// Returns [`HalError::DuplicateDevice`] when `id` is already taken.  The
    /// existing entry is left untouched.
    pub fn add_device(&self, id: DeviceId, access: AccessMode, driver: Arc<DriverHost>) -> Result<(), HalError> {
        let mut devices = self.devices.write();
        if devices.contains_key(&id) {
            return Err(HalError::DuplicateDevice(id));
        }
        info!(device = %id, driver = driver.name(), ?access, "device registered");
        devices.insert(id, DeviceEntry { id, access, driver });
        Ok(())
    }

    pub fn get_device(&self, id: DeviceId) -> Option<DeviceEntry> {
        self.devices.read().get(&id).cloned()
    }

    pub fn get_driver(&self, id: DeviceId) -> Option<Arc<DriverHost>> {
        self.devices.read().get(&id).map(|e| Arc::clone(&e.driver))
    }

    /// Like [`DeviceRegistry::get_driver`], reporting a missing device as
    /// [`HalError::UnknownDevice`].
    pub fn require_driver(&self, id: DeviceId) -> Result<Arc<DriverHost>, HalError> {
        self.get_driver(id).ok_or(HalError::UnknownDevice(id))
    }

    /// Every registered device, ordered by identity.
    pub fn devices(&self) -> Vec<DeviceEntry> {
        self.devices.read().values().cloned().collect()
    }

    /// Every distinct driver, in order of its first registered device.
    pub fn drivers(&self) -> Vec<Arc<DriverHost>> {
        let mut drivers: Vec<Arc<DriverHost>> = Vec::new();
        for entry in self.devices.read().values() {
            if !drivers.iter().any(|d| Arc::ptr_eq(d, &entry.driver)) {
                drivers.push(Arc::clone(&entry.driver));
            }
        }
        drivers
    }

    pub fn len(&self) -> usize {
        self.devices.read().len()
    }

    pub fn is_empty(&self) -> bool {
        self.devices.read().is_empty()
    }

    /// Subscribe `client` to the driver serving `id`.
    pub fn subscribe(&self, id: DeviceId, client: Option<&Arc<MessageQueue>>) -> Result<(), HalError> {
        self.require_driver(id)?.subscribe(client)
    }

    /// Undo a [`DeviceRegistry::subscribe`].
    pub fn unsubscribe(&self, id: DeviceId, client: Option<&Arc<MessageQueue>>) -> Result<(), HalError> {
        self.require_driver(id)?.unsubscribe(client)
    }
}
