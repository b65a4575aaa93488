//! Authenticators reachable by the relay
//!
//! A [`Device`] accepts an encoded CTAP2 command (command byte followed by its
//! CBOR parameters) and returns the raw response (status byte followed by the
//! CBOR body). A [`DeviceList`] reports which devices are reachable right now.

mod ble;
mod hid;
mod pcsc;

pub use ble::{BleAuthenticator, DEFAULT_BLE_RESPONSE_TIMEOUT};
pub use hid::HidAuthenticator;
pub use pcsc::PcscAuthenticator;

use crate::error::Result;

use async_trait::async_trait;

use std::sync::{Arc, Mutex, MutexGuard, PoisonError};

/// A single authenticator
#[async_trait]
pub trait Device: Send + Sync {
    /// Human readable description for logs
    fn description(&self) -> String;

    /// Send one encoded CTAP2 command and return the raw response
    async fn send_cbor(&self, request: &[u8]) -> Result<Vec<u8>>;

    /// Ask the device to abandon a request whose `send_cbor` was dropped
    ///
    /// Best effort; devices without a cancel command keep the default.
    async fn cancel(&self) -> Result<()> {
        Ok(())
    }
}

/// Source of currently reachable authenticators
#[async_trait]
pub trait DeviceList: Send + Sync {
    /// Snapshot of the reachable devices, preferred device first
    async fn devices(&self) -> Result<Vec<Arc<dyn Device>>>;
}

/// A fixed set of devices managed by the embedding application
///
/// Devices can be added or removed at any time; the gateway sees the change on
/// its next poll.
#[derive(Default)]
pub struct StaticDeviceList {
    devices: Mutex<Vec<Arc<dyn Device>>>,
}

impl StaticDeviceList {
    /// Create an empty list
    pub fn new() -> Self {
        Self::default()
    }

    /// Create a list holding `devices`
    pub fn with_devices(devices: Vec<Arc<dyn Device>>) -> Self {
        Self {
            devices: Mutex::new(devices),
        }
    }

    fn entries(&self) -> MutexGuard<'_, Vec<Arc<dyn Device>>> {
        self.devices.lock().unwrap_or_else(PoisonError::into_inner)
    }

    /// Append a device
    pub fn add(&self, device: Arc<dyn Device>) {
        self.entries().push(device);
    }

    /// Remove every device
    pub fn clear(&self) {
        self.entries().clear();
    }

    /// Get the number of devices
    pub fn len(&self) -> usize {
        self.entries().len()
    }

    /// Check if the list is empty
    pub fn is_empty(&self) -> bool {
        self.entries().is_empty()
    }
}

#[async_trait]
impl DeviceList for StaticDeviceList {
    async fn devices(&self) -> Result<Vec<Arc<dyn Device>>> {
        Ok(self.entries().clone())
    }
}
