//! Device directory
//!
//! Lists the devices the operator has granted access to and runs the
//! permission prompt for new ones. Every listing is fetched fresh from the
//! backend.

use crate::error::{PanelError, Result};
use common::DeviceBackend;
use protocol::{DeviceId, DeviceSummary, UsbError};
use std::collections::BTreeMap;
use std::sync::Arc;
use tracing::debug;

pub struct DeviceDirectory<B> {
    backend: Arc<B>,
}

impl<B> Clone for DeviceDirectory<B> {
    fn clone(&self) -> Self {
        Self {
            backend: Arc::clone(&self.backend),
        }
    }
}

impl<B: DeviceBackend> DeviceDirectory<B> {
    pub fn new(backend: Arc<B>) -> Self {
        Self { backend }
    }

    /// Permitted devices keyed by identifier
    ///
    /// When two devices share an identifier the later one wins.
    pub async fn list_devices(
        &self,
    ) -> std::result::Result<BTreeMap<DeviceId, DeviceSummary>, UsbError> {
        let devices = self.backend.list_devices().await?;
        debug!("Listed {} permitted devices", devices.len());
        Ok(devices
            .into_iter()
            .map(|device| (device.id.clone(), device))
            .collect())
    }

    /// Devices the permission prompt offers
    pub async fn request_candidates(&self) -> std::result::Result<Vec<DeviceSummary>, UsbError> {
        self.backend.request_candidates().await
    }

    /// Grant access to the device picked in the permission prompt
    ///
    /// `None` means the prompt was cancelled.
    pub async fn request_device(&self, selection: Option<&DeviceId>) -> Result<DeviceSummary> {
        let id = selection.ok_or(PanelError::NoDeviceSelected)?;
        let candidates = self.request_candidates().await?;
        if !candidates.iter().any(|c| &c.id == id) {
            return Err(PanelError::DeviceNotFound(id.clone()));
        }
        Ok(self.backend.grant(id).await?)
    }

    /// Look up a permitted device against a freshly fetched listing
    pub async fn resolve_by_id(
        &self,
        id: &DeviceId,
    ) -> std::result::Result<Option<DeviceSummary>, UsbError> {
        Ok(self.list_devices().await?.remove(id))
    }
}
