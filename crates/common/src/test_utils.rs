//! Test utilities for usb-panel
//!
//! Provides a scriptable [`MockBackend`], device fixtures and helper functions
//! for testing across crates.
//!
//! # Example
//!
//! ```
//! use common::test_utils::{MockBackend, mock_device};
//!
//! let backend = MockBackend::new().with_device(mock_device(0x1234, 0x5678, Some("AB12"), 2));
//! assert_eq!(backend.granted_ids()[0].as_str(), "4660-22136-AB12");
//! ```

use crate::backend::{BackendResult, DeviceBackend};
use protocol::{
    ConfigurationDescription, DeviceDescription, DeviceHandle, DeviceId, DeviceSummary,
    Direction, EndpointDescription, EndpointType, InterfaceDescription, UsbError, Version,
};
use std::collections::{HashMap, VecDeque};
use std::future::Future;
use std::sync::{Mutex, MutexGuard};
use std::time::Duration;
use tokio_util::sync::CancellationToken;

/// Default test timeout (5 seconds)
pub const DEFAULT_TEST_TIMEOUT: Duration = Duration::from_secs(5);

// ============================================================================
// Fixtures
// ============================================================================

/// Create a device description with one configuration (value 1, active)
///
/// Interface `n` carries a bulk IN and a bulk OUT endpoint, both numbered
/// `n + 1`, with a 64-byte packet size.
///
/// # Example
/// ```
/// use common::test_utils::mock_device;
///
/// let device = mock_device(0x1234, 0x5678, None, 3);
/// assert_eq!(device.configurations[0].interfaces.len(), 3);
/// assert_eq!(device.active_configuration, Some(1));
/// ```
pub fn mock_device(
    vendor_id: u16,
    product_id: u16,
    serial_number: Option<&str>,
    interfaces: u8,
) -> DeviceDescription {
    DeviceDescription {
        vendor_id,
        product_id,
        serial_number: serial_number.map(str::to_string),
        product_name: Some(format!("Test Product {:04x}", product_id)),
        manufacturer_name: Some("Test Manufacturer".to_string()),
        device_class: 0x00,
        device_subclass: 0x00,
        device_protocol: 0x00,
        device_version: Version::new(1, 0, 0),
        usb_version: Version::new(2, 0, 0),
        active_configuration: Some(1),
        configurations: vec![mock_configuration(1, interfaces)],
    }
}

/// Create a configuration whose interfaces follow the [`mock_device`] layout
pub fn mock_configuration(value: u8, interfaces: u8) -> ConfigurationDescription {
    ConfigurationDescription {
        value,
        name: None,
        interfaces: (0..interfaces).map(mock_interface).collect(),
    }
}

/// Create a vendor-specific interface with bulk IN/OUT endpoints `number + 1`
pub fn mock_interface(number: u8) -> InterfaceDescription {
    let endpoint = |direction| EndpointDescription {
        number: number + 1,
        direction,
        transfer_type: EndpointType::Bulk,
        packet_size: 64,
    };
    InterfaceDescription {
        number,
        claimed: false,
        name: None,
        class: 0xff,
        subclass: 0x00,
        protocol: 0x00,
        endpoints: vec![endpoint(Direction::In), endpoint(Direction::Out)],
    }
}

/// Create mock bulk transfer data of specified size
pub fn create_mock_bulk_data(size: usize) -> Vec<u8> {
    (0..size).map(|i| (i & 0xFF) as u8).collect()
}

/// Directory entry for a description
pub fn summary_of(device: &DeviceDescription) -> DeviceSummary {
    DeviceSummary {
        id: device.id(),
        vendor_id: device.vendor_id,
        product_id: device.product_id,
        serial_number: device.serial_number.clone(),
        product_name: device.product_name.clone(),
        manufacturer_name: device.manufacturer_name.clone(),
    }
}

// ============================================================================
// Mock backend
// ============================================================================

/// Backend operation, used to inject failures
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash)]
pub enum MockOp {
    ListDevices,
    RequestCandidates,
    Grant,
    Open,
    Close,
    SelectConfiguration,
    ClaimInterface,
    ReleaseInterface,
    Describe,
    TransferOut,
    TransferIn,
}

/// Call recorded by [`MockBackend`], in arrival order
#[derive(Debug, Clone, PartialEq, Eq)]
pub enum MockCall {
    ListDevices,
    RequestCandidates,
    Grant(DeviceId),
    Open(DeviceId),
    Close(DeviceHandle),
    SelectConfiguration(u8),
    ClaimInterface(u8),
    ReleaseInterface(u8),
    Describe,
    TransferOut { endpoint: u8, data: Vec<u8> },
    TransferIn { endpoint: u8, length: usize },
}

struct MockDevice {
    description: DeviceDescription,
    granted: bool,
    attached: bool,
}

#[derive(Default)]
struct MockState {
    devices: Vec<MockDevice>,
    handles: HashMap<DeviceHandle, DeviceId>,
    next_handle: u32,
    failures: HashMap<MockOp, UsbError>,
    transfer_delay: Option<Duration>,
    hang_transfers: bool,
    in_data: HashMap<u8, VecDeque<Vec<u8>>>,
    writes: Vec<(u8, Vec<u8>)>,
    calls: Vec<MockCall>,
}

impl MockState {
    fn check(&mut self, op: MockOp, call: MockCall) -> BackendResult<()> {
        self.calls.push(call);
        match self.failures.get(&op) {
            Some(err) => Err(err.clone()),
            None => Ok(()),
        }
    }

    fn device(&self, id: &DeviceId) -> Option<&MockDevice> {
        // Later entries win on identifier collisions, like a real listing
        self.devices.iter().rev().find(|d| d.attached && &d.description.id() == id)
    }

    fn opened(&mut self, handle: DeviceHandle) -> BackendResult<&mut DeviceDescription> {
        let id = self.handles.get(&handle).ok_or(UsbError::NotOpen)?.clone();
        let device = self
            .devices
            .iter_mut()
            .rev()
            .find(|d| d.description.id() == id)
            .ok_or(UsbError::NoDevice)?;
        if !device.attached {
            return Err(UsbError::NoDevice);
        }
        Ok(&mut device.description)
    }

    fn summaries(&self, granted: Option<bool>) -> Vec<DeviceSummary> {
        self.devices
            .iter()
            .filter(|d| d.attached && granted.is_none_or(|g| d.granted == g))
            .map(|d| summary_of(&d.description))
            .collect()
    }

    /// Check that `endpoint` is usable in `direction`
    fn route(
        &mut self,
        handle: DeviceHandle,
        endpoint: u8,
        direction: Direction,
    ) -> BackendResult<()> {
        let device = self.opened(handle)?;
        let found = device.active().is_some_and(|config| {
            config
                .interfaces
                .iter()
                .filter(|iface| iface.claimed)
                .flat_map(|iface| iface.endpoints.iter())
                .any(|ep| ep.number == (endpoint & 0x0f) && ep.direction == direction)
        });
        if found { Ok(()) } else { Err(UsbError::NotFound) }
    }
}

/// Scriptable in-memory [`DeviceBackend`]
///
/// Devices added with [`MockBackend::with_device`] are already granted;
/// [`MockBackend::with_candidate`] devices must go through `grant` first.
/// Transfers complete immediately unless a delay or hang is configured, in
/// which case they end early with [`UsbError::Cancelled`] once their token
/// fires.
#[derive(Default)]
pub struct MockBackend {
    state: Mutex<MockState>,
}

impl MockBackend {
    pub fn new() -> Self {
        Self::default()
    }

    fn state(&self) -> MutexGuard<'_, MockState> {
        self.state.lock().unwrap_or_else(|e| e.into_inner())
    }

    fn push_device(&self, description: DeviceDescription, granted: bool) {
        self.state().devices.push(MockDevice {
            description,
            granted,
            attached: true,
        });
    }

    /// Add a device that is already granted
    pub fn with_device(self, description: DeviceDescription) -> Self {
        self.push_device(description, true);
        self
    }

    /// Add a device that is attached but not yet granted
    pub fn with_candidate(self, description: DeviceDescription) -> Self {
        self.push_device(description, false);
        self
    }

    /// Hot-plug a granted device
    pub fn plug(&self, description: DeviceDescription) {
        self.push_device(description, true);
    }

    /// Detach every device with `id`; open handles start failing with `NoDevice`
    pub fn unplug(&self, id: &DeviceId) {
        for device in self.state().devices.iter_mut() {
            if &device.description.id() == id {
                device.attached = false;
            }
        }
    }

    /// Make every subsequent `op` fail with `error`
    pub fn fail(&self, op: MockOp, error: UsbError) {
        self.state().failures.insert(op, error);
    }

    pub fn clear_failure(&self, op: MockOp) {
        self.state().failures.remove(&op);
    }

    /// Delay every transfer by `delay`
    pub fn set_transfer_delay(&self, delay: Option<Duration>) {
        self.state().transfer_delay = delay;
    }

    /// Make transfers wait until they are cancelled
    pub fn hang_transfers(&self, hang: bool) {
        self.state().hang_transfers = hang;
    }

    /// Queue data for the next IN transfer on `endpoint`
    pub fn queue_in(&self, endpoint: u8, data: Vec<u8>) {
        self.state()
            .in_data
            .entry(endpoint)
            .or_default()
            .push_back(data);
    }

    /// OUT transfers that completed, as `(endpoint, data)`
    pub fn writes(&self) -> Vec<(u8, Vec<u8>)> {
        self.state().writes.clone()
    }

    pub fn calls(&self) -> Vec<MockCall> {
        self.state().calls.clone()
    }

    /// Number of handles that have not been closed
    pub fn open_handles(&self) -> usize {
        self.state().handles.len()
    }

    pub fn granted_ids(&self) -> Vec<DeviceId> {
        self.state()
            .summaries(Some(true))
            .into_iter()
            .map(|s| s.id)
            .collect()
    }

    async fn wait_for_transfer(&self, cancel: &CancellationToken) -> BackendResult<()> {
        let (hang, delay) = {
            let state = self.state();
            (state.hang_transfers, state.transfer_delay)
        };
        if cancel.is_cancelled() {
            return Err(UsbError::Cancelled);
        }
        if hang {
            cancel.cancelled().await;
            return Err(UsbError::Cancelled);
        }
        if let Some(delay) = delay {
            tokio::select! {
                _ = tokio::time::sleep(delay) => {}
                _ = cancel.cancelled() => return Err(UsbError::Cancelled),
            }
        }
        Ok(())
    }
}

impl DeviceBackend for MockBackend {
    async fn list_devices(&self) -> BackendResult<Vec<DeviceSummary>> {
        let mut state = self.state();
        state.check(MockOp::ListDevices, MockCall::ListDevices)?;
        Ok(state.summaries(Some(true)))
    }

    async fn request_candidates(&self) -> BackendResult<Vec<DeviceSummary>> {
        let mut state = self.state();
        state.check(MockOp::RequestCandidates, MockCall::RequestCandidates)?;
        Ok(state.summaries(None))
    }

    async fn grant(&self, id: &DeviceId) -> BackendResult<DeviceSummary> {
        let mut state = self.state();
        state.check(MockOp::Grant, MockCall::Grant(id.clone()))?;
        let device = state
            .devices
            .iter_mut()
            .rev()
            .find(|d| d.attached && &d.description.id() == id)
            .ok_or(UsbError::NotFound)?;
        device.granted = true;
        Ok(summary_of(&device.description))
    }

    async fn open(&self, id: &DeviceId) -> BackendResult<DeviceHandle> {
        let mut state = self.state();
        state.check(MockOp::Open, MockCall::Open(id.clone()))?;
        match state.device(id) {
            Some(device) if device.granted => {}
            Some(_) => return Err(UsbError::Access),
            None => return Err(UsbError::NotFound),
        }
        state.next_handle += 1;
        let handle = DeviceHandle(state.next_handle);
        state.handles.insert(handle, id.clone());
        Ok(handle)
    }

    async fn close(&self, handle: DeviceHandle) -> BackendResult<()> {
        let mut state = self.state();
        state.check(MockOp::Close, MockCall::Close(handle))?;
        if let Ok(device) = state.opened(handle) {
            for config in device.configurations.iter_mut() {
                for iface in config.interfaces.iter_mut() {
                    iface.claimed = false;
                }
            }
        }
        state
            .handles
            .remove(&handle)
            .map(|_| ())
            .ok_or(UsbError::NotOpen)
    }

    async fn select_configuration(&self, handle: DeviceHandle, value: u8) -> BackendResult<()> {
        let mut state = self.state();
        state.check(
            MockOp::SelectConfiguration,
            MockCall::SelectConfiguration(value),
        )?;
        let device = state.opened(handle)?;
        if !device.configurations.iter().any(|c| c.value == value) {
            return Err(UsbError::NotFound);
        }
        if device.active_configuration != Some(value) {
            for config in device.configurations.iter_mut() {
                for iface in config.interfaces.iter_mut() {
                    iface.claimed = false;
                }
            }
        }
        device.active_configuration = Some(value);
        Ok(())
    }

    async fn claim_interface(&self, handle: DeviceHandle, interface: u8) -> BackendResult<()> {
        let mut state = self.state();
        state.check(MockOp::ClaimInterface, MockCall::ClaimInterface(interface))?;
        let device = state.opened(handle)?;
        let active = device.active_configuration.ok_or(UsbError::NotFound)?;
        let iface = device
            .configurations
            .iter_mut()
            .find(|c| c.value == active)
            .and_then(|c| c.interfaces.iter_mut().find(|i| i.number == interface))
            .ok_or(UsbError::NotFound)?;
        iface.claimed = true;
        Ok(())
    }

    async fn release_interface(&self, handle: DeviceHandle, interface: u8) -> BackendResult<()> {
        let mut state = self.state();
        state.check(
            MockOp::ReleaseInterface,
            MockCall::ReleaseInterface(interface),
        )?;
        let device = state.opened(handle)?;
        let active = device.active_configuration.ok_or(UsbError::NotFound)?;
        let iface = device
            .configurations
            .iter_mut()
            .find(|c| c.value == active)
            .and_then(|c| c.interfaces.iter_mut().find(|i| i.number == interface))
            .ok_or(UsbError::NotFound)?;
        iface.claimed = false;
        Ok(())
    }

    async fn describe(&self, handle: DeviceHandle) -> BackendResult<DeviceDescription> {
        let mut state = self.state();
        state.check(MockOp::Describe, MockCall::Describe)?;
        Ok(state.opened(handle)?.clone())
    }

    async fn transfer_out(
        &self,
        handle: DeviceHandle,
        endpoint: u8,
        data: Vec<u8>,
        _timeout: Duration,
        cancel: CancellationToken,
    ) -> BackendResult<()> {
        {
            let mut state = self.state();
            state.check(
                MockOp::TransferOut,
                MockCall::TransferOut {
                    endpoint,
                    data: data.clone(),
                },
            )?;
            state.route(handle, endpoint, Direction::Out)?;
        }
        self.wait_for_transfer(&cancel).await?;
        self.state().writes.push((endpoint, data));
        Ok(())
    }

    async fn transfer_in(
        &self,
        handle: DeviceHandle,
        endpoint: u8,
        length: usize,
        _timeout: Duration,
        cancel: CancellationToken,
    ) -> BackendResult<Vec<u8>> {
        {
            let mut state = self.state();
            state.check(
                MockOp::TransferIn,
                MockCall::TransferIn { endpoint, length },
            )?;
            state.route(handle, endpoint, Direction::In)?;
        }
        self.wait_for_transfer(&cancel).await?;
        let mut data = self
            .state()
            .in_data
            .get_mut(&endpoint)
            .and_then(VecDeque::pop_front)
            .unwrap_or_default();
        data.truncate(length);
        Ok(data)
    }
}

// ============================================================================
// Async helpers
// ============================================================================

/// Timeout wrapper for async tests
///
/// Wraps an async operation with a timeout to prevent tests from hanging.
///
/// # Example
/// ```ignore
/// use common::test_utils::{with_timeout, DEFAULT_TEST_TIMEOUT};
///
/// #[tokio::test]
/// async fn test_with_timeout() {
///     let result = with_timeout(DEFAULT_TEST_TIMEOUT, async { 42 }).await.unwrap();
///     assert_eq!(result, 42);
/// }
/// ```
pub async fn with_timeout<T, F>(duration: Duration, future: F) -> Result<T, TimeoutError>
where
    F: Future<Output = T>,
{
    tokio::time::timeout(duration, future)
        .await
        .map_err(|_| TimeoutError { duration })
}

/// Error returned when a test times out
#[derive(Debug)]
pub struct TimeoutError {
    /// The timeout duration that was exceeded
    pub duration: Duration,
}

impl std::fmt::Display for TimeoutError {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        write!(f, "Test timed out after {:?}", self.duration)
    }
}

impl std::error::Error for TimeoutError {}

#[cfg(test)]
mod tests {
    use super::*;

    async fn handle_for(backend: &MockBackend) -> DeviceHandle {
        let id = backend.granted_ids()[0].clone();
        backend.open(&id).await.unwrap()
    }

    #[test]
    fn test_mock_device_layout() {
        let device = mock_device(0x1234, 0x5678, Some("AB12"), 2);
        assert_eq!(device.id().as_str(), "4660-22136-AB12");

        let iface = &device.configurations[0].interfaces[1];
        assert_eq!(iface.number, 1);
        assert!(!iface.claimed);
        assert_eq!(iface.endpoints.len(), 2);
        assert!(iface.endpoints.iter().all(|e| e.number == 2));
    }

    #[test]
    fn test_create_mock_bulk_data() {
        let data = create_mock_bulk_data(1024);

        assert_eq!(data.len(), 1024);
        assert_eq!(data[0], 0);
        assert_eq!(data[255], 255);
        assert_eq!(data[256], 0); // Wraps around
    }

    #[tokio::test]
    async fn test_candidates_need_grant() {
        let backend = MockBackend::new()
            .with_device(mock_device(1, 1, None, 1))
            .with_candidate(mock_device(2, 2, None, 1));

        assert_eq!(backend.list_devices().await.unwrap().len(), 1);
        assert_eq!(backend.request_candidates().await.unwrap().len(), 2);
        assert_eq!(
            backend.open(&DeviceId::from("2-2")).await,
            Err(UsbError::Access)
        );

        backend.grant(&DeviceId::from("2-2")).await.unwrap();
        assert_eq!(backend.list_devices().await.unwrap().len(), 2);
    }

    #[tokio::test]
    async fn test_claims_reset_on_configuration_change() {
        let mut device = mock_device(1, 1, None, 2);
        device.configurations.push(mock_configuration(2, 1));
        let backend = MockBackend::new().with_device(device);
        let handle = handle_for(&backend).await;

        backend.claim_interface(handle, 0).await.unwrap();
        assert_eq!(backend.describe(handle).await.unwrap().claimed_interfaces(), vec![0]);

        backend.select_configuration(handle, 2).await.unwrap();
        let described = backend.describe(handle).await.unwrap();
        assert_eq!(described.active_configuration, Some(2));
        assert!(described.claimed_interfaces().is_empty());
    }

    #[tokio::test]
    async fn test_transfer_requires_claimed_endpoint() {
        let backend = MockBackend::new().with_device(mock_device(1, 1, None, 1));
        let handle = handle_for(&backend).await;
        let timeout = Duration::from_secs(1);

        let err = backend
            .transfer_out(handle, 1, vec![1], timeout, CancellationToken::new())
            .await
            .unwrap_err();
        assert_eq!(err, UsbError::NotFound);

        backend.claim_interface(handle, 0).await.unwrap();
        backend.queue_in(1, vec![9, 8, 7]);
        backend
            .transfer_out(handle, 1, vec![1], timeout, CancellationToken::new())
            .await
            .unwrap();
        let data = backend
            .transfer_in(handle, 1, 2, timeout, CancellationToken::new())
            .await
            .unwrap();
        assert_eq!(data, vec![9, 8]);
        assert_eq!(backend.writes(), vec![(1, vec![1])]);
    }

    #[tokio::test]
    async fn test_hanging_transfer_ends_on_cancel() {
        let backend = MockBackend::new().with_device(mock_device(1, 1, None, 1));
        let handle = handle_for(&backend).await;
        backend.claim_interface(handle, 0).await.unwrap();
        backend.hang_transfers(true);

        let cancel = CancellationToken::new();
        let trigger = cancel.clone();
        tokio::spawn(async move { trigger.cancel() });

        let result = with_timeout(
            DEFAULT_TEST_TIMEOUT,
            backend.transfer_in(handle, 1, 8, Duration::from_secs(1), cancel),
        )
        .await
        .unwrap();
        assert_eq!(result, Err(UsbError::Cancelled));
    }

    #[tokio::test]
    async fn test_unplugged_device_reports_no_device() {
        let backend = MockBackend::new().with_device(mock_device(1, 1, None, 1));
        let handle = handle_for(&backend).await;

        backend.unplug(&DeviceId::from("1-1"));
        assert_eq!(backend.describe(handle).await, Err(UsbError::NoDevice));
        assert!(backend.list_devices().await.unwrap().is_empty());
        backend.close(handle).await.unwrap();
        assert_eq!(backend.open_handles(), 0);
    }

    #[tokio::test]
    async fn test_injected_failure() {
        let backend = MockBackend::new();
        backend.fail(MockOp::ListDevices, UsbError::Access);
        assert_eq!(backend.list_devices().await, Err(UsbError::Access));

        backend.clear_failure(MockOp::ListDevices);
        assert!(backend.list_devices().await.unwrap().is_empty());
        assert_eq!(backend.calls(), vec![MockCall::ListDevices, MockCall::ListDevices]);
    }

    #[tokio::test]
    async fn test_with_timeout_success() {
        let result = with_timeout(DEFAULT_TEST_TIMEOUT, async { 42 }).await;

        assert!(result.is_ok());
        assert_eq!(result.unwrap(), 42);
    }

    #[tokio::test]
    async fn test_with_timeout_failure() {
        let result = with_timeout(Duration::from_millis(10), async {
            tokio::time::sleep(Duration::from_secs(1)).await;
        })
        .await;

        assert!(result.is_err());
    }
}
