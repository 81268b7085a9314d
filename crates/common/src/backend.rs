//! Platform device access capability
//!
//! The panel never talks to USB directly. Everything it needs from the
//! platform (enumeration, permission grants, open/close, configuration and
//! interface selection, raw transfers) goes through [`DeviceBackend`].
//!
//! The production implementation is [`crate::UsbBridge`], which forwards each
//! call to the libusb worker thread. Tests use
//! [`crate::test_utils::MockBackend`].

use protocol::{DeviceDescription, DeviceHandle, DeviceId, DeviceSummary, UsbError};
use std::future::Future;
use std::time::Duration;
use tokio_util::sync::CancellationToken;

/// Result type returned by backend calls
pub type BackendResult<T> = std::result::Result<T, UsbError>;

/// Device access provided by the platform
pub trait DeviceBackend: Send + Sync + 'static {
    /// Devices the operator has already granted access to
    fn list_devices(&self) -> impl Future<Output = BackendResult<Vec<DeviceSummary>>> + Send;

    /// Every attached device a permission prompt may offer
    fn request_candidates(&self)
    -> impl Future<Output = BackendResult<Vec<DeviceSummary>>> + Send;

    /// Grant access to one of the candidates
    fn grant(&self, id: &DeviceId) -> impl Future<Output = BackendResult<DeviceSummary>> + Send;

    /// Open a permitted device
    fn open(&self, id: &DeviceId) -> impl Future<Output = BackendResult<DeviceHandle>> + Send;

    /// Close an opened device, releasing its interfaces
    fn close(&self, handle: DeviceHandle) -> impl Future<Output = BackendResult<()>> + Send;

    fn select_configuration(
        &self,
        handle: DeviceHandle,
        value: u8,
    ) -> impl Future<Output = BackendResult<()>> + Send;

    fn claim_interface(
        &self,
        handle: DeviceHandle,
        interface: u8,
    ) -> impl Future<Output = BackendResult<()>> + Send;

    fn release_interface(
        &self,
        handle: DeviceHandle,
        interface: u8,
    ) -> impl Future<Output = BackendResult<()>> + Send;

    /// Read the live state of an opened device
    fn describe(
        &self,
        handle: DeviceHandle,
    ) -> impl Future<Output = BackendResult<DeviceDescription>> + Send;

    /// Write `data` to OUT endpoint number `endpoint`
    ///
    /// `timeout` bounds the platform transfer itself. Once `cancel` fires a
    /// transfer that has not started yet must not be started.
    fn transfer_out(
        &self,
        handle: DeviceHandle,
        endpoint: u8,
        data: Vec<u8>,
        timeout: Duration,
        cancel: CancellationToken,
    ) -> impl Future<Output = BackendResult<()>> + Send;

    /// Read up to `length` bytes from IN endpoint number `endpoint`
    fn transfer_in(
        &self,
        handle: DeviceHandle,
        endpoint: u8,
        length: usize,
        timeout: Duration,
        cancel: CancellationToken,
    ) -> impl Future<Output = BackendResult<Vec<u8>>> + Send;
}
