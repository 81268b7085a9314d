//! Panel error types

use protocol::{DeviceId, UsbError};
use thiserror::Error;

/// Failures surfaced by panel operations
///
/// Display strings are what the host sees in `["error", message]` responses.
#[derive(Debug, Clone, PartialEq, Eq, Error)]
pub enum PanelError {
    /// The permission prompt was dismissed without a choice
    #[error("No device selected")]
    NoDeviceSelected,

    #[error("Device not found: {0}")]
    DeviceNotFound(DeviceId),

    #[error("No opened device")]
    NoOpenedDevice,

    #[error("Device {0} is already open")]
    AlreadyOpen(DeviceId),

    #[error("Operation timed out after {seconds} seconds")]
    Timeout { seconds: u64 },

    #[error("Transfer length {length} exceeds the maximum of {max} bytes")]
    TransferTooLarge { length: usize, max: usize },

    /// Platform close failed; the session slot was cleared anyway
    #[error("Failed to close device {id}: {source}")]
    CloseFailed {
        id: DeviceId,
        #[source]
        source: UsbError,
    },

    #[error(transparent)]
    Usb(#[from] UsbError),
}

pub type Result<T> = std::result::Result<T, PanelError>;
