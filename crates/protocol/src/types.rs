//! USB device model types
//!
//! Identifiers, directory entries and the raw device description returned by a
//! live read of an opened device. Snapshot types derived from these live in
//! [`crate::snapshot`].

use serde::{Deserialize, Serialize};
use std::fmt;
use thiserror::Error;

/// Device identifier
///
/// Built from the vendor id, product id and (when present) serial number,
/// joined with `-` using decimal formatting. Identical devices without a
/// serial number share an identifier.
#[derive(Debug, Clone, PartialEq, Eq, PartialOrd, Ord, Hash, Serialize, Deserialize)]
#[serde(transparent)]
pub struct DeviceId(pub String);

impl DeviceId {
    /// Build the identifier for a device
    ///
    /// An empty serial number is treated the same as a missing one.
    ///
    /// # Example
    /// ```
    /// use protocol::DeviceId;
    ///
    /// let id = DeviceId::from_parts(0x1234, 0x5678, Some("AB12"));
    /// assert_eq!(id.as_str(), "4660-22136-AB12");
    /// ```
    pub fn from_parts(vendor_id: u16, product_id: u16, serial_number: Option<&str>) -> Self {
        match serial_number {
            Some(serial) if !serial.is_empty() => {
                Self(format!("{}-{}-{}", vendor_id, product_id, serial))
            }
            _ => Self(format!("{}-{}", vendor_id, product_id)),
        }
    }

    pub fn as_str(&self) -> &str {
        &self.0
    }
}

impl fmt::Display for DeviceId {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.write_str(&self.0)
    }
}

impl From<&str> for DeviceId {
    fn from(value: &str) -> Self {
        Self(value.to_string())
    }
}

impl From<String> for DeviceId {
    fn from(value: String) -> Self {
        Self(value)
    }
}

/// Backend session token for an opened device
///
/// Returned by a successful open and passed to every subsequent call on that
/// device. Only valid until the device is closed.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, Serialize, Deserialize)]
pub struct DeviceHandle(pub u32);

/// Directory entry for a device the panel can see
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct DeviceSummary {
    pub id: DeviceId,
    pub vendor_id: u16,
    pub product_id: u16,
    pub serial_number: Option<String>,
    pub product_name: Option<String>,
    pub manufacturer_name: Option<String>,
}

impl DeviceSummary {
    /// Product name, or a placeholder for devices without one
    pub fn display_name(&self) -> &str {
        self.product_name.as_deref().unwrap_or("Unknown Device")
    }
}

/// Version triple (major.minor.subminor) decoded from a BCD descriptor field
#[derive(Debug, Clone, Copy, Default, PartialEq, Eq, Serialize, Deserialize)]
pub struct Version {
    pub major: u8,
    pub minor: u8,
    pub subminor: u8,
}

impl Version {
    pub const fn new(major: u8, minor: u8, subminor: u8) -> Self {
        Self {
            major,
            minor,
            subminor,
        }
    }
}

impl fmt::Display for Version {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        write!(f, "{}.{}.{}", self.major, self.minor, self.subminor)
    }
}

/// Endpoint direction
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, Serialize, Deserialize)]
#[serde(rename_all = "lowercase")]
pub enum Direction {
    /// Device to host
    In,
    /// Host to device
    Out,
}

/// Endpoint transfer type
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, Serialize, Deserialize)]
#[serde(rename_all = "lowercase")]
pub enum EndpointType {
    Control,
    Isochronous,
    Bulk,
    Interrupt,
}

impl fmt::Display for Direction {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.write_str(match self {
            Direction::In => "in",
            Direction::Out => "out",
        })
    }
}

impl fmt::Display for EndpointType {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.write_str(match self {
            EndpointType::Control => "control",
            EndpointType::Isochronous => "isochronous",
            EndpointType::Bulk => "bulk",
            EndpointType::Interrupt => "interrupt",
        })
    }
}

/// Endpoint of an interface's current alternate setting
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct EndpointDescription {
    /// Endpoint number without the direction bit
    pub number: u8,
    pub direction: Direction,
    pub transfer_type: EndpointType,
    pub packet_size: u16,
}

impl EndpointDescription {
    /// Endpoint address including the direction bit
    pub fn address(&self) -> u8 {
        match self.direction {
            Direction::In => 0x80 | (self.number & 0x0f),
            Direction::Out => self.number & 0x0f,
        }
    }
}

/// Interface within a configuration
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct InterfaceDescription {
    pub number: u8,
    /// Whether this panel currently holds a claim on the interface
    pub claimed: bool,
    pub name: Option<String>,
    pub class: u8,
    pub subclass: u8,
    pub protocol: u8,
    pub endpoints: Vec<EndpointDescription>,
}

/// Configuration of a device
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct ConfigurationDescription {
    pub value: u8,
    pub name: Option<String>,
    pub interfaces: Vec<InterfaceDescription>,
}

/// Live read of an opened device
///
/// Produced by the backend on demand. Snapshots are always rebuilt from a
/// fresh description rather than patched.
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct DeviceDescription {
    pub vendor_id: u16,
    pub product_id: u16,
    pub serial_number: Option<String>,
    pub product_name: Option<String>,
    pub manufacturer_name: Option<String>,
    pub device_class: u8,
    pub device_subclass: u8,
    pub device_protocol: u8,
    pub device_version: Version,
    pub usb_version: Version,
    /// Value of the active configuration, `None` while unconfigured
    pub active_configuration: Option<u8>,
    pub configurations: Vec<ConfigurationDescription>,
}

impl DeviceDescription {
    pub fn id(&self) -> DeviceId {
        DeviceId::from_parts(
            self.vendor_id,
            self.product_id,
            self.serial_number.as_deref(),
        )
    }

    /// The active configuration, if the device is configured
    pub fn active(&self) -> Option<&ConfigurationDescription> {
        let value = self.active_configuration?;
        self.configurations.iter().find(|c| c.value == value)
    }

    /// Interface numbers claimed in the active configuration
    pub fn claimed_interfaces(&self) -> Vec<u8> {
        self.active()
            .map(|config| {
                config
                    .interfaces
                    .iter()
                    .filter(|iface| iface.claimed)
                    .map(|iface| iface.number)
                    .collect()
            })
            .unwrap_or_default()
    }
}

/// USB error types
///
/// Maps to libusb error codes. See rusb::Error for details.
#[derive(Debug, Clone, Serialize, Deserialize, PartialEq, Eq, Error)]
pub enum UsbError {
    /// Transfer timed out
    #[error("Transfer timed out")]
    Timeout,
    /// Endpoint stalled (protocol error)
    #[error("Endpoint stalled")]
    Pipe,
    /// Device was disconnected
    #[error("Device was disconnected")]
    NoDevice,
    /// Device, interface or endpoint not found
    #[error("Device or endpoint not found")]
    NotFound,
    /// Device is busy
    #[error("Device or interface is busy")]
    Busy,
    /// Buffer overflow
    #[error("Buffer overflow")]
    Overflow,
    /// I/O error
    #[error("Input/output error")]
    Io,
    /// Invalid parameter
    #[error("Invalid parameter")]
    InvalidParam,
    /// Access denied (permissions)
    #[error("Access denied")]
    Access,
    /// Handle does not refer to an open device
    #[error("Device is not open")]
    NotOpen,
    /// Transfer was cancelled before it started
    #[error("Transfer cancelled")]
    Cancelled,
    /// Other error with message
    #[error("{message}")]
    Other { message: String },
}
