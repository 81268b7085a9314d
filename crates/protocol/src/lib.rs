//! Protocol library for usb-panel
//!
//! This crate defines the device model shared by the panel and its backends,
//! and the message protocol spoken with the embedding host process. Messages
//! are JSON envelopes, one per line.
//!
//! # Example
//!
//! ```
//! use protocol::{DeviceId, InboundCommand, decode_command, encode_line};
//!
//! // Host side: encode a command
//! let cmd = InboundCommand::TransferIn { endpoint: 1, length: 64 };
//! let line = encode_line(&cmd.to_envelope()).unwrap();
//!
//! // Panel side: decode it
//! let decoded = decode_command(&line).unwrap();
//! assert_eq!(decoded, cmd);
//!
//! // Identifiers use decimal vendor/product ids
//! assert_eq!(DeviceId::from_parts(0x1234, 0x5678, None).as_str(), "4660-22136");
//! ```

pub mod codec;
pub mod error;
pub mod messages;
pub mod snapshot;
pub mod types;

pub use codec::{
    MAX_LINE_SIZE, MAX_TRANSFER_SIZE, decode_command, decode_envelope, encode_line, read_line,
    write_line,
};

#[cfg(feature = "async")]
pub use codec::{read_line_async, write_line_async};
pub use error::{ProtocolError, Result};
pub use messages::{
    DeviceResponse, DeviceUpdate, Envelope, InboundCommand, OpenConfig, OutboundMessage,
};
pub use snapshot::{
    ConfigurationView, EndpointView, InterfaceView, OpenedDeviceSnapshot, claimed_endpoints,
};
pub use types::{
    ConfigurationDescription, DeviceDescription, DeviceHandle, DeviceId, DeviceSummary,
    Direction, EndpointDescription, EndpointType, InterfaceDescription, UsbError, Version,
};
