//! usb-panel
//!
//! Operator panel for USB devices: discover and grant devices, open one at a
//! time, pick its configuration and interfaces, and move raw bulk/interrupt
//! data. Device state and transfer results are relayed to a host process as
//! newline-delimited JSON.
//!
//! [`Panel`] is the entry point. It is generic over the platform
//! [`common::DeviceBackend`]; the binary runs it on [`common::UsbBridge`]
//! backed by the libusb worker in [`usb`].

pub mod config;
pub mod directory;
pub mod error;
pub mod gateway;
pub mod log;
pub mod panel;
pub mod relay;
pub mod session;
pub mod tui;
pub mod usb;

pub use config::PanelConfig;
pub use directory::DeviceDirectory;
pub use error::{PanelError, Result};
pub use gateway::{DEFAULT_TRANSFER_TIMEOUT, TransferGateway};
pub use log::{ActivityLog, LogEntry, LogKind};
pub use panel::{Panel, PanelView};
pub use relay::RelayTransport;
pub use session::{
    OpenRequest, OpenedDevice, Session, SessionState, SessionStatus, SessionUpdate, build_update,
};
