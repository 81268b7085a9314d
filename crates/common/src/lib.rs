//! Common utilities for usb-panel
//!
//! This crate provides shared functionality between the panel and its USB
//! backends, including the backend capability trait, error handling, logging
//! setup, and the async channel bridge for USB thread communication.

pub mod backend;
pub mod channel;
pub mod error;
pub mod logging;
pub mod test_utils;

pub use backend::DeviceBackend;
pub use channel::{UsbBridge, UsbCommand, UsbEvent, UsbWorker, create_usb_bridge};
pub use error::{Error, Result};
pub use logging::setup_logging;
