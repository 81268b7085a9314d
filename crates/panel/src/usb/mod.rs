//! libusb backend
//!
//! Everything that touches `rusb` lives here and runs on the dedicated USB
//! worker thread. The rest of the panel reaches it through
//! [`common::UsbBridge`], which implements [`common::DeviceBackend`].

pub mod device;
pub mod manager;
pub mod transfers;
pub mod worker;

pub use device::UsbDevice;
pub use manager::DeviceManager;
pub use worker::{UsbWorkerThread, spawn_usb_worker};
