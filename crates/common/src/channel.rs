//! Async channel bridge between Tokio runtime and USB thread

use crate::backend::{BackendResult, DeviceBackend};
use async_channel::{Receiver, Sender, bounded};
use protocol::{DeviceDescription, DeviceHandle, DeviceId, DeviceSummary, UsbError};
use std::time::Duration;
use tokio::sync::oneshot;
use tokio_util::sync::CancellationToken;

/// Reply channel carried by every request command
pub type Reply<T> = oneshot::Sender<BackendResult<T>>;

/// Commands from Tokio runtime to USB thread
#[derive(Debug)]
pub enum UsbCommand {
    /// List devices the operator has granted access to
    ListDevices { response: Reply<Vec<DeviceSummary>> },

    /// List every attached device that could be granted
    RequestCandidates { response: Reply<Vec<DeviceSummary>> },

    /// Grant access to a candidate device
    Grant {
        id: DeviceId,
        response: Reply<DeviceSummary>,
    },

    /// Open a granted device
    Open {
        id: DeviceId,
        response: Reply<DeviceHandle>,
    },

    /// Close an opened device
    Close {
        handle: DeviceHandle,
        response: Reply<()>,
    },

    SelectConfiguration {
        handle: DeviceHandle,
        value: u8,
        response: Reply<()>,
    },

    ClaimInterface {
        handle: DeviceHandle,
        interface: u8,
        response: Reply<()>,
    },

    ReleaseInterface {
        handle: DeviceHandle,
        interface: u8,
        response: Reply<()>,
    },

    /// Read descriptors and claim state of an opened device
    Describe {
        handle: DeviceHandle,
        response: Reply<DeviceDescription>,
    },

    /// Write to an OUT endpoint
    TransferOut {
        handle: DeviceHandle,
        endpoint: u8,
        data: Vec<u8>,
        timeout: Duration,
        /// Skipped by the worker if already cancelled when dequeued
        cancel: CancellationToken,
        response: Reply<()>,
    },

    /// Read from an IN endpoint
    TransferIn {
        handle: DeviceHandle,
        endpoint: u8,
        length: usize,
        timeout: Duration,
        cancel: CancellationToken,
        response: Reply<Vec<u8>>,
    },

    /// Shutdown the USB thread gracefully
    Shutdown,
}

/// USB events from the device manager
#[derive(Debug, Clone, PartialEq, Eq)]
pub enum UsbEvent {
    /// Granted device hot-plugged (connected)
    DeviceArrived { id: DeviceId },

    /// Granted device removed
    DeviceLeft { id: DeviceId },
}

/// Handle for Tokio runtime (async)
#[derive(Clone)]
pub struct UsbBridge {
    cmd_tx: Sender<UsbCommand>,
    event_rx: Receiver<UsbEvent>,
}

impl UsbBridge {
    /// Send a command to the USB thread
    pub async fn send_command(&self, cmd: UsbCommand) -> crate::Result<()> {
        self.cmd_tx
            .send(cmd)
            .await
            .map_err(|e| crate::Error::Channel(e.to_string()))
    }

    /// Receive an event from the USB thread
    pub async fn recv_event(&self) -> crate::Result<UsbEvent> {
        self.event_rx
            .recv()
            .await
            .map_err(|e| crate::Error::Channel(e.to_string()))
    }

    /// Ask the USB thread to exit
    pub async fn shutdown(&self) -> crate::Result<()> {
        self.send_command(UsbCommand::Shutdown).await
    }

    /// Send a command built around a fresh reply channel and wait for the answer
    async fn request<T>(
        &self,
        build: impl FnOnce(Reply<T>) -> UsbCommand + Send,
    ) -> BackendResult<T> {
        let (tx, rx) = oneshot::channel();
        self.send_command(build(tx))
            .await
            .map_err(|e| UsbError::Other {
                message: format!("USB worker unavailable: {}", e),
            })?;
        rx.await.map_err(|_| UsbError::Other {
            message: "USB worker dropped the request".to_string(),
        })?
    }
}

impl DeviceBackend for UsbBridge {
    async fn list_devices(&self) -> BackendResult<Vec<DeviceSummary>> {
        self.request(|response| UsbCommand::ListDevices { response })
            .await
    }

    async fn request_candidates(&self) -> BackendResult<Vec<DeviceSummary>> {
        self.request(|response| UsbCommand::RequestCandidates { response })
            .await
    }

    async fn grant(&self, id: &DeviceId) -> BackendResult<DeviceSummary> {
        let id = id.clone();
        self.request(|response| UsbCommand::Grant { id, response })
            .await
    }

    async fn open(&self, id: &DeviceId) -> BackendResult<DeviceHandle> {
        let id = id.clone();
        self.request(|response| UsbCommand::Open { id, response })
            .await
    }

    async fn close(&self, handle: DeviceHandle) -> BackendResult<()> {
        self.request(|response| UsbCommand::Close { handle, response })
            .await
    }

    async fn select_configuration(&self, handle: DeviceHandle, value: u8) -> BackendResult<()> {
        self.request(|response| UsbCommand::SelectConfiguration {
            handle,
            value,
            response,
        })
        .await
    }

    async fn claim_interface(&self, handle: DeviceHandle, interface: u8) -> BackendResult<()> {
        self.request(|response| UsbCommand::ClaimInterface {
            handle,
            interface,
            response,
        })
        .await
    }

    async fn release_interface(&self, handle: DeviceHandle, interface: u8) -> BackendResult<()> {
        self.request(|response| UsbCommand::ReleaseInterface {
            handle,
            interface,
            response,
        })
        .await
    }

    async fn describe(&self, handle: DeviceHandle) -> BackendResult<DeviceDescription> {
        self.request(|response| UsbCommand::Describe { handle, response })
            .await
    }

    async fn transfer_out(
        &self,
        handle: DeviceHandle,
        endpoint: u8,
        data: Vec<u8>,
        timeout: Duration,
        cancel: CancellationToken,
    ) -> BackendResult<()> {
        self.request(|response| UsbCommand::TransferOut {
            handle,
            endpoint,
            data,
            timeout,
            cancel,
            response,
        })
        .await
    }

    async fn transfer_in(
        &self,
        handle: DeviceHandle,
        endpoint: u8,
        length: usize,
        timeout: Duration,
        cancel: CancellationToken,
    ) -> BackendResult<Vec<u8>> {
        self.request(|response| UsbCommand::TransferIn {
            handle,
            endpoint,
            length,
            timeout,
            cancel,
            response,
        })
        .await
    }
}

/// Handle for USB thread (blocking)
pub struct UsbWorker {
    pub(crate) cmd_rx: Receiver<UsbCommand>,
    /// Event sender (public for USB worker thread to access)
    pub event_tx: Sender<UsbEvent>,
}

impl UsbWorker {
    /// Receive a command from Tokio runtime (blocking)
    pub fn recv_command(&self) -> crate::Result<UsbCommand> {
        self.cmd_rx
            .recv_blocking()
            .map_err(|e| crate::Error::Channel(e.to_string()))
    }

    /// Try to receive a command without blocking
    pub fn try_recv_command(&self) -> Option<UsbCommand> {
        self.cmd_rx.try_recv().ok()
    }

    /// Whether every bridge handle has been dropped
    pub fn is_closed(&self) -> bool {
        self.cmd_rx.is_closed()
    }

    /// Send an event to Tokio runtime (blocking)
    pub fn send_event(&self, event: UsbEvent) -> crate::Result<()> {
        self.event_tx
            .send_blocking(event)
            .map_err(|e| crate::Error::Channel(e.to_string()))
    }
}

/// Create the channel bridge between Tokio and USB thread
///
/// Returns (UsbBridge for Tokio, UsbWorker for USB thread)
pub fn create_usb_bridge() -> (UsbBridge, UsbWorker) {
    let (cmd_tx, cmd_rx) = bounded(256);
    let (event_tx, event_rx) = bounded(256);

    (
        UsbBridge { cmd_tx, event_rx },
        UsbWorker { cmd_rx, event_tx },
    )
}
