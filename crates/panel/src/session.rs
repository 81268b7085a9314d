//! Session controller
//!
//! Owns the single opened-device slot. Every operation that reads or changes
//! the slot holds the session lock for its whole duration, so an operator
//! action and a relay command never interleave on the same device.
//!
//! State machine:
//!
//! ```text
//! Closed ──open──▶ Opening ──ok──▶ Open ──close / disconnect──▶ Closed
//!                     │
//!                     └──any step fails──▶ Closed
//! ```
//!
//! Each successful mutation rebuilds the [`OpenedDeviceSnapshot`] from a fresh
//! [`DeviceDescription`] and yields the matching `device_update` notification
//! from the same read (see [`build_update`]). Notifications are broadcast
//! before the lock is released, so subscribers see them in session order.

use crate::directory::DeviceDirectory;
use crate::error::{PanelError, Result};
use crate::gateway::TransferGateway;
use common::DeviceBackend;
use common::backend::BackendResult;
use protocol::{
    DeviceDescription, DeviceHandle, DeviceId, DeviceUpdate, EndpointView, OpenConfig,
    OpenedDeviceSnapshot, OutboundMessage,
};
use std::sync::Arc;
use std::time::Duration;
use tokio::sync::{Mutex, MutexGuard, broadcast, watch};
use tracing::{debug, warn};

#[derive(Debug, Clone, Copy, Default, PartialEq, Eq)]
pub enum SessionState {
    #[default]
    Closed,
    /// Open and configure in progress
    Opening,
    Open,
}

/// Configuration applied while opening a device
#[derive(Debug, Clone, Default, PartialEq, Eq)]
pub struct OpenRequest {
    pub selected_configuration: Option<u8>,
    /// Claimed in order; all must succeed
    pub claimed_interfaces: Vec<u8>,
}

impl From<OpenConfig> for OpenRequest {
    fn from(config: OpenConfig) -> Self {
        Self {
            selected_configuration: config.selected_configuration,
            claimed_interfaces: config.claimed_interfaces,
        }
    }
}

/// Reference to the opened device
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct OpenedDevice {
    pub id: DeviceId,
    pub handle: DeviceHandle,
}

/// Result of a session transition
///
/// `snapshot` is the new snapshot when one was rebuilt. `notifications` are
/// the relay messages the transition produced.
#[derive(Debug, Clone, Default, PartialEq, Eq)]
pub struct SessionUpdate {
    pub snapshot: Option<OpenedDeviceSnapshot>,
    pub notifications: Vec<OutboundMessage>,
}

impl SessionUpdate {
    pub fn closed(id: DeviceId) -> Self {
        Self {
            snapshot: None,
            notifications: vec![OutboundMessage::DeviceClosed(id)],
        }
    }
}

/// Build the snapshot and the `device_update` notification from one read
pub fn build_update(id: &DeviceId, device: &DeviceDescription) -> SessionUpdate {
    let update = DeviceUpdate {
        id: id.clone(),
        selected_configuration: device.active_configuration,
        claimed_interfaces: device.claimed_interfaces(),
    };
    SessionUpdate {
        snapshot: Some(OpenedDeviceSnapshot::from_description(device)),
        notifications: vec![OutboundMessage::DeviceUpdate(update)],
    }
}

/// Published session state
#[derive(Debug, Clone, Default, PartialEq, Eq)]
pub struct SessionStatus {
    pub state: SessionState,
    /// Device being opened or held open
    pub device: Option<DeviceId>,
    pub snapshot: Option<OpenedDeviceSnapshot>,
}

#[derive(Default)]
struct Slot {
    device: Option<OpenedDevice>,
    snapshot: Option<OpenedDeviceSnapshot>,
}

impl Slot {
    fn opened(&self) -> Result<OpenedDevice> {
        self.device.clone().ok_or(PanelError::NoOpenedDevice)
    }

    fn status(&self) -> SessionStatus {
        match &self.device {
            Some(opened) => SessionStatus {
                state: SessionState::Open,
                device: Some(opened.id.clone()),
                snapshot: self.snapshot.clone(),
            },
            None => SessionStatus::default(),
        }
    }
}

pub struct Session<B> {
    backend: Arc<B>,
    directory: DeviceDirectory<B>,
    gateway: TransferGateway<B>,
    slot: Mutex<Slot>,
    status: watch::Sender<SessionStatus>,
    notifications: broadcast::Sender<OutboundMessage>,
    transfer_timeout: Duration,
}

impl<B: DeviceBackend> Session<B> {
    pub fn new(
        backend: Arc<B>,
        transfer_timeout: Duration,
        notifications: broadcast::Sender<OutboundMessage>,
    ) -> Self {
        let (status, _) = watch::channel(SessionStatus::default());
        Self {
            directory: DeviceDirectory::new(Arc::clone(&backend)),
            gateway: TransferGateway::new(Arc::clone(&backend)),
            backend,
            slot: Mutex::new(Slot::default()),
            status,
            notifications,
            transfer_timeout,
        }
    }

    pub fn status(&self) -> SessionStatus {
        self.status.borrow().clone()
    }

    pub fn subscribe(&self) -> watch::Receiver<SessionStatus> {
        self.status.subscribe()
    }

    pub fn state(&self) -> SessionState {
        self.status.borrow().state
    }

    /// Current snapshot, `None` unless Open
    pub fn snapshot(&self) -> Option<OpenedDeviceSnapshot> {
        self.status.borrow().snapshot.clone()
    }

    pub async fn opened(&self) -> Option<OpenedDevice> {
        self.slot.lock().await.device.clone()
    }

    fn publish(&self, slot: &Slot) {
        self.status.send_replace(slot.status());
    }

    /// Broadcast the notifications of `update`; callers hold the slot lock
    fn emit(&self, update: &SessionUpdate) {
        for message in &update.notifications {
            debug!("notify: {}", message.event_name());
            // No relay attached is fine
            let _ = self.notifications.send(message.clone());
        }
    }

    /// Open `id` and apply `request`
    ///
    /// A failure at any step closes the handle and leaves the session Closed.
    pub async fn open(&self, id: &DeviceId, request: OpenRequest) -> Result<SessionUpdate> {
        let mut slot = self.slot.lock().await;
        if let Some(opened) = &slot.device {
            return Err(PanelError::AlreadyOpen(opened.id.clone()));
        }

        self.status.send_replace(SessionStatus {
            state: SessionState::Opening,
            device: Some(id.clone()),
            snapshot: None,
        });

        let result = self.open_and_configure(id, &request).await;
        if let Ok((handle, update)) = &result {
            slot.device = Some(OpenedDevice {
                id: id.clone(),
                handle: *handle,
            });
            slot.snapshot = update.snapshot.clone();
        }
        self.publish(&slot);
        if let Ok((_, update)) = &result {
            self.emit(update);
        }
        result.map(|(_, update)| update)
    }

    async fn open_and_configure(
        &self,
        id: &DeviceId,
        request: &OpenRequest,
    ) -> Result<(DeviceHandle, SessionUpdate)> {
        if self.directory.resolve_by_id(id).await?.is_none() {
            return Err(PanelError::DeviceNotFound(id.clone()));
        }

        let handle = self.backend.open(id).await?;
        match self.configure(handle, request).await {
            Ok(device) => Ok((handle, build_update(id, &device))),
            Err(err) => {
                if let Err(close_err) = self.backend.close(handle).await {
                    warn!("Failed to close {} after open failure: {}", id, close_err);
                }
                Err(err.into())
            }
        }
    }

    async fn configure(
        &self,
        handle: DeviceHandle,
        request: &OpenRequest,
    ) -> BackendResult<DeviceDescription> {
        if let Some(value) = request.selected_configuration {
            self.backend.select_configuration(handle, value).await?;
        }
        for &interface in &request.claimed_interfaces {
            self.backend.claim_interface(handle, interface).await?;
        }
        self.backend.describe(handle).await
    }

    /// Close the opened device
    ///
    /// Returns an empty update when nothing is open. The slot is cleared and
    /// `device_closed` is sent even when the platform close fails.
    pub async fn close(&self) -> Result<SessionUpdate> {
        let mut slot = self.slot.lock().await;
        let Some(opened) = slot.device.take() else {
            debug!("close: no device open");
            return Ok(SessionUpdate::default());
        };
        slot.snapshot = None;

        let result = self.backend.close(opened.handle).await;
        self.publish(&slot);
        let update = SessionUpdate::closed(opened.id.clone());
        self.emit(&update);
        match result {
            Ok(()) => Ok(update),
            Err(source) => Err(PanelError::CloseFailed {
                id: opened.id,
                source,
            }),
        }
    }

    /// Force the session Closed if `id` is the opened device
    pub async fn handle_disconnect(&self, id: &DeviceId) -> SessionUpdate {
        let mut slot = self.slot.lock().await;
        let Some(opened) = slot.device.take_if(|opened| &opened.id == id) else {
            return SessionUpdate::default();
        };
        slot.snapshot = None;

        if let Err(err) = self.backend.close(opened.handle).await {
            debug!("Close after disconnect of {}: {}", id, err);
        }
        self.publish(&slot);
        let update = SessionUpdate::closed(opened.id);
        self.emit(&update);
        update
    }

    pub async fn select_configuration(&self, value: u8) -> Result<SessionUpdate> {
        let mut slot = self.slot.lock().await;
        let opened = slot.opened()?;
        self.backend
            .select_configuration(opened.handle, value)
            .await?;
        self.recompute(&mut slot, &opened).await
    }

    pub async fn claim_interface(&self, interface: u8) -> Result<SessionUpdate> {
        let mut slot = self.slot.lock().await;
        let opened = slot.opened()?;
        self.backend
            .claim_interface(opened.handle, interface)
            .await?;
        self.recompute(&mut slot, &opened).await
    }

    pub async fn release_interface(&self, interface: u8) -> Result<SessionUpdate> {
        let mut slot = self.slot.lock().await;
        let opened = slot.opened()?;
        self.backend
            .release_interface(opened.handle, interface)
            .await?;
        self.recompute(&mut slot, &opened).await
    }

    /// Rebuild the snapshot from a live read of the opened device
    pub async fn refresh(&self) -> Result<SessionUpdate> {
        let mut slot = self.slot.lock().await;
        let opened = slot.opened()?;
        self.recompute(&mut slot, &opened).await
    }

    async fn recompute(
        &self,
        slot: &mut MutexGuard<'_, Slot>,
        opened: &OpenedDevice,
    ) -> Result<SessionUpdate> {
        let device = self.backend.describe(opened.handle).await?;
        let update = build_update(&opened.id, &device);
        slot.snapshot = update.snapshot.clone();
        self.publish(slot);
        self.emit(&update);
        Ok(update)
    }

    /// Endpoints of the claimed interfaces in the active configuration
    pub async fn endpoints(&self) -> Result<Vec<EndpointView>> {
        let slot = self.slot.lock().await;
        slot.opened()?;
        Ok(slot
            .snapshot
            .as_ref()
            .map(|snapshot| snapshot.available_endpoints.clone())
            .unwrap_or_default())
    }

    pub async fn transfer_out(&self, endpoint: u8, data: Vec<u8>) -> Result<()> {
        let slot = self.slot.lock().await;
        let opened = slot.opened()?;
        self.gateway
            .transfer_out(opened.handle, endpoint, data, self.transfer_timeout)
            .await
    }

    pub async fn transfer_in(&self, endpoint: u8, length: usize) -> Result<Vec<u8>> {
        let slot = self.slot.lock().await;
        let opened = slot.opened()?;
        self.gateway
            .transfer_in(opened.handle, endpoint, length, self.transfer_timeout)
            .await
    }
}
