//! Panel composition root
//!
//! [`Panel`] wires the directory, session and activity log together and is
//! the single entry point for both the TUI and the relay. Every failure is
//! caught here and written to the activity log; callers only see the relay
//! response an operation produced, if any.

use crate::directory::DeviceDirectory;
use crate::error::PanelError;
use crate::log::ActivityLog;
use crate::session::{OpenRequest, Session, SessionStatus, SessionUpdate};
use common::{DeviceBackend, UsbEvent};
use protocol::{DeviceId, DeviceResponse, DeviceSummary, OpenConfig, OutboundMessage};
use std::collections::BTreeMap;
use std::sync::Arc;
use std::time::Duration;
use tokio::sync::{broadcast, watch};
use tracing::debug;

/// Capacity of the outbound notification channel
const NOTIFICATION_CAPACITY: usize = 256;

/// What the presentation layer renders
#[derive(Debug, Clone, Default, PartialEq, Eq)]
pub struct PanelView {
    /// Permitted devices from the latest listing
    pub devices: BTreeMap<DeviceId, DeviceSummary>,
    /// Identifier chosen in the device selection list
    pub selected: Option<DeviceId>,
    pub session: SessionStatus,
}

impl PanelView {
    pub fn is_open(&self) -> bool {
        self.session.device.is_some()
    }
}

struct Inner<B> {
    session: Session<B>,
    directory: DeviceDirectory<B>,
    log: ActivityLog,
    view: watch::Sender<PanelView>,
    notifications: broadcast::Sender<OutboundMessage>,
}

pub struct Panel<B> {
    inner: Arc<Inner<B>>,
}

impl<B> Clone for Panel<B> {
    fn clone(&self) -> Self {
        Self {
            inner: Arc::clone(&self.inner),
        }
    }
}

impl<B: DeviceBackend> Panel<B> {
    pub fn new(backend: Arc<B>, transfer_timeout: Duration) -> Self {
        let (view, _) = watch::channel(PanelView::default());
        let (notifications, _) = broadcast::channel(NOTIFICATION_CAPACITY);
        Self {
            inner: Arc::new(Inner {
                session: Session::new(
                    Arc::clone(&backend),
                    transfer_timeout,
                    notifications.clone(),
                ),
                directory: DeviceDirectory::new(backend),
                log: ActivityLog::new(),
                view,
                notifications,
            }),
        }
    }

    pub fn log(&self) -> &ActivityLog {
        &self.inner.log
    }

    pub fn session(&self) -> &Session<B> {
        &self.inner.session
    }

    /// Current view, with the live session status
    pub fn view(&self) -> PanelView {
        let mut view = self.inner.view.borrow().clone();
        view.session = self.inner.session.status();
        view
    }

    /// Change notifications for the view
    pub fn watch_view(&self) -> watch::Receiver<PanelView> {
        self.inner.view.subscribe()
    }

    /// Outbound relay notifications
    pub fn subscribe(&self) -> broadcast::Receiver<OutboundMessage> {
        self.inner.notifications.subscribe()
    }

    pub fn notify(&self, message: OutboundMessage) {
        debug!("notify: {}", message.event_name());
        // No relay attached is fine
        let _ = self.inner.notifications.send(message);
    }

    fn publish_session(&self) {
        let status = self.inner.session.status();
        self.inner.view.send_modify(|view| view.session = status);
    }

    // ========================================================================
    // Directory
    // ========================================================================

    /// Re-fetch the permitted device listing
    pub async fn refresh_directory(&self) {
        match self.inner.directory.list_devices().await {
            Ok(devices) => {
                self.inner.view.send_modify(|view| view.devices = devices);
            }
            Err(e) => self.log().error(format!("Error listing devices: {}", e)),
        }
    }

    /// Devices the permission prompt offers
    pub async fn request_candidates(&self) -> Vec<DeviceSummary> {
        match self.inner.directory.request_candidates().await {
            Ok(candidates) => candidates,
            Err(e) => {
                self.log()
                    .error(format!("Error connecting to the device: {}", e));
                Vec::new()
            }
        }
    }

    /// Finish the permission prompt
    ///
    /// On success the device is listed and selected.
    pub async fn request_device(&self, selection: Option<&DeviceId>) {
        match self.inner.directory.request_device(selection).await {
            Ok(device) => {
                self.log().info(format!(
                    "Device connected: {} ({})",
                    device.display_name(),
                    device.id
                ));
                self.refresh_directory().await;
                self.select(Some(device.id));
            }
            Err(e) => self
                .log()
                .error(format!("Error connecting to the device: {}", e)),
        }
    }

    /// Change the selected identifier; ignored while a device is open
    pub fn select(&self, id: Option<DeviceId>) {
        if self.inner.session.status().device.is_some() {
            debug!("select ignored while a device is open");
            return;
        }
        self.inner.view.send_modify(|view| view.selected = id);
    }

    // ========================================================================
    // Session
    // ========================================================================

    /// Open `id` with `request`
    pub async fn open(&self, id: &DeviceId, request: OpenRequest) -> bool {
        let result = self.inner.session.open(id, request).await;
        self.publish_session();
        match result {
            Ok(_) => {
                self.log().info(format!("Device opened: {}", id));
                true
            }
            Err(e) => {
                self.log()
                    .error(format!("Error opening the device: {}", e));
                false
            }
        }
    }

    /// Open the selected device without configuring it
    pub async fn open_selected(&self) -> bool {
        let selected = self.inner.view.borrow().selected.clone();
        let Some(id) = selected else {
            self.log().error(format!(
                "Error opening the device: {}",
                PanelError::NoDeviceSelected
            ));
            return false;
        };
        self.open(&id, OpenRequest::default()).await
    }

    /// Relay `open_device`: refresh, select, open and configure
    pub async fn open_device(&self, id: DeviceId, config: OpenConfig) -> bool {
        self.refresh_directory().await;
        self.select(Some(id.clone()));
        let result = self.inner.session.open(&id, config.into()).await;
        self.publish_session();
        match result {
            Ok(_) => {
                self.log().info(format!("Device opened: {}", id));
                true
            }
            Err(e) => {
                self.log().error(format!("Can't open device {}: {}", id, e));
                false
            }
        }
    }

    pub async fn close(&self) {
        match self.inner.session.close().await {
            Ok(update) => {
                if let Some(OutboundMessage::DeviceClosed(id)) = update.notifications.first() {
                    self.log().info(format!("Device closed: {}", id));
                }
            }
            Err(PanelError::CloseFailed { source, .. }) => {
                self.log()
                    .error(format!("Error closing the device: {}", source));
            }
            Err(e) => {
                self.log()
                    .error(format!("Error closing the device: {}", e));
            }
        }
        self.publish_session();
    }

    /// Log and publish the result of a session mutation
    fn finish(&self, what: &str, result: crate::error::Result<SessionUpdate>) {
        self.publish_session();
        if let Err(e) = result {
            self.log().error(format!("Error {}: {}", what, e));
        }
    }

    pub async fn select_configuration(&self, value: u8) {
        let result = self.inner.session.select_configuration(value).await;
        self.finish("selecting configuration", result);
    }

    pub async fn claim_interface(&self, interface: u8) {
        let result = self.inner.session.claim_interface(interface).await;
        self.finish("claiming interface", result);
    }

    pub async fn release_interface(&self, interface: u8) {
        let result = self.inner.session.release_interface(interface).await;
        self.finish("releasing interface", result);
    }

    /// Claim `interface` if it is free in the active configuration, else
    /// release it
    pub async fn toggle_interface(&self, interface: u8) {
        let claimed = self
            .inner
            .session
            .snapshot()
            .and_then(|snapshot| {
                snapshot
                    .active_configuration()
                    .and_then(|config| config.interfaces.iter().find(|i| i.number == interface))
                    .map(|iface| iface.claimed)
            })
            .unwrap_or(false);

        if claimed {
            self.release_interface(interface).await;
        } else {
            self.claim_interface(interface).await;
        }
    }

    /// Rebuild the opened device snapshot
    pub async fn refresh_device(&self) {
        let result = self.inner.session.refresh().await;
        self.finish("refreshing the device", result);
    }

    // ========================================================================
    // Host commands
    // ========================================================================

    pub async fn endpoints(&self) -> DeviceResponse {
        match self.inner.session.endpoints().await {
            Ok(endpoints) => DeviceResponse::Endpoints(endpoints),
            Err(e) => DeviceResponse::Error(e.to_string()),
        }
    }

    pub async fn transfer_out(&self, endpoint: u8, data: Vec<u8>) -> DeviceResponse {
        match self.inner.session.transfer_out(endpoint, data).await {
            Ok(()) => DeviceResponse::Ok,
            Err(e) => {
                self.log().error(format!("Error in transfer_out: {}", e));
                DeviceResponse::Error(e.to_string())
            }
        }
    }

    pub async fn transfer_in(&self, endpoint: u8, length: usize) -> DeviceResponse {
        match self.inner.session.transfer_in(endpoint, length).await {
            Ok(data) => DeviceResponse::Data(data),
            Err(e) => {
                self.log().error(format!("Error in transfer_in: {}", e));
                DeviceResponse::Error(e.to_string())
            }
        }
    }

    // ========================================================================
    // Hotplug
    // ========================================================================

    pub async fn handle_usb_event(&self, event: UsbEvent) {
        match event {
            UsbEvent::DeviceArrived { id } => {
                self.log().info(format!("Device connected: {}", id));
                self.refresh_directory().await;
                self.notify(OutboundMessage::DeviceConnected(id));
            }
            UsbEvent::DeviceLeft { id } => {
                self.log().info(format!("Device disconnected: {}", id));
                self.refresh_directory().await;
                self.notify(OutboundMessage::DeviceDisconnected(id.clone()));

                let update = self.inner.session.handle_disconnect(&id).await;
                if !update.notifications.is_empty() {
                    self.log().info(format!("Device closed: {}", id));
                }
                self.publish_session();
            }
        }
    }

    /// Close the opened device, if any
    pub async fn shutdown(&self) {
        if self.inner.session.status().device.is_some() {
            self.close().await;
        }
    }
}
