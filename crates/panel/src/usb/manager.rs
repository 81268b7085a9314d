//! USB device manager
//!
//! Registry of attached devices, the set of granted identifiers and open
//! handles. Runs on the USB worker thread.
//!
//! Grants behave like a browser's per-origin USB permission: they are keyed
//! by identifier and survive unplug/replug for the lifetime of the process.

use crate::usb::device::{UsbDevice, is_root_hub};
use common::UsbEvent;
use protocol::{DeviceDescription, DeviceHandle, DeviceId, DeviceSummary, UsbError};
use rusb::{Context, Device, Hotplug, HotplugBuilder, Registration, UsbContext};
use std::collections::{BTreeMap, HashMap, HashSet, VecDeque};
use std::sync::{Arc, Mutex};
use std::time::Duration;
use tracing::{debug, info, warn};

/// Hotplug notice queued by the libusb callback
enum HotplugNotice {
    Arrived(Device<Context>),
    Left { bus: u8, address: u8 },
}

type NoticeQueue = Arc<Mutex<VecDeque<HotplugNotice>>>;

pub struct DeviceManager {
    context: Context,
    /// Attached devices keyed by (bus, address)
    devices: BTreeMap<(u8, u8), UsbDevice>,
    granted: HashSet<DeviceId>,
    /// Open handles; `None` once the device has left the bus
    handles: HashMap<DeviceHandle, Option<(u8, u8)>>,
    next_handle_id: u32,
    notices: NoticeQueue,
    _hotplug_registration: Option<Registration<Context>>,
    event_sender: async_channel::Sender<UsbEvent>,
    /// VID:PID patterns granted at startup
    permitted_filters: Vec<String>,
}

impl DeviceManager {
    pub fn new(
        event_sender: async_channel::Sender<UsbEvent>,
        permitted_filters: Vec<String>,
    ) -> Result<Self, rusb::Error> {
        let context = Context::new()?;

        Ok(Self {
            context,
            devices: BTreeMap::new(),
            granted: HashSet::new(),
            handles: HashMap::new(),
            next_handle_id: 1,
            notices: Arc::new(Mutex::new(VecDeque::new())),
            _hotplug_registration: None,
            event_sender,
            permitted_filters,
        })
    }

    /// Enumerate attached devices and register for hotplug
    pub fn initialize(&mut self) -> Result<(), rusb::Error> {
        for device in self.context.devices()?.iter() {
            self.add_device(device);
        }

        if rusb::has_hotplug() {
            let callback = HotplugCallback {
                notices: Arc::clone(&self.notices),
            };
            let registration = HotplugBuilder::new()
                .enumerate(false)
                .register(&self.context, Box::new(callback))?;
            self._hotplug_registration = Some(registration);
            debug!("Hot-plug callbacks registered");
        } else {
            warn!("libusb has no hotplug support on this platform");
        }

        info!(
            "Device manager initialized with {} devices ({} granted)",
            self.devices.len(),
            self.granted.len()
        );
        Ok(())
    }

    pub fn context(&self) -> &Context {
        &self.context
    }

    fn add_device(&mut self, device: Device<Context>) -> Option<&UsbDevice> {
        let key = (device.bus_number(), device.address());
        if self.devices.contains_key(&key) {
            return self.devices.get(&key);
        }

        match device.device_descriptor() {
            Ok(desc) if is_root_hub(&desc) => {
                debug!("Skipping root hub: bus={}, addr={}", key.0, key.1);
                return None;
            }
            Ok(_) => {}
            Err(e) => {
                warn!("Failed to read descriptor of bus={} addr={}: {}", key.0, key.1, e);
                return None;
            }
        }

        let usb_device = match UsbDevice::new(device) {
            Ok(d) => d,
            Err(e) => {
                warn!("Failed to add device bus={} addr={}: {}", key.0, key.1, e);
                return None;
            }
        };

        let summary = usb_device.summary();
        if check_filter(summary.vendor_id, summary.product_id, &self.permitted_filters) {
            self.granted.insert(summary.id.clone());
        }
        debug!(
            "Added device {}: bus={}, addr={}, vid={:#06x}, pid={:#06x}",
            summary.id, key.0, key.1, summary.vendor_id, summary.product_id
        );

        self.devices.insert(key, usb_device);
        self.devices.get(&key)
    }

    fn remove_device(&mut self, bus: u8, address: u8) -> Option<DeviceId> {
        let key = (bus, address);
        let mut device = self.devices.remove(&key)?;
        device.close();
        for slot in self.handles.values_mut() {
            if *slot == Some(key) {
                *slot = None;
            }
        }
        debug!("Removed device {}: bus={}, addr={}", device.id(), bus, address);
        Some(device.id().clone())
    }

    /// Drain hotplug notices queued during `handle_events`
    pub fn process_hotplug(&mut self) {
        loop {
            let notice = self
                .notices
                .lock()
                .unwrap_or_else(|e| e.into_inner())
                .pop_front();
            let Some(notice) = notice else {
                break;
            };

            match notice {
                HotplugNotice::Arrived(device) => {
                    let id = self.add_device(device).map(|d| d.id().clone());
                    if let Some(id) = id
                        && self.granted.contains(&id)
                    {
                        self.send_event(UsbEvent::DeviceArrived { id });
                    }
                }
                HotplugNotice::Left { bus, address } => {
                    if let Some(id) = self.remove_device(bus, address)
                        && self.granted.contains(&id)
                    {
                        self.send_event(UsbEvent::DeviceLeft { id });
                    }
                }
            }
        }
    }

    fn send_event(&self, event: UsbEvent) {
        if let Err(e) = self.event_sender.try_send(event) {
            warn!("Dropped hotplug event: {}", e);
        }
    }

    /// Attached devices in enumeration order
    fn summaries(&self, granted_only: bool) -> Vec<DeviceSummary> {
        self.devices
            .values()
            .map(UsbDevice::summary)
            .filter(|s| !granted_only || self.granted.contains(&s.id))
            .cloned()
            .collect()
    }

    pub fn list_devices(&self) -> Vec<DeviceSummary> {
        self.summaries(true)
    }

    pub fn request_candidates(&self) -> Vec<DeviceSummary> {
        self.summaries(false)
    }

    /// Key of the attached device with `id`; the last one wins on collision
    fn find(&self, id: &DeviceId) -> Option<(u8, u8)> {
        self.devices
            .iter()
            .rev()
            .find(|(_, device)| device.id() == id)
            .map(|(key, _)| *key)
    }

    pub fn grant(&mut self, id: &DeviceId) -> Result<DeviceSummary, UsbError> {
        let key = self.find(id).ok_or(UsbError::NotFound)?;
        self.granted.insert(id.clone());
        info!("Granted access to {}", id);
        self.devices
            .get(&key)
            .map(|d| d.summary().clone())
            .ok_or(UsbError::NotFound)
    }

    pub fn open(&mut self, id: &DeviceId) -> Result<DeviceHandle, UsbError> {
        let key = self.find(id).ok_or(UsbError::NotFound)?;
        if !self.granted.contains(id) {
            return Err(UsbError::Access);
        }
        let device = self.devices.get_mut(&key).ok_or(UsbError::NotFound)?;
        device.open()?;

        let handle = DeviceHandle(self.next_handle_id);
        self.next_handle_id += 1;
        self.handles.insert(handle, Some(key));
        info!("Opened {} as handle {:?}", id, handle);
        Ok(handle)
    }

    /// Close a handle; closing a handle whose device left succeeds
    pub fn close(&mut self, handle: DeviceHandle) -> Result<(), UsbError> {
        let key = self.handles.remove(&handle).ok_or(UsbError::NotOpen)?;
        if let Some(device) = key.and_then(|key| self.devices.get_mut(&key)) {
            device.close();
            info!("Closed handle {:?} ({})", handle, device.id());
        }
        Ok(())
    }

    fn key(&self, handle: DeviceHandle) -> Result<(u8, u8), UsbError> {
        self.handles
            .get(&handle)
            .ok_or(UsbError::NotOpen)?
            .ok_or(UsbError::NoDevice)
    }

    fn device(&self, handle: DeviceHandle) -> Result<&UsbDevice, UsbError> {
        let key = self.key(handle)?;
        self.devices.get(&key).ok_or(UsbError::NoDevice)
    }

    fn device_mut(&mut self, handle: DeviceHandle) -> Result<&mut UsbDevice, UsbError> {
        let key = self.key(handle)?;
        self.devices.get_mut(&key).ok_or(UsbError::NoDevice)
    }

    pub fn select_configuration(
        &mut self,
        handle: DeviceHandle,
        value: u8,
    ) -> Result<(), UsbError> {
        self.device_mut(handle)?.select_configuration(value)
    }

    pub fn claim_interface(&mut self, handle: DeviceHandle, interface: u8) -> Result<(), UsbError> {
        self.device_mut(handle)?.claim_interface(interface)
    }

    pub fn release_interface(
        &mut self,
        handle: DeviceHandle,
        interface: u8,
    ) -> Result<(), UsbError> {
        self.device_mut(handle)?.release_interface(interface)
    }

    pub fn describe(&self, handle: DeviceHandle) -> Result<DeviceDescription, UsbError> {
        self.device(handle)?.describe()
    }

    pub fn transfer_out(
        &self,
        handle: DeviceHandle,
        endpoint: u8,
        data: &[u8],
        timeout: Duration,
    ) -> Result<(), UsbError> {
        self.device(handle)?.transfer_out(endpoint, data, timeout)
    }

    pub fn transfer_in(
        &self,
        handle: DeviceHandle,
        endpoint: u8,
        length: usize,
        timeout: Duration,
    ) -> Result<Vec<u8>, UsbError> {
        self.device(handle)?.transfer_in(endpoint, length, timeout)
    }
}

/// Check if a VID/PID pair matches any `0xVID:0xPID` filter
///
/// Either side may be `*`. An empty filter list matches nothing.
pub fn check_filter(vid: u16, pid: u16, filters: &[String]) -> bool {
    let matches = |pattern: &str, value: u16| {
        if pattern == "*" {
            return true;
        }
        let hex = pattern
            .strip_prefix("0x")
            .or_else(|| pattern.strip_prefix("0X"))
            .unwrap_or(pattern);
        u16::from_str_radix(hex, 16).is_ok_and(|v| v == value)
    };

    filters.iter().any(|filter| match filter.split_once(':') {
        Some((filter_vid, filter_pid)) => matches(filter_vid, vid) && matches(filter_pid, pid),
        None => false,
    })
}

/// Queues hotplug notices for the worker loop
///
/// The callback runs inside `handle_events`, where the manager cannot be
/// borrowed, so it only records what happened.
struct HotplugCallback {
    notices: NoticeQueue,
}

impl HotplugCallback {
    fn push(&self, notice: HotplugNotice) {
        self.notices
            .lock()
            .unwrap_or_else(|e| e.into_inner())
            .push_back(notice);
    }
}

impl Hotplug<Context> for HotplugCallback {
    fn device_arrived(&mut self, device: Device<Context>) {
        debug!(
            "Hot-plug callback: device arrived (bus={}, addr={})",
            device.bus_number(),
            device.address()
        );
        self.push(HotplugNotice::Arrived(device));
    }

    fn device_left(&mut self, device: Device<Context>) {
        debug!(
            "Hot-plug callback: device left (bus={}, addr={})",
            device.bus_number(),
            device.address()
        );
        self.push(HotplugNotice::Left {
            bus: device.bus_number(),
            address: device.address(),
        });
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_filter_logic() {
        let filters = vec!["0x1234:0x5678".to_string(), "0xABCD:*".to_string()];

        assert!(check_filter(0x1234, 0x5678, &filters));
        assert!(check_filter(0xABCD, 0x1111, &filters));
        assert!(check_filter(0xABCD, 0x9999, &filters));

        assert!(!check_filter(0x1234, 0x9999, &filters));
        assert!(!check_filter(0x9999, 0x5678, &filters));
        assert!(!check_filter(0x0000, 0x0000, &filters));
    }

    #[test]
    fn test_empty_filters_grant_nothing() {
        assert!(!check_filter(0x1234, 0x5678, &[]));
    }

    #[test]
    fn test_wildcard_vendor() {
        let filters = vec!["*:*".to_string()];
        assert!(check_filter(0x0001, 0x0002, &filters));
        assert!(!check_filter(0x0001, 0x0002, &["garbage".to_string()]));
    }

    #[test]
    fn test_manager_creation() {
        let (tx, _rx) = async_channel::bounded(1);
        // No libusb context without USB access; only check when available
        if let Ok(manager) = DeviceManager::new(tx, vec![]) {
            assert!(manager.list_devices().is_empty());
            assert_eq!(manager.next_handle_id, 1);
        }
    }
}
