//! USB device wrapper
//!
//! Wraps `rusb::Device` with its cached descriptor and directory entry, and
//! tracks what this panel holds on it while open: the handle, claimed
//! interfaces and interfaces whose kernel driver was detached.

use crate::usb::transfers::{self, map_rusb_error};
use protocol::{
    ConfigurationDescription, DeviceDescription, DeviceId, DeviceSummary, Direction,
    EndpointDescription, EndpointType, InterfaceDescription, UsbError, Version,
};
use rusb::{ConfigDescriptor, Context, Device, DeviceDescriptor, DeviceHandle as RusbHandle};
use std::collections::BTreeSet;
use std::time::Duration;
use tracing::{debug, warn};

/// Linux Foundation vendor id used by root hubs
const ROOT_HUB_VENDOR: u16 = 0x1d6b;
const HUB_CLASS: u8 = 9;

/// Whether a descriptor belongs to a root hub
pub fn is_root_hub(descriptor: &DeviceDescriptor) -> bool {
    descriptor.vendor_id() == ROOT_HUB_VENDOR && descriptor.class_code() == HUB_CLASS
}

pub struct UsbDevice {
    device: Device<Context>,
    descriptor: DeviceDescriptor,
    summary: DeviceSummary,
    handle: Option<RusbHandle<Context>>,
    claimed_interfaces: BTreeSet<u8>,
    detached_drivers: BTreeSet<u8>,
}

impl UsbDevice {
    /// Wrap a device, reading its string descriptors once
    pub fn new(device: Device<Context>) -> Result<Self, rusb::Error> {
        let descriptor = device.device_descriptor()?;

        // Strings need a handle; devices we may not open stay nameless
        let (manufacturer_name, product_name, serial_number) = match device.open() {
            Ok(handle) => read_strings(&descriptor, &handle),
            Err(e) => {
                debug!(
                    "Cannot read strings of bus={} addr={}: {}",
                    device.bus_number(),
                    device.address(),
                    e
                );
                (None, None, None)
            }
        };

        let summary = DeviceSummary {
            id: DeviceId::from_parts(
                descriptor.vendor_id(),
                descriptor.product_id(),
                serial_number.as_deref(),
            ),
            vendor_id: descriptor.vendor_id(),
            product_id: descriptor.product_id(),
            serial_number,
            product_name,
            manufacturer_name,
        };

        Ok(Self {
            device,
            descriptor,
            summary,
            handle: None,
            claimed_interfaces: BTreeSet::new(),
            detached_drivers: BTreeSet::new(),
        })
    }

    pub fn id(&self) -> &DeviceId {
        &self.summary.id
    }

    pub fn summary(&self) -> &DeviceSummary {
        &self.summary
    }

    pub fn is_open(&self) -> bool {
        self.handle.is_some()
    }

    fn handle(&self) -> Result<&RusbHandle<Context>, UsbError> {
        self.handle.as_ref().ok_or(UsbError::NotOpen)
    }

    fn handle_mut(&mut self) -> Result<&mut RusbHandle<Context>, UsbError> {
        self.handle.as_mut().ok_or(UsbError::NotOpen)
    }

    pub fn open(&mut self) -> Result<(), UsbError> {
        if self.handle.is_some() {
            return Err(UsbError::Busy);
        }
        let handle = self.device.open().map_err(|e| {
            warn!("Failed to open device {}: {}", self.summary.id, e);
            map_rusb_error(e)
        })?;
        debug!("Opened device {}", self.summary.id);
        self.handle = Some(handle);
        Ok(())
    }

    /// Release every claim and hand interfaces back to the kernel
    pub fn close(&mut self) {
        self.release_all();
        if self.handle.take().is_some() {
            debug!("Closed device {}", self.summary.id);
        }
    }

    fn release_all(&mut self) {
        let claimed = std::mem::take(&mut self.claimed_interfaces);
        let detached = std::mem::take(&mut self.detached_drivers);
        let Some(handle) = self.handle.as_mut() else {
            return;
        };
        for interface in claimed {
            if let Err(e) = handle.release_interface(interface) {
                warn!("Failed to release interface {}: {}", interface, e);
            }
        }
        for interface in detached {
            if let Err(e) = handle.attach_kernel_driver(interface) {
                debug!("Could not reattach kernel driver to interface {}: {}", interface, e);
            }
        }
    }

    /// Set the active configuration
    ///
    /// Claims do not survive a configuration change and are released first.
    pub fn select_configuration(&mut self, value: u8) -> Result<(), UsbError> {
        self.handle()?;
        self.release_all();
        self.handle_mut()?
            .set_active_configuration(value)
            .map_err(map_rusb_error)?;
        debug!("Device {} configuration set to {}", self.summary.id, value);
        Ok(())
    }

    pub fn claim_interface(&mut self, interface: u8) -> Result<(), UsbError> {
        let handle = self.handle.as_mut().ok_or(UsbError::NotOpen)?;
        let mut detached = false;
        match handle.kernel_driver_active(interface) {
            Ok(true) => {
                debug!("Detaching kernel driver from interface {}", interface);
                handle
                    .detach_kernel_driver(interface)
                    .map_err(map_rusb_error)?;
                detached = true;
            }
            Ok(false) => {}
            Err(e) => debug!(
                "Could not check kernel driver status for interface {}: {}",
                interface, e
            ),
        }

        if let Err(e) = handle.claim_interface(interface) {
            if detached && let Err(e) = handle.attach_kernel_driver(interface) {
                debug!("Could not reattach kernel driver to interface {}: {}", interface, e);
            }
            return Err(map_rusb_error(e));
        }

        if detached {
            self.detached_drivers.insert(interface);
        }
        self.claimed_interfaces.insert(interface);
        debug!("Claimed interface {} on {}", interface, self.summary.id);
        Ok(())
    }

    pub fn release_interface(&mut self, interface: u8) -> Result<(), UsbError> {
        let handle = self.handle.as_mut().ok_or(UsbError::NotOpen)?;
        handle
            .release_interface(interface)
            .map_err(map_rusb_error)?;
        if self.detached_drivers.remove(&interface)
            && let Err(e) = handle.attach_kernel_driver(interface)
        {
            debug!("Could not reattach kernel driver to interface {}: {}", interface, e);
        }
        self.claimed_interfaces.remove(&interface);
        debug!("Released interface {} on {}", interface, self.summary.id);
        Ok(())
    }

    /// Active configuration value, `None` while unconfigured
    fn active_value(&self) -> Result<Option<u8>, UsbError> {
        let value = self
            .handle()?
            .active_configuration()
            .map_err(map_rusb_error)?;
        Ok((value != 0).then_some(value))
    }

    /// Live read of descriptors and claim state
    pub fn describe(&self) -> Result<DeviceDescription, UsbError> {
        let active = self.active_value()?;
        let mut configurations = Vec::new();
        for index in 0..self.descriptor.num_configurations() {
            let config = self
                .device
                .config_descriptor(index)
                .map_err(map_rusb_error)?;
            configurations.push(self.configuration(&config, active, true));
        }

        Ok(DeviceDescription {
            vendor_id: self.summary.vendor_id,
            product_id: self.summary.product_id,
            serial_number: self.summary.serial_number.clone(),
            product_name: self.summary.product_name.clone(),
            manufacturer_name: self.summary.manufacturer_name.clone(),
            device_class: self.descriptor.class_code(),
            device_subclass: self.descriptor.sub_class_code(),
            device_protocol: self.descriptor.protocol_code(),
            device_version: map_version(self.descriptor.device_version()),
            usb_version: map_version(self.descriptor.usb_version()),
            active_configuration: active,
            configurations,
        })
    }

    /// Endpoint `number` in `direction` on a claimed interface
    pub fn endpoint(
        &self,
        number: u8,
        direction: Direction,
    ) -> Result<EndpointDescription, UsbError> {
        let active = self.active_value()?.ok_or(UsbError::NotFound)?;
        let config = self
            .device
            .active_config_descriptor()
            .map_err(map_rusb_error)?;
        let config = self.configuration(&config, Some(active), false);
        find_claimed_endpoint(&config, number, direction)
    }

    /// Convert a configuration descriptor, using the first alternate setting
    /// of each interface
    fn configuration(
        &self,
        config: &ConfigDescriptor,
        active: Option<u8>,
        read_names: bool,
    ) -> ConfigurationDescription {
        let is_active = active == Some(config.number());
        let name = if read_names {
            self.string(config.description_string_index())
        } else {
            None
        };

        let interfaces = config
            .interfaces()
            .filter_map(|interface| {
                let alt = interface.descriptors().next()?;
                Some(InterfaceDescription {
                    number: interface.number(),
                    claimed: is_active && self.claimed_interfaces.contains(&interface.number()),
                    name: if read_names {
                        self.string(alt.description_string_index())
                    } else {
                        None
                    },
                    class: alt.class_code(),
                    subclass: alt.sub_class_code(),
                    protocol: alt.protocol_code(),
                    endpoints: alt
                        .endpoint_descriptors()
                        .map(|ep| EndpointDescription {
                            number: ep.number(),
                            direction: map_direction(ep.direction()),
                            transfer_type: map_transfer_type(ep.transfer_type()),
                            packet_size: ep.max_packet_size(),
                        })
                        .collect(),
                })
            })
            .collect();

        ConfigurationDescription {
            value: config.number(),
            name,
            interfaces,
        }
    }

    fn string(&self, index: Option<u8>) -> Option<String> {
        let handle = self.handle.as_ref()?;
        handle.read_string_descriptor_ascii(index?).ok()
    }

    /// Write to OUT endpoint `number` of a claimed interface
    pub fn transfer_out(&self, number: u8, data: &[u8], timeout: Duration) -> Result<(), UsbError> {
        let endpoint = self.endpoint(number, Direction::Out)?;
        transfers::write(self.handle()?, &endpoint, data, timeout)
    }

    /// Read from IN endpoint `number` of a claimed interface
    pub fn transfer_in(
        &self,
        number: u8,
        length: usize,
        timeout: Duration,
    ) -> Result<Vec<u8>, UsbError> {
        let endpoint = self.endpoint(number, Direction::In)?;
        transfers::read(self.handle()?, &endpoint, length, timeout)
    }
}

impl Drop for UsbDevice {
    fn drop(&mut self) {
        self.close();
    }
}

fn read_strings(
    descriptor: &DeviceDescriptor,
    handle: &RusbHandle<Context>,
) -> (Option<String>, Option<String>, Option<String>) {
    let read = |index: Option<u8>| {
        index.and_then(|idx| handle.read_string_descriptor_ascii(idx).ok())
    };
    (
        read(descriptor.manufacturer_string_index()),
        read(descriptor.product_string_index()),
        read(descriptor.serial_number_string_index()),
    )
}

/// Find endpoint `number` in `direction` among the claimed interfaces of
/// `config`
pub fn find_claimed_endpoint(
    config: &ConfigurationDescription,
    number: u8,
    direction: Direction,
) -> Result<EndpointDescription, UsbError> {
    config
        .interfaces
        .iter()
        .filter(|iface| iface.claimed)
        .flat_map(|iface| iface.endpoints.iter())
        .find(|ep| ep.number == (number & 0x0f) && ep.direction == direction)
        .cloned()
        .ok_or(UsbError::NotFound)
}

fn map_direction(direction: rusb::Direction) -> Direction {
    match direction {
        rusb::Direction::In => Direction::In,
        rusb::Direction::Out => Direction::Out,
    }
}

fn map_transfer_type(transfer_type: rusb::TransferType) -> EndpointType {
    match transfer_type {
        rusb::TransferType::Control => EndpointType::Control,
        rusb::TransferType::Isochronous => EndpointType::Isochronous,
        rusb::TransferType::Bulk => EndpointType::Bulk,
        rusb::TransferType::Interrupt => EndpointType::Interrupt,
    }
}

fn map_version(version: rusb::Version) -> Version {
    Version::new(version.major(), version.minor(), version.sub_minor())
}
