//! Opened device snapshot
//!
//! A read-model of the currently opened device, rebuilt in full from a
//! [`DeviceDescription`] every time any facet of the device changes.

use crate::types::{ConfigurationDescription, DeviceDescription, Direction, EndpointType};
use serde::{Deserialize, Serialize};

/// Interface row of a configuration
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct InterfaceView {
    pub number: u8,
    pub claimed: bool,
    pub name: Option<String>,
    pub class: u8,
    pub subclass: u8,
    pub protocol: u8,
}

/// Configuration tab of the snapshot
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct ConfigurationView {
    pub name: Option<String>,
    pub value: u8,
    pub active: bool,
    pub interfaces: Vec<InterfaceView>,
}

impl ConfigurationView {
    /// Tab label, falling back to the configuration value
    pub fn label(&self) -> String {
        match &self.name {
            Some(name) if !name.is_empty() => name.clone(),
            _ => format!("Config {}", self.value),
        }
    }
}

/// Endpoint reachable through a claimed interface
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "camelCase")]
pub struct EndpointView {
    pub interface: u8,
    pub endpoint: u8,
    pub direction: Direction,
    #[serde(rename = "type")]
    pub transfer_type: EndpointType,
    pub packet_size: u16,
}

/// Snapshot of the opened device
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "camelCase")]
pub struct OpenedDeviceSnapshot {
    pub product_name: Option<String>,
    pub manufacturer_name: Option<String>,
    pub serial_number: Option<String>,
    pub vendor_id: u16,
    pub product_id: u16,
    pub base_class: u8,
    pub sub_class: u8,
    pub protocol: u8,
    pub version: String,
    pub usb_version: String,
    pub configurations: Vec<ConfigurationView>,
    pub available_endpoints: Vec<EndpointView>,
}

impl OpenedDeviceSnapshot {
    pub fn from_description(device: &DeviceDescription) -> Self {
        let configurations = device
            .configurations
            .iter()
            .map(|config| ConfigurationView {
                name: config.name.clone(),
                value: config.value,
                active: device.active_configuration == Some(config.value),
                interfaces: config
                    .interfaces
                    .iter()
                    .map(|iface| InterfaceView {
                        number: iface.number,
                        claimed: iface.claimed,
                        name: iface.name.clone(),
                        class: iface.class,
                        subclass: iface.subclass,
                        protocol: iface.protocol,
                    })
                    .collect(),
            })
            .collect();

        Self {
            product_name: device.product_name.clone(),
            manufacturer_name: device.manufacturer_name.clone(),
            serial_number: device.serial_number.clone(),
            vendor_id: device.vendor_id,
            product_id: device.product_id,
            base_class: device.device_class,
            sub_class: device.device_subclass,
            protocol: device.device_protocol,
            version: device.device_version.to_string(),
            usb_version: device.usb_version.to_string(),
            configurations,
            available_endpoints: claimed_endpoints(device.active()),
        }
    }

    /// The active configuration tab, if any
    pub fn active_configuration(&self) -> Option<&ConfigurationView> {
        self.configurations.iter().find(|c| c.active)
    }

    /// `0xVVVV:0xPPPP`
    pub fn vid_pid(&self) -> String {
        format!("0x{:04X}:0x{:04X}", self.vendor_id, self.product_id)
    }

    /// Device class code as `class.subclass.protocol`
    pub fn class_code(&self) -> String {
        format!("{}.{}.{}", self.base_class, self.sub_class, self.protocol)
    }
}

/// Endpoints of every claimed interface in `config`
///
/// Returns an empty list for an unconfigured device.
pub fn claimed_endpoints(config: Option<&ConfigurationDescription>) -> Vec<EndpointView> {
    let Some(config) = config else {
        return Vec::new();
    };

    config
        .interfaces
        .iter()
        .filter(|iface| iface.claimed)
        .flat_map(|iface| {
            iface.endpoints.iter().map(move |ep| EndpointView {
                interface: iface.number,
                endpoint: ep.number,
                direction: ep.direction,
                transfer_type: ep.transfer_type,
                packet_size: ep.packet_size,
            })
        })
        .collect()
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::types::{EndpointDescription, InterfaceDescription, Version};

    fn iface(number: u8, claimed: bool) -> InterfaceDescription {
        InterfaceDescription {
            number,
            claimed,
            name: None,
            class: 0xff,
            subclass: 0,
            protocol: 0,
            endpoints: vec![
                EndpointDescription {
                    number: number + 1,
                    direction: Direction::In,
                    transfer_type: EndpointType::Bulk,
                    packet_size: 64,
                },
                EndpointDescription {
                    number: number + 1,
                    direction: Direction::Out,
                    transfer_type: EndpointType::Bulk,
                    packet_size: 64,
                },
            ],
        }
    }

    fn description() -> DeviceDescription {
        DeviceDescription {
            vendor_id: 0x1234,
            product_id: 0x5678,
            serial_number: Some("AB12".to_string()),
            product_name: Some("Widget".to_string()),
            manufacturer_name: Some("Acme".to_string()),
            device_class: 0xef,
            device_subclass: 2,
            device_protocol: 1,
            device_version: Version::new(1, 0, 3),
            usb_version: Version::new(2, 0, 0),
            active_configuration: Some(1),
            configurations: vec![
                ConfigurationDescription {
                    value: 1,
                    name: None,
                    interfaces: vec![iface(0, true), iface(1, false)],
                },
                ConfigurationDescription {
                    value: 2,
                    name: Some("Alt".to_string()),
                    interfaces: vec![iface(0, true)],
                },
            ],
        }
    }

    #[test]
    fn test_snapshot_fields() {
        let snapshot = OpenedDeviceSnapshot::from_description(&description());
        assert_eq!(snapshot.version, "1.0.3");
        assert_eq!(snapshot.usb_version, "2.0.0");
        assert_eq!(snapshot.vid_pid(), "0x1234:0x5678");
        assert_eq!(snapshot.class_code(), "239.2.1");
        assert_eq!(snapshot.active_configuration().map(|c| c.value), Some(1));
        assert_eq!(snapshot.configurations[0].label(), "Config 1");
        assert_eq!(snapshot.configurations[1].label(), "Alt");
    }

    #[test]
    fn test_endpoints_only_from_active_configuration() {
        let snapshot = OpenedDeviceSnapshot::from_description(&description());
        // Interface 0 is claimed in both configurations, but only the active
        // one contributes.
        assert_eq!(snapshot.available_endpoints.len(), 2);
        assert!(snapshot.available_endpoints.iter().all(|e| e.interface == 0));
    }

    #[test]
    fn test_unconfigured_device_has_no_endpoints() {
        let mut device = description();
        device.active_configuration = None;
        let snapshot = OpenedDeviceSnapshot::from_description(&device);
        assert!(snapshot.available_endpoints.is_empty());
        assert!(snapshot.active_configuration().is_none());
    }

    #[test]
    fn test_endpoint_view_json_keys() {
        let view = EndpointView {
            interface: 0,
            endpoint: 1,
            direction: Direction::In,
            transfer_type: EndpointType::Interrupt,
            packet_size: 8,
        };
        let json = serde_json::to_value(&view).unwrap();
        assert_eq!(
            json,
            serde_json::json!({
                "interface": 0,
                "endpoint": 1,
                "direction": "in",
                "type": "interrupt",
                "packetSize": 8
            })
        );
    }
}
