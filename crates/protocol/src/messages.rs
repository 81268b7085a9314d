//! Relay message definitions
//!
//! Messages exchanged with the host process. Every message travels inside an
//! [`Envelope`]: `{"event": <name>, "payload": <value>}`.
//!
//! Inbound commands are decoded from the envelope by event name so that a
//! missing or `null` payload is accepted where a command takes none.
//! Outbound messages serialize straight into the envelope shape.

use crate::error::{ProtocolError, Result};
use crate::snapshot::EndpointView;
use crate::types::DeviceId;
use serde::ser::Serializer;
use serde::{Deserialize, Serialize};

/// Wire envelope shared by both directions
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct Envelope {
    pub event: String,
    #[serde(default)]
    pub payload: serde_json::Value,
}

/// Configuration requested when opening a device
#[derive(Debug, Clone, Default, PartialEq, Eq, Serialize, Deserialize)]
pub struct OpenConfig {
    /// Configuration value to select after opening
    #[serde(default)]
    pub selected_configuration: Option<u8>,
    /// Interfaces to claim once the configuration is selected
    #[serde(default)]
    pub claimed_interfaces: Vec<u8>,
}

/// Command sent by the host
#[derive(Debug, Clone, PartialEq, Eq)]
pub enum InboundCommand {
    /// Open, configure and claim a device
    OpenDevice { id: DeviceId, config: OpenConfig },
    /// Ask for the endpoints of the claimed interfaces
    GetEndpoints,
    /// Write `data` to an OUT endpoint
    TransferOut { endpoint: u8, data: Vec<u8> },
    /// Read up to `length` bytes from an IN endpoint
    TransferIn { endpoint: u8, length: usize },
}

impl InboundCommand {
    pub const OPEN_DEVICE: &'static str = "open_device";
    pub const GET_ENDPOINTS: &'static str = "get_endpoints";
    pub const TRANSFER_OUT: &'static str = "transfer_out";
    pub const TRANSFER_IN: &'static str = "transfer_in";

    pub fn event_name(&self) -> &'static str {
        match self {
            Self::OpenDevice { .. } => Self::OPEN_DEVICE,
            Self::GetEndpoints => Self::GET_ENDPOINTS,
            Self::TransferOut { .. } => Self::TRANSFER_OUT,
            Self::TransferIn { .. } => Self::TRANSFER_IN,
        }
    }

    /// Decode a command from its envelope
    pub fn from_envelope(envelope: Envelope) -> Result<Self> {
        let Envelope { event, payload } = envelope;
        let invalid = |source| ProtocolError::InvalidPayload {
            event: event.clone(),
            source,
        };

        match event.as_str() {
            Self::OPEN_DEVICE => {
                #[derive(Deserialize)]
                struct OpenPayload {
                    id: DeviceId,
                    #[serde(default)]
                    config: OpenConfig,
                }
                let p: OpenPayload = serde_json::from_value(payload).map_err(invalid)?;
                Ok(Self::OpenDevice {
                    id: p.id,
                    config: p.config,
                })
            }
            Self::GET_ENDPOINTS => Ok(Self::GetEndpoints),
            Self::TRANSFER_OUT => {
                let (endpoint, data): (u8, Vec<u8>) =
                    serde_json::from_value(payload).map_err(invalid)?;
                Ok(Self::TransferOut { endpoint, data })
            }
            Self::TRANSFER_IN => {
                #[derive(Deserialize)]
                struct InPayload {
                    endpoint: u8,
                    length: usize,
                }
                let p: InPayload = serde_json::from_value(payload).map_err(invalid)?;
                Ok(Self::TransferIn {
                    endpoint: p.endpoint,
                    length: p.length,
                })
            }
            _ => Err(ProtocolError::UnknownEvent(event.clone())),
        }
    }

    /// Encode the command the way a host would send it
    pub fn to_envelope(&self) -> Envelope {
        let payload = match self {
            Self::OpenDevice { id, config } => serde_json::json!({
                "id": id,
                "config": config,
            }),
            Self::GetEndpoints => serde_json::Value::Null,
            Self::TransferOut { endpoint, data } => serde_json::json!([endpoint, data]),
            Self::TransferIn { endpoint, length } => serde_json::json!({
                "endpoint": endpoint,
                "length": length,
            }),
        };
        Envelope {
            event: self.event_name().to_string(),
            payload,
        }
    }
}

/// Session state reported after every snapshot rebuild
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "camelCase")]
pub struct DeviceUpdate {
    pub id: DeviceId,
    pub selected_configuration: Option<u8>,
    pub claimed_interfaces: Vec<u8>,
}

/// Answer to `get_endpoints`, `transfer_out` and `transfer_in`
///
/// Serializes as `"ok"`, `["ok", <value>]` or `["error", <message>]`.
#[derive(Debug, Clone, PartialEq, Eq)]
pub enum DeviceResponse {
    /// Completed transfer with nothing to return
    Ok,
    /// Endpoints of the claimed interfaces
    Endpoints(Vec<EndpointView>),
    /// Bytes received from an IN transfer
    Data(Vec<u8>),
    /// Failure message
    Error(String),
}

impl Serialize for DeviceResponse {
    fn serialize<S: Serializer>(&self, serializer: S) -> std::result::Result<S::Ok, S::Error> {
        match self {
            Self::Ok => serializer.serialize_str("ok"),
            Self::Endpoints(endpoints) => ("ok", endpoints).serialize(serializer),
            Self::Data(data) => ("ok", serde_bytes::Bytes::new(data)).serialize(serializer),
            Self::Error(message) => ("error", message).serialize(serializer),
        }
    }
}

/// Notification sent to the host
#[derive(Debug, Clone, PartialEq, Eq, Serialize)]
#[serde(tag = "event", content = "payload", rename_all = "snake_case")]
pub enum OutboundMessage {
    /// A permitted device was plugged in
    DeviceConnected(DeviceId),
    /// A permitted device was unplugged
    DeviceDisconnected(DeviceId),
    /// The opened device's snapshot was rebuilt
    DeviceUpdate(DeviceUpdate),
    /// The opened device was closed
    DeviceClosed(DeviceId),
    /// Answer to a host command
    DeviceResponse(DeviceResponse),
}

impl OutboundMessage {
    pub fn event_name(&self) -> &'static str {
        match self {
            Self::DeviceConnected(_) => "device_connected",
            Self::DeviceDisconnected(_) => "device_disconnected",
            Self::DeviceUpdate(_) => "device_update",
            Self::DeviceClosed(_) => "device_closed",
            Self::DeviceResponse(_) => "device_response",
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::types::{Direction, EndpointType};
    use serde_json::json;

    fn envelope(value: serde_json::Value) -> Envelope {
        serde_json::from_value(value).unwrap()
    }

    #[test]
    fn test_decode_open_device() {
        let cmd = InboundCommand::from_envelope(envelope(json!({
            "event": "open_device",
            "payload": {
                "id": "4660-22136-AB12",
                "config": {"selected_configuration": 1, "claimed_interfaces": [0, 2]}
            }
        })))
        .unwrap();

        assert_eq!(
            cmd,
            InboundCommand::OpenDevice {
                id: DeviceId::from("4660-22136-AB12"),
                config: OpenConfig {
                    selected_configuration: Some(1),
                    claimed_interfaces: vec![0, 2],
                },
            }
        );
    }

    #[test]
    fn test_decode_get_endpoints_without_payload() {
        let cmd =
            InboundCommand::from_envelope(envelope(json!({"event": "get_endpoints"}))).unwrap();
        assert_eq!(cmd, InboundCommand::GetEndpoints);

        let cmd = InboundCommand::from_envelope(envelope(
            json!({"event": "get_endpoints", "payload": {}}),
        ))
        .unwrap();
        assert_eq!(cmd, InboundCommand::GetEndpoints);
    }

    #[test]
    fn test_decode_transfers() {
        let out = InboundCommand::from_envelope(envelope(json!({
            "event": "transfer_out",
            "payload": [2, [1, 2, 3]]
        })))
        .unwrap();
        assert_eq!(
            out,
            InboundCommand::TransferOut {
                endpoint: 2,
                data: vec![1, 2, 3]
            }
        );

        let input = InboundCommand::from_envelope(envelope(json!({
            "event": "transfer_in",
            "payload": {"endpoint": 1, "length": 64}
        })))
        .unwrap();
        assert_eq!(
            input,
            InboundCommand::TransferIn {
                endpoint: 1,
                length: 64
            }
        );
    }

    #[test]
    fn test_decode_rejects_unknown_event() {
        let err = InboundCommand::from_envelope(envelope(json!({"event": "reboot"}))).unwrap_err();
        assert!(matches!(err, ProtocolError::UnknownEvent(ref e) if e == "reboot"));
    }

    #[test]
    fn test_decode_rejects_bad_payload() {
        let err = InboundCommand::from_envelope(envelope(json!({
            "event": "transfer_in",
            "payload": {"endpoint": "one"}
        })))
        .unwrap_err();
        assert!(matches!(
            err,
            ProtocolError::InvalidPayload { ref event, .. } if event == "transfer_in"
        ));
    }

    #[test]
    fn test_to_envelope_decodes_back() {
        let cmd = InboundCommand::TransferOut {
            endpoint: 3,
            data: vec![0xde, 0xad],
        };
        assert_eq!(InboundCommand::from_envelope(cmd.to_envelope()).unwrap(), cmd);
    }

    #[test]
    fn test_device_response_shapes() {
        assert_eq!(serde_json::to_value(DeviceResponse::Ok).unwrap(), json!("ok"));
        assert_eq!(
            serde_json::to_value(DeviceResponse::Error("No opened device".into())).unwrap(),
            json!(["error", "No opened device"])
        );
        assert_eq!(
            serde_json::to_value(DeviceResponse::Data(vec![1, 2, 255])).unwrap(),
            json!(["ok", [1, 2, 255]])
        );

        let endpoints = vec![EndpointView {
            interface: 0,
            endpoint: 1,
            direction: Direction::Out,
            transfer_type: EndpointType::Bulk,
            packet_size: 512,
        }];
        assert_eq!(
            serde_json::to_value(DeviceResponse::Endpoints(endpoints)).unwrap(),
            json!(["ok", [{
                "interface": 0,
                "endpoint": 1,
                "direction": "out",
                "type": "bulk",
                "packetSize": 512
            }]])
        );
    }

    #[test]
    fn test_outbound_envelope_shape() {
        let msg = OutboundMessage::DeviceUpdate(DeviceUpdate {
            id: DeviceId::from("1-2"),
            selected_configuration: Some(1),
            claimed_interfaces: vec![0, 2],
        });
        assert_eq!(
            serde_json::to_value(&msg).unwrap(),
            json!({
                "event": "device_update",
                "payload": {"id": "1-2", "selectedConfiguration": 1, "claimedInterfaces": [0, 2]}
            })
        );

        let closed = OutboundMessage::DeviceClosed(DeviceId::from("1-2"));
        assert_eq!(
            serde_json::to_value(&closed).unwrap(),
            json!({"event": "device_closed", "payload": "1-2"})
        );
        assert_eq!(closed.event_name(), "device_closed");
    }
}
