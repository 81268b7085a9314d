//! Event relay
//!
//! Bridges the host process and the panel. Inbound lines are decoded into
//! [`InboundCommand`]s and dispatched to the same [`Panel`] operations the TUI
//! uses. Outbound notifications come from [`Panel::subscribe`].
//!
//! Malformed lines and unknown events are logged and get no response.

pub mod transport;

use crate::panel::Panel;
use common::DeviceBackend;
use protocol::{InboundCommand, OutboundMessage, decode_command};
use tracing::debug;

pub use transport::{RelayTransport, serve_connection, serve_stdio, serve_tcp};

/// Decode and dispatch one inbound line
pub async fn handle_line<B: DeviceBackend>(panel: &Panel<B>, line: &[u8]) {
    match decode_command(line) {
        Ok(command) => handle_command(panel, command).await,
        Err(e) => panel.log().error(format!("Invalid relay message: {}", e)),
    }
}

/// Run one host command
///
/// `open_device` answers only through the log and the `device_update` it
/// triggers; the other commands answer with a `device_response`.
pub async fn handle_command<B: DeviceBackend>(panel: &Panel<B>, command: InboundCommand) {
    debug!("Relay command: {}", command.event_name());
    let response = match command {
        InboundCommand::OpenDevice { id, config } => {
            panel.open_device(id, config).await;
            return;
        }
        InboundCommand::GetEndpoints => panel.endpoints().await,
        InboundCommand::TransferOut { endpoint, data } => {
            panel.transfer_out(endpoint, data).await
        }
        InboundCommand::TransferIn { endpoint, length } => {
            panel.transfer_in(endpoint, length).await
        }
    };
    panel.notify(OutboundMessage::DeviceResponse(response));
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::gateway::DEFAULT_TRANSFER_TIMEOUT;
    use crate::log::LogKind;
    use common::test_utils::MockBackend;
    use protocol::DeviceResponse;
    use std::sync::Arc;

    fn panel() -> Panel<MockBackend> {
        Panel::new(Arc::new(MockBackend::new()), DEFAULT_TRANSFER_TIMEOUT)
    }

    #[tokio::test]
    async fn test_get_endpoints_while_closed() {
        let panel = panel();
        let mut rx = panel.subscribe();

        handle_line(&panel, br#"{"event":"get_endpoints"}"#).await;
        assert_eq!(
            rx.recv().await.unwrap(),
            OutboundMessage::DeviceResponse(DeviceResponse::Error(
                "No opened device".to_string()
            ))
        );
    }

    #[tokio::test]
    async fn test_unknown_event_is_logged_without_response() {
        let panel = panel();
        let mut rx = panel.subscribe();

        handle_line(&panel, br#"{"event":"reboot","payload":null}"#).await;
        handle_line(&panel, b"not json").await;

        assert!(rx.try_recv().is_err());
        let entries = panel.log().entries();
        assert_eq!(entries.len(), 2);
        assert!(entries.iter().all(|e| e.kind == LogKind::Error));
        assert_eq!(entries[0].message, "Invalid relay message: Unknown event: reboot");
    }

    #[tokio::test]
    async fn test_open_unknown_device_logs_and_stays_silent() {
        let panel = panel();
        let mut rx = panel.subscribe();

        handle_line(
            &panel,
            br#"{"event":"open_device","payload":{"id":"1-2","config":{"selected_configuration":1,"claimed_interfaces":[0]}}}"#,
        )
        .await;

        assert!(rx.try_recv().is_err());
        let entries = panel.log().entries();
        assert_eq!(entries.last().unwrap().message, "Can't open device 1-2: Device not found: 1-2");
    }
}
