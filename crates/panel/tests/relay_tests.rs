//! Relay Integration Tests
//!
//! Runs [`serve_connection`] over an in-memory duplex pipe and plays the
//! host side with raw JSON lines.
//!
//! Run with: `cargo test -p panel --test relay_tests`

use common::test_utils::{DEFAULT_TEST_TIMEOUT, MockBackend, mock_device, with_timeout};
use panel::relay::serve_connection;
use panel::{DEFAULT_TRANSFER_TIMEOUT, LogKind, Panel};
use protocol::{DeviceId, OpenConfig, OutboundMessage, read_line_async};
use serde_json::{Value, json};
use std::sync::Arc;
use tokio::io::{AsyncWriteExt, BufReader, DuplexStream, ReadHalf, WriteHalf};
use tokio::task::JoinHandle;
use tokio_util::sync::CancellationToken;

/// Host end of a relay connection
struct Host {
    reader: BufReader<ReadHalf<DuplexStream>>,
    writer: WriteHalf<DuplexStream>,
    server: JoinHandle<anyhow::Result<()>>,
    shutdown: CancellationToken,
}

impl Host {
    fn connect(panel: &Panel<MockBackend>) -> Self {
        let (host, relay) = tokio::io::duplex(64 * 1024);
        let (relay_read, relay_write) = tokio::io::split(relay);
        let (host_read, host_write) = tokio::io::split(host);
        let shutdown = CancellationToken::new();

        let server = tokio::spawn(serve_connection(
            panel.clone(),
            BufReader::new(relay_read),
            relay_write,
            shutdown.clone(),
        ));

        Self {
            reader: BufReader::new(host_read),
            writer: host_write,
            server,
            shutdown,
        }
    }

    async fn send(&mut self, line: Value) {
        let mut bytes = serde_json::to_vec(&line).unwrap();
        bytes.push(b'\n');
        self.writer.write_all(&bytes).await.unwrap();
    }

    async fn send_raw(&mut self, bytes: &[u8]) {
        self.writer.write_all(bytes).await.unwrap();
    }

    async fn recv(&mut self) -> Option<Value> {
        read_line_async(&mut self.reader)
            .await
            .unwrap()
            .map(|line| serde_json::from_slice(&line).unwrap())
    }
}

fn panel_with(backend: MockBackend) -> (Panel<MockBackend>, Arc<MockBackend>) {
    let backend = Arc::new(backend);
    (
        Panel::new(Arc::clone(&backend), DEFAULT_TRANSFER_TIMEOUT),
        backend,
    )
}

// ============================================================================
// Command round trips
// ============================================================================

#[tokio::test]
async fn test_get_endpoints_while_closed() {
    let (panel, _backend) = panel_with(MockBackend::new());
    let mut host = Host::connect(&panel);

    host.send(json!({"event": "get_endpoints"})).await;
    let reply = with_timeout(DEFAULT_TEST_TIMEOUT, host.recv())
        .await
        .expect("Timed out");
    assert_eq!(
        reply,
        Some(json!({"event": "device_response", "payload": ["error", "No opened device"]}))
    );
}

#[tokio::test]
async fn test_open_then_transfer() {
    let (panel, backend) = panel_with(MockBackend::new().with_device(mock_device(
        0x1234,
        0x5678,
        Some("AB12"),
        3,
    )));
    let mut host = Host::connect(&panel);

    host.send(json!({
        "event": "open_device",
        "payload": {
            "id": "4660-22136-AB12",
            "config": {"selected_configuration": 1, "claimed_interfaces": [0, 2]}
        }
    }))
    .await;
    assert_eq!(
        host.recv().await,
        Some(json!({
            "event": "device_update",
            "payload": {
                "id": "4660-22136-AB12",
                "selectedConfiguration": 1,
                "claimedInterfaces": [0, 2]
            }
        }))
    );

    host.send(json!({"event": "get_endpoints"})).await;
    let reply = host.recv().await.unwrap();
    assert_eq!(reply["event"], "device_response");
    assert_eq!(reply["payload"][0], "ok");
    let endpoints = reply["payload"][1].as_array().unwrap();
    assert_eq!(endpoints.len(), 4);
    assert_eq!(
        endpoints[0],
        json!({"interface": 0, "endpoint": 1, "direction": "in", "type": "bulk", "packetSize": 64})
    );

    host.send(json!({"event": "transfer_out", "payload": [3, [1, 2, 3]]}))
        .await;
    assert_eq!(
        host.recv().await,
        Some(json!({"event": "device_response", "payload": "ok"}))
    );
    assert_eq!(backend.writes(), vec![(3, vec![1, 2, 3])]);

    backend.queue_in(1, vec![0xaa, 0xbb]);
    host.send(json!({"event": "transfer_in", "payload": {"endpoint": 1, "length": 64}}))
        .await;
    assert_eq!(
        host.recv().await,
        Some(json!({"event": "device_response", "payload": ["ok", [170, 187]]}))
    );
}

#[tokio::test]
async fn test_oversized_transfer_in_is_answered_and_relay_keeps_working() {
    let device = mock_device(1, 2, None, 1);
    let id = device.id();
    let (panel, backend) = panel_with(MockBackend::new().with_device(device));
    assert!(
        panel
            .open_device(
                id,
                OpenConfig {
                    selected_configuration: Some(1),
                    claimed_interfaces: vec![0],
                },
            )
            .await
    );
    backend.queue_in(1, vec![255; 300_000]);

    let mut host = Host::connect(&panel);
    host.send(json!({"event": "transfer_in", "payload": {"endpoint": 1, "length": 300_000}}))
        .await;
    let reply = with_timeout(DEFAULT_TEST_TIMEOUT, host.recv())
        .await
        .expect("Timed out");
    assert_eq!(
        reply,
        Some(json!({
            "event": "device_response",
            "payload": ["error", "Transfer length 300000 exceeds the maximum of 131072 bytes"]
        }))
    );

    host.send(json!({"event": "get_endpoints"})).await;
    let reply = with_timeout(DEFAULT_TEST_TIMEOUT, host.recv())
        .await
        .expect("Timed out")
        .unwrap();
    assert_eq!(reply["payload"][0], "ok");
}

#[tokio::test(start_paused = true)]
async fn test_hanging_transfer_times_out() {
    let device = mock_device(1, 2, None, 1);
    let id = device.id();
    let (panel, backend) = panel_with(MockBackend::new().with_device(device));
    assert!(
        panel
            .open_device(
                id,
                OpenConfig {
                    selected_configuration: Some(1),
                    claimed_interfaces: vec![0],
                },
            )
            .await
    );
    backend.hang_transfers(true);

    let mut host = Host::connect(&panel);
    host.send(json!({"event": "transfer_out", "payload": [1, [0]]}))
        .await;

    assert_eq!(
        host.recv().await,
        Some(json!({
            "event": "device_response",
            "payload": ["error", "Operation timed out after 3 seconds"]
        }))
    );
    assert!(backend.writes().is_empty());
}

// ============================================================================
// Malformed input and notifications
// ============================================================================

#[tokio::test]
async fn test_malformed_lines_are_logged_and_skipped() {
    let (panel, _backend) = panel_with(MockBackend::new());
    let mut host = Host::connect(&panel);

    host.send_raw(b"{oops\n").await;
    host.send(json!({"event": "reboot"})).await;
    host.send(json!({"event": "get_endpoints"})).await;

    // Only the valid command is answered
    let reply = host.recv().await.unwrap();
    assert_eq!(reply["payload"], json!(["error", "No opened device"]));

    let errors: Vec<String> = panel
        .log()
        .entries()
        .into_iter()
        .filter(|entry| entry.kind == LogKind::Error)
        .map(|entry| entry.message)
        .collect();
    assert_eq!(errors.len(), 2);
    assert!(errors.iter().all(|m| m.starts_with("Invalid relay message: ")));
    assert!(errors.contains(&"Invalid relay message: Unknown event: reboot".to_string()));
}

#[tokio::test]
async fn test_oversized_line_is_one_error() {
    let (panel, _backend) = panel_with(MockBackend::new());
    let mut host = Host::connect(&panel);

    let mut line = vec![b'{'; protocol::MAX_LINE_SIZE + 100];
    line.push(b'\n');
    host.send_raw(&line).await;
    host.send(json!({"event": "get_endpoints"})).await;

    let reply = with_timeout(DEFAULT_TEST_TIMEOUT, host.recv())
        .await
        .expect("Timed out")
        .unwrap();
    assert_eq!(reply["payload"], json!(["error", "No opened device"]));

    let errors: Vec<String> = panel
        .log()
        .entries()
        .into_iter()
        .filter(|entry| entry.kind == LogKind::Error)
        .map(|entry| entry.message)
        .collect();
    assert_eq!(errors.len(), 1);
    assert!(errors[0].starts_with("Invalid relay message: Line too long"));
}

#[tokio::test]
async fn test_notifications_are_forwarded() {
    let (panel, _backend) = panel_with(MockBackend::new());
    let mut host = Host::connect(&panel);

    // Round trip first so the relay is subscribed
    host.send(json!({"event": "get_endpoints"})).await;
    host.recv().await.unwrap();

    panel.notify(OutboundMessage::DeviceConnected(DeviceId::from("1-2")));
    panel.notify(OutboundMessage::DeviceDisconnected(DeviceId::from("1-2")));

    assert_eq!(
        host.recv().await,
        Some(json!({"event": "device_connected", "payload": "1-2"}))
    );
    assert_eq!(
        host.recv().await,
        Some(json!({"event": "device_disconnected", "payload": "1-2"}))
    );
}

// ============================================================================
// Connection lifecycle
// ============================================================================

#[tokio::test]
async fn test_peer_close_flushes_pending_responses() {
    let (panel, _backend) = panel_with(MockBackend::new());
    let mut host = Host::connect(&panel);

    host.send(json!({"event": "get_endpoints"})).await;
    host.writer.shutdown().await.unwrap();

    assert!(host.recv().await.is_some());
    let result = with_timeout(DEFAULT_TEST_TIMEOUT, host.server)
        .await
        .expect("Timed out")
        .expect("Relay task panicked");
    assert!(result.is_ok());
}

#[tokio::test]
async fn test_shutdown_stops_connection() {
    let (panel, _backend) = panel_with(MockBackend::new());
    let host = Host::connect(&panel);

    host.shutdown.cancel();
    let result = with_timeout(DEFAULT_TEST_TIMEOUT, host.server)
        .await
        .expect("Timed out")
        .expect("Relay task panicked");
    assert!(result.is_ok());
}
