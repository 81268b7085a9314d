//! Integration tests for configuration files
//!
//! Loads and saves `panel.toml` through the filesystem:
//! - Full file with every option
//! - Save then load
//! - Invalid files rejected at load time

use panel::PanelConfig;
use panel::relay::RelayTransport;
use std::fs;
use std::time::Duration;
use tempfile::TempDir;

const FULL_CONFIG: &str = r#"
[panel]
log_level = "debug"
headless = true
log_file = "/var/log/usb-panel.log"

[usb]
permitted = ["0x04f9:*", "0x1234:0x5678"]
transfer_timeout_secs = 10

[relay]
transport = "tcp"
listen = "0.0.0.0:9000"
"#;

fn write_config(dir: &TempDir, content: &str) -> std::path::PathBuf {
    let path = dir.path().join("panel.toml");
    fs::write(&path, content).unwrap();
    path
}

#[test]
fn test_load_full_config() {
    let dir = TempDir::new().unwrap();
    let path = write_config(&dir, FULL_CONFIG);

    let config = PanelConfig::load(Some(path)).unwrap();
    assert_eq!(config.panel.log_level, "debug");
    assert!(config.panel.headless);
    assert_eq!(
        config.log_file_path().unwrap().to_str(),
        Some("/var/log/usb-panel.log")
    );
    assert_eq!(config.usb.permitted.len(), 2);
    assert_eq!(config.transfer_timeout(), Duration::from_secs(10));
    assert_eq!(config.relay.transport, RelayTransport::Tcp);
    assert_eq!(config.listen_addr().unwrap().port(), 9000);
}

#[test]
fn test_save_then_load() {
    let dir = TempDir::new().unwrap();
    let path = dir.path().join("nested").join("panel.toml");

    let mut config = PanelConfig::default();
    config.usb.permitted = vec!["0x1234:*".to_string()];
    config.relay.transport = RelayTransport::None;
    config.save(&path).unwrap();

    let loaded = PanelConfig::load(Some(path)).unwrap();
    assert_eq!(loaded, config);
}

#[test]
fn test_empty_file_is_default() {
    let dir = TempDir::new().unwrap();
    let path = write_config(&dir, "");

    let config = PanelConfig::load(Some(path)).unwrap();
    assert_eq!(config, PanelConfig::default());
}

#[test]
fn test_invalid_filter_rejected() {
    let dir = TempDir::new().unwrap();
    let path = write_config(&dir, "[usb]\npermitted = [\"1234:5678\"]\n");

    let err = PanelConfig::load(Some(path)).unwrap_err();
    assert!(err.to_string().contains("must start with '0x'"));
}

#[test]
fn test_unknown_transport_rejected() {
    let dir = TempDir::new().unwrap();
    let path = write_config(&dir, "[relay]\ntransport = \"carrier-pigeon\"\n");

    let err = PanelConfig::load(Some(path)).unwrap_err();
    assert!(format!("{:#}", err).contains("Failed to parse config file"));
}

#[test]
fn test_missing_file_is_error() {
    let dir = TempDir::new().unwrap();
    assert!(PanelConfig::load(Some(dir.path().join("absent.toml"))).is_err());
}
