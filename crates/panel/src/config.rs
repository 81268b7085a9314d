//! Panel configuration management

use crate::relay::RelayTransport;
use anyhow::{Context, Result, anyhow};
use serde::{Deserialize, Serialize};
use std::fs;
use std::net::SocketAddr;
use std::path::{Path, PathBuf};
use std::time::Duration;

#[derive(Debug, Clone, Default, PartialEq, Serialize, Deserialize)]
pub struct PanelConfig {
    #[serde(default)]
    pub panel: PanelSettings,
    #[serde(default)]
    pub usb: UsbSettings,
    #[serde(default)]
    pub relay: RelaySettings,
}

#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct PanelSettings {
    #[serde(default = "PanelSettings::default_log_level")]
    pub log_level: String,
    /// Run without the TUI
    #[serde(default)]
    pub headless: bool,
    /// Log file; `~` is expanded
    #[serde(default)]
    pub log_file: Option<String>,
}

impl Default for PanelSettings {
    fn default() -> Self {
        Self {
            log_level: Self::default_log_level(),
            headless: false,
            log_file: None,
        }
    }
}

impl PanelSettings {
    fn default_log_level() -> String {
        "info".to_string()
    }
}

#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct UsbSettings {
    /// VID:PID patterns granted without a prompt (e.g. "0x1234:*")
    #[serde(default)]
    pub permitted: Vec<String>,
    #[serde(default = "UsbSettings::default_transfer_timeout")]
    pub transfer_timeout_secs: u64,
}

impl Default for UsbSettings {
    fn default() -> Self {
        Self {
            permitted: Vec::new(),
            transfer_timeout_secs: Self::default_transfer_timeout(),
        }
    }
}

impl UsbSettings {
    fn default_transfer_timeout() -> u64 {
        3
    }
}

#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct RelaySettings {
    #[serde(default)]
    pub transport: RelayTransport,
    /// Listen address for the tcp transport
    #[serde(default = "RelaySettings::default_listen")]
    pub listen: String,
}

impl Default for RelaySettings {
    fn default() -> Self {
        Self {
            transport: RelayTransport::default(),
            listen: Self::default_listen(),
        }
    }
}

impl RelaySettings {
    fn default_listen() -> String {
        "127.0.0.1:7878".to_string()
    }
}

impl PanelConfig {
    /// Load configuration from `path`, or the first standard location that
    /// exists
    pub fn load(path: Option<PathBuf>) -> Result<Self> {
        let config_path = match path {
            Some(p) => PathBuf::from(shellexpand::tilde(&p.to_string_lossy()).as_ref()),
            None => Self::candidate_paths()
                .into_iter()
                .find(|p| p.exists())
                .ok_or_else(|| anyhow!("No configuration file found"))?,
        };

        let content = fs::read_to_string(&config_path)
            .with_context(|| format!("Failed to read config file: {}", config_path.display()))?;

        let config: PanelConfig = toml::from_str(&content)
            .with_context(|| format!("Failed to parse config file: {}", config_path.display()))?;

        config.validate()?;

        tracing::info!("Loaded configuration from: {}", config_path.display());
        Ok(config)
    }

    /// Load configuration or return defaults if none is found
    pub fn load_or_default() -> Self {
        match Self::load(None) {
            Ok(config) => config,
            Err(e) => {
                tracing::warn!("Failed to load config: {}, using defaults", e);
                Self::default()
            }
        }
    }

    pub fn save(&self, path: &Path) -> Result<()> {
        let content = toml::to_string_pretty(self).context("Failed to serialize configuration")?;

        if let Some(parent) = path.parent() {
            fs::create_dir_all(parent).with_context(|| {
                format!("Failed to create config directory: {}", parent.display())
            })?;
        }

        fs::write(path, content)
            .with_context(|| format!("Failed to write config file: {}", path.display()))?;

        tracing::info!("Saved configuration to: {}", path.display());
        Ok(())
    }

    /// Per-user configuration file
    pub fn default_path() -> PathBuf {
        if let Some(config_dir) = dirs::config_dir() {
            config_dir.join("usb-panel").join("panel.toml")
        } else {
            PathBuf::from(".config/usb-panel/panel.toml")
        }
    }

    fn candidate_paths() -> Vec<PathBuf> {
        vec![
            Self::default_path(),
            PathBuf::from("/etc/usb-panel/panel.toml"),
        ]
    }

    pub fn transfer_timeout(&self) -> Duration {
        Duration::from_secs(self.usb.transfer_timeout_secs)
    }

    /// Configured log file with `~` expanded
    pub fn log_file_path(&self) -> Option<PathBuf> {
        self.panel
            .log_file
            .as_deref()
            .map(|p| PathBuf::from(shellexpand::tilde(p).as_ref()))
    }

    pub fn listen_addr(&self) -> Result<SocketAddr> {
        self.relay
            .listen
            .parse()
            .with_context(|| format!("Invalid relay listen address '{}'", self.relay.listen))
    }

    pub fn validate(&self) -> Result<()> {
        validate_log_level(&self.panel.log_level)?;

        for filter in &self.usb.permitted {
            Self::validate_filter(filter)?;
        }

        if self.usb.transfer_timeout_secs == 0 {
            return Err(anyhow!("transfer_timeout_secs must be greater than 0"));
        }

        if self.relay.transport == RelayTransport::Tcp {
            self.listen_addr()?;
        }

        Ok(())
    }

    /// Validate a USB device filter pattern (VID:PID)
    fn validate_filter(filter: &str) -> Result<()> {
        let parts: Vec<&str> = filter.split(':').collect();
        if parts.len() != 2 {
            return Err(anyhow!(
                "Invalid filter format '{}', expected VID:PID (e.g., '0x1234:0x5678' or '0x1234:*')",
                filter
            ));
        }

        let (vid, pid) = (parts[0], parts[1]);
        if vid != "*" {
            Self::validate_hex_id(vid, "VID")?;
        }
        if pid != "*" {
            Self::validate_hex_id(pid, "PID")?;
        }
        Ok(())
    }

    fn validate_hex_id(id: &str, name: &str) -> Result<()> {
        let Some(hex_part) = id.strip_prefix("0x").or_else(|| id.strip_prefix("0X")) else {
            return Err(anyhow!(
                "Invalid {} '{}', must start with '0x' (e.g., '0x1234')",
                name,
                id
            ));
        };

        if hex_part.is_empty() || hex_part.len() > 4 {
            return Err(anyhow!(
                "Invalid {} '{}', hex part must be 1-4 digits",
                name,
                id
            ));
        }

        u16::from_str_radix(hex_part, 16)
            .map_err(|_| anyhow!("Invalid {} '{}', not a valid hex number", name, id))?;
        Ok(())
    }
}

/// Check a log level name
pub fn validate_log_level(level: &str) -> Result<()> {
    let valid_levels = ["trace", "debug", "info", "warn", "error"];
    if !valid_levels.contains(&level) {
        return Err(anyhow!(
            "Invalid log level '{}', must be one of: {}",
            level,
            valid_levels.join(", ")
        ));
    }
    Ok(())
}
