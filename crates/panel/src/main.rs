//! usb-panel
//!
//! Terminal operator panel for USB devices with a JSON relay to a host
//! process.

use anyhow::{Context, Result};
use clap::Parser;
use common::{DeviceBackend, UsbBridge, create_usb_bridge, setup_logging};
use panel::config::{PanelConfig, validate_log_level};
use panel::relay::{self, RelayTransport};
use panel::usb::spawn_usb_worker;
use panel::{Panel, tui};
use std::future::Future;
use std::path::PathBuf;
use std::sync::Arc;
use std::time::Duration;
use tokio::signal;
use tokio::task::JoinHandle;
use tokio_util::sync::CancellationToken;
use tracing::{error, info, warn};

#[derive(Parser, Debug)]
#[command(name = "usb-panel")]
#[command(
    author,
    version,
    about = "USB Panel - Open, configure and exchange data with USB devices"
)]
#[command(long_about = "
An operator panel for USB devices. Grant access to attached devices, open
one, choose its configuration and interfaces, and run raw bulk or interrupt
transfers. Device events and transfer results are relayed to a host process
as newline-delimited JSON over stdio or TCP.

EXAMPLES:
    # Interactive terminal UI
    usb-panel

    # Headless, relaying over stdin/stdout
    usb-panel --headless --relay stdio

    # Terminal UI with a TCP relay
    usb-panel --relay tcp --listen 127.0.0.1:7878

    # List attached USB devices and exit
    usb-panel --list-devices

CONFIGURATION:
    The panel looks for configuration files in the following order:
    1. Path specified with --config
    2. ~/.config/usb-panel/panel.toml
    3. /etc/usb-panel/panel.toml
    4. Built-in defaults
")]
struct Args {
    /// Path to configuration file
    #[arg(short, long, value_name = "PATH")]
    config: Option<PathBuf>,

    /// Save default configuration to default location and exit
    #[arg(long)]
    save_config: bool,

    /// Run without the TUI
    #[arg(long)]
    headless: bool,

    /// Relay transport
    #[arg(long, value_enum, value_name = "TRANSPORT")]
    relay: Option<RelayTransport>,

    /// Listen address for the tcp relay
    #[arg(long, value_name = "ADDR")]
    listen: Option<String>,

    /// List USB devices and exit
    #[arg(long)]
    list_devices: bool,

    /// Log level (trace, debug, info, warn, error)
    #[arg(short, long, value_name = "LEVEL")]
    log_level: Option<String>,

    /// Write logs to this file instead of the default
    #[arg(long, value_name = "PATH")]
    log_file: Option<PathBuf>,
}

/// How long shutdown waits for blocking tasks, such as a pending stdin read
const SHUTDOWN_GRACE: Duration = Duration::from_millis(500);

fn main() -> Result<()> {
    let args = Args::parse();
    block_on_then_shutdown(run(args))?
}

/// Run `future` on a multi-thread runtime, then shut the runtime down
/// without waiting on blocking tasks for longer than [`SHUTDOWN_GRACE`]
fn block_on_then_shutdown<F: Future>(future: F) -> Result<F::Output> {
    let runtime = tokio::runtime::Builder::new_multi_thread()
        .enable_all()
        .build()
        .context("Failed to start the async runtime")?;
    let output = runtime.block_on(future);
    runtime.shutdown_timeout(SHUTDOWN_GRACE);
    Ok(output)
}

async fn run(args: Args) -> Result<()> {

    if args.save_config {
        let config = PanelConfig::default();
        let path = PanelConfig::default_path();
        config.save(&path).context("Failed to save configuration")?;
        println!("Configuration saved to: {}", path.display());
        return Ok(());
    }

    let config = load_config(&args)?;
    let headless = config.panel.headless || args.list_devices;

    // The TUI owns the terminal, so it logs to a file unless told otherwise
    let log_file = config
        .log_file_path()
        .or_else(|| (!headless).then(default_log_file).flatten());
    setup_logging(&config.panel.log_level, log_file.as_deref())
        .context("Failed to setup logging")?;

    info!("usb-panel v{}", env!("CARGO_PKG_VERSION"));
    info!("Log level: {}", config.panel.log_level);

    let (usb_bridge, worker) = create_usb_bridge();
    let usb_worker_handle = spawn_usb_worker(worker, config.usb.permitted.clone())
        .context("Failed to spawn USB worker thread")?;

    let result = if args.list_devices {
        list_devices_mode(&usb_bridge).await
    } else {
        let panel = Panel::new(Arc::new(usb_bridge.clone()), config.transfer_timeout());
        let hotplug = spawn_hotplug_pump(panel.clone(), usb_bridge.clone());

        let result = if headless {
            info!("Running headless");
            run_headless(panel.clone(), &config).await
        } else {
            info!("Running in TUI mode (interactive)");
            run_tui(panel.clone(), &config).await
        };

        hotplug.abort();
        panel.shutdown().await;
        result
    };

    info!("Shutting down USB subsystem...");
    if let Err(e) = usb_bridge.shutdown().await {
        error!("Error shutting down USB worker: {:#}", e);
    }
    match usb_worker_handle.join() {
        Ok(Ok(())) => {}
        Ok(Err(e)) => error!("USB worker exited with error: {}", e),
        Err(e) => error!("USB worker thread panicked: {:?}", e),
    }

    result
}

/// Load the config file and apply command line overrides
fn load_config(args: &Args) -> Result<PanelConfig> {
    let mut config = match &args.config {
        Some(path) => {
            PanelConfig::load(Some(path.clone())).context("Failed to load configuration")?
        }
        None => PanelConfig::load_or_default(),
    };

    if args.headless {
        config.panel.headless = true;
    }
    if let Some(transport) = args.relay {
        config.relay.transport = transport;
    }
    if let Some(listen) = &args.listen {
        config.relay.listen = listen.clone();
    }
    if let Some(level) = &args.log_level {
        validate_log_level(level)?;
        config.panel.log_level = level.clone();
    }
    if let Some(path) = &args.log_file {
        config.panel.log_file = Some(path.to_string_lossy().into_owned());
    }

    config.validate().context("Invalid configuration")?;
    Ok(config)
}

fn default_log_file() -> Option<PathBuf> {
    dirs::data_local_dir().map(|dir| dir.join("usb-panel").join("panel.log"))
}

/// Forward hotplug events from the USB thread to the panel
fn spawn_hotplug_pump(panel: Panel<UsbBridge>, usb_bridge: UsbBridge) -> JoinHandle<()> {
    tokio::spawn(async move {
        loop {
            match usb_bridge.recv_event().await {
                Ok(event) => panel.handle_usb_event(event).await,
                Err(e) => {
                    warn!("USB event channel closed: {}", e);
                    break;
                }
            }
        }
    })
}

/// List attached USB devices and exit
async fn list_devices_mode(usb_bridge: &UsbBridge) -> Result<()> {
    let devices = usb_bridge
        .request_candidates()
        .await
        .context("Failed to list USB devices")?;
    let granted = usb_bridge
        .list_devices()
        .await
        .context("Failed to list permitted devices")?;

    if devices.is_empty() {
        println!("No USB devices found.");
        return Ok(());
    }

    println!("Found {} USB device(s):\n", devices.len());
    for device in devices {
        let permitted = granted.iter().any(|g| g.id == device.id);
        println!(
            "  [{}] {:04x}:{:04x} - {} {}{}",
            device.id,
            device.vendor_id,
            device.product_id,
            device
                .manufacturer_name
                .as_deref()
                .unwrap_or("Unknown Manufacturer"),
            device.display_name(),
            if permitted { " (permitted)" } else { "" }
        );
        if let Some(serial) = &device.serial_number {
            println!("      Serial: {}", serial);
        }
    }

    Ok(())
}

/// Serve `transport` in the background until `shutdown` fires
fn spawn_relay(
    panel: Panel<UsbBridge>,
    transport: RelayTransport,
    config: &PanelConfig,
    shutdown: CancellationToken,
) -> Result<JoinHandle<Result<()>>> {
    let task = match transport {
        RelayTransport::Stdio => tokio::spawn(relay::serve_stdio(panel, shutdown)),
        RelayTransport::Tcp => {
            let listen = config.listen_addr()?;
            tokio::spawn(relay::serve_tcp(panel, listen, shutdown))
        }
        RelayTransport::None => tokio::spawn(async { Ok(()) }),
    };
    Ok(task)
}

/// Relay only, until Ctrl+C or the host closes stdio
async fn run_headless(panel: Panel<UsbBridge>, config: &PanelConfig) -> Result<()> {
    panel.refresh_directory().await;

    let transport = config.relay.transport;
    let shutdown = CancellationToken::new();
    let mut relay_task = spawn_relay(panel, transport, config, shutdown.clone())?;

    info!("Press Ctrl+C to shutdown");
    let finished = tokio::select! {
        result = signal::ctrl_c() => {
            if let Err(e) = result {
                error!("Error waiting for Ctrl+C: {}", e);
            }
            info!("Received Ctrl+C, shutting down gracefully...");
            None
        }
        result = &mut relay_task, if transport != RelayTransport::None => Some(result),
    };

    let result = match finished {
        Some(result) => result,
        None => {
            shutdown.cancel();
            relay_task.await
        }
    };
    result.context("Relay task panicked")?
}

/// Run the TUI with the relay in the background
async fn run_tui(panel: Panel<UsbBridge>, config: &PanelConfig) -> Result<()> {
    let transport = match config.relay.transport {
        RelayTransport::Stdio => {
            warn!("stdio relay is unavailable while the TUI owns the terminal");
            RelayTransport::None
        }
        other => other,
    };
    let shutdown = CancellationToken::new();
    let relay_task = spawn_relay(panel.clone(), transport, config, shutdown.clone())?;

    let tui_result = tui::run(panel).await;

    shutdown.cancel();
    match relay_task.await {
        Ok(Ok(())) => {}
        Ok(Err(e)) => error!("Relay error: {:#}", e),
        Err(e) => error!("Relay task panicked: {}", e),
    }

    tui_result
}

#[cfg(test)]
mod tests {
    use super::*;
    use std::time::Instant;

    #[test]
    fn test_shutdown_does_not_wait_for_blocked_reads() {
        let started = Instant::now();
        let output = block_on_then_shutdown(async {
            tokio::task::spawn_blocking(|| std::thread::sleep(Duration::from_secs(30)));
            7
        })
        .unwrap();

        assert_eq!(output, 7);
        assert!(started.elapsed() < Duration::from_secs(5));
    }

    #[test]
    fn test_args_parse_relay_flags() {
        let args = Args::try_parse_from(["usb-panel", "--headless", "--relay", "tcp"]).unwrap();
        assert!(args.headless);
        assert_eq!(args.relay, Some(RelayTransport::Tcp));
    }
}
