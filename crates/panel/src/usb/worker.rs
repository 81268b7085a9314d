//! USB worker thread
//!
//! Dedicated thread that owns the libusb context. It answers commands from
//! the Tokio runtime and runs `handle_events` between them so hotplug
//! callbacks fire.

use crate::usb::manager::DeviceManager;
use common::{UsbCommand, UsbWorker};
use protocol::UsbError;
use rusb::UsbContext;
use std::time::Duration;
use tracing::{debug, error, info, warn};

/// How long one `handle_events` call may block
const EVENT_POLL_INTERVAL: Duration = Duration::from_millis(100);

pub struct UsbWorkerThread {
    manager: DeviceManager,
    worker: UsbWorker,
}

impl UsbWorkerThread {
    pub fn new(worker: UsbWorker, permitted_filters: Vec<String>) -> Result<Self, rusb::Error> {
        let mut manager = DeviceManager::new(worker.event_tx.clone(), permitted_filters)?;
        manager.initialize()?;
        Ok(Self { manager, worker })
    }

    /// Run until a Shutdown command arrives or every bridge is dropped
    pub fn run(mut self) -> Result<(), rusb::Error> {
        info!("USB worker thread started");

        loop {
            match self.worker.try_recv_command() {
                Some(UsbCommand::Shutdown) => {
                    info!("USB worker shutting down");
                    break;
                }
                Some(cmd) => {
                    self.handle_command(cmd);
                    // Drain queued commands before polling again
                    continue;
                }
                None if self.worker.is_closed() => {
                    info!("USB bridge closed, stopping worker");
                    break;
                }
                None => {}
            }

            match self.manager.context().handle_events(Some(EVENT_POLL_INTERVAL)) {
                Ok(()) => {}
                Err(rusb::Error::Interrupted) => {
                    debug!("USB event handling interrupted");
                }
                Err(e) => {
                    warn!("Error handling USB events: {}", e);
                    std::thread::sleep(EVENT_POLL_INTERVAL);
                }
            }

            self.manager.process_hotplug();
        }

        info!("USB worker thread stopped");
        Ok(())
    }

    fn handle_command(&mut self, cmd: UsbCommand) {
        // A panic must not take the USB thread down
        let result = std::panic::catch_unwind(std::panic::AssertUnwindSafe(|| {
            self.handle_command_inner(cmd)
        }));

        if let Err(e) = result {
            error!("Panic in USB command handler: {:?}", e);
        }
    }

    fn handle_command_inner(&mut self, cmd: UsbCommand) {
        match cmd {
            UsbCommand::ListDevices { response } => {
                let devices = self.manager.list_devices();
                debug!("Listing {} granted devices", devices.len());
                let _ = response.send(Ok(devices));
            }

            UsbCommand::RequestCandidates { response } => {
                let _ = response.send(Ok(self.manager.request_candidates()));
            }

            UsbCommand::Grant { id, response } => {
                let _ = response.send(self.manager.grant(&id));
            }

            UsbCommand::Open { id, response } => {
                debug!("Opening {}", id);
                let _ = response.send(self.manager.open(&id));
            }

            UsbCommand::Close { handle, response } => {
                debug!("Closing handle {:?}", handle);
                let _ = response.send(self.manager.close(handle));
            }

            UsbCommand::SelectConfiguration {
                handle,
                value,
                response,
            } => {
                let _ = response.send(self.manager.select_configuration(handle, value));
            }

            UsbCommand::ClaimInterface {
                handle,
                interface,
                response,
            } => {
                let _ = response.send(self.manager.claim_interface(handle, interface));
            }

            UsbCommand::ReleaseInterface {
                handle,
                interface,
                response,
            } => {
                let _ = response.send(self.manager.release_interface(handle, interface));
            }

            UsbCommand::Describe { handle, response } => {
                let _ = response.send(self.manager.describe(handle));
            }

            UsbCommand::TransferOut {
                handle,
                endpoint,
                data,
                timeout,
                cancel,
                response,
            } => {
                let result = if cancel.is_cancelled() {
                    debug!("Skipping cancelled OUT transfer on endpoint {}", endpoint);
                    Err(UsbError::Cancelled)
                } else {
                    self.manager.transfer_out(handle, endpoint, &data, timeout)
                };
                let _ = response.send(result);
            }

            UsbCommand::TransferIn {
                handle,
                endpoint,
                length,
                timeout,
                cancel,
                response,
            } => {
                let result = if cancel.is_cancelled() {
                    debug!("Skipping cancelled IN transfer on endpoint {}", endpoint);
                    Err(UsbError::Cancelled)
                } else {
                    self.manager.transfer_in(handle, endpoint, length, timeout)
                };
                let _ = response.send(result);
            }

            UsbCommand::Shutdown => {
                // Handled by the run loop
            }
        }
    }
}

/// Spawn the USB worker thread
///
/// The thread runs until a Shutdown command is received, the bridge is
/// dropped, or libusb fails to initialize.
pub fn spawn_usb_worker(
    worker: UsbWorker,
    permitted_filters: Vec<String>,
) -> std::io::Result<std::thread::JoinHandle<Result<(), rusb::Error>>> {
    std::thread::Builder::new()
        .name("usb-worker".to_string())
        .spawn(move || {
            let worker_thread = UsbWorkerThread::new(worker, permitted_filters)?;
            worker_thread.run()
        })
}

#[cfg(test)]
mod tests {
    use super::*;
    use common::create_usb_bridge;

    #[test]
    fn test_usb_worker_creation() {
        let (_bridge, worker) = create_usb_bridge();

        // Context creation fails without USB access; both outcomes are fine
        if let Err(e) = UsbWorkerThread::new(worker, vec![]) {
            eprintln!("USB worker creation failed (expected without permissions): {}", e);
        }
    }

    #[test]
    fn test_worker_stops_on_shutdown() {
        let (bridge, worker) = create_usb_bridge();
        let Ok(thread) = UsbWorkerThread::new(worker, vec![]) else {
            return;
        };

        let runtime = tokio::runtime::Builder::new_current_thread()
            .build()
            .unwrap();
        runtime.block_on(bridge.shutdown()).unwrap();
        assert!(thread.run().is_ok());
    }
}
