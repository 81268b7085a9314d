//! Raw endpoint transfers
//!
//! Endpoints are addressed by number; the direction bit comes from the
//! endpoint descriptor. Bulk and interrupt endpoints are supported.

use protocol::{EndpointDescription, EndpointType, MAX_TRANSFER_SIZE, UsbError};
use rusb::{Context, DeviceHandle as RusbHandle};
use std::time::Duration;
use tracing::{debug, warn};

/// Write `data` to an OUT endpoint
pub fn write(
    handle: &RusbHandle<Context>,
    endpoint: &EndpointDescription,
    data: &[u8],
    timeout: Duration,
) -> Result<(), UsbError> {
    let address = endpoint.address();
    debug!(
        "{:?} OUT: endpoint={:#04x}, len={}, timeout={}ms",
        endpoint.transfer_type,
        address,
        data.len(),
        timeout.as_millis()
    );

    let written = match endpoint.transfer_type {
        EndpointType::Bulk => handle.write_bulk(address, data, timeout),
        EndpointType::Interrupt => handle.write_interrupt(address, data, timeout),
        other => return Err(unsupported(other)),
    }
    .map_err(|e| {
        warn!("OUT transfer on {:#04x} failed: {}", address, e);
        map_rusb_error(e)
    })?;

    check_written(address, written, data.len())
}

/// A write that moved fewer bytes than requested is a failure
fn check_written(address: u8, written: usize, expected: usize) -> Result<(), UsbError> {
    if written < expected {
        warn!("Short write on {:#04x}: {}/{} bytes", address, written, expected);
        return Err(UsbError::Other {
            message: format!("Short write: {} of {} bytes sent", written, expected),
        });
    }
    Ok(())
}

/// Read up to `length` bytes from an IN endpoint
pub fn read(
    handle: &RusbHandle<Context>,
    endpoint: &EndpointDescription,
    length: usize,
    timeout: Duration,
) -> Result<Vec<u8>, UsbError> {
    let address = endpoint.address();
    debug!(
        "{:?} IN: endpoint={:#04x}, len={}, timeout={}ms",
        endpoint.transfer_type,
        address,
        length,
        timeout.as_millis()
    );

    if length > MAX_TRANSFER_SIZE {
        return Err(UsbError::InvalidParam);
    }
    let mut buffer = vec![0u8; length];
    let read = match endpoint.transfer_type {
        EndpointType::Bulk => handle.read_bulk(address, &mut buffer, timeout),
        EndpointType::Interrupt => handle.read_interrupt(address, &mut buffer, timeout),
        other => return Err(unsupported(other)),
    }
    .map_err(|e| {
        warn!("IN transfer on {:#04x} failed: {}", address, e);
        map_rusb_error(e)
    })?;

    buffer.truncate(read);
    Ok(buffer)
}

fn unsupported(transfer_type: EndpointType) -> UsbError {
    UsbError::Other {
        message: format!("{:?} transfers are not supported", transfer_type),
    }
}

/// Map rusb::Error to protocol::UsbError
pub fn map_rusb_error(err: rusb::Error) -> UsbError {
    match err {
        rusb::Error::Timeout => UsbError::Timeout,
        rusb::Error::Pipe => UsbError::Pipe,
        rusb::Error::NoDevice => UsbError::NoDevice,
        rusb::Error::NotFound => UsbError::NotFound,
        rusb::Error::Busy => UsbError::Busy,
        rusb::Error::Overflow => UsbError::Overflow,
        rusb::Error::Io => UsbError::Io,
        rusb::Error::InvalidParam => UsbError::InvalidParam,
        rusb::Error::Access => UsbError::Access,
        _ => UsbError::Other {
            message: err.to_string(),
        },
    }
}
