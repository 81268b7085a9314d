//! Transfer gateway
//!
//! Raw bulk/interrupt transfers on the opened device, each bounded by a
//! timeout. When the bound elapses the transfer's cancellation token fires
//! and the caller gets [`PanelError::Timeout`]. The backend receives the same
//! bound as its own transfer timeout, so a transfer already running in the
//! platform ends on its own shortly after.

use crate::error::{PanelError, Result};
use common::DeviceBackend;
use protocol::{DeviceHandle, MAX_TRANSFER_SIZE, UsbError};
use std::future::Future;
use std::sync::Arc;
use std::time::Duration;
use tokio_util::sync::CancellationToken;
use tracing::{debug, warn};

/// Bound applied to host-initiated transfers
pub const DEFAULT_TRANSFER_TIMEOUT: Duration = Duration::from_secs(3);

pub struct TransferGateway<B> {
    backend: Arc<B>,
}

impl<B> Clone for TransferGateway<B> {
    fn clone(&self) -> Self {
        Self {
            backend: Arc::clone(&self.backend),
        }
    }
}

impl<B: DeviceBackend> TransferGateway<B> {
    pub fn new(backend: Arc<B>) -> Self {
        Self { backend }
    }

    /// Write `data` to OUT endpoint number `endpoint`
    pub async fn transfer_out(
        &self,
        handle: DeviceHandle,
        endpoint: u8,
        data: Vec<u8>,
        timeout: Duration,
    ) -> Result<()> {
        debug!("transfer_out ep={} len={}", endpoint, data.len());
        let cancel = CancellationToken::new();
        let transfer = self
            .backend
            .transfer_out(handle, endpoint, data, timeout, cancel.clone());
        bounded(timeout, cancel, transfer).await
    }

    /// Read up to `length` bytes from IN endpoint number `endpoint`
    ///
    /// `length` is capped at [`MAX_TRANSFER_SIZE`].
    pub async fn transfer_in(
        &self,
        handle: DeviceHandle,
        endpoint: u8,
        length: usize,
        timeout: Duration,
    ) -> Result<Vec<u8>> {
        debug!("transfer_in ep={} len={}", endpoint, length);
        if length > MAX_TRANSFER_SIZE {
            return Err(PanelError::TransferTooLarge {
                length,
                max: MAX_TRANSFER_SIZE,
            });
        }
        let cancel = CancellationToken::new();
        let transfer = self
            .backend
            .transfer_in(handle, endpoint, length, timeout, cancel.clone());
        bounded(timeout, cancel, transfer).await
    }
}

/// Race `operation` against `timeout`, cancelling `cancel` if time runs out
pub async fn bounded<T, F>(timeout: Duration, cancel: CancellationToken, operation: F) -> Result<T>
where
    F: Future<Output = std::result::Result<T, UsbError>>,
{
    tokio::select! {
        result = operation => result.map_err(PanelError::from),
        _ = tokio::time::sleep(timeout) => {
            cancel.cancel();
            warn!("Transfer exceeded {:?}, cancelled", timeout);
            Err(PanelError::Timeout { seconds: timeout.as_secs() })
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use common::test_utils::{MockBackend, MockCall, mock_device};

    async fn claimed_backend() -> (Arc<MockBackend>, DeviceHandle) {
        let backend = Arc::new(MockBackend::new().with_device(mock_device(1, 2, None, 1)));
        let handle = backend.open(&"1-2".into()).await.unwrap();
        backend.claim_interface(handle, 0).await.unwrap();
        (backend, handle)
    }

    #[tokio::test]
    async fn test_transfer_out_completes() {
        let (backend, handle) = claimed_backend().await;
        let gateway = TransferGateway::new(Arc::clone(&backend));

        gateway
            .transfer_out(handle, 1, vec![1, 2, 3], DEFAULT_TRANSFER_TIMEOUT)
            .await
            .unwrap();
        assert_eq!(backend.writes(), vec![(1, vec![1, 2, 3])]);
    }

    #[tokio::test]
    async fn test_transfer_in_returns_data() {
        let (backend, handle) = claimed_backend().await;
        backend.queue_in(1, vec![5, 6]);
        let gateway = TransferGateway::new(backend);

        let data = gateway
            .transfer_in(handle, 1, 64, DEFAULT_TRANSFER_TIMEOUT)
            .await
            .unwrap();
        assert_eq!(data, vec![5, 6]);
    }

    #[tokio::test]
    async fn test_platform_error_passes_through() {
        let (backend, handle) = claimed_backend().await;
        let gateway = TransferGateway::new(backend);

        let err = gateway
            .transfer_in(handle, 9, 8, DEFAULT_TRANSFER_TIMEOUT)
            .await
            .unwrap_err();
        assert_eq!(err, PanelError::Usb(UsbError::NotFound));
    }

    #[tokio::test]
    async fn test_oversized_transfer_in_never_reaches_backend() {
        let (backend, handle) = claimed_backend().await;
        let gateway = TransferGateway::new(Arc::clone(&backend));

        let err = gateway
            .transfer_in(handle, 1, 1 << 40, DEFAULT_TRANSFER_TIMEOUT)
            .await
            .unwrap_err();
        assert_eq!(
            err,
            PanelError::TransferTooLarge {
                length: 1 << 40,
                max: MAX_TRANSFER_SIZE,
            }
        );
        assert!(
            !backend
                .calls()
                .iter()
                .any(|call| matches!(call, MockCall::TransferIn { .. }))
        );

        backend.queue_in(1, vec![7; MAX_TRANSFER_SIZE]);
        let data = gateway
            .transfer_in(handle, 1, MAX_TRANSFER_SIZE, DEFAULT_TRANSFER_TIMEOUT)
            .await
            .unwrap();
        assert_eq!(data.len(), MAX_TRANSFER_SIZE);
    }

    #[tokio::test(start_paused = true)]
    async fn test_hanging_transfer_times_out_and_is_cancelled() {
        let (backend, handle) = claimed_backend().await;
        backend.hang_transfers(true);
        let gateway = TransferGateway::new(Arc::clone(&backend));

        let err = gateway
            .transfer_out(handle, 1, vec![0xff], DEFAULT_TRANSFER_TIMEOUT)
            .await
            .unwrap_err();
        assert_eq!(err, PanelError::Timeout { seconds: 3 });
        assert_eq!(err.to_string(), "Operation timed out after 3 seconds");
        assert!(backend.writes().is_empty());
    }

    #[tokio::test(start_paused = true)]
    async fn test_bounded_fires_token() {
        let cancel = CancellationToken::new();
        let never = std::future::pending::<std::result::Result<(), UsbError>>();

        let err = bounded(Duration::from_secs(1), cancel.clone(), never)
            .await
            .unwrap_err();
        assert_eq!(err, PanelError::Timeout { seconds: 1 });
        assert!(cancel.is_cancelled());
    }

    #[tokio::test(start_paused = true)]
    async fn test_slow_transfer_within_bound_succeeds() {
        let (backend, handle) = claimed_backend().await;
        backend.set_transfer_delay(Some(Duration::from_secs(2)));
        let gateway = TransferGateway::new(backend);

        gateway
            .transfer_out(handle, 1, vec![1], DEFAULT_TRANSFER_TIMEOUT)
            .await
            .unwrap();
    }
}
