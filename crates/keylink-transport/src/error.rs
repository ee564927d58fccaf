//! Transport-level error types.

use thiserror::Error;

/// Errors surfaced by the [`crate::transport::Transport`] and
/// [`crate::transport::Connection`] traits.
#[derive(Debug, Error)]
pub enum TransportError {
    /// The platform's BLE stack refused to start a scan because the radio
    /// scheduler is throttled (too many scans started recently).
    #[error("scan throttled by platform BLE stack")]
    ScanThrottled,

    /// Scan completed (or timed out) without finding a matching device.
    #[error("no device found matching serial")]
    DeviceNotFound,

    /// A required GATT characteristic was not present on the connected
    /// device.
    #[error("characteristic not found: {0}")]
    CharacteristicNotFound(&'static str),

    /// The caller lacks a required platform permission (e.g. Bluetooth,
    /// location). Never retried.
    #[error("permission denied: {0}")]
    PermissionDenied(String),

    /// The connection was closed, locally or by the peer.
    #[error("connection closed")]
    Closed,

    /// A write was attempted on a connection that is not yet ready.
    #[error("connection not ready")]
    NotReady,

    /// Catch-all for backend-specific failures (link-layer errors, GATT
    /// error codes not otherwise distinguished).
    #[error("transport error: {0}")]
    Other(String),
}

/// Result alias for transport operations.
pub type TransportResult<T> = Result<T, TransportError>;

impl TransportError {
    /// Whether connection-setup retry policy should retry after this error.
    ///
    /// Permission and not-found-class errors are terminal; everything else
    /// is treated as transient.
    #[must_use]
    pub fn is_retryable(&self) -> bool {
        !matches!(self, TransportError::PermissionDenied(_))
    }
}
