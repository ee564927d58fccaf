//! Aggregated error taxonomy.
//!
//! `LockError` covers the per-operation result-code mapping table;
//! `Error` is the top-level error surfaced to callers of `LockApi` and to
//! `on_error`, aggregating `LockError` with transport, crypto, and frame
//! failures.

use thiserror::Error;

/// Result-code-driven errors from a single lock operation.
#[derive(Debug, Error, Clone, PartialEq, Eq)]
pub enum LockError {
    /// Result code `0x01`.
    #[error("invalid parameter")]
    InvalidParam,

    /// Result code `0x02` on a signature request.
    #[error("request signature failed")]
    RequestSignatureError,

    /// Result code `0x02` on `SET_SIGNED_TIME`.
    #[error("set signed time failed")]
    SetSignedTimeError,

    /// Result code `0x02` on `REGISTER_DEVICE`.
    #[error("register device failed")]
    RegisterDeviceError,

    /// Result code `0x05`.
    #[error("lock not calibrated")]
    NotCalibrated,

    /// Result code `0x06`.
    #[error("unlock already called by auto-unlock")]
    AutoUnlockAlreadyCalled,

    /// Result code `0x07`; `from_old_version` is always `true`.
    #[error("device needs reset (from old version: {from_old_version})")]
    DeviceNeedsReset {
        /// Whether this reset condition was flagged as coming from an old
        /// firmware version.
        from_old_version: bool,
    },

    /// Result code `0x08`.
    #[error("lock not configured")]
    NotConfigured,

    /// Result code `0x09`.
    #[error("lock dismounted")]
    Dismounted,

    /// Result code `0x0A`.
    #[error("unlock already called by another caller")]
    UnlockAlreadyCalled,

    /// Any unrecognized result code.
    #[error("general lock error: code 0x{0:02X}")]
    GeneralLockError(u8),

    /// Raised by `wait_for_lock_status_change` on a `JAMMED` status byte.
    #[error("lock jammed")]
    LockJammed,

    /// Raised by `wait_for_lock_status_change` on a `TIMEOUT` status byte.
    #[error("lock not responding")]
    LockNotResponding,
}

/// The op-specific error to use when a result code of `0x02` (`ERROR`) is
/// received; distinct operations mean distinct failure semantics even
/// though the wire code is shared.
#[derive(Debug, Clone, Copy)]
pub enum ErrorCodeOp {
    /// `REQUEST_SIGNED_SERIAL`.
    RequestSignature,
    /// `SET_SIGNED_TIME`.
    SetSignedTime,
    /// `REGISTER_DEVICE`.
    RegisterDevice,
    /// Any other operation; `0x02` maps to `GeneralLockError(0x02)`.
    General,
}

/// Map a result code (the byte at index 1 of an indication response) to an
/// outcome.
///
/// `Ok(false)` signals `BUSY` (`0x03`): callers retry rather than treating
/// this as terminal. `Ok(true)` signals `SUCCESS`.
pub fn map_result_code(code: u8, op: ErrorCodeOp) -> Result<bool, LockError> {
    match code {
        0x00 => Ok(true),
        0x01 => Err(LockError::InvalidParam),
        0x02 => Err(match op {
            ErrorCodeOp::RequestSignature => LockError::RequestSignatureError,
            ErrorCodeOp::SetSignedTime => LockError::SetSignedTimeError,
            ErrorCodeOp::RegisterDevice => LockError::RegisterDeviceError,
            ErrorCodeOp::General => LockError::GeneralLockError(code),
        }),
        0x03 => Ok(false),
        0x05 => Err(LockError::NotCalibrated),
        0x06 => Err(LockError::AutoUnlockAlreadyCalled),
        0x07 => Err(LockError::DeviceNeedsReset {
            from_old_version: true,
        }),
        0x08 => Err(LockError::NotConfigured),
        0x09 => Err(LockError::Dismounted),
        0x0A => Err(LockError::UnlockAlreadyCalled),
        other => Err(LockError::GeneralLockError(other)),
    }
}

/// Top-level error surfaced to callers of `LockApi` and to `on_error`.
#[derive(Debug, Error)]
pub enum Error {
    /// The platform's Bluetooth radio is disabled. Non-retryable.
    #[error("bluetooth is disabled")]
    BluetoothDisabled,

    /// Required platform permissions were not granted. Non-retryable.
    #[error("missing permissions: {0:?}")]
    NoPermissions(Vec<String>),

    /// `serial` was not a well-formed `NNNNNNNN-NNNNNN` identifier.
    #[error("invalid serial number: {0}")]
    InvalidSerial(String),

    /// Scan completed without finding the requested device.
    #[error("device not found")]
    DeviceNotFound,

    /// Connection setup's retry budget was exhausted.
    #[error("connection dead: {0}")]
    ConnectionDead(String),

    /// The device's certificate failed verification during handshake.
    /// Non-retryable.
    #[error("invalid device certificate")]
    InvalidCertificate,

    /// No trusted signed time is available after the retry budget for a
    /// signed-time refresh was exhausted.
    #[error("no trusted signed time available")]
    NoSignedTime,

    /// The device reported it has not completed initial setup.
    /// Non-retryable.
    #[error("device not initialized")]
    DeviceNotInitialized,

    /// A per-operation result-code error.
    #[error("lock operation failed: {0}")]
    Lock(#[from] LockError),

    /// A `request`/`await_notification` call exceeded its timeout.
    #[error("operation timed out waiting for command 0x{0:02X}")]
    Timeout(u8),

    /// A notification wait exceeded its timeout without a matching
    /// command byte.
    #[error("notification wait timed out")]
    NotificationTimeout,

    /// No connection listener was registered to receive a required
    /// callback.
    #[error("no wrapper listener registered")]
    NoWrapperListener,

    /// The signed-time provider callback completed without ever invoking
    /// its result callback.
    #[error("signed time provider did not supply a signed time")]
    NotProvidedSignedTime,

    /// A transport-layer failure.
    #[error(transparent)]
    Transport(#[from] keylink_transport::TransportError),

    /// A cryptographic failure (handshake or AEAD).
    #[error(transparent)]
    Crypto(#[from] keylink_crypto::CryptoError),

    /// A malformed frame header.
    #[error(transparent)]
    Frame(#[from] crate::frame::FrameError),

    /// The in-flight operation was cancelled by its caller.
    #[error("operation was cancelled")]
    Cancelled,
}
