//! Connection listener capabilities.
//!
//! Listener presence is modeled at the type level — distinct traits for
//! secure mode and add-lock mode — rather than nullable callback fields
//! the supervisor would otherwise have to null-check at every callback
//! site. Callbacks are plain synchronous methods: the supervisor
//! dispatches them on the user-facing context, never from inside the
//! I/O task.

use crate::error::Error;

/// Connection listener for a secure-mode session.
pub trait ConnectionListener: Send + Sync {
    /// The underlying link's connecting/connected state changed.
    fn on_connection_changed(&self, connecting: bool, connected: bool);

    /// A `NOTIFICATION_LOCK_STATUS_CHANGE` was received.
    fn on_lock_status_changed(&self, state: u8, status: u8);

    /// Any other notification arrived; `bytes` is the full
    /// `(type, payload...)` body.
    fn on_notification(&self, bytes: &[u8]);

    /// A non-retryable or surfaced error occurred.
    fn on_error(&self, error: &Error);
}

/// Connection listener for add-lock mode.
///
/// Identical to [`ConnectionListener`] except the connection-state
/// callback is named for the fact that the link carries no session
/// encryption in this mode.
pub trait AddModeConnectionListener: Send + Sync {
    /// The underlying (unsecured) link's connecting/connected state
    /// changed.
    fn on_unsecure_connection_changed(&self, connecting: bool, connected: bool);

    /// A `NOTIFICATION_LOCK_STATUS_CHANGE` was received.
    fn on_lock_status_changed(&self, state: u8, status: u8);

    /// Any other notification arrived.
    fn on_notification(&self, bytes: &[u8]);

    /// A non-retryable or surfaced error occurred.
    fn on_error(&self, error: &Error);
}
