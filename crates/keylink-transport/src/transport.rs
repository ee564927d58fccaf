//! Transport trait abstraction over the platform BLE stack.
//!
//! A narrow async trait that upper layers depend on, letting the BLE
//! backend (out of scope here) be swapped for a test double.

use crate::error::TransportResult;
use async_trait::async_trait;
use tokio::sync::mpsc;

/// A lock's service UUID and the serial extracted from it.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct DeviceHandle {
    /// The lock's serial number, of the form `NNNNNNNN-NNNNNN`.
    pub serial: String,
    /// The advertised service UUID that matched this serial.
    pub service_uuid: String,
}

/// The four fixed GATT characteristics a lock connection exposes
///.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash)]
pub enum CharacteristicId {
    /// Outbound writes (handshake messages and encrypted/plaintext
    /// commands).
    Send,
    /// Inbound notifications carrying handshake responses.
    SecureNotify,
    /// Inbound indications carrying command responses.
    LockIndicate,
    /// Inbound notifications carrying asynchronous lock events.
    LockNotify,
}

/// The three independent inbound byte streams a connection exposes once
/// notifications are set up.
pub struct NotificationStreams {
    /// Frames from the secure-notify characteristic (handshake traffic).
    pub secure_notify: mpsc::Receiver<Vec<u8>>,
    /// Frames from the lock-notify characteristic (asynchronous events).
    pub lock_notify: mpsc::Receiver<Vec<u8>>,
    /// Frames from the lock-indicate characteristic (command responses).
    pub lock_indicate: mpsc::Receiver<Vec<u8>>,
}

/// A single connection to a discovered lock.
///
/// All writes are serialized per characteristic by the implementation
///; callers may call `write` concurrently from different
/// logical tasks without corrupting the outbound stream.
#[async_trait]
pub trait Connection: Send + Sync {
    /// Request a higher link-layer connection priority, best-effort.
    ///
    /// Implementations apply a short settle delay and an outer timeout and
    /// swallow failures — this is purely an optimization.
    async fn request_high_priority(&self);

    /// Enable notifications/indications on all three inbound
    /// characteristics and return the resulting byte streams. May only be
    /// called once per connection.
    async fn setup_notifications(&mut self) -> TransportResult<NotificationStreams>;

    /// Enqueue an outbound write on the given characteristic.
    async fn write(&self, characteristic: CharacteristicId, bytes: Vec<u8>) -> TransportResult<()>;

    /// Tear down the link.
    async fn close(&self) -> TransportResult<()>;
}

/// Discovers and connects to lock devices.
///
/// Implemented by the platform BLE backend (out of scope here) and by
/// [`crate::loopback::LoopbackTransport`] for tests.
#[async_trait]
pub trait Transport: Send + Sync {
    /// Scan for a lock whose advertised service UUID encodes `serial`
    /// (matched case-insensitively on the last 14 characters).
    ///
    /// If `keep_connection` is `false` the scan is bounded to 30s and a
    /// timeout surfaces as [`crate::error::TransportError::DeviceNotFound`];
    /// otherwise the scan runs unbounded.
    async fn scan_for(&self, serial: &str, keep_connection: bool) -> TransportResult<DeviceHandle>;

    /// Open a link to a previously discovered device.
    async fn connect(&self, device: &DeviceHandle) -> TransportResult<Box<dyn Connection>>;
}
