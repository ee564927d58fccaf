//! In-memory [`Transport`] double for tests.
//!
//! Test-only scaffolding, not a feature: it lets `keylink-core` tests drive
//! the supervisor/session/mux stack without a real radio, the way the
//! pack's other crates use fake transports and mock sessions in their own
//! test modules.

use crate::error::{TransportError, TransportResult};
use crate::transport::{CharacteristicId, Connection, DeviceHandle, NotificationStreams, Transport};
use crate::discovery;
use async_trait::async_trait;
use tokio::sync::{mpsc, Mutex};

struct ConnectionChannels {
    secure_notify_rx: mpsc::Receiver<Vec<u8>>,
    lock_notify_rx: mpsc::Receiver<Vec<u8>>,
    lock_indicate_rx: mpsc::Receiver<Vec<u8>>,
    outbound_tx: mpsc::UnboundedSender<(CharacteristicId, Vec<u8>)>,
}

/// Test-side handle for driving a [`LoopbackTransport`]: inject inbound
/// frames on any of the three characteristics, and observe outbound
/// writes.
pub struct LoopbackHandle {
    /// Feed bytes as if they arrived on the secure-notify characteristic.
    pub secure_notify_tx: mpsc::Sender<Vec<u8>>,
    /// Feed bytes as if they arrived on the lock-notify characteristic.
    pub lock_notify_tx: mpsc::Sender<Vec<u8>>,
    /// Feed bytes as if they arrived on the lock-indicate characteristic.
    pub lock_indicate_tx: mpsc::Sender<Vec<u8>>,
    /// Observe writes the system under test issued.
    pub outbound_rx: mpsc::UnboundedReceiver<(CharacteristicId, Vec<u8>)>,
}

/// A [`Transport`] backed entirely by in-process channels.
pub struct LoopbackTransport {
    device: DeviceHandle,
    inner: Mutex<Option<ConnectionChannels>>,
}

impl LoopbackTransport {
    /// Build a loopback transport that will report `device` as found and
    /// return a handle for driving the single connection it permits.
    #[must_use]
    pub fn new(device: DeviceHandle) -> (Self, LoopbackHandle) {
        let (secure_notify_tx, secure_notify_rx) = mpsc::channel(32);
        let (lock_notify_tx, lock_notify_rx) = mpsc::channel(32);
        let (lock_indicate_tx, lock_indicate_rx) = mpsc::channel(32);
        let (outbound_tx, outbound_rx) = mpsc::unbounded_channel();

        let transport = Self {
            device,
            inner: Mutex::new(Some(ConnectionChannels {
                secure_notify_rx,
                lock_notify_rx,
                lock_indicate_rx,
                outbound_tx,
            })),
        };
        let handle = LoopbackHandle {
            secure_notify_tx,
            lock_notify_tx,
            lock_indicate_tx,
            outbound_rx,
        };
        (transport, handle)
    }
}

#[async_trait]
impl Transport for LoopbackTransport {
    async fn scan_for(&self, serial: &str, _keep_connection: bool) -> TransportResult<DeviceHandle> {
        if discovery::serial_matches(&self.device.service_uuid, serial) {
            Ok(self.device.clone())
        } else {
            Err(TransportError::DeviceNotFound)
        }
    }

    async fn connect(&self, _device: &DeviceHandle) -> TransportResult<Box<dyn Connection>> {
        let channels = self
            .inner
            .lock()
            .await
            .take()
            .ok_or(TransportError::Closed)?;
        Ok(Box::new(LoopbackConnection {
            outbound_tx: channels.outbound_tx,
            secure_notify_rx: Some(channels.secure_notify_rx),
            lock_notify_rx: Some(channels.lock_notify_rx),
            lock_indicate_rx: Some(channels.lock_indicate_rx),
        }))
    }
}

struct LoopbackConnection {
    outbound_tx: mpsc::UnboundedSender<(CharacteristicId, Vec<u8>)>,
    secure_notify_rx: Option<mpsc::Receiver<Vec<u8>>>,
    lock_notify_rx: Option<mpsc::Receiver<Vec<u8>>>,
    lock_indicate_rx: Option<mpsc::Receiver<Vec<u8>>>,
}

#[async_trait]
impl Connection for LoopbackConnection {
    async fn request_high_priority(&self) {}

    async fn setup_notifications(&mut self) -> TransportResult<NotificationStreams> {
        Ok(NotificationStreams {
            secure_notify: self.secure_notify_rx.take().ok_or(TransportError::NotReady)?,
            lock_notify: self.lock_notify_rx.take().ok_or(TransportError::NotReady)?,
            lock_indicate: self.lock_indicate_rx.take().ok_or(TransportError::NotReady)?,
        })
    }

    async fn write(&self, characteristic: CharacteristicId, bytes: Vec<u8>) -> TransportResult<()> {
        self.outbound_tx
            .send((characteristic, bytes))
            .map_err(|_| TransportError::Closed)
    }

    async fn close(&self) -> TransportResult<()> {
        Ok(())
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    fn device() -> DeviceHandle {
        DeviceHandle {
            serial: "12345678-123456".to_string(),
            service_uuid: "0000-ABCDEF-12345678123456".to_string(),
        }
    }

    #[tokio::test]
    async fn scan_for_matches_configured_device() {
        let (transport, _handle) = LoopbackTransport::new(device());
        let found = transport.scan_for("12345678-123456", false).await.unwrap();
        assert_eq!(found.serial, "12345678-123456");
    }

    #[tokio::test]
    async fn scan_for_rejects_wrong_serial() {
        let (transport, _handle) = LoopbackTransport::new(device());
        let result = transport.scan_for("00000000-000000", false).await;
        assert!(matches!(result, Err(TransportError::DeviceNotFound)));
    }

    #[tokio::test]
    async fn connect_then_write_is_observed_by_handle() {
        let (transport, mut handle) = LoopbackTransport::new(device());
        let found = transport.scan_for("12345678-123456", false).await.unwrap();
        let connection = transport.connect(&found).await.unwrap();

        connection
            .write(CharacteristicId::Send, vec![0x01, 0x02])
            .await
            .unwrap();

        let (characteristic, bytes) = handle.outbound_rx.recv().await.unwrap();
        assert_eq!(characteristic, CharacteristicId::Send);
        assert_eq!(bytes, vec![0x01, 0x02]);
    }

    #[tokio::test]
    async fn injected_notification_is_observed_on_stream() {
        let (transport, handle) = LoopbackTransport::new(device());
        let found = transport.scan_for("12345678-123456", false).await.unwrap();
        let mut connection = transport.connect(&found).await.unwrap();
        let mut streams = connection.setup_notifications().await.unwrap();

        handle
            .lock_notify_tx
            .send(vec![0xAA, 0xBB])
            .await
            .unwrap();

        let received = streams.lock_notify.recv().await.unwrap();
        assert_eq!(received, vec![0xAA, 0xBB]);
    }

    #[tokio::test]
    async fn second_connect_fails_after_connection_taken() {
        let (transport, _handle) = LoopbackTransport::new(device());
        let found = transport.scan_for("12345678-123456", false).await.unwrap();
        let _first = transport.connect(&found).await.unwrap();
        let second = transport.connect(&found).await;
        assert!(matches!(second, Err(TransportError::Closed)));
    }
}
