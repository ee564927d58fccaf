//! Session lifecycle state machine.
//!
//! Owns the transport connection, drives the six-message handshake, and
//! keeps the session alive across alerts and link drops. Structured as an
//! explicit state enum rather than a reactive stream, with a background
//! `tokio::spawn` + `tokio::select!` loop for inbound dispatch and
//! `tracing::info!`/`warn!` at every state transition.

use crate::config::SupervisorConfig;
use crate::error::Error;
use crate::external::{Keystore, SignedTimeProvider};
use crate::frame::{Frame, FrameKind};
use crate::listener::{AddModeConnectionListener, ConnectionListener};
use crate::mux::CommandMux;
use crate::session::{SecureSession, SessionState};
use keylink_crypto::{DeviceCertificate, HandshakeConfig};
use keylink_transport::{CharacteristicId, Connection, DeviceHandle, Transport};
use rand::rngs::OsRng;
use std::sync::{Arc, Mutex as StdMutex};
use std::time::Duration;
use tokio::sync::{mpsc, Mutex as AsyncMutex};
use tokio_util::sync::CancellationToken;

/// Either capability a [`SessionSupervisor`] dispatches connection
/// callbacks through, depending on whether it was built with
/// [`SessionSupervisor::new`] (secure mode) or
/// [`SessionSupervisor::new_add_mode`] (add-lock mode).
enum ListenerKind {
    Secure(Arc<dyn ConnectionListener>),
    AddMode(Arc<dyn AddModeConnectionListener>),
}

impl ListenerKind {
    fn on_connection_changed(&self, connecting: bool, connected: bool) {
        match self {
            Self::Secure(l) => l.on_connection_changed(connecting, connected),
            Self::AddMode(l) => l.on_unsecure_connection_changed(connecting, connected),
        }
    }

    fn on_lock_status_changed(&self, state: u8, status: u8) {
        match self {
            Self::Secure(l) => l.on_lock_status_changed(state, status),
            Self::AddMode(l) => l.on_lock_status_changed(state, status),
        }
    }

    fn on_notification(&self, bytes: &[u8]) {
        match self {
            Self::Secure(l) => l.on_notification(bytes),
            Self::AddMode(l) => l.on_notification(bytes),
        }
    }

    fn on_error(&self, error: &Error) {
        match self {
            Self::Secure(l) => l.on_error(error),
            Self::AddMode(l) => l.on_error(error),
        }
    }
}

/// Alert codes carried in an `ALERT` frame body's first byte.
/// Values beyond `NO_TRUSTED_TIME` are fixed per device firmware; this crate
/// only distinguishes the four named here.
pub mod alert_code {
    /// The device certificate failed verification. Non-retryable.
    pub const INVALID_CERT: u8 = 0x01;
    /// The device has no trusted time anchor; begin signed-time refresh.
    pub const NO_TRUSTED_TIME: u8 = 0x02;
    /// This mobile identity is not registered with the device. Non-retryable.
    pub const NOT_REGISTERED: u8 = 0x03;
    /// The device gave up waiting for the next handshake message.
    pub const TIMEOUT: u8 = 0x04;
}

/// `SET_SIGNED_TIME` is sent plaintext over the lock notification
/// characteristic; the device's asynchronous ack for it shares this command
/// byte with its own async notification type.
pub const SET_SIGNED_TIME: u8 = 0x7B;
/// A lock-side notification that trusted time has been lost mid-session and
/// should be refreshed without tearing the session down.
pub const NOTIFICATION_NEED_DATE_TIME: u8 = 0x7C;
/// A lock-side notification reporting `(state, status)` for
/// [`ConnectionListener::on_lock_status_changed`].
pub const NOTIFICATION_LOCK_STATUS_CHANGE: u8 = 0xBA;

/// Lifecycle state of a [`SessionSupervisor`].
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum SupervisorState {
    /// No transport connection exists.
    Disconnected,
    /// Scanning for the device by serial.
    Scanning,
    /// Device found; establishing the GATT connection and characteristics.
    Linking,
    /// GATT link is up; running the secure handshake.
    Handshaking,
    /// An `ALERT:NoTrustedTime` paused the handshake for a signed-time
    /// refresh.
    RefreshingTime,
    /// Add-lock mode: link is up with no session encryption.
    ReadyUnsecure,
    /// Handshake complete; the session accepts commands.
    Ready,
    /// Torn down by `disconnect()`/`clear()`, or a non-retryable alert.
    Closed,
}

struct Inner {
    config: SupervisorConfig,
    transport: Arc<dyn Transport>,
    keystore: Arc<dyn Keystore>,
    signed_time: Arc<dyn SignedTimeProvider>,
    listener: ListenerKind,
    mux: Arc<CommandMux>,
    state: StdMutex<SupervisorState>,
    session: AsyncMutex<Option<SecureSession>>,
    connection: AsyncMutex<Option<Box<dyn Connection>>>,
}

/// Drives a single device's connection lifecycle: scan, link, handshake,
/// alert recovery, and inbound dispatch.
#[derive(Clone)]
pub struct SessionSupervisor {
    inner: Arc<Inner>,
}

impl SessionSupervisor {
    /// Build a supervisor. Returns the supervisor and the [`CommandMux`]
    /// [`crate::api::LockApi`] issues requests through.
    #[must_use]
    pub fn new(
        config: SupervisorConfig,
        transport: Arc<dyn Transport>,
        keystore: Arc<dyn Keystore>,
        signed_time: Arc<dyn SignedTimeProvider>,
        listener: Arc<dyn ConnectionListener>,
    ) -> (Self, Arc<CommandMux>) {
        Self::build(config, transport, keystore, signed_time, ListenerKind::Secure(listener))
    }

    /// Build a supervisor for add-lock mode: [`Self::connect_unsecured`]
    /// reaches [`SupervisorState::ReadyUnsecure`] without ever running the
    /// secure handshake, and callbacks go through
    /// [`AddModeConnectionListener`] instead.
    #[must_use]
    pub fn new_add_mode(
        config: SupervisorConfig,
        transport: Arc<dyn Transport>,
        keystore: Arc<dyn Keystore>,
        signed_time: Arc<dyn SignedTimeProvider>,
        listener: Arc<dyn AddModeConnectionListener>,
    ) -> (Self, Arc<CommandMux>) {
        Self::build(config, transport, keystore, signed_time, ListenerKind::AddMode(listener))
    }

    fn build(
        config: SupervisorConfig,
        transport: Arc<dyn Transport>,
        keystore: Arc<dyn Keystore>,
        signed_time: Arc<dyn SignedTimeProvider>,
        listener: ListenerKind,
    ) -> (Self, Arc<CommandMux>) {
        let mux = Arc::new(CommandMux::new());
        let inner = Arc::new(Inner {
            config,
            transport,
            keystore,
            signed_time,
            listener,
            mux: mux.clone(),
            state: StdMutex::new(SupervisorState::Disconnected),
            session: AsyncMutex::new(None),
            connection: AsyncMutex::new(None),
        });
        (Self { inner }, mux)
    }

    /// Current lifecycle state.
    #[must_use]
    pub fn state(&self) -> SupervisorState {
        *self.inner.state.lock().unwrap()
    }

    fn set_state(&self, new_state: SupervisorState) {
        let mut state = self.inner.state.lock().unwrap();
        tracing::info!(?new_state, previous = ?*state, "supervisor state transition");
        *state = new_state;
    }

    /// Connect to the device identified by `serial` and run the secure
    /// handshake using `certificate`. On success the state is `Ready` and
    /// the background inbound dispatch task is running.
    ///
    /// `cancel` tears down this in-flight connect attempt — scanning,
    /// linking, or handshaking — without affecting any session this
    /// supervisor already established; it has no effect once `Ready`.
    ///
    /// # Errors
    ///
    /// Returns [`Error::DeviceNotFound`] if scanning exhausts its retry
    /// budget, a [`Error::Transport`] error if linking fails,
    /// [`Error::Crypto`]/[`Error::NoSignedTime`] if the handshake cannot
    /// complete, or [`Error::Cancelled`] if `cancel` fires first.
    pub async fn connect(
        &self,
        serial: &str,
        certificate: DeviceCertificate,
        cancel: &CancellationToken,
    ) -> Result<(), Error> {
        self.set_state(SupervisorState::Scanning);
        self.inner.listener.on_connection_changed(true, false);

        let device = self.scan(serial, cancel).await?;

        self.set_state(SupervisorState::Linking);
        let mut connection = self.inner.transport.connect(&device).await?;
        connection.request_high_priority().await;
        let mut streams = connection.setup_notifications().await?;
        *self.inner.connection.lock().await = Some(connection);

        self.set_state(SupervisorState::Handshaking);
        self.run_handshake(certificate, &mut streams.secure_notify, cancel)
            .await?;

        self.set_state(SupervisorState::Ready);
        self.inner.listener.on_connection_changed(false, true);

        let supervisor = self.clone();
        tokio::spawn(async move {
            supervisor
                .inbound_loop(streams.lock_indicate, streams.lock_notify)
                .await;
        });

        Ok(())
    }

    /// Connect in add-lock mode: scan and link exactly as [`Self::connect`]
    /// does, but skip the secure handshake entirely. On success the state
    /// is `ReadyUnsecure` and the inbound dispatch task is running,
    /// handling plaintext `DataNotEncrypted` frames without a live session.
    ///
    /// # Errors
    ///
    /// Returns [`Error::DeviceNotFound`] if scanning exhausts its retry
    /// budget, a [`Error::Transport`] error if linking fails, or
    /// [`Error::Cancelled`] if `cancel` fires first.
    pub async fn connect_unsecured(
        &self,
        serial: &str,
        cancel: &CancellationToken,
    ) -> Result<(), Error> {
        self.set_state(SupervisorState::Scanning);
        self.inner.listener.on_connection_changed(true, false);

        let device = self.scan(serial, cancel).await?;

        self.set_state(SupervisorState::Linking);
        let mut connection = self.inner.transport.connect(&device).await?;
        connection.request_high_priority().await;
        let streams = connection.setup_notifications().await?;
        *self.inner.connection.lock().await = Some(connection);

        self.set_state(SupervisorState::ReadyUnsecure);
        self.inner.listener.on_connection_changed(false, true);

        let supervisor = self.clone();
        tokio::spawn(async move {
            supervisor
                .inbound_loop(streams.lock_indicate, streams.lock_notify)
                .await;
        });

        Ok(())
    }

    async fn scan(&self, serial: &str, cancel: &CancellationToken) -> Result<DeviceHandle, Error> {
        let keep_connection = self.inner.config.keep_connection;
        let policy = keylink_transport::RetryPolicy::new(keep_connection);
        let mut attempts = 0u32;
        loop {
            if cancel.is_cancelled() {
                return Err(Error::Cancelled);
            }
            match self
                .inner
                .transport
                .scan_for(serial, keep_connection)
                .await
            {
                Ok(device) => return Ok(device),
                Err(err) if policy.should_retry(attempts, &err) => {
                    attempts += 1;
                    tracing::warn!(attempts, error = %err, "scan failed, retrying");
                    tokio::select! {
                        () = tokio::time::sleep(keylink_transport::RetryPolicy::delay_for(&err)) => {}
                        () = cancel.cancelled() => return Err(Error::Cancelled),
                    }
                }
                Err(err) => return Err(Error::Transport(err)),
            }
        }
    }

    /// Drive the handshake to completion, handling `ALERT:NoTrustedTime` by
    /// pausing for a signed-time refresh and `ALERT:Timeout` by resending
    /// the client hello.
    async fn run_handshake(
        &self,
        certificate: DeviceCertificate,
        secure_notify: &mut mpsc::Receiver<Vec<u8>>,
        cancel: &CancellationToken,
    ) -> Result<(), Error> {
        let mut session = SecureSession::new(certificate, HandshakeConfig::default());
        let hello_ack_timeout = self.inner.config.timeouts.hello_ack;

        loop {
            let hello = session.start(&mut OsRng)?;
            self.write_plaintext(CharacteristicId::Send, hello).await?;

            let bytes = match self
                .recv_with_timeout(secure_notify, hello_ack_timeout, cancel)
                .await?
            {
                Some(bytes) => bytes,
                None => {
                    tracing::warn!("no server hello within hello-ack timeout, resending");
                    continue;
                }
            };
            let frame = Frame::parse(&bytes)?;

            match frame.kind {
                FrameKind::Alert => {
                    self.handle_handshake_alert(&mut session, &frame.body, cancel)
                        .await?;
                }
                FrameKind::Hello => {
                    self.run_verify_exchange(&mut session, &frame.body, secure_notify, cancel)
                        .await?;
                    *self.inner.session.lock().await = Some(session);
                    return Ok(());
                }
                other => {
                    tracing::warn!(?other, "unexpected frame kind awaiting server hello");
                    return Err(Error::Crypto(keylink_crypto::CryptoError::InvalidHandshakeState));
                }
            }
        }
    }

    /// Handle an `ALERT` frame received while handshaking. Returns on
    /// success for retryable alerts (the caller's loop resends the hello);
    /// non-retryable alerts return `Err` and have already closed the
    /// session and reported to the listener.
    async fn handle_handshake_alert(
        &self,
        session: &mut SecureSession,
        body: &[u8],
        cancel: &CancellationToken,
    ) -> Result<(), Error> {
        let code = *body.first().unwrap_or(&0);
        match code {
            alert_code::NO_TRUSTED_TIME => {
                self.set_state(SupervisorState::RefreshingTime);
                self.refresh_signed_time(cancel).await?;
                self.set_state(SupervisorState::Handshaking);
                Ok(())
            }
            alert_code::TIMEOUT => {
                tracing::info!("device reported handshake timeout, resending hello");
                Ok(())
            }
            alert_code::INVALID_CERT => {
                session.close();
                self.set_state(SupervisorState::Closed);
                self.inner.listener.on_error(&Error::InvalidCertificate);
                Err(Error::InvalidCertificate)
            }
            alert_code::NOT_REGISTERED => {
                session.close();
                self.set_state(SupervisorState::Closed);
                self.inner.listener.on_error(&Error::DeviceNotInitialized);
                Err(Error::DeviceNotInitialized)
            }
            other => {
                tracing::warn!(alert = other, "unrecognized alert code during handshake");
                Err(Error::Crypto(keylink_crypto::CryptoError::InvalidHandshakeState))
            }
        }
    }

    async fn run_verify_exchange(
        &self,
        session: &mut SecureSession,
        server_hello_body: &[u8],
        secure_notify: &mut mpsc::Receiver<Vec<u8>>,
        cancel: &CancellationToken,
    ) -> Result<(), Error> {
        let now = now_unix_millis();
        let client_verify_seed = session.receive_server_hello(server_hello_body, now)?;
        self.write_plaintext(CharacteristicId::Send, client_verify_seed)
            .await?;

        let server_verify_timeout = self.inner.config.timeouts.hello_ack;
        let server_verify_bytes = self
            .recv_with_timeout(secure_notify, server_verify_timeout, cancel)
            .await?
            .ok_or(Error::Timeout(FrameKind::ServerVerify as u8))?;
        let server_verify_frame = Frame::parse(&server_verify_bytes)?;

        let client_verify_frames = session.receive_server_verify(&server_verify_frame.body)?;
        for frame in client_verify_frames {
            self.write_plaintext(CharacteristicId::Send, frame).await?;
        }

        let session_initialized_bytes = self
            .recv_with_timeout(secure_notify, server_verify_timeout, cancel)
            .await?
            .ok_or(Error::Timeout(FrameKind::SessionInitialized as u8))?;
        let session_initialized_frame = Frame::parse(&session_initialized_bytes)?;
        session.receive_session_initialized(&session_initialized_frame.body)?;
        Ok(())
    }

    /// Waits up to `timeout` for the next frame, racing `cancel`.
    /// `Ok(None)` means the timeout elapsed with nothing received (the
    /// hello-ack case, where the caller resends rather than erroring).
    async fn recv_with_timeout(
        &self,
        rx: &mut mpsc::Receiver<Vec<u8>>,
        timeout: Duration,
        cancel: &CancellationToken,
    ) -> Result<Option<Vec<u8>>, Error> {
        tokio::select! {
            result = tokio::time::timeout(timeout, rx.recv()) => Ok(result.ok().flatten()),
            () = cancel.cancelled() => Err(Error::Cancelled),
        }
    }

    /// Invoke the signed-time provider and push the result to the device,
    /// retrying up to `retries.signed_time_max_attempts` times with
    /// `timeouts.signed_time_retry_spacing` between attempts. Gives up
    /// silently on exhaustion: the caller (handshake or notification
    /// handler) is already on an alerted connection that will either
    /// recover or be re-established.
    ///
    /// `cancel` only governs this call's own wait for the device's ack;
    /// background callers (triggered from a notification/alert handler,
    /// not tied to any caller's suspension point) pass a fresh token that
    /// is never cancelled.
    pub(crate) async fn refresh_signed_time(&self, cancel: &CancellationToken) -> Result<(), Error> {
        let signed_time = self
            .inner
            .signed_time
            .get_signed_time()
            .await
            .ok_or(Error::NotProvidedSignedTime)?;

        let payload = {
            let mut bytes = Vec::new();
            bytes.extend_from_slice(signed_time.datetime_b64.as_bytes());
            bytes.push(b':');
            bytes.extend_from_slice(signed_time.signature_b64.as_bytes());
            bytes
        };

        let max_attempts = self.inner.config.retries.signed_time_max_attempts;
        let spacing = self.inner.config.timeouts.signed_time_retry_spacing;

        // The device acknowledges SET_SIGNED_TIME asynchronously over the
        // notify characteristic (NOTIFICATION_SIGNED_DATETIME), not as an
        // indication response, so this waits on the notification bus
        // rather than `CommandMux::request`. The subscription is taken
        // before each write to avoid missing an ack that arrives first.
        for attempt in 0..max_attempts {
            if cancel.is_cancelled() {
                return Err(Error::Cancelled);
            }
            let mut notify_rx = self.inner.mux.subscribe_notifications();
            let frame_bytes = Frame::build(FrameKind::DataNotEncrypted, &payload);
            self.write_plaintext(CharacteristicId::LockNotify, frame_bytes)
                .await?;

            let wait = tokio::time::timeout(spacing, async {
                loop {
                    match notify_rx.recv().await {
                        Ok((kind, body)) if kind == SET_SIGNED_TIME => {
                            return Some(*body.first().unwrap_or(&0xFF));
                        }
                        Ok(_) => continue,
                        Err(_) => return None,
                    }
                }
            });
            let ack = tokio::select! {
                result = wait => result.ok().flatten(),
                () = cancel.cancelled() => return Err(Error::Cancelled),
            };

            match ack {
                Some(0x00) => return Ok(()),
                _ if attempt + 1 < max_attempts => {
                    tracing::warn!(attempt, "signed time rejected or timed out, retrying");
                }
                _ => {
                    tracing::warn!("signed time refresh exhausted its retry budget");
                    return Err(Error::NoSignedTime);
                }
            }
        }
        Err(Error::NoSignedTime)
    }

    /// Background task: decrypt and demultiplex frames from the lock
    /// indication and notification characteristics for the lifetime of the
    /// session.
    async fn inbound_loop(
        &self,
        mut lock_indicate: mpsc::Receiver<Vec<u8>>,
        mut lock_notify: mpsc::Receiver<Vec<u8>>,
    ) {
        loop {
            tokio::select! {
                indication = lock_indicate.recv() => {
                    match indication {
                        Some(bytes) => self.handle_inbound(bytes, true).await,
                        None => {
                            tracing::warn!("lock indication stream closed, link is down");
                            self.handle_link_down().await;
                            return;
                        }
                    }
                }
                notification = lock_notify.recv() => {
                    match notification {
                        Some(bytes) => self.handle_inbound(bytes, false).await,
                        None => {
                            tracing::warn!("lock notification stream closed, link is down");
                            self.handle_link_down().await;
                            return;
                        }
                    }
                }
            }
        }
    }

    async fn handle_inbound(&self, bytes: Vec<u8>, is_indication: bool) {
        let frame = match Frame::parse(&bytes) {
            Ok(frame) => frame,
            Err(err) => {
                tracing::warn!(error = %err, "dropping unparseable inbound frame");
                return;
            }
        };

        if frame.kind == FrameKind::Alert {
            self.handle_session_alert(&frame.body).await;
            return;
        }

        // `DataNotEncrypted` (e.g. the SET_SIGNED_TIME ack) needs no live
        // session, so add-lock-mode connections (which never have one) can
        // still dispatch it.
        if frame.kind == FrameKind::DataNotEncrypted {
            let mut body = frame.body.iter();
            let command = *body.next().unwrap_or(&0);
            let payload = body.copied().collect();
            if is_indication {
                self.inner.mux.dispatch_indication(command, payload);
            } else {
                self.dispatch_notification(command, payload).await;
            }
            return;
        }

        let decrypted = {
            let mut guard = self.inner.session.lock().await;
            let Some(session) = guard.as_mut() else {
                return;
            };
            match frame.kind {
                FrameKind::DataEncrypted => session.decrypt(&frame.body),
                _ => return,
            }
        };

        let Ok((command, payload)) = decrypted else {
            tracing::warn!("decrypt failed, session closed");
            self.set_state(SupervisorState::Closed);
            self.inner.listener.on_error(&Error::InvalidCertificate);
            return;
        };

        if is_indication {
            self.inner.mux.dispatch_indication(command, payload);
        } else {
            self.dispatch_notification(command, payload).await;
        }
    }

    async fn dispatch_notification(&self, notification_type: u8, payload: Vec<u8>) {
        match notification_type {
            NOTIFICATION_LOCK_STATUS_CHANGE => {
                let state = *payload.first().unwrap_or(&0);
                let status = *payload.get(1).unwrap_or(&0);
                self.inner.listener.on_lock_status_changed(state, status);
            }
            NOTIFICATION_NEED_DATE_TIME => {
                let supervisor = self.clone();
                tokio::spawn(async move {
                    if let Err(err) = supervisor.refresh_signed_time(&CancellationToken::new()).await {
                        supervisor.inner.listener.on_error(&err);
                    }
                });
            }
            _ => {
                let mut bytes = vec![notification_type];
                bytes.extend_from_slice(&payload);
                self.inner.listener.on_notification(&bytes);
            }
        }
        self.inner.mux.dispatch_notification(notification_type, payload);
    }

    async fn handle_session_alert(&self, body: &[u8]) {
        let code = *body.first().unwrap_or(&0);
        if code == alert_code::NO_TRUSTED_TIME {
            let supervisor = self.clone();
            tokio::spawn(async move {
                if let Err(err) = supervisor.refresh_signed_time(&CancellationToken::new()).await {
                    supervisor.inner.listener.on_error(&err);
                }
            });
        } else {
            tracing::warn!(alert = code, "unhandled alert during ready session");
        }
    }

    async fn handle_link_down(&self) {
        *self.inner.connection.lock().await = None;
        *self.inner.session.lock().await = None;
        self.set_state(SupervisorState::Linking);
        self.inner.listener.on_connection_changed(false, false);
    }

    /// Write to the given characteristic through the current connection.
    pub(crate) async fn write_plaintext(
        &self,
        characteristic: CharacteristicId,
        bytes: Vec<u8>,
    ) -> Result<(), Error> {
        let guard = self.inner.connection.lock().await;
        let connection = guard.as_ref().ok_or(Error::ConnectionDead(
            "no active connection".to_string(),
        ))?;
        connection.write(characteristic, bytes).await?;
        Ok(())
    }

    /// Encrypt and write a `(command, payload)` message over the lock
    /// indication characteristic.
    pub(crate) async fn write_encrypted(&self, command: u8, payload: &[u8]) -> Result<(), Error> {
        let mut guard = self.inner.session.lock().await;
        let session = guard
            .as_mut()
            .ok_or_else(|| Error::ConnectionDead("no active session".to_string()))?;
        if session.state() != SessionState::Ready {
            return Err(Error::ConnectionDead("session not ready".to_string()));
        }
        let frame = session.encrypt(command, payload)?;
        drop(guard);
        self.write_plaintext(CharacteristicId::LockIndicate, frame)
            .await
    }

    /// Write a `(command, payload)` message, encrypting it if a secure
    /// session is `Ready`, or framing it as plaintext `DataNotEncrypted`
    /// over `LockIndicate` otherwise. Lets operations meaningful in
    /// add-lock mode (currently just `REGISTER_DEVICE`) share one call site
    /// with their secure-mode counterpart.
    pub(crate) async fn write_command(&self, command: u8, payload: &[u8]) -> Result<(), Error> {
        let is_ready = {
            let guard = self.inner.session.lock().await;
            guard.as_ref().is_some_and(|s| s.state() == SessionState::Ready)
        };
        if is_ready {
            return self.write_encrypted(command, payload).await;
        }
        let mut bytes = vec![command];
        bytes.extend_from_slice(payload);
        let frame = Frame::build(FrameKind::DataNotEncrypted, &bytes);
        self.write_plaintext(CharacteristicId::LockIndicate, frame)
            .await
    }

    /// The command mux this supervisor's inbound loop dispatches into.
    pub(crate) fn mux(&self) -> Arc<CommandMux> {
        self.inner.mux.clone()
    }

    /// Give the registered keystore's public key, for `REGISTER_DEVICE`
    /// flows run by [`crate::api::LockApi`].
    pub(crate) fn keystore(&self) -> Arc<dyn Keystore> {
        self.inner.keystore.clone()
    }

    /// Timeouts and retry budgets configured for this supervisor.
    #[must_use]
    pub fn config(&self) -> SupervisorConfig {
        self.inner.config
    }

    /// Tear the session and connection down unconditionally. Valid from any
    /// state; always leaves the supervisor in `Closed`.
    pub async fn disconnect(&self) {
        if let Some(connection) = self.inner.connection.lock().await.take() {
            let _ = connection.close().await;
        }
        if let Some(mut session) = self.inner.session.lock().await.take() {
            session.close();
        }
        self.set_state(SupervisorState::Closed);
        self.inner.listener.on_connection_changed(false, false);
    }
}

fn now_unix_millis() -> u64 {
    use std::time::{SystemTime, UNIX_EPOCH};
    SystemTime::now()
        .duration_since(UNIX_EPOCH)
        .map(|d| d.as_millis() as u64)
        .unwrap_or(0)
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::external::{KeyPair, SignedTime};
    use crate::listener::AddModeConnectionListener;
    use async_trait::async_trait;
    use base64::Engine;
    use ed25519_dalek::{Signer, SigningKey};
    use keylink_crypto::PrivateKey;
    use keylink_transport::{LoopbackHandle, LoopbackTransport};
    use std::sync::Mutex as StdSyncMutex;

    #[test]
    fn alert_codes_are_distinct() {
        let codes = [
            alert_code::INVALID_CERT,
            alert_code::NO_TRUSTED_TIME,
            alert_code::NOT_REGISTERED,
            alert_code::TIMEOUT,
        ];
        for (i, a) in codes.iter().enumerate() {
            for (j, b) in codes.iter().enumerate() {
                if i != j {
                    assert_ne!(a, b);
                }
            }
        }
    }

    fn certificate() -> (DeviceCertificate, SigningKey) {
        let signing_key = SigningKey::generate(&mut OsRng);
        let cert_b64 = base64::engine::general_purpose::STANDARD.encode(b"cert");
        let cert = DeviceCertificate::new(&cert_b64, signing_key.verifying_key().as_bytes()).unwrap();
        (cert, signing_key)
    }

    fn device() -> DeviceHandle {
        DeviceHandle {
            serial: "12345678-123456".to_string(),
            service_uuid: "0000-ABCDEF-12345678123456".to_string(),
        }
    }

    struct TestKeystore;

    #[async_trait]
    impl Keystore for TestKeystore {
        async fn get_mobile_key_pair(&self) -> Option<KeyPair> {
            Some(KeyPair { public_key: [0x11; 32] })
        }

        async fn sign(&self, _message: &[u8]) -> Option<[u8; 64]> {
            Some([0x22; 64])
        }
    }

    struct TestSignedTimeProvider;

    #[async_trait]
    impl SignedTimeProvider for TestSignedTimeProvider {
        async fn get_signed_time(&self) -> Option<SignedTime> {
            Some(SignedTime {
                datetime_b64: "ZGF0ZQ==".to_string(),
                signature_b64: "c2ln".to_string(),
            })
        }
    }

    #[derive(Default)]
    struct RecordingListener {
        events: StdSyncMutex<Vec<String>>,
    }

    impl RecordingListener {
        fn saw(&self, needle: &str) -> bool {
            self.events.lock().unwrap().iter().any(|e| e.contains(needle))
        }
    }

    impl ConnectionListener for RecordingListener {
        fn on_connection_changed(&self, connecting: bool, connected: bool) {
            self.events
                .lock()
                .unwrap()
                .push(format!("connection_changed({connecting},{connected})"));
        }

        fn on_lock_status_changed(&self, state: u8, status: u8) {
            self.events
                .lock()
                .unwrap()
                .push(format!("lock_status({state},{status})"));
        }

        fn on_notification(&self, bytes: &[u8]) {
            self.events.lock().unwrap().push(format!("notification({bytes:?})"));
        }

        fn on_error(&self, error: &Error) {
            self.events.lock().unwrap().push(format!("error({error})"));
        }
    }

    impl AddModeConnectionListener for RecordingListener {
        fn on_unsecure_connection_changed(&self, connecting: bool, connected: bool) {
            self.events
                .lock()
                .unwrap()
                .push(format!("unsecure_connection_changed({connecting},{connected})"));
        }

        fn on_lock_status_changed(&self, state: u8, status: u8) {
            self.events
                .lock()
                .unwrap()
                .push(format!("lock_status({state},{status})"));
        }

        fn on_notification(&self, bytes: &[u8]) {
            self.events.lock().unwrap().push(format!("notification({bytes:?})"));
        }

        fn on_error(&self, error: &Error) {
            self.events.lock().unwrap().push(format!("error({error})"));
        }
    }

    fn build_supervisor(
        listener: Arc<RecordingListener>,
    ) -> (SessionSupervisor, Arc<CommandMux>, LoopbackHandle) {
        let (transport, handle) = LoopbackTransport::new(device());
        let (supervisor, mux) = SessionSupervisor::new(
            SupervisorConfig::default(),
            Arc::new(transport),
            Arc::new(TestKeystore),
            Arc::new(TestSignedTimeProvider),
            listener,
        );
        (supervisor, mux, handle)
    }

    /// Drives the device side of the six-message handshake against the
    /// client bytes written to `handle`, the same transcript construction
    /// `crate::session`'s own handshake test uses.
    async fn play_device_handshake(handle: &mut LoopbackHandle, device_signing_key: &SigningKey) {
        let (_, client_hello) = handle.outbound_rx.recv().await.unwrap();
        assert_eq!(client_hello[0], FrameKind::Hello as u8);

        let server_ephemeral = PrivateKey::generate(&mut OsRng);
        let server_hello_body = server_ephemeral.public_key().to_bytes();
        handle
            .secure_notify_tx
            .send(Frame::build(FrameKind::Hello, &server_hello_body))
            .await
            .unwrap();

        let (_, server_verify_bytes) = handle.outbound_rx.recv().await.unwrap();
        assert_eq!(server_verify_bytes[0], FrameKind::ServerVerify as u8);

        let mut transcript = client_hello[1..].to_vec();
        transcript.extend_from_slice(&server_hello_body);
        transcript.extend_from_slice(&server_verify_bytes[1..]);
        let signature = device_signing_key.sign(&transcript);
        handle
            .secure_notify_tx
            .send(Frame::build(FrameKind::ServerVerify, &signature.to_bytes()))
            .await
            .unwrap();

        loop {
            let (_, frame_bytes) = handle.outbound_rx.recv().await.unwrap();
            let is_end = frame_bytes[0] == FrameKind::ClientVerifyEnd as u8;
            if is_end {
                break;
            }
        }

        handle
            .secure_notify_tx
            .send(Frame::build(FrameKind::SessionInitialized, b"session-params"))
            .await
            .unwrap();
    }

    #[tokio::test]
    async fn connect_drives_full_handshake_to_ready() {
        let listener = Arc::new(RecordingListener::default());
        let (supervisor, _mux, mut handle) = build_supervisor(listener.clone());
        let (cert, device_signing_key) = certificate();

        let connecting = supervisor.clone();
        let connect_task = tokio::spawn(async move {
            connecting
                .connect("12345678-123456", cert, &CancellationToken::new())
                .await
        });

        play_device_handshake(&mut handle, &device_signing_key).await;

        connect_task.await.unwrap().unwrap();
        assert_eq!(supervisor.state(), SupervisorState::Ready);
        assert!(listener.saw("connection_changed(false,true)"));
    }

    #[tokio::test]
    async fn connect_surfaces_not_registered_alert_as_terminal_error() {
        let listener = Arc::new(RecordingListener::default());
        let (supervisor, _mux, mut handle) = build_supervisor(listener.clone());
        let (cert, _) = certificate();

        let connecting = supervisor.clone();
        let connect_task = tokio::spawn(async move {
            connecting
                .connect("12345678-123456", cert, &CancellationToken::new())
                .await
        });

        let (_, _client_hello) = handle.outbound_rx.recv().await.unwrap();
        handle
            .secure_notify_tx
            .send(Frame::build(FrameKind::Alert, &[alert_code::NOT_REGISTERED]))
            .await
            .unwrap();

        let result = connect_task.await.unwrap();
        assert!(matches!(result, Err(Error::DeviceNotInitialized)));
        assert_eq!(supervisor.state(), SupervisorState::Closed);
        assert!(listener.saw("error(device not initialized)"));
    }

    #[tokio::test]
    async fn cancelling_connect_before_scan_returns_cancelled() {
        let listener = Arc::new(RecordingListener::default());
        let (supervisor, _mux, _handle) = build_supervisor(listener);
        let (cert, _) = certificate();

        let cancel = CancellationToken::new();
        cancel.cancel();

        let result = supervisor.connect("12345678-123456", cert, &cancel).await;
        assert!(matches!(result, Err(Error::Cancelled)));
    }

    #[tokio::test]
    async fn connect_unsecured_reaches_ready_unsecure_and_register_device_writes_plaintext() {
        let listener = Arc::new(RecordingListener::default());
        let (transport, mut handle) = LoopbackTransport::new(device());
        let (supervisor, _mux) = SessionSupervisor::new_add_mode(
            SupervisorConfig::default(),
            Arc::new(transport),
            Arc::new(TestKeystore),
            Arc::new(TestSignedTimeProvider),
            listener.clone(),
        );

        supervisor
            .connect_unsecured("12345678-123456", &CancellationToken::new())
            .await
            .unwrap();
        assert_eq!(supervisor.state(), SupervisorState::ReadyUnsecure);
        assert!(listener.saw("unsecure_connection_changed(false,true)"));

        // REGISTER_DEVICE has no secure session to encrypt through yet;
        // `write_command` must fall back to a plaintext DataNotEncrypted
        // frame rather than failing outright.
        supervisor
            .write_command(0x76, &[0xAA, 0xBB])
            .await
            .unwrap();
        let (characteristic, bytes) = handle.outbound_rx.recv().await.unwrap();
        assert_eq!(characteristic, CharacteristicId::LockIndicate);
        assert_eq!(bytes[0], FrameKind::DataNotEncrypted as u8);
        assert_eq!(&bytes[1..], &[0x76, 0xAA, 0xBB]);
    }

    #[tokio::test]
    async fn disconnect_tears_down_connection_and_session() {
        let listener = Arc::new(RecordingListener::default());
        let (supervisor, _mux, mut handle) = build_supervisor(listener.clone());
        let (cert, device_signing_key) = certificate();

        let connecting = supervisor.clone();
        let connect_task = tokio::spawn(async move {
            connecting
                .connect("12345678-123456", cert, &CancellationToken::new())
                .await
        });
        play_device_handshake(&mut handle, &device_signing_key).await;
        connect_task.await.unwrap().unwrap();

        supervisor.disconnect().await;
        assert_eq!(supervisor.state(), SupervisorState::Closed);
        assert!(listener.saw("connection_changed(false,false)"));
    }
}
