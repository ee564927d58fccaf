//! Typed lock operations.
//!
//! `LockApi` is the user-facing surface: it encrypts a command through the
//! active session, issues it through the supervisor's `CommandMux`, and
//! maps the device's result code to a typed outcome. `BUSY` is retried
//! here, not in `CommandMux`, since the retry budget and opportunistic
//! `GET_STATE` refresh are operation-specific policy, not a mux concern.

use crate::error::{map_result_code, Error, ErrorCodeOp, LockError};
use crate::mux::CommandMux;
use crate::supervisor::{SessionSupervisor, NOTIFICATION_LOCK_STATUS_CHANGE};
use std::time::Duration;
use tokio_util::sync::CancellationToken;

/// Wire command bytes. Fixed per device firmware.
pub mod command {
    /// `CLOSE_LOCK`.
    pub const CLOSE_LOCK: u8 = 0x50;
    /// `OPEN_LOCK`.
    pub const OPEN_LOCK: u8 = 0x51;
    /// `PULL_SPRING`.
    pub const PULL_SPRING: u8 = 0x52;
    /// `GET_STATE`.
    pub const GET_STATE: u8 = 0x56;
    /// `GET_SETTINGS`.
    pub const GET_SETTINGS: u8 = 0x20;
    /// `GET_VERSION`.
    pub const GET_VERSION: u8 = 0x21;
    /// `REQUEST_SIGNED_SERIAL`.
    pub const REQUEST_SIGNED_SERIAL: u8 = 0x74;
    /// `REGISTER_DEVICE`.
    pub const REGISTER_DEVICE: u8 = 0x76;
}

/// Notification type bytes relevant to `LockApi`.
pub mod notification {
    /// Asynchronous delivery of the device's signed serial signature,
    /// following a successful `REQUEST_SIGNED_SERIAL`.
    pub const SIGNED_SERIAL: u8 = 0x7A;
}

/// `param` byte accepted by `OPEN_LOCK`/`CLOSE_LOCK`/`PULL_SPRING`
///.
pub mod param {
    /// No special handling.
    pub const NONE: u8 = 0x00;
    /// Let the device decide automatically.
    pub const AUTO: u8 = 0x01;
    /// Force the operation regardless of the device's current state.
    pub const FORCE: u8 = 0x02;
    /// Skip the spring-pull step.
    pub const WITHOUT_PULL: u8 = 0x03;
}

/// `status` byte accompanying `NOTIFICATION_LOCK_STATUS_CHANGE`
///.
pub mod lock_status {
    /// The requested transition completed normally.
    pub const SUCCESS: u8 = 0x00;
    /// The mechanism is physically obstructed.
    pub const JAMMED: u8 = 0x01;
    /// The device gave up waiting for the mechanism to settle.
    pub const TIMEOUT: u8 = 0x02;
}

/// Parsed `GET_SETTINGS` response.
///
/// The wire order of these fields does not match their declaration order:
/// the flags byte is followed immediately by the four delay fields, with
/// the revision field last. This was resolved against a concrete
/// device-capture byte sequence rather than the field list alone, since the
/// two disagree; see `DESIGN.md`.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub struct DeviceSettings {
    /// Settings schema revision.
    pub revision: u16,
    /// Whether automatic locking on close is enabled.
    pub auto_lock_enabled: bool,
    /// Whether implicit auto-lock (without an explicit close) is enabled.
    pub auto_lock_implicit_enabled: bool,
    /// Whether the spring-pull mechanism is enabled.
    pub pull_spring_enabled: bool,
    /// Whether the spring is pulled automatically after locking.
    pub auto_pull_spring_enabled: bool,
    /// Whether postponed locking is enabled.
    pub postponed_lock_enabled: bool,
    /// Whether the physical button can lock.
    pub button_lock_enabled: bool,
    /// Whether the physical button can unlock.
    pub button_unlock_enabled: bool,
    /// Delay, in seconds, before automatic locking engages.
    pub auto_lock_delay: u16,
    /// Duration, in seconds, the spring-pull motor runs.
    pub pull_spring_duration: u16,
    /// Delay, in seconds, before a postponed lock engages.
    pub postponed_lock_delay: u16,
    /// Delay, in seconds, before implicit auto-lock engages.
    pub auto_lock_implicit_delay: u16,
}

const FLAG_AUTO_LOCK: u8 = 0x80;
const FLAG_AUTO_LOCK_IMPLICIT: u8 = 0x40;
const FLAG_PULL_SPRING: u8 = 0x20;
const FLAG_AUTO_PULL_SPRING: u8 = 0x10;
const FLAG_POSTPONED_LOCK: u8 = 0x08;
const FLAG_BUTTON_LOCK: u8 = 0x04;
const FLAG_BUTTON_UNLOCK: u8 = 0x02;

fn parse_device_settings(body: &[u8]) -> Result<DeviceSettings, Error> {
    if body.len() < 11 {
        return Err(Error::Lock(LockError::GeneralLockError(0xFF)));
    }
    let flags = body[0];
    let auto_lock_delay = u16::from_be_bytes([body[1], body[2]]);
    let pull_spring_duration = u16::from_be_bytes([body[3], body[4]]);
    let postponed_lock_delay = u16::from_be_bytes([body[5], body[6]]);
    let auto_lock_implicit_delay = u16::from_be_bytes([body[7], body[8]]);
    let revision = u16::from_be_bytes([body[9], body[10]]);

    Ok(DeviceSettings {
        revision,
        auto_lock_enabled: flags & FLAG_AUTO_LOCK != 0,
        auto_lock_implicit_enabled: flags & FLAG_AUTO_LOCK_IMPLICIT != 0,
        pull_spring_enabled: flags & FLAG_PULL_SPRING != 0,
        auto_pull_spring_enabled: flags & FLAG_AUTO_PULL_SPRING != 0,
        postponed_lock_enabled: flags & FLAG_POSTPONED_LOCK != 0,
        button_lock_enabled: flags & FLAG_BUTTON_LOCK != 0,
        button_unlock_enabled: flags & FLAG_BUTTON_UNLOCK != 0,
        auto_lock_delay,
        pull_spring_duration,
        postponed_lock_delay,
        auto_lock_implicit_delay,
    })
}

/// Parsed `GET_VERSION` response. The trailing revision byte
/// is discarded; it is not part of the displayed version string.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub struct FirmwareVersion {
    /// Major version.
    pub major: u8,
    /// Minor version.
    pub minor: u8,
    /// Build number.
    pub build: u16,
}

impl std::fmt::Display for FirmwareVersion {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        write!(f, "{}.{}.{}", self.major, self.minor, self.build)
    }
}

fn parse_firmware_version(body: &[u8]) -> Result<FirmwareVersion, Error> {
    if body.len() < 5 {
        return Err(Error::Lock(LockError::GeneralLockError(0xFF)));
    }
    Ok(FirmwareVersion {
        major: body[0],
        minor: body[1],
        build: u16::from_be_bytes([body[2], body[3]]),
    })
}

/// Interpret an indication payload's result code, treating `BUSY` as
/// `Ok(false)` rather than an error so callers can retry.
fn result_code(payload: &[u8], op: ErrorCodeOp) -> Result<bool, Error> {
    Ok(map_result_code(*payload.first().unwrap_or(&0xFF), op)?)
}

/// Wait for a `NOTIFICATION_LOCK_STATUS_CHANGE` whose state byte equals
/// `target_state`, short-circuiting on a jammed or timed-out status.
async fn wait_for_status(
    mux: &CommandMux,
    target_state: u8,
    timeout: Duration,
    cancel: &CancellationToken,
) -> Result<(), Error> {
    let deadline = tokio::time::Instant::now() + timeout;
    loop {
        let remaining = deadline.saturating_duration_since(tokio::time::Instant::now());
        if remaining.is_zero() {
            return Err(Error::NotificationTimeout);
        }
        let payload = mux
            .await_notification(
                NOTIFICATION_LOCK_STATUS_CHANGE,
                remaining,
                None::<fn(&[u8]) -> bool>,
                cancel,
            )
            .await?;
        let state = *payload.first().unwrap_or(&0);
        let status = *payload.get(1).unwrap_or(&0);

        if status == lock_status::JAMMED {
            return Err(Error::Lock(LockError::LockJammed));
        }
        if status == lock_status::TIMEOUT {
            return Err(Error::Lock(LockError::LockNotResponding));
        }
        if state == target_state {
            return Ok(());
        }
    }
}

/// Typed command surface over a connected [`SessionSupervisor`].
#[derive(Clone)]
pub struct LockApi {
    supervisor: SessionSupervisor,
}

impl LockApi {
    /// Build a `LockApi` over an already-connected supervisor.
    #[must_use]
    pub fn new(supervisor: SessionSupervisor) -> Self {
        Self { supervisor }
    }

    /// `OPEN_LOCK`.
    ///
    /// # Errors
    ///
    /// See [`Self::simple_command`].
    pub async fn open(&self, parameter: u8, cancel: &CancellationToken) -> Result<(), Error> {
        self.simple_command(command::OPEN_LOCK, parameter, cancel)
            .await
    }

    /// `CLOSE_LOCK`.
    ///
    /// # Errors
    ///
    /// See [`Self::simple_command`].
    pub async fn close(&self, parameter: u8, cancel: &CancellationToken) -> Result<(), Error> {
        self.simple_command(command::CLOSE_LOCK, parameter, cancel)
            .await
    }

    /// `PULL_SPRING`.
    ///
    /// # Errors
    ///
    /// See [`Self::simple_command`].
    pub async fn pull_spring(&self, parameter: u8, cancel: &CancellationToken) -> Result<(), Error> {
        self.simple_command(command::PULL_SPRING, parameter, cancel)
            .await
    }

    /// Issue a one-byte-parameter command, retrying `BUSY` responses up to
    /// `retries.busy_max_attempts` times spaced `retries.busy_spacing`
    /// apart. On a terminal `GeneralLockError`, opportunistically refreshes
    /// lock state so the caller's next read reflects reality even though
    /// this call failed.
    ///
    /// `cancel` tears down the in-flight request (and any busy-retry wait)
    /// without affecting the underlying session.
    ///
    /// # Errors
    ///
    /// Returns the mapped [`LockError`] on a non-`BUSY`, non-`SUCCESS`
    /// result code, [`Error::Timeout`] if the device never responds, or
    /// [`Error::Cancelled`] if `cancel` fires first.
    async fn simple_command(
        &self,
        command: u8,
        parameter: u8,
        cancel: &CancellationToken,
    ) -> Result<(), Error> {
        let mux = self.supervisor.mux();
        let retries = self.supervisor.config().retries;
        let timeout = self.supervisor.config().timeouts.request;

        for attempt in 0..retries.busy_max_attempts {
            let result = mux
                .request(
                    command,
                    self.supervisor.write_encrypted(command, &[parameter]),
                    |body| result_code(body, ErrorCodeOp::General),
                    timeout,
                    cancel,
                )
                .await;

            match result {
                Ok(true) => return Ok(()),
                Ok(false) => {
                    tracing::info!(command, attempt, "device busy, retrying");
                    tokio::select! {
                        () = tokio::time::sleep(retries.busy_spacing) => {}
                        () = cancel.cancelled() => return Err(Error::Cancelled),
                    }
                }
                Err(err) => {
                    if matches!(err, Error::Lock(LockError::GeneralLockError(_))) {
                        let _ = self.get_state(cancel).await;
                    }
                    return Err(err);
                }
            }
        }
        Err(Error::Lock(LockError::GeneralLockError(0x03)))
    }

    /// `GET_STATE`.
    ///
    /// # Errors
    ///
    /// Returns the mapped [`LockError`] on a non-`SUCCESS` result code, or
    /// [`Error::Cancelled`] if `cancel` fires first.
    pub async fn get_state(&self, cancel: &CancellationToken) -> Result<u8, Error> {
        let mux = self.supervisor.mux();
        let timeout = self.supervisor.config().timeouts.request;
        mux.request(
            command::GET_STATE,
            self.supervisor.write_encrypted(command::GET_STATE, &[]),
            |body| {
                if !result_code(body, ErrorCodeOp::General)? {
                    return Err(Error::Lock(LockError::GeneralLockError(0x03)));
                }
                Ok(*body.get(1).unwrap_or(&0))
            },
            timeout,
            cancel,
        )
        .await
    }

    /// `GET_SETTINGS`.
    ///
    /// # Errors
    ///
    /// Returns the mapped [`LockError`] on a non-`SUCCESS` result code, a
    /// malformed-response error if fewer than 11 bytes follow it, or
    /// [`Error::Cancelled`] if `cancel` fires first.
    pub async fn get_settings(&self, cancel: &CancellationToken) -> Result<DeviceSettings, Error> {
        let mux = self.supervisor.mux();
        let timeout = self.supervisor.config().timeouts.request;
        mux.request(
            command::GET_SETTINGS,
            self.supervisor.write_encrypted(command::GET_SETTINGS, &[]),
            |body| {
                if !result_code(body, ErrorCodeOp::General)? {
                    return Err(Error::Lock(LockError::GeneralLockError(0x03)));
                }
                parse_device_settings(&body[1..])
            },
            timeout,
            cancel,
        )
        .await
    }

    /// `GET_VERSION`.
    ///
    /// # Errors
    ///
    /// Returns the mapped [`LockError`] on a non-`SUCCESS` result code, a
    /// malformed-response error if fewer than 5 bytes follow it, or
    /// [`Error::Cancelled`] if `cancel` fires first.
    pub async fn get_version(&self, cancel: &CancellationToken) -> Result<FirmwareVersion, Error> {
        let mux = self.supervisor.mux();
        let timeout = self.supervisor.config().timeouts.request;
        mux.request(
            command::GET_VERSION,
            self.supervisor.write_encrypted(command::GET_VERSION, &[]),
            |body| {
                if !result_code(body, ErrorCodeOp::General)? {
                    return Err(Error::Lock(LockError::GeneralLockError(0x03)));
                }
                parse_firmware_version(&body[1..])
            },
            timeout,
            cancel,
        )
        .await
    }

    /// `REQUEST_SIGNED_SERIAL`, returning the raw signature bytes delivered
    /// asynchronously over `NOTIFICATION_SIGNED_SERIAL`.
    ///
    /// Subscribes to the notification bus before issuing the request, so a
    /// signature that arrives before the indication ack is never missed.
    /// Callers that want the base64 encoding should use [`Self::get_signature`]
    /// instead.
    ///
    /// # Errors
    ///
    /// Returns the mapped [`LockError`] on a non-`SUCCESS` acknowledgment,
    /// [`Error::NotificationTimeout`] if the signature never arrives, or
    /// [`Error::Cancelled`] if `cancel` fires first.
    pub async fn request_signed_serial(&self, cancel: &CancellationToken) -> Result<Vec<u8>, Error> {
        let mux = self.supervisor.mux();
        let request_timeout = self.supervisor.config().timeouts.request;
        let notification_timeout = self.supervisor.config().timeouts.notification;

        let mut notify_rx = mux.subscribe_notifications();

        mux.request(
            command::REQUEST_SIGNED_SERIAL,
            self.supervisor
                .write_encrypted(command::REQUEST_SIGNED_SERIAL, &[]),
            |body| {
                if !result_code(body, ErrorCodeOp::RequestSignature)? {
                    return Err(Error::Lock(LockError::GeneralLockError(0x03)));
                }
                Ok(())
            },
            request_timeout,
            cancel,
        )
        .await?;

        let deadline = tokio::time::Instant::now() + notification_timeout;
        loop {
            let remaining = deadline.saturating_duration_since(tokio::time::Instant::now());
            if remaining.is_zero() {
                return Err(Error::NotificationTimeout);
            }
            tokio::select! {
                result = tokio::time::timeout(remaining, notify_rx.recv()) => {
                    match result {
                        Ok(Ok((kind, payload))) if kind == notification::SIGNED_SERIAL => {
                            return Ok(payload);
                        }
                        Ok(Ok(_)) => {}
                        _ => return Err(Error::NotificationTimeout),
                    }
                }
                () = cancel.cancelled() => return Err(Error::Cancelled),
            }
        }
    }

    /// Thin base64-encoding wrapper over [`Self::request_signed_serial`],
    /// for callers that want the signature in the wire-transmissible form
    /// the device itself uses elsewhere (e.g. `SET_SIGNED_TIME`'s payload).
    ///
    /// # Errors
    ///
    /// See [`Self::request_signed_serial`].
    pub async fn get_signature(&self, cancel: &CancellationToken) -> Result<String, Error> {
        use base64::Engine;
        let signature = self.request_signed_serial(cancel).await?;
        Ok(base64::engine::general_purpose::STANDARD.encode(signature))
    }

    /// `REGISTER_DEVICE`, sending this mobile identity's public key.
    /// Written through [`SessionSupervisor::write_command`] rather than the
    /// encrypted path directly, since this is the one operation add-lock
    /// mode (no live session) also needs to issue.
    ///
    /// # Errors
    ///
    /// Returns [`Error::NoWrapperListener`] if the keystore has no key
    /// pair, the mapped [`LockError`] on a non-`SUCCESS` result code, or
    /// [`Error::Cancelled`] if `cancel` fires first.
    pub async fn register_device(&self, cancel: &CancellationToken) -> Result<(), Error> {
        let key_pair = self
            .supervisor
            .keystore()
            .get_mobile_key_pair()
            .await
            .ok_or(Error::Lock(LockError::RegisterDeviceError))?;

        let mux = self.supervisor.mux();
        let timeout = self.supervisor.config().timeouts.request;
        mux.request(
            command::REGISTER_DEVICE,
            self.supervisor
                .write_command(command::REGISTER_DEVICE, &key_pair.public_key),
            |body| {
                if !result_code(body, ErrorCodeOp::RegisterDevice)? {
                    return Err(Error::Lock(LockError::GeneralLockError(0x03)));
                }
                Ok(())
            },
            timeout,
            cancel,
        )
        .await
    }

    /// Push a freshly obtained signed time to the device outside of the
    /// handshake-triggered recovery flow.
    ///
    /// # Errors
    ///
    /// Returns [`Error::NoSignedTime`] if the retry budget is exhausted,
    /// [`Error::NotProvidedSignedTime`] if the external provider has
    /// nothing to offer, or [`Error::Cancelled`] if `cancel` fires first.
    pub async fn set_signed_time(&self, cancel: &CancellationToken) -> Result<(), Error> {
        self.supervisor.refresh_signed_time(cancel).await
    }

    /// Wait for a `NOTIFICATION_LOCK_STATUS_CHANGE` whose state byte equals
    /// `target_state`.
    ///
    /// # Errors
    ///
    /// Returns [`LockError::LockJammed`]/[`LockError::LockNotResponding`]
    /// on the corresponding status byte, [`Error::NotificationTimeout`] if
    /// `timeout` elapses first, or [`Error::Cancelled`] if `cancel` fires
    /// first.
    pub async fn wait_for_lock_status_change(
        &self,
        target_state: u8,
        timeout: Duration,
        cancel: &CancellationToken,
    ) -> Result<(), Error> {
        wait_for_status(&self.supervisor.mux(), target_state, timeout, cancel).await
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn parses_get_settings_device_capture_vector() {
        // Full 13-byte indication: [command, result, flags, 4×u16 delays, revision].
        let response: [u8; 13] = [
            0x20, 0x00, 0x00, 0x01, 0x0E, 0x00, 0x3C, 0x00, 0x05, 0x00, 0x05, 0x00, 0x05,
        ];
        let settings = parse_device_settings(&response[2..]).unwrap();
        assert!(!settings.auto_lock_enabled);
        assert!(!settings.auto_lock_implicit_enabled);
        assert!(!settings.pull_spring_enabled);
        assert!(!settings.postponed_lock_enabled);
        assert_eq!(settings.auto_lock_delay, 270);
        assert_eq!(settings.pull_spring_duration, 60);
        assert_eq!(settings.postponed_lock_delay, 5);
        assert_eq!(settings.auto_lock_implicit_delay, 5);
    }

    #[test]
    fn rejects_short_get_settings_body() {
        assert!(parse_device_settings(&[0x00; 5]).is_err());
    }

    #[test]
    fn parses_firmware_version_and_discards_revision_byte() {
        let body = [0x00u8, 0x03, 0x0C, 0x01, 0x2C, 0x07];
        let version = parse_firmware_version(&body[1..]).unwrap();
        assert_eq!(version.major, 3);
        assert_eq!(version.minor, 12);
        assert_eq!(version.build, 0x012C);
        assert_eq!(version.to_string(), "3.12.300");
    }

    #[test]
    fn result_code_maps_busy_to_false() {
        assert_eq!(result_code(&[0x03], ErrorCodeOp::General).unwrap(), false);
    }

    #[test]
    fn result_code_maps_success_to_true() {
        assert_eq!(result_code(&[0x00], ErrorCodeOp::General).unwrap(), true);
    }

    #[tokio::test]
    async fn wait_for_status_short_circuits_on_jammed() {
        let mux = CommandMux::new();
        mux.dispatch_notification(NOTIFICATION_LOCK_STATUS_CHANGE, vec![0x06, lock_status::JAMMED]);
        let result = wait_for_status(
            &mux,
            0x06,
            Duration::from_millis(50),
            &CancellationToken::new(),
        )
        .await;
        assert!(matches!(result, Err(Error::Lock(LockError::LockJammed))));
    }

    #[tokio::test]
    async fn wait_for_status_ignores_non_matching_state_until_target() {
        let mux = std::sync::Arc::new(CommandMux::new());
        let mux2 = mux.clone();
        let waiter = tokio::spawn(async move {
            wait_for_status(
                &mux2,
                0x06,
                Duration::from_secs(1),
                &CancellationToken::new(),
            )
            .await
        });

        tokio::time::sleep(Duration::from_millis(10)).await;
        mux.dispatch_notification(NOTIFICATION_LOCK_STATUS_CHANGE, vec![0x05, lock_status::SUCCESS]);
        tokio::time::sleep(Duration::from_millis(10)).await;
        mux.dispatch_notification(NOTIFICATION_LOCK_STATUS_CHANGE, vec![0x06, lock_status::SUCCESS]);

        waiter.await.unwrap().unwrap();
    }

    #[tokio::test]
    async fn wait_for_status_times_out() {
        let mux = CommandMux::new();
        let result = wait_for_status(
            &mux,
            0x06,
            Duration::from_millis(20),
            &CancellationToken::new(),
        )
        .await;
        assert!(matches!(result, Err(Error::NotificationTimeout)));
    }

    #[tokio::test]
    async fn wait_for_status_is_cancellable() {
        let mux = CommandMux::new();
        let cancel = CancellationToken::new();
        cancel.cancel();
        let result = wait_for_status(&mux, 0x06, Duration::from_secs(5), &cancel).await;
        assert!(matches!(result, Err(Error::Cancelled)));
    }
}
