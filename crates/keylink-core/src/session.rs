//! Client-side secure session driver.
//!
//! Wraps `keylink_crypto::handshake::ClientHandshake` during the
//! six-message key exchange and `keylink_crypto::aead::SecureSessionCrypto`
//! once the session is ready, owning the frame-kind envelope both speak
//! through. The `SessionCrypto` trait reifies the post-handshake
//! encrypt/decrypt capability as a narrow seam, the same way
//! `keylink-transport::Transport` reifies the radio link — tests can swap
//! in a crypto double without a real handshake.

use crate::frame::{Frame, FrameKind};
use keylink_crypto::{CryptoError, HandshakeConfig, SecureSessionCrypto};

/// The post-handshake encrypt/decrypt capability.
///
/// `keylink_crypto::SecureSessionCrypto` is the concrete implementation
/// used in production; tests may substitute a double to exercise
/// `SecureSession`'s close-on-crypto-failure behavior without driving a
/// full handshake.
pub trait SessionCrypto: Send {
    /// Encrypt a `(command, payload)` pair into a `DATA_ENCRYPTED` frame
    /// body.
    fn encrypt(&mut self, command: u8, payload: &[u8]) -> Result<Vec<u8>, CryptoError>;

    /// Decrypt a `DATA_ENCRYPTED` frame body into `(command, payload)`.
    fn decrypt(&mut self, frame_body: &[u8]) -> Result<(u8, Vec<u8>), CryptoError>;
}

impl SessionCrypto for SecureSessionCrypto {
    fn encrypt(&mut self, command: u8, payload: &[u8]) -> Result<Vec<u8>, CryptoError> {
        SecureSessionCrypto::encrypt(self, command, payload)
    }

    fn decrypt(&mut self, frame_body: &[u8]) -> Result<(u8, Vec<u8>), CryptoError> {
        SecureSessionCrypto::decrypt(self, frame_body)
    }
}

/// Lifecycle state of a `SecureSession`.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum SessionState {
    /// The handshake is in progress.
    Handshaking,
    /// The handshake completed; reads and writes are permitted.
    Ready,
    /// The session failed or was torn down; keys have been dropped.
    Closed,
}

/// Client-role secure session.
///
/// Owns the handshake state machine until it completes, then owns the
/// resulting AEAD oracle. Exactly one of `handshake`/`crypto` is present
/// at any time, mirroring the `Handshaking`/`Ready` split in
/// `SessionState`.
pub struct SecureSession {
    state: SessionState,
    handshake: Option<keylink_crypto::ClientHandshake>,
    crypto: Option<Box<dyn SessionCrypto>>,
}

impl SecureSession {
    /// Start a new session for the given access certificate.
    #[must_use]
    pub fn new(certificate: keylink_crypto::DeviceCertificate, config: HandshakeConfig) -> Self {
        Self {
            state: SessionState::Handshaking,
            handshake: Some(keylink_crypto::ClientHandshake::new(certificate, config)),
            crypto: None,
        }
    }

    /// Current lifecycle state.
    #[must_use]
    pub fn state(&self) -> SessionState {
        self.state
    }

    /// Step 1: produce the client `HELLO` frame.
    ///
    /// # Errors
    ///
    /// Returns [`CryptoError::InvalidHandshakeState`] if the session is not
    /// handshaking.
    pub fn start<R: rand_core::RngCore + rand_core::CryptoRng>(
        &mut self,
        rng: &mut R,
    ) -> Result<Vec<u8>, CryptoError> {
        let payload = self.handshake_mut()?.start(rng).inspect_err(|_| self.close())?;
        Ok(Frame::build(FrameKind::Hello, &payload))
    }

    /// Step 3: consume the server `HELLO` body and produce the client
    /// `SERVER_VERIFY` frame (the client-supplied timestamp).
    ///
    /// # Errors
    ///
    /// See [`keylink_crypto::ClientHandshake::receive_server_hello`].
    pub fn receive_server_hello(
        &mut self,
        body: &[u8],
        now_unix_millis: u64,
    ) -> Result<Vec<u8>, CryptoError> {
        let payload = self
            .handshake_mut()?
            .receive_server_hello(body, now_unix_millis)
            .inspect_err(|_| self.close())?;
        Ok(Frame::build(FrameKind::ServerVerify, &payload))
    }

    /// Step 5: consume the server `SERVER_VERIFY` body and produce the
    /// `CLIENT_VERIFY`/`CLIENT_VERIFY_END` frames to send, in order.
    ///
    /// # Errors
    ///
    /// See [`keylink_crypto::ClientHandshake::receive_server_verify`].
    pub fn receive_server_verify(&mut self, body: &[u8]) -> Result<Vec<Vec<u8>>, CryptoError> {
        let chunks = self
            .handshake_mut()?
            .receive_server_verify(body)
            .inspect_err(|_| self.close())?;
        let last = chunks.len().saturating_sub(1);
        Ok(chunks
            .into_iter()
            .enumerate()
            .map(|(i, chunk)| {
                let kind = if i == last {
                    FrameKind::ClientVerifyEnd
                } else {
                    FrameKind::ClientVerify
                };
                Frame::build(kind, &chunk)
            })
            .collect())
    }

    /// Step 6: consume `SESSION_INITIALIZED` and transition to `Ready`.
    ///
    /// # Errors
    ///
    /// See [`keylink_crypto::ClientHandshake::receive_session_initialized`].
    pub fn receive_session_initialized(&mut self, body: &[u8]) -> Result<(), CryptoError> {
        let keys = self
            .handshake_mut()?
            .receive_session_initialized(body)
            .inspect_err(|_| self.close())?;
        self.crypto = Some(Box::new(SecureSessionCrypto::new(&keys)));
        self.handshake = None;
        self.state = SessionState::Ready;
        Ok(())
    }

    /// Encrypt a `(command, payload)` message into a complete
    /// `DATA_ENCRYPTED` frame.
    ///
    /// # Errors
    ///
    /// Returns [`CryptoError::InvalidHandshakeState`] if the session is not
    /// `Ready`, or a cipher error (which also closes the session).
    pub fn encrypt(&mut self, command: u8, payload: &[u8]) -> Result<Vec<u8>, CryptoError> {
        let body = self
            .crypto
            .as_mut()
            .ok_or(CryptoError::InvalidHandshakeState)?
            .encrypt(command, payload)
            .inspect_err(|_| self.close())?;
        Ok(Frame::build(FrameKind::DataEncrypted, &body))
    }

    /// Decrypt an inbound `DATA_ENCRYPTED` frame body.
    ///
    /// On any failure the session transitions to `Closed`;
    /// the caller (the supervisor) decides whether to reconnect.
    ///
    /// # Errors
    ///
    /// Returns [`CryptoError::InvalidHandshakeState`] if the session is not
    /// `Ready`, or [`CryptoError::DecryptionFailed`] on an authentication
    /// failure.
    pub fn decrypt(&mut self, frame_body: &[u8]) -> Result<(u8, Vec<u8>), CryptoError> {
        self.crypto
            .as_mut()
            .ok_or(CryptoError::InvalidHandshakeState)?
            .decrypt(frame_body)
            .inspect_err(|_| self.close())
    }

    /// Tear the session down: drop the handshake state and the AEAD keys.
    /// `Drop` on the underlying key material zeroizes it.
    pub fn close(&mut self) {
        self.state = SessionState::Closed;
        self.handshake = None;
        self.crypto = None;
    }

    fn handshake_mut(&mut self) -> Result<&mut keylink_crypto::ClientHandshake, CryptoError> {
        self.handshake
            .as_mut()
            .ok_or(CryptoError::InvalidHandshakeState)
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use base64::Engine;
    use ed25519_dalek::{Signer, SigningKey};
    use keylink_crypto::{DeviceCertificate, PrivateKey};
    use rand::rngs::OsRng;

    fn certificate() -> (DeviceCertificate, SigningKey) {
        let signing_key = SigningKey::generate(&mut OsRng);
        let cert_b64 = base64::engine::general_purpose::STANDARD.encode(b"cert");
        let cert = DeviceCertificate::new(&cert_b64, signing_key.verifying_key().as_bytes()).unwrap();
        (cert, signing_key)
    }

    #[test]
    fn full_handshake_transitions_to_ready_and_encrypts() {
        let (cert, device_signing_key) = certificate();
        let mut session = SecureSession::new(cert, HandshakeConfig::default());
        assert_eq!(session.state(), SessionState::Handshaking);

        let hello_frame = session.start(&mut OsRng).unwrap();
        assert_eq!(hello_frame[0], 0x1);

        let server_ephemeral = PrivateKey::generate(&mut OsRng);
        let server_hello_body = server_ephemeral.public_key().to_bytes();
        let server_verify_frame = session
            .receive_server_hello(&server_hello_body, 1_700_000_000_000)
            .unwrap();
        assert_eq!(server_verify_frame[0], 0x2);

        let mut transcript = hello_frame[1..].to_vec();
        transcript.extend_from_slice(&server_hello_body);
        transcript.extend_from_slice(&server_verify_frame[1..]);
        let signature = device_signing_key.sign(&transcript);

        let client_verify_frames = session.receive_server_verify(&signature.to_bytes()).unwrap();
        assert!(!client_verify_frames.is_empty());
        assert_eq!(
            *client_verify_frames.last().unwrap().first().unwrap(),
            0x4
        );

        session.receive_session_initialized(b"params").unwrap();
        assert_eq!(session.state(), SessionState::Ready);

        let encrypted = session.encrypt(0x51, &[0x00]).unwrap();
        assert_eq!(encrypted[0], 0x7);
    }

    #[test]
    fn encrypt_before_ready_fails_without_panicking() {
        let (cert, _) = certificate();
        let mut session = SecureSession::new(cert, HandshakeConfig::default());
        let result = session.encrypt(0x51, &[]);
        assert!(matches!(result, Err(CryptoError::InvalidHandshakeState)));
    }

    #[test]
    fn close_drops_keys_and_prevents_further_use() {
        let (cert, _) = certificate();
        let mut session = SecureSession::new(cert, HandshakeConfig::default());
        session.close();
        assert_eq!(session.state(), SessionState::Closed);
        assert!(matches!(
            session.encrypt(0x51, &[]),
            Err(CryptoError::InvalidHandshakeState)
        ));
    }
}
