//! Client side of the device's proprietary authenticated key-exchange.
//!
//! The exact algorithm is opaque; what's reproduced here is the observable
//! six-message protocol and the shape of an implementation that could drive
//! it: an ECDH exchange authenticated by a certificate signature, followed
//! by a chunked client-verify payload. Modeled as an explicit phase-tagged
//! state machine rather than reusing `Noise_XX`/`snow`, since the message
//! flow here doesn't match that pattern.

use crate::aead::SessionKeys;
use crate::certificate::DeviceCertificate;
use crate::hash::hkdf;
use crate::signatures::Signature;
use crate::x25519::{PrivateKey, PublicKey};
use crate::CryptoError;
use rand_core::{CryptoRng, RngCore};

/// Default per-chunk payload size for the `CLIENT_VERIFY` message.
///
/// A conservative default sized for the common 185-byte BLE ATT_MTU minus a
/// 3-byte opcode/handle overhead. See `HandshakeConfig::chunk_size` to
/// override with a real device's negotiated MTU.
pub const CLIENT_VERIFY_CHUNK_SIZE: usize = 182;

/// Tunable handshake parameters.
#[derive(Debug, Clone, Copy)]
pub struct HandshakeConfig {
    /// Maximum payload bytes per `CLIENT_VERIFY` chunk.
    pub chunk_size: usize,
}

impl Default for HandshakeConfig {
    fn default() -> Self {
        Self {
            chunk_size: CLIENT_VERIFY_CHUNK_SIZE,
        }
    }
}

/// Current phase of the client handshake state machine.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum HandshakePhase {
    /// Not yet started.
    Initial,
    /// Client `HELLO` sent, awaiting server `HELLO`.
    AwaitingServerHello,
    /// Client `SERVER_VERIFY` (timestamp) sent, awaiting server's signed
    /// verification record.
    AwaitingServerVerify,
    /// All `CLIENT_VERIFY`/`CLIENT_VERIFY_END` chunks sent, awaiting
    /// `SESSION_INITIALIZED`.
    AwaitingSessionInitialized,
    /// Handshake complete.
    Complete,
    /// Handshake failed; must not be reused.
    Failed,
}

/// Client-role handshake driver.
///
/// Methods consume handshake messages in the fixed order the protocol
/// requires and return the payload the caller must send next. The caller
/// (in `keylink-core::session`) is responsible for the frame-kind
/// envelope; this type only ever sees and produces opaque byte payloads.
pub struct ClientHandshake {
    phase: HandshakePhase,
    config: HandshakeConfig,
    local_ephemeral: Option<PrivateKey>,
    client_hello: Vec<u8>,
    server_hello: Vec<u8>,
    client_timestamp: Option<[u8; 8]>,
    shared_secret: Option<[u8; 32]>,
    certificate: Option<DeviceCertificate>,
}

impl ClientHandshake {
    /// Create a new client handshake.
    ///
    /// `certificate` is `None` in "add-lock" mode; in that mode this type
    /// must not be used.
    #[must_use]
    pub fn new(certificate: DeviceCertificate, config: HandshakeConfig) -> Self {
        Self {
            phase: HandshakePhase::Initial,
            config,
            local_ephemeral: None,
            client_hello: Vec::new(),
            server_hello: Vec::new(),
            client_timestamp: None,
            shared_secret: None,
            certificate: Some(certificate),
        }
    }

    /// Current handshake phase.
    #[must_use]
    pub fn phase(&self) -> HandshakePhase {
        self.phase
    }

    /// Step 1: produce the client `HELLO` payload (our ephemeral public
    /// key) and arm the state machine to expect the server's `HELLO`.
    ///
    /// # Errors
    ///
    /// Returns [`CryptoError::InvalidHandshakeState`] if called more than
    /// once.
    pub fn start<R: RngCore + CryptoRng>(&mut self, rng: &mut R) -> Result<Vec<u8>, CryptoError> {
        if self.phase != HandshakePhase::Initial {
            return Err(CryptoError::InvalidHandshakeState);
        }
        let ephemeral = PrivateKey::generate(rng);
        let hello = ephemeral.public_key().to_bytes().to_vec();

        self.client_hello = hello.clone();
        self.local_ephemeral = Some(ephemeral);
        self.phase = HandshakePhase::AwaitingServerHello;
        Ok(hello)
    }

    /// Step 2: consume the server's `HELLO` (its ephemeral public key),
    /// derive the shared secret, and produce the client `SERVER_VERIFY`
    /// payload (an 8-byte big-endian millisecond timestamp).
    ///
    /// # Errors
    ///
    /// Returns [`CryptoError::InvalidHandshakeState`] if called out of
    /// order, or [`CryptoError::InvalidPublicKey`] if the server's key is a
    /// low-order point.
    pub fn receive_server_hello(
        &mut self,
        payload: &[u8],
        now_unix_millis: u64,
    ) -> Result<Vec<u8>, CryptoError> {
        if self.phase != HandshakePhase::AwaitingServerHello {
            return Err(CryptoError::InvalidHandshakeState);
        }
        if payload.len() != 32 {
            return Err(CryptoError::InvalidKeyLength {
                expected: 32,
                actual: payload.len(),
            });
        }
        let mut server_key_bytes = [0u8; 32];
        server_key_bytes.copy_from_slice(payload);
        let server_public = PublicKey::from_bytes(server_key_bytes);

        let local_ephemeral = self
            .local_ephemeral
            .as_ref()
            .ok_or(CryptoError::InvalidHandshakeState)?;
        let shared = local_ephemeral
            .exchange(&server_public)
            .ok_or(CryptoError::InvalidPublicKey)?;

        self.shared_secret = Some(*shared.as_bytes());
        self.server_hello = payload.to_vec();

        let timestamp = now_unix_millis.to_be_bytes();
        self.client_timestamp = Some(timestamp);
        self.phase = HandshakePhase::AwaitingServerVerify;
        Ok(timestamp.to_vec())
    }

    /// Step 4: verify the server's signed verification record against the
    /// device public key, then produce the `CLIENT_VERIFY` chunks (all but
    /// the last carry the `CLIENT_VERIFY` kind; the last carries
    /// `CLIENT_VERIFY_END` — the caller assigns frame kinds, this returns
    /// plain chunk payloads in send order).
    ///
    /// # Errors
    ///
    /// Returns [`CryptoError::InvalidHandshakeState`] if called out of
    /// order, or [`CryptoError::InvalidServerVerification`] if the
    /// signature does not verify against the transcript.
    pub fn receive_server_verify(&mut self, payload: &[u8]) -> Result<Vec<Vec<u8>>, CryptoError> {
        if self.phase != HandshakePhase::AwaitingServerVerify {
            return Err(CryptoError::InvalidHandshakeState);
        }
        let signature = Signature::from_slice(payload)?;

        let transcript = self.transcript();
        let certificate = self
            .certificate
            .as_ref()
            .ok_or(CryptoError::InvalidHandshakeState)?;
        certificate
            .device_public_key()
            .verify(&transcript, &signature)?;

        let client_verify_payload = self.build_client_verify_payload(certificate);
        self.phase = HandshakePhase::AwaitingSessionInitialized;

        Ok(chunk(&client_verify_payload, self.config.chunk_size))
    }

    /// Step 6: consume `SESSION_INITIALIZED` and derive the directional
    /// session keys.
    ///
    /// # Errors
    ///
    /// Returns [`CryptoError::InvalidHandshakeState`] if called out of
    /// order.
    pub fn receive_session_initialized(
        &mut self,
        payload: &[u8],
    ) -> Result<SessionKeys, CryptoError> {
        if self.phase != HandshakePhase::AwaitingSessionInitialized {
            return Err(CryptoError::InvalidHandshakeState);
        }
        let shared_secret = self
            .shared_secret
            .ok_or(CryptoError::InvalidHandshakeState)?;

        let mut ikm = Vec::with_capacity(shared_secret.len() + payload.len());
        ikm.extend_from_slice(&shared_secret);
        ikm.extend_from_slice(payload);

        let mut send_key = [0u8; 32];
        let mut recv_key = [0u8; 32];
        let mut chain_key = [0u8; 32];
        hkdf(b"keylink_client_to_server", &ikm, b"keylink", &mut send_key);
        hkdf(b"keylink_server_to_client", &ikm, b"keylink", &mut recv_key);
        hkdf(b"keylink_chain", &ikm, b"keylink", &mut chain_key);

        self.phase = HandshakePhase::Complete;
        Ok(SessionKeys {
            send_key,
            recv_key,
            chain_key,
        })
    }

    /// Mark the handshake as failed. Any crypto failure during the
    /// handshake (verification failure, decrypt failure) transitions here;
    /// the session must not continue, and the supervisor decides whether to
    /// reconnect.
    pub fn fail(&mut self) {
        self.phase = HandshakePhase::Failed;
    }

    fn transcript(&self) -> Vec<u8> {
        let timestamp = self.client_timestamp.unwrap_or_default();
        let mut transcript =
            Vec::with_capacity(self.client_hello.len() + self.server_hello.len() + 8);
        transcript.extend_from_slice(&self.client_hello);
        transcript.extend_from_slice(&self.server_hello);
        transcript.extend_from_slice(&timestamp);
        transcript
    }

    fn build_client_verify_payload(&self, certificate: &DeviceCertificate) -> Vec<u8> {
        let mut payload = Vec::with_capacity(certificate.cert_bytes().len() + 32);
        payload.extend_from_slice(certificate.cert_bytes());
        let mut proof = [0u8; 32];
        if let Some(shared_secret) = self.shared_secret {
            hkdf(b"keylink_client_verify", &shared_secret, b"keylink", &mut proof);
        }
        payload.extend_from_slice(&proof);
        payload
    }
}

/// Split `payload` into chunks of at most `chunk_size` bytes, in send order.
fn chunk(payload: &[u8], chunk_size: usize) -> Vec<Vec<u8>> {
    if payload.is_empty() {
        return vec![Vec::new()];
    }
    payload
        .chunks(chunk_size.max(1))
        .map(<[u8]>::to_vec)
        .collect()
}
