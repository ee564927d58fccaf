//! Cryptographic error types.

use thiserror::Error;

/// Cryptographic errors.
#[derive(Debug, Error)]
pub enum CryptoError {
    /// AEAD encryption failed.
    #[error("encryption failed")]
    EncryptionFailed,

    /// AEAD decryption failed (authentication failure).
    #[error("decryption failed: authentication failure")]
    DecryptionFailed,

    /// Invalid key length.
    #[error("invalid key length: expected {expected}, got {actual}")]
    InvalidKeyLength {
        /// Expected length.
        expected: usize,
        /// Actual length received.
        actual: usize,
    },

    /// The peer's public key was a low-order point.
    #[error("invalid peer public key")]
    InvalidPublicKey,

    /// Handshake message received out of sequence for the current phase.
    #[error("handshake message out of sequence")]
    InvalidHandshakeState,

    /// A chunked `CLIENT_VERIFY` message failed to reassemble.
    #[error("client verify chunk reassembly failed")]
    InvalidChunkSequence,

    /// The server's signed verification record did not verify against the
    /// device public key from the access certificate.
    #[error("server verification record signature invalid")]
    InvalidServerVerification,

    /// Certificate bytes were not valid base64 or were the wrong length.
    #[error("invalid device certificate encoding")]
    InvalidCertificate,

    /// Nonce counter exhausted; session must be re-established.
    #[error("nonce counter exhausted, session must be rekeyed")]
    NonceOverflow,

    /// Random number generation failed.
    #[error("random number generation failed")]
    RandomFailed,
}
