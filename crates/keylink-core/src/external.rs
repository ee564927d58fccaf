//! External collaborator capabilities.
//!
//! These are the seams the core consumes but never implements: the
//! trusted-time provider and the platform keystore. Each is a narrow
//! `async_trait`, the same pattern `keylink-transport::Transport` uses to
//! keep the BLE backend out of this crate.

use async_trait::async_trait;

/// A `(datetime, signature)` pair produced by an external trusted-time
/// service and accepted by the lock as a clock anchor.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct SignedTime {
    /// Base64-encoded datetime blob, opaque to this crate.
    pub datetime_b64: String,
    /// Base64-encoded signature over the datetime blob.
    pub signature_b64: String,
}

/// Supplies trusted signed time on demand, for the `SET_SIGNED_TIME`
/// recovery flow.
///
/// Modeled as a single async method rather than a callback invoked once:
/// the supervisor awaits it directly and treats `None` as
/// [`crate::error::Error::NotProvidedSignedTime`].
#[async_trait]
pub trait SignedTimeProvider: Send + Sync {
    /// Request a fresh signed time. Returns `None` if none could be
    /// obtained.
    async fn get_signed_time(&self) -> Option<SignedTime>;
}

/// A mobile identity key pair. The private half never leaves the
/// keystore; signing is delegated through [`Keystore::sign`].
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub struct KeyPair {
    /// Ed25519 public key bytes.
    pub public_key: [u8; 32],
}

/// Platform keystore capability.
#[async_trait]
pub trait Keystore: Send + Sync {
    /// Return this device's mobile key pair, generating one on first use.
    async fn get_mobile_key_pair(&self) -> Option<KeyPair>;

    /// Sign `message` with the keystore-held private key.
    async fn sign(&self, message: &[u8]) -> Option<[u8; 64]>;
}
