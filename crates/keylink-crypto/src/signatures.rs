//! Ed25519 signature verification.
//!
//! This client only ever *verifies* — the server's signed verification
//! record is checked against the device public key carried in the access
//! certificate. Signing with a local identity key is delegated to the
//! platform keystore capability (see `keylink-core::external::Keystore`)
//! and never implemented in this crate.

use crate::CryptoError;
use ed25519_dalek::{Verifier, VerifyingKey};

/// An Ed25519 signature (64 bytes).
#[derive(Clone, Copy)]
pub struct Signature([u8; 64]);

impl Signature {
    /// Build a signature from a 64-byte slice.
    ///
    /// # Errors
    ///
    /// Returns [`CryptoError::InvalidKeyLength`] if the slice is not 64 bytes.
    pub fn from_slice(slice: &[u8]) -> Result<Self, CryptoError> {
        if slice.len() != 64 {
            return Err(CryptoError::InvalidKeyLength {
                expected: 64,
                actual: slice.len(),
            });
        }
        let mut bytes = [0u8; 64];
        bytes.copy_from_slice(slice);
        Ok(Self(bytes))
    }
}

/// An Ed25519 public key used to verify the device's signed records.
#[derive(Clone, Copy)]
pub struct DevicePublicKey(VerifyingKey);

impl DevicePublicKey {
    /// Parse a 32-byte Ed25519 public key.
    ///
    /// # Errors
    ///
    /// Returns [`CryptoError::InvalidPublicKey`] if the bytes do not encode
    /// a valid compressed Edwards point.
    pub fn from_bytes(bytes: &[u8; 32]) -> Result<Self, CryptoError> {
        VerifyingKey::from_bytes(bytes)
            .map(Self)
            .map_err(|_| CryptoError::InvalidPublicKey)
    }

    /// Verify `signature` over `message`.
    ///
    /// # Errors
    ///
    /// Returns [`CryptoError::InvalidServerVerification`] if the signature
    /// does not verify.
    pub fn verify(&self, message: &[u8], signature: &Signature) -> Result<(), CryptoError> {
        let sig = ed25519_dalek::Signature::from_bytes(&signature.0);
        self.0
            .verify(message, &sig)
            .map_err(|_| CryptoError::InvalidServerVerification)
    }
}
