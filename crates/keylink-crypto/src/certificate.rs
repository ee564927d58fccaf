//! Access certificate decoding.
//!
//! The external caller supplies the base64-encoded certificate bytes and
//! the device's public key; `SecureSession` decodes both at construction
//! time. In "add-lock" mode the certificate is absent entirely and no
//! `SecureSession` is instantiated.

use crate::signatures::DevicePublicKey;
use crate::CryptoError;
use base64::Engine;

/// The access certificate and device public key that authenticate the lock
/// to this client during handshake.
pub struct DeviceCertificate {
    cert_bytes: Vec<u8>,
    device_public_key: DevicePublicKey,
}

impl DeviceCertificate {
    /// Decode a base64 certificate blob and a 32-byte device public key.
    ///
    /// # Errors
    ///
    /// Returns [`CryptoError::InvalidCertificate`] if `cert_b64` is not
    /// valid base64, or [`CryptoError::InvalidPublicKey`] if
    /// `device_public_key` is not a valid Ed25519 point.
    pub fn new(cert_b64: &str, device_public_key: &[u8; 32]) -> Result<Self, CryptoError> {
        let cert_bytes = base64::engine::general_purpose::STANDARD
            .decode(cert_b64)
            .map_err(|_| CryptoError::InvalidCertificate)?;
        let device_public_key = DevicePublicKey::from_bytes(device_public_key)?;

        Ok(Self {
            cert_bytes,
            device_public_key,
        })
    }

    /// Raw decoded certificate bytes.
    #[must_use]
    pub fn cert_bytes(&self) -> &[u8] {
        &self.cert_bytes
    }

    /// The device public key used to verify the server's signed
    /// verification record during handshake.
    #[must_use]
    pub fn device_public_key(&self) -> &DevicePublicKey {
        &self.device_public_key
    }
}
