//! Post-handshake AEAD read/write oracle.
//!
//! `SecureSessionCrypto` is the capability the session driver uses once
//! the handshake completes: `encrypt`/`decrypt` turn `(command, payload)`
//! pairs into and out of `DATA_ENCRYPTED` frame bodies. Keys are derived
//! per-direction from the handshake; nonces are a monotonic counter salted
//! with a value derived from the handshake's chain key.

use crate::CryptoError;
use chacha20poly1305::aead::{Aead, KeyInit, Payload};
use chacha20poly1305::{ChaCha20Poly1305, Key, Nonce};
use zeroize::{Zeroize, ZeroizeOnDrop};

const NONCE_SIZE: usize = 12;

/// Symmetric keys derived from a completed handshake.
#[derive(Zeroize, ZeroizeOnDrop)]
pub struct SessionKeys {
    /// Key used to encrypt outbound messages.
    pub send_key: [u8; 32],
    /// Key used to decrypt inbound messages.
    pub recv_key: [u8; 32],
    /// Chain key, used only to derive the nonce salt.
    pub chain_key: [u8; 32],
}

fn nonce_for_counter(counter: u64, salt: &[u8; 4]) -> Nonce {
    let mut bytes = [0u8; NONCE_SIZE];
    bytes[..4].copy_from_slice(salt);
    bytes[4..].copy_from_slice(&counter.to_be_bytes());
    *Nonce::from_slice(&bytes)
}

/// Post-handshake bidirectional AEAD session.
///
/// Holds one send and one receive counter; each direction has its own key so
/// a compromise of one direction's counter never reuses the other's nonce
/// space.
pub struct SecureSessionCrypto {
    send_cipher: ChaCha20Poly1305,
    recv_cipher: ChaCha20Poly1305,
    send_salt: [u8; 4],
    recv_salt: [u8; 4],
    send_counter: u64,
    recv_counter: u64,
}

impl SecureSessionCrypto {
    /// Build a session crypto state from handshake-derived keys.
    #[must_use]
    pub fn new(keys: &SessionKeys) -> Self {
        let mut send_salt = [0u8; 4];
        let mut recv_salt = [0u8; 4];
        send_salt.copy_from_slice(&keys.chain_key[0..4]);
        recv_salt.copy_from_slice(&keys.chain_key[4..8]);

        Self {
            send_cipher: ChaCha20Poly1305::new(Key::from_slice(&keys.send_key)),
            recv_cipher: ChaCha20Poly1305::new(Key::from_slice(&keys.recv_key)),
            send_salt,
            recv_salt,
            send_counter: 0,
            recv_counter: 0,
        }
    }

    /// Encrypt a `(command, payload)` message into a `DATA_ENCRYPTED` frame
    /// body (ciphertext includes the authentication tag).
    ///
    /// # Errors
    ///
    /// Returns [`CryptoError::NonceOverflow`] if the send counter is
    /// exhausted, or [`CryptoError::EncryptionFailed`] on cipher failure.
    pub fn encrypt(&mut self, command: u8, payload: &[u8]) -> Result<Vec<u8>, CryptoError> {
        if self.send_counter == u64::MAX {
            return Err(CryptoError::NonceOverflow);
        }
        let nonce = nonce_for_counter(self.send_counter, &self.send_salt);
        self.send_counter += 1;

        let mut plaintext = Vec::with_capacity(1 + payload.len());
        plaintext.push(command);
        plaintext.extend_from_slice(payload);

        self.send_cipher
            .encrypt(
                &nonce,
                Payload {
                    msg: &plaintext,
                    aad: b"",
                },
            )
            .map_err(|_| CryptoError::EncryptionFailed)
    }

    /// Decrypt a `DATA_ENCRYPTED` frame body into `(command, payload)`.
    ///
    /// # Errors
    ///
    /// Returns [`CryptoError::NonceOverflow`] if the receive counter is
    /// exhausted, or [`CryptoError::DecryptionFailed`] if the authentication
    /// tag does not verify.
    pub fn decrypt(&mut self, frame_body: &[u8]) -> Result<(u8, Vec<u8>), CryptoError> {
        if self.recv_counter == u64::MAX {
            return Err(CryptoError::NonceOverflow);
        }
        let nonce = nonce_for_counter(self.recv_counter, &self.recv_salt);
        self.recv_counter += 1;

        let mut plaintext = self
            .recv_cipher
            .decrypt(
                &nonce,
                Payload {
                    msg: frame_body,
                    aad: b"",
                },
            )
            .map_err(|_| CryptoError::DecryptionFailed)?;

        if plaintext.is_empty() {
            return Err(CryptoError::DecryptionFailed);
        }
        let command = plaintext.remove(0);
        Ok((command, plaintext))
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    fn paired_sessions() -> (SecureSessionCrypto, SecureSessionCrypto) {
        let client_keys = SessionKeys {
            send_key: [1u8; 32],
            recv_key: [2u8; 32],
            chain_key: [3u8; 32],
        };
        let server_keys = SessionKeys {
            send_key: [2u8; 32],
            recv_key: [1u8; 32],
            chain_key: [3u8; 32],
        };
        (
            SecureSessionCrypto::new(&client_keys),
            SecureSessionCrypto::new(&server_keys),
        )
    }

    #[test]
    fn encrypt_decrypt_roundtrip() {
        let (mut client, mut server) = paired_sessions();

        let ct = client.encrypt(0x51, &[0x00]).unwrap();
        let (command, payload) = server.decrypt(&ct).unwrap();

        assert_eq!(command, 0x51);
        assert_eq!(payload, vec![0x00]);
    }

    #[test]
    fn tampered_ciphertext_fails_to_decrypt() {
        let (mut client, mut server) = paired_sessions();

        let mut ct = client.encrypt(0x51, &[0x00]).unwrap();
        let last = ct.len() - 1;
        ct[last] ^= 0xFF;

        assert!(server.decrypt(&ct).is_err());
    }

    #[test]
    fn sequential_messages_use_distinct_nonces() {
        let (mut client, _server) = paired_sessions();

        let ct1 = client.encrypt(0x51, &[0x00]).unwrap();
        let ct2 = client.encrypt(0x51, &[0x00]).unwrap();

        assert_ne!(ct1, ct2);
    }
}
