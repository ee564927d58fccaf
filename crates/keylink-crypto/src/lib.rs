//! Cryptographic primitives backing the secure BLE lock session: X25519
//! key exchange, Ed25519 verification, a chunked client handshake, and a
//! ChaCha20-Poly1305 post-handshake session.
//!
//! This crate never reads from or writes to a transport; it only turns
//! byte payloads into other byte payloads. `keylink-core::session` owns
//! the frame-kind envelope and drives the state machines defined here.

pub mod aead;
pub mod certificate;
mod error;
pub mod hash;
pub mod handshake;
pub mod signatures;
pub mod x25519;

pub use aead::{SecureSessionCrypto, SessionKeys};
pub use certificate::DeviceCertificate;
pub use error::CryptoError;
pub use handshake::{ClientHandshake, HandshakeConfig, HandshakePhase, CLIENT_VERIFY_CHUNK_SIZE};
pub use signatures::{DevicePublicKey, Signature};
pub use x25519::{PrivateKey, PublicKey, SharedSecret};
