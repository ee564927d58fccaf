//! Core secure-session protocol engine for a BLE smart-lock client.
//!
//! ```text
//! Transport ⇒ Framer ⇒ SecureSession (handshake channel)
//!                    ⇒ CommandMux    (lock indicate/notify channels)
//! LockApi ⇒ SessionSupervisor ⇒ CommandMux ⇒ SecureSession ⇒ Transport
//! ```
//!
//! [`supervisor::SessionSupervisor`] owns the transport connection and
//! drives [`session::SecureSession`] through its handshake; once the
//! session is ready, inbound traffic is decrypted and handed to
//! [`mux::CommandMux`] for request/response correlation and notification
//! fan-out. [`api::LockApi`] is the typed surface applications call.
//!
//! `keylink-crypto` and `keylink-transport` supply the cryptographic and
//! radio primitives this crate composes; neither is re-exported wholesale,
//! keeping the wire-level and BLE-level details out of the public surface.

pub mod api;
pub mod config;
pub mod error;
pub mod external;
pub mod frame;
pub mod listener;
pub mod mux;
pub mod session;
pub mod supervisor;

pub use api::LockApi;
pub use config::SupervisorConfig;
pub use error::{Error, LockError};
pub use external::{KeyPair, Keystore, SignedTime, SignedTimeProvider};
pub use listener::{AddModeConnectionListener, ConnectionListener};
pub use mux::CommandMux;
pub use session::{SecureSession, SessionState};
pub use supervisor::{SessionSupervisor, SupervisorState};
