//! Frame header handling for the BLE wire protocol.
//!
//! The first byte's low nibble is the frame kind; the high nibble is an
//! opaque counter the peer echoes back. Inbound, the counter is recorded
//! only for tracing and the header byte is rewritten to its low-nibble-only
//! form before the frame reaches `SecureSession`/`CommandMux`. Outbound,
//! this module writes only the kind nibble — inserting the counter into
//! the wire byte is the transport backend's job, out of scope here.

use thiserror::Error;

/// Frame-level errors.
#[derive(Debug, Error, Clone, Copy, PartialEq, Eq)]
pub enum FrameError {
    /// A frame arrived with no bytes at all.
    #[error("empty frame")]
    Empty,

    /// The header byte's low nibble did not match a known frame kind.
    #[error("invalid frame kind: 0x{0:X}")]
    InvalidKind(u8),
}

/// The low-nibble frame kind.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash)]
#[repr(u8)]
pub enum FrameKind {
    /// Client or server handshake hello.
    Hello = 0x1,
    /// Handshake verification message (direction depends on sender).
    ServerVerify = 0x2,
    /// A non-final chunk of the client verify payload.
    ClientVerify = 0x3,
    /// The final chunk of the client verify payload.
    ClientVerifyEnd = 0x4,
    /// An out-of-band alert (e.g. `NoTrustedTime`, `InvalidCert`).
    Alert = 0x5,
    /// Handshake complete; session is ready.
    SessionInitialized = 0x6,
    /// Post-handshake AEAD-encrypted command or notification.
    DataEncrypted = 0x7,
    /// Pre-session or add-lock-mode plaintext command or notification.
    DataNotEncrypted = 0x8,
}

impl TryFrom<u8> for FrameKind {
    type Error = FrameError;

    fn try_from(value: u8) -> Result<Self, Self::Error> {
        match value {
            0x1 => Ok(Self::Hello),
            0x2 => Ok(Self::ServerVerify),
            0x3 => Ok(Self::ClientVerify),
            0x4 => Ok(Self::ClientVerifyEnd),
            0x5 => Ok(Self::Alert),
            0x6 => Ok(Self::SessionInitialized),
            0x7 => Ok(Self::DataEncrypted),
            0x8 => Ok(Self::DataNotEncrypted),
            other => Err(FrameError::InvalidKind(other)),
        }
    }
}

/// A parsed inbound frame: kind, the peer's echoed counter (informational
/// only — tracing, never correlation), and the remaining body bytes.
#[derive(Debug, Clone)]
pub struct Frame {
    /// The frame's kind.
    pub kind: FrameKind,
    /// The high nibble of the original header byte.
    pub counter: u8,
    /// Bytes following the header byte.
    pub body: Vec<u8>,
}

impl Frame {
    /// Parse a frame from raw transport bytes.
    ///
    /// # Errors
    ///
    /// Returns [`FrameError::Empty`] if `data` is empty, or
    /// [`FrameError::InvalidKind`] if the low nibble doesn't match a known
    /// kind.
    pub fn parse(data: &[u8]) -> Result<Self, FrameError> {
        let header = *data.first().ok_or(FrameError::Empty)?;
        let counter = (header & 0xF0) >> 4;
        let kind = FrameKind::try_from(header & 0x0F)?;
        Ok(Self {
            kind,
            counter,
            body: data[1..].to_vec(),
        })
    }

    /// Build the outbound bytes for a frame of `kind` carrying `body`.
    ///
    /// The header byte carries only the kind in its low nibble; the
    /// transport backend is responsible for the counter nibble.
    #[must_use]
    pub fn build(kind: FrameKind, body: &[u8]) -> Vec<u8> {
        let mut out = Vec::with_capacity(1 + body.len());
        out.push(kind as u8);
        out.extend_from_slice(body);
        out
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn parse_strips_counter_nibble() {
        let frame = Frame::parse(&[0x37, 0xAA, 0xBB]).unwrap();
        assert_eq!(frame.kind, FrameKind::DataEncrypted);
        assert_eq!(frame.counter, 0x3);
        assert_eq!(frame.body, vec![0xAA, 0xBB]);
    }

    #[test]
    fn build_writes_bare_kind_nibble() {
        let bytes = Frame::build(FrameKind::Hello, &[0x01, 0x02]);
        assert_eq!(bytes, vec![0x01, 0x01, 0x02]);
    }

    #[test]
    fn empty_input_is_rejected() {
        assert!(matches!(Frame::parse(&[]), Err(FrameError::Empty)));
    }

    #[test]
    fn invalid_kind_nibble_is_rejected() {
        assert!(matches!(
            Frame::parse(&[0x0F]),
            Err(FrameError::InvalidKind(0xF))
        ));
        assert!(matches!(
            Frame::parse(&[0x00]),
            Err(FrameError::InvalidKind(0x0))
        ));
    }

    #[test]
    fn build_parse_roundtrip_preserves_kind_and_body() {
        for kind in [
            FrameKind::Hello,
            FrameKind::ServerVerify,
            FrameKind::ClientVerify,
            FrameKind::ClientVerifyEnd,
            FrameKind::Alert,
            FrameKind::SessionInitialized,
            FrameKind::DataEncrypted,
            FrameKind::DataNotEncrypted,
        ] {
            let bytes = Frame::build(kind, b"payload");
            let parsed = Frame::parse(&bytes).unwrap();
            assert_eq!(parsed.kind, kind);
            assert_eq!(parsed.body, b"payload");
        }
    }

    mod proptests {
        use super::*;
        use proptest::prelude::*;

        proptest! {
            #[test]
            fn prop_parse_doesnt_panic(data in prop::collection::vec(any::<u8>(), 0..256)) {
                let _ = Frame::parse(&data);
            }

            #[test]
            fn prop_roundtrip_preserves_body(
                kind_nibble in 1u8..=8,
                counter in 0u8..=15,
                body in prop::collection::vec(any::<u8>(), 0..128)
            ) {
                let kind = FrameKind::try_from(kind_nibble).unwrap();
                let mut bytes = Frame::build(kind, &body);
                bytes[0] |= counter << 4;

                let parsed = Frame::parse(&bytes).unwrap();
                prop_assert_eq!(parsed.kind, kind);
                prop_assert_eq!(parsed.counter, counter);
                prop_assert_eq!(parsed.body, body);
            }
        }
    }
}
