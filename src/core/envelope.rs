//! # Message Envelope
//!
//! Binary representation of a [`Message`] as carried in a TCP payload or a
//! single UDP datagram. All integers are big-endian.
//!
//! ```text
//! [0-1] message box id
//! [2-3] amount (messages in the batch)
//! [4-5] number (sequence within the batch)
//! [6]   type length
//! [7..] type (UTF-8)
//! [..]  data
//! ```
//!
//! The data length is implied by the envelope size.

use bytes::{Buf, BufMut, Bytes, BytesMut};

use crate::error::{constants, ProtocolError, Result};

/// Fixed header bytes before the type string
pub const HEADER_LEN: usize = 7;

/// Longest type string a one-byte length can describe
pub const MAX_KIND_LEN: usize = u8::MAX as usize;

/// An application message routed through a message box
#[derive(Debug, Clone, PartialEq, Eq, Default)]
pub struct Message {
    /// Target message box
    pub box_id: u16,
    /// Total messages in the batch
    pub amount: u16,
    /// Sequence number within the batch
    pub number: u16,
    /// Free-form type tag
    pub kind: String,
    /// Application data
    pub payload: Bytes,
}

impl Message {
    /// A single-message batch for `box_id`
    pub fn new<K: Into<String>, P: Into<Bytes>>(box_id: u16, kind: K, payload: P) -> Self {
        Self {
            box_id,
            amount: 1,
            number: 1,
            kind: kind.into(),
            payload: payload.into(),
        }
    }

    /// Set the batch position
    pub fn with_sequence(mut self, number: u16, amount: u16) -> Self {
        self.number = number;
        self.amount = amount;
        self
    }

    /// Encoded size in bytes
    pub fn encoded_len(&self) -> usize {
        HEADER_LEN + self.kind.len() + self.payload.len()
    }

    /// Serialize into the wire envelope
    pub fn encode(&self) -> Result<Bytes> {
        if self.kind.len() > MAX_KIND_LEN {
            return Err(ProtocolError::InvalidEnvelope(
                constants::ERR_ENVELOPE_TYPE_TOO_LONG,
            ));
        }

        let mut buf = BytesMut::with_capacity(self.encoded_len());
        buf.put_u16(self.box_id);
        buf.put_u16(self.amount);
        buf.put_u16(self.number);
        buf.put_u8(self.kind.len() as u8);
        buf.put_slice(self.kind.as_bytes());
        buf.put_slice(&self.payload);
        Ok(buf.freeze())
    }

    /// Parse a wire envelope
    pub fn decode(bytes: &[u8]) -> Result<Self> {
        if bytes.len() < HEADER_LEN {
            return Err(ProtocolError::InvalidEnvelope(
                constants::ERR_ENVELOPE_TRUNCATED,
            ));
        }

        let mut buf = bytes;
        let box_id = buf.get_u16();
        let amount = buf.get_u16();
        let number = buf.get_u16();
        let kind_len = buf.get_u8() as usize;

        if buf.remaining() < kind_len {
            return Err(ProtocolError::InvalidEnvelope(
                constants::ERR_ENVELOPE_TYPE_OVERRUN,
            ));
        }

        let kind = std::str::from_utf8(&buf[..kind_len])
            .map_err(|_| ProtocolError::InvalidEnvelope(constants::ERR_ENVELOPE_TYPE_UTF8))?
            .to_string();
        buf.advance(kind_len);

        Ok(Self {
            box_id,
            amount,
            number,
            kind,
            payload: Bytes::copy_from_slice(buf),
        })
    }
}

#[cfg(test)]
#[allow(clippy::unwrap_used)]
mod tests {
    use super::*;

    #[test]
    fn test_layout() {
        let msg = Message::new(0x0102, "ab", &b"xyz"[..]).with_sequence(3, 4);
        let bytes = msg.encode().unwrap();
        assert_eq!(
            bytes.as_ref(),
            &[0x01, 0x02, 0x00, 0x04, 0x00, 0x03, 0x02, b'a', b'b', b'x', b'y', b'z']
        );
        assert_eq!(Message::decode(&bytes).ok(), Some(msg));
    }

    #[test]
    fn test_empty_payload_and_kind() {
        let msg = Message::new(7, "", Bytes::new());
        let bytes = msg.encode().unwrap();
        assert_eq!(bytes.len(), HEADER_LEN);
        assert_eq!(Message::decode(&bytes).ok(), Some(msg));
    }

    #[test]
    fn test_rejects_malformed() {
        assert!(matches!(
            Message::decode(&[0, 1, 0]),
            Err(ProtocolError::InvalidEnvelope(_))
        ));
        // type length 9 but only 2 bytes follow
        assert!(matches!(
            Message::decode(&[0, 0, 0, 1, 0, 1, 9, b'a', b'b']),
            Err(ProtocolError::InvalidEnvelope(_))
        ));
        assert!(matches!(
            Message::decode(&[0, 0, 0, 1, 0, 1, 2, 0xFF, 0xFE]),
            Err(ProtocolError::InvalidEnvelope(_))
        ));
    }

    #[test]
    fn test_kind_too_long() {
        let msg = Message::new(0, "k".repeat(256), Bytes::new());
        assert!(msg.encode().is_err());
    }
}
