//! Length encoding for the amount-bytes handshake.
//!
//! A transmission length is sent as the smallest number of big-endian bytes
//! (1 to 4) that can hold it, preceded by a one-byte size indicator carrying
//! that count.

use crate::error::{ProtocolError, Result};

/// Largest size indicator
pub const MAX_LENGTH_BYTES: u8 = 4;

/// Number of bytes needed to encode `amount`
///
/// | amount | class |
/// |---|---|
/// | `0..=0xFF` | 1 |
/// | `..=0xFFFF` | 2 |
/// | `..=0xFF_FFFF` | 3 |
/// | `..=0xFFFF_FFFF` | 4 |
pub fn size_class(amount: u32) -> u8 {
    match amount {
        0..=0xFF => 1,
        0x100..=0xFFFF => 2,
        0x1_0000..=0xFF_FFFF => 3,
        _ => 4,
    }
}

/// Whether `indicator` is a usable size indicator
pub fn is_valid_indicator(indicator: u8) -> bool {
    (1..=MAX_LENGTH_BYTES).contains(&indicator)
}

/// Minimal big-endian encoding of `amount`
pub fn encode_amount(amount: u32) -> Vec<u8> {
    let class = size_class(amount) as usize;
    amount.to_be_bytes()[4 - class..].to_vec()
}

/// Decode a big-endian length of 1 to 4 bytes
pub fn decode_amount(bytes: &[u8]) -> Result<u32> {
    if bytes.is_empty() || bytes.len() > MAX_LENGTH_BYTES as usize {
        return Err(ProtocolError::InvalidSizeIndicator { retries: 0 });
    }
    Ok(bytes
        .iter()
        .fold(0u32, |acc, byte| (acc << 8) | u32::from(*byte)))
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_size_class_thresholds() {
        assert_eq!(size_class(1), 1);
        assert_eq!(size_class(255), 1);
        assert_eq!(size_class(256), 2);
        assert_eq!(size_class(65_535), 2);
        assert_eq!(size_class(65_536), 3);
        assert_eq!(size_class(300_000), 3);
        assert_eq!(size_class(16_777_215), 3);
        assert_eq!(size_class(16_777_216), 4);
        assert_eq!(size_class(2_147_483_646), 4);
    }

    #[test]
    fn test_encode_is_minimal() {
        assert_eq!(encode_amount(1), vec![0x01]);
        assert_eq!(encode_amount(300_000), vec![0x04, 0x93, 0xE0]);
        assert_eq!(encode_amount(2_147_483_646), vec![0x7F, 0xFF, 0xFF, 0xFE]);
    }

    #[test]
    fn test_decode() {
        for amount in [1u32, 255, 65_535, 16_777_215, 2_147_483_646] {
            assert_eq!(decode_amount(&encode_amount(amount)).ok(), Some(amount));
        }
        assert!(decode_amount(&[]).is_err());
        assert!(decode_amount(&[0, 0, 0, 0, 1]).is_err());
    }

    #[test]
    fn test_indicator_range() {
        assert!(!is_valid_indicator(0));
        assert!(is_valid_indicator(1));
        assert!(is_valid_indicator(4));
        assert!(!is_valid_indicator(5));
    }
}
