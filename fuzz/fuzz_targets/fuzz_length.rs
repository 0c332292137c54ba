#![no_main]

use libfuzzer_sys::fuzz_target;
use socket_engine::core::length;

fuzz_target!(|data: &[u8]| {
    if let Ok(amount) = length::decode_amount(data) {
        let encoded = length::encode_amount(amount);
        assert!(encoded.len() <= data.len());
        assert_eq!(length::decode_amount(&encoded).ok(), Some(amount));
    }
});
