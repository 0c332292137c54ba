#![no_main]

use libfuzzer_sys::fuzz_target;
use socket_engine::Message;

fuzz_target!(|data: &[u8]| {
    // Fuzz envelope decoding
    if let Ok(msg) = Message::decode(data) {
        // A decoded envelope must re-encode to the same bytes
        let encoded = msg.encode().expect("decoded envelope re-encodes");
        assert_eq!(&encoded[..], data);
    }
});
