//! Fuzz target for packet decoding.
//!
//! # Properties Tested
//! - No panics on arbitrary input
//! - Anything that decodes re-encodes to the exact same bytes (the layout is canonical)

#![no_main]

use libfuzzer_sys::fuzz_target;

use netplay_rollback::network::codec::{decode_packet, encode_packet, packet_len};

fuzz_target!(|data: &[u8]| {
    if let Ok(packet) = decode_packet(data) {
        assert_eq!(packet_len(&packet), data.len());
        assert_eq!(encode_packet(&packet), data);
    }
});
