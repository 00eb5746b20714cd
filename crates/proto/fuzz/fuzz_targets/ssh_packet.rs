//! Fuzz target for packet and message decoding.
//!
//! Feeds arbitrary bytes through plaintext unframing and the message
//! registry, looking for panics and non-canonical round trips.
//!
//! Run with:
//! ```bash
//! cd crates/proto
//! cargo +nightly fuzz run ssh_packet -- -max_total_time=300
//! ```

#![no_main]
use bytes::Bytes;
use conduit_proto::ssh::packet::{unframe, MAX_PACKET_SIZE};
use conduit_proto::ssh::Message;
use libfuzzer_sys::fuzz_target;

fuzz_target!(|data: &[u8]| {
    if let Ok(payload) = unframe(data.to_vec(), MAX_PACKET_SIZE) {
        let _ = Message::decode(payload);
    }

    // Whatever decodes must encode back to a message that decodes equally
    if let Ok(msg) = Message::decode(Bytes::copy_from_slice(data)) {
        let reparsed = Message::decode(msg.encode()).expect("re-encoded message must decode");
        assert_eq!(msg, reparsed);
    }
});
