//! Fuzz target for pkt-line framing.
//!
//! Packet-at-a-time reading and whole-buffer splitting must agree on
//! arbitrary input and never panic.

#![no_main]

use gitgate_protocol::{next_pkt_line, split_pkt_lines, PktLine};
use libfuzzer_sys::fuzz_target;

fuzz_target!(|data: &[u8]| {
    let mut stepped = Vec::new();
    let mut pos = 0;
    while let Ok(Some((pkt, used))) = next_pkt_line(&data[pos..]) {
        assert!(used >= 4);
        stepped.push(pkt);
        pos += used;
    }

    if let Ok((packets, consumed)) = split_pkt_lines(data) {
        assert_eq!(consumed, pos);
        assert_eq!(packets, stepped);
        for pkt in packets {
            if let PktLine::Data(payload) = &pkt {
                let encoded = pkt.encode().expect("decoded packets re-encode");
                assert_eq!(encoded.len(), payload.len() + 4);
            }
        }
    }
});
