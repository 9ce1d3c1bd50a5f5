//! Fuzz target for request header sniffing.

#![no_main]

use gitgate_protocol::{sniff, Service, Sniff};
use libfuzzer_sys::fuzz_target;

fuzz_target!(|data: &[u8]| {
    for service in [Service::UploadPack, Service::ReceivePack] {
        // At end of input the section is always settled.
        if let Ok(result) = sniff(service, data, true) {
            assert_ne!(result, Sniff::Incomplete);
        }
        let _ = sniff(service, data, false);
    }
});
