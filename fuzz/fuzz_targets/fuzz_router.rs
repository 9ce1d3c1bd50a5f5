//! Fuzz target for request routing.
//!
//! Whatever the path, a routed repository never contains `..`.

#![no_main]

use gitgate_server::router::parse_request;
use gitgate_server::{ParsedGitRequest, Route};
use libfuzzer_sys::fuzz_target;

fuzz_target!(|data: &[u8]| {
    let Ok(path) = std::str::from_utf8(data) else {
        return;
    };
    let Ok(uri) = format!("/{}", path.trim_start_matches('/')).parse() else {
        return;
    };

    for method in [axum::http::Method::GET, axum::http::Method::POST] {
        if let Ok(parsed) = parse_request(&method, &uri) {
            assert!(!parsed.repo().contains(".."));
            assert!(!parsed.repo().is_empty());
            if let ParsedGitRequest::Info { .. } = parsed {
                assert_eq!(parsed.route(), Route::Info);
            }
        }
    }
});
