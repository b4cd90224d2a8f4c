//! Fuzz target: magic-byte detection.
//!
//! Detection and per-type matching must agree on every input.
#![no_main]

use libfuzzer_sys::fuzz_target;
use numeral_core::ImageType;

fuzz_target!(|data: &[u8]| {
    match ImageType::detect(data) {
        Some(kind) => assert!(kind.matches_signature(data)),
        None => assert!(ImageType::ALL.iter().all(|t| !t.matches_signature(data))),
    }
});
