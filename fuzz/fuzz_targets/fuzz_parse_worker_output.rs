//! Fuzz target: worker stdout parser.
//!
//! Arbitrary stdout must either parse into an in-range result or be
//! rejected; it must never panic.
#![no_main]

use libfuzzer_sys::fuzz_target;
use numeral_executor::{parse_worker_output, WorkerOutput};

fuzz_target!(|data: &[u8]| {
    let output = WorkerOutput { stdout: data.to_vec(), stderr: Vec::new(), exit_code: Some(0) };
    if let Ok(result) = parse_worker_output(&output) {
        assert!(result.digit.value() <= 9, "digit out of range");
        let c = result.confidence.value();
        assert!((0.0..=1.0).contains(&c), "confidence out of range");
    }
});
