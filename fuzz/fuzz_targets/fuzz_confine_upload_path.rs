//! Fuzz target: upload-root confinement.
//!
//! Any path the sandbox accepts must be a strict descendant of the root.
#![no_main]

use std::path::Path;

use libfuzzer_sys::fuzz_target;
use numeral_executor::PathSandbox;

fuzz_target!(|data: &[u8]| {
    let Ok(candidate) = std::str::from_utf8(data) else {
        return;
    };
    let root = Path::new("/srv/numeral/uploads");
    let Ok(sandbox) = PathSandbox::upload_root(root) else {
        return;
    };
    if let Ok(confined) = sandbox.confine(candidate) {
        assert!(confined.as_path().starts_with(root));
        assert_ne!(confined.as_path(), root);
    }
});
