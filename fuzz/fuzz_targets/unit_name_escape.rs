//! Fuzz target for unit name escaping.
//!
//! Every escaped name must be a valid object path segment and unescape back
//! to the original bytes.

#![no_main]

use libfuzzer_sys::fuzz_target;
use sysjobs::escape::{parse_object_path, path_bus_escape, path_bus_unescape, unit_path};

fuzz_target!(|data: &[u8]| {
    if let Ok(name) = std::str::from_utf8(data) {
        let segment = path_bus_escape(name);
        assert!(segment.bytes().all(|b| b.is_ascii_alphanumeric() || b == b'_'));
        assert_eq!(path_bus_unescape(&segment), name);

        let path = format!("/org/freedesktop/systemd1/unit/{}", segment);
        assert!(parse_object_path(&path).is_ok());

        // Validation may reject the name but must not panic.
        let _ = unit_path(name);
    }
});
