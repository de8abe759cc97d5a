//! Fuzz target for TOML config parsing.
//!
//! Ensures that malformed TOML input doesn't cause panics.

#![no_main]

use libfuzzer_sys::fuzz_target;
use sysjobs::Config;

fuzz_target!(|data: &[u8]| {
    // Only process valid UTF-8 strings
    if let Ok(s) = std::str::from_utf8(data) {
        // Parsing and validation must not panic on any input
        if let Ok(config) = Config::parse(s) {
            let rendered = toml::to_string_pretty(&config).expect("valid config serializes");
            assert_eq!(Config::parse(&rendered).ok(), Some(config));
        }
    }
});
