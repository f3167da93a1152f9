#![no_main]

use libfuzzer_sys::fuzz_target;
use speedbump::patterns::parse_targets;

fuzz_target!(|data: &[u8]| {
    if let Ok(input) = std::str::from_utf8(data) {
        // Parsing and matching must never panic, whatever the file holds
        if let Ok(patterns) = parse_targets(input) {
            for pattern in &patterns {
                let _ = pattern.matches(input, input);
            }
        }
    }
});
