#![no_main]
use libfuzzer_sys::fuzz_target;

fuzz_target!(|data: &[u8]| {
    // Unparsable fragments are skipped, never fatal.
    if let Ok(s) = std::str::from_utf8(data) {
        let _ = tmplcov::structure::analyze(s);
    }
});
