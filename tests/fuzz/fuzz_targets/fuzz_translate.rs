#![no_main]
use libfuzzer_sys::fuzz_target;

fuzz_target!(|data: &[u8]| {
    // Translation and branch extraction must not panic on any template.
    if let Ok(s) = std::str::from_utf8(data) {
        if let Ok(code) = tmplcov::compiler::translate(s) {
            let _ = tmplcov::branches::BranchExtractor::new(&code);
        }
    }
});
