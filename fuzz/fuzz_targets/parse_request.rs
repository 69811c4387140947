#![no_main]

use libfuzzer_sys::fuzz_target;
use parser::{h1::Request, EMPTY_HEADER};

fuzz_target!(|data: &[u8]| {
    let mut headers = [EMPTY_HEADER; 128];
    let mut req = Request::new(&mut headers);
    // Any outcome other than a panic or memory-safety violation is
    // acceptable: malformed input should produce an Err, truncated input a
    // Status::Partial, well-formed input a Status::Complete.
    let _ = req.parse(data);
});
