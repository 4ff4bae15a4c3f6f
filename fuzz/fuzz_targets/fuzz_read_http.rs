#![no_main]
use informant::protocol::http::{read_request, read_response, HttpLimits};
use libfuzzer_sys::fuzz_target;

fuzz_target!(|data: &[u8]| {
    let limits = HttpLimits::default();
    let _ = read_request(&mut &data[..], &limits);
    let _ = read_response(&mut &data[..], &limits);
});
