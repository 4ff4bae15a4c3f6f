#![no_main]
use informant::extract::InformDocument;
use informant::inform::{EnvelopeCodec, InformCodec};
use libfuzzer_sys::fuzz_target;

const KEY: &str = "ba86f2bbe107c7c57eb5f2690775c712";

fuzz_target!(|data: &[u8]| {
    let codec = InformCodec;
    let mut reader = data;
    if let Ok(header) = codec.decode_header(&mut reader) {
        for key in [None, Some(KEY)] {
            if let Ok(plain) = codec.decode_payload(&header, reader, key) {
                let _ = InformDocument::parse(&plain);
            }
        }
    }
    let _ = InformDocument::parse(data);
});
