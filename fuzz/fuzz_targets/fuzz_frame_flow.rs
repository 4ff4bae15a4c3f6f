#![no_main]
use informant::framer::{FlowFramer, MessageHandler};
use informant::protocol::http::{HttpLimits, HttpMessage};
use informant::protocol::FlowKey;
use informant::reassembly::stream;
use libfuzzer_sys::fuzz_target;

struct Discard;

impl MessageHandler for Discard {
    fn handle(&self, _flow: &FlowKey, _message: HttpMessage) {}
}

fuzz_target!(|data: &[u8]| {
    // First byte picks the chunk size so split markers get exercised.
    let Some((&split, rest)) = data.split_first() else {
        return;
    };
    let size = usize::from(split % 32) + 1;
    let chunks: Vec<&[u8]> = rest.chunks(size).collect();
    let (writer, s) = stream::channel(chunks.len() + 1);
    for c in chunks {
        writer.send(c.to_vec());
    }
    drop(writer);

    let flow = FlowKey::new(
        "10.0.0.5:40000".parse().unwrap(),
        "10.0.0.1:8080".parse().unwrap(),
    );
    let limits = HttpLimits {
        max_head_bytes: 8 * 1024,
        max_body_bytes: 64 * 1024,
    };
    let _ = FlowFramer::new(flow, s, &Discard, limits).run();
});
