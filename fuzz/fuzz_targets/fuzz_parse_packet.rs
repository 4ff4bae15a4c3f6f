#![no_main]
use informant::protocol::LinkType;
use libfuzzer_sys::fuzz_target;

fuzz_target!(|data: &[u8]| {
    for link_type in [LinkType::Ethernet, LinkType::RawIp, LinkType::LinuxSll] {
        let _ = informant::protocol::parse_packet(data, link_type);
    }
});
