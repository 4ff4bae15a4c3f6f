use anyhow::{Context, Result};
use pcap::{Capture, Offline};
use std::path::Path;
use std::time::{Duration, SystemTime, UNIX_EPOCH};
use tracing::warn;

use crate::protocol::LinkType;

pub struct PacketData<'a> {
    pub data: &'a [u8],
    pub timestamp: SystemTime,
}

/// A capture file being read front to back.
pub struct PacketSource {
    cap: Capture<Offline>,
    link_type: LinkType,
}

impl PacketSource {
    pub fn link_type(&self) -> LinkType {
        self.link_type
    }

    /// Open a pcap or pcapng file, optionally narrowed by a BPF filter.
    pub fn from_file(path: &Path, bpf: Option<&str>) -> Result<Self> {
        let mut cap = Capture::from_file(path)
            .with_context(|| format!("Failed to open capture file: {}", path.display()))?;

        if let Some(filter) = bpf {
            cap.filter(filter, true)
                .with_context(|| format!("Invalid BPF filter: {}", filter))?;
        }

        let link_type = link_type_from_pcap(cap.get_datalink());
        Ok(PacketSource { cap, link_type })
    }

    /// Call `f` for every packet in file order.
    /// Return `false` from `f` to stop early.
    pub fn for_each_packet<F>(&mut self, mut f: F) -> Result<()>
    where
        F: FnMut(PacketData) -> bool,
    {
        loop {
            match self.cap.next_packet() {
                Ok(packet) => {
                    let tv = packet.header.ts;
                    let secs = (tv.tv_sec as i64).max(0) as u64;
                    // Malformed files can carry out-of-range microseconds.
                    let usec = (tv.tv_usec as i64).clamp(0, 999_999) as u32;
                    let pkt = PacketData {
                        data: packet.data,
                        timestamp: UNIX_EPOCH + Duration::new(secs, usec * 1000),
                    };
                    if !f(pkt) {
                        break;
                    }
                }
                Err(pcap::Error::NoMorePackets) => break,
                Err(e) => return Err(e).context("Failed to read capture file"),
            }
        }
        Ok(())
    }
}

fn link_type_from_pcap(dl: pcap::Linktype) -> LinkType {
    match dl.0 {
        1 => LinkType::Ethernet,     // DLT_EN10MB
        12 | 101 => LinkType::RawIp, // DLT_RAW
        113 => LinkType::LinuxSll,   // DLT_LINUX_SLL
        _ => {
            warn!(
                link_type = dl.0,
                name = %dl.get_name().unwrap_or_default(),
                "unsupported link type, assuming Ethernet"
            );
            LinkType::Ethernet
        }
    }
}
