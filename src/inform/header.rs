use serde::{Serialize, Serializer};
use std::io::Read;

use crate::error::CodecError;

pub const MAGIC: [u8; 4] = *b"TNBU";
pub const HEADER_LEN: usize = 40;

/// Payload is encrypted.
pub const FLAG_ENCRYPTED: u16 = 0x01;
/// Payload is zlib-compressed (before encryption).
pub const FLAG_ZLIB: u16 = 0x02;
/// Payload is snappy-compressed.
pub const FLAG_SNAPPY: u16 = 0x04;
/// Encryption is AES-GCM rather than AES-CBC.
pub const FLAG_GCM: u16 = 0x08;

/// Fixed-size envelope header that precedes the payload.
#[derive(Debug, Clone, PartialEq, Eq, Serialize)]
pub struct InformHeader {
    pub version: u32,
    #[serde(serialize_with = "mac_string")]
    pub mac: [u8; 6],
    pub flags: u16,
    #[serde(serialize_with = "hex_string")]
    pub iv: [u8; 16],
    pub payload_version: u32,
    pub payload_len: u32,
}

impl InformHeader {
    pub fn new(mac: [u8; 6], flags: u16, iv: [u8; 16]) -> Self {
        InformHeader {
            version: 0,
            mac,
            flags,
            iv,
            payload_version: 1,
            payload_len: 0,
        }
    }

    pub fn is_encrypted(&self) -> bool {
        self.flags & FLAG_ENCRYPTED != 0
    }

    pub fn is_zlib(&self) -> bool {
        self.flags & FLAG_ZLIB != 0
    }

    pub fn is_snappy(&self) -> bool {
        self.flags & FLAG_SNAPPY != 0
    }

    pub fn is_gcm(&self) -> bool {
        self.flags & FLAG_GCM != 0
    }

    pub fn read_from<R: Read + ?Sized>(reader: &mut R) -> Result<Self, CodecError> {
        let mut buf = Vec::with_capacity(HEADER_LEN);
        reader.take(HEADER_LEN as u64).read_to_end(&mut buf)?;
        if buf.len() < HEADER_LEN {
            return Err(CodecError::Truncated {
                needed: HEADER_LEN,
                have: buf.len(),
            });
        }

        let magic = [buf[0], buf[1], buf[2], buf[3]];
        if magic != MAGIC {
            return Err(CodecError::InvalidMagic(magic));
        }

        let mut mac = [0u8; 6];
        mac.copy_from_slice(&buf[8..14]);
        let mut iv = [0u8; 16];
        iv.copy_from_slice(&buf[16..32]);

        Ok(InformHeader {
            version: be_u32(&buf[4..8]),
            mac,
            flags: u16::from_be_bytes([buf[14], buf[15]]),
            iv,
            payload_version: be_u32(&buf[32..36]),
            payload_len: be_u32(&buf[36..40]),
        })
    }

    pub fn to_bytes(&self) -> [u8; HEADER_LEN] {
        let mut out = [0u8; HEADER_LEN];
        out[0..4].copy_from_slice(&MAGIC);
        out[4..8].copy_from_slice(&self.version.to_be_bytes());
        out[8..14].copy_from_slice(&self.mac);
        out[14..16].copy_from_slice(&self.flags.to_be_bytes());
        out[16..32].copy_from_slice(&self.iv);
        out[32..36].copy_from_slice(&self.payload_version.to_be_bytes());
        out[36..40].copy_from_slice(&self.payload_len.to_be_bytes());
        out
    }
}

fn be_u32(b: &[u8]) -> u32 {
    u32::from_be_bytes([b[0], b[1], b[2], b[3]])
}

fn mac_string<S: Serializer>(mac: &[u8; 6], s: S) -> Result<S::Ok, S::Error> {
    let text = mac
        .iter()
        .map(|b| format!("{:02x}", b))
        .collect::<Vec<_>>()
        .join(":");
    s.serialize_str(&text)
}

fn hex_string<S: Serializer>(bytes: &[u8; 16], s: S) -> Result<S::Ok, S::Error> {
    s.serialize_str(&hex::encode(bytes))
}
