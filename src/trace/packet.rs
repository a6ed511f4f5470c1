//! Packets: a fixed header, a length-prefixed JSON payload and a raw blob
//! area that payload fields point into with `BlobRef`.
//!
//! ```text
//!  0  size (whole packet)    u64
//!  8  global index           u64
//! 16  packet id              u16
//! 18  tracer id              u8
//! 19  tag                    u8
//! 20  thread id              u32
//! 24  entrypoint begin (ns)  u64
//! 32  entrypoint end (ns)    u64
//! 40  payload length         u32
//! 44  reserved               u32
//! 48  payload, then blobs
//! ```

use crate::{
    api::calls::{ApiCall, BlobRef, CallId, FIRST_CALL_ID},
    trace::TraceError,
};
use serde::{Deserialize, Serialize};

pub const PACKET_HEADER_SIZE: usize = 48;

/// Ids of packets that carry no API call. Everything from `FIRST_CALL_ID`
/// upwards is an API call.
pub const PACKET_ID_MESSAGE: u16 = 1;
pub const PACKET_ID_MARKER: u16 = 2;
pub const PACKET_ID_METADATA: u16 = 3;
pub const PACKET_ID_PORTABILITY_TABLE: u16 = 4;

pub const TRACER_ID_PMTRACE: u8 = 1;

bitflags! {
    #[derive(Default)]
    pub struct PacketTag: u8 {
        /// Written by the capture layer, not by an application call.
        const INJECTED = 0x1;
        /// Acceleration structure addresses were captured for replay.
        const AS_CAPTURE_REPLAY = 0x2;
        /// Buffer device addresses were captured for replay.
        const BUFFER_CAPTURE_REPLAY = 0x4;
    }
}

#[derive(Copy, Clone, Debug, Default, Eq, PartialEq)]
pub struct PacketHeader {
    pub size: u64,
    pub global_index: u64,
    pub packet_id: u16,
    pub tracer_id: u8,
    pub tag: PacketTag,
    pub thread_id: u32,
    pub entrypoint_begin: u64,
    pub entrypoint_end: u64,
    pub payload_len: u32,
}

impl PacketHeader {
    pub fn encode(&self) -> [u8; PACKET_HEADER_SIZE] {
        let mut b = [0u8; PACKET_HEADER_SIZE];
        b[0..8].copy_from_slice(&self.size.to_le_bytes());
        b[8..16].copy_from_slice(&self.global_index.to_le_bytes());
        b[16..18].copy_from_slice(&self.packet_id.to_le_bytes());
        b[18] = self.tracer_id;
        b[19] = self.tag.bits();
        b[20..24].copy_from_slice(&self.thread_id.to_le_bytes());
        b[24..32].copy_from_slice(&self.entrypoint_begin.to_le_bytes());
        b[32..40].copy_from_slice(&self.entrypoint_end.to_le_bytes());
        b[40..44].copy_from_slice(&self.payload_len.to_le_bytes());
        b
    }

    pub fn decode(b: &[u8; PACKET_HEADER_SIZE]) -> Result<PacketHeader, TraceError> {
        let u64_at = |at: usize| {
            let mut w = [0u8; 8];
            w.copy_from_slice(&b[at..at + 8]);
            u64::from_le_bytes(w)
        };
        let u32_at = |at: usize| u32::from_le_bytes([b[at], b[at + 1], b[at + 2], b[at + 3]]);
        let h = PacketHeader {
            size: u64_at(0),
            global_index: u64_at(8),
            packet_id: u16::from_le_bytes([b[16], b[17]]),
            tracer_id: b[18],
            tag: PacketTag::from_bits_truncate(b[19]),
            thread_id: u32_at(20),
            entrypoint_begin: u64_at(24),
            entrypoint_end: u64_at(32),
            payload_len: u32_at(40),
        };
        if h.size < PACKET_HEADER_SIZE as u64 + h.payload_len as u64 {
            return Err(TraceError::Corrupt(format!(
                "packet {} is {} bytes but claims a {} byte payload",
                h.global_index, h.size, h.payload_len
            )));
        }
        Ok(h)
    }

    pub fn blob_len(&self) -> u64 {
        self.size - PACKET_HEADER_SIZE as u64 - self.payload_len as u64
    }

    pub fn is_api_call(&self) -> bool {
        self.packet_id >= FIRST_CALL_ID
    }

    pub fn kind_name(&self) -> &'static str {
        match self.packet_id {
            PACKET_ID_MESSAGE => "message",
            PACKET_ID_MARKER => "marker",
            PACKET_ID_METADATA => "metadata",
            PACKET_ID_PORTABILITY_TABLE => "portability table",
            id => match CallId::from_raw(id) {
                Some(c) => c.name(),
                None => "unknown",
            },
        }
    }
}

#[derive(Clone, Debug, Eq, PartialEq, Serialize, Deserialize)]
pub struct Message {
    pub level: String,
    pub text: String,
}

#[derive(Clone, Debug, Eq, PartialEq, Serialize, Deserialize)]
pub struct Marker {
    pub name: String,
}

#[derive(Clone, Debug)]
pub enum PacketBody {
    Call(ApiCall),
    Message(Message),
    Marker(Marker),
    /// Raw metadata JSON, parsed by `metadata::TraceMetadata`.
    MetaData(String),
}

impl PacketBody {
    pub fn packet_id(&self) -> u16 {
        match self {
            PacketBody::Call(c) => c.id().as_raw(),
            PacketBody::Message(_) => PACKET_ID_MESSAGE,
            PacketBody::Marker(_) => PACKET_ID_MARKER,
            PacketBody::MetaData(_) => PACKET_ID_METADATA,
        }
    }

    pub fn encode_payload(&self) -> serde_json::Result<Vec<u8>> {
        match self {
            PacketBody::Call(c) => serde_json::to_vec(c),
            PacketBody::Message(m) => serde_json::to_vec(m),
            PacketBody::Marker(m) => serde_json::to_vec(m),
            PacketBody::MetaData(s) => Ok(s.as_bytes().to_vec()),
        }
    }

    pub fn decode_payload(packet_id: u16, payload: &[u8]) -> Result<PacketBody, TraceError> {
        let body = match packet_id {
            PACKET_ID_MESSAGE => PacketBody::Message(serde_json::from_slice(payload)?),
            PACKET_ID_MARKER => PacketBody::Marker(serde_json::from_slice(payload)?),
            PACKET_ID_METADATA => match String::from_utf8(payload.to_vec()) {
                Ok(s) => PacketBody::MetaData(s),
                Err(_) => return Err(TraceError::Corrupt("metadata is not UTF-8".into())),
            },
            id => {
                let call: ApiCall = serde_json::from_slice(payload)?;
                if call.id().as_raw() != id {
                    return Err(TraceError::Corrupt(format!(
                        "packet id {} carries a {} payload",
                        id,
                        call.name()
                    )));
                }
                PacketBody::Call(call)
            }
        };
        Ok(body)
    }

    pub fn as_call(&self) -> Option<&ApiCall> {
        match self {
            PacketBody::Call(c) => Some(c),
            _ => None,
        }
    }
}

#[derive(Clone, Debug)]
pub struct Packet {
    pub header: PacketHeader,
    pub body: PacketBody,
    pub blobs: Vec<u8>,
    /// Where the packet starts in the file.
    pub file_offset: u64,
}

impl Packet {
    /// Bytes a `BlobRef` points at, if it lies inside this packet.
    pub fn blob(&self, r: BlobRef) -> Option<&[u8]> {
        let start = r.offset as usize;
        let end = start.checked_add(r.size as usize)?;
        self.blobs.get(start..end)
    }

    pub fn is_injected(&self) -> bool {
        self.header.tag.contains(PacketTag::INJECTED)
    }
}

/// Accumulates the raw data that follows a payload.
#[derive(Default)]
pub struct BlobArea {
    bytes: Vec<u8>,
}

impl BlobArea {
    pub fn new() -> BlobArea {
        BlobArea::default()
    }

    pub fn push(&mut self, data: &[u8]) -> BlobRef {
        let r = BlobRef {
            offset: self.bytes.len() as u64,
            size: data.len() as u64,
        };
        self.bytes.extend_from_slice(data);
        r
    }

    pub fn as_bytes(&self) -> &[u8] {
        &self.bytes
    }

    pub fn len(&self) -> usize {
        self.bytes.len()
    }

    pub fn is_empty(&self) -> bool {
        self.bytes.is_empty()
    }
}

#[cfg(test)]
mod test {
    use super::*;
    use crate::api::{calls::CreateShaderModule, handles::HandleField};

    #[test]
    pub fn header_layout() {
        let h = PacketHeader {
            size: 100,
            global_index: 7,
            packet_id: 130,
            tracer_id: TRACER_ID_PMTRACE,
            tag: PacketTag::INJECTED | PacketTag::BUFFER_CAPTURE_REPLAY,
            thread_id: 42,
            entrypoint_begin: 1,
            entrypoint_end: 2,
            payload_len: 40,
        };
        let b = h.encode();
        assert_eq!(b[19], 0x5);
        assert_eq!(&b[16..18], &130u16.to_le_bytes());
        let back = PacketHeader::decode(&b).unwrap();
        assert_eq!(back, h);
        assert_eq!(back.blob_len(), 12);
        assert_eq!(back.kind_name(), "vkCreateShaderModule");

        let mut bad = h;
        bad.size = 50;
        assert!(matches!(PacketHeader::decode(&bad.encode()), Err(TraceError::Corrupt(_))));
    }

    #[test]
    pub fn blob_refs_resolve_inside_the_packet() {
        let mut area = BlobArea::new();
        let _ = area.push(b"abc");
        let code = area.push(&[1, 2, 3, 4]);
        assert_eq!(code, BlobRef { offset: 3, size: 4 });

        let call: ApiCall = CreateShaderModule {
            device: HandleField::new(1),
            code: Some(code),
            module: HandleField::new(2),
            ..Default::default()
        }
        .into();
        let body = PacketBody::Call(call);
        let payload = body.encode_payload().unwrap();
        let decoded = PacketBody::decode_payload(body.packet_id(), &payload).unwrap();
        let p = Packet {
            header: PacketHeader::default(),
            body: decoded,
            blobs: area.as_bytes().to_vec(),
            file_offset: 0,
        };
        let code = match p.body.as_call() {
            Some(ApiCall::CreateShaderModule(c)) => c.code.unwrap(),
            other => panic!("unexpected body {:?}", other),
        };
        assert_eq!(p.blob(code), Some(&[1u8, 2, 3, 4][..]));
        assert_eq!(p.blob(BlobRef { offset: 6, size: 4 }), None);

        assert!(matches!(
            PacketBody::decode_payload(PACKET_ID_MARKER + 200, &payload),
            Err(TraceError::Corrupt(_))
        ));
    }
}
