//! Binary telemetry framing.
//!
//! ```text
//! ┌──────────┬───────────────────┬──────────────┐
//! │ 1 byte   │ 4 bytes           │ N bytes      │
//! │ pad (0)  │ packet id (BE)    │ packet bytes │
//! └──────────┴───────────────────┴──────────────┘
//! ```
//!
//! The leading pad byte makes every frame binary for socket layers that sniff
//! content. Packet id 0 with no payload is the keepalive; real ids start at 1.

use bytes::{Buf, BufMut, Bytes, BytesMut};

use crate::types::PacketTypeId;

/// Pad byte value.
pub const PAD: u8 = 0x00;

/// Pad plus packet id.
pub const HEADER_LEN: usize = 5;

/// Packet id reserved for keepalive frames.
pub const KEEPALIVE_ID: PacketTypeId = 0;

/// Frame one packet.
pub fn encode_packet(uid: PacketTypeId, payload: &[u8]) -> Bytes {
    let mut buf = BytesMut::with_capacity(HEADER_LEN + payload.len());
    buf.put_u8(PAD);
    buf.put_u32(uid);
    buf.put_slice(payload);
    buf.freeze()
}

/// The null packet sent after an idle timeout.
pub fn keepalive() -> Bytes {
    encode_packet(KEEPALIVE_ID, &[])
}

/// Split a frame into packet id and payload.
pub fn decode(frame: &[u8]) -> Option<(PacketTypeId, &[u8])> {
    if frame.len() < HEADER_LEN || frame[0] != PAD {
        return None;
    }
    let mut header = &frame[1..HEADER_LEN];
    Some((header.get_u32(), &frame[HEADER_LEN..]))
}

pub fn is_keepalive(frame: &[u8]) -> bool {
    matches!(decode(frame), Some((KEEPALIVE_ID, payload)) if payload.is_empty())
}
