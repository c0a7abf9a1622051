//! Raw packet types for the distribution path

use std::sync::Arc;

/// Numeric identifier of a packet definition.
///
/// Zero is reserved for the transport keepalive; real packet types start at 1.
pub type PacketTypeId = u32;

/// A telemetry packet exactly as it arrived from the link.
///
/// This is the fundamental data unit that flows through the system. Deltas,
/// converted values and replay buckets are all derived from it.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct RawPacket {
    /// Packet definition id
    pub uid: PacketTypeId,

    /// Packet bytes (shared, never mutated after receipt)
    pub data: Arc<[u8]>,
}

impl RawPacket {
    /// Create a new raw packet
    pub fn new(uid: PacketTypeId, data: impl Into<Arc<[u8]>>) -> Self {
        Self { uid, data: data.into() }
    }

    /// Packet length in bytes
    pub fn len(&self) -> usize {
        self.data.len()
    }

    /// Whether the packet carries no bytes
    pub fn is_empty(&self) -> bool {
        self.data.is_empty()
    }
}
