//! Test fixtures shared by unit tests and benchmarks
//!
//! Provides a small telemetry dictionary with two packets and a byte builder
//! for each, so tests can describe frames by field value instead of by hex.

#![cfg(any(test, feature = "benchmark"))]

use async_trait::async_trait;
use std::sync::Arc;

use crate::datastore::{Datastore, DatastoreConnector};
use crate::definitions::Dictionary;
use crate::types::{
    ByteOrder, Enumeration, FieldDefinition, FieldType, PacketDefinition, PacketTypeId, Polynomial, Sum,
};
use crate::{Result, TelemuxError};

/// Housekeeping packet id.
pub const HK_UID: PacketTypeId = 1;

/// 1553 health-and-status packet id.
pub const HS_UID: PacketTypeId = 2;

/// `HK`: two bus voltages, a mode enumeration, the last command opcode, a
/// GPS timestamp and a signed temperature, plus the derived voltage sum.
///
/// | Field | Type | Offset |
/// |---|---|---|
/// | Voltage_A | MSB_U16, `0.5 * x` | 0 |
/// | Voltage_B | MSB_U16 | 2 |
/// | Mode | U8, SAFE/NOMINAL/SCIENCE | 4 |
/// | LastCmd | CMD16 | 5 |
/// | Timestamp | TIME64 | 7 |
/// | Temp | MSB_I16 | 15 |
pub fn hk_definition() -> PacketDefinition {
    PacketDefinition::builder(HK_UID, "HK")
        .with_field(
            FieldDefinition::new("Voltage_A", FieldType::U16(ByteOrder::Big))
                .with_conversion(Polynomial::new(vec![0.0, 0.5]))
                .with_description("Bus A voltage"),
        )
        .field("Voltage_B", FieldType::U16(ByteOrder::Big))
        .with_field(
            FieldDefinition::new("Mode", FieldType::U8)
                .with_enumeration(Enumeration::new([(0, "SAFE"), (1, "NOMINAL"), (2, "SCIENCE")])),
        )
        .field("LastCmd", FieldType::Cmd16)
        .field("Timestamp", FieldType::Time64)
        .field("Temp", FieldType::I16(ByteOrder::Big))
        .derivation("Voltage_Sum", Sum::of(["Voltage_A", "Voltage_B"]))
        .build()
        .expect("HK fixture is valid")
}

/// `1553_HS`: status byte, message counter and bus current. No conversions.
pub fn hs_definition() -> PacketDefinition {
    PacketDefinition::builder(HS_UID, "1553_HS")
        .field("Status", FieldType::U8)
        .field("Counter", FieldType::U32(ByteOrder::Big))
        .field("Current", FieldType::F32(ByteOrder::Big))
        .build()
        .expect("1553_HS fixture is valid")
}

/// Dictionary with both fixture packets and two commands.
pub fn fixture_dictionary() -> Dictionary {
    Dictionary::new()
        .with_packet(hk_definition())
        .and_then(|d| d.with_packet(hs_definition()))
        .expect("fixture packets do not collide")
        .with_command(1, "NO_OP")
        .with_command(2, "SEQ_START")
        .with_evr(1, "BOOT")
}

pub fn fixture_definitions() -> Arc<Dictionary> {
    Arc::new(fixture_dictionary())
}

/// Field values of an `HK` frame.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub struct HkFrame {
    pub voltage_a: u16,
    pub voltage_b: u16,
    pub mode: u8,
    pub last_cmd: u16,
    pub timestamp: u32,
    pub temp: i16,
}

impl Default for HkFrame {
    fn default() -> Self {
        Self { voltage_a: 0, voltage_b: 0, mode: 0, last_cmd: 1, timestamp: 1_000_000, temp: 0 }
    }
}

impl HkFrame {
    pub fn voltages(mut self, a: u16, b: u16) -> Self {
        self.voltage_a = a;
        self.voltage_b = b;
        self
    }

    pub fn mode(mut self, mode: u8) -> Self {
        self.mode = mode;
        self
    }

    pub fn last_cmd(mut self, opcode: u16) -> Self {
        self.last_cmd = opcode;
        self
    }

    /// Whole GPS seconds; the fraction is always zero.
    pub fn timestamp(mut self, seconds: u32) -> Self {
        self.timestamp = seconds;
        self
    }

    pub fn temp(mut self, temp: i16) -> Self {
        self.temp = temp;
        self
    }

    pub fn bytes(&self) -> Vec<u8> {
        let mut bytes = Vec::with_capacity(17);
        bytes.extend_from_slice(&self.voltage_a.to_be_bytes());
        bytes.extend_from_slice(&self.voltage_b.to_be_bytes());
        bytes.push(self.mode);
        bytes.extend_from_slice(&self.last_cmd.to_be_bytes());
        bytes.extend_from_slice(&self.timestamp.to_be_bytes());
        bytes.extend_from_slice(&0u32.to_be_bytes());
        bytes.extend_from_slice(&self.temp.to_be_bytes());
        bytes
    }
}

/// Bytes of a `1553_HS` frame.
pub fn hs_bytes(status: u8, counter: u32, current: f32) -> Vec<u8> {
    let mut bytes = Vec::with_capacity(9);
    bytes.push(status);
    bytes.extend_from_slice(&counter.to_be_bytes());
    bytes.extend_from_slice(&current.to_be_bytes());
    bytes
}

/// Connector whose datastore is never reachable.
#[derive(Debug, Clone, Copy, Default)]
pub struct FailingConnector;

#[async_trait]
impl DatastoreConnector for FailingConnector {
    async fn connect(&self) -> Result<Arc<dyn Datastore>> {
        Err(TelemuxError::datastore_unavailable("connection refused"))
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn fixture_layouts_match_builders() {
        assert_eq!(hk_definition().size, HkFrame::default().bytes().len());
        assert_eq!(hs_definition().size, hs_bytes(0, 0, 0.0).len());
        assert_eq!(fixture_dictionary().len(), 2);
    }
}
