//! Core types for telemetry data representation.
//!
//! This module provides the data structures shared by every stage of the
//! distribution path: raw packets, packet layouts, decoded values and the
//! items that sit in session channels.
//!
//! ## Architecture
//!
//! - [`RawPacket`] is a packet exactly as received, with zero-copy shared bytes
//! - [`PacketDefinition`] describes a packet layout and decodes/encodes it
//! - [`FieldType`] is the byte codec of one field (`MSB_U16`, `TIME64`, ...)
//! - [`Value`] is the runtime representation of a decoded or converted field
//! - [`Conversion`] and [`Derivation`] turn raw values into meaningful ones
//! - [`TelemetryItem`], [`DeltaItem`], [`Event`] and [`LogMessage`] are what
//!   session channels carry
//!
//! ## Usage Example
//!
//! ```rust
//! use telemux::types::{ByteOrder, FieldType, PacketDefinition, Polynomial, FieldDefinition, Value};
//!
//! let hk = PacketDefinition::builder(1, "HK")
//!     .with_field(
//!         FieldDefinition::new("Voltage", FieldType::U16(ByteOrder::Big))
//!             .with_conversion(Polynomial::new(vec![0.0, 0.5])),
//!     )
//!     .field("Mode", FieldType::U8)
//!     .build()
//!     .unwrap();
//!
//! let raw = hk.decode(&[0x00, 0x0A, 0x02]).unwrap();
//! assert_eq!(raw["Voltage"], Value::UInt(10));
//! assert_eq!(raw["Mode"], Value::UInt(2));
//! assert!(hk.field("Voltage").unwrap().needs_conversion());
//! ```

mod conversion;
mod field_type;
mod item;
mod packet;
mod schema;
mod value;

// Re-export all public types
pub use conversion::{
    Conversion, ConversionError, Derivation, Enumeration, FnConversion, FnDerivation, Polynomial, Resolved,
    Sum,
};
pub use field_type::{ByteOrder, FieldType, gps_epoch};
pub use item::{DeltaItem, Event, LogMessage, Severity, TelemetryItem};
pub use packet::{PacketTypeId, RawPacket};
pub use schema::{DerivationDefinition, FieldDefinition, PacketDefinition, PacketDefinitionBuilder};
pub use value::{FieldMap, Value, iso8601};

#[cfg(test)]
mod tests {
    use super::*;

    use proptest::prelude::*;
    use std::collections::HashMap;

    fn arb_field_type() -> impl Strategy<Value = FieldType> {
        let order = prop::sample::select(vec![ByteOrder::Big, ByteOrder::Little]);
        prop_oneof![
            Just(FieldType::U8),
            Just(FieldType::I8),
            Just(FieldType::Cmd16),
            Just(FieldType::Evr16),
            order.clone().prop_map(FieldType::U16),
            order.clone().prop_map(FieldType::I16),
            order.clone().prop_map(FieldType::U32),
            order.clone().prop_map(FieldType::I32),
            order.clone().prop_map(FieldType::U64),
            order.clone().prop_map(FieldType::I64),
            order.clone().prop_map(FieldType::F32),
            order.prop_map(FieldType::F64),
        ]
    }

    proptest! {
        #[test]
        fn prop_field_type_names_parse_back(field_type in arb_field_type()) {
            let parsed: FieldType = field_type.to_string().parse().unwrap();
            prop_assert_eq!(parsed, field_type);
        }

        #[test]
        fn prop_integer_fields_reencode_to_the_same_bytes(
            field_type in arb_field_type(),
            bytes in prop::collection::vec(any::<u8>(), 8)
        ) {
            // Floats are excluded: NaN payloads do not survive an f64 detour.
            prop_assume!(!matches!(field_type, FieldType::F32(_) | FieldType::F64(_)));

            let size = field_type.size();
            let value = field_type.decode(&bytes).unwrap();
            let mut out = Vec::new();
            field_type.encode(&value, &mut out).unwrap();
            prop_assert_eq!(&out[..], &bytes[..size]);
        }

        #[test]
        fn prop_decode_never_reads_past_short_input(
            field_type in arb_field_type(),
            bytes in prop::collection::vec(any::<u8>(), 0..8)
        ) {
            let decoded = field_type.decode(&bytes);
            prop_assert_eq!(decoded.is_some(), bytes.len() >= field_type.size());
        }
    }

    #[test]
    fn unknown_type_names_are_definition_errors() {
        let err = "MSB_U24".parse::<FieldType>().unwrap_err();
        assert!(matches!(err, crate::TelemuxError::Definition { .. }));
        assert!("PACKED".parse::<FieldType>().is_err());
    }

    #[test]
    fn time64_decodes_gps_seconds_and_fraction() {
        let mut bytes = 1_000_000u32.to_be_bytes().to_vec();
        bytes.extend_from_slice(&0x8000_0000u32.to_be_bytes());

        let value = FieldType::Time64.decode(&bytes).unwrap();
        assert_eq!(value, Value::Float(1_000_000.5));

        let time = FieldType::gps_time(1_000_000.5).unwrap();
        assert_eq!(iso8601(&time), "1980-01-17T13:46:40.500000Z");

        let mut out = Vec::new();
        FieldType::Time64.encode(&Value::Time(time), &mut out).unwrap();
        assert_eq!(out, bytes);
    }

    #[test]
    fn encode_rejects_values_that_do_not_fit() {
        let mut out = Vec::new();
        assert!(FieldType::U8.encode(&Value::UInt(256), &mut out).is_err());
        assert!(FieldType::I16(ByteOrder::Big).encode(&Value::Int(-40_000), &mut out).is_err());
        assert!(FieldType::U16(ByteOrder::Little).encode(&Value::Float(1.5), &mut out).is_err());
        assert!(FieldType::U32(ByteOrder::Big).encode(&Value::from("ten"), &mut out).is_err());
        assert!(out.is_empty());
    }

    #[test]
    fn packet_definition_rejects_reserved_id_and_duplicates() {
        let reserved = PacketDefinition::builder(0, "NULL").field("A", FieldType::U8).build();
        assert!(matches!(reserved, Err(crate::TelemuxError::Definition { .. })));

        let duplicate = PacketDefinition::builder(3, "DUP")
            .field("A", FieldType::U8)
            .derivation("A", Sum::of(["A"]))
            .build();
        assert!(matches!(duplicate, Err(crate::TelemuxError::Definition { .. })));
    }

    #[test]
    fn packet_definition_packs_fields_and_roundtrips() {
        let defn = PacketDefinition::builder(4, "PWR")
            .field("Bus", FieldType::U16(ByteOrder::Big))
            .field("Load", FieldType::I32(ByteOrder::Little))
            .field("Flag", FieldType::U8)
            .build()
            .unwrap();
        assert_eq!(defn.size, 7);
        assert_eq!(defn.field("Load").unwrap().offset, 2);
        assert_eq!(defn.field("Flag").unwrap().offset, 6);

        let bytes = [0x01, 0x02, 0xFE, 0xFF, 0xFF, 0xFF, 0x07];
        let raw = defn.decode(&bytes).unwrap();
        assert_eq!(raw["Bus"], Value::UInt(0x0102));
        assert_eq!(raw["Load"], Value::Int(-2));
        assert_eq!(raw["Flag"], Value::UInt(7));

        let values: HashMap<String, Value> = raw.into_iter().collect();
        assert_eq!(defn.encode(&values).unwrap(), bytes.to_vec());
    }

    #[test]
    fn short_packets_fail_to_decode() {
        let defn = PacketDefinition::builder(5, "SHORT").field("A", FieldType::U32(ByteOrder::Big)).build().unwrap();
        let err = defn.decode(&[0x00, 0x01]).unwrap_err();
        assert!(matches!(err, crate::TelemuxError::Decode { .. }));
    }

    #[test]
    fn missing_values_fail_to_encode() {
        let defn = PacketDefinition::builder(6, "ONE").field("A", FieldType::U8).build().unwrap();
        let err = defn.encode(&HashMap::new()).unwrap_err();
        assert!(matches!(err, crate::TelemuxError::Encode { ref field, .. } if field == "A"));
    }

    #[test]
    fn delta_item_serializes_with_wire_names() {
        let mut delta = FieldMap::new();
        delta.insert("A".into(), Value::UInt(1));
        let item = DeltaItem {
            packet: "HK".into(),
            delta: std::sync::Arc::new(delta),
            converted: std::sync::Arc::new(FieldMap::new()),
            counter: 3,
        };
        let json = serde_json::to_value(&item).unwrap();
        assert_eq!(json, serde_json::json!({"packet": "HK", "data": {"A": 1}, "dntoeus": {}, "counter": 3}));
    }
}
