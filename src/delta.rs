//! Per-packet-type delta computation.
//!
//! The engine keeps one [`PacketState`] per packet type for the life of the
//! process. The first packet of a type yields every raw field and derivation;
//! later packets yield only what changed, plus every field that carries a
//! conversion function, since conversions may depend on state outside the
//! packet and are recomputed each time.
//!
//! Date-time values are rendered to ISO-8601 text before they leave the engine.

use parking_lot::{Mutex, RwLock};
use serde::Serialize;
use std::collections::{BTreeMap, HashMap};
use std::sync::Arc;
use tracing::{debug, trace, warn};

use crate::Result;
use crate::definitions::Definitions;
use crate::types::{FieldDefinition, FieldMap, PacketDefinition, PacketTypeId, Resolved, Value};

/// Outcome of processing one packet.
#[derive(Debug, Clone, Default, PartialEq)]
pub struct PacketDelta {
    /// Raw values to re-send (every field on the first observation)
    pub delta: FieldMap,
    /// Converted values for the included fields that need conversion
    pub converted: FieldMap,
    /// Whether this was the first packet of its type since startup
    pub first: bool,
}

/// Last-seen values of one packet type.
#[derive(Debug, Clone, Default, PartialEq, Serialize)]
pub struct PacketState {
    pub packet: String,
    pub raw: FieldMap,
    pub converted: FieldMap,
    pub derived: FieldMap,
}

type Slot = Arc<Mutex<Option<PacketState>>>;

/// Stateful diff computer shared by every session.
pub struct DeltaEngine {
    definitions: Arc<dyn Definitions>,
    states: RwLock<HashMap<PacketTypeId, Slot>>,
}

impl std::fmt::Debug for DeltaEngine {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.debug_struct("DeltaEngine").field("packet_types", &self.states.read().len()).finish()
    }
}

impl DeltaEngine {
    pub fn new(definitions: Arc<dyn Definitions>) -> Self {
        Self { definitions, states: RwLock::new(HashMap::new()) }
    }

    pub fn definitions(&self) -> &Arc<dyn Definitions> {
        &self.definitions
    }

    fn slot(&self, uid: PacketTypeId) -> Slot {
        if let Some(slot) = self.states.read().get(&uid) {
            return Arc::clone(slot);
        }
        Arc::clone(self.states.write().entry(uid).or_default())
    }

    /// Compute the delta of `data` against the cached state of its type.
    ///
    /// A packet too short for its layout fails without touching the state.
    /// Conversion and derivation failures never fail the call.
    pub fn compute(&self, defn: &PacketDefinition, data: &[u8]) -> Result<PacketDelta> {
        let raw = defn.decode(data)?;

        let slot = self.slot(defn.uid);
        // Held for the whole read-compare-write cycle of this packet type.
        let mut state = slot.lock();

        let derived = self.derive(defn, &raw);
        let mut out = PacketDelta::default();

        match state.as_mut() {
            None => {
                for field in &defn.fields {
                    if field.needs_conversion() {
                        out.converted.insert(field.name.clone(), self.resolve(defn, field, &raw));
                    }
                }
                out.delta = raw.clone();
                out.delta.extend(derived.clone());
                out.first = true;

                debug!(packet = %defn.name, fields = out.delta.len(), "first packet of type");
                *state = Some(PacketState {
                    packet: defn.name.clone(),
                    raw,
                    converted: out.converted.clone(),
                    derived,
                });
            }
            Some(cached) => {
                for field in &defn.fields {
                    let Some(value) = raw.get(&field.name) else { continue };
                    let changed = cached.raw.get(&field.name) != Some(value);
                    if !changed && field.conversion.is_none() {
                        continue;
                    }
                    out.delta.insert(field.name.clone(), value.clone());
                    if field.needs_conversion() {
                        out.converted.insert(field.name.clone(), self.resolve(defn, field, &raw));
                    }
                }

                for (name, value) in &derived {
                    if cached.derived.get(name) != Some(value) {
                        out.delta.insert(name.clone(), value.clone());
                    }
                }

                cached.raw = raw;
                cached.converted.extend(out.converted.clone());
                cached.derived.extend(derived);
            }
        }

        trace!(packet = %defn.name, changed = out.delta.len(), "delta computed");
        Ok(out)
    }

    /// Snapshot of every packet type seen so far, keyed by packet name.
    pub fn latest(&self) -> BTreeMap<String, PacketState> {
        let slots: Vec<Slot> = self.states.read().values().cloned().collect();
        slots
            .iter()
            .filter_map(|slot| slot.lock().clone())
            .map(|state| (state.packet.clone(), state))
            .collect()
    }

    /// Cached state of packet type `uid`, if one has been processed.
    pub fn state(&self, uid: PacketTypeId) -> Option<PacketState> {
        let slot = self.states.read().get(&uid).cloned()?;
        let state = slot.lock().clone();
        state
    }

    fn derive(&self, defn: &PacketDefinition, raw: &FieldMap) -> FieldMap {
        let mut derived = FieldMap::new();
        for (name, result) in self.definitions.derive(defn, raw) {
            match result {
                Ok(value) => {
                    derived.insert(name, value.into_wire());
                }
                Err(e) => warn!(packet = %defn.name, field = %name, error = %e, "derivation failed"),
            }
        }
        derived
    }

    fn resolve(&self, defn: &PacketDefinition, field: &FieldDefinition, raw: &FieldMap) -> Value {
        let placeholder = field.field_type.unidentified_label();
        match self.definitions.convert(defn, &field.name, raw) {
            Ok(Resolved::Raw(value)) | Ok(Resolved::Converted(value)) => value.into_wire(),
            Ok(Resolved::Label(label)) => Value::Text(label),
            Ok(Resolved::Unidentified) => Value::Text(placeholder.unwrap_or("Unidentified").to_string()),
            Err(e) => {
                trace!(packet = %defn.name, field = %field.name, error = %e, "conversion fell back to raw");
                match placeholder {
                    Some(label) => Value::Text(label.to_string()),
                    None => raw.get(&field.name).cloned().map(Value::into_wire).unwrap_or(Value::Text(String::new())),
                }
            }
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::test_utils::{HK_UID, HS_UID, HkFrame, fixture_definitions, hs_bytes};
    use proptest::prelude::*;

    fn engine() -> (DeltaEngine, Arc<PacketDefinition>, Arc<PacketDefinition>) {
        let definitions = fixture_definitions();
        let hk = definitions.packet(HK_UID).unwrap();
        let hs = definitions.packet(HS_UID).unwrap();
        (DeltaEngine::new(definitions), hk, hs)
    }

    proptest! {
        #[test]
        fn prop_first_delta_is_every_field_and_derivation(
            a in any::<u16>(),
            b in any::<u16>(),
            mode in 0..3u8,
            temp in any::<i16>()
        ) {
            let (engine, hk, _) = engine();
            let bytes = HkFrame::default().voltages(a, b).mode(mode).temp(temp).bytes();

            let out = engine.compute(&hk, &bytes).unwrap();

            prop_assert!(out.first);
            let raw = hk.decode(&bytes).unwrap();
            for (name, value) in &raw {
                prop_assert_eq!(out.delta.get(name), Some(value));
            }
            prop_assert_eq!(out.delta.len(), raw.len() + hk.derivations.len());
            prop_assert_eq!(
                out.delta.get("Voltage_Sum"),
                Some(&Value::Float(f64::from(a) + f64::from(b)))
            );
        }

        #[test]
        fn prop_repeated_packet_without_conversions_yields_empty_delta(
            status in any::<u8>(),
            counter in any::<u32>(),
            current in -100.0f32..100.0
        ) {
            let (engine, _, hs) = engine();
            let bytes = hs_bytes(status, counter, current);
            engine.compute(&hs, &bytes).unwrap();
            let second = engine.compute(&hs, &bytes).unwrap();
            prop_assert!(!second.first);
            prop_assert!(second.delta.is_empty());
            prop_assert!(second.converted.is_empty());
        }
    }

    #[test]
    fn first_delta_converts_every_conversion_bearing_field() {
        let (engine, hk, _) = engine();
        let out = engine.compute(&hk, &HkFrame::default().voltages(10, 4).mode(2).last_cmd(1).bytes()).unwrap();

        assert_eq!(out.converted["Voltage_A"], Value::Float(5.0));
        assert_eq!(out.converted["Mode"], Value::Text("SCIENCE".into()));
        assert_eq!(out.converted["LastCmd"], Value::Text("NO_OP".into()));
        assert_eq!(out.converted["Timestamp"], Value::Text("1980-01-17T13:46:40.000000Z".into()));
        assert!(!out.converted.contains_key("Voltage_B"));
        assert!(!out.converted.contains_key("Temp"));
    }

    #[test]
    fn conversion_fields_are_always_resent() {
        let (engine, hk, _) = engine();
        let bytes = HkFrame::default().voltages(10, 4).bytes();
        engine.compute(&hk, &bytes).unwrap();

        let out = engine.compute(&hk, &bytes).unwrap();
        assert_eq!(out.delta.keys().collect::<Vec<_>>(), vec!["Voltage_A"]);
        assert_eq!(out.converted.keys().collect::<Vec<_>>(), vec!["Voltage_A"]);
    }

    #[test]
    fn changed_fields_and_derivations_are_included() {
        let (engine, hk, _) = engine();
        engine.compute(&hk, &HkFrame::default().voltages(10, 4).temp(-3).bytes()).unwrap();

        let out = engine.compute(&hk, &HkFrame::default().voltages(10, 5).temp(-3).mode(1).bytes()).unwrap();
        assert_eq!(out.delta["Voltage_B"], Value::UInt(5));
        assert_eq!(out.delta["Mode"], Value::UInt(1));
        assert_eq!(out.delta["Voltage_Sum"], Value::Float(15.0));
        assert_eq!(out.converted["Mode"], Value::Text("NOMINAL".into()));
        assert!(!out.delta.contains_key("Temp"));
        assert!(!out.delta.contains_key("LastCmd"));
    }

    #[test]
    fn conversion_failures_fall_back() {
        let (engine, hk, _) = engine();
        let out = engine.compute(&hk, &HkFrame::default().mode(9).last_cmd(4242).bytes()).unwrap();

        assert_eq!(out.converted["Mode"], Value::UInt(9));
        assert_eq!(out.converted["LastCmd"], Value::Text("Unidentified Cmd".into()));
    }

    #[test]
    fn short_packet_leaves_state_untouched() {
        let (engine, hk, _) = engine();
        assert!(engine.compute(&hk, &[0x00, 0x01]).is_err());
        assert!(engine.state(HK_UID).is_none());

        // The next valid packet is still treated as the first.
        assert!(engine.compute(&hk, &HkFrame::default().bytes()).unwrap().first);
    }

    #[test]
    fn latest_reports_cached_state_by_name() {
        let (engine, hk, hs) = engine();
        engine.compute(&hk, &HkFrame::default().voltages(2, 2).bytes()).unwrap();
        engine.compute(&hs, &hs_bytes(1, 2, 0.5)).unwrap();

        let latest = engine.latest();
        assert_eq!(latest.keys().collect::<Vec<_>>(), vec!["1553_HS", "HK"]);
        assert_eq!(latest["HK"].raw["Voltage_A"], Value::UInt(2));
        assert_eq!(latest["HK"].converted["Voltage_A"], Value::Float(1.0));
        assert_eq!(latest["HK"].derived["Voltage_Sum"], Value::Float(4.0));
        assert_eq!(latest["1553_HS"].raw["Counter"], Value::UInt(2));
    }
}
