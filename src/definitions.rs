//! Packet definitions collaborator.
//!
//! The distribution core never hard-codes packet layouts. It asks a
//! [`Definitions`] implementation for the layout of a packet id and for the
//! meaning of individual field values. Real deployments back this with their
//! telemetry and command dictionaries; [`Dictionary`] is a simple in-memory
//! implementation built in code.

use std::collections::HashMap;
use std::sync::Arc;

use crate::types::{ConversionError, FieldMap, FieldType, PacketDefinition, PacketTypeId, Resolved, Value};
use crate::{Result, TelemuxError};

/// Source of packet layouts and value semantics.
pub trait Definitions: Send + Sync {
    /// Layout of packet `uid`, if defined.
    fn packet(&self, uid: PacketTypeId) -> Option<Arc<PacketDefinition>>;

    /// Layout of the packet called `name`, if defined.
    fn packet_named(&self, name: &str) -> Option<Arc<PacketDefinition>>;

    /// Every known packet layout.
    fn packets(&self) -> Vec<Arc<PacketDefinition>>;

    /// Name of the command with opcode `opcode`.
    fn command_name(&self, _opcode: u64) -> Option<String> {
        None
    }

    /// Name of the event report with code `code`.
    fn evr_name(&self, _code: u64) -> Option<String> {
        None
    }

    /// Resolve the human-meaningful value of `field` in a decoded packet.
    ///
    /// Command and EVR references resolve to a name or [`Resolved::Unidentified`],
    /// time fields to a date-time, converted fields through their conversion and
    /// enumerated fields to their label. An enumerated value with no label is a
    /// value-domain error.
    fn convert(&self, defn: &PacketDefinition, field: &str, raw: &FieldMap) -> Result<Resolved, ConversionError> {
        let (Some(meta), Some(value)) = (defn.field(field), raw.get(field)) else {
            return Err(ConversionError::MissingInput { field: field.to_string(), missing: field.to_string() });
        };
        let not_numeric = || ConversionError::NotNumeric { field: field.to_string(), value: value.to_string() };

        match meta.field_type {
            FieldType::Cmd16 => {
                let opcode = value.as_i64().and_then(|v| u64::try_from(v).ok()).ok_or_else(not_numeric)?;
                return Ok(self.command_name(opcode).map_or(Resolved::Unidentified, Resolved::Label));
            }
            FieldType::Evr16 => {
                let code = value.as_i64().and_then(|v| u64::try_from(v).ok()).ok_or_else(not_numeric)?;
                return Ok(self.evr_name(code).map_or(Resolved::Unidentified, Resolved::Label));
            }
            FieldType::Time64 => {
                let seconds = value.as_f64().ok_or_else(not_numeric)?;
                let time = FieldType::gps_time(seconds).ok_or_else(|| ConversionError::OutOfDomain {
                    field: field.to_string(),
                    value: value.to_string(),
                })?;
                return Ok(Resolved::Converted(Value::Time(time)));
            }
            _ => {}
        }

        if let Some(conversion) = &meta.conversion {
            return conversion.convert(field, value, raw).map(Resolved::Converted);
        }

        if let Some(enumeration) = &meta.enumeration {
            return match enumeration.label(value) {
                Some(label) => Ok(Resolved::Label(label.to_string())),
                None => Err(ConversionError::OutOfDomain { field: field.to_string(), value: value.to_string() }),
            };
        }

        Ok(Resolved::Raw(value.clone()))
    }

    /// Evaluate every derivation of `defn` against a decoded packet.
    ///
    /// Derivations are evaluated in definition order and may reference earlier
    /// derivations.
    fn derive(&self, defn: &PacketDefinition, raw: &FieldMap) -> Vec<(String, Result<Value, ConversionError>)> {
        let mut scope = raw.clone();
        let mut results = Vec::with_capacity(defn.derivations.len());
        for derivation in &defn.derivations {
            let result = derivation.rule.derive(&derivation.name, &scope);
            if let Ok(value) = &result {
                scope.insert(derivation.name.clone(), value.clone());
            }
            results.push((derivation.name.clone(), result));
        }
        results
    }
}

/// In-memory packet and command dictionary.
#[derive(Debug, Default, Clone)]
pub struct Dictionary {
    by_uid: HashMap<PacketTypeId, Arc<PacketDefinition>>,
    by_name: HashMap<String, Arc<PacketDefinition>>,
    commands: HashMap<u64, String>,
    evrs: HashMap<u64, String>,
}

impl Dictionary {
    pub fn new() -> Self {
        Self::default()
    }

    /// Add a packet definition.
    ///
    /// Fails when the id or name is already taken.
    pub fn with_packet(mut self, defn: PacketDefinition) -> Result<Self> {
        self.insert(defn)?;
        Ok(self)
    }

    pub fn insert(&mut self, defn: PacketDefinition) -> Result<()> {
        defn.validate()?;
        if self.by_uid.contains_key(&defn.uid) {
            return Err(TelemuxError::invalid_definition(
                &defn.name,
                format!("packet id {} is already defined", defn.uid),
            ));
        }
        if self.by_name.contains_key(&defn.name) {
            return Err(TelemuxError::invalid_definition(&defn.name, "packet name is already defined"));
        }

        let defn = Arc::new(defn);
        self.by_uid.insert(defn.uid, Arc::clone(&defn));
        self.by_name.insert(defn.name.clone(), defn);
        Ok(())
    }

    pub fn with_command(mut self, opcode: u64, name: impl Into<String>) -> Self {
        self.commands.insert(opcode, name.into());
        self
    }

    pub fn with_evr(mut self, code: u64, name: impl Into<String>) -> Self {
        self.evrs.insert(code, name.into());
        self
    }

    pub fn len(&self) -> usize {
        self.by_uid.len()
    }

    pub fn is_empty(&self) -> bool {
        self.by_uid.is_empty()
    }
}

impl Definitions for Dictionary {
    fn packet(&self, uid: PacketTypeId) -> Option<Arc<PacketDefinition>> {
        self.by_uid.get(&uid).cloned()
    }

    fn packet_named(&self, name: &str) -> Option<Arc<PacketDefinition>> {
        self.by_name.get(name).cloned()
    }

    fn packets(&self) -> Vec<Arc<PacketDefinition>> {
        let mut packets: Vec<_> = self.by_uid.values().cloned().collect();
        packets.sort_by_key(|p| p.uid);
        packets
    }

    fn command_name(&self, opcode: u64) -> Option<String> {
        self.commands.get(&opcode).cloned()
    }

    fn evr_name(&self, code: u64) -> Option<String> {
        self.evrs.get(&code).cloned()
    }
}
