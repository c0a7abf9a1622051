//! Packet definition types

use std::collections::{HashMap, HashSet};
use std::sync::Arc;

use super::{Conversion, Derivation, Enumeration, FieldMap, FieldType, PacketTypeId, Value};
use crate::{Result, TelemuxError};

/// Layout and metadata of a telemetry packet type.
#[derive(Debug, Clone)]
pub struct PacketDefinition {
    /// Packet type id (never 0)
    pub uid: PacketTypeId,
    /// Packet name, unique within a dictionary
    pub name: String,
    /// Fields decoded directly from bytes, in layout order
    pub fields: Vec<FieldDefinition>,
    /// Fields computed from other fields
    pub derivations: Vec<DerivationDefinition>,
    /// Minimum packet length in bytes
    pub size: usize,
}

impl PacketDefinition {
    /// Start building a definition whose fields are packed back to back.
    pub fn builder(uid: PacketTypeId, name: impl Into<String>) -> PacketDefinitionBuilder {
        PacketDefinitionBuilder { uid, name: name.into(), fields: Vec::new(), derivations: Vec::new(), cursor: 0 }
    }

    /// Create a new definition with validation.
    pub fn new(
        uid: PacketTypeId,
        name: impl Into<String>,
        fields: Vec<FieldDefinition>,
        derivations: Vec<DerivationDefinition>,
    ) -> Result<Self> {
        let size = fields.iter().map(|f| f.offset + f.field_type.size()).max().unwrap_or(0);
        let definition = Self { uid, name: name.into(), fields, derivations, size };
        definition.validate()?;
        Ok(definition)
    }

    /// Validate the definition for consistency.
    pub fn validate(&self) -> Result<()> {
        if self.uid == 0 {
            return Err(TelemuxError::invalid_definition(
                &self.name,
                "packet id 0 is reserved for keepalive probes",
            ));
        }
        if self.name.is_empty() {
            return Err(TelemuxError::invalid_definition("packet", "packet name is empty"));
        }

        let mut seen = HashSet::new();
        let names = self.fields.iter().map(|f| &f.name).chain(self.derivations.iter().map(|d| &d.name));
        for name in names {
            if !seen.insert(name) {
                return Err(TelemuxError::invalid_definition(
                    &self.name,
                    format!("field '{name}' is defined more than once"),
                ));
            }
        }

        Ok(())
    }

    /// Get field metadata by name.
    pub fn field(&self, name: &str) -> Option<&FieldDefinition> {
        self.fields.iter().find(|f| f.name == name)
    }

    /// Decode every field's raw value.
    pub fn decode(&self, data: &[u8]) -> Result<FieldMap> {
        if data.len() < self.size {
            return Err(TelemuxError::decode_failed(
                &self.name,
                format!("expected at least {} bytes, got {}", self.size, data.len()),
            ));
        }

        let mut raw = FieldMap::new();
        for field in &self.fields {
            let value = field.decode(data).ok_or_else(|| {
                TelemuxError::decode_failed(&self.name, format!("field '{}' out of bounds", field.name))
            })?;
            raw.insert(field.name.clone(), value);
        }
        Ok(raw)
    }

    /// Encode field values into the binary layout the link would produce.
    ///
    /// Bytes not covered by any field are zero.
    pub fn encode(&self, values: &HashMap<String, Value>) -> Result<Vec<u8>> {
        let mut data = vec![0u8; self.size];
        let mut scratch = Vec::with_capacity(8);

        for field in &self.fields {
            let value = values
                .get(&field.name)
                .ok_or_else(|| TelemuxError::encode_failed(&field.name, "value missing"))?;
            scratch.clear();
            field
                .field_type
                .encode(value, &mut scratch)
                .map_err(|details| TelemuxError::encode_failed(&field.name, details))?;
            data[field.offset..field.offset + scratch.len()].copy_from_slice(&scratch);
        }

        Ok(data)
    }
}

/// Metadata of one decoded field.
#[derive(Debug, Clone)]
pub struct FieldDefinition {
    /// Field name
    pub name: String,
    /// Binary layout
    pub field_type: FieldType,
    /// Byte offset within the packet
    pub offset: usize,
    /// Engineering-unit conversion, evaluated on every packet
    pub conversion: Option<Arc<dyn Conversion>>,
    /// Raw value to label lookup
    pub enumeration: Option<Enumeration>,
    /// Human-readable description
    pub description: String,
}

impl FieldDefinition {
    pub fn new(name: impl Into<String>, field_type: FieldType) -> Self {
        Self {
            name: name.into(),
            field_type,
            offset: 0,
            conversion: None,
            enumeration: None,
            description: String::new(),
        }
    }

    pub fn at(mut self, offset: usize) -> Self {
        self.offset = offset;
        self
    }

    pub fn with_conversion(mut self, conversion: impl Conversion + 'static) -> Self {
        self.conversion = Some(Arc::new(conversion));
        self
    }

    pub fn with_enumeration(mut self, enumeration: Enumeration) -> Self {
        self.enumeration = Some(enumeration);
        self
    }

    pub fn with_description(mut self, description: impl Into<String>) -> Self {
        self.description = description.into();
        self
    }

    /// Whether this field gets a converted value next to its raw value.
    pub fn needs_conversion(&self) -> bool {
        self.conversion.is_some() || self.enumeration.is_some() || self.field_type.is_complex()
    }

    /// Decode this field's raw value from a whole packet.
    pub fn decode(&self, data: &[u8]) -> Option<Value> {
        self.field_type.decode(data.get(self.offset..)?)
    }
}

/// A field computed from other fields rather than decoded.
#[derive(Debug, Clone)]
pub struct DerivationDefinition {
    pub name: String,
    pub rule: Arc<dyn Derivation>,
}

impl DerivationDefinition {
    pub fn new(name: impl Into<String>, rule: impl Derivation + 'static) -> Self {
        Self { name: name.into(), rule: Arc::new(rule) }
    }
}

/// Builder that packs fields sequentially.
#[derive(Debug)]
pub struct PacketDefinitionBuilder {
    uid: PacketTypeId,
    name: String,
    fields: Vec<FieldDefinition>,
    derivations: Vec<DerivationDefinition>,
    cursor: usize,
}

impl PacketDefinitionBuilder {
    /// Append a plain field.
    pub fn field(self, name: impl Into<String>, field_type: FieldType) -> Self {
        self.with_field(FieldDefinition::new(name, field_type))
    }

    /// Append a prepared field; its offset is replaced by the packing cursor.
    pub fn with_field(mut self, field: FieldDefinition) -> Self {
        let field = field.at(self.cursor);
        self.cursor += field.field_type.size();
        self.fields.push(field);
        self
    }

    pub fn derivation(mut self, name: impl Into<String>, rule: impl Derivation + 'static) -> Self {
        self.derivations.push(DerivationDefinition::new(name, rule));
        self
    }

    pub fn build(self) -> Result<PacketDefinition> {
        PacketDefinition::new(self.uid, self.name, self.fields, self.derivations)
    }
}
