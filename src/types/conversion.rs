//! Unit conversions, enumerations and derived fields

use std::collections::BTreeMap;
use std::fmt;
use thiserror::Error;

use super::{FieldMap, Value};

/// Value-domain failure raised while converting or deriving a field.
///
/// The delta engine recovers from these locally; they never reach callers.
#[derive(Error, Debug, Clone, PartialEq)]
pub enum ConversionError {
    #[error("{value} is outside the domain of {field}")]
    OutOfDomain { field: String, value: String },

    #[error("{field} needs numeric input, got {value}")]
    NotNumeric { field: String, value: String },

    #[error("{field} depends on missing field {missing}")]
    MissingInput { field: String, missing: String },
}

/// Outcome of resolving a field's human-meaningful value.
#[derive(Debug, Clone, PartialEq)]
pub enum Resolved {
    /// Nothing to convert; the raw value stands
    Raw(Value),
    /// Engineering-unit or date-time value
    Converted(Value),
    /// Enumeration label or referenced command/EVR name
    Label(String),
    /// Reference value with no matching definition
    Unidentified,
}

/// Maps a raw decoded value to an engineering-unit value.
///
/// Conversions receive the whole raw packet because they may depend on other
/// fields (calibration selectors, ranges).
pub trait Conversion: Send + Sync + fmt::Debug {
    fn convert(&self, field: &str, raw: &Value, packet: &FieldMap) -> Result<Value, ConversionError>;
}

/// Computes a field from other decoded fields.
pub trait Derivation: Send + Sync + fmt::Debug {
    fn derive(&self, name: &str, packet: &FieldMap) -> Result<Value, ConversionError>;
}

/// Polynomial conversion `c0 + c1*x + c2*x^2 + ...`.
#[derive(Debug, Clone, PartialEq)]
pub struct Polynomial {
    coefficients: Vec<f64>,
}

impl Polynomial {
    /// Coefficients in ascending power order.
    pub fn new(coefficients: impl Into<Vec<f64>>) -> Self {
        Self { coefficients: coefficients.into() }
    }

    /// Evaluate at `x` (Horner's method).
    pub fn eval(&self, x: f64) -> f64 {
        self.coefficients.iter().rev().fold(0.0, |acc, c| acc * x + c)
    }
}

impl Conversion for Polynomial {
    fn convert(&self, field: &str, raw: &Value, _packet: &FieldMap) -> Result<Value, ConversionError> {
        let x = raw.as_f64().ok_or_else(|| ConversionError::NotNumeric {
            field: field.to_string(),
            value: raw.to_string(),
        })?;
        let y = self.eval(x);
        if !y.is_finite() {
            return Err(ConversionError::OutOfDomain { field: field.to_string(), value: raw.to_string() });
        }
        Ok(Value::Float(y))
    }
}

type ConvertFn = dyn Fn(&Value, &FieldMap) -> Result<Value, ConversionError> + Send + Sync;

/// Conversion backed by a closure, for definitions built in code.
pub struct FnConversion {
    label: String,
    f: Box<ConvertFn>,
}

impl FnConversion {
    pub fn new<F>(label: impl Into<String>, f: F) -> Self
    where
        F: Fn(&Value, &FieldMap) -> Result<Value, ConversionError> + Send + Sync + 'static,
    {
        Self { label: label.into(), f: Box::new(f) }
    }
}

impl fmt::Debug for FnConversion {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.debug_struct("FnConversion").field("label", &self.label).finish()
    }
}

impl Conversion for FnConversion {
    fn convert(&self, _field: &str, raw: &Value, packet: &FieldMap) -> Result<Value, ConversionError> {
        (self.f)(raw, packet)
    }
}

type DeriveFn = dyn Fn(&FieldMap) -> Result<Value, ConversionError> + Send + Sync;

/// Derivation backed by a closure.
pub struct FnDerivation {
    label: String,
    f: Box<DeriveFn>,
}

impl FnDerivation {
    pub fn new<F>(label: impl Into<String>, f: F) -> Self
    where
        F: Fn(&FieldMap) -> Result<Value, ConversionError> + Send + Sync + 'static,
    {
        Self { label: label.into(), f: Box::new(f) }
    }
}

impl fmt::Debug for FnDerivation {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.debug_struct("FnDerivation").field("label", &self.label).finish()
    }
}

impl Derivation for FnDerivation {
    fn derive(&self, _name: &str, packet: &FieldMap) -> Result<Value, ConversionError> {
        (self.f)(packet)
    }
}

/// Sum of other numeric fields.
#[derive(Debug, Clone, PartialEq)]
pub struct Sum {
    inputs: Vec<String>,
}

impl Sum {
    pub fn of<I, S>(inputs: I) -> Self
    where
        I: IntoIterator<Item = S>,
        S: Into<String>,
    {
        Self { inputs: inputs.into_iter().map(Into::into).collect() }
    }
}

impl Derivation for Sum {
    fn derive(&self, name: &str, packet: &FieldMap) -> Result<Value, ConversionError> {
        let mut total = 0.0;
        for input in &self.inputs {
            let value = packet.get(input).ok_or_else(|| ConversionError::MissingInput {
                field: name.to_string(),
                missing: input.clone(),
            })?;
            total += value.as_f64().ok_or_else(|| ConversionError::NotNumeric {
                field: name.to_string(),
                value: value.to_string(),
            })?;
        }
        Ok(Value::Float(total))
    }
}

/// Raw value to label lookup.
#[derive(Debug, Clone, Default, PartialEq, Eq)]
pub struct Enumeration {
    labels: BTreeMap<i64, String>,
}

impl Enumeration {
    pub fn new<I, S>(labels: I) -> Self
    where
        I: IntoIterator<Item = (i64, S)>,
        S: Into<String>,
    {
        Self { labels: labels.into_iter().map(|(k, v)| (k, v.into())).collect() }
    }

    /// Label for `raw`, if the value is enumerated.
    pub fn label(&self, raw: &Value) -> Option<&str> {
        let key = raw.as_i64()?;
        self.labels.get(&key).map(String::as_str)
    }

    pub fn len(&self) -> usize {
        self.labels.len()
    }

    pub fn is_empty(&self) -> bool {
        self.labels.is_empty()
    }
}
