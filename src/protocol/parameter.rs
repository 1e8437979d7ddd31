//! The recursive [`ParameterValue`] type and the `byte_array` / `float64`
//! type-hint discriminator that rides alongside it.
//!
//! Per the design note in spec §9, the type hint is kept as a sibling field
//! rather than folded into the value variant: it changes how a value
//! serializes (base64 bytes, forced-float literals) but not its structural
//! shape, and collapsing the two would make "is this array of numbers a
//! `float64_array`" ambiguous to reconstruct.

use std::collections::BTreeMap;

use base64::{engine::general_purpose, Engine as _};
use serde::{Deserialize, Deserializer, Serialize};

/// A named parameter together with its (possibly absent) value.
#[derive(Clone, Debug, PartialEq, Serialize)]
#[serde(rename_all = "camelCase")]
pub struct Parameter {
    pub name: String,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub value: Option<ParameterValue>,
    #[serde(rename = "type", default, skip_serializing_if = "Option::is_none")]
    pub kind: Option<ParameterType>,
}

impl Parameter {
    pub fn new(name: impl Into<String>, value: ParameterValue) -> Self {
        let mut param = Self {
            name: name.into(),
            value: Some(value),
            kind: None,
        };
        param.coerce_value_to_kind();
        param
    }

    /// Builds a parameter whose value is absent, which per the data model
    /// semantically deletes it when sent in a `setParameters` request.
    pub fn unset(name: impl Into<String>) -> Self {
        Self {
            name: name.into(),
            value: None,
            kind: None,
        }
    }

    pub fn with_type(mut self, kind: ParameterType) -> Self {
        self.kind = Some(kind);
        self.coerce_value_to_kind();
        self
    }

    /// Promotes an integral value to `Float` when `kind` is `float64` or
    /// `float64_array`, so the type hint actually forces numeric
    /// interpretation instead of just documenting an intent to.
    fn coerce_value_to_kind(&mut self) {
        let Some(kind) = self.kind else { return };
        let Some(value) = &self.value else { return };
        match kind {
            ParameterType::Float64 => self.value = Some(value.coerce_to_float(false)),
            ParameterType::Float64Array => self.value = Some(value.coerce_to_float(true)),
            ParameterType::ByteArray => {}
        }
    }
}

impl<'de> Deserialize<'de> for Parameter {
    fn deserialize<D>(deserializer: D) -> Result<Self, D::Error>
    where
        D: Deserializer<'de>,
    {
        #[derive(Deserialize)]
        #[serde(rename_all = "camelCase")]
        struct Raw {
            name: String,
            #[serde(default)]
            value: Option<ParameterValue>,
            #[serde(rename = "type", default)]
            kind: Option<ParameterType>,
        }
        let raw = Raw::deserialize(deserializer)?;
        let mut param = Parameter {
            name: raw.name,
            value: raw.value,
            kind: raw.kind,
        };
        param.coerce_value_to_kind();
        Ok(param)
    }
}

/// The `type` discriminator on a [`Parameter`]: a parallel hint for
/// serialization, not part of the value's structural type.
#[derive(Clone, Copy, Debug, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "snake_case")]
pub enum ParameterType {
    ByteArray,
    Float64,
    Float64Array,
}

/// The recursive parameter value: a tagged union of number, bool, string,
/// ordered sequence, or string-keyed mapping.
#[derive(Clone, Debug, PartialEq, Serialize, Deserialize)]
#[serde(untagged)]
pub enum ParameterValue {
    Integer(i64),
    Float(f64),
    Bool(bool),
    String(String),
    Array(Vec<ParameterValue>),
    Struct(BTreeMap<String, ParameterValue>),
}

impl ParameterValue {
    /// Decodes this value as `byte_array`-tagged base64 text.
    pub fn decode_byte_array(&self) -> Option<Vec<u8>> {
        match self {
            ParameterValue::String(s) => general_purpose::STANDARD.decode(s).ok(),
            _ => None,
        }
    }

    /// Encodes raw bytes as the base64 string form used when a
    /// [`Parameter`] carries `type: byte_array`.
    pub fn from_bytes(data: &[u8]) -> Self {
        ParameterValue::String(general_purpose::STANDARD.encode(data))
    }

    /// Forces an integral value to `Float`, so an integral literal tagged
    /// `float64`/`float64_array` still round-trips as a decimal literal.
    /// With `array` set, recurses one level into `Array` entries instead of
    /// treating the array itself as a number.
    fn coerce_to_float(&self, array: bool) -> ParameterValue {
        match self {
            ParameterValue::Integer(n) => ParameterValue::Float(*n as f64),
            ParameterValue::Array(items) if array => ParameterValue::Array(
                items.iter().map(|item| item.coerce_to_float(false)).collect(),
            ),
            other => other.clone(),
        }
    }
}
