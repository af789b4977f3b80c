//! Records persisted to the attribute-value storage table

use serde::ser::SerializeMap;
use serde::{Deserialize, Serialize, Serializer};
use std::sync::Arc;

/// A coerced cell value
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
#[serde(untagged)]
pub enum CellValue {
    Null,
    Integer(i64),
    Numeric(f64),
    Text(String),
}

impl CellValue {
    /// String form used when the value takes part in a unit identifier.
    ///
    /// Floats keep a fractional part (`7.0`) so a NUMERIC key never collides
    /// with an INTEGER key of the same magnitude.
    pub fn identifier_part(&self) -> Option<String> {
        match self {
            CellValue::Null => None,
            CellValue::Integer(v) => Some(v.to_string()),
            CellValue::Numeric(v) => Some(float_key(*v)),
            CellValue::Text(v) => Some(v.clone()),
        }
    }
}

/// Shortest round-trip float form with a signed, two-digit exponent
/// (`1e+16`, `1.5e-05`), matching keys already stored by earlier loads.
fn float_key(v: f64) -> String {
    // Debug switches to exponent form below 1e-4 and from 1e16 up.
    let repr = format!("{:?}", v);
    match repr.split_once('e') {
        None => repr,
        Some((mantissa, exponent)) => {
            let (sign, digits) = match exponent.strip_prefix('-') {
                Some(digits) => ('-', digits),
                None => ('+', exponent),
            };
            format!("{}e{}{:0>2}", mantissa, sign, digits)
        },
    }
}

/// Attribute map of one record, in schema order.
///
/// Serializes as a JSON object keyed by uppercased variable name. Names are
/// shared with the transformer's column plan, so building a payload does not
/// copy them.
#[derive(Debug, Clone, Default, PartialEq)]
pub struct Payload {
    entries: Vec<(Arc<str>, CellValue)>,
}

impl Payload {
    pub fn with_capacity(capacity: usize) -> Self {
        Self {
            entries: Vec::with_capacity(capacity),
        }
    }

    pub fn push(&mut self, name: Arc<str>, value: CellValue) {
        self.entries.push((name, value));
    }

    pub fn get(&self, name: &str) -> Option<&CellValue> {
        self.entries
            .iter()
            .find(|(key, _)| key.as_ref() == name)
            .map(|(_, value)| value)
    }

    pub fn len(&self) -> usize {
        self.entries.len()
    }

    pub fn is_empty(&self) -> bool {
        self.entries.is_empty()
    }

    pub fn to_json(&self) -> serde_json::Result<String> {
        serde_json::to_string(self)
    }
}

impl Serialize for Payload {
    fn serialize<S: Serializer>(&self, serializer: S) -> Result<S::Ok, S::Error> {
        let mut map = serializer.serialize_map(Some(self.entries.len()))?;
        for (name, value) in &self.entries {
            map.serialize_entry(name.as_ref(), value)?;
        }
        map.end()
    }
}

/// One source row after transformation: `(survey_id, level_id,
/// unit_identifier, data_payload)`
#[derive(Debug, Clone, PartialEq)]
pub struct DataRecord {
    pub survey_id: i32,
    pub level_id: i32,
    pub unit_identifier: String,
    pub data_payload: Payload,
}
