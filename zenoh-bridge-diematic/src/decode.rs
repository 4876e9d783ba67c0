//! Decode engine: applies a [`Schema`] to a [`RawRegisterArray`].
//!
//! Decoding is total: every exported name of the schema appears in the
//! resulting [`ValueMap`], either with a value or as unknown (`None`).

use serde::ser::{Serialize, SerializeMap, Serializer};
use std::fmt;
use std::fmt::Write;
use tracing::trace;

use crate::registers::RawRegisterArray;
use crate::schema::{Kind, Outputs, Schema};

/// Raw word the controller reports for a missing or faulty sensor.
pub const SENSOR_UNKNOWN: u16 = 0xFFFF;

const SIGN_BIT: u16 = 0x8000;
const MAGNITUDE_MASK: u16 = 0x7FFF;

/// A decoded value.
#[derive(Debug, Clone, Copy, PartialEq)]
pub enum Value {
    /// Raw register word.
    Integer(u16),
    /// Sign-magnitude decimal.
    Float(f64),
    /// Single bit, 0 or 1.
    Bit(u8),
}

impl fmt::Display for Value {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        match self {
            Value::Integer(n) => write!(f, "{}", n),
            // Debug keeps the trailing ".0" on whole numbers.
            Value::Float(v) => write!(f, "{:?}", v),
            Value::Bit(b) => write!(f, "{}", b),
        }
    }
}

impl Serialize for Value {
    fn serialize<S: Serializer>(&self, serializer: S) -> Result<S::Ok, S::Error> {
        match *self {
            Value::Integer(n) => serializer.serialize_u16(n),
            Value::Float(v) => serializer.serialize_f64(v),
            Value::Bit(b) => serializer.serialize_u8(b),
        }
    }
}

/// Decoded values keyed by output name, in schema order.
#[derive(Debug, Clone, PartialEq, Default)]
pub struct ValueMap {
    entries: Vec<(String, Option<Value>)>,
}

impl ValueMap {
    pub fn with_capacity(capacity: usize) -> Self {
        Self {
            entries: Vec::with_capacity(capacity),
        }
    }

    fn push(&mut self, name: &str, value: Option<Value>) {
        self.entries.push((name.to_string(), value));
    }

    /// Value for `name`: `None` if the name is not in the map,
    /// `Some(None)` if it is known to the schema but unknown this cycle.
    pub fn get(&self, name: &str) -> Option<Option<Value>> {
        self.entries
            .iter()
            .find(|(n, _)| n == name)
            .map(|(_, value)| *value)
    }

    pub fn contains(&self, name: &str) -> bool {
        self.entries.iter().any(|(n, _)| n == name)
    }

    pub fn iter(&self) -> impl Iterator<Item = (&str, Option<Value>)> {
        self.entries.iter().map(|(n, v)| (n.as_str(), *v))
    }

    pub fn names(&self) -> impl Iterator<Item = &str> {
        self.entries.iter().map(|(n, _)| n.as_str())
    }

    pub fn len(&self) -> usize {
        self.entries.len()
    }

    pub fn is_empty(&self) -> bool {
        self.entries.is_empty()
    }

    /// Number of names holding a value.
    pub fn known_count(&self) -> usize {
        self.entries.iter().filter(|(_, v)| v.is_some()).count()
    }

    /// One `name = value` line per entry in schema order, `None` when unknown.
    pub fn dump(&self) -> String {
        let mut output = String::new();
        for (name, value) in &self.entries {
            let _ = match value {
                Some(value) => writeln!(output, "{} = {}", name, value),
                None => writeln!(output, "{} = None", name),
            };
        }
        output
    }
}

impl Serialize for ValueMap {
    fn serialize<S: Serializer>(&self, serializer: S) -> Result<S::Ok, S::Error> {
        let mut map = serializer.serialize_map(Some(self.entries.len()))?;
        for (name, value) in &self.entries {
            map.serialize_entry(name, value)?;
        }
        map.end()
    }
}

/// Decode a sign-magnitude word: bit 15 is the sign, bits 0-14 the magnitude.
///
/// Returns `None` for [`SENSOR_UNKNOWN`]. This is not two's complement:
/// `0x8032` is -50, not -32718.
pub fn decode_signed_decimal(word: u16, decimals: u8) -> Option<f64> {
    if word == SENSOR_UNKNOWN {
        return None;
    }

    let magnitude = i32::from(word & MAGNITUDE_MASK);
    let value = if word & SIGN_BIT != 0 {
        -magnitude
    } else {
        magnitude
    };

    Some(f64::from(value) / 10f64.powi(i32::from(decimals)))
}

/// Extract bit `position` of `word` as 0 or 1.
pub fn bit(word: u16, position: usize) -> u8 {
    ((word >> position) & 1) as u8
}

fn decode_word(kind: Kind, word: u16) -> Option<Value> {
    match kind {
        Kind::Raw => Some(Value::Integer(word)),
        Kind::SignedDecimal { decimals } => decode_signed_decimal(word, decimals).map(Value::Float),
        // Bits are expanded per name by the caller.
        Kind::Bits => Some(Value::Integer(word)),
    }
}

/// Apply `schema` to `registers`.
///
/// Neither input is modified and the result depends on nothing else, so
/// decoding the same pair twice yields the same map.
pub fn decode(schema: &Schema, registers: &RawRegisterArray) -> ValueMap {
    let mut values = ValueMap::with_capacity(schema.output_names().len());

    for descriptor in schema.descriptors() {
        let word = descriptor.id().and_then(|id| registers.get(id));

        let Some(word) = word else {
            if let Some(id) = descriptor.id() {
                trace!("Register {}: None", id);
            }
            for name in descriptor.output_names() {
                values.push(name, None);
            }
            continue;
        };

        trace!(
            "Register {}: {:#06x} ({})",
            descriptor.id().unwrap_or_default(),
            word,
            descriptor.kind()
        );

        match descriptor.outputs() {
            Outputs::Value(name) => values.push(name, decode_word(descriptor.kind(), word)),
            Outputs::Bits(names) => {
                for (position, name) in names.iter().enumerate() {
                    values.push(name, Some(Value::Bit(bit(word, position))));
                }
            }
            Outputs::DecodeOnly => {
                trace!(
                    "Register {} is decode-only: {:?}",
                    descriptor.id().unwrap_or_default(),
                    decode_word(descriptor.kind(), word)
                );
            }
        }
    }

    values
}
