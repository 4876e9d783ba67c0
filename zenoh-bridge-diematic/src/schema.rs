//! Register schema: which controller registers map to which named outputs.
//!
//! The schema is declared in the `registers` array of the bridge
//! configuration, validated once at startup and shared read-only for the
//! lifetime of the process.
//!
//! ```text
//! registers: [
//!     { id: 601, name: "ext_temperature", type: "signed_decimal:1" },
//!     { id: 603, name: "mode_a", type: "raw" },
//!     { id: 614, name: "", type: "raw" },                    // decode-only
//!     { id: 617, name: "flags", type: "bits", bits: ["burner", "pump_a"] },
//! ]
//! ```

use serde::{Deserialize, Serialize};
use std::collections::HashSet;
use std::fmt;
use thiserror::Error;

/// Type name accepted for the controller's native one-decimal encoding.
const DIEMATIC_ONE_DECIMAL: &str = "DiematicOneDecimal";

/// Highest scale accepted for `signed_decimal:N`.
pub const MAX_DECIMALS: u8 = 9;

/// Number of bits in a register.
pub const REGISTER_BITS: usize = 16;

/// Schema validation errors. Always fatal at startup.
#[derive(Debug, Clone, PartialEq, Eq, Error)]
pub enum SchemaError {
    #[error("Failed to parse schema: {0}")]
    Parse(String),

    #[error("Entry #{index}: duplicate output name '{name}'")]
    DuplicateName { index: usize, name: String },

    #[error("Entry #{index}: invalid output name '{name}'")]
    InvalidName { index: usize, name: String },

    #[error("Entry #{index}: bits entry must declare at least one bit name")]
    EmptyBits { index: usize },

    #[error("Entry #{index}: {count} bit names exceed the 16 bits of a register")]
    TooManyBits { index: usize, count: usize },

    #[error("Entry #{index}: bits entry requires a numeric register id")]
    BitsWithoutRegister { index: usize },

    #[error("Entry #{index}: 'bits' is only allowed with type \"bits\"")]
    UnexpectedBits { index: usize },

    #[error("Entry #{index}: invalid register id {id} (expected 0..=65535)")]
    InvalidId { index: usize, id: i64 },

    #[error("Entry #{index}: unknown register type '{kind}'")]
    UnknownType { index: usize, kind: String },
}

/// A schema entry as written in the configuration file.
#[derive(Debug, Clone, Default, PartialEq, Serialize, Deserialize)]
pub struct RegisterEntry {
    /// Register address, or a blank/non-numeric marker for "no register".
    #[serde(default)]
    pub id: Option<RegisterId>,

    /// Output name. Blank or absent means decode-only.
    #[serde(default)]
    pub name: Option<String>,

    /// `raw` (default), `bits`, `signed_decimal:N` or `DiematicOneDecimal`.
    #[serde(default, rename = "type")]
    pub kind: Option<String>,

    /// Bit names, least significant bit first. Only for `bits` entries.
    #[serde(default)]
    pub bits: Option<Vec<String>>,
}

impl RegisterEntry {
    /// Entry for a register address.
    pub fn new(id: u16, name: &str, kind: &str) -> Self {
        Self {
            id: Some(RegisterId::Number(i64::from(id))),
            name: Some(name.to_string()),
            kind: Some(kind.to_string()),
            bits: None,
        }
    }

    /// Bit-field entry for a register address.
    pub fn bits(id: u16, bits: &[&str]) -> Self {
        Self {
            id: Some(RegisterId::Number(i64::from(id))),
            name: None,
            kind: Some("bits".to_string()),
            bits: Some(bits.iter().map(|b| b.to_string()).collect()),
        }
    }
}

/// Raw `id` field: a number, or a text marker.
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
#[serde(untagged)]
pub enum RegisterId {
    Number(i64),
    Label(String),
}

/// How a register word is turned into a value.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum Kind {
    /// The word, unchanged.
    Raw,
    /// Bit 15 is the sign, bits 0-14 the magnitude, scaled by `10^decimals`.
    SignedDecimal { decimals: u8 },
    /// One output per bit, least significant bit first.
    Bits,
}

impl Kind {
    fn parse(index: usize, kind: Option<&str>) -> Result<Self, SchemaError> {
        let Some(kind) = kind.map(str::trim).filter(|k| !k.is_empty()) else {
            return Ok(Kind::Raw);
        };

        let unknown = || SchemaError::UnknownType {
            index,
            kind: kind.to_string(),
        };

        match kind {
            "raw" => Ok(Kind::Raw),
            "bits" => Ok(Kind::Bits),
            DIEMATIC_ONE_DECIMAL => Ok(Kind::SignedDecimal { decimals: 1 }),
            other => {
                let decimals = other
                    .strip_prefix("signed_decimal:")
                    .and_then(|n| n.parse::<u8>().ok())
                    .filter(|n| *n <= MAX_DECIMALS)
                    .ok_or_else(unknown)?;
                Ok(Kind::SignedDecimal { decimals })
            }
        }
    }
}

impl fmt::Display for Kind {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        match self {
            Kind::Raw => f.write_str("raw"),
            Kind::SignedDecimal { decimals } => write!(f, "signed_decimal:{}", decimals),
            Kind::Bits => f.write_str("bits"),
        }
    }
}

/// What a descriptor contributes to the decoded value map.
#[derive(Debug, Clone, PartialEq, Eq)]
pub enum Outputs {
    /// A single named value.
    Value(String),
    /// One named 0/1 value per bit.
    Bits(Vec<String>),
    /// Decoded but never exported (blank name).
    DecodeOnly,
}

/// One validated schema entry.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct RegisterDescriptor {
    id: Option<u16>,
    kind: Kind,
    outputs: Outputs,
}

impl RegisterDescriptor {
    /// Register address, `None` when the entry has no physical register.
    pub fn id(&self) -> Option<u16> {
        self.id
    }

    pub fn kind(&self) -> Kind {
        self.kind
    }

    pub fn outputs(&self) -> &Outputs {
        &self.outputs
    }

    /// Whether this descriptor is decoded without being exported.
    pub fn is_decode_only(&self) -> bool {
        self.outputs == Outputs::DecodeOnly
    }

    /// Output names this descriptor produces, in order.
    pub fn output_names(&self) -> &[String] {
        match &self.outputs {
            Outputs::Value(name) => std::slice::from_ref(name),
            Outputs::Bits(names) => names,
            Outputs::DecodeOnly => &[],
        }
    }
}

/// An ordered, validated register schema.
#[derive(Debug, Clone, PartialEq, Eq, Default)]
pub struct Schema {
    descriptors: Vec<RegisterDescriptor>,
    output_names: Vec<String>,
    max_register_id: Option<u16>,
}

impl Schema {
    /// Validate configuration entries into a schema.
    pub fn load(entries: &[RegisterEntry]) -> Result<Self, SchemaError> {
        let mut descriptors = Vec::with_capacity(entries.len());
        let mut output_names = Vec::new();
        let mut seen = HashSet::new();

        for (index, entry) in entries.iter().enumerate() {
            let descriptor = validate_entry(index, entry)?;

            for name in descriptor.output_names() {
                if !seen.insert(name.clone()) {
                    return Err(SchemaError::DuplicateName {
                        index,
                        name: name.clone(),
                    });
                }
                output_names.push(name.clone());
            }

            descriptors.push(descriptor);
        }

        let max_register_id = descriptors.iter().filter_map(|d| d.id).max();

        Ok(Self {
            descriptors,
            output_names,
            max_register_id,
        })
    }

    /// Parse and validate a JSON5 array of entries.
    pub fn from_json5(content: &str) -> Result<Self, SchemaError> {
        let entries: Vec<RegisterEntry> =
            json5::from_str(content).map_err(|e| SchemaError::Parse(e.to_string()))?;
        Self::load(&entries)
    }

    pub fn descriptors(&self) -> &[RegisterDescriptor] {
        &self.descriptors
    }

    /// Every exported name, in schema order (bit names expanded in place).
    pub fn output_names(&self) -> &[String] {
        &self.output_names
    }

    /// Highest register address referenced, `None` if no entry has one.
    pub fn max_register_id(&self) -> Option<u16> {
        self.max_register_id
    }

    /// Number of register slots needed to hold every referenced address.
    pub fn register_span(&self) -> usize {
        self.max_register_id.map_or(0, |id| usize::from(id) + 1)
    }

    pub fn len(&self) -> usize {
        self.descriptors.len()
    }

    pub fn is_empty(&self) -> bool {
        self.descriptors.is_empty()
    }
}

fn validate_entry(index: usize, entry: &RegisterEntry) -> Result<RegisterDescriptor, SchemaError> {
    let kind = Kind::parse(index, entry.kind.as_deref())?;
    let id = register_id(index, entry.id.as_ref())?;

    let outputs = match kind {
        Kind::Bits => {
            let names = entry.bits.as_deref().unwrap_or_default();
            if names.is_empty() {
                return Err(SchemaError::EmptyBits { index });
            }
            if names.len() > REGISTER_BITS {
                return Err(SchemaError::TooManyBits {
                    index,
                    count: names.len(),
                });
            }
            if id.is_none() {
                return Err(SchemaError::BitsWithoutRegister { index });
            }
            let names = names
                .iter()
                .map(|name| identifier(index, name))
                .collect::<Result<Vec<_>, _>>()?;
            Outputs::Bits(names)
        }
        Kind::Raw | Kind::SignedDecimal { .. } => {
            if entry.bits.is_some() {
                return Err(SchemaError::UnexpectedBits { index });
            }
            match entry.name.as_deref().map(str::trim) {
                Some(name) if !name.is_empty() => Outputs::Value(identifier(index, name)?),
                _ => Outputs::DecodeOnly,
            }
        }
    };

    Ok(RegisterDescriptor { id, kind, outputs })
}

fn register_id(index: usize, id: Option<&RegisterId>) -> Result<Option<u16>, SchemaError> {
    match id {
        Some(RegisterId::Number(n)) => u16::try_from(*n)
            .map(Some)
            .map_err(|_| SchemaError::InvalidId { index, id: *n }),
        // Blank or non-numeric markers mean "no physical register".
        Some(RegisterId::Label(_)) | None => Ok(None),
    }
}

fn identifier(index: usize, name: &str) -> Result<String, SchemaError> {
    let name = name.trim();
    let mut chars = name.chars();
    let valid = chars
        .next()
        .is_some_and(|c| c.is_ascii_alphabetic() || c == '_')
        && chars.all(|c| c.is_ascii_alphanumeric() || c == '_');

    if valid {
        Ok(name.to_string())
    } else {
        Err(SchemaError::InvalidName {
            index,
            name: name.to_string(),
        })
    }
}
