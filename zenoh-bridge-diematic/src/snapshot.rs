//! Snapshot assembly: a decoded value map plus timestamp and static tags.

use serde::Serialize;
use std::collections::BTreeMap;

use crate::decode::ValueMap;

/// One timestamped decode result, serialized as the publishing record:
///
/// ```text
/// { measurement, tags: {..}, timestamp: <ms since epoch>, fields: {name: number | null} }
/// ```
#[derive(Debug, Clone, PartialEq, Serialize)]
pub struct Snapshot {
    pub measurement: String,
    pub tags: BTreeMap<String, String>,
    /// Unix epoch milliseconds at which the registers were read.
    pub timestamp: i64,
    pub fields: ValueMap,
}

impl Snapshot {
    /// `name = value` rendering of the fields, in schema order.
    pub fn dump(&self) -> String {
        self.fields.dump()
    }
}

/// Builds snapshots with a fixed measurement name and tag set.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct SnapshotAssembler {
    measurement: String,
    tags: BTreeMap<String, String>,
}

impl SnapshotAssembler {
    pub fn new(measurement: impl Into<String>, tags: BTreeMap<String, String>) -> Self {
        Self {
            measurement: measurement.into(),
            tags,
        }
    }

    pub fn measurement(&self) -> &str {
        &self.measurement
    }

    pub fn assemble(&self, fields: ValueMap, timestamp: i64) -> Snapshot {
        Snapshot {
            measurement: self.measurement.clone(),
            tags: self.tags.clone(),
            timestamp,
            fields,
        }
    }
}
