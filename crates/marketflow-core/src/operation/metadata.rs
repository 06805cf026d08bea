//! Open-ended metadata attached to operations and steps.
//!
//! Executors report arbitrary key/value data (file counts, throughput, etc.)
//! without the engine knowing the schema. Conventional keys:
//!
//! - `files_downloaded`, `files_processed`: integer counts
//! - `records`: rows written by a step
//! - `throughput`: records per second (float)
//! - `cancel_reason`: `"user"`, `"forced"` or `"timeout"` on cancelled operations

use serde::{Deserialize, Serialize};
use std::collections::BTreeMap;

/// String-keyed metadata map. Ordered so snapshots serialize identically.
pub type Metadata = BTreeMap<String, MetadataValue>;

/// A tagged metadata value.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
#[serde(untagged)]
pub enum MetadataValue {
    /// Boolean flag
    Bool(bool),
    /// Integer counter
    Integer(i64),
    /// Floating point measurement
    Float(f64),
    /// Free text
    Text(String),
    /// Ordered list
    List(Vec<MetadataValue>),
    /// Nested map
    Map(BTreeMap<String, MetadataValue>),
}

impl MetadataValue {
    /// Integer view, if this is an integer.
    #[must_use]
    pub fn as_i64(&self) -> Option<i64> {
        match self {
            Self::Integer(v) => Some(*v),
            _ => None,
        }
    }

    /// Text view, if this is text.
    #[must_use]
    pub fn as_str(&self) -> Option<&str> {
        match self {
            Self::Text(v) => Some(v),
            _ => None,
        }
    }
}

impl From<bool> for MetadataValue {
    fn from(v: bool) -> Self {
        Self::Bool(v)
    }
}

impl From<i64> for MetadataValue {
    fn from(v: i64) -> Self {
        Self::Integer(v)
    }
}

impl From<u64> for MetadataValue {
    fn from(v: u64) -> Self {
        Self::Integer(i64::try_from(v).unwrap_or(i64::MAX))
    }
}

impl From<f64> for MetadataValue {
    fn from(v: f64) -> Self {
        Self::Float(v)
    }
}

impl From<&str> for MetadataValue {
    fn from(v: &str) -> Self {
        Self::Text(v.to_string())
    }
}

impl From<String> for MetadataValue {
    fn from(v: String) -> Self {
        Self::Text(v)
    }
}

impl From<Vec<MetadataValue>> for MetadataValue {
    fn from(v: Vec<MetadataValue>) -> Self {
        Self::List(v)
    }
}
