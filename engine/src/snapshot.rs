//! Snapshot types for persisting and restoring store state.
//!
//! A snapshot holds what cannot be recomputed: the tail records, the diff
//! log with its tail pointer, and the server-to-local key table. The head is
//! rebuilt on import by replaying local diffs. Maps are `BTreeMap`s so the
//! serialized form is deterministic.

use crate::error::{Error, Result};
use crate::id::Key;
use crate::schema::Schema;
use crate::TypeName;
use serde::{Deserialize, Serialize};
use serde_json::Value as Json;
use std::collections::BTreeMap;

/// Version of the snapshot format for future compatibility.
pub const SNAPSHOT_FORMAT_VERSION: u32 = 1;

/// Persisted store state.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
#[serde(rename_all = "camelCase")]
pub struct StoreSnapshot {
    pub format_version: u32,
    /// Tail records in flattened external form, per type
    #[serde(default)]
    pub tail: BTreeMap<TypeName, Vec<Json>>,
    /// Whole diff log in external form
    #[serde(default)]
    pub diffs: Vec<Json>,
    /// Number of outgoing diffs at the front of `diffs`
    #[serde(rename = "tailptr", default)]
    pub tail_pointer: usize,
    /// `(server, local)` key pairs per type
    #[serde(default)]
    pub ids: BTreeMap<TypeName, Vec<(Key, Key)>>,
    /// `(old, current)` key pairs of re-identified objects per type
    #[serde(default)]
    pub aliases: BTreeMap<TypeName, Vec<(Key, Key)>>,
}

impl Default for StoreSnapshot {
    fn default() -> Self {
        Self::new()
    }
}

impl StoreSnapshot {
    /// An empty snapshot.
    pub fn new() -> Self {
        Self {
            format_version: SNAPSHOT_FORMAT_VERSION,
            tail: BTreeMap::new(),
            diffs: Vec::new(),
            tail_pointer: 0,
            ids: BTreeMap::new(),
            aliases: BTreeMap::new(),
        }
    }

    /// Count tail records across all types.
    pub fn record_count(&self) -> usize {
        self.tail.values().map(Vec::len).sum()
    }

    pub fn outgoing_count(&self) -> usize {
        self.tail_pointer
    }

    pub fn local_count(&self) -> usize {
        self.diffs.len().saturating_sub(self.tail_pointer)
    }

    /// Check the snapshot against a schema.
    pub fn validate(&self, schema: &Schema) -> Result<()> {
        if self.tail_pointer > self.diffs.len() {
            return Err(Error::InvalidSnapshot(format!(
                "tail pointer {} is past the end of {} diffs",
                self.tail_pointer,
                self.diffs.len()
            )));
        }
        for ty in self.tail.keys().chain(self.ids.keys()).chain(self.aliases.keys()) {
            if !schema.contains(ty) {
                return Err(Error::InvalidSnapshot(format!("unknown type {}", ty)));
            }
        }
        for diff in &self.diffs {
            let ty = diff_type(diff)?;
            if !schema.contains(ty) {
                return Err(Error::InvalidSnapshot(format!("diff for unknown type {}", ty)));
            }
        }
        Ok(())
    }

    /// Serialize to JSON with deterministic ordering.
    pub fn to_json(&self) -> Result<String> {
        serde_json::to_string(self).map_err(|e| Error::InvalidSnapshot(e.to_string()))
    }

    /// Serialize to pretty JSON with deterministic ordering.
    pub fn to_json_pretty(&self) -> Result<String> {
        serde_json::to_string_pretty(self).map_err(|e| Error::InvalidSnapshot(e.to_string()))
    }

    /// Deserialize from JSON.
    pub fn from_json(json: &str) -> Result<Self> {
        let snapshot: Self =
            serde_json::from_str(json).map_err(|e| Error::InvalidSnapshot(e.to_string()))?;

        if snapshot.format_version > SNAPSHOT_FORMAT_VERSION {
            return Err(Error::InvalidSnapshot(format!(
                "unsupported snapshot format version: {} (max supported: {})",
                snapshot.format_version, SNAPSHOT_FORMAT_VERSION
            )));
        }

        Ok(snapshot)
    }
}

/// Type named by a diff in external form: the first non-null entry of its
/// `_type` pair.
pub(crate) fn diff_type(diff: &Json) -> Result<&str> {
    diff.get("_type")
        .and_then(Json::as_array)
        .and_then(|pair| pair.iter().find_map(Json::as_str))
        .ok_or_else(|| Error::InvalidSnapshot("diff without a type".into()))
}
