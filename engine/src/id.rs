//! Object identifiers.
//!
//! Every `(type, key)` pair a store sees is interned once in its [`IdArena`]
//! and referred to by a small [`Id`] handle afterwards. Records, diffs,
//! relationship sets and indices all hold handles, so identity checks are a
//! single integer comparison.
//!
//! The arena also owns the server-id remap table: once a server key has been
//! aliased to a local one, interning either pair yields the same handle.

use crate::TypeName;
use serde::{Deserialize, Deserializer, Serialize};
use std::collections::HashMap;
use std::fmt;

/// Raw identifier value as it appears on the wire.
///
/// Numeric strings are normalized to integers so that `"1001"` and `1001`
/// name the same object.
#[derive(Debug, Clone, PartialEq, Eq, Hash, PartialOrd, Ord, Serialize)]
#[serde(untagged)]
pub enum Key {
    Int(i64),
    Str(String),
}

impl Key {
    /// Parse a key from JSON. Only integers and non-empty strings are keys.
    pub fn from_json(value: &serde_json::Value) -> Option<Self> {
        match value {
            serde_json::Value::Number(n) => n.as_i64().map(Key::Int),
            serde_json::Value::String(s) if !s.is_empty() => Some(Key::from(s.as_str())),
            _ => None,
        }
    }

    pub fn to_json(&self) -> serde_json::Value {
        match self {
            Key::Int(n) => serde_json::Value::from(*n),
            Key::Str(s) => serde_json::Value::from(s.clone()),
        }
    }
}

impl fmt::Display for Key {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        match self {
            Key::Int(n) => write!(f, "{}", n),
            Key::Str(s) => write!(f, "{}", s),
        }
    }
}

impl From<i64> for Key {
    fn from(n: i64) -> Self {
        Key::Int(n)
    }
}

impl From<i32> for Key {
    fn from(n: i32) -> Self {
        Key::Int(n.into())
    }
}

impl From<&str> for Key {
    fn from(s: &str) -> Self {
        match s.parse::<i64>() {
            Ok(n) if n.to_string() == s => Key::Int(n),
            _ => Key::Str(s.to_string()),
        }
    }
}

impl From<String> for Key {
    fn from(s: String) -> Self {
        Key::from(s.as_str())
    }
}

impl<'de> Deserialize<'de> for Key {
    fn deserialize<D: Deserializer<'de>>(deserializer: D) -> Result<Self, D::Error> {
        let value = serde_json::Value::deserialize(deserializer)?;
        Key::from_json(&value)
            .ok_or_else(|| serde::de::Error::custom(format!("invalid identifier: {}", value)))
    }
}

/// External form of an identifier: `{type, id}`.
#[derive(Debug, Clone, PartialEq, Eq, Hash, PartialOrd, Ord, Serialize, Deserialize)]
pub struct ObjectRef {
    #[serde(rename = "type", alias = "_type")]
    pub ty: TypeName,
    pub id: Key,
}

impl ObjectRef {
    pub fn new(ty: impl Into<TypeName>, id: impl Into<Key>) -> Self {
        Self {
            ty: ty.into(),
            id: id.into(),
        }
    }

    /// Parse `{type|_type, id}`. Returns `None` for anything else.
    pub fn from_json(value: &serde_json::Value) -> Option<Self> {
        let obj = value.as_object()?;
        let ty = obj.get("type").or_else(|| obj.get("_type"))?.as_str()?;
        let id = Key::from_json(obj.get("id")?)?;
        Some(Self::new(ty, id))
    }

    pub fn to_json(&self) -> serde_json::Value {
        serde_json::json!({"type": self.ty, "id": self.id.to_json()})
    }
}

impl fmt::Display for ObjectRef {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        write!(f, "{}|{}", self.ty, self.id)
    }
}

impl From<ObjectRef> for serde_json::Value {
    fn from(r: ObjectRef) -> Self {
        r.to_json()
    }
}

/// Interned identifier handle. Only meaningful within the arena that issued it.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, PartialOrd, Ord)]
pub struct Id(u32);

impl Id {
    pub fn index(self) -> usize {
        self.0 as usize
    }
}

impl fmt::Display for Id {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        write!(f, "#{}", self.0)
    }
}

/// Store-scoped identifier interner and server-id remap table.
#[derive(Debug, Clone, Default)]
pub struct IdArena {
    entries: Vec<ObjectRef>,
    lookup: HashMap<ObjectRef, Id>,
    /// alias -> canonical handle
    aliases: HashMap<Id, Id>,
    /// local handle -> server handle
    server: HashMap<Id, Id>,
}

impl IdArena {
    pub fn new() -> Self {
        Self::default()
    }

    /// Intern a reference and return its canonical handle.
    pub fn intern(&mut self, r: &ObjectRef) -> Id {
        let raw = self.intern_raw(r);
        self.resolve(raw)
    }

    /// Intern without following aliases.
    pub(crate) fn intern_raw(&mut self, r: &ObjectRef) -> Id {
        if let Some(id) = self.lookup.get(r) {
            return *id;
        }
        let id = Id(self.entries.len() as u32);
        self.entries.push(r.clone());
        self.lookup.insert(r.clone(), id);
        id
    }

    /// Find the canonical handle for a reference without interning it.
    pub fn lookup(&self, r: &ObjectRef) -> Option<Id> {
        self.lookup.get(r).map(|id| self.resolve(*id))
    }

    /// Follow aliases to the canonical handle.
    pub fn resolve(&self, mut id: Id) -> Id {
        while let Some(next) = self.aliases.get(&id) {
            id = *next;
        }
        id
    }

    /// The reference a handle was interned from.
    ///
    /// Handles must come from this arena.
    pub fn get(&self, id: Id) -> &ObjectRef {
        &self.entries[id.index()]
    }

    pub fn type_of(&self, id: Id) -> &str {
        &self.get(id).ty
    }

    pub fn key_of(&self, id: Id) -> &Key {
        &self.get(id).id
    }

    /// Make `from` resolve to `to` from now on.
    pub fn alias(&mut self, from: Id, to: Id) {
        self.aliases.remove(&to);
        if from != to {
            self.aliases.insert(from, to);
        }
    }

    /// Record that the server knows local handle `local` as `server`.
    pub fn map_server(&mut self, server: Id, local: Id) {
        let local = self.resolve(local);
        self.alias(server, local);
        self.server.insert(local, server);
    }

    /// The reference the remote authority knows this object by.
    pub fn wire_ref(&self, id: Id) -> &ObjectRef {
        let id = self.resolve(id);
        match self.server.get(&id) {
            Some(server) => self.get(*server),
            None => self.get(id),
        }
    }

    /// Server-to-local mappings as `(server, local)` reference pairs.
    pub fn server_mappings(&self) -> impl Iterator<Item = (&ObjectRef, &ObjectRef)> {
        self.server
            .iter()
            .map(|(local, server)| (self.get(*server), self.get(*local)))
    }

    /// Re-identified references as `(old, current)` pairs. Server keys are
    /// not included; see [`IdArena::server_mappings`].
    pub fn renames(&self) -> impl Iterator<Item = (&ObjectRef, &ObjectRef)> {
        self.aliases
            .keys()
            .filter(|from| !self.server.values().any(|server| server == *from))
            .map(|from| (self.get(*from), self.get(self.resolve(*from))))
    }

    pub fn len(&self) -> usize {
        self.entries.len()
    }

    pub fn is_empty(&self) -> bool {
        self.entries.is_empty()
    }
}
