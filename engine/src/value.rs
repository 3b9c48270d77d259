//! Internal field values.

use crate::id::Id;
use chrono::{DateTime, NaiveDate, Utc};

/// Canonical in-memory value of a single field.
#[derive(Debug, Clone, PartialEq)]
pub enum Value {
    Null,
    Bool(bool),
    Int(i64),
    Float(f64),
    Text(String),
    Timestamp(DateTime<Utc>),
    Date(NaiveDate),
    /// Structured data held by untyped attributes
    Json(serde_json::Value),
    /// Foreign key target
    Ref(Id),
    /// Many-to-many targets
    Refs(RefSet),
}

impl Value {
    pub fn is_null(&self) -> bool {
        matches!(self, Value::Null)
    }

    /// Null, or an empty relationship set.
    pub fn is_empty(&self) -> bool {
        match self {
            Value::Null => true,
            Value::Refs(set) => set.is_empty(),
            _ => false,
        }
    }

    pub fn as_ref_id(&self) -> Option<Id> {
        match self {
            Value::Ref(id) => Some(*id),
            _ => None,
        }
    }

    pub fn as_refs(&self) -> Option<&RefSet> {
        match self {
            Value::Refs(set) => Some(set),
            _ => None,
        }
    }

    pub fn as_text(&self) -> Option<&str> {
        match self {
            Value::Text(s) => Some(s),
            _ => None,
        }
    }

    /// Every object this value points at.
    pub fn related(&self) -> Vec<Id> {
        match self {
            Value::Ref(id) => vec![*id],
            Value::Refs(set) => set.iter().collect(),
            _ => Vec::new(),
        }
    }

    /// Rewrite every handle through `f`.
    pub fn map_ids(&self, mut f: impl FnMut(Id) -> Id) -> Value {
        match self {
            Value::Ref(id) => Value::Ref(f(*id)),
            Value::Refs(set) => Value::Refs(set.iter().map(f).collect()),
            other => other.clone(),
        }
    }
}

impl From<&str> for Value {
    fn from(s: &str) -> Self {
        Value::Text(s.to_string())
    }
}

impl From<i64> for Value {
    fn from(n: i64) -> Self {
        Value::Int(n)
    }
}

impl From<bool> for Value {
    fn from(b: bool) -> Self {
        Value::Bool(b)
    }
}

impl From<Id> for Value {
    fn from(id: Id) -> Self {
        Value::Ref(id)
    }
}

/// Insertion-ordered set of handles.
///
/// Equality ignores order: two sets are equal when they hold the same members.
#[derive(Debug, Clone, Default, Eq)]
pub struct RefSet(Vec<Id>);

impl RefSet {
    pub fn new() -> Self {
        Self(Vec::new())
    }

    pub fn len(&self) -> usize {
        self.0.len()
    }

    pub fn is_empty(&self) -> bool {
        self.0.is_empty()
    }

    pub fn contains(&self, id: Id) -> bool {
        self.0.contains(&id)
    }

    /// Add a member, returning `false` if it was already present.
    pub fn insert(&mut self, id: Id) -> bool {
        if self.contains(id) {
            return false;
        }
        self.0.push(id);
        true
    }

    /// Remove a member, returning `false` if it was absent.
    pub fn remove(&mut self, id: Id) -> bool {
        let before = self.0.len();
        self.0.retain(|x| *x != id);
        before != self.0.len()
    }

    pub fn iter(&self) -> impl Iterator<Item = Id> + '_ {
        self.0.iter().copied()
    }

    /// Members of `self` not in `other`, in `self`'s order.
    pub fn difference(&self, other: &RefSet) -> RefSet {
        self.iter().filter(|id| !other.contains(*id)).collect()
    }

    pub fn intersection(&self, other: &RefSet) -> RefSet {
        self.iter().filter(|id| other.contains(*id)).collect()
    }

    /// `self` followed by the members of `other` not already present.
    pub fn union(&self, other: &RefSet) -> RefSet {
        let mut out = self.clone();
        for id in other.iter() {
            out.insert(id);
        }
        out
    }
}

impl PartialEq for RefSet {
    fn eq(&self, other: &Self) -> bool {
        self.len() == other.len() && self.iter().all(|id| other.contains(id))
    }
}

impl FromIterator<Id> for RefSet {
    fn from_iter<I: IntoIterator<Item = Id>>(iter: I) -> Self {
        let mut set = RefSet::new();
        for id in iter {
            set.insert(id);
        }
        set
    }
}

/// Hashable projection of a [`Value`] used as a secondary-index key.
#[derive(Debug, Clone, PartialEq, Eq, Hash, PartialOrd, Ord)]
pub enum IndexKey {
    Null,
    Bool(bool),
    Int(i64),
    /// Bit pattern of the float, with `-0.0` folded into `0.0`
    Float(u64),
    Text(String),
    /// Milliseconds since the epoch
    Timestamp(i64),
    Date(NaiveDate),
    Json(String),
    Ref(Id),
}

impl IndexKey {
    /// Index keys for a value. Relationship sets index every member and an
    /// empty set yields no keys.
    pub fn of(value: &Value) -> Vec<IndexKey> {
        match value {
            Value::Null => vec![IndexKey::Null],
            Value::Bool(b) => vec![IndexKey::Bool(*b)],
            Value::Int(n) => vec![IndexKey::Int(*n)],
            Value::Float(f) => {
                let f = if *f == 0.0 { 0.0 } else { *f };
                vec![IndexKey::Float(f.to_bits())]
            }
            Value::Text(s) => vec![IndexKey::Text(s.clone())],
            Value::Timestamp(t) => vec![IndexKey::Timestamp(t.timestamp_millis())],
            Value::Date(d) => vec![IndexKey::Date(*d)],
            Value::Json(j) => vec![IndexKey::Json(j.to_string())],
            Value::Ref(id) => vec![IndexKey::Ref(*id)],
            Value::Refs(set) => set.iter().map(IndexKey::Ref).collect(),
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::id::{IdArena, ObjectRef};

    fn ids(n: i64) -> (IdArena, Vec<Id>) {
        let mut arena = IdArena::new();
        let ids = (0..n)
            .map(|i| arena.intern(&ObjectRef::new("person", i)))
            .collect();
        (arena, ids)
    }

    #[test]
    fn refset_keeps_order_and_dedups() {
        let (_, ids) = ids(3);
        let set: RefSet = vec![ids[2], ids[0], ids[2], ids[1]].into_iter().collect();
        assert_eq!(set.iter().collect::<Vec<_>>(), vec![ids[2], ids[0], ids[1]]);
    }

    #[test]
    fn refset_equality_ignores_order() {
        let (_, ids) = ids(2);
        let a: RefSet = vec![ids[0], ids[1]].into_iter().collect();
        let b: RefSet = vec![ids[1], ids[0]].into_iter().collect();
        assert_eq!(a, b);
        assert_ne!(a, RefSet::new());
    }

    #[test]
    fn refset_set_operations() {
        let (_, ids) = ids(4);
        let a: RefSet = vec![ids[0], ids[1], ids[2]].into_iter().collect();
        let b: RefSet = vec![ids[2], ids[3]].into_iter().collect();
        assert_eq!(a.difference(&b).iter().collect::<Vec<_>>(), vec![ids[0], ids[1]]);
        assert_eq!(a.intersection(&b).iter().collect::<Vec<_>>(), vec![ids[2]]);
        assert_eq!(a.union(&b).len(), 4);
    }

    #[test]
    fn index_keys() {
        let (_, ids) = ids(2);
        assert_eq!(IndexKey::of(&Value::Float(-0.0)), IndexKey::of(&Value::Float(0.0)));
        let set: RefSet = ids.iter().copied().collect();
        assert_eq!(IndexKey::of(&Value::Refs(set)).len(), 2);
        assert!(IndexKey::of(&Value::Refs(RefSet::new())).is_empty());
    }
}
