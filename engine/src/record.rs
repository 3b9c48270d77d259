//! Immutable records.

use crate::id::Id;
use crate::value::Value;
use crate::{FieldName, TypeName};
use std::collections::BTreeMap;

/// A by-value snapshot of one object.
///
/// Records are never changed in place; [`Record::with`] and friends return a
/// new record. A record built by its model holds a value for every field of
/// that model.
#[derive(Debug, Clone, PartialEq)]
pub struct Record {
    ty: TypeName,
    id: Id,
    values: BTreeMap<FieldName, Value>,
}

impl Record {
    pub(crate) fn new(ty: impl Into<TypeName>, id: Id, values: BTreeMap<FieldName, Value>) -> Self {
        Self {
            ty: ty.into(),
            id,
            values,
        }
    }

    /// Model type name.
    pub fn ty(&self) -> &str {
        &self.ty
    }

    pub fn id(&self) -> Id {
        self.id
    }

    /// Value of a field, or `None` if the model has no such field.
    pub fn get(&self, field: &str) -> Option<&Value> {
        self.values.get(field)
    }

    /// Value of a field, treating unknown fields as null.
    pub fn value(&self, field: &str) -> &Value {
        self.values.get(field).unwrap_or(&Value::Null)
    }

    pub fn fields(&self) -> impl Iterator<Item = (&str, &Value)> {
        self.values.iter().map(|(k, v)| (k.as_str(), v))
    }

    /// A copy of this record with one field replaced.
    pub fn with(&self, field: impl Into<FieldName>, value: Value) -> Record {
        let mut values = self.values.clone();
        values.insert(field.into(), value);
        Record {
            ty: self.ty.clone(),
            id: self.id,
            values,
        }
    }

    /// A copy of this record under a different handle.
    pub fn with_id(&self, id: Id) -> Record {
        Record {
            ty: self.ty.clone(),
            id,
            values: self.values.clone(),
        }
    }

    /// A copy with every relationship handle passed through `f`.
    pub fn map_ids(&self, mut f: impl FnMut(Id) -> Id) -> Record {
        Record {
            ty: self.ty.clone(),
            id: f(self.id),
            values: self
                .values
                .iter()
                .map(|(k, v)| (k.clone(), v.map_ids(&mut f)))
                .collect(),
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::id::{IdArena, ObjectRef};

    #[test]
    fn with_returns_new_record() {
        let mut arena = IdArena::new();
        let id = arena.intern(&ObjectRef::new("movie", 1));
        let mut values = BTreeMap::new();
        values.insert("title".to_string(), Value::from("Rocky"));
        let original = Record::new("movie", id, values);

        let changed = original.with("title", Value::from("Rocky 2"));
        assert_eq!(original.value("title"), &Value::from("Rocky"));
        assert_eq!(changed.value("title"), &Value::from("Rocky 2"));
        assert_eq!(changed.id(), id);
        assert_eq!(changed.value("missing"), &Value::Null);
        assert!(changed.get("missing").is_none());
    }
}
