//! Instance - an editable handle on one object.
//!
//! An [`Instance`] owns a copy of a record and stages edits on it without
//! touching the store. [`Instance::save`] writes the staged record back as a
//! single diff.

use crate::error::{Error, Result};
use crate::field::FieldKind;
use crate::id::Id;
use crate::model::Model;
use crate::record::Record;
use crate::store::Store;
use crate::value::{RefSet, Value};
use std::sync::Arc;

/// Owned, editable copy of one record.
#[derive(Debug, Clone)]
pub struct Instance {
    model: Arc<Model>,
    /// Last saved state, `None` until the object exists in a store
    initial: Option<Record>,
    values: Record,
}

impl Instance {
    /// Wrap a record that exists in a store.
    pub(crate) fn new(model: Arc<Model>, record: Record) -> Self {
        Self {
            model,
            initial: Some(record.clone()),
            values: record,
        }
    }

    /// Wrap a record that has not been saved yet.
    pub(crate) fn unsaved(model: Arc<Model>, record: Record) -> Self {
        Self {
            model,
            initial: None,
            values: record,
        }
    }

    pub fn id(&self) -> Id {
        self.values.id()
    }

    pub fn ty(&self) -> &str {
        self.model.ty()
    }

    pub fn model(&self) -> &Arc<Model> {
        &self.model
    }

    /// The staged record.
    pub fn record(&self) -> &Record {
        &self.values
    }

    pub fn get(&self, field: &str) -> Result<&Value> {
        self.model.field_kind_or_err(field)?;
        Ok(self.values.value(field))
    }

    /// Stage a new value for an attribute or foreign key.
    pub fn set(&mut self, field: &str, value: impl Into<Value>) -> Result<()> {
        let value = value.into();
        match self.writable_kind(field)? {
            FieldKind::ManyToMany => {
                return Err(Error::InvalidValue {
                    field: field.to_string(),
                    reason: "many-to-many fields change through add and remove".into(),
                });
            }
            FieldKind::ForeignKey if !matches!(value, Value::Ref(_) | Value::Null) => {
                return Err(Error::InvalidValue {
                    field: field.to_string(),
                    reason: "expected a reference or null".into(),
                });
            }
            _ => {}
        }
        self.values = self.values.with(field, value);
        Ok(())
    }

    /// Stage adding `related` to a many-to-many field.
    pub fn add(&mut self, field: &str, related: Id) -> Result<()> {
        let mut set = self.many(field)?;
        if set.insert(related) {
            self.values = self.values.with(field, Value::Refs(set));
        }
        Ok(())
    }

    /// Stage removing `related` from a many-to-many field.
    pub fn remove(&mut self, field: &str, related: Id) -> Result<()> {
        let mut set = self.many(field)?;
        if set.remove(related) {
            self.values = self.values.with(field, Value::Refs(set));
        }
        Ok(())
    }

    fn many(&self, field: &str) -> Result<RefSet> {
        if self.writable_kind(field)? != FieldKind::ManyToMany {
            return Err(Error::InvalidValue {
                field: field.to_string(),
                reason: "not a many-to-many field".into(),
            });
        }
        Ok(self.values.value(field).as_refs().cloned().unwrap_or_default())
    }

    fn writable_kind(&self, field: &str) -> Result<FieldKind> {
        let kind = self.model.field_kind_or_err(field)?;
        if self.model.is_reverse(field) {
            return Err(Error::ReverseRelationship(field.to_string()));
        }
        Ok(kind)
    }

    /// The object a foreign key points at, as found in `store`'s head.
    pub fn related(&self, field: &str, store: &Store) -> Result<Option<Instance>> {
        if self.model.field_kind_or_err(field)? != FieldKind::ForeignKey {
            return Err(Error::InvalidValue {
                field: field.to_string(),
                reason: "not a foreign key".into(),
            });
        }
        Ok(self
            .values
            .value(field)
            .as_ref_id()
            .and_then(|id| store.get_instance(id)))
    }

    /// Every object a many-to-many or reverse field points at that exists in
    /// `store`'s head.
    pub fn related_all(&self, field: &str, store: &Store) -> Result<Vec<Instance>> {
        if self.model.field_kind_or_err(field)? != FieldKind::ManyToMany {
            return Err(Error::InvalidValue {
                field: field.to_string(),
                reason: "not a many-to-many field".into(),
            });
        }
        Ok(self
            .values
            .value(field)
            .related()
            .into_iter()
            .filter_map(|id| store.get_instance(id))
            .collect())
    }

    /// Whether there are staged edits, or the object was never saved.
    pub fn is_dirty(&self) -> bool {
        match &self.initial {
            Some(initial) => self.model.diff(Some(initial), Some(&self.values)).is_some(),
            None => true,
        }
    }

    /// Drop staged edits.
    pub fn reset(&mut self) {
        self.values = match &self.initial {
            Some(initial) => initial.clone(),
            None => self.model.default_record(self.values.id()),
        };
    }

    /// Write staged edits to `store`, returning the stored record.
    pub fn save(&mut self, store: &mut Store) -> Result<Record> {
        let saved = store.save_record(self.values.clone())?;
        self.initial = Some(saved.clone());
        self.values = saved.clone();
        Ok(saved)
    }

    /// Remove the object from `store`.
    pub fn delete(self, store: &mut Store) -> Result<()> {
        store.remove(self.id())
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::schema::Schema;
    use serde_json::json;

    fn test_store() -> Store {
        Schema::from_json(&json!({
            "movie": {
                "attributes": {"title": {"type": "text"}},
                "relationships": {
                    "director": {"type": "person", "relatedName": "directed"},
                    "actors": {"type": "person", "many": true}
                }
            },
            "person": {"attributes": {"name": {"type": "text"}}}
        }))
        .unwrap()
        .db()
    }

    #[test]
    fn set_and_save() {
        let mut store = test_store();
        let movie = store.create("movie", &json!({"id": 1, "title": "Rocky"})).unwrap();
        let mut instance = store.get_instance(movie.id()).unwrap();

        assert!(!instance.is_dirty());
        instance.set("title", "Rocky II").unwrap();
        assert!(instance.is_dirty());
        assert_eq!(store.get(movie.id()).unwrap().value("title"), &Value::from("Rocky"));

        instance.save(&mut store).unwrap();
        assert!(!instance.is_dirty());
        assert_eq!(store.get(movie.id()).unwrap().value("title"), &Value::from("Rocky II"));
        assert_eq!(store.local_diffs().len(), 2);
    }

    #[test]
    fn reset_discards_edits() {
        let mut store = test_store();
        let movie = store.create("movie", &json!({"id": 1, "title": "Rocky"})).unwrap();
        let mut instance = store.get_instance(movie.id()).unwrap();
        instance.set("title", "Rambo").unwrap();
        instance.reset();
        assert_eq!(instance.get("title").unwrap(), &Value::from("Rocky"));
    }

    #[test]
    fn relationships() {
        let mut store = test_store();
        let sly = store.create("person", &json!({"id": 1, "name": "Sly"})).unwrap();
        let talia = store.create("person", &json!({"id": 2, "name": "Talia"})).unwrap();
        let movie = store.create("movie", &json!({"id": 1, "director": 1})).unwrap();

        let mut instance = store.get_instance(movie.id()).unwrap();
        let director = instance.related("director", &store).unwrap().unwrap();
        assert_eq!(director.id(), sly.id());

        instance.add("actors", sly.id()).unwrap();
        instance.add("actors", talia.id()).unwrap();
        instance.remove("actors", sly.id()).unwrap();
        instance.save(&mut store).unwrap();

        let actors = instance.related_all("actors", &store).unwrap();
        assert_eq!(actors.len(), 1);
        assert_eq!(actors[0].id(), talia.id());

        let directed = director.related_all("directed", &store).unwrap();
        assert_eq!(directed.len(), 1);
    }

    #[test]
    fn invalid_edits() {
        let mut store = test_store();
        let person = store.create("person", &json!({"id": 1})).unwrap();
        let movie = store.create("movie", &json!({"id": 1})).unwrap();
        let mut instance = store.get_instance(movie.id()).unwrap();

        assert!(matches!(
            instance.set("actors", Value::Null),
            Err(Error::InvalidValue { .. })
        ));
        assert!(matches!(
            instance.set("director", "Sly"),
            Err(Error::InvalidValue { .. })
        ));
        assert!(matches!(
            instance.add("title", person.id()),
            Err(Error::InvalidValue { .. })
        ));
        assert!(matches!(
            instance.set("year", 1976i64),
            Err(Error::UnknownField { .. })
        ));

        let mut person = store.get_instance(person.id()).unwrap();
        assert!(matches!(
            person.add("directed", movie.id()),
            Err(Error::ReverseRelationship(_))
        ));
    }

    #[test]
    fn unsaved_instances() {
        let mut store = test_store();
        let mut instance = store.create_instance("movie", &json!({"title": "Rocky"})).unwrap();
        assert!(instance.is_dirty());
        assert!(store.get(instance.id()).is_none());

        instance.save(&mut store).unwrap();
        assert!(!instance.is_dirty());
        assert!(store.get(instance.id()).is_some());

        instance.delete(&mut store).unwrap();
        assert!(store.local_diffs().len() == 2);
    }
}
