//! Schema definition.
//!
//! A schema is the registry of every [`Model`] a store knows about. Merging
//! descriptions adds or replaces models and then synthesizes the reverse
//! side of every relationship that names one.

use crate::config::StoreConfig;
use crate::error::{Error, Result};
use crate::id::IdArena;
use crate::jsonapi::{self, Resource};
use crate::model::{EntityDescription, Model, Relationship};
use crate::ops::OpHandler;
use crate::record::Record;
use crate::store::Store;
use crate::TypeName;
use std::collections::BTreeMap;
use std::sync::Arc;

/// Registry of models keyed by type name.
#[derive(Debug, Clone, Default)]
pub struct Schema {
    models: BTreeMap<TypeName, Arc<Model>>,
}

impl Schema {
    pub fn new() -> Self {
        Self::default()
    }

    /// Build a schema from a JSON map of entity descriptions and check that
    /// every relationship target is present.
    pub fn from_json(json: &serde_json::Value) -> Result<Self> {
        let mut schema = Schema::new();
        schema.merge_json(json)?;
        schema.validate()?;
        Ok(schema)
    }

    /// Merge a JSON map of entity descriptions.
    pub fn merge_json(&mut self, json: &serde_json::Value) -> Result<()> {
        let descriptions: BTreeMap<TypeName, EntityDescription> =
            serde_json::from_value(json.clone())
                .map_err(|e| Error::InvalidDescription(e.to_string()))?;
        self.merge(&descriptions)
    }

    /// Add or replace models, then update reverse relationships.
    ///
    /// Operations registered on a replaced model are carried over.
    pub fn merge(&mut self, descriptions: &BTreeMap<TypeName, EntityDescription>) -> Result<()> {
        for (ty, desc) in descriptions {
            let mut model = Model::from_description(ty.clone(), desc)?;
            if let Some(previous) = self.models.get(ty) {
                for name in previous.ops().names() {
                    if let Some(handler) = previous.ops().get(name) {
                        model.register_op(name, handler.clone())?;
                    }
                }
            }
            self.models.insert(ty.clone(), Arc::new(model));
        }
        self.update_reverse_relationships()
    }

    /// Add a hand-built model.
    pub fn add_model(&mut self, model: Model) -> Result<()> {
        self.models.insert(model.ty().to_string(), Arc::new(model));
        self.update_reverse_relationships()
    }

    /// Builder-style [`Schema::add_model`].
    pub fn with_model(mut self, model: Model) -> Result<Self> {
        self.add_model(model)?;
        Ok(self)
    }

    /// Synthesize an always-many reverse field on the target of every
    /// relationship with a related name. Running it twice changes nothing.
    fn update_reverse_relationships(&mut self) -> Result<()> {
        let mut pending = Vec::new();
        for (ty, model) in &self.models {
            for (field, rel) in model.forward_relationships() {
                let Some(related_name) = &rel.related_name else {
                    continue;
                };
                let Some(target) = self.models.get(&rel.target) else {
                    continue;
                };
                match target.relationship(related_name) {
                    Some(existing)
                        if existing.reverse
                            && existing.target == *ty
                            && existing.related_name.as_deref() == Some(field) => {}
                    Some(_) => {
                        return Err(Error::InvalidDescription(format!(
                            "{}.{} clashes with the reverse of {}.{}",
                            rel.target, related_name, ty, field
                        )));
                    }
                    None if target.attribute(related_name).is_some() => {
                        return Err(Error::InvalidDescription(format!(
                            "{}.{} clashes with the reverse of {}.{}",
                            rel.target, related_name, ty, field
                        )));
                    }
                    None => pending.push((
                        rel.target.clone(),
                        related_name.clone(),
                        Relationship {
                            target: ty.clone(),
                            many: true,
                            related_name: Some(field.to_string()),
                            required: false,
                            reverse: true,
                        },
                    )),
                }
            }
        }
        for (target, name, rel) in pending {
            if let Some(model) = self.models.get_mut(&target) {
                Arc::make_mut(model).insert_reverse(name, rel);
            }
        }
        Ok(())
    }

    /// Check that every relationship points at a known model.
    pub fn validate(&self) -> Result<()> {
        for model in self.models.values() {
            for (field, rel) in model.relationships() {
                if !self.models.contains_key(&rel.target) {
                    return Err(Error::InvalidDescription(format!(
                        "{}.{} targets unknown model {}",
                        model.ty(),
                        field,
                        rel.target
                    )));
                }
            }
        }
        Ok(())
    }

    /// Look up a model, failing with [`Error::UnknownModel`].
    pub fn model(&self, ty: &str) -> Result<&Arc<Model>> {
        self.models
            .get(ty)
            .ok_or_else(|| Error::UnknownModel(ty.to_string()))
    }

    pub fn get_model(&self, ty: &str) -> Option<&Arc<Model>> {
        self.models.get(ty)
    }

    pub fn contains(&self, ty: &str) -> bool {
        self.models.contains_key(ty)
    }

    pub fn models(&self) -> impl Iterator<Item = &Arc<Model>> {
        self.models.values()
    }

    pub fn types(&self) -> impl Iterator<Item = &str> {
        self.models.keys().map(String::as_str)
    }

    /// Register a remote operation on a model.
    pub fn register_op(&mut self, ty: &str, name: &str, handler: OpHandler) -> Result<()> {
        let model = self
            .models
            .get_mut(ty)
            .ok_or_else(|| Error::UnknownModel(ty.to_string()))?;
        Arc::make_mut(model).register_op(name, handler)
    }

    /// Flatten a JSON:API response into per-object field maps named after
    /// model fields.
    pub fn from_json_api(&self, response: &serde_json::Value) -> Result<Vec<Resource>> {
        jsonapi::flatten_response(self, response)
    }

    /// Render records as a JSON:API document.
    pub fn to_json_api(&self, records: &[&Record], arena: &IdArena) -> Result<serde_json::Value> {
        jsonapi::render(self, records, arena)
    }

    /// A fresh, empty store over this schema.
    pub fn db(&self) -> Store {
        self.db_with_config(StoreConfig::default())
    }

    pub fn db_with_config(&self, config: StoreConfig) -> Store {
        Store::with_config(Arc::new(self.clone()), config)
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::field::FieldKind;
    use serde_json::json;

    fn test_schema() -> Schema {
        Schema::from_json(&json!({
            "movie": {
                "attributes": {"title": {"type": "text"}},
                "relationships": {
                    "director": {"type": "person", "relatedName": "directed"},
                    "actors": {"type": "person", "many": true, "relatedName": "actedIn"}
                }
            },
            "person": {
                "attributes": {"name": {"type": "text"}}
            }
        }))
        .unwrap()
    }

    #[test]
    fn reverse_relationships_are_synthesized() {
        let schema = test_schema();
        let person = schema.model("person").unwrap();

        let directed = person.relationship("directed").unwrap();
        assert!(directed.reverse);
        assert!(directed.many);
        assert_eq!(directed.target, "movie");
        assert_eq!(directed.related_name.as_deref(), Some("director"));
        assert_eq!(person.field_kind("actedIn"), Some(FieldKind::ManyToMany));
    }

    #[test]
    fn merge_is_idempotent() {
        let mut schema = test_schema();
        schema
            .merge_json(&json!({"person": {"attributes": {"name": {"type": "text"}}}}))
            .unwrap();
        let person = schema.model("person").unwrap();
        assert_eq!(person.relationships().count(), 2);

        schema.update_reverse_relationships().unwrap();
        assert_eq!(schema.model("person").unwrap().relationships().count(), 2);
    }

    #[test]
    fn unknown_model() {
        let schema = test_schema();
        assert!(matches!(schema.model("book"), Err(Error::UnknownModel(t)) if t == "book"));
    }

    #[test]
    fn missing_target_fails_validation() {
        let result = Schema::from_json(&json!({
            "movie": {"relationships": {"studio": {"type": "studio"}}}
        }));
        assert!(matches!(result, Err(Error::InvalidDescription(_))));
    }

    #[test]
    fn clashing_reverse_name() {
        let result = Schema::from_json(&json!({
            "movie": {"relationships": {"director": {"type": "person", "relatedName": "name"}}},
            "person": {"attributes": {"name": {"type": "text"}}}
        }));
        assert!(matches!(result, Err(Error::InvalidDescription(_))));
    }

    #[test]
    fn bad_index_field() {
        let result = Schema::from_json(&json!({
            "movie": {"attributes": {"title": {}}, "indices": ["year"]}
        }));
        assert!(matches!(result, Err(Error::UnknownField { .. })));
    }

    #[test]
    fn json_api_boundary() {
        let schema = test_schema();
        let resources = schema
            .from_json_api(&json!({
                "data": {"type": "movie", "id": 1, "attributes": {"title": "Rocky"}}
            }))
            .unwrap();
        assert_eq!(resources.len(), 1);
        assert_eq!(resources[0].fields["title"], json!("Rocky"));

        let mut store = schema.db();
        let movie = store.create("movie", &json!({"id": 1, "title": "Rocky"})).unwrap();
        let doc = schema.to_json_api(&[&movie], store.arena()).unwrap();
        assert_eq!(doc["data"][0]["type"], json!("movie"));
        assert_eq!(doc["data"][0]["attributes"]["title"], json!("Rocky"));
    }

    #[test]
    fn register_op_on_unknown_model() {
        let mut schema = test_schema();
        let handler = crate::ops::handler(|_| async { Ok(json!({})) });
        assert!(schema.register_op("movie", "create", handler.clone()).is_ok());
        assert!(schema.register_op("book", "create", handler).is_err());
        assert!(schema.model("movie").unwrap().ops().contains("create"));
    }
}
