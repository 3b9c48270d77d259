//! Models.
//!
//! A [`Model`] declares one entity type: its attributes, its relationships
//! (forward and synthesized reverse), the fields to index, and the remote
//! operations registered for it. It builds records from external data,
//! computes object-level diffs and applies them.

use crate::config::ConflictPolicy;
use crate::diff::{Diff, DiffOp};
use crate::error::{Error, Result};
use crate::field::{AttributeType, FieldKind};
use crate::id::{Id, IdArena};
use crate::ops::{OpHandler, Operations};
use crate::record::Record;
use crate::value::Value;
use crate::{FieldName, TypeName};
use serde::{Deserialize, Serialize};
use serde_json::{json, Map, Value as Json};
use std::collections::BTreeMap;

/// Description of one attribute.
#[derive(Debug, Clone, Default, PartialEq, Serialize, Deserialize)]
#[serde(rename_all = "camelCase")]
pub struct AttributeDescription {
    #[serde(rename = "type", default, skip_serializing_if = "Option::is_none")]
    pub ty: Option<String>,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub default: Option<Json>,
    #[serde(default)]
    pub required: bool,
}

/// Description of one relationship.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
#[serde(rename_all = "camelCase")]
pub struct RelationshipDescription {
    #[serde(rename = "type")]
    pub ty: TypeName,
    #[serde(default)]
    pub many: bool,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub related_name: Option<FieldName>,
    #[serde(default)]
    pub required: bool,
}

/// Entity description as supplied by the application.
#[derive(Debug, Clone, Default, PartialEq, Serialize, Deserialize)]
#[serde(rename_all = "camelCase")]
pub struct EntityDescription {
    #[serde(default)]
    pub attributes: BTreeMap<FieldName, AttributeDescription>,
    #[serde(default)]
    pub relationships: BTreeMap<FieldName, RelationshipDescription>,
    #[serde(default)]
    pub indices: Vec<FieldName>,
}

/// A scalar attribute.
#[derive(Debug, Clone, PartialEq)]
pub struct Attribute {
    pub ty: AttributeType,
    pub default: Value,
    pub required: bool,
}

impl Attribute {
    pub fn new(ty: AttributeType) -> Self {
        Self {
            ty,
            default: Value::Null,
            required: false,
        }
    }

    pub fn with_default(mut self, default: Value) -> Self {
        self.default = default;
        self
    }

    pub fn required(mut self) -> Self {
        self.required = true;
        self
    }
}

/// A foreign-key or many-to-many relationship.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct Relationship {
    /// Target model type
    pub target: TypeName,
    pub many: bool,
    /// Name of the inverse field on the target
    pub related_name: Option<FieldName>,
    /// Whether the target must exist remotely before this object is sent
    pub required: bool,
    /// Synthesized inverse of a relationship declared elsewhere
    pub reverse: bool,
}

impl Relationship {
    pub fn foreign_key(target: impl Into<TypeName>) -> Self {
        Self {
            target: target.into(),
            many: false,
            related_name: None,
            required: false,
            reverse: false,
        }
    }

    pub fn many_to_many(target: impl Into<TypeName>) -> Self {
        Self {
            many: true,
            ..Self::foreign_key(target)
        }
    }

    pub fn related_name(mut self, name: impl Into<FieldName>) -> Self {
        self.related_name = Some(name.into());
        self
    }

    pub fn required(mut self) -> Self {
        self.required = true;
        self
    }

    pub fn kind(&self) -> FieldKind {
        if self.many {
            FieldKind::ManyToMany
        } else {
            FieldKind::ForeignKey
        }
    }
}

/// One entity type.
#[derive(Debug, Clone)]
pub struct Model {
    ty: TypeName,
    attributes: BTreeMap<FieldName, Attribute>,
    relationships: BTreeMap<FieldName, Relationship>,
    indices: Vec<FieldName>,
    ops: Operations,
}

impl Model {
    pub fn new(ty: impl Into<TypeName>) -> Self {
        Self {
            ty: ty.into(),
            attributes: BTreeMap::new(),
            relationships: BTreeMap::new(),
            indices: Vec::new(),
            ops: Operations::default(),
        }
    }

    /// Build a model from its description. Relationship targets are checked
    /// by the schema.
    pub fn from_description(ty: impl Into<TypeName>, desc: &EntityDescription) -> Result<Self> {
        let mut model = Model::new(ty);
        for (name, attr) in &desc.attributes {
            let kind = AttributeType::parse(attr.ty.as_deref());
            let default = match &attr.default {
                Some(json) => kind.to_internal(name, json)?,
                None => Value::Null,
            };
            model.attributes.insert(
                name.clone(),
                Attribute {
                    ty: kind,
                    default,
                    required: attr.required,
                },
            );
        }
        for (name, rel) in &desc.relationships {
            if model.attributes.contains_key(name) {
                return Err(Error::InvalidDescription(format!(
                    "{}.{} declared as both attribute and relationship",
                    model.ty, name
                )));
            }
            model.relationships.insert(
                name.clone(),
                Relationship {
                    target: rel.ty.clone(),
                    many: rel.many,
                    related_name: rel.related_name.clone(),
                    required: rel.required,
                    reverse: false,
                },
            );
        }
        for index in &desc.indices {
            model = model.with_index(index.clone())?;
        }
        Ok(model)
    }

    pub fn with_attribute(mut self, name: impl Into<FieldName>, attr: Attribute) -> Self {
        self.attributes.insert(name.into(), attr);
        self
    }

    pub fn with_relationship(mut self, name: impl Into<FieldName>, rel: Relationship) -> Self {
        self.relationships.insert(name.into(), rel);
        self
    }

    pub fn with_index(mut self, field: impl Into<FieldName>) -> Result<Self> {
        let field = field.into();
        self.field_kind_or_err(&field)?;
        if !self.indices.contains(&field) {
            self.indices.push(field);
        }
        Ok(self)
    }

    pub fn ty(&self) -> &str {
        &self.ty
    }

    /// Kind of a field, or `None` if the model has no such field.
    pub fn field_kind(&self, name: &str) -> Option<FieldKind> {
        if let Some(attr) = self.attributes.get(name) {
            return Some(FieldKind::Attribute(attr.ty));
        }
        self.relationships.get(name).map(Relationship::kind)
    }

    pub fn field_kind_or_err(&self, name: &str) -> Result<FieldKind> {
        self.field_kind(name).ok_or_else(|| Error::UnknownField {
            ty: self.ty.clone(),
            field: name.to_string(),
        })
    }

    pub fn attribute(&self, name: &str) -> Option<&Attribute> {
        self.attributes.get(name)
    }

    pub fn relationship(&self, name: &str) -> Option<&Relationship> {
        self.relationships.get(name)
    }

    pub fn attributes(&self) -> impl Iterator<Item = (&str, &Attribute)> {
        self.attributes.iter().map(|(k, v)| (k.as_str(), v))
    }

    /// All relationships, reverse ones included.
    pub fn relationships(&self) -> impl Iterator<Item = (&str, &Relationship)> {
        self.relationships.iter().map(|(k, v)| (k.as_str(), v))
    }

    /// Relationships declared on this model.
    pub fn forward_relationships(&self) -> impl Iterator<Item = (&str, &Relationship)> {
        self.relationships().filter(|(_, rel)| !rel.reverse)
    }

    /// Forward many-to-many field names.
    pub fn many_to_many(&self) -> impl Iterator<Item = &str> {
        self.forward_relationships()
            .filter(|(_, rel)| rel.many)
            .map(|(name, _)| name)
    }

    /// Every field with its kind, optionally skipping reverse relationships.
    pub fn fields(&self, include_reverse: bool) -> impl Iterator<Item = (&str, FieldKind)> {
        let attrs = self
            .attributes
            .iter()
            .map(|(name, attr)| (name.as_str(), FieldKind::Attribute(attr.ty)));
        let rels = self
            .relationships
            .iter()
            .filter(move |(_, rel)| include_reverse || !rel.reverse)
            .map(|(name, rel)| (name.as_str(), rel.kind()));
        attrs.chain(rels)
    }

    pub fn is_reverse(&self, name: &str) -> bool {
        self.relationships.get(name).is_some_and(|rel| rel.reverse)
    }

    /// Fields with a secondary index: declared indices plus every relationship.
    pub fn indexed_fields(&self) -> Vec<FieldName> {
        let mut out = self.indices.clone();
        for name in self.relationships.keys() {
            if !out.contains(name) {
                out.push(name.clone());
            }
        }
        out
    }

    pub(crate) fn insert_reverse(&mut self, name: FieldName, rel: Relationship) {
        self.relationships.insert(name, rel);
    }

    pub fn ops(&self) -> &Operations {
        &self.ops
    }

    /// Register a remote operation.
    ///
    /// Valid names are `list`, `detail`, `create`, `update`, `remove`,
    /// `options`, and `<field>Add`/`<field>Remove` for many-to-many fields.
    pub fn register_op(&mut self, name: impl Into<String>, handler: OpHandler) -> Result<()> {
        let name = name.into();
        let valid = match name.as_str() {
            "list" | "detail" | "create" | "update" | "remove" | "options" => true,
            other => self.many_to_many().any(|field| {
                other.strip_prefix(field) == Some("Add")
                    || other.strip_prefix(field) == Some("Remove")
            }),
        };
        if !valid {
            return Err(Error::UnknownOperation(name));
        }
        self.ops.insert(name, handler);
        Ok(())
    }

    /// A record with every field empty.
    pub fn empty_record(&self, id: Id) -> Record {
        let values = self
            .fields(true)
            .map(|(name, kind)| (name.to_string(), kind.empty()))
            .collect();
        Record::new(self.ty.clone(), id, values)
    }

    /// A record with every field at its default.
    pub fn default_record(&self, id: Id) -> Record {
        let mut values: BTreeMap<FieldName, Value> = self
            .fields(true)
            .map(|(name, kind)| (name.to_string(), kind.empty()))
            .collect();
        for (name, attr) in &self.attributes {
            values.insert(name.clone(), attr.default.clone());
        }
        Record::new(self.ty.clone(), id, values)
    }

    /// Build a record from flattened external data.
    ///
    /// Unknown keys are ignored, omitted attributes take their defaults.
    /// Reverse relationships may not be supplied.
    pub fn to_record(&self, id: Id, data: &Map<String, Json>, arena: &mut IdArena) -> Result<Record> {
        let record = self.merge_values(&self.default_record(id), data, arena)?;
        for (name, attr) in &self.attributes {
            if attr.required && record.value(name).is_null() {
                return Err(Error::InvalidValue {
                    field: name.clone(),
                    reason: "value is required".into(),
                });
            }
        }
        Ok(record)
    }

    /// Apply the fields present in `data` on top of `record`.
    pub fn merge_values(
        &self,
        record: &Record,
        data: &Map<String, Json>,
        arena: &mut IdArena,
    ) -> Result<Record> {
        let mut record = record.clone();
        for (name, value) in self.convert(data, arena, false)? {
            record = record.with(name, value);
        }
        Ok(record)
    }

    /// Like [`Model::merge_values`] but silently drops reverse relationships,
    /// which are rebuilt from the forward side after a load.
    pub(crate) fn merge_loaded(
        &self,
        record: &Record,
        data: &Map<String, Json>,
        arena: &mut IdArena,
    ) -> Result<Record> {
        let mut record = record.clone();
        for (name, value) in self.convert(data, arena, true)? {
            record = record.with(name, value);
        }
        Ok(record)
    }

    fn convert(
        &self,
        data: &Map<String, Json>,
        arena: &mut IdArena,
        skip_reverse: bool,
    ) -> Result<Vec<(FieldName, Value)>> {
        let mut out = Vec::new();
        for (name, json) in data {
            let Some(kind) = self.field_kind(name) else {
                continue;
            };
            if self.is_reverse(name) {
                if skip_reverse {
                    continue;
                }
                return Err(Error::ReverseRelationship(name.clone()));
            }
            let json = self.normalize_refs(name, json);
            out.push((name.clone(), kind.to_internal(name, &json, arena)?));
        }
        Ok(out)
    }

    /// Wrap bare keys given for relationship fields as `{type, id}`.
    pub(crate) fn normalize_refs(&self, field: &str, json: &Json) -> Json {
        let Some(rel) = self.relationships.get(field) else {
            return json.clone();
        };
        let wrap = |item: &Json| match item {
            Json::String(s) if s.is_empty() => item.clone(),
            Json::String(_) | Json::Number(_) => json!({"type": rel.target, "id": item}),
            _ => item.clone(),
        };
        match json {
            Json::Array(items) => Json::Array(items.iter().map(wrap).collect()),
            other => wrap(other),
        }
    }

    /// Diff two versions of an object. Reverse relationships never take part.
    ///
    /// Returns `None` when there is nothing to do.
    pub fn diff(&self, from: Option<&Record>, to: Option<&Record>) -> Option<Diff> {
        let (id, op) = match (from, to) {
            (None, None) => return None,
            (None, Some(to)) => (to.id(), DiffOp::Create),
            (Some(from), None) => (from.id(), DiffOp::Remove),
            (Some(_), Some(to)) => (to.id(), DiffOp::Update),
        };
        let mut diff = Diff::new(self.ty.clone(), id, op);
        for (name, kind) in self.fields(false) {
            let empty = kind.empty();
            let before = from.map(|r| r.value(name)).unwrap_or(&empty);
            let after = to.map(|r| r.value(name)).unwrap_or(&empty);
            if let Some(field_diff) = kind.diff(before, after) {
                diff.insert(name, field_diff);
            }
        }
        if op == DiffOp::Update && diff.is_empty() {
            return None;
        }
        Some(diff)
    }

    /// Apply a diff to the current version of its object.
    ///
    /// Returns `None` when the object ends up removed.
    pub fn apply_diff(
        &self,
        existing: Option<&Record>,
        diff: &Diff,
        reverse: bool,
        policy: ConflictPolicy,
    ) -> Result<Option<Record>> {
        let describe = || format!("{}|{}", self.ty, diff.id());
        match diff.op().directed(reverse) {
            DiffOp::Create => {
                if existing.is_some() && policy == ConflictPolicy::Strict {
                    return Err(Error::RecordAlreadyExists(describe()));
                }
                let mut record = self.empty_record(diff.id());
                for (name, field_diff) in diff.fields() {
                    let kind = self.field_kind_or_err(name)?;
                    record = record.with(name, kind.apply_diff(&kind.empty(), field_diff, reverse));
                }
                Ok(Some(record))
            }
            DiffOp::Remove => {
                if existing.is_none() {
                    return Err(Error::RecordNotFound(describe()));
                }
                Ok(None)
            }
            DiffOp::Update => {
                let Some(existing) = existing else {
                    return Err(Error::RecordNotFound(describe()));
                };
                let mut record = existing.clone();
                for (name, field_diff) in diff.fields() {
                    let kind = self.field_kind_or_err(name)?;
                    let current = existing.value(name);
                    if policy == ConflictPolicy::Strict
                        && !kind.matches_origin(current, field_diff, reverse)
                    {
                        return Err(Error::Conflict {
                            ty: self.ty.clone(),
                            id: diff.id().to_string(),
                            field: name.to_string(),
                        });
                    }
                    record = record.with(name, kind.apply_diff(current, field_diff, reverse));
                }
                Ok(Some(record))
            }
        }
    }

    /// Render a diff as a JSON:API document for the remote authority.
    ///
    /// Only attributes and foreign keys are rendered; many-to-many changes
    /// travel through the `<field>Add`/`<field>Remove` operations.
    pub fn diff_to_json_api(&self, diff: &Diff, arena: &IdArena) -> Json {
        let wire = arena.wire_ref(diff.id());
        let mut data = Map::new();
        data.insert("type".into(), Json::String(wire.ty.clone()));
        data.insert("id".into(), wire.id.to_json());
        if diff.op() == DiffOp::Remove {
            return json!({ "data": data });
        }

        let mut attributes = Map::new();
        let mut relationships = Map::new();
        for (name, field_diff) in diff.fields() {
            let (Some(kind), Some(value)) = (self.field_kind(name), field_diff.target(false)) else {
                continue;
            };
            match kind {
                FieldKind::Attribute(_) => {
                    attributes.insert(name.to_string(), kind.from_internal(value, arena));
                }
                FieldKind::ForeignKey => {
                    let target = match value {
                        Value::Ref(id) => arena.wire_ref(*id).to_json(),
                        _ => Json::Null,
                    };
                    relationships.insert(name.to_string(), json!({ "data": target }));
                }
                FieldKind::ManyToMany => {}
            }
        }
        if !attributes.is_empty() {
            data.insert("attributes".into(), Json::Object(attributes));
        }
        if !relationships.is_empty() {
            data.insert("relationships".into(), Json::Object(relationships));
        }
        json!({ "data": data })
    }

    /// Flattened external form: `{_type, id, <field>: value, ...}`.
    pub fn record_to_json(&self, record: &Record, arena: &IdArena, include_reverse: bool) -> Json {
        let r = arena.get(record.id());
        let mut out = Map::new();
        out.insert("_type".into(), Json::String(self.ty.clone()));
        out.insert("id".into(), r.id.to_json());
        for (name, kind) in self.fields(include_reverse) {
            out.insert(name.to_string(), kind.from_internal(record.value(name), arena));
        }
        Json::Object(out)
    }

    /// JSON:API resource form with server identifiers where known.
    pub fn record_to_json_api(&self, record: &Record, arena: &IdArena) -> Json {
        let wire = arena.wire_ref(record.id());
        let mut attributes = Map::new();
        let mut relationships = Map::new();
        for (name, kind) in self.fields(false) {
            let value = record.value(name);
            match value {
                Value::Ref(id) => {
                    relationships.insert(
                        name.to_string(),
                        json!({ "data": arena.wire_ref(*id).to_json() }),
                    );
                }
                Value::Refs(set) => {
                    let data: Vec<Json> = set.iter().map(|id| arena.wire_ref(id).to_json()).collect();
                    relationships.insert(name.to_string(), json!({ "data": data }));
                }
                _ if kind.is_relationship() => {
                    let empty = if kind == FieldKind::ManyToMany {
                        json!([])
                    } else {
                        Json::Null
                    };
                    relationships.insert(name.to_string(), json!({ "data": empty }));
                }
                _ => {
                    attributes.insert(name.to_string(), kind.from_internal(value, arena));
                }
            }
        }
        json!({
            "type": wire.ty,
            "id": wire.id.to_json(),
            "attributes": attributes,
            "relationships": relationships,
        })
    }

    pub(crate) fn op(&self, name: &str) -> Option<&OpHandler> {
        self.ops.get(name)
    }
}
