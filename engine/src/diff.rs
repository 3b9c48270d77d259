//! Object diffs.
//!
//! A [`Diff`] records the change to one object: its creation, its removal,
//! or an update to some of its fields. Diffs are reversible; applying one
//! backwards undoes it.
//!
//! The external form mirrors the wire convention used by persisted state:
//!
//! ```json
//! {"_type": [null, "movie"], "id": [null, 1], "title": [null, "Rocky"],
//!  "actors": [[], [{"type": "person", "id": 2}]]}
//! ```
//!
//! A `null` "from" type marks a creation, a `null` "to" type a removal.
//! Many-to-many fields carry `[removed, added]` instead of `[from, to]`.

use crate::error::{Error, Result};
use crate::field::{parse_refs, FieldDiff, FieldKind};
use crate::id::{Id, IdArena, Key, ObjectRef};
use crate::model::Model;
use crate::value::RefSet;
use crate::{FieldName, TypeName};
use serde::{Deserialize, Serialize};
use serde_json::{json, Map, Value as Json};
use std::collections::BTreeMap;
use std::fmt;

/// What a diff does to its object.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, Serialize, Deserialize)]
#[serde(rename_all = "lowercase")]
pub enum DiffOp {
    Create,
    Update,
    Remove,
}

impl DiffOp {
    /// The effective operation when applied in the given direction.
    pub fn directed(self, reverse: bool) -> DiffOp {
        match (self, reverse) {
            (DiffOp::Create, true) => DiffOp::Remove,
            (DiffOp::Remove, true) => DiffOp::Create,
            (op, _) => op,
        }
    }

    /// Name of the remote operation handling this kind of diff.
    pub fn as_str(self) -> &'static str {
        match self {
            DiffOp::Create => "create",
            DiffOp::Update => "update",
            DiffOp::Remove => "remove",
        }
    }
}

impl fmt::Display for DiffOp {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.write_str(self.as_str())
    }
}

/// Change to a single object.
#[derive(Debug, Clone, PartialEq)]
pub struct Diff {
    ty: TypeName,
    id: Id,
    op: DiffOp,
    fields: BTreeMap<FieldName, FieldDiff>,
}

impl Diff {
    pub fn new(ty: impl Into<TypeName>, id: Id, op: DiffOp) -> Self {
        Self {
            ty: ty.into(),
            id,
            op,
            fields: BTreeMap::new(),
        }
    }

    pub fn ty(&self) -> &str {
        &self.ty
    }

    pub fn id(&self) -> Id {
        self.id
    }

    pub fn op(&self) -> DiffOp {
        self.op
    }

    pub fn field(&self, name: &str) -> Option<&FieldDiff> {
        self.fields.get(name)
    }

    pub fn fields(&self) -> impl Iterator<Item = (&str, &FieldDiff)> {
        self.fields.iter().map(|(k, v)| (k.as_str(), v))
    }

    /// No field entries.
    pub fn is_empty(&self) -> bool {
        self.fields.is_empty()
    }

    pub fn insert(&mut self, field: impl Into<FieldName>, diff: FieldDiff) {
        self.fields.insert(field.into(), diff);
    }

    pub fn remove(&mut self, field: &str) -> Option<FieldDiff> {
        self.fields.remove(field)
    }

    /// Builder-style [`Diff::insert`].
    pub fn with(mut self, field: impl Into<FieldName>, diff: FieldDiff) -> Self {
        self.insert(field, diff);
        self
    }

    /// Every handle this diff points at in its "to" state, per field.
    pub fn targets(&self) -> impl Iterator<Item = (&str, Id)> + '_ {
        self.fields.iter().flat_map(|(name, field_diff)| {
            let ids: Vec<Id> = match field_diff {
                FieldDiff::Change { to, .. } => to.related(),
                FieldDiff::Set { added, .. } => added.iter().collect(),
            };
            ids.into_iter().map(move |id| (name.as_str(), id))
        })
    }

    /// Whether the subject or any field value mentions `id`.
    pub fn mentions(&self, id: Id) -> bool {
        self.id == id
            || self.fields.values().any(|fd| match fd {
                FieldDiff::Change { from, to } => {
                    from.related().contains(&id) || to.related().contains(&id)
                }
                FieldDiff::Set { removed, added } => removed.contains(id) || added.contains(id),
            })
    }

    /// A copy with every handle passed through `f`.
    pub fn map_ids(&self, mut f: impl FnMut(Id) -> Id) -> Diff {
        Diff {
            ty: self.ty.clone(),
            id: f(self.id),
            op: self.op,
            fields: self
                .fields
                .iter()
                .map(|(name, fd)| (name.clone(), fd.map_ids(&mut f)))
                .collect(),
        }
    }

    /// Rebind every handle from `from`'s arena into `to`.
    pub fn translate(&self, from: &IdArena, to: &mut IdArena) -> Diff {
        self.map_ids(|id| to.intern(from.get(id)))
    }

    /// External form.
    pub fn to_json(&self, arena: &IdArena) -> Json {
        let key = arena.get(self.id).id.to_json();
        let (types, ids) = match self.op {
            DiffOp::Create => (json!([null, self.ty]), json!([null, key])),
            DiffOp::Remove => (json!([self.ty, null]), json!([key, null])),
            DiffOp::Update => (json!([self.ty, self.ty]), json!([key.clone(), key])),
        };
        let mut out = Map::new();
        out.insert("_type".into(), types);
        out.insert("id".into(), ids);
        let render = FieldKind::Attribute(crate::field::AttributeType::Any);
        for (name, fd) in &self.fields {
            let value = match fd {
                FieldDiff::Change { from, to } => {
                    json!([render.from_internal(from, arena), render.from_internal(to, arena)])
                }
                FieldDiff::Set { removed, added } => json!([
                    removed.iter().map(|id| arena.get(id).to_json()).collect::<Vec<_>>(),
                    added.iter().map(|id| arena.get(id).to_json()).collect::<Vec<_>>(),
                ]),
            };
            out.insert(name.clone(), value);
        }
        Json::Object(out)
    }

    /// Parse the external form against `model`.
    pub fn from_json(json: &Json, model: &Model, arena: &mut IdArena) -> Result<Diff> {
        let obj = json
            .as_object()
            .ok_or_else(|| Error::InvalidPayload("diff must be an object".into()))?;
        let pair = |name: &str| -> Result<(Json, Json)> {
            match obj.get(name).and_then(Json::as_array).map(Vec::as_slice) {
                Some([a, b]) => Ok((a.clone(), b.clone())),
                _ => Err(Error::InvalidPayload(format!(
                    "diff field '{}' must be a pair",
                    name
                ))),
            }
        };

        let (from_ty, to_ty) = pair("_type")?;
        let op = match (from_ty.is_null(), to_ty.is_null()) {
            (true, false) => DiffOp::Create,
            (false, true) => DiffOp::Remove,
            (false, false) => DiffOp::Update,
            (true, true) => {
                return Err(Error::InvalidPayload("diff has no type".into()));
            }
        };
        let (from_id, to_id) = pair("id")?;
        let key = match op {
            DiffOp::Remove => Key::from_json(&from_id),
            _ => Key::from_json(&to_id),
        }
        .ok_or_else(|| Error::InvalidPayload("diff has no identifier".into()))?;
        let id = arena.intern(&ObjectRef::new(model.ty(), key));

        let mut diff = Diff::new(model.ty(), id, op);
        for name in obj.keys().filter(|k| *k != "_type" && *k != "id") {
            let kind = model.field_kind_or_err(name)?;
            let (a, b) = pair(name)?;
            let field_diff = match kind {
                FieldKind::ManyToMany => FieldDiff::Set {
                    removed: intern_set(name, &a, arena)?,
                    added: intern_set(name, &b, arena)?,
                },
                _ => FieldDiff::Change {
                    from: kind.to_internal(name, &a, arena)?,
                    to: kind.to_internal(name, &b, arena)?,
                },
            };
            diff.insert(name.clone(), field_diff);
        }
        Ok(diff)
    }
}

fn intern_set(field: &str, json: &Json, arena: &mut IdArena) -> Result<RefSet> {
    Ok(parse_refs(field, json)?
        .iter()
        .map(|r| arena.intern(r))
        .collect())
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::model::{Attribute, Relationship};
    use crate::field::AttributeType;
    use crate::value::Value;

    fn model() -> Model {
        Model::new("movie")
            .with_attribute("title", Attribute::new(AttributeType::Text))
            .with_relationship("actors", Relationship::many_to_many("person"))
            .with_relationship("director", Relationship::foreign_key("person"))
    }

    #[test]
    fn directed_ops() {
        assert_eq!(DiffOp::Create.directed(true), DiffOp::Remove);
        assert_eq!(DiffOp::Remove.directed(true), DiffOp::Create);
        assert_eq!(DiffOp::Update.directed(true), DiffOp::Update);
        assert_eq!(DiffOp::Create.directed(false), DiffOp::Create);
    }

    #[test]
    fn external_form() {
        let model = model();
        let mut arena = IdArena::new();
        let id = arena.intern(&ObjectRef::new("movie", 1));
        let p2 = arena.intern(&ObjectRef::new("person", 2));
        let diff = Diff::new("movie", id, DiffOp::Create)
            .with(
                "title",
                FieldDiff::Change {
                    from: Value::Null,
                    to: Value::from("Rocky"),
                },
            )
            .with(
                "actors",
                FieldDiff::Set {
                    removed: RefSet::new(),
                    added: std::iter::once(p2).collect(),
                },
            );

        let json = diff.to_json(&arena);
        assert_eq!(json["_type"], json!([null, "movie"]));
        assert_eq!(json["id"], json!([null, 1]));
        assert_eq!(json["title"], json!([null, "Rocky"]));
        assert_eq!(json["actors"], json!([[], [{"type": "person", "id": 2}]]));

        let parsed = Diff::from_json(&json, &model, &mut arena).unwrap();
        assert_eq!(parsed, diff);
    }

    #[test]
    fn from_json_rejects_garbage() {
        let model = model();
        let mut arena = IdArena::new();
        assert!(Diff::from_json(&json!([]), &model, &mut arena).is_err());
        assert!(Diff::from_json(&json!({"_type": [null, null], "id": [1, 1]}), &model, &mut arena).is_err());
        assert!(matches!(
            Diff::from_json(
                &json!({"_type": ["movie", "movie"], "id": [1, 1], "bogus": [1, 2]}),
                &model,
                &mut arena
            ),
            Err(Error::UnknownField { .. })
        ));
    }

    #[test]
    fn targets_and_mentions() {
        let mut arena = IdArena::new();
        let id = arena.intern(&ObjectRef::new("movie", 1));
        let p1 = arena.intern(&ObjectRef::new("person", 1));
        let p2 = arena.intern(&ObjectRef::new("person", 2));
        let diff = Diff::new("movie", id, DiffOp::Update)
            .with(
                "director",
                FieldDiff::Change {
                    from: Value::Ref(p1),
                    to: Value::Ref(p2),
                },
            );
        assert_eq!(diff.targets().collect::<Vec<_>>(), vec![("director", p2)]);
        assert!(diff.mentions(p1));
        assert!(diff.mentions(id));

        let mut other = IdArena::new();
        let moved = diff.translate(&arena, &mut other);
        assert_eq!(other.get(moved.id()), &ObjectRef::new("movie", 1));
    }
}
