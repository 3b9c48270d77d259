//! Filter expressions.
//!
//! A [`Filter`] is a small predicate tree evaluated one of two ways:
//! lowered to a flat wire query with [`Filter::to_query`], or run directly
//! against a store's tables by [`crate::Store::filter`]. The store evaluator
//! pushes negation down to the leaves (De Morgan) so `and`/`or` always
//! combine index hits by intersection or union.
//!
//! Field names may carry a lookup suffix (`title__contains`,
//! `director__isnull`, `year__in`) or traverse a relationship
//! (`actors__name` matches movies with any actor whose name matches).

use crate::error::{Error, Result};
use crate::field::{parse_ref, parse_refs, FieldKind};
use crate::id::{IdArena, Key, ObjectRef};
use crate::model::Model;
use crate::table::{Lookup, Table};
use crate::value::{RefSet, Value};
use crate::{FieldName, TypeName};
use serde_json::{Map, Value as Json};
use std::collections::{BTreeMap, BTreeSet};

/// Predicate tree.
#[derive(Debug, Clone, PartialEq)]
pub enum Filter {
    Eq(FieldName, Json),
    In(FieldName, Json),
    And(Box<Filter>, Box<Filter>),
    Or(Box<Filter>, Box<Filter>),
    Not(Box<Filter>),
}

impl Filter {
    /// Field equals value. A `null` value means "is null".
    pub fn eq(field: impl Into<FieldName>, value: impl Into<Json>) -> Self {
        Filter::Eq(field.into(), value.into())
    }

    /// Membership for relationships, substring for text, "one of" for arrays.
    pub fn is_in(field: impl Into<FieldName>, value: impl Into<Json>) -> Self {
        Filter::In(field.into(), value.into())
    }

    pub fn and(self, right: Filter) -> Self {
        Filter::And(Box::new(self), Box::new(right))
    }

    pub fn or(self, right: Filter) -> Self {
        Filter::Or(Box::new(self), Box::new(right))
    }

    /// Lower to a flat wire query.
    ///
    /// Only conjunctions of equalities and inclusions, plus negated null
    /// checks, have a flat form; anything else is [`Error::UnsupportedFilter`].
    pub fn to_query(&self) -> Result<Map<String, Json>> {
        let mut query = Map::new();
        lower(self, false, &mut query)?;
        Ok(query)
    }
}

impl std::ops::Not for Filter {
    type Output = Filter;

    fn not(self) -> Filter {
        Filter::Not(Box::new(self))
    }
}

fn lower(filter: &Filter, negate: bool, query: &mut Map<String, Json>) -> Result<()> {
    match filter {
        Filter::Eq(field, Json::Null) => {
            query.insert(format!("{}__isnull", field), Json::Bool(!negate));
        }
        Filter::Eq(field, value) if !negate => {
            query.insert(field.clone(), value.clone());
        }
        Filter::In(field, value) if !negate => {
            query.insert(format!("{}__in", field), value.clone());
        }
        Filter::And(left, right) if !negate => {
            lower(left, false, query)?;
            lower(right, false, query)?;
        }
        Filter::Not(inner) => lower(inner, !negate, query)?,
        other => {
            let prefix = if negate { "negated " } else { "" };
            return Err(Error::UnsupportedFilter(format!(
                "{}{:?} has no wire query form",
                prefix, other
            )));
        }
    }
    Ok(())
}

#[derive(Clone, Copy)]
enum Leaf {
    Eq,
    In,
}

/// Evaluates filters against the tables of one store branch.
pub(crate) struct TableVisitor<'a> {
    arena: &'a IdArena,
    tables: &'a BTreeMap<TypeName, Table>,
}

impl<'a> TableVisitor<'a> {
    pub(crate) fn new(arena: &'a IdArena, tables: &'a BTreeMap<TypeName, Table>) -> Self {
        Self { arena, tables }
    }

    /// Positions in `table` matching `filter`.
    pub(crate) fn execute(&self, table: &Table, filter: &Filter) -> Result<BTreeSet<usize>> {
        self.visit(table, filter, false)
    }

    fn visit(&self, table: &Table, filter: &Filter, negate: bool) -> Result<BTreeSet<usize>> {
        match filter {
            Filter::Eq(field, value) => self.leaf_negated(table, Leaf::Eq, field, value, negate),
            Filter::In(field, value) => self.leaf_negated(table, Leaf::In, field, value, negate),
            Filter::And(left, right) | Filter::Or(left, right) => {
                let left = self.visit(table, left, negate)?;
                let right = self.visit(table, right, negate)?;
                let intersect = matches!(filter, Filter::And(..)) != negate;
                Ok(if intersect {
                    left.intersection(&right).copied().collect()
                } else {
                    left.union(&right).copied().collect()
                })
            }
            Filter::Not(inner) => self.visit(table, inner, !negate),
        }
    }

    fn leaf_negated(
        &self,
        table: &Table,
        leaf: Leaf,
        field: &str,
        value: &Json,
        negate: bool,
    ) -> Result<BTreeSet<usize>> {
        let hits = self.leaf(table, leaf, field, value)?;
        if !negate {
            return Ok(hits);
        }
        Ok(table.positions().difference(&hits).copied().collect())
    }

    fn leaf(&self, table: &Table, leaf: Leaf, field: &str, value: &Json) -> Result<BTreeSet<usize>> {
        let model = table.model();
        if let Some((head, tail)) = field.split_once("__") {
            match tail {
                "isnull" => {
                    model.field_kind_or_err(head)?;
                    let want = value.as_bool().unwrap_or(!value.is_null());
                    return table.select(head, &Lookup::IsNull(want));
                }
                "contains" => return self.leaf(table, Leaf::In, head, value),
                "in" => return self.leaf(table, Leaf::In, head, &as_array(value)),
                "exact" => return self.leaf(table, Leaf::Eq, head, value),
                _ => return self.traverse(table, leaf, head, tail, value),
            }
        }

        if field == "id" {
            return Ok(self.select_ids(table, value));
        }

        let kind = model.field_kind_or_err(field)?;
        match (leaf, value) {
            (Leaf::Eq, Json::Null) => table.select(field, &Lookup::IsNull(true)),
            (Leaf::Eq, _) => match self.to_value(model, field, kind, value)? {
                Some(v) => table.select(field, &Lookup::Eq(v)),
                None => Ok(BTreeSet::new()),
            },
            (Leaf::In, Json::Array(items)) => {
                let mut out = BTreeSet::new();
                for item in items {
                    let lookup = if kind == FieldKind::ManyToMany {
                        Leaf::In
                    } else {
                        Leaf::Eq
                    };
                    out.extend(self.leaf(table, lookup, field, item)?);
                }
                Ok(out)
            }
            (Leaf::In, _) => match kind {
                FieldKind::ManyToMany | FieldKind::ForeignKey => {
                    match self.to_value(model, field, FieldKind::ForeignKey, value)? {
                        Some(v @ Value::Ref(_)) => table.select(field, &Lookup::Contains(v)),
                        _ => Ok(BTreeSet::new()),
                    }
                }
                FieldKind::Attribute(_) => match value {
                    Json::String(s) => table.select(field, &Lookup::Contains(Value::Text(s.clone()))),
                    _ => self.leaf(table, Leaf::Eq, field, value),
                },
            },
        }
    }

    /// `relation__rest`: evaluate `rest` on the related table, then keep
    /// records pointing at any hit.
    fn traverse(
        &self,
        table: &Table,
        leaf: Leaf,
        relation: &str,
        rest: &str,
        value: &Json,
    ) -> Result<BTreeSet<usize>> {
        let model = table.model();
        let rel = model.relationship(relation).ok_or_else(|| Error::UnknownField {
            ty: model.ty().to_string(),
            field: relation.to_string(),
        })?;
        let Some(related) = self.tables.get(&rel.target) else {
            return Ok(BTreeSet::new());
        };
        let hits = self.leaf(related, leaf, rest, value)?;
        let mut out = BTreeSet::new();
        for record in related.records_at(&hits) {
            out.extend(table.select(relation, &Lookup::Contains(Value::Ref(record.id())))?);
        }
        Ok(out)
    }

    fn select_ids(&self, table: &Table, value: &Json) -> BTreeSet<usize> {
        let keys: Vec<&Json> = match value {
            Json::Array(items) => items.iter().collect(),
            other => vec![other],
        };
        keys.into_iter()
            .filter_map(|k| {
                let key = ObjectRef::from_json(k)
                    .map(|r| r.id)
                    .or_else(|| Key::from_json(k))?;
                let id = self.arena.lookup(&ObjectRef::new(table.ty(), key))?;
                table.position(id).ok()
            })
            .collect()
    }

    /// Convert a query value without interning. `None` means it names an
    /// object this store has never seen, so nothing can match.
    pub(crate) fn to_value(
        &self,
        model: &Model,
        field: &str,
        kind: FieldKind,
        value: &Json,
    ) -> Result<Option<Value>> {
        let value = model.normalize_refs(field, value);
        match kind {
            FieldKind::Attribute(ty) => Ok(Some(ty.to_internal(field, &value)?)),
            FieldKind::ForeignKey => match parse_ref(field, &value)? {
                Some(r) => Ok(self.arena.lookup(&r).map(Value::Ref)),
                None => Ok(Some(Value::Null)),
            },
            FieldKind::ManyToMany => {
                let mut set = RefSet::new();
                for r in parse_refs(field, &value)? {
                    match self.arena.lookup(&r) {
                        Some(id) => {
                            set.insert(id);
                        }
                        None => return Ok(None),
                    }
                }
                Ok(Some(Value::Refs(set)))
            }
        }
    }
}

fn as_array(value: &Json) -> Json {
    match value {
        Json::Array(_) => value.clone(),
        other => Json::Array(vec![other.clone()]),
    }
}
