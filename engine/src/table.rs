//! Per-type record tables.
//!
//! A [`Table`] keeps the records of one model in an ordered slot list plus
//! secondary indices mapping index keys to slot positions. Removing a record
//! leaves a tombstone so positions held by indices stay valid; only the tail
//! slot is truncated.
//!
//! Every mutation unindexes the old record before it is replaced and indexes
//! the new one afterwards, so indices always agree with the slots.

use crate::config::ConflictPolicy;
use crate::diff::Diff;
use crate::error::{Error, Result};
use crate::field::FieldKind;
use crate::id::Id;
use crate::model::Model;
use crate::record::Record;
use crate::value::{IndexKey, Value};
use crate::FieldName;
use std::collections::{BTreeMap, BTreeSet, HashMap};
use std::sync::Arc;
use tracing::debug;

/// Comparison applied to one field by [`Table::select`].
#[derive(Debug, Clone, PartialEq)]
pub enum Lookup {
    /// Field equals the value under field semantics
    Eq(Value),
    /// Field is null or an empty set (`true`), or holds something (`false`)
    IsNull(bool),
    /// Text contains a substring, or a relationship holds a target
    Contains(Value),
    /// Field equals any of the values
    In(Vec<Value>),
}

type Index = HashMap<IndexKey, BTreeSet<usize>>;

/// Records of one model.
#[derive(Debug, Clone)]
pub struct Table {
    model: Arc<Model>,
    records: Vec<Option<Record>>,
    ids: HashMap<Id, usize>,
    indices: BTreeMap<FieldName, Index>,
}

impl Table {
    pub fn new(model: Arc<Model>) -> Self {
        let indices = model
            .indexed_fields()
            .into_iter()
            .map(|field| (field, Index::new()))
            .collect();
        Self {
            model,
            records: Vec::new(),
            ids: HashMap::new(),
            indices,
        }
    }

    pub fn ty(&self) -> &str {
        self.model.ty()
    }

    pub fn model(&self) -> &Arc<Model> {
        &self.model
    }

    /// Number of live records.
    pub fn len(&self) -> usize {
        self.ids.len()
    }

    pub fn is_empty(&self) -> bool {
        self.ids.is_empty()
    }

    pub fn get(&self, id: Id) -> Option<&Record> {
        self.ids
            .get(&id)
            .and_then(|pos| self.records[*pos].as_ref())
    }

    pub fn contains(&self, id: Id) -> bool {
        self.ids.contains_key(&id)
    }

    /// Slot position of a record.
    pub fn position(&self, id: Id) -> Result<usize> {
        self.ids
            .get(&id)
            .copied()
            .ok_or_else(|| Error::RecordNotFound(format!("{}|{}", self.ty(), id)))
    }

    /// Live records in slot order.
    pub fn iter(&self) -> impl Iterator<Item = &Record> {
        self.records.iter().flatten()
    }

    /// Positions of every live record.
    pub fn positions(&self) -> BTreeSet<usize> {
        self.ids.values().copied().collect()
    }

    /// Records at the given positions, in slot order.
    pub fn records_at(&self, positions: &BTreeSet<usize>) -> Vec<&Record> {
        positions
            .iter()
            .filter_map(|pos| self.records.get(*pos).and_then(Option::as_ref))
            .collect()
    }

    /// Insert a new record or replace the existing one with the same id.
    pub fn set(&mut self, record: Record) -> Result<()> {
        if record.ty() != self.ty() {
            return Err(Error::InvalidPayload(format!(
                "cannot store a {} record in the {} table",
                record.ty(),
                self.ty()
            )));
        }
        match self.ids.get(&record.id()).copied() {
            Some(pos) => {
                self.unindex(pos);
                self.records[pos] = Some(record);
                self.index(pos);
            }
            None => {
                let pos = self.records.len();
                self.ids.insert(record.id(), pos);
                self.records.push(Some(record));
                self.index(pos);
            }
        }
        Ok(())
    }

    /// Remove a record, returning it.
    pub fn remove(&mut self, id: Id) -> Result<Record> {
        let pos = self.position(id)?;
        self.unindex(pos);
        self.ids.remove(&id);
        let record = self.records[pos]
            .take()
            .ok_or_else(|| Error::RecordNotFound(format!("{}|{}", self.ty(), id)))?;
        while matches!(self.records.last(), Some(None)) {
            self.records.pop();
        }
        Ok(record)
    }

    /// Apply a diff to the record it names.
    pub fn apply_diff(&mut self, diff: &Diff, reverse: bool, policy: ConflictPolicy) -> Result<()> {
        if diff.ty() != self.ty() {
            return Err(Error::InvalidPayload(format!(
                "cannot apply a {} diff to the {} table",
                diff.ty(),
                self.ty()
            )));
        }
        let result = self
            .model
            .apply_diff(self.get(diff.id()), diff, reverse, policy)?;
        match result {
            Some(record) => self.set(record),
            None => self.remove(diff.id()).map(|_| ()),
        }
    }

    /// Point a relationship field of `id` at `related`.
    ///
    /// Many-to-many fields gain a member; foreign keys are replaced.
    pub fn add_relationship(&mut self, id: Id, field: &str, related: Id) -> Result<()> {
        let record = self.related_record(id, field)?;
        let value = match record.value(field) {
            Value::Refs(set) => {
                let mut set = set.clone();
                if !set.insert(related) {
                    return Ok(());
                }
                Value::Refs(set)
            }
            _ if self.model.field_kind(field) == Some(FieldKind::ManyToMany) => {
                Value::Refs(std::iter::once(related).collect())
            }
            _ => Value::Ref(related),
        };
        self.set(record.with(field, value))
    }

    /// Drop `related` from a relationship field of `id`.
    ///
    /// A foreign key is cleared only if it currently points at `related`.
    pub fn remove_relationship(&mut self, id: Id, field: &str, related: Id) -> Result<()> {
        let record = self.related_record(id, field)?;
        let value = match record.value(field) {
            Value::Refs(set) => {
                let mut set = set.clone();
                if !set.remove(related) {
                    return Ok(());
                }
                Value::Refs(set)
            }
            Value::Ref(current) if *current == related => Value::Null,
            _ => return Ok(()),
        };
        self.set(record.with(field, value))
    }

    fn related_record(&self, id: Id, field: &str) -> Result<Record> {
        let kind = self.model.field_kind_or_err(field)?;
        if !kind.is_relationship() {
            return Err(Error::InvalidValue {
                field: field.to_string(),
                reason: "not a relationship".into(),
            });
        }
        let pos = self.position(id)?;
        self.records[pos]
            .clone()
            .ok_or_else(|| Error::RecordNotFound(format!("{}|{}", self.ty(), id)))
    }

    /// Call `f(related, inverse_field)` for every object `id` points at,
    /// through forward and reverse relationships alike.
    pub fn for_each_related_object(
        &self,
        id: Id,
        mut f: impl FnMut(Id, Option<&str>),
    ) -> Result<()> {
        let pos = self.position(id)?;
        let Some(record) = self.records[pos].as_ref() else {
            return Ok(());
        };
        for (field, rel) in self.model.relationships() {
            for related in record.value(field).related() {
                f(related, rel.related_name.as_deref());
            }
        }
        Ok(())
    }

    /// Move a record to a new handle, keeping its slot.
    pub fn re_id(&mut self, old: Id, new: Id) -> Result<()> {
        if old == new {
            return Ok(());
        }
        if self.contains(new) {
            return Err(Error::RecordAlreadyExists(format!("{}|{}", self.ty(), new)));
        }
        let pos = self.position(old)?;
        self.unindex(pos);
        self.records[pos] = self.records[pos].take().map(|r| r.with_id(new));
        self.ids.remove(&old);
        self.ids.insert(new, pos);
        self.index(pos);
        Ok(())
    }

    /// Rewrite every relationship value through `f`, reindexing as needed.
    pub(crate) fn map_related(&mut self, f: impl Fn(Id) -> Id) {
        for pos in 0..self.records.len() {
            let Some(record) = self.records[pos].as_ref() else {
                continue;
            };
            let id = record.id();
            let mapped = record.map_ids(|x| if x == id { x } else { f(x) });
            if &mapped != record {
                self.unindex(pos);
                self.records[pos] = Some(mapped);
                self.index(pos);
            }
        }
    }

    /// Positions of records whose `field` satisfies `lookup`.
    pub fn select(&self, field: &str, lookup: &Lookup) -> Result<BTreeSet<usize>> {
        let kind = self.model.field_kind_or_err(field)?;
        match lookup {
            Lookup::Eq(value) => Ok(self.select_eq(field, kind, value)),
            Lookup::IsNull(want) => Ok(self.scan(|r| r.value(field).is_empty() == *want)),
            Lookup::Contains(needle) => match (kind, needle) {
                (FieldKind::ManyToMany, Value::Ref(target)) => {
                    Ok(self.select_indexed(field, IndexKey::Ref(*target), |r| {
                        r.value(field)
                            .as_refs()
                            .is_some_and(|set| set.contains(*target))
                    }))
                }
                (FieldKind::ForeignKey, Value::Ref(_)) => Ok(self.select_eq(field, kind, needle)),
                (FieldKind::Attribute(_), Value::Text(s)) => Ok(self.scan(|r| {
                    r.value(field).as_text().is_some_and(|text| text.contains(s.as_str()))
                })),
                _ => Err(Error::UnsupportedFilter(format!(
                    "{}.{} cannot contain {:?}",
                    self.ty(),
                    field,
                    needle
                ))),
            },
            Lookup::In(values) => Ok(values
                .iter()
                .flat_map(|value| self.select_eq(field, kind, value))
                .collect()),
        }
    }

    fn select_eq(&self, field: &str, kind: FieldKind, value: &Value) -> BTreeSet<usize> {
        let keys = kind.to_indexable(value);
        match (kind, keys.as_slice()) {
            (FieldKind::ManyToMany, _) | (_, []) => {
                self.scan(|r| kind.equals(r.value(field), value))
            }
            (_, [key]) => self.select_indexed(field, key.clone(), |r| {
                kind.equals(r.value(field), value)
            }),
            _ => self.scan(|r| kind.equals(r.value(field), value)),
        }
    }

    fn select_indexed(
        &self,
        field: &str,
        key: IndexKey,
        fallback: impl Fn(&Record) -> bool,
    ) -> BTreeSet<usize> {
        match self.indices.get(field) {
            Some(index) => index.get(&key).cloned().unwrap_or_default(),
            None => {
                debug!(table = %self.ty(), field, "no index for lookup, scanning");
                self.scan(fallback)
            }
        }
    }

    fn scan(&self, pred: impl Fn(&Record) -> bool) -> BTreeSet<usize> {
        self.records
            .iter()
            .enumerate()
            .filter_map(|(pos, r)| r.as_ref().filter(|r| pred(r)).map(|_| pos))
            .collect()
    }

    /// Records matching every `(field, value)` pair, in slot order.
    pub fn filter_fields(&self, query: &[(&str, Value)]) -> Result<Vec<&Record>> {
        let mut result: Option<BTreeSet<usize>> = None;
        for (field, value) in query {
            let hits = self.select(field, &Lookup::Eq(value.clone()))?;
            result = Some(match result {
                Some(acc) => acc.intersection(&hits).copied().collect(),
                None => hits,
            });
            if result.as_ref().is_some_and(BTreeSet::is_empty) {
                break;
            }
        }
        let positions = result.unwrap_or_else(|| self.positions());
        Ok(self.records_at(&positions))
    }

    fn index(&mut self, pos: usize) {
        let Some(record) = self.records[pos].as_ref() else {
            return;
        };
        for (field, index) in self.indices.iter_mut() {
            let Some(kind) = self.model.field_kind(field) else {
                continue;
            };
            for key in kind.to_indexable(record.value(field)) {
                index.entry(key).or_default().insert(pos);
            }
        }
    }

    fn unindex(&mut self, pos: usize) {
        let Some(record) = self.records[pos].as_ref() else {
            return;
        };
        for (field, index) in self.indices.iter_mut() {
            let Some(kind) = self.model.field_kind(field) else {
                continue;
            };
            for key in kind.to_indexable(record.value(field)) {
                if let Some(slots) = index.get_mut(&key) {
                    slots.remove(&pos);
                    if slots.is_empty() {
                        index.remove(&key);
                    }
                }
            }
        }
    }

    /// Whether every index agrees with a full rebuild.
    #[cfg(test)]
    pub(crate) fn indices_consistent(&self) -> bool {
        let mut rebuilt = Table::new(self.model.clone());
        rebuilt.records = self.records.clone();
        for pos in 0..rebuilt.records.len() {
            rebuilt.index(pos);
        }
        let ids_ok = self.ids.iter().all(|(id, pos)| {
            self.records
                .get(*pos)
                .and_then(Option::as_ref)
                .is_some_and(|r| r.id() == *id)
        }) && self.ids.len() == self.records.iter().flatten().count();
        ids_ok && rebuilt.indices == self.indices
    }
}
