//! Store - the versioned object database.
//!
//! A [`Store`] keeps two branches of per-type tables. The *tail* is the last
//! state believed to match the remote authority; the *head* is the working
//! view with every local edit applied. Edits are recorded as [`Diff`]s in a
//! single log split by the tail pointer:
//!
//! - `diffs[..tail_pointer]` are outgoing: committed and waiting for the
//!   server to acknowledge them. They are already reflected in the tail.
//! - `diffs[tail_pointer..]` are local: uncommitted edits, reflected only in
//!   the head.
//!
//! The store always satisfies `head == replay(tail, local diffs)`.

use crate::config::{ConflictPolicy, StoreConfig};
use crate::diff::{Diff, DiffOp};
use crate::error::{Error, Result};
use crate::field::{FieldDiff, FieldKind};
use crate::filter::{Filter, TableVisitor};
use crate::id::{Id, IdArena, Key, ObjectRef};
use crate::instance::Instance;
use crate::jsonapi::{self, Resource};
use crate::model::Model;
use crate::ops::{OpCall, OpFuture, OpHandler};
use crate::record::Record;
use crate::schema::Schema;
use crate::snapshot::StoreSnapshot;
use crate::table::{Lookup, Table};
use crate::value::{RefSet, Value};
use crate::TypeName;
use futures::FutureExt;
use serde_json::{json, Map, Value as Json};
use std::collections::{BTreeMap, BTreeSet};
use std::sync::Arc;
use tracing::{debug, warn};

type Tables = BTreeMap<TypeName, Table>;

/// One of the two table sets of a store.
#[derive(Debug, Clone, Copy, Default, PartialEq, Eq, Hash)]
pub enum Branch {
    /// Working view with every local edit applied
    #[default]
    Head,
    /// Last state believed to match the server, plus outgoing diffs
    Tail,
}

/// Server data loaded into a transaction, replayed on the parent at commit.
#[derive(Debug, Clone)]
enum Load {
    JsonApi(Json),
    Objects(Json),
}

/// Entry of the commit dependency table.
#[derive(Debug)]
struct Pending {
    diff: Diff,
    required: BTreeSet<Id>,
    optional: BTreeSet<Id>,
}

/// The versioned object store.
#[derive(Debug, Clone)]
pub struct Store {
    schema: Arc<Schema>,
    config: StoreConfig,
    arena: IdArena,
    head: Tables,
    tail: Tables,
    diffs: Vec<Diff>,
    tail_pointer: usize,
    transactions: BTreeMap<String, Store>,
    loads: Vec<Load>,
    /// Set on transaction stores
    name: Option<String>,
}

impl Store {
    /// Create an empty store over `schema`.
    pub fn new(schema: Arc<Schema>) -> Self {
        Self::with_config(schema, StoreConfig::default())
    }

    pub fn with_config(schema: Arc<Schema>, config: StoreConfig) -> Self {
        let tables: Tables = schema
            .models()
            .map(|model| (model.ty().to_string(), Table::new(model.clone())))
            .collect();
        Self {
            schema,
            config,
            arena: IdArena::new(),
            head: tables.clone(),
            tail: tables,
            diffs: Vec::new(),
            tail_pointer: 0,
            transactions: BTreeMap::new(),
            loads: Vec::new(),
            name: None,
        }
    }

    pub fn schema(&self) -> &Arc<Schema> {
        &self.schema
    }

    pub fn config(&self) -> &StoreConfig {
        &self.config
    }

    /// Identifier arena shared by every record and diff of this store.
    pub fn arena(&self) -> &IdArena {
        &self.arena
    }

    /// Transaction name, for stores opened with [`Store::start_transaction`].
    pub fn name(&self) -> Option<&str> {
        self.name.as_deref()
    }

    // ------------------------------------------------------------------
    // Identifiers
    // ------------------------------------------------------------------

    /// Canonical handle for `(ty, key)`, if this store has seen it.
    ///
    /// Server keys recorded by [`Store::post_commit_diff`] resolve to the
    /// local handle.
    pub fn id(&self, ty: &str, key: impl Into<Key>) -> Option<Id> {
        self.arena.lookup(&ObjectRef::new(ty, key))
    }

    /// External reference of a handle.
    pub fn object_ref(&self, id: Id) -> &ObjectRef {
        self.arena.get(self.arena.resolve(id))
    }

    /// Local key the server key `key` is mapped to.
    pub fn map_id(&self, ty: &str, key: impl Into<Key>) -> Option<Key> {
        let id = self.id(ty, key)?;
        Some(self.arena.key_of(id).clone())
    }

    /// Every `(server, local)` key pair recorded for a type.
    pub fn id_table(&self, ty: &str) -> Vec<(Key, Key)> {
        let mut pairs: Vec<(Key, Key)> = self
            .arena
            .server_mappings()
            .filter(|(_, local)| local.ty == ty)
            .map(|(server, local)| (server.id.clone(), local.id.clone()))
            .collect();
        pairs.sort();
        pairs
    }

    fn describe(&self, id: Id) -> String {
        self.object_ref(id).to_string()
    }

    // ------------------------------------------------------------------
    // Reading
    // ------------------------------------------------------------------

    fn tables(&self, branch: Branch) -> &Tables {
        match branch {
            Branch::Head => &self.head,
            Branch::Tail => &self.tail,
        }
    }

    /// The table of one type on one branch.
    pub fn table(&self, ty: &str, branch: Branch) -> Result<&Table> {
        self.tables(branch)
            .get(ty)
            .ok_or_else(|| Error::UnknownModel(ty.to_string()))
    }

    /// Head record for a handle.
    pub fn get(&self, id: Id) -> Option<&Record> {
        self.get_in(id, Branch::Head)
    }

    pub fn get_in(&self, id: Id, branch: Branch) -> Option<&Record> {
        let id = self.arena.resolve(id);
        self.tables(branch).get(self.arena.type_of(id))?.get(id)
    }

    /// Head record by type and key. Server keys work once mapped.
    pub fn get_by(&self, ty: &str, key: impl Into<Key>) -> Option<&Record> {
        self.get(self.id(ty, key)?)
    }

    pub fn exists(&self, id: Id, branch: Branch) -> bool {
        self.get_in(id, branch).is_some()
    }

    /// Head records of `ty` matching `filter`, in slot order.
    pub fn filter(&self, ty: &str, filter: &Filter) -> Result<Vec<&Record>> {
        let table = self.table(ty, Branch::Head)?;
        let positions = TableVisitor::new(&self.arena, &self.head).execute(table, filter)?;
        Ok(table.records_at(&positions))
    }

    /// Head records of `ty` whose fields equal every entry of `query`.
    ///
    /// `query` is a JSON object of field values in external form; an `id`
    /// entry narrows the result to that object.
    pub fn filter_fields(&self, ty: &str, query: &Json) -> Result<Vec<&Record>> {
        let query = object_of(query)?;
        let table = self.table(ty, Branch::Head)?;
        let model = table.model();
        let visitor = TableVisitor::new(&self.arena, &self.head);

        let mut pairs = Vec::with_capacity(query.len());
        for (name, json) in &query {
            if name == "id" || name == "_type" {
                continue;
            }
            let kind = model.field_kind_or_err(name)?;
            match visitor.to_value(model, name, kind, json)? {
                Some(value) => pairs.push((name.as_str(), value)),
                None => return Ok(Vec::new()),
            }
        }
        let mut records = table.filter_fields(&pairs)?;
        if let Some(key) = query.get("id") {
            let wanted = key_of_json(key).and_then(|key| self.id(ty, key));
            records.retain(|r| Some(r.id()) == wanted);
        }
        Ok(records)
    }

    /// Outgoing diffs: committed, not yet acknowledged.
    pub fn outgoing_diffs(&self) -> &[Diff] {
        &self.diffs[..self.tail_pointer]
    }

    /// Local diffs: not yet committed.
    pub fn local_diffs(&self) -> &[Diff] {
        &self.diffs[self.tail_pointer..]
    }

    /// The whole diff log.
    pub fn diffs(&self) -> &[Diff] {
        &self.diffs
    }

    pub fn tail_pointer(&self) -> usize {
        self.tail_pointer
    }

    /// Render every head record of `ty` as a JSON:API document.
    pub fn to_json_api(&self, ty: &str) -> Result<Json> {
        let records: Vec<&Record> = self.table(ty, Branch::Head)?.iter().collect();
        jsonapi::render(&self.schema, &records, &self.arena)
    }

    // ------------------------------------------------------------------
    // Editing
    // ------------------------------------------------------------------

    /// Create an object from flattened data.
    ///
    /// A UUID v4 key is generated when `data` has no `id`.
    pub fn create(&mut self, ty: &str, data: &Json) -> Result<Record> {
        let model = self.schema.model(ty)?.clone();
        let data = object_of(data)?;
        let key = data
            .get("id")
            .and_then(key_of_json)
            .unwrap_or_else(|| Key::Str(uuid::Uuid::new_v4().to_string()));
        let id = self.arena.intern(&ObjectRef::new(ty, key));
        if self.exists(id, Branch::Head) {
            return Err(Error::RecordAlreadyExists(self.describe(id)));
        }
        let record = model.to_record(id, &data, &mut self.arena)?;
        self.save_record(record)
    }

    /// Apply a partial update to an existing object.
    pub fn update(&mut self, id: Id, data: &Json) -> Result<Record> {
        let existing = self
            .get(id)
            .cloned()
            .ok_or_else(|| Error::RecordNotFound(self.describe(id)))?;
        let model = self.schema.model(existing.ty())?.clone();
        let updated = model.merge_values(&existing, &object_of(data)?, &mut self.arena)?;
        self.save_record(updated)
    }

    /// Remove an object.
    pub fn remove(&mut self, id: Id) -> Result<()> {
        let existing = self
            .get(id)
            .cloned()
            .ok_or_else(|| Error::RecordNotFound(self.describe(id)))?;
        let model = self.schema.model(existing.ty())?.clone();
        if let Some(diff) = model.diff(Some(&existing), None) {
            self.record_diff(diff)?;
        }
        Ok(())
    }

    /// Write a whole record to the head, logging the difference.
    ///
    /// Reverse relationship values on `record` are ignored; they follow the
    /// forward side.
    pub fn save_record(&mut self, record: Record) -> Result<Record> {
        let model = self.schema.model(record.ty())?.clone();
        let id = self.arena.resolve(record.id());
        let record = record.with_id(id);
        let current = self.get(id).cloned();
        if let Some(diff) = model.diff(current.as_ref(), Some(&record)) {
            self.record_diff(diff)?;
        }
        self.get(id)
            .cloned()
            .ok_or_else(|| Error::RecordNotFound(self.describe(id)))
    }

    /// Update the object named by `data.id` if it exists, create it otherwise.
    pub fn create_or_update(&mut self, ty: &str, data: &Json) -> Result<Record> {
        let existing = object_of(data)?
            .get("id")
            .and_then(key_of_json)
            .and_then(|key| self.id(ty, key))
            .filter(|id| self.exists(*id, Branch::Head));
        match existing {
            Some(id) => self.update(id, data),
            None => self.create(ty, data),
        }
    }

    /// Find the first object matching `query` and update it with `values`,
    /// or create one from both. The flag is `true` when an object was created.
    pub fn get_or_create(&mut self, ty: &str, query: &Json, values: &Json) -> Result<(Record, bool)> {
        let found = self.filter_fields(ty, query)?.first().map(|r| r.id());
        match found {
            Some(id) => Ok((self.update(id, values)?, false)),
            None => {
                let mut data = object_of(query)?;
                data.extend(object_of(values)?);
                Ok((self.create(ty, &Json::Object(data))?, true))
            }
        }
    }

    /// Apply a diff to one branch without logging it.
    ///
    /// Reverse relationships are kept in step with the forward side.
    pub fn apply_diff(&mut self, diff: &Diff, reverse: bool, branch: Branch) -> Result<()> {
        let model = self.schema.model(diff.ty())?.clone();
        let policy = self.config.conflict_policy;
        let tables = match branch {
            Branch::Head => &mut self.head,
            Branch::Tail => &mut self.tail,
        };
        apply_with_reverse(tables, &self.arena, &model, diff, reverse, policy)
    }

    fn tables_mut(&mut self, branch: Branch) -> &mut Tables {
        match branch {
            Branch::Head => &mut self.head,
            Branch::Tail => &mut self.tail,
        }
    }

    /// Apply a diff to the head and append it to the local segment.
    fn record_diff(&mut self, diff: Diff) -> Result<()> {
        self.apply_diff(&diff, false, Branch::Head)?;
        self.diffs.push(diff);
        Ok(())
    }

    /// Apply a foreign diff last-writer-wins, logging only what changes.
    fn merge_diff(&mut self, diff: &Diff) -> Result<()> {
        let model = self.schema.model(diff.ty())?.clone();
        let current = self.get(diff.id()).cloned();
        let target = match model.apply_diff(current.as_ref(), diff, false, ConflictPolicy::LastWriterWins) {
            Ok(target) => target,
            Err(Error::RecordNotFound(_)) => {
                warn!(object = %self.describe(diff.id()), op = %diff.op(), "diff targets a missing object, skipping");
                return Ok(());
            }
            Err(e) => return Err(e.naming(self.object_ref(diff.id()))),
        };
        if let Some(diff) = model.diff(current.as_ref(), target.as_ref()) {
            self.record_diff(diff)?;
        }
        Ok(())
    }

    /// Drop every object except those named by outgoing non-removal diffs or
    /// by local diffs.
    pub fn clear(&mut self) -> Result<()> {
        let mut keep: BTreeSet<Id> = self
            .outgoing_diffs()
            .iter()
            .filter(|d| d.op() != DiffOp::Remove)
            .map(|d| self.arena.resolve(d.id()))
            .collect();
        keep.extend(self.local_diffs().iter().map(|d| self.arena.resolve(d.id())));

        for branch in [Branch::Head, Branch::Tail] {
            let tables = self.tables_mut(branch);
            for table in tables.values_mut() {
                let mut fresh = Table::new(table.model().clone());
                for record in table.iter().filter(|r| keep.contains(&r.id())) {
                    fresh.set(record.clone())?;
                }
                *table = fresh;
            }
            rebuild_reverse(tables)?;
        }
        debug!(kept = keep.len(), "cleared store");
        Ok(())
    }

    // ------------------------------------------------------------------
    // Loading
    // ------------------------------------------------------------------

    /// Merge a JSON:API response (or an array of them) from the server.
    ///
    /// Outgoing diffs are unapplied from the tail, the server objects merged
    /// in, reverse relationships rebuilt, outgoing diffs reapplied and local
    /// diffs replayed onto a fresh head. Resources of unknown types are
    /// skipped with a warning. On error the store is left unchanged.
    pub fn load_json_api(&mut self, response: &Json) -> Result<usize> {
        let resources = jsonapi::flatten_response(&self.schema, response)?;
        let loaded = self.load_resources(resources)?;
        if self.name.is_some() {
            self.loads.push(Load::JsonApi(response.clone()));
        }
        Ok(loaded)
    }

    /// Merge flattened objects (`{_type, id, ...fields}`), one or an array.
    pub fn load_objects(&mut self, objects: &Json) -> Result<usize> {
        let items: Vec<&Json> = match objects {
            Json::Array(items) => items.iter().collect(),
            other => vec![other],
        };
        let mut resources = Vec::with_capacity(items.len());
        for item in items {
            let obj = object_of(item)?;
            let r = ObjectRef::from_json(item)
                .ok_or_else(|| Error::InvalidPayload("object needs _type and id".into()))?;
            let fields = obj
                .into_iter()
                .filter(|(k, _)| k != "_type" && k != "id")
                .collect();
            resources.push(Resource {
                ty: r.ty,
                id: r.id,
                fields,
            });
        }
        let loaded = self.load_resources(resources)?;
        if self.name.is_some() {
            self.loads.push(Load::Objects(objects.clone()));
        }
        Ok(loaded)
    }

    fn load_resources(&mut self, resources: Vec<Resource>) -> Result<usize> {
        let mut staged = self.clone();
        let loaded = staged.merge_resources(resources)?;
        *self = staged;
        Ok(loaded)
    }

    fn merge_resources(&mut self, resources: Vec<Resource>) -> Result<usize> {
        let policy = self.config.conflict_policy;
        let outgoing = self.outgoing_diffs().to_vec();
        let local = self.local_diffs().to_vec();

        for diff in outgoing.iter().rev() {
            let model = self.schema.model(diff.ty())?.clone();
            apply_with_reverse(&mut self.tail, &self.arena, &model, diff, true, policy)?;
        }

        let mut loaded = 0;
        for resource in resources {
            let Some(model) = self.schema.get_model(&resource.ty).cloned() else {
                warn!(ty = %resource.ty, id = %resource.id, "skipping resource of unknown type");
                continue;
            };
            let id = self
                .arena
                .intern(&ObjectRef::new(resource.ty.clone(), resource.id.clone()));
            let table = table_mut(&mut self.tail, &resource.ty)?;
            let base = table
                .get(id)
                .cloned()
                .unwrap_or_else(|| model.default_record(id));
            let record = model.merge_loaded(&base, &resource.fields, &mut self.arena)?;
            table.set(record)?;
            loaded += 1;
        }
        rebuild_reverse(&mut self.tail)?;

        for diff in &outgoing {
            let model = self.schema.model(diff.ty())?.clone();
            apply_with_reverse(&mut self.tail, &self.arena, &model, diff, false, policy)?;
        }
        self.head = self.tail.clone();
        for diff in &local {
            let model = self.schema.model(diff.ty())?.clone();
            apply_with_reverse(&mut self.head, &self.arena, &model, diff, false, policy)?;
        }

        debug!(
            loaded,
            outgoing = outgoing.len(),
            local = local.len(),
            "merged server data"
        );
        Ok(loaded)
    }

    // ------------------------------------------------------------------
    // Committing
    // ------------------------------------------------------------------

    /// Compact local edits into the outgoing segment.
    ///
    /// Returns the number of diffs added. Calling it again without edits in
    /// between adds nothing.
    pub fn commit(&mut self) -> Result<usize> {
        let mut compacted = Vec::new();
        for diff in self.ordered_diffs()? {
            compacted.extend(self.split_many_to_many(diff));
        }
        let count = compacted.len();
        self.diffs.truncate(self.tail_pointer);
        self.diffs.extend(compacted);
        self.tail_pointer = self.diffs.len();
        self.tail = self.head.clone();
        debug!(count, tail_pointer = self.tail_pointer, "committed diffs");
        Ok(count)
    }

    /// Minimal tail-to-head diffs in an order the server can accept.
    ///
    /// An object is emitted only once every object it references that does
    /// not exist yet has been emitted. Among ready objects the one with the
    /// fewest optional dependencies goes first; when all ready objects still
    /// have optional dependencies, the chosen one is split so its optional
    /// references travel in a later update. Removals come last.
    pub(crate) fn ordered_diffs(&self) -> Result<Vec<Diff>> {
        let (mut pending, removals) = self.dependency_table();
        let mut out = Vec::with_capacity(pending.len() + removals.len());

        while !pending.is_empty() {
            let next = pending
                .iter()
                .enumerate()
                .filter(|(_, p)| p.required.is_empty())
                .min_by_key(|(pos, p)| (p.optional.len(), *pos))
                .map(|(pos, _)| pos);
            let Some(pos) = next else {
                let cycle = pending.iter().map(|p| self.describe(p.diff.id())).collect();
                return Err(Error::DependencyCycle(cycle));
            };

            let mut item = pending.remove(pos);
            let id = item.diff.id();
            if !item.optional.is_empty() {
                let (main, aux) = split_optional(&item.diff, &item.optional);
                debug!(object = %self.describe(id), deferred = item.optional.len(), "splitting diff");
                pending.push(Pending {
                    diff: aux,
                    required: std::mem::take(&mut item.optional),
                    optional: BTreeSet::new(),
                });
                item.diff = main;
            }
            for p in pending.iter_mut() {
                p.required.remove(&id);
                p.optional.remove(&id);
            }
            if item.diff.op() != DiffOp::Update || !item.diff.is_empty() {
                out.push(item.diff);
            }
        }

        out.extend(removals);
        Ok(out)
    }

    fn dependency_table(&self) -> (Vec<Pending>, Vec<Diff>) {
        let mut dirty = Vec::new();
        for (ty, head) in &self.head {
            let model = head.model();
            let tail = self.tail.get(ty);
            for record in head.iter() {
                let before = tail.and_then(|t| t.get(record.id()));
                if let Some(diff) = model.diff(before, Some(record)) {
                    dirty.push(diff);
                }
            }
        }

        let created: BTreeSet<Id> = dirty
            .iter()
            .filter(|d| d.op() == DiffOp::Create)
            .map(Diff::id)
            .collect();

        let mut pending = Vec::with_capacity(dirty.len());
        for diff in dirty {
            let mut required = BTreeSet::new();
            let mut optional = BTreeSet::new();
            if let Some(model) = self.schema.get_model(diff.ty()) {
                for (field, target) in diff.targets() {
                    let Some(rel) = model.relationship(field) else {
                        continue;
                    };
                    if !created.contains(&target) {
                        if !self.exists(target, Branch::Tail) {
                            debug!(
                                object = %self.describe(diff.id()),
                                field,
                                target = %self.describe(target),
                                "reference to unknown object"
                            );
                        }
                        continue;
                    }
                    if rel.required {
                        required.insert(target);
                    } else {
                        optional.insert(target);
                    }
                }
            }
            pending.push(Pending {
                diff,
                required,
                optional,
            });
        }

        let mut removals = Vec::new();
        for (ty, tail) in &self.tail {
            let model = tail.model();
            let head = self.head.get(ty);
            for record in tail.iter() {
                if head.is_some_and(|h| h.contains(record.id())) {
                    continue;
                }
                if let Some(diff) = model.diff(Some(record), None) {
                    removals.push(diff);
                }
            }
        }
        (pending, removals)
    }

    /// Move many-to-many changes into their own remove-only and add-only
    /// updates.
    fn split_many_to_many(&self, diff: Diff) -> Vec<Diff> {
        if diff.op() == DiffOp::Remove {
            return vec![diff];
        }
        let mut main = diff.clone();
        let mut extra = Vec::new();
        for (name, field_diff) in diff.fields() {
            let FieldDiff::Set { removed, added } = field_diff else {
                continue;
            };
            main.remove(name);
            if !removed.is_empty() {
                extra.push(Diff::new(diff.ty(), diff.id(), DiffOp::Update).with(
                    name,
                    FieldDiff::Set {
                        removed: removed.clone(),
                        added: RefSet::new(),
                    },
                ));
            }
            if !added.is_empty() {
                extra.push(Diff::new(diff.ty(), diff.id(), DiffOp::Update).with(
                    name,
                    FieldDiff::Set {
                        removed: RefSet::new(),
                        added: added.clone(),
                    },
                ));
            }
        }

        let mut out = Vec::with_capacity(extra.len() + 1);
        if main.op() == DiffOp::Create || !main.is_empty() {
            out.push(main);
        }
        out.extend(extra);
        out
    }

    /// Start the remote call for an outgoing diff (the oldest by default).
    ///
    /// Returns `None` when there is nothing to send. Fails with
    /// [`Error::MissingOperation`] when the model lacks a required handler.
    /// The future resolves to the first call's response.
    pub fn commit_diff(&self, diff: Option<&Diff>) -> Result<Option<OpFuture>> {
        let diff = match diff.or_else(|| self.outgoing_diffs().first()) {
            Some(diff) => diff,
            None => return Ok(None),
        };
        let model = self.schema.model(diff.ty())?;
        let key = self.arena.wire_ref(diff.id()).id.clone();

        let mut calls: Vec<(String, OpCall)> = Vec::new();
        let has_scalars = diff
            .fields()
            .any(|(name, _)| model.field_kind(name) != Some(FieldKind::ManyToMany));
        match diff.op() {
            DiffOp::Create => calls.push((
                "create".into(),
                OpCall {
                    id: None,
                    body: Some(model.diff_to_json_api(diff, &self.arena)),
                },
            )),
            DiffOp::Update if has_scalars => calls.push((
                "update".into(),
                OpCall {
                    id: Some(key.clone()),
                    body: Some(model.diff_to_json_api(diff, &self.arena)),
                },
            )),
            DiffOp::Update => {}
            DiffOp::Remove => calls.push((
                "remove".into(),
                OpCall {
                    id: Some(key.clone()),
                    body: None,
                },
            )),
        }
        if diff.op() != DiffOp::Remove {
            for (name, field_diff) in diff.fields() {
                let FieldDiff::Set { removed, added } = field_diff else {
                    continue;
                };
                for (suffix, set) in [("Add", added), ("Remove", removed)] {
                    if set.is_empty() {
                        continue;
                    }
                    let refs: Vec<Json> = set.iter().map(|id| self.arena.wire_ref(id).to_json()).collect();
                    calls.push((
                        format!("{}{}", name, suffix),
                        OpCall {
                            id: Some(key.clone()),
                            body: Some(json!({ "data": refs })),
                        },
                    ));
                }
            }
        }

        let mut handlers: Vec<(OpHandler, OpCall)> = Vec::with_capacity(calls.len());
        for (op, call) in calls {
            let handler = model.op(&op).ok_or_else(|| Error::MissingOperation {
                ty: model.ty().to_string(),
                op: op.clone(),
            })?;
            handlers.push((handler.clone(), call));
        }
        if handlers.is_empty() {
            return Ok(None);
        }

        debug!(object = %self.describe(diff.id()), op = %diff.op(), calls = handlers.len(), "sending diff");
        Ok(Some(
            async move {
                let mut first = None;
                for (handler, call) in handlers {
                    let response = handler(call).await?;
                    first.get_or_insert(response);
                }
                Ok::<Json, Error>(first.unwrap_or(Json::Null))
            }
            .boxed(),
        ))
    }

    /// Record the server's acknowledgment of an outgoing diff (the oldest by
    /// default).
    ///
    /// The diff leaves the outgoing segment. For a creation the identifier in
    /// the response's `data` is mapped to the local one, after which either
    /// key names the same object everywhere.
    pub fn post_commit_diff(&mut self, response: &Json, diff: Option<&Diff>) -> Result<()> {
        let pos = match diff {
            Some(diff) => self
                .outgoing_diffs()
                .iter()
                .position(|d| d == diff)
                .ok_or(Error::NoOutgoingDiff)?,
            None if self.tail_pointer > 0 => 0,
            None => return Err(Error::NoOutgoingDiff),
        };
        let diff = self.diffs.remove(pos);
        self.tail_pointer -= 1;

        if diff.op() == DiffOp::Create {
            if let Some(key) = jsonapi::primary_key(response) {
                let server = self.arena.intern_raw(&ObjectRef::new(diff.ty(), key));
                let local = self.arena.resolve(diff.id());
                if self.arena.resolve(server) != local {
                    self.arena.map_server(server, local);
                    debug!(
                        local = %self.arena.get(local),
                        server = %self.arena.get(server),
                        "mapped server identifier"
                    );
                }
            }
        }
        Ok(())
    }

    // ------------------------------------------------------------------
    // Transactions
    // ------------------------------------------------------------------

    /// Open a named transaction whose tail is this store's current head.
    pub fn start_transaction(&mut self, name: &str) -> Result<&mut Store> {
        if self.transactions.contains_key(name) {
            return Err(Error::DuplicateTransaction(name.to_string()));
        }
        let transaction = Store {
            schema: self.schema.clone(),
            config: self.config.clone(),
            arena: self.arena.clone(),
            head: self.head.clone(),
            tail: self.head.clone(),
            diffs: Vec::new(),
            tail_pointer: 0,
            transactions: BTreeMap::new(),
            loads: Vec::new(),
            name: Some(name.to_string()),
        };
        debug!(transaction = name, "started transaction");
        Ok(self
            .transactions
            .entry(name.to_string())
            .or_insert(transaction))
    }

    pub fn get_transaction(&self, name: &str) -> Option<&Store> {
        self.transactions.get(name)
    }

    pub fn transaction_mut(&mut self, name: &str) -> Option<&mut Store> {
        self.transactions.get_mut(name)
    }

    /// Store a detached transaction back under its name.
    pub fn save_transaction(&mut self, transaction: Store) -> Result<()> {
        let name = transaction
            .name
            .clone()
            .ok_or_else(|| Error::TransactionNotFound("<unnamed>".into()))?;
        self.transactions.insert(name, transaction);
        Ok(())
    }

    /// Replay a transaction's loads and edits onto this store and close it.
    ///
    /// Edits apply last-writer-wins: a field changed by the transaction takes
    /// the transaction's value whatever happened here in the meantime.
    pub fn commit_transaction(&mut self, name: &str) -> Result<()> {
        let transaction = self
            .transactions
            .get(name)
            .cloned()
            .ok_or_else(|| Error::TransactionNotFound(name.to_string()))?;
        let diffs = transaction.ordered_diffs()?;

        let mut staged = self.clone();
        staged.transactions.remove(name);
        for load in &transaction.loads {
            match load {
                Load::JsonApi(response) => staged.load_json_api(response)?,
                Load::Objects(objects) => staged.load_objects(objects)?,
            };
        }
        for diff in &diffs {
            let diff = diff.translate(&transaction.arena, &mut staged.arena);
            staged.merge_diff(&diff)?;
        }
        *self = staged;
        debug!(transaction = name, diffs = diffs.len(), "committed transaction");
        Ok(())
    }

    /// Discard a transaction.
    pub fn abort_transaction(&mut self, name: &str) -> Result<()> {
        self.transactions
            .remove(name)
            .ok_or_else(|| Error::TransactionNotFound(name.to_string()))?;
        debug!(transaction = name, "aborted transaction");
        Ok(())
    }

    // ------------------------------------------------------------------
    // Rebase and re-identification
    // ------------------------------------------------------------------

    /// A copy of `base` with this store's local diffs, minus the first
    /// `offset`, replayed on top.
    pub fn rebase(&self, base: &Store, offset: usize) -> Result<Store> {
        let mut out = base.clone();
        let mut replayed = 0;
        for diff in self.local_diffs().iter().skip(offset) {
            let diff = diff.translate(&self.arena, &mut out.arena);
            out.record_diff(diff)?;
            replayed += 1;
        }
        debug!(replayed, offset, "rebased store");
        Ok(out)
    }

    /// Give an object a new key.
    ///
    /// The record moves to the new handle, related objects pointing back at
    /// it are repointed, and every diff in the log is rewritten. With
    /// `branch` unset both branches change and the old key keeps resolving
    /// to the object, across [`Store::export_state`] too. Running it twice
    /// is harmless.
    pub fn re_id(
        &mut self,
        ty: &str,
        old: impl Into<Key>,
        new: impl Into<Key>,
        branch: Option<Branch>,
    ) -> Result<()> {
        self.schema.model(ty)?;
        let old_ref = ObjectRef::new(ty, old);
        let old_id = self
            .arena
            .lookup(&old_ref)
            .ok_or_else(|| Error::RecordNotFound(old_ref.to_string()))?;
        let new_id = self.arena.intern_raw(&ObjectRef::new(ty, new));
        if old_id == new_id {
            return Ok(());
        }

        let branches = match branch {
            Some(branch) => vec![branch],
            None => vec![Branch::Head, Branch::Tail],
        };
        let unlinked: Vec<TypeName> = self
            .schema
            .models()
            .filter(|m| {
                m.forward_relationships()
                    .any(|(_, rel)| rel.target == ty && rel.related_name.is_none())
            })
            .map(|m| m.ty().to_string())
            .collect();

        for branch in branches {
            let tables = match branch {
                Branch::Head => &mut self.head,
                Branch::Tail => &mut self.tail,
            };
            let table = table_mut(tables, ty)?;
            if table.contains(old_id) {
                table
                    .re_id(old_id, new_id)
                    .map_err(|e| e.naming(self.arena.get(new_id)))?;
                let mut links = Vec::new();
                table.for_each_related_object(new_id, |related, field| {
                    if let Some(field) = field {
                        links.push((related, field.to_string()));
                    }
                })?;
                for (related, field) in links {
                    let Some(table) = tables.get_mut(self.arena.type_of(related)) else {
                        continue;
                    };
                    let current = match table.get(related) {
                        Some(record) => record.value(&field).clone(),
                        None => continue,
                    };
                    match current {
                        Value::Refs(set) if set.contains(old_id) => {
                            table.remove_relationship(related, &field, old_id)?;
                            table.add_relationship(related, &field, new_id)?;
                        }
                        Value::Ref(id) if id == old_id => {
                            table.add_relationship(related, &field, new_id)?;
                        }
                        _ => {}
                    }
                }
            }
            for ty in &unlinked {
                if let Some(table) = tables.get_mut(ty) {
                    table.map_related(|x| if x == old_id { new_id } else { x });
                }
            }
        }

        self.diffs = self
            .diffs
            .iter()
            .map(|d| d.map_ids(|x| if x == old_id { new_id } else { x }))
            .collect();
        if branch.is_none() {
            self.arena.alias(old_id, new_id);
        }
        debug!(from = %old_ref, to = %self.arena.get(new_id), "re-identified object");
        Ok(())
    }

    // ------------------------------------------------------------------
    // Instances, comparison, persistence
    // ------------------------------------------------------------------

    /// Wrap the head record of `id`.
    pub fn get_instance(&self, id: Id) -> Option<Instance> {
        let record = self.get(id)?.clone();
        let model = self.schema.get_model(record.ty())?.clone();
        Some(Instance::new(model, record))
    }

    /// Build an unsaved instance from flattened data.
    pub fn create_instance(&mut self, ty: &str, data: &Json) -> Result<Instance> {
        let model = self.schema.model(ty)?.clone();
        let data = object_of(data)?;
        let key = data
            .get("id")
            .and_then(key_of_json)
            .unwrap_or_else(|| Key::Str(uuid::Uuid::new_v4().to_string()));
        let id = self.arena.intern(&ObjectRef::new(ty, key));
        let record = model.to_record(id, &data, &mut self.arena)?;
        Ok(Instance::unsaved(model, record))
    }

    /// Structural equality: same objects on both branches, same diff log,
    /// same tail pointer. Works across stores with different arenas.
    pub fn equals(&self, other: &Store) -> bool {
        self.tail_pointer == other.tail_pointer
            && self.canonical_diffs() == other.canonical_diffs()
            && self.canonical(Branch::Head) == other.canonical(Branch::Head)
            && self.canonical(Branch::Tail) == other.canonical(Branch::Tail)
    }

    /// Whether replaying the local diffs onto the tail reproduces the head.
    pub fn is_consistent(&self) -> Result<bool> {
        let mut replay = self.clone();
        replay.head = replay.tail.clone();
        for diff in self.local_diffs() {
            replay.apply_diff(diff, false, Branch::Head)?;
        }
        Ok(replay.canonical(Branch::Head) == self.canonical(Branch::Head))
    }

    fn canonical(&self, branch: Branch) -> BTreeMap<ObjectRef, Json> {
        let mut out = BTreeMap::new();
        for table in self.tables(branch).values() {
            let model = table.model();
            for record in table.iter() {
                let mut fields = Map::new();
                for (name, kind) in model.fields(true) {
                    let value = match record.value(name) {
                        Value::Ref(id) => self.object_ref(*id).to_json(),
                        Value::Refs(set) => {
                            let mut refs: Vec<&ObjectRef> = set.iter().map(|id| self.object_ref(id)).collect();
                            refs.sort();
                            Json::Array(refs.into_iter().map(ObjectRef::to_json).collect())
                        }
                        other => kind.from_internal(other, &self.arena),
                    };
                    fields.insert(name.to_string(), value);
                }
                out.insert(self.object_ref(record.id()).clone(), Json::Object(fields));
            }
        }
        out
    }

    fn canonical_diffs(&self) -> Vec<Json> {
        self.diffs
            .iter()
            .map(|d| d.map_ids(|id| self.arena.resolve(id)).to_json(&self.arena))
            .collect()
    }

    /// Export the tail, the diff log and the server-id table as a snapshot.
    pub fn export_state(&self) -> StoreSnapshot {
        let mut snapshot = StoreSnapshot::new();
        for (ty, table) in &self.tail {
            if table.is_empty() {
                continue;
            }
            let model = table.model();
            snapshot.tail.insert(
                ty.clone(),
                table
                    .iter()
                    .map(|r| model.record_to_json(r, &self.arena, false))
                    .collect(),
            );
        }
        snapshot.diffs = self.diffs.iter().map(|d| d.to_json(&self.arena)).collect();
        snapshot.tail_pointer = self.tail_pointer;
        for (server, local) in self.arena.server_mappings() {
            snapshot
                .ids
                .entry(local.ty.clone())
                .or_default()
                .push((server.id.clone(), local.id.clone()));
        }
        for (old, current) in self.arena.renames() {
            snapshot
                .aliases
                .entry(current.ty.clone())
                .or_default()
                .push((old.id.clone(), current.id.clone()));
        }
        for pairs in snapshot.ids.values_mut().chain(snapshot.aliases.values_mut()) {
            pairs.sort();
        }
        snapshot
    }

    /// Replace this store's state with a snapshot.
    ///
    /// The head is rebuilt by replaying the snapshot's local diffs. Open
    /// transactions are dropped.
    pub fn import_state(&mut self, snapshot: &StoreSnapshot) -> Result<()> {
        snapshot.validate(&self.schema)?;
        let mut store = Store::with_config(self.schema.clone(), self.config.clone());

        for (ty, pairs) in &snapshot.ids {
            for (server, local) in pairs {
                let server = store.arena.intern_raw(&ObjectRef::new(ty.clone(), server.clone()));
                let local = store.arena.intern(&ObjectRef::new(ty.clone(), local.clone()));
                store.arena.map_server(server, local);
            }
        }
        for (ty, pairs) in &snapshot.aliases {
            for (old, current) in pairs {
                let old = store.arena.intern_raw(&ObjectRef::new(ty.clone(), old.clone()));
                let current = store.arena.intern(&ObjectRef::new(ty.clone(), current.clone()));
                store.arena.alias(old, current);
            }
        }

        for (ty, records) in &snapshot.tail {
            let model = store.schema.model(ty)?.clone();
            for json in records {
                let data = object_of(json)?;
                let key = data
                    .get("id")
                    .and_then(key_of_json)
                    .ok_or_else(|| Error::InvalidSnapshot(format!("{} record without id", ty)))?;
                let id = store.arena.intern(&ObjectRef::new(ty.clone(), key));
                let record = model.merge_loaded(&model.empty_record(id), &data, &mut store.arena)?;
                table_mut(&mut store.tail, ty)?.set(record)?;
            }
        }
        rebuild_reverse(&mut store.tail)?;

        for json in &snapshot.diffs {
            let ty = crate::snapshot::diff_type(json)?;
            let model = store.schema.model(ty)?.clone();
            store.diffs.push(Diff::from_json(json, &model, &mut store.arena)?);
        }
        store.tail_pointer = snapshot.tail_pointer;
        store.head = store.tail.clone();
        for diff in store.diffs[store.tail_pointer..].to_vec() {
            store.apply_diff(&diff, false, Branch::Head)?;
        }

        debug!(
            diffs = store.diffs.len(),
            tail_pointer = store.tail_pointer,
            "imported snapshot"
        );
        *self = store;
        Ok(())
    }
}

fn object_of(data: &Json) -> Result<Map<String, Json>> {
    match data {
        Json::Object(map) => Ok(map.clone()),
        Json::Null => Ok(Map::new()),
        other => Err(Error::InvalidPayload(format!(
            "expected an object, got {}",
            other
        ))),
    }
}

/// A key given either bare or as `{type, id}`.
fn key_of_json(json: &Json) -> Option<Key> {
    ObjectRef::from_json(json)
        .map(|r| r.id)
        .or_else(|| Key::from_json(json))
}

fn table_mut<'a>(tables: &'a mut Tables, ty: &str) -> Result<&'a mut Table> {
    tables
        .get_mut(ty)
        .ok_or_else(|| Error::UnknownModel(ty.to_string()))
}

/// Apply a diff to one table set, then bring reverse relationships in line.
///
/// Record-level errors name objects by their external reference.
fn apply_with_reverse(
    tables: &mut Tables,
    arena: &IdArena,
    model: &Model,
    diff: &Diff,
    reverse: bool,
    policy: ConflictPolicy,
) -> Result<()> {
    let id = diff.id();
    let name = |id: Id| arena.get(arena.resolve(id));
    let table = table_mut(tables, diff.ty())?;
    let before = table.get(id).cloned();
    table
        .apply_diff(diff, reverse, policy)
        .map_err(|e| e.naming(name(id)))?;
    let after = table.get(id).cloned();

    if before.is_none() && after.is_some() {
        attach_reverse(tables, model, id).map_err(|e| e.naming(name(id)))?;
    }
    update_reverse(tables, model, id, before.as_ref(), after.as_ref())
        .map_err(|(target, e)| e.naming(name(target)))
}

/// Fill the reverse fields of a newly created object from the forward
/// fields already pointing at it.
fn attach_reverse(tables: &mut Tables, model: &Model, id: Id) -> Result<()> {
    let mut links = Vec::new();
    for (field, rel) in model.relationships().filter(|(_, rel)| rel.reverse) {
        let (Some(source), Some(forward)) = (tables.get(&rel.target), rel.related_name.as_deref()) else {
            continue;
        };
        let hits = source.select(forward, &Lookup::Contains(Value::Ref(id)))?;
        for record in source.records_at(&hits) {
            links.push((field.to_string(), record.id()));
        }
    }
    let table = table_mut(tables, model.ty())?;
    for (field, source) in links {
        table.add_relationship(id, &field, source)?;
    }
    Ok(())
}

/// Mirror the change of an object's forward relationships onto the reverse
/// fields of its targets.
fn update_reverse(
    tables: &mut Tables,
    model: &Model,
    id: Id,
    before: Option<&Record>,
    after: Option<&Record>,
) -> std::result::Result<(), (Id, Error)> {
    for (field, rel) in model.forward_relationships() {
        let Some(related_name) = rel.related_name.as_deref() else {
            continue;
        };
        let old = before.map(|r| r.value(field).related()).unwrap_or_default();
        let new = after.map(|r| r.value(field).related()).unwrap_or_default();
        let Some(target) = tables.get_mut(&rel.target) else {
            continue;
        };
        for t in old.iter().filter(|t| !new.contains(t)) {
            if target.contains(*t) {
                target
                    .remove_relationship(*t, related_name, id)
                    .map_err(|e| (*t, e))?;
            }
        }
        for t in new.iter().filter(|t| !old.contains(t)) {
            if target.contains(*t) {
                target
                    .add_relationship(*t, related_name, id)
                    .map_err(|e| (*t, e))?;
            }
        }
    }
    Ok(())
}

/// Recompute every reverse relationship from the forward side.
fn rebuild_reverse(tables: &mut Tables) -> Result<()> {
    for table in tables.values_mut() {
        let model = table.model().clone();
        let reverse: Vec<&str> = model
            .relationships()
            .filter(|(_, rel)| rel.reverse)
            .map(|(name, _)| name)
            .collect();
        if reverse.is_empty() {
            continue;
        }
        let stale: Vec<Record> = table
            .iter()
            .filter(|r| reverse.iter().any(|f| !r.value(f).is_empty()))
            .cloned()
            .collect();
        for record in stale {
            let cleared = reverse
                .iter()
                .fold(record, |r, f| r.with(*f, Value::Refs(RefSet::new())));
            table.set(cleared)?;
        }
    }

    let mut links = Vec::new();
    for table in tables.values() {
        for (field, rel) in table.model().forward_relationships() {
            let Some(related_name) = rel.related_name.as_deref() else {
                continue;
            };
            for record in table.iter() {
                for target in record.value(field).related() {
                    links.push((rel.target.clone(), target, related_name.to_string(), record.id()));
                }
            }
        }
    }
    for (ty, target, field, source) in links {
        if let Some(table) = tables.get_mut(&ty) {
            if table.contains(target) {
                table.add_relationship(target, &field, source)?;
            }
        }
    }
    Ok(())
}

/// Split a diff so references to objects in `optional` move to a separate
/// update. Returns `(main, aux)`.
fn split_optional(diff: &Diff, optional: &BTreeSet<Id>) -> (Diff, Diff) {
    let mut main = diff.clone();
    let mut aux = Diff::new(diff.ty(), diff.id(), DiffOp::Update);
    for (name, field_diff) in diff.fields() {
        match field_diff {
            FieldDiff::Change { to, .. } if to.as_ref_id().is_some_and(|t| optional.contains(&t)) => {
                main.remove(name);
                aux.insert(name, field_diff.clone());
            }
            FieldDiff::Set { removed, added } => {
                let deferred: RefSet = added.iter().filter(|t| optional.contains(t)).collect();
                if deferred.is_empty() {
                    continue;
                }
                let kept = added.difference(&deferred);
                if removed.is_empty() && kept.is_empty() {
                    main.remove(name);
                } else {
                    main.insert(
                        name,
                        FieldDiff::Set {
                            removed: removed.clone(),
                            added: kept,
                        },
                    );
                }
                aux.insert(
                    name,
                    FieldDiff::Set {
                        removed: RefSet::new(),
                        added: deferred,
                    },
                );
            }
            FieldDiff::Change { .. } => {}
        }
    }
    (main, aux)
}

#[cfg(test)]
mod tests {
    use super::*;
    use serde_json::json;

    fn test_schema() -> Arc<Schema> {
        Arc::new(
            Schema::from_json(&json!({
                "movie": {
                    "attributes": {"title": {"type": "text"}, "year": {"type": "integer"}},
                    "relationships": {
                        "director": {"type": "person", "relatedName": "directed"},
                        "actors": {"type": "person", "many": true, "relatedName": "actedIn"}
                    },
                    "indices": ["title"]
                },
                "person": {
                    "attributes": {"name": {"type": "text"}}
                }
            }))
            .unwrap(),
        )
    }

    fn test_store() -> Store {
        Store::new(test_schema())
    }

    #[test]
    fn create_logs_a_local_diff() {
        let mut store = test_store();
        let movie = store.create("movie", &json!({"id": 1, "title": "Rocky"})).unwrap();

        assert_eq!(store.local_diffs().len(), 1);
        assert_eq!(store.local_diffs()[0].op(), DiffOp::Create);
        assert_eq!(store.get(movie.id()).unwrap().value("title"), &Value::from("Rocky"));
        assert!(!store.exists(movie.id(), Branch::Tail));
    }

    #[test]
    fn create_generates_keys() {
        let mut store = test_store();
        let movie = store.create("movie", &json!({"title": "Rocky"})).unwrap();
        assert!(matches!(store.object_ref(movie.id()).id, Key::Str(_)));
    }

    #[test]
    fn create_rejects_duplicates() {
        let mut store = test_store();
        store.create("movie", &json!({"id": 1})).unwrap();
        assert!(matches!(
            store.create("movie", &json!({"id": 1})),
            Err(Error::RecordAlreadyExists(_))
        ));
        assert!(matches!(
            store.create("book", &json!({})),
            Err(Error::UnknownModel(_))
        ));
    }

    #[test]
    fn update_without_change_logs_nothing() {
        let mut store = test_store();
        let movie = store.create("movie", &json!({"id": 1, "title": "Rocky"})).unwrap();
        store.update(movie.id(), &json!({"title": "Rocky"})).unwrap();
        assert_eq!(store.local_diffs().len(), 1);

        store.update(movie.id(), &json!({"title": "Rocky 2"})).unwrap();
        assert_eq!(store.local_diffs().len(), 2);
    }

    #[test]
    fn reverse_relationships_follow_edits() {
        let mut store = test_store();
        let person = store.create("person", &json!({"id": 1, "name": "Sly"})).unwrap();
        let movie = store
            .create("movie", &json!({"id": 1, "director": 1, "actors": [1]}))
            .unwrap();

        let person_now = store.get(person.id()).unwrap();
        assert!(person_now.value("directed").as_refs().unwrap().contains(movie.id()));
        assert!(person_now.value("actedIn").as_refs().unwrap().contains(movie.id()));

        store.update(movie.id(), &json!({"director": null})).unwrap();
        let person_now = store.get(person.id()).unwrap();
        assert!(person_now.value("directed").is_empty());

        store.remove(movie.id()).unwrap();
        assert!(store.get(person.id()).unwrap().value("actedIn").is_empty());
    }

    #[test]
    fn creating_a_target_attaches_reverse_fields() {
        let mut store = test_store();
        let movie = store.create("movie", &json!({"id": 1, "director": 9})).unwrap();
        let person = store.create("person", &json!({"id": 9})).unwrap();
        let directed = store.get(person.id()).unwrap().value("directed").clone();
        assert!(directed.as_refs().unwrap().contains(movie.id()));
    }

    #[test]
    fn commit_moves_local_to_outgoing() {
        let mut store = test_store();
        store.create("movie", &json!({"id": 1, "title": "Rocky"})).unwrap();
        store.create("movie", &json!({"id": 2, "title": "Rambo"})).unwrap();

        assert_eq!(store.commit().unwrap(), 2);
        assert_eq!(store.tail_pointer(), 2);
        assert!(store.local_diffs().is_empty());
        assert_eq!(store.commit().unwrap(), 0);
        assert!(store.is_consistent().unwrap());
    }

    #[test]
    fn commit_collapses_edits_per_object() {
        let mut store = test_store();
        let movie = store.create("movie", &json!({"id": 1, "title": "Rocky"})).unwrap();
        store.update(movie.id(), &json!({"title": "Rocky 2"})).unwrap();
        store.update(movie.id(), &json!({"year": 1979})).unwrap();

        assert_eq!(store.commit().unwrap(), 1);
        let diff = &store.outgoing_diffs()[0];
        assert_eq!(diff.op(), DiffOp::Create);
        assert_eq!(
            diff.field("title"),
            Some(&FieldDiff::Change {
                from: Value::Null,
                to: Value::from("Rocky 2")
            })
        );
    }

    #[test]
    fn commit_drops_create_then_remove() {
        let mut store = test_store();
        let movie = store.create("movie", &json!({"id": 1})).unwrap();
        store.remove(movie.id()).unwrap();
        assert_eq!(store.commit().unwrap(), 0);
    }

    #[test]
    fn commit_orders_targets_first() {
        let mut store = test_store();
        store.create("movie", &json!({"id": 1, "director": 5})).unwrap();
        store.create("person", &json!({"id": 5})).unwrap();
        store.commit().unwrap();

        let order: Vec<&str> = store.outgoing_diffs().iter().map(Diff::ty).collect();
        assert_eq!(order, vec!["person", "movie"]);
    }

    #[test]
    fn many_to_many_changes_become_their_own_diffs() {
        let mut store = test_store();
        store.create("person", &json!({"id": 1})).unwrap();
        store.create("person", &json!({"id": 2})).unwrap();
        let movie = store.create("movie", &json!({"id": 1, "actors": [1]})).unwrap();
        store.commit().unwrap();
        let before = store.tail_pointer();

        store.update(movie.id(), &json!({"title": "Rocky", "actors": [2]})).unwrap();
        assert_eq!(store.commit().unwrap(), 3);

        let new = &store.outgoing_diffs()[before..];
        assert!(new[0].field("title").is_some());
        assert!(new[0].field("actors").is_none());
        assert!(matches!(
            new[1].field("actors"),
            Some(FieldDiff::Set { removed, added }) if removed.len() == 1 && added.is_empty()
        ));
        assert!(matches!(
            new[2].field("actors"),
            Some(FieldDiff::Set { removed, added }) if removed.is_empty() && added.len() == 1
        ));
    }

    #[test]
    fn post_commit_without_outgoing() {
        let mut store = test_store();
        assert!(matches!(
            store.post_commit_diff(&json!({}), None),
            Err(Error::NoOutgoingDiff)
        ));
    }

    #[test]
    fn transaction_names_are_unique() {
        let mut store = test_store();
        store.start_transaction("edit").unwrap();
        assert!(matches!(
            store.start_transaction("edit"),
            Err(Error::DuplicateTransaction(_))
        ));
        store.abort_transaction("edit").unwrap();
        assert!(matches!(
            store.abort_transaction("edit"),
            Err(Error::TransactionNotFound(_))
        ));
        assert!(matches!(
            store.commit_transaction("edit"),
            Err(Error::TransactionNotFound(_))
        ));
    }

    #[test]
    fn re_id_moves_the_record() {
        let mut store = test_store();
        let person = store.create("person", &json!({"id": "tmp"})).unwrap();
        let movie = store.create("movie", &json!({"id": 1, "director": "tmp"})).unwrap();
        store.re_id("person", "tmp", 7, None).unwrap();

        let new_id = store.id("person", 7).unwrap();
        assert_eq!(store.get(person.id()).unwrap().id(), new_id);
        assert_eq!(store.get(movie.id()).unwrap().value("director"), &Value::Ref(new_id));
        assert!(store.diffs().iter().all(|d| !d.mentions(person.id())));

        store.re_id("person", "tmp", 7, None).unwrap();
        assert!(store.get_by("person", 7).is_some());
    }

    #[test]
    fn filter_fields_uses_external_values() {
        let mut store = test_store();
        store.create("person", &json!({"id": 1})).unwrap();
        store.create("movie", &json!({"id": 1, "title": "Rocky", "director": 1})).unwrap();
        store.create("movie", &json!({"id": 2, "title": "Rocky", "director": null})).unwrap();

        assert_eq!(store.filter_fields("movie", &json!({"title": "Rocky"})).unwrap().len(), 2);
        assert_eq!(
            store
                .filter_fields("movie", &json!({"title": "Rocky", "director": 1}))
                .unwrap()
                .len(),
            1
        );
        assert_eq!(store.filter_fields("movie", &json!({"id": 2})).unwrap().len(), 1);
        assert!(store.filter_fields("movie", &json!({"director": 99})).unwrap().is_empty());
    }

    #[test]
    fn create_or_update_by_key() {
        let mut store = test_store();
        let created = store
            .create_or_update("movie", &json!({"id": 1, "title": "Rocky"}))
            .unwrap();
        let updated = store
            .create_or_update("movie", &json!({"id": 1, "year": 1976}))
            .unwrap();

        assert_eq!(created.id(), updated.id());
        assert_eq!(updated.value("title"), &Value::from("Rocky"));
        assert_eq!(updated.value("year"), &Value::Int(1976));
        assert_eq!(store.local_diffs().len(), 2);
    }

    #[test]
    fn get_or_create_matches_on_query() {
        let mut store = test_store();
        let (first, created) = store
            .get_or_create("movie", &json!({"title": "Rocky"}), &json!({"year": 1976}))
            .unwrap();
        assert!(created);
        assert_eq!(first.value("year"), &Value::Int(1976));

        let (second, created) = store
            .get_or_create("movie", &json!({"title": "Rocky"}), &json!({"year": 1976}))
            .unwrap();
        assert!(!created);
        assert_eq!(first.id(), second.id());
        assert_eq!(store.local_diffs().len(), 1);
    }
}
