//! Property tests for jam-engine
//!
//! Diffs must compose and invert exactly, and no sequence of edits, commits,
//! acknowledgments and loads may break `head == replay(tail, local diffs)`.

use jam_engine::{
    ConflictPolicy, FieldDiff, FieldKind, Id, IdArena, Model, ObjectRef, Record, RefSet, Schema, Store,
    Value,
};
use proptest::prelude::*;
use serde_json::{json, Map, Value as Json};
use std::sync::Arc;

fn test_schema() -> Schema {
    Schema::from_json(&json!({
        "movie": {
            "attributes": {
                "title": {"type": "text"},
                "year": {"type": "integer"}
            },
            "relationships": {
                "director": {"type": "person", "relatedName": "directed"},
                "actors": {"type": "person", "many": true}
            }
        },
        "person": {
            "attributes": {"name": {"type": "text"}}
        }
    }))
    .unwrap()
}

fn movie_model() -> Arc<Model> {
    test_schema().model("movie").unwrap().clone()
}

fn movie_record(
    model: &Model,
    arena: &mut IdArena,
    title: &Option<String>,
    year: Option<i64>,
    actors: &[u8],
) -> Record {
    let id = arena.intern(&ObjectRef::new("movie", 1));
    let mut data = Map::new();
    data.insert("title".into(), json!(title));
    data.insert("year".into(), json!(year));
    data.insert(
        "actors".into(),
        Json::Array(actors.iter().map(|n| json!({"type": "person", "id": n})).collect()),
    );
    model.to_record(id, &data, arena).unwrap()
}

fn ref_set(arena: &mut IdArena, keys: &[u8]) -> RefSet {
    keys.iter()
        .map(|n| arena.intern(&ObjectRef::new("person", *n as i64)))
        .collect()
}

#[derive(Debug, Clone)]
enum Edit {
    Create(u8),
    Retitle(u8, String),
    Direct(u8, u8),
    Remove(u8),
    Commit,
    Acknowledge,
    LoadPerson(u8),
}

fn arb_edit() -> impl Strategy<Value = Edit> {
    prop_oneof![
        (0u8..4).prop_map(Edit::Create),
        (0u8..4, "[a-z]{1,5}").prop_map(|(m, t)| Edit::Retitle(m, t)),
        (0u8..4, 0u8..3).prop_map(|(m, p)| Edit::Direct(m, p)),
        (0u8..4).prop_map(Edit::Remove),
        Just(Edit::Commit),
        Just(Edit::Acknowledge),
        (0u8..3).prop_map(Edit::LoadPerson),
    ]
}

fn movie(store: &Store, n: u8) -> Option<Id> {
    store.get_by("movie", n as i64).map(|r| r.id())
}

fn run(store: &mut Store, edit: &Edit) {
    match edit {
        Edit::Create(n) => {
            if movie(store, *n).is_none() {
                store.create("movie", &json!({"id": n})).unwrap();
            }
        }
        Edit::Retitle(n, title) => {
            if let Some(id) = movie(store, *n) {
                store.update(id, &json!({"title": title})).unwrap();
            }
        }
        Edit::Direct(n, person) => {
            if let Some(id) = movie(store, *n) {
                store.update(id, &json!({"director": person})).unwrap();
            }
        }
        Edit::Remove(n) => {
            if let Some(id) = movie(store, *n) {
                store.remove(id).unwrap();
            }
        }
        Edit::Commit => {
            store.commit().unwrap();
            assert_eq!(store.commit().unwrap(), 0);
        }
        Edit::Acknowledge => {
            if store.tail_pointer() > 0 {
                store.post_commit_diff(&json!({}), None).unwrap();
            }
        }
        Edit::LoadPerson(n) => {
            store
                .load_json_api(&json!({
                    "data": {"type": "person", "id": n, "attributes": {"name": format!("p{}", n)}}
                }))
                .unwrap();
        }
    }
}

proptest! {
    #![proptest_config(ProptestConfig::with_cases(64))]

    #[test]
    fn prop_diff_applies_and_reverts(
        title_a in proptest::option::of("[a-z]{1,4}"),
        title_b in proptest::option::of("[a-z]{1,4}"),
        year_a in proptest::option::of(1900i64..2030),
        year_b in proptest::option::of(1900i64..2030),
        actors_a in proptest::collection::vec(0u8..6, 0..4),
        actors_b in proptest::collection::vec(0u8..6, 0..4),
    ) {
        let model = movie_model();
        let mut arena = IdArena::new();
        let a = movie_record(&model, &mut arena, &title_a, year_a, &actors_a);
        let b = movie_record(&model, &mut arena, &title_b, year_b, &actors_b);

        match model.diff(Some(&a), Some(&b)) {
            None => prop_assert_eq!(&a, &b),
            Some(diff) => {
                let forward = model.apply_diff(Some(&a), &diff, false, ConflictPolicy::Strict).unwrap();
                prop_assert_eq!(forward.as_ref(), Some(&b));
                let back = model.apply_diff(Some(&b), &diff, true, ConflictPolicy::Strict).unwrap();
                prop_assert_eq!(back.as_ref(), Some(&a));
            }
        }

        let create = model.diff(None, Some(&b)).unwrap();
        let created = model.apply_diff(None, &create, false, ConflictPolicy::Strict).unwrap();
        prop_assert_eq!(created.as_ref(), Some(&b));
        let removed = model.apply_diff(Some(&b), &create, true, ConflictPolicy::Strict).unwrap();
        prop_assert!(removed.is_none());
    }

    #[test]
    fn prop_many_to_many_composition(
        a in proptest::collection::vec(0u8..8, 0..6),
        b in proptest::collection::vec(0u8..8, 0..6),
    ) {
        let mut arena = IdArena::new();
        let a = ref_set(&mut arena, &a);
        let b = ref_set(&mut arena, &b);
        let kind = FieldKind::ManyToMany;
        let (va, vb) = (Value::Refs(a.clone()), Value::Refs(b.clone()));

        match kind.diff(&va, &vb) {
            None => prop_assert_eq!(&a, &b),
            Some(FieldDiff::Set { removed, added }) => {
                prop_assert_eq!(&removed, &a.difference(&b));
                prop_assert_eq!(&added, &b.difference(&a));
                let diff = FieldDiff::Set { removed, added };
                prop_assert_eq!(kind.apply_diff(&va, &diff, false), vb.clone());
                prop_assert_eq!(kind.apply_diff(&vb, &diff, true), va);
            }
            Some(other) => prop_assert!(false, "unexpected diff {:?}", other),
        }
    }

    #[test]
    fn prop_head_is_tail_plus_local_diffs(edits in proptest::collection::vec(arb_edit(), 1..30)) {
        let mut store = test_schema().db();
        for edit in &edits {
            run(&mut store, edit);
            prop_assert!(store.is_consistent().unwrap(), "inconsistent after {:?}", edit);
        }
    }

    #[test]
    fn prop_snapshot_round_trip(edits in proptest::collection::vec(arb_edit(), 1..20)) {
        let schema = test_schema();
        let mut store = schema.db();
        for edit in &edits {
            run(&mut store, edit);
        }
        let mut restored = schema.db();
        restored.import_state(&store.export_state()).unwrap();
        prop_assert!(restored.equals(&store));
    }
}
