//! Performance benchmarks for jam-engine

use criterion::{black_box, criterion_group, criterion_main, BenchmarkId, Criterion};
use jam_engine::{Filter, Schema, Store, StoreSnapshot};
use serde_json::{json, Value as Json};

fn create_test_schema() -> Schema {
    Schema::from_json(&json!({
        "movie": {
            "attributes": {
                "title": {"type": "text"},
                "year": {"type": "integer"}
            },
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
    .unwrap()
}

/// A store holding `size` movies and `size / 10 + 1` people, all local.
fn populated_store(size: usize) -> Store {
    let mut store = create_test_schema().db();
    let people = size / 10 + 1;
    for i in 0..people {
        store
            .create("person", &json!({"id": i, "name": format!("Person {}", i)}))
            .unwrap();
    }
    for i in 0..size {
        store
            .create(
                "movie",
                &json!({
                    "id": i,
                    "title": format!("Movie {}", i),
                    "year": 1950 + (i % 70),
                    "director": i % people,
                    "actors": [i % people, (i + 1) % people]
                }),
            )
            .unwrap();
    }
    store
}

fn json_api_page(size: usize) -> Json {
    let data: Vec<Json> = (0..size)
        .map(|i| {
            json!({
                "type": "movie",
                "id": i,
                "attributes": {"title": format!("Movie {}", i), "year": 1950 + (i % 70)},
                "relationships": {
                    "director": {"data": {"type": "person", "id": i % 10}}
                }
            })
        })
        .collect();
    let included: Vec<Json> = (0..10)
        .map(|i| json!({"type": "person", "id": i, "attributes": {"name": format!("Person {}", i)}}))
        .collect();
    json!({"data": data, "included": included})
}

fn bench_store_operations(c: &mut Criterion) {
    let mut group = c.benchmark_group("store_operations");

    group.bench_function("store_new", |b| {
        let schema = create_test_schema();
        b.iter(|| black_box(&schema).db())
    });

    group.bench_function("create", |b| {
        let mut store = create_test_schema().db();
        let mut id = 0u64;

        b.iter(|| {
            id += 1;
            store.create(
                black_box("movie"),
                black_box(&json!({"id": id, "title": "Rocky", "year": 1976})),
            )
        })
    });

    group.bench_function("get_by", |b| {
        let store = populated_store(1000);
        b.iter(|| store.get_by(black_box("movie"), black_box(500)))
    });

    group.bench_function("filter_indexed", |b| {
        let store = populated_store(1000);
        let filter = Filter::eq("title", "Movie 500");
        b.iter(|| store.filter(black_box("movie"), black_box(&filter)))
    });

    group.bench_function("filter_related", |b| {
        let store = populated_store(1000);
        let filter = Filter::eq("director__name", "Person 7");
        b.iter(|| store.filter(black_box("movie"), black_box(&filter)))
    });

    group.finish();
}

fn bench_commit(c: &mut Criterion) {
    let mut group = c.benchmark_group("commit");

    for size in [10, 100, 500].iter() {
        group.bench_with_input(BenchmarkId::new("commit", size), size, |b, &size| {
            let store = populated_store(size);
            b.iter(|| {
                let mut store = store.clone();
                store.commit()
            })
        });
    }

    group.finish();
}

fn bench_load(c: &mut Criterion) {
    let mut group = c.benchmark_group("load");

    for size in [10, 100, 500].iter() {
        group.bench_with_input(BenchmarkId::new("load_json_api", size), size, |b, &size| {
            let schema = create_test_schema();
            let page = json_api_page(size);
            b.iter(|| {
                let mut store = schema.db();
                store.load_json_api(black_box(&page))
            })
        });

        group.bench_with_input(
            BenchmarkId::new("load_with_local_edits", size),
            size,
            |b, &size| {
                let mut store = create_test_schema().db();
                for i in 0..10 {
                    store
                        .create("person", &json!({"id": 100 + i, "name": "Local"}))
                        .unwrap();
                }
                let page = json_api_page(size);
                b.iter(|| {
                    let mut store = store.clone();
                    store.load_json_api(black_box(&page))
                })
            },
        );
    }

    group.finish();
}

fn bench_snapshot(c: &mut Criterion) {
    let mut group = c.benchmark_group("snapshot");

    for size in [100, 500, 1000].iter() {
        group.bench_with_input(BenchmarkId::new("export", size), size, |b, &size| {
            let store = populated_store(size);
            b.iter(|| store.export_state())
        });

        group.bench_with_input(BenchmarkId::new("import", size), size, |b, &size| {
            let schema = create_test_schema();
            let snapshot = populated_store(size).export_state();

            b.iter(|| {
                let mut store = schema.db();
                store.import_state(black_box(&snapshot))
            })
        });
    }

    group.finish();
}

fn bench_serialization(c: &mut Criterion) {
    let mut group = c.benchmark_group("serialization");

    group.bench_function("snapshot_to_json", |b| {
        let snapshot = populated_store(100).export_state();
        b.iter(|| black_box(&snapshot).to_json())
    });

    group.bench_function("snapshot_from_json", |b| {
        let json = populated_store(100).export_state().to_json().unwrap();
        b.iter(|| StoreSnapshot::from_json(black_box(&json)))
    });

    group.finish();
}

criterion_group!(
    benches,
    bench_store_operations,
    bench_commit,
    bench_load,
    bench_snapshot,
    bench_serialization,
);
criterion_main!(benches);
