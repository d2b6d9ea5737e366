use criterion::{black_box, criterion_group, criterion_main, BenchmarkId, Criterion};
use docstore::backend::MemoryEngine;
use docstore::transport::TransportRegistry;
use docstore::{DatabaseManager, DocumentStore, KeyValueStore};
use serde_json::json;
use std::collections::HashMap;
use std::sync::Arc;
use tokio::runtime::Runtime;

fn setup_store(rt: &Runtime, name: &str) -> DocumentStore {
    rt.block_on(async {
        let engine = Arc::new(MemoryEngine::new());
        let registry = Arc::new(TransportRegistry::new().with_engine(engine));
        let manager = DatabaseManager::builder()
            .url(format!("memory:{}", name))
            .registry(registry)
            .build()
            .expect("valid settings");
        manager.setup().await.expect("setup succeeds");
        DocumentStore::new(Arc::new(manager))
    })
}

fn bench_put_get(c: &mut Criterion) {
    let rt = Runtime::new().expect("tokio runtime");
    let store = setup_store(&rt, "bench_put_get");
    let value = json!({"name": "widget", "dims": [2, 3, 5], "active": true});

    rt.block_on(store.put("hot", value.clone())).expect("seed");

    c.bench_function("get_existing", |b| {
        b.iter(|| rt.block_on(store.get(black_box("hot"))).expect("get"))
    });

    c.bench_function("put_update", |b| {
        b.iter(|| rt.block_on(store.put(black_box("hot"), value.clone())).expect("put"))
    });

    c.bench_function("get_missing", |b| {
        b.iter(|| rt.block_on(store.get(black_box("cold"))).expect("get"))
    });
}

fn bench_batches(c: &mut Criterion) {
    let rt = Runtime::new().expect("tokio runtime");
    let store = setup_store(&rt, "bench_batches");

    let mut group = c.benchmark_group("put_all");
    for size in [10, 100] {
        let entries: HashMap<String, serde_json::Value> = (0..size)
            .map(|i| (format!("key-{i}"), json!(i)))
            .collect();

        group.bench_with_input(BenchmarkId::from_parameter(size), &entries, |b, entries| {
            b.iter(|| rt.block_on(store.put_all(entries.clone())).expect("put_all"))
        });
    }
    group.finish();
}

criterion_group!(benches, bench_put_get, bench_batches);
criterion_main!(benches);
