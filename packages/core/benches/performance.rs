//! Performance benchmarks for semgraph core operations
//!
//! Run with: `cargo bench -p semgraph-core`
//!
//! These benchmarks measure critical path performance:
//! - Durable writes through the libsql backend
//! - One-shot query evaluation over a populated graph
//! - Mutation fan-out to live subscriptions, smart vs brute-force invalidation

use criterion::{black_box, criterion_group, criterion_main, BenchmarkId, Criterion};
use semgraph_core::db::{EventBus, MemoryBackend, TursoBackend};
use semgraph_core::services::query_service::PropertyOp;
use semgraph_core::services::{
    InheritanceResolver, QueryDefinition, QueryFilter, QueryService, QuerySubscriptionService,
};
use semgraph_core::{CreateNodeParams, NodeStore};
use serde_json::json;
use std::sync::Arc;
use tempfile::TempDir;
use tokio::runtime::Runtime;

/// Setup a libsql-backed store in a fresh temporary directory
async fn setup_disk_store() -> (Arc<NodeStore>, TempDir) {
    let temp_dir = TempDir::new().unwrap();
    let db_path = temp_dir.path().join("bench.db");

    let backend = TursoBackend::open(db_path).await.unwrap();
    let store = NodeStore::open(Arc::new(backend), EventBus::new())
        .await
        .unwrap();
    store.bootstrap().await.unwrap();
    (store, temp_dir)
}

/// In-memory store holding `node_count` tasks with status and priority
async fn setup_populated_store(node_count: usize) -> (Arc<NodeStore>, Vec<String>) {
    let store = NodeStore::open(Arc::new(MemoryBackend::new()), EventBus::new())
        .await
        .unwrap();
    store.bootstrap().await.unwrap();
    store.create_supertag("supertag:task", "Task").await.unwrap();
    store.create_supertag("supertag:bug", "Bug").await.unwrap();
    store
        .set_extends("supertag:bug", "supertag:task")
        .await
        .unwrap();

    let mut ids = Vec::with_capacity(node_count);
    for i in 0..node_count {
        let supertag = if i % 5 == 0 { "supertag:bug" } else { "supertag:task" };
        let node = store
            .create_node(CreateNodeParams::new(format!("Task {}", i)).with_supertag(supertag))
            .await
            .unwrap();
        let status = if i % 3 == 0 { "done" } else { "open" };
        store
            .set_property(&node.id, "field:status", json!(status))
            .await
            .unwrap();
        store
            .set_property(&node.id, "field:priority", json!(i % 10))
            .await
            .unwrap();
        ids.push(node.id);
    }
    (store, ids)
}

fn services(store: &Arc<NodeStore>) -> Arc<QueryService> {
    let resolver = InheritanceResolver::new(store.clone());
    Arc::new(QueryService::new(store.clone(), resolver))
}

/// Benchmark durable node creation
///
/// Each create is one libsql transaction covering the node row and its
/// supertag assignment.
fn bench_disk_writes(c: &mut Criterion) {
    let rt = Runtime::new().unwrap();

    c.bench_function("create_node_libsql", |b| {
        b.iter_custom(|iters| {
            rt.block_on(async {
                let (store, _temp) = setup_disk_store().await;
                store.create_supertag("supertag:task", "Task").await.unwrap();

                let start = std::time::Instant::now();
                for i in 0..iters {
                    store
                        .create_node(
                            CreateNodeParams::new(format!("Task {}", i))
                                .with_supertag("supertag:task"),
                        )
                        .await
                        .unwrap();
                }
                start.elapsed()
            })
        });
    });
}

/// Benchmark one-shot query evaluation over 10k nodes
fn bench_query_evaluation(c: &mut Criterion) {
    let rt = Runtime::new().unwrap();
    let (store, _) = rt.block_on(setup_populated_store(10_000));
    let queries = services(&store);

    let mut group = c.benchmark_group("query_evaluation");
    group.sample_size(20);

    let inherited = QueryDefinition::new(vec![QueryFilter::supertag("supertag:task")]);
    group.bench_function("supertag_inherited_10k", |b| {
        b.iter(|| black_box(queries.evaluate_query(&inherited).unwrap().total_count));
    });

    let compound = QueryDefinition::new(vec![
        QueryFilter::supertag("supertag:task"),
        QueryFilter::property("field:status", PropertyOp::Eq, json!("done")),
        QueryFilter::property("field:priority", PropertyOp::Gte, json!(5)),
    ])
    .with_limit(50);
    group.bench_function("compound_sorted_10k", |b| {
        let sorted = compound
            .clone()
            .with_sort("field:priority", Default::default());
        b.iter(|| black_box(queries.evaluate_query(&sorted).unwrap().nodes.len()));
    });

    group.finish();
}

/// Benchmark a single property write fanned out to 50 live subscriptions
///
/// Only a few subscriptions reference the written field, so smart
/// invalidation skips most re-evaluations.
fn bench_subscription_fanout(c: &mut Criterion) {
    let rt = Runtime::new().unwrap();

    let mut group = c.benchmark_group("subscription_fanout");
    group.sample_size(10);

    for smart in [true, false] {
        let (store, ids) = rt.block_on(setup_populated_store(2_000));
        let subscriptions = QuerySubscriptionService::new(services(&store));
        subscriptions.set_debounce_ms(0);
        subscriptions.set_smart_invalidation(smart);

        let handles = rt.block_on(async {
            let mut handles = Vec::new();
            for i in 0..50 {
                let field = if i < 5 { "field:status" } else { "field:estimate" };
                let query = QueryDefinition::new(vec![
                    QueryFilter::supertag("supertag:bug"),
                    QueryFilter::property(field, PropertyOp::Eq, json!("done")),
                ]);
                handles.push(subscriptions.subscribe(query, |_| Ok(())).await.unwrap());
            }
            handles
        });

        let label = if smart { "smart" } else { "brute_force" };
        group.bench_function(BenchmarkId::new("status_write_50_subs", label), |b| {
            b.iter_custom(|iters| {
                rt.block_on(async {
                    // Node 1 is a plain task, outside every subscription's results
                    let target = &ids[1];
                    let start = std::time::Instant::now();
                    for i in 0..iters {
                        let status = if i % 2 == 0 { "blocked" } else { "open" };
                        store
                            .set_property(target, "field:status", json!(status))
                            .await
                            .unwrap();
                    }
                    start.elapsed()
                })
            });
        });
        for handle in handles {
            handle.unsubscribe().unwrap();
        }
    }

    group.finish();
}

criterion_group!(
    benches,
    bench_disk_writes,
    bench_query_evaluation,
    bench_subscription_fanout
);
criterion_main!(benches);
