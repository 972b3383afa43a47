//! Latency Tests
//!
//! Per-mutation re-evaluation cost with many live subscriptions over large
//! graphs. Timing assertions only hold with optimizations, so debug builds
//! skip these and release builds run them:
//!
//! ```bash
//! cargo test --release -p semgraph-core --test performance_test
//! ```

#[cfg(test)]
mod performance_tests {
    use semgraph_core::db::{EventBus, MemoryBackend};
    use semgraph_core::services::query_service::PropertyOp;
    use semgraph_core::services::{
        InheritanceResolver, QueryDefinition, QueryFilter, QueryService,
        QuerySubscriptionService, SubscriptionHandle,
    };
    use semgraph_core::{CreateNodeParams, NodeStore};
    use serde_json::json;
    use std::sync::Arc;
    use std::time::{Duration, Instant};
    use tokio_test::assert_ok;

    async fn populate(node_count: usize) -> (Arc<NodeStore>, Vec<String>) {
        let store = assert_ok!(NodeStore::open(Arc::new(MemoryBackend::new()), EventBus::new()).await);
        assert_ok!(store.bootstrap().await);
        assert_ok!(store.create_supertag("supertag:task", "Task").await);
        assert_ok!(store.create_supertag("supertag:project", "Project").await);

        let mut ids = Vec::with_capacity(node_count);
        for i in 0..node_count {
            let supertag = if i % 10 == 0 {
                "supertag:project"
            } else {
                "supertag:task"
            };
            let node = assert_ok!(
                store
                    .create_node(CreateNodeParams::new(format!("Item {}", i)).with_supertag(supertag))
                    .await
            );
            assert_ok!(
                store
                    .set_property(&node.id, "field:priority", json!(i % 10))
                    .await
            );
            ids.push(node.id);
        }
        (store, ids)
    }

    /// `count` subscriptions spread over a handful of query shapes
    async fn subscribe_many(
        service: &Arc<QuerySubscriptionService>,
        count: usize,
    ) -> Vec<SubscriptionHandle> {
        let mut handles = Vec::with_capacity(count);
        for i in 0..count {
            let query = match i % 4 {
                0 => QueryDefinition::new(vec![QueryFilter::supertag("supertag:project")]),
                1 => QueryDefinition::new(vec![
                    QueryFilter::supertag("supertag:task"),
                    QueryFilter::property("field:status", PropertyOp::Eq, json!("done")),
                ]),
                2 => QueryDefinition::new(vec![QueryFilter::property(
                    "field:priority",
                    PropertyOp::Gte,
                    json!(i % 10),
                )])
                .with_limit(25),
                _ => QueryDefinition::new(vec![QueryFilter::has_field(format!(
                    "field:estimate-{}",
                    i
                ))]),
            };
            handles.push(assert_ok!(service.subscribe(query, |_| Ok(())).await));
        }
        handles
    }

    /// Average latency of `rounds` status writes on one node
    async fn mean_write_latency(store: &NodeStore, node_id: &str, rounds: u32) -> Duration {
        let start = Instant::now();
        for i in 0..rounds {
            let status = if i % 2 == 0 { "done" } else { "open" };
            assert_ok!(store.set_property(node_id, "field:status", json!(status)).await);
        }
        start.elapsed() / rounds
    }

    #[tokio::test]
    #[cfg_attr(debug_assertions, ignore = "latency target, run in release mode")]
    async fn test_brute_force_50_subscriptions_10k_nodes() {
        let (store, ids) = populate(10_000).await;
        let resolver = InheritanceResolver::new(store.clone());
        let service = QuerySubscriptionService::new(Arc::new(QueryService::new(store.clone(), resolver)));
        service.set_debounce_ms(0);
        service.set_smart_invalidation(false);
        let _handles = subscribe_many(&service, 50).await;

        let latency = mean_write_latency(&store, &ids[1], 20).await;
        println!("brute force, 50 subscriptions x 10k nodes: {:?} per mutation", latency);
        assert!(latency < Duration::from_millis(100), "took {:?}", latency);
    }

    #[tokio::test]
    #[cfg_attr(debug_assertions, ignore = "latency target, run in release mode")]
    async fn test_smart_100_subscriptions_50k_nodes() {
        let (store, ids) = populate(50_000).await;
        let resolver = InheritanceResolver::new(store.clone());
        let service = QuerySubscriptionService::new(Arc::new(QueryService::new(store.clone(), resolver)));
        service.set_debounce_ms(0);
        service.set_smart_invalidation(true);
        let _handles = subscribe_many(&service, 100).await;

        service.reset_stats();
        let latency = mean_write_latency(&store, &ids[1], 20).await;
        println!("smart, 100 subscriptions x 50k nodes: {:?} per mutation", latency);
        assert!(latency < Duration::from_millis(50), "took {:?}", latency);

        let stats = service.stats();
        assert!(stats.skipped > stats.evaluations);
        assert_eq!(stats.incremental, stats.evaluations, "status writes patch in place");
    }

    #[tokio::test]
    #[cfg_attr(debug_assertions, ignore = "latency target, run in release mode")]
    async fn test_rapid_mutations_collapse_into_few_evaluations() {
        let (store, ids) = populate(5_000).await;
        let resolver = InheritanceResolver::new(store.clone());
        let service = QuerySubscriptionService::new(Arc::new(QueryService::new(store.clone(), resolver)));
        service.set_debounce_ms(10);
        let handles = subscribe_many(&service, 4).await;

        service.reset_stats();
        for i in 0..100 {
            let priority = json!(100 + i);
            assert_ok!(store.set_property(&ids[i], "field:priority", priority).await);
        }
        tokio::time::sleep(Duration::from_millis(50)).await;
        service.flush_pending_mutations();

        let stats = service.stats();
        println!("100 rapid mutations: {:?}", stats);
        assert_eq!(stats.events, 100);
        assert!(stats.evaluations < 100 * handles.len() as u64 / 4);
    }
}
