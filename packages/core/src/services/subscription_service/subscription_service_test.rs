//! Tests for QuerySubscriptionService
//!
//! Diff correctness, smart invalidation silence, batching and unsubscribe
//! safety against a bootstrapped in-memory store.

#[cfg(test)]
mod tests {
    use crate::db::{EventBus, EventFilter, MemoryBackend, MutationEvent, NodeStore};
    use crate::models::{AssembledNode, CreateNodeParams};
    use crate::services::inheritance::InheritanceResolver;
    use crate::services::query_service::{
        PropertyOp, QueryDefinition, QueryFilter, QueryService, SortDirection,
    };
    use crate::services::subscription_service::{QuerySubscriptionService, ResultChange};
    use crate::services::GraphError;
    use serde_json::json;
    use std::sync::{Arc, Mutex};
    use std::time::Duration;

    type Recorded = Arc<Mutex<Vec<ResultChange>>>;

    async fn create_test_services() -> (Arc<QuerySubscriptionService>, Arc<NodeStore>) {
        let store = NodeStore::open(Arc::new(MemoryBackend::new()), EventBus::new())
            .await
            .unwrap();
        store.bootstrap().await.unwrap();
        store.create_supertag("supertag:task", "Task").await.unwrap();
        store
            .create_node(CreateNodeParams::new("Priority").with_system_id("field:priority"))
            .await
            .unwrap();

        let resolver = InheritanceResolver::new(store.clone());
        let queries = Arc::new(QueryService::new(store.clone(), resolver));
        let service = QuerySubscriptionService::new(queries);
        service.set_debounce_ms(0);
        (service, store)
    }

    fn recorder() -> (
        Recorded,
        impl Fn(&ResultChange) -> anyhow::Result<()> + Send + Sync + 'static,
    ) {
        let recorded: Recorded = Arc::new(Mutex::new(Vec::new()));
        let sink = recorded.clone();
        (recorded, move |change: &ResultChange| {
            sink.lock().unwrap().push(change.clone());
            Ok(())
        })
    }

    fn tasks() -> QueryDefinition {
        QueryDefinition::new(vec![QueryFilter::supertag("supertag:task")])
    }

    async fn create_task(store: &NodeStore, content: &str) -> String {
        store
            .create_node(CreateNodeParams::new(content).with_supertag("supertag:task"))
            .await
            .unwrap()
            .id
    }

    #[tokio::test]
    async fn test_diff_for_create_update_delete() {
        let (service, store) = create_test_services().await;
        let (changes, callback) = recorder();
        service.subscribe(tasks(), callback).await.unwrap();

        let task = create_task(&store, "Write tests").await;
        {
            let changes = changes.lock().unwrap();
            assert_eq!(changes.len(), 1);
            assert_eq!(changes[0].added.len(), 1);
            assert_eq!(changes[0].added[0].id(), task);
            assert_eq!(changes[0].total_count, 1);
        }

        store
            .set_property(&task, "field:priority", json!(2))
            .await
            .unwrap();
        {
            let changes = changes.lock().unwrap();
            assert_eq!(changes.len(), 2);
            assert!(changes[1].added.is_empty());
            assert_eq!(changes[1].changed.len(), 1);
            assert_eq!(changes[1].changed[0].value("field:priority"), Some(&json!(2)));
        }

        store.delete_node(&task).await.unwrap();
        let changes = changes.lock().unwrap();
        assert_eq!(changes.len(), 3);
        assert_eq!(changes[2].removed.len(), 1);
        assert_eq!(changes[2].removed[0].id(), task);
        assert_eq!(changes[2].total_count, 0);
        assert!(changes[2].node_ids.is_empty());
    }

    #[tokio::test]
    async fn test_unrelated_mutations_stay_silent() {
        let (service, store) = create_test_services().await;
        let note = store
            .create_node(CreateNodeParams::new("Unrelated"))
            .await
            .unwrap();

        let (changes, callback) = recorder();
        service.subscribe(tasks(), callback).await.unwrap();
        service.reset_stats();

        store
            .set_property(&note.id, "field:priority", json!(5))
            .await
            .unwrap();
        store
            .update_node_content(&note.id, "Still unrelated")
            .await
            .unwrap();

        assert!(changes.lock().unwrap().is_empty());
        let stats = service.stats();
        assert_eq!(stats.events, 2);
        assert_eq!(stats.evaluations, 0, "smart invalidation skips both events");
        assert_eq!(stats.skipped, 2);
    }

    #[tokio::test]
    async fn test_brute_force_evaluates_every_event() {
        let (service, store) = create_test_services().await;
        service.set_smart_invalidation(false);
        let note = store
            .create_node(CreateNodeParams::new("Unrelated"))
            .await
            .unwrap();

        let (changes, callback) = recorder();
        service.subscribe(tasks(), callback).await.unwrap();
        service.reset_stats();

        store
            .set_property(&note.id, "field:priority", json!(5))
            .await
            .unwrap();

        assert_eq!(service.stats().evaluations, 1);
        assert!(changes.lock().unwrap().is_empty(), "no diff, no callback");
    }

    #[tokio::test]
    async fn test_status_change_end_to_end() {
        let (service, store) = create_test_services().await;
        let task = create_task(&store, "A").await;
        store
            .set_property(&task, "field:status", json!("pending"))
            .await
            .unwrap();

        let events: Arc<Mutex<Vec<MutationEvent>>> = Arc::new(Mutex::new(Vec::new()));
        let sink = events.clone();
        store
            .bus()
            .subscribe(Some(EventFilter::for_field("field:status")), move |e| {
                sink.lock().unwrap().push(e.clone());
                Ok(())
            });

        let (changes, callback) = recorder();
        service.subscribe(tasks(), callback).await.unwrap();

        store
            .set_property(&task, "field:status", json!("done"))
            .await
            .unwrap();

        let changes = changes.lock().unwrap();
        assert_eq!(changes.len(), 1);
        assert_eq!(changes[0].changed.len(), 1);
        assert_eq!(changes[0].changed[0].id(), task);
        assert_eq!(changes[0].changed[0].value("field:status"), Some(&json!("done")));

        let events = events.lock().unwrap();
        assert_eq!(events.len(), 1);
        assert_eq!(events[0].after_value, Some(json!("done")));
        assert_eq!(events[0].before_value, Some(json!("pending")));
    }

    #[tokio::test]
    async fn test_property_filter_membership() {
        let (service, store) = create_test_services().await;
        let task = create_task(&store, "Ship it").await;

        let (changes, callback) = recorder();
        let query = QueryDefinition::new(vec![
            QueryFilter::supertag("supertag:task"),
            QueryFilter::property("field:priority", PropertyOp::Gte, json!(3)),
        ]);
        service.subscribe(query, callback).await.unwrap();

        store
            .set_property(&task, "field:priority", json!(4))
            .await
            .unwrap();
        store
            .set_property(&task, "field:priority", json!(1))
            .await
            .unwrap();

        let changes = changes.lock().unwrap();
        assert_eq!(changes.len(), 2);
        assert_eq!(changes[0].added[0].id(), task);
        assert_eq!(changes[1].removed[0].id(), task);
        assert_eq!(changes[1].removed[0].value("field:priority"), Some(&json!(4)));
    }

    #[tokio::test]
    async fn test_inheritance_changes_are_observed() {
        let (service, store) = create_test_services().await;
        store.create_supertag("supertag:bug", "Bug").await.unwrap();
        let bug = store
            .create_node(CreateNodeParams::new("Crash").with_supertag("supertag:bug"))
            .await
            .unwrap();

        let (changes, callback) = recorder();
        service.subscribe(tasks(), callback).await.unwrap();

        store.set_extends("supertag:bug", "supertag:task").await.unwrap();

        let changes = changes.lock().unwrap();
        assert_eq!(changes.len(), 1);
        assert_eq!(changes[0].added[0].id(), bug.id);
        assert_eq!(
            changes[0].added[0].inherited_supertags,
            vec!["supertag:task".to_string()]
        );
    }

    #[tokio::test]
    async fn test_batching_collapses_rapid_mutations() {
        tokio::time::pause();
        let (service, store) = create_test_services().await;
        let task = create_task(&store, "Counter").await;
        service.set_debounce_ms(10);

        let (changes, callback) = recorder();
        service.subscribe(tasks(), callback).await.unwrap();
        service.reset_stats();

        for i in 0..100 {
            store
                .set_property(&task, "field:priority", json!(i))
                .await
                .unwrap();
        }
        tokio::time::advance(Duration::from_millis(5)).await;
        assert!(changes.lock().unwrap().is_empty(), "window still open");
        assert_eq!(service.stats().evaluations, 0);

        tokio::time::advance(Duration::from_millis(10)).await;
        tokio::time::sleep(Duration::from_millis(1)).await;
        assert_eq!(service.stats().evaluations, 1);
        assert_eq!(service.flush_pending_mutations(), 0, "timer drained the window");

        let changes = changes.lock().unwrap();
        assert_eq!(changes.len(), 1);
        assert_eq!(changes[0].changed[0].value("field:priority"), Some(&json!(99)));
    }

    fn summary(change: &ResultChange) -> [Vec<String>; 4] {
        fn ids(nodes: &[AssembledNode]) -> Vec<String> {
            nodes.iter().map(|n| n.id().to_string()).collect()
        }
        [
            ids(&change.added),
            ids(&change.removed),
            ids(&change.changed),
            change.node_ids.to_vec(),
        ]
    }

    #[tokio::test]
    async fn test_node_local_updates_patch_sorted_results() {
        let (smart, store) = create_test_services().await;
        let queries = Arc::new(QueryService::new(
            store.clone(),
            InheritanceResolver::new(store.clone()),
        ));
        let brute = QuerySubscriptionService::new(queries);
        brute.set_debounce_ms(0);
        brute.set_smart_invalidation(false);

        let mut task_ids = Vec::new();
        for (content, priority) in [("Low", 1), ("Mid", 2), ("High", 3)] {
            let id = create_task(&store, content).await;
            store
                .set_property(&id, "field:priority", json!(priority))
                .await
                .unwrap();
            task_ids.push(id);
        }
        let (low, mid, high) = (&task_ids[0], &task_ids[1], &task_ids[2]);

        let query = QueryDefinition::new(vec![
            QueryFilter::supertag("supertag:task"),
            QueryFilter::property("field:priority", PropertyOp::Gte, json!(2)),
        ])
        .with_sort("field:priority", SortDirection::Descending);
        assert!(query.is_node_local());

        let (patched, callback) = recorder();
        smart.subscribe(query.clone(), callback).await.unwrap();
        let (full, callback) = recorder();
        brute.subscribe(query, callback).await.unwrap();
        smart.reset_stats();

        store.set_property(low, "field:priority", json!(5)).await.unwrap();
        store.set_property(high, "field:priority", json!(0)).await.unwrap();
        store.update_node_content(mid, "Mid, renamed").await.unwrap();
        store.set_property(mid, "field:priority", json!(9)).await.unwrap();
        store.set_property(high, "field:priority", json!(4)).await.unwrap();

        let patched = patched.lock().unwrap();
        let full = full.lock().unwrap();
        assert_eq!(patched.len(), 5);
        assert_eq!(
            patched.iter().map(summary).collect::<Vec<_>>(),
            full.iter().map(summary).collect::<Vec<_>>()
        );
        assert_eq!(summary(&patched[0])[0], vec![low.clone()]);
        assert_eq!(summary(&patched[1])[1], vec![high.clone()]);
        assert_eq!(
            *patched[4].node_ids,
            vec![mid.clone(), low.clone(), high.clone()]
        );
        assert_eq!(patched[4].total_count, 3);

        let stats = smart.stats();
        assert_eq!(stats.evaluations, 5);
        assert_eq!(stats.incremental, 5);
    }

    #[tokio::test]
    async fn test_limited_queries_are_evaluated_in_full() {
        let (service, store) = create_test_services().await;
        let first = create_task(&store, "First").await;
        create_task(&store, "Second").await;

        let (changes, callback) = recorder();
        let query = tasks().with_sort("content", SortDirection::Ascending).with_limit(1);
        service.subscribe(query, callback).await.unwrap();
        service.reset_stats();

        store.update_node_content(&first, "Zeroth").await.unwrap();

        let changes = changes.lock().unwrap();
        assert_eq!(changes.len(), 1);
        assert_eq!(changes[0].removed[0].id(), first);
        assert_eq!(changes[0].total_count, 2);
        assert_eq!(service.stats().incremental, 0);
    }

    #[tokio::test]
    async fn test_zero_debounce_evaluates_per_mutation() {
        let (service, store) = create_test_services().await;
        let task = create_task(&store, "Counter").await;

        let (changes, callback) = recorder();
        service.subscribe(tasks(), callback).await.unwrap();
        service.reset_stats();

        for i in 0..100 {
            store
                .set_property(&task, "field:priority", json!(i))
                .await
                .unwrap();
        }

        assert_eq!(service.stats().evaluations, 100);
        assert_eq!(changes.lock().unwrap().len(), 100);
    }

    #[tokio::test(start_paused = true)]
    async fn test_debounce_timer_flushes_window() {
        let (service, store) = create_test_services().await;
        service.set_debounce_ms(10);

        let (changes, callback) = recorder();
        service.subscribe(tasks(), callback).await.unwrap();

        create_task(&store, "One").await;
        create_task(&store, "Two").await;
        assert!(changes.lock().unwrap().is_empty());

        tokio::time::sleep(Duration::from_millis(50)).await;

        let changes = changes.lock().unwrap();
        assert_eq!(changes.len(), 1);
        assert_eq!(changes[0].added.len(), 2);
    }

    #[tokio::test(start_paused = true)]
    async fn test_unsubscribe_mid_window_is_safe() {
        let (service, store) = create_test_services().await;
        service.set_debounce_ms(10);

        let (changes, callback) = recorder();
        let handle = service.subscribe(tasks(), callback).await.unwrap();

        create_task(&store, "Pending").await;
        handle.unsubscribe().unwrap();
        tokio::time::sleep(Duration::from_millis(50)).await;

        assert!(changes.lock().unwrap().is_empty());
        assert_eq!(service.subscription_count(), 0);
        assert!(matches!(
            handle.unsubscribe(),
            Err(GraphError::StaleSubscription { .. })
        ));
        assert!(handle.current_node_ids().is_err());
    }

    #[tokio::test]
    async fn test_failing_callback_does_not_block_others() {
        let (service, store) = create_test_services().await;
        service
            .subscribe(tasks(), |_| anyhow::bail!("subscriber failure"))
            .await
            .unwrap();
        service
            .subscribe(tasks(), |_| panic!("subscriber panic"))
            .await
            .unwrap();
        let (changes, callback) = recorder();
        let handle = service.subscribe(tasks(), callback).await.unwrap();

        let task = create_task(&store, "Resilient").await;

        assert_eq!(changes.lock().unwrap().len(), 1);
        assert_eq!(*handle.current_node_ids().unwrap(), vec![task]);
    }

    #[tokio::test]
    async fn test_invalid_query_is_rejected() {
        let (service, _store) = create_test_services().await;
        let query = QueryDefinition::new(vec![QueryFilter::property(
            "field:priority",
            PropertyOp::Gt,
            json!({"nested": true}),
        )]);
        let result = service.subscribe(query, |_| Ok(())).await;
        assert!(matches!(result, Err(GraphError::Validation(_))));
    }
}
