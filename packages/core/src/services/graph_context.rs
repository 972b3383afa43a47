//! Graph Context
//!
//! Owns one graph: the node store and every service layered on it. There are
//! no process globals; two contexts over different backends are fully
//! independent.
//!
//! Services are wired in dependency order:
//!
//! 1. `NodeStore` over the configured backend (libsql file or in-memory)
//! 2. `InheritanceResolver`, attached to the event bus before any subscriber
//!    so closures are invalidated before queries re-run
//! 3. `QueryService` and `QuerySubscriptionService`
//! 4. `ComputedFieldService`, then `AutomationEngine`; stored computed fields
//!    are loaded before stored automations that watch them

use crate::config::GraphConfig;
use crate::db::{EventBus, MemoryBackend, NodeStore, StorageBackend, TursoBackend};
use crate::services::automation::{AutomationEngine, JobQueue};
use crate::services::computed_field_service::ComputedFieldService;
use crate::services::error::GraphError;
use crate::services::inheritance::InheritanceResolver;
use crate::services::query_service::QueryService;
use crate::services::subscription_service::QuerySubscriptionService;
use std::sync::atomic::{AtomicBool, Ordering};
use std::sync::Arc;

pub struct GraphContext {
    config: GraphConfig,
    store: Arc<NodeStore>,
    resolver: Arc<InheritanceResolver>,
    queries: Arc<QueryService>,
    subscriptions: Arc<QuerySubscriptionService>,
    computed_fields: Arc<ComputedFieldService>,
    automations: Arc<AutomationEngine>,
    closed: AtomicBool,
}

impl GraphContext {
    /// Open the graph described by `config`.
    ///
    /// Webhook actions are handed to `job_queue`.
    ///
    /// # Errors
    ///
    /// - `InvalidConfig` when the configuration is rejected
    /// - `Database` when the libsql file cannot be opened or loaded
    pub async fn open(config: GraphConfig, job_queue: Arc<dyn JobQueue>) -> Result<Self, GraphError> {
        config.validate()?;
        let backend: Arc<dyn StorageBackend> = match &config.database_path {
            Some(path) => Arc::new(TursoBackend::open(path).await?),
            None => Arc::new(MemoryBackend::new()),
        };
        Self::with_backend(config, backend, job_queue).await
    }

    /// Open a graph over an existing backend.
    pub async fn with_backend(
        config: GraphConfig,
        backend: Arc<dyn StorageBackend>,
        job_queue: Arc<dyn JobQueue>,
    ) -> Result<Self, GraphError> {
        config.validate()?;

        let store = NodeStore::open(backend, EventBus::new()).await?;
        if config.bootstrap {
            let seeded = store.bootstrap().await?;
            if seeded > 0 {
                tracing::info!("Seeded {} built-in nodes", seeded);
            }
        }

        let resolver = InheritanceResolver::new(store.clone());
        let queries = Arc::new(QueryService::new(store.clone(), resolver.clone()));
        let subscriptions = QuerySubscriptionService::new(queries.clone());
        subscriptions.set_smart_invalidation(config.smart_invalidation);
        subscriptions.set_debounce_ms(config.debounce_ms);

        let computed_fields = ComputedFieldService::new(subscriptions.clone());
        let automations = AutomationEngine::new(
            subscriptions.clone(),
            computed_fields.clone(),
            job_queue,
            config.action_queue_capacity,
        );

        computed_fields.load_from_store().await?;
        automations.load_from_store().await?;
        if config.spawn_action_worker {
            automations.spawn_worker();
        }

        tracing::info!(
            "Graph ready: {} nodes, {} computed fields, {} automations",
            store.node_count(),
            computed_fields.ids().len(),
            automations.ids().len()
        );

        Ok(Self {
            config,
            store,
            resolver,
            queries,
            subscriptions,
            computed_fields,
            automations,
            closed: AtomicBool::new(false),
        })
    }

    pub fn config(&self) -> &GraphConfig {
        &self.config
    }

    pub fn store(&self) -> &Arc<NodeStore> {
        &self.store
    }

    pub fn resolver(&self) -> &Arc<InheritanceResolver> {
        &self.resolver
    }

    pub fn queries(&self) -> &Arc<QueryService> {
        &self.queries
    }

    pub fn subscriptions(&self) -> &Arc<QuerySubscriptionService> {
        &self.subscriptions
    }

    pub fn computed_fields(&self) -> &Arc<ComputedFieldService> {
        &self.computed_fields
    }

    pub fn automations(&self) -> &Arc<AutomationEngine> {
        &self.automations
    }

    /// Flush pending subscription batches, run queued actions, stop the
    /// action worker and close the backend.
    ///
    /// Idempotent. Services must not be used afterwards.
    pub async fn shutdown(&self) -> Result<(), GraphError> {
        if self.closed.swap(true, Ordering::SeqCst) {
            return Ok(());
        }

        {
            let _gate = self.store.exclusive().await;
            self.subscriptions.flush_pending_mutations();
        }
        self.automations.shutdown().await;
        self.subscriptions.shutdown();
        self.resolver.detach();
        self.store.backend().close().await?;

        tracing::info!("Graph closed");
        Ok(())
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::models::CreateNodeParams;
    use crate::services::automation::{
        AutomationAction, AutomationDefinition, AutomationTrigger, InMemoryJobQueue,
        MembershipEvent,
    };
    use crate::services::query_service::{QueryDefinition, QueryFilter};
    use serde_json::json;

    fn test_config() -> GraphConfig {
        GraphConfig {
            debounce_ms: 0,
            spawn_action_worker: false,
            ..GraphConfig::in_memory()
        }
    }

    #[tokio::test]
    async fn test_open_in_memory_bootstraps() {
        let graph = GraphContext::open(test_config(), Arc::new(InMemoryJobQueue::new()))
            .await
            .unwrap();
        assert!(graph.store().find_node_by_system_id("supertag:task").is_none());
        assert!(graph.store().find_node_by_system_id("field:supertag").is_some());
        assert!(graph.subscriptions().smart_invalidation());
        graph.shutdown().await.unwrap();
        graph.shutdown().await.unwrap();
    }

    #[tokio::test]
    async fn test_invalid_config_is_rejected() {
        let config = GraphConfig {
            action_queue_capacity: 0,
            ..test_config()
        };
        let result = GraphContext::open(config, Arc::new(InMemoryJobQueue::new())).await;
        assert!(matches!(result, Err(GraphError::InvalidConfig(_))));
    }

    #[tokio::test]
    async fn test_services_share_one_store() {
        let jobs = Arc::new(InMemoryJobQueue::new());
        let graph = GraphContext::open(test_config(), jobs.clone()).await.unwrap();
        graph
            .store()
            .create_supertag("supertag:task", "Task")
            .await
            .unwrap();
        graph
            .automations()
            .register(
                "announce",
                AutomationDefinition {
                    name: "Announce tasks".to_string(),
                    trigger: AutomationTrigger::QueryMembership {
                        query_definition: QueryDefinition::new(vec![QueryFilter::supertag(
                            "supertag:task",
                        )]),
                        event: MembershipEvent::OnEnter,
                    },
                    action: AutomationAction::Webhook {
                        url: "https://hooks.example.com/tasks".to_string(),
                        method: "POST".to_string(),
                        headers: None,
                        body: Some(json!({ "title": "{{node.content}}" })),
                    },
                    enabled: true,
                },
            )
            .await
            .unwrap();

        graph
            .store()
            .create_node(CreateNodeParams::new("Plan launch").with_supertag("supertag:task"))
            .await
            .unwrap();
        let result = graph
            .queries()
            .evaluate_query(&QueryDefinition::new(vec![QueryFilter::supertag("supertag:task")]))
            .unwrap();
        assert_eq!(result.total_count, 1);

        // Queued actions run on shutdown
        graph.shutdown().await.unwrap();
        let jobs = jobs.jobs();
        assert_eq!(jobs.len(), 1);
        assert_eq!(jobs[0].body.as_ref().unwrap()["title"], "Plan launch");
    }
}
