//! Persistence Tests
//!
//! Graphs opened over a libsql file in a temporary directory, closed and
//! reopened: nodes, property order, soft deletes, stored computed fields and
//! automation trigger state must all survive.

#[cfg(test)]
mod persistence_tests {
    use anyhow::Result;
    use semgraph_core::services::automation::{
        AutomationAction, AutomationDefinition, AutomationTrigger, InMemoryJobQueue,
        ThresholdCondition, ThresholdOperator,
    };
    use semgraph_core::services::computed_field_service::{Aggregation, ComputedFieldDefinition};
    use semgraph_core::services::{GraphContext, QueryDefinition, QueryFilter};
    use semgraph_core::{CreateNodeParams, GraphConfig};
    use serde_json::json;
    use std::path::Path;
    use std::sync::Arc;
    use tempfile::TempDir;

    fn config_for(path: &Path) -> GraphConfig {
        GraphConfig {
            debounce_ms: 0,
            spawn_action_worker: false,
            ..GraphConfig::with_database(path)
        }
    }

    async fn open(path: &Path) -> Result<(GraphContext, Arc<InMemoryJobQueue>)> {
        let jobs = Arc::new(InMemoryJobQueue::new());
        let graph = GraphContext::open(config_for(path), jobs.clone()).await?;
        Ok((graph, jobs))
    }

    #[tokio::test]
    async fn test_nodes_survive_reopen() -> Result<()> {
        let temp_dir = TempDir::new()?;
        let db_path = temp_dir.path().join("graph.db");

        let (graph, _) = open(&db_path).await?;
        let store = graph.store();
        store.create_supertag("supertag:task", "Task").await?;
        let parent = store.create_node(CreateNodeParams::new("Project")).await?;
        let task = store
            .create_node(
                CreateNodeParams::new("Ship it")
                    .with_supertag("supertag:task")
                    .with_owner(parent.id.clone()),
            )
            .await?;
        store.set_property(&task.id, "field:tags", json!("urgent")).await?;
        store.add_property_value(&task.id, "field:tags", json!("backend")).await?;
        store.add_property_value(&task.id, "field:tags", json!({"label": "q3"})).await?;
        let doomed = store.create_node(CreateNodeParams::new("Scratch")).await?;
        store.delete_node(&doomed.id).await?;
        let live_count = store.node_count();
        graph.shutdown().await?;

        let (graph, _) = open(&db_path).await?;
        let store = graph.store();
        assert_eq!(store.node_count(), live_count);
        assert!(store.find_node_by_id(&doomed.id).is_none());

        let reopened = store.find_node_by_id(&task.id).unwrap();
        assert_eq!(reopened.content.as_deref(), Some("Ship it"));
        assert_eq!(reopened.owner_id.as_deref(), Some(parent.id.as_str()));
        assert_eq!(
            store.get_property_values(&task.id, "field:tags"),
            vec![json!("urgent"), json!("backend"), json!({"label": "q3"})]
        );

        let tasks = graph
            .queries()
            .evaluate_query(&QueryDefinition::new(vec![QueryFilter::supertag("supertag:task")]))?;
        assert_eq!(tasks.total_count, 1);
        assert_eq!(tasks.nodes[0].id(), task.id);
        graph.shutdown().await?;
        Ok(())
    }

    #[tokio::test]
    async fn test_bootstrap_is_idempotent_across_reopen() -> Result<()> {
        let temp_dir = TempDir::new()?;
        let db_path = temp_dir.path().join("nested").join("graph.db");

        let (graph, _) = open(&db_path).await?;
        let seeded = graph.store().node_count();
        graph.shutdown().await?;

        let (graph, _) = open(&db_path).await?;
        assert_eq!(graph.store().node_count(), seeded);
        assert_eq!(graph.store().bootstrap().await?, 0);
        graph.shutdown().await?;
        Ok(())
    }

    /// Expense tracking: a stored SUM computed field and a stored threshold
    /// automation posting a webhook when the budget goes over 5.
    async fn seed_budget(graph: &GraphContext) -> Result<String> {
        let store = graph.store();
        store.create_supertag("supertag:expense", "Expense").await?;

        let computed = store
            .create_node(
                CreateNodeParams::new("Budget")
                    .with_supertag("supertag:computed-field")
                    .with_system_id("computed:budget"),
            )
            .await?;
        let definition = ComputedFieldDefinition::new(
            Aggregation::Sum,
            QueryDefinition::new(vec![QueryFilter::supertag("supertag:expense")]),
        )
        .with_field("field:amount");
        store
            .set_property(
                &computed.id,
                "field:computed-definition",
                serde_json::to_value(&definition)?,
            )
            .await?;

        let automation = store
            .create_node(
                CreateNodeParams::new("Over budget")
                    .with_supertag("supertag:automation")
                    .with_system_id("automation:over-budget"),
            )
            .await?;
        let definition = AutomationDefinition {
            name: "Over budget".to_string(),
            trigger: AutomationTrigger::Threshold {
                computed_field_id: "computed:budget".to_string(),
                condition: ThresholdCondition {
                    operator: ThresholdOperator::Gt,
                    value: 5.0,
                },
                fire_once: true,
            },
            action: AutomationAction::Webhook {
                url: "https://hooks.example.com/budget".to_string(),
                method: "post".to_string(),
                headers: None,
                body: Some(json!({ "total": "{{computedField.value}}" })),
            },
            enabled: true,
        };
        store
            .set_property(
                &automation.id,
                "field:automation-definition",
                serde_json::to_value(&definition)?,
            )
            .await?;

        let expense = store
            .create_node(CreateNodeParams::new("Coffee").with_supertag("supertag:expense"))
            .await?;
        store.set_property(&expense.id, "field:amount", json!(4)).await?;

        // Stored definitions are picked up on open
        assert_eq!(graph.computed_fields().load_from_store().await?, 1);
        assert_eq!(graph.automations().load_from_store().await?, 1);
        Ok(expense.id)
    }

    #[tokio::test]
    async fn test_threshold_state_survives_reopen() -> Result<()> {
        let temp_dir = TempDir::new()?;
        let db_path = temp_dir.path().join("graph.db");

        let (graph, jobs) = open(&db_path).await?;
        let expense = seed_budget(&graph).await?;
        assert_eq!(graph.computed_fields().value("computed:budget"), Some(4.0));

        graph.store().set_property(&expense, "field:amount", json!(6)).await?;
        graph.store().set_property(&expense, "field:amount", json!(7)).await?;
        graph.shutdown().await?;

        let fired = jobs.jobs();
        assert_eq!(fired.len(), 1);
        assert_eq!(fired[0].method, "POST");
        assert_eq!(fired[0].body, Some(json!({ "total": "6" })));

        // Still over budget after the restart: no second webhook
        let (graph, jobs) = open(&db_path).await?;
        assert_eq!(graph.computed_fields().value("computed:budget"), Some(7.0));
        assert_eq!(graph.automations().ids(), vec!["automation:over-budget".to_string()]);
        let state = graph.automations().get_state("automation:over-budget").unwrap();
        assert!(state.threshold_crossed);
        assert_eq!(state.previous_value, Some(7.0));
        graph.automations().run_pending_actions().await;
        assert!(jobs.jobs().is_empty());

        // Dropping below re-arms the trigger
        graph.store().set_property(&expense, "field:amount", json!(2)).await?;
        graph.store().set_property(&expense, "field:amount", json!(9)).await?;
        graph.shutdown().await?;

        let fired = jobs.jobs();
        assert_eq!(fired.len(), 1);
        assert_eq!(fired[0].body, Some(json!({ "total": "9" })));
        Ok(())
    }

    #[tokio::test]
    async fn test_threshold_crossed_while_closed_fires_on_open() -> Result<()> {
        let temp_dir = TempDir::new()?;
        let db_path = temp_dir.path().join("graph.db");

        let (graph, jobs) = open(&db_path).await?;
        let expense = seed_budget(&graph).await?;
        graph.shutdown().await?;
        assert!(jobs.jobs().is_empty());

        // Write while no automation is listening
        let (quiet, _) = open(&db_path).await?;
        assert!(quiet.automations().unregister("automation:over-budget"));
        quiet.store().set_property(&expense, "field:amount", json!(8)).await?;
        quiet.shutdown().await?;

        let (graph, jobs) = open(&db_path).await?;
        graph.automations().run_pending_actions().await;
        let fired = jobs.jobs();
        assert_eq!(fired.len(), 1);
        assert_eq!(fired[0].body, Some(json!({ "total": "8" })));
        graph.shutdown().await?;
        Ok(())
    }
}
