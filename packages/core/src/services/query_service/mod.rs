//! Query Service - Filter Tree Evaluation over the Working Set
//!
//! This module evaluates structured query definitions against the node
//! store's in-memory indexes and materializes matching nodes.
//!
//! # Architecture
//!
//! - **Set algebra**: every filter denotes a set of live node ids; AND is
//!   intersection, OR is union, NOT is complement against all live nodes
//! - **Index-backed candidates**: the narrowest supertag, field, owner or
//!   value index among the conjuncts bounds the scan, and each candidate is
//!   tested against the whole filter tree
//! - **Deterministic order**: results are sorted with a node id tie-break and
//!   limited after sorting
//!
//! # Examples
//!
//! ```rust,no_run
//! use semgraph_core::services::query_service::{PropertyOp, QueryDefinition, QueryFilter, SortDirection};
//! use serde_json::json;
//!
//! # fn example(graph: &semgraph_core::services::GraphContext) -> anyhow::Result<()> {
//! let query = QueryDefinition::new(vec![
//!     QueryFilter::supertag("supertag:task"),
//!     QueryFilter::property("field:status", PropertyOp::Neq, json!("done")),
//! ])
//! .with_sort("createdAt", SortDirection::Descending)
//! .with_limit(50);
//!
//! let result = graph.queries().evaluate_query(&query)?;
//! println!("{} open tasks", result.total_count);
//! # Ok(())
//! # }
//! ```

mod definition;
mod evaluator;


pub use definition::{
    PropertyOp, QueryDefinition, QueryFilter, QueryReferences, RelationType, SortConfig,
    SortDirection, TemporalField, TemporalOp,
};

use crate::db::{NodeStore, StoreState};
use crate::models::AssembledNode;
use crate::services::error::GraphError;
use crate::services::inheritance::InheritanceResolver;
use chrono::{DateTime, Utc};
use evaluator::Evaluator;
use serde::{Deserialize, Serialize};
use std::collections::BTreeSet;
use std::sync::Arc;

/// Result of evaluating a query
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
#[serde(rename_all = "camelCase")]
pub struct QueryResult {
    /// Matching nodes after sort and limit
    pub nodes: Vec<AssembledNode>,
    /// Number of matching nodes before `limit`
    pub total_count: usize,
    pub evaluated_at: DateTime<Utc>,
}

/// Ordered ids of a query's result set
#[derive(Debug, Clone, PartialEq)]
pub(crate) struct EvaluatedIds {
    pub(crate) ids: Vec<String>,
    pub(crate) total_count: usize,
}

/// Service for evaluating queries against the node store
pub struct QueryService {
    store: Arc<NodeStore>,
    resolver: Arc<InheritanceResolver>,
}

impl QueryService {
    pub fn new(store: Arc<NodeStore>, resolver: Arc<InheritanceResolver>) -> Self {
        Self { store, resolver }
    }

    pub fn store(&self) -> &Arc<NodeStore> {
        &self.store
    }

    pub fn resolver(&self) -> &Arc<InheritanceResolver> {
        &self.resolver
    }

    /// Evaluate a query and return matching nodes
    ///
    /// # Errors
    ///
    /// Returns `GraphError::Validation` if the definition is malformed
    /// (e.g. an ordering operator applied to an object, or a `within` filter
    /// without a day count).
    pub fn evaluate_query(&self, definition: &QueryDefinition) -> Result<QueryResult, GraphError> {
        definition.validate()?;

        let state = self.store.read();
        let now = Utc::now();
        let evaluated = self.evaluate_ids_in(&state, definition, now);
        let nodes = evaluated
            .ids
            .iter()
            .filter_map(|id| self.assemble_in(&state, id))
            .collect();

        Ok(QueryResult {
            nodes,
            total_count: evaluated.total_count,
            evaluated_at: now,
        })
    }

    /// Ids of matching nodes, sorted and limited. Assumes a validated
    /// definition.
    pub(crate) fn evaluate_ids_in(
        &self,
        state: &StoreState,
        definition: &QueryDefinition,
        now: DateTime<Utc>,
    ) -> EvaluatedIds {
        let evaluator = self.evaluator(state, now);

        // Matches come back in id order
        let mut ids = evaluator.matching(&definition.filters);
        let total_count = ids.len();

        if let Some(sort) = &definition.sort {
            evaluator.sort(&mut ids, sort);
        }
        if let Some(limit) = definition.limit {
            ids.truncate(limit);
        }

        EvaluatedIds {
            ids: ids.into_iter().map(str::to_string).collect(),
            total_count,
        }
    }

    /// The ids among `node_ids` that are live and match the filters, ignoring
    /// sort and limit.
    pub(crate) fn matching_of_in<'n>(
        &self,
        state: &StoreState,
        definition: &QueryDefinition,
        node_ids: &'n BTreeSet<String>,
        now: DateTime<Utc>,
    ) -> BTreeSet<&'n str> {
        self.evaluator(state, now)
            .matching_of(&definition.filters, node_ids)
    }

    /// Index at which `node_id` belongs in `ids`, an unlimited result of the
    /// same definition.
    pub(crate) fn position_in(
        &self,
        state: &StoreState,
        definition: &QueryDefinition,
        ids: &[String],
        node_id: &str,
    ) -> usize {
        self.evaluator(state, Utc::now())
            .position(ids, node_id, definition.sort.as_ref())
    }

    fn evaluator<'s>(&'s self, state: &'s StoreState, now: DateTime<Utc>) -> Evaluator<'s> {
        Evaluator {
            state,
            resolver: &self.resolver,
            now,
        }
    }

    /// Materialize a live node with its supertags and grouped properties.
    pub fn assemble_node(&self, node_id: &str) -> Option<AssembledNode> {
        let state = self.store.read();
        self.assemble_in(&state, node_id)
    }

    pub(crate) fn assemble_in(&self, state: &StoreState, node_id: &str) -> Option<AssembledNode> {
        let node = state.live_node(node_id)?.clone();
        let supertags = state
            .direct_supertags(node_id)
            .iter()
            .map(|id| state.reference_key(id))
            .collect();
        let inherited_supertags = self
            .resolver
            .inherited_supertags_in(state, node_id)
            .iter()
            .map(|id| state.reference_key(id))
            .collect();

        Some(AssembledNode {
            node,
            supertags,
            inherited_supertags,
            properties: state.property_map(node_id),
        })
    }
}
