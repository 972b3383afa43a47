//! Graph Services
//!
//! This module contains the services layered on the node store:
//!
//! - `InheritanceResolver` - Transitive `extends` closures over supertags
//! - `QueryService` - One-shot evaluation of declarative query definitions
//! - `QuerySubscriptionService` - Live queries with result diffs, smart
//!   invalidation and batched re-evaluation
//! - `ComputedFieldService` - Live aggregates over query results
//! - `AutomationEngine` - Trigger/action rules on membership and thresholds
//! - `GraphContext` - Owner of a store and all of its services
//!
//! Services never hold the store's read lock while invoking callbacks, and
//! callbacks never write to the store directly.

pub mod automation;
pub mod computed_field_service;
pub mod error;
pub mod graph_context;
pub mod inheritance;
pub mod query_service;
pub mod subscription_service;

pub use automation::{
    AutomationAction, AutomationDefinition, AutomationEngine, AutomationState, AutomationTrigger,
    InMemoryJobQueue, JobQueue, WebhookJob,
};
pub use computed_field_service::{
    Aggregation, ComputedFieldDefinition, ComputedFieldService, ComputedValue,
};
pub use error::GraphError;
pub use graph_context::GraphContext;
pub use inheritance::InheritanceResolver;
pub use query_service::{QueryDefinition, QueryFilter, QueryResult, QueryService};
pub use subscription_service::{QuerySubscriptionService, ResultChange, SubscriptionHandle};
