//! Computed Field Service
//!
//! Live aggregates (SUM, COUNT, AVG, MIN, MAX) over a query's result set.
//! Each computed field owns one query subscription; whenever its result
//! changes the aggregate is recomputed and stored, so readers get the current
//! value synchronously.
//!
//! Aggregates other than COUNT read the numeric values of `fieldId` on every
//! matching node and ignore everything else. An empty SUM is `0`; an empty
//! AVG, MIN or MAX has no value.
//!
//! Update listeners (threshold automations) are notified whenever a stored
//! value changes.

use crate::db::ListenerId;
use crate::models::system::{FIELD_COMPUTED_DEFINITION, SUPERTAG_COMPUTED_FIELD};
use crate::models::ValidationError;
use crate::services::error::GraphError;
use crate::services::query_service::QueryDefinition;
use crate::services::subscription_service::{
    QuerySubscriptionService, ResultChange, SubscriptionHandle,
};
use chrono::{DateTime, Utc};
use serde::{Deserialize, Serialize};
use serde_json::Value;
use std::collections::HashMap;
use std::panic::{catch_unwind, AssertUnwindSafe};
use std::sync::atomic::{AtomicU64, Ordering};
use std::sync::{Arc, Mutex, PoisonError, RwLock, Weak};

/// Aggregation function of a computed field
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "UPPERCASE")]
pub enum Aggregation {
    Sum,
    Count,
    Avg,
    Min,
    Max,
}

impl Aggregation {
    /// Aggregate numeric inputs. `count` is the size of the result set.
    pub fn apply(&self, count: usize, numbers: &[f64]) -> Option<f64> {
        match self {
            Self::Count => Some(count as f64),
            Self::Sum => Some(numbers.iter().sum()),
            Self::Avg if numbers.is_empty() => None,
            Self::Avg => Some(numbers.iter().sum::<f64>() / numbers.len() as f64),
            Self::Min => numbers.iter().copied().reduce(f64::min),
            Self::Max => numbers.iter().copied().reduce(f64::max),
        }
    }
}

/// Stored definition of a computed field
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
#[serde(rename_all = "camelCase")]
pub struct ComputedFieldDefinition {
    pub aggregation: Aggregation,
    pub query: QueryDefinition,
    /// Field aggregated over; required for everything but COUNT
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub field_id: Option<String>,
    /// Node the aggregate belongs to
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub parent_node_id: Option<String>,
}

impl ComputedFieldDefinition {
    pub fn new(aggregation: Aggregation, query: QueryDefinition) -> Self {
        Self {
            aggregation,
            query,
            field_id: None,
            parent_node_id: None,
        }
    }

    pub fn with_field(mut self, field_id: impl Into<String>) -> Self {
        self.field_id = Some(field_id.into());
        self
    }

    pub fn with_parent(mut self, parent_node_id: impl Into<String>) -> Self {
        self.parent_node_id = Some(parent_node_id.into());
        self
    }

    pub fn validate(&self) -> Result<(), ValidationError> {
        self.query.validate()?;
        if self.aggregation != Aggregation::Count
            && self.field_id.as_deref().map_or(true, |f| f.trim().is_empty())
        {
            return Err(ValidationError::MissingField("fieldId".to_string()));
        }
        Ok(())
    }
}

/// Current value of a computed field
#[derive(Debug, Clone, Copy, PartialEq, Serialize, Deserialize)]
#[serde(rename_all = "camelCase")]
pub struct ComputedValue {
    pub value: Option<f64>,
    pub updated_at: DateTime<Utc>,
}

/// Notification sent to update listeners
#[derive(Debug, Clone, PartialEq)]
pub struct ComputedFieldUpdate {
    pub computed_field_id: String,
    pub previous: Option<f64>,
    pub value: Option<f64>,
    pub parent_node_id: Option<String>,
    pub updated_at: DateTime<Utc>,
}

pub type ComputedFieldListener = Arc<dyn Fn(&ComputedFieldUpdate) + Send + Sync>;

struct ComputedField {
    definition: ComputedFieldDefinition,
    current: Mutex<ComputedValue>,
    handle: SubscriptionHandle,
}

/// Registry of live computed fields
pub struct ComputedFieldService {
    subscriptions: Arc<QuerySubscriptionService>,
    fields: RwLock<HashMap<String, Arc<ComputedField>>>,
    listeners: RwLock<Vec<(ListenerId, ComputedFieldListener)>>,
    next_listener_id: AtomicU64,
}

impl ComputedFieldService {
    pub fn new(subscriptions: Arc<QuerySubscriptionService>) -> Arc<Self> {
        Arc::new(Self {
            subscriptions,
            fields: RwLock::new(HashMap::new()),
            listeners: RwLock::new(Vec::new()),
            next_listener_id: AtomicU64::new(1),
        })
    }

    /// Register (or replace) a computed field and compute its initial value.
    ///
    /// # Errors
    ///
    /// Returns `GraphError::Validation` for a malformed definition.
    pub async fn register(
        self: &Arc<Self>,
        id: impl Into<String>,
        definition: ComputedFieldDefinition,
    ) -> Result<ComputedValue, GraphError> {
        let _gate = self.subscriptions.queries().store().exclusive().await;
        self.register_locked(id.into(), definition)
    }

    pub(crate) fn register_locked(
        self: &Arc<Self>,
        id: String,
        definition: ComputedFieldDefinition,
    ) -> Result<ComputedValue, GraphError> {
        definition.validate()?;
        self.unregister(&id);

        let weak: Weak<Self> = Arc::downgrade(self);
        let field_id = id.clone();
        let handle = self.subscriptions.subscribe_locked(
            definition.query.clone(),
            Arc::new(move |change: &ResultChange| {
                if let Some(service) = weak.upgrade() {
                    service.recompute(&field_id, &change.node_ids);
                }
                Ok(())
            }),
        )?;

        let ids = handle.current_node_ids()?;
        let current = ComputedValue {
            value: self.aggregate(&definition, &ids),
            updated_at: Utc::now(),
        };
        tracing::debug!(
            "Computed field {} registered: {:?} = {:?}",
            id,
            definition.aggregation,
            current.value
        );

        self.fields
            .write()
            .unwrap_or_else(PoisonError::into_inner)
            .insert(
                id,
                Arc::new(ComputedField {
                    definition,
                    current: Mutex::new(current),
                    handle,
                }),
            );
        Ok(current)
    }

    /// Remove a computed field and its subscription. Returns false when
    /// unknown.
    pub fn unregister(&self, id: &str) -> bool {
        let removed = self
            .fields
            .write()
            .unwrap_or_else(PoisonError::into_inner)
            .remove(id);
        match removed {
            Some(field) => {
                if let Err(e) = field.handle.unsubscribe() {
                    tracing::debug!("Computed field {} subscription already gone: {}", id, e);
                }
                true
            }
            None => false,
        }
    }

    /// Register every definition stored on `supertag:computed-field` nodes,
    /// keyed by the node's reference key. Malformed definitions are logged and
    /// skipped.
    pub async fn load_from_store(self: &Arc<Self>) -> Result<usize, GraphError> {
        let store = self.subscriptions.queries().store().clone();
        let _gate = store.exclusive().await;

        let stored: Vec<(String, Value)> = {
            let state = store.read();
            state
                .resolve_ref(SUPERTAG_COMPUTED_FIELD)
                .and_then(|tag| state.tagged_with(&tag.id))
                .into_iter()
                .flatten()
                .filter_map(|node_id| {
                    let field = state.resolve_ref(FIELD_COMPUTED_DEFINITION)?;
                    let value = state.values(node_id, &field.id).into_iter().next()?;
                    Some((state.reference_key(node_id), value))
                })
                .collect()
        };

        let mut loaded = 0;
        for (id, value) in stored {
            let definition = match parse_definition(value) {
                Ok(definition) => definition,
                Err(e) => {
                    tracing::warn!("Skipping computed field {}: {}", id, e);
                    continue;
                }
            };
            match self.register_locked(id.clone(), definition) {
                Ok(_) => loaded += 1,
                Err(e) => tracing::warn!("Skipping computed field {}: {}", id, e),
            }
        }
        if loaded > 0 {
            tracing::info!("Loaded {} computed fields", loaded);
        }
        Ok(loaded)
    }

    //
    // READS
    //

    /// Current value and timestamp of a computed field
    pub fn get(&self, id: &str) -> Option<ComputedValue> {
        let field = self.field(id)?;
        let current = *field.current.lock().unwrap_or_else(PoisonError::into_inner);
        Some(current)
    }

    /// Current value; `None` for unknown fields and empty AVG/MIN/MAX.
    pub fn value(&self, id: &str) -> Option<f64> {
        self.get(id).and_then(|c| c.value)
    }

    pub fn definition(&self, id: &str) -> Option<ComputedFieldDefinition> {
        self.field(id).map(|f| f.definition.clone())
    }

    pub fn ids(&self) -> Vec<String> {
        let mut ids: Vec<String> = self
            .fields
            .read()
            .unwrap_or_else(PoisonError::into_inner)
            .keys()
            .cloned()
            .collect();
        ids.sort();
        ids
    }

    fn field(&self, id: &str) -> Option<Arc<ComputedField>> {
        self.fields
            .read()
            .unwrap_or_else(PoisonError::into_inner)
            .get(id)
            .cloned()
    }

    //
    // LISTENERS
    //

    /// Listen for value changes of every computed field.
    pub fn on_update<F>(&self, listener: F) -> ListenerId
    where
        F: Fn(&ComputedFieldUpdate) + Send + Sync + 'static,
    {
        let id = self.next_listener_id.fetch_add(1, Ordering::SeqCst);
        self.listeners
            .write()
            .unwrap_or_else(PoisonError::into_inner)
            .push((id, Arc::new(listener)));
        id
    }

    pub fn remove_listener(&self, id: ListenerId) -> bool {
        let mut listeners = self.listeners.write().unwrap_or_else(PoisonError::into_inner);
        let before = listeners.len();
        listeners.retain(|(listener_id, _)| *listener_id != id);
        listeners.len() != before
    }

    //
    // EVALUATION
    //

    fn recompute(&self, id: &str, node_ids: &[String]) {
        let Some(field) = self.field(id) else {
            return;
        };
        let value = self.aggregate(&field.definition, node_ids);
        let updated_at = Utc::now();

        let previous = {
            let mut current = field.current.lock().unwrap_or_else(PoisonError::into_inner);
            let previous = current.value;
            *current = ComputedValue { value, updated_at };
            previous
        };
        if previous == value {
            return;
        }

        tracing::debug!("Computed field {}: {:?} -> {:?}", id, previous, value);
        let update = ComputedFieldUpdate {
            computed_field_id: id.to_string(),
            previous,
            value,
            parent_node_id: field.definition.parent_node_id.clone(),
            updated_at,
        };
        let listeners: Vec<ComputedFieldListener> = self
            .listeners
            .read()
            .unwrap_or_else(PoisonError::into_inner)
            .iter()
            .map(|(_, listener)| listener.clone())
            .collect();
        for listener in listeners {
            if catch_unwind(AssertUnwindSafe(|| listener(&update))).is_err() {
                tracing::error!("Computed field listener panicked on {}", id);
            }
        }
    }

    fn aggregate(&self, definition: &ComputedFieldDefinition, node_ids: &[String]) -> Option<f64> {
        if definition.aggregation == Aggregation::Count {
            return definition.aggregation.apply(node_ids.len(), &[]);
        }

        let store = self.subscriptions.queries().store();
        let state = store.read();
        let field_id = definition
            .field_id
            .as_deref()
            .and_then(|f| state.resolve_ref(f))
            .map(|f| f.id.clone());
        let numbers: Vec<f64> = match field_id {
            Some(field_id) => node_ids
                .iter()
                .flat_map(|id| state.values(id, &field_id))
                .filter_map(|v| v.as_f64())
                .collect(),
            None => Vec::new(),
        };
        definition.aggregation.apply(node_ids.len(), &numbers)
    }
}

/// Stored definitions are JSON values, or JSON text.
pub(crate) fn parse_definition<T: serde::de::DeserializeOwned>(value: Value) -> Result<T, GraphError> {
    let value = match value {
        Value::String(text) => serde_json::from_str(&text)?,
        other => other,
    };
    Ok(serde_json::from_value(value)?)
}
