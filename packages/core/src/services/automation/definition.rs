//! Automation definitions and persisted trigger state

use crate::models::ValidationError;
use crate::services::query_service::QueryDefinition;
use chrono::{DateTime, Utc};
use serde::{Deserialize, Serialize};
use serde_json::Value;
use std::collections::BTreeMap;

/// A trigger/action rule
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
#[serde(rename_all = "camelCase")]
pub struct AutomationDefinition {
    pub name: String,
    pub trigger: AutomationTrigger,
    pub action: AutomationAction,
    #[serde(default = "default_true")]
    pub enabled: bool,
}

fn default_true() -> bool {
    true
}

fn default_method() -> String {
    "POST".to_string()
}

/// Membership transition a query trigger reacts to
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "camelCase")]
pub enum MembershipEvent {
    /// Node appears in `added`
    OnEnter,
    /// Node appears in `removed`
    OnExit,
    /// Node appears in `changed`
    OnChange,
}

#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "lowercase")]
pub enum ThresholdOperator {
    Gt,
    Gte,
    Lt,
    Lte,
    Eq,
}

#[derive(Debug, Clone, Copy, PartialEq, Serialize, Deserialize)]
pub struct ThresholdCondition {
    pub operator: ThresholdOperator,
    pub value: f64,
}

impl ThresholdCondition {
    /// Whether a computed value satisfies the condition. No value never does.
    pub fn is_satisfied_by(&self, value: Option<f64>) -> bool {
        let Some(value) = value else {
            return false;
        };
        match self.operator {
            ThresholdOperator::Gt => value > self.value,
            ThresholdOperator::Gte => value >= self.value,
            ThresholdOperator::Lt => value < self.value,
            ThresholdOperator::Lte => value <= self.value,
            ThresholdOperator::Eq => (value - self.value).abs() < f64::EPSILON,
        }
    }
}

#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
#[serde(tag = "type", rename_all = "snake_case")]
pub enum AutomationTrigger {
    #[serde(rename_all = "camelCase")]
    QueryMembership {
        query_definition: QueryDefinition,
        event: MembershipEvent,
    },
    #[serde(rename_all = "camelCase")]
    Threshold {
        computed_field_id: String,
        condition: ThresholdCondition,
        #[serde(default = "default_true")]
        fire_once: bool,
    },
}

#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
#[serde(tag = "type", rename_all = "snake_case")]
pub enum AutomationAction {
    /// Set a field on the target node; `"$now"` becomes the execution time
    #[serde(rename_all = "camelCase")]
    SetProperty { field_id: String, value: Value },
    #[serde(rename_all = "camelCase")]
    AddSupertag { supertag_id: String },
    #[serde(rename_all = "camelCase")]
    RemoveSupertag { supertag_id: String },
    #[serde(rename_all = "camelCase")]
    CreateNode {
        content: String,
        #[serde(default, skip_serializing_if = "Option::is_none")]
        supertag_id: Option<String>,
        #[serde(default, skip_serializing_if = "Option::is_none")]
        owner_id: Option<String>,
    },
    /// Enqueue an HTTP call on the external job queue
    Webhook {
        url: String,
        #[serde(default = "default_method")]
        method: String,
        #[serde(default, skip_serializing_if = "Option::is_none")]
        headers: Option<BTreeMap<String, String>>,
        #[serde(default, skip_serializing_if = "Option::is_none")]
        body: Option<Value>,
    },
}

impl AutomationAction {
    /// Actions applied to the triggering node
    pub fn needs_target(&self) -> bool {
        matches!(
            self,
            Self::SetProperty { .. } | Self::AddSupertag { .. } | Self::RemoveSupertag { .. }
        )
    }

    pub fn kind(&self) -> &'static str {
        match self {
            Self::SetProperty { .. } => "set_property",
            Self::AddSupertag { .. } => "add_supertag",
            Self::RemoveSupertag { .. } => "remove_supertag",
            Self::CreateNode { .. } => "create_node",
            Self::Webhook { .. } => "webhook",
        }
    }
}

impl AutomationDefinition {
    pub fn validate(&self) -> Result<(), ValidationError> {
        if self.name.trim().is_empty() {
            return Err(ValidationError::MissingField("name".to_string()));
        }
        match &self.trigger {
            AutomationTrigger::QueryMembership {
                query_definition, ..
            } => query_definition.validate()?,
            AutomationTrigger::Threshold {
                computed_field_id,
                condition,
                ..
            } => {
                if computed_field_id.trim().is_empty() {
                    return Err(ValidationError::MissingField("computedFieldId".to_string()));
                }
                if !condition.value.is_finite() {
                    return Err(ValidationError::InvalidDefinition(
                        "threshold value must be finite".to_string(),
                    ));
                }
            }
        }
        match &self.action {
            AutomationAction::SetProperty { field_id, .. } if field_id.trim().is_empty() => {
                Err(ValidationError::MissingField("fieldId".to_string()))
            }
            AutomationAction::AddSupertag { supertag_id }
            | AutomationAction::RemoveSupertag { supertag_id }
                if supertag_id.trim().is_empty() =>
            {
                Err(ValidationError::MissingField("supertagId".to_string()))
            }
            AutomationAction::Webhook { url, .. } if url.trim().is_empty() => {
                Err(ValidationError::MissingField("url".to_string()))
            }
            _ => Ok(()),
        }
    }
}

/// Trigger state persisted per automation across restarts
#[derive(Debug, Clone, Default, PartialEq, Serialize, Deserialize)]
#[serde(rename_all = "camelCase", default)]
pub struct AutomationState {
    pub last_triggered_at: Option<DateTime<Utc>>,
    /// Threshold condition currently satisfied (and, with `fireOnce`, already fired)
    pub threshold_crossed: bool,
    pub previous_value: Option<f64>,
    /// Result ids of a membership trigger at its last evaluation
    pub previously_in_results: Vec<String>,
}
