//! Query definitions
//!
//! The filter tree is a serde-tagged enum so definitions round-trip through
//! the JSON stored on automation and computed field nodes:
//!
//! ```json
//! {
//!   "filters": [
//!     { "type": "supertag", "supertagId": "supertag:task", "includeInherited": true },
//!     { "type": "property", "fieldId": "field:status", "op": "eq", "value": "done" },
//!     { "type": "not", "filters": [{ "type": "hasField", "fieldId": "field:archived" }] }
//!   ],
//!   "sort": { "field": "createdAt", "direction": "desc" },
//!   "limit": 20
//! }
//! ```

use crate::models::ValidationError;
use chrono::{DateTime, NaiveDate, Utc};
use serde::{Deserialize, Serialize};
use serde_json::Value;
use std::collections::BTreeSet;

/// Structured query definition
#[derive(Debug, Clone, Default, PartialEq, Serialize, Deserialize)]
#[serde(rename_all = "camelCase")]
pub struct QueryDefinition {
    /// Filter conditions, combined with an implicit AND
    #[serde(default)]
    pub filters: Vec<QueryFilter>,
    /// Optional sorting configuration
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub sort: Option<SortConfig>,
    /// Optional result limit, applied after sorting
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub limit: Option<usize>,
}

/// Comparison operator for property filters
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, Serialize, Deserialize)]
#[serde(rename_all = "camelCase")]
pub enum PropertyOp {
    Eq,
    Neq,
    Gt,
    Gte,
    Lt,
    Lte,
    Contains,
    StartsWith,
    EndsWith,
    IsEmpty,
    IsNotEmpty,
}

impl PropertyOp {
    pub fn as_str(&self) -> &'static str {
        match self {
            Self::Eq => "eq",
            Self::Neq => "neq",
            Self::Gt => "gt",
            Self::Gte => "gte",
            Self::Lt => "lt",
            Self::Lte => "lte",
            Self::Contains => "contains",
            Self::StartsWith => "startsWith",
            Self::EndsWith => "endsWith",
            Self::IsEmpty => "isEmpty",
            Self::IsNotEmpty => "isNotEmpty",
        }
    }

    /// Operators matching nodes that do *not* hold a qualifying value
    pub fn is_negative(&self) -> bool {
        matches!(self, Self::Neq | Self::IsEmpty)
    }
}

/// Relationship type for graph traversal
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "camelCase")]
pub enum RelationType {
    /// Direct owner is the target
    ChildOf,
    /// Target appears anywhere in the owner chain
    OwnedBy,
    /// Node holds a property value equal to the target id
    LinksTo,
    /// Target holds a property value equal to the node id
    LinkedFrom,
}

/// Node timestamp used by temporal filters
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "camelCase")]
pub enum TemporalField {
    CreatedAt,
    UpdatedAt,
}

#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "camelCase")]
pub enum TemporalOp {
    /// Timestamp within the last `days` days
    Within,
    /// Timestamp strictly before `date`
    Before,
    /// Timestamp strictly after `date`
    After,
}

/// Recursive filter tree
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
#[serde(tag = "type", rename_all = "camelCase")]
pub enum QueryFilter {
    #[serde(rename_all = "camelCase")]
    Supertag {
        supertag_id: String,
        #[serde(default = "default_true")]
        include_inherited: bool,
    },
    #[serde(rename_all = "camelCase")]
    Property {
        field_id: String,
        op: PropertyOp,
        #[serde(default)]
        value: Value,
    },
    #[serde(rename_all = "camelCase")]
    Content {
        query: String,
        #[serde(default)]
        case_sensitive: bool,
    },
    #[serde(rename_all = "camelCase")]
    Relation {
        relation_type: RelationType,
        #[serde(default, skip_serializing_if = "Option::is_none")]
        target_node_id: Option<String>,
    },
    #[serde(rename_all = "camelCase")]
    Temporal {
        field: TemporalField,
        op: TemporalOp,
        #[serde(default, skip_serializing_if = "Option::is_none")]
        days: Option<f64>,
        /// RFC3339 timestamp or `YYYY-MM-DD` (midnight UTC)
        #[serde(default, skip_serializing_if = "Option::is_none")]
        date: Option<String>,
    },
    #[serde(rename_all = "camelCase")]
    HasField {
        field_id: String,
        #[serde(default)]
        negate: bool,
    },
    And {
        filters: Vec<QueryFilter>,
    },
    Or {
        filters: Vec<QueryFilter>,
    },
    Not {
        filters: Vec<QueryFilter>,
    },
}

fn default_true() -> bool {
    true
}

/// Sort direction
#[derive(Debug, Clone, Copy, Default, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "lowercase")]
pub enum SortDirection {
    #[default]
    #[serde(rename = "asc")]
    Ascending,
    #[serde(rename = "desc")]
    Descending,
}

/// Sorting configuration
///
/// `field` is `id`, `content`, `createdAt`, `updatedAt`, or a field reference
/// (sorted by its first value).
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
#[serde(rename_all = "camelCase")]
pub struct SortConfig {
    pub field: String,
    #[serde(default)]
    pub direction: SortDirection,
}

/// Everything a query's result can depend on, extracted statically
#[derive(Debug, Clone, Default, PartialEq)]
pub struct QueryReferences {
    /// Field references used by property/hasField filters and field sorts
    pub fields: BTreeSet<String>,
    /// Supertag references matched directly
    pub supertags: BTreeSet<String>,
    /// Supertag references matched together with their descendants
    pub inherited_supertags: BTreeSet<String>,
    /// Content filters or content sort
    pub content: bool,
    /// `linksTo` / `linkedFrom` relation filters
    pub links: bool,
    /// Filters or sorts on `updatedAt`, or `within` windows that move with
    /// the clock; any event may change the result
    pub time_dependent: bool,
}

impl QueryDefinition {
    /// Parse a definition from JSON, reporting malformed input (including
    /// unknown filter types and operators) as a validation error.
    pub fn from_json(value: Value) -> Result<Self, ValidationError> {
        let definition: Self = serde_json::from_value(value)
            .map_err(|e| ValidationError::InvalidQuery(e.to_string()))?;
        definition.validate()?;
        Ok(definition)
    }

    pub fn new(filters: Vec<QueryFilter>) -> Self {
        Self {
            filters,
            ..Default::default()
        }
    }

    pub fn with_sort(mut self, field: impl Into<String>, direction: SortDirection) -> Self {
        self.sort = Some(SortConfig {
            field: field.into(),
            direction,
        });
        self
    }

    pub fn with_limit(mut self, limit: usize) -> Self {
        self.limit = Some(limit);
        self
    }

    /// Check the definition for malformed filters.
    pub fn validate(&self) -> Result<(), ValidationError> {
        for filter in &self.filters {
            filter.validate()?;
        }
        if let Some(sort) = &self.sort {
            if sort.field.trim().is_empty() {
                return Err(ValidationError::MissingField("sort.field".to_string()));
            }
        }
        Ok(())
    }

    /// Extract the references used for smart invalidation.
    pub fn references(&self) -> QueryReferences {
        let mut refs = QueryReferences::default();
        for filter in &self.filters {
            filter.collect_references(&mut refs);
        }
        if let Some(sort) = &self.sort {
            match sort.field.as_str() {
                "id" | "createdAt" => {}
                "content" => refs.content = true,
                "updatedAt" => refs.time_dependent = true,
                field => {
                    refs.fields.insert(field.to_string());
                }
            }
        }
        refs
    }
}

impl QueryDefinition {
    /// True when whether a node matches, and where it sorts, depends only on
    /// that node's own row, properties and supertags (plus the supertag
    /// hierarchy). A write to one node can then only move that node in or
    /// out of the result.
    pub fn is_node_local(&self) -> bool {
        self.filters.iter().all(QueryFilter::is_node_local)
    }
}

impl QueryFilter {
    pub fn supertag(supertag_id: impl Into<String>) -> Self {
        Self::Supertag {
            supertag_id: supertag_id.into(),
            include_inherited: true,
        }
    }

    pub fn property(field_id: impl Into<String>, op: PropertyOp, value: Value) -> Self {
        Self::Property {
            field_id: field_id.into(),
            op,
            value,
        }
    }

    pub fn has_field(field_id: impl Into<String>) -> Self {
        Self::HasField {
            field_id: field_id.into(),
            negate: false,
        }
    }

    pub fn validate(&self) -> Result<(), ValidationError> {
        match self {
            Self::Supertag { supertag_id, .. } => require_non_empty(supertag_id, "supertagId"),
            Self::HasField { field_id, .. } => require_non_empty(field_id, "fieldId"),
            Self::Property { field_id, op, value } => {
                require_non_empty(field_id, "fieldId")?;
                validate_operand(*op, value)
            }
            Self::Content { .. } | Self::Relation { .. } => Ok(()),
            Self::Temporal { op, days, date, .. } => match op {
                TemporalOp::Within => match days {
                    Some(days) if days.is_finite() && *days >= 0.0 => Ok(()),
                    Some(days) => Err(ValidationError::InvalidQuery(format!(
                        "temporal 'within' needs a non-negative day count, got {}",
                        days
                    ))),
                    None => Err(ValidationError::MissingField("days".to_string())),
                },
                TemporalOp::Before | TemporalOp::After => {
                    let date = date
                        .as_deref()
                        .ok_or_else(|| ValidationError::MissingField("date".to_string()))?;
                    parse_date(date).map(|_| ())
                }
            },
            Self::And { filters } | Self::Or { filters } | Self::Not { filters } => {
                filters.iter().try_for_each(QueryFilter::validate)
            }
        }
    }

    fn is_node_local(&self) -> bool {
        match self {
            Self::Supertag { .. }
            | Self::Property { .. }
            | Self::Content { .. }
            | Self::HasField { .. } => true,
            Self::Relation {
                relation_type,
                target_node_id,
            } => match relation_type {
                RelationType::ChildOf => true,
                RelationType::OwnedBy => target_node_id.is_none(),
                // Without a target, membership depends on the targets being live
                RelationType::LinksTo => target_node_id.is_some(),
                RelationType::LinkedFrom => false,
            },
            // The window moves with the clock
            Self::Temporal { op, .. } => *op != TemporalOp::Within,
            Self::And { filters } | Self::Or { filters } | Self::Not { filters } => {
                filters.iter().all(QueryFilter::is_node_local)
            }
        }
    }

    fn collect_references(&self, refs: &mut QueryReferences) {
        match self {
            Self::Supertag {
                supertag_id,
                include_inherited,
            } => {
                if *include_inherited {
                    refs.inherited_supertags.insert(supertag_id.clone());
                } else {
                    refs.supertags.insert(supertag_id.clone());
                }
            }
            Self::Property { field_id, .. } | Self::HasField { field_id, .. } => {
                refs.fields.insert(field_id.clone());
            }
            Self::Content { .. } => refs.content = true,
            Self::Relation { relation_type, .. } => {
                if matches!(relation_type, RelationType::LinksTo | RelationType::LinkedFrom) {
                    refs.links = true;
                }
            }
            Self::Temporal { field, op, .. } => {
                if *field == TemporalField::UpdatedAt || *op == TemporalOp::Within {
                    refs.time_dependent = true;
                }
            }
            Self::And { filters } | Self::Or { filters } | Self::Not { filters } => {
                for filter in filters {
                    filter.collect_references(refs);
                }
            }
        }
    }
}

fn require_non_empty(value: &str, name: &str) -> Result<(), ValidationError> {
    if value.trim().is_empty() {
        return Err(ValidationError::MissingField(name.to_string()));
    }
    Ok(())
}

fn describe(value: &Value) -> &'static str {
    match value {
        Value::Null => "null",
        Value::Bool(_) => "boolean values",
        Value::Number(_) => "numeric values",
        Value::String(_) => "string values",
        Value::Array(_) => "array values",
        Value::Object(_) => "object values",
    }
}

fn validate_operand(op: PropertyOp, value: &Value) -> Result<(), ValidationError> {
    let ok = match op {
        PropertyOp::Eq | PropertyOp::Neq | PropertyOp::IsEmpty | PropertyOp::IsNotEmpty => true,
        PropertyOp::Gt | PropertyOp::Gte | PropertyOp::Lt | PropertyOp::Lte => {
            value.is_number() || value.is_string()
        }
        PropertyOp::Contains => !value.is_null() && !value.is_object(),
        PropertyOp::StartsWith | PropertyOp::EndsWith => value.is_string(),
    };
    if ok {
        Ok(())
    } else {
        Err(ValidationError::unsupported_operator(
            op.as_str(),
            describe(value),
        ))
    }
}

/// Parse an RFC3339 timestamp or a `YYYY-MM-DD` date (midnight UTC).
pub(crate) fn parse_date(date: &str) -> Result<DateTime<Utc>, ValidationError> {
    if let Ok(dt) = DateTime::parse_from_rfc3339(date) {
        return Ok(dt.with_timezone(&Utc));
    }
    if let Ok(day) = NaiveDate::parse_from_str(date, "%Y-%m-%d") {
        if let Some(midnight) = day.and_hms_opt(0, 0, 0) {
            return Ok(midnight.and_utc());
        }
    }
    Err(ValidationError::InvalidQuery(format!(
        "unrecognized date '{}'",
        date
    )))
}
