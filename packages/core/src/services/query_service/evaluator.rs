//! Filter tree evaluation
//!
//! A filter tree is compiled against one store state into a [`Plan`] that
//! borrows the store's index sets. A plan has a candidate set (the narrowest
//! index set among its conjuncts, or every live node) and a per-node test;
//! the result is the candidates passing the test, in id order. Ids are only
//! copied out of the indexes once the result is sorted and limited.

use super::definition::{
    parse_date, PropertyOp, QueryFilter, RelationType, SortConfig, SortDirection, TemporalField,
    TemporalOp,
};
use crate::db::StoreState;
use crate::models::system::is_structural_field;
use crate::services::inheritance::InheritanceResolver;
use chrono::{DateTime, Duration, Utc};
use serde_json::Value;
use std::cmp::Ordering;
use std::collections::{BTreeSet, VecDeque};

type NodeSet = BTreeSet<String>;

/// A filter tree bound to one store state
enum Plan<'a, 'q> {
    Nothing,
    Everything,
    /// Member of any of the index sets
    Members(Vec<&'a NodeSet>),
    Listed(BTreeSet<&'a str>),
    Property {
        field_id: &'a str,
        op: PropertyOp,
        operand: &'q Value,
        /// Holds every positive match
        candidates: &'a NodeSet,
    },
    Content {
        needle: String,
        case_sensitive: bool,
    },
    Temporal {
        field: TemporalField,
        op: TemporalOp,
        bound: DateTime<Utc>,
    },
    HasOwner,
    HasLinks,
    All(Vec<Plan<'a, 'q>>),
    Any(Vec<Plan<'a, 'q>>),
    Not(Box<Plan<'a, 'q>>),
}

impl Plan<'_, '_> {
    /// Relative cost of [`Evaluator::test`], cheapest first
    fn cost(&self) -> u8 {
        match self {
            Self::Nothing | Self::Everything => 0,
            Self::Members(_) | Self::Listed(_) | Self::HasOwner => 1,
            Self::Temporal { .. } => 2,
            Self::Property { .. } | Self::HasLinks => 3,
            Self::Content { .. } => 4,
            Self::All(_) | Self::Any(_) | Self::Not(_) => 5,
        }
    }
}

/// Nodes a plan can match at all
enum Candidates<'a> {
    Live,
    Sets(Vec<&'a NodeSet>),
    Listed(BTreeSet<&'a str>),
}

impl Candidates<'_> {
    fn estimate(&self, live: usize) -> usize {
        match self {
            Self::Live => live,
            Self::Sets(sets) => sets.iter().map(|s| s.len()).sum(),
            Self::Listed(ids) => ids.len(),
        }
    }
}

fn members<'a, 'q>(set: Option<&'a NodeSet>) -> Plan<'a, 'q> {
    match set {
        Some(set) if !set.is_empty() => Plan::Members(vec![set]),
        _ => Plan::Nothing,
    }
}

fn listed<'a, 'q>(ids: BTreeSet<&'a str>) -> Plan<'a, 'q> {
    if ids.is_empty() {
        Plan::Nothing
    } else {
        Plan::Listed(ids)
    }
}

fn negate<'a, 'q>(plan: Plan<'a, 'q>) -> Plan<'a, 'q> {
    match plan {
        Plan::Nothing => Plan::Everything,
        Plan::Everything => Plan::Nothing,
        Plan::Not(inner) => *inner,
        other => Plan::Not(Box::new(other)),
    }
}

/// Sort key resolved once per sort
enum SortKey<'a> {
    Id,
    Content,
    CreatedAt,
    UpdatedAt,
    /// `None` for an unknown field: every value is missing
    Field(Option<&'a str>),
}

pub(crate) struct Evaluator<'a> {
    pub(crate) state: &'a StoreState,
    pub(crate) resolver: &'a InheritanceResolver,
    pub(crate) now: DateTime<Utc>,
}

impl<'a> Evaluator<'a> {
    /// Live nodes matching every filter, in id order. An empty list matches
    /// every live node.
    pub(crate) fn matching(&self, filters: &[QueryFilter]) -> Vec<&'a str> {
        let plan = self.compile_all(filters);
        let passes = |id: &&'a str| self.test(&plan, id);

        match self.candidates(&plan) {
            Candidates::Live => self
                .state
                .live
                .iter()
                .map(String::as_str)
                .filter(passes)
                .collect(),
            Candidates::Listed(ids) => ids.into_iter().filter(passes).collect(),
            Candidates::Sets(sets) if sets.len() == 1 => {
                let set: &'a NodeSet = sets[0];
                set.iter().map(String::as_str).filter(passes).collect()
            }
            Candidates::Sets(sets) => {
                // Sets may overlap
                let merged: BTreeSet<&'a str> = sets
                    .into_iter()
                    .flat_map(|set: &'a NodeSet| set.iter().map(String::as_str))
                    .filter(passes)
                    .collect();
                merged.into_iter().collect()
            }
        }
    }

    /// The ids of `node_ids` that are live and match every filter.
    pub(crate) fn matching_of<'n>(
        &self,
        filters: &[QueryFilter],
        node_ids: &'n BTreeSet<String>,
    ) -> BTreeSet<&'n str> {
        let plan = self.compile_all(filters);
        node_ids
            .iter()
            .map(String::as_str)
            .filter(|id| self.state.live.contains(*id) && self.test(&plan, id))
            .collect()
    }

    //
    // COMPILATION
    //

    /// Implicit AND
    fn compile_all<'q>(&self, filters: &'q [QueryFilter]) -> Plan<'a, 'q> {
        let mut plans = Vec::with_capacity(filters.len());
        for filter in filters {
            match self.compile(filter) {
                Plan::Nothing => return Plan::Nothing,
                Plan::Everything => {}
                plan => plans.push(plan),
            }
        }
        match plans.len() {
            0 => Plan::Everything,
            1 => plans.swap_remove(0),
            _ => {
                plans.sort_by_key(Plan::cost);
                Plan::All(plans)
            }
        }
    }

    fn compile<'q>(&self, filter: &'q QueryFilter) -> Plan<'a, 'q> {
        match filter {
            QueryFilter::Supertag {
                supertag_id,
                include_inherited,
            } => self.supertag(supertag_id, *include_inherited),
            QueryFilter::Property { field_id, op, value } => self.property(field_id, *op, value),
            QueryFilter::Content {
                query,
                case_sensitive,
            } => Plan::Content {
                needle: if *case_sensitive {
                    query.clone()
                } else {
                    query.to_lowercase()
                },
                case_sensitive: *case_sensitive,
            },
            QueryFilter::Relation {
                relation_type,
                target_node_id,
            } => self.relation(*relation_type, target_node_id.as_deref()),
            QueryFilter::Temporal {
                field,
                op,
                days,
                date,
            } => self.temporal(*field, *op, *days, date.as_deref()),
            QueryFilter::HasField { field_id, negate: negated } => {
                let state = self.state;
                let with = members(
                    state
                        .resolve_ref(field_id)
                        .and_then(|field| state.with_field(&field.id)),
                );
                if *negated {
                    negate(with)
                } else {
                    with
                }
            }
            QueryFilter::And { filters } => self.compile_all(filters),
            QueryFilter::Or { filters } => {
                let mut plans = Vec::with_capacity(filters.len());
                for filter in filters {
                    match self.compile(filter) {
                        Plan::Everything => return Plan::Everything,
                        Plan::Nothing => {}
                        plan => plans.push(plan),
                    }
                }
                match plans.len() {
                    0 => Plan::Nothing,
                    1 => plans.swap_remove(0),
                    _ => Plan::Any(plans),
                }
            }
            QueryFilter::Not { filters } => negate(self.compile_all(filters)),
        }
    }

    fn supertag<'q>(&self, supertag_ref: &str, include_inherited: bool) -> Plan<'a, 'q> {
        let state = self.state;
        let Some(root) = state.resolve_ref(supertag_ref) else {
            return Plan::Nothing;
        };
        let mut sets: Vec<&'a NodeSet> = state.tagged_with(&root.id).into_iter().collect();
        if include_inherited {
            for descendant in self.resolver.descendants_in(state, &root.id).iter() {
                sets.extend(state.tagged_with(descendant));
            }
        }
        if sets.is_empty() {
            Plan::Nothing
        } else {
            Plan::Members(sets)
        }
    }

    fn property<'q>(&self, field_ref: &str, op: PropertyOp, operand: &'q Value) -> Plan<'a, 'q> {
        let state = self.state;
        let no_holders = if op.is_negative() {
            Plan::Everything
        } else {
            Plan::Nothing
        };
        let Some(field) = state.resolve_ref(field_ref) else {
            return no_holders;
        };
        let field_id = field.id.as_str();

        // Positive matches hold a value of the field; for string equality
        // they also appear in the value index.
        let holders = state.with_field(field_id);
        let narrowed = match (op, operand) {
            (PropertyOp::Eq | PropertyOp::Neq, Value::String(s)) if !is_structural_field(field_id) => {
                state.referencing(s)
            }
            _ => holders,
        };
        let candidates = match (holders, narrowed) {
            (Some(holders), Some(narrowed)) if narrowed.len() < holders.len() => narrowed,
            (Some(holders), Some(_)) => holders,
            _ => return no_holders,
        };

        Plan::Property {
            field_id,
            op,
            operand,
            candidates,
        }
    }

    fn relation<'q>(&self, relation: RelationType, target: Option<&str>) -> Plan<'a, 'q> {
        let state = self.state;
        let target = target.map(|t| state.resolve_ref(t).map(|n| n.id.as_str()).unwrap_or(t));

        match (relation, target) {
            (RelationType::ChildOf, Some(owner)) => members(state.owned_by(owner)),
            (RelationType::OwnedBy, Some(owner)) => {
                let mut found: BTreeSet<&'a str> = BTreeSet::new();
                let mut queue: VecDeque<&str> = VecDeque::from([owner]);
                while let Some(current) = queue.pop_front() {
                    for child in state.owned_by(current).into_iter().flatten() {
                        if found.insert(child.as_str()) {
                            queue.push_back(child.as_str());
                        }
                    }
                }
                listed(found)
            }
            (RelationType::ChildOf | RelationType::OwnedBy, None) => Plan::HasOwner,
            (RelationType::LinksTo, Some(target)) => members(state.referencing(target)),
            (RelationType::LinksTo, None) => Plan::HasLinks,
            (RelationType::LinkedFrom, Some(source)) => listed(state.outgoing_links(source)),
            (RelationType::LinkedFrom, None) => {
                let mut linked = BTreeSet::new();
                for id in &state.live {
                    linked.extend(state.outgoing_links(id));
                }
                listed(linked)
            }
        }
    }

    fn temporal<'q>(
        &self,
        field: TemporalField,
        op: TemporalOp,
        days: Option<f64>,
        date: Option<&str>,
    ) -> Plan<'a, 'q> {
        // Definitions are validated before evaluation; anything left unusable
        // matches nothing.
        let bound = match op {
            TemporalOp::Within => match days {
                Some(days) => {
                    let millis = (days * 86_400_000.0) as i64;
                    self.now - Duration::milliseconds(millis)
                }
                None => return Plan::Nothing,
            },
            TemporalOp::Before | TemporalOp::After => match date.map(parse_date) {
                Some(Ok(date)) => date,
                _ => return Plan::Nothing,
            },
        };
        Plan::Temporal { field, op, bound }
    }

    //
    // MATCHING
    //

    fn candidates(&self, plan: &Plan<'a, '_>) -> Candidates<'a> {
        match plan {
            Plan::Nothing => Candidates::Listed(BTreeSet::new()),
            Plan::Members(sets) => Candidates::Sets(sets.clone()),
            Plan::Listed(ids) => Candidates::Listed(ids.clone()),
            Plan::Property { op, candidates, .. } if !op.is_negative() => {
                Candidates::Sets(vec![*candidates])
            }
            Plan::All(plans) => {
                let live = self.state.live.len();
                plans
                    .iter()
                    .map(|p| self.candidates(p))
                    .min_by_key(|c| c.estimate(live))
                    .unwrap_or(Candidates::Live)
            }
            Plan::Any(plans) => {
                let mut sets = Vec::new();
                let mut ids = BTreeSet::new();
                for plan in plans {
                    match self.candidates(plan) {
                        Candidates::Live => return Candidates::Live,
                        Candidates::Sets(more) => sets.extend(more),
                        Candidates::Listed(more) => ids.extend(more),
                    }
                }
                if ids.is_empty() {
                    Candidates::Sets(sets)
                } else {
                    ids.extend(
                        sets.into_iter()
                            .flat_map(|set: &'a NodeSet| set.iter().map(String::as_str)),
                    );
                    Candidates::Listed(ids)
                }
            }
            _ => Candidates::Live,
        }
    }

    /// Does the live node `id` satisfy the plan?
    fn test(&self, plan: &Plan<'_, '_>, id: &str) -> bool {
        match plan {
            Plan::Nothing => false,
            Plan::Everything => true,
            Plan::Members(sets) => sets.iter().any(|set| set.contains(id)),
            Plan::Listed(ids) => ids.contains(id),
            Plan::Property {
                field_id,
                op,
                operand,
                ..
            } => {
                let holds = self
                    .state
                    .rows(id)
                    .iter()
                    .filter(|p| p.field_node_id == *field_id)
                    .any(|p| value_matches(*op, &p.value, operand));
                if op.is_negative() {
                    !holds
                } else {
                    holds
                }
            }
            Plan::Content {
                needle,
                case_sensitive,
            } => self.state.live_node(id).is_some_and(|node| {
                if *case_sensitive {
                    node.content.as_deref().is_some_and(|c| c.contains(needle.as_str()))
                } else {
                    node.content_plain
                        .as_deref()
                        .is_some_and(|c| c.contains(needle.as_str()))
                        || node
                            .content
                            .as_deref()
                            .is_some_and(|c| c.to_lowercase().contains(needle.as_str()))
                }
            }),
            Plan::Temporal { field, op, bound } => self.state.live_node(id).is_some_and(|node| {
                let ts = match field {
                    TemporalField::CreatedAt => node.created_at,
                    TemporalField::UpdatedAt => node.updated_at,
                };
                match op {
                    TemporalOp::Within => ts >= *bound,
                    TemporalOp::Before => ts < *bound,
                    TemporalOp::After => ts > *bound,
                }
            }),
            Plan::HasOwner => self
                .state
                .live_node(id)
                .is_some_and(|n| n.owner_id.is_some()),
            Plan::HasLinks => self.state.has_outgoing_links(id),
            Plan::All(plans) => plans.iter().all(|p| self.test(p, id)),
            Plan::Any(plans) => plans.iter().any(|p| self.test(p, id)),
            Plan::Not(inner) => !self.test(inner, id),
        }
    }

    //
    // ORDERING
    //

    fn sort_key(&self, sort: &SortConfig) -> SortKey<'a> {
        match sort.field.as_str() {
            "id" => SortKey::Id,
            "content" => SortKey::Content,
            "createdAt" => SortKey::CreatedAt,
            "updatedAt" => SortKey::UpdatedAt,
            field => SortKey::Field(self.state.resolve_ref(field).map(|f| f.id.as_str())),
        }
    }

    /// Total order of the sort configuration with an id tie-break.
    fn compare(&self, key: &SortKey<'_>, direction: SortDirection, a: &str, b: &str) -> Ordering {
        let ordering = match key {
            SortKey::Id => a.cmp(b),
            SortKey::Content => self.content_of(a).cmp(&self.content_of(b)),
            SortKey::CreatedAt => self.timestamp_of(a, true).cmp(&self.timestamp_of(b, true)),
            SortKey::UpdatedAt => self.timestamp_of(a, false).cmp(&self.timestamp_of(b, false)),
            SortKey::Field(field_id) => compare_json_values(
                field_id.and_then(|f| self.first_value(a, f)),
                field_id.and_then(|f| self.first_value(b, f)),
            ),
        };
        let ordering = match direction {
            SortDirection::Ascending => ordering,
            SortDirection::Descending => ordering.reverse(),
        };
        ordering.then_with(|| a.cmp(b))
    }

    pub(crate) fn sort(&self, ids: &mut [&str], sort: &SortConfig) {
        let key = self.sort_key(sort);
        ids.sort_by(|a, b| self.compare(&key, sort.direction, a, b));
    }

    /// Index at which `node_id` belongs in `ids`, which is already ordered by
    /// `sort` (or by id without one).
    pub(crate) fn position(
        &self,
        ids: &[String],
        node_id: &str,
        sort: Option<&SortConfig>,
    ) -> usize {
        match sort {
            Some(sort) => {
                let key = self.sort_key(sort);
                ids.partition_point(|id| {
                    self.compare(&key, sort.direction, id, node_id) == Ordering::Less
                })
            }
            None => ids.partition_point(|id| id.as_str() < node_id),
        }
    }

    fn content_of(&self, id: &str) -> Option<&'a str> {
        self.state.live_node(id).and_then(|n| n.content.as_deref())
    }

    fn timestamp_of(&self, id: &str, created: bool) -> Option<DateTime<Utc>> {
        self.state.live_node(id).map(|n| {
            if created {
                n.created_at
            } else {
                n.updated_at
            }
        })
    }

    fn first_value(&self, id: &str, field_id: &str) -> Option<&'a Value> {
        self.state
            .rows(id)
            .iter()
            .find(|p| p.field_node_id == field_id)
            .map(|p| &p.value)
    }
}

fn value_matches(op: PropertyOp, value: &Value, operand: &Value) -> bool {
    match op {
        PropertyOp::Eq | PropertyOp::Neq => values_equal(value, operand),
        PropertyOp::Gt => compare_operand(value, operand) == Some(Ordering::Greater),
        PropertyOp::Gte => matches!(
            compare_operand(value, operand),
            Some(Ordering::Greater | Ordering::Equal)
        ),
        PropertyOp::Lt => compare_operand(value, operand) == Some(Ordering::Less),
        PropertyOp::Lte => matches!(
            compare_operand(value, operand),
            Some(Ordering::Less | Ordering::Equal)
        ),
        PropertyOp::Contains => contains(value, operand),
        PropertyOp::StartsWith => match (value, operand) {
            (Value::String(v), Value::String(prefix)) => v.starts_with(prefix.as_str()),
            _ => false,
        },
        PropertyOp::EndsWith => match (value, operand) {
            (Value::String(v), Value::String(suffix)) => v.ends_with(suffix.as_str()),
            _ => false,
        },
        PropertyOp::IsEmpty | PropertyOp::IsNotEmpty => !is_empty_value(value),
    }
}

/// JSON equality with numeric comparison by value (`1 == 1.0`).
fn values_equal(a: &Value, b: &Value) -> bool {
    match (a, b) {
        (Value::Number(x), Value::Number(y)) => match (x.as_f64(), y.as_f64()) {
            (Some(x), Some(y)) => x == y,
            _ => x == y,
        },
        _ => a == b,
    }
}

/// Ordering between a stored value and a filter operand: numbers with
/// numbers, strings with strings, anything else is incomparable.
fn compare_operand(value: &Value, operand: &Value) -> Option<Ordering> {
    match (value, operand) {
        (Value::Number(a), Value::Number(b)) => a.as_f64()?.partial_cmp(&b.as_f64()?),
        (Value::String(a), Value::String(b)) => Some(a.cmp(b)),
        _ => None,
    }
}

fn contains(value: &Value, operand: &Value) -> bool {
    match (value, operand) {
        (Value::String(haystack), Value::String(needle)) => haystack.contains(needle.as_str()),
        (Value::Array(items), needle) => items.iter().any(|item| values_equal(item, needle)),
        _ => false,
    }
}

fn is_empty_value(value: &Value) -> bool {
    match value {
        Value::Null => true,
        Value::String(s) => s.is_empty(),
        Value::Array(a) => a.is_empty(),
        Value::Object(o) => o.is_empty(),
        _ => false,
    }
}

/// Compare two JSON values for sorting; missing values order first.
fn compare_json_values(a: Option<&Value>, b: Option<&Value>) -> Ordering {
    match (a, b) {
        (None, None) => Ordering::Equal,
        (None, Some(_)) => Ordering::Less,
        (Some(_), None) => Ordering::Greater,
        (Some(va), Some(vb)) => match (va, vb) {
            (Value::String(sa), Value::String(sb)) => sa.cmp(sb),
            (Value::Number(na), Value::Number(nb)) => {
                let fa = na.as_f64().unwrap_or(0.0);
                let fb = nb.as_f64().unwrap_or(0.0);
                fa.partial_cmp(&fb).unwrap_or(Ordering::Equal)
            }
            (Value::Bool(ba), Value::Bool(bb)) => ba.cmp(bb),
            // Mixed types, arrays and objects compare by their JSON text
            _ => va.to_string().cmp(&vb.to_string()),
        },
    }
}
