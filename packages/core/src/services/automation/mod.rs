//! Automation Engine
//!
//! Trigger/action rules layered on live queries and computed fields.
//!
//! # Triggers
//!
//! - `query_membership` - a subscription on the trigger query; fires for every
//!   node entering (`onEnter`), leaving (`onExit`) or changing inside
//!   (`onChange`) the result set
//! - `threshold` - watches a computed field; with `fireOnce` it fires when the
//!   condition becomes satisfied and re-arms once it stops being satisfied,
//!   without it fires on every value update that satisfies the condition
//!
//! # Execution
//!
//! Triggers are evaluated synchronously inside subscription callbacks, but
//! actions are not: each firing pushes a job onto a bounded action queue,
//! drained by the action worker ([`AutomationEngine::spawn_worker`]) or
//! explicitly with [`AutomationEngine::run_pending_actions`]. Action failures
//! are logged and never affect the mutation that fired them.
//!
//! # Persisted state
//!
//! Each automation persists an [`AutomationState`] through the storage
//! backend. On registration the stored state is reconciled with the current
//! graph: membership transitions and threshold crossings that happened while
//! the engine was down fire once, nothing fired before is replayed. The first
//! registration of an automation only records a baseline.
//!
//! A trigger stages its new state before queueing any action. Staged states
//! bypass the queue capacity and are written before the queued actions run,
//! so an overflowing queue can lose actions but never the record that they
//! fired.
//!
//! # Example
//!
//! ```rust,no_run
//! use semgraph_core::services::automation::{AutomationAction, AutomationDefinition, AutomationTrigger, MembershipEvent};
//! use semgraph_core::services::query_service::{PropertyOp, QueryDefinition, QueryFilter};
//! use semgraph_core::services::GraphContext;
//! use serde_json::json;
//!
//! # async fn example(graph: &GraphContext) -> anyhow::Result<()> {
//! let stamp = AutomationDefinition {
//!     name: "Stamp completion".to_string(),
//!     trigger: AutomationTrigger::QueryMembership {
//!         query_definition: QueryDefinition::new(vec![QueryFilter::property(
//!             "field:status",
//!             PropertyOp::Eq,
//!             json!("done"),
//!         )]),
//!         event: MembershipEvent::OnEnter,
//!     },
//!     action: AutomationAction::SetProperty {
//!         field_id: "field:completed-at".to_string(),
//!         value: json!("$now"),
//!     },
//!     enabled: true,
//! };
//! graph.automations().register("stamp-completion", stamp).await?;
//! # Ok(())
//! # }
//! ```

mod actions;
mod definition;
mod webhook;


pub use definition::{
    AutomationAction, AutomationDefinition, AutomationState, AutomationTrigger, MembershipEvent,
    ThresholdCondition, ThresholdOperator,
};
pub use webhook::{
    render_template, render_value, ChannelJobQueue, ComputedFieldContext, InMemoryJobQueue,
    JobQueue, TemplateContext, WebhookJob,
};

use crate::db::{ListenerId, NodeStore};
use crate::models::system::{FIELD_AUTOMATION_DEFINITION, SUPERTAG_AUTOMATION};
use crate::models::AssembledNode;
use crate::services::computed_field_service::{
    parse_definition, ComputedFieldService, ComputedFieldUpdate,
};
use crate::services::error::GraphError;
use crate::services::subscription_service::{
    QuerySubscriptionService, ResultChange, SubscriptionHandle,
};
use actions::{ActionJob, ActionQueue};
use chrono::Utc;
use serde_json::Value;
use std::collections::{HashMap, HashSet};
use std::sync::atomic::{AtomicBool, Ordering};
use std::sync::{Arc, Mutex, MutexGuard, PoisonError, RwLock, Weak};
use tokio::sync::mpsc;
use tokio::task::JoinHandle;

/// Default capacity of the action queue
pub const DEFAULT_ACTION_QUEUE_CAPACITY: usize = 1024;

struct Automation {
    id: String,
    definition: AutomationDefinition,
    enabled: AtomicBool,
    state: Mutex<AutomationState>,
    /// Live query of a membership trigger
    handle: Option<SubscriptionHandle>,
}

impl Automation {
    fn state(&self) -> MutexGuard<'_, AutomationState> {
        self.state.lock().unwrap_or_else(PoisonError::into_inner)
    }

    fn is_enabled(&self) -> bool {
        self.enabled.load(Ordering::SeqCst)
    }
}

struct ActionWorker {
    shutdown_tx: mpsc::Sender<()>,
    join: JoinHandle<()>,
}

/// Registry and executor of automations
pub struct AutomationEngine {
    store: Arc<NodeStore>,
    subscriptions: Arc<QuerySubscriptionService>,
    computed: Arc<ComputedFieldService>,
    job_queue: Arc<dyn JobQueue>,
    queue: ActionQueue,
    automations: RwLock<HashMap<String, Arc<Automation>>>,
    threshold_listener: Mutex<Option<ListenerId>>,
    worker: Mutex<Option<ActionWorker>>,
}

impl AutomationEngine {
    pub fn new(
        subscriptions: Arc<QuerySubscriptionService>,
        computed: Arc<ComputedFieldService>,
        job_queue: Arc<dyn JobQueue>,
        queue_capacity: usize,
    ) -> Arc<Self> {
        let engine = Arc::new(Self {
            store: subscriptions.queries().store().clone(),
            subscriptions,
            computed,
            job_queue,
            queue: ActionQueue::new(queue_capacity),
            automations: RwLock::new(HashMap::new()),
            threshold_listener: Mutex::new(None),
            worker: Mutex::new(None),
        });

        let weak: Weak<Self> = Arc::downgrade(&engine);
        let listener = engine.computed.on_update(move |update| {
            if let Some(engine) = weak.upgrade() {
                engine.on_threshold_update(update);
            }
        });
        *engine
            .threshold_listener
            .lock()
            .unwrap_or_else(PoisonError::into_inner) = Some(listener);
        engine
    }

    //
    // REGISTRATION
    //

    /// Register (or replace) an automation.
    ///
    /// Loads the persisted state of `id` and reconciles it with the current
    /// graph; see the module docs.
    ///
    /// # Errors
    ///
    /// - `Validation` for a malformed definition
    /// - `NotFound` when a threshold trigger names an unregistered computed field
    pub async fn register(
        self: &Arc<Self>,
        id: impl Into<String>,
        definition: AutomationDefinition,
    ) -> Result<(), GraphError> {
        let id = id.into();
        definition.validate()?;

        let persisted = match self.store.backend().load_automation_state(&id).await? {
            Some(value) => match serde_json::from_value::<AutomationState>(value) {
                Ok(state) => Some(state),
                Err(e) => {
                    tracing::warn!("Discarding unreadable state of automation {}: {}", id, e);
                    None
                }
            },
            None => None,
        };

        let _gate = self.store.exclusive().await;
        self.register_locked(id, definition, persisted)
    }

    fn register_locked(
        self: &Arc<Self>,
        id: String,
        definition: AutomationDefinition,
        persisted: Option<AutomationState>,
    ) -> Result<(), GraphError> {
        self.unregister(&id);

        let automation = match &definition.trigger {
            AutomationTrigger::QueryMembership {
                query_definition,
                event,
            } => {
                let weak: Weak<Self> = Arc::downgrade(self);
                let automation_id = id.clone();
                let handle = self.subscriptions.subscribe_locked(
                    query_definition.clone(),
                    Arc::new(move |change: &ResultChange| {
                        if let Some(engine) = weak.upgrade() {
                            engine.on_membership_change(&automation_id, change);
                        }
                        Ok(())
                    }),
                )?;
                let current = handle.current_node_ids()?;

                let automation = Automation {
                    id: id.clone(),
                    enabled: AtomicBool::new(definition.enabled),
                    definition: definition.clone(),
                    state: Mutex::new(AutomationState::default()),
                    handle: Some(handle),
                };
                self.reconcile_membership(&automation, *event, &current, persisted);
                automation
            }
            AutomationTrigger::Threshold {
                computed_field_id,
                condition,
                ..
            } => {
                let current = self
                    .computed
                    .get(computed_field_id)
                    .ok_or_else(|| GraphError::not_found("Computed field", computed_field_id))?;

                let automation = Automation {
                    id: id.clone(),
                    enabled: AtomicBool::new(definition.enabled),
                    definition: definition.clone(),
                    state: Mutex::new(AutomationState::default()),
                    handle: None,
                };
                self.reconcile_threshold(
                    &automation,
                    computed_field_id,
                    condition,
                    current.value,
                    persisted,
                );
                automation
            }
        };

        tracing::info!(
            "Automation {} ({}) registered: {} -> {}",
            id,
            definition.name,
            trigger_kind(&definition.trigger),
            definition.action.kind()
        );
        self.automations
            .write()
            .unwrap_or_else(PoisonError::into_inner)
            .insert(id, Arc::new(automation));
        Ok(())
    }

    /// Fire for membership transitions missed while the engine was down.
    fn reconcile_membership(
        &self,
        automation: &Automation,
        event: MembershipEvent,
        current: &[String],
        persisted: Option<AutomationState>,
    ) {
        let Some(previous) = persisted else {
            let mut state = automation.state();
            state.previously_in_results = current.to_vec();
            self.persist(&automation.id, &state);
            return;
        };

        let before: HashSet<&str> = previous
            .previously_in_results
            .iter()
            .map(String::as_str)
            .collect();
        let after: HashSet<&str> = current.iter().map(String::as_str).collect();
        let missed: Vec<&str> = match event {
            MembershipEvent::OnEnter => current
                .iter()
                .map(String::as_str)
                .filter(|id| !before.contains(id))
                .collect(),
            MembershipEvent::OnExit => previous
                .previously_in_results
                .iter()
                .map(String::as_str)
                .filter(|id| !after.contains(id))
                .collect(),
            MembershipEvent::OnChange => Vec::new(),
        };

        let fires = !missed.is_empty() && automation.is_enabled();
        {
            let mut state = automation.state();
            *state = previous.clone();
            if fires {
                state.last_triggered_at = Some(Utc::now());
            }
            state.previously_in_results = current.to_vec();
            self.persist(&automation.id, &state);
        }

        if fires {
            tracing::info!(
                "Automation {} catching up on {} missed {:?} transitions",
                automation.id,
                missed.len(),
                event
            );
            for node_id in missed {
                let node = self.subscriptions.queries().assemble_node(node_id);
                self.fire(automation, Some(node_id.to_string()), node, None);
            }
        }
    }

    /// Fire for a threshold crossing missed while the engine was down.
    fn reconcile_threshold(
        &self,
        automation: &Automation,
        computed_field_id: &str,
        condition: &ThresholdCondition,
        value: Option<f64>,
        persisted: Option<AutomationState>,
    ) {
        let satisfied = condition.is_satisfied_by(value);
        let mut missed = None;
        {
            let mut state = automation.state();
            match persisted {
                None => {
                    state.threshold_crossed = satisfied;
                    state.previous_value = value;
                }
                Some(previous) if value.is_none() => {
                    *state = previous;
                }
                Some(previous) => {
                    *state = previous;
                    if satisfied && !state.threshold_crossed {
                        if automation.is_enabled() {
                            missed = Some(ComputedFieldContext {
                                id: computed_field_id.to_string(),
                                value,
                                previous_value: state.previous_value,
                            });
                            state.last_triggered_at = Some(Utc::now());
                        }
                        state.threshold_crossed = true;
                    } else if !satisfied {
                        state.threshold_crossed = false;
                    }
                    state.previous_value = value;
                }
            }
            self.persist(&automation.id, &state);
        }

        if let Some(context) = missed {
            tracing::info!(
                "Automation {} catching up on missed threshold crossing",
                automation.id
            );
            let parent = self
                .computed
                .definition(computed_field_id)
                .and_then(|d| d.parent_node_id);
            self.fire_for_parent(automation, parent, context);
        }
    }

    /// Remove an automation. Returns false when unknown.
    pub fn unregister(&self, id: &str) -> bool {
        let removed = self
            .automations
            .write()
            .unwrap_or_else(PoisonError::into_inner)
            .remove(id);
        match removed {
            Some(automation) => {
                if let Some(handle) = &automation.handle {
                    if let Err(e) = handle.unsubscribe() {
                        tracing::debug!("Automation {} subscription already gone: {}", id, e);
                    }
                }
                true
            }
            None => false,
        }
    }

    /// Enable or disable an automation. Disabled automations keep tracking
    /// their trigger state but run no actions.
    pub fn set_enabled(&self, id: &str, enabled: bool) -> Result<(), GraphError> {
        let automation = self
            .automation(id)
            .ok_or_else(|| GraphError::not_found("Automation", id))?;
        automation.enabled.store(enabled, Ordering::SeqCst);
        tracing::info!(
            "Automation {} {}",
            id,
            if enabled { "enabled" } else { "disabled" }
        );
        Ok(())
    }

    /// Register every definition stored on `supertag:automation` nodes, keyed
    /// by the node's reference key. Malformed definitions are logged and
    /// skipped.
    ///
    /// Threshold automations need their computed fields registered first.
    pub async fn load_from_store(self: &Arc<Self>) -> Result<usize, GraphError> {
        let stored: Vec<(String, Value)> = {
            let state = self.store.read();
            state
                .resolve_ref(SUPERTAG_AUTOMATION)
                .and_then(|tag| state.tagged_with(&tag.id))
                .into_iter()
                .flatten()
                .filter_map(|node_id| {
                    let field = state.resolve_ref(FIELD_AUTOMATION_DEFINITION)?;
                    let value = state.values(node_id, &field.id).into_iter().next()?;
                    Some((state.reference_key(node_id), value))
                })
                .collect()
        };

        let mut loaded = 0;
        for (id, value) in stored {
            let definition: AutomationDefinition = match parse_definition(value) {
                Ok(definition) => definition,
                Err(e) => {
                    tracing::warn!("Skipping automation {}: {}", id, e);
                    continue;
                }
            };
            match self.register(id.clone(), definition).await {
                Ok(()) => loaded += 1,
                Err(e) => tracing::warn!("Skipping automation {}: {}", id, e),
            }
        }
        if loaded > 0 {
            tracing::info!("Loaded {} automations", loaded);
        }
        Ok(loaded)
    }

    //
    // READS
    //

    pub fn ids(&self) -> Vec<String> {
        let mut ids: Vec<String> = self
            .automations
            .read()
            .unwrap_or_else(PoisonError::into_inner)
            .keys()
            .cloned()
            .collect();
        ids.sort();
        ids
    }

    pub fn definition(&self, id: &str) -> Option<AutomationDefinition> {
        self.automation(id).map(|a| a.definition.clone())
    }

    pub fn is_enabled(&self, id: &str) -> Option<bool> {
        self.automation(id).map(|a| a.is_enabled())
    }

    /// In-memory trigger state; the persisted copy lags until the next
    /// [`run_pending_actions`](Self::run_pending_actions).
    pub fn get_state(&self, id: &str) -> Option<AutomationState> {
        self.automation(id).map(|a| a.state().clone())
    }

    /// Jobs waiting on the action queue
    pub fn pending_actions(&self) -> usize {
        self.queue.len()
    }

    /// Automations whose latest state is not written yet
    pub fn pending_states(&self) -> usize {
        self.queue.staged_states()
    }

    /// Jobs dropped because the action queue was full
    pub fn dropped_actions(&self) -> u64 {
        self.queue.dropped()
    }

    fn automation(&self, id: &str) -> Option<Arc<Automation>> {
        self.automations
            .read()
            .unwrap_or_else(PoisonError::into_inner)
            .get(id)
            .cloned()
    }

    //
    // TRIGGERS
    //

    fn on_membership_change(&self, automation_id: &str, change: &ResultChange) {
        let Some(automation) = self.automation(automation_id) else {
            return;
        };
        let AutomationTrigger::QueryMembership { event, .. } = &automation.definition.trigger else {
            return;
        };
        let nodes: &[AssembledNode] = match event {
            MembershipEvent::OnEnter => &change.added,
            MembershipEvent::OnExit => &change.removed,
            MembershipEvent::OnChange => &change.changed,
        };

        let fires = !nodes.is_empty() && automation.is_enabled();
        {
            let mut state = automation.state();
            if fires {
                state.last_triggered_at = Some(change.evaluated_at);
            }
            state.previously_in_results = change.node_ids.to_vec();
            self.persist(&automation.id, &state);
        }

        if fires {
            tracing::debug!(
                "Automation {} fired {:?} for {} nodes",
                automation.id,
                event,
                nodes.len()
            );
            for node in nodes {
                self.fire(&automation, Some(node.id().to_string()), Some(node.clone()), None);
            }
        }
    }

    fn on_threshold_update(&self, update: &ComputedFieldUpdate) {
        let watching: Vec<Arc<Automation>> = self
            .automations
            .read()
            .unwrap_or_else(PoisonError::into_inner)
            .values()
            .filter(|a| {
                matches!(
                    &a.definition.trigger,
                    AutomationTrigger::Threshold { computed_field_id, .. }
                        if *computed_field_id == update.computed_field_id
                )
            })
            .cloned()
            .collect();

        for automation in watching {
            let AutomationTrigger::Threshold {
                condition,
                fire_once,
                ..
            } = &automation.definition.trigger
            else {
                continue;
            };

            let satisfied = condition.is_satisfied_by(update.value);
            let fires = {
                let mut state = automation.state();
                let fires = satisfied
                    && (!*fire_once || !state.threshold_crossed)
                    && automation.is_enabled();
                if fires {
                    state.last_triggered_at = Some(update.updated_at);
                }
                state.threshold_crossed = satisfied;
                state.previous_value = update.value;
                self.persist(&automation.id, &state);
                fires
            };

            if fires {
                tracing::debug!(
                    "Automation {} threshold met: {} {:?}",
                    automation.id,
                    update.computed_field_id,
                    update.value
                );
                let context = ComputedFieldContext {
                    id: update.computed_field_id.clone(),
                    value: update.value,
                    previous_value: update.previous,
                };
                self.fire_for_parent(&automation, update.parent_node_id.clone(), context);
            }
        }
    }

    fn fire_for_parent(
        &self,
        automation: &Automation,
        parent_node_id: Option<String>,
        computed_field: ComputedFieldContext,
    ) {
        let node = parent_node_id
            .as_deref()
            .and_then(|id| self.subscriptions.queries().assemble_node(id));
        self.fire(automation, parent_node_id, node, Some(computed_field));
    }

    fn fire(
        &self,
        automation: &Automation,
        target_node_id: Option<String>,
        node: Option<AssembledNode>,
        computed_field: Option<ComputedFieldContext>,
    ) {
        self.queue.push(ActionJob {
            automation_id: automation.id.clone(),
            action: automation.definition.action.clone(),
            target_node_id,
            context: TemplateContext {
                node,
                computed_field,
            },
        });
    }

    fn persist(&self, automation_id: &str, state: &AutomationState) {
        self.queue.stage_state(automation_id, state.clone());
    }

    //
    // EXECUTION
    //

    /// Write the staged automation states, then run the jobs queued at call
    /// time. Returns the number of jobs run; jobs queued by these actions
    /// stay queued for the next run.
    ///
    /// Must not be called while holding the store's write gate.
    pub async fn run_pending_actions(&self) -> usize {
        for (automation_id, state) in self.queue.take_states() {
            self.save_state(&automation_id, &state).await;
        }

        let jobs = self.queue.take(self.queue.len());
        let count = jobs.len();
        for job in jobs {
            self.run_job(job).await;
        }
        count
    }

    async fn save_state(&self, automation_id: &str, state: &AutomationState) {
        let result = match serde_json::to_value(state) {
            Ok(value) => self
                .store
                .backend()
                .save_automation_state(automation_id, &value)
                .await
                .map_err(GraphError::from),
            Err(e) => Err(e.into()),
        };
        if let Err(e) = result {
            tracing::error!("Failed to persist state of automation {}: {}", automation_id, e);
        }
    }

    async fn run_job(&self, job: ActionJob) {
        let ActionJob {
            automation_id,
            action,
            target_node_id,
            context,
        } = job;
        if let Err(e) = actions::execute(
            &self.store,
            self.job_queue.as_ref(),
            &automation_id,
            &action,
            target_node_id.as_deref(),
            &context,
        )
        .await
        {
            tracing::warn!(
                "Automation {} {} action failed: {}",
                automation_id,
                action.kind(),
                e
            );
        }
    }

    /// Start the background worker draining the action queue.
    ///
    /// The worker sleeps until a job is queued; wakes are coalesced. Returns
    /// false when a worker is already running.
    pub fn spawn_worker(self: &Arc<Self>) -> bool {
        let mut worker = self.worker.lock().unwrap_or_else(PoisonError::into_inner);
        if worker.is_some() {
            return false;
        }

        let (wake_tx, mut wake_rx) = mpsc::channel::<()>(1);
        let (shutdown_tx, mut shutdown_rx) = mpsc::channel::<()>(1);
        self.queue.set_waker(Some(wake_tx.clone()));
        if self.queue.len() > 0 || self.queue.staged_states() > 0 {
            let _ = wake_tx.try_send(());
        }

        let weak: Weak<Self> = Arc::downgrade(self);
        let join = tokio::spawn(async move {
            loop {
                tokio::select! {
                    biased;

                    _ = shutdown_rx.recv() => {
                        tracing::debug!("Action worker shutting down");
                        break;
                    }

                    signal = wake_rx.recv() => {
                        if signal.is_none() {
                            break;
                        }
                        let Some(engine) = weak.upgrade() else {
                            break;
                        };
                        let ran = engine.run_pending_actions().await;
                        tracing::trace!("Action worker ran {} jobs", ran);
                    }
                }
            }
        });

        *worker = Some(ActionWorker {
            shutdown_tx,
            join,
        });
        tracing::debug!("Action worker started");
        true
    }

    /// Stop the worker, run the jobs still queued and detach from computed
    /// field updates.
    pub async fn shutdown(&self) {
        let worker = self
            .worker
            .lock()
            .unwrap_or_else(PoisonError::into_inner)
            .take();
        self.queue.set_waker(None);
        if let Some(worker) = worker {
            let _ = worker.shutdown_tx.try_send(());
            if let Err(e) = worker.join.await {
                tracing::warn!("Action worker ended abnormally: {}", e);
            }
        }

        let remaining = self.run_pending_actions().await;
        if remaining > 0 {
            tracing::debug!("Ran {} queued actions during shutdown", remaining);
        }

        if let Some(listener) = self
            .threshold_listener
            .lock()
            .unwrap_or_else(PoisonError::into_inner)
            .take()
        {
            self.computed.remove_listener(listener);
        }
    }
}

fn trigger_kind(trigger: &AutomationTrigger) -> &'static str {
    match trigger {
        AutomationTrigger::QueryMembership { .. } => "query_membership",
        AutomationTrigger::Threshold { .. } => "threshold",
    }
}
