//! Bounded action queue and action execution
//!
//! Triggers fire inside subscription callbacks, where store writes are not
//! allowed. They push [`ActionJob`]s onto the [`ActionQueue`] instead; the
//! jobs run later on the action worker or through
//! `AutomationEngine::run_pending_actions`.
//!
//! Delivery is at-most-once: a job that does not fit is logged and dropped,
//! and a failing job is logged and never retried.
//!
//! Trigger state is not a job. Each automation has one state slot next to
//! the queue; staging overwrites the slot, so the latest state always
//! survives an overflow and is written before the queued jobs run.

use super::definition::{AutomationAction, AutomationState};
use super::webhook::{render_job, render_template, JobQueue, TemplateContext};
use crate::db::NodeStore;
use crate::models::system::NOW_MARKER;
use crate::models::CreateNodeParams;
use crate::services::error::GraphError;
use chrono::Utc;
use serde_json::Value;
use std::collections::{BTreeMap, VecDeque};
use std::sync::atomic::{AtomicU64, Ordering};
use std::sync::{Mutex, PoisonError};
use tokio::sync::mpsc;

/// One deferred action run
#[derive(Debug, Clone)]
pub(crate) struct ActionJob {
    pub(crate) automation_id: String,
    pub(crate) action: AutomationAction,
    pub(crate) target_node_id: Option<String>,
    pub(crate) context: TemplateContext,
}

/// FIFO of pending jobs with a fixed capacity, plus the unbounded
/// latest-wins state slots
pub(crate) struct ActionQueue {
    jobs: Mutex<VecDeque<ActionJob>>,
    states: Mutex<BTreeMap<String, AutomationState>>,
    capacity: usize,
    dropped: AtomicU64,
    wake_tx: Mutex<Option<mpsc::Sender<()>>>,
}

impl ActionQueue {
    pub(crate) fn new(capacity: usize) -> Self {
        Self {
            jobs: Mutex::new(VecDeque::new()),
            states: Mutex::new(BTreeMap::new()),
            capacity: capacity.max(1),
            dropped: AtomicU64::new(0),
            wake_tx: Mutex::new(None),
        }
    }

    /// Attach the worker's wake channel.
    pub(crate) fn set_waker(&self, wake_tx: Option<mpsc::Sender<()>>) {
        *self.wake_tx.lock().unwrap_or_else(PoisonError::into_inner) = wake_tx;
    }

    /// Append a job. Returns false when the queue is full and the job was
    /// dropped.
    pub(crate) fn push(&self, job: ActionJob) -> bool {
        {
            let mut jobs = self.jobs.lock().unwrap_or_else(PoisonError::into_inner);
            if jobs.len() >= self.capacity {
                self.dropped
                    .fetch_add(1, Ordering::Relaxed);
                tracing::warn!(
                    "Action queue full ({} jobs), dropping job for automation {}",
                    self.capacity,
                    job.automation_id
                );
                return false;
            }
            jobs.push_back(job);
        }
        self.wake();
        true
    }

    /// Stage the state of an automation for persisting, replacing any state
    /// staged earlier. Never dropped.
    pub(crate) fn stage_state(&self, automation_id: &str, state: AutomationState) {
        self.states
            .lock()
            .unwrap_or_else(PoisonError::into_inner)
            .insert(automation_id.to_string(), state);
        self.wake();
    }

    /// Remove every staged state.
    pub(crate) fn take_states(&self) -> BTreeMap<String, AutomationState> {
        std::mem::take(&mut *self.states.lock().unwrap_or_else(PoisonError::into_inner))
    }

    pub(crate) fn staged_states(&self) -> usize {
        self.states.lock().unwrap_or_else(PoisonError::into_inner).len()
    }

    fn wake(&self) {
        let wake_tx = self.wake_tx.lock().unwrap_or_else(PoisonError::into_inner);
        if let Some(tx) = wake_tx.as_ref() {
            match tx.try_send(()) {
                Ok(()) => tracing::trace!("Action worker wake signal sent"),
                Err(mpsc::error::TrySendError::Full(_)) => {
                    tracing::trace!("Action worker already has pending wake")
                }
                Err(mpsc::error::TrySendError::Closed(_)) => {
                    tracing::debug!("Action worker has shut down, wake ignored")
                }
            }
        }
    }

    /// Remove up to `max` jobs from the front.
    pub(crate) fn take(&self, max: usize) -> Vec<ActionJob> {
        let mut jobs = self.jobs.lock().unwrap_or_else(PoisonError::into_inner);
        let n = max.min(jobs.len());
        jobs.drain(..n).collect()
    }

    pub(crate) fn len(&self) -> usize {
        self.jobs.lock().unwrap_or_else(PoisonError::into_inner).len()
    }

    pub(crate) fn dropped(&self) -> u64 {
        self.dropped.load(Ordering::Relaxed)
    }
}

/// Replace the `$now` marker with the execution time.
fn resolve_value(value: &Value) -> Value {
    match value {
        Value::String(s) if s == NOW_MARKER => Value::String(Utc::now().to_rfc3339()),
        other => other.clone(),
    }
}

fn require_target<'a>(
    automation_id: &str,
    action: &AutomationAction,
    target: Option<&'a str>,
) -> Result<&'a str, GraphError> {
    target.ok_or_else(|| {
        GraphError::action_failed(format!(
            "{} action of automation {} has no target node",
            action.kind(),
            automation_id
        ))
    })
}

/// Carry out one action. Must not be called with the store gate held.
pub(crate) async fn execute(
    store: &NodeStore,
    job_queue: &dyn JobQueue,
    automation_id: &str,
    action: &AutomationAction,
    target_node_id: Option<&str>,
    context: &TemplateContext,
) -> Result<(), GraphError> {
    match action {
        AutomationAction::SetProperty { field_id, value } => {
            let target = require_target(automation_id, action, target_node_id)?;
            store
                .set_property(target, field_id, resolve_value(value))
                .await
        }
        AutomationAction::AddSupertag { supertag_id } => {
            let target = require_target(automation_id, action, target_node_id)?;
            store.add_supertag(target, supertag_id).await
        }
        AutomationAction::RemoveSupertag { supertag_id } => {
            let target = require_target(automation_id, action, target_node_id)?;
            store.remove_supertag(target, supertag_id).await
        }
        AutomationAction::CreateNode {
            content,
            supertag_id,
            owner_id,
        } => {
            let mut params = CreateNodeParams::new(render_template(content, context));
            if let Some(supertag_id) = supertag_id {
                params = params.with_supertag(supertag_id.clone());
            }
            if let Some(owner_id) = owner_id {
                let owner = render_template(owner_id, context);
                if !owner.is_empty() {
                    params = params.with_owner(owner);
                }
            }
            let node = store.create_node(params).await?;
            tracing::debug!("Automation {} created node {}", automation_id, node.id);
            Ok(())
        }
        AutomationAction::Webhook {
            url,
            method,
            headers,
            body,
        } => {
            let job = render_job(url, method, headers.as_ref(), body.as_ref(), context);
            job_queue
                .enqueue(job)
                .await
                .map_err(|e| GraphError::action_failed(format!("webhook enqueue failed: {}", e)))
        }
    }
}
