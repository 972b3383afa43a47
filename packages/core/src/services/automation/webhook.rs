//! Webhook jobs and template substitution
//!
//! Webhook actions are not delivered here. They are rendered into a
//! [`WebhookJob`] and handed to an external [`JobQueue`].
//!
//! Templates reference the triggering node and computed field:
//!
//! - `{{node.id}}`, `{{node.content}}`, `{{node.systemId}}`, `{{node.ownerId}}`,
//!   `{{node.createdAt}}`, `{{node.updatedAt}}`
//! - `{{node.<field>}}` - first value of a property, e.g. `{{node.field:status}}`
//!   (`{{node.status}}` falls back to `field:status`)
//! - `{{computedField.id}}`, `{{computedField.value}}`,
//!   `{{computedField.previousValue}}`
//!
//! Unknown placeholders render as an empty string.

use crate::models::AssembledNode;
use async_trait::async_trait;
use regex::Regex;
use serde::{Deserialize, Serialize};
use serde_json::Value;
use std::collections::BTreeMap;
use std::sync::{Mutex, OnceLock, PoisonError};
use tokio::sync::mpsc;

const TEMPLATE_PATTERN: &str = r"\{\{\s*(node|computedField)\.([A-Za-z0-9_:.\-]+)\s*\}\}";

/// Rendered webhook call, as accepted by the job queue
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
#[serde(rename_all = "camelCase")]
pub struct WebhookJob {
    pub url: String,
    pub method: String,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub headers: Option<BTreeMap<String, String>>,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub body: Option<Value>,
}

/// External delivery queue for webhook jobs
#[async_trait]
pub trait JobQueue: Send + Sync {
    async fn enqueue(&self, job: WebhookJob) -> anyhow::Result<()>;
}

/// Job queue that keeps jobs in memory, for tests and the shell
#[derive(Debug, Default)]
pub struct InMemoryJobQueue {
    jobs: Mutex<Vec<WebhookJob>>,
}

impl InMemoryJobQueue {
    pub fn new() -> Self {
        Self::default()
    }

    pub fn jobs(&self) -> Vec<WebhookJob> {
        self.jobs
            .lock()
            .unwrap_or_else(PoisonError::into_inner)
            .clone()
    }

    /// Remove and return every queued job.
    pub fn take(&self) -> Vec<WebhookJob> {
        std::mem::take(&mut *self.jobs.lock().unwrap_or_else(PoisonError::into_inner))
    }
}

#[async_trait]
impl JobQueue for InMemoryJobQueue {
    async fn enqueue(&self, job: WebhookJob) -> anyhow::Result<()> {
        tracing::debug!("Queued webhook {} {}", job.method, job.url);
        self.jobs
            .lock()
            .unwrap_or_else(PoisonError::into_inner)
            .push(job);
        Ok(())
    }
}

/// Job queue forwarding to a bounded tokio channel
#[derive(Debug, Clone)]
pub struct ChannelJobQueue {
    sender: mpsc::Sender<WebhookJob>,
}

impl ChannelJobQueue {
    pub fn new(capacity: usize) -> (Self, mpsc::Receiver<WebhookJob>) {
        let (sender, receiver) = mpsc::channel(capacity.max(1));
        (Self { sender }, receiver)
    }
}

#[async_trait]
impl JobQueue for ChannelJobQueue {
    async fn enqueue(&self, job: WebhookJob) -> anyhow::Result<()> {
        self.sender
            .send(job)
            .await
            .map_err(|_| anyhow::anyhow!("webhook receiver closed"))
    }
}

/// Computed field values available to templates
#[derive(Debug, Clone, PartialEq)]
pub struct ComputedFieldContext {
    pub id: String,
    pub value: Option<f64>,
    pub previous_value: Option<f64>,
}

/// Values captured when an automation fires
#[derive(Debug, Clone, Default, PartialEq)]
pub struct TemplateContext {
    pub node: Option<AssembledNode>,
    pub computed_field: Option<ComputedFieldContext>,
}

impl TemplateContext {
    fn lookup(&self, scope: &str, path: &str) -> String {
        match scope {
            "node" => self.node.as_ref().map(|n| node_value(n, path)).unwrap_or_default(),
            "computedField" => self
                .computed_field
                .as_ref()
                .map(|c| match path {
                    "id" => c.id.clone(),
                    "value" => format_number(c.value),
                    "previousValue" => format_number(c.previous_value),
                    _ => String::new(),
                })
                .unwrap_or_default(),
            _ => String::new(),
        }
    }
}

fn node_value(node: &AssembledNode, path: &str) -> String {
    let inner = &node.node;
    match path {
        "id" => inner.id.clone(),
        "content" => inner.content.clone().unwrap_or_default(),
        "systemId" => inner.system_id.clone().unwrap_or_default(),
        "ownerId" => inner.owner_id.clone().unwrap_or_default(),
        "createdAt" => inner.created_at.to_rfc3339(),
        "updatedAt" => inner.updated_at.to_rfc3339(),
        field => node
            .value(field)
            .or_else(|| node.value(&format!("field:{}", field)))
            .map(value_to_text)
            .unwrap_or_default(),
    }
}

fn format_number(value: Option<f64>) -> String {
    value.map(|v| v.to_string()).unwrap_or_default()
}

fn value_to_text(value: &Value) -> String {
    match value {
        Value::String(s) => s.clone(),
        Value::Null => String::new(),
        other => other.to_string(),
    }
}

/// Substitute every placeholder in a template string.
pub fn render_template(template: &str, context: &TemplateContext) -> String {
    static TEMPLATE_REGEX: OnceLock<Regex> = OnceLock::new();
    let regex = TEMPLATE_REGEX.get_or_init(|| Regex::new(TEMPLATE_PATTERN).unwrap());

    regex
        .replace_all(template, |caps: &regex::Captures| context.lookup(&caps[1], &caps[2]))
        .into_owned()
}

/// Render every string inside a JSON value, keys untouched.
pub fn render_value(value: &Value, context: &TemplateContext) -> Value {
    match value {
        Value::String(s) => Value::String(render_template(s, context)),
        Value::Array(items) => Value::Array(items.iter().map(|v| render_value(v, context)).collect()),
        Value::Object(map) => Value::Object(
            map.iter()
                .map(|(k, v)| (k.clone(), render_value(v, context)))
                .collect(),
        ),
        other => other.clone(),
    }
}

/// Build the job for a webhook action.
pub fn render_job(
    url: &str,
    method: &str,
    headers: Option<&BTreeMap<String, String>>,
    body: Option<&Value>,
    context: &TemplateContext,
) -> WebhookJob {
    WebhookJob {
        url: render_template(url, context),
        method: method.to_uppercase(),
        headers: headers.map(|headers| {
            headers
                .iter()
                .map(|(k, v)| (k.clone(), render_template(v, context)))
                .collect()
        }),
        body: body.map(|b| render_value(b, context)),
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::models::Node;
    use serde_json::json;

    fn context() -> TemplateContext {
        let mut properties = BTreeMap::new();
        properties.insert("field:status".to_string(), vec![json!("done")]);
        properties.insert("field:estimate".to_string(), vec![json!(3)]);
        TemplateContext {
            node: Some(AssembledNode {
                node: Node::new_with_id("task-1".to_string(), Some("Ship it".to_string()), None),
                supertags: vec!["supertag:task".to_string()],
                inherited_supertags: Vec::new(),
                properties,
            }),
            computed_field: Some(ComputedFieldContext {
                id: "budget".to_string(),
                value: Some(7.5),
                previous_value: Some(4.0),
            }),
        }
    }

    #[test]
    fn test_render_node_placeholders() {
        let ctx = context();
        assert_eq!(
            render_template("{{node.content}} ({{node.id}}) is {{ node.field:status }}", &ctx),
            "Ship it (task-1) is done"
        );
        assert_eq!(render_template("{{node.status}}/{{node.estimate}}", &ctx), "done/3");
    }

    #[test]
    fn test_render_computed_field_and_unknowns() {
        let ctx = context();
        assert_eq!(
            render_template("{{computedField.id}}: {{computedField.previousValue}} -> {{computedField.value}}", &ctx),
            "budget: 4 -> 7.5"
        );
        assert_eq!(render_template("[{{node.missing}}]", &ctx), "[]");
        assert_eq!(render_template("[{{node.id}}]", &TemplateContext::default()), "[]");
        assert_eq!(render_template("{{other.id}}", &ctx), "{{other.id}}");
    }

    #[test]
    fn test_render_job_body_and_headers() {
        let headers = BTreeMap::from([("X-Node".to_string(), "{{node.id}}".to_string())]);
        let body = json!({
            "text": "Task {{node.content}} done",
            "meta": { "value": "{{computedField.value}}", "count": 2 },
            "tags": ["{{node.status}}"]
        });
        let job = render_job(
            "https://hooks.example.com/{{node.id}}",
            "post",
            Some(&headers),
            Some(&body),
            &context(),
        );

        assert_eq!(job.url, "https://hooks.example.com/task-1");
        assert_eq!(job.method, "POST");
        assert_eq!(job.headers.unwrap()["X-Node"], "task-1");
        let body = job.body.unwrap();
        assert_eq!(body["text"], "Task Ship it done");
        assert_eq!(body["meta"]["value"], "7.5");
        assert_eq!(body["meta"]["count"], 2);
        assert_eq!(body["tags"][0], "done");
    }

    #[tokio::test]
    async fn test_channel_job_queue() {
        let (queue, mut receiver) = ChannelJobQueue::new(4);
        let job = WebhookJob {
            url: "https://example.com".to_string(),
            method: "GET".to_string(),
            headers: None,
            body: None,
        };
        queue.enqueue(job.clone()).await.unwrap();
        assert_eq!(receiver.recv().await, Some(job));

        drop(receiver);
        assert!(queue
            .enqueue(WebhookJob {
                url: "https://example.com".to_string(),
                method: "GET".to_string(),
                headers: None,
                body: None,
            })
            .await
            .is_err());
    }
}
