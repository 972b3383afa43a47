//! Graph Shell
//!
//! Line-oriented shell over a graph context, for poking at a database by
//! hand. Reads one command per line from stdin.
//!
//! # Usage
//!
//! ```bash
//! # In-memory graph
//! cargo run --bin graph-shell
//!
//! # Persisted graph with debug logging
//! SEMGRAPH_DB_PATH=./graph.db RUST_LOG=debug cargo run --bin graph-shell
//! ```
//!
//! # Environment Variables
//!
//! - `SEMGRAPH_DB_PATH`, `SEMGRAPH_SMART_INVALIDATION`, `SEMGRAPH_DEBOUNCE_MS`,
//!   `SEMGRAPH_ACTION_QUEUE_CAPACITY`: see `GraphConfig::from_env`
//! - `RUST_LOG`: Logging level (default: info)

use std::sync::Arc;

use anyhow::{anyhow, Context};
use semgraph_core::logging::init_tracing;
use semgraph_core::services::automation::InMemoryJobQueue;
use semgraph_core::services::computed_field_service::ComputedFieldDefinition;
use semgraph_core::services::{AutomationDefinition, GraphContext, QueryDefinition};
use semgraph_core::{CreateNodeParams, GraphConfig};
use serde_json::Value;
use tokio::io::{AsyncBufReadExt, BufReader};

const HELP: &str = "\
commands:
  supertag <system-id> <name>          create a supertag
  extends <child> <parent>             add an extends edge
  create <content> [supertag]          create a node (content without spaces, or quoted with _)
  tag <node> <supertag>                add a supertag
  untag <node> <supertag>              remove a supertag
  set <node> <field> <json>            replace a property
  add <node> <field> <json>            append a property value
  clear <node> <field>                 remove a property
  delete <node>                        soft-delete a node
  get <node>                           print the assembled node
  query <json>                         evaluate a query definition
  computed <id> <json>                 register a computed field
  value <id>                           print a computed field value
  automation <id> <json>               register an automation
  run                                  run queued automation actions
  webhooks                             print and clear enqueued webhook jobs
  count                                number of live nodes
  help | quit";

#[tokio::main]
async fn main() -> anyhow::Result<()> {
    init_tracing();

    let config = GraphConfig::from_env()?;
    let jobs = Arc::new(InMemoryJobQueue::new());
    let graph = GraphContext::open(config, jobs.clone())
        .await
        .context("failed to open graph")?;

    println!("semgraph shell ({} live nodes). Type `help` for commands.", graph.store().node_count());

    let mut lines = BufReader::new(tokio::io::stdin()).lines();
    while let Some(line) = lines.next_line().await? {
        let line = line.trim();
        if line.is_empty() {
            continue;
        }
        if line == "quit" || line == "exit" {
            break;
        }
        match run_command(&graph, &jobs, line).await {
            Ok(output) => println!("{}", output),
            Err(e) => println!("error: {:#}", e),
        }
    }

    graph.shutdown().await?;
    Ok(())
}

/// Split off the first `n` whitespace-separated words; the rest is returned
/// verbatim.
fn split_words(line: &str, n: usize) -> (Vec<&str>, &str) {
    let mut words = Vec::with_capacity(n);
    let mut rest = line.trim_start();
    for _ in 0..n {
        if rest.is_empty() {
            break;
        }
        let end = rest.find(char::is_whitespace).unwrap_or(rest.len());
        words.push(&rest[..end]);
        rest = rest[end..].trim_start();
    }
    (words, rest)
}

fn arg<'a>(words: &[&'a str], index: usize, name: &str) -> anyhow::Result<&'a str> {
    words
        .get(index)
        .copied()
        .ok_or_else(|| anyhow!("missing <{}>", name))
}

fn parse_json(text: &str) -> anyhow::Result<Value> {
    serde_json::from_str(text).with_context(|| format!("invalid JSON: {}", text))
}

async fn run_command(
    graph: &GraphContext,
    jobs: &InMemoryJobQueue,
    line: &str,
) -> anyhow::Result<String> {
    let (head, _) = split_words(line, 1);
    let command = arg(&head, 0, "command")?;
    let store = graph.store();

    match command {
        "help" => Ok(HELP.to_string()),
        "supertag" => {
            let (words, name) = split_words(line, 2);
            let node = store
                .create_supertag(arg(&words, 1, "system-id")?, name)
                .await?;
            Ok(node.id)
        }
        "extends" => {
            let (words, _) = split_words(line, 3);
            store
                .set_extends(arg(&words, 1, "child")?, arg(&words, 2, "parent")?)
                .await?;
            Ok("ok".to_string())
        }
        "create" => {
            let (words, _) = split_words(line, 3);
            let content = arg(&words, 1, "content")?.replace('_', " ");
            let mut params = CreateNodeParams::new(content);
            if let Some(supertag) = words.get(2) {
                params = params.with_supertag(*supertag);
            }
            Ok(store.create_node(params).await?.id)
        }
        "tag" | "untag" => {
            let (words, _) = split_words(line, 3);
            let node = arg(&words, 1, "node")?;
            let supertag = arg(&words, 2, "supertag")?;
            if command == "tag" {
                store.add_supertag(node, supertag).await?;
            } else {
                store.remove_supertag(node, supertag).await?;
            }
            Ok("ok".to_string())
        }
        "set" | "add" => {
            let (words, json) = split_words(line, 3);
            let node = arg(&words, 1, "node")?;
            let field = arg(&words, 2, "field")?;
            let value = parse_json(json)?;
            if command == "set" {
                store.set_property(node, field, value).await?;
            } else {
                store.add_property_value(node, field, value).await?;
            }
            Ok("ok".to_string())
        }
        "clear" => {
            let (words, _) = split_words(line, 3);
            store
                .clear_property(arg(&words, 1, "node")?, arg(&words, 2, "field")?)
                .await?;
            Ok("ok".to_string())
        }
        "delete" => {
            let (words, _) = split_words(line, 2);
            store.delete_node(arg(&words, 1, "node")?).await?;
            Ok("ok".to_string())
        }
        "get" => {
            let (words, _) = split_words(line, 2);
            let node = arg(&words, 1, "node")?;
            let assembled = graph
                .queries()
                .assemble_node(node)
                .ok_or_else(|| anyhow!("node not found: {}", node))?;
            Ok(serde_json::to_string_pretty(&assembled)?)
        }
        "query" => {
            let (_, json) = split_words(line, 1);
            let definition: QueryDefinition = serde_json::from_value(parse_json(json)?)?;
            let result = graph.queries().evaluate_query(&definition)?;
            let ids: Vec<&str> = result.nodes.iter().map(|n| n.id()).collect();
            Ok(format!("{} of {}: {}", ids.len(), result.total_count, ids.join(", ")))
        }
        "computed" => {
            let (words, json) = split_words(line, 2);
            let definition: ComputedFieldDefinition = serde_json::from_value(parse_json(json)?)?;
            let value = graph
                .computed_fields()
                .register(arg(&words, 1, "id")?, definition)
                .await?;
            Ok(format!("{:?}", value.value))
        }
        "value" => {
            let (words, _) = split_words(line, 2);
            let id = arg(&words, 1, "id")?;
            let value = graph
                .computed_fields()
                .get(id)
                .ok_or_else(|| anyhow!("computed field not found: {}", id))?;
            Ok(format!("{:?} at {}", value.value, value.updated_at))
        }
        "automation" => {
            let (words, json) = split_words(line, 2);
            let definition: AutomationDefinition = serde_json::from_value(parse_json(json)?)?;
            graph
                .automations()
                .register(arg(&words, 1, "id")?, definition)
                .await?;
            Ok("ok".to_string())
        }
        "run" => {
            let ran = graph.automations().run_pending_actions().await;
            Ok(format!("ran {} jobs", ran))
        }
        "webhooks" => {
            let taken = jobs.take();
            if taken.is_empty() {
                return Ok("no webhook jobs".to_string());
            }
            let lines: Vec<String> = taken
                .iter()
                .map(|job| serde_json::to_string(job).unwrap_or_else(|_| job.url.clone()))
                .collect();
            Ok(lines.join("\n"))
        }
        "count" => Ok(store.node_count().to_string()),
        other => Err(anyhow!("unknown command `{}`; try `help`", other)),
    }
}
