use std::collections::HashMap;
use std::sync::Arc;

use anyhow::Result;
use async_trait::async_trait;
use futures::StreamExt;
use futures::stream::BoxStream;
use serde_json::{Map, Value, json};

use crate::domain::events::StreamChunk;

/// Keys the server assigns; caller-supplied config never overrides these.
const RESERVED_KEYS: [&str; 4] = ["run_id", "thread_id", "user_id", "assistant_id"];

pub type ChunkStream = BoxStream<'static, Result<StreamChunk>>;

/// The graph engine's output seam: driven with `(input, context)`, yields a
/// lazy sequence of tagged chunks. Everything about node scheduling and
/// checkpointing lives behind this trait.
#[async_trait]
pub trait EventSource: Send + Sync + std::fmt::Debug {
    async fn run(&self, input: Value, ctx: &ExecutionContext) -> Result<ChunkStream>;
}

/// Per-run execution context handed to the event source.
///
/// Server-assigned identifiers are defaults; caller config is merged
/// additively and cannot shadow them.
#[derive(Debug, Clone)]
pub struct ExecutionContext {
    pub run_id: String,
    pub thread_id: String,
    pub assistant_id: String,
    pub user_id: String,
    pub configurable: Map<String, Value>,
}

impl ExecutionContext {
    pub fn new(run_id: &str, thread_id: &str, assistant_id: &str, user_id: &str) -> Self {
        let mut configurable = Map::new();
        configurable.insert("run_id".into(), json!(run_id));
        configurable.insert("thread_id".into(), json!(thread_id));
        configurable.insert("assistant_id".into(), json!(assistant_id));
        configurable.insert("user_id".into(), json!(user_id));
        Self {
            run_id: run_id.to_string(),
            thread_id: thread_id.to_string(),
            assistant_id: assistant_id.to_string(),
            user_id: user_id.to_string(),
            configurable,
        }
    }

    /// Merge caller-supplied configuration. Non-object values are ignored;
    /// reserved keys keep their server-assigned values.
    pub fn merge_config(&mut self, config: Option<&Value>) {
        let Some(Value::Object(map)) = config else {
            return;
        };
        for (key, value) in map {
            if RESERVED_KEYS.contains(&key.as_str()) {
                tracing::debug!(key, "ignoring caller override of reserved config key");
                continue;
            }
            self.configurable.insert(key.clone(), value.clone());
        }
    }
}

/// Maps assistant ids to their event sources. Populated at startup; the
/// assistants endpoint lists its keys.
#[derive(Debug, Default)]
pub struct GraphRegistry {
    graphs: HashMap<String, Arc<dyn EventSource>>,
}

impl GraphRegistry {
    pub fn new() -> Self {
        Self::default()
    }

    /// Registry with the built-in echo graph under the `agent` id.
    pub fn with_defaults() -> Self {
        let mut registry = Self::new();
        registry.register("agent", Arc::new(EchoGraph));
        registry
    }

    pub fn register(&mut self, assistant_id: &str, source: Arc<dyn EventSource>) {
        self.graphs.insert(assistant_id.to_string(), source);
    }

    pub fn get(&self, assistant_id: &str) -> Option<Arc<dyn EventSource>> {
        self.graphs.get(assistant_id).map(Arc::clone)
    }

    pub fn contains(&self, assistant_id: &str) -> bool {
        self.graphs.contains_key(assistant_id)
    }

    pub fn list(&self) -> Vec<String> {
        let mut ids: Vec<String> = self.graphs.keys().cloned().collect();
        ids.sort();
        ids
    }
}

/// Minimal single-node chat graph: appends one assistant message to the
/// input's message list and emits the resulting state as a `values` chunk.
#[derive(Debug)]
pub struct EchoGraph;

#[async_trait]
impl EventSource for EchoGraph {
    async fn run(&self, input: Value, _ctx: &ExecutionContext) -> Result<ChunkStream> {
        let mut messages = input
            .get("messages")
            .and_then(Value::as_array)
            .cloned()
            .unwrap_or_default();
        let reply = messages
            .iter()
            .rev()
            .find_map(|m| {
                let content = m.get("content")?.as_str()?;
                Some(format!("echo: {content}"))
            })
            .unwrap_or_else(|| "hello".to_string());
        messages.push(json!({ "role": "assistant", "content": reply }));

        let chunk = StreamChunk::Bare(json!({ "messages": messages }));
        Ok(futures::stream::iter(vec![Ok(chunk)]).boxed())
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn reserved_keys_survive_caller_config() {
        let mut ctx = ExecutionContext::new("r1", "t1", "agent", "u1");
        ctx.merge_config(Some(&json!({
            "thread_id": "spoofed",
            "temperature": 0.2,
        })));
        assert_eq!(ctx.configurable["thread_id"], json!("t1"));
        assert_eq!(ctx.configurable["temperature"], json!(0.2));
    }

    #[test]
    fn non_object_config_is_ignored() {
        let mut ctx = ExecutionContext::new("r1", "t1", "agent", "u1");
        ctx.merge_config(Some(&json!("not a map")));
        ctx.merge_config(None);
        assert_eq!(ctx.configurable.len(), 4);
    }

    #[tokio::test]
    async fn echo_graph_appends_assistant_reply() {
        let ctx = ExecutionContext::new("r1", "t1", "agent", "u1");
        let input = json!({ "messages": [{ "role": "user", "content": "hi" }] });
        let mut stream = EchoGraph.run(input, &ctx).await.unwrap();
        let chunk = stream.next().await.unwrap().unwrap();
        let (_, kind, payload) = chunk.into_parts();
        assert_eq!(kind, crate::domain::events::EventKind::Values);
        let messages = payload["messages"].as_array().unwrap();
        assert_eq!(messages.len(), 2);
        assert_eq!(messages[1]["content"], json!("echo: hi"));
        assert!(stream.next().await.is_none());
    }
}
