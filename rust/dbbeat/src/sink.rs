//! Delivery of fired tasks.
//!
//! The beat loop hands each due entry's [`TaskMessage`] to a [`TaskSink`].
//! [`RedisTaskSink`] pushes a JSON envelope onto a Redis list named after the
//! target queue; [`LogTaskSink`] only logs, for dry runs.

use std::fmt;

use anyhow::{Context, Result};
use async_trait::async_trait;
use parking_lot::Mutex;
use redis::AsyncCommands;
use redis::aio::ConnectionManager;
use serde::{Deserialize, Serialize};
use serde_json::{Map, Value};
use tracing::info;
use uuid::Uuid;

use crate::schedule::Expires;

/// Routing hints passed through to the broker.
#[derive(Debug, Clone, Default, PartialEq, Eq, Serialize, Deserialize)]
pub struct RoutingOptions {
    pub queue: Option<String>,
    pub exchange: Option<String>,
    pub routing_key: Option<String>,
    pub expires: Option<Expires>,
    /// Name of the schedule that produced the message.
    pub periodic_task_name: String,
}

/// A task invocation ready for the broker.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct TaskMessage {
    pub id: Uuid,
    pub task: String,
    pub args: Vec<Value>,
    pub kwargs: Map<String, Value>,
    pub options: RoutingOptions,
}

impl TaskMessage {
    pub fn new(
        task: impl Into<String>,
        args: Vec<Value>,
        kwargs: Map<String, Value>,
        options: RoutingOptions,
    ) -> Self {
        Self {
            id: Uuid::new_v4(),
            task: task.into(),
            args,
            kwargs,
            options,
        }
    }
}

/// Receiver of fired tasks.
#[async_trait]
pub trait TaskSink: Send + Sync + fmt::Debug {
    async fn send(&self, message: TaskMessage) -> Result<()>;
}

/// Logs every message and drops it.
#[derive(Debug, Default, Clone, Copy)]
pub struct LogTaskSink;

#[async_trait]
impl TaskSink for LogTaskSink {
    async fn send(&self, message: TaskMessage) -> Result<()> {
        info!(
            task_id = %message.id,
            task = %message.task,
            schedule = %message.options.periodic_task_name,
            queue = ?message.options.queue,
            "Task dispatched (log only)"
        );
        Ok(())
    }
}

/// Keeps every message in memory.
#[derive(Debug, Default)]
pub struct MemoryTaskSink {
    sent: Mutex<Vec<TaskMessage>>,
}

impl MemoryTaskSink {
    pub fn new() -> Self {
        Self::default()
    }

    /// Messages sent so far, oldest first.
    pub fn messages(&self) -> Vec<TaskMessage> {
        self.sent.lock().clone()
    }

    /// Task names sent so far, oldest first.
    pub fn task_names(&self) -> Vec<String> {
        self.sent.lock().iter().map(|m| m.task.clone()).collect()
    }
}

#[async_trait]
impl TaskSink for MemoryTaskSink {
    async fn send(&self, message: TaskMessage) -> Result<()> {
        self.sent.lock().push(message);
        Ok(())
    }
}

/// Pushes JSON envelopes onto per-queue Redis lists.
#[derive(Clone)]
pub struct RedisTaskSink {
    redis: ConnectionManager,
    default_queue: String,
}

impl fmt::Debug for RedisTaskSink {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.debug_struct("RedisTaskSink")
            .field("default_queue", &self.default_queue)
            .finish_non_exhaustive()
    }
}

impl RedisTaskSink {
    pub fn new(redis: ConnectionManager, default_queue: impl Into<String>) -> Self {
        Self {
            redis,
            default_queue: default_queue.into(),
        }
    }

    /// List a message is pushed onto.
    pub fn queue_for<'a>(&'a self, message: &'a TaskMessage) -> &'a str {
        message
            .options
            .queue
            .as_deref()
            .unwrap_or(&self.default_queue)
    }
}

#[async_trait]
impl TaskSink for RedisTaskSink {
    async fn send(&self, message: TaskMessage) -> Result<()> {
        let queue = self.queue_for(&message).to_string();
        let payload =
            serde_json::to_string(&message).context("Failed to serialize task message")?;
        let mut redis = self.redis.clone();
        let _: () = redis
            .lpush(&queue, payload)
            .await
            .with_context(|| format!("Failed to push task onto {queue}"))?;
        info!(
            task_id = %message.id,
            task = %message.task,
            queue = %queue,
            "Task dispatched"
        );
        Ok(())
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use serde_json::json;

    #[test]
    fn test_message_envelope_shape() {
        let message = TaskMessage::new(
            "app.tasks.task_demo_params",
            vec![json!("Hello,")],
            json!({"world": "World"}).as_object().cloned().unwrap(),
            RoutingOptions {
                queue: Some("demo".to_string()),
                expires: Some(Expires::Seconds(43_200)),
                periodic_task_name: "Demo".to_string(),
                ..RoutingOptions::default()
            },
        );
        let value = serde_json::to_value(&message).unwrap();
        assert_eq!(value["task"], "app.tasks.task_demo_params");
        assert_eq!(value["args"], json!(["Hello,"]));
        assert_eq!(value["kwargs"]["world"], "World");
        assert_eq!(value["options"]["expires"], json!({"seconds": 43_200}));
        assert_eq!(value["options"]["periodic_task_name"], "Demo");
    }

    #[tokio::test]
    async fn test_memory_sink_records_in_order() {
        let sink = MemoryTaskSink::new();
        for task in ["a", "b"] {
            sink.send(TaskMessage::new(task, vec![], Map::new(), RoutingOptions::default()))
                .await
                .unwrap();
        }
        assert_eq!(sink.task_names(), vec!["a", "b"]);
        assert_ne!(sink.messages()[0].id, sink.messages()[1].id);
    }
}
