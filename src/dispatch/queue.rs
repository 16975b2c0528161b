use chrono::{DateTime, Utc};
use serde::{Deserialize, Serialize};
use serde_json::Value;
use std::sync::Arc;
use std::time::Duration;
use tracing::{info, instrument};
use uuid::Uuid;

use crate::bus::naming::{WORKER_TASK_CONSUMER, WORKER_TASK_STREAM, WORKER_TASK_SUBJECT};
use crate::bus::{ConsumerConfig, RetentionPolicy, StreamConfig, Substrate};
use crate::shared::StoreError;

/// A unit of work for whichever worker picks it up first
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct TaskRequest {
    pub task_id: String,
    pub kind: String,
    #[serde(default)]
    pub room_id: Option<String>,
    #[serde(default)]
    pub payload: Value,
    pub submitted_at: DateTime<Utc>,
}

/// Submission side of the worker pool
#[derive(Clone)]
pub struct TaskQueue {
    bus: Arc<dyn Substrate>,
    replicas: usize,
    ack_wait: Duration,
}

impl TaskQueue {
    pub fn new(bus: Arc<dyn Substrate>, replicas: usize) -> Self {
        Self {
            bus,
            replicas,
            ack_wait: Duration::from_secs(60),
        }
    }

    /// How long a worker may hold a task before another one gets it
    pub fn with_ack_wait(mut self, ack_wait: Duration) -> Self {
        self.ack_wait = ack_wait;
        self
    }

    /// Creates the work-queue stream and the shared consumer. Idempotent.
    pub async fn provision(&self) -> Result<(), StoreError> {
        self.bus
            .create_stream(StreamConfig {
                name: WORKER_TASK_STREAM.to_string(),
                subjects: vec![WORKER_TASK_SUBJECT.to_string()],
                retention: RetentionPolicy::WorkQueue,
                replicas: self.replicas,
            })
            .await?;

        let mut consumer = ConsumerConfig::new(WORKER_TASK_CONSUMER, None);
        consumer.ack_wait = self.ack_wait;
        self.bus
            .create_or_update_consumer(WORKER_TASK_STREAM, consumer)
            .await?;

        info!(stream = WORKER_TASK_STREAM, "Worker task queue ready");
        Ok(())
    }

    #[instrument(skip(self, payload))]
    pub async fn submit(
        &self,
        kind: &str,
        room_id: Option<&str>,
        payload: Value,
    ) -> Result<TaskRequest, StoreError> {
        let task = TaskRequest {
            task_id: Uuid::new_v4().to_string(),
            kind: kind.to_string(),
            room_id: room_id.map(str::to_string),
            payload,
            submitted_at: Utc::now(),
        };

        let sequence = self
            .bus
            .publish(WORKER_TASK_SUBJECT, serde_json::to_vec(&task)?)
            .await?;

        info!(task_id = %task.task_id, kind = %kind, sequence, "Task submitted");
        Ok(task)
    }
}
