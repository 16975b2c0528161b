use std::collections::HashMap;
use std::sync::Arc;
use std::time::Duration;
use tokio::task::JoinHandle;
use tokio::time::timeout;
use tokio_util::sync::CancellationToken;
use tracing::{debug, error, info, warn};

use super::handler::{TaskError, TaskHandler};
use super::queue::TaskRequest;
use crate::bus::naming::{WORKER_TASK_CONSUMER, WORKER_TASK_STREAM};
use crate::bus::{BusError, StreamMessage, Substrate};

const FETCH_BATCH: usize = 8;
const FETCH_WAIT: Duration = Duration::from_secs(1);
const BUS_RETRY_DELAY: Duration = Duration::from_secs(1);

/// One member of the worker pool
///
/// Workers share a single durable consumer; the stream hands each task to
/// one of them. A task is acknowledged once it either succeeded or failed
/// for good, so only a crashed worker causes a redelivery.
pub struct TaskWorker {
    worker_id: String,
    bus: Arc<dyn Substrate>,
    handlers: HashMap<&'static str, Arc<dyn TaskHandler>>,
    handler_timeout: Duration,
    max_retries: u32,
}

impl TaskWorker {
    pub fn new(worker_id: impl Into<String>, bus: Arc<dyn Substrate>) -> Self {
        Self {
            worker_id: worker_id.into(),
            bus,
            handlers: HashMap::new(),
            handler_timeout: Duration::from_secs(5),
            max_retries: 3,
        }
    }

    pub fn add_handler(&mut self, handler: Arc<dyn TaskHandler>) {
        info!(
            worker_id = %self.worker_id,
            task_kind = handler.task_kind(),
            "Registering task handler"
        );
        self.handlers.insert(handler.task_kind(), handler);
    }

    pub fn with_handler_timeout(mut self, timeout: Duration) -> Self {
        self.handler_timeout = timeout;
        self
    }

    pub fn with_max_retries(mut self, max_retries: u32) -> Self {
        self.max_retries = max_retries;
        self
    }

    /// Pulls and runs tasks until cancelled or the queue is removed
    pub fn start(self, cancel: CancellationToken) -> JoinHandle<()> {
        info!(
            worker_id = %self.worker_id,
            handler_count = self.handlers.len(),
            timeout_secs = self.handler_timeout.as_secs(),
            max_retries = self.max_retries,
            "Starting task worker"
        );

        tokio::spawn(async move {
            loop {
                let fetched = tokio::select! {
                    _ = cancel.cancelled() => break,
                    fetched = self.bus.fetch(
                        WORKER_TASK_STREAM,
                        WORKER_TASK_CONSUMER,
                        FETCH_BATCH,
                        FETCH_WAIT,
                    ) => fetched,
                };

                match fetched {
                    Ok(messages) => {
                        for message in messages {
                            self.process(message).await;
                        }
                    }
                    Err(BusError::StreamNotFound(_)) | Err(BusError::ConsumerNotFound { .. }) => {
                        warn!(worker_id = %self.worker_id, "Task queue removed, worker stopping");
                        break;
                    }
                    Err(e) => {
                        warn!(worker_id = %self.worker_id, error = %e, "Task fetch failed");
                        tokio::time::sleep(BUS_RETRY_DELAY).await;
                    }
                }
            }

            info!(worker_id = %self.worker_id, "Task worker stopped");
        })
    }

    async fn process(&self, message: StreamMessage) {
        match serde_json::from_slice::<TaskRequest>(&message.payload) {
            Ok(task) => match self.handlers.get(task.kind.as_str()) {
                Some(handler) => {
                    if let Err(e) = self.handle_with_retry(handler.as_ref(), &task).await {
                        error!(
                            worker_id = %self.worker_id,
                            task_id = %task.task_id,
                            kind = %task.kind,
                            error = %e,
                            "Task dropped after failure"
                        );
                    }
                }
                None => {
                    warn!(worker_id = %self.worker_id, kind = %task.kind, "No handler for task kind, dropping");
                }
            },
            Err(e) => {
                warn!(
                    worker_id = %self.worker_id,
                    sequence = message.sequence,
                    error = %e,
                    "Undecodable task, dropping"
                );
            }
        }

        if let Err(e) = self
            .bus
            .ack(WORKER_TASK_STREAM, WORKER_TASK_CONSUMER, message.sequence)
            .await
        {
            warn!(worker_id = %self.worker_id, sequence = message.sequence, error = %e, "Task ack failed");
        }
    }

    async fn handle_with_retry(
        &self,
        handler: &dyn TaskHandler,
        task: &TaskRequest,
    ) -> Result<(), TaskError> {
        let mut attempt = 0;
        loop {
            let outcome = match timeout(self.handler_timeout, handler.handle(task)).await {
                Ok(result) => result,
                Err(_elapsed) => Err(TaskError::Timeout),
            };

            match outcome {
                Ok(()) => {
                    debug!(task_id = %task.task_id, attempt = attempt + 1, "Task completed");
                    return Ok(());
                }
                Err(e) if e.is_retryable() && attempt < self.max_retries => {
                    warn!(
                        task_id = %task.task_id,
                        kind = %task.kind,
                        attempt = attempt + 1,
                        error = %e,
                        "Task failed, will retry"
                    );
                    // Exponential backoff
                    tokio::time::sleep(Duration::from_millis(100 * 2_u64.pow(attempt))).await;
                    attempt += 1;
                }
                Err(e) => return Err(e),
            }
        }
    }
}
