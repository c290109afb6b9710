//! Lifecycle events emitted during a job run.
//!
//! The event bus is the hook point for subtask completion: the runner
//! registers handlers (result recording, live log printing) and the task
//! runtime emits one event per subtask attempt.

use async_trait::async_trait;
use std::sync::Arc;
use std::time::Duration;
use tokio::sync::RwLock;

use crate::report::SubTaskStatus;

/// Lifecycle events emitted during execution.
#[derive(Debug, Clone)]
pub enum Event {
    /// A step (pre, main or post) has started.
    StepStarted { name: String },

    /// A subtask began executing inside its pod.
    SubTaskStarted { name: String, task_name: String },

    /// A subtask finished (successfully or not).
    SubTaskFinished {
        /// Strategy key name, or container name when no strategy applies.
        name: String,
        task_name: String,
        status: SubTaskStatus,
        elapsed: Duration,
        output: Vec<u8>,
        container: String,
        pod: String,
    },

    /// A task is being retried after a retryable backend failure.
    TaskRetrying {
        task_name: String,
        attempt: u32,
        max_attempts: u32,
        reason: String,
    },
}

/// Handler for receiving lifecycle events.
#[async_trait]
pub trait EventHandler: Send + Sync {
    async fn handle(&self, event: &Event);
}

/// Event bus distributing events to registered handlers.
pub struct EventBus {
    handlers: RwLock<Vec<Arc<dyn EventHandler>>>,
}

impl EventBus {
    pub fn new() -> Self {
        Self {
            handlers: RwLock::new(Vec::new()),
        }
    }

    pub async fn register(&self, handler: Arc<dyn EventHandler>) {
        self.handlers.write().await.push(handler);
    }

    pub async fn emit(&self, event: Event) {
        let handlers = self.handlers.read().await;
        for handler in handlers.iter() {
            handler.handle(&event).await;
        }
    }

    pub async fn handler_count(&self) -> usize {
        self.handlers.read().await.len()
    }
}

impl Default for EventBus {
    fn default() -> Self {
        Self::new()
    }
}
