//! Typed in-process event pipeline.
//!
//! Tasks publish [`PipelineEvent`]s; a single dispatcher task hands each
//! event to every registered handler in registration order. One dispatcher
//! means events for an identifier are handled in the order they were
//! published.
//!
//! ```text
//! IMPORT/UPDATE ──IdentifierUpdated──► SyncScheduler ──► SYNC task
//! SYNC ──IdentifierSynced──► CompletionTracker ──► state machine
//! RESERVE/TRANSFER/no-op ──IdentifierSettled──► CompletionTracker
//! any task giving up ──TaskFailed──► CompletionTracker
//! ```
//!
//! Unlike a lossy metrics emitter, `publish` waits for buffer space: a
//! dropped event would leave its request unfinished.

use std::sync::atomic::{AtomicU64, Ordering};
use std::sync::Arc;

use async_trait::async_trait;
use tokio::sync::mpsc;
use tracing::{debug, error, info};
use uuid::Uuid;

use crate::error::{IgsnError, Result};
use crate::queue::TaskQueue;
use crate::state::RequestStateMachine;
use crate::types::{IdentifierStatus, Task, TaskType};

#[derive(Debug, Clone, PartialEq, Eq)]
pub enum PipelineEvent {
    /// Content for the identifier changed locally; the registrar needs a sync.
    IdentifierUpdated {
        request_id: Uuid,
        identifier: String,
    },
    /// The registrar now reflects the identifier.
    IdentifierSynced {
        request_id: Uuid,
        identifier: String,
        status: IdentifierStatus,
    },
    /// The task finished with nothing further to do.
    IdentifierSettled {
        request_id: Uuid,
        key: String,
        status: Option<IdentifierStatus>,
    },
    TaskFailed {
        request_id: Uuid,
        key: String,
        task_type: TaskType,
        error: String,
    },
}

impl PipelineEvent {
    pub fn request_id(&self) -> Uuid {
        match self {
            Self::IdentifierUpdated { request_id, .. }
            | Self::IdentifierSynced { request_id, .. }
            | Self::IdentifierSettled { request_id, .. }
            | Self::TaskFailed { request_id, .. } => *request_id,
        }
    }

    pub fn kind(&self) -> &'static str {
        match self {
            Self::IdentifierUpdated { .. } => "identifier_updated",
            Self::IdentifierSynced { .. } => "identifier_synced",
            Self::IdentifierSettled { .. } => "identifier_settled",
            Self::TaskFailed { .. } => "task_failed",
        }
    }
}

#[async_trait]
pub trait EventHandler: Send + Sync {
    fn name(&self) -> &'static str;

    async fn handle(&self, event: &PipelineEvent) -> Result<()>;
}

#[derive(Debug, Clone, Copy, Default)]
pub struct EventStats {
    pub published: u64,
    pub dispatched: u64,
    pub handler_errors: u64,
}

#[derive(Default)]
struct Counters {
    published: AtomicU64,
    dispatched: AtomicU64,
    handler_errors: AtomicU64,
}

pub struct EventBus {
    sender: mpsc::Sender<PipelineEvent>,
    counters: Arc<Counters>,
}

impl EventBus {
    /// Spawn the dispatcher over a channel of `buffer_size` events.
    pub fn start(buffer_size: usize, handlers: Vec<Arc<dyn EventHandler>>) -> Self {
        let (sender, receiver) = mpsc::channel(buffer_size.max(1));
        let counters = Arc::new(Counters::default());
        info!(
            buffer_size,
            handlers = handlers.len(),
            "Event dispatcher started"
        );
        tokio::spawn(dispatch(receiver, handlers, counters.clone()));
        Self { sender, counters }
    }

    pub async fn publish(&self, event: PipelineEvent) -> Result<()> {
        debug!(
            event = event.kind(),
            request_id = %event.request_id(),
            "Publishing event"
        );
        self.sender
            .send(event)
            .await
            .map_err(|_| IgsnError::Internal(anyhow::anyhow!("event dispatcher has stopped")))?;
        self.counters.published.fetch_add(1, Ordering::Relaxed);
        Ok(())
    }

    pub fn stats(&self) -> EventStats {
        EventStats {
            published: self.counters.published.load(Ordering::Relaxed),
            dispatched: self.counters.dispatched.load(Ordering::Relaxed),
            handler_errors: self.counters.handler_errors.load(Ordering::Relaxed),
        }
    }
}

async fn dispatch(
    mut receiver: mpsc::Receiver<PipelineEvent>,
    handlers: Vec<Arc<dyn EventHandler>>,
    counters: Arc<Counters>,
) {
    while let Some(event) = receiver.recv().await {
        for handler in &handlers {
            if let Err(e) = handler.handle(&event).await {
                counters.handler_errors.fetch_add(1, Ordering::Relaxed);
                error!(
                    handler = handler.name(),
                    event = event.kind(),
                    request_id = %event.request_id(),
                    error = %e,
                    "Event handler failed"
                );
            }
        }
        counters.dispatched.fetch_add(1, Ordering::Relaxed);
    }
    debug!("Event dispatcher stopped");
}

// ── Handlers ──

/// Queues a SYNC task for every locally updated identifier.
pub struct SyncScheduler {
    queue: Arc<TaskQueue>,
}

impl SyncScheduler {
    pub fn new(queue: Arc<TaskQueue>) -> Self {
        Self { queue }
    }
}

#[async_trait]
impl EventHandler for SyncScheduler {
    fn name(&self) -> &'static str {
        "sync_scheduler"
    }

    async fn handle(&self, event: &PipelineEvent) -> Result<()> {
        if let PipelineEvent::IdentifierUpdated {
            request_id,
            identifier,
        } = event
        {
            self.queue
                .submit(Task::for_identifier(TaskType::Sync, *request_id, identifier));
        }
        Ok(())
    }
}

/// Feeds terminal task results into the request state machine.
pub struct CompletionTracker {
    state: Arc<RequestStateMachine>,
}

impl CompletionTracker {
    pub fn new(state: Arc<RequestStateMachine>) -> Self {
        Self { state }
    }
}

#[async_trait]
impl EventHandler for CompletionTracker {
    fn name(&self) -> &'static str {
        "completion_tracker"
    }

    async fn handle(&self, event: &PipelineEvent) -> Result<()> {
        match event {
            PipelineEvent::IdentifierUpdated { .. } => Ok(()),
            PipelineEvent::IdentifierSynced {
                request_id,
                identifier,
                status,
            } => {
                self.state
                    .on_task_completed(*request_id, identifier, Some(*status))
                    .await
            }
            PipelineEvent::IdentifierSettled {
                request_id,
                key,
                status,
            } => self.state.on_task_completed(*request_id, key, *status).await,
            PipelineEvent::TaskFailed {
                request_id,
                key,
                error,
                ..
            } => self.state.on_task_failed(*request_id, key, error).await,
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use std::sync::Mutex;

    struct Recorder {
        seen: Mutex<Vec<String>>,
        fail_on: &'static str,
    }

    #[async_trait]
    impl EventHandler for Recorder {
        fn name(&self) -> &'static str {
            "recorder"
        }

        async fn handle(&self, event: &PipelineEvent) -> Result<()> {
            self.seen.lock().unwrap().push(event.kind().to_string());
            if event.kind() == self.fail_on {
                return Err(IgsnError::Conflict("scripted".into()));
            }
            Ok(())
        }
    }

    #[tokio::test]
    async fn events_reach_handlers_in_order_despite_errors() {
        let recorder = Arc::new(Recorder {
            seen: Mutex::new(Vec::new()),
            fail_on: "identifier_updated",
        });
        let bus = EventBus::start(1, vec![recorder.clone() as Arc<dyn EventHandler>]);
        let request_id = Uuid::new_v4();

        bus.publish(PipelineEvent::IdentifierUpdated {
            request_id,
            identifier: "10273/A".into(),
        })
        .await
        .unwrap();
        bus.publish(PipelineEvent::IdentifierSynced {
            request_id,
            identifier: "10273/A".into(),
            status: IdentifierStatus::Accessible,
        })
        .await
        .unwrap();
        bus.publish(PipelineEvent::IdentifierSettled {
            request_id,
            key: "10273/B".into(),
            status: None,
        })
        .await
        .unwrap();

        for _ in 0..100 {
            if bus.stats().dispatched == 3 {
                break;
            }
            tokio::time::sleep(std::time::Duration::from_millis(5)).await;
        }
        let stats = bus.stats();
        assert_eq!(stats.published, 3);
        assert_eq!(stats.dispatched, 3);
        assert_eq!(stats.handler_errors, 1);
        assert_eq!(
            recorder.seen.lock().unwrap().as_slice(),
            &["identifier_updated", "identifier_synced", "identifier_settled"]
        );
    }
}
