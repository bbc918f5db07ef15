//! Two-lane task queue.
//!
//! - Serial lane: one worker, FIFO. RESERVE, TRANSFER and SYNC run here so
//!   registrar mutations never overlap.
//! - Parallel lane: a dispatcher bounded by a semaphore. IMPORT and UPDATE
//!   run here.
//!
//! A retryable failure goes back to the tail of its own lane until the
//! attempt cap is reached; anything else is reported straight away.

use std::sync::{Arc, Mutex};
use std::time::Duration;

use async_trait::async_trait;
use tokio::sync::{mpsc, oneshot, Semaphore};
use tracing::{debug, warn};

use crate::config::QueueConfig;
use crate::error::{error_chain, IgsnError, Result};
use crate::types::Task;

/// Executes tasks on behalf of the queue.
#[async_trait]
pub trait TaskRunner: Send + Sync {
    async fn run(&self, task: &Task) -> Result<()>;

    /// Called before a retryable failure is re-queued.
    async fn on_retry(&self, _task: &Task, _error: &IgsnError, _attempt: u32) {}

    /// Called once when the task gives up.
    async fn on_failed(&self, task: &Task, error: &IgsnError, attempts: u32);
}

#[derive(Debug, Clone, PartialEq, Eq)]
pub enum TaskResult {
    Succeeded { attempts: u32 },
    Failed { attempts: u32, error: String },
}

impl TaskResult {
    pub fn is_success(&self) -> bool {
        matches!(self, Self::Succeeded { .. })
    }

    pub fn attempts(&self) -> u32 {
        match self {
            Self::Succeeded { attempts } | Self::Failed { attempts, .. } => *attempts,
        }
    }
}

/// Resolves once the task has succeeded or given up.
pub struct TaskHandle {
    rx: oneshot::Receiver<TaskResult>,
}

impl TaskHandle {
    pub async fn wait(self) -> TaskResult {
        self.rx.await.unwrap_or_else(|_| TaskResult::Failed {
            attempts: 0,
            error: "task was dropped by the queue".to_string(),
        })
    }
}

#[derive(Debug, Clone, Copy)]
pub struct RetryPolicy {
    pub max_attempts: u32,
    pub backoff: Duration,
}

impl From<&QueueConfig> for RetryPolicy {
    fn from(config: &QueueConfig) -> Self {
        Self {
            max_attempts: config.max_attempts.max(1),
            backoff: config.retry_backoff(),
        }
    }
}

struct Job {
    task: Task,
    /// Attempts already made.
    attempts: u32,
    done: Option<oneshot::Sender<TaskResult>>,
}

type JobSender = mpsc::UnboundedSender<Job>;
type JobReceiver = mpsc::UnboundedReceiver<Job>;

struct Receivers {
    serial: JobReceiver,
    parallel: JobReceiver,
}

pub struct TaskQueue {
    serial: JobSender,
    parallel: JobSender,
    parallel_workers: usize,
    retry: RetryPolicy,
    receivers: Mutex<Option<Receivers>>,
}

impl TaskQueue {
    /// Create the lanes. Jobs submitted before [`TaskQueue::start`] wait in
    /// their lane.
    pub fn new(config: &QueueConfig) -> Arc<Self> {
        let (serial, serial_rx) = mpsc::unbounded_channel();
        let (parallel, parallel_rx) = mpsc::unbounded_channel();
        Arc::new(Self {
            serial,
            parallel,
            parallel_workers: config.parallel_workers.max(1),
            retry: RetryPolicy::from(config),
            receivers: Mutex::new(Some(Receivers {
                serial: serial_rx,
                parallel: parallel_rx,
            })),
        })
    }

    /// Spawn the lane workers. Fails if already started.
    pub fn start(&self, runner: Arc<dyn TaskRunner>) -> Result<()> {
        let receivers = self
            .receivers
            .lock()
            .map_err(|_| IgsnError::Internal(anyhow::anyhow!("queue lock poisoned")))?
            .take()
            .ok_or_else(|| IgsnError::Internal(anyhow::anyhow!("task queue already started")))?;

        tokio::spawn(serial_worker(
            receivers.serial,
            self.serial.clone(),
            runner.clone(),
            self.retry,
        ));
        tokio::spawn(parallel_dispatcher(
            receivers.parallel,
            self.parallel.clone(),
            runner,
            self.retry,
            self.parallel_workers,
        ));
        debug!(
            parallel_workers = self.parallel_workers,
            max_attempts = self.retry.max_attempts,
            "Task queue started"
        );
        Ok(())
    }

    pub fn submit(&self, task: Task) -> TaskHandle {
        let (tx, rx) = oneshot::channel();
        let lane = self.lane_for(&task);
        debug!(
            task_type = %task.task_type,
            request_id = %task.request_id,
            key = %task.key(),
            "Task submitted"
        );
        let job = Job {
            task,
            attempts: 0,
            done: Some(tx),
        };
        if let Err(mpsc::error::SendError(job)) = lane.send(job) {
            warn!(key = %job.task.key(), "Task queue is closed; task dropped");
        }
        TaskHandle { rx }
    }

    /// Submit through the task's lane and wait for its final result.
    pub async fn run_synchronously(&self, task: Task) -> TaskResult {
        self.submit(task).wait().await
    }

    pub fn retry_policy(&self) -> RetryPolicy {
        self.retry
    }

    fn lane_for(&self, task: &Task) -> &JobSender {
        if task.task_type.is_serial() {
            &self.serial
        } else {
            &self.parallel
        }
    }
}

async fn serial_worker(
    mut rx: JobReceiver,
    lane: JobSender,
    runner: Arc<dyn TaskRunner>,
    retry: RetryPolicy,
) {
    while let Some(job) = rx.recv().await {
        process(job, runner.as_ref(), &lane, retry).await;
    }
    debug!("Serial lane closed");
}

async fn parallel_dispatcher(
    mut rx: JobReceiver,
    lane: JobSender,
    runner: Arc<dyn TaskRunner>,
    retry: RetryPolicy,
    workers: usize,
) {
    let permits = Arc::new(Semaphore::new(workers));
    while let Some(job) = rx.recv().await {
        let Ok(permit) = permits.clone().acquire_owned().await else {
            break;
        };
        let runner = runner.clone();
        let lane = lane.clone();
        tokio::spawn(async move {
            let _permit = permit;
            process(job, runner.as_ref(), &lane, retry).await;
        });
    }
    debug!("Parallel lane closed");
}

async fn process(mut job: Job, runner: &dyn TaskRunner, lane: &JobSender, retry: RetryPolicy) {
    job.attempts += 1;
    let result = match runner.run(&job.task).await {
        Ok(()) => TaskResult::Succeeded {
            attempts: job.attempts,
        },
        Err(e) if e.is_retryable() && job.attempts < retry.max_attempts => {
            warn!(
                task_type = %job.task.task_type,
                key = %job.task.key(),
                attempt = job.attempts,
                error = %e,
                "Retryable task failure; re-queueing"
            );
            runner.on_retry(&job.task, &e, job.attempts).await;
            requeue(job, lane.clone(), retry.backoff);
            return;
        }
        Err(e) => {
            runner.on_failed(&job.task, &e, job.attempts).await;
            TaskResult::Failed {
                attempts: job.attempts,
                error: error_chain(&e),
            }
        }
    };
    if let Some(done) = job.done.take() {
        let _ = done.send(result);
    }
}

fn requeue(job: Job, lane: JobSender, backoff: Duration) {
    if backoff.is_zero() {
        if let Err(mpsc::error::SendError(job)) = lane.send(job) {
            warn!(key = %job.task.key(), "Task queue is closed; retry dropped");
        }
        return;
    }
    tokio::spawn(async move {
        tokio::time::sleep(backoff).await;
        if let Err(mpsc::error::SendError(job)) = lane.send(job) {
            warn!(key = %job.task.key(), "Task queue is closed; retry dropped");
        }
    });
}
