//! Request lifecycle.
//!
//! ```text
//! ACCEPTED ──enqueue──► QUEUED ──first task──► RUNNING ──all outcomes──► COMPLETED | FAILED
//! ```
//!
//! Every task ends in exactly one outcome for its key. When the last
//! expected outcome arrives the request is finalized under the progress
//! lock, so two tasks finishing together cannot both finalize it.

use std::collections::{BTreeMap, BTreeSet, HashMap};
use std::sync::Arc;

use serde::{Deserialize, Serialize};
use tokio::sync::{watch, Mutex};
use tracing::{debug, info, warn};
use uuid::Uuid;

use crate::audit::AuditLogger;
use crate::error::{IgsnError, Result};
use crate::store::RegistryStore;
use crate::types::{
    IdentifierOutcome, IdentifierStatus, IdentifierType, OutcomeStatus, Request, RequestReport,
    RequestStatus, RequestSummary, RequestType,
};

/// Decides the terminal status from the per-identifier counts.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Default, Serialize, Deserialize)]
#[serde(rename_all = "snake_case")]
pub enum CompletionPolicy {
    /// Any failed identifier fails the request.
    #[default]
    AnyFailure,
    /// Fails when more than half the identifiers failed.
    Majority,
    /// Fails only when every identifier failed.
    AllFailed,
}

impl CompletionPolicy {
    pub fn final_status(&self, summary: &RequestSummary) -> RequestStatus {
        let failed = match self {
            Self::AnyFailure => summary.failed > 0,
            Self::Majority => summary.failed * 2 > summary.total,
            Self::AllFailed => summary.total > 0 && summary.failed == summary.total,
        };
        if failed {
            RequestStatus::Failed
        } else {
            RequestStatus::Completed
        }
    }
}

#[derive(Default)]
struct Progress {
    expected: BTreeSet<String>,
    outcomes: BTreeMap<String, IdentifierOutcome>,
    started: bool,
}

impl Progress {
    fn is_done(&self) -> bool {
        self.expected.iter().all(|k| self.outcomes.contains_key(k))
    }

    fn summary(&self) -> RequestSummary {
        let failed = self
            .outcomes
            .values()
            .filter(|o| o.status == OutcomeStatus::Failed)
            .count();
        RequestSummary {
            total: self.outcomes.len(),
            completed: self.outcomes.len() - failed,
            failed,
        }
    }
}

pub struct RequestStateMachine {
    store: Arc<dyn RegistryStore>,
    audit: Arc<AuditLogger>,
    policy: CompletionPolicy,
    progress: Mutex<HashMap<Uuid, Progress>>,
    watchers: std::sync::Mutex<HashMap<Uuid, watch::Sender<RequestStatus>>>,
}

impl RequestStateMachine {
    pub fn new(
        store: Arc<dyn RegistryStore>,
        audit: Arc<AuditLogger>,
        policy: CompletionPolicy,
    ) -> Self {
        Self {
            store,
            audit,
            policy,
            progress: Mutex::new(HashMap::new()),
            watchers: std::sync::Mutex::new(HashMap::new()),
        }
    }

    pub fn policy(&self) -> CompletionPolicy {
        self.policy
    }

    pub fn audit(&self) -> &Arc<AuditLogger> {
        &self.audit
    }

    pub async fn create_request(
        &self,
        created_by: &str,
        request_type: RequestType,
        attributes: BTreeMap<String, String>,
        manual: bool,
    ) -> Result<Request> {
        let request = Request::new(request_type, created_by, attributes, manual);
        self.store.save_request(&request).await?;
        info!(
            request_id = %request.id,
            request_type = %request.request_type,
            created_by,
            "Request accepted"
        );
        Ok(request)
    }

    pub async fn load(&self, request_id: Uuid) -> Result<Request> {
        self.store
            .find_request(request_id)
            .await?
            .ok_or_else(|| IgsnError::not_found("request", request_id.to_string()))
    }

    /// ACCEPTED → QUEUED, registering the outcome keys the request waits for.
    /// Must run before any of the request's tasks are submitted. With no keys
    /// the request finalizes immediately.
    pub async fn enqueue(&self, request_id: Uuid, keys: &[String]) -> Result<Request> {
        let mut progress = self.progress.lock().await;
        let mut request = self.load(request_id).await?;
        request.transition_to(RequestStatus::Queued)?;
        self.store.save_request(&request).await?;
        info!(request_id = %request_id, tasks = keys.len(), "Request queued");

        let entry = Progress {
            expected: keys.iter().cloned().collect(),
            ..Default::default()
        };
        if entry.expected.is_empty() {
            return self.finalize(request, &entry).await;
        }
        progress.insert(request_id, entry);
        Ok(request)
    }

    /// First call per request moves it to RUNNING and opens its audit log.
    pub async fn on_task_started(&self, request_id: Uuid) -> Result<()> {
        let mut progress = self.progress.lock().await;
        let Some(entry) = progress.get_mut(&request_id) else {
            debug!(request_id = %request_id, "Task started for an untracked request");
            return Ok(());
        };
        if entry.started {
            return Ok(());
        }
        self.start_running(request_id).await?;
        entry.started = true;
        Ok(())
    }

    pub async fn on_task_completed(
        &self,
        request_id: Uuid,
        key: &str,
        identifier_status: Option<IdentifierStatus>,
    ) -> Result<()> {
        self.record_outcome(
            request_id,
            IdentifierOutcome {
                key: key.to_string(),
                status: OutcomeStatus::Completed,
                error: None,
                identifier_status,
            },
        )
        .await
    }

    /// `error` is the full cause chain and goes to the audit log verbatim.
    pub async fn on_task_failed(&self, request_id: Uuid, key: &str, error: &str) -> Result<()> {
        let identifier_status = self
            .store
            .find_identifier(key, IdentifierType::Igsn)
            .await?
            .map(|identifier| identifier.status);
        self.record_outcome(
            request_id,
            IdentifierOutcome {
                key: key.to_string(),
                status: OutcomeStatus::Failed,
                error: Some(error.to_string()),
                identifier_status,
            },
        )
        .await
    }

    async fn record_outcome(&self, request_id: Uuid, outcome: IdentifierOutcome) -> Result<()> {
        let mut progress = self.progress.lock().await;
        let Some(entry) = progress.get_mut(&request_id) else {
            warn!(
                request_id = %request_id,
                key = %outcome.key,
                "Outcome for a request that is not in flight; ignored"
            );
            return Ok(());
        };

        if !entry.started {
            self.start_running(request_id).await?;
            entry.started = true;
        }
        match outcome.status {
            OutcomeStatus::Completed => {
                let status = outcome
                    .identifier_status
                    .map(|s| s.to_string())
                    .unwrap_or_else(|| "done".to_string());
                self.audit
                    .info(request_id, &format!("{} completed ({status})", outcome.key))
                    .await;
            }
            OutcomeStatus::Failed => {
                let error = outcome.error.as_deref().unwrap_or("unknown error");
                self.audit
                    .error(request_id, &format!("{} failed: {error}", outcome.key))
                    .await;
            }
        }
        self.store.save_outcome(request_id, &outcome).await?;
        entry.outcomes.insert(outcome.key.clone(), outcome);

        if !entry.is_done() {
            return Ok(());
        }
        if let Some(entry) = progress.remove(&request_id) {
            let request = self.load(request_id).await?;
            self.finalize(request, &entry).await?;
        }
        Ok(())
    }

    async fn start_running(&self, request_id: Uuid) -> Result<()> {
        let mut request = self.load(request_id).await?;
        if request.status != RequestStatus::Queued {
            return Ok(());
        }
        request.transition_to(RequestStatus::Running)?;
        self.store.save_request(&request).await?;
        self.audit.open(request_id).await?;
        self.audit
            .info(
                request_id,
                &format!("Job started: {} request", request.request_type),
            )
            .await;
        self.notify(request_id, RequestStatus::Running);
        Ok(())
    }

    /// Caller holds the progress lock.
    async fn finalize(&self, mut request: Request, progress: &Progress) -> Result<Request> {
        if request.status == RequestStatus::Queued {
            self.start_running(request.id).await?;
            request = self.load(request.id).await?;
        }
        let summary = progress.summary();
        let status = self.policy.final_status(&summary);
        request.summary = Some(summary.clone());
        request.transition_to(status)?;
        self.store.save_request(&request).await?;

        self.audit
            .info(
                request.id,
                &format!(
                    "Job finished: {status} (total {}, completed {}, failed {})",
                    summary.total, summary.completed, summary.failed
                ),
            )
            .await;
        self.audit.close(request.id).await;
        info!(
            request_id = %request.id,
            status = %status,
            total = summary.total,
            failed = summary.failed,
            "Request finalized"
        );
        self.notify(request.id, status);
        Ok(request)
    }

    fn notify(&self, request_id: Uuid, status: RequestStatus) {
        let Ok(mut watchers) = self.watchers.lock() else {
            warn!(request_id = %request_id, "Watcher lock poisoned; waiters not notified");
            return;
        };
        if status.is_terminal() {
            if let Some(sender) = watchers.remove(&request_id) {
                sender.send_replace(status);
            }
        } else if let Some(sender) = watchers.get(&request_id) {
            sender.send_replace(status);
        }
    }

    fn subscribe(&self, request_id: Uuid) -> Result<watch::Receiver<RequestStatus>> {
        let mut watchers = self
            .watchers
            .lock()
            .map_err(|_| IgsnError::Internal(anyhow::anyhow!("watcher lock poisoned")))?;
        let sender = watchers
            .entry(request_id)
            .or_insert_with(|| watch::channel(RequestStatus::Accepted).0);
        Ok(sender.subscribe())
    }

    pub async fn report(&self, request_id: Uuid) -> Result<RequestReport> {
        let request = self.load(request_id).await?;
        let outcomes = self.store.outcomes(request_id).await?;
        Ok(RequestReport { request, outcomes })
    }

    /// Resolve once the request is COMPLETED or FAILED.
    pub async fn wait_for_completion(&self, request_id: Uuid) -> Result<RequestReport> {
        let mut rx = self.subscribe(request_id)?;
        let request = self.load(request_id).await?;
        if request.status.is_terminal() {
            if let Ok(mut watchers) = self.watchers.lock() {
                watchers.remove(&request_id);
            }
        } else if rx.wait_for(|s| s.is_terminal()).await.is_err() {
            // Sender was removed by a finalize that raced the subscription.
            debug!(request_id = %request_id, "Watcher closed; reading stored status");
        }
        self.report(request_id).await
    }
}
