//! Ordered, awaited writes for critical transitions.
//!
//! Each step is recorded in the shared job store before it runs, so a crash
//! mid-pipeline leaves the write for the drain loop. Soft failures (offline,
//! unreachable, parent not synced yet) keep the record queued and let the
//! caller proceed; a remote rejection is a hard failure.

use rally_proto::{JobAction, NewJob, Resource, SyncJob};
use serde::Serialize;
use serde_json::Value;
use std::sync::Arc;
use std::time::Duration;
use tokio::sync::watch;
use tracing::{debug, error, warn};

use crate::error::{RemoteError, SyncResult};
use crate::queue::{Connectivity, JobStore, RemoteWriter, SyncQueue, WriteOutcome};

/// Context for a rejected step.
#[derive(Debug, Clone, PartialEq, Eq, Serialize)]
pub struct StepDiagnostic {
    pub job_id: String,
    pub operation: JobAction,
    pub resource: Resource,
    pub code: Option<String>,
    pub message: String,
    pub details: Option<String>,
    pub hint: Option<String>,
}

#[derive(Debug, Clone, PartialEq, Eq, Serialize)]
#[serde(tag = "outcome", rename_all = "snake_case")]
pub enum StepOutcome {
    Success,
    /// Record stayed queued for the drain loop.
    Offline { reason: String },
    Error(StepDiagnostic),
}

impl StepOutcome {
    pub fn is_success(&self) -> bool {
        matches!(self, StepOutcome::Success)
    }

    pub fn is_offline(&self) -> bool {
        matches!(self, StepOutcome::Offline { .. })
    }

    pub fn is_error(&self) -> bool {
        matches!(self, StepOutcome::Error(_))
    }
}

#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize)]
#[serde(rename_all = "snake_case")]
pub enum StepId {
    Point,
    Period,
    Done,
}

#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize)]
#[serde(rename_all = "snake_case")]
pub enum StepState {
    Pending,
    InProgress,
    Done,
    Warning,
    Error,
}

#[derive(Debug, Clone, PartialEq, Eq, Serialize)]
pub struct StepProgress {
    pub id: StepId,
    pub state: StepState,
    pub detail: Option<String>,
}

/// Writes that close one period.
#[derive(Debug, Clone, PartialEq)]
pub struct PeriodClose {
    /// Final scoring event, if it still needs flushing.
    pub last_point: Option<Value>,
    /// Update for the period record; must carry `external_id`.
    pub period: Value,
    /// Optional follow-up update for the match record.
    pub match_update: Option<Value>,
}

#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize)]
pub struct PipelineResult {
    pub success: bool,
    pub has_warning: bool,
}

pub struct SequentialSync {
    store: Arc<dyn JobStore>,
    writer: Option<Arc<dyn RemoteWriter>>,
    connectivity: Connectivity,
    timeout: Duration,
    progress: watch::Sender<Vec<StepProgress>>,
}

impl SequentialSync {
    pub fn new(
        store: Arc<dyn JobStore>,
        writer: Option<Arc<dyn RemoteWriter>>,
        connectivity: Connectivity,
        timeout: Duration,
    ) -> Self {
        let (progress, _) = watch::channel(Vec::new());
        Self {
            store,
            writer,
            connectivity,
            timeout,
            progress,
        }
    }

    /// Shares the queue's store, writer and online flag.
    pub fn for_queue(queue: &SyncQueue, timeout: Duration) -> Self {
        Self::new(queue.store(), queue.writer(), queue.connectivity(), timeout)
    }

    pub fn watch_progress(&self) -> watch::Receiver<Vec<StepProgress>> {
        self.progress.subscribe()
    }

    pub fn progress(&self) -> Vec<StepProgress> {
        self.progress.borrow().clone()
    }

    /// Records `job`, then applies it and waits for the outcome.
    pub async fn run_step(&self, job: NewJob) -> SyncResult<StepOutcome> {
        let record = self.store.append(job).await?;

        let Some(writer) = self.writer.as_ref() else {
            return Ok(StepOutcome::Offline {
                reason: "remote store not configured".into(),
            });
        };
        if !self.connectivity.is_online() {
            return Ok(StepOutcome::Offline {
                reason: "offline".into(),
            });
        }

        let attempt = tokio::time::timeout(self.timeout, writer.write(&record)).await;
        let result = match attempt {
            Ok(result) => result,
            Err(_) => {
                warn!(
                    target = "rally.sequential",
                    job_id = %record.id,
                    timeout_ms = u64::try_from(self.timeout.as_millis()).unwrap_or(u64::MAX),
                    "step timed out; left queued"
                );
                return Ok(StepOutcome::Offline {
                    reason: format!("timed out after {} ms", self.timeout.as_millis()),
                });
            }
        };

        match result {
            Ok(WriteOutcome::Applied) => {
                self.store.mark_sent(&record.id).await?;
                debug!(
                    target = "rally.sequential",
                    job_id = %record.id,
                    resource = %record.resource,
                    action = %record.action,
                    "step applied"
                );
                Ok(StepOutcome::Success)
            }
            Ok(WriteOutcome::RetryLater) => Ok(StepOutcome::Offline {
                reason: "parent match not synced yet".into(),
            }),
            Err(RemoteError::Unreachable(reason)) => {
                warn!(target = "rally.sequential", job_id = %record.id, error = %reason, "remote unreachable; left queued");
                Ok(StepOutcome::Offline { reason })
            }
            Err(err @ RemoteError::Rejected { .. }) => {
                self.store.mark_error(&record.id, &err).await?;
                let diag = diagnostic(&record, err);
                error!(
                    target = "rally.sequential",
                    job_id = %record.id,
                    action = %record.action,
                    resource = %record.resource,
                    code = diag.code.as_deref().unwrap_or("none"),
                    details = diag.details.as_deref().unwrap_or(""),
                    hint = diag.hint.as_deref().unwrap_or(""),
                    payload = %record.payload,
                    "step rejected: {}",
                    diag.message
                );
                Ok(StepOutcome::Error(diag))
            }
        }
    }

    /// Flushes the last point, closes the period (and optionally the match),
    /// publishing per-step progress along the way.
    pub async fn sync_period_end(&self, close: PeriodClose) -> SyncResult<PipelineResult> {
        self.progress.send_replace(
            [StepId::Point, StepId::Period, StepId::Done]
                .into_iter()
                .map(|id| StepProgress {
                    id,
                    state: StepState::Pending,
                    detail: None,
                })
                .collect(),
        );
        let mut has_error = false;
        let mut has_warning = false;

        self.set_step(StepId::Point, StepState::InProgress, None);
        match close.last_point {
            Some(point) => {
                let outcome = self
                    .run_step(NewJob::new(Resource::Event, JobAction::Insert, point))
                    .await?;
                let state = self.tally(&outcome, &mut has_error, &mut has_warning);
                self.set_step(StepId::Point, state, describe(&outcome));
            }
            None => self.set_step(StepId::Point, StepState::Done, None),
        }

        self.set_step(StepId::Period, StepState::InProgress, None);
        let outcome = self
            .run_step(NewJob::new(Resource::Period, JobAction::Update, close.period))
            .await?;
        let mut state = self.tally(&outcome, &mut has_error, &mut has_warning);
        let mut detail = describe(&outcome);
        if let Some(update) = close.match_update {
            let outcome = self
                .run_step(NewJob::new(Resource::Match, JobAction::Update, update))
                .await?;
            let match_state = self.tally(&outcome, &mut has_error, &mut has_warning);
            if match_state == StepState::Error || (match_state == StepState::Warning && state != StepState::Error) {
                state = match_state;
                detail = describe(&outcome);
            }
        }
        self.set_step(StepId::Period, state, detail);

        self.set_step(StepId::Done, StepState::Done, None);
        Ok(PipelineResult {
            success: !has_error,
            has_warning,
        })
    }

    fn tally(&self, outcome: &StepOutcome, has_error: &mut bool, has_warning: &mut bool) -> StepState {
        match outcome {
            StepOutcome::Success => StepState::Done,
            StepOutcome::Offline { .. } => {
                *has_warning = true;
                StepState::Warning
            }
            StepOutcome::Error(_) => {
                *has_error = true;
                StepState::Error
            }
        }
    }

    fn set_step(&self, id: StepId, state: StepState, detail: Option<String>) {
        self.progress.send_modify(|steps| {
            if let Some(step) = steps.iter_mut().find(|s| s.id == id) {
                step.state = state;
                step.detail = detail;
            }
        });
    }
}

fn diagnostic(record: &SyncJob, err: RemoteError) -> StepDiagnostic {
    let (code, message, details, hint) = match err {
        RemoteError::Rejected {
            code,
            message,
            details,
            hint,
        } => (code, message, details, hint),
        RemoteError::Unreachable(message) => (None, message, None, None),
    };
    StepDiagnostic {
        job_id: record.id.clone(),
        operation: record.action,
        resource: record.resource,
        code,
        message,
        details,
        hint,
    }
}

fn describe(outcome: &StepOutcome) -> Option<String> {
    match outcome {
        StepOutcome::Success => None,
        StepOutcome::Offline { reason } => Some(reason.clone()),
        StepOutcome::Error(diag) => Some(match &diag.code {
            Some(code) => format!("{code}: {}", diag.message),
            None => diag.message.clone(),
        }),
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::queue::InMemoryJobStore;
    use async_trait::async_trait;
    use parking_lot::Mutex;
    use rally_proto::JobStatus;
    use serde_json::json;

    #[derive(Default)]
    struct StepWriter {
        reject: Mutex<Option<Resource>>,
        unreachable: Mutex<Option<Resource>>,
        stall: bool,
        applied: Mutex<Vec<Resource>>,
    }

    #[async_trait]
    impl RemoteWriter for StepWriter {
        async fn write(&self, job: &SyncJob) -> Result<WriteOutcome, RemoteError> {
            if self.stall {
                std::future::pending::<()>().await;
            }
            if *self.reject.lock() == Some(job.resource) {
                return Err(RemoteError::Rejected {
                    code: Some("23505".into()),
                    message: "duplicate key".into(),
                    details: Some("Key (external_id) already exists.".into()),
                    hint: None,
                });
            }
            if *self.unreachable.lock() == Some(job.resource) {
                return Err(RemoteError::Unreachable("connection reset".into()));
            }
            self.applied.lock().push(job.resource);
            Ok(WriteOutcome::Applied)
        }

        async fn probe(&self) -> Result<(), RemoteError> {
            Ok(())
        }
    }

    fn executor(writer: StepWriter) -> (SequentialSync, Arc<InMemoryJobStore>, Arc<StepWriter>) {
        let store = InMemoryJobStore::new();
        let writer = Arc::new(writer);
        let sync = SequentialSync::new(
            store.clone(),
            Some(writer.clone()),
            Connectivity::new(true),
            Duration::from_secs(10),
        );
        (sync, store, writer)
    }

    fn close(with_point: bool, with_match: bool) -> PeriodClose {
        PeriodClose {
            last_point: with_point.then(|| json!({"external_id": "E9", "match_id": "M1", "type": "point"})),
            period: json!({"external_id": "M1-1", "finished": true}),
            match_update: with_match.then(|| json!({"external_id": "M1", "current_set": 2})),
        }
    }

    fn states(sync: &SequentialSync) -> Vec<StepState> {
        sync.progress().into_iter().map(|s| s.state).collect()
    }

    #[tokio::test]
    async fn steps_apply_in_order() {
        let (sync, store, writer) = executor(StepWriter::default());
        let result = sync.sync_period_end(close(true, true)).await.unwrap();
        assert_eq!(
            result,
            PipelineResult {
                success: true,
                has_warning: false
            }
        );
        assert_eq!(
            writer.applied.lock().as_slice(),
            [Resource::Event, Resource::Period, Resource::Match]
        );
        assert_eq!(states(&sync), [StepState::Done; 3]);
        assert_eq!(store.counts().await.unwrap().sent, 3);
    }

    #[tokio::test]
    async fn rejection_is_a_hard_failure_with_context() {
        let (sync, store, writer) = executor(StepWriter::default());
        *writer.reject.lock() = Some(Resource::Period);
        let outcome = sync
            .run_step(NewJob::new(Resource::Period, JobAction::Update, json!({"external_id": "M1-1"})))
            .await
            .unwrap();
        let StepOutcome::Error(diag) = outcome else {
            panic!("expected error, got {outcome:?}");
        };
        assert_eq!(diag.code.as_deref(), Some("23505"));
        assert_eq!(diag.resource, Resource::Period);
        assert_eq!(diag.operation, JobAction::Update);
        assert!(diag.details.is_some());
        let stored = store.get(&diag.job_id).await.unwrap().unwrap();
        assert_eq!(stored.status, JobStatus::Error);
    }

    #[tokio::test]
    async fn offline_steps_stay_queued_and_warn() {
        let store = InMemoryJobStore::new();
        let sync = SequentialSync::new(
            store.clone(),
            Some(Arc::new(StepWriter::default())),
            Connectivity::new(false),
            Duration::from_secs(10),
        );
        let result = sync.sync_period_end(close(true, false)).await.unwrap();
        assert!(result.success);
        assert!(result.has_warning);
        assert_eq!(states(&sync), [StepState::Warning, StepState::Warning, StepState::Done]);
        assert_eq!(store.counts().await.unwrap().queued, 2);
    }

    #[tokio::test]
    async fn failed_match_update_marks_period_step() {
        let (sync, _, writer) = executor(StepWriter::default());
        *writer.reject.lock() = Some(Resource::Match);
        let result = sync.sync_period_end(close(false, true)).await.unwrap();
        assert!(!result.success);
        assert_eq!(states(&sync), [StepState::Done, StepState::Error, StepState::Done]);

        let (sync, _, writer) = executor(StepWriter::default());
        *writer.unreachable.lock() = Some(Resource::Match);
        let result = sync.sync_period_end(close(false, true)).await.unwrap();
        assert!(result.success);
        assert!(result.has_warning);
        assert_eq!(states(&sync), [StepState::Done, StepState::Warning, StepState::Done]);
    }

    #[tokio::test(start_paused = true)]
    async fn timeout_is_soft() {
        let (sync, store, _) = executor(StepWriter {
            stall: true,
            ..StepWriter::default()
        });
        let outcome = sync
            .run_step(NewJob::new(Resource::Match, JobAction::Insert, json!({"external_id": "M1"})))
            .await
            .unwrap();
        assert!(outcome.is_offline());
        assert_eq!(store.counts().await.unwrap().queued, 1);
    }

    #[tokio::test]
    async fn unconfigured_remote_is_offline() {
        let store = InMemoryJobStore::new();
        let sync = SequentialSync::new(store.clone(), None, Connectivity::new(true), Duration::from_secs(1));
        let outcome = sync
            .run_step(NewJob::new(Resource::Match, JobAction::Insert, json!({"external_id": "M1"})))
            .await
            .unwrap();
        assert!(outcome.is_offline());
        assert_eq!(store.counts().await.unwrap().queued, 1);
    }
}
