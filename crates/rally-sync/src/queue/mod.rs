//! Offline write queue.
//!
//! Callers append jobs and move on. A background worker drains the store on
//! a fixed interval, one bounded batch at a time, in enqueue order. Nothing
//! is attempted while offline; a rejected job stays `error` until
//! [`SyncQueue::retry_all`].

use parking_lot::Mutex;
use rally_proto::{NewJob, SyncJob};
use serde::Serialize;
use std::sync::atomic::{AtomicBool, Ordering};
use std::sync::Arc;
use std::time::Duration;
use tokio::sync::watch;
use tokio::task::JoinHandle;
use tokio::time::{Instant, MissedTickBehavior};
use tracing::{debug, info, warn};

use crate::config::SyncConfig;
use crate::error::{RemoteError, SyncResult};
use crate::log_throttle::{should_log, ThrottleKind};

pub mod remote;
pub mod store;

pub use remote::{RemoteWriter, RestWriter, WriteOutcome};
pub use store::{InMemoryJobStore, JobCounts, JobStore, SqliteJobStore};

/// Aggregate queue state shown to the user.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize)]
#[serde(rename_all = "snake_case")]
pub enum QueueStatus {
    Offline,
    Syncing,
    Synced,
    Error,
}

/// Shared online flag. The queue and the sequential executor read the same one.
#[derive(Debug, Clone)]
pub struct Connectivity(Arc<AtomicBool>);

impl Connectivity {
    pub fn new(online: bool) -> Self {
        Self(Arc::new(AtomicBool::new(online)))
    }

    pub fn is_online(&self) -> bool {
        self.0.load(Ordering::SeqCst)
    }

    fn set(&self, online: bool) -> bool {
        self.0.swap(online, Ordering::SeqCst)
    }
}

#[derive(Debug, Clone)]
pub struct QueueSettings {
    pub interval: Duration,
    pub batch_size: usize,
    pub connection_check: Duration,
    pub max_dependency_retries: u32,
    pub sent_retention: Duration,
}

impl QueueSettings {
    pub fn from_config(cfg: &SyncConfig) -> Self {
        Self {
            interval: cfg.queue_interval(),
            batch_size: cfg.queue_batch_size.max(1),
            connection_check: cfg.connection_check(),
            max_dependency_retries: cfg.max_dependency_retries,
            sent_retention: cfg.sent_retention(),
        }
    }
}

/// What one drain pass did.
#[derive(Debug, Clone, Copy, Default, PartialEq, Eq, Serialize)]
pub struct DrainReport {
    pub skipped: bool,
    pub applied: usize,
    pub deferred: usize,
    pub failed: usize,
}

#[derive(Clone)]
pub struct SyncQueue {
    inner: Arc<QueueInner>,
}

struct QueueInner {
    store: Arc<dyn JobStore>,
    writer: Option<Arc<dyn RemoteWriter>>,
    settings: QueueSettings,
    connectivity: Connectivity,
    busy: AtomicBool,
    verified_at: Mutex<Option<Instant>>,
    status: watch::Sender<QueueStatus>,
}

struct BusyGuard<'a>(&'a AtomicBool);

impl Drop for BusyGuard<'_> {
    fn drop(&mut self) {
        self.0.store(false, Ordering::SeqCst);
    }
}

impl SyncQueue {
    /// `writer` is `None` when no remote is configured; the queue then only
    /// accumulates jobs.
    pub fn new(store: Arc<dyn JobStore>, writer: Option<Arc<dyn RemoteWriter>>, settings: QueueSettings) -> Self {
        let (status, _) = watch::channel(QueueStatus::Offline);
        Self {
            inner: Arc::new(QueueInner {
                store,
                writer,
                settings,
                connectivity: Connectivity::new(true),
                busy: AtomicBool::new(false),
                verified_at: Mutex::new(None),
                status,
            }),
        }
    }

    pub fn store(&self) -> Arc<dyn JobStore> {
        Arc::clone(&self.inner.store)
    }

    pub fn writer(&self) -> Option<Arc<dyn RemoteWriter>> {
        self.inner.writer.clone()
    }

    pub fn connectivity(&self) -> Connectivity {
        self.inner.connectivity.clone()
    }

    pub fn status(&self) -> QueueStatus {
        *self.inner.status.borrow()
    }

    pub fn watch_status(&self) -> watch::Receiver<QueueStatus> {
        self.inner.status.subscribe()
    }

    /// Appends a job; the worker picks it up on a later tick.
    pub async fn enqueue(&self, job: NewJob) -> SyncResult<SyncJob> {
        let record = self.inner.store.append(job).await?;
        debug!(
            target = "rally.queue",
            job_id = %record.id,
            resource = %record.resource,
            action = %record.action,
            "job queued"
        );
        Ok(record)
    }

    pub fn set_online(&self, online: bool) {
        let was = self.inner.connectivity.set(online);
        if was == online {
            return;
        }
        *self.inner.verified_at.lock() = None;
        if online {
            info!(target = "rally.queue", "back online");
        } else {
            info!(target = "rally.queue", "offline; holding jobs");
            self.inner.publish(QueueStatus::Offline);
        }
    }

    pub async fn counts(&self) -> SyncResult<JobCounts> {
        Ok(self.inner.store.counts().await?)
    }

    pub async fn error_count(&self) -> SyncResult<usize> {
        Ok(self.inner.store.counts().await?.error)
    }

    /// Drops sent jobs older than the retention window.
    pub async fn prune_sent(&self) -> SyncResult<usize> {
        let retention = i64::try_from(self.inner.settings.sent_retention.as_millis()).unwrap_or(i64::MAX);
        let cutoff = chrono::Utc::now().timestamp_millis().saturating_sub(retention);
        let pruned = self.inner.store.prune_sent(cutoff).await?;
        if pruned > 0 {
            debug!(target = "rally.queue", pruned, "pruned sent jobs");
        }
        Ok(pruned)
    }

    /// Requeues every errored job and drains immediately.
    pub async fn retry_all(&self) -> SyncResult<usize> {
        self.prune_sent().await?;
        let reset = self.inner.store.reset_errors().await?;
        if reset > 0 {
            info!(target = "rally.queue", reset, "retrying errored jobs");
            self.drain_once().await?;
        }
        Ok(reset)
    }

    /// One drain pass. Returns immediately with `skipped` when another pass
    /// is in flight.
    pub async fn drain_once(&self) -> SyncResult<DrainReport> {
        let inner = &self.inner;
        if inner.busy.swap(true, Ordering::SeqCst) {
            return Ok(DrainReport {
                skipped: true,
                ..DrainReport::default()
            });
        }
        let _guard = BusyGuard(&inner.busy);

        let Some(writer) = inner.writer.as_ref() else {
            inner.publish(QueueStatus::Offline);
            return Ok(DrainReport::default());
        };
        if !inner.connectivity.is_online() {
            inner.publish(QueueStatus::Offline);
            return Ok(DrainReport::default());
        }
        if !inner.verify(writer.as_ref()).await {
            return Ok(DrainReport::default());
        }

        let batch = inner.store.queued_batch(inner.settings.batch_size).await?;
        let mut report = DrainReport::default();
        if !batch.is_empty() {
            inner.publish(QueueStatus::Syncing);
            debug!(target = "rally.queue", jobs = batch.len(), "draining batch");
        }

        for job in &batch {
            match writer.write(job).await {
                Ok(WriteOutcome::Applied) => {
                    inner.store.mark_sent(&job.id).await?;
                    report.applied += 1;
                }
                Ok(WriteOutcome::RetryLater) => {
                    if job.retry_count >= inner.settings.max_dependency_retries {
                        warn!(
                            target = "rally.queue",
                            job_id = %job.id,
                            resource = %job.resource,
                            retries = job.retry_count,
                            "parent match never synced; marking job as error"
                        );
                        let err = RemoteError::rejected("DEPENDENCY_TIMEOUT", "parent match is not synced");
                        inner.store.mark_error(&job.id, &err).await?;
                        report.failed += 1;
                    } else {
                        inner.store.set_retry_count(&job.id, job.retry_count + 1).await?;
                        report.deferred += 1;
                    }
                }
                Err(err) if err.is_unreachable() => {
                    if should_log(ThrottleKind::QueueProbe, "drain") {
                        warn!(target = "rally.queue", error = %err, "remote became unreachable mid-batch");
                    }
                    *inner.verified_at.lock() = None;
                    inner.publish(QueueStatus::Offline);
                    return Ok(report);
                }
                Err(err) => {
                    warn!(
                        target = "rally.queue",
                        job_id = %job.id,
                        resource = %job.resource,
                        action = %job.action,
                        code = err.code().unwrap_or("none"),
                        error = %err,
                        "remote rejected job"
                    );
                    inner.store.mark_error(&job.id, &err).await?;
                    report.failed += 1;
                }
            }
        }

        let counts = inner.store.counts().await?;
        let status = if counts.error > 0 {
            QueueStatus::Error
        } else if counts.queued > 0 {
            QueueStatus::Syncing
        } else {
            QueueStatus::Synced
        };
        inner.publish(status);
        Ok(report)
    }

    /// Starts the interval worker.
    pub fn spawn_worker(&self) -> QueueWorker {
        let queue = self.clone();
        let period = self.inner.settings.interval;
        let task = tokio::spawn(async move {
            if let Err(err) = queue.prune_sent().await {
                warn!(target = "rally.queue", error = %err, "pruning sent jobs failed");
            }
            let mut ticker = tokio::time::interval(period);
            ticker.set_missed_tick_behavior(MissedTickBehavior::Skip);
            loop {
                ticker.tick().await;
                if let Err(err) = queue.drain_once().await {
                    warn!(target = "rally.queue", error = %err, "drain pass failed");
                    queue.inner.publish(QueueStatus::Error);
                }
            }
        });
        QueueWorker { task }
    }
}

impl QueueInner {
    fn publish(&self, status: QueueStatus) {
        self.status.send_if_modified(|current| {
            if *current == status {
                false
            } else {
                *current = status;
                true
            }
        });
    }

    /// Probes the remote at most once per `connection_check`.
    async fn verify(&self, writer: &dyn RemoteWriter) -> bool {
        let fresh = self
            .verified_at
            .lock()
            .is_some_and(|at| at.elapsed() < self.settings.connection_check);
        if fresh {
            return true;
        }
        match writer.probe().await {
            Ok(()) => {
                *self.verified_at.lock() = Some(Instant::now());
                true
            }
            Err(err) => {
                if should_log(ThrottleKind::QueueProbe, "probe") {
                    warn!(target = "rally.queue", error = %err, "remote probe failed");
                }
                self.publish(if err.is_unreachable() {
                    QueueStatus::Offline
                } else {
                    QueueStatus::Error
                });
                false
            }
        }
    }
}

/// Background drain task; stops when dropped.
pub struct QueueWorker {
    task: JoinHandle<()>,
}

impl QueueWorker {
    pub fn stop(self) {}
}

impl Drop for QueueWorker {
    fn drop(&mut self) {
        self.task.abort();
    }
}
