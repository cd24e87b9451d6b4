use async_trait::async_trait;
use rally_proto::{JobStatus, NewJob, SyncJob};
use serde::Serialize;
use sqlx::sqlite::{SqliteConnectOptions, SqliteJournalMode, SqlitePool, SqlitePoolOptions, SqliteRow};
use sqlx::Row;
use std::path::Path;
use std::sync::Arc;
use tokio::sync::Mutex;

use crate::error::{RemoteError, StoreError};

#[derive(Debug, Clone, Copy, Default, PartialEq, Eq, Serialize)]
pub struct JobCounts {
    pub queued: usize,
    pub sent: usize,
    pub error: usize,
}

impl JobCounts {
    pub fn pending(&self) -> usize {
        self.queued + self.error
    }
}

/// Durable job storage shared by the drain loop and the sequential executor.
///
/// Status updates never move a job out of `sent`; implementations ignore
/// such writes rather than failing them.
#[async_trait]
pub trait JobStore: Send + Sync {
    async fn append(&self, job: NewJob) -> Result<SyncJob, StoreError>;

    async fn get(&self, id: &str) -> Result<Option<SyncJob>, StoreError>;

    /// Oldest `limit` queued jobs in enqueue order.
    async fn queued_batch(&self, limit: usize) -> Result<Vec<SyncJob>, StoreError>;

    async fn list(&self, status: Option<JobStatus>) -> Result<Vec<SyncJob>, StoreError>;

    async fn mark_sent(&self, id: &str) -> Result<(), StoreError>;

    async fn mark_error(&self, id: &str, error: &RemoteError) -> Result<(), StoreError>;

    async fn set_retry_count(&self, id: &str, retry_count: u32) -> Result<(), StoreError>;

    /// Moves every `error` job back to `queued` with a fresh retry count.
    async fn reset_errors(&self) -> Result<usize, StoreError>;

    async fn counts(&self) -> Result<JobCounts, StoreError>;

    /// Deletes `sent` jobs enqueued before `before` (unix millis).
    async fn prune_sent(&self, before: i64) -> Result<usize, StoreError>;
}

fn new_record(job: NewJob) -> SyncJob {
    SyncJob::from_new(
        uuid::Uuid::new_v4().to_string(),
        chrono::Utc::now().timestamp_millis(),
        job,
    )
}

fn error_fields(error: &RemoteError) -> (String, Option<String>) {
    match error {
        RemoteError::Unreachable(message) => (message.clone(), None),
        RemoteError::Rejected { code, message, .. } => (message.clone(), code.clone()),
    }
}

/// In-memory adapter for tests and ephemeral sessions.
#[derive(Default)]
pub struct InMemoryJobStore {
    jobs: Mutex<Vec<SyncJob>>,
}

impl InMemoryJobStore {
    pub fn new() -> Arc<Self> {
        Arc::new(Self::default())
    }
}

#[async_trait]
impl JobStore for InMemoryJobStore {
    async fn append(&self, job: NewJob) -> Result<SyncJob, StoreError> {
        let record = new_record(job);
        self.jobs.lock().await.push(record.clone());
        Ok(record)
    }

    async fn get(&self, id: &str) -> Result<Option<SyncJob>, StoreError> {
        Ok(self.jobs.lock().await.iter().find(|j| j.id == id).cloned())
    }

    async fn queued_batch(&self, limit: usize) -> Result<Vec<SyncJob>, StoreError> {
        Ok(self
            .jobs
            .lock()
            .await
            .iter()
            .filter(|j| j.status == JobStatus::Queued)
            .take(limit)
            .cloned()
            .collect())
    }

    async fn list(&self, status: Option<JobStatus>) -> Result<Vec<SyncJob>, StoreError> {
        Ok(self
            .jobs
            .lock()
            .await
            .iter()
            .filter(|j| status.map_or(true, |s| j.status == s))
            .cloned()
            .collect())
    }

    async fn mark_sent(&self, id: &str) -> Result<(), StoreError> {
        if let Some(job) = self.jobs.lock().await.iter_mut().find(|j| j.id == id) {
            job.status = JobStatus::Sent;
            job.retry_count = 0;
            job.error_message = None;
            job.error_code = None;
        }
        Ok(())
    }

    async fn mark_error(&self, id: &str, error: &RemoteError) -> Result<(), StoreError> {
        let mut guard = self.jobs.lock().await;
        if let Some(job) = guard.iter_mut().find(|j| j.id == id) {
            if job.status.can_become(JobStatus::Error) {
                let (message, code) = error_fields(error);
                job.status = JobStatus::Error;
                job.error_message = Some(message);
                job.error_code = code;
            }
        }
        Ok(())
    }

    async fn set_retry_count(&self, id: &str, retry_count: u32) -> Result<(), StoreError> {
        if let Some(job) = self.jobs.lock().await.iter_mut().find(|j| j.id == id) {
            if job.status != JobStatus::Sent {
                job.retry_count = retry_count;
            }
        }
        Ok(())
    }

    async fn reset_errors(&self) -> Result<usize, StoreError> {
        let mut reset = 0;
        for job in self.jobs.lock().await.iter_mut() {
            if job.status == JobStatus::Error {
                job.status = JobStatus::Queued;
                job.retry_count = 0;
                reset += 1;
            }
        }
        Ok(reset)
    }

    async fn counts(&self) -> Result<JobCounts, StoreError> {
        let mut counts = JobCounts::default();
        for job in self.jobs.lock().await.iter() {
            match job.status {
                JobStatus::Queued => counts.queued += 1,
                JobStatus::Sent => counts.sent += 1,
                JobStatus::Error => counts.error += 1,
            }
        }
        Ok(counts)
    }

    async fn prune_sent(&self, before: i64) -> Result<usize, StoreError> {
        let mut jobs = self.jobs.lock().await;
        let len = jobs.len();
        jobs.retain(|j| j.status != JobStatus::Sent || j.timestamp >= before);
        Ok(len - jobs.len())
    }
}

const CREATE_TABLE: &str = "CREATE TABLE IF NOT EXISTS sync_queue (
    seq INTEGER PRIMARY KEY AUTOINCREMENT,
    id TEXT NOT NULL UNIQUE,
    resource TEXT NOT NULL,
    action TEXT NOT NULL,
    payload TEXT NOT NULL,
    timestamp INTEGER NOT NULL,
    status TEXT NOT NULL,
    retry_count INTEGER NOT NULL DEFAULT 0,
    error_message TEXT,
    error_code TEXT
)";

const CREATE_STATUS_INDEX: &str = "CREATE INDEX IF NOT EXISTS sync_queue_status ON sync_queue (status, seq)";

const COLUMNS: &str = "id, resource, action, payload, timestamp, status, retry_count, error_message, error_code";

/// Job store backed by a local sqlite file.
pub struct SqliteJobStore {
    pool: SqlitePool,
}

impl SqliteJobStore {
    pub async fn open(path: &Path) -> Result<Self, StoreError> {
        if let Some(parent) = path.parent().filter(|p| !p.as_os_str().is_empty()) {
            std::fs::create_dir_all(parent)?;
        }
        let options = SqliteConnectOptions::new()
            .filename(path)
            .create_if_missing(true)
            .journal_mode(SqliteJournalMode::Wal);
        let pool = SqlitePoolOptions::new()
            .max_connections(1)
            .connect_with(options)
            .await?;
        sqlx::query(CREATE_TABLE).execute(&pool).await?;
        sqlx::query(CREATE_STATUS_INDEX).execute(&pool).await?;
        tracing::debug!(target = "rally.queue", path = %path.display(), "job store opened");
        Ok(Self { pool })
    }

    fn decode(row: &SqliteRow) -> Result<SyncJob, StoreError> {
        let id: String = row.try_get("id")?;
        let corrupt = |reason: String| StoreError::Corrupt {
            id: id.clone(),
            reason,
        };
        let resource: String = row.try_get("resource")?;
        let action: String = row.try_get("action")?;
        let status: String = row.try_get("status")?;
        let payload: String = row.try_get("payload")?;
        let retry_count: i64 = row.try_get("retry_count")?;
        Ok(SyncJob {
            resource: resource.parse().map_err(|e| corrupt(format!("{e}")))?,
            action: action.parse().map_err(|e| corrupt(format!("{e}")))?,
            status: status.parse().map_err(|e| corrupt(format!("{e}")))?,
            payload: serde_json::from_str(&payload).map_err(|e| corrupt(e.to_string()))?,
            timestamp: row.try_get("timestamp")?,
            retry_count: u32::try_from(retry_count).unwrap_or(0),
            error_message: row.try_get("error_message")?,
            error_code: row.try_get("error_code")?,
            id: id.clone(),
        })
    }

    fn decode_all(rows: &[SqliteRow]) -> Result<Vec<SyncJob>, StoreError> {
        rows.iter().map(Self::decode).collect()
    }
}

#[async_trait]
impl JobStore for SqliteJobStore {
    async fn append(&self, job: NewJob) -> Result<SyncJob, StoreError> {
        let record = new_record(job);
        let payload = serde_json::to_string(&record.payload).map_err(|e| StoreError::Corrupt {
            id: record.id.clone(),
            reason: e.to_string(),
        })?;
        sqlx::query(
            "INSERT INTO sync_queue (id, resource, action, payload, timestamp, status, retry_count)
             VALUES (?, ?, ?, ?, ?, ?, 0)",
        )
        .bind(&record.id)
        .bind(record.resource.as_str())
        .bind(record.action.as_str())
        .bind(payload)
        .bind(record.timestamp)
        .bind(record.status.as_str())
        .execute(&self.pool)
        .await?;
        Ok(record)
    }

    async fn get(&self, id: &str) -> Result<Option<SyncJob>, StoreError> {
        let row = sqlx::query(&format!("SELECT {COLUMNS} FROM sync_queue WHERE id = ?"))
            .bind(id)
            .fetch_optional(&self.pool)
            .await?;
        row.as_ref().map(Self::decode).transpose()
    }

    async fn queued_batch(&self, limit: usize) -> Result<Vec<SyncJob>, StoreError> {
        let rows = sqlx::query(&format!(
            "SELECT {COLUMNS} FROM sync_queue WHERE status = 'queued' ORDER BY seq LIMIT ?"
        ))
        .bind(i64::try_from(limit).unwrap_or(i64::MAX))
        .fetch_all(&self.pool)
        .await?;
        Self::decode_all(&rows)
    }

    async fn list(&self, status: Option<JobStatus>) -> Result<Vec<SyncJob>, StoreError> {
        let rows = match status {
            Some(status) => {
                sqlx::query(&format!("SELECT {COLUMNS} FROM sync_queue WHERE status = ? ORDER BY seq"))
                    .bind(status.as_str())
                    .fetch_all(&self.pool)
                    .await?
            }
            None => {
                sqlx::query(&format!("SELECT {COLUMNS} FROM sync_queue ORDER BY seq"))
                    .fetch_all(&self.pool)
                    .await?
            }
        };
        Self::decode_all(&rows)
    }

    async fn mark_sent(&self, id: &str) -> Result<(), StoreError> {
        sqlx::query(
            "UPDATE sync_queue SET status = 'sent', retry_count = 0, error_message = NULL, error_code = NULL
             WHERE id = ?",
        )
        .bind(id)
        .execute(&self.pool)
        .await?;
        Ok(())
    }

    async fn mark_error(&self, id: &str, error: &RemoteError) -> Result<(), StoreError> {
        let (message, code) = error_fields(error);
        sqlx::query(
            "UPDATE sync_queue SET status = 'error', error_message = ?, error_code = ?
             WHERE id = ? AND status != 'sent'",
        )
        .bind(message)
        .bind(code)
        .bind(id)
        .execute(&self.pool)
        .await?;
        Ok(())
    }

    async fn set_retry_count(&self, id: &str, retry_count: u32) -> Result<(), StoreError> {
        sqlx::query("UPDATE sync_queue SET retry_count = ? WHERE id = ? AND status != 'sent'")
            .bind(i64::from(retry_count))
            .bind(id)
            .execute(&self.pool)
            .await?;
        Ok(())
    }

    async fn reset_errors(&self) -> Result<usize, StoreError> {
        let result = sqlx::query("UPDATE sync_queue SET status = 'queued', retry_count = 0 WHERE status = 'error'")
            .execute(&self.pool)
            .await?;
        Ok(usize::try_from(result.rows_affected()).unwrap_or(usize::MAX))
    }

    async fn counts(&self) -> Result<JobCounts, StoreError> {
        let rows = sqlx::query("SELECT status, COUNT(*) AS n FROM sync_queue GROUP BY status")
            .fetch_all(&self.pool)
            .await?;
        let mut counts = JobCounts::default();
        for row in rows {
            let status: String = row.try_get("status")?;
            let n: i64 = row.try_get("n")?;
            let n = usize::try_from(n).unwrap_or(0);
            match status.as_str() {
                "queued" => counts.queued = n,
                "sent" => counts.sent = n,
                "error" => counts.error = n,
                _ => {}
            }
        }
        Ok(counts)
    }

    async fn prune_sent(&self, before: i64) -> Result<usize, StoreError> {
        let result = sqlx::query("DELETE FROM sync_queue WHERE status = 'sent' AND timestamp < ?")
            .bind(before)
            .execute(&self.pool)
            .await?;
        Ok(usize::try_from(result.rows_affected()).unwrap_or(usize::MAX))
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use rally_proto::{JobAction, Resource};
    use serde_json::json;

    fn event(n: u32) -> NewJob {
        NewJob::new(
            Resource::Event,
            JobAction::Insert,
            json!({"external_id": format!("E{n}"), "match_id": "M1"}),
        )
    }

    async fn exercise(store: &dyn JobStore) {
        let first = store.append(event(1)).await.unwrap();
        let second = store.append(event(2)).await.unwrap();
        let third = store.append(event(3)).await.unwrap();

        let batch = store.queued_batch(2).await.unwrap();
        let ids: Vec<_> = batch.iter().map(|j| j.id.as_str()).collect();
        assert_eq!(ids, [first.id.as_str(), second.id.as_str()]);

        store.mark_sent(&first.id).await.unwrap();
        store
            .mark_error(&first.id, &RemoteError::rejected("23505", "duplicate"))
            .await
            .unwrap();
        store.set_retry_count(&first.id, 4).await.unwrap();
        let sent = store.get(&first.id).await.unwrap().unwrap();
        assert_eq!(sent.status, JobStatus::Sent);
        assert_eq!(sent.retry_count, 0);
        assert!(sent.error_code.is_none());

        store
            .mark_error(&second.id, &RemoteError::rejected("42501", "permission denied"))
            .await
            .unwrap();
        let failed = store.get(&second.id).await.unwrap().unwrap();
        assert_eq!(failed.status, JobStatus::Error);
        assert_eq!(failed.error_code.as_deref(), Some("42501"));
        assert_eq!(failed.error_message.as_deref(), Some("permission denied"));

        assert_eq!(
            store.counts().await.unwrap(),
            JobCounts {
                queued: 1,
                sent: 1,
                error: 1
            }
        );
        assert_eq!(store.queued_batch(10).await.unwrap()[0].id, third.id);

        assert_eq!(store.reset_errors().await.unwrap(), 1);
        let ids: Vec<_> = store
            .queued_batch(10)
            .await
            .unwrap()
            .into_iter()
            .map(|j| j.id)
            .collect();
        assert_eq!(ids, vec![second.id.clone(), third.id.clone()]);
        assert_eq!(store.list(Some(JobStatus::Sent)).await.unwrap().len(), 1);
        assert_eq!(store.list(None).await.unwrap().len(), 3);
    }

    async fn prune_keeps_unsent(store: &dyn JobStore) {
        let sent = store.append(event(1)).await.unwrap();
        let queued = store.append(event(2)).await.unwrap();
        let failed = store.append(event(3)).await.unwrap();
        store.mark_sent(&sent.id).await.unwrap();
        store
            .mark_error(&failed.id, &RemoteError::rejected("23502", "null value"))
            .await
            .unwrap();

        assert_eq!(store.prune_sent(sent.timestamp).await.unwrap(), 0);
        assert_eq!(store.prune_sent(i64::MAX).await.unwrap(), 1);
        assert!(store.get(&sent.id).await.unwrap().is_none());
        assert!(store.get(&queued.id).await.unwrap().is_some());
        assert!(store.get(&failed.id).await.unwrap().is_some());
        assert_eq!(store.counts().await.unwrap().sent, 0);
    }

    #[tokio::test]
    async fn in_memory_store_prunes_only_sent_jobs() {
        let store = InMemoryJobStore::new();
        prune_keeps_unsent(store.as_ref()).await;
    }

    #[tokio::test]
    async fn sqlite_store_prunes_only_sent_jobs() {
        let dir = tempfile::tempdir().unwrap();
        let store = SqliteJobStore::open(&dir.path().join("jobs.sqlite")).await.unwrap();
        prune_keeps_unsent(&store).await;
    }

    #[tokio::test]
    async fn sqlite_store_uses_write_ahead_log() {
        let dir = tempfile::tempdir().unwrap();
        let store = SqliteJobStore::open(&dir.path().join("jobs.sqlite")).await.unwrap();
        let mode: String = sqlx::query_scalar("PRAGMA journal_mode")
            .fetch_one(&store.pool)
            .await
            .unwrap();
        assert_eq!(mode.to_lowercase(), "wal");
    }

    #[tokio::test]
    async fn in_memory_store_keeps_order_and_terminal_sent() {
        let store = InMemoryJobStore::new();
        exercise(store.as_ref()).await;
    }

    #[tokio::test]
    async fn sqlite_store_keeps_order_and_terminal_sent() {
        let dir = tempfile::tempdir().unwrap();
        let store = SqliteJobStore::open(&dir.path().join("nested").join("jobs.sqlite"))
            .await
            .unwrap();
        exercise(&store).await;
    }

    #[tokio::test]
    async fn sqlite_store_survives_reopen() {
        let dir = tempfile::tempdir().unwrap();
        let path = dir.path().join("jobs.sqlite");
        let id = {
            let store = SqliteJobStore::open(&path).await.unwrap();
            store.append(event(1)).await.unwrap().id
        };
        let reopened = SqliteJobStore::open(&path).await.unwrap();
        let job = reopened.get(&id).await.unwrap().unwrap();
        assert_eq!(job.status, JobStatus::Queued);
        assert_eq!(job.payload["external_id"], "E1");
    }
}
