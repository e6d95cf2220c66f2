//! Durable job store on SQLite.
//!
//! All access goes through `spawn_blocking`; rusqlite is synchronous and the
//! connection lives behind a mutex. Transitions are a guarded UPDATE keyed
//! on the allowed source statuses, so two concurrent writers racing on the
//! same job cannot both succeed even across processes sharing the file.

use crate::error::{PipelineError, Result};
use crate::job::{Job, JobStatus};
use chrono::{DateTime, Utc};
use rusqlite::{Connection, OptionalExtension, params};
use std::path::Path;
use std::sync::{Arc, Mutex};
use uuid::Uuid;
use warung_channels::ConversationKey;

pub struct SqliteJobStore {
    conn: Arc<Mutex<Connection>>,
}

impl SqliteJobStore {
    pub async fn open(path: impl AsRef<Path>) -> Result<Self> {
        let path = path.as_ref().to_path_buf();
        let conn = tokio::task::spawn_blocking(move || -> Result<Connection> {
            let conn = Connection::open(&path)
                .map_err(|e| PipelineError::Transient(format!("open {}: {e}", path.display())))?;
            ensure_schema(&conn)?;
            Ok(conn)
        })
        .await??;
        Ok(Self {
            conn: Arc::new(Mutex::new(conn)),
        })
    }

    /// Private in-memory database, used by tests and dev mode.
    pub async fn open_in_memory() -> Result<Self> {
        let conn = tokio::task::spawn_blocking(|| -> Result<Connection> {
            let conn = Connection::open_in_memory()
                .map_err(|e| PipelineError::Transient(format!("open :memory:: {e}")))?;
            ensure_schema(&conn)?;
            Ok(conn)
        })
        .await??;
        Ok(Self {
            conn: Arc::new(Mutex::new(conn)),
        })
    }

    async fn with_conn<T, F>(&self, f: F) -> Result<T>
    where
        T: Send + 'static,
        F: FnOnce(&Connection) -> Result<T> + Send + 'static,
    {
        let conn = Arc::clone(&self.conn);
        tokio::task::spawn_blocking(move || {
            let conn = conn
                .lock()
                .map_err(|_| PipelineError::Transient("job store mutex poisoned".to_string()))?;
            f(&conn)
        })
        .await?
    }

    pub async fn insert(&self, job: &Job) -> Result<()> {
        let job = job.clone();
        self.with_conn(move |conn| {
            conn.execute(
                r#"
INSERT INTO jobs (id, tenant_id, chat_id, prompt, status, result, error, created_at, updated_at)
VALUES (?1, ?2, ?3, ?4, ?5, ?6, ?7, ?8, ?9)
"#,
                params![
                    job.id.to_string(),
                    job.conversation.tenant.as_str(),
                    job.conversation.chat.as_str(),
                    job.prompt,
                    job.status.as_str(),
                    job.result,
                    job.error,
                    job.created_at.timestamp_millis(),
                    job.updated_at.timestamp_millis(),
                ],
            )?;
            Ok(())
        })
        .await
    }

    pub async fn get(&self, job_id: Uuid) -> Result<Option<Job>> {
        self.with_conn(move |conn| fetch_job(conn, job_id)).await
    }

    /// Atomically advance a job's status. The UPDATE only matches rows whose
    /// current status is a legal source for `target`; zero affected rows is
    /// either an unknown job or an illegal transition, reported as such.
    pub async fn transition(
        &self,
        job_id: Uuid,
        target: JobStatus,
        result: Option<String>,
        error: Option<String>,
        now: DateTime<Utc>,
    ) -> Result<Job> {
        self.with_conn(move |conn| {
            let sources = allowed_sources(target)?;
            let affected = conn.execute(
                r#"
UPDATE jobs
   SET status = ?1,
       result = COALESCE(?2, result),
       error = COALESCE(?3, error),
       updated_at = ?4
 WHERE id = ?5
   AND status IN (?6, ?7)
"#,
                params![
                    target.as_str(),
                    result,
                    error,
                    now.timestamp_millis(),
                    job_id.to_string(),
                    sources.0,
                    sources.1,
                ],
            )?;

            if affected == 1 {
                return fetch_job(conn, job_id)?.ok_or_else(|| {
                    PipelineError::InvariantViolation(format!(
                        "job {job_id} vanished mid-transition"
                    ))
                });
            }

            match fetch_job(conn, job_id)? {
                None => Err(PipelineError::NotFound(format!("job {job_id}"))),
                Some(current) => Err(PipelineError::InvariantViolation(format!(
                    "job {job_id}: illegal transition {} -> {}",
                    current.status, target
                ))),
            }
        })
        .await
    }

    /// Mark every non-terminal job created at or before `cutoff` as FAILED
    /// with a timeout error. Returns the newly failed jobs so callers can
    /// notify downstream.
    pub async fn sweep_stuck(
        &self,
        cutoff: DateTime<Utc>,
        now: DateTime<Utc>,
    ) -> Result<Vec<Job>> {
        self.with_conn(move |conn| {
            let mut stmt = conn.prepare_cached(
                r#"
SELECT id FROM jobs
 WHERE status IN ('QUEUED', 'PROCESSING')
   AND created_at <= ?1
"#,
            )?;
            let ids = stmt
                .query_map(params![cutoff.timestamp_millis()], |row| {
                    row.get::<_, String>(0)
                })?
                .collect::<std::result::Result<Vec<_>, _>>()?;
            drop(stmt);

            let mut swept = Vec::with_capacity(ids.len());
            for id in ids {
                let affected = conn.execute(
                    r#"
UPDATE jobs
   SET status = 'FAILED',
       error = ?1,
       updated_at = ?2
 WHERE id = ?3
   AND status IN ('QUEUED', 'PROCESSING')
"#,
                    params!["job timed out", now.timestamp_millis(), id],
                )?;
                if affected == 1 {
                    if let Ok(uuid) = Uuid::parse_str(&id) {
                        if let Some(job) = fetch_job(conn, uuid)? {
                            swept.push(job);
                        }
                    }
                }
            }
            Ok(swept)
        })
        .await
    }
}

fn ensure_schema(conn: &Connection) -> Result<()> {
    conn.execute(
        r#"
CREATE TABLE IF NOT EXISTS jobs (
    id TEXT PRIMARY KEY,
    tenant_id TEXT NOT NULL,
    chat_id TEXT NOT NULL,
    prompt TEXT NOT NULL,
    status TEXT NOT NULL,
    result TEXT,
    error TEXT,
    created_at INTEGER NOT NULL,
    updated_at INTEGER NOT NULL
)
"#,
        [],
    )?;
    conn.execute(
        "CREATE INDEX IF NOT EXISTS idx_jobs_status_created ON jobs (status, created_at)",
        [],
    )?;
    Ok(())
}

/// Legal source statuses for a guarded UPDATE toward `target`. Returned as a
/// pair because the IN clause has two slots; a single-source target repeats
/// itself.
fn allowed_sources(target: JobStatus) -> Result<(&'static str, &'static str)> {
    match target {
        JobStatus::Processing => Ok(("QUEUED", "QUEUED")),
        JobStatus::Completed => Ok(("PROCESSING", "PROCESSING")),
        JobStatus::Failed => Ok(("QUEUED", "PROCESSING")),
        JobStatus::Queued => Err(PipelineError::InvariantViolation(
            "no transition re-enters QUEUED".to_string(),
        )),
    }
}

fn fetch_job(conn: &Connection, job_id: Uuid) -> Result<Option<Job>> {
    let row = conn
        .query_row(
            r#"
SELECT id, tenant_id, chat_id, prompt, status, result, error, created_at, updated_at
  FROM jobs
 WHERE id = ?1
"#,
            params![job_id.to_string()],
            |row| {
                Ok((
                    row.get::<_, String>(0)?,
                    row.get::<_, String>(1)?,
                    row.get::<_, String>(2)?,
                    row.get::<_, String>(3)?,
                    row.get::<_, String>(4)?,
                    row.get::<_, Option<String>>(5)?,
                    row.get::<_, Option<String>>(6)?,
                    row.get::<_, i64>(7)?,
                    row.get::<_, i64>(8)?,
                ))
            },
        )
        .optional()?;

    let Some((id, tenant, chat, prompt, status, result, error, created_at, updated_at)) = row
    else {
        return Ok(None);
    };

    let id = Uuid::parse_str(&id)
        .map_err(|e| PipelineError::InvariantViolation(format!("bad job id in store: {e}")))?;
    let conversation = ConversationKey::parse(&tenant, &chat).ok_or_else(|| {
        PipelineError::InvariantViolation(format!("bad conversation key in store for job {id}"))
    })?;
    Ok(Some(Job {
        id,
        conversation,
        prompt,
        status: JobStatus::parse(&status)?,
        result,
        error,
        created_at: millis_to_utc(created_at)?,
        updated_at: millis_to_utc(updated_at)?,
    }))
}

fn millis_to_utc(millis: i64) -> Result<DateTime<Utc>> {
    DateTime::from_timestamp_millis(millis).ok_or_else(|| {
        PipelineError::InvariantViolation(format!("bad timestamp in store: {millis}"))
    })
}
