use std::path::Path;
use std::sync::Arc;

use anyhow::{Context, Result};
use rusqlite::{Connection, OptionalExtension, Row, params};

use super::models::*;
use crate::errors::StoreError;

/// Async-safe handle to the job database.
///
/// Wraps `JobDb` behind `Arc<Mutex>` and runs all access on tokio's blocking
/// thread pool via `spawn_blocking`, so synchronous SQLite I/O never ties up
/// async worker threads.
#[derive(Clone)]
pub struct DbHandle {
    inner: Arc<std::sync::Mutex<JobDb>>,
}

impl DbHandle {
    pub fn new(db: JobDb) -> Self {
        Self {
            inner: Arc::new(std::sync::Mutex::new(db)),
        }
    }

    /// Open the database at `path`, creating parent directories as needed.
    pub fn open(path: &Path) -> Result<Self> {
        if let Some(parent) = path.parent()
            && !parent.as_os_str().is_empty()
        {
            std::fs::create_dir_all(parent)
                .with_context(|| format!("Failed to create {}", parent.display()))?;
        }
        Ok(Self::new(JobDb::new(path)?))
    }

    /// Run a closure with access to the database on a blocking thread.
    /// All data passed into `f` must be owned (`'static`).
    pub async fn call<F, R>(&self, f: F) -> Result<R>
    where
        F: FnOnce(&JobDb) -> Result<R> + Send + 'static,
        R: Send + 'static,
    {
        let db = self.inner.clone();
        tokio::task::spawn_blocking(move || {
            let guard = db
                .lock()
                .map_err(|e| anyhow::anyhow!("DB lock poisoned: {}", e))?;
            f(&guard)
        })
        .await
        .context("DB task panicked")?
    }

    /// Acquire the database mutex synchronously. Only for CLI commands and
    /// tests; never from an async request path.
    pub fn lock_sync(&self) -> Result<std::sync::MutexGuard<'_, JobDb>> {
        self.inner
            .lock()
            .map_err(|e| anyhow::anyhow!("DB lock poisoned: {}", e))
    }
}

pub struct JobDb {
    conn: Connection,
}

const JOB_COLUMNS: &str = "id, owner_id, instruction, status, error, output_location, deployment_url, last_session_id, current_iteration, created_at, updated_at, completed_at";

const SNAPSHOT_COLUMNS: &str =
    "id, job_id, iteration, kind, file_state, instruction, metadata, created_at";

fn now() -> String {
    chrono::Utc::now().to_rfc3339()
}

fn row_to_job(row: &Row<'_>) -> rusqlite::Result<Job> {
    let status: String = row.get(3)?;
    let status = status.parse::<JobStatus>().map_err(|e| {
        rusqlite::Error::FromSqlConversionFailure(3, rusqlite::types::Type::Text, e.into())
    })?;
    Ok(Job {
        id: row.get(0)?,
        owner_id: row.get(1)?,
        instruction: row.get(2)?,
        status,
        error: row.get(4)?,
        output_location: row.get(5)?,
        deployment_url: row.get(6)?,
        last_session_id: row.get(7)?,
        current_iteration: row.get(8)?,
        created_at: row.get(9)?,
        updated_at: row.get(10)?,
        completed_at: row.get(11)?,
    })
}

fn row_to_snapshot(row: &Row<'_>) -> rusqlite::Result<IterationSnapshot> {
    let kind: String = row.get(3)?;
    let kind = kind.parse::<SnapshotKind>().map_err(|e| {
        rusqlite::Error::FromSqlConversionFailure(3, rusqlite::types::Type::Text, e.into())
    })?;
    let file_state: String = row.get(4)?;
    let metadata: String = row.get(6)?;
    Ok(IterationSnapshot {
        id: row.get(0)?,
        job_id: row.get(1)?,
        iteration: row.get(2)?,
        kind,
        file_state: serde_json::from_str(&file_state).unwrap_or(serde_json::Value::Null),
        instruction: row.get(5)?,
        metadata: serde_json::from_str(&metadata).unwrap_or(serde_json::Value::Null),
        created_at: row.get(7)?,
    })
}

impl JobDb {
    /// Open (or create) a SQLite database at the given path and run migrations.
    pub fn new(path: &Path) -> Result<Self> {
        let conn = Connection::open(path).context("Failed to open SQLite database")?;
        let db = Self { conn };
        db.init()?;
        Ok(db)
    }

    /// Create an in-memory SQLite database (for testing).
    pub fn new_in_memory() -> Result<Self> {
        let conn =
            Connection::open_in_memory().context("Failed to open in-memory SQLite database")?;
        let db = Self { conn };
        db.init()?;
        Ok(db)
    }

    fn init(&self) -> Result<()> {
        self.conn
            .execute_batch("PRAGMA foreign_keys = ON;")
            .context("Failed to enable foreign keys")?;
        self.run_migrations().context("Failed to run migrations")?;
        Ok(())
    }

    fn run_migrations(&self) -> Result<()> {
        self.conn
            .execute_batch(
                "
                CREATE TABLE IF NOT EXISTS jobs (
                    id INTEGER PRIMARY KEY AUTOINCREMENT,
                    owner_id TEXT NOT NULL,
                    instruction TEXT NOT NULL,
                    status TEXT NOT NULL DEFAULT 'pending',
                    error TEXT,
                    output_location TEXT,
                    deployment_url TEXT,
                    last_session_id TEXT,
                    current_iteration INTEGER NOT NULL DEFAULT 0,
                    created_at TEXT NOT NULL,
                    updated_at TEXT NOT NULL,
                    completed_at TEXT
                );

                CREATE TABLE IF NOT EXISTS iteration_snapshots (
                    id INTEGER PRIMARY KEY AUTOINCREMENT,
                    job_id INTEGER NOT NULL REFERENCES jobs(id),
                    iteration INTEGER NOT NULL,
                    kind TEXT NOT NULL DEFAULT 'automatic',
                    file_state TEXT NOT NULL DEFAULT 'null',
                    instruction TEXT,
                    metadata TEXT NOT NULL DEFAULT '{}',
                    created_at TEXT NOT NULL,
                    UNIQUE(job_id, iteration)
                );

                CREATE INDEX IF NOT EXISTS idx_jobs_owner ON jobs(owner_id, created_at);
                CREATE INDEX IF NOT EXISTS idx_jobs_session ON jobs(last_session_id);
                CREATE INDEX IF NOT EXISTS idx_snapshots_job ON iteration_snapshots(job_id, iteration);
                ",
            )
            .context("Failed to create tables")?;
        Ok(())
    }

    // ── Jobs ────────────────────────────────────────────────────────────

    pub fn create_job(&self, new: &NewJob) -> Result<Job> {
        let ts = now();
        self.conn
            .execute(
                "INSERT INTO jobs (owner_id, instruction, status, last_session_id, created_at, updated_at)
                 VALUES (?1, ?2, 'pending', ?3, ?4, ?4)",
                params![new.owner_id, new.instruction, new.session_id, ts],
            )
            .context("Failed to insert job")?;
        let id = self.conn.last_insert_rowid();
        self.get_job(id)?.context("Job not found after insert")
    }

    pub fn get_job(&self, id: i64) -> Result<Option<Job>> {
        let sql = format!("SELECT {JOB_COLUMNS} FROM jobs WHERE id = ?1");
        self.conn
            .query_row(&sql, params![id], row_to_job)
            .optional()
            .context("Failed to query job")
    }

    /// Apply a partial update. Status changes are checked against the job
    /// state machine; `completed_at` is stamped only on the first terminal
    /// transition.
    pub fn update_job(&self, id: i64, update: &JobUpdate) -> Result<Job> {
        // DbHandle's Mutex already guarantees single-threaded access.
        let tx = self
            .conn
            .unchecked_transaction()
            .context("Failed to begin transaction")?;

        let current: Option<String> = tx
            .query_row("SELECT status FROM jobs WHERE id = ?1", params![id], |row| {
                row.get(0)
            })
            .optional()
            .context("Failed to read job status")?;
        let current = match current {
            Some(s) => s.parse::<JobStatus>().map_err(|e| anyhow::anyhow!(e))?,
            None => return Err(StoreError::JobNotFound { id }.into()),
        };

        let ts = now();
        if let Some(next) = update.status {
            if !current.can_transition_to(next) {
                return Err(StoreError::InvalidTransition {
                    id,
                    from: current,
                    to: next,
                }
                .into());
            }
            if next.is_terminal() {
                tx.execute(
                    "UPDATE jobs SET status = ?1, completed_at = COALESCE(completed_at, ?2) WHERE id = ?3",
                    params![next.as_str(), ts, id],
                )
                .context("Failed to update job status")?;
            } else {
                tx.execute(
                    "UPDATE jobs SET status = ?1 WHERE id = ?2",
                    params![next.as_str(), id],
                )
                .context("Failed to update job status")?;
            }
        }
        if let Some(error) = &update.error {
            tx.execute("UPDATE jobs SET error = ?1 WHERE id = ?2", params![error, id])
                .context("Failed to update job error")?;
        }
        if let Some(location) = &update.output_location {
            tx.execute(
                "UPDATE jobs SET output_location = ?1 WHERE id = ?2",
                params![location, id],
            )
            .context("Failed to update job output location")?;
        }
        if let Some(url) = &update.deployment_url {
            tx.execute(
                "UPDATE jobs SET deployment_url = ?1 WHERE id = ?2",
                params![url, id],
            )
            .context("Failed to update job deployment url")?;
        }
        if let Some(session_id) = &update.last_session_id {
            tx.execute(
                "UPDATE jobs SET last_session_id = ?1 WHERE id = ?2",
                params![session_id, id],
            )
            .context("Failed to update job session id")?;
        }
        if let Some(iteration) = update.current_iteration {
            tx.execute(
                "UPDATE jobs SET current_iteration = ?1 WHERE id = ?2",
                params![iteration, id],
            )
            .context("Failed to update job iteration")?;
        }
        tx.execute(
            "UPDATE jobs SET updated_at = ?1 WHERE id = ?2",
            params![ts, id],
        )
        .context("Failed to stamp updated_at")?;

        tx.commit().context("Failed to commit job update")?;
        self.get_job(id)?.context("Job not found after update")
    }

    /// Most recent `limit` jobs for an owner, newest first.
    pub fn list_jobs_for_owner(&self, owner_id: &str, limit: usize) -> Result<Vec<Job>> {
        let sql = format!(
            "SELECT {JOB_COLUMNS} FROM jobs WHERE owner_id = ?1 ORDER BY created_at DESC, id DESC LIMIT ?2"
        );
        let mut stmt = self
            .conn
            .prepare(&sql)
            .context("Failed to prepare list_jobs_for_owner")?;
        let jobs = stmt
            .query_map(params![owner_id, limit as i64], row_to_job)
            .context("Failed to query jobs")?
            .collect::<rusqlite::Result<Vec<_>>>()
            .context("Failed to read job rows")?;
        Ok(jobs)
    }

    /// Every job not yet in a terminal status, oldest first.
    pub fn list_unfinished_jobs(&self) -> Result<Vec<Job>> {
        let sql = format!(
            "SELECT {JOB_COLUMNS} FROM jobs WHERE status NOT IN ('completed', 'failed') ORDER BY id ASC"
        );
        let mut stmt = self
            .conn
            .prepare(&sql)
            .context("Failed to prepare list_unfinished_jobs")?;
        let jobs = stmt
            .query_map([], row_to_job)
            .context("Failed to query unfinished jobs")?
            .collect::<rusqlite::Result<Vec<_>>>()
            .context("Failed to read job rows")?;
        Ok(jobs)
    }

    /// Latest job whose `last_session_id` matches.
    pub fn find_job_by_session(&self, session_id: &str) -> Result<Option<Job>> {
        let sql = format!(
            "SELECT {JOB_COLUMNS} FROM jobs WHERE last_session_id = ?1 ORDER BY id DESC LIMIT 1"
        );
        self.conn
            .query_row(&sql, params![session_id], row_to_job)
            .optional()
            .context("Failed to query job by session")
    }

    // ── Snapshots ───────────────────────────────────────────────────────

    pub fn create_snapshot(&self, new: &NewSnapshot) -> Result<IterationSnapshot> {
        let latest: Option<i64> = self
            .conn
            .query_row(
                "SELECT MAX(iteration) FROM iteration_snapshots WHERE job_id = ?1",
                params![new.job_id],
                |row| row.get(0),
            )
            .context("Failed to read latest snapshot iteration")?;
        if let Some(latest) = latest
            && new.iteration <= latest
        {
            return Err(StoreError::SnapshotOutOfOrder {
                job_id: new.job_id,
                iteration: new.iteration,
                latest,
            }
            .into());
        }

        let file_state =
            serde_json::to_string(&new.file_state).context("Failed to encode file state")?;
        let metadata =
            serde_json::to_string(&new.metadata).context("Failed to encode snapshot metadata")?;
        self.conn
            .execute(
                "INSERT INTO iteration_snapshots (job_id, iteration, kind, file_state, instruction, metadata, created_at)
                 VALUES (?1, ?2, ?3, ?4, ?5, ?6, ?7)",
                params![
                    new.job_id,
                    new.iteration,
                    new.kind.as_str(),
                    file_state,
                    new.instruction,
                    metadata,
                    now()
                ],
            )
            .context("Failed to insert snapshot")?;
        let id = self.conn.last_insert_rowid();
        let sql = format!("SELECT {SNAPSHOT_COLUMNS} FROM iteration_snapshots WHERE id = ?1");
        self.conn
            .query_row(&sql, params![id], row_to_snapshot)
            .context("Snapshot not found after insert")
    }

    pub fn get_snapshot(&self, job_id: i64, iteration: i64) -> Result<Option<IterationSnapshot>> {
        let sql = format!(
            "SELECT {SNAPSHOT_COLUMNS} FROM iteration_snapshots WHERE job_id = ?1 AND iteration = ?2"
        );
        self.conn
            .query_row(&sql, params![job_id, iteration], row_to_snapshot)
            .optional()
            .context("Failed to query snapshot")
    }

    /// All snapshots for a job in ascending iteration order.
    pub fn list_snapshots_for_job(&self, job_id: i64) -> Result<Vec<IterationSnapshot>> {
        let sql = format!(
            "SELECT {SNAPSHOT_COLUMNS} FROM iteration_snapshots WHERE job_id = ?1 ORDER BY iteration ASC"
        );
        let mut stmt = self
            .conn
            .prepare(&sql)
            .context("Failed to prepare list_snapshots_for_job")?;
        let snapshots = stmt
            .query_map(params![job_id], row_to_snapshot)
            .context("Failed to query snapshots")?
            .collect::<rusqlite::Result<Vec<_>>>()
            .context("Failed to read snapshot rows")?;
        Ok(snapshots)
    }

    pub fn delete_snapshot(&self, id: i64) -> Result<bool> {
        let affected = self
            .conn
            .execute(
                "DELETE FROM iteration_snapshots WHERE id = ?1",
                params![id],
            )
            .context("Failed to delete snapshot")?;
        Ok(affected > 0)
    }
}
