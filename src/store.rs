use std::path::Path;
use std::str::FromStr;
use std::sync::Arc;

use anyhow::{Context, Result};
use chrono::Utc;
use rusqlite::{Connection, OptionalExtension, params};

use crate::models::{Job, JobState};

/// Async-safe handle to the job store.
///
/// Wraps `JobStore` behind `Arc<Mutex>` and runs all access on tokio's
/// blocking thread pool via `spawn_blocking`, preventing synchronous SQLite
/// I/O from tying up async worker threads.
#[derive(Clone)]
pub struct DbHandle {
    inner: Arc<std::sync::Mutex<JobStore>>,
}

impl DbHandle {
    pub fn new(store: JobStore) -> Self {
        Self {
            inner: Arc::new(std::sync::Mutex::new(store)),
        }
    }

    /// Run a closure with access to the store on a blocking thread.
    /// All data passed into `f` must be owned (`'static`).
    pub async fn call<F, R>(&self, f: F) -> Result<R>
    where
        F: FnOnce(&JobStore) -> Result<R> + Send + 'static,
        R: Send + 'static,
    {
        let store = self.inner.clone();
        tokio::task::spawn_blocking(move || {
            let guard = store
                .lock()
                .map_err(|e| anyhow::anyhow!("Store lock poisoned: {}", e))?;
            f(&guard)
        })
        .await
        .context("Store task panicked")?
    }
}

/// Durable persistence for job records; the sole source of truth across
/// restarts. All externally visible side effects happen only after the
/// corresponding state is committed here.
pub struct JobStore {
    conn: Connection,
}

impl JobStore {
    /// Open (or create) a SQLite database at the given path and run migrations.
    pub fn new(path: &Path) -> Result<Self> {
        if let Some(parent) = path.parent() {
            std::fs::create_dir_all(parent).context("Failed to create database directory")?;
        }
        let conn = Connection::open(path).context("Failed to open SQLite database")?;
        let store = Self { conn };
        store.init()?;
        Ok(store)
    }

    /// Create an in-memory SQLite database (for testing).
    pub fn new_in_memory() -> Result<Self> {
        let conn =
            Connection::open_in_memory().context("Failed to open in-memory SQLite database")?;
        let store = Self { conn };
        store.init()?;
        Ok(store)
    }

    fn init(&self) -> Result<()> {
        self.conn
            .execute_batch(
                "
                CREATE TABLE IF NOT EXISTS jobs (
                    id INTEGER PRIMARY KEY AUTOINCREMENT,
                    thread_id TEXT UNIQUE NOT NULL,
                    repo_key TEXT NOT NULL,
                    state TEXT NOT NULL DEFAULT 'pending_approval',
                    instructions TEXT NOT NULL DEFAULT '[]',
                    attempt_count INTEGER NOT NULL DEFAULT 0,
                    workspace_path TEXT,
                    branch_name TEXT,
                    pr_url TEXT,
                    last_error TEXT,
                    created_at TEXT NOT NULL DEFAULT (datetime('now')),
                    updated_at TEXT NOT NULL DEFAULT (datetime('now'))
                );

                CREATE INDEX IF NOT EXISTS idx_jobs_state ON jobs(state);
                ",
            )
            .context("Failed to run migrations")?;
        Ok(())
    }

    /// Create a job for a thread, or return the existing one. Idempotent on
    /// `thread_id`: re-observing the same thread never creates a duplicate.
    pub fn create_job(
        &self,
        thread_id: &str,
        repo_key: &str,
        state: JobState,
        body: Option<&str>,
    ) -> Result<Job> {
        let instructions: Vec<&str> = body.into_iter().collect();
        let instructions_json =
            serde_json::to_string(&instructions).context("Failed to serialize instructions")?;
        let now = now();
        self.conn
            .execute(
                "INSERT INTO jobs (thread_id, repo_key, state, instructions, created_at, updated_at)
                 VALUES (?1, ?2, ?3, ?4, ?5, ?5)
                 ON CONFLICT(thread_id) DO NOTHING",
                params![thread_id, repo_key, state.as_str(), instructions_json, now],
            )
            .context("Failed to insert job")?;
        self.get_by_thread(thread_id)?
            .context("Job not found after insert")
    }

    pub fn get(&self, id: i64) -> Result<Option<Job>> {
        let row = self
            .conn
            .query_row(
                &format!("{} WHERE id = ?1", SELECT_JOB),
                params![id],
                JobRow::from_row,
            )
            .optional()
            .context("Failed to query job")?;
        row.map(JobRow::into_job).transpose()
    }

    pub fn get_by_thread(&self, thread_id: &str) -> Result<Option<Job>> {
        let row = self
            .conn
            .query_row(
                &format!("{} WHERE thread_id = ?1", SELECT_JOB),
                params![thread_id],
                JobRow::from_row,
            )
            .optional()
            .context("Failed to query job by thread")?;
        row.map(JobRow::into_job).transpose()
    }

    /// Atomic check-and-set on the job state. Returns false if the current
    /// state is not `expected` — the caller lost the race (or attempted an
    /// invalid transition) and must re-read.
    pub fn compare_and_set_state(
        &self,
        id: i64,
        expected: JobState,
        new: JobState,
    ) -> Result<bool> {
        let changed = self
            .conn
            .execute(
                "UPDATE jobs SET state = ?1, updated_at = ?4
                 WHERE id = ?2 AND state = ?3",
                params![new.as_str(), id, expected.as_str(), now()],
            )
            .context("Failed to compare-and-set job state")?;
        Ok(changed == 1)
    }

    /// The claim: `Queued -> Running` in one guarded UPDATE, bumping the
    /// attempt counter and clearing the previous error. Exactly one of any
    /// set of concurrent callers wins.
    pub fn claim_for_execution(&self, id: i64) -> Result<bool> {
        let changed = self
            .conn
            .execute(
                "UPDATE jobs SET state = 'running',
                        attempt_count = attempt_count + 1,
                        last_error = NULL,
                        updated_at = ?2
                 WHERE id = ?1 AND state = 'queued'",
                params![id, now()],
            )
            .context("Failed to claim job")?;
        Ok(changed == 1)
    }

    /// Append one instruction, preserving arrival order.
    /// Single-threaded access is guaranteed by DbHandle's mutex, so the
    /// read-modify-write is safe without a transaction.
    pub fn append_instruction(&self, id: i64, text: &str) -> Result<Job> {
        let job = self.get(id)?.context("Job not found for instruction")?;
        let mut instructions = job.instructions;
        instructions.push(text.to_string());
        let json =
            serde_json::to_string(&instructions).context("Failed to serialize instructions")?;
        self.conn
            .execute(
                "UPDATE jobs SET instructions = ?1, updated_at = ?3 WHERE id = ?2",
                params![json, id, now()],
            )
            .context("Failed to append instruction")?;
        self.get(id)?.context("Job not found after instruction")
    }

    /// Record the workspace and branch assigned to the current attempt.
    pub fn update_attempt_isolation(
        &self,
        id: i64,
        workspace_path: Option<&str>,
        branch_name: Option<&str>,
    ) -> Result<()> {
        self.conn
            .execute(
                "UPDATE jobs SET workspace_path = ?1, branch_name = ?2,
                        updated_at = ?4
                 WHERE id = ?3",
                params![workspace_path, branch_name, id, now()],
            )
            .context("Failed to update attempt isolation")?;
        Ok(())
    }

    pub fn update_pr_url(&self, id: i64, pr_url: &str) -> Result<()> {
        self.conn
            .execute(
                "UPDATE jobs SET pr_url = ?1, updated_at = ?3 WHERE id = ?2",
                params![pr_url, id, now()],
            )
            .context("Failed to update PR URL")?;
        Ok(())
    }

    pub fn update_last_error(&self, id: i64, error: Option<&str>) -> Result<()> {
        self.conn
            .execute(
                "UPDATE jobs SET last_error = ?1, updated_at = ?3 WHERE id = ?2",
                params![error, id, now()],
            )
            .context("Failed to update last error")?;
        Ok(())
    }

    /// Rerun in one guarded UPDATE: clear per-attempt outputs and move to
    /// `Queued`, but only while the state is still `expected`. A caller
    /// that lost the race mutates nothing.
    pub fn reset_and_requeue(&self, id: i64, expected: JobState) -> Result<bool> {
        let changed = self
            .conn
            .execute(
                "UPDATE jobs SET state = 'queued', workspace_path = NULL,
                        branch_name = NULL, pr_url = NULL, last_error = NULL,
                        updated_at = ?3
                 WHERE id = ?1 AND state = ?2",
                params![id, expected.as_str(), now()],
            )
            .context("Failed to reset job for rerun")?;
        Ok(changed == 1)
    }

    /// Jobs in `Running` state — used only by startup recovery, where any
    /// such job is known to have been interrupted.
    pub fn list_active(&self) -> Result<Vec<Job>> {
        let mut stmt = self
            .conn
            .prepare(&format!("{} WHERE state = 'running' ORDER BY id", SELECT_JOB))
            .context("Failed to prepare list_active")?;
        let rows = stmt
            .query_map([], JobRow::from_row)
            .context("Failed to query active jobs")?;
        let mut jobs = Vec::new();
        for row in rows {
            jobs.push(row.context("Failed to read job row")?.into_job()?);
        }
        Ok(jobs)
    }

    pub fn list_recent(&self, limit: i64) -> Result<Vec<Job>> {
        let mut stmt = self
            .conn
            .prepare(&format!(
                "{} ORDER BY updated_at DESC, id DESC LIMIT ?1",
                SELECT_JOB
            ))
            .context("Failed to prepare list_recent")?;
        let rows = stmt
            .query_map(params![limit], JobRow::from_row)
            .context("Failed to query recent jobs")?;
        let mut jobs = Vec::new();
        for row in rows {
            jobs.push(row.context("Failed to read job row")?.into_job()?);
        }
        Ok(jobs)
    }
}

/// RFC 3339 UTC timestamps, written by Rust rather than SQLite so every
/// row sorts consistently regardless of which statement touched it.
fn now() -> String {
    Utc::now().to_rfc3339()
}

const SELECT_JOB: &str = "SELECT id, thread_id, repo_key, state, instructions, attempt_count,
        workspace_path, branch_name, pr_url, last_error, created_at, updated_at
 FROM jobs";

/// Intermediate row struct for reading jobs from SQLite before converting
/// the state and instructions columns into typed values.
struct JobRow {
    id: i64,
    thread_id: String,
    repo_key: String,
    state: String,
    instructions: String,
    attempt_count: i64,
    workspace_path: Option<String>,
    branch_name: Option<String>,
    pr_url: Option<String>,
    last_error: Option<String>,
    created_at: String,
    updated_at: String,
}

impl JobRow {
    fn from_row(row: &rusqlite::Row<'_>) -> rusqlite::Result<Self> {
        Ok(Self {
            id: row.get(0)?,
            thread_id: row.get(1)?,
            repo_key: row.get(2)?,
            state: row.get(3)?,
            instructions: row.get(4)?,
            attempt_count: row.get(5)?,
            workspace_path: row.get(6)?,
            branch_name: row.get(7)?,
            pr_url: row.get(8)?,
            last_error: row.get(9)?,
            created_at: row.get(10)?,
            updated_at: row.get(11)?,
        })
    }

    fn into_job(self) -> Result<Job> {
        let state = JobState::from_str(&self.state)
            .map_err(|e| anyhow::anyhow!(e))
            .context("Failed to parse job state")?;
        let instructions: Vec<String> = serde_json::from_str(&self.instructions)
            .with_context(|| format!("corrupt instructions JSON '{}'", self.instructions))?;
        Ok(Job {
            id: self.id,
            thread_id: self.thread_id,
            repo_key: self.repo_key,
            state,
            instructions,
            attempt_count: self.attempt_count,
            workspace_path: self.workspace_path,
            branch_name: self.branch_name,
            pr_url: self.pr_url,
            last_error: self.last_error,
            created_at: self.created_at,
            updated_at: self.updated_at,
        })
    }
}
