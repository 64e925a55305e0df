//! Job tracking for asynchronous work.
//!
//! Every async operation (indexing, project creation, answer generation,
//! evaluation) is recorded as a [`Job`] row the instant it is accepted, so a
//! client polling right after the HTTP response already sees a PENDING job.
//! Workers own all subsequent mutation; readers only ever see committed rows.
//!
//! Progress is clamped monotone non-decreasing. Terminal jobs are retained
//! for late polls and removed by [`JobTracker::gc`] after the retention
//! window.

use sqlx::Row;
use uuid::Uuid;

use crate::db::Store;
use crate::error::{PipelineError, Result};
use crate::models::{Job, JobStatus, JobType};

#[derive(Clone)]
pub struct JobTracker {
    store: Store,
}

impl JobTracker {
    pub fn new(store: Store) -> Self {
        Self { store }
    }

    /// Register a new PENDING job and return it.
    pub async fn create(&self, job_type: JobType, target_id: &str, message: &str) -> Result<Job> {
        let now = chrono::Utc::now().timestamp();
        let job = Job {
            id: format!("job_{}", Uuid::new_v4()),
            job_type,
            status: JobStatus::Pending,
            progress: 0.0,
            message: message.to_string(),
            error: None,
            error_kind: None,
            target_id: target_id.to_string(),
            cancel_requested: false,
            created_at: now,
            updated_at: now,
        };

        sqlx::query(
            r#"
            INSERT INTO jobs (id, job_type, status, progress, message, error, error_kind,
                              target_id, cancel_requested, created_at, updated_at)
            VALUES (?, ?, ?, ?, ?, NULL, NULL, ?, 0, ?, ?)
            "#,
        )
        .bind(&job.id)
        .bind(job.job_type.as_str())
        .bind(job.status.as_str())
        .bind(job.progress)
        .bind(&job.message)
        .bind(&job.target_id)
        .bind(job.created_at)
        .bind(job.updated_at)
        .execute(self.store.pool())
        .await?;

        Ok(job)
    }

    /// Flip a PENDING job to RUNNING when its worker picks it up.
    pub async fn start(&self, job_id: &str, message: &str) -> Result<()> {
        let now = chrono::Utc::now().timestamp();
        sqlx::query(
            "UPDATE jobs SET status = ?, message = ?, updated_at = ? WHERE id = ?",
        )
        .bind(JobStatus::Running.as_str())
        .bind(message)
        .bind(now)
        .bind(job_id)
        .execute(self.store.pool())
        .await?;
        Ok(())
    }

    /// Record progress. The stored value never decreases within a job.
    pub async fn update(&self, job_id: &str, progress: f64, message: &str) -> Result<()> {
        let now = chrono::Utc::now().timestamp();
        sqlx::query(
            "UPDATE jobs SET progress = MAX(progress, ?), message = ?, updated_at = ? WHERE id = ?",
        )
        .bind(progress.clamp(0.0, 1.0))
        .bind(message)
        .bind(now)
        .bind(job_id)
        .execute(self.store.pool())
        .await?;
        Ok(())
    }

    pub async fn complete(&self, job_id: &str, message: &str) -> Result<()> {
        let now = chrono::Utc::now().timestamp();
        sqlx::query(
            "UPDATE jobs SET status = ?, progress = 1.0, message = ?, updated_at = ? WHERE id = ?",
        )
        .bind(JobStatus::Completed.as_str())
        .bind(message)
        .bind(now)
        .bind(job_id)
        .execute(self.store.pool())
        .await?;
        Ok(())
    }

    pub async fn fail(&self, job_id: &str, error: &PipelineError) -> Result<()> {
        let now = chrono::Utc::now().timestamp();
        sqlx::query(
            "UPDATE jobs SET status = ?, error = ?, error_kind = ?, updated_at = ? WHERE id = ?",
        )
        .bind(JobStatus::Failed.as_str())
        .bind(error.to_string())
        .bind(error.kind())
        .bind(now)
        .bind(job_id)
        .execute(self.store.pool())
        .await?;
        Ok(())
    }

    /// Terminal state for a cooperatively cancelled job. The worker calls
    /// this after rolling the target entity back to its last committed state.
    pub async fn fail_cancelled(&self, job_id: &str) -> Result<()> {
        let now = chrono::Utc::now().timestamp();
        sqlx::query(
            "UPDATE jobs SET status = ?, error = 'cancelled by request', error_kind = 'cancelled', updated_at = ? WHERE id = ?",
        )
        .bind(JobStatus::Failed.as_str())
        .bind(now)
        .bind(job_id)
        .execute(self.store.pool())
        .await?;
        Ok(())
    }

    pub async fn get(&self, job_id: &str) -> Result<Job> {
        let row = sqlx::query("SELECT * FROM jobs WHERE id = ?")
            .bind(job_id)
            .fetch_optional(self.store.pool())
            .await?
            .ok_or_else(|| PipelineError::not_found("job", job_id))?;
        Ok(row_to_job(&row))
    }

    /// Jobs with status PENDING or RUNNING, newest first.
    pub async fn list_active(&self) -> Result<Vec<Job>> {
        let rows = sqlx::query(
            "SELECT * FROM jobs WHERE status IN ('PENDING', 'RUNNING') ORDER BY created_at DESC",
        )
        .fetch_all(self.store.pool())
        .await?;
        Ok(rows.iter().map(row_to_job).collect())
    }

    /// Mark an in-flight job for cooperative cancellation. Terminal jobs are
    /// left untouched.
    pub async fn request_cancel(&self, job_id: &str) -> Result<Job> {
        let job = self.get(job_id).await?;
        if job.status.is_terminal() {
            return Ok(job);
        }
        let now = chrono::Utc::now().timestamp();
        sqlx::query("UPDATE jobs SET cancel_requested = 1, updated_at = ? WHERE id = ?")
            .bind(now)
            .bind(job_id)
            .execute(self.store.pool())
            .await?;
        self.get(job_id).await
    }

    /// Workers poll this between work units.
    pub async fn cancel_requested(&self, job_id: &str) -> Result<bool> {
        let flag: Option<i64> =
            sqlx::query_scalar("SELECT cancel_requested FROM jobs WHERE id = ?")
                .bind(job_id)
                .fetch_optional(self.store.pool())
                .await?;
        Ok(flag.unwrap_or(0) != 0)
    }

    /// Delete terminal jobs older than `retention_secs`. Returns the number
    /// of rows removed.
    pub async fn gc(&self, retention_secs: i64) -> Result<u64> {
        let cutoff = chrono::Utc::now().timestamp() - retention_secs;
        let result = sqlx::query(
            "DELETE FROM jobs WHERE status IN ('COMPLETED', 'FAILED') AND updated_at < ?",
        )
        .bind(cutoff)
        .execute(self.store.pool())
        .await?;
        Ok(result.rows_affected())
    }
}

fn row_to_job(row: &sqlx::sqlite::SqliteRow) -> Job {
    let job_type: String = row.get("job_type");
    let status: String = row.get("status");
    let cancel_requested: i64 = row.get("cancel_requested");
    Job {
        id: row.get("id"),
        job_type: JobType::parse(&job_type).unwrap_or(JobType::Indexing),
        status: JobStatus::parse(&status).unwrap_or(JobStatus::Failed),
        progress: row.get("progress"),
        message: row.get("message"),
        error: row.get("error"),
        error_kind: row.get("error_kind"),
        target_id: row.get("target_id"),
        cancel_requested: cancel_requested != 0,
        created_at: row.get("created_at"),
        updated_at: row.get("updated_at"),
    }
}
