//! Durable background job queue stored in SQLite.
//!
//! Requests enqueue work (document ingestion, crawls) and return
//! immediately; any number of worker processes poll the same table.
//!
//! # Lifecycle
//!
//! ```text
//!             claim              complete
//!  queued ────────────▶ running ──────────▶ succeeded
//!    ▲  │                  │
//!    │  │ cancel           │ fail (attempts < max)
//!    │  ▼                  ▼
//!    │ cancelled        queued (run_at = now + backoff)
//!    │                     │
//!    │ retry               │ fail (attempts == max)
//!    └──────────────── failed
//! ```
//!
//! A claim is a single `UPDATE … RETURNING` statement, so two workers can
//! never receive the same job. A worker that dies mid-job leaves its row
//! `running`; [`reap_stale`] returns such rows to the queue once their lock
//! is older than `worker.stale_after_secs`.
//!
//! # Backoff
//!
//! After the n-th failed attempt the job waits `base × 2^(n-1)` seconds,
//! with the exponent capped at 5 (so at most `32 × base`).

use anyhow::Result;
use serde_json::Value;
use sqlx::sqlite::SqliteRow;
use sqlx::{Row, Sqlite, SqlitePool};
use uuid::Uuid;

use crate::config::WorkerConfig;
use crate::error::{KbError, KbResult};
use crate::models::{now_ts, ts, Job, JobStatus};

/// Job kind: (re)ingest one knowledge source. Payload: `{"source_id": "..."}`.
pub const INGEST_SOURCE: &str = "ingest_source";

/// Longest error message kept on a job row.
const MAX_ERROR_LEN: usize = 2000;

fn job_from_row(row: &SqliteRow) -> Result<Job> {
    let status: String = row.get("status");
    let payload_json: String = row.get("payload_json");
    Ok(Job {
        id: row.get("id"),
        kind: row.get("kind"),
        payload: serde_json::from_str(&payload_json).unwrap_or(Value::Null),
        space_id: row.get("space_id"),
        status: status.parse().map_err(anyhow::Error::msg)?,
        attempts: row.get("attempts"),
        max_attempts: row.get("max_attempts"),
        run_at: ts(row.get("run_at")),
        locked_by: row.get("locked_by"),
        last_error: row.get("last_error"),
        created_at: ts(row.get("created_at")),
        updated_at: ts(row.get("updated_at")),
    })
}

/// Seconds to wait before the next attempt after `attempts` failures.
pub fn backoff_secs(attempts: i64, base_secs: i64) -> i64 {
    let exp = (attempts - 1).clamp(0, 5) as u32;
    base_secs * (1i64 << exp)
}

fn truncate_error(err: &str) -> String {
    if err.len() <= MAX_ERROR_LEN {
        return err.to_string();
    }
    let mut end = MAX_ERROR_LEN;
    while !err.is_char_boundary(end) {
        end -= 1;
    }
    format!("{}…", &err[..end])
}

/// Add a job to the queue. Accepts a pool or an open transaction so the job
/// can be committed together with the row it refers to.
pub async fn enqueue<'e, E>(
    executor: E,
    kind: &str,
    payload: &Value,
    space_id: Option<&str>,
    max_attempts: i64,
) -> Result<String>
where
    E: sqlx::Executor<'e, Database = Sqlite>,
{
    let id = Uuid::new_v4().to_string();
    let now = now_ts();
    sqlx::query(
        r#"
        INSERT INTO jobs (id, kind, payload_json, space_id, status, attempts, max_attempts,
                          run_at, created_at, updated_at)
        VALUES (?, ?, ?, ?, 'queued', 0, ?, ?, ?, ?)
        "#,
    )
    .bind(&id)
    .bind(kind)
    .bind(payload.to_string())
    .bind(space_id)
    .bind(max_attempts.max(1))
    .bind(now)
    .bind(now)
    .bind(now)
    .execute(executor)
    .await?;
    tracing::debug!(job_id = %id, kind = %kind, "enqueued job");
    Ok(id)
}

/// Atomically take the oldest due job, marking it running for `worker_id`.
pub async fn claim(pool: &SqlitePool, worker_id: &str) -> Result<Option<Job>> {
    let now = now_ts();
    let row = sqlx::query(
        r#"
        UPDATE jobs
        SET status = 'running', attempts = attempts + 1, locked_by = ?, locked_at = ?, updated_at = ?
        WHERE status = 'queued' AND id = (
            SELECT id FROM jobs
            WHERE status = 'queued' AND run_at <= ?
            ORDER BY run_at ASC, created_at ASC, id ASC
            LIMIT 1
        )
        RETURNING *
        "#,
    )
    .bind(worker_id)
    .bind(now)
    .bind(now)
    .bind(now)
    .fetch_optional(pool)
    .await?;

    row.map(|r| job_from_row(&r)).transpose()
}

/// Mark a running job as done. Returns false if the job was no longer held
/// by this worker (reaped or cancelled meanwhile).
pub async fn complete(pool: &SqlitePool, job_id: &str, worker_id: &str) -> Result<bool> {
    let result = sqlx::query(
        r#"
        UPDATE jobs SET status = 'succeeded', locked_by = NULL, locked_at = NULL,
                        last_error = NULL, updated_at = ?
        WHERE id = ? AND status = 'running' AND locked_by = ?
        "#,
    )
    .bind(now_ts())
    .bind(job_id)
    .bind(worker_id)
    .execute(pool)
    .await?;
    Ok(result.rows_affected() == 1)
}

/// Record a failed attempt: requeue with backoff, or give up once
/// `max_attempts` is reached. Returns the resulting status.
pub async fn fail(
    pool: &SqlitePool,
    job: &Job,
    worker_id: &str,
    error: &str,
    cfg: &WorkerConfig,
) -> Result<JobStatus> {
    let now = now_ts();
    let error = truncate_error(error);

    let (status, run_at) = if job.attempts < job.max_attempts {
        (
            JobStatus::Queued,
            now + backoff_secs(job.attempts, cfg.backoff_base_secs),
        )
    } else {
        (JobStatus::Failed, now)
    };

    sqlx::query(
        r#"
        UPDATE jobs SET status = ?, run_at = ?, last_error = ?, locked_by = NULL,
                        locked_at = NULL, updated_at = ?
        WHERE id = ? AND status = 'running' AND locked_by = ?
        "#,
    )
    .bind(status.as_str())
    .bind(run_at)
    .bind(&error)
    .bind(now)
    .bind(&job.id)
    .bind(worker_id)
    .execute(pool)
    .await?;

    Ok(status)
}

/// Return abandoned running jobs to the queue (or fail them if out of attempts).
pub async fn reap_stale(pool: &SqlitePool, stale_after_secs: i64) -> Result<u64> {
    let now = now_ts();
    let cutoff = now - stale_after_secs;
    let mut tx = pool.begin().await?;

    let failed = sqlx::query(
        r#"
        UPDATE jobs SET status = 'failed', locked_by = NULL, locked_at = NULL,
                        last_error = COALESCE(last_error, 'worker lock expired'), updated_at = ?
        WHERE status = 'running' AND locked_at < ? AND attempts >= max_attempts
        "#,
    )
    .bind(now)
    .bind(cutoff)
    .execute(&mut *tx)
    .await?
    .rows_affected();

    let requeued = sqlx::query(
        r#"
        UPDATE jobs SET status = 'queued', locked_by = NULL, locked_at = NULL,
                        run_at = ?, updated_at = ?
        WHERE status = 'running' AND locked_at < ?
        "#,
    )
    .bind(now)
    .bind(now)
    .bind(cutoff)
    .execute(&mut *tx)
    .await?
    .rows_affected();

    tx.commit().await?;

    if failed + requeued > 0 {
        tracing::warn!(requeued, failed, "reaped stale jobs");
    }
    Ok(failed + requeued)
}

pub async fn get_job(pool: &SqlitePool, job_id: &str) -> KbResult<Job> {
    let row = sqlx::query("SELECT * FROM jobs WHERE id = ?")
        .bind(job_id)
        .fetch_optional(pool)
        .await?
        .ok_or_else(|| KbError::not_found(format!("job {}", job_id)))?;
    Ok(job_from_row(&row)?)
}

/// Cancel a job that has not started yet.
pub async fn cancel(pool: &SqlitePool, job_id: &str) -> KbResult<Job> {
    let result = sqlx::query(
        "UPDATE jobs SET status = 'cancelled', updated_at = ? WHERE id = ? AND status = 'queued'",
    )
    .bind(now_ts())
    .bind(job_id)
    .execute(pool)
    .await?;

    let job = get_job(pool, job_id).await?;
    if result.rows_affected() == 0 {
        return Err(KbError::conflict(format!(
            "job {} is {} and cannot be cancelled",
            job_id, job.status
        )));
    }
    Ok(job)
}

/// Put a failed or cancelled job back in the queue with a fresh attempt budget.
///
/// Refused while another job of the same kind for the same source is queued
/// or running, so one source is never ingested twice at once.
pub async fn retry(pool: &SqlitePool, job_id: &str) -> KbResult<Job> {
    let now = now_ts();
    let result = sqlx::query(
        r#"
        UPDATE jobs SET status = 'queued', attempts = 0, run_at = ?1, updated_at = ?1
        WHERE id = ?2 AND status IN ('failed', 'cancelled')
          AND NOT EXISTS (
              SELECT 1 FROM jobs other
              WHERE other.id != jobs.id
                AND other.kind = jobs.kind
                AND other.status IN ('queued', 'running')
                AND json_extract(other.payload_json, '$.source_id')
                    = json_extract(jobs.payload_json, '$.source_id')
          )
        "#,
    )
    .bind(now)
    .bind(job_id)
    .execute(pool)
    .await?;

    let job = get_job(pool, job_id).await?;
    if result.rows_affected() == 0 {
        let message = match job.status {
            JobStatus::Failed | JobStatus::Cancelled => format!(
                "job {} cannot be retried while its source has a queued or running job",
                job_id
            ),
            status => format!("job {} is {} and cannot be retried", job_id, status),
        };
        return Err(KbError::conflict(message));
    }
    Ok(job)
}

pub async fn list_jobs(
    pool: &SqlitePool,
    space_id: Option<&str>,
    status: Option<JobStatus>,
    limit: i64,
) -> Result<Vec<Job>> {
    let rows = sqlx::query(
        r#"
        SELECT * FROM jobs
        WHERE (?1 IS NULL OR space_id = ?1) AND (?2 IS NULL OR status = ?2)
        ORDER BY created_at DESC, id ASC
        LIMIT ?3
        "#,
    )
    .bind(space_id)
    .bind(status.map(|s| s.as_str()))
    .bind(limit)
    .fetch_all(pool)
    .await?;
    rows.iter().map(job_from_row).collect()
}

/// Number of jobs per status, for stats output.
pub async fn counts(pool: &SqlitePool) -> Result<Vec<(String, i64)>> {
    let rows = sqlx::query("SELECT status, COUNT(*) AS n FROM jobs GROUP BY status ORDER BY status")
        .fetch_all(pool)
        .await?;
    Ok(rows
        .iter()
        .map(|r| (r.get::<String, _>("status"), r.get::<i64, _>("n")))
        .collect())
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn backoff_doubles_and_caps() {
        assert_eq!(backoff_secs(1, 5), 5);
        assert_eq!(backoff_secs(2, 5), 10);
        assert_eq!(backoff_secs(3, 5), 20);
        assert_eq!(backoff_secs(6, 5), 160);
        assert_eq!(backoff_secs(20, 5), 160);
    }

    #[test]
    fn backoff_handles_zero_attempts() {
        assert_eq!(backoff_secs(0, 7), 7);
    }

    #[test]
    fn long_errors_are_truncated_on_char_boundary() {
        let long = "é".repeat(MAX_ERROR_LEN);
        let t = truncate_error(&long);
        assert!(t.len() <= MAX_ERROR_LEN + "…".len());
        assert!(t.ends_with('…'));
        assert_eq!(truncate_error("short"), "short");
    }
}
