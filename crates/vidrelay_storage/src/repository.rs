use anyhow::{Context, Result};
use chrono::Utc;
use serde_json::Value;
use sqlx::sqlite::{SqliteConnectOptions, SqlitePoolOptions};
use sqlx::SqlitePool;
use std::str::FromStr;
use tracing::{error, info, warn};
use uuid::Uuid;
use vidrelay_contract::BackupJobSpec;

use crate::job::{
    AttemptFailure, AttemptRecord, BackupJob, FailureDisposition, JobCounts, JobState,
};

const SCHEMA_SQL: &str = include_str!("sql/schema.sql");

const JOB_COLUMNS: &str = "job_id, video_id, required_bytes, callback_url, upload_json, max_attempts, base_delay_ms, multiplier, state, attempts_made, last_error, result_json, available_at_ms, submitted_at, updated_at";

#[derive(Debug, Clone)]
pub struct StorageConfig {
    pub sqlite_path: String,
}

/// Durable backup job queue.
///
/// Every state transition is a single statement guarded by the state the job
/// must currently be in, so only the holder of a claim can finish it.
#[derive(Debug, Clone)]
pub struct BackupQueue {
    pool: SqlitePool,
}

impl BackupQueue {
    pub async fn connect(config: &StorageConfig) -> Result<Self> {
        let uri = normalize_sqlite_uri(&config.sqlite_path);
        let options = SqliteConnectOptions::from_str(&uri)
            .with_context(|| format!("invalid sqlite URI: {}", uri))?
            .create_if_missing(true);

        let pool = SqlitePoolOptions::new()
            .max_connections(5)
            .connect_with(options)
            .await
            .context("failed to connect sqlite pool")?;

        let queue = Self { pool };
        queue.migrate().await?;
        Ok(queue)
    }

    pub fn pool(&self) -> &SqlitePool {
        &self.pool
    }

    pub async fn migrate(&self) -> Result<()> {
        for statement in SCHEMA_SQL.split(';') {
            let sql = statement.trim();
            if sql.is_empty() {
                continue;
            }
            sqlx::query(sql)
                .execute(&self.pool)
                .await
                .with_context(|| format!("migration failed for statement: {sql}"))?;
        }
        info!("backup queue schema ready");
        Ok(())
    }

    pub async fn enqueue(&self, spec: &BackupJobSpec) -> Result<BackupJob> {
        let now = Utc::now();
        let job_id = Uuid::now_v7().to_string();
        let upload_json = spec
            .upload
            .as_ref()
            .map(serde_json::to_string)
            .transpose()
            .context("serialize upload descriptor")?;
        let required_bytes =
            i64::try_from(spec.required_bytes).context("required_bytes too large")?;
        let base_delay_ms = i64::try_from(spec.policy.base_delay().as_millis())
            .context("base delay too large")?;

        sqlx::query(
            "INSERT INTO backup_jobs(job_id, video_id, required_bytes, callback_url, upload_json, max_attempts, base_delay_ms, multiplier, state, attempts_made, available_at_ms, submitted_at, updated_at) VALUES (?, ?, ?, ?, ?, ?, ?, ?, ?, 0, ?, ?, ?)",
        )
        .bind(&job_id)
        .bind(&spec.video_id)
        .bind(required_bytes)
        .bind(&spec.callback_url)
        .bind(upload_json)
        .bind(i64::from(spec.policy.max_attempts()))
        .bind(base_delay_ms)
        .bind(spec.policy.multiplier())
        .bind(JobState::Queued.as_str())
        .bind(now.timestamp_millis())
        .bind(now.to_rfc3339())
        .bind(now.to_rfc3339())
        .execute(&self.pool)
        .await
        .context("insert backup job")?;

        info!(job_id = %job_id, video_id = %spec.video_id, "backup job queued");

        self.get_job(&job_id)
            .await?
            .context("backup job missing after insert")
    }

    pub async fn get_job(&self, job_id: &str) -> Result<Option<BackupJob>> {
        sqlx::query_as::<_, BackupJob>(&format!(
            "SELECT {JOB_COLUMNS} FROM backup_jobs WHERE job_id = ?"
        ))
        .bind(job_id)
        .fetch_optional(&self.pool)
        .await
        .with_context(|| format!("query backup job {job_id}"))
    }

    pub async fn claim_next(&self) -> Result<Option<BackupJob>> {
        self.claim_next_at(Utc::now().timestamp_millis()).await
    }

    /// Moves the oldest due `queued` job to `active` and starts its next
    /// attempt. `now_ms` is the clock reading in unix milliseconds.
    pub async fn claim_next_at(&self, now_ms: i64) -> Result<Option<BackupJob>> {
        let job = sqlx::query_as::<_, BackupJob>(&format!(
            "UPDATE backup_jobs SET state = 'active', attempts_made = attempts_made + 1, updated_at = ? \
             WHERE job_id = (SELECT job_id FROM backup_jobs WHERE state = 'queued' AND available_at_ms <= ? \
             ORDER BY available_at_ms ASC, submitted_at ASC LIMIT 1) AND state = 'queued' \
             RETURNING {JOB_COLUMNS}"
        ))
        .bind(Utc::now().to_rfc3339())
        .bind(now_ms)
        .fetch_optional(&self.pool)
        .await
        .context("claim next backup job")?;

        if let Some(job) = &job {
            info!(
                job_id = %job.job_id,
                video_id = %job.video_id,
                attempt = job.attempts_made,
                "backup job active"
            );
        }
        Ok(job)
    }

    pub async fn complete(&self, job_id: &str, result: Value) -> Result<bool> {
        let result_json = serde_json::to_string(&result).context("serialize job result")?;
        let updated = sqlx::query(
            "UPDATE backup_jobs SET state = 'completed', result_json = ?, last_error = NULL, updated_at = ? WHERE job_id = ? AND state = 'active'",
        )
        .bind(result_json)
        .bind(Utc::now().to_rfc3339())
        .bind(job_id)
        .execute(&self.pool)
        .await
        .with_context(|| format!("complete backup job {job_id}"))?;

        if updated.rows_affected() == 0 {
            warn!(job_id = %job_id, "completion ignored, job is not active");
            return Ok(false);
        }

        let attempt = self.current_attempt(job_id).await?;
        self.record_attempt(job_id, attempt, "completed", None).await?;
        info!(job_id = %job_id, attempt, "backup job completed");
        Ok(true)
    }

    pub async fn fail_attempt(
        &self,
        job_id: &str,
        failure: &AttemptFailure,
    ) -> Result<FailureDisposition> {
        self.fail_attempt_at(job_id, failure, Utc::now().timestamp_millis())
            .await
    }

    /// Records a failed attempt and either schedules the next one after the
    /// job's backoff or marks the job `failed`.
    pub async fn fail_attempt_at(
        &self,
        job_id: &str,
        failure: &AttemptFailure,
        now_ms: i64,
    ) -> Result<FailureDisposition> {
        let Some(job) = self.get_job(job_id).await? else {
            return Ok(FailureDisposition::NotActive);
        };
        if job.state != JobState::Active {
            return Ok(FailureDisposition::NotActive);
        }

        let attempt = job.attempt();
        // A stored backoff that no longer parses cannot schedule a retry.
        let policy = match job.policy() {
            Ok(policy) => Some(policy),
            Err(err) => {
                error!(job_id = %job_id, error = %format!("{err:#}"), "stored backoff unreadable");
                None
            }
        };
        let disposition = match policy {
            Some(policy) if failure.retryable && policy.should_retry(attempt) => {
                let delay_ms = i64::try_from(policy.compute_delay(attempt).as_millis())
                    .unwrap_or(i64::MAX);
                FailureDisposition::RetryScheduled {
                    attempt,
                    available_at_ms: now_ms.saturating_add(delay_ms),
                }
            }
            _ => FailureDisposition::Failed { attempt },
        };

        let (state, available_at_ms) = match disposition {
            FailureDisposition::RetryScheduled {
                available_at_ms, ..
            } => (JobState::Queued, available_at_ms),
            _ => (JobState::Failed, job.available_at_ms),
        };

        let updated = sqlx::query(
            "UPDATE backup_jobs SET state = ?, last_error = ?, available_at_ms = ?, updated_at = ? WHERE job_id = ? AND state = 'active'",
        )
        .bind(state.as_str())
        .bind(&failure.reason)
        .bind(available_at_ms)
        .bind(Utc::now().to_rfc3339())
        .bind(job_id)
        .execute(&self.pool)
        .await
        .with_context(|| format!("fail backup job attempt {job_id}"))?;

        if updated.rows_affected() == 0 {
            return Ok(FailureDisposition::NotActive);
        }

        self.record_attempt(job_id, i64::from(attempt), "failed", Some(&failure.reason))
            .await?;

        match disposition {
            FailureDisposition::RetryScheduled { .. } => warn!(
                job_id = %job_id,
                attempt,
                max_attempts = job.max_attempts,
                reason = %failure.reason,
                "backup job attempt failed, retry scheduled"
            ),
            _ => warn!(
                job_id = %job_id,
                attempt,
                reason = %failure.reason,
                "backup job failed"
            ),
        }
        Ok(disposition)
    }

    /// Hands an `active` job back to the queue when its outcome could not be
    /// recorded. The attempt stays counted.
    pub async fn release(&self, job_id: &str) -> Result<bool> {
        let now = Utc::now();
        let result = sqlx::query(
            "UPDATE backup_jobs SET state = 'queued', available_at_ms = ?, updated_at = ? WHERE job_id = ? AND state = 'active'",
        )
        .bind(now.timestamp_millis())
        .bind(now.to_rfc3339())
        .bind(job_id)
        .execute(&self.pool)
        .await
        .with_context(|| format!("release backup job {job_id}"))?;

        let released = result.rows_affected() > 0;
        if released {
            warn!(job_id = %job_id, "backup job released back to the queue");
        }
        Ok(released)
    }

    /// Returns jobs a crashed worker left `active` to `queued`. The
    /// interrupted attempt does not count against the budget.
    pub async fn recover_interrupted(&self) -> Result<u64> {
        let result = sqlx::query(
            "UPDATE backup_jobs SET state = 'queued', attempts_made = MAX(attempts_made - 1, 0), updated_at = ? WHERE state = 'active'",
        )
        .bind(Utc::now().to_rfc3339())
        .execute(&self.pool)
        .await
        .context("recover interrupted backup jobs")?;

        let recovered = result.rows_affected();
        if recovered > 0 {
            warn!(recovered, "re-queued backup jobs interrupted by a previous shutdown");
        }
        Ok(recovered)
    }

    pub async fn list_jobs(&self, state: Option<JobState>, limit: i64) -> Result<Vec<BackupJob>> {
        match state {
            Some(state) => sqlx::query_as::<_, BackupJob>(&format!(
                "SELECT {JOB_COLUMNS} FROM backup_jobs WHERE state = ? ORDER BY submitted_at ASC, job_id ASC LIMIT ?"
            ))
            .bind(state.as_str())
            .bind(limit)
            .fetch_all(&self.pool)
            .await
            .with_context(|| format!("list {state} backup jobs")),
            None => sqlx::query_as::<_, BackupJob>(&format!(
                "SELECT {JOB_COLUMNS} FROM backup_jobs ORDER BY submitted_at ASC, job_id ASC LIMIT ?"
            ))
            .bind(limit)
            .fetch_all(&self.pool)
            .await
            .context("list backup jobs"),
        }
    }

    pub async fn count_by_state(&self) -> Result<JobCounts> {
        let rows = sqlx::query_as::<_, (String, i64)>(
            "SELECT state, COUNT(*) FROM backup_jobs GROUP BY state",
        )
        .fetch_all(&self.pool)
        .await
        .context("count backup jobs")?;

        let mut counts = JobCounts::default();
        for (state, count) in rows {
            let count = u64::try_from(count).unwrap_or(0);
            match state.parse::<JobState>()? {
                JobState::Queued => counts.waiting = count,
                JobState::Active => counts.active = count,
                JobState::Completed => counts.completed = count,
                JobState::Failed => counts.failed = count,
            }
        }
        Ok(counts)
    }

    pub async fn list_attempts(&self, job_id: &str) -> Result<Vec<AttemptRecord>> {
        sqlx::query_as::<_, AttemptRecord>(
            "SELECT job_id, attempt, outcome, error, recorded_at FROM backup_job_attempts WHERE job_id = ? ORDER BY attempt_id ASC",
        )
        .bind(job_id)
        .fetch_all(&self.pool)
        .await
        .with_context(|| format!("list attempts for {job_id}"))
    }

    /// Re-submits every `failed` job with a fresh attempt budget. Returns how
    /// many jobs were re-submitted.
    pub async fn retry_failed(&self) -> Result<u64> {
        let now = Utc::now();
        let result = sqlx::query(
            "UPDATE backup_jobs SET state = 'queued', attempts_made = 0, last_error = NULL, available_at_ms = ?, updated_at = ? WHERE state = 'failed'",
        )
        .bind(now.timestamp_millis())
        .bind(now.to_rfc3339())
        .execute(&self.pool)
        .await
        .context("retry failed backup jobs")?;

        let resubmitted = result.rows_affected();
        info!(resubmitted, "failed backup jobs re-submitted");
        Ok(resubmitted)
    }

    pub async fn retry_job(&self, job_id: &str) -> Result<bool> {
        let now = Utc::now();
        let result = sqlx::query(
            "UPDATE backup_jobs SET state = 'queued', attempts_made = 0, last_error = NULL, available_at_ms = ?, updated_at = ? WHERE job_id = ? AND state = 'failed'",
        )
        .bind(now.timestamp_millis())
        .bind(now.to_rfc3339())
        .bind(job_id)
        .execute(&self.pool)
        .await
        .with_context(|| format!("retry backup job {job_id}"))?;

        let resubmitted = result.rows_affected() > 0;
        if resubmitted {
            info!(job_id = %job_id, "failed backup job re-submitted");
        }
        Ok(resubmitted)
    }

    async fn current_attempt(&self, job_id: &str) -> Result<i64> {
        sqlx::query_scalar::<_, i64>("SELECT attempts_made FROM backup_jobs WHERE job_id = ?")
            .bind(job_id)
            .fetch_one(&self.pool)
            .await
            .with_context(|| format!("query attempt counter for {job_id}"))
    }

    async fn record_attempt(
        &self,
        job_id: &str,
        attempt: i64,
        outcome: &str,
        error: Option<&str>,
    ) -> Result<()> {
        sqlx::query(
            "INSERT INTO backup_job_attempts(job_id, attempt, outcome, error, recorded_at) VALUES (?, ?, ?, ?, ?)",
        )
        .bind(job_id)
        .bind(attempt)
        .bind(outcome)
        .bind(error)
        .bind(Utc::now().to_rfc3339())
        .execute(&self.pool)
        .await
        .with_context(|| format!("record attempt {attempt} for {job_id}"))?;
        Ok(())
    }
}

fn normalize_sqlite_uri(raw: &str) -> String {
    if raw.starts_with("sqlite:") {
        raw.to_string()
    } else {
        format!("sqlite://{raw}")
    }
}
