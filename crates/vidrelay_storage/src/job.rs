use std::fmt;
use std::str::FromStr;
use std::time::Duration;

use anyhow::{anyhow, Context, Result};
use serde::{Deserialize, Serialize};
use sqlx::FromRow;
use vidrelay_contract::UploadDescriptor;
use vidrelay_retry::RetryPolicy;

#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, Serialize, Deserialize)]
#[serde(rename_all = "snake_case")]
pub enum JobState {
    Queued,
    Active,
    Completed,
    Failed,
}

impl JobState {
    pub const ALL: [JobState; 4] = [
        JobState::Queued,
        JobState::Active,
        JobState::Completed,
        JobState::Failed,
    ];

    pub fn as_str(&self) -> &'static str {
        match self {
            JobState::Queued => "queued",
            JobState::Active => "active",
            JobState::Completed => "completed",
            JobState::Failed => "failed",
        }
    }

    pub fn is_terminal(&self) -> bool {
        matches!(self, JobState::Completed | JobState::Failed)
    }
}

impl fmt::Display for JobState {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.write_str(self.as_str())
    }
}

impl FromStr for JobState {
    type Err = anyhow::Error;

    fn from_str(raw: &str) -> Result<Self> {
        match raw.trim().to_ascii_lowercase().as_str() {
            "queued" | "waiting" => Ok(JobState::Queued),
            "active" => Ok(JobState::Active),
            "completed" => Ok(JobState::Completed),
            "failed" => Ok(JobState::Failed),
            other => Err(anyhow!("unknown job state {other:?}")),
        }
    }
}

impl TryFrom<String> for JobState {
    type Error = anyhow::Error;

    fn try_from(raw: String) -> Result<Self> {
        raw.parse()
    }
}

#[derive(Debug, Clone, Serialize, Deserialize, FromRow)]
pub struct BackupJob {
    pub job_id: String,
    pub video_id: String,
    pub required_bytes: i64,
    pub callback_url: String,
    pub upload_json: Option<String>,
    pub max_attempts: i64,
    pub base_delay_ms: i64,
    pub multiplier: f64,
    #[sqlx(try_from = "String")]
    pub state: JobState,
    pub attempts_made: i64,
    pub last_error: Option<String>,
    pub result_json: Option<String>,
    pub available_at_ms: i64,
    pub submitted_at: String,
    pub updated_at: String,
}

impl BackupJob {
    pub fn policy(&self) -> Result<RetryPolicy> {
        RetryPolicy::new(
            u32::try_from(self.max_attempts).context("max_attempts out of range")?,
            Duration::from_millis(u64::try_from(self.base_delay_ms).unwrap_or(0)),
            self.multiplier,
        )
        .with_context(|| format!("stored backoff for job {} is invalid", self.job_id))
    }

    pub fn upload(&self) -> Result<Option<UploadDescriptor>> {
        self.upload_json
            .as_deref()
            .map(|raw| {
                serde_json::from_str(raw)
                    .with_context(|| format!("parse upload descriptor for job {}", self.job_id))
            })
            .transpose()
    }

    pub fn required_bytes(&self) -> u64 {
        u64::try_from(self.required_bytes).unwrap_or(0)
    }

    pub fn attempt(&self) -> u32 {
        u32::try_from(self.attempts_made).unwrap_or(u32::MAX)
    }
}

#[derive(Debug, Clone, Serialize, Deserialize, FromRow)]
pub struct AttemptRecord {
    pub job_id: String,
    pub attempt: i64,
    pub outcome: String,
    pub error: Option<String>,
    pub recorded_at: String,
}

#[derive(Debug, Clone, Copy, Default, PartialEq, Eq, Serialize, Deserialize)]
pub struct JobCounts {
    pub waiting: u64,
    pub active: u64,
    pub completed: u64,
    pub failed: u64,
}

/// A failed attempt as reported by the worker.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct AttemptFailure {
    pub reason: String,
    /// False for failures that waiting will not fix (disk shortfall, invalid
    /// job); those skip the backoff and go straight to `failed`.
    pub retryable: bool,
}

#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum FailureDisposition {
    RetryScheduled { attempt: u32, available_at_ms: i64 },
    Failed { attempt: u32 },
    /// The job was not active, so nothing changed.
    NotActive,
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn waiting_is_an_alias_for_queued() {
        assert_eq!("waiting".parse::<JobState>().unwrap(), JobState::Queued);
        assert_eq!("QUEUED".parse::<JobState>().unwrap(), JobState::Queued);
        assert_eq!("failed".parse::<JobState>().unwrap(), JobState::Failed);
        assert!("paused".parse::<JobState>().is_err());
    }

    #[test]
    fn only_completed_and_failed_are_terminal() {
        let terminal: Vec<_> = JobState::ALL
            .iter()
            .filter(|state| state.is_terminal())
            .collect();
        assert_eq!(terminal, vec![&JobState::Completed, &JobState::Failed]);
    }
}
