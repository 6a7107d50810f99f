use std::path::PathBuf;
use std::sync::Arc;
use std::time::Duration;

use anyhow::{Context, Result};
use serde::Serialize;
use serde_json::{json, Value};
use thiserror::Error;
use tokio_util::sync::CancellationToken;
use tracing::{error, info, warn};
use vidrelay_contract::{ReadinessNotice, UploadDescriptor};
use vidrelay_negotiation::{ModeNegotiator, ModeSwitchError};
use vidrelay_storage::{AttemptFailure, BackupJob, BackupQueue, FailureDisposition};

use crate::disk::{check_admission, DiskError, DiskProbe};

#[derive(Debug, Error)]
pub enum JobError {
    #[error("insufficient disk space: {available} bytes free, {required} required")]
    InsufficientDiskSpace { required: u64, available: u64 },
    #[error(transparent)]
    Disk(#[from] DiskError),
    #[error("mode switch failed after {attempts} attempts: {source}")]
    ModeSwitch {
        attempts: u32,
        #[source]
        source: ModeSwitchError,
    },
    #[error("readiness notification failed: {0}")]
    Notification(String),
    #[error("invalid job: {0}")]
    InvalidJob(String),
    #[error("disk space check did not finish: {0}")]
    DiskCheckTask(String),
}

impl JobError {
    /// Whether waiting and trying again can fix this failure.
    pub fn is_retryable(&self) -> bool {
        matches!(
            self,
            JobError::ModeSwitch { .. } | JobError::Notification(_) | JobError::DiskCheckTask(_)
        )
    }
}

#[derive(Debug, Clone)]
pub struct BackupSettings {
    /// Volume checked for free space before a job is admitted.
    pub volume_path: PathBuf,
    /// Where the remote node should send chunks.
    pub receive_url: String,
    /// Where the remote node reports a finished backup.
    pub complete_url: String,
    pub notify_timeout: Duration,
    pub concurrency: usize,
    pub poll_interval: Duration,
}

#[derive(Debug, Clone, PartialEq, Eq, Serialize)]
#[serde(tag = "outcome", rename_all = "snake_case")]
pub enum JobReport {
    Completed { job_id: String },
    RetryScheduled { job_id: String, available_at_ms: i64 },
    Failed { job_id: String, reason: String },
    /// The job stopped being active while this attempt ran, so the queue
    /// kept whatever state it already had.
    Superseded { job_id: String },
}

pub struct BackupWorker {
    queue: BackupQueue,
    disk: Arc<dyn DiskProbe>,
    negotiator: Option<Arc<dyn ModeNegotiator>>,
    http: reqwest::Client,
    settings: BackupSettings,
}

impl BackupWorker {
    pub fn new(
        queue: BackupQueue,
        disk: Arc<dyn DiskProbe>,
        negotiator: Option<Arc<dyn ModeNegotiator>>,
        http: reqwest::Client,
        settings: BackupSettings,
    ) -> Self {
        Self {
            queue,
            disk,
            negotiator,
            http,
            settings,
        }
    }

    pub fn queue(&self) -> &BackupQueue {
        &self.queue
    }

    /// Runs `concurrency` claim loops until `shutdown` is cancelled. A job
    /// already in progress is finished before its loop exits.
    pub async fn run(self: Arc<Self>, shutdown: CancellationToken) -> Result<()> {
        self.queue.recover_interrupted().await?;

        let loops = self.settings.concurrency.max(1);
        info!(concurrency = loops, "backup worker started");

        let handles: Vec<_> = (0..loops)
            .map(|worker_id| {
                let worker = self.clone();
                let shutdown = shutdown.clone();
                tokio::spawn(async move { worker.claim_loop(worker_id, shutdown).await })
            })
            .collect();

        for handle in handles {
            handle.await.context("backup worker loop panicked")?;
        }
        info!("backup worker stopped");
        Ok(())
    }

    async fn claim_loop(&self, worker_id: usize, shutdown: CancellationToken) {
        while !shutdown.is_cancelled() {
            match self.run_once().await {
                Ok(Some(_)) => continue,
                Ok(None) => {}
                Err(err) => error!(worker_id, error = %err, "backup worker iteration failed"),
            }

            tokio::select! {
                _ = shutdown.cancelled() => break,
                _ = tokio::time::sleep(self.settings.poll_interval) => {}
            }
        }
    }

    /// Claims and processes at most one due job.
    ///
    /// If the outcome cannot be written back, the job is released to the
    /// queue rather than left `active` until the next restart.
    pub async fn run_once(&self) -> Result<Option<JobReport>> {
        let Some(job) = self.queue.claim_next().await? else {
            return Ok(None);
        };

        let outcome = self.process(&job).await;
        match self.settle(&job, outcome).await {
            Ok(report) => Ok(Some(report)),
            Err(err) => {
                error!(
                    job_id = %job.job_id,
                    error = %format!("{err:#}"),
                    "backup job outcome not recorded"
                );
                if let Err(release_err) = self.queue.release(&job.job_id).await {
                    error!(
                        job_id = %job.job_id,
                        error = %format!("{release_err:#}"),
                        "backup job stranded in active state until restart"
                    );
                }
                Err(err)
            }
        }
    }

    async fn settle(&self, job: &BackupJob, outcome: Result<Value, JobError>) -> Result<JobReport> {
        let job_id = job.job_id.clone();
        let err = match outcome {
            Ok(result) => {
                if self.queue.complete(&job_id, result).await? {
                    return Ok(JobReport::Completed { job_id });
                }
                return Ok(JobReport::Superseded { job_id });
            }
            Err(err) => err,
        };

        let failure = AttemptFailure {
            reason: err.to_string(),
            retryable: err.is_retryable(),
        };
        let report = match self.queue.fail_attempt(&job_id, &failure).await? {
            FailureDisposition::RetryScheduled {
                available_at_ms, ..
            } => JobReport::RetryScheduled {
                job_id,
                available_at_ms,
            },
            FailureDisposition::Failed { .. } => JobReport::Failed {
                job_id,
                reason: failure.reason,
            },
            FailureDisposition::NotActive => {
                warn!(
                    job_id = %job_id,
                    reason = %failure.reason,
                    "attempt failure not recorded, job is no longer active"
                );
                JobReport::Superseded { job_id }
            }
        };
        Ok(report)
    }

    /// One attempt: admission check, optional mode switch, readiness
    /// notification.
    pub async fn process(&self, job: &BackupJob) -> Result<Value, JobError> {
        self.admit(job).await?;

        let upload = job
            .upload()
            .map_err(|err| JobError::InvalidJob(format!("{err:#}")))?;
        match (upload, &self.negotiator) {
            (Some(upload), Some(negotiator)) => {
                Self::switch_mode(negotiator.as_ref(), &upload).await?
            }
            (Some(upload), None) => warn!(
                job_id = %job.job_id,
                upload_id = %upload.upload_id,
                "no negotiator configured, mode switch skipped"
            ),
            (None, _) => {}
        }

        self.notify_ready(job).await?;
        Ok(json!({ "status": "ready", "videoId": job.video_id }))
    }

    async fn switch_mode(
        negotiator: &dyn ModeNegotiator,
        upload: &UploadDescriptor,
    ) -> Result<(), JobError> {
        let outcome = negotiator.request_upload_mode(upload).await;
        if outcome.success {
            return Ok(());
        }
        let source = outcome.error.unwrap_or(ModeSwitchError::Request {
            message: "mode switch reported failure without a cause".to_string(),
        });
        Err(JobError::ModeSwitch {
            attempts: outcome.attempts,
            source,
        })
    }

    async fn admit(&self, job: &BackupJob) -> Result<(), JobError> {
        let required = job.required_bytes();
        let probe = self.disk.clone();
        let volume = self.settings.volume_path.clone();

        let admission =
            tokio::task::spawn_blocking(move || check_admission(probe.as_ref(), required, &volume))
                .await
                .map_err(|err| JobError::DiskCheckTask(err.to_string()))??;

        if admission.is_sufficient() {
            return Ok(());
        }
        warn!(
            job_id = %job.job_id,
            required = admission.required,
            available = admission.available,
            "backup job rejected by disk admission"
        );
        Err(JobError::InsufficientDiskSpace {
            required: admission.required,
            available: admission.available,
        })
    }

    async fn notify_ready(&self, job: &BackupJob) -> Result<(), JobError> {
        let notice = ReadinessNotice {
            video_id: job.video_id.clone(),
            link_to_receive: self.settings.receive_url.clone(),
            link_to_notice_that_backup_complete: self.settings.complete_url.clone(),
        };

        let response = self
            .http
            .post(&job.callback_url)
            .timeout(self.settings.notify_timeout)
            .json(&notice)
            .send()
            .await
            .map_err(|err| JobError::Notification(err.to_string()))?;

        let status = response.status();
        if !status.is_success() {
            return Err(JobError::Notification(format!(
                "callback responded with status {}",
                status.as_u16()
            )));
        }

        info!(job_id = %job.job_id, video_id = %job.video_id, "receiving node notified");
        Ok(())
    }
}
