mod job;
mod repository;

pub use job::{
    AttemptFailure, AttemptRecord, BackupJob, FailureDisposition, JobCounts, JobState,
};
pub use repository::{BackupQueue, StorageConfig};
