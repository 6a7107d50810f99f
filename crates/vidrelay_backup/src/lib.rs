//! Disk-space-aware backup pipeline: admission control plus the worker that
//! drives jobs from the durable queue.

pub mod disk;
pub mod worker;

pub use disk::{
    check_admission, has_sufficient_space, Admission, DiskError, DiskProbe, SysinfoDiskProbe,
};
pub use worker::{BackupSettings, BackupWorker, JobError, JobReport};
