use std::path::{Component, Path, PathBuf};
use std::time::Duration;

use serde::{Deserialize, Serialize};
use thiserror::Error;
use vidrelay_retry::{RetryPolicy, RetryPolicyError};

#[derive(Debug, Error, PartialEq)]
pub enum ContractError {
    #[error("{0} must not be empty")]
    Empty(&'static str),
    #[error("{field} must be a plain file name, got {value:?}")]
    InvalidName { field: &'static str, value: String },
    #[error("{field} must be an http(s) URL, got {value:?}")]
    InvalidUrl { field: &'static str, value: String },
    #[error("{0} must be greater than zero")]
    Zero(&'static str),
    #[error("invalid backoff: {0}")]
    Backoff(#[from] RetryPolicyError),
}

pub(crate) fn require_non_empty(field: &'static str, value: &str) -> Result<(), ContractError> {
    if value.trim().is_empty() {
        Err(ContractError::Empty(field))
    } else {
        Ok(())
    }
}

fn require_url(field: &'static str, value: &str) -> Result<(), ContractError> {
    require_non_empty(field, value)?;
    if value.starts_with("http://") || value.starts_with("https://") {
        Ok(())
    } else {
        Err(ContractError::InvalidUrl {
            field,
            value: value.to_string(),
        })
    }
}

/// Accepts a single normal path component: no separators, no `..`, no root.
pub fn validate_plain_name(field: &'static str, value: &str) -> Result<(), ContractError> {
    require_non_empty(field, value)?;
    let mut components = Path::new(value).components();
    let plain = matches!(components.next(), Some(Component::Normal(_)))
        && components.next().is_none()
        && !value.contains('/')
        && !value.contains('\\');
    if plain {
        Ok(())
    } else {
        Err(ContractError::InvalidName {
            field,
            value: value.to_string(),
        })
    }
}

/// What the sender has staged locally for an upload-mode session.
#[derive(Debug, Clone, Serialize, Deserialize, PartialEq, Eq)]
#[serde(rename_all = "camelCase")]
pub struct UploadDescriptor {
    pub upload_id: String,
    pub total_chunks: u32,
    pub filename: String,
    pub chunk_directory: String,
}

impl UploadDescriptor {
    pub fn validate(&self) -> Result<(), ContractError> {
        require_non_empty("upload_id", &self.upload_id)?;
        require_non_empty("filename", &self.filename)?;
        require_non_empty("chunk_directory", &self.chunk_directory)?;
        if self.total_chunks == 0 {
            return Err(ContractError::Zero("total_chunks"));
        }
        Ok(())
    }
}

/// A request to back up one video, validated before it reaches the queue.
#[derive(Debug, Clone, PartialEq)]
pub struct BackupJobSpec {
    pub video_id: String,
    pub required_bytes: u64,
    pub callback_url: String,
    pub policy: RetryPolicy,
    pub upload: Option<UploadDescriptor>,
}

impl BackupJobSpec {
    pub fn new(
        video_id: impl Into<String>,
        required_bytes: u64,
        callback_url: impl Into<String>,
        policy: RetryPolicy,
    ) -> Result<Self, ContractError> {
        let video_id = video_id.into();
        let callback_url = callback_url.into();
        require_non_empty("video_id", &video_id)?;
        require_url("callback_url", &callback_url)?;
        Ok(Self {
            video_id,
            required_bytes,
            callback_url,
            policy,
            upload: None,
        })
    }

    pub fn with_backoff(
        mut self,
        max_attempts: u32,
        base_delay: Duration,
        multiplier: f64,
    ) -> Result<Self, ContractError> {
        self.policy = RetryPolicy::new(max_attempts, base_delay, multiplier)?;
        Ok(self)
    }

    pub fn with_upload(mut self, upload: UploadDescriptor) -> Result<Self, ContractError> {
        upload.validate()?;
        self.upload = Some(upload);
        Ok(self)
    }
}

/// Where a transfer goes: the receiving node and the metadata authority.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct TransferDestination {
    pub receiver_url: String,
    pub metadata_url: String,
    /// Path under which the receiving node keeps the chunks, reported to the
    /// metadata authority.
    pub stored_path: String,
}

impl TransferDestination {
    pub fn new(
        receiver_url: impl Into<String>,
        metadata_url: impl Into<String>,
        stored_path: impl Into<String>,
    ) -> Result<Self, ContractError> {
        let destination = Self {
            receiver_url: receiver_url.into(),
            metadata_url: metadata_url.into(),
            stored_path: stored_path.into(),
        };
        require_url("receiver_url", &destination.receiver_url)?;
        require_url("metadata_url", &destination.metadata_url)?;
        require_non_empty("stored_path", &destination.stored_path)?;
        Ok(destination)
    }
}

#[derive(Debug, Clone, PartialEq, Eq)]
pub struct TransferRequest {
    pub folder_path: PathBuf,
    pub chunk_list: Vec<String>,
    pub user_contact: String,
    pub user_id: String,
    pub video_id: String,
    pub destination: TransferDestination,
}

impl TransferRequest {
    pub fn new(
        folder_path: impl Into<PathBuf>,
        user_contact: impl Into<String>,
        user_id: impl Into<String>,
        video_id: impl Into<String>,
        chunk_list: Vec<String>,
        destination: TransferDestination,
    ) -> Result<Self, ContractError> {
        let request = Self {
            folder_path: folder_path.into(),
            chunk_list,
            user_contact: user_contact.into(),
            user_id: user_id.into(),
            video_id: video_id.into(),
            destination,
        };
        if request.folder_path.as_os_str().is_empty() {
            return Err(ContractError::Empty("folder_path"));
        }
        require_non_empty("user_contact", &request.user_contact)?;
        require_non_empty("user_id", &request.user_id)?;
        validate_plain_name("video_id", &request.video_id)?;
        if request.chunk_list.is_empty() {
            return Err(ContractError::Empty("chunk_list"));
        }
        for chunk in &request.chunk_list {
            validate_plain_name("chunk", chunk)?;
        }
        Ok(request)
    }

    pub fn chunk_path(&self, chunk: &str) -> PathBuf {
        self.folder_path.join(chunk)
    }
}
