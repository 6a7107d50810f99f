use chrono::{DateTime, Utc};
use serde::{Deserialize, Serialize};

use crate::request::{require_non_empty, ContractError, UploadDescriptor};

pub type VideoId = String;
pub type UploadId = String;
pub type ChunkName = String;

pub const SWITCH_TO_UPLOAD_MODE: &str = "switch_to_upload_mode";

pub const CHUNK_NAME_HEADER: &str = "x-chunk-name";
pub const VIDEO_ID_HEADER: &str = "x-video-id";

pub const MODE_SWITCH_PATH: &str = "/mode/switch";
pub const CURRENT_MODE_PATH: &str = "/mode/current";
pub const HEALTH_PATH: &str = "/health";
pub const UPLOAD_CHUNK_PATH: &str = "/upload-chunk";
pub const METADATA_UPDATE_PATH: &str = "/videometadata/update-chunks";

#[derive(Debug, Clone, Copy, Serialize, Deserialize, PartialEq, Eq)]
#[serde(rename_all = "snake_case")]
pub enum NodeMode {
    Serving,
    Upload,
}

/// Body of `POST /mode/switch`.
#[derive(Debug, Clone, Serialize, Deserialize, PartialEq)]
#[serde(rename_all = "camelCase")]
pub struct ModeSwitchRequest {
    pub action: String,
    pub upload_id: UploadId,
    pub total_chunks: u32,
    pub filename: String,
    pub chunk_directory: String,
    pub timestamp: DateTime<Utc>,
    pub source: String,
}

impl ModeSwitchRequest {
    pub fn new(upload: UploadDescriptor, source: &str) -> Result<Self, ContractError> {
        upload.validate()?;
        require_non_empty("source", source)?;
        Ok(Self {
            action: SWITCH_TO_UPLOAD_MODE.to_string(),
            upload_id: upload.upload_id,
            total_chunks: upload.total_chunks,
            filename: upload.filename,
            chunk_directory: upload.chunk_directory,
            timestamp: Utc::now(),
            source: source.to_string(),
        })
    }
}

#[derive(Debug, Clone, Serialize, Deserialize, PartialEq, Eq)]
#[serde(rename_all = "camelCase")]
pub struct ModeSwitchReply {
    pub success: bool,
    pub mode: NodeMode,
    pub upload_id: UploadId,
}

#[derive(Debug, Clone, Serialize, Deserialize, PartialEq, Eq)]
#[serde(rename_all = "camelCase")]
pub struct CurrentModeReply {
    pub mode: NodeMode,
    pub upload_id: Option<UploadId>,
    pub switched_at: Option<DateTime<Utc>>,
}

#[derive(Debug, Clone, Serialize, Deserialize, PartialEq, Eq)]
pub struct HealthReply {
    pub status: String,
    pub mode: NodeMode,
    pub timestamp: DateTime<Utc>,
}

/// Body of the backup readiness callback.
#[derive(Debug, Clone, Serialize, Deserialize, PartialEq, Eq)]
#[serde(rename_all = "camelCase")]
pub struct ReadinessNotice {
    pub video_id: VideoId,
    pub link_to_receive: String,
    pub link_to_notice_that_backup_complete: String,
}

/// Body of `POST /videometadata/update-chunks`.
#[derive(Debug, Clone, Serialize, Deserialize, PartialEq, Eq)]
pub struct MetadataUpdate {
    #[serde(rename = "videoId")]
    pub video_id: VideoId,
    #[serde(rename = "chunkList")]
    pub chunk_list: Vec<ChunkName>,
    #[serde(rename = "serverDPath")]
    pub server_d_path: String,
}

#[derive(Debug, Clone, Serialize, Deserialize, PartialEq, Eq)]
#[serde(rename_all = "camelCase")]
pub struct ChunkStored {
    pub video_id: VideoId,
    pub chunk: ChunkName,
    pub bytes: u64,
}

/// Payload a webhook relay receives for a user-facing message.
#[derive(Debug, Clone, Serialize, Deserialize, PartialEq, Eq)]
pub struct UserMessage {
    pub recipient: String,
    pub subject: String,
    pub body: String,
}
