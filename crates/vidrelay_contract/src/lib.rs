pub mod envelope;
pub mod request;

pub use envelope::{
    ChunkName, ChunkStored, CurrentModeReply, HealthReply, MetadataUpdate, ModeSwitchReply,
    ModeSwitchRequest, NodeMode, ReadinessNotice, UploadId, UserMessage, VideoId,
    CHUNK_NAME_HEADER, CURRENT_MODE_PATH, HEALTH_PATH, METADATA_UPDATE_PATH, MODE_SWITCH_PATH,
    SWITCH_TO_UPLOAD_MODE, UPLOAD_CHUNK_PATH, VIDEO_ID_HEADER,
};
pub use request::{
    validate_plain_name, BackupJobSpec, ContractError, TransferDestination, TransferRequest,
    UploadDescriptor,
};
