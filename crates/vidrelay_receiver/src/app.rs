use std::io;
use std::path::{Path, PathBuf};
use std::sync::Arc;

use anyhow::Context;
use axum::{
    body::Body,
    extract::{DefaultBodyLimit, State},
    http::{HeaderMap, StatusCode},
    routing::{get, post},
    Json, Router,
};
use chrono::{DateTime, Utc};
use futures::TryStreamExt;
use serde_json::{json, Value};
use tokio::{
    fs::OpenOptions,
    io::{AsyncWriteExt, BufWriter},
    sync::RwLock,
};
use tokio_util::io::StreamReader;
use tracing::{error, info, warn};
use uuid::Uuid;
use vidrelay_contract::{
    validate_plain_name, ChunkStored, CurrentModeReply, HealthReply, ModeSwitchReply,
    ModeSwitchRequest, NodeMode, UploadId, CHUNK_NAME_HEADER, CURRENT_MODE_PATH, HEALTH_PATH,
    MODE_SWITCH_PATH, SWITCH_TO_UPLOAD_MODE, UPLOAD_CHUNK_PATH, VIDEO_ID_HEADER,
};

type ApiError = (StatusCode, Json<Value>);

#[derive(Debug, Clone)]
struct ModeState {
    mode: NodeMode,
    upload_id: Option<UploadId>,
    switched_at: Option<DateTime<Utc>>,
}

#[derive(Clone)]
pub struct ReceiverState {
    storage_dir: Arc<PathBuf>,
    mode: Arc<RwLock<ModeState>>,
}

impl ReceiverState {
    pub fn new(storage_dir: impl Into<PathBuf>) -> Self {
        Self {
            storage_dir: Arc::new(storage_dir.into()),
            mode: Arc::new(RwLock::new(ModeState {
                mode: NodeMode::Serving,
                upload_id: None,
                switched_at: None,
            })),
        }
    }

    pub fn storage_dir(&self) -> &Path {
        &self.storage_dir
    }

    pub async fn mode(&self) -> NodeMode {
        self.mode.read().await.mode
    }
}

pub fn build_router(state: ReceiverState) -> Router {
    Router::new()
        .route(HEALTH_PATH, get(health))
        .route(CURRENT_MODE_PATH, get(current_mode))
        .route(MODE_SWITCH_PATH, post(switch_mode))
        .route(UPLOAD_CHUNK_PATH, post(upload_chunk))
        .layer(DefaultBodyLimit::disable())
        .with_state(state)
}

async fn health(State(state): State<ReceiverState>) -> Json<HealthReply> {
    Json(HealthReply {
        status: "ready".to_string(),
        mode: state.mode().await,
        timestamp: Utc::now(),
    })
}

async fn current_mode(State(state): State<ReceiverState>) -> Json<CurrentModeReply> {
    let mode = state.mode.read().await;
    Json(CurrentModeReply {
        mode: mode.mode,
        upload_id: mode.upload_id.clone(),
        switched_at: mode.switched_at,
    })
}

async fn switch_mode(
    State(state): State<ReceiverState>,
    Json(request): Json<ModeSwitchRequest>,
) -> Result<Json<ModeSwitchReply>, ApiError> {
    if request.action != SWITCH_TO_UPLOAD_MODE {
        return Err(bad_request(format!(
            "unsupported action {:?}",
            request.action
        )));
    }

    let mut mode = state.mode.write().await;
    mode.mode = NodeMode::Upload;
    mode.upload_id = Some(request.upload_id.clone());
    mode.switched_at = Some(Utc::now());

    info!(
        upload_id = %request.upload_id,
        total_chunks = request.total_chunks,
        source = %request.source,
        "switched to upload mode"
    );
    Ok(Json(ModeSwitchReply {
        success: true,
        mode: NodeMode::Upload,
        upload_id: request.upload_id,
    }))
}

async fn upload_chunk(
    State(state): State<ReceiverState>,
    headers: HeaderMap,
    body: Body,
) -> Result<(StatusCode, Json<ChunkStored>), ApiError> {
    let chunk = required_name(&headers, CHUNK_NAME_HEADER, "chunk")?;
    let video_id = required_name(&headers, VIDEO_ID_HEADER, "video_id")?;

    let video_dir = state.storage_dir.join(&video_id);
    tokio::fs::create_dir_all(&video_dir)
        .await
        .with_context(|| format!("create {}", video_dir.display()))
        .map_err(internal_error)?;

    // Each request streams into its own file; the last rename wins whole.
    let final_path = video_dir.join(&chunk);
    let part_path = video_dir.join(format!("{chunk}.{}.part", Uuid::now_v7().simple()));

    let stored = match write_body(&part_path, body).await {
        Ok(bytes) => tokio::fs::rename(&part_path, &final_path)
            .await
            .map(|()| bytes)
            .with_context(|| format!("move {} into place", part_path.display())),
        Err(err) => Err(anyhow::Error::new(err).context(format!("store chunk {chunk}"))),
    };
    let bytes = match stored {
        Ok(bytes) => bytes,
        Err(err) => {
            remove_partial(&part_path).await;
            return Err(internal_error(err));
        }
    };

    info!(video_id = %video_id, chunk = %chunk, bytes, "chunk stored");
    Ok((
        StatusCode::CREATED,
        Json(ChunkStored {
            video_id,
            chunk,
            bytes,
        }),
    ))
}

async fn write_body(path: &Path, body: Body) -> io::Result<u64> {
    let stream = body.into_data_stream().map_err(io::Error::other);
    let reader = StreamReader::new(stream);
    futures::pin_mut!(reader);

    let file = OpenOptions::new()
        .write(true)
        .create_new(true)
        .open(path)
        .await?;
    let mut file = BufWriter::new(file);
    let bytes = tokio::io::copy(&mut reader, &mut file).await?;
    file.flush().await?;
    Ok(bytes)
}

async fn remove_partial(path: &Path) {
    match tokio::fs::remove_file(path).await {
        Ok(()) => {}
        Err(err) if err.kind() == io::ErrorKind::NotFound => {}
        Err(err) => warn!(path = %path.display(), error = %err, "partial chunk not removed"),
    }
}

fn required_name(
    headers: &HeaderMap,
    header: &str,
    field: &'static str,
) -> Result<String, ApiError> {
    let value = headers
        .get(header)
        .and_then(|value| value.to_str().ok())
        .unwrap_or_default();
    validate_plain_name(field, value).map_err(|err| bad_request(err.to_string()))?;
    Ok(value.to_string())
}

fn bad_request(detail: String) -> ApiError {
    (
        StatusCode::BAD_REQUEST,
        Json(json!({ "error": "bad_request", "detail": detail })),
    )
}

fn internal_error(error: anyhow::Error) -> ApiError {
    error!(error = %error, "request failed");
    (
        StatusCode::INTERNAL_SERVER_ERROR,
        Json(json!({ "error": "internal_error", "detail": format!("{error:#}") })),
    )
}
