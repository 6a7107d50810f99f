use std::path::PathBuf;
use std::sync::Arc;
use std::time::Duration;

use reqwest::header::{CONTENT_LENGTH, CONTENT_TYPE};
use serde::Serialize;
use thiserror::Error;
use tokio_util::io::ReaderStream;
use tracing::{info, warn};
use vidrelay_contract::{
    MetadataUpdate, TransferRequest, CHUNK_NAME_HEADER, HEALTH_PATH, METADATA_UPDATE_PATH,
    UPLOAD_CHUNK_PATH, VIDEO_ID_HEADER,
};

use crate::notifier::{NotifyError, UserNotifier};

pub const NOTIFICATION_SUBJECT: &str = "Your video is ready";

#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize)]
#[serde(rename_all = "snake_case")]
pub enum WorkflowStep {
    Readiness,
    ChunkUpload,
    MetadataUpdate,
    UserNotification,
    Complete,
}

/// Result of one transfer run. `status` follows HTTP conventions so callers
/// can relay it as-is.
#[derive(Debug, Clone, PartialEq, Eq, Serialize)]
#[serde(rename_all = "camelCase")]
pub struct WorkflowOutcome {
    pub status: u16,
    pub message: String,
    pub step: WorkflowStep,
    #[serde(skip_serializing_if = "Option::is_none")]
    pub chunk: Option<String>,
    #[serde(skip_serializing_if = "Option::is_none")]
    pub error: Option<String>,
    pub uploaded_chunks: Vec<String>,
}

impl WorkflowOutcome {
    fn new(status: u16, message: &str, step: WorkflowStep, uploaded_chunks: Vec<String>) -> Self {
        Self {
            status,
            message: message.to_string(),
            step,
            chunk: None,
            error: None,
            uploaded_chunks,
        }
    }

    fn with_error(mut self, error: impl ToString) -> Self {
        self.error = Some(error.to_string());
        self
    }

    fn with_chunk(mut self, chunk: &str) -> Self {
        self.chunk = Some(chunk.to_string());
        self
    }

    pub fn is_complete(&self) -> bool {
        self.step == WorkflowStep::Complete
    }
}

#[derive(Debug, Error)]
pub enum StepError {
    #[error("read chunk {path}: {source}")]
    ReadChunk {
        path: PathBuf,
        #[source]
        source: std::io::Error,
    },
    #[error("request failed: {0}")]
    Http(#[from] reqwest::Error),
    #[error("remote responded with status {status}: {body}")]
    Status { status: u16, body: String },
    #[error(transparent)]
    Notify(#[from] NotifyError),
}

#[derive(Debug, Clone)]
pub struct TransferSettings {
    pub health_timeout: Duration,
    pub request_timeout: Duration,
    /// Read buffer used while streaming a chunk file.
    pub chunk_buffer: usize,
}

impl Default for TransferSettings {
    fn default() -> Self {
        Self {
            health_timeout: Duration::from_secs(5),
            request_timeout: Duration::from_secs(300),
            chunk_buffer: 64 * 1024,
        }
    }
}

pub struct TransferWorkflow {
    http: reqwest::Client,
    notifier: Arc<dyn UserNotifier>,
    settings: TransferSettings,
}

impl TransferWorkflow {
    pub fn new(
        http: reqwest::Client,
        notifier: Arc<dyn UserNotifier>,
        settings: TransferSettings,
    ) -> Self {
        Self {
            http,
            notifier,
            settings,
        }
    }

    /// Runs readiness, chunk upload, metadata update and user notification in
    /// order. Each step gates the next and nothing is rolled back.
    pub async fn handle_transfer_workflow(&self, request: &TransferRequest) -> WorkflowOutcome {
        if let Err(err) = self.check_destination(request).await {
            warn!(video_id = %request.video_id, error = %err, "destination not ready");
            return WorkflowOutcome::new(
                503,
                "destination not ready",
                WorkflowStep::Readiness,
                Vec::new(),
            )
            .with_error(err);
        }

        let mut uploaded = Vec::with_capacity(request.chunk_list.len());
        for chunk in &request.chunk_list {
            if let Err(err) = self.upload_chunk(request, chunk).await {
                warn!(
                    video_id = %request.video_id,
                    chunk = %chunk,
                    error = %err,
                    "chunk upload failed"
                );
                return WorkflowOutcome::new(
                    500,
                    "chunk upload failed",
                    WorkflowStep::ChunkUpload,
                    uploaded,
                )
                .with_chunk(chunk)
                .with_error(err);
            }
            uploaded.push(chunk.clone());
        }

        if let Err(err) = self.update_metadata(request).await {
            warn!(video_id = %request.video_id, error = %err, "metadata update failed");
            return WorkflowOutcome::new(
                500,
                "metadata update failed",
                WorkflowStep::MetadataUpdate,
                uploaded,
            )
            .with_error(err);
        }

        if let Err(err) = self.notify_user(request).await {
            warn!(video_id = %request.video_id, error = %err, "user notification failed");
            return WorkflowOutcome::new(
                500,
                "user notification failed",
                WorkflowStep::UserNotification,
                uploaded,
            )
            .with_error(err);
        }

        info!(
            video_id = %request.video_id,
            user_id = %request.user_id,
            chunks = uploaded.len(),
            "transfer complete"
        );
        WorkflowOutcome::new(200, "complete", WorkflowStep::Complete, uploaded)
    }

    async fn check_destination(&self, request: &TransferRequest) -> Result<(), StepError> {
        let response = self
            .http
            .get(endpoint(&request.destination.receiver_url, HEALTH_PATH))
            .timeout(self.settings.health_timeout)
            .send()
            .await?;
        ensure_success(response).await
    }

    async fn upload_chunk(&self, request: &TransferRequest, chunk: &str) -> Result<(), StepError> {
        let path = request.chunk_path(chunk);
        let file = tokio::fs::File::open(&path)
            .await
            .map_err(|source| StepError::ReadChunk {
                path: path.clone(),
                source,
            })?;
        let length = file
            .metadata()
            .await
            .map_err(|source| StepError::ReadChunk {
                path: path.clone(),
                source,
            })?
            .len();
        let stream = ReaderStream::with_capacity(file, self.settings.chunk_buffer);

        let response = self
            .http
            .post(endpoint(&request.destination.receiver_url, UPLOAD_CHUNK_PATH))
            .timeout(self.settings.request_timeout)
            .header(CONTENT_LENGTH, length)
            .header(CONTENT_TYPE, "application/octet-stream")
            .header(CHUNK_NAME_HEADER, chunk)
            .header(VIDEO_ID_HEADER, request.video_id.as_str())
            .body(reqwest::Body::wrap_stream(stream))
            .send()
            .await?;
        ensure_success(response).await?;

        info!(video_id = %request.video_id, chunk = %chunk, bytes = length, "chunk uploaded");
        Ok(())
    }

    /// Reports the chunk list to the metadata authority. Safe to call again on
    /// its own after a failed run.
    pub async fn update_metadata(&self, request: &TransferRequest) -> Result<(), StepError> {
        let update = MetadataUpdate {
            video_id: request.video_id.clone(),
            chunk_list: request.chunk_list.clone(),
            server_d_path: request.destination.stored_path.clone(),
        };
        let response = self
            .http
            .post(endpoint(&request.destination.metadata_url, METADATA_UPDATE_PATH))
            .timeout(self.settings.request_timeout)
            .json(&update)
            .send()
            .await?;
        ensure_success(response).await
    }

    async fn notify_user(&self, request: &TransferRequest) -> Result<(), StepError> {
        let body = format!(
            "Your video {} has been transferred and is ready to stream.",
            request.video_id
        );
        self.notifier
            .send_message(&request.user_contact, NOTIFICATION_SUBJECT, &body)
            .await?;
        Ok(())
    }
}

fn endpoint(base_url: &str, path: &str) -> String {
    format!("{}{}", base_url.trim_end_matches('/'), path)
}

async fn ensure_success(response: reqwest::Response) -> Result<(), StepError> {
    let status = response.status();
    if status.is_success() {
        return Ok(());
    }
    let body = response.text().await.unwrap_or_default();
    Err(StepError::Status {
        status: status.as_u16(),
        body,
    })
}

#[cfg(test)]
mod tests {
    use super::*;
    use async_trait::async_trait;
    use axum::{
        body::Bytes,
        extract::State,
        http::{HeaderMap, StatusCode},
        routing::{get, post},
        Json, Router,
    };
    use serde_json::Value;
    use std::sync::Mutex;
    use vidrelay_contract::TransferDestination;

    #[derive(Debug, Clone, PartialEq, Eq)]
    struct ReceivedChunk {
        name: String,
        video_id: String,
        content_type: String,
        content_length: String,
        bytes: Vec<u8>,
    }

    #[derive(Clone, Default)]
    struct FakeNodes {
        not_ready: bool,
        failing_chunk: Option<String>,
        metadata_fails: Arc<Mutex<bool>>,
        chunks: Arc<Mutex<Vec<ReceivedChunk>>>,
        metadata: Arc<Mutex<Vec<Value>>>,
    }

    fn header(headers: &HeaderMap, name: &str) -> String {
        headers
            .get(name)
            .and_then(|value| value.to_str().ok())
            .unwrap_or_default()
            .to_string()
    }

    async fn health(State(nodes): State<FakeNodes>) -> StatusCode {
        if nodes.not_ready {
            StatusCode::SERVICE_UNAVAILABLE
        } else {
            StatusCode::OK
        }
    }

    async fn upload(
        State(nodes): State<FakeNodes>,
        headers: HeaderMap,
        body: Bytes,
    ) -> StatusCode {
        let name = header(&headers, CHUNK_NAME_HEADER);
        nodes.chunks.lock().unwrap().push(ReceivedChunk {
            name: name.clone(),
            video_id: header(&headers, VIDEO_ID_HEADER),
            content_type: header(&headers, "content-type"),
            content_length: header(&headers, "content-length"),
            bytes: body.to_vec(),
        });
        if nodes.failing_chunk.as_deref() == Some(name.as_str()) {
            StatusCode::INTERNAL_SERVER_ERROR
        } else {
            StatusCode::CREATED
        }
    }

    async fn metadata(State(nodes): State<FakeNodes>, Json(body): Json<Value>) -> StatusCode {
        nodes.metadata.lock().unwrap().push(body);
        if *nodes.metadata_fails.lock().unwrap() {
            StatusCode::BAD_GATEWAY
        } else {
            StatusCode::OK
        }
    }

    async fn spawn_nodes(nodes: FakeNodes) -> String {
        let app = Router::new()
            .route(HEALTH_PATH, get(health))
            .route(UPLOAD_CHUNK_PATH, post(upload))
            .route(METADATA_UPDATE_PATH, post(metadata))
            .with_state(nodes);
        let listener = tokio::net::TcpListener::bind("127.0.0.1:0").await.unwrap();
        let addr = listener.local_addr().unwrap();
        tokio::spawn(async move {
            axum::serve(listener, app).await.unwrap();
        });
        format!("http://{addr}")
    }

    #[derive(Default)]
    struct RecordingNotifier {
        fail: bool,
        sent: Mutex<Vec<(String, String, String)>>,
    }

    #[async_trait]
    impl UserNotifier for RecordingNotifier {
        async fn send_message(
            &self,
            recipient: &str,
            subject: &str,
            body: &str,
        ) -> Result<(), NotifyError> {
            self.sent.lock().unwrap().push((
                recipient.to_string(),
                subject.to_string(),
                body.to_string(),
            ));
            if self.fail {
                Err(NotifyError::Rejected(503))
            } else {
                Ok(())
            }
        }
    }

    struct Fixture {
        _dir: tempfile::TempDir,
        request: TransferRequest,
    }

    fn fixture(base_url: &str, chunks: &[&str]) -> Fixture {
        let dir = tempfile::tempdir().unwrap();
        for chunk in chunks {
            std::fs::write(dir.path().join(chunk), format!("bytes of {chunk}")).unwrap();
        }
        let destination = TransferDestination::new(base_url, base_url, "/mnt/d/videos/v1").unwrap();
        let request = TransferRequest::new(
            dir.path(),
            "owner@example.com",
            "user-7",
            "v1",
            chunks.iter().map(|chunk| chunk.to_string()).collect(),
            destination,
        )
        .unwrap();
        Fixture { _dir: dir, request }
    }

    fn workflow(notifier: Arc<RecordingNotifier>) -> TransferWorkflow {
        let settings = TransferSettings {
            health_timeout: Duration::from_secs(2),
            request_timeout: Duration::from_secs(5),
            chunk_buffer: 4,
        };
        TransferWorkflow::new(reqwest::Client::new(), notifier, settings)
    }

    #[tokio::test]
    async fn all_steps_succeed() {
        let nodes = FakeNodes::default();
        let base_url = spawn_nodes(nodes.clone()).await;
        let fixture = fixture(&base_url, &["c1", "c2", "c3"]);
        let notifier = Arc::new(RecordingNotifier::default());

        let outcome = workflow(notifier.clone())
            .handle_transfer_workflow(&fixture.request)
            .await;

        assert_eq!(outcome.status, 200);
        assert_eq!(outcome.message, "complete");
        assert!(outcome.is_complete());
        assert_eq!(outcome.uploaded_chunks, vec!["c1", "c2", "c3"]);

        let chunks = nodes.chunks.lock().unwrap().clone();
        let names: Vec<_> = chunks.iter().map(|chunk| chunk.name.as_str()).collect();
        assert_eq!(names, vec!["c1", "c2", "c3"]);
        assert_eq!(
            chunks[0],
            ReceivedChunk {
                name: "c1".to_string(),
                video_id: "v1".to_string(),
                content_type: "application/octet-stream".to_string(),
                content_length: "11".to_string(),
                bytes: b"bytes of c1".to_vec(),
            }
        );

        let metadata = nodes.metadata.lock().unwrap().clone();
        assert_eq!(
            metadata,
            vec![serde_json::json!({
                "videoId": "v1",
                "chunkList": ["c1", "c2", "c3"],
                "serverDPath": "/mnt/d/videos/v1",
            })]
        );

        let sent = notifier.sent.lock().unwrap();
        assert_eq!(sent.len(), 1);
        assert_eq!(sent[0].0, "owner@example.com");
        assert_eq!(sent[0].1, NOTIFICATION_SUBJECT);
    }

    #[tokio::test]
    async fn unready_destination_has_no_side_effects() {
        let nodes = FakeNodes {
            not_ready: true,
            ..FakeNodes::default()
        };
        let base_url = spawn_nodes(nodes.clone()).await;
        let fixture = fixture(&base_url, &["c1"]);
        let notifier = Arc::new(RecordingNotifier::default());

        let outcome = workflow(notifier.clone())
            .handle_transfer_workflow(&fixture.request)
            .await;

        assert_eq!(outcome.status, 503);
        assert_eq!(outcome.message, "destination not ready");
        assert_eq!(outcome.step, WorkflowStep::Readiness);
        assert!(nodes.chunks.lock().unwrap().is_empty());
        assert!(nodes.metadata.lock().unwrap().is_empty());
        assert!(notifier.sent.lock().unwrap().is_empty());
    }

    #[tokio::test]
    async fn unreachable_destination_is_not_ready() {
        let listener = tokio::net::TcpListener::bind("127.0.0.1:0").await.unwrap();
        let addr = listener.local_addr().unwrap();
        drop(listener);
        let fixture = fixture(&format!("http://{addr}"), &["c1"]);

        let outcome = workflow(Arc::new(RecordingNotifier::default()))
            .handle_transfer_workflow(&fixture.request)
            .await;

        assert_eq!(outcome.status, 503);
        assert!(outcome.error.is_some());
    }

    #[tokio::test]
    async fn first_chunk_failure_stops_the_run() {
        let nodes = FakeNodes {
            failing_chunk: Some("c2".to_string()),
            ..FakeNodes::default()
        };
        let base_url = spawn_nodes(nodes.clone()).await;
        let fixture = fixture(&base_url, &["c1", "c2", "c3"]);
        let notifier = Arc::new(RecordingNotifier::default());

        let outcome = workflow(notifier.clone())
            .handle_transfer_workflow(&fixture.request)
            .await;

        assert_eq!(outcome.status, 500);
        assert_eq!(outcome.message, "chunk upload failed");
        assert_eq!(outcome.chunk.as_deref(), Some("c2"));
        assert_eq!(outcome.uploaded_chunks, vec!["c1"]);

        let names: Vec<_> = nodes
            .chunks
            .lock()
            .unwrap()
            .iter()
            .map(|chunk| chunk.name.clone())
            .collect();
        assert_eq!(names, vec!["c1", "c2"]);
        assert!(nodes.metadata.lock().unwrap().is_empty());
        assert!(notifier.sent.lock().unwrap().is_empty());
    }

    #[tokio::test]
    async fn missing_chunk_file_is_reported_with_its_name() {
        let nodes = FakeNodes::default();
        let base_url = spawn_nodes(nodes.clone()).await;
        let mut fixture = fixture(&base_url, &["c1"]);
        fixture.request.chunk_list.push("absent".to_string());

        let outcome = workflow(Arc::new(RecordingNotifier::default()))
            .handle_transfer_workflow(&fixture.request)
            .await;

        assert_eq!(outcome.status, 500);
        assert_eq!(outcome.step, WorkflowStep::ChunkUpload);
        assert_eq!(outcome.chunk.as_deref(), Some("absent"));
        assert_eq!(nodes.chunks.lock().unwrap().len(), 1);
    }

    #[tokio::test]
    async fn metadata_failure_can_be_rerun_alone() {
        let nodes = FakeNodes::default();
        *nodes.metadata_fails.lock().unwrap() = true;
        let base_url = spawn_nodes(nodes.clone()).await;
        let fixture = fixture(&base_url, &["c1", "c2"]);
        let notifier = Arc::new(RecordingNotifier::default());
        let workflow = workflow(notifier.clone());

        let outcome = workflow.handle_transfer_workflow(&fixture.request).await;
        assert_eq!(outcome.status, 500);
        assert_eq!(outcome.message, "metadata update failed");
        assert_eq!(outcome.step, WorkflowStep::MetadataUpdate);
        assert_eq!(outcome.uploaded_chunks, vec!["c1", "c2"]);
        assert!(notifier.sent.lock().unwrap().is_empty());

        *nodes.metadata_fails.lock().unwrap() = false;
        workflow
            .update_metadata(&fixture.request)
            .await
            .expect("second metadata update succeeds");
        assert_eq!(nodes.metadata.lock().unwrap().len(), 2);
    }

    #[tokio::test]
    async fn notification_failure_after_metadata() {
        let nodes = FakeNodes::default();
        let base_url = spawn_nodes(nodes.clone()).await;
        let fixture = fixture(&base_url, &["c1"]);
        let notifier = Arc::new(RecordingNotifier {
            fail: true,
            ..RecordingNotifier::default()
        });

        let outcome = workflow(notifier.clone())
            .handle_transfer_workflow(&fixture.request)
            .await;

        assert_eq!(outcome.status, 500);
        assert_eq!(outcome.message, "user notification failed");
        assert_eq!(outcome.step, WorkflowStep::UserNotification);
        assert_eq!(nodes.metadata.lock().unwrap().len(), 1);
        assert_eq!(notifier.sent.lock().unwrap().len(), 1);
    }

    #[test]
    fn outcome_serializes_without_empty_fields() {
        let chunks = vec!["c1".to_string()];
        let outcome = WorkflowOutcome::new(200, "complete", WorkflowStep::Complete, chunks);
        assert_eq!(
            serde_json::to_value(&outcome).unwrap(),
            serde_json::json!({
                "status": 200,
                "message": "complete",
                "step": "complete",
                "uploadedChunks": ["c1"],
            })
        );
    }
}
