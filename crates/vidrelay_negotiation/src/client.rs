use std::time::Duration;

use async_trait::async_trait;
use reqwest::StatusCode;
use serde::Serialize;
use serde_json::Value;
use thiserror::Error;
use tracing::{info, warn};
use vidrelay_contract::{
    CurrentModeReply, ModeSwitchRequest, NodeMode, UploadDescriptor, CURRENT_MODE_PATH,
    HEALTH_PATH, MODE_SWITCH_PATH,
};
use vidrelay_retry::{retry_with_backoff_when, RetryPolicy};

/// Why the last mode-switch attempt failed.
#[derive(Debug, Clone, Error, PartialEq, Serialize)]
#[serde(tag = "kind", rename_all = "snake_case")]
pub enum ModeSwitchError {
    /// The remote node answered, but not with a 2xx JSON body.
    #[error("remote rejected mode switch with status {status}")]
    Rejected { status: u16, body: Value },
    /// The request went out and no response came back.
    #[error("remote node unreachable: {message}")]
    Unreachable { message: String },
    /// The request could not be built or sent at all.
    #[error("mode switch request could not be sent: {message}")]
    Request { message: String },
}

impl ModeSwitchError {
    pub fn is_retryable(&self) -> bool {
        !matches!(self, ModeSwitchError::Request { .. })
    }
}

#[derive(Debug, Clone, PartialEq, Serialize)]
pub struct ModeSwitchOutcome {
    pub success: bool,
    pub response: Option<Value>,
    pub error: Option<ModeSwitchError>,
    pub attempts: u32,
}

#[derive(Debug, Clone, PartialEq, Serialize)]
pub struct HealthReport {
    pub accessible: bool,
    pub status: Option<u16>,
    pub body: Option<Value>,
    pub error: Option<String>,
}

#[derive(Debug, Clone, PartialEq, Serialize)]
pub struct CurrentModeReport {
    pub success: bool,
    pub mode: Option<NodeMode>,
    pub body: Option<Value>,
    pub error: Option<String>,
}

#[async_trait]
pub trait ModeNegotiator: Send + Sync {
    /// Asks the remote node to enter upload-receiving mode, retrying with
    /// backoff. Never fails: the outcome carries the classification.
    async fn request_upload_mode(&self, upload: &UploadDescriptor) -> ModeSwitchOutcome;

    async fn check_status(&self) -> HealthReport;

    async fn get_current_mode(&self) -> CurrentModeReport;
}

#[derive(Debug, Clone)]
pub struct ModeClientConfig {
    pub base_url: String,
    /// Requester identity sent as `source`.
    pub source: String,
    pub switch_timeout: Duration,
    pub health_timeout: Duration,
    pub policy: RetryPolicy,
}

#[derive(Debug, Clone)]
pub struct ModeClient {
    http: reqwest::Client,
    config: ModeClientConfig,
}

impl ModeClient {
    pub fn new(http: reqwest::Client, config: ModeClientConfig) -> Self {
        Self { http, config }
    }

    pub fn config(&self) -> &ModeClientConfig {
        &self.config
    }

    pub async fn switch_to_upload_mode(
        &self,
        upload_id: &str,
        total_chunks: u32,
        filename: &str,
        chunk_directory: &str,
    ) -> ModeSwitchOutcome {
        let upload = UploadDescriptor {
            upload_id: upload_id.to_string(),
            total_chunks,
            filename: filename.to_string(),
            chunk_directory: chunk_directory.to_string(),
        };
        self.request_upload_mode(&upload).await
    }

    fn endpoint(&self, path: &str) -> String {
        format!("{}{}", self.config.base_url.trim_end_matches('/'), path)
    }

    async fn send_switch(&self, request: &ModeSwitchRequest) -> Result<Value, ModeSwitchError> {
        let response = self
            .http
            .post(self.endpoint(MODE_SWITCH_PATH))
            .timeout(self.config.switch_timeout)
            .json(request)
            .send()
            .await
            .map_err(classify_send_error)?;

        let status = response.status();
        let text = response
            .text()
            .await
            .map_err(|error| ModeSwitchError::Unreachable {
                message: error.to_string(),
            })?;
        let body = serde_json::from_str::<Value>(&text).ok();

        match body {
            Some(body) if status.is_success() => Ok(body),
            body => Err(ModeSwitchError::Rejected {
                status: status.as_u16(),
                body: body.unwrap_or(Value::String(text)),
            }),
        }
    }

    async fn get_once(&self, path: &str) -> Result<(StatusCode, Option<Value>), reqwest::Error> {
        let response = self
            .http
            .get(self.endpoint(path))
            .timeout(self.config.health_timeout)
            .send()
            .await?;
        let status = response.status();
        let body = response.json::<Value>().await.ok();
        Ok((status, body))
    }
}

#[async_trait]
impl ModeNegotiator for ModeClient {
    async fn request_upload_mode(&self, upload: &UploadDescriptor) -> ModeSwitchOutcome {
        let request = match ModeSwitchRequest::new(upload.clone(), &self.config.source) {
            Ok(request) => request,
            Err(error) => {
                return ModeSwitchOutcome {
                    success: false,
                    response: None,
                    error: Some(ModeSwitchError::Request {
                        message: error.to_string(),
                    }),
                    attempts: 0,
                }
            }
        };

        let outcome = retry_with_backoff_when(
            &self.config.policy,
            "mode_switch",
            ModeSwitchError::is_retryable,
            |_| self.send_switch(&request),
        )
        .await;

        match outcome.result {
            Ok(response) => {
                info!(
                    upload_id = %request.upload_id,
                    attempts = outcome.attempts,
                    "remote node switched to upload mode"
                );
                ModeSwitchOutcome {
                    success: true,
                    response: Some(response),
                    error: None,
                    attempts: outcome.attempts,
                }
            }
            Err(error) => {
                warn!(
                    upload_id = %request.upload_id,
                    attempts = outcome.attempts,
                    error = %error,
                    "mode switch failed"
                );
                ModeSwitchOutcome {
                    success: false,
                    response: None,
                    error: Some(error),
                    attempts: outcome.attempts,
                }
            }
        }
    }

    async fn check_status(&self) -> HealthReport {
        match self.get_once(HEALTH_PATH).await {
            Ok((status, body)) => HealthReport {
                accessible: status.is_success(),
                status: Some(status.as_u16()),
                body,
                error: None,
            },
            Err(error) => HealthReport {
                accessible: false,
                status: None,
                body: None,
                error: Some(error.to_string()),
            },
        }
    }

    async fn get_current_mode(&self) -> CurrentModeReport {
        match self.get_once(CURRENT_MODE_PATH).await {
            Ok((status, body)) if status.is_success() => {
                let mode = body
                    .clone()
                    .and_then(|value| serde_json::from_value::<CurrentModeReply>(value).ok())
                    .map(|reply| reply.mode);
                CurrentModeReport {
                    success: mode.is_some(),
                    error: mode
                        .is_none()
                        .then(|| "response did not describe a mode".to_string()),
                    mode,
                    body,
                }
            }
            Ok((status, body)) => CurrentModeReport {
                success: false,
                mode: None,
                body,
                error: Some(format!("remote responded with status {}", status.as_u16())),
            },
            Err(error) => CurrentModeReport {
                success: false,
                mode: None,
                body: None,
                error: Some(error.to_string()),
            },
        }
    }
}

fn classify_send_error(error: reqwest::Error) -> ModeSwitchError {
    if error.is_builder() {
        ModeSwitchError::Request {
            message: error.to_string(),
        }
    } else {
        ModeSwitchError::Unreachable {
            message: error.to_string(),
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use axum::{
        extract::State,
        http::StatusCode as AxumStatus,
        response::IntoResponse,
        routing::{get, post},
        Json, Router,
    };
    use serde_json::json;
    use std::sync::atomic::{AtomicU32, Ordering};
    use std::sync::{Arc, Mutex};

    #[derive(Clone, Default)]
    struct FakeLaptop {
        calls: Arc<AtomicU32>,
        fail_first: u32,
        bodies: Arc<Mutex<Vec<Value>>>,
    }

    async fn fake_switch(
        State(laptop): State<FakeLaptop>,
        Json(body): Json<Value>,
    ) -> impl IntoResponse {
        let call = laptop.calls.fetch_add(1, Ordering::SeqCst) + 1;
        laptop.bodies.lock().unwrap().push(body);
        if call <= laptop.fail_first {
            (
                AxumStatus::SERVICE_UNAVAILABLE,
                Json(json!({"error": "busy", "call": call})),
            )
        } else {
            (AxumStatus::OK, Json(json!({"success": true, "mode": "upload"})))
        }
    }

    async fn spawn_laptop(laptop: FakeLaptop) -> String {
        let app = Router::new()
            .route(MODE_SWITCH_PATH, post(fake_switch))
            .route(HEALTH_PATH, get(|| async { Json(json!({"status": "ready"})) }))
            .route(
                CURRENT_MODE_PATH,
                get(|| async { Json(json!({"mode": "upload", "uploadId": "up-1"})) }),
            )
            .with_state(laptop);
        let listener = tokio::net::TcpListener::bind("127.0.0.1:0").await.unwrap();
        let addr = listener.local_addr().unwrap();
        tokio::spawn(async move {
            axum::serve(listener, app).await.unwrap();
        });
        format!("http://{addr}")
    }

    async fn closed_port_url() -> String {
        let listener = tokio::net::TcpListener::bind("127.0.0.1:0").await.unwrap();
        let addr = listener.local_addr().unwrap();
        drop(listener);
        format!("http://{addr}")
    }

    fn client(base_url: String, max_attempts: u32) -> ModeClient {
        ModeClient::new(
            reqwest::Client::new(),
            ModeClientConfig {
                base_url,
                source: "old-pc".to_string(),
                switch_timeout: Duration::from_secs(2),
                health_timeout: Duration::from_secs(2),
                policy: RetryPolicy::new(max_attempts, Duration::from_millis(5), 2.0).unwrap(),
            },
        )
    }

    fn upload() -> UploadDescriptor {
        UploadDescriptor {
            upload_id: "up-1".to_string(),
            total_chunks: 3,
            filename: "movie.mp4".to_string(),
            chunk_directory: "/staging/up-1".to_string(),
        }
    }

    #[tokio::test]
    async fn succeeds_on_third_attempt() {
        let laptop = FakeLaptop {
            fail_first: 2,
            ..Default::default()
        };
        let base = spawn_laptop(laptop.clone()).await;

        let outcome = client(base, 3).request_upload_mode(&upload()).await;

        assert!(outcome.success);
        assert_eq!(outcome.attempts, 3);
        assert_eq!(outcome.response, Some(json!({"success": true, "mode": "upload"})));
        assert_eq!(laptop.calls.load(Ordering::SeqCst), 3);

        let bodies = laptop.bodies.lock().unwrap();
        assert!(bodies.iter().all(|body| body["action"] == "switch_to_upload_mode"));
        assert!(bodies.iter().all(|body| body["uploadId"] == "up-1"));
    }

    #[tokio::test]
    async fn first_success_short_circuits() {
        let laptop = FakeLaptop::default();
        let base = spawn_laptop(laptop.clone()).await;

        let outcome = client(base, 5)
            .switch_to_upload_mode("up-7", 2, "clip.mp4", "/staging/up-7")
            .await;

        assert!(outcome.success);
        assert_eq!(outcome.attempts, 1);
        assert_eq!(laptop.calls.load(Ordering::SeqCst), 1);
    }

    #[tokio::test]
    async fn exhaustion_preserves_remote_rejection() {
        let laptop = FakeLaptop {
            fail_first: u32::MAX,
            ..Default::default()
        };
        let base = spawn_laptop(laptop.clone()).await;

        let outcome = client(base, 3).request_upload_mode(&upload()).await;

        assert!(!outcome.success);
        assert_eq!(outcome.attempts, 3);
        assert_eq!(
            outcome.error,
            Some(ModeSwitchError::Rejected {
                status: 503,
                body: json!({"error": "busy", "call": 3}),
            })
        );
    }

    #[tokio::test]
    async fn exhaustion_without_response_is_unreachable() {
        let outcome = client(closed_port_url().await, 3)
            .request_upload_mode(&upload())
            .await;

        assert!(!outcome.success);
        assert_eq!(outcome.attempts, 3);
        assert!(matches!(
            outcome.error,
            Some(ModeSwitchError::Unreachable { .. })
        ));
    }

    #[tokio::test]
    async fn malformed_base_url_is_not_retried() {
        let outcome = client("not a url".to_string(), 3)
            .request_upload_mode(&upload())
            .await;

        assert!(!outcome.success);
        assert_eq!(outcome.attempts, 1);
        assert!(matches!(outcome.error, Some(ModeSwitchError::Request { .. })));
    }

    #[tokio::test]
    async fn invalid_upload_descriptor_never_hits_the_network() {
        let mut bad = upload();
        bad.total_chunks = 0;
        let outcome = client(closed_port_url().await, 3).request_upload_mode(&bad).await;

        assert_eq!(outcome.attempts, 0);
        assert!(matches!(outcome.error, Some(ModeSwitchError::Request { .. })));
    }

    #[tokio::test]
    async fn status_and_mode_reports() {
        let base = spawn_laptop(FakeLaptop::default()).await;
        let client = client(base, 1);

        let health = client.check_status().await;
        assert!(health.accessible);
        assert_eq!(health.status, Some(200));

        let mode = client.get_current_mode().await;
        assert!(mode.success);
        assert_eq!(mode.mode, Some(NodeMode::Upload));
    }

    #[tokio::test]
    async fn status_reports_do_not_fail_when_offline() {
        let client = client(closed_port_url().await, 1);

        let health = client.check_status().await;
        assert!(!health.accessible);
        assert!(health.error.is_some());

        let mode = client.get_current_mode().await;
        assert!(!mode.success);
        assert_eq!(mode.mode, None);
    }
}
