//! HTTP implementation of [`RemoteTimerService`].

use std::time::Duration;

use async_trait::async_trait;
use reqwest::{Client, StatusCode};
use serde::de::DeserializeOwned;
use serde::Serialize;
use tracing::{debug, warn};
use url::Url;

use super::remote::{
    PauseRequest, RemoteTimerService, ResumeRequest, SessionRecordRequest, StartRequest,
    StopRequest,
};
use super::types::{RemoteAck, SessionDescriptor};
use crate::error::{ConfigError, SyncFailure};

#[derive(Debug, Clone)]
pub struct HttpRemote {
    http: Client,
    base: Url,
}

impl HttpRemote {
    /// `base_url` is the API root; endpoint paths are joined under it.
    pub fn new(base_url: &str, timeout: Duration) -> Result<Self, ConfigError> {
        let invalid = |message: String| ConfigError::InvalidValue {
            key: "sync.base_url".into(),
            message,
        };
        let base = normalize_base(base_url).map_err(|e| invalid(e.to_string()))?;
        let http = Client::builder()
            .timeout(timeout)
            .build()
            .map_err(|e| invalid(e.to_string()))?;
        Ok(Self { http, base })
    }

    pub fn base_url(&self) -> &Url {
        &self.base
    }

    fn endpoint(&self, path: &str) -> Result<Url, SyncFailure> {
        self.base
            .join(path)
            .map_err(|e| SyncFailure::NonRecoverable {
                status: 0,
                message: format!("invalid endpoint {path}: {e}"),
            })
    }

    async fn post<B: Serialize + Sync, R: DeserializeOwned>(
        &self,
        path: &str,
        body: &B,
    ) -> Result<Option<R>, SyncFailure> {
        let url = self.endpoint(path)?;
        debug!(%url, "POST");
        let response = self
            .http
            .post(url)
            .json(body)
            .send()
            .await
            .map_err(transport_failure)?;
        read_body(response).await
    }

    /// Writes whose acknowledgment body is optional.
    async fn post_ack<B: Serialize + Sync>(&self, path: &str, body: &B) -> Result<RemoteAck, SyncFailure> {
        match self.post::<B, RemoteAck>(path, body).await {
            Ok(ack) => Ok(ack.unwrap_or_default()),
            Err(SyncFailure::NonRecoverable { status, message }) if (200..300).contains(&status) => {
                warn!(path, %message, "Unreadable acknowledgment body; treating as acknowledged");
                Ok(RemoteAck::default())
            }
            Err(err) => Err(err),
        }
    }
}

#[async_trait]
impl RemoteTimerService for HttpRemote {
    async fn start(&self, request: &StartRequest) -> Result<SessionDescriptor, SyncFailure> {
        match self.post::<_, SessionDescriptor>("timer/start", request).await {
            Ok(Some(descriptor)) => Ok(descriptor),
            Ok(None) => Ok(descriptor_without_id(request)),
            Err(SyncFailure::NonRecoverable { status, message }) if (200..300).contains(&status) => {
                warn!(%message, "Unreadable start acknowledgment; treating as acknowledged");
                Ok(descriptor_without_id(request))
            }
            Err(err) => Err(err),
        }
    }

    async fn pause(&self, request: &PauseRequest) -> Result<RemoteAck, SyncFailure> {
        self.post_ack("timer/pause", request).await
    }

    async fn resume(&self, request: &ResumeRequest) -> Result<RemoteAck, SyncFailure> {
        self.post_ack("timer/resume", request).await
    }

    async fn stop(&self, request: &StopRequest) -> Result<RemoteAck, SyncFailure> {
        self.post_ack("timer/stop", request).await
    }

    async fn record_session(&self, request: &SessionRecordRequest) -> Result<RemoteAck, SyncFailure> {
        self.post_ack("sessions", request).await
    }

    async fn active(&self) -> Result<Option<SessionDescriptor>, SyncFailure> {
        let url = self.endpoint("timer/active")?;
        let response = self
            .http
            .get(url)
            .send()
            .await
            .map_err(transport_failure)?;
        if response.status() == StatusCode::NOT_FOUND {
            return Ok(None);
        }
        read_body(response).await
    }
}

/// A start the server accepted without describing the session back.
fn descriptor_without_id(request: &StartRequest) -> SessionDescriptor {
    SessionDescriptor {
        id: String::new(),
        client_session_id: Some(request.client_session_id.clone()),
        task_id: request.task_id.clone(),
        kind: request.kind,
        mode: Some(request.mode),
        started_at: request.started_at,
        pause_started_at: None,
        elapsed_seconds: 0,
        client_sequence: None,
    }
}

/// Decode a response. A success with no body (or `null`) yields `None`.
async fn read_body<R: DeserializeOwned>(response: reqwest::Response) -> Result<Option<R>, SyncFailure> {
    let status = response.status();
    let text = response.text().await.map_err(transport_failure)?;
    if !status.is_success() {
        return Err(classify_status(status, &text));
    }
    let trimmed = text.trim();
    if status == StatusCode::NO_CONTENT || trimmed.is_empty() || trimmed == "null" {
        return Ok(None);
    }
    serde_json::from_str(trimmed)
        .map(Some)
        .map_err(|e| SyncFailure::NonRecoverable {
            status: status.as_u16(),
            message: format!("invalid response body: {e}"),
        })
}

/// 5xx, 408 and 429 are retried; any other non-success is a rejection.
pub fn classify_status(status: StatusCode, body: &str) -> SyncFailure {
    let message = if body.trim().is_empty() {
        status.canonical_reason().unwrap_or("no reason").to_string()
    } else {
        body.trim().to_string()
    };
    if status.is_server_error()
        || status == StatusCode::REQUEST_TIMEOUT
        || status == StatusCode::TOO_MANY_REQUESTS
    {
        SyncFailure::Recoverable(format!("HTTP {}: {message}", status.as_u16()))
    } else {
        SyncFailure::NonRecoverable {
            status: status.as_u16(),
            message,
        }
    }
}

fn transport_failure(err: reqwest::Error) -> SyncFailure {
    if err.is_builder() {
        SyncFailure::NonRecoverable {
            status: 0,
            message: err.to_string(),
        }
    } else {
        SyncFailure::Recoverable(err.to_string())
    }
}

fn normalize_base(base_url: &str) -> Result<Url, url::ParseError> {
    let trimmed = base_url.trim();
    if trimmed.ends_with('/') {
        Url::parse(trimmed)
    } else {
        Url::parse(&format!("{trimmed}/"))
    }
}
