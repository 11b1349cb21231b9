//! Remote timer service port.
//!
//! Every write carries `clientSessionId` and `clientSequence` so the remote
//! can dedupe replays of entries whose acknowledgment was lost.

use async_trait::async_trait;
use chrono::{DateTime, Utc};
use serde::Serialize;

use super::types::{MutationPayload, RemoteAck, SessionDescriptor, SyncQueueEntry};
use crate::error::SyncFailure;
use crate::timer::{SessionKind, TimerMode};

#[derive(Debug, Clone, PartialEq, Eq, Serialize)]
#[serde(rename_all = "camelCase")]
pub struct StartRequest {
    #[serde(skip_serializing_if = "Option::is_none")]
    pub task_id: Option<String>,
    pub kind: SessionKind,
    pub mode: TimerMode,
    pub started_at: DateTime<Utc>,
    pub client_session_id: String,
    pub client_sequence: u64,
}

#[derive(Debug, Clone, PartialEq, Eq, Serialize)]
#[serde(rename_all = "camelCase")]
pub struct PauseRequest {
    pub pause_started_at: DateTime<Utc>,
    pub client_session_id: String,
    pub client_sequence: u64,
}

#[derive(Debug, Clone, PartialEq, Eq, Serialize)]
#[serde(rename_all = "camelCase")]
pub struct ResumeRequest {
    pub pause_started_at: DateTime<Utc>,
    pub resumed_at: DateTime<Utc>,
    pub client_session_id: String,
    pub client_sequence: u64,
}

#[derive(Debug, Clone, PartialEq, Eq, Serialize)]
#[serde(rename_all = "camelCase")]
pub struct StopRequest {
    pub was_completed: bool,
    pub ended_at: DateTime<Utc>,
    pub client_session_id: String,
    pub client_sequence: u64,
}

/// Completed-session record.
#[derive(Debug, Clone, PartialEq, Eq, Serialize)]
#[serde(rename_all = "camelCase")]
pub struct SessionRecordRequest {
    pub client_session_id: String,
    pub client_sequence: u64,
    #[serde(skip_serializing_if = "Option::is_none")]
    pub task_id: Option<String>,
    pub kind: SessionKind,
    pub mode: TimerMode,
    pub started_at: DateTime<Utc>,
    pub ended_at: DateTime<Utc>,
    pub elapsed_seconds: u64,
    pub was_completed: bool,
    pub was_interrupted: bool,
    pub pause_count: usize,
    pub total_pause_seconds: u64,
}

#[async_trait]
pub trait RemoteTimerService: Send + Sync {
    /// `POST /timer/start`
    async fn start(&self, request: &StartRequest) -> Result<SessionDescriptor, SyncFailure>;

    /// `POST /timer/pause`
    async fn pause(&self, request: &PauseRequest) -> Result<RemoteAck, SyncFailure>;

    /// `POST /timer/resume`
    async fn resume(&self, request: &ResumeRequest) -> Result<RemoteAck, SyncFailure>;

    /// `POST /timer/stop`
    async fn stop(&self, request: &StopRequest) -> Result<RemoteAck, SyncFailure>;

    /// `POST /sessions`
    async fn record_session(&self, request: &SessionRecordRequest) -> Result<RemoteAck, SyncFailure>;

    /// `GET /timer/active`; `None` when nothing is running remotely.
    async fn active(&self) -> Result<Option<SessionDescriptor>, SyncFailure>;
}

/// Send one queue entry to the remote.
pub async fn apply_entry(
    remote: &dyn RemoteTimerService,
    entry: &SyncQueueEntry,
) -> Result<RemoteAck, SyncFailure> {
    let client_session_id = entry.entity_id.clone();
    let client_sequence = entry.sequence;
    match &entry.payload {
        MutationPayload::Start {
            task_id,
            kind,
            mode,
            started_at,
        } => {
            let request = StartRequest {
                task_id: task_id.clone(),
                kind: *kind,
                mode: *mode,
                started_at: *started_at,
                client_session_id,
                client_sequence,
            };
            remote
                .start(&request)
                .await
                .map(|descriptor| RemoteAck::from(&descriptor))
        }
        MutationPayload::Pause { pause_started_at } => {
            remote
                .pause(&PauseRequest {
                    pause_started_at: *pause_started_at,
                    client_session_id,
                    client_sequence,
                })
                .await
        }
        MutationPayload::Resume {
            pause_started_at,
            resumed_at,
        } => {
            remote
                .resume(&ResumeRequest {
                    pause_started_at: *pause_started_at,
                    resumed_at: *resumed_at,
                    client_session_id,
                    client_sequence,
                })
                .await
        }
        MutationPayload::Stop {
            was_completed,
            ended_at,
        } => {
            remote
                .stop(&StopRequest {
                    was_completed: *was_completed,
                    ended_at: *ended_at,
                    client_session_id,
                    client_sequence,
                })
                .await
        }
        MutationPayload::Completed(record) => {
            remote
                .record_session(&SessionRecordRequest {
                    client_session_id,
                    client_sequence,
                    task_id: record.task_ref.clone(),
                    kind: record.kind,
                    mode: record.mode,
                    started_at: record.started_at,
                    ended_at: record.ended_at,
                    elapsed_seconds: record.duration,
                    was_completed: record.was_completed,
                    was_interrupted: record.was_interrupted,
                    pause_count: record.pause_count,
                    total_pause_seconds: record.total_pause_time,
                })
                .await
        }
    }
}
