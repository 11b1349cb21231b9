//! Core types for the mutation queue and the remote timer contract.

use chrono::{DateTime, Utc};
use serde::{Deserialize, Serialize};

use crate::events::{CompletedSession, TimerEvent};
use crate::timer::{SessionKind, TimerMode};

/// Kind of entity a queue entry mutates.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, Serialize, Deserialize)]
#[serde(rename_all = "snake_case")]
pub enum EntityType {
    /// Live timer lifecycle (`/timer/*`).
    TimerSession,
    /// Completed-session record (`/sessions`).
    SessionRecord,
}

#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, Serialize, Deserialize)]
#[serde(rename_all = "snake_case")]
pub enum EntryStatus {
    Pending,
    InFlight,
    Failed,
    Confirmed,
}

/// Payload of one local mutation, in the order it happened.
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
#[serde(tag = "op", rename_all = "snake_case")]
pub enum MutationPayload {
    Start {
        task_id: Option<String>,
        kind: SessionKind,
        mode: TimerMode,
        started_at: DateTime<Utc>,
    },
    Pause {
        pause_started_at: DateTime<Utc>,
    },
    Resume {
        pause_started_at: DateTime<Utc>,
        resumed_at: DateTime<Utc>,
    },
    Stop {
        was_completed: bool,
        ended_at: DateTime<Utc>,
    },
    Completed(CompletedSession),
}

impl MutationPayload {
    pub fn entity_type(&self) -> EntityType {
        match self {
            MutationPayload::Completed(_) => EntityType::SessionRecord,
            _ => EntityType::TimerSession,
        }
    }

    pub fn op(&self) -> &'static str {
        match self {
            MutationPayload::Start { .. } => "start",
            MutationPayload::Pause { .. } => "pause",
            MutationPayload::Resume { .. } => "resume",
            MutationPayload::Stop { .. } => "stop",
            MutationPayload::Completed(_) => "completed",
        }
    }
}

/// A mutation not yet assigned a sequence.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct Mutation {
    /// Client session id; all mutations of one session share it.
    pub entity_id: String,
    pub payload: MutationPayload,
}

impl Mutation {
    pub fn new(entity_id: impl Into<String>, payload: MutationPayload) -> Self {
        Self {
            entity_id: entity_id.into(),
            payload,
        }
    }

    /// Mutations that replicate a timer event.
    pub fn from_event(event: &TimerEvent) -> Vec<Mutation> {
        match event {
            TimerEvent::SessionStarted {
                session_id,
                kind,
                mode,
                task_ref,
                started_at,
            } => vec![Mutation::new(
                session_id.clone(),
                MutationPayload::Start {
                    task_id: task_ref.clone(),
                    kind: *kind,
                    mode: *mode,
                    started_at: *started_at,
                },
            )],
            TimerEvent::SessionPaused {
                session_id,
                pause_started_at,
            } => vec![Mutation::new(
                session_id.clone(),
                MutationPayload::Pause {
                    pause_started_at: *pause_started_at,
                },
            )],
            TimerEvent::SessionResumed {
                session_id,
                pause_started_at,
                resumed_at,
            } => vec![Mutation::new(
                session_id.clone(),
                MutationPayload::Resume {
                    pause_started_at: *pause_started_at,
                    resumed_at: *resumed_at,
                },
            )],
            TimerEvent::SessionCompleted(record) => vec![
                Mutation::new(
                    record.session_id.clone(),
                    MutationPayload::Stop {
                        was_completed: record.was_completed,
                        ended_at: record.ended_at,
                    },
                ),
                Mutation::new(
                    record.session_id.clone(),
                    MutationPayload::Completed(record.clone()),
                ),
            ],
            TimerEvent::SessionReset {
                session_id: Some(session_id),
                at,
            } => vec![Mutation::new(
                session_id.clone(),
                MutationPayload::Stop {
                    was_completed: false,
                    ended_at: *at,
                },
            )],
            TimerEvent::SessionReset {
                session_id: None, ..
            }
            | TimerEvent::ModeAdvanced { .. } => Vec::new(),
        }
    }
}

/// One durable queue entry.
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct SyncQueueEntry {
    /// Strictly increasing per client; never reused after pruning.
    pub sequence: u64,
    pub entity_id: String,
    pub entity_type: EntityType,
    pub payload: MutationPayload,
    pub created_at: DateTime<Utc>,
    pub status: EntryStatus,
    #[serde(default)]
    pub attempts: u32,
    #[serde(default)]
    pub next_attempt_at: Option<DateTime<Utc>>,
    #[serde(default)]
    pub last_error: Option<String>,
}

impl SyncQueueEntry {
    /// Pending and past its backoff.
    pub fn is_ready(&self, now: DateTime<Utc>) -> bool {
        self.status == EntryStatus::Pending && self.next_attempt_at.map_or(true, |at| at <= now)
    }

    /// Not yet acknowledged by the remote.
    pub fn is_unconfirmed(&self) -> bool {
        matches!(self.status, EntryStatus::Pending | EntryStatus::InFlight)
    }
}

/// Counts over the live queue.
#[derive(Debug, Clone, Default, PartialEq, Eq, Serialize)]
pub struct QueueStats {
    pub pending: usize,
    pub in_flight: usize,
    pub failed: usize,
    pub oldest_pending_at: Option<DateTime<Utc>>,
    /// Earliest backoff deadline among pending entries.
    pub next_attempt_at: Option<DateTime<Utc>>,
}

/// Remote view of a live session.
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "camelCase")]
pub struct SessionDescriptor {
    /// Server-assigned id.
    pub id: String,
    #[serde(default)]
    pub client_session_id: Option<String>,
    #[serde(default)]
    pub task_id: Option<String>,
    pub kind: SessionKind,
    #[serde(default)]
    pub mode: Option<TimerMode>,
    pub started_at: DateTime<Utc>,
    /// Start of the open pause, if paused.
    #[serde(default)]
    pub pause_started_at: Option<DateTime<Utc>>,
    #[serde(default)]
    pub elapsed_seconds: i64,
    #[serde(default)]
    pub client_sequence: Option<u64>,
}

/// Acknowledgment of a write.
#[derive(Debug, Clone, Default, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "camelCase")]
pub struct RemoteAck {
    #[serde(default)]
    pub id: Option<String>,
    #[serde(default)]
    pub client_sequence: Option<u64>,
    #[serde(default)]
    pub elapsed_seconds: Option<i64>,
}

impl From<&SessionDescriptor> for RemoteAck {
    fn from(descriptor: &SessionDescriptor) -> Self {
        Self {
            id: (!descriptor.id.is_empty()).then(|| descriptor.id.clone()),
            client_sequence: descriptor.client_sequence,
            elapsed_seconds: Some(descriptor.elapsed_seconds),
        }
    }
}
