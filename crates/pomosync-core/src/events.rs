use chrono::{DateTime, Utc};
use serde::{Deserialize, Serialize};

use crate::timer::{SessionKind, TimerMode};

/// Every timer transition produces one or more events.
/// The timer service persists them, queues the matching mutations and
/// broadcasts them to observers.
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
#[serde(tag = "type", rename_all = "snake_case")]
pub enum TimerEvent {
    SessionStarted {
        session_id: String,
        kind: SessionKind,
        mode: TimerMode,
        task_ref: Option<String>,
        started_at: DateTime<Utc>,
    },
    SessionPaused {
        session_id: String,
        pause_started_at: DateTime<Utc>,
    },
    SessionResumed {
        session_id: String,
        pause_started_at: DateTime<Utc>,
        resumed_at: DateTime<Utc>,
    },
    /// Emitted on every terminal transition (`stop`, `skip_to_next`, `split`,
    /// tick-driven and recovery-driven completion).
    SessionCompleted(CompletedSession),
    /// Pomodoro cycle moved on to the next mode.
    ModeAdvanced {
        from: TimerMode,
        to: TimerMode,
        auto_started: bool,
        at: DateTime<Utc>,
    },
    /// Active session abandoned without a completed record.
    SessionReset {
        session_id: Option<String>,
        at: DateTime<Utc>,
    },
}

impl TimerEvent {
    /// Id of the session this event belongs to, if any.
    pub fn session_id(&self) -> Option<&str> {
        match self {
            TimerEvent::SessionStarted { session_id, .. }
            | TimerEvent::SessionPaused { session_id, .. }
            | TimerEvent::SessionResumed { session_id, .. } => Some(session_id),
            TimerEvent::SessionCompleted(record) => Some(&record.session_id),
            TimerEvent::SessionReset { session_id, .. } => session_id.as_deref(),
            TimerEvent::ModeAdvanced { .. } => None,
        }
    }
}

/// Completed-session record consumed by the analytics collaborator.
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct CompletedSession {
    pub session_id: String,
    pub kind: SessionKind,
    pub mode: TimerMode,
    pub task_ref: Option<String>,
    pub started_at: DateTime<Utc>,
    pub ended_at: DateTime<Utc>,
    /// Seconds, pause time excluded.
    pub duration: u64,
    pub was_completed: bool,
    pub was_interrupted: bool,
    pub pause_count: usize,
    /// Seconds.
    pub total_pause_time: u64,
}
