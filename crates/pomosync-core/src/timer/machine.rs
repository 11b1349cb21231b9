//! Timer state machine.
//!
//! The machine has no internal thread. The caller invokes `tick()`
//! periodically and issues commands between ticks; both read time through
//! the injected [`Clock`].
//!
//! ## State Transitions
//!
//! ```text
//! Idle | Stopped -> Running <-> Paused -> Stopped
//! Running | Paused -> Idle              (skip, no auto-start)
//! Running | Paused -> Running           (skip with auto-start, split)
//! ```
//!
//! Every command returns the events it produced or a [`TimerError`]; a
//! rejected command leaves the machine untouched.

use std::fmt;
use std::sync::Arc;

use chrono::{DateTime, Utc};
use serde::{Deserialize, Serialize};

use super::policy::TimerPolicy;
use super::session::{SessionKind, TimerMode, TimerSession};
use crate::clock::Clock;
use crate::error::TimerError;
use crate::events::TimerEvent;

/// Upper bound on back-to-back completions of overdue auto-started sessions.
const MAX_OVERDUE_ADVANCES: usize = 64;

#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "lowercase")]
pub enum TimerState {
    Idle,
    Running,
    Paused,
    Stopped,
}

impl TimerState {
    pub fn is_active(self) -> bool {
        matches!(self, TimerState::Running | TimerState::Paused)
    }

    pub fn as_str(self) -> &'static str {
        match self {
            TimerState::Idle => "idle",
            TimerState::Running => "running",
            TimerState::Paused => "paused",
            TimerState::Stopped => "stopped",
        }
    }
}

impl fmt::Display for TimerState {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.write_str(self.as_str())
    }
}

/// The persisted form of the machine.
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct TimerSnapshot {
    pub state: TimerState,
    #[serde(default)]
    pub session: Option<TimerSession>,
    #[serde(default)]
    pub completed_work_sessions: u32,
    #[serde(default = "default_next_mode")]
    pub next_mode: TimerMode,
    #[serde(default)]
    pub task_ref: Option<String>,
    /// Clock reading when the snapshot was taken. Used for skew detection
    /// only, never as a source of elapsed time.
    pub checkpoint_at: DateTime<Utc>,
}

fn default_next_mode() -> TimerMode {
    TimerMode::Work
}

/// Read-only projection for observers.
#[derive(Debug, Clone, PartialEq, Eq, Serialize)]
pub struct TimerView {
    pub state: TimerState,
    pub session_id: Option<String>,
    pub kind: Option<SessionKind>,
    pub mode: Option<TimerMode>,
    pub task_ref: Option<String>,
    pub elapsed_secs: u64,
    pub remaining_secs: Option<u64>,
    pub paused_secs: u64,
    pub pause_count: usize,
    pub completed_work_sessions: u32,
    pub next_mode: TimerMode,
    pub at: DateTime<Utc>,
}

#[derive(Debug, Clone)]
pub struct TimerStateMachine {
    policy: TimerPolicy,
    clock: Arc<dyn Clock>,
    state: TimerState,
    /// Active session, or the last finished one.
    session: Option<TimerSession>,
    completed_work_sessions: u32,
    /// Mode the next pomodoro `start()` uses.
    next_mode: TimerMode,
    /// Task carried into auto-started sessions.
    task_ref: Option<String>,
    /// Last value observed by `tick()`; display only.
    observed_elapsed_secs: u64,
}

impl TimerStateMachine {
    pub fn new(policy: TimerPolicy, clock: Arc<dyn Clock>) -> Self {
        Self {
            policy,
            clock,
            state: TimerState::Idle,
            session: None,
            completed_work_sessions: 0,
            next_mode: TimerMode::Work,
            task_ref: None,
            observed_elapsed_secs: 0,
        }
    }

    /// Rebuild from a snapshot. The state is re-derived from the session so
    /// a snapshot can never claim a state its session contradicts.
    pub fn from_snapshot(snapshot: TimerSnapshot, policy: TimerPolicy, clock: Arc<dyn Clock>) -> Self {
        let state = match &snapshot.session {
            Some(session) if !session.is_finished() => {
                if session.is_paused() {
                    TimerState::Paused
                } else {
                    TimerState::Running
                }
            }
            Some(_) if snapshot.state == TimerState::Idle => TimerState::Idle,
            Some(_) => TimerState::Stopped,
            None => TimerState::Idle,
        };
        let now = clock.now();
        let observed_elapsed_secs = snapshot
            .session
            .as_ref()
            .map(|s| s.elapsed_secs(now))
            .unwrap_or(0);
        Self {
            policy,
            clock,
            state,
            session: snapshot.session,
            completed_work_sessions: snapshot.completed_work_sessions,
            next_mode: snapshot.next_mode,
            task_ref: snapshot.task_ref,
            observed_elapsed_secs,
        }
    }

    // ── Queries ──────────────────────────────────────────────────────

    pub fn state(&self) -> TimerState {
        self.state
    }

    pub fn session(&self) -> Option<&TimerSession> {
        self.session.as_ref()
    }

    /// The session in RUNNING or PAUSED, if any.
    pub fn active_session(&self) -> Option<&TimerSession> {
        if self.state.is_active() {
            self.session.as_ref()
        } else {
            None
        }
    }

    pub fn policy(&self) -> &TimerPolicy {
        &self.policy
    }

    pub fn clock(&self) -> &Arc<dyn Clock> {
        &self.clock
    }

    pub fn completed_work_sessions(&self) -> u32 {
        self.completed_work_sessions
    }

    pub fn next_mode(&self) -> TimerMode {
        self.next_mode
    }

    pub fn observed_elapsed_secs(&self) -> u64 {
        self.observed_elapsed_secs
    }

    /// Policy changes apply from the next session on.
    pub fn set_policy(&mut self, policy: TimerPolicy) {
        self.policy = policy;
    }

    pub fn snapshot(&self) -> TimerSnapshot {
        TimerSnapshot {
            state: self.state,
            session: self.session.clone(),
            completed_work_sessions: self.completed_work_sessions,
            next_mode: self.next_mode,
            task_ref: self.task_ref.clone(),
            checkpoint_at: self.clock.now(),
        }
    }

    pub fn view(&self) -> TimerView {
        let now = self.clock.now();
        let session = self.active_session();
        TimerView {
            state: self.state,
            session_id: session.map(|s| s.id.clone()),
            kind: session.map(|s| s.kind),
            mode: session.map(|s| s.mode),
            task_ref: session.and_then(|s| s.task_ref.clone()),
            elapsed_secs: session.map(|s| s.elapsed_secs(now)).unwrap_or(0),
            remaining_secs: session
                .and_then(|s| s.remaining_secs(now))
                .map(|r| r.max(0) as u64),
            paused_secs: session
                .map(|s| s.total_pause_secs(now).max(0) as u64)
                .unwrap_or(0),
            pause_count: session.map(|s| s.pause_count()).unwrap_or(0),
            completed_work_sessions: self.completed_work_sessions,
            next_mode: self.next_mode,
            at: now,
        }
    }

    // ── Commands ─────────────────────────────────────────────────────

    pub fn start(
        &mut self,
        kind: SessionKind,
        task_ref: Option<String>,
    ) -> Result<Vec<TimerEvent>, TimerError> {
        if let Some(active) = self.active_session() {
            return Err(TimerError::SessionConflict {
                active_session_id: active.id.clone(),
            });
        }
        let at = self.clock.now();
        let mode = if kind.is_countdown() {
            match self.next_mode {
                TimerMode::Continuous => TimerMode::Work,
                mode => mode,
            }
        } else {
            TimerMode::Continuous
        };
        let planned = if kind.is_countdown() {
            self.policy.duration_for(mode)
        } else {
            None
        };
        self.task_ref = task_ref.clone();
        Ok(vec![self.begin_at(kind, mode, task_ref, planned, at)])
    }

    pub fn pause(&mut self) -> Result<Vec<TimerEvent>, TimerError> {
        let at = self.clock.now();
        let session = self.require("pause", &[TimerState::Running])?;
        session.open_pause_at(at);
        let session_id = session.id.clone();
        self.state = TimerState::Paused;
        Ok(vec![TimerEvent::SessionPaused {
            session_id,
            pause_started_at: at,
        }])
    }

    pub fn resume(&mut self) -> Result<Vec<TimerEvent>, TimerError> {
        let at = self.clock.now();
        let state = self.state;
        let session = self.require("resume", &[TimerState::Paused])?;
        let pause_started_at = session
            .close_pause_at(at)
            .ok_or(TimerError::InvalidTransition {
                command: "resume",
                state,
            })?;
        let session_id = session.id.clone();
        self.state = TimerState::Running;
        Ok(vec![TimerEvent::SessionResumed {
            session_id,
            pause_started_at,
            resumed_at: at,
        }])
    }

    /// Complete the current pomodoro and move to the next mode.
    pub fn skip_to_next(&mut self) -> Result<Vec<TimerEvent>, TimerError> {
        let at = self.clock.now();
        let session = self.require("skip", &[TimerState::Running, TimerState::Paused])?;
        let kind = session.kind;
        if !kind.is_countdown() {
            return Err(TimerError::UnsupportedKind {
                command: "skip",
                kind,
            });
        }
        Ok(self.advance_at(at))
    }

    pub fn stop(&mut self, was_completed: bool) -> Result<Vec<TimerEvent>, TimerError> {
        let at = self.clock.now();
        let session = self.require("stop", &[TimerState::Running, TimerState::Paused])?;
        session.finish_at(at, was_completed);
        let kind = session.kind;
        let mode = session.mode;
        let record = session.to_completed();
        self.observed_elapsed_secs = record.as_ref().map(|r| r.duration).unwrap_or(0);

        if was_completed && kind.is_countdown() {
            self.next_mode = self.policy.next_mode(mode, self.completed_work_sessions);
            if mode == TimerMode::Work {
                self.completed_work_sessions += 1;
            }
        }
        self.state = TimerState::Stopped;
        Ok(record.map(TimerEvent::SessionCompleted).into_iter().collect())
    }

    /// Close the current session as completed and continue in a fresh one
    /// of the same kind, mode and task. A countdown keeps what was left; one
    /// that has already run out completes as [`tick`](Self::tick) would.
    pub fn split(&mut self) -> Result<Vec<TimerEvent>, TimerError> {
        let at = self.clock.now();
        let session = self.require("split", &[TimerState::Running, TimerState::Paused])?;
        let kind = session.kind;
        let mode = session.mode;
        let task_ref = session.task_ref.clone();
        let carried = session.remaining_secs(at);
        if carried.is_some_and(|remaining| remaining <= 0) {
            return Ok(self.complete_overdue(at));
        }
        let carried = carried.map(|remaining| remaining as u64);
        session.finish_at(at, true);

        let mut events: Vec<TimerEvent> = session
            .to_completed()
            .map(TimerEvent::SessionCompleted)
            .into_iter()
            .collect();
        events.push(self.begin_at(kind, mode, task_ref, carried, at));
        Ok(events)
    }

    /// Abandon the active session without a completed record and restart
    /// the pomodoro cycle.
    pub fn reset(&mut self) -> Vec<TimerEvent> {
        let at = self.clock.now();
        let session_id = self.active_session().map(|s| s.id.clone());
        self.session = None;
        self.state = TimerState::Idle;
        self.completed_work_sessions = 0;
        self.next_mode = TimerMode::Work;
        self.task_ref = None;
        self.observed_elapsed_secs = 0;
        vec![TimerEvent::SessionReset { session_id, at }]
    }

    /// Call periodically. Refreshes the observed elapsed value and completes
    /// a countdown that has run out.
    pub fn tick(&mut self) -> Vec<TimerEvent> {
        if self.state != TimerState::Running {
            return Vec::new();
        }
        let now = self.clock.now();
        self.complete_overdue(now)
    }

    /// Adopt a session that the remote knows about and this client does not.
    pub fn adopt(&mut self, session: TimerSession) -> Result<(), TimerError> {
        if let Some(active) = self.active_session() {
            return Err(TimerError::SessionConflict {
                active_session_id: active.id.clone(),
            });
        }
        self.state = if session.is_paused() {
            TimerState::Paused
        } else {
            TimerState::Running
        };
        self.task_ref = session.task_ref.clone();
        self.observed_elapsed_secs = session.elapsed_secs(self.clock.now());
        self.session = Some(session);
        Ok(())
    }

    // ── Internal ─────────────────────────────────────────────────────

    /// Complete every countdown whose remaining time is ≤ 0 at `now`, each
    /// at the instant it actually ran out. Auto-started follow-ons that are
    /// also overdue complete in turn.
    pub(crate) fn complete_overdue(&mut self, now: DateTime<Utc>) -> Vec<TimerEvent> {
        let mut events = Vec::new();
        for _ in 0..MAX_OVERDUE_ADVANCES {
            let Some(session) = self.active_session() else {
                break;
            };
            if !session.kind.is_countdown() {
                break;
            }
            let (Some(planned), Some(remaining)) =
                (session.planned_secs, session.remaining_secs(now))
            else {
                break;
            };
            if remaining > 0 {
                break;
            }
            let ended_at = session
                .instant_at_elapsed(planned)
                .unwrap_or(now)
                .min(now);
            events.extend(self.advance_at(ended_at));
        }
        if let Some(session) = self.active_session() {
            self.observed_elapsed_secs = session.elapsed_secs(now);
        }
        events
    }

    /// Finish the unfinished session as interrupted at `at`.
    pub(crate) fn force_complete_at(&mut self, at: DateTime<Utc>) -> Vec<TimerEvent> {
        let Some(session) = self.session.as_mut().filter(|s| !s.is_finished()) else {
            return Vec::new();
        };
        session.finish_at(at, false);
        let record = session.to_completed();
        self.state = TimerState::Stopped;
        record.map(TimerEvent::SessionCompleted).into_iter().collect()
    }

    fn require(
        &mut self,
        command: &'static str,
        allowed: &[TimerState],
    ) -> Result<&mut TimerSession, TimerError> {
        let state = self.state;
        match self.session.as_mut() {
            Some(session) if allowed.contains(&state) => Ok(session),
            _ => Err(TimerError::InvalidTransition { command, state }),
        }
    }

    fn begin_at(
        &mut self,
        kind: SessionKind,
        mode: TimerMode,
        task_ref: Option<String>,
        planned_secs: Option<u64>,
        at: DateTime<Utc>,
    ) -> TimerEvent {
        let session = TimerSession::new(kind, mode, task_ref.clone(), at, planned_secs);
        let event = TimerEvent::SessionStarted {
            session_id: session.id.clone(),
            kind,
            mode,
            task_ref,
            started_at: at,
        };
        self.session = Some(session);
        self.state = TimerState::Running;
        self.observed_elapsed_secs = 0;
        event
    }

    /// Complete the active pomodoro at `at` and move the cycle on.
    fn advance_at(&mut self, at: DateTime<Utc>) -> Vec<TimerEvent> {
        let mut events = Vec::new();
        let Some(session) = self.session.as_mut() else {
            return events;
        };
        let from = session.mode;
        session.finish_at(at, true);
        let ended_at = session.completed_at.unwrap_or(at);
        if let Some(record) = session.to_completed() {
            self.observed_elapsed_secs = record.duration;
            events.push(TimerEvent::SessionCompleted(record));
        }

        let to = self.policy.next_mode(from, self.completed_work_sessions);
        if from == TimerMode::Work {
            self.completed_work_sessions += 1;
        }
        self.next_mode = to;
        self.state = TimerState::Idle;

        let auto_started = self.policy.auto_starts(to);
        events.push(TimerEvent::ModeAdvanced {
            from,
            to,
            auto_started,
            at: ended_at,
        });
        if auto_started {
            let planned = self.policy.duration_for(to);
            let task_ref = self.task_ref.clone();
            events.push(self.begin_at(SessionKind::Pomodoro, to, task_ref, planned, ended_at));
        }
        events
    }
}
