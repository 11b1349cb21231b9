//! Timer session model.
//!
//! A session never stores elapsed time. Elapsed is derived on demand as
//! `now - started_at - closed pauses - open pause`.

use std::fmt;

use chrono::{DateTime, Duration, Utc};
use serde::{Deserialize, Serialize};
use uuid::Uuid;

use crate::clock::secs_between;
use crate::events::CompletedSession;

#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, Serialize, Deserialize)]
#[serde(rename_all = "snake_case")]
pub enum SessionKind {
    Pomodoro,
    Stopwatch,
    Continuous,
}

impl SessionKind {
    /// Countdown kinds have a planned duration and complete on their own.
    pub fn is_countdown(self) -> bool {
        matches!(self, SessionKind::Pomodoro)
    }

    pub fn as_str(self) -> &'static str {
        match self {
            SessionKind::Pomodoro => "pomodoro",
            SessionKind::Stopwatch => "stopwatch",
            SessionKind::Continuous => "continuous",
        }
    }
}

impl fmt::Display for SessionKind {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.write_str(self.as_str())
    }
}

#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, Serialize, Deserialize)]
#[serde(rename_all = "snake_case")]
pub enum TimerMode {
    Work,
    ShortBreak,
    LongBreak,
    Continuous,
}

impl TimerMode {
    pub fn is_break(self) -> bool {
        matches!(self, TimerMode::ShortBreak | TimerMode::LongBreak)
    }

    pub fn as_str(self) -> &'static str {
        match self {
            TimerMode::Work => "work",
            TimerMode::ShortBreak => "short_break",
            TimerMode::LongBreak => "long_break",
            TimerMode::Continuous => "continuous",
        }
    }
}

impl fmt::Display for TimerMode {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.write_str(self.as_str())
    }
}

/// One pause. `end` is `None` while the pause is still open.
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct PauseInterval {
    pub start: DateTime<Utc>,
    #[serde(default)]
    pub end: Option<DateTime<Utc>>,
}

impl PauseInterval {
    pub fn is_open(&self) -> bool {
        self.end.is_none()
    }

    /// Pause length as of `now`; an open pause runs up to `now`.
    pub fn duration_secs(&self, now: DateTime<Utc>) -> i64 {
        let end = self.end.unwrap_or(now).min(now);
        secs_between(self.start, end).max(0)
    }
}

/// One continuous tracking period.
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct TimerSession {
    pub id: String,
    pub kind: SessionKind,
    pub mode: TimerMode,
    #[serde(default)]
    pub task_ref: Option<String>,
    pub started_at: DateTime<Utc>,
    /// Countdown length; `None` for count-up kinds.
    #[serde(default)]
    pub planned_secs: Option<u64>,
    #[serde(default)]
    pub pause_intervals: Vec<PauseInterval>,
    #[serde(default)]
    pub completed_at: Option<DateTime<Utc>>,
    #[serde(default)]
    pub was_completed: bool,
    #[serde(default)]
    pub was_interrupted: bool,
}

impl TimerSession {
    pub fn new(
        kind: SessionKind,
        mode: TimerMode,
        task_ref: Option<String>,
        started_at: DateTime<Utc>,
        planned_secs: Option<u64>,
    ) -> Self {
        Self {
            id: Uuid::new_v4().to_string(),
            kind,
            mode,
            task_ref,
            started_at,
            planned_secs,
            pause_intervals: Vec::new(),
            completed_at: None,
            was_completed: false,
            was_interrupted: false,
        }
    }

    pub fn is_finished(&self) -> bool {
        self.completed_at.is_some()
    }

    pub fn is_paused(&self) -> bool {
        !self.is_finished() && self.open_pause().is_some()
    }

    pub fn open_pause(&self) -> Option<&PauseInterval> {
        self.pause_intervals.iter().find(|p| p.is_open())
    }

    pub fn pause_count(&self) -> usize {
        self.pause_intervals.len()
    }

    /// Total pause time as of `now`, open pause included.
    pub fn total_pause_secs(&self, now: DateTime<Utc>) -> i64 {
        let at = self.effective_now(now);
        self.pause_intervals
            .iter()
            .map(|p| p.duration_secs(at))
            .sum()
    }

    /// Elapsed seconds before clamping. Negative when `now` precedes
    /// `started_at`, which recovery treats as clock skew.
    pub fn raw_elapsed_secs(&self, now: DateTime<Utc>) -> i64 {
        let at = self.effective_now(now);
        secs_between(self.started_at, at) - self.total_pause_secs(at)
    }

    pub fn elapsed_secs(&self, now: DateTime<Utc>) -> u64 {
        self.raw_elapsed_secs(now).max(0) as u64
    }

    /// Signed remaining time for countdown sessions.
    pub fn remaining_secs(&self, now: DateTime<Utc>) -> Option<i64> {
        self.planned_secs
            .map(|planned| planned as i64 - self.raw_elapsed_secs(now))
    }

    /// The instant at which the session had accumulated `target` elapsed
    /// seconds, walking the pause timeline. `None` if that point falls after
    /// an open pause, i.e. it has not been reached.
    pub fn instant_at_elapsed(&self, target: u64) -> Option<DateTime<Utc>> {
        let mut cursor = self.started_at;
        let mut left = target as i64;
        for pause in &self.pause_intervals {
            let running = secs_between(cursor, pause.start).max(0);
            if left <= running {
                return Some(cursor + Duration::seconds(left));
            }
            left -= running;
            cursor = pause.end?.max(cursor);
        }
        Some(cursor + Duration::seconds(left))
    }

    pub(crate) fn open_pause_at(&mut self, at: DateTime<Utc>) {
        self.pause_intervals.push(PauseInterval {
            start: at,
            end: None,
        });
    }

    /// Close the open pause, returning its start.
    pub(crate) fn close_pause_at(&mut self, at: DateTime<Utc>) -> Option<DateTime<Utc>> {
        let pause = self.pause_intervals.iter_mut().find(|p| p.is_open())?;
        pause.end = Some(at.max(pause.start));
        Some(pause.start)
    }

    /// Terminal transition. Pauses starting at or after `at` are dropped and
    /// a pause still open at `at` is closed there.
    pub(crate) fn finish_at(&mut self, at: DateTime<Utc>, was_completed: bool) {
        let at = at.max(self.started_at);
        self.pause_intervals.retain(|p| p.start < at);
        for pause in &mut self.pause_intervals {
            match pause.end {
                Some(end) if end <= at => {}
                _ => pause.end = Some(at),
            }
        }
        self.completed_at = Some(at);
        self.was_completed = was_completed;
        self.was_interrupted = !was_completed;
    }

    /// Completed-session record; `None` until the session is finished.
    pub fn to_completed(&self) -> Option<CompletedSession> {
        let ended_at = self.completed_at?;
        Some(CompletedSession {
            session_id: self.id.clone(),
            kind: self.kind,
            mode: self.mode,
            task_ref: self.task_ref.clone(),
            started_at: self.started_at,
            ended_at,
            duration: self.elapsed_secs(ended_at),
            was_completed: self.was_completed,
            was_interrupted: self.was_interrupted,
            pause_count: self.pause_count(),
            total_pause_time: self.total_pause_secs(ended_at).max(0) as u64,
        })
    }

    fn effective_now(&self, now: DateTime<Utc>) -> DateTime<Utc> {
        self.completed_at.unwrap_or(now)
    }
}
