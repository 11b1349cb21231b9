use serde::{Deserialize, Serialize};

use super::session::TimerMode;

/// Pomodoro cycling policy.
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct TimerPolicy {
    pub work_secs: u64,
    pub short_break_secs: u64,
    pub long_break_secs: u64,
    pub pomodoros_until_long_break: u32,
    pub auto_start_breaks: bool,
    pub auto_start_work: bool,
}

impl TimerPolicy {
    /// Planned length of a countdown in `mode`; `None` for continuous.
    pub fn duration_for(&self, mode: TimerMode) -> Option<u64> {
        match mode {
            TimerMode::Work => Some(self.work_secs),
            TimerMode::ShortBreak => Some(self.short_break_secs),
            TimerMode::LongBreak => Some(self.long_break_secs),
            TimerMode::Continuous => None,
        }
    }

    /// Mode that follows `current`.
    ///
    /// `completed_work_sessions` is the count *before* the session that is
    /// ending; the long break lands on the post-increment multiple.
    pub fn next_mode(&self, current: TimerMode, completed_work_sessions: u32) -> TimerMode {
        match current {
            TimerMode::Work => {
                let cycle = self.pomodoros_until_long_break.max(1);
                if (completed_work_sessions + 1) % cycle == 0 {
                    TimerMode::LongBreak
                } else {
                    TimerMode::ShortBreak
                }
            }
            TimerMode::ShortBreak | TimerMode::LongBreak => TimerMode::Work,
            TimerMode::Continuous => TimerMode::Continuous,
        }
    }

    pub fn auto_starts(&self, mode: TimerMode) -> bool {
        match mode {
            TimerMode::Work => self.auto_start_work,
            TimerMode::ShortBreak | TimerMode::LongBreak => self.auto_start_breaks,
            TimerMode::Continuous => false,
        }
    }
}

impl Default for TimerPolicy {
    fn default() -> Self {
        Self {
            work_secs: 25 * 60,
            short_break_secs: 5 * 60,
            long_break_secs: 15 * 60,
            pomodoros_until_long_break: 4,
            auto_start_breaks: false,
            auto_start_work: false,
        }
    }
}
