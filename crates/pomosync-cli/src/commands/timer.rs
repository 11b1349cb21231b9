use clap::{Subcommand, ValueEnum};
use pomosync_core::timer::TimerCommand;
use pomosync_core::SessionKind;

use crate::app::App;

#[derive(Debug, Clone, Copy, PartialEq, Eq, ValueEnum)]
pub enum KindArg {
    /// Countdown through the work/break cycle
    Pomodoro,
    /// Count up until stopped
    Stopwatch,
    /// Count up, split into back-to-back sessions
    Continuous,
}

impl From<KindArg> for SessionKind {
    fn from(kind: KindArg) -> Self {
        match kind {
            KindArg::Pomodoro => SessionKind::Pomodoro,
            KindArg::Stopwatch => SessionKind::Stopwatch,
            KindArg::Continuous => SessionKind::Continuous,
        }
    }
}

#[derive(Subcommand)]
pub enum TimerAction {
    /// Start a new session
    Start {
        #[arg(long, value_enum, default_value = "pomodoro")]
        kind: KindArg,
        /// Task the session is attributed to
        #[arg(long)]
        task: Option<String>,
    },
    /// Pause the running session
    Pause,
    /// Resume the paused session
    Resume,
    /// Complete the current pomodoro and move to the next mode
    Skip,
    /// Close the current session and continue in a new one
    Split,
    /// Stop the current session
    Stop {
        /// Record the session as interrupted instead of completed
        #[arg(long)]
        interrupted: bool,
    },
    /// Abandon the current session without recording it
    Reset,
    /// Print current timer state as JSON
    Status,
}

impl From<TimerAction> for TimerCommand {
    fn from(action: TimerAction) -> Self {
        match action {
            TimerAction::Start { kind, task } => TimerCommand::Start {
                kind: kind.into(),
                task_ref: task,
            },
            TimerAction::Pause => TimerCommand::Pause,
            TimerAction::Resume => TimerCommand::Resume,
            TimerAction::Skip => TimerCommand::SkipToNext,
            TimerAction::Split => TimerCommand::Split,
            TimerAction::Stop { interrupted } => TimerCommand::Stop {
                was_completed: !interrupted,
            },
            TimerAction::Reset => TimerCommand::Reset,
            TimerAction::Status => TimerCommand::View,
        }
    }
}

pub fn run(action: TimerAction) -> Result<(), Box<dyn std::error::Error>> {
    let mut app = App::open()?;
    let outcome = app.service.handle(action.into())?;

    if outcome.events.is_empty() {
        println!("{}", serde_json::to_string_pretty(&outcome.view)?);
    } else {
        let json = serde_json::json!({
            "events": outcome.events,
            "timer": outcome.view,
        });
        println!("{}", serde_json::to_string_pretty(&json)?);
    }
    Ok(())
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn stop_defaults_to_completed() {
        let command: TimerCommand = TimerAction::Stop { interrupted: false }.into();
        assert_eq!(command, TimerCommand::Stop { was_completed: true });
        let command: TimerCommand = TimerAction::Stop { interrupted: true }.into();
        assert_eq!(command, TimerCommand::Stop { was_completed: false });
    }

    #[test]
    fn status_is_read_only() {
        let command: TimerCommand = TimerAction::Status.into();
        assert_eq!(command, TimerCommand::View);
    }
}
