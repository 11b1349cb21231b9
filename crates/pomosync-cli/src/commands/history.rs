use clap::Subcommand;
use pomosync_core::{CompletedSession, Database, LocalStore};
use serde::Serialize;

#[derive(Subcommand)]
pub enum HistoryAction {
    /// Most recent completed sessions, newest first
    List {
        #[arg(long, default_value = "10")]
        limit: usize,
    },
    /// Totals over the most recent sessions
    Summary {
        #[arg(long, default_value = "100")]
        limit: usize,
    },
}

#[derive(Debug, Default, PartialEq, Eq, Serialize)]
struct Summary {
    sessions: usize,
    completed: usize,
    interrupted: usize,
    focus_secs: u64,
    break_secs: u64,
    pause_secs: u64,
}

fn summarize(records: &[CompletedSession]) -> Summary {
    let mut summary = Summary {
        sessions: records.len(),
        ..Summary::default()
    };
    for record in records {
        if record.was_interrupted {
            summary.interrupted += 1;
        } else if record.was_completed {
            summary.completed += 1;
        }
        if record.mode.is_break() {
            summary.break_secs += record.duration;
        } else {
            summary.focus_secs += record.duration;
        }
        summary.pause_secs += record.total_pause_time;
    }
    summary
}

pub fn run(action: HistoryAction) -> Result<(), Box<dyn std::error::Error>> {
    let db = Database::open()?;

    match action {
        HistoryAction::List { limit } => {
            let records = db.recent_completed(limit)?;
            println!("{}", serde_json::to_string_pretty(&records)?);
        }
        HistoryAction::Summary { limit } => {
            let records = db.recent_completed(limit)?;
            println!("{}", serde_json::to_string_pretty(&summarize(&records))?);
        }
    }
    Ok(())
}
