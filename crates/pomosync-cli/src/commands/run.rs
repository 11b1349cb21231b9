//! Foreground mode.
//!
//! Runs the tick driver and the sync engine until stdin closes or Ctrl-C.
//! Each stdin line is one command; timer events are printed as JSON lines.

use std::sync::Arc;

use clap::Args;
use pomosync_core::timer::{spawn_driver, IntervalTicker, TimerCommand, TimerHandle};
use pomosync_core::{Connectivity, RemoteTimerService, SessionKind, SyncHandle};
use tokio::io::{AsyncBufReadExt, BufReader};
use tokio::sync::broadcast::error::RecvError;
use tracing::{info, warn};

use crate::app::App;

#[derive(Args)]
pub struct RunArgs {
    /// Start disconnected; send `online` on stdin to begin syncing
    #[arg(long)]
    offline: bool,
}

/// One parsed stdin line.
#[derive(Debug, Clone, PartialEq, Eq)]
enum LineCommand {
    Timer(TimerCommand),
    Online(bool),
    ForceSync,
    SyncStatus,
    Help,
}

const HELP: &str = "commands: start [pomodoro|stopwatch|continuous] [task], pause, resume, \
skip, split, stop, interrupt, reset, status, online, offline, sync, sync-status, help";

fn parse_kind(word: &str) -> Option<SessionKind> {
    match word {
        "pomodoro" => Some(SessionKind::Pomodoro),
        "stopwatch" => Some(SessionKind::Stopwatch),
        "continuous" => Some(SessionKind::Continuous),
        _ => None,
    }
}

fn parse_line(line: &str) -> Result<LineCommand, String> {
    let mut words = line.split_whitespace();
    let Some(verb) = words.next() else {
        return Err("empty command".into());
    };
    let command = match verb {
        "start" => {
            let kind = match words.next() {
                Some(word) => parse_kind(word).ok_or_else(|| format!("unknown session kind: {word}"))?,
                None => SessionKind::Pomodoro,
            };
            LineCommand::Timer(TimerCommand::Start {
                kind,
                task_ref: words.next().map(str::to_string),
            })
        }
        "pause" => LineCommand::Timer(TimerCommand::Pause),
        "resume" => LineCommand::Timer(TimerCommand::Resume),
        "skip" => LineCommand::Timer(TimerCommand::SkipToNext),
        "split" => LineCommand::Timer(TimerCommand::Split),
        "stop" => LineCommand::Timer(TimerCommand::Stop { was_completed: true }),
        "interrupt" => LineCommand::Timer(TimerCommand::Stop {
            was_completed: false,
        }),
        "reset" => LineCommand::Timer(TimerCommand::Reset),
        "status" => LineCommand::Timer(TimerCommand::View),
        "online" => LineCommand::Online(true),
        "offline" => LineCommand::Online(false),
        "sync" => LineCommand::ForceSync,
        "sync-status" => LineCommand::SyncStatus,
        "help" => LineCommand::Help,
        other => return Err(format!("unknown command: {other}")),
    };
    if words.next().is_some() {
        return Err(format!("too many arguments for {verb}"));
    }
    Ok(command)
}

pub fn run(args: RunArgs) -> Result<(), Box<dyn std::error::Error>> {
    let app = App::open()?;
    let runtime = tokio::runtime::Builder::new_multi_thread()
        .enable_all()
        .build()?;
    runtime.block_on(serve(app, args.offline))
}

async fn serve(mut app: App, offline: bool) -> Result<(), Box<dyn std::error::Error>> {
    let connectivity = Connectivity::new(!offline);
    let sync = match app.remote()? {
        Some(remote) => {
            let remote: Arc<dyn RemoteTimerService> = Arc::new(remote);
            if !offline {
                let recovery = app.recovery();
                match recovery.reconcile_remote(&mut app.service, remote.as_ref()).await {
                    Ok(outcome) => info!(?outcome, "Reconciled with remote"),
                    Err(err) => warn!(error = %err, "Remote unreachable at startup"),
                }
            }
            Some(app.sync_engine(remote, connectivity.watch()).spawn())
        }
        None => {
            info!("sync.base_url is not set; running local-only");
            None
        }
    };

    let (timer, driver) = spawn_driver(app.service, IntervalTicker::every_second());
    let mut events = timer.subscribe();
    let mut lines = BufReader::new(tokio::io::stdin()).lines();
    let ctrl_c = tokio::signal::ctrl_c();
    tokio::pin!(ctrl_c);

    loop {
        tokio::select! {
            line = lines.next_line() => {
                let Some(line) = line? else {
                    break;
                };
                if line.trim().is_empty() {
                    continue;
                }
                match parse_line(&line) {
                    Ok(command) => {
                        let handle = sync.as_ref().map(|(handle, _)| handle);
                        execute(command, &timer, handle, &connectivity).await?;
                    }
                    Err(message) => eprintln!("error: {message}"),
                }
            }
            event = events.recv() => match event {
                Ok(event) => println!("{}", serde_json::to_string(&event)?),
                Err(RecvError::Lagged(skipped)) => warn!(skipped, "Event stream lagged"),
                Err(RecvError::Closed) => break,
            },
            _ = &mut ctrl_c => {
                info!("Interrupted");
                break;
            }
        }
    }

    drop(events);
    drop(timer);
    let mut service = driver.await?;
    service.checkpoint()?;

    if let Some((handle, task)) = sync {
        handle.shutdown().await;
        task.await?;
    }
    Ok(())
}

async fn execute(
    command: LineCommand,
    timer: &TimerHandle,
    sync: Option<&SyncHandle>,
    connectivity: &Connectivity,
) -> Result<(), Box<dyn std::error::Error>> {
    match command {
        LineCommand::Timer(command) => match timer.send(command).await {
            Ok(outcome) => println!("{}", serde_json::to_string(&outcome.view)?),
            Err(err) => eprintln!("error: {err}"),
        },
        LineCommand::Online(online) => {
            connectivity.set_online(online);
            info!(online, "Connectivity changed");
        }
        LineCommand::ForceSync => match sync {
            Some(handle) => {
                if !handle.force_sync() {
                    warn!("Sync engine busy; request dropped");
                }
            }
            None => eprintln!("error: sync.base_url is not set"),
        },
        LineCommand::SyncStatus => match sync {
            Some(handle) => println!("{}", serde_json::to_string(&handle.state())?),
            None => eprintln!("error: sync.base_url is not set"),
        },
        LineCommand::Help => eprintln!("{HELP}"),
    }
    Ok(())
}
