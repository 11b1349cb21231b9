//! Sync subcommand.
//!
//! Inspects the offline mutation queue and drains it against the remote
//! configured in `sync.base_url`.

use std::sync::Arc;

use clap::Subcommand;
use pomosync_core::sync::{project, ActiveReconciliation, EngineView, Resolution};
use pomosync_core::{Clock, ConnectivityWatch, RemoteTimerService};

use crate::app::App;

#[derive(Subcommand)]
pub enum SyncAction {
    /// Print sync status and queue counts as JSON
    Status,
    /// Send every ready queue entry now, ignoring backoff
    Now,
    /// List entries the remote rejected
    Failed,
    /// Put a rejected entry back in the queue
    Retry {
        /// Queue sequence number
        sequence: u64,
    },
    /// Drop a rejected entry so later changes can proceed
    Discard {
        /// Queue sequence number
        sequence: u64,
    },
    /// Merge the remote's active session into the local timer
    Reconcile,
}

pub fn run(action: SyncAction) -> Result<(), Box<dyn std::error::Error>> {
    let mut app = App::open()?;

    match action {
        SyncAction::Status => show_status(&app)?,
        SyncAction::Now => sync_now(&app)?,
        SyncAction::Failed => {
            let failed = app.service.queue().with(|q| q.failed())?;
            println!("{}", serde_json::to_string_pretty(&failed)?);
        }
        SyncAction::Retry { sequence } => resolve(&app, sequence, Resolution::Retry)?,
        SyncAction::Discard { sequence } => resolve(&app, sequence, Resolution::Discard)?,
        SyncAction::Reconcile => {
            let remote = app.require_remote()?;
            let recovery = app.recovery();
            let runtime = tokio::runtime::Builder::new_current_thread()
                .enable_all()
                .build()?;
            let outcome =
                runtime.block_on(recovery.reconcile_remote(&mut app.service, &remote))?;
            let outcome = match outcome {
                ActiveReconciliation::InSync => "in_sync",
                ActiveReconciliation::KeepLocal => "keep_local",
                ActiveReconciliation::ApplyFacts(_) => "apply_facts",
                ActiveReconciliation::RemoteOnly(_) => "remote_only",
            };
            let json = serde_json::json!({
                "reconciliation": outcome,
                "timer": app.service.view(),
            });
            println!("{}", serde_json::to_string_pretty(&json)?);
        }
    }
    Ok(())
}

fn show_status(app: &App) -> Result<(), Box<dyn std::error::Error>> {
    let (stats, last_error) = app.service.queue().with(|q| {
        let last_error = q
            .failed()
            .into_iter()
            .rev()
            .find_map(|entry| entry.last_error);
        (q.stats(), last_error)
    })?;
    let remote = app.config.sync.base_url.clone();
    let state = project(
        &stats,
        EngineView {
            online: remote.is_some(),
            draining: false,
            last_synced_at: None,
            last_error: last_error.as_deref(),
        },
        app.config.sync.max_queue_age_secs,
        app.clock.now(),
    );

    let json = serde_json::json!({
        "remote": remote,
        "state": state,
        "queue": stats,
    });
    println!("{}", serde_json::to_string_pretty(&json)?);
    Ok(())
}

fn sync_now(app: &App) -> Result<(), Box<dyn std::error::Error>> {
    let remote: Arc<dyn RemoteTimerService> = Arc::new(app.require_remote()?);
    let cleared = app.service.queue().with(|q| q.clear_backoff())??;
    let mut engine = app.sync_engine(remote, ConnectivityWatch::always_online());

    let runtime = tokio::runtime::Builder::new_current_thread()
        .enable_all()
        .build()?;
    let report = runtime.block_on(engine.drain())?;

    let json = serde_json::json!({
        "backoff_cleared": cleared,
        "sent": report.sent,
        "confirmed": report.confirmed,
        "retried": report.retried,
        "failed": report.failed,
        "state": engine.state(),
    });
    println!("{}", serde_json::to_string_pretty(&json)?);
    Ok(())
}

fn resolve(app: &App, sequence: u64, resolution: Resolution) -> Result<(), Box<dyn std::error::Error>> {
    let resolved = app
        .service
        .queue()
        .with(|q| q.resolve_failed(sequence, resolution))??;
    if !resolved {
        return Err(format!("no failed entry with sequence {sequence}").into());
    }
    println!("ok");
    Ok(())
}
