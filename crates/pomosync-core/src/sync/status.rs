//! Observable sync status.
//!
//! [`SyncState`] is derived from queue contents, connectivity and whether
//! the engine is draining. It is never persisted; a fresh process rebuilds
//! it from the queue.

use chrono::{DateTime, Duration, Utc};
use serde::{Deserialize, Serialize};
use tokio::sync::watch;

use super::types::QueueStats;

#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "lowercase")]
pub enum SyncStatus {
    Idle,
    Syncing,
    Error,
    Offline,
}

impl SyncStatus {
    pub fn as_str(self) -> &'static str {
        match self {
            SyncStatus::Idle => "idle",
            SyncStatus::Syncing => "syncing",
            SyncStatus::Error => "error",
            SyncStatus::Offline => "offline",
        }
    }
}

impl std::fmt::Display for SyncStatus {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.write_str(self.as_str())
    }
}

#[derive(Debug, Clone, PartialEq, Eq, Serialize)]
pub struct SyncState {
    pub status: SyncStatus,
    /// PENDING and IN_FLIGHT entries.
    pub pending_count: usize,
    pub failed_count: usize,
    pub last_synced_at: Option<DateTime<Utc>>,
    pub oldest_pending_at: Option<DateTime<Utc>>,
    /// Most recent failure, recoverable or not.
    pub last_error: Option<String>,
}

impl Default for SyncState {
    fn default() -> Self {
        Self {
            status: SyncStatus::Idle,
            pending_count: 0,
            failed_count: 0,
            last_synced_at: None,
            oldest_pending_at: None,
            last_error: None,
        }
    }
}

/// Inputs other than queue counts.
#[derive(Debug, Clone, Copy)]
pub struct EngineView<'a> {
    pub online: bool,
    pub draining: bool,
    pub last_synced_at: Option<DateTime<Utc>>,
    pub last_error: Option<&'a str>,
}

/// Status priority: offline, then syncing, then error, then idle.
pub fn project(stats: &QueueStats, engine: EngineView<'_>, max_queue_age_secs: u64, now: DateTime<Utc>) -> SyncState {
    let max_age = Duration::seconds(max_queue_age_secs.min(i64::MAX as u64 / 1000) as i64);
    let stale = stats
        .oldest_pending_at
        .is_some_and(|oldest| now - oldest > max_age);

    let status = if !engine.online {
        SyncStatus::Offline
    } else if engine.draining {
        SyncStatus::Syncing
    } else if stats.failed > 0 || stale {
        SyncStatus::Error
    } else {
        SyncStatus::Idle
    };

    SyncState {
        status,
        pending_count: stats.pending + stats.in_flight,
        failed_count: stats.failed,
        last_synced_at: engine.last_synced_at,
        oldest_pending_at: stats.oldest_pending_at,
        last_error: engine.last_error.map(str::to_string),
    }
}

/// Publishes [`SyncState`] to observers.
#[derive(Debug)]
pub struct SyncStatusProjector {
    tx: watch::Sender<SyncState>,
    max_queue_age_secs: u64,
    last_synced_at: Option<DateTime<Utc>>,
    last_error: Option<String>,
}

impl SyncStatusProjector {
    pub fn new(max_queue_age_secs: u64) -> Self {
        let (tx, _rx) = watch::channel(SyncState::default());
        Self {
            tx,
            max_queue_age_secs,
            last_synced_at: None,
            last_error: None,
        }
    }

    pub fn subscribe(&self) -> watch::Receiver<SyncState> {
        self.tx.subscribe()
    }

    pub fn current(&self) -> SyncState {
        self.tx.borrow().clone()
    }

    pub fn mark_synced(&mut self, at: DateTime<Utc>) {
        self.last_synced_at = Some(at);
        self.last_error = None;
    }

    pub fn mark_error(&mut self, message: impl Into<String>) {
        self.last_error = Some(message.into());
    }

    /// Recompute and publish. Observers are only woken on change.
    pub fn publish(&self, stats: &QueueStats, online: bool, draining: bool, now: DateTime<Utc>) -> SyncState {
        let next = project(
            stats,
            EngineView {
                online,
                draining,
                last_synced_at: self.last_synced_at,
                last_error: self.last_error.as_deref(),
            },
            self.max_queue_age_secs,
            now,
        );
        self.tx.send_if_modified(|current| {
            if *current == next {
                false
            } else {
                *current = next.clone();
                true
            }
        });
        next
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    fn at(secs: i64) -> DateTime<Utc> {
        DateTime::from_timestamp(1_700_000_000 + secs, 0).unwrap()
    }

    fn view(online: bool, draining: bool) -> EngineView<'static> {
        EngineView {
            online,
            draining,
            last_synced_at: None,
            last_error: None,
        }
    }

    #[test]
    fn empty_queue_online_is_idle() {
        let state = project(&QueueStats::default(), view(true, false), 86_400, at(0));
        assert_eq!(state.status, SyncStatus::Idle);
        assert_eq!(state.pending_count, 0);
    }

    #[test]
    fn offline_takes_precedence() {
        let stats = QueueStats {
            pending: 2,
            failed: 1,
            oldest_pending_at: Some(at(0)),
            ..QueueStats::default()
        };
        let state = project(&stats, view(false, true), 86_400, at(10));
        assert_eq!(state.status, SyncStatus::Offline);
        assert_eq!(state.pending_count, 2);
        assert_eq!(state.failed_count, 1);
    }

    #[test]
    fn draining_reports_syncing() {
        let stats = QueueStats {
            pending: 1,
            in_flight: 1,
            ..QueueStats::default()
        };
        let state = project(&stats, view(true, true), 86_400, at(0));
        assert_eq!(state.status, SyncStatus::Syncing);
        assert_eq!(state.pending_count, 2);
    }

    #[test]
    fn failed_entries_report_error() {
        let stats = QueueStats {
            failed: 1,
            ..QueueStats::default()
        };
        assert_eq!(
            project(&stats, view(true, false), 86_400, at(0)).status,
            SyncStatus::Error
        );
    }

    #[test]
    fn queue_older_than_cap_reports_error() {
        let stats = QueueStats {
            pending: 1,
            oldest_pending_at: Some(at(0)),
            ..QueueStats::default()
        };
        assert_eq!(
            project(&stats, view(true, false), 3600, at(3600)).status,
            SyncStatus::Idle
        );
        assert_eq!(
            project(&stats, view(true, false), 3600, at(3601)).status,
            SyncStatus::Error
        );
    }

    #[tokio::test]
    async fn projector_notifies_only_on_change() {
        let projector = SyncStatusProjector::new(86_400);
        let mut rx = projector.subscribe();
        projector.publish(&QueueStats::default(), true, false, at(0));
        assert!(!rx.has_changed().unwrap());

        projector.publish(&QueueStats::default(), false, false, at(0));
        assert!(rx.has_changed().unwrap());
        assert_eq!(rx.borrow_and_update().status, SyncStatus::Offline);
    }
}
