//! Sync engine.
//!
//! Drains the [`MutationQueue`] against a [`RemoteTimerService`] one entry
//! at a time. Each call races the per-request timeout and the connectivity
//! signal: a timeout counts as a recoverable failure, going offline cancels
//! the call and returns the entry to PENDING without counting an attempt.

use std::sync::Arc;
use std::time::Duration;

use chrono::{DateTime, Utc};
use tokio::sync::{mpsc, watch};
use tokio::task::JoinHandle;
use tracing::{debug, error, info, warn};

use super::backoff::Backoff;
use super::connectivity::ConnectivityWatch;
use super::queue::SharedQueue;
use super::reconcile::{record_facts, ServerFacts};
use super::remote::{apply_entry, RemoteTimerService};
use super::status::{SyncState, SyncStatusProjector};
use super::types::{EntityType, EntryStatus, RemoteAck, SyncQueueEntry};
use crate::clock::Clock;
use crate::error::{StorageError, SyncFailure};
use crate::storage::{LocalStore, SyncConfig};

/// Tuning for the drain loop.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub struct SyncSettings {
    pub backoff: Backoff,
    pub request_timeout: Duration,
    /// Unset retries forever.
    pub max_attempts: Option<u32>,
    pub max_queue_age_secs: u64,
}

impl SyncSettings {
    pub fn from_config(config: &SyncConfig) -> Self {
        Self {
            backoff: Backoff::from_secs(config.backoff_base_secs, config.backoff_cap_secs),
            request_timeout: Duration::from_secs(config.request_timeout_secs),
            max_attempts: config.max_attempts,
            max_queue_age_secs: config.max_queue_age_secs,
        }
    }
}

impl Default for SyncSettings {
    fn default() -> Self {
        Self::from_config(&SyncConfig::default())
    }
}

#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum SyncCommand {
    /// Clear backoff on PENDING entries and drain now.
    ForceSync,
    Shutdown,
}

/// What one `drain()` pass did.
#[derive(Debug, Clone, Copy, Default, PartialEq, Eq)]
pub struct DrainReport {
    pub sent: usize,
    pub confirmed: usize,
    pub retried: usize,
    pub failed: usize,
    /// Connectivity dropped mid-call.
    pub cancelled: bool,
}

enum SendOutcome {
    Acked(RemoteAck),
    Failed(SyncFailure),
    Cancelled,
}

pub struct SyncEngine {
    queue: SharedQueue,
    remote: Arc<dyn RemoteTimerService>,
    store: Arc<dyn LocalStore>,
    clock: Arc<dyn Clock>,
    connectivity: ConnectivityWatch,
    settings: SyncSettings,
    projector: SyncStatusProjector,
}

impl SyncEngine {
    pub fn new(
        queue: SharedQueue,
        remote: Arc<dyn RemoteTimerService>,
        store: Arc<dyn LocalStore>,
        clock: Arc<dyn Clock>,
        connectivity: ConnectivityWatch,
        settings: SyncSettings,
    ) -> Self {
        Self {
            projector: SyncStatusProjector::new(settings.max_queue_age_secs),
            queue,
            remote,
            store,
            clock,
            connectivity,
            settings,
        }
    }

    pub fn state(&self) -> SyncState {
        self.projector.current()
    }

    pub fn subscribe(&self) -> watch::Receiver<SyncState> {
        self.projector.subscribe()
    }

    pub fn settings(&self) -> &SyncSettings {
        &self.settings
    }

    /// Recompute status from the queue without sending anything.
    pub fn refresh(&self) -> Result<SyncState, StorageError> {
        self.publish(false)
    }

    /// Send ready entries until none is left, connectivity drops, or a
    /// call is cancelled.
    pub async fn drain(&mut self) -> Result<DrainReport, StorageError> {
        let mut report = DrainReport::default();
        while self.connectivity.is_online() {
            let now = self.clock.now();
            let Some(entry) = self.queue.with(|q| q.claim_next(now))?? else {
                break;
            };
            report.sent += 1;
            match self.process(&entry, &mut report).await {
                Ok(true) => {}
                Ok(false) => break,
                Err(err) => {
                    // An IN_FLIGHT head would block its entity until restart.
                    if let Err(release_err) = self.queue.with(|q| q.release(entry.sequence)).and_then(|r| r) {
                        error!(
                            sequence = entry.sequence,
                            error = %release_err,
                            "Failed to release sync entry"
                        );
                    }
                    return Err(err);
                }
            }
        }
        self.publish(false)?;
        Ok(report)
    }

    /// Send one claimed entry and record the outcome. Returns `false` when
    /// the call was cancelled and draining should stop.
    async fn process(
        &mut self,
        entry: &SyncQueueEntry,
        report: &mut DrainReport,
    ) -> Result<bool, StorageError> {
        self.publish(true)?;
        debug!(
            sequence = entry.sequence,
            entity_id = %entry.entity_id,
            op = entry.payload.op(),
            "Sending sync entry"
        );

        match self.send(entry).await {
            SendOutcome::Acked(ack) => {
                self.on_ack(entry, &ack)?;
                report.confirmed += 1;
            }
            SendOutcome::Failed(SyncFailure::Recoverable(message)) => {
                let status = self.on_recoverable(entry, &message)?;
                if status == Some(EntryStatus::Failed) {
                    report.failed += 1;
                } else {
                    report.retried += 1;
                }
            }
            SendOutcome::Failed(SyncFailure::NonRecoverable { status, message }) => {
                error!(
                    sequence = entry.sequence,
                    entity_id = %entry.entity_id,
                    op = entry.payload.op(),
                    status,
                    %message,
                    "Remote rejected sync entry"
                );
                let detail = format!("HTTP {status}: {message}");
                self.queue.with(|q| q.fail(entry.sequence, &detail))??;
                self.projector.mark_error(detail);
                report.failed += 1;
            }
            SendOutcome::Cancelled => {
                info!(sequence = entry.sequence, "Went offline mid-call; entry returned to queue");
                self.queue.with(|q| q.release(entry.sequence))??;
                report.cancelled = true;
                return Ok(false);
            }
            }
        Ok(true)
    }

    /// Long-running loop. Drains whenever something may have become
    /// sendable: an append, a connectivity change, a backoff deadline, or a
    /// force-sync command.
    pub async fn run(mut self, mut commands: mpsc::Receiver<SyncCommand>) {
        info!("Sync engine started");
        let mut connectivity = self.connectivity.clone();
        loop {
            let result = if connectivity.is_online() {
                self.drain().await.map(|_| ())
            } else {
                self.refresh().map(|_| ())
            };
            if let Err(err) = result {
                error!(error = %err, "Sync pass failed");
            }

            let wait = self.next_wake();
            tokio::select! {
                command = commands.recv() => match command {
                    Some(SyncCommand::ForceSync) => {
                        match self.queue.with(|q| q.clear_backoff()) {
                            Ok(Ok(cleared)) => info!(cleared, "Force sync requested"),
                            Ok(Err(err)) | Err(err) => error!(error = %err, "Failed to clear backoff"),
                        }
                    }
                    Some(SyncCommand::Shutdown) | None => break,
                },
                _ = self.queue.appended() => {}
                online = connectivity.changed() => {
                    info!(online, "Connectivity changed");
                }
                _ = sleep_or_pending(wait) => {}
            }
        }
        info!("Sync engine stopped");
    }

    pub fn spawn(self) -> (SyncHandle, JoinHandle<()>) {
        let (tx, rx) = mpsc::channel(16);
        let handle = SyncHandle {
            commands: tx,
            state: self.subscribe(),
        };
        let task = tokio::spawn(self.run(rx));
        (handle, task)
    }

    // ── Internal ─────────────────────────────────────────────────────

    async fn send(&self, entry: &SyncQueueEntry) -> SendOutcome {
        let mut connectivity = self.connectivity.clone();
        let timeout = self.settings.request_timeout;
        tokio::select! {
            result = tokio::time::timeout(timeout, apply_entry(self.remote.as_ref(), entry)) => match result {
                Ok(Ok(ack)) => SendOutcome::Acked(ack),
                Ok(Err(failure)) => SendOutcome::Failed(failure),
                Err(_) => SendOutcome::Failed(SyncFailure::Recoverable(format!(
                    "request timed out after {}s",
                    timeout.as_secs()
                ))),
            },
            _ = connectivity.wait_offline() => SendOutcome::Cancelled,
        }
    }

    fn on_ack(&mut self, entry: &SyncQueueEntry, ack: &RemoteAck) -> Result<(), StorageError> {
        let now = self.clock.now();
        if entry.entity_type == EntityType::TimerSession {
            record_facts(
                self.store.as_ref(),
                &entry.entity_id,
                &ServerFacts::from_ack(ack, entry.sequence, now),
            )?;
        }
        self.queue
            .with(|q| q.confirm(entry.sequence, ack.client_sequence))??;
        self.projector.mark_synced(now);
        debug!(sequence = entry.sequence, "Sync entry confirmed");
        Ok(())
    }

    fn on_recoverable(
        &mut self,
        entry: &SyncQueueEntry,
        message: &str,
    ) -> Result<Option<EntryStatus>, StorageError> {
        let now = self.clock.now();
        let attempts = entry.attempts + 1;
        let next_attempt_at = self.settings.backoff.next_attempt_at(now, attempts);
        let status = self.queue.with(|q| {
            q.retry_later(entry.sequence, next_attempt_at, message, self.settings.max_attempts)
        })??;
        if status == Some(EntryStatus::Failed) {
            error!(
                sequence = entry.sequence,
                attempts,
                %message,
                "Sync entry exceeded retry ceiling"
            );
        } else {
            warn!(
                sequence = entry.sequence,
                attempts,
                retry_at = %next_attempt_at,
                %message,
                "Sync attempt failed; will retry"
            );
        }
        self.projector.mark_error(message);
        Ok(status)
    }

    fn publish(&self, draining: bool) -> Result<SyncState, StorageError> {
        let stats = self.queue.stats()?;
        Ok(self.projector.publish(
            &stats,
            self.connectivity.is_online(),
            draining,
            self.clock.now(),
        ))
    }

    fn next_wake(&self) -> Option<Duration> {
        let now = self.clock.now();
        let at = self.queue.with(|q| q.next_retry_after(now)).ok()??;
        Some(until(now, at))
    }
}

fn until(now: DateTime<Utc>, at: DateTime<Utc>) -> Duration {
    (at - now).to_std().unwrap_or(Duration::ZERO)
}

async fn sleep_or_pending(wait: Option<Duration>) {
    match wait {
        Some(duration) => tokio::time::sleep(duration).await,
        None => std::future::pending::<()>().await,
    }
}

/// Cloneable handle to a spawned [`SyncEngine`].
#[derive(Debug, Clone)]
pub struct SyncHandle {
    commands: mpsc::Sender<SyncCommand>,
    state: watch::Receiver<SyncState>,
}

impl SyncHandle {
    /// Ask for an immediate drain. Returns `false` if the engine is gone
    /// or already has a backlog of commands.
    pub fn force_sync(&self) -> bool {
        self.commands.try_send(SyncCommand::ForceSync).is_ok()
    }

    pub async fn shutdown(&self) {
        let _ = self.commands.send(SyncCommand::Shutdown).await;
    }

    pub fn state(&self) -> SyncState {
        self.state.borrow().clone()
    }

    pub fn subscribe(&self) -> watch::Receiver<SyncState> {
        self.state.clone()
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::clock::ManualClock;
    use crate::storage::memory::FlakyStore;
    use crate::storage::MemoryStore;
    use crate::sync::connectivity::Connectivity;
    use crate::sync::queue::MutationQueue;
    use crate::sync::reconcile::facts_for;
    use crate::sync::remote::{
        PauseRequest, ResumeRequest, SessionRecordRequest, StartRequest, StopRequest,
    };
    use crate::sync::status::SyncStatus;
    use crate::sync::types::{Mutation, MutationPayload, SessionDescriptor};
    use async_trait::async_trait;
    use std::collections::VecDeque;
    use std::sync::Mutex;

    const START: i64 = 1_700_000_000;

    #[derive(Default)]
    struct FakeRemote {
        script: Mutex<VecDeque<Result<(), SyncFailure>>>,
        calls: Mutex<Vec<(&'static str, u64)>>,
        delay: Option<Duration>,
    }

    impl FakeRemote {
        fn scripted(script: Vec<Result<(), SyncFailure>>) -> Self {
            Self {
                script: Mutex::new(script.into()),
                ..Self::default()
            }
        }

        fn slow(delay: Duration) -> Self {
            Self {
                delay: Some(delay),
                ..Self::default()
            }
        }

        fn calls(&self) -> Vec<(&'static str, u64)> {
            self.calls.lock().unwrap().clone()
        }

        async fn respond(&self, op: &'static str, sequence: u64) -> Result<RemoteAck, SyncFailure> {
            if let Some(delay) = self.delay {
                tokio::time::sleep(delay).await;
            }
            self.calls.lock().unwrap().push((op, sequence));
            let next = self.script.lock().unwrap().pop_front().unwrap_or(Ok(()));
            next.map(|_| RemoteAck {
                id: Some("srv-1".into()),
                client_sequence: Some(sequence),
                elapsed_seconds: Some(sequence as i64),
            })
        }
    }

    #[async_trait]
    impl RemoteTimerService for FakeRemote {
        async fn start(&self, request: &StartRequest) -> Result<SessionDescriptor, SyncFailure> {
            let ack = self.respond("start", request.client_sequence).await?;
            Ok(SessionDescriptor {
                id: ack.id.unwrap_or_default(),
                client_session_id: Some(request.client_session_id.clone()),
                task_id: request.task_id.clone(),
                kind: request.kind,
                mode: Some(request.mode),
                started_at: request.started_at,
                pause_started_at: None,
                elapsed_seconds: 0,
                client_sequence: ack.client_sequence,
            })
        }

        async fn pause(&self, request: &PauseRequest) -> Result<RemoteAck, SyncFailure> {
            self.respond("pause", request.client_sequence).await
        }

        async fn resume(&self, request: &ResumeRequest) -> Result<RemoteAck, SyncFailure> {
            self.respond("resume", request.client_sequence).await
        }

        async fn stop(&self, request: &StopRequest) -> Result<RemoteAck, SyncFailure> {
            self.respond("stop", request.client_sequence).await
        }

        async fn record_session(&self, request: &SessionRecordRequest) -> Result<RemoteAck, SyncFailure> {
            self.respond("record", request.client_sequence).await
        }

        async fn active(&self) -> Result<Option<SessionDescriptor>, SyncFailure> {
            Ok(None)
        }
    }

    struct Fixture {
        engine: SyncEngine,
        queue: SharedQueue,
        store: Arc<MemoryStore>,
        clock: ManualClock,
        connectivity: Connectivity,
        remote: Arc<FakeRemote>,
    }

    fn fixture(remote: FakeRemote, settings: SyncSettings) -> Fixture {
        let store = Arc::new(MemoryStore::new());
        let clock = ManualClock::at_epoch_secs(START);
        let connectivity = Connectivity::new(true);
        let remote = Arc::new(remote);
        let queue = SharedQueue::new(MutationQueue::open(store.clone()).unwrap());
        let engine = SyncEngine::new(
            queue.clone(),
            remote.clone(),
            store.clone(),
            Arc::new(clock.clone()),
            connectivity.watch(),
            settings,
        );
        Fixture {
            engine,
            queue,
            store,
            clock,
            connectivity,
            remote,
        }
    }

    fn at(secs: i64) -> DateTime<Utc> {
        DateTime::from_timestamp(START + secs, 0).unwrap()
    }

    fn enqueue(queue: &SharedQueue, entity: &str, count: usize) {
        let mutations = (0..count)
            .map(|i| {
                Mutation::new(
                    entity,
                    MutationPayload::Pause {
                        pause_started_at: at(i as i64),
                    },
                )
            })
            .collect();
        queue.append_with(mutations, at(0), &[]).unwrap();
    }

    #[tokio::test]
    async fn drain_confirms_in_order_and_prunes() {
        let mut f = fixture(FakeRemote::default(), SyncSettings::default());
        enqueue(&f.queue, "s1", 3);

        let report = f.engine.drain().await.unwrap();
        assert_eq!(report.confirmed, 3);
        assert_eq!(f.remote.calls(), vec![("pause", 1), ("pause", 2), ("pause", 3)]);
        assert!(f.queue.with(|q| q.is_empty()).unwrap());

        let state = f.engine.state();
        assert_eq!(state.status, SyncStatus::Idle);
        assert_eq!(state.pending_count, 0);
        assert_eq!(state.last_synced_at, Some(at(0)));

        let facts = facts_for(f.store.as_ref(), "s1").unwrap().unwrap();
        assert_eq!(facts.acked_sequence, 3);
    }

    #[tokio::test]
    async fn recoverable_failure_backs_off() {
        let remote = FakeRemote::scripted(vec![Err(SyncFailure::Recoverable("HTTP 503".into()))]);
        let mut f = fixture(remote, SyncSettings::default());
        enqueue(&f.queue, "s1", 1);

        let report = f.engine.drain().await.unwrap();
        assert_eq!(report.retried, 1);
        let entry = f.queue.with(|q| q.entries()[0].clone()).unwrap();
        assert_eq!(entry.status, EntryStatus::Pending);
        assert_eq!(entry.attempts, 1);
        assert_eq!(entry.next_attempt_at, Some(at(1)));
        assert_eq!(f.engine.state().status, SyncStatus::Idle);

        // Not due yet.
        assert_eq!(f.engine.drain().await.unwrap().sent, 0);
        f.clock.advance(1);
        assert_eq!(f.engine.drain().await.unwrap().confirmed, 1);
    }

    #[tokio::test]
    async fn backoff_grows_with_attempts() {
        let failure = || Err(SyncFailure::Recoverable("HTTP 500".into()));
        let remote = FakeRemote::scripted(vec![failure(), failure(), failure()]);
        let mut f = fixture(remote, SyncSettings::default());
        enqueue(&f.queue, "s1", 1);

        let mut deadlines = Vec::new();
        for _ in 0..3 {
            f.engine.drain().await.unwrap();
            let entry = f.queue.with(|q| q.entries()[0].clone()).unwrap();
            let due = entry.next_attempt_at.unwrap();
            deadlines.push((due - f.clock.now()).num_seconds());
            f.clock.set(due);
        }
        assert_eq!(deadlines, vec![1, 2, 4]);
    }

    #[tokio::test]
    async fn rejection_fails_entry_and_blocks_entity() {
        let remote = FakeRemote::scripted(vec![Err(SyncFailure::NonRecoverable {
            status: 422,
            message: "bad".into(),
        })]);
        let mut f = fixture(remote, SyncSettings::default());
        enqueue(&f.queue, "s1", 2);
        enqueue(&f.queue, "s2", 1);

        let report = f.engine.drain().await.unwrap();
        assert_eq!(report.failed, 1);
        assert_eq!(report.confirmed, 1);
        assert_eq!(f.remote.calls(), vec![("pause", 1), ("pause", 3)]);

        let state = f.engine.state();
        assert_eq!(state.status, SyncStatus::Error);
        assert_eq!(state.failed_count, 1);
        assert_eq!(state.pending_count, 1);

        // Never retried automatically.
        f.clock.advance(3600);
        assert_eq!(f.engine.drain().await.unwrap().sent, 0);
    }

    #[tokio::test]
    async fn retry_ceiling_moves_entry_to_failed() {
        let failure = || Err(SyncFailure::Recoverable("HTTP 500".into()));
        let remote = FakeRemote::scripted(vec![failure(), failure()]);
        let settings = SyncSettings {
            max_attempts: Some(2),
            ..SyncSettings::default()
        };
        let mut f = fixture(remote, settings);
        enqueue(&f.queue, "s1", 1);

        assert_eq!(f.engine.drain().await.unwrap().retried, 1);
        f.clock.advance(60);
        assert_eq!(f.engine.drain().await.unwrap().failed, 1);
        assert_eq!(f.queue.with(|q| q.failed().len()).unwrap(), 1);
    }

    #[tokio::test(start_paused = true)]
    async fn slow_call_times_out_as_recoverable() {
        let settings = SyncSettings {
            request_timeout: Duration::from_secs(10),
            ..SyncSettings::default()
        };
        let mut f = fixture(FakeRemote::slow(Duration::from_secs(30)), settings);
        enqueue(&f.queue, "s1", 1);

        let report = f.engine.drain().await.unwrap();
        assert_eq!(report.retried, 1);
        let entry = f.queue.with(|q| q.entries()[0].clone()).unwrap();
        assert_eq!(entry.attempts, 1);
        assert!(entry.last_error.unwrap().contains("timed out"));
        assert!(f.remote.calls().is_empty());
    }

    #[tokio::test]
    async fn storage_failure_after_claim_releases_entry() {
        let store = Arc::new(FlakyStore::default());
        let clock = ManualClock::at_epoch_secs(START);
        let connectivity = Connectivity::new(true);
        let remote = Arc::new(FakeRemote::default());
        let queue = SharedQueue::new(MutationQueue::open(store.clone()).unwrap());
        let mut engine = SyncEngine::new(
            queue.clone(),
            remote.clone(),
            store.clone(),
            Arc::new(clock.clone()),
            connectivity.watch(),
            SyncSettings::default(),
        );
        enqueue(&queue, "s1", 2);

        // The ack lands but writing its server facts fails.
        store.fail_updates(1);
        let err = engine.drain().await.unwrap_err();
        assert!(matches!(err, StorageError::Poisoned));
        let statuses: Vec<EntryStatus> = queue
            .with(|q| q.entries().iter().map(|e| e.status).collect())
            .unwrap();
        assert_eq!(statuses, vec![EntryStatus::Pending, EntryStatus::Pending]);

        let report = engine.drain().await.unwrap();
        assert_eq!(report.confirmed, 2);
        assert!(queue.with(|q| q.is_empty()).unwrap());
        assert_eq!(remote.calls(), vec![("pause", 1), ("pause", 1), ("pause", 2)]);
    }

    #[tokio::test(start_paused = true)]
    async fn going_offline_cancels_without_counting_attempt() {
        let mut f = fixture(FakeRemote::slow(Duration::from_secs(30)), SyncSettings::default());
        enqueue(&f.queue, "s1", 2);

        let connectivity = &f.connectivity;
        let (report, _) = tokio::join!(f.engine.drain(), async {
            tokio::time::sleep(Duration::from_secs(1)).await;
            connectivity.set_online(false);
        });
        let report = report.unwrap();
        assert!(report.cancelled);
        assert_eq!(report.sent, 1);

        let entries = f.queue.with(|q| q.entries().to_vec()).unwrap();
        assert!(entries
            .iter()
            .all(|e| e.status == EntryStatus::Pending && e.attempts == 0));
        assert_eq!(f.engine.state().status, SyncStatus::Offline);
        assert_eq!(f.engine.state().pending_count, 2);
    }

    #[tokio::test]
    async fn offline_drain_sends_nothing() {
        let mut f = fixture(FakeRemote::default(), SyncSettings::default());
        enqueue(&f.queue, "s1", 1);
        f.connectivity.set_online(false);

        let report = f.engine.drain().await.unwrap();
        assert_eq!(report.sent, 0);
        assert_eq!(f.engine.state().status, SyncStatus::Offline);
        assert_eq!(f.engine.state().pending_count, 1);
    }

    #[tokio::test]
    async fn force_sync_clears_backoff() {
        let f = fixture(FakeRemote::default(), SyncSettings::default());
        enqueue(&f.queue, "s1", 1);
        f.queue
            .with(|q| {
                let entry = q.claim_next(at(0)).unwrap().unwrap();
                q.retry_later(entry.sequence, at(3600), "HTTP 503", None).unwrap();
            })
            .unwrap();

        let Fixture {
            engine,
            queue,
            connectivity: _connectivity,
            ..
        } = f;
        let (handle, task) = engine.spawn();
        let mut state = handle.subscribe();
        // First pass finds nothing due.
        state
            .wait_for(|s| s.pending_count == 1 && s.status == SyncStatus::Idle)
            .await
            .unwrap();

        assert!(handle.force_sync());
        state.wait_for(|s| s.pending_count == 0).await.unwrap();
        assert!(queue.with(|q| q.is_empty()).unwrap());

        handle.shutdown().await;
        task.await.unwrap();
    }
}
