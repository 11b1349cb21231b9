//! Cold-start recovery of the timer.
//!
//! Rebuilds a [`TimerStateMachine`] from the last persisted snapshot.
//! Elapsed time is always re-derived from the session timestamps, never
//! from a cached remaining value, so any gap while the process was down is
//! accounted for exactly once.

use std::sync::Arc;

use tracing::{error, info, warn};

use crate::clock::{secs_between, Clock};
use crate::error::{CoreError, RecoveryError, StorageError};
use crate::events::TimerEvent;
use crate::storage::{get_json, LocalStore, RecoveryConfig};
use crate::sync::reconcile::{
    pending_fields, reconcile_active, record_facts, session_from_descriptor, ActiveReconciliation,
    ServerFacts,
};
use crate::sync::RemoteTimerService;
use crate::timer::{TimerPolicy, TimerService, TimerSnapshot, TimerStateMachine, SNAPSHOT_KEY};

/// What recovery did with the persisted state.
#[derive(Debug, Clone, PartialEq, Eq)]
pub enum RecoveryAction {
    /// Nothing was persisted (or the snapshot was unreadable).
    Fresh,
    /// State restored as-is; any active session keeps running.
    Restored,
    /// Countdowns ran out while the process was down and were completed
    /// at the instants they would naturally have ended.
    CompletedOverdue {
        /// Completed-session records produced.
        count: usize,
    },
    /// The clock was implausible; the session was closed as interrupted at
    /// the last checkpoint.
    ForceCompleted {
        error: RecoveryError,
    },
}

/// Result of [`SessionRecoveryEngine::recover`].
#[derive(Debug)]
pub struct RecoveryReport {
    /// The rebuilt machine.
    pub machine: TimerStateMachine,
    pub action: RecoveryAction,
    /// Events produced during recovery. Hand them to
    /// [`TimerService::absorb`] so they are persisted and queued.
    pub events: Vec<TimerEvent>,
    /// Seconds between the last checkpoint and now; negative when the
    /// clock moved backwards.
    pub gap_secs: i64,
}

impl RecoveryReport {
    /// Number of completed-session records produced.
    pub fn completed_count(&self) -> usize {
        self.events
            .iter()
            .filter(|e| matches!(e, TimerEvent::SessionCompleted(_)))
            .count()
    }
}

/// Engine that reconstructs the timer on startup.
pub struct SessionRecoveryEngine {
    store: Arc<dyn LocalStore>,
    clock: Arc<dyn Clock>,
    policy: TimerPolicy,
    max_plausible_secs: u64,
}

impl SessionRecoveryEngine {
    /// Create an engine with the default plausibility bound (24 h).
    pub fn new(store: Arc<dyn LocalStore>, clock: Arc<dyn Clock>, policy: TimerPolicy) -> Self {
        Self::with_config(store, clock, policy, &RecoveryConfig::default())
    }

    pub fn with_config(
        store: Arc<dyn LocalStore>,
        clock: Arc<dyn Clock>,
        policy: TimerPolicy,
        config: &RecoveryConfig,
    ) -> Self {
        Self {
            store,
            clock,
            policy,
            max_plausible_secs: config.max_plausible_secs,
        }
    }

    /// Rebuild the machine from the persisted snapshot.
    ///
    /// An unreadable snapshot is logged and treated as absent; only store
    /// failures are returned as errors.
    pub fn recover(&self) -> Result<RecoveryReport, StorageError> {
        let Some(snapshot) = self.load_snapshot()? else {
            info!("No timer snapshot; starting fresh");
            return Ok(self.report(self.fresh(), RecoveryAction::Fresh, Vec::new(), 0));
        };

        let now = self.clock.now();
        let checkpoint_at = snapshot.checkpoint_at;
        let gap_secs = secs_between(checkpoint_at, now);
        let mut machine =
            TimerStateMachine::from_snapshot(snapshot, self.policy.clone(), self.clock.clone());

        let Some((session_id, started_at)) = machine
            .active_session()
            .map(|s| (s.id.clone(), s.started_at))
        else {
            info!(state = %machine.state(), "Restored idle timer");
            return Ok(self.report(machine, RecoveryAction::Restored, Vec::new(), gap_secs));
        };

        let skew = if now < started_at {
            Some(format!(
                "clock reads {}s before the session started",
                secs_between(now, started_at)
            ))
        } else if now < checkpoint_at {
            Some(format!("clock moved back {}s since the last checkpoint", -gap_secs))
        } else {
            None
        };

        let mut events = Vec::new();
        let skew = match skew {
            Some(detail) => Some(detail),
            None => {
                events = machine.complete_overdue(now);
                machine
                    .active_session()
                    .map(|s| s.elapsed_secs(now))
                    .filter(|elapsed| *elapsed > self.max_plausible_secs)
                    .map(|elapsed| {
                        format!(
                            "elapsed {elapsed}s exceeds the plausible maximum of {}s",
                            self.max_plausible_secs
                        )
                    })
            }
        };

        if let Some(detail) = skew {
            let session_id = machine
                .active_session()
                .map(|s| s.id.clone())
                .unwrap_or(session_id);
            let error = RecoveryError::ClockSkewDetected { session_id, detail };
            error!(error = %error, gap_secs, "Force-completing session at last checkpoint");
            let end = machine
                .active_session()
                .map(|s| checkpoint_at.max(s.started_at))
                .unwrap_or(checkpoint_at);
            events.extend(machine.force_complete_at(end));
            return Ok(self.report(machine, RecoveryAction::ForceCompleted { error }, events, gap_secs));
        }

        let count = events
            .iter()
            .filter(|e| matches!(e, TimerEvent::SessionCompleted(_)))
            .count();
        let action = if count > 0 {
            info!(count, gap_secs, "Completed sessions that ran out while closed");
            RecoveryAction::CompletedOverdue { count }
        } else {
            info!(session_id = %session_id, gap_secs, "Restored active session");
            RecoveryAction::Restored
        };
        Ok(self.report(machine, action, events, gap_secs))
    }

    /// Compare the recovered state with `GET /timer/active` and apply the
    /// server-owned fields. A session active only on the remote is adopted.
    pub async fn reconcile_remote(
        &self,
        service: &mut TimerService,
        remote: &dyn RemoteTimerService,
    ) -> Result<ActiveReconciliation, CoreError> {
        let descriptor = remote.active().await?;
        let now = self.clock.now();
        let local = service.machine().session().cloned();
        let pending = match &local {
            Some(session) => service
                .queue()
                .with(|q| pending_fields(q.unconfirmed_for(&session.id)))?,
            None => Default::default(),
        };

        let outcome = reconcile_active(local.as_ref(), descriptor.as_ref(), &pending, now);
        match &outcome {
            ActiveReconciliation::ApplyFacts(facts) => {
                if let Some(session) = &local {
                    record_facts(self.store.as_ref(), &session.id, facts)?;
                }
            }
            ActiveReconciliation::RemoteOnly(descriptor) => {
                let session = session_from_descriptor(descriptor, service.machine().policy(), now);
                let session_id = session.id.clone();
                service.adopt(session)?;
                record_facts(
                    self.store.as_ref(),
                    &session_id,
                    &ServerFacts::from_descriptor(descriptor, now),
                )?;
            }
            ActiveReconciliation::KeepLocal | ActiveReconciliation::InSync => {}
        }
        Ok(outcome)
    }

    // ── Internal ─────────────────────────────────────────────────────

    fn load_snapshot(&self) -> Result<Option<TimerSnapshot>, StorageError> {
        match get_json(self.store.as_ref(), SNAPSHOT_KEY) {
            Ok(snapshot) => Ok(snapshot),
            Err(StorageError::Json(err)) => {
                warn!(error = %err, "Discarding unreadable timer snapshot");
                Ok(None)
            }
            Err(err) => Err(err),
        }
    }

    fn fresh(&self) -> TimerStateMachine {
        TimerStateMachine::new(self.policy.clone(), self.clock.clone())
    }

    fn report(
        &self,
        machine: TimerStateMachine,
        action: RecoveryAction,
        events: Vec<TimerEvent>,
        gap_secs: i64,
    ) -> RecoveryReport {
        RecoveryReport {
            machine,
            action,
            events,
            gap_secs,
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::clock::ManualClock;
    use crate::events::CompletedSession;
    use crate::storage::{put_json, MemoryStore};
    use crate::timer::{SessionKind, TimerMode, TimerState};

    const START: i64 = 1_700_000_000;

    struct Fixture {
        store: Arc<MemoryStore>,
        clock: ManualClock,
    }

    impl Fixture {
        fn new() -> Self {
            Self {
                store: Arc::new(MemoryStore::new()),
                clock: ManualClock::at_epoch_secs(START),
            }
        }

        fn machine(&self, policy: TimerPolicy) -> TimerStateMachine {
            TimerStateMachine::new(policy, Arc::new(self.clock.clone()))
        }

        fn persist(&self, machine: &TimerStateMachine) {
            put_json(self.store.as_ref(), SNAPSHOT_KEY, &machine.snapshot()).unwrap();
        }

        fn engine(&self, policy: TimerPolicy) -> SessionRecoveryEngine {
            SessionRecoveryEngine::new(self.store.clone(), Arc::new(self.clock.clone()), policy)
        }
    }

    fn records(events: &[TimerEvent]) -> Vec<&CompletedSession> {
        events
            .iter()
            .filter_map(|e| match e {
                TimerEvent::SessionCompleted(r) => Some(r),
                _ => None,
            })
            .collect()
    }

    #[test]
    fn nothing_persisted_is_fresh() {
        let f = Fixture::new();
        let report = f.engine(TimerPolicy::default()).recover().unwrap();
        assert_eq!(report.action, RecoveryAction::Fresh);
        assert_eq!(report.machine.state(), TimerState::Idle);
    }

    #[test]
    fn corrupt_snapshot_is_treated_as_fresh() {
        let f = Fixture::new();
        f.store.put(SNAPSHOT_KEY, "{not json").unwrap();
        let report = f.engine(TimerPolicy::default()).recover().unwrap();
        assert_eq!(report.action, RecoveryAction::Fresh);
    }

    #[test]
    fn running_session_accounts_for_the_gap() {
        let f = Fixture::new();
        let mut machine = f.machine(TimerPolicy::default());
        machine.start(SessionKind::Pomodoro, None).unwrap();
        f.clock.advance(300);
        f.persist(&machine);

        f.clock.advance(120);
        let report = f.engine(TimerPolicy::default()).recover().unwrap();
        assert_eq!(report.action, RecoveryAction::Restored);
        assert_eq!(report.gap_secs, 120);
        assert_eq!(report.machine.state(), TimerState::Running);
        assert_eq!(report.machine.view().elapsed_secs, 420);
    }

    #[test]
    fn paused_session_stays_frozen() {
        let f = Fixture::new();
        let mut machine = f.machine(TimerPolicy::default());
        machine.start(SessionKind::Pomodoro, None).unwrap();
        f.clock.advance(100);
        machine.pause().unwrap();
        f.persist(&machine);

        f.clock.advance(7200);
        let report = f.engine(TimerPolicy::default()).recover().unwrap();
        assert_eq!(report.action, RecoveryAction::Restored);
        assert_eq!(report.machine.state(), TimerState::Paused);
        assert_eq!(report.machine.view().elapsed_secs, 100);
    }

    #[test]
    fn overdue_countdown_completes_at_natural_end() {
        let f = Fixture::new();
        let mut machine = f.machine(TimerPolicy::default());
        machine.start(SessionKind::Pomodoro, Some("task".into())).unwrap();
        f.clock.advance(600);
        f.persist(&machine);

        f.clock.advance(3600);
        let report = f.engine(TimerPolicy::default()).recover().unwrap();
        assert_eq!(report.action, RecoveryAction::CompletedOverdue { count: 1 });
        let completed = records(&report.events);
        assert_eq!(completed[0].duration, 1500);
        assert_eq!(completed[0].ended_at.timestamp(), START + 1500);
        assert!(completed[0].was_completed);
        assert_eq!(report.machine.state(), TimerState::Idle);
        assert_eq!(report.machine.next_mode(), TimerMode::ShortBreak);
        assert_eq!(report.machine.completed_work_sessions(), 1);
    }

    #[test]
    fn auto_started_follow_ons_complete_in_turn() {
        let policy = TimerPolicy {
            auto_start_breaks: true,
            ..TimerPolicy::default()
        };
        let f = Fixture::new();
        let mut machine = f.machine(policy.clone());
        machine.start(SessionKind::Pomodoro, None).unwrap();
        f.persist(&machine);

        // Work (1500) then short break (300) both ran out; work does not
        // auto-start.
        f.clock.advance(2000);
        let report = f.engine(policy).recover().unwrap();
        let completed = records(&report.events);
        assert_eq!(completed.len(), 2);
        assert_eq!(completed[0].mode, TimerMode::Work);
        assert_eq!(completed[1].mode, TimerMode::ShortBreak);
        assert_eq!(completed[1].ended_at.timestamp(), START + 1800);
        assert_eq!(report.machine.state(), TimerState::Idle);
        assert_eq!(report.machine.next_mode(), TimerMode::Work);
    }

    #[test]
    fn clock_before_checkpoint_force_completes() {
        let f = Fixture::new();
        let mut machine = f.machine(TimerPolicy::default());
        machine.start(SessionKind::Stopwatch, None).unwrap();
        f.clock.advance(600);
        f.persist(&machine);

        f.clock.advance(-300);
        let report = f.engine(TimerPolicy::default()).recover().unwrap();
        assert!(matches!(
            report.action,
            RecoveryAction::ForceCompleted {
                error: RecoveryError::ClockSkewDetected { .. }
            }
        ));
        let completed = records(&report.events);
        assert_eq!(completed.len(), 1);
        assert_eq!(completed[0].duration, 600);
        assert!(completed[0].was_interrupted);
        assert_eq!(report.machine.state(), TimerState::Stopped);
    }

    #[test]
    fn implausible_elapsed_force_completes() {
        let f = Fixture::new();
        let mut machine = f.machine(TimerPolicy::default());
        machine.start(SessionKind::Continuous, None).unwrap();
        f.clock.advance(60);
        f.persist(&machine);

        f.clock.advance(3 * 86_400);
        let report = f.engine(TimerPolicy::default()).recover().unwrap();
        assert!(matches!(report.action, RecoveryAction::ForceCompleted { .. }));
        assert_eq!(records(&report.events)[0].duration, 60);
        assert_eq!(report.completed_count(), 1);
    }

    #[test]
    fn finished_session_restores_stopped() {
        let f = Fixture::new();
        let mut machine = f.machine(TimerPolicy::default());
        machine.start(SessionKind::Stopwatch, None).unwrap();
        f.clock.advance(30);
        machine.stop(true).unwrap();
        f.persist(&machine);

        f.clock.advance(30);
        let report = f.engine(TimerPolicy::default()).recover().unwrap();
        assert_eq!(report.action, RecoveryAction::Restored);
        assert_eq!(report.machine.state(), TimerState::Stopped);
        assert!(report.events.is_empty());
    }
}
