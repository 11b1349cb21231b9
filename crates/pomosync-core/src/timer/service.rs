//! Timer service.
//!
//! Wraps the state machine with persistence. Every accepted command or
//! tick that produced events writes the new snapshot and the matching
//! mutations in one atomic batch, then records completed sessions in the
//! history and broadcasts the events. A command applies to a copy of the
//! machine and is kept as soon as the batch lands; a failed history write
//! is logged and does not undo the transition.

use std::sync::Arc;

use tokio::sync::broadcast;
use tracing::{debug, error, info};

use super::driver::{TimerCommand, TimerOutcome};
use super::machine::{TimerState, TimerStateMachine, TimerView};
use super::policy::TimerPolicy;
use super::session::TimerSession;
use crate::error::{CoreError, StorageError};
use crate::events::TimerEvent;
use crate::storage::LocalStore;
use crate::sync::{Mutation, SharedQueue};

/// Key of the persisted [`super::TimerSnapshot`].
pub const SNAPSHOT_KEY: &str = "timer.snapshot";

const EVENT_CAPACITY: usize = 64;

pub struct TimerService {
    machine: TimerStateMachine,
    store: Arc<dyn LocalStore>,
    queue: SharedQueue,
    events: broadcast::Sender<TimerEvent>,
    checkpoint_every_ticks: u32,
    ticks_since_checkpoint: u32,
}

impl TimerService {
    pub fn new(
        machine: TimerStateMachine,
        store: Arc<dyn LocalStore>,
        queue: SharedQueue,
        checkpoint_every_ticks: u32,
    ) -> Self {
        let (events, _) = broadcast::channel(EVENT_CAPACITY);
        Self {
            machine,
            store,
            queue,
            events,
            checkpoint_every_ticks,
            ticks_since_checkpoint: 0,
        }
    }

    pub fn machine(&self) -> &TimerStateMachine {
        &self.machine
    }

    pub fn queue(&self) -> &SharedQueue {
        &self.queue
    }

    pub fn view(&self) -> TimerView {
        self.machine.view()
    }

    pub fn subscribe(&self) -> broadcast::Receiver<TimerEvent> {
        self.events.subscribe()
    }

    pub(crate) fn event_sender(&self) -> broadcast::Sender<TimerEvent> {
        self.events.clone()
    }

    pub fn set_policy(&mut self, policy: TimerPolicy) {
        self.machine.set_policy(policy);
    }

    pub fn handle(&mut self, command: TimerCommand) -> Result<TimerOutcome, CoreError> {
        let read_only = matches!(command, TimerCommand::View);
        let mut next = self.machine.clone();
        let events = match command {
            TimerCommand::Start { kind, task_ref } => next.start(kind, task_ref)?,
            TimerCommand::Pause => next.pause()?,
            TimerCommand::Resume => next.resume()?,
            TimerCommand::SkipToNext => next.skip_to_next()?,
            TimerCommand::Split => next.split()?,
            TimerCommand::Stop { was_completed } => next.stop(was_completed)?,
            TimerCommand::Reset => next.reset(),
            TimerCommand::View => Vec::new(),
        };
        if !read_only {
            self.commit(&next, &events)?;
            self.machine = next;
        }
        Ok(TimerOutcome {
            events,
            view: self.machine.view(),
        })
    }

    /// One driver tick. Writes a checkpoint every `checkpoint_every_ticks`
    /// ticks even when nothing changed.
    pub fn tick(&mut self) -> Result<Vec<TimerEvent>, StorageError> {
        if self.machine.state() != TimerState::Running {
            return Ok(Vec::new());
        }
        let mut next = self.machine.clone();
        let events = next.tick();
        if !events.is_empty() {
            self.commit(&next, &events)?;
            self.machine = next;
            return Ok(events);
        }
        self.machine = next;
        self.ticks_since_checkpoint += 1;
        if self.checkpoint_every_ticks > 0 && self.ticks_since_checkpoint >= self.checkpoint_every_ticks {
            self.checkpoint()?;
        }
        Ok(events)
    }

    /// Persist events produced outside the command path, such as
    /// completions driven by recovery.
    pub fn absorb(&mut self, events: &[TimerEvent]) -> Result<(), StorageError> {
        if events.is_empty() {
            return Ok(());
        }
        let machine = self.machine.clone();
        self.commit(&machine, events)
    }

    /// Take over a session known only to the remote. No mutations are
    /// queued for it.
    pub fn adopt(&mut self, session: TimerSession) -> Result<(), CoreError> {
        let mut next = self.machine.clone();
        let session_id = session.id.clone();
        next.adopt(session)?;
        self.commit(&next, &[])?;
        self.machine = next;
        info!(session_id = %session_id, "Adopted remote session");
        Ok(())
    }

    pub fn checkpoint(&mut self) -> Result<(), StorageError> {
        let snapshot = serde_json::to_string(&self.machine.snapshot())?;
        self.store.put(SNAPSHOT_KEY, &snapshot)?;
        self.ticks_since_checkpoint = 0;
        debug!("Timer checkpoint written");
        Ok(())
    }

    // ── Internal ─────────────────────────────────────────────────────

    fn commit(&mut self, machine: &TimerStateMachine, events: &[TimerEvent]) -> Result<(), StorageError> {
        let snapshot = serde_json::to_string(&machine.snapshot())?;
        let mutations: Vec<Mutation> = events.iter().flat_map(Mutation::from_event).collect();
        let now = machine.clock().now();
        self.queue
            .append_with(mutations, now, &[(SNAPSHOT_KEY, snapshot)])?;
        self.ticks_since_checkpoint = 0;

        for event in events {
            if let TimerEvent::SessionCompleted(record) = event {
                if let Err(err) = self.store.record_completed(record) {
                    error!(
                        session_id = %record.session_id,
                        error = %err,
                        "Failed to record completed session in history"
                    );
                    continue;
                }
                info!(
                    session_id = %record.session_id,
                    mode = %record.mode,
                    duration = record.duration,
                    was_completed = record.was_completed,
                    "Session completed"
                );
            }
        }
        for event in events {
            // No receivers is fine.
            let _ = self.events.send(event.clone());
        }
        Ok(())
    }
}
