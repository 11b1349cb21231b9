//! Tick driver.
//!
//! One task owns the [`TimerService`] and selects over a [`Ticker`] and a
//! command channel, so ticks and commands are never applied concurrently.
//! Commands win when both are ready.

use std::time::Duration;

use async_trait::async_trait;
use tokio::sync::{broadcast, mpsc, oneshot};
use tokio::task::JoinHandle;
use tokio::time::{Interval, MissedTickBehavior};
use tracing::{debug, error, info};

use super::machine::TimerView;
use super::service::TimerService;
use super::session::SessionKind;
use crate::error::CoreError;
use crate::events::TimerEvent;

/// Source of tick signals.
#[async_trait]
pub trait Ticker: Send {
    async fn next_tick(&mut self);
}

/// Production ticker backed by a tokio interval. Missed ticks are skipped;
/// elapsed time is derived from timestamps, not tick counts.
pub struct IntervalTicker {
    interval: Interval,
}

impl IntervalTicker {
    pub fn new(period: Duration) -> Self {
        let mut interval = tokio::time::interval(period);
        interval.set_missed_tick_behavior(MissedTickBehavior::Skip);
        Self { interval }
    }

    pub fn every_second() -> Self {
        Self::new(Duration::from_secs(1))
    }
}

#[async_trait]
impl Ticker for IntervalTicker {
    async fn next_tick(&mut self) {
        self.interval.tick().await;
    }
}

#[derive(Debug, Clone, PartialEq, Eq)]
pub enum TimerCommand {
    Start {
        kind: SessionKind,
        task_ref: Option<String>,
    },
    Pause,
    Resume,
    SkipToNext,
    Split,
    Stop {
        was_completed: bool,
    },
    Reset,
    /// Read the current view without changing anything.
    View,
}

/// What an accepted command produced.
#[derive(Debug, Clone)]
pub struct TimerOutcome {
    pub events: Vec<TimerEvent>,
    pub view: TimerView,
}

pub struct TimerRequest {
    command: TimerCommand,
    reply: oneshot::Sender<Result<TimerOutcome, CoreError>>,
}

/// Cloneable handle to a running driver.
#[derive(Clone)]
pub struct TimerHandle {
    requests: mpsc::Sender<TimerRequest>,
    events: broadcast::Sender<TimerEvent>,
}

impl TimerHandle {
    pub async fn send(&self, command: TimerCommand) -> Result<TimerOutcome, CoreError> {
        let (reply, response) = oneshot::channel();
        self.requests
            .send(TimerRequest { command, reply })
            .await
            .map_err(|_| CoreError::DriverStopped)?;
        response.await.map_err(|_| CoreError::DriverStopped)?
    }

    pub async fn view(&self) -> Result<TimerView, CoreError> {
        Ok(self.send(TimerCommand::View).await?.view)
    }

    pub fn subscribe(&self) -> broadcast::Receiver<TimerEvent> {
        self.events.subscribe()
    }
}

/// Run until every [`TimerHandle`] is dropped, then hand the service back.
pub async fn run_driver<T: Ticker>(
    mut service: TimerService,
    mut ticker: T,
    mut requests: mpsc::Receiver<TimerRequest>,
) -> TimerService {
    info!("Timer driver started");
    loop {
        tokio::select! {
            biased;
            request = requests.recv() => {
                let Some(TimerRequest { command, reply }) = request else {
                    break;
                };
                let result = service.handle(command);
                if let Err(err) = &result {
                    debug!(error = %err, "Timer command rejected");
                }
                let _ = reply.send(result);
            }
            _ = ticker.next_tick() => {
                if let Err(err) = service.tick() {
                    error!(error = %err, "Failed to persist timer tick");
                }
            }
        }
    }
    info!("Timer driver stopped");
    service
}

pub fn spawn_driver<T: Ticker + 'static>(
    service: TimerService,
    ticker: T,
) -> (TimerHandle, JoinHandle<TimerService>) {
    let (tx, rx) = mpsc::channel(32);
    let handle = TimerHandle {
        requests: tx,
        events: service.event_sender(),
    };
    let task = tokio::spawn(run_driver(service, ticker, rx));
    (handle, task)
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::clock::ManualClock;
    use crate::storage::MemoryStore;
    use crate::sync::{MutationQueue, SharedQueue};
    use crate::timer::{TimerPolicy, TimerState, TimerStateMachine};
    use crate::TimerError;
    use std::sync::Arc;

    /// Ticks once per permit sent on the channel; pends when none is queued.
    struct ChannelTicker {
        rx: mpsc::UnboundedReceiver<()>,
    }

    #[async_trait]
    impl Ticker for ChannelTicker {
        async fn next_tick(&mut self) {
            if self.rx.recv().await.is_none() {
                std::future::pending::<()>().await;
            }
        }
    }

    fn spawn(policy: TimerPolicy) -> (TimerHandle, JoinHandle<TimerService>, ManualClock, mpsc::UnboundedSender<()>) {
        let store = Arc::new(MemoryStore::new());
        let clock = ManualClock::at_epoch_secs(1_700_000_000);
        let machine = TimerStateMachine::new(policy, Arc::new(clock.clone()));
        let queue = SharedQueue::new(MutationQueue::open(store.clone()).unwrap());
        let service = TimerService::new(machine, store, queue, 30);
        let (tick_tx, tick_rx) = mpsc::unbounded_channel();
        let (handle, task) = spawn_driver(service, ChannelTicker { rx: tick_rx });
        (handle, task, clock, tick_tx)
    }

    #[tokio::test]
    async fn commands_round_trip_through_driver() {
        let (handle, task, clock, _ticks) = spawn(TimerPolicy::default());
        let outcome = handle
            .send(TimerCommand::Start {
                kind: SessionKind::Pomodoro,
                task_ref: None,
            })
            .await
            .unwrap();
        assert_eq!(outcome.view.state, TimerState::Running);

        clock.advance(10);
        let view = handle.view().await.unwrap();
        assert_eq!(view.elapsed_secs, 10);

        let err = handle.send(TimerCommand::Resume).await.unwrap_err();
        assert!(matches!(err, CoreError::Timer(TimerError::InvalidTransition { .. })));

        drop(handle);
        let service = task.await.unwrap();
        assert_eq!(service.machine().state(), TimerState::Running);
    }

    #[tokio::test]
    async fn ticks_drive_completion_and_broadcast() {
        let policy = TimerPolicy {
            work_secs: 5,
            ..TimerPolicy::default()
        };
        let (handle, task, clock, ticks) = spawn(policy);
        let mut events = handle.subscribe();
        handle
            .send(TimerCommand::Start {
                kind: SessionKind::Pomodoro,
                task_ref: None,
            })
            .await
            .unwrap();
        assert!(matches!(events.recv().await.unwrap(), TimerEvent::SessionStarted { .. }));

        clock.advance(5);
        ticks.send(()).unwrap();
        match events.recv().await.unwrap() {
            TimerEvent::SessionCompleted(record) => {
                assert_eq!(record.duration, 5);
                assert!(record.was_completed);
            }
            other => panic!("unexpected event {other:?}"),
        }
        assert_eq!(handle.view().await.unwrap().state, TimerState::Idle);

        drop(handle);
        task.await.unwrap();
    }
}
