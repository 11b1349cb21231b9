//! Shared fixtures for integration tests.

#![allow(dead_code)]

use std::collections::{HashSet, VecDeque};
use std::sync::{Arc, Mutex, MutexGuard};
use std::time::Duration;

use async_trait::async_trait;
use chrono::{DateTime, Utc};
use pomosync_core::sync::{
    PauseRequest, RemoteAck, ResumeRequest, SessionDescriptor, SessionRecordRequest, StartRequest,
    StopRequest, SyncSettings,
};
use pomosync_core::{
    Clock, ConnectivityWatch, LocalStore, ManualClock, RemoteTimerService, SharedQueue, SyncEngine,
    SyncFailure, TimerPolicy, TimerService, TimerStateMachine,
};

pub const START: i64 = 1_700_000_000;

pub fn at(secs: i64) -> DateTime<Utc> {
    DateTime::from_timestamp(START + secs, 0).unwrap()
}

// ============================================================================
// Fake remote service
// ============================================================================

/// One write the server applied, first delivery only.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct Applied {
    pub op: &'static str,
    pub session_id: String,
    pub sequence: u64,
}

#[derive(Default)]
pub struct ServerState {
    pub applied: Vec<Applied>,
    pub replays: usize,
    pub active: Option<SessionDescriptor>,
    pub records: Vec<SessionRecordRequest>,
    pub failures: VecDeque<SyncFailure>,
    pub delays: VecDeque<Duration>,
    seen: HashSet<(String, u64)>,
    next_id: u32,
}

/// In-memory stand-in for the remote timer service. Dedupes replays by
/// `(clientSessionId, clientSequence)`.
#[derive(Default)]
pub struct FakeServer {
    state: Mutex<ServerState>,
}

impl FakeServer {
    pub fn new() -> Arc<Self> {
        Arc::new(Self::default())
    }

    pub fn state(&self) -> MutexGuard<'_, ServerState> {
        self.state.lock().unwrap()
    }

    pub fn fail_next(&self, failure: SyncFailure) {
        self.state().failures.push_back(failure);
    }

    pub fn delay_next(&self, delay: Duration) {
        self.state().delays.push_back(delay);
    }

    pub fn set_active(&self, descriptor: SessionDescriptor) {
        self.state().active = Some(descriptor);
    }

    pub fn applied(&self) -> Vec<Applied> {
        self.state().applied.clone()
    }

    pub fn applied_ops(&self) -> Vec<&'static str> {
        self.state().applied.iter().map(|a| a.op).collect()
    }

    async fn call<T: Send>(
        &self,
        op: &'static str,
        session_id: &str,
        sequence: u64,
        apply: impl FnOnce(&mut ServerState) -> T + Send,
    ) -> Result<T, SyncFailure> {
        let delay = self.state().delays.pop_front();
        if let Some(delay) = delay {
            tokio::time::sleep(delay).await;
        }
        let mut state = self.state();
        if let Some(failure) = state.failures.pop_front() {
            return Err(failure);
        }
        if state.seen.insert((session_id.to_string(), sequence)) {
            state.applied.push(Applied {
                op,
                session_id: session_id.to_string(),
                sequence,
            });
        } else {
            state.replays += 1;
        }
        Ok(apply(&mut state))
    }
}

fn ack(state: &ServerState, sequence: u64) -> RemoteAck {
    RemoteAck {
        id: state.active.as_ref().map(|a| a.id.clone()),
        client_sequence: Some(sequence),
        elapsed_seconds: None,
    }
}

fn is_active(state: &ServerState, session_id: &str) -> bool {
    state
        .active
        .as_ref()
        .is_some_and(|a| a.client_session_id.as_deref() == Some(session_id))
}

#[async_trait]
impl RemoteTimerService for FakeServer {
    async fn start(&self, request: &StartRequest) -> Result<SessionDescriptor, SyncFailure> {
        self.call("start", &request.client_session_id, request.client_sequence, |state| {
            if !is_active(state, &request.client_session_id) {
                state.next_id += 1;
                state.active = Some(SessionDescriptor {
                    id: format!("srv-{}", state.next_id),
                    client_session_id: Some(request.client_session_id.clone()),
                    task_id: request.task_id.clone(),
                    kind: request.kind,
                    mode: Some(request.mode),
                    started_at: request.started_at,
                    pause_started_at: None,
                    elapsed_seconds: 0,
                    client_sequence: Some(request.client_sequence),
                });
            }
            state.active.clone().unwrap()
        })
        .await
    }

    async fn pause(&self, request: &PauseRequest) -> Result<RemoteAck, SyncFailure> {
        self.call("pause", &request.client_session_id, request.client_sequence, |state| {
            if is_active(state, &request.client_session_id) {
                if let Some(active) = state.active.as_mut() {
                    active.pause_started_at = Some(request.pause_started_at);
                }
            }
            ack(state, request.client_sequence)
        })
        .await
    }

    async fn resume(&self, request: &ResumeRequest) -> Result<RemoteAck, SyncFailure> {
        self.call("resume", &request.client_session_id, request.client_sequence, |state| {
            if is_active(state, &request.client_session_id) {
                if let Some(active) = state.active.as_mut() {
                    active.pause_started_at = None;
                }
            }
            ack(state, request.client_sequence)
        })
        .await
    }

    async fn stop(&self, request: &StopRequest) -> Result<RemoteAck, SyncFailure> {
        self.call("stop", &request.client_session_id, request.client_sequence, |state| {
            let ack = ack(state, request.client_sequence);
            if is_active(state, &request.client_session_id) {
                state.active = None;
            }
            ack
        })
        .await
    }

    async fn record_session(&self, request: &SessionRecordRequest) -> Result<RemoteAck, SyncFailure> {
        self.call("completed", &request.client_session_id, request.client_sequence, |state| {
            state.records.push(request.clone());
            RemoteAck {
                id: None,
                client_sequence: Some(request.client_sequence),
                elapsed_seconds: Some(request.elapsed_seconds as i64),
            }
        })
        .await
    }

    async fn active(&self) -> Result<Option<SessionDescriptor>, SyncFailure> {
        Ok(self.state().active.clone())
    }
}

// ============================================================================
// Wiring
// ============================================================================

pub struct Stack {
    pub store: Arc<dyn LocalStore>,
    pub clock: ManualClock,
    pub queue: SharedQueue,
    pub service: TimerService,
}

impl Stack {
    pub fn new(store: Arc<dyn LocalStore>, clock: ManualClock, policy: TimerPolicy) -> Self {
        let machine = TimerStateMachine::new(policy, Arc::new(clock.clone()));
        Self::with_machine(store, clock, machine)
    }

    pub fn with_machine(store: Arc<dyn LocalStore>, clock: ManualClock, machine: TimerStateMachine) -> Self {
        let queue = SharedQueue::open(store.clone()).unwrap();
        let service = TimerService::new(machine, store.clone(), queue.clone(), 30);
        Self {
            store,
            clock,
            queue,
            service,
        }
    }

    pub fn engine(&self, remote: Arc<FakeServer>, connectivity: ConnectivityWatch) -> SyncEngine {
        let clock: Arc<dyn Clock> = Arc::new(self.clock.clone());
        SyncEngine::new(
            self.queue.clone(),
            remote,
            self.store.clone(),
            clock,
            connectivity,
            SyncSettings::default(),
        )
    }

    pub fn queued_ops(&self) -> Vec<&'static str> {
        self.queue
            .with(|q| q.entries().iter().map(|e| e.payload.op()).collect())
            .unwrap()
    }
}
