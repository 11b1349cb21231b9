//! Per-field conflict resolution between local state and the remote.
//!
//! Command fields (lifecycle, pause timestamps, start, mode, task) are
//! local-wins. Fact fields (server id, server-computed elapsed) are
//! server-wins once acknowledged. Any field with a PENDING or IN_FLIGHT
//! entry is local-wins until that entry is confirmed.
//!
//! Server facts live in their own record under [`FACTS_KEY`], keyed by
//! client session id, so the timer snapshot only ever holds local state.

use std::collections::{BTreeMap, HashSet};

use chrono::{DateTime, Duration, Utc};
use serde::{Deserialize, Serialize};
use tracing::{debug, warn};

use super::types::{MutationPayload, RemoteAck, SessionDescriptor, SyncQueueEntry};
use crate::error::StorageError;
use crate::storage::{get_json, LocalStore};
use crate::timer::{PauseInterval, SessionKind, TimerMode, TimerPolicy, TimerSession};

pub const FACTS_KEY: &str = "sync.facts";

/// Facts are kept for this many sessions, most recently updated first.
const MAX_FACT_RECORDS: usize = 64;

#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash)]
pub enum SessionField {
    StartedAt,
    Mode,
    TaskRef,
    Pauses,
    Lifecycle,
    ServerId,
    ServerElapsed,
}

#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum FieldOwner {
    Local,
    Server,
}

impl SessionField {
    pub fn owner(self) -> FieldOwner {
        match self {
            SessionField::ServerId | SessionField::ServerElapsed => FieldOwner::Server,
            _ => FieldOwner::Local,
        }
    }

    /// Fields whose remote value is stale until `payload` is confirmed.
    pub fn written_by(payload: &MutationPayload) -> &'static [SessionField] {
        match payload {
            MutationPayload::Start { .. } => &[
                SessionField::StartedAt,
                SessionField::Mode,
                SessionField::TaskRef,
                SessionField::Lifecycle,
                SessionField::ServerId,
            ],
            MutationPayload::Pause { .. } | MutationPayload::Resume { .. } => {
                &[SessionField::Pauses, SessionField::ServerElapsed]
            }
            MutationPayload::Stop { .. } => &[SessionField::Lifecycle, SessionField::ServerElapsed],
            MutationPayload::Completed(_) => &[],
        }
    }
}

#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum MergeDecision {
    UseLocal,
    UseRemote,
}

/// Fields touched by unconfirmed entries.
pub fn pending_fields<'a>(entries: impl IntoIterator<Item = &'a SyncQueueEntry>) -> HashSet<SessionField> {
    entries
        .into_iter()
        .filter(|e| e.is_unconfirmed())
        .flat_map(|e| SessionField::written_by(&e.payload).iter().copied())
        .collect()
}

pub fn resolve_field(field: SessionField, pending: &HashSet<SessionField>) -> MergeDecision {
    if pending.contains(&field) {
        return MergeDecision::UseLocal;
    }
    match field.owner() {
        FieldOwner::Local => MergeDecision::UseLocal,
        FieldOwner::Server => MergeDecision::UseRemote,
    }
}

/// Server-owned facts about one session.
#[derive(Debug, Clone, Default, PartialEq, Eq, Serialize, Deserialize)]
pub struct ServerFacts {
    #[serde(default)]
    pub server_id: Option<String>,
    #[serde(default)]
    pub server_elapsed_secs: Option<i64>,
    /// Highest client sequence these facts reflect.
    #[serde(default)]
    pub acked_sequence: u64,
    #[serde(default)]
    pub updated_at: Option<DateTime<Utc>>,
}

impl ServerFacts {
    pub fn from_ack(ack: &RemoteAck, sequence: u64, now: DateTime<Utc>) -> Self {
        Self {
            server_id: ack.id.clone(),
            server_elapsed_secs: ack.elapsed_seconds,
            acked_sequence: ack.client_sequence.unwrap_or(sequence).max(sequence),
            updated_at: Some(now),
        }
    }

    pub fn from_descriptor(descriptor: &SessionDescriptor, now: DateTime<Utc>) -> Self {
        Self {
            server_id: Some(descriptor.id.clone()),
            server_elapsed_secs: Some(descriptor.elapsed_seconds),
            acked_sequence: descriptor.client_sequence.unwrap_or(0),
            updated_at: Some(now),
        }
    }

    /// Drop fields that are still local-wins.
    pub fn without_pending(mut self, pending: &HashSet<SessionField>) -> Self {
        if resolve_field(SessionField::ServerId, pending) == MergeDecision::UseLocal {
            self.server_id = None;
        }
        if resolve_field(SessionField::ServerElapsed, pending) == MergeDecision::UseLocal {
            self.server_elapsed_secs = None;
        }
        self
    }

    fn merge_into(&self, current: &mut ServerFacts) {
        if self.acked_sequence < current.acked_sequence {
            return;
        }
        if self.server_id.is_some() {
            current.server_id = self.server_id.clone();
        }
        if self.server_elapsed_secs.is_some() {
            current.server_elapsed_secs = self.server_elapsed_secs;
        }
        current.acked_sequence = self.acked_sequence;
        current.updated_at = self.updated_at.or(current.updated_at);
    }
}

pub fn load_facts(store: &dyn LocalStore) -> Result<BTreeMap<String, ServerFacts>, StorageError> {
    Ok(get_json(store, FACTS_KEY)?.unwrap_or_default())
}

pub fn facts_for(store: &dyn LocalStore, entity_id: &str) -> Result<Option<ServerFacts>, StorageError> {
    Ok(load_facts(store)?.remove(entity_id))
}

/// Merge facts for one session. Facts older than what is stored are ignored.
pub fn record_facts(
    store: &dyn LocalStore,
    entity_id: &str,
    facts: &ServerFacts,
) -> Result<ServerFacts, StorageError> {
    let mut merged = ServerFacts::default();
    store.update(FACTS_KEY, &mut |raw| {
        let mut map: BTreeMap<String, ServerFacts> = match raw {
            Some(raw) => serde_json::from_str(&raw)?,
            None => BTreeMap::new(),
        };
        let current = map.entry(entity_id.to_string()).or_default();
        facts.merge_into(current);
        merged = current.clone();
        prune(&mut map);
        Ok(serde_json::to_string(&map)?)
    })?;
    debug!(entity_id, acked_sequence = merged.acked_sequence, "Recorded server facts");
    Ok(merged)
}

fn prune(map: &mut BTreeMap<String, ServerFacts>) {
    if map.len() <= MAX_FACT_RECORDS {
        return;
    }
    let mut by_age: Vec<(Option<DateTime<Utc>>, String)> = map
        .iter()
        .map(|(id, facts)| (facts.updated_at, id.clone()))
        .collect();
    by_age.sort();
    let excess = map.len() - MAX_FACT_RECORDS;
    for (_, id) in by_age.into_iter().take(excess) {
        map.remove(&id);
    }
}

/// Outcome of comparing local state with `GET /timer/active`.
#[derive(Debug, Clone, PartialEq, Eq)]
pub enum ActiveReconciliation {
    /// Neither side has an active session.
    InSync,
    /// Local lifecycle wins; nothing to apply.
    KeepLocal,
    /// Same session on both sides; record these server facts.
    ApplyFacts(ServerFacts),
    /// The remote has an active session this client does not know about.
    RemoteOnly(SessionDescriptor),
}

/// `local` is the machine's current or last session, finished or not.
pub fn reconcile_active(
    local: Option<&TimerSession>,
    remote: Option<&SessionDescriptor>,
    pending: &HashSet<SessionField>,
    now: DateTime<Utc>,
) -> ActiveReconciliation {
    let local_active = local.filter(|s| !s.is_finished());
    let Some(remote) = remote else {
        return if local_active.is_some() {
            ActiveReconciliation::KeepLocal
        } else {
            ActiveReconciliation::InSync
        };
    };

    let same_session = local.is_some_and(|s| {
        remote.client_session_id.as_deref() == Some(s.id.as_str()) || remote.id == s.id
    });
    match (local_active, same_session) {
        (Some(_), true) => {
            ActiveReconciliation::ApplyFacts(ServerFacts::from_descriptor(remote, now).without_pending(pending))
        }
        (Some(session), false) => {
            warn!(
                local_session = %session.id,
                remote_session = %remote.id,
                "Remote reports a different active session; keeping local"
            );
            ActiveReconciliation::KeepLocal
        }
        // Stopped locally; the stop has not reached the remote yet.
        (None, true) => ActiveReconciliation::KeepLocal,
        (None, false) if pending.contains(&SessionField::Lifecycle) => ActiveReconciliation::KeepLocal,
        (None, false) => ActiveReconciliation::RemoteOnly(remote.clone()),
    }
}

/// Local session mirroring a remote-only session. Pause history before
/// adoption is summarized as one closed interval so that derived elapsed
/// matches the server's value.
pub fn session_from_descriptor(
    descriptor: &SessionDescriptor,
    policy: &TimerPolicy,
    now: DateTime<Utc>,
) -> TimerSession {
    let mode = match (descriptor.kind, descriptor.mode) {
        (SessionKind::Pomodoro, Some(TimerMode::Continuous) | None) => TimerMode::Work,
        (SessionKind::Pomodoro, Some(mode)) => mode,
        _ => TimerMode::Continuous,
    };
    let planned = if descriptor.kind.is_countdown() {
        policy.duration_for(mode)
    } else {
        None
    };
    let id = descriptor
        .client_session_id
        .clone()
        .unwrap_or_else(|| descriptor.id.clone());

    let mut session = TimerSession::new(
        descriptor.kind,
        mode,
        descriptor.task_id.clone(),
        descriptor.started_at,
        planned,
    );
    session.id = id;

    let as_of = descriptor.pause_started_at.unwrap_or(now).max(descriptor.started_at);
    let wall = (as_of - descriptor.started_at).num_seconds();
    let gap = wall - descriptor.elapsed_seconds.clamp(0, wall);
    if gap > 0 {
        session.pause_intervals.push(PauseInterval {
            start: descriptor.started_at,
            end: Some(descriptor.started_at + Duration::seconds(gap)),
        });
    }
    if let Some(pause_started_at) = descriptor.pause_started_at {
        session.pause_intervals.push(PauseInterval {
            start: pause_started_at.max(descriptor.started_at),
            end: None,
        });
    }
    session
}
