//! Offline-first replication of timer changes.

mod backoff;
mod connectivity;
mod engine;
mod http;
mod queue;
pub mod reconcile;
mod remote;
mod status;
pub mod types;

pub use backoff::Backoff;
pub use connectivity::{Connectivity, ConnectivityWatch};
pub use engine::{DrainReport, SyncCommand, SyncEngine, SyncHandle, SyncSettings};
pub use http::{classify_status, HttpRemote};
pub use queue::{MutationQueue, Resolution, SharedQueue, QUEUE_KEY};
pub use reconcile::{ActiveReconciliation, ServerFacts, SessionField};
pub use remote::{
    apply_entry, PauseRequest, RemoteTimerService, ResumeRequest, SessionRecordRequest,
    StartRequest, StopRequest,
};
pub use status::{project, EngineView, SyncState, SyncStatus, SyncStatusProjector};
pub use types::{
    EntityType, EntryStatus, Mutation, MutationPayload, QueueStats, RemoteAck, SessionDescriptor,
    SyncQueueEntry,
};
