//! # pomosync core library
//!
//! Session timer state machine with crash recovery and an offline mutation
//! queue that reconciles local timer changes with a remote service of record.
//!
//! ## Architecture
//!
//! - **Clock**: the only component allowed to read wall-clock time
//! - **Timer**: a pure state machine over sessions; elapsed time is always
//!   re-derived from timestamps, never accumulated
//! - **Recovery**: rebuilds the machine on startup from the last snapshot,
//!   completing sessions that ran out while the process was down
//! - **Sync**: durable mutation queue drained against the remote service with
//!   backoff, cancellation and per-field conflict resolution
//! - **Storage**: SQLite key-value store and TOML configuration
//!
//! ## Key Components
//!
//! - [`TimerStateMachine`]: timer state machine
//! - [`SessionRecoveryEngine`]: cold-start reconstruction
//! - [`MutationQueue`]: ordered log of unconfirmed local changes
//! - [`SyncEngine`]: drains the queue against a [`RemoteTimerService`]
//! - [`SyncStatusProjector`]: observable [`SyncState`]

pub mod clock;
pub mod error;
pub mod events;
pub mod recovery;
pub mod storage;
pub mod sync;
pub mod timer;

pub use clock::{Clock, ManualClock, SystemClock};
pub use error::{ConfigError, CoreError, RecoveryError, StorageError, SyncFailure, TimerError};
pub use events::{CompletedSession, TimerEvent};
pub use recovery::{RecoveryAction, RecoveryReport, SessionRecoveryEngine};
pub use storage::{Config, Database, LocalStore, MemoryStore};
pub use sync::{
    Connectivity, ConnectivityWatch, HttpRemote, MutationQueue, RemoteTimerService, SharedQueue,
    SyncEngine, SyncHandle, SyncState, SyncStatus, SyncStatusProjector,
};
pub use timer::{
    SessionKind, TimerMode, TimerPolicy, TimerService, TimerSession, TimerSnapshot, TimerState,
    TimerStateMachine, TimerView,
};
