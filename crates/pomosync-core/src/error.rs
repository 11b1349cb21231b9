//! Core error types for pomosync-core.
//!
//! Timer transition errors are returned synchronously to the caller. Sync
//! failures never reach the command path; they only move queue entries and
//! show up in [`crate::SyncState`].

use std::path::PathBuf;
use thiserror::Error;

use crate::timer::{SessionKind, TimerState};

/// Core error type for pomosync-core.
#[derive(Error, Debug)]
pub enum CoreError {
    /// Illegal timer command
    #[error("Timer error: {0}")]
    Timer(#[from] TimerError),

    /// Local persistence errors
    #[error("Storage error: {0}")]
    Storage(#[from] StorageError),

    /// Configuration-related errors
    #[error("Configuration error: {0}")]
    Config(#[from] ConfigError),

    /// Recovery-related errors
    #[error("Recovery error: {0}")]
    Recovery(#[from] RecoveryError),

    /// Remote service errors surfaced outside the queue (e.g. `GET /timer/active`)
    #[error("Sync error: {0}")]
    Sync(#[from] SyncFailure),

    /// The timer driver task is gone
    #[error("Timer driver has stopped")]
    DriverStopped,
}

/// Errors returned by timer commands.
#[derive(Error, Debug, Clone, PartialEq, Eq)]
pub enum TimerError {
    /// The command is not legal in the current state.
    #[error("cannot {command} while {state}")]
    InvalidTransition {
        command: &'static str,
        state: TimerState,
    },

    /// The command is not legal for the active session's kind.
    #[error("cannot {command} a {kind} session")]
    UnsupportedKind {
        command: &'static str,
        kind: SessionKind,
    },

    /// A session is already running or paused on this client.
    #[error("session {active_session_id} is already active")]
    SessionConflict { active_session_id: String },
}

impl TimerError {
    /// Whether this error reports an illegal transition (state or kind).
    pub fn is_invalid_transition(&self) -> bool {
        matches!(
            self,
            TimerError::InvalidTransition { .. } | TimerError::UnsupportedKind { .. }
        )
    }
}

/// Local storage errors.
#[derive(Error, Debug)]
pub enum StorageError {
    #[error("SQLite error: {0}")]
    Sqlite(#[from] rusqlite::Error),

    #[error("JSON error: {0}")]
    Json(#[from] serde_json::Error),

    #[error("IO error: {0}")]
    Io(#[from] std::io::Error),

    #[error("Cannot determine data directory")]
    DataDir,

    #[error("Store lock poisoned")]
    Poisoned,
}

/// Configuration-specific errors.
#[derive(Error, Debug)]
pub enum ConfigError {
    /// Failed to load configuration
    #[error("Failed to load configuration from {path}: {message}")]
    LoadFailed { path: PathBuf, message: String },

    /// Failed to save configuration
    #[error("Failed to save configuration to {path}: {message}")]
    SaveFailed { path: PathBuf, message: String },

    /// Invalid configuration value
    #[error("Invalid configuration value for '{key}': {message}")]
    InvalidValue { key: String, message: String },

    /// Unknown configuration key
    #[error("Unknown configuration key: {0}")]
    UnknownKey(String),

    /// Data directory unavailable
    #[error("Storage error: {0}")]
    Storage(#[from] StorageError),
}

/// Outcome classes of a failed remote call.
#[derive(Error, Debug, Clone, PartialEq, Eq)]
pub enum SyncFailure {
    /// Network, timeout or 5xx-class failure. Retried with backoff.
    #[error("recoverable sync failure: {0}")]
    Recoverable(String),

    /// The remote rejected the payload. Surfaced, never auto-retried.
    #[error("remote rejected mutation ({status}): {message}")]
    NonRecoverable { status: u16, message: String },
}

impl SyncFailure {
    pub fn is_recoverable(&self) -> bool {
        matches!(self, SyncFailure::Recoverable(_))
    }
}

/// Recovery errors.
#[derive(Error, Debug, Clone, PartialEq, Eq)]
pub enum RecoveryError {
    /// Recovered elapsed time is negative or implausibly large.
    #[error("clock skew detected for session {session_id}: {detail}")]
    ClockSkewDetected { session_id: String, detail: String },
}

/// Result type alias for CoreError
pub type Result<T, E = CoreError> = std::result::Result<T, E>;
