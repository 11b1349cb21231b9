mod config;
pub mod database;
pub mod memory;

pub use config::{Config, RecoveryConfig, SyncConfig, TimerConfig};
pub use database::Database;
pub use memory::MemoryStore;

use std::path::PathBuf;

use serde::de::DeserializeOwned;
use serde::Serialize;

use crate::error::StorageError;
use crate::events::CompletedSession;

/// Durable key-value port owned by the core.
///
/// `update` and `put_batch` are atomic: either every write lands or none do.
pub trait LocalStore: Send + Sync {
    fn get(&self, key: &str) -> Result<Option<String>, StorageError>;

    fn put(&self, key: &str, value: &str) -> Result<(), StorageError>;

    fn delete(&self, key: &str) -> Result<(), StorageError>;

    /// Read-modify-write of a single key. Returns the stored value.
    fn update(
        &self,
        key: &str,
        apply: &mut dyn FnMut(Option<String>) -> Result<String, StorageError>,
    ) -> Result<String, StorageError>;

    fn put_batch(&self, entries: &[(&str, String)]) -> Result<(), StorageError>;

    /// Append to the completed-session history. Re-recording the same
    /// session id replaces the earlier row.
    fn record_completed(&self, record: &CompletedSession) -> Result<(), StorageError>;

    /// Most recent completed sessions, newest first.
    fn recent_completed(&self, limit: usize) -> Result<Vec<CompletedSession>, StorageError>;
}

/// Read and decode a JSON value.
pub fn get_json<T: DeserializeOwned>(
    store: &dyn LocalStore,
    key: &str,
) -> Result<Option<T>, StorageError> {
    match store.get(key)? {
        Some(raw) => Ok(Some(serde_json::from_str(&raw)?)),
        None => Ok(None),
    }
}

/// Encode and write a JSON value.
pub fn put_json<T: Serialize>(store: &dyn LocalStore, key: &str, value: &T) -> Result<(), StorageError> {
    store.put(key, &serde_json::to_string(value)?)
}

/// Returns `~/.config/pomosync[-dev]/` based on POMOSYNC_ENV.
///
/// Set POMOSYNC_ENV=dev to use development data directory.
///
/// # Errors
/// Returns an error if creating the config directory fails.
pub fn data_dir() -> Result<PathBuf, StorageError> {
    let base_dir = dirs::home_dir()
        .unwrap_or_else(|| PathBuf::from("."))
        .join(".config");

    let env = std::env::var("POMOSYNC_ENV").unwrap_or_else(|_| "production".to_string());

    let dir = if env == "dev" {
        base_dir.join("pomosync-dev")
    } else {
        base_dir.join("pomosync")
    };

    std::fs::create_dir_all(&dir)?;
    Ok(dir)
}
