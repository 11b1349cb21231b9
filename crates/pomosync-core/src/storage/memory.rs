//! In-memory local store for tests and ephemeral runs.

use std::collections::{BTreeMap, HashMap};
use std::sync::{Mutex, MutexGuard};

use super::LocalStore;
use crate::error::StorageError;
use crate::events::CompletedSession;

#[derive(Debug, Default)]
struct Inner {
    kv: BTreeMap<String, String>,
    history: HashMap<String, CompletedSession>,
}

#[derive(Debug, Default)]
pub struct MemoryStore {
    inner: Mutex<Inner>,
}

impl MemoryStore {
    pub fn new() -> Self {
        Self::default()
    }

    fn lock(&self) -> Result<MutexGuard<'_, Inner>, StorageError> {
        self.inner.lock().map_err(|_| StorageError::Poisoned)
    }
}

impl LocalStore for MemoryStore {
    fn get(&self, key: &str) -> Result<Option<String>, StorageError> {
        Ok(self.lock()?.kv.get(key).cloned())
    }

    fn put(&self, key: &str, value: &str) -> Result<(), StorageError> {
        self.lock()?.kv.insert(key.to_string(), value.to_string());
        Ok(())
    }

    fn delete(&self, key: &str) -> Result<(), StorageError> {
        self.lock()?.kv.remove(key);
        Ok(())
    }

    fn update(
        &self,
        key: &str,
        apply: &mut dyn FnMut(Option<String>) -> Result<String, StorageError>,
    ) -> Result<String, StorageError> {
        let mut inner = self.lock()?;
        let next = apply(inner.kv.get(key).cloned())?;
        inner.kv.insert(key.to_string(), next.clone());
        Ok(next)
    }

    fn put_batch(&self, entries: &[(&str, String)]) -> Result<(), StorageError> {
        let mut inner = self.lock()?;
        for (key, value) in entries {
            inner.kv.insert(key.to_string(), value.clone());
        }
        Ok(())
    }

    fn record_completed(&self, record: &CompletedSession) -> Result<(), StorageError> {
        self.lock()?
            .history
            .insert(record.session_id.clone(), record.clone());
        Ok(())
    }

    fn recent_completed(&self, limit: usize) -> Result<Vec<CompletedSession>, StorageError> {
        let inner = self.lock()?;
        let mut records: Vec<CompletedSession> = inner.history.values().cloned().collect();
        records.sort_by(|a, b| b.ended_at.cmp(&a.ended_at));
        records.truncate(limit);
        Ok(records)
    }
}

/// Store that fails `update` or `record_completed` a set number of times.
#[cfg(test)]
#[derive(Debug, Default)]
pub(crate) struct FlakyStore {
    inner: MemoryStore,
    failing_updates: std::sync::atomic::AtomicUsize,
    failing_records: std::sync::atomic::AtomicUsize,
}

#[cfg(test)]
impl FlakyStore {
    pub(crate) fn fail_updates(&self, times: usize) {
        self.failing_updates
            .store(times, std::sync::atomic::Ordering::SeqCst);
    }

    pub(crate) fn fail_records(&self, times: usize) {
        self.failing_records
            .store(times, std::sync::atomic::Ordering::SeqCst);
    }

    fn trip(counter: &std::sync::atomic::AtomicUsize) -> Result<(), StorageError> {
        use std::sync::atomic::Ordering;
        match counter.fetch_update(Ordering::SeqCst, Ordering::SeqCst, |n| n.checked_sub(1)) {
            Ok(_) => Err(StorageError::Poisoned),
            Err(_) => Ok(()),
        }
    }
}

#[cfg(test)]
impl LocalStore for FlakyStore {
    fn get(&self, key: &str) -> Result<Option<String>, StorageError> {
        self.inner.get(key)
    }

    fn put(&self, key: &str, value: &str) -> Result<(), StorageError> {
        self.inner.put(key, value)
    }

    fn delete(&self, key: &str) -> Result<(), StorageError> {
        self.inner.delete(key)
    }

    fn update(
        &self,
        key: &str,
        apply: &mut dyn FnMut(Option<String>) -> Result<String, StorageError>,
    ) -> Result<String, StorageError> {
        Self::trip(&self.failing_updates)?;
        self.inner.update(key, apply)
    }

    fn put_batch(&self, entries: &[(&str, String)]) -> Result<(), StorageError> {
        self.inner.put_batch(entries)
    }

    fn record_completed(&self, record: &CompletedSession) -> Result<(), StorageError> {
        Self::trip(&self.failing_records)?;
        self.inner.record_completed(record)
    }

    fn recent_completed(&self, limit: usize) -> Result<Vec<CompletedSession>, StorageError> {
        self.inner.recent_completed(limit)
    }
}
