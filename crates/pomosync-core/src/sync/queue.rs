//! Durable mutation queue.
//!
//! The whole queue is one JSON record under [`QUEUE_KEY`]. Every change
//! builds the next record, persists it, and only then replaces the in-memory
//! copy, so a failed write leaves both sides unchanged.

use std::collections::HashSet;
use std::sync::{Arc, Mutex};

use chrono::{DateTime, Utc};
use serde::{Deserialize, Serialize};
use tokio::sync::Notify;
use tracing::{debug, warn};

use super::types::{EntryStatus, Mutation, QueueStats, SyncQueueEntry};
use crate::error::StorageError;
use crate::storage::{get_json, LocalStore};

pub const QUEUE_KEY: &str = "sync.queue";

/// User decision on a FAILED entry.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum Resolution {
    /// Back to PENDING with a fresh attempt count.
    Retry,
    /// Drop the entry; later entries of the same entity unblock.
    Discard,
}

#[derive(Debug, Clone, Default, Serialize, Deserialize)]
struct QueueRecord {
    next_sequence: u64,
    entries: Vec<SyncQueueEntry>,
}

pub struct MutationQueue {
    store: Arc<dyn LocalStore>,
    record: QueueRecord,
}

impl MutationQueue {
    /// Load the queue. IN_FLIGHT entries left by a previous process revert
    /// to PENDING; their outcome is unknown and the remote dedupes replays
    /// by `clientSequence`.
    pub fn open(store: Arc<dyn LocalStore>) -> Result<Self, StorageError> {
        let mut record: QueueRecord = get_json(store.as_ref(), QUEUE_KEY)?.unwrap_or_default();
        record.entries.sort_by_key(|e| e.sequence);
        let floor = record.entries.last().map(|e| e.sequence + 1).unwrap_or(1);
        record.next_sequence = record.next_sequence.max(floor);

        let mut reverted = 0usize;
        for entry in &mut record.entries {
            if entry.status == EntryStatus::InFlight {
                entry.status = EntryStatus::Pending;
                reverted += 1;
            }
        }

        let mut queue = Self {
            store,
            record: QueueRecord::default(),
        };
        if reverted > 0 {
            warn!(reverted, "Reverted in-flight sync entries left by a previous run");
            queue.commit(record, &[])?;
        } else {
            queue.record = record;
        }
        Ok(queue)
    }

    // ── Queries ──────────────────────────────────────────────────────

    pub fn entries(&self) -> &[SyncQueueEntry] {
        &self.record.entries
    }

    pub fn len(&self) -> usize {
        self.record.entries.len()
    }

    pub fn is_empty(&self) -> bool {
        self.record.entries.is_empty()
    }

    pub fn get(&self, sequence: u64) -> Option<&SyncQueueEntry> {
        self.record.entries.iter().find(|e| e.sequence == sequence)
    }

    pub fn failed(&self) -> Vec<SyncQueueEntry> {
        self.record
            .entries
            .iter()
            .filter(|e| e.status == EntryStatus::Failed)
            .cloned()
            .collect()
    }

    /// PENDING or IN_FLIGHT entries for one entity, in order.
    pub fn unconfirmed_for<'a>(
        &'a self,
        entity_id: &'a str,
    ) -> impl Iterator<Item = &'a SyncQueueEntry> + 'a {
        self.record
            .entries
            .iter()
            .filter(move |e| e.entity_id == entity_id && e.is_unconfirmed())
    }

    /// Whether `claim_next(now)` would return an entry.
    pub fn has_ready(&self, now: DateTime<Utc>) -> bool {
        self.ready_index(now).is_some()
    }

    /// Earliest backoff deadline still in the future.
    pub fn next_retry_after(&self, now: DateTime<Utc>) -> Option<DateTime<Utc>> {
        self.record
            .entries
            .iter()
            .filter(|e| e.status == EntryStatus::Pending)
            .filter_map(|e| e.next_attempt_at)
            .filter(|at| *at > now)
            .min()
    }

    pub fn stats(&self) -> QueueStats {
        let mut stats = QueueStats::default();
        for entry in &self.record.entries {
            match entry.status {
                EntryStatus::Pending => {
                    stats.pending += 1;
                    stats.oldest_pending_at = min_time(stats.oldest_pending_at, Some(entry.created_at));
                    stats.next_attempt_at = min_time(stats.next_attempt_at, entry.next_attempt_at);
                }
                EntryStatus::InFlight => {
                    stats.in_flight += 1;
                    stats.oldest_pending_at = min_time(stats.oldest_pending_at, Some(entry.created_at));
                }
                EntryStatus::Failed => stats.failed += 1,
                EntryStatus::Confirmed => {}
            }
        }
        stats
    }

    // ── Commands ─────────────────────────────────────────────────────

    pub fn append(&mut self, mutations: Vec<Mutation>, now: DateTime<Utc>) -> Result<Vec<u64>, StorageError> {
        self.append_with(mutations, now, &[])
    }

    /// Append mutations and write `extra` records in the same atomic batch.
    pub fn append_with(
        &mut self,
        mutations: Vec<Mutation>,
        now: DateTime<Utc>,
        extra: &[(&str, String)],
    ) -> Result<Vec<u64>, StorageError> {
        let mut next = self.record.clone();
        let mut sequences = Vec::with_capacity(mutations.len());
        for mutation in mutations {
            let sequence = next.next_sequence;
            next.next_sequence += 1;
            sequences.push(sequence);
            next.entries.push(SyncQueueEntry {
                sequence,
                entity_type: mutation.payload.entity_type(),
                entity_id: mutation.entity_id,
                payload: mutation.payload,
                created_at: now,
                status: EntryStatus::Pending,
                attempts: 0,
                next_attempt_at: None,
                last_error: None,
            });
        }
        if sequences.is_empty() && extra.is_empty() {
            return Ok(sequences);
        }
        self.commit(next, extra)?;
        debug!(?sequences, "Appended sync mutations");
        Ok(sequences)
    }

    /// Mark the lowest-sequence ready entity head IN_FLIGHT and return it.
    /// A FAILED or IN_FLIGHT head blocks the rest of its entity.
    pub fn claim_next(&mut self, now: DateTime<Utc>) -> Result<Option<SyncQueueEntry>, StorageError> {
        let Some(index) = self.ready_index(now) else {
            return Ok(None);
        };
        let mut next = self.record.clone();
        next.entries[index].status = EntryStatus::InFlight;
        let claimed = next.entries[index].clone();
        self.commit(next, &[])?;
        Ok(Some(claimed))
    }

    /// Mark CONFIRMED, then prune the entity's confirmed entries up to the
    /// acknowledged sequence.
    pub fn confirm(&mut self, sequence: u64, acked_sequence: Option<u64>) -> Result<bool, StorageError> {
        let mut next = self.record.clone();
        let Some(entry) = next.entries.iter_mut().find(|e| e.sequence == sequence) else {
            return Ok(false);
        };
        entry.status = EntryStatus::Confirmed;
        entry.last_error = None;
        let entity_id = entry.entity_id.clone();
        let acked = acked_sequence.unwrap_or(sequence).max(sequence);
        next.entries.retain(|e| {
            !(e.entity_id == entity_id && e.status == EntryStatus::Confirmed && e.sequence <= acked)
        });
        self.commit(next, &[])?;
        Ok(true)
    }

    /// Count a failed attempt. Returns the new status: PENDING with a
    /// backoff deadline, or FAILED once `max_attempts` is reached.
    pub fn retry_later(
        &mut self,
        sequence: u64,
        next_attempt_at: DateTime<Utc>,
        error: &str,
        max_attempts: Option<u32>,
    ) -> Result<Option<EntryStatus>, StorageError> {
        self.modify(sequence, |entry| {
            entry.attempts += 1;
            entry.last_error = Some(error.to_string());
            if max_attempts.is_some_and(|max| entry.attempts >= max) {
                entry.status = EntryStatus::Failed;
                entry.next_attempt_at = None;
            } else {
                entry.status = EntryStatus::Pending;
                entry.next_attempt_at = Some(next_attempt_at);
            }
        })
    }

    /// Return a cancelled IN_FLIGHT entry to PENDING without counting an attempt.
    pub fn release(&mut self, sequence: u64) -> Result<Option<EntryStatus>, StorageError> {
        self.modify(sequence, |entry| {
            if entry.status == EntryStatus::InFlight {
                entry.status = EntryStatus::Pending;
            }
        })
    }

    /// Non-recoverable rejection. The entry stays FAILED until resolved.
    pub fn fail(&mut self, sequence: u64, error: &str) -> Result<Option<EntryStatus>, StorageError> {
        self.modify(sequence, |entry| {
            entry.attempts += 1;
            entry.status = EntryStatus::Failed;
            entry.next_attempt_at = None;
            entry.last_error = Some(error.to_string());
        })
    }

    /// Drop backoff deadlines on PENDING entries. Returns how many changed.
    pub fn clear_backoff(&mut self) -> Result<usize, StorageError> {
        let mut next = self.record.clone();
        let mut cleared = 0;
        for entry in &mut next.entries {
            if entry.status == EntryStatus::Pending && entry.next_attempt_at.is_some() {
                entry.next_attempt_at = None;
                cleared += 1;
            }
        }
        if cleared > 0 {
            self.commit(next, &[])?;
        }
        Ok(cleared)
    }

    /// Apply a user resolution to a FAILED entry. Returns `false` when the
    /// entry is missing or not FAILED.
    pub fn resolve_failed(&mut self, sequence: u64, resolution: Resolution) -> Result<bool, StorageError> {
        let mut next = self.record.clone();
        let Some(index) = next
            .entries
            .iter()
            .position(|e| e.sequence == sequence && e.status == EntryStatus::Failed)
        else {
            return Ok(false);
        };
        match resolution {
            Resolution::Retry => {
                let entry = &mut next.entries[index];
                entry.status = EntryStatus::Pending;
                entry.attempts = 0;
                entry.next_attempt_at = None;
            }
            Resolution::Discard => {
                let entry = next.entries.remove(index);
                warn!(
                    sequence,
                    entity_id = %entry.entity_id,
                    op = entry.payload.op(),
                    "Discarded failed sync entry"
                );
            }
        }
        self.commit(next, &[])?;
        Ok(true)
    }

    // ── Internal ─────────────────────────────────────────────────────

    fn ready_index(&self, now: DateTime<Utc>) -> Option<usize> {
        let mut seen: HashSet<&str> = HashSet::new();
        for (index, entry) in self.record.entries.iter().enumerate() {
            if entry.status == EntryStatus::Confirmed {
                continue;
            }
            if !seen.insert(entry.entity_id.as_str()) {
                continue;
            }
            if entry.is_ready(now) {
                return Some(index);
            }
        }
        None
    }

    fn modify(
        &mut self,
        sequence: u64,
        apply: impl FnOnce(&mut SyncQueueEntry),
    ) -> Result<Option<EntryStatus>, StorageError> {
        let mut next = self.record.clone();
        let Some(entry) = next.entries.iter_mut().find(|e| e.sequence == sequence) else {
            return Ok(None);
        };
        apply(entry);
        let status = entry.status;
        self.commit(next, &[])?;
        Ok(Some(status))
    }

    fn commit(&mut self, next: QueueRecord, extra: &[(&str, String)]) -> Result<(), StorageError> {
        let json = serde_json::to_string(&next)?;
        let mut batch: Vec<(&str, String)> = extra.to_vec();
        batch.push((QUEUE_KEY, json));
        self.store.put_batch(&batch)?;
        self.record = next;
        Ok(())
    }
}

fn min_time(a: Option<DateTime<Utc>>, b: Option<DateTime<Utc>>) -> Option<DateTime<Utc>> {
    match (a, b) {
        (Some(a), Some(b)) => Some(a.min(b)),
        (a, b) => a.or(b),
    }
}

/// Queue handle shared by the timer service and the sync engine.
///
/// Every operation is one locked, persisted step; the lock is never held
/// across an `.await`.
#[derive(Clone)]
pub struct SharedQueue {
    inner: Arc<Mutex<MutationQueue>>,
    appended: Arc<Notify>,
}

impl SharedQueue {
    pub fn new(queue: MutationQueue) -> Self {
        Self {
            inner: Arc::new(Mutex::new(queue)),
            appended: Arc::new(Notify::new()),
        }
    }

    pub fn open(store: Arc<dyn LocalStore>) -> Result<Self, StorageError> {
        Ok(Self::new(MutationQueue::open(store)?))
    }

    pub fn with<R>(&self, f: impl FnOnce(&mut MutationQueue) -> R) -> Result<R, StorageError> {
        let mut queue = self.inner.lock().map_err(|_| StorageError::Poisoned)?;
        Ok(f(&mut queue))
    }

    /// Append and wake the sync engine.
    pub fn append_with(
        &self,
        mutations: Vec<Mutation>,
        now: DateTime<Utc>,
        extra: &[(&str, String)],
    ) -> Result<Vec<u64>, StorageError> {
        let sequences = self.with(|q| q.append_with(mutations, now, extra))??;
        if !sequences.is_empty() {
            self.appended.notify_one();
        }
        Ok(sequences)
    }

    pub fn stats(&self) -> Result<QueueStats, StorageError> {
        self.with(|q| q.stats())
    }

    /// Resolves after the next append that added entries.
    pub async fn appended(&self) {
        self.appended.notified().await;
    }

    pub(crate) fn notify(&self) {
        self.appended.notify_one();
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::storage::MemoryStore;
    use crate::sync::types::MutationPayload;

    fn at(secs: i64) -> DateTime<Utc> {
        DateTime::from_timestamp(1_700_000_000 + secs, 0).unwrap()
    }

    fn pause(entity: &str, secs: i64) -> Mutation {
        Mutation::new(
            entity,
            MutationPayload::Pause {
                pause_started_at: at(secs),
            },
        )
    }

    fn queue() -> (MutationQueue, Arc<MemoryStore>) {
        let store = Arc::new(MemoryStore::new());
        (MutationQueue::open(store.clone()).unwrap(), store)
    }

    #[test]
    fn sequences_are_strictly_increasing_across_pruning() {
        let (mut q, store) = queue();
        let first = q.append(vec![pause("a", 1), pause("a", 2)], at(0)).unwrap();
        assert_eq!(first, vec![1, 2]);

        let claimed = q.claim_next(at(0)).unwrap().unwrap();
        q.confirm(claimed.sequence, None).unwrap();
        let claimed = q.claim_next(at(0)).unwrap().unwrap();
        q.confirm(claimed.sequence, None).unwrap();
        assert!(q.is_empty());

        let mut reopened = MutationQueue::open(store).unwrap();
        assert_eq!(reopened.append(vec![pause("a", 3)], at(0)).unwrap(), vec![3]);
    }

    #[test]
    fn claims_follow_sequence_order_per_entity() {
        let (mut q, _) = queue();
        q.append(vec![pause("a", 1), pause("b", 1), pause("a", 2)], at(0))
            .unwrap();

        let first = q.claim_next(at(0)).unwrap().unwrap();
        assert_eq!(first.sequence, 1);
        // "a" is in flight, so its second entry waits; "b" may go.
        let second = q.claim_next(at(0)).unwrap().unwrap();
        assert_eq!(second.sequence, 2);
        assert!(q.claim_next(at(0)).unwrap().is_none());

        q.confirm(1, None).unwrap();
        assert_eq!(q.claim_next(at(0)).unwrap().unwrap().sequence, 3);
    }

    #[test]
    fn backoff_delays_entry_until_deadline() {
        let (mut q, _) = queue();
        q.append(vec![pause("a", 1)], at(0)).unwrap();
        let entry = q.claim_next(at(0)).unwrap().unwrap();
        let status = q
            .retry_later(entry.sequence, at(4), "HTTP 503", None)
            .unwrap();
        assert_eq!(status, Some(EntryStatus::Pending));
        assert!(q.claim_next(at(3)).unwrap().is_none());
        assert_eq!(q.claim_next(at(4)).unwrap().unwrap().attempts, 1);
    }

    #[test]
    fn attempt_ceiling_moves_to_failed() {
        let (mut q, _) = queue();
        q.append(vec![pause("a", 1)], at(0)).unwrap();
        for attempt in 1..=3u32 {
            let entry = q.claim_next(at(100)).unwrap().unwrap();
            let status = q.retry_later(entry.sequence, at(0), "timeout", Some(3)).unwrap();
            let expected = if attempt == 3 {
                EntryStatus::Failed
            } else {
                EntryStatus::Pending
            };
            assert_eq!(status, Some(expected));
        }
        assert_eq!(q.failed().len(), 1);
    }

    #[test]
    fn failed_head_blocks_entity_but_not_others() {
        let (mut q, _) = queue();
        q.append(vec![pause("a", 1), pause("a", 2), pause("b", 1)], at(0))
            .unwrap();
        let head = q.claim_next(at(0)).unwrap().unwrap();
        q.fail(head.sequence, "422 invalid").unwrap();

        let next = q.claim_next(at(0)).unwrap().unwrap();
        assert_eq!(next.entity_id, "b");
        q.confirm(next.sequence, None).unwrap();
        assert!(q.claim_next(at(0)).unwrap().is_none());
        assert_eq!(q.stats().failed, 1);
        assert_eq!(q.stats().pending, 1);
    }

    #[test]
    fn resolve_failed_retry_and_discard() {
        let (mut q, _) = queue();
        q.append(vec![pause("a", 1), pause("a", 2)], at(0)).unwrap();
        let head = q.claim_next(at(0)).unwrap().unwrap();
        q.fail(head.sequence, "400").unwrap();

        assert!(!q.resolve_failed(2, Resolution::Retry).unwrap());
        assert!(q.resolve_failed(1, Resolution::Retry).unwrap());
        let retried = q.claim_next(at(0)).unwrap().unwrap();
        assert_eq!(retried.sequence, 1);
        assert_eq!(retried.attempts, 0);

        q.fail(1, "400").unwrap();
        assert!(q.resolve_failed(1, Resolution::Discard).unwrap());
        assert!(q.get(1).is_none());
        assert_eq!(q.claim_next(at(0)).unwrap().unwrap().sequence, 2);
    }

    #[test]
    fn release_does_not_count_attempt() {
        let (mut q, _) = queue();
        q.append(vec![pause("a", 1)], at(0)).unwrap();
        let entry = q.claim_next(at(0)).unwrap().unwrap();
        assert_eq!(q.release(entry.sequence).unwrap(), Some(EntryStatus::Pending));
        let again = q.claim_next(at(0)).unwrap().unwrap();
        assert_eq!(again.attempts, 0);
    }

    #[test]
    fn open_reverts_in_flight_entries() {
        let (mut q, store) = queue();
        q.append(vec![pause("a", 1)], at(0)).unwrap();
        q.claim_next(at(0)).unwrap().unwrap();
        assert_eq!(q.stats().in_flight, 1);

        let reopened = MutationQueue::open(store).unwrap();
        let stats = reopened.stats();
        assert_eq!(stats.in_flight, 0);
        assert_eq!(stats.pending, 1);
        assert_eq!(stats.oldest_pending_at, Some(at(0)));
    }

    #[test]
    fn append_with_writes_extra_records_atomically() {
        let (mut q, store) = queue();
        q.append_with(vec![pause("a", 1)], at(0), &[("timer.snapshot", "{}".into())])
            .unwrap();
        assert_eq!(store.get("timer.snapshot").unwrap().as_deref(), Some("{}"));
        assert!(store.get(QUEUE_KEY).unwrap().is_some());
    }

    #[test]
    fn clear_backoff_makes_entries_ready() {
        let (mut q, _) = queue();
        q.append(vec![pause("a", 1)], at(0)).unwrap();
        let entry = q.claim_next(at(0)).unwrap().unwrap();
        q.retry_later(entry.sequence, at(60), "503", None).unwrap();
        assert!(!q.has_ready(at(1)));
        assert_eq!(q.clear_backoff().unwrap(), 1);
        assert!(q.has_ready(at(1)));
    }

    #[test]
    fn ack_with_later_sequence_prunes_confirmed_entries() {
        let (mut q, _) = queue();
        q.append(vec![pause("a", 1), pause("a", 2)], at(0)).unwrap();
        q.claim_next(at(0)).unwrap();
        q.confirm(1, Some(1)).unwrap();
        q.claim_next(at(0)).unwrap();
        q.confirm(2, Some(2)).unwrap();
        assert!(q.is_empty());
    }
}
