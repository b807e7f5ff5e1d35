//! In-memory intent locks held for the duration of conflict resolution and
//! the write that follows it.
//!
//! Locks are taken per encoded doc path with an intent type set; two holders
//! of the same key are compatible unless their type sets conflict. A batch is
//! acquired all-or-nothing.

use std::sync::Arc;
use std::sync::atomic::{AtomicU64, Ordering};
use std::time::Instant;

use ahash::AHashMap as HashMap;
use log::{debug, trace};
use parking_lot::Mutex;
use tokio::sync::Notify;

use crate::conflict::detection::WriteRequest;
use crate::errors::{MaatError, Result};
use crate::intent::codec::ParsedIntent;
use crate::intent::doc_path::expand_key_intents;
use crate::intent::lock_info::{LockInfo, TableInfoProvider, populate_lock_info_from_parsed_intent};
use crate::intent::types::IntentTypeSet;
use crate::transaction_id::TransactionId;

/// One key of a lock batch.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct LockEntry {
    /// Encoded doc path.
    pub key: Vec<u8>,
    pub intent_types: IntentTypeSet,
}

impl LockEntry {
    /// Expands a write set into lock entries: strong types on every requested
    /// path, weak ones on their ancestors. Entries for the same key are
    /// merged and the result is sorted by key.
    pub fn for_write_set(write_set: &[WriteRequest], partial_range_key_intents: bool) -> Vec<LockEntry> {
        let mut merged: HashMap<Vec<u8>, IntentTypeSet> = HashMap::new();
        for request in write_set {
            for (path, types) in
                expand_key_intents(&request.path, request.intent_types, partial_range_key_intents)
            {
                let entry = merged.entry(path.encode()).or_default();
                *entry = entry.union(types);
            }
        }
        let mut entries: Vec<LockEntry> = merged
            .into_iter()
            .map(|(key, intent_types)| LockEntry { key, intent_types })
            .collect();
        entries.sort_unstable_by(|a, b| a.key.cmp(&b.key));
        entries
    }
}

#[derive(Debug, Clone, Copy)]
struct Holder {
    batch_id: u64,
    owner: Option<TransactionId>,
    intent_types: IntentTypeSet,
}

/// A lock currently held, as reported by [`SharedLockManager::dump_locks`].
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct HeldLock {
    pub key: Vec<u8>,
    pub intent_types: IntentTypeSet,
    pub owner: Option<TransactionId>,
}

#[derive(Default)]
pub struct SharedLockManager {
    locks: Mutex<HashMap<Vec<u8>, Vec<Holder>>>,
    released: Notify,
    next_batch_id: AtomicU64,
}

impl SharedLockManager {
    pub fn new() -> Arc<Self> {
        Arc::new(Self::default())
    }

    fn try_acquire(&self, batch_id: u64, owner: Option<TransactionId>, entries: &[LockEntry]) -> bool {
        let mut locks = self.locks.lock();
        let blocked = entries.iter().any(|entry| {
            locks.get(&entry.key).is_some_and(|holders| {
                holders.iter().any(|h| {
                    h.batch_id != batch_id
                        && (owner.is_none() || h.owner != owner)
                        && h.intent_types.conflicts_with(entry.intent_types)
                })
            })
        });
        if blocked {
            return false;
        }
        for entry in entries {
            locks.entry(entry.key.clone()).or_default().push(Holder {
                batch_id,
                owner,
                intent_types: entry.intent_types,
            });
        }
        true
    }

    fn release(&self, batch_id: u64, entries: &[LockEntry]) {
        {
            let mut locks = self.locks.lock();
            for entry in entries {
                if let Some(holders) = locks.get_mut(&entry.key) {
                    holders.retain(|h| h.batch_id != batch_id);
                    if holders.is_empty() {
                        locks.remove(&entry.key);
                    }
                }
            }
        }
        self.released.notify_waiters();
    }

    async fn acquire(
        &self,
        batch_id: u64,
        owner: Option<TransactionId>,
        entries: &[LockEntry],
        deadline: Option<Instant>,
    ) -> Result<()> {
        loop {
            let notified = self.released.notified();
            tokio::pin!(notified);
            notified.as_mut().enable();
            if self.try_acquire(batch_id, owner, entries) {
                return Ok(());
            }
            trace!("Lock batch {batch_id} blocked, waiting for a release");
            match deadline {
                Some(deadline) => {
                    let deadline = tokio::time::Instant::from_std(deadline);
                    if tokio::time::timeout_at(deadline, notified).await.is_err() {
                        return Err(MaatError::TimedOut(format!(
                            "lock batch {batch_id} not acquired before deadline"
                        )));
                    }
                }
                None => notified.await,
            }
        }
    }

    /// Acquires every entry, waiting for conflicting holders to release.
    ///
    /// Locks held by batches of the same `owner` never block each other.
    pub async fn lock(
        self: &Arc<Self>,
        owner: Option<TransactionId>,
        entries: Vec<LockEntry>,
        deadline: Option<Instant>,
    ) -> Result<LockBatch> {
        let batch_id = self.next_batch_id.fetch_add(1, Ordering::Relaxed);
        self.acquire(batch_id, owner, &entries, deadline).await?;
        debug!("Locked batch {batch_id} with {} keys", entries.len());
        Ok(LockBatch {
            manager: Arc::clone(self),
            batch_id,
            owner,
            entries,
            locked: true,
        })
    }

    /// Acquires every entry or none, without waiting.
    pub fn try_lock(
        self: &Arc<Self>,
        owner: Option<TransactionId>,
        entries: Vec<LockEntry>,
    ) -> Option<LockBatch> {
        let batch_id = self.next_batch_id.fetch_add(1, Ordering::Relaxed);
        self.try_acquire(batch_id, owner, &entries).then(|| LockBatch {
            manager: Arc::clone(self),
            batch_id,
            owner,
            entries,
            locked: true,
        })
    }

    /// Every lock currently held, sorted by key.
    pub fn dump_locks(&self) -> Vec<HeldLock> {
        let locks = self.locks.lock();
        let mut out: Vec<HeldLock> = locks
            .iter()
            .flat_map(|(key, holders)| {
                holders.iter().map(move |h| HeldLock {
                    key: key.clone(),
                    intent_types: h.intent_types,
                    owner: h.owner,
                })
            })
            .collect();
        out.sort_by(|a, b| a.key.cmp(&b.key).then(a.owner.cmp(&b.owner)));
        out
    }

    /// [`dump_locks`](Self::dump_locks) rendered as lock info records. Held
    /// locks carry no write time.
    pub fn dump_lock_infos(&self, tables: &dyn TableInfoProvider) -> Result<Vec<LockInfo>> {
        self.dump_locks()
            .iter()
            .map(|held| {
                let parsed = ParsedIntent::without_hybrid_time(&held.key, held.intent_types);
                let mut info = LockInfo {
                    transaction_id: held.owner,
                    ..LockInfo::default()
                };
                populate_lock_info_from_parsed_intent(&parsed, None, tables, &mut info, false)?;
                Ok(info)
            })
            .collect()
    }

    pub fn is_empty(&self) -> bool {
        self.locks.lock().is_empty()
    }
}

/// A set of locks acquired together and released together.
///
/// Dropping a locked batch releases it.
pub struct LockBatch {
    manager: Arc<SharedLockManager>,
    batch_id: u64,
    owner: Option<TransactionId>,
    entries: Vec<LockEntry>,
    locked: bool,
}

impl LockBatch {
    pub fn is_locked(&self) -> bool {
        self.locked
    }

    pub fn owner(&self) -> Option<TransactionId> {
        self.owner
    }

    pub fn entries(&self) -> &[LockEntry] {
        &self.entries
    }

    pub fn unlock(&mut self) {
        if self.locked {
            self.manager.release(self.batch_id, &self.entries);
            self.locked = false;
            trace!("Unlocked batch {}", self.batch_id);
        }
    }

    /// Re-acquires the same entries after an [`unlock`](Self::unlock).
    pub async fn relock(&mut self, deadline: Option<Instant>) -> Result<()> {
        if self.locked {
            return Ok(());
        }
        self.manager
            .acquire(self.batch_id, self.owner, &self.entries, deadline)
            .await?;
        self.locked = true;
        trace!("Relocked batch {}", self.batch_id);
        Ok(())
    }
}

impl Drop for LockBatch {
    fn drop(&mut self) {
        self.unlock();
    }
}

/// Releases a lock batch across a suspension and restores it afterwards.
///
/// Once released, the batch stays unlocked until [`reacquire`] succeeds. A
/// deadline passing while relocking surfaces as [`MaatError::TimedOut`];
/// any other failed reacquire is a hard error, never a conflict.
///
/// [`reacquire`]: LockBridge::reacquire
pub struct LockBridge<'a> {
    batch: &'a mut LockBatch,
}

impl<'a> LockBridge<'a> {
    pub fn release(batch: &'a mut LockBatch) -> Self {
        batch.unlock();
        Self { batch }
    }

    pub async fn reacquire(self, deadline: Option<Instant>) -> Result<()> {
        self.batch
            .relock(deadline)
            .await
            .map_err(|e| match e {
                MaatError::TimedOut(_) => e,
                other => MaatError::LockReacquire(other.to_string()),
            })
    }
}
