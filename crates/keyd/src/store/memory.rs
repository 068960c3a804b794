//! In-memory [`Store`] implementation.
//!
//! Suitable for tests and for running the daemon without a database. Rows
//! live in a [`BTreeMap`] keyed by `(feature, sequence)`, so per-feature
//! ranges come back in sequence order.
//!
//! Transactions are serialized against each other: `begin` waits for any
//! open transaction to finish, then reads from a private snapshot of the
//! rows. Writes land in the snapshot and in a log that `commit` replays onto
//! the live rows, so direct writes made while a transaction is open survive
//! it. If a replayed write collides with one of them, the commit fails and
//! applies nothing.

use std::{
    collections::{BTreeMap, HashSet},
    sync::{
        atomic::{AtomicU64, Ordering},
        Arc,
    },
};

use async_trait::async_trait;
use chrono::{DateTime, Utc};
use common::{Feature, Key, StoreError};
use parking_lot::{Mutex, RwLock};
use tokio::sync::OwnedMutexGuard;

use super::{IsolationLevel, KeyStore, Store, Transaction};

type Rows = BTreeMap<(Feature, i32), Key>;

#[derive(Default)]
struct Shared {
    rows: RwLock<Rows>,
    serial: Arc<tokio::sync::Mutex<()>>,
    advisory_locks: Mutex<HashSet<i64>>,
    writes: AtomicU64,
}

impl Shared {
    fn release_advisory_lock(&self, lock_id: i64) {
        self.advisory_locks.lock().remove(&lock_id);
    }
}

/// Thread-safe in-memory key store. Clones share the same rows.
#[derive(Clone, Default)]
pub struct MemoryStore {
    shared: Arc<Shared>,
}

impl MemoryStore {
    /// Create an empty store.
    pub fn new() -> Self {
        Self::default()
    }

    /// Number of committed writes (inserts, deletion schedules, deletes).
    pub fn writes(&self) -> u64 {
        self.shared.writes.load(Ordering::SeqCst)
    }

    /// Hold an advisory lock outside any transaction, as another replica would.
    ///
    /// Returns `None` if the lock is already held. The lock is released when
    /// the guard is dropped.
    pub fn hold_advisory_lock(&self, lock_id: i64) -> Option<AdvisoryLockGuard> {
        if !self.shared.advisory_locks.lock().insert(lock_id) {
            return None;
        }
        Some(AdvisoryLockGuard {
            shared: Arc::clone(&self.shared),
            lock_id,
        })
    }
}

impl std::fmt::Debug for MemoryStore {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.debug_struct("MemoryStore")
            .field("rows", &self.shared.rows.read().len())
            .finish()
    }
}

/// An advisory lock held by [`MemoryStore::hold_advisory_lock`].
pub struct AdvisoryLockGuard {
    shared: Arc<Shared>,
    lock_id: i64,
}

impl Drop for AdvisoryLockGuard {
    fn drop(&mut self) {
        self.shared.release_advisory_lock(self.lock_id);
    }
}

// ---------------------------------------------------------------------------
// Row operations shared by the store and its transactions
// ---------------------------------------------------------------------------

fn list(rows: &Rows, feature: Option<Feature>) -> Vec<Key> {
    rows.values()
        .filter(|key| !key.is_deleted())
        .filter(|key| feature.map_or(true, |f| key.feature == f))
        .cloned()
        .collect()
}

fn get(rows: &Rows, feature: Feature, sequence: i32) -> Result<Key, StoreError> {
    rows.get(&(feature, sequence))
        .filter(|key| !key.is_deleted())
        .cloned()
        .ok_or(StoreError::NotFound)
}

fn latest(rows: &Rows, feature: Feature) -> Option<Key> {
    rows.range((feature, i32::MIN)..=(feature, i32::MAX))
        .next_back()
        .map(|(_, key)| key.clone())
}

fn insert(
    rows: &mut Rows,
    feature: Feature,
    sequence: i32,
    secret: String,
    starts_at: DateTime<Utc>,
) -> Result<Key, StoreError> {
    if rows.contains_key(&(feature, sequence)) {
        return Err(StoreError::Conflict(format!(
            "key {feature}/{sequence} already exists"
        )));
    }
    let key = Key {
        feature,
        sequence,
        secret: Some(secret),
        starts_at,
        deletes_at: None,
    };
    rows.insert((feature, sequence), key.clone());
    Ok(key)
}

fn set_deletion(
    rows: &mut Rows,
    feature: Feature,
    sequence: i32,
    deletes_at: DateTime<Utc>,
) -> Result<Key, StoreError> {
    let key = rows
        .get_mut(&(feature, sequence))
        .filter(|key| !key.is_deleted())
        .ok_or(StoreError::NotFound)?;
    key.deletes_at = Some(deletes_at);
    Ok(key.clone())
}

fn delete(rows: &mut Rows, feature: Feature, sequence: i32) -> Result<(), StoreError> {
    let key = rows
        .get_mut(&(feature, sequence))
        .filter(|key| !key.is_deleted())
        .ok_or(StoreError::NotFound)?;
    key.secret = None;
    Ok(())
}

/// A write made inside a transaction, replayed at commit.
enum Write {
    Insert(Key),
    SetDeletion {
        feature: Feature,
        sequence: i32,
        deletes_at: DateTime<Utc>,
    },
    Delete {
        feature: Feature,
        sequence: i32,
    },
}

impl Write {
    fn apply(&self, rows: &mut Rows) -> Result<(), StoreError> {
        match self {
            Write::Insert(key) => {
                if rows.contains_key(&(key.feature, key.sequence)) {
                    return Err(StoreError::Conflict(format!(
                        "key {}/{} already exists",
                        key.feature, key.sequence
                    )));
                }
                rows.insert((key.feature, key.sequence), key.clone());
                Ok(())
            }
            Write::SetDeletion {
                feature,
                sequence,
                deletes_at,
            } => set_deletion(rows, *feature, *sequence, *deletes_at).map(drop),
            Write::Delete { feature, sequence } => delete(rows, *feature, *sequence),
        }
    }
}

// ---------------------------------------------------------------------------
// Store
// ---------------------------------------------------------------------------

#[async_trait]
impl KeyStore for MemoryStore {
    async fn list_keys(&self) -> Result<Vec<Key>, StoreError> {
        Ok(list(&self.shared.rows.read(), None))
    }

    async fn list_keys_by_feature(&self, feature: Feature) -> Result<Vec<Key>, StoreError> {
        Ok(list(&self.shared.rows.read(), Some(feature)))
    }

    async fn get_key(&self, feature: Feature, sequence: i32) -> Result<Key, StoreError> {
        get(&self.shared.rows.read(), feature, sequence)
    }

    async fn latest_key(&self, feature: Feature) -> Result<Option<Key>, StoreError> {
        Ok(latest(&self.shared.rows.read(), feature))
    }

    async fn insert_key(
        &self,
        feature: Feature,
        sequence: i32,
        secret: String,
        starts_at: DateTime<Utc>,
    ) -> Result<Key, StoreError> {
        let key = insert(&mut self.shared.rows.write(), feature, sequence, secret, starts_at)?;
        self.shared.writes.fetch_add(1, Ordering::SeqCst);
        Ok(key)
    }

    async fn set_key_deletion(
        &self,
        feature: Feature,
        sequence: i32,
        deletes_at: DateTime<Utc>,
    ) -> Result<Key, StoreError> {
        let key = set_deletion(&mut self.shared.rows.write(), feature, sequence, deletes_at)?;
        self.shared.writes.fetch_add(1, Ordering::SeqCst);
        Ok(key)
    }

    async fn delete_key(&self, feature: Feature, sequence: i32) -> Result<(), StoreError> {
        delete(&mut self.shared.rows.write(), feature, sequence)?;
        self.shared.writes.fetch_add(1, Ordering::SeqCst);
        Ok(())
    }
}

#[async_trait]
impl Store for MemoryStore {
    async fn begin(&self, _isolation: IsolationLevel) -> Result<Box<dyn Transaction>, StoreError> {
        let serial = Arc::clone(&self.shared.serial).lock_owned().await;
        let rows = self.shared.rows.read().clone();
        Ok(Box::new(MemoryTransaction {
            shared: Arc::clone(&self.shared),
            rows: Mutex::new(rows),
            log: Mutex::new(Vec::new()),
            held_locks: Mutex::new(Vec::new()),
            committed: false,
            _serial: serial,
        }))
    }
}

// ---------------------------------------------------------------------------
// Transactions
// ---------------------------------------------------------------------------

struct MemoryTransaction {
    shared: Arc<Shared>,
    /// Snapshot taken at `begin`, with this transaction's writes applied.
    rows: Mutex<Rows>,
    log: Mutex<Vec<Write>>,
    held_locks: Mutex<Vec<i64>>,
    committed: bool,
    _serial: OwnedMutexGuard<()>,
}

impl MemoryTransaction {
    fn record_write(&self, write: Write) {
        self.log.lock().push(write);
    }
}

impl Drop for MemoryTransaction {
    fn drop(&mut self) {
        for lock_id in self.held_locks.lock().drain(..) {
            self.shared.release_advisory_lock(lock_id);
        }
    }
}

#[async_trait]
impl KeyStore for MemoryTransaction {
    async fn list_keys(&self) -> Result<Vec<Key>, StoreError> {
        Ok(list(&self.rows.lock(), None))
    }

    async fn list_keys_by_feature(&self, feature: Feature) -> Result<Vec<Key>, StoreError> {
        Ok(list(&self.rows.lock(), Some(feature)))
    }

    async fn get_key(&self, feature: Feature, sequence: i32) -> Result<Key, StoreError> {
        get(&self.rows.lock(), feature, sequence)
    }

    async fn latest_key(&self, feature: Feature) -> Result<Option<Key>, StoreError> {
        Ok(latest(&self.rows.lock(), feature))
    }

    async fn insert_key(
        &self,
        feature: Feature,
        sequence: i32,
        secret: String,
        starts_at: DateTime<Utc>,
    ) -> Result<Key, StoreError> {
        let key = insert(&mut self.rows.lock(), feature, sequence, secret, starts_at)?;
        self.record_write(Write::Insert(key.clone()));
        Ok(key)
    }

    async fn set_key_deletion(
        &self,
        feature: Feature,
        sequence: i32,
        deletes_at: DateTime<Utc>,
    ) -> Result<Key, StoreError> {
        let key = set_deletion(&mut self.rows.lock(), feature, sequence, deletes_at)?;
        self.record_write(Write::SetDeletion {
            feature,
            sequence,
            deletes_at,
        });
        Ok(key)
    }

    async fn delete_key(&self, feature: Feature, sequence: i32) -> Result<(), StoreError> {
        delete(&mut self.rows.lock(), feature, sequence)?;
        self.record_write(Write::Delete { feature, sequence });
        Ok(())
    }
}

#[async_trait]
impl Transaction for MemoryTransaction {
    async fn try_acquire_advisory_lock(&self, lock_id: i64) -> Result<bool, StoreError> {
        let mut held = self.held_locks.lock();
        if held.contains(&lock_id) {
            return Ok(true);
        }
        if !self.shared.advisory_locks.lock().insert(lock_id) {
            return Ok(false);
        }
        held.push(lock_id);
        Ok(true)
    }

    async fn commit(&mut self) -> Result<(), StoreError> {
        if self.committed {
            return Err(StoreError::Internal("transaction already committed".into()));
        }
        let log = std::mem::take(&mut *self.log.lock());
        {
            let mut live = self.shared.rows.write();
            let mut next = live.clone();
            for write in &log {
                write.apply(&mut next)?;
            }
            *live = next;
        }
        self.shared
            .writes
            .fetch_add(log.len() as u64, Ordering::SeqCst);
        self.committed = true;
        Ok(())
    }
}
