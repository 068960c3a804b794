//! Persistence interface for crypto keys.
//!
//! The durable store lives outside this crate; the caches and the rotator
//! only depend on the traits below. [`MemoryStore`] implements them for
//! tests and for running the daemon without a database.
//!
//! # Transactions
//!
//! [`Store::begin`] opens a [`Transaction`] that exposes the same
//! [`KeyStore`] operations plus a transaction-scoped advisory lock. Work is
//! applied by [`Transaction::commit`]; dropping an uncommitted transaction
//! rolls it back and releases any advisory locks it held.

pub mod memory;

pub use memory::MemoryStore;

use async_trait::async_trait;
use chrono::{DateTime, Utc};
use common::{Feature, Key, StoreError};

/// Advisory lock taken by the rotator for the duration of each pass.
pub const LOCK_ID_CRYPTO_KEY_ROTATION: i64 = 0x6372_7970_746f_6b72;

/// Transaction isolation levels a store may be asked for.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum IsolationLevel {
    ReadCommitted,
    RepeatableRead,
    Serializable,
}

/// Key queries and mutations.
///
/// Listing and lookup operations never return deleted keys.
/// [`KeyStore::latest_key`] is the exception: it considers every key ever
/// inserted for a feature so that sequence numbers are never reissued.
#[async_trait]
pub trait KeyStore: Send + Sync {
    /// All live keys, across every feature.
    async fn list_keys(&self) -> Result<Vec<Key>, StoreError>;

    /// All live keys for one feature.
    async fn list_keys_by_feature(&self, feature: Feature) -> Result<Vec<Key>, StoreError>;

    /// A single live key.
    ///
    /// # Errors
    ///
    /// Returns [`StoreError::NotFound`] if the key does not exist or was deleted.
    async fn get_key(&self, feature: Feature, sequence: i32) -> Result<Key, StoreError>;

    /// The key with the highest sequence ever issued for `feature`, deleted or not.
    async fn latest_key(&self, feature: Feature) -> Result<Option<Key>, StoreError>;

    /// Insert a new key. `secret` is the hex encoding of the key bytes.
    ///
    /// # Errors
    ///
    /// Returns [`StoreError::Conflict`] if `(feature, sequence)` already exists.
    async fn insert_key(
        &self,
        feature: Feature,
        sequence: i32,
        secret: String,
        starts_at: DateTime<Utc>,
    ) -> Result<Key, StoreError>;

    /// Schedule a live key for deletion at `deletes_at`.
    async fn set_key_deletion(
        &self,
        feature: Feature,
        sequence: i32,
        deletes_at: DateTime<Utc>,
    ) -> Result<Key, StoreError>;

    /// Delete a key. Its sequence stays reserved.
    async fn delete_key(&self, feature: Feature, sequence: i32) -> Result<(), StoreError>;
}

/// A key store that supports transactions.
#[async_trait]
pub trait Store: KeyStore {
    /// Open a transaction at the requested isolation level.
    async fn begin(&self, isolation: IsolationLevel) -> Result<Box<dyn Transaction>, StoreError>;
}

/// An open transaction.
#[async_trait]
pub trait Transaction: KeyStore {
    /// Try to take the named advisory lock for the rest of this transaction.
    ///
    /// Returns `false` without blocking if another holder has it.
    async fn try_acquire_advisory_lock(&self, lock_id: i64) -> Result<bool, StoreError>;

    /// Apply every write made through this transaction.
    async fn commit(&mut self) -> Result<(), StoreError>;
}
