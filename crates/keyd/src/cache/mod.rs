//! Read-through caches of crypto keys.
//!
//! # Variants
//!
//! - [`KeyCache`]: serves signing/verifying or encrypting/decrypting callers
//!   for one feature. Misses are single-flight and a background timer keeps
//!   the key set fresh.
//! - [`DbCache`]: a lighter per-feature cache that reads the store directly
//!   and simply forgets its contents after the invalidation interval.
//!
//! # Module invariants
//!
//! - Caches never write to the store. Key lifecycle belongs to
//!   [`crate::rotator`].
//! - Secrets are only decoded on the way out to the caller.

pub mod dbcache;
pub mod keycache;

pub use dbcache::DbCache;
pub use keycache::KeyCache;

use std::{sync::Arc, time::Duration};

use async_trait::async_trait;
use common::{Feature, Key, KeyError, Secret, StoreError};

use crate::clock::{Clock, SystemClock};
use crate::store::KeyStore;

/// Default interval between background refreshes (and invalidations).
pub const DEFAULT_REFRESH_INTERVAL: Duration = Duration::from_secs(10 * 60);

/// Source of a feature's keys for a [`KeyCache`].
#[cfg_attr(test, mockall::automock)]
#[async_trait]
pub trait Fetcher: Send + Sync {
    /// Return every live key for `feature`.
    async fn fetch(&self, feature: Feature) -> Result<Vec<Key>, StoreError>;
}

/// [`Fetcher`] that reads straight from a key store.
pub struct StoreFetcher<S: ?Sized> {
    store: Arc<S>,
}

impl<S: ?Sized> Clone for StoreFetcher<S> {
    fn clone(&self) -> Self {
        Self {
            store: Arc::clone(&self.store),
        }
    }
}

impl<S: KeyStore + ?Sized> StoreFetcher<S> {
    /// Wrap a store.
    pub fn new(store: Arc<S>) -> Self {
        Self { store }
    }
}

#[async_trait]
impl<S: KeyStore + ?Sized> Fetcher for StoreFetcher<S> {
    async fn fetch(&self, feature: Feature) -> Result<Vec<Key>, StoreError> {
        self.store.list_keys_by_feature(feature).await
    }
}

/// Key access for callers that sign and verify tokens.
#[async_trait]
pub trait SigningKeycache: Send + Sync {
    /// The current signing key as `(kid, secret)`.
    async fn signing_key(&self) -> Result<(String, Secret), KeyError>;

    /// The secret for `kid`, if it may still verify.
    async fn verifying_key(&self, kid: &str) -> Result<Secret, KeyError>;

    /// Stop background work and fail all further calls with [`KeyError::Closed`].
    fn close(&self);
}

/// Key access for callers that encrypt and decrypt payloads.
#[async_trait]
pub trait EncryptionKeycache: Send + Sync {
    /// The current encryption key as `(kid, secret)`.
    async fn encrypting_key(&self) -> Result<(String, Secret), KeyError>;

    /// The secret for `kid`, if it may still decrypt.
    async fn decrypting_key(&self, kid: &str) -> Result<Secret, KeyError>;

    /// Stop background work and fail all further calls with [`KeyError::Closed`].
    fn close(&self);
}

/// Construction options shared by both cache variants.
#[derive(Clone)]
pub struct CacheOptions {
    /// Wall clock used for key validity checks.
    pub clock: Arc<dyn Clock>,
    /// How long fetched keys are trusted before the next refresh.
    pub refresh_interval: Duration,
}

impl CacheOptions {
    /// Replace the wall clock.
    pub fn with_clock(mut self, clock: impl Clock) -> Self {
        self.clock = Arc::new(clock);
        self
    }

    /// Replace the refresh interval.
    pub fn with_refresh_interval(mut self, refresh_interval: Duration) -> Self {
        self.refresh_interval = refresh_interval;
        self
    }
}

impl Default for CacheOptions {
    fn default() -> Self {
        Self {
            clock: Arc::new(SystemClock),
            refresh_interval: DEFAULT_REFRESH_INTERVAL,
        }
    }
}

impl std::fmt::Debug for CacheOptions {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.debug_struct("CacheOptions")
            .field("refresh_interval", &self.refresh_interval)
            .finish_non_exhaustive()
    }
}

/// Cap on how far out a refresh or invalidation deadline is scheduled.
const MAX_DEADLINE: Duration = Duration::from_secs(30 * 365 * 24 * 60 * 60);

/// The instant `interval` from now, capped at [`MAX_DEADLINE`].
fn deadline_after(interval: Duration) -> tokio::time::Instant {
    tokio::time::Instant::now() + interval.min(MAX_DEADLINE)
}

/// Parse a `kid` back into a sequence number.
fn parse_key_id(kid: &str) -> Result<i32, KeyError> {
    kid.parse::<i32>()
        .map_err(|_| KeyError::InvalidKeyId(kid.to_owned()))
}

#[cfg(test)]
mod tests {
    use chrono::Utc;

    use super::*;
    use crate::store::MemoryStore;

    #[test]
    fn key_ids_are_decimal_sequences() {
        assert_eq!(parse_key_id("12").unwrap(), 12);
        assert_eq!(
            parse_key_id("twelve").unwrap_err(),
            KeyError::InvalidKeyId("twelve".into())
        );
        assert!(parse_key_id("").is_err());
    }

    #[test]
    fn default_options() {
        let options = CacheOptions::default();
        assert_eq!(options.refresh_interval, Duration::from_secs(600));
    }

    #[tokio::test(start_paused = true)]
    async fn deadline_after_caps_huge_intervals() {
        let now = tokio::time::Instant::now();
        assert_eq!(deadline_after(Duration::from_secs(600)), now + Duration::from_secs(600));
        assert_eq!(deadline_after(Duration::MAX), now + MAX_DEADLINE);
    }

    #[tokio::test]
    async fn store_fetcher_lists_one_feature() {
        let store = Arc::new(MemoryStore::new());
        let now = Utc::now();
        store
            .insert_key(Feature::OidcConvert, 1, hex::encode([1u8; 64]), now)
            .await
            .unwrap();
        store
            .insert_key(Feature::TailnetResume, 1, hex::encode([2u8; 64]), now)
            .await
            .unwrap();

        let fetcher = StoreFetcher::new(store);
        let keys = fetcher.fetch(Feature::OidcConvert).await.unwrap();
        assert_eq!(keys.len(), 1);
        assert_eq!(keys[0].feature, Feature::OidcConvert);
    }
}
