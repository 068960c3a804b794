//! [`DbCache`]: per-feature key cache that reads the store on demand.
//!
//! Unlike [`super::KeyCache`] there is no proactive refresh. Every
//! successful fetch arms an invalidation deadline one interval out; when it
//! passes, the cached set is dropped and the next call refetches.

use std::{collections::HashMap, sync::Arc, time::Duration};

use common::{Feature, Key, KeyError};
use tokio::{
    sync::{Notify, RwLock},
    time::Instant,
};
use tokio_util::sync::CancellationToken;
use tracing::debug;

use super::{deadline_after, CacheOptions};
use crate::clock::Clock;
use crate::store::KeyStore;

#[derive(Default)]
struct DbState {
    /// `None` until the first fetch and after every invalidation.
    keys: Option<HashMap<i32, Key>>,
    latest: Option<Key>,
    invalidate_at: Option<Instant>,
}

struct Inner {
    feature: Feature,
    store: Arc<dyn KeyStore>,
    clock: Arc<dyn Clock>,
    interval: Duration,
    state: RwLock<DbState>,
    /// Wakes the invalidation task when a new deadline is set.
    armed: Notify,
    cancel: CancellationToken,
}

impl Inner {
    /// Replace the cached set with the store's current view.
    /// Called with the write lock held.
    async fn refetch(&self, state: &mut DbState) -> Result<(), KeyError> {
        let keys = tokio::select! {
            res = self.store.list_keys_by_feature(self.feature) => res.map_err(KeyError::GetKeys)?,
            () = self.cancel.cancelled() => return Err(KeyError::Closed),
        };

        let now = self.clock.now();
        let keys: HashMap<i32, Key> = keys
            .into_iter()
            .filter(|key| key.feature == self.feature && !key.is_deleted())
            .map(|key| (key.sequence, key))
            .collect();
        state.latest = keys
            .values()
            .filter(|key| key.can_sign(now))
            .max_by_key(|key| key.sequence)
            .cloned();
        debug!(feature = %self.feature, keys = keys.len(), "db cache refetched");
        state.keys = Some(keys);
        state.invalidate_at = Some(deadline_after(self.interval));
        self.armed.notify_one();
        Ok(())
    }
}

async fn invalidate_loop(inner: Arc<Inner>) {
    loop {
        let deadline = inner.state.read().await.invalidate_at;
        match deadline {
            Some(deadline) => tokio::select! {
                () = inner.cancel.cancelled() => return,
                () = inner.armed.notified() => continue,
                () = tokio::time::sleep_until(deadline) => {}
            },
            None => tokio::select! {
                () = inner.cancel.cancelled() => return,
                () = inner.armed.notified() => continue,
            },
        }

        let mut state = inner.state.write().await;
        // A fetch may have landed while we waited for the lock.
        if let Some(at) = state.invalidate_at {
            if Instant::now() >= at {
                *state = DbState::default();
                debug!(feature = %inner.feature, "db cache invalidated");
            }
        }
    }
}

/// Lazily populated cache of one feature's keys, read straight from a
/// [`KeyStore`].
pub struct DbCache {
    inner: Arc<Inner>,
}

impl DbCache {
    /// Build an empty cache and start its invalidation timer.
    ///
    /// `options.refresh_interval` is used as the invalidation interval.
    /// Must be called from within a tokio runtime.
    pub fn new(store: Arc<dyn KeyStore>, feature: Feature, options: CacheOptions) -> Self {
        let inner = Arc::new(Inner {
            feature,
            store,
            clock: options.clock,
            interval: options.refresh_interval,
            state: RwLock::new(DbState::default()),
            armed: Notify::new(),
            cancel: CancellationToken::new(),
        });
        tokio::spawn(invalidate_loop(Arc::clone(&inner)));
        Self { inner }
    }

    /// The feature this cache serves.
    pub fn feature(&self) -> Feature {
        self.inner.feature
    }

    /// The highest-sequence key that may currently sign.
    ///
    /// # Errors
    ///
    /// - [`KeyError::NotFound`] if the feature has no keys at all.
    /// - [`KeyError::Invalid`] if keys exist but none may sign now.
    /// - [`KeyError::GetKeys`] if the store read fails.
    /// - [`KeyError::Closed`] after [`DbCache::close`].
    pub async fn signing(&self) -> Result<Key, KeyError> {
        self.ensure_open()?;
        {
            let state = self.inner.state.read().await;
            if let Some(latest) = &state.latest {
                if latest.can_sign(self.inner.clock.now()) {
                    return Ok(latest.clone());
                }
            }
        }

        let mut state = self.inner.state.write().await;
        self.ensure_open()?;
        if let Some(latest) = &state.latest {
            if latest.can_sign(self.inner.clock.now()) {
                return Ok(latest.clone());
            }
        }

        self.inner.refetch(&mut state).await?;
        match &state.latest {
            Some(latest) => Ok(latest.clone()),
            None if state.keys.as_ref().map_or(true, HashMap::is_empty) => Err(KeyError::NotFound),
            None => Err(KeyError::Invalid),
        }
    }

    /// The key with `sequence`, if it may still verify.
    ///
    /// # Errors
    ///
    /// - [`KeyError::NotFound`] if the store has no live key with that sequence.
    /// - [`KeyError::Invalid`] if the key is past its deletion time.
    /// - [`KeyError::GetKeys`] if the store read fails.
    /// - [`KeyError::Closed`] after [`DbCache::close`].
    pub async fn verifying(&self, sequence: i32) -> Result<Key, KeyError> {
        self.ensure_open()?;
        {
            let state = self.inner.state.read().await;
            if let Some(key) = cached(&state, sequence) {
                return self.verify(key);
            }
        }

        let mut state = self.inner.state.write().await;
        self.ensure_open()?;
        if let Some(key) = cached(&state, sequence) {
            return self.verify(key);
        }

        self.inner.refetch(&mut state).await?;
        match cached(&state, sequence) {
            Some(key) => self.verify(key),
            None => Err(KeyError::NotFound),
        }
    }

    /// Stop the invalidation timer and fail all further calls with
    /// [`KeyError::Closed`]. Safe to call more than once.
    pub fn close(&self) {
        if !self.inner.cancel.is_cancelled() {
            self.inner.cancel.cancel();
            debug!(feature = %self.inner.feature, "db cache closed");
        }
    }

    fn ensure_open(&self) -> Result<(), KeyError> {
        if self.inner.cancel.is_cancelled() {
            Err(KeyError::Closed)
        } else {
            Ok(())
        }
    }

    fn verify(&self, key: &Key) -> Result<Key, KeyError> {
        if key.can_verify(self.inner.clock.now()) {
            Ok(key.clone())
        } else {
            Err(KeyError::Invalid)
        }
    }
}

fn cached(state: &DbState, sequence: i32) -> Option<&Key> {
    state.keys.as_ref().and_then(|keys| keys.get(&sequence))
}

impl Drop for DbCache {
    fn drop(&mut self) {
        self.close();
    }
}

impl std::fmt::Debug for DbCache {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.debug_struct("DbCache")
            .field("feature", &self.inner.feature)
            .field("interval", &self.inner.interval)
            .finish_non_exhaustive()
    }
}

#[cfg(test)]
mod tests {
    use std::sync::atomic::{AtomicUsize, Ordering};

    use async_trait::async_trait;
    use chrono::{DateTime, TimeDelta, Utc};
    use common::StoreError;

    use super::*;
    use crate::clock::MockClock;
    use crate::store::MemoryStore;

    const FEATURE: Feature = Feature::OidcConvert;

    /// Counts feature listings on top of a [`MemoryStore`].
    #[derive(Default)]
    struct CountingStore {
        store: MemoryStore,
        lists: AtomicUsize,
        fail: std::sync::atomic::AtomicBool,
    }

    impl CountingStore {
        fn lists(&self) -> usize {
            self.lists.load(Ordering::SeqCst)
        }
    }

    #[async_trait]
    impl KeyStore for CountingStore {
        async fn list_keys(&self) -> Result<Vec<Key>, StoreError> {
            self.store.list_keys().await
        }

        async fn list_keys_by_feature(&self, feature: Feature) -> Result<Vec<Key>, StoreError> {
            self.lists.fetch_add(1, Ordering::SeqCst);
            if self.fail.load(Ordering::SeqCst) {
                return Err(StoreError::Unavailable("connection refused".into()));
            }
            self.store.list_keys_by_feature(feature).await
        }

        async fn get_key(&self, feature: Feature, sequence: i32) -> Result<Key, StoreError> {
            self.store.get_key(feature, sequence).await
        }

        async fn latest_key(&self, feature: Feature) -> Result<Option<Key>, StoreError> {
            self.store.latest_key(feature).await
        }

        async fn insert_key(
            &self,
            feature: Feature,
            sequence: i32,
            secret: String,
            starts_at: DateTime<Utc>,
        ) -> Result<Key, StoreError> {
            self.store.insert_key(feature, sequence, secret, starts_at).await
        }

        async fn set_key_deletion(
            &self,
            feature: Feature,
            sequence: i32,
            deletes_at: DateTime<Utc>,
        ) -> Result<Key, StoreError> {
            self.store.set_key_deletion(feature, sequence, deletes_at).await
        }

        async fn delete_key(&self, feature: Feature, sequence: i32) -> Result<(), StoreError> {
            self.store.delete_key(feature, sequence).await
        }
    }

    async fn insert(store: &CountingStore, sequence: i32, starts_at: DateTime<Utc>) -> Key {
        store
            .insert_key(FEATURE, sequence, hex::encode([sequence as u8; 64]), starts_at)
            .await
            .unwrap()
    }

    fn cache(store: &Arc<CountingStore>, clock: &MockClock) -> DbCache {
        DbCache::new(
            store.clone(),
            FEATURE,
            CacheOptions::default().with_clock(clock.clone()),
        )
    }

    #[tokio::test]
    async fn signing_fetches_once_then_hits() {
        let clock = MockClock::new();
        let store = Arc::new(CountingStore::default());
        insert(&store, 1, clock.now() - TimeDelta::hours(1)).await;
        let expected = insert(&store, 2, clock.now()).await;
        let cache = cache(&store, &clock);

        assert_eq!(cache.signing().await.unwrap(), expected);
        assert_eq!(cache.signing().await.unwrap(), expected);
        assert_eq!(store.lists(), 1);
    }

    #[tokio::test]
    async fn signing_not_found_and_invalid() {
        let clock = MockClock::new();
        let store = Arc::new(CountingStore::default());
        let cache = cache(&store, &clock);
        assert_eq!(cache.signing().await.unwrap_err(), KeyError::NotFound);

        // Only a key that has not started yet.
        insert(&store, 1, clock.now() + TimeDelta::minutes(5)).await;
        assert_eq!(cache.signing().await.unwrap_err(), KeyError::Invalid);
    }

    #[tokio::test]
    async fn signing_refetches_when_latest_goes_stale() {
        let clock = MockClock::new();
        let now = clock.now();
        let store = Arc::new(CountingStore::default());
        insert(&store, 1, now).await;
        store
            .set_key_deletion(FEATURE, 1, now + TimeDelta::minutes(1))
            .await
            .unwrap();
        let cache = cache(&store, &clock);
        assert_eq!(cache.signing().await.unwrap().sequence, 1);

        let successor = insert(&store, 2, now + TimeDelta::seconds(30)).await;
        clock.advance(TimeDelta::minutes(2));

        assert_eq!(cache.signing().await.unwrap(), successor);
        assert_eq!(store.lists(), 2);
    }

    #[tokio::test]
    async fn verifying_reads_through() {
        let clock = MockClock::new();
        let now = clock.now();
        let store = Arc::new(CountingStore::default());
        let cache = cache(&store, &clock);

        assert_eq!(cache.verifying(3).await.unwrap_err(), KeyError::NotFound);
        let expected = insert(&store, 3, now + TimeDelta::seconds(1)).await;

        // Future starts_at is fine for verification.
        assert_eq!(cache.verifying(3).await.unwrap(), expected);
        assert_eq!(cache.verifying(3).await.unwrap(), expected);
        assert_eq!(store.lists(), 2);
    }

    #[tokio::test]
    async fn verifying_rejects_keys_past_deletion() {
        let clock = MockClock::new();
        let now = clock.now();
        let store = Arc::new(CountingStore::default());
        insert(&store, 4, now - TimeDelta::hours(1)).await;
        store.set_key_deletion(FEATURE, 4, now).await.unwrap();
        let cache = cache(&store, &clock);

        assert_eq!(cache.verifying(4).await.unwrap_err(), KeyError::Invalid);
    }

    #[tokio::test]
    async fn store_errors_are_wrapped() {
        let clock = MockClock::new();
        let store = Arc::new(CountingStore::default());
        store.fail.store(true, Ordering::SeqCst);
        let cache = cache(&store, &clock);

        let err = cache.signing().await.unwrap_err();
        assert_eq!(err.to_string(), "get keys: store unavailable: connection refused");
    }

    #[tokio::test(start_paused = true)]
    async fn entries_are_invalidated_after_interval() {
        let clock = MockClock::new();
        let store = Arc::new(CountingStore::default());
        insert(&store, 1, clock.now()).await;
        let cache = cache(&store, &clock);

        cache.verifying(1).await.unwrap();
        assert_eq!(store.lists(), 1);

        tokio::time::sleep(Duration::from_secs(599)).await;
        cache.verifying(1).await.unwrap();
        assert_eq!(store.lists(), 1);

        tokio::time::sleep(Duration::from_secs(2)).await;
        cache.verifying(1).await.unwrap();
        assert_eq!(store.lists(), 2);
    }

    #[tokio::test(start_paused = true)]
    async fn fetch_pushes_invalidation_back() {
        let clock = MockClock::new();
        let store = Arc::new(CountingStore::default());
        insert(&store, 1, clock.now()).await;
        let cache = cache(&store, &clock);

        cache.verifying(1).await.unwrap();
        tokio::time::sleep(Duration::from_secs(300)).await;

        // A miss on an unknown sequence refetches and re-arms the deadline.
        insert(&store, 2, clock.now()).await;
        cache.verifying(2).await.unwrap();
        assert_eq!(store.lists(), 2);

        // The first deadline passes without dropping the fresh set.
        tokio::time::sleep(Duration::from_secs(301)).await;
        cache.verifying(1).await.unwrap();
        assert_eq!(store.lists(), 2);

        tokio::time::sleep(Duration::from_secs(300)).await;
        cache.verifying(1).await.unwrap();
        assert_eq!(store.lists(), 3);
    }

    #[tokio::test]
    async fn closed_cache_rejects_calls() {
        let clock = MockClock::new();
        let store = Arc::new(CountingStore::default());
        insert(&store, 1, clock.now()).await;
        let cache = cache(&store, &clock);
        cache.signing().await.unwrap();

        cache.close();
        cache.close();

        assert_eq!(cache.signing().await.unwrap_err(), KeyError::Closed);
        assert_eq!(cache.verifying(1).await.unwrap_err(), KeyError::Closed);
    }
}
