//! [`KeyCache`]: single-flight read-through cache over one feature's keys.
//!
//! # Fetching
//!
//! A miss marks the cache as `fetching`, releases the state lock and calls
//! the [`Fetcher`]. Callers that miss while a fetch is in flight wait for it
//! instead of issuing their own, and receive its result: the key if it
//! arrived, its error if it failed, [`KeyError::NotFound`] otherwise. The
//! fetched set replaces the cached one wholesale.
//!
//! # Refreshing
//!
//! A background task refetches every `refresh_interval`. Each successful
//! fetch, however triggered, pushes the next refresh a full interval out, so
//! a timer firing right after a miss-driven fetch does nothing.
//!
//! # Closing
//!
//! [`KeyCache::close`] (or dropping the cache) cancels the refresh task and
//! any in-flight fetch, and wakes every waiting caller with
//! [`KeyError::Closed`].

use std::{collections::HashMap, sync::Arc, time::Duration};

use async_trait::async_trait;
use chrono::{DateTime, Utc};
use common::{Feature, FeatureKind, Key, KeyError, Secret};
use parking_lot::Mutex;
use tokio::{sync::Notify, time::Instant};
use tokio_util::sync::CancellationToken;
use tracing::{debug, error, warn};

use super::{deadline_after, parse_key_id, CacheOptions, EncryptionKeycache, Fetcher, SigningKeycache};
use crate::clock::Clock;

#[derive(Debug, Clone, Copy)]
enum Lookup {
    Latest,
    Sequence(i32),
}

struct State {
    keys: HashMap<i32, Key>,
    /// Highest-sequence key that could sign when the set was fetched.
    latest: Option<Key>,
    fetching: bool,
    closed: bool,
    /// Number of fetches that ran to completion.
    generation: u64,
    /// Outcome of the most recent completed fetch.
    last_error: Option<KeyError>,
    /// Earliest instant the refresh timer may fetch again.
    refresh_at: Instant,
}

impl State {
    fn lookup(&self, lookup: Lookup) -> Option<&Key> {
        match lookup {
            Lookup::Latest => self.latest.as_ref(),
            Lookup::Sequence(sequence) => self.keys.get(&sequence),
        }
    }

    fn replace(&mut self, feature: Feature, keys: Vec<Key>, now: DateTime<Utc>) {
        self.keys = keys
            .into_iter()
            .filter(|key| key.feature == feature && !key.is_deleted())
            .map(|key| (key.sequence, key))
            .collect();
        self.latest = self
            .keys
            .values()
            .filter(|key| key.can_sign(now))
            .max_by_key(|key| key.sequence)
            .cloned();
    }
}

fn check(key: &Key, lookup: Lookup, now: DateTime<Utc>) -> Result<Key, KeyError> {
    let usable = match lookup {
        Lookup::Latest => key.can_sign(now),
        Lookup::Sequence(_) => key.can_verify(now),
    };
    if usable {
        Ok(key.clone())
    } else {
        Err(KeyError::Invalid)
    }
}

struct Inner {
    feature: Feature,
    fetcher: Arc<dyn Fetcher>,
    clock: Arc<dyn Clock>,
    refresh_interval: Duration,
    state: Mutex<State>,
    /// Signalled whenever a fetch finishes or is abandoned.
    fetched: Notify,
    cancel: CancellationToken,
}

/// Clears `fetching` if a fetch is dropped before it completes.
struct FetchGuard<'a> {
    inner: &'a Inner,
    armed: bool,
}

impl Drop for FetchGuard<'_> {
    fn drop(&mut self) {
        if !self.armed {
            return;
        }
        self.inner.state.lock().fetching = false;
        // Waiters loop around and one of them takes over the fetch.
        self.inner.fetched.notify_waiters();
    }
}

impl Inner {
    async fn crypto_key(&self, lookup: Lookup) -> Result<Key, KeyError> {
        let mut waited_on: Option<u64> = None;
        loop {
            let notified = self.fetched.notified();
            tokio::pin!(notified);
            {
                let mut state = self.state.lock();
                if state.closed {
                    return Err(KeyError::Closed);
                }
                if let Some(key) = state.lookup(lookup) {
                    return check(key, lookup, self.clock.now());
                }
                if let Some(generation) = waited_on {
                    if state.generation != generation {
                        return Err(state.last_error.clone().unwrap_or(KeyError::NotFound));
                    }
                }
                if !state.fetching {
                    state.fetching = true;
                    break;
                }
                waited_on = Some(state.generation);
                // Register before unlocking so the completion cannot be missed.
                notified.as_mut().enable();
            }
            tokio::select! {
                () = &mut notified => {}
                () = self.cancel.cancelled() => return Err(KeyError::Closed),
            }
        }

        self.fetch().await?;

        let state = self.state.lock();
        if state.closed {
            return Err(KeyError::Closed);
        }
        match state.lookup(lookup) {
            Some(key) => check(key, lookup, self.clock.now()),
            None => Err(KeyError::NotFound),
        }
    }

    /// Run one fetch. The caller must already have set `fetching`.
    async fn fetch(&self) -> Result<(), KeyError> {
        let mut guard = FetchGuard {
            inner: self,
            armed: true,
        };
        let result = tokio::select! {
            res = self.fetcher.fetch(self.feature) => res.map_err(KeyError::Fetch),
            () = self.cancel.cancelled() => Err(KeyError::Closed),
        };
        guard.armed = false;

        let outcome = {
            let mut state = self.state.lock();
            state.fetching = false;
            state.generation += 1;
            match result {
                Ok(keys) => {
                    state.replace(self.feature, keys, self.clock.now());
                    state.refresh_at = deadline_after(self.refresh_interval);
                    state.last_error = None;
                    debug!(
                        feature = %self.feature,
                        keys = state.keys.len(),
                        latest = ?state.latest.as_ref().map(|key| key.sequence),
                        "crypto keys fetched"
                    );
                    Ok(())
                }
                Err(e) => {
                    state.last_error = Some(e.clone());
                    Err(e)
                }
            }
        };
        self.fetched.notify_waiters();
        outcome
    }

    fn close(&self) {
        {
            let mut state = self.state.lock();
            if state.closed {
                return;
            }
            state.closed = true;
        }
        self.cancel.cancel();
        self.fetched.notify_waiters();
        debug!(feature = %self.feature, "crypto key cache closed");
    }
}

async fn refresh_loop(inner: Arc<Inner>) {
    let mut deadline = inner.state.lock().refresh_at;
    loop {
        tokio::select! {
            () = inner.cancel.cancelled() => return,
            () = tokio::time::sleep_until(deadline) => {}
        }

        let now = Instant::now();
        {
            let mut state = inner.state.lock();
            if state.closed {
                return;
            }
            if state.fetching {
                // The in-flight fetch moves refresh_at when it lands.
                deadline = deadline_after(inner.refresh_interval);
                continue;
            }
            if now < state.refresh_at {
                deadline = state.refresh_at;
                continue;
            }
            state.fetching = true;
        }

        match inner.fetch().await {
            Ok(()) => {}
            Err(KeyError::Closed) => return,
            Err(e) => {
                warn!(feature = %inner.feature, error = %e, "crypto key refresh failed; retaining cached keys");
                inner.state.lock().refresh_at = deadline_after(inner.refresh_interval);
            }
        }
        deadline = inner.state.lock().refresh_at;
    }
}

/// Read-through, single-flight cache of one feature's keys.
///
/// Build it with [`KeyCache::signing`] or [`KeyCache::encryption`]; the
/// methods of the other capability return [`KeyError::InvalidFeature`].
pub struct KeyCache {
    inner: Arc<Inner>,
}

impl KeyCache {
    /// Build a cache for a signing feature.
    ///
    /// # Errors
    ///
    /// Returns [`KeyError::InvalidFeature`] if `feature` is not a signing feature.
    pub async fn signing(
        fetcher: Arc<dyn Fetcher>,
        feature: Feature,
        options: CacheOptions,
    ) -> Result<Self, KeyError> {
        Self::new(fetcher, feature, FeatureKind::Signing, options).await
    }

    /// Build a cache for an encryption feature.
    ///
    /// # Errors
    ///
    /// Returns [`KeyError::InvalidFeature`] if `feature` is not an encryption feature.
    pub async fn encryption(
        fetcher: Arc<dyn Fetcher>,
        feature: Feature,
        options: CacheOptions,
    ) -> Result<Self, KeyError> {
        Self::new(fetcher, feature, FeatureKind::Encryption, options).await
    }

    /// Checks the feature, performs the initial fetch and starts the refresh
    /// timer. A failed initial fetch is logged; later calls retry it.
    async fn new(
        fetcher: Arc<dyn Fetcher>,
        feature: Feature,
        kind: FeatureKind,
        options: CacheOptions,
    ) -> Result<Self, KeyError> {
        ensure_kind(feature, kind)?;

        let inner = Arc::new(Inner {
            feature,
            fetcher,
            clock: options.clock,
            refresh_interval: options.refresh_interval,
            state: Mutex::new(State {
                keys: HashMap::new(),
                latest: None,
                fetching: true,
                closed: false,
                generation: 0,
                last_error: None,
                refresh_at: deadline_after(options.refresh_interval),
            }),
            fetched: Notify::new(),
            cancel: CancellationToken::new(),
        });

        if let Err(e) = inner.fetch().await {
            error!(feature = %feature, error = %e, "initial crypto key fetch failed");
        }
        tokio::spawn(refresh_loop(Arc::clone(&inner)));

        Ok(Self { inner })
    }

    /// The feature this cache serves.
    pub fn feature(&self) -> Feature {
        self.inner.feature
    }

    /// Stop the refresh timer and fail every pending and future call with
    /// [`KeyError::Closed`]. Safe to call more than once.
    pub fn close(&self) {
        self.inner.close();
    }

    async fn current(&self, kind: FeatureKind) -> Result<(String, Secret), KeyError> {
        ensure_kind(self.inner.feature, kind)?;
        let key = self.inner.crypto_key(Lookup::Latest).await?;
        Ok((key.id(), key.decode_secret()?))
    }

    async fn by_id(&self, kind: FeatureKind, kid: &str) -> Result<Secret, KeyError> {
        ensure_kind(self.inner.feature, kind)?;
        let sequence = parse_key_id(kid)?;
        let key = self.inner.crypto_key(Lookup::Sequence(sequence)).await?;
        key.decode_secret()
    }
}

fn ensure_kind(feature: Feature, expected: FeatureKind) -> Result<(), KeyError> {
    if feature.kind() == expected {
        Ok(())
    } else {
        Err(KeyError::InvalidFeature { feature, expected })
    }
}

impl Drop for KeyCache {
    fn drop(&mut self) {
        self.inner.close();
    }
}

impl std::fmt::Debug for KeyCache {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.debug_struct("KeyCache")
            .field("feature", &self.inner.feature)
            .finish_non_exhaustive()
    }
}

#[async_trait]
impl SigningKeycache for KeyCache {
    async fn signing_key(&self) -> Result<(String, Secret), KeyError> {
        self.current(FeatureKind::Signing).await
    }

    async fn verifying_key(&self, kid: &str) -> Result<Secret, KeyError> {
        self.by_id(FeatureKind::Signing, kid).await
    }

    fn close(&self) {
        self.inner.close();
    }
}

#[async_trait]
impl EncryptionKeycache for KeyCache {
    async fn encrypting_key(&self) -> Result<(String, Secret), KeyError> {
        self.current(FeatureKind::Encryption).await
    }

    async fn decrypting_key(&self, kid: &str) -> Result<Secret, KeyError> {
        self.by_id(FeatureKind::Encryption, kid).await
    }

    fn close(&self) {
        self.inner.close();
    }
}
