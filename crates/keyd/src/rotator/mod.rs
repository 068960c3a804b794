//! Background rotation of crypto keys.
//!
//! # Lifecycle
//!
//! 1. [`start_rotator`] runs one pass before returning, so every configured
//!    feature has a usable key by the time callers build caches.
//! 2. A background task then runs a pass every `rotation_interval`, retrying
//!    transient store failures with [`with_retry`].
//! 3. Each pass runs in a single REPEATABLE READ transaction behind the
//!    [`LOCK_ID_CRYPTO_KEY_ROTATION`] advisory lock. A replica that finds the
//!    lock taken skips its pass.
//!
//! # Per-key decisions
//!
//! | State | Condition | Action |
//! |---|---|---|
//! | expired | `deletes_at <= now` | delete |
//! | near expiry | no `deletes_at`, `now + 1h >= starts_at + key_duration` | insert successor, schedule deletion |
//! | active | no `deletes_at` | counted as valid |
//! | retiring | `deletes_at` in the future | nothing |
//!
//! A feature left with no valid key gets a fresh one starting immediately.

pub mod retry;

pub use retry::{with_retry, RetryPolicy};

use std::{cmp::max, collections::BTreeMap, sync::Arc, time::Duration};

use chrono::{DateTime, TimeDelta, Utc};
use common::{Feature, Key, StoreError};
use thiserror::Error;
use tokio::{task::JoinHandle, time::MissedTickBehavior};
use tokio_util::sync::CancellationToken;
use tracing::{debug, error, info};

use crate::clock::{Clock, SystemClock};
use crate::crypto::{generate_secret, SecretError};
use crate::store::{IsolationLevel, Store, Transaction, LOCK_ID_CRYPTO_KEY_ROTATION};

/// Default lifetime of a key before it is rotated.
pub const DEFAULT_KEY_DURATION: TimeDelta = TimeDelta::days(30);

/// Default interval between rotation passes.
pub const DEFAULT_ROTATION_INTERVAL: Duration = Duration::from_secs(10 * 60);

/// Head start a key gets on its expiry, and grace a retiring key gets after
/// its successor starts.
const ROTATION_MARGIN: TimeDelta = TimeDelta::hours(1);

/// Errors that abort a rotation pass. Nothing is committed when one occurs.
#[derive(Debug, Error)]
pub enum RotateError {
    #[error("{op}: {source}")]
    Store {
        op: &'static str,
        #[source]
        source: StoreError,
    },

    /// The store holds a key for a feature this rotator does not manage.
    #[error("unknown crypto key feature {0} in store")]
    UnknownFeature(Feature),

    #[error("generate secret: {0}")]
    Secret(#[from] SecretError),

    /// A computed key time fell outside the representable range.
    #[error("{0} is out of range")]
    TimeOutOfRange(&'static str),
}

impl RotateError {
    /// Whether another attempt at the same pass may succeed.
    pub fn is_transient(&self) -> bool {
        match self {
            RotateError::Store { source, .. } => source.is_transient(),
            RotateError::UnknownFeature(_)
            | RotateError::Secret(_)
            | RotateError::TimeOutOfRange(_) => false,
        }
    }
}

fn store_err(op: &'static str) -> impl FnOnce(StoreError) -> RotateError {
    move |source| RotateError::Store { op, source }
}

/// What one pass did.
#[derive(Debug, Clone, Copy, Default, PartialEq, Eq)]
pub struct RotationSummary {
    /// Keys removed because their deletion time passed.
    pub deleted: usize,
    /// Keys that received a successor and a deletion time.
    pub rotated: usize,
    /// Keys inserted for features that had no valid key.
    pub inserted: usize,
    /// The pass did nothing because another replica held the rotation lock.
    pub skipped: bool,
}

impl RotationSummary {
    /// Whether the pass changed anything.
    pub fn is_noop(&self) -> bool {
        self.deleted == 0 && self.rotated == 0 && self.inserted == 0
    }
}

/// Construction options for a [`Rotator`].
#[derive(Clone)]
pub struct RotatorOptions {
    /// How long a key signs before it is rotated.
    pub key_duration: TimeDelta,
    /// Time between passes. Successors start at least three intervals out so
    /// every replica's cache has a chance to see them first.
    pub rotation_interval: Duration,
    /// Features this rotator manages.
    pub features: Vec<Feature>,
    /// Wall clock that decides which keys are due.
    pub clock: Arc<dyn Clock>,
    /// Backoff applied to transient failures of a scheduled pass.
    pub retry: RetryPolicy,
}

impl RotatorOptions {
    /// Replace the key duration.
    pub fn with_key_duration(mut self, key_duration: TimeDelta) -> Self {
        self.key_duration = key_duration;
        self
    }

    /// Replace the rotation interval.
    pub fn with_rotation_interval(mut self, rotation_interval: Duration) -> Self {
        self.rotation_interval = rotation_interval;
        self
    }

    /// Replace the managed features.
    pub fn with_features(mut self, features: impl Into<Vec<Feature>>) -> Self {
        self.features = features.into();
        self
    }

    /// Replace the wall clock.
    pub fn with_clock(mut self, clock: impl Clock) -> Self {
        self.clock = Arc::new(clock);
        self
    }

    /// Replace the retry policy.
    pub fn with_retry(mut self, retry: RetryPolicy) -> Self {
        self.retry = retry;
        self
    }
}

impl Default for RotatorOptions {
    fn default() -> Self {
        Self {
            key_duration: DEFAULT_KEY_DURATION,
            rotation_interval: DEFAULT_ROTATION_INTERVAL,
            features: Feature::ALL.to_vec(),
            clock: Arc::new(SystemClock),
            retry: RetryPolicy::default(),
        }
    }
}

impl std::fmt::Debug for RotatorOptions {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.debug_struct("RotatorOptions")
            .field("key_duration", &self.key_duration)
            .field("rotation_interval", &self.rotation_interval)
            .field("features", &self.features)
            .field("retry", &self.retry)
            .finish_non_exhaustive()
    }
}

/// Creates, rotates and deletes keys for a fixed set of features.
pub struct Rotator {
    store: Arc<dyn Store>,
    options: RotatorOptions,
    /// Minimum lead time of a successor: three rotation intervals. `None`
    /// when that does not fit in a [`TimeDelta`].
    lead_time: Option<TimeDelta>,
}

impl Rotator {
    pub fn new(store: Arc<dyn Store>, options: RotatorOptions) -> Self {
        let lead_time = options
            .rotation_interval
            .checked_mul(3)
            .and_then(|lead| TimeDelta::from_std(lead).ok());
        Self {
            store,
            options,
            lead_time,
        }
    }

    /// Run one rotation pass across every configured feature.
    ///
    /// # Errors
    ///
    /// Any error rolls back the whole pass. [`RotateError::UnknownFeature`]
    /// means the store holds keys for a feature outside
    /// [`RotatorOptions::features`].
    pub async fn rotate_keys(&self) -> Result<RotationSummary, RotateError> {
        let mut tx = self
            .store
            .begin(IsolationLevel::RepeatableRead)
            .await
            .map_err(store_err("begin transaction"))?;

        if !tx
            .try_acquire_advisory_lock(LOCK_ID_CRYPTO_KEY_ROTATION)
            .await
            .map_err(store_err("acquire rotation lock"))?
        {
            debug!("crypto key rotation lock held elsewhere; skipping pass");
            return Ok(RotationSummary {
                skipped: true,
                ..RotationSummary::default()
            });
        }

        let now = self.options.clock.now();
        let keys = tx.list_keys().await.map_err(store_err("get crypto keys"))?;
        let by_feature = keys_by_feature(keys, &self.options.features)?;

        let mut summary = RotationSummary::default();
        for (feature, mut keys) in by_feature {
            keys.sort_by_key(|key| key.sequence);
            let mut valid = 0usize;

            for key in &keys {
                if should_delete(key, now) {
                    tx.delete_key(feature, key.sequence)
                        .await
                        .map_err(store_err("delete crypto key"))?;
                    debug!(feature = %feature, sequence = key.sequence, "deleted expired crypto key");
                    summary.deleted += 1;
                } else if should_rotate(key, now, self.options.key_duration) {
                    self.rotate_key(&*tx, key, now).await?;
                    summary.rotated += 1;
                    valid += 1;
                } else if key.deletes_at.is_none() {
                    valid += 1;
                }
            }

            if valid == 0 {
                let key = self.insert_key(&*tx, feature, now).await?;
                debug!(feature = %feature, sequence = key.sequence, "inserted crypto key for feature with no valid keys");
                summary.inserted += 1;
            }
        }

        tx.commit().await.map_err(store_err("commit rotation"))?;
        Ok(summary)
    }

    /// Insert `key`'s successor and schedule `key` for deletion once the
    /// successor has been active for [`ROTATION_MARGIN`] plus the feature's
    /// token lifetime.
    async fn rotate_key(
        &self,
        tx: &dyn Transaction,
        key: &Key,
        now: DateTime<Utc>,
    ) -> Result<(), RotateError> {
        let earliest = self
            .lead_time
            .and_then(|lead| now.checked_add_signed(lead))
            .ok_or(RotateError::TimeOutOfRange("successor start"))?;
        let expires_at = key
            .expires_at(self.options.key_duration)
            .ok_or(RotateError::TimeOutOfRange("key expiry"))?;
        let starts_at = max(earliest, expires_at);
        let deletes_at = starts_at
            .checked_add_signed(ROTATION_MARGIN + key.feature.token_duration())
            .ok_or(RotateError::TimeOutOfRange("key deletion time"))?;

        let successor = self.insert_key(tx, key.feature, starts_at).await?;
        tx.set_key_deletion(key.feature, key.sequence, deletes_at)
            .await
            .map_err(store_err("update crypto key deletes_at"))?;

        debug!(
            feature = %key.feature,
            old_sequence = key.sequence,
            new_sequence = successor.sequence,
            new_starts_at = %successor.starts_at,
            old_deletes_at = %deletes_at,
            "rotated crypto key"
        );
        Ok(())
    }

    /// Insert a fresh key one past the highest sequence the feature ever used.
    async fn insert_key(
        &self,
        tx: &dyn Transaction,
        feature: Feature,
        starts_at: DateTime<Utc>,
    ) -> Result<Key, RotateError> {
        let sequence = tx
            .latest_key(feature)
            .await
            .map_err(store_err("get latest crypto key"))?
            .map_or(1, |latest| latest.sequence + 1);
        let secret = generate_secret(feature)?;
        tx.insert_key(feature, sequence, secret, starts_at)
            .await
            .map_err(store_err("insert crypto key"))
    }

    /// Ticker loop: one pass per `rotation_interval` until `cancel` fires.
    async fn run(self, cancel: CancellationToken) {
        let mut ticker = tokio::time::interval(self.options.rotation_interval);
        ticker.set_missed_tick_behavior(MissedTickBehavior::Delay);
        // First tick fires immediately; the startup pass already covered it.
        ticker.tick().await;

        loop {
            tokio::select! {
                () = cancel.cancelled() => break,
                _ = ticker.tick() => {}
            }

            let pass = with_retry(&self.options.retry, "rotate_keys", || self.rotate_keys());
            let result = tokio::select! {
                () = cancel.cancelled() => break,
                result = pass => result,
            };
            match result {
                Ok(summary) if summary.is_noop() => {
                    debug!(skipped = summary.skipped, "crypto key rotation pass made no changes");
                }
                Ok(summary) => info!(
                    deleted = summary.deleted,
                    rotated = summary.rotated,
                    inserted = summary.inserted,
                    "crypto keys rotated"
                ),
                Err(e) => error!(error = %e, "crypto key rotation failed"),
            }
        }
        debug!("crypto key rotator stopped");
    }
}

/// Run one rotation pass, then spawn the rotation loop.
///
/// The initial pass is not retried; its failure is logged and the loop
/// tries again on the next tick. The returned task exits once `cancel`
/// fires.
pub async fn start_rotator(
    store: Arc<dyn Store>,
    options: RotatorOptions,
    cancel: CancellationToken,
) -> JoinHandle<()> {
    let rotator = Rotator::new(store, options);
    match rotator.rotate_keys().await {
        Ok(summary) => info!(
            deleted = summary.deleted,
            rotated = summary.rotated,
            inserted = summary.inserted,
            skipped = summary.skipped,
            "initial crypto key rotation complete"
        ),
        Err(e) => error!(error = %e, "initial crypto key rotation failed"),
    }
    tokio::spawn(rotator.run(cancel))
}

/// Group keys by feature, with an entry for every configured feature even
/// if it has no keys.
fn keys_by_feature(
    keys: Vec<Key>,
    features: &[Feature],
) -> Result<BTreeMap<Feature, Vec<Key>>, RotateError> {
    let mut by_feature: BTreeMap<Feature, Vec<Key>> =
        features.iter().map(|feature| (*feature, Vec::new())).collect();
    for key in keys {
        by_feature
            .get_mut(&key.feature)
            .ok_or(RotateError::UnknownFeature(key.feature))?
            .push(key);
    }
    Ok(by_feature)
}

fn should_delete(key: &Key, now: DateTime<Utc>) -> bool {
    key.deletes_at.is_some_and(|deletes_at| now >= deletes_at)
}

fn should_rotate(key: &Key, now: DateTime<Utc>, key_duration: TimeDelta) -> bool {
    key.deletes_at.is_none()
        && key
            .expires_at(key_duration)
            .is_some_and(|expires_at| now + ROTATION_MARGIN >= expires_at)
}
