//! `keyd`: key rotation daemon entry point.
//!
//! Startup sequence:
//! 1. Load and validate [`Config`] from environment variables.
//! 2. Initialise the tracing subscriber (and OTLP export, if configured).
//! 3. Open the key store.
//! 4. Run the initial rotation pass and spawn the rotator.
//! 5. Build one key cache per managed feature and report its current key.
//! 6. Run until ctrl-c, then stop the rotator and close the caches.

use std::sync::Arc;

use anyhow::{Context, Result};
use common::{Feature, FeatureKind};
use tokio_util::sync::CancellationToken;
use tracing::{info, warn};

use keyd::cache::{CacheOptions, EncryptionKeycache, KeyCache, SigningKeycache, StoreFetcher};
use keyd::config::Config;
use keyd::rotator::{self, RotatorOptions};
use keyd::store::{MemoryStore, Store};
use keyd::telemetry;

#[tokio::main]
async fn main() -> Result<()> {
    // -----------------------------------------------------------------------
    // 1. Configuration
    // -----------------------------------------------------------------------
    let cfg = Config::from_env().map_err(|e| {
        // Telemetry is not yet up; write to stderr directly.
        eprintln!("ERROR: configuration invalid: {e:#}");
        e
    })?;
    let features = cfg.features()?;

    // -----------------------------------------------------------------------
    // 2. Telemetry
    // -----------------------------------------------------------------------
    telemetry::init_telemetry(&cfg.log_level, cfg.otel_exporter_otlp_endpoint.as_deref())?;
    info!(
        version = env!("CARGO_PKG_VERSION"),
        features = ?features,
        key_duration_secs = cfg.key_duration_secs,
        rotation_interval_secs = cfg.rotation_interval_secs,
        "keyd starting"
    );

    // -----------------------------------------------------------------------
    // 3. Key store
    // -----------------------------------------------------------------------
    let store: Arc<dyn Store> = Arc::new(MemoryStore::new());

    // -----------------------------------------------------------------------
    // 4. Rotator
    // -----------------------------------------------------------------------
    let shutdown = CancellationToken::new();
    let rotation = rotator::start_rotator(
        Arc::clone(&store),
        RotatorOptions::default()
            .with_key_duration(cfg.key_duration())
            .with_rotation_interval(cfg.rotation_interval())
            .with_features(features.clone()),
        shutdown.clone(),
    )
    .await;

    // -----------------------------------------------------------------------
    // 5. Caches
    // -----------------------------------------------------------------------
    let fetcher = Arc::new(StoreFetcher::new(Arc::clone(&store)));
    let options = CacheOptions::default().with_refresh_interval(cfg.cache_refresh_interval());
    let mut caches = Vec::with_capacity(features.len());
    for feature in features {
        let cache = open_cache(fetcher.clone(), feature, options.clone()).await?;
        caches.push(cache);
    }

    // -----------------------------------------------------------------------
    // 6. Run until shutdown
    // -----------------------------------------------------------------------
    tokio::signal::ctrl_c()
        .await
        .context("failed to listen for shutdown signal")?;
    info!("shutdown requested");

    shutdown.cancel();
    for cache in &caches {
        cache.close();
    }
    if let Err(e) = rotation.await {
        warn!(error = %e, "rotator task ended abnormally");
    }
    telemetry::shutdown_telemetry();

    Ok(())
}

/// Build the cache for `feature` and log the key it would hand out now.
async fn open_cache(
    fetcher: Arc<StoreFetcher<dyn Store>>,
    feature: Feature,
    options: CacheOptions,
) -> Result<KeyCache> {
    let (cache, current) = match feature.kind() {
        FeatureKind::Signing => {
            let cache = KeyCache::signing(fetcher, feature, options)
                .await
                .with_context(|| format!("failed to build {feature} cache"))?;
            let current = cache.signing_key().await.map(|(kid, _)| kid);
            (cache, current)
        }
        FeatureKind::Encryption => {
            let cache = KeyCache::encryption(fetcher, feature, options)
                .await
                .with_context(|| format!("failed to build {feature} cache"))?;
            let current = cache.encrypting_key().await.map(|(kid, _)| kid);
            (cache, current)
        }
    };

    match current {
        Ok(kid) => info!(feature = %feature, kid = %kid, "crypto key cache ready"),
        Err(e) => warn!(feature = %feature, error = %e, "crypto key cache has no usable key yet"),
    }
    Ok(cache)
}
