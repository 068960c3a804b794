//! Error taxonomy shared by the key caches, the rotator and store implementations.

use thiserror::Error;

use crate::key::{Feature, FeatureKind};

/// Errors returned to callers asking a cache for key material.
///
/// None of these are retried by the caches themselves:
/// - [`KeyError::NotFound`] and [`KeyError::Fetch`] leave retry to the caller.
/// - [`KeyError::Invalid`] is a hard rejection of the requested key.
/// - [`KeyError::Closed`] and [`KeyError::InvalidFeature`] are permanent.
#[derive(Debug, Clone, PartialEq, Eq, Error)]
pub enum KeyError {
    /// No key matches the requested identity.
    #[error("key not found")]
    NotFound,

    /// A key matched but is outside its validity window for the requested use.
    #[error("key is invalid")]
    Invalid,

    /// The cache has been closed.
    #[error("closed")]
    Closed,

    /// The cache was built for a feature of a different kind than the call needs.
    #[error("invalid feature {feature}: expected a {expected} feature")]
    InvalidFeature {
        /// The feature the cache serves.
        feature: Feature,
        /// The kind the operation requires.
        expected: FeatureKind,
    },

    /// The supplied key id is not a decimal sequence number.
    #[error("parse key id {0:?}")]
    InvalidKeyId(String),

    /// The stored secret could not be decoded.
    #[error("malformed secret: {0}")]
    MalformedSecret(String),

    /// A cache refresh against the store failed.
    #[error("fetch: {0}")]
    Fetch(StoreError),

    /// Listing a feature's keys failed.
    #[error("get keys: {0}")]
    GetKeys(StoreError),
}

/// Errors produced by key store implementations.
#[derive(Debug, Clone, PartialEq, Eq, Error)]
pub enum StoreError {
    /// No row matches the requested feature and sequence.
    #[error("no rows")]
    NotFound,

    /// A row with the same identity already exists, or a write lost a race.
    #[error("conflict: {0}")]
    Conflict(String),

    /// The store could not be reached.
    #[error("store unavailable: {0}")]
    Unavailable(String),

    /// The transaction could not be serialized against a concurrent one.
    #[error("serialization failure: {0}")]
    Serialization(String),

    /// Any other backend failure.
    #[error("internal store error: {0}")]
    Internal(String),
}

impl StoreError {
    /// Whether repeating the same operation may succeed.
    pub fn is_transient(&self) -> bool {
        matches!(self, StoreError::Unavailable(_) | StoreError::Serialization(_))
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn store_errors_are_wrapped_with_context() {
        let fetch = KeyError::Fetch(StoreError::Unavailable("connection refused".into()));
        assert_eq!(fetch.to_string(), "fetch: store unavailable: connection refused");

        let get = KeyError::GetKeys(StoreError::NotFound);
        assert_eq!(get.to_string(), "get keys: no rows");
    }

    #[test]
    fn invalid_feature_names_both_sides() {
        let e = KeyError::InvalidFeature {
            feature: Feature::WorkspaceAppsApiKey,
            expected: FeatureKind::Signing,
        };
        assert_eq!(
            e.to_string(),
            "invalid feature workspace_apps_api_key: expected a signing feature"
        );
    }

    #[test]
    fn transient_classification() {
        assert!(StoreError::Unavailable("x".into()).is_transient());
        assert!(StoreError::Serialization("x".into()).is_transient());
        assert!(!StoreError::NotFound.is_transient());
        assert!(!StoreError::Conflict("x".into()).is_transient());
        assert!(!StoreError::Internal("x".into()).is_transient());
    }
}
