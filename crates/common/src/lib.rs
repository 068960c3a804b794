//! Key model and error types shared across the crypto key lifecycle crates.

pub mod error;
pub mod key;

pub use error::{KeyError, StoreError};
pub use key::{Feature, FeatureKind, Key, Secret, UnknownFeature};
