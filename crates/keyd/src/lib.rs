//! `keyd`: crypto key lifecycle for token signing and payload encryption.
//!
//! - [`rotator`] creates, rotates and deletes versioned keys in a [`store`].
//! - [`cache`] hands the current key and historical keys to signers,
//!   verifiers and ciphers without a store round-trip per call.

pub mod cache;
pub mod clock;
pub mod config;
pub mod crypto;
pub mod rotator;
pub mod store;
pub mod telemetry;
