//! Key material generation for new crypto keys.
//!
//! Nothing here touches the store or the caches.
//!
//! # Secret format
//!
//! ```text
//! hex(<feature.secret_len() random bytes>)
//! ```
//!
//! 32 bytes for encryption features, 64 bytes for signing features.

pub mod secret;

pub use secret::{generate_secret, SecretError};
