//! Random secret generation from the OS CSPRNG.

use common::Feature;
use rand::{rngs::OsRng, RngCore};
use thiserror::Error;

/// Errors produced while generating key material.
#[derive(Debug, Error)]
pub enum SecretError {
    /// The operating system's random source failed.
    #[error("read random bytes: {0}")]
    Entropy(String),
}

/// Generate a hex-encoded secret of the right length for `feature`.
///
/// # Errors
///
/// Returns [`SecretError::Entropy`] if the OS random source is unavailable.
pub fn generate_secret(feature: Feature) -> Result<String, SecretError> {
    let mut bytes = vec![0u8; feature.secret_len()];
    OsRng
        .try_fill_bytes(&mut bytes)
        .map_err(|e| SecretError::Entropy(e.to_string()))?;
    let encoded = hex::encode(&bytes);
    // Zero the plaintext copy before it is freed.
    bytes.iter_mut().for_each(|b| *b = 0);
    Ok(encoded)
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn lengths_follow_feature() {
        for feature in Feature::ALL {
            let secret = generate_secret(feature).unwrap();
            let decoded = hex::decode(&secret).unwrap();
            assert_eq!(decoded.len(), feature.secret_len(), "{feature}");
        }
    }

    #[test]
    fn secrets_are_unique() {
        let a = generate_secret(Feature::TailnetResume).unwrap();
        let b = generate_secret(Feature::TailnetResume).unwrap();
        assert_ne!(a, b);
    }

    #[test]
    fn encryption_secret_is_32_bytes() {
        let secret = generate_secret(Feature::WorkspaceAppsApiKey).unwrap();
        assert_eq!(secret.len(), 64);
    }
}
