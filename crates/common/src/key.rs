//! Versioned symmetric keys, the features they serve, and their validity rules.
//!
//! A [`Key`] is identified by its [`Feature`] and a per-feature sequence
//! number. The sequence doubles as the `kid` handed to token consumers.

use std::fmt;
use std::ops::Deref;
use std::str::FromStr;

use chrono::{DateTime, TimeDelta, Utc};
use serde::{Deserialize, Serialize};

use crate::error::KeyError;

// ---------------------------------------------------------------------------
// Features
// ---------------------------------------------------------------------------

/// Whether a feature's keys sign or encrypt. A feature is never both.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash)]
pub enum FeatureKind {
    /// HMAC-style signing and verification.
    Signing,
    /// Symmetric encryption and decryption.
    Encryption,
}

impl fmt::Display for FeatureKind {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        match self {
            FeatureKind::Signing => f.write_str("signing"),
            FeatureKind::Encryption => f.write_str("encryption"),
        }
    }
}

/// A use-case partition with its own independent key lifecycle.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, PartialOrd, Ord, Serialize, Deserialize)]
#[serde(rename_all = "snake_case")]
pub enum Feature {
    /// Signs workspace application session tokens.
    WorkspaceAppsToken,
    /// Encrypts API keys smuggled to workspace applications.
    WorkspaceAppsApiKey,
    /// Signs OIDC login-type conversion state.
    OidcConvert,
    /// Signs tailnet session resumption tokens.
    TailnetResume,
}

impl Feature {
    /// Every known feature, in a stable order.
    pub const ALL: [Feature; 4] = [
        Feature::WorkspaceAppsToken,
        Feature::WorkspaceAppsApiKey,
        Feature::OidcConvert,
        Feature::TailnetResume,
    ];

    /// Canonical snake_case name, as used in configuration and storage.
    pub fn as_str(&self) -> &'static str {
        match self {
            Feature::WorkspaceAppsToken => "workspace_apps_token",
            Feature::WorkspaceAppsApiKey => "workspace_apps_api_key",
            Feature::OidcConvert => "oidc_convert",
            Feature::TailnetResume => "tailnet_resume",
        }
    }

    /// Whether this feature's keys sign or encrypt.
    pub fn kind(&self) -> FeatureKind {
        match self {
            Feature::WorkspaceAppsApiKey => FeatureKind::Encryption,
            Feature::WorkspaceAppsToken | Feature::OidcConvert | Feature::TailnetResume => {
                FeatureKind::Signing
            }
        }
    }

    /// Length in bytes of a freshly generated secret for this feature.
    pub fn secret_len(&self) -> usize {
        match self.kind() {
            FeatureKind::Encryption => 32,
            FeatureKind::Signing => 64,
        }
    }

    /// Maximum lifetime of a token issued with this feature's keys.
    ///
    /// A retiring key stays verifiable for at least this long after its
    /// successor takes over.
    pub fn token_duration(&self) -> TimeDelta {
        match self {
            Feature::WorkspaceAppsToken | Feature::WorkspaceAppsApiKey => TimeDelta::minutes(1),
            Feature::OidcConvert => TimeDelta::minutes(5),
            Feature::TailnetResume => TimeDelta::hours(24),
        }
    }
}

impl fmt::Display for Feature {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.write_str(self.as_str())
    }
}

impl FromStr for Feature {
    type Err = UnknownFeature;

    fn from_str(s: &str) -> Result<Self, Self::Err> {
        Feature::ALL
            .into_iter()
            .find(|feature| feature.as_str() == s)
            .ok_or_else(|| UnknownFeature(s.to_owned()))
    }
}

/// A feature name that does not match any [`Feature`].
#[derive(Debug, Clone, PartialEq, Eq, thiserror::Error)]
#[error("unknown crypto key feature {0:?}")]
pub struct UnknownFeature(pub String);

// ---------------------------------------------------------------------------
// Secret bytes
// ---------------------------------------------------------------------------

/// Decoded key material handed to signers and ciphers.
///
/// When this type is dropped, the buffer is overwritten with zeroes to
/// shorten the window during which plaintext key material lives in RAM.
#[derive(Clone, PartialEq, Eq)]
pub struct Secret(Vec<u8>);

impl Secret {
    /// Wrap raw key bytes.
    pub fn new(bytes: Vec<u8>) -> Self {
        Self(bytes)
    }
}

impl Deref for Secret {
    type Target = [u8];

    fn deref(&self) -> &[u8] {
        &self.0
    }
}

impl AsRef<[u8]> for Secret {
    fn as_ref(&self) -> &[u8] {
        &self.0
    }
}

impl Drop for Secret {
    fn drop(&mut self) {
        self.0.iter_mut().for_each(|b| *b = 0);
    }
}

impl fmt::Debug for Secret {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        // Never print key material, not even in debug builds.
        f.write_str("Secret([REDACTED])")
    }
}

// ---------------------------------------------------------------------------
// Keys
// ---------------------------------------------------------------------------

/// One version of a feature's key.
///
/// `secret` is hex-encoded at rest and is `None` once the key has been
/// deleted; deleted keys are kept only so their sequence is never reissued.
#[derive(Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct Key {
    pub feature: Feature,
    pub sequence: i32,
    pub secret: Option<String>,
    pub starts_at: DateTime<Utc>,
    pub deletes_at: Option<DateTime<Utc>>,
}

impl Key {
    /// The public key identifier: the decimal sequence number.
    pub fn id(&self) -> String {
        self.sequence.to_string()
    }

    /// Whether the key has been deleted from the store.
    pub fn is_deleted(&self) -> bool {
        self.secret.is_none()
    }

    /// End of the key's active signing window, before any deletion is scheduled.
    /// `None` when the window runs past the representable range.
    pub fn expires_at(&self, key_duration: TimeDelta) -> Option<DateTime<Utc>> {
        self.starts_at.checked_add_signed(key_duration)
    }

    /// Whether the key may sign or encrypt at `now`.
    pub fn can_sign(&self, now: DateTime<Utc>) -> bool {
        !self.is_deleted() && self.starts_at <= now && self.before_deletion(now)
    }

    /// Whether the key may verify or decrypt at `now`.
    ///
    /// `starts_at` is not checked: a peer whose clock trails the issuer's
    /// must still accept tokens signed with a key that, from its point of
    /// view, has not started yet.
    pub fn can_verify(&self, now: DateTime<Utc>) -> bool {
        !self.is_deleted() && self.before_deletion(now)
    }

    /// Decode the hex secret into raw key bytes.
    ///
    /// # Errors
    ///
    /// Returns [`KeyError::MalformedSecret`] if the key was deleted or the
    /// stored secret is not valid hex.
    pub fn decode_secret(&self) -> Result<Secret, KeyError> {
        let encoded = self
            .secret
            .as_deref()
            .ok_or_else(|| KeyError::MalformedSecret(format!("key {} has no secret", self.sequence)))?;
        hex::decode(encoded)
            .map(Secret::new)
            .map_err(|e| KeyError::MalformedSecret(format!("key {}: {e}", self.sequence)))
    }

    fn before_deletion(&self, now: DateTime<Utc>) -> bool {
        self.deletes_at.map_or(true, |deletes_at| now < deletes_at)
    }
}

impl fmt::Debug for Key {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.debug_struct("Key")
            .field("feature", &self.feature)
            .field("sequence", &self.sequence)
            .field("secret", &self.secret.as_ref().map(|_| "[REDACTED]"))
            .field("starts_at", &self.starts_at)
            .field("deletes_at", &self.deletes_at)
            .finish()
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    fn key_at(starts_at: DateTime<Utc>, deletes_at: Option<DateTime<Utc>>) -> Key {
        Key {
            feature: Feature::TailnetResume,
            sequence: 7,
            secret: Some(hex::encode([0xAB; 64])),
            starts_at,
            deletes_at,
        }
    }

    #[test]
    fn feature_kinds_and_secret_lengths() {
        assert_eq!(Feature::WorkspaceAppsApiKey.kind(), FeatureKind::Encryption);
        assert_eq!(Feature::WorkspaceAppsApiKey.secret_len(), 32);
        for feature in [Feature::WorkspaceAppsToken, Feature::OidcConvert, Feature::TailnetResume] {
            assert_eq!(feature.kind(), FeatureKind::Signing);
            assert_eq!(feature.secret_len(), 64);
        }
    }

    #[test]
    fn token_durations() {
        assert_eq!(Feature::WorkspaceAppsToken.token_duration(), TimeDelta::minutes(1));
        assert_eq!(Feature::WorkspaceAppsApiKey.token_duration(), TimeDelta::minutes(1));
        assert_eq!(Feature::OidcConvert.token_duration(), TimeDelta::minutes(5));
        assert_eq!(Feature::TailnetResume.token_duration(), TimeDelta::hours(24));
    }

    #[test]
    fn feature_names_parse_back() {
        for feature in Feature::ALL {
            assert_eq!(feature.as_str().parse::<Feature>().unwrap(), feature);
        }
        let err = "unknown".parse::<Feature>().unwrap_err();
        assert_eq!(err, UnknownFeature("unknown".into()));
    }

    #[test]
    fn feature_serde_uses_snake_case() {
        let json = serde_json::to_string(&Feature::WorkspaceAppsApiKey).unwrap();
        assert_eq!(json, "\"workspace_apps_api_key\"");
    }

    #[test]
    fn can_sign_respects_window() {
        let now = Utc::now();
        assert!(key_at(now, None).can_sign(now));
        assert!(!key_at(now + TimeDelta::seconds(1), None).can_sign(now));
        assert!(key_at(now - TimeDelta::seconds(1), Some(now + TimeDelta::seconds(1))).can_sign(now));
        // deletes_at is exclusive.
        assert!(!key_at(now - TimeDelta::seconds(1), Some(now)).can_sign(now));
    }

    #[test]
    fn can_verify_ignores_starts_at() {
        let now = Utc::now();
        let future = key_at(now + TimeDelta::seconds(1), None);
        assert!(!future.can_sign(now));
        assert!(future.can_verify(now));
        assert!(!key_at(now - TimeDelta::hours(1), Some(now)).can_verify(now));
    }

    #[test]
    fn deleted_key_is_unusable() {
        let now = Utc::now();
        let mut key = key_at(now, None);
        key.secret = None;
        assert!(key.is_deleted());
        assert!(!key.can_sign(now));
        assert!(!key.can_verify(now));
        assert!(matches!(key.decode_secret(), Err(KeyError::MalformedSecret(_))));
    }

    #[test]
    fn expires_at_adds_duration() {
        let now = Utc::now();
        assert_eq!(key_at(now, None).expires_at(TimeDelta::days(7)), Some(now + TimeDelta::days(7)));
        assert_eq!(key_at(now, None).expires_at(TimeDelta::MAX), None);
    }

    #[test]
    fn decode_secret_and_id() {
        let key = key_at(Utc::now(), None);
        assert_eq!(key.id(), "7");
        let secret = key.decode_secret().unwrap();
        assert_eq!(secret.len(), 64);
        assert!(secret.iter().all(|b| *b == 0xAB));
    }

    #[test]
    fn bad_hex_is_malformed() {
        let mut key = key_at(Utc::now(), None);
        key.secret = Some("zz".into());
        assert!(matches!(key.decode_secret(), Err(KeyError::MalformedSecret(_))));
    }

    #[test]
    fn debug_output_is_redacted() {
        let key = key_at(Utc::now(), None);
        let rendered = format!("{key:?}");
        assert!(rendered.contains("REDACTED"));
        assert!(!rendered.contains("abab"));
        assert_eq!(format!("{:?}", Secret::new(vec![1, 2, 3])), "Secret([REDACTED])");
    }
}
