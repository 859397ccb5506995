//! Token bundle and credential persistence
//!
//! A [`TokenBundle`] is decoded from a token endpoint response, stamped with the
//! instant it was issued, and stored base64-encoded JSON under a single key in
//! a [`SecureStore`].

use std::fmt;

use base64::{engine::general_purpose::STANDARD, Engine};
use chrono::{DateTime, Duration, Utc};
use serde::{Deserialize, Serialize};
use tracing::{debug, warn};

use super::store::SecureStore;
use crate::error::Error;
use crate::Result;

/// Default key the bundle is stored under
pub const DEFAULT_STORE_KEY: &str = "sso.credentials";

/// Token endpoint response body; every field is required
#[derive(Debug, Deserialize)]
struct TokenResponse {
    token_type: String,
    access_token: String,
    refresh_token: String,
    session_state: String,
    id_token: String,
    expires_in: i64,
    refresh_expires_in: i64,
    #[serde(rename = "not-before-policy")]
    not_before_policy: i64,
}

/// Tokens and metadata returned by a successful exchange or refresh
///
/// Immutable once built. A refresh produces a new bundle rather than updating
/// this one.
#[derive(Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct TokenBundle {
    token_type: String,
    access_token: String,
    refresh_token: String,
    session_state: String,
    id_token: String,
    expires_in: i64,
    refresh_expires_in: i64,
    #[serde(rename = "not-before-policy")]
    not_before_policy: i64,
    /// When the bundle was constructed; expiry is measured from here
    issued_at: DateTime<Utc>,
}

impl TokenBundle {
    /// Decode a token endpoint JSON body
    ///
    /// Missing or mistyped fields produce [`Error::MalformedResponse`].
    pub fn from_response(body: &str, issued_at: DateTime<Utc>) -> Result<Self> {
        let response: TokenResponse = serde_json::from_str(body)
            .map_err(|e| Error::MalformedResponse(e.to_string()))?;

        Ok(Self {
            token_type: response.token_type,
            access_token: response.access_token,
            refresh_token: response.refresh_token,
            session_state: response.session_state,
            id_token: response.id_token,
            expires_in: response.expires_in,
            refresh_expires_in: response.refresh_expires_in,
            not_before_policy: response.not_before_policy,
            issued_at,
        })
    }

    pub fn token_type(&self) -> &str {
        &self.token_type
    }

    pub fn access_token(&self) -> &str {
        &self.access_token
    }

    pub fn refresh_token(&self) -> &str {
        &self.refresh_token
    }

    pub fn session_state(&self) -> &str {
        &self.session_state
    }

    pub fn id_token(&self) -> &str {
        &self.id_token
    }

    /// Access token lifetime in seconds
    pub fn expires_in(&self) -> i64 {
        self.expires_in
    }

    /// Refresh token lifetime in seconds
    pub fn refresh_expires_in(&self) -> i64 {
        self.refresh_expires_in
    }

    pub fn not_before_policy(&self) -> i64 {
        self.not_before_policy
    }

    pub fn issued_at(&self) -> DateTime<Utc> {
        self.issued_at
    }

    pub fn access_expires_at(&self) -> DateTime<Utc> {
        expiry_instant(self.issued_at, self.expires_in)
    }

    pub fn refresh_expires_at(&self) -> DateTime<Utc> {
        expiry_instant(self.issued_at, self.refresh_expires_in)
    }
}

// Saturates instead of panicking on absurd lifetimes from the provider
fn expiry_instant(issued_at: DateTime<Utc>, seconds: i64) -> DateTime<Utc> {
    Duration::try_seconds(seconds)
        .and_then(|lifetime| issued_at.checked_add_signed(lifetime))
        .unwrap_or(if seconds < 0 {
            DateTime::<Utc>::MIN_UTC
        } else {
            DateTime::<Utc>::MAX_UTC
        })
}

// Tokens are secrets, keep them out of logs and panic messages
impl fmt::Debug for TokenBundle {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.debug_struct("TokenBundle")
            .field("token_type", &self.token_type)
            .field("access_token", &"<redacted>")
            .field("refresh_token", &"<redacted>")
            .field("session_state", &self.session_state)
            .field("id_token", &"<redacted>")
            .field("expires_in", &self.expires_in)
            .field("refresh_expires_in", &self.refresh_expires_in)
            .field("not_before_policy", &self.not_before_policy)
            .field("issued_at", &self.issued_at)
            .finish()
    }
}

/// True once `now` is past the access token's expiry instant
pub fn is_access_expired(bundle: &TokenBundle, now: DateTime<Utc>) -> bool {
    now > bundle.access_expires_at()
}

/// True once `now` is past the refresh token's expiry instant
pub fn is_refresh_expired(bundle: &TokenBundle, now: DateTime<Utc>) -> bool {
    now > bundle.refresh_expires_at()
}

/// Persists a single [`TokenBundle`] in a [`SecureStore`]
pub struct CredentialStore<S: SecureStore> {
    store: S,
    key: String,
}

impl<S: SecureStore> CredentialStore<S> {
    pub fn new(store: S) -> Self {
        Self::with_key(store, DEFAULT_STORE_KEY)
    }

    pub fn with_key(store: S, key: impl Into<String>) -> Self {
        Self {
            store,
            key: key.into(),
        }
    }

    pub fn key(&self) -> &str {
        &self.key
    }

    /// Load the stored bundle
    ///
    /// A missing, unreadable or undecodable entry is reported as `None`.
    pub fn load(&self) -> Option<TokenBundle> {
        let encoded = match self.store.get(&self.key) {
            Ok(Some(value)) => value,
            Ok(None) => {
                debug!("No stored credentials under {}", self.key);
                return None;
            }
            Err(e) => {
                warn!("Failed to read stored credentials: {}", e);
                return None;
            }
        };

        match decode_bundle(&encoded) {
            Ok(bundle) => Some(bundle),
            Err(e) => {
                warn!("Discarding unreadable stored credentials: {}", e);
                None
            }
        }
    }

    /// Persist `bundle`, replacing whatever was stored before
    ///
    /// Any failure is reported as [`Error::StorageWriteFailed`].
    pub fn save(&self, bundle: &TokenBundle) -> Result<()> {
        let json = serde_json::to_vec(bundle)
            .map_err(|e| Error::StorageWriteFailed(e.to_string()))?;

        self.store
            .set(&self.key, &STANDARD.encode(json))
            .map_err(|e| Error::StorageWriteFailed(e.to_string()))?;

        debug!("Stored credentials under {}", self.key);
        Ok(())
    }

    /// Delete the stored bundle; a missing entry is not an error
    pub fn remove(&self) -> Result<()> {
        self.store.remove(&self.key)
    }
}

fn decode_bundle(encoded: &str) -> Result<TokenBundle> {
    let json = STANDARD
        .decode(encoded.trim())
        .map_err(|e| Error::Storage(format!("Invalid base64: {}", e)))?;
    Ok(serde_json::from_slice(&json)?)
}
