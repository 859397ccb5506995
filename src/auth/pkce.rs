//! PKCE (Proof Key for Code Exchange) utilities for OAuth2
//!
//! Implements the S256 method of RFC 7636 for the authorization code grant.

use std::fmt;

use base64::{engine::general_purpose::URL_SAFE_NO_PAD, Engine};
use rand::rngs::OsRng;
use rand::RngCore;
use sha2::{Digest, Sha256};

use crate::error::Error;
use crate::Result;

/// Number of random bytes drawn for the code verifier (43 characters once encoded)
const VERIFIER_ENTROPY_BYTES: usize = 32;

/// The only challenge method this client speaks
pub const CHALLENGE_METHOD: &str = "S256";

/// Derive the code challenge for a verifier: BASE64URL(SHA256(ascii(verifier)))
pub fn code_challenge(verifier: &str) -> String {
    let mut hasher = Sha256::new();
    hasher.update(verifier.as_bytes());
    URL_SAFE_NO_PAD.encode(hasher.finalize())
}

/// Verifier, challenge and method for a single login attempt
///
/// Lives only in memory for the duration of the attempt; never persisted.
#[derive(Clone, PartialEq, Eq)]
pub struct PkceParameters {
    verifier: String,
    challenge: String,
}

impl PkceParameters {
    /// Generate fresh parameters from the operating system CSPRNG
    ///
    /// Fails only when the random source cannot be read, in which case no
    /// login attempt can be started.
    pub fn generate() -> Result<Self> {
        let mut bytes = [0u8; VERIFIER_ENTROPY_BYTES];
        OsRng
            .try_fill_bytes(&mut bytes)
            .map_err(|e| Error::RandomSourceUnavailable(e.to_string()))?;

        Ok(Self::from_verifier(URL_SAFE_NO_PAD.encode(bytes)))
    }

    /// Rebuild parameters around a known verifier
    pub fn from_verifier(verifier: impl Into<String>) -> Self {
        let verifier = verifier.into();
        let challenge = code_challenge(&verifier);
        Self { verifier, challenge }
    }

    pub fn verifier(&self) -> &str {
        &self.verifier
    }

    pub fn challenge(&self) -> &str {
        &self.challenge
    }

    pub fn method(&self) -> &'static str {
        CHALLENGE_METHOD
    }
}

impl fmt::Debug for PkceParameters {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.debug_struct("PkceParameters")
            .field("verifier", &"<redacted>")
            .field("challenge", &self.challenge)
            .field("method", &CHALLENGE_METHOD)
            .finish()
    }
}
