//! realm-sso - OAuth2/OIDC authorization code + PKCE client
//!
//! This library provides the token lifecycle engine for signing in against a
//! realm-based identity provider: PKCE generation, code exchange, refresh,
//! expiry tracking and credential persistence.

pub mod auth;
pub mod config;
pub mod error;
pub mod ui;

pub use error::{Error, Result};
