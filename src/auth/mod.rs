//! Authentication engine for the OAuth2 authorization code grant with PKCE
//!
//! This module provides:
//! - PKCE parameter generation
//! - Token bundle decoding, expiry and persistence
//! - Keychain and file-backed secure storage
//! - Token endpoint exchange and refresh
//! - The `AuthSession` controller tying a login attempt together
//! - A loopback callback server for capturing browser redirects

mod callback_server;
mod clock;
mod credentials;
mod keychain;
mod pkce;
mod protocol;
mod session;
mod store;
mod transport;

pub use callback_server::{CallbackServer, RedirectTarget};
pub use clock::{Clock, ManualClock, SystemClock};
pub use credentials::{
    is_access_expired, is_refresh_expired, CredentialStore, TokenBundle, DEFAULT_STORE_KEY,
};
pub use keychain::{KeyringStore, DEFAULT_SERVICE};
pub use pkce::{code_challenge, PkceParameters, CHALLENGE_METHOD};
pub use protocol::{Endpoints, TokenExchange, DEFAULT_AUTH_PATH, DEFAULT_TOKEN_PATH, REALM_PLACEHOLDER};
pub use session::{
    AuthSession, AuthorizationRequest, LoginCompletion, LoginOutcome, SessionConfig, SessionState,
};
pub use store::{FileStore, MemoryStore, SecureStore};
pub use transport::{FormRequest, HttpResponse, HttpTransport, ReqwestTransport, FORM_CONTENT_TYPE};
