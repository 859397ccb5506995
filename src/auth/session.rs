//! AuthSession - the login / refresh state machine for one identity provider
//!
//! Owns the PKCE parameters of the current login attempt, the held token
//! bundle and the pending completion. All mutable state sits behind a mutex
//! that is never held across an await, so the session can be shared between
//! tasks through an `Arc`. At most one login and one refresh may be in flight;
//! overlapping calls are rejected rather than queued.

use std::fmt;
use std::sync::{Arc, Mutex, MutexGuard};

use tracing::{debug, info, warn};
use url::Url;

use super::clock::{Clock, SystemClock};
use super::credentials::{
    is_access_expired, is_refresh_expired, CredentialStore, TokenBundle, DEFAULT_STORE_KEY,
};
use super::pkce::PkceParameters;
use super::protocol::{Endpoints, TokenExchange, DEFAULT_AUTH_PATH, DEFAULT_TOKEN_PATH, RESPONSE_TYPE_CODE};
use super::store::SecureStore;
use super::transport::HttpTransport;
use crate::error::Error;
use crate::Result;

/// Invoked exactly once with the outcome of a login attempt
pub type LoginCompletion = Box<dyn FnOnce(Result<TokenBundle>) + Send + 'static>;

/// Settings describing the relationship with one identity provider
#[derive(Debug, Clone)]
pub struct SessionConfig {
    pub base_url: Url,
    pub redirect_uri: String,
    pub client_id: String,
    pub realm: String,
    /// Sent only on the authorization redirect
    pub idp_hint: Option<String>,
    pub scope: Option<String>,
    pub auth_path: String,
    pub token_path: String,
    pub store_key: String,
}

impl SessionConfig {
    pub fn new(
        base_url: Url,
        redirect_uri: impl Into<String>,
        client_id: impl Into<String>,
        realm: impl Into<String>,
    ) -> Self {
        Self {
            base_url,
            redirect_uri: redirect_uri.into(),
            client_id: client_id.into(),
            realm: realm.into(),
            idp_hint: None,
            scope: None,
            auth_path: DEFAULT_AUTH_PATH.to_string(),
            token_path: DEFAULT_TOKEN_PATH.to_string(),
            store_key: DEFAULT_STORE_KEY.to_string(),
        }
    }

    pub fn with_idp_hint(mut self, idp_hint: impl Into<String>) -> Self {
        self.idp_hint = Some(idp_hint.into());
        self
    }

    pub fn with_scope(mut self, scope: impl Into<String>) -> Self {
        self.scope = Some(scope.into());
        self
    }
}

/// What the login UI reports back for a pending attempt
#[derive(Debug)]
pub enum LoginOutcome {
    /// Redirect captured with a one-time authorization code
    Succeeded(String),
    /// The UI or provider reported an error
    Failed(Error),
    /// The UI was closed without a result
    Dismissed,
}

/// Everything the login UI needs to run the browser leg of a login
#[derive(Clone)]
pub struct AuthorizationRequest {
    pub url: Url,
    pub redirect_uri: String,
    pub code_challenge: String,
    pub code_challenge_method: &'static str,
    code_verifier: String,
}

impl AuthorizationRequest {
    pub fn code_verifier(&self) -> &str {
        &self.code_verifier
    }
}

impl fmt::Debug for AuthorizationRequest {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.debug_struct("AuthorizationRequest")
            .field("url", &self.url.as_str())
            .field("redirect_uri", &self.redirect_uri)
            .field("code_challenge", &self.code_challenge)
            .field("code_challenge_method", &self.code_challenge_method)
            .finish_non_exhaustive()
    }
}

/// Observable state of a session
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum SessionState {
    Unauthenticated,
    LoginPending,
    Exchanging,
    Authenticated,
    Refreshing,
}

enum LoginSlot {
    Idle,
    Pending {
        pkce: PkceParameters,
        completion: LoginCompletion,
    },
    Exchanging,
}

struct Inner {
    bundle: Option<TokenBundle>,
    login: LoginSlot,
    refreshing: bool,
}

fn lock(inner: &Mutex<Inner>) -> MutexGuard<'_, Inner> {
    inner.lock().unwrap_or_else(|e| e.into_inner())
}

/// Auth session controller
pub struct AuthSession<T: HttpTransport, S: SecureStore> {
    config: SessionConfig,
    protocol: TokenExchange<T>,
    credentials: CredentialStore<S>,
    clock: Arc<dyn Clock>,
    inner: Mutex<Inner>,
}

impl<T: HttpTransport, S: SecureStore> AuthSession<T, S> {
    /// Create a session, picking up any bundle persisted by an earlier run
    pub fn new(config: SessionConfig, transport: T, store: S) -> Self {
        Self::with_clock(config, transport, store, Arc::new(SystemClock))
    }

    pub fn with_clock(config: SessionConfig, transport: T, store: S, clock: Arc<dyn Clock>) -> Self {
        let endpoints = Endpoints::with_paths(
            config.base_url.clone(),
            config.auth_path.clone(),
            config.token_path.clone(),
        );
        let protocol = TokenExchange::new(transport, endpoints).with_clock(clock.clone());
        let credentials = CredentialStore::with_key(store, config.store_key.clone());

        let bundle = credentials.load();
        if bundle.is_some() {
            debug!("Loaded stored credentials for realm {}", config.realm);
        }

        Self {
            config,
            protocol,
            credentials,
            clock,
            inner: Mutex::new(Inner {
                bundle,
                login: LoginSlot::Idle,
                refreshing: false,
            }),
        }
    }

    pub fn config(&self) -> &SessionConfig {
        &self.config
    }

    /// The held bundle, expired or not
    pub fn bundle(&self) -> Option<TokenBundle> {
        lock(&self.inner).bundle.clone()
    }

    /// True iff a bundle is held and its access token has not expired
    pub fn is_authenticated(&self) -> bool {
        let now = self.clock.now();
        lock(&self.inner)
            .bundle
            .as_ref()
            .is_some_and(|bundle| !is_access_expired(bundle, now))
    }

    pub fn state(&self) -> SessionState {
        let now = self.clock.now();
        let inner = lock(&self.inner);
        match inner.login {
            LoginSlot::Exchanging => return SessionState::Exchanging,
            LoginSlot::Pending { .. } => return SessionState::LoginPending,
            LoginSlot::Idle => {}
        }
        if inner.refreshing {
            return SessionState::Refreshing;
        }
        match &inner.bundle {
            Some(bundle) if !is_access_expired(bundle, now) => SessionState::Authenticated,
            _ => SessionState::Unauthenticated,
        }
    }

    /// Start a login attempt
    ///
    /// Generates fresh PKCE parameters and returns the request the login UI
    /// should present. `completion` fires exactly once, after the UI result
    /// has been handed to [`AuthSession::complete_login`] (or the attempt is
    /// cancelled). Fails with [`Error::LoginInProgress`] if an attempt is
    /// already pending, leaving that attempt untouched.
    pub fn begin_login<F>(&self, completion: F) -> Result<AuthorizationRequest>
    where
        F: FnOnce(Result<TokenBundle>) + Send + 'static,
    {
        let mut inner = lock(&self.inner);
        if !matches!(inner.login, LoginSlot::Idle) {
            warn!("Rejecting login while another attempt is in flight");
            return Err(Error::LoginInProgress);
        }

        let pkce = PkceParameters::generate()?;
        let request = self.authorization_request(&pkce)?;

        inner.login = LoginSlot::Pending {
            pkce,
            completion: Box::new(completion),
        };
        info!("Login started for realm {}", self.config.realm);
        Ok(request)
    }

    fn authorization_request(&self, pkce: &PkceParameters) -> Result<AuthorizationRequest> {
        let mut url = self.protocol.endpoints().authorization_url(&self.config.realm)?;
        {
            let mut query = url.query_pairs_mut();
            query
                .append_pair("client_id", &self.config.client_id)
                .append_pair("redirect_uri", &self.config.redirect_uri)
                .append_pair("response_type", RESPONSE_TYPE_CODE)
                .append_pair("code_challenge", pkce.challenge())
                .append_pair("code_challenge_method", pkce.method());
            if let Some(scope) = &self.config.scope {
                query.append_pair("scope", scope);
            }
            if let Some(hint) = &self.config.idp_hint {
                query.append_pair("idp_hint", hint);
            }
        }

        Ok(AuthorizationRequest {
            url,
            redirect_uri: self.config.redirect_uri.clone(),
            code_challenge: pkce.challenge().to_string(),
            code_challenge_method: pkce.method(),
            code_verifier: pkce.verifier().to_string(),
        })
    }

    /// Deliver the login UI result for the pending attempt
    ///
    /// On a code, exchanges it using the attempt's verifier and stores the
    /// resulting bundle before firing the completion. UI failures go straight
    /// to the completion. Returns [`Error::NoLoginPending`] when there is no
    /// attempt waiting for a result; every other failure is reported through
    /// the completion.
    pub async fn complete_login(&self, outcome: LoginOutcome) -> Result<()> {
        let (pkce, completion) = {
            let mut inner = lock(&self.inner);
            match std::mem::replace(&mut inner.login, LoginSlot::Idle) {
                LoginSlot::Pending { pkce, completion } => {
                    if matches!(outcome, LoginOutcome::Succeeded(_)) {
                        inner.login = LoginSlot::Exchanging;
                    }
                    (pkce, completion)
                }
                other => {
                    inner.login = other;
                    return Err(Error::NoLoginPending);
                }
            }
        };

        let code = match outcome {
            LoginOutcome::Succeeded(code) => code,
            LoginOutcome::Failed(error) => {
                warn!("Login failed: {}", error);
                completion(Err(error));
                return Ok(());
            }
            LoginOutcome::Dismissed => {
                info!("Login dismissed");
                completion(Err(Error::LoginCancelled));
                return Ok(());
            }
        };

        let guard = ExchangeGuard {
            inner: &self.inner,
            completion: Some(completion),
        };
        let result = self
            .protocol
            .exchange_authorization_code(
                &code,
                pkce.verifier(),
                &self.config.redirect_uri,
                &self.config.client_id,
                &self.config.realm,
            )
            .await
            .map_err(|e| Error::UnableToExchangeCode(Box::new(e)))
            .and_then(|bundle| self.commit_login(bundle));
        guard.finish(result);
        Ok(())
    }

    fn commit_login(&self, bundle: TokenBundle) -> Result<TokenBundle> {
        let mut inner = lock(&self.inner);
        self.credentials.save(&bundle)?;
        inner.bundle = Some(bundle.clone());
        info!("Login completed for realm {}", self.config.realm);
        Ok(bundle)
    }

    /// Abandon a pending login attempt, firing its completion with
    /// [`Error::LoginCancelled`]. Returns false if nothing was pending.
    pub fn cancel_login(&self) -> bool {
        let completion = {
            let mut inner = lock(&self.inner);
            match std::mem::replace(&mut inner.login, LoginSlot::Idle) {
                LoginSlot::Pending { completion, .. } => completion,
                other => {
                    inner.login = other;
                    return false;
                }
            }
        };

        info!("Login cancelled");
        completion(Err(Error::LoginCancelled));
        true
    }

    /// Replace the held bundle using its refresh token
    ///
    /// Errors with [`Error::CredentialsUnavailable`] when nothing is held and
    /// [`Error::CredentialsExpired`] when the refresh token is past its
    /// lifetime (without touching the network). Protocol errors are returned
    /// unchanged.
    ///
    /// The response is only committed if the session still holds the bundle
    /// the refresh started from. After a concurrent logout the new tokens are
    /// discarded and [`Error::CredentialsUnavailable`] is returned; after a
    /// concurrent login the newer bundle wins and is returned.
    pub async fn refresh(&self) -> Result<TokenBundle> {
        let current = {
            let mut inner = lock(&self.inner);
            if inner.refreshing {
                return Err(Error::RefreshInProgress);
            }
            let bundle = inner.bundle.clone().ok_or(Error::CredentialsUnavailable)?;
            if is_refresh_expired(&bundle, self.clock.now()) {
                info!("Refresh token expired, discarding credentials");
                inner.bundle = None;
                self.discard_stored();
                return Err(Error::CredentialsExpired);
            }
            inner.refreshing = true;
            bundle
        };

        let _guard = RefreshGuard(&self.inner);
        let result = self
            .protocol
            .refresh_token(
                &current,
                &self.config.redirect_uri,
                &self.config.client_id,
                &self.config.realm,
            )
            .await;

        let mut inner = lock(&self.inner);
        match &inner.bundle {
            Some(held) if *held == current => {}
            Some(held) => {
                info!("Credentials replaced during refresh, dropping refreshed tokens");
                return result.map(|_| held.clone());
            }
            None => {
                info!("Logged out during refresh, dropping refreshed tokens");
                return Err(result.err().unwrap_or(Error::CredentialsUnavailable));
            }
        }

        match result {
            Ok(bundle) => {
                self.credentials.save(&bundle)?;
                inner.bundle = Some(bundle.clone());
                Ok(bundle)
            }
            Err(e) => {
                if is_terminal_refresh_error(&e) {
                    info!("Refresh rejected by provider, discarding credentials");
                    inner.bundle = None;
                    self.discard_stored();
                }
                Err(e)
            }
        }
    }

    /// Current access token, refreshing first if it has expired
    pub async fn valid_access_token(&self) -> Result<String> {
        let bundle = self.bundle().ok_or(Error::CredentialsUnavailable)?;
        if !is_access_expired(&bundle, self.clock.now()) {
            return Ok(bundle.access_token().to_string());
        }

        debug!("Access token expired, refreshing");
        let refreshed = self.refresh().await?;
        Ok(refreshed.access_token().to_string())
    }

    /// Forget the held bundle and remove it from storage; no-op when nothing is held
    pub fn logout(&self) -> Result<()> {
        let mut inner = lock(&self.inner);
        if inner.bundle.is_none() {
            return Ok(());
        }

        self.credentials.remove()?;
        inner.bundle = None;
        info!("Logged out of realm {}", self.config.realm);
        Ok(())
    }

    fn discard_stored(&self) {
        if let Err(e) = self.credentials.remove() {
            warn!("Failed to remove stored credentials: {}", e);
        }
    }
}

impl<T: HttpTransport, S: SecureStore> Drop for AuthSession<T, S> {
    fn drop(&mut self) {
        let inner = self.inner.get_mut().unwrap_or_else(|e| e.into_inner());
        if let LoginSlot::Pending { completion, .. } =
            std::mem::replace(&mut inner.login, LoginSlot::Idle)
        {
            debug!("Session dropped with a login pending");
            completion(Err(Error::LoginCancelled));
        }
    }
}

// Provider rejected the refresh token itself
fn is_terminal_refresh_error(error: &Error) -> bool {
    matches!(error, Error::RefreshFailed { status: 400 | 401, .. })
}

/// Releases the login slot when an exchange ends, including when the future
/// driving it is dropped; in that case the completion still fires.
struct ExchangeGuard<'a> {
    inner: &'a Mutex<Inner>,
    completion: Option<LoginCompletion>,
}

impl ExchangeGuard<'_> {
    fn finish(mut self, result: Result<TokenBundle>) {
        let completion = self.completion.take();
        lock(self.inner).login = LoginSlot::Idle;
        if let Some(completion) = completion {
            completion(result);
        }
    }
}

impl Drop for ExchangeGuard<'_> {
    fn drop(&mut self) {
        if let Some(completion) = self.completion.take() {
            lock(self.inner).login = LoginSlot::Idle;
            warn!("Code exchange abandoned before completion");
            completion(Err(Error::LoginCancelled));
        }
    }
}

struct RefreshGuard<'a>(&'a Mutex<Inner>);

impl Drop for RefreshGuard<'_> {
    fn drop(&mut self) {
        lock(self.0).refreshing = false;
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::auth::clock::ManualClock;
    use crate::auth::transport::FakeTransport;
    use crate::auth::store::MemoryStore;
    use chrono::{Duration, TimeZone, Utc};
    use tokio::sync::oneshot;

    const TOKENS: &str = r#"{"token_type":"Bearer","access_token":"a1","refresh_token":"r1","session_state":"s1","id_token":"i1","expires_in":300,"refresh_expires_in":1800,"not-before-policy":0}"#;
    const REFRESHED: &str = r#"{"token_type":"Bearer","access_token":"a2","refresh_token":"r2","session_state":"s1","id_token":"i2","expires_in":300,"refresh_expires_in":1800,"not-before-policy":0}"#;

    type TestSession = AuthSession<Arc<FakeTransport>, Arc<dyn SecureStore>>;

    struct Harness {
        session: Arc<TestSession>,
        transport: Arc<FakeTransport>,
        store: Arc<dyn SecureStore>,
        clock: Arc<ManualClock>,
    }

    /// Store that reads fine but refuses writes
    struct FailingStore;

    /// Store that accepts its first write and refuses the rest
    struct FirstWriteOnlyStore {
        entries: MemoryStore,
        written: std::sync::atomic::AtomicBool,
    }

    impl SecureStore for FirstWriteOnlyStore {
        fn get(&self, key: &str) -> Result<Option<String>> {
            self.entries.get(key)
        }

        fn set(&self, key: &str, value: &str) -> Result<()> {
            if self.written.swap(true, std::sync::atomic::Ordering::SeqCst) {
                return Err(Error::Storage("read-only keychain".to_string()));
            }
            self.entries.set(key, value)
        }

        fn remove(&self, key: &str) -> Result<()> {
            self.entries.remove(key)
        }
    }

    impl SecureStore for FailingStore {
        fn get(&self, _key: &str) -> Result<Option<String>> {
            Ok(None)
        }

        fn set(&self, _key: &str, _value: &str) -> Result<()> {
            Err(Error::Storage("disk full".to_string()))
        }

        fn remove(&self, _key: &str) -> Result<()> {
            Ok(())
        }
    }

    fn config() -> SessionConfig {
        SessionConfig::new(
            Url::parse("https://sso.example.com/auth").unwrap(),
            "app://callback",
            "mobile",
            "demo",
        )
    }

    fn harness_with(config: SessionConfig, transport: FakeTransport, store: Arc<dyn SecureStore>) -> Harness {
        let transport = Arc::new(transport);
        let clock = Arc::new(ManualClock::new(Utc.with_ymd_and_hms(2024, 3, 1, 9, 0, 0).unwrap()));
        let session = Arc::new(AuthSession::with_clock(
            config,
            transport.clone(),
            store.clone(),
            clock.clone(),
        ));
        Harness { session, transport, store, clock }
    }

    fn harness(responses: Vec<(u16, &str)>) -> Harness {
        harness_with(config(), FakeTransport::new(responses), Arc::new(MemoryStore::new()))
    }

    fn completion_channel() -> (
        impl FnOnce(Result<TokenBundle>) + Send + 'static,
        oneshot::Receiver<Result<TokenBundle>>,
    ) {
        let (tx, rx) = oneshot::channel();
        (
            move |result| {
                let _ = tx.send(result);
            },
            rx,
        )
    }

    async fn login(h: &Harness) -> TokenBundle {
        let (completion, rx) = completion_channel();
        h.session.begin_login(completion).unwrap();
        h.session
            .complete_login(LoginOutcome::Succeeded("code-1".to_string()))
            .await
            .unwrap();
        rx.await.unwrap().unwrap()
    }

    fn stored(h: &Harness) -> Option<TokenBundle> {
        CredentialStore::new(h.store.clone()).load()
    }

    #[tokio::test]
    async fn test_unauthenticated_without_stored_bundle() {
        let h = harness(vec![]);
        assert!(!h.session.is_authenticated());
        assert_eq!(h.session.state(), SessionState::Unauthenticated);
        assert!(h.session.bundle().is_none());
    }

    #[tokio::test]
    async fn test_authorization_url_parameters() {
        let h = harness_with(
            config().with_idp_hint("github"),
            FakeTransport::new(vec![]),
            Arc::new(MemoryStore::new()),
        );

        let request = h.session.begin_login(|_| {}).unwrap();
        assert_eq!(h.session.state(), SessionState::LoginPending);
        assert_eq!(
            request.url.path(),
            "/auth/realms/demo/protocol/openid-connect/auth"
        );

        let query: Vec<(String, String)> = request.url.query_pairs().into_owned().collect();
        let get = |key: &str| {
            query
                .iter()
                .find(|(k, _)| k == key)
                .map(|(_, v)| v.clone())
        };
        assert_eq!(get("client_id").as_deref(), Some("mobile"));
        assert_eq!(get("redirect_uri").as_deref(), Some("app://callback"));
        assert_eq!(get("response_type").as_deref(), Some("code"));
        assert_eq!(get("code_challenge").as_deref(), Some(request.code_challenge.as_str()));
        assert_eq!(get("code_challenge_method").as_deref(), Some("S256"));
        assert_eq!(get("idp_hint").as_deref(), Some("github"));
        assert_eq!(get("scope"), None);
        assert_eq!(
            crate::auth::pkce::code_challenge(request.code_verifier()),
            request.code_challenge
        );
    }

    #[tokio::test]
    async fn test_login_success_stores_bundle() {
        let h = harness(vec![(200, TOKENS)]);
        let (completion, rx) = completion_channel();

        let request = h.session.begin_login(completion).unwrap();
        h.session
            .complete_login(LoginOutcome::Succeeded("code-1".to_string()))
            .await
            .unwrap();

        let bundle = rx.await.unwrap().unwrap();
        assert_eq!(bundle.access_token(), "a1");
        assert!(h.session.is_authenticated());
        assert_eq!(h.session.state(), SessionState::Authenticated);
        assert_eq!(stored(&h), Some(bundle));

        // The exchange carried the verifier minted by begin_login and no idp hint
        let fields = h.transport.requests()[0].fields();
        assert!(fields.contains(&("code".to_string(), "code-1".to_string())));
        assert!(fields.contains(&("code_verifier".to_string(), request.code_verifier().to_string())));
        assert!(!fields.iter().any(|(k, _)| k == "idp_hint"));
    }

    #[tokio::test]
    async fn test_access_expiry_follows_clock() {
        let h = harness(vec![(200, TOKENS)]);
        let bundle = login(&h).await;
        assert!(h.session.is_authenticated());

        h.clock.advance(Duration::seconds(301));
        assert!(!h.session.is_authenticated());
        assert!(!is_refresh_expired(&bundle, h.clock.now()));
        assert_eq!(h.session.state(), SessionState::Unauthenticated);
    }

    #[tokio::test]
    async fn test_second_begin_login_is_rejected() {
        let h = harness(vec![(200, TOKENS)]);
        let (first, first_rx) = completion_channel();
        let (second, mut second_rx) = completion_channel();

        let request = h.session.begin_login(first).unwrap();
        let err = h.session.begin_login(second).unwrap_err();
        assert!(matches!(err, Error::LoginInProgress));

        h.session
            .complete_login(LoginOutcome::Succeeded("code-1".to_string()))
            .await
            .unwrap();
        assert_eq!(first_rx.await.unwrap().unwrap().access_token(), "a1");

        // The first attempt's verifier was used, and the rejected completion never fires
        let fields = h.transport.requests()[0].fields();
        assert!(fields.contains(&("code_verifier".to_string(), request.code_verifier().to_string())));
        assert!(second_rx.try_recv().is_err());
    }

    #[tokio::test]
    async fn test_ui_failure_bypasses_exchange() {
        let h = harness(vec![]);
        let (completion, rx) = completion_channel();
        h.session.begin_login(completion).unwrap();

        h.session
            .complete_login(LoginOutcome::Failed(Error::Authorization("access_denied".to_string())))
            .await
            .unwrap();

        let err = rx.await.unwrap().unwrap_err();
        assert!(matches!(err, Error::Authorization(ref msg) if msg == "access_denied"));
        assert_eq!(h.transport.call_count(), 0);
        assert_eq!(h.session.state(), SessionState::Unauthenticated);
    }

    #[tokio::test]
    async fn test_dismissed_login_fires_cancelled() {
        let h = harness(vec![]);
        let (completion, rx) = completion_channel();
        h.session.begin_login(completion).unwrap();

        h.session.complete_login(LoginOutcome::Dismissed).await.unwrap();
        assert!(matches!(rx.await.unwrap(), Err(Error::LoginCancelled)));

        // PKCE state was discarded, a new attempt can start
        assert!(h.session.begin_login(|_| {}).is_ok());
    }

    #[tokio::test]
    async fn test_cancel_login() {
        let h = harness(vec![]);
        assert!(!h.session.cancel_login());

        let (completion, rx) = completion_channel();
        h.session.begin_login(completion).unwrap();
        assert!(h.session.cancel_login());
        assert!(matches!(rx.await.unwrap(), Err(Error::LoginCancelled)));
        assert_eq!(h.session.state(), SessionState::Unauthenticated);
    }

    #[tokio::test]
    async fn test_complete_without_pending_login() {
        let h = harness(vec![]);
        let err = h
            .session
            .complete_login(LoginOutcome::Succeeded("stray".to_string()))
            .await
            .unwrap_err();
        assert!(matches!(err, Error::NoLoginPending));
    }

    #[tokio::test]
    async fn test_exchange_failure_reports_unable_to_exchange() {
        let h = harness(vec![(400, r#"{"error":"invalid_grant"}"#)]);
        let (completion, rx) = completion_channel();
        h.session.begin_login(completion).unwrap();
        h.session
            .complete_login(LoginOutcome::Succeeded("code-1".to_string()))
            .await
            .unwrap();

        match rx.await.unwrap().unwrap_err() {
            Error::UnableToExchangeCode(source) => {
                assert!(matches!(*source, Error::ExchangeFailed { status: 400, .. }));
            }
            other => panic!("unexpected error: {other}"),
        }
        assert!(!h.session.is_authenticated());
        assert!(h.session.begin_login(|_| {}).is_ok());
    }

    #[tokio::test]
    async fn test_malformed_response_writes_nothing() {
        let body = TOKENS.replace(r#""access_token":"a1","#, "");
        let h = harness(vec![(200, body.as_str())]);
        let (completion, rx) = completion_channel();
        h.session.begin_login(completion).unwrap();
        h.session
            .complete_login(LoginOutcome::Succeeded("code-1".to_string()))
            .await
            .unwrap();

        match rx.await.unwrap().unwrap_err() {
            Error::UnableToExchangeCode(source) => {
                assert!(matches!(*source, Error::MalformedResponse(_)));
            }
            other => panic!("unexpected error: {other}"),
        }
        assert!(h.store.get(DEFAULT_STORE_KEY).unwrap().is_none());
    }

    #[tokio::test]
    async fn test_storage_write_failure_is_surfaced() {
        let h = harness_with(config(), FakeTransport::new(vec![(200, TOKENS)]), Arc::new(FailingStore));
        let (completion, rx) = completion_channel();
        h.session.begin_login(completion).unwrap();
        h.session
            .complete_login(LoginOutcome::Succeeded("code-1".to_string()))
            .await
            .unwrap();

        assert!(matches!(rx.await.unwrap(), Err(Error::StorageWriteFailed(_))));
        assert!(!h.session.is_authenticated());
    }

    #[tokio::test]
    async fn test_dropped_exchange_still_completes() {
        let h = harness_with(
            config(),
            FakeTransport::gated(vec![(200, TOKENS)]),
            Arc::new(MemoryStore::new()),
        );
        let (completion, rx) = completion_channel();
        h.session.begin_login(completion).unwrap();

        let session = h.session.clone();
        let task = tokio::spawn(async move {
            session
                .complete_login(LoginOutcome::Succeeded("code-1".to_string()))
                .await
        });
        while h.transport.call_count() == 0 {
            tokio::task::yield_now().await;
        }
        assert_eq!(h.session.state(), SessionState::Exchanging);
        assert!(matches!(h.session.begin_login(|_| {}), Err(Error::LoginInProgress)));

        task.abort();
        let _ = task.await;

        assert!(matches!(rx.await.unwrap(), Err(Error::LoginCancelled)));
        assert_eq!(h.session.state(), SessionState::Unauthenticated);
    }

    #[tokio::test]
    async fn test_stored_bundle_survives_restart() {
        let store: Arc<dyn SecureStore> = Arc::new(MemoryStore::new());
        let first = harness_with(config(), FakeTransport::new(vec![(200, TOKENS)]), store.clone());
        let bundle = login(&first).await;

        let second = harness_with(config(), FakeTransport::new(vec![]), store);
        assert_eq!(second.session.bundle(), Some(bundle));
        assert!(second.session.is_authenticated());
        assert_eq!(second.transport.call_count(), 0);
    }

    #[tokio::test]
    async fn test_refresh_without_bundle() {
        let h = harness(vec![]);
        assert!(matches!(h.session.refresh().await, Err(Error::CredentialsUnavailable)));
        assert!(matches!(
            h.session.valid_access_token().await,
            Err(Error::CredentialsUnavailable)
        ));
    }

    #[tokio::test]
    async fn test_refresh_with_expired_refresh_token_skips_network() {
        let h = harness(vec![(200, TOKENS)]);
        login(&h).await;
        h.clock.advance(Duration::seconds(1801));

        assert!(matches!(h.session.refresh().await, Err(Error::CredentialsExpired)));
        assert_eq!(h.transport.call_count(), 1);
        assert!(h.session.bundle().is_none());
        assert!(stored(&h).is_none());
    }

    #[tokio::test]
    async fn test_refresh_replaces_bundle() {
        let h = harness(vec![(200, TOKENS), (200, REFRESHED)]);
        login(&h).await;
        h.clock.advance(Duration::seconds(400));
        assert!(!h.session.is_authenticated());

        let refreshed = h.session.refresh().await.unwrap();
        assert_eq!(refreshed.access_token(), "a2");
        assert_eq!(refreshed.issued_at(), h.clock.now());
        assert!(h.session.is_authenticated());
        assert_eq!(stored(&h), Some(refreshed));

        let fields = h.transport.requests()[1].fields();
        assert!(fields.contains(&("refresh_token".to_string(), "r1".to_string())));
    }

    #[tokio::test]
    async fn test_valid_access_token_refreshes_when_expired() {
        let h = harness(vec![(200, TOKENS), (200, REFRESHED)]);
        login(&h).await;
        assert_eq!(h.session.valid_access_token().await.unwrap(), "a1");

        h.clock.advance(Duration::seconds(301));
        assert_eq!(h.session.valid_access_token().await.unwrap(), "a2");
        assert_eq!(h.transport.call_count(), 2);
    }

    #[tokio::test]
    async fn test_refresh_rejected_drops_credentials() {
        let h = harness(vec![(200, TOKENS), (401, "invalid refresh token")]);
        login(&h).await;

        let err = h.session.refresh().await.unwrap_err();
        assert!(matches!(err, Error::RefreshFailed { status: 401, .. }));
        assert!(h.session.bundle().is_none());
        assert!(stored(&h).is_none());
    }

    #[tokio::test]
    async fn test_refresh_server_error_keeps_credentials() {
        let h = harness(vec![(200, TOKENS), (503, "maintenance")]);
        let bundle = login(&h).await;

        let err = h.session.refresh().await.unwrap_err();
        assert!(matches!(err, Error::RefreshFailed { status: 503, .. }));
        assert_eq!(h.session.bundle(), Some(bundle));
    }

    #[tokio::test]
    async fn test_concurrent_refresh_is_rejected() {
        let store: Arc<dyn SecureStore> = Arc::new(MemoryStore::new());
        let seed = harness_with(config(), FakeTransport::new(vec![(200, TOKENS)]), store.clone());
        login(&seed).await;

        let h = harness_with(config(), FakeTransport::gated(vec![(200, REFRESHED)]), store);
        let session = h.session.clone();
        let first = tokio::spawn(async move { session.refresh().await });
        while h.transport.call_count() == 0 {
            tokio::task::yield_now().await;
        }
        assert_eq!(h.session.state(), SessionState::Refreshing);

        assert!(matches!(h.session.refresh().await, Err(Error::RefreshInProgress)));

        h.transport.release();
        let refreshed = first.await.unwrap().unwrap();
        assert_eq!(refreshed.access_token(), "a2");
        assert_eq!(h.transport.call_count(), 1);
        assert_eq!(h.session.state(), SessionState::Authenticated);
    }

    #[tokio::test]
    async fn test_refresh_storage_failure_keeps_previous_bundle() {
        let store: Arc<dyn SecureStore> = Arc::new(FirstWriteOnlyStore {
            entries: MemoryStore::new(),
            written: std::sync::atomic::AtomicBool::new(false),
        });
        let h = harness_with(
            config(),
            FakeTransport::new(vec![(200, TOKENS), (200, REFRESHED)]),
            store,
        );
        let bundle = login(&h).await;

        let err = h.session.refresh().await.unwrap_err();
        assert!(matches!(err, Error::StorageWriteFailed(_)));
        assert_eq!(h.session.bundle(), Some(bundle.clone()));
        assert_eq!(stored(&h), Some(bundle));
        assert_eq!(h.session.state(), SessionState::Authenticated);
    }

    #[tokio::test]
    async fn test_logout_during_refresh_stays_logged_out() {
        let store: Arc<dyn SecureStore> = Arc::new(MemoryStore::new());
        let seed = harness_with(config(), FakeTransport::new(vec![(200, TOKENS)]), store.clone());
        login(&seed).await;

        let h = harness_with(config(), FakeTransport::gated(vec![(200, REFRESHED)]), store);
        let session = h.session.clone();
        let refreshing = tokio::spawn(async move { session.refresh().await });
        while h.transport.call_count() == 0 {
            tokio::task::yield_now().await;
        }

        h.session.logout().unwrap();
        assert!(h.session.bundle().is_none());

        h.transport.release();
        let result = refreshing.await.unwrap();
        assert!(matches!(result, Err(Error::CredentialsUnavailable)));
        assert!(h.session.bundle().is_none());
        assert!(stored(&h).is_none());
        assert_eq!(h.session.state(), SessionState::Unauthenticated);
    }

    #[tokio::test]
    async fn test_dropping_session_cancels_pending_login() {
        let h = harness(vec![]);
        let (completion, rx) = completion_channel();
        h.session.begin_login(completion).unwrap();

        drop(h);
        assert!(matches!(rx.await.unwrap(), Err(Error::LoginCancelled)));
    }

    #[tokio::test]
    async fn test_logout_removes_stored_bundle() {
        let h = harness(vec![(200, TOKENS)]);
        login(&h).await;

        h.session.logout().unwrap();
        assert!(!h.session.is_authenticated());
        assert!(stored(&h).is_none());

        // Idempotent
        h.session.logout().unwrap();
    }
}
