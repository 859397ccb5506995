//! Token endpoint protocol
//!
//! Authorization-code and refresh-token grants against a realm-scoped token
//! endpoint. Each call is one request/response; retries are left to callers.

use std::sync::Arc;

use tracing::{debug, info, warn};
use url::Url;

use super::clock::{Clock, SystemClock};
use super::credentials::TokenBundle;
use super::transport::{FormRequest, HttpTransport};
use crate::error::Error;
use crate::Result;

/// Placeholder substituted with the realm name in path templates
pub const REALM_PLACEHOLDER: &str = "{realm}";

/// Keycloak-style OpenID Connect endpoints
pub const DEFAULT_AUTH_PATH: &str = "realms/{realm}/protocol/openid-connect/auth";
pub const DEFAULT_TOKEN_PATH: &str = "realms/{realm}/protocol/openid-connect/token";

pub const RESPONSE_TYPE_CODE: &str = "code";

const GRANT_AUTHORIZATION_CODE: &str = "authorization_code";
const GRANT_REFRESH_TOKEN: &str = "refresh_token";

/// Base URL plus realm-parameterized path templates
#[derive(Debug, Clone)]
pub struct Endpoints {
    base_url: Url,
    auth_path: String,
    token_path: String,
}

impl Endpoints {
    pub fn new(base_url: Url) -> Self {
        Self::with_paths(base_url, DEFAULT_AUTH_PATH, DEFAULT_TOKEN_PATH)
    }

    pub fn with_paths(
        base_url: Url,
        auth_path: impl Into<String>,
        token_path: impl Into<String>,
    ) -> Self {
        Self {
            base_url,
            auth_path: auth_path.into(),
            token_path: token_path.into(),
        }
    }

    pub fn base_url(&self) -> &Url {
        &self.base_url
    }

    /// Authorization endpoint for `realm`
    pub fn authorization_url(&self, realm: &str) -> Result<Url> {
        self.resolve(&self.auth_path, realm)
    }

    /// Token endpoint for `realm`
    pub fn token_url(&self, realm: &str) -> Result<Url> {
        self.resolve(&self.token_path, realm)
    }

    // Appends the path to the base URL's path, keeping any prefix such as `/auth`
    fn resolve(&self, template: &str, realm: &str) -> Result<Url> {
        if self.base_url.cannot_be_a_base() {
            return Err(Error::Config(format!("Invalid base URL: {}", self.base_url)));
        }

        let path = template.replace(REALM_PLACEHOLDER, realm);
        let mut url = self.base_url.clone();
        let joined = format!(
            "{}/{}",
            url.path().trim_end_matches('/'),
            path.trim_start_matches('/')
        );
        url.set_path(&joined);
        url.set_query(None);
        Ok(url)
    }
}

/// Client for the token endpoint
pub struct TokenExchange<T: HttpTransport> {
    transport: T,
    endpoints: Endpoints,
    clock: Arc<dyn Clock>,
}

impl<T: HttpTransport> TokenExchange<T> {
    pub fn new(transport: T, endpoints: Endpoints) -> Self {
        Self {
            transport,
            endpoints,
            clock: Arc::new(SystemClock),
        }
    }

    /// Stamp issued bundles with `clock` instead of the wall clock
    pub fn with_clock(mut self, clock: Arc<dyn Clock>) -> Self {
        self.clock = clock;
        self
    }

    pub fn endpoints(&self) -> &Endpoints {
        &self.endpoints
    }

    /// Exchange a one-time authorization code for tokens
    pub async fn exchange_authorization_code(
        &self,
        code: &str,
        code_verifier: &str,
        redirect_uri: &str,
        client_id: &str,
        realm: &str,
    ) -> Result<TokenBundle> {
        let request = FormRequest::new(
            self.endpoints.token_url(realm)?,
            &[
                ("grant_type", GRANT_AUTHORIZATION_CODE),
                ("code", code),
                ("redirect_uri", redirect_uri),
                ("client_id", client_id),
                ("code_verifier", code_verifier),
            ],
        );

        debug!("Exchanging authorization code at {}", request.url);
        let response = self.transport.post_form(request).await?;

        if !response.is_success() {
            warn!("Token exchange rejected with status {}", response.status);
            return Err(Error::ExchangeFailed {
                status: response.status,
                body: response.body,
            });
        }

        let bundle = TokenBundle::from_response(&response.body, self.clock.now())?;
        info!("Authorization code exchanged, access token valid for {}s", bundle.expires_in());
        Ok(bundle)
    }

    /// Obtain a new bundle using the refresh token in `bundle`
    ///
    /// Does not check refresh-token expiry; callers do that first.
    pub async fn refresh_token(
        &self,
        bundle: &TokenBundle,
        redirect_uri: &str,
        client_id: &str,
        realm: &str,
    ) -> Result<TokenBundle> {
        let request = FormRequest::new(
            self.endpoints.token_url(realm)?,
            &[
                ("grant_type", GRANT_REFRESH_TOKEN),
                ("refresh_token", bundle.refresh_token()),
                ("redirect_uri", redirect_uri),
                ("client_id", client_id),
            ],
        );

        debug!("Refreshing tokens at {}", request.url);
        let response = self.transport.post_form(request).await?;

        if !response.is_success() {
            warn!("Token refresh rejected with status {}", response.status);
            return Err(Error::RefreshFailed {
                status: response.status,
                body: response.body,
            });
        }

        let refreshed = TokenBundle::from_response(&response.body, self.clock.now())?;
        info!("Tokens refreshed, access token valid for {}s", refreshed.expires_in());
        Ok(refreshed)
    }
}
