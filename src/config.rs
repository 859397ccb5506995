//! Configuration management

use serde::{Deserialize, Serialize};
use std::path::PathBuf;
use url::Url;

use crate::auth::{SessionConfig, DEFAULT_AUTH_PATH, DEFAULT_STORE_KEY, DEFAULT_TOKEN_PATH};
use crate::error::Error;
use crate::Result;

/// Identity provider configuration
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct Config {
    /// Identity provider base URL, e.g. `https://sso.example.com/auth`
    pub base_url: String,

    /// Realm substituted into the endpoint paths
    pub realm: String,

    /// Public client id registered with the provider
    pub client_id: String,

    /// Redirect URI registered for the client
    #[serde(default = "default_redirect_uri")]
    pub redirect_uri: String,

    /// Identity provider hint added to the authorization redirect
    #[serde(default)]
    pub idp_hint: Option<String>,

    /// Scope requested on the authorization redirect
    #[serde(default)]
    pub scope: Option<String>,

    /// Authorization endpoint path template (`{realm}` is substituted)
    #[serde(default = "default_auth_path")]
    pub auth_path: String,

    /// Token endpoint path template (`{realm}` is substituted)
    #[serde(default = "default_token_path")]
    pub token_path: String,

    /// Key the token bundle is stored under
    #[serde(default = "default_store_key")]
    pub store_key: String,

    /// Where the token bundle is kept
    #[serde(default)]
    pub store: StoreBackend,

    /// How long `login` waits for the browser redirect
    #[serde(default = "default_login_timeout_secs")]
    pub login_timeout_secs: u64,
}

/// Secure storage medium for the token bundle
#[derive(Debug, Clone, Copy, Default, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "lowercase")]
pub enum StoreBackend {
    /// Platform keychain
    #[default]
    Keyring,
    /// Owner-only JSON file under the config directory, for hosts without a keychain
    File,
}

fn default_redirect_uri() -> String {
    "http://127.0.0.1:8085/callback".to_string()
}

fn default_auth_path() -> String {
    DEFAULT_AUTH_PATH.to_string()
}

fn default_token_path() -> String {
    DEFAULT_TOKEN_PATH.to_string()
}

fn default_store_key() -> String {
    DEFAULT_STORE_KEY.to_string()
}

fn default_login_timeout_secs() -> u64 {
    300
}

impl Config {
    pub fn new(base_url: impl Into<String>, realm: impl Into<String>, client_id: impl Into<String>) -> Self {
        Self {
            base_url: base_url.into(),
            realm: realm.into(),
            client_id: client_id.into(),
            redirect_uri: default_redirect_uri(),
            idp_hint: None,
            scope: None,
            auth_path: default_auth_path(),
            token_path: default_token_path(),
            store_key: default_store_key(),
            store: StoreBackend::default(),
            login_timeout_secs: default_login_timeout_secs(),
        }
    }

    /// Check the fields a session cannot work without
    pub fn validate(&self) -> Result<()> {
        self.parsed_base_url()?;
        Url::parse(&self.redirect_uri)
            .map_err(|e| Error::Config(format!("Invalid redirect_uri {:?}: {}", self.redirect_uri, e)))?;

        if self.realm.trim().is_empty() {
            return Err(Error::Config("realm cannot be empty".to_string()));
        }
        if self.client_id.trim().is_empty() {
            return Err(Error::Config("client_id cannot be empty".to_string()));
        }
        Ok(())
    }

    fn parsed_base_url(&self) -> Result<Url> {
        let url = Url::parse(&self.base_url)
            .map_err(|e| Error::Config(format!("Invalid base_url {:?}: {}", self.base_url, e)))?;
        if url.cannot_be_a_base() {
            return Err(Error::Config(format!("base_url {:?} cannot carry a path", self.base_url)));
        }
        Ok(url)
    }

    /// Build the settings an `AuthSession` runs with
    pub fn session_config(&self) -> Result<SessionConfig> {
        self.validate()?;

        let mut session = SessionConfig::new(
            self.parsed_base_url()?,
            self.redirect_uri.clone(),
            self.client_id.clone(),
            self.realm.clone(),
        );
        session.idp_hint = self.idp_hint.clone().filter(|h| !h.is_empty());
        session.scope = self.scope.clone().filter(|s| !s.is_empty());
        session.auth_path = self.auth_path.clone();
        session.token_path = self.token_path.clone();
        session.store_key = self.store_key.clone();
        Ok(session)
    }
}

/// Get the config directory path
pub fn config_dir() -> PathBuf {
    dirs::home_dir()
        .unwrap_or_else(|| PathBuf::from("."))
        .join(".realm-sso")
}

/// Get the config file path
pub fn config_path() -> PathBuf {
    config_dir().join("config.json")
}

/// Load configuration from file
pub fn load() -> Result<Config> {
    let path = config_path();

    if !path.exists() {
        return Err(Error::Config(format!(
            "Config not found at {:?}. Run 'realm-sso init' first.",
            path
        )));
    }

    let content = std::fs::read_to_string(&path)?;
    let config: Config = serde_json::from_str(&content)?;
    Ok(config)
}

/// Save configuration to file
pub fn save(config: &Config) -> Result<()> {
    let path = config_path();

    // Create parent directory
    if let Some(parent) = path.parent() {
        std::fs::create_dir_all(parent)?;
    }

    let content = serde_json::to_string_pretty(config)?;
    std::fs::write(&path, content)?;
    Ok(())
}
