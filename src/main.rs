//! realm-sso CLI entry point

use std::sync::Arc;
use std::time::Duration;

use anyhow::{Context, Result};
use clap::{Parser, Subcommand};
use tracing_subscriber::EnvFilter;

use realm_sso::auth::{
    AuthSession, CallbackServer, FileStore, KeyringStore, LoginOutcome, ReqwestTransport,
    SecureStore, SessionState,
};
use realm_sso::config::{self, Config, StoreBackend};
use realm_sso::ui;

type Session = AuthSession<ReqwestTransport, Arc<dyn SecureStore>>;

#[derive(Parser)]
#[command(name = "realm-sso")]
#[command(about = "Sign in to a realm-based OpenID Connect provider with PKCE")]
#[command(version)]
struct Cli {
    #[command(subcommand)]
    command: Commands,
}

#[derive(Subcommand)]
enum Commands {
    /// Write the provider configuration
    Init {
        /// Identity provider base URL
        #[arg(long)]
        base_url: String,

        /// Realm name
        #[arg(long)]
        realm: String,

        /// Public client id
        #[arg(long)]
        client_id: String,

        /// Loopback redirect URI registered for the client
        #[arg(long)]
        redirect_uri: Option<String>,

        /// Identity provider hint for the authorization redirect
        #[arg(long)]
        idp_hint: Option<String>,

        /// Scope for the authorization redirect
        #[arg(long)]
        scope: Option<String>,

        /// Keep tokens in a file under ~/.realm-sso instead of the platform keychain
        #[arg(long)]
        file_store: bool,
    },

    /// Sign in through the browser
    Login,

    /// Remove stored credentials
    Logout,

    /// Show the current session
    Status,

    /// Refresh the stored tokens
    Refresh,

    /// Print a valid access token, refreshing if needed
    Token,
}

#[tokio::main]
async fn main() -> Result<()> {
    // Logs go to stderr so `token` output stays pipeable
    tracing_subscriber::fmt()
        .with_env_filter(EnvFilter::from_default_env())
        .with_writer(std::io::stderr)
        .init();

    let cli = Cli::parse();

    match cli.command {
        Commands::Init {
            base_url,
            realm,
            client_id,
            redirect_uri,
            idp_hint,
            scope,
            file_store,
        } => {
            let mut config = Config::new(base_url, realm, client_id);
            if let Some(redirect_uri) = redirect_uri {
                config.redirect_uri = redirect_uri;
            }
            config.idp_hint = idp_hint;
            config.scope = scope;
            if file_store {
                config.store = StoreBackend::File;
            }
            config.validate()?;
            config::save(&config)?;
            ui::print_success(&format!("Configuration written to {:?}", config::config_path()));
            ui::print_step("Next: realm-sso login");
        }

        Commands::Login => {
            let config = config::load()?;
            run_login(&config).await?;
        }

        Commands::Logout => {
            let config = config::load()?;
            build_session(&config)?.logout()?;
            ui::print_success("Logged out");
        }

        Commands::Status => {
            let config = config::load()?;
            let session = build_session(&config)?;
            ui::print_header(&config.realm, &config.base_url);
            print_status(&session);
        }

        Commands::Refresh => {
            let config = config::load()?;
            let session = build_session(&config)?;
            ui::print_step("Refreshing tokens...");
            let bundle = session.refresh().await?;
            ui::print_success(&format!(
                "Access token valid until {}",
                bundle.access_expires_at().to_rfc3339()
            ));
        }

        Commands::Token => {
            let config = config::load()?;
            let token = build_session(&config)?.valid_access_token().await?;
            println!("{}", token);
        }
    }

    Ok(())
}

fn build_session(config: &Config) -> Result<Session> {
    let session_config = config.session_config()?;
    let store: Arc<dyn SecureStore> = match config.store {
        StoreBackend::Keyring => Arc::new(KeyringStore::default()),
        StoreBackend::File => Arc::new(FileStore::default_location()),
    };
    Ok(AuthSession::new(session_config, ReqwestTransport::new(), store))
}

async fn run_login(config: &Config) -> Result<()> {
    let session = build_session(config)?;
    if session.is_authenticated() {
        ui::print_success("Already signed in (run 'realm-sso logout' to start over)");
        return Ok(());
    }

    // Listen before the browser can redirect back
    let server = CallbackServer::bind(&config.redirect_uri).await?;

    let (tx, rx) = tokio::sync::oneshot::channel();
    let request = session.begin_login(move |result| {
        let _ = tx.send(result);
    })?;

    ui::print_step("Opening browser for sign-in...");
    println!("\n  If the browser doesn't open, visit this URL:\n  {}\n", request.url);
    if let Err(e) = open::that(request.url.as_str()) {
        tracing::warn!("Failed to open browser: {}", e);
    }

    ui::print_step("Waiting for authorization...");
    let timeout = Duration::from_secs(config.login_timeout_secs);
    let outcome = match tokio::time::timeout(timeout, server.wait_for_redirect()).await {
        Ok(Ok(outcome)) => outcome,
        Ok(Err(e)) => LoginOutcome::Failed(e),
        Err(_) => {
            ui::print_warning("Timed out waiting for the browser");
            LoginOutcome::Dismissed
        }
    };

    session.complete_login(outcome).await?;

    match rx.await.context("Login completion was dropped")? {
        Ok(bundle) => {
            ui::print_success("Signed in");
            ui::print_step(&format!(
                "Access token valid until {}",
                bundle.access_expires_at().to_rfc3339()
            ));
            Ok(())
        }
        Err(e) => {
            ui::print_error(&format!("Sign-in failed: {}", e));
            Err(e.into())
        }
    }
}

fn print_status(session: &Session) {
    let state = match session.state() {
        SessionState::Authenticated => "authenticated",
        SessionState::Unauthenticated => "not authenticated",
        SessionState::LoginPending => "login pending",
        SessionState::Exchanging => "exchanging code",
        SessionState::Refreshing => "refreshing",
    };
    println!("State: {}", state);

    match session.bundle() {
        Some(bundle) => {
            println!("Token type: {}", bundle.token_type());
            println!("Issued at: {}", bundle.issued_at().to_rfc3339());
            println!("Access token expires: {}", bundle.access_expires_at().to_rfc3339());
            println!("Refresh token expires: {}", bundle.refresh_expires_at().to_rfc3339());
            if !session.is_authenticated() {
                ui::print_step("Access token expired, run 'realm-sso refresh' or 'realm-sso login'");
            }
        }
        None => ui::print_step("No stored credentials (run 'realm-sso login')"),
    }
}
