//! Loopback redirect capture
//!
//! A temporary local HTTP listener bound to the host and port of an
//! `http://127.0.0.1:<port>/<path>` redirect URI. It waits for the browser to
//! land on the redirect path and turns the query string into a
//! [`LoginOutcome`].

use std::net::SocketAddr;

use tokio::io::{AsyncReadExt, AsyncWriteExt};
use tokio::net::TcpListener;
use tracing::{debug, info};
use url::Url;

use super::session::LoginOutcome;
use crate::error::Error;
use crate::Result;

const SUCCESS_HTML: &str = r#"<!DOCTYPE html>
<html lang="en">
<head>
    <meta charset="UTF-8">
    <title>Signed in</title>
    <style>
        body { font-family: -apple-system, system-ui, sans-serif; display: flex; justify-content: center; align-items: center; height: 100vh; margin: 0; text-align: center; color: #1f2937; }
        h1 { font-size: 22px; color: #15803d; }
        p { color: #6b7280; }
    </style>
</head>
<body>
    <div>
        <h1>Signed in</h1>
        <p>You can close this window and return to your terminal.</p>
    </div>
</body>
</html>"#;

const ERROR_HTML: &str = r#"<!DOCTYPE html>
<html lang="en">
<head>
    <meta charset="UTF-8">
    <title>Sign-in failed</title>
    <style>
        body { font-family: -apple-system, system-ui, sans-serif; display: flex; justify-content: center; align-items: center; height: 100vh; margin: 0; text-align: center; color: #1f2937; }
        h1 { font-size: 22px; color: #b91c1c; }
        p { color: #6b7280; }
    </style>
</head>
<body>
    <div>
        <h1>Sign-in failed</h1>
        <p>Something went wrong during sign-in.<br>Check your terminal for details.</p>
    </div>
</body>
</html>"#;

/// Address and path a loopback redirect URI points at
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct RedirectTarget {
    pub addr: String,
    pub path: String,
}

impl RedirectTarget {
    /// Validate that `redirect_uri` is a plain-http loopback URI with an explicit port
    pub fn parse(redirect_uri: &str) -> Result<Self> {
        let url = Url::parse(redirect_uri)
            .map_err(|e| Error::Config(format!("Invalid redirect URI {}: {}", redirect_uri, e)))?;

        if url.scheme() != "http" {
            return Err(Error::Config(format!(
                "Redirect URI must use http for loopback capture: {}",
                redirect_uri
            )));
        }

        let host = url
            .host_str()
            .ok_or_else(|| Error::Config(format!("Redirect URI has no host: {}", redirect_uri)))?;
        if !matches!(host, "127.0.0.1" | "localhost" | "[::1]") {
            return Err(Error::Config(format!(
                "Redirect URI must point at a loopback address: {}",
                redirect_uri
            )));
        }

        let port = url
            .port()
            .ok_or_else(|| Error::Config(format!("Redirect URI needs an explicit port: {}", redirect_uri)))?;

        Ok(Self {
            addr: format!("{}:{}", host, port),
            path: url.path().to_string(),
        })
    }
}

/// Listener waiting for the browser redirect of one login attempt
pub struct CallbackServer {
    listener: TcpListener,
    path: String,
}

impl CallbackServer {
    /// Bind the loopback address named by `redirect_uri`
    ///
    /// Bind before sending the user to the browser so the redirect cannot
    /// arrive ahead of the listener.
    pub async fn bind(redirect_uri: &str) -> Result<Self> {
        let target = RedirectTarget::parse(redirect_uri)?;
        let listener = TcpListener::bind(&target.addr).await.map_err(|e| {
            Error::Authorization(format!("Failed to start callback server on {}: {}", target.addr, e))
        })?;

        info!("Callback server listening on http://{}{}", target.addr, target.path);
        Ok(Self {
            listener,
            path: target.path,
        })
    }

    pub fn local_addr(&self) -> Result<SocketAddr> {
        Ok(self.listener.local_addr()?)
    }

    /// Wait until the browser delivers a result
    ///
    /// Requests for other paths (favicon and the like) are answered with 404
    /// and ignored.
    pub async fn wait_for_redirect(self) -> Result<LoginOutcome> {
        loop {
            let (mut socket, peer) = self
                .listener
                .accept()
                .await
                .map_err(|e| Error::Authorization(format!("Failed to accept connection: {}", e)))?;

            let mut buffer = vec![0u8; 8192];
            let n = socket
                .read(&mut buffer)
                .await
                .map_err(|e| Error::Authorization(format!("Failed to read request: {}", e)))?;
            let request = String::from_utf8_lossy(&buffer[..n]).into_owned();

            let outcome = match parse_callback_request(&request, &self.path) {
                Some(outcome) => outcome,
                None => {
                    debug!("Ignoring unrelated request from {}", peer);
                    respond(&mut socket, "404 Not Found", "").await;
                    continue;
                }
            };

            let (status, body) = match &outcome {
                LoginOutcome::Succeeded(_) => ("200 OK", SUCCESS_HTML),
                _ => ("400 Bad Request", ERROR_HTML),
            };
            respond(&mut socket, status, body).await;
            return Ok(outcome);
        }
    }
}

async fn respond(socket: &mut tokio::net::TcpStream, status: &str, body: &str) {
    let response = format!(
        "HTTP/1.1 {}\r\nContent-Type: text/html\r\nContent-Length: {}\r\nConnection: close\r\n\r\n{}",
        status,
        body.len(),
        body
    );

    let _ = socket.write_all(response.as_bytes()).await;
    let _ = socket.shutdown().await;
}

/// Turn a raw HTTP request into a login outcome
///
/// Returns `None` when the request is not for `expected_path`.
fn parse_callback_request(request: &str, expected_path: &str) -> Option<LoginOutcome> {
    // GET /callback?code=xxx&session_state=yyy HTTP/1.1
    let first_line = request.lines().next()?;
    let target = first_line.split_whitespace().nth(1)?;

    let url = match Url::parse(&format!("http://localhost{}", target)) {
        Ok(url) => url,
        Err(e) => {
            return Some(LoginOutcome::Failed(Error::Authorization(format!(
                "Failed to parse callback URL: {}",
                e
            ))))
        }
    };
    if url.path() != expected_path {
        return None;
    }

    let mut code = None;
    let mut error = None;
    let mut error_description = None;

    for (key, value) in url.query_pairs() {
        match key.as_ref() {
            "code" => code = Some(value.into_owned()),
            "error" => error = Some(value.into_owned()),
            "error_description" => error_description = Some(value.into_owned()),
            _ => {}
        }
    }

    if let Some(err) = error {
        let description = error_description.unwrap_or_else(|| "Unknown error".to_string());
        return Some(LoginOutcome::Failed(Error::Authorization(format!(
            "{} - {}",
            err, description
        ))));
    }

    Some(match code {
        Some(code) if !code.is_empty() => LoginOutcome::Succeeded(code),
        _ => LoginOutcome::Failed(Error::Authorization("Missing authorization code".to_string())),
    })
}
