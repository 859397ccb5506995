//! HTTP transport used to reach the token endpoint
//!
//! The protocol layer builds a fully encoded form body; a transport only has
//! to POST it and hand back the status and body.

use async_trait::async_trait;
use reqwest::header::{ACCEPT, CONTENT_TYPE};
use reqwest::Client;
use url::Url;

use crate::Result;

pub const FORM_CONTENT_TYPE: &str = "application/x-www-form-urlencoded";

/// A POST with an `application/x-www-form-urlencoded` body
#[derive(Clone, PartialEq, Eq)]
pub struct FormRequest {
    pub url: Url,
    pub body: String,
}

impl FormRequest {
    /// Encode `fields` in order
    pub fn new(url: Url, fields: &[(&str, &str)]) -> Self {
        let body = url::form_urlencoded::Serializer::new(String::new())
            .extend_pairs(fields)
            .finish();
        Self { url, body }
    }

    /// Decoded form fields, in wire order
    pub fn fields(&self) -> Vec<(String, String)> {
        url::form_urlencoded::parse(self.body.as_bytes())
            .into_owned()
            .collect()
    }
}

// The body carries codes, verifiers and refresh tokens
impl std::fmt::Debug for FormRequest {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.debug_struct("FormRequest")
            .field("url", &self.url.as_str())
            .field("body", &format_args!("<{} bytes>", self.body.len()))
            .finish()
    }
}

/// Status and raw body of a token endpoint response
#[derive(Debug, Clone)]
pub struct HttpResponse {
    pub status: u16,
    pub body: String,
}

impl HttpResponse {
    pub fn is_success(&self) -> bool {
        (200..300).contains(&self.status)
    }
}

/// Transport abstraction so the protocol can be driven without a network
#[async_trait]
pub trait HttpTransport: Send + Sync {
    /// POST the form and return whatever the server answered
    ///
    /// Only connection-level failures are errors; non-2xx statuses are
    /// returned as responses.
    async fn post_form(&self, request: FormRequest) -> Result<HttpResponse>;
}

/// reqwest-backed transport
#[derive(Debug, Clone, Default)]
pub struct ReqwestTransport {
    client: Client,
}

impl ReqwestTransport {
    pub fn new() -> Self {
        Self::default()
    }

    pub fn with_client(client: Client) -> Self {
        Self { client }
    }
}

#[async_trait]
impl HttpTransport for ReqwestTransport {
    async fn post_form(&self, request: FormRequest) -> Result<HttpResponse> {
        let response = self
            .client
            .post(request.url)
            .header(CONTENT_TYPE, FORM_CONTENT_TYPE)
            .header(ACCEPT, "application/json")
            .body(request.body)
            .send()
            .await?;

        let status = response.status().as_u16();
        let body = response.text().await?;
        Ok(HttpResponse { status, body })
    }
}

#[async_trait]
impl<T: HttpTransport + ?Sized> HttpTransport for std::sync::Arc<T> {
    async fn post_form(&self, request: FormRequest) -> Result<HttpResponse> {
        (**self).post_form(request).await
    }
}

/// Scripted transport for tests
#[cfg(test)]
pub struct FakeTransport {
    responses: std::sync::Mutex<std::collections::VecDeque<Result<HttpResponse>>>,
    requests: std::sync::Mutex<Vec<FormRequest>>,
    gate: Option<tokio::sync::Semaphore>,
}

#[cfg(test)]
impl FakeTransport {
    /// Create with predefined responses, returned in order
    pub fn new(responses: Vec<(u16, &str)>) -> Self {
        Self {
            responses: std::sync::Mutex::new(
                responses
                    .into_iter()
                    .map(|(status, body)| {
                        Ok(HttpResponse {
                            status,
                            body: body.to_string(),
                        })
                    })
                    .collect(),
            ),
            requests: std::sync::Mutex::new(Vec::new()),
            gate: None,
        }
    }

    /// Like [`FakeTransport::new`] but every call waits for [`FakeTransport::release`]
    pub fn gated(responses: Vec<(u16, &str)>) -> Self {
        Self {
            gate: Some(tokio::sync::Semaphore::new(0)),
            ..Self::new(responses)
        }
    }

    pub fn release(&self) {
        if let Some(gate) = &self.gate {
            gate.add_permits(1);
        }
    }

    pub fn requests(&self) -> Vec<FormRequest> {
        self.requests.lock().unwrap().clone()
    }

    pub fn call_count(&self) -> usize {
        self.requests.lock().unwrap().len()
    }
}

#[cfg(test)]
#[async_trait]
impl HttpTransport for FakeTransport {
    async fn post_form(&self, request: FormRequest) -> Result<HttpResponse> {
        self.requests.lock().unwrap().push(request);
        if let Some(gate) = &self.gate {
            gate.acquire().await.unwrap().forget();
        }
        self.responses
            .lock()
            .unwrap()
            .pop_front()
            .unwrap_or_else(|| Err(crate::error::Error::Other("No more fake responses".to_string())))
    }
}
