//! HTTP boundary — the client used to reach relay nodes
//!
//! The core only depends on the `HttpClient` trait; `UreqClient` is the
//! default native implementation. Non-2xx responses surface as
//! `HttpError::Status` so callers can tell a living-but-unhappy node apart
//! from a connectivity failure.

use async_trait::async_trait;
use std::time::Duration;
use thiserror::Error;

/// Default per-request timeout when the caller does not pass one
pub const DEFAULT_TIMEOUT_MS: u64 = 30_000;

/// HTTP error types
#[derive(Debug, Clone, Error)]
pub enum HttpError {
    /// The node answered with a non-2xx status
    #[error("http status {code}: {body}")]
    Status { code: u16, body: String },
    /// The request never completed (DNS, TCP, TLS, timeout)
    #[error("network error: {0}")]
    Network(String),
}

impl HttpError {
    /// True when the node could not be reached at all.
    /// A `Status` error still proves the node is alive.
    pub fn is_connectivity(&self) -> bool {
        matches!(self, HttpError::Network(_))
    }
}

/// Transport-agnostic HTTP client for relay API calls
#[async_trait]
pub trait HttpClient: Send + Sync {
    async fn get(
        &self,
        base_url: &str,
        path: &str,
        headers: &[(String, String)],
        params: &[(String, String)],
        timeout_ms: Option<u64>,
    ) -> Result<String, HttpError>;

    async fn post(
        &self,
        base_url: &str,
        path: &str,
        headers: &[(String, String)],
        body: Option<String>,
        timeout_ms: Option<u64>,
    ) -> Result<String, HttpError>;

    async fn put(
        &self,
        base_url: &str,
        path: &str,
        headers: &[(String, String)],
        body: Option<String>,
        timeout_ms: Option<u64>,
    ) -> Result<String, HttpError>;
}

/// Default native client bridging blocking `ureq` onto the async runtime
#[cfg(not(target_arch = "wasm32"))]
#[derive(Debug, Clone, Default)]
pub struct UreqClient;

#[cfg(not(target_arch = "wasm32"))]
impl UreqClient {
    pub fn new() -> Self {
        Self
    }

    fn run(
        method: &'static str,
        url: String,
        headers: Vec<(String, String)>,
        params: Vec<(String, String)>,
        body: Option<String>,
        timeout_ms: u64,
    ) -> Result<String, HttpError> {
        let mut request = ureq::request(method, &url).timeout(Duration::from_millis(timeout_ms));
        for (name, value) in &headers {
            request = request.set(name, value);
        }
        for (name, value) in &params {
            request = request.query(name, value);
        }

        let result = match body {
            Some(body) => request.send_string(&body),
            None => request.call(),
        };

        match result {
            Ok(response) => response
                .into_string()
                .map_err(|e| HttpError::Network(e.to_string())),
            Err(ureq::Error::Status(code, response)) => Err(HttpError::Status {
                code,
                body: response.into_string().unwrap_or_default(),
            }),
            Err(ureq::Error::Transport(transport)) => {
                Err(HttpError::Network(transport.to_string()))
            }
        }
    }

    async fn dispatch(
        &self,
        method: &'static str,
        base_url: &str,
        path: &str,
        headers: &[(String, String)],
        params: &[(String, String)],
        body: Option<String>,
        timeout_ms: Option<u64>,
    ) -> Result<String, HttpError> {
        let url = format!("{}{}", base_url.trim_end_matches('/'), path);
        let headers = headers.to_vec();
        let params = params.to_vec();
        let timeout = timeout_ms.unwrap_or(DEFAULT_TIMEOUT_MS);

        tokio::task::spawn_blocking(move || Self::run(method, url, headers, params, body, timeout))
            .await
            .map_err(|e| HttpError::Network(e.to_string()))?
    }
}

#[cfg(not(target_arch = "wasm32"))]
#[async_trait]
impl HttpClient for UreqClient {
    async fn get(
        &self,
        base_url: &str,
        path: &str,
        headers: &[(String, String)],
        params: &[(String, String)],
        timeout_ms: Option<u64>,
    ) -> Result<String, HttpError> {
        self.dispatch("GET", base_url, path, headers, params, None, timeout_ms)
            .await
    }

    async fn post(
        &self,
        base_url: &str,
        path: &str,
        headers: &[(String, String)],
        body: Option<String>,
        timeout_ms: Option<u64>,
    ) -> Result<String, HttpError> {
        self.dispatch("POST", base_url, path, headers, &[], body, timeout_ms)
            .await
    }

    async fn put(
        &self,
        base_url: &str,
        path: &str,
        headers: &[(String, String)],
        body: Option<String>,
        timeout_ms: Option<u64>,
    ) -> Result<String, HttpError> {
        self.dispatch("PUT", base_url, path, headers, &[], body, timeout_ms)
            .await
    }
}
