//! Shared HTTP plumbing for every request/response call the widget makes.
//!
//! SYSTEM CONTEXT
//! ==============
//! The session manager, the polling fallback and the conversation API all talk
//! to the same `{apiBase}/widget/...` surface with the same two identifying
//! headers. `ApiClient` owns the pooled `reqwest::Client` and stamps those
//! headers so each caller only describes its path and body.
//!
//! ERROR HANDLING
//! ==============
//! Non-success responses are turned into [`ApiError::Backend`] carrying the
//! backend's own `error`/`message` text when the body has one, otherwise the
//! caller-supplied fallback text.

#[cfg(test)]
#[path = "http_test.rs"]
mod http_test;

use std::time::Duration;

use reqwest::{Method, RequestBuilder, Response};
use serde::de::DeserializeOwned;
use serde_json::Value;

use crate::config::ApiConfig;

/// Header carrying the embedding site's API key.
pub const API_KEY_HEADER: &str = "x-api-key";
/// Header carrying the anonymous session id.
pub const SESSION_HEADER: &str = "x-session-id";

#[derive(Debug, thiserror::Error)]
pub enum ApiError {
    #[error("http request failed: {0}")]
    Http(#[from] reqwest::Error),
    #[error("{message} (HTTP {status})")]
    Backend { status: u16, message: String },
    #[error("invalid base URL: {0}")]
    InvalidBaseUrl(String),
}

impl ApiError {
    /// HTTP status for backend rejections, if any.
    #[must_use]
    pub fn status(&self) -> Option<u16> {
        match self {
            Self::Backend { status, .. } => Some(*status),
            Self::Http(err) => err.status().map(|s| s.as_u16()),
            Self::InvalidBaseUrl(_) => None,
        }
    }
}

/// Thin wrapper around `reqwest::Client` bound to one API base and key.
#[derive(Clone, Debug)]
pub struct ApiClient {
    client: reqwest::Client,
    api_base: String,
    api_key: String,
}

impl ApiClient {
    /// Build a client from API settings.
    ///
    /// # Errors
    ///
    /// Returns [`ApiError::InvalidBaseUrl`] when the base is not an http(s)
    /// URL, or [`ApiError::Http`] if the TLS backend fails to initialise.
    pub fn new(config: &ApiConfig) -> Result<Self, ApiError> {
        let api_base = config.api_base.trim_end_matches('/').to_owned();
        if !(api_base.starts_with("http://") || api_base.starts_with("https://")) {
            return Err(ApiError::InvalidBaseUrl(config.api_base.clone()));
        }
        let client = reqwest::Client::builder()
            .timeout(Duration::from_secs(config.request_timeout_secs))
            .connect_timeout(Duration::from_secs(config.connect_timeout_secs))
            .build()?;
        Ok(Self { client, api_base, api_key: config.api_key.clone() })
    }

    /// API base without a trailing slash.
    #[must_use]
    pub fn api_base(&self) -> &str {
        &self.api_base
    }

    /// Absolute URL for an API path (`path` starts with `/`).
    #[must_use]
    pub fn url(&self, path: &str) -> String {
        format!("{}{}", self.api_base, path)
    }

    /// Start a request with the API key and, when given, the session header.
    pub fn request(&self, method: Method, path: &str, session_id: Option<&str>) -> RequestBuilder {
        let request = self
            .client
            .request(method, self.url(path))
            .header(API_KEY_HEADER, &self.api_key);
        match session_id {
            Some(session_id) => request.header(SESSION_HEADER, session_id),
            None => request,
        }
    }
}

/// Pass a successful response through, or convert a failure into
/// [`ApiError::Backend`] using `fallback` when the body carries no message.
///
/// # Errors
///
/// Returns [`ApiError::Backend`] for any non-2xx status.
pub async fn ensure_success(response: Response, fallback: &str) -> Result<Response, ApiError> {
    let status = response.status();
    if status.is_success() {
        return Ok(response);
    }
    let body = response.text().await.unwrap_or_default();
    Err(ApiError::Backend { status: status.as_u16(), message: backend_message(&body, fallback) })
}

/// Send a request, require success and decode the JSON body.
///
/// # Errors
///
/// Propagates transport failures, backend rejections and undecodable bodies.
pub async fn send_json<T: DeserializeOwned>(request: RequestBuilder, fallback: &str) -> Result<T, ApiError> {
    let response = ensure_success(request.send().await?, fallback).await?;
    Ok(response.json::<T>().await?)
}

/// Pick the backend's error text out of a JSON error body.
pub(crate) fn backend_message(body: &str, fallback: &str) -> String {
    serde_json::from_str::<Value>(body)
        .ok()
        .and_then(|value| {
            ["error", "message"]
                .iter()
                .find_map(|key| value.get(*key).and_then(Value::as_str).map(str::to_owned))
        })
        .filter(|message| !message.trim().is_empty())
        .unwrap_or_else(|| fallback.to_owned())
}
