//! Backend calls of the session lifecycle.

#[cfg(test)]
#[path = "api_test.rs"]
mod api_test;

use async_trait::async_trait;
use reqwest::Method;

use super::types::{CreateSessionRequest, CreatedSession, UserInfo};
use crate::http::{ApiClient, ApiError, ensure_success, send_json};

/// Session endpoints the manager depends on.
#[async_trait]
pub trait SessionApi: Send + Sync {
    /// # Errors
    ///
    /// Returns [`ApiError`] on transport failure or backend rejection.
    async fn create(&self, request: &CreateSessionRequest) -> Result<CreatedSession, ApiError>;

    /// `Ok(())` means the backend still accepts `session_id`.
    ///
    /// # Errors
    ///
    /// Returns [`ApiError`] on transport failure or backend rejection.
    async fn validate(&self, session_id: &str) -> Result<(), ApiError>;

    /// # Errors
    ///
    /// Returns [`ApiError`] on transport failure or backend rejection.
    async fn update(&self, session_id: &str, info: &UserInfo) -> Result<(), ApiError>;
}

/// [`SessionApi`] over `{apiBase}/widget/session`.
#[derive(Clone, Debug)]
pub struct HttpSessionApi {
    client: ApiClient,
}

impl HttpSessionApi {
    #[must_use]
    pub fn new(client: ApiClient) -> Self {
        Self { client }
    }
}

#[async_trait]
impl SessionApi for HttpSessionApi {
    async fn create(&self, request: &CreateSessionRequest) -> Result<CreatedSession, ApiError> {
        let builder = self.client.request(Method::POST, "/widget/session", None).json(request);
        send_json(builder, "Failed to create session").await
    }

    async fn validate(&self, session_id: &str) -> Result<(), ApiError> {
        let response = self
            .client
            .request(Method::POST, "/widget/session/validate", Some(session_id))
            .send()
            .await?;
        ensure_success(response, "Session is no longer valid").await?;
        Ok(())
    }

    async fn update(&self, session_id: &str, info: &UserInfo) -> Result<(), ApiError> {
        let response = self
            .client
            .request(Method::PATCH, "/widget/session", Some(session_id))
            .json(info)
            .send()
            .await?;
        ensure_success(response, "Failed to update user info").await?;
        Ok(())
    }
}
