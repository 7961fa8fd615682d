//! Polling fallback seam and its HTTP implementation.

#[cfg(test)]
#[path = "poll_test.rs"]
mod poll_test;

use async_trait::async_trait;
use envelopes::ChatMessage;
use reqwest::Method;
use serde::Deserialize;

use super::types::TransportError;
use crate::http::{ApiClient, send_json};

/// Fetches messages newer than a cursor for one conversation.
#[async_trait]
pub trait MessagePoller: Send + Sync {
    /// Messages after `after`, oldest first. `None` asks for the backend's
    /// default window.
    ///
    /// # Errors
    ///
    /// Returns [`TransportError`] on any request failure.
    async fn poll(
        &self,
        session_id: &str,
        conversation_id: &str,
        after: Option<&str>,
    ) -> Result<Vec<ChatMessage>, TransportError>;
}

#[derive(Deserialize)]
struct PollResponse {
    #[serde(default)]
    messages: Vec<ChatMessage>,
}

/// [`MessagePoller`] over `GET /widget/conversations/{id}/messages/poll`.
#[derive(Debug, Clone)]
pub struct HttpPoller {
    client: ApiClient,
}

impl HttpPoller {
    #[must_use]
    pub fn new(client: ApiClient) -> Self {
        Self { client }
    }
}

#[async_trait]
impl MessagePoller for HttpPoller {
    async fn poll(
        &self,
        session_id: &str,
        conversation_id: &str,
        after: Option<&str>,
    ) -> Result<Vec<ChatMessage>, TransportError> {
        let path = format!("/widget/conversations/{conversation_id}/messages/poll");
        let mut request = self.client.request(Method::GET, &path, Some(session_id));
        if let Some(after) = after {
            request = request.query(&[("after", after)]);
        }
        let body: PollResponse = send_json(request, "Failed to poll messages").await?;
        Ok(body.messages)
    }
}
