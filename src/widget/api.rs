//! Conversation endpoints used by the widget controller.

#[cfg(test)]
#[path = "api_test.rs"]
mod api_test;

use async_trait::async_trait;
use envelopes::ChatMessage;
use reqwest::Method;
use serde::Deserialize;
use serde_json::json;

use super::state::{ConversationSummary, DirectoryUser};
use crate::http::{ApiClient, ApiError, ensure_success, send_json};

#[async_trait]
pub trait ConversationApi: Send + Sync {
    /// # Errors
    ///
    /// Returns [`ApiError`] on transport failure or backend rejection.
    async fn search_users(&self, session_id: &str, query: &str) -> Result<Vec<DirectoryUser>, ApiError>;

    /// # Errors
    ///
    /// Returns [`ApiError`] on transport failure or backend rejection.
    async fn list_conversations(&self, session_id: &str) -> Result<Vec<ConversationSummary>, ApiError>;

    /// Open (or reuse) a conversation with `user_id`.
    ///
    /// # Errors
    ///
    /// Returns [`ApiError`] on transport failure or backend rejection.
    async fn start_conversation(&self, session_id: &str, user_id: &str) -> Result<ConversationSummary, ApiError>;

    /// # Errors
    ///
    /// Returns [`ApiError`] on transport failure or backend rejection.
    async fn list_messages(&self, session_id: &str, conversation_id: &str) -> Result<Vec<ChatMessage>, ApiError>;

    /// # Errors
    ///
    /// Returns [`ApiError`] on transport failure or backend rejection.
    async fn send_message(
        &self,
        session_id: &str,
        conversation_id: &str,
        content: &str,
    ) -> Result<ChatMessage, ApiError>;

    /// # Errors
    ///
    /// Returns [`ApiError`] on transport failure or backend rejection.
    async fn mark_read(&self, session_id: &str, conversation_id: &str) -> Result<(), ApiError>;
}

#[derive(Deserialize)]
struct UsersBody {
    #[serde(default)]
    users: Vec<DirectoryUser>,
}

#[derive(Deserialize)]
struct ConversationsBody {
    #[serde(default)]
    conversations: Vec<ConversationSummary>,
}

#[derive(Deserialize)]
struct ConversationBody {
    conversation: ConversationSummary,
}

#[derive(Deserialize)]
struct MessagesBody {
    #[serde(default)]
    messages: Vec<ChatMessage>,
}

#[derive(Deserialize)]
struct MessageBody {
    message: ChatMessage,
}

/// [`ConversationApi`] over `{apiBase}/widget/...`.
#[derive(Clone, Debug)]
pub struct HttpConversationApi {
    client: ApiClient,
}

impl HttpConversationApi {
    #[must_use]
    pub fn new(client: ApiClient) -> Self {
        Self { client }
    }
}

#[async_trait]
impl ConversationApi for HttpConversationApi {
    async fn search_users(&self, session_id: &str, query: &str) -> Result<Vec<DirectoryUser>, ApiError> {
        let request = self
            .client
            .request(Method::GET, "/widget/users/search", Some(session_id))
            .query(&[("q", query)]);
        let body: UsersBody = send_json(request, "Search failed").await?;
        Ok(body.users)
    }

    async fn list_conversations(&self, session_id: &str) -> Result<Vec<ConversationSummary>, ApiError> {
        let request = self.client.request(Method::GET, "/widget/conversations", Some(session_id));
        let body: ConversationsBody = send_json(request, "Failed to load conversations").await?;
        Ok(body.conversations)
    }

    async fn start_conversation(&self, session_id: &str, user_id: &str) -> Result<ConversationSummary, ApiError> {
        let request = self
            .client
            .request(Method::POST, "/widget/conversations", Some(session_id))
            .json(&json!({ "userId": user_id }));
        let body: ConversationBody = send_json(request, "Failed to start conversation").await?;
        Ok(body.conversation)
    }

    async fn list_messages(&self, session_id: &str, conversation_id: &str) -> Result<Vec<ChatMessage>, ApiError> {
        let path = format!("/widget/conversations/{conversation_id}/messages");
        let request = self.client.request(Method::GET, &path, Some(session_id));
        let body: MessagesBody = send_json(request, "Failed to load messages").await?;
        Ok(body.messages)
    }

    async fn send_message(
        &self,
        session_id: &str,
        conversation_id: &str,
        content: &str,
    ) -> Result<ChatMessage, ApiError> {
        let path = format!("/widget/conversations/{conversation_id}/messages");
        let request = self
            .client
            .request(Method::POST, &path, Some(session_id))
            .json(&json!({ "content": content }));
        let body: MessageBody = send_json(request, "Failed to send message").await?;
        Ok(body.message)
    }

    async fn mark_read(&self, session_id: &str, conversation_id: &str) -> Result<(), ApiError> {
        let path = format!("/widget/conversations/{conversation_id}/read");
        let response = self.client.request(Method::POST, &path, Some(session_id)).send().await?;
        ensure_success(response, "Failed to mark conversation read").await?;
        Ok(())
    }
}
