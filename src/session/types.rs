//! Anonymous visitor identity and the errors raised while managing it.

use serde::{Deserialize, Serialize};
use serde_json::{Map, Value};
use time::OffsetDateTime;

use super::storage::{LoadError, StorageError};
use crate::http::ApiError;

#[derive(Debug, thiserror::Error)]
pub enum SessionError {
    /// An operation that needs an established session ran without one.
    #[error("no active session")]
    NoSession,
    #[error(transparent)]
    Api(#[from] ApiError),
    #[error("session storage failed: {0}")]
    Storage(#[from] StorageError),
    #[error("session serialization failed: {0}")]
    Serialize(#[from] serde_json::Error),
}

impl From<LoadError> for SessionError {
    fn from(err: LoadError) -> Self {
        match err {
            LoadError::Storage(e) => Self::Storage(e),
            LoadError::Corrupt(e) => Self::Serialize(e),
        }
    }
}

/// A visitor identity that is not backed by credentials.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
#[serde(rename_all = "camelCase")]
pub struct AnonymousSession {
    pub session_id: String,
    pub fingerprint: String,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub name: Option<String>,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub email: Option<String>,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub phone: Option<String>,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub metadata: Option<Map<String, Value>>,
    #[serde(with = "time::serde::rfc3339")]
    pub created_at: OffsetDateTime,
    #[serde(default, with = "time::serde::rfc3339::option", skip_serializing_if = "Option::is_none")]
    pub expires_at: Option<OffsetDateTime>,
}

impl AnonymousSession {
    /// Whether the session is past `expires_at` at `now`.
    ///
    /// A session without `expires_at` never expires client-side; the backend
    /// stays the source of truth through revalidation.
    #[must_use]
    pub fn is_expired_at(&self, now: OffsetDateTime) -> bool {
        self.expires_at.is_some_and(|expires_at| now > expires_at)
    }

    #[must_use]
    pub fn is_expired(&self) -> bool {
        self.is_expired_at(OffsetDateTime::now_utc())
    }

    #[must_use]
    pub fn has_name(&self) -> bool {
        self.name.as_deref().is_some_and(|name| !name.trim().is_empty())
    }

    #[must_use]
    pub fn has_email(&self) -> bool {
        self.email.as_deref().is_some_and(|email| !email.trim().is_empty())
    }

    /// Overlay the fields present in `info` onto this session.
    pub fn merge(&mut self, info: &UserInfo) {
        if let Some(name) = &info.name {
            self.name = Some(name.clone());
        }
        if let Some(email) = &info.email {
            self.email = Some(email.clone());
        }
        if let Some(phone) = &info.phone {
            self.phone = Some(phone.clone());
        }
        if let Some(metadata) = &info.metadata {
            let merged = self.metadata.get_or_insert_with(Map::new);
            for (key, value) in metadata {
                merged.insert(key.clone(), value.clone());
            }
        }
    }
}

/// Partial visitor details collected by the pre-chat form.
#[derive(Debug, Clone, Default, PartialEq, Serialize, Deserialize)]
#[serde(rename_all = "camelCase")]
pub struct UserInfo {
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub name: Option<String>,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub email: Option<String>,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub phone: Option<String>,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub metadata: Option<Map<String, Value>>,
}

impl UserInfo {
    #[must_use]
    pub fn is_empty(&self) -> bool {
        self.name.is_none() && self.email.is_none() && self.phone.is_none() && self.metadata.is_none()
    }
}

/// Body of `POST /widget/session`.
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "camelCase")]
pub struct CreateSessionRequest {
    pub fingerprint: String,
    pub domain: String,
    pub origin: String,
    pub referrer: String,
}

/// Response of `POST /widget/session`.
#[derive(Debug, Clone, PartialEq, Deserialize)]
#[serde(rename_all = "camelCase")]
pub struct CreatedSession {
    pub session_id: String,
    #[serde(default)]
    pub name: Option<String>,
    #[serde(default)]
    pub email: Option<String>,
    #[serde(default, with = "time::serde::rfc3339::option")]
    pub created_at: Option<OffsetDateTime>,
    #[serde(default, with = "time::serde::rfc3339::option")]
    pub expires_at: Option<OffsetDateTime>,
}

impl CreatedSession {
    /// Attach the fingerprint the session was created for.
    #[must_use]
    pub fn into_session(self, fingerprint: String) -> AnonymousSession {
        AnonymousSession {
            session_id: self.session_id,
            fingerprint,
            name: self.name,
            email: self.email,
            phone: None,
            metadata: None,
            created_at: self.created_at.unwrap_or_else(OffsetDateTime::now_utc),
            expires_at: self.expires_at,
        }
    }
}
