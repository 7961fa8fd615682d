//! Anonymous session lifecycle.
//!
//! SYSTEM CONTEXT
//! ==============
//! The manager is the only writer of the persisted fingerprint and session.
//! The widget controller asks it for a session before anything else and hands
//! the resulting `session_id` to the realtime transport.
//!
//! DESIGN
//! ======
//! - A persisted, unexpired session is revalidated once with the backend and
//!   adopted on success. Any validation failure discards it and creates a new
//!   one; expired sessions skip validation entirely.
//! - The fingerprint is stored under its own key and outlives logout, so a
//!   returning device keeps the same identity across sessions.
//! - `update_user_info` persists only after the backend accepts the update.
//!
//! ERROR HANDLING
//! ==============
//! Backend failures propagate as [`SessionError::Api`] with the backend's
//! message. A persisted session that no longer decodes is removed and treated
//! as absent rather than failing the caller.

#[cfg(test)]
#[path = "manager_test.rs"]
mod manager_test;

use std::sync::{Arc, Mutex, MutexGuard, PoisonError};

use tracing::{debug, info, warn};

use super::api::{HttpSessionApi, SessionApi};
use super::fingerprint::{DigestAlgorithm, EnvironmentSignals, derive_fingerprint};
use super::storage::{FINGERPRINT_KEY, FileStore, KeyValueStore, LoadError, MemoryStore, SESSION_KEY, load_json, save_json};
use super::types::{AnonymousSession, CreateSessionRequest, SessionError, UserInfo};
use crate::config::{PageContext, WidgetConfig};
use crate::http::ApiClient;

pub struct SessionManager {
    api: Arc<dyn SessionApi>,
    store: Arc<dyn KeyValueStore>,
    signals: EnvironmentSignals,
    algorithm: DigestAlgorithm,
    page: PageContext,
    current: Mutex<Option<AnonymousSession>>,
}

impl SessionManager {
    /// Manager with process-detected signals and the preferred digest.
    pub fn new(api: Arc<dyn SessionApi>, store: Arc<dyn KeyValueStore>, page: PageContext) -> Self {
        Self {
            api,
            store,
            signals: EnvironmentSignals::detect(),
            algorithm: DigestAlgorithm::preferred(),
            page,
            current: Mutex::new(None),
        }
    }

    /// HTTP-backed manager; file-backed when `storage_dir` is set.
    ///
    /// # Errors
    ///
    /// Returns [`SessionError::Api`] for an unusable API base and
    /// [`SessionError::Storage`] when the storage directory cannot be created.
    pub fn from_config(config: &WidgetConfig) -> Result<Self, SessionError> {
        let api = Arc::new(HttpSessionApi::new(ApiClient::new(&config.api)?));
        let store: Arc<dyn KeyValueStore> = match &config.storage_dir {
            Some(dir) => Arc::new(FileStore::open(dir)?),
            None => Arc::new(MemoryStore::new()),
        };
        Ok(Self::new(api, store, config.page.clone()))
    }

    #[must_use]
    pub fn with_signals(mut self, signals: EnvironmentSignals) -> Self {
        self.signals = signals;
        self
    }

    #[must_use]
    pub fn with_algorithm(mut self, algorithm: DigestAlgorithm) -> Self {
        self.algorithm = algorithm;
        self
    }

    // =====================================================================
    // Lifecycle
    // =====================================================================

    /// Restore the persisted session or create a new one.
    ///
    /// # Errors
    ///
    /// Fails only when a new session has to be created and creation fails, or
    /// when the store itself is unusable.
    pub async fn get_or_create_session(&self) -> Result<AnonymousSession, SessionError> {
        if let Some(stored) = self.load_stored()? {
            if stored.is_expired() {
                debug!(session_id = %stored.session_id, "stored session expired");
            } else {
                match self.api.validate(&stored.session_id).await {
                    Ok(()) => {
                        debug!(session_id = %stored.session_id, "restored session");
                        *self.current() = Some(stored.clone());
                        return Ok(stored);
                    }
                    Err(e) => {
                        warn!(session_id = %stored.session_id, error = %e, "stored session rejected");
                    }
                }
            }
            self.store.remove(SESSION_KEY)?;
        }
        self.create_session().await
    }

    /// Exchange the device fingerprint and page context for a new session.
    ///
    /// # Errors
    ///
    /// Returns [`SessionError::Api`] carrying the backend's message (or
    /// "Failed to create session") when creation is rejected.
    pub async fn create_session(&self) -> Result<AnonymousSession, SessionError> {
        let fingerprint = self.fingerprint()?;
        let request = CreateSessionRequest {
            fingerprint: fingerprint.clone(),
            domain: self.page.domain.clone(),
            origin: self.page.origin.clone(),
            referrer: self.page.referrer.clone(),
        };
        let session = self.api.create(&request).await?.into_session(fingerprint);
        save_json(self.store.as_ref(), SESSION_KEY, &session)?;
        info!(session_id = %session.session_id, "anonymous session created");
        *self.current() = Some(session.clone());
        Ok(session)
    }

    /// Send a partial profile update, then merge it into the session.
    ///
    /// # Errors
    ///
    /// Returns [`SessionError::NoSession`] without contacting the backend
    /// when no session is established, and [`SessionError::Api`] when the
    /// backend rejects the update. Nothing is persisted on failure.
    pub async fn update_user_info(&self, info: &UserInfo) -> Result<AnonymousSession, SessionError> {
        let mut session = self.current_session().ok_or(SessionError::NoSession)?;
        self.api.update(&session.session_id, info).await?;
        session.merge(info);
        save_json(self.store.as_ref(), SESSION_KEY, &session)?;
        *self.current() = Some(session.clone());
        Ok(session)
    }

    /// Forget the session locally and in the store. The fingerprint stays.
    ///
    /// # Errors
    ///
    /// Returns [`SessionError::Storage`] when the store cannot be written.
    pub fn clear_session(&self) -> Result<(), SessionError> {
        *self.current() = None;
        self.store.remove(SESSION_KEY)?;
        Ok(())
    }

    #[must_use]
    pub fn current_session(&self) -> Option<AnonymousSession> {
        self.current().clone()
    }

    #[must_use]
    pub fn session_id(&self) -> Option<String> {
        self.current().as_ref().map(|s| s.session_id.clone())
    }

    /// Persisted fingerprint, derived and stored on first use.
    ///
    /// # Errors
    ///
    /// Returns [`SessionError::Storage`] when the store fails.
    pub fn fingerprint(&self) -> Result<String, SessionError> {
        if let Some(existing) = self.store.get(FINGERPRINT_KEY)?.filter(|v| !v.is_empty()) {
            return Ok(existing);
        }
        let fingerprint = derive_fingerprint(&self.signals, self.algorithm);
        self.store.set(FINGERPRINT_KEY, &fingerprint)?;
        Ok(fingerprint)
    }

    // =====================================================================
    // Internals
    // =====================================================================

    fn load_stored(&self) -> Result<Option<AnonymousSession>, SessionError> {
        match load_json::<AnonymousSession>(self.store.as_ref(), SESSION_KEY) {
            Ok(stored) => Ok(stored),
            Err(LoadError::Corrupt(e)) => {
                warn!(error = %e, "discarding unreadable stored session");
                self.store.remove(SESSION_KEY)?;
                Ok(None)
            }
            Err(LoadError::Storage(e)) => Err(e.into()),
        }
    }

    fn current(&self) -> MutexGuard<'_, Option<AnonymousSession>> {
        self.current.lock().unwrap_or_else(PoisonError::into_inner)
    }
}
